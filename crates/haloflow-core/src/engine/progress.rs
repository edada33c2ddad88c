use super::thermo::ThermoSample;

/// Events emitted by the workflows while they run.
#[derive(Debug, Clone)]
pub enum Progress {
    PhaseStart { name: &'static str },
    PhaseFinish,

    TaskStart { total_steps: u64 },
    TaskIncrement,
    TaskFinish,

    /// Thermodynamic state after a completed step, reduced over all ranks.
    Sample(ThermoSample),
    /// Migration or ghost counts worth surfacing, already formatted.
    Message(String),
}

pub type ProgressCallback<'a> = Box<dyn Fn(Progress) + Send + Sync + 'a>;

/// Forwards [`Progress`] events to an optional callback.
///
/// In a multi-rank run every rank executes the same workflow; a reporter built with
/// [`ProgressReporter::silent`] lets all but one rank stay quiet.
#[derive(Default)]
pub struct ProgressReporter<'a> {
    callback: Option<ProgressCallback<'a>>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn silent() -> Self {
        Self { callback: None }
    }

    pub fn with_callback(callback: ProgressCallback<'a>) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    pub fn is_active(&self) -> bool {
        self.callback.is_some()
    }

    #[inline]
    pub fn report(&self, event: Progress) {
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn callback_receives_events_in_order() {
        let seen = Mutex::new(Vec::new());
        let reporter = ProgressReporter::with_callback(Box::new(|event| {
            let label = match event {
                Progress::PhaseStart { name } => name.to_string(),
                Progress::TaskStart { total_steps } => format!("start {}", total_steps),
                Progress::TaskIncrement => "tick".to_string(),
                _ => "other".to_string(),
            };
            seen.lock().unwrap().push(label);
        }));
        reporter.report(Progress::PhaseStart { name: "Setup" });
        reporter.report(Progress::TaskStart { total_steps: 3 });
        reporter.report(Progress::TaskIncrement);
        reporter.report(Progress::PhaseFinish);
        drop(reporter);
        assert_eq!(
            seen.into_inner().unwrap(),
            vec!["Setup", "start 3", "tick", "other"]
        );
    }

    #[test]
    fn silent_reporter_drops_everything() {
        let reporter = ProgressReporter::silent();
        assert!(!reporter.is_active());
        reporter.report(Progress::Message("ignored".into()));
    }
}
