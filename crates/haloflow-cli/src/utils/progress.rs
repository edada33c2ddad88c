use haloflow::engine::progress::{Progress, ProgressCallback};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressState, ProgressStyle};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

const SPINNER_TICK_MS: u64 = 80;

/// Renders the progress events of the reporting rank as a spinner or step bar on stderr.
#[derive(Clone)]
pub struct CliProgressHandler {
    pb: Arc<Mutex<ProgressBar>>,
}

impl CliProgressHandler {
    pub fn new() -> Self {
        let pb = ProgressBar::new(0)
            .with_style(Self::spinner_style())
            .with_message("Initializing...");
        pb.set_draw_target(ProgressDrawTarget::stderr());
        pb.finish_and_clear();

        Self {
            pb: Arc::new(Mutex::new(pb)),
        }
    }

    pub fn get_callback(&self) -> ProgressCallback<'static> {
        let pb = Arc::clone(&self.pb);
        Box::new(move |progress: Progress| match pb.lock() {
            Ok(pb) => render(&pb, progress),
            Err(_) => warn!("Progress bar mutex was poisoned. Cannot update progress."),
        })
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::with_template("{msg:<20} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .with_key(
                "eta",
                |state: &ProgressState, w: &mut dyn std::fmt::Write| {
                    let _ = write!(w, "{:.1}s", state.eta().as_secs_f64());
                },
            )
            .progress_chars("##-")
    }
}

/// Applies one workflow event to the bar.
fn render(pb: &ProgressBar, progress: Progress) {
    match progress {
        Progress::PhaseStart { name } => {
            pb.reset();
            pb.set_length(0);
            pb.set_style(CliProgressHandler::spinner_style());
            pb.enable_steady_tick(Duration::from_millis(SPINNER_TICK_MS));
            pb.set_message(name);
        }
        Progress::PhaseFinish => {
            pb.disable_steady_tick();
            pb.finish_with_message("✓ Done");
        }
        Progress::TaskStart { total_steps } => {
            pb.disable_steady_tick();
            pb.reset();
            pb.set_style(CliProgressHandler::bar_style());
            pb.set_length(total_steps);
        }
        Progress::TaskIncrement => pb.inc(1),
        Progress::TaskFinish => {
            if let Some(len) = pb.length() {
                pb.set_position(len);
            }
            pb.finish();
        }
        Progress::Sample(sample) => pb.set_message(format!(
            "T={:.3} P={:.3}",
            sample.temperature, sample.pressure
        )),
        Progress::Message(msg) if pb.is_finished() => pb.set_message(msg),
        Progress::Message(msg) => pb.println(format!("  {}", msg)),
    }
}

impl Default for CliProgressHandler {
    fn default() -> Self {
        Self::new()
    }
}
