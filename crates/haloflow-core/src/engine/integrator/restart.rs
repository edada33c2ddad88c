use phf::{Map, phf_map};
use serde::{Deserialize, Serialize};

/// Slot names of every persisted integrator record, in storage order.
static RESTART_LAYOUTS: Map<&'static str, &'static [&'static str]> = phf_map! {
    "npt_rigid" => &[
        "eta_t0", "eta_r0", "eta_b0",
        "eta_dot_r0", "eta_dot_t0", "eta_dot_b0",
        "f_eta_r0", "f_eta_t0", "f_eta_b0",
    ],
    "nph_rigid" => &["eta_b0", "eta_dot_b0", "f_eta_b0"],
};

/// Ordered extended-system scalars of an integrator, tagged with the record name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegratorVariables {
    pub kind: String,
    pub values: Vec<f64>,
}

impl IntegratorVariables {
    /// A zeroed record of the layout registered under `kind`.
    pub fn zeroed(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            values: vec![0.0; expected_len(kind).unwrap_or(0)],
        }
    }

    /// The value stored under `slot`, if the record has that slot.
    pub fn get(&self, slot: &str) -> Option<f64> {
        let position = layout(&self.kind)?.iter().position(|&name| name == slot)?;
        self.values.get(position).copied()
    }
}

pub fn layout(kind: &str) -> Option<&'static [&'static str]> {
    RESTART_LAYOUTS.get(kind).copied()
}

pub fn expected_len(kind: &str) -> Option<usize> {
    layout(kind).map(<[_]>::len)
}

/// `true` if `variables` is a complete record of `kind`.
pub fn is_valid_restart(variables: &IntegratorVariables, kind: &str) -> bool {
    variables.kind == kind && expected_len(kind) == Some(variables.values.len())
}
