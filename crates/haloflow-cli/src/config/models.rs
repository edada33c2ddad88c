use haloflow::engine::config::{CommunicatorConfig, RigidNhConfig};
use nalgebra::Vector3;

/// Initial body lattice of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct LatticeSpec {
    pub counts: [usize; 3],
    pub spacing: f64,
    pub mass: f64,
    pub inertia: Vector3<f64>,
    /// Thermal energy `k_B T` of the initial velocities.
    pub thermal_energy: f64,
    pub seed: u64,
    pub chain_length: usize,
    pub periodic: [bool; 3],
    pub two_dimensional: bool,
}

impl LatticeSpec {
    pub fn len(&self) -> usize {
        self.counts.iter().product()
    }

    pub fn box_lengths(&self) -> Vector3<f64> {
        Vector3::new(
            self.counts[0] as f64 * self.spacing,
            self.counts[1] as f64 * self.spacing,
            self.counts[2] as f64 * self.spacing,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForceSpec {
    pub bond_k: f64,
    pub bond_r0: f64,
    pub repulsion_epsilon: f64,
    pub repulsion_cutoff: f64,
}

/// Fully resolved run configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub lattice: LatticeSpec,
    pub grid: [usize; 3],
    pub comm: CommunicatorConfig,
    pub integrator: RigidNhConfig,
    pub forces: ForceSpec,
    pub steps: u64,
    pub sample_every: u64,
}
