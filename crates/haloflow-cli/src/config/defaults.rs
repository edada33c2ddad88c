/// Values used when neither the config file nor the command line sets a parameter.
#[derive(Debug, Clone)]
pub struct DefaultsConfig {
    pub lattice: [usize; 3],
    pub spacing: f64,
    pub mass: f64,
    pub inertia: [f64; 3],
    pub temperature: f64,
    pub seed: u64,
    pub chain_length: usize,
    pub grid: [usize; 3],
    pub max_stages: u32,
    pub ghost_width: f64,
    pub bond_k: f64,
    pub bond_r0: f64,
    pub repulsion_epsilon: f64,
    pub repulsion_cutoff: f64,
    pub steps: u64,
    pub sample_every: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            lattice: [4, 4, 4],
            spacing: 1.2,
            mass: 1.0,
            inertia: [0.4, 0.4, 0.4],
            temperature: 1.0,
            seed: 42,
            chain_length: 1,
            grid: [1, 1, 1],
            max_stages: 1,
            ghost_width: 1.6,
            bond_k: 10.0,
            bond_r0: 1.2,
            repulsion_epsilon: 1.0,
            repulsion_cutoff: 1.0,
            steps: 1000,
            sample_every: 100,
        }
    }
}
