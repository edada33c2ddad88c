use crate::error::{CliError, Result};
use haloflow::core::variant::Variant;
use haloflow::engine::config::{CouplingMode, Ensemble};
use nalgebra::Matrix3;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub system: Option<FileSystemConfig>,
    pub decomposition: Option<FileDecompositionConfig>,
    pub integrator: Option<FileIntegratorConfig>,
    pub forces: Option<FileForcesConfig>,
    pub run: Option<FileRunConfig>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileSystemConfig {
    /// Bodies per axis of the initial simple-cubic lattice.
    pub lattice: Option<[usize; 3]>,
    pub spacing: Option<f64>,
    pub mass: Option<f64>,
    /// Principal moments of inertia of every body.
    pub inertia: Option<[f64; 3]>,
    /// Temperature of the initial velocities.
    pub temperature: Option<f64>,
    pub seed: Option<u64>,
    /// Bodies per bonded chain; 1 leaves the bodies unbonded.
    pub chain_length: Option<usize>,
    pub periodic: Option<[bool; 3]>,
    pub two_dimensional: Option<bool>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileDecompositionConfig {
    pub grid: Option<[usize; 3]>,
    pub max_stages: Option<u32>,
    pub ghost_width: Option<f64>,
    pub resize_factor: Option<f64>,
    pub buffer_hard_cap: Option<usize>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileCoupling {
    None,
    Xy,
    Xz,
    Yz,
    Xyz,
}

impl From<FileCoupling> for CouplingMode {
    fn from(c: FileCoupling) -> Self {
        match c {
            FileCoupling::None => CouplingMode::None,
            FileCoupling::Xy => CouplingMode::Xy,
            FileCoupling::Xz => CouplingMode::Xz,
            FileCoupling::Yz => CouplingMode::Yz,
            FileCoupling::Xyz => CouplingMode::Xyz,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileIntegratorConfig {
    pub ensemble: Option<Ensemble>,
    pub dt: Option<f64>,
    pub tau: Option<f64>,
    pub tau_p: Option<f64>,
    pub temperature: Option<Variant>,
    pub pressure: Option<Variant>,
    pub coupling: Option<FileCoupling>,
    /// Row-major custom coupling weights; takes precedence over `coupling`.
    pub coupling_matrix: Option<[[f64; 3]; 3]>,
    pub flags: Option<[bool; 3]>,
    pub tchain: Option<usize>,
    pub pchain: Option<usize>,
    pub iter: Option<usize>,
    pub boltzmann: Option<f64>,
}

impl FileIntegratorConfig {
    pub fn coupling_mode(&self) -> Option<CouplingMode> {
        match (&self.coupling_matrix, self.coupling) {
            (Some(rows), _) => Some(CouplingMode::Custom(Matrix3::from_fn(|i, j| rows[i][j]))),
            (None, Some(c)) => Some(c.into()),
            (None, None) => None,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileForcesConfig {
    pub bond_k: Option<f64>,
    pub bond_r0: Option<f64>,
    pub repulsion_epsilon: Option<f64>,
    pub repulsion_cutoff: Option<f64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileRunConfig {
    pub steps: Option<u64>,
    pub sample_every: Option<u64>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Reading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_complete_file() {
        let text = r#"
            [system]
            lattice = [4, 4, 2]
            spacing = 1.1
            chain-length = 4

            [decomposition]
            grid = [2, 1, 1]
            ghost-width = 1.5

            [integrator]
            ensemble = "npt"
            dt = 0.002
            tau = 0.5
            tau-p = 2.0
            temperature = [[0, 1.0], [1000, 1.5]]
            pressure = 0.2
            coupling = "xy"

            [run]
            sample-every = 10
        "#;
        let config: FileConfig = toml::from_str(text).unwrap();
        let system = config.system.unwrap();
        assert_eq!(system.lattice, Some([4, 4, 2]));
        assert_eq!(system.chain_length, Some(4));

        let integrator = config.integrator.unwrap();
        assert_eq!(integrator.ensemble, Some(Ensemble::Npt));
        assert_eq!(
            integrator.temperature,
            Some(Variant::Linear(vec![(0, 1.0), (1000, 1.5)]))
        );
        assert_eq!(integrator.coupling_mode(), Some(CouplingMode::Xy));
        assert_eq!(config.run.unwrap().sample_every, Some(10));
    }

    #[test]
    fn coupling_matrix_overrides_named_coupling() {
        let text = r#"
            coupling = "none"
            coupling-matrix = [[1.0, 1.0, 0.0], [1.0, 1.0, 0.0], [0.0, 0.0, 1.0]]
        "#;
        let integrator: FileIntegratorConfig = toml::from_str(text).unwrap();
        let Some(CouplingMode::Custom(m)) = integrator.coupling_mode() else {
            panic!("expected a custom coupling");
        };
        assert_eq!(m[(0, 1)], 1.0);
        assert_eq!(m[(2, 0)], 0.0);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = r#"
            [decomposition]
            grid = [1, 1, 1]
            max-stage = 2
        "#;
        assert!(toml::from_str::<FileConfig>(text).is_err());
    }

    #[test]
    fn unreadable_file_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[system\nlattice = 3").unwrap();
        let err = FileConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, CliError::FileParsing { .. }));
        assert!(err.to_string().contains("broken.toml"));
    }
}
