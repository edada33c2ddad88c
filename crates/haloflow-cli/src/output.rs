use crate::error::{CliError, Result};
use haloflow::engine::integrator::IntegratorVariables;
use haloflow::engine::thermo::ThermoSample;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Integrator state saved at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestep: u64,
    pub integrator: IntegratorVariables,
}

pub fn write_thermo_log(path: &Path, samples: &[ThermoSample]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for sample in samples {
        writer.serialize(sample)?;
    }
    writer.flush()?;
    info!(rows = samples.len(), "Thermo log written to {}", path.display());
    Ok(())
}

pub fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let text = toml::to_string(checkpoint).map_err(|e| CliError::Other(e.into()))?;
    std::fs::write(path, text)?;
    info!(timestep = checkpoint.timestep, "Checkpoint written to {}", path.display());
    Ok(())
}

pub fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    let text = std::fs::read_to_string(path)?;
    toml::from_str(&text).map_err(|e| CliError::FileParsing {
        path: path.to_path_buf(),
        source: e.into(),
    })
}
