use super::defaults::DefaultsConfig;
use super::file::{FileConfig, FileCoupling};
use super::models::{AppConfig, ForceSpec, LatticeSpec};
use crate::error::{CliError, Result};
use haloflow::core::variant::Variant;
use haloflow::engine::config::{CommunicatorConfigBuilder, Ensemble, RigidNhConfigBuilder};
use nalgebra::Vector3;
use serde::Deserialize;
use serde::de::IntoDeserializer;
use std::path::Path;
use std::str::FromStr;

/// Command-line flags that take precedence over the config file.
#[derive(Debug, Clone, Copy, Default)]
pub struct CliOverrides {
    pub steps: Option<u64>,
    pub max_stages: Option<u32>,
}

pub fn build_config(
    path: &Path,
    set_values: &[String],
    overrides: CliOverrides,
) -> Result<AppConfig> {
    let file_config = FileConfig::from_file(path)?;
    let file_config = apply_set_values(file_config, set_values)?;
    resolve(file_config, overrides)
}

fn resolve(mut file_config: FileConfig, overrides: CliOverrides) -> Result<AppConfig> {
    let defaults = DefaultsConfig::default();

    let integrator_file = file_config.integrator.take().unwrap_or_default();
    let mut integrator = RigidNhConfigBuilder::new();
    if let Some(ensemble) = integrator_file.ensemble {
        integrator = integrator.ensemble(ensemble);
    }
    if let Some(dt) = integrator_file.dt {
        integrator = integrator.dt(dt);
    }
    if let Some(tau) = integrator_file.tau {
        integrator = integrator.tau(tau);
    }
    if let Some(tau_p) = integrator_file.tau_p {
        integrator = integrator.tau_p(tau_p);
    }
    if let Some(temperature) = integrator_file.temperature.clone() {
        integrator = integrator.temperature(temperature);
    }
    if let Some(pressure) = integrator_file.pressure.clone() {
        integrator = integrator.pressure(pressure);
    }
    if let Some(coupling) = integrator_file.coupling_mode() {
        integrator = integrator.coupling(coupling);
    }
    if let Some(flags) = integrator_file.flags {
        integrator = integrator.flags(flags);
    }
    if let Some(n) = integrator_file.tchain {
        integrator = integrator.tchain(n);
    }
    if let Some(n) = integrator_file.pchain {
        integrator = integrator.pchain(n);
    }
    if let Some(n) = integrator_file.iter {
        integrator = integrator.iter(n);
    }
    if let Some(k) = integrator_file.boltzmann {
        integrator = integrator.boltzmann(k);
    }
    let integrator = integrator
        .build()
        .map_err(|e| CliError::Config(e.to_string()))?;

    let system_file = file_config.system.take().unwrap_or_default();
    let two_dimensional = system_file.two_dimensional.unwrap_or(false);
    let mut counts = system_file.lattice.unwrap_or(defaults.lattice);
    if two_dimensional {
        counts[2] = 1;
    }
    if counts.contains(&0) {
        return Err(CliError::Config(format!(
            "Lattice counts must be positive, got {:?}",
            counts
        )));
    }
    let spacing = system_file.spacing.unwrap_or(defaults.spacing);
    if !(spacing > 0.0) {
        return Err(CliError::Config(format!(
            "Lattice spacing must be positive, got {}",
            spacing
        )));
    }
    let temperature = system_file.temperature.unwrap_or_else(|| {
        integrator_file
            .temperature
            .as_ref()
            .map_or(defaults.temperature, |t| t.value(0))
    });
    let mut periodic = system_file.periodic.unwrap_or([true; 3]);
    if two_dimensional {
        periodic[2] = false;
    }
    let lattice = LatticeSpec {
        counts,
        spacing,
        mass: system_file.mass.unwrap_or(defaults.mass),
        inertia: Vector3::from(system_file.inertia.unwrap_or(defaults.inertia)),
        thermal_energy: integrator.boltzmann * temperature,
        seed: system_file.seed.unwrap_or(defaults.seed),
        chain_length: system_file.chain_length.unwrap_or(defaults.chain_length).max(1),
        periodic,
        two_dimensional,
    };

    let decomposition_file = file_config.decomposition.take().unwrap_or_default();
    let grid = decomposition_file.grid.unwrap_or(defaults.grid);
    if two_dimensional && grid[2] != 1 {
        return Err(CliError::Config(
            "A two-dimensional system cannot be decomposed along z".to_string(),
        ));
    }
    let mut comm = CommunicatorConfigBuilder::new()
        .max_stages(
            overrides
                .max_stages
                .or(decomposition_file.max_stages)
                .unwrap_or(defaults.max_stages),
        )
        .ghost_width(decomposition_file.ghost_width.unwrap_or(defaults.ghost_width));
    if let Some(factor) = decomposition_file.resize_factor {
        comm = comm.resize_factor(factor);
    }
    if let Some(cap) = decomposition_file.buffer_hard_cap {
        comm = comm.buffer_hard_cap(cap);
    }
    let comm = comm.build().map_err(|e| CliError::Config(e.to_string()))?;

    let forces_file = file_config.forces.take().unwrap_or_default();
    let forces = ForceSpec {
        bond_k: forces_file.bond_k.unwrap_or(defaults.bond_k),
        bond_r0: forces_file.bond_r0.unwrap_or(defaults.bond_r0),
        repulsion_epsilon: forces_file
            .repulsion_epsilon
            .unwrap_or(defaults.repulsion_epsilon),
        repulsion_cutoff: forces_file
            .repulsion_cutoff
            .unwrap_or(defaults.repulsion_cutoff),
    };

    let run_file = file_config.run.take().unwrap_or_default();
    Ok(AppConfig {
        lattice,
        grid,
        comm,
        integrator,
        forces,
        steps: overrides.steps.or(run_file.steps).unwrap_or(defaults.steps),
        sample_every: run_file.sample_every.unwrap_or(defaults.sample_every),
    })
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CliError::Config(format!("Invalid value for {}: {}", key, value)))
}

fn parse_keyword<'de, T: Deserialize<'de>>(key: &str, value: &'de str) -> Result<T> {
    T::deserialize(value.into_deserializer())
        .map_err(|e: serde::de::value::Error| {
            CliError::Config(format!("Invalid value for {}: {}", key, e))
        })
}

fn apply_set_values(mut config: FileConfig, set_values: &[String]) -> Result<FileConfig> {
    for kv_pair in set_values {
        let Some((key, value)) = kv_pair.split_once('=') else {
            return Err(CliError::Config(format!(
                "Invalid --set format: '{}'. Expected KEY=VALUE.",
                kv_pair
            )));
        };
        let (key, value) = (key.trim(), value.trim());
        let Some((section, _)) = key.split_once('.') else {
            return Err(CliError::Config(format!("Unknown config key: {}", key)));
        };

        match section {
            "system" => {
                let system = config.system.get_or_insert_with(Default::default);
                match key {
                    "system.spacing" => system.spacing = Some(parse_value(key, value)?),
                    "system.mass" => system.mass = Some(parse_value(key, value)?),
                    "system.temperature" => system.temperature = Some(parse_value(key, value)?),
                    "system.seed" => system.seed = Some(parse_value(key, value)?),
                    "system.chain-length" => system.chain_length = Some(parse_value(key, value)?),
                    "system.two-dimensional" => {
                        system.two_dimensional = Some(parse_value(key, value)?)
                    }
                    _ => return Err(CliError::Config(format!("Unknown config key: {}", key))),
                }
            }
            "decomposition" => {
                let decomposition = config.decomposition.get_or_insert_with(Default::default);
                match key {
                    "decomposition.max-stages" => {
                        decomposition.max_stages = Some(parse_value(key, value)?)
                    }
                    "decomposition.ghost-width" => {
                        decomposition.ghost_width = Some(parse_value(key, value)?)
                    }
                    "decomposition.resize-factor" => {
                        decomposition.resize_factor = Some(parse_value(key, value)?)
                    }
                    _ => return Err(CliError::Config(format!("Unknown config key: {}", key))),
                }
            }
            "integrator" => {
                let integrator = config.integrator.get_or_insert_with(Default::default);
                match key {
                    "integrator.ensemble" => {
                        integrator.ensemble = Some(parse_keyword::<Ensemble>(key, value)?)
                    }
                    "integrator.dt" => integrator.dt = Some(parse_value(key, value)?),
                    "integrator.tau" => integrator.tau = Some(parse_value(key, value)?),
                    "integrator.tau-p" => integrator.tau_p = Some(parse_value(key, value)?),
                    "integrator.temperature" => {
                        integrator.temperature =
                            Some(Variant::Constant(parse_value(key, value)?))
                    }
                    "integrator.pressure" => {
                        integrator.pressure = Some(Variant::Constant(parse_value(key, value)?))
                    }
                    "integrator.coupling" => {
                        integrator.coupling = Some(parse_keyword::<FileCoupling>(key, value)?);
                        integrator.coupling_matrix = None;
                    }
                    "integrator.tchain" => integrator.tchain = Some(parse_value(key, value)?),
                    "integrator.pchain" => integrator.pchain = Some(parse_value(key, value)?),
                    "integrator.iter" => integrator.iter = Some(parse_value(key, value)?),
                    "integrator.boltzmann" => integrator.boltzmann = Some(parse_value(key, value)?),
                    _ => return Err(CliError::Config(format!("Unknown config key: {}", key))),
                }
            }
            "forces" => {
                let forces = config.forces.get_or_insert_with(Default::default);
                match key {
                    "forces.bond-k" => forces.bond_k = Some(parse_value(key, value)?),
                    "forces.bond-r0" => forces.bond_r0 = Some(parse_value(key, value)?),
                    "forces.repulsion-epsilon" => {
                        forces.repulsion_epsilon = Some(parse_value(key, value)?)
                    }
                    "forces.repulsion-cutoff" => {
                        forces.repulsion_cutoff = Some(parse_value(key, value)?)
                    }
                    _ => return Err(CliError::Config(format!("Unknown config key: {}", key))),
                }
            }
            "run" => {
                let run = config.run.get_or_insert_with(Default::default);
                match key {
                    "run.steps" => run.steps = Some(parse_value(key, value)?),
                    "run.sample-every" => run.sample_every = Some(parse_value(key, value)?),
                    _ => return Err(CliError::Config(format!("Unknown config key: {}", key))),
                }
            }
            _ => return Err(CliError::Config(format!("Unknown config key: {}", key))),
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use haloflow::engine::config::CouplingMode;
    use std::io::Write;

    const NPT: &str = r#"
        [system]
        lattice = [3, 3, 3]

        [integrator]
        ensemble = "npt"
        dt = 0.002
        tau = 0.5
        tau-p = 2.0
        temperature = 1.5
        pressure = 0.1
    "#;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn file_values_and_defaults_are_merged() {
        let file = write_config(NPT);
        let config = build_config(file.path(), &[], CliOverrides::default()).unwrap();

        assert_eq!(config.lattice.counts, [3, 3, 3]);
        assert_eq!(config.lattice.len(), 27);
        assert!((config.lattice.thermal_energy - 1.5).abs() < 1e-12);
        assert_eq!(config.grid, [1, 1, 1]);
        assert_eq!(config.comm.max_stages, 1);
        assert_eq!(config.integrator.ensemble, Ensemble::Npt);
        assert_eq!(config.integrator.coupling, CouplingMode::Xyz);
        assert_eq!(config.steps, 1000);
    }

    #[test]
    fn command_line_overrides_take_precedence() {
        let file = write_config(NPT);
        let set = vec![
            "integrator.dt=0.004".to_string(),
            "run.steps=50".to_string(),
            "integrator.coupling=none".to_string(),
        ];
        let overrides = CliOverrides {
            steps: Some(20),
            max_stages: Some(2),
        };
        let config = build_config(file.path(), &set, overrides).unwrap();

        assert_eq!(config.integrator.dt, 0.004);
        assert_eq!(config.integrator.coupling, CouplingMode::None);
        assert_eq!(config.steps, 20);
        assert_eq!(config.comm.max_stages, 2);
    }

    #[test]
    fn ensemble_can_be_switched_from_the_command_line() {
        let file = write_config(NPT);
        let set = vec!["integrator.ensemble=nph".to_string()];
        let config = build_config(file.path(), &set, CliOverrides::default()).unwrap();
        assert_eq!(config.integrator.ensemble, Ensemble::Nph);
        assert_eq!(config.integrator.temperature, None);
        // The lattice still starts at the configured setpoint.
        assert!((config.lattice.thermal_energy - 1.5).abs() < 1e-12);
    }

    #[test]
    fn invalid_set_values_are_reported() {
        let file = write_config(NPT);
        for bad in ["integrator.dt", "integrator.dt=fast", "integrator.nope=1", "misc=1"] {
            let result = build_config(file.path(), &[bad.to_string()], CliOverrides::default());
            assert!(matches!(result, Err(CliError::Config(_))), "accepted {bad}");
        }
        let result = build_config(
            file.path(),
            &["integrator.ensemble=nvt".to_string()],
            CliOverrides::default(),
        );
        assert!(matches!(result, Err(CliError::Config(_))));
    }

    #[test]
    fn missing_integrator_parameters_are_config_errors() {
        let file = write_config("[integrator]\nensemble = \"npt\"\ndt = 0.001\n");
        let err = build_config(file.path(), &[], CliOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("tau_p"));
    }

    #[test]
    fn two_dimensional_systems_flatten_the_lattice() {
        let file = write_config(&format!(
            "{}\n",
            NPT.replace("lattice = [3, 3, 3]", "lattice = [3, 3, 3]\ntwo-dimensional = true")
        ));
        let config = build_config(file.path(), &[], CliOverrides::default()).unwrap();
        assert_eq!(config.lattice.counts, [3, 3, 1]);
        assert_eq!(config.lattice.periodic, [true, true, false]);
    }
}
