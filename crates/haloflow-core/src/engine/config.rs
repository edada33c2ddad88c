use crate::core::decomposition::stages::MAX_COMMUNICATION_STAGES;
use crate::core::variant::Variant;
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid value for parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// Per-particle fields carried by ghost frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GhostField {
    Tag,
    Plan,
    Position,
    Velocity,
    Charge,
    Diameter,
    Orientation,
}

impl GhostField {
    pub const ALL: [GhostField; 7] = [
        GhostField::Tag,
        GhostField::Plan,
        GhostField::Position,
        GhostField::Velocity,
        GhostField::Charge,
        GhostField::Diameter,
        GhostField::Orientation,
    ];
}

impl fmt::Display for GhostField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GhostField::Tag => "tag",
            GhostField::Plan => "plan",
            GhostField::Position => "position",
            GhostField::Velocity => "velocity",
            GhostField::Charge => "charge",
            GhostField::Diameter => "diameter",
            GhostField::Orientation => "orientation",
        };
        f.write_str(name)
    }
}

/// Selects which ghost fields a split ghost update refreshes.
///
/// The full exchange always sends every field; tags and plans are fixed for the lifetime
/// of a ghost list and are never part of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommFlags {
    pub position: bool,
    pub velocity: bool,
    pub charge: bool,
    pub diameter: bool,
    pub orientation: bool,
}

impl Default for CommFlags {
    fn default() -> Self {
        Self {
            position: true,
            velocity: true,
            charge: false,
            diameter: false,
            orientation: true,
        }
    }
}

impl CommFlags {
    pub fn all() -> Self {
        Self {
            position: true,
            velocity: true,
            charge: true,
            diameter: true,
            orientation: true,
        }
    }

    /// The selected fields in wire order.
    pub fn fields(&self) -> Vec<GhostField> {
        [
            (self.position, GhostField::Position),
            (self.velocity, GhostField::Velocity),
            (self.charge, GhostField::Charge),
            (self.diameter, GhostField::Diameter),
            (self.orientation, GhostField::Orientation),
        ]
        .into_iter()
        .filter_map(|(on, field)| on.then_some(field))
        .collect()
    }
}

pub const DEFAULT_RESIZE_FACTOR: f64 = 1.125;
pub const DEFAULT_BUFFER_HARD_CAP: usize = 1 << 24;

#[derive(Debug, Clone, PartialEq)]
pub struct CommunicatorConfig {
    pub max_stages: u32,
    /// Distance from a subdomain face within which particles are sent as ghosts.
    pub ghost_width: f64,
    pub resize_factor: f64,
    /// Largest number of elements a single buffer may hold.
    pub buffer_hard_cap: usize,
    pub update_fields: CommFlags,
}

#[derive(Default)]
pub struct CommunicatorConfigBuilder {
    max_stages: Option<u32>,
    ghost_width: Option<f64>,
    resize_factor: Option<f64>,
    buffer_hard_cap: Option<usize>,
    update_fields: Option<CommFlags>,
}

impl CommunicatorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_stages(mut self, stages: u32) -> Self {
        self.max_stages = Some(stages);
        self
    }
    pub fn ghost_width(mut self, width: f64) -> Self {
        self.ghost_width = Some(width);
        self
    }
    pub fn resize_factor(mut self, factor: f64) -> Self {
        self.resize_factor = Some(factor);
        self
    }
    pub fn buffer_hard_cap(mut self, cap: usize) -> Self {
        self.buffer_hard_cap = Some(cap);
        self
    }
    pub fn update_fields(mut self, flags: CommFlags) -> Self {
        self.update_fields = Some(flags);
        self
    }

    pub fn build(self) -> Result<CommunicatorConfig, ConfigError> {
        let ghost_width = self
            .ghost_width
            .ok_or(ConfigError::MissingParameter("ghost_width"))?;
        if !(ghost_width >= 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "ghost_width",
                reason: format!("must be non-negative, got {}", ghost_width),
            });
        }
        let resize_factor = self.resize_factor.unwrap_or(DEFAULT_RESIZE_FACTOR);
        if !(resize_factor > 1.0) {
            return Err(ConfigError::InvalidParameter {
                name: "resize_factor",
                reason: format!("must be greater than 1, got {}", resize_factor),
            });
        }
        Ok(CommunicatorConfig {
            max_stages: self.max_stages.unwrap_or(1).min(MAX_COMMUNICATION_STAGES),
            ghost_width,
            resize_factor,
            buffer_hard_cap: self.buffer_hard_cap.unwrap_or(DEFAULT_BUFFER_HARD_CAP),
            update_fields: self.update_fields.unwrap_or_default(),
        })
    }
}

/// Which extended-system variables the rigid-body integrator carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ensemble {
    /// Thermostat and barostat chains.
    Npt,
    /// Barostat chain only; the physical system evolves at constant enthalpy.
    Nph,
}

impl Ensemble {
    /// Restart record name of this ensemble.
    pub fn restart_kind(self) -> &'static str {
        match self {
            Ensemble::Npt => "npt_rigid",
            Ensemble::Nph => "nph_rigid",
        }
    }
}

impl fmt::Display for Ensemble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Ensemble::Npt => "NPT",
            Ensemble::Nph => "NPH",
        })
    }
}

/// How the barostat links the box strain rates of different axes.
#[derive(Debug, Clone, PartialEq)]
pub enum CouplingMode {
    /// Every barostatted axis moves independently.
    None,
    Xy,
    Xz,
    Yz,
    /// Isotropic coupling of all three axes.
    Xyz,
    /// Row `i` gives the weights with which each axis' driving force enters axis `i`.
    Custom(Matrix3<f64>),
}

impl CouplingMode {
    /// The coupling as a matrix of averaging weights over the axes in `flags`.
    ///
    /// Rows of unflagged axes are zero. Each flagged row is normalized so that coupled
    /// axes receive the mean of their driving forces.
    pub fn weights(&self, flags: [bool; 3]) -> Matrix3<f64> {
        let link = |a: usize, b: usize| -> bool {
            a == b
                || match self {
                    CouplingMode::None | CouplingMode::Custom(_) => false,
                    CouplingMode::Xy => a < 2 && b < 2,
                    CouplingMode::Xz => a != 1 && b != 1,
                    CouplingMode::Yz => a > 0 && b > 0,
                    CouplingMode::Xyz => true,
                }
        };
        let mut w = Matrix3::zeros();
        for i in (0..3).filter(|&i| flags[i]) {
            for j in (0..3).filter(|&j| flags[j]) {
                w[(i, j)] = match self {
                    CouplingMode::Custom(m) => m[(i, j)].abs(),
                    _ if link(i, j) => 1.0,
                    _ => 0.0,
                };
            }
            let sum: f64 = w.row(i).sum();
            if sum > 0.0 {
                for j in 0..3 {
                    w[(i, j)] /= sum;
                }
            }
        }
        w
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RigidNhConfig {
    pub ensemble: Ensemble,
    pub dt: f64,
    /// Thermostat period. Ignored for NPH.
    pub tau: f64,
    /// Barostat period.
    pub tau_p: f64,
    pub temperature: Option<Variant>,
    pub pressure: Variant,
    pub coupling: CouplingMode,
    /// Box axes the barostat may deform.
    pub flags: [bool; 3],
    pub tchain: usize,
    pub pchain: usize,
    pub iter: usize,
    pub boltzmann: f64,
}

#[derive(Default)]
pub struct RigidNhConfigBuilder {
    ensemble: Option<Ensemble>,
    dt: Option<f64>,
    tau: Option<f64>,
    tau_p: Option<f64>,
    temperature: Option<Variant>,
    pressure: Option<Variant>,
    coupling: Option<CouplingMode>,
    flags: Option<[bool; 3]>,
    tchain: Option<usize>,
    pchain: Option<usize>,
    iter: Option<usize>,
    boltzmann: Option<f64>,
}

impl RigidNhConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensemble(mut self, ensemble: Ensemble) -> Self {
        self.ensemble = Some(ensemble);
        self
    }
    pub fn dt(mut self, dt: f64) -> Self {
        self.dt = Some(dt);
        self
    }
    pub fn tau(mut self, tau: f64) -> Self {
        self.tau = Some(tau);
        self
    }
    pub fn tau_p(mut self, tau_p: f64) -> Self {
        self.tau_p = Some(tau_p);
        self
    }
    pub fn temperature(mut self, temperature: impl Into<Variant>) -> Self {
        self.temperature = Some(temperature.into());
        self
    }
    pub fn pressure(mut self, pressure: impl Into<Variant>) -> Self {
        self.pressure = Some(pressure.into());
        self
    }
    pub fn coupling(mut self, coupling: CouplingMode) -> Self {
        self.coupling = Some(coupling);
        self
    }
    pub fn flags(mut self, flags: [bool; 3]) -> Self {
        self.flags = Some(flags);
        self
    }
    pub fn tchain(mut self, n: usize) -> Self {
        self.tchain = Some(n);
        self
    }
    pub fn pchain(mut self, n: usize) -> Self {
        self.pchain = Some(n);
        self
    }
    pub fn iter(mut self, n: usize) -> Self {
        self.iter = Some(n);
        self
    }
    pub fn boltzmann(mut self, k: f64) -> Self {
        self.boltzmann = Some(k);
        self
    }

    pub fn build(self) -> Result<RigidNhConfig, ConfigError> {
        let ensemble = self
            .ensemble
            .ok_or(ConfigError::MissingParameter("ensemble"))?;
        let dt = self.dt.ok_or(ConfigError::MissingParameter("dt"))?;
        let tau_p = self.tau_p.ok_or(ConfigError::MissingParameter("tau_p"))?;
        let pressure = self
            .pressure
            .ok_or(ConfigError::MissingParameter("pressure"))?;

        let (tau, temperature) = match ensemble {
            Ensemble::Npt => (
                self.tau.ok_or(ConfigError::MissingParameter("tau"))?,
                Some(
                    self.temperature
                        .ok_or(ConfigError::MissingParameter("temperature"))?,
                ),
            ),
            Ensemble::Nph => (self.tau.unwrap_or(0.0), None),
        };

        let tchain = match ensemble {
            Ensemble::Npt => self.tchain.unwrap_or(5),
            Ensemble::Nph => 0,
        };
        let pchain = self.pchain.unwrap_or(5);
        let iter = self.iter.unwrap_or(5);
        for (name, value) in [("pchain", pchain), ("iter", iter)] {
            if value == 0 {
                return Err(ConfigError::InvalidParameter {
                    name,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        if ensemble == Ensemble::Npt && tchain == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "tchain",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(RigidNhConfig {
            ensemble,
            dt,
            tau,
            tau_p,
            temperature,
            pressure,
            coupling: self.coupling.unwrap_or(CouplingMode::Xyz),
            flags: self.flags.unwrap_or([true; 3]),
            tchain,
            pchain,
            iter,
            boltzmann: self.boltzmann.unwrap_or(1.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn communicator_builder_requires_ghost_width() {
        assert_eq!(
            CommunicatorConfigBuilder::new().build(),
            Err(ConfigError::MissingParameter("ghost_width"))
        );
        let config = CommunicatorConfigBuilder::new()
            .ghost_width(1.5)
            .build()
            .unwrap();
        assert_eq!(config.resize_factor, DEFAULT_RESIZE_FACTOR);
        assert_eq!(config.update_fields, CommFlags::default());
    }

    #[test]
    fn communicator_builder_rejects_non_growing_factor() {
        let result = CommunicatorConfigBuilder::new()
            .ghost_width(1.0)
            .resize_factor(1.0)
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidParameter {
                name: "resize_factor",
                ..
            })
        ));
    }

    #[test]
    fn npt_needs_temperature_but_nph_does_not() {
        let base = || {
            RigidNhConfigBuilder::new()
                .dt(0.005)
                .tau_p(1.0)
                .pressure(1.0)
        };
        assert_eq!(
            base().ensemble(Ensemble::Npt).tau(1.0).build(),
            Err(ConfigError::MissingParameter("temperature"))
        );
        let nph = base().ensemble(Ensemble::Nph).build().unwrap();
        assert_eq!(nph.tchain, 0);
        assert!(nph.temperature.is_none());
    }

    #[test]
    fn coupling_weights_average_linked_axes() {
        let w = CouplingMode::Xy.weights([true; 3]);
        assert!((w[(0, 0)] - 0.5).abs() < 1e-12);
        assert!((w[(0, 1)] - 0.5).abs() < 1e-12);
        assert_eq!(w[(0, 2)], 0.0);
        assert!((w[(2, 2)] - 1.0).abs() < 1e-12);

        let iso = CouplingMode::Xyz.weights([true, true, false]);
        assert!((iso[(1, 0)] - 0.5).abs() < 1e-12);
        assert_eq!(iso.row(2).sum(), 0.0);
    }

    #[test]
    fn comm_flags_list_selected_fields_in_order() {
        assert_eq!(
            CommFlags::default().fields(),
            vec![
                GhostField::Position,
                GhostField::Velocity,
                GhostField::Orientation
            ]
        );
        assert_eq!(CommFlags::all().fields().len(), 5);
    }
}
