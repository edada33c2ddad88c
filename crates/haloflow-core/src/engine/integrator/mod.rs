//! # Integrator Module
//!
//! Rigid-body equations of motion coupled to Nosé-Hoover thermostat and barostat chains.
//!
//! ## Overview
//!
//! - [`RigidNhIntegrator`] - One integrator for both the NPT and the NPH ensemble, split
//!   into `setup`, `step_one` and `step_two` around the external force evaluation
//! - [`NoseHooverChain`] - The chain state and its reversible Trotter update, shared by the
//!   translational, rotational and barostat chains
//! - [`IntegratorVariables`] - The ordered scalar record persisted in checkpoints, with a
//!   fixed layout per ensemble

pub mod chain;
pub mod restart;
pub mod rigid_nh;

pub use chain::NoseHooverChain;
pub use restart::{IntegratorVariables, expected_len, is_valid_restart};
pub use rigid_nh::{DegreesOfFreedom, Phase, RigidNhIntegrator};
