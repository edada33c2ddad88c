//! # Workflows Module
//!
//! High-level entry points that drive the engine through complete runs.
//!
//! ## Overview
//!
//! Workflows tie the communicator, the integrator and the force and thermo collaborators
//! together and report their progress through a [`ProgressReporter`](crate::engine::progress::ProgressReporter).
//!
//! - **Molecular dynamics** ([`simulation`]) - The per-rank step loop: predict, communicate,
//!   evaluate forces, correct, and sample the thermodynamic state
//! - **Shape Monte Carlo** ([`shape_mc`]) - Metropolis sweeps over particle-type shapes with
//!   a caller-supplied acceptance function

pub mod shape_mc;
pub mod simulation;

pub use shape_mc::{AcceptanceCounts, ShapeUpdater, TrialMove};
pub use simulation::Simulation;
