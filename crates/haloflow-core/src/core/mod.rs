//! # Core Module
//!
//! Fundamental data structures and pure algorithms shared by every layer of haloflow.
//!
//! ## Architecture
//!
//! - **Particle Representation** ([`models`]) - Particle records, the per-rank particle
//!   store with its tag lookup, bonded groups and the periodic simulation box
//! - **Spatial Decomposition** ([`decomposition`]) - Rank grid, subdomain bounds,
//!   neighbor adjacency and the staged communication schedule
//! - **Collaborators** ([`forces`], [`variant`]) - Force evaluation and time-dependent
//!   setpoints consumed by the integrator
//! - **Shape Moves** ([`shape`]) - Proposal strategies for an outer Monte Carlo driver
//! - **Math Utilities** ([`utils`]) - Quaternion helpers for rigid-body rotation

pub mod decomposition;
pub mod forces;
pub mod models;
pub mod shape;
pub mod utils;
pub mod variant;
