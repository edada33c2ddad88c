//! # Core Models Module
//!
//! Data structures describing the particles a rank owns or shadows, the bonded
//! groups connecting them, and the periodic box they live in.
//!
//! ## Key Components
//!
//! - [`particle`] - Individual particle records and the per-rank [`particle::ParticleData`] store
//! - [`group`] - Bonded groups (bonds, angles, dihedrals, impropers) with rank-ownership vectors
//! - [`sim_box`] - The global simulation box and periodic wrapping
//! - [`system`] - Everything a single rank holds, bundled for the engine
//! - [`ids`] - Global tags and local keys
//!
//! ## Usage
//!
//! ```ignore
//! use haloflow::core::models::{particle::{Particle, ParticleData}, sim_box::SimBox};
//!
//! let sim_box = SimBox::cubic(10.0);
//! let mut particles = ParticleData::new(2);
//! particles.add_local(vec![Particle::new(0, Point3::origin()), Particle::new(1, Point3::new(1.0, 0.0, 0.0))])?;
//! assert_eq!(particles.index_of(1), Some(1));
//! ```

pub mod group;
pub mod ids;
pub mod particle;
pub mod sim_box;
pub mod system;
