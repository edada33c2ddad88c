//! # haloflow Core Library
//!
//! Distributed particle bookkeeping and rigid-body extended-ensemble integration for
//! domain-decomposed molecular simulations.
//!
//! ## Architectural Philosophy
//!
//! The library follows a strict three-layer architecture so that the numerics, the
//! communication machinery and the step orchestration can be tested in isolation.
//!
//! - **[`core`]: The Foundation.** Stateless data models (`Particle`, `ParticleData`,
//!   bonded `GroupTable`s, `SimBox`), the domain decomposition directory and its
//!   communication-stage tables, quaternion kinematics, setpoint variants, the force
//!   collaborator seam and Monte Carlo shape-move proposers.
//!
//! - **[`engine`]: The Logic Core.** The stateful layer: typed communication buffers,
//!   rank transports, the `Communicator` (particle migration, bonded-group ownership,
//!   ghost halo exchange), the thermo seam and the rigid-body Nosé-Hoover integrator.
//!
//! - **[`workflows`]: The Public API.** Ties `engine` and `core` together into a per-rank
//!   simulation step loop and an outer shape Monte Carlo sweep.

pub mod core;
pub mod engine;
pub mod workflows;
