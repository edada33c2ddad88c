//! # Engine Module
//!
//! The stateful layer of the library. Everything that owns per-rank state across steps or
//! talks to other ranks lives here.
//!
//! ## Overview
//!
//! - [`transport`] - Point-to-point framed messaging between ranks and the reductions built on it
//! - [`buffers`] - Typed, growable communication buffers with a hard size cap
//! - [`comm`] - The [`comm::Communicator`]: particle migration, bonded-group ownership and ghosts
//! - [`integrator`] - The rigid-body Nosé-Hoover NPT/NPH integrator and its restart variables
//! - [`thermo`] - Global temperature and pressure observables consumed by the integrator
//! - [`context`], [`config`], [`error`], [`progress`] - Shared plumbing for the above

pub mod buffers;
pub mod comm;
pub mod config;
pub mod context;
pub mod error;
pub mod integrator;
pub mod progress;
pub mod thermo;
pub mod transport;
