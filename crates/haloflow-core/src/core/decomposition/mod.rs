//! # Domain Decomposition Module
//!
//! Maps the global simulation box onto a grid of per-rank subdomains and derives
//! everything the communicator needs to know about the rank topology.
//!
//! ## Overview
//!
//! - [`directory`] - The [`DomainDecomposition`] directory: rank grid, subdomain bounds,
//!   position-to-owner lookup and neighbor adjacency, including asymmetric splits and
//!   mixed periodic/non-periodic boundaries
//! - [`offset`] - Grid offsets and the face direction bits used in communication plans
//! - [`stages`] - The staged communication schedule, an explicit (rank, stage)
//!   adjacency table
//!
//! The directory is recomputed only when the topology changes. Box rescaling never
//! requires a rebuild because subdomain faces are stored as box fractions.

pub mod directory;
pub mod offset;
pub mod stages;

pub use directory::{Bounds, DomainDecomposition, Neighbor};
pub use offset::Offset;
pub use stages::{Stage, StageLink, StageTable};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum DecompositionError {
    #[error("Rank grid {grid:?} has an empty dimension")]
    EmptyGrid { grid: [usize; 3] },

    #[error("Invalid subdomain fractions along axis {axis}: {reason}")]
    InvalidSplits { axis: usize, reason: String },

    #[error("Rank {rank} does not exist in a decomposition of {num_ranks} ranks")]
    RankOutOfRange { rank: usize, num_ranks: usize },

    #[error("Position {position:?} lies outside the non-periodic box")]
    OutsideBox { position: [f64; 3] },
}
