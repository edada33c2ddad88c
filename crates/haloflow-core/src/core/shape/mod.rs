//! # Shape Move Module
//!
//! Proposal generators for alchemical Monte Carlo, where the geometry of a particle type
//! is itself a degree of freedom.
//!
//! ## Overview
//!
//! - [`params`] - [`ShapeParams`]: convex polyhedra and ellipsoids with their mass
//!   properties
//! - [`hull`] - Convex hull facets and exact polyhedron volume, centroid and inertia
//! - [`moves`] - The [`ShapeMoveProposer`] capability and the [`ShapeMove`] strategies
//!
//! Acceptance is decided by the outer driver (see `workflows::shape_mc`), which only
//! needs `prepare`, `propose`, `rollback` and the inertia determinant of the proposal.

pub mod hull;
pub mod moves;
pub mod params;

pub use moves::{
    ConstantMove, ElasticMove, GeneralizedMove, ShapeMove, ShapeMoveFn, ShapeMoveProposer,
    UserMove,
};
pub use params::ShapeParams;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ShapeMoveError {
    #[error("Particle type {type_id} has no step size (move configured for {n_types} types)")]
    UnknownType { type_id: usize, n_types: usize },

    #[error("The {mover} move does not support {shape} shapes")]
    Unsupported {
        mover: &'static str,
        shape: &'static str,
    },

    #[error("Proposed polyhedron with {vertices} vertices has no volume")]
    DegenerateHull { vertices: usize },

    #[error("User shape move failed: {0}")]
    Callback(String),
}
