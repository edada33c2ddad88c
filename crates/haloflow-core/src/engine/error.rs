use thiserror::Error;

use super::buffers::BufferRole;
use super::config::ConfigError;
use super::transport::MessageTag;
use crate::core::decomposition::DecompositionError;
use crate::core::forces::ForceError;
use crate::core::models::group::GroupError;
use crate::core::models::ids::Tag;
use crate::core::models::particle::ParticleDataError;
use crate::core::shape::ShapeMoveError;

#[derive(Debug, Error)]
pub enum CommError {
    #[error("Buffer '{role}' needs {requested} elements, above its hard cap of {cap}")]
    BufferOverflow {
        role: BufferRole,
        requested: usize,
        cap: usize,
    },

    #[error("Buffer '{role}' was requested with a different element type than it holds")]
    BufferRoleMismatch { role: BufferRole },

    #[error("Ghost update requested without a valid ghost list (rebuild with exchange_ghosts first)")]
    StaleGhostList,

    #[error("finish_update_ghosts called without a matching begin_update_ghosts")]
    GhostUpdateNotStarted,

    #[error(
        "Rank {source_rank} sent {found} ghosts in stage {stage}, but the ghost list expects {expected}"
    )]
    GhostCountMismatch {
        stage: usize,
        source_rank: usize,
        expected: usize,
        found: usize,
    },

    #[error("Particles must be migrated before ghosts can be exchanged")]
    MigrationPending,

    #[error("Particle {tag} on rank {rank} left the box through a non-periodic face")]
    ParticleOutOfBox { tag: Tag, rank: usize },

    #[error("Particle {tag} is still outside the subdomain of rank {rank} after all stages")]
    StraggledParticle { tag: Tag, rank: usize },

    #[error("Stage {stage} of rank {rank} has no link toward {offset:?} for particle {tag}")]
    MissingStageLink {
        tag: Tag,
        rank: usize,
        stage: usize,
        offset: [i8; 3],
    },

    #[error("Rank {rank} is no longer reachable")]
    RankLost { rank: usize },

    #[error("Rank {rank} does not exist on a transport of {size} ranks")]
    UnknownRank { rank: usize, size: usize },

    #[error("No frame from rank {source_rank} with tag {tag} will ever arrive")]
    MissingFrame { source_rank: usize, tag: MessageTag },

    #[error("Reduction over {found} values does not match the {expected} values of rank 0")]
    ReductionLength { expected: usize, found: usize },

    #[error(
        "Transport of rank {transport_rank}/{transport_size} cannot serve rank {rank} of a {num_ranks}-rank decomposition"
    )]
    TransportMismatch {
        transport_rank: usize,
        transport_size: usize,
        rank: usize,
        num_ranks: usize,
    },

    #[error("Frame codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Decomposition(#[from] DecompositionError),

    #[error(transparent)]
    ParticleData(#[from] ParticleDataError),

    #[error(transparent)]
    Group(#[from] GroupError),
}

#[derive(Debug, Error)]
pub enum IntegratorError {
    #[error("Integrator phase error: {operation} requires phase {expected}, found {found}")]
    PhaseOrder {
        operation: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("The integrated bodies have no degrees of freedom")]
    NoDegreesOfFreedom,

    #[error("Reduction failed: {0}")]
    Comm(#[from] CommError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Communication failed: {0}")]
    Comm(#[from] CommError),

    #[error("Integration failed: {0}")]
    Integrator(#[from] IntegratorError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Force evaluation failed: {0}")]
    Force(#[from] ForceError),

    #[error("Shape move failed: {0}")]
    Shape(#[from] ShapeMoveError),

    #[error("Decomposition error: {0}")]
    Decomposition(#[from] DecompositionError),

    #[error("Particle data error: {0}")]
    ParticleData(#[from] ParticleDataError),

    #[error("Bonded group error: {0}")]
    Group(#[from] GroupError),

    #[error("Internal logic error: {0}")]
    Internal(String),
}
