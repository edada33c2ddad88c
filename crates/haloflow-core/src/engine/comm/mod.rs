//! # Communicator Module
//!
//! Keeps the particles of a domain-decomposed run where they belong and gives every rank
//! the remote data its force and constraint terms need.
//!
//! ## Overview
//!
//! One [`Communicator`] lives on each rank. Every step it runs, in order:
//!
//! 1. **Particle migration** ([`migration`]) - Particles that left the subdomain are handed
//!    to their new owner in a fixed number of stages, taking their bonded groups along
//! 2. **Group ownership** ([`groups`]) - One [`GroupCommunicator`] per bonded-group kind
//!    refreshes the rank-ownership vectors and marks members whose partners live elsewhere
//! 3. **Ghost exchange** ([`ghosts`]) - The ghost halo is rebuilt from proximity and group
//!    plans, or, between migrations, refreshed field by field through a split
//!    begin/finish update along the stored ghost lists. A particle entering or leaving the
//!    ghost layer of a face also forces a rebuild
//!
//! [`Communicator::communicate`] decides collectively which of the two paths a step takes.
//! All exchanges are rendezvous: every rank posts and receives the same stages in the same
//! order and waits at a barrier after each stage.

pub mod ghosts;
pub mod groups;
pub mod migration;

pub use ghosts::{GhostSource, GhostStatus, GhostSummary, pack_ghost_field, unpack_ghost_field};
pub use groups::{GroupCommunicator, GroupSummary, RankUpdate};
pub use migration::{MigrationSummary, StageCounts};

use super::buffers::BufferManager;
use super::config::CommunicatorConfig;
use super::context::ExecutionContext;
use super::error::CommError;
use super::transport::{Reducer, Transport};
use crate::core::decomposition::StageTable;
use crate::core::models::group::GroupKind;
use crate::core::models::system::LocalSystem;
use ghosts::GhostLists;
use tracing::{debug, info, instrument};

/// What [`Communicator::communicate`] did in a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommOutcome {
    /// Particles were migrated and the ghost list rebuilt.
    Rebuilt {
        migration: MigrationSummary,
        ghosts: GhostSummary,
    },
    /// Particles stayed put but some entered or left a ghost layer, so the ghost list
    /// was rebuilt without migrating.
    Reghosted { ghosts: GhostSummary },
    /// Only the configured ghost fields were refreshed.
    Updated,
}

/// Per-rank particle, group and ghost communication over a [`Transport`].
#[derive(Debug)]
pub struct Communicator<T: Transport> {
    context: ExecutionContext,
    transport: T,
    config: CommunicatorConfig,
    stages: StageTable,
    buffers: BufferManager,
    groups: [GroupCommunicator; 4],
    ghost_lists: GhostLists,
    /// Proximity plans of the local particles at the last full exchange.
    halo_plans: Vec<u32>,
    ghost_status: GhostStatus,
    epoch: u64,
    force_migrate: bool,
}

impl<T: Transport> Communicator<T> {
    /// Creates the communicator of `context.rank()`.
    ///
    /// A fresh communicator has no ghost list and requires a migration before anything
    /// else.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::TransportMismatch`] if the transport is not the endpoint of
    /// the context's rank in a fabric of the decomposition's size.
    pub fn new(
        context: ExecutionContext,
        transport: T,
        config: CommunicatorConfig,
    ) -> Result<Self, CommError> {
        if transport.rank() != context.rank() || transport.size() != context.num_ranks() {
            return Err(CommError::TransportMismatch {
                transport_rank: transport.rank(),
                transport_size: transport.size(),
                rank: context.rank(),
                num_ranks: context.num_ranks(),
            });
        }
        let stages = context
            .decomposition()
            .stage_table(context.rank(), config.max_stages);
        let buffers = BufferManager::new(config.resize_factor, config.buffer_hard_cap);
        debug!(
            rank = context.rank(),
            stages = stages.num_stages(),
            "Communicator created."
        );
        Ok(Self {
            context,
            transport,
            config,
            stages,
            buffers,
            groups: GroupKind::ALL.map(GroupCommunicator::new),
            ghost_lists: GhostLists::default(),
            halo_plans: Vec::new(),
            ghost_status: GhostStatus::Invalid,
            epoch: 0,
            force_migrate: true,
        })
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn config(&self) -> &CommunicatorConfig {
        &self.config
    }

    pub fn stage_table(&self) -> &StageTable {
        &self.stages
    }

    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The transport as a cross-rank reducer, for thermo and integrator reductions.
    pub fn reducer(&mut self) -> &mut dyn Reducer {
        &mut self.transport
    }

    pub fn ghost_status(&self) -> GhostStatus {
        self.ghost_status
    }

    /// Topology epoch, advanced by every migration, stage change and ghost rebuild.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_migration_pending(&self) -> bool {
        self.force_migrate
    }

    /// Requires a migration before the next ghost exchange.
    pub fn force_migration(&mut self) {
        self.force_migrate = true;
        self.ghost_status = GhostStatus::Invalid;
    }

    /// Changes how many dependent stages each exchange may use.
    ///
    /// The stage table is rebuilt, the ghost list invalidated and a full migration forced
    /// before any further exchange.
    pub fn set_max_stages(&mut self, max_stages: u32) {
        self.stages = self
            .context
            .decomposition()
            .stage_table(self.context.rank(), max_stages);
        self.config.max_stages = self.stages.max_stages();
        self.epoch += 1;
        self.force_migration();
        info!(
            max_stages = self.stages.max_stages(),
            stages = self.stages.num_stages(),
            "Communication stages changed; migration forced."
        );
    }

    /// Refreshes the ownership vectors of one kind of bonded group.
    ///
    /// See [`GroupCommunicator::migrate_groups`].
    pub fn migrate_groups(
        &mut self,
        kind: GroupKind,
        incomplete: bool,
        system: &mut LocalSystem,
    ) -> Result<GroupSummary, CommError> {
        let gc = self.groups[kind.index()];
        gc.migrate_groups(
            incomplete,
            &self.context,
            &mut self.transport,
            &mut self.buffers,
            system,
        )
    }

    /// Brings particles and ghosts up to date for a step.
    ///
    /// When a migration is forced or any rank holds a particle outside its subdomain
    /// (agreed on by a reduction), particles are migrated, group ownership refreshed for
    /// every kind and the ghost list rebuilt. When instead any rank has a particle whose
    /// proximity plan changed since the last full exchange, only the ghost list is
    /// rebuilt. Otherwise the split ghost update runs.
    ///
    /// Collective: every rank must call it with the same `timestep`.
    #[instrument(skip_all, name = "communicate", fields(rank = self.context.rank(), timestep = timestep))]
    pub fn communicate(
        &mut self,
        timestep: u64,
        system: &mut LocalSystem,
    ) -> Result<CommOutcome, CommError> {
        let migrate = self.force_migrate || self.has_escapees(system);
        let reghost = !migrate && self.halo_changed(system);
        let mut requests = [f64::from(u8::from(migrate)), f64::from(u8::from(reghost))];
        self.transport.all_reduce_sum(&mut requests)?;

        if requests[0] > 0.0 {
            let migration = self.migrate_particles(system)?;
            for kind in GroupKind::ALL {
                self.migrate_groups(kind, true, system)?;
            }
            let ghosts = self.exchange_ghosts(system)?;
            return Ok(CommOutcome::Rebuilt { migration, ghosts });
        }
        if requests[1] > 0.0 {
            let ghosts = self.exchange_ghosts(system)?;
            debug!(timestep, "Ghost layer membership changed; ghost list rebuilt.");
            return Ok(CommOutcome::Reghosted { ghosts });
        }
        self.begin_update_ghosts(system)?;
        self.finish_update_ghosts(system)?;
        Ok(CommOutcome::Updated)
    }

    /// `true` if some local particle entered or left the ghost layer of a face.
    fn halo_changed(&self, system: &LocalSystem) -> bool {
        self.proximity_plans(system) != self.halo_plans
    }

    /// `true` if some local particle left the subdomain or the box.
    fn has_escapees(&self, system: &LocalSystem) -> bool {
        let me = self.context.rank();
        let decomposition = self.context.decomposition();
        let sim_box = &system.sim_box;
        system.particles.local().iter().any(|p| {
            decomposition.crossing_bits(me, &p.position, sim_box) != 0
                || !sim_box.contains_along_walls(&p.position)
                || (0..3).any(|axis| {
                    let f = sim_box.fraction(&p.position, axis);
                    sim_box.periodic()[axis] && !(0.0..1.0).contains(&f)
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decomposition::DomainDecomposition;
    use crate::core::models::ids::Tag;
    use crate::core::models::particle::{Particle, ParticleData};
    use crate::core::models::sim_box::SimBox;
    use crate::engine::config::CommunicatorConfigBuilder;
    use crate::engine::transport::{LoopbackTransport, ThreadedFabric, ThreadedTransport};
    use nalgebra::Point3;
    use std::sync::Arc;
    use std::thread;

    fn loopback_communicator() -> Communicator<LoopbackTransport> {
        let ctx = ExecutionContext::single([true; 3]).unwrap();
        let config = CommunicatorConfigBuilder::new().ghost_width(1.0).build().unwrap();
        Communicator::new(ctx, LoopbackTransport::new(), config).unwrap()
    }

    fn system_with(particles: Vec<Particle>) -> LocalSystem {
        let n = particles.len();
        LocalSystem::unbonded(
            ParticleData::with_local(n, particles).unwrap(),
            SimBox::cubic(10.0),
        )
    }

    #[test]
    fn transport_must_match_the_context() {
        let decomposition = Arc::new(DomainDecomposition::new([2, 1, 1], [true; 3]).unwrap());
        let ctx = ExecutionContext::new(1, decomposition).unwrap();
        let config = CommunicatorConfigBuilder::new().ghost_width(1.0).build().unwrap();
        assert!(matches!(
            Communicator::new(ctx, LoopbackTransport::new(), config),
            Err(CommError::TransportMismatch { rank: 1, num_ranks: 2, .. })
        ));
    }

    #[test]
    fn ghost_updates_require_a_built_list() {
        let mut comm = loopback_communicator();
        let mut system = system_with(vec![Particle::new(0, Point3::origin())]);

        assert!(matches!(
            comm.begin_update_ghosts(&system),
            Err(CommError::StaleGhostList)
        ));
        assert!(matches!(
            comm.finish_update_ghosts(&mut system),
            Err(CommError::GhostUpdateNotStarted)
        ));
        assert!(matches!(
            comm.exchange_ghosts(&mut system),
            Err(CommError::MigrationPending)
        ));

        comm.migrate_particles(&mut system).unwrap();
        comm.exchange_ghosts(&mut system).unwrap();
        assert!(matches!(comm.ghost_status(), GhostStatus::Built { .. }));
        comm.begin_update_ghosts(&system).unwrap();
        assert!(matches!(
            comm.begin_update_ghosts(&system),
            Err(CommError::StaleGhostList)
        ));
        comm.finish_update_ghosts(&mut system).unwrap();
        assert!(matches!(comm.ghost_status(), GhostStatus::Built { .. }));
    }

    #[test]
    fn changing_stages_forces_migration_and_invalidates_ghosts() {
        let mut comm = loopback_communicator();
        let mut system = system_with(vec![Particle::new(0, Point3::origin())]);
        assert!(matches!(
            comm.communicate(0, &mut system).unwrap(),
            CommOutcome::Rebuilt { .. }
        ));
        assert_eq!(comm.communicate(1, &mut system).unwrap(), CommOutcome::Updated);

        let epoch = comm.epoch();
        comm.set_max_stages(7);
        assert_eq!(comm.config().max_stages, 3);
        assert!(comm.is_migration_pending());
        assert!(comm.epoch() > epoch);
        assert!(matches!(
            comm.begin_update_ghosts(&system),
            Err(CommError::StaleGhostList)
        ));
        assert!(matches!(
            comm.communicate(2, &mut system).unwrap(),
            CommOutcome::Rebuilt { .. }
        ));
    }

    #[test]
    fn escaping_particles_trigger_migration_on_every_rank() {
        let mut comm = loopback_communicator();
        let mut system = system_with(vec![Particle::new(0, Point3::origin())]);
        comm.communicate(0, &mut system).unwrap();
        system.particles.local_mut()[0].position.x = 5.5;
        assert!(matches!(
            comm.communicate(1, &mut system).unwrap(),
            CommOutcome::Rebuilt { .. }
        ));
        assert!((system.particles.local()[0].position.x + 4.5).abs() < 1e-12);
    }

    fn run_ranks<F, R>(grid: [usize; 3], max_stages: u32, body: F) -> Vec<R>
    where
        F: Fn(Communicator<ThreadedTransport>) -> R + Sync,
        R: Send,
    {
        let decomposition = Arc::new(DomainDecomposition::new(grid, [true; 3]).unwrap());
        let size = decomposition.num_ranks();
        thread::scope(|s| {
            let handles: Vec<_> = ThreadedFabric::endpoints(size)
                .into_iter()
                .enumerate()
                .map(|(rank, t)| {
                    let ctx = ExecutionContext::new(rank, Arc::clone(&decomposition)).unwrap();
                    let config = CommunicatorConfigBuilder::new()
                        .ghost_width(0.5)
                        .max_stages(max_stages)
                        .build()
                        .unwrap();
                    let body = &body;
                    s.spawn(move || body(Communicator::new(ctx, t, config).unwrap()))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    fn two_rank_run<F, R>(body: F) -> Vec<R>
    where
        F: Fn(Communicator<ThreadedTransport>) -> R + Sync,
        R: Send,
    {
        run_ranks([2, 1, 1], 1, body)
    }

    fn ghost_tags(system: &LocalSystem) -> Vec<Tag> {
        system.particles.ghosts().iter().map(|g| g.tag).collect()
    }

    #[test]
    fn entering_a_ghost_layer_rebuilds_the_halo() {
        let results = two_rank_run(|mut comm| {
            let rank = comm.context().rank();
            // Rank 0 owns [-5, 0); its particle starts deep inside.
            let local = if rank == 0 {
                vec![Particle::new(0, Point3::new(-2.0, 0.0, 0.0))]
            } else {
                Vec::new()
            };
            let mut system =
                LocalSystem::unbonded(ParticleData::with_local(1, local).unwrap(), SimBox::cubic(10.0));
            comm.communicate(0, &mut system).unwrap();
            let before = ghost_tags(&system);

            if rank == 0 {
                system.particles.local_mut()[0].position.x = -0.1;
            }
            let outcome = comm.communicate(1, &mut system).unwrap();
            let after: Vec<(Tag, f64)> = system
                .particles
                .ghosts()
                .iter()
                .map(|g| (g.tag, g.position.x))
                .collect();

            if rank == 0 {
                system.particles.local_mut()[0].position.x = -0.15;
            }
            let next = comm.communicate(2, &mut system).unwrap();
            let refreshed: Vec<f64> = system.particles.ghosts().iter().map(|g| g.position.x).collect();
            (rank, before, outcome, after, next, refreshed)
        });

        for (rank, before, outcome, after, next, refreshed) in results {
            assert!(before.is_empty());
            assert!(matches!(outcome, CommOutcome::Reghosted { .. }));
            assert_eq!(next, CommOutcome::Updated);
            if rank == 1 {
                assert_eq!(after.len(), 1);
                assert_eq!(after[0].0, 0);
                assert!((after[0].1 + 0.1).abs() < 1e-12);
                assert_eq!(refreshed.len(), 1);
                assert!((refreshed[0] + 0.15).abs() < 1e-12);
            } else {
                assert!(after.is_empty());
                assert!(refreshed.is_empty());
            }
        }
    }

    #[test]
    fn leaving_a_ghost_layer_drops_the_ghost() {
        let results = two_rank_run(|mut comm| {
            let rank = comm.context().rank();
            let local = if rank == 0 {
                vec![Particle::new(0, Point3::new(-0.1, 0.0, 0.0))]
            } else {
                Vec::new()
            };
            let mut system =
                LocalSystem::unbonded(ParticleData::with_local(1, local).unwrap(), SimBox::cubic(10.0));
            comm.communicate(0, &mut system).unwrap();
            let before = ghost_tags(&system);
            if rank == 0 {
                system.particles.local_mut()[0].position.x = -2.0;
            }
            let outcome = comm.communicate(1, &mut system).unwrap();
            (rank, before, outcome, ghost_tags(&system))
        });

        for (rank, before, outcome, after) in results {
            assert!(matches!(outcome, CommOutcome::Reghosted { .. }));
            assert!(after.is_empty());
            if rank == 1 {
                assert_eq!(before, vec![0]);
            }
        }
    }

    #[test]
    fn corner_ghosts_reach_every_adjacent_rank() {
        for max_stages in [1, 2] {
            let results = run_ranks([2, 2, 1], max_stages, |mut comm| {
                let rank = comm.context().rank();
                // Rank 0 owns [-5, 0) x [-5, 0); the particle sits near its +x/+y corner.
                let local = if rank == 0 {
                    vec![Particle::new(0, Point3::new(-0.2, -0.3, 0.0))]
                } else {
                    Vec::new()
                };
                let mut system = LocalSystem::unbonded(
                    ParticleData::with_local(1, local).unwrap(),
                    SimBox::cubic(10.0),
                );
                comm.communicate(0, &mut system).unwrap();
                let built = ghost_tags(&system);

                if rank == 0 {
                    let p = &mut system.particles.local_mut()[0];
                    p.position = Point3::new(-0.25, -0.35, 0.0);
                }
                let outcome = comm.communicate(1, &mut system).unwrap();
                let updated: Vec<(f64, f64)> = system
                    .particles
                    .ghosts()
                    .iter()
                    .map(|g| (g.position.x, g.position.y))
                    .collect();
                (rank, comm.stage_table().num_stages(), built, outcome, updated)
            });

            for (rank, num_stages, built, outcome, updated) in results {
                assert_eq!(num_stages, max_stages as usize);
                assert_eq!(outcome, CommOutcome::Updated);
                if rank == 0 {
                    assert!(built.is_empty());
                    assert!(updated.is_empty());
                } else {
                    assert_eq!(built, vec![0], "rank {rank}, {max_stages} stages");
                    assert_eq!(updated.len(), 1);
                    assert!((updated[0].0 + 0.25).abs() < 1e-12);
                    assert!((updated[0].1 + 0.35).abs() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn ghosts_cross_the_periodic_boundary_and_follow_updates() {
        let results = two_rank_run(|mut comm| {
            let rank = comm.context().rank();
            // Rank 1 owns [0, 5); its particle sits 0.2 below the periodic face.
            let local = if rank == 1 {
                vec![Particle::new(0, Point3::new(4.8, 0.0, 0.0))]
            } else {
                Vec::new()
            };
            let mut system =
                LocalSystem::unbonded(ParticleData::with_local(1, local).unwrap(), SimBox::cubic(10.0));
            comm.communicate(0, &mut system).unwrap();
            let built: Vec<f64> = system.particles.ghosts().iter().map(|g| g.position.x).collect();

            if rank == 1 {
                system.particles.local_mut()[0].position.x = 4.85;
                system.particles.local_mut()[0].velocity.x = 2.0;
            }
            let outcome = comm.communicate(1, &mut system).unwrap();
            let updated: Vec<(f64, f64)> = system
                .particles
                .ghosts()
                .iter()
                .map(|g| (g.position.x, g.velocity.x))
                .collect();
            (rank, built, outcome, updated)
        });

        for (rank, built, outcome, updated) in results {
            assert_eq!(outcome, CommOutcome::Updated);
            if rank == 0 {
                assert_eq!(built.len(), 1);
                assert!((built[0] + 5.2).abs() < 1e-12);
                assert_eq!(updated.len(), 1);
                assert!((updated[0].0 + 5.15).abs() < 1e-12);
                assert!((updated[0].1 - 2.0).abs() < 1e-12);
            } else {
                assert!(built.is_empty());
                assert!(updated.is_empty());
            }
        }
    }
}
