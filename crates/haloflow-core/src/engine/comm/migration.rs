use super::Communicator;
use super::ghosts::GhostStatus;
use super::groups::{drop_orphans, merge_incoming};
use crate::core::decomposition::{Offset, Stage};
use crate::core::models::group::{GroupKind, GroupRecord};
use crate::core::models::ids::Tag;
use crate::core::models::particle::Particle;
use crate::core::models::system::LocalSystem;
use crate::engine::buffers::BufferRole;
use crate::engine::error::CommError;
use crate::engine::transport::{Channel, MessageTag, Transport};
use std::collections::HashMap;
use tracing::{debug, instrument};

/// Particles moved in one communication stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub sent: usize,
    pub received: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    pub stages: Vec<StageCounts>,
}

impl MigrationSummary {
    pub fn total_sent(&self) -> usize {
        self.stages.iter().map(|s| s.sent).sum()
    }

    pub fn total_received(&self) -> usize {
        self.stages.iter().map(|s| s.received).sum()
    }
}

impl<T: Transport> Communicator<T> {
    /// Hands every local particle that left this rank's subdomain to its new owner.
    ///
    /// Runs exactly one round per communication stage. In each stage a particle is sent
    /// along the link matching the faces it crossed within the stage mask, so a particle
    /// crossing several axes is relayed over consecutive stages. Bonded groups travel
    /// with their migrating members. Positions are wrapped back into the box by the
    /// receiver, or locally along periodic axes that are not decomposed.
    ///
    /// Afterwards local indices are renumbered and the ghost list is invalid; call
    /// [`migrate_groups`](Self::migrate_groups) and then
    /// [`exchange_ghosts`](Self::exchange_ghosts).
    ///
    /// # Errors
    ///
    /// - [`CommError::ParticleOutOfBox`] for a particle beyond a non-periodic face.
    /// - [`CommError::StraggledParticle`] for a particle still outside this subdomain
    ///   after the last stage.
    /// - [`CommError::MissingStageLink`] if a stage has no link toward the faces a
    ///   particle crossed.
    #[instrument(skip_all, name = "migrate_particles", fields(rank = self.context.rank()))]
    pub fn migrate_particles(
        &mut self,
        system: &mut LocalSystem,
    ) -> Result<MigrationSummary, CommError> {
        let me = self.context.rank();
        system.particles.clear_ghosts();
        self.ghost_status = GhostStatus::Invalid;

        // === Phase 1: Local wrapping and wall checks ===
        let decomposition = self.context.shared_decomposition();
        let sim_box = system.sim_box;
        for p in system.particles.local_mut() {
            if !sim_box.contains_along_walls(&p.position) {
                return Err(CommError::ParticleOutOfBox { tag: p.tag, rank: me });
            }
            for axis in 0..3 {
                if sim_box.periodic()[axis] && !decomposition.is_decomposed(axis) {
                    sim_box.wrap_axis(&mut p.position, &mut p.image, axis);
                }
            }
        }

        // === Phase 2: One exchange round per stage ===
        let mut summary = MigrationSummary::default();
        for stage_idx in 0..self.stages.num_stages() {
            let stage = self.stages.stage(stage_idx).clone();
            let counts = self.migrate_stage(stage_idx, &stage, system)?;
            self.transport.barrier()?;
            debug!(
                stage = stage_idx,
                sent = counts.sent,
                received = counts.received,
                "Migration stage complete."
            );
            summary.stages.push(counts);
        }

        // === Phase 3: Everything must be home now ===
        for p in system.particles.local() {
            if decomposition.crossing_bits(me, &p.position, &system.sim_box) != 0 {
                return Err(CommError::StraggledParticle { tag: p.tag, rank: me });
            }
        }

        self.epoch += 1;
        self.force_migrate = false;
        Ok(summary)
    }

    fn migrate_stage(
        &mut self,
        stage_idx: usize,
        stage: &Stage,
        system: &mut LocalSystem,
    ) -> Result<StageCounts, CommError> {
        if stage.links.is_empty() {
            return Ok(StageCounts::default());
        }
        let me = self.context.rank();

        // Route every leaving particle to the link matching the faces it crossed.
        let decomposition = self.context.decomposition();
        let mut route: HashMap<Tag, usize> = HashMap::new();
        for p in system.particles.local() {
            let bits = decomposition.crossing_bits(me, &p.position, &system.sim_box) & stage.mask;
            if bits == 0 {
                continue;
            }
            let offset = Offset::from_direction_bits(bits);
            let link = stage
                .link_index(offset)
                .ok_or(CommError::MissingStageLink {
                    tag: p.tag,
                    rank: me,
                    stage: stage_idx,
                    offset: offset.0,
                })?;
            route.insert(p.tag, link);
        }

        // Groups follow their members: record the new owners, then pack per link.
        let mut group_frames: Vec<[Vec<GroupRecord>; 4]> =
            vec![Default::default(); stage.links.len()];
        for kind in GroupKind::ALL {
            for (_, entry) in system.groups.table_mut(kind).iter_mut() {
                let mut destinations = Vec::new();
                for (slot, member) in entry.record.members.iter().enumerate() {
                    if let Some(&link) = route.get(member) {
                        entry.record.ranks[slot] = stage.links[link].neighbor as u32;
                        destinations.push(link);
                    }
                }
                if destinations.is_empty() {
                    continue;
                }
                entry.dirty = true;
                destinations.sort_unstable();
                destinations.dedup();
                for link in destinations {
                    group_frames[link][kind.index()].push(entry.record.clone());
                }
            }
        }

        let mut leaving: Vec<Vec<Particle>> = vec![Vec::new(); stage.links.len()];
        for p in system.particles.take_local_where(|p| route.contains_key(&p.tag)) {
            leaving[route[&p.tag]].push(p);
        }
        let sent = leaving.iter().map(Vec::len).sum();

        // === Send ===
        let send = self
            .buffers
            .buffer_mut::<Particle>(BufferRole::ParticleSend)?;
        send.clear();
        let mut frames = Vec::with_capacity(stage.links.len());
        for bucket in leaving {
            let start = send.len();
            send.extend(bucket)?;
            frames.push(send.encode_range(start..send.len())?);
        }
        for (link, frame) in stage.links.iter().zip(frames) {
            let tag = MessageTag::new(Channel::Migrate, stage_idx as u8, link.offset.index() as u8);
            self.transport.post(link.neighbor, tag, frame)?;
        }
        for kind in GroupKind::ALL {
            let send = self
                .buffers
                .buffer_mut::<GroupRecord>(BufferRole::GroupSend(kind))?;
            send.clear();
            for (link, records) in stage.links.iter().zip(&mut group_frames) {
                let start = send.len();
                send.extend(std::mem::take(&mut records[kind.index()]))?;
                let frame = send.encode_range(start..send.len())?;
                let tag = MessageTag::new(
                    Channel::MigrateGroups(kind),
                    stage_idx as u8,
                    link.offset.index() as u8,
                );
                self.transport.post(link.neighbor, tag, frame)?;
            }
        }

        // === Receive ===
        let recv = self
            .buffers
            .buffer_mut::<Particle>(BufferRole::ParticleRecv)?;
        recv.clear();
        for link in &stage.links {
            let tag = MessageTag::new(
                Channel::Migrate,
                stage_idx as u8,
                link.offset.opposite().index() as u8,
            );
            recv.decode_append(&self.transport.receive(link.neighbor, tag)?)?;
        }
        let mut arrived = recv.as_slice().to_vec();
        for p in &mut arrived {
            system.sim_box.wrap(&mut p.position, &mut p.image);
        }
        let received = arrived.len();
        system.particles.add_local(arrived)?;

        for kind in GroupKind::ALL {
            let recv = self
                .buffers
                .buffer_mut::<GroupRecord>(BufferRole::GroupRecv(kind))?;
            recv.clear();
            for link in &stage.links {
                let tag = MessageTag::new(
                    Channel::MigrateGroups(kind),
                    stage_idx as u8,
                    link.offset.opposite().index() as u8,
                );
                recv.decode_append(&self.transport.receive(link.neighbor, tag)?)?;
            }
            let table = system.groups.table_mut(kind);
            for record in recv.as_slice() {
                merge_incoming(table, &system.particles, record.clone(), me as u32)?;
            }
            drop_orphans(table, &system.particles);
        }

        Ok(StageCounts { sent, received })
    }
}
