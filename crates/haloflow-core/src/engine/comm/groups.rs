use crate::core::decomposition::{Bounds, Neighbor, Offset};
use crate::core::models::group::{GroupKind, GroupRecord, GroupStatus, GroupTable};
use crate::core::models::ids::Tag;
use crate::core::models::particle::{Particle, ParticleData};
use crate::core::models::system::LocalSystem;
use crate::engine::buffers::{BufferManager, BufferRole};
use crate::engine::context::ExecutionContext;
use crate::engine::error::CommError;
use crate::engine::transport::{Channel, MessageTag, Transport};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// "Member `slot` of group `group_tag` is owned by `rank`", as announced by that rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankUpdate {
    pub group_tag: Tag,
    pub slot: u8,
    pub rank: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupSummary {
    /// Ownership claims sent to each neighbor.
    pub announced: usize,
    /// Received claims that changed a local ownership vector.
    pub applied: usize,
    /// Groups dropped because no member is owned here anymore.
    pub dropped: usize,
    /// Groups left with at least one member on another rank.
    pub not_local: usize,
}

/// Keeps the ownership vectors of one kind of bonded group consistent across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCommunicator {
    kind: GroupKind,
}

impl GroupCommunicator {
    pub fn new(kind: GroupKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    /// Refreshes the ownership vectors of this kind's groups.
    ///
    /// Every member owned here is claimed for this rank; the claims of groups spanning
    /// several ranks are exchanged with all unique neighbors in one round and applied to
    /// members owned elsewhere. With `incomplete == false` only groups flagged dirty are
    /// claimed. Groups without a local member are dropped.
    ///
    /// Collective over neighbors: every rank must call it for the same kind.
    #[instrument(skip_all, name = "migrate_groups", fields(rank = context.rank(), kind = %self.kind))]
    pub fn migrate_groups<T: Transport>(
        &self,
        incomplete: bool,
        context: &ExecutionContext,
        transport: &mut T,
        buffers: &mut BufferManager,
        system: &mut LocalSystem,
    ) -> Result<GroupSummary, CommError> {
        let me = context.rank() as u32;
        let particles = &system.particles;
        let table = system.groups.table_mut(self.kind);
        let mut summary = GroupSummary::default();

        // === Claim locally owned members ===
        let outgoing = buffers.buffer_mut::<RankUpdate>(BufferRole::RankUpdateSend)?;
        outgoing.clear();
        for (_, entry) in table.iter_mut() {
            if !incomplete && !entry.dirty {
                continue;
            }
            let record = &mut entry.record;
            for (slot, &member) in record.members.iter().enumerate() {
                if particles.is_local(member) {
                    record.ranks[slot] = me;
                }
            }
            if record.is_complete_on(me) {
                continue;
            }
            for (slot, &member) in record.members.iter().enumerate() {
                if particles.is_local(member) {
                    outgoing.push(RankUpdate {
                        group_tag: record.tag,
                        slot: slot as u8,
                        rank: me,
                    })?;
                }
            }
        }
        summary.announced = outgoing.len();
        let frame = outgoing.encode_range(0..outgoing.len())?;

        // === Exchange claims with every unique neighbor ===
        let tag = MessageTag::new(Channel::GroupRanks(self.kind), 0, 0);
        let neighbors = context.decomposition().unique_neighbors(context.rank());
        for nb in &neighbors {
            transport.post(nb.rank, tag, frame.clone())?;
        }
        let incoming = buffers.buffer_mut::<RankUpdate>(BufferRole::RankUpdateRecv)?;
        incoming.clear();
        for nb in &neighbors {
            incoming.decode_append(&transport.receive(nb.rank, tag)?)?;
        }
        for update in incoming.as_slice() {
            let Some(entry) = table.find_mut(update.group_tag) else {
                continue;
            };
            let slot = update.slot as usize;
            let Some(&member) = entry.record.members.get(slot) else {
                continue;
            };
            if !particles.is_local(member) && entry.record.ranks[slot] != update.rank {
                entry.record.ranks[slot] = update.rank;
                summary.applied += 1;
            }
        }

        // === Drop groups that left and recompute status ===
        summary.dropped = drop_orphans(table, particles);
        table.refresh_status(me);
        for (_, entry) in table.iter_mut() {
            entry.dirty = false;
        }
        summary.not_local = table.count_not_local();
        debug!(
            announced = summary.announced,
            applied = summary.applied,
            dropped = summary.dropped,
            not_local = summary.not_local,
            "Group ownership refreshed."
        );
        Ok(summary)
    }

    /// Adds to `plans` the face bits toward every foreign owner of a group member.
    ///
    /// `plans` is indexed like the local particles. Only [`GroupStatus::NotLocal`] groups
    /// contribute; when an owner sits at several offsets the one whose faces are closest
    /// to the particle is used. Owners that are not neighbors are skipped.
    pub fn mark_ghost_particles(
        &self,
        context: &ExecutionContext,
        system: &LocalSystem,
        plans: &mut [u32],
        mask: u32,
    ) {
        let me = context.rank() as u32;
        let particles = &system.particles;
        let bounds = context.local_bounds(&system.sim_box);
        let neighbors = context.decomposition().unique_neighbors(context.rank());

        for (_, entry) in system.groups.table(self.kind).iter() {
            if entry.status != GroupStatus::NotLocal {
                continue;
            }
            let record = &entry.record;
            for &member in &record.members {
                let Some(idx) = particles.index_of(member).filter(|&i| i < particles.n_local())
                else {
                    continue;
                };
                let particle = &particles.local()[idx];
                for &owner in record.ranks.iter().filter(|&&r| r != me) {
                    let Some(nb) = neighbors.iter().find(|nb| nb.rank as u32 == owner) else {
                        continue;
                    };
                    if let Some(offset) = closest_offset(nb, particle, &bounds) {
                        plans[idx] |= offset.direction_bits() & mask;
                    }
                }
            }
        }
    }
}

fn closest_offset(nb: &Neighbor, particle: &Particle, bounds: &Bounds) -> Option<Offset> {
    let distance = |offset: &Offset| -> f64 {
        (0..3)
            .map(|axis| match offset.0[axis] {
                1 => bounds.hi[axis] - particle.position[axis],
                -1 => particle.position[axis] - bounds.lo[axis],
                _ => 0.0,
            })
            .sum()
    };
    nb.offsets()
        .min_by(|a, b| distance(a).total_cmp(&distance(b)))
}

/// Removes every group none of whose members is owned here. Returns how many went.
pub(crate) fn drop_orphans(table: &mut GroupTable, particles: &ParticleData) -> usize {
    table.retain(|entry| entry.record.members.iter().any(|&m| particles.is_local(m)))
}

/// Merges a group record that arrived with a migrating member.
///
/// Members owned here are claimed for `me`. For the rest, the local record wins unless it
/// still names this rank, in which case the sender's view is newer.
pub(crate) fn merge_incoming(
    table: &mut GroupTable,
    particles: &ParticleData,
    mut incoming: GroupRecord,
    me: u32,
) -> Result<(), CommError> {
    let claim = |record: &mut GroupRecord| {
        for (slot, &member) in record.members.iter().enumerate() {
            if particles.is_local(member) {
                record.ranks[slot] = me;
            }
        }
    };

    match table.find_mut(incoming.tag) {
        Some(entry) => {
            let held = &mut entry.record;
            for slot in 0..held.members.len() {
                if held.ranks[slot] == me && !particles.is_local(held.members[slot]) {
                    held.ranks[slot] = incoming.ranks[slot];
                }
            }
            claim(held);
            entry.dirty = true;
        }
        None => {
            claim(&mut incoming);
            table.insert(incoming)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decomposition::DomainDecomposition;
    use crate::core::decomposition::offset::{EAST, WEST};
    use crate::core::models::group::BondedGroups;
    use crate::core::models::sim_box::SimBox;
    use crate::engine::transport::LoopbackTransport;
    use nalgebra::Point3;
    use std::sync::Arc;

    fn particle(tag: Tag, x: f64) -> Particle {
        Particle::new(tag, Point3::new(x, 0.0, 0.0))
    }

    #[test]
    fn single_rank_groups_are_complete_and_orphans_are_dropped() {
        let ctx = ExecutionContext::single([true; 3]).unwrap();
        let particles = ParticleData::with_local(4, vec![particle(0, 0.0), particle(1, 1.0)]).unwrap();
        let mut groups = BondedGroups::new();
        let table = groups.table_mut(GroupKind::Bond);
        table.insert(GroupRecord::new(10, 0, &[0, 1], 3)).unwrap();
        table.insert(GroupRecord::new(11, 0, &[2, 3], 0)).unwrap();
        let mut system = LocalSystem::new(particles, groups, SimBox::cubic(10.0));

        let gc = GroupCommunicator::new(GroupKind::Bond);
        let summary = gc
            .migrate_groups(
                true,
                &ctx,
                &mut LoopbackTransport::new(),
                &mut BufferManager::default(),
                &mut system,
            )
            .unwrap();

        let table = system.groups.table(GroupKind::Bond);
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.not_local, 0);
        assert_eq!(table.len(), 1);
        let entry = table.find(10).unwrap();
        assert_eq!(entry.record.ranks.as_slice(), &[0, 0]);
        assert_eq!(entry.status, GroupStatus::Complete);
        assert!(!entry.dirty);
    }

    #[test]
    fn clean_groups_are_skipped_without_incomplete() {
        let ctx = ExecutionContext::single([true; 3]).unwrap();
        let particles = ParticleData::with_local(2, vec![particle(0, 0.0), particle(1, 1.0)]).unwrap();
        let mut groups = BondedGroups::new();
        groups
            .table_mut(GroupKind::Bond)
            .insert(GroupRecord::new(0, 0, &[0, 1], 7))
            .unwrap();
        groups.table_mut(GroupKind::Bond).find_mut(0).unwrap().dirty = false;
        let mut system = LocalSystem::new(particles, groups, SimBox::cubic(10.0));

        GroupCommunicator::new(GroupKind::Bond)
            .migrate_groups(
                false,
                &ctx,
                &mut LoopbackTransport::new(),
                &mut BufferManager::default(),
                &mut system,
            )
            .unwrap();
        let entry = system.groups.table(GroupKind::Bond).find(0).unwrap();
        assert_eq!(entry.record.ranks.as_slice(), &[7, 7]);
        assert_eq!(entry.status, GroupStatus::NotLocal);
    }

    #[test]
    fn marks_point_toward_the_nearest_face_of_the_owner() {
        let decomposition = Arc::new(DomainDecomposition::new([2, 1, 1], [true; 3]).unwrap());
        let ctx = ExecutionContext::new(0, decomposition).unwrap();
        // Rank 0 owns x in [-5, 0); rank 1 sits both east and west of it.
        let particles =
            ParticleData::with_local(3, vec![particle(0, -1.0), particle(2, -4.5)]).unwrap();
        let mut groups = BondedGroups::new();
        let table = groups.table_mut(GroupKind::Bond);
        let mut near_east = GroupRecord::new(0, 0, &[0, 1], 0);
        near_east.ranks[1] = 1;
        let mut near_west = GroupRecord::new(1, 0, &[2, 1], 0);
        near_west.ranks[1] = 1;
        table.insert(near_east).unwrap();
        table.insert(near_west).unwrap();
        table.refresh_status(0);
        let system = LocalSystem::new(particles, groups, SimBox::cubic(10.0));

        let mut plans = vec![0u32; 2];
        GroupCommunicator::new(GroupKind::Bond).mark_ghost_particles(
            &ctx,
            &system,
            &mut plans,
            u32::MAX,
        );
        assert_eq!(plans, vec![EAST, WEST]);

        let mut masked = vec![0u32; 2];
        GroupCommunicator::new(GroupKind::Bond).mark_ghost_particles(
            &ctx,
            &system,
            &mut masked,
            WEST,
        );
        assert_eq!(masked, vec![0, WEST]);
    }

    #[test]
    fn merge_prefers_local_ownership_and_newer_foreign_views() {
        let particles = ParticleData::with_local(3, vec![particle(1, 0.0)]).unwrap();
        let mut table = GroupTable::new(GroupKind::Angle);
        let mut held = GroupRecord::new(5, 0, &[0, 1, 2], 0);
        held.ranks[2] = 2;
        table.insert(held).unwrap();

        let mut incoming = GroupRecord::new(5, 0, &[0, 1, 2], 3);
        incoming.ranks[1] = 0;
        merge_incoming(&mut table, &particles, incoming, 0).unwrap();

        let merged = &table.find(5).unwrap().record;
        // Slot 0 left this rank, slot 1 is here, slot 2 keeps the local view.
        assert_eq!(merged.ranks.as_slice(), &[3, 0, 2]);

        let fresh = GroupRecord::new(6, 0, &[1, 2, 0], 4);
        merge_incoming(&mut table, &particles, fresh, 0).unwrap();
        assert_eq!(table.find(6).unwrap().record.ranks.as_slice(), &[0, 4, 4]);
    }
}
