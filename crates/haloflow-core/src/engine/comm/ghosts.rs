use super::Communicator;
use crate::core::decomposition::StageLink;
use crate::core::models::ids::Tag;
use crate::core::models::particle::Particle;
use crate::core::models::system::LocalSystem;
use crate::engine::buffers::{BufferManager, BufferRole};
use crate::engine::config::GhostField;
use crate::engine::error::CommError;
use crate::engine::transport::{Channel, MessageTag, Transport};
use nalgebra::{Point3, Quaternion, Vector3};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::ops::Range;
use tracing::{debug, instrument};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Validity of the ghost list held by a communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GhostStatus {
    /// No list, or the list predates the last migration or stage change.
    Invalid,
    /// Built by a full exchange in topology epoch `epoch`.
    Built { epoch: u64 },
    /// A split update was started and not yet finished.
    UpdateInFlight { epoch: u64 },
}

impl GhostStatus {
    pub fn name(&self) -> &'static str {
        match self {
            GhostStatus::Invalid => "invalid",
            GhostStatus::Built { .. } => "built",
            GhostStatus::UpdateInFlight { .. } => "update in flight",
        }
    }
}

/// Which particles went where during the last full exchange, per stage and stage link.
#[derive(Debug, Clone, Default)]
pub(crate) struct GhostLists {
    pub(crate) send: Vec<Vec<Vec<usize>>>,
    pub(crate) recv: Vec<Vec<Range<usize>>>,
}

impl GhostLists {
    fn with_stages(n: usize) -> Self {
        Self {
            send: vec![Vec::new(); n],
            recv: vec![Vec::new(); n],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GhostSummary {
    /// Ghosts sent in each stage, counting every link.
    pub sent: Vec<usize>,
    /// Ghosts received in each stage.
    pub received: Vec<usize>,
}

impl GhostSummary {
    pub fn total_received(&self) -> usize {
        self.received.iter().sum()
    }
}

/// The ghosts one link sends, and how to present them to the receiver.
#[derive(Debug, Clone, Copy)]
pub struct GhostSource<'a> {
    /// Local particles followed by ghosts received in earlier stages.
    pub particles: &'a [Particle],
    /// Communication plan of every entry of `particles`.
    pub plans: &'a [u32],
    pub indices: &'a [usize],
    /// Added to positions. Compensates crossing the periodic boundary of the box.
    pub shift: Vector3<f64>,
    /// Face bits handled by the current stage, cleared from the forwarded plans.
    pub served: u32,
}

fn encode_values<V, I>(
    buffers: &mut BufferManager,
    field: GhostField,
    values: I,
) -> Result<Vec<u8>, CommError>
where
    V: Serialize + Send + 'static,
    I: IntoIterator<Item = V>,
{
    let buffer = buffers.buffer_mut::<V>(BufferRole::GhostSend(field))?;
    buffer.clear();
    buffer.extend(values)?;
    buffer.encode_range(0..buffer.len())
}

fn decode_values<V>(
    buffers: &mut BufferManager,
    field: GhostField,
    frame: &[u8],
) -> Result<Vec<V>, CommError>
where
    V: DeserializeOwned + Clone + Send + 'static,
{
    let buffer = buffers.buffer_mut::<V>(BufferRole::GhostRecv(field))?;
    buffer.clear();
    let range = buffer.decode_append(frame)?;
    Ok(buffer.as_slice()[range].to_vec())
}

/// Packs one field of the ghosts selected by `source` into a wire frame.
pub fn pack_ghost_field(
    buffers: &mut BufferManager,
    field: GhostField,
    source: &GhostSource<'_>,
) -> Result<Vec<u8>, CommError> {
    let selected = source.indices.iter().map(|&i| &source.particles[i]);
    match field {
        GhostField::Tag => encode_values::<Tag, _>(buffers, field, selected.map(|p| p.tag)),
        GhostField::Plan => {
            let plans = source
                .indices
                .iter()
                .map(|&i| source.plans.get(i).copied().unwrap_or(0) & !source.served);
            encode_values::<u32, _>(buffers, field, plans)
        }
        GhostField::Position => {
            let shift = source.shift;
            encode_values::<([f64; 3], u32), _>(
                buffers,
                field,
                selected.map(|p| {
                    let r = p.position.coords + shift;
                    ([r.x, r.y, r.z], p.type_id)
                }),
            )
        }
        GhostField::Velocity => encode_values::<([f64; 3], f64), _>(
            buffers,
            field,
            selected.map(|p| ([p.velocity.x, p.velocity.y, p.velocity.z], p.mass)),
        ),
        GhostField::Charge => encode_values::<f64, _>(buffers, field, selected.map(|p| p.charge)),
        GhostField::Diameter => {
            encode_values::<f64, _>(buffers, field, selected.map(|p| p.diameter))
        }
        GhostField::Orientation => encode_values::<[f64; 4], _>(
            buffers,
            field,
            selected.map(|p| {
                let q = p.orientation;
                [q.w, q.i, q.j, q.k]
            }),
        ),
    }
}

/// Writes one received field into `ghosts` (and `plans` for [`GhostField::Plan`]).
///
/// Returns the number of entries the frame held. Entries beyond `ghosts.len()` are
/// ignored, so callers compare the count against what they expected.
pub fn unpack_ghost_field(
    buffers: &mut BufferManager,
    field: GhostField,
    frame: &[u8],
    ghosts: &mut [Particle],
    plans: &mut [u32],
) -> Result<usize, CommError> {
    fn apply<V>(
        values: Vec<V>,
        ghosts: &mut [Particle],
        mut f: impl FnMut(&mut Particle, V),
    ) -> usize {
        let n = values.len();
        for (g, v) in ghosts.iter_mut().zip(values) {
            f(g, v);
        }
        n
    }

    let count = match field {
        GhostField::Tag => apply(decode_values::<Tag>(buffers, field, frame)?, ghosts, |g, t| {
            g.tag = t
        }),
        GhostField::Plan => {
            let values = decode_values::<u32>(buffers, field, frame)?;
            for (slot, v) in plans.iter_mut().zip(&values) {
                *slot = *v;
            }
            values.len()
        }
        GhostField::Position => apply(
            decode_values::<([f64; 3], u32)>(buffers, field, frame)?,
            ghosts,
            |g, (r, type_id)| {
                g.position = Point3::new(r[0], r[1], r[2]);
                g.type_id = type_id;
            },
        ),
        GhostField::Velocity => apply(
            decode_values::<([f64; 3], f64)>(buffers, field, frame)?,
            ghosts,
            |g, (v, mass)| {
                g.velocity = Vector3::new(v[0], v[1], v[2]);
                g.mass = mass;
            },
        ),
        GhostField::Charge => apply(decode_values::<f64>(buffers, field, frame)?, ghosts, |g, c| {
            g.charge = c
        }),
        GhostField::Diameter => apply(
            decode_values::<f64>(buffers, field, frame)?,
            ghosts,
            |g, d| g.diameter = d,
        ),
        GhostField::Orientation => apply(
            decode_values::<[f64; 4]>(buffers, field, frame)?,
            ghosts,
            |g, q| g.orientation = Quaternion::new(q[0], q[1], q[2], q[3]),
        ),
    };
    Ok(count)
}

fn shift_of(link: &StageLink, lengths: &Vector3<f64>) -> Vector3<f64> {
    Vector3::from_fn(|axis, _| -(link.wrap[axis] as f64) * lengths[axis])
}

fn ghost_tag(field: GhostField, stage: usize, slot: usize) -> MessageTag {
    MessageTag::new(Channel::Ghost(field), stage as u8, slot as u8)
}

impl<T: Transport> Communicator<T> {
    /// Rebuilds the ghost halo from scratch.
    ///
    /// Local particles within the ghost width of a decomposed face, and members of
    /// groups spanning ranks, are sent with every field to the neighbors their plans
    /// point at. Ghosts carry their remaining plan so that later stages forward them to
    /// edge and corner neighbors. The send lists and receive ranges are kept for
    /// [`begin_update_ghosts`](Self::begin_update_ghosts).
    ///
    /// # Errors
    ///
    /// Returns [`CommError::MigrationPending`] while a migration is required.
    #[instrument(skip_all, name = "exchange_ghosts", fields(rank = self.context.rank()))]
    pub fn exchange_ghosts(&mut self, system: &mut LocalSystem) -> Result<GhostSummary, CommError> {
        if self.force_migrate {
            return Err(CommError::MigrationPending);
        }
        system.particles.clear_ghosts();
        self.ghost_status = GhostStatus::Invalid;

        // === Phase 1: Communication plans ===
        let mut plans = self.proximity_plans(system);
        self.halo_plans.clone_from(&plans);
        let mask = self.stages.combined_mask();
        for gc in &self.groups {
            gc.mark_ghost_particles(&self.context, system, &mut plans, mask);
        }

        // === Phase 2: Staged exchange ===
        let num_stages = self.stages.num_stages();
        let mut lists = GhostLists::with_stages(num_stages);
        let mut summary = GhostSummary::default();
        let lengths = system.sim_box.lengths();

        for stage_idx in 0..num_stages {
            let stage = &self.stages.stages()[stage_idx];
            let mut sent = 0;
            for link in &stage.links {
                let bits = link.offset.direction_bits();
                let indices: Vec<usize> = (0..system.particles.len())
                    .filter(|&i| bits & !(plans[i] & stage.mask) == 0)
                    .collect();
                let source = GhostSource {
                    particles: system.particles.all(),
                    plans: &plans,
                    indices: &indices,
                    shift: shift_of(link, &lengths),
                    served: stage.mask,
                };
                for field in GhostField::ALL {
                    let frame = pack_ghost_field(&mut self.buffers, field, &source)?;
                    self.transport.post(
                        link.neighbor,
                        ghost_tag(field, stage_idx, link.offset.index()),
                        frame,
                    )?;
                }
                sent += indices.len();
                lists.send[stage_idx].push(indices);
            }

            let mut received = 0;
            for link in &stage.links {
                let (ghosts, ghost_plans) =
                    receive_ghosts(&mut self.transport, &mut self.buffers, stage_idx, link)?;
                let range = system.particles.append_ghosts(ghosts);
                plans.extend(ghost_plans);
                received += range.len();
                lists.recv[stage_idx].push(range);
            }
            self.transport.barrier()?;
            summary.sent.push(sent);
            summary.received.push(received);
        }

        self.ghost_lists = lists;
        self.epoch += 1;
        self.ghost_status = GhostStatus::Built { epoch: self.epoch };
        debug!(
            epoch = self.epoch,
            ghosts = system.particles.n_ghost(),
            "Ghost list rebuilt."
        );
        Ok(summary)
    }

    /// Posts the first stage of a split ghost update.
    ///
    /// Only the fields selected in the configuration are refreshed, along the lists of
    /// the last full exchange. Local work may run before
    /// [`finish_update_ghosts`](Self::finish_update_ghosts) completes the update.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::StaleGhostList`] unless a ghost list was built in the current
    /// topology epoch and no update is already in flight.
    pub fn begin_update_ghosts(&mut self, system: &LocalSystem) -> Result<(), CommError> {
        let GhostStatus::Built { epoch } = self.ghost_status else {
            return Err(CommError::StaleGhostList);
        };
        if self.stages.num_stages() > 0 {
            self.post_ghost_update(0, system)?;
        }
        self.ghost_status = GhostStatus::UpdateInFlight { epoch };
        Ok(())
    }

    /// Receives the first stage of an update and runs the remaining stages.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::GhostUpdateNotStarted`] without a matching begin and
    /// [`CommError::GhostCountMismatch`] if a neighbor's list disagrees with ours.
    pub fn finish_update_ghosts(&mut self, system: &mut LocalSystem) -> Result<(), CommError> {
        let GhostStatus::UpdateInFlight { epoch } = self.ghost_status else {
            return Err(CommError::GhostUpdateNotStarted);
        };
        self.ghost_status = GhostStatus::Invalid;
        for stage_idx in 0..self.stages.num_stages() {
            if stage_idx > 0 {
                self.post_ghost_update(stage_idx, system)?;
            }
            self.receive_ghost_update(stage_idx, system)?;
            self.transport.barrier()?;
        }
        self.ghost_status = GhostStatus::Built { epoch };
        Ok(())
    }

    pub(super) fn proximity_plans(&self, system: &LocalSystem) -> Vec<u32> {
        let bounds = self.context.local_bounds(&system.sim_box);
        let width = self.config.ghost_width;
        let axes: Vec<usize> = (0..3)
            .filter(|&a| self.context.decomposition().is_decomposed(a))
            .collect();
        let plan_of = |p: &Particle| {
            axes.iter().fold(0u32, |plan, &axis| {
                let mut plan = plan;
                if bounds.hi[axis] - p.position[axis] < width {
                    plan |= 1 << (2 * axis);
                }
                if p.position[axis] - bounds.lo[axis] < width {
                    plan |= 2 << (2 * axis);
                }
                plan
            })
        };

        #[cfg(not(feature = "parallel"))]
        let plans: Vec<u32> = system.particles.local().iter().map(plan_of).collect();

        #[cfg(feature = "parallel")]
        let plans: Vec<u32> = system.particles.local().par_iter().map(plan_of).collect();

        plans
    }

    fn post_ghost_update(&mut self, stage_idx: usize, system: &LocalSystem) -> Result<(), CommError> {
        let stage = &self.stages.stages()[stage_idx];
        let lengths = system.sim_box.lengths();
        let fields = self.config.update_fields.fields();
        for (link, indices) in stage.links.iter().zip(&self.ghost_lists.send[stage_idx]) {
            let source = GhostSource {
                particles: system.particles.all(),
                plans: &[],
                indices,
                shift: shift_of(link, &lengths),
                served: stage.mask,
            };
            for &field in &fields {
                let frame = pack_ghost_field(&mut self.buffers, field, &source)?;
                self.transport.post(
                    link.neighbor,
                    ghost_tag(field, stage_idx, link.offset.index()),
                    frame,
                )?;
            }
        }
        Ok(())
    }

    fn receive_ghost_update(
        &mut self,
        stage_idx: usize,
        system: &mut LocalSystem,
    ) -> Result<(), CommError> {
        let stage = &self.stages.stages()[stage_idx];
        let fields = self.config.update_fields.fields();
        for (link, range) in stage.links.iter().zip(&self.ghost_lists.recv[stage_idx]) {
            let slot = link.offset.opposite().index();
            let targets = &mut system.particles.all_mut()[range.clone()];
            for &field in &fields {
                let frame = self
                    .transport
                    .receive(link.neighbor, ghost_tag(field, stage_idx, slot))?;
                let found = unpack_ghost_field(&mut self.buffers, field, &frame, targets, &mut [])?;
                if found != range.len() {
                    return Err(CommError::GhostCountMismatch {
                        stage: stage_idx,
                        source_rank: link.neighbor,
                        expected: range.len(),
                        found,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Receives every field of the ghosts one link delivers in a full exchange.
fn receive_ghosts<T: Transport>(
    transport: &mut T,
    buffers: &mut BufferManager,
    stage_idx: usize,
    link: &StageLink,
) -> Result<(Vec<Particle>, Vec<u32>), CommError> {
    let slot = link.offset.opposite().index();
    let frame = transport.receive(link.neighbor, ghost_tag(GhostField::Tag, stage_idx, slot))?;
    let tags = decode_values::<Tag>(buffers, GhostField::Tag, &frame)?;
    let expected = tags.len();
    let mut ghosts: Vec<Particle> = tags
        .into_iter()
        .map(|tag| Particle::new(tag, Point3::origin()))
        .collect();
    let mut plans = vec![0u32; expected];

    for field in GhostField::ALL.into_iter().filter(|&f| f != GhostField::Tag) {
        let frame = transport.receive(link.neighbor, ghost_tag(field, stage_idx, slot))?;
        let found = unpack_ghost_field(buffers, field, &frame, &mut ghosts, &mut plans)?;
        if found != expected {
            return Err(CommError::GhostCountMismatch {
                stage: stage_idx,
                source_rank: link.neighbor,
                expected,
                found,
            });
        }
    }
    Ok((ghosts, plans))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::transport::LoopbackTransport;

    #[test]
    fn every_field_survives_a_loopback_round_trip() {
        let mut original = Particle::new(42, Point3::new(1.25, -3.5, 0.125));
        original.type_id = 3;
        original.velocity = Vector3::new(0.1, -0.2, 0.3);
        original.mass = 2.5;
        original.charge = -1.0;
        original.diameter = 0.75;
        original.orientation = Quaternion::new(0.5, 0.5, -0.5, 0.5);
        let particles = [Particle::new(7, Point3::origin()), original];
        let plans = [0u32, 0b11_0101];

        let mut transport = LoopbackTransport::new();
        let mut buffers = BufferManager::default();
        let source = GhostSource {
            particles: &particles,
            plans: &plans,
            indices: &[1],
            shift: Vector3::zeros(),
            served: 0b00_0011,
        };
        for field in GhostField::ALL {
            let frame = pack_ghost_field(&mut buffers, field, &source).unwrap();
            transport.post(0, ghost_tag(field, 0, 4), frame).unwrap();
        }

        let mut ghosts = vec![Particle::new(0, Point3::origin())];
        let mut received_plans = vec![0u32];
        for field in GhostField::ALL {
            let frame = transport.receive(0, ghost_tag(field, 0, 4)).unwrap();
            let n = unpack_ghost_field(&mut buffers, field, &frame, &mut ghosts, &mut received_plans)
                .unwrap();
            assert_eq!(n, 1);
        }

        let ghost = ghosts[0];
        assert_eq!(ghost.tag, 42);
        assert_eq!(ghost.type_id, 3);
        assert_eq!(received_plans[0], 0b11_0100);
        assert!((ghost.position - original.position).norm() < 1e-14);
        assert!((ghost.velocity - original.velocity).norm() < 1e-14);
        assert!((ghost.mass - 2.5).abs() < 1e-14);
        assert!((ghost.charge + 1.0).abs() < 1e-14);
        assert!((ghost.diameter - 0.75).abs() < 1e-14);
        assert!((ghost.orientation.coords - original.orientation.coords).norm() < 1e-14);
    }

    #[test]
    fn positions_are_shifted_across_the_periodic_boundary() {
        let particles = [Particle::new(0, Point3::new(4.8, 0.0, 0.0))];
        let link = StageLink {
            offset: crate::core::decomposition::Offset::new(1, 0, 0),
            neighbor: 0,
            wrap: [1, 0, 0],
        };
        let shift = shift_of(&link, &Vector3::new(10.0, 10.0, 10.0));
        let mut buffers = BufferManager::default();
        let frame = pack_ghost_field(
            &mut buffers,
            GhostField::Position,
            &GhostSource {
                particles: &particles,
                plans: &[],
                indices: &[0],
                shift,
                served: 0,
            },
        )
        .unwrap();
        let mut ghosts = vec![Particle::new(0, Point3::origin())];
        unpack_ghost_field(&mut buffers, GhostField::Position, &frame, &mut ghosts, &mut [])
            .unwrap();
        assert!((ghosts[0].position.x + 5.2).abs() < 1e-12);
    }

    #[test]
    fn short_frames_are_reported_by_count() {
        let particles = [
            Particle::new(0, Point3::origin()),
            Particle::new(1, Point3::origin()),
        ];
        let mut buffers = BufferManager::default();
        let frame = pack_ghost_field(
            &mut buffers,
            GhostField::Charge,
            &GhostSource {
                particles: &particles,
                plans: &[],
                indices: &[0],
                shift: Vector3::zeros(),
                served: 0,
            },
        )
        .unwrap();
        let mut ghosts = particles.to_vec();
        let n = unpack_ghost_field(&mut buffers, GhostField::Charge, &frame, &mut ghosts, &mut [])
            .unwrap();
        assert_eq!(n, 1);
    }
}
