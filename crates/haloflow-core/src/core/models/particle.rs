use super::ids::{NOT_LOCAL, Tag};
use nalgebra::{Point3, Quaternion, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ParticleDataError {
    #[error("Particle tag {tag} is outside the global tag range 0..{n_global}")]
    TagOutOfRange { tag: Tag, n_global: usize },

    #[error("Particle tag {tag} is already present on this rank")]
    DuplicateTag { tag: Tag },
}

/// The complete state of one particle (or rigid body) as owned by exactly one rank.
///
/// Rigid bodies are represented by their center of mass: the translational fields
/// describe the body as a whole, while `orientation`, `angmom` and `inertia` describe its
/// rotation about the principal axes. The record is `Copy` so that it can be moved
/// between ranks and buffers without allocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    /// Global tag, unique and stable for the whole run.
    pub tag: Tag,
    /// Particle type index.
    pub type_id: u32,
    /// Position inside the global box.
    pub position: Point3<f64>,
    /// Number of periodic images crossed along each axis.
    pub image: Vector3<i32>,
    /// Center-of-mass velocity.
    pub velocity: Vector3<f64>,
    /// Total mass.
    pub mass: f64,
    /// Electric charge.
    pub charge: f64,
    /// Interaction diameter.
    pub diameter: f64,
    /// Orientation quaternion mapping body frame to space frame.
    pub orientation: Quaternion<f64>,
    /// Conjugate quaternion momentum (`2 q ⊗ (0, L_body)`).
    pub angmom: Quaternion<f64>,
    /// Principal moments of inertia. A zero moment removes that rotational degree of freedom.
    pub inertia: Vector3<f64>,
    /// Net force in the space frame, written by force computes.
    pub force: Vector3<f64>,
    /// Net torque in the space frame, written by force computes.
    pub torque: Vector3<f64>,
    /// Diagonal of the per-particle virial tensor.
    pub virial: Vector3<f64>,
    /// Potential energy attributed to this particle.
    pub potential_energy: f64,
}

impl Particle {
    /// Creates a unit-mass point particle at rest with identity orientation.
    ///
    /// # Arguments
    ///
    /// * `tag` - The global tag of the particle.
    /// * `position` - The initial position.
    pub fn new(tag: Tag, position: Point3<f64>) -> Self {
        Self {
            tag,
            type_id: 0,
            position,
            image: Vector3::zeros(),
            velocity: Vector3::zeros(),
            mass: 1.0,
            charge: 0.0,
            diameter: 1.0,
            orientation: Quaternion::new(1.0, 0.0, 0.0, 0.0),
            angmom: Quaternion::new(0.0, 0.0, 0.0, 0.0),
            inertia: Vector3::zeros(),
            force: Vector3::zeros(),
            torque: Vector3::zeros(),
            virial: Vector3::zeros(),
            potential_energy: 0.0,
        }
    }

    /// Clears the accumulated force, torque, virial and energy.
    pub fn reset_accumulators(&mut self) {
        self.force = Vector3::zeros();
        self.torque = Vector3::zeros();
        self.virial = Vector3::zeros();
        self.potential_energy = 0.0;
    }
}

/// Per-rank particle store.
///
/// Locally owned particles occupy indices `0..n_local`; read-only ghost copies of
/// particles owned by neighbor ranks follow them. Local indices are unstable: every
/// migration reorders the store and rebuilds the reverse tag lookup (`rtag`), so callers
/// must never hold an index across a communication call.
#[derive(Debug, Clone, Default)]
pub struct ParticleData {
    particles: Vec<Particle>,
    n_local: usize,
    rtag: Vec<u32>,
}

impl ParticleData {
    /// Creates an empty store for a run with `n_global` particles in total.
    pub fn new(n_global: usize) -> Self {
        Self {
            particles: Vec::new(),
            n_local: 0,
            rtag: vec![NOT_LOCAL; n_global],
        }
    }

    /// Creates a store holding the given locally owned particles.
    ///
    /// # Errors
    ///
    /// Returns [`ParticleDataError`] if a tag is out of range or appears twice.
    pub fn with_local(
        n_global: usize,
        particles: Vec<Particle>,
    ) -> Result<Self, ParticleDataError> {
        let mut data = Self::new(n_global);
        data.add_local(particles)?;
        Ok(data)
    }

    pub fn n_global(&self) -> usize {
        self.rtag.len()
    }

    pub fn n_local(&self) -> usize {
        self.n_local
    }

    pub fn n_ghost(&self) -> usize {
        self.particles.len() - self.n_local
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn local(&self) -> &[Particle] {
        &self.particles[..self.n_local]
    }

    pub fn local_mut(&mut self) -> &mut [Particle] {
        &mut self.particles[..self.n_local]
    }

    pub fn ghosts(&self) -> &[Particle] {
        &self.particles[self.n_local..]
    }

    /// All particles, local first, then ghosts.
    pub fn all(&self) -> &[Particle] {
        &self.particles
    }

    pub(crate) fn all_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }

    pub fn get(&self, index: usize) -> Option<&Particle> {
        self.particles.get(index)
    }

    /// Returns the current index of `tag` on this rank, local or ghost.
    pub fn index_of(&self, tag: Tag) -> Option<usize> {
        match self.rtag.get(tag as usize) {
            Some(&idx) if idx != NOT_LOCAL => Some(idx as usize),
            _ => None,
        }
    }

    /// Returns `true` if `tag` is owned by this rank (ghost copies do not count).
    pub fn is_local(&self, tag: Tag) -> bool {
        self.index_of(tag).is_some_and(|idx| idx < self.n_local)
    }

    /// Looks up a particle by tag among local particles and ghosts.
    pub fn find(&self, tag: Tag) -> Option<&Particle> {
        self.index_of(tag).map(|idx| &self.particles[idx])
    }

    /// Appends newly owned particles. Any ghosts are discarded first.
    ///
    /// # Errors
    ///
    /// Returns [`ParticleDataError::TagOutOfRange`] or [`ParticleDataError::DuplicateTag`].
    pub fn add_local(&mut self, incoming: Vec<Particle>) -> Result<(), ParticleDataError> {
        self.clear_ghosts();
        for p in incoming {
            let slot = self.rtag.get(p.tag as usize).copied().ok_or(
                ParticleDataError::TagOutOfRange {
                    tag: p.tag,
                    n_global: self.rtag.len(),
                },
            )?;
            if slot != NOT_LOCAL {
                return Err(ParticleDataError::DuplicateTag { tag: p.tag });
            }
            self.rtag[p.tag as usize] = self.particles.len() as u32;
            self.particles.push(p);
            self.n_local = self.particles.len();
        }
        Ok(())
    }

    /// Removes every local particle matching `leaving` and returns the removed records.
    ///
    /// Ghosts are discarded and the reverse lookup is rebuilt.
    pub fn take_local_where<F>(&mut self, mut leaving: F) -> Vec<Particle>
    where
        F: FnMut(&Particle) -> bool,
    {
        self.clear_ghosts();
        let (gone, kept): (Vec<Particle>, Vec<Particle>) =
            self.particles.drain(..).partition(|p| leaving(p));
        self.particles = kept;
        self.n_local = self.particles.len();
        self.rebuild_rtag();
        gone
    }

    /// Drops every ghost copy and forgets their tags.
    pub fn clear_ghosts(&mut self) {
        for p in &self.particles[self.n_local..] {
            if let Some(slot) = self.rtag.get_mut(p.tag as usize) {
                if *slot as usize >= self.n_local {
                    *slot = NOT_LOCAL;
                }
            }
        }
        self.particles.truncate(self.n_local);
    }

    /// Appends ghost copies and returns the index range they occupy.
    ///
    /// When a tag already has a copy on this rank the lookup keeps pointing at the
    /// earlier one, so local particles always win over their own periodic images.
    pub fn append_ghosts<I>(&mut self, ghosts: I) -> std::ops::Range<usize>
    where
        I: IntoIterator<Item = Particle>,
    {
        let start = self.particles.len();
        for g in ghosts {
            if let Some(slot) = self.rtag.get_mut(g.tag as usize) {
                if *slot == NOT_LOCAL {
                    *slot = self.particles.len() as u32;
                }
            }
            self.particles.push(g);
        }
        start..self.particles.len()
    }

    /// Recomputes the tag lookup from scratch.
    pub fn rebuild_rtag(&mut self) {
        self.rtag.iter_mut().for_each(|slot| *slot = NOT_LOCAL);
        for (idx, p) in self.particles.iter().enumerate() {
            if let Some(slot) = self.rtag.get_mut(p.tag as usize) {
                if *slot == NOT_LOCAL {
                    *slot = idx as u32;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn particle_at(tag: Tag, x: f64) -> Particle {
        Particle::new(tag, Point3::new(x, 0.0, 0.0))
    }

    #[test]
    fn add_local_registers_tags() {
        let data =
            ParticleData::with_local(4, vec![particle_at(2, 0.0), particle_at(0, 1.0)]).unwrap();
        assert_eq!(data.n_local(), 2);
        assert_eq!(data.index_of(2), Some(0));
        assert_eq!(data.index_of(0), Some(1));
        assert_eq!(data.index_of(1), None);
        assert!(data.is_local(0));
    }

    #[test]
    fn add_local_rejects_duplicates_and_out_of_range_tags() {
        let mut data = ParticleData::new(2);
        assert_eq!(
            data.add_local(vec![particle_at(5, 0.0)]),
            Err(ParticleDataError::TagOutOfRange { tag: 5, n_global: 2 })
        );
        data.add_local(vec![particle_at(1, 0.0)]).unwrap();
        assert_eq!(
            data.add_local(vec![particle_at(1, 0.0)]),
            Err(ParticleDataError::DuplicateTag { tag: 1 })
        );
    }

    #[test]
    fn take_local_where_removes_and_reindexes() {
        let mut data = ParticleData::with_local(
            3,
            vec![particle_at(0, 0.0), particle_at(1, 5.0), particle_at(2, 1.0)],
        )
        .unwrap();
        let gone = data.take_local_where(|p| p.position.x > 4.0);
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].tag, 1);
        assert_eq!(data.n_local(), 2);
        assert_eq!(data.index_of(1), None);
        assert_eq!(data.index_of(2), Some(1));
    }

    #[test]
    fn ghosts_with_unknown_tags_are_cleared_without_panicking() {
        let mut data = ParticleData::with_local(2, vec![particle_at(0, 0.0)]).unwrap();
        let range = data.append_ghosts(vec![particle_at(9, 1.0), particle_at(1, 2.0)]);
        assert_eq!(range, 1..3);
        assert_eq!(data.index_of(9), None);
        assert_eq!(data.index_of(1), Some(2));

        data.clear_ghosts();
        assert_eq!(data.n_ghost(), 0);
        assert_eq!(data.index_of(1), None);
        assert_eq!(data.index_of(0), Some(0));
    }

    #[test]
    fn ghosts_are_appended_after_locals_and_cleared() {
        let mut data = ParticleData::with_local(4, vec![particle_at(0, 0.0)]).unwrap();
        let range = data.append_ghosts(vec![particle_at(3, 2.0), particle_at(0, 9.0)]);
        assert_eq!(range, 1..3);
        assert_eq!(data.n_ghost(), 2);
        assert_eq!(data.index_of(3), Some(1));
        assert_eq!(data.index_of(0), Some(0));
        assert!(!data.is_local(3));

        data.clear_ghosts();
        assert_eq!(data.n_ghost(), 0);
        assert_eq!(data.index_of(3), None);
        assert_eq!(data.index_of(0), Some(0));
    }
}
