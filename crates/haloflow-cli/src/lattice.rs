use crate::config::LatticeSpec;
use crate::error::Result;
use haloflow::core::decomposition::DomainDecomposition;
use haloflow::core::models::group::{BondedGroups, GroupKind, GroupRecord};
use haloflow::core::models::particle::{Particle, ParticleData};
use haloflow::core::models::sim_box::SimBox;
use haloflow::core::models::system::LocalSystem;
use haloflow::engine::error::EngineError;
use nalgebra::{Point3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

pub fn sim_box(spec: &LatticeSpec) -> SimBox {
    let sim_box = SimBox::new(spec.box_lengths()).with_periodic(spec.periodic);
    if spec.two_dimensional {
        sim_box.two_dimensional()
    } else {
        sim_box
    }
}

/// Every body of the lattice, tagged in x-fastest order, with velocities drawn at the
/// lattice temperature and the total momentum removed.
pub fn bodies(spec: &LatticeSpec) -> Vec<Particle> {
    let lo = -0.5 * spec.box_lengths();
    let mut rng = StdRng::seed_from_u64(spec.seed);
    // Uniform on [-1/2, 1/2) scaled to unit variance.
    let sigma = (12.0 * spec.thermal_energy / spec.mass).sqrt();
    let dims = if spec.two_dimensional { 2 } else { 3 };

    let mut particles = Vec::with_capacity(spec.len());
    for k in 0..spec.counts[2] {
        for j in 0..spec.counts[1] {
            for i in 0..spec.counts[0] {
                let cell = Vector3::new(i as f64 + 0.5, j as f64 + 0.5, k as f64 + 0.5);
                let mut position = Point3::from(lo + cell * spec.spacing);
                if spec.two_dimensional {
                    position.z = 0.0;
                }
                let mut p = Particle::new(particles.len() as u32, position);
                p.mass = spec.mass;
                p.inertia = spec.inertia;
                for axis in 0..dims {
                    p.velocity[axis] = sigma * (rng.r#gen::<f64>() - 0.5);
                }
                particles.push(p);
            }
        }
    }

    if !particles.is_empty() {
        let total_mass = spec.mass * particles.len() as f64;
        let momentum: Vector3<f64> = particles.iter().map(|p| p.velocity * p.mass).sum();
        let drift = momentum / total_mass;
        for p in &mut particles {
            p.velocity -= drift;
        }
    }
    particles
}

/// Bonds joining consecutive tags into chains of `chain_length` bodies.
pub fn chain_bonds(spec: &LatticeSpec) -> Vec<GroupRecord> {
    if spec.chain_length < 2 {
        return Vec::new();
    }
    (0..spec.len().saturating_sub(1))
        .filter(|i| i % spec.chain_length != spec.chain_length - 1)
        .enumerate()
        .map(|(bond, i)| GroupRecord::new(bond as u32, 0, &[i as u32, i as u32 + 1], 0))
        .collect()
}

/// The part of the lattice owned by `rank`.
///
/// Bonds are kept by every rank owning at least one member, with member ranks filled in
/// from the decomposition.
pub fn rank_system(
    spec: &LatticeSpec,
    decomposition: &DomainDecomposition,
    rank: usize,
) -> Result<LocalSystem> {
    let sim_box = sim_box(spec);
    let all = bodies(spec);
    let owners = all
        .iter()
        .map(|p| decomposition.owner_of(&p.position, &sim_box))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(EngineError::from)?;

    let mut groups = BondedGroups::new();
    for mut bond in chain_bonds(spec) {
        let ranks: Vec<u32> = bond
            .members
            .iter()
            .map(|&m| owners[m as usize] as u32)
            .collect();
        if ranks.contains(&(rank as u32)) {
            bond.ranks = ranks.into_iter().collect();
            groups
                .table_mut(GroupKind::Bond)
                .insert(bond)
                .map_err(EngineError::from)?;
        }
    }

    let mine: Vec<Particle> = all
        .into_iter()
        .zip(&owners)
        .filter_map(|(p, &owner)| (owner == rank).then_some(p))
        .collect();
    debug!(rank, n_local = mine.len(), bonds = groups.total(), "Lattice partitioned.");

    let particles = ParticleData::with_local(spec.len(), mine).map_err(EngineError::from)?;
    Ok(LocalSystem::new(particles, groups, sim_box))
}

/// Number of lattice bodies each rank starts with.
pub fn rank_populations(spec: &LatticeSpec, decomposition: &DomainDecomposition) -> Result<Vec<usize>> {
    let sim_box = sim_box(spec);
    let mut counts = vec![0; decomposition.num_ranks()];
    for p in bodies(spec) {
        let owner = decomposition
            .owner_of(&p.position, &sim_box)
            .map_err(EngineError::from)?;
        counts[owner] += 1;
    }
    Ok(counts)
}
