use super::DecompositionError;
use super::offset::{Offset, axis_bits};
use super::stages::StageTable;
use crate::core::models::sim_box::SimBox;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};

/// Axis-aligned region of the global box owned by one rank.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub lo: Point3<f64>,
    pub hi: Point3<f64>,
}

/// A distinct neighbor rank together with every grid offset at which it appears.
///
/// In small periodic grids one rank can sit at several offsets at once (with two ranks
/// along x, the east and the west neighbor are the same rank), so adjacency is a 27-bit
/// mask rather than a single offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub rank: usize,
    pub adjacency: u32,
}

impl Neighbor {
    pub fn offsets(&self) -> impl Iterator<Item = Offset> + '_ {
        Offset::neighborhood().filter(|o| self.adjacency & o.adjacency_bit() != 0)
    }
}

/// Maps the global box onto a grid of rank subdomains.
///
/// Ranks are laid out on an `nx × ny × nz` grid with index `i + nx (j + ny k)`. Subdomain
/// faces are stored as cumulative fractions of the box so that the decomposition survives
/// box rescaling by the barostat unchanged; non-uniform fractions give asymmetric
/// decompositions. Only axes with more than one rank are decomposed, and only decomposed
/// axes produce neighbors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainDecomposition {
    grid: [usize; 3],
    periodic: [bool; 3],
    splits: [Vec<f64>; 3],
}

impl DomainDecomposition {
    /// Creates a uniform decomposition.
    ///
    /// # Errors
    ///
    /// Returns [`DecompositionError::EmptyGrid`] if any grid dimension is zero.
    pub fn new(grid: [usize; 3], periodic: [bool; 3]) -> Result<Self, DecompositionError> {
        if grid.contains(&0) {
            return Err(DecompositionError::EmptyGrid { grid });
        }
        let splits = grid.map(|n| (0..=n).map(|i| i as f64 / n as f64).collect());
        Ok(Self {
            grid,
            periodic,
            splits,
        })
    }

    /// Creates a decomposition with explicit face positions.
    ///
    /// # Arguments
    ///
    /// * `splits` - For each axis, `n + 1` strictly increasing fractions from `0.0` to `1.0`.
    ///
    /// # Errors
    ///
    /// Returns [`DecompositionError::InvalidSplits`] when a split list has the wrong length,
    /// does not start at 0 and end at 1, or is not strictly increasing.
    pub fn with_splits(
        grid: [usize; 3],
        periodic: [bool; 3],
        splits: [Vec<f64>; 3],
    ) -> Result<Self, DecompositionError> {
        if grid.contains(&0) {
            return Err(DecompositionError::EmptyGrid { grid });
        }
        for axis in 0..3 {
            let s = &splits[axis];
            let reason = if s.len() != grid[axis] + 1 {
                Some(format!("expected {} fractions, got {}", grid[axis] + 1, s.len()))
            } else if s[0] != 0.0 || s[s.len() - 1] != 1.0 {
                Some("fractions must start at 0 and end at 1".to_string())
            } else if s.windows(2).any(|w| w[1] <= w[0]) {
                Some("fractions must be strictly increasing".to_string())
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(DecompositionError::InvalidSplits { axis, reason });
            }
        }
        Ok(Self {
            grid,
            periodic,
            splits,
        })
    }

    pub fn grid(&self) -> [usize; 3] {
        self.grid
    }

    pub fn periodic(&self) -> [bool; 3] {
        self.periodic
    }

    pub fn num_ranks(&self) -> usize {
        self.grid.iter().product()
    }

    /// Returns `true` when `axis` is split across more than one rank.
    pub fn is_decomposed(&self, axis: usize) -> bool {
        self.grid[axis] > 1
    }

    /// Direction bits of every decomposed axis.
    pub fn decomposed_mask(&self) -> u32 {
        (0..3)
            .filter(|&axis| self.is_decomposed(axis))
            .fold(0, |mask, axis| mask | axis_bits(axis))
    }

    pub fn check_rank(&self, rank: usize) -> Result<(), DecompositionError> {
        if rank >= self.num_ranks() {
            return Err(DecompositionError::RankOutOfRange {
                rank,
                num_ranks: self.num_ranks(),
            });
        }
        Ok(())
    }

    pub fn coords_of(&self, rank: usize) -> [usize; 3] {
        let [nx, ny, _] = self.grid;
        [rank % nx, (rank / nx) % ny, rank / (nx * ny)]
    }

    pub fn rank_of(&self, coords: [usize; 3]) -> usize {
        let [nx, ny, _] = self.grid;
        coords[0] + nx * (coords[1] + ny * coords[2])
    }

    /// The region of `sim_box` owned by `rank`.
    pub fn local_bounds(&self, rank: usize, sim_box: &SimBox) -> Bounds {
        let coords = self.coords_of(rank);
        let (box_lo, lengths) = (sim_box.lo(), sim_box.lengths());
        let mut lo = box_lo;
        let mut hi = box_lo;
        for axis in 0..3 {
            lo[axis] = box_lo[axis] + self.splits[axis][coords[axis]] * lengths[axis];
            hi[axis] = box_lo[axis] + self.splits[axis][coords[axis] + 1] * lengths[axis];
        }
        Bounds { lo, hi }
    }

    /// Returns the rank owning `position`.
    ///
    /// Periodic axes are wrapped first. A coordinate exactly on the high face of a
    /// non-periodic axis belongs to the last rank along that axis.
    ///
    /// # Errors
    ///
    /// Returns [`DecompositionError::OutsideBox`] for positions beyond a non-periodic face.
    pub fn owner_of(
        &self,
        position: &Point3<f64>,
        sim_box: &SimBox,
    ) -> Result<usize, DecompositionError> {
        let mut coords = [0usize; 3];
        for axis in 0..3 {
            let mut f = sim_box.fraction(position, axis);
            if self.periodic[axis] {
                f -= f.floor();
            } else if !(0.0..=1.0).contains(&f) {
                return Err(DecompositionError::OutsideBox {
                    position: [position.x, position.y, position.z],
                });
            }
            let interior = &self.splits[axis][1..self.grid[axis]];
            coords[axis] = interior.partition_point(|&s| s <= f);
        }
        Ok(self.rank_of(coords))
    }

    /// Face bits through which `position` has left the subdomain of `rank`.
    ///
    /// Only decomposed axes are considered. On a non-periodic axis the high face of the
    /// last rank is part of its subdomain.
    pub fn crossing_bits(&self, rank: usize, position: &Point3<f64>, sim_box: &SimBox) -> u32 {
        let bounds = self.local_bounds(rank, sim_box);
        let coords = self.coords_of(rank);
        let mut bits = 0;
        for axis in (0..3).filter(|&a| self.is_decomposed(a)) {
            let x = position[axis];
            let closed_hi = !self.periodic[axis] && coords[axis] + 1 == self.grid[axis];
            if x < bounds.lo[axis] {
                bits |= 2 << (2 * axis);
            } else if x > bounds.hi[axis] || (x == bounds.hi[axis] && !closed_hi) {
                bits |= 1 << (2 * axis);
            }
        }
        bits
    }

    /// The rank at `offset` from `rank`, or `None` if the offset leaves the grid across a
    /// non-periodic face or moves along an undecomposed axis.
    pub fn neighbor(&self, rank: usize, offset: Offset) -> Option<usize> {
        let coords = self.coords_of(rank);
        let mut target = [0usize; 3];
        for axis in 0..3 {
            let d = offset.0[axis] as isize;
            if d != 0 && !self.is_decomposed(axis) {
                return None;
            }
            let n = self.grid[axis] as isize;
            let mut c = coords[axis] as isize + d;
            if c < 0 || c >= n {
                if !self.periodic[axis] {
                    return None;
                }
                c = c.rem_euclid(n);
            }
            target[axis] = c as usize;
        }
        Some(self.rank_of(target))
    }

    /// Per-axis count of periodic boundaries crossed when going from `rank` to `offset`
    /// (`+1` through the high face, `-1` through the low face).
    pub fn boundary_wrap(&self, rank: usize, offset: Offset) -> [i8; 3] {
        let coords = self.coords_of(rank);
        let mut wrap = [0i8; 3];
        for axis in 0..3 {
            let c = coords[axis] as isize + offset.0[axis] as isize;
            if c < 0 {
                wrap[axis] = -1;
            } else if c >= self.grid[axis] as isize {
                wrap[axis] = 1;
            }
        }
        wrap
    }

    /// Every existing neighbor offset of `rank` with the rank found there.
    pub fn neighbor_offsets(&self, rank: usize) -> Vec<(Offset, usize)> {
        Offset::neighborhood()
            .filter_map(|o| self.neighbor(rank, o).map(|n| (o, n)))
            .collect()
    }

    /// Distinct neighbor ranks of `rank`, ordered by rank. `rank` itself never appears.
    pub fn unique_neighbors(&self, rank: usize) -> Vec<Neighbor> {
        let mut neighbors: Vec<Neighbor> = Vec::new();
        for (offset, n) in self.neighbor_offsets(rank) {
            if n == rank {
                continue;
            }
            match neighbors.iter_mut().find(|nb| nb.rank == n) {
                Some(nb) => nb.adjacency |= offset.adjacency_bit(),
                None => neighbors.push(Neighbor {
                    rank: n,
                    adjacency: offset.adjacency_bit(),
                }),
            }
        }
        neighbors.sort_by_key(|nb| nb.rank);
        neighbors
    }

    /// Builds the staged communication schedule of `rank`.
    pub fn stage_table(&self, rank: usize, max_stages: u32) -> StageTable {
        StageTable::build(self, rank, max_stages)
    }
}
