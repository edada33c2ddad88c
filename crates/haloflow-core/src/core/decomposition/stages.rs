use super::directory::DomainDecomposition;
use super::offset::{Offset, axis_bits};
use tracing::warn;

/// Upper bound on dependent communication rounds: one per spatial axis.
pub const MAX_COMMUNICATION_STAGES: u32 = 3;

/// Clamps a requested stage count into `1..=3`, warning when the request was changed.
pub fn sanitize_max_stages(requested: u32) -> u32 {
    if requested == 0 {
        warn!("Maximum number of communication stages must be at least 1; using 1.");
        1
    } else if requested > MAX_COMMUNICATION_STAGES {
        warn!(
            "Maximum number of communication stages is {}; got {}, using {}.",
            MAX_COMMUNICATION_STAGES, requested, MAX_COMMUNICATION_STAGES
        );
        MAX_COMMUNICATION_STAGES
    } else {
        requested
    }
}

/// One directed link of a stage: data for `offset` goes to `neighbor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLink {
    pub offset: Offset,
    pub neighbor: usize,
    /// Periodic boundaries crossed on the way (see [`DomainDecomposition::boundary_wrap`]).
    pub wrap: [i8; 3],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Face bits handled in this stage. Masks of different stages are disjoint.
    pub mask: u32,
    /// Links whose direction bits all lie inside `mask`, in offset-index order.
    pub links: Vec<StageLink>,
}

impl Stage {
    /// Position in `links` of the link serving `offset`.
    pub fn link_index(&self, offset: Offset) -> Option<usize> {
        self.links.iter().position(|l| l.offset == offset)
    }
}

/// Explicit (rank, stage) adjacency table.
///
/// Decomposed axes are assigned to stages in x, y, z order; once the last allowed stage
/// is reached the remaining axes share it. An object crossing several axes is relayed
/// through one link per stage (east first, then north), so `n` stages carry it to any
/// of the 26 surrounding subdomains in at most `n` hops. With a single stage every
/// diagonal neighbor is linked directly instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTable {
    rank: usize,
    max_stages: u32,
    stages: Vec<Stage>,
}

impl StageTable {
    pub fn build(decomposition: &DomainDecomposition, rank: usize, max_stages: u32) -> Self {
        let max_stages = sanitize_max_stages(max_stages);

        let mut masks = vec![0u32; max_stages as usize];
        let mut stage = 0usize;
        let mut used = 0usize;
        for axis in (0..3).filter(|&a| decomposition.is_decomposed(a)) {
            masks[stage] |= axis_bits(axis);
            used = stage + 1;
            if stage + 1 < max_stages as usize {
                stage += 1;
            }
        }
        masks.truncate(used.max(1));

        let offsets = decomposition.neighbor_offsets(rank);
        let stages: Vec<Stage> = masks
            .into_iter()
            .map(|mask| Stage {
                mask,
                links: offsets
                    .iter()
                    .filter(|(o, _)| o.direction_bits() & !mask == 0)
                    .map(|&(offset, neighbor)| StageLink {
                        offset,
                        neighbor,
                        wrap: decomposition.boundary_wrap(rank, offset),
                    })
                    .collect(),
            })
            .collect();

        Self {
            rank,
            max_stages,
            stages,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The sanitized maximum the table was built for.
    pub fn max_stages(&self) -> u32 {
        self.max_stages
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn stage(&self, index: usize) -> &Stage {
        &self.stages[index]
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Union of every stage mask.
    pub fn combined_mask(&self) -> u32 {
        self.stages.iter().fold(0, |m, s| m | s.mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decomposition::offset::{DOWN, EAST, NORTH, SOUTH, UP, WEST};

    fn decomposition(grid: [usize; 3]) -> DomainDecomposition {
        DomainDecomposition::new(grid, [true; 3]).unwrap()
    }

    #[test]
    fn three_axes_three_stages_use_face_links_only() {
        let table = decomposition([3, 3, 3]).stage_table(13, 3);
        assert_eq!(table.num_stages(), 3);
        assert_eq!(table.stage(0).mask, EAST | WEST);
        assert_eq!(table.stage(1).mask, NORTH | SOUTH);
        assert_eq!(table.stage(2).mask, UP | DOWN);
        for stage in table.stages() {
            assert_eq!(stage.links.len(), 2);
        }
    }

    #[test]
    fn single_stage_links_every_neighbor() {
        let table = decomposition([3, 3, 3]).stage_table(13, 1);
        assert_eq!(table.num_stages(), 1);
        assert_eq!(table.stage(0).mask, EAST | WEST | NORTH | SOUTH | UP | DOWN);
        assert_eq!(table.stage(0).links.len(), 26);
    }

    #[test]
    fn two_stages_merge_trailing_axes() {
        let table = decomposition([3, 3, 3]).stage_table(13, 2);
        assert_eq!(table.num_stages(), 2);
        assert_eq!(table.stage(0).mask, EAST | WEST);
        assert_eq!(table.stage(1).mask, NORTH | SOUTH | UP | DOWN);
        // Four faces plus four y-z edges.
        assert_eq!(table.stage(1).links.len(), 8);
        assert_eq!(table.stage(0).mask & table.stage(1).mask, 0);
    }

    #[test]
    fn undecomposed_axes_get_no_stage() {
        let table = decomposition([1, 2, 2]).stage_table(0, 3);
        assert_eq!(table.num_stages(), 2);
        assert_eq!(table.stage(0).mask, NORTH | SOUTH);
        assert_eq!(table.stage(1).mask, UP | DOWN);
        assert_eq!(table.combined_mask(), NORTH | SOUTH | UP | DOWN);
    }

    #[test]
    fn out_of_range_stage_counts_are_clamped() {
        let dd = decomposition([2, 2, 2]);
        assert_eq!(dd.stage_table(0, 0).max_stages(), 1);
        assert_eq!(dd.stage_table(0, 0).num_stages(), 1);
        assert_eq!(dd.stage_table(0, 7).max_stages(), 3);
        assert_eq!(dd.stage_table(0, 7).num_stages(), 3);
    }

    #[test]
    fn single_rank_has_one_empty_stage() {
        let table = decomposition([1, 1, 1]).stage_table(0, 3);
        assert_eq!(table.num_stages(), 1);
        assert_eq!(table.stage(0).mask, 0);
        assert!(table.stage(0).links.is_empty());
    }

    #[test]
    fn diagonal_offsets_have_no_link_in_split_stages() {
        let table = decomposition([3, 3, 1]).stage_table(4, 3);
        let east = table.stage(0).link_index(Offset::new(1, 0, 0)).unwrap();
        assert_eq!(table.stage(0).links[east].neighbor, 5);
        assert!(table.stage(1).link_index(Offset::new(0, 1, 0)).is_some());
        // Diagonal neighbors are reached by relaying only.
        assert_eq!(table.stage(1).link_index(Offset::new(1, 1, 0)), None);
        assert_eq!(table.stage(0).link_index(Offset::new(0, 1, 0)), None);
    }
}
