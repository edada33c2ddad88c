use crate::core::decomposition::{Bounds, DecompositionError, DomainDecomposition};
use crate::core::models::sim_box::SimBox;
use std::sync::Arc;

/// Who this worker is within the decomposition.
///
/// Handed to every stateful component at construction instead of being looked up from
/// shared global state. Cloning is cheap: the decomposition itself is shared.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    rank: usize,
    decomposition: Arc<DomainDecomposition>,
}

impl ExecutionContext {
    /// # Errors
    ///
    /// Returns [`DecompositionError::RankOutOfRange`] if `rank` is not part of the grid.
    pub fn new(
        rank: usize,
        decomposition: Arc<DomainDecomposition>,
    ) -> Result<Self, DecompositionError> {
        decomposition.check_rank(rank)?;
        Ok(Self {
            rank,
            decomposition,
        })
    }

    /// Context of an undecomposed run with the given periodic flags.
    pub fn single(periodic: [bool; 3]) -> Result<Self, DecompositionError> {
        Self::new(0, Arc::new(DomainDecomposition::new([1, 1, 1], periodic)?))
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.decomposition.num_ranks()
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    pub fn decomposition(&self) -> &DomainDecomposition {
        &self.decomposition
    }

    pub fn shared_decomposition(&self) -> Arc<DomainDecomposition> {
        Arc::clone(&self.decomposition)
    }

    pub fn local_bounds(&self, sim_box: &SimBox) -> Bounds {
        self.decomposition.local_bounds(self.rank, sim_box)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ranks_outside_the_grid() {
        let decomposition = Arc::new(DomainDecomposition::new([2, 1, 1], [true; 3]).unwrap());
        assert!(ExecutionContext::new(1, Arc::clone(&decomposition)).is_ok());
        assert!(matches!(
            ExecutionContext::new(2, decomposition),
            Err(DecompositionError::RankOutOfRange { rank: 2, .. })
        ));
    }

    #[test]
    fn single_rank_context_owns_the_whole_box() {
        let ctx = ExecutionContext::single([true; 3]).unwrap();
        let sim_box = SimBox::cubic(4.0);
        let bounds = ctx.local_bounds(&sim_box);
        assert!(ctx.is_root());
        assert_eq!(ctx.num_ranks(), 1);
        assert_eq!(bounds.lo, sim_box.lo());
        assert_eq!(bounds.hi, sim_box.hi());
    }
}
