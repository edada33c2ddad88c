use crate::cli::DecomposeArgs;
use crate::config::{CliOverrides, build_config};
use crate::error::Result;
use crate::lattice;
use haloflow::core::decomposition::DomainDecomposition;
use haloflow::core::models::sim_box::SimBox;
use haloflow::engine::error::EngineError;
use std::fmt::Write;
use tracing::info;

pub fn run(args: DecomposeArgs) -> Result<()> {
    let overrides = CliOverrides {
        steps: None,
        max_stages: args.max_stages,
    };
    let config = build_config(&args.config, &[], overrides)?;
    let decomposition = DomainDecomposition::new(config.grid, config.lattice.periodic)
        .map_err(EngineError::from)?;
    info!(ranks = decomposition.num_ranks(), "Describing decomposition.");

    let populations = lattice::rank_populations(&config.lattice, &decomposition)?;
    let report = describe(
        &decomposition,
        &lattice::sim_box(&config.lattice),
        config.comm.max_stages,
        &populations,
    );
    print!("{}", report);
    Ok(())
}

fn mask_axes(mask: u32) -> String {
    let names = ["+x", "-x", "+y", "-y", "+z", "-z"];
    let faces: Vec<_> = (0..6)
        .filter(|bit| mask & (1 << bit) != 0)
        .map(|bit| names[bit])
        .collect();
    if faces.is_empty() {
        "none".to_string()
    } else {
        faces.join(" ")
    }
}

fn describe(
    decomposition: &DomainDecomposition,
    sim_box: &SimBox,
    max_stages: u32,
    populations: &[usize],
) -> String {
    let mut out = String::new();
    let grid = decomposition.grid();
    let _ = writeln!(
        out,
        "Grid {} x {} x {} ({} ranks), periodic {:?}, max stages {}",
        grid[0],
        grid[1],
        grid[2],
        decomposition.num_ranks(),
        decomposition.periodic(),
        max_stages
    );
    for rank in 0..decomposition.num_ranks() {
        let bounds = decomposition.local_bounds(rank, sim_box);
        let neighbors = decomposition.unique_neighbors(rank);
        let table = decomposition.stage_table(rank, max_stages);
        let _ = writeln!(
            out,
            "rank {:>3} {:?}: [{:.3}, {:.3}, {:.3}] .. [{:.3}, {:.3}, {:.3}], {} bodies, {} neighbors",
            rank,
            decomposition.coords_of(rank),
            bounds.lo.x,
            bounds.lo.y,
            bounds.lo.z,
            bounds.hi.x,
            bounds.hi.y,
            bounds.hi.z,
            populations.get(rank).copied().unwrap_or(0),
            neighbors.len()
        );
        for (index, stage) in table.stages().iter().enumerate() {
            let _ = writeln!(
                out,
                "    stage {}: faces {}, {} links",
                index,
                mask_axes(stage.mask),
                stage.links.len()
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn face_masks_are_named() {
        assert_eq!(mask_axes(0), "none");
        assert_eq!(mask_axes(0b11), "+x -x");
        assert_eq!(mask_axes(0b110000), "+z -z");
    }

    #[test]
    fn report_lists_every_rank() {
        let dd = DomainDecomposition::new([2, 2, 1], [true; 3]).unwrap();
        let report = describe(&dd, &SimBox::cubic(8.0), 2, &[4, 4, 4, 4]);
        let lines: Vec<_> = report.lines().collect();
        assert!(lines[0].starts_with("Grid 2 x 2 x 1 (4 ranks)"));
        assert_eq!(lines.iter().filter(|l| l.starts_with("rank")).count(), 4);
        assert!(report.contains("rank   0 [0, 0, 0]: [-4.000, -4.000, -4.000] .. [0.000, 0.000, 4.000]"));
        assert!(lines.iter().any(|l| l.contains("stage 1")));
    }
}
