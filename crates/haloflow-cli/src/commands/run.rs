use crate::cli::RunArgs;
use crate::config::{AppConfig, CliOverrides, build_config};
use crate::error::{CliError, Result};
use crate::lattice;
use crate::output::{self, Checkpoint};
use crate::utils::progress::CliProgressHandler;
use haloflow::core::decomposition::DomainDecomposition;
use haloflow::core::forces::{ForceCompute, HarmonicBonds, SoftRepulsion};
use haloflow::engine::comm::Communicator;
use haloflow::engine::context::ExecutionContext;
use haloflow::engine::error::{CommError, EngineError, IntegratorError};
use haloflow::engine::integrator::RigidNhIntegrator;
use haloflow::engine::progress::{Progress, ProgressReporter};
use haloflow::engine::thermo::{KineticThermo, ThermoSample};
use haloflow::engine::transport::{ThreadedFabric, ThreadedTransport};
use haloflow::workflows::Simulation;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, instrument, warn};

/// What a rank hands back to the driver after its last step.
#[derive(Debug)]
struct RankOutcome {
    samples: Vec<ThermoSample>,
    checkpoint: Checkpoint,
    n_local: usize,
}

pub fn run(args: RunArgs) -> Result<()> {
    let overrides = CliOverrides {
        steps: args.steps,
        max_stages: args.max_stages,
    };
    let config = build_config(&args.config, &args.set_values, overrides)?;
    let restart = args
        .restart
        .as_deref()
        .map(output::read_checkpoint)
        .transpose()?;
    if let Some(checkpoint) = &restart {
        info!(
            timestep = checkpoint.timestep,
            kind = %checkpoint.integrator.kind,
            "Resuming from checkpoint."
        );
    }
    if config.comm.ghost_width < config.forces.repulsion_cutoff {
        warn!(
            ghost_width = config.comm.ghost_width,
            cutoff = config.forces.repulsion_cutoff,
            "Ghost width is smaller than the repulsion cutoff; pairs across rank boundaries will be missed."
        );
    }

    let decomposition = Arc::new(
        DomainDecomposition::new(config.grid, config.lattice.periodic)
            .map_err(EngineError::from)?,
    );
    let n_ranks = decomposition.num_ranks();
    info!(
        ranks = n_ranks,
        bodies = config.lattice.len(),
        ensemble = %config.integrator.ensemble,
        steps = config.steps,
        "Starting run."
    );

    let handler = CliProgressHandler::new();
    let results: Vec<Result<RankOutcome>> = thread::scope(|s| {
        let handles: Vec<_> = ThreadedFabric::endpoints(n_ranks)
            .into_iter()
            .enumerate()
            .map(|(rank, transport)| {
                let decomposition = Arc::clone(&decomposition);
                let config = &config;
                let restart = restart.as_ref();
                let reporter = if rank == 0 {
                    ProgressReporter::with_callback(handler.get_callback())
                } else {
                    ProgressReporter::silent()
                };
                thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(s, move || {
                        run_rank(rank, transport, decomposition, config, restart, &reporter)
                    })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| match handle {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(CliError::RankPanicked { rank })),
                Err(e) => Err(CliError::Io(e)),
            })
            .collect()
    });

    let outcomes = first_failure(results)?;
    let total: usize = outcomes.iter().map(|o| o.n_local).sum();
    if total != config.lattice.len() {
        warn!(
            expected = config.lattice.len(),
            found = total,
            "Body count changed during the run."
        );
    }
    let root = outcomes
        .into_iter()
        .next()
        .ok_or_else(|| CliError::Other(anyhow::anyhow!("Run finished without any rank")))?;

    if let Some(path) = &args.thermo_log {
        output::write_thermo_log(path, &root.samples)?;
    }
    if let Some(path) = &args.checkpoint {
        output::write_checkpoint(path, &root.checkpoint)?;
    }
    match root.samples.last() {
        Some(last) => println!(
            "Step {}: T = {:.4}, P = {:.4}, V = {:.4}, conserved = {:.6}",
            last.timestep, last.temperature, last.pressure, last.volume, last.conserved
        ),
        None => println!("Reached step {}.", root.checkpoint.timestep),
    }
    Ok(())
}

#[instrument(skip_all, name = "rank", fields(rank = rank))]
fn run_rank(
    rank: usize,
    transport: ThreadedTransport,
    decomposition: Arc<DomainDecomposition>,
    config: &AppConfig,
    restart: Option<&Checkpoint>,
    reporter: &ProgressReporter,
) -> Result<RankOutcome> {
    let system = lattice::rank_system(&config.lattice, &decomposition, rank)?;
    if reporter.is_active() {
        reporter.report(Progress::Message(format!(
            "{} bodies over {} ranks",
            config.lattice.len(),
            decomposition.num_ranks()
        )));
    }

    let context = ExecutionContext::new(rank, decomposition).map_err(EngineError::from)?;
    let comm = Communicator::new(context, transport, config.comm.clone()).map_err(EngineError::from)?;
    let integrator = RigidNhIntegrator::new(
        config.integrator.clone(),
        restart.map(|c| c.integrator.clone()),
    );
    let thermo = Box::new(KineticThermo::new(config.integrator.boltzmann));
    let mut sim = Simulation::new(system, comm, integrator, forces(config)?, thermo)
        .with_timestep(restart.map_or(0, |c| c.timestep));

    let samples = sim.run(config.steps, config.sample_every, reporter)?;
    debug!(timestep = sim.timestep(), "Rank finished.");
    Ok(RankOutcome {
        samples,
        checkpoint: Checkpoint {
            timestep: sim.timestep(),
            integrator: sim.checkpoint(),
        },
        n_local: sim.system().particles.n_local(),
    })
}

fn forces(config: &AppConfig) -> Result<Vec<Box<dyn ForceCompute>>> {
    let spec = &config.forces;
    let mut forces: Vec<Box<dyn ForceCompute>> = Vec::new();
    if config.lattice.chain_length > 1 {
        let bonds = HarmonicBonds::new(spec.bond_k, spec.bond_r0).map_err(EngineError::from)?;
        forces.push(Box::new(bonds));
    }
    if spec.repulsion_epsilon != 0.0 {
        let repulsion = SoftRepulsion::new(spec.repulsion_epsilon, spec.repulsion_cutoff)
            .map_err(EngineError::from)?;
        forces.push(Box::new(repulsion));
    }
    Ok(forces)
}

/// A failed rank takes its peers down with `RankLost`; report the root cause instead.
fn is_rank_lost(error: &CliError) -> bool {
    matches!(
        error,
        CliError::Core(EngineError::Comm(CommError::RankLost { .. }))
            | CliError::Core(EngineError::Integrator(IntegratorError::Comm(
                CommError::RankLost { .. }
            )))
    )
}

fn first_failure(results: Vec<Result<RankOutcome>>) -> Result<Vec<RankOutcome>> {
    let mut outcomes = Vec::with_capacity(results.len());
    let mut failure: Option<CliError> = None;
    for result in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                if failure
                    .as_ref()
                    .is_none_or(|f| is_rank_lost(f) && !is_rank_lost(&e))
                {
                    failure = Some(e);
                }
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(outcomes),
    }
}
