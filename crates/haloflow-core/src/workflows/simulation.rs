use crate::core::forces::{ForceCompute, compute_all};
use crate::core::models::system::LocalSystem;
use crate::engine::comm::{CommOutcome, Communicator};
use crate::engine::error::EngineError;
use crate::engine::integrator::{IntegratorVariables, RigidNhIntegrator};
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::thermo::{ThermoCompute, ThermoSample};
use crate::engine::transport::Transport;
use tracing::{debug, info, instrument};

/// The per-rank state of a running molecular dynamics simulation.
///
/// Every rank of a run owns one `Simulation` over its own subdomain; all methods that
/// advance it are collective and must be called by every rank in the same order.
pub struct Simulation<T: Transport> {
    system: LocalSystem,
    comm: Communicator<T>,
    integrator: RigidNhIntegrator,
    forces: Vec<Box<dyn ForceCompute>>,
    thermo: Box<dyn ThermoCompute>,
    timestep: u64,
    ready: bool,
}

impl<T: Transport> Simulation<T> {
    pub fn new(
        system: LocalSystem,
        comm: Communicator<T>,
        integrator: RigidNhIntegrator,
        forces: Vec<Box<dyn ForceCompute>>,
        thermo: Box<dyn ThermoCompute>,
    ) -> Self {
        Self {
            system,
            comm,
            integrator,
            forces,
            thermo,
            timestep: 0,
            ready: false,
        }
    }

    /// Starts counting steps at `timestep` instead of zero.
    pub fn with_timestep(mut self, timestep: u64) -> Self {
        self.timestep = timestep;
        self
    }

    pub fn timestep(&self) -> u64 {
        self.timestep
    }

    pub fn system(&self) -> &LocalSystem {
        &self.system
    }

    pub fn communicator(&self) -> &Communicator<T> {
        &self.comm
    }

    pub fn integrator(&self) -> &RigidNhIntegrator {
        &self.integrator
    }

    /// The integrator's current restart record.
    pub fn checkpoint(&self) -> IntegratorVariables {
        self.integrator.variables().clone()
    }

    /// Distributes particles, builds the ghost halo, evaluates the initial forces and sets
    /// the integrator up.
    #[instrument(skip_all, name = "simulation_setup", fields(rank = self.comm.context().rank()))]
    pub fn setup(&mut self) -> Result<(), EngineError> {
        let outcome = self.comm.communicate(self.timestep, &mut self.system)?;
        if let CommOutcome::Rebuilt { migration, ghosts } = &outcome {
            debug!(
                migrated = migration.total_sent(),
                ghosts = ghosts.total_received(),
                "Initial particle distribution complete."
            );
        }
        compute_all(&mut self.forces, &mut self.system)?;
        self.integrator.setup(
            self.timestep,
            &self.system.particles,
            &self.system.sim_box,
            self.comm.reducer(),
        )?;
        self.ready = true;
        info!(
            timestep = self.timestep,
            n_local = self.system.particles.n_local(),
            n_ghost = self.system.particles.n_ghost(),
            "Simulation set up."
        );
        Ok(())
    }

    /// Advances the system by one step.
    pub fn step(&mut self) -> Result<(), EngineError> {
        if !self.ready {
            self.setup()?;
        }
        let t = self.timestep;
        self.integrator.step_one(
            t,
            &mut self.system,
            self.thermo.as_mut(),
            self.comm.reducer(),
        )?;
        if let CommOutcome::Rebuilt { migration, .. } =
            self.comm.communicate(t + 1, &mut self.system)?
        {
            debug!(
                timestep = t + 1,
                migrated = migration.total_sent(),
                "Ghost list rebuilt."
            );
        }
        compute_all(&mut self.forces, &mut self.system)?;
        self.integrator.step_two(
            t,
            &mut self.system,
            self.thermo.as_mut(),
            self.comm.reducer(),
        )?;
        self.timestep += 1;
        Ok(())
    }

    /// Evaluates the thermodynamic state of the whole system. Collective.
    pub fn sample(&mut self) -> Result<ThermoSample, EngineError> {
        self.thermo.compute(
            &self.system.particles,
            &self.system.sim_box,
            self.comm.reducer(),
        )?;
        let potential_energy = self.thermo.potential_energy();
        let conserved = self.integrator.conserved_quantity(
            self.timestep,
            &self.system,
            potential_energy,
            self.comm.reducer(),
        )?;
        Ok(ThermoSample {
            timestep: self.timestep,
            temperature: self.thermo.temperature(),
            pressure: self.thermo.pressure(),
            volume: self.system.sim_box.volume(),
            potential_energy,
            conserved,
        })
    }

    /// Runs `steps` steps, sampling every `sample_every` steps when non-zero.
    ///
    /// Samples are returned and also reported as [`Progress::Sample`] events.
    #[instrument(skip_all, name = "simulation_run", fields(rank = self.comm.context().rank(), steps = steps))]
    pub fn run(
        &mut self,
        steps: u64,
        sample_every: u64,
        reporter: &ProgressReporter,
    ) -> Result<Vec<ThermoSample>, EngineError> {
        // === Phase 1: Setup ===
        if !self.ready {
            reporter.report(Progress::PhaseStart { name: "Setup" });
            self.setup()?;
            reporter.report(Progress::PhaseFinish);
        }

        // === Phase 2: Integration ===
        reporter.report(Progress::PhaseStart { name: "Integration" });
        reporter.report(Progress::TaskStart { total_steps: steps });
        let mut samples = Vec::new();
        for _ in 0..steps {
            self.step()?;
            if sample_every > 0 && self.timestep % sample_every == 0 {
                let sample = self.sample()?;
                reporter.report(Progress::Sample(sample));
                samples.push(sample);
            }
            reporter.report(Progress::TaskIncrement);
        }
        reporter.report(Progress::TaskFinish);
        reporter.report(Progress::PhaseFinish);

        info!(
            timestep = self.timestep,
            samples = samples.len(),
            "Integration complete."
        );
        Ok(samples)
    }

    /// Splits the simulation back into its local system and communicator.
    pub fn into_parts(self) -> (LocalSystem, Communicator<T>, RigidNhIntegrator) {
        (self.system, self.comm, self.integrator)
    }
}
