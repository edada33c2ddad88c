use super::chain::NoseHooverChain;
use super::restart::{IntegratorVariables, is_valid_restart};
use crate::core::models::particle::{Particle, ParticleData};
use crate::core::models::sim_box::SimBox;
use crate::core::models::system::LocalSystem;
use crate::core::utils::quaternion::{
    conjugate_momentum, no_squish_step, rotational_kinetic2, to_body,
};
use crate::engine::config::{Ensemble, RigidNhConfig};
use crate::engine::error::IntegratorError;
use crate::engine::thermo::ThermoCompute;
use crate::engine::transport::Reducer;
use nalgebra::{Matrix3, Vector3};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// `setup` has not run yet.
    Unset,
    /// Between steps; `step_one` is next.
    Ready,
    /// Positions advanced; forces must be evaluated and `step_two` called.
    Predicted,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Unset => "unset",
            Phase::Ready => "ready",
            Phase::Predicted => "predicted",
        }
    }
}

/// Degrees of freedom of the integrated bodies, summed over all ranks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DegreesOfFreedom {
    pub translational: f64,
    pub rotational: f64,
}

impl DegreesOfFreedom {
    pub fn total(&self) -> f64 {
        self.translational + self.rotational
    }
}

/// Rigid-body Nosé-Hoover integrator in the isothermal-isobaric or isenthalpic ensemble.
///
/// Each locally owned anisotropic particle is one rigid body. A step is split into
/// [`step_one`](Self::step_one), an external force evaluation and
/// [`step_two`](Self::step_two). With `h = dt/2` the operator sequence is
///
/// ```text
/// T(h) B(h) V(h) D(dt) | forces | V(h) B(h) T(h)
/// ```
///
/// where `T` runs the translational and rotational thermostat chains (NPT only), `B` the
/// barostat chain around a strain-rate kick, `V` the strain-coupled momentum kick and `D`
/// the exact dilation drift plus free rotation. Every operator is reversed by negating
/// momenta, so the whole step is time-reversible.
#[derive(Debug, Clone)]
pub struct RigidNhIntegrator {
    config: RigidNhConfig,
    tfreq: f64,
    pfreq: f64,
    dimension: usize,
    coupling: Matrix3<f64>,
    dof: DegreesOfFreedom,
    thermostat_t: NoseHooverChain,
    thermostat_r: NoseHooverChain,
    barostat: NoseHooverChain,
    epsilon: Vector3<f64>,
    epsilon_dot: Vector3<f64>,
    epsilon_mass: Vector3<f64>,
    variables: IntegratorVariables,
    valid_restart: bool,
    phase: Phase,
}

impl RigidNhIntegrator {
    /// Creates the integrator, resuming from `restart` if it is a complete record of this
    /// ensemble.
    ///
    /// A missing or malformed record is replaced by zeros and flagged through
    /// [`is_valid_restart`](Self::is_valid_restart). Non-positive periods are accepted
    /// with a warning and yield non-finite frequencies.
    pub fn new(config: RigidNhConfig, restart: Option<IntegratorVariables>) -> Self {
        let kind = config.ensemble.restart_kind();
        if config.ensemble == Ensemble::Npt && config.tau <= 0.0 {
            warn!(tau = config.tau, "{kind}: tau set less than or equal to 0.0");
        }
        if config.tau_p <= 0.0 {
            warn!(tau_p = config.tau_p, "{kind}: tau_p set less than or equal to 0.0");
        }

        let (variables, valid_restart) = match restart {
            Some(v) if is_valid_restart(&v, kind) => (v, true),
            Some(v) => {
                debug!(
                    found = %v.kind,
                    len = v.values.len(),
                    "Restart record does not match {kind}; starting from zero."
                );
                (IntegratorVariables::zeroed(kind), false)
            }
            None => (IntegratorVariables::zeroed(kind), false),
        };

        Self {
            tfreq: 1.0 / config.tau,
            pfreq: 1.0 / config.tau_p,
            dimension: 3,
            coupling: Matrix3::zeros(),
            dof: DegreesOfFreedom::default(),
            thermostat_t: NoseHooverChain::new(config.tchain),
            thermostat_r: NoseHooverChain::new(config.tchain),
            barostat: NoseHooverChain::new(config.pchain),
            epsilon: Vector3::zeros(),
            epsilon_dot: Vector3::zeros(),
            epsilon_mass: Vector3::zeros(),
            variables,
            valid_restart,
            phase: Phase::Unset,
            config,
        }
    }

    pub fn config(&self) -> &RigidNhConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// `false` if the extended-system variables were not resumed from a restart record.
    pub fn is_valid_restart(&self) -> bool {
        self.valid_restart
    }

    /// The restart record, refreshed after every completed step.
    pub fn variables(&self) -> &IntegratorVariables {
        &self.variables
    }

    pub fn degrees_of_freedom(&self) -> DegreesOfFreedom {
        self.dof
    }

    pub fn thermostat_translational(&self) -> &NoseHooverChain {
        &self.thermostat_t
    }

    pub fn thermostat_rotational(&self) -> &NoseHooverChain {
        &self.thermostat_r
    }

    pub fn barostat_chain(&self) -> &NoseHooverChain {
        &self.barostat
    }

    /// Accumulated logarithmic box strain per axis.
    pub fn epsilon(&self) -> Vector3<f64> {
        self.epsilon
    }

    pub fn epsilon_dot(&self) -> Vector3<f64> {
        self.epsilon_dot
    }

    /// Counts degrees of freedom, restores the chain heads and derives all masses.
    ///
    /// Collective. Must run once before the first step and again whenever the set of
    /// bodies or the restart record changes.
    #[instrument(skip_all, name = "rigid_nh_setup", fields(ensemble = %self.config.ensemble))]
    pub fn setup(
        &mut self,
        timestep: u64,
        particles: &ParticleData,
        sim_box: &SimBox,
        reducer: &mut dyn Reducer,
    ) -> Result<(), IntegratorError> {
        // === Phase 1: Degrees of freedom ===
        self.dimension = sim_box.dimensions();
        let flags = self.barostat_flags();
        self.coupling = self.config.coupling.weights(flags);

        let dim = self.dimension;
        let mut counts = [0.0, 0.0];
        for p in particles.local() {
            counts[0] += dim as f64;
            counts[1] += rotational_axes(&p.inertia, dim) as f64;
        }
        reducer.all_reduce_sum(&mut counts)?;
        self.dof = DegreesOfFreedom {
            translational: counts[0],
            rotational: counts[1],
        };
        if self.dof.total() <= 0.0 {
            return Err(IntegratorError::NoDegreesOfFreedom);
        }

        // === Phase 2: Restore chain heads from the restart record ===
        self.thermostat_t.reset();
        self.thermostat_r.reset();
        self.barostat.reset();
        let v = &self.variables.values;
        match self.config.ensemble {
            Ensemble::Npt => {
                set_head(&mut self.thermostat_t, v[0], v[4], v[7]);
                set_head(&mut self.thermostat_r, v[1], v[3], v[6]);
                set_head(&mut self.barostat, v[2], v[5], v[8]);
            }
            Ensemble::Nph => set_head(&mut self.barostat, v[0], v[1], v[2]),
        }

        // === Phase 3: Chain and box masses ===
        // Masses come from the setpoint at timestep 0, also when resuming later.
        let kt = self.kt(0);
        let t_mass = kt / (self.tfreq * self.tfreq);
        let p_mass = kt / (self.pfreq * self.pfreq);

        if !self.thermostat_t.is_empty() {
            self.thermostat_t.q[0] = self.dof.translational * t_mass;
            self.thermostat_r.q[0] = self.dof.rotational * t_mass;
        }
        if !self.barostat.is_empty() {
            self.barostat.q[0] = (dim * dim) as f64 * p_mass;
        }
        for i in 1..self.thermostat_t.len() {
            for chain in [&mut self.thermostat_t, &mut self.thermostat_r] {
                chain.q[i] = t_mass;
                chain.f_eta[i] =
                    (chain.q[i - 1] * chain.eta_dot[i - 1] * chain.eta_dot[i - 1] - kt) / chain.q[i];
            }
        }
        // The barostat chain weights link i by its own mass.
        let chain = &mut self.barostat;
        for i in 1..chain.len() {
            chain.q[i] = p_mass;
            chain.f_eta[i] = (chain.q[i] * chain.eta_dot[i - 1] * chain.eta_dot[i - 1] - kt) / chain.q[i];
        }

        self.epsilon = Vector3::zeros();
        self.epsilon_dot = Vector3::zeros();
        let w = (self.dof.total() + dim as f64) * kt / (self.pfreq * self.pfreq);
        self.epsilon_mass = Vector3::repeat(w);

        self.phase = Phase::Ready;
        info!(
            timestep,
            nf_t = self.dof.translational,
            nf_r = self.dof.rotational,
            kt,
            valid_restart = self.valid_restart,
            "Rigid-body integrator set up."
        );
        Ok(())
    }

    /// First half of a step: thermostat and barostat half-steps, momentum half-kick,
    /// dilation drift and free rotation over the full step.
    pub fn step_one(
        &mut self,
        timestep: u64,
        system: &mut LocalSystem,
        thermo: &mut dyn ThermoCompute,
        reducer: &mut dyn Reducer,
    ) -> Result<(), IntegratorError> {
        self.expect_phase("step_one", Phase::Ready)?;
        let dt = self.config.dt;
        let h = 0.5 * dt;

        self.thermostat_half(timestep, &mut system.particles, reducer, h)?;
        self.barostat_half(timestep, system, thermo, reducer, h)?;
        self.kick(&mut system.particles, h);
        self.drift(system, dt);

        self.phase = Phase::Predicted;
        Ok(())
    }

    /// Second half of a step, after forces at the new positions are available.
    pub fn step_two(
        &mut self,
        timestep: u64,
        system: &mut LocalSystem,
        thermo: &mut dyn ThermoCompute,
        reducer: &mut dyn Reducer,
    ) -> Result<(), IntegratorError> {
        self.expect_phase("step_two", Phase::Predicted)?;
        let h = 0.5 * self.config.dt;

        self.kick(&mut system.particles, h);
        self.barostat_half(timestep, system, thermo, reducer, h)?;
        self.thermostat_half(timestep, &mut system.particles, reducer, h)?;

        self.store_variables();
        self.phase = Phase::Ready;
        Ok(())
    }

    /// Negates body momenta, chain velocities and strain rates.
    pub fn reverse_momenta(&mut self, particles: &mut ParticleData) {
        for p in particles.local_mut() {
            p.velocity = -p.velocity;
            p.angmom = -p.angmom;
        }
        self.thermostat_t.reverse();
        self.thermostat_r.reverse();
        self.barostat.reverse();
        self.epsilon_dot = -self.epsilon_dot;
    }

    /// Energy of the extended system, constant up to integration error.
    ///
    /// `potential_energy` is the global potential energy of the bodies. Collective.
    pub fn conserved_quantity(
        &self,
        timestep: u64,
        system: &LocalSystem,
        potential_energy: f64,
        reducer: &mut dyn Reducer,
    ) -> Result<f64, IntegratorError> {
        let (k2t, k2r) = self.kinetic2(&system.particles, reducer)?;
        let kt = self.kt(timestep);
        let flags = self.barostat_flags();
        let n_b = flags.iter().filter(|&&f| f).count() as f64;

        let mut energy = 0.5 * (k2t + k2r) + potential_energy;
        energy += self.thermostat_t.energy(self.dof.translational, kt);
        energy += self.thermostat_r.energy(self.dof.rotational, kt);
        energy += self.barostat.energy(n_b, kt);
        energy += (0..3)
            .filter(|&k| flags[k])
            .map(|k| 0.5 * self.epsilon_mass[k] * self.epsilon_dot[k].powi(2))
            .sum::<f64>();
        energy += self.config.pressure.value(timestep) * system.sim_box.volume();
        Ok(energy)
    }

    fn expect_phase(&self, operation: &'static str, expected: Phase) -> Result<(), IntegratorError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(IntegratorError::PhaseOrder {
                operation,
                expected: expected.name(),
                found: self.phase.name(),
            })
        }
    }

    fn kt(&self, timestep: u64) -> f64 {
        match (self.config.ensemble, &self.config.temperature) {
            (Ensemble::Npt, Some(t)) => self.config.boltzmann * t.value(timestep),
            _ => self.config.boltzmann,
        }
    }

    fn barostat_flags(&self) -> [bool; 3] {
        std::array::from_fn(|k| self.config.flags[k] && k < self.dimension)
    }

    /// Twice the translational and rotational kinetic energies of all bodies.
    fn kinetic2(
        &self,
        particles: &ParticleData,
        reducer: &mut dyn Reducer,
    ) -> Result<(f64, f64), IntegratorError> {
        let dim = self.dimension;
        let mut sums = [0.0, 0.0];
        for p in particles.local() {
            sums[0] += p.mass * (0..dim).map(|k| p.velocity[k] * p.velocity[k]).sum::<f64>();
            sums[1] += rotational_kinetic2(&p.orientation, &p.angmom, &p.inertia);
        }
        reducer.all_reduce_sum(&mut sums)?;
        Ok((sums[0], sums[1]))
    }

    /// `T(h)`: the translational and rotational chains, each scaling its momenta.
    fn thermostat_half(
        &mut self,
        timestep: u64,
        particles: &mut ParticleData,
        reducer: &mut dyn Reducer,
        h: f64,
    ) -> Result<(), IntegratorError> {
        if self.config.ensemble != Ensemble::Npt {
            return Ok(());
        }
        let kt = self.kt(timestep);
        let (k2t, k2r) = self.kinetic2(particles, reducer)?;
        let iter = self.config.iter;
        let st = self
            .thermostat_t
            .advance(k2t, self.dof.translational, kt, h, iter);
        let sr = self
            .thermostat_r
            .advance(k2r, self.dof.rotational, kt, h, iter);
        for p in particles.local_mut() {
            p.velocity *= st;
            p.angmom *= sr;
        }
        Ok(())
    }

    /// `B(h)`: barostat chain quarter-step, strain-rate kick, barostat chain quarter-step.
    fn barostat_half(
        &mut self,
        timestep: u64,
        system: &LocalSystem,
        thermo: &mut dyn ThermoCompute,
        reducer: &mut dyn Reducer,
        h: f64,
    ) -> Result<(), IntegratorError> {
        let flags = self.barostat_flags();
        let n_b = flags.iter().filter(|&&f| f).count() as f64;
        if n_b == 0.0 {
            return Ok(());
        }
        let kt = self.kt(timestep);

        self.scale_strain_rate(n_b, kt, 0.5 * h);

        thermo.compute(&system.particles, &system.sim_box, reducer)?;
        let (k2t, k2r) = self.kinetic2(&system.particles, reducer)?;
        let target = self.config.pressure.value(timestep);
        let volume = system.sim_box.volume();
        let tensor = thermo.pressure_tensor();
        let mtk = (k2t + k2r) / self.dof.total();
        let raw = Vector3::from_fn(|k, _| {
            if flags[k] {
                ((tensor[k] - target) * volume + mtk) / self.epsilon_mass[k]
            } else {
                0.0
            }
        });
        self.epsilon_dot += h * (self.coupling * raw);

        self.scale_strain_rate(n_b, kt, 0.5 * h);
        Ok(())
    }

    fn scale_strain_rate(&mut self, n_b: f64, kt: f64, dt: f64) {
        let k2b: f64 = (0..3)
            .map(|k| self.epsilon_mass[k] * self.epsilon_dot[k] * self.epsilon_dot[k])
            .sum();
        let s = self.barostat.advance(k2b, n_b, kt, dt, self.config.iter);
        self.epsilon_dot *= s;
    }

    /// `V(h)`: strain scaling, force and torque kick, strain scaling.
    fn kick(&self, particles: &mut ParticleData, h: f64) {
        let dim = self.dimension;
        let mtk = self.epsilon_dot.iter().take(dim).sum::<f64>() / self.dof.total();
        let st = Vector3::from_fn(|k, _| (-0.5 * h * (self.epsilon_dot[k] + mtk)).exp());
        let sr = (-0.5 * h * mtk).exp();

        for p in particles.local_mut() {
            for k in 0..dim {
                p.velocity[k] *= st[k];
                p.velocity[k] += h * p.force[k] / p.mass;
                p.velocity[k] *= st[k];
            }
            if has_rotation(p) {
                let torque_body = to_body(&p.orientation, &p.torque);
                p.angmom *= sr;
                p.angmom += conjugate_momentum(&p.orientation, &torque_body) * h;
                p.angmom *= sr;
            }
        }
    }

    /// `D(dt)`: exact drift of positions under box dilation, box scaling and free rotation.
    fn drift(&mut self, system: &mut LocalSystem, dt: f64) {
        let dim = self.dimension;
        let growth = Vector3::from_fn(|k, _| (self.epsilon_dot[k] * dt).exp());
        let stretch = Vector3::from_fn(|k, _| {
            let x = 0.5 * self.epsilon_dot[k] * dt;
            dt * x.exp() * sinhc(x)
        });

        for p in system.particles.local_mut() {
            for k in 0..dim {
                p.position[k] = p.position[k] * growth[k] + p.velocity[k] * stretch[k];
            }
            if has_rotation(p) {
                no_squish_step(&mut p.angmom, &mut p.orientation, &p.inertia, dt);
            }
        }
        system.sim_box.scale(&growth);
        self.epsilon += dt * self.epsilon_dot;
    }

    fn store_variables(&mut self) {
        let (eta_t, eta_dot_t, f_t) = head(&self.thermostat_t);
        let (eta_r, eta_dot_r, f_r) = head(&self.thermostat_r);
        let (eta_b, eta_dot_b, f_b) = head(&self.barostat);
        self.variables.values = match self.config.ensemble {
            Ensemble::Npt => vec![
                eta_t, eta_r, eta_b, eta_dot_r, eta_dot_t, eta_dot_b, f_r, f_t, f_b,
            ],
            Ensemble::Nph => vec![eta_b, eta_dot_b, f_b],
        };
    }
}

/// Number of rotational degrees of freedom of a body with principal moments `inertia`.
fn rotational_axes(inertia: &Vector3<f64>, dim: usize) -> usize {
    if dim == 2 {
        usize::from(inertia.z > 0.0)
    } else {
        inertia.iter().filter(|&&i| i > 0.0).count()
    }
}

fn has_rotation(p: &Particle) -> bool {
    p.inertia.iter().any(|&i| i > 0.0)
}

/// `sinh(x) / x`, by its series near zero.
fn sinhc(x: f64) -> f64 {
    if x.abs() < 1e-4 {
        let x2 = x * x;
        1.0 + x2 / 6.0 + x2 * x2 / 120.0
    } else {
        x.sinh() / x
    }
}

fn head(chain: &NoseHooverChain) -> (f64, f64, f64) {
    if chain.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        (chain.eta[0], chain.eta_dot[0], chain.f_eta[0])
    }
}

fn set_head(chain: &mut NoseHooverChain, eta: f64, eta_dot: f64, f_eta: f64) {
    if !chain.is_empty() {
        chain.eta[0] = eta;
        chain.eta_dot[0] = eta_dot;
        chain.f_eta[0] = f_eta;
    }
}
