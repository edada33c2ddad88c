//! Thermodynamic observables consumed by the integrator.
//!
//! The integrator only needs read-only scalars (temperature, pressure and the diagonal of
//! the pressure tensor) evaluated over the whole system. [`ThermoCompute`] is that seam;
//! [`KineticThermo`] is the reference implementation built from particle velocities and
//! the per-particle virial written by force computes.

use super::error::CommError;
use super::transport::Reducer;
use crate::core::models::particle::{Particle, ParticleData};
use crate::core::models::sim_box::SimBox;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

pub trait ThermoCompute: Send {
    /// Evaluates the observables over the local particles of every rank.
    ///
    /// Collective: every rank must call it in the same order.
    fn compute(
        &mut self,
        particles: &ParticleData,
        sim_box: &SimBox,
        reducer: &mut dyn Reducer,
    ) -> Result<(), CommError>;

    fn temperature(&self) -> f64;

    fn pressure(&self) -> f64;

    /// Diagonal `(P_xx, P_yy, P_zz)` of the pressure tensor. `P_zz` is zero in 2D.
    fn pressure_tensor(&self) -> Vector3<f64>;

    fn potential_energy(&self) -> f64;
}

/// One row of thermodynamic output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermoSample {
    pub timestep: u64,
    pub temperature: f64,
    pub pressure: f64,
    pub volume: f64,
    pub potential_energy: f64,
    /// Extended-system energy of the integrator, constant up to integration error.
    pub conserved: f64,
}

/// Temperature and pressure from translational kinetic energy and the virial.
#[derive(Debug, Clone)]
pub struct KineticThermo {
    boltzmann: f64,
    temperature: f64,
    pressure_tensor: Vector3<f64>,
    potential_energy: f64,
    dimensions: usize,
}

impl KineticThermo {
    pub fn new(boltzmann: f64) -> Self {
        Self {
            boltzmann,
            temperature: 0.0,
            pressure_tensor: Vector3::zeros(),
            potential_energy: 0.0,
            dimensions: 3,
        }
    }
}

impl Default for KineticThermo {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// `[mv_x², mv_y², mv_z², W_xx, W_yy, W_zz, U, N]` of one particle.
fn contribution(p: &Particle) -> [f64; 8] {
    let mv2 = p.velocity.component_mul(&p.velocity) * p.mass;
    [
        mv2.x,
        mv2.y,
        mv2.z,
        p.virial.x,
        p.virial.y,
        p.virial.z,
        p.potential_energy,
        1.0,
    ]
}

fn add(mut a: [f64; 8], b: [f64; 8]) -> [f64; 8] {
    for (x, y) in a.iter_mut().zip(b) {
        *x += y;
    }
    a
}

impl ThermoCompute for KineticThermo {
    fn compute(
        &mut self,
        particles: &ParticleData,
        sim_box: &SimBox,
        reducer: &mut dyn Reducer,
    ) -> Result<(), CommError> {
        #[cfg(not(feature = "parallel"))]
        let mut sums = particles
            .local()
            .iter()
            .map(contribution)
            .fold([0.0; 8], add);

        #[cfg(feature = "parallel")]
        let mut sums = particles
            .local()
            .par_iter()
            .map(contribution)
            .reduce(|| [0.0; 8], add);

        reducer.all_reduce_sum(&mut sums)?;

        let dim = sim_box.dimensions();
        let n = sums[7];
        let volume = sim_box.volume();
        let mut tensor = Vector3::new(
            (sums[0] + sums[3]) / volume,
            (sums[1] + sums[4]) / volume,
            (sums[2] + sums[5]) / volume,
        );
        if dim == 2 {
            tensor.z = 0.0;
        }
        let kinetic2: f64 = sums[..dim].iter().sum();

        self.dimensions = dim;
        self.pressure_tensor = tensor;
        self.potential_energy = sums[6];
        self.temperature = if n > 0.0 {
            kinetic2 / (dim as f64 * n * self.boltzmann)
        } else {
            0.0
        };
        Ok(())
    }

    fn temperature(&self) -> f64 {
        self.temperature
    }

    fn pressure(&self) -> f64 {
        self.pressure_tensor.iter().take(self.dimensions).sum::<f64>() / self.dimensions as f64
    }

    fn pressure_tensor(&self) -> Vector3<f64> {
        self.pressure_tensor
    }

    fn potential_energy(&self) -> f64 {
        self.potential_energy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::transport::LoopbackTransport;
    use nalgebra::Point3;

    const TOL: f64 = 1e-12;

    #[test]
    fn ideal_gas_pressure_and_temperature() {
        let mut a = Particle::new(0, Point3::origin());
        a.velocity = Vector3::new(1.0, 0.0, 0.0);
        let mut b = Particle::new(1, Point3::new(1.0, 0.0, 0.0));
        b.velocity = Vector3::new(0.0, 2.0, 0.0);
        b.mass = 2.0;
        let particles = ParticleData::with_local(2, vec![a, b]).unwrap();
        let sim_box = SimBox::cubic(2.0);

        let mut thermo = KineticThermo::new(1.0);
        thermo
            .compute(&particles, &sim_box, &mut LoopbackTransport::new())
            .unwrap();

        // 2K = 1 + 8 = 9 over 6 degrees of freedom.
        assert!((thermo.temperature() - 1.5).abs() < TOL);
        assert!((thermo.pressure_tensor().x - 1.0 / 8.0).abs() < TOL);
        assert!((thermo.pressure_tensor().y - 8.0 / 8.0).abs() < TOL);
        assert!((thermo.pressure() - 9.0 / 24.0).abs() < TOL);
    }

    #[test]
    fn virial_adds_to_pressure() {
        let mut a = Particle::new(0, Point3::origin());
        a.virial = Vector3::new(0.5, 0.5, 0.5);
        a.potential_energy = -1.25;
        let particles = ParticleData::with_local(1, vec![a]).unwrap();
        let mut thermo = KineticThermo::default();
        thermo
            .compute(&particles, &SimBox::cubic(1.0), &mut LoopbackTransport::new())
            .unwrap();
        assert!((thermo.pressure() - 0.5).abs() < TOL);
        assert!((thermo.potential_energy() + 1.25).abs() < TOL);
        assert_eq!(thermo.temperature(), 0.0);
    }

    #[test]
    fn two_dimensional_box_ignores_z() {
        let mut a = Particle::new(0, Point3::origin());
        a.velocity = Vector3::new(1.0, 1.0, 5.0);
        let particles = ParticleData::with_local(1, vec![a]).unwrap();
        let sim_box = SimBox::new(Vector3::new(2.0, 2.0, 1.0)).two_dimensional();
        let mut thermo = KineticThermo::default();
        thermo
            .compute(&particles, &sim_box, &mut LoopbackTransport::new())
            .unwrap();
        assert!((thermo.temperature() - 1.0).abs() < TOL);
        assert_eq!(thermo.pressure_tensor().z, 0.0);
        assert!((thermo.pressure() - 0.25).abs() < TOL);
    }
}
