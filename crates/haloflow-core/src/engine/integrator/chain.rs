//! Nosé-Hoover chains integrated with the symmetric Trotter factorization.

/// Positions, velocities, forces and masses of the links of one thermostat chain.
#[derive(Debug, Clone, PartialEq)]
pub struct NoseHooverChain {
    pub eta: Vec<f64>,
    pub eta_dot: Vec<f64>,
    pub f_eta: Vec<f64>,
    pub q: Vec<f64>,
}

impl NoseHooverChain {
    pub fn new(len: usize) -> Self {
        Self {
            eta: vec![0.0; len],
            eta_dot: vec![0.0; len],
            f_eta: vec![0.0; len],
            q: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.eta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.eta.is_empty()
    }

    /// Zeroes positions, velocities and forces. Masses are kept.
    pub fn reset(&mut self) {
        self.eta.fill(0.0);
        self.eta_dot.fill(0.0);
        self.f_eta.fill(0.0);
    }

    pub fn reverse(&mut self) {
        self.eta_dot.iter_mut().for_each(|v| *v = -*v);
    }

    /// Advances the chain by `dt` in `iter` equal sub-steps against a coupled subsystem.
    ///
    /// `kinetic2` is twice the kinetic energy of the `ndof` coupled degrees of freedom
    /// and `kt` the target thermal energy. Returns the factor by which the coupled
    /// momenta must be scaled. The sub-step sequence is palindromic, so the update is
    /// undone exactly by running it again with negated chain and subsystem momenta.
    pub fn advance(&mut self, kinetic2: f64, ndof: f64, kt: f64, dt: f64, iter: usize) -> f64 {
        let m = self.len();
        if m == 0 || iter == 0 || self.q[0] == 0.0 {
            return 1.0;
        }
        let delta = dt / iter as f64;
        let mut kinetic2 = kinetic2;
        let mut scale = 1.0;

        for _ in 0..iter {
            self.f_eta[0] = (kinetic2 - ndof * kt) / self.q[0];

            self.eta_dot[m - 1] += 0.5 * delta * self.f_eta[m - 1];
            for j in (0..m - 1).rev() {
                self.kick(j, delta);
            }

            let s = (-delta * self.eta_dot[0]).exp();
            scale *= s;
            kinetic2 *= s * s;
            for (eta, eta_dot) in self.eta.iter_mut().zip(&self.eta_dot) {
                *eta += delta * eta_dot;
            }

            self.f_eta[0] = (kinetic2 - ndof * kt) / self.q[0];
            for j in 0..m - 1 {
                self.kick(j, delta);
                self.f_eta[j + 1] =
                    (self.q[j] * self.eta_dot[j] * self.eta_dot[j] - kt) / self.q[j + 1];
            }
            self.eta_dot[m - 1] += 0.5 * delta * self.f_eta[m - 1];
        }
        scale
    }

    /// Half kick of link `j` damped by the link above it.
    fn kick(&mut self, j: usize, delta: f64) {
        let a = (-0.25 * delta * self.eta_dot[j + 1]).exp();
        self.eta_dot[j] = (self.eta_dot[j] * a + 0.5 * delta * self.f_eta[j]) * a;
    }

    /// Kinetic plus potential energy of the chain, the first link driven by `ndof`
    /// degrees of freedom.
    pub fn energy(&self, ndof: f64, kt: f64) -> f64 {
        self.eta
            .iter()
            .zip(&self.eta_dot)
            .zip(&self.q)
            .enumerate()
            .map(|(j, ((eta, eta_dot), q))| {
                let weight = if j == 0 { ndof } else { 1.0 };
                0.5 * q * eta_dot * eta_dot + weight * kt * eta
            })
            .sum()
    }
}
