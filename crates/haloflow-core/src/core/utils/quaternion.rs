//! Quaternion kinematics for rigid bodies.
//!
//! Orientations are unit quaternions `q` mapping body-frame vectors to the space frame.
//! Angular momentum is carried as the conjugate quaternion momentum `p = 2 q ⊗ (0, L)`
//! where `L` is the body-frame angular momentum, which lets the NO_SQUISH splitting of
//! Miller et al. (J. Chem. Phys. 116, 8649) rotate bodies symplectically and
//! time-reversibly.

use nalgebra::{Quaternion, Vector3};

/// Quaternion-vector product `q ⊗ (0, v)`.
pub fn quatvec(q: &Quaternion<f64>, v: &Vector3<f64>) -> Quaternion<f64> {
    q * Quaternion::from_imag(*v)
}

/// Rotates a space-frame vector into the body frame of `q`.
pub fn to_body(q: &Quaternion<f64>, v: &Vector3<f64>) -> Vector3<f64> {
    (q.conjugate() * Quaternion::from_imag(*v) * q).imag()
}

/// Rotates a body-frame vector into the space frame of `q`.
pub fn to_space(q: &Quaternion<f64>, v: &Vector3<f64>) -> Vector3<f64> {
    (q * Quaternion::from_imag(*v) * q.conjugate()).imag()
}

/// The permutation `P_k(x)` of the NO_SQUISH scheme for body axis `k` in `1..=3`.
fn permute(k: usize, x: &Quaternion<f64>) -> Quaternion<f64> {
    let (w, i, j, l) = (x.w, x.i, x.j, x.k);
    match k {
        1 => Quaternion::new(-i, w, l, -j),
        2 => Quaternion::new(-j, -l, w, i),
        _ => Quaternion::new(-l, j, -i, w),
    }
}

/// Body-frame angular momentum encoded in the conjugate momentum `p`.
pub fn body_angmom(q: &Quaternion<f64>, p: &Quaternion<f64>) -> Vector3<f64> {
    Vector3::new(
        0.5 * p.dot(&permute(1, q)),
        0.5 * p.dot(&permute(2, q)),
        0.5 * p.dot(&permute(3, q)),
    )
}

/// Conjugate momentum for a body-frame angular momentum.
pub fn conjugate_momentum(q: &Quaternion<f64>, angmom_body: &Vector3<f64>) -> Quaternion<f64> {
    quatvec(q, angmom_body) * 2.0
}

/// Twice the rotational kinetic energy, `Σ L_k² / I_k` over non-zero moments.
pub fn rotational_kinetic2(
    q: &Quaternion<f64>,
    p: &Quaternion<f64>,
    inertia: &Vector3<f64>,
) -> f64 {
    let l = body_angmom(q, p);
    (0..3)
        .filter(|&k| inertia[k] > 0.0)
        .map(|k| l[k] * l[k] / inertia[k])
        .sum()
}

/// Exact free rotation about body axis `k` (1-based) for a time `dt`.
///
/// Axes with zero moment of inertia are left untouched.
pub fn no_squish_rotate(
    k: usize,
    p: &mut Quaternion<f64>,
    q: &mut Quaternion<f64>,
    inertia: &Vector3<f64>,
    dt: f64,
) {
    let moment = inertia[k - 1];
    if moment == 0.0 {
        return;
    }
    let kq = permute(k, q);
    let kp = permute(k, p);
    let phi = p.dot(&kq) / (4.0 * moment);
    let (s, c) = (phi * dt).sin_cos();
    *p = *p * c + kp * s;
    *q = *q * c + kq * s;
}

/// The symmetric NO_SQUISH sequence `R3(dt/2) R2(dt/2) R1(dt) R2(dt/2) R3(dt/2)`.
pub fn no_squish_step(
    p: &mut Quaternion<f64>,
    q: &mut Quaternion<f64>,
    inertia: &Vector3<f64>,
    dt: f64,
) {
    let half = 0.5 * dt;
    no_squish_rotate(3, p, q, inertia, half);
    no_squish_rotate(2, p, q, inertia, half);
    no_squish_rotate(1, p, q, inertia, dt);
    no_squish_rotate(2, p, q, inertia, half);
    no_squish_rotate(3, p, q, inertia, half);
}
