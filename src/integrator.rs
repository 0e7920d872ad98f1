//! The leapfrog integrator for Hamiltonian dynamics.
//!
//! One step of size `ε` from `(q, p)` is
//!
//! ```text
//! p½ = p + ε/2 ∇log π(q)
//! q' = q + ε M⁻¹ p½
//! p' = p½ + ε/2 ∇log π(q')
//! ```
//!
//! The updates have to happen in exactly this order: the map is then
//! symplectic and time-reversible, which is what makes the Metropolis
//! correction of HMC and the trajectory sampling of NUTS valid.

use crate::{
    hamiltonian::EuclideanPoint,
    mass_matrix::MassMatrix,
    math::{axpy, axpy_out},
    model::LogpFunc,
};

fn first_momentum_halfstep(start: &EuclideanPoint, out: &mut EuclideanPoint, epsilon: f64) {
    axpy_out(&start.gradient, &start.momentum, epsilon / 2., &mut out.momentum);
}

fn position_step(start: &EuclideanPoint, out: &mut EuclideanPoint, epsilon: f64) {
    axpy_out(&out.velocity, &start.position, epsilon, &mut out.position);
}

fn second_momentum_halfstep(out: &mut EuclideanPoint, epsilon: f64) {
    axpy(&out.gradient, &mut out.momentum, epsilon / 2.);
}

/// Evaluate the density at the position of `point` and store potential
/// energy and gradient.
pub(crate) fn update_potential_gradient<F: LogpFunc>(
    logp: &mut F,
    point: &mut EuclideanPoint,
) -> Result<(), F::LogpError> {
    let logp = logp.logp(&point.position, &mut point.gradient)?;
    point.potential_energy = -logp;
    Ok(())
}

/// Perform one leapfrog step of (signed) length `epsilon` from `start`
/// and write the result to `out`.
///
/// Only position, momentum, velocity, gradient and the two energies of `out`
/// are written. If the density can not be evaluated at the new position,
/// the error is returned and `out` is left with a half updated momentum.
pub(crate) fn leapfrog<F: LogpFunc, Mass: MassMatrix>(
    logp: &mut F,
    mass_matrix: &Mass,
    start: &EuclideanPoint,
    out: &mut EuclideanPoint,
    epsilon: f64,
) -> Result<(), F::LogpError> {
    first_momentum_halfstep(start, out, epsilon);
    mass_matrix.update_velocity(&out.momentum, &mut out.velocity);

    position_step(start, out, epsilon);
    update_potential_gradient(logp, out)?;

    second_momentum_halfstep(out, epsilon);

    mass_matrix.update_velocity(&out.momentum, &mut out.velocity);
    out.kinetic_energy = mass_matrix.kinetic_energy(&out.momentum, &out.velocity);
    Ok(())
}
