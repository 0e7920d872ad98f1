use std::sync::Arc;

use rand::{distr::StandardUniform, prelude::Distribution, Rng};

use crate::{
    integrator::{leapfrog, update_potential_gradient},
    mass_matrix::MassMatrix,
    math::{axpy_out, diff_prods, scalar_prods2, scalar_prods3},
    model::{LogpError, LogpFunc},
};

/// Details about a divergence that might have occured during sampling
///
/// There are two reasons why we might observe a divergence:
/// - The energy error of a leapfrog step exceeded the configured threshold,
///   or is not finite.
/// - The logp function signaled a recoverable error (a domain failure).
///
/// The `logp_function_error` field contains the logp error in the second
/// case, `energy_error` and `end_location` are only known in the first.
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    pub start_momentum: Option<Box<[f64]>>,
    pub start_location: Option<Box<[f64]>>,
    pub start_gradient: Option<Box<[f64]>>,
    pub end_location: Option<Box<[f64]>>,
    pub energy_error: Option<f64>,
    pub end_idx_in_trajectory: Option<i64>,
    pub start_idx_in_trajectory: Option<i64>,
    pub logp_function_error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub(crate) fn sign(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Which version of the no-U-turn criterion the tree uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurningCriterion {
    /// Stop when the position difference between the two ends of a
    /// (sub)trajectory points against the velocity at either end.
    #[default]
    PositionDifference,
    /// The generalized criterion, which replaces the position difference by
    /// the sum of all momenta in the trajectory.
    MomentumSum,
}

/// A point in phase space, together with its location in the current
/// trajectory.
#[derive(Debug, Clone)]
pub struct EuclideanPoint {
    pub position: Box<[f64]>,
    pub velocity: Box<[f64]>,
    pub gradient: Box<[f64]>,
    pub momentum: Box<[f64]>,
    pub kinetic_energy: f64,
    pub potential_energy: f64,
    pub index_in_trajectory: i64,
    pub p_sum: Box<[f64]>,
    pub initial_energy: f64,
}

impl EuclideanPoint {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            position: vec![0f64; dim].into(),
            velocity: vec![0f64; dim].into(),
            gradient: vec![0f64; dim].into(),
            momentum: vec![0f64; dim].into(),
            kinetic_energy: 0f64,
            potential_energy: 0f64,
            index_in_trajectory: 0,
            p_sum: vec![0f64; dim].into(),
            initial_energy: 0f64,
        }
    }

    pub fn energy(&self) -> f64 {
        self.potential_energy + self.kinetic_energy
    }

    pub fn energy_error(&self) -> f64 {
        self.energy() - self.initial_energy
    }

    pub fn logp(&self) -> f64 {
        -self.potential_energy
    }

    pub fn position(&self) -> &[f64] {
        &self.position
    }

    pub fn index_in_trajectory(&self) -> i64 {
        self.index_in_trajectory
    }

    fn set_psum(&self, out: &mut Self) {
        assert!(out.index_in_trajectory != 0);

        if out.index_in_trajectory == -1 {
            out.p_sum.copy_from_slice(&out.momentum);
        } else {
            axpy_out(&out.momentum, &self.p_sum, 1., &mut out.p_sum);
        }
    }

    fn is_turning_momentum_sum(&self, other: &Self) -> bool {
        let (start, end) = self.ordered(other);

        let a = start.index_in_trajectory;
        let b = end.index_in_trajectory;

        let (turn1, turn2) = if (a >= 0) & (b >= 0) {
            scalar_prods3(
                &end.p_sum,
                &start.p_sum,
                &start.momentum,
                &end.velocity,
                &start.velocity,
            )
        } else if (b >= 0) & (a < 0) {
            scalar_prods2(&end.p_sum, &start.p_sum, &end.velocity, &start.velocity)
        } else {
            assert!((a < 0) & (b < 0));
            scalar_prods3(
                &start.p_sum,
                &end.p_sum,
                &end.momentum,
                &end.velocity,
                &start.velocity,
            )
        };

        (turn1 < 0.) | (turn2 < 0.)
    }

    fn is_turning_position_difference(&self, other: &Self) -> bool {
        let (start, end) = self.ordered(other);
        let (turn1, turn2) = diff_prods(
            &end.position,
            &start.position,
            &end.velocity,
            &start.velocity,
        );
        (turn1 < 0.) | (turn2 < 0.)
    }

    fn ordered<'a>(&'a self, other: &'a Self) -> (&'a Self, &'a Self) {
        let pair = if self.index_in_trajectory < other.index_in_trajectory {
            (self, other)
        } else {
            (other, self)
        };
        assert!(pair.0.index_in_trajectory < pair.1.index_in_trajectory);
        pair
    }
}

pub(crate) enum LeapfrogResult<E: LogpError> {
    Ok(EuclideanPoint),
    Divergence(DivergenceInfo),
    Err(E),
}

/// Why the density could not be evaluated at an initial point.
#[derive(Debug)]
pub(crate) enum InitPointError<E> {
    VanishingDensity,
    GradientFailure,
    Unrecoverable(E),
}

/// The hamiltonian `H(q, p) = -log π(q) + ½ pᵀ M⁻¹ p` of a log density
/// together with a mass matrix, and the integrator settings.
pub struct EuclideanHamiltonian<F: LogpFunc, Mass: MassMatrix> {
    pub(crate) logp: F,
    pub(crate) mass_matrix: Mass,
    max_energy_error: f64,
    step_size: f64,
}

impl<F: LogpFunc, Mass: MassMatrix> EuclideanHamiltonian<F, Mass> {
    pub fn new(logp: F, mass_matrix: Mass, max_energy_error: f64, step_size: f64) -> Self {
        EuclideanHamiltonian {
            logp,
            mass_matrix,
            max_energy_error,
            step_size,
        }
    }

    pub fn dim(&self) -> usize {
        self.logp.dim()
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    pub fn step_size_mut(&mut self) -> &mut f64 {
        &mut self.step_size
    }

    pub fn mass_matrix(&self) -> &Mass {
        &self.mass_matrix
    }

    /// Make one leapfrog step from `start` in direction `dir`.
    ///
    /// A recoverable logp error or an energy error above
    /// `max_energy_error` is reported as a divergence.
    pub(crate) fn leapfrog(
        &mut self,
        start: &EuclideanPoint,
        dir: Direction,
    ) -> LeapfrogResult<F::LogpError> {
        let mut out = start.clone();
        let sign = dir.sign();
        let epsilon = (sign as f64) * self.step_size;

        if let Err(logp_error) = leapfrog(
            &mut self.logp,
            &self.mass_matrix,
            start,
            &mut out,
            epsilon,
        ) {
            if !logp_error.is_recoverable() {
                return LeapfrogResult::Err(logp_error);
            }
            let div_info = DivergenceInfo {
                logp_function_error: Some(Arc::new(logp_error)),
                start_location: Some(start.position.clone()),
                start_gradient: Some(start.gradient.clone()),
                start_momentum: Some(start.momentum.clone()),
                end_location: None,
                start_idx_in_trajectory: Some(start.index_in_trajectory),
                end_idx_in_trajectory: None,
                energy_error: None,
            };
            return LeapfrogResult::Divergence(div_info);
        }

        out.index_in_trajectory = start.index_in_trajectory + sign;
        start.set_psum(&mut out);

        let energy_error = out.energy_error();
        if (energy_error.abs() > self.max_energy_error) | !energy_error.is_finite() {
            let divergence_info = DivergenceInfo {
                logp_function_error: None,
                start_location: Some(start.position.clone()),
                start_gradient: Some(start.gradient.clone()),
                end_location: Some(out.position.clone()),
                start_momentum: Some(start.momentum.clone()),
                start_idx_in_trajectory: Some(start.index_in_trajectory),
                end_idx_in_trajectory: Some(out.index_in_trajectory),
                energy_error: Some(energy_error),
            };
            return LeapfrogResult::Divergence(divergence_info);
        }

        LeapfrogResult::Ok(out)
    }

    /// Evaluate the density at an initial position.
    pub(crate) fn init_state(
        &mut self,
        init: &[f64],
    ) -> Result<EuclideanPoint, InitPointError<F::LogpError>> {
        let mut point = EuclideanPoint::new(self.dim());
        point.position.copy_from_slice(init);

        if let Err(err) = update_potential_gradient(&mut self.logp, &mut point) {
            if err.is_recoverable() {
                return Err(InitPointError::GradientFailure);
            }
            return Err(InitPointError::Unrecoverable(err));
        }
        if !point.potential_energy.is_finite() {
            return Err(InitPointError::VanishingDensity);
        }
        if !point.gradient.iter().all(|g| g.is_finite()) {
            return Err(InitPointError::GradientFailure);
        }
        Ok(point)
    }

    /// Draw a fresh momentum and turn `point` into the start of a new
    /// trajectory.
    pub(crate) fn initialize_trajectory<R: Rng + ?Sized>(
        &self,
        point: &mut EuclideanPoint,
        rng: &mut R,
    ) {
        self.mass_matrix.randomize_momentum(rng, &mut point.momentum);
        self.mass_matrix
            .update_velocity(&point.momentum, &mut point.velocity);
        point.kinetic_energy = self
            .mass_matrix
            .kinetic_energy(&point.momentum, &point.velocity);
        point.index_in_trajectory = 0;
        point.initial_energy = point.energy();
        point.p_sum.copy_from_slice(&point.momentum);
    }

    pub(crate) fn is_turning(
        &self,
        criterion: TurningCriterion,
        point1: &EuclideanPoint,
        point2: &EuclideanPoint,
    ) -> bool {
        match criterion {
            TurningCriterion::PositionDifference => point1.is_turning_position_difference(point2),
            TurningCriterion::MomentumSum => point1.is_turning_momentum_sum(point2),
        }
    }
}
