use log::debug;
use rand::Rng;

use crate::{
    hamiltonian::{Direction, EuclideanHamiltonian, EuclideanPoint, LeapfrogResult},
    mass_matrix::MassMatrix,
    model::LogpFunc,
};

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DualAverageOptions {
    /// The acceptance statistic the adaptation aims for.
    pub target_accept: f64,
    /// Relaxation exponent of the averaged iterate.
    pub k: f64,
    /// Number of iterations that are considered "already done".
    pub t0: f64,
    /// Regularization scale.
    pub gamma: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            target_accept: 0.8,
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
        }
    }
}

/// Dual averaging of the log step size (Nesterov 2009, as used by
/// Hoffman & Gelman 2014).
#[derive(Debug, Clone)]
pub struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    settings: DualAverageOptions,
}

impl DualAverage {
    pub fn new(settings: DualAverageOptions, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            settings,
        }
    }

    /// Update with the acceptance statistic of the last transition.
    ///
    /// The statistic is clamped to `[0, 1]`, NaN counts as zero.
    pub fn advance(&mut self, accept_stat: f64) {
        let accept_stat = if accept_stat.is_nan() {
            0f64
        } else {
            accept_stat.clamp(0., 1.)
        };
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (self.settings.target_accept - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    pub fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    pub fn current_step_size_adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }

    pub fn reset(&mut self, initial_step: f64, bias_factor: f64) {
        self.log_step = initial_step.ln();
        self.log_step_adapted = initial_step.ln();
        self.hbar = 0f64;
        self.mu = (bias_factor * initial_step).ln();
        self.count = 1;
    }
}

const SEARCH_ACCEPT: f64 = 0.8;
const SEARCH_MAX_ITER: usize = 100;
const MIN_STEP_SIZE: f64 = 1e-10;
const MAX_STEP_SIZE: f64 = 1e5;

/// Find a step size for which a single leapfrog step from `point` has an
/// acceptance probability of about 0.8.
///
/// Starting from `initial_step`, the step size is doubled while the
/// acceptance probability stays above 0.8, or halved while it stays below.
/// Each trial draws a fresh momentum. If the search does not terminate,
/// `initial_step` is returned.
pub(crate) fn find_reasonable_step_size<F, Mass, R>(
    hamiltonian: &mut EuclideanHamiltonian<F, Mass>,
    point: &EuclideanPoint,
    initial_step: f64,
    rng: &mut R,
) -> Result<f64, F::LogpError>
where
    F: LogpFunc,
    Mass: MassMatrix,
    R: Rng + ?Sized,
{
    let mut state = point.clone();
    let mut trial = |hamiltonian: &mut EuclideanHamiltonian<F, Mass>,
                     step_size: f64|
     -> Result<f64, F::LogpError> {
        *hamiltonian.step_size_mut() = step_size;
        hamiltonian.initialize_trajectory(&mut state, &mut *rng);
        match hamiltonian.leapfrog(&state, Direction::Forward) {
            LeapfrogResult::Ok(next) => Ok((state.energy() - next.energy()).min(0.).exp()),
            LeapfrogResult::Divergence(_) => Ok(0f64),
            LeapfrogResult::Err(err) => Err(err),
        }
    };

    let mut step_size = initial_step;
    let accept_stat = trial(hamiltonian, step_size)?;
    let dir = if accept_stat > SEARCH_ACCEPT {
        Direction::Forward
    } else {
        Direction::Backward
    };

    for _ in 0..SEARCH_MAX_ITER {
        let accept_stat = trial(hamiltonian, step_size)?;
        match dir {
            Direction::Forward => {
                if (accept_stat <= SEARCH_ACCEPT) | (step_size > MAX_STEP_SIZE) {
                    *hamiltonian.step_size_mut() = step_size;
                    return Ok(step_size);
                }
                step_size *= 2.;
            }
            Direction::Backward => {
                if (accept_stat >= SEARCH_ACCEPT) | (step_size < MIN_STEP_SIZE) {
                    *hamiltonian.step_size_mut() = step_size;
                    return Ok(step_size);
                }
                step_size /= 2.;
            }
        }
    }
    debug!("Step size search did not converge, using {initial_step}");
    *hamiltonian.step_size_mut() = initial_step;
    Ok(initial_step)
}

/// Step size adaptation during warm-up.
///
/// While tuning, the step size follows the dual averaging iterate. Once
/// finalized, the averaged step size is used and no longer changes.
#[derive(Debug, Clone)]
pub struct StepSizeAdapter {
    dual_average: DualAverage,
    options: DualAverageOptions,
    step_size: f64,
    finalized: bool,
}

impl StepSizeAdapter {
    pub fn new(options: DualAverageOptions, initial_step: f64) -> Self {
        Self {
            dual_average: DualAverage::new(options, initial_step),
            options,
            step_size: initial_step,
            finalized: false,
        }
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// The averaged step size, which becomes the final one.
    pub fn step_size_bar(&self) -> f64 {
        self.dual_average.current_step_size_adapted()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn options(&self) -> &DualAverageOptions {
        &self.options
    }

    /// Feed the acceptance statistic of a warm-up transition and return
    /// the step size for the next one.
    pub fn adapt(&mut self, accept_stat: f64) -> f64 {
        if self.finalized {
            return self.step_size;
        }
        self.dual_average.advance(accept_stat);
        self.step_size = self.dual_average.current_step_size();
        self.step_size
    }

    /// Restart dual averaging around a new step size, for example after the
    /// metric changed.
    pub fn restart(&mut self, step_size: f64) {
        self.dual_average.reset(step_size, 10.);
        self.step_size = step_size;
        self.finalized = false;
    }

    /// Freeze the step size at the averaged value.
    pub fn finalize(&mut self) -> f64 {
        self.step_size = self.dual_average.current_step_size_adapted();
        self.finalized = true;
        self.step_size
    }
}
