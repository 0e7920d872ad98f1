use rand::Rng;

use crate::{
    hamiltonian::{Direction, EuclideanHamiltonian, EuclideanPoint, LeapfrogResult},
    mass_matrix::MassMatrix,
    model::LogpFunc,
    nuts::{NutsError, Result, SampleInfo},
};

/// How long the trajectories of static HMC are.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrajectoryLength {
    /// A fixed number of leapfrog steps.
    Steps(u64),
    /// A fixed integration time `T`, so that the number of steps is
    /// `max(1, floor(T / ε))` for the current step size `ε`.
    IntegrationTime(f64),
}

impl Default for TrajectoryLength {
    fn default() -> Self {
        TrajectoryLength::IntegrationTime(2. * std::f64::consts::PI)
    }
}

impl TrajectoryLength {
    pub fn n_steps(&self, step_size: f64) -> u64 {
        match *self {
            TrajectoryLength::Steps(n) => n.max(1),
            TrajectoryLength::IntegrationTime(time) => ((time / step_size) as u64).max(1),
        }
    }
}

/// Draw a new point with a Metropolis corrected trajectory of `n_steps`
/// leapfrog steps from `init`.
///
/// The proposal is the end of the trajectory and is accepted with
/// probability `min(1, exp(-ΔH))`, which is also the reported acceptance
/// statistic. A divergence rejects the proposal.
pub(crate) fn draw<F, Mass, R>(
    init: &mut EuclideanPoint,
    rng: &mut R,
    hamiltonian: &mut EuclideanHamiltonian<F, Mass>,
    n_steps: u64,
) -> Result<(EuclideanPoint, SampleInfo)>
where
    F: LogpFunc,
    Mass: MassMatrix,
    R: Rng + ?Sized,
{
    hamiltonian.initialize_trajectory(init, rng);

    let mut state = init.clone();
    for step in 0..n_steps {
        state = match hamiltonian.leapfrog(&state, Direction::Forward) {
            LeapfrogResult::Ok(next) => next,
            LeapfrogResult::Divergence(info) => {
                let sample_info = SampleInfo {
                    depth: 0,
                    divergence_info: Some(info),
                    reached_maxdepth: false,
                    n_steps: step + 1,
                    mean_tree_accept: 0.,
                };
                return Ok((init.clone(), sample_info));
            }
            LeapfrogResult::Err(err) => return Err(NutsError::logp(err)),
        };
    }

    let accept_prob = (init.energy() - state.energy()).min(0.).exp();
    let sample_info = SampleInfo {
        depth: 0,
        divergence_info: None,
        reached_maxdepth: false,
        n_steps,
        mean_tree_accept: accept_prob,
    };
    if rng.random::<f64>() < accept_prob {
        Ok((state, sample_info))
    } else {
        Ok((init.clone(), sample_info))
    }
}
