use std::fmt;

use rand::Rng;
use thiserror::Error;

use crate::{
    hamiltonian::{
        Direction, DivergenceInfo, EuclideanHamiltonian, EuclideanPoint, LeapfrogResult,
        TurningCriterion,
    },
    mass_matrix::{MassMatrix, MetricError},
    math::logaddexp,
    model::LogpFunc,
};

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum NutsError {
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Init(#[from] InitError),

    #[error("Initialization between (-{radius}, {radius}) failed after {tries} attempts.")]
    InitAttemptsExhausted {
        radius: f64,
        tries: u64,
        #[source]
        last: InitError,
    },

    #[error("Invalid metric: {0}")]
    Metric(#[from] MetricError),

    #[error("Could not write draw to the output sink: {0:#}")]
    Sink(anyhow::Error),

    #[error("Could not create the log density of chain {chain}: {error:#}")]
    Model { chain: u64, error: anyhow::Error },

    #[error("Chain {0} has no initial position")]
    NotInitialized(u64),

    #[error("Sampling was interrupted")]
    Interrupted,

    #[error("Invalid sampler settings: {0}")]
    InvalidSettings(String),
}

pub type Result<T> = std::result::Result<T, NutsError>;

impl NutsError {
    pub(crate) fn logp<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        NutsError::LogpFailure(Box::new(err))
    }
}

/// How the initial point of a chain was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitKind {
    Zero,
    UserSpecified,
    Random,
}

impl fmt::Display for InitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitKind::Zero => write!(f, "initialization at zero"),
            InitKind::UserSpecified => write!(f, "user-specified initialization"),
            InitKind::Random => write!(f, "random initialization"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitFailure {
    /// The log density is `-inf` or not finite.
    VanishingDensity,
    /// The model signaled a domain failure, or the gradient is not finite.
    GradientFailure,
}

impl fmt::Display for InitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitFailure::VanishingDensity => write!(f, "vanishing density"),
            InitFailure::GradientFailure => write!(f, "gradient failure"),
        }
    }
}

/// An initial point was rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Rejecting {kind} because of {reason}.")]
pub struct InitError {
    pub kind: InitKind,
    pub reason: InitFailure,
}

/// Options for the NUTS tree
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NutsOptions {
    pub maxdepth: u64,
    pub turning: TurningCriterion,
}

impl Default for NutsOptions {
    fn default() -> Self {
        Self {
            maxdepth: 10,
            turning: TurningCriterion::default(),
        }
    }
}

/// Information about a draw, for diagnostics and adaptation.
#[derive(Debug, Clone)]
pub struct SampleInfo {
    /// The depth of the trajectory that this point was sampled from
    pub depth: u64,

    /// More detailed information about a divergence that might have
    /// occured in the trajectory.
    pub divergence_info: Option<DivergenceInfo>,

    /// Whether the trajectory was terminated because it reached
    /// the maximum tree depth.
    pub reached_maxdepth: bool,

    /// The number of leapfrog steps, including diverging and rejected ones.
    pub n_steps: u64,

    /// The mean acceptance probability of all leapfrog steps.
    pub mean_tree_accept: f64,
}

/// Acceptance statistics of the leapfrog steps in a (sub)tree, including
/// steps of subtrees that were thrown away.
#[derive(Debug, Clone, Copy, Default)]
struct TreeStats {
    sum_accept: f64,
    n_steps: u64,
}

impl TreeStats {
    fn merge(&mut self, other: TreeStats) {
        self.sum_accept += other.sum_accept;
        self.n_steps += other.n_steps;
    }

    fn mean(&self) -> f64 {
        if self.n_steps == 0 {
            0f64
        } else {
            self.sum_accept / self.n_steps as f64
        }
    }
}

/// A trajectory (sub)tree. Both ends and the current proposal are kept,
/// the inner points are never stored.
struct NutsTree {
    left: EuclideanPoint,
    right: EuclideanPoint,
    draw: EuclideanPoint,
    log_size: f64,
    depth: u64,
    initial_energy: f64,

    /// A tree is the main tree if it contains the initial point
    /// of the trajectory.
    is_main: bool,
    stats: TreeStats,
}

enum ExtendResult<E> {
    /// The tree extension succeeded properly, and the termination
    /// criterion was not reached.
    Ok(NutsTree),
    /// An unrecoverable error happend during a leapfrog step
    Err(E),
    /// Tree extension succeeded and the termination criterion
    /// was reached.
    Turning(NutsTree),
    /// A divergence happend during tree extension.
    Diverging(NutsTree, DivergenceInfo),
}

impl NutsTree {
    fn new(state: EuclideanPoint) -> NutsTree {
        let initial_energy = state.energy();
        NutsTree {
            right: state.clone(),
            left: state.clone(),
            draw: state,
            depth: 0,
            log_size: 0.,
            initial_energy,
            is_main: true,
            stats: TreeStats::default(),
        }
    }

    fn extend<F, Mass, R>(
        mut self,
        rng: &mut R,
        hamiltonian: &mut EuclideanHamiltonian<F, Mass>,
        direction: Direction,
        options: &NutsOptions,
    ) -> ExtendResult<F::LogpError>
    where
        F: LogpFunc,
        Mass: MassMatrix,
        R: Rng + ?Sized,
    {
        let mut other = match self.single_step(hamiltonian, direction) {
            Ok(Ok(tree)) => tree,
            Ok(Err(info)) => {
                self.stats.merge(TreeStats {
                    sum_accept: 0.,
                    n_steps: 1,
                });
                return ExtendResult::Diverging(self, info);
            }
            Err(err) => return ExtendResult::Err(err),
        };

        while other.depth < self.depth {
            use ExtendResult::*;
            other = match other.extend(rng, hamiltonian, direction, options) {
                Ok(tree) => tree,
                Turning(tree) => {
                    self.stats.merge(tree.stats);
                    return Turning(self);
                }
                Diverging(tree, info) => {
                    self.stats.merge(tree.stats);
                    return Diverging(self, info);
                }
                Err(error) => {
                    return Err(error);
                }
            };
        }

        let (first, last) = match direction {
            Direction::Forward => (&self.left, &other.right),
            Direction::Backward => (&other.left, &self.right),
        };

        let criterion = options.turning;
        let mut turning = hamiltonian.is_turning(criterion, first, last);
        if self.depth > 0 {
            if !turning {
                turning = hamiltonian.is_turning(criterion, &self.right, &other.right);
            }
            if !turning {
                turning = hamiltonian.is_turning(criterion, &self.left, &other.left);
            }
        }

        self.merge_into(other, rng, direction);

        if turning {
            ExtendResult::Turning(self)
        } else {
            ExtendResult::Ok(self)
        }
    }

    /// Merge a subtree of the same depth into this one and choose the new
    /// proposal.
    ///
    /// The main tree uses biased progressive sampling: the new subtree's
    /// proposal is taken with probability `min(1, w_other / w_self)`. Inner
    /// subtrees sample uniformly in proportion to their weights.
    fn merge_into<R: Rng + ?Sized>(&mut self, other: NutsTree, rng: &mut R, direction: Direction) {
        assert!(self.depth == other.depth);
        assert!(self.left.index_in_trajectory <= self.right.index_in_trajectory);
        match direction {
            Direction::Forward => {
                self.right = other.right;
            }
            Direction::Backward => {
                self.left = other.left;
            }
        }
        let log_size = logaddexp(self.log_size, other.log_size);

        let self_log_size = if self.is_main {
            assert!(self.left.index_in_trajectory <= 0);
            assert!(self.right.index_in_trajectory >= 0);
            self.log_size
        } else {
            log_size
        };

        if other.log_size >= self_log_size {
            self.draw = other.draw;
        } else if rng.random_bool((other.log_size - self_log_size).exp()) {
            self.draw = other.draw;
        }

        self.depth += 1;
        self.log_size = log_size;
        self.stats.merge(other.stats);
    }

    fn single_step<F: LogpFunc, Mass: MassMatrix>(
        &self,
        hamiltonian: &mut EuclideanHamiltonian<F, Mass>,
        direction: Direction,
    ) -> std::result::Result<std::result::Result<NutsTree, DivergenceInfo>, F::LogpError> {
        let start = match direction {
            Direction::Forward => &self.right,
            Direction::Backward => &self.left,
        };
        let end = match hamiltonian.leapfrog(start, direction) {
            LeapfrogResult::Ok(end) => end,
            LeapfrogResult::Divergence(info) => return Ok(Err(info)),
            LeapfrogResult::Err(err) => return Err(err),
        };

        let log_size = self.initial_energy - end.energy();
        let stats = TreeStats {
            sum_accept: log_size.min(0.).exp(),
            n_steps: 1,
        };
        Ok(Ok(NutsTree {
            right: end.clone(),
            left: end.clone(),
            draw: end,
            depth: 0,
            log_size,
            initial_energy: self.initial_energy,
            is_main: false,
            stats,
        }))
    }

    fn info(&self, maxdepth: bool, divergence_info: Option<DivergenceInfo>) -> SampleInfo {
        SampleInfo {
            depth: self.depth,
            divergence_info,
            reached_maxdepth: maxdepth,
            n_steps: self.stats.n_steps,
            mean_tree_accept: self.stats.mean(),
        }
    }
}

/// Draw a new point with NUTS, starting the trajectory at `init`.
///
/// `init` gets a fresh momentum. A diverging trajectory still returns a
/// valid draw from the part of the tree that was built before the
/// divergence, which is `init` itself if the very first step diverged.
pub(crate) fn draw<F, Mass, R>(
    init: &mut EuclideanPoint,
    rng: &mut R,
    hamiltonian: &mut EuclideanHamiltonian<F, Mass>,
    options: &NutsOptions,
) -> Result<(EuclideanPoint, SampleInfo)>
where
    F: LogpFunc,
    Mass: MassMatrix,
    R: Rng + ?Sized,
{
    hamiltonian.initialize_trajectory(init, rng);

    let mut tree = NutsTree::new(init.clone());
    while tree.depth < options.maxdepth {
        let direction: Direction = rng.random();
        tree = match tree.extend(rng, hamiltonian, direction, options) {
            ExtendResult::Ok(tree) => tree,
            ExtendResult::Turning(tree) => {
                let info = tree.info(false, None);
                return Ok((tree.draw, info));
            }
            ExtendResult::Diverging(tree, info) => {
                let info = tree.info(false, Some(info));
                return Ok((tree.draw, info));
            }
            ExtendResult::Err(error) => {
                return Err(NutsError::logp(error));
            }
        };
    }
    let info = tree.info(true, None);
    Ok((tree.draw, info))
}
