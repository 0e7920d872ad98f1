use log::warn;
use rand::Rng;

use crate::{
    adapt_strategy::{WarmupController, WarmupPhase},
    hamiltonian::{EuclideanHamiltonian, EuclideanPoint, InitPointError},
    mass_matrix::Metric,
    model::LogpFunc,
    nuts::{self, InitError, InitFailure, InitKind, NutsError, NutsOptions, Result},
    sampler::{Engine, HmcSettings, InitStrategy, SampleRecord},
    static_hmc,
};

/// A single Markov chain: the current point, the Hamiltonian with its
/// metric, and the warm-up state.
pub struct HmcChain<F: LogpFunc, R: Rng> {
    hamiltonian: EuclideanHamiltonian<F, Metric>,
    controller: WarmupController,
    engine: Engine,
    nuts_options: NutsOptions,
    step_size_jitter: f64,
    rng: R,
    state: Option<EuclideanPoint>,
    chain: u64,
    draw_count: u64,
}

impl<F: LogpFunc, R: Rng> HmcChain<F, R> {
    pub fn new(logp: F, settings: &HmcSettings, rng: R, chain: u64) -> Result<Self> {
        settings.validate()?;
        let dim = logp.dim();
        let hamiltonian = EuclideanHamiltonian::new(
            logp,
            Metric::new(settings.metric, dim),
            settings.max_energy_error,
            settings.step_size.unwrap_or(1f64),
        );
        Ok(Self {
            hamiltonian,
            controller: WarmupController::new(settings, settings.metric, dim),
            engine: settings.engine,
            nuts_options: NutsOptions {
                maxdepth: settings.maxdepth,
                turning: settings.turning,
            },
            step_size_jitter: settings.step_size_jitter,
            rng,
            state: None,
            chain,
            draw_count: 0,
        })
    }

    /// Initialize the chain at a user specified position. This has to be
    /// called (or one of the `initialize` methods) before [`Self::draw`].
    pub fn set_position(&mut self, position: &[f64]) -> Result<()> {
        self.try_position(position, InitKind::UserSpecified)
    }

    /// Initialize the chain. Random positions are drawn uniformly from
    /// `(-radius, radius)`.
    pub fn initialize(&mut self, init: &InitStrategy) -> Result<()> {
        self.initialize_with(init, |rng, radius, position| {
            position
                .iter_mut()
                .for_each(|x| *x = rng.random_range(-radius..radius));
            Ok(())
        })
    }

    /// Initialize the chain, drawing random positions with `random_position`.
    ///
    /// Random initialization retries until a position with finite density
    /// and gradient is found, or gives up after `max_tries` attempts.
    pub fn initialize_with<G>(&mut self, init: &InitStrategy, mut random_position: G) -> Result<()>
    where
        G: FnMut(&mut R, f64, &mut [f64]) -> anyhow::Result<()>,
    {
        match init {
            InitStrategy::Zero => {
                let zero = vec![0f64; self.dim()];
                self.try_position(&zero, InitKind::Zero)
            }
            InitStrategy::User(position) => self.try_position(position, InitKind::UserSpecified),
            &InitStrategy::Random { radius, max_tries } => {
                if !(radius.is_finite() & (radius > 0.)) {
                    return Err(NutsError::InvalidSettings(format!(
                        "init radius must be positive, got {radius}"
                    )));
                }
                let mut position = vec![0f64; self.dim()];
                let mut last = None;
                for attempt in 1..=max_tries {
                    random_position(&mut self.rng, radius, &mut position).map_err(|error| {
                        NutsError::Model {
                            chain: self.chain,
                            error,
                        }
                    })?;
                    match self.try_position(&position, InitKind::Random) {
                        Ok(()) => return Ok(()),
                        Err(NutsError::Init(err)) => {
                            warn!("Chain {}: {err} Attempt {attempt} of {max_tries}.", self.chain);
                            last = Some(err);
                        }
                        Err(err) => return Err(err),
                    }
                }
                match last {
                    Some(last) => Err(NutsError::InitAttemptsExhausted {
                        radius,
                        tries: max_tries,
                        last,
                    }),
                    None => Err(NutsError::InvalidSettings(
                        "random initialization needs at least one attempt".to_string(),
                    )),
                }
            }
        }
    }

    fn try_position(&mut self, position: &[f64], kind: InitKind) -> Result<()> {
        if position.len() != self.dim() {
            return Err(NutsError::InvalidSettings(format!(
                "initial position has length {}, expected {}",
                position.len(),
                self.dim()
            )));
        }
        let point = match self.hamiltonian.init_state(position) {
            Ok(point) => point,
            Err(InitPointError::VanishingDensity) => {
                return Err(InitError {
                    kind,
                    reason: InitFailure::VanishingDensity,
                }
                .into())
            }
            Err(InitPointError::GradientFailure) => {
                return Err(InitError {
                    kind,
                    reason: InitFailure::GradientFailure,
                }
                .into())
            }
            Err(InitPointError::Unrecoverable(err)) => return Err(NutsError::logp(err)),
        };
        self.controller
            .init(&mut self.hamiltonian, &point, &mut self.rng)
            .map_err(NutsError::logp)?;
        self.state = Some(point);
        self.draw_count = 0;
        Ok(())
    }

    /// Do one transition, adapt if still in warm-up, and return the new
    /// draw with its diagnostics.
    pub fn draw(&mut self) -> Result<SampleRecord> {
        let init = self
            .state
            .as_mut()
            .ok_or(NutsError::NotInitialized(self.chain))?;

        let tuning = self.controller.is_tuning();
        let step_size = self.hamiltonian.step_size();
        if !tuning & (self.step_size_jitter > 0.) {
            let u: f64 = self.rng.random();
            *self.hamiltonian.step_size_mut() =
                step_size * (1. + self.step_size_jitter * (2. * u - 1.));
        }
        let used_step_size = self.hamiltonian.step_size();

        let result = match self.engine {
            Engine::Nuts => nuts::draw(
                init,
                &mut self.rng,
                &mut self.hamiltonian,
                &self.nuts_options,
            ),
            Engine::Static { length } => {
                let n_steps = length.n_steps(used_step_size);
                static_hmc::draw(init, &mut self.rng, &mut self.hamiltonian, n_steps)
            }
        };
        *self.hamiltonian.step_size_mut() = step_size;
        let (point, info) = result?;

        if tuning {
            self.controller
                .adapt(
                    &mut self.hamiltonian,
                    &point,
                    info.mean_tree_accept,
                    &mut self.rng,
                )
                .map_err(NutsError::logp)?;
        } else if let Some(divergence) = info.divergence_info.as_ref() {
            warn!(
                "Chain {}: divergent transition at draw {} with energy error {:?}",
                self.chain, self.draw_count, divergence.energy_error
            );
        }

        let record = SampleRecord {
            chain: self.chain,
            draw: self.draw_count,
            tuning,
            position: point.position.clone(),
            logp: point.logp(),
            energy: point.energy(),
            energy_error: point.energy_error(),
            step_size: used_step_size,
            step_size_bar: self.controller.step_size_bar(),
            depth: info.depth,
            n_steps: info.n_steps,
            maxdepth_reached: info.reached_maxdepth,
            diverging: info.divergence_info.is_some(),
            accept_stat: info.mean_tree_accept,
            index_in_trajectory: point.index_in_trajectory(),
            divergence: info.divergence_info,
        };

        self.state = Some(point);
        self.draw_count += 1;
        Ok(record)
    }

    /// The dimensionality of the posterior.
    pub fn dim(&self) -> usize {
        self.hamiltonian.dim()
    }

    pub fn chain(&self) -> u64 {
        self.chain
    }

    pub fn is_tuning(&self) -> bool {
        self.controller.is_tuning()
    }

    pub fn phase(&self) -> WarmupPhase {
        self.controller.phase()
    }

    /// The step size without jitter.
    pub fn step_size(&self) -> f64 {
        self.hamiltonian.step_size()
    }

    pub fn metric(&self) -> &Metric {
        self.hamiltonian.mass_matrix()
    }

    pub fn metric_updates(&self) -> u64 {
        self.controller.metric_updates()
    }

    /// The current position, if the chain was initialized.
    pub fn position(&self) -> Option<&[f64]> {
        self.state.as_ref().map(|point| point.position())
    }
}
