use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use log::{debug, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::{
    chain::HmcChain,
    hamiltonian::{DivergenceInfo, TurningCriterion},
    mass_matrix::MetricKind,
    mass_matrix_adapt::MetricAdaptOptions,
    model::{LogpFunc, Model},
    nuts::{NutsError, Result},
    static_hmc::TrajectoryLength,
    stepsize::DualAverageOptions,
};

/// The transition kernel used for every draw.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Engine {
    /// The No-U-Turn sampler with multinomial trajectory sampling.
    #[default]
    Nuts,
    /// Metropolis corrected HMC with a fixed trajectory length.
    Static { length: TrajectoryLength },
}

/// Settings for a sampling run
#[derive(Debug, Clone, Copy)]
pub struct HmcSettings {
    pub engine: Engine,
    pub metric: MetricKind,
    /// Adapt step size and metric during warm-up.
    pub adapt: bool,
    /// The number of warm-up iterations
    pub num_warmup: u64,
    /// The number of draws after warm-up
    pub num_draws: u64,
    /// Pass warm-up draws to the output sink as well.
    pub save_warmup: bool,
    /// The maximum tree depth of NUTS. At most `2^maxdepth - 1` leapfrog
    /// steps are done per draw.
    pub maxdepth: u64,
    /// A trajectory diverges if the energy error exceeds this value.
    pub max_energy_error: f64,
    pub turning: TurningCriterion,
    /// The initial step size. `None` searches for one.
    pub step_size: Option<f64>,
    /// Uniformly jitter the step size after warm-up by this fraction.
    pub step_size_jitter: f64,
    /// Report progress every `refresh` iterations, or never if zero.
    pub refresh: u64,
    pub seed: u64,
    pub num_chains: usize,
    pub step_size_adapt: DualAverageOptions,
    pub metric_adapt: MetricAdaptOptions,
}

impl Default for HmcSettings {
    fn default() -> Self {
        Self {
            engine: Engine::default(),
            metric: MetricKind::default(),
            adapt: true,
            num_warmup: 1000,
            num_draws: 1000,
            save_warmup: false,
            maxdepth: 10,
            max_energy_error: 1000f64,
            turning: TurningCriterion::default(),
            step_size: None,
            step_size_jitter: 0f64,
            refresh: 100,
            seed: 0,
            num_chains: 1,
            step_size_adapt: DualAverageOptions::default(),
            metric_adapt: MetricAdaptOptions::default(),
        }
    }
}

impl HmcSettings {
    /// Check that the settings describe a valid sampler.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(NutsError::InvalidSettings(msg));

        if let Some(step_size) = self.step_size {
            if !(step_size.is_finite() & (step_size > 0.)) {
                return invalid(format!("step size must be positive, got {step_size}"));
            }
        }
        if !((0f64..1f64).contains(&self.step_size_jitter)) {
            return invalid(format!(
                "step size jitter must be in [0, 1), got {}",
                self.step_size_jitter
            ));
        }
        if !(self.max_energy_error > 0.) {
            return invalid(format!(
                "max_energy_error must be positive, got {}",
                self.max_energy_error
            ));
        }
        if self.num_chains == 0 {
            return invalid("at least one chain is needed".to_string());
        }
        match self.engine {
            Engine::Nuts => {
                if self.maxdepth == 0 {
                    return invalid("maxdepth must be at least 1".to_string());
                }
            }
            Engine::Static {
                length: TrajectoryLength::IntegrationTime(time),
            } => {
                if !(time.is_finite() & (time > 0.)) {
                    return invalid(format!("integration time must be positive, got {time}"));
                }
            }
            Engine::Static { .. } => {}
        }

        let step = &self.step_size_adapt;
        if !((step.target_accept > 0.) & (step.target_accept < 1.)) {
            return invalid(format!(
                "target acceptance must be in (0, 1), got {}",
                step.target_accept
            ));
        }
        if !((step.gamma > 0.) & (step.k > 0.) & (step.t0 >= 0.)) {
            return invalid(format!(
                "dual averaging needs gamma > 0, k > 0 and t0 >= 0, got {step:?}"
            ));
        }

        let metric = &self.metric_adapt;
        if metric.base_window == 0 {
            return invalid("the base adaptation window must not be empty".to_string());
        }
        if !((metric.shrinkage_samples >= 0.) & (metric.regularization >= 0.)) {
            return invalid(format!(
                "metric regularization must not be negative, got {metric:?}"
            ));
        }
        Ok(())
    }
}

/// Where a chain starts.
#[derive(Debug, Clone, PartialEq)]
pub enum InitStrategy {
    Zero,
    /// A position on the unconstrained space.
    User(Vec<f64>),
    /// Draw each coordinate uniformly from `(-radius, radius)` until the
    /// density and its gradient are finite.
    Random { radius: f64, max_tries: u64 },
}

impl Default for InitStrategy {
    fn default() -> Self {
        InitStrategy::Random {
            radius: 2f64,
            max_tries: 100,
        }
    }
}

/// One transition of a chain together with its diagnostics.
#[derive(Debug, Clone)]
pub struct SampleRecord {
    pub chain: u64,
    /// Index of the transition, counting warm-up.
    pub draw: u64,
    /// Whether the draw was made during warm-up.
    pub tuning: bool,
    pub position: Box<[f64]>,
    pub logp: f64,
    pub energy: f64,
    pub energy_error: f64,
    /// The step size used for this transition, including jitter.
    pub step_size: f64,
    pub step_size_bar: f64,
    pub depth: u64,
    pub n_steps: u64,
    pub maxdepth_reached: bool,
    pub diverging: bool,
    pub accept_stat: f64,
    pub index_in_trajectory: i64,
    pub divergence: Option<DivergenceInfo>,
}

/// Receives the draws of a chain.
pub trait SampleSink {
    fn append(&mut self, record: &SampleRecord) -> anyhow::Result<()>;
}

impl<S: SampleSink + ?Sized> SampleSink for &mut S {
    fn append(&mut self, record: &SampleRecord) -> anyhow::Result<()> {
        (**self).append(record)
    }
}

/// A progress report of a chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub chain: u64,
    /// The one-based number of the finished iteration.
    pub iteration: u64,
    pub total: u64,
    pub tuning: bool,
    pub divergences: u64,
    pub step_size: f64,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.total.to_string().len();
        let percent = if self.total == 0 {
            100
        } else {
            (100. * self.iteration as f64 / self.total as f64) as u64
        };
        let phase = if self.tuning { "Warmup" } else { "Sampling" };
        write!(
            f,
            "Iteration: {:>width$} / {} [{:>3}%]  ({phase})",
            self.iteration, self.total, percent
        )
    }
}

pub struct ProgressCallback {
    pub callback: Box<dyn Fn(&Progress) + Send + Sync>,
}

impl ProgressCallback {
    pub fn new(callback: impl Fn(&Progress) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

/// Hooks of the caller into a running chain.
#[derive(Default, Clone, Copy)]
pub struct RunControl<'a> {
    /// Sampling stops with [`NutsError::Interrupted`] before the next
    /// transition once this is set.
    pub interrupt: Option<&'a AtomicBool>,
    pub progress: Option<&'a ProgressCallback>,
}

impl RunControl<'_> {
    fn interrupted(&self) -> bool {
        self.interrupt
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

/// Whether the `m`th iteration (zero-based) of a phase starting at
/// iteration `start` gets a progress report. The first iteration of each
/// phase, every `refresh`th iteration of a phase and the very last
/// iteration are reported.
fn should_report(m: u64, start: u64, total: u64, refresh: u64) -> bool {
    if refresh == 0 {
        return false;
    }
    m == 0 || start + m + 1 == total || (m + 1) % refresh == 0
}

/// Summary of a finished chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSummary {
    pub chain: u64,
    /// Number of records passed to the sink.
    pub num_records: u64,
    /// Divergences after warm-up.
    pub divergences: u64,
    /// Total number of leapfrog steps, warm-up included.
    pub leapfrog_steps: u64,
    pub step_size: f64,
    /// Diagonal of the final inverse metric.
    pub inverse_metric: Vec<f64>,
    pub metric_updates: u64,
}

/// Run warm-up and sampling of an initialized chain and write the draws to
/// `sink`.
///
/// Warm-up draws are only written if `settings.save_warmup` is set. The
/// interrupt flag is checked before every transition.
pub fn run_chain<F, R, S>(
    chain: &mut HmcChain<F, R>,
    settings: &HmcSettings,
    sink: &mut S,
    control: &RunControl<'_>,
) -> Result<ChainSummary>
where
    F: LogpFunc,
    R: rand::Rng,
    S: SampleSink + ?Sized,
{
    let total = settings.num_warmup + settings.num_draws;
    let mut num_records = 0u64;
    let mut divergences = 0u64;
    let mut leapfrog_steps = 0u64;

    for iteration in 0..total {
        if control.interrupted() {
            info!("Chain {} interrupted at iteration {iteration}", chain.chain());
            return Err(NutsError::Interrupted);
        }

        let record = chain.draw()?;
        leapfrog_steps += record.n_steps;
        if record.diverging & !record.tuning {
            divergences += 1;
        }
        if settings.save_warmup | !record.tuning {
            sink.append(&record).map_err(NutsError::Sink)?;
            num_records += 1;
        }

        let start = if iteration < settings.num_warmup {
            0
        } else {
            settings.num_warmup
        };
        if should_report(iteration - start, start, total, settings.refresh) {
            let progress = Progress {
                chain: chain.chain(),
                iteration: iteration + 1,
                total,
                tuning: record.tuning,
                divergences,
                step_size: chain.step_size(),
            };
            info!("Chain {}: {progress}", progress.chain);
            if let Some(callback) = control.progress {
                (callback.callback)(&progress);
            }
        }
    }

    if divergences > 0 {
        warn!(
            "Chain {} had {divergences} divergent transitions after warm-up",
            chain.chain()
        );
    }

    Ok(ChainSummary {
        chain: chain.chain(),
        num_records,
        divergences,
        leapfrog_steps,
        step_size: chain.step_size(),
        inverse_metric: chain.metric().inverse_diag(),
        metric_updates: chain.metric_updates(),
    })
}

/// The random number generator of a chain: one ChaCha stream per chain
/// for a shared seed.
pub fn chain_rng(seed: u64, chain: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(chain);
    rng
}

/// Sample a single chain (chain 0) from `logp`.
pub fn sample<F, S>(
    logp: F,
    settings: &HmcSettings,
    init: &InitStrategy,
    sink: &mut S,
) -> Result<ChainSummary>
where
    F: LogpFunc,
    S: SampleSink + ?Sized,
{
    let mut chain = HmcChain::new(logp, settings, chain_rng(settings.seed, 0), 0)?;
    chain.initialize(init)?;
    run_chain(&mut chain, settings, sink, &RunControl::default())
}

/// Sample `settings.num_chains` independent chains in parallel.
///
/// Every chain gets its own density from `model` and its own sink from
/// `make_sink`. A failing chain does not stop the others, so the result
/// holds one entry per chain.
pub fn sample_parallel<M, S, G>(
    model: &M,
    settings: &HmcSettings,
    init: &InitStrategy,
    make_sink: G,
    control: &RunControl<'_>,
) -> Result<Vec<Result<(S, ChainSummary)>>>
where
    M: Model,
    S: SampleSink + Send,
    G: Fn(u64) -> anyhow::Result<S> + Sync,
{
    settings.validate()?;
    debug!("Sampling {} chains", settings.num_chains);

    let results = (0..settings.num_chains as u64)
        .into_par_iter()
        .map(|chain| -> Result<(S, ChainSummary)> {
            let logp = model
                .density()
                .map_err(|error| NutsError::Model { chain, error })?;
            let mut sink = make_sink(chain).map_err(NutsError::Sink)?;
            let mut sampler = HmcChain::new(logp, settings, chain_rng(settings.seed, chain), chain)?;
            sampler.initialize_with(init, |rng, radius, position| {
                model.init_position(rng, radius, position)
            })?;
            let summary = run_chain(&mut sampler, settings, &mut sink, control)?;
            Ok((sink, summary))
        })
        .collect();
    Ok(results)
}
