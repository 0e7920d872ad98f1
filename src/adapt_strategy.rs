use log::{debug, info, warn};
use rand::Rng;

use crate::{
    hamiltonian::{EuclideanHamiltonian, EuclideanPoint},
    mass_matrix::{MassMatrix, MetricKind},
    mass_matrix_adapt::{MetricAdaptOptions, MetricAdapter},
    model::LogpFunc,
    sampler::HmcSettings,
    stepsize::{find_reasonable_step_size, StepSizeAdapter},
};

/// Fewer warm-up iterations than this leave the metric alone.
const MIN_WARMUP_FOR_METRIC: u64 = 20;

/// Where in warm-up a chain currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupPhase {
    /// Initial fast interval, only the step size is adapted.
    FastInitial,
    /// A slow window that collects draws for the next metric estimate.
    SlowWindow,
    /// Final fast interval, only the step size is adapted.
    FastFinal,
    /// Warm-up is over, step size and metric are frozen.
    Sampling,
}

/// The window schedule of warm-up: a fast initial buffer, a sequence of
/// slow windows that double in size, and a fast terminal buffer.
///
/// The last slow window is stretched so that it always ends where the
/// terminal buffer starts.
#[derive(Debug, Clone)]
pub struct WindowSchedule {
    num_warmup: u64,
    init_buffer: u64,
    term_buffer: u64,
    base_window: u64,
    window_size: u64,
    next_window: u64,
    counter: u64,
    enabled: bool,
}

impl WindowSchedule {
    /// If the buffers and the first window do not fit into `num_warmup`,
    /// they are replaced by 15%, 75% and 10% of warm-up. With fewer than 20
    /// warm-up iterations there are no slow windows at all.
    pub fn new(num_warmup: u64, options: &MetricAdaptOptions, enabled: bool) -> Self {
        let mut init_buffer = options.init_buffer;
        let mut term_buffer = options.term_buffer;
        let mut base_window = options.base_window;
        let enabled = enabled & (num_warmup >= MIN_WARMUP_FOR_METRIC);

        if enabled & (init_buffer + base_window + term_buffer > num_warmup) {
            init_buffer = (0.15 * num_warmup as f64) as u64;
            term_buffer = (0.1 * num_warmup as f64) as u64;
            base_window = num_warmup - (init_buffer + term_buffer);
            info!(
                "Warm-up of {num_warmup} iterations is too short for the configured windows, \
                 using init_buffer = {init_buffer}, adapt_window = {base_window}, \
                 term_buffer = {term_buffer}"
            );
        }

        let mut schedule = Self {
            num_warmup,
            init_buffer,
            term_buffer,
            base_window,
            window_size: base_window,
            next_window: 0,
            counter: 0,
            enabled,
        };
        schedule.restart();
        schedule
    }

    pub fn restart(&mut self) {
        self.counter = 0;
        self.window_size = self.base_window;
        self.next_window = (self.init_buffer + self.window_size).saturating_sub(1);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    fn last_window_end(&self) -> u64 {
        self.slow_end().saturating_sub(1)
    }

    fn slow_end(&self) -> u64 {
        self.num_warmup.saturating_sub(self.term_buffer)
    }

    /// Whether the draw of the current iteration belongs to a slow window.
    pub fn in_adaptation_window(&self) -> bool {
        self.enabled
            & (self.counter >= self.init_buffer)
            & (self.counter < self.slow_end())
            & (self.counter != self.num_warmup)
    }

    /// Whether the current iteration closes a slow window.
    pub fn end_of_window(&self) -> bool {
        self.enabled & (self.counter == self.next_window) & (self.counter != self.num_warmup)
    }

    /// Move the end of the current window to the end of the next one.
    pub fn compute_next_window(&mut self) {
        if self.next_window == self.last_window_end() {
            return;
        }

        self.window_size *= 2;
        self.next_window = self.counter + self.window_size;

        if self.next_window != self.last_window_end() {
            let next_window_boundary = self.next_window + 2 * self.window_size;
            if next_window_boundary >= self.slow_end() {
                self.next_window = self.last_window_end();
            }
        }
    }

    pub fn advance(&mut self) {
        self.counter += 1;
    }

    pub fn phase(&self) -> WarmupPhase {
        if self.counter >= self.num_warmup {
            WarmupPhase::Sampling
        } else if !self.enabled {
            WarmupPhase::FastInitial
        } else if self.counter < self.init_buffer {
            WarmupPhase::FastInitial
        } else if self.counter < self.slow_end() {
            WarmupPhase::SlowWindow
        } else {
            WarmupPhase::FastFinal
        }
    }
}

/// Drives step size and metric adaptation of one chain during warm-up.
#[derive(Debug, Clone)]
pub struct WarmupController {
    schedule: WindowSchedule,
    step_size: StepSizeAdapter,
    metric: Option<MetricAdapter>,
    initial_step: Option<f64>,
    num_warmup: u64,
    adapt: bool,
    metric_updates: u64,
}

impl WarmupController {
    pub fn new(settings: &HmcSettings, kind: MetricKind, dim: usize) -> Self {
        let adapt_metric = settings.adapt & (kind != MetricKind::Unit);
        if adapt_metric & (settings.num_warmup < MIN_WARMUP_FOR_METRIC) {
            info!(
                "No metric adaptation is performed for fewer than {MIN_WARMUP_FOR_METRIC} \
                 warm-up iterations"
            );
        }
        let schedule = WindowSchedule::new(settings.num_warmup, &settings.metric_adapt, adapt_metric);
        let metric = if schedule.is_enabled() {
            MetricAdapter::new(kind, dim, settings.metric_adapt)
        } else {
            None
        };
        let initial_step = settings.step_size.unwrap_or(1.);
        Self {
            schedule,
            step_size: StepSizeAdapter::new(settings.step_size_adapt, initial_step),
            metric,
            initial_step: settings.step_size,
            num_warmup: settings.num_warmup,
            adapt: settings.adapt,
            metric_updates: 0,
        }
    }

    /// Choose the step size for the first transition.
    ///
    /// If the chain adapts during warm-up, the step size search starts at
    /// the configured step size, or at 1 if there is none. Otherwise the
    /// configured step size is used as it is.
    pub(crate) fn init<F, Mass, R>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<F, Mass>,
        point: &EuclideanPoint,
        rng: &mut R,
    ) -> Result<(), F::LogpError>
    where
        F: LogpFunc,
        Mass: MassMatrix,
        R: Rng + ?Sized,
    {
        let start = self.initial_step.unwrap_or(1f64);
        let step_size = if self.adapt & (self.num_warmup > 0) {
            let step_size = find_reasonable_step_size(hamiltonian, point, start, rng)?;
            debug!("Initial step size search from {start} found {step_size}");
            step_size
        } else {
            start
        };
        *hamiltonian.step_size_mut() = step_size;
        self.step_size.restart(step_size);
        self.schedule.restart();
        self.metric_updates = 0;
        if let Some(metric) = self.metric.as_mut() {
            metric.reset();
        }
        Ok(())
    }

    pub fn is_tuning(&self) -> bool {
        self.schedule.counter() < self.num_warmup
    }

    pub fn phase(&self) -> WarmupPhase {
        self.schedule.phase()
    }

    pub fn step_size(&self) -> f64 {
        self.step_size.step_size()
    }

    pub fn step_size_bar(&self) -> f64 {
        self.step_size.step_size_bar()
    }

    /// How often the metric was replaced during this warm-up.
    pub fn metric_updates(&self) -> u64 {
        self.metric_updates
    }

    /// Learn from a finished warm-up transition and set the step size for
    /// the next transition. Returns whether the metric was replaced.
    ///
    /// A metric estimate that fails validation is skipped and the previous
    /// metric stays in place.
    pub(crate) fn adapt<F, Mass, R>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<F, Mass>,
        point: &EuclideanPoint,
        accept_stat: f64,
        rng: &mut R,
    ) -> Result<bool, F::LogpError>
    where
        F: LogpFunc,
        Mass: MassMatrix,
        R: Rng + ?Sized,
    {
        if !self.is_tuning() {
            return Ok(false);
        }
        if !self.adapt {
            self.schedule.advance();
            return Ok(false);
        }

        let mut step_size = self.step_size.adapt(accept_stat);
        let mut updated = false;

        if let Some(metric) = self.metric.as_mut() {
            if self.schedule.in_adaptation_window() {
                metric.add_sample(&point.position);
            }
            if self.schedule.end_of_window() {
                self.schedule.compute_next_window();
                let draws = metric.count();
                let result = metric
                    .estimate()
                    .and_then(|estimate| hamiltonian.mass_matrix.update(&estimate));
                metric.reset();
                match result {
                    Ok(()) => {
                        debug!(
                            "Updated metric from {draws} draws at warm-up iteration {}",
                            self.schedule.counter() + 1
                        );
                        *hamiltonian.step_size_mut() = step_size;
                        step_size = find_reasonable_step_size(hamiltonian, point, step_size, rng)?;
                        self.step_size.restart(step_size);
                        self.metric_updates += 1;
                        updated = true;
                    }
                    Err(err) => {
                        warn!(
                            "Keeping previous metric at warm-up iteration {}: {err}",
                            self.schedule.counter() + 1
                        );
                    }
                }
            }
        }

        self.schedule.advance();
        if self.schedule.counter() == self.num_warmup {
            step_size = self.step_size.finalize();
            info!("Warm-up finished, step size {step_size:.4e}");
        }
        *hamiltonian.step_size_mut() = step_size;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mass_matrix::Metric,
        test_logps::{NormalLogp, ScaledNormal},
    };
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn window_ends(num_warmup: u64, options: &MetricAdaptOptions) -> Vec<u64> {
        let mut schedule = WindowSchedule::new(num_warmup, options, true);
        let mut ends = vec![];
        for _ in 0..num_warmup {
            if schedule.end_of_window() {
                ends.push(schedule.counter());
                schedule.compute_next_window();
            }
            schedule.advance();
        }
        ends
    }

    #[test]
    fn default_schedule() {
        let ends = window_ends(1000, &MetricAdaptOptions::default());
        assert_eq!(ends, vec![99, 149, 249, 449, 949]);
    }

    #[test]
    fn short_warmup_schedule() {
        // 75 + 25 + 50 > 100, so the buffers become 15 / 75 / 10.
        let ends = window_ends(100, &MetricAdaptOptions::default());
        assert_eq!(ends, vec![89]);

        let ends = window_ends(150, &MetricAdaptOptions::default());
        assert_eq!(ends, vec![99]);

        assert_eq!(window_ends(19, &MetricAdaptOptions::default()), vec![]);
    }

    #[test]
    fn phases() {
        let mut schedule = WindowSchedule::new(200, &MetricAdaptOptions::default(), true);
        let mut phases = vec![];
        for _ in 0..=200 {
            phases.push(schedule.phase());
            schedule.advance();
        }
        assert_eq!(phases[0], WarmupPhase::FastInitial);
        assert_eq!(phases[74], WarmupPhase::FastInitial);
        assert_eq!(phases[75], WarmupPhase::SlowWindow);
        assert_eq!(phases[149], WarmupPhase::SlowWindow);
        assert_eq!(phases[150], WarmupPhase::FastFinal);
        assert_eq!(phases[199], WarmupPhase::FastFinal);
        assert_eq!(phases[200], WarmupPhase::Sampling);
    }

    #[test]
    fn metric_refit_and_finalize() {
        let settings = HmcSettings {
            num_warmup: 150,
            step_size: Some(0.5),
            ..Default::default()
        };
        let dim = 2;
        let mut hamiltonian = EuclideanHamiltonian::new(
            ScaledNormal::new(vec![3., 0.5]),
            Metric::new(MetricKind::Diag, dim),
            1000.,
            1.,
        );
        let mut controller = WarmupController::new(&settings, MetricKind::Diag, dim);
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let point = hamiltonian.init_state(&[0., 0.]).unwrap();
        controller.init(&mut hamiltonian, &point, &mut rng).unwrap();
        assert!(hamiltonian.step_size() > 0.);

        // Feed exact draws of the target, so the refit finds its variances.
        let mut updates = 0;
        for i in 0..150u64 {
            assert!(controller.is_tuning());
            let mut draw = point.clone();
            draw.position[0] = 3. * ((i as f64) * 0.37).sin() * 1.4;
            draw.position[1] = 0.5 * ((i as f64) * 0.91).cos() * 1.4;
            if controller
                .adapt(&mut hamiltonian, &draw, 0.8, &mut rng)
                .unwrap()
            {
                updates += 1;
            }
        }
        assert_eq!(updates, 1);
        assert_eq!(controller.metric_updates(), 1);
        assert!(!controller.is_tuning());
        assert_eq!(controller.phase(), WarmupPhase::Sampling);

        let variance = hamiltonian.mass_matrix().inverse_diag();
        assert!(variance[0] > 5. * variance[1]);

        let step_size = hamiltonian.step_size();
        assert_eq!(step_size, controller.step_size_bar());
        assert!(!controller
            .adapt(&mut hamiltonian, &point, 0., &mut rng)
            .unwrap());
        assert_eq!(hamiltonian.step_size(), step_size);
    }

    #[test]
    fn step_size_search_starts_at_configured_step() {
        let settings = HmcSettings {
            num_warmup: 50,
            step_size: Some(0.3),
            ..Default::default()
        };
        let make_hamiltonian = || {
            EuclideanHamiltonian::new(
                NormalLogp::new(4, 0.),
                Metric::new(MetricKind::Diag, 4),
                1000.,
                1.,
            )
        };

        let mut hamiltonian = make_hamiltonian();
        let mut controller = WarmupController::new(&settings, MetricKind::Diag, 4);
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let point = hamiltonian.init_state(&[0.5; 4]).unwrap();
        controller.init(&mut hamiltonian, &point, &mut rng).unwrap();

        let mut expected_hamiltonian = make_hamiltonian();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let expected =
            find_reasonable_step_size(&mut expected_hamiltonian, &point, 0.3, &mut rng).unwrap();

        assert_eq!(hamiltonian.step_size(), expected);
        assert_eq!(controller.step_size(), expected);
        let doublings = (expected / 0.3).log2();
        assert_abs_diff_eq!(doublings, doublings.round(), epsilon = 1e-9);
    }

    #[test]
    fn no_adaptation_keeps_step_size() {
        let settings = HmcSettings {
            num_warmup: 50,
            adapt: false,
            step_size: Some(0.3),
            ..Default::default()
        };
        let mut hamiltonian = EuclideanHamiltonian::new(
            NormalLogp::new(2, 0.),
            Metric::new(MetricKind::Diag, 2),
            1000.,
            1.,
        );
        let mut controller = WarmupController::new(&settings, MetricKind::Diag, 2);
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let point = hamiltonian.init_state(&[0., 0.]).unwrap();
        controller.init(&mut hamiltonian, &point, &mut rng).unwrap();
        for _ in 0..50 {
            controller
                .adapt(&mut hamiltonian, &point, 0.1, &mut rng)
                .unwrap();
        }
        assert_eq!(hamiltonian.step_size(), 0.3);
        assert_eq!(hamiltonian.mass_matrix().inverse_diag(), vec![1., 1.]);
        assert!(!controller.is_tuning());
    }
}
