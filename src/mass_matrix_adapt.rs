use faer::{linalg::matmul::matmul, Accum, ColRef, Mat, Par, Scale};
use itertools::izip;

use crate::{
    mass_matrix::{MetricError, MetricEstimate, MetricKind},
    math::update_variance,
};

const LOWER_LIMIT: f64 = 1e-20f64;
const UPPER_LIMIT: f64 = 1e20f64;

/// Settings for mass matrix adaptation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricAdaptOptions {
    /// Warm-up draws at the start that only adapt the step size.
    pub init_buffer: u64,
    /// Warm-up draws at the end that only adapt the step size.
    pub term_buffer: u64,
    /// Length of the first slow adaptation window.
    pub base_window: u64,
    /// Weight of the regularization target, in units of draws.
    pub shrinkage_samples: f64,
    /// The variance the estimate is shrunk towards.
    pub regularization: f64,
    /// Windows with fewer draws keep the previous metric.
    pub min_window_draws: u64,
}

impl Default for MetricAdaptOptions {
    fn default() -> Self {
        Self {
            init_buffer: 75,
            term_buffer: 50,
            base_window: 25,
            shrinkage_samples: 5.,
            regularization: 1e-3,
            min_window_draws: 10,
        }
    }
}

/// Welford's online estimator of the elementwise variance.
#[derive(Debug, Clone)]
pub struct RunningVariance {
    mean: Box<[f64]>,
    m2: Box<[f64]>,
    count: u64,
}

impl RunningVariance {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; dim].into(),
            count: 0,
        }
    }

    pub fn add_sample(&mut self, value: &[f64]) {
        self.count += 1;
        if self.count == 1 {
            self.mean.copy_from_slice(value);
        } else {
            update_variance(
                &mut self.mean,
                &mut self.m2,
                value,
                (self.count as f64).recip(),
            );
        }
    }

    /// The unbiased sample variance.
    pub fn current(&self) -> Vec<f64> {
        assert!(self.count > 1);
        let scale = ((self.count - 1) as f64).recip();
        self.m2.iter().map(|m2| m2 * scale).collect()
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        self.mean.iter_mut().for_each(|x| *x = 0f64);
        self.m2.iter_mut().for_each(|x| *x = 0f64);
        self.count = 0;
    }
}

/// Welford's online estimator of the full covariance matrix.
#[derive(Debug, Clone)]
pub struct RunningCovariance {
    mean: Box<[f64]>,
    m2: Mat<f64>,
    delta: Box<[f64]>,
    after: Box<[f64]>,
    count: u64,
}

impl RunningCovariance {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            m2: Mat::zeros(dim, dim),
            delta: vec![0f64; dim].into(),
            after: vec![0f64; dim].into(),
            count: 0,
        }
    }

    /// Add a draw. The sum of squared deviations gets the rank one update
    /// `(x - mean_old)(x - mean_new)ᵀ`.
    pub fn add_sample(&mut self, value: &[f64]) {
        assert!(value.len() == self.mean.len());
        self.count += 1;
        let scale = (self.count as f64).recip();
        izip!(
            self.mean.iter_mut(),
            self.delta.iter_mut(),
            self.after.iter_mut(),
            value
        )
        .for_each(|(mean, delta, after, x)| {
            *delta = x - *mean;
            *mean += *delta * scale;
            *after = x - *mean;
        });
        matmul(
            &mut self.m2,
            Accum::Add,
            ColRef::from_slice(&self.delta[..]),
            ColRef::from_slice(&self.after[..]).transpose(),
            1f64,
            Par::Seq,
        );
    }

    /// The unbiased sample covariance, symmetrized.
    pub fn current(&self) -> Mat<f64> {
        assert!(self.count > 1);
        let mut cov = &self.m2 + self.m2.transpose();
        cov *= Scale(0.5 * ((self.count - 1) as f64).recip());
        cov
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        let dim = self.mean.len();
        self.mean.iter_mut().for_each(|x| *x = 0f64);
        self.m2 = Mat::zeros(dim, dim);
        self.count = 0;
    }
}

#[derive(Debug, Clone)]
enum Estimator {
    Diag(RunningVariance),
    Dense(RunningCovariance),
}

/// Collects warm-up draws of one adaptation window and turns them into a
/// regularized estimate of the posterior covariance.
#[derive(Debug, Clone)]
pub struct MetricAdapter {
    estimator: Estimator,
    options: MetricAdaptOptions,
}

impl MetricAdapter {
    /// Returns `None` for the unit metric, which is never adapted.
    pub fn new(kind: MetricKind, dim: usize, options: MetricAdaptOptions) -> Option<Self> {
        let estimator = match kind {
            MetricKind::Unit => return None,
            MetricKind::Diag => Estimator::Diag(RunningVariance::new(dim)),
            MetricKind::Dense => Estimator::Dense(RunningCovariance::new(dim)),
        };
        Some(Self { estimator, options })
    }

    pub fn add_sample(&mut self, position: &[f64]) {
        match &mut self.estimator {
            Estimator::Diag(est) => est.add_sample(position),
            Estimator::Dense(est) => est.add_sample(position),
        }
    }

    pub fn count(&self) -> u64 {
        match &self.estimator {
            Estimator::Diag(est) => est.count(),
            Estimator::Dense(est) => est.count(),
        }
    }

    /// Forget all draws, for the start of a new window.
    pub fn reset(&mut self) {
        match &mut self.estimator {
            Estimator::Diag(est) => est.reset(),
            Estimator::Dense(est) => est.reset(),
        }
    }

    /// Shrink the window estimate towards a small multiple of the identity:
    ///
    /// `Σ = n / (n + w) Σ̂ + r w / (n + w) I`
    ///
    /// where `w` is `shrinkage_samples` and `r` the `regularization`.
    ///
    /// Fails if the window is too short, or if some sample variance is zero,
    /// huge or not finite. The caller should then keep the previous metric.
    pub fn estimate(&self) -> Result<MetricEstimate, MetricError> {
        let count = self.count();
        let required = self.options.min_window_draws.max(2);
        if count < required {
            return Err(MetricError::NotEnoughDraws { count, required });
        }

        let n = count as f64;
        let weight = self.options.shrinkage_samples;
        let data_scale = n / (n + weight);
        let prior = self.options.regularization * weight / (n + weight);

        match &self.estimator {
            Estimator::Diag(est) => {
                let variance = est.current();
                check_variances(variance.iter().copied())?;
                Ok(MetricEstimate::Diag(
                    variance
                        .iter()
                        .map(|var| data_scale * var + prior)
                        .collect(),
                ))
            }
            Estimator::Dense(est) => {
                let cov = est.current();
                let dim = cov.nrows();
                check_variances((0..dim).map(|i| cov[(i, i)]))?;
                if (0..dim).any(|i| (0..dim).any(|j| !cov[(i, j)].is_finite())) {
                    return Err(MetricError::InvalidCovariance);
                }
                Ok(MetricEstimate::Dense(Mat::from_fn(dim, dim, |i, j| {
                    let value = data_scale * cov[(i, j)];
                    if i == j {
                        value + prior
                    } else {
                        value
                    }
                })))
            }
        }
    }
}

fn check_variances(variances: impl Iterator<Item = f64>) -> Result<(), MetricError> {
    for (index, value) in variances.enumerate() {
        if !value.is_finite() | !(LOWER_LIMIT..=UPPER_LIMIT).contains(&value) {
            return Err(MetricError::InvalidVariance { index, value });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mass_matrix::{DenseMassMatrix, DiagMassMatrix, MassMatrix};
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use rand_distr::StandardNormal;

    #[test]
    fn welford_matches_two_pass() {
        let data = [
            [1.0, 2.0],
            [2.5, -1.0],
            [0.3, 0.0],
            [4.0, 3.5],
            [-2.0, 1.25],
        ];
        let mut var = RunningVariance::new(2);
        let mut cov = RunningCovariance::new(2);
        for row in data.iter() {
            var.add_sample(row);
            cov.add_sample(row);
        }
        let n = data.len() as f64;
        let mean: Vec<f64> = (0..2)
            .map(|j| data.iter().map(|row| row[j]).sum::<f64>() / n)
            .collect();
        let two_pass = |i: usize, j: usize| {
            data.iter()
                .map(|row| (row[i] - mean[i]) * (row[j] - mean[j]))
                .sum::<f64>()
                / (n - 1.)
        };

        let current = var.current();
        let dense = cov.current();
        for i in 0..2 {
            assert_abs_diff_eq!(var.mean()[i], mean[i], epsilon = 1e-12);
            assert_abs_diff_eq!(current[i], two_pass(i, i), epsilon = 1e-12);
            for j in 0..2 {
                assert_abs_diff_eq!(dense[(i, j)], two_pass(i, j), epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn estimate_is_regularized() {
        let mut adapter =
            MetricAdapter::new(MetricKind::Diag, 1, MetricAdaptOptions::default()).unwrap();
        for x in [1., 2., 3., 4., 5., 6., 7., 8., 9., 10.] {
            adapter.add_sample(&[x]);
        }
        let sample_var = 110. / 12.;
        let MetricEstimate::Diag(var) = adapter.estimate().unwrap() else {
            panic!("Expected a diagonal estimate");
        };
        assert_abs_diff_eq!(
            var[0],
            10. / 15. * sample_var + 1e-3 * 5. / 15.,
            epsilon = 1e-12
        );
    }

    #[test]
    fn degenerate_window_is_rejected() {
        let mut adapter =
            MetricAdapter::new(MetricKind::Diag, 2, MetricAdaptOptions::default()).unwrap();
        for _ in 0..3 {
            adapter.add_sample(&[1., 2.]);
        }
        assert_eq!(
            adapter.estimate().unwrap_err(),
            MetricError::NotEnoughDraws {
                count: 3,
                required: 10
            }
        );
        for i in 0..20 {
            adapter.add_sample(&[1., i as f64]);
        }
        assert!(matches!(
            adapter.estimate(),
            Err(MetricError::InvalidVariance { index: 0, .. })
        ));

        adapter.reset();
        assert_eq!(adapter.count(), 0);
        assert!(MetricAdapter::new(MetricKind::Unit, 2, MetricAdaptOptions::default()).is_none());
    }

    #[test]
    fn diag_refit_reproduces_metric() {
        let current = DiagMassMatrix::new(vec![4., 0.25, 1.].into()).unwrap();
        let mut adapter =
            MetricAdapter::new(MetricKind::Diag, 3, MetricAdaptOptions::default()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..5000 {
            let draw: Vec<f64> = current
                .variance()
                .iter()
                .map(|var| var.sqrt() * rng.sample::<f64, _>(StandardNormal))
                .collect();
            adapter.add_sample(&draw);
        }
        let mut refit = DiagMassMatrix::identity(3);
        refit.update(&adapter.estimate().unwrap()).unwrap();
        for (new, old) in refit.variance().iter().zip(current.variance()) {
            assert!((new / old - 1.).abs() < 0.08);
        }
    }

    #[test]
    fn dense_refit_reproduces_metric() {
        let cov = Mat::from_fn(2, 2, |i, j| match (i, j) {
            (0, 0) => 2.,
            (1, 1) => 1.,
            _ => 0.6,
        });
        let chol_00 = 2f64.sqrt();
        let chol_10 = 0.6 / chol_00;
        let chol_11 = (1. - chol_10 * chol_10).sqrt();

        let mut adapter =
            MetricAdapter::new(MetricKind::Dense, 2, MetricAdaptOptions::default()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(12);
        for _ in 0..5000 {
            let z0: f64 = rng.sample(StandardNormal);
            let z1: f64 = rng.sample(StandardNormal);
            adapter.add_sample(&[chol_00 * z0, chol_10 * z0 + chol_11 * z1]);
        }
        let mut refit = DenseMassMatrix::identity(2);
        refit.update(&adapter.estimate().unwrap()).unwrap();
        for i in 0..2 {
            for j in 0..2 {
                assert_abs_diff_eq!(refit.covariance()[(i, j)], cov[(i, j)], epsilon = 0.12);
            }
        }
    }
}
