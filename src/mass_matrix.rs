use faer::{
    linalg::{matmul::matmul, triangular_solve::solve_upper_triangular_in_place},
    Accum, ColMut, ColRef, Mat, Par, Side,
};
use itertools::izip;
use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

use crate::math::{multiply, vector_dot};

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("Illegal value on mass matrix diagonal at index {index}: {value}")]
    InvalidVariance { index: usize, value: f64 },
    #[error("Covariance matrix contains non-finite values or is not symmetric")]
    InvalidCovariance,
    #[error("Covariance matrix is not positive definite")]
    NotPositiveDefinite,
    #[error("Metric has dimension {expected}, but got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("Need at least {required} draws to estimate the metric, got {count}")]
    NotEnoughDraws { count: u64, required: u64 },
}

/// A new inverse metric estimated from warm-up draws.
#[derive(Debug, Clone)]
pub enum MetricEstimate {
    Diag(Box<[f64]>),
    Dense(Mat<f64>),
}

/// The mass matrix `M` of the kinetic energy `½ pᵀ M⁻¹ p`.
///
/// All implementations store the *inverse* metric `M⁻¹`, which is what the
/// adaptation estimates (the posterior covariance), and never invert a
/// matrix explicitly.
pub trait MassMatrix {
    fn dim(&self) -> usize;

    /// Compute the velocity `M⁻¹ p` of a momentum.
    fn update_velocity(&self, momentum: &[f64], velocity: &mut [f64]);

    /// Draw a momentum from `N(0, M)`.
    fn randomize_momentum<R: Rng + ?Sized>(&self, rng: &mut R, momentum: &mut [f64]);

    /// Install a new inverse metric.
    ///
    /// On error the previous metric stays in place.
    fn update(&mut self, estimate: &MetricEstimate) -> Result<(), MetricError>;

    /// The kinetic energy given a momentum and its velocity.
    fn kinetic_energy(&self, momentum: &[f64], velocity: &[f64]) -> f64 {
        0.5 * vector_dot(momentum, velocity)
    }

    /// The kinetic energy of a momentum.
    fn momentum_energy(&self, momentum: &[f64]) -> f64 {
        let mut velocity = vec![0f64; momentum.len()];
        self.update_velocity(momentum, &mut velocity);
        self.kinetic_energy(momentum, &velocity)
    }
}

#[derive(Debug, Clone)]
pub struct UnitMassMatrix {
    dim: usize,
}

impl UnitMassMatrix {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl MassMatrix for UnitMassMatrix {
    fn dim(&self) -> usize {
        self.dim
    }

    fn update_velocity(&self, momentum: &[f64], velocity: &mut [f64]) {
        velocity.copy_from_slice(momentum);
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, rng: &mut R, momentum: &mut [f64]) {
        momentum.iter_mut().for_each(|p| *p = rng.sample(StandardNormal));
    }

    fn update(&mut self, _estimate: &MetricEstimate) -> Result<(), MetricError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DiagMassMatrix {
    inv_stds: Box<[f64]>,
    pub(crate) variance: Box<[f64]>,
}

impl DiagMassMatrix {
    pub fn new(variance: Box<[f64]>) -> Result<Self, MetricError> {
        let mut mass_matrix = Self {
            inv_stds: vec![0f64; variance.len()].into(),
            variance: vec![0f64; variance.len()].into(),
        };
        mass_matrix.update_diag(&variance)?;
        Ok(mass_matrix)
    }

    pub fn identity(dim: usize) -> Self {
        Self {
            inv_stds: vec![1f64; dim].into(),
            variance: vec![1f64; dim].into(),
        }
    }

    pub fn variance(&self) -> &[f64] {
        &self.variance
    }

    pub(crate) fn update_diag(&mut self, new_variance: &[f64]) -> Result<(), MetricError> {
        if new_variance.len() != self.variance.len() {
            return Err(MetricError::DimensionMismatch {
                expected: self.variance.len(),
                got: new_variance.len(),
            });
        }
        if let Some((index, &value)) = new_variance
            .iter()
            .enumerate()
            .find(|&(_, &x)| !x.is_finite() | (x <= 0f64))
        {
            return Err(MetricError::InvalidVariance { index, value });
        }
        izip!(
            self.variance.iter_mut(),
            self.inv_stds.iter_mut(),
            new_variance
        )
        .for_each(|(var, inv_std, &x)| {
            *var = x;
            *inv_std = x.recip().sqrt();
        });
        Ok(())
    }
}

impl MassMatrix for DiagMassMatrix {
    fn dim(&self) -> usize {
        self.variance.len()
    }

    fn update_velocity(&self, momentum: &[f64], velocity: &mut [f64]) {
        multiply(&self.variance, momentum, velocity);
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, rng: &mut R, momentum: &mut [f64]) {
        momentum
            .iter_mut()
            .zip(self.inv_stds.iter())
            .for_each(|(p, &s)| {
                let norm: f64 = rng.sample(StandardNormal);
                *p = s * norm;
            });
    }

    fn update(&mut self, estimate: &MetricEstimate) -> Result<(), MetricError> {
        match estimate {
            MetricEstimate::Diag(variance) => self.update_diag(variance),
            MetricEstimate::Dense(cov) => {
                let diag: Vec<f64> = (0..cov.nrows()).map(|i| cov[(i, i)]).collect();
                self.update_diag(&diag)
            }
        }
    }
}

/// A dense metric, stored as the inverse metric `Σ` and the lower
/// Cholesky factor `L` with `Σ = L Lᵀ`.
#[derive(Debug, Clone)]
pub struct DenseMassMatrix {
    covariance: Mat<f64>,
    chol: Mat<f64>,
}

impl DenseMassMatrix {
    pub fn new(covariance: Mat<f64>) -> Result<Self, MetricError> {
        let chol = cholesky(&covariance)?;
        Ok(Self { covariance, chol })
    }

    pub fn identity(dim: usize) -> Self {
        let eye = Mat::from_fn(dim, dim, |i, j| if i == j { 1f64 } else { 0f64 });
        Self {
            covariance: eye.clone(),
            chol: eye,
        }
    }

    pub fn covariance(&self) -> &Mat<f64> {
        &self.covariance
    }

    pub(crate) fn update_dense(&mut self, covariance: &Mat<f64>) -> Result<(), MetricError> {
        if covariance.nrows() != self.covariance.nrows() {
            return Err(MetricError::DimensionMismatch {
                expected: self.covariance.nrows(),
                got: covariance.nrows(),
            });
        }
        self.chol = cholesky(covariance)?;
        self.covariance = covariance.clone();
        Ok(())
    }
}

fn cholesky(covariance: &Mat<f64>) -> Result<Mat<f64>, MetricError> {
    let n = covariance.nrows();
    if covariance.ncols() != n {
        return Err(MetricError::DimensionMismatch {
            expected: n,
            got: covariance.ncols(),
        });
    }
    for i in 0..n {
        for j in 0..=i {
            let a = covariance[(i, j)];
            let b = covariance[(j, i)];
            if !a.is_finite() | !b.is_finite() {
                return Err(MetricError::InvalidCovariance);
            }
            if (a - b).abs() > 1e-10 * (1f64 + a.abs().max(b.abs())) {
                return Err(MetricError::InvalidCovariance);
            }
        }
    }
    let llt = covariance
        .llt(Side::Lower)
        .map_err(|_| MetricError::NotPositiveDefinite)?;
    let chol = llt.L().to_owned();
    if (0..n).any(|i| !(chol[(i, i)] > 0f64) | !chol[(i, i)].is_finite()) {
        return Err(MetricError::NotPositiveDefinite);
    }
    Ok(chol)
}

impl MassMatrix for DenseMassMatrix {
    fn dim(&self) -> usize {
        self.covariance.nrows()
    }

    fn update_velocity(&self, momentum: &[f64], velocity: &mut [f64]) {
        matmul(
            ColMut::from_slice_mut(velocity),
            Accum::Replace,
            &self.covariance,
            ColRef::from_slice(momentum),
            1f64,
            Par::Seq,
        );
    }

    /// Draw `p = L⁻ᵀ z` with standard normal `z`, so that `Cov(p) = Σ⁻¹`.
    fn randomize_momentum<R: Rng + ?Sized>(&self, rng: &mut R, momentum: &mut [f64]) {
        momentum.iter_mut().for_each(|p| *p = rng.sample(StandardNormal));
        solve_upper_triangular_in_place(
            self.chol.transpose(),
            ColMut::from_slice_mut(momentum).as_mat_mut(),
            Par::Seq,
        );
    }

    fn update(&mut self, estimate: &MetricEstimate) -> Result<(), MetricError> {
        match estimate {
            MetricEstimate::Dense(cov) => self.update_dense(cov),
            MetricEstimate::Diag(variance) => {
                let n = variance.len();
                let cov = Mat::from_fn(n, n, |i, j| if i == j { variance[i] } else { 0f64 });
                self.update_dense(&cov)
            }
        }
    }
}

/// Which metric to use, chosen when the sampler is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricKind {
    Unit,
    #[default]
    Diag,
    Dense,
}

/// A metric whose variant is selected at runtime.
#[derive(Debug, Clone)]
pub enum Metric {
    Unit(UnitMassMatrix),
    Diag(DiagMassMatrix),
    Dense(DenseMassMatrix),
}

impl Metric {
    pub fn new(kind: MetricKind, dim: usize) -> Self {
        match kind {
            MetricKind::Unit => Metric::Unit(UnitMassMatrix::new(dim)),
            MetricKind::Diag => Metric::Diag(DiagMassMatrix::identity(dim)),
            MetricKind::Dense => Metric::Dense(DenseMassMatrix::identity(dim)),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Metric::Unit(_) => MetricKind::Unit,
            Metric::Diag(_) => MetricKind::Diag,
            Metric::Dense(_) => MetricKind::Dense,
        }
    }

    /// The diagonal of the inverse metric.
    pub fn inverse_diag(&self) -> Vec<f64> {
        match self {
            Metric::Unit(inner) => vec![1f64; inner.dim()],
            Metric::Diag(inner) => inner.variance.to_vec(),
            Metric::Dense(inner) => (0..inner.dim()).map(|i| inner.covariance[(i, i)]).collect(),
        }
    }
}

impl MassMatrix for Metric {
    fn dim(&self) -> usize {
        match self {
            Metric::Unit(inner) => inner.dim(),
            Metric::Diag(inner) => inner.dim(),
            Metric::Dense(inner) => inner.dim(),
        }
    }

    fn update_velocity(&self, momentum: &[f64], velocity: &mut [f64]) {
        match self {
            Metric::Unit(inner) => inner.update_velocity(momentum, velocity),
            Metric::Diag(inner) => inner.update_velocity(momentum, velocity),
            Metric::Dense(inner) => inner.update_velocity(momentum, velocity),
        }
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, rng: &mut R, momentum: &mut [f64]) {
        match self {
            Metric::Unit(inner) => inner.randomize_momentum(rng, momentum),
            Metric::Diag(inner) => inner.randomize_momentum(rng, momentum),
            Metric::Dense(inner) => inner.randomize_momentum(rng, momentum),
        }
    }

    fn update(&mut self, estimate: &MetricEstimate) -> Result<(), MetricError> {
        match self {
            Metric::Unit(inner) => inner.update(estimate),
            Metric::Diag(inner) => inner.update(estimate),
            Metric::Dense(inner) => inner.update(estimate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn covariance() -> Mat<f64> {
        Mat::from_fn(2, 2, |i, j| match (i, j) {
            (0, 0) => 2.,
            (1, 1) => 1.,
            _ => 0.6,
        })
    }

    #[test]
    fn diag_rejects_bad_variance() {
        let err = DiagMassMatrix::new(vec![1., 0.].into()).unwrap_err();
        assert_eq!(
            err,
            MetricError::InvalidVariance {
                index: 1,
                value: 0.
            }
        );
        assert!(DiagMassMatrix::new(vec![1., f64::NAN].into()).is_err());

        let mut mass_matrix = DiagMassMatrix::new(vec![1., 2.].into()).unwrap();
        assert!(mass_matrix
            .update(&MetricEstimate::Diag(vec![-1., 2.].into()))
            .is_err());
        assert_eq!(mass_matrix.variance(), &[1., 2.]);
    }

    #[test]
    fn dense_rejects_indefinite() {
        let bad = Mat::from_fn(2, 2, |i, j| if i == j { 1. } else { 2. });
        assert_eq!(
            DenseMassMatrix::new(bad).unwrap_err(),
            MetricError::NotPositiveDefinite
        );
        let asym = Mat::from_fn(2, 2, |i, j| match (i, j) {
            (0, 1) => 0.5,
            (1, 0) => -0.5,
            _ => 1.,
        });
        assert_eq!(
            DenseMassMatrix::new(asym).unwrap_err(),
            MetricError::InvalidCovariance
        );
    }

    #[test]
    fn kinetic_energy_matches_inverse_metric() {
        let p = [0.3, -1.1];

        let unit = UnitMassMatrix::new(2);
        assert_abs_diff_eq!(unit.momentum_energy(&p), 0.5 * (0.09 + 1.21));

        let diag = DiagMassMatrix::new(vec![2., 0.5].into()).unwrap();
        assert_abs_diff_eq!(
            diag.momentum_energy(&p),
            0.5 * (2. * 0.09 + 0.5 * 1.21),
            epsilon = 1e-12
        );

        let dense = DenseMassMatrix::new(covariance()).unwrap();
        let expected = 0.5 * (2. * 0.09 + 2. * 0.6 * 0.3 * -1.1 + 1.21);
        assert_abs_diff_eq!(dense.momentum_energy(&p), expected, epsilon = 1e-12);
    }

    #[test]
    fn dense_momentum_covariance() {
        // Cov(p) must be the metric, i.e. the inverse of the stored covariance.
        let dense = DenseMassMatrix::new(covariance()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let n = 40_000;
        let mut acc = [0f64; 3];
        let mut p = [0f64; 2];
        for _ in 0..n {
            dense.randomize_momentum(&mut rng, &mut p);
            acc[0] += p[0] * p[0];
            acc[1] += p[0] * p[1];
            acc[2] += p[1] * p[1];
        }
        let det = 2. * 1. - 0.36;
        assert_abs_diff_eq!(acc[0] / n as f64, 1. / det, epsilon = 0.03);
        assert_abs_diff_eq!(acc[1] / n as f64, -0.6 / det, epsilon = 0.03);
        assert_abs_diff_eq!(acc[2] / n as f64, 2. / det, epsilon = 0.05);
    }

    #[test]
    fn dense_velocity_and_momentum() {
        let dense = DenseMassMatrix::new(covariance()).unwrap();

        let mut velocity = [0f64; 2];
        dense.update_velocity(&[1., -2.], &mut velocity);
        assert_abs_diff_eq!(velocity[0], 2. - 1.2, epsilon = 1e-12);
        assert_abs_diff_eq!(velocity[1], 0.6 - 2., epsilon = 1e-12);

        // The momentum solves `Lᵀ p = z` for the standard normal draws `z`.
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let z: Vec<f64> = (0..2).map(|_| rng.sample(StandardNormal)).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let mut p = [0f64; 2];
        dense.randomize_momentum(&mut rng, &mut p);

        let l00 = 2f64.sqrt();
        let l10 = 0.6 / l00;
        let l11 = (1. - l10 * l10).sqrt();
        let p1 = z[1] / l11;
        let p0 = (z[0] - l10 * p1) / l00;
        assert_abs_diff_eq!(p[0], p0, epsilon = 1e-12);
        assert_abs_diff_eq!(p[1], p1, epsilon = 1e-12);
    }

    #[test]
    fn metric_enum_dispatch() {
        let mut metric = Metric::new(MetricKind::Dense, 2);
        assert_eq!(metric.kind(), MetricKind::Dense);
        metric
            .update(&MetricEstimate::Dense(covariance()))
            .unwrap();
        assert_eq!(metric.inverse_diag(), vec![2., 1.]);

        let mut metric = Metric::new(MetricKind::Unit, 3);
        metric
            .update(&MetricEstimate::Diag(vec![5., 5., 5.].into()))
            .unwrap();
        assert_eq!(metric.inverse_diag(), vec![1., 1., 1.]);
    }
}
