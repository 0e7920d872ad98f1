//! Densities with known properties for the unit tests.

use thiserror::Error;

use crate::model::{LogpError, LogpFunc};

#[derive(Error, Debug)]
pub enum TestLogpError {
    #[error("position is outside of the support")]
    OutOfDomain,
    #[error("the density failed")]
    Fatal,
}

impl LogpError for TestLogpError {
    fn is_recoverable(&self) -> bool {
        matches!(self, TestLogpError::OutOfDomain)
    }
}

/// Independent normals with a common mean and standard deviation.
#[derive(Clone, Debug)]
pub struct NormalLogp {
    pub dim: usize,
    pub mu: f64,
    pub sd: f64,
}

impl NormalLogp {
    pub fn new(dim: usize, mu: f64) -> Self {
        Self::with_sd(dim, mu, 1.)
    }

    pub fn with_sd(dim: usize, mu: f64, sd: f64) -> Self {
        Self { dim, mu, sd }
    }
}

impl LogpFunc for NormalLogp {
    type LogpError = TestLogpError;

    fn dim(&self) -> usize {
        self.dim
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, TestLogpError> {
        let precision = 1. / (self.sd * self.sd);
        let mut logp = 0f64;
        for (x, g) in position.iter().zip(gradient.iter_mut()) {
            let val = self.mu - x;
            logp -= val * val * precision / 2.;
            *g = val * precision;
        }
        Ok(logp)
    }
}

/// Independent centered normals with their own standard deviations.
#[derive(Clone, Debug)]
pub struct ScaledNormal {
    pub sds: Vec<f64>,
}

impl ScaledNormal {
    pub fn new(sds: Vec<f64>) -> Self {
        Self { sds }
    }
}

impl LogpFunc for ScaledNormal {
    type LogpError = TestLogpError;

    fn dim(&self) -> usize {
        self.sds.len()
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, TestLogpError> {
        let mut logp = 0f64;
        for ((x, g), sd) in position.iter().zip(gradient.iter_mut()).zip(self.sds.iter()) {
            let precision = 1. / (sd * sd);
            logp -= x * x * precision / 2.;
            *g = -x * precision;
        }
        Ok(logp)
    }
}

/// Two standard normals with correlation `rho`.
#[derive(Clone, Debug)]
pub struct CorrelatedNormal {
    pub rho: f64,
}

impl CorrelatedNormal {
    pub fn new(rho: f64) -> Self {
        Self { rho }
    }
}

impl LogpFunc for CorrelatedNormal {
    type LogpError = TestLogpError;

    fn dim(&self) -> usize {
        2
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, TestLogpError> {
        let scale = 1. / (1. - self.rho * self.rho);
        let (x, y) = (position[0], position[1]);
        gradient[0] = -scale * (x - self.rho * y);
        gradient[1] = -scale * (y - self.rho * x);
        Ok(-0.5 * scale * (x * x - 2. * self.rho * x * y + y * y))
    }
}

/// `-sum(x^4) / 4`, a density with a non-constant curvature.
#[derive(Clone, Debug)]
pub struct QuarticLogp {
    pub dim: usize,
}

impl LogpFunc for QuarticLogp {
    type LogpError = TestLogpError;

    fn dim(&self) -> usize {
        self.dim
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, TestLogpError> {
        let mut logp = 0f64;
        for (x, g) in position.iter().zip(gradient.iter_mut()) {
            logp -= x.powi(4) / 4.;
            *g = -x.powi(3);
        }
        Ok(logp)
    }
}

/// A half normal on `x > 0`. Everything else is a domain failure.
#[derive(Clone, Debug)]
pub struct BoundedLogp;

impl LogpFunc for BoundedLogp {
    type LogpError = TestLogpError;

    fn dim(&self) -> usize {
        1
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, TestLogpError> {
        let x = position[0];
        if x <= 0. {
            return Err(TestLogpError::OutOfDomain);
        }
        gradient[0] = -x;
        Ok(-x * x / 2.)
    }
}

/// Zero density everywhere.
#[derive(Clone, Debug)]
pub struct VanishingLogp;

impl LogpFunc for VanishingLogp {
    type LogpError = TestLogpError;

    fn dim(&self) -> usize {
        2
    }

    fn logp(&mut self, _position: &[f64], gradient: &mut [f64]) -> Result<f64, TestLogpError> {
        gradient.fill(0.);
        Ok(f64::NEG_INFINITY)
    }
}

/// A density that always fails with an unrecoverable error.
#[derive(Clone, Debug)]
pub struct FailingLogp;

impl LogpFunc for FailingLogp {
    type LogpError = TestLogpError;

    fn dim(&self) -> usize {
        1
    }

    fn logp(&mut self, _position: &[f64], _gradient: &mut [f64]) -> Result<f64, TestLogpError> {
        Err(TestLogpError::Fatal)
    }
}

/// A standard normal whose log density drops by `1e6` once any coordinate
/// reaches `threshold`, while the gradient stays smooth.
#[derive(Clone, Debug)]
pub struct EnergyBlowup {
    pub dim: usize,
    pub threshold: f64,
}

impl EnergyBlowup {
    pub fn new(dim: usize, threshold: f64) -> Self {
        Self { dim, threshold }
    }
}

impl LogpFunc for EnergyBlowup {
    type LogpError = TestLogpError;

    fn dim(&self) -> usize {
        self.dim
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, TestLogpError> {
        let mut logp = 0f64;
        for (x, g) in position.iter().zip(gradient.iter_mut()) {
            logp -= x * x / 2.;
            *g = -x;
        }
        if position.iter().any(|&x| x >= self.threshold) {
            logp -= 1e6;
        }
        Ok(logp)
    }
}
