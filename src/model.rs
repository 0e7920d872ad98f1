//! Interfaces to the density that is sampled.
//!
//! The sampler only ever sees the log density of the posterior and its
//! gradient on an unconstrained parameter space. Everything else about the
//! model (transforms, data, the distributions it is built from) stays on the
//! other side of [`LogpFunc`].

use std::{error::Error, fmt::Debug};

use anyhow::Result;
use rand::Rng;

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: Error {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    ///
    /// A recoverable error is a domain failure: the density is not defined
    /// at the requested position (for example a scale parameter that left its
    /// support). The sampler treats such a position as having infinite
    /// potential energy.
    fn is_recoverable(&self) -> bool;
}

/// Unnormalized log density of the posterior together with its gradient.
pub trait LogpFunc {
    type LogpError: Debug + Send + Sync + Error + LogpError + 'static;

    /// The dimension of the unconstrained parameter space.
    fn dim(&self) -> usize;

    /// Compute the unnormalized log probability density of the posterior
    ///
    /// The gradient has to be written to `gradient`. A return value of
    /// `-inf` is allowed and means the position has vanishing density.
    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError>;
}

impl<F: LogpFunc + ?Sized> LogpFunc for &mut F {
    type LogpError = F::LogpError;

    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError> {
        (**self).logp(position, gradient)
    }
}

/// A model that can hand out independent log density functions, one per
/// chain.
///
/// The trait is thread-safe so that several chains can be sampled in
/// parallel, each with its own density object.
pub trait Model: Send + Sync {
    type Density<'model>: LogpFunc
    where
        Self: 'model;

    /// Returns a new log density function for a chain.
    fn density(&self) -> Result<Self::Density<'_>>;

    /// Draw a random initial point for the random initialization strategy.
    ///
    /// The default draws each coordinate uniformly from `(-radius, radius)`,
    /// which is what the sampler does for models that do not know anything
    /// better.
    fn init_position<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        radius: f64,
        position: &mut [f64],
    ) -> Result<()> {
        position
            .iter_mut()
            .for_each(|x| *x = rng.random_range(-radius..radius));
        Ok(())
    }
}
