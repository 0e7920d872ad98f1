pub(crate) mod adapt_strategy;
pub(crate) mod chain;
pub(crate) mod hamiltonian;
pub(crate) mod integrator;
pub(crate) mod mass_matrix;
pub(crate) mod mass_matrix_adapt;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod nuts;
pub(crate) mod sampler;
pub(crate) mod static_hmc;
pub(crate) mod stepsize;
pub(crate) mod storage;

#[cfg(test)]
pub(crate) mod test_logps;

pub use adapt_strategy::{WarmupController, WarmupPhase, WindowSchedule};
pub use chain::HmcChain;
pub use hamiltonian::{Direction, DivergenceInfo, EuclideanHamiltonian, EuclideanPoint, TurningCriterion};
pub use mass_matrix::{
    DenseMassMatrix, DiagMassMatrix, MassMatrix, Metric, MetricError, MetricEstimate, MetricKind,
    UnitMassMatrix,
};
pub use mass_matrix_adapt::{MetricAdaptOptions, MetricAdapter, RunningCovariance, RunningVariance};
pub use model::{LogpError, LogpFunc, Model};
pub use nuts::{InitError, InitFailure, InitKind, NutsError, NutsOptions, SampleInfo};
pub use sampler::{
    chain_rng, run_chain, sample, sample_parallel, ChainSummary, Engine, HmcSettings,
    InitStrategy, Progress, ProgressCallback, RunControl, SampleRecord, SampleSink,
};
pub use static_hmc::TrajectoryLength;
pub use stepsize::{DualAverage, DualAverageOptions, StepSizeAdapter};
pub use storage::ArrowTraceSink;
