pub(crate) mod chain;
pub(crate) mod compose;
pub(crate) mod compress;
pub(crate) mod ensemble;
pub(crate) mod error;
pub(crate) mod math;
pub(crate) mod memory;
pub(crate) mod model;
pub(crate) mod resample;
pub(crate) mod sampler;
pub(crate) mod sweep;
pub(crate) mod trajectory;

pub use chain::{
    apg, pimh, ChainFailure, ChainKind, ChainOutput, Expectation, PmcmcChain, Progress,
};
pub use compose::{compose, RowAssignment};
pub use compress::{Compressor, MergeDuplicates};
pub use ensemble::{Ensemble, StepWidth, Values};
pub use error::{Result, SmcError};
pub use memory::{MemoryGuardSettings, MemoryPressure};
pub use model::{SampleFn, SmcModel, SteppedModel, WeightFn};
pub use resample::{Resampler, ResamplingScheme};
pub use sampler::{
    sample_parallel, sample_parallel_with, CancelToken, ChainProgress, ChainSettings,
    ProgressCallback,
};
pub use sweep::{pg_sweep, Sample, SmcSweep, SweepOutput, SweepSettings};
pub use trajectory::{StepLayout, Trajectory};
