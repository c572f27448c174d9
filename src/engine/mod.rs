//! Pipeline, sampling and the model-runner contract.

pub mod handle;
pub mod model_runner;
pub mod pipeline;
pub mod sampler;

pub use handle::{
    GenerationHandle, GenerationOutput, GenerationResult, GenerationStatus, GenerationStream,
};
pub use model_runner::{ForwardInput, ForwardOutput, ModelRunner};
pub use pipeline::{
    ContinuousBatchingPipeline, GeneratedSequence, PipelineMetrics, RequestInjector,
    UpdateSequenceResult,
};
pub use sampler::Sampler;
