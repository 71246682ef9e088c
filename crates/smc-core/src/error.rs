use thiserror::Error;

/// Failure taxonomy for the sampler and its collaborators.
///
/// Only constructors and per-step operations surface these. `sample` itself
/// catches every variant and degrades to the next-cheaper strategy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplerError {
    /// Model/backend failure, quota or compute exhaustion.
    #[error("resource error: {0}")]
    Resource(String),

    /// Invalid sampler or potential parameters.
    #[error("validation error: {0}")]
    Validation(String),

    /// A worker crashed, panicked, or the pool could not be built.
    #[error("execution error: {0}")]
    Execution(String),

    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SamplerError>;
