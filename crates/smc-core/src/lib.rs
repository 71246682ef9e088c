//! Controlled sequence generation by Sequential Monte Carlo.
//!
//! A population of weighted particles (candidate continuations) is grown one
//! token at a time by a language model, reweighted by potentials that score
//! how well each continuation satisfies the caller's constraints, and
//! resampled when the weights degenerate. The heaviest particle wins.
//!
//! Zero I/O apart from reading a config file. Models, embedders, and
//! retrievers are collaborators supplied by the caller.

pub mod config;
pub mod constants;
pub mod constraint;
pub mod device;
pub mod error;
pub mod model;
pub mod parallel;
pub mod particle;
pub mod pool;
pub mod potential;
pub mod resample;
pub mod sampler;
pub mod similarity;

pub use config::{ParallelConfig, SampleOptions, SamplerConfig};
pub use constants::{EPSILON, PENALTY_FLOOR};
pub use constraint::{Constraint, forbidden_content, length_bounds, required_elements};
pub use device::WorkerPlan;
pub use error::{Result, SamplerError};
pub use model::{LanguageModel, select_candidate};
pub use parallel::ParallelSampler;
pub use particle::{Particle, tokenize_chars};
pub use pool::{ExecutionStrategy, WorkerPool};
pub use potential::{Embedder, Potential, PotentialKind, Retriever, SequenceScorer};
pub use resample::effective_sample_size;
pub use sampler::{ParticleSampler, SampleOutcome, Sampler, SamplerState, StopReason};
pub use similarity::cosine_similarity;
