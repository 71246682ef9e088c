use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_NUM_CANDIDATES, MIN_PARTICLES_PER_WORKER};
use crate::error::{Result, SamplerError};

/// Sampler configuration, built once by the caller and handed to the
/// sampler. Every field has a default, so a partial TOML file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Population size, restored after every resample.
    pub num_particles: usize,

    /// Resample when `ESS / num_particles` falls below this. In (0, 1].
    pub ess_threshold: f64,

    /// Candidate-selection temperature. 0 is greedy.
    pub temperature: f64,

    /// Next-token candidates requested per particle.
    pub num_candidates: usize,

    /// Per-iteration chance the sequential loop stops early.
    pub early_termination_probability: f64,

    /// Apply expensive potentials every N reweight rounds. 1 applies them
    /// at the same cadence as efficient potentials.
    pub expensive_potential_interval: usize,

    /// Seed for reproducible runs. Unseeded samplers draw from the OS.
    pub seed: Option<u64>,

    /// Text endings treated as end-of-sequence in addition to `.`, `!`, `?`.
    pub eos_markers: Vec<String>,

    pub parallel: ParallelConfig,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_particles: 10,
            ess_threshold: 0.5,
            temperature: 0.7,
            num_candidates: DEFAULT_NUM_CANDIDATES,
            early_termination_probability: 0.1,
            expensive_potential_interval: 1,
            seed: None,
            eos_markers: vec!["</s>".to_string(), "<|endoftext|>".to_string()],
            parallel: ParallelConfig::default(),
        }
    }
}

/// Worker-pool settings for `ParallelSampler`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Worker count. Defaults to available CPU parallelism.
    pub num_workers: Option<usize>,

    /// Shared-memory (thread) workers sharing one model handle instead of
    /// isolated workers owning their batch.
    pub use_gpu: bool,

    /// Tokens generated between reweight/resample passes.
    pub batch_size: usize,

    /// Overrides GPU device discovery.
    pub gpu_devices: Option<usize>,

    /// Below `num_workers * min_particles_per_worker` particles the
    /// sequential path is used.
    pub min_particles_per_worker: usize,

    /// Stop after `max(20, max_tokens / 5)` tokens without a better particle.
    pub early_stopping: bool,

    /// Soft wall-clock deadline for one `sample` call.
    pub timeout_secs: Option<f64>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            num_workers: None,
            use_gpu: false,
            batch_size: 5,
            gpu_devices: None,
            min_particles_per_worker: MIN_PARTICLES_PER_WORKER,
            early_stopping: true,
            timeout_secs: None,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_particles < 1 {
            return Err(SamplerError::Validation(
                "num_particles must be >= 1".to_string(),
            ));
        }
        if !(self.ess_threshold > 0.0 && self.ess_threshold <= 1.0) {
            return Err(SamplerError::Validation(format!(
                "ess_threshold must be in (0, 1], got {}",
                self.ess_threshold
            )));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SamplerError::Validation(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        if self.num_candidates < 1 {
            return Err(SamplerError::Validation(
                "num_candidates must be >= 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.early_termination_probability) {
            return Err(SamplerError::Validation(format!(
                "early_termination_probability must be in [0, 1], got {}",
                self.early_termination_probability
            )));
        }
        if self.expensive_potential_interval < 1 {
            return Err(SamplerError::Validation(
                "expensive_potential_interval must be >= 1".to_string(),
            ));
        }
        self.parallel.validate()
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SamplerError::Config(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SamplerError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SamplerError::Config(format!("TOML serialize error: {e}")))
    }
}

impl ParallelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == Some(0) {
            return Err(SamplerError::Validation(
                "num_workers must be >= 1 when set".to_string(),
            ));
        }
        if self.batch_size < 1 {
            return Err(SamplerError::Validation(
                "batch_size must be >= 1".to_string(),
            ));
        }
        if self.min_particles_per_worker < 1 {
            return Err(SamplerError::Validation(
                "min_particles_per_worker must be >= 1".to_string(),
            ));
        }
        if let Some(secs) = self.timeout_secs
            && !(secs > 0.0 && Duration::try_from_secs_f64(secs).is_ok())
        {
            return Err(SamplerError::Validation(format!(
                "timeout_secs must be a positive duration, got {secs}"
            )));
        }
        Ok(())
    }

    /// `timeout_secs` as a `Duration`; `None` when unset or unrepresentable.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|d| !d.is_zero())
    }
}

/// Per-call parameters of `sample`. `None` fields fall back to the
/// sampler's configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleOptions {
    pub max_tokens: usize,
    pub temperature: Option<f64>,
    pub stop_strings: Vec<String>,
    pub num_candidates: Option<usize>,
    pub batch_size: Option<usize>,
    pub early_stopping: Option<bool>,
    pub timeout: Option<Duration>,
}

impl SampleOptions {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            temperature: None,
            stop_strings: Vec::new(),
            num_candidates: None,
            batch_size: None,
            early_stopping: None,
            timeout: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_stop_strings(mut self, stop_strings: Vec<String>) -> Self {
        self.stop_strings = stop_strings;
        self
    }

    pub fn with_num_candidates(mut self, num_candidates: usize) -> Self {
        self.num_candidates = Some(num_candidates);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_early_stopping(mut self, early_stopping: bool) -> Self {
        self.early_stopping = Some(early_stopping);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self::new(100)
    }
}
