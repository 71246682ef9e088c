//! Sequential SMC sampler: initialize → {extend → reweight → resample}* →
//! pick the heaviest particle.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::{SampleOptions, SamplerConfig};
use crate::error::{Result, SamplerError};
use crate::model::{LanguageModel, select_candidate};
use crate::particle::{Particle, tokenize_chars};
use crate::pool::catch_panics;
use crate::potential::{Potential, partition};
use crate::resample::{
    argmax_weight, effective_sample_size, multinomial_indices, normalize_weights,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplerState {
    Uninitialized,
    Populated,
    Extended,
    Reweighted,
    Resampled,
    Finalized,
}

/// Why a `sample` call stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Token budget exhausted.
    MaxTokens,
    /// Random early termination (sequential end-of-sequence stand-in).
    EarlyTermination,
    /// A particle produced a configured stop string.
    StopString,
    /// Soft wall-clock deadline passed.
    Timeout,
    /// Too many tokens without a better particle.
    NoImprovement,
    /// The best particle ended a sentence or emitted an end marker.
    EndOfSequence,
    /// The model generated the text directly, bypassing the particle loop.
    DirectGeneration,
    /// Every strategy failed; the prompt was returned unchanged.
    Failed,
}

/// Text plus a summary of how it was produced.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleOutcome {
    pub text: String,
    pub tokens_generated: usize,
    pub rounds: usize,
    pub resamples: usize,
    pub stop_reason: StopReason,
}

impl SampleOutcome {
    pub(crate) fn unchanged(prompt: &str) -> Self {
        Self {
            text: prompt.to_string(),
            tokens_generated: 0,
            rounds: 0,
            resamples: 0,
            stop_reason: StopReason::Failed,
        }
    }

    pub(crate) fn direct(text: String) -> Self {
        Self {
            text,
            tokens_generated: 0,
            rounds: 0,
            resamples: 0,
            stop_reason: StopReason::DirectGeneration,
        }
    }
}

/// Common surface of the sequential and parallel samplers.
pub trait ParticleSampler {
    /// Never fails: errors degrade to a cheaper strategy, ultimately the prompt.
    fn sample_with_outcome(
        &mut self,
        prompt: &str,
        options: &SampleOptions,
        model: Option<&dyn LanguageModel>,
    ) -> SampleOutcome;

    fn sample(
        &mut self,
        prompt: &str,
        options: &SampleOptions,
        model: Option<&dyn LanguageModel>,
    ) -> String {
        self.sample_with_outcome(prompt, options, model).text
    }

    fn update_potentials(&mut self, potentials: Vec<Potential>);

    fn particles(&self) -> &[Particle];

    fn num_particles(&self) -> usize;
}

/// Resolved per-call generation parameters.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StepParams {
    pub temperature: f64,
    pub num_candidates: usize,
}

/// Single-threaded SMC sampler.
///
/// Owns its population and potentials exclusively; not meant for concurrent
/// callers.
pub struct Sampler {
    pub(crate) config: SamplerConfig,
    pub(crate) potentials: Vec<Potential>,
    pub(crate) efficient_potentials: Vec<Potential>,
    pub(crate) expensive_potentials: Vec<Potential>,
    pub(crate) particles: Vec<Particle>,
    pub(crate) model: Option<Arc<dyn LanguageModel>>,
    pub(crate) rng: SmallRng,
    pub(crate) state: SamplerState,
    reweight_rounds: usize,
}

impl Sampler {
    pub fn new(config: SamplerConfig, potentials: Vec<Potential>) -> Result<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        let (efficient_potentials, expensive_potentials) = partition(&potentials);
        Ok(Self {
            config,
            potentials,
            efficient_potentials,
            expensive_potentials,
            particles: Vec::new(),
            model: None,
            rng,
            state: SamplerState::Uninitialized,
            reweight_rounds: 0,
        })
    }

    /// Default model used when `sample` gets no override.
    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn set_model(&mut self, model: Arc<dyn LanguageModel>) {
        self.model = Some(model);
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn potentials(&self) -> &[Potential] {
        &self.potentials
    }

    pub fn efficient_potentials(&self) -> &[Potential] {
        &self.efficient_potentials
    }

    pub fn expensive_potentials(&self) -> &[Potential] {
        &self.expensive_potentials
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Replace the population wholesale (seeding experiments and tests).
    pub fn set_particles(&mut self, particles: Vec<Particle>) {
        self.particles = particles;
        self.state = SamplerState::Populated;
    }

    pub fn num_particles(&self) -> usize {
        self.config.num_particles
    }

    /// Replace the active potentials and recompute the efficient/expensive split.
    pub fn update_potentials(&mut self, potentials: Vec<Potential>) {
        let (efficient, expensive) = partition(&potentials);
        tracing::debug!(
            "potentials updated: {} efficient, {} expensive",
            efficient.len(),
            expensive.len()
        );
        self.potentials = potentials;
        self.efficient_potentials = efficient;
        self.expensive_potentials = expensive;
    }

    /// Fill the population with `num_particles` copies of the prompt,
    /// tokenized per character, each at weight 1.0.
    pub fn initialize_particles(&mut self, prompt: &str) {
        let sequence = tokenize_chars(prompt);
        self.particles = (0..self.config.num_particles)
            .map(|_| Particle::new(sequence.clone()))
            .collect();
        self.reweight_rounds = 0;
        self.state = SamplerState::Populated;
    }

    /// Append one sampled token to every particle.
    pub fn extend_particles(&mut self, model: &dyn LanguageModel) -> Result<()> {
        let params = self.default_params();
        self.extend_sequential(model, params)
    }

    pub(crate) fn default_params(&self) -> StepParams {
        StepParams {
            temperature: self.config.temperature,
            num_candidates: self.config.num_candidates,
        }
    }

    pub(crate) fn params_for(&self, options: &SampleOptions) -> StepParams {
        StepParams {
            temperature: options.temperature.unwrap_or(self.config.temperature),
            num_candidates: options
                .num_candidates
                .unwrap_or(self.config.num_candidates)
                .max(1),
        }
    }

    pub(crate) fn extend_sequential(
        &mut self,
        model: &dyn LanguageModel,
        params: StepParams,
    ) -> Result<()> {
        let mut extended = Vec::with_capacity(self.particles.len());
        for particle in &self.particles {
            let candidates = model.generate_candidate_tokens(
                &particle.text(),
                params.num_candidates,
                params.temperature,
            )?;
            match select_candidate(&candidates, params.temperature, &mut self.rng) {
                Some(token) => extended.push(particle.extend(token)),
                None => extended.push(particle.clone()),
            }
        }
        self.particles = extended;
        self.state = SamplerState::Extended;
        Ok(())
    }

    /// Apply potentials as multiplicative weight updates, then normalize.
    pub fn reweight_particles(&mut self) {
        let apply_expensive = self.expensive_due();
        self.apply_efficient_potentials();
        if apply_expensive {
            self.apply_expensive_potentials();
        }
        self.finish_reweight();
    }

    pub(crate) fn apply_efficient_potentials(&mut self) {
        for potential in &self.efficient_potentials {
            for particle in &mut self.particles {
                particle.update_weight(potential.evaluate(&particle.sequence));
            }
        }
    }

    /// Whether this reweight round includes expensive potentials. Advances
    /// the round counter.
    pub(crate) fn expensive_due(&mut self) -> bool {
        let due = self.reweight_rounds % self.config.expensive_potential_interval == 0;
        self.reweight_rounds += 1;
        due
    }

    pub(crate) fn apply_expensive_potentials(&mut self) {
        for potential in &self.expensive_potentials {
            for particle in &mut self.particles {
                particle.update_weight(potential.evaluate(&particle.sequence));
            }
        }
    }

    pub(crate) fn finish_reweight(&mut self) {
        if !normalize_weights(&mut self.particles) {
            tracing::debug!(
                "reweight left {} particles unnormalized (zero total weight)",
                self.particles.len()
            );
        }
        self.state = SamplerState::Reweighted;
    }

    /// Multinomial resampling when `ESS / num_particles < ess_threshold`.
    /// Returns whether the population was replaced.
    pub fn resample_particles(&mut self) -> bool {
        self.state = SamplerState::Resampled;
        if self.particles.is_empty() {
            return false;
        }

        let n = self.config.num_particles;
        let ess = effective_sample_size(&self.particles);
        let ratio = ess / n as f64;
        if ratio >= self.config.ess_threshold {
            tracing::debug!("ESS {ess:.3} (ratio {ratio:.3}) - no resample");
            return false;
        }

        let weights: Vec<f64> = self.particles.iter().map(|p| p.weight).collect();
        let indices = multinomial_indices(&weights, n, &mut self.rng);
        let uniform = 1.0 / n as f64;
        let resampled: Vec<Particle> = indices
            .into_iter()
            .map(|i| {
                let source = &self.particles[i];
                Particle {
                    sequence: source.sequence.clone(),
                    weight: uniform,
                    log_weight: 0.0,
                    metadata: source.metadata.clone(),
                }
            })
            .collect();
        tracing::debug!("ESS {ess:.3} (ratio {ratio:.3}) - resampled {n} particles");
        self.particles = resampled;
        true
    }

    /// Highest-weight particle in the current population.
    pub fn best_particle(&self) -> Option<&Particle> {
        argmax_weight(&self.particles).map(|i| &self.particles[i])
    }

    pub fn sample(
        &mut self,
        prompt: &str,
        options: &SampleOptions,
        model: Option<&dyn LanguageModel>,
    ) -> String {
        self.sample_with_outcome(prompt, options, model).text
    }

    pub fn sample_with_outcome(
        &mut self,
        prompt: &str,
        options: &SampleOptions,
        model: Option<&dyn LanguageModel>,
    ) -> SampleOutcome {
        let default_model = self.model.clone();
        let Some(model) = model.or(default_model.as_deref()) else {
            tracing::error!(
                "no model available (prompt_len={}, particles={}) - returning prompt",
                prompt.len(),
                self.config.num_particles
            );
            return SampleOutcome::unchanged(prompt);
        };

        match catch_panics(|| self.try_sample(prompt, options, model)) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    "sampling failed (prompt_len={}, particles={}): {e} - returning prompt",
                    prompt.len(),
                    self.particles.len()
                );
                self.state = SamplerState::Finalized;
                SampleOutcome::unchanged(prompt)
            }
        }
    }

    fn try_sample(
        &mut self,
        prompt: &str,
        options: &SampleOptions,
        model: &dyn LanguageModel,
    ) -> Result<SampleOutcome> {
        let params = self.params_for(options);

        if self.potentials.is_empty() {
            tracing::info!("no potentials configured - generating directly");
            let text = direct_generation(model, prompt, options, params.temperature)?;
            return Ok(SampleOutcome::direct(text));
        }

        tracing::info!(
            "sequential sample: prompt_len={}, max_tokens={}, particles={}",
            prompt.len(),
            options.max_tokens,
            self.config.num_particles
        );

        self.initialize_particles(prompt);
        let mut tokens_generated = 0;
        let mut resamples = 0;
        let mut stop_reason = StopReason::MaxTokens;

        for _ in 0..options.max_tokens {
            self.extend_sequential(model, params)?;
            tokens_generated += 1;
            self.reweight_particles();
            if self.resample_particles() {
                resamples += 1;
            }

            if contains_stop_string(&self.particles, &options.stop_strings) {
                stop_reason = StopReason::StopString;
                break;
            }
            if self.rng.random_bool(self.config.early_termination_probability) {
                stop_reason = StopReason::EarlyTermination;
                break;
            }
        }

        let text = self
            .best_particle()
            .map(Particle::text)
            .ok_or_else(|| SamplerError::Execution("population is empty".to_string()))?;
        self.state = SamplerState::Finalized;
        tracing::info!("sequential sample finished after {tokens_generated} tokens: {stop_reason:?}");

        Ok(SampleOutcome {
            text,
            tokens_generated,
            rounds: tokens_generated,
            resamples,
            stop_reason,
        })
    }
}

impl ParticleSampler for Sampler {
    fn sample_with_outcome(
        &mut self,
        prompt: &str,
        options: &SampleOptions,
        model: Option<&dyn LanguageModel>,
    ) -> SampleOutcome {
        Sampler::sample_with_outcome(self, prompt, options, model)
    }

    fn update_potentials(&mut self, potentials: Vec<Potential>) {
        Sampler::update_potentials(self, potentials);
    }

    fn particles(&self) -> &[Particle] {
        Sampler::particles(self)
    }

    fn num_particles(&self) -> usize {
        Sampler::num_particles(self)
    }
}

/// Prompt followed by the model's free-running continuation.
pub(crate) fn direct_generation(
    model: &dyn LanguageModel,
    prompt: &str,
    options: &SampleOptions,
    temperature: f64,
) -> Result<String> {
    let continuation =
        model.generate_text(prompt, options.max_tokens, temperature, &options.stop_strings)?;
    Ok(format!("{prompt}{continuation}"))
}

pub(crate) fn contains_stop_string(particles: &[Particle], stop_strings: &[String]) -> bool {
    if stop_strings.is_empty() {
        return false;
    }
    particles.iter().any(|p| {
        let text = p.text();
        stop_strings
            .iter()
            .any(|s| !s.is_empty() && text.contains(s.as_str()))
    })
}
