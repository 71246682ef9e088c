//! Batch-parallel SMC sampler.
//!
//! Wraps the sequential [`Sampler`] and overrides extension, reweighting,
//! and the sampling loop. Work is split into contiguous particle batches and
//! dispatched to a long-lived [`WorkerPool`]; every round is a fork-join
//! barrier. Any pool failure degrades to the sequential path for that round.

use std::sync::Arc;
use std::time::Instant;

use rand::Rng;

use crate::config::{SampleOptions, SamplerConfig};
use crate::constants::{EOS_STOP_PROBABILITY, EPSILON, MIN_PATIENCE_TOKENS, SENTENCE_TERMINALS};
use crate::device::{WorkerPlan, available_cpus, detect_gpu_devices, plan_workers};
use crate::error::{Result, SamplerError};
use crate::model::LanguageModel;
use crate::particle::Particle;
use crate::pool::{ExecutionStrategy, WorkerPool, catch_panics, partition_batches};
use crate::potential::Potential;
use crate::resample::weighted_sample_without_replacement;
use crate::sampler::{
    ParticleSampler, SampleOutcome, Sampler, SamplerState, StepParams, StopReason,
    contains_stop_string, direct_generation,
};

pub struct ParallelSampler {
    base: Sampler,
    plan: WorkerPlan,
    /// Shared-memory threads in GPU mode, otherwise the scoring pool.
    extension_pool: Option<WorkerPool>,
    /// Always isolated-memory.
    scoring_pool: Option<WorkerPool>,
}

impl ParallelSampler {
    /// Size workers from the machine: GPU devices from the config override or
    /// the environment, CPUs from available parallelism.
    pub fn new(config: SamplerConfig, potentials: Vec<Potential>) -> Result<Self> {
        let gpu_devices = config
            .parallel
            .gpu_devices
            .unwrap_or_else(detect_gpu_devices);
        Self::with_resources(config, potentials, gpu_devices, available_cpus())
    }

    /// Construct against explicit device counts.
    pub fn with_resources(
        config: SamplerConfig,
        potentials: Vec<Potential>,
        gpu_devices: usize,
        cpus: usize,
    ) -> Result<Self> {
        let base = Sampler::new(config, potentials)?;
        let plan = plan_workers(&base.config.parallel, gpu_devices, cpus);

        let scoring_pool = build_pool(ExecutionStrategy::IsolatedMemory, plan.num_workers);
        let extension_pool = if plan.use_gpu {
            build_pool(ExecutionStrategy::SharedMemory, plan.num_workers)
        } else {
            scoring_pool.clone()
        };

        tracing::info!(
            "parallel sampler: {} workers, {} mode, {} particles",
            plan.num_workers,
            if plan.use_gpu { "gpu" } else { "cpu" },
            base.config.num_particles
        );

        Ok(Self {
            base,
            plan,
            extension_pool,
            scoring_pool,
        })
    }

    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.base.set_model(model);
        self
    }

    pub fn set_model(&mut self, model: Arc<dyn LanguageModel>) {
        self.base.set_model(model);
    }

    pub fn num_workers(&self) -> usize {
        self.plan.num_workers
    }

    pub fn uses_gpu(&self) -> bool {
        self.plan.use_gpu
    }

    pub fn plan(&self) -> WorkerPlan {
        self.plan
    }

    /// The wrapped sequential sampler.
    pub fn base(&self) -> &Sampler {
        &self.base
    }

    pub fn config(&self) -> &SamplerConfig {
        self.base.config()
    }

    pub fn state(&self) -> SamplerState {
        self.base.state()
    }

    pub fn particles(&self) -> &[Particle] {
        self.base.particles()
    }

    pub fn set_particles(&mut self, particles: Vec<Particle>) {
        self.base.set_particles(particles);
    }

    pub fn num_particles(&self) -> usize {
        self.base.num_particles()
    }

    pub fn update_potentials(&mut self, potentials: Vec<Potential>) {
        self.base.update_potentials(potentials);
    }

    pub fn initialize_particles(&mut self, prompt: &str) {
        self.base.initialize_particles(prompt);
    }

    pub fn best_particle(&self) -> Option<&Particle> {
        self.base.best_particle()
    }

    /// Too few particles per worker to be worth dispatching.
    fn below_parallel_threshold(&self) -> bool {
        let min = self.plan.num_workers * self.base.config.parallel.min_particles_per_worker;
        self.base.particles.len() < min
    }

    // -----------------------------------------------------------------------
    // Extension
    // -----------------------------------------------------------------------

    /// Expand every particle into up to `num_candidates` children across the
    /// pool, then down-sample back to `num_particles`.
    pub fn extend_particles(&mut self, model: &dyn LanguageModel) -> Result<()> {
        let params = self.base.default_params();
        self.extend_with(model, params)
    }

    fn extend_with(&mut self, model: &dyn LanguageModel, params: StepParams) -> Result<()> {
        if self.below_parallel_threshold() {
            tracing::debug!(
                "{} particles below parallel threshold for {} workers - extending sequentially",
                self.base.particles.len(),
                self.plan.num_workers
            );
            return self.base.extend_sequential(model, params);
        }
        let Some(pool) = self.extension_pool.clone() else {
            return self.base.extend_sequential(model, params);
        };

        match self.extend_batches(&pool, model, params) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(
                    "parallel extension failed (particles={}, workers={}): {e} - extending sequentially",
                    self.base.particles.len(),
                    self.plan.num_workers
                );
                self.base.extend_sequential(model, params)
            }
        }
    }

    fn extend_batches(
        &mut self,
        pool: &WorkerPool,
        model: &dyn LanguageModel,
        params: StepParams,
    ) -> Result<()> {
        let batched = self.plan.use_gpu && model.supports_batching();
        let batches = partition_batches(self.base.particles.clone(), self.plan.num_workers);

        let results = pool.run(batches, |_, batch: Vec<Particle>| {
            expand_batch(model, &batch, params, batched)
        })?;
        let mut children: Vec<Particle> = results.into_iter().flatten().collect();

        let target = self.base.config.num_particles;
        if children.len() > target {
            // Children carry their parent's weight, so heavier parents are
            // proportionally more likely to survive.
            let weights: Vec<f64> = children.iter().map(|c| c.weight).collect();
            let keep = weighted_sample_without_replacement(&weights, target, &mut self.base.rng);
            let mut mask = vec![false; children.len()];
            for i in keep {
                mask[i] = true;
            }
            children = children
                .into_iter()
                .zip(mask)
                .filter_map(|(child, kept)| kept.then_some(child))
                .collect();
        }

        tracing::debug!(
            "parallel extension: {} batches, {} particles (batched={batched})",
            self.plan.num_workers.min(self.base.particles.len()),
            children.len()
        );
        self.base.particles = children;
        self.base.state = SamplerState::Extended;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reweighting
    // -----------------------------------------------------------------------

    /// Efficient potentials scored per batch in isolated workers, expensive
    /// potentials sequentially, then normalize.
    pub fn reweight_particles(&mut self) {
        let apply_expensive = self.base.expensive_due();

        if !self.base.efficient_potentials.is_empty() {
            let products = match self.scoring_pool.clone() {
                Some(pool) if !self.below_parallel_threshold() => {
                    match self.efficient_products(&pool) {
                        Ok(products) => Some(products),
                        Err(e) => {
                            tracing::warn!(
                                "parallel reweight failed (particles={}): {e} - scoring sequentially",
                                self.base.particles.len()
                            );
                            None
                        }
                    }
                }
                _ => None,
            };
            match products {
                Some(products) => {
                    for (particle, factor) in self.base.particles.iter_mut().zip(products) {
                        particle.update_weight(factor);
                    }
                }
                None => self.base.apply_efficient_potentials(),
            }
        }

        if apply_expensive {
            self.base.apply_expensive_potentials();
        }
        self.base.finish_reweight();
    }

    /// Per-particle product of the efficient potentials, in population order.
    fn efficient_products(&self, pool: &WorkerPool) -> Result<Vec<f64>> {
        let sequences: Vec<Vec<String>> = self
            .base
            .particles
            .iter()
            .map(|p| p.sequence.clone())
            .collect();
        let batches: Vec<(Vec<Vec<String>>, Vec<Potential>)> =
            partition_batches(sequences, self.plan.num_workers)
                .into_iter()
                .map(|batch| (batch, self.base.efficient_potentials.clone()))
                .collect();

        let results = pool.run(
            batches,
            |_, (batch, potentials): (Vec<Vec<String>>, Vec<Potential>)| {
                Ok(batch
                    .iter()
                    .map(|seq| potentials.iter().map(|p| p.evaluate(seq)).product::<f64>())
                    .collect::<Vec<f64>>())
            },
        )?;

        let products: Vec<f64> = results.into_iter().flatten().collect();
        if products.len() != self.base.particles.len() {
            return Err(SamplerError::Execution(format!(
                "scored {} of {} particles",
                products.len(),
                self.base.particles.len()
            )));
        }
        Ok(products)
    }

    pub fn resample_particles(&mut self) -> bool {
        self.base.resample_particles()
    }

    // -----------------------------------------------------------------------
    // Sampling
    // -----------------------------------------------------------------------

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
        let default_model = self.base.model.clone();
        let Some(model) = model.or(default_model.as_deref()) else {
            tracing::error!(
                "no model available (prompt_len={}, particles={}) - returning prompt",
                prompt.len(),
                self.base.config.num_particles
            );
            return SampleOutcome::unchanged(prompt);
        };

        match catch_panics(|| self.try_sample(prompt, options, model)) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.base.state = SamplerState::Finalized;
                tracing::warn!(
                    "parallel sampling failed (prompt_len={}, particles={}): {e} - generating directly",
                    prompt.len(),
                    self.base.particles.len()
                );
                let temperature = self.base.params_for(options).temperature;
                match catch_panics(|| direct_generation(model, prompt, options, temperature)) {
                    Ok(text) => SampleOutcome::direct(text),
                    Err(e) => {
                        tracing::error!(
                            "direct generation failed (prompt_len={}): {e} - returning prompt",
                            prompt.len()
                        );
                        SampleOutcome::unchanged(prompt)
                    }
                }
            }
        }
    }

    fn try_sample(
        &mut self,
        prompt: &str,
        options: &SampleOptions,
        model: &dyn LanguageModel,
    ) -> Result<SampleOutcome> {
        let params = self.base.params_for(options);

        if self.base.potentials.is_empty() {
            tracing::info!("no potentials configured - generating directly");
            let text = direct_generation(model, prompt, options, params.temperature)?;
            return Ok(SampleOutcome::direct(text));
        }

        let parallel = &self.base.config.parallel;
        let batch_size = options.batch_size.unwrap_or(parallel.batch_size).max(1);
        let early_stopping = options.early_stopping.unwrap_or(parallel.early_stopping);
        let deadline = options.timeout.or_else(|| parallel.timeout());
        let patience = MIN_PATIENCE_TOKENS.max(options.max_tokens / 5);

        tracing::info!(
            "parallel sample: prompt_len={}, max_tokens={}, particles={}, workers={}, batch_size={batch_size}",
            prompt.len(),
            options.max_tokens,
            self.base.config.num_particles,
            self.plan.num_workers
        );

        let start = Instant::now();
        let expired = || deadline.is_some_and(|limit| start.elapsed() >= limit);

        self.base.initialize_particles(prompt);
        let prompt_len = self.base.particles.first().map_or(0, Particle::len);

        let mut best: Option<Particle> = None;
        let mut stale_tokens = 0;
        let mut tokens_generated = 0;
        let mut rounds = 0;
        let mut resamples = 0;
        let mut unscored = false;
        let mut stop_reason = StopReason::MaxTokens;

        'generation: while tokens_generated < options.max_tokens {
            if expired() {
                stop_reason = StopReason::Timeout;
                break;
            }

            let step = batch_size.min(options.max_tokens - tokens_generated);
            for _ in 0..step {
                self.extend_with(model, params)?;
                tokens_generated += 1;
                unscored = true;

                if contains_stop_string(&self.base.particles, &options.stop_strings) {
                    stop_reason = StopReason::StopString;
                    break 'generation;
                }
                if expired() {
                    stop_reason = StopReason::Timeout;
                    break 'generation;
                }
            }

            self.reweight_particles();
            unscored = false;
            rounds += 1;

            if let Some(current) = self.base.best_particle() {
                let improved = best
                    .as_ref()
                    .is_none_or(|b| current.weight > b.weight + EPSILON);
                if improved {
                    best = Some(current.clone());
                    stale_tokens = 0;
                } else {
                    stale_tokens += step;
                }
            }

            if self.resample_particles() {
                resamples += 1;
            }

            if early_stopping && stale_tokens >= patience {
                tracing::debug!("no improvement for {stale_tokens} tokens - stopping");
                stop_reason = StopReason::NoImprovement;
                break;
            }

            if let Some(b) = &best
                && b.len() > prompt_len
                && ends_sequence(&b.text(), &self.base.config.eos_markers)
                && self.base.rng.random_bool(EOS_STOP_PROBABILITY)
            {
                stop_reason = StopReason::EndOfSequence;
                break;
            }
        }

        // Score the tail so its weights compare with the tracked best.
        if unscored && stop_reason != StopReason::Timeout {
            self.reweight_particles();
            rounds += 1;
        }

        let current = self.base.best_particle().cloned();
        let chosen = match (current, best) {
            (Some(c), Some(b)) => {
                if c.weight + EPSILON >= b.weight {
                    Some(c)
                } else {
                    Some(b)
                }
            }
            (c, b) => c.or(b),
        };
        self.base.state = SamplerState::Finalized;

        let chosen =
            chosen.ok_or_else(|| SamplerError::Execution("population is empty".to_string()))?;

        if chosen.len() <= prompt_len {
            tracing::info!("no tokens beyond the prompt - generating directly");
            let text = direct_generation(model, prompt, options, params.temperature)?;
            return Ok(SampleOutcome {
                text,
                tokens_generated,
                rounds,
                resamples,
                stop_reason: StopReason::DirectGeneration,
            });
        }

        tracing::info!(
            "parallel sample finished after {tokens_generated} tokens, {rounds} rounds: {stop_reason:?}"
        );
        Ok(SampleOutcome {
            text: chosen.text(),
            tokens_generated,
            rounds,
            resamples,
            stop_reason,
        })
    }
}

impl ParticleSampler for ParallelSampler {
    fn sample_with_outcome(
        &mut self,
        prompt: &str,
        options: &SampleOptions,
        model: Option<&dyn LanguageModel>,
    ) -> SampleOutcome {
        ParallelSampler::sample_with_outcome(self, prompt, options, model)
    }

    fn update_potentials(&mut self, potentials: Vec<Potential>) {
        ParallelSampler::update_potentials(self, potentials);
    }

    fn particles(&self) -> &[Particle] {
        ParallelSampler::particles(self)
    }

    fn num_particles(&self) -> usize {
        ParallelSampler::num_particles(self)
    }
}

fn build_pool(strategy: ExecutionStrategy, num_workers: usize) -> Option<WorkerPool> {
    match WorkerPool::new(strategy, num_workers) {
        Ok(pool) => Some(pool),
        Err(e) => {
            tracing::warn!("{strategy:?} pool unavailable: {e} - rounds will run sequentially");
            None
        }
    }
}

/// Children of every particle in one batch, parents in order.
fn expand_batch(
    model: &dyn LanguageModel,
    batch: &[Particle],
    params: StepParams,
    batched: bool,
) -> Result<Vec<Particle>> {
    let candidate_lists = if batched {
        let prompts: Vec<String> = batch.iter().map(Particle::text).collect();
        let lists = model.batch_generate_candidate_tokens(
            &prompts,
            params.temperature,
            params.num_candidates,
        )?;
        if lists.len() != batch.len() {
            return Err(SamplerError::Resource(format!(
                "batched call returned {} candidate lists for {} prompts",
                lists.len(),
                batch.len()
            )));
        }
        lists
    } else {
        batch
            .iter()
            .map(|p| {
                model.generate_candidate_tokens(&p.text(), params.num_candidates, params.temperature)
            })
            .collect::<Result<Vec<_>>>()?
    };

    let mut children = Vec::with_capacity(batch.len() * params.num_candidates);
    for (parent, candidates) in batch.iter().zip(&candidate_lists) {
        if candidates.is_empty() {
            children.push(parent.clone());
            continue;
        }
        children.extend(
            candidates
                .iter()
                .take(params.num_candidates)
                .map(|token| parent.extend(token)),
        );
    }
    Ok(children)
}

/// Sentence-terminal punctuation or an end-of-sequence marker at the end.
fn ends_sequence(text: &str, eos_markers: &[String]) -> bool {
    let trimmed = text.trim_end();
    trimmed.ends_with(SENTENCE_TERMINALS)
        || eos_markers
            .iter()
            .any(|m| !m.is_empty() && text.ends_with(m.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::Constraint;
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    struct FixedModel(&'static str);

    impl LanguageModel for FixedModel {
        fn generate_candidate_tokens(
            &self,
            _prompt: &str,
            num_candidates: usize,
            _temperature: f64,
        ) -> Result<Vec<String>> {
            Ok(vec![self.0.to_string(); num_candidates])
        }

        fn generate_text(
            &self,
            _prompt: &str,
            max_tokens: usize,
            _temperature: f64,
            _stop: &[String],
        ) -> Result<String> {
            Ok(self.0.repeat(max_tokens))
        }
    }

    fn on_worker_thread() -> bool {
        thread::current()
            .name()
            .is_some_and(|name| name.starts_with("smc-worker"))
    }

    /// Records whether any candidate request ran on a pool thread.
    #[derive(Default)]
    struct ThreadRecorder {
        saw_worker: AtomicBool,
    }

    impl LanguageModel for ThreadRecorder {
        fn generate_candidate_tokens(
            &self,
            _prompt: &str,
            _num_candidates: usize,
            _temperature: f64,
        ) -> Result<Vec<String>> {
            if on_worker_thread() {
                self.saw_worker.store(true, Ordering::SeqCst);
            }
            Ok(vec!["t".to_string()])
        }

        fn generate_text(
            &self,
            _prompt: &str,
            _max_tokens: usize,
            _temperature: f64,
            _stop: &[String],
        ) -> Result<String> {
            Ok(String::new())
        }
    }

    /// Panics when called from a pool thread, works on the caller's thread.
    struct PanicsOnWorker;

    impl LanguageModel for PanicsOnWorker {
        fn generate_candidate_tokens(
            &self,
            _prompt: &str,
            _num_candidates: usize,
            _temperature: f64,
        ) -> Result<Vec<String>> {
            if on_worker_thread() {
                panic!("backend crashed");
            }
            Ok(vec!["s".to_string()])
        }

        fn generate_text(
            &self,
            _prompt: &str,
            _max_tokens: usize,
            _temperature: f64,
            _stop: &[String],
        ) -> Result<String> {
            Ok(String::new())
        }
    }

    #[derive(Default)]
    struct BatchingModel {
        batch_calls: AtomicUsize,
        single_calls: AtomicUsize,
    }

    impl LanguageModel for BatchingModel {
        fn generate_candidate_tokens(
            &self,
            _prompt: &str,
            _num_candidates: usize,
            _temperature: f64,
        ) -> Result<Vec<String>> {
            self.single_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["b".to_string()])
        }

        fn supports_batching(&self) -> bool {
            true
        }

        fn batch_generate_candidate_tokens(
            &self,
            prompts: &[String],
            _temperature: f64,
            top_k: usize,
        ) -> Result<Vec<Vec<String>>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![vec!["b".to_string(); top_k]; prompts.len()])
        }

        fn generate_text(
            &self,
            _prompt: &str,
            _max_tokens: usize,
            _temperature: f64,
            _stop: &[String],
        ) -> Result<String> {
            Ok(String::new())
        }
    }

    /// No candidates at all; plain generation still works.
    struct SilentModel;

    impl LanguageModel for SilentModel {
        fn generate_candidate_tokens(
            &self,
            _prompt: &str,
            _num_candidates: usize,
            _temperature: f64,
        ) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn generate_text(
            &self,
            _prompt: &str,
            _max_tokens: usize,
            _temperature: f64,
            _stop: &[String],
        ) -> Result<String> {
            Ok(" world".to_string())
        }
    }

    /// Candidate requests fail; plain generation may or may not.
    struct BrokenCandidates {
        text: Option<&'static str>,
    }

    impl LanguageModel for BrokenCandidates {
        fn generate_candidate_tokens(
            &self,
            _prompt: &str,
            _num_candidates: usize,
            _temperature: f64,
        ) -> Result<Vec<String>> {
            Err(SamplerError::Resource("GPU out of memory".into()))
        }

        fn generate_text(
            &self,
            _prompt: &str,
            _max_tokens: usize,
            _temperature: f64,
            _stop: &[String],
        ) -> Result<String> {
            self.text
                .map(str::to_string)
                .ok_or_else(|| SamplerError::Resource("backend offline".into()))
        }
    }

    struct SlowModel;

    impl LanguageModel for SlowModel {
        fn generate_candidate_tokens(
            &self,
            _prompt: &str,
            _num_candidates: usize,
            _temperature: f64,
        ) -> Result<Vec<String>> {
            thread::sleep(Duration::from_millis(5));
            Ok(vec!["w".to_string()])
        }

        fn generate_text(
            &self,
            _prompt: &str,
            _max_tokens: usize,
            _temperature: f64,
            _stop: &[String],
        ) -> Result<String> {
            Ok("w".to_string())
        }
    }

    fn config(num_particles: usize, workers: usize) -> SamplerConfig {
        let mut config = SamplerConfig {
            num_particles,
            seed: Some(42),
            early_termination_probability: 0.0,
            ..Default::default()
        };
        config.parallel.num_workers = Some(workers);
        config
    }

    fn cpu_sampler(config: SamplerConfig, potentials: Vec<Potential>) -> ParallelSampler {
        ParallelSampler::with_resources(config, potentials, 0, 4).unwrap()
    }

    fn always_one() -> Potential {
        Potential::semantic("one", Arc::new(|_: &[String]| 1.0))
    }

    fn constant(name: &str, score: f64) -> Potential {
        let c: Constraint = Arc::new(move |_: &str| score);
        Potential::constraint(name, vec![c])
    }

    #[test]
    fn test_new_validates_config() {
        let err = ParallelSampler::with_resources(config(0, 2), vec![], 0, 4)
            .err()
            .unwrap();
        assert!(matches!(err, SamplerError::Validation(_)));
    }

    #[test]
    fn test_cpu_plan() {
        let sampler = cpu_sampler(config(8, 2), vec![]);
        assert_eq!(sampler.num_workers(), 2);
        assert!(!sampler.uses_gpu());
    }

    #[test]
    fn test_gpu_mode_without_device_falls_back_to_cpu() {
        let mut cfg = config(8, 4);
        cfg.parallel.use_gpu = true;
        let sampler = ParallelSampler::with_resources(cfg, vec![], 0, 4).unwrap();
        assert!(!sampler.uses_gpu());
        assert_eq!(sampler.num_workers(), 4);
    }

    #[test]
    fn test_gpu_mode_caps_workers_per_device() {
        let mut cfg = config(8, 16);
        cfg.parallel.use_gpu = true;
        let sampler = ParallelSampler::with_resources(cfg, vec![], 1, 16).unwrap();
        assert!(sampler.uses_gpu());
        assert_eq!(sampler.num_workers(), 2);
    }

    #[test]
    fn test_small_population_extends_sequentially() {
        let mut sampler = cpu_sampler(config(3, 2), vec![]);
        sampler.initialize_particles("ab");
        let recorder = ThreadRecorder::default();
        sampler.extend_particles(&recorder).unwrap();

        assert!(!recorder.saw_worker.load(Ordering::SeqCst));
        assert_eq!(sampler.particles().len(), 3);
        assert!(sampler.particles().iter().all(|p| p.text() == "abt"));
    }

    #[test]
    fn test_parallel_extension_runs_on_workers() {
        let mut sampler = cpu_sampler(config(8, 2), vec![]);
        sampler.initialize_particles("ab");
        let recorder = ThreadRecorder::default();
        sampler.extend_particles(&recorder).unwrap();

        assert!(recorder.saw_worker.load(Ordering::SeqCst));
        assert_eq!(sampler.particles().len(), 8);
        assert_eq!(sampler.state(), SamplerState::Extended);
    }

    #[test]
    fn test_parallel_extension_downsamples_to_population_size() {
        let mut sampler = cpu_sampler(config(8, 2), vec![]);
        sampler.initialize_particles("ab");
        sampler.extend_particles(&FixedModel("c")).unwrap();

        assert_eq!(sampler.particles().len(), 8);
        assert!(sampler.particles().iter().all(|p| p.text() == "abc"));
    }

    #[test]
    fn test_downsample_favors_heavy_parents() {
        let mut sampler = cpu_sampler(config(8, 2), vec![]);
        let mut particles = Vec::new();
        for i in 0..8 {
            let (prefix, weight) = if i % 2 == 0 { ("light", 0.0) } else { ("heavy", 0.25) };
            particles.push(Particle::with_weight(vec![prefix.to_string()], weight));
        }
        sampler.set_particles(particles);
        sampler.extend_particles(&FixedModel("!")).unwrap();

        assert_eq!(sampler.particles().len(), 8);
        assert!(
            sampler
                .particles()
                .iter()
                .all(|p| p.text() == "heavy!")
        );
    }

    #[test]
    fn test_gpu_mode_uses_batched_calls() {
        let mut cfg = config(8, 2);
        cfg.parallel.use_gpu = true;
        let mut sampler = ParallelSampler::with_resources(cfg, vec![], 1, 4).unwrap();
        sampler.initialize_particles("a");
        let model = BatchingModel::default();
        sampler.extend_particles(&model).unwrap();

        assert_eq!(model.batch_calls.load(Ordering::SeqCst), 2);
        assert_eq!(model.single_calls.load(Ordering::SeqCst), 0);
        assert_eq!(sampler.particles().len(), 8);
    }

    #[test]
    fn test_cpu_mode_ignores_batching_support() {
        let mut sampler = cpu_sampler(config(8, 2), vec![]);
        sampler.initialize_particles("a");
        let model = BatchingModel::default();
        sampler.extend_particles(&model).unwrap();

        assert_eq!(model.batch_calls.load(Ordering::SeqCst), 0);
        assert_eq!(model.single_calls.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_worker_panic_falls_back_to_sequential() {
        let mut sampler = cpu_sampler(config(8, 2), vec![]);
        sampler.initialize_particles("a");
        sampler.extend_particles(&PanicsOnWorker).unwrap();

        assert_eq!(sampler.particles().len(), 8);
        assert!(sampler.particles().iter().all(|p| p.text() == "as"));
    }

    #[test]
    fn test_parallel_reweight_normalizes() {
        let potential = Potential::regex("has-z", "z").unwrap();
        let mut sampler = cpu_sampler(config(8, 2), vec![potential]);
        let particles: Vec<Particle> = (0..8)
            .map(|i| {
                let token = if i < 4 { "z" } else { "y" };
                Particle::new(vec![token.to_string()])
            })
            .collect();
        sampler.set_particles(particles);
        sampler.reweight_particles();

        let total: f64 = sampler.particles().iter().map(|p| p.weight).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
        for p in sampler.particles() {
            let expected = if p.text() == "z" { 0.25 } else { 0.0 };
            assert_relative_eq!(p.weight, expected, epsilon = 1e-12);
        }
        assert_eq!(sampler.state(), SamplerState::Reweighted);
    }

    #[test]
    fn test_parallel_reweight_applies_batch_product() {
        let mut sampler = cpu_sampler(
            config(8, 2),
            vec![constant("a", 0.5), constant("b", 0.5)],
        );
        sampler.initialize_particles("x");
        sampler.reweight_particles();

        for p in sampler.particles() {
            assert_relative_eq!(p.log_weight, 0.25);
            assert_relative_eq!(p.weight, 0.125, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_reweight_applies_expensive_potentials() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let expensive = Potential::semantic(
            "counting",
            Arc::new(move |_: &[String]| {
                seen.fetch_add(1, Ordering::SeqCst);
                1.0
            }),
        );
        let mut sampler = cpu_sampler(config(8, 2), vec![expensive, constant("c", 0.9)]);
        sampler.initialize_particles("x");
        sampler.reweight_particles();
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_round_cardinality_matches_sequential() {
        let potentials = vec![Potential::regex("any", ".").unwrap(), always_one()];
        let model = FixedModel("k");

        let mut sequential = Sampler::new(config(8, 2), potentials.clone()).unwrap();
        sequential.initialize_particles("go");
        sequential.extend_particles(&model).unwrap();
        sequential.reweight_particles();
        sequential.resample_particles();

        let mut parallel = cpu_sampler(config(8, 2), potentials);
        parallel.initialize_particles("go");
        parallel.extend_particles(&model).unwrap();
        parallel.reweight_particles();
        parallel.resample_particles();

        assert_eq!(sequential.particles().len(), 8);
        assert_eq!(parallel.particles().len(), 8);
    }

    #[test]
    fn test_sample_starts_with_prompt_and_respects_budget() {
        let mut sampler = cpu_sampler(config(8, 2), vec![always_one()]);
        let outcome =
            sampler.sample_with_outcome("Hello", &SampleOptions::new(10), Some(&FixedModel("a")));

        assert_eq!(outcome.text, format!("Hello{}", "a".repeat(10)));
        assert_eq!(outcome.tokens_generated, 10);
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.stop_reason, StopReason::MaxTokens);
        assert_eq!(sampler.state(), SamplerState::Finalized);
    }

    #[test]
    fn test_panicking_expensive_potential_falls_back_to_direct_generation() {
        let bad = Potential::semantic(
            "bad",
            Arc::new(|_: &[String]| -> f64 { panic!("scorer blew up") }),
        );
        let mut sampler = cpu_sampler(config(8, 2), vec![bad]);
        let outcome =
            sampler.sample_with_outcome("Hi", &SampleOptions::new(4), Some(&FixedModel("a")));

        assert_eq!(outcome.text, "Hiaaaa");
        assert_eq!(outcome.stop_reason, StopReason::DirectGeneration);
        assert_eq!(sampler.state(), SamplerState::Finalized);
    }

    #[test]
    fn test_huge_config_timeout_is_rejected() {
        let mut config = config(8, 2);
        config.parallel.timeout_secs = Some(1e20);
        assert!(matches!(
            ParallelSampler::with_resources(config, vec![always_one()], 0, 4),
            Err(SamplerError::Validation(_))
        ));
    }

    #[test]
    fn test_sample_stops_on_stop_string() {
        let mut sampler = cpu_sampler(config(8, 2), vec![always_one()]);
        let opts = SampleOptions::new(10).with_stop_strings(vec!["aa".to_string()]);
        let outcome = sampler.sample_with_outcome("Hi", &opts, Some(&FixedModel("a")));

        assert_eq!(outcome.text, "Hiaa");
        assert_eq!(outcome.tokens_generated, 2);
        assert_eq!(outcome.stop_reason, StopReason::StopString);
    }

    #[test]
    fn test_sample_stops_without_improvement() {
        let mut sampler = cpu_sampler(config(8, 2), vec![always_one()]);
        let outcome =
            sampler.sample_with_outcome("Hi", &SampleOptions::new(100), Some(&FixedModel("a")));

        // First round sets the best; four more stale rounds of 5 reach patience 20.
        assert_eq!(outcome.tokens_generated, 25);
        assert_eq!(outcome.stop_reason, StopReason::NoImprovement);
    }

    #[test]
    fn test_sample_without_early_stopping_uses_full_budget() {
        let mut sampler = cpu_sampler(config(8, 2), vec![always_one()]);
        let opts = SampleOptions::new(100).with_early_stopping(false);
        let outcome = sampler.sample_with_outcome("Hi", &opts, Some(&FixedModel("a")));

        assert_eq!(outcome.tokens_generated, 100);
        assert_eq!(outcome.text.len(), 102);
        assert_eq!(outcome.stop_reason, StopReason::MaxTokens);
    }

    #[test]
    fn test_sample_stops_at_sentence_end() {
        let mut sampler = cpu_sampler(config(8, 2), vec![always_one()]);
        let opts = SampleOptions::new(200)
            .with_batch_size(1)
            .with_early_stopping(false);
        let outcome = sampler.sample_with_outcome("Hi", &opts, Some(&FixedModel(".")));

        assert_eq!(outcome.stop_reason, StopReason::EndOfSequence);
        assert!(outcome.tokens_generated < 200);
        assert!(outcome.text.starts_with("Hi."));
    }

    #[test]
    fn test_sample_timeout_is_soft() {
        let mut cfg = config(8, 2);
        cfg.parallel.timeout_secs = Some(0.001);
        let mut sampler = cpu_sampler(cfg, vec![always_one()]);
        let outcome = sampler.sample_with_outcome("Hi", &SampleOptions::new(50), Some(&SlowModel));

        assert!(outcome.tokens_generated <= 1);
        assert!(outcome.text.starts_with("Hi"));
        assert!(matches!(
            outcome.stop_reason,
            StopReason::Timeout | StopReason::DirectGeneration
        ));
    }

    #[test]
    fn test_sample_without_new_tokens_generates_directly() {
        let mut sampler = cpu_sampler(config(8, 2), vec![always_one()]);
        let outcome = sampler.sample_with_outcome("Hello", &SampleOptions::new(5), Some(&SilentModel));

        assert_eq!(outcome.text, "Hello world");
        assert_eq!(outcome.stop_reason, StopReason::DirectGeneration);
    }

    #[test]
    fn test_sample_failure_falls_back_to_direct_generation() {
        let mut sampler = cpu_sampler(config(8, 2), vec![always_one()]);
        let model = BrokenCandidates { text: Some(" there") };
        let outcome = sampler.sample_with_outcome("Hello", &SampleOptions::new(5), Some(&model));

        assert_eq!(outcome.text, "Hello there");
        assert_eq!(outcome.stop_reason, StopReason::DirectGeneration);
    }

    #[test]
    fn test_total_failure_returns_prompt() {
        let mut sampler = cpu_sampler(config(8, 2), vec![always_one()]);
        let model = BrokenCandidates { text: None };
        let outcome = sampler.sample_with_outcome("Hello", &SampleOptions::new(5), Some(&model));

        assert_eq!(outcome.text, "Hello");
        assert_eq!(outcome.stop_reason, StopReason::Failed);
    }

    #[test]
    fn test_sample_without_model_returns_prompt() {
        let mut sampler = cpu_sampler(config(8, 2), vec![always_one()]);
        assert_eq!(sampler.sample("Hello", &SampleOptions::new(5), None), "Hello");
    }

    #[test]
    fn test_sample_uses_default_model() {
        let mut sampler =
            cpu_sampler(config(8, 2), vec![always_one()]).with_model(Arc::new(FixedModel("y")));
        let text = sampler.sample("a", &SampleOptions::new(3), None);
        assert_eq!(text, "ayyy");
    }

    #[test]
    fn test_update_potentials_repartitions() {
        let mut sampler = cpu_sampler(config(8, 2), vec![]);
        sampler.update_potentials(vec![constant("c", 1.0), always_one()]);
        assert_eq!(sampler.base().efficient_potentials().len(), 1);
        assert_eq!(sampler.base().expensive_potentials().len(), 1);
    }

    #[test]
    fn test_samplers_share_trait_surface() {
        let mut samplers: Vec<Box<dyn ParticleSampler>> = vec![
            Box::new(Sampler::new(config(8, 2), vec![always_one()]).unwrap()),
            Box::new(cpu_sampler(config(8, 2), vec![always_one()])),
        ];
        for sampler in &mut samplers {
            let text = sampler.sample("Hey", &SampleOptions::new(4), Some(&FixedModel("o")));
            assert_eq!(text, "Heyoooo");
            assert_eq!(sampler.particles().len(), 8);
            assert_eq!(sampler.num_particles(), 8);
        }
    }

    #[test]
    fn test_ends_sequence() {
        let markers = vec!["</s>".to_string()];
        assert!(ends_sequence("Done.", &markers));
        assert!(ends_sequence("Really?  ", &markers));
        assert!(ends_sequence("text</s>", &markers));
        assert!(!ends_sequence("open", &markers));
        assert!(!ends_sequence("open", &[String::new()]));
    }
}
