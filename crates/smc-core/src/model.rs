//! The language-model collaborator the sampler drives.
//!
//! Backends live outside this crate. The sampler only needs ranked next-token
//! candidates, optionally batched across particles, and plain generation as a
//! last-resort fallback.

use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;

use crate::error::Result;

pub trait LanguageModel: Send + Sync {
    /// Up to `num_candidates` next tokens for `prompt`, most likely first.
    fn generate_candidate_tokens(
        &self,
        prompt: &str,
        num_candidates: usize,
        temperature: f64,
    ) -> Result<Vec<String>>;

    /// Whether `batch_generate_candidate_tokens` is a real batched call.
    fn supports_batching(&self) -> bool {
        false
    }

    /// One candidate list per prompt, in prompt order.
    fn batch_generate_candidate_tokens(
        &self,
        prompts: &[String],
        temperature: f64,
        top_k: usize,
    ) -> Result<Vec<Vec<String>>> {
        prompts
            .iter()
            .map(|p| self.generate_candidate_tokens(p, top_k, temperature))
            .collect()
    }

    /// Free-running continuation of `prompt` (continuation only, prompt excluded).
    fn generate_text(
        &self,
        prompt: &str,
        max_tokens: usize,
        temperature: f64,
        stop: &[String],
    ) -> Result<String>;
}

/// Draw one token from a ranked candidate list.
///
/// Rank `i` gets probability proportional to `exp(-i / temperature)`, so
/// low temperatures concentrate on the head of the list. A temperature of 0
/// is greedy.
pub fn select_candidate<'a>(
    candidates: &'a [String],
    temperature: f64,
    rng: &mut impl Rng,
) -> Option<&'a String> {
    if candidates.is_empty() {
        return None;
    }
    if temperature <= 0.0 || candidates.len() == 1 {
        return candidates.first();
    }

    let weights = (0..candidates.len()).map(|i| (-(i as f64) / temperature).exp());
    match WeightedIndex::new(weights) {
        Ok(dist) => candidates.get(dist.sample(rng)),
        Err(e) => {
            tracing::debug!("candidate weights unusable at temperature {temperature}: {e}");
            candidates.first()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SamplerError;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    fn strings(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    struct Echo;

    impl LanguageModel for Echo {
        fn generate_candidate_tokens(
            &self,
            prompt: &str,
            num_candidates: usize,
            _temperature: f64,
        ) -> Result<Vec<String>> {
            if prompt.is_empty() {
                return Err(SamplerError::Resource("empty prompt".into()));
            }
            Ok((0..num_candidates).map(|i| format!("{prompt}{i}")).collect())
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

    #[test]
    fn test_default_batch_preserves_order() {
        let out = Echo
            .batch_generate_candidate_tokens(&strings(&["a", "b"]), 1.0, 2)
            .unwrap();
        assert_eq!(out, vec![strings(&["a0", "a1"]), strings(&["b0", "b1"])]);
        assert!(!Echo.supports_batching());
    }

    #[test]
    fn test_default_batch_propagates_errors() {
        let out = Echo.batch_generate_candidate_tokens(&strings(&["a", ""]), 1.0, 2);
        assert!(out.is_err());
    }

    #[test]
    fn test_select_candidate_empty() {
        let mut rng = rng();
        assert!(select_candidate(&[], 1.0, &mut rng).is_none());
    }

    #[test]
    fn test_select_candidate_greedy_at_zero_temperature() {
        let mut rng = rng();
        let c = strings(&["first", "second", "third"]);
        for _ in 0..20 {
            assert_eq!(select_candidate(&c, 0.0, &mut rng).unwrap(), "first");
        }
    }

    #[test]
    fn test_select_candidate_prefers_head_at_low_temperature() {
        let mut rng = rng();
        let c = strings(&["first", "second", "third"]);
        let head = (0..500)
            .filter(|_| select_candidate(&c, 0.3, &mut rng).unwrap() == "first")
            .count();
        assert!(head > 400, "head chosen {head}/500 times");
    }

    #[test]
    fn test_select_candidate_non_finite_temperature_is_greedy() {
        let mut rng = rng();
        let c = strings(&["first", "second"]);
        assert_eq!(select_candidate(&c, f64::NAN, &mut rng).unwrap(), "first");
    }

    #[test]
    fn test_select_candidate_spreads_at_high_temperature() {
        let mut rng = rng();
        let c = strings(&["a", "b", "c"]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(select_candidate(&c, 10.0, &mut rng).unwrap().clone());
        }
        assert_eq!(seen.len(), 3);
    }
}
