//! Weight bookkeeping shared by both samplers: normalization, effective
//! sample size, multinomial resampling, and weighted down-sampling.

use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;

use crate::particle::Particle;

/// Scale weights to sum to 1. Returns false (and leaves weights alone) when
/// the population is empty or the total is not positive.
pub fn normalize_weights(particles: &mut [Particle]) -> bool {
    let total: f64 = particles.iter().map(|p| p.weight).sum();
    if particles.is_empty() || total <= 0.0 || !total.is_finite() {
        return false;
    }
    for p in particles.iter_mut() {
        p.weight /= total;
    }
    true
}

/// `1 / Σ wᵢ²`. Zero when every weight is zero, so a dead population always
/// counts as degenerate.
pub fn effective_sample_size(particles: &[Particle]) -> f64 {
    let sum_sq: f64 = particles.iter().map(|p| p.weight * p.weight).sum();
    if sum_sq > 0.0 { 1.0 / sum_sq } else { 0.0 }
}

/// Draw `n` indices with replacement, proportional to `weights`. Degenerate
/// weights (all zero, negative, non-finite) fall back to uniform draws.
pub fn multinomial_indices(weights: &[f64], n: usize, rng: &mut impl Rng) -> Vec<usize> {
    if weights.is_empty() {
        return Vec::new();
    }
    match WeightedIndex::new(weights) {
        Ok(dist) => (0..n).map(|_| dist.sample(&mut *rng)).collect(),
        Err(e) => {
            tracing::debug!("multinomial resampling fell back to uniform: {e}");
            (0..n).map(|_| rng.random_range(0..weights.len())).collect()
        }
    }
}

/// Pick `k` distinct indices, each draw proportional to its weight
/// (Efraimidis–Spirakis keys). Zero-weight items are taken only when fewer
/// than `k` items carry weight, and then uniformly among themselves.
/// Returned indices are ascending so callers keep population order.
pub fn weighted_sample_without_replacement(
    weights: &[f64],
    k: usize,
    rng: &mut impl Rng,
) -> Vec<usize> {
    if k >= weights.len() {
        return (0..weights.len()).collect();
    }

    // (key, tie-break, index); the tie-break orders the NEG_INFINITY keys.
    let mut keyed: Vec<(f64, f64, usize)> = weights
        .iter()
        .enumerate()
        .map(|(i, &w)| {
            let u: f64 = rng.random();
            let key = if w > 0.0 && w.is_finite() {
                (1.0 - u).ln() / w
            } else {
                f64::NEG_INFINITY
            };
            (key, u, i)
        })
        .collect();

    keyed.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.total_cmp(&a.1)));
    let mut picked: Vec<usize> = keyed.into_iter().take(k).map(|(_, _, i)| i).collect();
    picked.sort_unstable();
    picked
}

/// Index of the highest-weight particle. Earlier particles win ties.
pub fn argmax_weight(particles: &[Particle]) -> Option<usize> {
    particles
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, p)| match best {
            Some((_, w)) if w >= p.weight => best,
            _ => Some((i, p.weight)),
        })
        .map(|(i, _)| i)
}
