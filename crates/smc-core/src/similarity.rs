use crate::constants::EPSILON;

/// Cosine similarity of two vectors. Zero when either is (near) zero-length
/// or the dimensions disagree.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a < EPSILON || norm_b < EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// 1.0 at or above `threshold`, otherwise `similarity / threshold` floored at 0.
pub fn threshold_scale(similarity: f64, threshold: f64) -> f64 {
    if !similarity.is_finite() {
        return 0.0;
    }
    if threshold <= 0.0 || similarity >= threshold {
        return 1.0;
    }
    (similarity / threshold).max(0.0)
}
