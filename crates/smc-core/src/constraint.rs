//! Scalar text constraints for `Potential::Constraint`.
//!
//! Each builder returns a closure scoring text in [0,1]. Violations bottom
//! out at `PENALTY_FLOOR`, never at zero.

use std::sync::Arc;

use crate::constants::PENALTY_FLOOR;
use crate::error::{Result, SamplerError};

pub type Constraint = Arc<dyn Fn(&str) -> f64 + Send + Sync>;

/// Word-count bounds. Inside `[min, max]` scores 1.0; outside, the score
/// shrinks proportionally to the distance, floored at `PENALTY_FLOOR`.
/// Fails with `Validation` when `min > max`.
pub fn length_bounds(min: usize, max: usize) -> Result<Constraint> {
    if min > max {
        return Err(SamplerError::Validation(format!(
            "length bounds inverted: min {min} > max {max}"
        )));
    }
    Ok(Arc::new(move |text: &str| {
        let len = text.split_whitespace().count();
        if len < min {
            (len as f64 / min as f64).max(PENALTY_FLOOR)
        } else if len > max {
            (max as f64 / len as f64).max(PENALTY_FLOOR)
        } else {
            1.0
        }
    }))
}

/// Case-insensitive coverage of `elements`. Reaching `threshold` present
/// elements scores 1.0; below that the score rises linearly from
/// `PENALTY_FLOOR`. `threshold` defaults to every element being required.
pub fn required_elements(elements: Vec<String>, threshold: Option<usize>) -> Constraint {
    let elements: Vec<String> = elements.into_iter().map(|e| e.to_lowercase()).collect();
    let threshold = threshold.unwrap_or(elements.len());
    Arc::new(move |text: &str| {
        let lower = text.to_lowercase();
        let present = elements.iter().filter(|e| lower.contains(e.as_str())).count();
        coverage_score(present, threshold)
    })
}

/// `PENALTY_FLOOR` if any forbidden string appears (case-insensitive), else 1.0.
pub fn forbidden_content(forbidden: Vec<String>) -> Constraint {
    let forbidden: Vec<String> = forbidden.into_iter().map(|f| f.to_lowercase()).collect();
    Arc::new(move |text: &str| {
        let lower = text.to_lowercase();
        if forbidden.iter().any(|f| lower.contains(f.as_str())) {
            PENALTY_FLOOR
        } else {
            1.0
        }
    })
}

/// Shared coverage curve: 1.0 at/above `required`, `PENALTY_FLOOR` at zero,
/// linear in between.
pub(crate) fn coverage_score(present: usize, required: usize) -> f64 {
    if required == 0 || present >= required {
        return 1.0;
    }
    PENALTY_FLOOR + (1.0 - PENALTY_FLOOR) * (present as f64 / required as f64)
}
