//! Potentials: pluggable soft constraints scoring a particle's sequence.
//!
//! Every variant returns a score in [0,1] where 0 rejects and 1 fully
//! satisfies. The set is closed; `is_efficient` is an exhaustive match and
//! decides whether the sampler applies a potential in the parallel batch
//! phase or the sequential expensive phase.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::constraint::{Constraint, coverage_score};
use crate::error::{Result, SamplerError};
use crate::similarity::{cosine_similarity, threshold_scale};

/// Scores a raw token sequence.
pub type SequenceScorer = Arc<dyn Fn(&[String]) -> f64 + Send + Sync>;

/// Embeds text into a vector. Errors degrade the owning potential to 1.0.
pub type Embedder = Arc<dyn Fn(&str) -> Result<Vec<f64>> + Send + Sync>;

/// Similarity between `(text, context)`. Errors degrade to 1.0.
pub type Retriever = Arc<dyn Fn(&str, &str) -> Result<f64> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PotentialKind {
    Grammar,
    Regex,
    Semantic,
    Coherence,
    Factual,
    Style,
    Constraint,
    ContextAware,
}

impl PotentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grammar => "grammar",
            Self::Regex => "regex",
            Self::Semantic => "semantic",
            Self::Coherence => "coherence",
            Self::Factual => "factual",
            Self::Style => "style",
            Self::Constraint => "constraint",
            Self::ContextAware => "context_aware",
        }
    }
}

#[derive(Clone)]
pub enum Potential {
    /// Grammar conformance. Without a checker every sequence conforms.
    Grammar {
        name: String,
        grammar: String,
        checker: Option<SequenceScorer>,
    },
    /// 1.0 if the joined text matches anywhere, else 0.0.
    Regex { name: String, pattern: Regex },
    /// Delegates to a caller-supplied scorer.
    Semantic { name: String, scorer: SequenceScorer },
    /// Embedding similarity against a reference vector.
    Coherence {
        name: String,
        embedder: Embedder,
        reference: Vec<f64>,
        threshold: f64,
    },
    /// Case-insensitive coverage of fact strings.
    Factual {
        name: String,
        facts: Vec<String>,
        required: usize,
    },
    /// Weighted regex style markers, normalized by total weight.
    Style {
        name: String,
        patterns: Vec<(Regex, f64)>,
    },
    /// Minimum across constraint scores.
    Constraint {
        name: String,
        constraints: Vec<Constraint>,
    },
    /// Relevance to a context string via a retriever.
    ContextAware {
        name: String,
        context: String,
        retriever: Retriever,
        threshold: f64,
    },
}

impl Potential {
    pub fn grammar(name: &str, grammar: &str) -> Self {
        Self::Grammar {
            name: name.to_string(),
            grammar: grammar.to_string(),
            checker: None,
        }
    }

    pub fn grammar_with_checker(name: &str, grammar: &str, checker: SequenceScorer) -> Self {
        Self::Grammar {
            name: name.to_string(),
            grammar: grammar.to_string(),
            checker: Some(checker),
        }
    }

    pub fn regex(name: &str, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| SamplerError::Validation(format!("invalid regex for '{name}': {e}")))?;
        Ok(Self::Regex {
            name: name.to_string(),
            pattern,
        })
    }

    pub fn semantic(name: &str, scorer: SequenceScorer) -> Self {
        Self::Semantic {
            name: name.to_string(),
            scorer,
        }
    }

    /// Coherence against `reference_text`, embedded once up front.
    pub fn coherence(
        name: &str,
        embedder: Embedder,
        reference_text: &str,
        threshold: f64,
    ) -> Result<Self> {
        let reference = embedder(reference_text)?;
        Self::coherence_with_embedding(name, embedder, reference, threshold)
    }

    pub fn coherence_with_embedding(
        name: &str,
        embedder: Embedder,
        reference: Vec<f64>,
        threshold: f64,
    ) -> Result<Self> {
        validate_threshold(name, threshold)?;
        if reference.is_empty() {
            return Err(SamplerError::Validation(format!(
                "reference embedding for '{name}' is empty"
            )));
        }
        Ok(Self::Coherence {
            name: name.to_string(),
            embedder,
            reference,
            threshold,
        })
    }

    /// `required` defaults to every fact.
    pub fn factual(name: &str, facts: Vec<String>, required: Option<usize>) -> Self {
        let required = required.unwrap_or(facts.len());
        Self::Factual {
            name: name.to_string(),
            facts,
            required,
        }
    }

    pub fn style(name: &str, patterns: &[(&str, f64)]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for (pattern, weight) in patterns {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(SamplerError::Validation(format!(
                    "style weight for '{pattern}' must be finite and >= 0, got {weight}"
                )));
            }
            let re = Regex::new(pattern).map_err(|e| {
                SamplerError::Validation(format!("invalid style pattern for '{name}': {e}"))
            })?;
            compiled.push((re, *weight));
        }
        Ok(Self::Style {
            name: name.to_string(),
            patterns: compiled,
        })
    }

    pub fn constraint(name: &str, constraints: Vec<Constraint>) -> Self {
        Self::Constraint {
            name: name.to_string(),
            constraints,
        }
    }

    pub fn context_aware(
        name: &str,
        context: &str,
        retriever: Retriever,
        threshold: f64,
    ) -> Result<Self> {
        validate_threshold(name, threshold)?;
        Ok(Self::ContextAware {
            name: name.to_string(),
            context: context.to_string(),
            retriever,
            threshold,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Grammar { name, .. }
            | Self::Regex { name, .. }
            | Self::Semantic { name, .. }
            | Self::Coherence { name, .. }
            | Self::Factual { name, .. }
            | Self::Style { name, .. }
            | Self::Constraint { name, .. }
            | Self::ContextAware { name, .. } => name,
        }
    }

    pub fn kind(&self) -> PotentialKind {
        match self {
            Self::Grammar { .. } => PotentialKind::Grammar,
            Self::Regex { .. } => PotentialKind::Regex,
            Self::Semantic { .. } => PotentialKind::Semantic,
            Self::Coherence { .. } => PotentialKind::Coherence,
            Self::Factual { .. } => PotentialKind::Factual,
            Self::Style { .. } => PotentialKind::Style,
            Self::Constraint { .. } => PotentialKind::Constraint,
            Self::ContextAware { .. } => PotentialKind::ContextAware,
        }
    }

    /// Cheap enough to run on every particle every round.
    pub fn is_efficient(&self) -> bool {
        match self.kind() {
            PotentialKind::Grammar
            | PotentialKind::Regex
            | PotentialKind::Factual
            | PotentialKind::Style
            | PotentialKind::Constraint => true,
            PotentialKind::Semantic | PotentialKind::Coherence | PotentialKind::ContextAware => {
                false
            }
        }
    }

    /// Score `sequence` in [0,1]. Non-finite raw scores count as 0.0.
    pub fn evaluate(&self, sequence: &[String]) -> f64 {
        clamp_score(self.raw_score(sequence))
    }

    fn raw_score(&self, sequence: &[String]) -> f64 {
        match self {
            Self::Grammar { checker, .. } => match checker {
                Some(check) => check(sequence),
                None => 1.0,
            },
            Self::Regex { pattern, .. } => {
                if pattern.is_match(&sequence.concat()) {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Semantic { scorer, .. } => scorer(sequence),
            Self::Coherence {
                name,
                embedder,
                reference,
                threshold,
            } => match embedder(&sequence.concat()) {
                Ok(embedding) => {
                    threshold_scale(cosine_similarity(&embedding, reference), *threshold)
                }
                Err(e) => {
                    tracing::warn!("coherence potential '{name}' failed open: {e}");
                    1.0
                }
            },
            Self::Factual { facts, required, .. } => {
                let text = sequence.concat().to_lowercase();
                let present = facts
                    .iter()
                    .filter(|f| text.contains(&f.to_lowercase()))
                    .count();
                coverage_score(present, *required)
            }
            Self::Style { patterns, .. } => {
                let total: f64 = patterns.iter().map(|(_, w)| w).sum();
                if total <= 0.0 {
                    return 1.0;
                }
                let text = sequence.concat();
                let matched: f64 = patterns
                    .iter()
                    .filter(|(re, _)| re.is_match(&text))
                    .map(|(_, w)| w)
                    .sum();
                matched / total
            }
            Self::Constraint { constraints, .. } => {
                if constraints.is_empty() {
                    return 1.0;
                }
                let text = sequence.concat();
                constraints
                    .iter()
                    .map(|c| clamp_score(c(&text)))
                    .fold(f64::INFINITY, f64::min)
            }
            Self::ContextAware {
                name,
                context,
                retriever,
                threshold,
            } => match retriever(&sequence.concat(), context) {
                Ok(similarity) => threshold_scale(similarity, *threshold),
                Err(e) => {
                    tracing::warn!("context potential '{name}' failed open: {e}");
                    1.0
                }
            },
        }
    }
}

impl fmt::Debug for Potential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Potential")
            .field("kind", &self.kind().as_str())
            .field("name", &self.name())
            .field("efficient", &self.is_efficient())
            .finish()
    }
}

/// Split potentials into (efficient, expensive), preserving order.
pub fn partition(potentials: &[Potential]) -> (Vec<Potential>, Vec<Potential>) {
    potentials.iter().cloned().partition(|p| p.is_efficient())
}

/// Clamp to [0,1], mapping NaN/Inf to 0.0.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn validate_threshold(name: &str, threshold: f64) -> Result<()> {
    if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
        return Err(SamplerError::Validation(format!(
            "threshold for '{name}' must be in [0, 1], got {threshold}"
        )));
    }
    Ok(())
}
