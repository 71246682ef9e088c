use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One candidate continuation of the prompt.
///
/// `extend` derives a new particle and leaves the receiver untouched, so one
/// parent can spawn several children in a single round. `update_weight` is
/// the only in-place mutator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub sequence: Vec<String>,
    pub weight: f64,
    pub log_weight: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Particle {
    pub fn new(sequence: Vec<String>) -> Self {
        Self {
            sequence,
            weight: 1.0,
            log_weight: 0.0,
            metadata: Map::new(),
        }
    }

    pub fn with_weight(sequence: Vec<String>, weight: f64) -> Self {
        Self {
            weight,
            ..Self::new(sequence)
        }
    }

    /// New particle with `token` appended. Weights are copied by value and
    /// metadata is cloned, never shared.
    pub fn extend(&self, token: &str) -> Particle {
        let mut sequence = Vec::with_capacity(self.sequence.len() + 1);
        sequence.extend(self.sequence.iter().cloned());
        sequence.push(token.to_string());
        Particle {
            sequence,
            weight: self.weight,
            log_weight: self.log_weight,
            metadata: self.metadata.clone(),
        }
    }

    /// Multiply the weight by `factor` and add the raw factor (not its
    /// logarithm) to the log-weight accumulator.
    pub fn update_weight(&mut self, factor: f64) {
        self.weight *= factor;
        self.log_weight += factor;
    }

    /// Tokens concatenated with no separator.
    pub fn text(&self) -> String {
        self.sequence.concat()
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }
}

/// Character-level tokenization of a prompt.
pub fn tokenize_chars(text: &str) -> Vec<String> {
    text.chars().map(|c| c.to_string()).collect()
}
