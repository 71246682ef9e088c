/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-12;

/// Lowest score a soft text constraint hands out. Keeps a violating particle
/// alive with a heavy penalty instead of zeroing its weight.
pub const PENALTY_FLOOR: f64 = 0.1;

/// Candidate tokens requested per particle when none is configured.
pub const DEFAULT_NUM_CANDIDATES: usize = 5;

/// Parallel extension/reweighting falls back to the sequential path below
/// this many particles per worker.
pub const MIN_PARTICLES_PER_WORKER: usize = 2;

/// Floor on the no-improvement token budget before early stopping.
pub const MIN_PATIENCE_TOKENS: usize = 20;

/// Probability of honoring a sentence-terminal stop opportunity.
pub const EOS_STOP_PROBABILITY: f64 = 0.5;

/// Worker slots granted per GPU device.
pub const WORKERS_PER_GPU: usize = 2;

/// Characters that end a sentence.
pub const SENTENCE_TERMINALS: [char; 3] = ['.', '!', '?'];
