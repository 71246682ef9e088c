//! Word-level bigram model built from a plain-text corpus.
//!
//! Tokens carry their leading space (`" word"`) so particle text is plain
//! concatenation. Candidates are the most frequent successors of the last
//! word in the prompt, falling back to the most frequent corpus words.

use std::collections::{BTreeMap, HashMap};

use smc_core::{LanguageModel, Result, SamplerError};

pub struct BigramModel {
    successors: HashMap<String, Vec<String>>,
    unigrams: Vec<String>,
}

impl BigramModel {
    pub fn from_corpus(text: &str) -> Self {
        let words: Vec<&str> = text.split_whitespace().collect();

        let mut unigram_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for &word in &words {
            *unigram_counts.entry(word).or_default() += 1;
        }

        let mut pair_counts: HashMap<String, BTreeMap<&str, usize>> = HashMap::new();
        for pair in words.windows(2) {
            *pair_counts
                .entry(key(pair[0]))
                .or_default()
                .entry(pair[1])
                .or_default() += 1;
        }

        let successors = pair_counts
            .into_iter()
            .map(|(word, counts)| (word, ranked(counts)))
            .collect();

        Self {
            successors,
            unigrams: ranked(unigram_counts),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.unigrams.is_empty()
    }

    pub fn vocabulary_size(&self) -> usize {
        self.unigrams.len()
    }

    fn ranked_after(&self, last: Option<&str>) -> &[String] {
        last.and_then(|w| self.successors.get(&key(w)))
            .filter(|next| !next.is_empty())
            .map_or(&self.unigrams, |next| next)
    }
}

/// Successor lookups ignore case.
fn key(word: &str) -> String {
    word.to_lowercase()
}

/// Most frequent first; ties in lexical order (the map is already sorted).
fn ranked(counts: BTreeMap<&str, usize>) -> Vec<String> {
    let mut entries: Vec<(&str, usize)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    entries.into_iter().map(|(w, _)| w.to_string()).collect()
}

impl LanguageModel for BigramModel {
    fn generate_candidate_tokens(
        &self,
        prompt: &str,
        num_candidates: usize,
        _temperature: f64,
    ) -> Result<Vec<String>> {
        if self.is_empty() {
            return Err(SamplerError::Resource("corpus has no words".to_string()));
        }
        let last = prompt.split_whitespace().last();
        Ok(self
            .ranked_after(last)
            .iter()
            .take(num_candidates)
            .map(|w| format!(" {w}"))
            .collect())
    }

    /// Greedy chain of top successors. Output stops before the first stop
    /// string.
    fn generate_text(
        &self,
        prompt: &str,
        max_tokens: usize,
        _temperature: f64,
        stop: &[String],
    ) -> Result<String> {
        if self.is_empty() {
            return Err(SamplerError::Resource("corpus has no words".to_string()));
        }

        let mut text = String::new();
        let mut last = prompt.split_whitespace().last().map(str::to_string);
        for _ in 0..max_tokens {
            let Some(next) = self.ranked_after(last.as_deref()).first() else {
                break;
            };
            text.push(' ');
            text.push_str(next);

            let cut = stop
                .iter()
                .filter(|s| !s.is_empty())
                .filter_map(|s| text.find(s.as_str()))
                .min();
            if let Some(pos) = cut {
                text.truncate(pos);
                break;
            }
            last = Some(next.clone());
        }
        Ok(text)
    }
}
