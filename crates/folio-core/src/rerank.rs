//! Pluggable second-stage ranking applied in enhanced retrieval mode.

use std::collections::HashSet;

use folio_index::SearchResult;

/// Rescores retrieved results for a text query. Implementations may change scores but must
/// return the same results; the retriever re-sorts afterwards.
pub trait Reranker: Send + Sync {
    fn rerank(&self, query: &str, results: Vec<SearchResult>) -> Vec<SearchResult>;

    fn name(&self) -> &str;
}

/// Leaves scores untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReranker;

impl Reranker for NoopReranker {
    fn rerank(&self, _query: &str, results: Vec<SearchResult>) -> Vec<SearchResult> {
        results
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Blends the vector score with the fraction of query terms present in the chunk text.
///
/// `score' = (1 - weight) * score + weight * coverage`
#[derive(Debug, Clone, Copy)]
pub struct LexicalOverlapReranker {
    weight: f32,
}

impl Default for LexicalOverlapReranker {
    fn default() -> Self {
        Self { weight: 0.3 }
    }
}

impl LexicalOverlapReranker {
    /// `weight` is clamped to `[0, 1]`.
    #[must_use]
    pub fn new(weight: f32) -> Self {
        let weight = if weight.is_finite() {
            weight.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self { weight }
    }

    #[must_use]
    pub fn weight(&self) -> f32 {
        self.weight
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(str::to_lowercase)
        .collect()
}

/// Fraction of distinct query terms that occur in `text`.
#[must_use]
pub fn term_coverage(query: &str, text: &str) -> f32 {
    let wanted = terms(query);
    if wanted.is_empty() {
        return 0.0;
    }
    let present = terms(text);
    let hits = wanted.iter().filter(|t| present.contains(*t)).count();
    #[allow(clippy::cast_precision_loss)]
    let coverage = hits as f32 / wanted.len() as f32;
    coverage
}

impl Reranker for LexicalOverlapReranker {
    fn rerank(&self, query: &str, mut results: Vec<SearchResult>) -> Vec<SearchResult> {
        for r in &mut results {
            let coverage = term_coverage(query, &r.chunk.text);
            r.score = (1.0 - self.weight) * r.score + self.weight * coverage;
        }
        results
    }

    fn name(&self) -> &'static str {
        "lexical_overlap"
    }
}
