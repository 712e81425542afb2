//! Query-time retrieval: embed, over-fetch, threshold, dedup, rerank, top-k, assemble.

use std::sync::Arc;

use folio_index::{SearchFilters, SearchResult, VectorIndex, assign_ranks, sort_results};
use folio_llm::{Embedder, Embedding, LlmProvider};
use serde::{Deserialize, Serialize};

use crate::context::{Context, ContextAssembler};
use crate::error::EngineError;
use crate::rerank::{LexicalOverlapReranker, Reranker};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    #[default]
    Standard,
    /// Adds the reranking stage.
    Enhanced,
}

impl std::str::FromStr for RetrievalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "enhanced" => Ok(Self::Enhanced),
            other => Err(format!("unknown retrieval mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Search fetches `k * overfetch_factor` candidates before dedup and rerank.
    pub overfetch_factor: usize,
    /// Results scoring below this are dropped.
    pub score_threshold: f32,
    pub context_budget_chars: usize,
    pub mode: RetrievalMode,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            overfetch_factor: 2,
            score_threshold: 0.0,
            context_budget_chars: 6000,
            mode: RetrievalMode::Standard,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RetrievalQuery {
    Text(String),
    /// Already embedded; no reranking is possible without text.
    Vector(Embedding),
}

#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub query: RetrievalQuery,
    pub k: usize,
    pub mode: RetrievalMode,
    pub filters: SearchFilters,
}

impl RetrievalRequest {
    #[must_use]
    pub fn text(query: impl Into<String>, k: usize) -> Self {
        Self {
            query: RetrievalQuery::Text(query.into()),
            k,
            mode: RetrievalMode::Standard,
            filters: SearchFilters::default(),
        }
    }

    #[must_use]
    pub fn vector(embedding: Embedding, k: usize) -> Self {
        Self {
            query: RetrievalQuery::Vector(embedding),
            k,
            mode: RetrievalMode::Standard,
            filters: SearchFilters::default(),
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: RetrievalMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Retrieved {
    /// Ranked top-k results.
    pub results: Vec<SearchResult>,
    pub context: Context,
}

impl Retrieved {
    /// Whether any result made it into the context.
    #[must_use]
    pub fn is_grounded(&self) -> bool {
        !self.context.is_empty()
    }
}

pub struct Retriever<P: LlmProvider> {
    embedder: Arc<Embedder<P>>,
    index: Arc<VectorIndex>,
    reranker: Arc<dyn Reranker>,
    config: RetrievalConfig,
}

impl<P: LlmProvider> std::fmt::Debug for Retriever<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("reranker", &self.reranker.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P: LlmProvider> Retriever<P> {
    #[must_use]
    pub fn new(
        embedder: Arc<Embedder<P>>,
        index: Arc<VectorIndex>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            reranker: Arc::new(LexicalOverlapReranker::default()),
            config,
        }
    }

    #[must_use]
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = reranker;
        self
    }

    #[must_use]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Run the full read path for one request.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MalformedInput`] for an empty text query,
    /// [`EngineError::EmbeddingUnavailable`] if the query cannot be embedded, and index errors
    /// from the search.
    pub async fn retrieve(&self, request: RetrievalRequest) -> Result<Retrieved, EngineError> {
        let RetrievalRequest {
            query,
            k,
            mode,
            filters,
        } = request;
        if k == 0 {
            return Ok(Retrieved::default());
        }

        let (embedding, text) = match query {
            RetrievalQuery::Text(text) => {
                if text.trim().is_empty() {
                    return Err(EngineError::MalformedInput("query text is empty".into()));
                }
                (self.embedder.embed_one(&text).await?, Some(text))
            }
            RetrievalQuery::Vector(embedding) => (embedding, None),
        };

        let fetch = k.saturating_mul(self.config.overfetch_factor.max(1));
        let candidates = self.index.search(&embedding, fetch, &filters).await?;
        let fetched = candidates.len();
        let results = self.rank(text.as_deref(), candidates, k, mode);
        let context =
            ContextAssembler::new(self.config.context_budget_chars).assemble(results.clone());

        tracing::debug!(
            model = %embedding.model,
            k,
            fetched,
            returned = results.len(),
            context_entries = context.len(),
            ?mode,
            "retrieved"
        );
        Ok(Retrieved { results, context })
    }

    /// Threshold, dedup, optional rerank, sort, truncate and rank candidates.
    #[must_use]
    pub fn rank(
        &self,
        query_text: Option<&str>,
        mut candidates: Vec<SearchResult>,
        k: usize,
        mode: RetrievalMode,
    ) -> Vec<SearchResult> {
        candidates.retain(|r| r.score >= self.config.score_threshold);
        let mut results = dedup_overlapping(candidates);
        if mode == RetrievalMode::Enhanced
            && let Some(text) = query_text
        {
            results = self.reranker.rerank(text, results);
        }
        sort_results(&mut results);
        results.truncate(k);
        assign_ranks(&mut results);
        results
    }
}

/// Keep the best-scoring result among those whose spans overlap within one document version.
#[must_use]
pub fn dedup_overlapping(mut results: Vec<SearchResult>) -> Vec<SearchResult> {
    sort_results(&mut results);
    let mut kept: Vec<SearchResult> = Vec::with_capacity(results.len());
    for r in results {
        let duplicate = kept.iter().any(|k| {
            k.chunk.document_id == r.chunk.document_id
                && k.chunk.version == r.chunk.version
                && (k.chunk.id == r.chunk.id || k.chunk.span.overlaps(&r.chunk.span))
        });
        if !duplicate {
            kept.push(r);
        }
    }
    kept
}
