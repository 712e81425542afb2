use std::str::FromStr;

use super::Config;

/// Parse `FOLIO_*` variable `key`, warning and returning `None` when it is set but invalid.
fn parsed<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring invalid {key} value: {raw}");
            None
        }
    }
}

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_llm();
        self.apply_env_overrides_pipeline();
    }

    fn apply_env_overrides_llm(&mut self) {
        if let Ok(v) = std::env::var("FOLIO_LLM_PROVIDER") {
            if let Ok(kind) = serde_json::from_value(serde_json::Value::String(v.clone())) {
                self.llm.provider = kind;
            } else {
                tracing::warn!("ignoring invalid FOLIO_LLM_PROVIDER value: {v}");
            }
        }
        if let Ok(v) = std::env::var("FOLIO_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("FOLIO_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("FOLIO_LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = v;
        }
        if let Some(dims) = parsed::<usize>("FOLIO_LLM_EMBEDDING_DIMENSIONS") {
            self.llm.embedding_dimensions = Some(dims);
        }
        if let Ok(v) = std::env::var("FOLIO_LLM_API_KEY")
            && !v.is_empty()
        {
            self.llm.api_key = Some(v);
        }
    }

    fn apply_env_overrides_pipeline(&mut self) {
        if let Some(backend) = parsed("FOLIO_INDEX_BACKEND") {
            self.index.backend = backend;
        }
        if let Ok(v) = std::env::var("FOLIO_QDRANT_URL") {
            self.index.qdrant_url = v;
        }
        if let Ok(v) = std::env::var("FOLIO_SQLITE_PATH") {
            self.index.sqlite_path = v;
        }
        if let Some(metric) = parsed("FOLIO_INDEX_METRIC") {
            self.index.metric = metric;
        }
        if let Some(n) = parsed("FOLIO_CHUNKER_MIN_CHARS") {
            self.chunker.min_chars = n;
        }
        if let Some(n) = parsed("FOLIO_CHUNKER_MAX_CHARS") {
            self.chunker.max_chars = n;
        }
        if let Some(n) = parsed("FOLIO_CHUNKER_OVERLAP_CHARS") {
            self.chunker.overlap_chars = n;
        }
        if let Some(n) = parsed("FOLIO_EMBEDDING_BATCH_SIZE") {
            self.embedding.batch_size = n;
        }
        if let Some(n) = parsed("FOLIO_EMBEDDING_MAX_IN_FLIGHT") {
            self.embedding.max_in_flight = n;
        }
        if let Some(n) = parsed("FOLIO_EMBEDDING_MAX_ATTEMPTS") {
            self.embedding.retry.max_attempts = n;
        }
        if let Some(k) = parsed("FOLIO_RETRIEVAL_TOP_K") {
            self.retrieval.top_k = k;
        }
        if let Some(n) = parsed("FOLIO_RETRIEVAL_OVERFETCH") {
            self.retrieval.overfetch_factor = n;
        }
        if let Some(t) = parsed("FOLIO_RETRIEVAL_SCORE_THRESHOLD") {
            self.retrieval.score_threshold = t;
        }
        if let Some(mode) = parsed("FOLIO_RETRIEVAL_MODE") {
            self.retrieval.mode = mode;
        }
        if let Some(n) = parsed("FOLIO_CONTEXT_BUDGET_CHARS") {
            self.retrieval.context_budget_chars = n;
        }
        if let Some(policy) = parsed("FOLIO_GENERATION_EMPTY_CONTEXT") {
            self.generation.empty_context = policy;
        }
        if let Some(secs) = parsed("FOLIO_TIMEOUT_QUERY") {
            self.timeouts.query_seconds = secs;
        }
        if let Some(secs) = parsed("FOLIO_TIMEOUT_INGEST") {
            self.timeouts.ingest_seconds = secs;
        }
    }
}
