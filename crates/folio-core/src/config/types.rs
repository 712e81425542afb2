use std::time::Duration;

use folio_index::Metric;
use folio_index::document::ChunkerConfig;
use folio_llm::EmbedderConfig;
use serde::{Deserialize, Serialize};

use crate::gateway::GenerationConfig;
use crate::region::LayoutFeatureExtractor;
use crate::retriever::RetrievalConfig;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbedderConfig,
    #[serde(default)]
    pub chunker: ChunkerConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub layout: LayoutFeatureExtractor,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// LLM provider backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Ollama,
    OpenAi,
    /// Deterministic offline provider; requires the `mock` feature.
    Mock,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
            Self::Mock => "mock",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_base_url() -> String {
    "http://localhost:11434".into()
}

fn default_model() -> String {
    "mistral:7b".into()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".into()
}

fn default_max_tokens() -> u32 {
    1024
}

#[derive(Clone, PartialEq, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Declared embedding dimensionality; measured on first use when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dimensions: Option<usize>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Only read from `FOLIO_LLM_API_KEY`.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("embedding_model", &self.embedding_model)
            .field("embedding_dimensions", &self.embedding_dimensions)
            .field("max_tokens", &self.max_tokens)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            base_url: default_base_url(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: None,
            max_tokens: default_max_tokens(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    /// Process-local store; vectors are lost on exit.
    #[default]
    Memory,
    Qdrant,
}

impl std::str::FromStr for IndexBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "qdrant" => Ok(Self::Qdrant),
            other => Err(format!("unknown index backend: {other}")),
        }
    }
}

fn default_qdrant_url() -> String {
    "http://localhost:6334".into()
}

/// SQLite's name for a catalog that lives and dies with the connection.
pub const IN_MEMORY_CATALOG: &str = ":memory:";

fn default_sqlite_path() -> String {
    IN_MEMORY_CATALOG.into()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub backend: IndexBackend,
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default)]
    pub metric: Metric,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackend::default(),
            qdrant_url: default_qdrant_url(),
            sqlite_path: default_sqlite_path(),
            metric: Metric::default(),
        }
    }
}

impl IndexConfig {
    /// The catalog must live exactly as long as the vectors it describes.
    ///
    /// # Errors
    ///
    /// Returns a description of the mismatch when the memory backend is paired with a
    /// catalog file, or Qdrant with an in-memory catalog.
    pub fn validate(&self) -> Result<(), String> {
        let in_memory = self.sqlite_path == IN_MEMORY_CATALOG;
        match self.backend {
            IndexBackend::Memory if !in_memory => Err(format!(
                "the memory backend loses its vectors on exit; \
                 sqlite_path must be {IN_MEMORY_CATALOG:?}, got {:?}",
                self.sqlite_path
            )),
            IndexBackend::Qdrant if in_memory => Err(
                "the qdrant backend keeps its vectors; sqlite_path must name a catalog file".into(),
            ),
            _ => Ok(()),
        }
    }
}

fn default_query_timeout() -> u64 {
    120
}

fn default_ingest_timeout() -> u64 {
    900
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_query_timeout")]
    pub query_seconds: u64,
    #[serde(default = "default_ingest_timeout")]
    pub ingest_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            query_seconds: default_query_timeout(),
            ingest_seconds: default_ingest_timeout(),
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn query(&self) -> Duration {
        Duration::from_secs(self.query_seconds)
    }

    #[must_use]
    pub fn ingest(&self) -> Duration {
        Duration::from_secs(self.ingest_seconds)
    }
}
