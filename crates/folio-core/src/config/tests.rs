use std::io::Write;

use serial_test::serial;

use super::*;
use crate::gateway::EmptyContextPolicy;
use crate::retriever::RetrievalMode;
use folio_index::Metric;

const ENV_KEYS: [&str; 25] = [
    "FOLIO_CONFIG",
    "FOLIO_LLM_PROVIDER",
    "FOLIO_LLM_BASE_URL",
    "FOLIO_LLM_MODEL",
    "FOLIO_LLM_EMBEDDING_MODEL",
    "FOLIO_LLM_EMBEDDING_DIMENSIONS",
    "FOLIO_LLM_API_KEY",
    "FOLIO_INDEX_BACKEND",
    "FOLIO_QDRANT_URL",
    "FOLIO_SQLITE_PATH",
    "FOLIO_INDEX_METRIC",
    "FOLIO_CHUNKER_MIN_CHARS",
    "FOLIO_CHUNKER_MAX_CHARS",
    "FOLIO_CHUNKER_OVERLAP_CHARS",
    "FOLIO_EMBEDDING_BATCH_SIZE",
    "FOLIO_EMBEDDING_MAX_IN_FLIGHT",
    "FOLIO_EMBEDDING_MAX_ATTEMPTS",
    "FOLIO_RETRIEVAL_TOP_K",
    "FOLIO_RETRIEVAL_OVERFETCH",
    "FOLIO_RETRIEVAL_SCORE_THRESHOLD",
    "FOLIO_RETRIEVAL_MODE",
    "FOLIO_CONTEXT_BUDGET_CHARS",
    "FOLIO_GENERATION_EMPTY_CONTEXT",
    "FOLIO_TIMEOUT_QUERY",
    "FOLIO_TIMEOUT_INGEST",
];

fn clear_env() {
    for key in ENV_KEYS {
        unsafe { std::env::remove_var(key) };
    }
}

#[test]
fn defaults_when_file_missing() {
    let config = Config::default();
    assert_eq!(config.llm.provider, ProviderKind::Ollama);
    assert_eq!(config.llm.base_url, "http://localhost:11434");
    assert_eq!(config.llm.embedding_model, "nomic-embed-text");
    assert_eq!(config.index.backend, IndexBackend::Memory);
    assert_eq!(config.index.sqlite_path, IN_MEMORY_CATALOG);
    assert_eq!(config.index.metric, Metric::Cosine);
    assert_eq!(config.chunker.max_chars, 1000);
    assert_eq!(config.chunker.overlap_chars, 100);
    assert_eq!(config.retrieval.top_k, 5);
    assert_eq!(config.retrieval.overfetch_factor, 2);
    assert!(config.retrieval.score_threshold.abs() < f32::EPSILON);
    assert_eq!(config.generation.empty_context, EmptyContextPolicy::Decline);
    assert_eq!(config.embedding.batch_size, 32);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn load_missing_file_uses_defaults() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
#[serial]
fn parse_valid_toml() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    write!(
        f,
        r#"
[llm]
provider = "openai"
base_url = "https://api.example.com/v1"
model = "gpt-4o-mini"
embedding_model = "text-embedding-3-small"
embedding_dimensions = 1536

[chunker]
max_chars = 800
overlap_chars = 80

[index]
backend = "qdrant"
sqlite_path = "/var/lib/folio/catalog.db"
metric = "inner_product"

[retrieval]
top_k = 8
mode = "enhanced"

[embedding.retry]
max_attempts = 6
base_delay = 250

[generation]
empty_context = "hedge"
"#
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.llm.provider, ProviderKind::OpenAi);
    assert_eq!(config.llm.embedding_dimensions, Some(1536));
    assert_eq!(config.chunker.max_chars, 800);
    assert_eq!(config.chunker.min_chars, 200);
    assert_eq!(config.index.backend, IndexBackend::Qdrant);
    assert_eq!(config.index.metric, Metric::InnerProduct);
    assert_eq!(config.index.qdrant_url, "http://localhost:6334");
    assert_eq!(config.retrieval.top_k, 8);
    assert_eq!(config.retrieval.mode, RetrievalMode::Enhanced);
    assert_eq!(config.embedding.retry.max_attempts, 6);
    assert_eq!(
        config.embedding.retry.base_delay,
        std::time::Duration::from_millis(250)
    );
    assert_eq!(config.generation.empty_context, EmptyContextPolicy::Hedge);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn invalid_toml_is_an_error() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[llm\nprovider = ").unwrap();
    assert!(Config::load(&path).is_err());
}

#[test]
#[serial]
fn env_overrides() {
    clear_env();
    let mut config = Config::default();

    unsafe {
        std::env::set_var("FOLIO_LLM_MODEL", "phi3:mini");
        std::env::set_var("FOLIO_LLM_PROVIDER", "mock");
        std::env::set_var("FOLIO_RETRIEVAL_TOP_K", "12");
        std::env::set_var("FOLIO_RETRIEVAL_SCORE_THRESHOLD", "0.25");
        std::env::set_var("FOLIO_INDEX_BACKEND", "qdrant");
        std::env::set_var("FOLIO_GENERATION_EMPTY_CONTEXT", "hedge");
        std::env::set_var("FOLIO_LLM_API_KEY", "sk-test");
    };
    config.apply_env_overrides();
    clear_env();

    assert_eq!(config.llm.model, "phi3:mini");
    assert_eq!(config.llm.provider, ProviderKind::Mock);
    assert_eq!(config.retrieval.top_k, 12);
    assert!((config.retrieval.score_threshold - 0.25).abs() < f32::EPSILON);
    assert_eq!(config.index.backend, IndexBackend::Qdrant);
    assert_eq!(config.generation.empty_context, EmptyContextPolicy::Hedge);
    assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));
}

#[test]
#[serial]
fn invalid_env_values_are_ignored() {
    clear_env();
    let mut config = Config::default();

    unsafe {
        std::env::set_var("FOLIO_LLM_PROVIDER", "skynet");
        std::env::set_var("FOLIO_RETRIEVAL_TOP_K", "many");
        std::env::set_var("FOLIO_INDEX_METRIC", "euclid");
        std::env::set_var("FOLIO_CHUNKER_MAX_CHARS", "-5");
    };
    config.apply_env_overrides();
    clear_env();

    assert_eq!(config, Config::default());
}

#[test]
fn api_key_is_redacted_in_debug() {
    let mut config = Config::default();
    config.llm.api_key = Some("sk-secret".into());
    let debug = format!("{:?}", config.llm);
    assert!(!debug.contains("sk-secret"));
    assert!(debug.contains("[REDACTED]"));
}

#[test]
fn validate_rejects_inconsistent_values() {
    let mut config = Config::default();
    config.chunker.overlap_chars = config.chunker.max_chars;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.retrieval.top_k = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.retrieval.score_threshold = f32::NAN;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.embedding.batch_size = 0;
    assert!(config.validate().is_err());
}

#[test]
fn catalog_lifetime_follows_the_backend() {
    let mut config = Config::default();
    config.index.sqlite_path = "./data/folio.db".into();
    let err = config.validate().unwrap_err();
    assert!(format!("{err:#}").contains("memory backend"));

    config.index.backend = IndexBackend::Qdrant;
    assert!(config.validate().is_ok());

    config.index.sqlite_path = IN_MEMORY_CATALOG.into();
    let err = config.validate().unwrap_err();
    assert!(format!("{err:#}").contains("qdrant backend"));
}

#[test]
#[serial]
fn config_path_resolution() {
    clear_env();
    let explicit = std::path::Path::new("/etc/folio.toml");
    assert_eq!(resolve_config_path(Some(explicit)), explicit);
    assert_eq!(
        resolve_config_path(None),
        std::path::PathBuf::from("config/default.toml")
    );
    unsafe { std::env::set_var("FOLIO_CONFIG", "/tmp/other.toml") };
    assert_eq!(
        resolve_config_path(None),
        std::path::PathBuf::from("/tmp/other.toml")
    );
    clear_env();
}
