//! Construction of providers and the index from [`Config`].

use std::sync::Arc;

use anyhow::Context;
use folio_index::{DocumentCatalog, InMemoryVectorStore, QdrantOps, VectorIndex, VectorStore};
use folio_llm::any::AnyProvider;
use folio_llm::ollama::OllamaProvider;
use folio_llm::openai::OpenAiProvider;

use crate::config::{Config, IN_MEMORY_CATALOG, IndexBackend, IndexConfig, ProviderKind};

/// Build the provider selected by `config.llm.provider`.
///
/// # Errors
///
/// Returns an error if the provider needs settings that are missing, or the `mock` provider is
/// selected without the `mock` feature.
pub fn create_provider(config: &Config) -> anyhow::Result<AnyProvider> {
    let llm = &config.llm;
    match llm.provider {
        ProviderKind::Ollama => {
            let mut provider = OllamaProvider::new(
                &llm.base_url,
                llm.model.clone(),
                llm.embedding_model.clone(),
            );
            if let Some(dims) = llm.embedding_dimensions {
                provider = provider.with_embedding_dimensions(dims);
            }
            Ok(AnyProvider::Ollama(provider))
        }
        ProviderKind::OpenAi => {
            let api_key = llm
                .api_key
                .clone()
                .context("FOLIO_LLM_API_KEY required for the openai provider")?;
            let mut provider = OpenAiProvider::new(
                api_key,
                llm.base_url.clone(),
                llm.model.clone(),
                llm.max_tokens,
                Some(llm.embedding_model.clone()),
            )
            .with_rate_limit_retry(config.embedding.retry);
            if let Some(dims) = llm.embedding_dimensions {
                provider = provider.with_embedding_dimensions(dims);
            }
            Ok(AnyProvider::OpenAi(provider))
        }
        #[cfg(feature = "mock")]
        ProviderKind::Mock => {
            let mut provider = folio_llm::mock::MockProvider::default()
                .with_embedding_model(llm.embedding_model.clone());
            if let Some(dims) = llm.embedding_dimensions {
                provider = provider.with_dimensions(dims);
            }
            Ok(AnyProvider::Mock(provider))
        }
        #[cfg(not(feature = "mock"))]
        ProviderKind::Mock => anyhow::bail!("the mock provider requires the `mock` feature"),
    }
}

/// Open the catalog and vector store named by `config` and load the model registry.
///
/// # Errors
///
/// Returns an error if the backend and catalog disagree on persistence, the catalog cannot be
/// opened, or the Qdrant client cannot be built.
pub async fn open_index(config: &IndexConfig) -> anyhow::Result<VectorIndex> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid [index] section")?;
    if config.sqlite_path != IN_MEMORY_CATALOG
        && let Some(parent) = std::path::Path::new(&config.sqlite_path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let catalog = DocumentCatalog::open(&config.sqlite_path)
        .await
        .context("failed to open document catalog")?;

    let store: Arc<dyn VectorStore> = match config.backend {
        IndexBackend::Memory => Arc::new(InMemoryVectorStore::new()),
        IndexBackend::Qdrant => Arc::new(
            QdrantOps::new(&config.qdrant_url)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .context("failed to create Qdrant client")?,
        ),
    };

    let index = VectorIndex::new(store, catalog, config.metric)
        .await
        .context("failed to load embedding model registry")?;
    tracing::info!(backend = ?config.backend, metric = ?config.metric, "vector index ready");
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_llm::LlmProvider;

    #[test]
    fn create_provider_ollama() {
        let config = Config::default();
        let provider = create_provider(&config).unwrap();
        assert!(matches!(provider, AnyProvider::Ollama(_)));
        assert_eq!(provider.name(), "ollama");
    }

    #[test]
    fn create_provider_openai_without_api_key_errors() {
        let mut config = Config::default();
        config.llm.provider = ProviderKind::OpenAi;
        let err = create_provider(&config).unwrap_err();
        assert!(err.to_string().contains("FOLIO_LLM_API_KEY"));
    }

    #[test]
    fn create_provider_openai_with_key() {
        let mut config = Config::default();
        config.llm.provider = ProviderKind::OpenAi;
        config.llm.api_key = Some("sk-test".into());
        config.llm.embedding_dimensions = Some(1536);
        let provider = create_provider(&config).unwrap();
        assert!(matches!(provider, AnyProvider::OpenAi(_)));
        assert_eq!(provider.embedding_dimensions(), Some(1536));
    }

    #[tokio::test]
    async fn open_index_creates_catalog_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("folio.db");
        let config = IndexConfig {
            backend: IndexBackend::Qdrant,
            sqlite_path: path.to_string_lossy().into_owned(),
            ..IndexConfig::default()
        };
        let index = open_index(&config).await.unwrap();
        assert!(path.exists());
        assert!(index.catalog().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_index_in_memory() {
        let config = IndexConfig {
            sqlite_path: ":memory:".into(),
            ..IndexConfig::default()
        };
        assert!(open_index(&config).await.is_ok());
    }

    #[tokio::test]
    async fn memory_backend_refuses_a_catalog_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("folio.db");
        let config = IndexConfig {
            backend: IndexBackend::Memory,
            sqlite_path: path.to_string_lossy().into_owned(),
            ..IndexConfig::default()
        };
        let err = open_index(&config).await.unwrap_err();
        assert!(format!("{err:#}").contains("memory backend"));
        assert!(!path.exists());
    }
}
