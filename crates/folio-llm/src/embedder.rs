//! Batched, bounded and retried embedding on top of any [`LlmProvider`].

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::LlmError;
use crate::provider::LlmProvider;
use crate::retry::RetryPolicy;

/// Identifier of the vector space an embedding lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model: ModelId,
}

impl Embedding {
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("embedding provider unavailable after {attempts} attempt(s): {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: LlmError,
    },

    #[error("embedding dimension mismatch for model {model}: expected {expected}, got {actual}")]
    DimensionMismatch {
        model: ModelId,
        expected: usize,
        actual: usize,
    },

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("provider {provider} does not support embeddings")]
    Unsupported { provider: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    pub batch_size: usize,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_in_flight: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Turns texts into [`Embedding`]s in the provider's embedding model space.
///
/// Output has the same length and order as the input. A call either returns every vector or
/// fails as a whole; no partial output is ever produced.
pub struct Embedder<P> {
    provider: Arc<P>,
    config: EmbedderConfig,
    permits: Arc<Semaphore>,
    observed_dimensions: OnceLock<usize>,
}

impl<P> fmt::Debug for Embedder<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embedder")
            .field("config", &self.config)
            .field("observed_dimensions", &self.observed_dimensions.get())
            .finish_non_exhaustive()
    }
}

impl<P: LlmProvider> Embedder<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, config: EmbedderConfig) -> Self {
        let observed_dimensions = OnceLock::new();
        if let Some(declared) = provider.embedding_dimensions() {
            let _ = observed_dimensions.set(declared);
        }
        Self {
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            provider,
            config,
            observed_dimensions,
        }
    }

    #[must_use]
    pub fn model_id(&self) -> ModelId {
        ModelId::new(self.provider.embedding_model())
    }

    /// Dimensionality declared by the provider or observed on the first successful batch.
    #[must_use]
    pub fn dimensions(&self) -> Option<usize> {
        self.observed_dimensions.get().copied()
    }

    #[must_use]
    pub fn config(&self) -> &EmbedderConfig {
        &self.config
    }

    /// Embed `inputs` in batches of `batch_size`, with at most `max_in_flight` batches at once.
    ///
    /// # Errors
    ///
    /// Returns [`EmbedError::Unavailable`] once any batch runs out of retry attempts, and
    /// [`EmbedError::DimensionMismatch`] / [`EmbedError::InvalidResponse`] when the provider
    /// returns vectors that cannot be trusted.
    pub async fn embed(&self, inputs: &[String]) -> Result<Vec<Embedding>, EmbedError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        if !self.provider.supports_embeddings() {
            return Err(EmbedError::Unsupported {
                provider: self.provider.name().to_owned(),
            });
        }

        let batch_size = self.config.batch_size.max(1);
        let batches = inputs
            .chunks(batch_size)
            .enumerate()
            .map(|(index, batch)| self.embed_batch(index, batch));
        let results = futures::future::try_join_all(batches).await?;

        let model = self.model_id();
        let embeddings: Vec<Embedding> = results
            .into_iter()
            .flatten()
            .map(|vector| Embedding {
                vector,
                model: model.clone(),
            })
            .collect();

        tracing::debug!(
            model = %model,
            inputs = inputs.len(),
            batches = inputs.len().div_ceil(batch_size),
            "embedded inputs"
        );
        Ok(embeddings)
    }

    /// Embed a single text, typically a query.
    ///
    /// # Errors
    ///
    /// Same as [`Embedder::embed`].
    pub async fn embed_one(&self, text: &str) -> Result<Embedding, EmbedError> {
        self.embed(&[text.to_owned()])
            .await?
            .pop()
            .ok_or_else(|| EmbedError::InvalidResponse("no embedding returned".into()))
    }

    async fn embed_batch(
        &self,
        index: usize,
        batch: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EmbedError::InvalidResponse("embedder shut down".into()))?;

        let vectors = self
            .config
            .retry
            .run("embed_batch", || self.provider.embed_batch(batch))
            .await
            .map_err(|e| {
                tracing::error!(
                    batch = index,
                    attempts = e.attempts,
                    "embedding batch failed: {}",
                    e.source
                );
                EmbedError::Unavailable {
                    attempts: e.attempts,
                    source: e.source,
                }
            })?;

        if vectors.len() != batch.len() {
            return Err(EmbedError::InvalidResponse(format!(
                "batch {index}: {} vectors for {} inputs",
                vectors.len(),
                batch.len()
            )));
        }
        for vector in &vectors {
            self.check_vector(vector)?;
        }
        Ok(vectors)
    }

    fn check_vector(&self, vector: &[f32]) -> Result<(), EmbedError> {
        if vector.is_empty() {
            return Err(EmbedError::InvalidResponse("empty vector".into()));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(EmbedError::InvalidResponse(
                "vector contains non-finite values".into(),
            ));
        }
        let expected = *self.observed_dimensions.get_or_init(|| vector.len());
        if vector.len() != expected {
            return Err(EmbedError::DimensionMismatch {
                model: self.model_id(),
                expected,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::provider::Message;

    /// Provider whose embedding behaviour is scripted per call.
    #[derive(Default)]
    struct ScriptedProvider {
        dims: usize,
        fail_first: AtomicUsize,
        always_fail: bool,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        calls: AtomicUsize,
        overrides: Mutex<Vec<Vec<Vec<f32>>>>,
    }

    impl ScriptedProvider {
        fn with_dims(dims: usize) -> Self {
            Self {
                dims,
                ..Self::default()
            }
        }
    }

    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, _messages: &[Message]) -> Result<String, LlmError> {
            Ok(String::new())
        }

        async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.always_fail {
                return Err(LlmError::Unavailable);
            }
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(LlmError::RateLimited);
            }
            if let Some(scripted) = self.overrides.lock().unwrap().pop() {
                return Ok(scripted);
            }
            #[allow(clippy::cast_precision_loss)]
            Ok(inputs
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; self.dims];
                    v[0] = t.len() as f32;
                    v
                })
                .collect())
        }

        fn supports_embeddings(&self) -> bool {
            true
        }

        fn embedding_model(&self) -> &str {
            "scripted"
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn inputs(n: usize) -> Vec<String> {
        (0..n).map(|i| "x".repeat(i + 1)).collect()
    }

    fn config(batch_size: usize, max_in_flight: usize, attempts: u32) -> EmbedderConfig {
        EmbedderConfig {
            batch_size,
            max_in_flight,
            retry: RetryPolicy::immediate(attempts),
        }
    }

    #[tokio::test]
    async fn output_preserves_input_order() {
        let embedder = Embedder::new(Arc::new(ScriptedProvider::with_dims(3)), config(2, 3, 1));
        let out = embedder.embed(&inputs(7)).await.unwrap();
        assert_eq!(out.len(), 7);
        for (i, e) in out.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let expected = (i + 1) as f32;
            assert_eq!(e.vector[0], expected);
            assert_eq!(e.model, ModelId::new("scripted"));
        }
        assert_eq!(embedder.dimensions(), Some(3));
    }

    #[tokio::test]
    async fn in_flight_batches_are_bounded() {
        let provider = Arc::new(ScriptedProvider::with_dims(2));
        let embedder = Embedder::new(Arc::clone(&provider), config(1, 2, 1));
        embedder.embed(&inputs(10)).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 10);
        assert!(provider.peak_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let provider = Arc::new(ScriptedProvider {
            fail_first: AtomicUsize::new(2),
            ..ScriptedProvider::with_dims(2)
        });
        let embedder = Embedder::new(Arc::clone(&provider), config(8, 1, 3));
        let out = embedder.embed(&inputs(3)).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_whole_call() {
        let provider = Arc::new(ScriptedProvider {
            always_fail: true,
            ..ScriptedProvider::with_dims(2)
        });
        let embedder = Embedder::new(provider, config(2, 2, 3));
        let err = embedder.embed(&inputs(4)).await.unwrap_err();
        assert!(matches!(err, EmbedError::Unavailable { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn dimension_change_is_rejected() {
        let provider = Arc::new(ScriptedProvider::with_dims(4));
        let embedder = Embedder::new(Arc::clone(&provider), config(8, 1, 1));
        embedder.embed_one("first").await.unwrap();
        provider.overrides.lock().unwrap().push(vec![vec![1.0, 2.0]]);
        let err = embedder.embed_one("second").await.unwrap_err();
        assert!(matches!(
            err,
            EmbedError::DimensionMismatch {
                expected: 4,
                actual: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn count_mismatch_is_invalid() {
        let provider = Arc::new(ScriptedProvider::with_dims(2));
        provider.overrides.lock().unwrap().push(vec![vec![1.0, 0.0]]);
        let embedder = Embedder::new(provider, config(8, 1, 1));
        let err = embedder.embed(&inputs(2)).await.unwrap_err();
        assert!(matches!(err, EmbedError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn nan_vectors_are_invalid() {
        let provider = Arc::new(ScriptedProvider::with_dims(2));
        provider.overrides.lock().unwrap().push(vec![vec![f32::NAN, 0.0]]);
        let embedder = Embedder::new(provider, config(8, 1, 1));
        let err = embedder.embed_one("q").await.unwrap_err();
        assert!(matches!(err, EmbedError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let provider = Arc::new(ScriptedProvider::with_dims(2));
        let embedder = Embedder::new(Arc::clone(&provider), EmbedderConfig::default());
        assert!(embedder.embed(&[]).await.unwrap().is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn config_deserializes_partial() {
        let cfg: EmbedderConfig = serde_json::from_str(r#"{"batch_size":8}"#).unwrap();
        assert_eq!(cfg.batch_size, 8);
        assert_eq!(cfg.max_in_flight, 4);
    }

    #[cfg(feature = "mock")]
    #[tokio::test]
    async fn mock_embeddings_are_deterministic() {
        let embedder = Embedder::new(
            Arc::new(crate::mock::MockProvider::default()),
            EmbedderConfig::default(),
        );
        let a = embedder.embed_one("torque specification").await.unwrap();
        let b = embedder.embed_one("torque specification").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(embedder.dimensions(), Some(64));
    }
}
