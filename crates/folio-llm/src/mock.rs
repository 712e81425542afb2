//! Test-only mock LLM provider.
//!
//! Embeddings are deterministic: each lowercase alphanumeric token is hashed into a signed
//! bucket and the result is L2-normalized, so texts sharing vocabulary score high under cosine.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::LlmError;
use crate::provider::{LlmProvider, Message};

#[derive(Debug, Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<Vec<String>>>,
    pub default_response: String,
    pub embedding_model: String,
    pub dimensions: usize,
    pub supports_embeddings: bool,
    pub fail_chat: bool,
    /// Number of upcoming `embed_batch` calls that fail with a retryable error.
    embed_failures: Arc<AtomicU32>,
    pub embed_calls: Arc<AtomicUsize>,
    pub chat_calls: Arc<AtomicUsize>,
    pub last_prompt: Arc<Mutex<Vec<Message>>>,
    /// Milliseconds to sleep before returning a response.
    pub delay_ms: u64,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            default_response: "mock response".into(),
            embedding_model: "mock-embed".into(),
            dimensions: 64,
            supports_embeddings: true,
            fail_chat: false,
            embed_failures: Arc::new(AtomicU32::new(0)),
            embed_calls: Arc::new(AtomicUsize::new(0)),
            chat_calls: Arc::new(AtomicUsize::new(0)),
            last_prompt: Arc::new(Mutex::new(Vec::new())),
            delay_ms: 0,
        }
    }
}

impl MockProvider {
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_chat: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    #[must_use]
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    #[must_use]
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    /// Make the next `n` embedding calls fail with [`LlmError::RateLimited`].
    #[must_use]
    pub fn with_embed_failures(self, n: u32) -> Self {
        self.embed_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Deterministic hashed bag-of-words vector for `text`.
    #[must_use]
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        hashed_embedding(text, self.dimensions)
    }
}

#[must_use]
pub fn hashed_embedding(text: &str, dimensions: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimensions.max(1)];
    let lower = text.to_lowercase();
    for token in lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let hash = blake3::hash(token.as_bytes());
        let bytes = hash.as_bytes();
        let bucket = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]);
        #[allow(clippy::cast_possible_truncation)]
        let idx = (bucket % vector.len() as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[idx] += sign;
    }
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

impl LlmProvider for MockProvider {
    async fn chat(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if let Ok(mut last) = self.last_prompt.lock() {
            *last = messages.to_vec();
        }
        if self.fail_chat {
            return Err(LlmError::Unavailable);
        }
        let mut responses = self
            .responses
            .lock()
            .map_err(|e| LlmError::Other(e.to_string()))?;
        if responses.is_empty() {
            Ok(self.default_response.clone())
        } else {
            Ok(responses.remove(0))
        }
    }

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if !self.supports_embeddings {
            return Err(LlmError::EmbedUnsupported {
                provider: "mock".into(),
            });
        }
        let failing = self
            .embed_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LlmError::RateLimited);
        }
        Ok(inputs.iter().map(|t| self.vector_for(t)).collect())
    }

    fn supports_embeddings(&self) -> bool {
        self.supports_embeddings
    }

    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    fn embedding_dimensions(&self) -> Option<usize> {
        Some(self.dimensions)
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }
}
