//! LLM and embedding provider abstraction and backend implementations.

pub mod any;
pub mod embedder;
pub mod error;
pub mod http;
#[cfg(feature = "mock")]
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod retry;

pub use embedder::{EmbedError, Embedder, EmbedderConfig, Embedding, ModelId};
pub use error::LlmError;
pub use provider::LlmProvider;
pub use retry::RetryPolicy;
