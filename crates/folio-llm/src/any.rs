#[cfg(feature = "mock")]
use crate::mock::MockProvider;
use crate::ollama::OllamaProvider;
use crate::openai::OpenAiProvider;

use crate::provider::{LlmProvider, Message};

/// Generates a match over all `AnyProvider` variants, binding the inner provider
/// and evaluating the given closure for each arm.
macro_rules! delegate_provider {
    ($self:expr, |$p:ident| $expr:expr) => {
        match $self {
            AnyProvider::Ollama($p) => $expr,
            AnyProvider::OpenAi($p) => $expr,
            #[cfg(feature = "mock")]
            AnyProvider::Mock($p) => $expr,
        }
    };
}

/// Closed set of configured backends, dispatched statically.
#[derive(Debug, Clone)]
pub enum AnyProvider {
    Ollama(OllamaProvider),
    OpenAi(OpenAiProvider),
    #[cfg(feature = "mock")]
    Mock(MockProvider),
}

impl LlmProvider for AnyProvider {
    async fn chat(&self, messages: &[Message]) -> Result<String, crate::LlmError> {
        delegate_provider!(self, |p| p.chat(messages).await)
    }

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, crate::LlmError> {
        delegate_provider!(self, |p| p.embed_batch(inputs).await)
    }

    fn supports_embeddings(&self) -> bool {
        delegate_provider!(self, |p| p.supports_embeddings())
    }

    fn embedding_model(&self) -> &str {
        delegate_provider!(self, |p| p.embedding_model())
    }

    fn embedding_dimensions(&self) -> Option<usize> {
        delegate_provider!(self, |p| p.embedding_dimensions())
    }

    fn name(&self) -> &str {
        delegate_provider!(self, |p| p.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delegates_metadata_to_ollama() {
        let provider = AnyProvider::Ollama(OllamaProvider::new(
            "http://localhost:11434",
            "mistral:7b".into(),
            "nomic-embed-text".into(),
        ));
        assert_eq!(provider.name(), "ollama");
        assert_eq!(provider.embedding_model(), "nomic-embed-text");
        assert!(provider.supports_embeddings());
        assert_eq!(provider.embedding_dimensions(), None);
    }

    #[test]
    fn delegates_metadata_to_openai() {
        let provider = AnyProvider::OpenAi(
            OpenAiProvider::new(
                "k".into(),
                "https://api.openai.com/v1".into(),
                "gpt-4o-mini".into(),
                512,
                Some("text-embedding-3-small".into()),
            )
            .with_embedding_dimensions(1536),
        );
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.embedding_dimensions(), Some(1536));
    }

    #[test]
    fn debug_names_variant() {
        let provider = AnyProvider::Ollama(OllamaProvider::new(
            "http://localhost:11434",
            "m".into(),
            "e".into(),
        ));
        assert!(format!("{provider:?}").starts_with("Ollama"));
    }

    #[cfg(feature = "mock")]
    #[tokio::test]
    async fn delegates_calls_to_mock() {
        let provider = AnyProvider::Mock(MockProvider::with_responses(vec!["hi".into()]));
        assert_eq!(provider.chat(&[Message::user("q")]).await.unwrap(), "hi");
        let vectors = provider.embed_batch(&["x".into(), "y".into()]).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(provider.name(), "mock");
    }
}
