//! Grounded answer generation over an assembled [`Context`].

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use folio_llm::LlmProvider;
use folio_llm::LlmError;
use folio_llm::provider::Message;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::context::{Citation, Context};

const SYSTEM_PROMPT: &str = "You are an expert in technical documentation. Answer the question \
using only the numbered sources provided. Cite every statement with the bracketed number of its \
source, for example [1] or [2][3]. If the sources do not contain the answer, say that the \
documentation does not cover it. Do not invent part numbers, values or procedures.";

const NO_SOURCES_NOTE: &str = "No supporting documents were found for this question. If you \
answer from general knowledge, state clearly that the answer is not backed by the indexed \
documentation.";

static CITATION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d{1,4})\]").expect("citation marker regex is valid"));

/// What to do when retrieval produced no usable context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyContextPolicy {
    /// Answer "no results" without calling the model.
    #[default]
    Decline,
    /// Ask the model anyway and mark the answer as ungrounded.
    Hedge,
}

impl std::str::FromStr for EmptyContextPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decline" => Ok(Self::Decline),
            "hedge" => Ok(Self::Hedge),
            other => Err(format!("unknown empty context policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub empty_context: EmptyContextPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Generated {
        text: String,
        citations: Vec<Citation>,
    },
    NoResults,
    Ungrounded {
        text: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("generation provider unavailable: {0}")]
    Unavailable(#[from] LlmError),

    #[error("generation cancelled")]
    Cancelled,
}

pub struct GenerationGateway<P: LlmProvider> {
    provider: Arc<P>,
    policy: EmptyContextPolicy,
}

impl<P: LlmProvider> std::fmt::Debug for GenerationGateway<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationGateway")
            .field("provider", &self.provider.name())
            .field("policy", &self.policy)
            .finish()
    }
}

impl<P: LlmProvider> GenerationGateway<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, policy: EmptyContextPolicy) -> Self {
        Self { provider, policy }
    }

    #[must_use]
    pub fn policy(&self) -> EmptyContextPolicy {
        self.policy
    }

    /// Answer `query` from `context`.
    ///
    /// # Errors
    ///
    /// Returns [`GenerationError::Unavailable`] if the provider call fails and
    /// [`GenerationError::Cancelled`] if `cancel` fires first.
    pub async fn answer(
        &self,
        query: &str,
        context: &Context,
        cancel: &CancellationToken,
    ) -> Result<Answer, GenerationError> {
        if context.is_empty() {
            return match self.policy {
                EmptyContextPolicy::Decline => Ok(Answer::NoResults),
                EmptyContextPolicy::Hedge => {
                    let messages = vec![
                        Message::system(SYSTEM_PROMPT),
                        Message::user(format!("{NO_SOURCES_NOTE}\n\nQuestion: {query}")),
                    ];
                    let text = self.chat(&messages, cancel).await?;
                    Ok(Answer::Ungrounded { text })
                }
            };
        }

        let messages = build_messages(query, context);
        let text = self.chat(&messages, cancel).await?;
        let citations = cited(&text, context);
        tracing::debug!(
            provider = self.provider.name(),
            sources = context.len(),
            cited = citations.len(),
            "generated answer"
        );
        Ok(Answer::Generated { text, citations })
    }

    async fn chat(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(GenerationError::Cancelled),
            res = self.provider.chat(messages) => res.map_err(GenerationError::Unavailable),
        }
    }
}

#[must_use]
pub fn build_messages(query: &str, context: &Context) -> Vec<Message> {
    vec![
        Message::system(SYSTEM_PROMPT),
        Message::user(format!("Sources:\n\n{}Question: {query}", context.render())),
    ]
}

/// Entries whose `[n]` marker appears in `text`, in marker order; all entries when none is cited.
#[must_use]
pub fn cited(text: &str, context: &Context) -> Vec<Citation> {
    let markers: BTreeSet<usize> = CITATION_MARKER
        .captures_iter(text)
        .filter_map(|c| c[1].parse::<usize>().ok())
        .filter(|n| (1..=context.len()).contains(n))
        .collect();
    if markers.is_empty() {
        return context.citations();
    }
    markers
        .into_iter()
        .map(|n| context.entries[n - 1].citation)
        .collect()
}
