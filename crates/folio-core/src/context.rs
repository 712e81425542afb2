//! Budgeted packing of ranked results into a citable generation context.

use std::fmt::Write;

use folio_index::SearchResult;
use folio_index::document::{Chunk, ChunkId, DocumentId};
use serde::Serialize;

/// Provenance of one context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Citation {
    pub document_id: DocumentId,
    pub version: u32,
    pub chunk_id: ChunkId,
    pub page_number: u32,
    pub sequence: usize,
}

impl Citation {
    #[must_use]
    pub fn of(chunk: &Chunk) -> Self {
        Self {
            document_id: chunk.document_id,
            version: chunk.version,
            chunk_id: chunk.id,
            page_number: chunk.page_number,
            sequence: chunk.sequence,
        }
    }
}

impl std::fmt::Display for Citation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "document {} v{}, page {}, chunk {}",
            self.document_id, self.version, self.page_number, self.sequence
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextEntry {
    pub result: SearchResult,
    pub citation: Citation,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    pub entries: Vec<ContextEntry>,
    pub total_chars: usize,
    pub budget_chars: usize,
    /// Results that did not fit the remaining budget, in rank order.
    pub skipped: Vec<Chunk>,
}

impl Context {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn citations(&self) -> Vec<Citation> {
        self.entries.iter().map(|e| e.citation).collect()
    }

    /// The `[n]` marker [`render`](Self::render) gives the entry with this citation.
    #[must_use]
    pub fn marker_of(&self, citation: &Citation) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.citation.chunk_id == citation.chunk_id)
            .map(|i| i + 1)
    }

    /// Entries numbered `[1]..[n]` in rank order, the markers generated text cites.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, entry) in self.entries.iter().enumerate() {
            let c = &entry.citation;
            let _ = writeln!(
                out,
                "[{}] (document {}, version {}, page {})",
                i + 1,
                c.document_id,
                c.version,
                c.page_number
            );
            out.push_str(entry.result.chunk.text.trim_end());
            out.push_str("\n\n");
        }
        out
    }
}

/// Character length used for budgeting.
#[must_use]
pub fn measure(text: &str) -> usize {
    text.chars().count()
}

/// Greedy packer: takes results in rank order and skips, never truncates, what does not fit.
#[derive(Debug, Clone, Copy)]
pub struct ContextAssembler {
    budget_chars: usize,
}

impl ContextAssembler {
    #[must_use]
    pub fn new(budget_chars: usize) -> Self {
        Self { budget_chars }
    }

    #[must_use]
    pub fn budget_chars(&self) -> usize {
        self.budget_chars
    }

    #[must_use]
    pub fn assemble(&self, results: Vec<SearchResult>) -> Context {
        let mut context = Context {
            budget_chars: self.budget_chars,
            ..Context::default()
        };
        for result in results {
            let cost = measure(&result.chunk.text);
            if context.total_chars + cost > self.budget_chars {
                context.skipped.push(result.chunk);
                continue;
            }
            context.total_chars += cost;
            context.entries.push(ContextEntry {
                citation: Citation::of(&result.chunk),
                result,
            });
        }
        if !context.skipped.is_empty() {
            tracing::debug!(
                entries = context.entries.len(),
                skipped = context.skipped.len(),
                total_chars = context.total_chars,
                budget = self.budget_chars,
                "context budget exhausted"
            );
        }
        context
    }
}
