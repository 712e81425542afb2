pub mod chunker;
pub mod error;
pub mod loader;
pub mod types;

pub use chunker::{Chunker, ChunkerConfig};
pub use error::DocumentError;
pub use loader::TextLoader;
pub use types::{
    BoundingBox, Chunk, ChunkId, DocumentId, DocumentStatus, PageText, Span, TextBlock,
};

#[cfg(feature = "pdf")]
pub use loader::PdfLoader;

/// Default maximum file size: 50 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Per-page text of one source file.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub source: String,
    pub pages: Vec<PageText>,
    /// BLAKE3 of the raw file bytes, hex encoded.
    pub content_hash: String,
}

pub trait DocumentLoader: Send + Sync {
    fn load(
        &self,
        path: &std::path::Path,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<LoadedDocument, DocumentError>> + Send + '_>,
    >;

    fn supported_extensions(&self) -> &[&str];
}
