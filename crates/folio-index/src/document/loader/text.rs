use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use super::super::{DEFAULT_MAX_FILE_SIZE, DocumentError, DocumentLoader, LoadedDocument};
use super::layout::with_estimated_layout;
use crate::document::types::PageText;

/// Plain-text loader. Form feeds (`\x0c`) separate pages, as in `pdftotext` output.
/// Paragraph boxes are estimated, since plain text carries no geometry.
pub struct TextLoader {
    pub max_file_size: u64,
}

impl Default for TextLoader {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Split text on form feeds into 1-based pages. The separators themselves are dropped.
#[must_use]
pub(crate) fn split_pages(content: &str) -> Vec<PageText> {
    let mut parts: Vec<&str> = content.split('\x0c').collect();
    // A trailing form feed closes the last page rather than opening an empty one.
    if parts.len() > 1 && parts.last().is_some_and(|p| p.is_empty()) {
        parts.pop();
    }
    parts
        .into_iter()
        .zip(1u32..)
        .map(|(text, n)| PageText::new(n, text))
        .collect()
}

impl DocumentLoader for TextLoader {
    fn load(
        &self,
        path: &Path,
    ) -> Pin<Box<dyn Future<Output = Result<LoadedDocument, DocumentError>> + Send + '_>> {
        let path = path.to_path_buf();
        let max_size = self.max_file_size;
        Box::pin(async move {
            let path = std::fs::canonicalize(&path)?;

            let meta = tokio::fs::metadata(&path).await?;
            if meta.len() > max_size {
                return Err(DocumentError::FileTooLarge(meta.len()));
            }

            let bytes = tokio::fs::read(&path).await?;
            let content_hash = blake3::hash(&bytes).to_hex().to_string();
            let content = String::from_utf8(bytes)
                .map_err(|e| DocumentError::MalformedInput(format!("not UTF-8 text: {e}")))?;
            Ok(LoadedDocument {
                source: path.display().to_string(),
                pages: split_pages(&content)
                    .into_iter()
                    .map(with_estimated_layout)
                    .collect(),
                content_hash,
            })
        })
    }

    fn supported_extensions(&self) -> &[&str] {
        &["txt", "text"]
    }
}
