use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use super::super::{DEFAULT_MAX_FILE_SIZE, DocumentError, DocumentLoader, LoadedDocument};
use super::layout::with_estimated_layout;
use crate::document::types::PageText;

pub struct PdfLoader {
    pub max_file_size: u64,
}

impl Default for PdfLoader {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl DocumentLoader for PdfLoader {
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

            let source = path.display().to_string();
            let bytes = tokio::fs::read(&path).await?;
            let content_hash = blake3::hash(&bytes).to_hex().to_string();
            let path_buf = path.clone();
            let texts = tokio::task::spawn_blocking(move || {
                pdf_extract::extract_text_by_pages(&path_buf)
                    .map_err(|e| DocumentError::Pdf(e.to_string()))
            })
            .await
            .map_err(|e| DocumentError::Io(std::io::Error::other(e)))??;

            tracing::debug!(source, pages = texts.len(), "extracted PDF text");
            // Extracted text has no positions; paragraph boxes are estimated.
            let pages = texts
                .into_iter()
                .zip(1u32..)
                .map(|(text, n)| with_estimated_layout(PageText::new(n, text)))
                .collect();
            Ok(LoadedDocument {
                source,
                pages,
                content_hash,
            })
        })
    }

    fn supported_extensions(&self) -> &[&str] {
        &["pdf"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_pdf_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("broken.pdf");
        std::fs::write(&file, "not a pdf").unwrap();

        let result = PdfLoader::default().load(&file).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn file_too_large_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("big.pdf");
        std::fs::write(&file, "x").unwrap();

        let result = PdfLoader { max_file_size: 0 }.load(&file).await;
        assert!(matches!(result, Err(DocumentError::FileTooLarge(_))));
    }

    #[test]
    fn supports_pdf_extension() {
        assert_eq!(PdfLoader::default().supported_extensions(), &["pdf"]);
    }
}
