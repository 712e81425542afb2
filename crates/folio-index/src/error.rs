use crate::document::DocumentId;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Dimension or model mismatch, or a stored record that cannot be decoded.
    #[error("index consistency violation: {0}")]
    Consistency(String),

    #[error("vector store error: {0}")]
    Store(#[from] crate::vector_store::VectorStoreError),

    #[error("Qdrant error: {0}")]
    Qdrant(#[from] Box<qdrant_client::QdrantError>),

    #[error("database error: {0}")]
    Catalog(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("document {0} not found")]
    NotFound(DocumentId),
}
