//! Document chunking, the SQLite document catalog and the model-keyed vector index.

pub mod catalog;
pub mod document;
pub mod error;
pub mod in_memory_store;
pub mod index;
pub mod qdrant_ops;
pub mod vector_store;

pub use catalog::{DocumentCatalog, DocumentRecord, Registration};
pub use error::IndexError;
pub use in_memory_store::InMemoryVectorStore;
pub use index::{IndexRecord, SearchFilters, SearchResult, VectorIndex, assign_ranks, sort_results};
pub use qdrant_ops::QdrantOps;
pub use vector_store::{
    BoxFuture, FieldValue, Metric, ScoredVectorPoint, VectorFilter, VectorPoint, VectorStore,
    VectorStoreError, cosine_similarity,
};
