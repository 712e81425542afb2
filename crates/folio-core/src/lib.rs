//! Retrieval, context assembly, grounded generation and the engine that ties them to the index.

pub mod bootstrap;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod region;
pub mod rerank;
pub mod retriever;

pub use config::Config;
pub use context::{Citation, Context, ContextAssembler, ContextEntry};
pub use engine::{
    AnswerOutcome, IngestReport, QueryRequest, QueryResponse, RagEngine, RegionResponse,
};
pub use error::{EngineError, ErrorKind};
pub use gateway::{Answer, EmptyContextPolicy, GenerationConfig, GenerationGateway};
pub use region::{
    LayoutFeatureExtractor, RegionDescriptor, RegionFeatureExtractor, RegionMatch, RegionMatcher,
};
pub use rerank::{LexicalOverlapReranker, NoopReranker, Reranker};
pub use retriever::{RetrievalConfig, RetrievalMode, RetrievalRequest, Retrieved, Retriever};
