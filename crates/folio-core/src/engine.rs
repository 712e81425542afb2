//! Entry points of the retrieval pipeline: ingest, query, region query, delete, status.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use folio_index::document::{
    BoundingBox, Chunk, Chunker, DocumentId, DocumentLoader, DocumentStatus, PageText, TextLoader,
};
use folio_index::{DocumentRecord, IndexRecord, Registration, SearchFilters, VectorIndex};
use folio_llm::{Embedder, LlmProvider};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, TimeoutConfig};
use crate::context::{Citation, Context};
use crate::error::{EngineError, ErrorKind};
use crate::gateway::{Answer, GenerationError, GenerationGateway};
use crate::region::{RegionDescriptor, RegionFeatureExtractor, RegionMatch, RegionMatcher};
use crate::rerank::Reranker;
use crate::retriever::{RetrievalMode, RetrievalRequest, Retrieved, Retriever};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub document_id: DocumentId,
    pub version: u32,
    pub status: DocumentStatus,
    pub chunks: usize,
    pub region_vectors: usize,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub text: String,
    pub k: usize,
    pub mode: RetrievalMode,
    pub filters: SearchFilters,
}

impl QueryRequest {
    #[must_use]
    pub fn new(text: impl Into<String>, k: usize) -> Self {
        Self {
            text: text.into(),
            k,
            mode: RetrievalMode::Standard,
            filters: SearchFilters::default(),
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: RetrievalMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnswerOutcome {
    Generated { text: String },
    /// Nothing relevant was found and the model was not asked.
    NoResults,
    /// The model answered without supporting documents.
    Ungrounded { text: String },
    /// Retrieval succeeded but the model could not be reached.
    GenerationFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub answer: AnswerOutcome,
    pub citations: Vec<Citation>,
    pub raw_context: Context,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionResponse {
    pub citations: Vec<Citation>,
    pub raw_context: Context,
    /// Whether text under the region informed the match.
    pub with_text: bool,
}

/// The retrieval pipeline behind one shared handle.
///
/// Query-path state is immutable and shared, so queries run in parallel. The only mutual
/// exclusion is one in-flight ingestion per document.
pub struct RagEngine<P: LlmProvider> {
    index: Arc<VectorIndex>,
    embedder: Arc<Embedder<P>>,
    chunker: Chunker,
    retriever: Retriever<P>,
    region: RegionMatcher,
    extractor: Arc<dyn RegionFeatureExtractor>,
    gateway: GenerationGateway<P>,
    default_k: usize,
    default_mode: RetrievalMode,
    timeouts: TimeoutConfig,
    ingest_locks: Mutex<HashMap<DocumentId, Arc<tokio::sync::Mutex<()>>>>,
}

impl<P: LlmProvider> std::fmt::Debug for RagEngine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RagEngine")
            .field("retriever", &self.retriever)
            .field("region", &self.region)
            .field("gateway", &self.gateway)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl<P: LlmProvider> RagEngine<P> {
    /// Assemble the pipeline from a provider, an index handle and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MalformedInput`] if the chunker configuration is inconsistent.
    pub fn new(
        provider: Arc<P>,
        index: Arc<VectorIndex>,
        config: &Config,
    ) -> Result<Self, EngineError> {
        let chunker = Chunker::new(config.chunker.clone())?;
        let embedder = Arc::new(Embedder::new(Arc::clone(&provider), config.embedding.clone()));
        let retriever = Retriever::new(
            Arc::clone(&embedder),
            Arc::clone(&index),
            config.retrieval.clone(),
        );
        let extractor: Arc<dyn RegionFeatureExtractor> = Arc::new(config.layout);
        Ok(Self {
            region: RegionMatcher::new(Arc::clone(&index), Arc::clone(&extractor)),
            gateway: GenerationGateway::new(provider, config.generation.empty_context),
            default_k: config.retrieval.top_k,
            default_mode: config.retrieval.mode,
            timeouts: config.timeouts,
            ingest_locks: Mutex::new(HashMap::new()),
            index,
            embedder,
            chunker,
            retriever,
            extractor,
        })
    }

    #[must_use]
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.retriever = self.retriever.with_reranker(reranker);
        self
    }

    #[must_use]
    pub fn with_region_extractor(mut self, extractor: Arc<dyn RegionFeatureExtractor>) -> Self {
        self.region = RegionMatcher::new(Arc::clone(&self.index), Arc::clone(&extractor));
        self.extractor = extractor;
        self
    }

    #[must_use]
    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    #[must_use]
    pub fn default_k(&self) -> usize {
        self.default_k
    }

    #[must_use]
    pub fn default_mode(&self) -> RetrievalMode {
        self.default_mode
    }

    fn ingest_lock(&self, document_id: DocumentId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .ingest_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.retain(|id, lock| *id == document_id || Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(document_id).or_default())
    }

    /// Chunk, embed and index `pages` as the next version of `document_id`.
    ///
    /// A fresh or `embedded` document gets a new version. A document left `uploaded`,
    /// `chunked` or `failed` retries its current version; vectors left by the unfinished
    /// attempt are removed before the retry writes its own.
    ///
    /// Until a document is first embedded, `pages` must match the page count it was
    /// registered with.
    ///
    /// # Errors
    ///
    /// - [`EngineError::MalformedInput`]: the pages cannot be chunked; status becomes `failed`.
    /// - [`EngineError::EmbeddingUnavailable`]: status stays `chunked` for a later retry.
    /// - [`EngineError::Cancelled`] / [`EngineError::Timeout`]: in-flight work is dropped.
    pub async fn ingest(
        &self,
        document_id: DocumentId,
        pages: Vec<PageText>,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, EngineError> {
        bounded(cancel, self.timeouts.ingest(), async {
            let lock = self.ingest_lock(document_id);
            let _guard = lock.lock().await;
            self.ingest_locked(document_id, &pages).await
        })
        .await
    }

    async fn ingest_locked(
        &self,
        document_id: DocumentId,
        pages: &[PageText],
    ) -> Result<IngestReport, EngineError> {
        let catalog = self.index.catalog();
        catalog.ensure(document_id).await?;
        let expected_pages = catalog
            .get(document_id)
            .await?
            .filter(|record| record.live_version.is_none())
            .and_then(|record| record.page_count)
            .and_then(|count| usize::try_from(count).ok());
        let version = catalog.begin_version(document_id).await?;
        tracing::info!(%document_id, version, pages = pages.len(), "ingesting document");

        let chunks = match self.chunker.chunk(document_id, version, pages, expected_pages) {
            Ok(chunks) => chunks,
            Err(e) => {
                let err = EngineError::from(e);
                self.fail(document_id, version, &err).await;
                return Err(err);
            }
        };
        catalog
            .set_status(document_id, version, DocumentStatus::Chunked, None)
            .await?;

        let records = match self.embed_chunks(&chunks).await {
            Ok(records) => records,
            Err(err) => {
                if err.kind() == ErrorKind::EmbeddingUnavailable {
                    tracing::warn!(
                        %document_id,
                        version,
                        "embedding unavailable, document left chunked: {err}"
                    );
                } else {
                    self.fail(document_id, version, &err).await;
                }
                return Err(err);
            }
        };
        let region_vectors = records
            .iter()
            .filter(|r| r.embedding.model == self.extractor.model_id())
            .count();

        // A reused version may still hold vectors of an attempt that failed mid-write.
        self.index.delete_version(document_id, version).await?;
        if let Err(e) = self.index.upsert_document(document_id, version, records).await {
            let err = EngineError::from(e);
            if err.kind() == ErrorKind::IndexConsistency {
                self.fail(document_id, version, &err).await;
            }
            return Err(err);
        }

        if let Ok(count) = u32::try_from(pages.len()) {
            catalog.set_page_count(document_id, count).await?;
        }
        catalog.mark_embedded(document_id, version).await?;
        if let Err(e) = self.index.delete_other_versions(document_id, version).await {
            // Stale versions stay invisible to search; they are removed on the next ingest.
            tracing::warn!(%document_id, version, "failed to remove superseded vectors: {e}");
        }

        tracing::info!(
            %document_id,
            version,
            chunks = chunks.len(),
            region_vectors,
            "document embedded"
        );
        Ok(IngestReport {
            document_id,
            version,
            status: DocumentStatus::Embedded,
            chunks: chunks.len(),
            region_vectors,
        })
    }

    /// Text vectors for every chunk plus layout vectors for chunks with a bounding box.
    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<IndexRecord>, EngineError> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;
        if embeddings.len() != chunks.len() {
            return Err(EngineError::IndexConsistency(format!(
                "{} embeddings for {} chunks",
                embeddings.len(),
                chunks.len()
            )));
        }

        let mut records: Vec<IndexRecord> = chunks
            .iter()
            .cloned()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexRecord { chunk, embedding })
            .collect();
        for chunk in chunks {
            if let Some(bbox) = chunk.bbox {
                records.push(IndexRecord {
                    embedding: self.extractor.embed(&bbox, Some(chunk.core_text())),
                    chunk: chunk.clone(),
                });
            }
        }
        Ok(records)
    }

    async fn fail(&self, document_id: DocumentId, version: u32, err: &EngineError) {
        tracing::warn!(%document_id, version, "ingestion failed: {err}");
        let message = err.to_string();
        if let Err(e) = self
            .index
            .catalog()
            .set_status(document_id, version, DocumentStatus::Failed, Some(&message))
            .await
        {
            tracing::error!(%document_id, version, "failed to record failure: {e}");
        }
    }

    /// Load a file by extension and ingest it as a new document.
    ///
    /// Files are identified by content. A file whose content is already searchable is
    /// rejected; one whose earlier ingestion never finished resumes under its existing id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MalformedInput`] for unsupported extensions or unreadable
    /// content, [`EngineError::Duplicate`] for content that is already ingested, plus
    /// everything [`RagEngine::ingest`] returns.
    pub async fn ingest_file(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, EngineError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let text_loader = TextLoader::default();
        if text_loader
            .supported_extensions()
            .contains(&extension.as_str())
        {
            return self.ingest_with(&text_loader, path, cancel).await;
        }
        #[cfg(feature = "pdf")]
        {
            if extension == "pdf" {
                return self.ingest_pdf(path, cancel).await;
            }
        }
        Err(EngineError::MalformedInput(format!(
            "unsupported file type: {}",
            path.display()
        )))
    }

    /// Register a PDF, extract its pages and ingest them.
    ///
    /// # Errors
    ///
    /// Same as [`RagEngine::ingest_file`].
    #[cfg(feature = "pdf")]
    pub async fn ingest_pdf(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, EngineError> {
        self.ingest_with(&folio_index::document::PdfLoader::default(), path, cancel)
            .await
    }

    async fn ingest_with(
        &self,
        loader: &dyn DocumentLoader,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, EngineError> {
        let loaded = bounded(cancel, self.timeouts.ingest(), async {
            loader.load(path).await.map_err(EngineError::from)
        })
        .await?;
        let page_count = u32::try_from(loaded.pages.len()).ok();
        let catalog = self.index.catalog();
        let document_id = match catalog
            .register_content(&loaded.source, page_count, &loaded.content_hash)
            .await?
        {
            Registration::Created(document_id) => {
                tracing::debug!(%document_id, source = %loaded.source, "registered document");
                document_id
            }
            Registration::Existing(document_id) => {
                let live = catalog
                    .get(document_id)
                    .await?
                    .and_then(|record| record.live_version);
                if live.is_some() {
                    tracing::info!(
                        %document_id,
                        source = %loaded.source,
                        "content already ingested"
                    );
                    return Err(EngineError::Duplicate(document_id));
                }
                tracing::info!(
                    %document_id,
                    source = %loaded.source,
                    "resuming unfinished document with identical content"
                );
                document_id
            }
        };
        self.ingest(document_id, loaded.pages, cancel).await
    }

    /// Retrieve, assemble and generate an answer.
    ///
    /// A generation failure is not an error: the response carries
    /// [`AnswerOutcome::GenerationFailed`] together with the retrieved context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MalformedInput`] for an empty query, embedding and index errors
    /// from retrieval, and [`EngineError::Cancelled`] / [`EngineError::Timeout`].
    pub async fn query(
        &self,
        request: QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse, EngineError> {
        bounded(cancel, self.timeouts.query(), async {
            let QueryRequest {
                text,
                k,
                mode,
                filters,
            } = request;
            let retrieved = self
                .retriever
                .retrieve(
                    RetrievalRequest::text(text.clone(), k)
                        .with_mode(mode)
                        .with_filters(filters),
                )
                .await?;
            let context = retrieved.context;

            let (answer, citations) = match self.gateway.answer(&text, &context, cancel).await {
                Ok(Answer::Generated { text, citations }) => {
                    (AnswerOutcome::Generated { text }, citations)
                }
                Ok(Answer::NoResults) => (AnswerOutcome::NoResults, Vec::new()),
                Ok(Answer::Ungrounded { text }) => (AnswerOutcome::Ungrounded { text }, Vec::new()),
                Err(GenerationError::Cancelled) => return Err(EngineError::Cancelled),
                Err(GenerationError::Unavailable(e)) => {
                    let err = EngineError::GenerationUnavailable(e.to_string());
                    tracing::warn!("{err}; returning retrieved context");
                    (
                        AnswerOutcome::GenerationFailed {
                            reason: e.to_string(),
                        },
                        context.citations(),
                    )
                }
            };
            Ok(QueryResponse {
                answer,
                citations,
                raw_context: context,
            })
        })
        .await
    }

    /// Retrieval only, without generation.
    ///
    /// # Errors
    ///
    /// Same as [`RagEngine::query`].
    pub async fn search(
        &self,
        request: QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<Retrieved, EngineError> {
        bounded(cancel, self.timeouts.query(), async {
            self.retriever
                .retrieve(
                    RetrievalRequest::text(request.text, request.k)
                        .with_mode(request.mode)
                        .with_filters(request.filters),
                )
                .await
        })
        .await
    }

    /// Find chunks structurally similar to a region of a page.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown document,
    /// [`EngineError::MalformedInput`] for a degenerate box, and cancellation errors.
    pub async fn query_by_region(
        &self,
        document_id: DocumentId,
        page_number: u32,
        bbox: BoundingBox,
        k: usize,
        cancel: &CancellationToken,
    ) -> Result<RegionResponse, EngineError> {
        bounded(cancel, self.timeouts.query(), async {
            if self.index.catalog().get(document_id).await?.is_none() {
                return Err(EngineError::NotFound(document_id));
            }
            let descriptor = RegionDescriptor {
                document_id,
                page_number,
                bbox,
            };
            let RegionMatch {
                retrieved,
                with_text,
            } = self
                .region
                .match_region(&self.retriever, &descriptor, k, SearchFilters::default())
                .await?;
            Ok(RegionResponse {
                citations: retrieved.context.citations(),
                raw_context: retrieved.context,
                with_text,
            })
        })
        .await
    }

    /// Remove a document's vectors and catalog row. Returns whether the document existed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] if the store or catalog rejects the deletion.
    pub async fn delete(&self, document_id: DocumentId) -> Result<bool, EngineError> {
        let lock = self.ingest_lock(document_id);
        let _guard = lock.lock().await;
        self.index.delete(document_id).await?;
        let existed = self.index.catalog().delete(document_id).await?;
        tracing::info!(%document_id, existed, "deleted document");
        Ok(existed)
    }

    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown document.
    pub async fn status(&self, document_id: DocumentId) -> Result<DocumentRecord, EngineError> {
        self.index
            .catalog()
            .get(document_id)
            .await?
            .ok_or(EngineError::NotFound(document_id))
    }

    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] if the catalog cannot be read.
    pub async fn documents(&self) -> Result<Vec<DocumentRecord>, EngineError> {
        Ok(self.index.catalog().list().await?)
    }
}

/// Race `fut` against `cancel` and `limit`. Losing futures are dropped.
async fn bounded<T>(
    cancel: &CancellationToken,
    limit: Duration,
    fut: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(EngineError::Cancelled),
        res = tokio::time::timeout(limit, fut) => res.map_err(|_| EngineError::Timeout(limit))?,
    }
}
