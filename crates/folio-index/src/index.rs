//! Model-keyed vector index over a [`VectorStore`], gated by the document catalog.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use folio_llm::{Embedding, ModelId};
use serde_json::json;

use crate::catalog::DocumentCatalog;
use crate::document::{BoundingBox, Chunk, ChunkId, DocumentId, Span};
use crate::error::IndexError;
use crate::vector_store::{FieldValue, Metric, VectorFilter, VectorPoint, VectorStore};

const COLLECTION_PREFIX: &str = "folio_";

/// Vector for one chunk in one model space.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub chunk: Chunk,
    pub embedding: Embedding,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub score: f32,
    /// 1-based position in the result list.
    pub rank: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    /// Restrict to these documents; empty means all.
    pub document_ids: Vec<DocumentId>,
    /// Inclusive page range.
    pub page_range: Option<(u32, u32)>,
    /// Chunks never returned, regardless of score.
    pub exclude_chunks: Vec<ChunkId>,
}

impl SearchFilters {
    #[must_use]
    pub fn for_document(document_id: DocumentId) -> Self {
        Self {
            document_ids: vec![document_id],
            ..Self::default()
        }
    }

    fn to_vector_filter(&self) -> Option<VectorFilter> {
        let mut filter = VectorFilter::default();
        match self.document_ids.as_slice() {
            [] => {}
            [one] => filter = filter.must("document_id", FieldValue::Integer(one.0)),
            many => {
                filter = filter.must(
                    "document_id",
                    FieldValue::AnyInteger(many.iter().map(|d| d.0).collect()),
                );
            }
        }
        if let Some((from, to)) = self.page_range {
            filter = filter.must(
                "page_number",
                FieldValue::IntegerRange {
                    gte: i64::from(from),
                    lte: i64::from(to),
                },
            );
        }
        for id in &self.exclude_chunks {
            filter = filter.must_not("chunk_id", FieldValue::Text(id.to_string()));
        }
        (!filter.must.is_empty() || !filter.must_not.is_empty()).then_some(filter)
    }
}

/// Sort by score descending, then chunk sequence, then document id.
pub fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.sequence.cmp(&b.chunk.sequence))
            .then_with(|| a.chunk.document_id.cmp(&b.chunk.document_id))
    });
}

/// Assign 1-based ranks in current order.
pub fn assign_ranks(results: &mut [SearchResult]) {
    for (i, r) in results.iter_mut().enumerate() {
        r.rank = i + 1;
    }
}

/// Embeddings keyed by chunk identity and model. One store collection per model, so vectors
/// from different models are never scored against each other.
pub struct VectorIndex {
    store: Arc<dyn VectorStore>,
    catalog: DocumentCatalog,
    metric: Metric,
    dimensions: RwLock<HashMap<ModelId, usize>>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("metric", &self.metric)
            .finish_non_exhaustive()
    }
}

impl VectorIndex {
    /// Build the index and load the persisted dimension registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub async fn new(
        store: Arc<dyn VectorStore>,
        catalog: DocumentCatalog,
        metric: Metric,
    ) -> Result<Self, IndexError> {
        let dimensions = catalog
            .models()
            .await?
            .into_iter()
            .map(|(model, dims)| (ModelId::new(model), dims))
            .collect();
        Ok(Self {
            store,
            catalog,
            metric,
            dimensions: RwLock::new(dimensions),
        })
    }

    #[must_use]
    pub fn catalog(&self) -> &DocumentCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Collection name for a model: `folio_` plus the id with non-alphanumerics replaced.
    #[must_use]
    pub fn collection_name(model: &ModelId) -> String {
        let sanitized: String = model
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        format!("{COLLECTION_PREFIX}{sanitized}")
    }

    #[must_use]
    pub fn dimensions_of(&self, model: &ModelId) -> Option<usize> {
        self.dimensions
            .read()
            .ok()
            .and_then(|d| d.get(model).copied())
    }

    fn known_models(&self) -> Vec<ModelId> {
        self.dimensions
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Register `model` with `dimensions` and create its collection.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Consistency`] if the model is already registered with a
    /// different dimensionality.
    pub async fn ensure_model(&self, model: &ModelId, dimensions: usize) -> Result<(), IndexError> {
        if dimensions == 0 {
            return Err(IndexError::Consistency(format!(
                "model {model}: zero-dimensional vectors"
            )));
        }
        if let Some(known) = self.dimensions_of(model) {
            return check_dimensions(model, known, dimensions);
        }
        let stored = self.catalog.register_model(model.as_str(), dimensions).await?;
        check_dimensions(model, stored, dimensions)?;
        self.store
            .ensure_collection(&Self::collection_name(model), dimensions as u64, self.metric)
            .await?;
        if let Ok(mut dims) = self.dimensions.write() {
            dims.insert(model.clone(), dimensions);
        }
        tracing::info!(%model, dimensions, metric = ?self.metric, "registered embedding model");
        Ok(())
    }

    /// Write every record of one document version, one store call per model.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Consistency`] if a record belongs to another document version
    /// or has the wrong dimensionality; nothing is written in that case.
    pub async fn upsert_document(
        &self,
        document_id: DocumentId,
        version: u32,
        records: Vec<IndexRecord>,
    ) -> Result<usize, IndexError> {
        let mut by_model: BTreeMap<ModelId, Vec<IndexRecord>> = BTreeMap::new();
        for record in records {
            if record.chunk.document_id != document_id || record.chunk.version != version {
                return Err(IndexError::Consistency(format!(
                    "record {} belongs to document {} v{}, not {document_id} v{version}",
                    record.chunk.id, record.chunk.document_id, record.chunk.version
                )));
            }
            by_model
                .entry(record.embedding.model.clone())
                .or_default()
                .push(record);
        }

        // Validate all models before the first write.
        for (model, records) in &by_model {
            let dims = records[0].embedding.dimensions();
            if let Some(bad) = records.iter().find(|r| r.embedding.dimensions() != dims) {
                return Err(IndexError::Consistency(format!(
                    "model {model}: chunk {} has {} dimensions, expected {dims}",
                    bad.chunk.id,
                    bad.embedding.dimensions()
                )));
            }
            if let Some(known) = self.dimensions_of(model) {
                check_dimensions(model, known, dims)?;
            }
        }

        let mut written = 0;
        for (model, records) in by_model {
            self.ensure_model(&model, records[0].embedding.dimensions())
                .await?;
            let points: Vec<VectorPoint> = records.into_iter().map(to_point).collect();
            written += points.len();
            self.store
                .upsert(&Self::collection_name(&model), points)
                .await?;
        }
        tracing::debug!(%document_id, version, records = written, "upserted document vectors");
        Ok(written)
    }

    /// Convenience for a single record.
    ///
    /// # Errors
    ///
    /// Same as [`VectorIndex::upsert_document`].
    pub async fn upsert(&self, record: IndexRecord) -> Result<(), IndexError> {
        let (document_id, version) = (record.chunk.document_id, record.chunk.version);
        self.upsert_document(document_id, version, vec![record])
            .await
            .map(|_| ())
    }

    /// Remove every vector of the document, across all versions and models.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects a deletion.
    pub async fn delete(&self, document_id: DocumentId) -> Result<(), IndexError> {
        let filter =
            VectorFilter::default().must("document_id", FieldValue::Integer(document_id.0));
        self.delete_matching(filter).await?;
        tracing::debug!(%document_id, "deleted document vectors");
        Ok(())
    }

    /// Remove the vectors of one version.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects a deletion.
    pub async fn delete_version(
        &self,
        document_id: DocumentId,
        version: u32,
    ) -> Result<(), IndexError> {
        let filter = VectorFilter::default()
            .must("document_id", FieldValue::Integer(document_id.0))
            .must("version", FieldValue::Integer(i64::from(version)));
        self.delete_matching(filter).await
    }

    /// Remove the vectors of every version except `keep`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects a deletion.
    pub async fn delete_other_versions(
        &self,
        document_id: DocumentId,
        keep: u32,
    ) -> Result<(), IndexError> {
        let filter = VectorFilter::default()
            .must("document_id", FieldValue::Integer(document_id.0))
            .must_not("version", FieldValue::Integer(i64::from(keep)));
        self.delete_matching(filter).await
    }

    async fn delete_matching(&self, filter: VectorFilter) -> Result<(), IndexError> {
        for model in self.known_models() {
            self.store
                .delete_by_filter(&Self::collection_name(&model), filter.clone())
                .await?;
        }
        Ok(())
    }

    /// Top `k` live results for `query`, sorted by score, then sequence, then document.
    ///
    /// Only records whose `(document, version)` is the catalog's live embedded version are
    /// returned. When visibility filtering drops hits the store is queried again with a
    /// doubled limit until `k` live results are found or the collection is exhausted. The
    /// same happens while the lowest fetched score ties the `k`-th result, since the store
    /// orders equal scores by point id and may have cut the tie group short.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Consistency`] if the query's dimensionality differs from the
    /// model's, or a stored record cannot be decoded.
    pub async fn search(
        &self,
        query: &Embedding,
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>, IndexError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let Some(dims) = self.dimensions_of(&query.model) else {
            // Nothing was ever indexed with this model.
            return Ok(Vec::new());
        };
        check_dimensions(&query.model, dims, query.dimensions())?;

        let collection = Self::collection_name(&query.model);
        let filter = filters.to_vector_filter();
        let mut limit = k;
        let mut results = loop {
            let hits = self
                .store
                .search(&collection, query.vector.clone(), limit as u64, filter.clone())
                .await?;
            let exhausted = hits.len() < limit;
            let floor = hits.last().map(|h| h.score);

            let mut decoded = Vec::with_capacity(hits.len());
            for hit in hits {
                let chunk = from_payload(&hit.payload, &query.model)?;
                decoded.push(SearchResult {
                    chunk,
                    score: hit.score,
                    rank: 0,
                });
            }
            let documents: Vec<DocumentId> = decoded
                .iter()
                .map(|r| r.chunk.document_id)
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            let live = self.catalog.live_versions(&documents).await?;
            decoded.retain(|r| live.get(&r.chunk.document_id) == Some(&r.chunk.version));

            if exhausted {
                break decoded;
            }
            if decoded.len() >= k {
                sort_results(&mut decoded);
                let kth = decoded[k - 1].score;
                if floor.is_none_or(|f| f < kth) {
                    break decoded;
                }
                tracing::trace!(limit, score = kth, "refetching past a tie at the cut");
            } else {
                tracing::trace!(limit, live = decoded.len(), "refetching past stale versions");
            }
            limit = limit.saturating_mul(2);
        };

        sort_results(&mut results);
        results.truncate(k);
        assign_ranks(&mut results);
        Ok(results)
    }
}

fn check_dimensions(model: &ModelId, expected: usize, actual: usize) -> Result<(), IndexError> {
    if expected == actual {
        Ok(())
    } else {
        Err(IndexError::Consistency(format!(
            "model {model}: expected {expected} dimensions, got {actual}"
        )))
    }
}

fn to_point(record: IndexRecord) -> VectorPoint {
    let IndexRecord { chunk, embedding } = record;
    let mut payload = HashMap::from([
        ("chunk_id".to_owned(), json!(chunk.id.to_string())),
        ("document_id".to_owned(), json!(chunk.document_id.0)),
        ("version".to_owned(), json!(chunk.version)),
        ("sequence".to_owned(), json!(chunk.sequence)),
        ("page_number".to_owned(), json!(chunk.page_number)),
        ("span_start".to_owned(), json!(chunk.span.start)),
        ("span_end".to_owned(), json!(chunk.span.end)),
        ("overlap".to_owned(), json!(chunk.overlap)),
        ("model".to_owned(), json!(embedding.model.as_str())),
        ("text".to_owned(), json!(chunk.text)),
    ]);
    if let Some(b) = chunk.bbox {
        payload.insert("bbox_x0".to_owned(), json!(b.x0));
        payload.insert("bbox_y0".to_owned(), json!(b.y0));
        payload.insert("bbox_x1".to_owned(), json!(b.x1));
        payload.insert("bbox_y1".to_owned(), json!(b.y1));
    }
    VectorPoint {
        id: chunk.id.to_string(),
        vector: embedding.vector,
        payload,
    }
}

fn from_payload(
    payload: &HashMap<String, serde_json::Value>,
    model: &ModelId,
) -> Result<Chunk, IndexError> {
    let int = |field: &str| -> Result<i64, IndexError> {
        payload
            .get(field)
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| IndexError::Consistency(format!("record missing integer field {field}")))
    };
    let index = |field: &str| -> Result<usize, IndexError> {
        usize::try_from(int(field)?)
            .map_err(|_| IndexError::Consistency(format!("record field {field} out of range")))
    };
    let text = |field: &str| -> Result<&str, IndexError> {
        payload
            .get(field)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| IndexError::Consistency(format!("record missing text field {field}")))
    };

    let stored_model = text("model")?;
    if stored_model != model.as_str() {
        return Err(IndexError::Consistency(format!(
            "record embedded with model {stored_model} found in {model} space"
        )));
    }

    let id = uuid::Uuid::parse_str(text("chunk_id")?)
        .map_err(|e| IndexError::Consistency(format!("invalid chunk id: {e}")))?;
    let version = u32::try_from(int("version")?)
        .map_err(|_| IndexError::Consistency("record version out of range".into()))?;
    let page_number = u32::try_from(int("page_number")?)
        .map_err(|_| IndexError::Consistency("record page out of range".into()))?;

    #[allow(clippy::cast_possible_truncation)]
    let coord = |field: &str| {
        payload
            .get(field)
            .and_then(serde_json::Value::as_f64)
            .map(|v| v as f32)
    };
    let bbox = match (coord("bbox_x0"), coord("bbox_y0"), coord("bbox_x1"), coord("bbox_y1")) {
        (Some(x0), Some(y0), Some(x1), Some(y1)) => Some(BoundingBox::new(x0, y0, x1, y1)),
        _ => None,
    };

    Ok(Chunk {
        id: ChunkId(id),
        document_id: DocumentId(int("document_id")?),
        version,
        sequence: index("sequence")?,
        span: Span {
            start: index("span_start")?,
            end: index("span_end")?,
        },
        overlap: index("overlap")?,
        page_number,
        bbox,
        text: text("text")?.to_owned(),
    })
}
