//! Region "search by example": structural features of a page region, matched against the
//! region vectors written at ingest.

use std::sync::Arc;

use folio_index::document::{BoundingBox, Chunk, DocumentId};
use folio_index::{SearchFilters, VectorIndex};
use folio_llm::{Embedding, LlmProvider, ModelId};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::retriever::{RetrievalRequest, Retrieved, Retriever};

/// US Letter in PDF points.
pub const DEFAULT_PAGE_WIDTH: f32 = 612.0;
pub const DEFAULT_PAGE_HEIGHT: f32 = 792.0;

/// Upper bound on chunks read from one page when collecting the text under a region.
const PAGE_SCAN_LIMIT: usize = 256;

/// A rectangle on one page of a document, used only as a query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub document_id: DocumentId,
    pub page_number: u32,
    pub bbox: BoundingBox,
}

/// Maps a region and the text it encloses to a fixed-size vector.
pub trait RegionFeatureExtractor: Send + Sync {
    /// Stable id; vectors from different ids are never compared.
    fn id(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// `text` is `None` or empty when the region encloses no known text.
    fn extract(&self, bbox: &BoundingBox, text: Option<&str>) -> Vec<f32>;

    fn model_id(&self) -> ModelId {
        ModelId::new(format!("layout:{}", self.id()))
    }

    fn embed(&self, bbox: &BoundingBox, text: Option<&str>) -> Embedding {
        Embedding {
            vector: self.extract(bbox, text),
            model: self.model_id(),
        }
    }
}

/// Geometry plus text statistics, 16 dimensions, L2-normalized.
///
/// | dims | feature |
/// |---|---|
/// | 0..4 | `x0, y0, x1, y1` over page size |
/// | 4..6 | width, height over page size |
/// | 6 | aspect `w / (w + h)` |
/// | 7 | area over page area |
/// | 8..10 | centre |
/// | 10 | characters per 100 square points, capped at 1 |
/// | 11..14 | digit, uppercase and punctuation ratios |
/// | 14 | line count over 50, capped at 1 |
/// | 15 | mean word length over 10, capped at 1 |
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutFeatureExtractor {
    pub page_width: f32,
    pub page_height: f32,
}

impl Default for LayoutFeatureExtractor {
    fn default() -> Self {
        Self {
            page_width: DEFAULT_PAGE_WIDTH,
            page_height: DEFAULT_PAGE_HEIGHT,
        }
    }
}

impl LayoutFeatureExtractor {
    pub const DIMENSIONS: usize = 16;
}

fn unit(v: f32) -> f32 {
    if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: usize, whole: usize) -> f32 {
    if whole == 0 {
        0.0
    } else {
        part as f32 / whole as f32
    }
}

impl RegionFeatureExtractor for LayoutFeatureExtractor {
    #[allow(clippy::unnecessary_literal_bound)]
    fn id(&self) -> &str {
        "v1"
    }

    fn dimensions(&self) -> usize {
        Self::DIMENSIONS
    }

    #[allow(clippy::cast_precision_loss)]
    fn extract(&self, bbox: &BoundingBox, text: Option<&str>) -> Vec<f32> {
        let pw = self.page_width.max(1.0);
        let ph = self.page_height.max(1.0);
        let (w, h) = (bbox.width(), bbox.height());

        let mut v = vec![0.0f32; Self::DIMENSIONS];
        v[0] = unit(bbox.x0 / pw);
        v[1] = unit(bbox.y0 / ph);
        v[2] = unit(bbox.x1 / pw);
        v[3] = unit(bbox.y1 / ph);
        v[4] = unit(w / pw);
        v[5] = unit(h / ph);
        v[6] = if w + h > 0.0 { unit(w / (w + h)) } else { 0.0 };
        v[7] = unit(bbox.area() / (pw * ph));
        v[8] = unit((bbox.x0 + bbox.x1) / 2.0 / pw);
        v[9] = unit((bbox.y0 + bbox.y1) / 2.0 / ph);

        if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
            let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
            let total = chars.len();
            let area = bbox.area().max(1.0);
            v[10] = unit(total as f32 * 100.0 / area);
            v[11] = ratio(chars.iter().filter(|c| c.is_ascii_digit()).count(), total);
            v[12] = ratio(chars.iter().filter(|c| c.is_uppercase()).count(), total);
            v[13] = ratio(chars.iter().filter(|c| c.is_ascii_punctuation()).count(), total);
            v[14] = unit(text.lines().filter(|l| !l.trim().is_empty()).count() as f32 / 50.0);
            let words: Vec<&str> = text.split_whitespace().collect();
            let mean = ratio(words.iter().map(|w| w.chars().count()).sum(), words.len());
            v[15] = unit(mean / 10.0);
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

/// Region query prepared for the retriever.
#[derive(Debug, Clone)]
pub struct RegionQuery {
    pub embedding: Embedding,
    pub filters: SearchFilters,
    /// Whether text under the region fed the features, as opposed to geometry alone.
    pub with_text: bool,
}

/// Region match results.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionMatch {
    pub retrieved: Retrieved,
    /// Whether text under the region fed the features.
    pub with_text: bool,
}

pub struct RegionMatcher {
    index: Arc<VectorIndex>,
    extractor: Arc<dyn RegionFeatureExtractor>,
}

impl std::fmt::Debug for RegionMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionMatcher")
            .field("extractor", &self.extractor.model_id())
            .finish_non_exhaustive()
    }
}

impl RegionMatcher {
    #[must_use]
    pub fn new(index: Arc<VectorIndex>, extractor: Arc<dyn RegionFeatureExtractor>) -> Self {
        Self { index, extractor }
    }

    #[must_use]
    pub fn extractor(&self) -> &Arc<dyn RegionFeatureExtractor> {
        &self.extractor
    }

    /// Build the query vector for `descriptor` and the filters that exclude the region's own
    /// chunks.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MalformedInput`] for a degenerate or non-finite box, and index
    /// errors from reading the page.
    pub async fn prepare(
        &self,
        descriptor: &RegionDescriptor,
        mut filters: SearchFilters,
    ) -> Result<RegionQuery, EngineError> {
        let bbox = descriptor.bbox;
        if !bbox.is_finite() || bbox.area() <= 0.0 {
            return Err(EngineError::MalformedInput(format!(
                "region box must be finite with positive area: {bbox:?}"
            )));
        }
        if descriptor.page_number == 0 {
            return Err(EngineError::MalformedInput("page numbers start at 1".into()));
        }

        let under = self.chunks_under(descriptor).await?;
        let text: String = under
            .iter()
            .map(|c| c.core_text())
            .collect::<Vec<_>>()
            .join("\n");
        let with_text = !text.trim().is_empty();
        if !with_text {
            tracing::debug!(
                document_id = %descriptor.document_id,
                page = descriptor.page_number,
                "no text under region, matching on geometry only"
            );
        }

        filters
            .exclude_chunks
            .extend(under.iter().map(|c| c.id));
        Ok(RegionQuery {
            embedding: self
                .extractor
                .embed(&bbox, with_text.then_some(text.as_str())),
            filters,
            with_text,
        })
    }

    /// Live chunks on the descriptor's page whose box intersects the region.
    async fn chunks_under(&self, descriptor: &RegionDescriptor) -> Result<Vec<Chunk>, EngineError> {
        let model = self.extractor.model_id();
        if self.index.dimensions_of(&model).is_none() {
            return Ok(Vec::new());
        }
        let page_query = self.extractor.embed(&descriptor.bbox, None);
        let page_filter = SearchFilters {
            document_ids: vec![descriptor.document_id],
            page_range: Some((descriptor.page_number, descriptor.page_number)),
            exclude_chunks: Vec::new(),
        };
        let on_page = self
            .index
            .search(&page_query, PAGE_SCAN_LIMIT, &page_filter)
            .await?;
        let mut under: Vec<Chunk> = on_page
            .into_iter()
            .map(|r| r.chunk)
            .filter(|c| c.bbox.is_some_and(|b| b.intersects(&descriptor.bbox)))
            .collect();
        under.sort_by_key(|c| c.sequence);
        Ok(under)
    }

    /// Find chunks structurally similar to the region.
    ///
    /// # Errors
    ///
    /// Same as [`RegionMatcher::prepare`] plus retrieval errors.
    pub async fn match_region<P: LlmProvider>(
        &self,
        retriever: &Retriever<P>,
        descriptor: &RegionDescriptor,
        k: usize,
        filters: SearchFilters,
    ) -> Result<RegionMatch, EngineError> {
        let query = self.prepare(descriptor, filters).await?;
        let retrieved = retriever
            .retrieve(RetrievalRequest::vector(query.embedding, k).with_filters(query.filters))
            .await?;
        Ok(RegionMatch {
            retrieved,
            with_text: query.with_text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_index::document::{ChunkId, Span};
    use folio_index::{DocumentCatalog, InMemoryVectorStore, IndexRecord, Metric};
    use folio_llm::mock::MockProvider;
    use folio_llm::{Embedder, EmbedderConfig};

    use crate::retriever::RetrievalConfig;

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn features_are_fixed_size_and_normalized() {
        let ex = LayoutFeatureExtractor::default();
        let bbox = BoundingBox::new(72.0, 100.0, 540.0, 300.0);
        let v = ex.extract(&bbox, Some("TABLE 4: Torque values 12 Nm"));
        assert_eq!(v.len(), 16);
        assert!((norm(&v) - 1.0).abs() < 1e-5);
        assert!(v.iter().all(|x| x.is_finite()));
        assert_eq!(ex.model_id(), ModelId::new("layout:v1"));
    }

    #[test]
    fn text_statistics_are_zero_without_text() {
        let ex = LayoutFeatureExtractor::default();
        let bbox = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let v = ex.extract(&bbox, None);
        assert!(v[10..].iter().all(|x| x.abs() < f32::EPSILON));
        assert_eq!(v, ex.extract(&bbox, Some("   ")));
        assert_ne!(v, ex.extract(&bbox, Some("Some text")));
    }

    #[test]
    fn out_of_page_boxes_stay_bounded() {
        let ex = LayoutFeatureExtractor::default();
        let v = ex.extract(&BoundingBox::new(-50.0, -50.0, 5000.0, 5000.0), None);
        assert!(v.iter().all(|x| (0.0..=1.0).contains(x)));
    }

    #[test]
    fn similar_regions_score_higher() {
        let ex = LayoutFeatureExtractor::default();
        let a = ex.extract(
            &BoundingBox::new(72.0, 600.0, 540.0, 700.0),
            Some("Step 1. Remove the cover."),
        );
        let b = ex.extract(
            &BoundingBox::new(72.0, 590.0, 540.0, 690.0),
            Some("Step 2. Loosen the bolts."),
        );
        let c = ex.extract(&BoundingBox::new(10.0, 10.0, 40.0, 30.0), Some("12"));
        let sim = |x: &[f32], y: &[f32]| folio_index::cosine_similarity(x, y);
        assert!(sim(&a, &b) > sim(&a, &c));
    }

    struct Fixture {
        matcher: RegionMatcher,
        retriever: Retriever<MockProvider>,
        doc: DocumentId,
        chunks: Vec<Chunk>,
    }

    fn chunk(doc: DocumentId, sequence: usize, page: u32, bbox: BoundingBox, text: &str) -> Chunk {
        Chunk {
            id: ChunkId::derive(doc, 1, sequence),
            document_id: doc,
            version: 1,
            sequence,
            span: Span {
                start: sequence * 100,
                end: sequence * 100 + text.len(),
            },
            overlap: 0,
            page_number: page,
            bbox: Some(bbox),
            text: text.into(),
        }
    }

    async fn fixture() -> Fixture {
        let catalog = DocumentCatalog::open(":memory:").await.unwrap();
        let index = Arc::new(
            VectorIndex::new(Arc::new(InMemoryVectorStore::new()), catalog, Metric::Cosine)
                .await
                .unwrap(),
        );
        let extractor: Arc<dyn RegionFeatureExtractor> =
            Arc::new(LayoutFeatureExtractor::default());
        let doc = index.catalog().register("manual", Some(2)).await.unwrap();
        let version = index.catalog().begin_version(doc).await.unwrap();
        let cover = BoundingBox::new(72.0, 80.0, 540.0, 200.0);
        let figure = BoundingBox::new(72.0, 400.0, 300.0, 420.0);
        let refit = BoundingBox::new(72.0, 90.0, 540.0, 210.0);
        let chunks = vec![
            chunk(doc, 0, 1, cover, "Step 1. Remove the cover."),
            chunk(doc, 1, 1, figure, "Figure 2"),
            chunk(doc, 2, 2, refit, "Step 4. Refit the cover."),
        ];
        let records = chunks
            .iter()
            .map(|c| IndexRecord {
                chunk: c.clone(),
                embedding: extractor.embed(&c.bbox.unwrap(), Some(&c.text)),
            })
            .collect();
        index.upsert_document(doc, version, records).await.unwrap();
        index.catalog().mark_embedded(doc, version).await.unwrap();

        let embedder = Arc::new(Embedder::new(
            Arc::new(MockProvider::default()),
            EmbedderConfig::default(),
        ));
        let retriever = Retriever::new(embedder, Arc::clone(&index), RetrievalConfig::default());
        Fixture {
            matcher: RegionMatcher::new(index, extractor),
            retriever,
            doc,
            chunks,
        }
    }

    #[tokio::test]
    async fn region_over_text_excludes_itself() {
        let f = fixture().await;
        let descriptor = RegionDescriptor {
            document_id: f.doc,
            page_number: 1,
            bbox: BoundingBox::new(70.0, 78.0, 542.0, 202.0),
        };
        let query = f
            .matcher
            .prepare(&descriptor, SearchFilters::default())
            .await
            .unwrap();
        assert!(query.with_text);
        assert_eq!(query.filters.exclude_chunks, vec![f.chunks[0].id]);

        let matched = f
            .matcher
            .match_region(&f.retriever, &descriptor, 1, SearchFilters::default())
            .await
            .unwrap();
        assert!(matched.with_text);
        assert_eq!(matched.retrieved.results.len(), 1);
        assert_eq!(matched.retrieved.results[0].chunk.id, f.chunks[2].id);
    }

    #[tokio::test]
    async fn empty_region_falls_back_to_geometry() {
        let f = fixture().await;
        let descriptor = RegionDescriptor {
            document_id: f.doc,
            page_number: 2,
            bbox: BoundingBox::new(72.0, 600.0, 540.0, 700.0),
        };
        let query = f
            .matcher
            .prepare(&descriptor, SearchFilters::default())
            .await
            .unwrap();
        assert!(!query.with_text);
        assert!(query.filters.exclude_chunks.is_empty());
        assert_eq!(
            query.embedding.vector,
            LayoutFeatureExtractor::default().extract(&descriptor.bbox, None)
        );

        let matched = f
            .matcher
            .match_region(&f.retriever, &descriptor, 3, SearchFilters::default())
            .await
            .unwrap();
        assert!(!matched.with_text);
        assert_eq!(matched.retrieved.results.len(), 3);
    }

    #[tokio::test]
    async fn degenerate_regions_are_rejected() {
        let f = fixture().await;
        let flat = RegionDescriptor {
            document_id: f.doc,
            page_number: 1,
            bbox: BoundingBox::new(10.0, 10.0, 10.0, 50.0),
        };
        let err = f
            .matcher
            .prepare(&flat, SearchFilters::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MalformedInput(_)));

        let page_zero = RegionDescriptor {
            page_number: 0,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            ..flat
        };
        assert!(f.matcher.prepare(&page_zero, SearchFilters::default()).await.is_err());
    }

    #[tokio::test]
    async fn unindexed_layout_space_is_geometry_only() {
        let catalog = DocumentCatalog::open(":memory:").await.unwrap();
        let index = Arc::new(
            VectorIndex::new(Arc::new(InMemoryVectorStore::new()), catalog, Metric::Cosine)
                .await
                .unwrap(),
        );
        let matcher = RegionMatcher::new(index, Arc::new(LayoutFeatureExtractor::default()));
        let query = matcher
            .prepare(
                &RegionDescriptor {
                    document_id: DocumentId(1),
                    page_number: 1,
                    bbox: BoundingBox::new(0.0, 0.0, 50.0, 50.0),
                },
                SearchFilters::default(),
            )
            .await
            .unwrap();
        assert!(!query.with_text);
    }
}
