use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::error::DocumentError;
use super::types::{BoundingBox, Chunk, ChunkId, DocumentId, PageText, Span};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    pub min_chars: usize,
    /// Upper bound on a chunk's overlap plus core, counted in characters of
    /// the trimmed text. Whitespace runs inside a chunk still count; edge
    /// whitespace does not, so `text.chars().count()` may exceed it.
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub sentence_aware: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_chars: 200,
            max_chars: 1000,
            overlap_chars: 100,
            sentence_aware: true,
        }
    }
}

impl ChunkerConfig {
    /// # Errors
    ///
    /// Returns a description of the first violated constraint.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_chars == 0 {
            return Err("chunker.max_chars must be positive".into());
        }
        if self.overlap_chars >= self.max_chars {
            return Err(format!(
                "chunker.overlap_chars ({}) must be less than max_chars ({})",
                self.overlap_chars, self.max_chars
            ));
        }
        if self.min_chars > self.max_chars {
            return Err(format!(
                "chunker.min_chars ({}) must not exceed max_chars ({})",
                self.min_chars, self.max_chars
            ));
        }
        Ok(())
    }

    fn core_limit(&self) -> usize {
        self.max_chars.saturating_sub(self.overlap_chars).max(1)
    }
}

/// Splits page texts into bounded, sentence-aware chunks whose cores tile the document text.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

/// Chunk of a single page before document-level placement.
struct PageChunk {
    core: Range<usize>,
    overlap: usize,
    bbox: Option<BoundingBox>,
}

impl Chunker {
    /// # Errors
    ///
    /// Returns [`DocumentError::MalformedInput`] if the configuration is inconsistent.
    pub fn new(config: ChunkerConfig) -> Result<Self, DocumentError> {
        config.validate().map_err(DocumentError::MalformedInput)?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk one document version.
    ///
    /// `expected_page_count`, when known, must match `pages.len()`.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::MalformedInput`] for empty text or inconsistent page metadata.
    pub fn chunk(
        &self,
        document_id: DocumentId,
        version: u32,
        pages: &[PageText],
        expected_page_count: Option<usize>,
    ) -> Result<Vec<Chunk>, DocumentError> {
        validate_pages(pages, expected_page_count)?;

        let document_text: String = pages.iter().map(|p| p.text.as_str()).collect();
        let mut placed: Vec<(u32, Span, usize, Option<BoundingBox>)> = Vec::new();
        // Bytes of leading blank pages waiting for the first chunk.
        let mut pending_start: Option<usize> = None;
        let mut offset = 0;

        for page in pages {
            let page_chunks = self.chunk_page(page);
            if page_chunks.is_empty() {
                match placed.last_mut() {
                    Some(last) => last.1.end = offset + page.text.len(),
                    None => {
                        pending_start.get_or_insert(offset);
                    }
                }
            }
            for pc in page_chunks {
                let mut span = Span {
                    start: offset + pc.core.start,
                    end: offset + pc.core.end,
                };
                if let Some(start) = pending_start.take() {
                    span.start = start;
                }
                placed.push((page.page_number, span, pc.overlap, pc.bbox));
            }
            offset += page.text.len();
        }

        let chunks: Vec<Chunk> = placed
            .into_iter()
            .enumerate()
            .map(|(sequence, (page_number, span, overlap, bbox))| Chunk {
                id: ChunkId::derive(document_id, version, sequence),
                document_id,
                version,
                sequence,
                span,
                overlap,
                page_number,
                bbox,
                text: document_text[span.start - overlap..span.end].to_owned(),
            })
            .collect();

        tracing::debug!(
            %document_id,
            version,
            pages = pages.len(),
            chunks = chunks.len(),
            "chunked document"
        );
        Ok(chunks)
    }

    fn chunk_page(&self, page: &PageText) -> Vec<PageChunk> {
        let text = page.text.as_str();
        if text.trim().is_empty() {
            return Vec::new();
        }
        let limit = self.config.core_limit();

        let pieces: Vec<Range<usize>> = if self.config.sentence_aware {
            split_sentences(text)
                .into_iter()
                .flat_map(|s| hard_split(text, s, limit))
                .collect()
        } else {
            hard_split(text, 0..text.len(), limit)
        };

        let mut groups = pack(text, &pieces, limit);
        self.merge_undersized_tail(text, &pieces, &mut groups);

        let mut out = Vec::with_capacity(groups.len());
        let mut previous: Option<Range<usize>> = None;
        for group in groups {
            let core = pieces[group.start].start..pieces[group.end - 1].end;
            let overlap = match &previous {
                Some(prev) if self.config.sentence_aware => {
                    sentence_overlap(text, &pieces, prev, self.config.overlap_chars)
                }
                Some(_) => char_overlap(&text[..core.start], self.config.overlap_chars),
                None => 0,
            };
            let bbox = page
                .blocks
                .iter()
                .filter(|b| b.range.start < core.end && core.start < b.range.end)
                .map(|b| b.bbox)
                .reduce(|a, b| a.union(&b));
            out.push(PageChunk {
                core,
                overlap,
                bbox,
            });
            previous = Some(group);
        }
        out
    }

    /// Fold a short final chunk into its predecessor when the combined text, including the
    /// predecessor's overlap, stays within `max_chars`.
    fn merge_undersized_tail(
        &self,
        text: &str,
        pieces: &[Range<usize>],
        groups: &mut Vec<Range<usize>>,
    ) {
        if groups.len() < 2 {
            return;
        }
        let last = &groups[groups.len() - 1];
        let prev = &groups[groups.len() - 2];
        let tail = &text[pieces[last.start].start..pieces[last.end - 1].end];
        if measure(tail) >= self.config.min_chars {
            return;
        }
        let merged_core = &text[pieces[prev.start].start..pieces[last.end - 1].end];
        let prev_overlap_chars = if groups.len() > 2 {
            self.config.overlap_chars
        } else {
            0
        };
        if measure(merged_core) + prev_overlap_chars <= self.config.max_chars {
            let end = last.end;
            groups.pop();
            if let Some(prev) = groups.last_mut() {
                prev.end = end;
            }
        }
    }
}

fn validate_pages(pages: &[PageText], expected: Option<usize>) -> Result<(), DocumentError> {
    if pages.is_empty() {
        return Err(DocumentError::MalformedInput("document has no pages".into()));
    }
    if let Some(expected) = expected
        && expected != pages.len()
    {
        return Err(DocumentError::MalformedInput(format!(
            "page count mismatch: expected {expected}, got {}",
            pages.len()
        )));
    }
    for (i, page) in pages.iter().enumerate() {
        if usize::try_from(page.page_number).ok() != Some(i + 1) {
            return Err(DocumentError::MalformedInput(format!(
                "page {} at position {}: page numbers must be consecutive from 1",
                page.page_number,
                i + 1
            )));
        }
        for block in &page.blocks {
            let r = &block.range;
            if r.start > r.end
                || r.end > page.text.len()
                || !page.text.is_char_boundary(r.start)
                || !page.text.is_char_boundary(r.end)
            {
                return Err(DocumentError::MalformedInput(format!(
                    "page {}: block range {}..{} is out of bounds",
                    page.page_number, r.start, r.end
                )));
            }
            if !block.bbox.is_finite() {
                return Err(DocumentError::MalformedInput(format!(
                    "page {}: block bounding box is not finite",
                    page.page_number
                )));
            }
        }
    }
    if pages.iter().all(|p| p.text.trim().is_empty()) {
        return Err(DocumentError::MalformedInput(
            "extracted text is empty".into(),
        ));
    }
    Ok(())
}

/// Size measure shared by packing and validation: characters of the trimmed text.
/// Every limit in this module is expressed in this measure.
fn measure(s: &str) -> usize {
    s.trim().chars().count()
}

/// Sentence ranges tiling `text`. Trailing whitespace stays with its sentence and leading
/// whitespace joins the first sentence.
fn split_sentences(text: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '.' | '?' | '!' => chars.peek().is_some_and(|&(_, n)| n.is_whitespace()),
            '\n' => chars.peek().is_some_and(|&(_, n)| n == '\n'),
            _ => false,
        };
        if !boundary {
            continue;
        }
        let mut end = i + c.len_utf8();
        while let Some(&(j, n)) = chars.peek() {
            if !n.is_whitespace() {
                break;
            }
            end = j + n.len_utf8();
            chars.next();
        }
        ranges.push(start..end);
        start = end;
    }
    if start < text.len() {
        ranges.push(start..text.len());
    }

    let mut merged: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
    let mut carry: Option<usize> = None;
    for r in ranges {
        if text[r.clone()].trim().is_empty() {
            carry.get_or_insert(r.start);
            continue;
        }
        let start = carry.take().unwrap_or(r.start);
        merged.push(start..r.end);
    }
    if carry.is_some()
        && let Some(last) = merged.last_mut()
    {
        last.end = text.len();
    }
    merged
}

/// Split `range` into pieces of at most `limit` characters, cutting after the last whitespace
/// inside the window when there is one.
fn hard_split(text: &str, range: Range<usize>, limit: usize) -> Vec<Range<usize>> {
    if measure(&text[range.clone()]) <= limit {
        return vec![range];
    }
    let mut out = Vec::new();
    let mut start = range.start;
    while text[start..range.end].chars().count() > limit {
        let rest = &text[start..range.end];
        let window_end = rest
            .char_indices()
            .nth(limit)
            .map_or(rest.len(), |(i, _)| i);
        let window = &rest[..window_end];
        let lead = window.len() - window.trim_start().len();
        let cut = window
            .char_indices()
            .rev()
            .find(|&(i, c)| c.is_whitespace() && i > lead)
            .map_or(window_end, |(i, c)| i + c.len_utf8());
        out.push(start..start + cut);
        start += cut;
    }
    if start < range.end {
        if text[start..range.end].trim().is_empty() {
            if let Some(last) = out.last_mut() {
                last.end = range.end;
            }
        } else {
            out.push(start..range.end);
        }
    }
    out
}

/// Greedy packing of consecutive pieces into groups whose text measures at most `limit`.
fn pack(text: &str, pieces: &[Range<usize>], limit: usize) -> Vec<Range<usize>> {
    let mut groups = Vec::new();
    if pieces.is_empty() {
        return groups;
    }
    let mut group_start = 0;
    for idx in 1..pieces.len() {
        let candidate = &text[pieces[group_start].start..pieces[idx].end];
        if measure(candidate) > limit {
            groups.push(group_start..idx);
            group_start = idx;
        }
    }
    groups.push(group_start..pieces.len());
    groups
}

/// Byte length of the longest run of trailing pieces of `prev` within `max_chars` characters.
fn sentence_overlap(
    text: &str,
    pieces: &[Range<usize>],
    prev: &Range<usize>,
    max_chars: usize,
) -> usize {
    let mut chars = 0;
    let mut bytes = 0;
    for piece in pieces[prev.clone()].iter().rev() {
        let n = text[piece.clone()].chars().count();
        if chars + n > max_chars {
            break;
        }
        chars += n;
        bytes += piece.len();
    }
    bytes
}

/// Byte length of the last `max_chars` characters of `before`.
fn char_overlap(before: &str, max_chars: usize) -> usize {
    before
        .char_indices()
        .rev()
        .take(max_chars)
        .last()
        .map_or(0, |(i, _)| before.len() - i)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn chunker(min: usize, max: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkerConfig {
            min_chars: min,
            max_chars: max,
            overlap_chars: overlap,
            sentence_aware: true,
        })
        .unwrap()
    }

    fn pages(texts: &[&str]) -> Vec<PageText> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| PageText::new(u32::try_from(i + 1).unwrap(), *t))
            .collect()
    }

    fn assert_tiles(chunks: &[Chunk], pages: &[PageText]) {
        let full: String = pages.iter().map(|p| p.text.as_str()).collect();
        let mut cursor = 0;
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.sequence, i);
            assert_eq!(c.span.start, cursor, "gap or overlap before chunk {i}");
            assert_eq!(c.core_text(), &full[c.span.start..c.span.end]);
            cursor = c.span.end;
        }
        assert_eq!(cursor, full.len());
    }

    #[test]
    fn config_validation() {
        assert!(ChunkerConfig::default().validate().is_ok());
        let bad = ChunkerConfig {
            overlap_chars: 1000,
            ..ChunkerConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = ChunkerConfig {
            min_chars: 2000,
            ..ChunkerConfig::default()
        };
        assert!(Chunker::new(bad).is_err());
    }

    #[test]
    fn single_short_page_is_one_chunk() {
        let p = pages(&["Hello world."]);
        let chunks = chunker(10, 100, 10)
            .chunk(DocumentId(1), 1, &p, Some(1))
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello world.");
        assert_eq!(chunks[0].overlap, 0);
        assert_eq!(chunks[0].page_number, 1);
    }

    #[test]
    fn sentences_are_not_split_when_avoidable() {
        let text = "Alpha beta gamma. Delta epsilon zeta. Eta theta iota. Kappa lambda mu.";
        let p = pages(&[text]);
        let chunks = chunker(0, 40, 0).chunk(DocumentId(1), 1, &p, None).unwrap();
        assert!(chunks.len() > 1);
        for c in &chunks {
            let t = c.text.trim_end();
            assert!(t.ends_with('.'), "chunk split mid-sentence: {t:?}");
            assert!(measure(&c.text) <= 40);
        }
        assert_tiles(&chunks, &p);
    }

    #[test]
    fn overlap_repeats_trailing_sentences() {
        let text = "One two three. Four five six. Seven eight nine. Ten eleven twelve.";
        let p = pages(&[text]);
        let chunks = chunker(0, 50, 20).chunk(DocumentId(1), 1, &p, None).unwrap();
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].overlap, 0);
        let second = &chunks[1];
        assert!(second.overlap > 0);
        let prefix = &second.text[..second.overlap];
        assert!(chunks[0].text.ends_with(prefix));
        assert!(prefix.chars().count() <= 20);
        assert_tiles(&chunks, &p);
    }

    #[test]
    fn chunks_never_cross_pages() {
        let p = pages(&[
            "Page one text. More page one.",
            "Page two text. More page two.",
        ]);
        let chunks = chunker(0, 200, 20).chunk(DocumentId(1), 1, &p, Some(2)).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].page_number, 1);
        assert_eq!(chunks[1].page_number, 2);
        assert_eq!(chunks[1].overlap, 0);
        assert_tiles(&chunks, &p);
    }

    #[test]
    fn blank_pages_are_absorbed() {
        let p = pages(&["  \n", "Real content here.", "\n\n", "More content."]);
        let chunks = chunker(0, 200, 10).chunk(DocumentId(1), 1, &p, None).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].page_number, 2);
        assert_eq!(chunks[1].page_number, 4);
        assert_tiles(&chunks, &p);
    }

    #[test]
    fn long_sentence_is_hard_split_on_whitespace() {
        let text = "word ".repeat(50);
        let p = pages(&[text.as_str()]);
        let chunks = chunker(0, 30, 0).chunk(DocumentId(1), 1, &p, None).unwrap();
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.chars().count() <= 30);
            assert!(!c.text.starts_with("ord"), "split inside a word");
        }
        assert_tiles(&chunks, &p);
    }

    #[test]
    fn edge_whitespace_is_not_counted_toward_max_chars() {
        let text = format!("Short sentence here.{}Next one.", " ".repeat(40));
        let p = pages(&[text.as_str()]);
        let chunks = chunker(0, 30, 0).chunk(DocumentId(1), 1, &p, None).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.chars().count() > 30);
        assert!(measure(&chunks[0].text) <= 30);
        assert_tiles(&chunks, &p);
    }

    #[test]
    fn hard_split_respects_char_boundaries() {
        let text = "é".repeat(100);
        let p = pages(&[text.as_str()]);
        let chunks = chunker(0, 16, 0).chunk(DocumentId(1), 1, &p, None).unwrap();
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 16));
        assert_tiles(&chunks, &p);
    }

    #[test]
    fn undersized_tail_merges_into_predecessor() {
        // Core limit is 32, so packing alone leaves "Tiny." on its own.
        let text = "Alpha bravo charlie delta echo. Tiny.";
        let p = pages(&[text]);
        let chunks = chunker(10, 40, 8).chunk(DocumentId(1), 1, &p, None).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_tiles(&chunks, &p);

        let roomy = chunker(2, 40, 8).chunk(DocumentId(1), 1, &p, None).unwrap();
        assert_eq!(roomy.len(), 2);
    }

    #[test]
    fn bbox_is_union_of_intersecting_blocks() {
        let text = "Header line. Body text follows here.";
        let page = PageText::new(1, text)
            .with_block(0..12, BoundingBox::new(10.0, 10.0, 200.0, 30.0))
            .with_block(13..text.len(), BoundingBox::new(10.0, 40.0, 300.0, 80.0));
        let chunks = chunker(0, 200, 0)
            .chunk(DocumentId(1), 1, &[page], None)
            .unwrap();
        assert_eq!(
            chunks[0].bbox,
            Some(BoundingBox::new(10.0, 10.0, 300.0, 80.0))
        );
    }

    #[test]
    fn empty_text_is_malformed() {
        let err = chunker(0, 100, 0)
            .chunk(DocumentId(1), 1, &pages(&["   ", "\n"]), None)
            .unwrap_err();
        assert!(matches!(err, DocumentError::MalformedInput(_)));
        let err = chunker(0, 100, 0)
            .chunk(DocumentId(1), 1, &[], None)
            .unwrap_err();
        assert!(matches!(err, DocumentError::MalformedInput(_)));
    }

    #[test]
    fn page_count_mismatch_is_malformed() {
        let err = chunker(0, 100, 0)
            .chunk(DocumentId(1), 1, &pages(&["a.", "b."]), Some(3))
            .unwrap_err();
        assert!(matches!(err, DocumentError::MalformedInput(_)));
    }

    #[test]
    fn non_consecutive_pages_are_malformed() {
        let p = vec![PageText::new(1, "a."), PageText::new(3, "b.")];
        assert!(chunker(0, 100, 0).chunk(DocumentId(1), 1, &p, None).is_err());
    }

    #[test]
    fn out_of_bounds_block_is_malformed() {
        let page =
            PageText::new(1, "short").with_block(0..50, BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        assert!(chunker(0, 100, 0).chunk(DocumentId(1), 1, &[page], None).is_err());
    }

    #[test]
    fn char_mode_uses_trailing_characters_for_overlap() {
        let c = Chunker::new(ChunkerConfig {
            min_chars: 0,
            max_chars: 20,
            overlap_chars: 5,
            sentence_aware: false,
        })
        .unwrap();
        let p = pages(&["abcdefghijklmnopqrstuvwxyz0123456789"]);
        let chunks = c.chunk(DocumentId(1), 1, &p, None).unwrap();
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[1].overlap, 5);
        assert_tiles(&chunks, &p);
    }

    #[test]
    fn ids_are_stable_across_runs() {
        let p = pages(&["Same text. Every time."]);
        let a = chunker(0, 100, 0).chunk(DocumentId(4), 2, &p, None).unwrap();
        let b = chunker(0, 100, 0).chunk(DocumentId(4), 2, &p, None).unwrap();
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn spans_reconstruct_text(
            texts in prop::collection::vec("[a-zé .!?\n]{0,300}", 1..5),
            max in 20usize..200,
            overlap_pct in 0usize..50,
        ) {
            prop_assume!(texts.iter().any(|t| !t.trim().is_empty()));
            let overlap = max * overlap_pct / 100;
            let c = chunker(0, max, overlap);
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            let p = pages(&refs);
            let chunks = c.chunk(DocumentId(1), 1, &p, Some(p.len())).unwrap();
            let full: String = p.iter().map(|p| p.text.as_str()).collect();
            let mut cursor = 0;
            for chunk in &chunks {
                prop_assert_eq!(chunk.span.start, cursor);
                prop_assert!(chunk.span.end > chunk.span.start);
                prop_assert!(measure(chunk.core_text()) <= max - overlap);
                let visible = chunk.text.chars().filter(|c| !c.is_whitespace()).count();
                prop_assert!(visible <= max, "chunk holds {} visible chars, max {}", visible, max);
                let with_overlap = &full[chunk.span.start - chunk.overlap..chunk.span.end];
                prop_assert_eq!(&chunk.text, with_overlap);
                cursor = chunk.span.end;
            }
            prop_assert_eq!(cursor, full.len());
        }
    }
}
