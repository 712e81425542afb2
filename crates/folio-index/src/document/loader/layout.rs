//! Estimated page geometry for loaders whose source carries no layout.
//!
//! Paragraphs are laid out top to bottom in a single column on a US Letter page with one-inch
//! margins, in a fixed-pitch grid. The boxes are approximate but stable, which is enough for
//! region queries to relate a rectangle to the text near it.

use crate::document::types::{BoundingBox, PageText, TextBlock};

const MARGIN: f32 = 72.0;
const PAGE_WIDTH: f32 = 612.0;
const CHAR_WIDTH: f32 = 6.0;
const LINE_HEIGHT: f32 = 12.0;
/// Characters that fit between the margins.
const COLUMN_CHARS: usize = 78;

/// One block per paragraph (run of non-blank lines) of `text`.
#[must_use]
pub(crate) fn paragraph_blocks(text: &str) -> Vec<TextBlock> {
    let mut blocks = Vec::new();
    // (byte start, first row, widest line in chars, rows so far)
    let mut open: Option<(usize, usize, usize, usize)> = None;
    let mut end = 0;
    let mut row = 0;

    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let start = offset;
        offset += line.len();
        let content = line.trim_end();
        let rows = content.chars().count().div_ceil(COLUMN_CHARS).max(1);

        if content.trim_start().is_empty() {
            if let Some(block) = open.take() {
                blocks.push(close(block, end));
            }
        } else {
            let chars = content.chars().count().min(COLUMN_CHARS);
            let lead = content.len() - content.trim_start().len();
            let entry = open.get_or_insert((start + lead, row, 0, 0));
            entry.2 = entry.2.max(chars);
            entry.3 += rows;
            end = start + content.len();
        }
        row += rows;
    }
    if let Some(block) = open {
        blocks.push(close(block, end));
    }
    blocks
}

#[allow(clippy::cast_precision_loss)]
fn close((start, first_row, width, rows): (usize, usize, usize, usize), end: usize) -> TextBlock {
    let y0 = MARGIN + first_row as f32 * LINE_HEIGHT;
    let x1 = (MARGIN + width as f32 * CHAR_WIDTH).min(PAGE_WIDTH - MARGIN);
    TextBlock {
        range: start..end,
        bbox: BoundingBox::new(MARGIN, y0, x1, y0 + rows as f32 * LINE_HEIGHT),
    }
}

/// Attach estimated paragraph blocks to a page that has none.
#[must_use]
pub(crate) fn with_estimated_layout(mut page: PageText) -> PageText {
    if page.blocks.is_empty() {
        page.blocks = paragraph_blocks(&page.text);
    }
    page
}
