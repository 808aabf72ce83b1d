use super::citation::{Segment, overlay_citations};
use crate::types::Citation;
use once_cell::sync::Lazy;
use regex::Regex;

const BLOCK_SEPARATOR: &str = "\n\n";

static ORDERED_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+\.\s").expect("ordered list pattern"));

const HEADINGS: [(u8, &str); 3] = [(3, "### "), (2, "## "), (1, "# ")];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Heading { level: u8, content: Vec<Segment> },
    UnorderedList(Vec<Vec<Segment>>),
    OrderedList(Vec<Vec<Segment>>),
    Paragraph(Vec<Segment>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockNode {
    /// `char` offset of the block inside the full message text.
    pub offset: usize,
    /// Raw block text as it appears in the message.
    pub source: String,
    pub kind: BlockKind,
}

impl BlockNode {
    /// Every segment of the block in reading order, list items flattened.
    pub fn segments(&self) -> Box<dyn Iterator<Item = &Segment> + '_> {
        match &self.kind {
            BlockKind::Heading { content, .. } | BlockKind::Paragraph(content) => Box::new(content.iter()),
            BlockKind::UnorderedList(items) | BlockKind::OrderedList(items) => Box::new(items.iter().flatten()),
        }
    }
}

/// Splits `text` into blocks on blank lines and renders each one.
///
/// Always works on the whole text: while a response streams in, only the last
/// block grows, but its classification may change as lines arrive.
pub fn render_blocks(text: &str, citations: &[Citation], message_index: usize) -> Vec<BlockNode> {
    let mut offset = 0;
    let mut blocks = Vec::new();
    for block in text.split(BLOCK_SEPARATOR) {
        blocks.push(BlockNode {
            offset,
            source: block.to_string(),
            kind: classify(block, offset, citations, message_index),
        });
        offset += block.chars().count() + BLOCK_SEPARATOR.len();
    }
    blocks
}

fn classify(block: &str, offset: usize, citations: &[Citation], message_index: usize) -> BlockKind {
    for (level, marker) in HEADINGS {
        if let Some(content) = block.strip_prefix(marker) {
            return BlockKind::Heading {
                level,
                content: overlay_citations(content, citations, offset + marker.len(), message_index),
            };
        }
    }

    let lines = non_blank_lines(block);
    if lines.is_empty() {
        return BlockKind::Paragraph(overlay_citations(block, citations, offset, message_index));
    }

    let render_items = |strip: fn(&str) -> Option<usize>| -> Vec<Vec<Segment>> {
        lines
            .iter()
            .map(|line| {
                let marker = strip(line.trimmed).unwrap_or(0);
                let content: String = line.trimmed.chars().skip(marker).collect();
                let content_offset = offset + line.start + line.indent + marker;
                overlay_citations(&content, citations, content_offset, message_index)
            })
            .collect()
    };

    if lines.iter().all(|line| unordered_marker(line.trimmed).is_some()) {
        return BlockKind::UnorderedList(render_items(unordered_marker));
    }
    if lines.iter().all(|line| ordered_marker(line.trimmed).is_some()) {
        return BlockKind::OrderedList(render_items(ordered_marker));
    }
    BlockKind::Paragraph(overlay_citations(block, citations, offset, message_index))
}

struct Line<'a> {
    /// `char` offset of the line inside its block.
    start: usize,
    /// Leading whitespace removed by trimming, in `char`s.
    indent: usize,
    trimmed: &'a str,
}

fn non_blank_lines(block: &str) -> Vec<Line<'_>> {
    let mut start = 0;
    let mut lines = Vec::new();
    for raw in block.split('\n') {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            lines.push(Line {
                start,
                indent: raw.chars().take_while(|c| c.is_whitespace()).count(),
                trimmed,
            });
        }
        start += raw.chars().count() + 1;
    }
    lines
}

/// Length in `char`s of a leading `* ` or `- ` marker.
fn unordered_marker(line: &str) -> Option<usize> {
    (line.starts_with("* ") || line.starts_with("- ")).then_some(2)
}

/// Length in `char`s of a leading `<digits>. ` marker.
fn ordered_marker(line: &str) -> Option<usize> {
    ORDERED_MARKER
        .find(line)
        .map(|found| line[..found.end()].chars().count())
}
