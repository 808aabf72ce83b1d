use super::inline::{Inline, format_inline, plain_text};
use crate::types::Citation;

/// Anchor of a source entry, keyed by message and source position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceAnchor {
    pub message_index: usize,
    pub source_index: usize,
}

impl SourceAnchor {
    pub fn id(&self) -> String {
        format!("source-{}-{}", self.message_index, self.source_index)
    }

    /// One-based label shown next to the cited span, e.g. `[2]`.
    pub fn label(&self) -> String {
        format!("[{}]", self.source_index + 1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    Plain(Vec<Inline>),
    Cited {
        content: Vec<Inline>,
        anchor: SourceAnchor,
    },
}

impl Segment {
    pub fn plain_text(&self) -> String {
        match self {
            Segment::Plain(content) | Segment::Cited { content, .. } => plain_text(content),
        }
    }
}

/// Splits `block` into plain and cited segments.
///
/// `block_offset` is the `char` offset of the block inside the full message
/// text. Citations are clamped to the block; where they overlap, the one that
/// sorts later (by start, stable) paints over the earlier one.
pub fn overlay_citations(
    block: &str,
    citations: &[Citation],
    block_offset: usize,
    message_index: usize,
) -> Vec<Segment> {
    let bounds: Vec<usize> = block
        .char_indices()
        .map(|(at, _)| at)
        .chain(std::iter::once(block.len()))
        .collect();
    let len = bounds.len() - 1;
    let block_end = block_offset + len;

    let mut relevant: Vec<&Citation> = citations
        .iter()
        .filter(|c| c.start_index < c.end_index)
        .filter(|c| c.end_index > block_offset && c.start_index < block_end)
        .collect();
    relevant.sort_by_key(|c| c.start_index);

    let mut owner: Vec<Option<usize>> = vec![None; len];
    for (slot, citation) in relevant.iter().enumerate() {
        let local_start = citation.start_index.saturating_sub(block_offset);
        let local_end = (citation.end_index - block_offset).min(len);
        for cell in &mut owner[local_start..local_end] {
            *cell = Some(slot);
        }
    }

    let mut segments = Vec::new();
    let mut run_start = 0;
    while run_start < len {
        let current = owner[run_start];
        let mut run_end = run_start + 1;
        while run_end < len && owner[run_end] == current {
            run_end += 1;
        }
        let content = format_inline(&block[bounds[run_start]..bounds[run_end]]);
        segments.push(match current {
            None => Segment::Plain(content),
            Some(slot) => Segment::Cited {
                content,
                anchor: SourceAnchor {
                    message_index,
                    source_index: relevant[slot].source_index,
                },
            },
        });
        run_start = run_end;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cite(start_index: usize, end_index: usize, source_index: usize) -> Citation {
        Citation {
            start_index,
            end_index,
            source_index,
        }
    }

    fn describe(segments: &[Segment]) -> Vec<(String, Option<usize>)> {
        segments
            .iter()
            .map(|segment| match segment {
                Segment::Plain(_) => (segment.plain_text(), None),
                Segment::Cited { anchor, .. } => (segment.plain_text(), Some(anchor.source_index)),
            })
            .collect()
    }

    #[test]
    fn no_citations_is_one_plain_segment() {
        let segments = overlay_citations("نص عادي", &[], 0, 0);
        assert_eq!(describe(&segments), vec![("نص عادي".to_string(), None)]);
    }

    #[test]
    fn gap_citation_and_tail() {
        let segments = overlay_citations("abcdefgh", &[cite(2, 5, 1)], 0, 3);
        assert_eq!(
            describe(&segments),
            vec![
                ("ab".to_string(), None),
                ("cde".to_string(), Some(1)),
                ("fgh".to_string(), None),
            ]
        );
        match &segments[1] {
            Segment::Cited { anchor, .. } => {
                assert_eq!(anchor.id(), "source-3-1");
                assert_eq!(anchor.label(), "[2]");
            }
            other => panic!("expected cited segment, got {other:?}"),
        }
    }

    #[test]
    fn citations_are_sorted_by_start() {
        let segments = overlay_citations("abcdef", &[cite(4, 6, 1), cite(0, 2, 0)], 0, 0);
        assert_eq!(
            describe(&segments),
            vec![
                ("ab".to_string(), Some(0)),
                ("cd".to_string(), None),
                ("ef".to_string(), Some(1)),
            ]
        );
    }

    #[test]
    fn offsets_are_relative_to_block_and_clamped() {
        // Block "world" starts at offset 7 of "hello\n\nworld".
        let segments = overlay_citations("world", &[cite(3, 9, 0)], 7, 0);
        assert_eq!(
            describe(&segments),
            vec![("wo".to_string(), Some(0)), ("rld".to_string(), None)]
        );
    }

    #[test]
    fn citation_past_text_end_is_clamped() {
        let segments = overlay_citations("abc", &[cite(1, 50, 0)], 0, 0);
        assert_eq!(
            describe(&segments),
            vec![("a".to_string(), None), ("bc".to_string(), Some(0))]
        );
    }

    #[test]
    fn citations_outside_block_and_empty_ranges_are_ignored() {
        let segments = overlay_citations("abc", &[cite(10, 12, 0), cite(1, 1, 0), cite(2, 1, 0)], 0, 0);
        assert_eq!(describe(&segments), vec![("abc".to_string(), None)]);
    }

    #[test]
    fn later_overlapping_citation_paints_over() {
        let segments = overlay_citations("abcdefghij", &[cite(0, 6, 0), cite(3, 8, 1)], 0, 0);
        assert_eq!(
            describe(&segments),
            vec![
                ("abc".to_string(), Some(0)),
                ("defgh".to_string(), Some(1)),
                ("ij".to_string(), None),
            ]
        );
    }

    #[test]
    fn offsets_count_characters_not_bytes() {
        let segments = overlay_citations("مرحبا بك", &[cite(0, 5, 0)], 0, 0);
        assert_eq!(
            describe(&segments),
            vec![("مرحبا".to_string(), Some(0)), (" بك".to_string(), None)]
        );
    }

    #[test]
    fn cited_text_is_formatted() {
        let segments = overlay_citations("**مهم** جدا", &[cite(0, 7, 0)], 0, 0);
        match &segments[0] {
            Segment::Cited { content, .. } => {
                assert_eq!(content, &vec![Inline::Bold(vec![Inline::Text("مهم".into())])]);
            }
            other => panic!("expected cited segment, got {other:?}"),
        }
    }

    #[test]
    fn empty_block_has_no_segments() {
        assert!(overlay_citations("", &[cite(0, 3, 0)], 0, 0).is_empty());
    }
}
