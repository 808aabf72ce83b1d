/// Rendering of message text into citation-annotated blocks.
///
/// - `inline` - emphasis and legal-term highlighting inside a run of text
/// - `citation` - splits a block into plain and cited segments
/// - `block` - blank-line block splitting and classification
/// - `html` - HTML output for the rendering surface
mod block;
mod citation;
pub mod html;
mod inline;

pub use block::{BlockKind, BlockNode, render_blocks};
pub use citation::{Segment, SourceAnchor, overlay_citations};
pub use inline::{Inline, format_inline, plain_text};

use crate::types::{ChatMessage, Citation};
use std::collections::HashMap;
use std::sync::Arc;

/// Renders one message. USER text is shown as-is in a single paragraph.
pub fn render_message(message: &ChatMessage, message_index: usize) -> Vec<BlockNode> {
    if message.is_model() {
        return render_blocks(&message.text, message.citations(), message_index);
    }
    vec![BlockNode {
        offset: 0,
        source: message.text.clone(),
        kind: BlockKind::Paragraph(vec![Segment::Plain(vec![Inline::Text(message.text.clone())])]),
    }]
}

/// Memoized block rendering keyed on `(text, citations)` per message index.
#[derive(Default)]
pub struct RenderCache {
    entries: HashMap<usize, CacheEntry>,
}

struct CacheEntry {
    text: String,
    citations: Vec<Citation>,
    blocks: Arc<[BlockNode]>,
}

impl RenderCache {
    pub fn render(&mut self, message_index: usize, text: &str, citations: &[Citation]) -> Arc<[BlockNode]> {
        if let Some(entry) = self.entries.get(&message_index)
            && entry.text == text
            && entry.citations == citations
        {
            return Arc::clone(&entry.blocks);
        }
        let blocks: Arc<[BlockNode]> = render_blocks(text, citations, message_index).into();
        self.entries.insert(
            message_index,
            CacheEntry {
                text: text.to_string(),
                citations: citations.to_vec(),
                blocks: Arc::clone(&blocks),
            },
        );
        blocks
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hits_on_identical_input() {
        let mut cache = RenderCache::default();
        let citations = [Citation {
            start_index: 0,
            end_index: 3,
            source_index: 0,
        }];
        let first = cache.render(1, "نص مقتبس", &citations);
        let second = cache.render(1, "نص مقتبس", &citations);
        assert!(Arc::ptr_eq(&first, &second));

        let grown = cache.render(1, "نص مقتبس أطول", &citations);
        assert!(!Arc::ptr_eq(&first, &grown));
    }

    #[test]
    fn rendering_is_idempotent() {
        let text = "# عنوان\n\n* بند **مهم**\n* قانون رقم 49 لسنة 1972";
        let citations = [Citation {
            start_index: 11,
            end_index: 20,
            source_index: 1,
        }];
        assert_eq!(render_blocks(text, &citations, 0), render_blocks(text, &citations, 0));
    }

    #[test]
    fn user_messages_skip_markdown() {
        let blocks = render_message(&ChatMessage::user("**لا تنسيق**\n\nسطر", None), 0);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].source, "**لا تنسيق**\n\nسطر");
    }
}
