use super::block::{BlockKind, BlockNode};
use super::citation::Segment;
use super::inline::Inline;
use crate::types::{ChatMessage, Source};
use std::fmt::Write;

pub fn blocks_to_html(blocks: &[BlockNode]) -> String {
    let mut html = String::new();
    for block in blocks {
        match &block.kind {
            BlockKind::Heading { level, content } => {
                let _ = write!(html, "<h{level}>");
                push_segments(&mut html, content);
                let _ = write!(html, "</h{level}>");
            }
            BlockKind::UnorderedList(items) => push_list(&mut html, "ul", items),
            BlockKind::OrderedList(items) => push_list(&mut html, "ol", items),
            BlockKind::Paragraph(content) => {
                html.push_str("<p>");
                push_segments(&mut html, content);
                html.push_str("</p>");
            }
        }
    }
    html
}

/// Numbered source list; each entry carries the anchor cited spans link to.
pub fn sources_to_html(sources: &[Source], message_index: usize) -> String {
    if sources.is_empty() {
        return String::new();
    }
    let mut html = String::from("<ol class=\"sources\">");
    for (index, source) in sources.iter().enumerate() {
        let _ = write!(
            html,
            "<li id=\"source-{message_index}-{index}\"><a href=\"{}\" target=\"_blank\" rel=\"noopener noreferrer\" title=\"{}\">{}</a></li>",
            escape(&source.uri),
            escape(&source.title),
            escape(&source_label(source)),
        );
    }
    html.push_str("</ol>");
    html
}

/// Title of a source, or the host of its URI when the title is empty.
pub fn source_label(source: &Source) -> String {
    if !source.title.trim().is_empty() {
        return source.title.clone();
    }
    reqwest::Url::parse(&source.uri)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| source.uri.clone())
}

pub fn message_to_html(message: &ChatMessage, message_index: usize) -> String {
    if !message.is_model() {
        return format!("<p>{}</p>", escape(&message.text));
    }
    let blocks = super::block::render_blocks(&message.text, message.citations(), message_index);
    let mut html = blocks_to_html(&blocks);
    html.push_str(&sources_to_html(message.sources(), message_index));
    html
}

fn push_list(html: &mut String, tag: &str, items: &[Vec<Segment>]) {
    let _ = write!(html, "<{tag}>");
    for item in items {
        html.push_str("<li>");
        push_segments(html, item);
        html.push_str("</li>");
    }
    let _ = write!(html, "</{tag}>");
}

fn push_segments(html: &mut String, segments: &[Segment]) {
    for segment in segments {
        match segment {
            Segment::Plain(content) => push_inline(html, content),
            Segment::Cited { content, anchor } => {
                html.push_str("<span class=\"citation\">");
                push_inline(html, content);
                let _ = write!(
                    html,
                    "<sup><a href=\"#{}\" title=\"Source {}\">{}</a></sup></span>",
                    anchor.id(),
                    anchor.source_index + 1,
                    anchor.label(),
                );
            }
        }
    }
}

fn push_inline(html: &mut String, parts: &[Inline]) {
    for part in parts {
        match part {
            Inline::Text(text) => html.push_str(&escape(text)),
            Inline::LegalTerm(text) => {
                let _ = write!(html, "<strong class=\"legal-term\">{}</strong>", escape(text));
            }
            Inline::Bold(inner) => {
                html.push_str("<strong>");
                push_inline(html, inner);
                html.push_str("</strong>");
            }
            Inline::Italic(inner) => {
                html.push_str("<em>");
                push_inline(html, inner);
                html.push_str("</em>");
            }
        }
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
