//! Inline emphasis and legal-term highlighting.
//!
//! Emphasis is found by one alternating scan where the first alternative that
//! matches at a position wins; there is no nesting and no escaping. Legal
//! terms are highlighted inside emphasis content and inside the plain text
//! between emphasis spans.

use once_cell::sync::Lazy;
use regex::Regex;

/// `**x**`, `__x__`, `*x*`, `_x_`, tried in that order.
static EMPHASIS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\*\*(.*?)\*\*|__(.*?)__|\*(.*?)\*|_(.*?)_").expect("emphasis pattern")
});

/// Article, law, prime-minister decree and circular-letter references.
static LEGAL_TERMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"المادة رقم [0-9]+",
        r"|قانون رقم [0-9]+ لسنة [0-9]+",
        r"|قرار رئيس مجلس الوزراء رقم [0-9]+ لسنة [0-9]+",
        r"|الكتاب الدوري رقم [0-9]+",
    ))
    .expect("legal term pattern")
});

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inline {
    Text(String),
    LegalTerm(String),
    Bold(Vec<Inline>),
    Italic(Vec<Inline>),
}

pub fn format_inline(text: &str) -> Vec<Inline> {
    let mut parts = Vec::new();
    let mut last = 0;

    for caps in EMPHASIS.captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        if whole.start() > last {
            parts.extend(highlight_legal(&text[last..whole.start()]));
        }
        if let Some(inner) = caps.get(1).or_else(|| caps.get(2)) {
            parts.push(Inline::Bold(highlight_legal(inner.as_str())));
        } else if let Some(inner) = caps.get(3).or_else(|| caps.get(4)) {
            parts.push(Inline::Italic(highlight_legal(inner.as_str())));
        }
        last = whole.end();
    }

    if last < text.len() {
        parts.extend(highlight_legal(&text[last..]));
    }
    parts
}

fn highlight_legal(text: &str) -> Vec<Inline> {
    let mut parts = Vec::new();
    let mut last = 0;
    for found in LEGAL_TERMS.find_iter(text) {
        if found.start() > last {
            parts.push(Inline::Text(text[last..found.start()].to_string()));
        }
        parts.push(Inline::LegalTerm(found.as_str().to_string()));
        last = found.end();
    }
    if last < text.len() {
        parts.push(Inline::Text(text[last..].to_string()));
    }
    parts
}

/// Visible text of formatted parts, without emphasis markers.
pub fn plain_text(parts: &[Inline]) -> String {
    let mut out = String::new();
    push_plain(parts, &mut out);
    out
}

fn push_plain(parts: &[Inline], out: &mut String) {
    for part in parts {
        match part {
            Inline::Text(text) | Inline::LegalTerm(text) => out.push_str(text),
            Inline::Bold(inner) | Inline::Italic(inner) => push_plain(inner, out),
        }
    }
}
