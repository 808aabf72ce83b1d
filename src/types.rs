use serde::{Deserialize, Serialize};

/// Title given to a freshly created session.
pub const DEFAULT_SESSION_TITLE: &str = "محادثة جديدة";

/// Title used when title generation fails or returns nothing.
pub const UNTITLED_SESSION_TITLE: &str = "محادثة غير معنونة";

/// Text of the synthetic MODEL message appended when a stream fails.
pub const STREAM_ERROR_TEXT: &str = "عذراً، حدث خطأ ما. يرجى المحاولة مرة أخرى.";

/// Prompts offered on the welcome screen of an empty session.
pub const EXAMPLE_PROMPTS: [&str; 4] = [
    "ما هي شروط القبول بكلية الحقوق؟",
    "اشرح لي لائحة الساعات المعتمدة.",
    "ما هي الإجراءات التأديبية للطالب؟",
    "لخص لي قانون تنظيم الجامعات.",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub uri: String,
    pub title: String,
}

/// A cited span of a message, in `char` offsets into the message text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub start_index: usize,
    pub end_index: usize,
    pub source_index: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Source>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<Citation>>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>, image_url: Option<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            image_url,
            sources: None,
            citations: None,
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
            image_url: None,
            sources: None,
            citations: None,
        }
    }

    pub fn is_model(&self) -> bool {
        matches!(self.role, Role::Model)
    }

    pub fn sources(&self) -> &[Source] {
        self.sources.as_deref().unwrap_or_default()
    }

    pub fn citations(&self) -> &[Citation] {
        self.citations.as_deref().unwrap_or_default()
    }

    /// Appends sources whose `uri` is not already known, keeping discovery order.
    ///
    /// Accepts both cumulative and incremental lists.
    pub fn merge_sources(&mut self, incoming: &[Source]) {
        if incoming.is_empty() {
            return;
        }
        let sources = self.sources.get_or_insert_with(Vec::new);
        for source in incoming {
            if !sources.iter().any(|existing| existing.uri == source.uri) {
                sources.push(source.clone());
            }
        }
    }

    /// Replaces the citation snapshot wholesale.
    pub fn replace_citations(&mut self, citations: Vec<Citation>) {
        self.citations = Some(citations);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(uri: &str) -> Source {
        Source {
            uri: uri.to_string(),
            title: uri.to_string(),
        }
    }

    #[test]
    fn merge_sources_skips_known_uris() {
        let mut msg = ChatMessage::model("");
        msg.merge_sources(&[source("https://a"), source("https://b")]);
        msg.merge_sources(&[source("https://b"), source("https://c"), source("https://a")]);
        let uris: Vec<_> = msg.sources().iter().map(|s| s.uri.as_str()).collect();
        assert_eq!(uris, vec!["https://a", "https://b", "https://c"]);
    }

    #[test]
    fn session_json_uses_camel_case() {
        let session = ChatSession {
            id: "chat-1".into(),
            title: DEFAULT_SESSION_TITLE.into(),
            messages: vec![ChatMessage {
                citations: Some(vec![Citation {
                    start_index: 0,
                    end_index: 4,
                    source_index: 0,
                }]),
                ..ChatMessage::model("نص")
            }],
            created_at: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("\"createdAt\":1700000000000"));
        assert!(json.contains("\"startIndex\":0"));
        assert!(json.contains("\"role\":\"model\""));
        assert!(!json.contains("imageUrl"));
    }
}
