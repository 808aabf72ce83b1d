use crate::types::{ChatMessage, Citation, Role, Source, UNTITLED_SESSION_TITLE};
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

// ============================================
// Error Types
// ============================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatError {
    /// The caller cancelled the request; never shown as a failure.
    #[error("generation cancelled")]
    Cancelled,

    #[error("{0}")]
    Transport(String),

    #[error("Gemini error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("undecodable response: {0}")]
    Decode(String),
}

impl ChatError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::new(err.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Decode(err.to_string())
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

// ============================================
// Generation Capability
// ============================================

/// One unit of a streamed response.
///
/// `sources` may be cumulative or incremental; `citations` is always a full
/// replacement snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamChunk {
    pub text: Option<String>,
    pub sources: Option<Vec<Source>>,
    pub citations: Option<Vec<Citation>>,
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_sources(mut self, sources: Vec<Source>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn with_citations(mut self, citations: Vec<Citation>) -> Self {
        self.citations = Some(citations);
        self
    }
}

pub type ChunkStream = BoxStream<'static, ChatResult<StreamChunk>>;

#[async_trait]
pub trait LLMBackend: Send + Sync {
    /// Starts generating a reply to `history` (which ends with the new user message).
    ///
    /// The returned stream yields `ChatError::Cancelled` once `cancel` fires.
    async fn stream(&self, history: &[ChatMessage], cancel: CancellationToken) -> ChatResult<ChunkStream>;

    /// Produces a short session title from the first user/model exchange.
    async fn title(&self, exchange: &[ChatMessage]) -> ChatResult<String>;
}

const TITLE_EXCERPT_CHARS: usize = 200;

pub fn title_prompt(exchange: &[ChatMessage]) -> String {
    let first_text = |role: Role| {
        exchange
            .iter()
            .find(|m| m.role == role)
            .map(|m| m.text.as_str())
            .unwrap_or_default()
    };
    let excerpt: String = first_text(Role::Model).chars().take(TITLE_EXCERPT_CHARS).collect();
    format!(
        "Generate a very short, concise title in Arabic for the following conversation. The title should be no more than 5 words.\n\nUser: {}\nModel: {}...",
        first_text(Role::User),
        excerpt
    )
}

/// Trims a generated title and strips quotes; falls back when nothing is left.
pub fn clean_title(raw: &str) -> String {
    let title = raw.trim().replace('"', "");
    if title.is_empty() {
        UNTITLED_SESSION_TITLE.to_string()
    } else {
        title
    }
}
