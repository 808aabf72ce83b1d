use super::client::{ChatError, ChatResult, ChunkStream, LLMBackend, StreamChunk, clean_title, title_prompt};
use crate::config::Settings;
use crate::types::{ChatMessage, Citation, DEFAULT_SESSION_TITLE, Role, Source};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

const SYSTEM_INSTRUCTION: &str = "You are an expert AI legal assistant specializing in Egyptian administrative law, university regulations, student affairs bylaws, and the credit hour system (لوائح الساعات المعتمدة). Your primary goal is to provide accurate, well-supported, and clearly formatted answers based on reliable sources. You must adhere to the following guidelines:\n1.  **Cite Sources:** Back up every key piece of information with a citation. Use the format `[Source X]` at the end of the sentence.\n2.  **Format Responses:** Use Markdown for clarity (e.g., headings, lists, bold text) to structure your answers logically.\n3.  **Synthesize, Don't Copy:** Integrate information from multiple sources to provide comprehensive answers. Avoid direct copy-pasting.\n4.  **Language:** Respond exclusively in Arabic.\n5.  **Clarity and Conciseness:** Write clearly and directly, making complex legal topics understandable to a non-expert audience.\n6.  **Grounding is Key:** Base your answers ONLY on the information found in the provided search results. Do not use any prior knowledge.";

pub struct GeminiBackend {
    client: Client,
    api_base: String,
    model: String,
    api_key: String,
}

impl GeminiBackend {
    pub fn new(settings: &Settings) -> Self {
        Self {
            client: Client::new(),
            api_base: settings.api_base.clone(),
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/models/{}:{}", self.api_base, self.model, method)
    }
}

// ============================================
// Request types
// ============================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }
}

fn to_content(message: &ChatMessage) -> Content {
    let mut parts = vec![Part::text(message.text.clone())];
    if message.role == Role::User
        && let Some(url) = &message.image_url
    {
        match split_data_uri(url) {
            Some((mime_type, data)) => parts.push(Part {
                text: None,
                inline_data: Some(InlineData {
                    mime_type: mime_type.to_string(),
                    data: data.to_string(),
                }),
            }),
            None => tracing::warn!("dropping attachment that is not a base64 data URI"),
        }
    }
    Content {
        role: Some(match message.role {
            Role::User => "user",
            Role::Model => "model",
        }),
        parts,
    }
}

/// Splits `data:<mime>;base64,<payload>` into mime type and payload.
fn split_data_uri(url: &str) -> Option<(&str, &str)> {
    let (mime_part, data) = url.split_once(";base64,")?;
    Some((mime_part.trim_start_matches("data:"), data))
}

// ============================================
// Response types
// ============================================

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<CandidateContent>,
    #[serde(default)]
    pub grounding_metadata: Option<GroundingMetadata>,
    #[serde(default)]
    pub citation_metadata: Option<CitationMetadata>,
}

#[derive(Deserialize, Debug, Default)]
pub struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ResponsePart {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GroundingMetadata {
    #[serde(default)]
    pub grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Deserialize, Debug, Default)]
pub struct GroundingChunk {
    #[serde(default)]
    pub web: Option<WebChunk>,
}

#[derive(Deserialize, Debug, Default)]
pub struct WebChunk {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CitationMetadata {
    #[serde(default, alias = "citations")]
    pub citation_sources: Vec<CitationSource>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CitationSource {
    #[serde(default)]
    pub start_index: Option<usize>,
    #[serde(default)]
    pub end_index: Option<usize>,
    #[serde(default)]
    pub uri: Option<String>,
}

impl GenerateResponse {
    /// Concatenated text parts of the first candidate.
    pub fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|part| part.text.as_deref())
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub fn parse_gemini_sse_data(data: &str) -> Option<GenerateResponse> {
    let trimmed = data.trim();
    if trimmed.is_empty() || trimmed == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<GenerateResponse>(trimmed) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::debug!("skipping undecodable SSE event: {}", err);
            None
        }
    }
}

// ============================================
// SSE decoding
// ============================================

/// Incremental `text/event-stream` decoder.
///
/// Works on raw bytes and only decodes complete lines, so a multi-byte
/// character split across two reads survives intact.
#[derive(Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    data: Option<String>,
}

impl SseDecoder {
    /// Feeds bytes and returns the `data` payloads of every completed event.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(data) = self.accept_line(&line[..pos]) {
                events.push(data);
            }
        }
        events
    }

    /// Flushes an event left open when the body ends without a blank line.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            if let Some(data) = self.accept_line(&line) {
                return Some(data);
            }
        }
        self.data.take()
    }

    fn accept_line(&mut self, raw: &[u8]) -> Option<String> {
        let mut line = String::from_utf8_lossy(raw).into_owned();
        if line.ends_with('\r') {
            line.pop();
        }
        if line.is_empty() {
            return self.data.take();
        }
        if let Some(rest) = line.strip_prefix("data:") {
            let fragment = rest.trim_start();
            match &mut self.data {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(fragment);
                }
                None => self.data = Some(fragment.to_string()),
            }
        }
        None
    }
}

// ============================================
// Grounding accumulation
// ============================================

/// Per-stream accumulation of text, sources and the latest citation snapshot.
#[derive(Default)]
pub struct GroundingAccumulator {
    full_text: String,
    sources: Vec<Source>,
    citations: Vec<Citation>,
}

impl GroundingAccumulator {
    pub fn apply(&mut self, response: GenerateResponse) -> StreamChunk {
        let text = response.text();
        self.full_text.push_str(&text);

        if let Some(candidate) = response.candidates.into_iter().next() {
            if let Some(grounding) = candidate.grounding_metadata {
                self.merge_sources(grounding.grounding_chunks);
            }
            if let Some(metadata) = candidate.citation_metadata {
                self.citations = self.resolve_citations(metadata.citation_sources);
            }
        }

        StreamChunk {
            text: (!text.is_empty()).then_some(text),
            sources: (!self.sources.is_empty()).then(|| self.sources.clone()),
            citations: (!self.citations.is_empty()).then(|| self.citations.clone()),
        }
    }

    fn merge_sources(&mut self, chunks: Vec<GroundingChunk>) {
        for web in chunks.into_iter().filter_map(|chunk| chunk.web) {
            let (Some(uri), Some(title)) = (web.uri, web.title) else {
                continue;
            };
            if uri.is_empty() || title.is_empty() {
                continue;
            }
            if !self.sources.iter().any(|existing| existing.uri == uri) {
                self.sources.push(Source { uri, title });
            }
        }
    }

    fn resolve_citations(&self, raw: Vec<CitationSource>) -> Vec<Citation> {
        raw.into_iter()
            .enumerate()
            .filter_map(|(position, cited)| {
                let end = cited.end_index?;
                let start = cited.start_index.unwrap_or(0);
                let source_index = match cited
                    .uri
                    .as_deref()
                    .and_then(|uri| self.sources.iter().position(|s| s.uri == uri))
                {
                    Some(found) => found,
                    None if position < self.sources.len() => {
                        tracing::warn!(position, "citation URI not among sources; using its position");
                        position
                    }
                    None => {
                        tracing::warn!(position, "dropping citation with no resolvable source");
                        return None;
                    }
                };
                let start_index = char_offset(&self.full_text, start);
                let end_index = char_offset(&self.full_text, end);
                (start_index < end_index).then_some(Citation {
                    start_index,
                    end_index,
                    source_index,
                })
            })
            .collect()
    }
}

/// Converts a UTF-8 byte offset into a `char` offset of `text`.
///
/// Offsets inside a character round down; offsets past the end keep their
/// distance from the end.
fn char_offset(text: &str, byte: usize) -> usize {
    if byte >= text.len() {
        return text.chars().count() + (byte - text.len());
    }
    text.char_indices()
        .take_while(|(at, c)| at + c.len_utf8() <= byte)
        .count()
}

// ============================================
// Streaming
// ============================================

struct SseStream {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    grounding: GroundingAccumulator,
    ready: VecDeque<StreamChunk>,
    cancel: CancellationToken,
    finished: bool,
}

impl SseStream {
    fn accept(&mut self, data: &str) {
        if let Some(response) = parse_gemini_sse_data(data) {
            self.ready.push_back(self.grounding.apply(response));
        }
    }

    fn into_chunks(self) -> ChunkStream {
        futures::stream::unfold(self, |mut state| async move {
            loop {
                if let Some(chunk) = state.ready.pop_front() {
                    return Some((Ok(chunk), state));
                }
                if state.finished {
                    return None;
                }
                let next = tokio::select! {
                    biased;
                    _ = state.cancel.cancelled() => None,
                    next = state.bytes.next() => Some(next),
                };
                match next {
                    None => {
                        state.finished = true;
                        return Some((Err(ChatError::Cancelled), state));
                    }
                    Some(None) => {
                        state.finished = true;
                        if let Some(data) = state.decoder.finish() {
                            state.accept(&data);
                        }
                    }
                    Some(Some(Err(err))) => {
                        state.finished = true;
                        return Some((Err(ChatError::from(err)), state));
                    }
                    Some(Some(Ok(bytes))) => {
                        for data in state.decoder.push(&bytes) {
                            state.accept(&data);
                        }
                    }
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl LLMBackend for GeminiBackend {
    async fn stream(&self, history: &[ChatMessage], cancel: CancellationToken) -> ChatResult<ChunkStream> {
        let request = GenerateRequest {
            contents: history.iter().map(to_content).collect(),
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part::text(SYSTEM_INSTRUCTION)],
            }),
            tools: vec![serde_json::json!({ "googleSearch": {} })],
            generation_config: Some(serde_json::json!({
                "thinkingConfig": { "thinkingBudget": 0 }
            })),
        };

        let pending = self
            .client
            .post(self.endpoint("streamGenerateContent"))
            .query(&[("alt", "sse")])
            .header("accept", "text/event-stream")
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            response = pending => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Http {
                status: status.as_u16(),
                body,
            });
        }
        tracing::debug!(model = %self.model, "gemini stream opened");

        let state = SseStream {
            bytes: response.bytes_stream().map(|item| item.map(|b| b.to_vec())).boxed(),
            decoder: SseDecoder::default(),
            grounding: GroundingAccumulator::default(),
            ready: VecDeque::new(),
            cancel,
            finished: false,
        };
        Ok(state.into_chunks())
    }

    async fn title(&self, exchange: &[ChatMessage]) -> ChatResult<String> {
        if exchange.is_empty() {
            return Ok(DEFAULT_SESSION_TITLE.to_string());
        }
        let request = GenerateRequest {
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part::text(title_prompt(exchange))],
            }],
            system_instruction: None,
            tools: Vec::new(),
            generation_config: None,
        };
        let response = self
            .client
            .post(self.endpoint("generateContent"))
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ChatError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: GenerateResponse = serde_json::from_str(&body)?;
        Ok(clean_title(&parsed.text()))
    }
}
