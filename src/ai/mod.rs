/// AI module for Qanun
///
/// This module defines the generation capability the stream assembler drives
/// and the Gemini implementation of it.
///
/// # Architecture
///
/// - `client` - `LLMBackend` trait, stream chunks and the error taxonomy
/// - `gemini` - Gemini REST backend with SSE streaming and grounding metadata
///
/// # Usage
///
/// ```rust,no_run
/// use qanun::ai::{GeminiBackend, LLMBackend};
/// use qanun::config::Settings;
/// use qanun::types::ChatMessage;
///
/// # async fn example() -> anyhow::Result<()> {
/// let backend = GeminiBackend::new(&Settings::from_env()?);
/// let exchange = [ChatMessage::user("ما هي شروط القبول؟", None), ChatMessage::model("...")];
/// let title = backend.title(&exchange).await?;
/// # Ok(())
/// # }
/// ```
mod client;
mod gemini;

pub use client::{
    ChatError, ChatResult, ChunkStream, LLMBackend, StreamChunk, clean_title, title_prompt,
};
pub use gemini::{GeminiBackend, GenerateResponse, GroundingAccumulator, SseDecoder, parse_gemini_sse_data};
