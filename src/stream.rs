//! Stream assembly
//!
//! Turns the chunk stream of an [`LLMBackend`] into session updates: text
//! deltas are buffered and flushed on a fixed period (the typewriter effect),
//! grounding metadata is applied as soon as it arrives.

use crate::ai::{ChatError, ChunkStream, LLMBackend, StreamChunk};
use crate::session::{SessionStore, StreamStart};
use crate::types::{ChatMessage, STREAM_ERROR_TEXT, UNTITLED_SESSION_TITLE};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Streaming,
    Completed,
    Aborted,
    Failed,
}

/// How a stream ended.
#[derive(Clone, Debug)]
pub enum StreamOutcome {
    Completed { text: String },
    Aborted,
    Failed(ChatError),
}

impl StreamOutcome {
    pub fn phase(&self) -> StreamPhase {
        match self {
            Self::Completed { .. } => StreamPhase::Completed,
            Self::Aborted => StreamPhase::Aborted,
            Self::Failed(_) => StreamPhase::Failed,
        }
    }
}

/// Pending text deltas and everything flushed so far.
#[derive(Default)]
pub struct TextBuffer {
    pending: String,
    flushed: String,
    flushes: usize,
}

impl TextBuffer {
    pub fn push(&mut self, delta: &str) {
        self.pending.push_str(delta);
    }

    /// Moves pending text into the flushed text, returning the moved delta.
    pub fn take(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let delta = std::mem::take(&mut self.pending);
        self.flushed.push_str(&delta);
        self.flushes += 1;
        Some(delta)
    }

    /// Drops pending text, returning how many chars were lost.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.chars().count();
        self.pending.clear();
        dropped
    }

    pub fn flushed(&self) -> &str {
        &self.flushed
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

/// Drives one request from its chunk stream to a final session state.
pub struct StreamAssembler {
    store: Arc<SessionStore>,
    backend: Arc<dyn LLMBackend>,
    start: StreamStart,
    cancel: CancellationToken,
    flush_interval: Duration,
    has_reply: bool,
}

impl StreamAssembler {
    pub fn new(
        store: Arc<SessionStore>,
        backend: Arc<dyn LLMBackend>,
        start: StreamStart,
        cancel: CancellationToken,
        flush_interval: Duration,
    ) -> Self {
        Self {
            store,
            backend,
            start,
            cancel,
            flush_interval,
            has_reply: false,
        }
    }

    pub async fn run(mut self) -> StreamOutcome {
        let session_id = self.start.session_id.clone();
        tracing::info!(session = %session_id, ticket = self.start.ticket, "stream started");

        let outcome = self.drive().await;
        match &outcome {
            StreamOutcome::Completed { text } => {
                tracing::info!(session = %session_id, chars = text.chars().count(), "stream completed");
            }
            StreamOutcome::Aborted => tracing::info!(session = %session_id, "stream cancelled"),
            StreamOutcome::Failed(err) => {
                tracing::error!(session = %session_id, "stream failed: {}", err);
                self.store.append_message(&session_id, ChatMessage::model(STREAM_ERROR_TEXT));
            }
        }
        self.store.finish_stream(self.start.ticket);

        if let StreamOutcome::Completed { text } = &outcome
            && self.start.first_exchange
            && !text.is_empty()
        {
            self.retitle(text).await;
        }
        outcome
    }

    async fn drive(&mut self) -> StreamOutcome {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return StreamOutcome::Aborted,
            opened = self.backend.stream(&self.start.history, self.cancel.clone()) => opened,
        };
        let mut chunks: ChunkStream = match opened {
            Ok(chunks) => chunks,
            Err(err) if err.is_cancelled() => return StreamOutcome::Aborted,
            Err(err) => return StreamOutcome::Failed(err),
        };

        let mut buffer = TextBuffer::default();
        let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let dropped = buffer.discard();
                    tracing::debug!(dropped, "discarding unflushed text");
                    break StreamOutcome::Aborted;
                }
                _ = ticker.tick() => self.flush(&mut buffer),
                next = chunks.next() => match next {
                    Some(Ok(chunk)) => self.apply(chunk, &mut buffer),
                    Some(Err(err)) if err.is_cancelled() => {
                        buffer.discard();
                        break StreamOutcome::Aborted;
                    }
                    Some(Err(err)) => {
                        self.flush(&mut buffer);
                        break StreamOutcome::Failed(err);
                    }
                    None => {
                        self.flush(&mut buffer);
                        break StreamOutcome::Completed {
                            text: buffer.flushed().to_string(),
                        };
                    }
                },
            }
        };
        tracing::debug!(flushes = buffer.flushes(), "stream buffer closed");
        outcome
    }

    fn apply(&mut self, chunk: StreamChunk, buffer: &mut TextBuffer) {
        let StreamChunk {
            text,
            sources,
            citations,
        } = chunk;

        if !self.has_reply {
            self.has_reply = true;
            self.store.model_started(self.start.ticket);
            let mut placeholder = ChatMessage::model("");
            if let Some(sources) = &sources {
                placeholder.merge_sources(sources);
            }
            if let Some(citations) = citations {
                placeholder.replace_citations(citations);
            }
            self.store.append_message(&self.start.session_id, placeholder);
        } else if sources.is_some() || citations.is_some() {
            self.store.update_last_message(&self.start.session_id, |message| {
                if let Some(sources) = &sources {
                    message.merge_sources(sources);
                }
                if let Some(citations) = citations {
                    message.replace_citations(citations);
                }
            });
        }

        if let Some(text) = text {
            buffer.push(&text);
        }
    }

    fn flush(&self, buffer: &mut TextBuffer) {
        if let Some(delta) = buffer.take() {
            self.store
                .update_last_message(&self.start.session_id, |message| message.text.push_str(&delta));
        }
    }

    async fn retitle(&self, reply: &str) {
        let Some(question) = self.start.history.last() else {
            return;
        };
        let exchange = [question.clone(), ChatMessage::model(reply)];
        let title = match self.backend.title(&exchange).await {
            Ok(title) => title,
            Err(err) => {
                tracing::warn!(session = %self.start.session_id, "title generation failed: {}", err);
                UNTITLED_SESSION_TITLE.to_string()
            }
        };
        tracing::debug!(session = %self.start.session_id, %title, "session titled");
        self.store.rename_session(&self.start.session_id, title);
    }
}
