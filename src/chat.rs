//! Chat controller
//!
//! The user-facing actions: start a chat, send a message, stop generation,
//! switch sessions. Each send spawns one [`StreamAssembler`] task.

use crate::ai::{ChatError, LLMBackend};
use crate::session::{ChatSnapshot, SessionStore};
use crate::stream::{StreamAssembler, StreamOutcome, StreamPhase};
use crate::types::ChatMessage;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use crate::session::SendError;

pub struct ChatController {
    store: Arc<SessionStore>,
    backend: Arc<dyn LLMBackend>,
    flush_interval: Duration,
    active: Mutex<Option<CancellationToken>>,
}

/// Handle to a spawned stream.
pub struct StreamTask {
    handle: JoinHandle<StreamOutcome>,
}

impl StreamTask {
    /// Waits for the stream to end, including the title update of a first exchange.
    pub async fn wait(self) -> StreamOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) => StreamOutcome::Failed(ChatError::new(format!("stream task ended abnormally: {err}"))),
        }
    }
}

impl ChatController {
    pub fn new(store: Arc<SessionStore>, backend: Arc<dyn LLMBackend>, flush_interval: Duration) -> Self {
        Self {
            store,
            backend,
            flush_interval,
            active: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> Arc<ChatSnapshot> {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ChatSnapshot>> {
        self.store.subscribe()
    }

    pub fn phase(&self) -> StreamPhase {
        if self.store.snapshot().is_loading {
            StreamPhase::Streaming
        } else {
            StreamPhase::Idle
        }
    }

    pub fn new_session(&self) -> String {
        self.stop_generation();
        self.store.create_session()
    }

    /// Records the user's message in the active session and starts streaming
    /// the reply. Rejected while another reply is streaming.
    pub fn send_message(&self, prompt: &str, image_url: Option<String>) -> Result<StreamTask, SendError> {
        let prompt = prompt.trim();
        if prompt.is_empty() && image_url.is_none() {
            return Err(SendError::EmptyPrompt);
        }

        let mut active = self.active.lock().expect("chat controller poisoned");
        let start = self.store.begin_stream(ChatMessage::user(prompt, image_url))?;
        let cancel = CancellationToken::new();
        if let Some(previous) = active.replace(cancel.clone()) {
            previous.cancel();
        }
        drop(active);

        let assembler = StreamAssembler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.backend),
            start,
            cancel,
            self.flush_interval,
        );
        Ok(StreamTask {
            handle: tokio::spawn(assembler.run()),
        })
    }

    /// Cancels the running stream, if any. Text flushed so far is kept.
    pub fn stop_generation(&self) -> bool {
        let streaming = self.store.snapshot().is_loading;
        if let Some(token) = self.active.lock().expect("chat controller poisoned").take() {
            token.cancel();
        }
        streaming
    }

    /// Makes `id` the active session, cancelling any running stream first.
    pub fn select_session(&self, id: &str) -> bool {
        if self.store.snapshot().is_loading {
            self.stop_generation();
        }
        self.store.select_session(id)
    }
}
