//! Integration tests for the chat flow
//!
//! Drives `ChatController` against a scripted backend whose chunks are fed
//! by the test through a channel.

use async_trait::async_trait;
use futures::StreamExt;
use qanun::ai::{ChatError, ChatResult, ChunkStream, LLMBackend, StreamChunk};
use qanun::chat::{ChatController, SendError};
use qanun::session::{ChatSnapshot, SessionStore};
use qanun::storage::MemoryStorage;
use qanun::stream::{StreamOutcome, StreamPhase};
use qanun::types::{ChatMessage, Citation, Role, STREAM_ERROR_TEXT, Source, UNTITLED_SESSION_TITLE};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const FLUSH: Duration = Duration::from_millis(50);

type ChunkSender = mpsc::UnboundedSender<ChatResult<StreamChunk>>;

#[derive(Default)]
struct ScriptedBackend {
    streams: Mutex<VecDeque<mpsc::UnboundedReceiver<ChatResult<StreamChunk>>>>,
    histories: Mutex<Vec<Vec<ChatMessage>>>,
    title_calls: AtomicUsize,
    failing_titles: bool,
}

impl ScriptedBackend {
    /// Queues the next stream and returns the sender that feeds it.
    fn script(&self) -> ChunkSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().push_back(rx);
        tx
    }

    fn title_calls(&self) -> usize {
        self.title_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LLMBackend for ScriptedBackend {
    async fn stream(&self, history: &[ChatMessage], _cancel: CancellationToken) -> ChatResult<ChunkStream> {
        self.histories.lock().unwrap().push(history.to_vec());
        let rx = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ChatError::new("no scripted stream"))?;
        Ok(futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed())
    }

    async fn title(&self, _exchange: &[ChatMessage]) -> ChatResult<String> {
        self.title_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_titles {
            Err(ChatError::new("quota exceeded"))
        } else {
            Ok("تحية".to_string())
        }
    }
}

fn harness(backend: ScriptedBackend) -> (ChatController, Arc<ScriptedBackend>) {
    let backend = Arc::new(backend);
    let store = Arc::new(SessionStore::load(Arc::new(MemoryStorage::default())));
    let controller = ChatController::new(store, backend.clone(), FLUSH);
    (controller, backend)
}

async fn wait_for(controller: &ChatController, done: impl Fn(&ChatSnapshot) -> bool) -> Arc<ChatSnapshot> {
    let mut updates = controller.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = updates.borrow_and_update().clone();
            if done(&snapshot) {
                return snapshot;
            }
            updates.changed().await.expect("store dropped");
        }
    })
    .await
    .expect("condition not reached")
}

fn messages(snapshot: &ChatSnapshot) -> &[ChatMessage] {
    &snapshot.active_session().expect("active session").messages
}

fn last_model_text(snapshot: &ChatSnapshot) -> Option<String> {
    messages(snapshot)
        .last()
        .filter(|m| m.is_model())
        .map(|m| m.text.clone())
}

#[tokio::test(start_paused = true)]
async fn greeting_streams_with_citation_and_title() {
    let (controller, backend) = harness(ScriptedBackend::default());
    let tx = backend.script();
    let task = controller.send_message("السلام عليكم", None).unwrap();
    assert_eq!(controller.phase(), StreamPhase::Streaming);

    tx.send(Ok(StreamChunk::text("مرحبا "))).unwrap();
    tx.send(Ok(StreamChunk::text("بك")
        .with_sources(vec![Source {
            uri: "https://x".to_string(),
            title: "X".to_string(),
        }])
        .with_citations(vec![Citation {
            start_index: 0,
            end_index: 7,
            source_index: 0,
        }])))
        .unwrap();
    drop(tx);

    match task.wait().await {
        StreamOutcome::Completed { text } => assert_eq!(text, "مرحبا بك"),
        other => panic!("expected completion, got {other:?}"),
    }

    let snapshot = controller.snapshot();
    let messages = messages(&snapshot);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].text, "مرحبا بك");
    assert_eq!(messages[1].sources().len(), 1);
    assert_eq!(
        messages[1].citations(),
        &[Citation {
            start_index: 0,
            end_index: 7,
            source_index: 0
        }]
    );
    assert!(!snapshot.is_loading);
    assert!(!snapshot.is_thinking);
    assert_eq!(backend.title_calls(), 1);
    assert_eq!(snapshot.active_session().unwrap().title, "تحية");
    assert_eq!(controller.phase(), StreamPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn text_is_buffered_until_the_flush_tick() {
    let (controller, backend) = harness(ScriptedBackend::default());
    let tx = backend.script();
    let task = controller.send_message("سؤال", None).unwrap();

    let thinking = controller.snapshot();
    assert!(thinking.is_loading);
    assert!(thinking.is_thinking);
    assert_eq!(messages(&thinking).len(), 1);

    tx.send(Ok(StreamChunk::text("جواب"))).unwrap();
    let placeholder = wait_for(&controller, |s| last_model_text(s).is_some()).await;
    assert_eq!(last_model_text(&placeholder).as_deref(), Some(""));
    assert!(!placeholder.is_thinking);
    assert!(placeholder.is_loading);

    let flushed = wait_for(&controller, |s| last_model_text(s).as_deref() == Some("جواب")).await;
    assert!(flushed.is_loading);

    drop(tx);
    assert!(matches!(task.wait().await, StreamOutcome::Completed { .. }));
}

#[tokio::test(start_paused = true)]
async fn second_send_while_streaming_is_rejected() {
    let (controller, backend) = harness(ScriptedBackend::default());
    let tx = backend.script();
    let task = controller.send_message("أول", None).unwrap();

    assert!(matches!(controller.send_message("ثان", None), Err(SendError::Busy)));
    assert_eq!(messages(&controller.snapshot()).len(), 1);

    drop(tx);
    task.wait().await;
    assert_eq!(backend.histories.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn empty_prompt_is_rejected() {
    let (controller, _backend) = harness(ScriptedBackend::default());
    assert!(matches!(controller.send_message("   ", None), Err(SendError::EmptyPrompt)));
    assert!(messages(&controller.snapshot()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_before_first_chunk_keeps_only_the_question() {
    let (controller, backend) = harness(ScriptedBackend::default());
    let _tx = backend.script();
    let task = controller.send_message("سؤال", None).unwrap();

    assert!(controller.stop_generation());
    assert!(matches!(task.wait().await, StreamOutcome::Aborted));

    let snapshot = controller.snapshot();
    let messages = messages(&snapshot);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
    assert!(!snapshot.is_loading);
    assert!(!snapshot.is_thinking);
    assert_eq!(backend.title_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_stream_keeps_flushed_text() {
    let (controller, backend) = harness(ScriptedBackend::default());
    let tx = backend.script();
    let task = controller.send_message("سؤال", None).unwrap();

    tx.send(Ok(StreamChunk::text("أ"))).unwrap();
    wait_for(&controller, |s| last_model_text(s).as_deref() == Some("أ")).await;
    tx.send(Ok(StreamChunk::text("ب"))).unwrap();
    controller.stop_generation();

    assert!(matches!(task.wait().await, StreamOutcome::Aborted));
    let snapshot = controller.snapshot();
    assert_eq!(last_model_text(&snapshot).as_deref(), Some("أ"));
    assert!(!messages(&snapshot).iter().any(|m| m.text == STREAM_ERROR_TEXT));
    assert_eq!(backend.title_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn transport_error_appends_one_error_message() {
    let (controller, backend) = harness(ScriptedBackend::default());
    let tx = backend.script();
    let task = controller.send_message("سؤال", None).unwrap();

    tx.send(Err(ChatError::new("connection reset"))).unwrap();
    assert!(matches!(task.wait().await, StreamOutcome::Failed(_)));

    let snapshot = controller.snapshot();
    let messages = messages(&snapshot);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, Role::Model);
    assert_eq!(messages[1].text, STREAM_ERROR_TEXT);
    assert!(!snapshot.is_loading);
    assert_eq!(backend.title_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn title_failure_falls_back_and_later_exchanges_keep_it() {
    let (controller, backend) = harness(ScriptedBackend {
        failing_titles: true,
        ..ScriptedBackend::default()
    });

    let tx = backend.script();
    let task = controller.send_message("أول", None).unwrap();
    tx.send(Ok(StreamChunk::text("رد"))).unwrap();
    drop(tx);
    task.wait().await;
    assert_eq!(controller.snapshot().active_session().unwrap().title, UNTITLED_SESSION_TITLE);

    let tx = backend.script();
    let task = controller.send_message("ثان", None).unwrap();
    tx.send(Ok(StreamChunk::text("رد آخر"))).unwrap();
    drop(tx);
    task.wait().await;

    assert_eq!(backend.title_calls(), 1);
    let histories = backend.histories.lock().unwrap();
    assert_eq!(histories[1].len(), 3);
    assert_eq!(histories[1][2].text, "ثان");
}

#[tokio::test(start_paused = true)]
async fn metadata_after_the_first_chunk_merges_sources() {
    let (controller, backend) = harness(ScriptedBackend::default());
    let tx = backend.script();
    let task = controller.send_message("سؤال", None).unwrap();

    let source = |uri: &str| Source {
        uri: uri.to_string(),
        title: uri.to_string(),
    };
    tx.send(Ok(StreamChunk::text("نص").with_sources(vec![source("https://a")]))).unwrap();
    tx.send(Ok(StreamChunk::default().with_sources(vec![source("https://a"), source("https://b")])))
        .unwrap();
    tx.send(Ok(StreamChunk::default().with_sources(vec![source("https://c")]))).unwrap();
    drop(tx);
    task.wait().await;

    let snapshot = controller.snapshot();
    let reply = messages(&snapshot).last().unwrap();
    let uris: Vec<&str> = reply.sources().iter().map(|s| s.uri.as_str()).collect();
    assert_eq!(uris, vec!["https://a", "https://b", "https://c"]);
}

#[tokio::test(start_paused = true)]
async fn switching_sessions_cancels_the_stream() {
    let (controller, backend) = harness(ScriptedBackend::default());
    let first = controller.snapshot().active_session_id.clone().unwrap();
    let second = controller.new_session();
    assert!(controller.select_session(&first));

    let _tx = backend.script();
    let task = controller.send_message("سؤال", None).unwrap();
    assert!(controller.select_session(&second));

    let snapshot = controller.snapshot();
    assert!(!snapshot.is_loading);
    assert_eq!(snapshot.active_session_id.as_deref(), Some(second.as_str()));
    assert!(matches!(task.wait().await, StreamOutcome::Aborted));
    assert_eq!(snapshot.session(&first).unwrap().messages.len(), 1);
}
