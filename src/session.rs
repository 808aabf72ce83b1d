//! Session store
//!
//! Owns every chat session, the active session id and the loading/thinking
//! indicators. All changes go through [`SessionStore::mutate`], which applies
//! the change to a copy of the current snapshot, persists it, and publishes
//! the new `Arc<ChatSnapshot>` to subscribers.

use crate::storage::{Storage, StorageError};
use crate::types::{ChatMessage, ChatSession, DEFAULT_SESSION_TITLE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

pub const SESSIONS_KEY: &str = "chatSessions";
pub const ACTIVE_SESSION_KEY: &str = "activeSessionId";

/// Immutable view published after every mutation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatSnapshot {
    pub sessions: Vec<ChatSession>,
    pub active_session_id: Option<String>,
    pub is_loading: bool,
    pub is_thinking: bool,
}

impl ChatSnapshot {
    pub fn active_session(&self) -> Option<&ChatSession> {
        let id = self.active_session_id.as_deref()?;
        self.session(id)
    }

    pub fn session(&self, id: &str) -> Option<&ChatSession> {
        self.sessions.iter().find(|session| session.id == id)
    }

    fn session_mut(&mut self, id: &str) -> Option<&mut ChatSession> {
        self.sessions.iter_mut().find(|session| session.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("a response is already being generated")]
    Busy,

    #[error("there is no active session")]
    NoActiveSession,

    #[error("the message is empty")]
    EmptyPrompt,
}

/// Everything a stream needs once its user message has been recorded.
#[derive(Debug, Clone)]
pub struct StreamStart {
    pub ticket: u64,
    pub session_id: String,
    /// Session history including the new user message.
    pub history: Vec<ChatMessage>,
    /// The session had no messages before this send.
    pub first_exchange: bool,
}

/// What a mutation touched, and therefore what must be written back.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Dirty {
    Nothing,
    Indicators,
    Sessions,
    Active,
    All,
}

struct StoreState {
    snapshot: Arc<ChatSnapshot>,
    /// Ticket of the stream currently allowed to drive the indicators.
    active_stream: Option<u64>,
}

pub struct SessionStore {
    state: Mutex<StoreState>,
    storage: Arc<dyn Storage>,
    tickets: AtomicU64,
    updates: watch::Sender<Arc<ChatSnapshot>>,
}

impl SessionStore {
    /// Restores sessions from `storage`, bootstrapping a fresh session when
    /// nothing usable is stored.
    pub fn load(storage: Arc<dyn Storage>) -> Self {
        let restored = match read_sessions(storage.as_ref()) {
            Ok(sessions) => sessions,
            Err(StorageError::Missing(_)) => Vec::new(),
            Err(err) => {
                tracing::warn!("discarding stored sessions: {}", err);
                Vec::new()
            }
        };

        let bootstrapped = restored.is_empty();
        let sessions = if bootstrapped {
            vec![new_session()]
        } else {
            restored
        };

        let active_session_id = storage
            .get(ACTIVE_SESSION_KEY)
            .filter(|id| sessions.iter().any(|session| &session.id == id))
            .or_else(|| most_recent(&sessions).map(|session| session.id.clone()));

        tracing::info!(sessions = sessions.len(), bootstrapped, "session store loaded");

        let snapshot = Arc::new(ChatSnapshot {
            sessions,
            active_session_id,
            is_loading: false,
            is_thinking: false,
        });
        let (updates, _) = watch::channel(Arc::clone(&snapshot));
        let store = Self {
            state: Mutex::new(StoreState {
                snapshot,
                active_stream: None,
            }),
            storage,
            tickets: AtomicU64::new(1),
            updates,
        };
        if bootstrapped {
            store.mutate(|_| ((), Dirty::All));
        }
        store
    }

    pub fn snapshot(&self) -> Arc<ChatSnapshot> {
        self.updates.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ChatSnapshot>> {
        self.updates.subscribe()
    }

    /// Creates an empty session at the head of the list and makes it active.
    pub fn create_session(&self) -> String {
        let session = new_session();
        let id = session.id.clone();
        self.mutate(|state| {
            let snapshot = Arc::make_mut(&mut state.snapshot);
            snapshot.sessions.insert(0, session);
            snapshot.active_session_id = Some(id.clone());
            ((), Dirty::All)
        });
        tracing::info!(session = %id, "session created");
        id
    }

    /// Switches the active session and clears the indicators.
    ///
    /// The caller cancels any running stream first; its ticket is retired
    /// here so it can no longer touch the indicators.
    pub fn select_session(&self, id: &str) -> bool {
        self.mutate(|state| {
            if state.snapshot.session(id).is_none() {
                return (false, Dirty::Nothing);
            }
            state.active_stream = None;
            let snapshot = Arc::make_mut(&mut state.snapshot);
            snapshot.active_session_id = Some(id.to_string());
            snapshot.is_loading = false;
            snapshot.is_thinking = false;
            (true, Dirty::Active)
        })
    }

    pub fn append_message(&self, session_id: &str, message: ChatMessage) -> bool {
        self.mutate(|state| {
            let snapshot = Arc::make_mut(&mut state.snapshot);
            match snapshot.session_mut(session_id) {
                Some(session) => {
                    session.messages.push(message);
                    (true, Dirty::Sessions)
                }
                None => (false, Dirty::Nothing),
            }
        })
    }

    /// Applies `update` to the last message of the session, which must be a
    /// MODEL message.
    pub fn update_last_message(&self, session_id: &str, update: impl FnOnce(&mut ChatMessage)) -> bool {
        self.mutate(|state| {
            let is_model = state
                .snapshot
                .session(session_id)
                .and_then(|session| session.messages.last())
                .is_some_and(ChatMessage::is_model);
            if !is_model {
                tracing::warn!(session = %session_id, "last message is not a model reply; update skipped");
                return (false, Dirty::Nothing);
            }
            let snapshot = Arc::make_mut(&mut state.snapshot);
            if let Some(message) = snapshot
                .session_mut(session_id)
                .and_then(|session| session.messages.last_mut())
            {
                update(message);
            }
            (true, Dirty::Sessions)
        })
    }

    pub fn rename_session(&self, session_id: &str, title: impl Into<String>) -> bool {
        let title = title.into();
        self.mutate(|state| {
            let snapshot = Arc::make_mut(&mut state.snapshot);
            match snapshot.session_mut(session_id) {
                Some(session) => {
                    session.title = title;
                    (true, Dirty::Sessions)
                }
                None => (false, Dirty::Nothing),
            }
        })
    }

    /// Records `user_message` in the active session and raises the indicators.
    ///
    /// The busy check and the append happen under one lock, so two sends
    /// can never both start a stream.
    pub fn begin_stream(&self, user_message: ChatMessage) -> Result<StreamStart, SendError> {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        self.mutate(|state| {
            if state.snapshot.is_loading || state.active_stream.is_some() {
                return (Err(SendError::Busy), Dirty::Nothing);
            }
            let Some(session_id) = state.snapshot.active_session_id.clone() else {
                return (Err(SendError::NoActiveSession), Dirty::Nothing);
            };
            let snapshot = Arc::make_mut(&mut state.snapshot);
            let Some(session) = snapshot.session_mut(&session_id) else {
                return (Err(SendError::NoActiveSession), Dirty::Nothing);
            };
            let first_exchange = session.messages.is_empty();
            session.messages.push(user_message);
            let history = session.messages.clone();
            snapshot.is_loading = true;
            snapshot.is_thinking = true;
            state.active_stream = Some(ticket);
            let start = StreamStart {
                ticket,
                session_id,
                history,
                first_exchange,
            };
            (Ok(start), Dirty::Sessions)
        })
    }

    /// The first chunk arrived: stop showing the thinking indicator.
    pub fn model_started(&self, ticket: u64) {
        self.mutate(|state| {
            if state.active_stream != Some(ticket) || !state.snapshot.is_thinking {
                return ((), Dirty::Nothing);
            }
            Arc::make_mut(&mut state.snapshot).is_thinking = false;
            ((), Dirty::Indicators)
        });
    }

    /// Clears the indicators if `ticket` still owns them.
    pub fn finish_stream(&self, ticket: u64) {
        self.mutate(|state| {
            if state.active_stream != Some(ticket) {
                return ((), Dirty::Nothing);
            }
            state.active_stream = None;
            let snapshot = Arc::make_mut(&mut state.snapshot);
            snapshot.is_loading = false;
            snapshot.is_thinking = false;
            ((), Dirty::Indicators)
        });
    }

    fn mutate<R>(&self, change: impl FnOnce(&mut StoreState) -> (R, Dirty)) -> R {
        let mut state = self.state.lock().expect("session store poisoned");
        let (result, dirty) = change(&mut state);
        if dirty == Dirty::Nothing {
            return result;
        }
        if matches!(dirty, Dirty::Sessions | Dirty::All) {
            self.persist_sessions(&state.snapshot.sessions);
        }
        if matches!(dirty, Dirty::Active | Dirty::All)
            && let Some(id) = &state.snapshot.active_session_id
            && let Err(err) = self.storage.set(ACTIVE_SESSION_KEY, id)
        {
            tracing::warn!("failed to persist active session: {}", err);
        }
        self.updates.send_replace(Arc::clone(&state.snapshot));
        result
    }

    fn persist_sessions(&self, sessions: &[ChatSession]) {
        let written = serde_json::to_string(sessions)
            .map_err(StorageError::from)
            .and_then(|json| self.storage.set(SESSIONS_KEY, &json));
        if let Err(err) = written {
            tracing::warn!("failed to persist sessions: {}", err);
        }
    }
}

fn read_sessions(storage: &dyn Storage) -> Result<Vec<ChatSession>, StorageError> {
    let raw = storage
        .get(SESSIONS_KEY)
        .ok_or_else(|| StorageError::Missing(SESSIONS_KEY.to_string()))?;
    Ok(serde_json::from_str(&raw)?)
}

fn new_session() -> ChatSession {
    ChatSession {
        id: format!("chat-{}", Uuid::new_v4().simple()),
        title: DEFAULT_SESSION_TITLE.to_string(),
        messages: Vec::new(),
        created_at: now_millis(),
    }
}

/// Latest `created_at`, first in list order among ties.
fn most_recent(sessions: &[ChatSession]) -> Option<&ChatSession> {
    sessions.iter().fold(None, |best, session| match best {
        Some(best) if best.created_at >= session.created_at => Some(best),
        _ => Some(session),
    })
}

fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
