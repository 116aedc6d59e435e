//! The core models for comparing chats across several models at once.
//!
//! A `Registry` is an immutable value. Every transition takes the
//! current registry and returns a new one, cloning only the session
//! that changed. Readers holding an older registry keep seeing a
//! consistent snapshot.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::catalog::Catalog;

/// Model id recorded on messages the user wrote.
pub const USER_MODEL_ID: &str = "user";

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum Role {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Message {
    pub id: u64,
    pub role: Role,
    pub content: String,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Streaming,
    ModelChanging,
    Clearing,
}

/// Handle to the one in-flight stream a session may own.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    id: Uuid,
    token: CancellationToken,
}

impl StreamHandle {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for StreamHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// One model's pane.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: String,
    pub model_id: String,
    pub transcript: Vec<Message>,
    pub status: SessionStatus,
    pub stream: Option<StreamHandle>,
    pub last_error: Option<String>,
}

impl Session {
    pub fn new(model_id: &str) -> Self {
        Self::with_id(&Uuid::new_v4().to_string(), model_id)
    }

    pub fn with_id(id: &str, model_id: &str) -> Self {
        Self {
            id: id.to_string(),
            model_id: model_id.to_string(),
            transcript: Vec::new(),
            status: SessionStatus::Idle,
            stream: None,
            last_error: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.status == SessionStatus::Streaming
    }

    /// True while `handle_id` is still the live stream of this session.
    fn owns_stream(&self, handle_id: Uuid) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|handle| handle.id() == handle_id && !handle.is_cancelled())
    }
}

/// A session about to receive a prompt.
#[derive(Clone, Debug)]
pub struct DispatchTarget {
    pub session_id: String,
    pub model_id: String,
    pub handle: StreamHandle,
}

#[derive(Clone, Debug, Default)]
pub struct Registry {
    sessions: Vec<Arc<Session>>,
    catalog: Arc<Catalog>,
    system_prompt: Option<String>,
    loading: bool,
    next_message_id: u64,
}

impl Registry {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog: Arc::new(catalog),
            ..Default::default()
        }
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter().map(Arc::as_ref)
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions().find(|session| session.id == id)
    }

    pub(crate) fn shared_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.clone()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.sessions().map(|s| s.model_id.clone()).collect()
    }

    pub fn with_catalog(&self, catalog: Catalog) -> Self {
        Self {
            catalog: Arc::new(catalog),
            ..self.clone()
        }
    }

    pub fn with_system_prompt(&self, system_prompt: Option<String>) -> Self {
        Self {
            system_prompt: system_prompt.filter(|p| !p.trim().is_empty()),
            ..self.clone()
        }
    }

    pub fn with_session(&self, session: Session) -> Self {
        let mut next = self.clone();
        next.sessions.push(Arc::new(session));
        next
    }

    /// Swap the session with the same id for `session`.
    pub fn replace_session(&self, session: Session) -> Self {
        let mut next = self.clone();
        if let Some(slot) = next.sessions.iter_mut().find(|s| s.id == session.id) {
            *slot = Arc::new(session);
        }
        next
    }

    /// Remove a session, handing back whatever it owned so the caller
    /// can cancel its stream.
    pub fn without_session(&self, id: &str) -> (Self, Option<Arc<Session>>) {
        let mut next = self.clone();
        let removed = next
            .sessions
            .iter()
            .position(|s| s.id == id)
            .map(|idx| next.sessions.remove(idx));
        (next, removed)
    }

    pub(crate) fn with_sessions(&self, sessions: Vec<Arc<Session>>) -> Self {
        Self {
            sessions,
            ..self.clone()
        }
    }

    /// Clone-on-write update of a single session. Sessions that are
    /// not touched keep sharing their allocation with `self`.
    fn update_session(&self, id: &str, f: impl FnOnce(&mut Session, &mut u64)) -> Self {
        let mut next = self.clone();
        let next_message_id = &mut next.next_message_id;
        if let Some(slot) = next.sessions.iter_mut().find(|s| s.id == id) {
            let mut session = Session::clone(slot);
            f(&mut session, next_message_id);
            *slot = Arc::new(session);
        }
        next
    }

    /// Move a session into a lifecycle state, detaching its live
    /// stream handle so the caller can cancel it.
    pub fn begin_operation(&self, id: &str, status: SessionStatus) -> (Self, Option<StreamHandle>) {
        let mut detached = None;
        let next = self.update_session(id, |session, _| {
            detached = session.stream.take();
            session.status = status;
        });
        (next, detached)
    }

    /// Return a session to `Idle`, recording an error if there was one.
    pub fn end_operation(&self, id: &str, error: Option<String>) -> Self {
        self.update_session(id, |session, _| {
            session.status = SessionStatus::Idle;
            if error.is_some() {
                session.last_error = error;
            }
        })
    }

    pub fn with_cleared_transcript(&self, id: &str) -> Self {
        self.update_session(id, |session, _| {
            session.transcript.clear();
            session.status = SessionStatus::Idle;
            session.last_error = None;
        })
    }

    /// Rebind a session to another model. Identity is kept, the
    /// transcript is reset in the same step.
    pub fn with_model(&self, id: &str, model_id: &str) -> Self {
        self.update_session(id, |session, _| {
            session.model_id = model_id.to_string();
            session.transcript.clear();
            session.status = SessionStatus::Idle;
            session.last_error = None;
        })
    }

    /// Mark a dispatch as in flight and append the user's turn to every
    /// idle session in one step. Returns `None` when a dispatch is
    /// already running.
    pub fn begin_dispatch(
        &self,
        prompt: &str,
        image: Option<&str>,
    ) -> Option<(Self, Vec<DispatchTarget>)> {
        if self.loading {
            return None;
        }
        let mut next = self.clone();
        next.loading = true;

        let mut targets = Vec::new();
        let created_at = Utc::now();
        for slot in next.sessions.iter_mut() {
            if slot.status != SessionStatus::Idle {
                continue;
            }
            let mut session = Session::clone(slot);
            next.next_message_id += 1;
            session.transcript.push(Message {
                id: next.next_message_id,
                role: Role::User,
                content: prompt.to_string(),
                model_id: USER_MODEL_ID.to_string(),
                image: image.map(str::to_string),
                created_at,
            });
            let handle = StreamHandle::new();
            session.stream = Some(handle.clone());
            session.status = SessionStatus::Streaming;
            session.last_error = None;
            targets.push(DispatchTarget {
                session_id: session.id.clone(),
                model_id: session.model_id.clone(),
                handle,
            });
            *slot = Arc::new(session);
        }
        Some((next, targets))
    }

    /// Append the empty assistant message a stream writes into.
    pub fn open_assistant(&self, session_id: &str, handle_id: Uuid) -> Self {
        self.update_session(session_id, |session, next_message_id| {
            if !session.owns_stream(handle_id) {
                return;
            }
            *next_message_id += 1;
            session.transcript.push(Message {
                id: *next_message_id,
                role: Role::Assistant,
                content: String::new(),
                model_id: session.model_id.clone(),
                image: None,
                created_at: Utc::now(),
            });
        })
    }

    /// Grow the trailing assistant message. Increments from a stream
    /// that was cancelled or replaced are dropped.
    pub fn append_increment(&self, session_id: &str, handle_id: Uuid, text: &str) -> Self {
        self.update_session(session_id, |session, _| {
            if !session.owns_stream(handle_id) {
                return;
            }
            if let Some(last) = session.transcript.last_mut()
                && last.role == Role::Assistant
            {
                last.content.push_str(text);
            }
        })
    }

    pub fn finish_stream(&self, session_id: &str, handle_id: Uuid, error: Option<String>) -> Self {
        self.update_session(session_id, |session, _| {
            let owned = session
                .stream
                .as_ref()
                .is_some_and(|handle| handle.id() == handle_id);
            if !owned {
                return;
            }
            session.stream = None;
            if session.status == SessionStatus::Streaming {
                session.status = SessionStatus::Idle;
            }
            session.last_error = error;
        })
    }

    pub fn end_dispatch(&self) -> Self {
        Self {
            loading: false,
            ..self.clone()
        }
    }
}
