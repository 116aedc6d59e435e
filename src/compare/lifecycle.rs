//! Create, rebind, clear and delete sessions, keeping the registry and
//! the backend's remote contexts in step.
//!
//! Destructive operations are gated by `requires_confirmation`. The
//! gate is checked in the same registry transition that starts the
//! operation, so a refused operation never changes anything.
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use super::catalog::Catalog;
use super::models::{Registry, Session, SessionStatus, StreamHandle};
use super::store::SessionStore;
use crate::backend::{BackendError, ChatBackend};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Create,
    ChangeModel,
    Clear,
    Delete,
    Reselect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Unconfirmed,
}

/// Whether `operation` on a session must be confirmed by the user first.
pub fn requires_confirmation(operation: Operation, transcript_is_empty: bool) -> bool {
    match operation {
        Operation::ChangeModel => !transcript_is_empty,
        Operation::Clear | Operation::Delete => true,
        Operation::Create | Operation::Reselect => false,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{0:?} must be confirmed")]
    ConfirmationRequired(Operation),
    #[error("no session with id {0}")]
    UnknownSession(String),
    #[error("model {0} is not in the catalog")]
    UnknownModel(String),
    #[error("at most {0} models can be compared at once")]
    SessionLimit(usize),
    #[error("session {0} is busy with another operation")]
    Busy(String),
    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result of replacing the whole set of active models.
#[derive(Debug, Default)]
pub struct ReselectReport {
    pub kept: Vec<String>,
    pub created: Vec<String>,
    pub dropped: Vec<String>,
    /// Remote teardown or initialization that failed, by session id.
    /// The local selection stands regardless.
    pub errors: Vec<(String, LifecycleError)>,
}

pub struct SessionController<B: ?Sized> {
    backend: Arc<B>,
    store: SessionStore,
    max_sessions: usize,
    timeout: Option<Duration>,
}

impl<B: ChatBackend + ?Sized> SessionController<B> {
    pub fn new(backend: Arc<B>, store: SessionStore, max_sessions: usize) -> Self {
        Self {
            backend,
            store,
            max_sessions,
            timeout: None,
        }
    }

    /// Bound every backend call made by a lifecycle operation. A call
    /// that runs out fails with `LifecycleError::Timeout` and the
    /// session is released like on any other backend failure.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Fetch the catalog from the backend and publish it.
    pub async fn refresh_catalog(&self) -> Result<Catalog, LifecycleError> {
        let catalog = Catalog::new(self.backend.models().await?);
        tracing::debug!("Loaded {} models", catalog.len());
        self.store
            .apply(|registry| registry.with_catalog(catalog.clone()));
        Ok(catalog)
    }

    /// Load the catalog and, if nothing is open yet, open one session on
    /// the first model. Returns the new session's id.
    pub async fn bootstrap(&self) -> Result<Option<String>, LifecycleError> {
        let catalog = self.refresh_catalog().await?;
        if !self.store.snapshot().is_empty() {
            return Ok(None);
        }
        match catalog.first() {
            Some(entry) => Ok(Some(self.create(&entry.id).await?)),
            None => {
                tracing::warn!("Model catalog is empty, no default session created");
                Ok(None)
            }
        }
    }

    /// Applied to every session from now on. Blank prompts unset it.
    pub fn set_system_prompt(&self, system_prompt: Option<String>) {
        self.store
            .apply(|registry| registry.with_system_prompt(system_prompt));
    }

    /// Open a new session on `model_id`. Nothing is added locally if the
    /// backend fails to initialize the remote context.
    pub async fn create(&self, model_id: &str) -> Result<String, LifecycleError> {
        let registry = self.store.snapshot();
        self.check_model(&registry, model_id)?;
        if registry.len() >= self.max_sessions {
            return Err(LifecycleError::SessionLimit(self.max_sessions));
        }

        let session = Session::new(model_id);
        let session_id = session.id.clone();
        self.bounded(
            self.backend
                .init_session(&session_id, model_id, registry.system_prompt()),
        )
        .await?;

        let max_sessions = self.max_sessions;
        let added = self.store.transition(|registry| {
            if registry.len() >= max_sessions {
                return (registry.clone(), false);
            }
            (registry.with_session(session), true)
        });
        if !added {
            // Lost a race with another create, drop the remote context again
            if let Err(e) = self.bounded(self.backend.delete_session(&session_id)).await {
                tracing::warn!("Failed to tear down unused session {}: {}", session_id, e);
            }
            return Err(LifecycleError::SessionLimit(self.max_sessions));
        }

        tracing::info!("Created session {} on {}", session_id, model_id);
        Ok(session_id)
    }

    /// Rebind a session to another model. Any live stream is cancelled,
    /// the old remote context torn down and a new one initialized. Only
    /// then are the model id and the (now empty) transcript swapped in,
    /// in a single step. On failure the session stays on its old model
    /// with its transcript intact.
    pub async fn change_model(
        &self,
        session_id: &str,
        model_id: &str,
        confirmation: Confirmation,
    ) -> Result<(), LifecycleError> {
        self.check_model(&self.store.snapshot(), model_id)?;

        let begun = self.store.transition(|registry| {
            let check = begin_check(registry, session_id, Operation::ChangeModel, confirmation);
            let session = match check {
                Ok(session) => session,
                Err(e) => return (registry.clone(), Err(e)),
            };
            if session.model_id == model_id {
                return (registry.clone(), Ok(None));
            }
            let (next, detached) =
                registry.begin_operation(session_id, SessionStatus::ModelChanging);
            (next, Ok(Some(detached)))
        })?;
        let Some(detached) = begun else {
            return Ok(());
        };
        cancel(detached);

        let system_prompt = self.store.snapshot().system_prompt().map(str::to_string);
        let rebound = self
            .bounded(async {
                self.backend.delete_session(session_id).await?;
                self.backend
                    .init_session(session_id, model_id, system_prompt.as_deref())
                    .await
            })
            .await;

        match rebound {
            Ok(()) => {
                self.store
                    .apply(|registry| registry.with_model(session_id, model_id));
                tracing::info!("Session {} switched to {}", session_id, model_id);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to switch session {} to {}: {}", session_id, model_id, e);
                self.store
                    .apply(|registry| registry.end_operation(session_id, Some(e.to_string())));
                Err(e)
            }
        }
    }

    /// Reset a session's transcript, remotely first. The local
    /// transcript is only emptied when the backend succeeds.
    pub async fn clear(
        &self,
        session_id: &str,
        confirmation: Confirmation,
    ) -> Result<(), LifecycleError> {
        let detached = self.store.transition(|registry| {
            match begin_check(registry, session_id, Operation::Clear, confirmation) {
                Ok(_) => {
                    let (next, detached) =
                        registry.begin_operation(session_id, SessionStatus::Clearing);
                    (next, Ok(detached))
                }
                Err(e) => (registry.clone(), Err(e)),
            }
        })?;
        cancel(detached);

        match self.bounded(self.backend.clear_session(session_id)).await {
            Ok(()) => {
                self.store
                    .apply(|registry| registry.with_cleared_transcript(session_id));
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to clear session {}: {}", session_id, e);
                self.store
                    .apply(|registry| registry.end_operation(session_id, Some(e.to_string())));
                Err(e)
            }
        }
    }

    /// Remove a session. Local removal happens first and always sticks,
    /// a failed remote teardown is only reported.
    pub async fn delete(
        &self,
        session_id: &str,
        confirmation: Confirmation,
    ) -> Result<(), LifecycleError> {
        if confirmation != Confirmation::Confirmed
            && requires_confirmation(Operation::Delete, false)
        {
            return Err(LifecycleError::ConfirmationRequired(Operation::Delete));
        }

        let removed = self
            .store
            .transition(|registry| registry.without_session(session_id))
            .ok_or_else(|| LifecycleError::UnknownSession(session_id.to_string()))?;
        cancel(removed.stream.clone());
        tracing::info!("Deleted session {}", session_id);

        self.bounded(self.backend.delete_session(session_id))
            .await
            .inspect_err(|e| {
                tracing::error!("Failed to delete remote session {}: {}", session_id, e);
            })
    }

    /// Replace the set of active models. Sessions already on a selected
    /// model are kept as they are, the rest are dropped and new sessions
    /// are opened for models that had none.
    pub async fn reselect(&self, model_ids: &[String]) -> Result<ReselectReport, LifecycleError> {
        let mut seen = HashSet::new();
        let model_ids: Vec<&String> = model_ids.iter().filter(|id| seen.insert(*id)).collect();
        if model_ids.len() > self.max_sessions {
            return Err(LifecycleError::SessionLimit(self.max_sessions));
        }
        let registry = self.store.snapshot();
        for model_id in &model_ids {
            self.check_model(&registry, model_id)?;
        }

        let mut report = self.store.transition(|registry| {
            let mut report = ReselectReport::default();
            let mut remaining = registry.shared_sessions();

            let mut sessions = Vec::with_capacity(model_ids.len());
            for model_id in &model_ids {
                match remaining.iter().position(|s| &s.model_id == *model_id) {
                    Some(idx) => {
                        let kept = remaining.remove(idx);
                        report.kept.push(kept.id.clone());
                        sessions.push(kept);
                    }
                    None => {
                        let session = Session::new(model_id);
                        report.created.push(session.id.clone());
                        sessions.push(Arc::new(session));
                    }
                }
            }
            for dropped in remaining {
                cancel(dropped.stream.clone());
                report.dropped.push(dropped.id.clone());
            }
            (registry.with_sessions(sessions), report)
        });

        // Remote contexts catch up afterwards, best-effort
        let snapshot = self.store.snapshot();
        let system_prompt = snapshot.system_prompt();
        let teardowns = report.dropped.iter().map(|id| async move {
            (id.clone(), self.bounded(self.backend.delete_session(id)).await)
        });
        let inits = report.created.iter().filter_map(|id| {
            let model_id = snapshot.session(id)?.model_id.clone();
            Some(async move {
                let init = self.backend.init_session(id, &model_id, system_prompt);
                (id.clone(), self.bounded(init).await)
            })
        });
        let (teardowns, inits) = futures::join!(join_all(teardowns), join_all(inits));

        for (id, result) in teardowns.into_iter().chain(inits) {
            if let Err(e) = result {
                tracing::warn!("Remote update for session {} failed: {}", id, e);
                report.errors.push((id, e));
            }
        }

        tracing::info!(
            "Reselected models: kept {}, created {}, dropped {}",
            report.kept.len(),
            report.created.len(),
            report.dropped.len()
        );
        Ok(report)
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, LifecycleError> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| LifecycleError::Timeout(timeout))?
                .map_err(LifecycleError::from),
            None => Ok(call.await?),
        }
    }

    fn check_model(&self, registry: &Registry, model_id: &str) -> Result<(), LifecycleError> {
        if registry.catalog().contains(model_id) {
            Ok(())
        } else {
            Err(LifecycleError::UnknownModel(model_id.to_string()))
        }
    }
}

/// Find the session an operation applies to and check it may start.
fn begin_check<'a>(
    registry: &'a Registry,
    session_id: &str,
    operation: Operation,
    confirmation: Confirmation,
) -> Result<&'a Session, LifecycleError> {
    let session = registry
        .session(session_id)
        .ok_or_else(|| LifecycleError::UnknownSession(session_id.to_string()))?;
    if matches!(
        session.status,
        SessionStatus::ModelChanging | SessionStatus::Clearing
    ) {
        return Err(LifecycleError::Busy(session_id.to_string()));
    }
    if confirmation != Confirmation::Confirmed
        && requires_confirmation(operation, session.transcript.is_empty())
    {
        return Err(LifecycleError::ConfirmationRequired(operation));
    }
    Ok(session)
}

fn cancel(handle: Option<StreamHandle>) {
    if let Some(handle) = handle {
        handle.cancel();
    }
}
