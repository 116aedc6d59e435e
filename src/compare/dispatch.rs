//! Fan a single prompt out to every active session at once.
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures_util::StreamExt;

use super::decoder::{DecodeStats, DedupPolicy, Increments};
use super::models::{DispatchTarget, Registry};
use super::store::SessionStore;
use crate::backend::{BackendError, ByteStream, ChatBackend, CompareRequest};

/// Why a submission was not dispatched. These are no-ops for the
/// caller, nothing was mutated and no request was sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("a submission is already in flight")]
    AlreadyInFlight,
    #[error("no idle sessions to send to")]
    NoSessions,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("could not open stream: {0}")]
    Open(BackendError),
    #[error("stream read failed: {0}")]
    Read(BackendError),
    #[error("no data received for {0:?}")]
    IdleTimeout(Duration),
}

#[derive(Debug)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    Failed(StreamError),
}

/// How one session's stream ended.
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: String,
    pub model_id: String,
    pub outcome: StreamOutcome,
    pub stats: DecodeStats,
    /// Text accepted from the stream, whether or not it was applied
    pub text: String,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub sessions: Vec<SessionReport>,
}

impl DispatchReport {
    pub fn get(&self, session_id: &str) -> Option<&SessionReport> {
        self.sessions.iter().find(|s| s.session_id == session_id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &SessionReport> {
        self.sessions
            .iter()
            .filter(|s| matches!(s.outcome, StreamOutcome::Failed(_)))
    }

    pub fn completed(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| matches!(s.outcome, StreamOutcome::Completed))
            .count()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DispatchConfig {
    /// Longest wait for the next read of a stream. `None` waits forever.
    pub idle_timeout: Option<Duration>,
    pub dedup: DedupPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(120)),
            dedup: DedupPolicy::default(),
        }
    }
}

/// Clears the loading flag and any stream still attached to a target,
/// including when the dispatch future is dropped part way through.
struct InFlight<'a> {
    store: &'a SessionStore,
    targets: Vec<DispatchTarget>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let targets = std::mem::take(&mut self.targets);
        self.store.apply(|registry| {
            targets
                .iter()
                .fold(registry.end_dispatch(), |registry, target| {
                    registry.finish_stream(
                        &target.session_id,
                        target.handle.id(),
                        Some("dispatch abandoned".to_string()),
                    )
                })
        });
    }
}

pub struct Dispatcher<B: ?Sized> {
    backend: Arc<B>,
    store: SessionStore,
    config: DispatchConfig,
}

impl<B: ChatBackend + ?Sized> Dispatcher<B> {
    pub fn new(backend: Arc<B>, store: SessionStore, config: DispatchConfig) -> Self {
        Self {
            backend,
            store,
            config,
        }
    }

    /// Send `prompt` to every idle session concurrently and stream each
    /// answer into its own transcript. Resolves once every stream has
    /// ended, successfully or not.
    pub async fn dispatch(
        &self,
        prompt: &str,
        image: Option<&str>,
    ) -> Result<DispatchReport, Rejection> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(Rejection::EmptyPrompt);
        }

        // Everything a request needs is captured here in one transition
        // so later edits to the registry can't race with the requests.
        let requests = self.store.transition(|registry| {
            if registry.is_loading() {
                return (registry.clone(), Err(Rejection::AlreadyInFlight));
            }
            match registry.begin_dispatch(prompt, image) {
                Some((_, targets)) if targets.is_empty() => {
                    (registry.clone(), Err(Rejection::NoSessions))
                }
                Some((next, targets)) => {
                    let requests = build_requests(&next, targets, prompt, image);
                    (next, Ok(requests))
                }
                None => (registry.clone(), Err(Rejection::AlreadyInFlight)),
            }
        })?;

        tracing::info!("Dispatching prompt to {} sessions", requests.len());

        let _in_flight = InFlight {
            store: &self.store,
            targets: requests.iter().map(|(target, _)| target.clone()).collect(),
        };
        let streams = requests
            .into_iter()
            .map(|(target, request)| self.run_stream(target, request));
        let sessions = join_all(streams).await;

        Ok(DispatchReport { sessions })
    }

    async fn run_stream(&self, target: DispatchTarget, request: CompareRequest) -> SessionReport {
        let DispatchTarget {
            session_id,
            model_id,
            handle,
        } = target;
        let token = handle.token().clone();

        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            opened = open_stream(self.backend.as_ref(), &request, self.config.idle_timeout) => {
                Some(opened)
            }
        };
        let stream = match opened {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                return self.finish(
                    session_id,
                    model_id,
                    handle.id(),
                    StreamOutcome::Failed(e),
                    None,
                );
            }
            None => {
                return self.finish(
                    session_id,
                    model_id,
                    handle.id(),
                    StreamOutcome::Cancelled,
                    None,
                );
            }
        };

        self.store
            .apply(|registry| registry.open_assistant(&session_id, handle.id()));

        let mut increments = Increments::new(stream, self.config.dedup).labelled(&session_id);
        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break StreamOutcome::Cancelled,
                next = next_increment(&mut increments, self.config.idle_timeout) => next,
            };
            match next {
                Ok(Some(Ok(increment))) => self.store.apply(|registry| {
                    registry.append_increment(&session_id, handle.id(), &increment)
                }),
                Ok(Some(Err(e))) => break StreamOutcome::Failed(StreamError::Read(e)),
                Ok(None) => break StreamOutcome::Completed,
                Err(idle) => break StreamOutcome::Failed(StreamError::IdleTimeout(idle)),
            }
        };

        self.finish(session_id, model_id, handle.id(), outcome, Some(&increments))
    }

    fn finish(
        &self,
        session_id: String,
        model_id: String,
        handle_id: uuid::Uuid,
        outcome: StreamOutcome,
        increments: Option<&Increments<ByteStream>>,
    ) -> SessionReport {
        let error = match &outcome {
            StreamOutcome::Failed(e) => {
                tracing::warn!("Stream for session {} ({}) failed: {}", session_id, model_id, e);
                Some(e.to_string())
            }
            StreamOutcome::Cancelled => {
                tracing::debug!("Stream for session {} was cancelled", session_id);
                None
            }
            StreamOutcome::Completed => None,
        };
        self.store
            .apply(|registry| registry.finish_stream(&session_id, handle_id, error));

        let (stats, text) = increments
            .map(|i| (i.stats(), i.text().to_string()))
            .unwrap_or_default();
        if stats.skipped_malformed > 0 || stats.dropped_duplicates > 0 {
            tracing::debug!(
                "Session {} skipped {} malformed frames and dropped {} duplicates",
                session_id,
                stats.skipped_malformed,
                stats.dropped_duplicates
            );
        }

        SessionReport {
            session_id,
            model_id,
            outcome,
            stats,
            text,
        }
    }
}

/// Build one request per target. Images only go to models whose
/// catalog entry says they can take one.
fn build_requests(
    registry: &Registry,
    targets: Vec<DispatchTarget>,
    prompt: &str,
    image: Option<&str>,
) -> Vec<(DispatchTarget, CompareRequest)> {
    targets
        .into_iter()
        .map(|target| {
            let accepts_image = registry.catalog().capabilities(&target.model_id).image;
            if image.is_some() && !accepts_image {
                tracing::debug!("Withholding image from {}", target.model_id);
            }
            let request = CompareRequest::new(
                prompt,
                image.filter(|_| accepts_image),
                &target.model_id,
                &target.session_id,
                registry.system_prompt(),
            );
            (target, request)
        })
        .collect()
}

/// Open the response stream. Waiting for the response headers counts
/// against the idle timeout like any later read.
async fn open_stream<B: ChatBackend + ?Sized>(
    backend: &B,
    request: &CompareRequest,
    idle_timeout: Option<Duration>,
) -> Result<ByteStream, StreamError> {
    let opened = match idle_timeout {
        Some(idle) => tokio::time::timeout(idle, backend.compare(request))
            .await
            .map_err(|_| StreamError::IdleTimeout(idle))?,
        None => backend.compare(request).await,
    };
    opened.map_err(StreamError::Open)
}

/// Next increment, or the idle timeout that expired waiting for it.
async fn next_increment(
    increments: &mut Increments<ByteStream>,
    idle_timeout: Option<Duration>,
) -> Result<Option<Result<String, BackendError>>, Duration> {
    match idle_timeout {
        Some(idle) => tokio::time::timeout(idle, increments.next())
            .await
            .map_err(|_| idle),
        None => Ok(increments.next().await),
    }
}
