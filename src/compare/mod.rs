//! Side-by-side chat with several models.
//!
//! `Comparison` ties the pieces together: one `SessionStore` holding
//! the registry, a `Dispatcher` that fans prompts out and a
//! `SessionController` for everything that creates or tears down
//! sessions. All three share the same backend.
use std::sync::Arc;

use tokio::sync::watch;

pub mod catalog;
pub mod decoder;
pub mod dispatch;
pub mod lifecycle;
pub mod models;
pub mod store;

pub use catalog::{Capabilities, Catalog, ModelCatalogEntry};
pub use decoder::{DecodeStats, DedupPolicy, FrameDecoder, FrameSkip, Increments};
pub use dispatch::{
    DispatchConfig, DispatchReport, Dispatcher, Rejection, SessionReport, StreamError,
    StreamOutcome,
};
pub use lifecycle::{
    Confirmation, LifecycleError, Operation, ReselectReport, SessionController,
    requires_confirmation,
};
pub use models::{Message, Registry, Role, Session, SessionStatus, StreamHandle};
pub use store::SessionStore;

use crate::backend::ChatBackend;

pub struct Comparison<B: ?Sized> {
    store: SessionStore,
    dispatcher: Dispatcher<B>,
    controller: SessionController<B>,
}

impl<B: ChatBackend + ?Sized> Comparison<B> {
    pub fn new(backend: Arc<B>, config: DispatchConfig, max_sessions: usize) -> Self {
        let store = SessionStore::new(Registry::default());
        Self {
            dispatcher: Dispatcher::new(Arc::clone(&backend), store.clone(), config),
            controller: SessionController::new(backend, store.clone(), max_sessions)
                .with_timeout(config.idle_timeout),
            store,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionController<B> {
        &self.controller
    }

    pub fn snapshot(&self) -> Registry {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Registry> {
        self.store.subscribe()
    }

    pub async fn bootstrap(&self) -> Result<Option<String>, LifecycleError> {
        self.controller.bootstrap().await
    }

    pub async fn submit(
        &self,
        prompt: &str,
        image: Option<&str>,
    ) -> Result<DispatchReport, Rejection> {
        self.dispatcher.dispatch(prompt, image).await
    }
}
