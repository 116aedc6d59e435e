//! Test utilities for integration tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use modelduel::backend::{BackendError, ByteStream, ChatBackend, CompareRequest};
use modelduel::compare::{
    Capabilities, Comparison, DispatchConfig, ModelCatalogEntry, Registry,
};

/// What the fake backend streams back for a model.
#[derive(Clone, Debug)]
pub enum Script {
    /// Send these raw chunks and end the stream.
    Chunks(Vec<String>),
    /// Refuse to open the stream.
    FailOpen(u16),
    /// Send these chunks, then break the connection.
    FailAfter(Vec<String>),
    /// Send these chunks, then never send anything again.
    Hang(Vec<String>),
    /// Accept the request but never answer it.
    Stall,
}

/// In-memory `ChatBackend` that records every call it receives.
#[derive(Default)]
pub struct FakeBackend {
    catalog: Vec<ModelCatalogEntry>,
    scripts: Mutex<HashMap<String, Script>>,
    failing_inits: Mutex<HashSet<String>>,
    stalling_inits: Mutex<HashSet<String>>,
    fail_delete: AtomicBool,
    fail_clear: AtomicBool,
    pub requests: Mutex<Vec<CompareRequest>>,
    pub deleted: Mutex<Vec<String>>,
    pub cleared: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new(catalog: Vec<ModelCatalogEntry>) -> Self {
        Self {
            catalog,
            ..Default::default()
        }
    }

    /// A backend whose catalog holds text only models with these ids.
    pub fn with_models(ids: &[&str]) -> Self {
        Self::new(ids.iter().map(|id| entry(id, false)).collect())
    }

    pub fn script(&self, model: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(model.to_string(), script);
    }

    pub fn fail_init(&self, model: &str) {
        self.failing_inits
            .lock()
            .unwrap()
            .insert(model.to_string());
    }

    /// Initializing a context for `model` never gets an answer.
    pub fn stall_init(&self, model: &str) {
        self.stalling_inits
            .lock()
            .unwrap()
            .insert(model.to_string());
    }

    pub fn fail_delete(&self) {
        self.fail_delete.store(true, Ordering::SeqCst);
    }

    pub fn fail_clear(&self) {
        self.fail_clear.store(true, Ordering::SeqCst);
    }

    /// Requests that carried a prompt.
    pub fn prompts(&self) -> Vec<CompareRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !r.is_init())
            .cloned()
            .collect()
    }

    /// `(chat_id, model)` of every remote context initialized.
    pub fn inits(&self) -> Vec<(String, String)> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.is_init())
            .map(|r| (r.chat_id.clone(), r.model.clone()))
            .collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn cleared(&self) -> Vec<String> {
        self.cleared.lock().unwrap().clone()
    }
}

fn server_error(status: u16) -> BackendError {
    BackendError::Status {
        status,
        body: r#"{"detail": "Internal Server Error"}"#.to_string(),
    }
}

fn chunks(chunks: Vec<String>) -> impl futures::Stream<Item = Result<Vec<u8>, BackendError>> {
    stream::iter(chunks.into_iter().map(|c| Ok(c.into_bytes())))
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn models(&self) -> Result<Vec<ModelCatalogEntry>, BackendError> {
        Ok(self.catalog.clone())
    }

    async fn compare(&self, request: &CompareRequest) -> Result<ByteStream, BackendError> {
        self.requests.lock().unwrap().push(request.clone());

        if request.is_init() {
            let stalls = self.stalling_inits.lock().unwrap().contains(&request.model);
            if stalls {
                return futures::future::pending().await;
            }
            if self.failing_inits.lock().unwrap().contains(&request.model) {
                return Err(server_error(500));
            }
            return Ok(stream::empty().boxed());
        }

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&request.model)
            .cloned()
            .unwrap_or(Script::Chunks(Vec::new()));
        let stream = match script {
            Script::Chunks(c) => chunks(c).boxed(),
            Script::FailOpen(status) => return Err(server_error(status)),
            Script::FailAfter(c) => chunks(c)
                .chain(stream::once(async {
                    Err(BackendError::Body("connection reset".to_string()))
                }))
                .boxed(),
            Script::Hang(c) => chunks(c).chain(stream::pending()).boxed(),
            Script::Stall => return futures::future::pending().await,
        };
        Ok(stream)
    }

    async fn delete_session(&self, chat_id: &str) -> Result<(), BackendError> {
        self.deleted.lock().unwrap().push(chat_id.to_string());
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(server_error(500));
        }
        Ok(())
    }

    async fn clear_session(&self, chat_id: &str) -> Result<(), BackendError> {
        self.cleared.lock().unwrap().push(chat_id.to_string());
        if self.fail_clear.load(Ordering::SeqCst) {
            return Err(server_error(500));
        }
        Ok(())
    }
}

pub fn entry(id: &str, image: bool) -> ModelCatalogEntry {
    ModelCatalogEntry {
        id: id.to_string(),
        name: id.to_uppercase(),
        provider: "test".to_string(),
        provider_name: "Test".to_string(),
        icon_url: String::new(),
        provider_icon_url: String::new(),
        capabilities: Capabilities {
            text: true,
            image,
            code: false,
        },
    }
}

/// SSE frames the way the backend writes them, one per increment.
pub fn sse(increments: &[&str]) -> Vec<String> {
    increments
        .iter()
        .map(|text| format!("data: {}\n\n", serde_json::json!({ "chunk": text, "chatId": "x" })))
        .collect()
}

/// A comparison over `backend` with a catalog already loaded.
pub async fn comparison(
    backend: Arc<FakeBackend>,
    config: DispatchConfig,
) -> Arc<Comparison<FakeBackend>> {
    let comparison = Comparison::new(backend, config, 4);
    comparison
        .sessions()
        .refresh_catalog()
        .await
        .expect("Failed to load catalog");
    Arc::new(comparison)
}

/// Wait until the published registry satisfies `condition`.
pub async fn wait_for(
    comparison: &Comparison<FakeBackend>,
    condition: impl Fn(&Registry) -> bool,
) -> Registry {
    let mut updates = comparison.store().updates();
    let current = comparison.snapshot();
    if condition(&current) {
        return current;
    }
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(registry) = updates.next().await {
            if condition(&registry) {
                return registry;
            }
        }
        panic!("Registry updates ended");
    })
    .await
    .expect("Timed out waiting for registry")
}
