//! Shared holder for the current `Registry`.
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::BoxStream;
use tokio::sync::watch;

use super::models::Registry;

/// Cheap to clone. All clones observe and publish the same registry.
///
/// Writers take `writer` for the whole read-transition-publish step so
/// concurrent transitions are serialized. Readers never take it and
/// only ever see whole registries.
#[derive(Clone)]
pub struct SessionStore {
    tx: Arc<watch::Sender<Registry>>,
    writer: Arc<Mutex<()>>,
}

impl SessionStore {
    pub fn new(registry: Registry) -> Self {
        let (tx, _rx) = watch::channel(registry);
        Self {
            tx: Arc::new(tx),
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Current registry. Holding it does not block writers.
    pub fn snapshot(&self) -> Registry {
        self.tx.borrow().clone()
    }

    /// Receive every published registry, e.g. to re-render panes.
    pub fn subscribe(&self) -> watch::Receiver<Registry> {
        self.tx.subscribe()
    }

    /// Every registry published from now on. Intermediate values may
    /// be skipped when the consumer falls behind, the latest one never is.
    pub fn updates(&self) -> BoxStream<'static, Registry> {
        let mut rx = self.subscribe();
        Box::pin(async_stream::stream! {
            while rx.changed().await.is_ok() {
                let registry = rx.borrow_and_update().clone();
                yield registry;
            }
        })
    }

    /// Replace the registry with `f(current)`.
    pub fn apply(&self, f: impl FnOnce(&Registry) -> Registry) {
        self.transition(|current| (f(current), ()))
    }

    /// Like `apply` but the transition also hands back a value, e.g.
    /// stream handles that need cancelling.
    pub fn transition<T>(&self, f: impl FnOnce(&Registry) -> (Registry, T)) -> T {
        // Poisoning is harmless, the mutex guards no data
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();
        let (next, value) = f(&current);
        self.tx.send_replace(next);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::models::Session;

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let store = SessionStore::new(Registry::default());
        let mut rx = store.subscribe();

        store.apply(|r| r.with_session(Session::with_id("1", "a")));

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_updates_yield_latest_registry() {
        use futures_util::StreamExt;

        let store = SessionStore::new(Registry::default());
        let mut updates = store.updates();

        store.apply(|r| r.with_session(Session::with_id("1", "a")));
        store.apply(|r| r.with_session(Session::with_id("2", "b")));

        let latest = updates.next().await.unwrap();
        assert_eq!(latest.len(), 2);
    }

    #[test]
    fn test_concurrent_transitions_are_serialized() {
        let store = SessionStore::new(Registry::default());
        let writers: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("{}-{}", t, i);
                        let len = store.transition(|r| {
                            let next = r.with_session(Session::with_id(&id, "a"));
                            let len = next.len();
                            (next, len)
                        });
                        assert!(len >= i + 1);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(store.snapshot().len(), 400);
    }

    #[test]
    fn test_snapshot_is_stable_across_writes() {
        let store = SessionStore::new(Registry::default());
        store.apply(|r| r.with_session(Session::with_id("1", "a")));
        let before = store.snapshot();

        let removed = store.transition(|r| r.without_session("1"));

        assert!(removed.is_some());
        assert_eq!(before.len(), 1);
        assert!(store.snapshot().is_empty());
    }
}
