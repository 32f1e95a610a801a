use super::schema::AppConfig;
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Holds the current immutable config snapshot and notifies subscribers when
/// a reload swaps it.
///
/// Subscriber channels have capacity one and are sent to non-blockingly: a
/// subscriber that has not drained its previous notification simply gets the
/// newest snapshot once it does. Publishing never blocks on a slow reader.
pub struct ConfigBus {
    current: ArcSwap<AppConfig>,
    subscribers: Mutex<Option<Vec<mpsc::Sender<Arc<AppConfig>>>>>,
}

impl ConfigBus {
    pub fn new(initial: AppConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            subscribers: Mutex::new(Some(Vec::new())),
        }
    }

    /// The current snapshot. Cheap; safe to call from hot paths.
    pub fn current(&self) -> Arc<AppConfig> {
        self.current.load_full()
    }

    /// Register a subscriber. Each reload delivers the new snapshot; a closed
    /// channel (`recv` returning `None`) is the shutdown signal.
    pub fn subscribe(&self) -> mpsc::Receiver<Arc<AppConfig>> {
        let (tx, rx) = mpsc::channel(1);
        if let Some(subs) = self.subscribers.lock().unwrap().as_mut() {
            subs.push(tx);
        }
        rx
    }

    /// Swap in a new snapshot and notify all subscribers.
    pub fn publish(&self, config: AppConfig) {
        let snapshot = Arc::new(config);
        self.current.store(snapshot.clone());

        let subs = {
            let guard = self.subscribers.lock().unwrap();
            guard.as_ref().map(Vec::clone).unwrap_or_default()
        };

        for sub in &subs {
            // full slot means the subscriber will pick up `current()` anyway
            let _ = sub.try_send(snapshot.clone());
        }

        debug!(subscribers = subs.len(), "published config snapshot");
    }

    /// Close every subscriber channel. Idempotent; subsequent `subscribe`
    /// calls return channels that are already closed.
    pub fn close(&self) {
        if self.subscribers.lock().unwrap().take().is_some() {
            debug!("closed config bus");
        }
    }
}
