//! Per-request deadlines, cleared by ack, firing a runtime error on miss.
//! At most one entry may exist per `(topic, action, name)` at a time.

use crate::error::{ErrorKind, RuntimeError};
use crate::message::{Action, Message, Topic};
use log::warn;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};

pub type AckKey = (Topic, Action, String);

fn key_of(topic: Topic, action: Action, name: &str) -> AckKey {
    (topic, action, name.to_string())
}

struct Entry {
    cancel: oneshot::Sender<()>,
}

/// Shared across the connection: `open_rx` reflects whether the connection
/// is currently `OPEN`. Timers only count down while it reads `true`; a
/// timer armed before `OPEN` simply waits for it.
pub struct AckRegistry {
    entries: Mutex<HashMap<AckKey, Entry>>,
    open_rx: watch::Receiver<bool>,
    error_handler: Arc<dyn Fn(RuntimeError) + Send + Sync>,
}

impl AckRegistry {
    pub fn new(open_rx: watch::Receiver<bool>, error_handler: Arc<dyn Fn(RuntimeError) + Send + Sync>) -> Arc<Self> {
        Arc::new(AckRegistry {
            entries: Mutex::new(HashMap::new()),
            open_rx,
            error_handler,
        })
    }

    /// Arm a deadline for `(topic, action, name)`. If one is already
    /// in-flight this is a silent no-op. `on_timeout` names which error
    /// kind to report if nothing clears the entry in time.
    pub fn add(
        self: &Arc<Self>,
        topic: Topic,
        action: Action,
        name: &str,
        timeout: Duration,
        on_timeout: ErrorKind,
    ) {
        let key = key_of(topic, action, name);
        let mut entries = self.entries.lock().expect("AckRegistry mutex poisoned");
        if entries.contains_key(&key) {
            return;
        }
        let (cancel_tx, cancel_rx) = oneshot::channel();
        entries.insert(key.clone(), Entry { cancel: cancel_tx });
        drop(entries);

        let registry = Arc::clone(self);
        let deadline = Instant::now() + timeout;
        let mut open_rx = self.open_rx.clone();
        tokio::spawn(async move {
            Self::run_timer(deadline, &mut open_rx, cancel_rx, registry, key, on_timeout).await;
        });
    }

    async fn run_timer(
        deadline: Instant,
        open_rx: &mut watch::Receiver<bool>,
        mut cancel_rx: oneshot::Receiver<()>,
        registry: Arc<Self>,
        key: AckKey,
        on_timeout: ErrorKind,
    ) {
        loop {
            let is_open = *open_rx.borrow();
            if is_open {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {
                        // Only fire if still armed (not cleared concurrently).
                        let fired = {
                            let mut entries = registry.entries.lock().expect("AckRegistry mutex poisoned");
                            entries.remove(&key).is_some()
                        };
                        if fired {
                            registry.fire_timeout(key, on_timeout);
                        }
                        return;
                    }
                    changed = open_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                    _ = &mut cancel_rx => {
                        return;
                    }
                }
            } else {
                tokio::select! {
                    changed = open_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                    _ = &mut cancel_rx => {
                        return;
                    }
                }
            }
        }
    }

    fn fire_timeout(&self, key: AckKey, on_timeout: ErrorKind) {
        let (topic, action, name) = key;
        let message = format!("no ack/response for {:?}|{:?}|{}", topic, action, name);
        warn!("{message}");
        (self.error_handler)(RuntimeError {
            topic,
            event: on_timeout,
            message,
        });
    }

    pub fn clear(&self, topic: Topic, action: Action, name: &str) {
        let key = key_of(topic, action, name);
        let mut entries = self.entries.lock().expect("AckRegistry mutex poisoned");
        if let Some(entry) = entries.remove(&key) {
            let _ = entry.cancel.send(());
        }
    }

    pub fn clear_message(&self, message: &Message) {
        if let Some(name) = message.field(0) {
            self.clear(message.topic, message.action, name);
        }
    }

    pub fn has(&self, topic: Topic, action: Action, name: &str) -> bool {
        let key = key_of(topic, action, name);
        self.entries.lock().expect("AckRegistry mutex poisoned").contains_key(&key)
    }

    pub fn clear_all(&self) {
        let mut entries = self.entries.lock().expect("AckRegistry mutex poisoned");
        for (_, entry) in entries.drain() {
            let _ = entry.cancel.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn clear_prevents_timeout() {
        let (open_tx, open_rx) = watch::channel(true);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let handler: Arc<dyn Fn(RuntimeError) + Send + Sync> = Arc::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        let registry = AckRegistry::new(open_rx, handler);
        registry.add(Topic::Record, Action::Subscribe, "x", Duration::from_millis(50), ErrorKind::AckTimeout);
        assert!(registry.has(Topic::Record, Action::Subscribe, "x"));
        registry.clear(Topic::Record, Action::Subscribe, "x");
        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(open_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_when_uncleared() {
        let (_open_tx, open_rx) = watch::channel(true);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let handler: Arc<dyn Fn(RuntimeError) + Send + Sync> = Arc::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        let registry = AckRegistry::new(open_rx, handler);
        registry.add(Topic::Rpc, Action::Request, "1", Duration::from_millis(50), ErrorKind::ResponseTimeout);
        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn add_is_noop_while_key_present() {
        let (_open_tx, open_rx) = watch::channel(true);
        let handler: Arc<dyn Fn(RuntimeError) + Send + Sync> = Arc::new(|_| {});
        let registry = AckRegistry::new(open_rx, handler);
        registry.add(Topic::Event, Action::Subscribe, "chat", Duration::from_millis(1000), ErrorKind::AckTimeout);
        registry.add(Topic::Event, Action::Subscribe, "chat", Duration::from_millis(1), ErrorKind::AckTimeout);
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert!(registry.has(Topic::Event, Action::Subscribe, "chat"));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_does_not_fire_before_open() {
        let (open_tx, open_rx) = watch::channel(false);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let handler: Arc<dyn Fn(RuntimeError) + Send + Sync> = Arc::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        let registry = AckRegistry::new(open_rx, handler);
        registry.add(Topic::Record, Action::Read, "x", Duration::from_millis(10), ErrorKind::ResponseTimeout);
        tokio::time::advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        open_tx.send(true).unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
