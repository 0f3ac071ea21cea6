//! Multiplexes one-shot server requests by key: concurrent callers asking
//! for the same key share a single outgoing request and all get notified
//! when it resolves. On reconnect, every still-pending key is replayed
//! using its original send.

use crate::error::ClientError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

type Resend = Arc<dyn Fn() + Send + Sync>;

struct PendingEntry<T> {
    senders: Vec<oneshot::Sender<Result<T, ClientError>>>,
    resend: Resend,
}

pub struct SingleNotifier<T> {
    pending: Mutex<HashMap<String, PendingEntry<T>>>,
}

impl<T: Clone> SingleNotifier<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(SingleNotifier {
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a waiter for `key`. `send_fn` fires the outgoing request
    /// only the first time `key` becomes pending; later concurrent callers
    /// just queue behind it.
    pub fn request(
        &self,
        key: &str,
        send_fn: impl Fn() + Send + Sync + 'static,
    ) -> oneshot::Receiver<Result<T, ClientError>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().expect("SingleNotifier mutex poisoned");
        match pending.get_mut(key) {
            Some(entry) => entry.senders.push(tx),
            None => {
                let resend: Resend = Arc::new(send_fn);
                resend();
                pending.insert(
                    key.to_string(),
                    PendingEntry {
                        senders: vec![tx],
                        resend,
                    },
                );
            }
        }
        rx
    }

    /// Resolves every queued waiter for `key` with `result` and removes
    /// the entry.
    pub fn receive(&self, key: &str, result: Result<T, ClientError>) {
        let entry = self.pending.lock().expect("SingleNotifier mutex poisoned").remove(key);
        if let Some(entry) = entry {
            for tx in entry.senders {
                let _ = tx.send(result.clone());
            }
        }
    }

    pub fn receive_many(&self, keys: &[String], result: Result<T, ClientError>) {
        for key in keys {
            self.receive(key, result.clone());
        }
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().expect("SingleNotifier mutex poisoned").contains_key(key)
    }

    /// Resolves every pending waiter, for every key, with `IS_CLOSED`.
    /// Called when the owning client shuts down so no caller is left
    /// blocked forever.
    pub fn close_all(&self) {
        let entries: Vec<PendingEntry<T>> = self.pending.lock().expect("SingleNotifier mutex poisoned").drain().map(|(_, v)| v).collect();
        for entry in entries {
            for tx in entry.senders {
                let _ = tx.send(Err(ClientError::IsClosed));
            }
        }
    }

    /// Re-sends every currently pending key's original request, used on
    /// reconnect to resume outstanding requests.
    pub fn replay_all(&self) {
        let resends: Vec<Resend> = self
            .pending
            .lock()
            .expect("SingleNotifier mutex poisoned")
            .values()
            .map(|entry| entry.resend.clone())
            .collect();
        for resend in resends {
            resend();
        }
    }
}
