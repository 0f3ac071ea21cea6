//! Subscribe to joins/leaves and query connected peers.

use crate::ack::AckRegistry;
use crate::connection::Connection;
use crate::error::{ClientError, ErrorKind};
use crate::message::{Action, Message, Topic};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

pub type PresenceCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

struct State {
    listeners: Vec<(u64, PresenceCallback)>,
    pending_queries: VecDeque<oneshot::Sender<Vec<String>>>,
}

pub struct PresenceHandler {
    connection: Arc<Connection>,
    ack_registry: Arc<AckRegistry>,
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl PresenceHandler {
    pub fn new(connection: Arc<Connection>) -> Arc<Self> {
        let ack_registry = connection.ack_registry();
        let handler = Arc::new(PresenceHandler {
            connection,
            ack_registry,
            state: Mutex::new(State {
                listeners: Vec::new(),
                pending_queries: VecDeque::new(),
            }),
            next_id: AtomicU64::new(1),
        });
        let weak = Arc::downgrade(&handler);
        handler.connection.resubscribe_coordinator().register(Box::new(move || {
            if let Some(handler) = weak.upgrade() {
                handler.resubscribe();
            }
        }));
        handler
    }

    fn resubscribe(&self) {
        let has_listeners = !self.state.lock().expect("PresenceHandler mutex poisoned").listeners.is_empty();
        if has_listeners {
            self.send_subscribe();
        }
    }

    fn send_subscribe(&self) {
        self.ack_registry.add(
            Topic::Presence,
            Action::Subscribe,
            "",
            self.connection.config().subscription_timeout,
            ErrorKind::AckTimeout,
        );
        self.connection.send(&Message::new(
            Topic::Presence,
            Action::Subscribe,
            vec![Action::Subscribe.code().to_string()],
        ));
    }

    pub fn subscribe(&self, cb: PresenceCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().expect("PresenceHandler mutex poisoned");
        let was_empty = state.listeners.is_empty();
        state.listeners.push((id, cb));
        drop(state);
        if was_empty {
            self.send_subscribe();
        }
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut state = self.state.lock().expect("PresenceHandler mutex poisoned");
        state.listeners.retain(|(i, _)| *i != id);
        let now_empty = state.listeners.is_empty();
        drop(state);
        if now_empty {
            self.ack_registry.add(
                Topic::Presence,
                Action::Unsubscribe,
                "",
                self.connection.config().subscription_timeout,
                ErrorKind::AckTimeout,
            );
            self.connection.send(&Message::new(
                Topic::Presence,
                Action::Unsubscribe,
                vec![Action::Unsubscribe.code().to_string()],
            ));
        }
    }

    /// Blocks (awaits) for the server's peer listing.
    pub async fn get_all(&self) -> Result<Vec<String>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().expect("PresenceHandler mutex poisoned").pending_queries.push_back(tx);
        self.connection.send(&Message::new(
            Topic::Presence,
            Action::Query,
            vec![Action::Query.code().to_string()],
        ));
        rx.await.map_err(|_| ClientError::IsClosed)
    }

    pub fn handle_message(&self, msg: Message) {
        match msg.action {
            Action::Ack => {
                let nested = msg.field(0);
                match nested {
                    Some("S") => self.ack_registry.clear(Topic::Presence, Action::Subscribe, ""),
                    Some("US") => self.ack_registry.clear(Topic::Presence, Action::Unsubscribe, ""),
                    _ => {}
                }
            }
            Action::Query => {
                let peers: Vec<String> = msg.data.iter().skip(1).cloned().collect();
                if let Some(tx) = self.state.lock().expect("PresenceHandler mutex poisoned").pending_queries.pop_front() {
                    let _ = tx.send(peers);
                }
            }
            Action::PresenceJoin => {
                if let Some(client_name) = msg.field(0) {
                    self.notify(client_name, true);
                }
            }
            Action::PresenceLeave => {
                if let Some(client_name) = msg.field(0) {
                    self.notify(client_name, false);
                }
            }
            other => log::warn!("unexpected PRESENCE action {:?}", other),
        }
    }

    /// Drops every pending `get_all` sender so its waiter's `rx.await`
    /// resolves to `IS_CLOSED` instead of hanging forever.
    pub fn close(&self) {
        self.state.lock().expect("PresenceHandler mutex poisoned").pending_queries.clear();
    }

    fn notify(&self, client_name: &str, joined: bool) {
        let callbacks: Vec<PresenceCallback> = self
            .state
            .lock()
            .expect("PresenceHandler mutex poisoned")
            .listeners
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(client_name, joined);
        }
    }
}
