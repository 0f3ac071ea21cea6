//! Fire-and-forget pub/sub with a pattern-listen provider role.
//! `SUBSCRIBE` fires on the empty→non-empty transition of the local
//! listener set and `UNSUBSCRIBE` on non-empty→empty, rather than being
//! gated by whether any local listener currently exists.

use crate::ack::AckRegistry;
use crate::connection::Connection;
use crate::error::ErrorKind;
use crate::listener::{ListenCallback, Listener};
use crate::message::{Action, Message, Topic, WireValue};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type EventCallback = Arc<dyn Fn(Option<Value>) + Send + Sync>;

struct State {
    listeners: HashMap<String, Vec<(u64, EventCallback)>>,
    pattern_listeners: HashMap<String, Arc<Listener>>,
}

pub struct EventHandler {
    connection: Arc<Connection>,
    ack_registry: Arc<AckRegistry>,
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl EventHandler {
    pub fn new(connection: Arc<Connection>) -> Arc<Self> {
        let ack_registry = connection.ack_registry();
        let handler = Arc::new(EventHandler {
            connection,
            ack_registry,
            state: Mutex::new(State {
                listeners: HashMap::new(),
                pattern_listeners: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        });
        let weak = Arc::downgrade(&handler);
        handler.connection.resubscribe_coordinator().register(Box::new(move || {
            if let Some(handler) = weak.upgrade() {
                handler.resubscribe_all();
            }
        }));
        handler
    }

    pub fn subscribe(&self, name: &str, cb: impl Fn(Option<Value>) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().expect("EventHandler mutex poisoned");
        let entry = state.listeners.entry(name.to_string()).or_default();
        let was_empty = entry.is_empty();
        entry.push((id, Arc::new(cb)));
        drop(state);
        if was_empty {
            self.send_subscribe(name);
        }
        SubscriptionId(id)
    }

    fn send_subscribe(&self, name: &str) {
        self.ack_registry.add(
            Topic::Event,
            Action::Subscribe,
            name,
            self.connection.config().subscription_timeout,
            ErrorKind::AckTimeout,
        );
        self.connection
            .send(&Message::new(Topic::Event, Action::Subscribe, vec![name.to_string()]));
    }

    pub fn unsubscribe(&self, name: &str, id: SubscriptionId) {
        let mut state = self.state.lock().expect("EventHandler mutex poisoned");
        let now_empty = if let Some(entry) = state.listeners.get_mut(name) {
            entry.retain(|(i, _)| *i != id.0);
            entry.is_empty()
        } else {
            false
        };
        if now_empty {
            state.listeners.remove(name);
        }
        drop(state);
        if now_empty {
            self.ack_registry.add(
                Topic::Event,
                Action::Unsubscribe,
                name,
                self.connection.config().subscription_timeout,
                ErrorKind::AckTimeout,
            );
            self.connection
                .send(&Message::new(Topic::Event, Action::Unsubscribe, vec![name.to_string()]));
        }
    }

    /// Sends `EVENT|EVT|name|typed(data)?` and invokes every local
    /// listener (local fan-out happens regardless of the server
    /// round-trip).
    pub fn emit(&self, name: &str, data: Option<Value>) {
        let mut fields = vec![name.to_string()];
        if let Some(v) = &data {
            fields.push(WireValue::from_json(v).encode());
        }
        self.connection.send(&Message::new(Topic::Event, Action::Event, fields));
        let callbacks: Vec<EventCallback> = {
            let state = self.state.lock().expect("EventHandler mutex poisoned");
            state
                .listeners
                .get(name)
                .map(|v| v.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default()
        };
        for cb in callbacks {
            cb(data.clone());
        }
    }

    pub fn listen(&self, pattern: &str, cb: ListenCallback) -> Arc<Listener> {
        let listener = Listener::new(Topic::Event, pattern.to_string(), self.connection.clone(), cb);
        self.state
            .lock()
            .expect("EventHandler mutex poisoned")
            .pattern_listeners
            .insert(pattern.to_string(), listener.clone());
        listener
    }

    pub fn unlisten(&self, pattern: &str) {
        let listener = self
            .state
            .lock()
            .expect("EventHandler mutex poisoned")
            .pattern_listeners
            .remove(pattern);
        if let Some(listener) = listener {
            listener.destroy();
        }
    }

    pub fn handle_message(&self, msg: Message) {
        match msg.action {
            Action::Ack => {
                let nested = msg.field(0);
                let name = msg.field(1).unwrap_or("");
                match nested {
                    Some("S") => self.ack_registry.clear(Topic::Event, Action::Subscribe, name),
                    Some("US") => self.ack_registry.clear(Topic::Event, Action::Unsubscribe, name),
                    Some("L") => {
                        if let Some(listener) = self.pattern_listener(name) {
                            listener.handle_message(&msg);
                        }
                    }
                    _ => {}
                }
            }
            Action::Event => {
                if let Some(name) = msg.field(0) {
                    let data = msg.field(1).and_then(|f| WireValue::decode(f).ok()).map(|w| w.into_json());
                    let callbacks: Vec<EventCallback> = {
                        let state = self.state.lock().expect("EventHandler mutex poisoned");
                        state
                            .listeners
                            .get(name)
                            .map(|v| v.iter().map(|(_, cb)| cb.clone()).collect())
                            .unwrap_or_default()
                    };
                    for cb in callbacks {
                        cb(data.clone());
                    }
                }
            }
            Action::SubscriptionForPatternFound | Action::SubscriptionForPatternRemoved => {
                if let Some(pattern) = msg.field(0) {
                    if let Some(listener) = self.pattern_listener(pattern) {
                        listener.handle_message(&msg);
                    }
                }
            }
            other => log::warn!("unexpected EVENT action {:?}", other),
        }
    }

    fn pattern_listener(&self, pattern: &str) -> Option<Arc<Listener>> {
        self.state
            .lock()
            .expect("EventHandler mutex poisoned")
            .pattern_listeners
            .get(pattern)
            .cloned()
    }

    fn resubscribe_all(&self) {
        let names: Vec<String> = {
            let state = self.state.lock().expect("EventHandler mutex poisoned");
            state.listeners.keys().cloned().collect()
        };
        for name in names {
            self.send_subscribe(&name);
        }
        let listeners: Vec<Arc<Listener>> = {
            let state = self.state.lock().expect("EventHandler mutex poisoned");
            state.pattern_listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener.resubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::mock::MockTransport;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn open_connection() -> (Arc<Connection>, MockTransport) {
        let transport = MockTransport::new();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (rpc_tx, _rpc_rx) = mpsc::unbounded_channel();
        let (record_tx, _record_rx) = mpsc::unbounded_channel();
        let (presence_tx, _presence_rx) = mpsc::unbounded_channel();
        let conn = Connection::connect(
            "ws://host",
            ClientConfig::default(),
            Box::new(transport.clone()),
            Arc::new(|_| {}),
            event_tx,
            rpc_tx,
            record_tx,
            presence_tx,
        )
        .unwrap();
        (conn, transport)
    }

    #[tokio::test]
    async fn subscribe_sends_only_on_first_listener() {
        let (conn, transport) = open_connection();
        let handler = EventHandler::new(conn);
        handler.subscribe("chat", |_| {});
        handler.subscribe("chat", |_| {});
        let subscribe_frames: Vec<_> = transport.sent_frames().into_iter().filter(|f| f.contains("chat")).collect();
        assert_eq!(subscribe_frames.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_sends_only_when_last_listener_removed() {
        let (conn, transport) = open_connection();
        let handler = EventHandler::new(conn);
        let id1 = handler.subscribe("chat", |_| {});
        let id2 = handler.subscribe("chat", |_| {});
        handler.unsubscribe("chat", id1);
        let before = transport.sent_frames().len();
        handler.unsubscribe("chat", id2);
        let after_frames = transport.sent_frames();
        assert_eq!(after_frames.len(), before + 1);
        assert!(after_frames.last().unwrap().contains("US"));
    }

    #[tokio::test]
    async fn emit_invokes_local_listeners() {
        let (conn, _transport) = open_connection();
        let handler = EventHandler::new(conn);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        handler.subscribe("chat", move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        handler.emit("chat", Some(serde_json::json!("hi")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
