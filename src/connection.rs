//! Handshake, challenge/redirect, authentication, reconnection with
//! backoff, and send buffering. Drives the per-topic dispatch queues
//! that give per-topic ordering with cross-topic parallelism,
//! generalizing the combined `spawn_message_loop` / `receiver_loop` pair
//! in `websocket.rs` / `background_connection.rs` into one loop per
//! topic.

use crate::ack::AckRegistry;
use crate::codec;
use crate::config::ClientConfig;
use crate::error::{ClientError, ErrorKind, RuntimeError};
use crate::message::{Action, Message, Topic};
use crate::resubscribe::ResubscribeCoordinator;
use crate::transport::{normalize_url, Transport, TransportEvent};
use futures_channel::mpsc as fmpsc;
use futures::StreamExt;
use log::{info, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    AwaitingConnection,
    Challenging,
    AwaitingAuthentication,
    Authenticating,
    Open,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    Disconnected,
}

pub struct LoginResult {
    pub logged_in: bool,
    pub error_event: Option<ErrorKind>,
    pub data: Option<Value>,
}

struct Outgoing {
    sender: Option<fmpsc::UnboundedSender<String>>,
    buffer: Vec<String>,
}

struct Inner {
    state: Mutex<ConnectionState>,
    connectivity: Mutex<Connectivity>,
    url: Mutex<String>,
    outgoing: Mutex<Outgoing>,
    open_tx: watch::Sender<bool>,
    reconnect_attempt: AtomicU32,
    too_many_auth_attempts: AtomicBool,
    config: ClientConfig,
    transport: Box<dyn Transport>,
    error_handler: Arc<dyn Fn(RuntimeError) + Send + Sync>,
    ack_registry: Arc<AckRegistry>,
    resubscribe: Arc<ResubscribeCoordinator>,
    state_listeners: Mutex<Vec<Box<dyn Fn(ConnectionState) + Send + Sync>>>,
    pending_auth: Mutex<Option<(oneshot::Sender<LoginResult>, Option<Value>)>>,
    dispatch: DispatchTable,
    deliberate_close: AtomicBool,
}

struct DispatchTable {
    event: mpsc::UnboundedSender<Message>,
    rpc: mpsc::UnboundedSender<Message>,
    record: mpsc::UnboundedSender<Message>,
    presence: mpsc::UnboundedSender<Message>,
}

/// Handle shared by every subsystem that needs to send frames or watch
/// connection-state transitions.
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connects and starts the background driver loop. `dispatch_*`
    /// channels feed each topic's serial handler task.
    pub fn connect(
        url: &str,
        config: ClientConfig,
        transport: Box<dyn Transport>,
        error_handler: Arc<dyn Fn(RuntimeError) + Send + Sync>,
        event_tx: mpsc::UnboundedSender<Message>,
        rpc_tx: mpsc::UnboundedSender<Message>,
        record_tx: mpsc::UnboundedSender<Message>,
        presence_tx: mpsc::UnboundedSender<Message>,
    ) -> Result<Arc<Connection>, ClientError> {
        let normalized = normalize_url(url, &config.path).map_err(ClientError::InvalidUrl)?;
        let (open_tx, open_rx) = watch::channel(false);
        let ack_registry = AckRegistry::new(open_rx, error_handler.clone());
        let resubscribe = ResubscribeCoordinator::new();

        let inner = Arc::new(Inner {
            state: Mutex::new(ConnectionState::Closed),
            connectivity: Mutex::new(Connectivity::Connected),
            url: Mutex::new(normalized),
            outgoing: Mutex::new(Outgoing {
                sender: None,
                buffer: Vec::new(),
            }),
            open_tx,
            reconnect_attempt: AtomicU32::new(0),
            too_many_auth_attempts: AtomicBool::new(false),
            config,
            transport,
            error_handler,
            ack_registry,
            resubscribe,
            state_listeners: Mutex::new(Vec::new()),
            pending_auth: Mutex::new(None),
            dispatch: DispatchTable {
                event: event_tx,
                rpc: rpc_tx,
                record: record_tx,
                presence: presence_tx,
            },
            deliberate_close: AtomicBool::new(false),
        });

        let conn = Arc::new(Connection { inner: inner.clone() });
        Self::open_transport(inner);
        Ok(conn)
    }

    fn open_transport(inner: Arc<Inner>) {
        let url = inner.url.lock().expect("url mutex poisoned").clone();
        let (outgoing_tx, incoming_rx) = inner.transport.open(&url);
        {
            let mut out = inner.outgoing.lock().expect("outgoing mutex poisoned");
            out.sender = Some(outgoing_tx);
        }
        tokio::spawn(Self::driver_loop(inner, incoming_rx));
    }

    async fn driver_loop(inner: Arc<Inner>, mut incoming_rx: fmpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = incoming_rx.next().await {
            match event {
                TransportEvent::Open => Self::on_transport_open(&inner),
                TransportEvent::Message(frame) => Self::on_frame(&inner, &frame),
                TransportEvent::Error(msg) => Self::on_transport_error(&inner, msg),
                TransportEvent::Close => Self::on_transport_close(&inner),
            }
        }
    }

    fn on_transport_open(inner: &Arc<Inner>) {
        info!("transport open");
        Self::set_state(inner, ConnectionState::AwaitingConnection);
    }

    fn on_frame(inner: &Arc<Inner>, frame: &str) {
        let messages = match codec::decode(frame) {
            Ok(m) => m,
            Err(e) => {
                warn!("malformed frame: {e}");
                (inner.error_handler)(RuntimeError {
                    topic: Topic::Error,
                    event: ErrorKind::MessageParseError,
                    message: e.to_string(),
                });
                return;
            }
        };
        for msg in messages {
            Self::route(inner, msg);
        }
    }

    fn route(inner: &Arc<Inner>, msg: Message) {
        match msg.topic {
            Topic::Connection => Self::handle_connection_message(inner, msg),
            Topic::Auth => Self::handle_auth_message(inner, msg),
            Topic::Event => {
                let _ = inner.dispatch.event.send(msg);
            }
            Topic::Rpc => {
                let _ = inner.dispatch.rpc.send(msg);
            }
            Topic::Record => {
                let _ = inner.dispatch.record.send(msg);
            }
            Topic::Presence => {
                let _ = inner.dispatch.presence.send(msg);
            }
            Topic::Error => {
                warn!("server error message: {:?}", msg.data);
            }
        }
    }

    fn handle_connection_message(inner: &Arc<Inner>, msg: Message) {
        match msg.action {
            Action::Challenge => {
                Self::set_state(inner, ConnectionState::Challenging);
                let url = inner.url.lock().expect("url mutex poisoned").clone();
                Self::send_raw(inner, &Message::new(Topic::Connection, Action::ChallengeResponse, vec![url]));
            }
            Action::Ack => {
                Self::set_state(inner, ConnectionState::AwaitingAuthentication);
            }
            Action::Rejection => {
                inner.deliberate_close.store(true, Ordering::SeqCst);
                Self::close_deliberately(inner);
            }
            Action::Redirect => {
                if let Some(new_url) = msg.field(0) {
                    *inner.url.lock().expect("url mutex poisoned") = new_url.to_string();
                    Self::force_close_transport(inner);
                    Self::open_transport(inner.clone());
                }
            }
            Action::Ping => {
                Self::send_raw(inner, &Message::new(Topic::Connection, Action::Pong, vec![]));
            }
            other => warn!("unexpected CONNECTION action {:?}", other),
        }
    }

    fn handle_auth_message(inner: &Arc<Inner>, msg: Message) {
        match msg.action {
            Action::Ack => {
                Self::set_state(inner, ConnectionState::Open);
                Self::flush_buffer(inner);
                let data = msg.field(0).and_then(|f| crate::message::WireValue::decode(f).ok()).map(|w| w.into_json());
                if let Some((tx, _)) = inner.pending_auth.lock().expect("pending_auth mutex poisoned").take() {
                    let _ = tx.send(LoginResult {
                        logged_in: true,
                        error_event: None,
                        data,
                    });
                }
            }
            Action::Error => {
                let too_many = msg.field(0) == Some("TOO_MANY_AUTH_ATTEMPTS");
                if too_many {
                    inner.too_many_auth_attempts.store(true, Ordering::SeqCst);
                    Self::close_deliberately(inner);
                } else {
                    Self::set_state(inner, ConnectionState::AwaitingAuthentication);
                }
                if let Some((tx, _)) = inner.pending_auth.lock().expect("pending_auth mutex poisoned").take() {
                    let _ = tx.send(LoginResult {
                        logged_in: false,
                        error_event: Some(if too_many {
                            ErrorKind::TooManyAuthAttempts
                        } else {
                            ErrorKind::NotAuthenticated
                        }),
                        data: msg.field(0).map(|s| Value::String(s.to_string())),
                    });
                }
            }
            other => warn!("unexpected AUTH action {:?}", other),
        }
    }

    fn on_transport_error(inner: &Arc<Inner>, message: String) {
        warn!("transport error: {message}");
        (inner.error_handler)(RuntimeError {
            topic: Topic::Connection,
            event: ErrorKind::ConnectionError,
            message,
        });
        Self::set_state(inner, ConnectionState::Error);
        Self::maybe_reconnect(inner);
    }

    fn on_transport_close(inner: &Arc<Inner>) {
        if inner.deliberate_close.load(Ordering::SeqCst) {
            Self::set_state(inner, ConnectionState::Closed);
            return;
        }
        Self::set_state(inner, ConnectionState::Error);
        Self::maybe_reconnect(inner);
    }

    fn maybe_reconnect(inner: &Arc<Inner>) {
        if *inner.connectivity.lock().expect("connectivity mutex poisoned") == Connectivity::Disconnected {
            return;
        }
        let attempt = inner.reconnect_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > inner.config.max_reconnect_attempts {
            Self::set_state(inner, ConnectionState::Closed);
            return;
        }
        Self::set_state(inner, ConnectionState::Reconnecting);
        let delay = std::cmp::min(
            inner.config.reconnect_interval_increment * attempt,
            inner.config.max_reconnect_interval,
        );
        let inner2 = inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if *inner2.connectivity.lock().expect("connectivity mutex poisoned") == Connectivity::Connected {
                Self::open_transport(inner2);
            }
        });
    }

    fn close_deliberately(inner: &Arc<Inner>) {
        inner.deliberate_close.store(true, Ordering::SeqCst);
        Self::force_close_transport(inner);
        Self::set_state(inner, ConnectionState::Closed);
    }

    fn force_close_transport(inner: &Arc<Inner>) {
        let mut out = inner.outgoing.lock().expect("outgoing mutex poisoned");
        out.sender = None;
    }

    fn set_state(inner: &Arc<Inner>, new_state: ConnectionState) {
        let old_state = {
            let mut state = inner.state.lock().expect("state mutex poisoned");
            let old = *state;
            *state = new_state;
            old
        };
        if old_state == new_state {
            return;
        }
        let _ = inner.open_tx.send(new_state == ConnectionState::Open);
        inner.resubscribe.on_transition(old_state, new_state);
        for cb in inner.state_listeners.lock().expect("state_listeners mutex poisoned").iter() {
            cb(new_state);
        }
    }

    fn flush_buffer(inner: &Arc<Inner>) {
        let mut out = inner.outgoing.lock().expect("outgoing mutex poisoned");
        if let Some(sender) = out.sender.clone() {
            for frame in out.buffer.drain(..) {
                let _ = sender.unbounded_send(frame);
            }
        }
    }

    /// Sends while not `OPEN` buffer in order; flushed on transition to
    /// `OPEN`.
    fn send_raw(inner: &Arc<Inner>, msg: &Message) {
        let frame = codec::encode_single(msg);
        let is_open = *inner.state.lock().expect("state mutex poisoned") == ConnectionState::Open;
        let mut out = inner.outgoing.lock().expect("outgoing mutex poisoned");
        if is_open {
            if let Some(sender) = &out.sender {
                let _ = sender.unbounded_send(frame);
                return;
            }
        }
        out.buffer.push(frame);
    }

    pub fn send(&self, msg: &Message) {
        Self::send_raw(&self.inner, msg);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("state mutex poisoned")
    }

    pub fn ack_registry(&self) -> Arc<AckRegistry> {
        self.inner.ack_registry.clone()
    }

    pub fn resubscribe_coordinator(&self) -> Arc<ResubscribeCoordinator> {
        self.inner.resubscribe.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn error_handler(&self) -> Arc<dyn Fn(RuntimeError) + Send + Sync> {
        self.inner.error_handler.clone()
    }

    pub fn on_state_change(&self, cb: Box<dyn Fn(ConnectionState) + Send + Sync>) {
        self.inner.state_listeners.lock().expect("state_listeners mutex poisoned").push(cb);
    }

    pub fn set_connectivity(&self, connectivity: Connectivity) {
        *self.inner.connectivity.lock().expect("connectivity mutex poisoned") = connectivity;
        match connectivity {
            Connectivity::Disconnected => {
                Self::force_close_transport(&self.inner);
            }
            Connectivity::Connected => {
                let state = self.state();
                if state == ConnectionState::Closed || state == ConnectionState::Error {
                    self.inner.reconnect_attempt.store(0, Ordering::SeqCst);
                    Self::open_transport(self.inner.clone());
                }
            }
        }
    }

    /// Sends `AUTH|REQ` and returns a receiver that resolves once
    /// `AUTH|ACK`/`AUTH|ERROR` arrives.
    pub fn authenticate(&self, params: Option<Value>) -> Result<oneshot::Receiver<LoginResult>, ClientError> {
        if self.inner.too_many_auth_attempts.load(Ordering::SeqCst) {
            return Err(ClientError::IsClosed);
        }
        let (tx, rx) = oneshot::channel();
        *self.inner.pending_auth.lock().expect("pending_auth mutex poisoned") = Some((tx, params.clone()));
        Self::set_state(&self.inner, ConnectionState::Authenticating);
        let field = params
            .map(|v| v.to_string())
            .unwrap_or_else(|| crate::message::WireValue::Undefined.encode());
        Self::send_raw(&self.inner, &Message::new(Topic::Auth, Action::Request, vec![field]));
        Ok(rx)
    }

    pub fn close(&self) {
        self.inner.ack_registry.clear_all();
        if let Some((tx, _)) = self.inner.pending_auth.lock().expect("pending_auth mutex poisoned").take() {
            let _ = tx.send(LoginResult {
                logged_in: false,
                error_event: Some(ErrorKind::IsClosed),
                data: None,
            });
        }
        Self::close_deliberately(&self.inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::time::Duration;

    fn connect(transport: MockTransport) -> Arc<Connection> {
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (rpc_tx, _rpc_rx) = mpsc::unbounded_channel();
        let (record_tx, _record_rx) = mpsc::unbounded_channel();
        let (presence_tx, _presence_rx) = mpsc::unbounded_channel();
        Connection::connect(
            "ws://host",
            ClientConfig::default(),
            Box::new(transport),
            Arc::new(|_| {}),
            event_tx,
            rpc_tx,
            record_tx,
            presence_tx,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn challenge_response_flow_reaches_open() {
        let transport = MockTransport::new();
        let conn = connect(transport.clone());
        transport.push(TransportEvent::Open);
        tokio::task::yield_now().await;
        transport.push(TransportEvent::Message(codec::encode_single(&Message::new(Topic::Connection, Action::Challenge, vec![]))));
        tokio::task::yield_now().await;
        assert_eq!(conn.state(), ConnectionState::Challenging);
        assert_eq!(transport.sent_frames().last().unwrap().as_str().contains("CHR"), true);

        transport.push(TransportEvent::Message(codec::encode_single(&Message::new(Topic::Connection, Action::Ack, vec![]))));
        tokio::task::yield_now().await;
        assert_eq!(conn.state(), ConnectionState::AwaitingAuthentication);
    }

    #[tokio::test]
    async fn sends_before_open_are_buffered_then_flushed() {
        let transport = MockTransport::new();
        let conn = connect(transport.clone());
        conn.send(&Message::new(Topic::Event, Action::Subscribe, vec!["chat".to_string()]));
        assert!(transport.sent_frames().is_empty());

        transport.push(TransportEvent::Open);
        transport.push(TransportEvent::Message(codec::encode_single(&Message::new(Topic::Connection, Action::Ack, vec![]))));
        transport.push(TransportEvent::Message(codec::encode_single(&Message::new(Topic::Auth, Action::Ack, vec!["U".to_string()]))));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(transport.sent_frames().iter().any(|f| f.contains("chat")));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_linear_backoff_after_transport_error() {
        let mut config = ClientConfig::default();
        config.reconnect_interval_increment = Duration::from_millis(100);
        let transport = MockTransport::new();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (rpc_tx, _rpc_rx) = mpsc::unbounded_channel();
        let (record_tx, _record_rx) = mpsc::unbounded_channel();
        let (presence_tx, _presence_rx) = mpsc::unbounded_channel();
        let conn = Connection::connect(
            "ws://host",
            config,
            Box::new(transport.clone()),
            Arc::new(|_| {}),
            event_tx,
            rpc_tx,
            record_tx,
            presence_tx,
        )
        .unwrap();

        transport.push(TransportEvent::Error("boom".to_string()));
        tokio::task::yield_now().await;
        assert_eq!(conn.state(), ConnectionState::Reconnecting);

        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;
        // The reconnect timer re-opened the transport; a fresh Open now
        // routes through the new channel it registered.
        transport.push(TransportEvent::Open);
        tokio::task::yield_now().await;
        assert_eq!(conn.state(), ConnectionState::AwaitingConnection);
    }
}
