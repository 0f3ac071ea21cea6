//! Provider registration and caller flow with separate ack and response
//! deadlines.

use crate::ack::AckRegistry;
use crate::connection::Connection;
use crate::error::{ClientError, ErrorKind};
use crate::message::{Action, Message, Topic, WireValue};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

pub type RpcProvider = Arc<dyn Fn(Option<Value>, RpcResponse) + Send + Sync>;
type PendingCall = oneshot::Sender<Result<Value, ClientError>>;

/// Handed to a provider's callback. Sends `RPC|ACK|REQUEST|name|cid`
/// implicitly on construction; `send`/`reject`/`error` each complete the
/// call exactly once.
pub struct RpcResponse {
    connection: Arc<Connection>,
    name: String,
    cid: String,
    completed: Arc<AtomicBool>,
}

impl RpcResponse {
    fn new(connection: Arc<Connection>, name: String, cid: String) -> Self {
        connection.send(&Message::new(
            Topic::Rpc,
            Action::Ack,
            vec!["REQ".to_string(), name.clone(), cid.clone()],
        ));
        RpcResponse {
            connection,
            name,
            cid,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Idempotent: the ack was already sent on construction.
    pub fn ack(&self) {}

    pub fn send(&self, data: Option<Value>) -> Result<(), ClientError> {
        self.complete_once()?;
        let field = data
            .map(|v| WireValue::from_json(&v).encode())
            .unwrap_or_else(|| WireValue::Undefined.encode());
        self.connection.send(&Message::new(
            Topic::Rpc,
            Action::Response,
            vec![self.name.clone(), self.cid.clone(), field],
        ));
        Ok(())
    }

    pub fn reject(&self) -> Result<(), ClientError> {
        self.complete_once()?;
        self.connection.send(&Message::new(
            Topic::Rpc,
            Action::Rejection,
            vec![self.name.clone(), self.cid.clone()],
        ));
        Ok(())
    }

    pub fn error(&self, message: &str) -> Result<(), ClientError> {
        self.complete_once()?;
        self.connection.send(&Message::new(
            Topic::Rpc,
            Action::Error,
            vec![message.to_string(), self.name.clone(), self.cid.clone()],
        ));
        Ok(())
    }

    fn complete_once(&self) -> Result<(), ClientError> {
        if self.completed.swap(true, Ordering::SeqCst) {
            Err(ClientError::RpcAlreadyCompleted)
        } else {
            Ok(())
        }
    }
}

pub struct RpcHandler {
    connection: Arc<Connection>,
    ack_registry: Arc<AckRegistry>,
    providers: Mutex<HashMap<String, RpcProvider>>,
    pending_calls: Mutex<HashMap<String, PendingCall>>,
    next_cid: AtomicU64,
}

impl RpcHandler {
    pub fn new(connection: Arc<Connection>) -> Arc<Self> {
        let ack_registry = connection.ack_registry();
        Arc::new(RpcHandler {
            connection,
            ack_registry,
            providers: Mutex::new(HashMap::new()),
            pending_calls: Mutex::new(HashMap::new()),
            next_cid: AtomicU64::new(1),
        })
    }

    pub fn provide(&self, name: &str, cb: RpcProvider) {
        self.providers.lock().expect("providers mutex poisoned").insert(name.to_string(), cb);
        self.ack_registry.add(
            Topic::Rpc,
            Action::Subscribe,
            name,
            self.connection.config().subscription_timeout,
            ErrorKind::AckTimeout,
        );
        self.connection
            .send(&Message::new(Topic::Rpc, Action::Subscribe, vec![name.to_string()]));
    }

    pub fn unprovide(&self, name: &str) {
        self.providers.lock().expect("providers mutex poisoned").remove(name);
        self.connection
            .send(&Message::new(Topic::Rpc, Action::Unsubscribe, vec![name.to_string()]));
    }

    /// Synchronous-from-the-caller's-perspective RPC invocation: blocks
    /// (awaits) until completion or `rpc_response_timeout` elapses.
    pub async fn make(&self, name: &str, data: Option<Value>) -> Result<Value, ClientError> {
        let cid = self.next_cid.fetch_add(1, Ordering::SeqCst).to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_calls.lock().expect("pending_calls mutex poisoned").insert(cid.clone(), tx);

        self.ack_registry.add(
            Topic::Rpc,
            Action::Request,
            &cid,
            self.connection.config().rpc_ack_timeout,
            ErrorKind::AckTimeout,
        );
        let field = data
            .map(|v| WireValue::from_json(&v).encode())
            .unwrap_or_else(|| WireValue::Undefined.encode());
        self.connection.send(&Message::new(
            Topic::Rpc,
            Action::Request,
            vec![name.to_string(), cid.clone(), field],
        ));

        let response_timeout = self.connection.config().rpc_response_timeout;
        match tokio::time::timeout(response_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::IsClosed),
            Err(_) => {
                self.pending_calls.lock().expect("pending_calls mutex poisoned").remove(&cid);
                self.ack_registry.clear(Topic::Rpc, Action::Request, &cid);
                Err(ClientError::ResponseTimeout(name.to_string()))
            }
        }
    }

    pub fn handle_message(&self, msg: Message) {
        match msg.action {
            Action::Ack => {
                let nested = msg.field(0);
                match nested {
                    Some("S") => {
                        if let Some(name) = msg.field(1) {
                            self.ack_registry.clear(Topic::Rpc, Action::Subscribe, name);
                        }
                    }
                    Some("US") => {
                        if let Some(name) = msg.field(1) {
                            self.ack_registry.clear(Topic::Rpc, Action::Unsubscribe, name);
                        }
                    }
                    Some("REQ") => {
                        if let Some(cid) = msg.field(2) {
                            self.ack_registry.clear(Topic::Rpc, Action::Request, cid);
                        }
                    }
                    _ => {}
                }
            }
            Action::Request => {
                let (Some(name), Some(cid)) = (msg.field(0), msg.field(1)) else {
                    return;
                };
                let provider = self.providers.lock().expect("providers mutex poisoned").get(name).cloned();
                match provider {
                    Some(provider) => {
                        let data = msg.field(2).and_then(|f| WireValue::decode(f).ok()).map(|w| w.into_json());
                        let response = RpcResponse::new(self.connection.clone(), name.to_string(), cid.to_string());
                        provider(data, response);
                    }
                    None => {
                        self.connection.send(&Message::new(
                            Topic::Rpc,
                            Action::Rejection,
                            vec![name.to_string(), cid.to_string()],
                        ));
                    }
                }
            }
            Action::Response => {
                if let Some(cid) = msg.field(1) {
                    if let Some(tx) = self.pending_calls.lock().expect("pending_calls mutex poisoned").remove(cid) {
                        let data = msg.field(2).and_then(|f| WireValue::decode(f).ok()).map(|w| w.into_json());
                        let _ = tx.send(Ok(data.unwrap_or(Value::Null)));
                    }
                }
            }
            Action::Error => {
                if let (Some(message), Some(cid)) = (msg.field(0), msg.field(2)) {
                    if let Some(tx) = self.pending_calls.lock().expect("pending_calls mutex poisoned").remove(cid) {
                        let _ = tx.send(Err(ClientError::Server(message.to_string())));
                    }
                }
            }
            Action::Rejection => {
                if let Some(cid) = msg.field(1) {
                    if let Some(tx) = self.pending_calls.lock().expect("pending_calls mutex poisoned").remove(cid) {
                        let _ = tx.send(Err(ClientError::Rejection(format!(
                            "no provider for {}",
                            msg.field(0).unwrap_or_default()
                        ))));
                    }
                }
            }
            other => log::warn!("unexpected RPC action {:?}", other),
        }
    }

    pub fn close(&self) {
        let pending: Vec<PendingCall> = self
            .pending_calls
            .lock()
            .expect("pending_calls mutex poisoned")
            .drain()
            .map(|(_, tx)| tx)
            .collect();
        for tx in pending {
            let _ = tx.send(Err(ClientError::IsClosed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::mock::MockTransport;
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
    async fn correlation_ids_are_a_monotonic_counter_not_a_client_uid() {
        let (conn, transport) = open_connection();
        let handler = RpcHandler::new(conn);
        let h1 = handler.clone();
        tokio::spawn(async move {
            let _ = h1.make("addTwo", None).await;
        });
        let h2 = handler.clone();
        tokio::spawn(async move {
            let _ = h2.make("addTwo", None).await;
        });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        let frames = transport.sent_frames();
        let request_frames: Vec<_> = frames.iter().filter(|f| f.contains("addTwo")).collect();
        assert_eq!(request_frames.len(), 2);
        assert!(request_frames[0].contains("addTwo\u{1f}1\u{1f}"));
        assert!(request_frames[1].contains("addTwo\u{1f}2\u{1f}"));
    }

    #[tokio::test]
    async fn full_round_trip_resolves_the_caller() {
        let (conn, _transport) = open_connection();
        let handler = RpcHandler::new(conn);
        let call = tokio::spawn({
            let handler = handler.clone();
            async move { handler.make("addTwo", Some(serde_json::json!({"a": 1, "b": 2}))).await }
        });
        tokio::task::yield_now().await;
        handler.handle_message(Message::new(Topic::Rpc, Action::Ack, vec!["REQ".to_string(), "addTwo".to_string(), "1".to_string()]));
        handler.handle_message(Message::new(Topic::Rpc, Action::Response, vec!["addTwo".to_string(), "1".to_string(), "N3".to_string()]));
        let result = call.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!(3));
    }

    #[tokio::test]
    async fn provider_rejection_surfaces_to_the_caller() {
        let (conn, _transport) = open_connection();
        let handler = RpcHandler::new(conn);
        let call = tokio::spawn({
            let handler = handler.clone();
            async move { handler.make("noProvider", None).await }
        });
        tokio::task::yield_now().await;
        handler.handle_message(Message::new(Topic::Rpc, Action::Rejection, vec!["noProvider".to_string(), "1".to_string()]));
        let result = call.await.unwrap();
        assert!(result.is_err());
    }
}
