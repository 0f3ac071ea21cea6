//! Top-level façade: owns the connection and the four per-topic
//! handlers, wires inbound messages from each dispatch queue to its
//! handler, and exposes the public login/close surface.

use crate::ack::AckRegistry;
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState, Connectivity, LoginResult};
use crate::error::{ClientError, RuntimeError, RuntimeErrorHandler};
use crate::event::EventHandler;
use crate::message::Message;
use crate::presence::PresenceHandler;
use crate::record::anonymous::AnonymousRecord;
use crate::record::list::ListHandle;
use crate::record::{RecordEngine, RecordInner};
use crate::rpc::{RpcHandler, RpcProvider};
use crate::transport::{Transport, WebSocketTransport};
use log::error;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

fn default_error_handler() -> Arc<dyn Fn(RuntimeError) + Send + Sync> {
    Arc::new(|err: RuntimeError| error!("unhandled runtime error: {err}"))
}

/// Owns one multiplexed connection plus its four per-topic handlers.
/// Cloning a `Client` is cheap; every handle shares the same underlying
/// state.
#[derive(Clone)]
pub struct Client {
    connection: Arc<Connection>,
    events: Arc<EventHandler>,
    rpc: Arc<RpcHandler>,
    presence: Arc<PresenceHandler>,
    records: Arc<RecordEngine>,
    error_handler: Arc<Mutex<Arc<dyn Fn(RuntimeError) + Send + Sync>>>,
}

impl Client {
    /// Connects with the default WebSocket transport.
    pub fn new(url: &str, config: ClientConfig) -> Result<Self, ClientError> {
        Self::with_transport(url, config, Box::new(WebSocketTransport))
    }

    pub fn with_transport(url: &str, config: ClientConfig, transport: Box<dyn Transport>) -> Result<Self, ClientError> {
        let error_handler_slot = Arc::new(Mutex::new(default_error_handler()));
        let slot_for_dispatch = error_handler_slot.clone();
        let dispatching_handler: Arc<dyn Fn(RuntimeError) + Send + Sync> = Arc::new(move |err| {
            (slot_for_dispatch.lock().expect("error handler mutex poisoned"))(err)
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
        let (record_tx, record_rx) = mpsc::unbounded_channel();
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();

        let connection = Connection::connect(url, config, transport, dispatching_handler, event_tx, rpc_tx, record_tx, presence_tx)?;

        let events = EventHandler::new(connection.clone());
        let rpc = RpcHandler::new(connection.clone());
        let presence = PresenceHandler::new(connection.clone());
        let records = RecordEngine::new(connection.clone());

        spawn_dispatch_loop(event_rx, events.clone(), |h, m| h.handle_message(m));
        spawn_dispatch_loop(rpc_rx, rpc.clone(), |h, m| h.handle_message(m));
        spawn_dispatch_loop(record_rx, records.clone(), |h, m| h.handle_message(m));
        spawn_dispatch_loop(presence_rx, presence.clone(), |h, m| h.handle_message(m));

        Ok(Client {
            connection,
            events,
            rpc,
            presence,
            records,
            error_handler: error_handler_slot,
        })
    }

    pub fn events(&self) -> &Arc<EventHandler> {
        &self.events
    }

    pub fn rpc(&self) -> &Arc<RpcHandler> {
        &self.rpc
    }

    pub fn presence(&self) -> &Arc<PresenceHandler> {
        &self.presence
    }

    pub fn get_record(&self, name: &str) -> Arc<RecordInner> {
        self.records.get_record(name)
    }

    pub fn discard_record(&self, record: &Arc<RecordInner>) {
        self.records.discard(record);
    }

    pub fn delete_record(&self, record: &Arc<RecordInner>) {
        self.records.delete(record);
    }

    pub fn get_list(&self, name: &str) -> Arc<ListHandle> {
        let record = self.records.get_record(name);
        ListHandle::new(self.records.clone(), record)
    }

    pub fn get_anonymous_record(&self) -> Arc<AnonymousRecord> {
        AnonymousRecord::new(self.records.clone())
    }

    pub fn provide_rpc(&self, name: &str, cb: RpcProvider) {
        self.rpc.provide(name, cb);
    }

    /// Blocks (awaits) until the server acks or rejects the login.
    pub async fn login(&self, params: Option<Value>) -> Result<LoginResult, ClientError> {
        let rx = self.connection.authenticate(params)?;
        rx.await.map_err(|_| ClientError::IsClosed)
    }

    pub fn close(&self) {
        self.rpc.close();
        self.records.close();
        self.presence.close();
        self.connection.close();
    }

    pub fn add_connection_change_listener(&self, cb: Box<dyn Fn(ConnectionState) + Send + Sync>) {
        self.connection.on_state_change(cb);
    }

    pub fn set_connectivity(&self, connectivity: Connectivity) {
        self.connection.set_connectivity(connectivity);
    }

    pub fn set_runtime_error_handler(&self, handler: RuntimeErrorHandler) {
        *self.error_handler.lock().expect("error handler mutex poisoned") = Arc::from(handler);
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn ack_registry(&self) -> Arc<AckRegistry> {
        self.connection.ack_registry()
    }
}

fn spawn_dispatch_loop<H, F>(mut rx: mpsc::UnboundedReceiver<Message>, handler: Arc<H>, dispatch: F)
where
    H: Send + Sync + 'static,
    F: Fn(&H, Message) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            dispatch(&handler, msg);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::message::{Action, Topic};
    use crate::transport::mock::MockTransport;
    use crate::transport::TransportEvent;

    fn open_client() -> (Client, MockTransport) {
        let transport = MockTransport::new();
        let client = Client::with_transport("ws://host", ClientConfig::default(), Box::new(transport.clone())).unwrap();
        (client, transport)
    }

    async fn drive_to_open(transport: &MockTransport) {
        transport.push(TransportEvent::Open);
        tokio::task::yield_now().await;
        transport.push(TransportEvent::Message(crate::codec::encode_single(&Message::new(Topic::Connection, Action::Ack, vec![]))));
        tokio::task::yield_now().await;
        transport.push(TransportEvent::Message(crate::codec::encode_single(&Message::new(Topic::Auth, Action::Ack, vec!["U".to_string()]))));
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn login_resolves_once_auth_ack_arrives() {
        let (client, transport) = open_client();
        transport.push(TransportEvent::Open);
        tokio::task::yield_now().await;
        transport.push(TransportEvent::Message(crate::codec::encode_single(&Message::new(Topic::Connection, Action::Ack, vec![]))));
        tokio::task::yield_now().await;

        let login = tokio::spawn({
            let client = client.clone();
            async move { client.login(None).await }
        });
        tokio::task::yield_now().await;
        transport.push(TransportEvent::Message(crate::codec::encode_single(&Message::new(Topic::Auth, Action::Ack, vec!["U".to_string()]))));
        let result = login.await.unwrap().unwrap();
        assert!(result.logged_in);
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn event_subscribe_and_server_push_reaches_the_listener() {
        let (client, transport) = open_client();
        drive_to_open(&transport).await;

        let received = Arc::new(Mutex::new(None));
        let received2 = received.clone();
        client.events().subscribe("chat", move |data| {
            *received2.lock().unwrap() = data;
        });
        tokio::task::yield_now().await;
        assert!(transport.sent_frames().iter().any(|f| f.contains("chat")));

        transport.push(TransportEvent::Message(crate::codec::encode_single(&Message::new(
            Topic::Event,
            Action::Event,
            vec!["chat".to_string(), "Shello".to_string()],
        ))));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(*received.lock().unwrap(), Some(serde_json::json!("hello")));
    }

    #[tokio::test]
    async fn record_read_round_trip_populates_the_record() {
        let (client, transport) = open_client();
        drive_to_open(&transport).await;

        let record = client.get_record("user/1");
        tokio::task::yield_now().await;
        assert!(transport.sent_frames().iter().any(|f| f.contains("user/1")));

        transport.push(TransportEvent::Message(crate::codec::encode_single(&Message::new(
            Topic::Record,
            Action::Read,
            vec!["user/1".to_string(), "0".to_string(), "O{\"name\":\"ada\"}".to_string()],
        ))));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(record.is_ready());
        assert_eq!(record.get(Some("name")), serde_json::json!("ada"));
    }

    #[tokio::test]
    async fn close_stops_leaving_presence_get_all_hanging() {
        let (client, transport) = open_client();
        drive_to_open(&transport).await;

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.presence().get_all().await }
        });
        tokio::task::yield_now().await;
        client.close();
        let result = call.await.unwrap();
        assert!(result.is_err());
    }
}
