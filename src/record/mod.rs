//! Cached version-tracked documents with subscribe-by-path change
//! notification, deterministic list diffing (see [`list`]),
//! server-side write-acknowledgement, merge-strategy driven conflict
//! recovery, and reference-counted lifecycle. The largest subsystem in
//! the crate.

pub mod anonymous;
pub mod list;

use crate::ack::AckRegistry;
use crate::config::MergeStrategy;
use crate::connection::Connection;
use crate::error::{ClientError, ErrorKind, RuntimeError};
use crate::message::{Action, Message, Topic, WireValue};
use crate::single_notifier::SingleNotifier;
use crate::value;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type ChangeCallback = Arc<dyn Fn(&Value) + Send + Sync>;
pub type ProviderCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct RecordState {
    version: i64,
    data: Value,
    ready: bool,
    destroyed: bool,
    has_provider: bool,
    merge_strategy: MergeStrategy,
    subscribers_all: Vec<(u64, ChangeCallback)>,
    subscribers_by_path: HashMap<String, Vec<(u64, ChangeCallback)>>,
    provider_listeners: Vec<(u64, ProviderCallback)>,
    when_ready: Vec<Box<dyn FnOnce() + Send>>,
}

pub struct RecordInner {
    name: String,
    usage: AtomicU32,
    next_sub_id: AtomicU64,
    state: Mutex<RecordState>,
}

impl RecordInner {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> i64 {
        self.state.lock().expect("record mutex poisoned").version
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().expect("record mutex poisoned").ready
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().expect("record mutex poisoned").destroyed
    }

    pub fn has_provider(&self) -> bool {
        self.state.lock().expect("record mutex poisoned").has_provider
    }

    /// Deep copy of the value at `path` (or the whole record if `None`).
    pub fn get(&self, path: Option<&str>) -> Value {
        let state = self.state.lock().expect("record mutex poisoned");
        match path {
            Some(p) => value::get_path(&state.data, p).cloned().unwrap_or(Value::Null),
            None => state.data.clone(),
        }
    }

    pub fn when_ready(&self, cb: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock().expect("record mutex poisoned");
        if state.ready {
            drop(state);
            cb();
        } else {
            state.when_ready.push(Box::new(cb));
        }
    }

    pub fn subscribe(&self, path: Option<&str>, cb: ChangeCallback, trigger_now: bool) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().expect("record mutex poisoned");
        match path {
            Some(p) => state.subscribers_by_path.entry(p.to_string()).or_default().push((id, cb.clone())),
            None => state.subscribers_all.push((id, cb.clone())),
        }
        if trigger_now {
            let value = match path {
                Some(p) => value::get_path(&state.data, p).cloned().unwrap_or(Value::Null),
                None => state.data.clone(),
            };
            drop(state);
            cb(&value);
        }
        id
    }

    pub fn unsubscribe(&self, path: Option<&str>, id: u64) {
        let mut state = self.state.lock().expect("record mutex poisoned");
        match path {
            Some(p) => {
                if let Some(list) = state.subscribers_by_path.get_mut(p) {
                    list.retain(|(i, _)| *i != id);
                }
            }
            None => state.subscribers_all.retain(|(i, _)| *i != id),
        }
    }

    pub fn subscribe_provider(&self, cb: ProviderCallback) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.state.lock().expect("record mutex poisoned").provider_listeners.push((id, cb));
        id
    }
}

pub struct RecordEngine {
    connection: Arc<Connection>,
    ack_registry: Arc<AckRegistry>,
    cache: Mutex<HashMap<String, Arc<RecordInner>>>,
    snapshot_notifier: Arc<SingleNotifier<Value>>,
    has_notifier: Arc<SingleNotifier<bool>>,
    write_ack_notifier: Arc<SingleNotifier<()>>,
    on_discarded: Mutex<Option<Arc<dyn Fn(&str) + Send + Sync>>>,
    on_deleted: Mutex<Option<Arc<dyn Fn(&str) + Send + Sync>>>,
}

impl RecordEngine {
    pub fn new(connection: Arc<Connection>) -> Arc<Self> {
        let ack_registry = connection.ack_registry();
        let engine = Arc::new(RecordEngine {
            connection,
            ack_registry,
            cache: Mutex::new(HashMap::new()),
            snapshot_notifier: SingleNotifier::new(),
            has_notifier: SingleNotifier::new(),
            write_ack_notifier: SingleNotifier::new(),
            on_discarded: Mutex::new(None),
            on_deleted: Mutex::new(None),
        });
        let weak = Arc::downgrade(&engine);
        engine.connection.resubscribe_coordinator().register(Box::new(move || {
            if let Some(engine) = weak.upgrade() {
                engine.resubscribe_all();
            }
        }));
        engine
    }

    pub fn on_record_discarded(&self, cb: Arc<dyn Fn(&str) + Send + Sync>) {
        *self.on_discarded.lock().expect("on_discarded mutex poisoned") = Some(cb);
    }

    pub fn on_record_deleted(&self, cb: Arc<dyn Fn(&str) + Send + Sync>) {
        *self.on_deleted.lock().expect("on_deleted mutex poisoned") = Some(cb);
    }

    /// Creates the record lazily on first call for a given name; each
    /// subsequent call for the same name just bumps the reference count.
    pub fn get_record(&self, name: &str) -> Arc<RecordInner> {
        let mut cache = self.cache.lock().expect("cache mutex poisoned");
        if let Some(existing) = cache.get(name) {
            existing.usage.fetch_add(1, Ordering::SeqCst);
            return existing.clone();
        }
        let record = Arc::new(RecordInner {
            name: name.to_string(),
            usage: AtomicU32::new(1),
            next_sub_id: AtomicU64::new(1),
            state: Mutex::new(RecordState {
                version: -1,
                data: Value::Null,
                ready: false,
                destroyed: false,
                has_provider: false,
                merge_strategy: self.connection.config().record_merge_strategy,
                subscribers_all: Vec::new(),
                subscribers_by_path: HashMap::new(),
                provider_listeners: Vec::new(),
                when_ready: Vec::new(),
            }),
        });
        cache.insert(name.to_string(), record.clone());
        drop(cache);
        self.send_create_or_read(name);
        record
    }

    fn send_create_or_read(&self, name: &str) {
        self.ack_registry.add(
            Topic::Record,
            Action::Subscribe,
            name,
            self.connection.config().record_read_ack_timeout,
            ErrorKind::AckTimeout,
        );
        self.ack_registry.add(
            Topic::Record,
            Action::Read,
            name,
            self.connection.config().record_read_timeout,
            ErrorKind::ResponseTimeout,
        );
        self.connection
            .send(&Message::new(Topic::Record, Action::CreateOrRead, vec![name.to_string()]));
    }

    /// Decrements the usage count; at zero, sends `UNSUBSCRIBE` and
    /// destroys the record once the ack arrives.
    pub fn discard(&self, record: &Arc<RecordInner>) {
        if record.usage.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        self.ack_registry.add(
            Topic::Record,
            Action::Unsubscribe,
            &record.name,
            self.connection.config().subscription_timeout,
            ErrorKind::AckTimeout,
        );
        self.connection
            .send(&Message::new(Topic::Record, Action::Unsubscribe, vec![record.name.clone()]));
    }

    /// Destroys the record unconditionally, regardless of remaining
    /// references, and notifies the hub.
    pub fn delete(&self, record: &Arc<RecordInner>) {
        self.ack_registry.add(
            Topic::Record,
            Action::Delete,
            &record.name,
            self.connection.config().record_delete_timeout,
            ErrorKind::DeleteTimeout,
        );
        self.connection
            .send(&Message::new(Topic::Record, Action::Delete, vec![record.name.clone()]));
    }

    /// `set`/`set(path, value)`: no-op if the target subtree is already
    /// equal, otherwise bumps `version` and fires only the subscribers
    /// whose subtree actually changed.
    pub fn set(&self, record: &Arc<RecordInner>, path: Option<&str>, new_value: Value) -> Result<(), ClientError> {
        let (version, old_snapshot, data_snapshot) = {
            let mut state = record.state.lock().expect("record mutex poisoned");
            if state.destroyed {
                return Err(ClientError::RecordDestroyed(record.name.clone()));
            }
            let current = match path {
                Some(p) => value::get_path(&state.data, p).cloned().unwrap_or(Value::Null),
                None => state.data.clone(),
            };
            if current == new_value {
                return Ok(());
            }
            let old_snapshot = state.data.clone();
            match path {
                Some(p) => value::set_path(&mut state.data, p, new_value),
                None => state.data = new_value,
            }
            state.version += 1;
            (state.version, old_snapshot, state.data.clone())
        };
        match path {
            Some(p) => {
                let field = WireValue::from_json(&value::get_path(&data_snapshot, p).cloned().unwrap_or(Value::Null)).encode();
                self.connection.send(&Message::new(
                    Topic::Record,
                    Action::Patch,
                    vec![record.name.clone(), version.to_string(), p.to_string(), field],
                ));
            }
            None => {
                let field = WireValue::from_json(&data_snapshot).encode();
                self.connection.send(&Message::new(
                    Topic::Record,
                    Action::Update,
                    vec![record.name.clone(), version.to_string(), field],
                ));
            }
        }
        self.fire_subscribers(record, &old_snapshot, &data_snapshot);
        Ok(())
    }

    /// `setWithAck`: identical to `set`, plus a rendezvous on
    /// `WRITE_ACKNOWLEDGEMENT`, keyed by the new version so a race between
    /// the ack and further local writes stays correctly keyed.
    pub async fn set_with_ack(&self, record: &Arc<RecordInner>, path: Option<&str>, new_value: Value) -> Result<(), ClientError> {
        let version_before = record.version();
        self.set(record, path, new_value)?;
        let version_after = record.version();
        if version_after == version_before {
            // The write was a no-op; nothing will ever ack it.
            return Ok(());
        }
        let key = format!("{}:{}", record.name, version_after);
        let rx = self.write_ack_notifier.request(&key, || {});
        rx.await.map_err(|_| ClientError::IsClosed)?
    }

    pub async fn snapshot(&self, name: &str) -> Result<Value, ClientError> {
        let connection = self.connection.clone();
        let name_owned = name.to_string();
        let rx = self.snapshot_notifier.request(name, move || {
            connection.send(&Message::new(Topic::Record, Action::Snapshot, vec![name_owned.clone()]));
        });
        rx.await.map_err(|_| ClientError::IsClosed)?
    }

    pub async fn has(&self, name: &str) -> Result<bool, ClientError> {
        let connection = self.connection.clone();
        let name_owned = name.to_string();
        let rx = self.has_notifier.request(name, move || {
            connection.send(&Message::new(Topic::Record, Action::Has, vec![name_owned.clone()]));
        });
        rx.await.map_err(|_| ClientError::IsClosed)?
    }

    /// Fires whole-record subscribers unconditionally and path subscribers
    /// only for paths whose subtree actually differs between `old_data`
    /// and `new_data`.
    fn fire_subscribers(&self, record: &Arc<RecordInner>, old_data: &Value, new_data: &Value) {
        let state = record.state.lock().expect("record mutex poisoned");
        let whole: Vec<ChangeCallback> = state.subscribers_all.iter().map(|(_, cb)| cb.clone()).collect();
        let mut by_path: Vec<(ChangeCallback, Value)> = Vec::new();
        for (path, cbs) in state.subscribers_by_path.iter() {
            if cbs.is_empty() {
                continue;
            }
            let before = value::get_path(old_data, path);
            let after = value::get_path(new_data, path);
            if before == after {
                continue;
            }
            let subtree = after.cloned().unwrap_or(Value::Null);
            for (_, cb) in cbs {
                by_path.push((cb.clone(), subtree.clone()));
            }
        }
        drop(state);
        for cb in whole {
            cb(new_data);
        }
        for (cb, subtree) in by_path {
            cb(&subtree);
        }
    }

    fn find(&self, name: &str) -> Option<Arc<RecordInner>> {
        self.cache.lock().expect("cache mutex poisoned").get(name).cloned()
    }

    pub fn handle_message(&self, msg: Message) {
        match msg.action {
            Action::Ack => self.on_ack(msg),
            Action::Read => self.on_read(msg),
            Action::Update => self.on_update(msg),
            Action::Patch => self.on_patch(msg),
            Action::WriteAcknowledgement => self.on_write_ack(msg),
            Action::SubscriptionHasProvider => self.on_has_provider(msg),
            Action::Error => self.on_error(msg),
            Action::Snapshot => self.on_snapshot_response(msg),
            Action::Has => self.on_has_response(msg),
            other => log::warn!("unexpected RECORD action {:?}", other),
        }
    }

    fn on_ack(&self, msg: Message) {
        let nested = msg.field(0).unwrap_or("").to_string();
        let name = msg.field(1).unwrap_or("").to_string();
        match nested.as_str() {
            "S" => self.ack_registry.clear(Topic::Record, Action::Subscribe, &name),
            "US" => {
                if !self.ack_registry.has(Topic::Record, Action::Unsubscribe, &name) {
                    self.report_unsolicited(&name);
                    return;
                }
                self.ack_registry.clear(Topic::Record, Action::Unsubscribe, &name);
                if let Some(record) = self.cache.lock().expect("cache mutex poisoned").remove(&name) {
                    record.state.lock().expect("record mutex poisoned").destroyed = true;
                }
                if let Some(cb) = self.on_discarded.lock().expect("on_discarded mutex poisoned").clone() {
                    cb(&name);
                }
            }
            "D" => {
                if !self.ack_registry.has(Topic::Record, Action::Delete, &name) {
                    self.report_unsolicited(&name);
                    return;
                }
                self.ack_registry.clear(Topic::Record, Action::Delete, &name);
                if let Some(record) = self.cache.lock().expect("cache mutex poisoned").remove(&name) {
                    record.state.lock().expect("record mutex poisoned").destroyed = true;
                }
                if let Some(cb) = self.on_deleted.lock().expect("on_deleted mutex poisoned").clone() {
                    cb(&name);
                }
            }
            _ => {}
        }
    }

    fn report_unsolicited(&self, name: &str) {
        (self.connection.error_handler())(RuntimeError {
            topic: Topic::Record,
            event: ErrorKind::UnsolicitedMessage,
            message: format!("unsolicited ack for record {name}"),
        });
    }

    fn on_read(&self, msg: Message) {
        let Some(name) = msg.field(0) else { return };
        let Some(record) = self.find(name) else { return };
        let Some(version_str) = msg.field(1) else { return };
        let Ok(version) = version_str.parse::<i64>() else { return };
        let data = msg.field(2).and_then(|f| WireValue::decode(f).ok()).map(|w| w.into_json()).unwrap_or(Value::Null);

        let should_apply = record.state.lock().expect("record mutex poisoned").version == -1;
        if !should_apply {
            return;
        }
        self.ack_registry.clear(Topic::Record, Action::Read, name);
        let when_ready: Vec<Box<dyn FnOnce() + Send>> = {
            let mut state = record.state.lock().expect("record mutex poisoned");
            state.version = version;
            state.data = data;
            state.ready = true;
            std::mem::take(&mut state.when_ready)
        };
        for cb in when_ready {
            cb();
        }
    }

    fn on_update(&self, msg: Message) {
        let (Some(name), Some(version_str)) = (msg.field(0), msg.field(1)) else {
            return;
        };
        let Some(record) = self.find(name) else { return };
        let Ok(version) = version_str.parse::<i64>() else { return };
        let new_data = msg.field(2).and_then(|f| WireValue::decode(f).ok()).map(|w| w.into_json()).unwrap_or(Value::Null);

        let expected = record.state.lock().expect("record mutex poisoned").version + 1;
        if version != expected {
            self.recover_merge(&record, version, new_data);
            return;
        }
        let old_data = {
            let mut state = record.state.lock().expect("record mutex poisoned");
            let old_data = state.data.clone();
            state.data = new_data.clone();
            state.version = version;
            old_data
        };
        self.fire_subscribers(&record, &old_data, &new_data);
    }

    fn on_patch(&self, msg: Message) {
        let (Some(name), Some(version_str), Some(path)) = (msg.field(0), msg.field(1), msg.field(2)) else {
            return;
        };
        let Some(record) = self.find(name) else { return };
        let Ok(version) = version_str.parse::<i64>() else { return };
        let Some(typed_field) = msg.field(3) else { return };
        let Ok(typed) = WireValue::decode(typed_field) else { return };

        let expected = record.state.lock().expect("record mutex poisoned").version + 1;
        if version != expected {
            self.connection
                .send(&Message::new(Topic::Record, Action::Snapshot, vec![name.to_string()]));
            return;
        }
        let (old_data, new_data) = {
            let mut state = record.state.lock().expect("record mutex poisoned");
            let old_data = state.data.clone();
            if typed.is_undefined() {
                value::delete_path(&mut state.data, path);
            } else {
                value::set_path(&mut state.data, path, typed.into_json());
            }
            state.version = version;
            (old_data, state.data.clone())
        };
        self.fire_subscribers(&record, &old_data, &new_data);
    }

    fn recover_merge(&self, record: &Arc<RecordInner>, remote_version: i64, remote_data: Value) {
        let strategy = record.state.lock().expect("record mutex poisoned").merge_strategy;
        match strategy {
            MergeStrategy::RemoteWins => {
                let old_data = {
                    let mut state = record.state.lock().expect("record mutex poisoned");
                    let old_data = state.data.clone();
                    state.version = remote_version;
                    state.data = remote_data.clone();
                    old_data
                };
                self.fire_subscribers(record, &old_data, &remote_data);
            }
            MergeStrategy::LocalWins => {
                let (local_data, new_version) = {
                    let mut state = record.state.lock().expect("record mutex poisoned");
                    state.version = remote_version + 1;
                    (state.data.clone(), state.version)
                };
                let field = WireValue::from_json(&local_data).encode();
                self.connection.send(&Message::new(
                    Topic::Record,
                    Action::Update,
                    vec![record.name.clone(), new_version.to_string(), field],
                ));
            }
        }
    }

    fn on_write_ack(&self, msg: Message) {
        let Some(name) = msg.field(0) else { return };
        let Some(versions_field) = msg.field(1) else { return };
        let error = msg.field(2).filter(|s| !s.is_empty());
        let keys: Vec<String> = versions_field.split(',').map(|v| format!("{name}:{v}")).collect();
        let result = match error {
            Some(e) => Err(ClientError::Server(e.to_string())),
            None => Ok(()),
        };
        self.write_ack_notifier.receive_many(&keys, result);
    }

    fn on_has_provider(&self, msg: Message) {
        let (Some(name), Some(flag)) = (msg.field(0), msg.field(1)) else {
            return;
        };
        let Some(record) = self.find(name) else { return };
        let has_provider = flag == "T";
        let callbacks: Vec<ProviderCallback> = {
            let mut state = record.state.lock().expect("record mutex poisoned");
            state.has_provider = has_provider;
            state.provider_listeners.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in callbacks {
            cb(has_provider);
        }
    }

    fn on_error(&self, msg: Message) {
        let Some(kind) = msg.field(0) else { return };
        match kind {
            "VERSION_EXISTS" => {
                let (Some(name), Some(version_str), Some(remote_field)) = (msg.field(1), msg.field(2), msg.field(3)) else {
                    return;
                };
                let Some(record) = self.find(name) else { return };
                let Ok(version) = version_str.parse::<i64>() else { return };
                let remote = WireValue::decode(remote_field).map(|w| w.into_json()).unwrap_or(Value::Null);
                self.recover_merge(&record, version, remote);
            }
            "MESSAGE_DENIED" => {
                if let Some(name) = msg.field(1) {
                    self.ack_registry.clear(Topic::Record, Action::Subscribe, name);
                    self.ack_registry.clear(Topic::Record, Action::Read, name);
                    (self.connection.error_handler())(RuntimeError {
                        topic: Topic::Record,
                        event: ErrorKind::MessageDenied,
                        message: format!("write denied for {name}"),
                    });
                }
            }
            other => log::warn!("unexpected RECORD error kind {other:?}"),
        }
    }

    fn on_snapshot_response(&self, msg: Message) {
        let Some(name) = msg.field(0) else { return };
        let data = msg.field(1).and_then(|f| WireValue::decode(f).ok()).map(|w| w.into_json()).unwrap_or(Value::Null);
        self.snapshot_notifier.receive(name, Ok(data));
    }

    fn on_has_response(&self, msg: Message) {
        let (Some(name), Some(flag)) = (msg.field(0), msg.field(1)) else {
            return;
        };
        self.has_notifier.receive(name, Ok(flag == "T"));
    }

    /// Resolves every pending `snapshot`/`has`/`setWithAck` caller with
    /// `IS_CLOSED` so nothing is left blocked after the client shuts down.
    pub fn close(&self) {
        self.snapshot_notifier.close_all();
        self.has_notifier.close_all();
        self.write_ack_notifier.close_all();
    }

    /// On reconnect: re-sends `CREATEORREAD` to resume server-side
    /// subscriptions and resets pending ack entries.
    fn resubscribe_all(&self) {
        let names: Vec<String> = self.cache.lock().expect("cache mutex poisoned").keys().cloned().collect();
        for name in names {
            self.send_create_or_read(&name);
        }
        self.snapshot_notifier.replay_all();
        self.has_notifier.replay_all();
        self.write_ack_notifier.replay_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::mock::MockTransport;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn open_engine() -> (Arc<RecordEngine>, MockTransport) {
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
        (RecordEngine::new(conn), transport)
    }

    #[tokio::test]
    async fn get_record_sends_create_or_read_once_per_name() {
        let (engine, transport) = open_engine();
        let r1 = engine.get_record("user/1");
        let r2 = engine.get_record("user/1");
        assert!(Arc::ptr_eq(&r1, &r2));
        let creates: Vec<_> = transport.sent_frames().into_iter().filter(|f| f.contains("user/1")).collect();
        assert_eq!(creates.len(), 1);
    }

    #[tokio::test]
    async fn read_populates_data_and_drains_when_ready() {
        let (engine, _transport) = open_engine();
        let record = engine.get_record("user/1");
        let ready = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ready2 = ready.clone();
        record.when_ready(move || {
            ready2.store(true, Ordering::SeqCst);
        });
        assert!(!ready.load(Ordering::SeqCst));

        engine.handle_message(Message::new(Topic::Record, Action::Read, vec!["user/1".to_string(), "0".to_string(), "Ofoo".to_string()]));
        assert!(record.is_ready());
        assert!(ready.load(Ordering::SeqCst));
        assert_eq!(record.version(), 0);
    }

    #[tokio::test]
    async fn update_with_unexpected_version_recovers_via_remote_wins() {
        let (engine, _transport) = open_engine();
        let record = engine.get_record("user/1");
        engine.handle_message(Message::new(Topic::Record, Action::Read, vec!["user/1".to_string(), "0".to_string(), "O{}".to_string()]));

        let remote_field = format!("O{}", json!({"name": "remote"}));
        engine.handle_message(Message::new(
            Topic::Record,
            Action::Update,
            vec!["user/1".to_string(), "5".to_string(), remote_field],
        ));
        assert_eq!(record.version(), 5);
        assert_eq!(record.get(None), json!({"name": "remote"}));
    }

    #[tokio::test]
    async fn set_is_a_no_op_when_value_is_unchanged() {
        let (engine, transport) = open_engine();
        let record = engine.get_record("user/1");
        engine.handle_message(Message::new(Topic::Record, Action::Read, vec!["user/1".to_string(), "0".to_string(), "O{\"a\":1}".to_string()]));

        engine.set(&record, Some("a"), json!(1)).unwrap();
        assert_eq!(record.version(), 0);
        let before = transport.sent_frames().len();
        engine.set(&record, Some("a"), json!(2)).unwrap();
        assert_eq!(record.version(), 1);
        assert!(transport.sent_frames().len() > before);
    }

    #[tokio::test]
    async fn path_subscribers_receive_the_changed_subtree() {
        let (engine, _transport) = open_engine();
        let record = engine.get_record("user/1");
        engine.handle_message(Message::new(Topic::Record, Action::Read, vec!["user/1".to_string(), "0".to_string(), "O{\"a\":1,\"b\":2}".to_string()]));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        record.subscribe(
            Some("a"),
            Arc::new(move |v: &Value| seen2.lock().unwrap().push(v.clone())),
            false,
        );
        engine.set(&record, Some("a"), json!(9)).unwrap();
        engine.set(&record, Some("b"), json!(9)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!(9)]);
    }
}
