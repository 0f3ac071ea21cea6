//! A record reference whose underlying name is bound later via
//! `setName`, used for records identified only once a user is logged in
//! or an id is otherwise not known up front. Before binding, reads return
//! `Null` and writes fail with `AnonymousRecordUninitialized`.

use super::{ChangeCallback, RecordEngine, RecordInner};
use crate::error::ClientError;
use serde_json::Value;
use std::sync::{Arc, Mutex};

struct Subscription {
    path: Option<String>,
    callback: ChangeCallback,
}

struct Bound {
    record: Arc<RecordInner>,
    sub_ids: Vec<(Option<String>, u64)>,
}

pub struct AnonymousRecord {
    engine: Arc<RecordEngine>,
    subscriptions: Mutex<Vec<Subscription>>,
    bound: Mutex<Option<Bound>>,
}

impl AnonymousRecord {
    pub fn new(engine: Arc<RecordEngine>) -> Arc<Self> {
        Arc::new(AnonymousRecord {
            engine,
            subscriptions: Mutex::new(Vec::new()),
            bound: Mutex::new(None),
        })
    }

    pub fn name(&self) -> Option<String> {
        self.bound.lock().expect("bound mutex poisoned").as_ref().map(|b| b.record.name().to_string())
    }

    /// Rebinds to `name`, discarding the previously bound record (if any)
    /// and resubscribing every registered callback against the new one.
    /// Fires callbacks whose observed value actually differs between the
    /// old and new record.
    pub fn set_name(&self, name: &str) {
        let old_values: Vec<(Option<String>, Value)> = {
            let bound = self.bound.lock().expect("bound mutex poisoned");
            let subs = self.subscriptions.lock().expect("subscriptions mutex poisoned");
            match bound.as_ref() {
                Some(b) => subs.iter().map(|s| (s.path.clone(), b.record.get(s.path.as_deref()))).collect(),
                None => subs.iter().map(|s| (s.path.clone(), Value::Null)).collect(),
            }
        };

        let old_bound = self.bound.lock().expect("bound mutex poisoned").take();
        if let Some(old) = old_bound {
            for (path, id) in old.sub_ids {
                old.record.unsubscribe(path.as_deref(), id);
            }
            self.engine.discard(&old.record);
        }

        let new_record = self.engine.get_record(name);
        let mut sub_ids = Vec::new();
        {
            let subs = self.subscriptions.lock().expect("subscriptions mutex poisoned");
            for (sub, (path, old_value)) in subs.iter().zip(old_values.iter()) {
                let cb = sub.callback.clone();
                let path_owned = sub.path.clone();
                let id = new_record.subscribe(path_owned.as_deref(), cb.clone(), false);
                sub_ids.push((path_owned, id));
                let new_value = new_record.get(path.as_deref());
                if &new_value != old_value {
                    cb(&new_value);
                }
            }
        }
        *self.bound.lock().expect("bound mutex poisoned") = Some(Bound {
            record: new_record,
            sub_ids,
        });
    }

    pub fn get(&self, path: Option<&str>) -> Value {
        match self.bound.lock().expect("bound mutex poisoned").as_ref() {
            Some(b) => b.record.get(path),
            None => Value::Null,
        }
    }

    pub fn set(&self, path: Option<&str>, value: Value) -> Result<(), ClientError> {
        let bound = self.bound.lock().expect("bound mutex poisoned");
        match bound.as_ref() {
            Some(b) => self.engine.set(&b.record, path, value),
            None => Err(ClientError::AnonymousRecordUninitialized),
        }
    }

    pub fn subscribe(&self, path: Option<&str>, cb: ChangeCallback) {
        let mut subs = self.subscriptions.lock().expect("subscriptions mutex poisoned");
        subs.push(Subscription {
            path: path.map(str::to_string),
            callback: cb.clone(),
        });
        drop(subs);
        if let Some(bound) = self.bound.lock().expect("bound mutex poisoned").as_mut() {
            let id = bound.record.subscribe(path, cb, false);
            bound.sub_ids.push((path.map(str::to_string), id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::connection::Connection;
    use crate::message::{Action, Message, Topic};
    use crate::transport::mock::MockTransport;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn open_engine() -> Arc<RecordEngine> {
        let transport = MockTransport::new();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (rpc_tx, _rpc_rx) = mpsc::unbounded_channel();
        let (record_tx, _record_rx) = mpsc::unbounded_channel();
        let (presence_tx, _presence_rx) = mpsc::unbounded_channel();
        let conn = Connection::connect(
            "ws://host",
            ClientConfig::default(),
            Box::new(transport),
            Arc::new(|_| {}),
            event_tx,
            rpc_tx,
            record_tx,
            presence_tx,
        )
        .unwrap();
        RecordEngine::new(conn)
    }

    #[tokio::test]
    async fn reads_and_writes_fail_before_set_name_is_called() {
        let engine = open_engine();
        let anon = AnonymousRecord::new(engine);
        assert_eq!(anon.get(None), Value::Null);
        assert!(anon.set(None, json!(1)).is_err());
    }

    #[tokio::test]
    async fn set_name_binds_to_the_underlying_record() {
        let engine = open_engine();
        let anon = AnonymousRecord::new(engine.clone());
        anon.set_name("user/1");
        assert_eq!(anon.name().as_deref(), Some("user/1"));
        engine.handle_message(Message::new(
            Topic::Record,
            Action::Read,
            vec!["user/1".to_string(), "0".to_string(), "O{\"a\":1}".to_string()],
        ));
        assert_eq!(anon.get(Some("a")), json!(1));
    }

    #[tokio::test]
    async fn rebinding_refires_subscribers_only_when_the_observed_value_changes() {
        let engine = open_engine();

        // Prime three records with their data already loaded, so rebinding
        // to any of them compares against settled values rather than racing
        // a pending `Read`.
        for (name, value) in [("user/1", 1), ("user/2", 1), ("user/3", 2)] {
            let _record = engine.get_record(name);
            engine.handle_message(Message::new(
                Topic::Record,
                Action::Read,
                vec![name.to_string(), "0".to_string(), format!("O{{\"a\":{value}}}")],
            ));
        }

        let anon = AnonymousRecord::new(engine.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        anon.subscribe(
            Some("a"),
            Arc::new(move |v: &Value| seen2.lock().unwrap().push(v.clone())),
        );

        anon.set_name("user/1"); // Null -> 1, fires
        anon.set_name("user/2"); // 1 -> 1, no fire
        anon.set_name("user/3"); // 1 -> 2, fires

        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2)]);
    }
}
