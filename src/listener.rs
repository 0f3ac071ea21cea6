//! Topic-parametric pattern listener shared by `EventHandler` and
//! `RecordEngine`. Sends `LISTEN`, handles the ack,
//! `SUBSCRIPTION_FOR_PATTERN_FOUND`/`_REMOVED`, and resubscribes by
//! re-sending `LISTEN` on reconnect.

use crate::ack::AckRegistry;
use crate::connection::Connection;
use crate::error::ErrorKind;
use crate::message::{Action, Message, Topic};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum PatternEvent {
    Found(String),
    Removed(String),
}

pub type ListenCallback = Box<dyn Fn(PatternEvent) -> bool + Send + Sync>;

pub struct Listener {
    topic: Topic,
    pattern: String,
    connection: Arc<Connection>,
    ack_registry: Arc<AckRegistry>,
    callback: ListenCallback,
}

impl Listener {
    pub fn new(topic: Topic, pattern: String, connection: Arc<Connection>, callback: ListenCallback) -> Arc<Self> {
        let ack_registry = connection.ack_registry();
        let listener = Arc::new(Listener {
            topic,
            pattern: pattern.clone(),
            connection,
            ack_registry,
            callback,
        });
        listener.send_listen();
        listener
    }

    fn send_listen(&self) {
        self.ack_registry.add(
            self.topic,
            Action::Listen,
            &self.pattern,
            self.connection.config().subscription_timeout,
            ErrorKind::AckTimeout,
        );
        self.connection
            .send(&Message::new(self.topic, Action::Listen, vec![self.pattern.clone()]));
    }

    pub fn handle_message(&self, msg: &Message) {
        match msg.action {
            Action::Ack => {
                self.ack_registry.clear(self.topic, Action::Listen, &self.pattern);
            }
            Action::SubscriptionForPatternFound => {
                if let Some(matched) = msg.field(1) {
                    let accept = (self.callback)(PatternEvent::Found(matched.to_string()));
                    let response_action = if accept { Action::ListenAccept } else { Action::ListenReject };
                    self.connection.send(&Message::new(
                        self.topic,
                        response_action,
                        vec![self.pattern.clone(), matched.to_string()],
                    ));
                }
            }
            Action::SubscriptionForPatternRemoved => {
                if let Some(matched) = msg.field(1) {
                    (self.callback)(PatternEvent::Removed(matched.to_string()));
                }
            }
            other => log::warn!("unexpected action {:?} for pattern listener", other),
        }
    }

    pub fn resubscribe(&self) {
        self.send_listen();
    }

    pub fn destroy(&self) {
        self.connection
            .send(&Message::new(self.topic, Action::Unlisten, vec![self.pattern.clone()]));
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}
