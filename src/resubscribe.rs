//! Replays subscriptions after a connection is re-established. Latches
//! on `RECONNECTING`, fires registered callbacks exactly once per
//! reconnection cycle when `OPEN` arrives while latched. A direct
//! `CLOSED`→`OPEN` transition (first connect) does not fire.

use crate::connection::ConnectionState;
use std::sync::{Arc, Mutex};

type ResubscribeCallback = Box<dyn Fn() + Send + Sync>;

pub struct ResubscribeCoordinator {
    is_reconnecting: Mutex<bool>,
    callbacks: Mutex<Vec<ResubscribeCallback>>,
}

impl ResubscribeCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(ResubscribeCoordinator {
            is_reconnecting: Mutex::new(false),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn register(&self, cb: ResubscribeCallback) {
        self.callbacks.lock().expect("callbacks mutex poisoned").push(cb);
    }

    pub fn on_transition(&self, _old: ConnectionState, new: ConnectionState) {
        match new {
            ConnectionState::Reconnecting => {
                *self.is_reconnecting.lock().expect("is_reconnecting mutex poisoned") = true;
            }
            ConnectionState::Open => {
                let mut latched = self.is_reconnecting.lock().expect("is_reconnecting mutex poisoned");
                if *latched {
                    *latched = false;
                    drop(latched);
                    for cb in self.callbacks.lock().expect("callbacks mutex poisoned").iter() {
                        cb();
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_once_per_reconnect_cycle() {
        let coordinator = ResubscribeCoordinator::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        coordinator.register(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        coordinator.on_transition(ConnectionState::Open, ConnectionState::Reconnecting);
        coordinator.on_transition(ConnectionState::Reconnecting, ConnectionState::Error);
        coordinator.on_transition(ConnectionState::Error, ConnectionState::Reconnecting);
        coordinator.on_transition(ConnectionState::Reconnecting, ConnectionState::Open);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A second, unrelated Open (already latched-off) does not refire.
        coordinator.on_transition(ConnectionState::Open, ConnectionState::Open);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn direct_closed_to_open_does_not_fire() {
        let coordinator = ResubscribeCoordinator::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        coordinator.register(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        coordinator.on_transition(ConnectionState::Closed, ConnectionState::AwaitingConnection);
        coordinator.on_transition(ConnectionState::AwaitingConnection, ConnectionState::Open);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
