//! Client-side core of a realtime data-sync protocol: events, versioned
//! records, RPC and presence multiplexed over one connection.

pub mod ack;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod listener;
pub mod message;
pub mod presence;
pub mod record;
pub mod resubscribe;
pub mod rpc;
pub mod single_notifier;
pub mod transport;
pub mod value;

pub use client::Client;
pub use config::{ClientConfig, MergeStrategy};
pub use connection::{ConnectionState, Connectivity, LoginResult};
pub use error::{ClientError, ErrorKind, RuntimeError, RuntimeErrorHandler};
pub use event::SubscriptionId;
pub use listener::{ListenCallback, PatternEvent};
pub use message::{Action, Message, Topic, WireValue};
pub use presence::PresenceCallback;
pub use record::anonymous::AnonymousRecord;
pub use record::list::{ListChange, ListHandle};
pub use record::{ChangeCallback, ProviderCallback, RecordEngine, RecordInner};
pub use rpc::{RpcProvider, RpcResponse};
pub use transport::{Transport, TransportEvent};
