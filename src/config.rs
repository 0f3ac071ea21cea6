use std::time::Duration;

/// Conflict resolver invoked when a remote version doesn't follow the
/// expected `version + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    #[default]
    RemoteWins,
    LocalWins,
}

/// Tunable deadlines and defaults for the connection and the record,
/// rpc, and presence subsystems built on top of it.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub subscription_timeout: Duration,
    pub record_read_ack_timeout: Duration,
    pub record_read_timeout: Duration,
    pub record_delete_timeout: Duration,
    pub rpc_ack_timeout: Duration,
    pub rpc_response_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_interval_increment: Duration,
    pub max_reconnect_interval: Duration,
    pub path: String,
    pub record_merge_strategy: MergeStrategy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            subscription_timeout: Duration::from_millis(2000),
            record_read_ack_timeout: Duration::from_millis(1000),
            record_read_timeout: Duration::from_millis(3000),
            record_delete_timeout: Duration::from_millis(3000),
            rpc_ack_timeout: Duration::from_millis(6000),
            rpc_response_timeout: Duration::from_millis(10000),
            max_reconnect_attempts: 5,
            reconnect_interval_increment: Duration::from_millis(4000),
            max_reconnect_interval: Duration::from_millis(180_000),
            path: "/deepstream".to_string(),
            record_merge_strategy: MergeStrategy::RemoteWins,
        }
    }
}
