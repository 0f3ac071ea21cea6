use crate::message::{Action, Topic};
use std::fmt;

/// One of the closed set of error kinds the client can report.
///
/// Kinds mirror the ones a server or a timer can raise; they are the
/// `event` half of the `(topic, event, message)` triple handed to a
/// [`RuntimeErrorHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConnectionError,
    MessageParseError,
    UnsolicitedMessage,
    AckTimeout,
    ResponseTimeout,
    DeleteTimeout,
    VersionExists,
    NotSubscribed,
    ListenerExists,
    NotListening,
    MessageDenied,
    NotAuthenticated,
    TooManyAuthAttempts,
    IsClosed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ConnectionError => "CONNECTION_ERROR",
            ErrorKind::MessageParseError => "MESSAGE_PARSE_ERROR",
            ErrorKind::UnsolicitedMessage => "UNSOLICITED_MESSAGE",
            ErrorKind::AckTimeout => "ACK_TIMEOUT",
            ErrorKind::ResponseTimeout => "RESPONSE_TIMEOUT",
            ErrorKind::DeleteTimeout => "DELETE_TIMEOUT",
            ErrorKind::VersionExists => "VERSION_EXISTS",
            ErrorKind::NotSubscribed => "NOT_SUBSCRIBED",
            ErrorKind::ListenerExists => "LISTENER_EXISTS",
            ErrorKind::NotListening => "NOT_LISTENING",
            ErrorKind::MessageDenied => "MESSAGE_DENIED",
            ErrorKind::NotAuthenticated => "NOT_AUTHENTICATED",
            ErrorKind::TooManyAuthAttempts => "TOO_MANY_AUTH_ATTEMPTS",
            ErrorKind::IsClosed => "IS_CLOSED",
        };
        f.write_str(s)
    }
}

/// A runtime error: something the application didn't directly cause by a
/// failing call, but should still learn about. Delivered to the
/// application's [`RuntimeErrorHandler`] if one is installed, logged
/// otherwise — never silently dropped.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub topic: Topic,
    pub event: ErrorKind,
    pub message: String,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.topic, self.event, self.message)
    }
}

pub type RuntimeErrorHandler = Box<dyn Fn(RuntimeError) + Send + Sync>;

/// Errors raised directly to the caller of an API method (as opposed to
/// `RuntimeError`s, which go to the installed handler).
#[derive(thiserror::Error, Debug, Clone)]
pub enum ClientError {
    #[error("client is closed")]
    IsClosed,

    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("too many authentication attempts")]
    TooManyAuthAttempts,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("record {0} is destroyed")]
    RecordDestroyed(String),

    #[error("anonymous record has no bound record")]
    AnonymousRecordUninitialized,

    #[error("rpc already completed")]
    RpcAlreadyCompleted,

    #[error("ack timeout waiting for {topic:?}|{action:?}|{name}")]
    AckTimeout {
        topic: Topic,
        action: Action,
        name: String,
    },

    #[error("response timeout: {0}")]
    ResponseTimeout(String),

    #[error("server rejected: {0}")]
    Rejection(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("malformed frame: {0}")]
    Codec(String),

    #[error(transparent)]
    Other(#[from] OtherError),
}

/// Wrapper so we can carry an `anyhow::Error` inside a `Clone`-able
/// `ClientError` without requiring `anyhow::Error` itself to be `Clone`.
#[derive(Debug, Clone)]
pub struct OtherError(pub std::sync::Arc<anyhow::Error>);

impl fmt::Display for OtherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for OtherError {}

impl From<anyhow::Error> for OtherError {
    fn from(e: anyhow::Error) -> Self {
        OtherError(std::sync::Arc::new(e))
    }
}
