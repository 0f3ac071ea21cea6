use crate::error::ClientError;
use serde_json::Value;
use std::fmt;

/// The seven topics multiplexed over one connection. Letter codes are the
/// wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Connection,
    Auth,
    Error,
    Event,
    Record,
    Rpc,
    Presence,
}

impl Topic {
    pub fn letter(self) -> &'static str {
        match self {
            Topic::Connection => "C",
            Topic::Auth => "A",
            Topic::Error => "X",
            Topic::Event => "E",
            Topic::Record => "R",
            Topic::Rpc => "P",
            Topic::Presence => "U",
        }
    }

    pub fn from_letter(s: &str) -> Result<Topic, ClientError> {
        Ok(match s {
            "C" => Topic::Connection,
            "A" => Topic::Auth,
            "X" => Topic::Error,
            "E" => Topic::Event,
            "R" => Topic::Record,
            "P" => Topic::Rpc,
            "U" => Topic::Presence,
            other => return Err(ClientError::Codec(format!("unknown topic letter {other:?}"))),
        })
    }
}

/// Actions are shared across topics; the same letter code always means the
/// same action regardless of which topic carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Subscribe,
    Unsubscribe,
    Listen,
    Unlisten,
    ListenAccept,
    ListenReject,
    SubscriptionHasProvider,
    SubscriptionForPatternFound,
    SubscriptionForPatternRemoved,
    Ack,
    Error,
    Event,
    Query,
    PresenceJoin,
    PresenceLeave,
    CreateOrRead,
    Read,
    Update,
    Patch,
    Delete,
    Snapshot,
    Has,
    WriteAcknowledgement,
    VersionExists,
    Ping,
    Pong,
    Challenge,
    ChallengeResponse,
    Redirect,
    Rejection,
    Request,
    Response,
    TooManyAuthAttempts,
}

impl Action {
    pub fn code(self) -> &'static str {
        use Action::*;
        match self {
            Subscribe => "S",
            Unsubscribe => "US",
            Listen => "L",
            Unlisten => "UL",
            ListenAccept => "LA",
            ListenReject => "LR",
            SubscriptionHasProvider => "SP",
            SubscriptionForPatternFound => "SF",
            SubscriptionForPatternRemoved => "SR",
            Ack => "A",
            Error => "E",
            Event => "EVT",
            Query => "Q",
            PresenceJoin => "PNJ",
            PresenceLeave => "PNL",
            CreateOrRead => "CR",
            Read => "R",
            Update => "U",
            Patch => "P",
            Delete => "D",
            Snapshot => "SN",
            Has => "H",
            WriteAcknowledgement => "WA",
            VersionExists => "VE",
            Ping => "PI",
            Pong => "PO",
            Challenge => "CH",
            ChallengeResponse => "CHR",
            Redirect => "RED",
            Rejection => "REJ",
            Request => "REQ",
            Response => "RES",
            TooManyAuthAttempts => "TMAA",
        }
    }

    pub fn from_code(s: &str) -> Result<Action, ClientError> {
        use Action::*;
        Ok(match s {
            "S" => Subscribe,
            "US" => Unsubscribe,
            "L" => Listen,
            "UL" => Unlisten,
            "LA" => ListenAccept,
            "LR" => ListenReject,
            "SP" => SubscriptionHasProvider,
            "SF" => SubscriptionForPatternFound,
            "SR" => SubscriptionForPatternRemoved,
            "A" => Ack,
            "E" => Error,
            "EVT" => Event,
            "Q" => Query,
            "PNJ" => PresenceJoin,
            "PNL" => PresenceLeave,
            "CR" => CreateOrRead,
            "R" => Read,
            "U" => Update,
            "P" => Patch,
            "D" => Delete,
            "SN" => Snapshot,
            "H" => Has,
            "WA" => WriteAcknowledgement,
            "VE" => VersionExists,
            "PI" => Ping,
            "PO" => Pong,
            "CH" => Challenge,
            "CHR" => ChallengeResponse,
            "RED" => Redirect,
            "REJ" => Rejection,
            "REQ" => Request,
            "RES" => Response,
            "TMAA" => TooManyAuthAttempts,
            other => return Err(ClientError::Codec(format!("unknown action code {other:?}"))),
        })
    }
}

/// A single decoded message: topic, action, and the ordered text fields
/// that followed them in the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: Topic,
    pub action: Action,
    pub data: Vec<String>,
    pub raw: String,
}

impl Message {
    pub fn new(topic: Topic, action: Action, data: Vec<String>) -> Self {
        let raw = crate::codec::encode_one(topic, action, &data);
        Message { topic, action, data, raw }
    }

    pub fn field(&self, idx: usize) -> Option<&str> {
        self.data.get(idx).map(|s| s.as_str())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// The wire encoding for a typed value: a one-character tag followed by
/// the payload. `Undefined` is distinct from `Null` — it is the "absent"
/// sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Undefined,
    Null,
    Bool(bool),
    Number(String),
    Str(String),
    Json(Value),
}

impl WireValue {
    pub fn encode(&self) -> String {
        match self {
            WireValue::Undefined => "U".to_string(),
            WireValue::Null => "L".to_string(),
            WireValue::Bool(true) => "T".to_string(),
            WireValue::Bool(false) => "F".to_string(),
            WireValue::Number(n) => format!("N{n}"),
            WireValue::Str(s) => format!("S{s}"),
            WireValue::Json(v) => format!("O{v}", v = v),
        }
    }

    pub fn decode(field: &str) -> Result<WireValue, ClientError> {
        let mut chars = field.chars();
        let tag = chars
            .next()
            .ok_or_else(|| ClientError::Codec("empty typed field".into()))?;
        let payload = chars.as_str();
        Ok(match tag {
            'U' => WireValue::Undefined,
            'L' => WireValue::Null,
            'T' => WireValue::Bool(true),
            'F' => WireValue::Bool(false),
            'N' => WireValue::Number(payload.to_string()),
            'S' => WireValue::Str(payload.to_string()),
            'O' => {
                let v: Value = serde_json::from_str(payload)
                    .map_err(|e| ClientError::Codec(format!("bad json payload: {e}")))?;
                WireValue::Json(v)
            }
            other => return Err(ClientError::Codec(format!("unknown typed-value tag {other:?}"))),
        })
    }

    /// `Undefined` and `Null` both collapse to `Value::Null` once inside
    /// the JSON domain; callers that must distinguish "absent" do so
    /// before calling this.
    pub fn into_json(self) -> Value {
        match self {
            WireValue::Undefined => Value::Null,
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Number(n) => serde_json::Number::from_str_checked(&n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            WireValue::Str(s) => Value::String(s),
            WireValue::Json(v) => v,
        }
    }

    pub fn from_json(v: &Value) -> WireValue {
        match v {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Number(n) => WireValue::Number(n.to_string()),
            Value::String(s) => WireValue::Str(s.clone()),
            Value::Array(_) | Value::Object(_) => WireValue::Json(v.clone()),
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, WireValue::Undefined)
    }
}

/// Small helper trait so `WireValue::into_json` can parse a decimal number
/// without pulling in an extra dependency; `serde_json::Number` has no
/// infallible `from_str`, so we go through `Value` parsing instead.
trait NumberFromStr {
    fn from_str_checked(s: &str) -> Option<serde_json::Number>;
}
impl NumberFromStr for serde_json::Number {
    fn from_str_checked(s: &str) -> Option<serde_json::Number> {
        serde_json::from_str::<Value>(s).ok().and_then(|v| match v {
            Value::Number(n) => Some(n),
            _ => None,
        })
    }
}
