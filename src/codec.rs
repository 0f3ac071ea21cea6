//! The framed text protocol: `TOPIC US ACTION US FIELD1 US ... US FIELDn RS`,
//! where `US = 0x1F` and `RS = 0x1E`. A frame may hold several messages
//! back to back; an empty trailing message is ignored.

use crate::error::ClientError;
use crate::message::{Action, Message, Topic};

pub const US: char = '\u{1f}';
pub const RS: char = '\u{1e}';

/// Build the wire form of a single message, without the field at `data[0]`
/// being anything special — callers decide what each field means.
pub fn encode_one(topic: Topic, action: Action, data: &[String]) -> String {
    let mut parts = Vec::with_capacity(2 + data.len());
    parts.push(topic.letter().to_string());
    parts.push(action.code().to_string());
    parts.extend(data.iter().cloned());
    parts.join(&US.to_string())
}

/// Encode a full frame containing one or more messages.
pub fn encode(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages {
        out.push_str(&m.raw);
        out.push(RS);
    }
    out
}

/// Encode a single already-built message followed by the frame separator,
/// ready to hand to a transport.
pub fn encode_single(message: &Message) -> String {
    let mut out = message.raw.clone();
    out.push(RS);
    out
}

/// Decode a frame into zero or more messages. A malformed individual
/// message raises a [`ClientError::Codec`]; the caller (the connection) is
/// responsible for surfacing that as `MESSAGE_PARSE_ERROR` without tearing
/// the connection down.
pub fn decode(frame: &str) -> Result<Vec<Message>, ClientError> {
    let mut messages = Vec::new();
    for chunk in frame.split(RS) {
        if chunk.is_empty() {
            continue;
        }
        messages.push(decode_one(chunk)?);
    }
    Ok(messages)
}

fn decode_one(chunk: &str) -> Result<Message, ClientError> {
    let mut fields = chunk.split(US);
    let topic_letter = fields
        .next()
        .ok_or_else(|| ClientError::Codec("missing topic".into()))?;
    let action_code = fields
        .next()
        .ok_or_else(|| ClientError::Codec("missing action".into()))?;
    let topic = Topic::from_letter(topic_letter)?;
    let action = Action::from_code(action_code)?;
    let data: Vec<String> = fields.map(|s| s.to_string()).collect();
    Ok(Message {
        topic,
        action,
        data,
        raw: chunk.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_message() {
        let m = Message::new(Topic::Record, Action::Read, vec!["recordA".into(), "0".into()]);
        let frame = encode_single(&m);
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded, vec![m]);
    }

    #[test]
    fn concatenated_frames_decode_in_order() {
        let a = Message::new(Topic::Event, Action::Subscribe, vec!["chat".into()]);
        let b = Message::new(Topic::Rpc, Action::Request, vec!["addTwo".into(), "1".into()]);
        let mut frame = encode_single(&a);
        frame.push_str(&encode_single(&b));
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded, vec![a, b]);
    }

    #[test]
    fn empty_trailing_message_is_ignored() {
        let a = Message::new(Topic::Connection, Action::Ping, vec![]);
        let frame = format!("{}{}{}", a.raw, RS, RS);
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded, vec![a]);
    }

    #[test]
    fn unknown_topic_is_a_parse_error() {
        let frame = format!("Z{}S{}foo{}", US, US, RS);
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn challenge_handshake_literal_trace() {
        let challenge = decode(&format!("C{}CH{}", US, RS)).unwrap();
        assert_eq!(challenge[0].topic, Topic::Connection);
        assert_eq!(challenge[0].action, Action::Challenge);

        let resp = Message::new(
            Topic::Connection,
            Action::ChallengeResponse,
            vec!["ws://host/ds".into()],
        );
        assert_eq!(encode_single(&resp), format!("C{}CHR{}ws://host/ds{}", US, US, RS));
    }
}
