//! The underlying message transport is assumed to deliver ordered text
//! frames and signal open/close/error. This module defines the seam
//! ([`Transport`]/[`TransportEvent`]) plus one concrete implementation,
//! [`WebSocketTransport`], adapted from `websocket.rs`'s
//! `DbConnection::connect` / `spawn_message_loop` but carrying text
//! frames instead of length-prefixed protobuf.

use futures::{SinkExt, StreamExt};
use futures_channel::mpsc as fmpsc;
use http::uri::{Parts, Uri};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Close,
}

/// A transport hands back a sender for outbound frames and a receiver for
/// inbound events as soon as `open` is called; connecting happens in the
/// background, signalled by the first `TransportEvent::Open` (or `Error`).
pub trait Transport: Send + Sync {
    fn open(&self, url: &str) -> (fmpsc::UnboundedSender<String>, fmpsc::UnboundedReceiver<TransportEvent>);
}

/// Accepts `ws:`/`wss:` with an implicit scheme, rejects `http(s)`, and
/// appends `default_path` if the URL doesn't already carry a path.
pub fn normalize_url(raw: &str, default_path: &str) -> Result<String, String> {
    let uri: Uri = raw.parse().map_err(|e| format!("invalid url {raw:?}: {e}"))?;
    let mut parts = Parts::try_from(uri).map_err(|e| format!("invalid url {raw:?}: {e}"))?;
    match &parts.scheme {
        Some(s) => match s.as_str() {
            "ws" | "wss" => {}
            "http" | "https" => return Err(format!("unsupported scheme in url {raw:?}, use ws/wss")),
            other => return Err(format!("unknown scheme {other:?} in url {raw:?}")),
        },
        None => parts.scheme = Some("ws".parse().unwrap()),
    }
    let has_path = parts
        .path_and_query
        .as_ref()
        .map(|pq| pq.path() != "" && pq.path() != "/")
        .unwrap_or(false);
    if !has_path {
        parts.path_and_query = Some(default_path.parse().map_err(|e| format!("invalid path: {e}"))?);
    }
    Ok(Uri::try_from(parts).map_err(|e| e.to_string())?.to_string())
}

/// Real WebSocket transport built on `tokio-tungstenite`, directly
/// modeled on `DbConnection`.
pub struct WebSocketTransport;

impl Transport for WebSocketTransport {
    fn open(&self, url: &str) -> (fmpsc::UnboundedSender<String>, fmpsc::UnboundedReceiver<TransportEvent>) {
        let (outgoing_tx, mut outgoing_rx) = fmpsc::unbounded::<String>();
        let (incoming_tx, incoming_rx) = fmpsc::unbounded::<TransportEvent>();
        let url = url.to_string();

        tokio::spawn(async move {
            let request = match url.clone().into_client_request() {
                Ok(r) => r,
                Err(e) => {
                    let _ = incoming_tx.unbounded_send(TransportEvent::Error(e.to_string()));
                    return;
                }
            };
            let stream = match connect_async(request).await {
                Ok((stream, _response)) => stream,
                Err(e) => {
                    let _ = incoming_tx.unbounded_send(TransportEvent::Error(e.to_string()));
                    return;
                }
            };
            let (mut write, mut read) = stream.split();
            let _ = incoming_tx.unbounded_send(TransportEvent::Open);

            loop {
                tokio::select! {
                    incoming = read.next() => match incoming {
                        None => {
                            let _ = incoming_tx.unbounded_send(TransportEvent::Close);
                            return;
                        }
                        Some(Err(e)) => {
                            let _ = incoming_tx.unbounded_send(TransportEvent::Error(e.to_string()));
                            return;
                        }
                        Some(Ok(WsMessage::Text(text))) => {
                            if incoming_tx.unbounded_send(TransportEvent::Message(text)).is_err() {
                                return;
                            }
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            if write.send(WsMessage::Pong(payload)).await.is_err() {
                                return;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) => {
                            let _ = incoming_tx.unbounded_send(TransportEvent::Close);
                            return;
                        }
                        Some(Ok(_other)) => {
                            log::warn!("unexpected non-text websocket frame");
                        }
                    },
                    outgoing = outgoing_rx.next() => match outgoing {
                        None => return,
                        Some(text) => {
                            if write.send(WsMessage::Text(text)).await.is_err() {
                                let _ = incoming_tx.unbounded_send(TransportEvent::Close);
                                return;
                            }
                        }
                    }
                }
            }
        });

        (outgoing_tx, incoming_rx)
    }
}

use tokio_tungstenite::tungstenite::client::IntoClientRequest;

#[cfg(test)]
pub mod mock {
    //! An in-memory transport double used by the connection/engine test
    //! suites, substituting for the real WebSocket so the state machine
    //! has something concrete to drive in tests.
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    pub struct MockTransport {
        pub sent: Arc<Mutex<Vec<String>>>,
        incoming_tx: Arc<Mutex<Option<fmpsc::UnboundedSender<TransportEvent>>>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            MockTransport {
                sent: Arc::new(Mutex::new(Vec::new())),
                incoming_tx: Arc::new(Mutex::new(None)),
            }
        }

        pub fn push(&self, event: TransportEvent) {
            if let Some(tx) = self.incoming_tx.lock().unwrap().as_ref() {
                let _ = tx.unbounded_send(event);
            }
        }

        pub fn sent_frames(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn open(&self, _url: &str) -> (fmpsc::UnboundedSender<String>, fmpsc::UnboundedReceiver<TransportEvent>) {
            let (outgoing_tx, mut outgoing_rx) = fmpsc::unbounded::<String>();
            let (incoming_tx, incoming_rx) = fmpsc::unbounded::<TransportEvent>();
            *self.incoming_tx.lock().unwrap() = Some(incoming_tx);
            let sent = self.sent.clone();
            tokio::spawn(async move {
                while let Some(frame) = outgoing_rx.next().await {
                    sent.lock().unwrap().push(frame);
                }
            });
            (outgoing_tx, incoming_rx)
        }
    }

    #[test]
    fn normalize_adds_default_path() {
        let url = super::normalize_url("ws://host", "/deepstream").unwrap();
        assert_eq!(url, "ws://host/deepstream");
    }

    #[test]
    fn normalize_rejects_http() {
        assert!(super::normalize_url("http://host", "/deepstream").is_err());
    }

    #[test]
    fn normalize_defaults_scheme() {
        let url = super::normalize_url("host/deepstream", "/deepstream").unwrap();
        assert!(url.starts_with("ws://"));
    }
}
