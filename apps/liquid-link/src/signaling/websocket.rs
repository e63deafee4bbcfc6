use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::error::LinkError;
use crate::protocol::{WireEvent, decode_frame, encode_frame};
use crate::signaling::{SignalingConnector, SignalingLink, TransportEvent};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Speaks `{"event", "data"}` JSON frames over a WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    heartbeat: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            heartbeat: HEARTBEAT_INTERVAL,
        }
    }
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeat(heartbeat: Duration) -> Self {
        Self { heartbeat }
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<SignalingLink, LinkError> {
        let websocket_url = websocket_url(url)?;
        tracing::debug!(target: "liquid_link::signaling", url = %websocket_url, "connecting signaling websocket");
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| LinkError::Signaling(format!("websocket connect failed: {err}")))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireEvent>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportEvent>();

        let heartbeat = self.heartbeat;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                tokio::select! {
                    next = outbound_rx.recv() => {
                        let Some(event) = next else {
                            let _ = ws_write.send(Message::Close(None)).await;
                            break;
                        };
                        let text = match encode_frame(&event) {
                            Ok(text) => text,
                            Err(err) => {
                                tracing::warn!(target: "liquid_link::signaling", event = %event.name, error = %err, "dropping unencodable event");
                                continue;
                            }
                        };
                        if let Err(err) = ws_write.send(Message::Text(text)).await {
                            tracing::warn!(target: "liquid_link::signaling", error = %err, "signaling websocket write failed");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if ws_write.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            let reason = loop {
                let Some(msg) = ws_read.next().await else {
                    break None;
                };
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!(target: "liquid_link::signaling", "ignoring non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => break frame.map(|f| f.reason.to_string()),
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(target: "liquid_link::signaling", "signaling websocket error: {err}");
                        break Some(err.to_string());
                    }
                };
                match decode_frame(&text) {
                    Ok(event) => {
                        tracing::trace!(target: "liquid_link::signaling", event = %event.name, "received signaling event");
                        if inbound_tx.send(TransportEvent::Event(event)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target: "liquid_link::signaling", error = %err, "ignoring malformed signaling frame");
                    }
                }
            };
            let _ = inbound_tx.send(TransportEvent::Closed(reason));
        });

        Ok(SignalingLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Rewrites `http(s)` endpoints to `ws(s)`; `ws(s)` URLs pass through.
pub fn websocket_url(url: &Url) -> Result<Url, LinkError> {
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(LinkError::Setup(format!(
                "unsupported signaling url scheme {other:?}"
            )));
        }
    };
    let mut ws = url.clone();
    ws.set_scheme(scheme)
        .map_err(|_| LinkError::Setup("invalid websocket scheme".into()))?;
    ws.set_fragment(None);
    Ok(ws)
}
