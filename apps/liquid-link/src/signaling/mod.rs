use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::error::LinkError;
use crate::protocol::WireEvent;

mod client;
pub mod memory;
pub mod websocket;

pub use client::{
    ClientEvent, ClientOptions, ConnectionStatus, FailureStage, NegotiationFailure,
    NegotiationPhase, NegotiationRequest, SignalingChannelClient,
};
pub use memory::{MemoryConnector, MemoryRelay, RelayPeer};
pub use websocket::WebSocketConnector;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Event(WireEvent),
    /// The link is gone; carries the reason when the far side gave one.
    Closed(Option<String>),
}

/// A connected signaling link. Dropping `outbound` closes it.
#[derive(Debug)]
pub struct SignalingLink {
    pub outbound: mpsc::UnboundedSender<WireEvent>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<SignalingLink, LinkError>;
}
