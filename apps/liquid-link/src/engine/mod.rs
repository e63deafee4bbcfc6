use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::error::LinkError;
use crate::protocol::PeerRole;

pub mod bridge;
pub mod mock;
pub mod rtc;
mod state;

pub use bridge::DataChannelBridge;
pub use rtc::{NegotiationEngine, RtcEngineFactory};
pub use state::{NegotiationState, check_local_description, check_remote_description};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdpKind {
    Offer,
    Answer,
    ProvisionalAnswer,
    Rollback,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
            SdpKind::ProvisionalAnswer => "pranswer",
            SdpKind::Rollback => "rollback",
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SdpKind {
    type Err = LinkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "offer" => Ok(SdpKind::Offer),
            "answer" => Ok(SdpKind::Answer),
            "pranswer" | "provisional-answer" => Ok(SdpKind::ProvisionalAnswer),
            "rollback" => Ok(SdpKind::Rollback),
            other => Err(LinkError::Payload(format!("unsupported sdp type {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SdpDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Token naming one data channel. Holders never own the channel through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_channel_id() -> ChannelId {
    ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message(String),
    State(ChannelState),
    BufferedAmount(usize),
}

#[derive(Debug)]
pub enum EngineEvent {
    LocalCandidate(IceCandidate),
    RemoteChannel(Arc<dyn DataChannelHandle>),
    Channel { id: ChannelId, event: ChannelEvent },
    ConnectionState(PeerConnectionState),
    SignalingState(NegotiationState),
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// Per-connection inputs to [`EngineFactory::create_connection`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub role: PeerRole,
    pub ice_servers: Vec<IceServer>,
    pub candidate_pool_size: u8,
    pub include_loopback: bool,
}

#[async_trait]
pub trait DataChannelHandle: Send + Sync + fmt::Debug {
    fn id(&self) -> ChannelId;
    fn label(&self) -> String;
    fn ready_state(&self) -> ChannelState;
    async fn send_text(&self, text: &str) -> Result<(), LinkError>;
    async fn close(&self) -> Result<(), LinkError>;
}

/// One peer connection. Implementations serialize their own callbacks and
/// report them as [`EngineEvent`]s on the sender they were built with.
#[async_trait]
pub trait Negotiator: Send + Sync {
    fn role(&self) -> PeerRole;
    fn signaling_state(&self) -> NegotiationState;
    async fn has_remote_description(&self) -> bool;
    async fn create_offer(&self) -> Result<SdpDescription, LinkError>;
    async fn create_answer(&self) -> Result<SdpDescription, LinkError>;
    async fn set_local_description(&self, description: SdpDescription) -> Result<(), LinkError>;
    async fn set_remote_description(&self, description: SdpDescription)
    -> Result<(), LinkError>;
    /// Fails when no remote description has been applied yet; buffering is
    /// the caller's job.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannelHandle>, LinkError>;
    /// Closes the data channels, then the connection. Safe to call twice.
    async fn close(&self) -> Result<(), LinkError>;
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create_connection(
        &self,
        settings: EngineSettings,
        events: EngineEventSender,
    ) -> Result<Arc<dyn Negotiator>, LinkError>;
}
