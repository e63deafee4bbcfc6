use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;

use crate::engine::{
    ChannelEvent, ChannelId, ChannelState, DataChannelHandle, EngineEvent, EngineEventSender,
    next_channel_id,
};
use crate::error::{LinkError, to_negotiation_error};

/// Where a bridge reports what its channel does.
#[derive(Clone)]
struct ChannelSink {
    id: ChannelId,
    events: EngineEventSender,
}

impl ChannelSink {
    fn emit(&self, event: ChannelEvent) {
        // The receiver goes away when the owning client shuts down.
        let _ = self.events.send(EngineEvent::Channel { id: self.id, event });
    }
}

/// Adapts one [`RTCDataChannel`] to the text-only [`DataChannelHandle`]
/// surface and forwards its callbacks as [`ChannelEvent`]s.
///
/// Only transitions are reported: a channel starts out `Connecting` without
/// an event, so callers read [`DataChannelHandle::ready_state`] at attach
/// time. `BufferedAmount` follows every successful `send_text`.
pub struct DataChannelBridge {
    sink: ChannelSink,
    channel: Arc<RTCDataChannel>,
    closed: AtomicBool,
}

impl DataChannelBridge {
    pub fn attach(channel: Arc<RTCDataChannel>, events: EngineEventSender) -> Arc<Self> {
        let sink = ChannelSink {
            id: next_channel_id(),
            events,
        };
        let bridge = Arc::new(Self {
            sink: sink.clone(),
            channel: Arc::clone(&channel),
            closed: AtomicBool::new(false),
        });

        let label = channel.label().to_string();
        tracing::trace!(target: "liquid_link::bridge", channel = ?sink.id, %label, "registering data channel handlers");

        let open_sink = sink.clone();
        channel.on_open(Box::new(move || {
            Box::pin(async move {
                tracing::debug!(target: "liquid_link::bridge", channel = ?open_sink.id, "data channel opened");
                open_sink.emit(ChannelEvent::State(ChannelState::Open));
            })
        }));

        let close_sink = sink.clone();
        channel.on_close(Box::new(move || {
            let sink = close_sink.clone();
            Box::pin(async move {
                tracing::debug!(target: "liquid_link::bridge", channel = ?sink.id, "data channel closed");
                sink.emit(ChannelEvent::State(ChannelState::Closed));
            })
        }));

        let error_id = sink.id;
        channel.on_error(Box::new(move |err| {
            Box::pin(async move {
                tracing::warn!(target: "liquid_link::bridge", channel = ?error_id, error = %err, "data channel error");
            })
        }));

        let message_sink = sink;
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = message_sink.clone();
            Box::pin(async move {
                match decode_text(&msg) {
                    Some(text) => sink.emit(ChannelEvent::Message(text)),
                    None => tracing::trace!(
                        target: "liquid_link::bridge",
                        channel = ?sink.id,
                        frame_len = msg.data.len(),
                        is_string = msg.is_string,
                        "dropping non-text message"
                    ),
                }
            })
        }));

        bridge
    }
}

impl fmt::Debug for DataChannelBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannelBridge")
            .field("id", &self.sink.id)
            .field("label", &self.channel.label())
            .field("state", &self.ready_state())
            .finish()
    }
}

#[async_trait]
impl DataChannelHandle for DataChannelBridge {
    fn id(&self) -> ChannelId {
        self.sink.id
    }

    fn label(&self) -> String {
        self.channel.label().to_string()
    }

    fn ready_state(&self) -> ChannelState {
        channel_state(self.channel.ready_state())
    }

    async fn send_text(&self, text: &str) -> Result<(), LinkError> {
        if self.ready_state() != ChannelState::Open {
            return Err(LinkError::ChannelClosed);
        }
        let written = self
            .channel
            .send_text(text.to_string())
            .await
            .map_err(to_negotiation_error)?;
        tracing::trace!(target: "liquid_link::bridge", channel = ?self.sink.id, written, "sent text frame");
        let buffered = self.channel.buffered_amount().await;
        self.sink.emit(ChannelEvent::BufferedAmount(buffered));
        Ok(())
    }

    async fn close(&self) -> Result<(), LinkError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.channel.close().await.map_err(to_negotiation_error)
    }
}

pub(crate) fn channel_state(state: RTCDataChannelState) -> ChannelState {
    match state {
        RTCDataChannelState::Connecting => ChannelState::Connecting,
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed | RTCDataChannelState::Unspecified => ChannelState::Closed,
    }
}

/// Only UTF-8 text frames reach the application.
fn decode_text(msg: &DataChannelMessage) -> Option<String> {
    if !msg.is_string {
        return None;
    }
    String::from_utf8(msg.data.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn text_frames_are_decoded() {
        let msg = DataChannelMessage {
            is_string: true,
            data: Bytes::from_static(b"hello"),
        };
        assert_eq!(decode_text(&msg).as_deref(), Some("hello"));
    }

    #[test]
    fn binary_and_invalid_frames_are_dropped() {
        let binary = DataChannelMessage {
            is_string: false,
            data: Bytes::from_static(b"hello"),
        };
        assert_eq!(decode_text(&binary), None);

        let invalid = DataChannelMessage {
            is_string: true,
            data: Bytes::from_static(&[0xff, 0xfe, 0x00]),
        };
        assert_eq!(decode_text(&invalid), None);
    }

    #[test]
    fn unspecified_state_reads_as_closed() {
        assert_eq!(
            channel_state(RTCDataChannelState::Unspecified),
            ChannelState::Closed
        );
        assert_eq!(channel_state(RTCDataChannelState::Open), ChannelState::Open);
        assert_eq!(
            channel_state(RTCDataChannelState::Closing),
            ChannelState::Closing
        );
    }
}
