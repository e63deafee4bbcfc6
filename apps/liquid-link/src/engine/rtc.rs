use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::engine::bridge::DataChannelBridge;
use crate::engine::{
    DataChannelHandle, EngineEvent, EngineEventSender, EngineFactory, EngineSettings,
    IceCandidate, NegotiationState, Negotiator, PeerConnectionState, SdpDescription, SdpKind,
    check_remote_description,
};
use crate::error::{LinkError, to_negotiation_error, to_setup_error};
use crate::protocol::PeerRole;

fn build_api(setting: SettingEngine) -> Result<API, LinkError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Builds [`NegotiationEngine`]s backed by a real `RTCPeerConnection`.
#[derive(Debug, Clone, Default)]
pub struct RtcEngineFactory;

#[async_trait]
impl EngineFactory for RtcEngineFactory {
    async fn create_connection(
        &self,
        settings: EngineSettings,
        events: EngineEventSender,
    ) -> Result<Arc<dyn Negotiator>, LinkError> {
        let engine = NegotiationEngine::connect(settings, events).await?;
        Ok(engine as Arc<dyn Negotiator>)
    }
}

/// Wraps one peer connection and the data channels opened on it.
pub struct NegotiationEngine {
    role: PeerRole,
    pc: Arc<RTCPeerConnection>,
    events: EngineEventSender,
    channels: Arc<Mutex<Vec<Arc<DataChannelBridge>>>>,
    closed: AtomicBool,
}

impl NegotiationEngine {
    pub async fn connect(
        settings: EngineSettings,
        events: EngineEventSender,
    ) -> Result<Arc<Self>, LinkError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        setting.set_include_loopback_candidate(settings.include_loopback);
        let api = build_api(setting)?;

        let config = RTCConfiguration {
            ice_servers: settings.ice_servers.iter().map(|s| s.to_rtc()).collect(),
            ice_candidate_pool_size: settings.candidate_pool_size,
            ..Default::default()
        };

        tracing::trace!(
            target: "liquid_link::engine",
            role = %settings.role,
            step = "api.new_peer_connection",
            state = "start"
        );
        let pc_result = api.new_peer_connection(config).await;
        tracing::trace!(
            target: "liquid_link::engine",
            role = %settings.role,
            step = "api.new_peer_connection",
            state = "end",
            ok = pc_result.is_ok()
        );
        let pc = Arc::new(pc_result.map_err(to_setup_error)?);

        let engine = Arc::new(Self {
            role: settings.role,
            pc,
            events,
            channels: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
        });
        engine.register_handlers();
        Ok(engine)
    }

    fn register_handlers(&self) {
        let role = self.role;

        let candidate_events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = candidate_events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        tracing::trace!(target: "liquid_link::engine", %role, "ice gathering complete");
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(EngineEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }));
                        }
                        Err(err) => tracing::warn!(
                            target: "liquid_link::engine",
                            %role,
                            error = %err,
                            "failed to serialize local candidate"
                        ),
                    }
                })
            }));

        let state_events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = state_events.clone();
                Box::pin(async move {
                    tracing::debug!(target: "liquid_link::engine", %role, ?state, "peer connection state changed");
                    let _ = events.send(EngineEvent::ConnectionState(peer_state(state)));
                })
            }));

        let signaling_events = self.events.clone();
        self.pc
            .on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
                let events = signaling_events.clone();
                Box::pin(async move {
                    tracing::trace!(target: "liquid_link::engine", %role, ?state, "signaling state changed");
                    let _ = events.send(EngineEvent::SignalingState(negotiation_state(state)));
                })
            }));

        let channel_events = self.events.clone();
        let channels = Arc::clone(&self.channels);
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = channel_events.clone();
                let channels = Arc::clone(&channels);
                Box::pin(async move {
                    tracing::debug!(
                        target: "liquid_link::engine",
                        %role,
                        label = dc.label(),
                        "remote data channel announced"
                    );
                    let bridge = DataChannelBridge::attach(dc, events.clone());
                    channels.lock().push(Arc::clone(&bridge));
                    let _ = events.send(EngineEvent::RemoteChannel(bridge));
                })
            }));
    }
}

#[async_trait]
impl Negotiator for NegotiationEngine {
    fn role(&self) -> PeerRole {
        self.role
    }

    fn signaling_state(&self) -> NegotiationState {
        if self.closed.load(Ordering::SeqCst) {
            return NegotiationState::Closed;
        }
        negotiation_state(self.pc.signaling_state())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn create_offer(&self) -> Result<SdpDescription, LinkError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(SdpDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SdpDescription, LinkError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(SdpDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SdpDescription) -> Result<(), LinkError> {
        let kind = description.kind;
        let rtc = to_rtc_description(description)?;
        self.pc
            .set_local_description(rtc)
            .await
            .map_err(to_negotiation_error)?;
        tracing::debug!(target: "liquid_link::engine", role = %self.role, %kind, "local description applied");
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SdpDescription,
    ) -> Result<(), LinkError> {
        let kind = description.kind;
        let state = self.signaling_state();
        if let Err(err) = check_remote_description(state, kind) {
            tracing::warn!(
                target: "liquid_link::engine",
                role = %self.role,
                %kind,
                %state,
                "ignoring remote description that collides with local negotiation"
            );
            return Err(err);
        }
        let rtc = to_rtc_description(description)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(to_negotiation_error)?;
        tracing::debug!(target: "liquid_link::engine", role = %self.role, %kind, "remote description applied");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        if !self.has_remote_description().await {
            return Err(LinkError::Negotiation(
                "remote description not set; candidate must be buffered".into(),
            ));
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_negotiation_error)
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannelHandle>, LinkError> {
        if self.role != PeerRole::Offerer {
            return Err(LinkError::InvalidRole(self.role));
        }
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_negotiation_error)?;
        let bridge = DataChannelBridge::attach(dc, self.events.clone());
        self.channels.lock().push(Arc::clone(&bridge));
        Ok(bridge as Arc<dyn DataChannelHandle>)
    }

    async fn close(&self) -> Result<(), LinkError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let channels: Vec<_> = self.channels.lock().drain(..).collect();
        for channel in channels {
            if let Err(err) = channel.close().await {
                tracing::debug!(target: "liquid_link::engine", error = %err, "data channel close failed");
            }
        }
        self.pc.close().await.map_err(to_negotiation_error)
    }
}

fn to_rtc_description(description: SdpDescription) -> Result<RTCSessionDescription, LinkError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::ProvisionalAnswer => RTCSessionDescription::pranswer(description.sdp),
        SdpKind::Rollback => {
            return Ok(serde_json::from_value(serde_json::json!({
                "type": "rollback",
                "sdp": description.sdp,
            }))?);
        }
    }
    .map_err(to_negotiation_error)
}

fn negotiation_state(state: RTCSignalingState) -> NegotiationState {
    match state {
        RTCSignalingState::Unspecified | RTCSignalingState::Stable => NegotiationState::Stable,
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
            NegotiationState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
            NegotiationState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => NegotiationState::Closed,
    }
}

fn peer_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ChannelEvent, ChannelState};
    use tokio::sync::mpsc;

    fn settings(role: PeerRole) -> EngineSettings {
        EngineSettings {
            role,
            ice_servers: Vec::new(),
            candidate_pool_size: 0,
            include_loopback: true,
        }
    }

    async fn engine(role: PeerRole) -> Arc<NegotiationEngine> {
        let (tx, _rx) = mpsc::unbounded_channel();
        NegotiationEngine::connect(settings(role), tx)
            .await
            .expect("peer connection")
    }

    async fn local_offer(engine: &NegotiationEngine) -> SdpDescription {
        engine.create_data_channel("liquid").await.expect("channel");
        let offer = engine.create_offer().await.expect("offer");
        engine
            .set_local_description(offer.clone())
            .await
            .expect("local offer");
        offer
    }

    #[test]
    fn pranswer_states_fold_into_offer_states() {
        assert_eq!(
            negotiation_state(RTCSignalingState::HaveLocalPranswer),
            NegotiationState::HaveRemoteOffer
        );
        assert_eq!(
            negotiation_state(RTCSignalingState::HaveRemotePranswer),
            NegotiationState::HaveLocalOffer
        );
        assert_eq!(
            negotiation_state(RTCSignalingState::Unspecified),
            NegotiationState::Stable
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn local_offer_moves_to_have_local_offer() {
        let offerer = engine(PeerRole::Offerer).await;
        assert_eq!(offerer.signaling_state(), NegotiationState::Stable);
        local_offer(&offerer).await;
        assert_eq!(offerer.signaling_state(), NegotiationState::HaveLocalOffer);
        offerer.close().await.unwrap();
    }

    #[test_timeout::tokio_timeout_test]
    async fn remote_offer_is_refused_during_local_offer() {
        let first = engine(PeerRole::Offerer).await;
        let second = engine(PeerRole::Offerer).await;
        local_offer(&first).await;
        let competing = local_offer(&second).await;

        let err = first.set_remote_description(competing).await.unwrap_err();
        assert!(matches!(err, LinkError::Glare { .. }));
        assert_eq!(first.signaling_state(), NegotiationState::HaveLocalOffer);

        first.close().await.unwrap();
        second.close().await.unwrap();
    }

    #[test_timeout::tokio_timeout_test]
    async fn answerer_cannot_open_channels() {
        let answerer = engine(PeerRole::Answerer).await;
        let err = answerer.create_data_channel("liquid").await.unwrap_err();
        assert_eq!(err, LinkError::InvalidRole(PeerRole::Answerer));
        answerer.close().await.unwrap();
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidate_before_remote_description_is_rejected() {
        let answerer = engine(PeerRole::Answerer).await;
        let candidate = IceCandidate::new("candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host");
        assert!(answerer.add_ice_candidate(candidate).await.is_err());
        answerer.close().await.unwrap();
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_is_idempotent() {
        let offerer = engine(PeerRole::Offerer).await;
        offerer.create_data_channel("liquid").await.unwrap();
        offerer.close().await.unwrap();
        offerer.close().await.unwrap();
        assert_eq!(offerer.signaling_state(), NegotiationState::Closed);
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_answer_exchange_returns_both_sides_to_stable() {
        let offerer = engine(PeerRole::Offerer).await;
        let answerer = engine(PeerRole::Answerer).await;

        let offer = local_offer(&offerer).await;
        answerer.set_remote_description(offer).await.unwrap();
        assert_eq!(answerer.signaling_state(), NegotiationState::HaveRemoteOffer);
        assert!(answerer.has_remote_description().await);

        let answer = answerer.create_answer().await.unwrap();
        answerer
            .set_local_description(answer.clone())
            .await
            .unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        assert_eq!(offerer.signaling_state(), NegotiationState::Stable);
        assert_eq!(answerer.signaling_state(), NegotiationState::Stable);

        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
    }

    #[test_timeout::tokio_timeout_test(secs = 30)]
    async fn sending_reports_the_buffered_amount() {
        let (offerer_tx, mut offerer_rx) = mpsc::unbounded_channel();
        let (answerer_tx, mut answerer_rx) = mpsc::unbounded_channel();
        let offerer = NegotiationEngine::connect(settings(PeerRole::Offerer), offerer_tx)
            .await
            .unwrap();
        let answerer = NegotiationEngine::connect(settings(PeerRole::Answerer), answerer_tx)
            .await
            .unwrap();

        let channel = offerer.create_data_channel("liquid").await.unwrap();
        assert_eq!(channel.ready_state(), ChannelState::Connecting);
        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        loop {
            tokio::select! {
                Some(event) = offerer_rx.recv() => match event {
                    EngineEvent::LocalCandidate(candidate) => {
                        let _ = answerer.add_ice_candidate(candidate).await;
                    }
                    EngineEvent::Channel { id, event: ChannelEvent::State(ChannelState::Open) }
                        if id == channel.id() => break,
                    _ => {}
                },
                Some(event) = answerer_rx.recv() => {
                    if let EngineEvent::LocalCandidate(candidate) = event {
                        let _ = offerer.add_ice_candidate(candidate).await;
                    }
                }
            }
        }

        channel.send_text("hello").await.unwrap();
        loop {
            match offerer_rx.recv().await.expect("offerer events") {
                EngineEvent::Channel { id, event: ChannelEvent::BufferedAmount(_) }
                    if id == channel.id() => break,
                _ => {}
            }
        }

        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
    }
}
