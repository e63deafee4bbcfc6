use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

use liquid_link::engine::ChannelState;
use liquid_link::engine::mock::{EngineCall, FailPoint, MockChannel, MockEngine, MockEngineFactory};
use liquid_link::protocol::{SignalEvent, WireEvent};
use liquid_link::signaling::{FailureStage, MemoryRelay, RelayPeer};
use liquid_link::{LinkConfig, LinkError, PeerRole, SignalingSession};

const SERVER: &str = "ws://relay.test/signal";

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

struct Harness {
    relay: MemoryRelay,
    engines: MockEngineFactory,
    session: SignalingSession,
    messages: mpsc::UnboundedReceiver<String>,
    states: mpsc::UnboundedReceiver<ChannelState>,
    message_tx: mpsc::UnboundedSender<String>,
    state_tx: mpsc::UnboundedSender<ChannelState>,
}

impl Harness {
    fn new(config: LinkConfig) -> Self {
        init_tracing();
        let relay = MemoryRelay::new();
        let engines = MockEngineFactory::new();
        let session = SignalingSession::with_transport(
            config,
            Arc::new(relay.connector()),
            Arc::new(engines.clone()),
        );
        let (message_tx, messages) = mpsc::unbounded_channel();
        let (state_tx, states) = mpsc::unbounded_channel();
        Self {
            relay,
            engines,
            session,
            messages,
            states,
            message_tx,
            state_tx,
        }
    }

    fn quiet() -> Self {
        Self::new(
            LinkConfig::builder()
                .signaling_url(SERVER)
                .probe(0, Duration::from_secs(1))
                .build(),
        )
    }

    async fn connect(&self, request_id: &str, role: PeerRole) {
        let message_tx = self.message_tx.clone();
        let state_tx = self.state_tx.clone();
        self.session
            .connect_to_peer(
                request_id,
                role,
                None,
                Vec::new(),
                move |text| {
                    let _ = message_tx.send(text);
                },
                move |state| {
                    let _ = state_tx.send(state);
                },
            )
            .await
            .expect("connect to peer");
    }

    /// Runs the offerer side up to the point where the offer went out.
    async fn offer(&self, request_id: &str) -> (RelayPeer, Arc<MockEngine>, Arc<MockChannel>) {
        self.connect(request_id, PeerRole::Offerer).await;
        let mut peer = self.relay.accept().await.expect("relay connection");
        assert_eq!(peer.next_event().await.unwrap().kind(), Some(SignalEvent::Link));
        let offer = peer.next_event().await.unwrap();
        assert_eq!(offer.kind(), Some(SignalEvent::OfferDescription));

        let engine = self.engines.engine(0).await;
        let channel = engine.channels().into_iter().next().expect("offerer channel");
        (peer, engine, channel)
    }

    async fn next_state(&mut self) -> ChannelState {
        self.states.recv().await.expect("state handler")
    }
}

fn sdp_offer() -> WireEvent {
    WireEvent::signal(
        SignalEvent::OfferDescription,
        &serde_json::json!({"type": "offer", "sdp": "v=0\r\ns=offer\r\n"}),
    )
    .unwrap()
}

fn sdp_answer() -> WireEvent {
    WireEvent::signal(
        SignalEvent::AnswerDescription,
        &serde_json::json!({"type": "answer", "sdp": "v=0\r\ns=answer\r\n"}),
    )
    .unwrap()
}

#[test_timeout::tokio_timeout_test]
async fn queued_messages_flush_in_order_once_the_channel_opens() {
    let mut harness = Harness::quiet();
    harness.session.send_message("one").await.unwrap();
    harness.session.send_message("two").await.unwrap();
    assert_eq!(harness.session.queued_messages(), 2);

    let (peer, _engine, channel) = harness.offer("queue-room").await;
    assert!(peer.push(sdp_answer()));
    harness.session.send_message("three").await.unwrap();
    assert!(channel.sent().is_empty());
    assert!(!harness.session.is_channel_open());

    channel.open();
    assert_eq!(harness.next_state().await, ChannelState::Open);
    assert_eq!(channel.wait_for_sent(3).await, vec!["one", "two", "three"]);
    assert_eq!(harness.session.queued_messages(), 0);
    assert!(harness.session.is_channel_open());
    assert!(harness.session.is_peer_client_initialized());

    harness.session.send_message("four").await.unwrap();
    assert_eq!(channel.sent().last().map(String::as_str), Some("four"));

    channel.receive("hello");
    assert_eq!(harness.messages.recv().await.unwrap(), "hello");
}

#[test_timeout::tokio_timeout_test]
async fn remote_close_reports_state_and_requeues_sends() {
    let mut harness = Harness::quiet();
    let (peer, _engine, channel) = harness.offer("close-room").await;
    assert!(peer.push(sdp_answer()));
    channel.open();
    assert_eq!(harness.next_state().await, ChannelState::Open);

    channel.hang_up();
    assert_eq!(harness.next_state().await, ChannelState::Closed);
    harness.session.send_message("later").await.unwrap();
    assert_eq!(harness.session.queued_messages(), 1);
    assert!(channel.sent().is_empty());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn liveness_probe_sends_configured_count() {
    let mut harness = Harness::new(
        LinkConfig::builder()
            .signaling_url(SERVER)
            .probe(3, Duration::from_secs(1))
            .build(),
    );
    let (_peer, _engine, channel) = harness.offer("probe-room").await;
    channel.open();
    assert_eq!(harness.next_state().await, ChannelState::Open);

    assert_eq!(channel.wait_for_sent(3).await, vec!["ping", "ping", "ping"]);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(channel.sent().len(), 3);
}

#[test_timeout::tokio_timeout_test]
async fn stop_tears_down_and_is_idempotent() {
    let harness = Harness::quiet();
    harness.session.send_message("dropped").await.unwrap();
    let (_peer, engine, _channel) = harness.offer("stop-room").await;
    assert_eq!(harness.session.role(), Some(PeerRole::Offerer));
    assert_eq!(harness.session.request_id().as_deref(), Some("stop-room"));

    harness.session.stop().await;
    assert!(engine.is_closed());
    assert!(engine.calls().contains(&EngineCall::Close));
    assert_eq!(harness.session.queued_messages(), 0);
    assert!(harness.session.client().is_none());
    assert!(harness.session.role().is_none());
    assert!(!harness.session.is_peer_client_initialized());

    harness.session.stop().await;
    let closes = engine
        .calls()
        .iter()
        .filter(|call| **call == EngineCall::Close)
        .count();
    assert_eq!(closes, 1);
}

#[test_timeout::tokio_timeout_test]
async fn reconnecting_replaces_the_previous_attempt() {
    let harness = Harness::quiet();
    let (_peer, first, _channel) = harness.offer("first").await;

    harness.connect("second", PeerRole::Answerer).await;
    assert!(first.is_closed());

    let mut peer = harness.relay.accept().await.unwrap();
    let link = peer.next_event().await.unwrap();
    assert_eq!(link.kind(), Some(SignalEvent::Link));
    assert_eq!(harness.session.role(), Some(PeerRole::Answerer));
    assert_eq!(harness.session.request_id().as_deref(), Some("second"));

    assert!(peer.push(sdp_offer()));
    let answer = peer.next_event().await.unwrap();
    assert_eq!(answer.kind(), Some(SignalEvent::AnswerDescription));

    let second = harness.engines.engine(1).await;
    assert!(!second.is_closed());
    assert!(!second.calls().iter().any(|call| matches!(call, EngineCall::CreateDataChannel(_))));
}

#[test_timeout::tokio_timeout_test]
async fn events_from_a_replaced_attempt_never_reach_the_new_handlers() {
    let mut harness = Harness::quiet();
    let (_old_peer, _old_engine, old_channel) = harness.offer("first").await;

    harness.connect("second", PeerRole::Offerer).await;
    let mut peer = harness.relay.accept().await.unwrap();
    assert_eq!(peer.next_event().await.unwrap().kind(), Some(SignalEvent::Link));
    assert_eq!(
        peer.next_event().await.unwrap().kind(),
        Some(SignalEvent::OfferDescription)
    );
    let engine = harness.engines.engine(1).await;
    let channel = engine.channels().into_iter().next().expect("second channel");

    old_channel.open();
    old_channel.receive("stale");
    harness.session.send_message("fresh").await.unwrap();
    assert_eq!(harness.session.queued_messages(), 1);
    assert!(!harness.session.is_channel_open());
    assert!(old_channel.sent().is_empty());

    channel.open();
    assert_eq!(harness.next_state().await, ChannelState::Open);
    assert_eq!(channel.wait_for_sent(1).await, vec!["fresh"]);
    assert!(old_channel.sent().is_empty());

    channel.receive("current");
    assert_eq!(harness.messages.recv().await.unwrap(), "current");
    assert!(harness.messages.try_recv().is_err());
    assert!(harness.states.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test]
async fn answerer_uses_the_channel_the_offerer_announces() {
    let mut harness = Harness::quiet();
    harness.connect("answer-room", PeerRole::Answerer).await;
    let mut peer = harness.relay.accept().await.unwrap();
    assert_eq!(peer.next_event().await.unwrap().kind(), Some(SignalEvent::Link));
    assert!(peer.push(sdp_offer()));
    assert_eq!(
        peer.next_event().await.unwrap().kind(),
        Some(SignalEvent::AnswerDescription)
    );

    let engine = harness.engines.engine(0).await;
    let stray = engine.deliver_remote_channel("telemetry");
    let channel = engine.deliver_remote_channel("liquid");
    stray.open();
    stray.receive("ignored");
    channel.open();
    assert_eq!(harness.next_state().await, ChannelState::Open);

    channel.receive("from offerer");
    assert_eq!(harness.messages.recv().await.unwrap(), "from offerer");
    harness.session.send_message("from answerer").await.unwrap();
    assert_eq!(channel.sent(), vec!["from answerer"]);
    assert!(stray.sent().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn disconnect_keeps_an_open_peer() {
    let mut harness = Harness::quiet();
    let (mut peer, engine, channel) = harness.offer("keep-room").await;
    assert!(peer.push(sdp_answer()));
    channel.open();
    assert_eq!(harness.next_state().await, ChannelState::Open);

    harness.session.disconnect();
    while peer.next_event().await.is_some() {}
    assert!(!engine.is_closed());

    harness.session.send_message("still here").await.unwrap();
    assert_eq!(channel.sent(), vec!["still here"]);
}

#[test_timeout::tokio_timeout_test]
async fn negotiation_failures_are_broadcast() {
    let harness = Harness::quiet();
    harness.engines.fail_at(FailPoint::CreateOffer);
    let mut failures = harness.session.failures();

    harness.connect("broken", PeerRole::Offerer).await;
    let failure = failures.recv().await.expect("failure");
    assert_eq!(failure.stage, FailureStage::CreateOffer);
    assert!(matches!(failure.error, LinkError::Negotiation(_)));
}

#[test_timeout::tokio_timeout_test]
async fn refused_signaling_is_reported() {
    let harness = Harness::quiet();
    harness.relay.refuse_connections(true);
    let mut failures = harness.session.failures();

    harness.connect("nowhere", PeerRole::Answerer).await;
    let failure = failures.recv().await.expect("failure");
    assert_eq!(failure.stage, FailureStage::Connect);
    assert!(harness.engines.engines().is_empty());
}
