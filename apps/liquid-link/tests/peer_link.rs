use std::sync::Arc;

use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

use liquid_link::engine::{ChannelState, RtcEngineFactory};
use liquid_link::protocol::SignalEvent;
use liquid_link::signaling::MemoryRelay;
use liquid_link::{LinkConfig, PeerRole, SignalingSession};

struct Side {
    session: SignalingSession,
    messages: mpsc::UnboundedReceiver<String>,
    states: mpsc::UnboundedReceiver<ChannelState>,
}

impl Side {
    async fn connect(relay: &MemoryRelay, request_id: &str, role: PeerRole) -> Self {
        let config = LinkConfig {
            signaling_url: Some("ws://relay.test/".into()),
            probe_count: 0,
            ..LinkConfig::localhost()
        };
        let session = SignalingSession::with_transport(
            config,
            Arc::new(relay.connector()),
            Arc::new(RtcEngineFactory),
        );
        let (message_tx, messages) = mpsc::unbounded_channel();
        let (state_tx, states) = mpsc::unbounded_channel();
        session
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
        Self {
            session,
            messages,
            states,
        }
    }

    async fn wait_open(&mut self) {
        while let Some(state) = self.states.recv().await {
            if state == ChannelState::Open {
                return;
            }
        }
        panic!("state handler dropped before the channel opened");
    }
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn two_sessions_exchange_messages_over_loopback() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let relay = MemoryRelay::new();
    let mut answerer = Side::connect(&relay, "loopback-room", PeerRole::Answerer).await;
    let mut answerer_conn = relay.accept().await.expect("answerer connection");
    assert_eq!(
        answerer_conn.next_event().await.unwrap().kind(),
        Some(SignalEvent::Link)
    );

    let mut offerer = Side::connect(&relay, "loopback-room", PeerRole::Offerer).await;
    offerer.session.send_message("queued before open").await.unwrap();

    offerer.wait_open().await;
    answerer.wait_open().await;
    assert!(offerer.session.is_peer_client_initialized());
    assert!(answerer.session.is_peer_client_initialized());

    assert_eq!(answerer.messages.recv().await.unwrap(), "queued before open");
    answerer.session.send_message("hello offerer").await.unwrap();
    assert_eq!(offerer.messages.recv().await.unwrap(), "hello offerer");

    offerer.session.disconnect();
    offerer.session.send_message("after signaling").await.unwrap();
    assert_eq!(answerer.messages.recv().await.unwrap(), "after signaling");

    offerer.session.stop().await;
    answerer.session.stop().await;
}
