//! In-process signaling server. Connections join rooms by the `requestId` of
//! their `link` event and every other event is forwarded to the rest of the
//! room. Each connection is also exposed as a [`RelayPeer`] so tests can
//! watch what a client sent and inject events of their own.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use url::Url;

use crate::error::LinkError;
use crate::protocol::{EventPayload, LinkPayload, SignalEvent, WireEvent};
use crate::signaling::{SignalingConnector, SignalingLink, TransportEvent};

struct PeerSlot {
    to_client: mpsc::UnboundedSender<TransportEvent>,
    room: Option<String>,
}

struct RelayInner {
    refuse: AtomicBool,
    next_id: AtomicU64,
    peers: Mutex<HashMap<u64, PeerSlot>>,
    accepted_tx: mpsc::UnboundedSender<RelayPeer>,
    accepted_rx: AsyncMutex<mpsc::UnboundedReceiver<RelayPeer>>,
}

#[derive(Clone)]
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(RelayInner {
                refuse: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                peers: Mutex::new(HashMap::new()),
                accepted_tx,
                accepted_rx: AsyncMutex::new(accepted_rx),
            }),
        }
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            relay: self.clone(),
        }
    }

    /// While set, new connections fail as an unreachable server would.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Next connection made through this relay, in connect order.
    pub async fn accept(&self) -> Option<RelayPeer> {
        self.inner.accepted_rx.lock().await.recv().await
    }

    pub fn connection_count(&self) -> usize {
        self.inner.peers.lock().len()
    }

    fn open(&self) -> Result<SignalingLink, LinkError> {
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(LinkError::Signaling("connection refused".into()));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireEvent>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let (observed_tx, observed_rx) = mpsc::unbounded_channel::<WireEvent>();

        self.inner.peers.lock().insert(
            id,
            PeerSlot {
                to_client: inbound_tx,
                room: None,
            },
        );

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                let _ = observed_tx.send(event.clone());
                relay.route(id, event);
            }
            tracing::trace!(target: "liquid_link::relay", peer = id, "relay connection closed by client");
            relay.inner.peers.lock().remove(&id);
        });

        let peer = RelayPeer {
            id,
            events: observed_rx,
            relay: self.clone(),
        };
        let _ = self.inner.accepted_tx.send(peer);

        Ok(SignalingLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    fn route(&self, from: u64, event: WireEvent) {
        let mut peers = self.inner.peers.lock();
        if event.kind() == Some(SignalEvent::Link) {
            let request_id = match event.payload.decode::<LinkPayload>() {
                Ok(link) => link.request_id,
                Err(err) => {
                    tracing::warn!(target: "liquid_link::relay", peer = from, error = %err, "ignoring malformed link");
                    return;
                }
            };
            if let Some(slot) = peers.get_mut(&from) {
                slot.room = Some(request_id.clone());
                let body = serde_json::json!({ "requestId": request_id });
                let _ = slot.to_client.send(TransportEvent::Event(WireEvent::new(
                    SignalEvent::LinkResponse.as_str(),
                    EventPayload::Json(body),
                )));
            }
            return;
        }

        let Some(room) = peers.get(&from).and_then(|slot| slot.room.clone()) else {
            tracing::trace!(target: "liquid_link::relay", peer = from, event = %event.name, "dropping event from unlinked peer");
            return;
        };
        for (id, slot) in peers.iter() {
            if *id != from && slot.room.as_deref() == Some(room.as_str()) {
                let _ = slot.to_client.send(TransportEvent::Event(event.clone()));
            }
        }
    }
}

/// Test-side view of one relay connection.
pub struct RelayPeer {
    id: u64,
    events: mpsc::UnboundedReceiver<WireEvent>,
    relay: MemoryRelay,
}

impl RelayPeer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event the client sent, or `None` once it disconnected.
    pub async fn next_event(&mut self) -> Option<WireEvent> {
        self.events.recv().await
    }

    /// Events the client has sent so far that were not yet read.
    pub fn try_events(&mut self) -> Vec<WireEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Delivers an event to the client as if the server sent it.
    pub fn push(&self, event: WireEvent) -> bool {
        match self.relay.inner.peers.lock().get(&self.id) {
            Some(slot) => slot.to_client.send(TransportEvent::Event(event)).is_ok(),
            None => false,
        }
    }

    /// Server-side close.
    pub fn hang_up(&self, reason: &str) {
        if let Some(slot) = self.relay.inner.peers.lock().remove(&self.id) {
            let _ = slot
                .to_client
                .send(TransportEvent::Closed(Some(reason.to_string())));
        }
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    relay: MemoryRelay,
}

#[async_trait]
impl SignalingConnector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<SignalingLink, LinkError> {
        tracing::trace!(target: "liquid_link::relay", %url, "memory connect");
        self.relay.open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn link(request_id: &str) -> WireEvent {
        WireEvent::signal(
            SignalEvent::Link,
            &LinkPayload {
                request_id: request_id.into(),
            },
        )
        .unwrap()
    }

    async fn next_inbound(link: &mut SignalingLink) -> TransportEvent {
        link.inbound.recv().await.expect("inbound event")
    }

    #[test_timeout::tokio_timeout_test]
    async fn linked_peers_share_events() {
        let relay = MemoryRelay::new();
        let url = Url::parse("ws://relay.test/").unwrap();
        let connector = relay.connector();
        let mut a = connector.connect(&url).await.unwrap();
        let mut b = connector.connect(&url).await.unwrap();

        a.outbound.send(link("room-1")).unwrap();
        b.outbound.send(link("room-1")).unwrap();
        assert!(matches!(next_inbound(&mut a).await, TransportEvent::Event(e) if e.name == "link-response"));
        assert!(matches!(next_inbound(&mut b).await, TransportEvent::Event(e) if e.name == "link-response"));

        let offer = WireEvent::new("offer-description", EventPayload::Json(json!({"sdp": "v=0"})));
        a.outbound.send(offer.clone()).unwrap();
        assert_eq!(next_inbound(&mut b).await, TransportEvent::Event(offer));
    }

    #[test_timeout::tokio_timeout_test]
    async fn other_rooms_do_not_see_events() {
        let relay = MemoryRelay::new();
        let url = Url::parse("ws://relay.test/").unwrap();
        let connector = relay.connector();
        let mut a = connector.connect(&url).await.unwrap();
        let mut b = connector.connect(&url).await.unwrap();
        let mut c = connector.connect(&url).await.unwrap();

        a.outbound.send(link("room-1")).unwrap();
        b.outbound.send(link("room-2")).unwrap();
        c.outbound.send(link("room-1")).unwrap();
        for side in [&mut a, &mut b, &mut c] {
            assert!(matches!(next_inbound(side).await, TransportEvent::Event(e) if e.name == "link-response"));
        }

        let error = WireEvent::new("error", EventPayload::Raw("x".into()));
        a.outbound.send(error.clone()).unwrap();
        assert_eq!(next_inbound(&mut c).await, TransportEvent::Event(error));
        assert!(b.inbound.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn relay_peer_sees_client_events_and_can_hang_up() {
        let relay = MemoryRelay::new();
        let url = Url::parse("ws://relay.test/").unwrap();
        let mut link_a = relay.connector().connect(&url).await.unwrap();
        let mut peer = relay.accept().await.unwrap();

        link_a.outbound.send(link("abc123")).unwrap();
        let seen = peer.next_event().await.unwrap();
        assert_eq!(seen.kind(), Some(SignalEvent::Link));

        assert!(matches!(next_inbound(&mut link_a).await, TransportEvent::Event(e) if e.name == "link-response"));
        assert!(peer.push(WireEvent::new("error", EventPayload::Raw("boom".into()))));
        assert!(matches!(next_inbound(&mut link_a).await, TransportEvent::Event(e) if e.name == "error"));

        peer.hang_up("bye");
        assert_eq!(
            next_inbound(&mut link_a).await,
            TransportEvent::Closed(Some("bye".into()))
        );
        assert!(!peer.push(WireEvent::new("error", EventPayload::Raw("late".into()))));
    }

    #[test_timeout::tokio_timeout_test]
    async fn refused_connections_fail() {
        let relay = MemoryRelay::new();
        relay.refuse_connections(true);
        let url = Url::parse("ws://relay.test/").unwrap();
        assert!(matches!(
            relay.connector().connect(&url).await,
            Err(LinkError::Signaling(_))
        ));
    }
}
