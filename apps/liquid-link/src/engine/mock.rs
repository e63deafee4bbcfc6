//! In-process stand-ins for the peer connection, used by tests to drive the
//! negotiation flows without touching the network.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::engine::{
    ChannelEvent, ChannelId, ChannelState, DataChannelHandle, EngineEvent, EngineEventSender,
    EngineFactory, EngineSettings, IceCandidate, NegotiationState, Negotiator, SdpDescription,
    SdpKind, next_channel_id,
};
use crate::error::LinkError;
use crate::protocol::PeerRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateConnection,
    CreateDataChannel,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    CreateDataChannel(String),
    Close,
}

#[derive(Default)]
struct FactoryInner {
    failures: Mutex<HashSet<FailPoint>>,
    engines: Mutex<Vec<Arc<MockEngine>>>,
    settings: Mutex<Vec<EngineSettings>>,
    created: Notify,
}

/// Hands out [`MockEngine`]s and keeps every one it built.
#[derive(Clone, Default)]
pub struct MockEngineFactory {
    inner: Arc<FactoryInner>,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the given operation fail on every engine, including ones
    /// already created.
    pub fn fail_at(&self, point: FailPoint) {
        self.inner.failures.lock().insert(point);
    }

    pub fn clear_failures(&self) {
        self.inner.failures.lock().clear();
    }

    pub fn engines(&self) -> Vec<Arc<MockEngine>> {
        self.inner.engines.lock().clone()
    }

    pub fn settings(&self) -> Vec<EngineSettings> {
        self.inner.settings.lock().clone()
    }

    /// Waits until the `index`-th engine (zero based) has been created.
    pub async fn engine(&self, index: usize) -> Arc<MockEngine> {
        loop {
            let notified = self.inner.created.notified();
            if let Some(engine) = self.inner.engines.lock().get(index).cloned() {
                return engine;
            }
            notified.await;
        }
    }

    fn failing(&self, point: FailPoint) -> bool {
        self.inner.failures.lock().contains(&point)
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create_connection(
        &self,
        settings: EngineSettings,
        events: EngineEventSender,
    ) -> Result<Arc<dyn Negotiator>, LinkError> {
        self.inner.settings.lock().push(settings.clone());
        if self.failing(FailPoint::CreateConnection) {
            return Err(LinkError::Setup("mock connection refused".into()));
        }
        let engine = Arc::new(MockEngine {
            role: settings.role,
            events,
            factory: self.clone(),
            state: Mutex::new(MockState {
                signaling: NegotiationState::Stable,
                remote_applied: false,
                calls: Vec::new(),
                channels: Vec::new(),
                closed: false,
            }),
            changed: Notify::new(),
            offers: AtomicUsize::new(0),
        });
        self.inner.engines.lock().push(Arc::clone(&engine));
        self.inner.created.notify_waiters();
        Ok(engine as Arc<dyn Negotiator>)
    }
}

struct MockState {
    signaling: NegotiationState,
    remote_applied: bool,
    calls: Vec<EngineCall>,
    channels: Vec<Arc<MockChannel>>,
    closed: bool,
}

/// Records every call and walks the signaling state table.
pub struct MockEngine {
    role: PeerRole,
    events: EngineEventSender,
    factory: MockEngineFactory,
    state: Mutex<MockState>,
    changed: Notify,
    offers: AtomicUsize,
}

impl MockEngine {
    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.state.lock().channels.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Waits until the recorded calls satisfy `check`.
    pub async fn wait_for<F>(&self, check: F) -> Vec<EngineCall>
    where
        F: Fn(&[EngineCall]) -> bool,
    {
        loop {
            let notified = self.changed.notified();
            let calls = self.calls();
            if check(&calls) {
                return calls;
            }
            notified.await;
        }
    }

    pub async fn wait_for_call(&self, call: EngineCall) -> Vec<EngineCall> {
        self.wait_for(|calls| calls.contains(&call)).await
    }

    /// Reports a locally gathered candidate as the real engine would.
    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(EngineEvent::LocalCandidate(candidate));
    }

    /// Simulates the remote side announcing a data channel.
    pub fn deliver_remote_channel(&self, label: &str) -> Arc<MockChannel> {
        let channel = MockChannel::new(label, self.events.clone());
        self.state.lock().channels.push(Arc::clone(&channel));
        let handle: Arc<dyn DataChannelHandle> = channel.clone();
        let _ = self.events.send(EngineEvent::RemoteChannel(handle));
        channel
    }

    fn record(&self, call: EngineCall) {
        self.state.lock().calls.push(call);
        self.changed.notify_waiters();
    }

    fn check(&self, point: FailPoint) -> Result<(), LinkError> {
        if self.factory.failing(point) {
            return Err(LinkError::Negotiation(format!("mock failure at {point:?}")));
        }
        Ok(())
    }

    fn publish_state(&self, state: NegotiationState) {
        let _ = self.events.send(EngineEvent::SignalingState(state));
    }
}

impl fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockEngine")
            .field("role", &self.role)
            .field("signaling", &state.signaling)
            .field("calls", &state.calls)
            .finish()
    }
}

#[async_trait]
impl Negotiator for MockEngine {
    fn role(&self) -> PeerRole {
        self.role
    }

    fn signaling_state(&self) -> NegotiationState {
        self.state.lock().signaling
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote_applied
    }

    async fn create_offer(&self) -> Result<SdpDescription, LinkError> {
        self.record(EngineCall::CreateOffer);
        self.check(FailPoint::CreateOffer)?;
        let version = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SdpDescription::offer(format!(
            "v=0\r\no=- {version} 1 IN IP4 127.0.0.1\r\ns=mock\r\n"
        )))
    }

    async fn create_answer(&self) -> Result<SdpDescription, LinkError> {
        self.record(EngineCall::CreateAnswer);
        self.check(FailPoint::CreateAnswer)?;
        if self.signaling_state() != NegotiationState::HaveRemoteOffer {
            return Err(LinkError::Negotiation("no remote offer to answer".into()));
        }
        Ok(SdpDescription::answer(
            "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=mock-answer\r\n",
        ))
    }

    async fn set_local_description(&self, description: SdpDescription) -> Result<(), LinkError> {
        self.record(EngineCall::SetLocal(description.kind));
        self.check(FailPoint::SetLocalDescription)?;
        let next = {
            let mut state = self.state.lock();
            let next = state.signaling.after_local(description.kind)?;
            state.signaling = next;
            next
        };
        self.publish_state(next);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SdpDescription,
    ) -> Result<(), LinkError> {
        self.record(EngineCall::SetRemote(description.kind));
        self.check(FailPoint::SetRemoteDescription)?;
        let next = {
            let mut state = self.state.lock();
            let next = state.signaling.after_remote(description.kind)?;
            state.signaling = next;
            state.remote_applied = description.kind != SdpKind::Rollback;
            next
        };
        self.publish_state(next);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        if !self.state.lock().remote_applied {
            return Err(LinkError::Negotiation("remote description not set".into()));
        }
        self.record(EngineCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannelHandle>, LinkError> {
        self.record(EngineCall::CreateDataChannel(label.to_string()));
        if self.role != PeerRole::Offerer {
            return Err(LinkError::InvalidRole(self.role));
        }
        self.check(FailPoint::CreateDataChannel)?;
        let channel = MockChannel::new(label, self.events.clone());
        self.state.lock().channels.push(Arc::clone(&channel));
        Ok(channel as Arc<dyn DataChannelHandle>)
    }

    async fn close(&self) -> Result<(), LinkError> {
        let channels = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.signaling = NegotiationState::Closed;
            state.channels.clone()
        };
        for channel in channels {
            channel.close().await?;
        }
        self.record(EngineCall::Close);
        self.publish_state(NegotiationState::Closed);
        Ok(())
    }
}

/// A data channel whose far end is the test itself.
pub struct MockChannel {
    id: ChannelId,
    label: String,
    events: EngineEventSender,
    state: Mutex<ChannelState>,
    sent: Mutex<Vec<String>>,
    sent_changed: Notify,
}

impl MockChannel {
    fn new(label: &str, events: EngineEventSender) -> Arc<Self> {
        Arc::new(Self {
            id: next_channel_id(),
            label: label.to_string(),
            events,
            state: Mutex::new(ChannelState::Connecting),
            sent: Mutex::new(Vec::new()),
            sent_changed: Notify::new(),
        })
    }

    pub fn open(&self) {
        self.transition(ChannelState::Open);
    }

    /// The remote end closed the channel.
    pub fn hang_up(&self) {
        self.transition(ChannelState::Closed);
    }

    pub fn receive(&self, text: &str) {
        self.emit(ChannelEvent::Message(text.to_string()));
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Waits until at least `count` messages have been sent.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<String> {
        loop {
            let notified = self.sent_changed.notified();
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            notified.await;
        }
    }

    fn transition(&self, next: ChannelState) {
        *self.state.lock() = next;
        self.emit(ChannelEvent::State(next));
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(EngineEvent::Channel { id: self.id, event });
    }
}

impl fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockChannel")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[async_trait]
impl DataChannelHandle for MockChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn send_text(&self, text: &str) -> Result<(), LinkError> {
        if self.ready_state() != ChannelState::Open {
            return Err(LinkError::ChannelClosed);
        }
        self.sent.lock().push(text.to_string());
        self.sent_changed.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), LinkError> {
        if self.ready_state() == ChannelState::Closed {
            return Ok(());
        }
        self.transition(ChannelState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn settings(role: PeerRole) -> EngineSettings {
        EngineSettings {
            role,
            ice_servers: Vec::new(),
            candidate_pool_size: 0,
            include_loopback: false,
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn mock_engine_enforces_glare_guard() {
        let factory = MockEngineFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = factory
            .create_connection(settings(PeerRole::Offerer), tx)
            .await
            .unwrap();
        let offer = engine.create_offer().await.unwrap();
        engine.set_local_description(offer.clone()).await.unwrap();

        let err = engine.set_remote_description(offer).await.unwrap_err();
        assert!(matches!(err, LinkError::Glare { .. }));
        assert_eq!(engine.signaling_state(), NegotiationState::HaveLocalOffer);
    }

    #[test_timeout::tokio_timeout_test]
    async fn channel_sends_only_while_open() {
        let factory = MockEngineFactory::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = factory
            .create_connection(settings(PeerRole::Offerer), tx)
            .await
            .unwrap();
        let handle = engine.create_data_channel("liquid").await.unwrap();
        assert!(matches!(
            handle.send_text("early").await,
            Err(LinkError::ChannelClosed)
        ));

        let mock = factory.engine(0).await.channels()[0].clone();
        mock.open();
        handle.send_text("hello").await.unwrap();
        assert_eq!(mock.sent(), vec!["hello".to_string()]);

        match rx.recv().await {
            Some(EngineEvent::Channel { id, event }) => {
                assert_eq!(id, handle.id());
                assert_eq!(event, ChannelEvent::State(ChannelState::Open));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn failures_apply_to_existing_engines() {
        let factory = MockEngineFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = factory
            .create_connection(settings(PeerRole::Offerer), tx)
            .await
            .unwrap();
        factory.fail_at(FailPoint::CreateOffer);
        assert!(engine.create_offer().await.is_err());
        factory.clear_failures();
        assert!(engine.create_offer().await.is_ok());
    }
}
