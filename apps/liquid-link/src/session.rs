use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use url::Url;

use crate::config::{IceServer, LinkConfig};
use crate::engine::{
    ChannelEvent, ChannelId, ChannelState, DataChannelHandle, EngineFactory, RtcEngineFactory,
};
use crate::error::LinkError;
use crate::protocol::{LIVENESS_PROBE, PeerRole};
use crate::signaling::{
    ClientEvent, ClientOptions, ConnectionStatus, NegotiationFailure, NegotiationRequest,
    SignalingChannelClient, SignalingConnector, WebSocketConnector,
};

pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;
pub type StateHandler = Arc<dyn Fn(ChannelState) + Send + Sync>;

const FAILURE_BACKLOG: usize = 16;

struct Handlers {
    on_message: MessageHandler,
    on_state_change: StateHandler,
}

/// Data channels seen during one attempt, keyed by the token their events
/// carry. The session owns the handles; events only name them.
#[derive(Default)]
struct ChannelRegistry {
    channels: HashMap<ChannelId, Arc<dyn DataChannelHandle>>,
    active: Option<ChannelId>,
}

impl ChannelRegistry {
    /// Registers a channel. The most recent channel carrying `label` becomes
    /// the active one; others are kept but never carry application traffic.
    fn register(&mut self, channel: Arc<dyn DataChannelHandle>, label: &str) -> bool {
        let id = channel.id();
        let selected = channel.label() == label;
        self.channels.insert(id, channel);
        if selected {
            self.active = Some(id);
        }
        selected
    }

    fn active(&self) -> Option<Arc<dyn DataChannelHandle>> {
        self.active.and_then(|id| self.channels.get(&id).cloned())
    }

    fn is_active(&self, id: ChannelId) -> bool {
        self.active == Some(id)
    }

    fn clear(&mut self) {
        self.channels.clear();
        self.active = None;
    }
}

#[derive(Default)]
struct SessionState {
    attempt: u64,
    client: Option<SignalingChannelClient>,
    pending_negotiation: Option<NegotiationRequest>,
    role: Option<PeerRole>,
    request_id: Option<String>,
    initialized: bool,
    registry: ChannelRegistry,
    opened: bool,
    ready: bool,
    queue: VecDeque<String>,
    on_message: Option<MessageHandler>,
    on_state_change: Option<StateHandler>,
}

struct SessionInner {
    config: LinkConfig,
    connector: Arc<dyn SignalingConnector>,
    engines: Arc<dyn EngineFactory>,
    state: Mutex<SessionState>,
    failures: broadcast::Sender<NegotiationFailure>,
}

/// Owns at most one signaling client and peer connection at a time and
/// bridges the data channel to application callbacks.
#[derive(Clone)]
pub struct SignalingSession {
    inner: Arc<SessionInner>,
}

impl SignalingSession {
    /// Session over WebSocket signaling and real peer connections.
    pub fn new(config: LinkConfig) -> Self {
        Self::with_transport(
            config,
            Arc::new(WebSocketConnector::new()),
            Arc::new(RtcEngineFactory),
        )
    }

    pub fn with_transport(
        config: LinkConfig,
        connector: Arc<dyn SignalingConnector>,
        engines: Arc<dyn EngineFactory>,
    ) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_BACKLOG);
        Self {
            inner: Arc::new(SessionInner {
                config,
                connector,
                engines,
                state: Mutex::new(SessionState::default()),
                failures,
            }),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Opens a signaling connection without negotiating.
    pub async fn start(&self, server_url: &str) -> Result<(), LinkError> {
        let url = Url::parse(server_url)?;
        self.replace_client(url, None, None).await;
        Ok(())
    }

    /// Starts a fresh attempt, replacing whatever attempt was running.
    ///
    /// Negotiation begins once the signaling connection is up. `server_url`
    /// falls back to the configured signaling URL.
    pub async fn connect_to_peer<M, S>(
        &self,
        request_id: &str,
        role: PeerRole,
        server_url: Option<&str>,
        ice_servers: Vec<IceServer>,
        on_message: M,
        on_state_change: S,
    ) -> Result<(), LinkError>
    where
        M: Fn(String) + Send + Sync + 'static,
        S: Fn(ChannelState) + Send + Sync + 'static,
    {
        let url = server_url
            .map(str::to_string)
            .or_else(|| self.inner.config.signaling_url.clone())
            .ok_or_else(|| LinkError::Setup("no signaling url configured".into()))?;
        let url = Url::parse(&url)?;

        tracing::info!(
            target: "liquid_link::session",
            %role,
            request_id,
            url = %url,
            "connecting to peer"
        );
        let request = NegotiationRequest {
            request_id: request_id.to_string(),
            role,
            ice_servers,
        };
        let handlers = Handlers {
            on_message: Arc::new(on_message),
            on_state_change: Arc::new(on_state_change),
        };
        self.replace_client(url, Some(request), Some(handlers)).await;
        Ok(())
    }

    /// Sends on the active channel when it is open, otherwise queues.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), LinkError> {
        let text = text.into();
        let channel = {
            let mut state = self.inner.state.lock();
            match state.registry.active() {
                Some(channel) if state.ready => channel,
                _ => {
                    state.queue.push_back(text);
                    return Ok(());
                }
            }
        };
        match channel.send_text(&text).await {
            Ok(()) => Ok(()),
            Err(LinkError::ChannelClosed) => {
                tracing::debug!(target: "liquid_link::session", "channel closed mid-send; queueing");
                let mut state = self.inner.state.lock();
                state.ready = false;
                state.queue.push_back(text);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Closes only the signaling connection. An established peer connection
    /// keeps carrying messages.
    pub fn disconnect(&self) {
        if let Some(client) = self.inner.state.lock().client.clone() {
            client.release_signaling();
        }
    }

    /// Tears down signaling, the peer connection and the channel. Calling it
    /// again is a no-op.
    pub async fn stop(&self) {
        let client = {
            let mut state = self.inner.state.lock();
            state.attempt += 1;
            reset_attempt(&mut state);
            state.queue.clear();
            state.on_message = None;
            state.on_state_change = None;
            state.role = None;
            state.request_id = None;
            state.client.take()
        };
        if let Some(client) = client {
            tracing::info!(target: "liquid_link::session", "stopping session");
            client.shutdown().await;
        }
    }

    pub fn is_peer_client_initialized(&self) -> bool {
        self.inner.state.lock().initialized
    }

    /// Failures of the current attempt, from the moment of subscription.
    pub fn failures(&self) -> broadcast::Receiver<NegotiationFailure> {
        self.inner.failures.subscribe()
    }

    pub fn role(&self) -> Option<PeerRole> {
        self.inner.state.lock().role
    }

    pub fn request_id(&self) -> Option<String> {
        self.inner.state.lock().request_id.clone()
    }

    pub fn queued_messages(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_channel_open(&self) -> bool {
        self.inner.state.lock().ready
    }

    pub fn client(&self) -> Option<SignalingChannelClient> {
        self.inner.state.lock().client.clone()
    }

    /// Handlers are swapped under the same lock that retires the previous
    /// attempt, so a late event from it can never reach the new callbacks.
    async fn replace_client(
        &self,
        url: Url,
        request: Option<NegotiationRequest>,
        handlers: Option<Handlers>,
    ) {
        let (client, events, attempt, previous) = {
            let mut state = self.inner.state.lock();
            state.attempt += 1;
            reset_attempt(&mut state);
            if let Some(handlers) = handlers {
                state.on_message = Some(handlers.on_message);
                state.on_state_change = Some(handlers.on_state_change);
            }
            let previous = state.client.take();
            let (client, events) = SignalingChannelClient::new(
                url,
                Arc::clone(&self.inner.connector),
                Arc::clone(&self.inner.engines),
                ClientOptions::from(&self.inner.config),
            );
            state.client = Some(client.clone());
            state.role = request.as_ref().map(|request| request.role);
            state.request_id = request.as_ref().map(|request| request.request_id.clone());
            state.pending_negotiation = request;
            (client, events, state.attempt, previous)
        };

        if let Some(previous) = previous {
            tracing::debug!(target: "liquid_link::session", attempt, "tearing down previous attempt");
            previous.shutdown().await;
        }

        tokio::spawn(pump(Arc::downgrade(&self.inner), attempt, events));
        client.connect();
    }
}

fn reset_attempt(state: &mut SessionState) {
    state.pending_negotiation = None;
    state.initialized = false;
    state.registry.clear();
    state.opened = false;
    state.ready = false;
}

async fn pump(
    inner: Weak<SessionInner>,
    attempt: u64,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.state.lock().attempt != attempt {
            tracing::trace!(target: "liquid_link::session", attempt, "dropping event from stale attempt");
            break;
        }
        inner.handle_client_event(attempt, event).await;
    }
}

impl SessionInner {
    async fn handle_client_event(self: &Arc<Self>, attempt: u64, event: ClientEvent) {
        match event {
            ClientEvent::Status(ConnectionStatus::Connected) => {
                let (client, request) = {
                    let mut state = self.state.lock();
                    (state.client.clone(), state.pending_negotiation.take())
                };
                if let (Some(client), Some(request)) = (client, request) {
                    client.negotiate(request);
                }
            }
            ClientEvent::Status(status) => {
                tracing::debug!(target: "liquid_link::session", ?status, "signaling status");
            }
            ClientEvent::EngineReady => {
                self.state.lock().initialized = true;
            }
            ClientEvent::ChannelReady(channel) => {
                let id = channel.id();
                let open = channel.ready_state() == ChannelState::Open;
                let selected = {
                    let mut state = self.state.lock();
                    let selected = state.registry.register(channel, &self.config.channel_label);
                    if selected {
                        state.opened = false;
                        state.ready = false;
                    }
                    selected
                };
                tracing::debug!(target: "liquid_link::session", channel = ?id, selected, "data channel registered");
                if selected && open {
                    self.channel_opened(attempt, id).await;
                }
            }
            ClientEvent::Channel { id, event } => self.handle_channel_event(attempt, id, event).await,
            ClientEvent::PeerState(state) => {
                tracing::debug!(target: "liquid_link::session", ?state, "peer connection state");
            }
            ClientEvent::Failed(failure) => {
                tracing::warn!(target: "liquid_link::session", %failure, "attempt failed");
                let _ = self.failures.send(failure);
            }
        }
    }

    async fn handle_channel_event(self: &Arc<Self>, attempt: u64, id: ChannelId, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(text) => {
                let handler = {
                    let state = self.state.lock();
                    if !state.registry.is_active(id) {
                        tracing::trace!(target: "liquid_link::session", channel = ?id, "dropping message from inactive channel");
                        return;
                    }
                    state.on_message.clone()
                };
                if let Some(handler) = handler {
                    handler(text);
                }
            }
            ChannelEvent::State(ChannelState::Open) => self.channel_opened(attempt, id).await,
            ChannelEvent::State(channel_state) => {
                let handler = {
                    let mut state = self.state.lock();
                    if !state.registry.is_active(id) {
                        return;
                    }
                    if matches!(channel_state, ChannelState::Closing | ChannelState::Closed) {
                        state.ready = false;
                        state.opened = false;
                    }
                    state.on_state_change.clone()
                };
                tracing::debug!(target: "liquid_link::session", channel = ?id, state = ?channel_state, "data channel state");
                if let Some(handler) = handler {
                    handler(channel_state);
                }
            }
            ChannelEvent::BufferedAmount(amount) => {
                tracing::trace!(target: "liquid_link::session", channel = ?id, amount, "buffered amount");
            }
        }
    }

    async fn channel_opened(self: &Arc<Self>, attempt: u64, id: ChannelId) {
        let (channel, handler) = {
            let mut state = self.state.lock();
            if state.attempt != attempt || !state.registry.is_active(id) || state.opened {
                return;
            }
            let Some(channel) = state.registry.active() else {
                return;
            };
            state.opened = true;
            (channel, state.on_state_change.clone())
        };
        tracing::info!(target: "liquid_link::session", channel = ?id, "data channel open");
        if let Some(handler) = handler {
            handler(ChannelState::Open);
        }

        loop {
            let batch: Vec<String> = {
                let mut state = self.state.lock();
                if state.attempt != attempt {
                    return;
                }
                if state.queue.is_empty() {
                    state.ready = true;
                    break;
                }
                state.queue.drain(..).collect()
            };
            tracing::debug!(target: "liquid_link::session", count = batch.len(), "flushing queued messages");
            let mut pending = batch.into_iter();
            while let Some(message) = pending.next() {
                if let Err(err) = channel.send_text(&message).await {
                    tracing::warn!(target: "liquid_link::session", error = %err, "flush interrupted; requeueing");
                    let mut state = self.state.lock();
                    let rest: Vec<String> = std::iter::once(message).chain(pending).collect();
                    for message in rest.into_iter().rev() {
                        state.queue.push_front(message);
                    }
                    return;
                }
            }
        }

        if self.config.probe_count > 0 {
            tokio::spawn(probe(
                Arc::downgrade(self),
                attempt,
                channel,
                self.config.probe_count,
                self.config.probe_interval,
            ));
        }
    }
}

async fn probe(
    inner: Weak<SessionInner>,
    attempt: u64,
    channel: Arc<dyn DataChannelHandle>,
    count: u32,
    interval: std::time::Duration,
) {
    for sent in 0..count {
        if sent > 0 {
            tokio::time::sleep(interval).await;
        }
        let current = inner
            .upgrade()
            .is_some_and(|inner| inner.state.lock().attempt == attempt);
        if !current {
            return;
        }
        if let Err(err) = channel.send_text(LIVENESS_PROBE).await {
            tracing::debug!(target: "liquid_link::session", error = %err, "liveness probe stopped");
            return;
        }
        tracing::trace!(target: "liquid_link::session", sent = sent + 1, "liveness probe sent");
    }
}
