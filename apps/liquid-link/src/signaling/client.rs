use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use url::Url;

use crate::config::{IceServer, LinkConfig};
use crate::engine::{
    ChannelEvent, ChannelId, ChannelState, DataChannelHandle, EngineEvent, EngineFactory,
    EngineSettings, IceCandidate, Negotiator, PeerConnectionState, SdpKind,
};
use crate::error::LinkError;
use crate::protocol::{
    DATA_CHANNEL_LABEL, EventPayload, LinkPayload, PeerRole, SdpPayload, SignalEvent, WireEvent,
    parse_description,
};
use crate::signaling::{SignalingConnector, SignalingLink, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Where an attempt is in the offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationPhase {
    Idle,
    LinkSent,
    LocalOfferSet,
    WaitingForOffer,
    RemoteDescriptionSet,
    CandidatesFlushed,
    Open,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureStage {
    Connect,
    CreateConnection,
    CreateDataChannel,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    Timeout,
    Transport,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureStage::Connect => "connect",
            FailureStage::CreateConnection => "create-connection",
            FailureStage::CreateDataChannel => "create-data-channel",
            FailureStage::CreateOffer => "create-offer",
            FailureStage::CreateAnswer => "create-answer",
            FailureStage::SetLocalDescription => "set-local-description",
            FailureStage::SetRemoteDescription => "set-remote-description",
            FailureStage::Timeout => "timeout",
            FailureStage::Transport => "transport",
        };
        f.write_str(name)
    }
}

/// A negotiation step that failed. The attempt does not continue past it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{stage} failed: {error}")]
pub struct NegotiationFailure {
    pub stage: FailureStage,
    pub error: LinkError,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Status(ConnectionStatus),
    /// A peer connection exists for this client.
    EngineReady,
    /// A data channel was created locally or announced by the remote side.
    ChannelReady(Arc<dyn DataChannelHandle>),
    Channel {
        id: ChannelId,
        event: ChannelEvent,
    },
    PeerState(PeerConnectionState),
    Failed(NegotiationFailure),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub channel_label: String,
    pub candidate_pool_size: u8,
    pub include_loopback: bool,
    pub negotiation_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            channel_label: DATA_CHANNEL_LABEL.to_string(),
            candidate_pool_size: 10,
            include_loopback: false,
            negotiation_timeout: None,
        }
    }
}

impl From<&LinkConfig> for ClientOptions {
    fn from(config: &LinkConfig) -> Self {
        Self {
            channel_label: config.channel_label.clone(),
            candidate_pool_size: config.candidate_pool_size,
            include_loopback: config.include_loopback,
            negotiation_timeout: config.negotiation_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NegotiationRequest {
    pub request_id: String,
    pub role: PeerRole,
    pub ice_servers: Vec<IceServer>,
}

enum Command {
    Connect,
    Disconnect,
    ReleaseSignaling,
    Send(WireEvent),
    Negotiate(NegotiationRequest),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to one signaling connection and the negotiation it drives.
///
/// All state lives in a driver task; the handle only enqueues commands, so
/// every method returns immediately and is safe to call from any task.
#[derive(Clone)]
pub struct SignalingChannelClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    phase: watch::Receiver<NegotiationPhase>,
}

impl SignalingChannelClient {
    pub fn new(
        url: Url,
        connector: Arc<dyn SignalingConnector>,
        engines: Arc<dyn EngineFactory>,
        options: ClientOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (phase_tx, phase_rx) = watch::channel(NegotiationPhase::Idle);
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            url,
            connector,
            engines,
            options,
            commands: commands_rx,
            events: events_tx,
            status: status_tx,
            phase: phase_tx,
            queue: VecDeque::new(),
            outbound: None,
            inbound: None,
            connect_epoch: 0,
            connect_tx,
            connect_rx,
            engine: None,
            engine_rx: None,
            role: None,
            remote_applied: false,
            pending_candidates: Vec::new(),
            pending_offer: None,
            deadline: None,
        };
        tokio::spawn(driver.run());

        (
            Self {
                commands: commands_tx,
                status: status_rx,
                phase: phase_rx,
            },
            events_rx,
        )
    }

    /// Opens the signaling connection unless one is open or opening.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Closes the signaling connection and tears down the peer connection.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Closes only the signaling connection; an established peer connection
    /// keeps running.
    pub fn release_signaling(&self) {
        self.command(Command::ReleaseSignaling);
    }

    /// Transmits now when connected, otherwise queues until the next connect.
    pub fn send(&self, name: impl Into<String>, payload: EventPayload) {
        self.send_event(WireEvent::new(name, payload));
    }

    pub fn send_event(&self, event: WireEvent) {
        self.command(Command::Send(event));
    }

    pub fn negotiate(&self, request: NegotiationRequest) {
        self.command(Command::Negotiate(request));
    }

    /// Tears everything down and waits for the driver to finish.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn phase(&self) -> NegotiationPhase {
        *self.phase.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn watch_phase(&self) -> watch::Receiver<NegotiationPhase> {
        self.phase.clone()
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::trace!(target: "liquid_link::client", "client already shut down");
        }
    }
}

enum Next {
    Command(Option<Command>),
    Connected(u64, Result<SignalingLink, LinkError>),
    Transport(Option<TransportEvent>),
    Engine(Option<EngineEvent>),
    Deadline,
}

struct Driver {
    url: Url,
    connector: Arc<dyn SignalingConnector>,
    engines: Arc<dyn EngineFactory>,
    options: ClientOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    status: watch::Sender<ConnectionStatus>,
    phase: watch::Sender<NegotiationPhase>,
    queue: VecDeque<WireEvent>,
    outbound: Option<mpsc::UnboundedSender<WireEvent>>,
    inbound: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    connect_epoch: u64,
    connect_tx: mpsc::UnboundedSender<(u64, Result<SignalingLink, LinkError>)>,
    connect_rx: mpsc::UnboundedReceiver<(u64, Result<SignalingLink, LinkError>)>,
    engine: Option<Arc<dyn Negotiator>>,
    engine_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    role: Option<PeerRole>,
    remote_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    pending_offer: Option<EventPayload>,
    deadline: Option<Instant>,
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        loop {
            let next = tokio::select! {
                command = self.commands.recv() => Next::Command(command),
                Some((epoch, result)) = self.connect_rx.recv() => Next::Connected(epoch, result),
                event = recv_opt(&mut self.inbound) => Next::Transport(event),
                event = recv_opt(&mut self.engine_rx) => Next::Engine(event),
                _ = until(self.deadline) => Next::Deadline,
            };

            match next {
                Next::Command(Some(Command::Shutdown(ack))) => {
                    self.shutdown().await;
                    let _ = ack.send(());
                    break;
                }
                Next::Command(None) => {
                    self.shutdown().await;
                    break;
                }
                Next::Command(Some(command)) => self.handle_command(command).await,
                Next::Connected(epoch, result) => self.handle_connected(epoch, result),
                Next::Transport(Some(TransportEvent::Event(event))) => {
                    self.handle_wire_event(event).await
                }
                Next::Transport(Some(TransportEvent::Closed(reason))) => {
                    self.handle_transport_closed(reason).await
                }
                Next::Transport(None) => self.handle_transport_closed(None).await,
                Next::Engine(Some(event)) => self.handle_engine_event(event),
                Next::Engine(None) => self.engine_rx = None,
                Next::Deadline => {
                    self.deadline = None;
                    self.fail(FailureStage::Timeout, LinkError::Timeout);
                }
            }
        }
        tracing::debug!(target: "liquid_link::client", url = %self.url, "signaling client stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => {
                self.release_link();
                self.teardown_engine().await;
            }
            Command::ReleaseSignaling => self.release_link(),
            Command::Send(event) => self.send(event),
            Command::Negotiate(request) => self.negotiate(request).await,
            Command::Shutdown(_) => {}
        }
    }

    fn connect(&mut self) {
        if *self.status.borrow() != ConnectionStatus::Disconnected {
            return;
        }
        self.set_status(ConnectionStatus::Connecting);
        self.connect_epoch += 1;
        let epoch = self.connect_epoch;
        let connector = Arc::clone(&self.connector);
        let url = self.url.clone();
        let results = self.connect_tx.clone();
        tokio::spawn(async move {
            let result = connector.connect(&url).await;
            let _ = results.send((epoch, result));
        });
    }

    fn handle_connected(&mut self, epoch: u64, result: Result<SignalingLink, LinkError>) {
        if epoch != self.connect_epoch || *self.status.borrow() != ConnectionStatus::Connecting {
            tracing::trace!(target: "liquid_link::client", epoch, "discarding stale connect result");
            return;
        }
        match result {
            Ok(link) => {
                self.outbound = Some(link.outbound);
                self.inbound = Some(link.inbound);
                self.set_status(ConnectionStatus::Connected);
                tracing::debug!(
                    target: "liquid_link::client",
                    url = %self.url,
                    queued = self.queue.len(),
                    "signaling connected"
                );
                self.flush_queue();
            }
            Err(err) => {
                tracing::warn!(target: "liquid_link::client", url = %self.url, error = %err, "signaling connect failed");
                self.set_status(ConnectionStatus::Disconnected);
                self.fail(FailureStage::Connect, err);
            }
        }
    }

    fn flush_queue(&mut self) {
        while let Some(event) = self.queue.pop_front() {
            if let Err(event) = self.transmit(event) {
                self.queue.push_front(event);
                break;
            }
        }
    }

    fn send(&mut self, event: WireEvent) {
        if self.outbound.is_none() {
            tracing::trace!(target: "liquid_link::client", event = %event.name, "queueing signaling event");
            self.queue.push_back(event);
            return;
        }
        if let Err(event) = self.transmit(event) {
            self.queue.push_back(event);
        }
    }

    /// Hands the event to the link; gives it back when the link is gone.
    fn transmit(&mut self, event: WireEvent) -> Result<(), WireEvent> {
        let Some(outbound) = &self.outbound else {
            return Err(event);
        };
        match outbound.send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(event)) => {
                tracing::warn!(target: "liquid_link::client", "signaling link closed while sending");
                self.outbound = None;
                Err(event)
            }
        }
    }

    fn release_link(&mut self) {
        self.connect_epoch += 1;
        let had_link = self.outbound.take().is_some();
        self.inbound = None;
        if had_link {
            tracing::debug!(target: "liquid_link::client", url = %self.url, "signaling released");
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    async fn handle_transport_closed(&mut self, reason: Option<String>) {
        tracing::warn!(
            target: "liquid_link::client",
            url = %self.url,
            reason = reason.as_deref().unwrap_or("none"),
            "signaling connection closed"
        );
        self.outbound = None;
        self.inbound = None;
        self.set_status(ConnectionStatus::Disconnected);

        if self.engine.is_some() && *self.phase.borrow() != NegotiationPhase::Open {
            self.teardown_engine().await;
            let message = reason.unwrap_or_else(|| "signaling connection closed".into());
            self.fail(FailureStage::Transport, LinkError::Signaling(message));
        }
    }

    async fn negotiate(&mut self, request: NegotiationRequest) {
        if self.engine.is_some() {
            tracing::warn!(target: "liquid_link::client", "replacing existing peer connection");
            self.teardown_engine().await;
        }

        let role = request.role;
        self.role = Some(role);
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let settings = EngineSettings {
            role,
            ice_servers: request.ice_servers.clone(),
            candidate_pool_size: self.options.candidate_pool_size,
            include_loopback: self.options.include_loopback,
        };
        let engine = match self.engines.create_connection(settings, engine_tx).await {
            Ok(engine) => engine,
            Err(err) => {
                self.fail(FailureStage::CreateConnection, err);
                return;
            }
        };
        self.engine = Some(Arc::clone(&engine));
        self.engine_rx = Some(engine_rx);
        self.remote_applied = false;
        self.emit(ClientEvent::EngineReady);
        self.deadline = self
            .options
            .negotiation_timeout
            .map(|timeout| Instant::now() + timeout);

        tracing::debug!(
            target: "liquid_link::client",
            %role,
            request_id = %request.request_id,
            "starting negotiation"
        );
        let link = LinkPayload {
            request_id: request.request_id,
        };
        match WireEvent::signal(SignalEvent::Link, &link) {
            Ok(event) => self.send(event),
            Err(err) => tracing::warn!(target: "liquid_link::client", error = %err, "failed to encode link"),
        }
        self.set_phase(NegotiationPhase::LinkSent);

        match role {
            PeerRole::Offerer => self.start_offer(engine).await,
            PeerRole::Answerer => {
                self.set_phase(NegotiationPhase::WaitingForOffer);
                if let Some(payload) = self.pending_offer.take() {
                    self.handle_offer(payload).await;
                }
            }
        }
    }

    async fn start_offer(&mut self, engine: Arc<dyn Negotiator>) {
        let channel = match engine.create_data_channel(&self.options.channel_label).await {
            Ok(channel) => channel,
            Err(err) => return self.fail(FailureStage::CreateDataChannel, err),
        };
        self.emit(ClientEvent::ChannelReady(channel));

        let offer = match engine.create_offer().await {
            Ok(offer) => offer,
            Err(err) => return self.fail(FailureStage::CreateOffer, err),
        };
        let sdp = offer.sdp.clone();
        if let Err(err) = engine.set_local_description(offer).await {
            return self.fail(FailureStage::SetLocalDescription, err);
        }
        self.set_phase(NegotiationPhase::LocalOfferSet);
        self.send_description(SignalEvent::OfferDescription, sdp);
    }

    async fn handle_wire_event(&mut self, event: WireEvent) {
        let Some(kind) = event.kind() else {
            tracing::debug!(target: "liquid_link::client", event = %event.name, "ignoring unknown signaling event");
            return;
        };
        match kind {
            SignalEvent::OfferDescription => self.receive_offer(event.payload).await,
            SignalEvent::AnswerDescription => self.handle_answer(event.payload).await,
            SignalEvent::OfferCandidate | SignalEvent::AnswerCandidate | SignalEvent::Candidate => {
                match event.payload.decode::<IceCandidate>() {
                    Ok(candidate) => self.handle_remote_candidate(candidate).await,
                    Err(err) => tracing::warn!(
                        target: "liquid_link::client",
                        event = %kind,
                        error = %err,
                        "ignoring malformed candidate"
                    ),
                }
            }
            SignalEvent::LinkResponse => {
                tracing::debug!(target: "liquid_link::client", payload = %event.payload.to_value(), "link response");
            }
            SignalEvent::Error => {
                tracing::warn!(target: "liquid_link::client", payload = %event.payload.to_value(), "signaling server error");
            }
            SignalEvent::Link => {
                tracing::trace!(target: "liquid_link::client", "ignoring inbound link");
            }
        }
    }

    async fn receive_offer(&mut self, payload: EventPayload) {
        match (self.role, self.engine.is_some()) {
            (None, _) | (Some(PeerRole::Answerer), false) => {
                if self.pending_offer.is_some() {
                    tracing::warn!(target: "liquid_link::client", "dropping duplicate early offer");
                    return;
                }
                tracing::debug!(target: "liquid_link::client", "holding offer until negotiation starts");
                self.pending_offer = Some(payload);
            }
            (Some(PeerRole::Answerer), true) => {
                if *self.phase.borrow() != NegotiationPhase::WaitingForOffer {
                    tracing::warn!(target: "liquid_link::client", "ignoring offer; already answered");
                    return;
                }
                self.handle_offer(payload).await;
            }
            (Some(PeerRole::Offerer), _) => {
                tracing::warn!(target: "liquid_link::client", "offerer ignoring remote offer");
            }
        }
    }

    async fn handle_offer(&mut self, payload: EventPayload) {
        let Some(engine) = self.engine.clone() else {
            return;
        };
        let description = match parse_description(&payload, SdpKind::Offer) {
            Ok(description) => description,
            Err(err) => {
                tracing::warn!(target: "liquid_link::client", error = %err, "ignoring malformed offer");
                return;
            }
        };
        if description.kind != SdpKind::Offer {
            tracing::warn!(target: "liquid_link::client", kind = %description.kind, "offer-description carried a non-offer");
            return;
        }
        match engine.set_remote_description(description).await {
            Ok(()) => {}
            Err(err @ LinkError::Glare { .. }) => {
                tracing::warn!(target: "liquid_link::client", error = %err, "remote offer refused");
                return;
            }
            Err(err) => return self.fail(FailureStage::SetRemoteDescription, err),
        }
        self.remote_applied().await;

        let answer = match engine.create_answer().await {
            Ok(answer) => answer,
            Err(err) => return self.fail(FailureStage::CreateAnswer, err),
        };
        let sdp = answer.sdp.clone();
        if let Err(err) = engine.set_local_description(answer).await {
            return self.fail(FailureStage::SetLocalDescription, err);
        }
        self.send_description(SignalEvent::AnswerDescription, sdp);
    }

    async fn handle_answer(&mut self, payload: EventPayload) {
        let Some(engine) = self.engine.clone() else {
            tracing::warn!(target: "liquid_link::client", "ignoring answer without a peer connection");
            return;
        };
        let description = match parse_description(&payload, SdpKind::Answer) {
            Ok(description) => description,
            Err(err) => {
                tracing::warn!(target: "liquid_link::client", error = %err, "ignoring malformed answer");
                return;
            }
        };
        if description.kind == SdpKind::Offer {
            tracing::warn!(target: "liquid_link::client", "answer-description carried an offer");
            return;
        }
        match engine.set_remote_description(description).await {
            Ok(()) => self.remote_applied().await,
            Err(err @ LinkError::Glare { .. }) => {
                tracing::warn!(target: "liquid_link::client", error = %err, "remote answer refused");
            }
            Err(err) => self.fail(FailureStage::SetRemoteDescription, err),
        }
    }

    async fn remote_applied(&mut self) {
        self.remote_applied = true;
        self.deadline = None;
        self.set_phase(NegotiationPhase::RemoteDescriptionSet);
        self.flush_candidates().await;
        self.set_phase(NegotiationPhase::CandidatesFlushed);
    }

    async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        match &self.engine {
            Some(engine) if self.remote_applied => {
                if let Err(err) = engine.add_ice_candidate(candidate).await {
                    tracing::warn!(target: "liquid_link::client", error = %err, "failed to add remote candidate");
                }
            }
            _ => {
                self.pending_candidates.push(candidate);
                tracing::trace!(
                    target: "liquid_link::client",
                    buffered = self.pending_candidates.len(),
                    "buffering remote candidate"
                );
            }
        }
    }

    async fn flush_candidates(&mut self) {
        let Some(engine) = self.engine.clone() else {
            return;
        };
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            tracing::debug!(target: "liquid_link::client", count = pending.len(), "applying buffered candidates");
        }
        for candidate in pending {
            if let Err(err) = engine.add_ice_candidate(candidate).await {
                tracing::warn!(target: "liquid_link::client", error = %err, "failed to add buffered candidate");
            }
        }
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                let Some(role) = self.role else {
                    return;
                };
                match WireEvent::signal(role.local_candidate_event(), &candidate) {
                    Ok(event) => self.send(event),
                    Err(err) => tracing::warn!(target: "liquid_link::client", error = %err, "failed to encode local candidate"),
                }
            }
            EngineEvent::RemoteChannel(channel) => {
                tracing::debug!(target: "liquid_link::client", label = %channel.label(), "remote data channel received");
                self.emit(ClientEvent::ChannelReady(channel));
            }
            EngineEvent::Channel { id, event } => {
                if event == ChannelEvent::State(ChannelState::Open) {
                    self.set_phase(NegotiationPhase::Open);
                }
                self.emit(ClientEvent::Channel { id, event });
            }
            EngineEvent::ConnectionState(state) => {
                tracing::debug!(target: "liquid_link::client", ?state, "peer connection state");
                self.emit(ClientEvent::PeerState(state));
            }
            EngineEvent::SignalingState(state) => {
                tracing::trace!(target: "liquid_link::client", %state, "signaling state");
            }
        }
    }

    fn send_description(&mut self, event: SignalEvent, sdp: String) {
        match WireEvent::signal(event, &SdpPayload { sdp }) {
            Ok(wire) => self.send(wire),
            Err(err) => tracing::warn!(target: "liquid_link::client", %event, error = %err, "failed to encode description"),
        }
    }

    async fn teardown_engine(&mut self) {
        self.engine_rx = None;
        self.remote_applied = false;
        self.pending_candidates.clear();
        self.pending_offer = None;
        self.deadline = None;
        if let Some(engine) = self.engine.take() {
            if let Err(err) = engine.close().await {
                tracing::debug!(target: "liquid_link::client", error = %err, "peer connection close failed");
            }
            self.set_phase(NegotiationPhase::Closed);
        }
    }

    async fn shutdown(&mut self) {
        self.release_link();
        self.teardown_engine().await;
    }

    fn fail(&mut self, stage: FailureStage, error: LinkError) {
        tracing::warn!(target: "liquid_link::client", %stage, error = %error, "negotiation failed");
        self.deadline = None;
        self.set_phase(NegotiationPhase::Failed);
        self.emit(ClientEvent::Failed(NegotiationFailure { stage, error }));
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            self.emit(ClientEvent::Status(status));
        }
    }

    fn set_phase(&mut self, phase: NegotiationPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::trace!(target: "liquid_link::client", ?previous, ?phase, "negotiation phase");
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}
