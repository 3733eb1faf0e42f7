//! Per-peer connection state machine and its supervisor.
//!
//! Every negotiation attempt is a fresh [`Orchestrator`] with a fresh
//! signaling session and peer connection. The wallet answers: it waits for
//! the extension's offer, answers, trickles candidates both ways and is
//! `Connected` once the data channel opens. The supervisor owns the peer's
//! command mailbox and decides whether a finished attempt is followed by
//! another one.

use crate::backoff::ExponentialBackoff;
use crate::channel::{DataChannelWrapper, InboundAssembler};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::rtc::{IceCandidate, PeerConnector, RtcEvent, RtcEvents, RtcPeer, SessionDescription};
use crate::signaling::{SignalingClient, SignalingEvent};
use crate::types::{ConnectionEvent, InboundMessage, MessageEnvelope, PeerId};
use chrono::Utc;
use peerdroid_common::crypto::EncryptionKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Lifecycle of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerState {
    /// No network activity yet.
    Idle,
    /// Offer received and answer being produced.
    SignalingOffered,
    /// Answer sent; candidates are being exchanged and tried.
    IceGathering,
    /// The data channel is open.
    Connected,
    /// The data channel closed after having been open.
    Disconnected,
    /// Negotiation could not complete.
    Failed,
}

impl PeerState {
    /// Whether a single orchestrator may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use PeerState::{Connected, Disconnected, Failed, IceGathering, Idle, SignalingOffered};
        match (self, next) {
            (Idle, SignalingOffered)
            | (SignalingOffered, IceGathering)
            | (IceGathering, Connected)
            | (Connected, Disconnected) => true,
            (from, Failed) => from != Failed,
            _ => false,
        }
    }

    /// `Failed` is never left.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Lowercase name for display.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::SignalingOffered => "signaling-offered",
            Self::IceGathering => "ice-gathering",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests from the registry to a peer's supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerCommand {
    /// Tear the peer down and stop.
    Close,
    /// The link is confirmed; re-link after future disconnects.
    EnableReconnect,
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// A close command was received.
    Closed,
    /// The data channel was open and then closed.
    Disconnected,
    /// Negotiation did not complete.
    Failed(LinkError),
}

/// Everything a peer's tasks share with the registry. Immutable for the
/// lifetime of the supervisor.
pub(crate) struct PeerContext {
    pub peer: PeerId,
    pub key: Arc<EncryptionKey>,
    pub connection_id: String,
    pub config: Arc<LinkConfig>,
    pub connector: Arc<dyn PeerConnector>,
    pub events: broadcast::Sender<ConnectionEvent>,
    pub inbound: broadcast::Sender<InboundMessage>,
    pub state_tx: watch::Sender<PeerState>,
    pub channel_tx: watch::Sender<Option<DataChannelWrapper>>,
}

/// The supervisor's mutable half: mailbox, one-shot link waiters and the
/// reconnect switch.
pub(crate) struct Control {
    pub commands: mpsc::Receiver<PeerCommand>,
    /// Resolved once: `Ok` on the first `Connected`, otherwise the reason the
    /// first attempt ended.
    pub ready: Option<oneshot::Sender<Result<(), LinkError>>>,
    /// Receives the first inbound envelope instead of the shared stream.
    pub first_message: Option<oneshot::Sender<MessageEnvelope>>,
    pub reconnect: bool,
}

impl Control {
    /// Control for a peer that re-links from the start (restored peers).
    pub fn restored(commands: mpsc::Receiver<PeerCommand>) -> Self {
        Self {
            commands,
            ready: None,
            first_message: None,
            reconnect: true,
        }
    }

    fn settle(&mut self, peer: PeerId, end: &SessionEnd) {
        let Some(ready) = self.ready.take() else {
            return;
        };
        let error = match end {
            SessionEnd::Failed(e) => e.clone(),
            SessionEnd::Closed => LinkError::Cancelled,
            SessionEnd::Disconnected => LinkError::PeerNotConnected(peer),
        };
        let _ = ready.send(Err(error));
    }
}

/// Publishes state changes for one attempt and enforces legal transitions.
struct StateMachine<'a> {
    ctx: &'a PeerContext,
    state: PeerState,
}

impl<'a> StateMachine<'a> {
    fn new(ctx: &'a PeerContext) -> Self {
        let machine = Self {
            ctx,
            state: PeerState::Idle,
        };
        if *ctx.state_tx.borrow() != PeerState::Idle {
            machine.publish(PeerState::Idle);
        }
        machine
    }

    fn publish(&self, state: PeerState) {
        self.ctx.state_tx.send_replace(state);
        let _ = self.ctx.events.send(ConnectionEvent::StateChanged {
            peer: self.ctx.peer,
            state,
        });
    }

    fn transition(&mut self, next: PeerState) -> Result<(), LinkError> {
        if !self.state.can_transition_to(next) {
            return Err(LinkError::NegotiationFailed(format!(
                "unexpected transition {} -> {}",
                self.state, next
            )));
        }
        info!(peer = %self.ctx.peer, from = %self.state, to = %next, "peer state changed");
        self.state = next;
        self.publish(next);
        Ok(())
    }

    /// Ends the attempt on `error`. A connected link reports `Disconnected`.
    fn fail(&mut self, error: LinkError) -> SessionEnd {
        if self.state == PeerState::Connected {
            let _ = self.transition(PeerState::Disconnected);
            return SessionEnd::Disconnected;
        }
        warn!(peer = %self.ctx.peer, error = %error, state = %self.state, "link attempt failed");
        if !self.state.is_terminal() {
            let _ = self.transition(PeerState::Failed);
        }
        SessionEnd::Failed(error)
    }
}

enum Flow {
    Continue,
    End(SessionEnd),
}

/// One negotiation attempt.
struct Orchestrator<'a> {
    ctx: &'a PeerContext,
    control: &'a mut Control,
    machine: StateMachine<'a>,
    rtc: Box<dyn RtcPeer>,
    signaling: Option<SignalingClient>,
    remote_client_id: Option<String>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    deadline: Option<Instant>,
    wrapper: Option<DataChannelWrapper>,
    assembler: Option<InboundAssembler>,
}

/// Runs one attempt from `Idle` to its end and releases everything it
/// acquired.
pub(crate) async fn run_attempt(ctx: &PeerContext, control: &mut Control) -> SessionEnd {
    let mut machine = StateMachine::new(ctx);
    let end = match ctx.connector.create_peer(&ctx.config.ice.servers).await {
        Ok((rtc, events)) => {
            let mut orchestrator = Orchestrator {
                ctx,
                control: &mut *control,
                machine,
                rtc,
                signaling: None,
                remote_client_id: None,
                remote_description_set: false,
                pending_candidates: Vec::new(),
                deadline: Some(Instant::now() + ctx.config.timeouts.offer()),
                wrapper: None,
                assembler: None,
            };
            let end = orchestrator.drive(events).await;
            orchestrator.teardown().await;
            end
        }
        Err(e) => machine.fail(e.into()),
    };
    control.settle(ctx.peer, &end);
    end
}

async fn next_signal(signaling: &mut Option<SignalingClient>) -> Result<SignalingEvent, LinkError> {
    match signaling {
        Some(client) => client.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Orchestrator<'_> {
    async fn drive(&mut self, mut rtc_events: RtcEvents) -> SessionEnd {
        match self.join_signaling().await {
            Ok(Flow::Continue) => {}
            Ok(Flow::End(end)) => return end,
            Err(e) => return self.machine.fail(e),
        }

        let config = &self.ctx.config;
        let keepalive_period = Duration::from_secs(config.keepalive.interval_s.max(1));
        let mut keepalive = interval_at(Instant::now() + keepalive_period, keepalive_period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sweep_period = Duration::from_secs(config.chunking.sweep_interval_secs.max(1));
        let mut sweep = interval_at(Instant::now() + sweep_period, sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flow = tokio::select! {
                cmd = self.control.commands.recv() => Ok(self.on_command(cmd)),
                event = next_signal(&mut self.signaling) => match event {
                    Ok(event) => self.on_signal(event).await,
                    Err(e) => Err(e),
                },
                event = rtc_events.recv() => self.on_rtc(event).await,
                () = sleep_until_opt(self.deadline) => Err(self.deadline_error()),
                _ = keepalive.tick() => self.keepalive().await,
                _ = sweep.tick() => {
                    if let Some(assembler) = self.assembler.as_mut() {
                        assembler.evict_stale(Instant::now().into_std());
                    }
                    Ok(Flow::Continue)
                }
            };
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::End(end)) => return end,
                Err(e) => return self.machine.fail(e),
            }
        }
    }

    /// Connects to the relay within the offer deadline, still honouring
    /// close commands.
    async fn join_signaling(&mut self) -> Result<Flow, LinkError> {
        let ctx = self.ctx;
        let connect = SignalingClient::connect(&ctx.config.relay, &ctx.connection_id, ctx.key.clone());
        tokio::pin!(connect);
        loop {
            tokio::select! {
                client = &mut connect => {
                    self.signaling = Some(client?);
                    return Ok(Flow::Continue);
                }
                () = sleep_until_opt(self.deadline) => return Err(self.deadline_error()),
                cmd = self.control.commands.recv() => {
                    if let Flow::End(end) = self.on_command(cmd) {
                        return Ok(Flow::End(end));
                    }
                }
            }
        }
    }

    fn deadline_error(&self) -> LinkError {
        match self.machine.state {
            PeerState::IceGathering => LinkError::NegotiationFailed(format!(
                "no viable candidate pair within {}s",
                self.ctx.config.timeouts.ice_secs
            )),
            _ => LinkError::LinkTimeout,
        }
    }

    fn on_command(&mut self, cmd: Option<PeerCommand>) -> Flow {
        match cmd {
            Some(PeerCommand::EnableReconnect) => {
                self.control.reconnect = true;
                Flow::Continue
            }
            Some(PeerCommand::Close) | None => {
                if self.machine.state == PeerState::Connected {
                    let _ = self.machine.transition(PeerState::Disconnected);
                }
                Flow::End(SessionEnd::Closed)
            }
        }
    }

    async fn on_signal(&mut self, event: SignalingEvent) -> Result<Flow, LinkError> {
        match event {
            SignalingEvent::RemoteConnected { remote_client_id } => {
                debug!(peer = %self.ctx.peer, %remote_client_id, "remote side present");
            }
            SignalingEvent::RemoteDisconnected { remote_client_id } => {
                if self.machine.state != PeerState::Idle {
                    return Err(LinkError::Signaling(
                        "remote peer left during negotiation".into(),
                    ));
                }
                debug!(peer = %self.ctx.peer, %remote_client_id, "remote side left before offering");
            }
            SignalingEvent::Offer {
                remote_client_id,
                sdp,
            } => {
                if self.machine.state == PeerState::Idle {
                    self.on_offer(remote_client_id, sdp).await?;
                } else {
                    warn!(peer = %self.ctx.peer, "ignoring repeated offer");
                }
            }
            SignalingEvent::IceCandidate { candidate, .. } => {
                if self.remote_description_set {
                    if let Err(e) = self.rtc.add_ice_candidate(candidate).await {
                        warn!(peer = %self.ctx.peer, error = %e, "remote candidate rejected");
                    }
                } else {
                    self.pending_candidates.push(candidate);
                }
            }
            SignalingEvent::Confirmed { request_id } => {
                debug!(peer = %self.ctx.peer, %request_id, "relay confirmed");
            }
            SignalingEvent::Undeliverable { request_id } => {
                warn!(peer = %self.ctx.peer, %request_id, "relay could not deliver message");
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_offer(&mut self, remote_client_id: String, sdp: String) -> Result<(), LinkError> {
        let negotiation = |e: crate::rtc::RtcError| LinkError::NegotiationFailed(e.to_string());

        self.rtc
            .set_remote_description(SessionDescription::offer(sdp))
            .await
            .map_err(negotiation)?;
        self.remote_description_set = true;
        self.machine.transition(PeerState::SignalingOffered)?;

        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.rtc.add_ice_candidate(candidate).await {
                warn!(peer = %self.ctx.peer, error = %e, "queued candidate rejected");
            }
        }

        let answer = self.rtc.create_answer().await.map_err(negotiation)?;
        self.rtc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;
        let signaling = self
            .signaling
            .as_mut()
            .ok_or_else(|| LinkError::Signaling("signaling session closed".into()))?;
        signaling.send_answer(&remote_client_id, &answer.sdp).await?;
        self.remote_client_id = Some(remote_client_id);

        self.machine.transition(PeerState::IceGathering)?;
        self.deadline = Some(Instant::now() + self.ctx.config.timeouts.ice());
        Ok(())
    }

    async fn on_rtc(&mut self, event: Option<RtcEvent>) -> Result<Flow, LinkError> {
        let Some(event) = event else {
            return self.on_channel_lost("peer connection stopped reporting");
        };
        match event {
            RtcEvent::IceCandidate(candidate) => {
                match (self.signaling.as_mut(), self.remote_client_id.as_deref()) {
                    (Some(signaling), Some(target)) => {
                        signaling.send_candidate(target, &candidate).await?;
                    }
                    _ => debug!(peer = %self.ctx.peer, "local candidate not sent, no signaling target"),
                }
            }
            RtcEvent::IceGatheringChanged(state) => {
                debug!(peer = %self.ctx.peer, ?state, "ice gathering");
            }
            RtcEvent::DataChannelOpen(channel) => {
                if !channel.is_ordered() {
                    channel.close().await;
                    return Err(LinkError::NegotiationFailed(
                        "unordered data channel refused".into(),
                    ));
                }
                self.machine.transition(PeerState::Connected)?;
                self.deadline = None;

                let ctx = self.ctx;
                info!(peer = %ctx.peer, label = channel.label(), "data channel open");
                let wrapper = DataChannelWrapper::new(
                    ctx.peer,
                    ctx.key.clone(),
                    channel,
                    ctx.state_tx.subscribe(),
                    &ctx.config.chunking,
                );
                self.assembler = Some(InboundAssembler::new(
                    ctx.peer,
                    ctx.key.clone(),
                    &ctx.config.chunking,
                ));
                ctx.channel_tx.send_replace(Some(wrapper.clone()));
                self.wrapper = Some(wrapper);

                if let Some(signaling) = self.signaling.take() {
                    signaling.close().await;
                }
                if let Some(ready) = self.control.ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            RtcEvent::Message(frame) => self.on_frame(&frame),
            RtcEvent::DataChannelClosed => return self.on_channel_lost("data channel closed"),
            RtcEvent::ConnectionFailed(reason) => return self.on_channel_lost(&reason),
        }
        Ok(Flow::Continue)
    }

    fn on_channel_lost(&mut self, reason: &str) -> Result<Flow, LinkError> {
        if self.machine.state == PeerState::Connected {
            info!(peer = %self.ctx.peer, reason, "link lost");
            self.machine.transition(PeerState::Disconnected)?;
            return Ok(Flow::End(SessionEnd::Disconnected));
        }
        Err(LinkError::NegotiationFailed(reason.to_owned()))
    }

    fn on_frame(&mut self, frame: &[u8]) {
        let Some(assembler) = self.assembler.as_mut() else {
            debug!(peer = %self.ctx.peer, "frame before channel open dropped");
            return;
        };
        match assembler.accept_frame(frame, Instant::now().into_std()) {
            Ok(None) => {}
            Ok(Some(envelope)) => self.deliver(envelope),
            Err(error) => {
                warn!(peer = %self.ctx.peer, error = %error, "dropping inbound message");
                let _ = self.ctx.events.send(ConnectionEvent::Diagnostic {
                    peer: self.ctx.peer,
                    error,
                });
            }
        }
    }

    fn deliver(&mut self, envelope: MessageEnvelope) {
        let envelope = match self.control.first_message.take() {
            Some(waiter) => match waiter.send(envelope) {
                Ok(()) => return,
                Err(envelope) => envelope,
            },
            None => envelope,
        };
        let _ = self.ctx.inbound.send(InboundMessage {
            peer: self.ctx.peer,
            envelope,
            received_at: Utc::now(),
        });
    }

    async fn keepalive(&mut self) -> Result<Flow, LinkError> {
        if let Some(signaling) = self.signaling.as_mut() {
            signaling.ping().await?;
        }
        Ok(Flow::Continue)
    }

    async fn teardown(&mut self) {
        self.ctx.channel_tx.send_replace(None);
        if let Some(wrapper) = self.wrapper.take() {
            wrapper.close().await;
        }
        self.assembler = None;
        self.rtc.close().await;
        if let Some(signaling) = self.signaling.take() {
            signaling.close().await;
        }
        debug!(peer = %self.ctx.peer, "attempt resources released");
    }
}

/// Drives a peer through attempts until it is closed.
///
/// A finished attempt is followed by another one after a backoff delay
/// while reconnecting is enabled both in config and for this peer.
pub(crate) async fn supervise_peer(ctx: PeerContext, mut control: Control) {
    let mut backoff = ExponentialBackoff::from_config(&ctx.config.reconnect);
    loop {
        match run_attempt(&ctx, &mut control).await {
            SessionEnd::Closed => break,
            SessionEnd::Disconnected => backoff.reset(),
            SessionEnd::Failed(error) => {
                debug!(peer = %ctx.peer, error = %error, "attempt ended without a link");
            }
        }
        if !wait_to_retry(&ctx, &mut control, &mut backoff).await {
            break;
        }
    }
    debug!(peer = %ctx.peer, "peer supervisor stopped");
}

/// Returns `true` when the next attempt should start, `false` on close.
async fn wait_to_retry(
    ctx: &PeerContext,
    control: &mut Control,
    backoff: &mut ExponentialBackoff,
) -> bool {
    let mut wake = None;
    loop {
        if wake.is_none() && control.reconnect && ctx.config.reconnect.enabled {
            let delay = backoff.next_delay();
            info!(
                peer = %ctx.peer,
                attempt = backoff.attempts(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "scheduling re-link"
            );
            wake = Some(Instant::now() + delay);
        }
        tokio::select! {
            () = sleep_until_opt(wake) => return true,
            cmd = control.commands.recv() => match cmd {
                Some(PeerCommand::EnableReconnect) => control.reconnect = true,
                Some(PeerCommand::Close) | None => return false,
            },
        }
    }
}
