//! In-process WebRTC stand-in.
//!
//! Two [`MemoryPeer`]s created from the same [`MemoryNetwork`] connect once
//! each has a local and a remote description and has been given at least one
//! remote candidate, mirroring the order of a real trickle-ICE exchange. The
//! resulting data channel pair is a bounded queue in each direction, so a
//! slow reader suspends the writer.

use super::{
    DataChannel, IceCandidate, IceGatheringState, PeerConnector, RtcError, RtcEvent, RtcEvents,
    RtcPeer, SdpType, SessionDescription,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

const SESSION_ATTR: &str = "a=memory-session:";

/// Knobs for simulating network conditions.
#[derive(Debug, Clone, Copy)]
pub struct MemoryOptions {
    /// When false, peers never pair: ICE never finds a path.
    pub reachable: bool,
    /// Whether opened channels report themselves ordered.
    pub ordered: bool,
    /// Capacity of each peer's event queue.
    pub queue_capacity: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            reachable: true,
            ordered: true,
            queue_capacity: 256,
        }
    }
}

type ChannelSlot = Arc<Mutex<Option<Arc<MemoryDataChannel>>>>;

struct Waiting {
    role: SdpType,
    events: mpsc::Sender<RtcEvent>,
    slot: ChannelSlot,
}

#[derive(Default)]
struct NetworkState {
    waiting: HashMap<String, Waiting>,
}

/// Shared rendezvous for memory peers.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    options: MemoryOptions,
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// A network with custom options.
    #[must_use]
    pub fn new(options: MemoryOptions) -> Self {
        Self {
            options,
            state: Arc::default(),
        }
    }

    /// A network on which no peer ever connects.
    #[must_use]
    pub fn unreachable() -> Self {
        Self::new(MemoryOptions {
            reachable: false,
            ..MemoryOptions::default()
        })
    }

    /// Creates a peer on this network.
    #[must_use]
    pub fn peer(&self) -> (MemoryPeer, RtcEvents) {
        let (events, rx) = mpsc::channel(self.options.queue_capacity);
        let peer = MemoryPeer {
            network: self.clone(),
            events,
            side: Mutex::new(Side::default()),
            slot: Arc::default(),
        };
        (peer, rx)
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Registers a ready peer. Returns the channel pair to announce when the
    /// counterpart is already waiting.
    fn attach(
        &self,
        session: &str,
        role: SdpType,
        events: mpsc::Sender<RtcEvent>,
        slot: ChannelSlot,
    ) -> Option<[(mpsc::Sender<RtcEvent>, Arc<MemoryDataChannel>); 2]> {
        if !self.options.reachable {
            debug!(session, "memory network unreachable, not pairing");
            return None;
        }
        let mut state = self.lock();
        match state.waiting.remove(session) {
            Some(other) if other.role != role => {
                let (mine, theirs) = MemoryDataChannel::pair(
                    session,
                    self.options.ordered,
                    events.clone(),
                    other.events.clone(),
                );
                set_slot(&slot, mine.clone());
                set_slot(&other.slot, theirs.clone());
                Some([(events, mine), (other.events, theirs)])
            }
            Some(same) => {
                state.waiting.insert(session.to_owned(), same);
                None
            }
            None => {
                state.waiting.insert(session.to_owned(), Waiting { role, events, slot });
                None
            }
        }
    }
}

fn set_slot(slot: &ChannelSlot, channel: Arc<MemoryDataChannel>) {
    *slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(channel);
}

#[async_trait]
impl PeerConnector for MemoryNetwork {
    async fn create_peer(
        &self,
        _ice_servers: &[String],
    ) -> Result<(Box<dyn RtcPeer>, RtcEvents), RtcError> {
        let (peer, events) = self.peer();
        Ok((Box::new(peer), events))
    }
}

#[derive(Default)]
struct Side {
    session: Option<String>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: usize,
    attached: bool,
    closed: bool,
}

impl Side {
    fn ready(&self) -> bool {
        self.local.is_some() && self.remote.is_some() && self.remote_candidates > 0
    }
}

/// A simulated peer connection.
pub struct MemoryPeer {
    network: MemoryNetwork,
    events: mpsc::Sender<RtcEvent>,
    side: Mutex<Side>,
    slot: ChannelSlot,
}

impl MemoryPeer {
    fn side(&self) -> MutexGuard<'_, Side> {
        self.side.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn try_attach(&self) {
        let attach = {
            let mut side = self.side();
            if side.attached || side.closed || !side.ready() {
                return;
            }
            let (Some(session), Some(local)) = (side.session.clone(), side.local.as_ref()) else {
                return;
            };
            let role = local.sdp_type;
            side.attached = true;
            (session, role)
        };
        let (session, role) = attach;
        if let Some(pair) =
            self.network
                .attach(&session, role, self.events.clone(), self.slot.clone())
        {
            debug!(session = %session, "memory peers paired, opening data channel");
            for (events, channel) in pair {
                let _ = events.send(RtcEvent::DataChannelOpen(channel)).await;
            }
        }
    }
}

fn session_of(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.strip_prefix(SESSION_ATTR))
        .map(|s| s.trim().to_owned())
}

#[async_trait]
impl RtcPeer for MemoryPeer {
    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        let mut side = self.side();
        if side.closed {
            return Err(RtcError::Closed);
        }
        let session = uuid::Uuid::new_v4().to_string();
        side.session = Some(session.clone());
        Ok(SessionDescription::offer(format!(
            "v=0\r\n{SESSION_ATTR}{session}\r\na=setup:actpass\r\n"
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let side = self.side();
        if side.closed {
            return Err(RtcError::Closed);
        }
        match (&side.remote, &side.session) {
            (Some(remote), Some(session)) if remote.sdp_type == SdpType::Offer => Ok(
                SessionDescription::answer(format!(
                    "v=0\r\n{SESSION_ATTR}{session}\r\na=setup:active\r\n"
                )),
            ),
            _ => Err(RtcError::Negotiation("no remote offer to answer".into())),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), RtcError> {
        let session = {
            let mut side = self.side();
            if side.closed {
                return Err(RtcError::Closed);
            }
            let Some(session) = session_of(&desc.sdp).or_else(|| side.session.clone()) else {
                return Err(RtcError::Negotiation("description has no session".into()));
            };
            side.session = Some(session.clone());
            side.local = Some(desc);
            session
        };

        let gathered = [
            RtcEvent::IceGatheringChanged(IceGatheringState::Gathering),
            RtcEvent::IceCandidate(IceCandidate {
                candidate: format!("candidate:1 1 udp 2122260223 memory {session} typ host"),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            }),
            RtcEvent::IceGatheringChanged(IceGatheringState::Complete),
        ];
        for event in gathered {
            self.events.send(event).await.map_err(|_| RtcError::Closed)?;
        }
        self.try_attach().await;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError> {
        {
            let mut side = self.side();
            if side.closed {
                return Err(RtcError::Closed);
            }
            let Some(session) = session_of(&desc.sdp) else {
                return Err(RtcError::Negotiation("description has no session".into()));
            };
            if side.session.as_ref().is_some_and(|s| *s != session) {
                return Err(RtcError::Negotiation("description for another session".into()));
            }
            side.session = Some(session);
            side.remote = Some(desc);
        }
        self.try_attach().await;
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), RtcError> {
        {
            let mut side = self.side();
            if side.closed {
                return Err(RtcError::Closed);
            }
            if side.remote.is_none() {
                return Err(RtcError::Negotiation(
                    "candidate before remote description".into(),
                ));
            }
            side.remote_candidates += 1;
        }
        self.try_attach().await;
        Ok(())
    }

    async fn close(&self) {
        self.side().closed = true;
        let channel = self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(channel) = channel {
            channel.close().await;
        }
    }
}

/// One end of an in-memory data channel.
#[derive(Debug)]
pub struct MemoryDataChannel {
    label: String,
    ordered: bool,
    local: mpsc::Sender<RtcEvent>,
    remote: mpsc::Sender<RtcEvent>,
    closed: Arc<AtomicBool>,
}

impl MemoryDataChannel {
    fn pair(
        label: &str,
        ordered: bool,
        a: mpsc::Sender<RtcEvent>,
        b: mpsc::Sender<RtcEvent>,
    ) -> (Arc<Self>, Arc<Self>) {
        let closed = Arc::new(AtomicBool::new(false));
        let first = Arc::new(Self {
            label: label.to_owned(),
            ordered,
            local: a.clone(),
            remote: b.clone(),
            closed: closed.clone(),
        });
        let second = Arc::new(Self {
            label: label.to_owned(),
            ordered,
            local: b,
            remote: a,
            closed,
        });
        (first, second)
    }
}

#[async_trait]
impl DataChannel for MemoryDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_ordered(&self) -> bool {
        self.ordered
    }

    fn buffered_amount(&self) -> usize {
        0
    }

    async fn drained(&self) {}

    async fn send(&self, frame: Vec<u8>) -> Result<(), RtcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RtcError::Closed);
        }
        self.remote
            .send(RtcEvent::Message(frame))
            .await
            .map_err(|_| RtcError::Closed)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.local.try_send(RtcEvent::DataChannelClosed);
        let remote = self.remote.clone();
        tokio::spawn(async move {
            let _ = remote.send(RtcEvent::DataChannelClosed).await;
        });
    }
}
