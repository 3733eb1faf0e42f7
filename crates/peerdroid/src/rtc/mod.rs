//! WebRTC capability seam.
//!
//! The link never talks to a WebRTC stack directly. It drives one through
//! these traits: negotiate descriptions and candidates on an [`RtcPeer`],
//! react to [`RtcEvent`]s, and move frames over a [`DataChannel`].
//!
//! [`memory`] provides an in-process implementation for tests and
//! simulations.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;

/// ICE candidate as exchanged over signaling.
pub use peerdroid_common::signal::CandidatePayload as IceCandidate;

/// Errors reported by the WebRTC capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtcError {
    /// The peer connection or channel is closed.
    #[error("closed")]
    Closed,
    /// A negotiation step was invalid in the current state.
    #[error("negotiation: {0}")]
    Negotiation(String),
    /// Engine-specific failure.
    #[error("engine: {0}")]
    Engine(String),
}

/// Offer or answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    /// Sent by the initiating side.
    Offer,
    /// Sent in response to an offer.
    Answer,
}

/// A session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    /// Offer or answer.
    pub sdp_type: SdpType,
    /// SDP text.
    pub sdp: String,
}

impl SessionDescription {
    /// An offer.
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// An answer.
    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Local candidate gathering progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    /// Not started.
    New,
    /// Collecting candidates.
    Gathering,
    /// Done.
    Complete,
}

/// Something the WebRTC stack reports about one peer connection.
#[derive(Debug, Clone)]
pub enum RtcEvent {
    /// A local candidate to trickle to the remote side.
    IceCandidate(IceCandidate),
    /// Gathering progress.
    IceGatheringChanged(IceGatheringState),
    /// The data channel is open.
    DataChannelOpen(Arc<dyn DataChannel>),
    /// A frame arrived on the data channel.
    Message(Vec<u8>),
    /// The data channel closed.
    DataChannelClosed,
    /// The peer connection failed.
    ConnectionFailed(String),
}

/// Receiving half of a peer connection's event queue.
pub type RtcEvents = mpsc::Receiver<RtcEvent>;

/// An open data channel.
#[async_trait]
pub trait DataChannel: Send + Sync + fmt::Debug {
    /// Channel label.
    fn label(&self) -> &str;

    /// Whether the channel delivers in order and reliably. The chunk codec
    /// depends on it.
    fn is_ordered(&self) -> bool;

    /// Bytes queued locally and not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    /// Resolves once the outbound buffer has fallen below the low-water mark.
    async fn drained(&self);

    /// Queues one frame.
    async fn send(&self, frame: Vec<u8>) -> Result<(), RtcError>;

    /// Closes the channel. Idempotent.
    async fn close(&self);
}

/// One peer connection.
#[async_trait]
pub trait RtcPeer: Send + Sync {
    /// Creates an offer.
    async fn create_offer(&self) -> Result<SessionDescription, RtcError>;

    /// Creates an answer to the remote offer.
    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;

    /// Applies a local description; starts candidate gathering.
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), RtcError>;

    /// Applies the remote description.
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError>;

    /// Adds a remote candidate. Fails before the remote description is set.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;

    /// Closes the connection and its channels. Idempotent.
    async fn close(&self);
}

/// Factory for peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Creates a peer connection configured with the given STUN/TURN servers.
    async fn create_peer(
        &self,
        ice_servers: &[String],
    ) -> Result<(Box<dyn RtcPeer>, RtcEvents), RtcError>;
}
