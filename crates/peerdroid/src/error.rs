use crate::types::PeerId;
use peerdroid_common::chunk::ChunkError;
use peerdroid_common::crypto::CryptoError;
use thiserror::Error;

/// Errors surfaced by the peer link.
///
/// Cloneable so that steady-state failures can be published as diagnostics
/// on the connection event stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The link did not reach `Connected` (and pass the handshake) in time.
    #[error("link timed out")]
    LinkTimeout,
    /// The remote handshake did not match the expected link.
    #[error("link rejected: {0}")]
    LinkRejected(String),
    /// The peer is unknown or not in the `Connected` state.
    #[error("peer {0} is not connected")]
    PeerNotConnected(PeerId),
    /// A message failed to decrypt.
    #[error("authentication failed for message {message_id}")]
    AuthenticationFailed {
        /// Message that failed to open.
        message_id: String,
    },
    /// A reassembled message did not match its declared hash.
    #[error("hash mismatch for message {message_id}")]
    HashMismatch {
        /// Message that failed verification.
        message_id: String,
    },
    /// Relay unreachable, closed, or sent something unusable.
    #[error("signaling error: {0}")]
    Signaling(String),
    /// Offer/answer or ICE negotiation did not complete.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    /// A frame could not be decoded or reassembled.
    #[error("chunk error: {0}")]
    Chunk(ChunkError),
    /// Sealing an outbound message failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    /// A decrypted message was not a valid envelope.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    /// The WebRTC capability reported an error.
    #[error("rtc error: {0}")]
    Rtc(String),
    /// The peer-record store failed.
    #[error("store error: {0}")]
    Store(String),
    /// The operation was abandoned because the peer was torn down.
    #[error("cancelled")]
    Cancelled,
}

impl From<ChunkError> for LinkError {
    fn from(e: ChunkError) -> Self {
        match e {
            ChunkError::HashMismatch { message_id } => Self::HashMismatch { message_id },
            other => Self::Chunk(other),
        }
    }
}

impl From<crate::store::StoreError> for LinkError {
    fn from(e: crate::store::StoreError) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<crate::rtc::RtcError> for LinkError {
    fn from(e: crate::rtc::RtcError) -> Self {
        Self::Rtc(e.to_string())
    }
}
