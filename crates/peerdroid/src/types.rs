//! Identifiers, envelopes and events exchanged with calling code.

use crate::error::LinkError;
use crate::orchestrator::PeerState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable identifier of a linked peer, the routing key of the registry.
///
/// Minted fresh for every new link, so an id is never reused after its peer
/// is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Mints a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unit of application traffic: a correlation id plus a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// Correlates requests with responses.
    pub id: String,
    /// Application payload.
    pub payload: serde_json::Value,
}

impl MessageEnvelope {
    /// Wraps a payload under a fresh id.
    #[must_use]
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
        }
    }

    /// Wraps a payload under a caller-chosen id, e.g. when answering a request.
    #[must_use]
    pub fn with_id(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// An envelope received from a peer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Originating peer.
    pub peer: PeerId,
    /// The decrypted, verified envelope.
    pub envelope: MessageEnvelope,
    /// Local receive time.
    pub received_at: DateTime<Utc>,
}

/// Observable change in a peer's link.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The peer's state machine moved.
    StateChanged {
        /// Affected peer.
        peer: PeerId,
        /// New state.
        state: PeerState,
    },
    /// A single message was lost to a steady-state failure; the link survives.
    Diagnostic {
        /// Affected peer.
        peer: PeerId,
        /// What went wrong.
        error: LinkError,
    },
    /// The peer was removed from the registry.
    Unlinked {
        /// Removed peer.
        peer: PeerId,
    },
}

impl ConnectionEvent {
    /// Peer the event concerns.
    #[must_use]
    pub const fn peer(&self) -> PeerId {
        match self {
            Self::StateChanged { peer, .. }
            | Self::Diagnostic { peer, .. }
            | Self::Unlinked { peer } => *peer,
        }
    }
}
