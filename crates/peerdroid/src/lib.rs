//! Encrypted wallet-to-extension peer link.
//!
//! A [`Registry`] links peers from a shared secret: it joins a signaling
//! relay session, answers the extension's WebRTC offer, and then exchanges
//! AES-GCM sealed, chunked JSON envelopes over the resulting data channel.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Exponential backoff with jitter for re-linking.
pub mod backoff;
/// Data channel wrapper: sealing, chunking and reassembly per peer.
pub mod channel;
/// CLI parsing and TOML configuration.
pub mod config;
/// Error taxonomy of the peer link.
pub mod error;
/// Ed25519 link identity of the wallet.
pub mod keypair;
/// Link payload parsing and the link handshake.
pub mod link;
/// Per-peer connection state machine and supervisor.
pub mod orchestrator;
/// Connection registry, the public surface.
pub mod registry;
/// WebRTC capability seam and an in-memory implementation.
pub mod rtc;
/// WebSocket signaling relay client.
pub mod signaling;
/// Persistence of linked peers.
pub mod store;
/// Peer ids, envelopes and events.
pub mod types;

pub use error::LinkError;
pub use orchestrator::PeerState;
pub use registry::{PeerSummary, Registry};
pub use types::{ConnectionEvent, InboundMessage, MessageEnvelope, PeerId};
