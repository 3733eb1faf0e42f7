//! Per-peer message façade over an open data channel.
//!
//! Outbound: envelope → JSON → AES-GCM → METADATA + CHUNK frames, pushed in
//! index order with backpressure. Inbound: frames → reassembly → hash check
//! → decrypt → envelope.

use crate::config::ChunkingConfig;
use crate::error::LinkError;
use crate::orchestrator::PeerState;
use crate::rtc::DataChannel;
use crate::types::{MessageEnvelope, PeerId};
use peerdroid_common::chunk::{self, Package, Progress, Reassembler, DEFAULT_MAX_CHUNK_SIZE};
use peerdroid_common::crypto::{self, EncryptionKey};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Sending half of one peer's link. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DataChannelWrapper {
    peer: PeerId,
    key: Arc<EncryptionKey>,
    channel: Arc<dyn DataChannel>,
    state: watch::Receiver<PeerState>,
    max_chunk_size: usize,
    max_buffered_bytes: usize,
}

impl DataChannelWrapper {
    /// Wraps an open channel. Sends are accepted only while `state` reads
    /// [`PeerState::Connected`].
    #[must_use]
    pub fn new(
        peer: PeerId,
        key: Arc<EncryptionKey>,
        channel: Arc<dyn DataChannel>,
        state: watch::Receiver<PeerState>,
        limits: &ChunkingConfig,
    ) -> Self {
        Self {
            peer,
            key,
            channel,
            state,
            max_chunk_size: limits.max_chunk_size,
            max_buffered_bytes: limits.max_buffered_bytes,
        }
    }

    /// Peer this wrapper sends to.
    #[must_use]
    pub const fn peer(&self) -> PeerId {
        self.peer
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == PeerState::Connected
    }

    /// Seals and sends one envelope.
    ///
    /// Suspends while the channel's outbound buffer is above the configured
    /// threshold. Nothing is queued for later: if the link leaves
    /// `Connected` before every frame is pushed, the send fails.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::PeerNotConnected`] when the link is not (or stops
    /// being) connected, and [`LinkError::Crypto`] or [`LinkError::Chunk`]
    /// if the envelope cannot be sealed or framed.
    pub async fn send(&self, envelope: &MessageEnvelope) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::PeerNotConnected(self.peer));
        }
        let plaintext = serde_json::to_vec(envelope)
            .map_err(|e| LinkError::InvalidEnvelope(e.to_string()))?;
        let sealed = crypto::encrypt(&plaintext, &self.key)?;
        let set = chunk::split(&sealed, self.max_chunk_size)?;
        debug!(
            peer = %self.peer,
            message_id = %set.metadata.message_id,
            chunks = set.metadata.chunk_count,
            "sending message"
        );

        for package in set.packages() {
            let frame = package.encode()?;
            self.wait_for_room().await?;
            self.channel
                .send(frame)
                .await
                .map_err(|_| LinkError::PeerNotConnected(self.peer))?;
        }
        Ok(())
    }

    async fn wait_for_room(&self) -> Result<(), LinkError> {
        let mut state = self.state.clone();
        while self.channel.buffered_amount() >= self.max_buffered_bytes {
            tokio::select! {
                () = self.channel.drained() => {}
                changed = state.changed() => {
                    if changed.is_err() || *state.borrow() != PeerState::Connected {
                        return Err(LinkError::PeerNotConnected(self.peer));
                    }
                }
            }
        }
        if self.is_connected() {
            Ok(())
        } else {
            Err(LinkError::PeerNotConnected(self.peer))
        }
    }

    /// Closes the underlying channel.
    pub async fn close(&self) {
        self.channel.close().await;
    }
}

/// Receiving half of one peer's link. Owns the peer's reassembly buffers.
#[derive(Debug)]
pub struct InboundAssembler {
    peer: PeerId,
    key: Arc<EncryptionKey>,
    reassembler: Reassembler,
}

impl InboundAssembler {
    /// Creates an assembler with the configured buffer bound, message size
    /// bound and inactivity window.
    ///
    /// Inbound chunks may be as large as the extension's fixed chunk size
    /// even when the outbound size is configured lower.
    #[must_use]
    pub fn new(peer: PeerId, key: Arc<EncryptionKey>, limits: &ChunkingConfig) -> Self {
        let smallest = limits.max_chunk_size.min(DEFAULT_MAX_CHUNK_SIZE);
        let largest = limits.max_chunk_size.max(DEFAULT_MAX_CHUNK_SIZE);
        Self {
            peer,
            key,
            reassembler: Reassembler::new(
                limits.max_pending_messages,
                Duration::from_secs(limits.stale_after_secs),
            )
            .with_message_limits(limits.max_message_bytes, smallest..=largest),
        }
    }

    /// Feeds one raw frame. Returns the envelope once its message completes.
    ///
    /// A failed message has its buffer discarded; the assembler stays usable
    /// for the next one.
    ///
    /// # Errors
    ///
    /// [`LinkError::Chunk`] for undecodable frames or buffer violations,
    /// [`LinkError::HashMismatch`], [`LinkError::AuthenticationFailed`] and
    /// [`LinkError::InvalidEnvelope`] for the later stages.
    pub fn accept_frame(
        &mut self,
        frame: &[u8],
        now: Instant,
    ) -> Result<Option<MessageEnvelope>, LinkError> {
        let package = Package::decode(frame)?;
        let (message_id, bytes) = match self.reassembler.accept(package, now)? {
            Progress::Pending => return Ok(None),
            Progress::Complete { message_id, bytes } => (message_id, bytes),
        };
        let plaintext = crypto::decrypt(&bytes, &self.key).map_err(|_| {
            LinkError::AuthenticationFailed {
                message_id: message_id.clone(),
            }
        })?;
        let envelope: MessageEnvelope = serde_json::from_slice(&plaintext)
            .map_err(|e| LinkError::InvalidEnvelope(format!("message {message_id}: {e}")))?;
        debug!(peer = %self.peer, %message_id, "message reassembled");
        Ok(Some(envelope))
    }

    /// Drops buffers that saw no frame within the inactivity window.
    pub fn evict_stale(&mut self, now: Instant) {
        for message_id in self.reassembler.evict_stale(now) {
            warn!(peer = %self.peer, %message_id, "evicted stale partial message");
        }
    }

    /// Number of partially received messages.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.reassembler.pending_count()
    }
}
