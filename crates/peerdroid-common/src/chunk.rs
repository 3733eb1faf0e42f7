//! Chunk codec for data-channel messages.
//!
//! A sealed message is carried as one `METADATA` package followed by one or
//! more `CHUNK` packages, each JSON encoded into its own data-channel frame:
//!
//! ```text
//! { "packageType": "METADATA", "messageId": "...", "hashOfMessage": "<hex sha256>",
//!   "messageByteCount": 40000, "chunkCount": 3 }
//! { "packageType": "CHUNK", "messageId": "...", "chunkIndex": 0, "chunkData": "<base64>" }
//! ```
//!
//! Receivers must not assume the metadata arrives first. [`Reassembler`]
//! buffers per message id until every index is present, verifies the hash,
//! and evicts buffers that stop receiving chunks or outgrow the per-message
//! size bound.

use crate::crypto::content_hash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

/// Chunk size used by the browser extension side of the link.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 15_441;
/// Default bound on concurrently buffered messages per peer.
pub const DEFAULT_MAX_PENDING_MESSAGES: usize = 32;
/// Default inactivity window after which a partial message is dropped.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);
/// Default bound on the size of a single reassembled message.
pub const DEFAULT_MAX_MESSAGE_BYTES: u64 = 8 * 1024 * 1024;
/// Completed message ids remembered so late duplicates are dropped.
const RECENTLY_COMPLETED: usize = 64;

/// Errors from splitting, decoding, or reassembling chunked messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    /// `max_chunk_size` was zero.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    /// The frame was not a valid JSON package.
    #[error("malformed package: {0}")]
    Malformed(String),
    /// A metadata package declared an impossible shape.
    #[error("invalid metadata for message {message_id}: {reason}")]
    InvalidMetadata {
        /// Message the metadata belongs to.
        message_id: String,
        /// What was wrong with it.
        reason: &'static str,
    },
    /// A chunk index is outside the declared chunk count.
    #[error("chunk index {index} out of range for message {message_id} ({chunk_count} chunks)")]
    IndexOutOfRange {
        /// Message the chunk belongs to.
        message_id: String,
        /// Offending index.
        index: u32,
        /// Declared chunk count.
        chunk_count: u32,
    },
    /// Too many partially received messages are buffered already.
    #[error("too many pending messages ({limit}); dropped chunk for {message_id}")]
    TooManyPending {
        /// Message whose package was dropped.
        message_id: String,
        /// Configured bound.
        limit: usize,
    },
    /// The message would exceed the per-message size bound.
    #[error("message {message_id} exceeds {limit} bytes")]
    MessageTooLarge {
        /// Offending message.
        message_id: String,
        /// Configured bound in bytes.
        limit: u64,
    },
    /// A single chunk is larger than the chunk size allows.
    #[error("chunk {index} of message {message_id} is {size} bytes, limit {limit}")]
    ChunkTooLarge {
        /// Message the chunk belongs to.
        message_id: String,
        /// Offending index.
        index: u32,
        /// Decoded chunk size.
        size: usize,
        /// Configured chunk size.
        limit: usize,
    },
    /// The reassembled bytes do not match the declared content hash.
    #[error("hash mismatch for message {message_id}")]
    HashMismatch {
        /// Message that failed verification.
        message_id: String,
    },
}

/// Describes a chunked message. Always the first package sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPackage {
    /// Identifier shared by every package of the message.
    pub message_id: String,
    /// Hex SHA-256 of the whole (sealed) message.
    pub hash_of_message: String,
    /// Total byte count of the whole message.
    pub message_byte_count: u64,
    /// Number of chunk packages that make up the message.
    pub chunk_count: u32,
}

/// One slice of a chunked message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPackage {
    /// Identifier shared by every package of the message.
    pub message_id: String,
    /// Zero-based position of this chunk.
    pub chunk_index: u32,
    /// Chunk bytes, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub chunk_data: Vec<u8>,
}

/// A single data-channel frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "packageType")]
pub enum Package {
    /// Message descriptor.
    #[serde(rename = "METADATA")]
    Metadata(MetadataPackage),
    /// Message slice.
    #[serde(rename = "CHUNK")]
    Chunk(ChunkPackage),
}

impl Package {
    /// Message id this package belongs to.
    #[must_use]
    pub fn message_id(&self) -> &str {
        match self {
            Self::Metadata(m) => &m.message_id,
            Self::Chunk(c) => &c.message_id,
        }
    }

    /// JSON-encodes the package into a frame.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::Malformed`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, ChunkError> {
        serde_json::to_vec(self).map_err(|e| ChunkError::Malformed(e.to_string()))
    }

    /// Decodes a frame. Unknown fields are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::Malformed`] for anything that is not a package.
    pub fn decode(frame: &[u8]) -> Result<Self, ChunkError> {
        serde_json::from_slice(frame).map_err(|e| ChunkError::Malformed(e.to_string()))
    }
}

/// The decomposition of one message: metadata plus ordered chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSet {
    /// Descriptor, sent first.
    pub metadata: MetadataPackage,
    /// Chunks in index order.
    pub chunks: Vec<ChunkPackage>,
}

impl ChunkSet {
    /// All packages in send order: metadata first, then chunks by index.
    pub fn packages(&self) -> impl Iterator<Item = Package> + '_ {
        std::iter::once(Package::Metadata(self.metadata.clone()))
            .chain(self.chunks.iter().cloned().map(Package::Chunk))
    }
}

/// Splits `bytes` under a freshly generated message id.
///
/// # Errors
///
/// Returns [`ChunkError::InvalidChunkSize`] if `max_chunk_size` is zero.
///
/// # Examples
///
/// ```
/// use peerdroid_common::chunk::split;
///
/// let set = split(b"hi", 1024).unwrap();
/// assert_eq!(set.metadata.chunk_count, 1);
/// assert_eq!(set.chunks[0].chunk_data, b"hi");
/// ```
pub fn split(bytes: &[u8], max_chunk_size: usize) -> Result<ChunkSet, ChunkError> {
    split_with_id(uuid::Uuid::new_v4().to_string(), bytes, max_chunk_size)
}

/// Splits `bytes` under the given message id.
///
/// A payload no larger than `max_chunk_size` (including an empty one) yields
/// exactly one chunk.
///
/// # Errors
///
/// Returns [`ChunkError::InvalidChunkSize`] if `max_chunk_size` is zero.
pub fn split_with_id(
    message_id: String,
    bytes: &[u8],
    max_chunk_size: usize,
) -> Result<ChunkSet, ChunkError> {
    if max_chunk_size == 0 {
        return Err(ChunkError::InvalidChunkSize);
    }
    let chunks: Vec<ChunkPackage> = if bytes.is_empty() {
        vec![ChunkPackage {
            message_id: message_id.clone(),
            chunk_index: 0,
            chunk_data: Vec::new(),
        }]
    } else {
        bytes
            .chunks(max_chunk_size)
            .zip(0u32..)
            .map(|(data, index)| ChunkPackage {
                message_id: message_id.clone(),
                chunk_index: index,
                chunk_data: data.to_vec(),
            })
            .collect()
    };

    #[allow(clippy::cast_possible_truncation)]
    let metadata = MetadataPackage {
        message_id,
        hash_of_message: hex::encode(content_hash(bytes)),
        message_byte_count: bytes.len() as u64,
        chunk_count: chunks.len() as u32,
    };
    Ok(ChunkSet { metadata, chunks })
}

/// Concatenates chunk data in index order.
#[must_use]
pub fn assemble(chunks: &[ChunkPackage]) -> Vec<u8> {
    let mut ordered: Vec<&ChunkPackage> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.chunk_index);
    let total = ordered.iter().map(|c| c.chunk_data.len()).sum();
    let mut out = Vec::with_capacity(total);
    for chunk in ordered {
        out.extend_from_slice(&chunk.chunk_data);
    }
    out
}

/// Checks reassembled bytes against their metadata.
///
/// # Errors
///
/// Returns [`ChunkError::HashMismatch`] if the content hash or byte count
/// differs from what the metadata declares.
pub fn verify(assembled: &[u8], metadata: &MetadataPackage) -> Result<(), ChunkError> {
    let hash = hex::encode(content_hash(assembled));
    if !hash.eq_ignore_ascii_case(&metadata.hash_of_message)
        || assembled.len() as u64 != metadata.message_byte_count
    {
        return Err(ChunkError::HashMismatch {
            message_id: metadata.message_id.clone(),
        });
    }
    Ok(())
}

/// Result of feeding one package to a [`Reassembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// More packages are needed.
    Pending,
    /// All chunks arrived and the hash verified.
    Complete {
        /// Id of the finished message.
        message_id: String,
        /// The reassembled bytes.
        bytes: Vec<u8>,
    },
}

#[derive(Debug)]
struct PendingMessage {
    metadata: Option<MetadataPackage>,
    chunks: BTreeMap<u32, Vec<u8>>,
    buffered_bytes: u64,
    last_activity: Instant,
}

impl PendingMessage {
    fn new(now: Instant) -> Self {
        Self {
            metadata: None,
            chunks: BTreeMap::new(),
            buffered_bytes: 0,
            last_activity: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.metadata
            .as_ref()
            .is_some_and(|m| self.chunks.len() == m.chunk_count as usize)
    }
}

/// Bounds applied to each message in a [`Reassembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MessageLimits {
    max_message_bytes: u64,
    max_chunk_size: usize,
    max_chunks: u64,
}

impl MessageLimits {
    fn new(max_message_bytes: u64, chunk_sizes: RangeInclusive<usize>) -> Self {
        let smallest = (*chunk_sizes.start()).max(1);
        let largest = (*chunk_sizes.end()).max(smallest);
        Self {
            max_message_bytes,
            max_chunk_size: largest,
            max_chunks: max_message_bytes.div_ceil(smallest as u64).max(1),
        }
    }

    fn check_metadata(self, metadata: &MetadataPackage) -> Result<(), ChunkError> {
        let invalid = |reason| ChunkError::InvalidMetadata {
            message_id: metadata.message_id.clone(),
            reason,
        };
        if metadata.chunk_count == 0 {
            return Err(invalid("chunk count is zero"));
        }
        let bytes = metadata.message_byte_count;
        let chunks = u64::from(metadata.chunk_count);
        if bytes > self.max_message_bytes || chunks > self.max_chunks {
            return Err(ChunkError::MessageTooLarge {
                message_id: metadata.message_id.clone(),
                limit: self.max_message_bytes,
            });
        }
        // Every chunk but an empty message's single one carries at least a
        // byte, and none carries more than the chunk size.
        if chunks < bytes.div_ceil(self.max_chunk_size as u64) || chunks > bytes.max(1) {
            return Err(invalid("chunk count does not fit byte count"));
        }
        Ok(())
    }

    fn check_chunk(self, entry: &PendingMessage, chunk: &ChunkPackage) -> Result<(), ChunkError> {
        let size = chunk.chunk_data.len();
        if size > self.max_chunk_size {
            return Err(ChunkError::ChunkTooLarge {
                message_id: chunk.message_id.clone(),
                index: chunk.chunk_index,
                size,
                limit: self.max_chunk_size,
            });
        }
        if u64::from(chunk.chunk_index) >= self.max_chunks
            || entry.buffered_bytes + size as u64 > self.max_message_bytes
        {
            return Err(ChunkError::MessageTooLarge {
                message_id: chunk.message_id.clone(),
                limit: self.max_message_bytes,
            });
        }
        Ok(())
    }
}

/// Per-peer reassembly state, keyed by message id.
///
/// Memory is bounded three ways: the number of partial messages, the size
/// of each one, and the inactivity window. Time is passed in by the caller
/// so that eviction is deterministic.
#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<String, PendingMessage>,
    completed: VecDeque<(String, Instant)>,
    max_pending: usize,
    stale_after: Duration,
    limits: MessageLimits,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING_MESSAGES, DEFAULT_STALE_AFTER)
    }
}

impl Reassembler {
    /// Creates an empty reassembler.
    #[must_use]
    pub fn new(max_pending: usize, stale_after: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            completed: VecDeque::new(),
            max_pending,
            stale_after,
            limits: MessageLimits::new(
                DEFAULT_MAX_MESSAGE_BYTES,
                DEFAULT_MAX_CHUNK_SIZE..=DEFAULT_MAX_CHUNK_SIZE,
            ),
        }
    }

    /// Bounds each message to `max_message_bytes`, sent by peers that split
    /// at a chunk size within `chunk_sizes`.
    ///
    /// Chunks larger than the range's end are refused. The range's start
    /// bounds how many chunks a message may have. A zero size is treated as
    /// one.
    #[must_use]
    pub fn with_message_limits(
        mut self,
        max_message_bytes: u64,
        chunk_sizes: RangeInclusive<usize>,
    ) -> Self {
        self.limits = MessageLimits::new(max_message_bytes, chunk_sizes);
        self
    }

    /// Number of partially received messages.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drops every buffer.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.completed.clear();
    }

    fn recently_completed(&self, message_id: &str) -> bool {
        self.completed.iter().any(|(id, _)| id == message_id)
    }

    fn remember_completed(&mut self, message_id: String, now: Instant) {
        if self.completed.len() >= RECENTLY_COMPLETED {
            self.completed.pop_front();
        }
        self.completed.push_back((message_id, now));
    }

    /// Removes buffers with no activity for longer than the inactivity
    /// window and returns their message ids.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<String> {
        let stale_after = self.stale_after;
        let mut evicted = Vec::new();
        self.pending.retain(|id, msg| {
            let keep = now.saturating_duration_since(msg.last_activity) <= stale_after;
            if !keep {
                evicted.push(id.clone());
            }
            keep
        });
        self.completed
            .retain(|(_, at)| now.saturating_duration_since(*at) <= stale_after);
        evicted
    }

    /// Feeds one package.
    ///
    /// Stale buffers are evicted first, so a late chunk for an evicted
    /// message starts a fresh buffer. Packages for a message that completed
    /// within the inactivity window are ignored. Any error other than
    /// [`ChunkError::TooManyPending`] discards that message's buffer.
    ///
    /// # Errors
    ///
    /// See [`ChunkError`].
    pub fn accept(&mut self, package: Package, now: Instant) -> Result<Progress, ChunkError> {
        self.evict_stale(now);
        let message_id = package.message_id().to_owned();
        if !self.pending.contains_key(&message_id) && self.recently_completed(&message_id) {
            return Ok(Progress::Pending);
        }

        if !self.pending.contains_key(&message_id) && self.pending.len() >= self.max_pending {
            return Err(ChunkError::TooManyPending {
                message_id,
                limit: self.max_pending,
            });
        }
        let entry = self
            .pending
            .entry(message_id.clone())
            .or_insert_with(|| PendingMessage::new(now));
        entry.last_activity = now;

        let limits = self.limits;
        let checked = match package {
            Package::Metadata(metadata) => Self::accept_metadata(entry, metadata, limits),
            Package::Chunk(chunk) => Self::accept_chunk(entry, chunk, limits),
        };
        if let Err(e) = checked {
            self.pending.remove(&message_id);
            return Err(e);
        }

        if !entry.is_complete() {
            return Ok(Progress::Pending);
        }
        let Some(done) = self.pending.remove(&message_id) else {
            return Ok(Progress::Pending);
        };
        let Some(metadata) = done.metadata else {
            return Ok(Progress::Pending);
        };
        let total = done.chunks.values().map(Vec::len).sum();
        let mut bytes = Vec::with_capacity(total);
        for data in done.chunks.values() {
            bytes.extend_from_slice(data);
        }
        verify(&bytes, &metadata)?;
        self.remember_completed(message_id.clone(), now);
        Ok(Progress::Complete { message_id, bytes })
    }

    fn accept_metadata(
        entry: &mut PendingMessage,
        metadata: MetadataPackage,
        limits: MessageLimits,
    ) -> Result<(), ChunkError> {
        limits.check_metadata(&metadata)?;
        if let Some(known) = &entry.metadata {
            if *known != metadata {
                return Err(ChunkError::InvalidMetadata {
                    message_id: metadata.message_id,
                    reason: "conflicting metadata",
                });
            }
            return Ok(());
        }
        if let Some((&index, _)) = entry.chunks.last_key_value() {
            if index >= metadata.chunk_count {
                return Err(ChunkError::IndexOutOfRange {
                    message_id: metadata.message_id,
                    index,
                    chunk_count: metadata.chunk_count,
                });
            }
        }
        if entry.buffered_bytes > metadata.message_byte_count {
            return Err(ChunkError::InvalidMetadata {
                message_id: metadata.message_id,
                reason: "byte count below buffered chunks",
            });
        }
        entry.metadata = Some(metadata);
        Ok(())
    }

    fn accept_chunk(
        entry: &mut PendingMessage,
        chunk: ChunkPackage,
        limits: MessageLimits,
    ) -> Result<(), ChunkError> {
        if entry.chunks.contains_key(&chunk.chunk_index) {
            // Duplicates keep the first copy.
            return Ok(());
        }
        limits.check_chunk(entry, &chunk)?;
        if let Some(metadata) = &entry.metadata {
            if chunk.chunk_index >= metadata.chunk_count {
                return Err(ChunkError::IndexOutOfRange {
                    message_id: chunk.message_id,
                    index: chunk.chunk_index,
                    chunk_count: metadata.chunk_count,
                });
            }
        }
        entry.buffered_bytes += chunk.chunk_data.len() as u64;
        entry.chunks.insert(chunk.chunk_index, chunk.chunk_data);
        Ok(())
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(r: &mut Reassembler, set: &ChunkSet, now: Instant) -> Progress {
        let mut last = Progress::Pending;
        for package in set.packages() {
            last = r.accept(package, now).unwrap();
        }
        last
    }

    #[test]
    fn test_small_message_is_one_chunk() {
        let set = split(b"hi", 1024).unwrap();
        assert_eq!(set.metadata.chunk_count, 1);
        assert_eq!(set.chunks.len(), 1);
        assert_eq!(assemble(&set.chunks), b"hi");
        verify(b"hi", &set.metadata).unwrap();
    }

    #[test]
    fn test_oversized_message_splits_into_three() {
        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let set = split(&payload, DEFAULT_MAX_CHUNK_SIZE).unwrap();
        assert_eq!(set.metadata.chunk_count, 3);
        assert_eq!(set.metadata.message_byte_count, 40_000);
        assert_eq!(set.chunks[0].chunk_data.len(), 15_441);
        assert_eq!(set.chunks[2].chunk_data.len(), 40_000 - 2 * 15_441);

        let mut r = Reassembler::default();
        match feed_all(&mut r, &set, Instant::now()) {
            Progress::Complete { bytes, .. } => assert_eq!(bytes, payload),
            Progress::Pending => panic!("expected completion"),
        }
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let set = split(&[7u8; 30], 10).unwrap();
        assert_eq!(set.metadata.chunk_count, 3);
        assert!(set.chunks.iter().all(|c| c.chunk_data.len() == 10));
    }

    #[test]
    fn test_empty_payload_is_one_empty_chunk() {
        let set = split(b"", 16).unwrap();
        assert_eq!(set.metadata.chunk_count, 1);
        assert!(set.chunks[0].chunk_data.is_empty());
        let mut r = Reassembler::default();
        assert_eq!(
            feed_all(&mut r, &set, Instant::now()),
            Progress::Complete {
                message_id: set.metadata.message_id.clone(),
                bytes: Vec::new()
            }
        );
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert_eq!(split(b"abc", 0), Err(ChunkError::InvalidChunkSize));
    }

    #[test]
    fn test_packages_are_metadata_first_then_index_order() {
        let set = split(&[1u8; 25], 10).unwrap();
        let packages: Vec<Package> = set.packages().collect();
        assert!(matches!(packages[0], Package::Metadata(_)));
        for (i, p) in packages[1..].iter().enumerate() {
            match p {
                Package::Chunk(c) => assert_eq!(c.chunk_index as usize, i),
                Package::Metadata(_) => panic!("metadata after chunks"),
            }
        }
    }

    #[test]
    fn test_wire_format_field_names() {
        let set = split_with_id("m-1".into(), b"hello", 1024).unwrap();
        let meta: serde_json::Value =
            serde_json::from_slice(&Package::Metadata(set.metadata.clone()).encode().unwrap())
                .unwrap();
        assert_eq!(meta["packageType"], "METADATA");
        assert_eq!(meta["messageId"], "m-1");
        assert_eq!(meta["messageByteCount"], 5);
        assert_eq!(meta["chunkCount"], 1);
        assert_eq!(
            meta["hashOfMessage"],
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let chunk: serde_json::Value =
            serde_json::from_slice(&Package::Chunk(set.chunks[0].clone()).encode().unwrap())
                .unwrap();
        assert_eq!(chunk["packageType"], "CHUNK");
        assert_eq!(chunk["chunkIndex"], 0);
        assert_eq!(chunk["chunkData"], "aGVsbG8=");
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let frame = br#"{"packageType":"CHUNK","messageId":"x","chunkIndex":2,"chunkData":"AQI=","extra":true}"#;
        let package = Package::decode(frame).unwrap();
        assert_eq!(
            package,
            Package::Chunk(ChunkPackage {
                message_id: "x".into(),
                chunk_index: 2,
                chunk_data: vec![1, 2],
            })
        );
    }

    #[test]
    fn test_decode_rejects_bad_base64_and_unknown_type() {
        let bad_b64 = br#"{"packageType":"CHUNK","messageId":"x","chunkIndex":0,"chunkData":"!!"}"#;
        assert!(matches!(Package::decode(bad_b64), Err(ChunkError::Malformed(_))));
        let bad_type = br#"{"packageType":"RECEIPT","messageId":"x"}"#;
        assert!(matches!(Package::decode(bad_type), Err(ChunkError::Malformed(_))));
    }

    #[test]
    fn test_metadata_after_chunks_still_completes() {
        let set = split(&[9u8; 50], 20).unwrap();
        let mut r = Reassembler::default();
        let now = Instant::now();
        for chunk in &set.chunks {
            assert_eq!(r.accept(Package::Chunk(chunk.clone()), now).unwrap(), Progress::Pending);
        }
        let done = r.accept(Package::Metadata(set.metadata.clone()), now).unwrap();
        assert!(matches!(done, Progress::Complete { bytes, .. } if bytes == vec![9u8; 50]));
    }

    #[test]
    fn test_out_of_order_chunks_complete() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let set = split(&payload, 100).unwrap();
        let mut r = Reassembler::default();
        let now = Instant::now();
        r.accept(Package::Chunk(set.chunks[2].clone()), now).unwrap();
        r.accept(Package::Metadata(set.metadata.clone()), now).unwrap();
        r.accept(Package::Chunk(set.chunks[0].clone()), now).unwrap();
        let done = r.accept(Package::Chunk(set.chunks[1].clone()), now).unwrap();
        assert!(matches!(done, Progress::Complete { bytes, .. } if bytes == payload));
    }

    #[test]
    fn test_duplicate_chunk_is_idempotent() {
        let set = split(&[3u8; 40], 20).unwrap();
        let mut r = Reassembler::default();
        let now = Instant::now();
        r.accept(Package::Metadata(set.metadata.clone()), now).unwrap();
        r.accept(Package::Chunk(set.chunks[0].clone()), now).unwrap();
        assert_eq!(
            r.accept(Package::Chunk(set.chunks[0].clone()), now).unwrap(),
            Progress::Pending
        );
        let done = r.accept(Package::Chunk(set.chunks[1].clone()), now).unwrap();
        assert!(matches!(done, Progress::Complete { bytes, .. } if bytes == vec![3u8; 40]));
    }

    #[test]
    fn test_zero_chunk_count_metadata_rejected() {
        let mut r = Reassembler::default();
        let metadata = MetadataPackage {
            message_id: "m".into(),
            hash_of_message: String::new(),
            message_byte_count: 0,
            chunk_count: 0,
        };
        let err = r.accept(Package::Metadata(metadata), Instant::now()).unwrap_err();
        assert!(matches!(err, ChunkError::InvalidMetadata { .. }));
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_chunk_index_beyond_count_discards_buffer() {
        let set = split(&[1u8; 10], 5).unwrap();
        let mut r = Reassembler::default();
        let now = Instant::now();
        r.accept(Package::Metadata(set.metadata.clone()), now).unwrap();
        let rogue = ChunkPackage {
            message_id: set.metadata.message_id.clone(),
            chunk_index: 7,
            chunk_data: vec![0],
        };
        let err = r.accept(Package::Chunk(rogue), now).unwrap_err();
        assert!(matches!(err, ChunkError::IndexOutOfRange { index: 7, .. }));
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_altered_chunk_yields_hash_mismatch() {
        let set = split(b"the quick brown fox", 5).unwrap();
        let mut chunks = set.chunks.clone();
        chunks[1].chunk_data[0] ^= 0x01;
        let err = verify(&assemble(&chunks), &set.metadata).unwrap_err();
        assert_eq!(
            err,
            ChunkError::HashMismatch {
                message_id: set.metadata.message_id.clone()
            }
        );

        let mut r = Reassembler::default();
        let now = Instant::now();
        r.accept(Package::Metadata(set.metadata.clone()), now).unwrap();
        let mut last = Ok(Progress::Pending);
        for chunk in chunks {
            last = r.accept(Package::Chunk(chunk), now);
        }
        assert!(matches!(last, Err(ChunkError::HashMismatch { .. })));
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_pending_bound_drops_new_messages() {
        let mut r = Reassembler::new(2, Duration::from_secs(60));
        let now = Instant::now();
        for id in ["a", "b"] {
            let set = split_with_id(id.into(), &[0u8; 20], 10).unwrap();
            r.accept(Package::Chunk(set.chunks[0].clone()), now).unwrap();
        }
        let set = split_with_id("c".into(), &[0u8; 20], 10).unwrap();
        let err = r.accept(Package::Chunk(set.chunks[0].clone()), now).unwrap_err();
        assert!(matches!(err, ChunkError::TooManyPending { limit: 2, .. }));
        assert_eq!(r.pending_count(), 2);
    }

    #[test]
    fn test_stale_buffer_evicted_and_late_chunk_starts_fresh() {
        let window = Duration::from_secs(30);
        let mut r = Reassembler::new(8, window);
        let set = split(&[5u8; 30], 10).unwrap();
        let start = Instant::now();

        r.accept(Package::Metadata(set.metadata.clone()), start).unwrap();
        r.accept(Package::Chunk(set.chunks[0].clone()), start).unwrap();
        r.accept(Package::Chunk(set.chunks[1].clone()), start).unwrap();

        let later = start + window + Duration::from_secs(1);
        assert_eq!(r.evict_stale(later), vec![set.metadata.message_id.clone()]);
        assert_eq!(r.pending_count(), 0);

        // The last chunk alone cannot complete: earlier chunks and metadata are gone.
        let progress = r.accept(Package::Chunk(set.chunks[2].clone()), later).unwrap();
        assert_eq!(progress, Progress::Pending);
        assert_eq!(r.pending_count(), 1);
    }

    #[test]
    fn test_activity_refreshes_inactivity_window() {
        let window = Duration::from_secs(10);
        let mut r = Reassembler::new(8, window);
        let set = split(&[5u8; 30], 10).unwrap();
        let start = Instant::now();
        r.accept(Package::Chunk(set.chunks[0].clone()), start).unwrap();
        let mid = start + Duration::from_secs(8);
        r.accept(Package::Chunk(set.chunks[1].clone()), mid).unwrap();
        assert!(r.evict_stale(start + Duration::from_secs(15)).is_empty());
        let done = r
            .accept(Package::Metadata(set.metadata.clone()), start + Duration::from_secs(16))
            .unwrap();
        assert_eq!(done, Progress::Pending);
        let done = r
            .accept(Package::Chunk(set.chunks[2].clone()), start + Duration::from_secs(17))
            .unwrap();
        assert!(matches!(done, Progress::Complete { .. }));
    }

    #[test]
    fn test_chunk_flood_without_metadata_is_bounded() {
        // 64 KiB messages in 1 KiB chunks: at most 64 chunks per message.
        let mut r =
            Reassembler::new(1, Duration::from_secs(60)).with_message_limits(64 * 1024, 1024..=1024);
        let now = Instant::now();
        let mut accepted = 0u32;
        let mut rejected = None;
        for i in 0..100_000u32 {
            let chunk = ChunkPackage {
                message_id: "flood".into(),
                chunk_index: i * 7 + 3,
                chunk_data: vec![0xAB; 1024],
            };
            match r.accept(Package::Chunk(chunk), now) {
                Ok(Progress::Pending) => accepted += 1,
                Ok(Progress::Complete { .. }) => panic!("flood cannot complete"),
                Err(e) => {
                    rejected = Some(e);
                    break;
                }
            }
        }
        assert!(accepted < 64, "accepted {accepted} chunks");
        assert!(matches!(
            rejected,
            Some(ChunkError::MessageTooLarge { ref message_id, limit: 65_536 }) if message_id == "flood"
        ));
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_chunk_flood_under_default_limits_stays_within_message_bound() {
        let mut r = Reassembler::new(1, Duration::from_secs(60));
        let now = Instant::now();
        let mut buffered = 0u64;
        for i in 0..100_000u32 {
            let chunk = ChunkPackage {
                message_id: "flood".into(),
                chunk_index: i * 7 + 3,
                chunk_data: vec![0xAB; 1024],
            };
            if r.accept(Package::Chunk(chunk), now).is_err() {
                break;
            }
            buffered += 1024;
        }
        assert!(buffered <= DEFAULT_MAX_MESSAGE_BYTES);
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_oversized_chunk_discards_buffer() {
        let mut r = Reassembler::default().with_message_limits(1024, 16..=16);
        let now = Instant::now();
        let ok = ChunkPackage {
            message_id: "m".into(),
            chunk_index: 0,
            chunk_data: vec![1; 16],
        };
        r.accept(Package::Chunk(ok), now).unwrap();
        let big = ChunkPackage {
            message_id: "m".into(),
            chunk_index: 1,
            chunk_data: vec![1; 17],
        };
        let err = r.accept(Package::Chunk(big), now).unwrap_err();
        assert!(matches!(err, ChunkError::ChunkTooLarge { index: 1, size: 17, limit: 16, .. }));
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_metadata_beyond_message_limit_rejected() {
        let mut r = Reassembler::default().with_message_limits(1024, 16..=16);
        let now = Instant::now();
        let huge = MetadataPackage {
            message_id: "huge".into(),
            hash_of_message: String::new(),
            message_byte_count: 1 << 40,
            chunk_count: 1,
        };
        let err = r.accept(Package::Metadata(huge), now).unwrap_err();
        assert!(matches!(err, ChunkError::MessageTooLarge { limit: 1024, .. }));

        let many = MetadataPackage {
            message_id: "many".into(),
            hash_of_message: String::new(),
            message_byte_count: 1000,
            chunk_count: u32::MAX,
        };
        let err = r.accept(Package::Metadata(many), now).unwrap_err();
        assert!(matches!(err, ChunkError::MessageTooLarge { .. }));
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_metadata_count_must_fit_byte_count() {
        let mut r = Reassembler::default().with_message_limits(1024, 16..=16);
        let now = Instant::now();
        for (bytes, count) in [(100, 2), (3, 4)] {
            let metadata = MetadataPackage {
                message_id: format!("m-{bytes}"),
                hash_of_message: String::new(),
                message_byte_count: bytes,
                chunk_count: count,
            };
            let err = r.accept(Package::Metadata(metadata), now).unwrap_err();
            assert!(matches!(err, ChunkError::InvalidMetadata { .. }), "{bytes}/{count}");
        }
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_default_limits_accept_full_size_message() {
        let limit = usize::try_from(DEFAULT_MAX_MESSAGE_BYTES).unwrap();
        let payload = vec![0x5Au8; limit];
        let set = split(&payload, DEFAULT_MAX_CHUNK_SIZE).unwrap();
        let mut r = Reassembler::default();
        assert!(matches!(feed_all(&mut r, &set, Instant::now()), Progress::Complete { .. }));
    }

    #[test]
    fn test_late_duplicate_after_completion_is_dropped() {
        let set = split(&[4u8; 30], 10).unwrap();
        let mut r = Reassembler::default();
        let now = Instant::now();
        assert!(matches!(feed_all(&mut r, &set, now), Progress::Complete { .. }));

        for package in set.packages() {
            assert_eq!(r.accept(package, now).unwrap(), Progress::Pending);
        }
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_late_duplicates_do_not_crowd_out_new_messages() {
        let mut r = Reassembler::new(1, Duration::from_secs(60));
        let now = Instant::now();
        let first = split(&[1u8; 20], 10).unwrap();
        feed_all(&mut r, &first, now);
        r.accept(Package::Chunk(first.chunks[0].clone()), now).unwrap();

        let second = split(&[2u8; 20], 10).unwrap();
        assert!(matches!(feed_all(&mut r, &second, now), Progress::Complete { .. }));
    }

    #[test]
    fn test_completed_ids_forgotten_after_window() {
        let window = Duration::from_secs(10);
        let mut r = Reassembler::new(8, window);
        let set = split(&[6u8; 20], 10).unwrap();
        let start = Instant::now();
        feed_all(&mut r, &set, start);

        let later = start + window + Duration::from_secs(1);
        r.accept(Package::Chunk(set.chunks[0].clone()), later).unwrap();
        assert_eq!(r.pending_count(), 1);
    }
}
