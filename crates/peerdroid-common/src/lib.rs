//! Shared building blocks for the peerdroid peer link.
//!
//! This crate provides:
//! - AES-256-GCM sealing, HKDF key derivation and content hashing ([`crypto`])
//! - The METADATA/CHUNK data-channel codec and reassembly ([`chunk`])
//! - Signaling relay wire types ([`signal`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod chunk;
pub mod crypto;
pub mod signal;

pub use chunk::{ChunkError, ChunkSet, Package, Reassembler};
pub use crypto::{ConnectionSecret, CryptoError, EncryptionKey, KdfVersion};
