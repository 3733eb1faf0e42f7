//! Link payloads (the QR content) and the first-message handshake.

use crate::error::LinkError;
use crate::keypair::WalletIdentity;
use crate::store::LinkPurpose;
use crate::types::MessageEnvelope;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use peerdroid_common::crypto::ConnectionSecret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of a link password in bytes.
pub const PASSWORD_LEN: usize = 32;

/// Why a link payload was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkPayloadError {
    /// A bare hex password from before payloads carried a key and purpose.
    #[error("link code from an older extension version, update the extension")]
    OldQrVersion,
    /// Not a link payload, or a field is malformed.
    #[error("invalid link code: {0}")]
    InvalidQr(String),
    /// The signature does not prove possession of the advertised key.
    #[error("link code signature does not verify")]
    InvalidSignature,
    /// A purpose this wallet does not handle.
    #[error("unknown link purpose {0:?}")]
    UnknownPurpose(String),
}

/// A parsed, verified link payload.
#[derive(Debug, Clone)]
pub struct LinkPayload {
    /// Shared secret both sides derive the link key from.
    pub secret: ConnectionSecret,
    /// The extension's Ed25519 key, expected again in its handshake.
    pub remote_public_key: VerifyingKey,
    /// Link purpose.
    pub purpose: LinkPurpose,
}

impl LinkPayload {
    /// Relay session id for this link.
    #[must_use]
    pub fn connection_id(&self) -> String {
        self.secret.connection_id()
    }

    /// Remote key as hex.
    #[must_use]
    pub fn remote_public_key_hex(&self) -> String {
        hex::encode(self.remote_public_key.as_bytes())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPayload {
    password: String,
    public_key: String,
    purpose: String,
    signature: String,
}

/// The bytes both sides sign to prove they hold the link secret:
/// `SHA-256("L" || secret)`.
#[must_use]
pub fn link_message(secret: &ConnectionSecret) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"L");
    hasher.update(secret.expose().as_bytes());
    hasher.finalize().into()
}

fn is_password(s: &str) -> bool {
    s.len() == PASSWORD_LEN * 2 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn parse_key(hex_key: &str) -> Option<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(hex_key).ok()?.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

fn parse_signature(hex_sig: &str) -> Option<Signature> {
    let bytes: [u8; 64] = hex::decode(hex_sig).ok()?.try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}

/// Parses and verifies a scanned link payload.
///
/// # Errors
///
/// See [`LinkPayloadError`].
///
/// # Examples
///
/// ```
/// use peerdroid::link::{parse_link_payload, LinkPayloadError};
///
/// let old = "ab".repeat(32);
/// assert_eq!(parse_link_payload(&old).unwrap_err(), LinkPayloadError::OldQrVersion);
/// ```
pub fn parse_link_payload(raw: &str) -> Result<LinkPayload, LinkPayloadError> {
    let raw = raw.trim();
    if is_password(raw) {
        return Err(LinkPayloadError::OldQrVersion);
    }
    let payload: RawPayload =
        serde_json::from_str(raw).map_err(|e| LinkPayloadError::InvalidQr(e.to_string()))?;

    if !is_password(&payload.password) {
        return Err(LinkPayloadError::InvalidQr(
            "password must be 32 bytes of hex".into(),
        ));
    }
    let remote_public_key = parse_key(&payload.public_key)
        .ok_or_else(|| LinkPayloadError::InvalidQr("public key is not an Ed25519 key".into()))?;

    let secret = ConnectionSecret::new(payload.password);
    let signature =
        parse_signature(&payload.signature).ok_or(LinkPayloadError::InvalidSignature)?;
    remote_public_key
        .verify(&link_message(&secret), &signature)
        .map_err(|_| LinkPayloadError::InvalidSignature)?;

    let purpose = match payload.purpose.as_str() {
        "general" => LinkPurpose::General,
        other => return Err(LinkPayloadError::UnknownPurpose(other.to_owned())),
    };

    Ok(LinkPayload {
        secret,
        remote_public_key,
        purpose,
    })
}

/// First application message each side sends on a new link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "discriminator")]
pub enum LinkHandshake {
    /// Proof that the sender holds `public_key` and knows the link secret.
    #[serde(rename = "linkClient", rename_all = "camelCase")]
    LinkClient {
        /// Sender's Ed25519 key, hex.
        public_key: String,
        /// Signature of [`link_message`], hex.
        signature: String,
    },
}

impl LinkHandshake {
    /// The wallet's handshake for `secret`.
    #[must_use]
    pub fn sign(identity: &WalletIdentity, secret: &ConnectionSecret) -> Self {
        Self::LinkClient {
            public_key: identity.public_key_hex(),
            signature: hex::encode(identity.sign(&link_message(secret)).to_bytes()),
        }
    }

    /// Wraps the handshake as an ordinary envelope.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidEnvelope`] if serialization fails.
    pub fn to_envelope(&self) -> Result<MessageEnvelope, LinkError> {
        let payload =
            serde_json::to_value(self).map_err(|e| LinkError::InvalidEnvelope(e.to_string()))?;
        Ok(MessageEnvelope::new(payload))
    }

    /// Reads a handshake out of the first envelope a peer sent.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::LinkRejected`] if the payload is not a handshake.
    pub fn from_envelope(envelope: &MessageEnvelope) -> Result<Self, LinkError> {
        serde_json::from_value(envelope.payload.clone())
            .map_err(|e| LinkError::LinkRejected(format!("not a link handshake: {e}")))
    }

    /// Checks the handshake against the link secret and, when known, the key
    /// the link payload advertised. Returns the verified key.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::LinkRejected`] on any mismatch.
    pub fn verify(
        &self,
        secret: &ConnectionSecret,
        expected: Option<&VerifyingKey>,
    ) -> Result<VerifyingKey, LinkError> {
        let Self::LinkClient {
            public_key,
            signature,
        } = self;
        let key = parse_key(public_key)
            .ok_or_else(|| LinkError::LinkRejected("malformed public key".into()))?;
        let signature = parse_signature(signature)
            .ok_or_else(|| LinkError::LinkRejected("malformed signature".into()))?;
        key.verify(&link_message(secret), &signature)
            .map_err(|_| LinkError::LinkRejected("signature does not verify".into()))?;
        if let Some(expected) = expected {
            if expected != &key {
                return Err(LinkError::LinkRejected(
                    "public key differs from the link code".into(),
                ));
            }
        }
        Ok(key)
    }
}
