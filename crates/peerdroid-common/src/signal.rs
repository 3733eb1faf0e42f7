//! Signaling relay wire format.
//!
//! Clients talk to the relay with [`RpcMessage`]s; the relay answers and
//! forwards with [`RelayMessage`]s discriminated by `info`. SDP and ICE
//! payloads never travel in the clear: they are JSON encoded, sealed with the
//! link key, and hex encoded into `encryptedPayload`.

use crate::crypto::{decrypt, encrypt, CryptoError, EncryptionKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Which side of the link a client is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientSource {
    /// The mobile wallet.
    Wallet,
    /// The browser extension.
    Extension,
}

impl ClientSource {
    /// The opposite side.
    #[must_use]
    pub const fn counterpart(self) -> Self {
        match self {
            Self::Wallet => Self::Extension,
            Self::Extension => Self::Wallet,
        }
    }

    /// Query-string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Wallet => "wallet",
            Self::Extension => "extension",
        }
    }
}

/// Kind of negotiation message carried by an [`RpcMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RpcMethod {
    /// SDP offer.
    Offer,
    /// SDP answer.
    Answer,
    /// Trickled ICE candidate.
    IceCandidate,
}

/// Envelope a client sends to the relay for delivery to its counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcMessage {
    /// Message kind.
    pub method: RpcMethod,
    /// Sender side.
    pub source: ClientSource,
    /// Relay session id (digest of the link secret).
    pub connection_id: String,
    /// Correlates the relay's confirmation with this message.
    pub request_id: String,
    /// Relay-assigned id of the recipient.
    pub target_client_id: String,
    /// Hex of the sealed JSON payload.
    pub encrypted_payload: String,
}

/// Message the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "info", rename_all = "camelCase")]
pub enum RelayMessage {
    /// The counterpart joined after us.
    #[serde(rename_all = "camelCase")]
    RemoteClientJustConnected {
        /// Relay id of the counterpart.
        remote_client_id: String,
    },
    /// The counterpart was already present when we joined.
    #[serde(rename_all = "camelCase")]
    RemoteClientIsAlreadyConnected {
        /// Relay id of the counterpart.
        remote_client_id: String,
    },
    /// The counterpart left.
    #[serde(rename_all = "camelCase")]
    RemoteClientDisconnected {
        /// Relay id of the counterpart.
        remote_client_id: String,
    },
    /// The relay accepted one of our messages.
    #[serde(rename_all = "camelCase")]
    Confirmation {
        /// Id of the confirmed message.
        request_id: String,
    },
    /// The target of one of our messages is not connected.
    #[serde(rename_all = "camelCase")]
    MissingRemoteClientError {
        /// Id of the undeliverable message.
        request_id: String,
    },
    /// A message from the counterpart.
    #[serde(rename_all = "camelCase")]
    RemoteData {
        /// Relay id of the sender.
        remote_client_id: String,
        /// Sender's request id.
        request_id: String,
        /// The forwarded envelope.
        data: RpcMessage,
    },
    /// The relay could not parse one of our messages.
    InvalidMessageError {
        /// Relay's description.
        #[serde(default)]
        error: String,
    },
    /// The relay rejected one of our messages.
    ValidationError {
        /// Relay's description, shape not fixed.
        #[serde(default)]
        error: serde_json::Value,
    },
}

/// Decrypted offer or answer body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    /// Session description text.
    pub sdp: String,
}

/// Decrypted ICE candidate body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    /// Candidate line.
    pub candidate: String,
    /// Media stream id.
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// Media line index.
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

/// Errors sealing or opening an `encryptedPayload`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// Not valid hex.
    #[error("payload is not hex: {0}")]
    Hex(String),
    /// Sealed with a different key, or tampered.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Decrypted bytes are not the expected JSON.
    #[error("payload is not valid JSON: {0}")]
    Json(String),
}

/// Serializes, seals, and hex encodes a payload.
///
/// # Errors
///
/// Returns [`PayloadError`] if serialization or sealing fails.
pub fn seal_payload<T: Serialize>(payload: &T, key: &EncryptionKey) -> Result<String, PayloadError> {
    let json = serde_json::to_vec(payload).map_err(|e| PayloadError::Json(e.to_string()))?;
    Ok(hex::encode(encrypt(&json, key)?))
}

/// Reverses [`seal_payload`].
///
/// # Errors
///
/// Returns [`PayloadError`] if any stage fails.
pub fn open_payload<T: DeserializeOwned>(sealed: &str, key: &EncryptionKey) -> Result<T, PayloadError> {
    let bytes = hex::decode(sealed).map_err(|e| PayloadError::Hex(e.to_string()))?;
    let json = decrypt(&bytes, key)?;
    serde_json::from_slice(&json).map_err(|e| PayloadError::Json(e.to_string()))
}

/// Builds the relay URL for one session: `{relay}/{connection_id}?source=..&target=..`.
///
/// # Examples
///
/// ```
/// use peerdroid_common::signal::{session_url, ClientSource};
///
/// let url = session_url("wss://relay.example/", "abc", ClientSource::Wallet);
/// assert_eq!(url, "wss://relay.example/abc?source=wallet&target=extension");
/// ```
#[must_use]
pub fn session_url(relay: &str, connection_id: &str, source: ClientSource) -> String {
    format!(
        "{}/{}?source={}&target={}",
        relay.trim_end_matches('/'),
        connection_id,
        source.as_str(),
        source.counterpart().as_str()
    )
}
