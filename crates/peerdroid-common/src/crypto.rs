//! Symmetric crypto for the peer link.
//!
//! Every payload that leaves the wallet for a linked peer, whether over the
//! signaling relay or over the data channel, is sealed with AES-256-GCM under
//! a key derived from the link's [`ConnectionSecret`]. Output buffers are laid
//! out as `nonce (12 bytes) ‖ ciphertext ‖ tag (16 bytes)`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of the random nonce prepended to every sealed buffer.
pub const NONCE_LEN: usize = 12;
/// Length of the GCM authentication tag.
pub const TAG_LEN: usize = 16;
/// Length of a derived key in bytes.
pub const KEY_LEN: usize = 32;

/// Errors produced by [`encrypt`] and [`decrypt`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// The authentication tag did not verify: wrong key, or tampered data.
    #[error("authentication failed")]
    AuthenticationFailed,
    /// The buffer is shorter than a nonce plus a tag.
    #[error("sealed buffer too short: {len} bytes")]
    Truncated {
        /// Actual length of the rejected buffer.
        len: usize,
    },
    /// The cipher refused to seal the plaintext.
    #[error("encryption failed")]
    EncryptionFailed,
}

/// Versioned key-derivation scheme.
///
/// The version is recorded next to anything persisted for a link so that a
/// future scheme can coexist with links made under this one. The key itself
/// is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfVersion {
    /// HKDF-SHA256, no salt, empty info, UTF-8 secret as IKM, 256-bit output.
    #[default]
    V1,
}

/// Shared link password, established out of band (QR code).
///
/// Zeroed on drop. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionSecret(Zeroizing<String>);

impl ConnectionSecret {
    /// Wraps a secret string.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    /// Generates a fresh secret: 32 random bytes, hex encoded.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(bytes.as_mut());
        Self::new(hex::encode(bytes.as_ref()))
    }

    /// The secret as text.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Session identifier used to scope the signaling relay: `hex(SHA-256(secret))`.
    ///
    /// # Examples
    ///
    /// ```
    /// use peerdroid_common::crypto::ConnectionSecret;
    ///
    /// let secret = ConnectionSecret::new("correct horse");
    /// let id = secret.connection_id();
    /// assert_eq!(id.len(), 64);
    /// assert_eq!(id, ConnectionSecret::new("correct horse").connection_id());
    /// ```
    #[must_use]
    pub fn connection_id(&self) -> String {
        hex::encode(content_hash(self.0.as_bytes()))
    }
}

impl fmt::Debug for ConnectionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionSecret(..)")
    }
}

/// A 256-bit AES-GCM key. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Builds a key from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Derives the link key from `secret` under the current scheme.
///
/// # Examples
///
/// ```
/// use peerdroid_common::crypto::{derive_key, ConnectionSecret};
///
/// let a = derive_key(&ConnectionSecret::new("s3cret"));
/// let b = derive_key(&ConnectionSecret::new("s3cret"));
/// assert_eq!(a.as_bytes(), b.as_bytes());
/// ```
#[must_use]
pub fn derive_key(secret: &ConnectionSecret) -> EncryptionKey {
    derive_key_with(KdfVersion::default(), secret)
}

/// Derives the link key from `secret` under an explicit scheme version.
#[must_use]
pub fn derive_key_with(version: KdfVersion, secret: &ConnectionSecret) -> EncryptionKey {
    match version {
        KdfVersion::V1 => {
            let hk = Hkdf::<Sha256>::new(None, secret.expose().as_bytes());
            let mut okm = [0u8; KEY_LEN];
            assert!(
                hk.expand(&[], &mut okm).is_ok(),
                "32 bytes is a valid HKDF-SHA256 output length"
            );
            EncryptionKey(okm)
        }
    }
}

/// Seals `plaintext` with a fresh random nonce.
///
/// Two calls with the same input never return the same buffer.
///
/// # Errors
///
/// Returns [`CryptoError::EncryptionFailed`] if the cipher rejects the input.
pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::EncryptionFailed)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Opens a buffer produced by [`encrypt`].
///
/// # Errors
///
/// Returns [`CryptoError::Truncated`] if the buffer cannot hold a nonce and a
/// tag, and [`CryptoError::AuthenticationFailed`] if the tag does not verify.
///
/// # Examples
///
/// ```
/// use peerdroid_common::crypto::{decrypt, derive_key, encrypt, ConnectionSecret};
///
/// let key = derive_key(&ConnectionSecret::new("pw"));
/// let sealed = encrypt(b"hello", &key).unwrap();
/// assert_eq!(decrypt(&sealed, &key).unwrap(), b"hello");
/// ```
pub fn decrypt(buffer: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CryptoError> {
    if buffer.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Truncated { len: buffer.len() });
    }
    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::AuthenticationFailed)?;
    let (nonce_bytes, sealed) = buffer.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), sealed)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// SHA-256 digest used for reassembly integrity checks.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> EncryptionKey {
        derive_key(&ConnectionSecret::new("a-shared-link-password"))
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let a = key();
        let b = key();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_different_secrets_derive_different_keys() {
        let a = derive_key(&ConnectionSecret::new("one"));
        let b = derive_key(&ConnectionSecret::new("two"));
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_derive_key_matches_plain_hkdf() {
        let secret = ConnectionSecret::new("interop");
        let hk = Hkdf::<Sha256>::new(None, b"interop");
        let mut expected = [0u8; 32];
        hk.expand(&[], &mut expected).unwrap();
        assert_eq!(derive_key(&secret).as_bytes(), &expected);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let k = key();
        let sealed = encrypt(b"{\"id\":\"1\"}", &k).unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 10 + TAG_LEN);
        assert_eq!(decrypt(&sealed, &k).unwrap(), b"{\"id\":\"1\"}");
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let k = key();
        let sealed = encrypt(b"", &k).unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + TAG_LEN);
        assert!(decrypt(&sealed, &k).unwrap().is_empty());
    }

    #[test]
    fn test_same_plaintext_twice_yields_different_ciphertexts() {
        let k = key();
        let a = encrypt(b"same bytes", &k).unwrap();
        let b = encrypt(b"same bytes", &k).unwrap();
        assert_ne!(a, b);
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let sealed = encrypt(b"payload", &key()).unwrap();
        let other = derive_key(&ConnectionSecret::new("not the password"));
        assert_eq!(decrypt(&sealed, &other), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_truncated_buffer_rejected() {
        assert_eq!(
            decrypt(&[0u8; 27], &key()),
            Err(CryptoError::Truncated { len: 27 })
        );
    }

    #[test]
    fn test_connection_id_is_not_the_secret() {
        let secret = ConnectionSecret::new("abcd");
        let id = secret.connection_id();
        assert!(!id.contains("abcd"));
        assert_eq!(id, hex::encode(Sha256::digest(b"abcd")));
    }

    #[test]
    fn test_generated_secret_is_32_bytes_hex() {
        let secret = ConnectionSecret::generate();
        assert_eq!(hex::decode(secret.expose()).unwrap().len(), 32);
        assert_ne!(secret, ConnectionSecret::generate());
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let secret = ConnectionSecret::new("hunter2");
        assert!(!format!("{secret:?}").contains("hunter2"));
    }
}
