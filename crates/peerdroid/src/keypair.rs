//! The wallet's long-lived link identity.
//!
//! An Ed25519 key the wallet presents during the link handshake. Only the
//! 32-byte seed is stored, owner-readable only.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

#[cfg(unix)]
const KEY_FILE_PERMS: u32 = 0o600;

/// Signing key used to prove the wallet's identity to linked peers.
#[derive(Clone)]
pub struct WalletIdentity {
    signing_key: SigningKey,
}

impl fmt::Debug for WalletIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletIdentity")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

impl WalletIdentity {
    /// A fresh identity from OS randomness. Not persisted.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Identity from a known seed.
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Loads the identity at `path`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing key file is readable by others or is
    /// not exactly 32 bytes, or if file I/O fails.
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            check_permissions(path)?;
            let seed = Zeroizing::new(fs::read(path)?);
            let seed: &[u8; 32] = seed.as_slice().try_into().map_err(|_| {
                anyhow::anyhow!("key file must contain exactly 32 bytes, got {}", seed.len())
            })?;
            return Ok(Self::from_seed(seed));
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_seed(path, &Zeroizing::new(identity.signing_key.to_bytes()))?;
        tracing::info!(path = %path.display(), "created wallet link identity");
        Ok(identity)
    }

    /// Public half.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Public key as lowercase hex, the form exchanged in handshakes.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().as_bytes())
    }

    /// Signs `message`.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

#[cfg(unix)]
fn check_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode();
    if mode & 0o077 != 0 {
        anyhow::bail!(
            "key file {} has overly permissive permissions ({:o}), must be 0600",
            path.display(),
            mode & 0o777
        );
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

fn write_seed(path: &Path, seed: &[u8; 32]) -> anyhow::Result<()> {
    use std::io::Write;
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(KEY_FILE_PERMS);
    }
    let mut file = options.open(path)?;
    file.write_all(seed)?;
    Ok(())
}
