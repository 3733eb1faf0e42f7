//! Persistence of linked peers.
//!
//! The registry only needs `load`, `save` and `delete`; the [`PeerStore`]
//! trait keeps it independent of where records live. [`TomlPeerStore`]
//! keeps them in a TOML file next to the wallet's other data.

use crate::types::PeerId;
use peerdroid_common::crypto::{ConnectionSecret, KdfVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use thiserror::Error;

#[cfg(unix)]
const STORE_FILE_PERMS: u32 = 0o600;

/// Errors from a peer-record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The backing file is not valid TOML.
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// Records could not be encoded.
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    /// A lock was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,
}

/// Link purpose carried in the link payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPurpose {
    /// Ordinary wallet/extension link.
    #[default]
    General,
}

/// One linked peer as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Registry id.
    pub id: PeerId,
    /// Name shown to the user.
    pub display_name: String,
    /// The link password. Encrypting it at rest is the host's concern.
    pub connection_secret: String,
    /// Key-derivation scheme the link was made under.
    #[serde(default)]
    pub kdf: KdfVersion,
    /// Remote Ed25519 key (hex), when the handshake pinned one.
    #[serde(default)]
    pub public_key: Option<String>,
    /// Link purpose.
    #[serde(default)]
    pub purpose: LinkPurpose,
}

impl PeerRecord {
    /// The stored secret.
    #[must_use]
    pub fn secret(&self) -> ConnectionSecret {
        ConnectionSecret::new(self.connection_secret.clone())
    }
}

/// Load/save/delete of peer records.
pub trait PeerStore: Send + Sync {
    /// All stored records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backing storage cannot be read.
    fn load(&self) -> Result<Vec<PeerRecord>, StoreError>;

    /// Inserts or replaces the record with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the record cannot be persisted.
    fn save(&self, record: PeerRecord) -> Result<(), StoreError>;

    /// Removes a record. Removing an unknown id is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the change cannot be persisted.
    fn delete(&self, id: &PeerId) -> Result<(), StoreError>;
}

/// Serialization wrapper matching the TOML file format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PeersFile {
    #[serde(default)]
    peers: Vec<PeerRecord>,
}

/// Thread-safe peer store backed by a TOML file on disk.
pub struct TomlPeerStore {
    inner: RwLock<BTreeMap<PeerId, PeerRecord>>,
    path: PathBuf,
}

impl TomlPeerStore {
    /// Opens the store, creating an empty file if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if a new file cannot be created.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let file = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            toml::from_str::<PeersFile>(&contents)?
        } else {
            let empty = PeersFile::default();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            write_atomically(&path, &toml::to_string_pretty(&empty)?)?;
            empty
        };

        let records = file.peers.into_iter().map(|r| (r.id, r)).collect();
        Ok(Self {
            inner: RwLock::new(records),
            path,
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn persist(&self, records: &BTreeMap<PeerId, PeerRecord>) -> Result<(), StoreError> {
        let file = PeersFile {
            peers: records.values().cloned().collect(),
        };
        write_atomically(&self.path, &toml::to_string_pretty(&file)?)
    }
}

/// Writes through a temp file that is created owner-only, so secrets are
/// never readable by others between create and rename.
fn write_atomically(path: &std::path::Path, contents: &str) -> Result<(), StoreError> {
    use std::io::Write;
    let tmp_path = path.with_extension("toml.tmp");
    // A leftover from an interrupted write keeps whatever mode it had.
    match std::fs::remove_file(&tmp_path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(STORE_FILE_PERMS);
    }
    let mut file = options.open(&tmp_path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

impl PeerStore for TomlPeerStore {
    fn load(&self) -> Result<Vec<PeerRecord>, StoreError> {
        let records = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.values().cloned().collect())
    }

    fn save(&self, record: PeerRecord) -> Result<(), StoreError> {
        let mut records = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        let previous = records.insert(record.id, record.clone());
        if let Err(e) = self.persist(&records) {
            match previous {
                Some(p) => records.insert(p.id, p),
                None => records.remove(&record.id),
            };
            return Err(e);
        }
        Ok(())
    }

    fn delete(&self, id: &PeerId) -> Result<(), StoreError> {
        let mut records = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        let Some(removed) = records.remove(id) else {
            return Ok(());
        };
        if let Err(e) = self.persist(&records) {
            records.insert(removed.id, removed);
            return Err(e);
        }
        Ok(())
    }
}

/// In-process store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryPeerStore {
    records: Mutex<BTreeMap<PeerId, PeerRecord>>,
}

impl PeerStore for MemoryPeerStore {
    fn load(&self) -> Result<Vec<PeerRecord>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(records.values().cloned().collect())
    }

    fn save(&self, record: PeerRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .insert(record.id, record);
        Ok(())
    }

    fn delete(&self, id: &PeerId) -> Result<(), StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .remove(id);
        Ok(())
    }
}
