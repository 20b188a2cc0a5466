//! Repository handle
//!
//! Every engine operation takes an explicit `Repository`; nothing reads
//! ambient process state such as a current working directory. A handle
//! wraps a record store together with the advisory per-reference locks
//! that serialize appends.
//!
//! Bookkeeping refs live under `refs/refseal/` and are never conflated
//! with user branches or tags.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::RepoConfig;
use crate::crypto::Keyring;
use crate::error::{Error, Result};
use crate::store::{FsStore, MemStore, RecordStore};
use crate::types::ObjectId;

/// Ref holding the current applied root-of-trust document
pub const TRUST_REF: &str = "refs/refseal/trust";

/// Ref prefix for applied policy documents (`<prefix>/<name>`)
pub const POLICY_REF_PREFIX: &str = "refs/refseal/policy";

/// Ref holding the latest reference state log entry
pub const RSL_REF: &str = "refs/refseal/reference-state-log";

/// Ref prefix for staged (draft) documents
pub const STAGING_REF_PREFIX: &str = "refs/refseal/staging";

/// Directory name for the engine's on-disk state
pub const STATE_DIR: &str = ".refseal";

/// A handle to one repository's records, refs, and locks
pub struct Repository {
    store: Box<dyn RecordStore>,
    state_dir: Option<PathBuf>,
    ref_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Repository {
    /// Open the repository whose state directory lives under `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let state_dir = path.as_ref().join(STATE_DIR);
        let store = FsStore::open(&state_dir)?;
        Ok(Self {
            store: Box::new(store),
            state_dir: Some(state_dir),
            ref_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Initialize (or reopen) a repository under `path`
    pub fn init(path: impl AsRef<Path>) -> Result<Self> {
        let state_dir = path.as_ref().join(STATE_DIR);
        let store = FsStore::init(&state_dir)?;
        Ok(Self {
            store: Box::new(store),
            state_dir: Some(state_dir),
            ref_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Ephemeral in-memory repository
    pub fn in_memory() -> Self {
        Self {
            store: Box::new(MemStore::new()),
            state_dir: None,
            ref_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The on-disk state directory, when file-backed
    pub fn state_dir(&self) -> Option<&Path> {
        self.state_dir.as_deref()
    }

    /// Load this repository's config (defaults when absent or in-memory)
    pub fn config(&self) -> Result<RepoConfig> {
        match &self.state_dir {
            Some(dir) => RepoConfig::load(&dir.join("config.json")),
            None => Ok(RepoConfig::default()),
        }
    }

    /// Persist this repository's config
    pub fn save_config(&self, config: &RepoConfig) -> Result<()> {
        match &self.state_dir {
            Some(dir) => config.save(&dir.join("config.json")),
            None => Err(Error::Validation(
                "in-memory repository has no config file".to_string(),
            )),
        }
    }

    /// Load this repository's fingerprint keyring (empty when absent)
    pub fn keyring(&self) -> Result<Keyring> {
        match &self.state_dir {
            Some(dir) => Keyring::load(&dir.join("keyring.json")),
            None => Ok(Keyring::new()),
        }
    }

    /// Persist this repository's fingerprint keyring
    pub fn save_keyring(&self, keyring: &Keyring) -> Result<()> {
        match &self.state_dir {
            Some(dir) => keyring.save(&dir.join("keyring.json")),
            None => Err(Error::Validation(
                "in-memory repository has no keyring file".to_string(),
            )),
        }
    }

    /// Store raw bytes (a blob), returning the content address
    pub fn put_blob(&self, bytes: &[u8]) -> Result<ObjectId> {
        self.store.put(bytes)
    }

    /// Store a serializable record as canonical JSON
    pub fn put_record<T: Serialize>(&self, record: &T) -> Result<ObjectId> {
        self.store.put(&canonical_json(record)?)
    }

    /// Load and deserialize a record
    pub fn get_record<T: DeserializeOwned>(&self, id: &ObjectId) -> Result<T> {
        let bytes = self.store.get(id)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Whether the store holds the given address
    pub fn has_object(&self, id: &ObjectId) -> bool {
        self.store.has(id)
    }

    /// Fetch raw record bytes
    pub fn get_bytes(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.store.get(id)
    }

    /// Read a ref by canonical name
    pub fn read_ref(&self, name: &str) -> Result<Option<ObjectId>> {
        self.store.read_ref(name)
    }

    /// Read a ref, erroring when unset
    pub fn require_ref(&self, name: &str) -> Result<ObjectId> {
        self.read_ref(name)?
            .ok_or_else(|| Error::NotFound(format!("ref '{}' is not set", name)))
    }

    /// Compare-and-swap a ref
    pub fn update_ref(&self, name: &str, new: ObjectId, expected: Option<ObjectId>) -> Result<()> {
        self.store.update_ref(name, new, expected)
    }

    /// Remove a ref
    pub fn delete_ref(&self, name: &str) -> Result<()> {
        self.store.delete_ref(name)
    }

    /// List refs under a prefix
    pub fn list_refs(&self, prefix: &str) -> Result<Vec<String>> {
        self.store.list_refs(prefix)
    }

    /// Advisory lock serializing appends for one reference name
    ///
    /// Hold the returned handle and enter the critical section with
    /// `guard()`. Appends to distinct references proceed independently.
    pub fn lock_ref(&self, ref_name: &str) -> RefLock {
        let slot = {
            let mut locks = self.ref_locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(ref_name.to_string()).or_default())
        };
        RefLock { slot }
    }
}

/// Advisory lock handle for one reference name
pub struct RefLock {
    slot: Arc<Mutex<()>>,
}

impl RefLock {
    /// Block until the reference's critical section is free, then enter it
    pub fn guard(&self) -> MutexGuard<'_, ()> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Canonicalize a user-supplied reference name (`main` -> `refs/heads/main`)
pub fn canonical_ref_name(name: &str) -> String {
    if name.starts_with("refs/") {
        name.to_string()
    } else {
        format!("refs/heads/{}", name)
    }
}

/// Serialize to canonical JSON bytes (sorted map keys, no whitespace)
///
/// Persisted structs keep their maps in `BTreeMap`s, so field order plus
/// sorted keys make the encoding deterministic and the content address
/// stable.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Deadline for externally-reaching operations
///
/// Callers supply the budget; on expiry the operation fails closed with a
/// RetryableError instead of skipping invariant checks.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Option<Instant>,
}

impl Deadline {
    /// No time limit
    pub fn none() -> Self {
        Self { expires_at: None }
    }

    /// Expires after `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        Self {
            expires_at: Instant::now().checked_add(timeout),
        }
    }

    /// Error with RetryableError if the budget is exhausted
    pub fn check(&self, operation: &str) -> Result<()> {
        match self.expires_at {
            Some(expires_at) if Instant::now() >= expires_at => Err(Error::Retryable(format!(
                "{} timed out",
                operation
            ))),
            _ => Ok(()),
        }
    }
}
