//! Content snapshots
//!
//! A snapshot is the record a reference points at: a path -> blob map
//! signed by its author, with optional co-signatures (approvals) from
//! further principals. Parent links give ancestry, which is what
//! force-push detection walks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::SecretKey;
use crate::error::{Error, Result};
use crate::repository::{canonical_json, Repository};
use crate::types::{KeyId, ObjectId, Signature};

/// A co-signature over a snapshot payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub key: KeyId,
    pub signature: Signature,
}

/// Signed content snapshot of a reference's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Predecessor snapshot, if any
    pub parent: Option<ObjectId>,

    /// Path -> blob content address
    pub files: BTreeMap<String, ObjectId>,

    /// Key that authored (signed) this snapshot
    pub author: KeyId,

    /// Authoring time
    pub timestamp: DateTime<Utc>,

    /// Human-readable description
    pub message: String,

    /// Author's signature over the payload
    pub signature: Signature,

    /// Additional authorizing co-signatures over the same payload
    pub approvals: Vec<Approval>,
}

/// The signed portion of a snapshot (everything except signatures)
#[derive(Serialize)]
struct SnapshotPayload<'a> {
    parent: &'a Option<ObjectId>,
    files: &'a BTreeMap<String, ObjectId>,
    author: &'a KeyId,
    timestamp: &'a DateTime<Utc>,
    message: &'a str,
}

impl Snapshot {
    /// Build and sign a snapshot
    pub fn create(
        parent: Option<ObjectId>,
        files: BTreeMap<String, ObjectId>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
        author: &SecretKey,
    ) -> Result<Self> {
        let mut snapshot = Self {
            parent,
            files,
            author: author.key_id()?,
            timestamp,
            message: message.into(),
            signature: Signature::new([0u8; 64]),
            approvals: Vec::new(),
        };
        snapshot.signature = author.sign(&snapshot.payload()?)?;
        Ok(snapshot)
    }

    /// Canonical signed bytes
    pub fn payload(&self) -> Result<Vec<u8>> {
        canonical_json(&SnapshotPayload {
            parent: &self.parent,
            files: &self.files,
            author: &self.author,
            timestamp: &self.timestamp,
            message: &self.message,
        })
    }

    /// Attach a co-signature from another principal's key
    pub fn approve(&mut self, approver: &SecretKey) -> Result<()> {
        let key = approver.key_id()?;
        if self.approvals.iter().any(|a| a.key == key) {
            return Ok(());
        }
        let signature = approver.sign(&self.payload()?)?;
        self.approvals.push(Approval { key, signature });
        Ok(())
    }

    /// Paths added, modified, or removed relative to `parent`
    pub fn changed_paths(&self, parent: Option<&Snapshot>) -> Vec<String> {
        let empty = BTreeMap::new();
        let before = parent.map_or(&empty, |p| &p.files);

        let mut changed: Vec<String> = Vec::new();
        for (path, blob) in &self.files {
            if before.get(path) != Some(blob) {
                changed.push(path.clone());
            }
        }
        for path in before.keys() {
            if !self.files.contains_key(path) {
                changed.push(path.clone());
            }
        }
        changed.sort();
        changed.dedup();
        changed
    }

    /// Whether `ancestor` appears in this snapshot's parent chain
    ///
    /// A missing parent record terminates the walk: unknown ancestry is
    /// treated as "not a descendant", so force-push checks fail closed.
    pub fn is_descendant_of(&self, repo: &Repository, ancestor: &ObjectId) -> Result<bool> {
        let mut current = self.parent;
        while let Some(id) = current {
            if id == *ancestor {
                return Ok(true);
            }
            if !repo.has_object(&id) {
                return Ok(false);
            }
            let parent: Snapshot = repo.get_record(&id)?;
            current = parent.parent;
        }
        Ok(false)
    }
}

/// Snapshot a directory tree into the repository's blob store
///
/// Hidden entries and the engine's own state directory are skipped.
pub fn snapshot_directory(
    repo: &Repository,
    dir: &std::path::Path,
) -> Result<BTreeMap<String, ObjectId>> {
    let mut files = BTreeMap::new();
    walk_directory(repo, dir, dir, &mut files)?;
    Ok(files)
}

fn walk_directory(
    repo: &Repository,
    base: &std::path::Path,
    dir: &std::path::Path,
    out: &mut BTreeMap<String, ObjectId>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            walk_directory(repo, base, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(base)
                .map_err(|_| Error::Validation(format!("path escapes base: {}", path.display())))?
                .to_string_lossy()
                .replace('\\', "/");
            let blob = repo.put_blob(&std::fs::read(&path)?)?;
            out.insert(rel, blob);
        }
    }
    Ok(())
}
