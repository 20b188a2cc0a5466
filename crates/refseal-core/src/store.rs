//! Content-addressed record storage
//!
//! Records are opaque byte blobs addressed by the SHA256 of their content.
//! References are named pointers to records, updated with an
//! expected-old-value check so a torn or concurrent update is never
//! observable: a reader either sees the previous record or the new one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::crypto::sha256;
use crate::error::{Error, Result};
use crate::types::ObjectId;

/// Backend contract for content-addressed records and named refs
pub trait RecordStore: Send + Sync {
    /// Store bytes, returning their content address. Idempotent.
    fn put(&self, bytes: &[u8]) -> Result<ObjectId>;

    /// Fetch the bytes for a content address
    fn get(&self, id: &ObjectId) -> Result<Vec<u8>>;

    /// Whether the store holds this address
    fn has(&self, id: &ObjectId) -> bool;

    /// Read a named ref, if set
    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>>;

    /// Compare-and-swap a named ref
    ///
    /// Fails with ConflictError when the current value differs from
    /// `expected`, so stale writers never clobber newer state.
    fn update_ref(&self, name: &str, new: ObjectId, expected: Option<ObjectId>) -> Result<()>;

    /// Remove a named ref (used when rolling back staged state)
    fn delete_ref(&self, name: &str) -> Result<()>;

    /// List refs whose names start with `prefix`
    fn list_refs(&self, prefix: &str) -> Result<Vec<String>>;
}

/// On-disk store: `objects/<aa>/<rest>` plus `refs/<name>` files
///
/// Writes go through a temp file and rename, the same atomicity idiom the
/// rest of the engine uses for JSON state.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open an existing store directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.join("objects").is_dir() {
            return Err(Error::NotFound(format!(
                "no record store at {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Create the store layout, then open it
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("objects"))?;
        std::fs::create_dir_all(root.join("refs"))?;
        Ok(Self { root })
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join("objects").join(&hex[..2]).join(&hex[2..])
    }

    fn ref_path(&self, name: &str) -> Result<PathBuf> {
        // Ref names are slash-separated identifiers, never filesystem paths
        if name.is_empty() || name.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
            return Err(Error::Validation(format!("invalid ref name '{}'", name)));
        }
        Ok(self.root.join("refs").join(name))
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, bytes)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl RecordStore for FsStore {
    fn put(&self, bytes: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::new(sha256(bytes));
        let path = self.object_path(&id);
        if !path.exists() {
            Self::write_atomic(&path, bytes)?;
        }
        Ok(id)
    }

    fn get(&self, id: &ObjectId) -> Result<Vec<u8>> {
        let path = self.object_path(id);
        if !path.exists() {
            return Err(Error::NotFound(format!("object {}", id.short())));
        }
        let bytes = std::fs::read(&path)?;
        // Content addresses are self-verifying; a mismatch means on-disk
        // corruption and nothing downstream may trust the record.
        if ObjectId::new(sha256(&bytes)) != *id {
            return Err(Error::Integrity(format!(
                "object {} does not match its content address",
                id.short()
            )));
        }
        Ok(bytes)
    }

    fn has(&self, id: &ObjectId) -> bool {
        self.object_path(id).exists()
    }

    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>> {
        let path = self.ref_path(name)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let id = ObjectId::from_hex(content.trim())
            .map_err(|e| Error::Integrity(format!("corrupt ref '{}': {}", name, e)))?;
        Ok(Some(id))
    }

    fn update_ref(&self, name: &str, new: ObjectId, expected: Option<ObjectId>) -> Result<()> {
        let current = self.read_ref(name)?;
        if current != expected {
            return Err(Error::Conflict(format!(
                "ref '{}' moved (expected {}, found {})",
                name,
                expected.map_or_else(|| "unset".to_string(), |id| id.short()),
                current.map_or_else(|| "unset".to_string(), |id| id.short()),
            )));
        }
        Self::write_atomic(&self.ref_path(name)?, new.to_hex().as_bytes())
    }

    fn delete_ref(&self, name: &str) -> Result<()> {
        let path = self.ref_path(name)?;
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn list_refs(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let base = self.root.join("refs");
        collect_refs(&base, &base, &mut names)?;
        names.retain(|n| n.starts_with(prefix));
        names.sort();
        Ok(names)
    }
}

fn collect_refs(base: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_refs(base, &path, out)?;
        } else if path.extension().map(|e| e == "tmp").unwrap_or(false) {
            continue;
        } else if let Ok(rel) = path.strip_prefix(base) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

/// In-memory store for tests and ephemeral repositories
#[derive(Default)]
pub struct MemStore {
    objects: Mutex<HashMap<ObjectId, Vec<u8>>>,
    refs: Mutex<HashMap<String, ObjectId>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectId, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refs(&self) -> std::sync::MutexGuard<'_, HashMap<String, ObjectId>> {
        self.refs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RecordStore for MemStore {
    fn put(&self, bytes: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::new(sha256(bytes));
        self.objects().entry(id).or_insert_with(|| bytes.to_vec());
        Ok(id)
    }

    fn get(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.objects()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("object {}", id.short())))
    }

    fn has(&self, id: &ObjectId) -> bool {
        self.objects().contains_key(id)
    }

    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>> {
        Ok(self.refs().get(name).copied())
    }

    fn update_ref(&self, name: &str, new: ObjectId, expected: Option<ObjectId>) -> Result<()> {
        let mut refs = self.refs();
        let current = refs.get(name).copied();
        if current != expected {
            return Err(Error::Conflict(format!(
                "ref '{}' moved (expected {}, found {})",
                name,
                expected.map_or_else(|| "unset".to_string(), |id| id.short()),
                current.map_or_else(|| "unset".to_string(), |id| id.short()),
            )));
        }
        refs.insert(name.to_string(), new);
        Ok(())
    }

    fn delete_ref(&self, name: &str) -> Result<()> {
        self.refs().remove(name);
        Ok(())
    }

    fn list_refs(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .refs()
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise_store(store: &dyn RecordStore) {
        let id = store.put(b"hello").unwrap();
        assert!(store.has(&id));
        assert_eq!(store.get(&id).unwrap(), b"hello");

        // Idempotent put
        assert_eq!(store.put(b"hello").unwrap(), id);

        // Missing object
        assert!(matches!(
            store.get(&ObjectId::new([9u8; 32])),
            Err(Error::NotFound(_))
        ));

        // CAS ref updates
        assert_eq!(store.read_ref("refs/heads/main").unwrap(), None);
        store.update_ref("refs/heads/main", id, None).unwrap();
        assert_eq!(store.read_ref("refs/heads/main").unwrap(), Some(id));

        let other = store.put(b"world").unwrap();
        assert!(matches!(
            store.update_ref("refs/heads/main", other, None),
            Err(Error::Conflict(_))
        ));
        store.update_ref("refs/heads/main", other, Some(id)).unwrap();

        let listed = store.list_refs("refs/heads/").unwrap();
        assert_eq!(listed, vec!["refs/heads/main".to_string()]);
    }

    #[test]
    fn test_mem_store() {
        exercise_store(&MemStore::new());
    }

    #[test]
    fn test_fs_store() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::init(dir.path()).unwrap();
        exercise_store(&store);
    }

    #[test]
    fn test_fs_store_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::init(dir.path()).unwrap();
        let id = store.put(b"pristine").unwrap();

        let hex = id.to_hex();
        let path = dir.path().join("objects").join(&hex[..2]).join(&hex[2..]);
        std::fs::write(&path, b"tampered").unwrap();

        assert!(matches!(store.get(&id), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_fs_store_rejects_traversal_ref_names() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::init(dir.path()).unwrap();
        let id = store.put(b"x").unwrap();
        assert!(store.update_ref("../escape", id, None).is_err());
        assert!(store.update_ref("refs//double", id, None).is_err());
    }
}
