//! Refseal Core - Shared types, record storage, and signature verification
//!
//! This crate provides the foundational pieces of the refseal trust
//! engine: content-addressed record storage behind an explicit repository
//! handle, principal and key material modelling, the unified fail-closed
//! signature verify contract, and content snapshots.

pub mod config;
pub mod crypto;
pub mod error;
pub mod pattern;
pub mod principal;
pub mod repository;
pub mod snapshot;
pub mod store;
pub mod types;

pub use config::RepoConfig;
pub use crypto::{sha256, sha256_multi, Keyring, PublicKey, SecretKey};
pub use error::{Error, Result};
pub use pattern::{PatternScheme, RulePattern};
pub use principal::{Key, KeyMaterial, Principal, SignatureVerifier};
pub use repository::{
    canonical_json, canonical_ref_name, Deadline, RefLock, Repository, POLICY_REF_PREFIX, RSL_REF,
    STAGING_REF_PREFIX, STATE_DIR, TRUST_REF,
};
pub use snapshot::{snapshot_directory, Approval, Snapshot};
pub use store::{FsStore, MemStore, RecordStore};
pub use types::{KeyId, ObjectId, Signature};

/// Record format version
pub const VERSION: u32 = 1;
