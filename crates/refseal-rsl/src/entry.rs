//! Reference state log entries
//!
//! An entry binds a reference name to a content snapshot and records who
//! authorized the transition. Entries of the same reference chain through
//! `prev_hash`: the hash of the predecessor's signed payload, with the
//! zero sentinel for the first entry. The signed payload excludes local
//! bookkeeping (sequence position, log link, propagation marker) so a
//! propagated copy keeps its original signature and chain hash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use refseal_core::{
    canonical_json, sha256, Error, KeyId, ObjectId, Result, SecretKey, Signature,
    SignatureVerifier, Principal,
};

/// One recorded reference state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RslEntry {
    /// Sequence position in the local log (0-based)
    pub index: u64,

    /// Full reference name (`refs/heads/main`)
    pub ref_name: String,

    /// Content snapshot the reference points at
    pub target: ObjectId,

    /// Key that signed the entry
    pub signer: KeyId,

    /// Chain hash of the predecessor entry for this reference
    /// (zero sentinel for the first)
    pub prev_hash: ObjectId,

    /// Recording time
    pub timestamp: DateTime<Utc>,

    /// Set when this entry was copied from a linked repository
    pub propagated_from: Option<String>,

    /// Log-order predecessor record (any reference), if any
    pub log_prev: Option<ObjectId>,

    /// Signature over the canonical payload
    pub signature: Signature,
}

/// The signed, propagation-stable portion of an entry
#[derive(Serialize)]
struct EntryPayload<'a> {
    ref_name: &'a str,
    target: &'a ObjectId,
    signer: &'a KeyId,
    prev_hash: &'a ObjectId,
    timestamp: &'a DateTime<Utc>,
}

impl RslEntry {
    /// Build and sign a new local entry
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        index: u64,
        ref_name: impl Into<String>,
        target: ObjectId,
        prev_hash: ObjectId,
        log_prev: Option<ObjectId>,
        timestamp: DateTime<Utc>,
        signer: &SecretKey,
    ) -> Result<Self> {
        let mut entry = Self {
            index,
            ref_name: ref_name.into(),
            target,
            signer: signer.key_id()?,
            prev_hash,
            timestamp,
            propagated_from: None,
            log_prev,
            signature: Signature::new([0u8; 64]),
        };
        entry.signature = signer.sign(&entry.payload()?)?;
        Ok(entry)
    }

    /// Canonical signed bytes
    pub fn payload(&self) -> Result<Vec<u8>> {
        canonical_json(&EntryPayload {
            ref_name: &self.ref_name,
            target: &self.target,
            signer: &self.signer,
            prev_hash: &self.prev_hash,
            timestamp: &self.timestamp,
        })
    }

    /// Chain hash of this entry: SHA256 of the signed payload
    ///
    /// Stable across propagation, unlike the record's content address.
    pub fn entry_hash(&self) -> Result<ObjectId> {
        Ok(ObjectId::new(sha256(&self.payload()?)))
    }

    /// Verify the entry's signature against the given principal set
    ///
    /// Returns the matching principal's ID when one of their keys signed.
    pub fn verify_signer<'p>(
        &self,
        verifier: &SignatureVerifier,
        principals: impl IntoIterator<Item = &'p Principal>,
    ) -> Result<Option<&'p str>> {
        let payload = self.payload()?;
        for principal in principals {
            if principal.holds_key(&self.signer)
                && verifier.verify_principal(principal, &payload, &self.signature)
            {
                return Ok(Some(&principal.id));
            }
        }
        Ok(None)
    }

    /// Check this entry chains correctly onto `predecessor`
    ///
    /// Both must name the same reference and share a propagation source.
    pub fn check_chain(&self, predecessor: Option<&RslEntry>) -> Result<()> {
        match predecessor {
            Some(prev) => {
                let expected = prev.entry_hash()?;
                if self.prev_hash != expected {
                    return Err(Error::Integrity(format!(
                        "entry {} for '{}': prev hash {} does not match predecessor {}",
                        self.index,
                        self.ref_name,
                        self.prev_hash.short(),
                        expected.short()
                    )));
                }
            }
            None => {
                if !self.prev_hash.is_zero() {
                    return Err(Error::Integrity(format!(
                        "entry {} for '{}': first entry must carry the zero sentinel, found {}",
                        self.index,
                        self.ref_name,
                        self.prev_hash.short()
                    )));
                }
            }
        }
        Ok(())
    }
}
