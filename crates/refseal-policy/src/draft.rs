//! Staged sign-then-apply document lifecycle
//!
//! A document moves `Uninitialized -> Draft (under-signed) -> Draft
//! (threshold met) -> Applied -> Superseded`. Mutations stage into a
//! draft; `apply` checks the draft's signatures against the *previously
//! applied* document's signer set, so a minority can never grant itself
//! trust, and replaces the current document atomically while keeping the
//! superseded version reachable for audit.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use refseal_core::{
    canonical_json, Error, KeyId, ObjectId, Principal, Repository, Result, SecretKey, Signature,
    SignatureVerifier,
};

/// A policy-layer document with a monotonic version counter
pub trait Document: Serialize + DeserializeOwned + Clone {
    /// Kind tag mixed into the signed payload, domain-separating
    /// signatures across document kinds
    const KIND: &'static str;

    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

/// Who must sign for a draft to apply, and how many of them
#[derive(Debug, Clone)]
pub struct SignerRequirement {
    /// Candidate signers
    pub principals: Vec<Principal>,

    /// Minimum count of distinct principals
    pub threshold: u32,

    /// Human-readable origin of the requirement, quoted in errors
    pub context: String,
}

/// Canonical signed bytes of a document
pub fn document_payload<T: Document>(document: &T) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    payload.extend_from_slice(T::KIND.as_bytes());
    payload.push(b':');
    payload.extend_from_slice(&canonical_json(document)?);
    Ok(payload)
}

/// A staged, possibly under-signed document revision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
pub struct Draft<T> {
    /// Version of the applied document this draft was staged from
    /// (0 when nothing has been applied yet)
    pub base_version: u64,

    /// The proposed document
    pub document: T,

    /// Collected signatures over the document payload, keyed by key ID
    pub signatures: BTreeMap<KeyId, Signature>,
}

impl<T: Document> Draft<T> {
    /// Stage the very first revision of a document
    pub fn initial(mut document: T) -> Self {
        document.set_version(1);
        Self {
            base_version: 0,
            document,
            signatures: BTreeMap::new(),
        }
    }

    /// Stage a revision on top of the currently applied document
    pub fn from_applied(current: &T) -> Self {
        let mut document = current.clone();
        document.set_version(current.version() + 1);
        Self {
            base_version: current.version(),
            document,
            signatures: BTreeMap::new(),
        }
    }

    /// Mutate the staged document, discarding signatures collected over
    /// the previous payload
    pub fn mutate(&mut self, f: impl FnOnce(&mut T) -> Result<()>) -> Result<()> {
        f(&mut self.document)?;
        self.signatures.clear();
        Ok(())
    }

    /// Add a signature over the current payload
    pub fn sign(&mut self, secret: &SecretKey) -> Result<()> {
        let payload = document_payload(&self.document)?;
        let signature = secret.sign(&payload)?;
        self.signatures.insert(secret.key_id()?, signature);
        Ok(())
    }
}

/// An applied document revision, with its audit trail link
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
pub struct AppliedDocument<T> {
    pub document: T,

    /// Signatures that satisfied the apply-time threshold
    pub signatures: BTreeMap<KeyId, Signature>,

    /// Superseded revision, retained for audit
    pub previous: Option<ObjectId>,
}

/// Count distinct principals with a valid signature over `payload`
///
/// A principal with several keys contributes once; unknown keys
/// contribute nothing.
pub fn count_valid_signatures(
    verifier: &SignatureVerifier,
    principals: &[Principal],
    payload: &[u8],
    signatures: &BTreeMap<KeyId, Signature>,
) -> (u32, Vec<String>) {
    let mut satisfied = Vec::new();
    for principal in principals {
        let verified = signatures.iter().any(|(key_id, signature)| {
            principal.holds_key(key_id) && verifier.verify_principal(principal, payload, signature)
        });
        if verified {
            satisfied.push(principal.id.clone());
        }
    }
    (satisfied.len() as u32, satisfied)
}

/// Threshold-check and atomically apply a staged draft
///
/// `requirement` must come from the previously applied revision (or, for
/// the first apply, from the draft itself). Returns the applied record's
/// object ID. Re-applying a draft identical to the current document is a
/// no-op success; applying against a superseded base is a ConflictError.
pub fn apply_draft<T: Document>(
    repo: &Repository,
    ref_name: &str,
    staging_ref: &str,
    draft: &Draft<T>,
    requirement: &SignerRequirement,
    verifier: &SignatureVerifier,
) -> Result<ObjectId> {
    let current_id = repo.read_ref(ref_name)?;
    let current: Option<AppliedDocument<T>> = match &current_id {
        Some(id) => Some(repo.get_record(id)?),
        None => None,
    };

    if let (Some(id), Some(applied)) = (&current_id, &current) {
        if canonical_json(&applied.document)? == canonical_json(&draft.document)? {
            debug!(ref_name, "draft identical to applied document; nothing to do");
            repo.delete_ref(staging_ref)?;
            return Ok(*id);
        }
    }

    let current_version = current.as_ref().map_or(0, |a| a.document.version());
    if draft.base_version != current_version {
        return Err(Error::Conflict(format!(
            "draft staged from version {} but version {} is applied; re-stage",
            draft.base_version, current_version
        )));
    }

    let payload = document_payload(&draft.document)?;
    let (count, satisfied) =
        count_valid_signatures(verifier, &requirement.principals, &payload, &draft.signatures);
    if count < requirement.threshold {
        return Err(Error::Trust(format!(
            "{}: {} of {} required signatures present",
            requirement.context, count, requirement.threshold
        )));
    }

    let applied = AppliedDocument {
        document: draft.document.clone(),
        signatures: draft.signatures.clone(),
        previous: current_id,
    };
    let new_id = repo.put_record(&applied)?;
    repo.update_ref(ref_name, new_id, current_id)?;
    repo.delete_ref(staging_ref)?;

    info!(
        ref_name,
        version = draft.document.version(),
        signers = ?satisfied,
        "applied document revision"
    );
    Ok(new_id)
}
