//! Verification verdicts
//!
//! A verdict is produced per verification call and never persisted. Every
//! rejection names the rule and the unmet threshold so the outcome can be
//! audited.

use serde::{Deserialize, Serialize};

use refseal_core::ObjectId;

/// A rule that was satisfied, with the principals who satisfied it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatisfiedRule {
    pub rule: String,
    pub principals: Vec<String>,
}

/// Outcome of verifying one reference at one log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Reference that was verified
    pub ref_name: String,

    /// Log entry examined, when one was located
    pub entry: Option<ObjectId>,

    pub accepted: bool,

    /// Name of the first violated rule, on rejection
    pub violated_rule: Option<String>,

    /// Why the verdict came out the way it did
    pub reason: Option<String>,

    /// Rules that passed, with their authorizing principals
    pub satisfied: Vec<SatisfiedRule>,
}

impl Verdict {
    pub fn accept(
        ref_name: impl Into<String>,
        entry: Option<ObjectId>,
        satisfied: Vec<SatisfiedRule>,
    ) -> Self {
        Self {
            ref_name: ref_name.into(),
            entry,
            accepted: true,
            violated_rule: None,
            reason: None,
            satisfied,
        }
    }

    pub fn reject(
        ref_name: impl Into<String>,
        entry: Option<ObjectId>,
        violated_rule: Option<String>,
        reason: impl Into<String>,
        satisfied: Vec<SatisfiedRule>,
    ) -> Self {
        Self {
            ref_name: ref_name.into(),
            entry,
            accepted: false,
            violated_rule,
            reason: Some(reason.into()),
            satisfied,
        }
    }
}

/// One linked repository's contribution to a network verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberVerdict {
    /// Link name in the controller's root of trust
    pub repository: String,

    /// Per-reference verdicts, when the member was reachable
    pub verdicts: Vec<Verdict>,

    /// Why verification could not run, when it could not
    pub error: Option<String>,
}

impl MemberVerdict {
    pub fn accepted(&self) -> bool {
        self.error.is_none() && self.verdicts.iter().all(|v| v.accepted)
    }
}

/// Aggregate outcome across every registered network repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkVerdict {
    pub members: Vec<MemberVerdict>,
}

impl NetworkVerdict {
    /// Overall success requires every member to pass
    pub fn accepted(&self) -> bool {
        self.members.iter().all(|m| m.accepted())
    }

    /// Names of members that failed, for attribution
    pub fn failed_members(&self) -> Vec<&str> {
        self.members
            .iter()
            .filter(|m| !m.accepted())
            .map(|m| m.repository.as_str())
            .collect()
    }
}
