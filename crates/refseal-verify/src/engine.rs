//! The verification engine
//!
//! Given a reference and a point in its recorded history, resolves the
//! applicable policy (including delegated sub-policies and controller
//! global rules), tallies authorizing signatures against thresholds, and
//! decides accept/reject.
//!
//! Rule semantics: every matching threshold rule at every reachable
//! policy level must be satisfied. A rule whose name matches an applied
//! policy document is a delegation: its authorized principals govern who
//! signs the child document, while the child's own matching rules decide
//! authorization for the delegated scope. Reference-scheme rules are
//! satisfied by the log entry's signer plus snapshot approvals;
//! path-scheme rules by the snapshot's author plus approvals, which is
//! why a branch-rule pass never exempts a file rule.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use refseal_core::{
    canonical_ref_name, Error, ObjectId, Principal, Repository, Result, SignatureVerifier,
    Snapshot,
};
use refseal_policy::{GlobalRule, PolicyDocument, PolicyStore, RootOfTrust, Rule};
use refseal_rsl::{ReferenceStateLog, RslEntry};

use crate::verdict::{SatisfiedRule, Verdict};

/// Read-only verification over one repository
pub struct VerificationEngine<'a> {
    repo: &'a Repository,
    verifier: SignatureVerifier,
    extra_global_rules: Vec<GlobalRule>,
}

impl<'a> VerificationEngine<'a> {
    /// Build an engine for the repository, loading its keyring
    pub fn new(repo: &'a Repository) -> Result<Self> {
        Ok(Self {
            repo,
            verifier: SignatureVerifier::with_keyring(repo.keyring()?),
            extra_global_rules: Vec::new(),
        })
    }

    /// Layer additional global rules (a controller's) over this
    /// repository's own policy
    pub fn with_global_rules(mut self, rules: Vec<GlobalRule>) -> Self {
        self.extra_global_rules = rules;
        self
    }

    /// Verify a reference at a given entry (default: most recent)
    pub fn verify_reference(&self, ref_name: &str, at: Option<ObjectId>) -> Result<Verdict> {
        let ref_name = canonical_ref_name(ref_name);
        let anchor = self.load_anchor()?;
        let entries = ReferenceStateLog::new(self.repo).entries_for_ref(&ref_name, None)?;

        let position = match at {
            Some(id) => entries.iter().position(|(entry_id, _)| *entry_id == id),
            None => entries.len().checked_sub(1),
        };
        let position = match position {
            Some(position) => position,
            None => {
                return Ok(Verdict::reject(
                    ref_name.clone(),
                    at,
                    None,
                    format!("no recorded state for '{}'", ref_name),
                    Vec::new(),
                ))
            }
        };

        let verdict = self.verify_entry(&anchor, &entries, position)?;
        self.log_verdict(&verdict);
        Ok(verdict)
    }

    /// Verify every recorded entry of a reference, oldest first
    ///
    /// Returns the first rejection, or the verdict for the newest entry
    /// when the whole history passes.
    pub fn verify_reference_full(&self, ref_name: &str) -> Result<Verdict> {
        let ref_name = canonical_ref_name(ref_name);
        let anchor = self.load_anchor()?;
        let entries = ReferenceStateLog::new(self.repo).entries_for_ref(&ref_name, None)?;

        if entries.is_empty() {
            return Ok(Verdict::reject(
                ref_name.clone(),
                None,
                None,
                format!("no recorded state for '{}'", ref_name),
                Vec::new(),
            ));
        }

        let mut last = None;
        for position in 0..entries.len() {
            let verdict = self.verify_entry(&anchor, &entries, position)?;
            if !verdict.accepted {
                self.log_verdict(&verdict);
                return Ok(verdict);
            }
            last = Some(verdict);
        }
        let verdict = last.ok_or_else(|| {
            Error::Validation("empty verification window".to_string())
        })?;
        self.log_verdict(&verdict);
        Ok(verdict)
    }

    /// Verify a snapshot's signature against the trusted principal set
    /// (backs the `verify-commit` command)
    pub fn verify_snapshot(&self, id: ObjectId) -> Result<Verdict> {
        let anchor = self.load_anchor()?;
        if !self.repo.has_object(&id) {
            return Err(Error::NotFound(format!("snapshot {}", id.short())));
        }
        let snapshot: Snapshot = self.repo.get_record(&id)?;
        let payload = snapshot.payload()?;

        for principal in anchor.trusted_principals.values() {
            if principal.holds_key(&snapshot.author)
                && self
                    .verifier
                    .verify_principal(principal, &payload, &snapshot.signature)
            {
                return Ok(Verdict::accept(
                    format!("snapshot:{}", id.short()),
                    Some(id),
                    vec![SatisfiedRule {
                        rule: "trusted-author".to_string(),
                        principals: vec![principal.id.clone()],
                    }],
                ));
            }
        }
        Ok(Verdict::reject(
            format!("snapshot:{}", id.short()),
            Some(id),
            None,
            "signing key is not trusted by the applicable policy",
            Vec::new(),
        ))
    }

    // ---- anchor resolution ----

    fn load_anchor(&self) -> Result<Anchor> {
        let store = PolicyStore::new(self.repo);

        // The trust anchor must be internally valid before anything else
        // is believed; failures here abort rather than produce a verdict.
        let root = store.validate_trust_anchor(&self.verifier)?;

        let documents = if store.applied_policy(refseal_policy::TOP_LEVEL_POLICY)?.is_some() {
            store.validate_policy_anchor(&root, &self.verifier)?;
            store.applied_documents()?
        } else {
            Vec::new()
        };

        let mut trusted_principals: BTreeMap<String, Principal> = BTreeMap::new();
        for document in &documents {
            for principal in document.principals.values() {
                trusted_principals
                    .entry(principal.id.clone())
                    .and_modify(|existing| {
                        for key in &principal.keys {
                            existing.add_key(key.clone());
                        }
                    })
                    .or_insert_with(|| principal.clone());
            }
        }

        let global_rules = self.collect_global_rules(&root)?;

        Ok(Anchor {
            documents,
            trusted_principals,
            global_rules,
        })
    }

    /// Own global rules, every linked controller's, and any layered
    /// extras, deduplicated by name
    fn collect_global_rules(&self, root: &RootOfTrust) -> Result<Vec<GlobalRule>> {
        let mut rules = root.global_rules.clone();
        for link in &root.controller_repositories {
            let controller = Repository::open(&link.location).map_err(|e| {
                Error::Retryable(format!(
                    "controller '{}' at {} unavailable: {}",
                    link.name,
                    link.location.display(),
                    e
                ))
            })?;
            let controller_trust = PolicyStore::new(&controller).require_trust()?;
            rules.extend(controller_trust.document.global_rules.clone());
        }
        rules.extend(self.extra_global_rules.iter().cloned());

        let mut seen = BTreeSet::new();
        rules.retain(|rule| seen.insert(rule.name().to_string()));
        Ok(rules)
    }

    // ---- entry evaluation ----

    fn verify_entry(
        &self,
        anchor: &Anchor,
        entries: &[(ObjectId, RslEntry)],
        position: usize,
    ) -> Result<Verdict> {
        let (entry_id, entry) = &entries[position];
        let predecessor = position.checked_sub(1).map(|p| &entries[p].1);

        let snapshot = self.load_snapshot(&entry.target);
        let predecessor_snapshot =
            predecessor.and_then(|prev| self.load_snapshot(&prev.target));

        let changed_paths = match &snapshot {
            Some(s) => s.changed_paths(predecessor_snapshot.as_ref()),
            None => {
                warn!(
                    entry = %entry_id.short(),
                    "snapshot record unavailable; path rules cannot be evaluated"
                );
                Vec::new()
            }
        };

        let documents = self.reachable_documents(anchor, &entry.ref_name, &changed_paths)?;
        let delegated: BTreeSet<&str> = documents.iter().map(|d| d.name.as_str()).collect();

        let mut satisfied = Vec::new();

        // Reference-scheme rules, conjunctive across every level
        for document in &documents {
            for rule in &document.rules {
                if !rule.matches_ref(&entry.ref_name) {
                    continue;
                }
                if delegated.contains(rule.name.as_str()) {
                    // Delegation: the child's rules decide this scope
                    continue;
                }
                let principals = document.resolve_authorized(rule);
                let signers = self.reference_level_signers(
                    entry,
                    snapshot.as_ref(),
                    &principals,
                )?;
                if (signers.len() as u32) < rule.threshold {
                    return Ok(Verdict::reject(
                        entry.ref_name.clone(),
                        Some(*entry_id),
                        Some(rule.name.clone()),
                        format!(
                            "rule '{}': {} of {} required authorizing signatures",
                            rule.name,
                            signers.len(),
                            rule.threshold
                        ),
                        satisfied,
                    ));
                }
                satisfied.push(SatisfiedRule {
                    rule: rule.name.clone(),
                    principals: signers,
                });
            }
        }

        // Path-scheme rules over the changed set; the snapshot author's
        // signatures decide these, never the recorder's
        for document in &documents {
            for rule in &document.rules {
                let matching: Vec<&String> = changed_paths
                    .iter()
                    .filter(|p| rule.matches_path(p))
                    .collect();
                if matching.is_empty() || delegated.contains(rule.name.as_str()) {
                    continue;
                }
                let principals = document.resolve_authorized(rule);
                let signers =
                    self.snapshot_level_signers(snapshot.as_ref(), &principals)?;
                if (signers.len() as u32) < rule.threshold {
                    return Ok(Verdict::reject(
                        entry.ref_name.clone(),
                        Some(*entry_id),
                        Some(rule.name.clone()),
                        format!(
                            "rule '{}' over path '{}': {} of {} required authorizing signatures",
                            rule.name,
                            matching[0],
                            signers.len(),
                            rule.threshold
                        ),
                        satisfied,
                    ));
                }
                satisfied.push(SatisfiedRule {
                    rule: rule.name.clone(),
                    principals: signers,
                });
            }
        }

        // Global rules apply unconditionally
        let trusted: Vec<Principal> = anchor.trusted_principals.values().cloned().collect();
        for rule in &anchor.global_rules {
            if !rule.matches_ref(&entry.ref_name) {
                continue;
            }
            match rule {
                GlobalRule::Threshold { name, threshold, .. } => {
                    let signers =
                        self.reference_level_signers(entry, snapshot.as_ref(), &trusted)?;
                    if (signers.len() as u32) < *threshold {
                        return Ok(Verdict::reject(
                            entry.ref_name.clone(),
                            Some(*entry_id),
                            Some(name.clone()),
                            format!(
                                "global rule '{}': {} of {} required authorizing signatures",
                                name,
                                signers.len(),
                                threshold
                            ),
                            satisfied,
                        ));
                    }
                    satisfied.push(SatisfiedRule {
                        rule: name.clone(),
                        principals: signers,
                    });
                }
                GlobalRule::BlockForcePush { name, .. } => {
                    if let Some(prev) = predecessor {
                        if !self.is_fast_forward(&snapshot, prev, entry)? {
                            return Ok(Verdict::reject(
                                entry.ref_name.clone(),
                                Some(*entry_id),
                                Some(name.clone()),
                                format!(
                                    "global rule '{}': transition is not fast-forward",
                                    name
                                ),
                                satisfied,
                            ));
                        }
                    }
                    satisfied.push(SatisfiedRule {
                        rule: name.clone(),
                        principals: Vec::new(),
                    });
                }
            }
        }

        Ok(Verdict::accept(
            entry.ref_name.clone(),
            Some(*entry_id),
            satisfied,
        ))
    }

    /// Policy documents reachable from the top level through delegations
    /// whose rules match the reference or a changed path
    fn reachable_documents(
        &self,
        anchor: &Anchor,
        ref_name: &str,
        changed_paths: &[String],
    ) -> Result<Vec<PolicyDocument>> {
        let by_name: BTreeMap<&str, &PolicyDocument> = anchor
            .documents
            .iter()
            .map(|d| (d.name.as_str(), d))
            .collect();

        let mut included: Vec<PolicyDocument> = Vec::new();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut queue: Vec<&PolicyDocument> = Vec::new();

        if let Some(top) = by_name.get(refseal_policy::TOP_LEVEL_POLICY).copied() {
            visited.insert(top.name.clone());
            queue.push(top);
        }

        while let Some(document) = queue.pop() {
            for rule in &document.rules {
                let in_scope = rule_in_scope(rule, ref_name, changed_paths);
                if let Some(child) = by_name.get(rule.name.as_str()).copied() {
                    if in_scope && visited.insert(child.name.clone()) {
                        queue.push(child);
                    }
                }
            }
            included.push(document.clone());
        }
        Ok(included)
    }

    /// Principals authorizing the reference transition: the entry's
    /// signer plus snapshot approvals, counted by distinct principal
    fn reference_level_signers(
        &self,
        entry: &RslEntry,
        snapshot: Option<&Snapshot>,
        principals: &[Principal],
    ) -> Result<Vec<String>> {
        let entry_payload = entry.payload()?;
        let snapshot_payload = match snapshot {
            Some(s) => Some(s.payload()?),
            None => None,
        };

        let mut signers = Vec::new();
        for principal in principals {
            let signed_entry = principal.holds_key(&entry.signer)
                && self
                    .verifier
                    .verify_principal(principal, &entry_payload, &entry.signature);
            let approved = self.approved_by(principal, snapshot, snapshot_payload.as_deref());
            if signed_entry || approved {
                signers.push(principal.id.clone());
            }
        }
        Ok(signers)
    }

    /// Principals authorizing the snapshot content: the author plus
    /// approvals
    fn snapshot_level_signers(
        &self,
        snapshot: Option<&Snapshot>,
        principals: &[Principal],
    ) -> Result<Vec<String>> {
        let snapshot = match snapshot {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };
        let payload = snapshot.payload()?;

        let mut signers = Vec::new();
        for principal in principals {
            let authored = principal.holds_key(&snapshot.author)
                && self
                    .verifier
                    .verify_principal(principal, &payload, &snapshot.signature);
            let approved = self.approved_by(principal, Some(snapshot), Some(&payload));
            if authored || approved {
                signers.push(principal.id.clone());
            }
        }
        Ok(signers)
    }

    fn approved_by(
        &self,
        principal: &Principal,
        snapshot: Option<&Snapshot>,
        payload: Option<&[u8]>,
    ) -> bool {
        let (snapshot, payload) = match (snapshot, payload) {
            (Some(s), Some(p)) => (s, p),
            _ => return false,
        };
        snapshot.approvals.iter().any(|approval| {
            principal.holds_key(&approval.key)
                && self
                    .verifier
                    .verify_principal(principal, payload, &approval.signature)
        })
    }

    /// Fast-forward check: the new snapshot must descend from (or equal)
    /// the predecessor's. Missing ancestry fails closed.
    fn is_fast_forward(
        &self,
        snapshot: &Option<Snapshot>,
        predecessor: &RslEntry,
        entry: &RslEntry,
    ) -> Result<bool> {
        if entry.target == predecessor.target {
            return Ok(true);
        }
        match snapshot {
            Some(s) => s.is_descendant_of(self.repo, &predecessor.target),
            None => Ok(false),
        }
    }

    fn load_snapshot(&self, id: &ObjectId) -> Option<Snapshot> {
        if !self.repo.has_object(id) {
            return None;
        }
        self.repo.get_record(id).ok()
    }

    fn log_verdict(&self, verdict: &Verdict) {
        if verdict.accepted {
            info!(ref_name = %verdict.ref_name, "verification accepted");
        } else {
            info!(
                ref_name = %verdict.ref_name,
                violated = verdict.violated_rule.as_deref().unwrap_or("-"),
                reason = verdict.reason.as_deref().unwrap_or("-"),
                "verification rejected"
            );
        }
        debug!(satisfied = verdict.satisfied.len(), "rules satisfied");
    }
}

/// Resolved trust state for one verification pass
struct Anchor {
    documents: Vec<PolicyDocument>,
    trusted_principals: BTreeMap<String, Principal>,
    global_rules: Vec<GlobalRule>,
}

fn rule_in_scope(rule: &Rule, ref_name: &str, changed_paths: &[String]) -> bool {
    rule.matches_ref(ref_name) || changed_paths.iter().any(|p| rule.matches_path(p))
}
