//! Trust root and policy stores
//!
//! Both stores follow the same staged lifecycle: mutations land in a
//! draft under `refs/refseal/staging/`, `sign` collects signatures, and
//! `apply` performs the threshold-checked atomic replacement of the
//! applied document under `refs/refseal/trust` or
//! `refs/refseal/policy/<name>`.

use tracing::{debug, info};

use refseal_core::{
    Error, ObjectId, Principal, Repository, Result, SecretKey, SignatureVerifier,
    POLICY_REF_PREFIX, STAGING_REF_PREFIX, TRUST_REF,
};

use crate::document::{PolicyDocument, Rule, TOP_LEVEL_POLICY};
use crate::draft::{
    apply_draft, count_valid_signatures, document_payload, AppliedDocument, Document, Draft,
    SignerRequirement,
};
use crate::root::{GlobalRule, RepositoryLink, RootOfTrust};

const TRUST_STAGING_REF: &str = "refs/refseal/staging/trust";

fn policy_ref(name: &str) -> String {
    format!("{}/{}", POLICY_REF_PREFIX, name)
}

fn policy_staging_ref(name: &str) -> String {
    format!("{}/policy/{}", STAGING_REF_PREFIX, name)
}

/// Store facade over one repository's trust and policy state
pub struct PolicyStore<'a> {
    repo: &'a Repository,
}

impl<'a> PolicyStore<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    // ---- trust root ----

    /// Initialize the root of trust with its first root principal
    pub fn trust_init(&self, initial_root: Principal) -> Result<()> {
        if self.repo.read_ref(TRUST_REF)?.is_some() {
            return Err(Error::Validation(
                "root of trust already initialized".to_string(),
            ));
        }
        if self.repo.read_ref(TRUST_STAGING_REF)?.is_some() {
            return Err(Error::Validation(
                "a root-of-trust draft is already staged".to_string(),
            ));
        }
        let draft = Draft::initial(RootOfTrust::new(initial_root));
        self.save_trust_draft(&draft)?;
        info!("staged initial root of trust");
        Ok(())
    }

    /// Load the staged root-of-trust draft
    pub fn trust_draft(&self) -> Result<Draft<RootOfTrust>> {
        match self.repo.read_ref(TRUST_STAGING_REF)? {
            Some(id) => self.repo.get_record(&id),
            None => match self.current_trust()? {
                Some((_, applied)) => Ok(Draft::from_applied(&applied.document)),
                None => Err(Error::NotFound(
                    "no root of trust; run trust init first".to_string(),
                )),
            },
        }
    }

    fn save_trust_draft(&self, draft: &Draft<RootOfTrust>) -> Result<()> {
        let id = self.repo.put_record(draft)?;
        let expected = self.repo.read_ref(TRUST_STAGING_REF)?;
        self.repo.update_ref(TRUST_STAGING_REF, id, expected)
    }

    /// Stage a mutation of the root of trust, dropping stale signatures
    pub fn trust_mutate(&self, f: impl FnOnce(&mut RootOfTrust) -> Result<()>) -> Result<()> {
        let mut draft = self.trust_draft()?;
        draft.mutate(f)?;
        self.save_trust_draft(&draft)
    }

    /// Sign the staged root-of-trust draft
    pub fn trust_sign(&self, secret: &SecretKey) -> Result<()> {
        let mut draft = self.trust_draft()?;
        draft.sign(secret)?;
        self.save_trust_draft(&draft)?;
        debug!(key = %secret.key_id()?.short(), "signed root-of-trust draft");
        Ok(())
    }

    /// Validate the staged draft without applying it
    pub fn trust_stage(&self) -> Result<()> {
        let draft = self.trust_draft()?;
        if draft.document.root_principals.is_empty() {
            return Err(Error::Validation(
                "root of trust names no root principals".to_string(),
            ));
        }
        debug!(version = draft.document.version, "root-of-trust draft staged");
        Ok(())
    }

    /// Threshold-check and apply the staged root-of-trust draft
    ///
    /// The requirement comes from the previously applied revision;
    /// bootstrap applies are checked against the draft's own principals.
    pub fn trust_apply(&self, verifier: &SignatureVerifier) -> Result<ObjectId> {
        let draft = self.trust_draft()?;
        let requirement = match self.current_trust()? {
            Some((_, applied)) => SignerRequirement {
                principals: applied.document.root_signers(),
                threshold: applied.document.root_threshold,
                context: format!(
                    "root of trust v{} apply",
                    draft.document.version
                ),
            },
            None => SignerRequirement {
                principals: draft.document.root_signers(),
                threshold: draft.document.root_threshold,
                context: "root of trust bootstrap apply".to_string(),
            },
        };
        apply_draft(
            self.repo,
            TRUST_REF,
            TRUST_STAGING_REF,
            &draft,
            &requirement,
            verifier,
        )
    }

    /// The currently applied root of trust, if any
    pub fn current_trust(&self) -> Result<Option<(ObjectId, AppliedDocument<RootOfTrust>)>> {
        match self.repo.read_ref(TRUST_REF)? {
            Some(id) => Ok(Some((id, self.repo.get_record(&id)?))),
            None => Ok(None),
        }
    }

    /// The applied root of trust, required
    pub fn require_trust(&self) -> Result<AppliedDocument<RootOfTrust>> {
        self.current_trust()?
            .map(|(_, applied)| applied)
            .ok_or_else(|| Error::Trust("no applied root of trust".to_string()))
    }

    /// Check the applied root of trust is internally valid: its recorded
    /// signatures meet its own root threshold
    pub fn validate_trust_anchor(&self, verifier: &SignatureVerifier) -> Result<RootOfTrust> {
        let applied = self.require_trust()?;
        let payload = document_payload(&applied.document)?;
        let (count, _) = count_valid_signatures(
            verifier,
            &applied.document.root_signers(),
            &payload,
            &applied.signatures,
        );
        if count < applied.document.root_threshold {
            return Err(Error::Trust(format!(
                "root of trust v{}: {} of {} required root signatures valid",
                applied.document.version, count, applied.document.root_threshold
            )));
        }
        Ok(applied.document)
    }

    // ---- convenience trust mutations (one engine op per CLI subcommand) ----

    pub fn trust_add_root_principal(&self, principal: Principal) -> Result<()> {
        self.trust_mutate(|root| root.add_root_principal(principal))
    }

    pub fn trust_update_root_threshold(&self, threshold: u32) -> Result<()> {
        self.trust_mutate(|root| root.update_root_threshold(threshold))
    }

    pub fn trust_add_policy_principal(&self, principal: Principal) -> Result<()> {
        self.trust_mutate(|root| root.add_policy_principal(principal))
    }

    pub fn trust_update_policy_threshold(&self, threshold: u32) -> Result<()> {
        self.trust_mutate(|root| root.update_policy_threshold(threshold))
    }

    pub fn trust_add_global_rule(&self, rule: GlobalRule) -> Result<()> {
        self.trust_mutate(|root| root.add_global_rule(rule))
    }

    pub fn trust_make_controller(&self) -> Result<()> {
        self.trust_mutate(|root| {
            root.make_controller();
            Ok(())
        })
    }

    pub fn trust_add_network_repository(&self, link: RepositoryLink) -> Result<()> {
        self.trust_mutate(|root| root.add_network_repository(link))
    }

    pub fn trust_add_controller_repository(&self, link: RepositoryLink) -> Result<()> {
        self.trust_mutate(|root| root.add_controller_repository(link))
    }

    // ---- policy documents ----

    /// Initialize a policy document draft (`targets` or a delegated name)
    pub fn policy_init(&self, name: &str) -> Result<()> {
        if self.repo.read_ref(&policy_ref(name))?.is_some() {
            return Err(Error::Validation(format!(
                "policy '{}' already initialized",
                name
            )));
        }
        let staging = policy_staging_ref(name);
        if self.repo.read_ref(&staging)?.is_some() {
            return Err(Error::Validation(format!(
                "a draft for policy '{}' is already staged",
                name
            )));
        }
        let draft = Draft::initial(PolicyDocument::new(name));
        self.save_policy_draft(name, &draft)?;
        info!(policy = name, "staged initial policy document");
        Ok(())
    }

    /// Load the staged draft for a policy document
    pub fn policy_draft(&self, name: &str) -> Result<Draft<PolicyDocument>> {
        match self.repo.read_ref(&policy_staging_ref(name))? {
            Some(id) => self.repo.get_record(&id),
            None => match self.applied_policy(name)? {
                Some((_, applied)) => Ok(Draft::from_applied(&applied.document)),
                None => Err(Error::NotFound(format!(
                    "no policy '{}'; run policy init first",
                    name
                ))),
            },
        }
    }

    fn save_policy_draft(&self, name: &str, draft: &Draft<PolicyDocument>) -> Result<()> {
        let staging = policy_staging_ref(name);
        let id = self.repo.put_record(draft)?;
        let expected = self.repo.read_ref(&staging)?;
        self.repo.update_ref(&staging, id, expected)
    }

    /// Stage a mutation of a policy document, dropping stale signatures
    pub fn policy_mutate(
        &self,
        name: &str,
        f: impl FnOnce(&mut PolicyDocument) -> Result<()>,
    ) -> Result<()> {
        let mut draft = self.policy_draft(name)?;
        draft.mutate(f)?;
        self.save_policy_draft(name, &draft)
    }

    /// Sign a staged policy draft
    pub fn policy_sign(&self, name: &str, secret: &SecretKey) -> Result<()> {
        let mut draft = self.policy_draft(name)?;
        draft.sign(secret)?;
        self.save_policy_draft(name, &draft)?;
        debug!(policy = name, key = %secret.key_id()?.short(), "signed policy draft");
        Ok(())
    }

    /// Validate a staged policy draft without applying it
    pub fn policy_stage(&self, name: &str) -> Result<()> {
        let draft = self.policy_draft(name)?;
        draft.document.validate()?;
        debug!(policy = name, version = draft.document.version, "policy draft staged");
        Ok(())
    }

    /// Threshold-check and apply a staged policy draft
    ///
    /// The top-level document is checked against the root of trust's
    /// policy principals; a delegated document against the principals of
    /// the applied rule that delegates to it.
    pub fn policy_apply(&self, name: &str, verifier: &SignatureVerifier) -> Result<ObjectId> {
        let draft = self.policy_draft(name)?;
        draft.document.validate()?;
        let requirement = self.policy_signer_requirement(name)?;
        apply_draft(
            self.repo,
            &policy_ref(name),
            &policy_staging_ref(name),
            &draft,
            &requirement,
            verifier,
        )
    }

    /// Who must sign for the named policy document to apply
    pub fn policy_signer_requirement(&self, name: &str) -> Result<SignerRequirement> {
        if name == TOP_LEVEL_POLICY {
            let trust = self.require_trust()?;
            if trust.document.policy_principals.is_empty() {
                return Err(Error::Trust(
                    "root of trust delegates no policy principals".to_string(),
                ));
            }
            return Ok(SignerRequirement {
                principals: trust.document.policy_signers(),
                threshold: trust.document.policy_threshold,
                context: format!("policy '{}' apply", name),
            });
        }

        // A delegated document is signed by the principals of the applied
        // rule that shares its name.
        for (_, parent_name) in self.applied_policy_refs()? {
            if parent_name == name {
                continue;
            }
            if let Some((_, parent)) = self.applied_policy(&parent_name)? {
                if let Some(rule) = parent.document.rule(name) {
                    return Ok(SignerRequirement {
                        principals: parent.document.resolve_authorized(rule),
                        threshold: rule.threshold,
                        context: format!(
                            "delegated policy '{}' apply (rule '{}' in '{}')",
                            name, rule.name, parent_name
                        ),
                    });
                }
            }
        }
        Err(Error::Validation(format!(
            "no applied rule delegates to policy '{}'",
            name
        )))
    }

    /// The currently applied revision of a policy document, if any
    pub fn applied_policy(
        &self,
        name: &str,
    ) -> Result<Option<(ObjectId, AppliedDocument<PolicyDocument>)>> {
        match self.repo.read_ref(&policy_ref(name))? {
            Some(id) => Ok(Some((id, self.repo.get_record(&id)?))),
            None => Ok(None),
        }
    }

    /// The applied top-level policy, required
    pub fn require_top_level_policy(&self) -> Result<AppliedDocument<PolicyDocument>> {
        self.applied_policy(TOP_LEVEL_POLICY)?
            .map(|(_, applied)| applied)
            .ok_or_else(|| Error::Trust("no applied top-level policy".to_string()))
    }

    /// (ref name, policy name) pairs for every applied policy document
    pub fn applied_policy_refs(&self) -> Result<Vec<(String, String)>> {
        let prefix = format!("{}/", POLICY_REF_PREFIX);
        Ok(self
            .repo
            .list_refs(&prefix)?
            .into_iter()
            .map(|r| {
                let name = r[prefix.len()..].to_string();
                (r, name)
            })
            .collect())
    }

    /// Check the applied top-level policy is internally valid against the
    /// given root of trust
    pub fn validate_policy_anchor(
        &self,
        root: &RootOfTrust,
        verifier: &SignatureVerifier,
    ) -> Result<PolicyDocument> {
        let applied = self.require_top_level_policy()?;
        let payload = document_payload(&applied.document)?;
        let (count, _) = count_valid_signatures(
            verifier,
            &root.policy_signers(),
            &payload,
            &applied.signatures,
        );
        if count < root.policy_threshold {
            return Err(Error::Trust(format!(
                "top-level policy v{}: {} of {} required policy signatures valid",
                applied.document.version, count, root.policy_threshold
            )));
        }
        Ok(applied.document)
    }

    /// All applied policy documents, top level first
    pub fn applied_documents(&self) -> Result<Vec<PolicyDocument>> {
        let mut documents = Vec::new();
        if let Some((_, top)) = self.applied_policy(TOP_LEVEL_POLICY)? {
            documents.push(top.document);
        }
        for (_, name) in self.applied_policy_refs()? {
            if name == TOP_LEVEL_POLICY {
                continue;
            }
            if let Some((_, applied)) = self.applied_policy(&name)? {
                documents.push(applied.document);
            }
        }
        Ok(documents)
    }

    /// Render every applied rule, for `policy list-rules`
    pub fn list_rules(&self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for document in self.applied_documents()? {
            for rule in &document.rules {
                let patterns: Vec<String> =
                    rule.patterns.iter().map(|p| p.to_string()).collect();
                let authorized: Vec<&str> =
                    rule.authorized.iter().map(String::as_str).collect();
                lines.push(format!(
                    "{}/{}: [{}] -> {} (threshold {})",
                    document.name,
                    rule.name,
                    patterns.join(", "),
                    authorized.join(", "),
                    rule.threshold
                ));
            }
        }
        Ok(lines)
    }

    // ---- convenience policy mutations ----

    pub fn policy_add_principal(&self, name: &str, principal: Principal) -> Result<()> {
        self.policy_mutate(name, |doc| doc.add_principal(principal))
    }

    pub fn policy_add_rule(&self, name: &str, rule: Rule) -> Result<()> {
        self.policy_mutate(name, |doc| doc.add_rule(rule))
    }

    pub fn policy_remove_rule(&self, name: &str, rule_name: &str) -> Result<()> {
        self.policy_mutate(name, |doc| doc.remove_rule(rule_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use refseal_core::{Key, RulePattern};

    struct Actor {
        secret: SecretKey,
        principal: Principal,
    }

    fn actor(id: &str) -> Actor {
        let secret = SecretKey::generate(&mut OsRng);
        let principal = Principal::new(id, Key::from_public_key(secret.public_key().unwrap()));
        Actor { secret, principal }
    }

    fn bootstrap_trust(repo: &Repository, root: &Actor) {
        let store = PolicyStore::new(repo);
        store.trust_init(root.principal.clone()).unwrap();
        store.trust_sign(&root.secret).unwrap();
        store.trust_apply(&SignatureVerifier::new()).unwrap();
    }

    #[test]
    fn test_trust_bootstrap_and_anchor_validation() {
        let repo = Repository::in_memory();
        let root = actor("R1");
        bootstrap_trust(&repo, &root);

        let store = PolicyStore::new(&repo);
        let anchor = store.validate_trust_anchor(&SignatureVerifier::new()).unwrap();
        assert_eq!(anchor.version, 1);
        assert_eq!(anchor.root_threshold, 1);
    }

    #[test]
    fn test_apply_requires_previous_signers() {
        let repo = Repository::in_memory();
        let verifier = SignatureVerifier::new();
        let r1 = actor("R1");
        let r2 = actor("R2");
        let r3 = actor("R3");
        bootstrap_trust(&repo, &r1);

        let store = PolicyStore::new(&repo);
        store.trust_add_root_principal(r2.principal.clone()).unwrap();
        store.trust_add_root_principal(r3.principal.clone()).unwrap();
        store.trust_update_root_threshold(2).unwrap();

        // Unsigned drafts never apply
        assert!(matches!(store.trust_apply(&verifier), Err(Error::Trust(_))));

        // v1 requires one signature from the previous (v1) root set
        store.trust_sign(&r1.secret).unwrap();
        store.trust_apply(&verifier).unwrap();

        // Next revision requires 2-of-3
        store.trust_make_controller().unwrap();
        store.trust_sign(&r2.secret).unwrap();
        let err = store.trust_apply(&verifier).unwrap_err();
        assert!(matches!(err, Error::Trust(_)));

        store.trust_sign(&r3.secret).unwrap();
        store.trust_apply(&verifier).unwrap();
    }

    #[test]
    fn test_apply_is_idempotent_but_rejects_stale_draft() {
        let repo = Repository::in_memory();
        let verifier = SignatureVerifier::new();
        let root = actor("R1");
        bootstrap_trust(&repo, &root);

        let store = PolicyStore::new(&repo);
        let applied = store.current_trust().unwrap().unwrap().0;

        // Re-applying an identical draft creates no new version
        let mut identical = Draft::from_applied(&store.require_trust().unwrap().document);
        identical.document.set_version(store.require_trust().unwrap().document.version);
        identical.base_version = identical.document.version;
        let re_applied = apply_draft(
            &repo,
            TRUST_REF,
            TRUST_STAGING_REF,
            &identical,
            &SignerRequirement {
                principals: vec![root.principal.clone()],
                threshold: 1,
                context: "test".to_string(),
            },
            &verifier,
        )
        .unwrap();
        assert_eq!(re_applied, applied);

        // A draft staged before another apply is stale
        let stale = store.trust_draft().unwrap();
        store.trust_make_controller().unwrap();
        store.trust_sign(&root.secret).unwrap();
        store.trust_apply(&verifier).unwrap();

        let mut stale = stale;
        stale.sign(&root.secret).unwrap();
        let err = apply_draft(
            &repo,
            TRUST_REF,
            TRUST_STAGING_REF,
            &stale,
            &SignerRequirement {
                principals: vec![root.principal.clone()],
                threshold: 1,
                context: "test".to_string(),
            },
            &verifier,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_top_level_policy_lifecycle() {
        let repo = Repository::in_memory();
        let verifier = SignatureVerifier::new();
        let root = actor("R1");
        let policy_key = actor("P1");
        let alice = actor("Alice");
        bootstrap_trust(&repo, &root);

        let store = PolicyStore::new(&repo);
        store
            .trust_add_policy_principal(policy_key.principal.clone())
            .unwrap();
        store.trust_sign(&root.secret).unwrap();
        store.trust_apply(&verifier).unwrap();

        store.policy_init(TOP_LEVEL_POLICY).unwrap();
        store
            .policy_add_principal(TOP_LEVEL_POLICY, alice.principal.clone())
            .unwrap();
        store
            .policy_add_rule(
                TOP_LEVEL_POLICY,
                Rule {
                    name: "protect-main".to_string(),
                    patterns: vec![RulePattern::parse("ref:refs/heads/main").unwrap()],
                    authorized: ["Alice".to_string()].into(),
                    threshold: 1,
                },
            )
            .unwrap();

        // The policy key, not the root key, must sign
        store.policy_sign(TOP_LEVEL_POLICY, &root.secret).unwrap();
        assert!(matches!(
            store.policy_apply(TOP_LEVEL_POLICY, &verifier),
            Err(Error::Trust(_))
        ));

        store.policy_sign(TOP_LEVEL_POLICY, &policy_key.secret).unwrap();
        store.policy_apply(TOP_LEVEL_POLICY, &verifier).unwrap();

        let rules = store.list_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].contains("protect-main"));
        assert!(rules[0].contains("threshold 1"));
    }

    #[test]
    fn test_delegated_policy_signed_by_rule_principals() {
        let repo = Repository::in_memory();
        let verifier = SignatureVerifier::new();
        let root = actor("R1");
        let policy_key = actor("P1");
        let alice = actor("Alice");
        let bob = actor("Bob");
        bootstrap_trust(&repo, &root);

        let store = PolicyStore::new(&repo);
        store
            .trust_add_policy_principal(policy_key.principal.clone())
            .unwrap();
        store.trust_sign(&root.secret).unwrap();
        store.trust_apply(&verifier).unwrap();

        store.policy_init(TOP_LEVEL_POLICY).unwrap();
        store
            .policy_add_principal(TOP_LEVEL_POLICY, alice.principal.clone())
            .unwrap();
        store
            .policy_add_rule(
                TOP_LEVEL_POLICY,
                Rule {
                    name: "protect-main".to_string(),
                    patterns: vec![RulePattern::parse("ref:refs/heads/main").unwrap()],
                    authorized: ["Alice".to_string()].into(),
                    threshold: 1,
                },
            )
            .unwrap();
        store.policy_sign(TOP_LEVEL_POLICY, &policy_key.secret).unwrap();
        store.policy_apply(TOP_LEVEL_POLICY, &verifier).unwrap();

        // Delegated document of the same name as the rule, signed by Alice
        store.policy_init("protect-main").unwrap();
        store
            .policy_add_principal("protect-main", bob.principal.clone())
            .unwrap();
        store
            .policy_add_rule(
                "protect-main",
                Rule {
                    name: "protect-main-delegated".to_string(),
                    patterns: vec![RulePattern::parse("ref:refs/heads/main").unwrap()],
                    authorized: ["Bob".to_string()].into(),
                    threshold: 1,
                },
            )
            .unwrap();

        store.policy_sign("protect-main", &bob.secret).unwrap();
        assert!(matches!(
            store.policy_apply("protect-main", &verifier),
            Err(Error::Trust(_))
        ));

        store.policy_sign("protect-main", &alice.secret).unwrap();
        store.policy_apply("protect-main", &verifier).unwrap();
    }
}
