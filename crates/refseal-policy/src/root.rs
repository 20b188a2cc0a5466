//! Root-of-trust document
//!
//! The trust anchor: names who may appoint policy authors, carries the
//! network-wide global rules, and links controller and network
//! repositories for multi-repository deployments.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use refseal_core::{Error, Principal, Result, RulePattern};

use crate::draft::Document;

/// A rule applied network-wide from a controller's root of trust
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GlobalRule {
    /// Require `threshold` distinct authorizing signatures, counted
    /// against principals the verified repository itself trusts
    Threshold {
        name: String,
        patterns: Vec<RulePattern>,
        threshold: u32,
    },

    /// Reject non-fast-forward transitions of matching references
    BlockForcePush {
        name: String,
        patterns: Vec<RulePattern>,
    },
}

impl GlobalRule {
    pub fn name(&self) -> &str {
        match self {
            GlobalRule::Threshold { name, .. } => name,
            GlobalRule::BlockForcePush { name, .. } => name,
        }
    }

    pub fn patterns(&self) -> &[RulePattern] {
        match self {
            GlobalRule::Threshold { patterns, .. } => patterns,
            GlobalRule::BlockForcePush { patterns, .. } => patterns,
        }
    }

    /// Whether any pattern matches the reference name
    pub fn matches_ref(&self, ref_name: &str) -> bool {
        self.patterns().iter().any(|p| p.matches_ref(ref_name))
    }

    fn validate(&self) -> Result<()> {
        if self.name().is_empty() {
            return Err(Error::Validation("global rule name is empty".to_string()));
        }
        if self.patterns().is_empty() {
            return Err(Error::Validation(format!(
                "global rule '{}' has no patterns",
                self.name()
            )));
        }
        if let GlobalRule::Threshold { threshold, name, .. } = self {
            if *threshold == 0 {
                return Err(Error::Validation(format!(
                    "global rule '{}' has a zero threshold",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// A link to another repository in a controller/network deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryLink {
    /// Name the link is registered under
    pub name: String,

    /// Location of the linked repository
    pub location: PathBuf,

    /// Principal bootstrapping trust in the linked repository's root
    pub initial_root_principal: Principal,
}

/// The root-of-trust document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootOfTrust {
    /// Monotonic revision counter
    pub version: u64,

    /// Principals allowed to sign new root revisions
    pub root_principals: BTreeMap<String, Principal>,

    /// Distinct root principals required to apply a revision
    pub root_threshold: u32,

    /// Principals delegated to author the top-level policy
    pub policy_principals: BTreeMap<String, Principal>,

    /// Distinct policy principals required to apply the top-level policy
    pub policy_threshold: u32,

    /// Network-wide rules (meaningful on controllers)
    pub global_rules: Vec<GlobalRule>,

    /// Whether this repository acts as a controller
    pub controller: bool,

    /// Network repositories governed by this controller
    pub network_repositories: Vec<RepositoryLink>,

    /// Controllers governing this repository
    pub controller_repositories: Vec<RepositoryLink>,
}

impl Document for RootOfTrust {
    const KIND: &'static str = "root-of-trust";

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl RootOfTrust {
    /// Fresh root of trust with one root principal and threshold 1
    pub fn new(initial_root: Principal) -> Self {
        let mut root_principals = BTreeMap::new();
        root_principals.insert(initial_root.id.clone(), initial_root);
        Self {
            version: 0,
            root_principals,
            root_threshold: 1,
            policy_principals: BTreeMap::new(),
            policy_threshold: 1,
            global_rules: Vec::new(),
            controller: false,
            network_repositories: Vec::new(),
            controller_repositories: Vec::new(),
        }
    }

    /// Add (or extend) a root principal
    pub fn add_root_principal(&mut self, principal: Principal) -> Result<()> {
        insert_principal(&mut self.root_principals, principal)
    }

    /// Update the root signing threshold
    pub fn update_root_threshold(&mut self, threshold: u32) -> Result<()> {
        check_threshold(threshold, self.root_principals.len(), "root")?;
        self.root_threshold = threshold;
        Ok(())
    }

    /// Add (or extend) a delegated policy principal
    pub fn add_policy_principal(&mut self, principal: Principal) -> Result<()> {
        insert_principal(&mut self.policy_principals, principal)
    }

    /// Update the policy signing threshold
    pub fn update_policy_threshold(&mut self, threshold: u32) -> Result<()> {
        check_threshold(threshold, self.policy_principals.len(), "policy")?;
        self.policy_threshold = threshold;
        Ok(())
    }

    /// Add a global rule (unique by name)
    pub fn add_global_rule(&mut self, rule: GlobalRule) -> Result<()> {
        rule.validate()?;
        if self.global_rules.iter().any(|r| r.name() == rule.name()) {
            return Err(Error::Validation(format!(
                "duplicate global rule '{}'",
                rule.name()
            )));
        }
        self.global_rules.push(rule);
        Ok(())
    }

    /// Mark this repository as a controller
    pub fn make_controller(&mut self) {
        self.controller = true;
    }

    /// Register a network repository under this controller
    pub fn add_network_repository(&mut self, link: RepositoryLink) -> Result<()> {
        if !self.controller {
            return Err(Error::Validation(
                "repository is not a controller; run make-controller first".to_string(),
            ));
        }
        insert_link(&mut self.network_repositories, link, "network")
    }

    /// Register a controller governing this repository
    pub fn add_controller_repository(&mut self, link: RepositoryLink) -> Result<()> {
        insert_link(&mut self.controller_repositories, link, "controller")
    }

    /// Candidate signers for root revisions
    pub fn root_signers(&self) -> Vec<Principal> {
        self.root_principals.values().cloned().collect()
    }

    /// Candidate signers for the top-level policy
    pub fn policy_signers(&self) -> Vec<Principal> {
        self.policy_principals.values().cloned().collect()
    }
}

fn insert_principal(
    map: &mut BTreeMap<String, Principal>,
    principal: Principal,
) -> Result<()> {
    if principal.keys.is_empty() {
        return Err(Error::Validation(format!(
            "principal '{}' has no keys",
            principal.id
        )));
    }
    match map.get_mut(&principal.id) {
        Some(existing) => {
            for key in principal.keys {
                existing.add_key(key);
            }
        }
        None => {
            map.insert(principal.id.clone(), principal);
        }
    }
    Ok(())
}

fn insert_link(links: &mut Vec<RepositoryLink>, link: RepositoryLink, kind: &str) -> Result<()> {
    if link.name.is_empty() {
        return Err(Error::Validation(format!("{} repository name is empty", kind)));
    }
    if links.iter().any(|l| l.name == link.name) {
        return Err(Error::Validation(format!(
            "duplicate {} repository '{}'",
            kind, link.name
        )));
    }
    links.push(link);
    Ok(())
}

fn check_threshold(threshold: u32, principal_count: usize, which: &str) -> Result<()> {
    if threshold == 0 {
        return Err(Error::Validation(format!(
            "{} threshold must be positive",
            which
        )));
    }
    if threshold as usize > principal_count {
        return Err(Error::Validation(format!(
            "{} threshold {} exceeds {} principal(s)",
            which, threshold, principal_count
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use refseal_core::{Key, SecretKey};

    fn principal(id: &str) -> Principal {
        let secret = SecretKey::generate(&mut OsRng);
        Principal::new(id, Key::from_public_key(secret.public_key().unwrap()))
    }

    #[test]
    fn test_threshold_bounded_by_principals() {
        let mut root = RootOfTrust::new(principal("R1"));
        assert!(root.update_root_threshold(2).is_err());

        root.add_root_principal(principal("R2")).unwrap();
        root.update_root_threshold(2).unwrap();
        assert_eq!(root.root_threshold, 2);

        assert!(root.update_root_threshold(0).is_err());
    }

    #[test]
    fn test_network_repository_requires_controller() {
        let mut root = RootOfTrust::new(principal("R1"));
        let link = RepositoryLink {
            name: "network".to_string(),
            location: PathBuf::from("/tmp/network"),
            initial_root_principal: principal("root"),
        };
        assert!(root.add_network_repository(link.clone()).is_err());

        root.make_controller();
        root.add_network_repository(link.clone()).unwrap();
        assert!(root.add_network_repository(link).is_err());
    }

    #[test]
    fn test_global_rule_validation() {
        let mut root = RootOfTrust::new(principal("R1"));
        let rule = GlobalRule::Threshold {
            name: "global-branch-threshold".to_string(),
            patterns: vec![RulePattern::parse("ref:refs/heads/*").unwrap()],
            threshold: 1,
        };
        root.add_global_rule(rule.clone()).unwrap();
        assert!(root.add_global_rule(rule).is_err());

        assert!(root
            .add_global_rule(GlobalRule::Threshold {
                name: "zero".to_string(),
                patterns: vec![RulePattern::parse("ref:refs/heads/*").unwrap()],
                threshold: 0,
            })
            .is_err());
    }

    #[test]
    fn test_add_key_to_existing_principal_merges() {
        let mut root = RootOfTrust::new(principal("R1"));
        let extra = SecretKey::generate(&mut OsRng);
        let mut r1 = principal("R1");
        r1.keys = vec![Key::from_public_key(extra.public_key().unwrap())];
        root.add_root_principal(r1).unwrap();
        assert_eq!(root.root_principals["R1"].keys.len(), 2);
    }
}
