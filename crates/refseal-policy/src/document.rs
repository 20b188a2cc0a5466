//! Policy documents and threshold rules
//!
//! A policy document names trusted principals and the rules protecting
//! references and paths. A rule whose name matches another policy
//! document delegates its scope to that document; delegation adds the
//! child's rules, it never shadows the parent's.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use refseal_core::{Error, Principal, Result, RulePattern};

use crate::draft::Document;

/// Name of the top-level policy document
pub const TOP_LEVEL_POLICY: &str = "targets";

/// A named threshold rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique within the owning document; doubles as the delegated
    /// policy name when a document of this name exists
    pub name: String,

    /// Patterns this rule protects (`ref:` and/or `path:` schemes)
    pub patterns: Vec<RulePattern>,

    /// IDs of principals authorized under this rule
    pub authorized: BTreeSet<String>,

    /// Distinct authorizing principals required
    pub threshold: u32,
}

impl Rule {
    /// Whether any pattern matches the reference name
    pub fn matches_ref(&self, ref_name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches_ref(ref_name))
    }

    /// Whether any pattern matches the content path
    pub fn matches_path(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches_path(path))
    }
}

/// A signed rule set naming who may author changes to which scopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Document name (`targets` for the top level)
    pub name: String,

    /// Monotonic revision counter
    pub version: u64,

    /// Trusted principals, by ID
    pub principals: BTreeMap<String, Principal>,

    /// Ordered rules; all matching rules apply
    pub rules: Vec<Rule>,
}

impl Document for PolicyDocument {
    const KIND: &'static str = "policy";

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl PolicyDocument {
    /// Fresh, empty policy document
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            principals: BTreeMap::new(),
            rules: Vec::new(),
        }
    }

    /// Add a trusted principal, merging keys when the ID exists
    pub fn add_principal(&mut self, principal: Principal) -> Result<()> {
        if principal.keys.is_empty() {
            return Err(Error::Validation(format!(
                "principal '{}' has no keys",
                principal.id
            )));
        }
        match self.principals.get_mut(&principal.id) {
            Some(existing) => {
                for key in principal.keys {
                    existing.add_key(key);
                }
            }
            None => {
                self.principals.insert(principal.id.clone(), principal);
            }
        }
        Ok(())
    }

    /// Add a rule; the name must be unique and the threshold satisfiable
    pub fn add_rule(&mut self, rule: Rule) -> Result<()> {
        if rule.name.is_empty() {
            return Err(Error::Validation("rule name is empty".to_string()));
        }
        if self.rules.iter().any(|r| r.name == rule.name) {
            return Err(Error::Validation(format!("duplicate rule '{}'", rule.name)));
        }
        if rule.patterns.is_empty() {
            return Err(Error::Validation(format!(
                "rule '{}' has no patterns",
                rule.name
            )));
        }
        if rule.authorized.is_empty() {
            return Err(Error::Validation(format!(
                "rule '{}' authorizes nobody",
                rule.name
            )));
        }
        for id in &rule.authorized {
            if !self.principals.contains_key(id) {
                return Err(Error::Validation(format!(
                    "rule '{}' authorizes unknown principal '{}'",
                    rule.name, id
                )));
            }
        }
        if rule.threshold == 0 || rule.threshold as usize > rule.authorized.len() {
            return Err(Error::Validation(format!(
                "rule '{}': threshold {} not in 1..={} authorized principal(s)",
                rule.name,
                rule.threshold,
                rule.authorized.len()
            )));
        }
        self.rules.push(rule);
        Ok(())
    }

    /// Remove a rule by name
    pub fn remove_rule(&mut self, name: &str) -> Result<()> {
        let before = self.rules.len();
        self.rules.retain(|r| r.name != name);
        if self.rules.len() == before {
            return Err(Error::Validation(format!("no rule named '{}'", name)));
        }
        Ok(())
    }

    /// Look up a rule by name
    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Resolve the principals a rule authorizes
    pub fn resolve_authorized(&self, rule: &Rule) -> Vec<Principal> {
        rule.authorized
            .iter()
            .filter_map(|id| self.principals.get(id).cloned())
            .collect()
    }

    /// Re-validate the whole document (staging checkpoint)
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("policy name is empty".to_string()));
        }
        let mut seen = BTreeSet::new();
        for rule in &self.rules {
            if !seen.insert(&rule.name) {
                return Err(Error::Validation(format!("duplicate rule '{}'", rule.name)));
            }
            for id in &rule.authorized {
                if !self.principals.contains_key(id) {
                    return Err(Error::Validation(format!(
                        "rule '{}' authorizes unknown principal '{}'",
                        rule.name, id
                    )));
                }
            }
            if rule.threshold == 0 || rule.threshold as usize > rule.authorized.len() {
                return Err(Error::Validation(format!(
                    "rule '{}': threshold {} not in 1..={} authorized principal(s)",
                    rule.name,
                    rule.threshold,
                    rule.authorized.len()
                )));
            }
        }
        Ok(())
    }
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

    fn rule(name: &str, pattern: &str, authorized: &[&str], threshold: u32) -> Rule {
        Rule {
            name: name.to_string(),
            patterns: vec![RulePattern::parse(pattern).unwrap()],
            authorized: authorized.iter().map(|s| s.to_string()).collect(),
            threshold,
        }
    }

    #[test]
    fn test_threshold_above_authorized_rejected() {
        let mut doc = PolicyDocument::new(TOP_LEVEL_POLICY);
        doc.add_principal(principal("Alice")).unwrap();

        let err = doc
            .add_rule(rule("protect-main", "ref:refs/heads/main", &["Alice"], 2))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_duplicate_rule_name_rejected() {
        let mut doc = PolicyDocument::new(TOP_LEVEL_POLICY);
        doc.add_principal(principal("Alice")).unwrap();
        doc.add_rule(rule("protect-main", "ref:refs/heads/main", &["Alice"], 1))
            .unwrap();
        assert!(doc
            .add_rule(rule("protect-main", "ref:refs/heads/*", &["Alice"], 1))
            .is_err());
    }

    #[test]
    fn test_unknown_principal_rejected() {
        let mut doc = PolicyDocument::new(TOP_LEVEL_POLICY);
        assert!(doc
            .add_rule(rule("protect-main", "ref:refs/heads/main", &["Ghost"], 1))
            .is_err());
    }

    #[test]
    fn test_rule_matching_schemes_are_independent() {
        let mut doc = PolicyDocument::new(TOP_LEVEL_POLICY);
        doc.add_principal(principal("Alice")).unwrap();
        doc.add_rule(rule("protect-readme", "path:README.md", &["Alice"], 1))
            .unwrap();

        let r = doc.rule("protect-readme").unwrap();
        assert!(r.matches_path("README.md"));
        assert!(!r.matches_ref("README.md"));
    }

    #[test]
    fn test_remove_rule() {
        let mut doc = PolicyDocument::new(TOP_LEVEL_POLICY);
        doc.add_principal(principal("Alice")).unwrap();
        doc.add_rule(rule("protect-main", "ref:refs/heads/main", &["Alice"], 1))
            .unwrap();
        doc.remove_rule("protect-main").unwrap();
        assert!(doc.remove_rule("protect-main").is_err());
    }
}
