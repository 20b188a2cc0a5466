//! Rule patterns matching reference names or content paths
//!
//! A pattern is written `ref:<glob>` or `path:<glob>`. The legacy
//! spellings `git:` and `file:` are accepted as aliases. The two schemes
//! are evaluated independently: `ref:` patterns match reference names,
//! `path:` patterns match paths changed by a snapshot.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which namespace a pattern matches against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternScheme {
    /// Matches reference names (e.g. `refs/heads/main`)
    Ref,

    /// Matches content paths within a snapshot (e.g. `src/*`)
    Path,
}

/// A scheme-qualified glob pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulePattern {
    pub scheme: PatternScheme,
    pub pattern: String,
}

impl RulePattern {
    /// Parse from the `scheme:glob` form
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, rest) = match s.split_once(':') {
            Some((scheme, rest)) => (scheme, rest),
            None => {
                return Err(Error::Validation(format!(
                    "pattern '{}' is missing a scheme prefix (ref: or path:)",
                    s
                )))
            }
        };

        let scheme = match scheme {
            "ref" | "git" => PatternScheme::Ref,
            "path" | "file" => PatternScheme::Path,
            other => {
                return Err(Error::Validation(format!(
                    "unknown pattern scheme '{}' in '{}'",
                    other, s
                )))
            }
        };

        if rest.is_empty() {
            return Err(Error::Validation(format!("pattern '{}' has an empty glob", s)));
        }

        // Validate the glob up front so matching can never fail later
        glob::Pattern::new(rest)
            .map_err(|e| Error::Validation(format!("invalid glob '{}': {}", rest, e)))?;

        Ok(Self {
            scheme,
            pattern: rest.to_string(),
        })
    }

    /// Shorthand for a reference pattern
    pub fn for_ref(pattern: impl Into<String>) -> Result<Self> {
        Self::parse(&format!("ref:{}", pattern.into()))
    }

    /// Shorthand for a content-path pattern
    pub fn for_path(pattern: impl Into<String>) -> Result<Self> {
        Self::parse(&format!("path:{}", pattern.into()))
    }

    /// Whether this pattern matches the given reference name
    pub fn matches_ref(&self, ref_name: &str) -> bool {
        self.scheme == PatternScheme::Ref && self.glob_matches(ref_name)
    }

    /// Whether this pattern matches the given content path
    pub fn matches_path(&self, path: &str) -> bool {
        self.scheme == PatternScheme::Path && self.glob_matches(path)
    }

    fn glob_matches(&self, candidate: &str) -> bool {
        match glob::Pattern::new(&self.pattern) {
            Ok(pattern) => pattern.matches(candidate),
            // Patterns are validated at parse time; fail closed regardless
            Err(_) => false,
        }
    }
}

impl fmt::Display for RulePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            PatternScheme::Ref => "ref",
            PatternScheme::Path => "path",
        };
        write!(f, "{}:{}", scheme, self.pattern)
    }
}
