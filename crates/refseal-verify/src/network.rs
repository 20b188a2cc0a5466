//! Multi-repository verification
//!
//! From a controller, iterates every registered network repository,
//! propagates its reference state log, and verifies each member under the
//! controller's global rules layered atop the member's own policy.
//! Overall success requires every member to pass; failures stay
//! attributed to the member they arose in.

use tracing::{info, warn};

use refseal_core::{Deadline, Error, Repository, Result, SignatureVerifier};
use refseal_policy::PolicyStore;
use refseal_rsl::{propagate_from, ReferenceStateLog};

use crate::engine::VerificationEngine;
use crate::verdict::{MemberVerdict, NetworkVerdict};

/// Options for `verify_network`
#[derive(Debug, Clone)]
pub struct NetworkOptions {
    /// Budget for reaching network repositories
    pub deadline: Deadline,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            deadline: Deadline::none(),
        }
    }
}

/// Verify every network repository registered under this controller
pub fn verify_network(controller: &Repository, opts: &NetworkOptions) -> Result<NetworkVerdict> {
    // Unverifiable controller trust aborts the whole run
    let verifier = SignatureVerifier::with_keyring(controller.keyring()?);
    let root = PolicyStore::new(controller).validate_trust_anchor(&verifier)?;

    if !root.controller {
        return Err(Error::Validation(
            "repository is not a controller".to_string(),
        ));
    }

    let mut members = Vec::new();
    for link in &root.network_repositories {
        opts.deadline.check("verify-network")?;

        let member_repo = match Repository::open(&link.location) {
            Ok(repo) => repo,
            Err(e) => {
                warn!(member = %link.name, "network repository unreachable: {}", e);
                members.push(MemberVerdict {
                    repository: link.name.clone(),
                    verdicts: Vec::new(),
                    error: Some(format!("unreachable: {}", e)),
                });
                continue;
            }
        };

        match verify_member(controller, &member_repo, &link.name, &root.global_rules, opts) {
            Ok(verdicts) => members.push(MemberVerdict {
                repository: link.name.clone(),
                verdicts,
                error: None,
            }),
            Err(e) => members.push(MemberVerdict {
                repository: link.name.clone(),
                verdicts: Vec::new(),
                error: Some(e.to_string()),
            }),
        }
    }

    let verdict = NetworkVerdict { members };
    info!(
        accepted = verdict.accepted(),
        failed = ?verdict.failed_members(),
        "network verification finished"
    );
    Ok(verdict)
}

fn verify_member(
    controller: &Repository,
    member: &Repository,
    name: &str,
    global_rules: &[refseal_policy::GlobalRule],
    opts: &NetworkOptions,
) -> Result<Vec<crate::verdict::Verdict>> {
    // Keep the controller's copy of the member's log current
    propagate_from(controller, member, name, &opts.deadline)?;

    let engine =
        VerificationEngine::new(member)?.with_global_rules(global_rules.to_vec());

    let mut verdicts = Vec::new();
    for ref_name in ReferenceStateLog::new(member).recorded_refs()? {
        opts.deadline.check("verify-network")?;
        verdicts.push(engine.verify_reference(&ref_name, None)?);
    }
    Ok(verdicts)
}
