//! Cross-repository propagation
//!
//! Copies reference state log entries from linked repositories into the
//! local log, preserving the original signer and chain hash and marking
//! each copy with its source. Re-running produces no duplicates: entries
//! are deduplicated by their propagation-stable chain hash.

use std::collections::BTreeSet;

use tracing::{info, warn};

use refseal_core::{Deadline, Error, ObjectId, Repository, Result, Snapshot};
use refseal_policy::{PolicyStore, RepositoryLink};

use crate::entry::RslEntry;
use crate::log::ReferenceStateLog;

/// Options for `propagate`
#[derive(Debug, Clone)]
pub struct PropagateOptions {
    /// Budget for reaching linked repositories
    pub deadline: Deadline,
}

impl Default for PropagateOptions {
    fn default() -> Self {
        Self {
            deadline: Deadline::none(),
        }
    }
}

/// Per-link outcome of a propagation run
#[derive(Debug, Clone)]
pub struct PropagationSummary {
    /// (link name, entries copied)
    pub copied: Vec<(String, usize)>,
}

/// Propagate from every repository linked in the local root of trust
///
/// Controllers pull from their network repositories; network members pull
/// from their controllers. An unreachable link fails the run with a
/// RetryableError after completing nothing for that link.
pub fn propagate(local: &Repository, opts: &PropagateOptions) -> Result<PropagationSummary> {
    let trust = PolicyStore::new(local).require_trust()?;

    let mut links: Vec<&RepositoryLink> = Vec::new();
    if trust.document.controller {
        links.extend(trust.document.network_repositories.iter());
    }
    links.extend(trust.document.controller_repositories.iter());

    let mut summary = PropagationSummary { copied: Vec::new() };
    for link in links {
        opts.deadline.check("rsl propagate")?;
        let remote = Repository::open(&link.location).map_err(|e| {
            Error::Retryable(format!(
                "linked repository '{}' at {} unavailable: {}",
                link.name,
                link.location.display(),
                e
            ))
        })?;
        let copied = propagate_from(local, &remote, &link.name, &opts.deadline)?;
        summary.copied.push((link.name.clone(), copied));
    }
    Ok(summary)
}

/// Copy entries from one linked repository, returning how many were new
pub fn propagate_from(
    local: &Repository,
    remote: &Repository,
    source_name: &str,
    deadline: &Deadline,
) -> Result<usize> {
    let local_log = ReferenceStateLog::new(local);
    let remote_log = ReferenceStateLog::new(remote);

    // Never import from a corrupted log
    remote_log.validate()?;

    let known: BTreeSet<ObjectId> = local_log
        .entries()?
        .iter()
        .filter(|(_, e)| e.propagated_from.as_deref() == Some(source_name))
        .map(|(_, e)| e.entry_hash())
        .collect::<Result<_>>()?;

    let mut copied = 0;
    for (_, remote_entry) in remote_log.entries()? {
        deadline.check("rsl propagate")?;

        // Only the remote's own entries travel; transitively propagated
        // copies stay attributed to their origin link.
        if remote_entry.propagated_from.is_some() {
            continue;
        }
        if known.contains(&remote_entry.entry_hash()?) {
            continue;
        }

        copy_snapshot_closure(local, remote, &remote_entry.target)?;

        let head = local_log.latest()?;
        let (log_prev, index) = match &head {
            Some((id, entry)) => (Some(*id), entry.index + 1),
            None => (None, 0),
        };
        let entry = RslEntry {
            index,
            log_prev,
            propagated_from: Some(source_name.to_string()),
            ..remote_entry
        };
        local_log.append(entry, head.map(|(id, _)| id))?;
        copied += 1;
    }

    if copied > 0 {
        info!(source = source_name, copied, "propagated log entries");
    }
    Ok(copied)
}

/// Copy a snapshot record and its parent chain into the local store
///
/// Blob contents are not needed for verification (path rules match on
/// names) and are left behind; a snapshot the remote no longer holds ends
/// the walk.
fn copy_snapshot_closure(local: &Repository, remote: &Repository, id: &ObjectId) -> Result<()> {
    let mut cursor = Some(*id);
    while let Some(current) = cursor {
        if local.has_object(&current) {
            break;
        }
        if !remote.has_object(&current) {
            warn!(snapshot = %current.short(), "linked repository lacks snapshot record");
            break;
        }
        let bytes = remote.get_bytes(&current)?;
        local.put_blob(&bytes)?;
        let snapshot: Snapshot = local.get_record(&current)?;
        cursor = snapshot.parent;
    }
    Ok(())
}
