//! The append-only reference state log
//!
//! Entries are content-addressed records linked in log order through
//! `log_prev`, with the head at `refs/refseal/reference-state-log`.
//! Appends for one reference are serialized by the repository's advisory
//! lock; a compare-and-swap on the head ref keeps the log linear even
//! under racing writers. Reads validate the per-reference hash chain and
//! refuse to proceed past corruption.

use chrono::Utc;
use tracing::{debug, info};

use refseal_core::{
    canonical_ref_name, Deadline, Error, ObjectId, Repository, Result, SecretKey, RSL_REF,
};

use crate::entry::RslEntry;

/// Options for `record`
#[derive(Debug, Clone)]
pub struct RecordOptions {
    /// Skip remote side effects; the local append still happens
    pub local_only: bool,

    /// Budget for externally-reaching work
    pub deadline: Deadline,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            local_only: true,
            deadline: Deadline::none(),
        }
    }
}

/// Read/append facade over one repository's reference state log
pub struct ReferenceStateLog<'a> {
    repo: &'a Repository,
}

impl<'a> ReferenceStateLog<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    /// The newest entry, if the log is non-empty
    pub fn latest(&self) -> Result<Option<(ObjectId, RslEntry)>> {
        match self.repo.read_ref(RSL_REF)? {
            Some(id) => Ok(Some((id, self.repo.get_record(&id)?))),
            None => Ok(None),
        }
    }

    /// All entries in log order (oldest first)
    ///
    /// Walks the `log_prev` links from the head; a missing record on the
    /// walk is a fatal IntegrityError.
    pub fn entries(&self) -> Result<Vec<(ObjectId, RslEntry)>> {
        let mut entries = Vec::new();
        let mut cursor = self.repo.read_ref(RSL_REF)?;
        while let Some(id) = cursor {
            if !self.repo.has_object(&id) {
                return Err(Error::Integrity(format!(
                    "log record {} is missing",
                    id.short()
                )));
            }
            let entry: RslEntry = self.repo.get_record(&id)?;
            cursor = entry.log_prev;
            entries.push((id, entry));
        }
        entries.reverse();
        Ok(entries)
    }

    /// Entries for one reference and propagation source, oldest first,
    /// with the per-reference hash chain validated
    pub fn entries_for_ref(
        &self,
        ref_name: &str,
        source: Option<&str>,
    ) -> Result<Vec<(ObjectId, RslEntry)>> {
        let ref_name = canonical_ref_name(ref_name);
        let entries: Vec<(ObjectId, RslEntry)> = self
            .entries()?
            .into_iter()
            .filter(|(_, e)| {
                e.ref_name == ref_name && e.propagated_from.as_deref() == source
            })
            .collect();

        let mut predecessor: Option<&RslEntry> = None;
        for (_, entry) in &entries {
            entry.check_chain(predecessor)?;
            predecessor = Some(entry);
        }
        Ok(entries)
    }

    /// The newest entry for a reference (local entries unless `source`)
    pub fn latest_for_ref(
        &self,
        ref_name: &str,
        source: Option<&str>,
    ) -> Result<Option<(ObjectId, RslEntry)>> {
        Ok(self.entries_for_ref(ref_name, source)?.into_iter().last())
    }

    /// Distinct reference names appearing in the log
    pub fn recorded_refs(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .entries()?
            .into_iter()
            .map(|(_, e)| e.ref_name)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Record the current state of `ref_name`
    ///
    /// Snapshots the reference's target, signs with `signer`, chains onto
    /// the previous entry for the reference, and appends. The append for
    /// one reference is serialized; the head update is a compare-and-swap
    /// so a concurrent append to another reference surfaces as a
    /// ConflictError rather than a lost entry.
    pub fn record(
        &self,
        ref_name: &str,
        signer: &SecretKey,
        opts: &RecordOptions,
    ) -> Result<(ObjectId, RslEntry)> {
        let ref_name = canonical_ref_name(ref_name);
        let lock = self.repo.lock_ref(&ref_name);
        let _guard = lock.guard();

        opts.deadline.check("rsl record")?;

        let target = self.repo.require_ref(&ref_name).map_err(|_| {
            Error::NotFound(format!("reference '{}' does not resolve", ref_name))
        })?;

        let prev_hash = match self.latest_for_ref(&ref_name, None)? {
            Some((_, prev)) => prev.entry_hash()?,
            None => ObjectId::ZERO,
        };

        let head = self.latest()?;
        let (log_prev, index) = match &head {
            Some((id, entry)) => (Some(*id), entry.index + 1),
            None => (None, 0),
        };

        let entry = RslEntry::create(
            index,
            ref_name.clone(),
            target,
            prev_hash,
            log_prev,
            Utc::now(),
            signer,
        )?;
        let id = self.append(entry.clone(), head.map(|(id, _)| id))?;

        if !opts.local_only {
            // Remote push happens through propagation from the linked
            // side; nothing further to do for a standalone repository.
            debug!(ref_name = %ref_name, "record requested remote sync");
        }

        info!(
            ref_name = %ref_name,
            index,
            target = %target.short(),
            "recorded reference state"
        );
        Ok((id, entry))
    }

    /// Append a fully-formed entry, advancing the head with a CAS
    pub(crate) fn append(
        &self,
        entry: RslEntry,
        expected_head: Option<ObjectId>,
    ) -> Result<ObjectId> {
        let id = self.repo.put_record(&entry)?;
        self.repo.update_ref(RSL_REF, id, expected_head)?;
        Ok(id)
    }

    /// Validate every per-reference chain in the log
    pub fn validate(&self) -> Result<()> {
        let mut groups: Vec<(String, Option<String>)> = self
            .entries()?
            .into_iter()
            .map(|(_, e)| (e.ref_name, e.propagated_from))
            .collect();
        groups.sort();
        groups.dedup();
        for (ref_name, source) in groups {
            self.entries_for_ref(&ref_name, source.as_deref())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn put_target(repo: &Repository, ref_name: &str, content: &[u8]) -> ObjectId {
        let id = repo.put_blob(content).unwrap();
        let expected = repo.read_ref(ref_name).unwrap();
        repo.update_ref(ref_name, id, expected).unwrap();
        id
    }

    #[test]
    fn test_record_builds_a_chain() {
        let repo = Repository::in_memory();
        let signer = SecretKey::generate(&mut OsRng);
        let log = ReferenceStateLog::new(&repo);

        put_target(&repo, "refs/heads/main", b"one");
        let (_, first) = log.record("main", &signer, &RecordOptions::default()).unwrap();
        assert_eq!(first.prev_hash, ObjectId::ZERO);
        assert_eq!(first.index, 0);

        put_target(&repo, "refs/heads/main", b"two");
        let (_, second) = log.record("main", &signer, &RecordOptions::default()).unwrap();
        assert_eq!(second.prev_hash, first.entry_hash().unwrap());
        assert_eq!(second.index, 1);

        log.validate().unwrap();
        assert_eq!(log.entries_for_ref("main", None).unwrap().len(), 2);
    }

    #[test]
    fn test_record_unresolvable_ref_fails() {
        let repo = Repository::in_memory();
        let signer = SecretKey::generate(&mut OsRng);
        let log = ReferenceStateLog::new(&repo);
        assert!(matches!(
            log.record("main", &signer, &RecordOptions::default()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_chains_per_reference_are_independent() {
        let repo = Repository::in_memory();
        let signer = SecretKey::generate(&mut OsRng);
        let log = ReferenceStateLog::new(&repo);

        put_target(&repo, "refs/heads/main", b"m1");
        put_target(&repo, "refs/heads/dev", b"d1");
        log.record("main", &signer, &RecordOptions::default()).unwrap();
        log.record("dev", &signer, &RecordOptions::default()).unwrap();
        put_target(&repo, "refs/heads/main", b"m2");
        log.record("main", &signer, &RecordOptions::default()).unwrap();

        let main = log.entries_for_ref("main", None).unwrap();
        let dev = log.entries_for_ref("dev", None).unwrap();
        assert_eq!(main.len(), 2);
        assert_eq!(dev.len(), 1);
        assert_eq!(dev[0].1.prev_hash, ObjectId::ZERO);
    }

    #[test]
    fn test_corrupted_chain_is_fatal() {
        let repo = Repository::in_memory();
        let signer = SecretKey::generate(&mut OsRng);
        let log = ReferenceStateLog::new(&repo);

        put_target(&repo, "refs/heads/main", b"one");
        log.record("main", &signer, &RecordOptions::default()).unwrap();
        put_target(&repo, "refs/heads/main", b"two");
        let (_, second) = log.record("main", &signer, &RecordOptions::default()).unwrap();

        // Forge a successor whose prev_hash skips the second entry
        let head = repo.read_ref(RSL_REF).unwrap();
        let forged = RslEntry::create(
            second.index + 1,
            "refs/heads/main",
            ObjectId::new([3u8; 32]),
            ObjectId::new([4u8; 32]),
            head,
            Utc::now(),
            &signer,
        )
        .unwrap();
        log.append(forged, head).unwrap();

        assert!(matches!(
            log.entries_for_ref("main", None),
            Err(Error::Integrity(_))
        ));
        assert!(matches!(log.validate(), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_expired_deadline_fails_closed() {
        let repo = Repository::in_memory();
        let signer = SecretKey::generate(&mut OsRng);
        let log = ReferenceStateLog::new(&repo);
        put_target(&repo, "refs/heads/main", b"one");

        let opts = RecordOptions {
            local_only: false,
            deadline: Deadline::after(std::time::Duration::from_secs(0)),
        };
        assert!(matches!(
            log.record("main", &signer, &opts),
            Err(Error::Retryable(_))
        ));
        // Nothing was appended
        assert!(log.latest().unwrap().is_none());
    }
}
