//! Reference-counted index of live blobs.
//!
//! Releasing the last reference to a blob deletes it from the store. This is
//! the only way anything is ever removed; there is no scanning collector.

use crate::error::{Result, StoreError};
use crate::store::ObjectDatabase;
use crate::types::{Digest, ObjectKind};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Outcome of [`Repository::release`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// References remain; carries the new count.
    Retained(u32),
    /// The last reference was dropped and the blob deleted.
    Collected,
}

/// Blob digest to reference count. Every tracked count is at least 1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Repository {
    counts: BTreeMap<Digest, u32>,
    digest: Option<Digest>,
}

impl Repository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reference to a stored blob, returning the new count.
    ///
    /// The blob must already exist in `db`.
    pub fn track(&mut self, db: &ObjectDatabase, digest: Digest) -> Result<u32> {
        if !db.contains(&digest) {
            return Err(StoreError::TransactionIndex(digest));
        }

        self.digest = None;
        let count = self.counts.entry(digest).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    /// Drop a reference, deleting the blob when none remain.
    pub fn release(&mut self, db: &ObjectDatabase, digest: &Digest) -> Result<Release> {
        let count = match self.counts.get(digest) {
            Some(&count) => count,
            None => return Err(StoreError::NotTracked(*digest)),
        };

        self.digest = None;
        if count > 1 {
            self.counts.insert(*digest, count - 1);
            return Ok(Release::Retained(count - 1));
        }

        // Delete before forgetting so a failed delete leaves the count intact.
        if !db.delete_object(digest)? {
            warn!(digest = %digest.short(), "collected blob was already missing from the store");
        }
        self.counts.remove(digest);
        debug!(digest = %digest.short(), "collected blob");

        Ok(Release::Collected)
    }

    /// Current count for `digest` (0 if untracked).
    pub fn count(&self, digest: &Digest) -> u32 {
        self.counts.get(digest).copied().unwrap_or(0)
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.counts.contains_key(digest)
    }

    /// Tracked digests in order.
    pub fn digests(&self) -> impl Iterator<Item = &Digest> + '_ {
        self.counts.keys()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Digest of the stored form, if persisted or loaded and unchanged since.
    pub fn digest(&self) -> Option<Digest> {
        self.digest
    }

    /// Store the repository, returning its digest.
    pub fn persist(&mut self, db: &ObjectDatabase) -> Result<Digest> {
        let payload = rmp_serde::to_vec(&self.counts)?;
        let digest = db.write_object(ObjectKind::Repository, &payload)?;
        self.digest = Some(digest);
        debug!(digest = %digest.short(), blobs = self.counts.len(), "persisted repository");
        Ok(digest)
    }

    /// Load and verify a stored repository.
    pub fn load(db: &ObjectDatabase, digest: &Digest) -> Result<Self> {
        let payload = db.read_object(ObjectKind::Repository, digest)?;
        let counts: BTreeMap<Digest, u32> =
            rmp_serde::from_slice(&payload).map_err(|e| StoreError::RepositoryCorruption {
                digest: *digest,
                reason: format!("malformed payload: {}", e),
            })?;

        if let Some((zero, _)) = counts.iter().find(|(_, count)| **count == 0) {
            return Err(StoreError::RepositoryCorruption {
                digest: *digest,
                reason: format!("zero reference count for {}", zero),
            });
        }

        Ok(Self {
            counts,
            digest: Some(*digest),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use tempfile::TempDir;

    fn test_db(dir: &TempDir) -> ObjectDatabase {
        ObjectDatabase::open(StoreConfig {
            path: dir.path().join("index"),
            sync_writes: false,
            ..Default::default()
        })
        .unwrap()
    }

    /// Any stored object will do as a tracked blob here.
    fn stored(db: &ObjectDatabase, content: &[u8]) -> Digest {
        db.write_object(ObjectKind::Commit, content).unwrap()
    }

    #[test]
    fn test_track_requires_stored_object() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir);
        let mut repo = Repository::new();

        let missing = Digest::from_bytes(b"missing");
        let result = repo.track(&db, missing);
        assert!(matches!(result, Err(StoreError::TransactionIndex(d)) if d == missing));
        assert!(repo.is_empty());
    }

    #[test]
    fn test_refcount_lifecycle() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir);
        let mut repo = Repository::new();
        let digest = stored(&db, b"blob");

        assert_eq!(repo.track(&db, digest).unwrap(), 1);
        assert_eq!(repo.track(&db, digest).unwrap(), 2);

        assert_eq!(repo.release(&db, &digest).unwrap(), Release::Retained(1));
        assert_eq!(repo.count(&digest), 1);
        assert!(db.contains(&digest));

        assert_eq!(repo.release(&db, &digest).unwrap(), Release::Collected);
        assert!(!repo.contains(&digest));
        assert!(!db.contains(&digest));
    }

    #[test]
    fn test_release_untracked() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir);
        let mut repo = Repository::new();
        let digest = stored(&db, b"blob");

        let result = repo.release(&db, &digest);
        assert!(matches!(result, Err(StoreError::NotTracked(_))));
        // Untracked release never deletes anything.
        assert!(db.contains(&digest));
    }

    #[test]
    fn test_double_release_after_collect() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir);
        let mut repo = Repository::new();
        let digest = stored(&db, b"blob");

        repo.track(&db, digest).unwrap();
        repo.release(&db, &digest).unwrap();
        assert!(matches!(
            repo.release(&db, &digest),
            Err(StoreError::NotTracked(_))
        ));
    }

    #[test]
    fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir);
        let mut repo = Repository::new();
        let a = stored(&db, b"a");
        let b = stored(&db, b"b");
        repo.track(&db, a).unwrap();
        repo.track(&db, b).unwrap();
        repo.track(&db, b).unwrap();

        let digest = repo.persist(&db).unwrap();
        let loaded = Repository::load(&db, &digest).unwrap();
        assert_eq!(loaded, repo);
        assert_eq!(loaded.count(&b), 2);
    }

    #[test]
    fn test_load_zero_count_is_corruption() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir);

        let mut counts = BTreeMap::new();
        counts.insert(Digest::from_bytes(b"x"), 0u32);
        let payload = rmp_serde::to_vec(&counts).unwrap();
        let digest = db.write_object(ObjectKind::Repository, &payload).unwrap();

        let result = Repository::load(&db, &digest);
        assert!(matches!(result, Err(StoreError::RepositoryCorruption { .. })));
    }
}
