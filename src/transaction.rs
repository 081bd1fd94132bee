//! Commit, checkout and integrity checking over a working directory.

use crate::blobs::{Blob, BlobStorage};
use crate::commit::{Commit, HeadRef};
use crate::error::{Result, StoreError};
use crate::log::TransactionLog;
use crate::repository::Repository;
use crate::store::{ObjectDatabase, StoreConfig, WriteGuard};
use crate::tree::Tree;
use crate::types::Digest;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Result of a successful commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitSummary {
    /// Digest HEAD now points at.
    pub commit: Digest,
    /// Tree digest.
    pub tree: Digest,
    /// Repository digest.
    pub repository: Digest,
    /// Number of files captured.
    pub files: usize,
}

/// A versioned working directory.
///
/// Mutating operations hold the store's writer lock for their whole critical
/// section and re-read the log under it, so several handles (or processes)
/// can share one index. The object order within a commit is fixed: blobs, tree,
/// repository, log entry, commit object, HEAD. A failure partway leaves
/// orphaned objects or a log entry ahead of HEAD, never a HEAD naming
/// something unpersisted.
pub struct Transaction {
    /// Canonical working directory.
    root: PathBuf,

    /// Object database (the index).
    db: Arc<ObjectDatabase>,

    /// Blob storage over `db`.
    blobs: BlobStorage,

    /// Transaction log.
    log: TransactionLog,

    /// HEAD pointer.
    head: HeadRef,
}

impl Transaction {
    /// Open a working directory with its index at `<root>/.index`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        Self::open_with_config(root, StoreConfig::for_root(root))
    }

    /// Open a working directory with an explicit store configuration.
    pub fn open_with_config(root: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let root = fs::canonicalize(root.as_ref())?;
        let db = Arc::new(ObjectDatabase::open(config)?);
        let blobs = BlobStorage::new(Arc::clone(&db));
        let log = TransactionLog::open(&db)?;
        let head = HeadRef::open(&db);

        debug!(root = %root.display(), index = %db.path().display(), commits = log.len(), "opened transaction store");

        Ok(Self {
            root,
            db,
            blobs,
            log,
            head,
        })
    }

    /// Working directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Object database.
    pub fn database(&self) -> &ObjectDatabase {
        &self.db
    }

    /// Blob storage.
    pub fn blobs(&self) -> &BlobStorage {
        &self.blobs
    }

    /// Transaction log.
    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    /// Current HEAD, if any commit or checkout has happened.
    pub fn head(&self) -> Result<Option<Digest>> {
        self.head.read()
    }

    /// Acquire the writer lock.
    ///
    /// [`commit`](Self::commit) and [`checkout`](Self::checkout) take it
    /// themselves. To keep other writers out across several operations, hold
    /// the guard and call the `_locked` variants with it.
    pub fn lock(&self) -> Result<WriteGuard> {
        self.db.lock()
    }

    fn check_guard(&self, guard: &WriteGuard) -> Result<()> {
        if guard.path() != self.db.lock_path() {
            return Err(StoreError::ForeignLock);
        }
        Ok(())
    }

    /// Snapshot every regular file under the root.
    pub fn commit(&mut self) -> Result<CommitSummary> {
        let guard = self.lock()?;
        self.commit_locked(&guard)
    }

    /// [`commit`](Self::commit) under a writer lock the caller already holds.
    pub fn commit_locked(&mut self, guard: &WriteGuard) -> Result<CommitSummary> {
        self.check_guard(guard)?;
        self.log.reload()?;

        let mut tree = Tree::new();
        let mut repository = Repository::new();

        let index = self.db.path().to_path_buf();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.path() != index.as_path());

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let logical = logical_path(&self.root, entry.path())?;
            let mut blob = Blob::open(entry.path())?;
            let digest = tree.add_blob(logical, &mut blob, &self.blobs)?;
            repository.track(&self.db, digest)?;
        }

        let tree_digest = tree.persist(&self.db)?;
        let repository_digest = repository.persist(&self.db)?;
        self.log.append(tree_digest, repository_digest)?;

        let commit = Commit::new(tree_digest, repository_digest).persist(&self.db)?;
        self.head.write(&commit)?;

        info!(
            commit = %commit.short(),
            tree = %tree_digest.short(),
            files = tree.len(),
            "committed"
        );

        Ok(CommitSummary {
            commit,
            tree: tree_digest,
            repository: repository_digest,
            files: tree.len(),
        })
    }

    /// Restore the files of a commit and move HEAD to it.
    ///
    /// Files not in the commit are left alone. Any corrupt or missing object
    /// aborts the checkout before HEAD moves.
    pub fn checkout(&mut self, commit: &Digest) -> Result<Tree> {
        let guard = self.lock()?;
        self.checkout_locked(&guard, commit)
    }

    /// [`checkout`](Self::checkout) under a writer lock the caller already holds.
    pub fn checkout_locked(&mut self, guard: &WriteGuard, commit: &Digest) -> Result<Tree> {
        self.check_guard(guard)?;
        self.log.reload()?;

        let resolved = Commit::load(&self.db, commit)?;
        let tree = Tree::load(&self.db, &resolved.tree)?;
        tree.apply(&self.blobs, &self.root)?;
        self.head.write(commit)?;

        info!(commit = %commit.short(), files = tree.len(), "checked out");
        Ok(tree)
    }

    /// Verify HEAD against the latest log entry on disk.
    ///
    /// Diagnostic only: nothing is repaired.
    pub fn check_integrity(&self) -> Result<()> {
        let log = TransactionLog::open(&self.db)?;
        let Some(latest) = log.latest() else {
            return Ok(());
        };
        let expected = latest.commit().digest();

        let head = match self.head.read() {
            Ok(Some(head)) => head,
            Ok(None) | Err(_) => {
                return Err(StoreError::TransactionCorruption(format!(
                    "No HEAD, recommend reverting to latest commit in logs ({})",
                    expected
                )))
            }
        };

        if head != expected {
            return Err(StoreError::TransactionCorruption(format!(
                "HEAD {} diverges from latest log entry {}",
                head, expected
            )));
        }

        Ok(())
    }

    /// Point HEAD back at the commit of the latest log entry.
    ///
    /// The explicit recovery for a failed [`check_integrity`](Self::check_integrity).
    /// Returns the new HEAD, or `None` if the log is empty.
    pub fn recover_head(&mut self) -> Result<Option<Digest>> {
        let guard = self.lock()?;
        self.recover_head_locked(&guard)
    }

    /// [`recover_head`](Self::recover_head) under a writer lock the caller
    /// already holds.
    pub fn recover_head_locked(&mut self, guard: &WriteGuard) -> Result<Option<Digest>> {
        self.check_guard(guard)?;
        self.log.reload()?;

        let Some(latest) = self.log.latest() else {
            return Ok(None);
        };

        let commit = latest.commit().persist(&self.db)?;
        self.head.write(&commit)?;

        info!(head = %commit.short(), "recovered HEAD from log");
        Ok(Some(commit))
    }
}

/// Path of `path` relative to `root`, with `/` separators.
///
/// Names that aren't valid UTF-8 are rejected rather than converted, since a
/// lossy conversion could map two files to one tree entry.
fn logical_path(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).unwrap_or(path);

    let mut parts = Vec::new();
    for component in relative.components() {
        match component.as_os_str().to_str() {
            Some(part) => parts.push(part),
            None => {
                return Err(StoreError::InvalidPath {
                    path: relative.to_string_lossy().into_owned(),
                    reason: "not valid UTF-8".into(),
                })
            }
        }
    }

    Ok(parts.join("/"))
}
