//! Commit objects and the HEAD pointer.

use crate::error::{Result, StoreError};
use crate::store::ObjectDatabase;
use crate::types::{Digest, ObjectKind};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Binds one tree and one repository.
///
/// Stored as the text `"<tree-hex> <repository-hex>"`, framed as `commit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Commit {
    pub tree: Digest,
    pub repository: Digest,
}

impl Commit {
    pub fn new(tree: Digest, repository: Digest) -> Self {
        Self { tree, repository }
    }

    /// Stored payload.
    pub fn payload(&self) -> Vec<u8> {
        format!("{} {}", self.tree, self.repository).into_bytes()
    }

    /// Digest this commit has (or would have) once stored.
    pub fn digest(&self) -> Digest {
        Digest::framed(ObjectKind::Commit, &self.payload())
    }

    /// Store the commit, returning its digest.
    pub fn persist(&self, db: &ObjectDatabase) -> Result<Digest> {
        db.write_object(ObjectKind::Commit, &self.payload())
    }

    /// Load and verify a stored commit.
    pub fn load(db: &ObjectDatabase, digest: &Digest) -> Result<Self> {
        let payload = db.read_object(ObjectKind::Commit, digest)?;
        Self::parse(&payload).ok_or_else(|| StoreError::CommitCorruption {
            digest: *digest,
            reason: "malformed payload".into(),
        })
    }

    fn parse(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?;
        let (tree, repository) = text.split_once(' ')?;
        Some(Self {
            tree: Digest::from_hex(tree).ok()?,
            repository: Digest::from_hex(repository).ok()?,
        })
    }
}

/// The HEAD pointer: a commit digest stored as plain text outside the
/// object namespace.
pub struct HeadRef {
    path: PathBuf,
    sync: bool,
}

impl HeadRef {
    /// HEAD of an object database.
    pub fn open(db: &ObjectDatabase) -> Self {
        Self::new(db.head_path(), db.config().sync_writes)
    }

    pub fn new(path: impl Into<PathBuf>, sync: bool) -> Self {
        Self {
            path: path.into(),
            sync,
        }
    }

    /// Path to the HEAD file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read HEAD. `None` if it has never been written.
    pub fn read(&self) -> Result<Option<Digest>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text.parse()?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Point HEAD at `digest`, replacing the file atomically.
    pub fn write(&self, digest: &Digest) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let mut temp = tempfile::Builder::new().prefix(".head-").tempfile_in(dir)?;
        temp.write_all(digest.to_hex().as_bytes())?;
        if self.sync {
            temp.as_file().sync_all()?;
        }
        temp.persist(&self.path)?;

        debug!(head = %digest.short(), "updated HEAD");
        Ok(())
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

    #[test]
    fn test_commit_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir);

        let commit = Commit::new(Digest::from_bytes(b"tree"), Digest::from_bytes(b"repo"));
        let digest = commit.persist(&db).unwrap();
        assert_eq!(digest, commit.digest());

        assert_eq!(Commit::load(&db, &digest).unwrap(), commit);
    }

    #[test]
    fn test_commit_payload_format() {
        let tree = Digest::from_bytes(b"tree");
        let repo = Digest::from_bytes(b"repo");
        let payload = Commit::new(tree, repo).payload();
        assert_eq!(payload, format!("{} {}", tree.to_hex(), repo.to_hex()).into_bytes());
    }

    #[test]
    fn test_malformed_commit() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir);

        let digest = db.write_object(ObjectKind::Commit, b"not a commit").unwrap();
        let result = Commit::load(&db, &digest);
        assert!(matches!(result, Err(StoreError::CommitCorruption { .. })));
    }

    #[test]
    fn test_head_read_write() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir);
        let head = HeadRef::open(&db);

        assert_eq!(head.read().unwrap(), None);

        let digest = Digest::from_bytes(b"commit");
        head.write(&digest).unwrap();
        assert_eq!(head.read().unwrap(), Some(digest));
        assert_eq!(fs::read_to_string(head.path()).unwrap(), digest.to_hex());
    }

    #[test]
    fn test_head_garbage() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir);
        let head = HeadRef::open(&db);

        fs::write(head.path(), "definitely not hex").unwrap();
        assert!(matches!(head.read(), Err(StoreError::InvalidDigest(_))));
    }
}
