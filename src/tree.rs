//! Tree snapshots: logical path to blob digest.

use crate::blobs::{Blob, BlobStorage};
use crate::error::{Result, StoreError};
use crate::store::ObjectDatabase;
use crate::types::{Digest, ObjectKind};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::path::{Component, Path};
use tracing::debug;

/// A snapshot of a directory.
///
/// Paths are relative to the committed root and use `/` separators. Entries
/// are kept sorted so the same snapshot always encodes to the same bytes and
/// therefore the same digest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tree {
    entries: BTreeMap<String, Digest>,
    digest: Option<Digest>,
}

impl Tree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `path` as holding the blob `digest`.
    ///
    /// Returns the digest previously recorded for `path`, if any. Paths that
    /// could resolve outside the restore root are rejected.
    pub fn add(&mut self, path: impl Into<String>, digest: Digest) -> Result<Option<Digest>> {
        let path = path.into();
        if let Err(reason) = check_path(&path) {
            return Err(StoreError::InvalidPath { path, reason });
        }

        self.digest = None;
        Ok(self.entries.insert(path, digest))
    }

    /// Record `path` as holding `blob`, ingesting the blob first if needed.
    pub fn add_blob(
        &mut self,
        path: impl Into<String>,
        blob: &mut Blob,
        blobs: &BlobStorage,
    ) -> Result<Digest> {
        let digest = blob.persist(blobs)?;
        self.add(path, digest)?;
        Ok(digest)
    }

    /// Digest recorded for `path`.
    pub fn get(&self, path: &str) -> Option<&Digest> {
        self.entries.get(path)
    }

    /// Iterate entries in path order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, Digest> {
        self.entries.iter()
    }

    /// All entries.
    pub fn entries(&self) -> &BTreeMap<String, Digest> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Digest of the stored form, set by [`persist`](Self::persist) and
    /// [`load`](Self::load) and cleared by any later modification.
    pub fn digest(&self) -> Option<Digest> {
        self.digest
    }

    /// Canonical encoding of the entries.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(&self.entries)?)
    }

    /// Store the tree, returning its digest.
    pub fn persist(&mut self, db: &ObjectDatabase) -> Result<Digest> {
        let payload = self.encode()?;
        let digest = db.write_object(ObjectKind::Tree, &payload)?;
        self.digest = Some(digest);
        debug!(digest = %digest.short(), entries = self.entries.len(), "persisted tree");
        Ok(digest)
    }

    /// Load and verify a stored tree.
    pub fn load(db: &ObjectDatabase, digest: &Digest) -> Result<Self> {
        let payload = db.read_object(ObjectKind::Tree, digest)?;
        let entries: BTreeMap<String, Digest> =
            rmp_serde::from_slice(&payload).map_err(|e| StoreError::TreeCorruption {
                digest: *digest,
                reason: format!("malformed payload: {}", e),
            })?;

        if let Some((path, reason)) = entries
            .keys()
            .find_map(|path| check_path(path).err().map(|reason| (path, reason)))
        {
            return Err(StoreError::TreeCorruption {
                digest: *digest,
                reason: format!("entry {:?}: {}", path, reason),
            });
        }

        Ok(Self {
            entries,
            digest: Some(*digest),
        })
    }

    /// Restore every entry under `root`.
    ///
    /// Stops at the first failure and returns it unchanged; entries restored
    /// before that point stay on disk. Returns the number of files restored.
    pub fn apply(&self, blobs: &BlobStorage, root: &Path) -> Result<usize> {
        for (path, digest) in &self.entries {
            blobs.retrieve(digest, root.join(path))?;
        }
        debug!(entries = self.entries.len(), root = %root.display(), "applied tree");
        Ok(self.entries.len())
    }
}

/// A logical path must be relative, `/`-separated and free of `.` and `..`.
fn check_path(path: &str) -> std::result::Result<(), String> {
    if path.is_empty() {
        return Err("empty path".into());
    }
    if path.contains('\\') {
        return Err("backslash separator".into());
    }
    for segment in path.split('/') {
        match segment {
            "" => return Err("empty component or leading /".into()),
            "." | ".." => return Err(format!("{:?} component", segment)),
            _ => {}
        }
    }
    // Catches drive prefixes and the like on platforms that have them.
    if !Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err("not a plain relative path".into());
    }
    Ok(())
}

impl<'a> IntoIterator for &'a Tree {
    type Item = (&'a String, &'a Digest);
    type IntoIter = btree_map::Iter<'a, String, Digest>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
