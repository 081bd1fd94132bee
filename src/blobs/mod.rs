//! Content-addressed blob storage.
//!
//! Blobs are stored gzip-compressed under the SHA-1 of their raw bytes
//! (like Git objects, without the header).

mod ingest;
mod storage;

pub use ingest::ingest_file;
pub use storage::BlobStorage;

use crate::error::{Result, StoreError};
use crate::types::Digest;
use std::path::{Path, PathBuf};

/// A file on disk, possibly not yet ingested.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    path: PathBuf,
    digest: Option<Digest>,
}

impl Blob {
    /// Reference a source file. Fails if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(StoreError::SourceNotFound(path));
        }
        Ok(Self { path, digest: None })
    }

    /// Reference a file whose content is already stored as `digest`.
    pub fn persisted(path: impl Into<PathBuf>, digest: Digest) -> Self {
        Self {
            path: path.into(),
            digest: Some(digest),
        }
    }

    /// Source path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Digest, once ingested.
    pub fn digest(&self) -> Option<Digest> {
        self.digest
    }

    pub fn is_persisted(&self) -> bool {
        self.digest.is_some()
    }

    /// Ingest the file if that hasn't happened yet.
    pub fn persist(&mut self, blobs: &BlobStorage) -> Result<Digest> {
        if let Some(digest) = self.digest {
            return Ok(digest);
        }
        let digest = blobs.ingest(&self.path)?;
        self.digest = Some(digest);
        Ok(digest)
    }
}
