//! Error types for the object store.

use crate::types::{Digest, ObjectKind};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for store operations.
///
/// Corruption, "missing" and "not tracked" are separate variants: a missing
/// object calls for re-fetching or re-committing, a corrupt one for
/// investigation. Nothing in the crate downgrades one into the other.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object not found: {0}")]
    ObjectNotFound(Digest),

    #[error("Can't read {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Blob {digest} corrupted: {reason}")]
    BlobCorruption { digest: Digest, reason: String },

    #[error("Tree {digest} corrupted: {reason}")]
    TreeCorruption { digest: Digest, reason: String },

    #[error("Repository {digest} corrupted: {reason}")]
    RepositoryCorruption { digest: Digest, reason: String },

    #[error("Commit {digest} corrupted: {reason}")]
    CommitCorruption { digest: Digest, reason: String },

    #[error("Transaction integrity compromised: {0}")]
    TransactionCorruption(String),

    #[error("Missing from index: {0}")]
    TransactionIndex(Digest),

    #[error("Blob {0} not tracked by repository")]
    NotTracked(Digest),

    #[error("Transaction log corrupted: {0}")]
    LogCorruption(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Invalid tree path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Store is locked by another writer")]
    Locked,

    #[error("Writer lock belongs to a different store")]
    ForeignLock,

    #[error("Store not initialized")]
    NotInitialized,
}

impl StoreError {
    /// Corruption error for a framed object of the given kind.
    pub fn corruption(kind: ObjectKind, digest: Digest, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match kind {
            ObjectKind::Tree => StoreError::TreeCorruption { digest, reason },
            ObjectKind::Repository => StoreError::RepositoryCorruption { digest, reason },
            ObjectKind::Commit => StoreError::CommitCorruption { digest, reason },
        }
    }

    /// True for every error reporting damaged stored data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::BlobCorruption { .. }
                | StoreError::TreeCorruption { .. }
                | StoreError::RepositoryCorruption { .. }
                | StoreError::CommitCorruption { .. }
                | StoreError::TransactionCorruption(_)
                | StoreError::LogCorruption(_)
        )
    }

    /// True when an object or source file is absent.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::ObjectNotFound(_) | StoreError::SourceNotFound(_) => true,
            StoreError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<hex::FromHexError> for StoreError {
    fn from(e: hex::FromHexError) -> Self {
        StoreError::InvalidDigest(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

impl From<tempfile::PersistError> for StoreError {
    fn from(e: tempfile::PersistError) -> Self {
        StoreError::Io(e.error)
    }
}

impl From<walkdir::Error> for StoreError {
    fn from(e: walkdir::Error) -> Self {
        match e.into_io_error() {
            Some(io) => StoreError::Io(io),
            None => StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "filesystem loop while walking source tree",
            )),
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
