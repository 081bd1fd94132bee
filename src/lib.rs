//! # Blobtrail
//!
//! A content-addressed, versioned object store in the style of Git's object
//! database, with a single linear history.
//!
//! ## Core Concepts
//!
//! - **Blobs**: file contents, gzip-compressed and named by their SHA-1
//! - **Trees**: path to blob snapshots of a directory
//! - **Repositories**: reference counts over blobs; the last release deletes
//! - **Log**: append-only record of (tree, repository, timestamp)
//! - **HEAD**: the current commit, checked against the log on demand
//!
//! Every read verifies the digest it was asked for. Corruption surfaces as a
//! typed [`StoreError`], never as silently wrong data.
//!
//! ## Example
//!
//! ```no_run
//! use blobtrail::Transaction;
//!
//! let mut txn = Transaction::open("./project")?;
//! let summary = txn.commit()?;
//! txn.check_integrity()?;
//!
//! // Later: restore the snapshot.
//! txn.checkout(&summary.commit)?;
//! # Ok::<(), blobtrail::StoreError>(())
//! ```

pub mod blobs;
pub mod commit;
pub mod error;
pub mod log;
pub mod repository;
pub mod store;
pub mod transaction;
pub mod tree;
pub mod types;

// Re-exports
pub use blobs::{ingest_file, Blob, BlobStorage};
pub use commit::{Commit, HeadRef};
pub use error::{Result, StoreError};
pub use log::{LogEntry, TransactionLog};
pub use repository::{Release, Repository};
pub use store::{ObjectDatabase, StoreConfig, WriteGuard, INDEX_DIR_NAME};
pub use transaction::{CommitSummary, Transaction};
pub use tree::Tree;
pub use types::*;
