//! Append-only transaction log.
//!
//! File format: a 5-byte header (`TXL\0` + version) followed by entries, each
//! written as `u32 LE length | MessagePack entry | u32 LE crc32`. Appends
//! write only the new entry; earlier entries are never rewritten.

use crate::commit::Commit;
use crate::error::{Result, StoreError};
use crate::store::ObjectDatabase;
use crate::types::{Digest, Timestamp};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for the log file.
const LOG_MAGIC: &[u8; 4] = b"TXL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Header size (magic + version).
const HEADER_SIZE: usize = 5;

/// Sanity bound on a single encoded entry.
const MAX_ENTRY_SIZE: usize = 64 * 1024;

/// One committed snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Tree digest.
    pub tree: Digest,
    /// Repository digest.
    pub repository: Digest,
    /// When the entry was appended.
    pub timestamp: Timestamp,
}

impl LogEntry {
    /// The commit binding this entry's tree and repository.
    pub fn commit(&self) -> Commit {
        Commit::new(self.tree, self.repository)
    }
}

/// Ordered, append-only sequence of log entries.
pub struct TransactionLog {
    /// Path to the log file.
    path: PathBuf,

    /// Entries in commit order.
    entries: Vec<LogEntry>,

    /// End of the last valid entry; the next append starts here.
    end: u64,

    /// fsync after each append.
    sync: bool,
}

impl TransactionLog {
    /// Open the log of an object database.
    pub fn open(db: &ObjectDatabase) -> Result<Self> {
        Self::load(db.log_path(), db.config().sync_writes)
    }

    /// Load a log file, starting empty if it doesn't exist.
    ///
    /// A final entry cut short by a crash is dropped and will be overwritten
    /// by the next append. A complete entry that fails its checksum is
    /// reported as corruption.
    pub fn load(path: impl AsRef<Path>, sync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (entries, end) = Self::parse(&path, &read_log(&path)?)?;
        debug!(path = %path.display(), entries = entries.len(), "loaded transaction log");

        Ok(Self {
            path,
            entries,
            end,
            sync,
        })
    }

    /// Re-read the file, picking up entries appended through other handles.
    ///
    /// Call with the writer lock held before appending; the next append
    /// starts at the end of the file as it is now.
    pub fn reload(&mut self) -> Result<()> {
        let (entries, end) = Self::parse(&self.path, &read_log(&self.path)?)?;
        self.entries = entries;
        self.end = end;
        Ok(())
    }

    fn parse(path: &Path, data: &[u8]) -> Result<(Vec<LogEntry>, u64)> {
        if data.len() < HEADER_SIZE {
            if !data.is_empty() {
                warn!(path = %path.display(), "discarding truncated log header");
            }
            return Ok((Vec::new(), 0));
        }

        if &data[..4] != LOG_MAGIC {
            return Err(StoreError::LogCorruption("invalid log magic".into()));
        }
        if data[4] != LOG_VERSION {
            return Err(StoreError::LogCorruption(format!(
                "unsupported log version: {}",
                data[4]
            )));
        }

        let mut entries = Vec::new();
        let mut offset = HEADER_SIZE;

        while offset < data.len() {
            let rest = &data[offset..];
            if rest.len() < 4 {
                warn!(offset, "discarding torn log entry");
                break;
            }

            let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            if len > MAX_ENTRY_SIZE {
                return Err(StoreError::LogCorruption(format!(
                    "entry at offset {} claims {} bytes",
                    offset, len
                )));
            }
            if rest.len() < 4 + len + 4 {
                warn!(offset, "discarding torn log entry");
                break;
            }

            let encoded = &rest[4..4 + len];
            let stored = u32::from_le_bytes([
                rest[4 + len],
                rest[5 + len],
                rest[6 + len],
                rest[7 + len],
            ]);
            if crc32fast::hash(encoded) != stored {
                return Err(StoreError::LogCorruption(format!(
                    "checksum mismatch at offset {}",
                    offset
                )));
            }

            let entry: LogEntry = rmp_serde::from_slice(encoded).map_err(|e| {
                StoreError::LogCorruption(format!("undecodable entry at offset {}: {}", offset, e))
            })?;
            entries.push(entry);
            offset += 4 + len + 4;
        }

        Ok((entries, offset as u64))
    }

    /// Append an entry for a committed tree and repository.
    pub fn append(&mut self, tree: Digest, repository: Digest) -> Result<&LogEntry> {
        // Keep timestamps non-decreasing even if the clock steps back.
        let mut timestamp = Timestamp::now();
        if let Some(last) = self.entries.last() {
            timestamp = timestamp.max(last.timestamp);
        }

        let entry = LogEntry {
            tree,
            repository,
            timestamp,
        };

        let encoded = rmp_serde::to_vec(&entry)?;
        let mut record = Vec::with_capacity(HEADER_SIZE + 4 + encoded.len() + 4);
        if self.end == 0 {
            record.extend_from_slice(LOG_MAGIC);
            record.push(LOG_VERSION);
        }
        record.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        record.extend_from_slice(&encoded);
        record.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.path)?;
        file.seek(SeekFrom::Start(self.end))?;
        file.write_all(&record)?;

        let new_end = self.end + record.len() as u64;
        // Drop any torn bytes past the new entry.
        file.set_len(new_end)?;
        if self.sync {
            file.sync_all()?;
        }

        self.end = new_end;
        self.entries.push(entry);
        debug!(tree = %tree.short(), repository = %repository.short(), "appended log entry");

        Ok(&self.entries[self.entries.len() - 1])
    }

    /// All entries in commit order.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Entry at `index`.
    pub fn get(&self, index: usize) -> Option<&LogEntry> {
        self.entries.get(index)
    }

    /// Most recent entry.
    pub fn latest(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_log(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}
