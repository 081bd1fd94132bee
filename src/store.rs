//! Object database: the explicit store context every component works against.
//!
//! Layout of an index directory:
//!
//! ```text
//! <index>/
//!   <hex-digest>   one gzip-compressed file per object
//!   log            transaction log
//!   HEAD           current commit digest, plain text
//!   LOCK           advisory writer lock
//! ```

use crate::error::{Result, StoreError};
use crate::types::{Digest, ObjectKind};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use fs2::FileExt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Default name of the index directory inside a committed root.
pub const INDEX_DIR_NAME: &str = ".index";

/// Name of the transaction log file.
pub const LOG_FILE: &str = "log";

/// Name of the HEAD pointer file.
pub const HEAD_FILE: &str = "HEAD";

/// Name of the writer lock file.
pub const LOCK_FILE: &str = "LOCK";

/// Default read buffer for blob ingestion (2 MiB).
pub const DEFAULT_READ_BUFFER: usize = 2 * 1024 * 1024;

/// Length of the fixed gzip header every object starts with.
const GZIP_HEADER_LEN: usize = 10;

/// Decoder over a stored object's compressed bytes.
pub(crate) type ObjectDecoder<R> = GzDecoder<io::Chain<io::Cursor<[u8; GZIP_HEADER_LEN]>, R>>;

/// Check the fixed gzip header of a stored object and decode the rest.
///
/// Objects are written with no optional fields, a zero mtime, the unknown OS
/// byte and one of the compression hints the encoder emits. Any other header
/// means the file was altered, even though a gzip reader would accept it.
pub(crate) fn object_decoder<R: Read>(mut reader: R) -> io::Result<ObjectDecoder<R>> {
    let mut header = [0u8; GZIP_HEADER_LEN];
    reader.read_exact(&mut header)?;

    let valid = header[..4] == [0x1f, 0x8b, 0x08, 0x00]
        && header[4..8] == [0; 4]
        && matches!(header[8], 0 | 2 | 4)
        && header[9] == 0xff;
    if !valid {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unexpected gzip header",
        ));
    }

    Ok(GzDecoder::new(io::Cursor::new(header).chain(reader)))
}

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Index directory holding objects, log and HEAD.
    pub path: PathBuf,

    /// Whether to create the index if it doesn't exist.
    pub create_if_missing: bool,

    /// Gzip level (0-9) for stored objects.
    pub compression_level: u32,

    /// Read buffer size used when streaming files in and out.
    pub read_buffer_size: usize,

    /// fsync objects, log entries and HEAD before reporting success.
    pub sync_writes: bool,
}

impl StoreConfig {
    /// Configuration for an index at `<root>/.index`.
    pub fn for_root(root: impl AsRef<Path>) -> Self {
        Self {
            path: root.as_ref().join(INDEX_DIR_NAME),
            ..Default::default()
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(INDEX_DIR_NAME),
            create_if_missing: true,
            compression_level: 6,
            read_buffer_size: DEFAULT_READ_BUFFER,
            sync_writes: true,
        }
    }
}

/// Exclusive writer lock on an index, released on drop.
pub struct WriteGuard {
    file: File,
    path: PathBuf,
}

impl WriteGuard {
    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release writer lock");
        }
    }
}

/// Digest-named object storage rooted at an index directory.
pub struct ObjectDatabase {
    /// Canonical index directory.
    path: PathBuf,

    /// Store configuration.
    config: StoreConfig,
}

impl ObjectDatabase {
    /// Open an index directory, creating it if allowed.
    pub fn open(config: StoreConfig) -> Result<Self> {
        if !config.path.exists() {
            if !config.create_if_missing {
                return Err(StoreError::NotInitialized);
            }
            fs::create_dir_all(&config.path)?;
            debug!(path = %config.path.display(), "created index directory");
        } else if !config.path.is_dir() {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is not a directory", config.path.display()),
            )));
        }

        let path = fs::canonicalize(&config.path)?;

        Ok(Self { path, config })
    }

    /// Index directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Compression applied to stored objects.
    pub fn compression(&self) -> Compression {
        Compression::new(self.config.compression_level.min(9))
    }

    /// Path of the object named `digest`.
    pub fn object_path(&self, digest: &Digest) -> PathBuf {
        self.path.join(digest.to_hex())
    }

    /// Path of the transaction log.
    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    /// Path of the HEAD pointer.
    pub fn head_path(&self) -> PathBuf {
        self.path.join(HEAD_FILE)
    }

    /// Path of the writer lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.path.join(LOCK_FILE)
    }

    /// Check if an object exists.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.object_path(digest).is_file()
    }

    /// Acquire the exclusive writer lock without blocking.
    pub fn lock(&self) -> Result<WriteGuard> {
        let path = self.lock_path();
        let file = File::create(&path)?;

        file.try_lock_exclusive().map_err(|_| StoreError::Locked)?;

        Ok(WriteGuard { file, path })
    }

    /// Create a temporary file inside the index.
    ///
    /// Temporary names never parse as digests, so a crash leaves them
    /// invisible to [`list_objects`](Self::list_objects).
    pub fn temp_file(&self) -> Result<NamedTempFile> {
        Ok(tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&self.path)?)
    }

    /// Move a finished temporary file to its digest-named path.
    ///
    /// Returns false if an object with that digest already existed, in which
    /// case the temporary file is discarded.
    pub(crate) fn install(&self, temp: NamedTempFile, digest: &Digest) -> Result<bool> {
        if self.config.sync_writes {
            temp.as_file().sync_all()?;
        }

        let final_path = self.object_path(digest);
        if final_path.is_file() {
            return Ok(false);
        }

        temp.persist(&final_path)?;
        Ok(true)
    }

    /// Frame, compress and store a payload, returning its digest.
    pub fn write_object(&self, kind: ObjectKind, payload: &[u8]) -> Result<Digest> {
        let digest = Digest::framed(kind, payload);
        if self.contains(&digest) {
            debug!(%kind, digest = %digest.short(), "object already stored");
            return Ok(digest);
        }

        let mut temp = self.temp_file()?;
        {
            let writer = BufWriter::new(temp.as_file_mut());
            let mut encoder = GzEncoder::new(writer, self.compression());
            encoder.write_all(payload)?;
            encoder.finish()?.flush()?;
        }

        self.install(temp, &digest)?;
        debug!(%kind, digest = %digest.short(), bytes = payload.len(), "stored object");

        Ok(digest)
    }

    /// Read, decompress and verify a framed object, returning its payload.
    pub fn read_object(&self, kind: ObjectKind, digest: &Digest) -> Result<Vec<u8>> {
        let file = self.open_object(digest)?;

        let mut payload = Vec::new();
        object_decoder(BufReader::new(file))
            .and_then(|mut decoder| decoder.read_to_end(&mut payload))
            .map_err(|e| {
                StoreError::corruption(kind, *digest, format!("decompression failed: {}", e))
            })?;

        let computed = Digest::framed(kind, &payload);
        if computed != *digest {
            return Err(StoreError::corruption(
                kind,
                *digest,
                format!("digest mismatch (computed {})", computed),
            ));
        }

        Ok(payload)
    }

    /// Open the raw compressed file of an object.
    pub(crate) fn open_object(&self, digest: &Digest) -> Result<File> {
        match File::open(self.object_path(digest)) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::ObjectNotFound(*digest))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete an object. Returns false if it was already absent.
    pub fn delete_object(&self, digest: &Digest) -> Result<bool> {
        match fs::remove_file(self.object_path(digest)) {
            Ok(()) => {
                debug!(digest = %digest.short(), "deleted object");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// List all object digests.
    pub fn list_objects(&self) -> Result<Vec<Digest>> {
        let mut digests = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let filename = entry.file_name();
            if let Ok(digest) = Digest::from_hex(&filename.to_string_lossy()) {
                digests.push(digest);
            }
        }

        digests.sort();
        Ok(digests)
    }
}
