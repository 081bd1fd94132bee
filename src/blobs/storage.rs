//! Blob storage implementation.

use super::ingest::ingest_file;
use crate::error::{Result, StoreError};
use crate::store::{object_decoder, ObjectDatabase};
use crate::types::Digest;
use sha1::{Digest as _, Sha1};
use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Content-addressed blob storage.
///
/// Blobs are named by the SHA-1 of their raw bytes and stored gzip-compressed
/// directly in the index directory.
pub struct BlobStorage {
    db: Arc<ObjectDatabase>,
}

impl BlobStorage {
    /// Create blob storage over an object database.
    pub fn new(db: Arc<ObjectDatabase>) -> Self {
        Self { db }
    }

    /// The underlying object database.
    pub fn database(&self) -> &ObjectDatabase {
        &self.db
    }

    /// Ingest a file, returning its digest.
    ///
    /// The compressed copy is written to a temporary file in the index and
    /// renamed to its digest only once complete. Ingesting content that is
    /// already stored leaves the existing object untouched.
    pub fn ingest(&self, source: impl AsRef<Path>) -> Result<Digest> {
        let source = source.as_ref();
        if !source.exists() {
            return Err(StoreError::SourceNotFound(source.to_path_buf()));
        }

        let temp = self.db.temp_file()?;
        let digest = ingest_file(
            source,
            temp.path(),
            self.db.compression(),
            self.db.config().read_buffer_size,
        )?;

        if self.db.install(temp, &digest)? {
            debug!(digest = %digest.short(), source = %source.display(), "ingested blob");
        } else {
            debug!(digest = %digest.short(), "blob already stored");
        }

        Ok(digest)
    }

    /// Restore a blob to `dest`, verifying its digest while streaming.
    ///
    /// Returns the number of bytes restored. Decompressed bytes go to a
    /// temporary file next to `dest`, which replaces `dest` only after the
    /// digest checks out; a corrupt blob leaves `dest` as it was.
    ///
    /// Blobs carry no file metadata. On unix the restored file is always mode
    /// 0644, so an executable bit set on the committed file is not restored.
    pub fn retrieve(&self, digest: &Digest, dest: impl AsRef<Path>) -> Result<u64> {
        let dest = dest.as_ref();
        let file = self.db.open_object(digest)?;
        let mut decoder =
            object_decoder(BufReader::new(file)).map_err(|e| StoreError::BlobCorruption {
                digest: *digest,
                reason: format!("bad gzip header: {}", e),
            })?;

        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let mut out = tempfile::Builder::new()
            .prefix(".restore-")
            .tempfile_in(parent)?;

        let mut hasher = Sha1::new();
        let mut buffer = vec![0u8; self.db.config().read_buffer_size.clamp(4096, 1 << 20)];
        let mut total = 0u64;

        {
            let mut writer = BufWriter::new(out.as_file_mut());
            loop {
                let n = match decoder.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        return Err(StoreError::BlobCorruption {
                            digest: *digest,
                            reason: format!("decompression failed: {}", e),
                        })
                    }
                };
                hasher.update(&buffer[..n]);
                writer.write_all(&buffer[..n])?;
                total += n as u64;
            }
            writer.flush()?;
        }

        let computed = Digest(hasher.finalize().into());
        if computed != *digest {
            return Err(StoreError::BlobCorruption {
                digest: *digest,
                reason: format!("digest mismatch (computed {})", computed),
            });
        }

        if self.db.config().sync_writes {
            out.as_file().sync_all()?;
        }
        set_restored_permissions(out.path())?;
        out.persist(dest)?;

        debug!(digest = %digest.short(), dest = %dest.display(), bytes = total, "restored blob");
        Ok(total)
    }

    /// Check if a blob exists.
    pub fn exists(&self, digest: &Digest) -> bool {
        self.db.contains(digest)
    }

    /// Delete a blob.
    pub fn delete(&self, digest: &Digest) -> Result<bool> {
        self.db.delete_object(digest)
    }
}

/// Temporary files are created owner-only; restored files get 0644 whatever
/// the committed file's mode was.
#[cfg(unix)]
fn set_restored_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_restored_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use tempfile::TempDir;

    fn test_storage(dir: &TempDir) -> BlobStorage {
        let db = ObjectDatabase::open(StoreConfig {
            path: dir.path().join("index"),
            sync_writes: false,
            ..Default::default()
        })
        .unwrap();
        BlobStorage::new(Arc::new(db))
    }

    #[test]
    fn test_ingest_and_retrieve() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);

        let source = dir.path().join("test_file");
        let sample = b"this is a test \x12 \x00 <-- ugly bytes \xF2";
        fs::write(&source, sample).unwrap();

        let digest = storage.ingest(&source).unwrap();
        assert_eq!(digest, Digest::from_bytes(sample));
        assert!(storage.exists(&digest));

        fs::remove_file(&source).unwrap();
        let restored = storage.retrieve(&digest, &source).unwrap();
        assert_eq!(restored, sample.len() as u64);
        assert_eq!(fs::read(&source).unwrap(), sample);
    }

    #[test]
    fn test_deduplication() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);

        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"Same content").unwrap();
        fs::write(&b, b"Same content").unwrap();

        let hash1 = storage.ingest(&a).unwrap();
        let hash2 = storage.ingest(&b).unwrap();

        assert_eq!(hash1, hash2);
        assert_eq!(storage.database().list_objects().unwrap().len(), 1);
    }

    #[test]
    fn test_retrieve_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);

        let source = dir.path().join("flat");
        fs::write(&source, b"nested").unwrap();
        let digest = storage.ingest(&source).unwrap();

        let dest = dir.path().join("x").join("y").join("z.txt");
        storage.retrieve(&digest, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"nested");
    }

    #[test]
    fn test_ingest_missing_source() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);

        let result = storage.ingest(dir.path().join("missing"));
        assert!(matches!(result, Err(StoreError::SourceNotFound(_))));
        assert!(storage.database().list_objects().unwrap().is_empty());
    }

    #[test]
    fn test_retrieve_missing_is_not_corruption() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);

        let digest = Digest::from_bytes(b"never stored");
        let result = storage.retrieve(&digest, dir.path().join("out"));
        assert!(matches!(result, Err(StoreError::ObjectNotFound(_))));
    }

    #[test]
    fn test_corrupt_blob_leaves_destination_alone() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);

        let source = dir.path().join("src");
        let data: Vec<u8> = (0..8192u32).map(|i| (i * 7 % 256) as u8).collect();
        fs::write(&source, &data).unwrap();
        let digest = storage.ingest(&source).unwrap();

        let object = storage.database().object_path(&digest);
        let mut raw = fs::read(&object).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0xff;
        fs::write(&object, raw).unwrap();

        let dest = dir.path().join("dest");
        fs::write(&dest, b"previous").unwrap();

        let result = storage.retrieve(&digest, &dest);
        assert!(matches!(result, Err(StoreError::BlobCorruption { .. })));
        assert_eq!(fs::read(&dest).unwrap(), b"previous");
    }

    #[test]
    fn test_renamed_object_is_corruption() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);

        let source = dir.path().join("src");
        fs::write(&source, b"real content").unwrap();
        let digest = storage.ingest(&source).unwrap();

        // Store the object under a name that isn't its digest.
        let fake = Digest::from_bytes(b"something else");
        fs::copy(
            storage.database().object_path(&digest),
            storage.database().object_path(&fake),
        )
        .unwrap();

        let result = storage.retrieve(&fake, dir.path().join("out"));
        assert!(matches!(result, Err(StoreError::BlobCorruption { digest, .. }) if digest == fake));
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);

        let source = dir.path().join("src");
        fs::write(&source, b"To be deleted").unwrap();
        let digest = storage.ingest(&source).unwrap();

        assert!(storage.delete(&digest).unwrap());
        assert!(!storage.exists(&digest));
    }

    #[cfg(unix)]
    #[test]
    fn test_restored_mode_is_fixed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir);

        let source = dir.path().join("script.sh");
        fs::write(&source, b"#!/bin/sh\necho hi\n").unwrap();
        fs::set_permissions(&source, fs::Permissions::from_mode(0o755)).unwrap();
        let digest = storage.ingest(&source).unwrap();

        let dest = dir.path().join("restored.sh");
        storage.retrieve(&digest, &dest).unwrap();
        let mode = fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
