//! Streaming content ingestion.
//!
//! Reads a source file once, hashing and gzip-compressing it in the same
//! pass. The whole file is never held in memory.

use crate::error::{Result, StoreError};
use crate::types::Digest;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha1::{Digest as _, Sha1};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

/// Smallest read buffer used regardless of configuration.
const MIN_BUFFER: usize = 4096;

/// Compress `source` into `dest`, returning the digest of the raw bytes.
///
/// `dest` is created or truncated. The caller owns naming and durability of
/// the written file.
pub fn ingest_file(
    source: &Path,
    dest: &Path,
    level: Compression,
    buffer_size: usize,
) -> Result<Digest> {
    let mut input = match File::open(source) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StoreError::SourceNotFound(source.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };

    let output = File::create(dest)?;
    let mut encoder = GzEncoder::new(BufWriter::new(output), level);
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; buffer_size.max(MIN_BUFFER)];

    loop {
        let n = match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buffer[..n]);
        encoder.write_all(&buffer[..n])?;
    }

    encoder.finish()?.flush()?;

    Ok(Digest(hasher.finalize().into()))
}
