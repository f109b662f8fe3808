//! Zstd compression of dump files.
//!
//! Dumps are compressed with the zstd frame content checksum enabled, so a
//! full decode doubles as the container's own integrity test.

use crate::error::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Extension appended to compressed artifacts.
pub const COMPRESSED_EXT: &str = "zst";

/// Compression settings for backup artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Zstd level (1=fastest, 19=best ratio, 3=balanced default).
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { level: 3 }
    }
}

/// Path a file will have once compressed: `x.sql` becomes `x.sql.zst`.
pub fn compressed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(COMPRESSED_EXT);
    PathBuf::from(name)
}

/// Compresses `src` into `src.zst` and removes `src`. Returns the new path.
pub fn compress_file(src: &Path, config: CompressionConfig) -> Result<PathBuf> {
    let dst = compressed_path(src);
    {
        let mut input = BufReader::new(File::open(src)?);
        let output = BufWriter::new(File::create(&dst)?);
        let mut encoder = zstd::stream::Encoder::new(output, config.level)
            .map_err(|e| BackupError::Compression(e.to_string()))?;
        encoder
            .include_checksum(true)
            .map_err(|e| BackupError::Compression(e.to_string()))?;
        io::copy(&mut input, &mut encoder)?;
        let mut output = encoder
            .finish()
            .map_err(|e| BackupError::Compression(e.to_string()))?;
        output.flush()?;
    }
    fs::remove_file(src)?;
    Ok(dst)
}

/// Decompresses `src` into `dst`, leaving `src` untouched.
pub fn decompress_file(src: &Path, dst: &Path) -> Result<()> {
    let input = BufReader::new(File::open(src)?);
    let mut output = BufWriter::new(File::create(dst)?);
    zstd::stream::copy_decode(input, &mut output)
        .map_err(|e| BackupError::Compression(e.to_string()))?;
    output.flush()?;
    Ok(())
}

/// Decodes the whole artifact and discards the output.
///
/// Returns `Ok(false)` when the frame is truncated or fails its content
/// checksum; `Err` only when the file cannot be opened.
pub fn test_integrity(path: &Path) -> Result<bool> {
    let input = BufReader::new(File::open(path)?);
    match zstd::stream::copy_decode(input, io::sink()) {
        Ok(()) => Ok(true),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "artifact failed integrity test");
            Ok(false)
        }
    }
}
