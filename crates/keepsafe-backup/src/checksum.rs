//! Content checksums for backup artifacts.
//!
//! Artifacts are hashed with SHA-256 after compression; the lowercase hex
//! digest is what the metadata index records and what verification and
//! restore compare against.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::debug;

const READ_CHUNK: usize = 64 * 1024;

/// Hashes a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hashes a file by streaming it in fixed-size chunks.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    let digest = hex::encode(hasher.finalize());
    debug!(path = %path.display(), size = total, checksum = %digest, "computed checksum");
    Ok(digest)
}

/// Recomputes the file checksum and compares it with `expected`.
///
/// Returns the recomputed digest alongside the verdict so callers can report it.
pub fn verify_file(path: &Path, expected: &str) -> io::Result<(bool, String)> {
    let actual = file_sha256(path)?;
    let matches = actual.eq_ignore_ascii_case(expected);
    if !matches {
        debug!(
            path = %path.display(),
            expected = expected,
            actual = %actual,
            "checksum mismatch"
        );
    }
    Ok((matches, actual))
}
