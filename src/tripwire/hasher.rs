//! KL-014: Content hashing — BLAKE3 for recipes and plans, SHA-256 for artifacts.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const STREAM_BUF_SIZE: usize = 65536;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// SHA-256 of a file, streamed. Returns `(lowercase hex, size in bytes)`.
pub fn sha256_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; STREAM_BUF_SIZE];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// SHA-256 of a byte slice, lowercase hex.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Normalize a recorded checksum for comparison: trim, lowercase,
/// strip an `algo:` prefix.
pub fn normalize_checksum(checksum: &str) -> String {
    let trimmed = checksum.trim().to_ascii_lowercase();
    match trimmed.split_once(':') {
        Some((_, hex)) => hex.to_string(),
        None => trimmed,
    }
}

/// Compare two checksums after normalization.
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    let expected = normalize_checksum(expected);
    !expected.is_empty() && expected == normalize_checksum(actual)
}
