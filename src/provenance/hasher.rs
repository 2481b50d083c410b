//! Content digests for recipes and recipe-adjacent processors.
//!
//! New digests are BLAKE3 (`blake3:{hex}`). Records carrying `sha256:{hex}`
//! are still verified, with SHA-256.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const STREAM_BUF_SIZE: usize = 65536;

/// Hash bytes. Returns `"blake3:{hex}"`.
pub fn hash_bytes(data: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(data).to_hex())
}

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Hash a file's contents. Returns `"blake3:{hex}"`.
pub fn hash_file(path: &Path) -> Result<String, String> {
    let mut hasher = blake3::Hasher::new();
    stream_file(path, |chunk| {
        hasher.update(chunk);
    })?;
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}

/// Hash a file with SHA-256. Returns `"sha256:{hex}"`.
pub fn sha256_file(path: &Path) -> Result<String, String> {
    let mut hasher = Sha256::new();
    stream_file(path, |chunk| hasher.update(chunk))?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

fn stream_file(path: &Path, mut sink: impl FnMut(&[u8])) -> Result<(), String> {
    let mut file =
        std::fs::File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let mut buf = [0u8; STREAM_BUF_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| format!("read error {}: {}", path.display(), e))?;
        if n == 0 {
            break;
        }
        sink(&buf[..n]);
    }
    Ok(())
}

/// Recompute `path`'s digest with the algorithm named by `recorded`.
///
/// Returns the freshly computed digest; callers compare it to `recorded`.
pub fn rehash_like(recorded: &str, path: &Path) -> Result<String, String> {
    if recorded.starts_with("sha256:") {
        sha256_file(path)
    } else {
        hash_file(path)
    }
}

/// True when `path` still has the digest recorded in `recorded`.
pub fn digest_matches(recorded: &str, path: &Path) -> Result<bool, String> {
    Ok(rehash_like(recorded, path)? == recorded)
}
