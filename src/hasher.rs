//! Content identity.
//!
//! Files are hashed with BLAKE3 in 64 KiB reads and identified by the first
//! 64 bits of the digest, rendered as 16 lowercase hex characters. A prior
//! run's digest is reused when the file's truncated mtime matches the one
//! recorded in the prior document.

use anyhow::{Context, Result};
use filedex_core::models::Document;
use std::collections::HashMap;
use std::fs::{File, Metadata};
use std::io::Read;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

const CHUNK_SIZE: usize = 64 * 1024;
const DIGEST_BYTES: usize = 8;

/// Hash `path` and return its 16-character hex identity.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let digest = hasher.finalize();
    Ok(digest.as_bytes()[..DIGEST_BYTES]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

/// Seconds since the epoch, floored to four decimal places.
///
/// Filesystems report mtimes at different resolutions; truncating keeps the
/// value stable across a JSON round trip.
pub fn truncate_mtime(time: SystemTime) -> f64 {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    let ticks = since_epoch.as_secs() as u128 * 10_000 + since_epoch.subsec_nanos() as u128 / 100_000;
    ticks as f64 / 10_000.0
}

/// Result of [`determine_hash`].
#[derive(Debug, Clone)]
pub struct HashedFile {
    pub relpath: String,
    pub hash: String,
    pub mtime: f64,
    pub size: u64,
    /// Whether the digest came from the prior document instead of the file.
    pub reused: bool,
}

/// Identify the file at `path`, reusing a prior digest when its mtime is unchanged.
pub fn determine_hash(
    path: &Path,
    relpath: &str,
    prior_docs_by_hash: &HashMap<String, Document>,
    prior_hash_by_path: &HashMap<String, String>,
) -> Result<HashedFile> {
    let metadata: Metadata =
        std::fs::metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
    let mtime = truncate_mtime(metadata.modified().unwrap_or(UNIX_EPOCH));

    let cached = prior_hash_by_path
        .get(relpath)
        .and_then(|hash| prior_docs_by_hash.get(hash))
        .filter(|doc| doc.paths.get(relpath) == Some(&mtime))
        .map(|doc| doc.id.clone());

    let (hash, reused) = match cached {
        Some(hash) => (hash, true),
        None => (hash_file(path)?, false),
    };

    Ok(HashedFile {
        relpath: relpath.to_string(),
        hash,
        mtime,
        size: metadata.len(),
        reused,
    })
}
