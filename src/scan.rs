use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::archive::ArchiveAwareness;

/// A regular file found under the index root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub relpath: String,
}

/// Enumerate every regular file under `index_root`.
///
/// The metadata directory is pruned, drive status markers and files
/// matching `exclude_globs` are skipped. Symlinks are not followed.
/// Unreadable entries and names that are not valid UTF-8 are logged and
/// skipped.
pub fn scan_index_root(
    index_root: &Path,
    metadata_root: &Path,
    archive: &ArchiveAwareness,
    exclude_globs: &[String],
) -> Result<Vec<ScannedFile>> {
    if !index_root.is_dir() {
        bail!("Index root does not exist: {}", index_root.display());
    }

    let exclude_set = build_globset(exclude_globs)?;
    let mut files = Vec::new();

    let walker = WalkDir::new(index_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.path() != metadata_root);

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(index_root).unwrap_or(path);
        let Some(rel_str) = relative.to_str().map(str::to_string) else {
            warn!(path = %path.display(), "skipping file with a non-UTF-8 name");
            continue;
        };

        if archive.is_marker_file(&rel_str) || exclude_set.is_match(&rel_str) {
            continue;
        }

        files.push(ScannedFile {
            path: path.to_path_buf(),
            relpath: rel_str,
        });
    }

    // Sort for deterministic ordering
    files.sort_by(|a, b| a.relpath.cmp(&b.relpath));

    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
