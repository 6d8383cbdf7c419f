//! `by-path/` symlink mirror of every online relative path.
//!
//! `by-path/<relpath>` is a relative symlink to `by-id/<hash>`, so the
//! metadata root can be moved or mounted elsewhere without breaking links.

use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PathLinkIndex {
    root: PathBuf,
}

impl PathLinkIndex {
    pub fn new(metadata_root: &Path) -> Self {
        Self {
            root: metadata_root.join("by-path"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn link_path(&self, relpath: &str) -> PathBuf {
        self.root.join(relpath)
    }

    /// Create or replace the link for `relpath` so it points at `by-id/<hash>`.
    pub fn link(&self, relpath: &str, hash: &str) -> Result<()> {
        let link = self.link_path(relpath);
        let target = relative_target(relpath, hash);

        if let Some(parent) = link.parent() {
            self.clear_symlinked_ancestors(parent)?;
        }

        if let Ok(meta) = std::fs::symlink_metadata(&link) {
            if meta.file_type().is_symlink() {
                if std::fs::read_link(&link).ok().as_deref() == Some(target.as_path()) {
                    return Ok(());
                }
                std::fs::remove_file(&link)?;
            } else if meta.is_dir() {
                // a directory of links from before this path became a file
                std::fs::remove_dir_all(&link)?;
            } else {
                std::fs::remove_file(&link)?;
            }
        }

        if let Some(parent) = link.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        symlink(&target, &link)
            .with_context(|| format!("Failed to link {} -> {}", link.display(), target.display()))
    }

    /// Remove the link for `relpath` and prune parents left empty.
    pub fn unlink(&self, relpath: &str) -> Result<()> {
        let link = self.link_path(relpath);
        if link
            .parent()
            .map_or(false, |parent| self.has_symlinked_ancestor(parent))
        {
            // an ancestor became a file link, so this link is already gone
            return Ok(());
        }
        match std::fs::symlink_metadata(&link) {
            Ok(meta) if meta.file_type().is_symlink() => {}
            _ => return Ok(()),
        }
        match std::fs::remove_file(&link) {
            Ok(()) => debug!(relpath, "unlinked"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to unlink {}", link.display()))
            }
        }

        let mut dir = link.parent();
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            // remove_dir refuses non-empty directories
            if std::fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(())
    }

    /// Hash the link for `relpath` points at, if any.
    pub fn target(&self, relpath: &str) -> Option<String> {
        let target = std::fs::read_link(self.link_path(relpath)).ok()?;
        target
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
    }

    fn has_symlinked_ancestor(&self, dir: &Path) -> bool {
        let Ok(rel) = dir.strip_prefix(&self.root) else {
            return false;
        };
        let mut current = self.root.clone();
        rel.components().any(|component| {
            current.push(component);
            std::fs::symlink_metadata(&current)
                .map(|meta| meta.file_type().is_symlink())
                .unwrap_or(false)
        })
    }

    fn clear_symlinked_ancestors(&self, dir: &Path) -> Result<()> {
        let Ok(rel) = dir.strip_prefix(&self.root) else {
            return Ok(());
        };
        let mut current = self.root.clone();
        for component in rel.components() {
            current.push(component);
            match std::fs::symlink_metadata(&current) {
                Ok(meta) if !meta.is_dir() => std::fs::remove_file(&current)?,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        Ok(())
    }
}

/// `../` once per path component, then `by-id/<hash>`.
fn relative_target(relpath: &str, hash: &str) -> PathBuf {
    let depth = Path::new(relpath)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count();
    let mut target = PathBuf::new();
    for _ in 0..depth {
        target.push("..");
    }
    target.push("by-id");
    target.push(hash);
    target
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}
