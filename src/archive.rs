//! Archive drives: removable media mounted under the archive root.
//!
//! Each top-level directory of the archive root is a "drive". Paths under a
//! drive may legitimately disappear while the drive is unmounted, so the
//! documents referencing them are kept (offline) instead of deleted. A
//! `<drive>-status-ready` or `<drive>-status-pending` marker next to the
//! drive tells operators whether every document on it has drained through
//! the module pipeline.

use anyhow::{Context, Result};
use filedex_core::models::Document;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

const READY_SUFFIX: &str = "-status-ready";
const PENDING_SUFFIX: &str = "-status-pending";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveStatus {
    Ready,
    Pending,
}

impl DriveStatus {
    fn suffix(self) -> &'static str {
        match self {
            DriveStatus::Ready => READY_SUFFIX,
            DriveStatus::Pending => PENDING_SUFFIX,
        }
    }
}

/// Counts from one [`ArchiveAwareness::update_drive_markers`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerReport {
    pub ready: usize,
    pub pending: usize,
    pub removed: usize,
}

#[derive(Debug, Clone)]
pub struct ArchiveAwareness {
    index_root: PathBuf,
    /// Archive root relative to the index root.
    archive_rel: Option<PathBuf>,
}

impl ArchiveAwareness {
    pub fn new(index_root: &Path, archive_root: Option<&Path>) -> Self {
        let archive_rel = archive_root
            .and_then(|a| a.strip_prefix(index_root).ok())
            .filter(|rel| rel.components().next().is_some())
            .map(Path::to_path_buf);
        Self {
            index_root: index_root.to_path_buf(),
            archive_rel,
        }
    }

    pub fn archive_root(&self) -> Option<PathBuf> {
        self.archive_rel.as_ref().map(|rel| self.index_root.join(rel))
    }

    /// Whether `relpath` lives anywhere under the archive root.
    pub fn is_in_archive_dir(&self, relpath: &str) -> bool {
        let Some(rel) = self.archive_rel.as_ref() else {
            return false;
        };
        matches!(Path::new(relpath).strip_prefix(rel), Ok(rest) if rest.components().next().is_some())
    }

    /// Drive name for an archive path: the first component under the archive root.
    ///
    /// Files directly inside the archive root belong to no drive.
    pub fn drive_of(&self, relpath: &str) -> Option<String> {
        let rel = self.archive_rel.as_ref()?;
        let rest = Path::new(relpath).strip_prefix(rel).ok()?;
        let mut components = rest.components();
        let drive = match components.next()? {
            Component::Normal(name) => name.to_string_lossy().to_string(),
            _ => return None,
        };
        components.next()?;
        Some(drive)
    }

    /// A drive counts as mounted when its directory exists and is not empty.
    pub fn is_drive_mounted(&self, drive: &str) -> bool {
        let Some(root) = self.archive_root() else {
            return false;
        };
        std::fs::read_dir(root.join(drive))
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    /// Whether `relpath` is one of the status markers this module writes.
    pub fn is_marker_file(&self, relpath: &str) -> bool {
        let Some(rel) = self.archive_rel.as_ref() else {
            return false;
        };
        let path = Path::new(relpath);
        if path.parent() != Some(rel.as_path()) {
            return false;
        }
        path.file_name()
            .map(|n| marker_drive(&n.to_string_lossy()).is_some())
            .unwrap_or(false)
    }

    fn exists_on_disk(&self, relpath: &str) -> bool {
        self.index_root.join(relpath).exists()
    }

    /// Online iff some path is outside the archive or present on disk.
    pub fn doc_is_online(&self, doc: &Document) -> bool {
        doc.paths
            .keys()
            .any(|p| !self.is_in_archive_dir(p) || self.exists_on_disk(p))
    }

    /// Every path is an archive path and none is present on disk.
    pub fn is_unmounted_archive_doc(&self, doc: &Document) -> bool {
        !doc.paths.is_empty()
            && doc
                .paths
                .keys()
                .all(|p| self.is_in_archive_dir(p) && !self.exists_on_disk(p))
    }

    /// Whether `relpath` is an archive path on a drive that is not mounted.
    pub fn is_on_unmounted_drive(&self, relpath: &str) -> bool {
        self.drive_of(relpath)
            .map(|drive| !self.is_drive_mounted(&drive))
            .unwrap_or(false)
    }

    /// Whether `relpath` is on a drive whose directory no longer exists.
    ///
    /// A drive directory that is still present means the drive is attached,
    /// so its missing files were moved or deleted rather than taken offline.
    pub fn is_on_detached_drive(&self, relpath: &str) -> bool {
        match (self.drive_of(relpath), self.archive_root()) {
            (Some(drive), Some(root)) => !root.join(drive).exists(),
            _ => false,
        }
    }

    pub fn update_archive_flags(&self, doc: &mut Document) {
        doc.has_archive_paths = doc.paths.keys().any(|p| self.is_in_archive_dir(p));
        doc.offline = !self.doc_is_online(doc);
    }

    /// The first mounted archive drive `doc` has a path on, by drive name.
    pub fn reachable_drive(&self, doc: &Document) -> Option<String> {
        let drives: BTreeSet<String> = doc.paths.keys().filter_map(|p| self.drive_of(p)).collect();
        drives.into_iter().find(|d| self.is_drive_mounted(d))
    }

    /// Write ready/pending markers for every referenced drive and remove
    /// markers of drives no document references.
    pub fn update_drive_markers<'a, I>(&self, docs: I, force_pending: bool) -> Result<MarkerReport>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        let mut report = MarkerReport::default();
        let Some(root) = self.archive_root() else {
            return Ok(report);
        };

        let mut drained: BTreeMap<String, bool> = BTreeMap::new();
        for doc in docs {
            let doc_drained = doc.next.is_empty() && !doc.offline;
            for drive in doc.paths.keys().filter_map(|p| self.drive_of(p)) {
                let entry = drained.entry(drive).or_insert(true);
                *entry &= doc_drained;
            }
        }

        for (drive, all_drained) in &drained {
            let status = if !force_pending && *all_drained && self.is_drive_mounted(drive) {
                DriveStatus::Ready
            } else {
                DriveStatus::Pending
            };
            self.write_marker(&root, drive, status)?;
            match status {
                DriveStatus::Ready => report.ready += 1,
                DriveStatus::Pending => report.pending += 1,
            }
        }

        if root.exists() {
            for entry in std::fs::read_dir(&root)
                .with_context(|| format!("Failed to list {}", root.display()))?
            {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(drive) = marker_drive(&name) else {
                    continue;
                };
                if !drained.contains_key(drive) && entry.file_type()?.is_file() {
                    std::fs::remove_file(entry.path())?;
                    info!(drive, "removed marker of unreferenced drive");
                    report.removed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Current marker state of `drive`, if any.
    pub fn drive_status(&self, drive: &str) -> Option<DriveStatus> {
        let root = self.archive_root()?;
        [DriveStatus::Ready, DriveStatus::Pending]
            .into_iter()
            .find(|s| root.join(format!("{}{}", drive, s.suffix())).is_file())
    }

    /// Every drive that currently has a marker, with its state.
    pub fn markers(&self) -> Result<BTreeMap<String, DriveStatus>> {
        let mut out = BTreeMap::new();
        let Some(root) = self.archive_root() else {
            return Ok(out);
        };
        if !root.exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&root)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if let Some(drive) = name.strip_suffix(READY_SUFFIX) {
                out.insert(drive.to_string(), DriveStatus::Ready);
            } else if let Some(drive) = name.strip_suffix(PENDING_SUFFIX) {
                out.entry(drive.to_string()).or_insert(DriveStatus::Pending);
            }
        }
        Ok(out)
    }

    fn write_marker(&self, root: &Path, drive: &str, status: DriveStatus) -> Result<()> {
        let (keep, drop) = match status {
            DriveStatus::Ready => (READY_SUFFIX, PENDING_SUFFIX),
            DriveStatus::Pending => (PENDING_SUFFIX, READY_SUFFIX),
        };
        let stale = root.join(format!("{}{}", drive, drop));
        if stale.exists() {
            std::fs::remove_file(&stale)
                .with_context(|| format!("Failed to remove {}", stale.display()))?;
        }
        let marker = root.join(format!("{}{}", drive, keep));
        if marker.exists() {
            // Keep the timestamp of the last transition.
            return Ok(());
        }
        std::fs::create_dir_all(root)?;
        std::fs::write(&marker, chrono::Utc::now().to_rfc3339())
            .with_context(|| format!("Failed to write {}", marker.display()))?;
        debug!(drive, marker = %marker.display(), "drive marker updated");
        Ok(())
    }
}

fn marker_drive(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(READY_SUFFIX)
        .or_else(|| file_name.strip_suffix(PENDING_SUFFIX))
        .filter(|d| !d.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ArchiveAwareness) {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("archive")).unwrap();
        let archive = ArchiveAwareness::new(tmp.path(), Some(&tmp.path().join("archive")));
        (tmp, archive)
    }

    fn doc(id: &str, paths: &[&str], next: &str) -> Document {
        let mut d = Document::new(id, 1);
        for p in paths {
            d.add_path(p, 1.0);
        }
        d.next = next.to_string();
        d
    }

    #[test]
    fn classifies_archive_paths() {
        let (_tmp, archive) = setup();
        assert!(archive.is_in_archive_dir("archive/drive1/a.txt"));
        assert_eq!(archive.drive_of("archive/drive1/x/a.txt").as_deref(), Some("drive1"));
        assert!(archive.is_in_archive_dir("archive/loose.txt"));
        assert_eq!(archive.drive_of("archive/loose.txt"), None);
        assert!(!archive.is_in_archive_dir("archive"));
        assert!(!archive.is_in_archive_dir("archived/a.txt"));
        assert!(!archive.is_in_archive_dir("docs/a.txt"));
        assert!(archive.is_marker_file("archive/drive1-status-ready"));
        assert!(!archive.is_marker_file("archive/drive1/drive1-status-ready"));
    }

    #[test]
    fn no_archive_root_means_nothing_is_archived() {
        let tmp = TempDir::new().unwrap();
        let archive = ArchiveAwareness::new(tmp.path(), None);
        assert!(!archive.is_in_archive_dir("archive/drive1/a.txt"));
        let report = archive.update_drive_markers(&[], false).unwrap();
        assert_eq!(report, MarkerReport::default());
    }

    #[test]
    fn offline_iff_every_path_is_a_missing_archive_path() {
        let (tmp, archive) = setup();
        let mut missing = doc("a", &["archive/drive1/a.txt"], "text");
        archive.update_archive_flags(&mut missing);
        assert!(missing.has_archive_paths);
        assert!(missing.offline);
        assert!(archive.is_unmounted_archive_doc(&missing));

        std::fs::create_dir_all(tmp.path().join("archive/drive1")).unwrap();
        std::fs::write(tmp.path().join("archive/drive1/a.txt"), "x").unwrap();
        archive.update_archive_flags(&mut missing);
        assert!(!missing.offline);

        let mut mixed = doc("b", &["archive/drive2/b.txt", "b.txt"], "");
        archive.update_archive_flags(&mut mixed);
        assert!(mixed.has_archive_paths);
        assert!(!mixed.offline);
    }

    #[test]
    fn loose_archive_file_goes_offline_when_missing() {
        let (_tmp, archive) = setup();
        let mut loose = doc("a", &["archive/loose.txt"], "text");
        archive.update_archive_flags(&mut loose);
        assert!(loose.has_archive_paths);
        assert!(loose.offline);
    }

    #[test]
    fn detached_only_when_drive_directory_is_gone() {
        let (tmp, archive) = setup();
        assert!(archive.is_on_detached_drive("archive/drive1/a.txt"));
        assert!(archive.is_on_unmounted_drive("archive/drive1/a.txt"));

        std::fs::create_dir_all(tmp.path().join("archive/drive1")).unwrap();
        assert!(!archive.is_on_detached_drive("archive/drive1/a.txt"));
        assert!(archive.is_on_unmounted_drive("archive/drive1/a.txt"));

        assert!(!archive.is_on_detached_drive("archive/loose.txt"));
        assert!(!archive.is_on_detached_drive("docs/a.txt"));
    }

    #[test]
    fn drive_mounted_requires_non_empty_directory() {
        let (tmp, archive) = setup();
        assert!(!archive.is_drive_mounted("drive1"));
        std::fs::create_dir_all(tmp.path().join("archive/drive1")).unwrap();
        assert!(!archive.is_drive_mounted("drive1"));
        std::fs::write(tmp.path().join("archive/drive1/a"), "x").unwrap();
        assert!(archive.is_drive_mounted("drive1"));
    }

    #[test]
    fn markers_follow_pipeline_state() {
        let (tmp, archive) = setup();
        std::fs::create_dir_all(tmp.path().join("archive/drive1")).unwrap();
        std::fs::write(tmp.path().join("archive/drive1/a.txt"), "x").unwrap();

        let busy = doc("a", &["archive/drive1/a.txt"], "text");
        archive.update_drive_markers([&busy], false).unwrap();
        assert_eq!(archive.drive_status("drive1"), Some(DriveStatus::Pending));

        let done = doc("a", &["archive/drive1/a.txt"], "");
        let report = archive.update_drive_markers([&done], false).unwrap();
        assert_eq!(report.ready, 1);
        assert_eq!(archive.drive_status("drive1"), Some(DriveStatus::Ready));
        assert!(!tmp.path().join("archive/drive1-status-pending").exists());

        archive.update_drive_markers([&done], true).unwrap();
        assert_eq!(archive.drive_status("drive1"), Some(DriveStatus::Pending));

        let content =
            std::fs::read_to_string(tmp.path().join("archive/drive1-status-pending")).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&content).is_ok());
    }

    #[test]
    fn unmounted_drive_is_pending_and_orphans_are_removed() {
        let (tmp, archive) = setup();
        std::fs::write(tmp.path().join("archive/gone-status-ready"), "t").unwrap();

        let offline = doc("a", &["archive/drive9/a.txt"], "");
        let report = archive.update_drive_markers([&offline], false).unwrap();
        assert_eq!(report.pending, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(archive.drive_status("drive9"), Some(DriveStatus::Pending));
        assert_eq!(archive.drive_status("gone"), None);
        assert_eq!(archive.markers().unwrap().len(), 1);
    }
}
