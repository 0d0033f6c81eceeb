//! Source directory collection.
//!
//! A source directory holds the media files of one package plus optional JSON
//! sidecars. This module lists it once: the top-level media files eligible for
//! the requested format, the sidecars, and the full (recursive) file tree used
//! for the CBZ page layout and the EPUB provenance mirror. Every list is in
//! natural order and never contains dotfiles or anything below a hidden
//! directory.

use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde_json::Value;
use tokio::fs::{ReadDir, read_dir};

use crate::error::{Error, Result};
use crate::natsort::{natural_cmp_paths, natural_sort_paths};
use crate::path_utils::{get_file_name_lossy, is_hidden_file};
use crate::resolver::media_for_sidecar;
use crate::types::{FileFormat, MediaKind};

/// Everything found in one source directory.
#[derive(Debug, Clone, Default)]
pub struct SourceListing {
    pub root: PathBuf,
    /// Top-level non-sidecar files, eligible or not.
    pub media: Vec<PathBuf>,
    /// Top-level `*.json` sidecars.
    pub sidecars: Vec<PathBuf>,
    /// All files below `root`, recursively, sidecars included.
    pub tree: Vec<PathBuf>,
}

impl SourceListing {
    /// Top-level files that can become content for `format`.
    pub fn eligible(&self, format: FileFormat) -> Vec<PathBuf> {
        self.media
            .iter()
            .filter(|p| is_eligible(p, format))
            .cloned()
            .collect()
    }

    /// Whether every top-level media file is an image.
    pub fn is_images_only(&self) -> bool {
        !self.media.is_empty()
            && self
                .media
                .iter()
                .all(|p| MediaKind::of(p) == MediaKind::Image)
    }

    /// The extension of the media file the sidecars describe, used by the
    /// resolver's written-text fallback. Pairing failures are absorbed: the
    /// first eligible file's extension is used instead.
    pub fn described_extension(&self, format: FileFormat) -> Option<String> {
        let paired = self.sidecars.iter().find_map(|sidecar| {
            match media_for_sidecar(sidecar, &self.media) {
                Ok(media) => Some(media),
                Err(e) => {
                    warn!("Sidecar {:?} not paired: {}", sidecar, e);
                    None
                }
            }
        });
        paired
            .or_else(|| self.eligible(format).into_iter().next())
            .and_then(|p| {
                p.extension()
                    .map(|e| e.to_string_lossy().to_ascii_lowercase())
            })
    }
}

/// Whether a single file can become content for `format`.
pub fn is_eligible(path: &Path, format: FileFormat) -> bool {
    if is_hidden_file(path) {
        return false;
    }
    let kind = MediaKind::of(path);
    match format {
        FileFormat::Cbz => kind == MediaKind::Image,
        FileFormat::Epub => kind.is_chapter_source(),
    }
}

/// Lists a source directory.
pub async fn collect_source(directory: &Path) -> Result<SourceListing> {
    if !directory.is_dir() {
        return Err(Error::InvalidPath(
            directory.to_path_buf(),
            "Source is not a directory".to_string(),
        ));
    }

    let mut media = Vec::new();
    let mut sidecars = Vec::new();
    for path in collect_entries(directory, false).await? {
        if MediaKind::of(&path) == MediaKind::Metadata {
            sidecars.push(path);
        } else {
            media.push(path);
        }
    }
    natural_sort_paths(&mut media);
    natural_sort_paths(&mut sidecars);

    let tree = collect_tree(directory).await?;
    debug!(
        "Collected {:?}: {} media, {} sidecars, {} files in tree",
        directory,
        media.len(),
        sidecars.len(),
        tree.len()
    );

    Ok(SourceListing {
        root: directory.to_path_buf(),
        media,
        sidecars,
        tree,
    })
}

/// Collects the non-hidden entries of one directory.
///
/// When `only_dirs` is true only directories are returned, otherwise only files.
pub async fn collect_entries(directory: &Path, only_dirs: bool) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = Vec::new();
    let mut paths: ReadDir = read_dir(directory).await?;

    while let Some(entry) = paths.next_entry().await? {
        let path = entry.path();
        if is_hidden_file(&path) {
            continue;
        }
        let is_dir = entry.file_type().await?.is_dir();
        if only_dirs == is_dir {
            entries.push(path);
        }
    }

    Ok(entries)
}

/// Recursively collects every non-hidden file below `directory`.
///
/// Each directory's files come first in natural order, followed by its
/// sub-directories in natural order.
pub async fn collect_tree(directory: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![directory.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut dir_files = collect_entries(&current, false).await?;
        natural_sort_paths(&mut dir_files);
        files.extend(dir_files);

        let mut sub_dirs = collect_entries(&current, true).await?;
        // Reverse so the naturally-first directory is popped first.
        sub_dirs.sort_by(|a, b| natural_cmp_paths(b, a));
        pending.extend(sub_dirs);
    }

    Ok(files)
}

/// Reads and parses sidecars; unreadable or malformed documents are skipped.
///
/// Returns `(file name, document)` pairs in the listing's order.
pub async fn load_sidecars(sidecars: &[PathBuf]) -> Vec<(String, Value)> {
    let mut documents = Vec::with_capacity(sidecars.len());
    for path in sidecars {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Skipping unreadable sidecar {:?}: {}", path, e);
                continue;
            }
        };
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => documents.push((get_file_name_lossy(path), value)),
            Err(e) => warn!("Skipping malformed sidecar {:?}: {}", path, e),
        }
    }
    documents
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_depends_on_format() {
        assert!(is_eligible(Path::new("a/ch1.txt"), FileFormat::Epub));
        assert!(!is_eligible(Path::new("a/ch1.txt"), FileFormat::Cbz));
        assert!(is_eligible(Path::new("a/p1.PNG"), FileFormat::Cbz));
        assert!(!is_eligible(Path::new("a/.p1.png"), FileFormat::Cbz));
        assert!(!is_eligible(Path::new("a/info.json"), FileFormat::Epub));
        assert!(!is_eligible(Path::new("a/clip.mp4"), FileFormat::Epub));
    }

    #[test]
    fn described_extension_prefers_paired_media() {
        let listing = SourceListing {
            root: PathBuf::from("d"),
            media: vec![PathBuf::from("d/a.png"), PathBuf::from("d/story.txt")],
            sidecars: vec![PathBuf::from("d/story.json")],
            tree: Vec::new(),
        };
        assert_eq!(
            listing.described_extension(FileFormat::Epub).as_deref(),
            Some("txt")
        );

        let unpaired = SourceListing {
            sidecars: vec![PathBuf::from("d/other.json")],
            ..listing
        };
        assert_eq!(
            unpaired.described_extension(FileFormat::Epub).as_deref(),
            Some("png")
        );
    }
}
