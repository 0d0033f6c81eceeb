//! Ordered chapter model for EPUB builds.
//!
//! A [`ChapterModel`] is a list of [`ContentUnit`]s built once from a
//! natural-sorted directory listing. `group`, `separate`, `add_cover` and the
//! small edit helpers never mutate the model: each returns a new one with ids
//! renumbered `item0..itemN`.

use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;

use crate::collector::{collect_source, is_eligible};
use crate::error::{Error, Result};
use crate::natsort::natural_sort_paths;
use crate::path_utils::get_file_stem_lossy;
use crate::services::CoverGenerator;
use crate::types::{CanonicalMetadata, FileFormat};

lazy_static! {
    static ref LEADING_TAG: Regex = Regex::new(r"^\s*(?:\[[^\]]*\]|\([^)]*\))\s*").unwrap();
}

/// Title given to the synthetic cover unit.
pub const COVER_TITLE: &str = "Cover";

/// File name of the generated cover inside the build's scratch directory.
pub const COVER_FILE_NAME: &str = "cover.png";

/// One chapter of an EPUB: an ordered group of source files.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentUnit {
    pub id: String,
    pub source_files: Vec<PathBuf>,
    pub title: String,
    pub include: bool,
    /// Marks the synthetic cover unit created by [`ChapterModel::add_cover`].
    pub is_cover: bool,
    grouped_from: Vec<ContentUnit>,
}

impl ContentUnit {
    /// A single-file unit titled after its file name.
    pub fn from_file(path: PathBuf) -> Self {
        Self {
            id: String::new(),
            title: title_from_path(&path),
            source_files: vec![path],
            include: true,
            is_cover: false,
            grouped_from: Vec::new(),
        }
    }

    /// Whether this unit was produced by [`ChapterModel::group`].
    pub fn is_grouped(&self) -> bool {
        !self.grouped_from.is_empty()
    }
}

/// Derives a chapter title from a file name: the stem with one leading
/// `[tag]` or `(tag)` removed and surrounding whitespace trimmed.
pub fn title_from_path(path: &Path) -> String {
    let stem = get_file_stem_lossy(path);
    let stripped = LEADING_TAG.replace(&stem, "");
    let title = stripped.trim();
    if title.is_empty() {
        stem.trim().to_string()
    } else {
        title.to_string()
    }
}

/// Ordered, value-semantics list of content units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChapterModel {
    units: Vec<ContentUnit>,
}

impl ChapterModel {
    /// Builds one unit per file, in natural order.
    pub fn from_files(mut files: Vec<PathBuf>) -> Self {
        natural_sort_paths(&mut files);
        Self::renumbered(files.into_iter().map(ContentUnit::from_file).collect())
    }

    fn renumbered(mut units: Vec<ContentUnit>) -> Self {
        for (i, unit) in units.iter_mut().enumerate() {
            unit.id = format!("item{}", i);
        }
        Self { units }
    }

    pub fn units(&self) -> &[ContentUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Units that go into the spine, nav and ncx.
    pub fn included(&self) -> impl Iterator<Item = &ContentUnit> {
        self.units.iter().filter(|u| u.include)
    }

    /// Merges the units at `indices` into one, placed where the first of them
    /// was. The merged unit keeps the first unit's title and include flag and
    /// its files in original order. Invalid and duplicate indices are ignored;
    /// fewer than two valid indices leaves the model unchanged.
    pub fn group(&self, indices: &[usize]) -> ChapterModel {
        let mut selected: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|i| *i < self.units.len())
            .collect();
        selected.sort_unstable();
        selected.dedup();
        if selected.len() < 2 {
            debug!("group: fewer than two valid indices, nothing to do");
            return self.clone();
        }

        let members: Vec<ContentUnit> = selected.iter().map(|i| self.units[*i].clone()).collect();
        let first = &members[0];
        let merged = ContentUnit {
            id: String::new(),
            source_files: members
                .iter()
                .flat_map(|u| u.source_files.iter().cloned())
                .collect(),
            title: first.title.clone(),
            include: first.include,
            is_cover: first.is_cover,
            grouped_from: members.clone(),
        };

        let mut units = Vec::with_capacity(self.units.len() - selected.len() + 1);
        for (i, unit) in self.units.iter().enumerate() {
            if i == selected[0] {
                units.push(merged.clone());
            } else if !selected.contains(&i) {
                units.push(unit.clone());
            }
        }
        Self::renumbered(units)
    }

    /// Splits the multi-file unit at `index`. A unit made by [`group`](Self::group)
    /// gets its original units back; any other multi-file unit becomes one
    /// unit per file with titles derived from the file names. Single-file
    /// units and invalid indices are no-ops.
    pub fn separate(&self, index: usize) -> ChapterModel {
        let Some(unit) = self.units.get(index) else {
            return self.clone();
        };
        if unit.source_files.len() < 2 {
            return self.clone();
        }

        let pieces: Vec<ContentUnit> = if unit.is_grouped() {
            unit.grouped_from.clone()
        } else {
            unit.source_files
                .iter()
                .map(|path| ContentUnit {
                    include: unit.include,
                    ..ContentUnit::from_file(path.clone())
                })
                .collect()
        };

        let mut units = self.units.clone();
        units.splice(index..=index, pieces);
        Self::renumbered(units)
    }

    /// Returns a copy with the unit at `index` included or excluded.
    pub fn with_include(&self, index: usize, include: bool) -> ChapterModel {
        let mut units = self.units.clone();
        if let Some(unit) = units.get_mut(index) {
            unit.include = include;
        }
        Self::renumbered(units)
    }

    /// Returns a copy with the unit at `index` retitled.
    pub fn with_title(&self, index: usize, title: &str) -> ChapterModel {
        let mut units = self.units.clone();
        if let Some(unit) = units.get_mut(index) {
            unit.title = title.trim().to_string();
        }
        Self::renumbered(units)
    }

    /// Prepends a unit titled "Cover" showing a generated cover image.
    ///
    /// The image is written to `scratch_dir` by `generator`. When generation
    /// fails the model is returned unchanged. An existing cover unit is
    /// replaced rather than duplicated.
    pub fn add_cover(
        &self,
        metadata: &CanonicalMetadata,
        generator: &dyn CoverGenerator,
        scratch_dir: &Path,
        width: u32,
    ) -> ChapterModel {
        let target = scratch_dir.join(COVER_FILE_NAME);
        let title = metadata.title.as_deref().unwrap_or_default();
        if !generator.generate(title, &metadata.authors(), &target, width) {
            warn!("Cover generation failed; building without a cover unit");
            return self.clone();
        }

        let cover = ContentUnit {
            id: String::new(),
            source_files: vec![target],
            title: COVER_TITLE.to_string(),
            include: true,
            is_cover: true,
            grouped_from: Vec::new(),
        };
        let mut units = Vec::with_capacity(self.units.len() + 1);
        units.push(cover);
        units.extend(self.units.iter().filter(|u| !u.is_cover).cloned());
        Self::renumbered(units)
    }
}

/// Lists `dir` and builds the default model: one unit per eligible top-level
/// file, in natural order. No eligible file is [`Error::MissingSourceMedia`].
pub async fn default_chapters(dir: &Path, format: FileFormat) -> Result<ChapterModel> {
    let listing = collect_source(dir).await?;
    let files: Vec<PathBuf> = listing
        .media
        .into_iter()
        .filter(|p| is_eligible(p, format))
        .collect();
    if files.is_empty() {
        return Err(Error::MissingSourceMedia(dir.to_path_buf(), 0));
    }
    Ok(ChapterModel::from_files(files))
}
