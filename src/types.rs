//! Core data types, enums, and reports for the Seihon packaging library.
//!
//! This module defines the fundamental data structures used throughout Seihon:
//! - The canonical metadata record every source schema and archive format maps onto (`CanonicalMetadata`)
//! - The ordered age rating scale (`AgeRating`)
//! - Enumerations for output and batch settings (`FileFormat`, `BatchPolicy`, `MediaKind`)
//! - Reporting types (`BuildReport`, `BatchReport`, `BuildOutcome`)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Defines the output file format for the generated package.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum FileFormat {
    #[serde(rename = "EPUB")]
    Epub,
    #[default]
    #[serde(rename = "CBZ")]
    Cbz,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Epub => "epub",
            FileFormat::Cbz => "cbz",
        }
    }

    /// Guesses the format from a file extension (`.epub` or `.cbz`, case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "epub" => Some(FileFormat::Epub),
            "cbz" | "zip" => Some(FileFormat::Cbz),
            _ => None,
        }
    }
}

/// Age rating on a total order of severity.
///
/// The derived `Ord` follows declaration order, so `Unknown < Everyone < Teen <
/// Mature17Plus < X18Plus` and the strictest rating of a set is simply its `max`.
#[derive(
    Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Default,
)]
pub enum AgeRating {
    #[default]
    Unknown,
    Everyone,
    Teen,
    #[serde(rename = "Mature17+")]
    Mature17Plus,
    #[serde(rename = "X18+")]
    X18Plus,
}

impl AgeRating {
    /// The value written into ComicInfo `AgeRating` and OPF `schema:contentRating`.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgeRating::Unknown => "Unknown",
            AgeRating::Everyone => "Everyone",
            AgeRating::Teen => "Teen",
            AgeRating::Mature17Plus => "Mature 17+",
            AgeRating::X18Plus => "X18+",
        }
    }

    /// Parses a rating name, accepting the wider ComicInfo vocabulary.
    ///
    /// Matching ignores case and whitespace. Returns `None` for anything unrecognized.
    pub fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        let rating = match key.as_str() {
            "unknown" | "ratingpending" => AgeRating::Unknown,
            "everyone" | "earlychildhood" | "g" | "kidstoadults" | "everyone10+" => {
                AgeRating::Everyone
            }
            "teen" | "pg" => AgeRating::Teen,
            "mature17+" | "mature" | "m" | "ma15+" => AgeRating::Mature17Plus,
            "x18+" | "adultsonly18+" | "r18+" => AgeRating::X18Plus,
            _ => return None,
        };
        Some(rating)
    }
}

impl fmt::Display for AgeRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unified fixed-schema metadata record.
///
/// Every field is optional; list fields are either `None` or non-empty, and a
/// score outside `0..=5` is treated as absent (see [`CanonicalMetadata::normalized`]).
/// `series_number` and `series_total` are only meaningful as a pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMetadata {
    pub title: Option<String>,
    pub series: Option<String>,
    /// Decimal string, e.g. `"2.5"`.
    pub series_number: Option<String>,
    /// Integer string, e.g. `"5"`.
    pub series_total: Option<String>,
    pub description: Option<String>,
    /// ISO `YYYY-MM-DD`.
    pub date: Option<String>,
    pub writers: Option<Vec<String>>,
    pub artists: Option<Vec<String>>,
    pub cover_artists: Option<Vec<String>>,
    pub publisher: Option<String>,
    pub tags: Option<Vec<String>>,
    pub url: Option<String>,
    #[serde(default)]
    pub age_rating: AgeRating,
    pub score: Option<u8>,
    pub page_count: Option<u32>,
    pub id: Option<String>,
    pub language: Option<String>,
}

impl CanonicalMetadata {
    /// Creates an otherwise empty record carrying only a title.
    pub fn with_title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    /// Returns a copy with the record invariants enforced: blank strings and
    /// empty lists become `None`, and an out-of-range score is dropped.
    pub fn normalized(mut self) -> Self {
        fn text(v: Option<String>) -> Option<String> {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        }
        fn list(v: Option<Vec<String>>) -> Option<Vec<String>> {
            v.map(|items| {
                items
                    .into_iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|items| !items.is_empty())
        }

        self.title = text(self.title);
        self.series = text(self.series);
        self.series_number = text(self.series_number);
        self.series_total = text(self.series_total);
        self.description = text(self.description);
        self.date = text(self.date);
        self.publisher = text(self.publisher);
        self.url = text(self.url);
        self.id = text(self.id);
        self.language = text(self.language);
        self.writers = list(self.writers);
        self.artists = list(self.artists);
        self.cover_artists = list(self.cover_artists);
        self.tags = list(self.tags);
        self.score = self.score.filter(|s| *s <= 5);
        self
    }

    /// Field-level merge: every non-null field of `overrides` replaces the
    /// corresponding field of `self`. An `Unknown` age rating counts as null.
    pub fn merge(&self, overrides: &CanonicalMetadata) -> CanonicalMetadata {
        fn pick<T: Clone>(base: &Option<T>, over: &Option<T>) -> Option<T> {
            over.clone().or_else(|| base.clone())
        }

        CanonicalMetadata {
            title: pick(&self.title, &overrides.title),
            series: pick(&self.series, &overrides.series),
            series_number: pick(&self.series_number, &overrides.series_number),
            series_total: pick(&self.series_total, &overrides.series_total),
            description: pick(&self.description, &overrides.description),
            date: pick(&self.date, &overrides.date),
            writers: pick(&self.writers, &overrides.writers),
            artists: pick(&self.artists, &overrides.artists),
            cover_artists: pick(&self.cover_artists, &overrides.cover_artists),
            publisher: pick(&self.publisher, &overrides.publisher),
            tags: pick(&self.tags, &overrides.tags),
            url: pick(&self.url, &overrides.url),
            age_rating: if overrides.age_rating == AgeRating::Unknown {
                self.age_rating
            } else {
                overrides.age_rating
            },
            score: pick(&self.score, &overrides.score),
            page_count: pick(&self.page_count, &overrides.page_count),
            id: pick(&self.id, &overrides.id),
            language: pick(&self.language, &overrides.language),
        }
        .normalized()
    }

    /// All credited people, writers first, without duplicates.
    pub fn authors(&self) -> Vec<String> {
        let mut authors: Vec<String> = Vec::new();
        for name in self
            .writers
            .iter()
            .flatten()
            .chain(self.artists.iter().flatten())
        {
            if !authors.contains(name) {
                authors.push(name.clone());
            }
        }
        authors
    }
}

/// Broad classification of a source file by extension.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MediaKind {
    Text,
    Html,
    Image,
    Video,
    Metadata,
    Other,
}

impl MediaKind {
    pub fn of(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "txt" => MediaKind::Text,
            "html" | "htm" | "xhtml" => MediaKind::Html,
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" => MediaKind::Image,
            "mp4" | "mkv" | "webm" | "mov" | "avi" | "m4v" => MediaKind::Video,
            "json" => MediaKind::Metadata,
            _ => MediaKind::Other,
        }
    }

    /// Whether files of this kind can become EPUB chapters.
    pub fn is_chapter_source(&self) -> bool {
        matches!(self, MediaKind::Text | MediaKind::Html | MediaKind::Image)
    }
}

/// Controls what a batch driver does after an item fails.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum BatchPolicy {
    /// Record the failure and move on to the next item.
    #[default]
    ContinueOnError,
    /// Record the failure and stop; items already finished are kept.
    AbortOnError,
}

/// What happened to the output path of a single build or update.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BuildOutcome {
    /// No file existed; a new one was written.
    Created,
    /// An existing file was replaced.
    Replaced,
    /// The existing file already held the same content and was left untouched.
    Unchanged,
    /// An existing, different file was kept because overwriting was not requested.
    Skipped,
}

/// A content unit that was left out of a build.
#[derive(Debug, Clone)]
pub struct SkippedUnit {
    pub id: String,
    pub title: String,
    pub reason: String,
}

/// Report from a single package build or update.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub output_path: PathBuf,
    pub format: FileFormat,
    pub outcome: BuildOutcome,
    pub skipped_units: Vec<SkippedUnit>,
}

/// A single failed item of a batch run.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub input: PathBuf,
    pub error: String,
}

/// Report from a batch run over several inputs.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub completed: Vec<BuildReport>,
    pub failures: Vec<BatchFailure>,
    /// True when `BatchPolicy::AbortOnError` stopped the run early.
    pub aborted: bool,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Utility function: Determines the canonical extension and MIME type of an image path.
///
/// # Supported formats
///
/// - JPEG/JPG: image/jpeg
/// - PNG: image/png
/// - WebP: image/webp
/// - GIF: image/gif
/// - BMP: image/bmp
pub fn get_file_info(image_path: &Path) -> Result<(&'static str, &'static str)> {
    let ext = image_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => Ok(("jpg", "image/jpeg")),
        Some("png") => Ok(("png", "image/png")),
        Some("webp") => Ok(("webp", "image/webp")),
        Some("gif") => Ok(("gif", "image/gif")),
        Some("bmp") => Ok(("bmp", "image/bmp")),
        _ => Err(Error::Unsupported(format!("Image format {:#?}", ext))),
    }
}
