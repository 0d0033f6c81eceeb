//! Generator module provides traits and implementations for the package formats.
//!
//! A generator collects its inputs (source files, metadata, and for EPUB the
//! chapter model) and assembles the whole zip in memory when saved. Writing the
//! bytes to disk is a separate step, [`write_package`], which compares against
//! an existing target so that unchanged rebuilds leave the file untouched.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info};
use tempfile::NamedTempFile;
use tokio::task::spawn_blocking;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime as ZipDateTime};

use crate::error::{Error, Result};
use crate::types::{BuildOutcome, CanonicalMetadata, SkippedUnit};

pub mod cbz;
pub mod epub;

/// Format of `dcterms:modified`.
pub const MODIFIED_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// An assembled package, not yet written anywhere.
#[derive(Debug, Clone)]
pub struct Package {
    pub bytes: Vec<u8>,
    /// Units left out because their sources could not be normalized.
    pub skipped_units: Vec<SkippedUnit>,
}

/// Common interface for all package generators.
///
/// The `Generator` trait defines a consistent API for assembling the different
/// package formats (CBZ, EPUB) from a source directory.
#[async_trait]
pub trait Generator {
    /// Creates a new generator for the given source directory.
    ///
    /// # Parameters
    /// * `source_root` - Directory whose files are packed with paths relative to it
    ///
    /// # Returns
    /// * `Result<Self>` - A new generator instance or an error if the root is unusable
    fn new(source_root: &Path) -> Result<Self>
    where
        Self: Sized;

    /// Adds a source file to be packed verbatim.
    ///
    /// CBZ packs these as pages at their relative path; EPUB mirrors them under
    /// `EPUB/original/`.
    ///
    /// # Parameters
    /// * `path` - A file below the source root
    ///
    /// # Returns
    /// * `Result<&mut Self>` - Self reference for method chaining, or an error if failed
    async fn add_page(&mut self, path: &Path) -> Result<&mut Self>
    where
        Self: Sized;

    /// Sets the metadata written into the package's metadata document.
    async fn set_metadata(&mut self, metadata: &CanonicalMetadata) -> Result<&mut Self>
    where
        Self: Sized;

    /// Assembles the package in memory.
    ///
    /// # Returns
    /// * `Result<Package>` - The zip bytes and any skipped units
    async fn save(self) -> Result<Package>;
}

/// Zip options shared by every entry: fixed timestamp, deflate.
pub fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(ZipDateTime::default())
        .unix_permissions(0o644)
}

/// Zip options for entries that must not be compressed (`mimetype`).
pub fn stored_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(ZipDateTime::default())
}

/// The `dcterms:modified` value: the explicit timestamp, else the metadata
/// date at midnight UTC, else the unix epoch.
pub fn modified_timestamp(
    explicit: Option<DateTime<Utc>>,
    metadata: &CanonicalMetadata,
) -> String {
    let fallback = || {
        metadata
            .date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    };
    explicit
        .unwrap_or_else(fallback)
        .format(MODIFIED_FORMAT)
        .to_string()
}

/// Writes `bytes` to `target` unless an identical file is already there.
///
/// | target | `overwrite` | result |
/// |--------|-------------|--------|
/// | missing | any | `Created` |
/// | same bytes | `false` | `Unchanged` |
/// | different bytes | `false` | `Skipped` |
/// | exists | `true` | `Replaced` |
///
/// The file is written next to `target` and renamed over it, so a failed
/// write never leaves a truncated package behind.
pub async fn write_package(target: &Path, bytes: Vec<u8>, overwrite: bool) -> Result<BuildOutcome> {
    let exists = tokio::fs::try_exists(target).await?;
    if exists && !overwrite {
        let current = tokio::fs::read(target).await?;
        if current == bytes {
            info!("{:?} is up to date", target);
            return Ok(BuildOutcome::Unchanged);
        }
        info!("{:?} exists with different content; not overwriting", target);
        return Ok(BuildOutcome::Skipped);
    }

    let target_buf = target.to_path_buf();
    spawn_blocking(move || -> Result<()> {
        let parent = target_buf
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut file = NamedTempFile::new_in(parent)?;
        std::io::Write::write_all(&mut file, &bytes)?;
        file.as_file().sync_all()?;
        file.persist(&target_buf).map_err(|e| Error::Io(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::AsyncTaskError(e.to_string()))??;

    debug!("Wrote {:?}", target);
    Ok(if exists {
        BuildOutcome::Replaced
    } else {
        BuildOutcome::Created
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn modified_prefers_explicit_then_date_then_epoch() {
        let mut meta = CanonicalMetadata::default();
        assert_eq!(modified_timestamp(None, &meta), "1970-01-01T00:00:00Z");
        meta.date = Some("2022-07-08".to_string());
        assert_eq!(modified_timestamp(None, &meta), "2022-07-08T00:00:00Z");
        let explicit = Utc.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            modified_timestamp(Some(explicit), &meta),
            "2023-01-02T03:04:05Z"
        );
    }
}
