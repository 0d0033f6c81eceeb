//! Seihon - binding loose media folders into CBZ and EPUB packages
//!
//! A source directory holds media files (images, text, HTML) and optional
//! JSON sidecars written by whatever tool downloaded them. Seihon resolves the
//! sidecars into one canonical metadata record, normalizes text and HTML into
//! XHTML chapters, and assembles a deterministic CBZ (`ComicInfo.xml`) or
//! EPUB 3 (OPF, nav, NCX) package. Existing packages can later be reopened and
//! their metadata rewritten without touching anything else.
//!
//! # Getting Started
//!
//! ```rust,no_run
//! use seihon::prelude::*;
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> seihon::error::Result<()> {
//!     let overrides = CanonicalMetadata {
//!         series: Some("My Series".to_string()),
//!         series_number: Some("2".to_string()),
//!         ..Default::default()
//!     };
//!
//!     let config = SeihonConfig::builder()
//!         .source_path(PathBuf::from("./downloads/story"))
//!         .target_path(PathBuf::from("./library"))
//!         .metadata_overrides(overrides)
//!         .generate_cover(true)
//!         .build()?;
//!
//!     let report = config.convert_from_source().await?;
//!     println!("{:?} -> {:?}", report.output_path, report.outcome);
//!
//!     // Later: fix the rating of the package that was just written
//!     let fix = CanonicalMetadata {
//!         age_rating: AgeRating::Teen,
//!         ..Default::default()
//!     };
//!     let updater = SeihonConfig::builder().metadata_overrides(fix).build()?;
//!     updater.update_archive(&report.output_path).await?;
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod chapters;
pub mod codec;
pub mod collector;
pub mod error;
pub mod generator;
pub mod natsort;
pub mod normalizer;
pub mod path_utils;
pub mod resolver;
pub mod seihon;
pub mod services;
pub mod types;

// Publicly expose the main `SeihonConfig` struct and its builder
pub use seihon::SeihonConfig;
pub use seihon::SeihonConfigBuilder;

pub use archive::{ArchiveCodec, UpdateOptions};
pub use chapters::{ChapterModel, ContentUnit, default_chapters};
pub use resolver::{MetadataResolver, ResolverConfig};
pub use types::{
    AgeRating, BatchPolicy, BatchReport, BuildOutcome, BuildReport, CanonicalMetadata,
    FileFormat, SkippedUnit,
};

/// Prelude module for convenient imports.
///
/// Re-exports the types most callers need so that `use seihon::prelude::*;`
/// is enough for building and updating packages.
pub mod prelude {
    pub use super::{
        AgeRating, ArchiveCodec, BatchPolicy, BatchReport, BuildOutcome, BuildReport,
        CanonicalMetadata, ChapterModel, ContentUnit, FileFormat, MetadataResolver,
        ResolverConfig, SeihonConfig, SeihonConfigBuilder, SkippedUnit, UpdateOptions,
        default_chapters, error, generator, types,
    };
    pub use crate::services::{CoverGenerator, ImageCrateProbe, ImageProbe, PlainCoverGenerator};
    pub use std::path::{Path, PathBuf};
    pub use std::sync::Arc;
}
