use chrono::{DateTime, Utc};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

use crate::archive::{ArchiveCodec, UpdateOptions};
use crate::chapters::ChapterModel;
use crate::collector::{SourceListing, collect_source, load_sidecars};
use crate::error::{Error, Result};
use crate::generator::{Generator, Package, cbz::Cbz, epub::EPub, write_package};
use crate::natsort::natural_sort_paths;
use crate::normalizer::DEFAULT_WRAPPER_NAMES;
use crate::path_utils::{get_file_name_lossy, sanitize_filename};
use crate::resolver::{MetadataResolver, ResolverConfig};
use crate::services::{CoverGenerator, ImageCrateProbe, ImageProbe, PlainCoverGenerator};
use crate::types::{
    BatchFailure, BatchPolicy, BatchReport, BuildReport, CanonicalMetadata, FileFormat,
};

fn default_wrapper_names() -> Vec<String> {
    DEFAULT_WRAPPER_NAMES.iter().map(|s| s.to_string()).collect()
}

/// The main Seihon configuration, built declaratively using the builder pattern.
///
/// One value drives every entry point:
///
/// - [`convert_from_source`](SeihonConfig::convert_from_source): package one source directory
/// - [`convert_with_chapters`](SeihonConfig::convert_with_chapters): same, with an edited chapter model
/// - [`convert_batch`](SeihonConfig::convert_batch): package several source directories in turn
/// - [`update_archive`](SeihonConfig::update_archive) / [`update_batch`](SeihonConfig::update_batch):
///   rewrite the metadata of existing packages
///
/// ## Builder Pattern
///
/// ```rust,no_run
/// # use seihon::prelude::*;
/// # use std::path::PathBuf;
/// let config = SeihonConfig::builder()
///     .source_path(PathBuf::from("./source"))
///     .target_path(PathBuf::from("./output"))
///     .output_format(FileFormat::Epub)
///     .build()
///     .expect("Invalid configuration");
/// ```
#[derive(Clone, derive_builder::Builder)]
#[builder(setter(into, strip_option), build_fn(validate = "Self::validate"))]
pub struct SeihonConfig {
    /// Directory holding the media files and JSON sidecars of one package.
    #[builder(default)]
    pub source_path: PathBuf,

    /// Directory the package is written to.
    ///
    /// If [`create_output_directory`](SeihonConfig::create_output_directory) is true,
    /// a subdirectory named after the title is created here.
    #[builder(default)]
    pub target_path: PathBuf,

    /// Output format. When unset, a source holding only images becomes a CBZ
    /// and anything else an EPUB.
    #[builder(default)]
    pub output_format: Option<FileFormat>,

    /// Fields layered over the resolved metadata (builds) or the embedded
    /// metadata (updates). Only non-null fields take effect.
    #[builder(default)]
    pub metadata_overrides: Option<CanonicalMetadata>,

    /// Key-path and publisher tables for sidecar resolution.
    #[builder(default)]
    pub resolver: ResolverConfig,

    /// Whether to write into `target_path/<title>/` instead of `target_path/`.
    #[builder(default = "true")]
    pub create_output_directory: bool,

    /// Replace existing packages even when their content is identical, and
    /// rebuild archives on update even when the metadata did not change.
    #[builder(default = "false")]
    pub overwrite: bool,

    /// Prepend a generated cover chapter to EPUB builds; regenerate the cover
    /// image on update.
    #[builder(default = "false")]
    pub generate_cover: bool,

    /// Width in pixels of generated covers.
    #[builder(default = "1200")]
    pub cover_width: u32,

    /// Language used when the metadata names none.
    #[builder(default = "\"en\".to_string()")]
    pub language: String,

    /// Class/id names of publisher wrapper `<div>`s stripped from HTML chapters.
    #[builder(default = "default_wrapper_names()")]
    pub wrapper_names: Vec<String>,

    #[builder(default)]
    pub batch_policy: BatchPolicy,

    /// Fixed `dcterms:modified` for EPUB output. Without it the metadata date
    /// is used, which keeps rebuilds byte-identical.
    #[builder(default)]
    pub modified_timestamp: Option<DateTime<Utc>>,

    #[builder(setter(custom), default = "Arc::new(ImageCrateProbe)")]
    pub image_probe: Arc<dyn ImageProbe>,

    #[builder(setter(custom), default = "Arc::new(PlainCoverGenerator)")]
    pub cover_generator: Arc<dyn CoverGenerator>,
}

impl std::fmt::Debug for SeihonConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeihonConfig")
            .field("source_path", &self.source_path)
            .field("target_path", &self.target_path)
            .field("output_format", &self.output_format)
            .field("metadata_overrides", &self.metadata_overrides)
            .field("create_output_directory", &self.create_output_directory)
            .field("overwrite", &self.overwrite)
            .field("generate_cover", &self.generate_cover)
            .field("cover_width", &self.cover_width)
            .field("language", &self.language)
            .field("wrapper_names", &self.wrapper_names)
            .field("batch_policy", &self.batch_policy)
            .field("modified_timestamp", &self.modified_timestamp)
            .field("image_probe", &"Some(Service)")
            .field("cover_generator", &"Some(Service)")
            // Resolver tables are long; skip them
            .finish()
    }
}

impl SeihonConfig {
    /// Creates a new builder for configuring `SeihonConfig`.
    pub fn builder() -> SeihonConfigBuilder {
        SeihonConfigBuilder::default()
    }

    /// Checks the configuration for a build from `source_path` without touching
    /// any content. Every `convert_*` method runs the same checks.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use seihon::prelude::*;
    /// # use std::path::PathBuf;
    /// # fn main() -> seihon::error::Result<()> {
    /// let config = SeihonConfig::builder()
    ///     .source_path(PathBuf::from("./source"))
    ///     .target_path(PathBuf::from("./output"))
    ///     .build()?;
    ///
    /// config.preflight_check()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn preflight_check(&self) -> Result<&Self> {
        if self.target_path.as_os_str().is_empty() {
            return Err(Error::Other("Target path is required".to_string()));
        }
        self.validate_source(&self.source_path)?;
        Ok(self)
    }

    fn validate_source(&self, source: &Path) -> Result<()> {
        if source.as_os_str().is_empty() {
            return Err(Error::Other("`source_path` must be set".to_string()));
        }
        if !source.exists() {
            return Err(Error::NotFound(format!(
                "Source path does not exist: {:?}",
                source
            )));
        }
        if !source.is_dir() {
            return Err(Error::InvalidPath(
                source.to_path_buf(),
                "Source path is not a directory.".to_string(),
            ));
        }
        Ok(())
    }

    async fn target_directory(&self, title: &str) -> Result<PathBuf> {
        if self.target_path.as_os_str().is_empty() {
            return Err(Error::Other("Target path is required".to_string()));
        }
        if self.create_output_directory {
            let path = self.target_path.join(sanitize_filename(title));
            if !path.exists() {
                fs::create_dir_all(&path).await?;
            }
            Ok(path)
        } else {
            if !self.target_path.exists() {
                return Err(Error::NotFound(
                    "Target directory does not exist".to_string(),
                ));
            }
            Ok(self.target_path.clone())
        }
    }

    /// Resolves the metadata for a listed source: sidecars first, then the
    /// directory name as title and the configured language, then overrides.
    pub async fn resolve_metadata(
        &self,
        listing: &SourceListing,
        format: FileFormat,
    ) -> CanonicalMetadata {
        let documents = load_sidecars(&listing.sidecars).await;
        let extension = listing.described_extension(format);
        let mut metadata = MetadataResolver::new(&self.resolver)
            .resolve_all(&documents, extension.as_deref())
            .unwrap_or_default();

        if metadata.title.is_none() {
            metadata.title = Some(get_file_name_lossy(&listing.root));
        }
        if metadata.language.is_none() {
            metadata.language = Some(self.language.clone());
        }
        match &self.metadata_overrides {
            Some(overrides) => metadata.merge(overrides),
            None => metadata.normalized(),
        }
    }

    /// Packages `source_path` into a single CBZ or EPUB.
    ///
    /// The package is assembled completely in memory and only then compared
    /// with, and possibly written over, an existing file of the same name.
    /// A source with no eligible media fails with
    /// [`Error::MissingSourceMedia`] and writes nothing.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use seihon::prelude::*;
    /// # use std::path::PathBuf;
    /// # #[tokio::main]
    /// # async fn main() -> seihon::error::Result<()> {
    /// let config = SeihonConfig::builder()
    ///     .source_path(PathBuf::from("./my_story"))
    ///     .target_path(PathBuf::from("./output"))
    ///     .build()?;
    ///
    /// let report = config.convert_from_source().await?;
    /// println!("{:?}: {:?}", report.output_path, report.outcome);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn convert_from_source(&self) -> Result<BuildReport> {
        self.preflight_check()?;
        self.convert(&self.source_path, None).await
    }

    /// Like [`convert_from_source`](SeihonConfig::convert_from_source), but
    /// with a chapter model edited by the caller (grouped, separated,
    /// retitled). The output is always an EPUB.
    pub async fn convert_with_chapters(&self, chapters: ChapterModel) -> Result<BuildReport> {
        self.preflight_check()?;
        self.convert(&self.source_path, Some(chapters)).await
    }

    async fn convert(&self, source: &Path, chapters: Option<ChapterModel>) -> Result<BuildReport> {
        self.validate_source(source)?;
        let listing = collect_source(source).await?;

        let format = match (&chapters, self.output_format) {
            (Some(_), _) => FileFormat::Epub,
            (None, Some(format)) => format,
            (None, None) if listing.is_images_only() => FileFormat::Cbz,
            (None, None) => FileFormat::Epub,
        };
        let eligible = listing.eligible(format);
        if eligible.is_empty() {
            return Err(Error::MissingSourceMedia(source.to_path_buf(), 0));
        }

        let metadata = self.resolve_metadata(&listing, format).await;
        let title = metadata.title.clone().unwrap_or_default();
        info!("Building {:?} from {:?} as {:?}", title, source, format);

        let target_dir = self.target_directory(&title).await?;
        let output_path =
            target_dir.join(format!("{}.{}", sanitize_filename(&title), format.extension()));

        let package = match format {
            FileFormat::Cbz => self.build_cbz(&listing, &metadata).await?,
            FileFormat::Epub => {
                let chapters = chapters.unwrap_or_else(|| ChapterModel::from_files(eligible));
                self.build_epub(&listing, &metadata, chapters, &target_dir)
                    .await?
            }
        };

        let outcome = write_package(&output_path, package.bytes, self.overwrite).await?;
        info!("{:?}: {:?}", output_path, outcome);
        Ok(BuildReport {
            output_path,
            format,
            outcome,
            skipped_units: package.skipped_units,
        })
    }

    async fn build_cbz(
        &self,
        listing: &SourceListing,
        metadata: &CanonicalMetadata,
    ) -> Result<Package> {
        let mut generator = Cbz::new(&listing.root)?;
        for path in &listing.tree {
            generator.add_page(path).await?;
        }
        generator.set_metadata(metadata).await?;
        generator.save().await
    }

    async fn build_epub(
        &self,
        listing: &SourceListing,
        metadata: &CanonicalMetadata,
        chapters: ChapterModel,
        target_dir: &Path,
    ) -> Result<Package> {
        // Generated covers live here until the package is assembled.
        let scratch = tempfile::Builder::new()
            .prefix(".seihon-")
            .tempdir_in(target_dir)?;
        let chapters = if self.generate_cover {
            chapters.add_cover(
                metadata,
                self.cover_generator.as_ref(),
                scratch.path(),
                self.cover_width,
            )
        } else {
            chapters
        };

        let mut generator = EPub::new(&listing.root)?;
        generator
            .set_probe(Arc::clone(&self.image_probe))
            .set_wrapper_names(self.wrapper_names.clone())
            .set_modified(self.modified_timestamp)
            .set_chapters(chapters);
        for path in &listing.tree {
            generator.add_page(path).await?;
        }
        generator.set_metadata(metadata).await?;
        generator.save().await
    }

    /// Packages each source directory in natural order, one at a time.
    ///
    /// Failures are collected in the report. With
    /// [`BatchPolicy::AbortOnError`] the first failure ends the run; packages
    /// already written stay.
    pub async fn convert_batch(&self, mut sources: Vec<PathBuf>) -> BatchReport {
        natural_sort_paths(&mut sources);
        let mut report = BatchReport::default();
        for source in sources {
            match self.convert(&source, None).await {
                Ok(build) => report.completed.push(build),
                Err(e) => {
                    if self.record_failure(&mut report, source, e) {
                        break;
                    }
                }
            }
        }
        report
    }

    /// Rewrites the metadata of an existing CBZ or EPUB with
    /// [`metadata_overrides`](SeihonConfig::metadata_overrides).
    ///
    /// Nothing is written when the overrides change nothing, unless
    /// `overwrite` or `generate_cover` is set. A failed rebuild leaves the
    /// original archive untouched.
    pub async fn update_archive(&self, archive: &Path) -> Result<BuildReport> {
        let codec = ArchiveCodec::open(archive).await?;
        let overrides = self.metadata_overrides.clone().unwrap_or_default();
        let options = UpdateOptions {
            force: self.overwrite,
            regenerate_cover: self.generate_cover,
            cover_generator: Arc::clone(&self.cover_generator),
            cover_width: self.cover_width,
            modified: self.modified_timestamp,
        };
        let outcome = codec.update(&overrides, options).await?;
        Ok(BuildReport {
            output_path: archive.to_path_buf(),
            format: codec.format(),
            outcome,
            skipped_units: Vec::new(),
        })
    }

    /// Updates each archive in natural order; see [`convert_batch`](SeihonConfig::convert_batch)
    /// for how failures are handled.
    pub async fn update_batch(&self, mut archives: Vec<PathBuf>) -> BatchReport {
        natural_sort_paths(&mut archives);
        let mut report = BatchReport::default();
        for archive in archives {
            match self.update_archive(&archive).await {
                Ok(update) => report.completed.push(update),
                Err(e) => {
                    if self.record_failure(&mut report, archive, e) {
                        break;
                    }
                }
            }
        }
        report
    }

    /// Records a failed item. Returns true when the batch has to stop.
    fn record_failure(&self, report: &mut BatchReport, input: PathBuf, error: Error) -> bool {
        warn!("{:?} failed: {}", input, error);
        report.failures.push(BatchFailure {
            input,
            error: error.to_string(),
        });
        if self.batch_policy == BatchPolicy::AbortOnError {
            report.aborted = true;
            return true;
        }
        false
    }
}

impl SeihonConfigBuilder {
    /// Sets the image probe used to size full-page images.
    pub fn image_probe(&mut self, probe: impl ImageProbe + 'static) -> &mut Self {
        self.image_probe = Some(Arc::new(probe));
        self
    }

    /// Sets the cover generator used for cover chapters and cover regeneration.
    pub fn cover_generator(&mut self, generator: impl CoverGenerator + 'static) -> &mut Self {
        self.cover_generator = Some(Arc::new(generator));
        self
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(language) = &self.language {
            if language.trim().is_empty() {
                return Err("Language must not be empty.".to_string());
            }
        }
        if let Some(width) = self.cover_width {
            if width == 0 {
                return Err("Cover width must be greater than zero.".to_string());
            }
        }
        if let Some(names) = &self.wrapper_names {
            if names.iter().any(|n| n.trim().is_empty()) {
                return Err("Wrapper names must not be blank.".to_string());
            }
        }
        Ok(())
    }
}
