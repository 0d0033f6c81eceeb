use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use tokio::task::spawn_blocking;
use zip::ZipWriter;

use crate::codec::comicinfo::{self, COMIC_INFO_FILE};
use crate::error::{Error, Result};
use crate::generator::{Generator, Package, entry_options};
use crate::path_utils::{is_hidden_file, zip_entry_name};
use crate::types::{CanonicalMetadata, MediaKind};

/// A generator for creating CBZ (Comic Book ZIP) files.
///
/// `ComicInfo.xml` is the first entry, followed by the source tree verbatim
/// at its relative paths. A `ComicInfo.xml` already present at the source
/// root is replaced by the generated one.
pub struct Cbz {
    source_root: PathBuf,
    pages: Vec<(String, PathBuf)>,
    comic_info: Option<String>,
}

impl Cbz {
    /// Number of image pages queued so far.
    pub fn image_count(&self) -> usize {
        self.pages
            .iter()
            .filter(|(_, path)| MediaKind::of(path) == MediaKind::Image)
            .count()
    }

    fn assemble(pages: Vec<(String, PathBuf)>, comic_info: Option<String>) -> Result<Vec<u8>> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = entry_options();

        if let Some(xml) = comic_info {
            zip.start_file(COMIC_INFO_FILE, options)?;
            zip.write_all(xml.as_bytes())?;
        }

        for (entry_name, path) in pages {
            let data = std::fs::read(&path)?;
            zip.start_file(entry_name, options)?;
            zip.write_all(&data)?;
        }

        Ok(zip.finish()?.into_inner())
    }
}

#[async_trait]
impl Generator for Cbz {
    fn new(source_root: &Path) -> Result<Self> {
        if !source_root.is_dir() {
            return Err(Error::InvalidPath(
                source_root.to_path_buf(),
                "Source root is not a directory".to_string(),
            ));
        }
        Ok(Cbz {
            source_root: source_root.to_path_buf(),
            pages: Vec::new(),
            comic_info: None,
        })
    }

    async fn add_page(&mut self, path: &Path) -> Result<&mut Self> {
        if is_hidden_file(path) {
            debug!("Not packing dotfile {:?}", path);
            return Ok(self);
        }
        let entry_name = zip_entry_name(&self.source_root, path)?;
        if entry_name.eq_ignore_ascii_case(COMIC_INFO_FILE) {
            debug!("Source ComicInfo.xml is replaced by the generated one");
            return Ok(self);
        }
        if self.pages.iter().any(|(name, _)| *name == entry_name) {
            return Err(Error::Unsupported(format!("Duplicate entry {}", entry_name)));
        }
        self.pages.push((entry_name, path.to_path_buf()));
        Ok(self)
    }

    async fn set_metadata(&mut self, metadata: &CanonicalMetadata) -> Result<&mut Self> {
        let mut metadata = metadata.clone();
        if metadata.page_count.is_none() {
            metadata.page_count = u32::try_from(self.image_count()).ok();
        }
        self.comic_info = Some(comicinfo::encode(&metadata));
        Ok(self)
    }

    async fn save(self) -> Result<Package> {
        let Cbz {
            pages, comic_info, ..
        } = self;
        let bytes = spawn_blocking(move || Cbz::assemble(pages, comic_info))
            .await
            .map_err(|e| Error::AsyncTaskError(e.to_string()))??;
        Ok(Package {
            bytes,
            skipped_units: Vec::new(),
        })
    }
}
