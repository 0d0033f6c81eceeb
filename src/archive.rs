//! Existing CBZ/EPUB packages: reading their metadata and rebuilding them
//! with new metadata.
//!
//! An update never edits an archive in place. The replacement is written into
//! a scratch directory next to the original, entry by entry, and renamed over
//! the original only once it is complete.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::{Captures, Regex};
use tokio::task::spawn_blocking;
use zip::result::ZipError;
use zip::{ZipArchive, ZipWriter};

use crate::codec::comicinfo::{self, COMIC_INFO_FILE};
use crate::codec::opf::{self, OPF_PATH, OpfPackage};
use crate::codec::parse_xml;
use crate::error::{Error, Result};
use crate::generator::epub::{MIMETYPE, refresh_ncx};
use crate::generator::{entry_options, modified_timestamp};
use crate::natsort::natural_sort;
use crate::path_utils::entry_path_below;
use crate::services::{CoverGenerator, ImageCrateProbe, ImageProbe};
use crate::types::{BuildOutcome, CanonicalMetadata, FileFormat, MediaKind};

const CONTAINER_PATH: &str = "META-INF/container.xml";
const NCX_MEDIA_TYPE: &str = "application/x-dtbncx+xml";
const XHTML_MEDIA_TYPE: &str = "application/xhtml+xml";

/// File stem of a cover added to a CBZ. It sorts before any page name that
/// starts with a digit or a letter.
const ADDED_COVER_STEM: &str = "00 Cover";

lazy_static! {
    static ref SVG_BLOCK: Regex = Regex::new(r"(?s)<svg\b[^>]*>.*?</svg>").unwrap();
    static ref SVG_IMAGE: Regex = Regex::new(r"<image\b[^>]*>").unwrap();
    static ref HREF_ATTR: Regex = Regex::new(r#"\b(?:xlink:)?href\s*=\s*"([^"]*)""#).unwrap();
    static ref VIEW_BOX_ATTR: Regex = Regex::new(r#"\bviewBox\s*=\s*"[^"]*""#).unwrap();
    static ref WIDTH_ATTR: Regex = Regex::new(r#"\swidth\s*=\s*"[^"]*""#).unwrap();
    static ref HEIGHT_ATTR: Regex = Regex::new(r#"\sheight\s*=\s*"[^"]*""#).unwrap();
}

/// Options for [`ArchiveCodec::update`].
#[derive(Clone)]
pub struct UpdateOptions {
    /// Rebuild even when the merged metadata equals the current metadata.
    pub force: bool,
    /// Replace the cover image with a freshly generated one.
    ///
    /// On an EPUB the cover image entry is overwritten and every full-page
    /// SVG showing it is resized to the new image. A CBZ has no cover entry
    /// apart from its pages, so the cover is added as a new `00 Cover` page in
    /// front of the first page (and `PageCount` grows by one). A cover added
    /// by an earlier update is overwritten instead.
    pub regenerate_cover: bool,
    pub cover_generator: Arc<dyn CoverGenerator>,
    pub cover_width: u32,
    /// `dcterms:modified` for EPUB updates.
    pub modified: Option<DateTime<Utc>>,
}

/// An opened CBZ or EPUB archive.
#[derive(Debug, Clone)]
pub struct ArchiveCodec {
    path: PathBuf,
    format: FileFormat,
    entries: Vec<String>,
}

fn open_zip(path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(path)?;
    Ok(ZipArchive::new(file)?)
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Option<Vec<u8>>> {
    match archive.by_name(name) {
        Ok(mut file) => {
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)?;
            Ok(Some(contents))
        }
        Err(ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_text<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Option<String>> {
    Ok(read_entry(archive, name)?.map(|bytes| {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes[..]);
        String::from_utf8_lossy(bytes).into_owned()
    }))
}

/// Joins an href onto the directory of the document that contains it.
fn resolve_href(document: &str, href: &str) -> String {
    let mut parts: Vec<&str> = document.split('/').collect();
    parts.pop();
    for part in href.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    parts.join("/")
}

fn is_hidden_entry(name: &str) -> bool {
    name.split('/').any(|part| part.starts_with('.'))
}

/// The `ComicInfo.xml` entry: at the root, or inside the archive's single
/// top-level folder.
fn comic_info_entry(entries: &[String]) -> Option<String> {
    if let Some(root) = entries
        .iter()
        .find(|e| e.eq_ignore_ascii_case(COMIC_INFO_FILE))
    {
        return Some(root.clone());
    }
    let folders: BTreeSet<&str> = entries
        .iter()
        .filter_map(|e| e.split_once('/').map(|(folder, _)| folder))
        .collect();
    if folders.len() != 1 {
        return None;
    }
    entries
        .iter()
        .find(|e| {
            e.split_once('/')
                .is_some_and(|(_, rest)| rest.eq_ignore_ascii_case(COMIC_INFO_FILE))
        })
        .cloned()
}

/// The package document named by `META-INF/container.xml`, falling back to
/// the default location.
fn opf_entry<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<String> {
    let Some(container) = read_text(archive, CONTAINER_PATH)? else {
        debug!("No container.xml; assuming {}", OPF_PATH);
        return Ok(OPF_PATH.to_string());
    };
    let full_path = parse_xml(&container)
        .ok()
        .and_then(|root| root.find("rootfile")?.attr("full-path").map(str::to_string));
    Ok(full_path.unwrap_or_else(|| OPF_PATH.to_string()))
}

/// First image page in natural order.
fn first_page(entries: &[String]) -> Option<String> {
    let mut pages: Vec<&String> = entries
        .iter()
        .filter(|e| !e.ends_with('/') && !is_hidden_entry(e))
        .filter(|e| MediaKind::of(Path::new(e.as_str())) == MediaKind::Image)
        .collect();
    natural_sort(&mut pages);
    pages.first().map(|p| p.to_string())
}

/// Where a regenerated CBZ cover goes: over a cover added earlier, or as a
/// new entry in front of the first page.
fn cbz_cover_slot(entries: &[String]) -> Option<CoverSlot> {
    let first = first_page(entries)?;
    let (folder, file_name) = match first.rsplit_once('/') {
        Some((folder, file_name)) => (format!("{}/", folder), file_name),
        None => (String::new(), first.as_str()),
    };
    let (stem, extension) = file_name.rsplit_once('.').unwrap_or((file_name, "png"));
    if stem == ADDED_COVER_STEM {
        return Some(CoverSlot::Replace(first));
    }
    Some(CoverSlot::Insert {
        name: format!("{}{}.{}", folder, ADDED_COVER_STEM, extension),
        before: first,
    })
}

/// Rewrites the `viewBox` of every SVG in `page` that shows `cover`, and the
/// `width`/`height` of its `<image>`, to the new cover size. Returns `None`
/// when the page does not show the cover.
fn resize_cover_page(page: &str, xhtml: &str, cover: &str, size: (u32, u32)) -> Option<String> {
    let (width, height) = size;
    let mut changed = false;
    let resized = SVG_BLOCK.replace_all(xhtml, |block: &Captures<'_>| {
        let block = &block[0];
        let shows_cover = SVG_IMAGE.find_iter(block).any(|tag| {
            HREF_ATTR
                .captures(tag.as_str())
                .is_some_and(|href| resolve_href(page, &href[1]) == cover)
        });
        if !shows_cover {
            return block.to_string();
        }
        changed = true;
        let block = VIEW_BOX_ATTR.replace(block, format!("viewBox=\"0 0 {} {}\"", width, height));
        SVG_IMAGE
            .replace_all(&block, |tag: &Captures<'_>| {
                let tag = WIDTH_ATTR.replace(&tag[0], format!(" width=\"{}\"", width));
                HEIGHT_ATTR
                    .replace(&tag, format!(" height=\"{}\"", height))
                    .into_owned()
            })
            .into_owned()
    });
    let resized = resized.into_owned();
    changed.then_some(resized)
}

enum CoverSlot {
    Replace(String),
    Insert { name: String, before: String },
}

/// Entries written by a cover regeneration.
#[derive(Default)]
struct CoverEdit {
    replacements: Vec<(String, Vec<u8>)>,
    /// `(new entry, entry it precedes, bytes)`.
    insertion: Option<(String, String, Vec<u8>)>,
}

impl ArchiveCodec {
    /// Opens an archive. It is an EPUB when its `mimetype` entry says so,
    /// otherwise it is treated as a CBZ.
    pub async fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::NotFound(format!("Archive {:?}", path)));
        }
        let path_buf = path.to_path_buf();
        spawn_blocking(move || -> Result<Self> {
            let mut archive = open_zip(&path_buf)?;
            let entries: Vec<String> = (0..archive.len())
                .filter_map(|i| archive.name_for_index(i).map(str::to_string))
                .collect();
            let mimetype = read_text(&mut archive, "mimetype")?;
            let format = match mimetype.as_deref().map(str::trim) {
                Some(MIMETYPE) => FileFormat::Epub,
                _ => FileFormat::Cbz,
            };
            debug!("Opened {:?} as {:?}", path_buf, format);
            Ok(ArchiveCodec {
                path: path_buf,
                format,
                entries,
            })
        })
        .await
        .map_err(|e| Error::AsyncTaskError(e.to_string()))?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    /// Entry names in archive order.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Decodes the embedded metadata. A missing or unreadable metadata entry
    /// yields an empty record.
    pub async fn read_metadata(&self) -> Result<CanonicalMetadata> {
        let path = self.path.clone();
        let format = self.format;
        let entries = self.entries.clone();
        spawn_blocking(move || -> Result<CanonicalMetadata> {
            let mut archive = open_zip(&path)?;
            let document = match format {
                FileFormat::Cbz => match comic_info_entry(&entries) {
                    Some(name) => read_text(&mut archive, &name)?,
                    None => None,
                },
                FileFormat::Epub => {
                    let name = opf_entry(&mut archive)?;
                    read_text(&mut archive, &name)?
                }
            };
            Ok(match (document, format) {
                (Some(xml), FileFormat::Cbz) => comicinfo::decode(&xml),
                (Some(xml), FileFormat::Epub) => opf::decode(&xml),
                (None, _) => {
                    debug!("{:?} carries no metadata document", path);
                    CanonicalMetadata::default()
                }
            })
        })
        .await
        .map_err(|e| Error::AsyncTaskError(e.to_string()))?
    }

    /// Unpacks every entry below `directory`, skipping dotfiles and names that
    /// would escape it. Returns the written files in archive order.
    pub async fn extract_to(&self, directory: &Path) -> Result<Vec<PathBuf>> {
        let path = self.path.clone();
        let directory = directory.to_path_buf();
        spawn_blocking(move || -> Result<Vec<PathBuf>> {
            let mut archive = open_zip(&path)?;
            let mut written = Vec::new();
            for i in 0..archive.len() {
                let mut file = archive.by_index(i)?;
                let name = file.name().to_string();
                if file.is_dir() || is_hidden_entry(&name) {
                    continue;
                }
                let Some(target) = entry_path_below(&directory, &name) else {
                    warn!("Not extracting unsafe entry {:?}", name);
                    continue;
                };
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&target)?;
                std::io::copy(&mut file, &mut out)?;
                written.push(target);
            }
            Ok(written)
        })
        .await
        .map_err(|e| Error::AsyncTaskError(e.to_string()))?
    }

    /// Merges `overrides` into the embedded metadata and rebuilds the archive.
    ///
    /// Returns `Unchanged` without touching the file when the merge changes
    /// nothing and neither `force` nor `regenerate_cover` is set. Any failure
    /// leaves the original archive as it was.
    pub async fn update(
        &self,
        overrides: &CanonicalMetadata,
        options: UpdateOptions,
    ) -> Result<BuildOutcome> {
        let current = self.read_metadata().await?;
        let merged = current.merge(overrides);
        if merged == current && !options.force && !options.regenerate_cover {
            info!("{:?}: metadata unchanged", self.path);
            return Ok(BuildOutcome::Unchanged);
        }

        let codec = self.clone();
        spawn_blocking(move || codec.rebuild(&merged, &options))
            .await
            .map_err(|e| Error::AsyncTaskError(e.to_string()))??;
        info!("{:?}: updated", self.path);
        Ok(BuildOutcome::Replaced)
    }

    fn rebuild(&self, metadata: &CanonicalMetadata, options: &UpdateOptions) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let scratch = tempfile::Builder::new()
            .prefix(".seihon-")
            .tempdir_in(parent)?;
        let mut archive = open_zip(&self.path)?;

        let mut cover = CoverEdit::default();
        if options.regenerate_cover {
            match self.regenerate_cover(&mut archive, metadata, options, scratch.path())? {
                Some(edit) => cover = edit,
                None => warn!("{:?}: cover kept as it was", self.path),
            }
        }

        // Replacement contents keyed by entry name.
        let mut replacements = cover.replacements;
        let mut insertion = cover.insertion;
        let mut append_comic_info = None;

        match self.format {
            FileFormat::Cbz => {
                let mut metadata = metadata.clone();
                if insertion.is_some() {
                    metadata.page_count = metadata.page_count.map(|n| n + 1);
                }
                let xml = comicinfo::encode(&metadata).into_bytes();
                match comic_info_entry(&self.entries) {
                    Some(name) => replacements.push((name, xml)),
                    None => append_comic_info = Some(xml),
                }
            }
            FileFormat::Epub => {
                let opf_name = opf_entry(&mut archive)?;
                let source = read_text(&mut archive, &opf_name)?.ok_or_else(|| {
                    Error::NotFound(format!("Package document {} in {:?}", opf_name, self.path))
                })?;
                let mut package = OpfPackage::parse(&source)?;
                package.metadata = metadata.clone();
                let modified = modified_timestamp(options.modified, metadata);
                replacements.push((opf_name.clone(), package.render(&modified).into_bytes()));

                let ncx_name = package
                    .manifest
                    .iter()
                    .find(|i| i.media_type == NCX_MEDIA_TYPE)
                    .map(|i| resolve_href(&opf_name, &i.href));
                if let Some(ncx_name) = ncx_name {
                    if let Some(ncx) = read_text(&mut archive, &ncx_name)? {
                        replacements.push((ncx_name, refresh_ncx(&ncx, metadata).into_bytes()));
                    }
                }
            }
        }

        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| Error::InvalidPath(self.path.clone(), "No file name".to_string()))?;
        let staged = scratch.path().join(file_name);
        let mut writer = ZipWriter::new(File::create(&staged)?);

        for i in 0..archive.len() {
            let name = archive
                .name_for_index(i)
                .map(str::to_string)
                .unwrap_or_default();
            if let Some((cover_name, _, bytes)) =
                insertion.take_if(|(_, before, _)| *before == name)
            {
                writer.start_file(cover_name, entry_options())?;
                writer.write_all(&bytes)?;
            }
            match replacements.iter().position(|(n, _)| *n == name) {
                Some(pos) => {
                    let (_, bytes) = replacements.swap_remove(pos);
                    writer.start_file(name, entry_options())?;
                    writer.write_all(&bytes)?;
                }
                None => writer.raw_copy_file(archive.by_index_raw(i)?)?,
            }
        }
        if let Some(xml) = append_comic_info {
            writer.start_file(COMIC_INFO_FILE, entry_options())?;
            writer.write_all(&xml)?;
        }
        writer.finish()?.sync_all()?;

        std::fs::rename(&staged, &self.path)?;
        debug!("Swapped {:?} into place", self.path);
        Ok(())
    }

    /// Generates a new cover. Returns `None` when the archive has no cover
    /// entry or generation fails.
    fn regenerate_cover<R: Read + Seek>(
        &self,
        archive: &mut ZipArchive<R>,
        metadata: &CanonicalMetadata,
        options: &UpdateOptions,
        scratch: &Path,
    ) -> Result<Option<CoverEdit>> {
        let mut package = None;
        let slot = match self.format {
            FileFormat::Cbz => cbz_cover_slot(&self.entries),
            FileFormat::Epub => {
                let opf_name = opf_entry(archive)?;
                let parsed = read_text(archive, &opf_name)?
                    .and_then(|xml| OpfPackage::parse(&xml).ok());
                let entry = parsed.as_ref().and_then(|p| {
                    p.cover_item()
                        .map(|item| resolve_href(&opf_name, &item.href))
                });
                package = parsed.map(|p| (opf_name, p));
                entry.map(CoverSlot::Replace)
            }
        };
        let Some(slot) = slot else {
            debug!("{:?} has no cover entry", self.path);
            return Ok(None);
        };

        let entry = match &slot {
            CoverSlot::Replace(name) => name,
            CoverSlot::Insert { name, .. } => name,
        };
        let extension = Path::new(entry)
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "png".to_string());
        let target = scratch.join(format!("cover.{}", extension));
        let title = metadata.title.as_deref().unwrap_or_default();
        if !options
            .cover_generator
            .generate(title, &metadata.authors(), &target, options.cover_width)
        {
            return Ok(None);
        }
        let bytes = std::fs::read(&target)?;

        let mut edit = CoverEdit::default();
        match slot {
            CoverSlot::Insert { name, before } => edit.insertion = Some((name, before, bytes)),
            CoverSlot::Replace(name) => {
                if let Some((opf_name, package)) = &package {
                    match ImageCrateProbe.dimensions(&target) {
                        Some(size) => {
                            edit.replacements =
                                resize_cover_pages(archive, opf_name, package, &name, size)?;
                        }
                        None => warn!("{:?}: cannot size the new cover", self.path),
                    }
                }
                edit.replacements.push((name, bytes));
            }
        }
        Ok(Some(edit))
    }
}

/// Spine documents that show `cover`, resized to the new cover size.
fn resize_cover_pages<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    opf_name: &str,
    package: &OpfPackage,
    cover: &str,
    size: (u32, u32),
) -> Result<Vec<(String, Vec<u8>)>> {
    let mut pages = Vec::new();
    for itemref in &package.spine {
        let Some(item) = package
            .manifest
            .iter()
            .find(|i| i.id == itemref.idref && i.media_type == XHTML_MEDIA_TYPE)
        else {
            continue;
        };
        let page = resolve_href(opf_name, &item.href);
        let Some(xhtml) = read_text(archive, &page)? else {
            continue;
        };
        if let Some(resized) = resize_cover_page(&page, &xhtml, cover, size) {
            debug!("Resized cover page {}", page);
            pages.push((page, resized.into_bytes()));
        }
    }
    Ok(pages)
}
