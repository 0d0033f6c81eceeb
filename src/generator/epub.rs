use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use quick_xml::escape::escape;
use regex::{Captures, Regex};
use tokio::task::spawn_blocking;
use zip::ZipWriter;

use crate::chapters::{ChapterModel, ContentUnit};
use crate::collector::is_eligible;
use crate::codec::opf::{ManifestItem, OPF_PATH, OpfPackage, SpineItem, package_identifier};
use crate::error::{Error, Result};
use crate::generator::{Generator, Package, entry_options, modified_timestamp, stored_options};
use crate::normalizer::{DEFAULT_WRAPPER_NAMES, Normalizer, XhtmlFragment, resolve_reference};
use crate::path_utils::{is_hidden_file, zip_entry_name};
use crate::services::{ImageCrateProbe, ImageProbe};
use crate::types::{CanonicalMetadata, FileFormat, MediaKind, SkippedUnit, get_file_info};

const CONTAINER_XML: &str = include_str!("../../templates/container.xml");
const CHAPTER_TEMPLATE: &str = include_str!("../../templates/chapter.xhtml");
const NAV_TEMPLATE: &str = include_str!("../../templates/nav.xhtml");
const STYLESHEET: &str = include_str!("../../templates/epubstyle.css");

/// Exact content of the first entry.
pub const MIMETYPE: &str = "application/epub+zip";
/// Path of the NCX inside the archive.
pub const NCX_PATH: &str = "EPUB/toc.ncx";

const NAV_ID: &str = "nav";
const NCX_ID: &str = "ncx";
const STYLE_ID: &str = "style";

lazy_static! {
    static ref NCX_DOC_TITLE: Regex =
        Regex::new(r"(?s)(<docTitle>\s*<text>).*?(</text>)").unwrap();
    static ref NCX_UID: Regex =
        Regex::new(r#"(<meta\s+name="dtb:uid"\s+content=")[^"]*(")"#).unwrap();
}

/// A generator for EPUB 3 packages (with an NCX for older readers).
///
/// Chapters come from a [`ChapterModel`]; when none is set, every eligible
/// top-level source file becomes its own chapter. Every file passed to
/// [`add_page`](Generator::add_page) is also mirrored verbatim under
/// `EPUB/original/`.
pub struct EPub {
    source_root: PathBuf,
    chapters: Option<ChapterModel>,
    originals: Vec<(String, PathBuf)>,
    metadata: CanonicalMetadata,
    probe: Arc<dyn ImageProbe>,
    wrapper_names: Vec<String>,
    modified: Option<DateTime<Utc>>,
}

impl EPub {
    pub fn set_chapters(&mut self, chapters: ChapterModel) -> &mut Self {
        self.chapters = Some(chapters);
        self
    }

    pub fn set_probe(&mut self, probe: Arc<dyn ImageProbe>) -> &mut Self {
        self.probe = probe;
        self
    }

    pub fn set_wrapper_names(&mut self, names: Vec<String>) -> &mut Self {
        self.wrapper_names = names;
        self
    }

    /// Fixes `dcterms:modified`. Without it the metadata date is used.
    pub fn set_modified(&mut self, modified: Option<DateTime<Utc>>) -> &mut Self {
        self.modified = modified;
        self
    }

    fn default_chapters(&self) -> ChapterModel {
        let files = self
            .originals
            .iter()
            .filter(|(name, path)| {
                !name.contains('/') && is_eligible(path, FileFormat::Epub)
            })
            .map(|(_, path)| path.clone())
            .collect();
        ChapterModel::from_files(files)
    }
}

#[async_trait]
impl Generator for EPub {
    fn new(source_root: &Path) -> Result<Self> {
        if !source_root.is_dir() {
            return Err(Error::InvalidPath(
                source_root.to_path_buf(),
                "Source root is not a directory".to_string(),
            ));
        }
        Ok(EPub {
            source_root: source_root.to_path_buf(),
            chapters: None,
            originals: Vec::new(),
            metadata: CanonicalMetadata::default(),
            probe: Arc::new(ImageCrateProbe),
            wrapper_names: DEFAULT_WRAPPER_NAMES.iter().map(|s| s.to_string()).collect(),
            modified: None,
        })
    }

    async fn add_page(&mut self, path: &Path) -> Result<&mut Self> {
        if is_hidden_file(path) {
            debug!("Not mirroring dotfile {:?}", path);
            return Ok(self);
        }
        let entry_name = zip_entry_name(&self.source_root, path)?;
        if self.originals.iter().any(|(name, _)| *name == entry_name) {
            return Err(Error::Unsupported(format!("Duplicate entry {}", entry_name)));
        }
        self.originals.push((entry_name, path.to_path_buf()));
        Ok(self)
    }

    async fn set_metadata(&mut self, metadata: &CanonicalMetadata) -> Result<&mut Self> {
        self.metadata = metadata.clone();
        Ok(self)
    }

    async fn save(self) -> Result<Package> {
        let chapters = match &self.chapters {
            Some(chapters) => chapters.clone(),
            None => self.default_chapters(),
        };
        let modified = modified_timestamp(self.modified, &self.metadata);
        let job = Assembly {
            chapters,
            originals: self.originals,
            metadata: self.metadata,
            probe: self.probe,
            wrapper_names: self.wrapper_names,
            modified,
        };
        spawn_blocking(move || job.run())
            .await
            .map_err(|e| Error::AsyncTaskError(e.to_string()))?
    }
}

/// A chapter that survived normalization.
struct Chapter {
    id: String,
    title: String,
    include: bool,
    body: XhtmlFragment,
}

impl Chapter {
    fn href(&self) -> String {
        format!("content/{}.xhtml", self.id)
    }
}

struct ImageEntry {
    id: String,
    source: PathBuf,
    extension: &'static str,
    media_type: &'static str,
}

impl ImageEntry {
    fn href(&self) -> String {
        format!("images/{}.{}", self.id, self.extension)
    }
}

/// Everything `save` hands to the blocking thread.
struct Assembly {
    chapters: ChapterModel,
    originals: Vec<(String, PathBuf)>,
    metadata: CanonicalMetadata,
    probe: Arc<dyn ImageProbe>,
    wrapper_names: Vec<String>,
    modified: String,
}

impl Assembly {
    fn run(self) -> Result<Package> {
        let normalizer =
            Normalizer::new(self.probe.as_ref()).with_wrapper_names(self.wrapper_names.clone());
        let mut images: Vec<ImageEntry> = Vec::new();
        let mut chapters: Vec<Chapter> = Vec::new();
        let mut skipped_units = Vec::new();

        for unit in self.chapters.units() {
            match render_unit(&normalizer, unit, &mut images) {
                Ok(body) => chapters.push(Chapter {
                    id: unit.id.clone(),
                    title: unit.title.clone(),
                    include: unit.include,
                    body,
                }),
                Err(e) => {
                    warn!("Skipping chapter {} ({}): {}", unit.id, unit.title, e);
                    skipped_units.push(SkippedUnit {
                        id: unit.id.clone(),
                        title: unit.title.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let cover_id = self.cover_image(&chapters, &images);
        let package = self.package(&chapters, &images, cover_id);
        let language = self.metadata.language.as_deref().unwrap_or("en");

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = entry_options();

        zip.start_file("mimetype", stored_options())?;
        zip.write_all(MIMETYPE.as_bytes())?;

        zip.start_file("META-INF/container.xml", options)?;
        zip.write_all(CONTAINER_XML.as_bytes())?;

        zip.start_file(OPF_PATH, options)?;
        zip.write_all(package.render(&self.modified).as_bytes())?;

        zip.start_file("EPUB/nav.xhtml", options)?;
        zip.write_all(render_nav(&chapters, &self.metadata, language).as_bytes())?;

        zip.start_file(NCX_PATH, options)?;
        zip.write_all(render_ncx(&chapters, &self.metadata).as_bytes())?;

        let lang = escape(language);
        for chapter in &chapters {
            zip.start_file(format!("EPUB/{}", chapter.href()), options)?;
            let title = escape(chapter.title.as_str());
            let body = chapter.body.to_xhtml();
            let page = fill(
                CHAPTER_TEMPLATE,
                &[("lang", lang.as_ref()), ("title", title.as_ref()), ("body", body.as_str())],
            );
            zip.write_all(page.as_bytes())?;
        }

        for image in &images {
            let data = std::fs::read(&image.source)?;
            zip.start_file(format!("EPUB/{}", image.href()), options)?;
            zip.write_all(&data)?;
        }

        zip.start_file("EPUB/style/epubstyle.css", options)?;
        zip.write_all(STYLESHEET.as_bytes())?;

        for (entry_name, path) in &self.originals {
            let data = std::fs::read(path)?;
            zip.start_file(format!("EPUB/original/{}", entry_name), options)?;
            zip.write_all(&data)?;
        }

        info!(
            "Assembled EPUB with {} chapters, {} images, {} skipped",
            chapters.len(),
            images.len(),
            skipped_units.len()
        );
        Ok(Package {
            bytes: zip.finish()?.into_inner(),
            skipped_units,
        })
    }

    /// The cover is the image shown by the first unit, when that unit is the
    /// generated cover or a bare image file.
    fn cover_image(&self, chapters: &[Chapter], images: &[ImageEntry]) -> Option<String> {
        let first = self.chapters.units().first()?;
        let rendered = chapters.first().is_some_and(|c| c.id == first.id);
        let [file] = first.source_files.as_slice() else {
            return None;
        };
        let is_image_unit = first.is_cover || MediaKind::of(file) == MediaKind::Image;
        if !rendered || !is_image_unit {
            return None;
        }
        let source = image_key(file);
        images
            .iter()
            .find(|i| i.source == source)
            .map(|i| i.id.clone())
    }

    fn package(
        &self,
        chapters: &[Chapter],
        images: &[ImageEntry],
        cover_id: Option<String>,
    ) -> OpfPackage {
        let mut manifest: Vec<ManifestItem> = chapters
            .iter()
            .map(|c| {
                ManifestItem::new(&c.id, &c.href(), "application/xhtml+xml")
                    .with_properties(c.body.has_svg().then_some("svg"))
            })
            .collect();
        manifest.extend(images.iter().map(|i| {
            let is_cover = cover_id.as_deref() == Some(i.id.as_str());
            ManifestItem::new(&i.id, &i.href(), i.media_type)
                .with_properties(is_cover.then_some("cover-image"))
        }));
        manifest.push(ManifestItem::new(STYLE_ID, "style/epubstyle.css", "text/css"));
        manifest.push(
            ManifestItem::new(NAV_ID, "nav.xhtml", "application/xhtml+xml")
                .with_properties(Some("nav")),
        );
        manifest.push(ManifestItem::new(
            NCX_ID,
            "toc.ncx",
            "application/x-dtbncx+xml",
        ));

        let mut spine: Vec<SpineItem> = chapters
            .iter()
            .filter(|c| c.include)
            .map(|c| SpineItem {
                idref: c.id.clone(),
                linear: true,
            })
            .collect();
        if spine.is_empty() {
            debug!("No included chapters; the navigation document carries the spine");
            spine.push(SpineItem {
                idref: NAV_ID.to_string(),
                linear: true,
            });
        }

        OpfPackage {
            metadata: self.metadata.clone(),
            cover_id,
            modified: Some(self.modified.clone()),
            manifest,
            spine,
            toc: Some(NCX_ID.to_string()),
            ..Default::default()
        }
    }
}

fn image_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Normalizes every file of a unit, registering referenced images as it goes.
fn render_unit(
    normalizer: &Normalizer<'_>,
    unit: &ContentUnit,
    images: &mut Vec<ImageEntry>,
) -> Result<XhtmlFragment> {
    let mut body = XhtmlFragment::default();
    for path in &unit.source_files {
        let mut fragment = normalizer.normalize_file(path, &unit.title)?;
        let base_dir = path.parent();
        fragment.rewrite_images(|reference| {
            let resolved = resolve_reference(base_dir, reference).filter(|p| p.is_file());
            let Some(resolved) = resolved else {
                warn!("Unresolved image reference {:?} in {:?}", reference, path);
                return None;
            };
            register_image(images, &resolved).map(|href| format!("../{}", href))
        });
        body.append(fragment);
    }
    Ok(body)
}

/// Returns the href of the packed copy, adding the image on first use.
fn register_image(images: &mut Vec<ImageEntry>, path: &Path) -> Option<String> {
    let key = image_key(path);
    if let Some(existing) = images.iter().find(|i| i.source == key) {
        return Some(existing.href());
    }
    let (extension, media_type) = match get_file_info(path) {
        Ok(info) => info,
        Err(e) => {
            warn!("Not packing {:?}: {}", path, e);
            return None;
        }
    };
    let entry = ImageEntry {
        id: format!("image{}", images.len()),
        source: key,
        extension,
        media_type,
    };
    let href = entry.href();
    images.push(entry);
    Some(href)
}

/// Replaces `%key%` placeholders in one pass, so substituted values are
/// never scanned again.
fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let hit = values
            .iter()
            .find(|(key, _)| after.starts_with(key) && after[key.len()..].starts_with('%'));
        match hit {
            Some((key, value)) => {
                out.push_str(value);
                rest = &after[key.len() + 1..];
            }
            None => {
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn book_title(metadata: &CanonicalMetadata) -> &str {
    metadata.title.as_deref().unwrap_or_default()
}

fn render_nav(chapters: &[Chapter], metadata: &CanonicalMetadata, language: &str) -> String {
    let items: Vec<String> = chapters
        .iter()
        .filter(|c| c.include)
        .map(|c| {
            format!(
                "      <li><a href=\"{}\">{}</a></li>",
                c.href(),
                escape(c.title.as_str())
            )
        })
        .collect();
    let lang = escape(language);
    let title = escape(book_title(metadata));
    let items = items.join("\n");
    fill(
        NAV_TEMPLATE,
        &[("lang", lang.as_ref()), ("title", title.as_ref()), ("items", items.as_str())],
    )
}

fn render_ncx(chapters: &[Chapter], metadata: &CanonicalMetadata) -> String {
    let mut xml = format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\">\n\
         \x20 <head>\n\
         \x20   <meta name=\"dtb:uid\" content=\"{}\"/>\n\
         \x20   <meta name=\"dtb:depth\" content=\"1\"/>\n\
         \x20   <meta name=\"dtb:totalPageCount\" content=\"0\"/>\n\
         \x20   <meta name=\"dtb:maxPageNumber\" content=\"0\"/>\n\
         \x20 </head>\n\
         \x20 <docTitle>\n\
         \x20   <text>{}</text>\n\
         \x20 </docTitle>\n\
         \x20 <navMap>\n",
        escape(package_identifier(metadata).as_str()),
        escape(book_title(metadata))
    );
    for (i, chapter) in chapters.iter().filter(|c| c.include).enumerate() {
        xml.push_str(&format!(
            "    <navPoint id=\"navPoint-{0}\" playOrder=\"{0}\">\n\
             \x20     <navLabel>\n\
             \x20       <text>{1}</text>\n\
             \x20     </navLabel>\n\
             \x20     <content src=\"{2}\"/>\n\
             \x20   </navPoint>\n",
            i + 1,
            escape(chapter.title.as_str()),
            chapter.href()
        ));
    }
    xml.push_str("  </navMap>\n</ncx>\n");
    xml
}

/// Rewrites the `docTitle` and `dtb:uid` of an existing NCX for new metadata.
pub fn refresh_ncx(ncx: &str, metadata: &CanonicalMetadata) -> String {
    let title = escape(book_title(metadata)).into_owned();
    let uid = escape(package_identifier(metadata).as_str()).into_owned();
    let ncx = NCX_DOC_TITLE.replace(ncx, |caps: &Captures| {
        format!("{}{}{}", &caps[1], title, &caps[2])
    });
    NCX_UID
        .replace(&ncx, |caps: &Captures| format!("{}{}{}", &caps[1], uid, &caps[2]))
        .into_owned()
}
