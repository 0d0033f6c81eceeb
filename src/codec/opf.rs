//! OPF package document encoding and decoding.
//!
//! The package is rendered from an [`OpfPackage`]: canonical metadata as
//! Dublin Core elements plus EPUB 3 refinement `<meta>` tags, followed by the
//! manifest and spine. Parsing reads the same structure back, so an update can
//! swap the metadata block while re-emitting the manifest and spine of an
//! existing book. Parts of a foreign package the codec does not model
//! (unknown metadata children and their refinements, `<guide>`, the `dir` and
//! `xml:lang` of `<package>`, extra `prefix` declarations and the spine's
//! `page-progression-direction`) are carried through unchanged.
//!
//! Metadata mapping:
//!
//! | Field | OPF |
//! |-------|-----|
//! | writers / artists / cover artists | `dc:creator` refined with `marc:relators` role `aut` / `ill` / `cov` |
//! | series, number, total | `belongs-to-collection` refined with `collection-type`, `group-position`, `dcterms:extent` |
//! | age rating | `schema:contentRating` |
//! | score | leading `★` `dc:subject` and `calibre:rating` (twice the score) |
//! | url | `dc:source` |
//! | page count | `schema:numberOfPages` |

use log::warn;
use quick_xml::escape::escape;
use uuid::Uuid;

use crate::codec::{XmlElement, parse_xml, series_pair, split_star_tag, star_tag};
use crate::error::{Error, Result};
use crate::resolver::parse_date;
use crate::types::{AgeRating, CanonicalMetadata};

/// Path of the package document inside an EPUB built by this crate.
pub const OPF_PATH: &str = "EPUB/content.opf";

/// Id of the `dc:identifier` named by `unique-identifier`.
pub const PACKAGE_ID: &str = "pub-id";

const SERIES_ID: &str = "series";

const SCHEMA_PREFIX: &str = "schema: http://schema.org/";

/// `<package>` attributes carried through an update.
const PACKAGE_ATTRS: &[&str] = &["dir", "xml:lang"];

/// Dublin Core elements written by [`encode_metadata`].
const MODELLED_ELEMENTS: &[&str] = &[
    "title",
    "language",
    "creator",
    "description",
    "publisher",
    "date",
    "source",
    "subject",
];

/// `<meta property>` values written by [`encode_metadata`].
const MODELLED_PROPERTIES: &[&str] = &[
    "belongs-to-collection",
    "schema:contentRating",
    "schema:numberOfPages",
    "dcterms:modified",
];

/// `<meta name>` values written by [`encode_metadata`] or folded into the record.
const MODELLED_NAMES: &[&str] = &[
    "cover",
    "calibre:rating",
    "calibre:series",
    "calibre:series_index",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestItem {
    pub id: String,
    /// Relative to the package document.
    pub href: String,
    pub media_type: String,
    pub properties: Option<String>,
}

impl ManifestItem {
    pub fn new(id: &str, href: &str, media_type: &str) -> Self {
        Self {
            id: id.to_string(),
            href: href.to_string(),
            media_type: media_type.to_string(),
            properties: None,
        }
    }

    pub fn with_properties(mut self, properties: Option<&str>) -> Self {
        self.properties = properties.map(str::to_string);
        self
    }

    pub fn has_property(&self, property: &str) -> bool {
        self.properties
            .as_deref()
            .is_some_and(|p| p.split_whitespace().any(|x| x == property))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpineItem {
    pub idref: String,
    pub linear: bool,
}

/// A package document: metadata, manifest and spine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpfPackage {
    pub metadata: CanonicalMetadata,
    /// Manifest id named by `<meta name="cover">`.
    pub cover_id: Option<String>,
    /// `dcterms:modified` as found when parsing.
    pub modified: Option<String>,
    pub manifest: Vec<ManifestItem>,
    pub spine: Vec<SpineItem>,
    /// Manifest id of the NCX, the spine's `toc` attribute.
    pub toc: Option<String>,
    /// `<metadata>` children the codec does not model, in document order.
    pub foreign_metadata: Vec<XmlElement>,
    /// `dir` and `xml:lang` of `<package>`.
    pub package_attrs: Vec<(String, String)>,
    /// `prefix` declarations other than `schema:`.
    pub extra_prefixes: Option<String>,
    pub page_progression: Option<String>,
    pub guide: Option<XmlElement>,
}

impl OpfPackage {
    /// The manifest item holding the cover image: the `cover-image` property,
    /// else the item named by `<meta name="cover">`.
    pub fn cover_item(&self) -> Option<&ManifestItem> {
        self.manifest
            .iter()
            .find(|i| i.has_property("cover-image"))
            .or_else(|| {
                let id = self.cover_id.as_deref()?;
                self.manifest.iter().find(|i| i.id == id)
            })
    }

    /// Renders the complete package document.
    pub fn render(&self, modified: &str) -> String {
        let prefix = match &self.extra_prefixes {
            Some(extra) => format!("{} {}", SCHEMA_PREFIX, extra),
            None => SCHEMA_PREFIX.to_string(),
        };
        let mut xml = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
             <package xmlns=\"http://www.idpf.org/2007/opf\" version=\"3.0\" \
             unique-identifier=\"{}\" prefix=\"{}\"",
            PACKAGE_ID,
            escape(prefix.as_str())
        );
        for (key, value) in &self.package_attrs {
            xml.push_str(&format!(" {}=\"{}\"", key, escape(value.as_str())));
        }
        xml.push_str(">\n");
        xml.push_str(&metadata_block(
            &self.metadata,
            modified,
            self.cover_id.as_deref(),
            &self.foreign_metadata,
        ));

        xml.push_str("  <manifest>\n");
        for item in &self.manifest {
            xml.push_str(&format!(
                "    <item id=\"{}\" href=\"{}\" media-type=\"{}\"",
                escape(item.id.as_str()),
                escape(item.href.as_str()),
                escape(item.media_type.as_str())
            ));
            if let Some(properties) = &item.properties {
                xml.push_str(&format!(" properties=\"{}\"", escape(properties.as_str())));
            }
            xml.push_str("/>\n");
        }
        xml.push_str("  </manifest>\n");

        xml.push_str("  <spine");
        if let Some(toc) = &self.toc {
            xml.push_str(&format!(" toc=\"{}\"", escape(toc.as_str())));
        }
        if let Some(direction) = &self.page_progression {
            xml.push_str(&format!(
                " page-progression-direction=\"{}\"",
                escape(direction.as_str())
            ));
        }
        xml.push_str(">\n");
        for item in &self.spine {
            xml.push_str(&format!("    <itemref idref=\"{}\"", escape(item.idref.as_str())));
            if !item.linear {
                xml.push_str(" linear=\"no\"");
            }
            xml.push_str("/>\n");
        }
        xml.push_str("  </spine>\n");
        if let Some(guide) = &self.guide {
            xml.push_str(&format!("  {}\n", guide.to_xml()));
        }
        xml.push_str("</package>\n");
        xml
    }

    /// Parses a package document. Unlike [`decode`], structural problems are errors.
    pub fn parse(xml: &str) -> Result<OpfPackage> {
        let root = parse_xml(xml)?;
        if root.local_name() != "package" {
            return Err(Error::MalformedInput(format!(
                "expected <package>, found <{}>",
                root.name
            )));
        }
        let metadata_el = root.child("metadata");

        let manifest = root
            .child("manifest")
            .map(|m| {
                m.children_named("item")
                    .filter_map(|item| {
                        Some(ManifestItem {
                            id: item.attr("id")?.to_string(),
                            href: item.attr("href")?.to_string(),
                            media_type: item.attr("media-type").unwrap_or_default().to_string(),
                            properties: item.attr("properties").map(str::to_string),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let spine_el = root.child("spine");
        let spine = spine_el
            .map(|s| {
                s.children_named("itemref")
                    .filter_map(|item| {
                        Some(SpineItem {
                            idref: item.attr("idref")?.to_string(),
                            linear: item.attr("linear") != Some("no"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let extra_prefixes = root.attr("prefix").and_then(|declared| {
            let tokens: Vec<&str> = declared.split_whitespace().collect();
            let kept: Vec<String> = tokens
                .chunks(2)
                .filter(|pair| pair[0] != "schema:")
                .map(|pair| pair.join(" "))
                .collect();
            (!kept.is_empty()).then(|| kept.join(" "))
        });

        Ok(OpfPackage {
            metadata: metadata_el.map(decode_metadata).unwrap_or_default(),
            cover_id: metadata_el.and_then(named_meta_fn("cover")),
            modified: metadata_el.and_then(|m| property_meta(m, "dcterms:modified")),
            manifest,
            spine,
            toc: spine_el.and_then(|s| s.attr("toc")).map(str::to_string),
            foreign_metadata: metadata_el.map(foreign_metadata).unwrap_or_default(),
            package_attrs: root
                .attrs
                .iter()
                .filter(|(k, _)| PACKAGE_ATTRS.contains(&k.as_str()))
                .cloned()
                .collect(),
            extra_prefixes,
            page_progression: spine_el
                .and_then(|s| s.attr("page-progression-direction"))
                .map(str::to_string),
            guide: root.child("guide").cloned(),
        })
    }
}

fn element(name: &str, value: &str) -> String {
    format!("    <{0}>{1}</{0}>\n", name, escape(value))
}

fn property(name: &str, value: &str) -> String {
    format!("    <meta property=\"{}\">{}</meta>\n", name, escape(value))
}

fn refinement(target: &str, name: &str, value: &str, scheme: Option<&str>) -> String {
    let scheme = scheme
        .map(|s| format!(" scheme=\"{}\"", s))
        .unwrap_or_default();
    format!(
        "    <meta refines=\"#{}\" property=\"{}\"{}>{}</meta>\n",
        target,
        name,
        scheme,
        escape(value)
    )
}

/// Identifier generated for a record without an id: a name-based UUID over
/// title and authors, so the same book always gets the same identifier.
pub fn generated_identifier(metadata: &CanonicalMetadata) -> String {
    let key = format!(
        "{}\u{1f}{}",
        metadata.title.as_deref().unwrap_or_default(),
        metadata.authors().join("\u{1f}")
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
        .urn()
        .to_string()
}

/// The package identifier: the record's id, or [`generated_identifier`].
pub fn package_identifier(metadata: &CanonicalMetadata) -> String {
    match &metadata.id {
        Some(id) => id.clone(),
        None => generated_identifier(&metadata.clone().normalized()),
    }
}

/// Encodes the `<metadata>` block of a package document.
pub fn encode_metadata(
    metadata: &CanonicalMetadata,
    modified: &str,
    cover_id: Option<&str>,
) -> String {
    metadata_block(metadata, modified, cover_id, &[])
}

fn metadata_block(
    metadata: &CanonicalMetadata,
    modified: &str,
    cover_id: Option<&str>,
    foreign: &[XmlElement],
) -> String {
    let mut xml = String::from(
        "  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\" \
         xmlns:opf=\"http://www.idpf.org/2007/opf\">\n",
    );

    let identifier = package_identifier(metadata);
    xml.push_str(&format!(
        "    <dc:identifier id=\"{}\">{}</dc:identifier>\n",
        PACKAGE_ID,
        escape(identifier.as_str())
    ));
    xml.push_str(&element(
        "dc:title",
        metadata.title.as_deref().unwrap_or_default(),
    ));
    xml.push_str(&element(
        "dc:language",
        metadata.language.as_deref().unwrap_or("en"),
    ));

    let roles = [
        (&metadata.writers, "aut"),
        (&metadata.artists, "ill"),
        (&metadata.cover_artists, "cov"),
    ];
    let mut creator_index = 0;
    for (names, role) in roles {
        for name in names.iter().flatten() {
            let id = format!("creator{}", creator_index);
            creator_index += 1;
            xml.push_str(&format!(
                "    <dc:creator id=\"{}\">{}</dc:creator>\n",
                id,
                escape(name.as_str())
            ));
            xml.push_str(&refinement(&id, "role", role, Some("marc:relators")));
        }
    }

    let simple = [
        ("dc:description", &metadata.description),
        ("dc:publisher", &metadata.publisher),
        ("dc:date", &metadata.date),
        ("dc:source", &metadata.url),
    ];
    for (name, value) in simple {
        if let Some(value) = value {
            xml.push_str(&element(name, value));
        }
    }

    for subject in star_tag(metadata.score)
        .iter()
        .chain(metadata.tags.iter().flatten())
    {
        xml.push_str(&element("dc:subject", subject));
    }

    let (number, total) = series_pair(
        metadata.series_number.as_deref(),
        metadata.series_total.as_deref(),
    );
    if metadata.series.is_some() || number.is_some() {
        xml.push_str(&format!(
            "    <meta property=\"belongs-to-collection\" id=\"{}\">{}</meta>\n",
            SERIES_ID,
            escape(metadata.series.as_deref().unwrap_or_default())
        ));
        xml.push_str(&refinement(SERIES_ID, "collection-type", "series", None));
        if let Some(number) = &number {
            xml.push_str(&refinement(SERIES_ID, "group-position", number, None));
        }
        if let Some(total) = &total {
            xml.push_str(&refinement(SERIES_ID, "dcterms:extent", total, None));
        }
    }

    if metadata.age_rating != AgeRating::Unknown {
        xml.push_str(&property(
            "schema:contentRating",
            metadata.age_rating.as_str(),
        ));
    }
    if let Some(pages) = metadata.page_count {
        xml.push_str(&property("schema:numberOfPages", &pages.to_string()));
    }
    if let Some(score) = metadata.score {
        xml.push_str(&format!(
            "    <meta name=\"calibre:rating\" content=\"{}\"/>\n",
            u32::from(score.min(5)) * 2
        ));
    }
    if let Some(cover_id) = cover_id {
        xml.push_str(&format!(
            "    <meta name=\"cover\" content=\"{}\"/>\n",
            escape(cover_id)
        ));
    }
    xml.push_str(&property("dcterms:modified", modified));
    for element in foreign {
        xml.push_str(&format!("    {}\n", element.to_xml()));
    }
    xml.push_str("  </metadata>\n");
    xml
}

/// Metadata children outside the modelled vocabulary, plus the refinements
/// that point at them. Only the first `dc:identifier` is modelled.
fn foreign_metadata(metadata: &XmlElement) -> Vec<XmlElement> {
    let mut seen_identifier = false;
    let unmodelled: Vec<&XmlElement> = metadata
        .children
        .iter()
        .filter(|child| match child.local_name() {
            "identifier" => std::mem::replace(&mut seen_identifier, true),
            "meta" => {
                child.attr("refines").is_none()
                    && !child
                        .attr("property")
                        .is_some_and(|p| MODELLED_PROPERTIES.contains(&p))
                    && !child
                        .attr("name")
                        .is_some_and(|n| MODELLED_NAMES.contains(&n))
            }
            name => !MODELLED_ELEMENTS.contains(&name),
        })
        .collect();
    let targets: Vec<String> = unmodelled
        .iter()
        .filter_map(|e| e.attr("id"))
        .map(|id| format!("#{}", id))
        .collect();

    metadata
        .children
        .iter()
        .filter(|child| {
            unmodelled.iter().any(|u| std::ptr::eq(*u, *child))
                || (child.local_name() == "meta"
                    && child
                        .attr("refines")
                        .is_some_and(|r| targets.iter().any(|t| t == r)))
        })
        .cloned()
        .collect()
}

fn property_meta(metadata: &XmlElement, name: &str) -> Option<String> {
    metadata
        .children_named("meta")
        .find(|m| m.attr("property") == Some(name) && m.attr("refines").is_none())
        .and_then(XmlElement::value)
        .map(str::to_string)
}

fn named_meta_fn(name: &str) -> impl Fn(&XmlElement) -> Option<String> + '_ {
    move |metadata: &XmlElement| {
        metadata
            .children_named("meta")
            .find(|m| m.attr("name") == Some(name))
            .and_then(|m| m.attr("content"))
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
    }
}

fn refinement_of(metadata: &XmlElement, id: &str, name: &str) -> Option<String> {
    let target = format!("#{}", id);
    metadata
        .children_named("meta")
        .find(|m| m.attr("refines") == Some(target.as_str()) && m.attr("property") == Some(name))
        .and_then(XmlElement::value)
        .map(str::to_string)
}

fn decode_metadata(metadata: &XmlElement) -> CanonicalMetadata {
    let first = |name: &str| {
        metadata
            .children_named(name)
            .find_map(XmlElement::value)
            .map(str::to_string)
    };

    let mut writers = Vec::new();
    let mut artists = Vec::new();
    let mut cover_artists = Vec::new();
    for creator in metadata.children_named("creator") {
        let Some(name) = creator.value() else {
            continue;
        };
        let role = creator
            .attr("id")
            .and_then(|id| refinement_of(metadata, id, "role"))
            .or_else(|| creator.attr("opf:role").map(str::to_string));
        match role.as_deref() {
            Some("ill") | Some("art") => artists.push(name.to_string()),
            Some("cov") => cover_artists.push(name.to_string()),
            _ => writers.push(name.to_string()),
        }
    }

    let subjects: Vec<String> = metadata
        .children_named("subject")
        .filter_map(XmlElement::value)
        .map(str::to_string)
        .collect();
    let (stars, tags) = split_star_tag(subjects);

    let series_el = metadata
        .children_named("meta")
        .find(|m| m.attr("property") == Some("belongs-to-collection"));
    let series_id = series_el.and_then(|s| s.attr("id"));
    let named = |name: &str| named_meta_fn(name)(metadata);

    let series = series_el
        .and_then(XmlElement::value)
        .map(str::to_string)
        .or_else(|| named("calibre:series"));
    let series_number = series_id
        .and_then(|id| refinement_of(metadata, id, "group-position"))
        .or_else(|| named("calibre:series_index"));
    let series_total = series_id.and_then(|id| refinement_of(metadata, id, "dcterms:extent"));

    let score = named("calibre:rating")
        .and_then(|r| r.parse::<f64>().ok())
        .map(|r| r / 2.0)
        .filter(|s| (0.0..=5.0).contains(s))
        .map(|s| s.round() as u8)
        .or(stars);

    let identifier = metadata
        .children_named("identifier")
        .find_map(XmlElement::value)
        .map(str::to_string);

    let mut record = CanonicalMetadata {
        title: first("title"),
        series,
        series_number,
        series_total,
        description: first("description"),
        date: first("date").and_then(|d| parse_date(&d).or_else(|| d.get(..10).and_then(parse_date))),
        writers: Some(writers),
        artists: Some(artists),
        cover_artists: Some(cover_artists),
        publisher: first("publisher"),
        tags: Some(tags),
        url: first("source"),
        age_rating: property_meta(metadata, "schema:contentRating")
            .and_then(|r| AgeRating::parse(&r))
            .unwrap_or_default(),
        score,
        page_count: property_meta(metadata, "schema:numberOfPages").and_then(|p| p.parse().ok()),
        id: identifier,
        language: first("language"),
    }
    .normalized();
    // An identifier derived from this very title and author list was
    // generated, not assigned.
    if record.id.is_some() && record.id == Some(generated_identifier(&record)) {
        record.id = None;
    }
    record
}

/// Decodes the metadata of a package document. Parse failures yield an
/// all-null record.
pub fn decode(xml: &str) -> CanonicalMetadata {
    match OpfPackage::parse(xml) {
        Ok(package) => package.metadata,
        Err(e) => {
            warn!("Unreadable package document: {}", e);
            CanonicalMetadata::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CanonicalMetadata {
        CanonicalMetadata {
            title: Some("Title <1>".to_string()),
            series: Some("Saga".to_string()),
            series_number: Some("3".to_string()),
            series_total: Some("10".to_string()),
            description: Some("A & B".to_string()),
            date: Some("2020-02-29".to_string()),
            writers: Some(vec!["Writer".to_string()]),
            artists: Some(vec!["Writer".to_string(), "Painter".to_string()]),
            cover_artists: Some(vec!["Cover Person".to_string()]),
            publisher: Some("Archive of Our Own".to_string()),
            tags: Some(vec!["Fluff".to_string(), "Angst".to_string()]),
            url: Some("https://archiveofourown.org/works/1".to_string()),
            age_rating: AgeRating::Mature17Plus,
            score: Some(5),
            page_count: Some(300),
            id: Some("98765".to_string()),
            language: Some("de".to_string()),
        }
    }

    fn package(metadata: CanonicalMetadata) -> OpfPackage {
        OpfPackage {
            metadata,
            cover_id: Some("image0".to_string()),
            modified: None,
            manifest: vec![
                ManifestItem::new("item0", "content/item0.xhtml", "application/xhtml+xml"),
                ManifestItem::new("image0", "images/image0.png", "image/png")
                    .with_properties(Some("cover-image")),
                ManifestItem::new("ncx", "toc.ncx", "application/x-dtbncx+xml"),
            ],
            spine: vec![SpineItem {
                idref: "item0".to_string(),
                linear: true,
            }],
            toc: Some("ncx".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn package_round_trips() {
        let original = package(sample());
        let xml = original.render("2020-02-29T00:00:00Z");
        let parsed = OpfPackage::parse(&xml).unwrap();
        assert_eq!(parsed.metadata, original.metadata);
        assert_eq!(parsed.manifest, original.manifest);
        assert_eq!(parsed.spine, original.spine);
        assert_eq!(parsed.toc.as_deref(), Some("ncx"));
        assert_eq!(parsed.cover_id.as_deref(), Some("image0"));
        assert_eq!(parsed.modified.as_deref(), Some("2020-02-29T00:00:00Z"));
        assert_eq!(parsed.cover_item().map(|i| i.id.as_str()), Some("image0"));
    }

    #[test]
    fn refinements_and_stars_are_emitted() {
        let xml = encode_metadata(&sample(), "1970-01-01T00:00:00Z", None);
        assert!(xml.contains("<meta refines=\"#creator0\" property=\"role\" scheme=\"marc:relators\">aut</meta>"));
        assert!(xml.contains("<meta refines=\"#series\" property=\"group-position\">3</meta>"));
        assert!(xml.contains("<meta refines=\"#series\" property=\"dcterms:extent\">10</meta>"));
        assert!(xml.contains("<meta property=\"schema:contentRating\">Mature 17+</meta>"));
        assert!(xml.contains("<meta name=\"calibre:rating\" content=\"10\"/>"));
        let first_subject = xml.find("<dc:subject>").unwrap();
        assert!(xml[first_subject..].starts_with("<dc:subject>★★★★★</dc:subject>"));
    }

    #[test]
    fn generated_identifier_is_not_read_back() {
        let meta = CanonicalMetadata::with_title("No Id");
        let xml = package(meta.clone()).render("1970-01-01T00:00:00Z");
        let id = generated_identifier(&meta);
        assert!(id.starts_with("urn:uuid:"));
        assert_eq!(id.len(), "urn:uuid:".len() + 36);
        assert!(xml.contains(&format!(">{}</dc:identifier>", id)));
        let back = decode(&xml);
        assert_eq!(back.id, None);
        assert_eq!(back.title.as_deref(), Some("No Id"));

        // Stable for the same book, different for another one.
        assert_eq!(generated_identifier(&meta), id);
        assert_ne!(
            generated_identifier(&CanonicalMetadata::with_title("Other")),
            id
        );

        // A real UUID identifier is kept.
        let mut assigned = meta.clone();
        assigned.id = Some(generated_identifier(&CanonicalMetadata::with_title("Other")));
        let xml = package(assigned.clone()).render("1970-01-01T00:00:00Z");
        assert_eq!(decode(&xml).id, assigned.id);
    }

    #[test]
    fn invalid_series_number_drops_position_and_extent() {
        let mut meta = CanonicalMetadata::with_title("T");
        meta.series = Some("S".to_string());
        meta.series_number = Some("abc".to_string());
        meta.series_total = Some("4".to_string());
        let xml = encode_metadata(&meta, "x", None);
        assert!(xml.contains("belongs-to-collection"));
        assert!(!xml.contains("group-position"));
        assert!(!xml.contains("dcterms:extent"));
    }

    #[test]
    fn reads_calibre_style_epub2_metadata() {
        let xml = r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0" unique-identifier="id">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
    <dc:title>Old Book</dc:title>
    <dc:creator opf:role="ill">Drawer</dc:creator>
    <dc:date>2011-05-06T00:00:00+00:00</dc:date>
    <meta name="calibre:series" content="Old Series"/>
    <meta name="calibre:series_index" content="2.0"/>
    <meta name="calibre:rating" content="6"/>
  </metadata>
  <manifest/>
  <spine/>
</package>"#;
        let meta = decode(xml);
        assert_eq!(meta.title.as_deref(), Some("Old Book"));
        assert_eq!(meta.artists, Some(vec!["Drawer".to_string()]));
        assert_eq!(meta.writers, None);
        assert_eq!(meta.date.as_deref(), Some("2011-05-06"));
        assert_eq!(meta.series.as_deref(), Some("Old Series"));
        assert_eq!(meta.series_number.as_deref(), Some("2.0"));
        assert_eq!(meta.score, Some(3));
    }

    #[test]
    fn unmodelled_package_parts_survive_a_rewrite() {
        let xml = r##"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="uid" dir="rtl" xml:lang="ja" prefix="rendition: http://www.idpf.org/vocab/rendition/# schema: http://schema.org/">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="uid">urn:isbn:9780000000001</dc:identifier>
    <dc:identifier id="asin">B000000000</dc:identifier>
    <dc:title>Old</dc:title>
    <dc:rights>All rights reserved</dc:rights>
    <dc:contributor id="trl">Translator</dc:contributor>
    <meta refines="#trl" property="role" scheme="marc:relators">trl</meta>
    <meta property="rendition:layout">pre-paginated</meta>
    <meta property="dcterms:modified">2001-01-01T00:00:00Z</meta>
    <meta name="cover" content="img"/>
  </metadata>
  <manifest>
    <item id="img" href="c.jpg" media-type="image/jpeg"/>
  </manifest>
  <spine page-progression-direction="rtl"/>
  <guide>
    <reference type="cover" href="c.xhtml" title="Cover"/>
  </guide>
</package>"##;
        let mut package = OpfPackage::parse(xml).unwrap();
        assert_eq!(package.foreign_metadata.len(), 5);
        package.metadata.title = Some("New".to_string());
        let rendered = package.render("2020-01-01T00:00:00Z");

        for kept in [
            "dir=\"rtl\"",
            "xml:lang=\"ja\"",
            "prefix=\"schema: http://schema.org/ rendition: http://www.idpf.org/vocab/rendition/#\"",
            "<dc:identifier id=\"asin\">B000000000</dc:identifier>",
            "<dc:rights>All rights reserved</dc:rights>",
            "<dc:contributor id=\"trl\">Translator</dc:contributor>",
            "<meta refines=\"#trl\" property=\"role\" scheme=\"marc:relators\">trl</meta>",
            "<meta property=\"rendition:layout\">pre-paginated</meta>",
            "<spine page-progression-direction=\"rtl\">",
            "<guide><reference type=\"cover\" href=\"c.xhtml\" title=\"Cover\"/></guide>",
        ] {
            assert!(rendered.contains(kept), "{} missing from\n{}", kept, rendered);
        }
        // Modelled parts are written once, from the record.
        assert_eq!(rendered.matches("dcterms:modified").count(), 1);
        assert_eq!(rendered.matches("name=\"cover\"").count(), 1);
        assert!(rendered.contains("<dc:title>New</dc:title>"));
        assert!(!rendered.contains("2001-01-01"));

        let again = OpfPackage::parse(&rendered).unwrap();
        assert_eq!(again.foreign_metadata, package.foreign_metadata);
        assert_eq!(
            again.guide.map(|g| g.children),
            package.guide.map(|g| g.children)
        );
        assert_eq!(again.metadata.id.as_deref(), Some("urn:isbn:9780000000001"));
    }

    #[test]
    fn garbage_decodes_to_empty_record() {
        assert_eq!(decode("<package><metadata>"), CanonicalMetadata::default());
        assert!(OpfPackage::parse("<container/>").is_err());
    }
}
