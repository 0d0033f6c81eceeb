//! Heuristic mapping of schema-varying JSON sidecars onto [`CanonicalMetadata`].
//!
//! Each canonical field owns an ordered list of candidate key-paths (`a.b`,
//! `a.0.b`, `a[0].b`). The first path that exists *and* holds a value of the
//! expected JSON type wins; absent paths and type mismatches are skipped
//! silently. Derived fields (publisher, identifier, age rating, creator
//! fallback) are computed from the resolved values with the tables carried by
//! an explicit [`ResolverConfig`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::natsort::natural_cmp;
use crate::types::{AgeRating, CanonicalMetadata};

lazy_static! {
    static ref LEGACY_ID_PREFIX: Regex = Regex::new(r"^[A-Za-z]{3}(\d.*)$").unwrap();
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
];

const DAY_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d", "%d %b %Y", "%B %d, %Y"];

fn paths(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Ordered candidate key-paths per canonical field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldPaths {
    pub title: Vec<String>,
    pub series: Vec<String>,
    pub series_number: Vec<String>,
    pub series_total: Vec<String>,
    pub description: Vec<String>,
    pub date: Vec<String>,
    pub writers: Vec<String>,
    pub artists: Vec<String>,
    pub cover_artists: Vec<String>,
    pub tags: Vec<String>,
    pub url: Vec<String>,
    pub score: Vec<String>,
    pub id: Vec<String>,
    pub file_id: Vec<String>,
    pub language: Vec<String>,
}

impl Default for FieldPaths {
    fn default() -> Self {
        Self {
            title: paths(&["title", "work.title", "post.title", "subject", "name"]),
            series: paths(&["series", "series.title", "series.name", "collection.title", "manga"]),
            series_number: paths(&[
                "series_number",
                "series.number",
                "series.position",
                "series_index",
                "chapter",
                "volume",
            ]),
            series_total: paths(&["series_total", "series.total", "series.count", "count"]),
            description: paths(&[
                "description",
                "summary",
                "caption",
                "content",
                "post.content",
            ]),
            date: paths(&[
                "date",
                "published",
                "published_at",
                "created_at",
                "post.published",
                "upload_date",
                "timestamp",
            ]),
            writers: paths(&["writers", "authors", "author", "author.name", "author[0].name"]),
            artists: paths(&[
                "artists",
                "artist",
                "illustrators",
                "user.name",
                "creator.name",
                "uploader",
            ]),
            cover_artists: paths(&["cover_artists", "cover_artist", "cover.artist"]),
            tags: paths(&["tags", "freeform", "keywords", "genres", "categories"]),
            url: paths(&["url", "post_url", "webpage_url", "link", "source"]),
            score: paths(&["score", "stars", "rating_score", "rating.score"]),
            id: paths(&["id", "post_id", "work_id", "story_id"]),
            file_id: paths(&["file_id", "num"]),
            language: paths(&["language", "lang", "locale"]),
        }
    }
}

/// A publisher recognised by hostname, with its rating vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherRule {
    pub name: String,
    /// Case-insensitive substrings matched against URL-like fields.
    pub hosts: Vec<String>,
    /// Key-paths holding the publisher's raw rating value.
    #[serde(default)]
    pub rating_paths: Vec<String>,
    /// Raw rating value (case-insensitive) to canonical rating.
    #[serde(default)]
    pub ratings: BTreeMap<String, AgeRating>,
}

impl PublisherRule {
    fn new(name: &str, hosts: &[&str], rating_paths: &[&str], ratings: &[(&str, AgeRating)]) -> Self {
        Self {
            name: name.to_string(),
            hosts: paths(hosts),
            rating_paths: paths(rating_paths),
            ratings: ratings
                .iter()
                .map(|(raw, rating)| (raw.to_string(), *rating))
                .collect(),
        }
    }

    fn matches(&self, candidate: &str) -> bool {
        let candidate = candidate.to_lowercase();
        self.hosts
            .iter()
            .any(|host| candidate.contains(&host.to_lowercase()))
    }

    fn rating_for(&self, raw: &str) -> Option<AgeRating> {
        let raw = raw.trim();
        self.ratings
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(raw))
            .map(|(_, rating)| *rating)
    }
}

/// Immutable resolver tables, passed explicitly to [`MetadataResolver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub fields: FieldPaths,
    /// Paths searched, in order, for a string naming a known publisher host.
    pub publisher_paths: Vec<String>,
    pub publishers: Vec<PublisherRule>,
    /// Extensions of written-text media, for which writers and artists may
    /// stand in for one another.
    pub written_extensions: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        use AgeRating::*;
        Self {
            fields: FieldPaths::default(),
            publisher_paths: paths(&[
                "url",
                "post_url",
                "webpage_url",
                "link",
                "source",
                "category",
                "extractor",
            ]),
            publishers: vec![
                PublisherRule::new(
                    "Archive of Our Own",
                    &["archiveofourown.org", "ao3.org"],
                    &["rating", "ratings", "ratings[0]"],
                    &[
                        ("General Audiences", Everyone),
                        ("Teen And Up Audiences", Teen),
                        ("Mature", Mature17Plus),
                        ("Explicit", X18Plus),
                        ("Not Rated", Unknown),
                    ],
                ),
                PublisherRule::new(
                    "FanFiction.Net",
                    &["fanfiction.net"],
                    &["rating", "rated"],
                    &[
                        ("K", Everyone),
                        ("K+", Everyone),
                        ("T", Teen),
                        ("M", Mature17Plus),
                        ("MA", X18Plus),
                    ],
                ),
                PublisherRule::new(
                    "pixiv",
                    &["pixiv.net", "pixiv"],
                    &["rating", "x_restrict"],
                    &[
                        ("General", Everyone),
                        ("R-18", X18Plus),
                        ("R-18G", X18Plus),
                        ("0", Everyone),
                        ("1", X18Plus),
                        ("2", X18Plus),
                    ],
                ),
                PublisherRule::new(
                    "pixivFANBOX",
                    &["fanbox.cc"],
                    &["rating"],
                    &[("General", Everyone), ("R-18", X18Plus)],
                ),
                PublisherRule::new(
                    "DeviantArt",
                    &["deviantart.com", "deviantart"],
                    &["is_mature", "mature"],
                    &[("false", Everyone), ("true", Mature17Plus)],
                ),
                PublisherRule::new(
                    "Danbooru",
                    &["danbooru.donmai.us", "danbooru"],
                    &["rating"],
                    &[
                        ("g", Everyone),
                        ("s", Teen),
                        ("q", Mature17Plus),
                        ("e", X18Plus),
                    ],
                ),
                PublisherRule::new(
                    "e621",
                    &["e621.net", "e621"],
                    &["rating"],
                    &[("s", Everyone), ("q", Mature17Plus), ("e", X18Plus)],
                ),
                PublisherRule::new(
                    "Wattpad",
                    &["wattpad.com"],
                    &["mature", "isMature"],
                    &[("false", Teen), ("true", Mature17Plus)],
                ),
                PublisherRule::new(
                    "Twitter",
                    &["twitter.com", "twitter"],
                    &["sensitive", "possibly_sensitive"],
                    &[("false", Everyone), ("true", Mature17Plus)],
                ),
                PublisherRule::new("Patreon", &["patreon.com", "patreon"], &[], &[]),
                PublisherRule::new("Royal Road", &["royalroad.com"], &[], &[]),
                PublisherRule::new("Tumblr", &["tumblr.com", "tumblr"], &[], &[]),
            ],
            written_extensions: paths(&[
                "txt", "html", "htm", "xhtml", "md", "doc", "docx", "odt", "rtf", "pdf", "epub",
            ]),
        }
    }
}

impl ResolverConfig {
    /// Loads resolver tables from a JSON file. Missing keys keep their defaults.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn is_written(&self, extension: Option<&str>) -> bool {
        extension.is_some_and(|ext| {
            let ext = ext.trim_start_matches('.');
            self.written_extensions
                .iter()
                .any(|w| w.eq_ignore_ascii_case(ext))
        })
    }
}

/// Looks up a dotted, array-indexable key-path such as `author[0].name` or `tags.2`.
pub fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = value;
    for segment in path.split('.') {
        let (name, indices) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !name.is_empty() {
            current = match current {
                Value::Object(map) => map.get(name)?,
                Value::Array(items) => items.get(name.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        for index in indices.split('[').filter(|s| !s.is_empty()) {
            let index = index.strip_suffix(']')?.parse::<usize>().ok()?;
            current = current.as_array()?.get(index)?;
        }
    }
    Some(current)
}

fn as_text(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn as_number_like(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(_) => as_text(value),
        _ => None,
    }
}

fn as_scalar(value: &Value) -> Option<String> {
    match value {
        Value::Bool(b) => Some(b.to_string()),
        _ => as_number_like(value),
    }
}

fn as_people(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(_) => as_text(value).map(|s| vec![s]),
        Value::Object(map) => map.get("name").and_then(as_text).map(|s| vec![s]),
        Value::Array(items) => {
            let names: Vec<String> = items
                .iter()
                .filter_map(|item| match item {
                    Value::Object(map) => map.get("name").and_then(as_text),
                    other => as_text(other),
                })
                .collect();
            (!names.is_empty()).then_some(names)
        }
        _ => None,
    }
}

fn as_tags(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => {
            let tags: Vec<String> = s
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            (!tags.is_empty()).then_some(tags)
        }
        Value::Array(_) => as_people(value),
        _ => None,
    }
}

fn as_score(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_date(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => {
            let secs = n.as_i64()?;
            DateTime::from_timestamp(secs, 0).map(|dt| dt.format("%Y-%m-%d").to_string())
        }
        Value::String(s) => parse_date(s),
        _ => None,
    }
}

/// Normalizes a date string in any of the common sidecar layouts to `YYYY-MM-DD`.
pub fn parse_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.format("%Y-%m-%d").to_string());
    }
    for format in DATE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt.format("%Y-%m-%d").to_string());
        }
    }
    for format in DAY_FORMATS {
        if let Ok(day) = NaiveDate::parse_from_str(raw, format) {
            return Some(day.format("%Y-%m-%d").to_string());
        }
    }
    None
}

/// Strips a legacy three-letter prefix directly followed by digits (`abc123` → `123`).
pub fn strip_legacy_prefix(id: &str) -> String {
    match LEGACY_ID_PREFIX.captures(id) {
        Some(caps) => caps[1].to_string(),
        None => id.to_string(),
    }
}

/// Finds the media file a sidecar describes.
///
/// `page.jpg.json` pairs with `page.jpg`; `page.json` pairs with the single
/// media file whose stem is `page`. No match or several matches is a
/// [`Error::MissingSourceMedia`].
pub fn media_for_sidecar(sidecar: &Path, media_files: &[PathBuf]) -> Result<PathBuf> {
    let stem = sidecar
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    if let Some(exact) = media_files
        .iter()
        .find(|m| m.file_name().is_some_and(|n| n.to_string_lossy() == stem))
    {
        return Ok(exact.clone());
    }
    let matches: Vec<&PathBuf> = media_files
        .iter()
        .filter(|m| m.file_stem().is_some_and(|s| s.to_string_lossy() == stem))
        .collect();
    match matches.as_slice() {
        [single] => Ok((*single).clone()),
        other => Err(Error::MissingSourceMedia(sidecar.to_path_buf(), other.len())),
    }
}

/// Maps JSON documents onto [`CanonicalMetadata`] using a [`ResolverConfig`].
#[derive(Debug, Clone, Copy)]
pub struct MetadataResolver<'a> {
    config: &'a ResolverConfig,
}

impl<'a> MetadataResolver<'a> {
    pub fn new(config: &'a ResolverConfig) -> Self {
        Self { config }
    }

    /// Tries each candidate path in order; the first one that exists and
    /// converts to the expected type wins.
    fn first<T>(
        &self,
        doc: &Value,
        candidates: &[String],
        convert: impl Fn(&Value) -> Option<T>,
    ) -> Option<T> {
        for path in candidates {
            match lookup(doc, path) {
                Some(value) => match convert(value) {
                    Some(found) => {
                        debug!("Resolved '{}'", path);
                        return Some(found);
                    }
                    None => debug!("Skipping '{}': unexpected value type", path),
                },
                None => continue,
            }
        }
        None
    }

    /// Infers the publisher from the first URL-like field naming a known host.
    pub fn publisher(&self, doc: &Value) -> Option<&'a PublisherRule> {
        let config = self.config;
        for path in config.publisher_paths.iter().chain(config.fields.url.iter()) {
            let Some(candidate) = lookup(doc, path).and_then(as_text) else {
                continue;
            };
            if let Some(rule) = config.publishers.iter().find(|r| r.matches(&candidate)) {
                return Some(rule);
            }
        }
        None
    }

    /// Publisher-specific rating, `Unknown` when either side is missing or unrecognized.
    pub fn age_rating(&self, doc: &Value) -> AgeRating {
        let Some(rule) = self.publisher(doc) else {
            return AgeRating::Unknown;
        };
        self.first(doc, &rule.rating_paths, as_scalar)
            .and_then(|raw| rule.rating_for(&raw))
            .unwrap_or_default()
    }

    fn identifier(&self, doc: &Value) -> Option<String> {
        let fields = &self.config.fields;
        let id = self
            .first(doc, &fields.id, as_number_like)
            .map(|id| strip_legacy_prefix(&id))?;
        match self.first(doc, &fields.file_id, as_number_like) {
            Some(file_id) => Some(format!("{}_{}", id, file_id)),
            None => Some(id),
        }
    }

    /// Resolves one document. `extension` is the described media file's extension.
    pub fn resolve(&self, doc: &Value, extension: Option<&str>) -> CanonicalMetadata {
        let fields = &self.config.fields;

        let mut writers = self.first(doc, &fields.writers, as_people);
        let mut artists = self.first(doc, &fields.artists, as_people);
        if self.config.is_written(extension) {
            if writers.is_none() {
                writers = artists.clone();
            } else if artists.is_none() {
                artists = writers.clone();
            }
        }

        CanonicalMetadata {
            title: self.first(doc, &fields.title, as_text),
            series: self.first(doc, &fields.series, as_text),
            series_number: self.first(doc, &fields.series_number, as_number_like),
            series_total: self.first(doc, &fields.series_total, as_number_like),
            description: self.first(doc, &fields.description, as_text),
            date: self.first(doc, &fields.date, as_date),
            writers,
            artists,
            cover_artists: self.first(doc, &fields.cover_artists, as_people),
            publisher: self.publisher(doc).map(|rule| rule.name.clone()),
            tags: self.first(doc, &fields.tags, as_tags),
            url: self.first(doc, &fields.url, as_text),
            age_rating: self.age_rating(doc),
            score: self
                .first(doc, &fields.score, as_score)
                .filter(|s| (0.0..=5.0).contains(s))
                .map(|s| s.round() as u8),
            page_count: None,
            id: self.identifier(doc),
            language: self.first(doc, &fields.language, as_text),
        }
        .normalized()
    }

    /// Resolves a directory's worth of documents, keyed by file name.
    ///
    /// The body comes from the first document in natural order; the age
    /// rating is the strictest rating across all documents.
    pub fn resolve_all(
        &self,
        documents: &[(String, Value)],
        extension: Option<&str>,
    ) -> Option<CanonicalMetadata> {
        let mut ordered: Vec<&(String, Value)> = documents.iter().collect();
        ordered.sort_by(|a, b| natural_cmp(&a.0, &b.0));

        let (_, first) = ordered.first()?;
        let mut metadata = self.resolve(first, extension);
        metadata.age_rating = ordered
            .iter()
            .map(|(_, doc)| self.age_rating(doc))
            .max()
            .unwrap_or_default();
        Some(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolve(doc: Value, ext: &str) -> CanonicalMetadata {
        let config = ResolverConfig::default();
        MetadataResolver::new(&config).resolve(&doc, Some(ext))
    }

    #[test]
    fn key_paths_index_objects_and_arrays() {
        let doc = json!({"author": [{"name": "A"}, {"name": "B"}], "tags": ["x", "y"]});
        assert_eq!(lookup(&doc, "author[1].name"), Some(&json!("B")));
        assert_eq!(lookup(&doc, "author.0.name"), Some(&json!("A")));
        assert_eq!(lookup(&doc, "tags[5]"), None);
        assert_eq!(lookup(&doc, "missing.path"), None);
    }

    #[test]
    fn type_mismatch_falls_through_to_next_candidate() {
        let meta = resolve(json!({"title": 42, "subject": "Real Title"}), "jpg");
        assert_eq!(meta.title.as_deref(), Some("Real Title"));
    }

    #[test]
    fn publisher_and_rating_from_host_table() {
        let meta = resolve(
            json!({
                "title": "Work",
                "url": "https://ArchiveOfOurOwn.org/works/123",
                "rating": "Teen And Up Audiences"
            }),
            "html",
        );
        assert_eq!(meta.publisher.as_deref(), Some("Archive of Our Own"));
        assert_eq!(meta.age_rating, AgeRating::Teen);
    }

    #[test]
    fn unknown_publisher_or_rating_defaults_to_unknown() {
        let meta = resolve(json!({"url": "https://example.org", "rating": "Explicit"}), "txt");
        assert_eq!(meta.publisher, None);
        assert_eq!(meta.age_rating, AgeRating::Unknown);

        let meta = resolve(
            json!({"category": "pixiv", "rating": "something new"}),
            "jpg",
        );
        assert_eq!(meta.publisher.as_deref(), Some("pixiv"));
        assert_eq!(meta.age_rating, AgeRating::Unknown);
    }

    #[test]
    fn numeric_and_boolean_ratings_are_looked_up_as_strings() {
        let meta = resolve(json!({"category": "pixiv", "x_restrict": 1}), "png");
        assert_eq!(meta.age_rating, AgeRating::X18Plus);
        let meta = resolve(
            json!({"url": "https://www.deviantart.com/a/art/b", "is_mature": false}),
            "png",
        );
        assert_eq!(meta.age_rating, AgeRating::Everyone);
    }

    #[test]
    fn identifier_strips_legacy_prefix_and_appends_file_id() {
        let meta = resolve(json!({"id": "pxv98765", "file_id": 3}), "jpg");
        assert_eq!(meta.id.as_deref(), Some("98765_3"));
        let meta = resolve(json!({"id": "abcd123"}), "jpg");
        assert_eq!(meta.id.as_deref(), Some("abcd123"));
        let meta = resolve(json!({"id": 555}), "jpg");
        assert_eq!(meta.id.as_deref(), Some("555"));
    }

    #[test]
    fn creator_fallback_only_for_written_media() {
        let doc = json!({"author": "Writer Person"});
        let text = resolve(doc.clone(), "txt");
        assert_eq!(text.artists, Some(vec!["Writer Person".to_string()]));
        let image = resolve(doc, "jpg");
        assert_eq!(image.artists, None);
        assert_eq!(image.writers, Some(vec!["Writer Person".to_string()]));
    }

    #[test]
    fn dates_scores_and_tags() {
        let meta = resolve(
            json!({
                "date": "2021-03-04 10:11:12",
                "score": 4.2,
                "tags": "one, two,,three"
            }),
            "jpg",
        );
        assert_eq!(meta.date.as_deref(), Some("2021-03-04"));
        assert_eq!(meta.score, Some(4));
        assert_eq!(
            meta.tags,
            Some(vec!["one".to_string(), "two".to_string(), "three".to_string()])
        );
        let meta = resolve(json!({"score": 9, "upload_date": "20200102"}), "mp4");
        assert_eq!(meta.score, None);
        assert_eq!(meta.date.as_deref(), Some("2020-01-02"));
    }

    #[test]
    fn directory_merge_takes_strictest_rating() {
        let config = ResolverConfig::default();
        let docs = vec![
            (
                "page10.json".to_string(),
                json!({"title": "Later", "url": "https://e621.net/posts/2", "rating": "e"}),
            ),
            (
                "page2.json".to_string(),
                json!({"title": "First", "url": "https://e621.net/posts/1", "rating": "s"}),
            ),
        ];
        let meta = MetadataResolver::new(&config)
            .resolve_all(&docs, Some("jpg"))
            .unwrap();
        assert_eq!(meta.title.as_deref(), Some("First"));
        assert_eq!(meta.age_rating, AgeRating::X18Plus);
    }

    #[test]
    fn sidecar_pairing() {
        let media = vec![PathBuf::from("d/a.jpg"), PathBuf::from("d/b.png"), PathBuf::from("d/b.txt")];
        assert_eq!(
            media_for_sidecar(Path::new("d/a.jpg.json"), &media).unwrap(),
            PathBuf::from("d/a.jpg")
        );
        assert_eq!(
            media_for_sidecar(Path::new("d/a.json"), &media).unwrap(),
            PathBuf::from("d/a.jpg")
        );
        assert!(matches!(
            media_for_sidecar(Path::new("d/b.json"), &media),
            Err(Error::MissingSourceMedia(_, 2))
        ));
        assert!(matches!(
            media_for_sidecar(Path::new("d/c.json"), &media),
            Err(Error::MissingSourceMedia(_, 0))
        ));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = ResolverConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ResolverConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        let partial: ResolverConfig =
            serde_json::from_str(r#"{"written_extensions": ["txt"]}"#).unwrap();
        assert_eq!(partial.written_extensions, vec!["txt".to_string()]);
        assert_eq!(partial.fields, FieldPaths::default());
    }
}
