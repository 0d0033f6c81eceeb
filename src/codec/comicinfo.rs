//! `ComicInfo.xml` encoding and decoding.
//!
//! Only non-null fields are written, except `AgeRating`, which is always
//! present (`Unknown` when nothing better is known). Decoding never fails: a
//! document that cannot be parsed yields an all-null record.

use chrono::{Datelike, NaiveDate};
use log::warn;
use quick_xml::escape::escape;

use crate::codec::{XmlElement, parse_xml, series_pair, split_star_tag, star_tag};
use crate::types::{AgeRating, CanonicalMetadata};

/// Archive entry name of the metadata document.
pub const COMIC_INFO_FILE: &str = "ComicInfo.xml";

fn push_element(xml: &mut String, name: &str, value: &str) {
    xml.push_str(&format!("  <{0}>{1}</{0}>\n", name, escape(value)));
}

fn join_list(list: &Option<Vec<String>>) -> Option<String> {
    list.as_ref().map(|items| items.join(", "))
}

/// Encodes a record as a complete `ComicInfo.xml` document.
pub fn encode(metadata: &CanonicalMetadata) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <ComicInfo xmlns:xsd=\"http://www.w3.org/2001/XMLSchema\" \
         xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\">\n",
    );

    let (number, count) = series_pair(
        metadata.series_number.as_deref(),
        metadata.series_total.as_deref(),
    );
    let date = metadata
        .date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());

    let mut tags: Vec<String> = star_tag(metadata.score).into_iter().collect();
    tags.extend(metadata.tags.iter().flatten().cloned());

    let fields: Vec<(&str, Option<String>)> = vec![
        ("Title", metadata.title.clone()),
        ("Series", metadata.series.clone()),
        ("Number", number),
        ("Count", count),
        ("Summary", metadata.description.clone()),
        ("Year", date.map(|d| d.year().to_string())),
        ("Month", date.map(|d| d.month().to_string())),
        ("Day", date.map(|d| d.day().to_string())),
        ("Writer", join_list(&metadata.writers)),
        ("Penciller", join_list(&metadata.artists)),
        ("CoverArtist", join_list(&metadata.cover_artists)),
        ("Publisher", metadata.publisher.clone()),
        ("Tags", (!tags.is_empty()).then(|| tags.join(", "))),
        ("Web", metadata.url.clone()),
        ("PageCount", metadata.page_count.map(|c| c.to_string())),
        ("LanguageISO", metadata.language.clone()),
        ("GTIN", metadata.id.clone()),
        ("AgeRating", Some(metadata.age_rating.as_str().to_string())),
        (
            "CommunityRating",
            metadata.score.map(|s| s.min(5).to_string()),
        ),
    ];

    for (name, value) in fields {
        if let Some(value) = value {
            push_element(&mut xml, name, &value);
        }
    }

    xml.push_str("</ComicInfo>\n");
    xml
}

fn split_list(value: Option<&str>) -> Option<Vec<String>> {
    let items: Vec<String> = value?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    (!items.is_empty()).then_some(items)
}

fn decode_date(root: &XmlElement) -> Option<String> {
    let number = |name: &str| root.child(name)?.value()?.parse::<u32>().ok();
    let year = i32::try_from(number("Year")?).ok()?;
    let month = number("Month").unwrap_or(1);
    let day = number("Day").unwrap_or(1);
    NaiveDate::from_ymd_opt(year, month, day).map(|d| d.format("%Y-%m-%d").to_string())
}

/// Decodes a `ComicInfo.xml` document. Parse failures yield an all-null record.
pub fn decode(xml: &str) -> CanonicalMetadata {
    let root = match parse_xml(xml) {
        Ok(root) if root.local_name() == "ComicInfo" => root,
        Ok(root) => {
            warn!("Unexpected ComicInfo root <{}>", root.name);
            return CanonicalMetadata::default();
        }
        Err(e) => {
            warn!("Unreadable ComicInfo.xml: {}", e);
            return CanonicalMetadata::default();
        }
    };
    let text = |name: &str| root.child(name).and_then(XmlElement::value).map(str::to_string);

    let (stars, tags) = split_star_tag(split_list(text("Tags").as_deref()).unwrap_or_default());
    let score = text("CommunityRating")
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|s| (0.0..=5.0).contains(s))
        .map(|s| s.round() as u8)
        .or(stars);

    CanonicalMetadata {
        title: text("Title"),
        series: text("Series"),
        series_number: text("Number"),
        series_total: text("Count"),
        description: text("Summary"),
        date: decode_date(&root),
        writers: split_list(text("Writer").as_deref()),
        artists: split_list(text("Penciller").as_deref()),
        cover_artists: split_list(text("CoverArtist").as_deref()),
        publisher: text("Publisher"),
        tags: Some(tags),
        url: text("Web"),
        age_rating: text("AgeRating")
            .and_then(|r| AgeRating::parse(&r))
            .unwrap_or_default(),
        score,
        page_count: text("PageCount").and_then(|c| c.parse().ok()),
        id: text("GTIN"),
        language: text("LanguageISO"),
    }
    .normalized()
}
