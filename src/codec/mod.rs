//! Canonical metadata ⇄ archive metadata documents.
//!
//! - [`comicinfo`]: `ComicInfo.xml` for CBZ.
//! - [`opf`]: the OPF package document for EPUB (metadata, manifest, spine).
//!
//! Both codecs share the numeric normalisation rules and the star-tag
//! convention for scores defined here. Decoders read through [`XmlElement`],
//! a small owned tree built with `quick_xml`.

pub mod comicinfo;
pub mod opf;

use quick_xml::escape::{escape, partial_escape};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::error::{Error, Result};

/// Character repeated `score` times to form the leading star tag.
pub const STAR: char = '★';

/// Normalizes a series number: any finite decimal, re-serialized in its
/// shortest form (`"2.50"` → `"2.5"`, `"3.0"` → `"3"`).
pub fn normalize_number(raw: &str) -> Option<String> {
    let value: f64 = raw.trim().parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(format!("{}", value))
}

/// Normalizes a series total: a non-negative integral value.
pub fn normalize_count(raw: &str) -> Option<String> {
    let value: f64 = raw.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
        return None;
    }
    Some(format!("{}", value as u64))
}

/// The `(Number, Count)` pair to emit. Without a valid number neither is
/// emitted; an invalid total only drops the count.
pub fn series_pair(
    number: Option<&str>,
    total: Option<&str>,
) -> (Option<String>, Option<String>) {
    match number.and_then(normalize_number) {
        Some(number) => (Some(number), total.and_then(normalize_count)),
        None => (None, None),
    }
}

/// `★★★` for a score of 3; `None` for 0 or out of range.
pub fn star_tag(score: Option<u8>) -> Option<String> {
    score
        .filter(|s| (1..=5).contains(s))
        .map(|s| STAR.to_string().repeat(usize::from(s)))
}

/// Splits a leading star tag off a tag list, returning the star count.
pub fn split_star_tag(tags: Vec<String>) -> (Option<u8>, Vec<String>) {
    match tags.first() {
        Some(first) if !first.is_empty() && first.chars().all(|c| c == STAR) => {
            let count = first.chars().count();
            let rest = tags.into_iter().skip(1).collect();
            (u8::try_from(count).ok().filter(|c| *c <= 5), rest)
        }
        _ => (None, tags),
    }
}

/// Element of a parsed XML document. Only direct text is kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElement {
    /// Qualified name as written, e.g. `dc:title`.
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    /// Name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        local(&self.name)
    }

    /// Attribute by exact name, falling back to a match on the local part.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .or_else(|| self.attrs.iter().find(|(k, _)| local(k) == local(key)))
            .map(|(_, v)| v.as_str())
    }

    /// First direct child with the given local name.
    pub fn child(&self, local_name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.local_name() == local_name)
    }

    /// All direct children with the given local name.
    pub fn children_named<'a>(
        &'a self,
        local_name: &'a str,
    ) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children
            .iter()
            .filter(move |c| c.local_name() == local_name)
    }

    /// Trimmed direct text, `None` when blank.
    pub fn value(&self) -> Option<&str> {
        Some(self.text.trim()).filter(|t| !t.is_empty())
    }

    /// Serializes the element back to XML. Direct text is written before the
    /// children and is trimmed when there are children.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attrs {
            out.push_str(&format!(" {}=\"{}\"", key, escape(value.as_str())));
        }
        let text = if self.children.is_empty() {
            self.text.as_str()
        } else {
            self.text.trim()
        };
        if self.children.is_empty() && text.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&partial_escape(text));
        for child in &self.children {
            child.write_xml(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Depth-first search for the first element with the given local name.
    pub fn find(&self, local_name: &str) -> Option<&XmlElement> {
        if self.local_name() == local_name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(local_name))
    }
}

fn local(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

fn read_start(start: &BytesStart<'_>) -> Result<XmlElement> {
    let mut element = XmlElement {
        name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
        ..Default::default()
    };
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        element.attrs.push((key, value));
    }
    Ok(element)
}

/// Parses a complete, well-formed XML document into its root element.
pub fn parse_xml(xml: &str) -> Result<XmlElement> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) {
        match stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None => {
                if root.is_none() {
                    *root = Some(element);
                }
            }
        }
    }

    loop {
        match reader.read_event()? {
            Event::Start(ref e) => stack.push(read_start(e)?),
            Event::Empty(ref e) => {
                let element = read_start(e)?;
                attach(&mut stack, &mut root, element);
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| Error::MalformedInput("unbalanced end tag".to_string()))?;
                attach(&mut stack, &mut root, element);
            }
            Event::Text(ref e) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&e.unescape()?);
                }
            }
            Event::CData(ref e) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(e));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(Error::MalformedInput(format!(
            "<{}> is never closed",
            stack[stack.len() - 1].name
        )));
    }
    root.ok_or_else(|| Error::MalformedInput("document has no root element".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_normalize_to_shortest_form() {
        assert_eq!(normalize_number("2.50").as_deref(), Some("2.5"));
        assert_eq!(normalize_number(" 3.0 ").as_deref(), Some("3"));
        assert_eq!(normalize_number("abc"), None);
        assert_eq!(normalize_number("NaN"), None);
        assert_eq!(normalize_count("5").as_deref(), Some("5"));
        assert_eq!(normalize_count("5.0").as_deref(), Some("5"));
        assert_eq!(normalize_count("5.5"), None);
        assert_eq!(normalize_count("-1"), None);
    }

    #[test]
    fn series_pair_requires_a_valid_number() {
        assert_eq!(
            series_pair(Some("2.5"), Some("5")),
            (Some("2.5".to_string()), Some("5".to_string()))
        );
        assert_eq!(series_pair(Some("abc"), Some("5")), (None, None));
        assert_eq!(
            series_pair(Some("1"), Some("x")),
            (Some("1".to_string()), None)
        );
    }

    #[test]
    fn star_tags() {
        assert_eq!(star_tag(Some(3)).as_deref(), Some("★★★"));
        assert_eq!(star_tag(Some(0)), None);
        assert_eq!(star_tag(Some(6)), None);
        let (stars, rest) = split_star_tag(vec!["★★".to_string(), "tag".to_string()]);
        assert_eq!(stars, Some(2));
        assert_eq!(rest, vec!["tag".to_string()]);
        let (stars, rest) = split_star_tag(vec!["tag".to_string()]);
        assert_eq!(stars, None);
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn parses_a_small_tree() {
        let root = parse_xml(
            r#"<?xml version="1.0"?><a xmlns:dc="x"><dc:b id="1">one &amp; two</dc:b><c/></a>"#,
        )
        .unwrap();
        assert_eq!(root.name, "a");
        let b = root.child("b").unwrap();
        assert_eq!(b.value(), Some("one & two"));
        assert_eq!(b.attr("id"), Some("1"));
        assert!(root.child("c").is_some());
        assert!(parse_xml("<a><b></a>").is_err());
        assert!(parse_xml("").is_err());
    }

    #[test]
    fn serializes_elements_back() {
        let root = parse_xml(
            "<guide>\n  <reference type=\"toc\" href=\"a&amp;b.xhtml\"/>\n  <reference type=\"text\" title=\"Start\">x &lt; y</reference>\n</guide>",
        )
        .unwrap();
        assert_eq!(
            root.to_xml(),
            "<guide><reference type=\"toc\" href=\"a&amp;b.xhtml\"/><reference type=\"text\" title=\"Start\">x &lt; y</reference></guide>"
        );
        assert_eq!(parse_xml(&root.to_xml()).unwrap().children, root.children);
    }
}
