//! Text and HTML to XHTML fragment normalization.
//!
//! Two entry paths produce an [`XhtmlFragment`]:
//!
//! - **Plain text**: line endings are normalized, blank lines and indented lines
//!   start new paragraphs, whitespace inside a paragraph collapses to single
//!   spaces and every paragraph is wrapped in `<p>`.
//! - **HTML**: the markup is parsed once into a small DOM holding the body
//!   content without scripts (see [`dom`]), publisher wrapper `<div>`s are
//!   unwrapped, `<pre>` blocks are re-run through the plain-text path, a single
//!   `<p>` split by `<br/>`s becomes one paragraph per piece, whitespace at
//!   block boundaries is trimmed and empty `<p>`/`<div>` elements are dropped.
//!
//! HTML parsing itself never fails. A markup file is rejected as
//! [`Error::MalformedInput`] only when it is not UTF-8.
//!
//! A fragment that ends up as exactly one image inside a block wrapper, with no
//! text anywhere, is promoted to a full-page SVG wrapper sized to the image.

pub mod dom;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::debug;
use quick_xml::escape::escape;
use regex::Regex;

use crate::error::{Error, Result};
use crate::services::ImageProbe;
use crate::types::MediaKind;
use dom::{Element, Node};

lazy_static! {
    static ref PARAGRAPH_BREAK: Regex = Regex::new(r"\n[ \t]*\n\s*|\n(?:\t|[ ]{2,})").unwrap();
    static ref INNER_WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref MARKUP_WHITESPACE: Regex = Regex::new(r"[ \t\r\n]+").unwrap();
}

/// Class or id names of publisher wrapper `<div>`s that are unwrapped by default.
pub const DEFAULT_WRAPPER_NAMES: &[&str] = &[
    "userstuff",
    "storytext",
    "chapter-content",
    "chapter-inner",
    "entry-content",
    "post-body",
];

/// An already-normalized body fragment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XhtmlFragment {
    nodes: Vec<Node>,
}

impl XhtmlFragment {
    pub fn from_nodes(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Appends another fragment after this one.
    pub fn append(&mut self, other: XhtmlFragment) {
        self.nodes.extend(other.nodes);
    }

    /// Serializes the fragment as XHTML body content.
    pub fn to_xhtml(&self) -> String {
        dom::serialize(&self.nodes)
    }

    /// Whether the fragment contains inline SVG (manifest `properties="svg"`).
    pub fn has_svg(&self) -> bool {
        fn walk(nodes: &[Node]) -> bool {
            nodes.iter().any(|n| match n {
                Node::Element(e) => e.name == "svg" || walk(&e.children),
                Node::Text(_) => false,
            })
        }
        walk(&self.nodes)
    }

    /// Image references in document order: `<img src>` and SVG `<image xlink:href>`.
    pub fn image_refs(&self) -> Vec<String> {
        fn walk(nodes: &[Node], out: &mut Vec<String>) {
            for node in nodes {
                if let Node::Element(e) = node {
                    if let Some(href) = image_ref_attr(e).and_then(|k| e.attr(k)) {
                        out.push(href.to_string());
                    }
                    walk(&e.children, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.nodes, &mut out);
        out
    }

    /// Rewrites every image reference through `rewrite`; `None` keeps the original.
    pub fn rewrite_images<F>(&mut self, mut rewrite: F)
    where
        F: FnMut(&str) -> Option<String>,
    {
        fn walk<F: FnMut(&str) -> Option<String>>(nodes: &mut [Node], rewrite: &mut F) {
            for node in nodes {
                if let Node::Element(e) = node {
                    if let Some(key) = image_ref_attr(e) {
                        let replacement = e.attr(key).and_then(|v| rewrite(v));
                        if let Some(new_value) = replacement {
                            e.set_attr(key, new_value);
                        }
                    }
                    walk(&mut e.children, rewrite);
                }
            }
        }
        walk(&mut self.nodes, &mut rewrite);
    }
}

impl fmt::Display for XhtmlFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xhtml())
    }
}

fn image_ref_attr(element: &Element) -> Option<&'static str> {
    match element.name.as_str() {
        "img" => Some("src"),
        "image" => Some("xlink:href"),
        _ => None,
    }
}

/// Normalizes text and HTML sources into [`XhtmlFragment`]s.
pub struct Normalizer<'a> {
    probe: &'a dyn ImageProbe,
    wrapper_names: Vec<String>,
}

impl<'a> Normalizer<'a> {
    pub fn new(probe: &'a dyn ImageProbe) -> Self {
        Self {
            probe,
            wrapper_names: DEFAULT_WRAPPER_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replaces the list of publisher wrapper class/id names.
    pub fn with_wrapper_names(mut self, names: Vec<String>) -> Self {
        self.wrapper_names = names;
        self
    }

    /// Plain-text path. Never fails.
    pub fn normalize_text(&self, text: &str) -> XhtmlFragment {
        XhtmlFragment::from_nodes(text_paragraphs(text))
    }

    /// HTML path. `base_dir` resolves relative image references for the
    /// full-page image promotion.
    pub fn normalize_html(
        &self,
        html: &str,
        title: &str,
        base_dir: Option<&Path>,
    ) -> XhtmlFragment {
        let nodes = dom::parse_fragment(html);

        let nodes = self.unwrap_outer(nodes);
        let nodes = expand_preformatted(nodes);
        let nodes = split_single_paragraph(nodes);
        let nodes = clean_children(nodes, true);

        let nodes = match self.promote_full_page_image(&nodes, title, base_dir) {
            Some(svg) => vec![svg],
            None => nodes,
        };
        XhtmlFragment::from_nodes(nodes)
    }

    /// Reads and normalizes a source file according to its [`MediaKind`].
    ///
    /// Image files become a single-image fragment, which the promotion rule
    /// turns into a full-page SVG when the probe can size the image.
    pub fn normalize_file(&self, path: &Path, title: &str) -> Result<XhtmlFragment> {
        let base_dir = path.parent();
        match MediaKind::of(path) {
            MediaKind::Text => {
                let bytes = fs::read(path)?;
                Ok(self.normalize_text(&String::from_utf8_lossy(&bytes)))
            }
            MediaKind::Image => {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let html = format!(
                    "<p><img src=\"{}\" alt=\"{}\"/></p>",
                    escape(file_name.as_str()),
                    escape(title)
                );
                Ok(self.normalize_html(&html, title, base_dir))
            }
            _ => {
                let bytes = fs::read(path)?;
                let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes[..]);
                let html = std::str::from_utf8(bytes).map_err(|e| {
                    Error::MalformedInput(format!("{:?} is not UTF-8: {}", path, e))
                })?;
                Ok(self.normalize_html(html, title, base_dir))
            }
        }
    }

    fn is_wrapper(&self, element: &Element) -> bool {
        if element.name != "div" {
            return false;
        }
        let id_match = element
            .attr("id")
            .is_some_and(|id| self.wrapper_names.iter().any(|w| w == id));
        let class_match = element.attr("class").is_some_and(|classes| {
            classes
                .split_whitespace()
                .any(|c| self.wrapper_names.iter().any(|w| w == c))
        });
        id_match || class_match
    }

    fn unwrap_outer(&self, mut nodes: Vec<Node>) -> Vec<Node> {
        loop {
            let elements: Vec<&Element> = nodes.iter().filter_map(Node::as_element).collect();
            let only_blank_text = nodes
                .iter()
                .all(|n| n.as_element().is_some() || n.is_blank_text());
            if elements.len() != 1 || !only_blank_text {
                return nodes;
            }
            let outer = elements[0];
            if self.is_wrapper(outer) {
                debug!("Unwrapping outer <{}>", outer.name);
                let children = outer.children.clone();
                nodes = children;
            } else {
                return nodes;
            }
        }
    }

    fn promote_full_page_image(
        &self,
        nodes: &[Node],
        title: &str,
        base_dir: Option<&Path>,
    ) -> Option<Node> {
        let meaningful: Vec<&Node> = nodes.iter().filter(|n| !n.is_blank_text()).collect();
        if meaningful.len() != 1 {
            return None;
        }
        let image = single_image(meaningful[0])?;
        let src = image.attr("src")?;
        let path = resolve_reference(base_dir, src)?;
        let (width, height) = self.probe.dimensions(&path)?;
        let alt = image
            .attr("alt")
            .filter(|a| !a.trim().is_empty())
            .unwrap_or(title);
        Some(full_page_svg(src, alt, width, height))
    }
}

/// Resolves a relative image reference against a source directory.
///
/// Remote (`scheme:`) and absolute references are not resolved.
pub fn resolve_reference(base_dir: Option<&Path>, reference: &str) -> Option<PathBuf> {
    if reference.contains("://") || reference.starts_with("data:") || reference.starts_with('/') {
        return None;
    }
    let clean = reference.split(['#', '?']).next().unwrap_or(reference);
    if clean.is_empty() {
        return None;
    }
    Some(match base_dir {
        Some(dir) => dir.join(clean),
        None => PathBuf::from(clean),
    })
}

/// Returns the sole `<img>` of a block wrapper that holds nothing else.
fn single_image(node: &Node) -> Option<&Element> {
    let element = node.as_element()?;
    if element.name == "img" {
        return Some(element);
    }
    if !matches!(element.name.as_str(), "p" | "div" | "figure" | "center") {
        return None;
    }
    let meaningful: Vec<&Node> = element
        .children
        .iter()
        .filter(|n| !n.is_blank_text())
        .collect();
    if meaningful.len() != 1 {
        return None;
    }
    single_image(meaningful[0])
}

fn full_page_svg(href: &str, alt: &str, width: u32, height: u32) -> Node {
    let image = Element::new("image")
        .with_attr("width", width.to_string())
        .with_attr("height", height.to_string())
        .with_attr("xlink:href", href);
    let svg = Element::new("svg")
        .with_attr("xmlns", "http://www.w3.org/2000/svg")
        .with_attr("xmlns:xlink", "http://www.w3.org/1999/xlink")
        .with_attr("version", "1.1")
        .with_attr("width", "100%")
        .with_attr("height", "100%")
        .with_attr("viewBox", format!("0 0 {} {}", width, height))
        .with_attr("preserveAspectRatio", "xMidYMid meet")
        .with_child(Node::Element(
            Element::new("title").with_child(Node::text(alt)),
        ))
        .with_child(Node::Element(image));
    Node::Element(
        Element::new("div")
            .with_attr("class", "full-page-image")
            .with_child(Node::Element(svg)),
    )
}

fn text_paragraphs(text: &str) -> Vec<Node> {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    PARAGRAPH_BREAK
        .split(&unified)
        .map(|chunk| INNER_WHITESPACE.replace_all(chunk, " ").trim().to_string())
        .filter(|p| !p.is_empty())
        .map(|p| Node::Element(Element::new("p").with_child(Node::Text(p))))
        .collect()
}

/// Replaces every `<pre>` with the plain-text paragraphs of its content.
fn expand_preformatted(nodes: Vec<Node>) -> Vec<Node> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            Node::Element(e) if e.name == "pre" => {
                out.extend(text_paragraphs(&e.text_content()));
            }
            Node::Element(mut e) => {
                e.children = expand_preformatted(e.children);
                out.push(Node::Element(e));
            }
            text => out.push(text),
        }
    }
    out
}

fn count_elements(nodes: &[Node], name: &str) -> usize {
    nodes
        .iter()
        .filter_map(Node::as_element)
        .map(|e| usize::from(e.name == name) + count_elements(&e.children, name))
        .sum()
}

/// When the whole fragment has exactly one `<p>` and uses `<br/>` for layout,
/// the breaks are the real paragraph separators.
fn split_single_paragraph(nodes: Vec<Node>) -> Vec<Node> {
    if count_elements(&nodes, "p") != 1 || count_elements(&nodes, "br") == 0 {
        return nodes;
    }
    split_paragraph_in(nodes)
}

fn split_paragraph_in(nodes: Vec<Node>) -> Vec<Node> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            Node::Element(p) if p.name == "p" => {
                let mut piece = Element::new("p");
                piece.attrs = p.attrs.clone();
                let mut current = piece.clone();
                for child in p.children {
                    match child {
                        Node::Element(ref br) if br.name == "br" => {
                            out.push(Node::Element(std::mem::replace(
                                &mut current,
                                piece.clone(),
                            )));
                        }
                        other => current.children.push(other),
                    }
                }
                out.push(Node::Element(current));
            }
            Node::Element(mut e) => {
                e.children = split_paragraph_in(e.children);
                out.push(Node::Element(e));
            }
            text => out.push(text),
        }
    }
    out
}

/// Collapses whitespace, trims it at block boundaries and drops empty `<p>`/`<div>`.
fn clean_children(nodes: Vec<Node>, block_context: bool) -> Vec<Node> {
    let mut cleaned: Vec<Node> = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            Node::Text(t) => {
                let collapsed = MARKUP_WHITESPACE.replace_all(&t, " ").into_owned();
                match cleaned.last_mut() {
                    Some(Node::Text(prev)) => prev.push_str(&collapsed),
                    _ => cleaned.push(Node::Text(collapsed)),
                }
            }
            Node::Element(mut e) => {
                let child_context = e.is_block();
                e.children = clean_children(e.children, child_context);
                if is_empty_container(&e) {
                    continue;
                }
                cleaned.push(Node::Element(e));
            }
        }
    }

    let len = cleaned.len();
    let boundary: Vec<(bool, bool)> = (0..len)
        .map(|i| {
            let before = if i == 0 {
                block_context
            } else {
                cleaned[i - 1].is_block() || is_break(&cleaned[i - 1])
            };
            let after = if i + 1 == len {
                block_context
            } else {
                cleaned[i + 1].is_block()
            };
            (before, after)
        })
        .collect();

    cleaned
        .into_iter()
        .zip(boundary)
        .filter_map(|(node, (before, after))| match node {
            Node::Text(mut t) => {
                if before {
                    t = t.trim_start().to_string();
                }
                if after {
                    t = t.trim_end().to_string();
                }
                (!t.is_empty()).then_some(Node::Text(t))
            }
            element => Some(element),
        })
        .collect()
}

fn is_break(node: &Node) -> bool {
    matches!(node, Node::Element(e) if e.name == "br")
}

fn is_empty_container(element: &Element) -> bool {
    matches!(element.name.as_str(), "p" | "div")
        && element
            .children
            .iter()
            .all(|c| c.is_blank_text() || is_break(c))
}
