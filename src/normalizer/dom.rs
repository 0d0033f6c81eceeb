//! Minimal DOM for HTML fragments.
//!
//! Fragments are parsed once with `html5ever` into a small owned tree,
//! rewritten by the normalizer, and serialized once as XHTML.

use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use html5ever::driver::ParseOpts;
use html5ever::parse_document;
use html5ever::tendril::{StrTendril, TendrilSink};
use html5ever::tree_builder::{ElementFlags, NodeOrText, QuirksMode, TreeSink};
use html5ever::{Attribute, QualName};
use log::trace;
use quick_xml::escape::{escape, partial_escape};

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

const BLOCK_ELEMENTS: &[&str] = &[
    "address",
    "article",
    "aside",
    "blockquote",
    "body",
    "center",
    "dd",
    "details",
    "div",
    "dl",
    "dt",
    "figcaption",
    "figure",
    "footer",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "head",
    "header",
    "hr",
    "html",
    "li",
    "main",
    "nav",
    "ol",
    "p",
    "pre",
    "section",
    "svg",
    "table",
    "tbody",
    "td",
    "tfoot",
    "th",
    "thead",
    "tr",
    "ul",
];

/// A node of the fragment tree. Text is stored unescaped.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key.to_string(), value)),
        }
    }

    pub fn is_block(&self) -> bool {
        is_block(&self.name)
    }

    /// Concatenated text of all descendants.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        collect_text(&self.children, &mut out);
        out
    }
}

impl Node {
    pub fn text(value: impl Into<String>) -> Self {
        Node::Text(value.into())
    }

    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Node::Element(e) if e.is_block())
    }

    pub fn is_blank_text(&self) -> bool {
        matches!(self, Node::Text(t) if t.trim().is_empty())
    }
}

pub fn is_block(name: &str) -> bool {
    BLOCK_ELEMENTS.contains(&name)
}

pub fn is_void(name: &str) -> bool {
    VOID_ELEMENTS.contains(&name)
}

fn collect_text(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Element(e) if e.name == "br" => out.push('\n'),
            Node::Element(e) => collect_text(&e.children, out),
        }
    }
}

type Handle = Rc<SinkNode>;

/// Node of the tree html5ever builds; converted to [`Node`]s once parsing ends.
struct SinkNode {
    data: SinkData,
    parent: RefCell<Option<Weak<SinkNode>>>,
    children: RefCell<Vec<Handle>>,
}

enum SinkData {
    Document,
    Element {
        name: QualName,
        attrs: RefCell<Vec<Attribute>>,
    },
    Text(RefCell<String>),
    Comment,
}

impl SinkNode {
    fn new(data: SinkData) -> Handle {
        Rc::new(SinkNode {
            data,
            parent: RefCell::new(None),
            children: RefCell::new(Vec::new()),
        })
    }

    fn text(value: &str) -> Handle {
        Self::new(SinkData::Text(RefCell::new(value.to_string())))
    }

    fn is_named(&self, local: &str) -> bool {
        matches!(&self.data, SinkData::Element { name, .. } if &*name.local == local)
    }
}

fn parent_of(node: &Handle) -> Option<Handle> {
    node.parent.borrow().as_ref().and_then(Weak::upgrade)
}

fn position_in(parent: &Handle, child: &Handle) -> usize {
    parent
        .children
        .borrow()
        .iter()
        .position(|c| Rc::ptr_eq(c, child))
        .unwrap_or(0)
}

fn attach(parent: &Handle, child: Handle, index: Option<usize>) {
    *child.parent.borrow_mut() = Some(Rc::downgrade(parent));
    let mut children = parent.children.borrow_mut();
    match index {
        Some(index) => children.insert(index, child),
        None => children.push(child),
    }
}

fn detach(node: &Handle) {
    if let Some(parent) = parent_of(node) {
        parent
            .children
            .borrow_mut()
            .retain(|c| !Rc::ptr_eq(c, node));
    }
    *node.parent.borrow_mut() = None;
}

/// `TreeSink` collecting the parse into [`SinkNode`]s.
///
/// html5ever's sink methods take `&self`, so the tree lives behind `RefCell`s.
struct FragmentSink {
    document: Handle,
    /// Name reported for handles that are not elements.
    no_name: QualName,
}

impl FragmentSink {
    fn new() -> Self {
        Self {
            document: SinkNode::new(SinkData::Document),
            no_name: QualName::new(None, html5ever::ns!(), html5ever::local_name!("")),
        }
    }
}

impl TreeSink for FragmentSink {
    type Handle = Handle;
    type Output = Vec<Node>;
    type ElemName<'a>
        = &'a QualName
    where
        Self: 'a;

    fn finish(self) -> Vec<Node> {
        let html = self
            .document
            .children
            .borrow()
            .iter()
            .find(|c| c.is_named("html"))
            .cloned();
        let body = html.and_then(|html| {
            html.children
                .borrow()
                .iter()
                .find(|c| c.is_named("body"))
                .cloned()
        });
        body.map(|body| convert_children(&body)).unwrap_or_default()
    }

    fn parse_error(&self, msg: Cow<'static, str>) {
        trace!("Recovered from HTML parse error: {}", msg);
    }

    fn get_document(&self) -> Handle {
        self.document.clone()
    }

    fn elem_name<'a>(&'a self, target: &'a Handle) -> &'a QualName {
        match &target.data {
            SinkData::Element { name, .. } => name,
            _ => &self.no_name,
        }
    }

    fn create_element(&self, name: QualName, attrs: Vec<Attribute>, _flags: ElementFlags) -> Handle {
        SinkNode::new(SinkData::Element {
            name,
            attrs: RefCell::new(attrs),
        })
    }

    fn create_comment(&self, _text: StrTendril) -> Handle {
        SinkNode::new(SinkData::Comment)
    }

    fn create_pi(&self, _target: StrTendril, _data: StrTendril) -> Handle {
        SinkNode::new(SinkData::Comment)
    }

    fn append(&self, parent: &Handle, child: NodeOrText<Handle>) {
        match child {
            NodeOrText::AppendNode(node) => attach(parent, node, None),
            NodeOrText::AppendText(text) => {
                if let Some(last) = parent.children.borrow().last() {
                    if let SinkData::Text(existing) = &last.data {
                        existing.borrow_mut().push_str(&text);
                        return;
                    }
                }
                attach(parent, SinkNode::text(&text), None);
            }
        }
    }

    fn append_based_on_parent_node(
        &self,
        element: &Handle,
        prev_element: &Handle,
        child: NodeOrText<Handle>,
    ) {
        if parent_of(element).is_some() {
            self.append_before_sibling(element, child);
        } else {
            self.append(prev_element, child);
        }
    }

    fn append_doctype_to_document(
        &self,
        _name: StrTendril,
        _public_id: StrTendril,
        _system_id: StrTendril,
    ) {
    }

    fn get_template_contents(&self, target: &Handle) -> Handle {
        target.clone()
    }

    fn same_node(&self, x: &Handle, y: &Handle) -> bool {
        Rc::ptr_eq(x, y)
    }

    fn set_quirks_mode(&self, _mode: QuirksMode) {}

    fn append_before_sibling(&self, sibling: &Handle, child: NodeOrText<Handle>) {
        let Some(parent) = parent_of(sibling) else {
            return;
        };
        let node = match child {
            NodeOrText::AppendNode(node) => {
                detach(&node);
                node
            }
            NodeOrText::AppendText(text) => {
                let index = position_in(&parent, sibling);
                if index > 0 {
                    if let SinkData::Text(existing) = &parent.children.borrow()[index - 1].data {
                        existing.borrow_mut().push_str(&text);
                        return;
                    }
                }
                SinkNode::text(&text)
            }
        };
        let index = position_in(&parent, sibling);
        attach(&parent, node, Some(index));
    }

    fn add_attrs_if_missing(&self, target: &Handle, attrs: Vec<Attribute>) {
        if let SinkData::Element {
            attrs: existing, ..
        } = &target.data
        {
            let mut existing = existing.borrow_mut();
            for attr in attrs {
                if !existing.iter().any(|a| a.name == attr.name) {
                    existing.push(attr);
                }
            }
        }
    }

    fn remove_from_parent(&self, target: &Handle) {
        detach(target);
    }

    fn reparent_children(&self, node: &Handle, new_parent: &Handle) {
        let children = std::mem::take(&mut *node.children.borrow_mut());
        for child in children {
            attach(new_parent, child, None);
        }
    }
}

/// `xlink:href` for namespaced attributes, the bare local name otherwise.
fn attribute_name(name: &QualName) -> String {
    match &name.prefix {
        Some(prefix) => format!("{}:{}", prefix, name.local),
        None => name.local.to_string(),
    }
}

/// Converts the children of a sink node. Scripts and comments are dropped.
fn convert_children(parent: &Handle) -> Vec<Node> {
    parent
        .children
        .borrow()
        .iter()
        .filter_map(|child| match &child.data {
            SinkData::Element { name, attrs } => {
                if &*name.local == "script" {
                    return None;
                }
                let mut element = Element::new(&name.local);
                element.attrs = attrs
                    .borrow()
                    .iter()
                    .map(|a| (attribute_name(&a.name), a.value.to_string()))
                    .collect();
                element.children = convert_children(child);
                Some(Node::Element(element))
            }
            SinkData::Text(text) => Some(Node::Text(text.borrow().clone())),
            SinkData::Document | SinkData::Comment => None,
        })
        .collect()
}

/// Parses an HTML document or fragment and returns the content of its body.
///
/// Parsing follows the HTML5 error recovery rules, so every input yields a
/// tree: unclosed and misnested tags are repaired, all named character
/// references are resolved and attributes may be unquoted or valueless.
pub fn parse_fragment(input: &str) -> Vec<Node> {
    parse_document(FragmentSink::new(), ParseOpts::default())
        .from_utf8()
        .one(input.as_bytes())
}

/// Serializes nodes as an XHTML fragment.
pub fn serialize(nodes: &[Node]) -> String {
    let mut out = String::new();
    write_nodes(nodes, &mut out);
    out
}

fn write_nodes(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(&partial_escape(t.as_str())),
            Node::Element(e) => write_element(e, out),
        }
    }
}

fn write_element(element: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&element.name);
    for (key, value) in &element.attrs {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape(value.as_str()));
        out.push('"');
    }
    if element.children.is_empty() && (is_void(&element.name) || element.name == "image") {
        out.push_str("/>");
        return;
    }
    out.push('>');
    write_nodes(&element.children, out);
    out.push_str("</");
    out.push_str(&element.name);
    out.push('>');
}
