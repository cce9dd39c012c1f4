//! Minimal owned XML tree built on top of `quick-xml`.
//!
//! Feed extraction needs random access to children, attributes and the mix
//! of text and CDATA nodes inside one element, so the event stream is folded
//! into a small DOM first. Namespace prefixes are kept verbatim in element
//! names (`itunes:summary`); extractors match on the prefix the document
//! declared.

use std::borrow::Cow;

use quick_xml::escape::{resolve_html5_entity, unescape_with};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// SEC-003: Maximum element nesting accepted from a remote document.
const MAX_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("Malformed XML at byte {position}: {message}")]
    Syntax { position: u64, message: String },

    #[error("Document has no root element")]
    NoRoot,

    #[error("Element <{0}> is never closed")]
    Unclosed(String),

    #[error("XML nesting depth exceeds maximum of {0} levels")]
    TooDeep(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    /// Qualified name as written in the document, prefix included.
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    /// Name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        self.name
            .rsplit_once(':')
            .map_or(self.name.as_str(), |(_, local)| local)
    }

    /// Prefix of the element name, if any.
    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(prefix, _)| prefix)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn first_child(&self, name: &str) -> Option<&Element> {
        self.child_elements().find(|e| e.name == name)
    }

    /// Text content of this element, normalised for feed fields.
    ///
    /// - Text nodes are used when at least one of them is non-blank; CDATA
    ///   sections interleaved with them are kept in document order.
    /// - With only blank text (pretty-printing) and one or more CDATA
    ///   sections, the CDATA contents are concatenated. Feeds split long
    ///   bodies across adjacent sections, so every section counts.
    /// - `html` additionally decodes HTML entities left after XML unescaping.
    /// - The result is trimmed of the indentation around it.
    pub fn text(&self, html: bool) -> String {
        let has_text = self
            .children
            .iter()
            .any(|n| matches!(n, Node::Text(t) if !t.trim().is_empty()));

        let mut out = String::new();
        for node in &self.children {
            match node {
                Node::Text(t) if has_text => out.push_str(t),
                Node::CData(c) => out.push_str(c),
                _ => {}
            }
        }

        let trimmed = out.trim();
        if html {
            decode_html_entities(trimmed).trim().to_string()
        } else {
            trimmed.to_string()
        }
    }

    /// Concatenated text of every descendant, used for inline XHTML bodies.
    pub fn deep_text(&self) -> String {
        fn collect(element: &Element, out: &mut String) {
            for node in &element.children {
                match node {
                    Node::Element(e) => collect(e, out),
                    Node::Text(t) | Node::CData(t) => out.push_str(t),
                }
            }
        }
        let mut out = String::new();
        collect(self, &mut out);
        out.trim().to_string()
    }
}

/// Parse a complete document and return its root element.
///
/// Bytes are decoded as UTF-8 (lossy) with an optional BOM. Comments,
/// processing instructions and the DOCTYPE are skipped.
pub fn parse_document(bytes: &[u8]) -> Result<Element, XmlError> {
    let decoded = String::from_utf8_lossy(bytes);
    let content = decoded.strip_prefix('\u{feff}').unwrap_or(&decoded);

    // SEC-002: quick-xml (0.37) never expands <!ENTITY> declarations; unknown
    // entities surface as unescape errors and fall back to HTML decoding.
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| XmlError::Syntax {
                position: reader.error_position() as u64,
                message: e.to_string(),
            })?;

        match event {
            Event::Start(e) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(XmlError::TooDeep(MAX_DEPTH));
                }
                stack.push(element_from_start(&e, &reader));
            }
            Event::Empty(e) => {
                let element = element_from_start(&e, &reader);
                attach(&mut stack, &mut root, element);
            }
            Event::End(_) => {
                // quick-xml already verified the end tag matches the open one.
                if let Some(element) = stack.pop() {
                    attach(&mut stack, &mut root, element);
                }
            }
            Event::Text(e) => {
                if let Some(parent) = stack.last_mut() {
                    let text = match e.unescape() {
                        Ok(text) => text.into_owned(),
                        Err(_) => {
                            let raw = String::from_utf8_lossy(&e);
                            decode_html_entities(&raw).into_owned()
                        }
                    };
                    parent.children.push(Node::Text(text));
                }
            }
            Event::CData(e) => {
                if let Some(parent) = stack.last_mut() {
                    let text = String::from_utf8_lossy(&e).into_owned();
                    parent.children.push(Node::CData(text));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.pop() {
        return Err(XmlError::Unclosed(open.name));
    }
    root.ok_or(XmlError::NoRoot)
}

/// Decode HTML named and numeric character references. Text with an
/// unknown reference is returned unchanged.
pub(crate) fn decode_html_entities(raw: &str) -> Cow<'_, str> {
    unescape_with(raw, resolve_html5_entity).unwrap_or(Cow::Borrowed(raw))
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        // Anything after the first root element is ignored.
        None if root.is_none() => *root = Some(element),
        None => {}
    }
}

fn element_from_start(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Element {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attributes = Vec::new();

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(err) => {
                tracing::debug!(element = %name, error = %err, "Skipping malformed attribute");
                continue;
            }
        };
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = match attr.decode_and_unescape_value(reader.decoder()) {
            Ok(value) => value.into_owned(),
            Err(_) => {
                let raw: Cow<'_, str> = String::from_utf8_lossy(attr.value.as_ref());
                decode_html_entities(&raw).into_owned()
            }
        };
        attributes.push((key, value));
    }

    Element {
        name,
        attributes,
        children: Vec::new(),
    }
}
