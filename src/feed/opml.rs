use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use crate::util::validate_feed_url;

/// SEC-003: Maximum allowed nesting depth for OPML outline elements.
/// Prevents stack overflow attacks from maliciously crafted deeply nested OPMLs.
const MAX_OPML_DEPTH: usize = 50;

/// Errors that can occur during OPML parsing.
#[derive(Debug, Error)]
pub enum OpmlError {
    /// SEC-003: OPML nesting depth exceeds safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// XML parsing failed.
    #[error("XML parse error: {0}")]
    XmlParse(String),
}

/// A subscription extracted from an OPML `<outline xmlUrl=...>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlOutline {
    /// `title` attribute, then `text`, then the URL itself.
    pub title: String,
    pub xml_url: String,
    /// Name of the innermost folder outline containing this feed.
    pub category: Option<String>,
}

/// Read an OPML file and return its feed outlines.
///
/// Outlines with URLs rejected by [`validate_feed_url`] are skipped with a
/// warning, like any other malformed entry.
pub async fn parse(path: &str, allow_private_hosts: bool) -> Result<Vec<OpmlOutline>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read OPML file: {}", path))?;
    Ok(parse_opml_content(&content, allow_private_hosts)?)
}

/// Parse OPML text. Folder outlines (no `xmlUrl`) become the category of
/// the feeds nested under them.
pub fn parse_opml_content(
    content: &str,
    allow_private_hosts: bool,
) -> Result<Vec<OpmlOutline>, OpmlError> {
    // SEC-002: quick-xml (0.37) never parses <!ENTITY> declarations, custom
    // entities surface as `EscapeError::UnrecognizedEntity`.
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut outlines = Vec::new();
    let mut buf = Vec::new();
    // One entry per open <outline>: the folder name, or None for a feed outline.
    let mut folders: Vec<Option<String>> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                if folders.len() >= MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                let attrs = read_outline(&e, &reader)?;
                let category = current_folder(&folders);
                match attrs.xml_url {
                    Some(url) => {
                        push_feed(&mut outlines, attrs.title, url, category, allow_private_hosts);
                        folders.push(None);
                    }
                    None => folders.push(attrs.title),
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                let attrs = read_outline(&e, &reader)?;
                if let Some(url) = attrs.xml_url {
                    let category = current_folder(&folders);
                    push_feed(&mut outlines, attrs.title, url, category, allow_private_hosts);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                folders.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(outlines)
}

struct OutlineAttrs {
    title: Option<String>,
    xml_url: Option<String>,
}

fn read_outline(
    e: &quick_xml::events::BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<OutlineAttrs, OpmlError> {
    let mut attrs = OutlineAttrs {
        title: None,
        xml_url: None,
    };
    let mut text = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = || {
            attr.decode_and_unescape_value(reader.decoder())
                .map(|v| v.trim().to_string())
                .map_err(|e| OpmlError::XmlParse(e.to_string()))
        };
        match attr.key.as_ref() {
            b"xmlUrl" => attrs.xml_url = Some(value()?),
            b"title" => attrs.title = Some(value()?),
            b"text" => text = Some(value()?),
            _ => {}
        }
    }

    if attrs.title.as_deref().map_or(true, str::is_empty) {
        attrs.title = text.filter(|t| !t.is_empty());
    }
    Ok(attrs)
}

fn current_folder(folders: &[Option<String>]) -> Option<String> {
    folders.iter().rev().find_map(|f| f.clone())
}

fn push_feed(
    outlines: &mut Vec<OpmlOutline>,
    title: Option<String>,
    url: String,
    category: Option<String>,
    allow_private_hosts: bool,
) {
    // SEC-002: Validate URL before accepting
    match validate_feed_url(&url, allow_private_hosts) {
        Ok(_) => outlines.push(OpmlOutline {
            title: title.unwrap_or_else(|| url.clone()),
            xml_url: url,
            category,
        }),
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Skipping invalid feed URL");
        }
    }
}
