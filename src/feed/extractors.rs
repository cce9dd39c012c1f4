//! Namespace extractors: each one claims the nodes of a single XML namespace
//! and writes them into the channel/item accumulators at its own rank.

use super::value::{NodeValue, Priority};
use super::xml::{decode_html_entities, Element};

pub(crate) const DEFAULT_RANK: u8 = 0;
pub(crate) const DUBLIN_CORE_RANK: u8 = 1;
pub(crate) const ITUNES_RANK: u8 = 2;

pub(crate) const DUBLIN_CORE_NS: &str = "http://purl.org/dc/elements/1.1/";
pub(crate) const ITUNES_NS: &str = "http://www.itunes.com/dtds/podcast-1.0.dtd";

/// Channel-level fields collected while walking the channel node.
#[derive(Debug, Default)]
pub(crate) struct ChannelValues {
    pub title: NodeValue<String>,
    pub description: NodeValue<String>,
    pub image_url: NodeValue<String>,
    pub pub_date: NodeValue<String>,
}

/// Item-level fields; a fresh accumulator is used for every item/entry.
#[derive(Debug, Default)]
pub(crate) struct ItemValues {
    pub title: NodeValue<String>,
    pub description: NodeValue<String>,
    pub link: NodeValue<String>,
    pub enclosure_url: NodeValue<String>,
    pub enclosure_length: NodeValue<i64>,
    pub enclosure_type: NodeValue<String>,
    pub pub_date: NodeValue<String>,
}

/// A prioritized rule-set for one namespace.
///
/// `parse_channel`/`parse_item` return `false` for nodes the extractor does
/// not recognise so the parser can offer the node to the next extractor.
pub(crate) trait NamespaceExtractor: Send + Sync {
    fn rank(&self) -> u8;

    fn parse_channel(&self, node: &Element, values: &mut ChannelValues) -> bool;

    fn parse_item(&self, node: &Element, values: &mut ItemValues) -> bool;

    fn priority(&self, node_rank: u8) -> Priority {
        Priority::new(self.rank(), node_rank)
    }
}

// ============================================================================
// RSS 2.0
// ============================================================================

pub(crate) struct RssExtractor;

impl NamespaceExtractor for RssExtractor {
    fn rank(&self) -> u8 {
        DEFAULT_RANK
    }

    fn parse_channel(&self, node: &Element, values: &mut ChannelValues) -> bool {
        match node.name.as_str() {
            "title" => values.title.set_text(self.priority(0), node.text(false)),
            "description" => values
                .description
                .set_text(self.priority(0), node.text(false)),
            "image" => {
                if let Some(url) = node.first_child("url") {
                    values.image_url.set_text(self.priority(0), url.text(false));
                }
                true
            }
            "pubDate" => values.pub_date.set_text(self.priority(0), node.text(false)),
            "lastBuildDate" => values.pub_date.set_text(self.priority(1), node.text(false)),
            _ => return false,
        };
        true
    }

    fn parse_item(&self, node: &Element, values: &mut ItemValues) -> bool {
        match node.name.as_str() {
            "title" => values.title.set_text(self.priority(0), node.text(false)),
            "link" => values.link.set_text(self.priority(1), node.text(false)),
            "guid" => {
                // A permalink guid stands in for a missing <link>.
                let permalink = node
                    .attr("isPermaLink")
                    .map_or(true, |v| v.eq_ignore_ascii_case("true"));
                if permalink {
                    values.link.set_text(self.priority(0), node.text(false));
                }
                true
            }
            "description" => values
                .description
                .set_text(self.priority(0), node.text(false)),
            "enclosure" => {
                set_enclosure(self.priority(0), node, "url", values);
                true
            }
            "pubDate" => values.pub_date.set_text(self.priority(0), node.text(false)),
            _ => return false,
        };
        true
    }
}

// ============================================================================
// Atom
// ============================================================================

pub(crate) struct AtomExtractor;

impl AtomExtractor {
    /// Atom text constructs carry their encoding in `type`.
    fn text(node: &Element) -> String {
        match node.attr("type") {
            Some("xhtml") => {
                let inner = node.deep_text();
                decode_html_entities(&inner).into_owned()
            }
            Some("html") => node.text(true),
            _ => node.text(false),
        }
    }
}

impl NamespaceExtractor for AtomExtractor {
    fn rank(&self) -> u8 {
        DEFAULT_RANK
    }

    fn parse_channel(&self, node: &Element, values: &mut ChannelValues) -> bool {
        match node.name.as_str() {
            "title" => values.title.set_text(self.priority(0), Self::text(node)),
            "subtitle" => values
                .description
                .set_text(self.priority(0), Self::text(node)),
            "icon" => values.image_url.set_text(self.priority(0), node.text(false)),
            "logo" => values.image_url.set_text(self.priority(1), node.text(false)),
            "published" => values.pub_date.set_text(self.priority(0), node.text(false)),
            "updated" => values.pub_date.set_text(self.priority(1), node.text(false)),
            _ => return false,
        };
        true
    }

    fn parse_item(&self, node: &Element, values: &mut ItemValues) -> bool {
        match node.name.as_str() {
            "title" => values.title.set_text(self.priority(0), Self::text(node)),
            "link" => {
                match node.attr("rel") {
                    Some("enclosure") => set_enclosure(self.priority(0), node, "href", values),
                    None | Some("alternate") => {
                        if let Some(href) = node.attr("href") {
                            values.link.set_text(self.priority(0), href.trim().to_string());
                        }
                    }
                    // self, related, replies...
                    Some(_) => {}
                }
                true
            }
            "summary" => values
                .description
                .set_text(self.priority(0), Self::text(node)),
            "content" => values
                .description
                .set_text(self.priority(1), Self::text(node)),
            "published" => values.pub_date.set_text(self.priority(0), node.text(false)),
            "updated" => values.pub_date.set_text(self.priority(1), node.text(false)),
            _ => return false,
        };
        true
    }
}

// ============================================================================
// Dublin Core
// ============================================================================

pub(crate) struct DublinCoreExtractor {
    prefix: String,
}

impl DublinCoreExtractor {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl NamespaceExtractor for DublinCoreExtractor {
    fn rank(&self) -> u8 {
        DUBLIN_CORE_RANK
    }

    fn parse_channel(&self, node: &Element, values: &mut ChannelValues) -> bool {
        let Some(local) = local_in(node, &self.prefix) else {
            return false;
        };
        match local {
            "title" => values.title.set_text(self.priority(0), node.text(false)),
            "description" => values
                .description
                .set_text(self.priority(0), node.text(false)),
            "date" => values.pub_date.set_text(self.priority(0), node.text(false)),
            _ => return false,
        };
        true
    }

    fn parse_item(&self, node: &Element, values: &mut ItemValues) -> bool {
        let Some(local) = local_in(node, &self.prefix) else {
            return false;
        };
        match local {
            "title" => values.title.set_text(self.priority(0), node.text(false)),
            "description" => values
                .description
                .set_text(self.priority(0), node.text(false)),
            "date" => values.pub_date.set_text(self.priority(0), node.text(false)),
            _ => return false,
        };
        true
    }
}

// ============================================================================
// iTunes podcast extensions
// ============================================================================

pub(crate) struct ItunesExtractor {
    prefix: String,
}

impl ItunesExtractor {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl NamespaceExtractor for ItunesExtractor {
    fn rank(&self) -> u8 {
        ITUNES_RANK
    }

    fn parse_channel(&self, node: &Element, values: &mut ChannelValues) -> bool {
        let Some(local) = local_in(node, &self.prefix) else {
            return false;
        };
        match local {
            "subtitle" => values
                .description
                .set_text(self.priority(0), node.text(false)),
            "summary" => values
                .description
                .set_text(self.priority(1), node.text(false)),
            "image" => match node.attr("href") {
                Some(href) => values
                    .image_url
                    .set_text(self.priority(0), href.trim().to_string()),
                None => false,
            },
            _ => return false,
        };
        true
    }

    fn parse_item(&self, node: &Element, values: &mut ItemValues) -> bool {
        let Some(local) = local_in(node, &self.prefix) else {
            return false;
        };
        match local {
            "subtitle" => values
                .description
                .set_text(self.priority(0), node.text(false)),
            "summary" => values
                .description
                .set_text(self.priority(1), node.text(false)),
            _ => return false,
        };
        true
    }
}

/// Local part of `node`'s name when it lives under `prefix`.
fn local_in<'a>(node: &'a Element, prefix: &str) -> Option<&'a str> {
    node.name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(':'))
}

fn set_enclosure(priority: Priority, node: &Element, url_attr: &str, values: &mut ItemValues) {
    if let Some(url) = node.attr(url_attr) {
        values.enclosure_url.set_text(priority, url.trim().to_string());
    }
    if let Some(length) = node.attr("length").and_then(|l| l.trim().parse::<i64>().ok()) {
        values.enclosure_length.set(priority, length);
    }
    if let Some(mime) = node.attr("type") {
        values
            .enclosure_type
            .set_text(priority, mime.trim().to_string());
    }
}
