use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::extractors::{
    AtomExtractor, ChannelValues, DublinCoreExtractor, ItemValues, ItunesExtractor,
    NamespaceExtractor, RssExtractor, DUBLIN_CORE_NS, ITUNES_NS,
};
use super::policy;
use super::xml::{parse_document, Element, XmlError};

/// Errors that stop a feed document from producing a channel.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Root element is neither `<rss>` nor `<feed>`
    #[error("Unsupported feed format: <{0}>")]
    UnsupportedFormat(String),
    /// RSS document whose version is not 2.0
    #[error("Unsupported RSS version: {0}")]
    UnsupportedVersion(String),
    /// The channel has no title (or RSS has no `<channel>`)
    #[error("Feed has no valid channel")]
    InvalidChannel,
    /// Cancellation was observed mid-parse
    #[error("Parsing interrupted")]
    Interrupted,
    #[error(transparent)]
    Xml(#[from] XmlError),
}

/// Normalized channel produced from one feed document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedChannel {
    pub title: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub pub_date: Option<String>,
    /// Entries that passed the content policy, in document order.
    pub items: Vec<ParsedItem>,
}

/// Normalized entry; `pub_date` is kept as the raw dialect-specific string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedItem {
    pub title: String,
    pub description: Option<String>,
    pub link: Option<String>,
    pub enclosure_url: Option<String>,
    pub enclosure_length: Option<i64>,
    pub enclosure_type: Option<String>,
    pub pub_date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Rss,
    Atom,
}

impl Dialect {
    /// Identify the dialect from the root element (case-insensitive).
    pub fn detect(root: &Element) -> Result<Self, ParseError> {
        let name = root.local_name();
        if name.eq_ignore_ascii_case("rss") {
            match root.attr("version").map(str::trim) {
                Some("2.0") => Ok(Dialect::Rss),
                other => Err(ParseError::UnsupportedVersion(
                    other.unwrap_or("<missing>").to_string(),
                )),
            }
        } else if name.eq_ignore_ascii_case("feed") {
            Ok(Dialect::Atom)
        } else {
            Err(ParseError::UnsupportedFormat(root.name.clone()))
        }
    }

    fn item_tag(self) -> &'static str {
        match self {
            Dialect::Rss => "item",
            Dialect::Atom => "entry",
        }
    }
}

/// Parse raw feed bytes into a channel and its valid items.
///
/// The token is checked before every channel child and every item, and again
/// before returning; once cancelled, no partial result is produced.
pub fn parse(bytes: &[u8], cancel: &CancellationToken) -> Result<ParsedChannel, ParseError> {
    let root = parse_document(bytes)?;
    if cancel.is_cancelled() {
        return Err(ParseError::Interrupted);
    }
    parse_root(&root, cancel)
}

/// Parse an already-built document tree.
pub fn parse_root(root: &Element, cancel: &CancellationToken) -> Result<ParsedChannel, ParseError> {
    let dialect = Dialect::detect(root)?;
    let extractors = extractors_for(dialect, root);

    let channel_node = match dialect {
        Dialect::Rss => root
            .child_elements()
            .find(|e| e.local_name().eq_ignore_ascii_case("channel"))
            .ok_or(ParseError::InvalidChannel)?,
        Dialect::Atom => root,
    };

    let mut channel = ChannelValues::default();
    let mut items = Vec::new();
    let mut dropped = 0usize;

    for child in channel_node.child_elements() {
        if cancel.is_cancelled() {
            return Err(ParseError::Interrupted);
        }

        if child.name == dialect.item_tag() {
            let mut values = ItemValues::default();
            for node in child.child_elements() {
                dispatch(&extractors, |ex| ex.parse_item(node, &mut values));
            }
            let item = into_item(values);
            if policy::verify_item(&item) {
                items.push(item);
            } else {
                dropped += 1;
                tracing::debug!(title = %item.title, "Dropping entry without title or target");
            }
            continue;
        }

        dispatch(&extractors, |ex| ex.parse_channel(child, &mut channel));
    }

    let parsed = ParsedChannel {
        title: channel.title.into_inner().unwrap_or_default(),
        description: channel.description.into_inner(),
        image_url: channel.image_url.into_inner(),
        pub_date: channel.pub_date.into_inner(),
        items,
    };

    if !policy::verify_channel(&parsed) {
        return Err(ParseError::InvalidChannel);
    }
    if cancel.is_cancelled() {
        return Err(ParseError::Interrupted);
    }

    tracing::debug!(
        dialect = ?dialect,
        items = parsed.items.len(),
        dropped = dropped,
        "Parsed feed"
    );
    Ok(parsed)
}

/// Offer a node to each extractor in descending rank until one claims it.
fn dispatch<F>(extractors: &[Box<dyn NamespaceExtractor>], mut claim: F)
where
    F: FnMut(&dyn NamespaceExtractor) -> bool,
{
    for extractor in extractors {
        if claim(extractor.as_ref()) {
            return;
        }
    }
}

/// Default extractor plus the optional ones the root declares, highest rank first.
fn extractors_for(dialect: Dialect, root: &Element) -> Vec<Box<dyn NamespaceExtractor>> {
    let mut extractors: Vec<Box<dyn NamespaceExtractor>> = Vec::with_capacity(3);

    for (key, value) in &root.attributes {
        let Some(prefix) = key.strip_prefix("xmlns:") else {
            continue;
        };
        match value.trim() {
            ITUNES_NS => extractors.push(Box::new(ItunesExtractor::new(prefix))),
            DUBLIN_CORE_NS => extractors.push(Box::new(DublinCoreExtractor::new(prefix))),
            _ => {}
        }
    }

    extractors.push(match dialect {
        Dialect::Rss => Box::new(RssExtractor),
        Dialect::Atom => Box::new(AtomExtractor),
    });

    // Stable sort keeps declaration order among equal ranks.
    extractors.sort_by(|a, b| b.rank().cmp(&a.rank()));
    extractors
}

fn into_item(values: ItemValues) -> ParsedItem {
    ParsedItem {
        title: values.title.into_inner().unwrap_or_default(),
        description: values.description.into_inner(),
        link: values.link.into_inner(),
        enclosure_url: values.enclosure_url.into_inner(),
        enclosure_length: values.enclosure_length.into_inner(),
        enclosure_type: values.enclosure_type.into_inner(),
        pub_date: values.pub_date.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const PODCAST_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"
     xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd"
     xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>  Example Cast  </title>
    <description>Plain description</description>
    <itunes:summary>iTunes summary</itunes:summary>
    <image><url>http://example.com/rss.png</url></image>
    <lastBuildDate>Tue, 10 Jun 2003 09:41:01 GMT</lastBuildDate>
    <item>
      <title>Episode 1</title>
      <description>
        <![CDATA[<p>Show notes</p>]]>
      </description>
      <itunes:summary>Episode summary</itunes:summary>
      <enclosure url="http://example.com/ep1.mp3" length="1000" type="audio/mpeg"/>
      <pubDate>Mon, 09 Jun 2003 08:00:00 GMT</pubDate>
      <dc:date>2003-06-09T08:00:00Z</dc:date>
    </item>
    <item>
      <description>No title, dropped</description>
      <link>http://example.com/untitled</link>
    </item>
    <item>
      <title>Episode 2</title>
      <link>http://example.com/ep2</link>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title type="html">Ben &amp;amp; Jerry's</title>
  <subtitle>Ice cream news</subtitle>
  <icon>http://example.org/icon.png</icon>
  <updated>2005-07-31T12:29:29Z</updated>
  <entry>
    <title>Atom draft</title>
    <link rel="alternate" href="http://example.org/2005/04/02/atom"/>
    <link rel="enclosure" type="audio/mpeg" length="1337" href="http://example.org/audio/ph34r_my_podcast.mp3"/>
    <published>2003-12-13T08:29:29-04:00</published>
    <updated>2005-07-31T12:29:29Z</updated>
    <summary>Short</summary>
    <content type="xhtml"><div><p>Full <b>body</b></p></div></content>
  </entry>
</feed>"#;

    fn parse_str(xml: &str) -> Result<ParsedChannel, ParseError> {
        parse(xml.as_bytes(), &CancellationToken::new())
    }

    #[test]
    fn test_rss_channel_fields_and_namespace_priority() {
        let channel = parse_str(PODCAST_RSS).unwrap();
        assert_eq!(channel.title, "Example Cast");
        // iTunes (rank 2) beats the plain description regardless of order.
        assert_eq!(channel.description.as_deref(), Some("iTunes summary"));
        assert_eq!(channel.image_url.as_deref(), Some("http://example.com/rss.png"));
        assert_eq!(
            channel.pub_date.as_deref(),
            Some("Tue, 10 Jun 2003 09:41:01 GMT")
        );
    }

    #[test]
    fn test_rss_items_in_document_order_and_invalid_dropped() {
        let channel = parse_str(PODCAST_RSS).unwrap();
        let titles: Vec<_> = channel.items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["Episode 1", "Episode 2"]);

        let first = &channel.items[0];
        assert_eq!(first.description.as_deref(), Some("Episode summary"));
        assert_eq!(first.enclosure_url.as_deref(), Some("http://example.com/ep1.mp3"));
        assert_eq!(first.enclosure_length, Some(1000));
        assert_eq!(first.enclosure_type.as_deref(), Some("audio/mpeg"));
        // dc:date (rank 1) outranks pubDate (rank 0).
        assert_eq!(first.pub_date.as_deref(), Some("2003-06-09T08:00:00Z"));
    }

    #[test]
    fn test_higher_rank_wins_when_it_appears_first() {
        let xml = r#"<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd">
<channel><title>C</title>
<item><title>I</title><link>http://x</link>
<itunes:summary>winner</itunes:summary><description>loser</description></item>
</channel></rss>"#;
        let channel = parse_str(xml).unwrap();
        assert_eq!(channel.items[0].description.as_deref(), Some("winner"));
    }

    #[test]
    fn test_undeclared_namespace_nodes_ignored() {
        let xml = r#"<rss version="2.0"><channel><title>C</title>
<item><title>I</title><link>http://x</link>
<itunes:summary>ignored</itunes:summary><description>kept</description></item>
</channel></rss>"#;
        let channel = parse_str(xml).unwrap();
        assert_eq!(channel.items[0].description.as_deref(), Some("kept"));
    }

    #[test]
    fn test_cdata_description_used() {
        let xml = r#"<rss version="2.0"><channel><title>C</title>
<item><title>I</title><link>http://x</link>
<description>
   <![CDATA[part one, ]]><![CDATA[part two]]>
</description></item></channel></rss>"#;
        let channel = parse_str(xml).unwrap();
        assert_eq!(
            channel.items[0].description.as_deref(),
            Some("part one, part two")
        );
    }

    #[test]
    fn test_atom_feed_routes_to_atom_dialect() {
        let channel = parse_str(ATOM).unwrap();
        assert_eq!(channel.title, "Ben & Jerry's");
        assert_eq!(channel.description.as_deref(), Some("Ice cream news"));
        assert_eq!(channel.image_url.as_deref(), Some("http://example.org/icon.png"));

        let entry = &channel.items[0];
        assert_eq!(entry.link.as_deref(), Some("http://example.org/2005/04/02/atom"));
        assert_eq!(
            entry.enclosure_url.as_deref(),
            Some("http://example.org/audio/ph34r_my_podcast.mp3")
        );
        assert_eq!(entry.enclosure_length, Some(1337));
        assert_eq!(entry.pub_date.as_deref(), Some("2005-07-31T12:29:29Z"));
        assert_eq!(entry.description.as_deref(), Some("Full body"));
    }

    #[test]
    fn test_root_name_is_case_insensitive() {
        let xml = r#"<FEED><title>Upper</title></FEED>"#;
        assert_eq!(parse_str(xml).unwrap().title, "Upper");
        let xml = r#"<RSS version="2.0"><channel><title>Upper</title></channel></RSS>"#;
        assert_eq!(parse_str(xml).unwrap().title, "Upper");
    }

    #[test]
    fn test_rss_version_1_rejected() {
        let xml = r#"<rss version="1.0"><channel><title>C</title></channel></rss>"#;
        match parse_str(xml) {
            Err(ParseError::UnsupportedVersion(v)) => assert_eq!(v, "1.0"),
            other => panic!("Expected UnsupportedVersion, got {:?}", other),
        }
    }

    #[test]
    fn test_rss_missing_version_rejected() {
        let xml = r#"<rss><channel><title>C</title></channel></rss>"#;
        assert!(matches!(parse_str(xml), Err(ParseError::UnsupportedVersion(_))));
    }

    #[test]
    fn test_unknown_root_rejected() {
        let xml = r#"<rdf:RDF xmlns:rdf="x"><channel/></rdf:RDF>"#;
        assert!(matches!(parse_str(xml), Err(ParseError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_channel_without_title_aborts() {
        let xml = r#"<rss version="2.0"><channel>
<item><title>I</title><link>http://x</link></item></channel></rss>"#;
        assert!(matches!(parse_str(xml), Err(ParseError::InvalidChannel)));
    }

    #[test]
    fn test_rss_without_channel_is_invalid() {
        let xml = r#"<rss version="2.0"></rss>"#;
        assert!(matches!(parse_str(xml), Err(ParseError::InvalidChannel)));
    }

    #[test]
    fn test_malformed_xml_is_an_xml_error() {
        assert!(matches!(parse_str("<not valid xml"), Err(ParseError::Xml(_))));
    }

    #[test]
    fn test_cancelled_token_interrupts() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            parse(PODCAST_RSS.as_bytes(), &token),
            Err(ParseError::Interrupted)
        ));
    }

    #[test]
    fn test_extractor_order_is_rank_descending() {
        let root = parse_document(PODCAST_RSS.as_bytes()).unwrap();
        let ranks: Vec<u8> = extractors_for(Dialect::Rss, &root)
            .iter()
            .map(|e| e.rank())
            .collect();
        assert_eq!(ranks, vec![2, 1, 0]);
    }

    proptest! {
        // Parsing is a pure function of the bytes.
        #[test]
        fn prop_parse_is_deterministic(
            titles in proptest::collection::vec("[A-Za-z0-9 ]{0,12}", 0..8),
            swap_order in any::<bool>(),
        ) {
            let mut body = String::from(
                r#"<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd"><channel><title>P</title>"#,
            );
            for (i, title) in titles.iter().enumerate() {
                let a = format!("<description>d{i}</description>");
                let b = format!("<itunes:summary>s{i}</itunes:summary>");
                let (first, second) = if swap_order { (b, a) } else { (a, b) };
                body.push_str(&format!(
                    "<item><title>{title}</title><link>http://x/{i}</link>{first}{second}</item>"
                ));
            }
            body.push_str("</channel></rss>");

            let once = parse_str(&body).unwrap();
            let twice = parse_str(&body).unwrap();
            prop_assert_eq!(&once, &twice);
            for item in &once.items {
                prop_assert!(item.description.as_deref().unwrap().starts_with('s'));
            }
        }
    }
}
