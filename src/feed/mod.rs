//! Feed document handling: XML tree, namespace extractors, parser and
//! content policy.
//!
//! - [`xml`] - owned element tree built with `quick-xml`
//! - [`value`] - priority-ordered field slots ([`NodeValue`])
//! - [`parser`] - dialect detection (RSS 2.0 / Atom) and extractor dispatch
//! - [`policy`] - minimum-field rules for channels and items
//! - [`opml`] - subscription list import
//!
//! # Example
//!
//! ```
//! use feedsync::feed::parse;
//! use tokio_util::sync::CancellationToken;
//!
//! let xml = br#"<rss version="2.0"><channel><title>News</title>
//!   <item><title>Hello</title><link>https://example.com/1</link></item>
//! </channel></rss>"#;
//! let channel = parse(xml, &CancellationToken::new()).unwrap();
//! assert_eq!(channel.items[0].title, "Hello");
//! ```

mod extractors;
pub mod opml;
mod parser;
pub mod policy;
pub mod value;
pub mod xml;

pub use opml::{OpmlError, OpmlOutline};
pub use parser::{parse, parse_root, Dialect, ParseError, ParsedChannel, ParsedItem};
pub use value::{NodeValue, Priority};
