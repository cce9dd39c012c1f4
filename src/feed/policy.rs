//! Minimum-field rules a parsed entry must satisfy before it may be stored.

use super::parser::{ParsedChannel, ParsedItem};

/// An item needs a title and something to open: a link or an enclosure.
pub fn verify_item(item: &ParsedItem) -> bool {
    !item.title.is_empty() && (non_empty(&item.link) || non_empty(&item.enclosure_url))
}

/// A channel needs a title.
pub fn verify_channel(channel: &ParsedChannel) -> bool {
    !channel.title.is_empty()
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|s| !s.is_empty())
}
