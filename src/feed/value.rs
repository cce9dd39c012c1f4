//! Priority-ordered field slots used while reducing a feed document.
//!
//! Several namespace extractors can claim the same logical field (an item's
//! description may come from `<description>`, `<itunes:summary>` or
//! `<dc:description>`). Each write carries a [`Priority`]; a slot only accepts
//! writes whose priority is at least the one already stored, so the final
//! value does not depend on document order.

/// Rank of a write: namespace first, then the node's rank inside its namespace.
///
/// Ordering is lexicographic, so any write from a higher-ranked namespace beats
/// every write from a lower-ranked one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority {
    pub namespace: u8,
    pub node: u8,
}

impl Priority {
    pub const fn new(namespace: u8, node: u8) -> Self {
        Self { namespace, node }
    }
}

/// A single logical field together with the priority of its current winner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeValue<T> {
    slot: Option<(Priority, T)>,
}

impl<T> Default for NodeValue<T> {
    fn default() -> Self {
        Self { slot: None }
    }
}

impl<T> NodeValue<T> {
    /// Store `value` unless a strictly higher priority already holds the slot.
    ///
    /// Returns whether the write was accepted. Equal priorities overwrite, so
    /// the last node of the same rank wins.
    pub fn set(&mut self, priority: Priority, value: T) -> bool {
        match &self.slot {
            Some((current, _)) if priority < *current => false,
            _ => {
                self.slot = Some((priority, value));
                true
            }
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.slot.as_ref().map(|(_, v)| v)
    }

    pub fn priority(&self) -> Option<Priority> {
        self.slot.as_ref().map(|(p, _)| *p)
    }

    pub fn is_set(&self) -> bool {
        self.slot.is_some()
    }

    pub fn into_inner(self) -> Option<T> {
        self.slot.map(|(_, v)| v)
    }
}

impl NodeValue<String> {
    /// Like [`NodeValue::set`] but ignores empty text, so a blank node from a
    /// high-priority namespace never erases a real value.
    pub fn set_text(&mut self, priority: Priority, text: String) -> bool {
        if text.is_empty() {
            return false;
        }
        self.set(priority, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_slot_accepts_any_priority() {
        let mut v = NodeValue::default();
        assert!(v.set(Priority::new(0, 0), "a"));
        assert_eq!(v.get(), Some(&"a"));
    }

    #[test]
    fn test_lower_priority_rejected() {
        let mut v = NodeValue::default();
        v.set(Priority::new(2, 0), "itunes");
        assert!(!v.set(Priority::new(0, 5), "default"));
        assert_eq!(v.get(), Some(&"itunes"));
    }

    #[test]
    fn test_equal_priority_overwrites() {
        let mut v = NodeValue::default();
        v.set(Priority::new(1, 1), "first");
        assert!(v.set(Priority::new(1, 1), "second"));
        assert_eq!(v.into_inner(), Some("second"));
    }

    #[test]
    fn test_node_rank_breaks_ties_within_namespace() {
        let mut v = NodeValue::default();
        v.set(Priority::new(0, 1), "updated");
        assert!(!v.set(Priority::new(0, 0), "published"));
        assert_eq!(v.get(), Some(&"updated"));
    }

    #[test]
    fn test_set_text_ignores_empty() {
        let mut v = NodeValue::default();
        v.set_text(Priority::new(0, 0), "kept".to_string());
        assert!(!v.set_text(Priority::new(2, 0), String::new()));
        assert_eq!(v.get().map(String::as_str), Some("kept"));
    }

    proptest! {
        // Whatever the write order, the survivor is the last write among those
        // sharing the maximum priority.
        #[test]
        fn prop_winner_is_last_of_max_priority(
            writes in proptest::collection::vec((0u8..3, 0u8..3, 0u32..1000), 1..20)
        ) {
            let mut v = NodeValue::default();
            for (ns, node, value) in &writes {
                v.set(Priority::new(*ns, *node), *value);
            }
            let max = writes.iter().map(|(ns, node, _)| Priority::new(*ns, *node)).max().unwrap();
            let expected = writes
                .iter()
                .filter(|(ns, node, _)| Priority::new(*ns, *node) == max)
                .map(|(_, _, value)| *value)
                .last()
                .unwrap();
            prop_assert_eq!(v.priority(), Some(max));
            prop_assert_eq!(v.get(), Some(&expected));
        }
    }
}
