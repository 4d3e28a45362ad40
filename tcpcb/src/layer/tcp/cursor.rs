//! A traversal of a singly linked collection that tolerates modification.
//!
//! Timer sweeps walk the active and time-wait collections and may, for every element, invoke
//! application hooks that free arbitrary other records or open new connections. A plain iterator
//! would be left pointing at freed memory or skip elements. The cursor instead is told about every
//! removal and every prepend before it happens and repairs itself.
//!
//! The guarantee: every element that is in the collection when the traversal starts and is not
//! removed before the cursor reaches it is returned exactly once. Elements prepended during the
//! traversal are never returned.

/// Access to the successor links of a collection.
pub(crate) trait Links<K> {
    /// The element following `key`.
    fn next_of(&self, key: K) -> Option<K>;
}

/// The traversal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Cursor<K> {
    current: Option<K>,
    prev: Option<K>,
    next_is_current: bool,
}

impl<K: Copy + PartialEq> Cursor<K> {
    /// Begin a traversal at the head of a collection.
    pub(crate) fn start(&mut self, head: Option<K>) {
        self.current = head;
        self.prev = None;
        self.next_is_current = true;
    }

    /// Advance and return the element to process.
    pub(crate) fn next(&mut self, links: &impl Links<K>) -> Option<K> {
        if self.next_is_current {
            self.next_is_current = false;
        } else {
            let current = self.current?;
            self.prev = Some(current);
            self.current = links.next_of(current);
        }

        self.current
    }

    /// The predecessor of the element last returned, if it is still in the collection.
    pub(crate) fn prev(&self) -> Option<K> {
        self.prev
    }

    /// Must be called before `key` is unlinked from the collection starting at `head`.
    pub(crate) fn will_remove(&mut self, key: K, head: Option<K>, links: &impl Links<K>) {
        let current = match self.current {
            Some(current) => current,
            None => return,
        };

        if key == current {
            self.current = links.next_of(key);
            self.next_is_current = true;
        } else if Some(key) == self.prev {
            debug_assert!(links.next_of(key) == Some(current));
            // Find the element before the removed one, the list is singly linked.
            let mut before = None;
            let mut at = head;
            while let Some(element) = at {
                if element == key {
                    break;
                }
                before = Some(element);
                at = links.next_of(element);
            }
            assert!(at.is_some(), "Predecessor of the cursor is not in its collection");
            self.prev = before;
        }
    }

    /// Must be called before `key` becomes the new head of the collection starting at `head`.
    pub(crate) fn will_prepend(&mut self, key: K, head: Option<K>) {
        if head.is_some() && head == self.current {
            assert!(self.prev.is_none(), "The head of a collection has no predecessor");
            self.prev = Some(key);
        }
    }
}

impl<K> Default for Cursor<K> {
    fn default() -> Self {
        Cursor {
            current: None,
            prev: None,
            next_is_current: true,
        }
    }
}
