//! The four collections every record lives in.
//!
//! A record is listed in exactly one collection once it has an address or a connection state:
//!
//! * `Listen`: listeners accepting connections.
//! * `Bound`: records with a local port that are neither listening nor connected.
//! * `Active`: connections from SYN-SENT/SYN-RCVD up to LAST-ACK.
//! * `TimeWait`: connections waiting out twice the maximum segment lifetime.
//!
//! The collections are singly linked lists threaded through the records themselves. New members
//! are prepended. Removal and insertion on the two swept collections always notify the cursor of
//! an ongoing timer sweep.
use crate::managed::{Key, SlotMap};

use super::cursor::{Cursor, Links};
use super::pcb::{Base, Connection, Listener};

/// The index of a connection record.
///
/// Useful for storing in other structs to reference the connection at another point in time. Note
/// that the key will be invalidated when the connection itself is freed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionKey(pub(crate) Key);

/// The index of a listener record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerKey(pub(crate) Key);

/// The index of any record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PcbKey {
    /// A listener.
    Listener(ListenerKey),
    /// A connection.
    Connection(ConnectionKey),
}

/// Names one of the four collections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Collection {
    /// Listening records.
    Listen,
    /// Bound but otherwise unused records.
    Bound,
    /// Synchronizing, synchronized and closing connections.
    Active,
    /// Connections in time-wait.
    TimeWait,
}

/// The record storage.
pub(crate) struct Pools<'a> {
    pub(crate) listeners: SlotMap<'a, Listener>,
    pub(crate) connections: SlotMap<'a, Connection>,
}

/// Heads of the collections and the sweep cursor.
#[derive(Default)]
pub(crate) struct Registry {
    heads: [Option<PcbKey>; 4],
    cursor: Cursor<PcbKey>,
}

/// Walks a collection by following the links.
pub(crate) struct Iter<'r> {
    pools: &'r Pools<'r>,
    next: Option<PcbKey>,
}

impl Collection {
    /// All collections, in the order duplicate checks visit them.
    pub const ALL: [Collection; 4] = [
        Collection::Listen,
        Collection::Bound,
        Collection::Active,
        Collection::TimeWait,
    ];

    fn index(self) -> usize {
        match self {
            Collection::Listen => 0,
            Collection::Bound => 1,
            Collection::Active => 2,
            Collection::TimeWait => 3,
        }
    }

    /// Collections walked by the timers, which need cursor notifications.
    fn is_swept(self) -> bool {
        match self {
            Collection::Active | Collection::TimeWait => true,
            _ => false,
        }
    }
}

impl PcbKey {
    /// The connection key, if this refers to a connection.
    pub fn connection(self) -> Option<ConnectionKey> {
        match self {
            PcbKey::Connection(key) => Some(key),
            PcbKey::Listener(_) => None,
        }
    }

    /// The listener key, if this refers to a listener.
    pub fn listener(self) -> Option<ListenerKey> {
        match self {
            PcbKey::Listener(key) => Some(key),
            PcbKey::Connection(_) => None,
        }
    }
}

impl From<ConnectionKey> for PcbKey {
    fn from(key: ConnectionKey) -> Self {
        PcbKey::Connection(key)
    }
}

impl From<ListenerKey> for PcbKey {
    fn from(key: ListenerKey) -> Self {
        PcbKey::Listener(key)
    }
}

impl Pools<'_> {
    pub(crate) fn base(&self, key: PcbKey) -> Option<&Base> {
        match key {
            PcbKey::Listener(key) => self.listeners.get(key.0).map(|l| &l.base),
            PcbKey::Connection(key) => self.connections.get(key.0).map(|c| &c.base),
        }
    }

    pub(crate) fn base_mut(&mut self, key: PcbKey) -> Option<&mut Base> {
        match key {
            PcbKey::Listener(key) => self.listeners.get_mut(key.0).map(|l| &mut l.base),
            PcbKey::Connection(key) => self.connections.get_mut(key.0).map(|c| &mut c.base),
        }
    }

    fn listed_base_mut(&mut self, key: PcbKey) -> &mut Base {
        match self.base_mut(key) {
            Some(base) => base,
            None => panic!("Collection links to a freed record {:?}", key),
        }
    }
}

impl Links<PcbKey> for Pools<'_> {
    fn next_of(&self, key: PcbKey) -> Option<PcbKey> {
        self.base(key).and_then(|base| base.link.next)
    }
}

impl Registry {
    pub(crate) fn head(&self, collection: Collection) -> Option<PcbKey> {
        self.heads[collection.index()]
    }

    /// Prepend a record to a collection.
    ///
    /// # Panics
    /// This function panics if the record is already a member of some collection.
    pub(crate) fn register(&mut self, pools: &mut Pools, collection: Collection, key: PcbKey) {
        let head = self.head(collection);
        if collection.is_swept() {
            self.cursor.will_prepend(key, head);
        }

        let base = pools.listed_base_mut(key);
        assert!(base.link.collection.is_none(),
            "Record {:?} is already listed in {:?}", key, base.link.collection);
        base.link.next = head;
        base.link.collection = Some(collection);
        self.heads[collection.index()] = Some(key);
    }

    /// Unlink a record from a collection.
    ///
    /// When the predecessor is known it is used instead of searching the collection.
    ///
    /// # Panics
    /// This function panics if the record is not a member of the collection.
    pub(crate) fn remove(
        &mut self,
        pools: &mut Pools,
        collection: Collection,
        key: PcbKey,
        prev: Option<PcbKey>,
    ) {
        let head = self.head(collection);
        let next = match pools.base(key) {
            Some(base) if base.link.collection == Some(collection) => base.link.next,
            Some(base) => panic!("Record {:?} is listed in {:?}, not in {:?}",
                key, base.link.collection, collection),
            None => panic!("Removing freed record {:?} from {:?}", key, collection),
        };

        if collection.is_swept() {
            self.cursor.will_remove(key, head, &*pools);
        }

        match prev {
            Some(prev) => {
                let before = pools.listed_base_mut(prev);
                assert_eq!(before.link.next, Some(key), "Wrong predecessor given for removal");
                before.link.next = next;
            },
            None if head == Some(key) => {
                self.heads[collection.index()] = next;
            },
            None => {
                let mut at = head;
                loop {
                    let element = match at {
                        Some(element) => element,
                        None => panic!("Record {:?} not found in {:?}", key, collection),
                    };
                    let base = pools.listed_base_mut(element);
                    if base.link.next == Some(key) {
                        base.link.next = next;
                        break;
                    }
                    at = base.link.next;
                }
            },
        }

        let base = pools.listed_base_mut(key);
        base.link.next = None;
        base.link.collection = None;
    }

    /// Iterate over the members of a collection.
    pub(crate) fn iter<'r>(&self, pools: &'r Pools<'r>, collection: Collection) -> Iter<'r> {
        Iter {
            pools,
            next: self.head(collection),
        }
    }

    /// Find the first member of any of the collections that satisfies a predicate.
    pub(crate) fn find(
        &self,
        pools: &Pools,
        collections: &[Collection],
        mut predicate: impl FnMut(PcbKey, &Base) -> bool,
    ) -> Option<PcbKey> {
        for &collection in collections {
            for key in self.iter(pools, collection) {
                if let Some(base) = pools.base(key) {
                    if predicate(key, base) {
                        return Some(key);
                    }
                }
            }
        }
        None
    }

    /// Begin a sweep over a collection.
    pub(crate) fn sweep_start(&mut self, collection: Collection) {
        let head = self.head(collection);
        self.cursor.start(head);
    }

    /// The next record of the sweep.
    pub(crate) fn sweep_next(&mut self, pools: &Pools) -> Option<PcbKey> {
        self.cursor.next(pools)
    }

    /// The predecessor of the record last returned by the sweep.
    pub(crate) fn sweep_prev(&self) -> Option<PcbKey> {
        self.cursor.prev()
    }
}

impl Iterator for Iter<'_> {
    type Item = PcbKey;

    fn next(&mut self) -> Option<PcbKey> {
        let key = self.next?;
        self.next = self.pools.next_of(key);
        Some(key)
    }
}
