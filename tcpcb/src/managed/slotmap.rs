use alloc::vec::Vec;

use super::Slice;

/// Bookkeeping for one element of a `SlotMap`.
///
/// The benefit of separating this struct from the elements is that it is unconditionally `Copy`
/// and `Default`, so storage for it can be created without knowing anything about the elements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Slot {
    /// The generation of the slot.
    ///
    /// Advanced every time the element is removed, which invalidates all keys given out for it.
    generation: u32,

    /// Whether the element is currently handed out.
    occupied: bool,

    /// Index of the next free slot while this one is free.
    ///
    /// The end of the list is marked by the capacity of the map.
    next_free: usize,
}

/// Provides a slotmap based on external memory.
///
/// A slotmap provides stable keys to a fixed number of elements. Lookup with the key will detect
/// if an entry has been removed, even if the storage has been handed out again since.
///
/// ## Usage
///
/// The slotmap does not create the storage of its own elements, it merely manages one given to it
/// at construction time. Removed elements are not dropped but stay in the storage until the slot
/// is reused, so callers that care should reset them.
///
/// ```
/// # use tcpcb::managed::{Slice, SlotMap, Slot};
///
/// let mut elements = [0usize; 16];
/// let mut slots = [Slot::default(); 16];
///
/// let mut map = SlotMap::new(
///     Slice::Borrowed(&mut elements[..]),
///     Slice::Borrowed(&mut slots[..]));
/// let index = map.insert(42).unwrap();
/// assert_eq!(map.get(index).cloned(), Some(42));
/// ```
pub struct SlotMap<'a, T> {
    elements: Slice<'a, T>,
    slots: Slice<'a, Slot>,
    capacity: usize,
    free_top: usize,
    len: usize,
}

/// A key into a slotmap.
///
/// The key remains valid until the entry is removed. Accessing the slotmap with the key after the
/// entry was removed will fail, even if the storage where the element was previously kept has been
/// reused for another element.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    idx: usize,
    generation: u32,
}

impl<'a, T> SlotMap<'a, T> {
    /// Manage the given element storage.
    ///
    /// The capacity is the shorter of the two slices. All slots are reset, previous content of the
    /// elements is left untouched.
    pub fn new(elements: Slice<'a, T>, mut slots: Slice<'a, Slot>) -> Self {
        let capacity = elements.len().min(slots.len());
        for (idx, slot) in slots[..capacity].iter_mut().enumerate() {
            slot.occupied = false;
            slot.next_free = idx + 1;
        }

        SlotMap {
            elements,
            slots,
            capacity,
            free_top: 0,
            len: 0,
        }
    }
}

impl<T: Default> SlotMap<'static, T> {
    /// Create a map owning default initialized storage for `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Self {
        let elements: Vec<T> = (0..capacity).map(|_| T::default()).collect();
        let slots: Vec<Slot> = (0..capacity).map(|_| Slot::default()).collect();
        SlotMap::new(Slice::Many(elements), Slice::Many(slots))
    }
}

impl<T> SlotMap<'_, T> {
    /// Retrieve a value by key.
    pub fn get(&self, key: Key) -> Option<&T> {
        if !self.is_live(key) {
            return None;
        }

        self.elements.get(key.idx)
    }

    /// Retrieve a mutable value by key.
    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        if !self.is_live(key) {
            return None;
        }

        self.elements.get_mut(key.idx)
    }

    /// Check if the key still refers to an element.
    pub fn contains(&self, key: Key) -> bool {
        self.is_live(key)
    }

    /// Reserve a new entry.
    ///
    /// The element is returned as it was left in storage, the caller is expected to overwrite it.
    pub fn reserve(&mut self) -> Option<(Key, &mut T)> {
        if self.free_top >= self.capacity {
            return None;
        }

        let idx = self.free_top;
        let slot = &mut self.slots[idx];
        assert!(!slot.occupied, "Free list contains an occupied slot");

        slot.occupied = true;
        self.free_top = slot.next_free;
        self.len += 1;

        let key = Key {
            idx,
            generation: slot.generation,
        };

        Some((key, &mut self.elements[idx]))
    }

    /// Sugar wrapper around `reserve` for inserting values.
    ///
    /// Note that on success, an old value stored in the backing slice will be overwritten.
    pub fn insert(&mut self, value: T) -> Option<Key> {
        let (key, element) = self.reserve()?;
        *element = value;
        Some(key)
    }

    /// Remove an element.
    ///
    /// If successful, return a mutable reference to the removed element. Returns `None` if the
    /// provided key did not refer to an element that could be freed.
    pub fn remove(&mut self, key: Key) -> Option<&mut T> {
        if !self.is_live(key) {
            return None;
        }

        let slot = &mut self.slots[key.idx];
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = self.free_top;
        self.free_top = key.idx;
        self.len -= 1;

        Some(&mut self.elements[key.idx])
    }

    /// The number of elements currently handed out.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if no element is handed out.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The maximum number of elements.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check if another `reserve` would fail.
    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// Iterate over all occupied entries.
    pub fn iter(&self) -> impl Iterator<Item=(Key, &T)> + '_ {
        self.slots[..self.capacity].iter()
            .zip(self.elements.iter())
            .enumerate()
            .filter(|(_, (slot, _))| slot.occupied)
            .map(|(idx, (slot, element))| (Key { idx, generation: slot.generation }, element))
    }

    /// Iterate mutably over all occupied entries.
    pub fn iter_mut(&mut self) -> impl Iterator<Item=(Key, &mut T)> + '_ {
        let capacity = self.capacity;
        self.slots[..capacity].iter()
            .zip(self.elements.iter_mut())
            .enumerate()
            .filter(|(_, (slot, _))| slot.occupied)
            .map(|(idx, (slot, element))| (Key { idx, generation: slot.generation }, element))
    }

    fn is_live(&self, key: Key) -> bool {
        match self.slots.get(key.idx) {
            Some(slot) => key.idx < self.capacity
                && slot.occupied
                && slot.generation == key.generation,
            None => false,
        }
    }
}
