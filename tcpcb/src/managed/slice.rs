use core::ops::{Deref, DerefMut};
use core::slice;

use alloc::vec::Vec;

/// A slice of elements, either owned or borrowed.
///
/// Containers in this crate are generic over where their memory comes from. Embedded users will
/// usually hand in a `&'static mut [T]` while everyone else can just give up a `Vec`.
#[derive(Debug)]
pub enum Slice<'a, T: 'a> {
    /// A single element which is owned.
    One(T),

    /// Borrowed memory with a lifetime.
    Borrowed(&'a mut [T]),

    /// Owned memory on the heap.
    Many(Vec<T>),
}

impl<T> Deref for Slice<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match self {
            Slice::One(one) => slice::from_ref(one),
            Slice::Borrowed(slice) => slice,
            Slice::Many(vec) => vec.as_slice(),
        }
    }
}

impl<T> DerefMut for Slice<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        match self {
            Slice::One(one) => slice::from_mut(one),
            Slice::Borrowed(slice) => slice,
            Slice::Many(vec) => vec.as_mut_slice(),
        }
    }
}

impl<'a, T> From<&'a mut [T]> for Slice<'a, T> {
    fn from(slice: &'a mut [T]) -> Self {
        Slice::Borrowed(slice)
    }
}

impl<T> From<Vec<T>> for Slice<'_, T> {
    fn from(vec: Vec<T>) -> Self {
        Slice::Many(vec)
    }
}
