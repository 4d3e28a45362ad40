//! Containers over memory provided by the caller.
//!
//! The endpoint never grows its record storage on its own. It is given a [`Slice`] of elements up
//! front, either borrowed from somewhere static or as an owned `Vec`, and hands out stable keys
//! into it through a [`SlotMap`].
//!
//! [`Slice`]: enum.Slice.html
//! [`SlotMap`]: struct.SlotMap.html
mod slice;
mod slotmap;

pub use self::slice::Slice;
pub use self::slotmap::{Key, Slot, SlotMap};
