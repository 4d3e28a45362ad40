//! Protocol control block lifecycle for a lightweight TCP stack.
//!
//! ## Table of contents
//!
//! 1. [Overview](#overview)
//! 2. [Design](#design-and-relevant-core-concepts)
//! 3. [The tcp layer](layer/tcp/index.html)
//!    1. [Records and their collections](layer/tcp/index.html#collections)
//!    1. [Timers](layer/tcp/index.html#timers)
//!    1. [Running out of records](layer/tcp/index.html#eviction)
//! 4. [Routing](layer/ip/index.html)
//! 5. Internals
//!    1. [The managed module](managed/index.html)
//!    2. [The wire module](wire/index.html)
//!
//! ## Overview
//!
//! This crate keeps the per-connection state of a TCP implementation: it creates records,
//! classifies them by phase of their life, drives them through the closing states, retransmits
//! for them when the peer stays silent and finally reclaims them. Everything that touches actual
//! packets (parsing, building segments, checksums, transmission) is left to the host which plugs
//! in through the [`Host`] trait.
//!
//! ## Design and relevant core concepts
//!
//! All state lives in a single [`Endpoint`] value that is passed by reference to every operation.
//! There are no globals and no interior mutability. The memory for records is handed to the
//! endpoint at construction time and never grows; when it runs out the endpoint reclaims the least
//! valuable records instead, in a fixed order that prefers connections nobody will miss.
//!
//! Records are addressed by keys carrying a generation. A key outlives its record without harm:
//! once a record has been freed, operations with its key fail with [`Error::InvalidState`].
//!
//! [`Host`]: layer/tcp/trait.Host.html
//! [`Endpoint`]: layer/tcp/struct.Endpoint.html
//! [`Error::InvalidState`]: layer/enum.Error.html#variant.InvalidState
#![warn(missing_docs)]
#![warn(unreachable_pub)]

// tests should be able to use `std`
#![cfg_attr(all(
    not(feature = "std"),
    not(test)),
no_std)]

/// The `alloc` crate.
///
/// Records own their send queue and user hooks, both of which are heap allocated.
pub extern crate alloc;

#[macro_use] mod macros;
pub mod layer;
pub mod managed;
pub mod time;
pub mod wire;
