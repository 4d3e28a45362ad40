//! The internet protocol layer, as far as the tcp layer needs to know about it.
//!
//! Connecting from an unspecified local address requires choosing one, together with the
//! interface to send from. [`Routes`] does this with a longest-prefix match over a static table
//! and can also bound the segment size by the MTU of the chosen path.
//!
//! [`Routes`]: struct.Routes.html
mod route;

pub use route::{InterfaceId, Path, Route, Routes};
