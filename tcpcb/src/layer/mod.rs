//! The processing logic of the connection layer.
//!
//! ## Layering
//!
//! The tcp layer keeps its own state, the [`tcp::Endpoint`], and consults the layer below it
//! only through narrow questions: which local address and interface reach a peer, and how large
//! a segment may be on that path. The [`ip`] module answers those questions for hosts that have a
//! static routing table; hosts with their own routing can answer them directly.
//!
//! ## Errors
//!
//! All fallible operations return the common [`Result`] type of this module. The error kinds are
//! deliberately coarse. They tell the caller what to do next (retry later, pick another port,
//! give up on the record) rather than exactly what went wrong.
//!
//! [`tcp::Endpoint`]: tcp/struct.Endpoint.html
//! [`ip`]: ip/index.html
//! [`Result`]: type.Result.html
use core::fmt;

pub mod ip;
pub mod tcp;

/// The result type of all layer operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The error kinds of layer operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// The record is not in a state that permits the operation.
    ///
    /// Also returned for keys whose record has already been freed, and for records that the user
    /// has already given up.
    InvalidState,

    /// The requested local address and port are already taken.
    AddrInUse,

    /// The action could not be completed because there were not enough resources.
    ///
    /// This covers both full record storage after eviction found no victim, and a fully occupied
    /// ephemeral port range. If you get this return value you may want to perform manual cleanup
    /// if possible.
    Exhausted,

    /// Unable to find a route towards the destination address.
    Unreachable,

    /// An argument was contradictory, such as an address of the wrong IP version.
    InvalidArgument,

    /// The connection was aborted by the stack.
    ///
    /// Only ever delivered through the error hook of a connection, never returned from a call.
    Aborted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            Error::InvalidState => "operation not permitted in current state",
            Error::AddrInUse => "address in use",
            Error::Exhausted => "out of resources",
            Error::Unreachable => "no route to host",
            Error::InvalidArgument => "invalid argument",
            Error::Aborted => "connection aborted",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
