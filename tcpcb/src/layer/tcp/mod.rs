//! The TCP control block layer.
//!
//! Keeps one record per connection or listener and drives the records through their life:
//! creation, binding, opening, the closing states, time-wait and finally reclamation. Parsing
//! segments, sequencing received data and building segments to send are not part of this layer.
//! The receive path calls into the [`Endpoint`] when it observes the peer opening, closing or
//! resetting; the transmit path is reached through the [`Host`] trait.
//!
//! [`Endpoint`]: struct.Endpoint.html
//! [`Host`]: trait.Host.html
//!
//! ## Collections
//!
//! Every record that has an address or a connection state is a member of exactly one of four
//! collections, determined by its state:
//!
//! * `Listen` contains listeners in LISTEN.
//! * `Bound` contains records that reserved a port but neither listen nor connect yet.
//! * `Active` contains connections from SYN-SENT and SYN-RCVD through LAST-ACK.
//! * `TimeWait` contains connections in TIME-WAIT.
//!
//! Freshly allocated records are in no collection. The membership can be inspected with
//! [`Endpoint::members`], and [`Endpoint::assert_invariants`] verifies that it matches the state
//! of all records.
//!
//! [`Endpoint::members`]: struct.Endpoint.html#method.members
//! [`Endpoint::assert_invariants`]: struct.Endpoint.html#method.assert_invariants
//!
//! ## Timers
//!
//! There is no timer of its own. Instead, the host calls [`Endpoint::tick`] every fast interval
//! (250ms by default). Every call sends delayed ACKs. Once per slow interval, every other call by
//! default, a call also advances the slow tick clock and runs the retransmission, persist and
//! keepalive timers of each active connection.
//! All timeouts are measured in slow ticks since a stamp in the record, with wrapping arithmetic.
//!
//! A connection that times out is reported to its [`Hooks::error`] and freed. The hook may do
//! anything to the endpoint except running the timers again, in particular it may close or abort
//! other connections, including ones the timer has yet to visit.
//!
//! [`Endpoint::tick`]: struct.Endpoint.html#method.tick
//! [`Hooks::error`]: trait.Hooks.html#tymethod.error
//!
//! ## Eviction
//!
//! Storage for connection records is fixed. When [`Endpoint::alloc`] finds it full, it reclaims
//! records one at a time until an allocation succeeds:
//!
//! 1. the connection longest in time-wait, silently;
//! 2. the longest idle connection in LAST-ACK, then in CLOSING;
//! 3. the longest idle active connection with the lowest priority, but only if that priority is not
//!    above the one requested for the new record.
//!
//! Applications of reclaimed connections learn about it through their error hook, only the last
//! step sends a reset to the peer.
//!
//! [`Endpoint::alloc`]: struct.Endpoint.html#method.alloc
mod config;
mod cursor;
mod endpoint;
mod evict;
mod host;
mod pcb;
mod port;
mod registry;
mod siphash;
mod timer;

#[cfg(test)]
mod tests;

pub use config::{
    Config,
    KeepaliveParams,
    INITIAL_MSS,
    PRIO_MAX,
    PRIO_MIN,
    PRIO_NORMAL};

pub use endpoint::Endpoint;

pub use host::{
    Event,
    Hooks,
    Host,
    Reset};

pub use pcb::{
    Base,
    Connection,
    Flags,
    Keepalive,
    Listener,
    Persist,
    Rtt,
    Segment,
    SendQueue,
    SocketOptions,
    State,
    UserRef};

pub use port::PortRange;

pub use registry::{
    Collection,
    ConnectionKey,
    ListenerKey,
    PcbKey};

// publically exposed for initialization.
pub use siphash::{FourTuple, IsnGenerator};
