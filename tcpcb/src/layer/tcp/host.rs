//! The seams towards the rest of the stack and towards the application.
//!
//! The endpoint never builds or sends a packet itself. Whenever a record needs something to go out
//! on the wire it asks the [`Host`], which owns the segment construction and the interfaces.
//! Application notifications go through [`Hooks`], one boxed object per connection.
//!
//! [`Host`]: trait.Host.html
//! [`Hooks`]: trait.Hooks.html
use crate::layer::ip::Path;
use crate::layer::{Error, Result};
use crate::wire::{IpAddress, IpVersion, TcpFlags, TcpSeqNumber};

use super::endpoint::Endpoint;
use super::pcb::{Connection, Segment};
use super::registry::ConnectionKey;

/// Everything the endpoint needs to know to emit a reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Reset {
    /// Sequence number of the reset.
    pub seq: TcpSeqNumber,
    /// Acknowledgment number of the reset.
    pub ack: TcpSeqNumber,
    /// Our address.
    pub local: IpAddress,
    /// The peer address.
    pub remote: IpAddress,
    /// Our port.
    pub local_port: u16,
    /// The peer port.
    pub remote_port: u16,
}

/// An application visible event of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// The connection became synchronized.
    Connected,
    /// Data of the given length was received.
    Received(usize),
    /// The peer acknowledged the given number of bytes.
    Sent(u16),
}

/// The packet side of the stack.
pub trait Host {
    /// Choose the local address and interface for reaching `remote`.
    ///
    /// Return `None` when the peer is unreachable.
    fn route(&mut self, version: IpVersion, local: IpAddress, remote: IpAddress) -> Option<Path>;

    /// Bound a maximum segment size by the path towards `remote`.
    fn effective_mss(&mut self, mss: u16, local: IpAddress, remote: IpAddress) -> u16 {
        let _ = (local, remote);
        mss
    }

    /// Queue a segment with only control flags, such as a SYN or FIN.
    ///
    /// The implementation is expected to append a segment to the send queue of the connection and
    /// account for the sequence space, or to fail without changing the connection.
    fn enqueue_flags(&mut self, key: ConnectionKey, conn: &mut Connection, flags: TcpFlags)
        -> Result<()>;

    /// Transmit whatever the connection is allowed to send right now.
    ///
    /// Errors are not fatal, the endpoint will simply try again on a later occasion.
    fn output(&mut self, key: ConnectionKey, conn: &mut Connection) -> Result<()>;

    /// Send a probe into a closed peer window.
    fn zero_window_probe(&mut self, key: ConnectionKey, conn: &mut Connection) -> Result<()>;

    /// Send a keepalive probe.
    fn keepalive(&mut self, key: ConnectionKey, conn: &mut Connection) -> Result<()>;

    /// Send a reset segment.
    fn send_rst(&mut self, reset: Reset);

    /// Give back a segment that will never be sent.
    fn release(&mut self, segment: Segment) {
        drop(segment)
    }
}

/// Application callbacks of a single connection.
///
/// Every method receives the endpoint and the host so that it can react immediately, for example by
/// closing another connection. The hooks of a connection are not reachable through the endpoint
/// while one of them runs, and the timer entry points must not be called from within a hook.
pub trait Hooks {
    /// The connection became synchronized.
    fn connected(&mut self, endpoint: &mut Endpoint<'_>, host: &mut dyn Host, key: ConnectionKey) {
        let _ = (endpoint, host, key);
    }

    /// Data was received and waits for the application.
    fn received(
        &mut self,
        endpoint: &mut Endpoint<'_>,
        host: &mut dyn Host,
        key: ConnectionKey,
        len: usize,
    ) {
        let _ = (endpoint, host, key, len);
    }

    /// The peer acknowledged previously sent data.
    fn sent(&mut self, endpoint: &mut Endpoint<'_>, host: &mut dyn Host, key: ConnectionKey, len: u16) {
        let _ = (endpoint, host, key, len);
    }

    /// The connection is gone.
    ///
    /// When this is called the record has already been released from the application, its key
    /// is no longer usable for operations. This is the last call on the hooks object.
    fn error(&mut self, endpoint: &mut Endpoint<'_>, host: &mut dyn Host, key: ConnectionKey, error: Error);
}
