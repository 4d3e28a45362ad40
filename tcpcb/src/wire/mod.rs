//! Representations of the protocol values the tcp layer keeps per connection.
//!
//! Nothing in here parses or emits packets, that is the job of the host. The types merely name
//! addresses, sequence numbers and header flags in a way that the rest of the crate can reason
//! about them without mixing up integers.
mod ip;
mod tcp;

pub use self::ip::{Address as IpAddress, Cidr as IpCidr, Version as IpVersion};
pub use self::tcp::{Flags as TcpFlags, SeqNumber as TcpSeqNumber};
