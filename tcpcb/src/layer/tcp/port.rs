//! Ephemeral port selection.
//!
//! Ports are handed out round-robin from a configurable range so that a recently used port is not
//! immediately reused for a connection to the same peer.

/// An inclusive range of ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortRange {
    /// The first port of the range.
    pub start: u16,
    /// The last port of the range.
    pub end: u16,
}

impl PortRange {
    /// The IANA suggested dynamic port range, `49152..=65535`.
    pub const EPHEMERAL: PortRange = PortRange { start: 0xc000, end: 0xffff };

    /// Create a range.
    ///
    /// # Panics
    /// This function panics if the range is empty or includes port `0`.
    pub fn new(start: u16, end: u16) -> Self {
        assert!(start > 0 && start <= end, "Port range must be non-empty and exclude 0");
        PortRange { start, end }
    }

    /// The number of ports in the range.
    pub fn len(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    /// Query whether the port lies within the range.
    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }

    /// The port after `port`, wrapping to the start of the range.
    fn successor(&self, port: u16) -> u16 {
        if port >= self.end || port < self.start {
            self.start
        } else {
            port + 1
        }
    }
}

/// Find the next port not rejected by `in_use`, starting after `last`.
///
/// `last` is advanced to the returned port. Every port of the range is tried at most once, after
/// that the range is considered exhausted.
pub(crate) fn next_free(
    range: &PortRange,
    last: &mut u16,
    mut in_use: impl FnMut(u16) -> bool,
) -> Option<u16> {
    for _ in 0..range.len() {
        *last = range.successor(*last);
        if !in_use(*last) {
            return Some(*last);
        }
    }

    None
}
