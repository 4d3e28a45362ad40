use crate::time::{self, Duration};

use super::port::PortRange;

/// The lowest priority a record can have.
pub const PRIO_MIN: u8 = 1;

/// Priority of records created without asking for one.
pub const PRIO_NORMAL: u8 = 64;

/// The highest priority, such records are only evicted for requests of the same priority.
pub const PRIO_MAX: u8 = 127;

/// The largest segment size assumed before the peer told us its own.
pub const INITIAL_MSS: u16 = 536;

/// Tunables of the tcp layer.
///
/// The defaults are conservative and suit small devices: a window of four segments of the
/// minimum size, two minutes of time-wait and keepalive disabled until enabled per connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Config {
    /// The maximum segment size we are willing to receive.
    pub mss: u16,

    /// The receive window and also the maximum that recv acknowledgment can restore it to.
    pub wnd: u16,

    /// The send buffer space of a new connection.
    pub snd_buf: u16,

    /// Period of the fast timer.
    pub fast_interval: Duration,

    /// Period of the slow timer, which is also the unit of the tick counter.
    pub slow_interval: Duration,

    /// Maximum segment lifetime, time-wait lasts twice as long.
    pub msl: Duration,

    /// How long an orphaned connection may linger in FIN-WAIT-2.
    pub fin_wait_timeout: Duration,

    /// How long a half-open passive connection may wait for the final ACK.
    pub syn_rcvd_timeout: Duration,

    /// The retransmission timeout of a fresh connection.
    pub initial_rto: Duration,

    /// Retransmissions of data before giving up.
    pub max_rtx: u8,

    /// Retransmissions of a SYN before giving up.
    pub syn_max_rtx: u8,

    /// Keepalive parameters given to new connections.
    pub keepalive: KeepaliveParams,

    /// The ephemeral port range.
    pub ports: PortRange,
}

/// Keepalive probing parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KeepaliveParams {
    /// Idle time before the first probe.
    pub idle: Duration,

    /// Time between probes.
    pub interval: Duration,

    /// Unanswered probes after which the connection is dropped.
    pub count: u32,
}

impl Config {
    /// The segment size assumed for a new connection.
    pub fn initial_mss(&self) -> u16 {
        self.mss.min(INITIAL_MSS)
    }

    /// Receive window growth that warrants an immediate window update.
    pub fn wnd_update_threshold(&self) -> u32 {
        u32::from(self.wnd / 4)
    }

    /// Convert a duration to slow timer ticks.
    pub fn slow_ticks(&self, duration: Duration) -> u32 {
        time::intervals(duration, self.slow_interval)
    }

    /// Fast timer runs per slow timer run, at least one.
    pub fn fast_per_slow(&self) -> u32 {
        time::intervals(self.slow_interval, self.fast_interval).max(1)
    }

    /// Time-wait and last-ack linger, in slow ticks.
    pub fn two_msl_ticks(&self) -> u32 {
        self.slow_ticks(self.msl).saturating_mul(2)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mss: INITIAL_MSS,
            wnd: 4 * INITIAL_MSS,
            snd_buf: 2 * INITIAL_MSS,
            fast_interval: Duration::from_millis(250),
            slow_interval: Duration::from_millis(500),
            msl: Duration::from_secs(60),
            fin_wait_timeout: Duration::from_secs(20),
            syn_rcvd_timeout: Duration::from_secs(20),
            initial_rto: Duration::from_secs(3),
            max_rtx: 12,
            syn_max_rtx: 6,
            keepalive: KeepaliveParams::default(),
            ports: PortRange::EPHEMERAL,
        }
    }
}

impl Default for KeepaliveParams {
    fn default() -> Self {
        KeepaliveParams {
            idle: Duration::from_secs(2 * 60 * 60),
            interval: Duration::from_secs(75),
            count: 9,
        }
    }
}
