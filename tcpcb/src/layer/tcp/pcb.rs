//! The per-connection records.
//!
//! There are two kinds of records. A [`Listener`] waits for peers and never carries sequence
//! state, a [`Connection`] is everything else: a socket that was created but not used yet, one
//! that is bound, any synchronized or closing connection and finally a connection lingering in
//! time-wait. Both share a [`Base`] with addressing and the intrusive link into their collection.
//!
//! [`Listener`]: struct.Listener.html
//! [`Connection`]: struct.Connection.html
//! [`Base`]: struct.Base.html
use core::fmt;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::layer::ip::InterfaceId;
use crate::time::Ticks;
use crate::wire::{IpAddress, IpVersion, TcpFlags, TcpSeqNumber};

use super::config::{Config, KeepaliveParams, PRIO_NORMAL};
use super::host::{Hooks, Reset};
use super::registry::{Collection, ListenerKey, PcbKey};

/// State enum of the statemachine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// A connection record that was not yet used, or is only bound.
    Closed,

    /// A listener record that was not yet put into listening mode.
    ListenClosed,

    /// A listening record.
    ///
    /// Akin to an open server socket.
    Listen,

    /// An open connection request.
    SynSent,

    /// Connection request we intend to answer, waiting on ack.
    SynReceived,

    /// An open connection.
    Established,

    /// Closed our side of the connection.
    FinWait1,

    /// Closing connection nicely, initiated by us and acknowledged.
    FinWait2,

    /// Other side closed its connection.
    CloseWait,

    /// Closed both sides but we don't know the other knows.
    Closing,

    /// Connection closed after other side closed its already.
    LastAck,

    /// Both sides recognized connection as closed.
    TimeWait,
}

/// Whether the application still holds on to a connection.
///
/// Once released, no hook of the connection will be invoked again and the stack alone decides
/// when the record is freed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UserRef {
    /// The application may still operate on the record.
    Owned,

    /// The application has closed the record or was told about its demise.
    Released,
}

bitflags! {
    /// Transient per connection conditions.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        /// An ACK is owed but may be sent on the next fast timer.
        const ACK_DELAY = 0x01;
        /// An ACK must go out with the next output.
        const ACK_NOW = 0x02;
        /// An earlier output ran out of memory and should be retried soon.
        const NAGLE_MEMERR = 0x04;
        /// The connection is counted in its listener's pending accepts.
        const BACKLOG_PEND = 0x08;
    }
}

bitflags! {
    /// Socket options that influence the tcp layer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SocketOptions: u8 {
        /// Allow binding to an address and port that other records with the same option use.
        const REUSE_ADDR = 0x01;
        /// Probe idle connections and drop them when the peer stays silent.
        const KEEPALIVE = 0x02;
    }
}

/// The part of a record that is common to listeners and connections.
#[derive(Clone, Copy, Debug, Default)]
pub struct Base {
    pub(crate) state: State,
    pub(crate) version: IpVersion,
    pub(crate) local: IpAddress,
    pub(crate) local_port: u16,
    pub(crate) prio: u8,
    pub(crate) options: SocketOptions,
    pub(crate) link: Link,
}

/// Membership of a record in one of the collections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub(crate) struct Link {
    pub(crate) next: Option<PcbKey>,
    pub(crate) collection: Option<Collection>,
}

/// A listening record.
#[derive(Clone, Copy, Debug, Default)]
pub struct Listener {
    pub(crate) base: Base,

    /// The maximum number of connections accepted but not yet taken by the application.
    pub backlog: u8,

    /// Connections currently counted against the backlog.
    pub accepts_pending: u8,

    /// Accept connections of either IP version.
    pub accept_any_ip_version: bool,

    /// The receive window that accepted connections start with.
    pub initial_rcv_wnd: u16,
}

/// Round trip and retransmission timer state.
///
/// All times are in slow timer ticks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rtt {
    /// Smoothed round trip time, scaled by 8.
    pub sa: i16,

    /// Round trip time variance, scaled by 4.
    pub sv: i16,

    /// The current retransmission timeout.
    pub rto: i16,

    /// Ticks since the retransmission timer was started, `-1` when stopped.
    pub rtime: i16,

    /// Number of retransmissions of the oldest unacknowledged segment.
    pub nrtx: u8,
}

/// Zero window probing state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Persist {
    /// Index into the persist backoff table plus one, `0` when not probing.
    pub backoff: u8,

    /// Ticks since the last probe.
    pub cnt: u8,
}

/// Keepalive parameters and progress of a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Keepalive {
    /// Idle milliseconds before probing.
    pub idle: u32,

    /// Milliseconds between probes.
    pub interval: u32,

    /// Probes to send before giving up.
    pub count: u32,

    /// Probes sent without an answer.
    pub sent: u8,
}

/// A queued segment.
///
/// The tcp layer never looks into the payload, it merely keeps segments around until they are
/// acknowledged or the connection goes away.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    /// Sequence number of the first byte (or of the SYN).
    pub seqno: TcpSeqNumber,

    /// Control flags to send with the segment.
    pub flags: TcpFlags,

    /// The data.
    pub payload: Vec<u8>,
}

/// The ordered queue of segments not yet acknowledged by the peer.
///
/// A prefix of the queue has been transmitted, the rest is waiting to be sent.
#[derive(Clone, Debug, Default)]
pub struct SendQueue {
    segments: VecDeque<Segment>,
    sent: usize,
}

/// A connection record.
///
/// Other than its state, addresses and collection membership which only the endpoint may modify,
/// all fields are open for the host to inspect and modify.
pub struct Connection {
    pub(crate) base: Base,
    pub(crate) user: UserRef,
    pub(crate) hooks: Option<Box<dyn Hooks>>,
    pub(crate) listener: Option<ListenerKey>,
    pub(crate) last_timer: u8,

    /// The peer address.
    pub remote: IpAddress,

    /// The peer port.
    pub remote_port: u16,

    /// The interface chosen when connecting.
    pub interface: Option<InterfaceId>,

    /// Transient conditions.
    pub flags: Flags,

    /// Next sequence number to send.
    pub snd_nxt: TcpSeqNumber,

    /// Highest acknowledged sequence number.
    pub lastack: TcpSeqNumber,

    /// Sequence number of the next byte to be buffered.
    pub snd_lbb: TcpSeqNumber,

    /// Next sequence number expected from the peer.
    pub rcv_nxt: TcpSeqNumber,

    /// The window the peer offered.
    pub snd_wnd: u16,

    /// Our receive window.
    pub rcv_wnd: u16,

    /// The window we announce.
    pub rcv_ann_wnd: u16,

    /// The right edge of the last announced window.
    pub rcv_ann_right_edge: TcpSeqNumber,

    /// The congestion window.
    pub cwnd: u16,

    /// The slow start threshold.
    pub ssthresh: u16,

    /// Available send buffer space.
    pub snd_buf: u16,

    /// The maximum segment size towards the peer.
    pub mss: u16,

    /// Retransmission timer.
    pub rtt: Rtt,

    /// Zero window probing.
    pub persist: Persist,

    /// Keepalive probing.
    pub keepalive: Keepalive,

    /// Tick of the last activity, or of entering time-wait.
    pub tmr: Ticks,

    /// Segments not acknowledged yet.
    pub send_queue: SendQueue,
}

impl State {
    /// Query whether records in this state belong to the active collection.
    pub fn is_active(self) -> bool {
        match self {
            State::SynSent
            | State::SynReceived
            | State::Established
            | State::FinWait1
            | State::FinWait2
            | State::CloseWait
            | State::Closing
            | State::LastAck => true,
            _ => false,
        }
    }

    /// The collection a record in this state must be a member of, if any is mandatory.
    pub(crate) fn required_collection(self) -> Option<Collection> {
        match self {
            State::Listen => Some(Collection::Listen),
            State::TimeWait => Some(Collection::TimeWait),
            state if state.is_active() => Some(Collection::Active),
            _ => None,
        }
    }
}

impl Default for State {
    fn default() -> Self {
        State::Closed
    }
}

impl Default for UserRef {
    fn default() -> Self {
        UserRef::Owned
    }
}

impl Base {
    fn new(state: State, version: IpVersion, prio: u8) -> Self {
        Base {
            state,
            version,
            local: IpAddress::any(version),
            local_port: 0,
            prio,
            options: SocketOptions::empty(),
            link: Link::default(),
        }
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The IP version of the record.
    pub fn version(&self) -> IpVersion {
        self.version
    }

    /// The local address, unspecified if not bound to any.
    pub fn local(&self) -> IpAddress {
        self.local
    }

    /// The local port, `0` if not bound.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// The eviction priority.
    pub fn prio(&self) -> u8 {
        self.prio
    }

    /// The socket options.
    pub fn options(&self) -> SocketOptions {
        self.options
    }

    /// The collection the record is currently a member of.
    pub fn collection(&self) -> Option<Collection> {
        self.link.collection
    }
}

impl Listener {
    pub(crate) fn new(version: IpVersion) -> Self {
        Listener {
            base: Base::new(State::ListenClosed, version, PRIO_NORMAL),
            .. Listener::default()
        }
    }

    /// The common addressing part.
    pub fn base(&self) -> &Base {
        &self.base
    }
}

impl Keepalive {
    pub(crate) fn new(params: &KeepaliveParams) -> Self {
        Keepalive {
            idle: duration_millis(params.idle),
            interval: duration_millis(params.interval),
            count: params.count,
            sent: 0,
        }
    }

    /// Milliseconds of silence after which the peer is given up.
    pub fn abort_after(&self) -> u64 {
        u64::from(self.idle) + u64::from(self.count) * u64::from(self.interval)
    }

    /// Milliseconds of silence after which the next probe is due.
    pub fn probe_after(&self) -> u64 {
        u64::from(self.idle) + u64::from(self.sent) * u64::from(self.interval)
    }
}

impl Segment {
    /// A segment without data.
    pub fn control(seqno: TcpSeqNumber, flags: TcpFlags) -> Self {
        Segment {
            seqno,
            flags,
            payload: Vec::new(),
        }
    }

    /// The amount of sequence space the segment occupies.
    pub fn sequence_len(&self) -> u32 {
        let syn = self.flags.contains(TcpFlags::SYN) as u32;
        let fin = self.flags.contains(TcpFlags::FIN) as u32;
        self.payload.len() as u32 + syn + fin
    }
}

impl SendQueue {
    /// Append a segment to be sent.
    pub fn push(&mut self, segment: Segment) {
        self.segments.push_back(segment);
    }

    /// Query whether any segment is queued.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The number of queued segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// The number of segments that were transmitted.
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// The oldest queued segment.
    pub fn front(&self) -> Option<&Segment> {
        self.segments.front()
    }

    /// Iterate over the segments that still have to be transmitted.
    pub fn unsent(&self) -> impl Iterator<Item=&Segment> + '_ {
        self.segments.iter().skip(self.sent)
    }

    /// Record that the next `count` unsent segments were transmitted.
    pub fn mark_sent(&mut self, count: usize) {
        self.sent = (self.sent + count).min(self.segments.len());
    }

    /// Remove the oldest segment after it was acknowledged.
    pub fn pop_acked(&mut self) -> Option<Segment> {
        let segment = self.segments.pop_front()?;
        self.sent = self.sent.saturating_sub(1);
        Some(segment)
    }

    /// Treat every queued segment as not yet transmitted.
    pub fn rewind(&mut self) {
        self.sent = 0;
    }

    /// Take out all segments.
    pub(crate) fn take_all(&mut self) -> VecDeque<Segment> {
        self.sent = 0;
        core::mem::replace(&mut self.segments, VecDeque::new())
    }
}

impl Connection {
    pub(crate) fn new(
        config: &Config,
        version: IpVersion,
        prio: u8,
        iss: TcpSeqNumber,
        now: Ticks,
        timer: u8,
    ) -> Self {
        let initial_rto = config.slow_ticks(config.initial_rto).min(i16::max_value() as u32) as i16;
        let mss = config.initial_mss();

        Connection {
            base: Base::new(State::Closed, version, prio),
            last_timer: timer,
            remote: IpAddress::any(version),
            rcv_wnd: config.wnd,
            rcv_ann_wnd: config.wnd,
            snd_buf: config.snd_buf,
            mss,
            cwnd: mss,
            ssthresh: config.wnd,
            snd_nxt: iss,
            lastack: iss,
            snd_lbb: iss,
            rtt: Rtt {
                sa: 0,
                sv: initial_rto,
                rto: initial_rto,
                rtime: -1,
                nrtx: 0,
            },
            keepalive: Keepalive::new(&config.keepalive),
            tmr: now,
            .. Connection::default()
        }
    }

    /// The common addressing part.
    pub fn base(&self) -> &Base {
        &self.base
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.base.state
    }

    /// Whether the application still holds the record.
    pub fn user(&self) -> UserRef {
        self.user
    }

    /// The listener that accepted this connection, while it exists.
    pub fn listener(&self) -> Option<ListenerKey> {
        self.listener
    }

    /// The reset segment that would tear down this connection.
    pub fn reset(&self) -> Reset {
        Reset {
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            local: self.base.local,
            remote: self.remote,
            local_port: self.base.local_port,
            remote_port: self.remote_port,
        }
    }

    /// Recompute the announced window after the receive window changed.
    ///
    /// Returns by how much the right edge of the announced window would move, or `0` if the change
    /// is too small to be worth announcing yet. Small increments are held back to avoid silly
    /// window syndrome.
    pub fn update_rcv_ann_wnd(&mut self, wnd: u16) -> u32 {
        let new_right_edge = self.rcv_nxt + u32::from(self.rcv_wnd);
        let threshold = u32::from((wnd / 2).min(self.mss));

        if new_right_edge >= self.rcv_ann_right_edge + threshold {
            self.rcv_ann_wnd = self.rcv_wnd;
            new_right_edge - self.rcv_ann_right_edge
        } else {
            if self.rcv_nxt > self.rcv_ann_right_edge {
                // Can happen due to other end sending out of advertised window.
                self.rcv_ann_wnd = 0;
            } else {
                let announced = self.rcv_ann_right_edge - self.rcv_nxt;
                self.rcv_ann_wnd = announced.min(u32::from(u16::max_value())) as u16;
            }
            0
        }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Connection {
            base: Base::default(),
            user: UserRef::Owned,
            hooks: None,
            listener: None,
            last_timer: 0,
            remote: IpAddress::default(),
            remote_port: 0,
            interface: None,
            flags: Flags::empty(),
            snd_nxt: TcpSeqNumber::default(),
            lastack: TcpSeqNumber::default(),
            snd_lbb: TcpSeqNumber::default(),
            rcv_nxt: TcpSeqNumber::default(),
            snd_wnd: 0,
            rcv_wnd: 0,
            rcv_ann_wnd: 0,
            rcv_ann_right_edge: TcpSeqNumber::default(),
            cwnd: 0,
            ssthresh: 0,
            snd_buf: 0,
            mss: 0,
            rtt: Rtt::default(),
            persist: Persist::default(),
            keepalive: Keepalive::default(),
            tmr: Ticks::default(),
            send_queue: SendQueue::default(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("base", &self.base)
            .field("user", &self.user)
            .field("remote", &self.remote)
            .field("remote_port", &self.remote_port)
            .field("flags", &self.flags)
            .field("snd_nxt", &self.snd_nxt)
            .field("rcv_nxt", &self.rcv_nxt)
            .field("rtt", &self.rtt)
            .field("queued", &self.send_queue.len())
            .finish()
    }
}

fn duration_millis(duration: crate::time::Duration) -> u32 {
    duration.as_millis().min(u128::from(u32::max_value())) as u32
}
