use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::layer::{Error, Result};
use crate::managed::SlotMap;
use crate::time::Ticks;
use crate::wire::{IpAddress, IpVersion, TcpFlags, TcpSeqNumber};

use super::config::{Config, KeepaliveParams, PRIO_MAX, PRIO_NORMAL};
use super::evict;
use super::host::{Event, Hooks, Host};
use super::pcb::{Base, Connection, Flags, Keepalive, Listener, SocketOptions, State, UserRef};
use super::port;
use super::registry::{Collection, ConnectionKey, ListenerKey, PcbKey, Pools, Registry};
use super::siphash::{FourTuple, IsnGenerator};

/// The state of the tcp layer.
///
/// Owns the storage of all records, the collections they are classified into and the clocks of
/// the timers. Every operation of the layer is a method on this struct.
pub struct Endpoint<'a> {
    pub(crate) pools: Pools<'a>,
    pub(crate) registry: Registry,
    pub(crate) config: Config,
    pub(crate) isn: IsnGenerator,

    /// The slow timer clock.
    pub(crate) ticks: Ticks,

    /// Generation of timer runs, so that no record is handled twice by one run.
    pub(crate) timer_ctr: u8,

    /// Counts `tick` calls since the last slow timer run.
    pub(crate) timer: u32,

    /// The last ephemeral port handed out.
    pub(crate) last_port: u16,

    /// Set while a slow timer sweep is running.
    pub(crate) sweeping: bool,
}

impl<'a> Endpoint<'a> {
    /// Create an endpoint managing the given record storage.
    pub fn new(
        listeners: SlotMap<'a, Listener>,
        connections: SlotMap<'a, Connection>,
        isn: IsnGenerator,
        config: Config,
    ) -> Self {
        Endpoint {
            pools: Pools { listeners, connections },
            registry: Registry::default(),
            config,
            isn,
            ticks: Ticks::default(),
            timer_ctr: 0,
            timer: 0,
            last_port: config.ports.start,
            sweeping: false,
        }
    }

    /// The configuration the endpoint was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The current value of the slow timer clock.
    pub fn ticks(&self) -> Ticks {
        self.ticks
    }

    /// Look up a connection record.
    pub fn connection(&self, key: ConnectionKey) -> Option<&Connection> {
        self.pools.connections.get(key.0)
    }

    /// Look up a connection record for modification.
    pub fn connection_mut(&mut self, key: ConnectionKey) -> Option<&mut Connection> {
        self.pools.connections.get_mut(key.0)
    }

    /// Look up a listener record.
    pub fn listener(&self, key: ListenerKey) -> Option<&Listener> {
        self.pools.listeners.get(key.0)
    }

    /// The addressing part of any record.
    pub fn base(&self, key: impl Into<PcbKey>) -> Option<&Base> {
        self.pools.base(key.into())
    }

    /// Iterate over the members of a collection, most recently added first.
    pub fn members(&self, collection: Collection) -> impl Iterator<Item=PcbKey> + '_ {
        self.registry.iter(&self.pools, collection)
    }

    #[cfg(test)]
    pub(crate) fn set_ticks(&mut self, ticks: Ticks) {
        self.ticks = ticks;
    }

    /// Allocate a new connection record in CLOSED state.
    ///
    /// When the storage is full, records are reclaimed in the order: the oldest connection in
    /// time-wait, the oldest in LAST-ACK, the oldest in CLOSING and finally the oldest active
    /// connection of the lowest priority not above `prio`. Each reclaimed connection still held by
    /// the application gets its error hook called. Fails with `Exhausted` if nothing could be
    /// reclaimed.
    pub fn alloc(&mut self, version: IpVersion, prio: u8, host: &mut dyn Host)
        -> Result<ConnectionKey>
    {
        let prio = prio.min(PRIO_MAX);
        if let Some(key) = self.insert_connection(version, prio) {
            return Ok(key);
        }

        for &step in evict::CASCADE.iter() {
            if !self.evict(step, prio, host) {
                continue;
            }
            if let Some(key) = self.insert_connection(version, prio) {
                return Ok(key);
            }
        }

        net_debug!("tcp: out of connection records for prio {}", prio);
        Err(Error::Exhausted)
    }

    /// Allocate a connection record with normal priority.
    pub fn new_connection(&mut self, version: IpVersion, host: &mut dyn Host)
        -> Result<ConnectionKey>
    {
        self.alloc(version, PRIO_NORMAL, host)
    }

    /// Allocate a listener record in LISTEN-CLOSED state.
    ///
    /// Listeners are never evicted, this fails with `Exhausted` when their storage is full.
    pub fn new_listener(&mut self, version: IpVersion) -> Result<ListenerKey> {
        self.pools.listeners.insert(Listener::new(version))
            .map(ListenerKey)
            .ok_or(Error::Exhausted)
    }

    fn insert_connection(&mut self, version: IpVersion, prio: u8) -> Option<ConnectionKey> {
        if self.pools.connections.is_full() {
            return None;
        }

        let iss = self.isn.next(None, self.ticks);
        let conn = Connection::new(&self.config, version, prio, iss, self.ticks, self.timer_ctr);
        self.pools.connections.insert(conn).map(ConnectionKey)
    }

    /// Install the application hooks of a connection.
    pub fn set_hooks(&mut self, key: ConnectionKey, hooks: Box<dyn Hooks>) -> Result<()> {
        self.owned_mut(key)?.hooks = Some(hooks);
        Ok(())
    }

    /// Change the eviction priority of a record.
    pub fn set_prio(&mut self, key: impl Into<PcbKey>, prio: u8) -> Result<()> {
        self.user_base_mut(key.into())?.prio = prio.min(PRIO_MAX);
        Ok(())
    }

    /// Replace the socket options of a record.
    pub fn set_options(&mut self, key: impl Into<PcbKey>, options: SocketOptions) -> Result<()> {
        self.user_base_mut(key.into())?.options = options;
        Ok(())
    }

    /// Change the keepalive parameters of a connection.
    ///
    /// Probing itself is enabled with the `KEEPALIVE` socket option.
    pub fn set_keepalive(&mut self, key: ConnectionKey, params: KeepaliveParams) -> Result<()> {
        let conn = self.owned_mut(key)?;
        let sent = conn.keepalive.sent;
        conn.keepalive = Keepalive { sent, ..Keepalive::new(&params) };
        Ok(())
    }

    /// Bind a record to a local address and port.
    ///
    /// A port of `0` picks a free ephemeral port. An unspecified address binds to all local
    /// addresses. Returns the bound port.
    ///
    /// The port is refused if another record of the same IP version uses it on an overlapping
    /// address, unless both records have the `REUSE_ADDR` option. With that option, records in
    /// time-wait are not considered at all.
    pub fn bind(&mut self, key: impl Into<PcbKey>, local: IpAddress, port: u16) -> Result<u16> {
        let key = key.into();
        let (version, reuse) = {
            let base = self.user_base(key)?;
            match base.state {
                State::Closed | State::ListenClosed => (),
                _ => return Err(Error::InvalidState),
            }
            if base.link.collection.is_some() {
                return Err(Error::InvalidState);
            }
            (base.version, base.options.contains(SocketOptions::REUSE_ADDR))
        };

        if local.version() != version {
            return Err(Error::InvalidArgument);
        }

        let port = if port == 0 {
            self.new_port().ok_or(Error::Exhausted)?
        } else {
            let all = Collection::ALL;
            let collections = if reuse {
                &all[..3]
            } else {
                &all[..]
            };
            let collision = self.registry.find(&self.pools, collections, |_, other| {
                other.local_port == port
                    && !(reuse && other.options.contains(SocketOptions::REUSE_ADDR))
                    && other.version == version
                    && (other.local.is_unspecified() || local.is_unspecified() || other.local == local)
            });
            if let Some(other) = collision {
                net_debug!("tcp: port {} already taken by {:?}", port, other);
                return Err(Error::AddrInUse);
            }
            port
        };

        let base = self.listed_base_mut(key);
        if !local.is_unspecified() {
            base.local = local;
        }
        base.local_port = port;
        self.registry.register(&mut self.pools, Collection::Bound, key);

        net_debug!("tcp: bound {:?} to {}:{}", key, local, port);
        self.debug_check_invariants();
        Ok(port)
    }

    /// Put a listener into LISTEN state.
    ///
    /// A backlog of `0` is treated as `1`. With `REUSE_ADDR`, no other listener may use the exact
    /// same address and port.
    pub fn listen(&mut self, key: ListenerKey, backlog: u8) -> Result<()> {
        let (version, local, local_port, reuse) = match self.pools.listeners.get(key.0) {
            Some(listener) if listener.base.state == State::ListenClosed => {
                let base = &listener.base;
                (base.version, base.local, base.local_port,
                    base.options.contains(SocketOptions::REUSE_ADDR))
            },
            _ => return Err(Error::InvalidState),
        };

        if reuse {
            let collision = self.registry.find(&self.pools, &[Collection::Listen], |_, other| {
                other.version == version && other.local_port == local_port && other.local == local
            });
            if collision.is_some() {
                return Err(Error::AddrInUse);
            }
        }

        let pcb = PcbKey::from(key);
        if self.listed_base_mut(pcb).link.collection == Some(Collection::Bound) {
            self.registry.remove(&mut self.pools, Collection::Bound, pcb, None);
        }

        let wnd = self.config.wnd;
        let listener = self.listener_record_mut(key);
        listener.base.state = State::Listen;
        listener.accept_any_ip_version = false;
        listener.accepts_pending = 0;
        listener.backlog = backlog.max(1);
        listener.initial_rcv_wnd = wnd;
        self.registry.register(&mut self.pools, Collection::Listen, pcb);

        net_debug!("tcp: listening on {}:{}", local, local_port);
        self.debug_check_invariants();
        Ok(())
    }

    /// Listen, accepting either IP version when not bound to a specific address.
    ///
    /// Unlike `listen` this refuses any port that another listener already uses, regardless of
    /// its address.
    pub fn listen_dual(&mut self, key: ListenerKey, backlog: u8) -> Result<()> {
        let (local, local_port) = match self.pools.listeners.get(key.0) {
            Some(listener) => (listener.base.local, listener.base.local_port),
            None => return Err(Error::InvalidState),
        };

        if local_port != 0 {
            let taken = self.registry.find(&self.pools, &[Collection::Listen], |_, other| {
                other.local_port == local_port
            });
            if taken.is_some() {
                return Err(Error::AddrInUse);
            }
        }

        self.listen(key, backlog)?;
        if local.is_unspecified() {
            self.listener_record_mut(key).accept_any_ip_version = true;
        }
        Ok(())
    }

    /// Change the backlog of a listening record.
    pub fn set_backlog(&mut self, key: ListenerKey, backlog: u8) -> Result<()> {
        match self.pools.listeners.get_mut(key.0) {
            Some(listener) if listener.base.state == State::Listen => {
                listener.backlog = backlog.max(1);
                Ok(())
            },
            _ => Err(Error::InvalidState),
        }
    }

    /// Actively open a connection.
    ///
    /// Picks a local address through the host if none is bound, and an ephemeral port if none is
    /// bound. Then queues a SYN and enters SYN-SENT. When the SYN can not be queued the record
    /// stays CLOSED, any port chosen here is given back and the error returned.
    pub fn connect(
        &mut self,
        key: ConnectionKey,
        remote: IpAddress,
        remote_port: u16,
        host: &mut dyn Host,
    ) -> Result<()> {
        let (version, local, old_port, reuse) = {
            let conn = self.owned(key)?;
            if conn.state() != State::Closed {
                return Err(Error::InvalidState);
            }
            let base = &conn.base;
            (base.version, base.local, base.local_port,
                base.options.contains(SocketOptions::REUSE_ADDR))
        };

        if remote.version() != version || remote.is_unspecified() {
            return Err(Error::InvalidArgument);
        }

        let (local, interface) = if local.is_unspecified() {
            match host.route(version, local, remote) {
                Some(path) => (path.local, Some(path.interface)),
                None => {
                    net_debug!("tcp: no route to {}", remote);
                    return Err(Error::Unreachable);
                },
            }
        } else {
            (local, None)
        };

        let local_port = if old_port == 0 {
            self.new_port().ok_or(Error::Exhausted)?
        } else {
            if reuse {
                let pools = &self.pools;
                let duplicate = self.registry.find(pools, &[Collection::Active, Collection::TimeWait],
                    |other, base| {
                        let conn = match other.connection().and_then(|k| pools.connections.get(k.0)) {
                            Some(conn) => conn,
                            None => return false,
                        };
                        base.local_port == old_port
                            && conn.remote_port == remote_port
                            && base.version == version
                            && base.local == local
                            && conn.remote == remote
                    });
                if duplicate.is_some() {
                    return Err(Error::AddrInUse);
                }
            }
            old_port
        };

        let tuple = FourTuple { local, remote, local_port, remote_port };
        let now = self.ticks;
        let iss = self.isn.next(Some(&tuple), now);
        let mss = host.effective_mss(self.config.initial_mss(), local, remote);
        let wnd = self.config.wnd;

        let conn = self.record_mut(key);
        conn.base.local = local;
        conn.base.local_port = local_port;
        conn.interface = interface.or(conn.interface);
        conn.remote = remote;
        conn.remote_port = remote_port;
        conn.rcv_nxt = TcpSeqNumber(0);
        conn.snd_nxt = iss;
        conn.lastack = iss - 1;
        conn.snd_lbb = iss - 1;
        conn.rcv_wnd = wnd;
        conn.rcv_ann_wnd = wnd;
        conn.rcv_ann_right_edge = conn.rcv_nxt;
        conn.snd_wnd = wnd;
        conn.mss = mss;
        conn.cwnd = mss;
        conn.ssthresh = wnd;
        conn.tmr = now;

        if let Err(err) = host.enqueue_flags(key, conn, TcpFlags::SYN) {
            net_debug!("tcp: could not queue SYN to {}: {}", remote, err);
            conn.base.local_port = old_port;
            return Err(err);
        }
        conn.base.state = State::SynSent;

        let pcb = PcbKey::from(key);
        if old_port != 0 {
            self.registry.remove(&mut self.pools, Collection::Bound, pcb, None);
        }
        self.registry.register(&mut self.pools, Collection::Active, pcb);

        net_debug!("tcp: connecting {}:{} to {}:{}", local, local_port, remote, remote_port);
        let _ = host.output(key, self.record_mut(key));
        self.debug_check_invariants();
        Ok(())
    }

    /// Close the connection and give up the application's hold of it.
    ///
    /// Records that never connected, or are still in SYN-SENT, are freed right away. Synchronized
    /// connections send a FIN and linger in the closing states until the stack frees them. If the
    /// application did not take all received data, the peer is reset instead.
    ///
    /// When the FIN can not be queued the error is returned and the connection remains fully
    /// usable, the call can simply be retried. After success the key must no longer be used and
    /// no hook will be called again.
    pub fn close(&mut self, key: ConnectionKey, host: &mut dyn Host) -> Result<()> {
        self.owned(key)?;
        self.close_shutdown(key, true, host)?;

        if let Some(conn) = self.pools.connections.get_mut(key.0) {
            conn.user = UserRef::Released;
            conn.hooks = None;
        }
        Ok(())
    }

    /// Close the sending half of the connection.
    ///
    /// Only permitted in SYN-RCVD, ESTABLISHED and CLOSE-WAIT, any other state fails without
    /// side effects. The application keeps its hold of the record.
    pub fn shutdown_send(&mut self, key: ConnectionKey, host: &mut dyn Host) -> Result<()> {
        match self.owned(key)?.state() {
            State::SynReceived | State::Established | State::CloseWait => {
                self.close_shutdown(key, false, host)
            },
            _ => Err(Error::InvalidState),
        }
    }

    /// Reset the connection and free it immediately.
    ///
    /// The error hook is not called, the application asked for this after all.
    pub fn abort(&mut self, key: ConnectionKey, host: &mut dyn Host) -> Result<()> {
        let conn = self.owned_mut(key)?;
        conn.user = UserRef::Released;
        conn.hooks = None;
        net_debug!("tcp: aborting {:?}", key);
        self.free_record(key, true, None, host);
        Ok(())
    }

    fn close_shutdown(&mut self, key: ConnectionKey, rst_on_unacked: bool, host: &mut dyn Host)
        -> Result<()>
    {
        let wnd = self.config.wnd;
        let conn = self.record_mut(key);
        let state = conn.state();

        // The window not being fully reopened means the application did not consume all data.
        if rst_on_unacked
            && (state == State::Established || state == State::CloseWait)
            && conn.rcv_wnd != wnd
        {
            net_debug!("tcp: resetting {:?} with unread data", key);
            host.send_rst(conn.reset());
            if state == State::Established {
                self.enter_time_wait(key, host);
            } else {
                conn.flags.remove(Flags::ACK_DELAY);
                self.free_record(key, false, None, host);
            }
            return Ok(());
        }

        match state {
            State::Closed | State::SynSent => {
                self.free_record(key, false, None, host);
                return Ok(());
            },
            State::SynReceived => {
                host.enqueue_flags(key, conn, TcpFlags::FIN)?;
                conn.base.state = State::FinWait1;
                self.backlog_accepted_internal(key);
            },
            State::Established => {
                host.enqueue_flags(key, conn, TcpFlags::FIN)?;
                conn.base.state = State::FinWait1;
            },
            State::CloseWait => {
                host.enqueue_flags(key, conn, TcpFlags::FIN)?;
                conn.base.state = State::LastAck;
            },
            // Already closing.
            _ => return Ok(()),
        }

        net_trace!("tcp: {:?} sent FIN", key);
        let _ = host.output(key, self.record_mut(key));
        Ok(())
    }

    /// Free a listener.
    ///
    /// Connections it accepted forget about it but are otherwise unaffected.
    pub fn close_listener(&mut self, key: ListenerKey) -> Result<()> {
        let (state, collection) = match self.pools.listeners.get(key.0) {
            Some(listener) => (listener.base.state, listener.base.link.collection),
            None => return Err(Error::InvalidState),
        };

        if state == State::Listen {
            for (_, conn) in self.pools.connections.iter_mut() {
                if conn.listener == Some(key) {
                    conn.listener = None;
                }
            }
        }

        if let Some(collection) = collection {
            self.registry.remove(&mut self.pools, collection, key.into(), None);
        }

        if let Some(listener) = self.pools.listeners.remove(key.0) {
            *listener = Listener::default();
        }

        net_debug!("tcp: closed listener {:?}", key);
        self.debug_check_invariants();
        Ok(())
    }

    /// Create the record for a connection request that arrived at a listener.
    ///
    /// The new connection inherits port, options, priority and initial window of the listener,
    /// is counted against its backlog and answers with a SYN-ACK from SYN-RCVD. Fails with
    /// `Exhausted` if the backlog is full or no record could be allocated.
    pub fn open_passive(
        &mut self,
        listener: ListenerKey,
        local: IpAddress,
        remote: IpAddress,
        remote_port: u16,
        irs: TcpSeqNumber,
        host: &mut dyn Host,
    ) -> Result<ConnectionKey> {
        let prio = {
            let record = match self.pools.listeners.get(listener.0) {
                Some(record) if record.base.state == State::Listen => record,
                _ => return Err(Error::InvalidState),
            };
            if remote.version() != record.base.version && !record.accept_any_ip_version {
                return Err(Error::InvalidArgument);
            }
            if record.accepts_pending >= record.backlog {
                net_debug!("tcp: backlog of {:?} is full", listener);
                return Err(Error::Exhausted);
            }
            record.base.prio
        };

        let key = self.alloc(remote.version(), prio, host)?;

        // An error hook run during eviction may have closed the listener.
        let (local_port, options, initial_rcv_wnd) = match self.pools.listeners.get(listener.0) {
            Some(record) if record.base.state == State::Listen => {
                (record.base.local_port, record.base.options, record.initial_rcv_wnd)
            },
            _ => {
                self.free_record(key, false, None, host);
                return Err(Error::InvalidState);
            },
        };

        let tuple = FourTuple { local, remote, local_port, remote_port };
        let now = self.ticks;
        let iss = self.isn.next(Some(&tuple), now);
        let mss = host.effective_mss(self.config.initial_mss(), local, remote);

        let conn = self.record_mut(key);
        conn.base.local = local;
        conn.base.local_port = local_port;
        conn.base.options = options;
        conn.listener = Some(listener);
        conn.remote = remote;
        conn.remote_port = remote_port;
        conn.rcv_nxt = irs + 1;
        conn.rcv_ann_right_edge = conn.rcv_nxt;
        conn.rcv_wnd = initial_rcv_wnd;
        conn.rcv_ann_wnd = initial_rcv_wnd;
        conn.snd_nxt = iss;
        conn.lastack = iss;
        conn.snd_lbb = iss;
        conn.mss = mss;
        conn.cwnd = mss;
        conn.tmr = now;
        conn.base.state = State::SynReceived;
        self.registry.register(&mut self.pools, Collection::Active, key.into());
        self.backlog_delayed_internal(key);

        let conn = self.record_mut(key);
        if let Err(err) = host.enqueue_flags(key, conn, TcpFlags::SYN | TcpFlags::ACK) {
            self.free_record(key, false, None, host);
            return Err(err);
        }

        net_debug!("tcp: accepted {}:{} on port {}", remote, remote_port, local_port);
        let _ = host.output(key, self.record_mut(key));
        Ok(key)
    }

    /// Move a connection between two synchronizing, synchronized or closing states.
    ///
    /// For use by the receive path. Leaving the active states goes through `move_to_time_wait`
    /// or `free` instead.
    pub fn transition(&mut self, key: ConnectionKey, state: State) -> Result<()> {
        match self.pools.connections.get_mut(key.0) {
            Some(conn) if conn.state().is_active() && state.is_active() => {
                net_trace!("tcp: {:?} {:?} -> {:?}", key, conn.state(), state);
                conn.base.state = state;
                Ok(())
            },
            _ => Err(Error::InvalidState),
        }
    }

    /// Note activity of the peer on a connection.
    pub fn touch(&mut self, key: ConnectionKey) -> Result<()> {
        let now = self.ticks;
        let conn = self.pools.connections.get_mut(key.0).ok_or(Error::InvalidState)?;
        conn.tmr = now;
        conn.keepalive.sent = 0;
        Ok(())
    }

    /// Count a connection against its listener's backlog until accepted.
    pub fn backlog_delayed(&mut self, key: ConnectionKey) -> Result<()> {
        self.owned(key)?;
        self.backlog_delayed_internal(key);
        Ok(())
    }

    /// Stop counting a connection against its listener's backlog.
    pub fn backlog_accepted(&mut self, key: ConnectionKey) -> Result<()> {
        self.owned(key)?;
        self.backlog_accepted_internal(key);
        Ok(())
    }

    fn backlog_delayed_internal(&mut self, key: ConnectionKey) {
        let Pools { listeners, connections } = &mut self.pools;
        let conn = match connections.get_mut(key.0) {
            Some(conn) if !conn.flags.contains(Flags::BACKLOG_PEND) => conn,
            _ => return,
        };
        let listener = match conn.listener.and_then(|listener| listeners.get_mut(listener.0)) {
            Some(listener) => listener,
            None => return,
        };

        listener.accepts_pending = match listener.accepts_pending.checked_add(1) {
            Some(pending) => pending,
            None => panic!("Pending accepts of {:?} overflow", conn.listener),
        };
        conn.flags.insert(Flags::BACKLOG_PEND);
    }

    fn backlog_accepted_internal(&mut self, key: ConnectionKey) {
        let Pools { listeners, connections } = &mut self.pools;
        let conn = match connections.get_mut(key.0) {
            Some(conn) if conn.flags.contains(Flags::BACKLOG_PEND) => conn,
            _ => return,
        };
        let listener = match conn.listener.and_then(|listener| listeners.get_mut(listener.0)) {
            Some(listener) => listener,
            None => return,
        };

        assert!(listener.accepts_pending > 0, "Pending accepts of {:?} underflow", conn.listener);
        listener.accepts_pending -= 1;
        conn.flags.remove(Flags::BACKLOG_PEND);
    }

    /// The application consumed `len` bytes of received data.
    ///
    /// Reopens the receive window, at most to the configured window. Sends a window update right
    /// away if the window grew by at least a quarter of its maximum.
    pub fn recved(&mut self, key: ConnectionKey, len: u16, host: &mut dyn Host) -> Result<()> {
        let wnd = self.config.wnd;
        let threshold = self.config.wnd_update_threshold();
        let conn = self.owned_mut(key)?;

        let rcv_wnd = u32::from(conn.rcv_wnd) + u32::from(len);
        conn.rcv_wnd = if rcv_wnd == 1 << 16 {
            match conn.state() {
                // The FIN occupies window that the application may or may not acknowledge.
                State::CloseWait | State::LastAck => wnd,
                _ => return Err(Error::InvalidArgument),
            }
        } else if rcv_wnd > u32::from(wnd) {
            wnd
        } else {
            rcv_wnd as u16
        };

        let inflation = conn.update_rcv_ann_wnd(wnd);
        if inflation >= threshold {
            conn.flags.insert(Flags::ACK_NOW);
            let _ = host.output(key, conn);
        }
        Ok(())
    }

    /// Tell the application that its connection is gone.
    ///
    /// Calls the error hook if the application still holds the record and releases it from the
    /// application. Later calls do nothing, the hook runs at most once. The record itself is not
    /// freed.
    pub fn report_error(&mut self, key: ConnectionKey, error: Error, host: &mut dyn Host) {
        let hooks = match self.pools.connections.get_mut(key.0) {
            Some(conn) if conn.user == UserRef::Owned => {
                conn.user = UserRef::Released;
                conn.hooks.take()
            },
            _ => return,
        };

        net_debug!("tcp: reporting {} on {:?}", error, key);
        if let Some(mut hooks) = hooks {
            hooks.error(self, host, key, error);
        }
    }

    /// Deliver an event to the hooks of a connection.
    ///
    /// Fails with `InvalidState` if the application no longer holds the record.
    pub fn notify(&mut self, key: ConnectionKey, event: Event, host: &mut dyn Host) -> Result<()> {
        let mut hooks = match self.owned_mut(key)?.hooks.take() {
            Some(hooks) => hooks,
            None => return Ok(()),
        };

        match event {
            Event::Connected => hooks.connected(self, host, key),
            Event::Received(len) => hooks.received(self, host, key, len),
            Event::Sent(len) => hooks.sent(self, host, key, len),
        }

        // Put the hooks back unless the connection was released or got new ones meanwhile.
        if let Some(conn) = self.pools.connections.get_mut(key.0) {
            if conn.user == UserRef::Owned && conn.hooks.is_none() {
                conn.hooks = Some(hooks);
            }
        }
        Ok(())
    }

    /// Remove a connection from its collection and free it.
    ///
    /// Sends a reset first if `reset` is set and the connection is synchronizing, synchronized or
    /// closing. Does not consult the application, see `report_error` for that.
    pub fn free(&mut self, key: ConnectionKey, reset: bool, host: &mut dyn Host) -> Result<()> {
        if !self.pools.connections.contains(key.0) {
            return Err(Error::InvalidState);
        }
        self.free_record(key, reset, None, host);
        Ok(())
    }

    /// Drop all queued segments of an active connection.
    pub fn purge(&mut self, key: ConnectionKey, host: &mut dyn Host) -> Result<()> {
        match self.pools.connections.get(key.0) {
            Some(conn) if conn.state().is_active() => (),
            _ => return Err(Error::InvalidState),
        }
        self.purge_record(key, host);
        Ok(())
    }

    /// Move an active connection to time-wait.
    pub fn move_to_time_wait(&mut self, key: ConnectionKey, host: &mut dyn Host) -> Result<()> {
        match self.pools.connections.get(key.0) {
            Some(conn) if conn.state().is_active() => (),
            _ => return Err(Error::InvalidState),
        }
        self.enter_time_wait(key, host);
        Ok(())
    }

    fn enter_time_wait(&mut self, key: ConnectionKey, host: &mut dyn Host) {
        self.registry.remove(&mut self.pools, Collection::Active, key.into(), None);
        self.purge_record(key, host);

        let now = self.ticks;
        let conn = self.record_mut(key);
        conn.base.state = State::TimeWait;
        conn.tmr = now;
        self.registry.register(&mut self.pools, Collection::TimeWait, key.into());

        net_trace!("tcp: {:?} entered time-wait at {}", key, now);
        self.debug_check_invariants();
    }

    pub(crate) fn purge_record(&mut self, key: ConnectionKey, host: &mut dyn Host) {
        self.backlog_accepted_internal(key);

        let conn = self.record_mut(key);
        assert!(conn.state().is_active(), "Purging {:?} in state {:?}", key, conn.state());

        // The retransmission timer expects queued data.
        conn.rtt.rtime = -1;
        let segments = conn.send_queue.take_all();
        if !segments.is_empty() {
            net_trace!("tcp: dropping {} queued segments of {:?}", segments.len(), key);
        }
        for segment in segments {
            host.release(segment);
        }
    }

    /// Free a connection, unlinking through `prev` if it is known.
    pub(crate) fn free_record(
        &mut self,
        key: ConnectionKey,
        reset: bool,
        prev: Option<PcbKey>,
        host: &mut dyn Host,
    ) {
        let pcb = PcbKey::from(key);
        let conn = self.record_mut(key);
        match conn.state() {
            State::Closed => {
                if conn.base.link.collection.is_some() {
                    self.registry.remove(&mut self.pools, Collection::Bound, pcb, None);
                }
            },
            State::TimeWait => {
                self.registry.remove(&mut self.pools, Collection::TimeWait, pcb, prev);
            },
            state if state.is_active() => {
                if conn.flags.contains(Flags::ACK_DELAY) {
                    conn.flags.insert(Flags::ACK_NOW);
                    let _ = host.output(key, conn);
                }
                if reset {
                    host.send_rst(conn.reset());
                }
                self.registry.remove(&mut self.pools, Collection::Active, pcb, prev);
                // After any output above, which may have queued more segments.
                self.purge_record(key, host);
            },
            state => panic!("Connection {:?} in listener state {:?}", key, state),
        }

        let conn = self.record_mut(key);
        assert!(conn.send_queue.is_empty(), "Freeing {:?} with queued segments", key);
        if let Some(conn) = self.pools.connections.remove(key.0) {
            *conn = Connection::default();
        }

        net_trace!("tcp: freed {:?}", key);
        self.debug_check_invariants();
    }

    /// Abort all connections using a local address that went away.
    ///
    /// Their applications learn about it through the error hook. When the address was replaced
    /// by `new`, listeners bound to the old address move over to the new one.
    pub fn local_address_changed(
        &mut self,
        old: IpAddress,
        new: Option<IpAddress>,
        host: &mut dyn Host,
    ) {
        let mut doomed = Vec::new();
        for &collection in [Collection::Active, Collection::Bound].iter() {
            doomed.extend(self.registry.iter(&self.pools, collection)
                .filter_map(PcbKey::connection)
                .filter(|key| self.pools.connections.get(key.0)
                    .map_or(false, |conn| conn.base.local == old)));
        }

        for key in doomed {
            // Hooks of earlier victims may have freed this one already.
            if !self.pools.connections.contains(key.0) {
                continue;
            }
            net_debug!("tcp: {} went away, aborting {:?}", old, key);
            self.report_error(key, Error::Aborted, host);
            if self.pools.connections.contains(key.0) {
                self.free_record(key, true, None, host);
            }
        }

        let new = match new {
            Some(new) if !new.is_unspecified() => new,
            _ => return,
        };

        for (_, listener) in self.pools.listeners.iter_mut() {
            if listener.base.state == State::Listen && listener.base.local == old {
                listener.base.local = new;
            }
        }
    }

    /// Check that every record is classified according to its state.
    ///
    /// # Panics
    /// This method panics when a collection links a record it should not, or a record that
    /// should be in a collection is not.
    pub fn assert_invariants(&self) {
        let records = self.pools.listeners.len() + self.pools.connections.len();
        let mut listed = 0;

        for &collection in Collection::ALL.iter() {
            for key in self.registry.iter(&self.pools, collection) {
                listed += 1;
                assert!(listed <= records, "Collection {:?} contains a cycle", collection);

                let base = match self.pools.base(key) {
                    Some(base) => base,
                    None => panic!("{:?} links to freed record {:?}", collection, key),
                };
                assert_eq!(base.link.collection, Some(collection),
                    "Record {:?} is linked from the wrong collection", key);

                let valid = match collection {
                    Collection::Listen => base.state == State::Listen,
                    Collection::Bound => match base.state {
                        State::Closed | State::ListenClosed => true,
                        _ => false,
                    },
                    Collection::Active => base.state.is_active(),
                    Collection::TimeWait => base.state == State::TimeWait,
                };
                assert!(valid, "Record {:?} in state {:?} is a member of {:?}",
                    key, base.state, collection);
            }
        }

        let listeners = self.pools.listeners.iter()
            .map(|(key, listener)| (PcbKey::Listener(ListenerKey(key)), &listener.base));
        let connections = self.pools.connections.iter()
            .map(|(key, conn)| (PcbKey::Connection(ConnectionKey(key)), &conn.base));

        let mut marked = 0;
        for (key, base) in listeners.chain(connections) {
            if base.link.collection.is_some() {
                marked += 1;
            }
            if let Some(required) = base.state.required_collection() {
                assert_eq!(base.link.collection, Some(required),
                    "Record {:?} in state {:?} is not where it belongs", key, base.state);
            }
        }

        assert_eq!(listed, marked, "Records claim membership of a collection that does not link them");
    }

    fn debug_check_invariants(&self) {
        if cfg!(debug_assertions) {
            self.assert_invariants();
        }
    }

    fn new_port(&mut self) -> Option<u16> {
        let Endpoint { pools, registry, config, last_port, .. } = self;
        let (pools, registry) = (&*pools, &*registry);
        let port = port::next_free(&config.ports, last_port, |port| {
            registry.find(pools, &Collection::ALL, |_, base| base.local_port == port).is_some()
        });
        if port.is_none() {
            net_debug!("tcp: ephemeral ports exhausted");
        }
        port
    }

    fn owned(&self, key: ConnectionKey) -> Result<&Connection> {
        match self.pools.connections.get(key.0) {
            Some(conn) if conn.user == UserRef::Owned => Ok(conn),
            _ => Err(Error::InvalidState),
        }
    }

    fn owned_mut(&mut self, key: ConnectionKey) -> Result<&mut Connection> {
        match self.pools.connections.get_mut(key.0) {
            Some(conn) if conn.user == UserRef::Owned => Ok(conn),
            _ => Err(Error::InvalidState),
        }
    }

    fn user_base(&self, key: PcbKey) -> Result<&Base> {
        match key {
            PcbKey::Listener(key) => self.pools.listeners.get(key.0)
                .map(|listener| &listener.base)
                .ok_or(Error::InvalidState),
            PcbKey::Connection(key) => self.owned(key).map(|conn| &conn.base),
        }
    }

    fn user_base_mut(&mut self, key: PcbKey) -> Result<&mut Base> {
        match key {
            PcbKey::Listener(key) => self.pools.listeners.get_mut(key.0)
                .map(|listener| &mut listener.base)
                .ok_or(Error::InvalidState),
            PcbKey::Connection(key) => self.owned_mut(key).map(|conn| &mut conn.base),
        }
    }

    /// A connection that must exist.
    pub(crate) fn record_mut(&mut self, key: ConnectionKey) -> &mut Connection {
        match self.pools.connections.get_mut(key.0) {
            Some(conn) => conn,
            None => panic!("Connection {:?} was already freed", key),
        }
    }

    fn listener_record_mut(&mut self, key: ListenerKey) -> &mut Listener {
        match self.pools.listeners.get_mut(key.0) {
            Some(listener) => listener,
            None => panic!("Listener {:?} was already freed", key),
        }
    }

    fn listed_base_mut(&mut self, key: PcbKey) -> &mut Base {
        match self.pools.base_mut(key) {
            Some(base) => base,
            None => panic!("Record {:?} was already freed", key),
        }
    }
}

impl Endpoint<'static> {
    /// Create an endpoint with heap allocated storage for the given number of records.
    ///
    /// Initial sequence numbers come from a plain counter, use `new` to supply a keyed
    /// generator.
    pub fn with_capacity(listeners: usize, connections: usize, config: Config) -> Self {
        Endpoint::new(
            SlotMap::with_capacity(listeners),
            SlotMap::with_capacity(connections),
            IsnGenerator::default(),
            config)
    }
}
