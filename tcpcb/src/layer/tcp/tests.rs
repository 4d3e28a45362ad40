use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::*;
use crate::layer::ip::{InterfaceId, Path, Route, Routes};
use crate::layer::{Error, Result};
use crate::time::{Duration, Ticks};
use crate::wire::{IpAddress, IpVersion, TcpFlags, TcpSeqNumber};

const LOCAL: IpAddress = IpAddress::v4(192, 168, 1, 10);
const OTHER_LOCAL: IpAddress = IpAddress::v4(10, 0, 0, 1);
const PEER: IpAddress = IpAddress::v4(192, 168, 1, 77);
const LOCAL_V6: IpAddress = IpAddress::Ipv6([0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
const PEER_V6: IpAddress = IpAddress::Ipv6([0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);

/// A host that records everything the endpoint asks of it.
struct MockHost {
    routes: Routes<'static>,
    enqueued: Vec<(ConnectionKey, TcpFlags)>,
    outputs: Vec<ConnectionKey>,
    resets: Vec<Reset>,
    probes: Vec<ConnectionKey>,
    keepalives: Vec<ConnectionKey>,
    released: usize,
    fail_enqueue: bool,
    fail_probe: bool,
}

impl MockHost {
    fn new() -> Self {
        let mut routes = Routes::new(vec![Route::unspecified(); 4]);
        routes.add_route(Route::default_via(LOCAL, InterfaceId(0), 1500)).unwrap();
        MockHost {
            routes,
            enqueued: Vec::new(),
            outputs: Vec::new(),
            resets: Vec::new(),
            probes: Vec::new(),
            keepalives: Vec::new(),
            released: 0,
            fail_enqueue: false,
            fail_probe: false,
        }
    }

    fn unrouted() -> Self {
        MockHost {
            routes: Routes::new(vec![Route::unspecified(); 1]),
            .. MockHost::new()
        }
    }

    fn outputs_of(&self, key: ConnectionKey) -> usize {
        self.outputs.iter().filter(|&&other| other == key).count()
    }
}

impl Host for MockHost {
    fn route(&mut self, _: IpVersion, _: IpAddress, remote: IpAddress) -> Option<Path> {
        self.routes.path(remote)
    }

    fn effective_mss(&mut self, mss: u16, _: IpAddress, remote: IpAddress) -> u16 {
        self.routes.effective_mss(mss, remote)
    }

    fn enqueue_flags(&mut self, key: ConnectionKey, conn: &mut Connection, flags: TcpFlags)
        -> Result<()>
    {
        if self.fail_enqueue {
            return Err(Error::Exhausted);
        }
        let seqno = conn.snd_lbb + 1;
        conn.send_queue.push(Segment::control(seqno, flags));
        conn.snd_lbb = seqno;
        self.enqueued.push((key, flags));
        Ok(())
    }

    fn output(&mut self, key: ConnectionKey, conn: &mut Connection) -> Result<()> {
        self.outputs.push(key);
        let unsent = conn.send_queue.unsent().count();
        conn.send_queue.mark_sent(unsent);
        if !conn.send_queue.is_empty() && conn.rtt.rtime < 0 {
            conn.rtt.rtime = 0;
        }
        Ok(())
    }

    fn zero_window_probe(&mut self, key: ConnectionKey, _: &mut Connection) -> Result<()> {
        if self.fail_probe {
            return Err(Error::Exhausted);
        }
        self.probes.push(key);
        Ok(())
    }

    fn keepalive(&mut self, key: ConnectionKey, _: &mut Connection) -> Result<()> {
        self.keepalives.push(key);
        Ok(())
    }

    fn send_rst(&mut self, reset: Reset) {
        self.resets.push(reset);
    }

    fn release(&mut self, _: Segment) {
        self.released += 1;
    }
}

type Log = Rc<RefCell<Vec<(ConnectionKey, Error)>>>;

/// Records errors and optionally frees another connection when told about one.
struct Recorder {
    log: Log,
    free: Option<ConnectionKey>,
}

impl Hooks for Recorder {
    fn error(&mut self, endpoint: &mut Endpoint<'_>, host: &mut dyn Host, key: ConnectionKey, error: Error) {
        self.log.borrow_mut().push((key, error));
        if let Some(victim) = self.free {
            let _ = endpoint.free(victim, true, host);
        }
    }
}

fn recorder(log: &Log) -> Box<dyn Hooks> {
    Box::new(Recorder { log: log.clone(), free: None })
}

fn endpoint(connections: usize) -> Endpoint<'static> {
    Endpoint::with_capacity(4, connections, Config::default())
}

/// Open a connection and pretend the peer answered the SYN.
fn established(endpoint: &mut Endpoint, host: &mut MockHost, prio: u8, remote_port: u16)
    -> ConnectionKey
{
    let key = endpoint.alloc(IpVersion::Ipv4, prio, host).unwrap();
    endpoint.connect(key, PEER, remote_port, host).unwrap();

    let conn = endpoint.connection_mut(key).unwrap();
    conn.send_queue.pop_acked().unwrap();
    conn.lastack = conn.snd_nxt;
    conn.rtt.rtime = -1;
    endpoint.transition(key, State::Established).unwrap();
    key
}

fn listening(endpoint: &mut Endpoint, port: u16, backlog: u8) -> ListenerKey {
    let key = endpoint.new_listener(IpVersion::Ipv4).unwrap();
    endpoint.bind(key, LOCAL, port).unwrap();
    endpoint.listen(key, backlog).unwrap();
    key
}

fn active(endpoint: &Endpoint) -> Vec<ConnectionKey> {
    endpoint.members(Collection::Active).filter_map(PcbKey::connection).collect()
}

fn slow_ticks(endpoint: &mut Endpoint, host: &mut MockHost, count: u32) {
    for _ in 0..count {
        endpoint.slow_tick(host);
    }
}

#[test]
fn connect_and_close() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);

    let key = endpoint.new_connection(IpVersion::Ipv4, &mut host).unwrap();
    assert_eq!(endpoint.connection(key).unwrap().state(), State::Closed);
    assert_eq!(endpoint.base(key).unwrap().collection(), None);

    endpoint.connect(key, PEER, 80, &mut host).unwrap();
    {
        let conn = endpoint.connection(key).unwrap();
        assert_eq!(conn.state(), State::SynSent);
        assert_eq!(conn.base().local(), LOCAL);
        assert!(endpoint.config().ports.contains(conn.base().local_port()));
        assert_eq!(conn.remote, PEER);
        assert_eq!(conn.interface, Some(InterfaceId(0)));
        assert_eq!(conn.mss, 536);
        assert_eq!(conn.cwnd, conn.mss);
        assert_eq!(conn.rcv_wnd, endpoint.config().wnd);
        assert_eq!(conn.send_queue.front().unwrap().seqno, conn.snd_nxt);
    }
    assert_eq!(host.enqueued, [(key, TcpFlags::SYN)]);
    assert_eq!(host.outputs, [key]);
    assert_eq!(active(&endpoint), [key]);
    endpoint.assert_invariants();

    endpoint.close(key, &mut host).unwrap();
    assert!(endpoint.connection(key).is_none());
    assert_eq!(endpoint.members(Collection::Active).count(), 0);
    assert_eq!(host.released, 1);
    assert!(host.resets.is_empty());
    endpoint.assert_invariants();
}

#[test]
fn connect_failures() {
    let mut endpoint = endpoint(4);

    let mut unrouted = MockHost::unrouted();
    let key = endpoint.new_connection(IpVersion::Ipv4, &mut unrouted).unwrap();
    assert_eq!(endpoint.connect(key, PEER, 80, &mut unrouted), Err(Error::Unreachable));
    assert_eq!(endpoint.connect(key, PEER_V6, 80, &mut unrouted), Err(Error::InvalidArgument));
    assert_eq!(endpoint.connection(key).unwrap().state(), State::Closed);

    // A port chosen for the attempt is given back.
    let mut host = MockHost::new();
    host.fail_enqueue = true;
    assert_eq!(endpoint.connect(key, PEER, 80, &mut host), Err(Error::Exhausted));
    {
        let base = endpoint.connection(key).unwrap().base();
        assert_eq!(base.state(), State::Closed);
        assert_eq!(base.local_port(), 0);
        assert_eq!(base.collection(), None);
    }

    // A bound port stays bound.
    endpoint.bind(key, IpAddress::UNSPECIFIED_V4, 7000).unwrap();
    assert_eq!(endpoint.connect(key, PEER, 80, &mut host), Err(Error::Exhausted));
    {
        let base = endpoint.connection(key).unwrap().base();
        assert_eq!(base.local_port(), 7000);
        assert_eq!(base.collection(), Some(Collection::Bound));
    }
    endpoint.assert_invariants();

    host.fail_enqueue = false;
    endpoint.connect(key, PEER, 80, &mut host).unwrap();
    assert_eq!(endpoint.members(Collection::Bound).count(), 0);
    assert_eq!(active(&endpoint), [key]);
    assert_eq!(endpoint.connect(key, PEER, 80, &mut host), Err(Error::InvalidState));
    endpoint.assert_invariants();
}

#[test]
fn bind_collisions() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(8);

    let first = endpoint.new_connection(IpVersion::Ipv4, &mut host).unwrap();
    let second = endpoint.new_connection(IpVersion::Ipv4, &mut host).unwrap();
    assert_eq!(endpoint.bind(first, LOCAL, 80), Ok(80));
    assert_eq!(endpoint.bind(first, LOCAL, 81), Err(Error::InvalidState));

    assert_eq!(endpoint.bind(second, LOCAL, 80), Err(Error::AddrInUse));
    assert_eq!(endpoint.bind(second, IpAddress::UNSPECIFIED_V4, 80), Err(Error::AddrInUse));
    assert_eq!(endpoint.bind(second, LOCAL_V6, 80), Err(Error::InvalidArgument));

    // Other addresses and other versions do not collide.
    assert_eq!(endpoint.bind(second, OTHER_LOCAL, 80), Ok(80));
    let v6 = endpoint.new_connection(IpVersion::Ipv6, &mut host).unwrap();
    assert_eq!(endpoint.bind(v6, IpAddress::UNSPECIFIED_V6, 80), Ok(80));

    // Sharing requires the option on both sides.
    let third = endpoint.new_connection(IpVersion::Ipv4, &mut host).unwrap();
    endpoint.set_options(third, SocketOptions::REUSE_ADDR).unwrap();
    assert_eq!(endpoint.bind(third, LOCAL, 80), Err(Error::AddrInUse));
    let fourth = endpoint.new_connection(IpVersion::Ipv4, &mut host).unwrap();
    endpoint.set_options(fourth, SocketOptions::REUSE_ADDR).unwrap();
    assert_eq!(endpoint.bind(fourth, LOCAL, 90), Ok(90));
    assert_eq!(endpoint.bind(third, LOCAL, 90), Ok(90));

    assert_eq!(endpoint.members(Collection::Bound).count(), 5);
    endpoint.assert_invariants();
}

#[test]
fn reuse_skips_time_wait_but_not_the_tuple() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);

    let old = endpoint.new_connection(IpVersion::Ipv4, &mut host).unwrap();
    endpoint.bind(old, IpAddress::UNSPECIFIED_V4, 5000).unwrap();
    endpoint.connect(old, PEER, 80, &mut host).unwrap();
    endpoint.move_to_time_wait(old, &mut host).unwrap();
    assert_eq!(endpoint.connection(old).unwrap().state(), State::TimeWait);

    let new = endpoint.new_connection(IpVersion::Ipv4, &mut host).unwrap();
    assert_eq!(endpoint.bind(new, LOCAL, 5000), Err(Error::AddrInUse));
    endpoint.set_options(new, SocketOptions::REUSE_ADDR).unwrap();
    assert_eq!(endpoint.bind(new, LOCAL, 5000), Ok(5000));

    // The exact connection still lingers in time-wait.
    assert_eq!(endpoint.connect(new, PEER, 80, &mut host), Err(Error::AddrInUse));
    endpoint.connect(new, PEER, 81, &mut host).unwrap();
    endpoint.assert_invariants();
}

#[test]
fn ephemeral_ports_run_out() {
    let mut host = MockHost::new();
    let config = Config {
        ports: PortRange::new(6000, 6003),
        .. Config::default()
    };
    let mut endpoint = Endpoint::with_capacity(1, 8, config);

    let mut ports = Vec::new();
    for _ in 0..4 {
        let key = endpoint.new_connection(IpVersion::Ipv4, &mut host).unwrap();
        ports.push(endpoint.bind(key, IpAddress::UNSPECIFIED_V4, 0).unwrap());
    }
    ports.sort();
    assert_eq!(ports, [6000, 6001, 6002, 6003]);

    let key = endpoint.new_connection(IpVersion::Ipv4, &mut host).unwrap();
    assert_eq!(endpoint.bind(key, IpAddress::UNSPECIFIED_V4, 0), Err(Error::Exhausted));
    assert_eq!(endpoint.connect(key, PEER, 80, &mut host), Err(Error::Exhausted));
    assert_eq!(endpoint.connection(key).unwrap().base().collection(), None);

    // Freeing a record makes its port available again.
    let bound = endpoint.members(Collection::Bound).next().and_then(PcbKey::connection).unwrap();
    let port = endpoint.connection(bound).unwrap().base().local_port();
    endpoint.close(bound, &mut host).unwrap();
    assert_eq!(endpoint.bind(key, IpAddress::UNSPECIFIED_V4, 0), Ok(port));
    endpoint.assert_invariants();
}

#[test]
fn listen_and_backlog() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);

    let listener = endpoint.new_listener(IpVersion::Ipv4).unwrap();
    assert_eq!(endpoint.listen(listener, 0), Ok(()));
    assert_eq!(endpoint.listen(listener, 0), Err(Error::InvalidState));
    endpoint.close_listener(listener).unwrap();

    let listener = listening(&mut endpoint, 80, 0);
    assert_eq!(endpoint.listener(listener).unwrap().backlog, 1);
    assert_eq!(endpoint.members(Collection::Bound).count(), 0);
    assert_eq!(endpoint.members(Collection::Listen).collect::<Vec<_>>(), [PcbKey::from(listener)]);

    let first = endpoint.open_passive(listener, LOCAL, PEER, 40000, TcpSeqNumber(1000), &mut host)
        .unwrap();
    {
        let conn = endpoint.connection(first).unwrap();
        assert_eq!(conn.state(), State::SynReceived);
        assert_eq!(conn.base().local_port(), 80);
        assert_eq!(conn.rcv_nxt, TcpSeqNumber(1001));
        assert_eq!(conn.listener(), Some(listener));
        assert!(conn.flags.contains(Flags::BACKLOG_PEND));
    }
    assert_eq!(host.enqueued, [(first, TcpFlags::SYN | TcpFlags::ACK)]);
    assert_eq!(endpoint.listener(listener).unwrap().accepts_pending, 1);

    let refused = endpoint.open_passive(listener, LOCAL, PEER, 40001, TcpSeqNumber(7), &mut host);
    assert_eq!(refused, Err(Error::Exhausted));
    assert_eq!(endpoint.open_passive(listener, LOCAL, PEER_V6, 40001, TcpSeqNumber(7), &mut host),
        Err(Error::InvalidArgument));

    endpoint.backlog_accepted(first).unwrap();
    assert_eq!(endpoint.listener(listener).unwrap().accepts_pending, 0);
    let second = endpoint.open_passive(listener, LOCAL, PEER, 40001, TcpSeqNumber(7), &mut host)
        .unwrap();

    // Accepting twice counts once.
    endpoint.backlog_delayed(second).unwrap();
    assert_eq!(endpoint.listener(listener).unwrap().accepts_pending, 1);
    endpoint.assert_invariants();

    endpoint.close_listener(listener).unwrap();
    assert!(endpoint.listener(listener).is_none());
    assert_eq!(endpoint.connection(first).unwrap().listener(), None);
    assert_eq!(endpoint.connection(second).unwrap().listener(), None);
    assert_eq!(endpoint.members(Collection::Listen).count(), 0);
    assert_eq!(endpoint.close_listener(listener), Err(Error::InvalidState));

    // Without a listener the backlog bookkeeping is a no-op.
    endpoint.backlog_accepted(second).unwrap();
    endpoint.assert_invariants();
}

#[test]
fn set_backlog_only_while_listening() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);

    let listener = endpoint.new_listener(IpVersion::Ipv4).unwrap();
    assert_eq!(endpoint.set_backlog(listener, 4), Err(Error::InvalidState));
    endpoint.bind(listener, LOCAL, 80).unwrap();
    assert_eq!(endpoint.set_backlog(listener, 4), Err(Error::InvalidState));

    endpoint.listen(listener, 4).unwrap();
    endpoint.set_backlog(listener, 0).unwrap();
    assert_eq!(endpoint.listener(listener).unwrap().backlog, 1);

    endpoint.open_passive(listener, LOCAL, PEER, 40000, TcpSeqNumber(1), &mut host).unwrap();
    assert_eq!(endpoint.open_passive(listener, LOCAL, PEER, 40001, TcpSeqNumber(1), &mut host),
        Err(Error::Exhausted));

    endpoint.set_backlog(listener, 2).unwrap();
    assert_eq!(endpoint.listener(listener).unwrap().backlog, 2);
    endpoint.open_passive(listener, LOCAL, PEER, 40001, TcpSeqNumber(1), &mut host).unwrap();
    endpoint.assert_invariants();

    endpoint.close_listener(listener).unwrap();
    assert_eq!(endpoint.set_backlog(listener, 2), Err(Error::InvalidState));
}

#[test]
fn listen_address_sharing() {
    let mut endpoint = endpoint(1);

    let first = endpoint.new_listener(IpVersion::Ipv4).unwrap();
    let second = endpoint.new_listener(IpVersion::Ipv4).unwrap();
    for &key in [first, second].iter() {
        endpoint.set_options(key, SocketOptions::REUSE_ADDR).unwrap();
        endpoint.bind(key, LOCAL, 80).unwrap();
    }

    endpoint.listen(first, 4).unwrap();
    assert_eq!(endpoint.listen(second, 4), Err(Error::AddrInUse));
    assert_eq!(endpoint.listener(second).unwrap().base().state(), State::ListenClosed);
    assert_eq!(endpoint.listen_dual(second, 4), Err(Error::AddrInUse));
    endpoint.assert_invariants();
}

#[test]
fn listen_dual_accepts_either_version() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);

    let taken = listening(&mut endpoint, 80, 4);
    let dual = endpoint.new_listener(IpVersion::Ipv4).unwrap();
    endpoint.bind(dual, IpAddress::UNSPECIFIED_V4, 81).unwrap();
    endpoint.listen_dual(dual, 4).unwrap();
    assert!(endpoint.listener(dual).unwrap().accept_any_ip_version);
    assert!(!endpoint.listener(taken).unwrap().accept_any_ip_version);

    let conn = endpoint.open_passive(dual, LOCAL_V6, PEER_V6, 40000, TcpSeqNumber(1), &mut host)
        .unwrap();
    assert_eq!(endpoint.connection(conn).unwrap().base().version(), IpVersion::Ipv6);
    assert_eq!(endpoint.connection(conn).unwrap().base().local_port(), 81);
    endpoint.assert_invariants();
}

#[test]
fn close_sends_fin() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);
    let log = Log::default();

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    endpoint.set_hooks(key, recorder(&log)).unwrap();
    host.enqueued.clear();

    // Without a FIN queued nothing changes and the close can be retried.
    host.fail_enqueue = true;
    assert_eq!(endpoint.close(key, &mut host), Err(Error::Exhausted));
    {
        let conn = endpoint.connection(key).unwrap();
        assert_eq!(conn.state(), State::Established);
        assert_eq!(conn.user(), UserRef::Owned);
    }

    host.fail_enqueue = false;
    endpoint.close(key, &mut host).unwrap();
    {
        let conn = endpoint.connection(key).unwrap();
        assert_eq!(conn.state(), State::FinWait1);
        assert_eq!(conn.user(), UserRef::Released);
    }
    assert_eq!(host.enqueued, [(key, TcpFlags::FIN)]);
    assert_eq!(endpoint.close(key, &mut host), Err(Error::InvalidState));
    assert_eq!(endpoint.abort(key, &mut host), Err(Error::InvalidState));
    assert!(log.borrow().is_empty());
    endpoint.assert_invariants();
}

#[test]
fn close_from_close_wait_and_syn_rcvd() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    endpoint.transition(key, State::CloseWait).unwrap();
    endpoint.close(key, &mut host).unwrap();
    assert_eq!(endpoint.connection(key).unwrap().state(), State::LastAck);

    let listener = listening(&mut endpoint, 80, 1);
    let key = endpoint.open_passive(listener, LOCAL, PEER, 40000, TcpSeqNumber(1), &mut host)
        .unwrap();
    endpoint.close(key, &mut host).unwrap();
    assert_eq!(endpoint.connection(key).unwrap().state(), State::FinWait1);
    assert_eq!(endpoint.listener(listener).unwrap().accepts_pending, 0);
    endpoint.assert_invariants();
}

#[test]
fn close_with_unread_data_resets() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);
    let wnd = endpoint.config().wnd;

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    endpoint.connection_mut(key).unwrap().rcv_wnd = wnd - 100;
    host.enqueued.clear();
    endpoint.close(key, &mut host).unwrap();
    assert_eq!(host.resets.len(), 1);
    assert!(host.enqueued.is_empty());
    assert_eq!(endpoint.connection(key).unwrap().state(), State::TimeWait);
    assert_eq!(endpoint.base(key).unwrap().collection(), Some(Collection::TimeWait));

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 81);
    endpoint.transition(key, State::CloseWait).unwrap();
    endpoint.connection_mut(key).unwrap().rcv_wnd = wnd - 100;
    endpoint.close(key, &mut host).unwrap();
    assert_eq!(host.resets.len(), 2);
    assert!(endpoint.connection(key).is_none());
    endpoint.assert_invariants();
}

#[test]
fn shutdown_send_only_when_synchronized() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);

    let connecting = endpoint.new_connection(IpVersion::Ipv4, &mut host).unwrap();
    endpoint.connect(connecting, PEER, 80, &mut host).unwrap();
    host.enqueued.clear();
    assert_eq!(endpoint.shutdown_send(connecting, &mut host), Err(Error::InvalidState));
    assert_eq!(endpoint.connection(connecting).unwrap().state(), State::SynSent);
    assert!(host.enqueued.is_empty());

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 81);
    host.fail_enqueue = true;
    assert_eq!(endpoint.shutdown_send(key, &mut host), Err(Error::Exhausted));
    assert_eq!(endpoint.connection(key).unwrap().state(), State::Established);

    host.fail_enqueue = false;
    endpoint.shutdown_send(key, &mut host).unwrap();
    let conn = endpoint.connection(key).unwrap();
    assert_eq!(conn.state(), State::FinWait1);
    assert_eq!(conn.user(), UserRef::Owned);
    assert_eq!(endpoint.shutdown_send(key, &mut host), Err(Error::InvalidState));
}

#[test]
fn abort_resets_without_hook() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);
    let log = Log::default();

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    endpoint.set_hooks(key, recorder(&log)).unwrap();
    let reset = endpoint.connection(key).unwrap().reset();
    endpoint.abort(key, &mut host).unwrap();

    assert!(endpoint.connection(key).is_none());
    assert_eq!(host.resets, [reset]);
    assert!(log.borrow().is_empty());

    // The key stays invalid after its slot is reused.
    let next = endpoint.new_connection(IpVersion::Ipv4, &mut host).unwrap();
    assert_ne!(next, key);
    assert!(endpoint.connection(key).is_none());
    assert_eq!(endpoint.set_prio(key, 3), Err(Error::InvalidState));
    assert_eq!(endpoint.close(key, &mut host), Err(Error::InvalidState));
    endpoint.assert_invariants();
}

#[test]
fn error_reported_once() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);
    let log = Log::default();

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    endpoint.set_hooks(key, recorder(&log)).unwrap();
    endpoint.report_error(key, Error::Aborted, &mut host);
    endpoint.report_error(key, Error::Aborted, &mut host);

    assert_eq!(*log.borrow(), [(key, Error::Aborted)]);
    assert_eq!(endpoint.connection(key).unwrap().user(), UserRef::Released);
    assert_eq!(endpoint.close(key, &mut host), Err(Error::InvalidState));
    assert_eq!(endpoint.notify(key, Event::Connected, &mut host), Err(Error::InvalidState));
}

#[test]
fn notify_restores_hooks() {
    struct Closer {
        connected: Rc<Cell<u32>>,
    }

    impl Hooks for Closer {
        fn connected(&mut self, _: &mut Endpoint<'_>, _: &mut dyn Host, _: ConnectionKey) {
            self.connected.set(self.connected.get() + 1);
        }

        fn received(&mut self, endpoint: &mut Endpoint<'_>, host: &mut dyn Host, key: ConnectionKey, _: usize) {
            endpoint.close(key, host).unwrap();
        }

        fn error(&mut self, _: &mut Endpoint<'_>, _: &mut dyn Host, _: ConnectionKey, _: Error) {
            panic!("No error expected");
        }
    }

    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);
    let connected = Rc::new(Cell::new(0));

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    endpoint.set_hooks(key, Box::new(Closer { connected: connected.clone() })).unwrap();
    endpoint.notify(key, Event::Connected, &mut host).unwrap();
    endpoint.notify(key, Event::Connected, &mut host).unwrap();
    assert_eq!(connected.get(), 2);

    endpoint.notify(key, Event::Received(10), &mut host).unwrap();
    assert_eq!(endpoint.connection(key).unwrap().state(), State::FinWait1);
    assert_eq!(endpoint.notify(key, Event::Sent(1), &mut host), Err(Error::InvalidState));
    endpoint.report_error(key, Error::Aborted, &mut host);
}

#[test]
fn recved_reopens_window() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);
    let wnd = endpoint.config().wnd;

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    {
        // The peer filled part of the announced window.
        let conn = endpoint.connection_mut(key).unwrap();
        conn.rcv_ann_right_edge = TcpSeqNumber(u32::from(wnd));
        conn.rcv_nxt = TcpSeqNumber(1000);
        conn.rcv_wnd = wnd - 1000;
    }
    host.outputs.clear();

    endpoint.recved(key, 100, &mut host).unwrap();
    assert_eq!(endpoint.connection(key).unwrap().rcv_wnd, wnd - 900);
    assert!(host.outputs.is_empty());

    endpoint.recved(key, 900, &mut host).unwrap();
    let conn = endpoint.connection(key).unwrap();
    assert_eq!(conn.rcv_wnd, wnd);
    assert_eq!(conn.rcv_ann_wnd, wnd);
    assert!(conn.flags.contains(Flags::ACK_NOW));
    assert_eq!(host.outputs, [key]);

    // Never beyond the configured window.
    endpoint.recved(key, 5000, &mut host).unwrap();
    assert_eq!(endpoint.connection(key).unwrap().rcv_wnd, wnd);
}

#[test]
fn recved_wrapping_to_zero() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);
    let wnd = endpoint.config().wnd;

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    endpoint.connection_mut(key).unwrap().rcv_wnd = 536;
    assert_eq!(endpoint.recved(key, 65000, &mut host), Err(Error::InvalidArgument));

    endpoint.transition(key, State::CloseWait).unwrap();
    endpoint.recved(key, 65000, &mut host).unwrap();
    assert_eq!(endpoint.connection(key).unwrap().rcv_wnd, wnd);
}

#[test]
fn recved_large_sum_is_capped() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);
    let wnd = endpoint.config().wnd;

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    endpoint.connection_mut(key).unwrap().rcv_wnd = 1000;
    assert_eq!(endpoint.recved(key, 65000, &mut host), Ok(()));
    assert_eq!(endpoint.connection(key).unwrap().rcv_wnd, wnd);

    endpoint.connection_mut(key).unwrap().rcv_wnd = 0;
    assert_eq!(endpoint.recved(key, u16::max_value(), &mut host), Ok(()));
    assert_eq!(endpoint.connection(key).unwrap().rcv_wnd, wnd);
}

#[test]
fn retransmission_backs_off() {
    let mut host = MockHost::new();
    let config = Config {
        max_rtx: 4,
        .. Config::default()
    };
    let mut endpoint = Endpoint::with_capacity(1, 4, config);
    let log = Log::default();

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    endpoint.set_hooks(key, recorder(&log)).unwrap();
    {
        let conn = endpoint.connection_mut(key).unwrap();
        let seqno = conn.snd_nxt;
        conn.send_queue.push(Segment { seqno, flags: TcpFlags::PSH, payload: vec![0; 100] });
        conn.send_queue.mark_sent(1);
        conn.cwnd = 4000;
        conn.snd_wnd = 3000;
        conn.rtt = Rtt { sa: 0, sv: 1, rto: 1, rtime: 0, nrtx: 0 };
    }

    endpoint.slow_tick(&mut host);
    {
        let conn = endpoint.connection(key).unwrap();
        assert_eq!(conn.rtt.nrtx, 1);
        assert_eq!(conn.rtt.rtime, 0);
        assert_eq!(conn.ssthresh, 1500);
        assert_eq!(conn.cwnd, conn.mss);
    }

    let mut timeouts = vec![endpoint.connection(key).unwrap().rtt.rto];
    let mut ticks = 1;
    while let Some(conn) = endpoint.connection(key) {
        if timeouts.last() != Some(&conn.rtt.rto) {
            timeouts.push(conn.rtt.rto);
        }
        endpoint.slow_tick(&mut host);
        ticks += 1;
    }

    assert_eq!(timeouts, [2, 4, 8, 16]);
    assert_eq!(ticks, 16);
    assert_eq!(*log.borrow(), [(key, Error::Aborted)]);
    assert!(host.resets.is_empty());
    assert_eq!(host.released, 1);
    endpoint.assert_invariants();
}

#[test]
fn syn_retries_are_limited() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);
    let log = Log::default();

    let key = endpoint.new_connection(IpVersion::Ipv4, &mut host).unwrap();
    endpoint.set_hooks(key, recorder(&log)).unwrap();
    endpoint.connect(key, PEER, 80, &mut host).unwrap();
    let rto = endpoint.connection(key).unwrap().rtt.rto;

    let mut ticks = 0;
    while endpoint.connection(key).is_some() {
        endpoint.slow_tick(&mut host);
        ticks += 1;
        assert!(ticks < 1000);
    }

    // No backoff while connecting.
    let syn_max_rtx = u32::from(endpoint.config().syn_max_rtx);
    assert_eq!(ticks, syn_max_rtx * rto as u32 + 1);
    assert_eq!(*log.borrow(), [(key, Error::Aborted)]);
}

#[test]
fn time_wait_expires() {
    for &start in [0, u32::max_value() - 100].iter() {
        let mut host = MockHost::new();
        let mut endpoint = endpoint(4);
        endpoint.set_ticks(Ticks(start));

        let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
        endpoint.move_to_time_wait(key, &mut host).unwrap();
        assert_eq!(endpoint.connection(key).unwrap().tmr, Ticks(start));

        let linger = endpoint.config().two_msl_ticks();
        slow_ticks(&mut endpoint, &mut host, linger);
        assert!(endpoint.connection(key).is_some(), "Expired early from {}", start);

        endpoint.slow_tick(&mut host);
        assert!(endpoint.connection(key).is_none(), "Lingered from {}", start);
        assert!(host.resets.is_empty());
        endpoint.assert_invariants();
    }
}

#[test]
fn last_ack_expires() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);
    let log = Log::default();

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    endpoint.set_hooks(key, recorder(&log)).unwrap();
    endpoint.transition(key, State::LastAck).unwrap();

    let linger = endpoint.config().two_msl_ticks();
    slow_ticks(&mut endpoint, &mut host, linger);
    assert!(endpoint.connection(key).is_some());
    endpoint.slow_tick(&mut host);
    assert!(endpoint.connection(key).is_none());
    assert_eq!(*log.borrow(), [(key, Error::Aborted)]);
    assert!(host.resets.is_empty());
}

#[test]
fn fin_wait_2_expires_only_when_closed() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);

    let closed = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    let half = established(&mut endpoint, &mut host, PRIO_NORMAL, 81);
    for &key in [closed, half].iter() {
        endpoint.transition(key, State::FinWait2).unwrap();
    }
    endpoint.close(closed, &mut host).unwrap();
    assert_eq!(endpoint.connection(closed).unwrap().user(), UserRef::Released);

    let config = *endpoint.config();
    let timeout = config.slow_ticks(config.fin_wait_timeout);
    slow_ticks(&mut endpoint, &mut host, timeout);
    assert!(endpoint.connection(closed).is_some());
    endpoint.slow_tick(&mut host);
    assert!(endpoint.connection(closed).is_none());

    slow_ticks(&mut endpoint, &mut host, 10 * timeout);
    assert_eq!(endpoint.connection(half).unwrap().state(), State::FinWait2);
    assert!(host.resets.is_empty());
}

#[test]
fn syn_rcvd_expires() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);
    let log = Log::default();

    let listener = listening(&mut endpoint, 80, 1);
    let key = endpoint.open_passive(listener, LOCAL, PEER, 40000, TcpSeqNumber(1), &mut host)
        .unwrap();
    endpoint.set_hooks(key, recorder(&log)).unwrap();

    let config = *endpoint.config();
    let timeout = config.slow_ticks(config.syn_rcvd_timeout);
    slow_ticks(&mut endpoint, &mut host, timeout);
    assert!(endpoint.connection(key).is_some());
    // The SYN-ACK was retransmitted meanwhile.
    assert!(endpoint.connection(key).unwrap().rtt.nrtx > 0);

    endpoint.slow_tick(&mut host);
    assert!(endpoint.connection(key).is_none());
    assert_eq!(*log.borrow(), [(key, Error::Aborted)]);
    assert_eq!(endpoint.listener(listener).unwrap().accepts_pending, 0);
    assert!(host.resets.is_empty());
}

#[test]
fn keepalive_probes_then_resets() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);
    let log = Log::default();

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    endpoint.set_hooks(key, recorder(&log)).unwrap();
    endpoint.set_options(key, SocketOptions::KEEPALIVE).unwrap();
    endpoint.set_keepalive(key, KeepaliveParams {
        idle: Duration::from_secs(10),
        interval: Duration::from_secs(1),
        count: 3,
    }).unwrap();

    slow_ticks(&mut endpoint, &mut host, 20);
    assert!(host.keepalives.is_empty());

    slow_ticks(&mut endpoint, &mut host, 6);
    assert_eq!(host.keepalives, [key, key, key]);
    assert_eq!(endpoint.connection(key).unwrap().keepalive.sent, 3);

    let reset = endpoint.connection(key).unwrap().reset();
    endpoint.slow_tick(&mut host);
    assert!(endpoint.connection(key).is_none());
    assert_eq!(host.resets, [reset]);
    assert_eq!(*log.borrow(), [(key, Error::Aborted)]);
}

#[test]
fn keepalive_answered() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    endpoint.set_options(key, SocketOptions::KEEPALIVE).unwrap();
    endpoint.set_keepalive(key, KeepaliveParams {
        idle: Duration::from_secs(10),
        interval: Duration::from_secs(1),
        count: 3,
    }).unwrap();

    slow_ticks(&mut endpoint, &mut host, 22);
    assert_eq!(host.keepalives.len(), 1);
    endpoint.touch(key).unwrap();
    assert_eq!(endpoint.connection(key).unwrap().keepalive.sent, 0);

    slow_ticks(&mut endpoint, &mut host, 20);
    assert_eq!(host.keepalives.len(), 1);
    assert!(endpoint.connection(key).is_some());
}

#[test]
fn persist_probes_back_off() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    endpoint.connection_mut(key).unwrap().persist = Persist { backoff: 1, cnt: 0 };

    slow_ticks(&mut endpoint, &mut host, 3);
    assert_eq!(host.probes, [key]);
    assert_eq!(endpoint.connection(key).unwrap().persist, Persist { backoff: 2, cnt: 0 });

    slow_ticks(&mut endpoint, &mut host, 5);
    assert_eq!(host.probes.len(), 1);
    endpoint.slow_tick(&mut host);
    assert_eq!(host.probes.len(), 2);

    // A failed probe is retried on the next tick without backing off.
    host.fail_probe = true;
    slow_ticks(&mut endpoint, &mut host, 20);
    assert_eq!(endpoint.connection(key).unwrap().persist, Persist { backoff: 3, cnt: 12 });
    host.fail_probe = false;
    endpoint.slow_tick(&mut host);
    assert_eq!(host.probes.len(), 3);
    assert_eq!(endpoint.connection(key).unwrap().persist, Persist { backoff: 4, cnt: 0 });
}

#[test]
fn fast_timer_sends_delayed_acks() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);

    let delayed = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    let idle = established(&mut endpoint, &mut host, PRIO_NORMAL, 81);
    endpoint.connection_mut(delayed).unwrap().flags.insert(Flags::ACK_DELAY);
    host.outputs.clear();

    endpoint.fast_tick(&mut host);
    assert_eq!(host.outputs, [delayed]);
    assert!(!endpoint.connection(delayed).unwrap().flags.intersects(Flags::ACK_DELAY | Flags::ACK_NOW));
    assert_eq!(endpoint.ticks(), Ticks(0));

    // Every other call also runs the slow timer, starting with the first.
    host.outputs.clear();
    endpoint.tick(&mut host);
    assert_eq!(endpoint.ticks(), Ticks(1));
    assert_eq!(host.outputs_of(idle), 1);
    endpoint.tick(&mut host);
    assert_eq!(endpoint.ticks(), Ticks(1));
    endpoint.tick(&mut host);
    assert_eq!(endpoint.ticks(), Ticks(2));
}

#[test]
fn slow_timer_follows_configured_intervals() {
    let mut host = MockHost::new();
    let config = Config {
        fast_interval: Duration::from_millis(100),
        slow_interval: Duration::from_millis(400),
        .. Config::default()
    };
    let mut endpoint = Endpoint::with_capacity(1, 4, config);

    let expected = [1, 1, 1, 1, 2, 2, 2, 2, 3];
    for &ticks in expected.iter() {
        endpoint.tick(&mut host);
        assert_eq!(endpoint.ticks(), Ticks(ticks));
    }
}

#[test]
fn tx_now_retries_after_memory_errors() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);

    let starved = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    let _fine = established(&mut endpoint, &mut host, PRIO_NORMAL, 81);
    endpoint.connection_mut(starved).unwrap().flags.insert(Flags::NAGLE_MEMERR);
    host.outputs.clear();

    endpoint.tx_now(&mut host);
    assert_eq!(host.outputs, [starved]);
}

#[test]
fn purge_and_free_from_receive_path() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);

    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    {
        let conn = endpoint.connection_mut(key).unwrap();
        let seqno = conn.snd_nxt;
        conn.send_queue.push(Segment { seqno, flags: TcpFlags::PSH, payload: vec![1; 10] });
        conn.send_queue.push(Segment { seqno: seqno + 10, flags: TcpFlags::PSH, payload: vec![2; 10] });
        conn.rtt.rtime = 3;
    }
    endpoint.purge(key, &mut host).unwrap();
    assert_eq!(host.released, 2);
    assert!(endpoint.connection(key).unwrap().send_queue.is_empty());
    assert_eq!(endpoint.connection(key).unwrap().rtt.rtime, -1);

    endpoint.free(key, true, &mut host).unwrap();
    assert_eq!(host.resets.len(), 1);
    assert_eq!(endpoint.free(key, true, &mut host), Err(Error::InvalidState));

    let unused = endpoint.new_connection(IpVersion::Ipv4, &mut host).unwrap();
    assert_eq!(endpoint.purge(unused, &mut host), Err(Error::InvalidState));
    assert_eq!(endpoint.move_to_time_wait(unused, &mut host), Err(Error::InvalidState));
    assert_eq!(endpoint.transition(unused, State::Established), Err(Error::InvalidState));
    endpoint.assert_invariants();
}

#[test]
fn eviction_by_priority() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(3);
    let log = Log::default();

    let mut keys = Vec::new();
    for port in 0..3 {
        endpoint.set_ticks(Ticks(10 * u32::from(port)));
        let key = established(&mut endpoint, &mut host, 1, 80 + port);
        endpoint.set_hooks(key, recorder(&log)).unwrap();
        keys.push(key);
    }
    endpoint.set_ticks(Ticks(100));

    assert_eq!(endpoint.alloc(IpVersion::Ipv4, 0, &mut host), Err(Error::Exhausted));
    assert!(log.borrow().is_empty());

    let reset = endpoint.connection(keys[0]).unwrap().reset();
    let new = endpoint.alloc(IpVersion::Ipv4, 5, &mut host).unwrap();
    assert!(endpoint.connection(keys[0]).is_none());
    assert!(endpoint.connection(keys[1]).is_some());
    assert_eq!(*log.borrow(), [(keys[0], Error::Aborted)]);
    assert_eq!(host.resets, [reset]);
    assert_eq!(endpoint.connection(new).unwrap().base().prio(), 5);
    endpoint.assert_invariants();
}

#[test]
fn eviction_prefers_time_wait() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(2);
    let log = Log::default();

    let lingering = established(&mut endpoint, &mut host, PRIO_MAX, 80);
    endpoint.set_hooks(lingering, recorder(&log)).unwrap();
    endpoint.move_to_time_wait(lingering, &mut host).unwrap();
    let busy = established(&mut endpoint, &mut host, PRIO_MIN, 81);

    endpoint.alloc(IpVersion::Ipv4, 0, &mut host).unwrap();
    assert!(endpoint.connection(lingering).is_none());
    assert!(endpoint.connection(busy).is_some());
    assert!(log.borrow().is_empty());
    assert!(host.resets.is_empty());
}

#[test]
fn eviction_prefers_closing_states() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(3);
    let log = Log::default();

    let closing = established(&mut endpoint, &mut host, PRIO_MAX, 80);
    let last_ack = established(&mut endpoint, &mut host, PRIO_MAX, 81);
    let busy = established(&mut endpoint, &mut host, PRIO_MIN, 82);
    for &key in [closing, last_ack, busy].iter() {
        endpoint.set_hooks(key, recorder(&log)).unwrap();
    }
    endpoint.transition(closing, State::Closing).unwrap();
    endpoint.transition(last_ack, State::LastAck).unwrap();

    endpoint.alloc(IpVersion::Ipv4, 0, &mut host).unwrap();
    assert!(endpoint.connection(last_ack).is_none());
    endpoint.alloc(IpVersion::Ipv4, 0, &mut host).unwrap();
    assert!(endpoint.connection(closing).is_none());
    assert!(endpoint.connection(busy).is_some());

    assert_eq!(*log.borrow(), [(last_ack, Error::Aborted), (closing, Error::Aborted)]);
    assert!(host.resets.is_empty());
    endpoint.assert_invariants();
}

#[test]
fn eviction_hook_may_close_listener() {
    struct CloseListener(ListenerKey);

    impl Hooks for CloseListener {
        fn error(&mut self, endpoint: &mut Endpoint<'_>, _: &mut dyn Host, _: ConnectionKey, _: Error) {
            endpoint.close_listener(self.0).unwrap();
        }
    }

    let mut host = MockHost::new();
    let mut endpoint = endpoint(1);

    let listener = listening(&mut endpoint, 80, 4);
    endpoint.set_prio(listener, 10).unwrap();
    let victim = established(&mut endpoint, &mut host, 1, 81);
    endpoint.set_hooks(victim, Box::new(CloseListener(listener))).unwrap();

    let refused = endpoint.open_passive(listener, LOCAL, PEER, 40000, TcpSeqNumber(1), &mut host);
    assert_eq!(refused, Err(Error::InvalidState));
    assert!(endpoint.connection(victim).is_none());
    assert_eq!(endpoint.members(Collection::Active).count(), 0);
    endpoint.assert_invariants();
}

#[test]
fn local_address_changes() {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);
    let log = Log::default();
    let renumbered = IpAddress::v4(192, 168, 1, 11);

    let listener = listening(&mut endpoint, 80, 4);
    let connected = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    let bound = endpoint.new_connection(IpVersion::Ipv4, &mut host).unwrap();
    endpoint.bind(bound, LOCAL, 81).unwrap();
    let elsewhere = endpoint.new_connection(IpVersion::Ipv4, &mut host).unwrap();
    endpoint.bind(elsewhere, OTHER_LOCAL, 81).unwrap();
    for &key in [connected, bound, elsewhere].iter() {
        endpoint.set_hooks(key, recorder(&log)).unwrap();
    }

    endpoint.local_address_changed(LOCAL, Some(renumbered), &mut host);
    assert!(endpoint.connection(connected).is_none());
    assert!(endpoint.connection(bound).is_none());
    assert!(endpoint.connection(elsewhere).is_some());
    assert_eq!(log.borrow().len(), 2);
    assert_eq!(host.resets.len(), 1);
    assert_eq!(endpoint.listener(listener).unwrap().base().local(), renumbered);
    endpoint.assert_invariants();
}

/// Let the timer abort the middle of five connections while its hook frees another one.
fn sweep_with_hook_freeing(pick: impl Fn(&[ConnectionKey]) -> ConnectionKey) {
    let mut host = MockHost::new();
    let mut endpoint = endpoint(8);
    let log = Log::default();

    for port in 0..5 {
        let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 8000 + port);
        endpoint.set_hooks(key, recorder(&log)).unwrap();
    }

    let order = active(&endpoint);
    let dying = order[2];
    let victim = pick(&order);
    endpoint.set_hooks(dying, Box::new(Recorder { log: log.clone(), free: Some(victim) })).unwrap();
    let max_rtx = endpoint.config().max_rtx;
    endpoint.connection_mut(dying).unwrap().rtt.nrtx = max_rtx;
    host.outputs.clear();

    endpoint.slow_tick(&mut host);

    assert_eq!(*log.borrow(), [(dying, Error::Aborted)]);
    assert!(endpoint.connection(dying).is_none());
    assert!(endpoint.connection(victim).is_none());

    let survivors: Vec<_> = order.iter().cloned()
        .filter(|&key| key != dying && key != victim)
        .collect();
    assert_eq!(active(&endpoint), survivors);
    for &key in survivors.iter() {
        assert_eq!(host.outputs_of(key), 1, "{:?} not visited exactly once", key);
    }
    endpoint.assert_invariants();

    // The next sweep is unaffected.
    host.outputs.clear();
    endpoint.slow_tick(&mut host);
    assert_eq!(host.outputs, survivors);
}

#[test]
fn sweep_hook_frees_visited() {
    sweep_with_hook_freeing(|order| order[1]);
}

#[test]
fn sweep_hook_frees_next() {
    sweep_with_hook_freeing(|order| order[3]);
}

#[test]
fn sweep_hook_frees_itself() {
    sweep_with_hook_freeing(|order| order[2]);
}

#[test]
fn sweep_hook_frees_head_and_tail() {
    sweep_with_hook_freeing(|order| order[0]);
    sweep_with_hook_freeing(|order| order[4]);
}

#[test]
fn sweep_skips_connections_opened_by_hooks() {
    struct Reconnect {
        opened: Rc<Cell<Option<ConnectionKey>>>,
    }

    impl Hooks for Reconnect {
        fn error(&mut self, endpoint: &mut Endpoint<'_>, host: &mut dyn Host, _: ConnectionKey, _: Error) {
            let key = endpoint.new_connection(IpVersion::Ipv4, host).unwrap();
            endpoint.connect(key, PEER, 9000, host).unwrap();
            self.opened.set(Some(key));
        }
    }

    let mut host = MockHost::new();
    let mut endpoint = endpoint(8);
    let opened = Rc::new(Cell::new(None));

    let dying = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    let _other = established(&mut endpoint, &mut host, PRIO_NORMAL, 81);
    endpoint.set_hooks(dying, Box::new(Reconnect { opened: opened.clone() })).unwrap();
    let max_rtx = endpoint.config().max_rtx;
    endpoint.connection_mut(dying).unwrap().rtt.nrtx = max_rtx;
    host.outputs.clear();

    endpoint.slow_tick(&mut host);
    let new = opened.get().unwrap();
    // Only the output of connecting, the timer did not visit it.
    assert_eq!(host.outputs_of(new), 1);
    assert_eq!(endpoint.connection(new).unwrap().rtt.rtime, 0);
    assert_eq!(endpoint.members(Collection::Active).count(), 2);
    endpoint.assert_invariants();
}

#[test]
#[should_panic(expected = "Timer entered from a hook")]
fn timer_reentry_panics() {
    struct Reenter;

    impl Hooks for Reenter {
        fn error(&mut self, endpoint: &mut Endpoint<'_>, host: &mut dyn Host, _: ConnectionKey, _: Error) {
            endpoint.slow_tick(host);
        }
    }

    let mut host = MockHost::new();
    let mut endpoint = endpoint(4);
    let key = established(&mut endpoint, &mut host, PRIO_NORMAL, 80);
    endpoint.set_hooks(key, Box::new(Reenter)).unwrap();
    let max_rtx = endpoint.config().max_rtx;
    endpoint.connection_mut(key).unwrap().rtt.nrtx = max_rtx;
    endpoint.slow_tick(&mut host);
}

#[test]
fn churn_keeps_invariants() {
    let mut host = MockHost::new();
    let config = Config {
        ports: PortRange::new(10000, 10015),
        .. Config::default()
    };
    let mut endpoint = Endpoint::with_capacity(2, 8, config);
    let listener = listening(&mut endpoint, 80, 4);

    for round in 0u32..400 {
        let prio = (round % 7) as u8 * 10;
        match round % 5 {
            0 | 1 => if let Ok(key) = endpoint.alloc(IpVersion::Ipv4, prio, &mut host) {
                let _ = endpoint.connect(key, PEER, 1000 + (round % 13) as u16, &mut host);
            },
            2 => {
                let _ = endpoint.open_passive(listener, LOCAL, PEER, 2000 + round as u16,
                    TcpSeqNumber(round), &mut host);
            },
            3 => if let Some(key) = active(&endpoint).first().cloned() {
                let _ = endpoint.transition(key, State::Established);
                let _ = endpoint.move_to_time_wait(key, &mut host);
            },
            _ => if let Some(key) = active(&endpoint).last().cloned() {
                let _ = endpoint.backlog_accepted(key);
                let _ = endpoint.close(key, &mut host);
            },
        }
        endpoint.tick(&mut host);
        endpoint.assert_invariants();
    }
}
