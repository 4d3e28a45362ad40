//! A soak driver for the control block layer.
//!
//! Simulates a busy client: keeps opening connections to a peer that answers instantly, lets them
//! talk for a while, closes them and lets them linger in time-wait. The record storage is smaller
//! than the demand, so the endpoint constantly has to evict. Prints a summary at the end.
use std::cell::Cell;
use std::rc::Rc;
use structopt::StructOpt;

use tcpcb::layer::{Error, Result};
use tcpcb::layer::ip::{InterfaceId, Path, Route, Routes};
use tcpcb::layer::tcp::{self, Collection, Connection, ConnectionKey, Endpoint, Host, Reset, Segment, State};
use tcpcb::wire::{IpAddress, IpVersion, TcpFlags};

const LOCAL: IpAddress = IpAddress::v4(10, 0, 0, 1);
const PEER: IpAddress = IpAddress::v4(10, 0, 0, 2);

fn main() {
    let Config {
        connections,
        pool,
        ticks,
    } = Config::from_args();

    let mut routes = Routes::new(vec![Route::unspecified(); 1]);
    routes.add_route(Route::default_via(LOCAL, InterfaceId(0), 1500))
        .expect("Room for one route");
    let mut host = Sim { routes, stats: Stats::default() };
    let mut endpoint = Endpoint::with_capacity(1, pool, tcp::Config::default());
    let aborted = Rc::new(Cell::new(0u64));

    for tick in 0..ticks {
        let open = endpoint.members(Collection::Active).count();
        for i in open..connections {
            let prio = (tick as usize + i) % usize::from(tcp::PRIO_MAX);
            let key = match endpoint.alloc(IpVersion::Ipv4, prio as u8, &mut host) {
                Ok(key) => key,
                Err(_) => break,
            };
            endpoint.set_hooks(key, Box::new(Count(aborted.clone())))
                .expect("Fresh connection is owned");
            if endpoint.connect(key, PEER, 80, &mut host).is_err() {
                let _ = endpoint.abort(key, &mut host);
            }
        }

        progress(&mut endpoint, &mut host, tick);
        endpoint.tick(&mut host);

        if cfg!(debug_assertions) {
            endpoint.assert_invariants();
        }
    }

    let Stats { syns, fins, resets, released } = host.stats;
    println!("ticks: {}", endpoint.ticks());
    println!("syn: {}, fin: {}, rst: {}, released segments: {}", syns, fins, resets, released);
    println!("aborted by the stack: {}", aborted.get());
    for &collection in Collection::ALL.iter() {
        println!("{:?}: {}", collection, endpoint.members(collection).count());
    }
}

/// Play the peer for every active connection.
fn progress(endpoint: &mut Endpoint, host: &mut Sim, tick: u32) {
    let keys: Vec<ConnectionKey> = endpoint.members(Collection::Active)
        .filter_map(|key| key.connection())
        .collect();

    for key in keys {
        let state = match endpoint.connection_mut(key) {
            Some(conn) => {
                // Everything we sent arrived.
                while conn.send_queue.sent() > 0 {
                    conn.send_queue.pop_acked();
                }
                conn.rtt.rtime = -1;
                conn.rtt.nrtx = 0;
                conn.state()
            },
            None => continue,
        };

        let _ = match state {
            State::SynSent => endpoint.transition(key, State::Established),
            State::Established if (tick + key_salt(key)) % 7 == 0 => endpoint.close(key, host),
            State::FinWait1 => endpoint.move_to_time_wait(key, host),
            _ => Ok(()),
        };
        let _ = endpoint.touch(key);
    }
}

fn key_salt(key: ConnectionKey) -> u32 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() as u32
}

struct Sim {
    routes: Routes<'static>,
    stats: Stats,
}

#[derive(Default)]
struct Stats {
    syns: u64,
    fins: u64,
    resets: u64,
    released: u64,
}

struct Count(Rc<Cell<u64>>);

impl tcp::Hooks for Count {
    fn error(&mut self, _: &mut Endpoint<'_>, _: &mut dyn Host, _: ConnectionKey, _: Error) {
        self.0.set(self.0.get() + 1);
    }
}

impl Host for Sim {
    fn route(&mut self, _: IpVersion, _: IpAddress, remote: IpAddress) -> Option<Path> {
        self.routes.path(remote)
    }

    fn effective_mss(&mut self, mss: u16, _: IpAddress, remote: IpAddress) -> u16 {
        self.routes.effective_mss(mss, remote)
    }

    fn enqueue_flags(&mut self, _: ConnectionKey, conn: &mut Connection, flags: TcpFlags)
        -> Result<()>
    {
        if flags.contains(TcpFlags::SYN) {
            self.stats.syns += 1;
        }
        if flags.contains(TcpFlags::FIN) {
            self.stats.fins += 1;
        }
        let seqno = conn.snd_lbb + 1;
        conn.send_queue.push(Segment::control(seqno, flags));
        conn.snd_lbb = seqno;
        Ok(())
    }

    fn output(&mut self, _: ConnectionKey, conn: &mut Connection) -> Result<()> {
        let unsent = conn.send_queue.unsent().count();
        conn.send_queue.mark_sent(unsent);
        if !conn.send_queue.is_empty() && conn.rtt.rtime < 0 {
            conn.rtt.rtime = 0;
        }
        Ok(())
    }

    fn zero_window_probe(&mut self, _: ConnectionKey, _: &mut Connection) -> Result<()> {
        Ok(())
    }

    fn keepalive(&mut self, _: ConnectionKey, _: &mut Connection) -> Result<()> {
        Ok(())
    }

    fn send_rst(&mut self, _: Reset) {
        self.stats.resets += 1;
    }

    fn release(&mut self, _: Segment) {
        self.stats.released += 1;
    }
}

#[derive(StructOpt)]
struct Config {
    /// Connections to keep open at any time.
    #[structopt(short = "c", default_value = "64")]
    connections: usize,

    /// Number of connection records.
    #[structopt(short = "p", default_value = "48")]
    pool: usize,

    /// Number of fast timer intervals to simulate.
    #[structopt(short = "t", default_value = "10000")]
    ticks: u32,
}
