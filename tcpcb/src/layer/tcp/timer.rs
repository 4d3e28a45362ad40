//! The fast and slow timers.
//!
//! The fast timer sends delayed ACKs. The slow timer advances the clock, drives retransmission,
//! zero window probing and keepalive, and removes connections that overstayed in one of the
//! closing states or in time-wait.
use crate::layer::Error;
use crate::time::Duration;

use super::config::Config;
use super::cursor::Links;
use super::endpoint::Endpoint;
use super::host::Host;
use super::pcb::{Connection, Flags, SocketOptions, State, UserRef};
use super::registry::{Collection, ConnectionKey, PcbKey};

/// Shift of the retransmission timeout by the number of retransmissions so far.
const BACKOFF: [u8; 13] = [1, 2, 3, 4, 5, 6, 7, 7, 7, 7, 7, 7, 7];

/// Slow ticks between zero window probes.
const PERSIST_BACKOFF: [u8; 7] = [3, 6, 12, 24, 48, 96, 120];

/// What the slow timer decided for a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verdict {
    /// Already handled in this timer generation.
    Skip,
    /// Keep and try to send.
    Keep,
    /// Abort the connection.
    Remove {
        reset: bool,
    },
}

impl Endpoint<'_> {
    /// Run the timers, to be called every fast interval.
    ///
    /// The slow timer runs on the first call and then once every [`Config::fast_per_slow`] calls.
    ///
    /// [`Config::fast_per_slow`]: struct.Config.html#method.fast_per_slow
    pub fn tick(&mut self, host: &mut dyn Host) {
        self.fast_tick(host);

        let run_slow = self.timer == 0;
        self.timer = (self.timer + 1) % self.config.fast_per_slow();
        if run_slow {
            self.slow_tick(host);
        }
    }

    /// Send all delayed ACKs.
    ///
    /// # Panics
    /// This method panics when called from a hook during a timer run.
    pub fn fast_tick(&mut self, host: &mut dyn Host) {
        assert!(!self.sweeping, "Timer entered from a hook");
        self.timer_ctr = self.timer_ctr.wrapping_add(1);
        let generation = self.timer_ctr;

        // Output can not change any collection, a plain walk suffices.
        let mut next = self.registry.head(Collection::Active);
        while let Some(pcb) = next {
            next = self.pools.next_of(pcb);
            let key = active_connection(pcb);
            let conn = self.record_mut(key);

            if conn.last_timer == generation {
                continue;
            }
            conn.last_timer = generation;

            if conn.flags.contains(Flags::ACK_DELAY) {
                net_trace!("tcp: delayed ACK on {:?}", key);
                conn.flags.insert(Flags::ACK_NOW);
                let _ = host.output(key, conn);
                conn.flags.remove(Flags::ACK_DELAY | Flags::ACK_NOW);
            }
        }
    }

    /// Advance the clock and run the per connection timers.
    ///
    /// Connections found dead are reported to their error hook and freed. Hooks may operate on
    /// any record, including freeing the ones still to be visited, but must not enter the
    /// timers.
    ///
    /// # Panics
    /// This method panics when called from a hook during a timer run.
    pub fn slow_tick(&mut self, host: &mut dyn Host) {
        assert!(!self.sweeping, "Timer entered from a hook");
        self.sweeping = true;
        self.ticks = self.ticks.next();
        self.timer_ctr = self.timer_ctr.wrapping_add(1);

        self.registry.sweep_start(Collection::Active);
        while let Some(pcb) = self.registry.sweep_next(&self.pools) {
            let key = active_connection(pcb);

            match self.slow_timer(key, host) {
                Verdict::Skip => (),
                Verdict::Keep => {
                    let _ = host.output(key, self.record_mut(key));
                },
                Verdict::Remove { reset } => {
                    self.record_mut(key).flags.remove(Flags::ACK_DELAY);
                    self.report_error(key, Error::Aborted, host);

                    // The hook may have freed or moved the connection already.
                    let collection = match self.pools.connections.get(key.0) {
                        Some(conn) => conn.base.link.collection,
                        None => continue,
                    };
                    let prev = match collection {
                        Some(Collection::Active) => self.registry.sweep_prev(),
                        _ => None,
                    };
                    self.free_record(key, reset, prev, host);
                },
            }
        }

        let linger = self.config.two_msl_ticks();
        let now = self.ticks;
        self.registry.sweep_start(Collection::TimeWait);
        while let Some(pcb) = self.registry.sweep_next(&self.pools) {
            let key = active_connection(pcb);
            let conn = self.record_mut(key);
            assert_eq!(conn.state(), State::TimeWait, "Time-wait member {:?} in wrong state", key);

            if now.elapsed_since(conn.tmr) > linger {
                net_trace!("tcp: {:?} leaves time-wait", key);
                let prev = self.registry.sweep_prev();
                self.free_record(key, false, prev, host);
            }
        }

        self.sweeping = false;
    }

    /// Try to send on every connection that previously ran out of memory.
    pub fn tx_now(&mut self, host: &mut dyn Host) {
        let mut next = self.registry.head(Collection::Active);
        while let Some(pcb) = next {
            next = self.pools.next_of(pcb);
            let key = active_connection(pcb);
            let conn = self.record_mut(key);
            if conn.flags.contains(Flags::NAGLE_MEMERR) {
                let _ = host.output(key, conn);
            }
        }
    }

    fn slow_timer(&mut self, key: ConnectionKey, host: &mut dyn Host) -> Verdict {
        let config = self.config;
        let now = self.ticks;
        let generation = self.timer_ctr;
        let conn = self.record_mut(key);
        debug_assert!(conn.state().is_active());

        if conn.last_timer == generation {
            return Verdict::Skip;
        }
        conn.last_timer = generation;

        let state = conn.state();
        let mut remove = false;
        let mut reset = false;

        if state == State::SynSent && conn.rtt.nrtx >= config.syn_max_rtx {
            net_debug!("tcp: {:?} max SYN retries reached", key);
            remove = true;
        } else if conn.rtt.nrtx >= config.max_rtx {
            net_debug!("tcp: {:?} max data retries reached", key);
            remove = true;
        } else if conn.persist.backoff > 0 {
            persist(key, conn, host);
        } else {
            retransmit(key, conn, host);
        }

        let idle = now.elapsed_since(conn.tmr);

        // A connection merely shut down for sending may wait for the peer indefinitely.
        if state == State::FinWait2
            && conn.user == UserRef::Released
            && idle > config.slow_ticks(config.fin_wait_timeout)
        {
            net_debug!("tcp: removing {:?} stuck in FIN-WAIT-2", key);
            remove = true;
        }

        if conn.base.options.contains(SocketOptions::KEEPALIVE)
            && (state == State::Established || state == State::CloseWait)
        {
            if idle > millis_to_ticks(&config, conn.keepalive.abort_after()) {
                net_debug!("tcp: keepalive timeout on {:?} to {}", key, conn.remote);
                remove = true;
                reset = true;
            } else if idle > millis_to_ticks(&config, conn.keepalive.probe_after()) {
                if host.keepalive(key, conn).is_ok() {
                    conn.keepalive.sent = conn.keepalive.sent.saturating_add(1);
                }
            }
        }

        if state == State::SynReceived && idle > config.slow_ticks(config.syn_rcvd_timeout) {
            net_debug!("tcp: removing {:?} stuck in SYN-RCVD", key);
            remove = true;
        }

        if state == State::LastAck && idle > config.two_msl_ticks() {
            net_debug!("tcp: removing {:?} stuck in LAST-ACK", key);
            remove = true;
        }

        if remove {
            Verdict::Remove { reset }
        } else {
            Verdict::Keep
        }
    }
}

/// Advance zero window probing.
fn persist(key: ConnectionKey, conn: &mut Connection, host: &mut dyn Host) {
    let idx = usize::from(conn.persist.backoff - 1).min(PERSIST_BACKOFF.len() - 1);
    let backoff_cnt = PERSIST_BACKOFF[idx];

    if conn.persist.cnt < backoff_cnt {
        conn.persist.cnt += 1;
    }

    if conn.persist.cnt >= backoff_cnt && host.zero_window_probe(key, conn).is_ok() {
        conn.persist.cnt = 0;
        if usize::from(conn.persist.backoff) < PERSIST_BACKOFF.len() {
            conn.persist.backoff += 1;
        }
    }
}

/// Advance the retransmission timer and retransmit on expiry.
fn retransmit(key: ConnectionKey, conn: &mut Connection, host: &mut dyn Host) {
    if conn.rtt.rtime >= 0 {
        conn.rtt.rtime = conn.rtt.rtime.saturating_add(1);
    }

    if conn.send_queue.is_empty() || conn.rtt.rtime < conn.rtt.rto {
        return;
    }

    // Back off, unless still connecting.
    if conn.state() != State::SynSent {
        let shift = BACKOFF[usize::from(conn.rtt.nrtx).min(BACKOFF.len() - 1)];
        let rto = (i32::from(conn.rtt.sa >> 3) + i32::from(conn.rtt.sv)) << shift;
        conn.rtt.rto = rto.min(i32::from(i16::max_value())) as i16;
    }
    conn.rtt.rtime = 0;

    // Multiplicative decrease.
    let eff_wnd = conn.cwnd.min(conn.snd_wnd);
    conn.ssthresh = (eff_wnd >> 1).max(conn.mss.saturating_mul(2));
    conn.cwnd = conn.mss;

    net_trace!("tcp: retransmitting on {:?}, rto {} cwnd {} ssthresh {}",
        key, conn.rtt.rto, conn.cwnd, conn.ssthresh);
    conn.send_queue.rewind();
    conn.rtt.nrtx = conn.rtt.nrtx.saturating_add(1);
    let _ = host.output(key, conn);
}

fn millis_to_ticks(config: &Config, millis: u64) -> u32 {
    config.slow_ticks(Duration::from_millis(millis))
}

fn active_connection(pcb: PcbKey) -> ConnectionKey {
    match pcb.connection() {
        Some(key) => key,
        None => panic!("Listener {:?} in a connection collection", pcb),
    }
}
