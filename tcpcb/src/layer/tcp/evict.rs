//! Reclaiming records when the storage runs full.
use core::cmp::Reverse;

use alloc::vec::Vec;

use crate::layer::Error;

use super::endpoint::Endpoint;
use super::host::Host;
use super::pcb::State;
use super::registry::{Collection, ConnectionKey};

/// One step of the eviction cascade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Eviction {
    /// The oldest connection in time-wait, freed silently.
    TimeWait,
    /// The oldest active connection in a particular closing state.
    State(State),
    /// The oldest active connection of the lowest priority not above the requested one.
    Priority,
}

/// The steps in the order they are tried.
pub(crate) const CASCADE: [Eviction; 4] = [
    Eviction::TimeWait,
    Eviction::State(State::LastAck),
    Eviction::State(State::Closing),
    Eviction::Priority,
];

/// A record considered for eviction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Candidate<K> {
    pub(crate) key: K,
    pub(crate) prio: u8,
    /// Ticks since the last activity.
    pub(crate) idle: u32,
}

/// Choose the victim among candidates.
///
/// The lowest priority loses, among those the longest idle. On a complete tie the candidate seen
/// later wins, which for a collection is the earlier inserted.
pub(crate) fn select<K>(candidates: impl IntoIterator<Item=Candidate<K>>) -> Option<Candidate<K>> {
    candidates.into_iter().fold(None, |best, candidate| match best {
        Some(best) if (best.prio, Reverse(best.idle)) < (candidate.prio, Reverse(candidate.idle)) => {
            Some(best)
        },
        _ => Some(candidate),
    })
}

impl Endpoint<'_> {
    /// Run one step of the cascade.
    ///
    /// Returns whether a record was freed.
    pub(crate) fn evict(&mut self, step: Eviction, prio: u8, host: &mut dyn Host) -> bool {
        let victim = match step {
            Eviction::TimeWait => {
                self.select_victim(Collection::TimeWait, prio, |_, _| Some(0))
            },
            Eviction::State(wanted) => self.select_victim(Collection::Active, prio, |state, _| {
                if state == wanted { Some(0) } else { None }
            }),
            Eviction::Priority => {
                self.select_victim(Collection::Active, prio, |_, record_prio| Some(record_prio))
            },
        };

        let victim = match victim {
            Some(victim) => victim,
            None => return false,
        };

        let key = victim.key;
        net_debug!("tcp: evicting {:?} ({:?}, prio {}, idle {})", key, step, victim.prio, victim.idle);
        if step != Eviction::TimeWait {
            self.report_error(key, Error::Aborted, host);
        }

        // The error hook is free to get rid of the record on its own.
        if self.pools.connections.contains(key.0) {
            self.free_record(key, step == Eviction::Priority, None, host);
        }
        true
    }

    /// Find the victim of one eviction step.
    ///
    /// `rank` maps state and priority of a record to its eviction priority, or `None` if the
    /// record is not eligible. Records ranked above `limit` are never chosen.
    fn select_victim(
        &self,
        collection: Collection,
        limit: u8,
        rank: impl Fn(State, u8) -> Option<u8>,
    ) -> Option<Candidate<ConnectionKey>> {
        let now = self.ticks;
        let candidates: Vec<_> = self.registry.iter(&self.pools, collection)
            .filter_map(|key| key.connection())
            .filter_map(|key| {
                let conn = self.pools.connections.get(key.0)?;
                let prio = rank(conn.state(), conn.base.prio)?;
                Some(Candidate { key, prio, idle: now.elapsed_since(conn.tmr) })
            })
            .filter(|candidate| candidate.prio <= limit)
            .collect();

        select(candidates)
    }
}
