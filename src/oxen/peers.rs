//! Per-peer lifecycle classification, derived from the last-contact matrix.
//!
//! ```text
//!    (no observation)
//!           │ first usable observation
//!           ▼
//!       Reachable  ──all links stale──▶  Unreachable
//!           ▲                                 │
//!           │ any usable observation          │ unreachable for give_up_after
//!           │                                 ▼
//!           └──── fresh usable observation ── GivenUp
//! ```
//!
//! Only the transitions into Reachable (from nothing or from GivenUp) and into
//! GivenUp are user-visible; recovering from a mere Unreachable is silent.

use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::oxen::last_contact::LastContact;
use crate::util::clock::Timestamp;
use crate::util::sid::Sid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Reachable,
    Unreachable { since: Timestamp },
    /// departed, whether by give-up or by finalize; only an observation newer
    ///  than `at` revives the peer
    GivenUp { at: Timestamp },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTransition {
    Up(Sid),
    Down(Sid),
}

pub struct PeerTracker {
    me: Sid,
    status: FxHashMap<Sid, PeerStatus>,
}

impl PeerTracker {
    pub fn new(me: Sid) -> PeerTracker {
        PeerTracker { me, status: FxHashMap::default() }
    }

    pub fn status(&self, sid: &Sid) -> Option<PeerStatus> {
        self.status.get(sid).copied()
    }

    pub fn is_given_up(&self, sid: &Sid) -> bool {
        matches!(self.status.get(sid), Some(PeerStatus::GivenUp { .. }))
    }

    /// Forces a peer into the departed state without emitting a transition,
    ///  for finalize-induced (expected) departures. The caller is responsible
    ///  for the accompanying user event.
    pub fn mark_departed(&mut self, sid: Sid, now: Timestamp) {
        self.status.insert(sid, PeerStatus::GivenUp { at: now });
    }

    /// Re-derives the status of every known peer from the matrix, returning
    ///  the user-visible transitions in deterministic (sorted) order.
    pub fn reclassify(
        &mut self,
        lc: &LastContact,
        now: Timestamp,
        link_stale: Duration,
        give_up_after: Duration,
    ) -> Vec<PeerTransition> {
        let mut transitions = Vec::new();

        for &p in lc.known_peers() {
            if p == self.me {
                continue;
            }

            let reachable = lc.reachable(&p, now, link_stale);

            match self.status.get(&p).copied() {
                None => {
                    if reachable {
                        self.status.insert(p, PeerStatus::Reachable);
                        transitions.push(PeerTransition::Up(p));
                    }
                    else {
                        debug!("peer {:?} is known but has never been observed usable", p);
                        self.status.insert(p, PeerStatus::Unreachable { since: now });
                    }
                }
                Some(PeerStatus::Reachable) => {
                    if !reachable {
                        debug!("peer {:?} became possibly unreachable", p);
                        self.status.insert(p, PeerStatus::Unreachable { since: now });
                    }
                }
                Some(PeerStatus::Unreachable { since }) => {
                    if reachable {
                        debug!("peer {:?} became possibly reachable again", p);
                        self.status.insert(p, PeerStatus::Reachable);
                    }
                    else if now.elapsed_since(since) >= give_up_after {
                        self.status.insert(p, PeerStatus::GivenUp { at: now });
                        transitions.push(PeerTransition::Down(p));
                    }
                }
                Some(PeerStatus::GivenUp { at }) => {
                    let fresh = lc.freshest(&p);
                    if fresh > at && lc.reachable(&p, now, link_stale) {
                        self.status.insert(p, PeerStatus::Reachable);
                        transitions.push(PeerTransition::Up(p));
                    }
                }
            }
        }

        transitions
    }
}
