//! Keepalive bookkeeping, per neighbor.
//!
//! A `ka` id travels on any outbound parcel and asks the neighbor to echo it
//! back as `kk`. Resolving the echo against the locally remembered send time
//! is the only path (besides direct acks) that advances the local row of the
//! last-contact matrix.

use std::collections::VecDeque;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::util::clock::Timestamp;
use crate::util::sid::Sid;
use crate::wire::KeepaliveId;

pub struct Keepalives {
    window: usize,
    by_neighbor: FxHashMap<Sid, NeighborState>,
}

struct NeighborState {
    next_id: KeepaliveId,
    /// unresolved sent ids with their send times, oldest first
    sent: VecDeque<(KeepaliveId, Timestamp)>,
    /// the most recent still-unanswered `ka` received from this neighbor,
    ///  with the deadline for a standalone echo
    pending_echo: Option<(KeepaliveId, Timestamp)>,
    last_sent: Timestamp,
}

impl NeighborState {
    fn new() -> NeighborState {
        NeighborState {
            next_id: 1,
            sent: VecDeque::new(),
            pending_echo: None,
            last_sent: Timestamp::NEVER,
        }
    }
}

impl Keepalives {
    pub fn new(window: usize) -> Keepalives {
        Keepalives { window, by_neighbor: FxHashMap::default() }
    }

    fn state(&mut self, neighbor: Sid) -> &mut NeighborState {
        self.by_neighbor.entry(neighbor).or_insert_with(NeighborState::new)
    }

    /// Allocates a fresh `ka` id bound to `(neighbor, now)`. The unresolved
    ///  window is capped; the oldest id is evicted when it overflows.
    pub fn allocate(&mut self, neighbor: Sid, now: Timestamp) -> KeepaliveId {
        let window = self.window;
        let state = self.state(neighbor);

        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1).max(1);
        state.sent.push_back((id, now));
        while state.sent.len() > window {
            state.sent.pop_front();
        }
        id
    }

    /// Records that a parcel went out to `neighbor`, for idle tracking.
    pub fn note_sent(&mut self, neighbor: Sid, now: Timestamp) {
        self.state(neighbor).last_sent = now;
    }

    pub fn last_sent(&self, neighbor: &Sid) -> Timestamp {
        self.by_neighbor.get(neighbor).map(|s| s.last_sent).unwrap_or(Timestamp::NEVER)
    }

    /// A `ka` arrived from `neighbor`: schedule it to be echoed, replacing any
    ///  older unanswered one.
    pub fn on_ka_received(&mut self, neighbor: Sid, id: KeepaliveId, now: Timestamp, echo_delay: Duration) {
        self.state(neighbor).pending_echo = Some((id, now.plus(echo_delay)));
    }

    /// A `kk` arrived from `neighbor`: resolve it to the send time we
    ///  remembered, if we still do. Duplicate echoes resolve to nothing.
    pub fn on_kk_received(&mut self, neighbor: Sid, id: KeepaliveId) -> Option<Timestamp> {
        let state = self.by_neighbor.get_mut(&neighbor)?;
        let at = state.sent.iter().position(|(k, _)| *k == id)?;
        state.sent.remove(at).map(|(_, ts)| ts)
    }

    /// Takes the pending echo for piggybacking on an outbound parcel.
    pub fn take_echo(&mut self, neighbor: &Sid) -> Option<KeepaliveId> {
        self.by_neighbor
            .get_mut(neighbor)?
            .pending_echo
            .take()
            .map(|(id, _)| id)
    }

    /// Neighbors whose pending echo has waited past its deadline and needs a
    ///  standalone `kk` parcel.
    pub fn due_echoes(&self, now: Timestamp) -> Vec<Sid> {
        let mut due: Vec<Sid> = self
            .by_neighbor
            .iter()
            .filter(|(_, s)| matches!(s.pending_echo, Some((_, deadline)) if deadline <= now))
            .map(|(sid, _)| *sid)
            .collect();
        due.sort();
        due
    }

    /// Drops all state for a neighbor we have given up on.
    pub fn forget(&mut self, neighbor: &Sid) {
        self.by_neighbor.remove(neighbor);
    }
}
