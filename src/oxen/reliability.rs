//! Outstanding-message tracking: id allocation, ack matching and the
//! retransmit schedule. Entries live until they are acknowledged or their
//! destination is given up on.

use std::collections::BTreeMap;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::util::clock::Timestamp;
use crate::util::sid::Sid;
use crate::wire::{MsgData, MsgId};

pub struct Reliability {
    by_dest: FxHashMap<Sid, DestState>,
}

struct DestState {
    next_id: MsgId,
    outstanding: BTreeMap<MsgId, Outstanding>,
}

impl DestState {
    fn new() -> DestState {
        DestState { next_id: 1, outstanding: BTreeMap::new() }
    }
}

#[derive(Debug, Clone)]
pub struct Outstanding {
    pub msg: MsgData,
    /// time of the very first transmission; what the last-contact cell is set
    ///  to when the ack arrives. Never overwritten by retransmits.
    pub first_send_time: Timestamp,
    pub last_send_time: Timestamp,
    pub retry_count: u32,
    /// whether the most recent transmission went straight to the destination
    ///  (as opposed to via an intermediate hop)
    pub direct: bool,
}

/// What an ack resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckResolution {
    pub first_send_time: Timestamp,
    pub direct: bool,
}

impl Reliability {
    pub fn new() -> Reliability {
        Reliability { by_dest: FxHashMap::default() }
    }

    /// Allocates the next message id on the outbound channel to `dest`.
    pub fn allocate_id(&mut self, dest: Sid) -> MsgId {
        let state = self.by_dest.entry(dest).or_insert_with(DestState::new);
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    /// Starts tracking a transmitted message. `direct` records whether the
    ///  first hop was the destination itself.
    pub fn track(&mut self, dest: Sid, msg: MsgData, now: Timestamp, direct: bool) {
        let state = self.by_dest.entry(dest).or_insert_with(DestState::new);
        let id = msg.id.expect("tracked messages carry an id");
        state.outstanding.insert(id, Outstanding {
            msg,
            first_send_time: now,
            last_send_time: now,
            retry_count: 0,
            direct,
        });
    }

    /// Matches an incoming ack from `fr` against the outstanding table.
    ///  Duplicates resolve to `None` and have no effect.
    pub fn on_ack(&mut self, fr: Sid, id: MsgId) -> Option<AckResolution> {
        let state = self.by_dest.get_mut(&fr)?;
        let entry = state.outstanding.remove(&id)?;
        Some(AckResolution {
            first_send_time: entry.first_send_time,
            direct: entry.direct,
        })
    }

    /// Entries whose backoff interval has elapsed since their last
    ///  transmission: `retry_base * 2^min(retry_count, retry_cap)`.
    pub fn due_retransmits(&self, now: Timestamp, retry_base: Duration, retry_cap: u32) -> Vec<(Sid, MsgId)> {
        let mut due = Vec::new();
        for (dest, state) in &self.by_dest {
            for (id, entry) in &state.outstanding {
                let backoff = retry_base * 2u32.pow(entry.retry_count.min(retry_cap));
                if now.elapsed_since(entry.last_send_time) >= backoff {
                    due.push((*dest, *id));
                }
            }
        }
        due.sort();
        due
    }

    pub fn get(&self, dest: &Sid, id: MsgId) -> Option<&Outstanding> {
        self.by_dest.get(dest)?.outstanding.get(&id)
    }

    /// Records a retransmission: bumps the retry count and the last send time,
    ///  preserving `first_send_time`.
    pub fn mark_retransmitted(&mut self, dest: &Sid, id: MsgId, now: Timestamp, direct: bool) {
        if let Some(entry) = self.by_dest.get_mut(dest).and_then(|s| s.outstanding.get_mut(&id)) {
            entry.last_send_time = now;
            entry.retry_count += 1;
            entry.direct = direct;
        }
    }

    /// Drops every outstanding entry for a destination we have given up on.
    ///  The id counter survives so a revived peering does not reuse ids.
    pub fn clear_dest(&mut self, dest: &Sid) -> usize {
        match self.by_dest.get_mut(dest) {
            Some(state) => {
                let n = state.outstanding.len();
                state.outstanding.clear();
                n
            }
            None => 0,
        }
    }

    #[cfg(test)]
    pub fn outstanding_count(&self, dest: &Sid) -> usize {
        self.by_dest.get(dest).map(|s| s.outstanding.len()).unwrap_or(0)
    }
}
