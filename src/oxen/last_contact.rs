//! The "last contact" table.
//!
//! The last contact table is used for making a number of decisions in the
//! engine, particularly message routing and deciding whether to give up on a
//! peer. When a message is sent for delivery, the time of the first attempt is
//! recorded. When the message is acknowledged, the time of the first attempt
//! becomes the "last contact" time. This keeps high latency from making hosts
//! appear more reachable than they actually are.
//!
//! Last contact information is merely a heuristic and never indicates anything
//! certain about the network, but a vague idea of what may or may not fail is
//! enough for routing and give-up decisions.

use std::collections::VecDeque;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::util::clock::Timestamp;
use crate::util::sid::Sid;
use crate::util::table::Table;
use crate::wire::LcGossip;

/// The sparse matrix `contacts[observer][observed] -> Timestamp`. The row of
/// the local SID is authoritative and only ever written through keepalive and
/// ack resolution; all other rows are whatever gossip last told us about that
/// observer's view.
pub struct LastContact {
    me: Sid,
    peers: Vec<Sid>,
    tab: Table<Sid, Timestamp>,
}

impl LastContact {
    pub fn new(me: Sid) -> LastContact {
        LastContact { me, peers: vec![me], tab: Table::new() }
    }

    /// Every SID that has ever appeared in a row or column. Sorted, so all
    ///  iteration over the matrix is deterministic.
    pub fn known_peers(&self) -> &[Sid] {
        &self.peers
    }

    fn note_peer(&mut self, sid: Sid) {
        if let Err(at) = self.peers.binary_search(&sid) {
            self.peers.insert(at, sid);
        }
    }

    /// Fetches the time of the last contact between two given nodes, or
    ///  [Timestamp::NEVER] if nothing is known about the pair.
    pub fn get(&self, from: &Sid, to: &Sid) -> Timestamp {
        self.tab.get(from, to).copied().unwrap_or(Timestamp::NEVER)
    }

    /// Advances the last contact time for a cell. Cells are monotonic: an
    ///  older observation never overwrites a newer one. Self-edges are
    ///  skipped because they don't really exist in the graph.
    pub fn put(&mut self, from: Sid, to: Sid, time: Timestamp) {
        self.note_peer(from);
        self.note_peer(to);

        if from == to {
            return;
        }

        let entry = self.tab.entry(from, to).or_insert(Timestamp::NEVER);
        if *entry < time {
            *entry = time;
        }
    }

    /// Registers a SID as known without recording any contact, e.g. a peer
    ///  named by configuration or by a join request.
    pub fn observe_peer(&mut self, sid: Sid) {
        self.note_peer(sid);
    }

    /// Determines if the indicated link is possibly usable: last contact no
    ///  older than `thresh` before `now`.
    pub fn usable(&self, from: &Sid, to: &Sid, now: Timestamp, thresh: Duration) -> bool {
        from != to && self.get(from, to) > saturating_back(now, thresh)
    }

    /// Determines if the indicated peer is possibly reachable: some observer
    ///  has a possibly usable link to it.
    pub fn reachable(&self, to: &Sid, now: Timestamp, thresh: Duration) -> bool {
        self.peers.iter().any(|p| self.usable(p, to, now, thresh))
    }

    /// The newest observation of `to` by any observer, or [Timestamp::NEVER].
    pub fn freshest(&self, to: &Sid) -> Timestamp {
        self.peers
            .iter()
            .map(|p| if p == to { Timestamp::NEVER } else { self.get(p, to) })
            .max()
            .unwrap_or(Timestamp::NEVER)
    }

    /// Attempts to find the first node along a shortest possibly-usable path
    ///  from this node to peer `to`. Ties between equal-length paths are
    ///  broken toward lower SIDs (byte-lexicographic) because neighbors are
    ///  expanded in sorted order. `None` means we appear to be partitioned
    ///  from `to`.
    pub fn route(&self, to: &Sid, now: Timestamp, thresh: Duration) -> Option<Sid> {
        if *to == self.me {
            return None;
        }

        let mut parents: FxHashMap<Sid, Sid> = FxHashMap::default();
        let mut queue: VecDeque<Sid> = VecDeque::new();

        parents.insert(self.me, self.me);
        queue.push_back(self.me);

        while let Some(u) = queue.pop_front() {
            for n in &self.peers {
                if parents.contains_key(n) || !self.usable(&u, n, now, thresh) {
                    continue;
                }

                parents.insert(*n, u);

                if n != to {
                    queue.push_back(*n);
                    continue;
                }

                // found: walk the parent chain back to our own neighbor
                let mut at = *n;
                loop {
                    let p = parents[&at];
                    if p == self.me {
                        return Some(at);
                    }
                    at = p;
                }
            }
        }

        None
    }

    /// Assembles a gossip fragment: the cells of every row that intersect the
    ///  given column selection. Rows with no information about any selected
    ///  column are omitted entirely, as are unknown cells.
    pub fn fragment(&self, cols: &[Sid]) -> LcGossip {
        let mut gossip = LcGossip::default();

        for r in &self.peers {
            let mut row = std::collections::BTreeMap::new();
            for c in cols {
                if let Some(&t) = self.tab.get(r, c) {
                    row.insert(*c, t);
                }
            }
            if !row.is_empty() {
                gossip.rows.insert(*r, row);
            }
        }

        gossip
    }

    /// Merges a received gossip fragment, cell-wise by max timestamp. The
    ///  local row is authoritative and never touched by gossip.
    ///
    /// Returns true iff any cell advanced.
    pub fn merge_gossip(&mut self, gossip: &LcGossip) -> bool {
        let mut changed = false;

        for (r, row) in &gossip.rows {
            if *r == self.me {
                trace!("gossip carries a row about ourselves - ignoring it");
                continue;
            }
            for (c, &t) in row {
                if self.get(r, c) < t {
                    self.put(*r, *c, t);
                    changed = true;
                }
                else {
                    // still note the SIDs: an all-stale row can introduce peers
                    self.note_peer(*r);
                    self.note_peer(*c);
                }
            }
        }

        changed
    }
}

fn saturating_back(now: Timestamp, d: Duration) -> Timestamp {
    Timestamp::from_millis(now.as_millis().saturating_sub(d.as_millis() as u64))
}
