//! Per-peer sequenced channels: the inbound buffers that turn at-least-once
//! out-of-order message delivery into exactly-once in-order payload release,
//! and the outbound sequence counters feeding them.
//!
//! Each origin runs one broadcast and one one-to-one stream per receiver. A
//! stream starts with a Synchronize declaring the sequence floors and ends
//! with a Finalize declaring the last sequence numbers that will ever be sent.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::oxen::events::StreamKind;
use crate::util::sid::Sid;
use crate::wire::{MsgId, SeqNum};

/// A well-formed parcel that violates stream semantics. The offending message
/// is still acknowledged (so the origin stops retransmitting) but nothing is
/// delivered; the violation is logged and never surfaces as a user event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamViolation {
    #[error("stream data from {origin:?} (seq {seq}) before a synchronize")]
    PrematureData { origin: Sid, kind: StreamKind, seq: SeqNum },
    #[error("synchronize from {origin:?} does not match the stream floors it declared before")]
    SyncMismatch { origin: Sid },
    #[error("synchronize from {origin:?} after it finalized")]
    SyncAfterFinalize { origin: Sid },
    #[error("finalize from {origin:?} below its delivered watermark")]
    FinalizeBelowDelivered { origin: Sid },
    #[error("stream data from {origin:?} (seq {seq}) beyond its finalize")]
    DataBeyondFinalize { origin: Sid, kind: StreamKind, seq: SeqNum },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Unknown,
    Synced,
    Finalizing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// first synchronize from this origin
    First,
    /// retransmission of a synchronize we already acted on
    Duplicate,
}

/// Result of accepting a stream data message: zero or more payloads released
/// in order, and whether this message drained a finalizing peer.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DataOutcome {
    pub deliveries: Vec<(StreamKind, Vec<u8>)>,
    pub closed: bool,
}

#[derive(Debug)]
struct StreamState {
    last_delivered: SeqNum,
    finalize_seq: Option<SeqNum>,
    buffer: BTreeMap<SeqNum, Vec<u8>>,
}

impl StreamState {
    fn new(floor: SeqNum) -> StreamState {
        StreamState { last_delivered: floor, finalize_seq: None, buffer: BTreeMap::new() }
    }

    fn drained(&self) -> bool {
        match self.finalize_seq {
            Some(f) => self.last_delivered >= f,
            None => false,
        }
    }

    /// Buffers `seq` and releases everything that became contiguous.
    fn accept(&mut self, kind: StreamKind, seq: SeqNum, data: Vec<u8>, out: &mut Vec<(StreamKind, Vec<u8>)>) {
        if seq <= self.last_delivered {
            return; // duplicate of something already released
        }
        self.buffer.insert(seq, data);

        while let Some(data) = self.buffer.remove(&(self.last_delivered + 1)) {
            self.last_delivered += 1;
            out.push((kind, data));
        }
    }
}

#[derive(Debug)]
struct OriginState {
    phase: StreamPhase,
    initial_brd: SeqNum,
    initial_one: SeqNum,
    brd: StreamState,
    one: StreamState,
    /// ids of blob messages already released, for at-most-once delivery on
    ///  the fast path
    seen_blobs: FxHashSet<MsgId>,
}

/// Inbound half: stream state per remote origin.
pub struct InboundStreams {
    by_origin: FxHashMap<Sid, OriginState>,
}

impl InboundStreams {
    pub fn new() -> InboundStreams {
        InboundStreams { by_origin: FxHashMap::default() }
    }

    pub fn phase(&self, origin: &Sid) -> StreamPhase {
        self.by_origin.get(origin).map(|s| s.phase).unwrap_or(StreamPhase::Unknown)
    }

    pub fn on_sync(&mut self, origin: Sid, brd: SeqNum, one: SeqNum) -> Result<SyncOutcome, StreamViolation> {
        match self.by_origin.get_mut(&origin) {
            None => {
                self.by_origin.insert(origin, OriginState {
                    phase: StreamPhase::Synced,
                    initial_brd: brd,
                    initial_one: one,
                    brd: StreamState::new(brd),
                    one: StreamState::new(one),
                    seen_blobs: FxHashSet::default(),
                });
                Ok(SyncOutcome::First)
            }
            // blob traffic may have created the entry before any synchronize
            Some(state) if state.phase == StreamPhase::Unknown => {
                state.phase = StreamPhase::Synced;
                state.initial_brd = brd;
                state.initial_one = one;
                state.brd = StreamState::new(brd);
                state.one = StreamState::new(one);
                Ok(SyncOutcome::First)
            }
            Some(state) if state.phase == StreamPhase::Synced => {
                if state.initial_brd == brd && state.initial_one == one {
                    Ok(SyncOutcome::Duplicate)
                }
                else {
                    Err(StreamViolation::SyncMismatch { origin })
                }
            }
            Some(_) => Err(StreamViolation::SyncAfterFinalize { origin }),
        }
    }

    pub fn on_final(&mut self, origin: Sid, brd: SeqNum, one: SeqNum) -> Result<DataOutcome, StreamViolation> {
        let state = match self.by_origin.get_mut(&origin) {
            None => {
                return Err(StreamViolation::PrematureData { origin, kind: StreamKind::Broadcast, seq: brd })
            }
            Some(state) if state.phase == StreamPhase::Unknown => {
                return Err(StreamViolation::PrematureData { origin, kind: StreamKind::Broadcast, seq: brd })
            }
            Some(state) => state,
        };

        if state.phase == StreamPhase::Closed {
            return Ok(DataOutcome::default());
        }
        if brd < state.brd.last_delivered || one < state.one.last_delivered {
            return Err(StreamViolation::FinalizeBelowDelivered { origin });
        }

        state.brd.finalize_seq = Some(brd);
        state.one.finalize_seq = Some(one);
        state.phase = StreamPhase::Finalizing;

        let mut outcome = DataOutcome::default();
        if state.brd.drained() && state.one.drained() {
            state.phase = StreamPhase::Closed;
            outcome.closed = true;
        }
        Ok(outcome)
    }

    pub fn on_data(&mut self, origin: Sid, kind: StreamKind, seq: SeqNum, data: Vec<u8>) -> Result<DataOutcome, StreamViolation> {
        let state = match self.by_origin.get_mut(&origin) {
            None => return Err(StreamViolation::PrematureData { origin, kind, seq }),
            Some(state) if state.phase == StreamPhase::Unknown => {
                return Err(StreamViolation::PrematureData { origin, kind, seq })
            }
            Some(state) => state,
        };

        if state.phase == StreamPhase::Closed {
            return Ok(DataOutcome::default());
        }

        let stream = match kind {
            StreamKind::Broadcast => &mut state.brd,
            StreamKind::OneToOne => &mut state.one,
            StreamKind::Unreliable => unreachable!("blobs have no sequence"),
        };

        if matches!(stream.finalize_seq, Some(f) if seq > f) {
            return Err(StreamViolation::DataBeyondFinalize { origin, kind, seq });
        }

        let mut outcome = DataOutcome::default();
        stream.accept(kind, seq, data, &mut outcome.deliveries);

        if state.phase == StreamPhase::Finalizing && state.brd.drained() && state.one.drained() {
            state.phase = StreamPhase::Closed;
            outcome.closed = true;
        }
        Ok(outcome)
    }

    /// At-most-once dedup for tracked blob messages; untracked blobs (no id)
    ///  are never deduplicated. Returns true iff the payload should be
    ///  delivered.
    pub fn accept_blob(&mut self, origin: Sid, id: Option<MsgId>) -> bool {
        let id = match id {
            Some(id) => id,
            None => return true,
        };
        match self.by_origin.get_mut(&origin) {
            Some(state) => state.seen_blobs.insert(id),
            None => {
                // blobs are legal before a synchronize; dedup still applies
                let mut state = OriginState {
                    phase: StreamPhase::Unknown,
                    initial_brd: 0,
                    initial_one: 0,
                    brd: StreamState::new(0),
                    one: StreamState::new(0),
                    seen_blobs: FxHashSet::default(),
                };
                state.seen_blobs.insert(id);
                self.by_origin.insert(origin, state);
                true
            }
        }
    }

    pub fn forget(&mut self, origin: &Sid) {
        self.by_origin.remove(origin);
    }
}

/// Outbound half: broadcast and one-to-one sequence counters per destination.
/// Broadcast sequences are per-(origin, receiver): every destination sees a
/// dense stream of its own.
pub struct OutboundStreams {
    by_dest: FxHashMap<Sid, OutboundDest>,
}

#[derive(Default)]
struct OutboundDest {
    brd: SeqNum,
    one: SeqNum,
    synced: bool,
}

impl OutboundStreams {
    pub fn new() -> OutboundStreams {
        OutboundStreams { by_dest: FxHashMap::default() }
    }

    pub fn next_brd(&mut self, dest: Sid) -> SeqNum {
        let state = self.by_dest.entry(dest).or_default();
        state.brd += 1;
        state.brd
    }

    pub fn next_one(&mut self, dest: Sid) -> SeqNum {
        let state = self.by_dest.entry(dest).or_default();
        state.one += 1;
        state.one
    }

    /// The current sequence floors, i.e. one less than the next sequence to
    ///  be sent on each stream. What Synchronize and Finalize declare.
    pub fn floors(&self, dest: &Sid) -> (SeqNum, SeqNum) {
        match self.by_dest.get(dest) {
            Some(state) => (state.brd, state.one),
            None => (0, 0),
        }
    }

    pub fn is_synced(&self, dest: &Sid) -> bool {
        self.by_dest.get(dest).map(|s| s.synced).unwrap_or(false)
    }

    pub fn mark_synced(&mut self, dest: Sid) {
        self.by_dest.entry(dest).or_default().synced = true;
    }

    pub fn forget(&mut self, dest: &Sid) {
        self.by_dest.remove(dest);
    }
}
