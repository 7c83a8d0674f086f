//! The engine core: a single-threaded state machine that consumes inbound
//! parcels, timer ticks and user requests, and produces outbound datagrams
//! and user events through its backend.
//!
//! The core never does I/O and never reads a real clock; everything it needs
//! from the outside world comes through [OxenBackend]. One event is processed
//! to completion before the next one starts, so no table is ever observed
//! mid-update.

use std::sync::Arc;

use anyhow::bail;
use rustc_hash::FxHashSet;
use tracing::{debug, info, trace, warn};

use crate::oxen::config::OxenConfig;
use crate::oxen::events::{MessageArrivedData, OxenEvent, PeerDownData, PeerUpData, StreamKind};
use crate::oxen::keepalive::Keepalives;
use crate::oxen::last_contact::LastContact;
use crate::oxen::peers::{PeerTracker, PeerTransition};
use crate::oxen::reliability::Reliability;
use crate::oxen::sequencer::{InboundStreams, OutboundStreams, SyncOutcome};
use crate::util::clock::Timestamp;
use crate::util::random::Random;
use crate::util::sid::Sid;
use crate::wire::{
    MsgAck, MsgBrd, MsgData, MsgDataBody, MsgFinal, MsgId, MsgOne, MsgSync, Parcel, ParcelBody,
};

/// Conservative allowance for everything in a parcel besides the payload
///  octets: envelope keys, keepalive ids, SIDs, message id and sequence
///  framing.
const PARCEL_OVERHEAD: usize = 128;

/// The backend the engine runs on top of. The driver implements this against
///  the socket and the user event queue; tests implement it against vectors.
pub trait OxenBackend {
    /// Current time on the engine's monotonic clock.
    fn now(&self) -> Timestamp;

    /// Queues an encoded parcel for datagram transmission to a direct
    ///  neighbor.
    fn queue_send(&mut self, to: Sid, data: Vec<u8>);

    /// Hands an event to the user.
    fn deliver(&mut self, event: OxenEvent);

    fn queue_send_parcel(&mut self, to: Sid, parcel: Parcel) {
        self.queue_send(to, parcel.to_bytes());
    }
}

pub struct Oxen {
    me: Sid,
    config: Arc<OxenConfig>,
    rng: Box<dyn Random>,

    lc: LastContact,
    peers: PeerTracker,
    reliability: Reliability,
    keepalives: Keepalives,
    inbound: InboundStreams,
    outbound: OutboundStreams,

    /// peers with an explicit synchronize handshake in either direction;
    ///  their peer-up transitions count as expected
    handshaken: FxHashSet<Sid>,
    leaving: bool,
}

impl Oxen {
    pub fn new(me: Sid, config: Arc<OxenConfig>, rng: Box<dyn Random>) -> Oxen {
        Oxen {
            me,
            keepalives: Keepalives::new(config.keepalive_window),
            config,
            rng,
            lc: LastContact::new(me),
            peers: PeerTracker::new(me),
            reliability: Reliability::new(),
            inbound: InboundStreams::new(),
            outbound: OutboundStreams::new(),
            handshaken: FxHashSet::default(),
            leaving: false,
        }
    }

    pub fn me(&self) -> Sid {
        self.me
    }

    /// Registers a peer we know of, e.g. from configuration. No contact is
    ///  implied; the peer starts its life possibly unreachable.
    pub fn add_peer(&mut self, sid: Sid) {
        self.lc.observe_peer(sid);
    }

    /// Known peers that are not given up on, in sorted order.
    pub fn live_peers(&self) -> Vec<Sid> {
        self.lc
            .known_peers()
            .iter()
            .filter(|&&p| p != self.me && !self.peers.is_given_up(&p))
            .copied()
            .collect()
    }

    // ---- user requests ------------------------------------------------------

    /// Declares this node a founding member. There is nobody to talk to yet,
    ///  so nothing goes on the wire.
    pub fn start_cluster(&mut self) {
        info!("starting a new cluster as {:?}", self.me);
    }

    /// Joins an existing cluster through a helping peer: synchronize toward
    ///  it and wait for its ack (and gossip) to bring it up.
    pub fn join_cluster<B: OxenBackend>(&mut self, back: &mut B, help: Sid) -> anyhow::Result<()> {
        info!("joining cluster via {:?}", help);
        self.lc.observe_peer(help);
        self.handshaken.insert(help);
        self.ensure_synced(back, help)
    }

    /// Announces departure to every live peer, best effort. Delivery is not
    ///  awaited; the caller shuts the node down regardless.
    pub fn leave_cluster<B: OxenBackend>(&mut self, back: &mut B) {
        info!("leaving the cluster");
        for p in self.live_peers() {
            let result = self.ensure_synced(back, p).and_then(|()| {
                let (brd, one) = self.outbound.floors(&p);
                self.send_tracked(back, p, MsgDataBody::MsgFinal(MsgFinal { brd, one }))
                    .map(|_| ())
            });
            if let Err(e) = result {
                warn!("could not announce departure to {:?}: {}", p, e);
            }
        }
        self.leaving = true;
    }

    /// Unreliable datagram: an `md` without an id, untracked.
    pub fn send_datagram<B: OxenBackend>(&mut self, back: &mut B, to: Sid, data: Vec<u8>) -> anyhow::Result<()> {
        self.check_payload(&data)?;
        if self.peers.is_given_up(&to) {
            debug!("dropping datagram to given-up peer {:?}", to);
            return Ok(());
        }
        self.lc.observe_peer(to);
        let md = MsgData { to, fr: self.me, id: None, body: MsgDataBody::Blob(data) };
        let (hop, _) = self.route_for(&to, back.now());
        self.emit_body(back, hop, ParcelBody::MsgData(md))
    }

    pub fn broadcast_datagram<B: OxenBackend>(&mut self, back: &mut B, data: Vec<u8>) -> anyhow::Result<()> {
        self.check_payload(&data)?;
        for p in self.live_peers() {
            self.send_datagram(back, p, data.clone())?;
        }
        Ok(())
    }

    /// Reliable at-least-once out-of-order delivery: a tracked `md` carrying
    ///  raw octets. The receiver deduplicates by id.
    pub fn send_reliable<B: OxenBackend>(&mut self, back: &mut B, to: Sid, data: Vec<u8>) -> anyhow::Result<()> {
        self.check_payload(&data)?;
        if self.peers.is_given_up(&to) {
            debug!("dropping reliable send to given-up peer {:?}", to);
            return Ok(());
        }
        self.lc.observe_peer(to);
        self.send_tracked(back, to, MsgDataBody::Blob(data)).map(|_| ())
    }

    /// Reliable exactly-once in-order delivery on the one-to-one stream.
    pub fn send_in_order<B: OxenBackend>(&mut self, back: &mut B, to: Sid, data: Vec<u8>) -> anyhow::Result<()> {
        self.check_payload(&data)?;
        if self.peers.is_given_up(&to) {
            debug!("dropping in-order send to given-up peer {:?}", to);
            return Ok(());
        }
        self.lc.observe_peer(to);
        self.ensure_synced(back, to)?;
        let seq = self.outbound.next_one(to);
        self.send_tracked(back, to, MsgDataBody::MsgOne(MsgOne { seq, data })).map(|_| ())
    }

    /// Reliable exactly-once in-order delivery on the broadcast stream, to
    ///  every live peer. Broadcast sequences are per receiver.
    pub fn broadcast_in_order<B: OxenBackend>(&mut self, back: &mut B, data: Vec<u8>) -> anyhow::Result<()> {
        self.check_payload(&data)?;
        for p in self.live_peers() {
            self.ensure_synced(back, p)?;
            let seq = self.outbound.next_brd(p);
            self.send_tracked(back, p, MsgDataBody::MsgBrd(MsgBrd { seq, data: data.clone() }))?;
        }
        Ok(())
    }

    // ---- inbound ------------------------------------------------------------

    /// Processes one inbound datagram. `from` is the neighbor the datagram
    ///  arrived from, if the source address resolved to one; keepalive
    ///  attribution needs it, body handling does not.
    pub fn incoming<B: OxenBackend>(&mut self, back: &mut B, from: Option<Sid>, data: &[u8]) {
        trace!("received {} bytes from {:?}", data.len(), from);

        if data.len() > self.config.max_parcel_bytes {
            warn!("received an oversized datagram ({} bytes) - discarding", data.len());
            return;
        }

        let parcel = match Parcel::decode(data, self.config.schema_mode) {
            Ok(parcel) => parcel,
            Err(e) => {
                warn!("received a malformed parcel - discarding: {}", e);
                return;
            }
        };

        if let Some(n) = from {
            if self.peers.is_given_up(&n) {
                debug!("dropping parcel from given-up peer {:?}", n);
                return;
            }

            if let Some(ka) = parcel.ka_rq {
                self.keepalives.on_ka_received(n, ka, back.now(), self.config.keepalive_echo_delay);
            }
            if let Some(kk) = parcel.ka_ok {
                if let Some(sent_at) = self.keepalives.on_kk_received(n, kk) {
                    self.lc.put(self.me, n, sent_at);
                    self.reclassify_and_emit(back);
                }
            }
        }

        match parcel.body {
            ParcelBody::Missing => {}
            ParcelBody::MsgData(md) => self.on_msg_data(back, md),
            ParcelBody::MsgAck(ma) => self.on_msg_ack(back, ma),
            ParcelBody::LcGossip(gossip) => {
                if self.lc.merge_gossip(&gossip) {
                    self.reclassify_and_emit(back);
                }
            }
        }
    }

    fn on_msg_data<B: OxenBackend>(&mut self, back: &mut B, md: MsgData) {
        if md.to != self.me {
            if self.peers.is_given_up(&md.to) || self.peers.is_given_up(&md.fr) {
                debug!("not forwarding a message touching a given-up peer ({:?} -> {:?})", md.fr, md.to);
                return;
            }
            debug!("forwarding message from {:?} to {:?}", md.fr, md.to);
            let (hop, _) = self.route_for(&md.to, back.now());
            let _ = self.emit_body(back, hop, ParcelBody::MsgData(md));
            return;
        }

        let origin = md.fr;
        if self.peers.is_given_up(&origin) {
            debug!("dropping message from given-up peer {:?}", origin);
            return;
        }
        self.lc.observe_peer(origin);

        // ack before interpreting: even protocol violations are acked so the
        // origin stops retransmitting
        if let Some(id) = md.id {
            let ma = MsgAck { to: origin, fr: self.me, id };
            let (hop, _) = self.route_for(&origin, back.now());
            let _ = self.emit_body(back, hop, ParcelBody::MsgAck(ma));
        }

        match md.body {
            MsgDataBody::Blob(data) => {
                if self.inbound.accept_blob(origin, md.id) {
                    back.deliver(OxenEvent::MessageArrived(MessageArrivedData {
                        origin,
                        data,
                        stream_kind: StreamKind::Unreliable,
                    }));
                }
            }
            MsgDataBody::MsgSync(syn) => match self.inbound.on_sync(origin, syn.brd, syn.one) {
                Ok(SyncOutcome::First) => {
                    debug!("synchronized streams from {:?} at brd={} one={}", origin, syn.brd, syn.one);
                    self.handshaken.insert(origin);
                    if let Err(e) = self.ensure_synced(back, origin) {
                        warn!("could not synchronize back toward {:?}: {}", origin, e);
                    }
                    self.send_gossip_reply(back, origin);
                }
                Ok(SyncOutcome::Duplicate) => {}
                Err(violation) => warn!("stream violation: {}", violation),
            },
            MsgDataBody::MsgFinal(fin) => match self.inbound.on_final(origin, fin.brd, fin.one) {
                Ok(outcome) => {
                    debug!("peer {:?} finalized at brd={} one={}", origin, fin.brd, fin.one);
                    if outcome.closed {
                        self.finish_peer(back, origin);
                    }
                }
                Err(violation) => warn!("stream violation: {}", violation),
            },
            MsgDataBody::MsgBrd(brd) => self.on_stream_data(back, origin, StreamKind::Broadcast, brd.seq, brd.data),
            MsgDataBody::MsgOne(one) => self.on_stream_data(back, origin, StreamKind::OneToOne, one.seq, one.data),
        }
    }

    fn on_stream_data<B: OxenBackend>(&mut self, back: &mut B, origin: Sid, kind: StreamKind, seq: u32, data: Vec<u8>) {
        match self.inbound.on_data(origin, kind, seq, data) {
            Ok(outcome) => {
                for (kind, data) in outcome.deliveries {
                    back.deliver(OxenEvent::MessageArrived(MessageArrivedData {
                        origin,
                        data,
                        stream_kind: kind,
                    }));
                }
                if outcome.closed {
                    self.finish_peer(back, origin);
                }
            }
            Err(violation) => warn!("stream violation: {}", violation),
        }
    }

    fn on_msg_ack<B: OxenBackend>(&mut self, back: &mut B, ma: MsgAck) {
        if ma.to != self.me {
            if self.peers.is_given_up(&ma.to) || self.peers.is_given_up(&ma.fr) {
                debug!("not forwarding an ack touching a given-up peer ({:?} -> {:?})", ma.fr, ma.to);
                return;
            }
            debug!("forwarding ack from {:?} to {:?}", ma.fr, ma.to);
            let (hop, _) = self.route_for(&ma.to, back.now());
            let _ = self.emit_body(back, hop, ParcelBody::MsgAck(ma));
            return;
        }

        if self.peers.is_given_up(&ma.fr) {
            debug!("dropping ack from given-up peer {:?}", ma.fr);
            return;
        }

        match self.reliability.on_ack(ma.fr, ma.id) {
            Some(resolution) => {
                // a round trip through an intermediary says nothing about the
                // direct link, so only direct transmissions update our row
                if resolution.direct {
                    self.lc.put(self.me, ma.fr, resolution.first_send_time);
                    self.reclassify_and_emit(back);
                }
            }
            None => trace!("duplicate ack from {:?} for id {} - ignoring", ma.fr, ma.id),
        }
    }

    // ---- timers -------------------------------------------------------------

    /// Retransmit sweep, run at coarse cadence (~1s).
    pub fn on_retransmit_timer<B: OxenBackend>(&mut self, back: &mut B) {
        let now = back.now();
        for (dest, id) in self.reliability.due_retransmits(now, self.config.retry_base, self.config.retry_cap) {
            let md = match self.reliability.get(&dest, id) {
                Some(entry) => entry.msg.clone(),
                None => continue,
            };
            // the next hop may have changed since the last attempt
            let (hop, direct) = self.route_for(&dest, now);
            debug!("retransmitting message {} to {:?} via {:?}", id, dest, hop);
            if self.emit_body(back, hop, ParcelBody::MsgData(md)).is_ok() {
                self.reliability.mark_retransmitted(&dest, id, now, direct);
            }
        }
    }

    /// Keepalive sweep: flush overdue standalone echoes, probe idle
    ///  neighbors, and run the give-up clock.
    pub fn on_keepalive_timer<B: OxenBackend>(&mut self, back: &mut B) {
        let now = back.now();

        for n in self.keepalives.due_echoes(now) {
            if let Some(kk) = self.keepalives.take_echo(&n) {
                trace!("standalone keepalive echo {} to {:?}", kk, n);
                self.keepalives.note_sent(n, now);
                back.queue_send_parcel(n, Parcel { ka_rq: None, ka_ok: Some(kk), body: ParcelBody::Missing });
            }
        }

        if !self.leaving {
            for p in self.live_peers() {
                if now.elapsed_since(self.keepalives.last_sent(&p)) >= self.config.keepalive_idle {
                    let ka = self.keepalives.allocate(p, now);
                    let kk = self.keepalives.take_echo(&p);
                    trace!("standalone keepalive probe {} to idle neighbor {:?}", ka, p);
                    self.keepalives.note_sent(p, now);
                    back.queue_send_parcel(p, Parcel { ka_rq: Some(ka), ka_ok: kk, body: ParcelBody::Missing });
                }
            }
        }

        self.reclassify_and_emit(back);
    }

    /// Gossip emission: a random fragment of the matrix to a random partner.
    pub fn on_gossip_timer<B: OxenBackend>(&mut self, back: &mut B) {
        if self.leaving {
            return;
        }

        let mut candidates = self.live_peers();
        for _ in 0..self.config.gossip_partners {
            if candidates.is_empty() {
                return;
            }
            let target = candidates.swap_remove(self.rng.gen_usize_range(0..candidates.len()));

            let mut pool: Vec<Sid> = self.lc.known_peers().to_vec();
            let mut cols = Vec::new();
            while cols.len() < self.config.gossip_columns && !pool.is_empty() {
                let at = self.rng.gen_usize_range(0..pool.len());
                cols.push(pool.swap_remove(at));
            }

            let fragment = self.lc.fragment(&cols);
            if fragment.is_empty() {
                trace!("nothing to gossip about columns {:?}", cols);
                continue;
            }

            debug!("gossiping columns {:?} to {:?}", cols, target);
            let _ = self.emit_body(back, target, ParcelBody::LcGossip(fragment));
        }
    }

    // ---- internals ----------------------------------------------------------

    fn check_payload(&self, data: &[u8]) -> anyhow::Result<()> {
        if data.len() + PARCEL_OVERHEAD > self.config.max_parcel_bytes {
            bail!(
                "payload of {} bytes exceeds the parcel budget of {}",
                data.len(),
                self.config.max_parcel_bytes
            );
        }
        Ok(())
    }

    /// Sends a synchronize toward `dest` if we never did, declaring our
    ///  current sequence floors.
    fn ensure_synced<B: OxenBackend>(&mut self, back: &mut B, dest: Sid) -> anyhow::Result<()> {
        if self.outbound.is_synced(&dest) {
            return Ok(());
        }
        let (brd, one) = self.outbound.floors(&dest);
        self.send_tracked(back, dest, MsgDataBody::MsgSync(MsgSync { brd, one }))?;
        self.outbound.mark_synced(dest);
        self.handshaken.insert(dest);
        Ok(())
    }

    fn send_tracked<B: OxenBackend>(&mut self, back: &mut B, to: Sid, body: MsgDataBody) -> anyhow::Result<MsgId> {
        let now = back.now();
        let id = self.reliability.allocate_id(to);
        let md = MsgData { to, fr: self.me, id: Some(id), body };
        let (hop, direct) = self.route_for(&to, now);
        self.emit_body(back, hop, ParcelBody::MsgData(md.clone()))?;
        self.reliability.track(to, md, now, direct);
        Ok(id)
    }

    /// Next-hop selection: the direct link if it looks usable, otherwise the
    ///  first hop of a shortest usable path, otherwise the destination itself
    ///  as a best effort. The flag reports whether the transmission is
    ///  direct-to-destination.
    fn route_for(&self, to: &Sid, now: Timestamp) -> (Sid, bool) {
        if self.lc.usable(&self.me, to, now, self.config.link_stale) {
            return (*to, true);
        }
        match self.lc.route(to, now, self.config.link_stale) {
            Some(hop) => (hop, hop == *to),
            None => {
                debug!("no usable path to {:?} - attempting direct delivery", to);
                (*to, true)
            }
        }
    }

    /// Frames a body into a parcel toward `next_hop`, stamping a fresh `ka`
    ///  and draining any pending echo.
    fn emit_body<B: OxenBackend>(&mut self, back: &mut B, next_hop: Sid, body: ParcelBody) -> anyhow::Result<()> {
        let now = back.now();
        let ka = self.keepalives.allocate(next_hop, now);
        let kk = self.keepalives.take_echo(&next_hop);

        let parcel = Parcel { ka_rq: Some(ka), ka_ok: kk, body };
        let bytes = parcel.to_bytes();
        if bytes.len() > self.config.max_parcel_bytes {
            warn!("parcel of {} bytes to {:?} exceeds the configured maximum of {} - not sending",
                bytes.len(), next_hop, self.config.max_parcel_bytes);
            bail!("parcel exceeds the configured maximum size");
        }

        self.keepalives.note_sent(next_hop, now);
        back.queue_send(next_hop, bytes);
        Ok(())
    }

    fn send_gossip_reply<B: OxenBackend>(&mut self, back: &mut B, to: Sid) {
        let cols: Vec<Sid> = self.lc.known_peers().to_vec();
        let fragment = self.lc.fragment(&cols);
        if !fragment.is_empty() {
            let _ = self.emit_body(back, to, ParcelBody::LcGossip(fragment));
        }
    }

    /// Expected departure: the peer finalized and its streams drained.
    fn finish_peer<B: OxenBackend>(&mut self, back: &mut B, sid: Sid) {
        info!("peer {:?} finalized and drained - closing", sid);
        self.peers.mark_departed(sid, back.now());
        self.discard_peer_state(&sid);
        back.deliver(OxenEvent::PeerDown(PeerDownData { sid, expected: true }));
    }

    fn discard_peer_state(&mut self, sid: &Sid) {
        let cleared = self.reliability.clear_dest(sid);
        if cleared > 0 {
            debug!("dropped {} outstanding messages to {:?}", cleared, sid);
        }
        self.keepalives.forget(sid);
        self.inbound.forget(sid);
        self.outbound.forget(sid);
        self.handshaken.remove(sid);
    }

    fn reclassify_and_emit<B: OxenBackend>(&mut self, back: &mut B) {
        let transitions = self.peers.reclassify(
            &self.lc,
            back.now(),
            self.config.link_stale,
            self.config.give_up_after,
        );

        for transition in transitions {
            match transition {
                PeerTransition::Up(sid) => {
                    let expected = self.handshaken.contains(&sid);
                    info!("peer {:?} became reachable (expected: {})", sid, expected);
                    back.deliver(OxenEvent::PeerUp(PeerUpData { sid, expected }));
                }
                PeerTransition::Down(sid) => {
                    info!("giving up on peer {:?}", sid);
                    self.discard_peer_state(&sid);
                    back.deliver(OxenEvent::PeerDown(PeerDownData { sid, expected: false }));
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::test_util::backend::CollectingBackend;
    use crate::test_util::random::ScriptedRandom;
    use crate::wire::LcGossip;

    fn s(name: &str) -> Sid {
        Sid::new(name)
    }

    fn test_config() -> OxenConfig {
        let mut config = OxenConfig::new();
        config.keepalive_echo_delay = Duration::from_millis(100);
        config.retry_base = Duration::from_secs(10);
        config
    }

    fn engine(me: &str) -> Oxen {
        Oxen::new(s(me), Arc::new(test_config()), Box::new(ScriptedRandom::new(vec![])))
    }

    fn blob_md(parcel: &Parcel) -> &MsgData {
        match &parcel.body {
            ParcelBody::MsgData(md) => md,
            other => panic!("expected an md body, got {:?}", other),
        }
    }

    fn ack_of(parcel: &Parcel) -> &MsgAck {
        match &parcel.body {
            ParcelBody::MsgAck(ma) => ma,
            other => panic!("expected an ma body, got {:?}", other),
        }
    }

    /// Seeds a fresh bidirectional contact into the engine's matrix and
    ///  silences the resulting peer-up events.
    fn seed_link(oxen: &mut Oxen, back: &mut CollectingBackend, a: Sid, b: Sid, at: Timestamp) {
        oxen.lc.put(a, b, at);
        oxen.lc.put(b, a, at);
        oxen.reclassify_and_emit(back);
        back.take_events();
    }

    #[test]
    fn test_three_hop_ack_round_trip() {
        // Nodes A, P, B; A reaches B via P; the direct A-B link has never
        // been observed. The full exchange takes exactly seven parcels.
        let (a, p, b) = (s("0NA"), s("0NP"), s("0NB"));
        let t0 = Timestamp::from_millis(100_000);

        let mut oxen_a = engine("0NA");
        let mut oxen_p = engine("0NP");
        let mut oxen_b = engine("0NB");
        let mut back_a = CollectingBackend::at(t0);
        let mut back_p = CollectingBackend::at(t0);
        let mut back_b = CollectingBackend::at(t0);

        for (oxen, back) in [(&mut oxen_a, &mut back_a), (&mut oxen_p, &mut back_p), (&mut oxen_b, &mut back_b)] {
            seed_link(oxen, back, a, p, t0);
            seed_link(oxen, back, p, b, t0);
            // topology is established: suppress idle probes for the duration
            for n in [a, p, b] {
                if n != oxen.me {
                    oxen.keepalives.note_sent(n, t0);
                }
            }
        }

        // parcel 1: A -> P {ka, md{to: B}}
        oxen_a.send_reliable(&mut back_a, b, b"hello".to_vec()).unwrap();
        let sent = back_a.take_sent();
        assert_eq!(sent.len(), 1);
        let (hop, parcel1) = &sent[0];
        assert_eq!(*hop, p);
        assert!(parcel1.ka_rq.is_some() && parcel1.ka_ok.is_none());
        assert_eq!(blob_md(parcel1).to, b);
        assert_eq!(blob_md(parcel1).fr, a);
        let msg_id = blob_md(parcel1).id.unwrap();

        // parcel 3 (and pending echo toward A): P forwards to B
        oxen_p.incoming(&mut back_p, Some(a), &parcel1.to_bytes());
        let sent = back_p.take_sent();
        assert_eq!(sent.len(), 1);
        let (hop, parcel3) = &sent[0];
        assert_eq!(*hop, b);
        assert!(parcel3.ka_rq.is_some() && parcel3.ka_ok.is_none());
        assert_eq!(blob_md(parcel3).id, Some(msg_id));

        // parcel 2: P's standalone echo to A once the echo delay passes
        for back in [&mut back_a, &mut back_p, &mut back_b] {
            back.advance(Duration::from_millis(100));
        }
        oxen_p.on_keepalive_timer(&mut back_p);
        let sent = back_p.take_sent();
        assert_eq!(sent.len(), 1);
        let (hop, parcel2) = &sent[0];
        assert_eq!(*hop, a);
        assert_eq!(parcel2.ka_ok, parcel1.ka_rq);
        assert_eq!(parcel2.ka_rq, None);
        assert_eq!(parcel2.body, ParcelBody::Missing);
        oxen_a.incoming(&mut back_a, Some(p), &parcel2.to_bytes());
        // resolving the echo put the original send time into A's row for P
        assert_eq!(oxen_a.lc.get(&a, &p), t0);

        // parcel 4: B acks toward A via P, echoing P's ka on the same parcel
        oxen_b.incoming(&mut back_b, Some(p), &parcel3.to_bytes());
        assert_eq!(
            back_b.take_events(),
            vec![OxenEvent::MessageArrived(MessageArrivedData {
                origin: a,
                data: b"hello".to_vec(),
                stream_kind: StreamKind::Unreliable,
            })]
        );
        let sent = back_b.take_sent();
        assert_eq!(sent.len(), 1);
        let (hop, parcel4) = &sent[0];
        assert_eq!(*hop, p);
        assert!(parcel4.ka_rq.is_some());
        assert_eq!(parcel4.ka_ok, parcel3.ka_rq);
        assert_eq!(ack_of(parcel4), &MsgAck { to: a, fr: b, id: msg_id });

        // parcel 5: P forwards the ack to A (and resolves its echo from B)
        oxen_p.incoming(&mut back_p, Some(b), &parcel4.to_bytes());
        assert_eq!(oxen_p.lc.get(&p, &b), t0);
        let sent = back_p.take_sent();
        assert_eq!(sent.len(), 1);
        let (hop, parcel5) = &sent[0];
        assert_eq!(*hop, a);
        assert!(parcel5.ka_rq.is_some());
        assert_eq!(ack_of(parcel5), &MsgAck { to: a, fr: b, id: msg_id });

        // parcel 6: P's standalone echo to B
        for back in [&mut back_a, &mut back_p, &mut back_b] {
            back.advance(Duration::from_millis(100));
        }
        oxen_p.on_keepalive_timer(&mut back_p);
        let sent = back_p.take_sent();
        assert_eq!(sent.len(), 1);
        let (hop, parcel6) = &sent[0];
        assert_eq!(*hop, b);
        assert_eq!(parcel6.ka_ok, parcel4.ka_rq);
        assert_eq!(parcel6.body, ParcelBody::Missing);
        oxen_b.incoming(&mut back_b, Some(p), &parcel6.to_bytes());
        assert_eq!(oxen_b.lc.get(&b, &p), t0.plus(Duration::from_millis(100)));

        // A absorbs the ack: outstanding entry gone, row for B still stale
        oxen_a.incoming(&mut back_a, Some(p), &parcel5.to_bytes());
        assert_eq!(oxen_a.reliability.outstanding_count(&b), 0);
        assert_eq!(oxen_a.lc.get(&a, &b), Timestamp::NEVER);

        // parcel 7: A's standalone echo to P
        back_a.advance(Duration::from_millis(100));
        oxen_a.on_keepalive_timer(&mut back_a);
        let sent = back_a.take_sent();
        assert_eq!(sent.len(), 1);
        let (hop, parcel7) = &sent[0];
        assert_eq!(*hop, p);
        assert_eq!(parcel7.ka_ok, parcel5.ka_rq);
        assert_eq!(parcel7.body, ParcelBody::Missing);
    }

    #[test]
    fn test_out_of_order_broadcast_delivery() {
        let origin = s("0NB");
        let mut oxen = engine("0NA");
        let mut back = CollectingBackend::at(Timestamp::from_millis(1_000));

        let parcels: Vec<Parcel> = [
            (1, MsgDataBody::MsgSync(MsgSync { brd: 34, one: 0 })),
            (4, MsgDataBody::MsgBrd(MsgBrd { seq: 37, data: b"37".to_vec() })),
            (3, MsgDataBody::MsgBrd(MsgBrd { seq: 36, data: b"36".to_vec() })),
            (5, MsgDataBody::MsgBrd(MsgBrd { seq: 38, data: b"38".to_vec() })),
            (2, MsgDataBody::MsgBrd(MsgBrd { seq: 35, data: b"35".to_vec() })),
        ]
        .into_iter()
        .map(|(id, body)| Parcel {
            ka_rq: None,
            ka_ok: None,
            body: ParcelBody::MsgData(MsgData { to: s("0NA"), fr: origin, id: Some(id), body }),
        })
        .collect();

        for parcel in &parcels {
            oxen.incoming(&mut back, Some(origin), &parcel.to_bytes());
        }

        // every tracked message got acked, in arrival order
        let acked: Vec<MsgId> = back.take_sent().iter()
            .filter_map(|(_, p)| match &p.body {
                ParcelBody::MsgAck(ma) => Some(ma.id),
                _ => None,
            })
            .collect();
        assert_eq!(acked, vec![1, 4, 3, 5, 2]);

        // payloads surfaced in sequence order, exactly once
        let delivered: Vec<Vec<u8>> = back.take_events().into_iter()
            .filter_map(|e| match e {
                OxenEvent::MessageArrived(m) => {
                    assert_eq!(m.stream_kind, StreamKind::Broadcast);
                    Some(m.data)
                }
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![b"35".to_vec(), b"36".to_vec(), b"37".to_vec(), b"38".to_vec()]);
    }

    #[test]
    fn test_give_up_and_revive() {
        let q = s("0NQ");
        let mut oxen = engine("0NA");
        let mut back = CollectingBackend::at(Timestamp::from_millis(10_000));

        oxen.add_peer(q);
        oxen.send_reliable(&mut back, q, b"into the void".to_vec()).unwrap();
        back.take_sent();
        oxen.on_keepalive_timer(&mut back);
        assert_eq!(back.take_events(), vec![]);
        assert_eq!(oxen.reliability.outstanding_count(&q), 1);

        // silence for the whole give-up period
        back.advance(Duration::from_secs(300));
        oxen.on_keepalive_timer(&mut back);
        back.take_sent();
        assert_eq!(
            back.take_events(),
            vec![OxenEvent::PeerDown(PeerDownData { sid: q, expected: false })]
        );
        assert_eq!(oxen.reliability.outstanding_count(&q), 0);

        // traffic to the departed peer is dropped
        oxen.send_reliable(&mut back, q, b"still there?".to_vec()).unwrap();
        assert_eq!(back.take_sent(), vec![]);

        // a little later, gossip shows somebody heard from Q just now: revive
        back.advance(Duration::from_secs(1));
        let mut gossip = LcGossip::default();
        gossip.rows.insert(s("0NR"), [(q, back.now())].into());
        let parcel = Parcel { ka_rq: None, ka_ok: None, body: ParcelBody::LcGossip(gossip) };
        oxen.incoming(&mut back, None, &parcel.to_bytes());

        assert_eq!(
            back.take_events(),
            vec![
                OxenEvent::PeerUp(PeerUpData { sid: q, expected: false }),
            ]
        );
    }

    #[test]
    fn test_finalize_drains_before_close() {
        let c = s("0NC");
        let me = s("0NA");
        let mut oxen = engine("0NA");
        let mut back = CollectingBackend::at(Timestamp::from_millis(1_000));

        let md = |id: MsgId, body: MsgDataBody| Parcel {
            ka_rq: None,
            ka_ok: None,
            body: ParcelBody::MsgData(MsgData { to: me, fr: c, id: Some(id), body }),
        };

        oxen.incoming(&mut back, Some(c), &md(1, MsgDataBody::MsgSync(MsgSync { brd: 0, one: 0 })).to_bytes());
        for seq in 1..=10 {
            oxen.incoming(&mut back, Some(c), &md(1 + seq, MsgDataBody::MsgBrd(MsgBrd { seq, data: vec![seq as u8] })).to_bytes());
        }
        back.take_events();
        back.take_sent();

        // finalize arrives while broadcasts 11 and 12 are still in flight
        oxen.incoming(&mut back, Some(c), &md(20, MsgDataBody::MsgFinal(MsgFinal { brd: 12, one: 0 })).to_bytes());
        assert_eq!(back.take_events(), vec![]);

        oxen.incoming(&mut back, Some(c), &md(21, MsgDataBody::MsgBrd(MsgBrd { seq: 11, data: b"11".to_vec() })).to_bytes());
        oxen.incoming(&mut back, Some(c), &md(22, MsgDataBody::MsgBrd(MsgBrd { seq: 12, data: b"12".to_vec() })).to_bytes());

        let events = back.take_events();
        assert_eq!(
            events,
            vec![
                OxenEvent::MessageArrived(MessageArrivedData { origin: c, data: b"11".to_vec(), stream_kind: StreamKind::Broadcast }),
                OxenEvent::MessageArrived(MessageArrivedData { origin: c, data: b"12".to_vec(), stream_kind: StreamKind::Broadcast }),
                OxenEvent::PeerDown(PeerDownData { sid: c, expected: true }),
            ]
        );

        // the association is closed: further stream data is dropped
        oxen.incoming(&mut back, Some(c), &md(23, MsgDataBody::MsgBrd(MsgBrd { seq: 12, data: b"12".to_vec() })).to_bytes());
        assert!(back.take_events().is_empty());
    }

    #[test]
    fn test_routed_forward_under_partial_partition() {
        let (a, p, b) = (s("0NA"), s("0NP"), s("0NB"));
        let t0 = Timestamp::from_millis(100_000);
        let stale = Timestamp::from_millis(10_000);

        let mut oxen_a = engine("0NA");
        let mut back_a = CollectingBackend::at(t0);

        seed_link(&mut oxen_a, &mut back_a, a, p, t0);
        oxen_a.lc.put(p, b, t0);
        // the direct link to B went stale long ago
        oxen_a.lc.put(a, b, stale);
        oxen_a.reclassify_and_emit(&mut back_a);
        back_a.take_events();

        oxen_a.send_reliable(&mut back_a, b, b"via p".to_vec()).unwrap();
        let sent = back_a.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, p);
        let msg_id = blob_md(&sent[0].1).id.unwrap();

        // B's ack comes back through P
        let ack = Parcel {
            ka_rq: None,
            ka_ok: None,
            body: ParcelBody::MsgAck(MsgAck { to: a, fr: b, id: msg_id }),
        };
        oxen_a.incoming(&mut back_a, Some(p), &ack.to_bytes());

        assert_eq!(oxen_a.reliability.outstanding_count(&b), 0);
        // the routed round trip leaves the direct-link cell stale
        assert_eq!(oxen_a.lc.get(&a, &b), stale);
        // and A keeps reaching B through P
        assert_eq!(oxen_a.route_for(&b, back_a.now()), (p, false));
    }

    #[test]
    fn test_join_handshake_brings_both_sides_up_expectedly() {
        let (a, h, x) = (s("0NA"), s("0NH"), s("0NX"));
        let t0 = Timestamp::from_millis(50_000);

        let mut oxen_a = engine("0NA");
        let mut oxen_h = engine("0NH");
        let mut back_a = CollectingBackend::at(t0);
        let mut back_h = CollectingBackend::at(t0);

        // the helper is already clustered with somebody
        seed_link(&mut oxen_h, &mut back_h, h, x, t0);

        oxen_a.join_cluster(&mut back_a, h).unwrap();
        let sent = back_a.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, h);
        assert!(matches!(blob_md(&sent[0].1).body, MsgDataBody::MsgSync(_)));
        let sync_a = &sent[0].1;

        // the helper acks, synchronizes back and gossips
        oxen_h.incoming(&mut back_h, Some(a), &sync_a.to_bytes());
        let sent = back_h.take_sent();
        let bodies: Vec<&ParcelBody> = sent.iter().map(|(_, p)| &p.body).collect();
        assert!(matches!(bodies[0], ParcelBody::MsgAck(_)));
        assert!(matches!(bodies[1], ParcelBody::MsgData(MsgData { body: MsgDataBody::MsgSync(_), .. })));
        assert!(matches!(bodies[2], ParcelBody::LcGossip(_)));

        // A absorbs the helper's reply: the helper comes up expectedly as soon
        // as its ack resolves, and its gossip introduces the rest of the
        // cluster
        for (_, parcel) in &sent {
            oxen_a.incoming(&mut back_a, Some(h), &parcel.to_bytes());
        }
        assert_eq!(
            back_a.take_events(),
            vec![
                OxenEvent::PeerUp(PeerUpData { sid: h, expected: true }),
                OxenEvent::PeerUp(PeerUpData { sid: x, expected: false }),
            ]
        );

        // the helper's side comes up once A's ack (a direct round trip)
        // resolves
        let acks: Vec<(Sid, Parcel)> = back_a.take_sent().into_iter()
            .filter(|(_, p)| matches!(p.body, ParcelBody::MsgAck(_)))
            .collect();
        assert_eq!(acks.len(), 1);
        oxen_h.incoming(&mut back_h, Some(a), &acks[0].1.to_bytes());
        assert_eq!(
            back_h.take_events(),
            vec![OxenEvent::PeerUp(PeerUpData { sid: a, expected: true })]
        );
    }

    #[test]
    fn test_leave_cluster_finalizes_every_live_peer() {
        let mut oxen = engine("0NA");
        let mut back = CollectingBackend::at(Timestamp::from_millis(1_000));

        for p in [s("0N1"), s("0N2")] {
            oxen.add_peer(p);
            oxen.send_in_order(&mut back, p, b"x".to_vec()).unwrap();
        }
        back.take_sent();

        oxen.leave_cluster(&mut back);
        let finals: Vec<(Sid, MsgFinal)> = back.take_sent().into_iter()
            .filter_map(|(hop, p)| match p.body {
                ParcelBody::MsgData(MsgData { body: MsgDataBody::MsgFinal(f), .. }) => Some((hop, f)),
                _ => None,
            })
            .collect();
        assert_eq!(finals, vec![
            (s("0N1"), MsgFinal { brd: 0, one: 1 }),
            (s("0N2"), MsgFinal { brd: 0, one: 1 }),
        ]);
    }

    #[test]
    fn test_gossip_timer_uses_injected_randomness() {
        let mut config = test_config();
        config.gossip_columns = 2;

        // always pick index 0: target 0NB, columns 0NA and (after the
        // swap_remove) 0NC
        let mut random = crate::util::random::MockRandom::new();
        random.expect_gen_usize_range().returning(|range| range.start);

        let mut oxen = Oxen::new(s("0NA"), Arc::new(config), Box::new(random));
        let t0 = Timestamp::from_millis(60_000);
        let mut back = CollectingBackend::at(t0);

        seed_link(&mut oxen, &mut back, s("0NA"), s("0NB"), t0);
        seed_link(&mut oxen, &mut back, s("0NA"), s("0NC"), t0);

        oxen.on_gossip_timer(&mut back);
        let sent = back.take_sent();
        assert_eq!(sent.len(), 1);
        // candidates are sorted, so index 0 is 0NB
        assert_eq!(sent[0].0, s("0NB"));
        match &sent[0].1.body {
            ParcelBody::LcGossip(gossip) => {
                // columns 0NA and (after the swap_remove) 0NC were selected;
                // every row holding a cell for either of them ships
                assert_eq!(gossip.rows.len(), 3);
                assert_eq!(gossip.rows[&s("0NA")], [(s("0NC"), t0)].into());
                assert_eq!(gossip.rows[&s("0NB")], [(s("0NA"), t0)].into());
                assert_eq!(gossip.rows[&s("0NC")], [(s("0NA"), t0)].into());
            }
            other => panic!("expected gossip, got {:?}", other),
        }
    }

    #[test]
    fn test_premature_stream_data_is_acked_but_not_delivered() {
        let mut oxen = engine("0NA");
        let mut back = CollectingBackend::at(Timestamp::from_millis(1_000));

        let parcel = Parcel {
            ka_rq: None,
            ka_ok: None,
            body: ParcelBody::MsgData(MsgData {
                to: s("0NA"),
                fr: s("0NB"),
                id: Some(5),
                body: MsgDataBody::MsgBrd(MsgBrd { seq: 1, data: b"early".to_vec() }),
            }),
        };
        oxen.incoming(&mut back, Some(s("0NB")), &parcel.to_bytes());

        let sent = back.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(ack_of(&sent[0].1).id, 5);
        assert_eq!(back.take_events(), vec![]);
    }

    #[test]
    fn test_reliable_blob_is_deduplicated_by_id() {
        let mut oxen = engine("0NA");
        let mut back = CollectingBackend::at(Timestamp::from_millis(1_000));

        let parcel = Parcel {
            ka_rq: None,
            ka_ok: None,
            body: ParcelBody::MsgData(MsgData {
                to: s("0NA"),
                fr: s("0NB"),
                id: Some(77),
                body: MsgDataBody::Blob(b"once".to_vec()),
            }),
        };
        oxen.incoming(&mut back, Some(s("0NB")), &parcel.to_bytes());
        oxen.incoming(&mut back, Some(s("0NB")), &parcel.to_bytes());

        // both arrivals acked, one delivery
        assert_eq!(back.take_sent().len(), 2);
        assert_eq!(back.take_events().len(), 1);
    }

    #[test]
    fn test_oversized_payload_is_refused() {
        let mut oxen = engine("0NA");
        let mut back = CollectingBackend::at(Timestamp::from_millis(1_000));
        oxen.add_peer(s("0NB"));

        let huge = vec![b'x'; 4_000];
        assert!(oxen.send_in_order(&mut back, s("0NB"), huge).is_err());
        assert_eq!(back.take_sent(), vec![]);
        // the sequence counter did not burn a number
        assert_eq!(oxen.outbound.floors(&s("0NB")), (0, 0));
    }
}
