//! The driver: one tokio task that owns the engine and serializes everything
//! that touches it. Inbound datagrams, timer ticks and user requests are
//! drained from channels FIFO; outbound datagrams and user events produced by
//! an engine call are flushed after the call returns, so the engine itself
//! never blocks on I/O.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::net::transport::{DatagramHandler, Transport};
use crate::oxen::config::OxenConfig;
use crate::oxen::core::{Oxen, OxenBackend};
use crate::oxen::events::OxenEvent;
use crate::util::clock::{Clock, Timestamp};
use crate::util::sid::Sid;
use crate::wire::{MsgData, Parcel, ParcelBody, SchemaMode};

/// cadence of the retransmit sweep
const RETRANSMIT_SWEEP: Duration = Duration::from_secs(1);
/// cadence of the keepalive sweep (echo deadlines, idle probes, give-up clock)
const KEEPALIVE_SWEEP: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub enum OxenRequest {
    StartCluster,
    JoinCluster { help: Sid, addr: SocketAddr },
    AddPeer { sid: Sid, addr: SocketAddr },
    LeaveCluster,
    SendDatagram { to: Sid, data: Vec<u8> },
    BroadcastDatagram { data: Vec<u8> },
    SendReliable { to: Sid, data: Vec<u8> },
    SendInOrder { to: Sid, data: Vec<u8> },
    BroadcastInOrder { data: Vec<u8> },
}

/// The user-facing handle: request methods are thin wrappers that enqueue into
///  the driver's mailbox.
#[derive(Clone)]
pub struct OxenCluster {
    requests: mpsc::Sender<OxenRequest>,
}

impl OxenCluster {
    pub fn new(requests: mpsc::Sender<OxenRequest>) -> OxenCluster {
        OxenCluster { requests }
    }

    pub async fn start_cluster(&self) -> anyhow::Result<()> {
        Ok(self.requests.send(OxenRequest::StartCluster).await?)
    }

    pub async fn join_cluster(&self, help: Sid, addr: SocketAddr) -> anyhow::Result<()> {
        Ok(self.requests.send(OxenRequest::JoinCluster { help, addr }).await?)
    }

    pub async fn add_peer(&self, sid: Sid, addr: SocketAddr) -> anyhow::Result<()> {
        Ok(self.requests.send(OxenRequest::AddPeer { sid, addr }).await?)
    }

    pub async fn leave_cluster(&self) -> anyhow::Result<()> {
        Ok(self.requests.send(OxenRequest::LeaveCluster).await?)
    }

    pub async fn send_datagram(&self, to: Sid, data: Vec<u8>) -> anyhow::Result<()> {
        Ok(self.requests.send(OxenRequest::SendDatagram { to, data }).await?)
    }

    pub async fn broadcast_datagram(&self, data: Vec<u8>) -> anyhow::Result<()> {
        Ok(self.requests.send(OxenRequest::BroadcastDatagram { data }).await?)
    }

    pub async fn send_reliable(&self, to: Sid, data: Vec<u8>) -> anyhow::Result<()> {
        Ok(self.requests.send(OxenRequest::SendReliable { to, data }).await?)
    }

    pub async fn send_in_order(&self, to: Sid, data: Vec<u8>) -> anyhow::Result<()> {
        Ok(self.requests.send(OxenRequest::SendInOrder { to, data }).await?)
    }

    pub async fn broadcast_in_order(&self, data: Vec<u8>) -> anyhow::Result<()> {
        Ok(self.requests.send(OxenRequest::BroadcastInOrder { data }).await?)
    }
}

/// Bidirectional SID <-> socket address map. Entries come from join/add-peer
///  requests and from first contact with a so far unknown address.
struct AddressBook {
    by_sid: FxHashMap<Sid, SocketAddr>,
    by_addr: FxHashMap<SocketAddr, Sid>,
}

impl AddressBook {
    fn new() -> AddressBook {
        AddressBook { by_sid: FxHashMap::default(), by_addr: FxHashMap::default() }
    }

    fn register(&mut self, sid: Sid, addr: SocketAddr) {
        if let Some(prev) = self.by_sid.insert(sid, addr) {
            if prev != addr {
                info!("peer {:?} moved from {} to {}", sid, prev, addr);
                self.by_addr.remove(&prev);
            }
        }
        self.by_addr.insert(addr, sid);
    }

    fn addr_of(&self, sid: &Sid) -> Option<SocketAddr> {
        self.by_sid.get(sid).copied()
    }

    fn sid_of(&self, addr: &SocketAddr) -> Option<Sid> {
        self.by_addr.get(addr).copied()
    }
}

/// Output produced by one engine call, flushed once the call has returned.
#[derive(Default)]
struct PendingIo {
    outgoing: Vec<(Sid, Vec<u8>)>,
    events: Vec<OxenEvent>,
}

struct EngineBackend<'a> {
    now: Timestamp,
    pending: &'a mut PendingIo,
}

impl OxenBackend for EngineBackend<'_> {
    fn now(&self) -> Timestamp {
        self.now
    }

    fn queue_send(&mut self, to: Sid, data: Vec<u8>) {
        self.pending.outgoing.push((to, data));
    }

    fn deliver(&mut self, event: OxenEvent) {
        self.pending.events.push(event);
    }
}

struct QueueingHandler {
    queue: mpsc::Sender<(Vec<u8>, SocketAddr)>,
}

#[async_trait::async_trait]
impl DatagramHandler for QueueingHandler {
    async fn handle_datagram(&self, buf: &[u8], sender: SocketAddr) {
        if self.queue.send((buf.to_vec(), sender)).await.is_err() {
            debug!("driver is gone - dropping datagram");
        }
    }
}

/// Runs the engine until `leave_cluster` is requested or all request senders
///  are dropped.
pub async fn run_oxen(
    mut oxen: Oxen,
    config: Arc<OxenConfig>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    mut requests: mpsc::Receiver<OxenRequest>,
    events: mpsc::Sender<OxenEvent>,
) {
    info!("starting engine for {:?}", oxen.me());

    let (datagram_tx, mut datagrams) = mpsc::channel::<(Vec<u8>, SocketAddr)>(1024);
    let recv_transport = Arc::clone(&transport);
    let recv_task = tokio::spawn(async move {
        let handler = Arc::new(QueueingHandler { queue: datagram_tx });
        if let Err(e) = recv_transport.recv_loop(handler).await {
            error!("receive loop failed: {}", e);
        }
    });

    let mut book = AddressBook::new();
    let mut pending = PendingIo::default();

    let mut prev_time = Instant::now();
    let mut millis_until_retransmit: u32 = RETRANSMIT_SWEEP.as_millis() as u32;
    let mut millis_until_keepalive: u32 = KEEPALIVE_SWEEP.as_millis() as u32;
    let mut millis_until_gossip: u32 = config.gossip_period.as_millis() as u32;

    let mut leaving = false;

    while !leaving {
        select! {
            maybe_datagram = datagrams.recv() => match maybe_datagram {
                Some((data, sender)) => {
                    let from = resolve_source(&mut book, sender, &data, config.schema_mode);
                    let mut back = EngineBackend { now: clock.now(), pending: &mut pending };
                    oxen.incoming(&mut back, from, &data);
                }
                None => break,
            },

            maybe_request = requests.recv() => match maybe_request {
                Some(request) => {
                    let mut back = EngineBackend { now: clock.now(), pending: &mut pending };
                    leaving = handle_request(&mut oxen, &mut back, &mut book, request);
                }
                None => {
                    info!("all request handles dropped - shutting down");
                    break;
                }
            },

            _ = sleep(Duration::from_millis(10)) => {
                let new_time = Instant::now();
                let elapsed_millis: u32 = new_time.saturating_duration_since(prev_time).as_millis().try_into()
                    .unwrap_or(u32::MAX);
                prev_time = new_time;

                let mut back = EngineBackend { now: clock.now(), pending: &mut pending };

                millis_until_retransmit = match millis_until_retransmit.checked_sub(elapsed_millis) {
                    Some(millis) => millis,
                    None => {
                        oxen.on_retransmit_timer(&mut back);
                        RETRANSMIT_SWEEP.as_millis() as u32
                    }
                };
                millis_until_keepalive = match millis_until_keepalive.checked_sub(elapsed_millis) {
                    Some(millis) => millis,
                    None => {
                        oxen.on_keepalive_timer(&mut back);
                        KEEPALIVE_SWEEP.as_millis() as u32
                    }
                };
                millis_until_gossip = match millis_until_gossip.checked_sub(elapsed_millis) {
                    Some(millis) => millis,
                    None => {
                        oxen.on_gossip_timer(&mut back);
                        config.gossip_period.as_millis() as u32
                    }
                };
            }
        }

        flush(&mut pending, transport.as_ref(), &book, &events).await;
    }

    transport.cancel_recv_loop();
    let _ = recv_task.await;
    info!("engine for {:?} stopped", oxen.me());
}

/// Maps a datagram's source address to a SID. An unknown address is learned
///  from the parcel itself when it carries a message stamped with a fresh
///  keepalive id: such a parcel came from its `fr` directly (forwarded
///  parcels come from neighbors we already know).
fn resolve_source(book: &mut AddressBook, sender: SocketAddr, data: &[u8], mode: SchemaMode) -> Option<Sid> {
    if let Some(sid) = book.sid_of(&sender) {
        return Some(sid);
    }

    match Parcel::decode(data, mode) {
        Ok(Parcel { ka_rq: Some(_), body: ParcelBody::MsgData(MsgData { fr, .. }), .. }) => {
            info!("learned address {} for peer {:?}", sender, fr);
            book.register(fr, sender);
            Some(fr)
        }
        _ => None,
    }
}

fn handle_request<B: OxenBackend>(oxen: &mut Oxen, back: &mut B, book: &mut AddressBook, request: OxenRequest) -> bool {
    debug!("handling request {:?}", request);

    let result = match request {
        OxenRequest::StartCluster => {
            oxen.start_cluster();
            Ok(())
        }
        OxenRequest::JoinCluster { help, addr } => {
            book.register(help, addr);
            oxen.join_cluster(back, help)
        }
        OxenRequest::AddPeer { sid, addr } => {
            book.register(sid, addr);
            oxen.add_peer(sid);
            Ok(())
        }
        OxenRequest::LeaveCluster => {
            oxen.leave_cluster(back);
            return true;
        }
        OxenRequest::SendDatagram { to, data } => oxen.send_datagram(back, to, data),
        OxenRequest::BroadcastDatagram { data } => oxen.broadcast_datagram(back, data),
        OxenRequest::SendReliable { to, data } => oxen.send_reliable(back, to, data),
        OxenRequest::SendInOrder { to, data } => oxen.send_in_order(back, to, data),
        OxenRequest::BroadcastInOrder { data } => oxen.broadcast_in_order(back, data),
    };

    if let Err(e) = result {
        warn!("request failed: {}", e);
    }
    false
}

async fn flush(pending: &mut PendingIo, transport: &dyn Transport, book: &AddressBook, events: &mpsc::Sender<OxenEvent>) {
    for (sid, data) in pending.outgoing.drain(..) {
        match book.addr_of(&sid) {
            Some(addr) => {
                if let Err(e) = transport.send(addr, &data).await {
                    warn!("could not send parcel to {:?} at {}: {}", sid, addr, e);
                }
            }
            None => warn!("no known address for peer {:?} - dropping parcel", sid),
        }
    }

    for event in pending.events.drain(..) {
        if events.send(event).await.is_err() {
            error!("event receiver is gone - dropping event");
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::net::udp::UdpTransport;
    use crate::oxen::events::{OxenEvent, PeerUpData};
    use crate::util::clock::TokioClock;
    use crate::util::random::ThreadRngRandom;

    async fn spawn_node(name: &str) -> (OxenCluster, mpsc::Receiver<OxenEvent>, SocketAddr) {
        let config = Arc::new(OxenConfig::new());
        let transport = Arc::new(UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let addr = transport.local_addr().unwrap();

        let (request_tx, request_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);

        let oxen = Oxen::new(Sid::new(name), config.clone(), Box::new(ThreadRngRandom));
        tokio::spawn(run_oxen(
            oxen,
            config,
            transport,
            Arc::new(TokioClock::new()),
            request_rx,
            event_tx,
        ));

        (OxenCluster::new(request_tx), event_rx, addr)
    }

    async fn expect_peer_up(events: &mut mpsc::Receiver<OxenEvent>, sid: Sid) {
        let deadline = Duration::from_secs(5);
        loop {
            match timeout(deadline, events.recv()).await.expect("timed out waiting for peer-up").unwrap() {
                OxenEvent::PeerUp(PeerUpData { sid: up, expected: true }) if up == sid => return,
                other => panic!("expected peer-up for {:?}, got {:?}", sid, other),
            }
        }
    }

    #[tokio::test]
    async fn test_join_over_loopback() {
        let (founder, mut founder_events, founder_addr) = spawn_node("0NF").await;
        let (joiner, mut joiner_events, _) = spawn_node("0NJ").await;

        founder.start_cluster().await.unwrap();
        joiner.join_cluster(Sid::new("0NF"), founder_addr).await.unwrap();

        expect_peer_up(&mut joiner_events, Sid::new("0NF")).await;
        expect_peer_up(&mut founder_events, Sid::new("0NJ")).await;

        // an in-order message flows once the peering is up
        joiner.send_in_order(Sid::new("0NF"), b"hello there".to_vec()).await.unwrap();
        let deadline = Duration::from_secs(5);
        loop {
            match timeout(deadline, founder_events.recv()).await.expect("timed out waiting for delivery").unwrap() {
                OxenEvent::MessageArrived(m) => {
                    assert_eq!(m.origin, Sid::new("0NJ"));
                    assert_eq!(m.data, b"hello there".to_vec());
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        joiner.leave_cluster().await.unwrap();
    }
}
