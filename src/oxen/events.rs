use std::sync::Arc;

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::spawn;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::util::sid::Sid;

/// Which delivery service a payload arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// datagram service: unordered, possibly unreliable
    Unreliable,
    /// in-order exactly-once one-to-one stream
    OneToOne,
    /// in-order exactly-once broadcast stream
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OxenEvent {
    MessageArrived(MessageArrivedData),
    PeerUp(PeerUpData),
    PeerDown(PeerDownData),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageArrivedData {
    pub origin: Sid,
    pub data: Vec<u8>,
    pub stream_kind: StreamKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerUpData {
    pub sid: Sid,
    /// true when an explicit synchronize handshake with the peer preceded the
    ///  transition
    pub expected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerDownData {
    pub sid: Sid,
    /// true for a finalize-induced departure, false for a give-up
    pub expected: bool,
}

#[async_trait::async_trait]
pub trait OxenEventListener: Sync + Send {
    async fn on_oxen_event(&self, event: OxenEvent);
}

/// Fans engine events out to registered listeners. The driver feeds the queue;
///  listener callbacks run on their own tasks so a slow consumer cannot stall
///  the engine.
pub struct OxenEventNotifier {
    listeners: RwLock<FxHashMap<Uuid, Arc<dyn OxenEventListener>>>,
}

impl OxenEventNotifier {
    pub fn new() -> OxenEventNotifier {
        OxenEventNotifier {
            listeners: Default::default(),
        }
    }

    pub async fn add_listener(&self, listener: Arc<dyn OxenEventListener>) -> Uuid {
        let id = Uuid::new_v4();
        self.listeners.write().await.insert(id, listener);
        id
    }

    pub async fn try_remove_listener(&self, listener_id: &Uuid) -> anyhow::Result<()> {
        match self.listeners.write().await.remove(listener_id) {
            None => Err(anyhow!("tried to remove a listener that was not (no longer?) registered: {}", listener_id)),
            Some(_) => Ok(()),
        }
    }

    pub async fn run_loop(&self, mut recv: mpsc::Receiver<OxenEvent>) {
        while let Some(event) = recv.recv().await {
            let listeners = self.listeners.read().await
                .values()
                .cloned()
                .collect::<Vec<_>>();
            for l in listeners {
                let evt = event.clone();
                spawn(async move { l.on_oxen_event(evt).await });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use tokio::sync::Notify;

    use super::*;
    use crate::util::sid::Sid;

    struct RecordingListener {
        events: Mutex<Vec<OxenEvent>>,
        notify: Notify,
    }

    #[async_trait::async_trait]
    impl OxenEventListener for RecordingListener {
        async fn on_oxen_event(&self, event: OxenEvent) {
            self.events.lock().unwrap().push(event);
            self.notify.notify_one();
        }
    }

    #[tokio::test]
    async fn test_listeners_receive_events() {
        let notifier = Arc::new(OxenEventNotifier::new());
        let listener = Arc::new(RecordingListener {
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        });
        let id = notifier.add_listener(listener.clone()).await;

        let (send, recv) = mpsc::channel(8);
        let run = {
            let notifier = notifier.clone();
            tokio::spawn(async move { notifier.run_loop(recv).await })
        };

        let event = OxenEvent::PeerUp(PeerUpData { sid: Sid::new("0N1"), expected: true });
        send.send(event.clone()).await.unwrap();
        listener.notify.notified().await;
        assert_eq!(listener.events.lock().unwrap().clone(), vec![event]);

        notifier.try_remove_listener(&id).await.unwrap();
        assert!(notifier.try_remove_listener(&id).await.is_err());

        drop(send);
        run.await.unwrap();
    }
}
