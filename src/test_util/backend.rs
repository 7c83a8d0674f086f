use std::time::Duration;

use crate::oxen::core::OxenBackend;
use crate::oxen::events::OxenEvent;
use crate::util::clock::Timestamp;
use crate::util::sid::Sid;
use crate::wire::{Parcel, SchemaMode};

/// An [OxenBackend] over plain vectors: queued parcels are decoded and
///  collected, events are collected, and time only moves when the test says
///  so.
pub struct CollectingBackend {
    now: Timestamp,
    sent: Vec<(Sid, Parcel)>,
    events: Vec<OxenEvent>,
}

impl CollectingBackend {
    pub fn at(now: Timestamp) -> CollectingBackend {
        CollectingBackend { now, sent: Vec::new(), events: Vec::new() }
    }

    pub fn advance(&mut self, d: Duration) {
        self.now = self.now.plus(d);
    }

    /// All parcels queued since the last call, with their next-hop neighbors.
    pub fn take_sent(&mut self) -> Vec<(Sid, Parcel)> {
        std::mem::take(&mut self.sent)
    }

    pub fn take_events(&mut self) -> Vec<OxenEvent> {
        std::mem::take(&mut self.events)
    }
}

impl OxenBackend for CollectingBackend {
    fn now(&self) -> Timestamp {
        self.now
    }

    fn queue_send(&mut self, to: Sid, data: Vec<u8>) {
        let parcel = Parcel::decode(&data, SchemaMode::Strict)
            .expect("the engine queued a parcel that does not decode");
        self.sent.push((to, parcel));
    }

    fn deliver(&mut self, event: OxenEvent) {
        self.events.push(event);
    }
}
