use std::fmt::{Debug, Formatter};
use std::time::Duration;

use tokio::time::Instant;

/// A point on the engine's monotonic timeline, in milliseconds since some
///  arbitrary reference. The engine only ever computes max and delta, so no
///  wall-clock synchronization across the cluster is needed.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Stands in for "never": well before any timestamp the clock will produce.
    pub const NEVER: Timestamp = Timestamp(0);

    pub fn from_millis(millis: u64) -> Timestamp {
        Timestamp(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn plus(&self, d: Duration) -> Timestamp {
        Timestamp(self.0 + d.as_millis() as u64)
    }

    /// Saturating distance into the past, as a [Duration].
    pub fn elapsed_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Debug for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}ms", self.0)
    }
}

/// The engine's single source of time. Injectable so that scenario tests are
///  fully deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Production clock, measuring against a fixed reference instant. Uses tokio's
///  [Instant] so paused-time tests see the engine and the runtime agree.
pub struct TokioClock {
    reference: Instant,
}

impl TokioClock {
    pub fn new() -> TokioClock {
        TokioClock { reference: Instant::now() }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.reference.elapsed().as_millis() as u64)
    }
}
