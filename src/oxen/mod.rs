//! Oxen is the cluster membership and messaging protocol.
//!
//! Oxen provides reliable in-order delivered once messaging, and reliable
//! out-of-order delivered at-least-once messaging. The in-order delivered once
//! case can be seen as extra handling on top of the out-of-order delivered
//! at-least-once case: a message numbering scheme detects duplicates and
//! restores order.
//!
//! Because the state layer above can checkpoint and merge, the out-of-order
//! delivered at-least-once case is good enough for synchronizing state. For
//! cases that need to map more closely to traditional IRC, such as PRIVMSG,
//! the in-order delivered once functionality can be used.
//!
//! On top of both services Oxen tracks peer reachability through gossiped
//! last-contact timestamps, forwards through intermediate peers when direct
//! links look unusable, and surfaces peer lifecycle events.

pub mod config;
pub mod core;
pub mod driver;
pub mod events;
pub mod keepalive;
pub mod last_contact;
pub mod peers;
pub mod reliability;
pub mod sequencer;

pub use self::config::OxenConfig;
pub use self::core::{Oxen, OxenBackend};
pub use self::driver::{run_oxen, OxenCluster, OxenRequest};
pub use self::events::{OxenEvent, OxenEventListener, OxenEventNotifier, StreamKind};
