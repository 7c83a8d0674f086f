use std::time::Duration;

use crate::wire::SchemaMode;

#[derive(Debug, Clone)]
pub struct OxenConfig {
    /// a link whose last contact is older than this is considered possibly
    ///  unusable
    pub link_stale: Duration,
    /// a peer that stays possibly unreachable for this long is given up on
    pub give_up_after: Duration,

    /// idle time towards a neighbor after which a standalone keepalive probe
    ///  is sent
    pub keepalive_idle: Duration,
    /// longest time a received keepalive id waits for an outbound parcel to
    ///  piggyback on before a standalone echo is sent
    pub keepalive_echo_delay: Duration,
    /// unresolved keepalive ids remembered per neighbor; oldest are evicted
    pub keepalive_window: usize,

    pub gossip_period: Duration,
    /// number of matrix columns shipped per gossip round
    pub gossip_columns: usize,
    /// number of gossip partners per round
    pub gossip_partners: usize,

    pub retry_base: Duration,
    /// cap on the retransmit backoff exponent, i.e. the longest interval is
    ///  `retry_base * 2^retry_cap`
    pub retry_cap: u32,

    /// hard bound on the encoded size of any parcel (path MTU budget)
    pub max_parcel_bytes: usize,
    pub schema_mode: SchemaMode,
}

impl OxenConfig {
    pub fn new() -> OxenConfig {
        OxenConfig {
            link_stale: Duration::from_secs(30),
            give_up_after: Duration::from_secs(300),
            keepalive_idle: Duration::from_secs(10),
            keepalive_echo_delay: Duration::from_secs(1),
            keepalive_window: 64,
            gossip_period: Duration::from_secs(5),
            gossip_columns: 3,
            gossip_partners: 1,
            retry_base: Duration::from_secs(1),
            retry_cap: 6,
            max_parcel_bytes: 1200,
            schema_mode: SchemaMode::Strict,
        }
    }
}

impl Default for OxenConfig {
    fn default() -> Self {
        OxenConfig::new()
    }
}
