pub mod transport;
pub mod udp;

pub use transport::{DatagramHandler, Transport};
pub use udp::UdpTransport;
