use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::Notify;
use tracing::{info, trace};

use crate::net::transport::{DatagramHandler, Transport};

/// Buffer size for inbound datagrams. Parcels are bounded far below this, but
///  we read the full datagram so oversize can be detected and logged rather
///  than silently truncated.
const RECV_BUF_SIZE: usize = 64 * 1024;

pub struct UdpTransport {
    socket: UdpSocket,
    cancel: Notify,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(addr).await?;
        info!("listening for parcels on {}", socket.local_addr()?);
        Ok(UdpTransport { socket, cancel: Notify::new() })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        trace!("sending {} bytes to {}", buf.len(), to);
        self.socket.send_to(buf, to).await?;
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            select! {
                _ = self.cancel.notified() => {
                    info!("receive loop canceled");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, sender) = received?;
                    trace!("received {} bytes from {}", len, sender);
                    handler.handle_datagram(&buf[..len], sender).await;
                }
            }
        }
    }

    fn cancel_recv_loop(&self) {
        // notify_one stores a permit, so a cancel before the loop reaches its
        // next await is not lost
        self.cancel.notify_one();
    }
}
