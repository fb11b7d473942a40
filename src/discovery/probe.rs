use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

/// Reachability test for a single host:port
///
/// A refused or timed-out connection is "not found", never an error.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, addr: SocketAddr, timeout: Duration) -> bool;
}

/// Plain TCP connect probe
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, addr: SocketAddr, limit: Duration) -> bool {
        match timeout(limit, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                trace!("Probe {} refused: {}", addr, e);
                false
            }
            Err(_) => {
                trace!("Probe {} timed out after {:?}", addr, limit);
                false
            }
        }
    }
}
