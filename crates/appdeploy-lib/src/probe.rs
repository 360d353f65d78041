//! Readiness probe

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Attempt one TCP connection to `address`, waiting at most `limit` for it
/// to complete. Returns whether the connection succeeded.
pub async fn wait_until_listening(address: SocketAddr, limit: Duration) -> bool {
    match timeout(limit, TcpStream::connect(address)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("{} refused the connection: {}", address, e);
            false
        }
        Err(_) => {
            debug!("{} did not answer within {:?}", address, limit);
            false
        }
    }
}
