use std::{error::Error, fmt::Display, io, time::Duration};

use tokio::{net::TcpStream, time::timeout};
use tracing::warn;

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Dials a peer, retrying only on timeout. Refusals and other socket
/// errors fail fast so the coordinator can move on to the next candidate.
pub async fn connect(
    peer_addr: &str,
    timeout_ms: u64,
    connection_retries: u32,
) -> Result<TcpStream, TcpError> {
    let attempts = connection_retries.max(1);
    for attempt in 1..=attempts {
        match timeout(
            Duration::from_millis(timeout_ms),
            TcpStream::connect(peer_addr),
        )
        .await
        {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                warn!(peer_addr, "Connection refused by peer");
                return Err(TcpError::Refused(e));
            }
            Ok(Err(e)) => {
                warn!(peer_addr, error = %e, "Failed to connect to peer");
                return Err(TcpError::Connect(e));
            }
            Err(_) => {
                warn!(peer_addr, attempt, "Connection attempt timed out");
                if attempt < attempts {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    Err(TcpError::Timeout)
}

#[derive(Debug)]
pub enum TcpError {
    Refused(io::Error),
    Connect(io::Error),
    Timeout,
}

impl Display for TcpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TcpError::Refused(err) => write!(f, "Peer refused connection: {}", err),
            TcpError::Connect(err) => write!(f, "Connection error: {}", err),
            TcpError::Timeout => write!(f, "All connection attempts timed out"),
        }
    }
}

impl Error for TcpError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TcpError::Refused(err) | TcpError::Connect(err) => Some(err),
            TcpError::Timeout => None,
        }
    }
}
