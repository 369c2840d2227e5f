use std::{error::Error, fmt::Display, io, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use wire::{
    error::WireError,
    handshake::{Handshake, HANDSHAKE_LEN},
};

/// A peer that has not completed the handshake within this window is cut
/// loose before it can tie up an admission slot.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends our handshake, reads the peer's, and checks that both sides are
/// talking about the same torrent. Returns the remote handshake so the
/// caller can record the peer id.
pub async fn exchange<S>(
    stream: &mut S,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    exchange_with_deadline(stream, info_hash, peer_id, HANDSHAKE_TIMEOUT).await
}

pub async fn exchange_with_deadline<S>(
    stream: &mut S,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    deadline: Duration,
) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(deadline, exchange_inner(stream, info_hash, peer_id)).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout),
    }
}

async fn exchange_inner<S>(
    stream: &mut S,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = Handshake::new(info_hash, peer_id);
    stream.write_all(&ours.serialize()).await?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;

    // read_exact filled the whole buffer, so parse never reports a
    // short read here.
    let theirs = Handshake::parse(&buf)?.ok_or(HandshakeError::Truncated)?;

    if theirs.info_hash != info_hash {
        return Err(HandshakeError::InfoHashMismatch);
    }

    Ok(theirs)
}

#[derive(Debug)]
pub enum HandshakeError {
    /// The peer's handshake bytes do not form a valid handshake.
    Wire(WireError),
    /// The peer answered for a different torrent.
    InfoHashMismatch,
    /// The stream ended before a full handshake arrived.
    Truncated,
    Timeout,
    Io(io::Error),
}

impl Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::Wire(err) => write!(f, "Malformed handshake: {}", err),
            HandshakeError::InfoHashMismatch => {
                write!(f, "Peer handshake carries a different info hash")
            }
            HandshakeError::Truncated => write!(f, "Connection closed mid-handshake"),
            HandshakeError::Timeout => write!(f, "Handshake timed out"),
            HandshakeError::Io(err) => write!(f, "Handshake I/O error: {}", err),
        }
    }
}

impl Error for HandshakeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HandshakeError::Wire(err) => Some(err),
            HandshakeError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<WireError> for HandshakeError {
    fn from(err: WireError) -> Self {
        HandshakeError::Wire(err)
    }
}

impl From<io::Error> for HandshakeError {
    fn from(err: io::Error) -> Self {
        HandshakeError::Io(err)
    }
}
