use std::{error::Error, fmt::Display, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, trace, warn};
use wire::{error::WireError, message::Message};

use crate::torrent::events::Event;

/// Sent whenever the outbound half has been quiet this long.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Outbound message queue size. A full queue makes the coordinator wait
/// rather than buffer without bound.
const OUTBOUND_CAPACITY: usize = 128;

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Handle to a running peer connection: a bounded queue into the writer
/// task and a shutdown signal shared by both I/O tasks.
#[derive(Debug, Clone)]
pub struct PeerLink {
    out_tx: mpsc::Sender<Message>,
    shutdown_tx: broadcast::Sender<()>,
}

impl PeerLink {
    /// Queues a message for the writer, waiting if the queue is full.
    pub async fn send(&self, message: Message) -> Result<(), ConnectionError> {
        self.out_tx
            .send(message)
            .await
            .map_err(|_| ConnectionError::LinkClosed)
    }

    /// Signals both I/O tasks to stop. Safe to call more than once; the
    /// reader still emits its single close event.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Spawns the reader and writer tasks for an established, handshaken
/// stream.
///
/// The reader parses frames incrementally and forwards them as events; it
/// is the only place that emits `Event::PeerClosed`, and does so exactly
/// once no matter how the connection ends. The writer drains the outbound
/// queue and keeps the link alive with keep-alives.
pub fn spawn<S>(
    stream: S,
    addr: String,
    event_tx: mpsc::Sender<Event>,
) -> (PeerLink, JoinHandle<()>, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let (read_half, write_half) = tokio::io::split(stream);

    let reader_handle = tokio::spawn(read_loop(
        read_half,
        addr.clone(),
        event_tx,
        shutdown_tx.subscribe(),
        shutdown_tx.clone(),
    ));

    let writer_handle = tokio::spawn(write_loop(
        write_half,
        addr,
        out_rx,
        shutdown_tx.subscribe(),
        shutdown_tx.clone(),
    ));

    let link = PeerLink {
        out_tx,
        shutdown_tx,
    };

    (link, reader_handle, writer_handle)
}

async fn read_loop<R>(
    mut read_half: R,
    addr: String,
    event_tx: mpsc::Sender<Event>,
    mut shutdown_rx: broadcast::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    'session: loop {
        tokio::select! {
            read = read_half.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        debug!(peer_addr = %addr, "Peer closed the connection");
                        break 'session;
                    }
                    Ok(n) => {
                        buffer.extend_from_slice(&chunk[..n]);
                        match drain_frames(&mut buffer) {
                            Ok(messages) => {
                                for message in messages {
                                    trace!(peer_addr = %addr, ?message, "Frame received");
                                    let forwarded = event_tx
                                        .send(Event::PeerMessage {
                                            addr: addr.clone(),
                                            message,
                                        })
                                        .await;
                                    if forwarded.is_err() {
                                        break 'session;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(peer_addr = %addr, error = %e, "Dropping peer on malformed frame");
                                break 'session;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(peer_addr = %addr, error = %e, "Error reading from peer");
                        break 'session;
                    }
                }
            }
            _ = shutdown_rx.recv() => break 'session,
        }
    }

    // Stop the writer, then report the closure. Every exit path of the
    // connection funnels through this one event.
    let _ = shutdown_tx.send(());
    let _ = event_tx.send(Event::PeerClosed { addr }).await;
}

async fn write_loop<W>(
    mut write_half: W,
    addr: String,
    mut out_rx: mpsc::Receiver<Message>,
    mut shutdown_rx: broadcast::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
) where
    W: AsyncWrite + Unpin,
{
    let mut keepalive = time::interval_at(
        Instant::now() + KEEPALIVE_INTERVAL,
        KEEPALIVE_INTERVAL,
    );

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(message) = outbound else {
                    break;
                };
                if let Err(e) = write_half.write_all(&message.serialize()).await {
                    warn!(peer_addr = %addr, error = %e, "Error writing to peer");
                    break;
                }
                keepalive.reset();
            }
            _ = keepalive.tick() => {
                trace!(peer_addr = %addr, "Sending keep-alive");
                if let Err(e) = write_half.write_all(&Message::KeepAlive.serialize()).await {
                    warn!(peer_addr = %addr, error = %e, "Error writing keep-alive");
                    break;
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = write_half.shutdown().await;
                debug!(peer_addr = %addr, "Writer shut down");
                return;
            }
        }
    }

    // Writer died on its own; wake the reader so the close event fires.
    let _ = shutdown_tx.send(());
}

/// Parses every complete frame at the front of `buffer`, leaving any
/// partial frame in place for the next read.
fn drain_frames(buffer: &mut Vec<u8>) -> Result<Vec<Message>, WireError> {
    let mut messages = Vec::new();
    loop {
        match Message::parse(buffer)? {
            Some((message, consumed)) => {
                buffer.drain(..consumed);
                messages.push(message);
            }
            None => return Ok(messages),
        }
    }
}

#[derive(Debug)]
pub enum ConnectionError {
    /// The connection's writer task is gone; the peer is closing.
    LinkClosed,
}

impl Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::LinkClosed => write!(f, "Peer connection closed"),
        }
    }
}

impl Error for ConnectionError {}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use tokio::io::duplex;
    use tokio::time::{timeout, Duration};

    use super::*;

    fn addr() -> String {
        "127.0.0.1:6881".to_string()
    }

    #[test]
    fn drains_complete_frames_and_keeps_the_partial_tail() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&Message::Have(7).serialize());
        buffer.extend_from_slice(&Message::Unchoke.serialize());
        // First three bytes of a keep-alive.
        buffer.extend_from_slice(&[0, 0, 0]);

        let messages = drain_frames(&mut buffer).unwrap();

        assert_eq!(messages, vec![Message::Have(7), Message::Unchoke]);
        assert_eq!(buffer, vec![0, 0, 0]);
    }

    #[test]
    fn malformed_frame_surfaces_the_parse_error() {
        // Message id 9 is outside the supported set.
        let mut buffer = vec![0, 0, 0, 1, 9];

        let result = drain_frames(&mut buffer);

        assert_matches!(result, Err(WireError::UnknownMessageId(9)));
    }

    #[tokio::test]
    async fn forwards_parsed_frames_as_events() {
        let (local, mut remote) = duplex(1024);
        let (event_tx, mut event_rx) = mpsc::channel(16);

        let (_link, _r, _w) = spawn(local, addr(), event_tx);

        remote.write_all(&Message::Have(3).serialize()).await.unwrap();
        remote
            .write_all(
                &Message::Piece {
                    index: 0,
                    begin: 0,
                    block: vec![1, 2, 3],
                }
                .serialize(),
            )
            .await
            .unwrap();

        assert_matches!(
            event_rx.recv().await,
            Some(Event::PeerMessage {
                message: Message::Have(3),
                ..
            })
        );
        assert_matches!(
            event_rx.recv().await,
            Some(Event::PeerMessage {
                message: Message::Piece { .. },
                ..
            })
        );
    }

    #[tokio::test]
    async fn reassembles_a_frame_split_across_writes() {
        let (local, mut remote) = duplex(1024);
        let (event_tx, mut event_rx) = mpsc::channel(16);

        let (_link, _r, _w) = spawn(local, addr(), event_tx);

        let frame = Message::Request {
            index: 1,
            begin: 16_384,
            length: 16_384,
        }
        .serialize();
        remote.write_all(&frame[..5]).await.unwrap();
        remote.flush().await.unwrap();
        remote.write_all(&frame[5..]).await.unwrap();

        assert_matches!(
            event_rx.recv().await,
            Some(Event::PeerMessage {
                message: Message::Request {
                    index: 1,
                    begin: 16_384,
                    length: 16_384,
                },
                ..
            })
        );
    }

    #[tokio::test]
    async fn queued_messages_reach_the_remote_end() {
        let (local, mut remote) = duplex(1024);
        let (event_tx, _event_rx) = mpsc::channel(16);

        let (link, _r, _w) = spawn(local, addr(), event_tx);

        link.send(Message::Interested).await.unwrap();

        let mut frame = [0u8; 5];
        remote.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [0, 0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn remote_hangup_emits_a_single_close_event() {
        let (local, remote) = duplex(1024);
        let (event_tx, mut event_rx) = mpsc::channel(16);

        let (_link, reader, _w) = spawn(local, addr(), event_tx);
        drop(remote);

        assert_matches!(event_rx.recv().await, Some(Event::PeerClosed { .. }));
        reader.await.unwrap();

        // Nothing else arrives after the close event.
        let extra = timeout(Duration::from_millis(50), event_rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_both_tasks() {
        let (local, _remote) = duplex(1024);
        let (event_tx, mut event_rx) = mpsc::channel(16);

        let (link, reader, writer) = spawn(local, addr(), event_tx);

        link.close();
        link.close();

        assert_matches!(event_rx.recv().await, Some(Event::PeerClosed { .. }));
        reader.await.unwrap();
        writer.await.unwrap();

        let extra = timeout(Duration::from_millis(50), event_rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn malformed_frame_tears_the_connection_down() {
        let (local, mut remote) = duplex(1024);
        let (event_tx, mut event_rx) = mpsc::channel(16);

        let (_link, _r, _w) = spawn(local, addr(), event_tx);

        remote.write_all(&[0, 0, 0, 1, 9]).await.unwrap();

        assert_matches!(event_rx.recv().await, Some(Event::PeerClosed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_link_sends_a_keep_alive() {
        let (local, mut remote) = duplex(1024);
        let (event_tx, _event_rx) = mpsc::channel(16);

        let (_link, _r, _w) = spawn(local, addr(), event_tx);

        // The paused clock advances once every task is idle, firing the
        // keep-alive interval.
        let mut frame = [0u8; 4];
        remote.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [0, 0, 0, 0]);
    }
}
