use std::{
    fs::File,
    io::{self, Read},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use config::Config;
use rand::{rngs::StdRng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Level};
use tracing_appender::rolling;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    EnvFilter, Registry,
};

use torrent::{
    coordinator::Coordinator,
    disk::Disk,
    events::Event,
    rate::TransferCounters,
    torrent::{generate_peer_id, Torrent},
    tracker::{Announce, AnnounceEvent, Tracker},
};

pub mod config;
pub mod torrent;

/// Fallback when the tracker does not suggest an announce interval.
const DEFAULT_ANNOUNCE_INTERVAL: u64 = 1800;

/// Retry delay after an announce failed on every tracker in the list.
const ANNOUNCE_RETRY_SECS: u64 = 60;

#[tokio::main]
async fn main() -> io::Result<()> {
    // File appender: rolling logs daily to "logs/swell.log".
    let file_appender = rolling::daily("logs", "swell.log");

    // Logger for terminal output (with colors).
    let terminal_layer = fmt::layer()
        .with_thread_names(true)
        .with_target(true)
        .with_span_events(FmtSpan::NONE)
        .with_ansi(true);

    // Logger for file output (no colors or ANSI escape codes).
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_thread_names(true)
        .with_target(true)
        .with_span_events(FmtSpan::NONE)
        .with_ansi(false);

    // Combine the layers and apply the subscriber.
    let subscriber = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::DEBUG.into()))
        .with(terminal_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let Some(file_path) = std::env::args().nth(1) else {
        eprintln!("Usage: swell <torrent-file>");
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "missing torrent file argument",
        ));
    };

    debug!(file_path = %file_path, "Opening torrent file");
    let mut file = File::open(&file_path).map_err(|e| {
        warn!("Failed to open torrent file: {}", e);
        e
    })?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;

    let torrent = Torrent::from_bytes(&buffer).map_err(|e| {
        warn!("Failed to parse torrent file: {}", e);
        io::Error::new(io::ErrorKind::InvalidData, e)
    })?;
    info!(
        name = %torrent.name,
        info_hash = %hex::encode(torrent.info_hash),
        pieces = torrent.piece_count(),
        bytes = torrent.total_length,
        "Torrent loaded"
    );

    let config = match Config::load() {
        Ok(config) => config,
        Err(error) => {
            warn!(error = %error, "Failed to load config, using defaults");
            Config::default()
        }
    };

    let peer_id = generate_peer_id();
    debug!(peer_id = %String::from_utf8_lossy(&peer_id), "Generated session peer ID");

    let counters = Arc::new(TransferCounters::new(torrent.total_length));
    let (event_tx, event_rx) = mpsc::channel::<Event>(config.session.event_queue_capacity);

    let disk = Disk::new(
        PathBuf::from(&config.disk.download_path),
        torrent.files.clone(),
        torrent.piece_length,
        torrent.total_length,
        event_tx.clone(),
    );
    let (disk_tx, disk_handle) = disk.run();

    let session_handle = Coordinator::new(
        &torrent,
        config.clone(),
        peer_id,
        Arc::clone(&counters),
        disk_tx,
        event_tx.clone(),
        event_rx,
        StdRng::from_entropy(),
    )
    .run();

    // Announce loop: Started first, then regular re-announces with current
    // totals on the tracker's suggested interval.
    let mut tracker = Tracker::new(torrent.announce_urls.clone());
    let info_hash = torrent.info_hash;
    let announce_port = config.network.port;
    let announce_handle = tokio::spawn(async move {
        let mut event = Some(AnnounceEvent::Started);
        loop {
            let request = Announce {
                info_hash,
                peer_id,
                port: announce_port,
                uploaded: counters.uploaded(),
                downloaded: counters.downloaded(),
                left: counters.left(),
                compact: 1,
                event: event.take(),
                num_want: Some(50),
            };
            let wait = match tracker.announce(&request).await {
                Ok(response) => {
                    info!(
                        peer_count = response.peers.len(),
                        seeders = response.seeders,
                        leechers = response.leechers,
                        "Announce succeeded"
                    );
                    if !response.peers.is_empty()
                        && event_tx
                            .send(Event::PeersDiscovered {
                                peers: response.peers,
                            })
                            .await
                            .is_err()
                    {
                        break;
                    }
                    response.interval.unwrap_or(DEFAULT_ANNOUNCE_INTERVAL)
                }
                Err(error) => {
                    error!(error = %error, "Announce failed on every tracker");
                    ANNOUNCE_RETRY_SECS
                }
            };
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }
    });

    if let Err(error) = session_handle.await {
        error!(error = %error, "Session task failed");
    }
    announce_handle.abort();
    let _ = disk_handle.await;

    Ok(())
}
