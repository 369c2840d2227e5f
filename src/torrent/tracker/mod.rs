pub mod http;

use std::{collections::VecDeque, error::Error, fmt::Display, net::Ipv4Addr};

use async_trait::async_trait;
use serde_bencode::value::Value;
use tracing::{debug, warn};
use url::Url;

use crate::torrent::peer::{Ip, Peer};

use http::HttpTracker;

/// One announce request, built from session state each time.
#[derive(Debug, Clone)]
pub struct Announce {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub compact: u8,
    pub event: Option<AnnounceEvent>,
    pub num_want: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// A successfully decoded announce response.
#[derive(Debug, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds the tracker wants between regular announces.
    pub interval: Option<u64>,
    pub min_interval: Option<u64>,
    pub seeders: Option<u64>,
    pub leechers: Option<u64>,
    pub peers: Vec<Peer>,
}

#[async_trait]
pub trait TrackerProtocol {
    async fn announce(
        &mut self,
        announce_url: &str,
        request: &Announce,
    ) -> Result<AnnounceResponse, TrackerError>;
}

/// Rotates over the metainfo's announce URLs, keeping the first transport
/// that answers at the front of the queue. HTTP(S) is the only supported
/// scheme.
pub struct Tracker {
    announce_list: VecDeque<String>,
    http: HttpTracker,
}

impl Tracker {
    pub fn new(announce_urls: Vec<String>) -> Tracker {
        Tracker {
            announce_list: VecDeque::from(announce_urls),
            http: HttpTracker::new(),
        }
    }

    pub async fn announce(&mut self, request: &Announce) -> Result<AnnounceResponse, TrackerError> {
        let mut last_error = TrackerError::EmptyAnnounceQueue;

        for _ in 0..self.announce_list.len() {
            let announce_url = match self.announce_list.front() {
                Some(url) => url.clone(),
                None => break,
            };
            let result = match Url::parse(&announce_url) {
                Ok(url) => match url.scheme() {
                    "http" | "https" => self.http.announce(&announce_url, request).await,
                    other => Err(TrackerError::UnsupportedProtocol(other.to_string())),
                },
                Err(err) => Err(TrackerError::AnnounceParse(err)),
            };
            match result {
                Ok(response) => {
                    debug!(
                        announce_url = %announce_url,
                        peer_count = response.peers.len(),
                        "Announce succeeded"
                    );
                    return Ok(response);
                }
                Err(err) => {
                    warn!(announce_url = %announce_url, error = %err, "Announce failed, rotating");
                    last_error = err;
                    self.rotate();
                }
            }
        }
        Err(last_error)
    }

    fn rotate(&mut self) {
        if let Some(url) = self.announce_list.pop_front() {
            self.announce_list.push_back(url);
        }
    }
}

/// Decodes the `peers` value of an announce response: either a compact
/// string of 6-byte IPv4/port entries or a list of peer dictionaries.
pub(super) fn decode_peers(value: &Value) -> Result<Vec<Peer>, TrackerError> {
    match value {
        Value::Bytes(bytes) => {
            if bytes.len() % 6 != 0 {
                return Err(TrackerError::InvalidPeers(
                    "compact peer string length is not a multiple of 6",
                ));
            }
            Ok(bytes
                .chunks_exact(6)
                .map(|chunk| Peer {
                    peer_id: None,
                    ip: Ip::V4(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3])),
                    port: u16::from_be_bytes([chunk[4], chunk[5]]),
                })
                .collect())
        }
        Value::List(entries) => entries.iter().map(decode_peer_dict).collect(),
        _ => Err(TrackerError::InvalidPeers(
            "peers value is neither a string nor a list",
        )),
    }
}

fn decode_peer_dict(entry: &Value) -> Result<Peer, TrackerError> {
    let dict = match entry {
        Value::Dict(dict) => dict,
        _ => return Err(TrackerError::InvalidPeers("peer entry is not a dictionary")),
    };

    let ip = match dict.get("ip".as_bytes()) {
        Some(Value::Bytes(bytes)) => {
            let text = String::from_utf8_lossy(bytes);
            if let Ok(v4) = text.parse() {
                Ip::V4(v4)
            } else if let Ok(v6) = text.parse() {
                Ip::V6(v6)
            } else {
                Ip::Dns(text.into_owned())
            }
        }
        _ => return Err(TrackerError::InvalidPeers("peer entry has no ip")),
    };
    let port = match dict.get("port".as_bytes()) {
        Some(Value::Int(port)) if (0..=u16::MAX as i64).contains(port) => *port as u16,
        _ => return Err(TrackerError::InvalidPeers("peer entry has no valid port")),
    };
    let peer_id = match dict.get("peer id".as_bytes()) {
        Some(Value::Bytes(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
        _ => None,
    };

    Ok(Peer { peer_id, ip, port })
}

#[derive(Debug)]
pub enum TrackerError {
    /// The tracker answered with an explicit failure reason.
    Failure(String),
    EmptyAnnounceQueue,
    UnsupportedProtocol(String),
    AnnounceParse(url::ParseError),
    Request(reqwest::Error),
    ResponseBody(reqwest::Error),
    Decode(serde_bencode::Error),
    InvalidPeers(&'static str),
}

impl Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerError::Failure(reason) => write!(f, "Tracker reported failure: {}", reason),
            TrackerError::EmptyAnnounceQueue => write!(f, "No usable announce URL"),
            TrackerError::UnsupportedProtocol(scheme) => {
                write!(f, "Protocol not supported: {}", scheme)
            }
            TrackerError::AnnounceParse(err) => write!(f, "Announce url parse error: {}", err),
            TrackerError::Request(err) => write!(f, "HTTP request error: {}", err),
            TrackerError::ResponseBody(err) => write!(f, "Tracker invalid response: {}", err),
            TrackerError::Decode(err) => write!(f, "Error decoding response: {}", err),
            TrackerError::InvalidPeers(reason) => write!(f, "Invalid peers format: {}", reason),
        }
    }
}

impl Error for TrackerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrackerError::AnnounceParse(err) => Some(err),
            TrackerError::Request(err) => Some(err),
            TrackerError::ResponseBody(err) => Some(err),
            TrackerError::Decode(err) => Some(err),
            _ => None,
        }
    }
}
