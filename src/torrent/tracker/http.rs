use async_trait::async_trait;
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_bencode::{de, value::Value};
use tracing::warn;
use url::Url;

use super::{decode_peers, Announce, AnnounceResponse, TrackerError, TrackerProtocol};

pub struct HttpTracker {}

/// Announce response as it appears on the wire; `peers` is kept as a raw
/// bencode value because trackers send either a compact string or a list of
/// dictionaries.
#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(rename = "warning message")]
    warning_message: Option<String>,
    interval: Option<u64>,
    #[serde(rename = "min interval")]
    min_interval: Option<u64>,
    complete: Option<u64>,
    incomplete: Option<u64>,
    peers: Option<Value>,
}

impl HttpTracker {
    pub fn new() -> HttpTracker {
        HttpTracker {}
    }

    /// Builds the GET URL. `info_hash` and `peer_id` are raw 20-byte strings
    /// and must be percent-encoded by hand; everything else goes through the
    /// regular query encoder.
    fn build_announce_url(announce: &str, request: &Announce) -> Result<String, TrackerError> {
        let mut url = Url::parse(announce).map_err(TrackerError::AnnounceParse)?;

        let info_hash = percent_encode(&request.info_hash, NON_ALPHANUMERIC).to_string();
        let peer_id = percent_encode(&request.peer_id, NON_ALPHANUMERIC).to_string();
        url.set_query(Some(&format!("info_hash={info_hash}&peer_id={peer_id}")));

        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("port", &request.port.to_string())
                .append_pair("uploaded", &request.uploaded.to_string())
                .append_pair("downloaded", &request.downloaded.to_string())
                .append_pair("left", &request.left.to_string())
                .append_pair("compact", &request.compact.to_string());
            if let Some(event) = request.event {
                pairs.append_pair("event", event.as_str());
            }
            if let Some(num_want) = request.num_want {
                pairs.append_pair("numwant", &num_want.to_string());
            }
        }

        Ok(url.to_string())
    }

    fn parse_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
        let raw = de::from_bytes::<RawResponse>(body).map_err(TrackerError::Decode)?;

        if let Some(reason) = raw.failure_reason {
            return Err(TrackerError::Failure(reason));
        }
        if let Some(message) = raw.warning_message {
            warn!(warning = %message, "Tracker sent a warning");
        }

        let peers = match &raw.peers {
            Some(value) => decode_peers(value)?,
            None => Vec::new(),
        };

        Ok(AnnounceResponse {
            interval: raw.interval,
            min_interval: raw.min_interval,
            seeders: raw.complete,
            leechers: raw.incomplete,
            peers,
        })
    }
}

#[async_trait]
impl TrackerProtocol for HttpTracker {
    async fn announce(
        &mut self,
        announce_url: &str,
        request: &Announce,
    ) -> Result<AnnounceResponse, TrackerError> {
        let url = Self::build_announce_url(announce_url, request)?;
        let response = reqwest::get(&url).await.map_err(TrackerError::Request)?;
        let body = response.bytes().await.map_err(TrackerError::ResponseBody)?;

        Self::parse_response(&body)
    }
}
