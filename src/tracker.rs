//! The tracker client: periodic HTTP announces and compact peer list
//! parsing.
//!
//! Grounded on the original Python client's `utils/tracker.py::Tracker`
//! (the announce parameter set and the "UTF-8 body containing `failure`"
//! error heuristic) and on the teacher's reqwest-based HTTP stack, with
//! dict-form peer lists rejected outright per spec §4.1.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};

use crate::bencode::{self, Value};
use crate::error::TrackerError;
use crate::{PeerId, Sha1Hash};

/// `event=started` is sent on the very first announce and omitted on every
/// subsequent one (spec §9: preserved from the original's `first` flag).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Started,
    /// Sent once, when the last missing piece is verified. The spec's
    /// announce-parameter table only names `started`, but a well-behaved
    /// tracker client reports completion too, the way the original source's
    /// `Tracker.connect` accepts an explicit `event` override for it.
    Completed,
}

/// The parameters of a single announce call. `uploaded`/`downloaded`/`left`
/// are taken as given by the caller — spec §9's open question resolves in
/// favor of the caller-supplied values, not the original's hardcoded zeros.
#[derive(Clone, Debug)]
pub struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
}

/// The subset of a tracker's bencoded response this core consumes.
#[derive(Clone, Debug)]
pub struct Response {
    pub interval: Duration,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1800);

/// Issues announces against a single torrent's tracker. Owns a `reqwest`
/// client scoped to this tracker's lifetime; dropping it releases its
/// connection pool deterministically (spec §9: the original leaks its
/// `aiohttp.ClientSession` by never awaiting `close()`, which this avoids).
pub struct Tracker {
    announce_url: String,
    http: reqwest::Client,
}

impl Tracker {
    pub fn new(announce_url: String) -> Self {
        Self {
            announce_url,
            http: reqwest::Client::new(),
        }
    }

    pub async fn announce(
        &self,
        req: &Announce,
    ) -> Result<Response, TrackerError> {
        let url = self.build_url(req);
        log::info!("Announcing to tracker at {}", self.announce_url);
        log::debug!("Announce url: {}", url);

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(TrackerError::BadStatus(response.status()));
        }
        let body = response.bytes().await?;

        // The tracker may signal failure with HTTP 200 and a UTF-8 body
        // containing a `failure reason` field; a successful response is raw
        // bencode and is generally not valid UTF-8, so this check is safe.
        if let Ok(text) = std::str::from_utf8(&body) {
            if text.contains("failure") {
                return Err(TrackerError::Failure(text.to_owned()));
            }
        }

        let value = bencode::decode(&body)?;
        parse_response(&value)
    }

    fn build_url(&self, req: &Announce) -> String {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.announce_url,
            percent_encode_bytes(&req.info_hash),
            percent_encode_bytes(&req.peer_id),
            req.port,
            req.uploaded,
            req.downloaded,
            req.left,
        );
        match req.event {
            Some(Event::Started) => url.push_str("&event=started"),
            Some(Event::Completed) => url.push_str("&event=completed"),
            None => {}
        }
        url
    }
}

/// Raw bytes need raw percent-encoding, not a string-typed query-pair
/// encoder: `info_hash`/`peer_id` are 20 arbitrary bytes, not UTF-8 text.
fn percent_encode_bytes(bytes: &[u8]) -> String {
    percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

fn parse_response(value: &Value) -> Result<Response, TrackerError> {
    if let Some(reason) = value
        .get(b"failure reason")
        .and_then(Value::as_bytes)
    {
        return Err(TrackerError::Failure(
            String::from_utf8_lossy(reason).into_owned(),
        ));
    }

    let interval = value
        .get(b"interval")
        .and_then(Value::as_int)
        .map(|secs| Duration::from_secs(secs.max(0) as u64))
        .unwrap_or(DEFAULT_INTERVAL);
    let complete =
        value.get(b"complete").and_then(Value::as_int).map(|n| n as u32);
    let incomplete = value
        .get(b"incomplete")
        .and_then(Value::as_int)
        .map(|n| n as u32);

    let peers_value =
        value.get(b"peers").ok_or(TrackerError::MissingPeers)?;
    let peers = match peers_value {
        Value::Bytes(bytes) => parse_compact_peers(bytes)?,
        Value::List(_) => return Err(TrackerError::DictPeers),
        _ => return Err(TrackerError::MissingPeers),
    };

    Ok(Response {
        interval,
        complete,
        incomplete,
        peers,
    })
}

/// Splits the `peers` byte string into 6-byte (4-byte IPv4, 2-byte port)
/// groups, per spec §4.1 / §8 S2.
fn parse_compact_peers(
    bytes: &[u8],
) -> Result<Vec<SocketAddr>, TrackerError> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::MalformedCompactPeers(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    // S2: compact peers.
    #[test]
    fn test_parse_compact_peers() {
        let bytes: &[u8] =
            b"\x7f\x00\x00\x01\x1a\xe1\xc0\xa8\x00\x02\x1a\xe9";
        let peers = parse_compact_peers(bytes).unwrap();
        assert_eq!(
            peers,
            vec![
                SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::new(127, 0, 0, 1),
                    6881
                )),
                SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::new(192, 168, 0, 2),
                    6889
                )),
            ]
        );
    }

    #[test]
    fn test_malformed_compact_peers_length_rejected() {
        assert!(matches!(
            parse_compact_peers(&[1, 2, 3]),
            Err(TrackerError::MalformedCompactPeers(3))
        ));
    }

    #[test]
    fn test_dict_peers_rejected() {
        let mut root = std::collections::BTreeMap::new();
        root.insert(b"peers".to_vec(), Value::List(vec![]));
        root.insert(b"interval".to_vec(), Value::Int(1800));
        let value = Value::Dict(root);
        assert!(matches!(
            parse_response(&value),
            Err(TrackerError::DictPeers)
        ));
    }

    #[test]
    fn test_failure_reason_is_surfaced() {
        let mut root = std::collections::BTreeMap::new();
        root.insert(b"failure reason".to_vec(), Value::from("nope"));
        let value = Value::Dict(root);
        assert!(matches!(
            parse_response(&value),
            Err(TrackerError::Failure(_))
        ));
    }

    #[test]
    fn test_default_interval_when_absent() {
        let mut root = std::collections::BTreeMap::new();
        root.insert(
            b"peers".to_vec(),
            Value::Bytes(vec![127, 0, 0, 1, 0, 80]),
        );
        let value = Value::Dict(root);
        let response = parse_response(&value).unwrap();
        assert_eq!(response.interval, DEFAULT_INTERVAL);
    }

    #[test]
    fn test_build_url_includes_started_event_only_when_requested() {
        let tracker = Tracker::new("http://tracker.example/announce".into());
        let req = Announce {
            info_hash: [1u8; 20],
            peer_id: [2u8; 20],
            port: 6889,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: Some(Event::Started),
        };
        let url = tracker.build_url(&req);
        assert!(url.contains("event=started"));
        assert!(url.contains("left=100"));

        let req_no_event = Announce {
            event: None,
            ..req
        };
        let url = tracker.build_url(&req_no_event);
        assert!(!url.contains("event="));
    }
}
