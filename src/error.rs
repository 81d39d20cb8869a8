//! Error types shared across the download core.
//!
//! The five kinds below map directly onto the error handling policy: a
//! [`MetainfoError`] or [`StorageError`] aborts the whole client, a
//! [`TrackerError`] is logged and retried on the next announce tick, and a
//! [`ProtocolError`]/[`TransportError`] only drops the one peer connection
//! that raised it. Hash mismatches are not surfaced as errors at all — they
//! are handled internally by resetting the offending piece.

use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The top-level error type for the download core.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Metainfo(#[from] MetainfoError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The torrent file does not bdecode, or is missing required fields. Fatal
/// to startup.
#[derive(thiserror::Error, Debug)]
pub enum MetainfoError {
    #[error("torrent file is not valid bencode: {0}")]
    InvalidBencode(#[from] crate::bencode::DecodeError),
    #[error("metainfo is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("metainfo field `{0}` has the wrong type")]
    InvalidFieldType(&'static str),
    #[error(
        "`pieces` length {0} is not a multiple of 20 (a SHA-1 digest)"
    )]
    MalformedPieces(usize),
    #[error(
        "torrent has no pieces, or piece/total size invariant does not hold"
    )]
    InvalidSizeInvariant,
    #[error("multi-file torrents are not supported by this core")]
    MultiFileUnsupported,
}

/// Non-200 HTTP, decode failure, explicit `failure reason`, or an
/// unsupported dictionary-form peer list. Logged by the coordinator and
/// retried on the next announce tick.
#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    #[error("tracker request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("tracker returned HTTP status {0}")]
    BadStatus(reqwest::StatusCode),
    #[error("tracker response is not valid bencode: {0}")]
    InvalidBencode(#[from] crate::bencode::DecodeError),
    #[error("tracker reported failure: {0}")]
    Failure(String),
    #[error("tracker returned a dictionary-form peer list, which is not supported")]
    DictPeers,
    #[error("tracker response is missing the `peers` field")]
    MissingPeers,
    #[error("compact peers field length {0} is not a multiple of 6")]
    MalformedCompactPeers(usize),
}

/// An invalid handshake, an `info_hash` mismatch, or a malformed frame.
/// Drops only the offending peer connection.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("peer sent a handshake with an unexpected protocol string")]
    InvalidProtocolString,
    #[error("peer sent a handshake with a mismatched info_hash")]
    InfoHashMismatch,
    #[error("peer sent a malformed frame: {0}")]
    MalformedFrame(String),
}

/// Connection refused/reset/closed/timeout. Drops only the offending peer
/// connection.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("peer connection error: {0}")]
    Io(#[from] io::Error),
}

/// File open/write/seek failure. Fatal: aborts the download.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("failed to open output file: {0}")]
    Open(io::Error),
    #[error("failed to seek output file: {0}")]
    Seek(io::Error),
    #[error("failed to write output file: {0}")]
    Write(io::Error),
}
