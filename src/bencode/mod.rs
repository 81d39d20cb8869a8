//! A small bencode codec operating directly on byte slices.
//!
//! This is deliberately hand-rolled rather than built on `serde_bencode`:
//! the metainfo parser needs the *verbatim* byte range of the `info`
//! sub-dictionary to compute `info_hash` (see [`decoder::span_of_dict_value`]),
//! and a decode-then-reencode round trip through a `serde` value is not
//! guaranteed to reproduce a non-canonical producer's original bytes.

mod decoder;
mod encoder;
mod value;

pub use decoder::{decode, decode_with_span, span_of_dict_value, DecodeError};
pub use encoder::encode;
pub use value::Value;
