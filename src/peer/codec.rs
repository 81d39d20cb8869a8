//! Wire codecs for the two framings a peer connection goes through: the
//! fixed 68-byte handshake, and the length-prefixed message stream that
//! follows it.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::piece::BlockInfo;
use crate::{Bitfield, PeerId, Sha1Hash};

use super::message::{Message, MessageId};

pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

const HANDSHAKE_LEN: usize = 68;

/// The BitTorrent handshake: 1 byte protocol string length, the protocol
/// string itself, 8 reserved bytes, `info_hash`, `peer_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0u8; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Frames exactly one [`Handshake`] in each direction; used only for the
/// very first exchange on a connection, then handed off to [`PeerCodec`].
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = ProtocolError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Handshake>, ProtocolError> {
        if src.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let prot_len = src[0];
        if prot_len as usize != 19 {
            return Err(ProtocolError::InvalidProtocolString);
        }
        if &src[1..20] != PROTOCOL_STRING.as_bytes() {
            return Err(ProtocolError::InvalidProtocolString);
        }

        let mut buf = src.split_to(HANDSHAKE_LEN);
        buf.advance(20);
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[..8]);
        buf.advance(8);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[..20]);
        buf.advance(20);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[..20]);

        let mut prot = [0u8; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = ProtocolError;

    fn encode(
        &mut self,
        handshake: Handshake,
        dst: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(19);
        dst.put_slice(&handshake.prot);
        dst.put_slice(&handshake.reserved);
        dst.put_slice(&handshake.info_hash);
        dst.put_slice(&handshake.peer_id);
        Ok(())
    }
}

/// Frames the post-handshake message stream: `<4-byte big-endian
/// length><payload>`, a length of 0 meaning `KeepAlive`.
pub struct PeerCodec;

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Message>, ProtocolError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut payload = src.split_to(len);
        let id = payload[0];
        payload.advance(1);

        let msg = match MessageId::from_u8(id) {
            Some(MessageId::Choke) => Message::Choke,
            Some(MessageId::Unchoke) => Message::Unchoke,
            Some(MessageId::Interested) => Message::Interested,
            Some(MessageId::NotInterested) => Message::NotInterested,
            Some(MessageId::Have) => {
                if payload.len() != 4 {
                    return Err(ProtocolError::MalformedFrame(
                        "Have payload must be 4 bytes".into(),
                    ));
                }
                let index = u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]);
                Message::Have(index as usize)
            }
            Some(MessageId::Bitfield) => {
                let bitfield = Bitfield::from_vec(payload.to_vec());
                Message::Bitfield(bitfield)
            }
            Some(MessageId::Request) => {
                Message::Request(parse_block_info(&payload)?)
            }
            Some(MessageId::Piece) => {
                if payload.len() < 8 {
                    return Err(ProtocolError::MalformedFrame(
                        "Piece payload too short".into(),
                    ));
                }
                let index = u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]) as usize;
                let offset = u32::from_be_bytes([
                    payload[4], payload[5], payload[6], payload[7],
                ]);
                let data = payload[8..].to_vec();
                Message::Piece {
                    index,
                    offset,
                    data,
                }
            }
            Some(MessageId::Cancel) => {
                Message::Cancel(parse_block_info(&payload)?)
            }
            None => {
                log::warn!("Unknown peer message id {}, discarding", id);
                return self.decode(src);
            }
        };

        Ok(Some(msg))
    }
}

fn parse_block_info(payload: &[u8]) -> Result<BlockInfo, ProtocolError> {
    if payload.len() != 12 {
        return Err(ProtocolError::MalformedFrame(
            "Request/Cancel payload must be 12 bytes".into(),
        ));
    }
    let index =
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let offset =
        u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let len =
        u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
    Ok(BlockInfo::new(index as usize, offset, len))
}

impl Encoder<Message> for PeerCodec {
    type Error = ProtocolError;

    fn encode(
        &mut self,
        msg: Message,
        dst: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        match msg {
            Message::KeepAlive => {
                dst.put_u32(0);
            }
            Message::Choke => put_id_only(dst, MessageId::Choke),
            Message::Unchoke => put_id_only(dst, MessageId::Unchoke),
            Message::Interested => put_id_only(dst, MessageId::Interested),
            Message::NotInterested => {
                put_id_only(dst, MessageId::NotInterested)
            }
            Message::Have(index) => {
                dst.put_u32(5);
                dst.put_u8(MessageId::Have as u8);
                dst.put_u32(index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.put_slice(&bytes);
            }
            Message::Request(info) => put_block_info(
                dst,
                MessageId::Request,
                info.piece_index as u32,
                info.offset,
                info.len,
            ),
            Message::Piece {
                index,
                offset,
                data,
            } => {
                dst.put_u32(9 + data.len() as u32);
                dst.put_u8(MessageId::Piece as u8);
                dst.put_u32(index as u32);
                dst.put_u32(offset);
                dst.put_slice(&data);
            }
            Message::Cancel(info) => put_block_info(
                dst,
                MessageId::Cancel,
                info.piece_index as u32,
                info.offset,
                info.len,
            ),
        }
        Ok(())
    }
}

fn put_id_only(dst: &mut BytesMut, id: MessageId) {
    dst.put_u32(1);
    dst.put_u8(id as u8);
}

fn put_block_info(
    dst: &mut BytesMut,
    id: MessageId,
    index: u32,
    offset: u32,
    len: u32,
) {
    dst.put_u32(13);
    dst.put_u8(id as u8);
    dst.put_u32(index);
    dst.put_u32(offset);
    dst.put_u32(len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn test_keep_alive_roundtrip() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &0u32.to_be_bytes()[..]);
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }

    #[test]
    fn test_request_message_roundtrip() {
        let msg = Message::Request(BlockInfo::new(3, 16384, 16384));
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_partial_frame_returns_none_until_complete() {
        let msg = Message::Have(7);
        let mut full = BytesMut::new();
        PeerCodec.encode(msg.clone(), &mut full).unwrap();

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&full[..3]);
        assert_eq!(PeerCodec.decode(&mut partial).unwrap(), None);

        partial.extend_from_slice(&full[3..]);
        assert_eq!(PeerCodec.decode(&mut partial).unwrap(), Some(msg));
    }

    #[test]
    fn test_bitfield_message_roundtrip() {
        let mut bitfield = Bitfield::from_vec(vec![0b1100_0001]);
        bitfield.truncate(8);
        let msg = Message::Bitfield(bitfield.clone());
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Bitfield(bitfield));
    }
}
