use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::PeerError;
use crate::constants::{MAX_FRAME_LEN, PROTOCOL_STRING, RESERVED_BYTES};

/// Length of the handshake prefix: pstrlen, protocol string, reserved.
pub const HANDSHAKE_PREFIX_LEN: usize = 28;

/// Length of the handshake tail: info hash and peer id.
pub const HANDSHAKE_TAIL_LEN: usize = 40;

/// Message type identifiers in the peer wire protocol.
///
/// Each message except keepalive has a one-byte ID after the length
/// prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            _ => Err(PeerError::InvalidMessageId(value)),
        }
    }
}

/// A peer wire protocol message.
///
/// Framing is a 4-byte big-endian length, a 1-byte message ID (absent
/// for keepalive, which has length 0), then the payload. All integers
/// are big-endian 32-bit.
///
/// # Examples
///
/// ```
/// use torpak::peer::Message;
///
/// let request = Message::Request { index: 0, begin: 0, length: 16384 };
/// let bytes = request.encode();
/// assert_eq!(bytes.len(), 17); // 4 length + 1 id + 12 payload
/// assert_eq!(Message::decode(bytes).unwrap(), request);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// Encodes the message including its length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
        }

        buf.freeze()
    }

    /// Decodes one framed message, validating the payload length against
    /// the message ID.
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::InvalidMessage("truncated frame".into()));
        }

        let length = data.get_u32() as usize;
        if length > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLarge(length));
        }
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if data.remaining() != length {
            return Err(PeerError::InvalidMessage("frame length mismatch".into()));
        }

        let id = MessageId::try_from(data.get_u8())?;
        let payload_len = length - 1;

        // Every fixed-size message must match its declared payload exactly.
        let expected = match id {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => Some(0),
            MessageId::Have => Some(4),
            MessageId::Request | MessageId::Cancel => Some(12),
            MessageId::Bitfield => None,
            MessageId::Piece => {
                if payload_len < 8 {
                    return Err(PeerError::InvalidMessage("piece too short".into()));
                }
                None
            }
        };
        if let Some(expected) = expected {
            if payload_len != expected {
                return Err(PeerError::InvalidMessage(format!(
                    "payload length {payload_len} for message id {}",
                    id as u8
                )));
            }
        }

        match id {
            MessageId::Choke => Ok(Message::Choke),
            MessageId::Unchoke => Ok(Message::Unchoke),
            MessageId::Interested => Ok(Message::Interested),
            MessageId::NotInterested => Ok(Message::NotInterested),
            MessageId::Have => Ok(Message::Have {
                piece: data.get_u32(),
            }),
            MessageId::Bitfield => Ok(Message::Bitfield(data.copy_to_bytes(payload_len))),
            MessageId::Request => Ok(Message::Request {
                index: data.get_u32(),
                begin: data.get_u32(),
                length: data.get_u32(),
            }),
            MessageId::Piece => {
                let index = data.get_u32();
                let begin = data.get_u32();
                Ok(Message::Piece {
                    index,
                    begin,
                    data: data.copy_to_bytes(payload_len - 8),
                })
            }
            MessageId::Cancel => Ok(Message::Cancel {
                index: data.get_u32(),
                begin: data.get_u32(),
                length: data.get_u32(),
            }),
        }
    }
}

/// The fixed 28-byte handshake prefix: pstrlen, protocol string, and
/// reserved bytes. Sent first by both sides; the incoming side holds
/// back its tail until the info hash is recognized.
pub fn handshake_prefix() -> Bytes {
    let mut buf = BytesMut::with_capacity(HANDSHAKE_PREFIX_LEN);
    buf.put_u8(PROTOCOL_STRING.len() as u8);
    buf.put_slice(PROTOCOL_STRING);
    buf.put_slice(&RESERVED_BYTES);
    buf.freeze()
}

/// The 40-byte handshake tail: info hash then peer id.
pub fn handshake_tail(info_hash: &[u8; 20], peer_id: &[u8; 20]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HANDSHAKE_TAIL_LEN);
    buf.put_slice(info_hash);
    buf.put_slice(peer_id);
    buf.freeze()
}
