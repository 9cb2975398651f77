//! C2: packet codec. Big-endian, resumable, does not interpret status codes
//! (spec §4.2) — that is the Dispatcher's job.

use bytes::Bytes;
use zerocopy::byteorder::big_endian::{U16 as U16BE, U32 as U32BE, U64 as U64BE};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 24;

/// Default frame size cap (spec §3 "Packet").
pub const DEFAULT_MAX_FRAME_LEN: usize = 20 * 1024 * 1024;

/// The 24-byte wire header, big-endian throughout (spec §6).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct PacketHeader {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: U16BE,
    pub extras_len: u8,
    pub data_type: u8,
    pub vbucket_or_status: U16BE,
    pub total_body_len: U32BE,
    pub opaque: U32BE,
    pub cas: U64BE,
}

/// A fully decoded packet. `opcode` and `vbucket_or_status` are kept as raw
/// wire values — the codec itself does not interpret them (spec §4.2); the
/// Dispatcher (C7) is responsible for mapping `vbucket_or_status` to either
/// a vbucket id (on requests) or a `Status` (on responses).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: u8,
    pub opcode: u8,
    pub data_type: u8,
    pub vbucket_or_status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Packet {
    pub fn key_len(&self) -> usize {
        self.key.len()
    }

    pub fn extras_len(&self) -> usize {
        self.extras.len()
    }

    pub fn body_len(&self) -> usize {
        self.extras.len() + self.key.len() + self.value.len()
    }
}

/// Encodes `packet` into a freshly allocated frame.
pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
    let body_len = packet.body_len();
    #[allow(clippy::cast_possible_truncation)]
    let header = PacketHeader {
        magic: packet.magic,
        opcode: packet.opcode,
        key_len: U16BE::new(packet.key_len() as u16),
        extras_len: packet.extras_len() as u8,
        data_type: packet.data_type,
        vbucket_or_status: U16BE::new(packet.vbucket_or_status),
        total_body_len: U32BE::new(body_len as u32),
        opaque: U32BE::new(packet.opaque),
        cas: U64BE::new(packet.cas),
    };

    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&packet.extras);
    out.extend_from_slice(&packet.key);
    out.extend_from_slice(&packet.value);
    Ok(out)
}

/// Resumable decode: returns `Ok(None)` ("need more") without consuming
/// `data` when the header or body is not fully available yet. Returns
/// `Err(FrameTooLarge)` if the declared body length exceeds `max_frame_len`.
pub fn decode(data: &[u8], max_frame_len: usize) -> Result<Option<(Packet, usize)>> {
    if data.len() < HEADER_LEN {
        return Ok(None);
    }

    let header = PacketHeader::ref_from_bytes(&data[..HEADER_LEN])
        .map_err(|_| Error::ProtocolViolation("malformed packet header".into()))?;

    let body_len = header.total_body_len.get() as usize;
    if body_len > max_frame_len {
        return Err(Error::FrameTooLarge {
            size: body_len,
            max: max_frame_len,
        });
    }

    let frame_len = HEADER_LEN + body_len;
    if data.len() < frame_len {
        return Ok(None);
    }

    let key_len = header.key_len.get() as usize;
    let extras_len = header.extras_len as usize;
    if key_len + extras_len > body_len {
        return Err(Error::ProtocolViolation(
            "key_len + extras_len exceeds total_body_len".into(),
        ));
    }

    let magic = header.magic;
    let opcode = header.opcode;
    let data_type = header.data_type;
    let vbucket_or_status = header.vbucket_or_status.get();
    let opaque = header.opaque.get();
    let cas = header.cas.get();

    let body = &data[HEADER_LEN..frame_len];
    let extras = Bytes::copy_from_slice(&body[..extras_len]);
    let key = Bytes::copy_from_slice(&body[extras_len..extras_len + key_len]);
    let value = Bytes::copy_from_slice(&body[extras_len + key_len..]);

    let packet = Packet {
        magic,
        opcode,
        data_type,
        vbucket_or_status,
        opaque,
        cas,
        extras,
        key,
        value,
    };

    Ok(Some((packet, frame_len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        Packet {
            magic: crate::protocol::Magic::Request as u8,
            opcode: crate::protocol::Opcode::Get as u8,
            data_type: 0,
            vbucket_or_status: 12,
            opaque: 7,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::from_static(b"k"),
            value: Bytes::new(),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let packet = sample_packet();
        let bytes = encode(&packet).unwrap();
        let (decoded, consumed) = decode(&bytes, DEFAULT_MAX_FRAME_LEN).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, packet);
    }

    #[test]
    fn short_header_needs_more() {
        let packet = sample_packet();
        let bytes = encode(&packet).unwrap();
        for n in 0..HEADER_LEN {
            assert_eq!(decode(&bytes[..n], DEFAULT_MAX_FRAME_LEN).unwrap(), None);
        }
    }

    #[test]
    fn short_body_needs_more_without_consuming() {
        let packet = sample_packet();
        let bytes = encode(&packet).unwrap();
        let short = &bytes[..bytes.len() - 1];
        assert_eq!(decode(short, DEFAULT_MAX_FRAME_LEN).unwrap(), None);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let packet = sample_packet();
        let bytes = encode(&packet).unwrap();
        let err = decode(&bytes, 0).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }

    proptest::proptest! {
        #[test]
        fn prop_round_trip(key in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..32),
                            value in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..64),
                            opaque: u32, cas: u64, status: u16) {
            let packet = Packet {
                magic: crate::protocol::Magic::Response as u8,
                opcode: 0,
                data_type: 0,
                vbucket_or_status: status,
                opaque,
                cas,
                extras: Bytes::new(),
                key: Bytes::from(key),
                value: Bytes::from(value),
            };
            let bytes = encode(&packet).unwrap();
            let (decoded, consumed) = decode(&bytes, DEFAULT_MAX_FRAME_LEN).unwrap().unwrap();
            proptest::prop_assert_eq!(consumed, bytes.len());
            proptest::prop_assert_eq!(decoded, packet);
        }

        #[test]
        fn prop_prefix_never_consumes(key in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..32)) {
            let packet = Packet {
                magic: crate::protocol::Magic::Request as u8,
                opcode: 0,
                data_type: 0,
                vbucket_or_status: 0,
                opaque: 0,
                cas: 0,
                extras: Bytes::new(),
                key: Bytes::from(key),
                value: Bytes::new(),
            };
            let bytes = encode(&packet).unwrap();
            for n in 0..bytes.len() {
                proptest::prop_assert_eq!(decode(&bytes[..n], DEFAULT_MAX_FRAME_LEN).unwrap(), None);
            }
        }
    }
}
