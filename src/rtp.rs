//! RTP packet parse and serialize; see [RFC 3550 section
//! 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).

use bytes::{BufMut, Bytes, BytesMut};
use pretty_hex::PrettyHex;

use crate::Error;

/// Fixed RTP header length (no CSRCs, no extension).
pub const HEADER_LEN: usize = 12;

/// A parsed RTP packet.
///
/// This is the currency between the transport plane and the codec layer:
/// depacketizers consume one of these per call, packetizers produce them.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub mark: bool,
    pub payload: Bytes,
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("payload_type", &self.payload_type)
            .field("sequence_number", &self.sequence_number)
            .field("timestamp", &self.timestamp)
            .field("ssrc", &self.ssrc)
            .field("mark", &self.mark)
            .field("payload", &self.payload.hex_dump())
            .finish()
    }
}

impl Packet {
    /// Parses a raw datagram or interleaved frame body.
    ///
    /// CSRC entries and header extensions are skipped; padding is removed.
    /// The payload is a zero-copy slice of `data`.
    pub fn parse(data: Bytes) -> Result<Self, Error> {
        let reader = rtp_rs::RtpReader::new(&data[..])
            .map_err(|e| Error::Parse(format!("corrupt RTP header: {:?}", e)))?;
        // rtp-rs wraps the sequence number in its own type; the raw bytes
        // are simpler to work with.
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let payload_type = reader.payload_type();
        let timestamp = reader.timestamp();
        let ssrc = reader.ssrc();
        let mark = reader.mark();
        let range = crate::as_range(&data, reader.payload())
            .ok_or_else(|| Error::Parse("RTP payload out of buffer".to_owned()))?;
        Ok(Packet {
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            mark,
            payload: data.slice(range),
        })
    }

    /// Serializes into a fresh buffer: 12-byte header, no CSRCs/extension.
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(2 << 6); // V=2, P=0, X=0, CC=0
        buf.put_u8((u8::from(self.mark) << 7) | (self.payload_type & 0x7f));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let pkt = Packet {
            payload_type: 96,
            sequence_number: 0x1234,
            timestamp: 0xdead_beef,
            ssrc: 0x4cac_c3d1,
            mark: true,
            payload: Bytes::from_static(&[1, 2, 3, 4]),
        };
        let wire = pkt.marshal();
        assert_eq!(wire.len(), HEADER_LEN + 4);
        let parsed = Packet::parse(wire).unwrap();
        assert_eq!(parsed, pkt);
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(Packet::parse(Bytes::from_static(&[0x80, 0x60, 0x00])).is_err());
    }
}
