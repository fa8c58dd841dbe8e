//! SMPTE KLV metadata over RTP per [RFC
//! 6597](https://datatracker.ietf.org/doc/html/rfc6597). A KLV unit starts
//! with the SMPTE Universal Label key and is delimited by the marker bit;
//! the BER length after the key lets the receiver finish early on an
//! exact size match.

use bytes::{Bytes, BytesMut};
use log::debug;

use super::{
    DepacketizeError, DepacketizeResult, Depacketized, PacketizeError, PacketizerCore, SeqTracker,
};

/// The first four bytes of a SMPTE Universal Label key.
const UL_KEY_PREFIX: [u8; 4] = [0x06, 0x0e, 0x2b, 0x34];

const MAX_UNIT_SIZE: usize = 16 * 1024 * 1024;

/// Parses the BER length following the 16-byte UL key, returning the
/// total expected unit size (key + length field + value) if the buffered
/// prefix is long enough to tell.
fn expected_unit_size(buf: &[u8]) -> Option<usize> {
    if buf.len() < 17 {
        return None;
    }
    let b = buf[16];
    if b & 0x80 == 0 {
        return Some(17 + usize::from(b));
    }
    let n = usize::from(b & 0x7f);
    if n == 0 || n > 8 || buf.len() < 17 + n {
        return None;
    }
    let mut len = 0usize;
    for &d in &buf[17..17 + n] {
        len = len.checked_mul(256)?.checked_add(usize::from(d))?;
    }
    Some(17 + n + len)
}

#[derive(Debug)]
pub struct Depacketizer {
    seq: SeqTracker,
    unit: Option<BytesMut>,
    started: bool,
}

impl Depacketizer {
    pub fn new() -> Self {
        Depacketizer {
            seq: SeqTracker::new(),
            unit: None,
            started: false,
        }
    }

    pub fn depacketize(&mut self, pkt: &crate::rtp::Packet) -> DepacketizeResult {
        let gap = self.seq.note(pkt.sequence_number);
        if gap > 0 && self.unit.is_some() {
            debug!("lost {} packets; dropping partial KLV unit", gap);
            self.unit = None;
        }
        if pkt.payload.is_empty() {
            return Err(DepacketizeError::InvalidPayload("empty payload".to_owned()));
        }
        let buf = match &mut self.unit {
            Some(buf) => {
                if buf.len() + pkt.payload.len() > MAX_UNIT_SIZE {
                    let size = buf.len() + pkt.payload.len();
                    self.unit = None;
                    return Err(DepacketizeError::OversizeUnit {
                        size,
                        limit: MAX_UNIT_SIZE,
                    });
                }
                buf.extend_from_slice(&pkt.payload);
                buf
            }
            None => {
                if pkt.payload.len() < 4 || pkt.payload[..4] != UL_KEY_PREFIX {
                    if !self.started {
                        return Ok(Depacketized::NonStartingPacketAndNoPrevious);
                    }
                    if gap > 0 {
                        return Err(DepacketizeError::PacketLoss { gap });
                    }
                    return Err(DepacketizeError::InvalidPayload(
                        "unit doesn't start with a Universal Label key".to_owned(),
                    ));
                }
                self.started = true;
                self.unit.get_or_insert_with(|| BytesMut::from(&pkt.payload[..]))
            }
        };

        // Exact BER size match completes the unit even without the marker;
        // some muxers only mark the final unit of a burst.
        let complete = pkt.mark || expected_unit_size(buf) == Some(buf.len());
        if complete {
            let unit = self.unit.take().expect("unit in progress").freeze();
            return Ok(Depacketized::Units(vec![unit]));
        }
        Ok(Depacketized::MorePacketsNeeded)
    }
}

impl Default for Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Fragments one KLV unit per call; the marker goes on the final packet.
#[derive(Debug)]
pub struct Packetizer {
    pub(crate) core: PacketizerCore,
}

impl Packetizer {
    pub fn new(
        payload_type: u8,
        ssrc: Option<u32>,
        initial_seq: Option<u16>,
        payload_max_size: Option<usize>,
    ) -> Self {
        Packetizer {
            core: PacketizerCore::new(payload_type, ssrc, initial_seq, payload_max_size),
        }
    }

    pub fn packetize(
        &mut self,
        units: &[Bytes],
        timestamp: u32,
    ) -> Result<Vec<crate::rtp::Packet>, PacketizeError> {
        if units.is_empty() {
            return Err(PacketizeError::InvalidInput("no KLV units".to_owned()));
        }
        let max = self.core.payload_max_size();
        let mut out = Vec::new();
        for unit in units {
            if unit.len() < 4 || unit[..4] != UL_KEY_PREFIX {
                return Err(PacketizeError::InvalidInput(
                    "unit doesn't start with a Universal Label key".to_owned(),
                ));
            }
            let chunks: Vec<&[u8]> = unit.chunks(max).collect();
            let last = chunks.len() - 1;
            for (i, c) in chunks.into_iter().enumerate() {
                out.push(self.core.packet(timestamp, i == last, Bytes::copy_from_slice(c)));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn klv_unit(value_len: usize) -> Bytes {
        let mut unit = BytesMut::new();
        unit.extend_from_slice(&UL_KEY_PREFIX);
        unit.extend_from_slice(&[0x02, 0x0b, 0x01, 0x01, 0x0e, 0x01, 0x03, 0x01, 0x01, 0x00, 0x00, 0x00]);
        if value_len < 0x80 {
            unit.extend_from_slice(&[value_len as u8]);
        } else {
            unit.extend_from_slice(&[0x82, (value_len >> 8) as u8, value_len as u8]);
        }
        unit.extend((0..value_len).map(|i| i as u8));
        unit.freeze()
    }

    #[test]
    fn single_packet_round_trip() {
        let mut p = Packetizer::new(97, None, Some(0), None);
        let unit = klv_unit(100);
        let pkts = p.packetize(&[unit.clone()], 0).unwrap();
        assert_eq!(pkts.len(), 1);
        assert!(pkts[0].mark);

        let mut d = Depacketizer::new();
        assert_eq!(
            d.depacketize(&pkts[0]).unwrap(),
            Depacketized::Units(vec![unit])
        );
    }

    #[test]
    fn fragmented_round_trip() {
        let mut p = Packetizer::new(97, None, Some(0), Some(64));
        let unit = klv_unit(400);
        let pkts = p.packetize(&[unit.clone()], 0).unwrap();
        assert!(pkts.len() > 1);

        let mut d = Depacketizer::new();
        for pkt in &pkts[..pkts.len() - 1] {
            assert_eq!(d.depacketize(pkt).unwrap(), Depacketized::MorePacketsNeeded);
        }
        assert_eq!(
            d.depacketize(pkts.last().unwrap()).unwrap(),
            Depacketized::Units(vec![unit])
        );
    }

    #[test]
    fn ber_length_short_circuits_missing_marker() {
        // Complete unit in one packet but without the marker bit.
        let unit = klv_unit(10);
        let pkt = crate::rtp::Packet {
            payload_type: 97,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            mark: false,
            payload: unit.clone(),
        };
        let mut d = Depacketizer::new();
        assert_eq!(
            d.depacketize(&pkt).unwrap(),
            Depacketized::Units(vec![unit])
        );
    }

    #[test]
    fn mid_stream_join_is_benign() {
        let mut d = Depacketizer::new();
        let pkt = crate::rtp::Packet {
            payload_type: 97,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            mark: false,
            payload: Bytes::from_static(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee]),
        };
        assert_eq!(
            d.depacketize(&pkt).unwrap(),
            Depacketized::NonStartingPacketAndNoPrevious
        );
    }
}
