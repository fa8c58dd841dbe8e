//! The one-frame-per-packet audio family: G.711 (PCMA/PCMU), G.722,
//! G.723.1, G.726, Opus, Speex, AC-3, and Vorbis all ship whole frames in
//! single RTP packets with the marker set
//! ([RFC 3551 section 4.5](https://datatracker.ietf.org/doc/html/rfc3551#section-4.5)
//! and the per-codec RFCs).

use bytes::Bytes;
use pretty_hex::PrettyHex;

use super::{
    DepacketizeError, DepacketizeResult, Depacketized, PacketizeError, PacketizerCore, SeqTracker,
};

/// Extra per-packet validation some codecs define.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Validation {
    None,
    /// G.723.1: the two header bits must match the payload size
    /// (24 bytes for 6.3 kbit/s, 20 for 5.3, 4 for SID).
    G723,
}

fn validate(validation: Validation, payload: &[u8]) -> bool {
    match validation {
        Validation::None => !payload.is_empty(),
        Validation::G723 => {
            let expected_hdr_bits = match payload.len() {
                24 => 0b00,
                20 => 0b01,
                4 => 0b10,
                _ => return false,
            };
            payload[0] & 0b11 == expected_hdr_bits
        }
    }
}

#[derive(Debug)]
pub struct Depacketizer {
    seq: SeqTracker,
    validation: Validation,
}

impl Depacketizer {
    pub fn new(validation: Validation) -> Self {
        Depacketizer {
            seq: SeqTracker::new(),
            validation,
        }
    }

    pub fn depacketize(&mut self, pkt: &crate::rtp::Packet) -> DepacketizeResult {
        self.seq.note(pkt.sequence_number);
        if !validate(self.validation, &pkt.payload) {
            return Err(DepacketizeError::InvalidPayload(format!(
                "invalid audio frame: {:?}",
                pkt.payload.hex_dump()
            )));
        }
        Ok(Depacketized::Units(vec![pkt.payload.clone()]))
    }
}

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
            return Err(PacketizeError::InvalidInput("no frames".to_owned()));
        }
        let max = self.core.payload_max_size();
        units
            .iter()
            .map(|frame| {
                if frame.is_empty() {
                    return Err(PacketizeError::InvalidInput("empty frame".to_owned()));
                }
                if frame.len() > max {
                    return Err(PacketizeError::OversizeUnit {
                        size: frame.len(),
                        limit: max,
                    });
                }
                Ok(self.core.packet(timestamp, true, frame.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_per_packet() {
        let mut p = Packetizer::new(0, None, Some(7), None);
        let frame: Bytes = std::iter::repeat(0x55).take(160).collect();
        let pkts = p.packetize(&[frame.clone()], 0).unwrap();
        assert_eq!(pkts.len(), 1);
        assert!(pkts[0].mark);
        assert_eq!(pkts[0].sequence_number, 7);

        let mut d = Depacketizer::new(Validation::None);
        assert_eq!(
            d.depacketize(&pkts[0]).unwrap(),
            Depacketized::Units(vec![frame])
        );
    }

    #[test]
    fn g723_validation() {
        let mut d = Depacketizer::new(Validation::G723);
        let ok = crate::rtp::Packet {
            payload_type: 4,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            mark: true,
            payload: Bytes::from(vec![0u8; 24]),
        };
        assert!(d.depacketize(&ok).is_ok());
        let bad = crate::rtp::Packet {
            payload: Bytes::from(vec![0u8; 21]),
            sequence_number: 1,
            ..ok
        };
        assert!(matches!(
            d.depacketize(&bad),
            Err(DepacketizeError::InvalidPayload(_))
        ));
    }
}
