//! MPEG transport stream over RTP per [RFC 2250 section
//! 2](https://datatracker.ietf.org/doc/html/rfc2250#section-2): payloads
//! are whole 188-byte TS packets, and nothing else.

use bytes::Bytes;

use super::{
    DepacketizeError, DepacketizeResult, Depacketized, PacketizeError, PacketizerCore, SeqTracker,
};

pub const TS_PACKET_SIZE: usize = 188;

#[derive(Debug)]
pub struct Depacketizer {
    seq: SeqTracker,
}

impl Depacketizer {
    pub fn new() -> Self {
        Depacketizer {
            seq: SeqTracker::new(),
        }
    }

    pub fn depacketize(&mut self, pkt: &crate::rtp::Packet) -> DepacketizeResult {
        self.seq.note(pkt.sequence_number);
        if pkt.payload.is_empty() || pkt.payload.len() % TS_PACKET_SIZE != 0 {
            return Err(DepacketizeError::InvalidPayload(format!(
                "payload of {} bytes is not a multiple of {}",
                pkt.payload.len(),
                TS_PACKET_SIZE
            )));
        }
        let units = (0..pkt.payload.len() / TS_PACKET_SIZE)
            .map(|i| pkt.payload.slice(i * TS_PACKET_SIZE..(i + 1) * TS_PACKET_SIZE))
            .collect();
        Ok(Depacketized::Units(units))
    }
}

impl Default for Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Packs TS packets with the payload budget rounded down to a multiple of
/// 188; the marker goes on the last packet of each call.
#[derive(Debug)]
pub struct Packetizer {
    pub(crate) core: PacketizerCore,
}

impl Packetizer {
    pub fn new(
        ssrc: Option<u32>,
        initial_seq: Option<u16>,
        payload_max_size: Option<usize>,
    ) -> Self {
        // MP2T has static payload type 33.
        Packetizer {
            core: PacketizerCore::new(33, ssrc, initial_seq, payload_max_size),
        }
    }

    pub fn packetize(
        &mut self,
        units: &[Bytes],
        timestamp: u32,
    ) -> Result<Vec<crate::rtp::Packet>, PacketizeError> {
        let chunk_size = (self.core.payload_max_size() / TS_PACKET_SIZE) * TS_PACKET_SIZE;
        if chunk_size == 0 {
            return Err(PacketizeError::InvalidInput(
                "payload_max_size below one TS packet".to_owned(),
            ));
        }
        let total: usize = units.iter().map(|u| u.len()).sum();
        if total == 0 || units.iter().any(|u| u.len() % TS_PACKET_SIZE != 0) {
            return Err(PacketizeError::InvalidInput(
                "input must be whole 188-byte TS packets".to_owned(),
            ));
        }
        // Flatten, then slice; TS packets from separate units may share an
        // RTP packet.
        let mut all = Vec::with_capacity(total);
        for u in units {
            all.extend_from_slice(u);
        }
        let chunks: Vec<&[u8]> = all.chunks(chunk_size).collect();
        let last = chunks.len() - 1;
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, c)| self.core.packet(timestamp, i == last, Bytes::copy_from_slice(c)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eight_ts_packets_in_two_rtp_packets() {
        // payload_max_size 1316 = 7 * 188: 8 TS packets need exactly 2
        // RTP packets with consecutive sequence numbers.
        let mut p = Packetizer::new(None, Some(41), Some(1316));
        let input: Bytes = (0..8 * TS_PACKET_SIZE).map(|i| i as u8).collect();
        let pkts = p.packetize(&[input.clone()], 90_000).unwrap();
        assert_eq!(pkts.len(), 2);
        assert_eq!(pkts[0].sequence_number, 41);
        assert_eq!(pkts[1].sequence_number, 42);
        assert_eq!(pkts[0].payload.len(), 7 * TS_PACKET_SIZE);
        assert_eq!(pkts[1].payload.len(), TS_PACKET_SIZE);
        assert!(!pkts[0].mark);
        assert!(pkts[1].mark);

        let mut reassembled = Vec::new();
        let mut d = Depacketizer::new();
        for pkt in &pkts {
            assert_eq!(pkt.payload.len() % TS_PACKET_SIZE, 0);
            match d.depacketize(pkt).unwrap() {
                Depacketized::Units(units) => {
                    for u in units {
                        reassembled.extend_from_slice(&u);
                    }
                }
                o => panic!("unexpected {:?}", o),
            }
        }
        assert_eq!(&reassembled[..], &input[..]);
    }

    #[test]
    fn rejects_partial_ts_packet() {
        let mut d = Depacketizer::new();
        let pkt = crate::rtp::Packet {
            payload_type: 33,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            mark: true,
            payload: Bytes::from(vec![0u8; 200]),
        };
        assert!(matches!(
            d.depacketize(&pkt),
            Err(DepacketizeError::InvalidPayload(_))
        ));
    }
}
