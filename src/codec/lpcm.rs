//! Uncompressed audio (L8/L16/L24) per [RFC
//! 3190](https://datatracker.ietf.org/doc/html/rfc3190) and RFC 3551:
//! packets carry whole sample frames, split on
//! `bit_depth * channels / 8` boundaries.

use bytes::Bytes;

use super::{
    DepacketizeError, DepacketizeResult, Depacketized, PacketizeError, PacketizerCore, SeqTracker,
};

/// Bytes per sample frame (all channels of one sampling instant).
fn sample_frame_size(bit_depth: u8, channels: u16) -> usize {
    usize::from(bit_depth) * usize::from(channels) / 8
}

#[derive(Debug)]
pub struct Depacketizer {
    seq: SeqTracker,
    frame_size: usize,
}

impl Depacketizer {
    pub fn new(bit_depth: u8, channels: u16) -> Self {
        Depacketizer {
            seq: SeqTracker::new(),
            frame_size: std::cmp::max(1, sample_frame_size(bit_depth, channels)),
        }
    }

    pub fn depacketize(&mut self, pkt: &crate::rtp::Packet) -> DepacketizeResult {
        self.seq.note(pkt.sequence_number);
        if pkt.payload.is_empty() || pkt.payload.len() % self.frame_size != 0 {
            return Err(DepacketizeError::InvalidPayload(format!(
                "payload of {} bytes is not a multiple of the {}-byte sample frame",
                pkt.payload.len(),
                self.frame_size
            )));
        }
        Ok(Depacketized::Units(vec![pkt.payload.clone()]))
    }
}

/// Splits a sample block into packets of whole sample frames; no residual
/// partial frame is ever emitted.
#[derive(Debug)]
pub struct Packetizer {
    pub(crate) core: PacketizerCore,
    frame_size: usize,
}

impl Packetizer {
    pub fn new(
        payload_type: u8,
        bit_depth: u8,
        channels: u16,
        ssrc: Option<u32>,
        initial_seq: Option<u16>,
        payload_max_size: Option<usize>,
    ) -> Self {
        Packetizer {
            core: PacketizerCore::new(payload_type, ssrc, initial_seq, payload_max_size),
            frame_size: std::cmp::max(1, sample_frame_size(bit_depth, channels)),
        }
    }

    pub fn packetize(
        &mut self,
        units: &[Bytes],
        timestamp: u32,
    ) -> Result<Vec<crate::rtp::Packet>, PacketizeError> {
        let chunk_size = (self.core.payload_max_size() / self.frame_size) * self.frame_size;
        if chunk_size == 0 {
            return Err(PacketizeError::InvalidInput(
                "payload_max_size below one sample frame".to_owned(),
            ));
        }
        let mut out = Vec::new();
        let mut timestamp = timestamp;
        for block in units {
            if block.is_empty() || block.len() % self.frame_size != 0 {
                return Err(PacketizeError::InvalidInput(format!(
                    "block of {} bytes is not a multiple of the {}-byte sample frame",
                    block.len(),
                    self.frame_size
                )));
            }
            let mut off = 0;
            while off < block.len() {
                let len = std::cmp::min(chunk_size, block.len() - off);
                out.push(
                    self.core
                        .packet(timestamp, true, block.slice(off..off + len)),
                );
                timestamp = timestamp.wrapping_add((len / self.frame_size) as u32);
                off += len;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_sample_frames() {
        // 16-bit stereo: 4-byte frames. 10 frames with room for 2 per packet.
        let mut p = Packetizer::new(97, 16, 2, None, Some(0), Some(11));
        let block: Bytes = (0..40u32).map(|i| i as u8).collect();
        let pkts = p.packetize(&[block.clone()], 1000).unwrap();
        assert_eq!(pkts.len(), 5);
        for pkt in &pkts {
            assert_eq!(pkt.payload.len() % 4, 0);
            assert!(pkt.mark);
        }
        // Timestamps advance by the number of frames per packet.
        assert_eq!(pkts[0].timestamp, 1000);
        assert_eq!(pkts[1].timestamp, 1002);

        let mut d = Depacketizer::new(16, 2);
        let mut reassembled = Vec::new();
        for pkt in &pkts {
            match d.depacketize(pkt).unwrap() {
                Depacketized::Units(units) => {
                    for u in units {
                        reassembled.extend_from_slice(&u);
                    }
                }
                o => panic!("unexpected {:?}", o),
            }
        }
        assert_eq!(&reassembled[..], &block[..]);
    }

    #[test]
    fn rejects_partial_frame() {
        let mut d = Depacketizer::new(16, 2);
        let pkt = crate::rtp::Packet {
            payload_type: 97,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            mark: true,
            payload: Bytes::from_static(&[1, 2, 3]),
        };
        assert!(matches!(
            d.depacketize(&pkt),
            Err(DepacketizeError::InvalidPayload(_))
        ));
    }
}
