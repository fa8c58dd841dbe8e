//! MPEG-4 Visual elementary streams over RTP per [RFC 6416 section
//! 5](https://datatracker.ietf.org/doc/html/rfc6416#section-5): the
//! bitstream of one VOP (plus any leading configuration headers) is split
//! across packets at arbitrary byte positions, marker on the last.

use bytes::{Bytes, BytesMut};
use log::debug;

use super::{
    DepacketizeError, DepacketizeResult, Depacketized, PacketizeError, PacketizerCore, SeqTracker,
};

const MAX_FRAME_SIZE: usize = 3 * 1024 * 1024;

const VOP_START_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0xb6];

#[derive(Debug)]
pub struct Depacketizer {
    seq: SeqTracker,
    frame: Option<BytesMut>,
}

impl Depacketizer {
    pub fn new() -> Self {
        Depacketizer {
            seq: SeqTracker::new(),
            frame: None,
        }
    }

    pub fn depacketize(&mut self, pkt: &crate::rtp::Packet) -> DepacketizeResult {
        let gap = self.seq.note(pkt.sequence_number);
        if gap > 0 && self.frame.is_some() {
            debug!("lost {} packets; dropping partial MPEG-4 frame", gap);
            self.frame = None;
        }
        if pkt.payload.is_empty() {
            return Err(DepacketizeError::InvalidPayload("empty payload".to_owned()));
        }
        if pkt.mark && self.frame.is_none() {
            return Ok(Depacketized::Units(vec![pkt.payload.clone()]));
        }
        let buf = self.frame.get_or_insert_with(BytesMut::new);
        if buf.len() + pkt.payload.len() > MAX_FRAME_SIZE {
            let size = buf.len() + pkt.payload.len();
            self.frame = None;
            return Err(DepacketizeError::OversizeUnit {
                size,
                limit: MAX_FRAME_SIZE,
            });
        }
        buf.extend_from_slice(&pkt.payload);
        if pkt.mark {
            let frame = self.frame.take().expect("frame in progress").freeze();
            return Ok(Depacketized::Units(vec![frame]));
        }
        Ok(Depacketized::MorePacketsNeeded)
    }
}

impl Default for Depacketizer {
    fn default() -> Self {
        Self::new()
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
        let frame = match units {
            [f] if !f.is_empty() => f,
            _ => {
                return Err(PacketizeError::InvalidInput(
                    "expected exactly one non-empty frame".to_owned(),
                ))
            }
        };
        let max = self.core.payload_max_size();
        let chunks: Vec<&[u8]> = frame.chunks(max).collect();
        let last = chunks.len() - 1;
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, c)| self.core.packet(timestamp, i == last, Bytes::copy_from_slice(c)))
            .collect())
    }
}

/// Whether the payload starts a non-B VOP (or carries only configuration
/// headers), meaning PTS == DTS for the frame it begins.
pub(crate) fn packet_pts_equals_dts(payload: &[u8]) -> bool {
    let mut i = 0;
    while i + 4 <= payload.len() {
        if payload[i..i + 4] == VOP_START_CODE {
            if i + 4 >= payload.len() {
                return false;
            }
            // vop_coding_type is the top two bits after the start code:
            // 0 I, 1 P, 2 B, 3 S.
            return payload[i + 4] >> 6 != 2;
        }
        i += 1;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut p = Packetizer::new(96, None, Some(0), Some(64));
        let mut frame = VOP_START_CODE.to_vec();
        frame.extend((0..150u32).map(|i| i as u8));
        let frame = Bytes::from(frame);
        let pkts = p.packetize(&[frame.clone()], 0).unwrap();
        assert!(pkts.len() > 1);

        let mut d = Depacketizer::new();
        for pkt in &pkts[..pkts.len() - 1] {
            assert_eq!(d.depacketize(pkt).unwrap(), Depacketized::MorePacketsNeeded);
        }
        assert_eq!(
            d.depacketize(pkts.last().unwrap()).unwrap(),
            Depacketized::Units(vec![frame])
        );
    }

    #[test]
    fn vop_coding_type() {
        // I-VOP (00), B-VOP (10).
        assert!(packet_pts_equals_dts(&[0x00, 0x00, 0x01, 0xb6, 0b0000_0000]));
        assert!(!packet_pts_equals_dts(&[0x00, 0x00, 0x01, 0xb6, 0b1000_0000]));
        // Configuration-only payload.
        assert!(packet_pts_equals_dts(&[0x00, 0x00, 0x01, 0xb0, 0x01]));
    }
}
