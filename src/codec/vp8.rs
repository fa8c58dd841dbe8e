//! VP8 RTP payload handling per [RFC
//! 7741](https://tools.ietf.org/html/rfc7741). One unit is one VP8 frame;
//! the payload descriptor's S bit and partition index 0 mark the first
//! fragment, the RTP marker the last.

use bytes::{Bytes, BytesMut};
use log::debug;

use super::{
    DepacketizeError, DepacketizeResult, Depacketized, PacketizeError, PacketizerCore, SeqTracker,
};

const FLAG_X: u8 = 0b1000_0000;
const FLAG_S: u8 = 0b0001_0000;
const MASK_PID: u8 = 0b0000_0111;

const MAX_FRAME_SIZE: usize = 3 * 1024 * 1024;

/// Returns the length of the payload descriptor, validating it.
fn descriptor_len(payload: &[u8]) -> Result<usize, DepacketizeError> {
    if payload.is_empty() {
        return Err(DepacketizeError::InvalidPayload("empty payload".to_owned()));
    }
    let mut len = 1;
    if payload[0] & FLAG_X != 0 {
        if payload.len() < 2 {
            return Err(DepacketizeError::InvalidPayload(
                "truncated extension byte".to_owned(),
            ));
        }
        let ext = payload[1];
        len += 1;
        if ext & 0b1000_0000 != 0 {
            // PictureID, one or two bytes.
            if payload.len() <= len {
                return Err(DepacketizeError::InvalidPayload(
                    "truncated picture id".to_owned(),
                ));
            }
            len += if payload[len] & 0b1000_0000 != 0 { 2 } else { 1 };
        }
        if ext & 0b0100_0000 != 0 {
            len += 1; // TL0PICIDX
        }
        if ext & 0b0011_0000 != 0 {
            len += 1; // TID/KEYIDX
        }
    }
    if payload.len() <= len {
        return Err(DepacketizeError::InvalidPayload(
            "descriptor consumes whole payload".to_owned(),
        ));
    }
    Ok(len)
}

#[derive(Debug)]
pub struct Depacketizer {
    seq: SeqTracker,
    frame: Option<BytesMut>,
    started: bool,
}

impl Depacketizer {
    pub fn new() -> Self {
        Depacketizer {
            seq: SeqTracker::new(),
            frame: None,
            started: false,
        }
    }

    pub fn depacketize(&mut self, pkt: &crate::rtp::Packet) -> DepacketizeResult {
        let gap = self.seq.note(pkt.sequence_number);
        if gap > 0 && self.frame.is_some() {
            debug!("lost {} packets; dropping partial VP8 frame", gap);
            self.frame = None;
        }
        let len = descriptor_len(&pkt.payload)?;
        let start = pkt.payload[0] & FLAG_S != 0 && pkt.payload[0] & MASK_PID == 0;
        let body = &pkt.payload[len..];

        if start {
            if self.frame.is_some() {
                self.frame = None;
                return Err(DepacketizeError::InvalidPayload(
                    "frame start while frame in progress".to_owned(),
                ));
            }
            self.frame = Some(BytesMut::from(body));
            self.started = true;
        } else {
            match &mut self.frame {
                None => {
                    if !self.started {
                        return Ok(Depacketized::NonStartingPacketAndNoPrevious);
                    }
                    if gap > 0 {
                        return Err(DepacketizeError::PacketLoss { gap });
                    }
                    return Err(DepacketizeError::InvalidPayload(
                        "continuation without frame in progress".to_owned(),
                    ));
                }
                Some(buf) => {
                    if buf.len() + body.len() > MAX_FRAME_SIZE {
                        let size = buf.len() + body.len();
                        self.frame = None;
                        return Err(DepacketizeError::OversizeUnit {
                            size,
                            limit: MAX_FRAME_SIZE,
                        });
                    }
                    buf.extend_from_slice(body);
                }
            }
        }
        if pkt.mark {
            let frame = self.frame.take().expect("frame exists when marked");
            return Ok(Depacketized::Units(vec![frame.freeze()]));
        }
        Ok(Depacketized::MorePacketsNeeded)
    }
}

impl Default for Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Encoder with a minimal descriptor (no extensions): S=1 on the first
/// fragment, marker on the last.
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
        let chunk_size = self.core.payload_max_size() - 1;
        let chunks: Vec<&[u8]> = frame.chunks(chunk_size).collect();
        let last = chunks.len() - 1;
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, c)| {
                let mut payload = BytesMut::with_capacity(1 + c.len());
                payload.extend_from_slice(&[if i == 0 { FLAG_S } else { 0 }]);
                payload.extend_from_slice(c);
                self.core.packet(timestamp, i == last, payload.freeze())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut p = Packetizer::new(96, None, Some(0), Some(100));
        let frame: Bytes = (0..250u32).map(|i| i as u8).collect();
        let pkts = p.packetize(&[frame.clone()], 0).unwrap();
        assert_eq!(pkts.len(), 3);
        assert!(pkts[2].mark);

        let mut d = Depacketizer::new();
        assert_eq!(d.depacketize(&pkts[0]).unwrap(), Depacketized::MorePacketsNeeded);
        assert_eq!(d.depacketize(&pkts[1]).unwrap(), Depacketized::MorePacketsNeeded);
        assert_eq!(
            d.depacketize(&pkts[2]).unwrap(),
            Depacketized::Units(vec![frame])
        );
    }

    #[test]
    fn skips_extended_descriptor() {
        // X set, I set with 15-bit picture id, then a one-byte frame.
        let pkt = crate::rtp::Packet {
            payload_type: 96,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            mark: true,
            payload: Bytes::from_static(&[
                FLAG_X | FLAG_S,
                0b1000_0000,
                0b1000_0001,
                0x55,
                0xaa,
            ]),
        };
        let mut d = Depacketizer::new();
        assert_eq!(
            d.depacketize(&pkt).unwrap(),
            Depacketized::Units(vec![Bytes::from_static(&[0xaa])])
        );
    }

    #[test]
    fn mid_stream_join_is_benign() {
        let mut d = Depacketizer::new();
        let pkt = crate::rtp::Packet {
            payload_type: 96,
            sequence_number: 9,
            timestamp: 0,
            ssrc: 0,
            mark: false,
            payload: Bytes::from_static(&[0x00, 0xaa]),
        };
        assert_eq!(
            d.depacketize(&pkt).unwrap(),
            Depacketized::NonStartingPacketAndNoPrevious
        );
    }
}
