//! MPEG-1/2 audio (layers I-III) over RTP per [RFC 2250 section
//! 3.5](https://datatracker.ietf.org/doc/html/rfc2250#section-3.5): a
//! 4-byte header carrying a fragmentation offset, then elementary-stream
//! audio frames.

use bytes::{BufMut, Bytes, BytesMut};
use log::debug;

use super::{
    DepacketizeError, DepacketizeResult, Depacketized, PacketizeError, PacketizerCore, SeqTracker,
};

const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug)]
pub struct Depacketizer {
    seq: SeqTracker,
    frag: Option<BytesMut>,
    started: bool,
}

impl Depacketizer {
    pub fn new() -> Self {
        Depacketizer {
            seq: SeqTracker::new(),
            frag: None,
            started: false,
        }
    }

    pub fn depacketize(&mut self, pkt: &crate::rtp::Packet) -> DepacketizeResult {
        let gap = self.seq.note(pkt.sequence_number);
        if gap > 0 && self.frag.is_some() {
            debug!("lost {} packets; dropping partial MPEG audio frame", gap);
            self.frag = None;
        }
        if pkt.payload.len() <= 4 {
            return Err(DepacketizeError::InvalidPayload(
                "payload too short for MPEG audio header".to_owned(),
            ));
        }
        let offset = usize::from(u16::from_be_bytes([pkt.payload[2], pkt.payload[3]]));
        let data = pkt.payload.slice(4..);

        if offset == 0 {
            if self.frag.is_some() {
                self.frag = None;
                return Err(DepacketizeError::InvalidPayload(
                    "new frame while fragment in progress".to_owned(),
                ));
            }
            if pkt.mark {
                self.started = true;
                return Ok(Depacketized::Units(vec![data]));
            }
            self.started = true;
            self.frag = Some(BytesMut::from(&data[..]));
            return Ok(Depacketized::MorePacketsNeeded);
        }
        match &mut self.frag {
            None => {
                if !self.started {
                    return Ok(Depacketized::NonStartingPacketAndNoPrevious);
                }
                if gap > 0 {
                    return Err(DepacketizeError::PacketLoss { gap });
                }
                Err(DepacketizeError::InvalidPayload(
                    "fragment continuation without fragment in progress".to_owned(),
                ))
            }
            Some(buf) => {
                if offset != buf.len() {
                    let got = buf.len();
                    self.frag = None;
                    return Err(DepacketizeError::InvalidPayload(format!(
                        "fragment offset {} doesn't match {} buffered bytes",
                        offset, got
                    )));
                }
                if buf.len() + data.len() > MAX_FRAME_SIZE {
                    let size = buf.len() + data.len();
                    self.frag = None;
                    return Err(DepacketizeError::OversizeUnit {
                        size,
                        limit: MAX_FRAME_SIZE,
                    });
                }
                buf.extend_from_slice(&data);
                if pkt.mark {
                    let frame = self.frag.take().expect("fragment in progress").freeze();
                    return Ok(Depacketized::Units(vec![frame]));
                }
                Ok(Depacketized::MorePacketsNeeded)
            }
        }
    }
}

impl Default for Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregates whole frames into one payload (offset 0), or fragments an
/// oversize frame with the RFC 2250 offset field; the marker closes each
/// frame group.
#[derive(Debug)]
pub struct Packetizer {
    pub(crate) core: PacketizerCore,
}

impl Packetizer {
    pub fn new(ssrc: Option<u32>, initial_seq: Option<u16>, payload_max_size: Option<usize>) -> Self {
        // MPA has static payload type 14.
        Packetizer {
            core: PacketizerCore::new(14, ssrc, initial_seq, payload_max_size),
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
        let max = self.core.payload_max_size() - 4;
        let total: usize = units.iter().map(|u| u.len()).sum();
        let mut out = Vec::new();
        if total <= max {
            let mut payload = BytesMut::with_capacity(4 + total);
            payload.put_u32(0);
            for u in units {
                payload.extend_from_slice(u);
            }
            out.push(self.core.packet(timestamp, true, payload.freeze()));
            return Ok(out);
        }
        // Oversize input: send each frame separately, fragmenting as needed.
        for frame in units {
            let chunks: Vec<&[u8]> = frame.chunks(max).collect();
            let last = chunks.len() - 1;
            let mut offset = 0usize;
            for (i, c) in chunks.into_iter().enumerate() {
                let mut payload = BytesMut::with_capacity(4 + c.len());
                payload.put_u16(0);
                payload.put_u16(offset as u16);
                payload.extend_from_slice(c);
                out.push(self.core.packet(timestamp, i == last, payload.freeze()));
                offset += c.len();
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregated_frames() {
        let mut p = Packetizer::new(None, Some(0), None);
        let units = vec![Bytes::from(vec![1u8; 100]), Bytes::from(vec![2u8; 100])];
        let pkts = p.packetize(&units, 0).unwrap();
        assert_eq!(pkts.len(), 1);
        assert_eq!(&pkts[0].payload[..4], &[0, 0, 0, 0]);

        let mut d = Depacketizer::new();
        match d.depacketize(&pkts[0]).unwrap() {
            Depacketized::Units(got) => assert_eq!(got[0].len(), 200),
            o => panic!("unexpected {:?}", o),
        }
    }

    #[test]
    fn fragmented_frame_round_trip() {
        let mut p = Packetizer::new(None, Some(0), Some(100));
        let frame: Bytes = (0..300u32).map(|i| i as u8).collect();
        let pkts = p.packetize(&[frame.clone()], 0).unwrap();
        assert!(pkts.len() > 1);
        // The second packet's offset matches the first chunk's length.
        assert_eq!(
            u16::from_be_bytes([pkts[1].payload[2], pkts[1].payload[3]]),
            96
        );

        let mut d = Depacketizer::new();
        for pkt in &pkts[..pkts.len() - 1] {
            assert_eq!(d.depacketize(pkt).unwrap(), Depacketized::MorePacketsNeeded);
        }
        assert_eq!(
            d.depacketize(pkts.last().unwrap()).unwrap(),
            Depacketized::Units(vec![frame])
        );
    }
}
