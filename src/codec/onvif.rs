//! ONVIF metadata streams.
//! See the
//! [ONVIF Streaming Specification](https://www.onvif.org/specs/stream/ONVIF-Streaming-Spec.pdf)
//! section 5.2.1.1. The RTP layer muxing is simple: packets with the
//! marker bit set end XML messages.

use bytes::{Bytes, BytesMut};
use log::debug;

use super::{
    DepacketizeError, DepacketizeResult, Depacketized, PacketizeError, PacketizerCore, SeqTracker,
};

/// How the XML payload is compressed, from the SDP media subtype.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompressionType {
    Uncompressed,
    GzipCompressed,
    ExiDefault,
    ExiInBand,
}

const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub struct Depacketizer {
    #[allow(dead_code)]
    compression: CompressionType,
    seq: SeqTracker,
    in_progress: Option<BytesMut>,
    high_water_size: usize,
}

impl Depacketizer {
    pub fn new(compression: CompressionType) -> Self {
        Depacketizer {
            compression,
            seq: SeqTracker::new(),
            in_progress: None,
            high_water_size: 0,
        }
    }

    pub fn depacketize(&mut self, pkt: &crate::rtp::Packet) -> DepacketizeResult {
        let gap = self.seq.note(pkt.sequence_number);
        if gap > 0 && self.in_progress.is_some() {
            debug!("lost {} packets; dropping partial metadata message", gap);
            self.in_progress = None;
        }
        match self.in_progress.take() {
            None => {
                if pkt.mark {
                    // Fast path: single-packet message, no copy.
                    return Ok(Depacketized::Units(vec![pkt.payload.clone()]));
                }
                let mut buf = BytesMut::with_capacity(std::cmp::max(
                    self.high_water_size,
                    2 * pkt.payload.len(),
                ));
                buf.extend_from_slice(&pkt.payload);
                self.in_progress = Some(buf);
                Ok(Depacketized::MorePacketsNeeded)
            }
            Some(mut buf) => {
                if buf.len() + pkt.payload.len() > MAX_MESSAGE_SIZE {
                    return Err(DepacketizeError::OversizeUnit {
                        size: buf.len() + pkt.payload.len(),
                        limit: MAX_MESSAGE_SIZE,
                    });
                }
                buf.extend_from_slice(&pkt.payload);
                if pkt.mark {
                    self.high_water_size = std::cmp::max(self.high_water_size, buf.len());
                    return Ok(Depacketized::Units(vec![buf.freeze()]));
                }
                self.in_progress = Some(buf);
                Ok(Depacketized::MorePacketsNeeded)
            }
        }
    }
}

/// Fragments one message per call; marker on the final packet.
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
            return Err(PacketizeError::InvalidInput("no messages".to_owned()));
        }
        let max = self.core.payload_max_size();
        let mut out = Vec::new();
        for msg in units {
            if msg.is_empty() {
                return Err(PacketizeError::InvalidInput("empty message".to_owned()));
            }
            let chunks: Vec<&[u8]> = msg.chunks(max).collect();
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

    #[test]
    fn multi_packet_message() {
        let mut p = Packetizer::new(107, None, Some(0), Some(50));
        let msg = Bytes::from(vec![b'x'; 120]);
        let pkts = p.packetize(&[msg.clone()], 0).unwrap();
        assert_eq!(pkts.len(), 3);

        let mut d = Depacketizer::new(CompressionType::Uncompressed);
        assert_eq!(d.depacketize(&pkts[0]).unwrap(), Depacketized::MorePacketsNeeded);
        assert_eq!(d.depacketize(&pkts[1]).unwrap(), Depacketized::MorePacketsNeeded);
        assert_eq!(
            d.depacketize(&pkts[2]).unwrap(),
            Depacketized::Units(vec![msg])
        );
    }
}
