//! MPEG-1/2 video over RTP per [RFC 2250 section
//! 3.4](https://datatracker.ietf.org/doc/html/rfc2250#section-3.4): each
//! packet begins with a 4-byte MPEG-specific header (temporal reference,
//! slice begin/end flags, picture type) followed by elementary-stream
//! bytes. Fragmentation is slice-aware where possible.

use bytes::{BufMut, Bytes, BytesMut};
use log::debug;

use super::{
    DepacketizeError, DepacketizeResult, Depacketized, PacketizeError, PacketizerCore, SeqTracker,
};

const MAX_FRAME_SIZE: usize = 3 * 1024 * 1024;

const PICTURE_START_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0x00];
const SEQUENCE_START_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0xb3];

/// Picture coding types from ISO/IEC 11172-2 section 2.4.3.4.
const PICTURE_TYPE_B: u8 = 3;

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
            debug!("lost {} packets; dropping partial MPEG picture", gap);
            self.frame = None;
        }
        if pkt.payload.len() <= 4 {
            return Err(DepacketizeError::InvalidPayload(
                "payload too short for MPEG video header".to_owned(),
            ));
        }
        if pkt.payload[0] & 0b1111_1000 != 0 {
            return Err(DepacketizeError::InvalidPayload(
                "MBZ bits set in MPEG video header".to_owned(),
            ));
        }
        let data = pkt.payload.slice(4..);
        if pkt.mark && self.frame.is_none() {
            return Ok(Depacketized::Units(vec![data]));
        }
        let buf = self.frame.get_or_insert_with(BytesMut::new);
        if buf.len() + data.len() > MAX_FRAME_SIZE {
            let size = buf.len() + data.len();
            self.frame = None;
            return Err(DepacketizeError::OversizeUnit {
                size,
                limit: MAX_FRAME_SIZE,
            });
        }
        buf.extend_from_slice(&data);
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

/// Finds the picture coding type by scanning for the picture start code.
fn picture_type(es: &[u8]) -> u8 {
    let mut i = 0;
    while i + 5 < es.len() {
        if es[i..i + 4] == PICTURE_START_CODE {
            // 10 bits temporal reference, then 3 bits picture_coding_type.
            return (es[i + 5] >> 3) & 0b111;
        }
        i += 1;
    }
    0
}

/// Byte offsets of slice start codes (00 00 01 01..af) within `es`.
fn slice_starts(es: &[u8]) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 4 <= es.len() {
        if es[i] == 0 && es[i + 1] == 0 && es[i + 2] == 1 && (0x01..=0xaf).contains(&es[i + 3]) {
            starts.push(i);
            i += 4;
        } else {
            i += 1;
        }
    }
    starts
}

#[derive(Debug)]
pub struct Packetizer {
    pub(crate) core: PacketizerCore,
    temporal_reference: u16,
}

impl Packetizer {
    pub fn new(ssrc: Option<u32>, initial_seq: Option<u16>, payload_max_size: Option<usize>) -> Self {
        // MPV has static payload type 32.
        Packetizer {
            core: PacketizerCore::new(32, ssrc, initial_seq, payload_max_size),
            temporal_reference: 0,
        }
    }

    fn header(&self, ptype: u8, sequence: bool, begin_slice: bool, end_slice: bool) -> u32 {
        (u32::from(self.temporal_reference & 0x3ff) << 16)
            | (u32::from(sequence) << 13)
            | (u32::from(begin_slice) << 12)
            | (u32::from(end_slice) << 11)
            | (u32::from(ptype & 0b111) << 8)
    }

    /// Packetizes one coded picture (headers plus slices).
    pub fn packetize(
        &mut self,
        units: &[Bytes],
        timestamp: u32,
    ) -> Result<Vec<crate::rtp::Packet>, PacketizeError> {
        let frame = match units {
            [f] if f.len() > 4 => f,
            _ => {
                return Err(PacketizeError::InvalidInput(
                    "expected one coded picture".to_owned(),
                ))
            }
        };
        let max = self.core.payload_max_size() - 4;
        let ptype = picture_type(frame);
        let has_sequence_header = frame.len() >= 4 && frame[..4] == SEQUENCE_START_CODE;

        // Cut points: slice starts, further subdivided when a single
        // segment exceeds the payload budget.
        let starts = slice_starts(frame);
        let mut segments: Vec<(usize, usize)> = Vec::new();
        let mut prev = 0usize;
        for &s in &starts {
            if s > prev {
                segments.push((prev, s));
            }
            prev = s;
        }
        segments.push((prev, frame.len()));

        let mut out: Vec<(bool, bool, Bytes)> = Vec::new(); // (begin, end, data)
        let mut cur = BytesMut::new();
        let mut cur_begin = !starts.is_empty() && starts[0] == 0;
        for (i, &(s, e)) in segments.iter().enumerate() {
            let seg = &frame[s..e];
            let is_slice = starts.contains(&s);
            if cur.len() + seg.len() > max && !cur.is_empty() {
                out.push((cur_begin, is_slice, cur.split().freeze()));
                cur_begin = is_slice;
            }
            if seg.len() > max {
                // Oversize segment: flush, then raw-split it.
                if !cur.is_empty() {
                    out.push((cur_begin, is_slice, cur.split().freeze()));
                }
                let chunks: Vec<&[u8]> = seg.chunks(max).collect();
                let n = chunks.len();
                for (ci, c) in chunks.into_iter().enumerate() {
                    let begin = ci == 0 && is_slice;
                    let end = ci == n - 1 && i == segments.len() - 1;
                    out.push((begin, end, Bytes::copy_from_slice(c)));
                }
                cur_begin = false;
                continue;
            }
            if cur.is_empty() {
                cur_begin = is_slice;
            }
            cur.extend_from_slice(seg);
        }
        if !cur.is_empty() {
            out.push((cur_begin, true, cur.freeze()));
        }

        let last = out.len() - 1;
        let pkts = out
            .into_iter()
            .enumerate()
            .map(|(i, (begin, end, data))| {
                let mut payload = BytesMut::with_capacity(4 + data.len());
                payload.put_u32(self.header(ptype, i == 0 && has_sequence_header, begin, end));
                payload.extend_from_slice(&data);
                self.core.packet(timestamp, i == last, payload.freeze())
            })
            .collect();
        self.temporal_reference = (self.temporal_reference + 1) & 0x3ff;
        Ok(pkts)
    }
}

/// Whether the payload's MPEG-specific header names a non-B picture.
pub(crate) fn packet_pts_equals_dts(payload: &[u8]) -> bool {
    payload.len() >= 4 && (payload[2] & 0b111) != PICTURE_TYPE_B
}

#[cfg(test)]
mod tests {
    use super::*;

    fn picture(ptype: u8, slices: usize, slice_len: usize) -> Bytes {
        let mut es = BytesMut::new();
        es.extend_from_slice(&PICTURE_START_CODE);
        // Temporal reference 0, then the coding type in the next 3 bits.
        es.put_u8(0);
        es.put_u8(ptype << 3);
        for s in 0..slices {
            es.extend_from_slice(&[0x00, 0x00, 0x01, 0x01 + s as u8]);
            es.extend(std::iter::repeat(0xaa).take(slice_len));
        }
        es.freeze()
    }

    #[test]
    fn round_trip() {
        let mut p = Packetizer::new(None, Some(0), Some(120));
        let frame = picture(1, 4, 80);
        let pkts = p.packetize(&[frame.clone()], 0).unwrap();
        assert!(pkts.len() > 1);
        // Picture type is carried in every header.
        for pkt in &pkts {
            assert_eq!(pkt.payload[2] & 0b111, 1);
        }

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
    fn b_frames_are_flagged() {
        let mut p = Packetizer::new(None, Some(0), None);
        let pkts = p.packetize(&[picture(3, 1, 20)], 0).unwrap();
        assert!(!packet_pts_equals_dts(&pkts[0].payload));
        let pkts = p.packetize(&[picture(1, 1, 20)], 0).unwrap();
        assert!(packet_pts_equals_dts(&pkts[0].payload));
    }
}
