//! Motion JPEG over RTP per [RFC
//! 2435](https://datatracker.ietf.org/doc/html/rfc2435). One frame per
//! marker. The encoder handles baseline JPEG, types 0 (4:2:2) and 1
//! (4:2:0), restart interval 0 only, and always ships quantization
//! tables in the first fragment (Q=255); the decoder rebuilds a baseline
//! JFIF bitstream with the standard Huffman tables.

use bytes::{BufMut, Bytes, BytesMut};
use log::debug;

use super::{
    DepacketizeError, DepacketizeResult, Depacketized, PacketizeError, PacketizerCore, SeqTracker,
};

const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// ITU T.81 Annex K typical Huffman tables, as required for RFC 2435
// reconstruction.
const DC_LUMA_BITS: [u8; 16] = [0, 1, 5, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0];
const DC_LUMA_VALS: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
const DC_CHROMA_BITS: [u8; 16] = [0, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0];
const DC_CHROMA_VALS: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
const AC_LUMA_BITS: [u8; 16] = [0, 2, 1, 3, 3, 2, 4, 3, 5, 5, 4, 4, 0, 0, 1, 0x7d];
const AC_LUMA_VALS: [u8; 162] = [
    0x01, 0x02, 0x03, 0x00, 0x04, 0x11, 0x05, 0x12, 0x21, 0x31, 0x41, 0x06, 0x13, 0x51, 0x61,
    0x07, 0x22, 0x71, 0x14, 0x32, 0x81, 0x91, 0xa1, 0x08, 0x23, 0x42, 0xb1, 0xc1, 0x15, 0x52,
    0xd1, 0xf0, 0x24, 0x33, 0x62, 0x72, 0x82, 0x09, 0x0a, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x25,
    0x26, 0x27, 0x28, 0x29, 0x2a, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x43, 0x44, 0x45,
    0x46, 0x47, 0x48, 0x49, 0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a, 0x63, 0x64,
    0x65, 0x66, 0x67, 0x68, 0x69, 0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7a, 0x83,
    0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x8a, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98, 0x99,
    0x9a, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6,
    0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2, 0xd3,
    0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xe1, 0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8,
    0xe9, 0xea, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9, 0xfa,
];
const AC_CHROMA_BITS: [u8; 16] = [0, 2, 1, 2, 4, 4, 3, 4, 7, 5, 4, 4, 0, 1, 2, 0x77];
const AC_CHROMA_VALS: [u8; 162] = [
    0x00, 0x01, 0x02, 0x03, 0x11, 0x04, 0x05, 0x21, 0x31, 0x06, 0x12, 0x41, 0x51, 0x07, 0x61,
    0x71, 0x13, 0x22, 0x32, 0x81, 0x08, 0x14, 0x42, 0x91, 0xa1, 0xb1, 0xc1, 0x09, 0x23, 0x33,
    0x52, 0xf0, 0x15, 0x62, 0x72, 0xd1, 0x0a, 0x16, 0x24, 0x34, 0xe1, 0x25, 0xf1, 0x17, 0x18,
    0x19, 0x1a, 0x26, 0x27, 0x28, 0x29, 0x2a, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x43, 0x44,
    0x45, 0x46, 0x47, 0x48, 0x49, 0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a, 0x63,
    0x64, 0x65, 0x66, 0x67, 0x68, 0x69, 0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7a,
    0x82, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x8a, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97,
    0x98, 0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4,
    0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca,
    0xd2, 0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7,
    0xe8, 0xe9, 0xea, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9, 0xfa,
];

/// A parsed baseline JPEG, reduced to what the RTP payload carries.
#[derive(Debug)]
struct ParsedJpeg {
    /// RFC 2435 type: 0 for 4:2:2, 1 for 4:2:0.
    type_: u8,
    width: u16,
    height: u16,
    /// 64-byte 8-bit quantization tables in table-id order.
    qtables: Vec<[u8; 64]>,
    scan_offset: usize,
    scan_len: usize,
}

fn parse_jpeg(data: &[u8]) -> Result<ParsedJpeg, PacketizeError> {
    let bad = |msg: &str| PacketizeError::InvalidInput(format!("bad JPEG: {}", msg));
    if data.len() < 4 || data[0] != 0xff || data[1] != 0xd8 {
        return Err(bad("missing SOI"));
    }
    let mut qtables: Vec<(u8, [u8; 64])> = Vec::new();
    let mut sof: Option<(u8, u16, u16)> = None;
    let mut i = 2usize;
    loop {
        if i + 4 > data.len() {
            return Err(bad("truncated before SOS"));
        }
        if data[i] != 0xff {
            return Err(bad("expected marker"));
        }
        let marker = data[i + 1];
        let len = usize::from(u16::from_be_bytes([data[i + 2], data[i + 3]]));
        if len < 2 || i + 2 + len > data.len() {
            return Err(bad("bad segment length"));
        }
        let seg = &data[i + 4..i + 2 + len];
        match marker {
            0xdb => {
                // DQT; may hold several tables.
                let mut s = seg;
                while !s.is_empty() {
                    let pq = s[0] >> 4;
                    let tq = s[0] & 0x0f;
                    if pq != 0 {
                        return Err(bad("16-bit quantization tables unsupported"));
                    }
                    if s.len() < 65 {
                        return Err(bad("truncated quantization table"));
                    }
                    let mut table = [0u8; 64];
                    table.copy_from_slice(&s[1..65]);
                    qtables.push((tq, table));
                    s = &s[65..];
                }
            }
            0xc0 => {
                if seg.len() < 15 || seg[0] != 8 {
                    return Err(bad("SOF0 must be 8-bit baseline with 3 components"));
                }
                let height = u16::from_be_bytes([seg[1], seg[2]]);
                let width = u16::from_be_bytes([seg[3], seg[4]]);
                if seg[5] != 3 {
                    return Err(bad("expected 3 components"));
                }
                let type_ = match seg[7] {
                    0x21 => 0,
                    0x22 => 1,
                    _ => return Err(bad("luma sampling must be 4:2:2 or 4:2:0")),
                };
                if seg[10] != 0x11 || seg[13] != 0x11 {
                    return Err(bad("chroma sampling must be 1x1"));
                }
                if width % 8 != 0 || height % 8 != 0 {
                    return Err(bad("dimensions must be multiples of 8"));
                }
                sof = Some((type_, width, height));
            }
            0xc1..=0xcf => return Err(bad("only baseline (SOF0) is supported")),
            0xdd => {
                if seg.len() < 2 || seg[0] != 0 || seg[1] != 0 {
                    return Err(bad("restart intervals unsupported"));
                }
            }
            0xda => {
                let (type_, width, height) = sof.ok_or_else(|| bad("SOS before SOF0"))?;
                let scan_offset = i + 2 + len;
                let mut scan_len = data.len() - scan_offset;
                // Strip a trailing EOI if present.
                if scan_len >= 2 && data[data.len() - 2] == 0xff && data[data.len() - 1] == 0xd9 {
                    scan_len -= 2;
                }
                qtables.sort_by_key(|&(tq, _)| tq);
                return Ok(ParsedJpeg {
                    type_,
                    width,
                    height,
                    qtables: qtables.into_iter().map(|(_, t)| t).collect(),
                    scan_offset,
                    scan_len,
                });
            }
            _ => {} // APPn, COM, DHT: skipped; standard tables are assumed.
        }
        i += 2 + len;
    }
}

fn put_huffman_table(out: &mut BytesMut, class_and_id: u8, bits: &[u8; 16], vals: &[u8]) {
    out.put_u8(0xff);
    out.put_u8(0xc4);
    out.put_u16((2 + 1 + 16 + vals.len()) as u16);
    out.put_u8(class_and_id);
    out.extend_from_slice(bits);
    out.extend_from_slice(vals);
}

/// Rebuilds the JFIF headers for a frame, per RFC 2435 appendix B.
fn make_headers(type_: u8, width: u16, height: u16, qtables: &[[u8; 64]]) -> BytesMut {
    let mut out = BytesMut::with_capacity(1024);
    out.extend_from_slice(&[0xff, 0xd8]); // SOI
    for (i, table) in qtables.iter().enumerate() {
        out.put_u8(0xff);
        out.put_u8(0xdb);
        out.put_u16(2 + 1 + 64);
        out.put_u8(i as u8);
        out.extend_from_slice(table);
    }
    // SOF0: 8-bit, three components, chroma tables shared.
    out.extend_from_slice(&[0xff, 0xc0]);
    out.put_u16(2 + 15);
    out.put_u8(8);
    out.put_u16(height);
    out.put_u16(width);
    out.put_u8(3);
    out.put_u8(1); // Y
    out.put_u8(if type_ == 0 { 0x21 } else { 0x22 });
    out.put_u8(0);
    out.put_u8(2); // Cb
    out.put_u8(0x11);
    out.put_u8(if qtables.len() > 1 { 1 } else { 0 });
    out.put_u8(3); // Cr
    out.put_u8(0x11);
    out.put_u8(if qtables.len() > 1 { 1 } else { 0 });
    put_huffman_table(&mut out, 0x00, &DC_LUMA_BITS, &DC_LUMA_VALS);
    put_huffman_table(&mut out, 0x10, &AC_LUMA_BITS, &AC_LUMA_VALS);
    put_huffman_table(&mut out, 0x01, &DC_CHROMA_BITS, &DC_CHROMA_VALS);
    put_huffman_table(&mut out, 0x11, &AC_CHROMA_BITS, &AC_CHROMA_VALS);
    // SOS
    out.extend_from_slice(&[0xff, 0xda]);
    out.put_u16(2 + 1 + 6 + 3);
    out.put_u8(3);
    out.extend_from_slice(&[1, 0x00, 2, 0x11, 3, 0x11]);
    out.extend_from_slice(&[0, 63, 0]);
    out
}

#[derive(Debug)]
struct InProgress {
    type_: u8,
    width: u16,
    height: u16,
    qtables: Vec<[u8; 64]>,
    scan: BytesMut,
}

#[derive(Debug)]
pub struct Depacketizer {
    seq: SeqTracker,
    frame: Option<InProgress>,
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
            debug!("lost {} packets; dropping partial JPEG frame", gap);
            self.frame = None;
        }
        let p = &pkt.payload;
        if p.len() < 8 {
            return Err(DepacketizeError::InvalidPayload(
                "payload too short for JPEG header".to_owned(),
            ));
        }
        let offset = (usize::from(p[1]) << 16) | (usize::from(p[2]) << 8) | usize::from(p[3]);
        let type_ = p[4];
        let q = p[5];
        let width = u16::from(p[6]) * 8;
        let height = u16::from(p[7]) * 8;
        if type_ >= 64 {
            return Err(DepacketizeError::InvalidPayload(
                "restart-interval types unsupported".to_owned(),
            ));
        }
        if type_ > 1 {
            return Err(DepacketizeError::InvalidPayload(format!(
                "unsupported JPEG type {}",
                type_
            )));
        }
        let mut rest = p.slice(8..);

        if offset == 0 {
            if self.frame.is_some() {
                self.frame = None;
                return Err(DepacketizeError::InvalidPayload(
                    "new frame while frame in progress".to_owned(),
                ));
            }
            let qtables = if q >= 128 {
                // Quantization table header: MBZ, precision, length.
                if rest.len() < 4 {
                    return Err(DepacketizeError::InvalidPayload(
                        "truncated quantization table header".to_owned(),
                    ));
                }
                let precision = rest[1];
                let len = usize::from(u16::from_be_bytes([rest[2], rest[3]]));
                if precision != 0 || len % 64 != 0 || rest.len() - 4 < len {
                    return Err(DepacketizeError::InvalidPayload(
                        "bad quantization table header".to_owned(),
                    ));
                }
                let mut tables = Vec::with_capacity(len / 64);
                for t in 0..len / 64 {
                    let mut table = [0u8; 64];
                    table.copy_from_slice(&rest[4 + t * 64..4 + (t + 1) * 64]);
                    tables.push(table);
                }
                rest = rest.slice(4 + len..);
                tables
            } else {
                return Err(DepacketizeError::InvalidPayload(format!(
                    "static Q values unsupported (Q={})",
                    q
                )));
            };
            self.started = true;
            self.frame = Some(InProgress {
                type_,
                width,
                height,
                qtables,
                scan: BytesMut::from(&rest[..]),
            });
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
                Some(frame) => {
                    if offset != frame.scan.len() {
                        let got = frame.scan.len();
                        self.frame = None;
                        return Err(DepacketizeError::InvalidPayload(format!(
                            "fragment offset {} doesn't match {} buffered bytes",
                            offset, got
                        )));
                    }
                    if frame.scan.len() + rest.len() > MAX_FRAME_SIZE {
                        let size = frame.scan.len() + rest.len();
                        self.frame = None;
                        return Err(DepacketizeError::OversizeUnit {
                            size,
                            limit: MAX_FRAME_SIZE,
                        });
                    }
                    frame.scan.extend_from_slice(&rest);
                }
            }
        }
        if pkt.mark {
            let frame = self.frame.take().expect("frame in progress");
            let mut jpeg = make_headers(frame.type_, frame.width, frame.height, &frame.qtables);
            jpeg.extend_from_slice(&frame.scan);
            jpeg.extend_from_slice(&[0xff, 0xd9]); // EOI
            return Ok(Depacketized::Units(vec![jpeg.freeze()]));
        }
        Ok(Depacketized::MorePacketsNeeded)
    }
}

impl Default for Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Encoder restricted per RFC 2435 to types 0/1 with restart interval 0;
/// quantization tables always travel in-band (Q=255) in the first
/// fragment.
#[derive(Debug)]
pub struct Packetizer {
    pub(crate) core: PacketizerCore,
}

impl Packetizer {
    pub fn new(ssrc: Option<u32>, initial_seq: Option<u16>, payload_max_size: Option<usize>) -> Self {
        // JPEG has static payload type 26.
        Packetizer {
            core: PacketizerCore::new(26, ssrc, initial_seq, payload_max_size),
        }
    }

    pub fn packetize(
        &mut self,
        units: &[Bytes],
        timestamp: u32,
    ) -> Result<Vec<crate::rtp::Packet>, PacketizeError> {
        let jpeg = match units {
            [j] if !j.is_empty() => j,
            _ => {
                return Err(PacketizeError::InvalidInput(
                    "expected exactly one JPEG image".to_owned(),
                ))
            }
        };
        let parsed = parse_jpeg(jpeg)?;
        let scan = &jpeg[parsed.scan_offset..parsed.scan_offset + parsed.scan_len];
        let max = self.core.payload_max_size();

        let mut out = Vec::new();
        let mut offset = 0usize;
        while offset < scan.len() || out.is_empty() {
            let mut payload = BytesMut::with_capacity(max);
            payload.put_u8(0); // type-specific
            payload.put_u8((offset >> 16) as u8);
            payload.put_u8((offset >> 8) as u8);
            payload.put_u8(offset as u8);
            payload.put_u8(parsed.type_);
            payload.put_u8(255); // Q: tables in-band
            payload.put_u8((parsed.width / 8) as u8);
            payload.put_u8((parsed.height / 8) as u8);
            if offset == 0 {
                payload.put_u8(0); // MBZ
                payload.put_u8(0); // precision: 8-bit
                payload.put_u16((parsed.qtables.len() * 64) as u16);
                for t in &parsed.qtables {
                    payload.extend_from_slice(t);
                }
            }
            let room = max.saturating_sub(payload.len());
            if room == 0 {
                return Err(PacketizeError::InvalidInput(
                    "payload_max_size leaves no room for scan data".to_owned(),
                ));
            }
            let take = std::cmp::min(room, scan.len() - offset);
            payload.extend_from_slice(&scan[offset..offset + take]);
            offset += take;
            let mark = offset == scan.len();
            out.push(self.core.packet(timestamp, mark, payload.freeze()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_jpeg(scan_len: usize) -> Bytes {
        let qtables = vec![[7u8; 64], [9u8; 64]];
        let mut jpeg = make_headers(1, 640, 480, &qtables);
        jpeg.extend((0..scan_len).map(|i| (i % 251) as u8));
        jpeg.extend_from_slice(&[0xff, 0xd9]);
        jpeg.freeze()
    }

    #[test]
    fn round_trip() {
        let jpeg = test_jpeg(5000);
        let mut p = Packetizer::new(None, Some(0), Some(1400));
        let pkts = p.packetize(&[jpeg.clone()], 0).unwrap();
        assert!(pkts.len() > 1);
        assert!(pkts.last().unwrap().mark);
        // First fragment carries the quantization tables.
        assert_eq!(pkts[0].payload[5], 255);
        assert_eq!(
            u16::from_be_bytes([pkts[0].payload[10], pkts[0].payload[11]]),
            128
        );

        let mut d = Depacketizer::new();
        for pkt in &pkts[..pkts.len() - 1] {
            assert_eq!(d.depacketize(pkt).unwrap(), Depacketized::MorePacketsNeeded);
        }
        match d.depacketize(pkts.last().unwrap()).unwrap() {
            Depacketized::Units(units) => assert_eq!(units, vec![jpeg]),
            o => panic!("unexpected {:?}", o),
        }
    }

    #[test]
    fn rejects_restart_intervals() {
        // A DRI segment with a non-zero interval.
        let mut jpeg = BytesMut::new();
        jpeg.extend_from_slice(&[0xff, 0xd8, 0xff, 0xdd, 0x00, 0x04, 0x00, 0x10]);
        let mut p = Packetizer::new(None, Some(0), None);
        assert!(matches!(
            p.packetize(&[jpeg.freeze()], 0),
            Err(PacketizeError::InvalidInput(_))
        ));
    }
}
