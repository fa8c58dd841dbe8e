//! [H.265/HEVC](https://www.itu.int/rec/T-REC-H.265) RTP payload handling
//! as specified in [RFC 7798](https://tools.ietf.org/html/rfc7798):
//! single-unit packets, Aggregation Packets (type 48), and Fragmentation
//! Units (type 49). HEVC NAL headers are two bytes; the type lives in the
//! high six bits after the F bit.

use bytes::{BufMut, Bytes, BytesMut};
use log::debug;
use smallvec::SmallVec;

use super::{
    DepacketizeError, DepacketizeResult, Depacketized, PacketizeError, PacketizerCore, SeqTracker,
};

const NAL_TYPE_AP: u8 = 48;
const NAL_TYPE_FU: u8 = 49;

const MAX_NALU_SIZE: usize = 3 * 1024 * 1024;

fn nal_type(header0: u8) -> u8 {
    (header0 >> 1) & 0b11_1111
}

/// Random-access and parameter-set NAL types: BLA/IDR/CRA (16..=21) and
/// VPS/SPS/PPS (32..=34).
fn is_sync_type(t: u8) -> bool {
    matches!(t, 16..=21 | 32..=34)
}

#[derive(Debug)]
pub struct Depacketizer {
    seq: SeqTracker,
    frag: Option<BytesMut>,
    frag_type: u8,
    au: Vec<Bytes>,
    started: bool,
    frag_high_water: usize,

    /// When `sprop-max-don-diff` is non-zero the payload carries decoding
    /// order numbers (DONL/DOND fields) which must be skipped.
    don_present: bool,
}

impl Depacketizer {
    pub fn new(max_don_diff: u32) -> Self {
        Depacketizer {
            seq: SeqTracker::new(),
            frag: None,
            frag_type: 0,
            au: Vec::new(),
            started: false,
            frag_high_water: 0,
            don_present: max_don_diff > 0,
        }
    }

    fn push_nal(&mut self, nal: Bytes) -> Result<(), DepacketizeError> {
        if nal.len() > MAX_NALU_SIZE {
            return Err(DepacketizeError::OversizeUnit {
                size: nal.len(),
                limit: MAX_NALU_SIZE,
            });
        }
        self.started = true;
        self.au.push(nal);
        Ok(())
    }

    pub fn depacketize(&mut self, pkt: &crate::rtp::Packet) -> DepacketizeResult {
        let gap = self.seq.note(pkt.sequence_number);
        if gap > 0 && (self.frag.is_some() || !self.au.is_empty()) {
            debug!("lost {} packets; dropping partial H.265 access unit", gap);
            self.frag = None;
            self.au.clear();
        }
        let data = pkt.payload.clone();
        if data.len() < 2 {
            return Err(DepacketizeError::InvalidPayload(
                "payload too short for NAL header".to_owned(),
            ));
        }
        if (data[0] >> 7) != 0 {
            return Err(DepacketizeError::InvalidPayload(
                "NAL header has F bit set".to_owned(),
            ));
        }
        match nal_type(data[0]) {
            NAL_TYPE_AP => {
                if self.frag.take().is_some() {
                    return Err(DepacketizeError::InvalidPayload(
                        "aggregation packet while fragment in progress".to_owned(),
                    ));
                }
                let mut rest = data.slice(2..);
                let mut first = true;
                if rest.is_empty() {
                    return Err(DepacketizeError::InvalidPayload(
                        "empty aggregation packet".to_owned(),
                    ));
                }
                while !rest.is_empty() {
                    // DONL on the first unit, DOND on the rest.
                    if self.don_present {
                        let skip = if first { 2 } else { 1 };
                        if rest.len() < skip {
                            return Err(DepacketizeError::InvalidPayload(
                                "aggregation packet truncated in DON field".to_owned(),
                            ));
                        }
                        rest = rest.slice(skip..);
                    }
                    if rest.len() < 2 {
                        return Err(DepacketizeError::InvalidPayload(
                            "aggregation packet truncated before NALU size".to_owned(),
                        ));
                    }
                    let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
                    if len < 2 || rest.len() - 2 < len {
                        return Err(DepacketizeError::InvalidPayload(format!(
                            "aggregation packet claims {}-byte NALU with {} bytes left",
                            len,
                            rest.len() - 2
                        )));
                    }
                    self.push_nal(rest.slice(2..2 + len))?;
                    rest = rest.slice(2 + len..);
                    first = false;
                }
            }
            NAL_TYPE_FU => {
                if data.len() < 4 {
                    return Err(DepacketizeError::InvalidPayload(
                        "fragmentation unit too short".to_owned(),
                    ));
                }
                let fu_header = data[2];
                let start = (fu_header & 0b1000_0000) != 0;
                let end = (fu_header & 0b0100_0000) != 0;
                let fu_type = fu_header & 0b11_1111;
                if start && end {
                    return Err(DepacketizeError::InvalidPayload(
                        "fragmentation unit with both start and end bits".to_owned(),
                    ));
                }
                // DONL follows the FU header on the start fragment only.
                let donl = if self.don_present && start { 2 } else { 0 };
                if data.len() < 3 + donl + 1 {
                    return Err(DepacketizeError::InvalidPayload(
                        "fragmentation unit truncated in DONL field".to_owned(),
                    ));
                }
                let body = &data[3 + donl..];
                match (start, self.frag.take()) {
                    (true, Some(_)) => {
                        return Err(DepacketizeError::InvalidPayload(
                            "fragment start while fragment in progress".to_owned(),
                        ));
                    }
                    (true, None) => {
                        let mut buf = BytesMut::with_capacity(std::cmp::max(
                            self.frag_high_water,
                            body.len() + 2,
                        ));
                        // Reconstruct the two-byte NAL header from the
                        // payload header's layer/tid bits and the FU type.
                        buf.put_u8((data[0] & 0b1000_0001) | (fu_type << 1));
                        buf.put_u8(data[1]);
                        buf.extend_from_slice(body);
                        self.frag = Some(buf);
                        self.frag_type = fu_type;
                        self.started = true;
                    }
                    (false, Some(mut buf)) => {
                        if self.frag_type != fu_type {
                            return Err(DepacketizeError::InvalidPayload(
                                "fragment changed NAL type mid-unit".to_owned(),
                            ));
                        }
                        if buf.len() + body.len() > MAX_NALU_SIZE {
                            return Err(DepacketizeError::OversizeUnit {
                                size: buf.len() + body.len(),
                                limit: MAX_NALU_SIZE,
                            });
                        }
                        buf.extend_from_slice(body);
                        if end {
                            self.frag_high_water = std::cmp::max(self.frag_high_water, buf.len());
                            self.au.push(buf.freeze());
                        } else if pkt.mark {
                            return Err(DepacketizeError::InvalidPayload(
                                "fragmentation unit with marker but no end bit".to_owned(),
                            ));
                        } else {
                            self.frag = Some(buf);
                        }
                    }
                    (false, None) => {
                        if !self.started {
                            return Ok(Depacketized::NonStartingPacketAndNoPrevious);
                        }
                        if gap > 0 {
                            return Err(DepacketizeError::PacketLoss { gap });
                        }
                        return Err(DepacketizeError::InvalidPayload(
                            "fragment continuation without fragment in progress".to_owned(),
                        ));
                    }
                }
            }
            0..=47 => {
                if self.frag.take().is_some() {
                    return Err(DepacketizeError::InvalidPayload(
                        "plain NAL while fragment in progress".to_owned(),
                    ));
                }
                self.push_nal(data)?;
            }
            t => {
                return Err(DepacketizeError::InvalidPayload(format!(
                    "unsupported NAL type {}",
                    t
                )));
            }
        }
        if pkt.mark {
            if self.frag.is_some() {
                self.frag = None;
                return Err(DepacketizeError::InvalidPayload(
                    "marker in the middle of a fragmented NAL".to_owned(),
                ));
            }
            if self.au.is_empty() {
                return Err(DepacketizeError::InvalidPayload(
                    "marked packet completed no NAL units".to_owned(),
                ));
            }
            return Ok(Depacketized::Units(std::mem::take(&mut self.au)));
        }
        Ok(Depacketized::MorePacketsNeeded)
    }
}

/// RFC 7798 encoder: aggregation packets for small NAL units, fragmentation
/// units for large ones. Decoding order numbers are never emitted
/// (`sprop-max-don-diff=0` semantics).
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
            return Err(PacketizeError::InvalidInput("no NAL units".to_owned()));
        }
        let max = self.core.payload_max_size();
        let mut payloads: Vec<Bytes> = Vec::new();
        let mut batch: SmallVec<[&Bytes; 8]> = SmallVec::new();
        let mut batch_size = 2usize; // AP payload header
        let mut flush = |batch: &mut SmallVec<[&Bytes; 8]>, payloads: &mut Vec<Bytes>| {
            match batch.len() {
                0 => {}
                1 => payloads.push(batch[0].clone()),
                _ => {
                    let mut buf = BytesMut::with_capacity(max);
                    // Payload header: type 48, lowest layer id, tid from
                    // the smallest among the aggregated units.
                    let tid = batch.iter().map(|n| n[1] & 0b111).min().unwrap_or(1);
                    buf.put_u8(NAL_TYPE_AP << 1);
                    buf.put_u8(tid);
                    for nal in batch.iter() {
                        buf.put_u16(nal.len() as u16);
                        buf.extend_from_slice(nal);
                    }
                    payloads.push(buf.freeze());
                }
            }
            batch.clear();
        };
        for nal in units {
            if nal.len() < 2 {
                return Err(PacketizeError::InvalidInput(
                    "NAL unit shorter than its header".to_owned(),
                ));
            }
            if nal.len() > max {
                flush(&mut batch, &mut payloads);
                batch_size = 2;
                let chunk_size = max - 3;
                let body = &nal[2..];
                let n_chunks = (body.len() + chunk_size - 1) / chunk_size;
                for (i, chunk) in body.chunks(chunk_size).enumerate() {
                    let mut buf = BytesMut::with_capacity(3 + chunk.len());
                    buf.put_u8((nal[0] & 0b1000_0001) | (NAL_TYPE_FU << 1));
                    buf.put_u8(nal[1]);
                    let mut fu_header = nal_type(nal[0]);
                    if i == 0 {
                        fu_header |= 0b1000_0000;
                    }
                    if i == n_chunks - 1 {
                        fu_header |= 0b0100_0000;
                    }
                    buf.put_u8(fu_header);
                    buf.extend_from_slice(chunk);
                    payloads.push(buf.freeze());
                }
                continue;
            }
            let added = 2 + nal.len();
            if !batch.is_empty() && batch_size + added > max {
                flush(&mut batch, &mut payloads);
                batch_size = 2;
            }
            batch.push(nal);
            batch_size += added;
        }
        flush(&mut batch, &mut payloads);

        let last = payloads.len() - 1;
        Ok(payloads
            .into_iter()
            .enumerate()
            .map(|(i, p)| self.core.packet(timestamp, i == last, p))
            .collect())
    }
}

/// Strips emulation-prevention bytes (00 00 03 -> 00 00).
fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

/// The sequence-parameter-set fields of interest, parsed from a complete
/// SPS NAL unit (two-byte header included). See H.265 section 7.3.2.2.1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sps {
    pub general_profile_idc: u8,
    pub general_level_idc: u8,
    pub width: u32,
    pub height: u32,
}

fn skip_profile_tier_level(
    r: &mut crate::bits::BitReader<'_>,
    max_sub_layers_minus1: u8,
) -> Result<(u8, u8), crate::error::BitsError> {
    let _general_profile_space = r.read_bits(2)?;
    let _general_tier_flag = r.read_flag()?;
    let general_profile_idc = r.read_u8(5)?;
    r.skip(32)?; // general_profile_compatibility_flags
    r.skip(48)?; // general constraint flags
    let general_level_idc = r.read_u8(8)?;
    let mut profile_present = [false; 8];
    let mut level_present = [false; 8];
    for i in 0..usize::from(max_sub_layers_minus1) {
        profile_present[i] = r.read_flag()?;
        level_present[i] = r.read_flag()?;
    }
    if max_sub_layers_minus1 > 0 {
        for _ in max_sub_layers_minus1..8 {
            r.skip(2)?; // reserved_zero_2bits
        }
    }
    for i in 0..usize::from(max_sub_layers_minus1) {
        if profile_present[i] {
            r.skip(88)?;
        }
        if level_present[i] {
            r.skip(8)?;
        }
    }
    Ok((general_profile_idc, general_level_idc))
}

impl Sps {
    pub fn parse(nal: &[u8]) -> Result<Self, crate::error::BitsError> {
        use crate::error::BitsError;
        if nal.len() < 4 || nal_type(nal[0]) != 33 {
            return Err(BitsError::InvalidValue);
        }
        let rbsp = unescape_rbsp(&nal[2..]);
        let mut r = crate::bits::BitReader::new(&rbsp);
        let _sps_video_parameter_set_id = r.read_bits(4)?;
        let max_sub_layers_minus1 = r.read_u8(3)?;
        let _sps_temporal_id_nesting_flag = r.read_flag()?;
        let (general_profile_idc, general_level_idc) =
            skip_profile_tier_level(&mut r, max_sub_layers_minus1)?;
        let _sps_seq_parameter_set_id = r.read_exp_golomb()?;
        let chroma_format_idc = r.read_exp_golomb()?;
        if chroma_format_idc == 3 {
            let _separate_colour_plane_flag = r.read_flag()?;
        }
        let mut width = r.read_exp_golomb()?;
        let mut height = r.read_exp_golomb()?;
        if r.read_flag()? {
            // conformance_window_flag
            let left = r.read_exp_golomb()?;
            let right = r.read_exp_golomb()?;
            let top = r.read_exp_golomb()?;
            let bottom = r.read_exp_golomb()?;
            let (sub_w, sub_h) = match chroma_format_idc {
                1 => (2, 2),
                2 => (2, 1),
                _ => (1, 1),
            };
            width = width
                .checked_sub((left + right) * sub_w)
                .ok_or(BitsError::InvalidValue)?;
            height = height
                .checked_sub((top + bottom) * sub_h)
                .ok_or(BitsError::InvalidValue)?;
        }
        Ok(Sps {
            general_profile_idc,
            general_level_idc,
            width,
            height,
        })
    }
}

/// Whether an RTP payload implies PTS == DTS: IRAP pictures or parameter
/// sets, including inside aggregation packets and at the start of
/// fragmentation units.
pub(crate) fn packet_pts_equals_dts(payload: &[u8]) -> bool {
    if payload.len() < 2 {
        return false;
    }
    match nal_type(payload[0]) {
        NAL_TYPE_AP => {
            let mut rest = &payload[2..];
            while rest.len() >= 2 {
                let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
                if len < 2 || rest.len() - 2 < len {
                    return false;
                }
                if is_sync_type(nal_type(rest[2])) {
                    return true;
                }
                rest = &rest[2 + len..];
            }
            false
        }
        NAL_TYPE_FU => {
            payload.len() >= 3
                && (payload[2] & 0b1000_0000) != 0
                && is_sync_type(payload[2] & 0b11_1111)
        }
        t => is_sync_type(t),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_and_aggregated_round_trip() {
        let mut p = Packetizer::new(96, None, Some(10), None);
        let units = vec![
            Bytes::from_static(&[0x40, 0x01, 0xaa]), // VPS
            Bytes::from_static(&[0x42, 0x01, 0xbb]), // SPS
            Bytes::from_static(&[0x26, 0x01, 0xcc, 0xdd]), // IDR_W_RADL
        ];
        let pkts = p.packetize(&units, 5).unwrap();
        assert_eq!(pkts.len(), 1);
        assert_eq!(nal_type(pkts[0].payload[0]), NAL_TYPE_AP);
        assert!(pkts[0].mark);

        let mut d = Depacketizer::new(0);
        assert_eq!(d.depacketize(&pkts[0]).unwrap(), Depacketized::Units(units));
    }

    #[test]
    fn fragmentation_round_trip() {
        let mut p = Packetizer::new(96, None, Some(0), Some(64));
        let mut big = vec![0x02, 0x01]; // TRAIL_R
        big.extend((0..300).map(|i| i as u8));
        let units = vec![Bytes::from(big)];
        let pkts = p.packetize(&units, 0).unwrap();
        assert!(pkts.len() > 1);
        for (i, pkt) in pkts.iter().enumerate() {
            assert_eq!(pkt.sequence_number, i as u16);
            assert!(pkt.payload.len() <= 64);
        }

        let mut d = Depacketizer::new(0);
        for pkt in &pkts[..pkts.len() - 1] {
            assert_eq!(d.depacketize(pkt).unwrap(), Depacketized::MorePacketsNeeded);
        }
        assert_eq!(
            d.depacketize(pkts.last().unwrap()).unwrap(),
            Depacketized::Units(units)
        );
    }

    #[test]
    fn donl_skipped_when_configured() {
        // Hand-built AP with DONL/DOND fields: two 2-byte NAL units.
        let mut payload = BytesMut::new();
        payload.put_u8(NAL_TYPE_AP << 1);
        payload.put_u8(1);
        payload.put_u16(7); // DONL
        payload.put_u16(2);
        payload.extend_from_slice(&[0x40, 0x01]);
        payload.put_u8(1); // DOND
        payload.put_u16(2);
        payload.extend_from_slice(&[0x42, 0x01]);
        let pkt = crate::rtp::Packet {
            payload_type: 96,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            mark: true,
            payload: payload.freeze(),
        };
        let mut d = Depacketizer::new(2);
        assert_eq!(
            d.depacketize(&pkt).unwrap(),
            Depacketized::Units(vec![
                Bytes::from_static(&[0x40, 0x01]),
                Bytes::from_static(&[0x42, 0x01]),
            ])
        );
    }

    #[test]
    fn fu_donl_only_on_start_fragment() {
        // Hand-built fragmented TRAIL_R with DONL: the start fragment
        // carries the 2-byte field, the end fragment does not.
        let mut start = BytesMut::new();
        start.put_u8(NAL_TYPE_FU << 1);
        start.put_u8(0x01);
        start.put_u8(0b1000_0000 | 1); // S, type 1
        start.put_u16(7); // DONL
        start.extend_from_slice(&[0xaa, 0xbb]);
        let mut end = BytesMut::new();
        end.put_u8(NAL_TYPE_FU << 1);
        end.put_u8(0x01);
        end.put_u8(0b0100_0000 | 1); // E, type 1
        end.extend_from_slice(&[0xcc, 0xdd]);

        let mut d = Depacketizer::new(2);
        let pkt = |seq: u16, mark: bool, payload: Bytes| crate::rtp::Packet {
            payload_type: 96,
            sequence_number: seq,
            timestamp: 0,
            ssrc: 0,
            mark,
            payload,
        };
        assert_eq!(
            d.depacketize(&pkt(0, false, start.freeze())).unwrap(),
            Depacketized::MorePacketsNeeded
        );
        assert_eq!(
            d.depacketize(&pkt(1, true, end.freeze())).unwrap(),
            Depacketized::Units(vec![Bytes::from_static(&[
                0x02, 0x01, 0xaa, 0xbb, 0xcc, 0xdd
            ])])
        );
    }

    #[test]
    fn parse_sps_dimensions() {
        // Build a 1280x720 main-profile SPS with our writer, then parse
        // it back.
        let mut w = crate::bits::BitWriter::new();
        w.write_bits(0, 4); // sps_video_parameter_set_id
        w.write_bits(0, 3); // sps_max_sub_layers_minus1
        w.write_flag(true); // sps_temporal_id_nesting_flag
        w.write_bits(0, 2); // general_profile_space
        w.write_flag(false); // general_tier_flag
        w.write_bits(1, 5); // general_profile_idc (Main)
        w.write_bits(0, 32); // compatibility flags
        w.write_bits(0, 48); // constraint flags
        w.write_bits(93, 8); // general_level_idc (3.1)
        w.write_exp_golomb(0); // sps_seq_parameter_set_id
        w.write_exp_golomb(1); // chroma_format_idc (4:2:0)
        w.write_exp_golomb(1280); // pic_width_in_luma_samples
        w.write_exp_golomb(720); // pic_height_in_luma_samples
        w.write_flag(false); // conformance_window_flag
        let mut nal = vec![33 << 1, 0x01];
        nal.extend(w.into_bytes());

        let sps = Sps::parse(&nal).unwrap();
        assert_eq!(sps.general_profile_idc, 1);
        assert_eq!(sps.general_level_idc, 93);
        assert_eq!((sps.width, sps.height), (1280, 720));
    }

    #[test]
    fn pts_equals_dts_detection() {
        // IDR_W_RADL (19): header byte 19 << 1 = 0x26.
        assert!(packet_pts_equals_dts(&[0x26, 0x01, 0x00]));
        // TRAIL_R (1).
        assert!(!packet_pts_equals_dts(&[0x02, 0x01, 0x00]));
        // FU start carrying IDR type.
        assert!(packet_pts_equals_dts(&[
            NAL_TYPE_FU << 1,
            0x01,
            0b1000_0000 | 19,
            0xaa
        ]));
        assert!(!packet_pts_equals_dts(&[NAL_TYPE_FU << 1, 0x01, 19, 0xaa]));
    }
}
