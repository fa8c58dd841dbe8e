//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en) RTP payload
//! handling as specified in [RFC 6184](https://tools.ietf.org/html/rfc6184):
//! Single NAL Unit packets, STAP-A aggregation, and FU-A fragmentation
//! (packetization mode 1), plus the SPS parsing the format layer needs.

use bytes::{BufMut, Bytes, BytesMut};
use log::debug;
use smallvec::SmallVec;

use super::{
    DepacketizeError, DepacketizeResult, Depacketized, PacketizeError, PacketizerCore, SeqTracker,
};
use crate::bits::BitReader;
use crate::error::BitsError;

const NAL_TYPE_IDR: u8 = 5;
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;

/// Upper bound on a reassembled NAL unit; larger input is dropped as
/// corrupt rather than buffered without limit.
const MAX_NALU_SIZE: usize = 3 * 1024 * 1024;

/// Finds access-unit boundaries (the marker bit) and produces unfragmented
/// NAL units.
///
/// This doesn't inspect slice contents, so it doesn't depend on or verify
/// H.264 section 7.4.1.2.3's constraints on NAL ordering within an access
/// unit.
#[derive(Debug)]
pub struct Depacketizer {
    seq: SeqTracker,
    frag: Option<BytesMut>,
    /// NAL type byte of the fragment in progress.
    frag_header: u8,
    au: Vec<Bytes>,
    started: bool,

    /// The largest reassembled fragment, used as the buffer capacity for
    /// subsequent fragments to minimize reallocation.
    frag_high_water: usize,
}

impl Depacketizer {
    pub fn new() -> Self {
        Depacketizer {
            seq: SeqTracker::new(),
            frag: None,
            frag_header: 0,
            au: Vec::new(),
            started: false,
            frag_high_water: 0,
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
            debug!("lost {} packets; dropping partial H.264 access unit", gap);
            self.frag = None;
            self.au.clear();
        }
        let mut data = pkt.payload.clone();
        if data.is_empty() {
            return Err(DepacketizeError::InvalidPayload("empty payload".to_owned()));
        }
        let nal_header = data[0];
        if (nal_header >> 7) != 0 {
            return Err(DepacketizeError::InvalidPayload(
                "NAL header has F bit set".to_owned(),
            ));
        }
        match nal_header & 0b1_1111 {
            1..=23 => {
                if self.frag.take().is_some() {
                    return Err(DepacketizeError::InvalidPayload(
                        "non-fragmented NAL while fragment in progress".to_owned(),
                    ));
                }
                self.push_nal(data)?;
            }
            NAL_TYPE_STAP_A => {
                if self.frag.take().is_some() {
                    return Err(DepacketizeError::InvalidPayload(
                        "STAP-A while fragment in progress".to_owned(),
                    ));
                }
                let mut rest = data.slice(1..);
                if rest.is_empty() {
                    return Err(DepacketizeError::InvalidPayload("empty STAP-A".to_owned()));
                }
                while !rest.is_empty() {
                    if rest.len() < 2 {
                        return Err(DepacketizeError::InvalidPayload(
                            "STAP-A truncated before NALU size".to_owned(),
                        ));
                    }
                    let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
                    if len == 0 || rest.len() - 2 < len {
                        return Err(DepacketizeError::InvalidPayload(format!(
                            "STAP-A claims {}-byte NALU with {} bytes left",
                            len,
                            rest.len() - 2
                        )));
                    }
                    self.push_nal(rest.slice(2..2 + len))?;
                    rest = rest.slice(2 + len..);
                }
            }
            NAL_TYPE_FU_A => {
                if data.len() < 3 {
                    return Err(DepacketizeError::InvalidPayload("FU-A too short".to_owned()));
                }
                let fu_header = data[1];
                let start = (fu_header & 0b1000_0000) != 0;
                let end = (fu_header & 0b0100_0000) != 0;
                let reserved = (fu_header & 0b0010_0000) != 0;
                if (start && end) || reserved {
                    return Err(DepacketizeError::InvalidPayload(format!(
                        "invalid FU-A header {:08b}",
                        fu_header
                    )));
                }
                let reconstructed = (nal_header & 0b0110_0000) | (fu_header & 0b1_1111);
                match (start, self.frag.take()) {
                    (true, Some(_)) => {
                        return Err(DepacketizeError::InvalidPayload(
                            "FU-A start while fragment in progress".to_owned(),
                        ));
                    }
                    (true, None) => {
                        let mut buf = BytesMut::with_capacity(std::cmp::max(
                            self.frag_high_water,
                            data.len() - 1,
                        ));
                        buf.put_u8(reconstructed);
                        buf.extend_from_slice(&data[2..]);
                        self.frag = Some(buf);
                        self.frag_header = reconstructed;
                        self.started = true;
                    }
                    (false, Some(mut buf)) => {
                        if self.frag_header != reconstructed {
                            return Err(DepacketizeError::InvalidPayload(
                                "FU-A changed NAL type mid-fragment".to_owned(),
                            ));
                        }
                        if buf.len() + data.len() - 2 > MAX_NALU_SIZE {
                            return Err(DepacketizeError::OversizeUnit {
                                size: buf.len() + data.len() - 2,
                                limit: MAX_NALU_SIZE,
                            });
                        }
                        buf.extend_from_slice(&data[2..]);
                        if end {
                            self.frag_high_water = std::cmp::max(self.frag_high_water, buf.len());
                            let nal = buf.freeze();
                            self.au.push(nal);
                        } else if pkt.mark {
                            return Err(DepacketizeError::InvalidPayload(
                                "FU-A with marker but no end bit".to_owned(),
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
                            "FU-A continuation without fragment in progress".to_owned(),
                        ));
                    }
                }
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

impl Default for Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Packetization mode 1 encoder: aggregates small NAL units into STAP-A
/// packets (SPS+PPS+IDR commonly share one packet) and fragments large
/// ones as FU-A. The marker bit is set on the last packet of each access
/// unit.
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
        // Gather payloads first so the marker can be placed on the last one.
        let mut payloads: Vec<Bytes> = Vec::new();
        let mut batch: SmallVec<[&Bytes; 8]> = SmallVec::new();
        let mut batch_size = 1usize; // STAP-A header byte
        let mut flush = |batch: &mut SmallVec<[&Bytes; 8]>, payloads: &mut Vec<Bytes>| {
            match batch.len() {
                0 => {}
                1 => payloads.push(batch[0].clone()),
                _ => {
                    let mut buf = BytesMut::with_capacity(max);
                    let nri = batch.iter().map(|n| n[0] & 0b0110_0000).max().unwrap_or(0);
                    buf.put_u8(nri | NAL_TYPE_STAP_A);
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
            if nal.is_empty() {
                return Err(PacketizeError::InvalidInput("empty NAL unit".to_owned()));
            }
            if nal.len() > max {
                // Too big for a single packet: flush the batch, then FU-A.
                flush(&mut batch, &mut payloads);
                batch_size = 1;
                let nal_header = nal[0];
                let indicator = (nal_header & 0b0110_0000) | NAL_TYPE_FU_A;
                let chunk_size = max - 2;
                let body = &nal[1..];
                let n_chunks = (body.len() + chunk_size - 1) / chunk_size;
                for (i, chunk) in body.chunks(chunk_size).enumerate() {
                    let mut buf = BytesMut::with_capacity(2 + chunk.len());
                    let mut fu_header = nal_header & 0b1_1111;
                    if i == 0 {
                        fu_header |= 0b1000_0000;
                    }
                    if i == n_chunks - 1 {
                        fu_header |= 0b0100_0000;
                    }
                    buf.put_u8(indicator);
                    buf.put_u8(fu_header);
                    buf.extend_from_slice(chunk);
                    payloads.push(buf.freeze());
                }
                continue;
            }
            let added = 2 + nal.len();
            if !batch.is_empty() && batch_size + added > max {
                flush(&mut batch, &mut payloads);
                batch_size = 1;
            }
            // A lone NAL that can't share a STAP-A still fits alone.
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

/// Returns whether an RTP payload carries a NAL unit implying
/// PTS == DTS (IDR slice, SPS, or PPS), looking inside STAP-A
/// aggregates and at the start of FU-A fragments.
pub(crate) fn packet_pts_equals_dts(payload: &[u8]) -> bool {
    fn is_sync(t: u8) -> bool {
        matches!(t, NAL_TYPE_IDR | NAL_TYPE_SPS | NAL_TYPE_PPS)
    }
    if payload.is_empty() {
        return false;
    }
    match payload[0] & 0b1_1111 {
        NAL_TYPE_STAP_A => {
            let mut rest = &payload[1..];
            while rest.len() >= 2 {
                let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
                if len == 0 || rest.len() - 2 < len {
                    return false;
                }
                if is_sync(rest[2] & 0b1_1111) {
                    return true;
                }
                rest = &rest[2 + len..];
            }
            false
        }
        NAL_TYPE_FU_A => {
            payload.len() >= 2 && (payload[1] & 0b1000_0000) != 0 && is_sync(payload[1] & 0b1_1111)
        }
        t => is_sync(t),
    }
}

/// Strips H.264 emulation-prevention bytes (00 00 03 -> 00 00).
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

/// The sequence parameter set fields the library cares about; parsed from
/// a complete SPS NAL unit (header byte included).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sps {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
}

impl Sps {
    pub fn parse(nal: &[u8]) -> Result<Self, BitsError> {
        if nal.len() < 4 || nal[0] & 0b1_1111 != NAL_TYPE_SPS {
            return Err(BitsError::InvalidValue);
        }
        let rbsp = unescape_rbsp(&nal[1..]);
        let mut r = BitReader::new(&rbsp);
        let profile_idc = r.read_u8(8)?;
        let constraint_flags = r.read_u8(8)?;
        let level_idc = r.read_u8(8)?;
        let _seq_parameter_set_id = r.read_exp_golomb()?;

        let mut chroma_format_idc = 1;
        if matches!(
            profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            chroma_format_idc = r.read_exp_golomb()?;
            if chroma_format_idc == 3 {
                let _separate_colour_plane_flag = r.read_flag()?;
            }
            let _bit_depth_luma_minus8 = r.read_exp_golomb()?;
            let _bit_depth_chroma_minus8 = r.read_exp_golomb()?;
            let _qpprime_y_zero_transform_bypass_flag = r.read_flag()?;
            if r.read_flag()? {
                // seq_scaling_matrix_present_flag
                let count = if chroma_format_idc == 3 { 12 } else { 8 };
                for i in 0..count {
                    if r.read_flag()? {
                        skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        let _log2_max_frame_num_minus4 = r.read_exp_golomb()?;
        let pic_order_cnt_type = r.read_exp_golomb()?;
        match pic_order_cnt_type {
            0 => {
                let _log2_max_pic_order_cnt_lsb_minus4 = r.read_exp_golomb()?;
            }
            1 => {
                let _delta_pic_order_always_zero_flag = r.read_flag()?;
                let _offset_for_non_ref_pic = r.read_exp_golomb_signed()?;
                let _offset_for_top_to_bottom_field = r.read_exp_golomb_signed()?;
                let n = r.read_exp_golomb()?;
                for _ in 0..n {
                    let _offset_for_ref_frame = r.read_exp_golomb_signed()?;
                }
            }
            2 => {}
            _ => return Err(BitsError::InvalidValue),
        }
        let _max_num_ref_frames = r.read_exp_golomb()?;
        let _gaps_in_frame_num_value_allowed_flag = r.read_flag()?;
        let pic_width_in_mbs_minus1 = r.read_exp_golomb()?;
        let pic_height_in_map_units_minus1 = r.read_exp_golomb()?;
        let frame_mbs_only_flag = r.read_flag()?;
        if !frame_mbs_only_flag {
            let _mb_adaptive_frame_field_flag = r.read_flag()?;
        }
        let _direct_8x8_inference_flag = r.read_flag()?;

        let mut width = (pic_width_in_mbs_minus1 + 1) * 16;
        let height_units = if frame_mbs_only_flag { 1 } else { 2 };
        let mut height = height_units * (pic_height_in_map_units_minus1 + 1) * 16;
        if r.read_flag()? {
            // frame_cropping_flag
            let left = r.read_exp_golomb()?;
            let right = r.read_exp_golomb()?;
            let top = r.read_exp_golomb()?;
            let bottom = r.read_exp_golomb()?;
            let (crop_x, crop_y) = match chroma_format_idc {
                0 => (1, height_units),
                1 => (2, 2 * height_units),
                2 => (2, height_units),
                _ => (1, height_units),
            };
            width = width
                .checked_sub((left + right) * crop_x)
                .ok_or(BitsError::InvalidValue)?;
            height = height
                .checked_sub((top + bottom) * crop_y)
                .ok_or(BitsError::InvalidValue)?;
        }
        Ok(Sps {
            profile_idc,
            constraint_flags,
            level_idc,
            width,
            height,
        })
    }

    /// The `profile-level-id` fmtp value: profile, constraint flags, and
    /// level as six uppercase hex digits.
    pub fn profile_level_id(&self) -> String {
        format!(
            "{:02X}{:02X}{:02X}",
            self.profile_idc, self.constraint_flags, self.level_idc
        )
    }
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<(), BitsError> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_exp_golomb_signed()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(seq: u16, mark: bool, payload: &[u8]) -> crate::rtp::Packet {
        crate::rtp::Packet {
            payload_type: 96,
            sequence_number: seq,
            timestamp: 0,
            ssrc: 0x1234,
            mark,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn single_nalu_round_trip() {
        let mut p = Packetizer::new(96, Some(0x1234), Some(100), None);
        let units = vec![Bytes::from_static(&[0x01, 0x02, 0x03, 0x04])];
        let pkts = p.packetize(&units, 0).unwrap();
        assert_eq!(pkts.len(), 1);
        assert_eq!(&pkts[0].payload[..], &[0x01, 0x02, 0x03, 0x04]);
        assert!(pkts[0].mark);
        assert_eq!(pkts[0].sequence_number, 100);

        let mut d = Depacketizer::new();
        assert_eq!(d.depacketize(&pkts[0]).unwrap(), Depacketized::Units(units));
    }

    #[test]
    fn stap_a_aggregation() {
        let mut p = Packetizer::new(96, None, Some(0), None);
        // SPS + PPS + small IDR all fit one STAP-A.
        let units = vec![
            Bytes::from_static(&[0x67, 0xaa]),
            Bytes::from_static(&[0x68, 0xbb]),
            Bytes::from_static(&[0x65, 0xcc, 0xdd]),
        ];
        let pkts = p.packetize(&units, 42).unwrap();
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0].payload[0] & 0b1_1111, NAL_TYPE_STAP_A);
        assert!(pkts[0].mark);

        let mut d = Depacketizer::new();
        assert_eq!(d.depacketize(&pkts[0]).unwrap(), Depacketized::Units(units));
    }

    #[test]
    fn fu_a_fragmentation_round_trip() {
        let mut p = Packetizer::new(96, None, Some(0xfffe), Some(100));
        let mut big = vec![0x65u8];
        big.extend((0..500).map(|i| i as u8));
        let units = vec![Bytes::from(big)];
        let pkts = p.packetize(&units, 7).unwrap();
        assert!(pkts.len() > 1);
        // Sequence numbers are continuous across the wrap.
        assert_eq!(pkts[0].sequence_number, 0xfffe);
        assert_eq!(pkts[1].sequence_number, 0xffff);
        assert_eq!(pkts[2].sequence_number, 0x0000);
        for p in &pkts {
            assert!(p.payload.len() <= 100);
        }
        assert!(pkts.last().unwrap().mark);
        assert!(!pkts[0].mark);

        let mut d = Depacketizer::new();
        for p in &pkts[..pkts.len() - 1] {
            assert_eq!(d.depacketize(p).unwrap(), Depacketized::MorePacketsNeeded);
        }
        assert_eq!(
            d.depacketize(pkts.last().unwrap()).unwrap(),
            Depacketized::Units(units)
        );
    }

    #[test]
    fn loss_drops_fragment() {
        let mut p = Packetizer::new(96, None, Some(0), Some(100));
        let mut big = vec![0x65u8];
        big.extend(std::iter::repeat(0xab).take(300));
        let pkts = p.packetize(&[Bytes::from(big)], 0).unwrap();
        assert!(pkts.len() >= 3);

        let mut d = Depacketizer::new();
        assert_eq!(d.depacketize(&pkts[0]).unwrap(), Depacketized::MorePacketsNeeded);
        // Skip the middle fragment: the tail can't start a unit.
        assert!(matches!(
            d.depacketize(&pkts[2]),
            Err(DepacketizeError::PacketLoss { gap: 1 })
        ));
        // The next complete unit decodes normally.
        let ok = packet(pkts[2].sequence_number + 1, true, &[0x61, 0x99]);
        assert_eq!(
            d.depacketize(&ok).unwrap(),
            Depacketized::Units(vec![Bytes::from_static(&[0x61, 0x99])])
        );
    }

    #[test]
    fn mid_stream_join_is_benign() {
        let mut d = Depacketizer::new();
        // FU-A continuation without a start while nothing was decoded yet.
        let pkt = packet(17, false, &[0x7c, 0x05, 0xaa]);
        assert_eq!(
            d.depacketize(&pkt).unwrap(),
            Depacketized::NonStartingPacketAndNoPrevious
        );
    }

    #[test]
    fn pts_equals_dts_detection() {
        // Plain IDR / SPS / PPS.
        assert!(packet_pts_equals_dts(&[0x65, 0x00]));
        assert!(packet_pts_equals_dts(&[0x67, 0x00]));
        assert!(packet_pts_equals_dts(&[0x68, 0x00]));
        // Non-IDR slice.
        assert!(!packet_pts_equals_dts(&[0x61, 0x00]));
        // IDR inside STAP-A.
        assert!(packet_pts_equals_dts(&[
            0x78, 0x00, 0x02, 0x61, 0x00, 0x00, 0x02, 0x65, 0x00
        ]));
        // IDR in FU-A with start bit; and without it.
        assert!(packet_pts_equals_dts(&[0x7c, 0x85, 0xaa]));
        assert!(!packet_pts_equals_dts(&[0x7c, 0x05, 0xaa]));
    }

    #[test]
    fn parse_sps_dimensions() {
        // Construct a baseline-profile 1920x1080 SPS (1088 coded height
        // with 8 lines of bottom cropping).
        let mut w = crate::bits::BitWriter::new();
        w.write_bits(66, 8); // profile_idc
        w.write_bits(0, 8); // constraint flags
        w.write_bits(30, 8); // level_idc
        w.write_exp_golomb(0); // seq_parameter_set_id
        w.write_exp_golomb(0); // log2_max_frame_num_minus4
        w.write_exp_golomb(0); // pic_order_cnt_type
        w.write_exp_golomb(0); // log2_max_pic_order_cnt_lsb_minus4
        w.write_exp_golomb(1); // max_num_ref_frames
        w.write_flag(false); // gaps_in_frame_num_value_allowed_flag
        w.write_exp_golomb(119); // pic_width_in_mbs_minus1 (1920)
        w.write_exp_golomb(67); // pic_height_in_map_units_minus1 (1088)
        w.write_flag(true); // frame_mbs_only_flag
        w.write_flag(false); // direct_8x8_inference_flag
        w.write_flag(true); // frame_cropping_flag
        w.write_exp_golomb(0); // left
        w.write_exp_golomb(0); // right
        w.write_exp_golomb(0); // top
        w.write_exp_golomb(4); // bottom: 4 * 2 = 8 lines
        w.write_flag(false); // vui_parameters_present_flag
        let mut nal = vec![0x67];
        nal.extend(w.into_bytes());

        let sps = Sps::parse(&nal).unwrap();
        assert_eq!(sps.profile_idc, 66);
        assert_eq!((sps.width, sps.height), (1920, 1080));
        assert_eq!(sps.profile_level_id(), "42001E");
    }
}
