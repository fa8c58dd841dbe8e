//! MPEG-4 Audio (AAC) RTP payload handling per [RFC
//! 3640](https://datatracker.ietf.org/doc/html/rfc3640) (`mpeg4-generic`,
//! AAC-hbr mode), plus the AudioSpecificConfig parser from ISO/IEC
//! 14496-3 section 1.6.2.1 that the format layer needs.

use bytes::{Bytes, BytesMut};
use log::debug;

use super::{
    DepacketizeError, DepacketizeResult, Depacketized, PacketizeError, PacketizerCore, SeqTracker,
};
use crate::bits::{BitReader, BitWriter};
use crate::error::BitsError;

/// An AudioSpecificConfig as in ISO/IEC 14496-3 section 1.6.2.1; just the
/// fields of interest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    /// See ISO/IEC 14496-3 Table 1.3. 2 is AAC-LC.
    pub audio_object_type: u8,
    pub sample_rate: u32,
    pub channels: u8,
    /// Samples per frame, derived from the object type.
    pub frame_length: u32,
}

const SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

impl AudioSpecificConfig {
    pub fn parse(config: &[u8]) -> Result<Self, BitsError> {
        let mut r = BitReader::new(config);
        Self::parse_bits(&mut r)
    }

    /// Parses from the current bit position; used directly when the config
    /// is embedded in a StreamMuxConfig.
    pub(crate) fn parse_bits(r: &mut BitReader<'_>) -> Result<Self, BitsError> {
        let audio_object_type = match r.read_u8(5)? {
            31 => 32 + r.read_u8(6)?,
            o => o,
        };

        // ISO/IEC 14496-3 section 1.6.3.4.
        let sample_rate = match r.read_u8(4)? {
            i @ 0x0..=0xc => SAMPLE_RATES[usize::from(i)],
            0xf => r.read_u32(24)?,
            _ => return Err(BitsError::InvalidValue),
        };
        let channels = match r.read_u8(4)? {
            i @ 1..=7 => i,
            _ => return Err(BitsError::InvalidValue),
        };
        if audio_object_type == 5 || audio_object_type == 29 {
            // extensionSamplingFrequencyIndex + extensionSamplingFrequency.
            if r.read_u8(4)? == 0xf {
                r.skip(24)?;
            }
            // audioObjectType (a different one) + extensionChannelConfiguration.
            if r.read_u8(5)? == 22 {
                r.skip(4)?;
            }
        }

        // The supported types are the ones that use GASpecificConfig.
        match audio_object_type {
            1 | 2 | 3 | 4 | 6 | 7 | 17 | 19 | 20 | 21 | 22 | 23 => {}
            _ => return Err(BitsError::InvalidValue),
        }

        // GASpecificConfig, ISO/IEC 14496-3 section 4.4.1.
        let frame_length = match (audio_object_type, r.read_flag()?) {
            (3, false) => 256,
            (3, true) => return Err(BitsError::InvalidValue),
            (23, false) => 512,
            (23, true) => 480,
            (_, false) => 1024,
            (_, true) => 960,
        };

        Ok(AudioSpecificConfig {
            audio_object_type,
            sample_rate,
            channels,
            frame_length,
        })
    }

    /// Serializes back to the wire form used in `config=` fmtp parameters
    /// and inside StreamMuxConfig.
    pub fn marshal(&self) -> Vec<u8> {
        let mut w = BitWriter::new();
        self.marshal_bits(&mut w);
        w.into_bytes()
    }

    pub(crate) fn marshal_bits(&self, w: &mut BitWriter) {
        if self.audio_object_type >= 31 {
            w.write_bits(31, 5);
            w.write_bits(u64::from(self.audio_object_type - 32), 6);
        } else {
            w.write_bits(u64::from(self.audio_object_type), 5);
        }
        match SAMPLE_RATES.iter().position(|&r| r == self.sample_rate) {
            Some(i) => w.write_bits(i as u64, 4),
            None => {
                w.write_bits(0xf, 4);
                w.write_bits(u64::from(self.sample_rate), 24);
            }
        }
        w.write_bits(u64::from(self.channels), 4);
        // GASpecificConfig: frameLengthFlag, dependsOnCoreCoder, extensionFlag.
        let frame_length_flag = match (self.audio_object_type, self.frame_length) {
            (23, 480) => true,
            (_, 960) => true,
            _ => false,
        };
        w.write_flag(frame_length_flag);
        w.write_flag(false);
        w.write_flag(false);
    }
}

/// AU header sizes from the fmtp line. AAC-hbr uses 13/3/3.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AuHeaderLayout {
    pub size_length: u8,
    pub index_length: u8,
    pub index_delta_length: u8,
}

impl Default for AuHeaderLayout {
    fn default() -> Self {
        AuHeaderLayout {
            size_length: 13,
            index_length: 3,
            index_delta_length: 3,
        }
    }
}

#[derive(Debug)]
struct Fragment {
    /// Full size of the AU being reassembled, from its AU header.
    size: usize,
    buf: BytesMut,
}

#[derive(Debug)]
pub struct Depacketizer {
    layout: AuHeaderLayout,
    seq: SeqTracker,
    frag: Option<Fragment>,
    started: bool,
}

impl Depacketizer {
    pub fn new(layout: AuHeaderLayout) -> Self {
        Depacketizer {
            layout,
            seq: SeqTracker::new(),
            frag: None,
            started: false,
        }
    }

    /// Reads the AU headers, returning `(sizes, data_offset)`.
    fn read_headers(&self, payload: &[u8]) -> Result<(Vec<usize>, usize), DepacketizeError> {
        if payload.len() < 2 {
            return Err(DepacketizeError::InvalidPayload(
                "too short for AU-headers-length".to_owned(),
            ));
        }
        let header_bits = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
        let first = usize::from(self.layout.size_length + self.layout.index_length);
        let subsequent = usize::from(self.layout.size_length + self.layout.index_delta_length);
        if header_bits < first || (header_bits - first) % subsequent != 0 {
            return Err(DepacketizeError::InvalidPayload(format!(
                "AU-headers-length {} doesn't fit the configured layout",
                header_bits
            )));
        }
        let count = 1 + (header_bits - first) / subsequent;
        let header_bytes = (header_bits + 7) / 8;
        if payload.len() < 2 + header_bytes {
            return Err(DepacketizeError::InvalidPayload(
                "too short for AU headers".to_owned(),
            ));
        }
        let mut r = BitReader::new(&payload[2..2 + header_bytes]);
        let mut sizes = Vec::with_capacity(count);
        for i in 0..count {
            let size = r
                .read_bits(usize::from(self.layout.size_length))
                .map_err(|_| DepacketizeError::InvalidPayload("truncated AU header".to_owned()))?;
            let index_bits = if i == 0 {
                self.layout.index_length
            } else {
                self.layout.index_delta_length
            };
            let index = r
                .read_bits(usize::from(index_bits))
                .map_err(|_| DepacketizeError::InvalidPayload("truncated AU header".to_owned()))?;
            if index != 0 {
                // A non-zero delta means interleaving, which receivers of
                // IP cameras don't encounter in practice.
                return Err(DepacketizeError::InvalidPayload(
                    "AU interleaving not supported".to_owned(),
                ));
            }
            sizes.push(size as usize);
        }
        Ok((sizes, 2 + header_bytes))
    }

    pub fn depacketize(&mut self, pkt: &crate::rtp::Packet) -> DepacketizeResult {
        let gap = self.seq.note(pkt.sequence_number);
        if gap > 0 && self.frag.is_some() {
            debug!("lost {} packets; dropping partial AAC AU", gap);
            self.frag = None;
        }
        let (sizes, data_off) = self.read_headers(&pkt.payload)?;
        let data = &pkt.payload[data_off..];

        if let Some(mut frag) = self.frag.take() {
            if sizes.len() != 1 {
                return Err(DepacketizeError::InvalidPayload(format!(
                    "{}-AU packet while fragment in progress",
                    sizes.len()
                )));
            }
            if sizes[0] != frag.size {
                return Err(DepacketizeError::InvalidPayload(format!(
                    "AU size changed {} -> {} mid-fragment",
                    frag.size, sizes[0]
                )));
            }
            frag.buf.extend_from_slice(data);
            match frag.buf.len().cmp(&frag.size) {
                std::cmp::Ordering::Less => {
                    if pkt.mark {
                        return Err(DepacketizeError::InvalidPayload(
                            "marked fragment is still incomplete".to_owned(),
                        ));
                    }
                    self.frag = Some(frag);
                    return Ok(Depacketized::MorePacketsNeeded);
                }
                std::cmp::Ordering::Equal => {
                    if !pkt.mark {
                        return Err(DepacketizeError::InvalidPayload(
                            "complete fragment without marker".to_owned(),
                        ));
                    }
                    return Ok(Depacketized::Units(vec![frag.buf.freeze()]));
                }
                std::cmp::Ordering::Greater => {
                    return Err(DepacketizeError::InvalidPayload(
                        "too much data in fragment".to_owned(),
                    ));
                }
            }
        }

        // Start of a fragmented AU: a single AU header describing more
        // data than the packet carries.
        if sizes.len() == 1 && sizes[0] > data.len() {
            if pkt.mark {
                return Err(DepacketizeError::InvalidPayload(
                    "marker set on the first fragment".to_owned(),
                ));
            }
            let mut buf = BytesMut::with_capacity(sizes[0]);
            buf.extend_from_slice(data);
            self.frag = Some(Fragment {
                size: sizes[0],
                buf,
            });
            self.started = true;
            return Ok(Depacketized::MorePacketsNeeded);
        }

        if !pkt.mark {
            return Err(DepacketizeError::InvalidPayload(
                "unmarked packet with complete AUs".to_owned(),
            ));
        }
        let mut units = Vec::with_capacity(sizes.len());
        let mut off = 0usize;
        for size in sizes {
            if data.len() - off < size {
                return Err(DepacketizeError::InvalidPayload(format!(
                    "AU of {} bytes with {} left",
                    size,
                    data.len() - off
                )));
            }
            units.push(pkt.payload.slice(data_off + off..data_off + off + size));
            off += size;
        }
        if off != data.len() {
            return Err(DepacketizeError::InvalidPayload(
                "extra data after final AU".to_owned(),
            ));
        }
        self.started = true;
        Ok(Depacketized::Units(units))
    }
}

/// RFC 3640 encoder: aggregates whole AUs while they fit, and fragments a
/// single oversize AU across packets (each fragment repeating the full AU
/// size in its header, marker on the last).
#[derive(Debug)]
pub struct Packetizer {
    pub(crate) core: PacketizerCore,
    layout: AuHeaderLayout,
}

impl Packetizer {
    pub fn new(
        payload_type: u8,
        layout: AuHeaderLayout,
        ssrc: Option<u32>,
        initial_seq: Option<u16>,
        payload_max_size: Option<usize>,
    ) -> Self {
        Packetizer {
            core: PacketizerCore::new(payload_type, ssrc, initial_seq, payload_max_size),
            layout,
        }
    }

    fn headers(&self, sizes: &[usize]) -> Vec<u8> {
        let first = usize::from(self.layout.size_length + self.layout.index_length);
        let subsequent = usize::from(self.layout.size_length + self.layout.index_delta_length);
        let bits = first + (sizes.len() - 1) * subsequent;
        let mut w = BitWriter::new();
        w.write_bits(bits as u64, 16);
        for (i, &size) in sizes.iter().enumerate() {
            w.write_bits(size as u64, usize::from(self.layout.size_length));
            let index_bits = if i == 0 {
                self.layout.index_length
            } else {
                self.layout.index_delta_length
            };
            w.write_bits(0, usize::from(index_bits));
        }
        w.into_bytes()
    }

    fn header_len(&self, count: usize) -> usize {
        let first = usize::from(self.layout.size_length + self.layout.index_length);
        let subsequent = usize::from(self.layout.size_length + self.layout.index_delta_length);
        2 + (first + (count - 1) * subsequent + 7) / 8
    }

    pub fn packetize(
        &mut self,
        units: &[Bytes],
        timestamp: u32,
    ) -> Result<Vec<crate::rtp::Packet>, PacketizeError> {
        if units.is_empty() {
            return Err(PacketizeError::InvalidInput("no AUs".to_owned()));
        }
        let max = self.core.payload_max_size();
        let max_size = (1usize << self.layout.size_length) - 1;
        for au in units {
            if au.len() > max_size {
                return Err(PacketizeError::OversizeUnit {
                    size: au.len(),
                    limit: max_size,
                });
            }
        }
        let mut out = Vec::new();
        let mut batch: Vec<&Bytes> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut i = 0usize;
        while i < units.len() {
            let au = &units[i];
            let single_header = self.header_len(1);
            if batch.is_empty() && single_header + au.len() > max {
                // Fragmentation; only a lone AU may be fragmented.
                let chunk_size = max - single_header;
                let n_chunks = (au.len() + chunk_size - 1) / chunk_size;
                for (ci, chunk) in au.chunks(chunk_size).enumerate() {
                    let mut payload = BytesMut::with_capacity(single_header + chunk.len());
                    payload.extend_from_slice(&self.headers(&[au.len()]));
                    payload.extend_from_slice(chunk);
                    out.push((ci == n_chunks - 1, payload.freeze()));
                }
                i += 1;
                continue;
            }
            let header_with = self.header_len(batch.len() + 1);
            if !batch.is_empty() && header_with + batch_bytes + au.len() > max {
                let sizes: Vec<usize> = batch.iter().map(|a| a.len()).collect();
                let mut payload = BytesMut::new();
                payload.extend_from_slice(&self.headers(&sizes));
                for a in batch.drain(..) {
                    payload.extend_from_slice(a);
                }
                batch_bytes = 0;
                out.push((true, payload.freeze()));
                continue;
            }
            batch.push(au);
            batch_bytes += au.len();
            i += 1;
        }
        if !batch.is_empty() {
            let sizes: Vec<usize> = batch.iter().map(|a| a.len()).collect();
            let mut payload = BytesMut::new();
            payload.extend_from_slice(&self.headers(&sizes));
            for a in batch.drain(..) {
                payload.extend_from_slice(a);
            }
            out.push((true, payload.freeze()));
        }
        Ok(out
            .into_iter()
            .map(|(mark, payload)| self.core.packet(timestamp, mark, payload))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_audio_specific_config() {
        let dahua = AudioSpecificConfig::parse(&[0x11, 0x88]).unwrap();
        assert_eq!(dahua.sample_rate, 48_000);
        assert_eq!(dahua.channels, 1);

        let bunny = AudioSpecificConfig::parse(&[0x14, 0x90]).unwrap();
        assert_eq!(bunny.sample_rate, 12_000);
        assert_eq!(bunny.channels, 2);
    }

    #[test]
    fn config_marshal_round_trip() {
        let config = AudioSpecificConfig {
            audio_object_type: 2,
            sample_rate: 48_000,
            channels: 2,
            frame_length: 1024,
        };
        let raw = config.marshal();
        assert_eq!(AudioSpecificConfig::parse(&raw).unwrap(), config);
    }

    fn hbr_packetizer(max: usize) -> Packetizer {
        Packetizer::new(96, AuHeaderLayout::default(), None, Some(0), Some(max))
    }

    #[test]
    fn aggregated_aus_round_trip() {
        let mut p = hbr_packetizer(1460);
        let units = vec![
            Bytes::from_static(&[1, 2, 3]),
            Bytes::from_static(&[4, 5]),
            Bytes::from_static(&[6]),
        ];
        let pkts = p.packetize(&units, 0).unwrap();
        assert_eq!(pkts.len(), 1);
        assert!(pkts[0].mark);
        // AU-headers-length: 3 16-bit headers = 48 bits.
        assert_eq!(&pkts[0].payload[..2], &[0, 48]);

        let mut d = Depacketizer::new(AuHeaderLayout::default());
        assert_eq!(d.depacketize(&pkts[0]).unwrap(), Depacketized::Units(units));
    }

    #[test]
    fn fragmented_au_round_trip() {
        let mut p = hbr_packetizer(100);
        let au: Bytes = (0..250u32).map(|i| i as u8).collect();
        let pkts = p.packetize(&[au.clone()], 0).unwrap();
        assert!(pkts.len() > 1);
        assert!(pkts.last().unwrap().mark);
        assert!(!pkts[0].mark);

        let mut d = Depacketizer::new(AuHeaderLayout::default());
        for pkt in &pkts[..pkts.len() - 1] {
            assert_eq!(d.depacketize(pkt).unwrap(), Depacketized::MorePacketsNeeded);
        }
        assert_eq!(
            d.depacketize(pkts.last().unwrap()).unwrap(),
            Depacketized::Units(vec![au])
        );
    }
}
