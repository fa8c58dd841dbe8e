//! MPEG-4 Audio in LATM (Low-overhead Audio Transport Multiplex) per
//! [RFC 6416](https://datatracker.ietf.org/doc/html/rfc6416): one
//! AudioMuxElement per packet with `muxConfigPresent=0`, the frame
//! delimited by PayloadLengthInfo (0xFF continuation bytes plus a
//! terminator). A fragmented AudioMuxElement ends at the marker bit.

use bytes::{Bytes, BytesMut};
use log::debug;

use super::aac::AudioSpecificConfig;
use super::{
    DepacketizeError, DepacketizeResult, Depacketized, PacketizeError, PacketizerCore, SeqTracker,
};
use crate::bits::{BitReader, BitWriter};
use crate::error::BitsError;

const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// A StreamMuxConfig as in ISO/IEC 14496-3 section 1.7.3, restricted to
/// the single-program single-layer shape RTSP cameras use. All LATM
/// layers must share one type/rate/channel configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamMuxConfig {
    pub all_streams_same_time_framing: bool,
    pub num_sub_frames: u8,
    pub config: AudioSpecificConfig,
}

impl StreamMuxConfig {
    pub fn parse(data: &[u8]) -> Result<Self, BitsError> {
        let mut r = BitReader::new(data);
        if r.read_flag()? {
            // audioMuxVersion=1 changes every following field's encoding.
            return Err(BitsError::InvalidValue);
        }
        let all_streams_same_time_framing = r.read_flag()?;
        let num_sub_frames = r.read_u8(6)?;
        let num_program = r.read_u8(4)?;
        let num_layer = r.read_u8(3)?;
        if num_program != 0 || num_layer != 0 {
            return Err(BitsError::InvalidValue);
        }
        let config = AudioSpecificConfig::parse_bits(&mut r)?;
        let frame_length_type = r.read_u8(3)?;
        if frame_length_type != 0 {
            return Err(BitsError::InvalidValue);
        }
        let _latm_buffer_fullness = r.read_u8(8)?;
        if r.read_flag()? {
            // otherDataPresent: escaped length.
            loop {
                let esc = r.read_flag()?;
                let _chunk = r.read_u8(8)?;
                if !esc {
                    break;
                }
            }
        }
        if r.read_flag()? {
            // crcCheckPresent
            let _crc = r.read_u8(8)?;
        }
        Ok(StreamMuxConfig {
            all_streams_same_time_framing,
            num_sub_frames,
            config,
        })
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.write_flag(false); // audioMuxVersion
        w.write_flag(self.all_streams_same_time_framing);
        w.write_bits(u64::from(self.num_sub_frames), 6);
        w.write_bits(0, 4); // numProgram
        w.write_bits(0, 3); // numLayer
        self.config.marshal_bits(&mut w);
        w.write_bits(0, 3); // frameLengthType
        w.write_bits(0xff, 8); // latmBufferFullness
        w.write_flag(false); // otherDataPresent
        w.write_flag(false); // crcCheckPresent
        w.into_bytes()
    }
}

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
            debug!("lost {} packets; dropping partial AudioMuxElement", gap);
            self.frag = None;
        }
        if pkt.payload.is_empty() {
            return Err(DepacketizeError::InvalidPayload("empty payload".to_owned()));
        }
        if !pkt.mark {
            let buf = self.frag.get_or_insert_with(BytesMut::new);
            if buf.len() + pkt.payload.len() > MAX_FRAME_SIZE {
                let size = buf.len() + pkt.payload.len();
                self.frag = None;
                return Err(DepacketizeError::OversizeUnit {
                    size,
                    limit: MAX_FRAME_SIZE,
                });
            }
            buf.extend_from_slice(&pkt.payload);
            self.started = true;
            return Ok(Depacketized::MorePacketsNeeded);
        }
        let element: Bytes = match self.frag.take() {
            Some(mut buf) => {
                buf.extend_from_slice(&pkt.payload);
                buf.freeze()
            }
            None => pkt.payload.clone(),
        };
        self.started = true;

        // PayloadLengthInfo: 255-valued bytes accumulate, the first byte
        // below 255 terminates.
        let mut len = 0usize;
        let mut off = 0usize;
        loop {
            if off >= element.len() {
                return Err(DepacketizeError::InvalidPayload(
                    "truncated PayloadLengthInfo".to_owned(),
                ));
            }
            let b = element[off];
            off += 1;
            len += usize::from(b);
            if b != 255 {
                break;
            }
        }
        if element.len() - off < len {
            return Err(DepacketizeError::InvalidPayload(format!(
                "AudioMuxElement claims {} bytes with {} left",
                len,
                element.len() - off
            )));
        }
        if element.len() - off > len {
            return Err(DepacketizeError::InvalidPayload(
                "trailing bytes after PayloadMux".to_owned(),
            ));
        }
        Ok(Depacketized::Units(vec![element.slice(off..off + len)]))
    }
}

impl Default for Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Encoder: one AudioMuxElement per frame, split across packets when it
/// exceeds the payload budget, marker on the last fragment.
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
            return Err(PacketizeError::InvalidInput("no frames".to_owned()));
        }
        let max = self.core.payload_max_size();
        let mut out = Vec::new();
        for frame in units {
            if frame.is_empty() {
                return Err(PacketizeError::InvalidInput("empty frame".to_owned()));
            }
            let mut element = BytesMut::with_capacity(frame.len() + frame.len() / 255 + 1);
            let mut rem = frame.len();
            while rem >= 255 {
                element.extend_from_slice(&[255]);
                rem -= 255;
            }
            element.extend_from_slice(&[rem as u8]);
            element.extend_from_slice(frame);
            let element = element.freeze();
            let chunks: Vec<&[u8]> = element.chunks(max).collect();
            let last = chunks.len() - 1;
            for (i, c) in chunks.into_iter().enumerate() {
                out.push(self.core.packet(
                    timestamp,
                    i == last,
                    Bytes::copy_from_slice(c),
                ));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_mux_config_round_trip() {
        let smc = StreamMuxConfig {
            all_streams_same_time_framing: true,
            num_sub_frames: 0,
            config: AudioSpecificConfig {
                audio_object_type: 2,
                sample_rate: 48_000,
                channels: 2,
                frame_length: 1024,
            },
        };
        let raw = smc.marshal();
        assert_eq!(StreamMuxConfig::parse(&raw).unwrap(), smc);
    }

    #[test]
    fn short_frame_round_trip() {
        let mut p = Packetizer::new(96, None, Some(0), None);
        let frame = Bytes::from_static(&[0x01, 0x02, 0x03, 0x04]);
        let pkts = p.packetize(&[frame.clone()], 0).unwrap();
        assert_eq!(pkts.len(), 1);
        // PayloadLengthInfo for a 4-byte frame is the single byte 0x04.
        assert_eq!(&pkts[0].payload[..], &[0x04, 0x01, 0x02, 0x03, 0x04]);
        assert!(pkts[0].mark);

        let mut d = Depacketizer::new();
        assert_eq!(
            d.depacketize(&pkts[0]).unwrap(),
            Depacketized::Units(vec![frame])
        );
    }

    #[test]
    fn length_info_continuation_bytes() {
        let mut p = Packetizer::new(96, None, Some(0), None);
        let frame: Bytes = std::iter::repeat(0xab).take(300).collect();
        let pkts = p.packetize(&[frame.clone()], 0).unwrap();
        assert_eq!(pkts.len(), 1);
        assert_eq!(&pkts[0].payload[..2], &[255, 45]);

        let mut d = Depacketizer::new();
        assert_eq!(
            d.depacketize(&pkts[0]).unwrap(),
            Depacketized::Units(vec![frame])
        );
    }

    #[test]
    fn fragmented_element_round_trip() {
        let mut p = Packetizer::new(96, None, Some(0), Some(100));
        let frame: Bytes = (0..250u32).map(|i| i as u8).collect();
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
}
