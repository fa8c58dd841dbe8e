//! Codec-specific RTP logic: one depacketizer and one packetizer per
//! payload format, each a small state machine over RTP sequence numbers.
//!
//! Depacketizers turn RTP packet streams back into codec access units;
//! packetizers do the reverse. Neither inspects media beyond what the
//! payload format requires, and neither is shared across threads: one
//! instance per direction per media.

use bytes::Bytes;
use rand::Rng;

pub mod aac;
pub mod av1;
pub mod h264;
pub mod h265;
pub mod klv;
pub mod latm;
pub mod lpcm;
pub mod mjpeg;
pub mod mpeg1_audio;
pub mod mpeg1_video;
pub mod mpeg4_video;
pub mod mpegts;
pub mod onvif;
pub mod simple_audio;
pub mod vp8;
pub mod vp9;

/// Default maximum RTP payload size: 1500-byte Ethernet MTU minus IPv4,
/// UDP, and RTP headers.
pub const DEFAULT_PAYLOAD_MAX_SIZE: usize = 1460;

/// Outcome of feeding one RTP packet to a depacketizer.
#[derive(Debug, PartialEq, Eq)]
pub enum Depacketized {
    /// One or more complete units: NAL units for H.26x, OBUs for AV1,
    /// frames for audio codecs, whole blobs for message formats. All
    /// units completed by a single packet share its RTP timestamp unless
    /// the format defines per-unit spacing (multi-AU audio advances by
    /// one frame length per unit).
    Units(Vec<Bytes>),

    /// The packet was consumed but the unit in progress needs more.
    MorePacketsNeeded,

    /// The stream was joined mid-fragment and this packet can't start a
    /// unit. Benign; the next unit boundary resynchronizes.
    NonStartingPacketAndNoPrevious,
}

/// Errors from depacketizers. `PacketLoss` and `OversizeUnit` are
/// recoverable: internal state has been reset and the next unit decodes
/// normally.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DepacketizeError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("lost {gap} packets; discarded partial unit")]
    PacketLoss { gap: u16 },

    #[error("unit of {size} bytes exceeds the maximum of {limit}")]
    OversizeUnit { size: usize, limit: usize },

    #[error("temporal unit has {count} OBUs, more than the maximum of {limit}")]
    ObuCountExceeded { count: usize, limit: usize },
}

pub type DepacketizeResult = Result<Depacketized, DepacketizeError>;

/// Errors from packetizers.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PacketizeError {
    #[error("unit of {size} bytes exceeds the maximum of {limit}")]
    OversizeUnit { size: usize, limit: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// The sequence/ssrc bookkeeping common to every packetizer.
#[derive(Debug)]
pub(crate) struct PacketizerCore {
    payload_type: u8,
    ssrc: u32,
    next_seq: u16,
    payload_max_size: usize,
}

impl PacketizerCore {
    pub(crate) fn new(
        payload_type: u8,
        ssrc: Option<u32>,
        initial_seq: Option<u16>,
        payload_max_size: Option<usize>,
    ) -> Self {
        let mut rng = rand::thread_rng();
        PacketizerCore {
            payload_type,
            ssrc: ssrc.unwrap_or_else(|| rng.gen()),
            next_seq: initial_seq.unwrap_or_else(|| rng.gen()),
            payload_max_size: payload_max_size.unwrap_or(DEFAULT_PAYLOAD_MAX_SIZE),
        }
    }

    pub(crate) fn payload_max_size(&self) -> usize {
        self.payload_max_size
    }

    pub(crate) fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Builds the next packet, advancing the sequence number mod 2^16.
    pub(crate) fn packet(&mut self, timestamp: u32, mark: bool, payload: Bytes) -> crate::rtp::Packet {
        let sequence_number = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        crate::rtp::Packet {
            payload_type: self.payload_type,
            sequence_number,
            timestamp,
            ssrc: self.ssrc,
            mark,
            payload,
        }
    }
}

/// Sequence tracking for depacketizers: reports the gap to the expected
/// next sequence number and resynchronizes on it.
#[derive(Debug, Default)]
pub(crate) struct SeqTracker {
    next: Option<u16>,
}

impl SeqTracker {
    pub(crate) fn new() -> Self {
        SeqTracker::default()
    }

    /// Returns the number of missing packets before `seq` (0 when in
    /// order, or on the very first packet).
    pub(crate) fn note(&mut self, seq: u16) -> u16 {
        let gap = seq.wrapping_sub(self.next.unwrap_or(seq));
        self.next = Some(seq.wrapping_add(1));
        gap
    }
}

/// A depacketizer for any supported format. Obtain one via
/// [`crate::format::Format::create_decoder`].
#[derive(Debug)]
pub enum Depacketizer {
    Aac(aac::Depacketizer),
    Av1(av1::Depacketizer),
    H264(h264::Depacketizer),
    H265(h265::Depacketizer),
    Klv(klv::Depacketizer),
    Latm(latm::Depacketizer),
    Lpcm(lpcm::Depacketizer),
    Mjpeg(mjpeg::Depacketizer),
    Mpeg1Audio(mpeg1_audio::Depacketizer),
    Mpeg1Video(mpeg1_video::Depacketizer),
    Mpeg4Video(mpeg4_video::Depacketizer),
    MpegTs(mpegts::Depacketizer),
    Onvif(onvif::Depacketizer),
    SimpleAudio(simple_audio::Depacketizer),
    Vp8(vp8::Depacketizer),
    Vp9(vp9::Depacketizer),
}

impl Depacketizer {
    /// Processes one RTP packet, in arrival order.
    pub fn depacketize(&mut self, pkt: &crate::rtp::Packet) -> DepacketizeResult {
        match self {
            Depacketizer::Aac(d) => d.depacketize(pkt),
            Depacketizer::Av1(d) => d.depacketize(pkt),
            Depacketizer::H264(d) => d.depacketize(pkt),
            Depacketizer::H265(d) => d.depacketize(pkt),
            Depacketizer::Klv(d) => d.depacketize(pkt),
            Depacketizer::Latm(d) => d.depacketize(pkt),
            Depacketizer::Lpcm(d) => d.depacketize(pkt),
            Depacketizer::Mjpeg(d) => d.depacketize(pkt),
            Depacketizer::Mpeg1Audio(d) => d.depacketize(pkt),
            Depacketizer::Mpeg1Video(d) => d.depacketize(pkt),
            Depacketizer::Mpeg4Video(d) => d.depacketize(pkt),
            Depacketizer::MpegTs(d) => d.depacketize(pkt),
            Depacketizer::Onvif(d) => d.depacketize(pkt),
            Depacketizer::SimpleAudio(d) => d.depacketize(pkt),
            Depacketizer::Vp8(d) => d.depacketize(pkt),
            Depacketizer::Vp9(d) => d.depacketize(pkt),
        }
    }
}

/// A packetizer for any supported format. Obtain one via
/// [`crate::format::Format::create_encoder`].
#[derive(Debug)]
pub enum Packetizer {
    Aac(aac::Packetizer),
    Av1(av1::Packetizer),
    H264(h264::Packetizer),
    H265(h265::Packetizer),
    Klv(klv::Packetizer),
    Latm(latm::Packetizer),
    Lpcm(lpcm::Packetizer),
    Mjpeg(mjpeg::Packetizer),
    Mpeg1Audio(mpeg1_audio::Packetizer),
    Mpeg1Video(mpeg1_video::Packetizer),
    Mpeg4Video(mpeg4_video::Packetizer),
    MpegTs(mpegts::Packetizer),
    Onvif(onvif::Packetizer),
    SimpleAudio(simple_audio::Packetizer),
    Vp8(vp8::Packetizer),
    Vp9(vp9::Packetizer),
}

impl Packetizer {
    /// Packetizes the units of one access unit (or one buffer for
    /// byte-stream formats) stamped with `timestamp`.
    pub fn packetize(
        &mut self,
        units: &[Bytes],
        timestamp: u32,
    ) -> Result<Vec<crate::rtp::Packet>, PacketizeError> {
        match self {
            Packetizer::Aac(p) => p.packetize(units, timestamp),
            Packetizer::Av1(p) => p.packetize(units, timestamp),
            Packetizer::H264(p) => p.packetize(units, timestamp),
            Packetizer::H265(p) => p.packetize(units, timestamp),
            Packetizer::Klv(p) => p.packetize(units, timestamp),
            Packetizer::Latm(p) => p.packetize(units, timestamp),
            Packetizer::Lpcm(p) => p.packetize(units, timestamp),
            Packetizer::Mjpeg(p) => p.packetize(units, timestamp),
            Packetizer::Mpeg1Audio(p) => p.packetize(units, timestamp),
            Packetizer::Mpeg1Video(p) => p.packetize(units, timestamp),
            Packetizer::Mpeg4Video(p) => p.packetize(units, timestamp),
            Packetizer::MpegTs(p) => p.packetize(units, timestamp),
            Packetizer::Onvif(p) => p.packetize(units, timestamp),
            Packetizer::SimpleAudio(p) => p.packetize(units, timestamp),
            Packetizer::Vp8(p) => p.packetize(units, timestamp),
            Packetizer::Vp9(p) => p.packetize(units, timestamp),
        }
    }

    /// The SSRC stamped on outgoing packets.
    pub fn ssrc(&self) -> u32 {
        match self {
            Packetizer::Aac(p) => p.core.ssrc(),
            Packetizer::Av1(p) => p.core.ssrc(),
            Packetizer::H264(p) => p.core.ssrc(),
            Packetizer::H265(p) => p.core.ssrc(),
            Packetizer::Klv(p) => p.core.ssrc(),
            Packetizer::Latm(p) => p.core.ssrc(),
            Packetizer::Lpcm(p) => p.core.ssrc(),
            Packetizer::Mjpeg(p) => p.core.ssrc(),
            Packetizer::Mpeg1Audio(p) => p.core.ssrc(),
            Packetizer::Mpeg1Video(p) => p.core.ssrc(),
            Packetizer::Mpeg4Video(p) => p.core.ssrc(),
            Packetizer::MpegTs(p) => p.core.ssrc(),
            Packetizer::Onvif(p) => p.core.ssrc(),
            Packetizer::SimpleAudio(p) => p.core.ssrc(),
            Packetizer::Vp8(p) => p.core.ssrc(),
            Packetizer::Vp9(p) => p.core.ssrc(),
        }
    }
}
