//! The format registry: canonical mapping between SDP media-description
//! attributes (`payload type`, `a=rtpmap:`, `a=fmtp:`) and typed format
//! descriptors, plus constructors for the matching codec-layer encoder
//! and decoder. See
//! [RFC 3551 section 6](https://datatracker.ietf.org/doc/html/rfc3551#section-6)
//! for the static payload type table.

use bytes::Bytes;

use crate::codec::aac::{AudioSpecificConfig, AuHeaderLayout};
use crate::codec::latm::StreamMuxConfig;
use crate::codec::{self, onvif::CompressionType, simple_audio::Validation};
use crate::Error;

/// The `m=` line media type a format belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
    Application,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Application => "application",
        })
    }
}

/// Key/value pairs from an `a=fmtp:` attribute. Keys are lowercased on
/// parse; order is preserved for round-tripping.
pub type FmtpMap = Vec<(String, String)>;

/// Parses `a=fmtp:` parameters (`key=value` pairs separated by `;`).
pub fn parse_fmtp(s: &str) -> FmtpMap {
    s.split(';')
        .filter_map(|p| {
            let p = p.trim();
            if p.is_empty() {
                // Some cameras leave a trailing ';'.
                return None;
            }
            match p.split_once('=') {
                Some((k, v)) => Some((k.trim().to_ascii_lowercase(), v.trim().to_owned())),
                None => Some((p.to_ascii_lowercase(), String::new())),
            }
        })
        .collect()
}

fn fmtp_get<'a>(fmtp: &'a FmtpMap, key: &str) -> Option<&'a str> {
    fmtp.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Strips Annex-B start codes some cameras leave on sprop parameter sets,
/// both leading and trailing.
fn strip_annexb(mut nal: &[u8]) -> &[u8] {
    for prefix in [&b"\x00\x00\x00\x01"[..], &b"\x00\x00\x01"[..]] {
        if let Some(s) = nal.strip_prefix(prefix) {
            nal = s;
        }
    }
    nal.strip_suffix(b"\x00\x00\x00\x01").unwrap_or(nal)
}

fn decode_sprop(v: &str) -> Result<Vec<Bytes>, Error> {
    v.split(',')
        .filter(|p| !p.is_empty())
        .map(|p| {
            let nal = base64::decode(p.trim())
                .map_err(|_| Error::Parse(format!("bad base64 in sprop value {:?}", p)))?;
            Ok(Bytes::copy_from_slice(strip_annexb(&nal)))
        })
        .collect()
}

/// A typed RTP payload format: one variant per supported codec, plus
/// `Generic` for everything else (which retains its raw attributes but
/// has no codec support).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Format {
    G711 {
        payload_type: u8,
        mu_law: bool,
        sample_rate: u32,
        channels: u16,
    },
    G722 {
        payload_type: u8,
    },
    G723 {
        payload_type: u8,
    },
    G726 {
        payload_type: u8,
        /// Bitrate in kbit/s: 16, 24, 32 or 40.
        rate: u8,
    },
    Opus {
        payload_type: u8,
        channels: u16,
    },
    Speex {
        payload_type: u8,
        sample_rate: u32,
        vbr: Option<bool>,
    },
    Ac3 {
        payload_type: u8,
        sample_rate: u32,
        channels: u16,
    },
    Vorbis {
        payload_type: u8,
        sample_rate: u32,
        channels: u16,
        /// The base64 `configuration` blob, kept verbatim.
        configuration: String,
    },
    Lpcm {
        payload_type: u8,
        bit_depth: u8,
        sample_rate: u32,
        channels: u16,
    },
    Mpeg1Audio,
    Mpeg1Video,
    MpegTs,
    Mjpeg,
    Mpeg4Video {
        payload_type: u8,
        profile_level_id: Option<u32>,
        config: Option<Bytes>,
    },
    Mpeg4Audio {
        payload_type: u8,
        profile_level_id: Option<u32>,
        config: AudioSpecificConfig,
        raw_config: Bytes,
        layout: AuHeaderLayout,
    },
    Mpeg4AudioLatm {
        payload_type: u8,
        profile_level_id: Option<u32>,
        cpresent: bool,
        config: Option<StreamMuxConfig>,
    },
    H264 {
        payload_type: u8,
        sps: Option<Bytes>,
        pps: Option<Bytes>,
        packetization_mode: u8,
    },
    H265 {
        payload_type: u8,
        vps: Option<Bytes>,
        sps: Option<Bytes>,
        pps: Option<Bytes>,
        max_don_diff: u32,
    },
    Av1 {
        payload_type: u8,
        profile: Option<u32>,
        level_idx: Option<u32>,
        tier: Option<u32>,
    },
    Vp8 {
        payload_type: u8,
        max_fr: Option<u32>,
        max_fs: Option<u32>,
    },
    Vp9 {
        payload_type: u8,
        max_fr: Option<u32>,
        max_fs: Option<u32>,
        profile_id: Option<u32>,
    },
    Klv {
        payload_type: u8,
    },
    OnvifMetadata {
        payload_type: u8,
        compression: CompressionType,
    },
    Generic {
        payload_type: u8,
        clock_rate: Option<u32>,
        rtpmap: Option<String>,
        fmtp: FmtpMap,
    },
}

impl Format {
    /// Builds a typed format from the SDP media description pieces:
    /// static payload types 0-34 first, then dynamic types by their
    /// lowercase rtpmap codec token, with `Generic` as the fallback.
    pub fn unmarshal(
        media_type: MediaType,
        payload_type: u8,
        rtpmap: Option<&str>,
        fmtp: &FmtpMap,
    ) -> Result<Format, Error> {
        // rtpmap: <encoding>/<clock rate>[/<encoding params>]
        let mut token = None;
        let mut clock_rate = None;
        let mut params: Option<&str> = None;
        if let Some(rtpmap) = rtpmap {
            let mut parts = rtpmap.trim().splitn(3, '/');
            token = parts.next().map(|t| t.to_ascii_lowercase());
            clock_rate = match parts.next() {
                Some(c) => Some(
                    c.parse::<u32>()
                        .map_err(|_| Error::Parse(format!("bad clock rate in rtpmap {:?}", rtpmap)))?,
                ),
                None => None,
            };
            params = parts.next();
        }
        let channels = params.and_then(|p| p.parse::<u16>().ok());

        match payload_type {
            0 => {
                return Ok(Format::G711 {
                    payload_type,
                    mu_law: true,
                    sample_rate: 8000,
                    channels: 1,
                })
            }
            8 => {
                return Ok(Format::G711 {
                    payload_type,
                    mu_law: false,
                    sample_rate: 8000,
                    channels: 1,
                })
            }
            4 => return Ok(Format::G723 { payload_type }),
            9 => return Ok(Format::G722 { payload_type }),
            10 | 11 => {
                return Ok(Format::Lpcm {
                    payload_type,
                    bit_depth: 16,
                    sample_rate: 44_100,
                    channels: if payload_type == 10 { 2 } else { 1 },
                })
            }
            14 => return Ok(Format::Mpeg1Audio),
            26 => return Ok(Format::Mjpeg),
            32 => return Ok(Format::Mpeg1Video),
            33 => return Ok(Format::MpegTs),
            _ => {}
        }

        let token = match token.as_deref() {
            Some(t) => t,
            None => {
                return Ok(Format::Generic {
                    payload_type,
                    clock_rate,
                    rtpmap: rtpmap.map(|r| r.to_owned()),
                    fmtp: fmtp.clone(),
                })
            }
        };
        let clock = clock_rate.unwrap_or(90_000);

        let format = match (media_type, token) {
            (MediaType::Audio, "pcmu") => Format::G711 {
                payload_type,
                mu_law: true,
                sample_rate: clock,
                channels: channels.unwrap_or(1),
            },
            (MediaType::Audio, "pcma") => Format::G711 {
                payload_type,
                mu_law: false,
                sample_rate: clock,
                channels: channels.unwrap_or(1),
            },
            (MediaType::Audio, "g722") => Format::G722 { payload_type },
            (MediaType::Audio, "g723") => Format::G723 { payload_type },
            (MediaType::Audio, "g726-16") => Format::G726 { payload_type, rate: 16 },
            (MediaType::Audio, "g726-24") => Format::G726 { payload_type, rate: 24 },
            (MediaType::Audio, "g726-32") => Format::G726 { payload_type, rate: 32 },
            (MediaType::Audio, "g726-40") => Format::G726 { payload_type, rate: 40 },
            (MediaType::Audio, "opus") => Format::Opus {
                payload_type,
                channels: channels.unwrap_or(2),
            },
            (MediaType::Audio, "speex") => Format::Speex {
                payload_type,
                sample_rate: clock,
                vbr: fmtp_get(fmtp, "vbr").map(|v| v == "on"),
            },
            (MediaType::Audio, "ac3") => Format::Ac3 {
                payload_type,
                sample_rate: clock,
                channels: channels.unwrap_or(6),
            },
            (MediaType::Audio, "vorbis") => Format::Vorbis {
                payload_type,
                sample_rate: clock,
                channels: channels.unwrap_or(2),
                configuration: fmtp_get(fmtp, "configuration")
                    .ok_or_else(|| Error::Parse("Vorbis requires a configuration".to_owned()))?
                    .to_owned(),
            },
            (MediaType::Audio, "l8") => Format::Lpcm {
                payload_type,
                bit_depth: 8,
                sample_rate: clock,
                channels: channels.unwrap_or(1),
            },
            (MediaType::Audio, "l16") => Format::Lpcm {
                payload_type,
                bit_depth: 16,
                sample_rate: clock,
                channels: channels.unwrap_or(1),
            },
            (MediaType::Audio, "l24") => Format::Lpcm {
                payload_type,
                bit_depth: 24,
                sample_rate: clock,
                channels: channels.unwrap_or(1),
            },
            (MediaType::Audio, "mpa") => Format::Mpeg1Audio,
            (MediaType::Audio, "mpeg4-generic") => {
                let raw_config = fmtp_get(fmtp, "config")
                    .ok_or_else(|| Error::Parse("mpeg4-generic requires a config".to_owned()))?;
                let raw_config = Bytes::from(
                    hex::decode(raw_config)
                        .map_err(|_| Error::Parse("config has invalid hex encoding".to_owned()))?,
                );
                let config = AudioSpecificConfig::parse(&raw_config)?;
                let get_len = |key: &str, default: u8| -> Result<u8, Error> {
                    match fmtp_get(fmtp, key) {
                        None => Ok(default),
                        Some(v) => v
                            .parse()
                            .map_err(|_| Error::Parse(format!("bad {} {:?}", key, v))),
                    }
                };
                Format::Mpeg4Audio {
                    payload_type,
                    profile_level_id: fmtp_get(fmtp, "profile-level-id")
                        .and_then(|v| v.parse().ok()),
                    config,
                    raw_config,
                    layout: AuHeaderLayout {
                        size_length: get_len("sizelength", 13)?,
                        index_length: get_len("indexlength", 3)?,
                        index_delta_length: get_len("indexdeltalength", 3)?,
                    },
                }
            }
            (MediaType::Audio, "mp4a-latm") => {
                let cpresent = fmtp_get(fmtp, "cpresent") != Some("0");
                let config = match fmtp_get(fmtp, "config") {
                    Some(v) => {
                        let raw = hex::decode(v)
                            .map_err(|_| Error::Parse("config has invalid hex encoding".to_owned()))?;
                        Some(StreamMuxConfig::parse(&raw)?)
                    }
                    None => None,
                };
                if !cpresent && config.is_none() {
                    return Err(Error::Parse(
                        "cpresent=0 requires an out-of-band config".to_owned(),
                    ));
                }
                Format::Mpeg4AudioLatm {
                    payload_type,
                    profile_level_id: fmtp_get(fmtp, "profile-level-id")
                        .and_then(|v| v.parse().ok()),
                    cpresent,
                    config,
                }
            }
            (MediaType::Video, "jpeg") => Format::Mjpeg,
            (MediaType::Video, "mpv") => Format::Mpeg1Video,
            (MediaType::Video, "mp2t") | (MediaType::Audio, "mp2t") => Format::MpegTs,
            (MediaType::Video, "mp4v-es") => Format::Mpeg4Video {
                payload_type,
                profile_level_id: fmtp_get(fmtp, "profile-level-id").and_then(|v| v.parse().ok()),
                config: match fmtp_get(fmtp, "config") {
                    Some(v) => Some(Bytes::from(hex::decode(v).map_err(|_| {
                        Error::Parse("config has invalid hex encoding".to_owned())
                    })?)),
                    None => None,
                },
            },
            (MediaType::Video, "h264") => {
                let (mut sps, mut pps) = (None, None);
                if let Some(v) = fmtp_get(fmtp, "sprop-parameter-sets") {
                    let mut nals = decode_sprop(v)?.into_iter();
                    sps = nals.next().filter(|n| !n.is_empty());
                    pps = nals.next().filter(|n| !n.is_empty());
                }
                Format::H264 {
                    payload_type,
                    sps,
                    pps,
                    packetization_mode: fmtp_get(fmtp, "packetization-mode")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                }
            }
            (MediaType::Video, "h265") => {
                let one = |key: &str| -> Result<Option<Bytes>, Error> {
                    Ok(match fmtp_get(fmtp, key) {
                        Some(v) => decode_sprop(v)?.into_iter().next().filter(|n| !n.is_empty()),
                        None => None,
                    })
                };
                Format::H265 {
                    payload_type,
                    vps: one("sprop-vps")?,
                    sps: one("sprop-sps")?,
                    pps: one("sprop-pps")?,
                    max_don_diff: fmtp_get(fmtp, "sprop-max-don-diff")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                }
            }
            (MediaType::Video, "av1") => Format::Av1 {
                payload_type,
                profile: fmtp_get(fmtp, "profile").and_then(|v| v.parse().ok()),
                level_idx: fmtp_get(fmtp, "level-idx").and_then(|v| v.parse().ok()),
                tier: fmtp_get(fmtp, "tier").and_then(|v| v.parse().ok()),
            },
            (MediaType::Video, "vp8") => Format::Vp8 {
                payload_type,
                max_fr: fmtp_get(fmtp, "max-fr").and_then(|v| v.parse().ok()),
                max_fs: fmtp_get(fmtp, "max-fs").and_then(|v| v.parse().ok()),
            },
            (MediaType::Video, "vp9") => Format::Vp9 {
                payload_type,
                max_fr: fmtp_get(fmtp, "max-fr").and_then(|v| v.parse().ok()),
                max_fs: fmtp_get(fmtp, "max-fs").and_then(|v| v.parse().ok()),
                profile_id: fmtp_get(fmtp, "profile-id").and_then(|v| v.parse().ok()),
            },
            (MediaType::Application, "smpte336m") => Format::Klv { payload_type },
            (MediaType::Application, "vnd.onvif.metadata") => Format::OnvifMetadata {
                payload_type,
                compression: CompressionType::Uncompressed,
            },
            (MediaType::Application, "vnd.onvif.metadata.gzip") => Format::OnvifMetadata {
                payload_type,
                compression: CompressionType::GzipCompressed,
            },
            (MediaType::Application, "vnd.onvif.metadata.exi.onvif") => Format::OnvifMetadata {
                payload_type,
                compression: CompressionType::ExiDefault,
            },
            (MediaType::Application, "vnd.onvif.metadata.exi.ext") => Format::OnvifMetadata {
                payload_type,
                compression: CompressionType::ExiInBand,
            },
            _ => Format::Generic {
                payload_type,
                clock_rate,
                rtpmap: rtpmap.map(|r| r.to_owned()),
                fmtp: fmtp.clone(),
            },
        };
        Ok(format)
    }

    pub fn payload_type(&self) -> u8 {
        match *self {
            Format::G711 { payload_type, .. }
            | Format::G722 { payload_type }
            | Format::G723 { payload_type }
            | Format::G726 { payload_type, .. }
            | Format::Opus { payload_type, .. }
            | Format::Speex { payload_type, .. }
            | Format::Ac3 { payload_type, .. }
            | Format::Vorbis { payload_type, .. }
            | Format::Lpcm { payload_type, .. }
            | Format::Mpeg4Video { payload_type, .. }
            | Format::Mpeg4Audio { payload_type, .. }
            | Format::Mpeg4AudioLatm { payload_type, .. }
            | Format::H264 { payload_type, .. }
            | Format::H265 { payload_type, .. }
            | Format::Av1 { payload_type, .. }
            | Format::Vp8 { payload_type, .. }
            | Format::Vp9 { payload_type, .. }
            | Format::Klv { payload_type }
            | Format::OnvifMetadata { payload_type, .. }
            | Format::Generic { payload_type, .. } => payload_type,
            Format::Mpeg1Audio => 14,
            Format::Mjpeg => 26,
            Format::Mpeg1Video => 32,
            Format::MpegTs => 33,
        }
    }

    /// The codec token used in `a=rtpmap:`, in its canonical casing.
    pub fn codec_name(&self) -> &'static str {
        match self {
            Format::G711 { mu_law: true, .. } => "PCMU",
            Format::G711 { mu_law: false, .. } => "PCMA",
            Format::G722 { .. } => "G722",
            Format::G723 { .. } => "G723",
            Format::G726 { rate: 16, .. } => "G726-16",
            Format::G726 { rate: 24, .. } => "G726-24",
            Format::G726 { rate: 40, .. } => "G726-40",
            Format::G726 { .. } => "G726-32",
            Format::Opus { .. } => "opus",
            Format::Speex { .. } => "speex",
            Format::Ac3 { .. } => "ac3",
            Format::Vorbis { .. } => "VORBIS",
            Format::Lpcm { bit_depth: 8, .. } => "L8",
            Format::Lpcm { bit_depth: 24, .. } => "L24",
            Format::Lpcm { .. } => "L16",
            Format::Mpeg1Audio => "MPA",
            Format::Mpeg1Video => "MPV",
            Format::MpegTs => "MP2T",
            Format::Mjpeg => "JPEG",
            Format::Mpeg4Video { .. } => "MP4V-ES",
            Format::Mpeg4Audio { .. } => "mpeg4-generic",
            Format::Mpeg4AudioLatm { .. } => "MP4A-LATM",
            Format::H264 { .. } => "H264",
            Format::H265 { .. } => "H265",
            Format::Av1 { .. } => "AV1",
            Format::Vp8 { .. } => "VP8",
            Format::Vp9 { .. } => "VP9",
            Format::Klv { .. } => "SMPTE336M",
            Format::OnvifMetadata { .. } => "VND.ONVIF.METADATA",
            Format::Generic { .. } => "",
        }
    }

    /// The RTP clock rate in Hz.
    pub fn clock_rate(&self) -> u32 {
        match self {
            Format::G711 { sample_rate, .. } => *sample_rate,
            // G.722's RTP clock is 8 kHz for historical reasons (RFC 3551
            // section 4.5.2) even though it samples at 16 kHz.
            Format::G722 { .. } => 8000,
            Format::G723 { .. } => 8000,
            Format::G726 { .. } => 8000,
            Format::Opus { .. } => 48_000,
            Format::Speex { sample_rate, .. } => *sample_rate,
            Format::Ac3 { sample_rate, .. } => *sample_rate,
            Format::Vorbis { sample_rate, .. } => *sample_rate,
            Format::Lpcm { sample_rate, .. } => *sample_rate,
            Format::Mpeg1Audio | Format::Mpeg1Video | Format::MpegTs => 90_000,
            Format::Mjpeg => 90_000,
            Format::Mpeg4Video { .. } => 90_000,
            Format::Mpeg4Audio { config, .. } => config.sample_rate,
            // With an out-of-band StreamMuxConfig the clock follows it;
            // otherwise RFC 6416's 90 kHz default applies.
            Format::Mpeg4AudioLatm { config, .. } => {
                config.as_ref().map(|c| c.config.sample_rate).unwrap_or(90_000)
            }
            Format::H264 { .. } | Format::H265 { .. } => 90_000,
            Format::Av1 { .. } | Format::Vp8 { .. } | Format::Vp9 { .. } => 90_000,
            Format::Klv { .. } => 90_000,
            Format::OnvifMetadata { .. } => 90_000,
            Format::Generic { clock_rate, .. } => clock_rate.unwrap_or(90_000),
        }
    }

    fn channels(&self) -> Option<u16> {
        match self {
            Format::G711 { channels, .. } if *channels > 1 => Some(*channels),
            Format::Opus { .. } => Some(2), // always "/2" per RFC 7587
            Format::Ac3 { channels, .. } => Some(*channels),
            Format::Vorbis { channels, .. } => Some(*channels),
            Format::Lpcm { channels, .. } => Some(*channels),
            Format::Mpeg4AudioLatm { config, .. } => Some(
                config
                    .as_ref()
                    .map(|c| u16::from(c.config.channels))
                    .unwrap_or(1),
            ),
            _ => None,
        }
    }

    /// The `a=rtpmap:` value (without the payload type prefix), or `None`
    /// for formats fully described by their static payload type.
    pub fn rtpmap(&self) -> Option<String> {
        match self {
            Format::Generic { rtpmap, .. } => rtpmap.clone(),
            Format::Mpeg1Audio | Format::Mpeg1Video | Format::MpegTs => None,
            _ => {
                let mut s = format!("{}/{}", self.codec_name(), self.clock_rate());
                if let Some(c) = self.channels() {
                    s.push_str(&format!("/{}", c));
                }
                Some(s)
            }
        }
    }

    /// The `a=fmtp:` value (without the payload type prefix). Multi-byte
    /// hex values are uppercased on emit.
    pub fn fmtp(&self) -> Option<String> {
        let join = |pairs: Vec<(String, String)>| -> Option<String> {
            if pairs.is_empty() {
                return None;
            }
            Some(
                pairs
                    .into_iter()
                    .map(|(k, v)| if v.is_empty() { k } else { format!("{}={}", k, v) })
                    .collect::<Vec<_>>()
                    .join(";"),
            )
        };
        match self {
            Format::Speex { vbr, .. } => join(
                vbr.map(|v| {
                    vec![(
                        "vbr".to_owned(),
                        if v { "on".to_owned() } else { "off".to_owned() },
                    )]
                })
                .unwrap_or_default(),
            ),
            Format::Vorbis { configuration, .. } => join(vec![(
                "configuration".to_owned(),
                configuration.clone(),
            )]),
            Format::Mpeg4Video {
                profile_level_id,
                config,
                ..
            } => {
                let mut pairs = Vec::new();
                if let Some(p) = profile_level_id {
                    pairs.push(("profile-level-id".to_owned(), p.to_string()));
                }
                if let Some(c) = config {
                    pairs.push(("config".to_owned(), hex::encode_upper(c)));
                }
                join(pairs)
            }
            Format::Mpeg4Audio {
                profile_level_id,
                raw_config,
                layout,
                ..
            } => {
                let mut pairs = vec![
                    (
                        "profile-level-id".to_owned(),
                        profile_level_id.unwrap_or(1).to_string(),
                    ),
                    ("mode".to_owned(), "AAC-hbr".to_owned()),
                    ("sizelength".to_owned(), layout.size_length.to_string()),
                    ("indexlength".to_owned(), layout.index_length.to_string()),
                    (
                        "indexdeltalength".to_owned(),
                        layout.index_delta_length.to_string(),
                    ),
                ];
                pairs.push(("config".to_owned(), hex::encode_upper(raw_config)));
                join(pairs)
            }
            Format::Mpeg4AudioLatm {
                profile_level_id,
                cpresent,
                config,
                ..
            } => {
                let object = config
                    .as_ref()
                    .map(|c| c.config.audio_object_type)
                    .unwrap_or(2);
                let mut pairs = vec![
                    (
                        "profile-level-id".to_owned(),
                        profile_level_id.unwrap_or(30).to_string(),
                    ),
                    ("object".to_owned(), object.to_string()),
                ];
                if !cpresent {
                    pairs.push(("cpresent".to_owned(), "0".to_owned()));
                }
                if let Some(c) = config {
                    pairs.push(("config".to_owned(), hex::encode_upper(c.marshal())));
                }
                join(pairs)
            }
            Format::H264 {
                sps,
                pps,
                packetization_mode,
                ..
            } => {
                let mut pairs = vec![(
                    "packetization-mode".to_owned(),
                    packetization_mode.to_string(),
                )];
                if let (Some(sps), Some(pps)) = (sps, pps) {
                    if sps.len() >= 4 {
                        pairs.push((
                            "profile-level-id".to_owned(),
                            format!("{:02X}{:02X}{:02X}", sps[1], sps[2], sps[3]),
                        ));
                    }
                    pairs.push((
                        "sprop-parameter-sets".to_owned(),
                        format!("{},{}", base64::encode(sps), base64::encode(pps)),
                    ));
                }
                join(pairs)
            }
            Format::H265 {
                vps,
                sps,
                pps,
                max_don_diff,
                ..
            } => {
                let mut pairs = Vec::new();
                if let Some(v) = vps {
                    pairs.push(("sprop-vps".to_owned(), base64::encode(v)));
                }
                if let Some(s) = sps {
                    pairs.push(("sprop-sps".to_owned(), base64::encode(s)));
                }
                if let Some(p) = pps {
                    pairs.push(("sprop-pps".to_owned(), base64::encode(p)));
                }
                if *max_don_diff > 0 {
                    pairs.push(("sprop-max-don-diff".to_owned(), max_don_diff.to_string()));
                }
                join(pairs)
            }
            Format::Av1 {
                profile,
                level_idx,
                tier,
                ..
            } => {
                let mut pairs = Vec::new();
                if let Some(p) = profile {
                    pairs.push(("profile".to_owned(), p.to_string()));
                }
                if let Some(l) = level_idx {
                    pairs.push(("level-idx".to_owned(), l.to_string()));
                }
                if let Some(t) = tier {
                    pairs.push(("tier".to_owned(), t.to_string()));
                }
                join(pairs)
            }
            Format::Vp8 { max_fr, max_fs, .. } => {
                let mut pairs = Vec::new();
                if let Some(v) = max_fr {
                    pairs.push(("max-fr".to_owned(), v.to_string()));
                }
                if let Some(v) = max_fs {
                    pairs.push(("max-fs".to_owned(), v.to_string()));
                }
                join(pairs)
            }
            Format::Vp9 {
                max_fr,
                max_fs,
                profile_id,
                ..
            } => {
                let mut pairs = Vec::new();
                if let Some(v) = max_fr {
                    pairs.push(("max-fr".to_owned(), v.to_string()));
                }
                if let Some(v) = max_fs {
                    pairs.push(("max-fs".to_owned(), v.to_string()));
                }
                if let Some(v) = profile_id {
                    pairs.push(("profile-id".to_owned(), v.to_string()));
                }
                join(pairs)
            }
            Format::Generic { fmtp, .. } => join(fmtp.clone()),
            _ => None,
        }
    }

    /// Whether an RTP packet of this format certainly carries
    /// PTS == DTS content. True for audio and intra-only codecs; H.26x
    /// and MPEG video inspect the payload for sync frames.
    pub fn pts_equals_dts(&self, pkt: &crate::rtp::Packet) -> bool {
        match self {
            Format::H264 { .. } => crate::codec::h264::packet_pts_equals_dts(&pkt.payload),
            Format::H265 { .. } => crate::codec::h265::packet_pts_equals_dts(&pkt.payload),
            Format::Mpeg1Video => crate::codec::mpeg1_video::packet_pts_equals_dts(&pkt.payload),
            Format::Mpeg4Video { .. } => {
                crate::codec::mpeg4_video::packet_pts_equals_dts(&pkt.payload)
            }
            _ => true,
        }
    }

    /// Builds the packetizer for this format.
    pub fn create_encoder(
        &self,
        ssrc: Option<u32>,
        initial_seq: Option<u16>,
        payload_max_size: Option<usize>,
    ) -> Result<codec::Packetizer, Error> {
        use codec::Packetizer as P;
        let pt = self.payload_type();
        Ok(match self {
            Format::G711 { .. }
            | Format::G722 { .. }
            | Format::G723 { .. }
            | Format::G726 { .. }
            | Format::Opus { .. }
            | Format::Speex { .. }
            | Format::Ac3 { .. }
            | Format::Vorbis { .. } => P::SimpleAudio(codec::simple_audio::Packetizer::new(
                pt,
                ssrc,
                initial_seq,
                payload_max_size,
            )),
            Format::Lpcm {
                bit_depth,
                channels,
                ..
            } => P::Lpcm(codec::lpcm::Packetizer::new(
                pt,
                *bit_depth,
                *channels,
                ssrc,
                initial_seq,
                payload_max_size,
            )),
            Format::Mpeg1Audio => P::Mpeg1Audio(codec::mpeg1_audio::Packetizer::new(
                ssrc,
                initial_seq,
                payload_max_size,
            )),
            Format::Mpeg1Video => P::Mpeg1Video(codec::mpeg1_video::Packetizer::new(
                ssrc,
                initial_seq,
                payload_max_size,
            )),
            Format::MpegTs => P::MpegTs(codec::mpegts::Packetizer::new(
                ssrc,
                initial_seq,
                payload_max_size,
            )),
            Format::Mjpeg => P::Mjpeg(codec::mjpeg::Packetizer::new(
                ssrc,
                initial_seq,
                payload_max_size,
            )),
            Format::Mpeg4Video { .. } => P::Mpeg4Video(codec::mpeg4_video::Packetizer::new(
                pt,
                ssrc,
                initial_seq,
                payload_max_size,
            )),
            Format::Mpeg4Audio { layout, .. } => P::Aac(codec::aac::Packetizer::new(
                pt,
                *layout,
                ssrc,
                initial_seq,
                payload_max_size,
            )),
            Format::Mpeg4AudioLatm { .. } => P::Latm(codec::latm::Packetizer::new(
                pt,
                ssrc,
                initial_seq,
                payload_max_size,
            )),
            Format::H264 { .. } => P::H264(codec::h264::Packetizer::new(
                pt,
                ssrc,
                initial_seq,
                payload_max_size,
            )),
            Format::H265 { .. } => P::H265(codec::h265::Packetizer::new(
                pt,
                ssrc,
                initial_seq,
                payload_max_size,
            )),
            Format::Av1 { .. } => P::Av1(codec::av1::Packetizer::new(
                pt,
                ssrc,
                initial_seq,
                payload_max_size,
            )),
            Format::Vp8 { .. } => P::Vp8(codec::vp8::Packetizer::new(
                pt,
                ssrc,
                initial_seq,
                payload_max_size,
            )),
            Format::Vp9 { .. } => P::Vp9(codec::vp9::Packetizer::new(
                pt,
                ssrc,
                initial_seq,
                payload_max_size,
            )),
            Format::Klv { .. } => P::Klv(codec::klv::Packetizer::new(
                pt,
                ssrc,
                initial_seq,
                payload_max_size,
            )),
            Format::OnvifMetadata { .. } => P::Onvif(codec::onvif::Packetizer::new(
                pt,
                ssrc,
                initial_seq,
                payload_max_size,
            )),
            Format::Generic { .. } => {
                return Err(Error::UnsupportedFormat(
                    "no encoder for generic formats".to_owned(),
                ))
            }
        })
    }

    /// Builds the depacketizer for this format.
    pub fn create_decoder(&self) -> Result<codec::Depacketizer, Error> {
        use codec::Depacketizer as D;
        Ok(match self {
            Format::G723 { .. } => {
                D::SimpleAudio(codec::simple_audio::Depacketizer::new(Validation::G723))
            }
            Format::G711 { .. }
            | Format::G722 { .. }
            | Format::G726 { .. }
            | Format::Opus { .. }
            | Format::Speex { .. }
            | Format::Ac3 { .. }
            | Format::Vorbis { .. } => {
                D::SimpleAudio(codec::simple_audio::Depacketizer::new(Validation::None))
            }
            Format::Lpcm {
                bit_depth,
                channels,
                ..
            } => D::Lpcm(codec::lpcm::Depacketizer::new(*bit_depth, *channels)),
            Format::Mpeg1Audio => D::Mpeg1Audio(codec::mpeg1_audio::Depacketizer::new()),
            Format::Mpeg1Video => D::Mpeg1Video(codec::mpeg1_video::Depacketizer::new()),
            Format::MpegTs => D::MpegTs(codec::mpegts::Depacketizer::new()),
            Format::Mjpeg => D::Mjpeg(codec::mjpeg::Depacketizer::new()),
            Format::Mpeg4Video { .. } => D::Mpeg4Video(codec::mpeg4_video::Depacketizer::new()),
            Format::Mpeg4Audio { layout, .. } => D::Aac(codec::aac::Depacketizer::new(*layout)),
            Format::Mpeg4AudioLatm { .. } => D::Latm(codec::latm::Depacketizer::new()),
            Format::H264 { .. } => D::H264(codec::h264::Depacketizer::new()),
            Format::H265 { max_don_diff, .. } => {
                D::H265(codec::h265::Depacketizer::new(*max_don_diff))
            }
            Format::Av1 { .. } => D::Av1(codec::av1::Depacketizer::new()),
            Format::Vp8 { .. } => D::Vp8(codec::vp8::Depacketizer::new()),
            Format::Vp9 { .. } => D::Vp9(codec::vp9::Depacketizer::new()),
            Format::Klv { .. } => D::Klv(codec::klv::Depacketizer::new()),
            Format::OnvifMetadata { compression, .. } => {
                D::Onvif(codec::onvif::Depacketizer::new(*compression))
            }
            Format::Generic { .. } => {
                return Err(Error::UnsupportedFormat(
                    "no decoder for generic formats".to_owned(),
                ))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_payload_types() {
        let f = Format::unmarshal(MediaType::Audio, 0, None, &Vec::new()).unwrap();
        assert!(matches!(f, Format::G711 { mu_law: true, .. }));
        assert_eq!(f.clock_rate(), 8000);
        assert_eq!(f.rtpmap().as_deref(), Some("PCMU/8000"));

        let f = Format::unmarshal(MediaType::Video, 33, None, &Vec::new()).unwrap();
        assert!(matches!(f, Format::MpegTs));
        assert_eq!(f.rtpmap(), None);

        let f = Format::unmarshal(MediaType::Audio, 10, None, &Vec::new()).unwrap();
        match f {
            Format::Lpcm {
                bit_depth,
                sample_rate,
                channels,
                ..
            } => {
                assert_eq!((bit_depth, sample_rate, channels), (16, 44_100, 2));
            }
            o => panic!("unexpected {:?}", o),
        }
    }

    #[test]
    fn h264_fmtp_round_trip() {
        let sps = base64::encode([0x67, 0x64, 0x00, 0x29, 0xac, 0x2c]);
        let pps = base64::encode([0x68, 0xee, 0x3c, 0xb0]);
        let fmtp = parse_fmtp(&format!(
            "packetization-mode=1; profile-level-id=640029; sprop-parameter-sets={},{}",
            sps, pps
        ));
        let f = Format::unmarshal(MediaType::Video, 96, Some("H264/90000"), &fmtp).unwrap();
        match &f {
            Format::H264 {
                sps,
                pps,
                packetization_mode,
                ..
            } => {
                assert_eq!(*packetization_mode, 1);
                assert!(sps.is_some());
                assert!(pps.is_some());
            }
            o => panic!("unexpected {:?}", o),
        }
        assert_eq!(f.rtpmap().as_deref(), Some("H264/90000"));
        let emitted = f.fmtp().unwrap();
        assert!(emitted.contains("packetization-mode=1"));
        assert!(emitted.contains("sprop-parameter-sets="));
    }

    #[test]
    fn sprop_annexb_prefixes_stripped() {
        // A camera that wraps its SPS in Annex-B start codes.
        let sps = base64::encode([0x00, 0x00, 0x00, 0x01, 0x67, 0x64, 0x00, 0x29]);
        let pps = base64::encode([0x68, 0xee, 0x3c, 0x80]);
        let fmtp = parse_fmtp(&format!("sprop-parameter-sets={},{}", sps, pps));
        let f = Format::unmarshal(MediaType::Video, 96, Some("H264/90000"), &fmtp).unwrap();
        match f {
            Format::H264 { sps: Some(s), .. } => {
                assert_eq!(&s[..], &[0x67, 0x64, 0x00, 0x29])
            }
            o => panic!("unexpected {:?}", o),
        }
    }

    #[test]
    fn fmtp_keys_case_insensitive() {
        let fmtp = parse_fmtp("SizeLength=13;IndexLength=3;IndexDeltaLength=3;Mode=AAC-hbr;Config=1188");
        let f = Format::unmarshal(
            MediaType::Audio,
            97,
            Some("mpeg4-generic/48000/1"),
            &fmtp,
        )
        .unwrap();
        match &f {
            Format::Mpeg4Audio { config, .. } => assert_eq!(config.sample_rate, 48_000),
            o => panic!("unexpected {:?}", o),
        }
        // Hex is uppercased on emit.
        assert!(f.fmtp().unwrap().contains("config=1188".to_uppercase().as_str()));
    }

    #[test]
    fn latm_requires_config_when_cpresent_0() {
        let fmtp = parse_fmtp("cpresent=0");
        assert!(Format::unmarshal(MediaType::Audio, 96, Some("MP4A-LATM/48000/2"), &fmtp).is_err());

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
        let fmtp = parse_fmtp(&format!("cpresent=0;config={}", hex::encode(smc.marshal())));
        let f = Format::unmarshal(MediaType::Audio, 96, Some("MP4A-LATM/48000/2"), &fmtp).unwrap();
        assert_eq!(f.clock_rate(), 48_000);
        assert_eq!(f.rtpmap().as_deref(), Some("MP4A-LATM/48000/2"));
    }

    #[test]
    fn unknown_formats_fall_back_to_generic() {
        let fmtp = parse_fmtp("apt=96");
        let f = Format::unmarshal(MediaType::Video, 97, Some("rtx/90000"), &fmtp).unwrap();
        match &f {
            Format::Generic {
                clock_rate, rtpmap, ..
            } => {
                assert_eq!(*clock_rate, Some(90_000));
                assert_eq!(rtpmap.as_deref(), Some("rtx/90000"));
            }
            o => panic!("unexpected {:?}", o),
        }
        assert!(f.create_decoder().is_err());
    }
}
