//! Mapping between SDP session descriptions and the library's typed view
//! of a presentation: a list of medias, each with control URL and typed
//! formats. Inbound SDP is parsed with the `sdp` crate; outbound SDP is
//! generated from the format registry's rtpmap/fmtp round-trip.

use std::convert::TryFrom;
use std::fmt::Write as _;

use bytes::Buf;
use url::Url;

use crate::format::{parse_fmtp, FmtpMap, Format, MediaType};
use crate::Error;

/// One `m=` section.
#[derive(Clone, Debug)]
pub struct MediaInfo {
    pub media_type: MediaType,

    /// Reverse-direction media (two-way talk): marked in SDP with
    /// `a=sendonly` on a server-to-client audio media or an
    /// `a=BACKCHANNEL` attribute.
    pub is_back_channel: bool,

    /// The raw `a=control:` value, kept for RTP-Info generation.
    pub control: String,

    pub formats: Vec<Format>,
}

impl MediaInfo {
    pub fn new(media_type: MediaType, formats: Vec<Format>) -> Self {
        MediaInfo {
            media_type,
            is_back_channel: false,
            control: String::new(),
            formats,
        }
    }

    /// Resolves this media's control attribute against the base URL.
    pub fn control_url(&self, base_url: &Url) -> Result<Url, Error> {
        join_control(base_url, &self.control)
    }
}

/// A parsed presentation: the DESCRIBE/ANNOUNCE payload plus the URLs
/// needed to drive it.
#[derive(Clone, Debug)]
pub struct Presentation {
    /// The `Content-Base`, `Content-Location`, or request URL, as
    /// specified in RFC 2326 section C.1.1.
    pub base_url: Url,

    /// The aggregate control URL (`a=control:` at session level).
    pub control: Url,

    pub medias: Vec<MediaInfo>,

    /// True iff the DESCRIBE response carried `x-Accept-Dynamic-Rate: 1`
    /// (a camera dialect for receiver-paced interleaved delivery).
    pub accept_dynamic_rate: bool,
}

/// Resolves a control attribute against a base URL; `*` means the base
/// itself.
pub fn join_control(base_url: &Url, control: &str) -> Result<Url, Error> {
    if control.is_empty() || control == "*" {
        return Ok(base_url.clone());
    }
    base_url.join(control).map_err(|_| {
        Error::Parse(format!(
            "unable to join base url {} with control url {:?}",
            base_url, control
        ))
    })
}

fn parse_media(
    media_description: &sdp::media_description::MediaDescription,
) -> Result<MediaInfo, Error> {
    // https://tools.ietf.org/html/rfc8866#section-5.14: the proto of an
    // RTP-based media contains an "RTP" component ("RTP/AVP",
    // "TCP/RTP/AVP", ...).
    if !media_description
        .media_name
        .protos
        .iter()
        .any(|p| p == "RTP")
    {
        return Err(Error::Parse("expected RTP-based proto".to_owned()));
    }
    let media_type = match media_description.media_name.media.as_str() {
        "video" => MediaType::Video,
        "audio" => MediaType::Audio,
        "application" => MediaType::Application,
        o => return Err(Error::Parse(format!("unknown media type {:?}", o))),
    };

    let mut control = String::new();
    let mut is_back_channel = false;
    let mut rtpmaps: Vec<(u8, String)> = Vec::new();
    let mut fmtps: Vec<(u8, FmtpMap)> = Vec::new();
    for a in &media_description.attributes {
        match a.key.as_str() {
            "control" => control = a.value.clone().unwrap_or_default(),
            "sendonly" => {
                // On a server-to-client description, a sendonly audio
                // media is the camera's speaker.
                if media_type == MediaType::Audio {
                    is_back_channel = true;
                }
            }
            "BACKCHANNEL" | "backchannel" => is_back_channel = true,
            "rtpmap" | "fmtp" => {
                let v = a
                    .value
                    .as_ref()
                    .ok_or_else(|| Error::Parse(format!("{} attribute with no value", a.key)))?;
                let (pt, rest) = v
                    .split_once(' ')
                    .ok_or_else(|| Error::Parse(format!("invalid {} attribute", a.key)))?;
                let pt = pt
                    .parse::<u8>()
                    .map_err(|_| Error::Parse(format!("bad payload type in {}", a.key)))?;
                if a.key == "rtpmap" {
                    rtpmaps.push((pt, rest.to_owned()));
                } else {
                    fmtps.push((pt, parse_fmtp(rest)));
                }
            }
            _ => {}
        }
    }

    let mut formats = Vec::new();
    for fmt in &media_description.media_name.formats {
        let payload_type = match fmt.parse::<u8>() {
            Ok(pt) if pt & 0x80 == 0 => pt,
            // Workaround for cameras that write `smart/1/90000` in the
            // m= line: the real payload type is in the rtpmap.
            _ if fmt.starts_with("smart/") => match rtpmaps.first() {
                Some(&(pt, _)) => pt,
                None => {
                    return Err(Error::Parse(format!(
                        "can't resolve smart payload type {:?} without an rtpmap",
                        fmt
                    )))
                }
            },
            _ => return Err(Error::Parse(format!("invalid payload type {:?}", fmt))),
        };
        let rtpmap = rtpmaps
            .iter()
            .find(|(pt, _)| *pt == payload_type)
            .map(|(_, v)| v.as_str());
        let empty = FmtpMap::new();
        let fmtp = fmtps
            .iter()
            .find(|(pt, _)| *pt == payload_type)
            .map(|(_, v)| v)
            .unwrap_or(&empty);
        formats.push(Format::unmarshal(media_type, payload_type, rtpmap, fmtp)?);
    }
    if formats.is_empty() {
        return Err(Error::Parse("media has no formats".to_owned()));
    }

    Ok(MediaInfo {
        media_type,
        is_back_channel,
        control,
        formats,
    })
}

impl Presentation {
    /// Parses an SDP body (from DESCRIBE or ANNOUNCE). `base_url` is the
    /// already-resolved content base.
    pub fn parse(base_url: Url, body: &[u8]) -> Result<Presentation, Error> {
        let mut cursor = std::io::Cursor::new(body);
        let sdp = sdp::session_description::SessionDescription::unmarshal(&mut cursor)
            .map_err(|e| Error::Parse(format!("bad SDP: {}", e)))?;
        if cursor.has_remaining() {
            return Err(Error::Parse(format!(
                "garbage after sdp: {:?}",
                &body[usize::try_from(cursor.position()).unwrap_or(0)..]
            )));
        }

        let mut control = None;
        for a in &sdp.attributes {
            if a.key == "control" {
                control = a
                    .value
                    .as_deref()
                    .map(|c| join_control(&base_url, c))
                    .transpose()?;
                break;
            }
        }
        let control = control.unwrap_or_else(|| base_url.clone());

        let medias = sdp
            .media_descriptions
            .iter()
            .enumerate()
            .map(|(i, m)| {
                parse_media(m).map_err(|e| Error::Parse(format!("media {}: {}", i, e)))
            })
            .collect::<Result<Vec<MediaInfo>, Error>>()?;
        if medias.is_empty() {
            return Err(Error::Parse("SDP has no medias".to_owned()));
        }

        Ok(Presentation {
            base_url,
            control,
            medias,
            accept_dynamic_rate: false,
        })
    }

    /// Generates the SDP body a server sends in a DESCRIBE response.
    /// Controls are rewritten as `trackID=<n>` when not already set.
    pub fn marshal_sdp(name: &str, medias: &[MediaInfo]) -> String {
        let mut out = String::new();
        out.push_str("v=0\r\n");
        out.push_str("o=- 0 0 IN IP4 0.0.0.0\r\n");
        let _ = write!(out, "s={}\r\n", if name.is_empty() { "Stream" } else { name });
        out.push_str("c=IN IP4 0.0.0.0\r\n");
        out.push_str("t=0 0\r\n");
        for (i, media) in medias.iter().enumerate() {
            let pts: Vec<String> = media
                .formats
                .iter()
                .map(|f| f.payload_type().to_string())
                .collect();
            let _ = write!(out, "m={} 0 RTP/AVP {}\r\n", media.media_type, pts.join(" "));
            if media.is_back_channel {
                out.push_str("a=sendonly\r\n");
                out.push_str("a=BACKCHANNEL:1\r\n");
            }
            if media.control.is_empty() {
                let _ = write!(out, "a=control:trackID={}\r\n", i);
            } else {
                let _ = write!(out, "a=control:{}\r\n", media.control);
            }
            for f in &media.formats {
                if let Some(rtpmap) = f.rtpmap() {
                    let _ = write!(out, "a=rtpmap:{} {}\r\n", f.payload_type(), rtpmap);
                }
                if let Some(fmtp) = f.fmtp() {
                    let _ = write!(out, "a=fmtp:{} {}\r\n", f.payload_type(), fmtp);
                }
            }
        }
        out
    }

    /// Finds the media whose resolved control URL matches `url`.
    pub fn media_by_control_url(&self, url: &Url) -> Option<usize> {
        self.medias.iter().position(|m| {
            m.control_url(&self.base_url)
                .map(|u| &u == url)
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAHUA_SDP: &[u8] = b"v=0\r\n\
o=- 2251938202 2251938202 IN IP4 0.0.0.0\r\n\
s=Media Server\r\n\
c=IN IP4 0.0.0.0\r\n\
t=0 0\r\n\
a=control:*\r\n\
a=packetization-supported:DH\r\n\
m=video 0 RTP/AVP 96\r\n\
a=control:trackID=0\r\n\
a=framerate:25.000000\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1;profile-level-id=64001E;sprop-parameter-sets=Z2QAHqwsaoLA9puCgIKgAAB9IAAdTAHiRLLA,aO48sA==\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=control:trackID=1\r\n\
a=rtpmap:97 mpeg4-generic/48000\r\n\
a=fmtp:97 streamtype=5;profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config=1188\r\n\
m=audio 0 RTP/AVP 8\r\n\
a=control:trackID=2\r\n\
a=sendonly\r\n\
a=rtpmap:8 PCMA/8000\r\n";

    #[test]
    fn parse_dahua_describe() {
        let base = Url::parse("rtsp://192.168.5.111:554/cam/realmonitor/").unwrap();
        let p = Presentation::parse(base.clone(), DAHUA_SDP).unwrap();
        assert_eq!(p.control, base);
        assert_eq!(p.medias.len(), 3);

        assert_eq!(p.medias[0].media_type, MediaType::Video);
        assert!(!p.medias[0].is_back_channel);
        match &p.medias[0].formats[0] {
            Format::H264 {
                payload_type,
                sps,
                pps,
                packetization_mode,
            } => {
                assert_eq!(*payload_type, 96);
                assert_eq!(*packetization_mode, 1);
                assert!(sps.is_some() && pps.is_some());
            }
            o => panic!("unexpected {:?}", o),
        }
        assert_eq!(
            p.medias[0].control_url(&p.base_url).unwrap().as_str(),
            "rtsp://192.168.5.111:554/cam/realmonitor/trackID=0"
        );

        assert_eq!(p.medias[1].formats[0].clock_rate(), 48_000);

        // The sendonly PCMA media is the camera's talkback speaker.
        assert!(p.medias[2].is_back_channel);
        assert!(matches!(
            p.medias[2].formats[0],
            Format::G711 { mu_law: false, .. }
        ));
    }

    #[test]
    fn smart_payload_type_workaround() {
        let sdp = b"v=0\r\n\
o=- 0 0 IN IP4 0.0.0.0\r\n\
s=x\r\n\
c=IN IP4 0.0.0.0\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP smart/1/90000\r\n\
a=control:trackID=0\r\n\
a=rtpmap:96 H264/90000\r\n";
        let base = Url::parse("rtsp://example/stream/").unwrap();
        let p = Presentation::parse(base, sdp).unwrap();
        assert_eq!(p.medias[0].formats[0].payload_type(), 96);
        assert!(matches!(p.medias[0].formats[0], Format::H264 { .. }));
    }

    #[test]
    fn sdp_round_trip() {
        let medias = vec![
            MediaInfo::new(
                MediaType::Video,
                vec![Format::H264 {
                    payload_type: 96,
                    sps: None,
                    pps: None,
                    packetization_mode: 1,
                }],
            ),
            MediaInfo::new(
                MediaType::Audio,
                vec![Format::G711 {
                    payload_type: 0,
                    mu_law: true,
                    sample_rate: 8000,
                    channels: 1,
                }],
            ),
        ];
        let body = Presentation::marshal_sdp("test", &medias);
        let base = Url::parse("rtsp://example/stream/").unwrap();
        let p = Presentation::parse(base, body.as_bytes()).unwrap();
        assert_eq!(p.medias.len(), 2);
        assert!(matches!(p.medias[0].formats[0], Format::H264 { .. }));
        assert_eq!(p.medias[0].control, "trackID=0");
        assert!(matches!(
            p.medias[1].formats[0],
            Format::G711 { mu_law: true, .. }
        ));
    }
}
