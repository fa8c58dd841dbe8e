//! Grammars for the RTSP headers the library owns: `Transport`,
//! `Session`, and `RTP-Info`. [RFC 2326 section
//! 12](https://tools.ietf.org/html/rfc2326#section-12).

use std::fmt::Write as _;
use std::net::IpAddr;

use crate::Error;

/// The lower transport negotiated in a `Transport` header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// `RTP/AVP` (or `RTP/AVP/UDP`) with `unicast`.
    Udp,
    /// `RTP/AVP` with `multicast`.
    Multicast,
    /// `RTP/AVP/TCP`, interleaved in the RTSP connection.
    Tcp,
}

/// Direction of media flow for a set-up stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Play,
    Record,
}

/// A parsed `Transport` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transport {
    pub protocol: Protocol,
    /// `mode=record` when present; play otherwise.
    pub direction: Direction,
    pub interleaved: Option<(u8, u8)>,
    pub client_port: Option<(u16, u16)>,
    pub server_port: Option<(u16, u16)>,
    /// Multicast port pair.
    pub port: Option<(u16, u16)>,
    pub destination: Option<IpAddr>,
    pub ttl: Option<u8>,
    pub ssrc: Option<u32>,
}

impl Default for Transport {
    fn default() -> Self {
        Transport {
            protocol: Protocol::Udp,
            direction: Direction::Play,
            interleaved: None,
            client_port: None,
            server_port: None,
            port: None,
            destination: None,
            ttl: None,
            ssrc: None,
        }
    }
}

fn parse_port_pair(v: &str, what: &str) -> Result<(u16, u16), Error> {
    let (a, b) = match v.split_once('-') {
        Some((a, b)) => {
            let a = a
                .parse::<u16>()
                .map_err(|_| Error::Parse(format!("bad {} {:?}", what, v)))?;
            let b = b
                .parse::<u16>()
                .map_err(|_| Error::Parse(format!("bad {} {:?}", what, v)))?;
            (a, b)
        }
        // A lone port implies its odd pair; some cameras elide it.
        None => {
            let a = v
                .parse::<u16>()
                .map_err(|_| Error::Parse(format!("bad {} {:?}", what, v)))?;
            (a, a.wrapping_add(1))
        }
    };
    if b != a.wrapping_add(1) {
        return Err(Error::Parse(format!(
            "{} {:?} is not an adjacent pair",
            what, v
        )));
    }
    Ok((a, b))
}

fn parse_channel_pair(v: &str) -> Result<(u8, u8), Error> {
    let (a, b) = match v.split_once('-') {
        Some((a, b)) => {
            let a = a
                .parse::<u8>()
                .map_err(|_| Error::Parse(format!("bad interleaved channel {:?}", v)))?;
            let b = b
                .parse::<u8>()
                .map_err(|_| Error::Parse(format!("bad interleaved channel {:?}", v)))?;
            (a, b)
        }
        None => {
            let a = v
                .parse::<u8>()
                .map_err(|_| Error::Parse(format!("bad interleaved channel {:?}", v)))?;
            (a, a.wrapping_add(1))
        }
    };
    if b != a.wrapping_add(1) {
        return Err(Error::Parse(format!(
            "interleaved channels {:?} are not adjacent",
            v
        )));
    }
    Ok((a, b))
}

impl Transport {
    /// Parses one transport specification. If the header carried several
    /// (comma-separated), split it first; servers pick one.
    pub fn parse(value: &str) -> Result<Self, Error> {
        let mut parts = value.trim().split(';');
        let spec = parts
            .next()
            .expect("split returns at least one part");
        let mut t = Transport::default();
        match spec {
            "RTP/AVP" | "RTP/AVP/UDP" => {}
            "RTP/AVP/TCP" => t.protocol = Protocol::Tcp,
            o => {
                return Err(Error::Parse(format!("unsupported transport spec {:?}", o)));
            }
        }
        for part in parts {
            let (key, value) = match part.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (part, None),
            };
            match (key, value) {
                ("unicast", None) => {}
                ("multicast", None) => {
                    if t.protocol == Protocol::Udp {
                        t.protocol = Protocol::Multicast;
                    }
                }
                ("interleaved", Some(v)) => t.interleaved = Some(parse_channel_pair(v)?),
                ("client_port", Some(v)) => {
                    t.client_port = Some(parse_port_pair(v, "client_port")?)
                }
                ("server_port", Some(v)) => {
                    t.server_port = Some(parse_port_pair(v, "server_port")?)
                }
                ("port", Some(v)) => t.port = Some(parse_port_pair(v, "port")?),
                ("destination", Some(v)) => {
                    t.destination = Some(
                        v.parse()
                            .map_err(|_| Error::Parse(format!("bad destination {:?}", v)))?,
                    )
                }
                ("ttl", Some(v)) => {
                    t.ttl =
                        Some(v.parse().map_err(|_| {
                            Error::Parse(format!("bad ttl {:?}", v))
                        })?)
                }
                ("ssrc", Some(v)) => {
                    t.ssrc = Some(
                        u32::from_str_radix(v, 16)
                            .map_err(|_| Error::Parse(format!("bad ssrc {:?}", v)))?,
                    )
                }
                ("mode", Some(v)) => {
                    let v = v.trim_matches('"');
                    if v.eq_ignore_ascii_case("record") {
                        t.direction = Direction::Record;
                    }
                }
                _ => {} // unknown parameters are skipped
            }
        }
        Ok(t)
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.protocol {
            Protocol::Udp => f.write_str("RTP/AVP;unicast")?,
            Protocol::Multicast => f.write_str("RTP/AVP;multicast")?,
            Protocol::Tcp => f.write_str("RTP/AVP/TCP;unicast")?,
        }
        if let Some(d) = self.destination {
            write!(f, ";destination={}", d)?;
        }
        if let Some((a, b)) = self.interleaved {
            write!(f, ";interleaved={}-{}", a, b)?;
        }
        if let Some((a, b)) = self.port {
            write!(f, ";port={}-{}", a, b)?;
        }
        if let Some(ttl) = self.ttl {
            write!(f, ";ttl={}", ttl)?;
        }
        if let Some((a, b)) = self.client_port {
            write!(f, ";client_port={}-{}", a, b)?;
        }
        if let Some((a, b)) = self.server_port {
            write!(f, ";server_port={}-{}", a, b)?;
        }
        if let Some(ssrc) = self.ssrc {
            write!(f, ";ssrc={:08X}", ssrc)?;
        }
        if self.direction == Direction::Record {
            f.write_str(";mode=record")?;
        }
        Ok(())
    }
}

/// A parsed `Session` header: opaque id plus optional `;timeout=N` seconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub timeout: Option<u32>,
}

impl Session {
    pub fn parse(value: &str) -> Result<Self, Error> {
        let mut parts = value.trim().split(';');
        let id = parts.next().expect("split returns at least one part");
        if id.is_empty() {
            return Err(Error::Parse("empty session id".to_owned()));
        }
        let mut timeout = None;
        for p in parts {
            if let Some(v) = p.trim().strip_prefix("timeout=") {
                timeout = Some(
                    v.parse()
                        .map_err(|_| Error::Parse(format!("bad session timeout {:?}", v)))?,
                );
            }
        }
        Ok(Session {
            id: id.to_owned(),
            timeout,
        })
    }
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)?;
        if let Some(t) = self.timeout {
            write!(f, ";timeout={}", t)?;
        }
        Ok(())
    }
}

/// One stream's entry in an `RTP-Info` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtpInfoEntry {
    pub url: String,
    pub seq: Option<u16>,
    pub rtptime: Option<u32>,
}

/// Parses an `RTP-Info` header (RFC 2326 section 12.33).
pub fn parse_rtp_info(value: &str) -> Result<Vec<RtpInfoEntry>, Error> {
    let mut entries = Vec::new();
    for s in value.split(',') {
        let s = s.trim();
        let mut parts = s.split(';');
        let url = parts
            .next()
            .expect("split returns at least one part")
            .strip_prefix("url=")
            .ok_or_else(|| Error::Parse(format!("RTP-Info entry {:?} missing url", s)))?
            .to_owned();
        let mut entry = RtpInfoEntry {
            url,
            seq: None,
            rtptime: None,
        };
        for part in parts {
            let (key, v) = part
                .split_once('=')
                .ok_or_else(|| Error::Parse(format!("RTP-Info param {:?} has no =", part)))?;
            match key {
                "seq" => {
                    entry.seq = Some(
                        v.parse()
                            .map_err(|_| Error::Parse(format!("bad RTP-Info seq {:?}", v)))?,
                    )
                }
                "rtptime" => {
                    entry.rtptime = Some(
                        v.parse()
                            .map_err(|_| Error::Parse(format!("bad RTP-Info rtptime {:?}", v)))?,
                    )
                }
                _ => {}
            }
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Formats an `RTP-Info` header value.
pub fn format_rtp_info(entries: &[RtpInfoEntry]) -> String {
    let mut out = String::new();
    for (i, e) in entries.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "url={}", e.url);
        if let Some(seq) = e.seq {
            let _ = write!(out, ";seq={}", seq);
        }
        if let Some(rtptime) = e.rtptime {
            let _ = write!(out, ";rtptime={}", rtptime);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_tcp() {
        let t = Transport::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
        assert_eq!(t.protocol, Protocol::Tcp);
        assert_eq!(t.interleaved, Some((0, 1)));
        assert_eq!(t.to_string(), "RTP/AVP/TCP;unicast;interleaved=0-1");
    }

    #[test]
    fn transport_udp() {
        let t = Transport::parse("RTP/AVP;unicast;client_port=50000-50001").unwrap();
        assert_eq!(t.protocol, Protocol::Udp);
        assert_eq!(t.client_port, Some((50000, 50001)));
        assert_eq!(t.direction, Direction::Play);
    }

    #[test]
    fn transport_multicast() {
        let t =
            Transport::parse("RTP/AVP;multicast;destination=239.0.0.5;port=5000-5001;ttl=16")
                .unwrap();
        assert_eq!(t.protocol, Protocol::Multicast);
        assert_eq!(t.destination, Some("239.0.0.5".parse().unwrap()));
        assert_eq!(t.port, Some((5000, 5001)));
        assert_eq!(t.ttl, Some(16));
    }

    #[test]
    fn transport_record_mode() {
        let t = Transport::parse("RTP/AVP;unicast;client_port=7000-7001;mode=record").unwrap();
        assert_eq!(t.direction, Direction::Record);
        let t = Transport::parse("RTP/AVP;unicast;client_port=7000-7001;mode=\"RECORD\"").unwrap();
        assert_eq!(t.direction, Direction::Record);
    }

    #[test]
    fn transport_rejects_non_adjacent_ports() {
        assert!(Transport::parse("RTP/AVP;unicast;client_port=5000-5002").is_err());
    }

    #[test]
    fn session_timeout() {
        let s = Session::parse("634214675641;timeout=30").unwrap();
        assert_eq!(s.id, "634214675641");
        assert_eq!(s.timeout, Some(30));
        let s = Session::parse("F8F8E425").unwrap();
        assert_eq!(s.timeout, None);
    }

    #[test]
    fn rtp_info() {
        let entries = parse_rtp_info(
            "url=rtsp://example/stream/trackID=0;seq=47121;rtptime=3475222385, \
             url=rtsp://example/stream/trackID=1;seq=1",
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, Some(47121));
        assert_eq!(entries[0].rtptime, Some(3475222385));
        assert_eq!(entries[1].rtptime, None);
        let formatted = format_rtp_info(&entries);
        assert!(formatted.starts_with("url=rtsp://example/stream/trackID=0;seq=47121"));
    }
}
