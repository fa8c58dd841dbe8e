//! RTSP 1.0 ([RFC 2326](https://tools.ietf.org/html/rfc2326)) client and
//! server library for live media, as spoken by IP cameras and media
//! servers: RTSP message handling and session state machines, RTP/RTCP
//! over UDP (unicast and multicast) and TCP interleaved channels, and a
//! library of per-codec RTP depacketizers and packetizers.
//!
//! The media data plane is deliberately decode-free: codecs are handled at
//! the packetization level only, producing and consuming byte-accurate
//! access units.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::time::SystemTime;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use once_cell::sync::Lazy;
use rtsp_types::Message;

pub mod bits;
pub mod client;
pub mod codec;
pub mod format;
pub mod headers;
pub mod presentation;
pub mod rtcp;
pub mod rtp;
pub mod server;
pub mod transport;

mod auth;
mod error;

pub use auth::Credentials;
pub use error::{BitsError, Error};

/// RTSP methods missing from [`rtsp_types::Method`], which models the RTSP
/// 2.0 set. RFC 2326 recording needs both.
pub mod methods {
    pub const ANNOUNCE: &str = "ANNOUNCE";
    pub const RECORD: &str = "RECORD";

    pub fn announce() -> rtsp_types::Method {
        rtsp_types::Method::Extension(ANNOUNCE.into())
    }

    pub fn record() -> rtsp_types::Method {
        rtsp_types::Method::Extension(RECORD.into())
    }
}

pub static X_ACCEPT_DYNAMIC_RATE: Lazy<rtsp_types::HeaderName> = Lazy::new(|| {
    rtsp_types::HeaderName::from_static_str("x-Accept-Dynamic-Rate").expect("is ascii")
});
pub static X_DYNAMIC_RATE: Lazy<rtsp_types::HeaderName> =
    Lazy::new(|| rtsp_types::HeaderName::from_static_str("x-Dynamic-Rate").expect("is ascii"));

/// The ONVIF feature tag a client sends in `Require` to request
/// back-channel media in the DESCRIBE response.
pub const BACKCHANNEL_REQUIRE: &str = "www.onvif.org/ver20/backchannel";

/// Context for an RTSP connection and a position within its inbound
/// byte stream; attached to every received message for error reporting.
#[derive(Copy, Clone, Debug)]
pub struct Context {
    pub established: SystemTime,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,

    /// Byte offset of the current message from the start of the inbound
    /// stream.
    pub rtsp_message_offset: u64,
}

/// A monotonically non-decreasing presentation timestamp, reconstructed
/// from wrapping 32-bit RTP timestamps by [`client::Timeline`].
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Timestamp {
    /// Unwrapped timestamp in clock-rate units; starts at the stream's
    /// initial RTP timestamp value.
    pub(crate) timestamp: u64,
    pub(crate) clock_rate: NonZeroU32,
    pub(crate) start: u32,
}

impl Timestamp {
    /// The unwrapped timestamp in clock-rate units.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }

    /// Units elapsed since the stream start.
    pub fn elapsed(&self) -> u64 {
        self.timestamp - u64::from(self.start)
    }

    /// Seconds elapsed since the stream start.
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed() as f64 / f64::from(self.clock_rate.get())
    }

    /// Returns a timestamp advanced by `delta` units, or `None` on u64
    /// overflow (which would take centuries of stream time).
    pub fn try_add(&self, delta: u32) -> Option<Timestamp> {
        Some(Timestamp {
            timestamp: self.timestamp.checked_add(u64::from(delta))?,
            clock_rate: self.clock_rate,
            start: self.start,
        })
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (mod-2^32: {}), npt {:.03}",
            self.timestamp,
            self.timestamp as u32,
            self.elapsed_secs()
        )
    }
}

impl std::fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// An NTP timestamp as in RTCP sender reports: seconds since 1900-01-01 in
/// the high 32 bits, fraction in the low 32.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    /// Converts from wall time. Times before the NTP epoch aren't
    /// representable and saturate to zero.
    pub fn from_system_time(t: SystemTime) -> Self {
        // 70 years plus 17 leap days between the NTP and Unix epochs.
        const EPOCH_DELTA: u64 = 2_208_988_800;
        let d = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        let secs = d.as_secs().wrapping_add(EPOCH_DELTA);
        let frac = (u64::from(d.subsec_nanos()) << 32) / 1_000_000_000;
        NtpTimestamp((secs << 32) | frac)
    }
}

impl std::fmt::Debug for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ntp {}.{:08x}", self.0 >> 32, self.0 as u32)
    }
}

/// A message plus the context it arrived in.
#[derive(Debug)]
pub struct ReceivedMessage {
    pub ctx: Context,
    pub msg: Message<Bytes>,
}

pub(crate) struct Codec {
    pub(crate) ctx: Context,
}

fn map_body<Body, NewBody: AsRef<[u8]>, F: FnOnce(Body) -> NewBody>(
    m: Message<Body>,
    f: F,
) -> Message<NewBody> {
    match m {
        Message::Request(r) => Message::Request(r.map_body(f)),
        Message::Response(r) => Message::Response(r.map_body(f)),
        Message::Data(d) => Message::Data(d.map_body(f)),
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (msg, len): (Message<&[u8]>, _) = match Message::parse(src) {
            Ok((m, l)) => (m, l),
            Err(rtsp_types::ParseError::Error) => {
                return Err(Error::Parse(format!(
                    "bad RTSP message at offset {}",
                    self.ctx.rtsp_message_offset
                )))
            }
            Err(rtsp_types::ParseError::Incomplete) => return Ok(None),
        };
        let msg = map_body(msg, Bytes::copy_from_slice);
        src.advance(len);
        let ctx = self.ctx;
        self.ctx.rtsp_message_offset += len as u64;
        Ok(Some(ReceivedMessage { ctx, msg }))
    }
}

impl tokio_util::codec::Encoder<Message<Bytes>> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Message<Bytes>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut w = std::mem::replace(dst, BytesMut::new()).writer();
        item.write(&mut w).expect("bytes Writer is infallible");
        *dst = w.into_inner();
        Ok(())
    }
}

/// Returns the range within `buf` that `subset` occupies, if it is in fact
/// a subslice of `buf`. Used to turn borrowed parser output back into
/// zero-copy [`Bytes`] slices.
pub(crate) fn as_range(buf: &Bytes, subset: &[u8]) -> Option<std::ops::Range<usize>> {
    if subset.is_empty() {
        return None;
    }
    let start = (subset.as_ptr() as usize).checked_sub(buf.as_ptr() as usize)?;
    let end = start + subset.len();
    if end > buf.len() {
        return None;
    }
    Some(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_display() {
        let t = Timestamp {
            timestamp: u64::from(u32::MAX) + 1,
            clock_rate: NonZeroU32::new(90_000).unwrap(),
            start: 0,
        };
        assert_eq!(t.timestamp as u32, 0);
        assert!(t.elapsed() > 0);
    }

    #[test]
    fn url_round_trip_is_idempotent() {
        let raw = "rtsp://CAMERA.example:8554/cam/real%20monitor?channel=1";
        let once = url::Url::parse(raw).unwrap().to_string();
        let twice = url::Url::parse(&once).unwrap().to_string();
        assert_eq!(once, twice);
    }

    #[test]
    fn ntp_from_wall() {
        let t = NtpTimestamp::from_system_time(SystemTime::UNIX_EPOCH);
        assert_eq!(t.0 >> 32, 2_208_988_800);
        assert_eq!(t.0 as u32, 0);
    }
}
