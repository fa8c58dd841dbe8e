//! Error types.
//!
//! The kinds here are coarse on purpose: callers mostly need to decide
//! between "log and drop" (parse problems in data-plane input), "answer the
//! peer and keep going" (state machine and auth rejections), and "tear the
//! connection down" (transport failures and timeouts). Codec-internal
//! conditions have their own types in [`crate::codec`] and never reach this
//! enum.

use std::fmt;

/// Errors surfaced by the public API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed RTSP/SDP/URL input. Log and drop; the connection survives.
    #[error("parse error: {0}")]
    Parse(String),

    /// A method was rejected by the session state machine. The server
    /// answers these with the status carried here (455/457 family).
    #[error("method not valid in this state: {msg}")]
    State { status: u16, msg: String },

    /// Authentication failed or is required. Servers answer 401; the client
    /// retries once with credentials before surfacing this.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The underlying byte stream failed or was closed. Terminal for the
    /// connection and all of its sessions.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// An operation exceeded its configured window. Treated like a
    /// transport error by the connection teardown path.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The peer answered with a non-success RTSP status.
    #[error("{method} returned status {status}")]
    BadStatus {
        method: &'static str,
        status: String,
    },

    /// Codec parameter data (sprop, config, ...) could not be parsed.
    /// Servers turn this into a 400 on ANNOUNCE.
    #[error("codec parameters: {0}")]
    CodecParameters(#[from] BitsError),

    /// A `Format` could not be built from the SDP media description.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Bit-level parse failures from [`crate::bits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BitsError {
    /// A read past the end of the buffer was requested.
    #[error("not enough bits")]
    NotEnoughBits,

    /// A syntactically valid but out-of-range value was found, e.g. an
    /// unsigned Exp-Golomb code with more than 32 leading zeros.
    #[error("invalid value")]
    InvalidValue,
}

impl Error {
    /// The RTSP status code a server should answer with, if the error maps
    /// to one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::State { status, .. } => Some(*status),
            Error::Auth(_) => Some(401),
            Error::Parse(_) | Error::CodecParameters(_) | Error::UnsupportedFormat(_) => Some(400),
            _ => None,
        }
    }
}

impl From<fmt::Error> for Error {
    fn from(_: fmt::Error) -> Self {
        Error::Parse("formatting failed".to_owned())
    }
}
