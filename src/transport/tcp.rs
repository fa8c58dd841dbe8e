//! The write side of an RTSP connection. Interleaved data frames share
//! the TCP stream with responses and out-of-band requests, possibly from
//! several tasks (the connection reader, timers, and cross-session
//! routing), so every write goes through one serializing lock that
//! guarantees message atomicity.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::SplitSink;
use futures::SinkExt;
use rtsp_types::Message;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::{Codec, Error};

type Sink = SplitSink<tokio_util::codec::Framed<TcpStream, Codec>, Message<Bytes>>;

/// Cloneable handle to the serialized writer of one connection.
#[derive(Clone)]
pub(crate) struct ConnWriter {
    sink: Arc<Mutex<Sink>>,
    write_timeout: Duration,
}

impl ConnWriter {
    pub(crate) fn new(sink: Sink, write_timeout: Duration) -> Self {
        ConnWriter {
            sink: Arc::new(Mutex::new(sink)),
            write_timeout,
        }
    }

    /// Sends one message; the lock scope makes the frame atomic with
    /// respect to other writers.
    pub(crate) async fn send(&self, msg: Message<Bytes>) -> Result<(), Error> {
        let mut sink = self.sink.lock().await;
        tokio::time::timeout(self.write_timeout, sink.send(msg))
            .await
            .map_err(|_| Error::Timeout("write"))?
    }

    /// Sends an interleaved data frame on the given channel.
    pub(crate) async fn send_data(&self, channel_id: u8, payload: Bytes) -> Result<(), Error> {
        self.send(Message::Data(rtsp_types::Data::new(channel_id, payload)))
            .await
    }
}
