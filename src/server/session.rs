//! Server-side session state, driven by the connection handler. The
//! state machine is exactly RFC 2326's:
//!
//! ```text
//! Init --ANNOUNCE--> PreRecord --RECORD--> Record
//! Init --SETUP(play)--> PrePlay --PLAY--> Play --PAUSE--> PrePlay
//! any --TEARDOWN--> Closed
//! ```
//!
//! Illegal methods answer 455 without disturbing the session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use tokio::sync::Mutex;

use crate::client::rtp::SequenceChecker;
use crate::headers::Direction;
use crate::presentation::Presentation;
use crate::server::stream::ServerStream;
use crate::transport::udp::ReorderBuffer;
use crate::transport::Binding;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    PreRecord,
    Record,
    PrePlay,
    Play,
    Closed,
}

/// One media's negotiated transport plus receive-path state (used in the
/// record direction).
pub(crate) struct SessionMedia {
    pub(crate) media_idx: usize,
    pub(crate) direction: Direction,
    pub(crate) binding: Binding,
    pub(crate) checker: SequenceChecker,
    /// Record-direction UDP receivers tolerate reordering with a small
    /// window; interleaved input is already ordered.
    pub(crate) reorder: ReorderBuffer,
}

pub(crate) struct ServerSession {
    pub(crate) id: String,
    pub(crate) peer: SocketAddr,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) path: Mutex<Option<String>>,
    /// The stream this session publishes or reads.
    pub(crate) stream: Mutex<Option<Arc<ServerStream>>>,
    /// For publishers: the announced presentation.
    pub(crate) announced: Mutex<Option<Presentation>>,
    pub(crate) medias: Mutex<Vec<SessionMedia>>,
    pub(crate) last_activity: Mutex<Instant>,
    pub(crate) is_publisher: Mutex<bool>,
}

/// Generates an opaque session id of at least 8 bytes.
fn new_session_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016X}", rng.gen::<u64>())
}

impl ServerSession {
    pub(crate) fn new(peer: SocketAddr) -> Arc<Self> {
        Arc::new(ServerSession {
            id: new_session_id(),
            peer,
            state: Mutex::new(SessionState::Init),
            path: Mutex::new(None),
            stream: Mutex::new(None),
            announced: Mutex::new(None),
            medias: Mutex::new(Vec::new()),
            last_activity: Mutex::new(Instant::now()),
            is_publisher: Mutex::new(false),
        })
    }

    pub(crate) async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    /// Validates and applies a state transition, returning the RTSP
    /// status code to answer with on rejection.
    pub(crate) async fn transition(&self, method: &str) -> Result<(), (u16, String)> {
        let mut state = self.state.lock().await;
        let next = match (*state, method) {
            (SessionState::Init, "ANNOUNCE") => SessionState::PreRecord,
            (SessionState::Init, "SETUP") => SessionState::PrePlay,
            (SessionState::PreRecord, "SETUP") => SessionState::PreRecord,
            (SessionState::PreRecord, "RECORD") => SessionState::Record,
            (SessionState::PrePlay, "SETUP") => SessionState::PrePlay,
            (SessionState::PrePlay, "PLAY") => SessionState::Play,
            (SessionState::Play, "PAUSE") => SessionState::PrePlay,
            (_, "TEARDOWN") => SessionState::Closed,
            (s, m) => {
                return Err((
                    455,
                    format!("method {} not valid in state {:?}", m, s),
                ))
            }
        };
        *state = next;
        Ok(())
    }

    pub(crate) async fn state(&self) -> SessionState {
        *self.state.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session() -> Arc<ServerSession> {
        ServerSession::new("127.0.0.1:9".parse().unwrap())
    }

    #[tokio::test]
    async fn record_path() {
        let s = session().await;
        s.transition("ANNOUNCE").await.unwrap();
        s.transition("SETUP").await.unwrap();
        s.transition("SETUP").await.unwrap();
        s.transition("RECORD").await.unwrap();
        assert_eq!(s.state().await, SessionState::Record);
        s.transition("TEARDOWN").await.unwrap();
        assert_eq!(s.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn play_path_with_pause() {
        let s = session().await;
        s.transition("SETUP").await.unwrap();
        s.transition("PLAY").await.unwrap();
        assert_eq!(s.state().await, SessionState::Play);
        s.transition("PAUSE").await.unwrap();
        assert_eq!(s.state().await, SessionState::PrePlay);
        s.transition("PLAY").await.unwrap();
        assert_eq!(s.state().await, SessionState::Play);
    }

    #[tokio::test]
    async fn illegal_methods_answer_455() {
        let s = session().await;
        let (code, _) = s.transition("PLAY").await.unwrap_err();
        assert_eq!(code, 455);
        s.transition("ANNOUNCE").await.unwrap();
        let (code, _) = s.transition("PLAY").await.unwrap_err();
        assert_eq!(code, 455);
        // The failed transition left the state alone.
        assert_eq!(s.state().await, SessionState::PreRecord);

        // PAUSE is only legal in Play; a recording session gets 455 too.
        s.transition("SETUP").await.unwrap();
        s.transition("RECORD").await.unwrap();
        let (code, _) = s.transition("PAUSE").await.unwrap_err();
        assert_eq!(code, 455);
        assert_eq!(s.state().await, SessionState::Record);
    }

    #[tokio::test]
    async fn session_ids_are_opaque_and_long() {
        let a = session().await;
        let b = session().await;
        assert!(a.id.len() >= 8);
        assert_ne!(a.id, b.id);
    }
}
