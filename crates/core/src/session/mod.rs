//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! An RTSP session is a server-side state object created during the first
//! SETUP and destroyed by TEARDOWN, by liveness timeout, or when the
//! connection carrying its interleaved streams closes. It tracks:
//!
//! - A unique session ID (16 hex digits, returned in the `Session` header).
//! - The stream name it is bound to; every SETUP in the session must name
//!   the same stream.
//! - One [`Stream`] per set-up track, each with its own transport binding
//!   and media pipeline.
//! - The last time the client showed signs of life (a request naming the
//!   session, or incoming RTCP).
//!
//! ## Session lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! SETUP          -> Ready
//! PLAY           -> Playing
//! PAUSE          -> Paused   (from Playing)
//! PLAY           -> Playing  (from Paused)
//! TEARDOWN       -> (removed)
//! timeout        -> (removed)
//! TCP disconnect -> (removed, if it carried interleaved streams)
//! ```

pub mod ports;
pub mod stream;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use slab::Slab;

use crate::media_session::ServerMediaSession;
use crate::scheduler::TaskHandle;
pub use ports::PortAllocator;
pub use stream::{Delivery, MediaSink, Stream, StreamState, TransportBinding};
pub use transport::TransportSpec;

/// RTSP session state machine (RFC 2326 §A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created via SETUP, not yet playing.
    Ready,
    /// Media is being delivered.
    Playing,
    /// Delivery suspended; can resume via PLAY.
    Paused,
}

/// A single RTSP session (RFC 2326 §3).
#[derive(Debug)]
pub struct RtspSession {
    pub id: String,
    pub media: Arc<ServerMediaSession>,
    pub streams: Vec<Stream>,
    pub state: SessionState,
    pub created: Instant,
    pub last_activity: Instant,
    /// Authenticated user that set the session up.
    pub user: Option<String>,
    /// Connection the session was set up on.
    pub connection: Option<usize>,
    pub timeout: Duration,
    pub(crate) liveness: Option<TaskHandle>,
}

impl RtspSession {
    pub fn new(media: Arc<ServerMediaSession>, timeout: Duration, now: Instant) -> Self {
        Self {
            id: String::new(),
            media,
            streams: Vec::new(),
            state: SessionState::Ready,
            created: now,
            last_activity: now,
            user: None,
            connection: None,
            timeout,
            liveness: None,
        }
    }

    pub fn stream_name(&self) -> &str {
        self.media.name()
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Time left before the liveness timer expires the session.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.timeout
            .saturating_sub(now.saturating_duration_since(self.last_activity))
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.remaining(now).is_zero()
    }

    pub fn stream_index(&self, track: usize) -> Option<usize> {
        self.streams.iter().position(|s| s.track() == track)
    }

    pub fn set_state(&mut self, state: SessionState) {
        tracing::debug!(session_id = %self.id, old_state = ?self.state, new_state = ?state, "state transition");
        self.state = state;
    }

    /// `Session` response header value, e.g. `0123456789ABCDEF;timeout=65`.
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout.as_secs())
    }
}

/// Arena of live sessions, addressed by slab key inside the server and by
/// the 16-hex-digit id on the wire.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Slab<RtspSession>,
    ids: HashMap<String, usize>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a fresh id and store the session. Returns its key.
    pub fn insert(&mut self, mut session: RtspSession) -> usize {
        let id = loop {
            let candidate = format!("{:016X}", rand::random::<u64>());
            if !self.ids.contains_key(&candidate) {
                break candidate;
            }
        };
        session.id = id.clone();
        let key = self.sessions.insert(session);
        self.ids.insert(id.clone(), key);
        tracing::debug!(session_id = %id, total_sessions = self.sessions.len(), "session created");
        key
    }

    pub fn find(&self, id: &str) -> Option<usize> {
        self.ids.get(id).copied()
    }

    pub fn get(&self, key: usize) -> Option<&RtspSession> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut RtspSession> {
        self.sessions.get_mut(key)
    }

    pub fn remove(&mut self, key: usize) -> Option<RtspSession> {
        let session = self.sessions.try_remove(key)?;
        self.ids.remove(&session.id);
        tracing::debug!(session_id = %session.id, total_sessions = self.sessions.len(), "session removed");
        Some(session)
    }

    /// Sessions with at least one stream interleaved on `conn`.
    pub fn interleaved_on(&self, conn: usize) -> Vec<usize> {
        self.sessions
            .iter()
            .filter(|(_, s)| {
                s.streams
                    .iter()
                    .any(|stream| stream.binding().interleaved_conn() == Some(conn))
            })
            .map(|(key, _)| key)
            .collect()
    }

    /// Lowest even channel not carrying RTP or RTCP on `conn`.
    pub fn free_channel_pair(&self, conn: usize) -> Option<(u8, u8)> {
        let mut used = [false; 256];
        for (_, session) in &self.sessions {
            for stream in &session.streams {
                if let TransportBinding::Interleaved {
                    conn: c,
                    rtp_channel,
                    rtcp_channel,
                } = stream.binding()
                    && *c == conn
                {
                    used[usize::from(*rtp_channel)] = true;
                    used[usize::from(*rtcp_channel)] = true;
                }
            }
        }
        (0u8..=254)
            .step_by(2)
            .find(|&ch| !used[usize::from(ch)] && !used[usize::from(ch) + 1])
            .map(|ch| (ch, ch + 1))
    }

    /// Session owning interleaved `channel` on `conn`, with the stream index.
    pub fn by_channel(&self, conn: usize, channel: u8) -> Option<(usize, usize)> {
        self.sessions.iter().find_map(|(key, session)| {
            session.streams.iter().position(|stream| {
                matches!(
                    stream.binding(),
                    TransportBinding::Interleaved { conn: c, rtp_channel, rtcp_channel }
                        if *c == conn && (*rtp_channel == channel || *rtcp_channel == channel)
                )
            })
            .map(|index| (key, index))
        })
    }

    pub fn keys(&self) -> Vec<usize> {
        self.sessions.iter().map(|(key, _)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
