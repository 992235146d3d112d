use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use percent_encoding::percent_decode_str;

use crate::error::LookupError;
use crate::media::{MediaFormat, MediaPipeline, TrackInfo};

/// One playable stream: a media file and the tracks it was probed into.
///
/// Immutable once built; every client that plays it opens its own
/// pipelines through [`open_track`](Self::open_track).
pub struct ServerMediaSession {
    name: String,
    path: PathBuf,
    format: Arc<dyn MediaFormat>,
    tracks: Vec<TrackInfo>,
    created: Instant,
    origin_id: u64,
    delete_when_idle: bool,
}

impl ServerMediaSession {
    pub fn new(
        name: &str,
        path: PathBuf,
        format: Arc<dyn MediaFormat>,
        tracks: Vec<TrackInfo>,
    ) -> Self {
        Self {
            name: name.to_string(),
            path,
            format,
            tracks,
            created: Instant::now(),
            origin_id: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_micros() as u64)
                .unwrap_or_default(),
            delete_when_idle: true,
        }
    }

    /// Keep the session cached while idle (used for pinned streams).
    pub fn with_delete_when_idle(mut self, delete: bool) -> Self {
        self.delete_when_idle = delete;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Session ID for the SDP `o=` line: creation time in microseconds.
    pub fn origin_id(&self) -> u64 {
        self.origin_id
    }

    pub fn delete_when_idle(&self) -> bool {
        self.delete_when_idle
    }

    pub fn tracks(&self) -> &[TrackInfo] {
        &self.tracks
    }

    pub fn track(&self, index: usize) -> Option<&TrackInfo> {
        self.tracks.get(index)
    }

    /// Text for the SDP `s=` and `i=` lines.
    pub fn description(&self) -> String {
        format!("{}, streamed by rtsp-media-server", self.format.name())
    }

    /// Length of the longest track, if every track knows its length.
    pub fn duration(&self) -> Option<f64> {
        self.tracks
            .iter()
            .map(|t| t.duration)
            .try_fold(0.0f64, |longest, d| d.map(|d| longest.max(d)))
    }

    /// True when every track supports seeking and non-1.0 scale.
    pub fn trick_play(&self) -> bool {
        self.tracks.iter().all(|t| t.trick_play)
    }

    /// Open a fresh, independent pipeline for track `index`.
    pub fn open_track(
        &self,
        index: usize,
        max_packet_size: usize,
    ) -> Result<MediaPipeline, LookupError> {
        let track = self
            .tracks
            .get(index)
            .ok_or_else(|| LookupError::NotFound(format!("{}/track{}", self.name, index + 1)))?;
        self.format.open(&self.path, track, max_packet_size)
    }
}

impl std::fmt::Debug for ServerMediaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMediaSession")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("format", &self.format.name())
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// A stream name and optional track taken from a request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRef {
    pub name: String,
    /// 0-based track index from a `trackN` control suffix.
    pub track: Option<usize>,
}

/// Extract the stream name from an RTSP URL.
///
/// `rtsp://host:554/dir/movie.ts/track1` → `dir/movie.ts`, track 0
/// `rtsp://host:554/movie.264`           → `movie.264`
/// `/movie.264/`                         → `movie.264`
/// `rtsp://host:554`, `*`                → `None`
pub fn parse_stream_url(uri: &str) -> Option<StreamRef> {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        &after[after.find('/')?..]
    } else if uri.starts_with('/') {
        uri
    } else {
        return None;
    };
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let path = path.trim_matches('/');

    // Strip track suffix: movie.ts/track1 → movie.ts
    let (name, track) = match path.rsplit_once('/') {
        Some((head, tail)) => match tail
            .strip_prefix("track")
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|&n| n >= 1)
        {
            Some(n) => (head, Some(n - 1)),
            None => (path, None),
        },
        None => (path, None),
    };
    if name.is_empty() {
        return None;
    }
    Some(StreamRef {
        name: percent_decode(name),
        track,
    })
}

fn percent_decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

type Outcome = Result<Arc<ServerMediaSession>, LookupError>;

/// Rendezvous for callers waiting on an in-progress creation.
struct Flight {
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
}

impl Flight {
    fn wait(&self) -> Outcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(outcome) = outcome.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut outcome);
        }
    }

    fn finish(&self, result: Outcome) {
        *self.outcome.lock() = Some(result);
        self.done.notify_all();
    }
}

/// Clears a pending slot if its creator unwinds before finishing, so that
/// waiters get an error instead of blocking forever.
struct PendingGuard<'a> {
    slots: &'a Mutex<HashMap<String, Slot>>,
    name: &'a str,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.slots.lock();
        let flight = match slots.remove(self.name) {
            Some(Slot::Pending(flight)) => flight,
            Some(ready) => {
                slots.insert(self.name.to_string(), ready);
                return;
            }
            None => return,
        };
        drop(slots);
        tracing::error!(stream = self.name, "media session creation panicked");
        flight.finish(Err(LookupError::Io {
            name: self.name.to_string(),
            reason: "media session creation panicked".to_string(),
        }));
    }
}

struct Entry {
    session: Arc<ServerMediaSession>,
    refs: usize,
    idle_since: Option<Instant>,
}

enum Slot {
    Pending(Arc<Flight>),
    Ready(Entry),
}

/// Demand-created, reference-counted [`ServerMediaSession`]s keyed by
/// stream name.
///
/// Creation is single-flight: concurrent lookups of a name that is being
/// created wait for that creation instead of starting their own. Failures
/// are handed to every waiter and never cached.
pub struct SessionCache {
    slots: Mutex<HashMap<String, Slot>>,
    idle_grace: Duration,
}

impl SessionCache {
    pub fn new(idle_grace: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            idle_grace,
        }
    }

    /// The cached session for `name`, running `create` if there is none.
    pub fn get_or_create<F>(&self, name: &str, now: Instant, create: F) -> Outcome
    where
        F: FnOnce() -> Result<ServerMediaSession, LookupError>,
    {
        let flight = {
            let mut slots = self.slots.lock();
            match slots.get(name) {
                Some(Slot::Ready(entry)) => {
                    if entry.refs == 0 && !entry.session.path().exists() {
                        tracing::info!(stream = name, "backing file removed; dropping media session");
                        slots.remove(name);
                        return Err(LookupError::NotFound(name.to_string()));
                    }
                    return Ok(entry.session.clone());
                }
                Some(Slot::Pending(flight)) => Some(flight.clone()),
                None => {
                    slots.insert(
                        name.to_string(),
                        Slot::Pending(Arc::new(Flight {
                            outcome: Mutex::new(None),
                            done: Condvar::new(),
                        })),
                    );
                    None
                }
            }
        };
        if let Some(flight) = flight {
            tracing::trace!(stream = name, "waiting on in-flight media session creation");
            return flight.wait();
        }

        let mut guard = PendingGuard {
            slots: &self.slots,
            name,
            armed: true,
        };
        let result = create().map(Arc::new);
        guard.armed = false;

        let mut slots = self.slots.lock();
        let flight = match slots.remove(name) {
            Some(Slot::Pending(flight)) => Some(flight),
            Some(ready @ Slot::Ready(_)) => {
                slots.insert(name.to_string(), ready);
                None
            }
            None => None,
        };
        match &result {
            Ok(session) => {
                slots.insert(
                    name.to_string(),
                    Slot::Ready(Entry {
                        session: session.clone(),
                        refs: 0,
                        idle_since: Some(now),
                    }),
                );
            }
            Err(e) => tracing::debug!(stream = name, error = %e, "media session creation failed"),
        }
        drop(slots);

        if let Some(flight) = flight {
            flight.finish(result.clone());
        }
        result
    }

    /// Count one more RTSP session bound to `name`.
    pub fn acquire(&self, name: &str) -> bool {
        match self.slots.lock().get_mut(name) {
            Some(Slot::Ready(entry)) => {
                entry.refs += 1;
                entry.idle_since = None;
                true
            }
            _ => false,
        }
    }

    /// Drop one reference; at zero the entry starts its idle grace period.
    pub fn release(&self, name: &str, now: Instant) {
        if let Some(Slot::Ready(entry)) = self.slots.lock().get_mut(name) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                entry.idle_since = Some(now);
                tracing::debug!(stream = name, "media session idle");
            }
        }
    }

    /// Evict idle entries whose grace period has elapsed. Returns their names.
    pub fn reap(&self, now: Instant) -> Vec<String> {
        let grace = self.idle_grace;
        let mut evicted = Vec::new();
        self.slots.lock().retain(|name, slot| {
            let expired = matches!(
                slot,
                Slot::Ready(Entry { session, refs: 0, idle_since: Some(since) })
                    if session.delete_when_idle() && now.saturating_duration_since(*since) >= grace
            );
            if expired {
                evicted.push(name.clone());
            }
            !expired
        });
        for name in &evicted {
            tracing::info!(stream = %name, "idle media session removed");
        }
        evicted
    }

    pub fn contains(&self, name: &str) -> bool {
        matches!(self.slots.lock().get(name), Some(Slot::Ready(_)))
    }

    pub fn ref_count(&self, name: &str) -> Option<usize> {
        match self.slots.lock().get(name) {
            Some(Slot::Ready(entry)) => Some(entry.refs),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
