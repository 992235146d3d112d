use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::Interest;

use crate::auth;
use crate::error::{LookupError, RtspError};
use crate::media_session::{ServerMediaSession, StreamRef, parse_stream_url};
use crate::protocol::range::{self, NptRange};
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp::{self, SdpOrigin};
use crate::scheduler::Scheduler;
use crate::server::{Event, ServerCore};
use crate::session::stream::{SENDER_REPORT_INTERVAL, UdpBinding};
use crate::session::{RtspSession, SessionState, Stream, TransportBinding, TransportSpec};
use crate::transport::ClientContext;

/// Methods listed in `Public` and `Allow`.
pub const PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, SETUP, TEARDOWN, PLAY, PAUSE, GET_PARAMETER, SET_PARAMETER";

/// Handles RTSP method requests arriving on one connection.
///
/// Borrowed for the duration of a single request: it reads and updates the
/// shared server state (session table, port allocator, media session cache)
/// and schedules delivery on the server's scheduler.
pub struct MethodHandler<'a> {
    core: &'a mut ServerCore,
    scheduler: &'a mut Scheduler<Event>,
    client: &'a mut ClientContext,
    now: Instant,
}

impl<'a> MethodHandler<'a> {
    pub(crate) fn new(
        core: &'a mut ServerCore,
        scheduler: &'a mut Scheduler<Event>,
        client: &'a mut ClientContext,
    ) -> Self {
        MethodHandler {
            core,
            scheduler,
            client,
            now: Instant::now(),
        }
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0").to_string();
        let response = self.dispatch(request);
        tracing::debug!(
            peer = %self.client.peer,
            method = %request.method,
            status = response.status_code,
            %cseq,
            "response"
        );
        response.add_header("CSeq", &cseq)
    }

    fn dispatch(&mut self, request: &RtspRequest) -> RtspResponse {
        tracing::debug!(
            peer = %self.client.peer,
            method = %request.method,
            uri = %request.uri,
            "request"
        );

        if request.version != "RTSP/1.0" {
            tracing::warn!(version = %request.version, "unsupported RTSP version");
            return RtspResponse::status(505);
        }

        let method = request.method.as_str();
        if method != "OPTIONS"
            && let Some(challenge) = self.authenticate(request)
        {
            return challenge;
        }

        if let Some(key) = request.session_id().and_then(|id| self.core.sessions.find(id))
            && let Some(session) = self.core.sessions.get_mut(key)
        {
            session.touch(self.now);
        }

        match method {
            "OPTIONS" => self.handle_options(),
            "DESCRIBE" => self.handle_describe(request),
            "SETUP" => self.handle_setup(request),
            "PLAY" => self.handle_play(request),
            "PAUSE" => self.handle_pause(request),
            "TEARDOWN" => self.handle_teardown(request),
            "GET_PARAMETER" | "SET_PARAMETER" => self.handle_parameter(request),
            "ANNOUNCE" | "RECORD" | "REDIRECT" => {
                tracing::warn!(method, "method not allowed on an on-demand server");
                RtspResponse::status(405).add_header("Allow", PUBLIC_METHODS)
            }
            _ => {
                tracing::warn!(method, "unsupported RTSP method");
                RtspResponse::status(501)
            }
        }
    }

    /// `None` when the request may proceed; otherwise the 401 to send.
    fn authenticate(&mut self, request: &RtspRequest) -> Option<RtspResponse> {
        let db = self.core.auth.as_ref()?;
        let verified = db.verify(
            request.get_header("Authorization"),
            &request.method,
            self.client.nonce.as_deref(),
        );
        if verified.is_some() {
            return None;
        }
        let nonce = auth::new_nonce();
        let challenge = db.challenge(&nonce);
        self.client.nonce = Some(nonce);
        tracing::debug!(peer = %self.client.peer, method = %request.method, "authentication required");
        Some(RtspResponse::status(401).add_header("WWW-Authenticate", &challenge))
    }

    fn user(&self, request: &RtspRequest) -> Option<String> {
        let db = self.core.auth.as_ref()?;
        db.verify(
            request.get_header("Authorization"),
            &request.method,
            self.client.nonce.as_deref(),
        )
    }

    fn handle_options(&self) -> RtspResponse {
        RtspResponse::ok().add_header("Public", PUBLIC_METHODS)
    }

    /// Host for SDP `o=`/`c=`: configured public host, else the address the
    /// client reached us on.
    fn sdp_host(&self) -> String {
        match &self.core.config.public_host {
            Some(host) => host.clone(),
            None => self.client.local.ip().to_string(),
        }
    }

    fn resolve(&self, name: &str) -> Result<Arc<ServerMediaSession>, LookupError> {
        let registry = &self.core.registry;
        let root = &self.core.config.media_root;
        self.core
            .cache
            .get_or_create(name, self.now, || registry.create(root, name))
    }

    fn handle_describe(&mut self, request: &RtspRequest) -> RtspResponse {
        let Some(StreamRef { name, .. }) = parse_stream_url(&request.uri) else {
            tracing::warn!(uri = %request.uri, "DESCRIBE without a stream name");
            return RtspResponse::not_found();
        };
        let media = match self.resolve(&name) {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!(stream = %name, error = %e, "DESCRIBE failed");
                return RtspResponse::status(e.status_code());
            }
        };

        let host = self.sdp_host();
        let sdp = sdp::generate_sdp(
            &media,
            &SdpOrigin {
                username: &self.core.config.sdp_username,
                address: &host,
            },
        );
        RtspResponse::ok()
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &format!("{}/", aggregate_url(&request.uri)))
            .with_body(sdp)
    }

    fn handle_setup(&mut self, request: &RtspRequest) -> RtspResponse {
        match self.setup(request) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(uri = %request.uri, error = %e, "SETUP failed");
                RtspResponse::status(e.status_code())
            }
        }
    }

    fn setup(&mut self, request: &RtspRequest) -> crate::error::Result<RtspResponse> {
        let StreamRef { name, track } = parse_stream_url(&request.uri)
            .ok_or_else(|| LookupError::NotFound(request.uri.clone()))?;
        let track = track.unwrap_or(0);

        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!("SETUP missing Transport header");
            return Ok(RtspResponse::bad_request());
        };
        let spec = TransportSpec::parse(transport_header)?;

        let existing = match request.session_id() {
            Some(id) => {
                let key = self
                    .core
                    .sessions
                    .find(id)
                    .ok_or_else(|| RtspError::SessionNotFound(id.to_string()))?;
                if let Some(session) = self.core.sessions.get(key)
                    && session.stream_name() != name
                {
                    tracing::warn!(session_id = id, stream = %name, bound = session.stream_name(), "SETUP for another stream");
                    return Ok(RtspResponse::status(459));
                }
                Some(key)
            }
            None => None,
        };

        let media = self.resolve(&name)?;
        let info = media
            .track(track)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(request.uri.clone()))?;
        let pipeline = media.open_track(track, self.core.config.max_packet_size)?;

        let binding = match spec {
            TransportSpec::Udp {
                client_rtp_port,
                client_rtcp_port,
            } => {
                let sockets = self.core.ports.allocate(self.core.config.bind_ip())?;
                let ip = self.client.peer.ip();
                TransportBinding::Udp(UdpBinding {
                    sockets,
                    client_rtp: SocketAddr::new(ip, client_rtp_port),
                    client_rtcp: SocketAddr::new(ip, client_rtcp_port),
                    rtcp_token: None,
                })
            }
            TransportSpec::Interleaved { channels } => {
                let requested = channels.filter(|&(rtp, rtcp)| {
                    let free = !self.channel_taken(existing, track, rtp)
                        && !self.channel_taken(existing, track, rtcp);
                    if !free {
                        tracing::debug!(rtp, rtcp, "requested interleaved channels in use; reassigning");
                    }
                    free
                });
                let (rtp_channel, rtcp_channel) = match requested
                    .or_else(|| self.core.sessions.free_channel_pair(self.client.key))
                {
                    Some(pair) => pair,
                    None => return Err(RtspError::UnsupportedTransport("no free channels".into())),
                };
                TransportBinding::Interleaved {
                    conn: self.client.key,
                    rtp_channel,
                    rtcp_channel,
                }
            }
        };

        let key = match existing {
            Some(key) => key,
            None => {
                let mut session =
                    RtspSession::new(media.clone(), self.core.config.session_timeout, self.now);
                session.connection = Some(self.client.key);
                session.user = self.user(request);
                let key = self.core.sessions.insert(session);
                self.core.cache.acquire(&name);
                let liveness = self
                    .scheduler
                    .schedule(self.core.config.session_timeout, Event::Liveness(key));
                if let Some(session) = self.core.sessions.get_mut(key) {
                    session.liveness = Some(liveness);
                }
                key
            }
        };

        let cname = self.sdp_host();
        let stream = Stream::new(track, &info, pipeline, binding, &cname, self.now);
        let index = self.install_stream(key, stream)?;

        let Some(session) = self.core.sessions.get(key) else {
            return Err(RtspError::SessionNotFound(key.to_string()));
        };
        let transport = session.streams[index].binding().describe();
        tracing::info!(
            session_id = %session.id,
            stream = %name,
            track,
            peer = %self.client.peer,
            transport = %transport,
            "stream set up"
        );
        Ok(RtspResponse::ok()
            .add_header("Transport", &transport)
            .add_header("Session", &session.session_header_value()))
    }

    /// Whether `channel` on this connection belongs to a stream other than
    /// the one this SETUP would replace.
    fn channel_taken(&self, existing: Option<usize>, track: usize, channel: u8) -> bool {
        match self.core.sessions.by_channel(self.client.key, channel) {
            Some((key, index)) => {
                let replaced = Some(key) == existing
                    && self
                        .core
                        .sessions
                        .get(key)
                        .is_some_and(|session| session.streams[index].track() == track);
                !replaced
            }
            None => false,
        }
    }

    /// Add `stream` to session `key`, replacing an earlier setup of the same
    /// track, and watch its RTCP socket. Returns the stream index.
    fn install_stream(&mut self, key: usize, stream: Stream) -> crate::error::Result<usize> {
        let track = stream.track();
        let session = self
            .core
            .sessions
            .get_mut(key)
            .ok_or_else(|| RtspError::SessionNotFound(key.to_string()))?;
        let index = match session.stream_index(track) {
            Some(index) => {
                let old = std::mem::replace(&mut session.streams[index], stream);
                self.core.release_stream(self.scheduler, old);
                index
            }
            None => {
                session.streams.push(stream);
                session.streams.len() - 1
            }
        };

        let Some(session) = self.core.sessions.get_mut(key) else {
            return Err(RtspError::SessionNotFound(key.to_string()));
        };
        if let TransportBinding::Udp(udp) = session.streams[index].binding_mut() {
            let token = self.scheduler.register(
                &mut udp.sockets.rtcp,
                Interest::READABLE,
                Event::Rtcp {
                    session: key,
                    stream: index,
                },
            )?;
            udp.rtcp_token = Some(token);
        }
        Ok(index)
    }

    fn session_key(&self, request: &RtspRequest) -> Option<usize> {
        request
            .session_id()
            .and_then(|id| self.core.sessions.find(id))
    }

    fn handle_play(&mut self, request: &RtspRequest) -> RtspResponse {
        let Some(key) = self.session_key(request) else {
            tracing::warn!(session = ?request.session_id(), "PLAY for unknown session");
            return RtspResponse::session_not_found();
        };

        let range = match request.get_header("Range") {
            Some(value) => match range::parse_range(value) {
                Some(range) => Some(range),
                None => {
                    tracing::warn!(range = value, "unparseable Range");
                    return RtspResponse::status(457);
                }
            },
            None => None,
        };
        let requested_scale = match request.get_header("Scale") {
            Some(value) => match range::parse_scale(value) {
                Some(scale) => Some(scale),
                None => return RtspResponse::bad_request(),
            },
            None => None,
        };

        let now = self.now;
        let base = aggregate_url(&request.uri);
        let scheduler = &mut *self.scheduler;
        let Some(session) = self.core.sessions.get_mut(key) else {
            return RtspResponse::session_not_found();
        };
        if session.streams.is_empty() {
            return RtspResponse::status(455);
        }

        for stream in &mut session.streams {
            for task in stream.take_tasks() {
                scheduler.cancel(task);
            }
        }

        let trick_play = session.media.trick_play();
        let scale = match requested_scale {
            Some(scale) if trick_play => {
                let granted: Vec<f32> = session
                    .streams
                    .iter_mut()
                    .map(|stream| stream.set_scale(scale))
                    .collect();
                if granted.iter().all(|g| *g == scale) {
                    scale
                } else {
                    for stream in &mut session.streams {
                        stream.set_scale(1.0);
                    }
                    1.0
                }
            }
            _ => {
                for stream in &mut session.streams {
                    if stream.scale() != 1.0 {
                        stream.set_scale(1.0);
                    }
                }
                1.0
            }
        };

        if let Some(NptRange { start: Some(start), .. }) = range {
            for stream in &mut session.streams {
                match stream.seek(start) {
                    Ok(Some(reached)) => {
                        tracing::debug!(session_id = %session.id, track = stream.track(), requested = start, reached, "seek");
                    }
                    Ok(None) => {
                        tracing::debug!(session_id = %session.id, track = stream.track(), requested = start, "stream cannot seek; position kept");
                    }
                    Err(e) => {
                        tracing::error!(session_id = %session.id, error = %e, "seek failed");
                        return RtspResponse::status(500);
                    }
                }
            }
        }
        let npt_start = session.streams.first().map_or(0.0, |s| s.position());
        let stop_at = range.and_then(|r| r.end);

        let mut rtp_info = Vec::with_capacity(session.streams.len());
        for (index, stream) in session.streams.iter_mut().enumerate() {
            let rtptime = stream.play(now, stop_at);
            rtp_info.push(format!(
                "url={}/track{};seq={};rtptime={}",
                base,
                stream.track() + 1,
                stream.sequence(),
                rtptime
            ));
            stream.deliver_task = Some(scheduler.schedule(
                Duration::ZERO,
                Event::Deliver {
                    session: key,
                    stream: index,
                },
            ));
            stream.report_task = Some(scheduler.schedule_periodic(
                SENDER_REPORT_INTERVAL,
                Event::SenderReport {
                    session: key,
                    stream: index,
                },
            ));
        }
        session.set_state(SessionState::Playing);
        tracing::info!(session_id = %session.id, stream = session.stream_name(), npt = npt_start, scale, "session started playing");

        let mut response = RtspResponse::ok()
            .add_header("Range", &range::format_range(npt_start, stop_at))
            .add_header("Session", &session.session_header_value())
            .add_header("RTP-Info", &rtp_info.join(","));
        if requested_scale.is_some() {
            response = response.add_header("Scale", &range::format_scale(scale));
        }
        response
    }

    fn handle_pause(&mut self, request: &RtspRequest) -> RtspResponse {
        let Some(key) = self.session_key(request) else {
            tracing::warn!(session = ?request.session_id(), "PAUSE for unknown session");
            return RtspResponse::session_not_found();
        };
        let scheduler = &mut *self.scheduler;
        let Some(session) = self.core.sessions.get_mut(key) else {
            return RtspResponse::session_not_found();
        };
        for stream in &mut session.streams {
            for task in stream.take_tasks() {
                scheduler.cancel(task);
            }
            stream.pause();
        }
        if session.state == SessionState::Playing {
            session.set_state(SessionState::Paused);
        }
        tracing::info!(session_id = %session.id, "session paused");
        RtspResponse::ok().add_header("Session", &session.session_header_value())
    }

    fn handle_teardown(&mut self, request: &RtspRequest) -> RtspResponse {
        let Some(key) = self.session_key(request) else {
            tracing::warn!(session = ?request.session_id(), "TEARDOWN for unknown session");
            return RtspResponse::session_not_found();
        };
        self.core.teardown_session(self.scheduler, key, "TEARDOWN");
        RtspResponse::ok()
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive (RFC 2326 §10.8).
    fn handle_parameter(&self, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(method = %request.method, "keepalive");
        match self.session_key(request).and_then(|key| self.core.sessions.get(key)) {
            Some(session) => RtspResponse::ok().add_header("Session", &session.session_header_value()),
            None => RtspResponse::ok(),
        }
    }
}

/// Request URL without a trailing `/` or `/trackN` control suffix.
fn aggregate_url(uri: &str) -> &str {
    let trimmed = uri.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((head, tail))
            if tail
                .strip_prefix("track")
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())) =>
        {
            head
        }
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_url_strips_control_suffix() {
        assert_eq!(aggregate_url("rtsp://h/a.264/track1"), "rtsp://h/a.264");
        assert_eq!(aggregate_url("rtsp://h/a.264/"), "rtsp://h/a.264");
        assert_eq!(aggregate_url("rtsp://h/dir/a.ts"), "rtsp://h/dir/a.ts");
        assert_eq!(aggregate_url("rtsp://h/tracks.264"), "rtsp://h/tracks.264");
    }
}
