//! Per-track delivery state of an RTSP session.
//!
//! A [`Stream`] owns one independent [`MediaPipeline`] and the transport it
//! was set up with. The server calls [`Stream::deliver`] from a scheduler
//! timer; each call sends every frame that has come due (up to a bounded
//! burst) and reports when the next one is due.
//!
//! ## Timelines
//!
//! Three clocks are involved:
//!
//! ```text
//! npt      position in the file (frame pts), may jump on seek
//! wall     when a frame is due:  play_start + |pts - npt_start| / |scale|
//! output   what RTP timestamps are derived from; never goes backwards
//! ```
//!
//! The output timeline continues across pause/resume, seeks, and scale
//! changes, so a client never sees the RTP clock step back.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

use mio::Token;

use crate::media::{Frame, FrameSource, MediaPipeline, Packetizer, TrackInfo, rtcp};
use crate::scheduler::TaskHandle;
use crate::transport::udp::{RtpSocketPair, send_datagram};

/// Most frames sent in one delivery tick.
pub const MAX_BURST: usize = 32;

/// Interval between RTCP sender reports while playing.
pub const SENDER_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Where interleaved packets are written. Implemented by the server over
/// its connection table.
pub trait MediaSink {
    fn send_interleaved(&mut self, conn: usize, channel: u8, packet: &[u8]) -> io::Result<()>;
}

#[derive(Debug)]
pub struct UdpBinding {
    pub sockets: RtpSocketPair,
    pub client_rtp: SocketAddr,
    pub client_rtcp: SocketAddr,
    /// Scheduler registration of the RTCP socket.
    pub rtcp_token: Option<Token>,
}

#[derive(Debug)]
pub enum TransportBinding {
    Udp(UdpBinding),
    Interleaved {
        conn: usize,
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

impl TransportBinding {
    pub fn send_rtp(&self, sink: &mut dyn MediaSink, packet: &[u8]) -> io::Result<()> {
        match self {
            Self::Udp(udp) => send_datagram(&udp.sockets.rtp, packet, udp.client_rtp),
            Self::Interleaved { conn, rtp_channel, .. } => {
                sink.send_interleaved(*conn, *rtp_channel, packet)
            }
        }
    }

    pub fn send_rtcp(&self, sink: &mut dyn MediaSink, packet: &[u8]) -> io::Result<()> {
        match self {
            Self::Udp(udp) => send_datagram(&udp.sockets.rtcp, packet, udp.client_rtcp),
            Self::Interleaved { conn, rtcp_channel, .. } => {
                sink.send_interleaved(*conn, *rtcp_channel, packet)
            }
        }
    }

    /// `Transport` response header value.
    pub fn describe(&self) -> String {
        match self {
            Self::Udp(udp) => format!(
                "RTP/AVP;unicast;destination={};client_port={}-{};server_port={}-{}",
                udp.client_rtp.ip(),
                udp.client_rtp.port(),
                udp.client_rtcp.port(),
                udp.sockets.rtp_port,
                udp.sockets.rtcp_port()
            ),
            Self::Interleaved {
                rtp_channel,
                rtcp_channel,
                ..
            } => format!("RTP/AVP/TCP;unicast;interleaved={}-{}", rtp_channel, rtcp_channel),
        }
    }

    pub fn interleaved_conn(&self) -> Option<usize> {
        match self {
            Self::Interleaved { conn, .. } => Some(*conn),
            Self::Udp(_) => None,
        }
    }
}

/// Maps presentation times to wall-clock due times and RTP timestamps.
#[derive(Debug, Clone)]
pub struct PlayClock {
    clock_rate: f64,
    ts_offset: u32,
    wall_start: Instant,
    npt_start: f64,
    scale: f64,
    out_base: f64,
    last_out: f64,
    next_out: f64,
}

impl PlayClock {
    pub fn new(clock_rate: u32, ts_offset: u32, now: Instant) -> Self {
        Self {
            clock_rate: f64::from(clock_rate),
            ts_offset,
            wall_start: now,
            npt_start: 0.0,
            scale: 1.0,
            out_base: 0.0,
            last_out: 0.0,
            next_out: 0.0,
        }
    }

    /// Begin a play span at `npt_start`. The output timeline picks up where
    /// the previous span left off.
    pub fn start(&mut self, now: Instant, npt_start: f64, scale: f32) {
        self.wall_start = now;
        self.npt_start = npt_start;
        self.scale = f64::from(scale.abs()).max(f64::EPSILON);
        self.out_base = self.next_out;
    }

    fn offset(&self, pts: f64) -> f64 {
        (pts - self.npt_start).abs() / self.scale
    }

    pub fn due(&self, pts: f64) -> Instant {
        self.wall_start + Duration::from_secs_f64(self.offset(pts))
    }

    /// RTP timestamp for a frame at `pts`; advances the output timeline.
    pub fn stamp(&mut self, pts: f64, duration: f64) -> u32 {
        let out = (self.out_base + self.offset(pts)).max(self.last_out);
        self.last_out = out;
        self.next_out = self.next_out.max(out + duration.max(0.0) / self.scale);
        self.timestamp(out)
    }

    /// Timestamp of the first packet of the current span.
    pub fn start_timestamp(&self) -> u32 {
        self.timestamp(self.out_base)
    }

    /// Timestamp corresponding to `now` on the current span, for sender
    /// reports.
    pub fn timestamp_at(&self, now: Instant) -> u32 {
        let elapsed = now.saturating_duration_since(self.wall_start).as_secs_f64();
        self.timestamp((self.out_base + elapsed).max(self.last_out))
    }

    /// Timestamp of the most recent frame, or of the span start if none
    /// was sent in it.
    pub fn last_timestamp(&self) -> u32 {
        self.timestamp(self.last_out.max(self.out_base))
    }

    fn timestamp(&self, out: f64) -> u32 {
        self.ts_offset
            .wrapping_add((out * self.clock_rate) as u64 as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Ready,
    Playing,
    Paused,
    Ended,
}

/// Result of one delivery tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Call again after this long.
    Wait(Duration),
    /// End of file or of the requested range; BYE has been sent.
    Ended,
}

pub struct Stream {
    track: usize,
    source: Box<dyn FrameSource>,
    packetizer: Box<dyn Packetizer>,
    binding: TransportBinding,
    clock: PlayClock,
    state: StreamState,
    pending: Option<Frame>,
    position: f64,
    scale: f32,
    stop_at: Option<f64>,
    sent_media: bool,
    cname: String,
    pub(crate) deliver_task: Option<TaskHandle>,
    pub(crate) report_task: Option<TaskHandle>,
}

impl Stream {
    pub fn new(
        track: usize,
        info: &TrackInfo,
        pipeline: MediaPipeline,
        binding: TransportBinding,
        cname: &str,
        now: Instant,
    ) -> Self {
        Self {
            track,
            source: pipeline.source,
            packetizer: pipeline.packetizer,
            binding,
            clock: PlayClock::new(info.clock_rate, rand::random::<u32>(), now),
            state: StreamState::Ready,
            pending: None,
            position: 0.0,
            scale: 1.0,
            stop_at: None,
            sent_media: false,
            cname: cname.to_string(),
            deliver_task: None,
            report_task: None,
        }
    }

    pub fn track(&self) -> usize {
        self.track
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn binding(&self) -> &TransportBinding {
        &self.binding
    }

    pub fn binding_mut(&mut self) -> &mut TransportBinding {
        &mut self.binding
    }

    pub fn sent_media(&self) -> bool {
        self.sent_media
    }

    /// Normal play time of the next frame to be sent.
    pub fn position(&self) -> f64 {
        self.pending.as_ref().map_or(self.position, |frame| frame.pts)
    }

    /// Sequence number of the next RTP packet.
    pub fn sequence(&self) -> u16 {
        self.packetizer.header().sequence()
    }

    pub fn ssrc(&self) -> u32 {
        self.packetizer.header().ssrc
    }

    /// Reposition to `npt`. Returns the position reached, or `None` when
    /// the source kept its position.
    pub fn seek(&mut self, npt: f64) -> io::Result<Option<f64>> {
        let reached = self.source.seek(npt)?;
        if let Some(position) = reached {
            self.pending = None;
            self.position = position;
            if self.state == StreamState::Ended {
                self.state = StreamState::Ready;
            }
        }
        Ok(reached)
    }

    /// Ask the source for a trick-play rate. Returns the rate granted.
    pub fn set_scale(&mut self, scale: f32) -> f32 {
        let granted = self.source.set_scale(scale);
        if granted != self.scale {
            // Frames read ahead at the old rate are not valid any more.
            self.pending = None;
        }
        self.scale = granted;
        granted
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Start (or resume) delivery from the current position. Returns the
    /// RTP timestamp of the first packet, for `RTP-Info`.
    pub fn play(&mut self, now: Instant, stop_at: Option<f64>) -> u32 {
        self.clock.start(now, self.position(), self.scale);
        self.stop_at = stop_at;
        if self.state != StreamState::Ended {
            self.state = StreamState::Playing;
        }
        self.clock.start_timestamp()
    }

    pub fn pause(&mut self) {
        if self.state == StreamState::Playing {
            self.state = StreamState::Paused;
        }
    }

    /// Scheduler tasks that must be cancelled when delivery stops.
    pub fn take_tasks(&mut self) -> impl Iterator<Item = TaskHandle> + use<> {
        [self.deliver_task.take(), self.report_task.take()]
            .into_iter()
            .flatten()
    }

    fn past_stop(&self, pts: f64) -> bool {
        match self.stop_at {
            Some(end) if self.scale > 0.0 => pts >= end,
            Some(end) => pts <= end,
            None => false,
        }
    }

    /// Send every frame that is due at `now`, up to [`MAX_BURST`].
    pub fn deliver(&mut self, now: Instant, sink: &mut dyn MediaSink) -> io::Result<Delivery> {
        if self.state != StreamState::Playing {
            return Ok(Delivery::Wait(SENDER_REPORT_INTERVAL));
        }
        for _ in 0..MAX_BURST {
            let frame = match self.pending.take() {
                Some(frame) => frame,
                None => match self.source.next_frame()? {
                    Some(frame) => frame,
                    None => return self.finish(sink),
                },
            };
            if self.past_stop(frame.pts) {
                self.pending = Some(frame);
                return self.finish(sink);
            }

            let due = self.clock.due(frame.pts);
            if due > now {
                let wait = due - now;
                self.pending = Some(frame);
                return Ok(Delivery::Wait(wait));
            }

            let timestamp = self.clock.stamp(frame.pts, frame.duration);
            for packet in self.packetizer.packetize(&frame.data, timestamp) {
                self.binding.send_rtp(sink, &packet)?;
            }
            self.sent_media = true;
            self.position = if self.scale < 0.0 {
                frame.pts
            } else {
                frame.pts + frame.duration
            };
            tracing::trace!(
                track = self.track,
                pts = frame.pts,
                rtp_ts = timestamp,
                bytes = frame.data.len(),
                "frame sent"
            );
        }
        Ok(Delivery::Wait(Duration::ZERO))
    }

    fn finish(&mut self, sink: &mut dyn MediaSink) -> io::Result<Delivery> {
        self.state = StreamState::Ended;
        let packet = self.goodbye();
        self.binding.send_rtcp(sink, &packet)?;
        tracing::debug!(track = self.track, position = self.position(), "end of stream");
        Ok(Delivery::Ended)
    }

    pub fn sender_report(&self, now: Instant) -> Vec<u8> {
        rtcp::sender_report(
            self.packetizer.header(),
            self.clock.timestamp_at(now),
            SystemTime::now(),
            &self.cname,
        )
    }

    /// SR, SDES and BYE, sent when the stream stops.
    pub fn goodbye(&self) -> Vec<u8> {
        rtcp::goodbye(
            self.packetizer.header(),
            self.clock.last_timestamp(),
            SystemTime::now(),
            &self.cname,
        )
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("track", &self.track)
            .field("state", &self.state)
            .field("position", &self.position())
            .field("binding", &self.binding)
            .finish()
    }
}
