use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::Interest;
use mio::net::TcpListener;
use slab::Slab;

use crate::auth::AuthDatabase;
use crate::config::ServerConfig;
use crate::error::{Result, RtspError};
use crate::media::rtcp;
use crate::media_session::SessionCache;
use crate::protocol::handler::MethodHandler;
use crate::protocol::hls::{self, HlsRequest};
use crate::protocol::request::ParsedItem;
use crate::protocol::response::RtspResponse;
use crate::protocol::tunnel::{self, Base64Decoder, Sniff, TunnelRequest};
use crate::registry::MediaSourceRegistry;
use crate::scheduler::{EventHandler, Scheduler, Trigger};
use crate::session::{Delivery, MediaSink, PortAllocator, SessionTable, Stream, StreamState, TransportBinding};
use crate::transport::{ClientContext, Connection, Role};

/// How often idle media sessions are checked for eviction.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Largest RTCP datagram read from a client.
const RTCP_BUFFER: usize = 2048;

/// Everything the scheduler can wake the server up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A listening socket has connections to accept (index into the
    /// listener table: 0 is RTSP, 1 the tunneling port when bound).
    Listener(usize),
    Connection(usize),
    /// RTCP arrived on a stream's UDP socket.
    Rtcp { session: usize, stream: usize },
    /// A stream's next frame is due.
    Deliver { session: usize, stream: usize },
    SenderReport { session: usize, stream: usize },
    /// A session's liveness window may have run out.
    Liveness(usize),
    Reap,
}

/// Writes interleaved packets onto the connection table.
struct ConnectionSink<'a> {
    connections: &'a mut Slab<Connection>,
}

impl MediaSink for ConnectionSink<'_> {
    fn send_interleaved(&mut self, conn: usize, channel: u8, packet: &[u8]) -> io::Result<()> {
        match self.connections.get_mut(conn) {
            Some(connection) => connection.send_interleaved(channel, packet).map(|_| ()),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "interleaved connection is gone",
            )),
        }
    }
}

/// All server state mutated from scheduler callbacks.
pub(crate) struct ServerCore {
    pub(crate) config: ServerConfig,
    pub(crate) registry: MediaSourceRegistry,
    pub(crate) cache: Arc<SessionCache>,
    pub(crate) auth: Option<AuthDatabase>,
    pub(crate) sessions: SessionTable,
    pub(crate) ports: PortAllocator,
    connections: Slab<Connection>,
    listeners: Vec<TcpListener>,
    /// `x-sessioncookie` → key of the tunnel's GET connection.
    tunnels: HashMap<String, usize>,
}

impl ServerCore {
    fn accept(&mut self, scheduler: &mut Scheduler<Event>, index: usize) -> Result<()> {
        let Some(listener) = self.listeners.get(index) else {
            return Ok(());
        };
        loop {
            let (mut stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let local = match stream.local_addr() {
                Ok(local) => local,
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "connection vanished before setup");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::trace!(%peer, error = %e, "TCP_NODELAY not set");
            }

            let entry = self.connections.vacant_entry();
            let key = entry.key();
            let token = scheduler.register(
                &mut stream,
                Interest::READABLE | Interest::WRITABLE,
                Event::Connection(key),
            )?;
            entry.insert(Connection::new(
                stream,
                token,
                ClientContext {
                    key,
                    peer,
                    local,
                    nonce: None,
                },
            ));
            tracing::info!(%peer, listener = index, "client connected");
        }
    }

    fn on_connection(&mut self, scheduler: &mut Scheduler<Event>, key: usize, trigger: Trigger) -> Result<()> {
        let Trigger::Io {
            readable,
            writable,
            closed,
        } = trigger
        else {
            return Ok(());
        };
        let Some(conn) = self.connections.get_mut(key) else {
            return Ok(());
        };
        if writable {
            conn.flush()?;
        }
        let mut eof = false;
        if readable || closed {
            let read = conn.read_available()?;
            eof = read.eof;
            if !read.data.is_empty() {
                self.on_bytes(scheduler, key, &read.data)?;
            }
        }

        if eof {
            self.close_connection(scheduler, key, "closed by peer");
        } else if self.connections.get(key).is_some_and(Connection::should_close) {
            self.close_connection(scheduler, key, "closed by server");
        }
        Ok(())
    }

    fn on_bytes(&mut self, scheduler: &mut Scheduler<Event>, key: usize, data: &[u8]) -> Result<()> {
        let Some(conn) = self.connections.get_mut(key) else {
            return Ok(());
        };
        match &mut conn.role {
            Role::Sniffing => {
                conn.head.extend_from_slice(data);
                self.sniff(scheduler, key)
            }
            Role::Rtsp | Role::TunnelGet { .. } => {
                conn.parser.feed(data);
                self.process_items(scheduler, key)
            }
            Role::TunnelPost { cookie, decoder } => {
                let decoded = decoder.decode(data);
                let target = self.tunnels.get(cookie.as_str()).copied();
                match (decoded, target) {
                    (Ok(bytes), Some(get)) => {
                        if let Some(get_conn) = self.connections.get_mut(get) {
                            get_conn.parser.feed(&bytes);
                        }
                        self.process_items(scheduler, get)
                    }
                    (Ok(_), None) => {
                        tracing::warn!(peer = %conn.client.peer, "tunnel POST without a GET half");
                        conn.close_after_flush();
                        Ok(())
                    }
                    (Err(e), _) => {
                        tracing::warn!(peer = %conn.client.peer, error = %e, "invalid base64 in tunnel POST");
                        conn.close_after_flush();
                        Ok(())
                    }
                }
            }
        }
    }

    /// Decide between plain RTSP and an HTTP tunnel half from the first bytes.
    fn sniff(&mut self, scheduler: &mut Scheduler<Event>, key: usize) -> Result<()> {
        let Some(conn) = self.connections.get_mut(key) else {
            return Ok(());
        };
        match tunnel::sniff(&conn.head) {
            Sniff::NeedMore => Ok(()),
            Sniff::Rtsp => {
                conn.role = Role::Rtsp;
                let head = std::mem::take(&mut conn.head);
                conn.parser.feed(&head);
                self.process_items(scheduler, key)
            }
            Sniff::Http => {
                let (request, consumed) = match tunnel::parse_http_head(&conn.head) {
                    None => return Ok(()),
                    Some(Ok(parsed)) => parsed,
                    Some(Err(kind)) => {
                        tracing::warn!(peer = %conn.client.peer, error = %kind, "malformed HTTP request");
                        conn.send(tunnel::bad_request_response().as_bytes())?;
                        conn.close_after_flush();
                        return Ok(());
                    }
                };
                let rest = conn.head.split_off(consumed);
                conn.head.clear();
                match tunnel::classify(&request) {
                    TunnelRequest::Get { cookie } => {
                        tracing::info!(peer = %conn.client.peer, %cookie, "HTTP tunnel opened");
                        conn.role = Role::TunnelGet {
                            cookie: cookie.clone(),
                        };
                        conn.send(tunnel::get_response().as_bytes())?;
                        if self.tunnels.insert(cookie.clone(), key).is_some() {
                            tracing::warn!(%cookie, "tunnel cookie reused; previous GET detached");
                        }
                        Ok(())
                    }
                    TunnelRequest::Post { cookie } => {
                        tracing::debug!(peer = %conn.client.peer, %cookie, "HTTP tunnel POST attached");
                        conn.role = Role::TunnelPost {
                            cookie,
                            decoder: Base64Decoder::new(),
                        };
                        if rest.is_empty() {
                            Ok(())
                        } else {
                            self.on_bytes(scheduler, key, &rest)
                        }
                    }
                    TunnelRequest::Other => {
                        let live = (request.method == "GET")
                            .then(|| HlsRequest::parse(&request.uri))
                            .flatten();
                        match live {
                            Some(live) => {
                                tracing::info!(peer = %conn.client.peer, uri = %request.uri, "HTTP live streaming request");
                                let (registry, root, cache) = (&self.registry, &self.config.media_root, &self.cache);
                                let reply = hls::respond(&live, self.config.hls_segment_duration, |name| {
                                    cache.get_or_create(name, Instant::now(), || registry.create(root, name))
                                });
                                conn.send(&reply)?;
                            }
                            None => {
                                tracing::warn!(peer = %conn.client.peer, method = %request.method, uri = %request.uri, "HTTP request is not a tunnel");
                                conn.send(tunnel::bad_request_response().as_bytes())?;
                            }
                        }
                        conn.close_after_flush();
                        Ok(())
                    }
                }
            }
        }
    }

    /// Answer every complete request buffered on connection `key`.
    fn process_items(&mut self, scheduler: &mut Scheduler<Event>, key: usize) -> Result<()> {
        loop {
            let Some(conn) = self.connections.get_mut(key) else {
                return Ok(());
            };
            let Some(item) = conn.parser.next_item() else {
                return Ok(());
            };
            match item {
                ParsedItem::Request(request) => {
                    let mut client = conn.client.clone();
                    let response = MethodHandler::new(self, scheduler, &mut client).handle(&request);
                    if let Some(conn) = self.connections.get_mut(key) {
                        conn.client = client;
                        conn.send(response.serialize().as_bytes())?;
                    }
                }
                ParsedItem::Interleaved { channel, data } => {
                    let target = self.sessions.by_channel(key, channel).filter(|&(session, index)| {
                        self.sessions
                            .get(session)
                            .and_then(|s| s.streams.get(index))
                            .is_some_and(|stream| {
                                matches!(
                                    stream.binding(),
                                    TransportBinding::Interleaved { rtcp_channel, .. } if *rtcp_channel == channel
                                )
                            })
                    });
                    match target {
                        Some((session, _)) => self.on_client_rtcp(scheduler, session, &data),
                        None => tracing::trace!(channel, "interleaved data ignored"),
                    }
                }
                ParsedItem::Malformed(kind) => {
                    tracing::warn!(peer = %conn.client.peer, error = %kind, "malformed request");
                    conn.send(RtspResponse::bad_request().serialize().as_bytes())?;
                }
            }
        }
    }

    fn on_client_rtcp(&mut self, scheduler: &mut Scheduler<Event>, key: usize, data: &[u8]) {
        match rtcp::inspect(data) {
            Ok(summary) if summary.bye => {
                self.teardown_session(scheduler, key, "client sent RTCP BYE");
            }
            Ok(summary) => {
                tracing::trace!(receiver_reports = summary.receiver_reports, "RTCP from client");
                if let Some(session) = self.sessions.get_mut(key) {
                    session.touch(Instant::now());
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "malformed RTCP from client");
                self.teardown_session(scheduler, key, "malformed RTCP");
            }
        }
    }

    fn on_rtcp_socket(&mut self, scheduler: &mut Scheduler<Event>, key: usize, index: usize) -> Result<()> {
        let mut datagrams = Vec::new();
        {
            let Some(session) = self.sessions.get(key) else {
                return Ok(());
            };
            let Some(TransportBinding::Udp(udp)) = session.streams.get(index).map(Stream::binding) else {
                return Ok(());
            };
            let mut buf = [0u8; RTCP_BUFFER];
            loop {
                match udp.sockets.rtcp.recv_from(&mut buf) {
                    Ok((len, _)) => datagrams.push(buf[..len].to_vec()),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        for datagram in datagrams {
            if self.sessions.get(key).is_none() {
                break;
            }
            self.on_client_rtcp(scheduler, key, &datagram);
        }
        Ok(())
    }

    fn deliver(&mut self, scheduler: &mut Scheduler<Event>, key: usize, index: usize) -> Result<()> {
        let now = Instant::now();
        let Self {
            sessions,
            connections,
            ..
        } = self;
        let Some(session) = sessions.get_mut(key) else {
            return Ok(());
        };
        let Some(stream) = session.streams.get_mut(index) else {
            return Ok(());
        };
        stream.deliver_task = None;

        let mut sink = ConnectionSink { connections };
        match stream.deliver(now, &mut sink)? {
            Delivery::Wait(wait) => {
                if stream.state() == StreamState::Playing {
                    stream.deliver_task = Some(scheduler.schedule(
                        wait,
                        Event::Deliver {
                            session: key,
                            stream: index,
                        },
                    ));
                }
            }
            Delivery::Ended => {
                if let Some(task) = stream.report_task.take() {
                    scheduler.cancel(task);
                }
                tracing::info!(session_id = %session.id, track = stream.track(), "stream reached its end");
            }
        }
        Ok(())
    }

    fn sender_report(&mut self, key: usize, index: usize) -> Result<()> {
        let Self {
            sessions,
            connections,
            ..
        } = self;
        let Some(stream) = sessions
            .get(key)
            .and_then(|session| session.streams.get(index))
        else {
            return Ok(());
        };
        if stream.state() != StreamState::Playing {
            return Ok(());
        }
        let packet = stream.sender_report(Instant::now());
        stream
            .binding()
            .send_rtcp(&mut ConnectionSink { connections }, &packet)?;
        Ok(())
    }

    fn check_liveness(&mut self, scheduler: &mut Scheduler<Event>, key: usize) {
        let now = Instant::now();
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        session.liveness = None;
        if session.is_expired(now) {
            self.teardown_session(scheduler, key, "liveness timeout");
        } else {
            let remaining = session.remaining(now);
            session.liveness = Some(scheduler.schedule(remaining, Event::Liveness(key)));
        }
    }

    /// Stop `stream`, say BYE if it sent media, and give back its ports.
    pub(crate) fn release_stream(&mut self, scheduler: &mut Scheduler<Event>, mut stream: Stream) {
        for task in stream.take_tasks() {
            scheduler.cancel(task);
        }
        if stream.sent_media() && stream.state() != StreamState::Ended {
            let packet = stream.goodbye();
            let mut sink = ConnectionSink {
                connections: &mut self.connections,
            };
            if let Err(e) = stream.binding().send_rtcp(&mut sink, &packet) {
                tracing::debug!(track = stream.track(), error = %e, "RTCP BYE not delivered");
            }
        }
        if let TransportBinding::Udp(udp) = stream.binding_mut() {
            if let Some(token) = udp.rtcp_token.take()
                && let Err(e) = scheduler.deregister(&mut udp.sockets.rtcp, token)
            {
                tracing::debug!(error = %e, "RTCP socket deregistration failed");
            }
            self.ports.release(udp.sockets.rtp_port);
        }
    }

    /// Destroy session `key`: cancel its timers, release every stream and
    /// drop its media session reference. Runs at most once per session.
    pub(crate) fn teardown_session(&mut self, scheduler: &mut Scheduler<Event>, key: usize, reason: &str) {
        let Some(mut session) = self.sessions.remove(key) else {
            return;
        };
        if let Some(task) = session.liveness.take() {
            scheduler.cancel(task);
        }
        for stream in std::mem::take(&mut session.streams) {
            self.release_stream(scheduler, stream);
        }
        self.cache.release(session.stream_name(), Instant::now());
        tracing::info!(
            session_id = %session.id,
            stream = session.stream_name(),
            user = session.user.as_deref().unwrap_or("-"),
            reason,
            "session closed"
        );
    }

    fn close_connection(&mut self, scheduler: &mut Scheduler<Event>, key: usize, reason: &str) {
        let Some(mut conn) = self.connections.try_remove(key) else {
            return;
        };
        if let Err(e) = scheduler.deregister(&mut conn.stream, conn.token) {
            tracing::debug!(error = %e, "connection deregistration failed");
        }
        if let Role::TunnelGet { cookie } = &conn.role
            && self.tunnels.get(cookie) == Some(&key)
        {
            self.tunnels.remove(cookie);
        }

        let interleaved = self.sessions.interleaved_on(key);
        for session in &interleaved {
            self.teardown_session(scheduler, *session, "connection closed");
        }
        for session_key in self.sessions.keys() {
            if let Some(session) = self.sessions.get_mut(session_key)
                && session.connection == Some(key)
            {
                session.connection = None;
            }
        }
        tracing::info!(peer = %conn.peer(), reason, sessions_closed = interleaved.len(), "client disconnected");
    }

    fn shutdown(&mut self, scheduler: &mut Scheduler<Event>) {
        for key in self.sessions.keys() {
            self.teardown_session(scheduler, key, "server shutdown");
        }
        for (_, conn) in self.connections.iter_mut() {
            if let Err(e) = conn.flush() {
                tracing::trace!(peer = %conn.peer(), error = %e, "final flush failed");
            }
        }
    }
}

impl EventHandler<Event> for ServerCore {
    type Error = RtspError;

    fn on_event(&mut self, scheduler: &mut Scheduler<Event>, event: Event, trigger: Trigger) -> Result<()> {
        match event {
            Event::Listener(index) => self.accept(scheduler, index),
            Event::Connection(key) => self.on_connection(scheduler, key, trigger),
            Event::Rtcp { session, stream } => self.on_rtcp_socket(scheduler, session, stream),
            Event::Deliver { session, stream } => self.deliver(scheduler, session, stream),
            Event::SenderReport { session, stream } => self.sender_report(session, stream),
            Event::Liveness(key) => {
                self.check_liveness(scheduler, key);
                Ok(())
            }
            Event::Reap => {
                self.cache.reap(Instant::now());
                Ok(())
            }
        }
    }

    fn on_failure(&mut self, scheduler: &mut Scheduler<Event>, event: Event, error: RtspError) {
        match event {
            Event::Connection(key) => self.close_connection(scheduler, key, "I/O error"),
            Event::Rtcp { session, .. }
            | Event::Deliver { session, .. }
            | Event::SenderReport { session, .. }
            | Event::Liveness(session) => {
                tracing::warn!(%error, "tearing down session after transport failure");
                self.teardown_session(scheduler, session, "transport failure");
            }
            Event::Listener(index) => tracing::error!(listener = index, %error, "accept failed"),
            Event::Reap => {}
        }
    }
}

/// On-demand RTSP media server.
///
/// [`bind`](Self::bind) opens every listening socket up front so address
/// problems surface before the server starts; [`run`](Self::run) then
/// drives all connections, sessions and media delivery from the calling
/// thread until stopped, and [`spawn`](Self::spawn) does the same on a
/// dedicated thread.
pub struct Server {
    scheduler: Scheduler<Event>,
    core: ServerCore,
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
    tunnel_addr: Option<SocketAddr>,
}

impl Server {
    /// Bind with the default media format table.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        Self::with_registry(config, MediaSourceRegistry::with_defaults())
    }

    pub fn with_registry(config: ServerConfig, registry: MediaSourceRegistry) -> Result<Self> {
        let mut scheduler = Scheduler::new()?;

        let addr = config.rtsp_bind_addr();
        let mut rtsp = TcpListener::bind(addr).map_err(|source| RtspError::Bind { addr, source })?;
        let local_addr = rtsp.local_addr()?;
        scheduler.register(&mut rtsp, Interest::READABLE, Event::Listener(0))?;
        let mut listeners = vec![rtsp];

        let mut tunnel_addr = None;
        for &port in &config.tunnel_ports {
            let addr = std::net::SocketAddr::new(config.bind_ip(), port);
            match TcpListener::bind(addr) {
                Ok(mut listener) => {
                    let bound = listener.local_addr()?;
                    scheduler.register(&mut listener, Interest::READABLE, Event::Listener(listeners.len()))?;
                    listeners.push(listener);
                    tracing::info!(addr = %bound, "RTSP-over-HTTP tunneling enabled");
                    tunnel_addr = Some(bound);
                    break;
                }
                Err(e) => tracing::debug!(port, error = %e, "tunneling port unavailable"),
            }
        }
        if tunnel_addr.is_none() && !config.tunnel_ports.is_empty() {
            tracing::warn!(ports = ?config.tunnel_ports, "RTSP-over-HTTP tunneling disabled: no port could be bound");
        }

        scheduler.schedule_periodic(REAP_INTERVAL, Event::Reap);

        let auth = config.requires_auth().then(|| {
            AuthDatabase::with_users(
                &config.auth_realm,
                config
                    .credentials
                    .iter()
                    .map(|(user, password)| (user.as_str(), password.as_str())),
            )
        });

        let core = ServerCore {
            registry,
            cache: Arc::new(SessionCache::new(config.idle_grace)),
            auth,
            sessions: SessionTable::new(),
            ports: PortAllocator::new(config.rtp_port_range.clone()),
            connections: Slab::new(),
            listeners,
            tunnels: HashMap::new(),
            config,
        };

        Ok(Self {
            scheduler,
            core,
            running: Arc::new(AtomicBool::new(true)),
            local_addr,
            tunnel_addr,
        })
    }

    /// Address the RTSP listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the RTSP-over-HTTP listener, when one could be bound.
    pub fn tunnel_addr(&self) -> Option<SocketAddr> {
        self.tunnel_addr
    }

    /// Media format table; formats registered here are used by later lookups.
    pub fn registry(&self) -> &MediaSourceRegistry {
        &self.core.registry
    }

    pub fn media_sessions(&self) -> Arc<SessionCache> {
        self.core.cache.clone()
    }

    /// Flag that keeps [`run`](Self::run) looping; clear it to stop.
    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Serve on the calling thread until the running flag is cleared.
    pub fn run(mut self) -> Result<()> {
        tracing::info!(addr = %self.local_addr, "RTSP server listening");
        self.scheduler.run(&mut self.core, &self.running)?;
        self.core.shutdown(&mut self.scheduler);
        tracing::info!("server stopped");
        Ok(())
    }

    /// Serve on a background thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let running = self.running.clone();
        let local_addr = self.local_addr;
        let tunnel_addr = self.tunnel_addr;
        let cache = self.core.cache.clone();
        let thread = thread::Builder::new()
            .name("media-server".to_string())
            .spawn(move || self.run())?;
        Ok(ServerHandle {
            running,
            thread: Some(thread),
            local_addr,
            tunnel_addr,
            cache,
        })
    }
}

/// Handle to a server started with [`Server::spawn`]. Dropping it stops
/// the server.
pub struct ServerHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<()>>>,
    local_addr: SocketAddr,
    tunnel_addr: Option<SocketAddr>,
    cache: Arc<SessionCache>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tunnel_addr(&self) -> Option<SocketAddr> {
        self.tunnel_addr
    }

    pub fn media_sessions(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the server and wait for its thread to finish.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| RtspError::Io(io::Error::other("server thread panicked")))?,
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "server did not shut down cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::request::RtspRequest;

    fn server(test: &str) -> Server {
        let dir = std::env::temp_dir().join(format!("media-server-core-{test}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut data = Vec::new();
        for nal in [&[0x67, 0x42, 0x00, 0x1e][..], &[0x68, 0xce, 0x38][..], &[0x65, 0x88, 0x84][..]] {
            data.extend_from_slice(&[0, 0, 0, 1]);
            data.extend_from_slice(nal);
        }
        std::fs::write(dir.join("clip.264"), data).unwrap();
        Server::bind(ServerConfig {
            listen_addr: Some("127.0.0.1".parse().unwrap()),
            rtsp_port: 0,
            tunnel_ports: Vec::new(),
            media_root: dir,
            rtp_port_range: 45800..=45899,
            ..Default::default()
        })
        .unwrap()
    }

    fn request(server: &mut Server, raw: &str) -> RtspResponse {
        let mut client = ClientContext {
            key: 0,
            peer: "127.0.0.1:5000".parse().unwrap(),
            local: server.local_addr,
            nonce: None,
        };
        let request = RtspRequest::parse(raw).unwrap();
        MethodHandler::new(&mut server.core, &mut server.scheduler, &mut client).handle(&request)
    }

    #[test]
    fn teardown_happens_once() {
        let mut server = server("teardown");
        let response = request(
            &mut server,
            "SETUP rtsp://127.0.0.1/clip.264/track1 RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP;unicast;client_port=5002-5003\r\n\r\n",
        );
        assert_eq!(response.status_code, 200);
        let id = response.header("Session").unwrap().split(';').next().unwrap().to_string();
        let key = server.core.sessions.find(&id).unwrap();
        assert_eq!(server.core.ports.in_use(), 1);
        assert_eq!(server.core.cache.ref_count("clip.264"), Some(1));

        server.core.teardown_session(&mut server.scheduler, key, "liveness timeout");
        server.core.teardown_session(&mut server.scheduler, key, "liveness timeout");
        assert!(server.core.sessions.is_empty());
        assert_eq!(server.core.ports.in_use(), 0);
        assert_eq!(server.core.cache.ref_count("clip.264"), Some(0));

        // A liveness timer that was already queued finds nothing to do.
        server
            .core
            .on_event(&mut server.scheduler, Event::Liveness(key), Trigger::Timer)
            .unwrap();
        assert_eq!(server.core.cache.ref_count("clip.264"), Some(0));
    }

    #[test]
    fn resetup_of_a_track_reuses_the_session() {
        let mut server = server("resetup");
        let first = request(
            &mut server,
            "SETUP rtsp://127.0.0.1/clip.264/track1 RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP;unicast;client_port=5002-5003\r\n\r\n",
        );
        let id = first.header("Session").unwrap().split(';').next().unwrap().to_string();
        let again = request(
            &mut server,
            &format!(
                "SETUP rtsp://127.0.0.1/clip.264/track1 RTSP/1.0\r\nCSeq: 2\r\nSession: {id}\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n"
            ),
        );
        assert_eq!(again.status_code, 200);
        let key = server.core.sessions.find(&id).unwrap();
        assert_eq!(server.core.sessions.get(key).unwrap().streams.len(), 1);
        assert_eq!(server.core.ports.in_use(), 0, "UDP pair of the replaced stream released");
        assert_eq!(server.core.cache.ref_count("clip.264"), Some(1));

        let other = request(
            &mut server,
            &format!(
                "SETUP rtsp://127.0.0.1/other.264/track1 RTSP/1.0\r\nCSeq: 3\r\nSession: {id}\r\nTransport: RTP/AVP/TCP;unicast\r\n\r\n"
            ),
        );
        assert_eq!(other.status_code, 459);
    }

    #[test]
    fn interleaved_channels_are_not_shared_between_sessions() {
        let mut server = server("channels");
        let setup = "SETUP rtsp://127.0.0.1/clip.264/track1 RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n";
        let first = request(&mut server, setup);
        let second = request(&mut server, setup);
        assert_eq!(first.status_code, 200);
        assert_eq!(second.status_code, 200);
        assert_eq!(first.header("Transport"), Some("RTP/AVP/TCP;unicast;interleaved=0-1"));
        assert_eq!(second.header("Transport"), Some("RTP/AVP/TCP;unicast;interleaved=2-3"));

        let first_id = first.header("Session").unwrap().split(';').next().unwrap().to_string();
        let second_id = second.header("Session").unwrap().split(';').next().unwrap().to_string();
        let first_key = server.core.sessions.find(&first_id).unwrap();
        let second_key = server.core.sessions.find(&second_id).unwrap();
        assert_eq!(server.core.sessions.by_channel(0, 1), Some((first_key, 0)));
        assert_eq!(server.core.sessions.by_channel(0, 3), Some((second_key, 0)));

        // Re-setting up the same track may keep its own channels.
        let again = request(
            &mut server,
            &format!(
                "SETUP rtsp://127.0.0.1/clip.264/track1 RTSP/1.0\r\nCSeq: 2\r\nSession: {second_id}\r\nTransport: RTP/AVP/TCP;unicast;interleaved=2-3\r\n\r\n"
            ),
        );
        assert_eq!(again.header("Transport"), Some("RTP/AVP/TCP;unicast;interleaved=2-3"));
    }

    #[test]
    fn unauthenticated_requests_neither_refresh_sessions_nor_reach_methods() {
        let mut server = server("auth-order");
        let response = request(
            &mut server,
            "SETUP rtsp://127.0.0.1/clip.264/track1 RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP/TCP;unicast\r\n\r\n",
        );
        let id = response.header("Session").unwrap().split(';').next().unwrap().to_string();
        let key = server.core.sessions.find(&id).unwrap();
        let set_up_at = server.core.sessions.get(key).unwrap().last_activity;

        server.core.auth = Some(AuthDatabase::with_users("LIVE", [("alice", "secret")]));
        std::thread::sleep(std::time::Duration::from_millis(20));

        let keep_alive = request(
            &mut server,
            &format!("GET_PARAMETER rtsp://127.0.0.1/clip.264 RTSP/1.0\r\nCSeq: 2\r\nSession: {id}\r\n\r\n"),
        );
        assert_eq!(keep_alive.status_code, 401);
        assert_eq!(server.core.sessions.get(key).unwrap().last_activity, set_up_at);

        let record = request(&mut server, "RECORD rtsp://127.0.0.1/clip.264 RTSP/1.0\r\nCSeq: 3\r\n\r\n");
        assert_eq!(record.status_code, 401);
        let unknown = request(&mut server, "FROB rtsp://127.0.0.1/clip.264 RTSP/1.0\r\nCSeq: 4\r\n\r\n");
        assert_eq!(unknown.status_code, 401);
        let options = request(&mut server, "OPTIONS * RTSP/1.0\r\nCSeq: 5\r\n\r\n");
        assert_eq!(options.status_code, 200);
    }
}
