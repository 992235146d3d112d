//! End-to-end tests: a real server on loopback, driven by plain `std::net`
//! clients over UDP, interleaved TCP and the HTTP tunnel.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use media_server::auth::digest_response;
use media_server::media::index::TsIndex;
use media_server::media::rtcp;
use media_server::{RtspError, Server, ServerConfig, ServerHandle};

const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1e, 0xab];
const PPS: &[u8] = &[0x68, 0xce, 0x38, 0x80];
const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x21, 0x10, 0x20];
const P_SLICE: &[u8] = &[0x41, 0x9a, 0x02, 0x03, 0x04];

/// Fresh media directory holding `sample.264`: `frames` access units,
/// 40 ms apart at the default frame rate.
fn media_dir(test: &str, frames: usize) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("media-server-{test}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let mut data = Vec::new();
    for nal in [SPS, PPS, IDR] {
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(nal);
    }
    for _ in 1..frames {
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(P_SLICE);
    }
    std::fs::write(dir.join("sample.264"), data).unwrap();
    dir
}

fn config(media_root: &Path, ports: std::ops::RangeInclusive<u16>) -> ServerConfig {
    ServerConfig {
        listen_addr: Some("127.0.0.1".parse().unwrap()),
        rtsp_port: 0,
        media_root: media_root.to_path_buf(),
        tunnel_ports: Vec::new(),
        rtp_port_range: ports,
        ..Default::default()
    }
}

fn start(config: ServerConfig) -> ServerHandle {
    Server::bind(config).expect("bind").spawn().expect("spawn")
}

#[derive(Debug)]
struct Response {
    status: u16,
    headers: HashMap<String, String>,
    body: String,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Session id without the `;timeout=` suffix.
    fn session(&self) -> String {
        let value = self.header("Session").expect("Session header");
        value.split(';').next().unwrap().to_string()
    }
}

/// Minimal RTSP client. Requests go out on `writer`; responses and
/// interleaved frames come back through `reader`.
struct Client {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    cseq: u32,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect");
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Self {
            writer: stream.try_clone().unwrap(),
            reader: BufReader::new(stream),
            cseq: 0,
        }
    }

    fn request(&mut self, method: &str, uri: &str, headers: &[(&str, &str)]) -> Response {
        self.cseq += 1;
        let mut message = format!("{method} {uri} RTSP/1.0\r\nCSeq: {}\r\n", self.cseq);
        for (name, value) in headers {
            message.push_str(&format!("{name}: {value}\r\n"));
        }
        message.push_str("\r\n");
        self.writer.write_all(message.as_bytes()).unwrap();
        let response = read_response(&mut self.reader);
        assert_eq!(response.header("CSeq"), Some(self.cseq.to_string().as_str()));
        response
    }

    /// Next `$`-framed packet.
    fn interleaved(&mut self) -> (u8, Vec<u8>) {
        let mut head = [0u8; 4];
        self.reader.read_exact(&mut head).unwrap();
        assert_eq!(head[0], b'$', "expected an interleaved frame");
        let mut packet = vec![0u8; usize::from(u16::from_be_bytes([head[2], head[3]]))];
        self.reader.read_exact(&mut packet).unwrap();
        (head[1], packet)
    }
}

/// Read one RTSP response, skipping interleaved frames in front of it.
fn read_response(reader: &mut impl BufRead) -> Response {
    loop {
        let first = reader.fill_buf().unwrap().first().copied();
        if first != Some(b'$') {
            break;
        }
        let mut head = [0u8; 4];
        reader.read_exact(&mut head).unwrap();
        let mut skip = vec![0u8; usize::from(u16::from_be_bytes([head[2], head[3]]))];
        reader.read_exact(&mut skip).unwrap();
    }

    let mut status_line = String::new();
    reader.read_line(&mut status_line).unwrap();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or_else(|| panic!("bad status line: {status_line:?}"));

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let mut body = String::new();
    if let Some(len) = headers.get("content-length").and_then(|v| v.parse::<usize>().ok()) {
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).unwrap();
        body = String::from_utf8(buf).unwrap();
    }
    Response {
        status,
        headers,
        body,
    }
}

/// Two adjacent client ports, RTP on the even one.
fn client_udp_pair() -> (UdpSocket, UdpSocket) {
    for port in (47000..47400).step_by(2) {
        if let Ok(rtp) = UdpSocket::bind(("127.0.0.1", port))
            && let Ok(rtcp) = UdpSocket::bind(("127.0.0.1", port + 1))
        {
            rtp.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
            rtcp.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
            return (rtp, rtcp);
        }
    }
    panic!("no free client UDP ports");
}

#[test]
fn udp_session_streams_file_and_says_bye() {
    let dir = media_dir("udp", 10);
    let handle = start(config(&dir, 45000..=45099));
    let url = format!("rtsp://{}/sample.264", handle.local_addr());
    let mut client = Client::connect(handle.local_addr());

    let options = client.request("OPTIONS", &url, &[]);
    assert_eq!(options.status, 200);
    assert!(options.header("Public").unwrap().contains("DESCRIBE"));

    let describe = client.request("DESCRIBE", &url, &[("Accept", "application/sdp")]);
    assert_eq!(describe.status, 200);
    assert_eq!(describe.header("Content-Type"), Some("application/sdp"));
    assert_eq!(describe.header("Content-Base"), Some(format!("{url}/").as_str()));
    assert!(describe.body.starts_with("v=0\r\n"));
    assert!(describe.body.contains("m=video 0 RTP/AVP 96\r\n"));
    assert!(describe.body.contains("a=control:track1\r\n"));

    let (rtp, rtcp_socket) = client_udp_pair();
    let rtp_port = rtp.local_addr().unwrap().port();
    let transport = format!("RTP/AVP;unicast;client_port={}-{}", rtp_port, rtp_port + 1);
    let setup = client.request("SETUP", &format!("{url}/track1"), &[("Transport", &transport)]);
    assert_eq!(setup.status, 200);
    let granted = setup.header("Transport").unwrap();
    assert!(granted.contains(&format!("client_port={}-{}", rtp_port, rtp_port + 1)));
    assert!(granted.contains("server_port="));
    assert!(setup.header("Session").unwrap().ends_with(";timeout=65"));
    let session = setup.session();
    assert_eq!(session.len(), 16);
    assert_eq!(handle.media_sessions().ref_count("sample.264"), Some(1));

    let play = client.request("PLAY", &url, &[("Session", &session), ("Range", "npt=0.000-")]);
    assert_eq!(play.status, 200);
    assert!(play.header("Range").unwrap().starts_with("npt=0.000-"));
    let rtp_info = play.header("RTP-Info").unwrap();
    assert!(rtp_info.starts_with(&format!("url={url}/track1;seq=")));
    assert!(rtp_info.contains(";rtptime="));

    let mut buf = [0u8; 2048];
    let (len, _) = rtp.recv_from(&mut buf).expect("RTP packet");
    assert!(len > 12);
    assert_eq!(buf[0] >> 6, 2);
    assert_eq!(buf[1] & 0x7F, 96);

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut saw_bye = false;
    while !saw_bye && Instant::now() < deadline {
        let Ok((len, _)) = rtcp_socket.recv_from(&mut buf) else {
            break;
        };
        saw_bye = rtcp::inspect(&buf[..len]).is_ok_and(|summary| summary.bye);
    }
    assert!(saw_bye, "no RTCP BYE at end of file");

    let teardown = client.request("TEARDOWN", &url, &[("Session", &session)]);
    assert_eq!(teardown.status, 200);
    assert_eq!(handle.media_sessions().ref_count("sample.264"), Some(0));

    let again = client.request("PLAY", &url, &[("Session", &session)]);
    assert_eq!(again.status, 454);
}

#[test]
fn lookup_and_protocol_errors() {
    let dir = media_dir("errors", 2);
    let handle = start(config(&dir, 45100..=45199));
    let base = format!("rtsp://{}", handle.local_addr());
    let mut client = Client::connect(handle.local_addr());

    assert_eq!(client.request("DESCRIBE", &format!("{base}/missing.264"), &[]).status, 404);
    assert_eq!(client.request("DESCRIBE", &format!("{base}/sample.xyz"), &[]).status, 404);

    let setup = client.request("SETUP", &format!("{base}/sample.264/track1"), &[]);
    assert_eq!(setup.status, 400);

    let multicast = client.request(
        "SETUP",
        &format!("{base}/sample.264/track1"),
        &[("Transport", "RTP/AVP;multicast")],
    );
    assert_eq!(multicast.status, 461);

    let record = client.request("RECORD", &format!("{base}/sample.264"), &[]);
    assert_eq!(record.status, 405);
    assert!(record.header("Allow").is_some());

    assert_eq!(client.request("FROBNICATE", &base, &[]).status, 501);
    assert_eq!(
        client.request("PLAY", &format!("{base}/sample.264"), &[("Session", "0000000000000000")]).status,
        454
    );

    let keepalive = client.request("GET_PARAMETER", &base, &[]);
    assert_eq!(keepalive.status, 200);
}

#[test]
fn digest_authentication() {
    let dir = media_dir("auth", 2);
    let mut config = config(&dir, 45200..=45299);
    config.credentials = vec![("alice".to_string(), "secret".to_string())];
    let handle = start(config);
    let url = format!("rtsp://{}/sample.264", handle.local_addr());
    let mut client = Client::connect(handle.local_addr());

    assert_eq!(client.request("OPTIONS", &url, &[]).status, 200);

    let challenge = client.request("DESCRIBE", &url, &[]);
    assert_eq!(challenge.status, 401);
    let www = challenge.header("WWW-Authenticate").unwrap();
    assert!(www.starts_with("Digest realm=\""));
    let nonce = www
        .split("nonce=\"")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .unwrap()
        .to_string();
    let realm = www
        .split("realm=\"")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .unwrap()
        .to_string();

    let wrong = digest_response("alice", "wrong", &realm, &nonce, "DESCRIBE", &url);
    let header = format!(
        "Digest username=\"alice\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{url}\", response=\"{wrong}\""
    );
    let rejected = client.request("DESCRIBE", &url, &[("Authorization", &header)]);
    assert_eq!(rejected.status, 401);

    let nonce = rejected
        .header("WWW-Authenticate")
        .and_then(|h| h.split("nonce=\"").nth(1))
        .and_then(|rest| rest.split('"').next())
        .unwrap()
        .to_string();
    let good = digest_response("alice", "secret", &realm, &nonce, "DESCRIBE", &url);
    let header = format!(
        "Digest username=\"alice\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{url}\", response=\"{good}\""
    );
    let accepted = client.request("DESCRIBE", &url, &[("Authorization", &header)]);
    assert_eq!(accepted.status, 200);
    assert!(accepted.body.contains("m=video"));
}

#[test]
fn interleaved_media_on_the_rtsp_connection() {
    let dir = media_dir("interleaved", 50);
    let handle = start(config(&dir, 45300..=45399));
    let url = format!("rtsp://{}/sample.264", handle.local_addr());
    let mut client = Client::connect(handle.local_addr());

    let setup = client.request(
        "SETUP",
        &format!("{url}/track1"),
        &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
    );
    assert_eq!(setup.status, 200);
    assert!(setup.header("Transport").unwrap().contains("interleaved=0-1"));
    let session = setup.session();

    let play = client.request("PLAY", &url, &[("Session", &session)]);
    assert_eq!(play.status, 200);

    let (channel, packet) = client.interleaved();
    assert_eq!(channel, 0);
    assert_eq!(packet[0] >> 6, 2);
    assert_eq!(packet[1] & 0x7F, 96);

    let pause = client.request("PAUSE", &url, &[("Session", &session)]);
    assert_eq!(pause.status, 200);
    let teardown = client.request("TEARDOWN", &url, &[("Session", &session)]);
    assert_eq!(teardown.status, 200);
}

#[test]
fn rtsp_over_http_tunnel() {
    let dir = media_dir("tunnel", 2);
    let mut config = config(&dir, 45400..=45499);
    config.tunnel_ports = vec![0];
    let handle = start(config);
    let tunnel = handle.tunnel_addr().expect("tunnel listener");
    let url = format!("rtsp://{}/sample.264", handle.local_addr());

    let get = TcpStream::connect_timeout(&tunnel, Duration::from_secs(2)).unwrap();
    get.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut get_writer = get.try_clone().unwrap();
    get_writer
        .write_all(
            b"GET /sample.264 HTTP/1.0\r\nx-sessioncookie: abc123\r\nAccept: application/x-rtsp-tunnelled\r\n\r\n",
        )
        .unwrap();
    let mut downstream = BufReader::new(get);
    let mut status = String::new();
    downstream.read_line(&mut status).unwrap();
    assert!(status.starts_with("HTTP/1.0 200"), "{status}");
    loop {
        let mut line = String::new();
        downstream.read_line(&mut line).unwrap();
        if line.trim_end().is_empty() {
            break;
        }
    }

    let mut post = TcpStream::connect_timeout(&tunnel, Duration::from_secs(2)).unwrap();
    let request = format!("DESCRIBE {url} RTSP/1.0\r\nCSeq: 1\r\n\r\n");
    let encoded = STANDARD.encode(request);
    post.write_all(
        format!(
            "POST /sample.264 HTTP/1.0\r\nx-sessioncookie: abc123\r\nContent-Type: application/x-rtsp-tunnelled\r\nContent-Length: 32767\r\n\r\n{encoded}"
        )
        .as_bytes(),
    )
    .unwrap();

    let describe = read_response(&mut downstream);
    assert_eq!(describe.status, 200);
    assert_eq!(describe.header("CSeq"), Some("1"));
    assert!(describe.body.contains("a=control:track1"));

    let options = STANDARD.encode(format!("OPTIONS {url} RTSP/1.0\r\nCSeq: 2\r\n\r\n"));
    post.write_all(options.as_bytes()).unwrap();
    let options = read_response(&mut downstream);
    assert_eq!(options.status, 200);
    assert_eq!(options.header("CSeq"), Some("2"));
}

#[test]
fn idle_session_times_out() {
    let dir = media_dir("timeout", 2);
    let mut config = config(&dir, 45500..=45599);
    config.session_timeout = Duration::from_secs(1);
    let handle = start(config);
    let url = format!("rtsp://{}/sample.264", handle.local_addr());
    let mut client = Client::connect(handle.local_addr());

    let (rtp, _rtcp) = client_udp_pair();
    let rtp_port = rtp.local_addr().unwrap().port();
    let transport = format!("RTP/AVP;unicast;client_port={}-{}", rtp_port, rtp_port + 1);
    let setup = client.request("SETUP", &format!("{url}/track1"), &[("Transport", &transport)]);
    assert_eq!(setup.status, 200);
    assert!(setup.header("Session").unwrap().ends_with(";timeout=1"));
    let session = setup.session();

    std::thread::sleep(Duration::from_millis(2500));
    let play = client.request("PLAY", &url, &[("Session", &session)]);
    assert_eq!(play.status, 454);
    assert_eq!(handle.media_sessions().ref_count("sample.264"), Some(0));
}

#[test]
fn keep_alives_hold_a_session_open() {
    let dir = media_dir("keepalive", 2);
    let mut config = config(&dir, 45700..=45799);
    config.session_timeout = Duration::from_secs(1);
    let handle = start(config);
    let url = format!("rtsp://{}/sample.264", handle.local_addr());
    let mut client = Client::connect(handle.local_addr());

    let (rtp, rtcp_socket) = client_udp_pair();
    let rtp_port = rtp.local_addr().unwrap().port();
    let transport = format!("RTP/AVP;unicast;client_port={}-{}", rtp_port, rtp_port + 1);
    let setup = client.request("SETUP", &format!("{url}/track1"), &[("Transport", &transport)]);
    assert_eq!(setup.status, 200);
    let session = setup.session();

    let until = Instant::now() + Duration::from_millis(2500);
    while Instant::now() < until {
        std::thread::sleep(Duration::from_millis(300));
        let keepalive = client.request("GET_PARAMETER", &url, &[("Session", &session)]);
        assert_eq!(keepalive.status, 200);
        assert_eq!(keepalive.session(), session);
    }

    rtcp_socket.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let mut buf = [0u8; 2048];
    assert!(rtcp_socket.recv_from(&mut buf).is_err(), "RTCP sent to a session that was kept alive");
    assert_eq!(handle.media_sessions().ref_count("sample.264"), Some(1));

    let play = client.request("PLAY", &url, &[("Session", &session)]);
    assert_eq!(play.status, 200);
    let (len, _) = rtp.recv_from(&mut buf).expect("RTP packet");
    assert!(len > 12);
}

const TS_PACKET: usize = 188;

/// One packet carrying a single PSI section on `pid`.
fn psi_packet(pid: u16, section: &[u8]) -> Vec<u8> {
    let mut packet = vec![0xFFu8; TS_PACKET];
    packet[0] = 0x47;
    packet[1] = 0x40 | (pid >> 8) as u8;
    packet[2] = pid as u8;
    packet[3] = 0x10;
    packet[4] = 0;
    packet[5..5 + section.len()].copy_from_slice(section);
    packet
}

/// PAT, PMT (one H.264 stream on PID 0x100), then `seconds` of video at
/// 100 packets/s with a PCR every 10 packets and a key frame every 100.
fn transport_stream(seconds: usize) -> Vec<u8> {
    let pat = [0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xF0, 0x00, 0, 0, 0, 0];
    let pmt = [
        0x02, 0xB0, 0x12, 0x00, 0x01, 0xC1, 0x00, 0x00, 0xE1, 0x00, 0xF0, 0x00, 0x1B, 0xE1, 0x00, 0xF0, 0x00,
        0, 0, 0, 0,
    ];
    let mut data = psi_packet(0, &pat);
    data.extend(psi_packet(0x1000, &pmt));
    for n in 0..seconds * 100 {
        let mut packet = vec![0xFFu8; TS_PACKET];
        packet[0] = 0x47;
        packet[1] = 0x01 | if n % 100 == 0 { 0x40 } else { 0 };
        packet[2] = 0x00;
        packet[3] = 0x30;
        packet[4] = 7;
        packet[5] = if n % 100 == 0 { 0x40 } else { 0 };
        if n % 10 == 0 {
            packet[5] |= 0x10;
            let base = ((5.0 + n as f64 / 100.0) * 90_000.0).round() as u64;
            packet[6] = (base >> 25) as u8;
            packet[7] = (base >> 17) as u8;
            packet[8] = (base >> 9) as u8;
            packet[9] = (base >> 1) as u8;
            packet[10] = (((base & 1) as u8) << 7) | 0x7E;
            packet[11] = 0;
        }
        data.extend(packet);
    }
    data
}

/// Plain HTTP GET; the server closes the connection after replying.
fn http_get(addr: SocketAddr, path: &str) -> (u16, HashMap<String, String>, Vec<u8>) {
    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
        .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
        .unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();

    let end = raw.windows(4).position(|w| w == b"\r\n\r\n").expect("HTTP head");
    let head = String::from_utf8(raw[..end].to_vec()).unwrap();
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    (status, headers, raw[end + 4..].to_vec())
}

#[test]
fn http_live_streaming_of_indexed_transport_streams() {
    let dir = media_dir("hls", 2);
    let data = transport_stream(5);
    std::fs::write(dir.join("clip.ts"), &data).unwrap();
    std::fs::write(dir.join("plain.ts"), &data).unwrap();
    TsIndex::build_sidecar(&dir.join("clip.ts")).unwrap();

    let mut config = config(&dir, 45900..=45999);
    config.tunnel_ports = vec![0];
    config.hls_segment_duration = Duration::from_millis(1500);
    let handle = start(config);
    let http = handle.tunnel_addr().expect("HTTP listener");

    let (status, headers, body) = http_get(http, "/clip.ts.m3u8");
    assert_eq!(status, 200);
    assert_eq!(headers.get("content-type").map(String::as_str), Some("application/vnd.apple.mpegurl"));
    let playlist = String::from_utf8(body).unwrap();
    assert!(playlist.starts_with("#EXTM3U\n"));
    assert!(playlist.ends_with("#EXT-X-ENDLIST\n"));
    let uris: Vec<&str> = playlist.lines().filter(|line| !line.starts_with('#')).collect();
    assert!(uris.len() >= 2, "{playlist}");
    assert!(uris.iter().all(|uri| uri.starts_with("/clip.ts?segment=")));

    let (status, headers, first) = http_get(http, uris[0]);
    assert_eq!(status, 200);
    assert_eq!(headers.get("content-type").map(String::as_str), Some("video/mp2t"));
    assert_eq!(first.as_slice(), &data[..first.len()]);

    let (status, _, second) = http_get(http, uris[1]);
    assert_eq!(status, 200);
    assert_eq!(second.len() % TS_PACKET, 0);
    assert_eq!(&second[..2 * TS_PACKET], &data[..2 * TS_PACKET], "segment starts with PAT and PMT");
    let keyframe = &second[2 * TS_PACKET..3 * TS_PACKET];
    assert_eq!(keyframe[1] & 0x40, 0x40);
    assert_eq!(keyframe[5] & 0x40, 0x40);
    assert!(first.len() + second.len() - 2 * TS_PACKET <= data.len());

    assert_eq!(http_get(http, "/plain.ts.m3u8").0, 404);
    assert_eq!(http_get(http, "/sample.264.m3u8").0, 404);
    assert_eq!(http_get(http, "/missing.ts.m3u8").0, 404);
    assert_eq!(http_get(http, "/clip.ts").0, 400);
}

#[test]
fn rtsp_port_in_use_is_a_bind_error() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dir = media_dir("bind", 1);
    let mut config = config(&dir, 45600..=45699);
    config.rtsp_port = taken.local_addr().unwrap().port();
    match Server::bind(config) {
        Err(RtspError::Bind { addr, .. }) => assert_eq!(addr, taken.local_addr().unwrap()),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("bound a port that is already in use"),
    }
}
