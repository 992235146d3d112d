use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use media_server::config::{DEFAULT_RTSP_PORT, DEFAULT_SESSION_TIMEOUT_SECS, DEFAULT_TUNNEL_PORTS};
use media_server::media::index::TsIndex;
use media_server::{RtspError, Server, ServerConfig};

/// Exit status when the RTSP port cannot be bound.
const EXIT_BIND_FAILED: u8 = 10;

#[derive(Parser)]
#[command(
    name = "media-server",
    version,
    about = "On-demand RTSP server for media files"
)]
struct Args {
    /// Interface to listen on (all interfaces when omitted)
    #[arg(long)]
    listen_addr: Option<IpAddr>,

    /// RTSP port
    #[arg(long, short = 'p', default_value_t = DEFAULT_RTSP_PORT)]
    listen_port: u16,

    /// Directory stream names are resolved against
    #[arg(long, short = 'd', default_value = ".")]
    media_dir: PathBuf,

    /// Require digest authentication for this NAME:PASSWORD (repeatable)
    #[arg(long = "user", value_name = "NAME:PASSWORD", value_parser = parse_credentials)]
    users: Vec<(String, String)>,

    /// RTSP-over-HTTP port candidate, tried in order (repeatable)
    #[arg(long = "http-port", value_name = "PORT")]
    http_ports: Vec<u16>,

    /// Disable RTSP-over-HTTP tunneling
    #[arg(long, conflicts_with = "http_ports")]
    no_http: bool,

    /// Seconds without client activity before a session is torn down
    #[arg(long, default_value_t = DEFAULT_SESSION_TIMEOUT_SECS)]
    session_timeout: u64,

    /// Host advertised in SDP instead of the local address
    #[arg(long)]
    public_host: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Write the seek index for a transport stream file next to it
    Index {
        /// `.ts` file to index
        file: PathBuf,
    },
}

fn parse_credentials(value: &str) -> Result<(String, String), String> {
    match value.split_once(':') {
        Some((name, password)) if !name.is_empty() => Ok((name.to_string(), password.to_string())),
        _ => Err("expected NAME:PASSWORD".to_string()),
    }
}

/// The address clients should dial: the bound one, or for a wildcard bind
/// the interface that routes outward, falling back to loopback.
fn advertised_ip(bound: IpAddr) -> IpAddr {
    if !bound.is_unspecified() {
        return bound;
    }
    let (outside, loopback): (IpAddr, IpAddr) = match bound {
        IpAddr::V4(_) => (Ipv4Addr::new(192, 0, 2, 1).into(), Ipv4Addr::LOCALHOST.into()),
        IpAddr::V6(_) => (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1).into(), Ipv6Addr::LOCALHOST.into()),
    };
    // Connecting a UDP socket only selects a route; nothing is sent.
    let routed = UdpSocket::bind(SocketAddr::new(bound, 0)).and_then(|socket| {
        socket.connect(SocketAddr::new(outside, 9))?;
        socket.local_addr()
    });
    match routed {
        Ok(local) if !local.ip().is_unspecified() => local.ip(),
        _ => loopback,
    }
}

/// `rtsp://host[:port]/`, leaving out the default port.
fn url_prefix(addr: SocketAddr) -> String {
    if addr.port() != DEFAULT_RTSP_PORT {
        return format!("rtsp://{addr}/");
    }
    match addr.ip() {
        IpAddr::V6(ip) => format!("rtsp://[{ip}]/"),
        ip => format!("rtsp://{ip}/"),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            if let Err(print) = e.print() {
                eprintln!("{print}");
            }
            return ExitCode::from(code);
        }
    };

    if let Some(Command::Index { file }) = &args.command {
        return match TsIndex::build_sidecar(file) {
            Ok((sidecar, index)) => {
                println!(
                    "wrote {} ({} records, {:.3}s)",
                    sidecar.display(),
                    index.records().len(),
                    index.duration().unwrap_or(0.0)
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("failed to index {}: {e}", file.display());
                ExitCode::FAILURE
            }
        };
    }

    let tunnel_ports = if args.no_http {
        Vec::new()
    } else if args.http_ports.is_empty() {
        DEFAULT_TUNNEL_PORTS.to_vec()
    } else {
        args.http_ports
    };
    let config = ServerConfig {
        listen_addr: args.listen_addr,
        rtsp_port: args.listen_port,
        media_root: args.media_dir,
        tunnel_ports,
        session_timeout: Duration::from_secs(args.session_timeout),
        public_host: args.public_host,
        credentials: args.users,
        ..Default::default()
    };

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e @ RtspError::Bind { .. }) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_BIND_FAILED);
        }
        Err(e) => {
            eprintln!("failed to start server: {e}");
            return ExitCode::FAILURE;
        }
    };

    let bound = server.local_addr();
    let addr = SocketAddr::new(advertised_ip(bound.ip()), bound.port());
    println!("Play streams from this server using the URL");
    println!("\t{}<filename>", url_prefix(addr));
    println!("where <filename> is a file present in the media directory.");
    println!("Each file's type is inferred from its name suffix:");
    for (suffix, format) in server.registry().formats() {
        println!("\t\"{suffix}\" => {format}");
    }
    println!("\t\t(a \".tsx\" index next to a \".ts\" file enables seeking and trick play)");
    match server.tunnel_addr() {
        Some(tunnel) => println!(
            "(Port {} serves RTSP-over-HTTP tunneling, and HTTP Live Streaming of indexed \".ts\" files.)",
            tunnel.port()
        ),
        None => println!("(RTSP-over-HTTP tunneling is not available.)"),
    }

    if let Err(e) = server.run() {
        eprintln!("server error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
