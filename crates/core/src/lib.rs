//! On-demand RTSP media server.
//!
//! Clients name a file relative to the media root
//! (`rtsp://host/movies/clip.264`); the server probes it on first use,
//! describes it in SDP and streams it over RTP, one independent pipeline
//! per client, with UDP, interleaved TCP or RTSP-over-HTTP transport.
//!
//! ```no_run
//! use media_server::{Server, ServerConfig};
//!
//! let config = ServerConfig {
//!     rtsp_port: 8554,
//!     media_root: "/srv/media".into(),
//!     ..Default::default()
//! };
//! Server::bind(config)?.run()?;
//! # Ok::<(), media_server::RtspError>(())
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod media;
pub mod media_session;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod transport;

pub use auth::AuthDatabase;
pub use config::ServerConfig;
pub use error::{LookupError, Result, RtspError};
pub use media::{MediaFormat, Packetizer};
pub use media_session::{ServerMediaSession, SessionCache};
pub use registry::MediaSourceRegistry;
pub use server::{Server, ServerHandle};
