use std::path::{Component, Path};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::LookupError;
use crate::media::MediaFormat;
use crate::media::aac::AacFormat;
use crate::media::h264::H264Format;
use crate::media::h265::H265Format;
use crate::media::mpa::MpaFormat;
use crate::media::ts::TsFormat;
use crate::media::wav::WavFormat;
use crate::media_session::ServerMediaSession;

/// Maps file-name suffixes to the [`MediaFormat`] that can serve them.
///
/// Entries are matched in registration order against the lower-cased suffix
/// of the stream name's last path segment. Cloning shares the table.
#[derive(Clone)]
pub struct MediaSourceRegistry {
    formats: Arc<RwLock<Vec<(String, Arc<dyn MediaFormat>)>>>,
}

impl MediaSourceRegistry {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            formats: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// The bundled formats.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        let h264: Arc<dyn MediaFormat> = Arc::new(H264Format::default());
        let h265: Arc<dyn MediaFormat> = Arc::new(H265Format::default());
        registry.register_shared(".264", h264.clone());
        registry.register_shared(".h264", h264);
        registry.register_shared(".265", h265.clone());
        registry.register_shared(".h265", h265);
        registry.register(".aac", AacFormat);
        registry.register(".mp3", MpaFormat);
        registry.register(".wav", WavFormat);
        registry.register(".ts", TsFormat);
        registry
    }

    /// Add a format for `suffix` (with or without the leading dot),
    /// replacing any existing entry for it.
    pub fn register(&self, suffix: &str, format: impl MediaFormat + 'static) {
        self.register_shared(suffix, Arc::new(format));
    }

    pub fn register_shared(&self, suffix: &str, format: Arc<dyn MediaFormat>) {
        let suffix = normalize_suffix(suffix);
        let mut formats = self.formats.write();
        match formats.iter_mut().find(|(s, _)| *s == suffix) {
            Some(entry) => entry.1 = format,
            None => formats.push((suffix.clone(), format)),
        }
        tracing::debug!(suffix, "media format registered");
    }

    /// Registered suffixes with the name of their format, in registration order.
    pub fn formats(&self) -> Vec<(String, &'static str)> {
        self.formats
            .read()
            .iter()
            .map(|(suffix, format)| (suffix.clone(), format.name()))
            .collect()
    }

    /// Format for `stream_name`, by suffix.
    pub fn lookup(&self, stream_name: &str) -> Result<Arc<dyn MediaFormat>, LookupError> {
        let not_found = || LookupError::NotFound(stream_name.to_string());
        let segment = stream_name.rsplit('/').next().unwrap_or(stream_name);
        let dot = segment.rfind('.').ok_or_else(not_found)?;
        let suffix = segment[dot..].to_ascii_lowercase();
        self.formats
            .read()
            .iter()
            .find(|(s, _)| *s == suffix)
            .map(|(_, format)| format.clone())
            .ok_or_else(not_found)
    }

    /// Resolve `stream_name` under `media_root`, probe the file and build
    /// its [`ServerMediaSession`].
    pub fn create(
        &self,
        media_root: &Path,
        stream_name: &str,
    ) -> Result<ServerMediaSession, LookupError> {
        if !is_safe_name(stream_name) {
            tracing::warn!(stream = stream_name, "rejected stream name outside media root");
            return Err(LookupError::NotFound(stream_name.to_string()));
        }
        let format = self.lookup(stream_name)?;
        let path = media_root.join(stream_name);
        if !path.is_file() {
            return Err(LookupError::NotFound(stream_name.to_string()));
        }

        let tracks = format.probe(&path)?;
        if tracks.is_empty() {
            return Err(LookupError::malformed(stream_name, "no playable tracks"));
        }
        tracing::info!(
            stream = stream_name,
            format = format.name(),
            tracks = tracks.len(),
            "media session created"
        );
        Ok(ServerMediaSession::new(stream_name, path, format, tracks))
    }
}

impl Default for MediaSourceRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn normalize_suffix(suffix: &str) -> String {
    let suffix = suffix.to_ascii_lowercase();
    if suffix.starts_with('.') {
        suffix
    } else {
        format!(".{}", suffix)
    }
}

/// Relative, non-empty, and without `..` components.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
