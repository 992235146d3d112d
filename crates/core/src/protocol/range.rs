//! `Range` (RFC 2326 §12.29) and `Scale` (§12.34) header values.
//!
//! Only normal play time is understood:
//!
//! ```text
//! npt=10-         from 10 s to the end
//! npt=10.5-20     a bounded range
//! npt=0:01:10.5-  hh:mm:ss form
//! npt=now-        current position
//! ```

/// A parsed `npt` range. `start` is `None` for `now`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NptRange {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

fn parse_npt_time(value: &str) -> Option<f64> {
    let value = value.trim();
    let seconds = match value.split(':').collect::<Vec<_>>().as_slice() {
        [secs] => secs.parse::<f64>().ok()?,
        [hours, minutes, secs] => {
            let hours: u32 = hours.parse().ok()?;
            let minutes: u32 = minutes.parse().ok()?;
            let secs: f64 = secs.parse().ok()?;
            f64::from(hours) * 3600.0 + f64::from(minutes) * 60.0 + secs
        }
        _ => return None,
    };
    (seconds.is_finite() && seconds >= 0.0).then_some(seconds)
}

/// Parse a `Range` header value. Returns `None` for other time formats
/// (`smpte`, `clock`) and malformed values.
pub fn parse_range(value: &str) -> Option<NptRange> {
    let spec = value.split(';').next()?.trim();
    let spec = spec.strip_prefix("npt")?.trim_start().strip_prefix('=')?;
    let (start, end) = spec.split_once('-')?;

    let start = match start.trim() {
        "now" => None,
        "" => Some(0.0),
        s => Some(parse_npt_time(s)?),
    };
    let end = match end.trim() {
        "" => None,
        e => Some(parse_npt_time(e)?),
    };
    if let (Some(s), Some(e)) = (start, end)
        && e < s
    {
        return None;
    }
    Some(NptRange { start, end })
}

/// `npt=<start>-[<end>]` with millisecond precision.
pub fn format_range(start: f64, end: Option<f64>) -> String {
    match end {
        Some(end) => format!("npt={:.3}-{:.3}", start, end),
        None => format!("npt={:.3}-", start),
    }
}

/// Parse a `Scale` header value. Zero is rejected.
pub fn parse_scale(value: &str) -> Option<f32> {
    value
        .trim()
        .parse::<f32>()
        .ok()
        .filter(|s| s.is_finite() && *s != 0.0)
}

/// Format a scale the way clients expect (`1.000000`).
pub fn format_scale(scale: f32) -> String {
    format!("{:.6}", scale)
}
