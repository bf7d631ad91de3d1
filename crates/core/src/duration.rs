//! Duration strings as written in resource specs (`30m`, `1h30m`, `1.5s`, `250ms`).

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

static FULL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([0-9]+(\.[0-9]+)?(ms|s|m|h))+$").expect("static regex"));
static PART: Lazy<Regex> = Lazy::new(|| Regex::new(r"([0-9]+(?:\.[0-9]+)?)(ms|s|m|h)").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration {0:?} (expected e.g. 30s, 5m, 1h30m)")]
pub struct InvalidDuration(pub String);

pub fn parse_duration(s: &str) -> Result<Duration, InvalidDuration> {
    let s = s.trim();
    if !FULL.is_match(s) {
        return Err(InvalidDuration(s.to_string()));
    }
    let mut secs = 0f64;
    for cap in PART.captures_iter(s) {
        let n: f64 = cap[1].parse().map_err(|_| InvalidDuration(s.to_string()))?;
        secs += match &cap[2] {
            "ms" => n / 1000.0,
            "s" => n,
            "m" => n * 60.0,
            "h" => n * 3600.0,
            _ => return Err(InvalidDuration(s.to_string())),
        };
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Parse an optional duration field, falling back to `default` when unset.
/// Set-but-invalid values are an error so callers can surface them.
pub fn parse_or(field: Option<&str>, default: Duration) -> Result<Duration, InvalidDuration> {
    match field.map(str::trim) {
        None | Some("") => Ok(default),
        Some(s) => parse_duration(s),
    }
}
