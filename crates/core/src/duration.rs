use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Ceiling applied to negative ("wait forever") timeouts so polling always ends.
pub const UNBOUNDED_WAIT_CEILING: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DurationError {
    #[error("duration cannot be empty")]
    Empty,
    #[error("invalid duration {0:?}: expected <number><unit>[...] with unit ns, us, ms, s, m, h or d (e.g. \"30s\", \"1m30s\")")]
    Invalid(String),
}

/// Parse a human duration such as `30s`, `1m30s`, `500ms`, `-1s` or `0`.
///
/// Returns `(negative, magnitude)`.
pub fn parse_signed_duration(input: &str) -> Result<(bool, Duration), DurationError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }
    let invalid = || DurationError::Invalid(input.to_string());
    let (negative, body) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    if body == "0" {
        return Ok((negative, Duration::ZERO));
    }

    let whole = Regex::new(r"^(?:\d+(?:\.\d+)?(?:ns|us|µs|ms|s|m|h|d))+$").map_err(|_| invalid())?;
    if !whole.is_match(body) {
        return Err(invalid());
    }
    let token = Regex::new(r"(?P<number>\d+(?:\.\d+)?)(?P<unit>ns|us|µs|ms|s|m|h|d)").map_err(|_| invalid())?;
    let mut total = 0f64;
    for caps in token.captures_iter(body) {
        let number: f64 = caps.name("number").ok_or_else(invalid)?.as_str().parse().map_err(|_| invalid())?;
        let secs_per_unit = match caps.name("unit").ok_or_else(invalid)?.as_str() {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "d" => 86_400.0,
            _ => return Err(invalid()),
        };
        total += number * secs_per_unit;
    }
    let magnitude = Duration::try_from_secs_f64(total).map_err(|_| invalid())?;
    Ok((negative, magnitude))
}

/// Wait timeout.
///
/// `0` checks once, a negative value waits up to [`UNBOUNDED_WAIT_CEILING`],
/// anything else bounds the total polling time. Bounded budgets never exceed
/// the same ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeout {
    Immediate,
    Bounded(Duration),
    Unbounded,
}

impl Default for Timeout {
    fn default() -> Self { Timeout::Bounded(Duration::from_secs(30)) }
}

impl Timeout {
    pub fn parse(input: &str) -> Result<Self, DurationError> {
        let (negative, d) = parse_signed_duration(input)?;
        Ok(if negative && !d.is_zero() {
            Timeout::Unbounded
        } else if d.is_zero() {
            Timeout::Immediate
        } else {
            Timeout::Bounded(d.min(UNBOUNDED_WAIT_CEILING))
        })
    }

    /// Total polling budget.
    pub fn budget(&self) -> Duration {
        match self {
            Timeout::Immediate => Duration::ZERO,
            Timeout::Bounded(d) => (*d).min(UNBOUNDED_WAIT_CEILING),
            Timeout::Unbounded => UNBOUNDED_WAIT_CEILING,
        }
    }
}

impl TryFrom<String> for Timeout {
    type Error = DurationError;
    fn try_from(s: String) -> Result<Self, Self::Error> { Timeout::parse(&s) }
}

impl From<Timeout> for String {
    fn from(t: Timeout) -> Self { t.to_string() }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeout::Immediate => f.write_str("0s"),
            Timeout::Unbounded => f.write_str("-1s"),
            Timeout::Bounded(d) => write_duration(f, *d),
        }
    }
}

fn write_duration(f: &mut fmt::Formatter<'_>, d: Duration) -> fmt::Result {
    let total_ms = d.as_millis();
    if total_ms < 1000 {
        return write!(f, "{}ms", total_ms);
    }
    let mut secs = d.as_secs();
    let ms = d.subsec_millis();
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if hours > 0 { write!(f, "{}h", hours)?; }
    if mins > 0 { write!(f, "{}m", mins)?; }
    if secs > 0 || ms > 0 {
        if ms > 0 { write!(f, "{}.{:03}s", secs, ms)?; } else { write!(f, "{}s", secs)?; }
    }
    Ok(())
}
