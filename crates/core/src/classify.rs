//! Error classification and per-category retry backoff.
//!
//! Classification order is fixed: network, auth, not-found, validation, timeout,
//! then unknown. The keyword tables below are matched case-insensitively against
//! the whole error chain.

use std::fmt;
use std::time::Duration;

use rand::Rng;

use crate::error::EngineError;

const NETWORK_KEYWORDS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timeout",
    "no route to host",
    "network unreachable",
    "dial tcp",
    "i/o timeout",
    "broken pipe",
];

const AUTH_KEYWORDS: &[&str] =
    &["unauthorized", "authentication failed", "invalid credentials", "access denied", "forbidden", "401", "403"];

const NOT_FOUND_KEYWORDS: &[&str] = &["not found", "does not exist", "404", "no such"];

const VALIDATION_KEYWORDS: &[&str] =
    &["invalid", "validation failed", "bad request", "400", "malformed", "parse error"];

const TIMEOUT_KEYWORDS: &[&str] = &["timeout", "deadline exceeded", "timed out"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    Auth,
    NotFound,
    Validation,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "Network",
            ErrorCategory::Auth => "Auth",
            ErrorCategory::NotFound => "NotFound",
            ErrorCategory::Validation => "Validation",
            ErrorCategory::Timeout => "Timeout",
            ErrorCategory::Unknown => "Unknown",
        }
    }

    /// Auth is retried because referenced credentials may be fixed out of band.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::NotFound | ErrorCategory::Validation)
    }

    pub fn profile(&self) -> BackoffProfile {
        match self {
            ErrorCategory::Network | ErrorCategory::Timeout => BackoffProfile::NETWORK,
            ErrorCategory::Auth => BackoffProfile::AUTH,
            ErrorCategory::Validation => BackoffProfile::VALIDATION,
            ErrorCategory::NotFound | ErrorCategory::Unknown => BackoffProfile::DEFAULT,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Exponential backoff parameters for one error category.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffProfile {
    pub base: Duration,
    pub factor: f64,
    /// Fraction of the computed delay added or subtracted at random.
    pub jitter: f64,
    /// Attempts after which the delay stops growing.
    pub steps: u32,
    pub cap: Duration,
}

impl BackoffProfile {
    pub const NETWORK: Self =
        Self { base: Duration::from_secs(5), factor: 2.0, jitter: 0.1, steps: 5, cap: Duration::from_secs(300) };
    pub const AUTH: Self =
        Self { base: Duration::from_secs(60), factor: 2.0, jitter: 0.1, steps: 3, cap: Duration::from_secs(900) };
    pub const VALIDATION: Self =
        Self { base: Duration::from_secs(300), factor: 1.5, jitter: 0.0, steps: 2, cap: Duration::from_secs(600) };
    pub const DEFAULT: Self =
        Self { base: Duration::from_secs(30), factor: 2.0, jitter: 0.1, steps: 5, cap: Duration::from_secs(600) };

    /// Delay for 1-based `attempt` before jitter: base × factor^(attempt−1), the
    /// exponent bounded by `steps − 1`, clamped to `cap`.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let cap = self.cap.as_secs_f64();
        let mut d = self.base.as_secs_f64().min(cap);
        let mut i = 1;
        while i < attempt && i < self.steps {
            d *= self.factor;
            if d >= cap { d = cap; break; }
            i += 1;
        }
        Duration::from_secs_f64(d)
    }

    /// Nominal delay with ±jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let d = self.nominal(attempt).as_secs_f64();
        if self.jitter <= 0.0 || d <= 0.0 {
            return Duration::from_secs_f64(d);
        }
        let spread = d * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((d + offset).max(0.0))
    }
}

/// An error annotated with its category and retry policy.
#[derive(Debug)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    /// First-attempt delay for the category.
    pub retry_after: Duration,
    pub retryable: bool,
    pub source: anyhow::Error,
}

impl ClassifiedError {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration { self.category.profile().delay_for_attempt(attempt) }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:#}", self.source) }
}

pub fn classify(err: anyhow::Error) -> ClassifiedError {
    let category = categorize(&err);
    ClassifiedError { category, retry_after: category.profile().base, retryable: category.is_retryable(), source: err }
}

pub fn categorize(err: &anyhow::Error) -> ErrorCategory {
    let text = format!("{:#}", err).to_lowercase();
    let has = |table: &[&str]| table.iter().any(|k| text.contains(k));

    if is_typed_network(err) || has(NETWORK_KEYWORDS) {
        return ErrorCategory::Network;
    }
    if has(AUTH_KEYWORDS) {
        return ErrorCategory::Auth;
    }
    if has(NOT_FOUND_KEYWORDS) || is_typed_not_found(err) {
        return ErrorCategory::NotFound;
    }
    if has(VALIDATION_KEYWORDS) {
        return ErrorCategory::Validation;
    }
    if is_typed_timeout(err) || has(TIMEOUT_KEYWORDS) {
        return ErrorCategory::Timeout;
    }
    ErrorCategory::Unknown
}

fn is_typed_network(err: &anyhow::Error) -> bool {
    use std::io::ErrorKind::*;
    err.chain().any(|e| {
        e.downcast_ref::<std::io::Error>()
            .map(|io| {
                matches!(
                    io.kind(),
                    ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | AddrNotAvailable | BrokenPipe | TimedOut
                )
            })
            .unwrap_or(false)
    })
}

fn is_typed_not_found(err: &anyhow::Error) -> bool { crate::error::is_engine_not_found(err) }

fn is_typed_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|e| matches!(e.downcast_ref::<EngineError>(), Some(EngineError::Timeout(_)) | Some(EngineError::Cancelled)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn cat(msg: &str) -> ErrorCategory { categorize(&anyhow!(msg.to_string())) }

    #[test]
    fn keyword_tables_in_priority_order() {
        assert_eq!(cat("dial tcp 10.0.0.1:443: connect: connection refused"), ErrorCategory::Network);
        assert_eq!(cat("read tcp: i/o timeout"), ErrorCategory::Network);
        assert_eq!(cat("failed to fetch index: 401 Unauthorized"), ErrorCategory::Auth);
        assert_eq!(cat("403 Forbidden: not found in realm"), ErrorCategory::Auth);
        assert_eq!(cat("chart \"nginx\" not found in repo"), ErrorCategory::NotFound);
        assert_eq!(cat("YAML parse error on line 3"), ErrorCategory::Validation);
        assert_eq!(cat("context deadline exceeded"), ErrorCategory::Timeout);
        assert_eq!(cat("something odd happened"), ErrorCategory::Unknown);
    }

    #[test]
    fn typed_errors_are_recognised_through_context() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer went away");
        let err = anyhow::Error::new(EngineError::Io(io)).context("helm repo update");
        assert_eq!(categorize(&err), ErrorCategory::Network);

        let err = anyhow::Error::new(EngineError::Timeout(Duration::from_secs(5))).context("helm install");
        assert_eq!(categorize(&err), ErrorCategory::Timeout);

        let err = anyhow::Error::new(EngineError::NotFound("release web".into()));
        assert_eq!(categorize(&err), ErrorCategory::NotFound);
    }

    #[test]
    fn retryability_per_category() {
        for (c, r) in [
            (ErrorCategory::Network, true),
            (ErrorCategory::Timeout, true),
            (ErrorCategory::Auth, true),
            (ErrorCategory::Unknown, true),
            (ErrorCategory::NotFound, false),
            (ErrorCategory::Validation, false),
        ] {
            assert_eq!(c.is_retryable(), r, "{c}");
        }
        let ce = classify(anyhow!("invalid chart version"));
        assert!(!ce.retryable);
        assert_eq!(ce.retry_after, Duration::from_secs(300));
    }

    #[test]
    fn network_backoff_bounds() {
        let p = BackoffProfile::NETWORK;
        for _ in 0..200 {
            let d1 = p.delay_for_attempt(1);
            assert!(d1 >= Duration::from_secs(4) && d1 <= Duration::from_secs(6), "{d1:?}");
            let d3 = p.delay_for_attempt(3);
            assert!(d3 >= Duration::from_secs(18) && d3 <= Duration::from_secs(22), "{d3:?}");
        }
    }

    #[test]
    fn growth_stops_at_steps_and_cap() {
        let p = BackoffProfile::NETWORK;
        assert_eq!(p.nominal(5), Duration::from_secs(80));
        assert_eq!(p.nominal(6), Duration::from_secs(80));
        assert_eq!(p.nominal(50), Duration::from_secs(80));
        let a = BackoffProfile::AUTH;
        assert_eq!(a.nominal(3), Duration::from_secs(240));
        assert_eq!(a.nominal(9), Duration::from_secs(240));
        let tight = BackoffProfile { cap: Duration::from_secs(12), ..BackoffProfile::NETWORK };
        assert_eq!(tight.nominal(4), Duration::from_secs(12));
        // no jitter on validation
        assert_eq!(BackoffProfile::VALIDATION.delay_for_attempt(2), Duration::from_secs(450));
    }
}
