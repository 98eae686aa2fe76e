//! Quota signals carried on HTTP responses

use chrono::{DateTime, TimeZone, Utc};
use ponos_core::PonosError;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tracing::warn;

pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Quota headers of one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSignal {
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitSignal {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        Self {
            remaining: header(RATE_LIMIT_REMAINING).and_then(|v| v.parse().ok()),
            reset_at: header(RATE_LIMIT_RESET).and_then(parse_reset),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}

/// Typed quota error for a failed response, if the failure is quota related.
pub fn check_response(status: StatusCode, headers: &HeaderMap) -> Option<PonosError> {
    let signal = RateLimitSignal::from_headers(headers);

    if status.is_success() {
        if signal.is_exhausted() {
            warn!(
                "Rate limit quota exhausted; resets at {}",
                describe_reset(signal.reset_at)
            );
        }
        return None;
    }

    if signal.is_exhausted() || status == StatusCode::TOO_MANY_REQUESTS {
        warn!(
            "Rate limit exceeded (HTTP {}); resets at {}",
            status.as_u16(),
            describe_reset(signal.reset_at)
        );
        return Some(PonosError::RateLimited {
            reset_at: signal.reset_at,
        });
    }
    None
}

/// Epoch seconds or RFC 3339.
pub fn parse_reset(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(epoch) = value.parse::<i64>() {
        if epoch <= 0 {
            return None;
        }
        return Utc.timestamp_opt(epoch, 0).single();
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn describe_reset(reset_at: Option<DateTime<Utc>>) -> String {
    reset_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string())
}
