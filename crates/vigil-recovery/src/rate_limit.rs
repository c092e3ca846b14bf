use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Failure class inferred from an observed error string. The four
/// rate-limit classes drive retry/fallback; `Auth` is passed through to
/// the host and `Other` stands as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Throttling,
    QuotaExceeded,
    TooManyRequests,
    ConcurrencyLimit,
    Auth,
    Other,
}

impl FailureCategory {
    pub fn is_rate_limit(self) -> bool {
        matches!(
            self,
            Self::Throttling | Self::QuotaExceeded | Self::TooManyRequests | Self::ConcurrencyLimit
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Throttling => "throttling",
            Self::QuotaExceeded => "quota_exceeded",
            Self::TooManyRequests => "too_many_requests",
            Self::ConcurrencyLimit => "concurrency_limit",
            Self::Auth => "auth",
            Self::Other => "other",
        }
    }
}

/// Stateless classification of one observed failure string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDetection {
    pub is_rate_limit: bool,
    pub provider: Option<String>,
    pub suggested_wait_ms: Option<u64>,
    pub category: FailureCategory,
}

/// Classifies an error string (structured error payloads and raw log
/// lines alike). Pure and recomputed per observation.
pub fn classify_failure(text: &str) -> RateLimitDetection {
    let lowered = text.to_lowercase();
    let category = detect_category(&lowered);
    RateLimitDetection {
        is_rate_limit: category.is_rate_limit(),
        provider: detect_provider(&lowered),
        suggested_wait_ms: extract_suggested_wait_ms(&lowered),
        category,
    }
}

fn detect_category(lowered: &str) -> FailureCategory {
    let concurrency = ["concurrent request", "concurrency limit", "too many concurrent"];
    if concurrency.iter().any(|needle| lowered.contains(needle)) {
        return FailureCategory::ConcurrencyLimit;
    }

    let quota = [
        "quota",
        "usage limit",
        "credit balance",
        "insufficient_quota",
        "billing",
    ];
    if quota.iter().any(|needle| lowered.contains(needle)) {
        return FailureCategory::QuotaExceeded;
    }

    if lowered.contains("429") || lowered.contains("too many requests") {
        return FailureCategory::TooManyRequests;
    }

    let throttling = [
        "rate limit",
        "rate_limit",
        "rate-limit",
        "throttl",
        "overloaded",
        "529",
        "slow down",
        "server is busy",
    ];
    if throttling.iter().any(|needle| lowered.contains(needle)) {
        return FailureCategory::Throttling;
    }

    let auth = [
        "401",
        "403",
        "unauthorized",
        "authentication",
        "invalid api key",
        "api key expired",
        "credential",
        "permission denied",
        "not logged in",
    ];
    if auth.iter().any(|needle| lowered.contains(needle)) {
        return FailureCategory::Auth;
    }

    FailureCategory::Other
}

fn detect_provider(lowered: &str) -> Option<String> {
    let table: &[(&str, &[&str])] = &[
        ("anthropic", &["anthropic", "claude"]),
        ("openai", &["openai", "gpt-"]),
        ("google", &["google", "gemini", "vertex"]),
        ("bedrock", &["bedrock", "aws"]),
    ];
    for (provider, needles) in table {
        if needles.iter().any(|needle| lowered.contains(needle)) {
            return Some((*provider).to_string());
        }
    }
    None
}

fn suggested_wait_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?:retry[-_\s]?after\s*[:=]?\s*|(?:retry|try again|wait)\s+(?:in\s+|for\s+)?)(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?|m|mins?|minutes?)?",
        )
        .expect("suggested-wait pattern compiles")
    })
}

/// Extracts a provider-suggested wait from "retry-after"-style phrasing.
///
/// Bare numbers are ambiguous on the wire: values under 1000 are read as
/// seconds and normalized to milliseconds, larger ones as milliseconds.
fn extract_suggested_wait_ms(lowered: &str) -> Option<u64> {
    let captures = suggested_wait_regex().captures(lowered)?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let unit = captures.get(2).map(|m| m.as_str()).unwrap_or("");
    let ms = match unit {
        "" => {
            if value < 1_000.0 {
                value * 1_000.0
            } else {
                value
            }
        }
        "ms" | "millisecond" | "milliseconds" => value,
        "m" | "min" | "mins" | "minute" | "minutes" => value * 60_000.0,
        _ => value * 1_000.0,
    };
    Some(ms.min(u64::MAX as f64) as u64)
}
