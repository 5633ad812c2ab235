//! Response metadata: rate-limit headers, pagination links, and status mapping.
//!
//! GitHub reports quota in `x-ratelimit-*` headers on every response and
//! pagination in an RFC 8288 `Link` header. Secondary rate limits arrive as a
//! 403 or 429 with `Retry-After` instead.

use std::time::Duration;

use indexer::{FetchError, PageCursor, RateLimitSnapshot, Timestamp};
use reqwest::header::{HeaderMap, LINK, RETRY_AFTER};
use reqwest::{StatusCode, Url};

const RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
const RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
const RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Longest error body kept in a [`FetchError`] message.
const MAX_MESSAGE_LEN: usize = 200;

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Reads the quota headers. `None` unless `x-ratelimit-remaining` is present.
pub fn parse_rate_limit(headers: &HeaderMap) -> Option<RateLimitSnapshot> {
    let remaining = header_str(headers, RATELIMIT_REMAINING)?.parse().ok()?;
    let limit = header_str(headers, RATELIMIT_LIMIT).and_then(|v| v.parse().ok());
    let reset_at = header_str(headers, RATELIMIT_RESET)
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(Timestamp::from_unix_seconds);

    Some(RateLimitSnapshot {
        limit,
        remaining,
        reset_at,
    })
}

/// Reads `Retry-After` in its delay-seconds form.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_str(headers, RETRY_AFTER.as_str())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Finds the `rel="next"` link and returns its `page` query parameter.
pub fn parse_next_page(headers: &HeaderMap) -> Option<PageCursor> {
    let link = header_str(headers, LINK.as_str())?;

    link.split(',').find_map(|entry| {
        let mut parts = entry.split(';').map(str::trim);
        let target = parts.next()?.strip_prefix('<')?.strip_suffix('>')?;
        let is_next = parts.any(|param| {
            param
                .strip_prefix("rel=")
                .map(|rel| rel.trim_matches('"').split_whitespace().any(|r| r == "next"))
                .unwrap_or(false)
        });
        if !is_next {
            return None;
        }

        let url = Url::parse(target).ok()?;
        let page = url
            .query_pairs()
            .find(|(key, _)| key == "page")
            .and_then(|(_, value)| value.parse().ok())?;
        PageCursor::new(page)
    })
}

/// Pulls GitHub's `message` field out of an error body, falling back to the
/// raw text.
pub fn error_message(status: StatusCode, body: &str) -> String {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| body.trim().to_string());

    let message: String = message.chars().take(MAX_MESSAGE_LEN).collect();
    if message.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {message}", status.as_u16())
    }
}

/// Maps a non-success response to the domain's failure kinds.
pub fn classify_failure(
    status: StatusCode,
    rate_limit: Option<&RateLimitSnapshot>,
    retry_after: Option<Duration>,
    message: String,
    now: Timestamp,
) -> FetchError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => FetchError::NotFound,
        StatusCode::UNAUTHORIZED => FetchError::Unauthorized { message },
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            let quota_spent = rate_limit.is_some_and(|rl| rl.remaining == 0);
            let retry_at = retry_after.map(|delay| now.after(delay));

            if quota_spent {
                FetchError::RateLimited {
                    reset_at: rate_limit.and_then(|rl| rl.reset_at).or(retry_at),
                }
            } else if retry_at.is_some() || status == StatusCode::TOO_MANY_REQUESTS {
                FetchError::RateLimited { reset_at: retry_at }
            } else {
                FetchError::Transient {
                    message,
                    retry_after: None,
                }
            }
        }
        _ => FetchError::Transient {
            message,
            retry_after,
        },
    }
}
