//! Shared HTTP plumbing for the provider adapters.
//!
//! Status classification follows one table for every back-end:
//!
//! - 401/403 (auth) and 400/404/422 (bad request) → `Permanent`
//! - 408/409/425/429 and 5xx → `Transient`, carrying `Retry-After` when sent
//! - connect, timeout, and body-read failures → `Transient`
//!
//! Error bodies are truncated and have the provider key redacted before
//! they are wrapped.

use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use futures::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use serde_json::Value;

use easy_dataset_core::error::redact;
use easy_dataset_core::{PipelineError, PipelineResult};

use super::RateLimitHint;

/// Longest provider error body kept in an error message.
const MAX_ERROR_BODY: usize = 500;

/// Process-wide connection pool shared by every adapter.
pub fn build_client() -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .user_agent(concat!("easy-dataset/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// Whether an HTTP status is worth retrying.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 425 | 429) || (500..600).contains(&status)
}

/// Turn a non-success response into a classified error.
///
/// Successful responses are returned unchanged together with any
/// rate-limit hints found in their headers.
pub async fn check(
    provider: &str,
    secret: Option<&str>,
    response: reqwest::Response,
) -> PipelineResult<(reqwest::Response, RateLimitHint)> {
    let status = response.status();
    let hint = rate_limit_hint(response.headers());
    if status.is_success() {
        return Ok((response, hint));
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!(
        "HTTP {}: {}",
        status.as_u16(),
        truncate(&redact(&body, secret), MAX_ERROR_BODY)
    );
    if is_transient_status(status.as_u16()) {
        Err(PipelineError::Transient {
            provider: provider.to_string(),
            message,
            retry_after: hint.retry_after,
        })
    } else {
        Err(PipelineError::Permanent {
            provider: provider.to_string(),
            message,
        })
    }
}

/// Classify a transport-level failure.
pub fn transport_error(provider: &str, secret: Option<&str>, e: &reqwest::Error) -> PipelineError {
    let message = redact(&e.to_string(), secret);
    if e.is_builder() {
        PipelineError::Permanent {
            provider: provider.to_string(),
            message,
        }
    } else {
        PipelineError::Transient {
            provider: provider.to_string(),
            message,
            retry_after: None,
        }
    }
}

/// Send a request and classify the outcome.
pub async fn send(
    provider: &str,
    secret: Option<&str>,
    request: reqwest::RequestBuilder,
) -> PipelineResult<(reqwest::Response, RateLimitHint)> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(provider, secret, &e))?;
    check(provider, secret, response).await
}

/// Read a successful response body as JSON.
pub async fn json_body(
    provider: &str,
    secret: Option<&str>,
    response: reqwest::Response,
) -> PipelineResult<Value> {
    let text = response
        .text()
        .await
        .map_err(|e| transport_error(provider, secret, &e))?;
    serde_json::from_str(&text).map_err(|e| PipelineError::Permanent {
        provider: provider.to_string(),
        message: format!(
            "malformed response body ({}): {}",
            e,
            truncate(&text, MAX_ERROR_BODY)
        ),
    })
}

/// Read `Retry-After` and the `x-ratelimit-*-requests` headers.
pub fn rate_limit_hint(headers: &HeaderMap) -> RateLimitHint {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    RateLimitHint {
        retry_after: header("retry-after").and_then(parse_duration),
        remaining_requests: header("x-ratelimit-remaining-requests")
            .and_then(|v| v.trim().parse().ok()),
        reset_requests: header("x-ratelimit-reset-requests").and_then(parse_duration),
    }
}

/// Parse a header duration: bare seconds (`"2"`, `"1.5"`) or a compound
/// form such as `"1m30s"` or `"250ms"`.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<f64>() {
        return (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs));
    }

    let mut total = 0.0f64;
    let mut rest = raw;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let value: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let factor = match &rest[..unit_len] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        total += value * factor;
        rest = &rest[unit_len..];
    }
    Some(Duration::from_secs_f64(total))
}

/// Streaming body framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Server-sent events: `data: {...}` lines, terminated by `data: [DONE]`.
    Sse,
    /// One JSON object per line.
    Ndjson,
}

pub type EventStream = Pin<Box<dyn Stream<Item = PipelineResult<Value>> + Send>>;

struct LineState {
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>,
    buf: Vec<u8>,
    done: bool,
    provider: String,
    framing: Framing,
}

/// Decode a streaming response into JSON events.
pub fn events(provider: &str, response: reqwest::Response, framing: Framing) -> EventStream {
    let body = response.bytes_stream().map(|r| r.map(|b| b.to_vec()));
    event_stream(provider, Box::pin(body), framing)
}

fn event_stream(
    provider: &str,
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>,
    framing: Framing,
) -> EventStream {
    let state = LineState {
        body,
        buf: Vec::new(),
        done: false,
        provider: provider.to_string(),
        framing,
    };
    let stream = futures::stream::unfold(state, |mut st| async move {
        loop {
            let line = if let Some(pos) = st.buf.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = st.buf.drain(..=pos).collect();
                String::from_utf8_lossy(&raw).trim().to_string()
            } else if st.done {
                if st.buf.is_empty() {
                    return None;
                }
                let raw = std::mem::take(&mut st.buf);
                String::from_utf8_lossy(&raw).trim().to_string()
            } else {
                match st.body.next().await {
                    Some(Ok(bytes)) => st.buf.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        st.done = true;
                        st.buf.clear();
                        let err = transport_error(&st.provider, None, &e);
                        return Some((Err(err), st));
                    }
                    None => st.done = true,
                }
                continue;
            };

            match decode_line(&line, st.framing) {
                Line::Skip => continue,
                Line::Done => {
                    st.done = true;
                    st.buf.clear();
                    return None;
                }
                Line::Event(raw) => {
                    let item = serde_json::from_str::<Value>(raw).map_err(|e| {
                        PipelineError::Permanent {
                            provider: st.provider.clone(),
                            message: format!("malformed stream event: {}", e),
                        }
                    });
                    return Some((item, st));
                }
            }
        }
    });
    Box::pin(stream)
}

#[derive(Debug, PartialEq)]
enum Line<'a> {
    Skip,
    Done,
    Event(&'a str),
}

fn decode_line(line: &str, framing: Framing) -> Line<'_> {
    if line.is_empty() {
        return Line::Skip;
    }
    match framing {
        Framing::Ndjson => Line::Event(line),
        Framing::Sse => match line.strip_prefix("data:") {
            Some(data) => {
                let data = data.trim();
                if data == "[DONE]" {
                    Line::Done
                } else if data.is_empty() {
                    Line::Skip
                } else {
                    Line::Event(data)
                }
            }
            // event:, id:, retry:, and `:` comments
            None => Line::Skip,
        },
    }
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// Join a base URL and a path without doubling slashes.
pub fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(parts: &[&str]) -> Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>> {
        let items: Vec<reqwest::Result<Vec<u8>>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        Box::pin(futures::stream::iter(items))
    }

    #[test]
    fn status_classes() {
        for s in [408, 409, 425, 429, 500, 502, 503] {
            assert!(is_transient_status(s), "{}", s);
        }
        for s in [400, 401, 403, 404, 422] {
            assert!(!is_transient_status(s), "{}", s);
        }
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration("1.5"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn headers_to_hint() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "3".parse().unwrap());
        headers.insert("x-ratelimit-remaining-requests", "0".parse().unwrap());
        headers.insert("x-ratelimit-reset-requests", "6s".parse().unwrap());
        let hint = rate_limit_hint(&headers);
        assert_eq!(hint.retry_after, Some(Duration::from_secs(3)));
        assert_eq!(hint.remaining_requests, Some(0));
        assert_eq!(hint.reset_requests, Some(Duration::from_secs(6)));
    }

    #[tokio::test]
    async fn sse_events_split_across_reads() {
        let stream = event_stream(
            "p",
            body(&[
                ": keep-alive\n\ndata: {\"a\"",
                ":1}\n\nevent: x\ndata: {\"a\":2}\n\n",
                "data: [DONE]\n\ndata: {\"a\":3}\n",
            ]),
            Framing::Sse,
        );
        let events: Vec<Value> = stream.map(|e| e.unwrap()).collect().await;
        assert_eq!(events, vec![serde_json::json!({"a":1}), serde_json::json!({"a":2})]);
    }

    #[tokio::test]
    async fn ndjson_keeps_unterminated_tail() {
        let stream = event_stream("p", body(&["{\"n\":1}\n{\"n\"", ":2}"]), Framing::Ndjson);
        let events: Vec<Value> = stream.map(|e| e.unwrap()).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1]["n"], 2);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "ééé";
        assert_eq!(truncate(s, 3), "é…");
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(join("http://h/v1/", "/chat"), "http://h/v1/chat");
    }
}
