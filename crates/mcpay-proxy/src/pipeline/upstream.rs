//! Upstream invocation with bounded retries.

use bytes::Bytes;
use rand::RngExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use std::time::Duration;
use url::Url;

use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::error::ProxyError;
use crate::metrics::UPSTREAM_RETRIES;
use crate::pipeline::context::{HeaderList, ProxyResponse, ResponseSource};

/// Upstream response headers passed back to the client.
/// CORS headers are left to the proxy's own middleware.
const ALLOWED_RESPONSE_HEADERS: &[&str] = &[
    "content-type",
    "content-encoding",
    "cache-control",
    "etag",
    "last-modified",
    "date",
    "vary",
    "x-request-id",
    "retry-after",
    "x-ratelimit-limit",
    "x-ratelimit-remaining",
    "x-ratelimit-reset",
    "mcp-session-id",
    "mcp-protocol-version",
];

/// Maximum upstream response body size (10 MiB).
pub const MAX_RESPONSE_BODY_SIZE: usize = 10 * 1024 * 1024;

/// A fully buffered outbound request. The body is resent on every attempt.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: reqwest::Method,
    pub url: Url,
    pub headers: HeaderList,
    pub body: Bytes,
}

impl OutboundRequest {
    fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => tracing::debug!(header = %name, "dropping unrepresentable header"),
            }
        }
        map
    }

    fn build(&self, http: &reqwest::Client) -> reqwest::RequestBuilder {
        let builder = http
            .request(self.method.clone(), self.url.clone())
            .headers(self.header_map());
        if self.body.is_empty() {
            builder
        } else {
            builder.body(self.body.clone())
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// `Retry-After` as delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: chrono::DateTime<chrono::Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// `base * 2^attempt` plus up to `max_jitter` of random jitter.
pub fn backoff_delay(attempt: u32, retry: &RetryConfig) -> Duration {
    let exp = retry.base_delay.saturating_mul(1u32 << attempt.min(16));
    let max_jitter_ms = retry.max_jitter.as_millis() as u64;
    let jitter_ms = if max_jitter_ms == 0 {
        0
    } else {
        rand::rng().random_range(0..=max_jitter_ms)
    };
    exp + Duration::from_millis(jitter_ms)
}

fn retry_delay(headers: &HeaderMap, attempt: u32, retry: &RetryConfig) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, chrono::Utc::now()))
        .map(|d| d.min(retry.retry_after_cap))
        .unwrap_or_else(|| backoff_delay(attempt, retry))
}

/// Send `request`, retrying 429/5xx responses and transport errors up to
/// `retry.max_retries` times. After exhaustion the last response or error is
/// returned as-is.
pub async fn fetch_with_retry(
    http: &reqwest::Client,
    request: &OutboundRequest,
    retry: &RetryConfig,
    clock: &dyn Clock,
) -> Result<reqwest::Response, reqwest::Error> {
    let mut attempt: u32 = 0;
    loop {
        let result = request.build(http).send().await;

        let delay = match &result {
            Ok(resp) if is_retryable_status(resp.status().as_u16()) => {
                Some(retry_delay(resp.headers(), attempt, retry))
            }
            Err(e) if is_retryable_error(e) => Some(backoff_delay(attempt, retry)),
            _ => None,
        };

        match delay {
            Some(delay) if attempt < retry.max_retries => {
                match &result {
                    Ok(resp) => tracing::warn!(
                        url = %request.url,
                        status = resp.status().as_u16(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "retrying upstream"
                    ),
                    Err(e) => tracing::warn!(
                        url = %request.url,
                        error = %e,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "retrying upstream"
                    ),
                }
                UPSTREAM_RETRIES.inc();
                clock.sleep(delay).await;
                attempt += 1;
            }
            _ => return result,
        }
    }
}

/// Buffer the upstream response into a [`ProxyResponse`], keeping only
/// allow-listed headers and enforcing the body size cap.
pub async fn buffer_response(mut response: reqwest::Response) -> Result<ProxyResponse, ProxyError> {
    let status = response.status().as_u16();

    if let Some(cl) = response.content_length() {
        if cl > MAX_RESPONSE_BODY_SIZE as u64 {
            return Err(ProxyError::Upstream(format!(
                "upstream response too large: {} bytes (max {})",
                cl, MAX_RESPONSE_BODY_SIZE
            )));
        }
    }

    let headers: HeaderList = response
        .headers()
        .iter()
        .filter(|(name, _)| ALLOWED_RESPONSE_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let mut body_buf = Vec::with_capacity(
        response
            .content_length()
            .map(|cl| cl as usize)
            .unwrap_or(8192)
            .min(MAX_RESPONSE_BODY_SIZE),
    );
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ProxyError::Upstream(format!("failed to read upstream response: {e}")))?
    {
        if body_buf.len() + chunk.len() > MAX_RESPONSE_BODY_SIZE {
            return Err(ProxyError::Upstream(format!(
                "upstream response too large (max {} bytes)",
                MAX_RESPONSE_BODY_SIZE
            )));
        }
        body_buf.extend_from_slice(&chunk);
    }

    Ok(ProxyResponse {
        status,
        headers,
        body: Bytes::from(body_buf),
        source: ResponseSource::Upstream,
    })
}

/// Fetch with retries and mirror the final upstream response.
pub async fn invoke(
    http: &reqwest::Client,
    request: &OutboundRequest,
    retry: &RetryConfig,
    clock: &dyn Clock,
) -> Result<ProxyResponse, ProxyError> {
    let response = fetch_with_retry(http, request, retry, clock)
        .await
        .map_err(|e| ProxyError::Upstream(format!("upstream request failed: {e}")))?;
    buffer_response(response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            max_jitter: Duration::ZERO,
            ..RetryConfig::default()
        }
    }

    fn post(server: &MockServer, body: &'static str) -> OutboundRequest {
        OutboundRequest {
            method: reqwest::Method::POST,
            url: Url::parse(&format!("{}/mcp", server.uri())).unwrap(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    #[test]
    fn test_parse_retry_after() {
        let now = chrono::DateTime::parse_from_rfc2822("Wed, 21 Oct 2026 07:28:00 GMT")
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(parse_retry_after("2", now), Some(Duration::from_secs(2)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2026 07:28:05 GMT", now),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2026 07:27:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn test_backoff_doubles_and_jitter_is_bounded() {
        let retry = no_jitter();
        assert_eq!(backoff_delay(0, &retry), Duration::from_millis(300));
        assert_eq!(backoff_delay(2, &retry), Duration::from_millis(1200));

        let jittered = RetryConfig::default();
        for _ in 0..50 {
            let d = backoff_delay(1, &jittered);
            assert!(d >= Duration::from_millis(600));
            assert!(d <= Duration::from_millis(1600));
        }
    }

    #[tokio::test]
    async fn test_retry_after_is_honored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let clock = ManualClock::new();
        let resp = invoke(&reqwest::Client::new(), &post(&server, "{}"), &no_jitter(), &clock)
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2)]);
    }

    #[tokio::test]
    async fn test_retry_after_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).insert_header("retry-after", "3600"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let clock = ManualClock::new();
        invoke(&reqwest::Client::new(), &post(&server, "{}"), &no_jitter(), &clock)
            .await
            .unwrap();
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(10)]);
    }

    #[tokio::test]
    async fn test_persistent_500_stops_after_four_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_string("{\"id\":1}"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(4)
            .mount(&server)
            .await;

        let clock = ManualClock::new();
        let resp = invoke(
            &reqwest::Client::new(),
            &post(&server, "{\"id\":1}"),
            &no_jitter(),
            &clock,
        )
        .await
        .unwrap();
        assert_eq!(resp.status, 500);
        assert_eq!(resp.body, Bytes::from_static(b"boom"));
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_millis(300),
                Duration::from_millis(600),
                Duration::from_millis(1200)
            ]
        );
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let clock = ManualClock::new();
        let resp = invoke(&reqwest::Client::new(), &post(&server, "{}"), &no_jitter(), &clock)
            .await
            .unwrap();
        assert_eq!(resp.status, 404);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_response_headers_are_filtered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("server", "nginx")
                    .insert_header("x-powered-by", "php")
                    .insert_header("mcp-session-id", "abc")
                    .set_body_string("{}"),
            )
            .mount(&server)
            .await;

        let resp = invoke(
            &reqwest::Client::new(),
            &post(&server, "{}"),
            &no_jitter(),
            &ManualClock::new(),
        )
        .await
        .unwrap();
        assert_eq!(resp.header("mcp-session-id"), Some("abc"));
        assert!(resp.header("server").is_none());
        assert!(resp.header("x-powered-by").is_none());
    }

    #[tokio::test]
    async fn test_connection_refused_is_an_upstream_error() {
        let clock = ManualClock::new();
        let request = OutboundRequest {
            method: reqwest::Method::GET,
            url: Url::parse("http://127.0.0.1:9/unreachable").unwrap(),
            headers: Vec::new(),
            body: Bytes::new(),
        };
        let err = invoke(&reqwest::Client::new(), &request, &no_jitter(), &clock)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Upstream(_)));
        assert_eq!(clock.sleeps().len(), 3);
    }
}
