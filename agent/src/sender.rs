//! HTTP delivery engine for SitePulse Agent.
//!
//! This module sends events to the ingestion endpoint with:
//!
//! - Connection pooling via reqwest
//! - Batch delivery (`{"events": [...]}`) with automatic, permanent downgrade
//!   to per-event delivery when the endpoint rejects the batch format
//! - Optional gzip bodies above a size threshold, falling back to plain JSON
//!   if compression fails
//! - Status classification that drives retry decisions upstream
//!
//! The sender does not touch the queue or the retry ledger. [`Sender::deliver`]
//! returns a [`DeliveryReport`] saying which events were delivered, which are
//! eligible for retry, and which were dropped; the agent applies it.
//!
//! # Status handling
//!
//! | Status | Meaning |
//! |--------|---------|
//! | 2xx | accepted |
//! | 400, 404, 415, 422 | batch format unsupported (per-event: rejected) |
//! | 401, 403 | unauthorized, never retried |
//! | 408, 429, 5xx, network error | transient, retry eligible |
//! | anything else | rejected |

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::identity::Credentials;
use crate::types::{DropReason, Event};

/// HTTP request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Per-request timeout for keepalive deliveries during page teardown.
const KEEPALIVE_TIMEOUT_SECS: u64 = 10;

/// Header carrying the API key.
const API_KEY_HEADER: &str = "x-api-key";

/// Errors that can occur while sending a request.
#[derive(Error, Debug)]
pub enum SenderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The API key contains characters not allowed in a header.
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

/// How a delivery should behave with respect to page teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Regular delivery from timers and size triggers.
    Normal,
    /// Delivery started on page hide; it must outlive the page.
    Keepalive,
}

/// Classification of one request's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    /// The endpoint does not understand this payload shape.
    Unsupported(StatusCode),
    Unauthorized(StatusCode),
    /// Worth retrying; `None` for network failures.
    Transient(Option<StatusCode>),
    /// Refused for good; `None` when the body could not be serialized.
    Rejected(Option<StatusCode>),
}

/// Maps an HTTP status to an [`Outcome`].
#[must_use]
pub fn classify(status: StatusCode) -> Outcome {
    match status.as_u16() {
        200..=299 => Outcome::Accepted,
        400 | 404 | 415 | 422 => Outcome::Unsupported(status),
        401 | 403 => Outcome::Unauthorized(status),
        408 | 429 | 500..=599 => Outcome::Transient(Some(status)),
        _ => Outcome::Rejected(Some(status)),
    }
}

/// A request body, possibly compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Json(String),
    Gzip(Vec<u8>),
}

impl Payload {
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Gzip(_))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Json(body) => body.len(),
            Self::Gzip(body) => body.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compression policy for request bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPolicy {
    pub enabled: bool,
    pub threshold_bytes: usize,
}

impl CompressionPolicy {
    /// Encodes a serialized body, compressing it when the policy applies.
    ///
    /// Any compression failure yields the uncompressed JSON unchanged.
    #[must_use]
    pub fn encode(&self, json: String) -> Payload {
        if !self.enabled || !compression_supported() || json.len() < self.threshold_bytes {
            return Payload::Json(json);
        }

        match gzip(json.as_bytes()) {
            Ok(compressed) => {
                debug!(
                    original = json.len(),
                    compressed = compressed.len(),
                    "Compressed payload"
                );
                Payload::Gzip(compressed)
            }
            Err(e) => {
                debug!(error = %e, "Compression failed, sending uncompressed");
                Payload::Json(json)
            }
        }
    }
}

/// Whether this build can gzip request bodies.
#[must_use]
pub fn compression_supported() -> bool {
    cfg!(feature = "gzip")
}

#[cfg(feature = "gzip")]
fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

#[cfg(not(feature = "gzip"))]
fn gzip(_bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "built without gzip support",
    ))
}

/// Result of delivering a set of events.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Events the endpoint accepted.
    pub delivered: Vec<Event>,
    /// Events that failed transiently, in their original order.
    pub retry: Vec<Event>,
    /// Events discarded for good.
    pub dropped: Vec<(Event, DropReason)>,
    /// The batch format was rejected during this delivery.
    pub batch_downgraded: bool,
}

impl DeliveryReport {
    /// True when every event was accepted.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.retry.is_empty() && self.dropped.is_empty()
    }
}

#[derive(Serialize)]
struct BatchBody<'a> {
    events: &'a [Event],
}

/// HTTP event sender with batch downgrade and compression.
#[derive(Debug)]
pub struct Sender {
    client: Client,
    ingest_url: String,
    api_key: HeaderValue,
    compression: CompressionPolicy,
    allow_batch: bool,
    batch_supported: AtomicBool,
}

impl Sender {
    /// Creates a sender for the resolved credentials.
    ///
    /// # Errors
    ///
    /// Returns `SenderError::InvalidHeader` if the API key cannot be sent as
    /// a header, or `SenderError::Http` if the HTTP client cannot be built.
    pub fn new(credentials: &Credentials, config: &AgentConfig) -> Result<Self, SenderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(10)
            .build()?;

        let mut api_key = HeaderValue::from_str(&credentials.api_key)?;
        api_key.set_sensitive(true);

        Ok(Self {
            client,
            ingest_url: credentials.ingest_url.clone(),
            api_key,
            compression: CompressionPolicy {
                enabled: config.compress_payload,
                threshold_bytes: config.compress_threshold_bytes,
            },
            allow_batch: config.allow_batch,
            batch_supported: AtomicBool::new(true),
        })
    }

    /// Whether batch delivery is still believed to work for this endpoint.
    #[must_use]
    pub fn batch_supported(&self) -> bool {
        self.batch_supported.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn ingest_url(&self) -> &str {
        &self.ingest_url
    }

    /// Delivers events, batching when possible.
    ///
    /// A batch is attempted when batching is allowed, still supported, and
    /// more than one event is pending. If the endpoint rejects the batch
    /// format, batching is disabled for the lifetime of this sender and the
    /// same events are sent one by one.
    pub async fn deliver(&self, events: Vec<Event>, mode: DeliveryMode) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        if events.is_empty() {
            return report;
        }

        if self.allow_batch && events.len() > 1 && self.batch_supported() {
            let outcome = self.post(&BatchBody { events: &events }, mode).await;
            match outcome {
                Outcome::Accepted => {
                    info!(events = events.len(), "Event batch delivered");
                    report.delivered = events;
                    return report;
                }
                Outcome::Unauthorized(status) => {
                    warn!(status = status.as_u16(), "API key rejected, dropping batch");
                    report.dropped = events
                        .into_iter()
                        .map(|event| (event, DropReason::Unauthorized))
                        .collect();
                    return report;
                }
                Outcome::Transient(status) => {
                    debug!(
                        status = status.map(|s| s.as_u16()),
                        events = events.len(),
                        "Batch failed transiently"
                    );
                    report.retry = events;
                    return report;
                }
                Outcome::Unsupported(status) => {
                    warn!(
                        status = status.as_u16(),
                        "Batch format unsupported, switching to per-event delivery"
                    );
                    self.batch_supported.store(false, Ordering::Release);
                    report.batch_downgraded = true;
                }
                Outcome::Rejected(status) => {
                    debug!(
                        status = status.map(|s| s.as_u16()),
                        "Batch refused, retrying events individually"
                    );
                }
            }
        }

        for event in events {
            match self.post(&event, mode).await {
                Outcome::Accepted => report.delivered.push(event),
                Outcome::Transient(_) => report.retry.push(event),
                Outcome::Unauthorized(_) => report.dropped.push((event, DropReason::Unauthorized)),
                Outcome::Unsupported(status) => report.dropped.push((
                    event,
                    DropReason::Rejected {
                        status: Some(status.as_u16()),
                    },
                )),
                Outcome::Rejected(status) => report.dropped.push((
                    event,
                    DropReason::Rejected {
                        status: status.map(|s| s.as_u16()),
                    },
                )),
            }
        }

        debug!(
            delivered = report.delivered.len(),
            retry = report.retry.len(),
            dropped = report.dropped.len(),
            "Per-event delivery finished"
        );

        report
    }

    /// Sends one request and classifies the response.
    async fn post<T: Serialize + ?Sized>(&self, body: &T, mode: DeliveryMode) -> Outcome {
        let payload = match serde_json::to_string(body) {
            Ok(json) => self.compression.encode(json),
            Err(e) => {
                warn!(error = %e, "Failed to serialize payload");
                return Outcome::Rejected(None);
            }
        };

        match self.send_payload(payload, mode).await {
            Ok(status) => classify(status),
            Err(e) => {
                debug!(error = %e, "Request failed");
                Outcome::Transient(None)
            }
        }
    }

    async fn send_payload(
        &self,
        payload: Payload,
        mode: DeliveryMode,
    ) -> Result<StatusCode, SenderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(API_KEY_HEADER, self.api_key.clone());
        if payload.is_compressed() {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }

        debug!(
            url = %self.ingest_url,
            bytes = payload.len(),
            compressed = payload.is_compressed(),
            keepalive = mode == DeliveryMode::Keepalive,
            "Sending payload"
        );

        let mut request = self.client.post(&self.ingest_url).headers(headers);
        request = match payload {
            Payload::Json(body) => request.body(body),
            Payload::Gzip(body) => request.body(body),
        };
        if mode == DeliveryMode::Keepalive {
            request = request.timeout(Duration::from_secs(KEEPALIVE_TIMEOUT_SECS));
        }

        let response = request.send().await?;
        Ok(response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CredentialSource;

    fn credentials(url: &str) -> Credentials {
        Credentials {
            api_key: "pk_test".to_string(),
            api_key_source: CredentialSource::Explicit,
            ingest_url: url.to_string(),
            ingest_url_source: CredentialSource::Explicit,
        }
    }

    #[test]
    fn test_classify_statuses() {
        let cases = [
            (200, Outcome::Accepted),
            (202, Outcome::Accepted),
            (204, Outcome::Accepted),
            (400, Outcome::Unsupported(StatusCode::BAD_REQUEST)),
            (404, Outcome::Unsupported(StatusCode::NOT_FOUND)),
            (415, Outcome::Unsupported(StatusCode::UNSUPPORTED_MEDIA_TYPE)),
            (422, Outcome::Unsupported(StatusCode::UNPROCESSABLE_ENTITY)),
            (401, Outcome::Unauthorized(StatusCode::UNAUTHORIZED)),
            (403, Outcome::Unauthorized(StatusCode::FORBIDDEN)),
            (408, Outcome::Transient(Some(StatusCode::REQUEST_TIMEOUT))),
            (429, Outcome::Transient(Some(StatusCode::TOO_MANY_REQUESTS))),
            (500, Outcome::Transient(Some(StatusCode::INTERNAL_SERVER_ERROR))),
            (503, Outcome::Transient(Some(StatusCode::SERVICE_UNAVAILABLE))),
            (409, Outcome::Rejected(Some(StatusCode::CONFLICT))),
            (413, Outcome::Rejected(Some(StatusCode::PAYLOAD_TOO_LARGE))),
        ];

        for (code, expected) in cases {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify(status), expected, "status {code}");
        }
    }

    #[test]
    fn test_small_payload_not_compressed() {
        let policy = CompressionPolicy {
            enabled: true,
            threshold_bytes: 1024,
        };
        let payload = policy.encode("{\"a\":1}".to_string());
        assert_eq!(payload, Payload::Json("{\"a\":1}".to_string()));
    }

    #[test]
    fn test_disabled_compression_keeps_json() {
        let policy = CompressionPolicy {
            enabled: false,
            threshold_bytes: 0,
        };
        let body = "x".repeat(4096);
        assert!(!policy.encode(body).is_compressed());
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn test_large_payload_is_gzipped() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let policy = CompressionPolicy {
            enabled: true,
            threshold_bytes: 1024,
        };
        let body = format!("{{\"events\":\"{}\"}}", "abc".repeat(1000));

        let Payload::Gzip(compressed) = policy.encode(body.clone()) else {
            panic!("expected gzip payload");
        };
        assert!(compressed.len() < body.len());

        let mut decoded = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let policy = CompressionPolicy {
            enabled: true,
            threshold_bytes: 16,
        };
        let body = "y".repeat(16);
        assert_eq!(policy.encode(body).is_compressed(), compression_supported());
    }

    #[test]
    fn test_report_success() {
        assert!(DeliveryReport::default().is_success());
    }

    #[test]
    fn test_new_rejects_invalid_api_key() {
        let mut creds = credentials("http://localhost:8080/ingest");
        creds.api_key = "bad\nkey".to_string();

        let result = Sender::new(&creds, &AgentConfig::default());
        assert!(matches!(result, Err(SenderError::InvalidHeader(_))));
    }

    #[test]
    fn test_deliver_nothing_is_noop() {
        let sender =
            Sender::new(&credentials("http://localhost:8080/ingest"), &AgentConfig::default())
                .unwrap();
        let report = tokio_test::block_on(sender.deliver(Vec::new(), DeliveryMode::Normal));

        assert!(report.is_success());
        assert!(report.delivered.is_empty());
        assert!(sender.batch_supported());
    }
}
