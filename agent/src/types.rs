//! Event types for SitePulse telemetry.
//!
//! This module defines the event record delivered to the ingestion endpoint.
//! Events serialize to snake_case JSON with an ISO-8601 `ts` field.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Length of the random alphanumeric suffix in event IDs.
const EVENT_ID_SUFFIX_LEN: usize = 20;

/// Prefix for all event IDs.
const EVENT_ID_PREFIX: &str = "evt_";

/// Type-specific metadata attached to an event.
pub type Meta = Map<String, Value>;

/// Type classification for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PageView,
    Click,
    Scroll,
    FormSubmit,
    Error,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [EventType; 5] = [
        EventType::PageView,
        EventType::Click,
        EventType::Scroll,
        EventType::FormSubmit,
        EventType::Error,
    ];

    /// Returns the wire name of this event type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PageView => "page_view",
            Self::Click => "click",
            Self::Scroll => "scroll",
            Self::FormSubmit => "form_submit",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-time detection of the technology stack serving the page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackHints {
    /// Content of the page's `generator` meta tag, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<String>,

    /// Frameworks and platforms detected from global bindings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frameworks: Vec<String>,
}

impl StackHints {
    /// Returns true if nothing was detected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.generator.is_none() && self.frameworks.is_empty()
    }
}

/// A SitePulse telemetry event.
///
/// Events are immutable once built: the queue and retry layers may reorder
/// or discard them but never change their fields, which is why the fields
/// are only exposed through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_id: String,

    #[serde(with = "iso_millis")]
    ts: DateTime<Utc>,

    #[serde(rename = "type")]
    event_type: EventType,

    url: String,

    path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    referrer: Option<String>,

    session_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<Meta>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    stack_hints: Option<StackHints>,
}

/// The location and context fields an event is built from.
#[derive(Debug, Clone)]
pub(crate) struct EventParts {
    pub event_type: EventType,
    pub url: String,
    pub path: String,
    pub referrer: Option<String>,
    pub session_id: String,
    pub meta: Option<Meta>,
    pub stack_hints: Option<StackHints>,
}

impl Event {
    /// Stamps a new event with a fresh ID and the current time.
    pub(crate) fn from_parts(parts: EventParts) -> Self {
        Self {
            event_id: generate_event_id(),
            ts: Utc::now(),
            event_type: parts.event_type,
            url: parts.url,
            path: parts.path,
            referrer: parts.referrer,
            session_id: parts.session_id,
            meta: parts.meta,
            stack_hints: parts.stack_hints,
        }
    }

    /// Unique identifier, also the retry-tracking key.
    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    #[must_use]
    pub fn ts(&self) -> DateTime<Utc> {
        self.ts
    }

    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Normalized page URL (fragment always removed).
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn referrer(&self) -> Option<&str> {
        self.referrer.as_deref()
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn meta(&self) -> Option<&Meta> {
        self.meta.as_ref()
    }

    #[must_use]
    pub fn stack_hints(&self) -> Option<&StackHints> {
        self.stack_hints.as_ref()
    }
}

/// Why an event was permanently discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DropReason {
    /// Evicted from a full queue, or truncated after a retry re-insertion.
    Evicted,
    /// The endpoint rejected the API key (401/403).
    Unauthorized,
    /// The endpoint refused the event definitively. `status` is absent when
    /// the event could not be serialized.
    Rejected { status: Option<u16> },
    /// The event failed more often than the retry limit allows.
    RetryExhausted { attempts: u32 },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evicted => f.write_str("evicted"),
            Self::Unauthorized => f.write_str("unauthorized"),
            Self::Rejected { status: Some(status) } => write!(f, "rejected ({status})"),
            Self::Rejected { status: None } => f.write_str("rejected (unserializable)"),
            Self::RetryExhausted { attempts } => write!(f, "retry exhausted after {attempts} attempts"),
        }
    }
}

/// Generates a unique event ID with the format `evt_` followed by 20 alphanumeric characters.
fn generate_event_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

    let mut rng = rand::rng();
    let suffix: String = (0..EVENT_ID_SUFFIX_LEN)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect();

    format!("{EVENT_ID_PREFIX}{suffix}")
}

/// ISO-8601 timestamps with millisecond precision and a `Z` suffix.
mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sample_event() -> Event {
        Event::from_parts(EventParts {
            event_type: EventType::Click,
            url: "https://shop.example.com/cart".to_string(),
            path: "/cart".to_string(),
            referrer: None,
            session_id: "s_test".to_string(),
            meta: None,
            stack_hints: None,
        })
    }

    #[test]
    fn event_id_has_correct_format() {
        let id = generate_event_id();
        assert!(id.starts_with("evt_"));
        assert_eq!(id.len(), 24); // "evt_" (4) + 20 alphanumeric
    }

    #[test]
    fn event_id_is_alphanumeric_suffix() {
        let id = generate_event_id();
        let suffix = &id[4..];
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn event_ids_do_not_collide() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_event_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn event_type_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&EventType::PageView).unwrap(),
            "\"page_view\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::FormSubmit).unwrap(),
            "\"form_submit\""
        );
        for event_type in EventType::ALL {
            assert_eq!(
                serde_json::to_string(&event_type).unwrap(),
                format!("\"{}\"", event_type.as_str())
            );
        }
    }

    #[test]
    fn optional_fields_are_omitted() {
        let json = serde_json::to_value(sample_event()).unwrap();
        let obj = json.as_object().unwrap();

        assert_eq!(obj["type"], "click");
        assert_eq!(obj["path"], "/cart");
        assert!(!obj.contains_key("referrer"));
        assert!(!obj.contains_key("meta"));
        assert!(!obj.contains_key("stack_hints"));
    }

    #[test]
    fn ts_uses_millisecond_iso_format() {
        let json = serde_json::to_value(sample_event()).unwrap();
        let ts = json["ts"].as_str().unwrap();

        assert!(ts.ends_with('Z'));
        // 2026-10-18T12:34:56.789Z
        assert_eq!(ts.len(), 24);
    }

    #[test]
    fn event_survives_json_round_trip() {
        let event = sample_event();
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_id(), event.event_id());
        assert_eq!(parsed.event_type(), EventType::Click);
        assert_eq!(parsed.ts().timestamp_millis(), event.ts().timestamp_millis());
    }

    #[test]
    fn stack_hints_empty_detection() {
        assert!(StackHints::default().is_empty());
        let hints = StackHints {
            generator: Some("WordPress 6.5".to_string()),
            frameworks: vec![],
        };
        assert!(!hints.is_empty());
    }
}
