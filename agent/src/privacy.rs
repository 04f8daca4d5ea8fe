//! Metadata sanitization for SitePulse events.
//!
//! Every raw metadata object passes through [`MetaSanitizer`] before it is
//! attached to an event. The sanitizer is a strict allowlist:
//!
//! - **Per-type allowlist**: only the field names configured for the event's
//!   type are copied; unknown fields are silently dropped, never passed through
//! - **No empty values**: `null` values are skipped
//! - **Size clamp**: if the serialized result exceeds `maxMetaBytes`, the whole
//!   object is replaced by `{}` rather than truncating individual values
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use sitepulse_agent::privacy::{MetaAllowlist, MetaSanitizer};
//! use sitepulse_agent::types::EventType;
//!
//! let sanitizer = MetaSanitizer::new(MetaAllowlist::default(), 2048);
//! let raw = json!({ "depth": 42, "secret": "x" });
//!
//! let meta = sanitizer.sanitize(EventType::Scroll, raw.as_object()).unwrap();
//! assert_eq!(serde_json::Value::Object(meta), json!({ "depth": 42 }));
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::types::{EventType, Meta};

/// Fields permitted on click events.
const CLICK_FIELDS: &[&str] = &["tag", "id", "role", "href", "text"];

/// Fields permitted on scroll events.
const SCROLL_FIELDS: &[&str] = &["depth"];

/// Fields permitted on form submissions. Field values are never collected.
const FORM_SUBMIT_FIELDS: &[&str] = &["form_id", "form_name", "action", "method", "field_count"];

/// Fields permitted on error events.
const ERROR_FIELDS: &[&str] = &["message", "source", "line", "column", "kind"];

/// Permitted metadata field names per event type.
///
/// Page views carry no metadata by default; their only extra channel is the
/// one-time stack hints payload.
///
/// When deserialized from a config object, the supplied entries replace the
/// defaults for the types they name and leave the others untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetaAllowlist {
    fields: HashMap<EventType, Vec<String>>,
}

impl MetaAllowlist {
    /// Creates an allowlist with no permitted fields for any type.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            fields: HashMap::new(),
        }
    }

    /// Replaces the permitted fields for one event type.
    #[must_use]
    pub fn with_fields<I, S>(mut self, event_type: EventType, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields
            .insert(event_type, fields.into_iter().map(Into::into).collect());
        self
    }

    /// Returns the permitted fields for a type (empty if none).
    #[must_use]
    pub fn fields_for(&self, event_type: EventType) -> &[String] {
        self.fields
            .get(&event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl Default for MetaAllowlist {
    fn default() -> Self {
        Self::empty()
            .with_fields(EventType::PageView, Vec::<String>::new())
            .with_fields(EventType::Click, CLICK_FIELDS.iter().copied())
            .with_fields(EventType::Scroll, SCROLL_FIELDS.iter().copied())
            .with_fields(EventType::FormSubmit, FORM_SUBMIT_FIELDS.iter().copied())
            .with_fields(EventType::Error, ERROR_FIELDS.iter().copied())
    }
}

impl<'de> Deserialize<'de> for MetaAllowlist {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let overrides = HashMap::<EventType, Vec<String>>::deserialize(deserializer)?;
        let mut allowlist = Self::default();
        allowlist.fields.extend(overrides);
        Ok(allowlist)
    }
}

/// Applies the per-type allowlist and size clamp to raw metadata.
#[derive(Debug, Clone)]
pub struct MetaSanitizer {
    allowlist: MetaAllowlist,
    max_meta_bytes: usize,
}

impl MetaSanitizer {
    #[must_use]
    pub fn new(allowlist: MetaAllowlist, max_meta_bytes: usize) -> Self {
        Self {
            allowlist,
            max_meta_bytes,
        }
    }

    /// Sanitizes raw metadata for an event type.
    ///
    /// Returns `None` when the type permits no fields, when no raw metadata
    /// was supplied, or when none of the permitted fields carried a value.
    /// Returns an empty object when the filtered metadata is too large to
    /// send (or cannot be serialized).
    #[must_use]
    pub fn sanitize(&self, event_type: EventType, raw: Option<&Meta>) -> Option<Meta> {
        let permitted = self.allowlist.fields_for(event_type);
        let raw = raw?;
        if permitted.is_empty() {
            return None;
        }

        let candidate: Meta = permitted
            .iter()
            .filter_map(|key| {
                raw.get(key)
                    .filter(|value| !value.is_null())
                    .map(|value| (key.clone(), value.clone()))
            })
            .collect();

        if candidate.is_empty() {
            return None;
        }

        match serde_json::to_vec(&candidate) {
            Ok(bytes) if bytes.len() <= self.max_meta_bytes => Some(candidate),
            Ok(bytes) => {
                debug!(
                    event_type = %event_type,
                    size = bytes.len(),
                    limit = self.max_meta_bytes,
                    "Metadata over size limit, discarding fields"
                );
                Some(Meta::new())
            }
            Err(e) => {
                debug!(event_type = %event_type, error = %e, "Metadata not serializable");
                Some(Meta::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn sanitizer(max_meta_bytes: usize) -> MetaSanitizer {
        MetaSanitizer::new(MetaAllowlist::default(), max_meta_bytes)
    }

    fn object(value: Value) -> Meta {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn scroll_keeps_only_depth() {
        let raw = object(json!({ "depth": 42, "secret": "x" }));
        let meta = sanitizer(2048).sanitize(EventType::Scroll, Some(&raw)).unwrap();

        assert_eq!(Value::Object(meta), json!({ "depth": 42 }));
    }

    #[test]
    fn page_view_never_carries_meta() {
        let raw = object(json!({ "title": "Checkout", "depth": 10 }));
        assert!(sanitizer(2048)
            .sanitize(EventType::PageView, Some(&raw))
            .is_none());
    }

    #[test]
    fn absent_raw_meta_yields_none() {
        assert!(sanitizer(2048).sanitize(EventType::Click, None).is_none());
    }

    #[test]
    fn null_values_are_skipped() {
        let raw = object(json!({ "tag": "button", "id": null, "href": null }));
        let meta = sanitizer(2048).sanitize(EventType::Click, Some(&raw)).unwrap();

        assert_eq!(Value::Object(meta), json!({ "tag": "button" }));
    }

    #[test]
    fn no_permitted_values_yields_none() {
        let raw = object(json!({ "password": "hunter2", "value": "secret" }));
        assert!(sanitizer(2048)
            .sanitize(EventType::FormSubmit, Some(&raw))
            .is_none());
    }

    #[test]
    fn oversized_meta_becomes_empty_object() {
        let raw = object(json!({ "message": "x".repeat(500), "line": 12 }));
        let meta = sanitizer(64).sanitize(EventType::Error, Some(&raw)).unwrap();

        assert!(meta.is_empty(), "oversized meta must not be truncated");
    }

    #[test]
    fn meta_exactly_at_limit_is_kept() {
        let raw = object(json!({ "depth": 5 }));
        let size = serde_json::to_vec(&raw).unwrap().len();
        let meta = sanitizer(size).sanitize(EventType::Scroll, Some(&raw)).unwrap();

        assert_eq!(meta.len(), 1);
    }

    #[test]
    fn nested_values_are_copied_whole() {
        let raw = object(json!({ "source": { "file": "app.js" }, "stack": "..." }));
        let meta = sanitizer(2048).sanitize(EventType::Error, Some(&raw)).unwrap();

        assert_eq!(Value::Object(meta), json!({ "source": { "file": "app.js" } }));
    }

    #[test]
    fn custom_allowlist_replaces_named_types_only() {
        let allowlist: MetaAllowlist =
            serde_json::from_value(json!({ "click": ["label"] })).unwrap();

        assert_eq!(allowlist.fields_for(EventType::Click), ["label".to_string()]);
        assert_eq!(allowlist.fields_for(EventType::Scroll), ["depth".to_string()]);
        assert!(allowlist.fields_for(EventType::PageView).is_empty());
    }

    #[test]
    fn allowlist_can_open_page_view_meta() {
        let allowlist = MetaAllowlist::default().with_fields(EventType::PageView, ["title"]);
        let raw = object(json!({ "title": "Home" }));
        let meta = MetaSanitizer::new(allowlist, 2048)
            .sanitize(EventType::PageView, Some(&raw))
            .unwrap();

        assert_eq!(Value::Object(meta), json!({ "title": "Home" }));
    }
}
