//! Event construction from raw browser signals.
//!
//! [`EventBuilder`] reads the current location from the [`Environment`],
//! normalizes it, runs the metadata through the [`MetaSanitizer`], and stamps
//! the session identifier. Stack hints are computed by the caller once and
//! handed to the builder; they are attached to page views only.

use std::sync::Arc;

use url::Url;

use crate::host::Environment;
use crate::identity::SessionResolver;
use crate::privacy::MetaSanitizer;
use crate::types::{Event, EventParts, EventType, Meta, StackHints};

/// Builds normalized, sanitized events.
#[derive(Debug)]
pub struct EventBuilder {
    sanitizer: MetaSanitizer,
    drop_url_query: bool,
    stack_hints: Option<StackHints>,
    session: Arc<SessionResolver>,
}

impl EventBuilder {
    #[must_use]
    pub fn new(
        sanitizer: MetaSanitizer,
        drop_url_query: bool,
        stack_hints: Option<StackHints>,
        session: Arc<SessionResolver>,
    ) -> Self {
        Self {
            sanitizer,
            drop_url_query,
            stack_hints,
            session,
        }
    }

    /// Builds an event for the current location.
    ///
    /// `referrer_override` replaces the document referrer; SPA navigations
    /// pass the previous normalized URL here.
    ///
    /// Returns `None` when there is no document context.
    #[must_use]
    pub fn build(
        &self,
        env: &dyn Environment,
        event_type: EventType,
        raw_meta: Option<&Meta>,
        referrer_override: Option<String>,
    ) -> Option<Event> {
        if !env.has_document() {
            return None;
        }
        let location = env.current_url()?;

        let url = normalize_url(&location, self.drop_url_query);
        let path = url_path(&url);
        let referrer = referrer_override.or_else(|| env.document_referrer());
        let stack_hints = match event_type {
            EventType::PageView => self.stack_hints.clone(),
            _ => None,
        };

        Some(Event::from_parts(EventParts {
            event_type,
            url,
            path,
            referrer,
            session_id: self.session.session_id(),
            meta: self.sanitizer.sanitize(event_type, raw_meta),
            stack_hints,
        }))
    }

    /// Normalizes a location with this builder's query policy.
    #[must_use]
    pub fn normalize(&self, location: &str) -> String {
        normalize_url(location, self.drop_url_query)
    }
}

/// Removes the fragment, and the query string when `drop_query` is set.
///
/// Unparseable input is trimmed textually at `#` (and `?`).
#[must_use]
pub fn normalize_url(raw: &str, drop_query: bool) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_fragment(None);
            if drop_query {
                url.set_query(None);
            }
            url.to_string()
        }
        Err(_) => {
            let without_fragment = raw.split('#').next().unwrap_or_default();
            if drop_query {
                without_fragment
                    .split('?')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            } else {
                without_fragment.to_string()
            }
        }
    }
}

/// Path component of a URL.
///
/// When the URL cannot be parsed, a string starting with `/` is stripped of
/// its `?` and `#` segments; anything else maps to `/`.
#[must_use]
pub fn url_path(raw: &str) -> String {
    if let Ok(url) = Url::parse(raw) {
        return url.path().to_string();
    }

    if raw.starts_with('/') {
        let end = raw.find(['?', '#']).unwrap_or(raw.len());
        raw[..end].to_string()
    } else {
        "/".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::VirtualPage;
    use crate::privacy::MetaAllowlist;
    use serde_json::json;

    fn builder(drop_url_query: bool, stack_hints: Option<StackHints>) -> EventBuilder {
        EventBuilder::new(
            MetaSanitizer::new(MetaAllowlist::default(), 2048),
            drop_url_query,
            stack_hints,
            Arc::new(SessionResolver::new(None)),
        )
    }

    fn hints() -> StackHints {
        StackHints {
            generator: None,
            frameworks: vec!["react".to_string()],
        }
    }

    #[test]
    fn fragment_is_always_removed() {
        assert_eq!(
            normalize_url("https://a.example.com/docs?q=1#intro", false),
            "https://a.example.com/docs?q=1"
        );
    }

    #[test]
    fn query_removed_when_configured() {
        assert_eq!(
            normalize_url("https://a.example.com/docs?q=1#intro", true),
            "https://a.example.com/docs"
        );
    }

    #[test]
    fn unparseable_urls_are_trimmed_textually() {
        assert_eq!(normalize_url("/docs?q=1#intro", false), "/docs?q=1");
        assert_eq!(normalize_url("/docs?q=1#intro", true), "/docs");
    }

    #[test]
    fn path_from_parsed_url() {
        assert_eq!(url_path("https://a.example.com/shop/cart?x=1"), "/shop/cart");
        assert_eq!(url_path("https://a.example.com"), "/");
    }

    #[test]
    fn path_fallbacks() {
        assert_eq!(url_path("/shop/cart?x=1#top"), "/shop/cart");
        assert_eq!(url_path("/shop#top"), "/shop");
        assert_eq!(url_path("not a url"), "/");
        assert_eq!(url_path(""), "/");
    }

    #[test]
    fn headless_build_returns_none() {
        let page = VirtualPage::headless();
        assert!(builder(false, None)
            .build(&page, EventType::PageView, None, None)
            .is_none());
    }

    #[test]
    fn build_normalizes_location_and_uses_document_referrer() {
        let page = VirtualPage::new("https://shop.example.com/p/1?utm=x#reviews")
            .with_referrer("https://search.example.org/");

        let event = builder(true, None)
            .build(&page, EventType::PageView, None, None)
            .unwrap();

        assert_eq!(event.url(), "https://shop.example.com/p/1");
        assert_eq!(event.path(), "/p/1");
        assert_eq!(event.referrer(), Some("https://search.example.org/"));
        assert!(event.session_id().starts_with("s_"));
    }

    #[test]
    fn referrer_override_wins() {
        let page = VirtualPage::new("https://shop.example.com/cart")
            .with_referrer("https://search.example.org/");

        let event = builder(false, None)
            .build(
                &page,
                EventType::PageView,
                None,
                Some("https://shop.example.com/".to_string()),
            )
            .unwrap();

        assert_eq!(event.referrer(), Some("https://shop.example.com/"));
    }

    #[test]
    fn stack_hints_only_on_page_views() {
        let page = VirtualPage::new("https://shop.example.com/");
        let builder = builder(false, Some(hints()));

        let view = builder.build(&page, EventType::PageView, None, None).unwrap();
        assert_eq!(view.stack_hints(), Some(&hints()));

        let click = builder.build(&page, EventType::Click, None, None).unwrap();
        assert!(click.stack_hints().is_none());
    }

    #[test]
    fn meta_is_sanitized() {
        let page = VirtualPage::new("https://shop.example.com/");
        let raw = json!({ "depth": 50, "scrollTop": 1234 });

        let event = builder(false, None)
            .build(&page, EventType::Scroll, raw.as_object(), None)
            .unwrap();

        assert_eq!(
            serde_json::to_value(event.meta().unwrap()).unwrap(),
            json!({ "depth": 50 })
        );
    }

    #[test]
    fn events_share_session_and_get_unique_ids() {
        let page = VirtualPage::new("https://shop.example.com/");
        let builder = builder(false, None);

        let a = builder.build(&page, EventType::Click, None, None).unwrap();
        let b = builder.build(&page, EventType::Click, None, None).unwrap();

        assert_eq!(a.session_id(), b.session_id());
        assert_ne!(a.event_id(), b.event_id());
    }
}
