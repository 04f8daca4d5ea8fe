//! Navigation monitor: turns browser signals into tracking actions.
//!
//! The monitor is a pure state machine. It does not build or enqueue events
//! itself; [`NavigationMonitor::handle`] returns the [`NavAction`]s the agent
//! should perform, which keeps the transition logic testable without a page
//! or a clock.
//!
//! # States
//!
//! ```text
//! Uninitialized --first location--> Tracking { last_url }
//! Tracking --location differs--> Tracking { new url }   (page_view, referrer = last_url)
//! Tracking --location equal-->   Tracking                (nothing)
//! ```

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::trace;

use crate::host::BrowserSignal;
use crate::types::{EventType, Meta};

/// Primary mouse button in DOM numbering.
const PRIMARY_BUTTON: u16 = 0;

/// Something the agent should do in response to a signal.
#[derive(Debug, Clone, PartialEq)]
pub enum NavAction {
    /// Build and enqueue an event.
    Track {
        event_type: EventType,
        meta: Option<Meta>,
        /// Replaces the document referrer when set.
        referrer: Option<String>,
    },
    /// Deliver everything queued in keepalive mode.
    FlushKeepalive,
}

/// Whether a location has been observed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavState {
    Uninitialized,
    Tracking { last_url: String },
}

/// Throttled, step-gated scroll depth reporting.
#[derive(Debug, Clone)]
pub struct ScrollTracker {
    step: u8,
    throttle: Duration,
    last_depth: u8,
    last_emitted: Option<Instant>,
}

impl ScrollTracker {
    #[must_use]
    pub fn new(step: u8, throttle: Duration) -> Self {
        Self {
            step: step.max(1),
            throttle,
            last_depth: 0,
            last_emitted: None,
        }
    }

    /// Returns the depth to report, if this scroll passes both gates.
    pub fn observe(
        &mut self,
        offset: f64,
        viewport: f64,
        document_height: f64,
        now: Instant,
    ) -> Option<u8> {
        let depth = scroll_depth(offset, viewport, document_height)?;

        if let Some(last) = self.last_emitted {
            if now.saturating_duration_since(last) <= self.throttle {
                return None;
            }
        }
        if u16::from(depth) < u16::from(self.last_depth) + u16::from(self.step) {
            return None;
        }

        self.last_depth = depth;
        self.last_emitted = Some(now);
        Some(depth)
    }

    /// Forgets the reported depth; called when the page changes.
    pub fn reset(&mut self) {
        self.last_depth = 0;
        self.last_emitted = None;
    }

    #[must_use]
    pub fn last_depth(&self) -> u8 {
        self.last_depth
    }
}

/// Percentage of the document seen so far, rounded and clamped to 0..=100.
///
/// `None` when the document height is not a positive finite number.
#[must_use]
pub fn scroll_depth(offset: f64, viewport: f64, document_height: f64) -> Option<u8> {
    if !document_height.is_finite() || document_height <= 0.0 {
        return None;
    }
    let seen = (offset + viewport) / document_height * 100.0;
    if !seen.is_finite() {
        return None;
    }
    Some(seen.clamp(0.0, 100.0).round() as u8)
}

/// Tracks page transitions and gates derived events.
#[derive(Debug, Clone)]
pub struct NavigationMonitor {
    state: NavState,
    scroll: ScrollTracker,
}

impl NavigationMonitor {
    #[must_use]
    pub fn new(scroll_step: u8, scroll_throttle: Duration) -> Self {
        Self {
            state: NavState::Uninitialized,
            scroll: ScrollTracker::new(scroll_step, scroll_throttle),
        }
    }

    #[must_use]
    pub fn state(&self) -> &NavState {
        &self.state
    }

    /// Records a normalized location.
    ///
    /// The first location yields a page view with the document referrer; a
    /// later, different location yields a page view whose referrer is the
    /// previous location and resets scroll tracking.
    pub fn observe_location(&mut self, normalized_url: &str) -> Option<NavAction> {
        match &self.state {
            NavState::Uninitialized => {
                self.state = NavState::Tracking {
                    last_url: normalized_url.to_string(),
                };
                Some(NavAction::Track {
                    event_type: EventType::PageView,
                    meta: None,
                    referrer: None,
                })
            }
            NavState::Tracking { last_url } if last_url == normalized_url => {
                trace!(url = normalized_url, "Location unchanged");
                None
            }
            NavState::Tracking { last_url } => {
                let previous = last_url.clone();
                self.state = NavState::Tracking {
                    last_url: normalized_url.to_string(),
                };
                self.scroll.reset();
                Some(NavAction::Track {
                    event_type: EventType::PageView,
                    meta: None,
                    referrer: Some(previous),
                })
            }
        }
    }

    /// Handles one signal.
    ///
    /// `normalized_url` is the current location after normalization; it is
    /// only consulted for navigation signals.
    pub fn handle(
        &mut self,
        signal: &BrowserSignal,
        normalized_url: Option<&str>,
        now: Instant,
    ) -> Vec<NavAction> {
        let action = match signal {
            BrowserSignal::Navigation { .. } => {
                normalized_url.and_then(|url| self.observe_location(url))
            }
            BrowserSignal::Click { button, meta } => (*button == PRIMARY_BUTTON)
                .then(|| track(EventType::Click, Some(meta.clone()))),
            BrowserSignal::Scroll {
                offset,
                viewport,
                document_height,
            } => self
                .scroll
                .observe(*offset, *viewport, *document_height, now)
                .map(|depth| {
                    let mut meta = Meta::new();
                    meta.insert("depth".to_string(), Value::from(depth));
                    track(EventType::Scroll, Some(meta))
                }),
            BrowserSignal::FormSubmit { is_form, meta } => {
                is_form.then(|| track(EventType::FormSubmit, Some(meta.clone())))
            }
            BrowserSignal::Error { meta } => Some(track(
                EventType::Error,
                Some(with_kind(meta, "error")),
            )),
            BrowserSignal::UnhandledRejection { meta } => Some(track(
                EventType::Error,
                Some(with_kind(meta, "unhandled_rejection")),
            )),
            BrowserSignal::PageHide | BrowserSignal::VisibilityChange { hidden: true } => {
                Some(NavAction::FlushKeepalive)
            }
            BrowserSignal::VisibilityChange { hidden: false } => None,
        };

        action.into_iter().collect()
    }
}

fn track(event_type: EventType, meta: Option<Meta>) -> NavAction {
    NavAction::Track {
        event_type,
        meta,
        referrer: None,
    }
}

fn with_kind(meta: &Meta, kind: &str) -> Meta {
    let mut meta = meta.clone();
    meta.insert("kind".to_string(), Value::from(kind));
    meta
}
