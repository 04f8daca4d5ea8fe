//! Embedding interfaces between the agent and the page hosting it.
//!
//! The agent never reaches into a document directly. The embedding layer
//! supplies two capabilities:
//!
//! - [`Environment`]: read-only access to the current location, referrer,
//!   global bindings, script-tag attributes, and session storage
//! - [`SignalSource`]: "I can observe browser activity", a subscription
//!   interface that delivers [`BrowserSignal`]s (navigations, clicks, scrolls,
//!   submissions, errors, lifecycle changes) synchronously to listeners
//!
//! [`VirtualPage`] implements both in-process and backs the CLI replay
//! command and the tests. [`ProcessEnvironment`] exposes process environment
//! variables as global bindings for headless use.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::identity::SessionStore;
use crate::types::Meta;

/// Read-only view of the execution environment.
pub trait Environment: Send + Sync {
    /// Whether a document context exists at all.
    fn has_document(&self) -> bool;

    /// The current page URL, if there is a document.
    fn current_url(&self) -> Option<String>;

    /// The document referrer of the initial load.
    fn document_referrer(&self) -> Option<String> {
        None
    }

    /// A string-valued global binding.
    fn global_binding(&self, _name: &str) -> Option<String> {
        None
    }

    /// Whether a global binding is defined, whatever its value.
    fn has_global(&self, name: &str) -> bool {
        self.global_binding(name).is_some()
    }

    /// An attribute of the script tag that loaded the agent.
    fn current_script_attribute(&self, _name: &str) -> Option<String> {
        None
    }

    /// An attribute of the first script tag carrying it.
    fn find_script_attribute(&self, _name: &str) -> Option<String> {
        None
    }

    /// Content of the `<meta name="generator">` tag.
    fn meta_generator(&self) -> Option<String> {
        None
    }

    /// Tab-scoped storage for the session identifier.
    fn session_store(&self) -> Option<Arc<dyn SessionStore>> {
        None
    }
}

/// How the history changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationKind {
    Push,
    Replace,
    Pop,
}

/// A browser activity signal delivered to subscribed listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum BrowserSignal {
    /// The location changed through the history API or back/forward.
    Navigation { kind: NavigationKind },

    /// A click observed in the capturing phase. `button` follows the DOM
    /// numbering (0 = primary).
    Click {
        button: u16,
        #[serde(default)]
        meta: Meta,
    },

    /// The viewport scrolled.
    Scroll {
        offset: f64,
        viewport: f64,
        document_height: f64,
    },

    /// A submit event observed in the capturing phase. `is_form` is false
    /// when the target was not a form element.
    FormSubmit {
        is_form: bool,
        #[serde(default)]
        meta: Meta,
    },

    /// An uncaught synchronous error.
    Error {
        #[serde(default)]
        meta: Meta,
    },

    /// An unhandled promise rejection.
    UnhandledRejection {
        #[serde(default)]
        meta: Meta,
    },

    /// The page is being hidden or unloaded.
    PageHide,

    /// The document visibility changed.
    VisibilityChange { hidden: bool },
}

/// Callback invoked for every signal.
pub type SignalListener = Arc<dyn Fn(&BrowserSignal) + Send + Sync>;

/// Handle returned by [`SignalSource::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// A source of browser activity signals.
pub trait SignalSource: Send + Sync {
    /// Registers a listener and returns a handle for detaching it.
    fn subscribe(&self, listener: SignalListener) -> SubscriptionId;

    /// Detaches a listener. Unknown handles are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

#[derive(Debug, Default)]
struct PageState {
    location: Option<String>,
    referrer: Option<String>,
    globals: HashMap<String, String>,
    current_script: HashMap<String, String>,
    scripts: Vec<HashMap<String, String>>,
    generator: Option<String>,
}

/// An in-process page implementing both [`Environment`] and [`SignalSource`].
///
/// # Example
///
/// ```
/// use sitepulse_agent::host::{Environment, VirtualPage};
///
/// let page = VirtualPage::new("https://shop.example.com/")
///     .with_global("SITEPULSE_API_KEY", "pk_live");
///
/// page.push_state("/cart");
/// assert_eq!(page.current_url().as_deref(), Some("https://shop.example.com/cart"));
/// ```
pub struct VirtualPage {
    state: RwLock<PageState>,
    listeners: RwLock<Vec<(SubscriptionId, SignalListener)>>,
    next_id: AtomicU64,
    store: Option<Arc<dyn SessionStore>>,
}

impl VirtualPage {
    /// Creates a page showing `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let page = Self::headless();
        page.write_state().location = Some(url.into());
        page
    }

    /// Creates a page with no document context.
    #[must_use]
    pub fn headless() -> Self {
        Self {
            state: RwLock::new(PageState::default()),
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            store: None,
        }
    }

    #[must_use]
    pub fn with_referrer(self, referrer: impl Into<String>) -> Self {
        self.write_state().referrer = Some(referrer.into());
        self
    }

    #[must_use]
    pub fn with_global(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.write_state().globals.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_current_script_attribute(
        self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.write_state()
            .current_script
            .insert(name.into(), value.into());
        self
    }

    /// Adds another script tag carrying one attribute.
    #[must_use]
    pub fn with_script_attribute(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut tag = HashMap::new();
        tag.insert(name.into(), value.into());
        self.write_state().scripts.push(tag);
        self
    }

    #[must_use]
    pub fn with_generator(self, generator: impl Into<String>) -> Self {
        self.write_state().generator = Some(generator.into());
        self
    }

    #[must_use]
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the location without notifying listeners.
    pub fn set_location(&self, url: &str) {
        let resolved = self.resolve(url);
        self.write_state().location = Some(resolved);
    }

    /// `history.pushState` followed by the navigation signal.
    pub fn push_state(&self, url: &str) {
        self.navigate(url, NavigationKind::Push);
    }

    /// `history.replaceState` followed by the navigation signal.
    pub fn replace_state(&self, url: &str) {
        self.navigate(url, NavigationKind::Replace);
    }

    /// Back/forward navigation to `url` followed by `popstate`.
    pub fn pop_state(&self, url: &str) {
        self.navigate(url, NavigationKind::Pop);
    }

    /// Delivers a signal to every current listener.
    pub fn emit(&self, signal: &BrowserSignal) {
        // Listeners may subscribe or unsubscribe while handling the signal
        let listeners: Vec<SignalListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(signal);
        }
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn navigate(&self, url: &str, kind: NavigationKind) {
        self.set_location(url);
        self.emit(&BrowserSignal::Navigation { kind });
    }

    /// Resolves `url` against the current location, as the history API does.
    fn resolve(&self, url: &str) -> String {
        let current = self.read_state().location.clone();
        current
            .and_then(|base| Url::parse(&base).ok())
            .and_then(|base| base.join(url).ok())
            .map(|joined| joined.to_string())
            .unwrap_or_else(|| url.to_string())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, PageState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, PageState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualPage")
            .field("location", &self.read_state().location)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl Environment for VirtualPage {
    fn has_document(&self) -> bool {
        self.read_state().location.is_some()
    }

    fn current_url(&self) -> Option<String> {
        self.read_state().location.clone()
    }

    fn document_referrer(&self) -> Option<String> {
        self.read_state().referrer.clone()
    }

    fn global_binding(&self, name: &str) -> Option<String> {
        self.read_state().globals.get(name).cloned()
    }

    fn current_script_attribute(&self, name: &str) -> Option<String> {
        self.read_state().current_script.get(name).cloned()
    }

    fn find_script_attribute(&self, name: &str) -> Option<String> {
        let state = self.read_state();
        state
            .current_script
            .get(name)
            .or_else(|| state.scripts.iter().find_map(|tag| tag.get(name)))
            .cloned()
    }

    fn meta_generator(&self) -> Option<String> {
        self.read_state().generator.clone()
    }

    fn session_store(&self) -> Option<Arc<dyn SessionStore>> {
        self.store.clone()
    }
}

impl SignalSource for VirtualPage {
    fn subscribe(&self, listener: SignalListener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }
}

/// Environment backed by process environment variables.
///
/// Global bindings are read from variables of the same name; there is no
/// document unless a page URL is supplied.
#[derive(Clone, Default)]
pub struct ProcessEnvironment {
    page_url: Option<String>,
    store: Option<Arc<dyn SessionStore>>,
}

impl ProcessEnvironment {
    #[must_use]
    pub fn new(page_url: Option<String>) -> Self {
        Self {
            page_url,
            store: None,
        }
    }

    #[must_use]
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }
}

impl fmt::Debug for ProcessEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessEnvironment")
            .field("page_url", &self.page_url)
            .finish()
    }
}

impl Environment for ProcessEnvironment {
    fn has_document(&self) -> bool {
        self.page_url.is_some()
    }

    fn current_url(&self) -> Option<String> {
        self.page_url.clone()
    }

    fn global_binding(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn session_store(&self) -> Option<Arc<dyn SessionStore>> {
        self.store.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recording_listener() -> (SignalListener, Arc<Mutex<Vec<BrowserSignal>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: SignalListener = Arc::new(move |signal: &BrowserSignal| {
            sink.lock().unwrap().push(signal.clone());
        });
        (listener, seen)
    }

    #[test]
    fn push_state_resolves_relative_urls() {
        let page = VirtualPage::new("https://shop.example.com/products/1");
        page.push_state("../cart?step=2#summary");

        assert_eq!(
            page.current_url().as_deref(),
            Some("https://shop.example.com/cart?step=2#summary")
        );
    }

    #[test]
    fn navigation_notifies_listeners() {
        let page = VirtualPage::new("https://shop.example.com/");
        let (listener, seen) = recording_listener();
        page.subscribe(listener);

        page.push_state("/a");
        page.replace_state("/b");
        page.pop_state("/a");

        let kinds: Vec<NavigationKind> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|signal| match signal {
                BrowserSignal::Navigation { kind } => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                NavigationKind::Push,
                NavigationKind::Replace,
                NavigationKind::Pop
            ]
        );
    }

    #[test]
    fn unsubscribe_detaches_listener() {
        let page = VirtualPage::new("https://shop.example.com/");
        let (listener, seen) = recording_listener();
        let id = page.subscribe(listener);
        assert_eq!(page.listener_count(), 1);

        page.unsubscribe(id);
        page.emit(&BrowserSignal::PageHide);

        assert_eq!(page.listener_count(), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn headless_page_has_no_document() {
        let page = VirtualPage::headless();
        assert!(!page.has_document());
        assert!(page.current_url().is_none());
    }

    #[test]
    fn script_attribute_lookup_prefers_current_script() {
        let page = VirtualPage::new("https://shop.example.com/")
            .with_script_attribute("data-api-key", "other")
            .with_current_script_attribute("data-api-key", "mine");

        assert_eq!(page.find_script_attribute("data-api-key").as_deref(), Some("mine"));
    }

    #[test]
    fn signals_deserialize_from_tagged_json() {
        let signal: BrowserSignal = serde_json::from_value(json!({
            "signal": "click",
            "button": 0,
            "meta": { "tag": "a" }
        }))
        .unwrap();
        assert!(matches!(signal, BrowserSignal::Click { button: 0, .. }));

        let signal: BrowserSignal =
            serde_json::from_value(json!({ "signal": "visibility_change", "hidden": true }))
                .unwrap();
        assert_eq!(signal, BrowserSignal::VisibilityChange { hidden: true });
    }
}
