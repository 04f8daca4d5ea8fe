//! Identity and environment resolution for SitePulse Agent.
//!
//! Two concerns live here:
//!
//! - **Session identity**: a stable `s_<uuid>` identifier per storage scope,
//!   kept in a [`SessionStore`] and falling back to a per-agent value when no
//!   store is usable
//! - **Credentials**: the API key and ingestion URL, resolved from explicit
//!   options, global bindings, script attributes, and built-in defaults
//!
//! # Resolution order
//!
//! For both the API key and the ingest URL:
//!
//! 1. Explicit option
//! 2. Global binding (`SITEPULSE_API_KEY` / `SITEPULSE_INGEST_URL`)
//! 3. Attribute on the declaring script tag (`data-api-key` / `data-ingest-url`)
//! 4. Attribute on any script tag carrying it
//!
//! The ingest URL additionally falls back to a build-time default
//! (`SITEPULSE_DEFAULT_INGEST_URL` at compile time) and finally to
//! `/api/ingest` on the current page's origin.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::host::Environment;

/// Storage key for the session identifier.
pub const SESSION_STORAGE_KEY: &str = "sitepulse_session_id";

/// Prefix for session identifiers.
const SESSION_ID_PREFIX: &str = "s_";

/// Global binding holding the API key.
pub const GLOBAL_API_KEY: &str = "SITEPULSE_API_KEY";

/// Global binding holding the ingestion URL.
pub const GLOBAL_INGEST_URL: &str = "SITEPULSE_INGEST_URL";

/// Script attribute holding the API key.
pub const ATTR_API_KEY: &str = "data-api-key";

/// Script attribute holding the ingestion URL.
pub const ATTR_INGEST_URL: &str = "data-ingest-url";

/// Ingestion path used when nothing else resolves.
pub const FALLBACK_INGEST_PATH: &str = "/api/ingest";

/// Ingestion URL baked in at build time, if any.
const BUILD_DEFAULT_INGEST_URL: Option<&str> = option_env!("SITEPULSE_DEFAULT_INGEST_URL");

/// Errors raised by session stores.
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error reading or writing the store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store exists but cannot be used (disabled, quota, ...).
    #[error("session storage unavailable: {0}")]
    Unavailable(String),
}

/// A scoped key/value store that outlives a single agent instance.
pub trait SessionStore: Send + Sync {
    /// Reads a value.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes a value.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be written.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// In-memory store; clones share the same scope.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// File-backed store: one file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Creates a store rooted at `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }

        let mut contents = String::new();
        File::open(&path)?.read_to_string(&mut contents)?;
        let value = contents.trim();
        Ok((!value.is_empty()).then(|| value.to_string()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;

        let path = self.path_for(key);
        let mut file = File::create(&path)?;
        file.write_all(value.as_bytes())?;
        file.write_all(b"\n")?;

        // Session IDs are readable by the owner only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&path, perms)?;
        }

        Ok(())
    }
}

/// Resolves the session identifier for one agent instance.
///
/// The identifier is created lazily on first access. It is read from (and
/// persisted to) the store when one is usable; otherwise a fallback value is
/// generated once and reused for the lifetime of this resolver.
pub struct SessionResolver {
    store: Option<Arc<dyn SessionStore>>,
    fallback: OnceLock<String>,
}

impl SessionResolver {
    #[must_use]
    pub fn new(store: Option<Arc<dyn SessionStore>>) -> Self {
        Self {
            store,
            fallback: OnceLock::new(),
        }
    }

    /// Returns the session identifier, creating it if needed.
    pub fn session_id(&self) -> String {
        if let Some(fallback) = self.fallback.get() {
            return fallback.clone();
        }

        if let Some(store) = &self.store {
            match store.get(SESSION_STORAGE_KEY) {
                Ok(Some(existing)) => return existing,
                Ok(None) => {
                    let created = generate_session_id();
                    match store.set(SESSION_STORAGE_KEY, &created) {
                        Ok(()) => {
                            debug!(session_id = %created, "Created session");
                            return created;
                        }
                        Err(e) => warn!(error = %e, "Session store not writable, using fallback"),
                    }
                }
                Err(e) => warn!(error = %e, "Session store not readable, using fallback"),
            }
        }

        self.fallback.get_or_init(generate_session_id).clone()
    }
}

impl std::fmt::Debug for SessionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionResolver")
            .field("has_store", &self.store.is_some())
            .field("fallback", &self.fallback.get())
            .finish()
    }
}

/// Generates a session identifier with the format `s_<uuid>`.
fn generate_session_id() -> String {
    format!("{SESSION_ID_PREFIX}{}", Uuid::new_v4())
}

/// Indicates where a credential was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Passed explicitly in the agent options.
    Explicit,
    /// Read from a global binding.
    GlobalBinding,
    /// Read from the script tag that loaded the agent.
    CurrentScript,
    /// Read from some other script tag carrying the attribute.
    ScriptTag,
    /// Baked in at build time.
    BuildDefault,
    /// The fallback ingestion path on the page origin.
    Fallback,
}

/// Resolved API key and ingestion URL.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub api_key_source: CredentialSource,
    pub ingest_url: String,
    pub ingest_url_source: CredentialSource,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_key_source", &self.api_key_source)
            .field("ingest_url", &self.ingest_url)
            .field("ingest_url_source", &self.ingest_url_source)
            .finish()
    }
}

/// Resolves the API key from the first source that provides one.
#[must_use]
pub fn resolve_api_key(
    explicit: Option<&str>,
    env: &dyn Environment,
) -> Option<(String, CredentialSource)> {
    lookup_chain(explicit, env, GLOBAL_API_KEY, ATTR_API_KEY)
}

/// Resolves the ingestion URL from the first source that provides one.
#[must_use]
pub fn resolve_ingest_url(
    explicit: Option<&str>,
    env: &dyn Environment,
) -> Option<(String, CredentialSource)> {
    if let Some(found) = lookup_chain(explicit, env, GLOBAL_INGEST_URL, ATTR_INGEST_URL) {
        return Some(found);
    }

    if let Some(url) = non_blank(BUILD_DEFAULT_INGEST_URL.map(str::to_string)) {
        return Some((url, CredentialSource::BuildDefault));
    }

    let page = env.current_url()?;
    let base = Url::parse(&page).ok()?;
    let fallback = base.join(FALLBACK_INGEST_PATH).ok()?;
    Some((fallback.to_string(), CredentialSource::Fallback))
}

/// Resolves both credentials. `None` means the agent must stay inert.
#[must_use]
pub fn resolve_credentials(
    explicit_api_key: Option<&str>,
    explicit_ingest_url: Option<&str>,
    env: &dyn Environment,
) -> Option<Credentials> {
    let (api_key, api_key_source) = resolve_api_key(explicit_api_key, env)?;
    let (ingest_url, ingest_url_source) = resolve_ingest_url(explicit_ingest_url, env)?;
    Some(Credentials {
        api_key,
        api_key_source,
        ingest_url,
        ingest_url_source,
    })
}

fn lookup_chain(
    explicit: Option<&str>,
    env: &dyn Environment,
    global: &str,
    attribute: &str,
) -> Option<(String, CredentialSource)> {
    let tagged = |source: CredentialSource| move |value: String| (value, source);

    non_blank(explicit.map(str::to_string))
        .map(tagged(CredentialSource::Explicit))
        .or_else(|| non_blank(env.global_binding(global)).map(tagged(CredentialSource::GlobalBinding)))
        .or_else(|| {
            non_blank(env.current_script_attribute(attribute))
                .map(tagged(CredentialSource::CurrentScript))
        })
        .or_else(|| {
            non_blank(env.find_script_attribute(attribute)).map(tagged(CredentialSource::ScriptTag))
        })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::VirtualPage;
    use tempfile::TempDir;

    /// A store that fails every operation.
    struct BrokenStore;

    impl SessionStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("disabled".to_string()))
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disabled".to_string()))
        }
    }

    #[test]
    fn session_id_has_prefix_and_uuid() {
        let id = generate_session_id();
        assert!(id.starts_with("s_"));
        assert!(Uuid::parse_str(&id[2..]).is_ok());
    }

    #[test]
    fn resolvers_sharing_a_store_share_the_id() {
        let store = MemorySessionStore::new();
        let first = SessionResolver::new(Some(Arc::new(store.clone())));
        let second = SessionResolver::new(Some(Arc::new(store)));

        assert_eq!(first.session_id(), second.session_id());
    }

    #[test]
    fn resolver_without_store_is_stable_per_instance() {
        let resolver = SessionResolver::new(None);
        let id = resolver.session_id();
        assert_eq!(resolver.session_id(), id);

        let other = SessionResolver::new(None);
        assert_ne!(other.session_id(), id);
    }

    #[test]
    fn broken_store_falls_back_once() {
        let resolver = SessionResolver::new(Some(Arc::new(BrokenStore)));
        let id = resolver.session_id();

        assert!(id.starts_with("s_"));
        assert_eq!(resolver.session_id(), id);
    }

    #[test]
    fn file_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(temp_dir.path().join("scope"));

        assert!(store.get(SESSION_STORAGE_KEY).unwrap().is_none());
        store.set(SESSION_STORAGE_KEY, "s_abc").unwrap();
        assert_eq!(store.get(SESSION_STORAGE_KEY).unwrap().as_deref(), Some("s_abc"));
    }

    #[cfg(unix)]
    #[test]
    fn file_store_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(temp_dir.path());
        store.set(SESSION_STORAGE_KEY, "s_abc").unwrap();

        let mode = fs::metadata(temp_dir.path().join(SESSION_STORAGE_KEY))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn file_store_shares_id_across_resolvers() {
        let temp_dir = TempDir::new().unwrap();
        let first = SessionResolver::new(Some(Arc::new(FileSessionStore::new(temp_dir.path()))));
        let second = SessionResolver::new(Some(Arc::new(FileSessionStore::new(temp_dir.path()))));

        assert_eq!(first.session_id(), second.session_id());
    }

    #[test]
    fn explicit_credentials_win() {
        let page = VirtualPage::new("https://shop.example.com/")
            .with_global(GLOBAL_API_KEY, "global-key")
            .with_current_script_attribute(ATTR_API_KEY, "script-key");

        let creds =
            resolve_credentials(Some("explicit-key"), Some("https://in.example.com/e"), &page)
                .unwrap();
        assert_eq!(creds.api_key, "explicit-key");
        assert_eq!(creds.api_key_source, CredentialSource::Explicit);
        assert_eq!(creds.ingest_url, "https://in.example.com/e");
    }

    #[test]
    fn api_key_lookup_order() {
        let page = VirtualPage::new("https://shop.example.com/")
            .with_current_script_attribute(ATTR_API_KEY, "current")
            .with_script_attribute(ATTR_API_KEY, "any");
        assert_eq!(
            resolve_api_key(None, &page),
            Some(("current".to_string(), CredentialSource::CurrentScript))
        );

        let page = VirtualPage::new("https://shop.example.com/")
            .with_script_attribute(ATTR_API_KEY, "any");
        assert_eq!(
            resolve_api_key(None, &page),
            Some(("any".to_string(), CredentialSource::ScriptTag))
        );

        let page = VirtualPage::new("https://shop.example.com/")
            .with_global(GLOBAL_API_KEY, "global")
            .with_script_attribute(ATTR_API_KEY, "any");
        assert_eq!(
            resolve_api_key(None, &page),
            Some(("global".to_string(), CredentialSource::GlobalBinding))
        );
    }

    #[test]
    fn blank_values_are_skipped() {
        let page = VirtualPage::new("https://shop.example.com/")
            .with_global(GLOBAL_API_KEY, "   ")
            .with_script_attribute(ATTR_API_KEY, "tag-key");

        assert_eq!(
            resolve_api_key(Some(""), &page),
            Some(("tag-key".to_string(), CredentialSource::ScriptTag))
        );
    }

    #[test]
    fn missing_api_key_means_inert() {
        let page = VirtualPage::new("https://shop.example.com/");
        assert!(resolve_credentials(None, None, &page).is_none());
    }

    #[test]
    fn ingest_url_falls_back_to_page_origin() {
        if BUILD_DEFAULT_INGEST_URL.is_some() {
            return;
        }
        let page = VirtualPage::new("https://shop.example.com/products/42?ref=home");

        assert_eq!(
            resolve_ingest_url(None, &page),
            Some((
                "https://shop.example.com/api/ingest".to_string(),
                CredentialSource::Fallback
            ))
        );
    }

    #[test]
    fn ingest_url_unresolved_without_page() {
        if BUILD_DEFAULT_INGEST_URL.is_some() {
            return;
        }
        let page = VirtualPage::headless().with_global(GLOBAL_API_KEY, "key");
        assert!(resolve_credentials(None, None, &page).is_none());
    }

    #[test]
    fn credentials_debug_redacts_key() {
        let creds = Credentials {
            api_key: "super-secret".to_string(),
            api_key_source: CredentialSource::Explicit,
            ingest_url: "https://in.example.com".to_string(),
            ingest_url_source: CredentialSource::Explicit,
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("super-secret"));
    }
}
