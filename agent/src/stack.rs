//! Best-effort detection of the technology stack serving the page.
//!
//! Detection runs once, when the agent is constructed, and only reads the
//! environment: the `generator` meta tag and a table of well-known global
//! bindings.

use tracing::debug;

use crate::host::Environment;
use crate::types::StackHints;

/// Global bindings that reveal a framework or platform.
const GLOBAL_MARKERS: &[(&str, &str)] = &[
    ("__NEXT_DATA__", "nextjs"),
    ("__NUXT__", "nuxt"),
    ("___gatsby", "gatsby"),
    ("React", "react"),
    ("__REACT_DEVTOOLS_GLOBAL_HOOK__", "react"),
    ("Vue", "vue"),
    ("__VUE__", "vue"),
    ("angular", "angularjs"),
    ("ng", "angular"),
    ("Ember", "ember"),
    ("Svelte", "svelte"),
    ("jQuery", "jquery"),
    ("Shopify", "shopify"),
    ("wp", "wordpress"),
    ("Drupal", "drupal"),
    ("Magento", "magento"),
    ("Wix", "wix"),
    ("Squarespace", "squarespace"),
];

/// Generator prefixes mapped to a platform name.
const GENERATOR_MARKERS: &[(&str, &str)] = &[
    ("wordpress", "wordpress"),
    ("drupal", "drupal"),
    ("joomla", "joomla"),
    ("ghost", "ghost"),
    ("hugo", "hugo"),
    ("jekyll", "jekyll"),
    ("wix", "wix"),
    ("squarespace", "squarespace"),
];

/// Detects stack hints from the environment.
///
/// Returns `None` when there is no document or nothing was recognized.
#[must_use]
pub fn detect(env: &dyn Environment) -> Option<StackHints> {
    if !env.has_document() {
        return None;
    }

    let generator = env
        .meta_generator()
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty());

    let mut frameworks: Vec<String> = Vec::new();
    let mut note = |name: &str| {
        if !frameworks.iter().any(|known| known == name) {
            frameworks.push(name.to_string());
        }
    };

    for &(global, name) in GLOBAL_MARKERS {
        if env.has_global(global) {
            note(name);
        }
    }

    if let Some(generator) = &generator {
        let lowered = generator.to_ascii_lowercase();
        for &(prefix, name) in GENERATOR_MARKERS {
            if lowered.starts_with(prefix) {
                note(name);
            }
        }
    }

    let hints = StackHints {
        generator,
        frameworks,
    };
    debug!(?hints, "Stack detection complete");

    (!hints.is_empty()).then_some(hints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::VirtualPage;

    #[test]
    fn detects_frameworks_from_globals() {
        let page = VirtualPage::new("https://shop.example.com/")
            .with_global("__NEXT_DATA__", "{}")
            .with_global("React", "");

        let hints = detect(&page).unwrap();
        assert_eq!(hints.frameworks, vec!["nextjs", "react"]);
        assert!(hints.generator.is_none());
    }

    #[test]
    fn generator_adds_platform_once() {
        let page = VirtualPage::new("https://blog.example.com/")
            .with_global("wp", "")
            .with_generator("WordPress 6.5.2");

        let hints = detect(&page).unwrap();
        assert_eq!(hints.generator.as_deref(), Some("WordPress 6.5.2"));
        assert_eq!(hints.frameworks, vec!["wordpress"]);
    }

    #[test]
    fn nothing_detected_yields_none() {
        let page = VirtualPage::new("https://plain.example.com/");
        assert!(detect(&page).is_none());
    }

    #[test]
    fn headless_yields_none() {
        let page = VirtualPage::headless().with_global("React", "");
        assert!(detect(&page).is_none());
    }
}
