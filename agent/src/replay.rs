//! Scripted browser activity for driving an agent without a browser.
//!
//! A replay script is JSON Lines: one tagged [`ReplaySignal`] per line, blank
//! lines and lines starting with `#` ignored.
//!
//! ```text
//! {"type": "navigate", "url": "/products/42"}
//! {"type": "click", "meta": {"tag": "button", "id": "add-to-cart"}}
//! {"type": "scroll", "offset": 1200, "viewport": 800, "document_height": 4000}
//! {"type": "wait", "ms": 600}
//! {"type": "hide"}
//! ```

use std::io::BufRead;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AgentError, Result};
use crate::host::{BrowserSignal, NavigationKind, VirtualPage};
use crate::types::Meta;

/// One line of a replay script.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplaySignal {
    /// Change the location; `kind` defaults to a history push.
    Navigate {
        url: String,
        #[serde(default = "default_kind")]
        kind: NavigationKind,
    },
    Click {
        #[serde(default)]
        button: u16,
        #[serde(default)]
        meta: Meta,
    },
    Scroll {
        offset: f64,
        viewport: f64,
        document_height: f64,
    },
    Submit {
        #[serde(default = "default_true")]
        is_form: bool,
        #[serde(default)]
        meta: Meta,
    },
    Error {
        #[serde(default)]
        meta: Meta,
    },
    Rejection {
        #[serde(default)]
        meta: Meta,
    },
    /// Page hide.
    Hide,
    /// Visibility change.
    Visibility { hidden: bool },
    /// Pause before the next line.
    Wait { ms: u64 },
}

fn default_kind() -> NavigationKind {
    NavigationKind::Push
}

fn default_true() -> bool {
    true
}

/// Parses a replay script.
///
/// # Errors
///
/// Returns `AgentError::Io` if reading fails and `AgentError::Replay` naming
/// the first line that is not a valid signal.
pub fn parse_script<R: BufRead>(reader: R) -> Result<Vec<ReplaySignal>> {
    let mut signals = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let signal = serde_json::from_str(trimmed).map_err(|source| AgentError::Replay {
            line: index + 1,
            source,
        })?;
        signals.push(signal);
    }

    Ok(signals)
}

/// Plays one signal against a page.
pub async fn play(page: &VirtualPage, signal: ReplaySignal) {
    match signal {
        ReplaySignal::Navigate { url, kind } => match kind {
            NavigationKind::Push => page.push_state(&url),
            NavigationKind::Replace => page.replace_state(&url),
            NavigationKind::Pop => page.pop_state(&url),
        },
        ReplaySignal::Click { button, meta } => page.emit(&BrowserSignal::Click { button, meta }),
        ReplaySignal::Scroll {
            offset,
            viewport,
            document_height,
        } => page.emit(&BrowserSignal::Scroll {
            offset,
            viewport,
            document_height,
        }),
        ReplaySignal::Submit { is_form, meta } => {
            page.emit(&BrowserSignal::FormSubmit { is_form, meta });
        }
        ReplaySignal::Error { meta } => page.emit(&BrowserSignal::Error { meta }),
        ReplaySignal::Rejection { meta } => {
            page.emit(&BrowserSignal::UnhandledRejection { meta });
        }
        ReplaySignal::Hide => page.emit(&BrowserSignal::PageHide),
        ReplaySignal::Visibility { hidden } => {
            page.emit(&BrowserSignal::VisibilityChange { hidden });
        }
        ReplaySignal::Wait { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
    }
}
