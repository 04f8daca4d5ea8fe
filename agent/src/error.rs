//! Error types for SitePulse Agent.
//!
//! The agent's tracking operations never fail outward. Option loading has
//! its own [`ConfigError`](crate::config::ConfigError) and session storage
//! its own [`StoreError`](crate::identity::StoreError); this module covers
//! reading replay scripts.

use thiserror::Error;

/// Errors raised while reading a replay script.
///
/// # Examples
///
/// ```
/// use sitepulse_agent::error::AgentError;
/// use sitepulse_agent::replay::parse_script;
///
/// let script = "{\"type\": \"click\"}\nnot json\n";
/// let err = parse_script(script.as_bytes()).unwrap_err();
/// assert!(matches!(err, AgentError::Replay { line: 2, .. }));
/// ```
#[derive(Error, Debug)]
pub enum AgentError {
    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A replay script line could not be parsed.
    #[error("invalid replay signal on line {line}: {source}")]
    Replay {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// A specialized `Result` type for replay operations.
pub type Result<T> = std::result::Result<T, AgentError>;
