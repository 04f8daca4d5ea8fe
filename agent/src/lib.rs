//! SitePulse Agent - client-side telemetry collection and delivery.
//!
//! This crate observes page activity, turns it into structured events, and
//! delivers them to an ingestion endpoint despite network failures, endpoint
//! incompatibilities, and page teardown.
//!
//! # Overview
//!
//! Browser activity arrives as [`host::BrowserSignal`]s from an embedding
//! layer. The [`navigation`] monitor decides which signals become events, the
//! [`builder`] stamps them with location and session data, and the
//! [`privacy`] sanitizer strips metadata down to a per-type allowlist. Events
//! wait in a bounded [`queue`] until a flush hands them to the [`sender`],
//! which batches when the endpoint allows it. Transient failures go back to
//! the head of the queue under the [`retry`] policy.
//!
//! # Privacy
//!
//! Metadata fields are dropped unless explicitly allowlisted for the event
//! type, and page views carry no metadata by default.
//!
//! # Modules
//!
//! - [`agent`]: Lifecycle, flush scheduling, retry timers, and stats
//! - [`builder`]: Event construction and URL normalization
//! - [`config`]: Options from JSON or environment variables
//! - [`error`]: Error types for setup operations
//! - [`host`]: Embedding interfaces and the in-process [`host::VirtualPage`]
//! - [`identity`]: Session identifiers and credential resolution
//! - [`navigation`]: Page transition state machine and scroll gating
//! - [`privacy`]: Metadata allowlist and size clamp
//! - [`queue`]: Bounded FIFO event buffer
//! - [`replay`]: Scripted signal playback
//! - [`retry`]: Backoff and per-event attempt ledger
//! - [`sender`]: HTTP delivery with batch fallback and compression
//! - [`stack`]: One-time technology stack detection
//! - [`types`]: Event types

pub mod agent;
pub mod builder;
pub mod config;
pub mod error;
pub mod host;
pub mod identity;
pub mod navigation;
pub mod privacy;
pub mod queue;
pub mod replay;
pub mod retry;
pub mod sender;
pub mod stack;
pub mod types;

pub use agent::{Agent, AgentBuilder, AgentStats};
pub use config::{AgentConfig, ConfigError};
pub use error::{AgentError, Result};
pub use host::{BrowserSignal, Environment, NavigationKind, SignalSource, VirtualPage};
pub use identity::{
    resolve_credentials, CredentialSource, Credentials, FileSessionStore, MemorySessionStore,
    SessionStore,
};
pub use privacy::{MetaAllowlist, MetaSanitizer};
pub use retry::RetryPolicy;
pub use sender::{DeliveryMode, Sender, SenderError};
pub use types::{DropReason, Event, EventType, Meta, StackHints};
