//! Agent lifecycle: wiring, flush scheduling, and retry timers.
//!
//! An [`Agent`] owns the queue, the retry ledger, the backoff state, and the
//! navigation monitor. Everything synchronous (tracking, enqueueing, signal
//! handling) runs on the caller's thread; deliveries and timers run as tokio
//! tasks.
//!
//! # Concurrency
//!
//! - State sits behind `std::sync::Mutex`es that are never held across an
//!   `.await`
//! - At most one flush is in flight; a flush requested while another runs is
//!   a no-op
//! - At most one retry timer is pending
//! - Timer tasks hold a weak reference and exit once the agent is dropped
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use sitepulse_agent::agent::AgentBuilder;
//! use sitepulse_agent::config::AgentConfig;
//! use sitepulse_agent::host::VirtualPage;
//!
//! # async fn run() {
//! let page = Arc::new(VirtualPage::new("https://shop.example.com/"));
//! let agent = AgentBuilder::new(AgentConfig::default())
//!     .page(Arc::clone(&page))
//!     .api_key("pk_live_123")
//!     .ingest_url("https://ingest.example.com/api/ingest")
//!     .build();
//!
//! agent.start();
//! page.push_state("/cart");
//!
//! let remaining = agent.shutdown(Duration::from_secs(5)).await;
//! assert_eq!(remaining, 0);
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::builder::EventBuilder;
use crate::config::AgentConfig;
use crate::host::{
    BrowserSignal, Environment, ProcessEnvironment, SignalSource, SubscriptionId, VirtualPage,
};
use crate::identity::{resolve_credentials, SessionResolver};
use crate::navigation::{NavAction, NavigationMonitor};
use crate::privacy::MetaSanitizer;
use crate::queue::EventQueue;
use crate::retry::{Backoff, RetryLedger, RetryPolicy};
use crate::sender::{DeliveryMode, DeliveryReport, Sender};
use crate::stack;
use crate::types::{DropReason, Event, EventType, Meta};

/// Poll interval while shutdown waits for an in-flight flush.
const SHUTDOWN_POLL_MS: u64 = 10;

/// Observer invoked synchronously for every enqueued event.
pub type EnqueueHook = Arc<dyn Fn(&Event) + Send + Sync>;

/// Observer invoked for every permanently discarded event.
pub type DropHook = Arc<dyn Fn(&Event, &DropReason) + Send + Sync>;

/// Counters describing what happened to tracked events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentStats {
    pub enqueued: u64,
    pub evicted: u64,
    pub delivered: u64,
    pub dropped_unauthorized: u64,
    pub dropped_rejected: u64,
    pub dropped_retry_exhausted: u64,
    pub batch_downgrades: u64,
}

impl AgentStats {
    /// Events discarded for any reason.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.evicted
            + self.dropped_unauthorized
            + self.dropped_rejected
            + self.dropped_retry_exhausted
    }

    fn record_drop(&mut self, reason: &DropReason) {
        match reason {
            DropReason::Evicted => self.evicted += 1,
            DropReason::Unauthorized => self.dropped_unauthorized += 1,
            DropReason::Rejected { .. } => self.dropped_rejected += 1,
            DropReason::RetryExhausted { .. } => self.dropped_retry_exhausted += 1,
        }
    }
}

/// Builder for [`Agent`].
pub struct AgentBuilder {
    config: AgentConfig,
    environment: Option<Arc<dyn Environment>>,
    signals: Option<Arc<dyn SignalSource>>,
    on_enqueue: Option<EnqueueHook>,
    on_drop: Option<DropHook>,
    api_key: Option<String>,
    ingest_url: Option<String>,
    retry_policy: Option<RetryPolicy>,
}

impl AgentBuilder {
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            environment: None,
            signals: None,
            on_enqueue: None,
            on_drop: None,
            api_key: None,
            ingest_url: None,
            retry_policy: None,
        }
    }

    /// Sets the environment read by the resolver and the event builder.
    ///
    /// Defaults to a [`ProcessEnvironment`] without a document.
    #[must_use]
    pub fn environment(mut self, environment: Arc<dyn Environment>) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Sets the source of browser signals subscribed to by [`Agent::start`].
    #[must_use]
    pub fn signals(mut self, signals: Arc<dyn SignalSource>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Uses a [`VirtualPage`] as both environment and signal source.
    #[must_use]
    pub fn page(self, page: Arc<VirtualPage>) -> Self {
        self.environment(Arc::clone(&page) as Arc<dyn Environment>)
            .signals(page)
    }

    #[must_use]
    pub fn on_enqueue(mut self, hook: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.on_enqueue = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_drop(mut self, hook: impl Fn(&Event, &DropReason) + Send + Sync + 'static) -> Self {
        self.on_drop = Some(Arc::new(hook));
        self
    }

    /// Explicit API key; takes precedence over the config and the environment.
    #[must_use]
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Explicit ingestion URL; takes precedence over the config and the environment.
    #[must_use]
    pub fn ingest_url(mut self, ingest_url: impl Into<String>) -> Self {
        self.ingest_url = Some(ingest_url.into());
        self
    }

    /// Overrides the retry policy derived from the config.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Resolves credentials and assembles the agent.
    ///
    /// Never fails: when credentials do not resolve, or the HTTP client
    /// cannot be built, the agent is inert.
    #[must_use]
    pub fn build(self) -> Agent {
        let config = self.config;
        let env: Arc<dyn Environment> = self
            .environment
            .unwrap_or_else(|| Arc::new(ProcessEnvironment::default()));

        let api_key = self.api_key.or_else(|| config.api_key.clone());
        let ingest_url = self.ingest_url.or_else(|| config.ingest_url.clone());

        let credentials =
            resolve_credentials(api_key.as_deref(), ingest_url.as_deref(), env.as_ref());
        let sender = match credentials {
            Some(credentials) => match Sender::new(&credentials, &config) {
                Ok(sender) => {
                    info!(
                        ingest_url = %credentials.ingest_url,
                        api_key_source = ?credentials.api_key_source,
                        ingest_url_source = ?credentials.ingest_url_source,
                        "SitePulse agent active"
                    );
                    Some(sender)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to create HTTP client, agent stays inert");
                    None
                }
            },
            None => {
                info!("No API key or ingest URL resolved, agent stays inert");
                None
            }
        };

        let stack_hints = if config.include_stack_hints {
            stack::detect(env.as_ref())
        } else {
            None
        };

        let session = Arc::new(SessionResolver::new(env.session_store()));
        let builder = EventBuilder::new(
            MetaSanitizer::new(config.meta_allowlist.clone(), config.max_meta_bytes),
            config.drop_url_query,
            stack_hints,
            Arc::clone(&session),
        );
        let policy = self
            .retry_policy
            .unwrap_or_else(|| RetryPolicy::from_config(&config));

        let inner = Inner {
            queue: Mutex::new(EventQueue::new(config.max_queue_size)),
            ledger: Mutex::new(RetryLedger::new(policy.max_attempts)),
            backoff: Mutex::new(Backoff::new(policy)),
            navigation: Mutex::new(NavigationMonitor::new(
                config.scroll_step,
                config.scroll_throttle(),
            )),
            retry_timer: Mutex::new(None),
            retry_generation: AtomicU64::new(0),
            flush_timer: Mutex::new(None),
            keepalive_tasks: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
            flushing: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
            stats: Mutex::new(AgentStats::default()),
            config,
            env,
            signals: self.signals,
            builder,
            session,
            sender,
            on_enqueue: self.on_enqueue,
            on_drop: self.on_drop,
        };

        Agent {
            inner: Arc::new(inner),
        }
    }
}

impl fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("config", &self.config)
            .field("has_environment", &self.environment.is_some())
            .field("has_signals", &self.signals.is_some())
            .finish_non_exhaustive()
    }
}

/// A client-side telemetry agent.
///
/// Cloning yields another handle to the same agent.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<Inner>,
}

struct Inner {
    config: AgentConfig,
    env: Arc<dyn Environment>,
    signals: Option<Arc<dyn SignalSource>>,
    builder: EventBuilder,
    session: Arc<SessionResolver>,
    /// `None` when the agent is inert.
    sender: Option<Sender>,
    queue: Mutex<EventQueue>,
    ledger: Mutex<RetryLedger>,
    backoff: Mutex<Backoff>,
    navigation: Mutex<NavigationMonitor>,
    retry_timer: Mutex<Option<(u64, JoinHandle<()>)>>,
    retry_generation: AtomicU64,
    flush_timer: Mutex<Option<JoinHandle<()>>>,
    keepalive_tasks: Mutex<Vec<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionId>>,
    flushing: AtomicBool,
    /// Events handed to a delivery that has not finished.
    in_flight: AtomicUsize,
    /// Set by shutdown; no retry timer is armed afterwards.
    shut_down: AtomicBool,
    stats: Mutex<AgentStats>,
    on_enqueue: Option<EnqueueHook>,
    on_drop: Option<DropHook>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the in-flight flag when a flush ends, including by cancellation.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Counts events out for delivery until the delivery settles.
struct InFlight<'a> {
    count: &'a AtomicUsize,
    events: usize,
}

impl<'a> InFlight<'a> {
    fn new(count: &'a AtomicUsize, events: usize) -> Self {
        count.fetch_add(events, Ordering::AcqRel);
        Self { count, events }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(self.events, Ordering::AcqRel);
    }
}

impl Agent {
    /// Whether credentials resolved and the agent can deliver.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.sender.is_some()
    }

    /// Attaches the signal listener, starts the periodic flush timer, and
    /// records the initial page view.
    ///
    /// Returns false for an inert agent. Calling it again on a started agent
    /// does nothing.
    pub fn start(&self) -> bool {
        if !self.is_active() {
            debug!("Agent inert, not starting");
            return false;
        }

        {
            let mut subscription = lock(&self.inner.subscription);
            if subscription.is_some() {
                return true;
            }
            if let Some(signals) = &self.inner.signals {
                let weak = Arc::downgrade(&self.inner);
                let id = signals.subscribe(Arc::new(move |signal: &BrowserSignal| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_signal(signal);
                    }
                }));
                *subscription = Some(id);
            } else {
                // Marks the agent as started even without a signal source
                *subscription = Some(SubscriptionId::new(0));
            }
        }

        self.inner.start_flush_timer();
        self.inner.observe_location();
        info!("Agent started");
        true
    }

    /// Detaches the listener and stops the periodic flush timer.
    ///
    /// An in-flight flush and a pending retry timer are left to finish.
    pub fn stop(&self) {
        let subscription = lock(&self.inner.subscription).take();
        if let (Some(id), Some(signals)) = (subscription, &self.inner.signals) {
            signals.unsubscribe(id);
        }
        if let Some(timer) = lock(&self.inner.flush_timer).take() {
            timer.abort();
        }
        debug!("Agent stopped");
    }

    /// Builds and enqueues an event for the current page.
    ///
    /// Returns true if an event was enqueued; false for an inert agent or
    /// when there is no document.
    pub fn track(&self, event_type: EventType, meta: Option<&Meta>) -> bool {
        self.inner.track(event_type, meta, None)
    }

    /// Enqueues a prebuilt event. Ignored by an inert agent.
    pub fn enqueue(&self, event: Event) {
        self.inner.enqueue(event);
    }

    /// Delivers everything queued.
    ///
    /// Returns true when a delivery ran and every event was accepted; false
    /// when nothing was sent (inert, empty queue, or a flush already in
    /// flight) or some events failed.
    ///
    /// The delivery runs as its own task, so dropping the returned future
    /// stops the wait but not the delivery.
    pub async fn flush(&self) -> bool {
        let inner = Arc::clone(&self.inner);
        match tokio::spawn(async move { inner.flush(DeliveryMode::Normal).await }).await {
            Ok(success) => success,
            Err(e) => {
                warn!(error = %e, "Flush task failed");
                false
            }
        }
    }

    /// Starts a background flush on the current tokio runtime.
    pub fn request_flush(&self) {
        self.inner.request_flush(DeliveryMode::Normal);
    }

    /// Stops the agent, waits for pending keepalive deliveries, and makes a
    /// final keepalive flush, all bounded by `timeout`.
    ///
    /// Any pending retry timer is cancelled and no new one is armed. The
    /// final flush runs as its own task: on timeout only the wait is
    /// abandoned, and a late delivery still updates the stats and the
    /// `on_drop` hook.
    ///
    /// # Returns
    ///
    /// The number of events not yet delivered: still queued or in flight.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.stop();
        if !self.is_active() {
            return self.queue_len();
        }
        self.inner.shut_down.store(true, Ordering::Release);

        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.keepalive_tasks).drain(..).collect();
        let inner = Arc::clone(&self.inner);
        let drain = tokio::spawn(async move {
            for task in tasks {
                if let Err(e) = task.await {
                    debug!(error = %e, "Keepalive delivery did not complete");
                }
            }
            while inner.flushing.load(Ordering::Acquire) {
                tokio::time::sleep(Duration::from_millis(SHUTDOWN_POLL_MS)).await;
            }
            inner.flush(DeliveryMode::Keepalive).await;
        });

        match tokio::time::timeout(timeout, drain).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Final flush task failed"),
            Err(_) => warn!(timeout_secs = timeout.as_secs_f64(), "Shutdown timed out"),
        }

        if let Some((_, timer)) = lock(&self.inner.retry_timer).take() {
            timer.abort();
        }

        let remaining = self.queue_len() + self.in_flight();
        if remaining > 0 {
            warn!(remaining, "Events still queued at shutdown");
        }
        info!(remaining, "Agent shut down");
        remaining
    }

    #[must_use]
    pub fn session_id(&self) -> String {
        self.inner.session.session_id()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Events handed to a delivery that has not finished yet.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Snapshot of the queued events, oldest first.
    #[must_use]
    pub fn queued_events(&self) -> Vec<Event> {
        lock(&self.inner.queue).iter().cloned().collect()
    }

    /// Failed attempts recorded for an event still awaiting retry.
    #[must_use]
    pub fn retry_attempts(&self, event_id: &str) -> Option<u32> {
        lock(&self.inner.ledger).attempts(event_id)
    }

    #[must_use]
    pub fn ledger_len(&self) -> usize {
        lock(&self.inner.ledger).len()
    }

    /// Whether batch delivery is still attempted. Always false when inert.
    #[must_use]
    pub fn batch_supported(&self) -> bool {
        self.inner
            .sender
            .as_ref()
            .is_some_and(|sender| self.inner.config.allow_batch && sender.batch_supported())
    }

    /// Whether a retry timer is pending.
    #[must_use]
    pub fn retry_pending(&self) -> bool {
        lock(&self.inner.retry_timer)
            .as_ref()
            .is_some_and(|(_, timer)| !timer.is_finished())
    }

    #[must_use]
    pub fn stats(&self) -> AgentStats {
        *lock(&self.inner.stats)
    }

    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("active", &self.is_active())
            .field("ingest_url", &self.inner.sender.as_ref().map(Sender::ingest_url))
            .field("queue_len", &self.queue_len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Inner {
    fn track(
        self: &Arc<Self>,
        event_type: EventType,
        meta: Option<&Meta>,
        referrer: Option<String>,
    ) -> bool {
        if self.sender.is_none() {
            return false;
        }
        match self.builder.build(self.env.as_ref(), event_type, meta, referrer) {
            Some(event) => {
                self.enqueue(event);
                true
            }
            None => {
                debug!(event_type = %event_type, "No document, event skipped");
                false
            }
        }
    }

    fn enqueue(self: &Arc<Self>, event: Event) {
        if self.sender.is_none() {
            return;
        }

        let observed = self.on_enqueue.as_ref().map(|_| event.clone());
        let (evicted, len) = {
            let mut queue = lock(&self.queue);
            let evicted = queue.push(event);
            (evicted, queue.len())
        };
        lock(&self.stats).enqueued += 1;

        for event in &evicted {
            lock(&self.ledger).resolve(event.event_id());
            self.record_drop(event, DropReason::Evicted);
        }
        if let (Some(hook), Some(event)) = (&self.on_enqueue, observed) {
            hook(&event);
        }

        if len >= self.config.flush_max_events {
            debug!(queue_len = len, "Flush threshold reached");
            self.request_flush(DeliveryMode::Normal);
        }
    }

    fn record_drop(&self, event: &Event, reason: DropReason) {
        lock(&self.stats).record_drop(&reason);
        match reason {
            DropReason::Evicted => {
                debug!(event_id = event.event_id(), reason = %reason, "Event dropped");
            }
            _ => warn!(event_id = event.event_id(), reason = %reason, "Event dropped"),
        }
        if let Some(hook) = &self.on_drop {
            hook(event, &reason);
        }
    }

    fn handle_signal(self: &Arc<Self>, signal: &BrowserSignal) {
        let location = self.normalized_location();
        let actions = lock(&self.navigation).handle(signal, location.as_deref(), Instant::now());
        self.apply(actions);
    }

    fn observe_location(self: &Arc<Self>) {
        let Some(location) = self.normalized_location() else {
            return;
        };
        let action = lock(&self.navigation).observe_location(&location);
        self.apply(action.into_iter().collect());
    }

    fn normalized_location(&self) -> Option<String> {
        if !self.env.has_document() {
            return None;
        }
        self.env
            .current_url()
            .map(|url| self.builder.normalize(&url))
    }

    fn apply(self: &Arc<Self>, actions: Vec<NavAction>) {
        for action in actions {
            match action {
                NavAction::Track {
                    event_type,
                    meta,
                    referrer,
                } => {
                    self.track(event_type, meta.as_ref(), referrer);
                }
                NavAction::FlushKeepalive => self.request_flush(DeliveryMode::Keepalive),
            }
        }
    }

    fn request_flush(self: &Arc<Self>, mode: DeliveryMode) {
        if self.sender.is_none() {
            return;
        }
        if self.flushing.load(Ordering::Acquire) {
            debug!("Flush already in flight");
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            debug!("No async runtime, flush deferred");
            return;
        };

        let inner = Arc::clone(self);
        let task = runtime.spawn(async move {
            inner.flush(mode).await;
        });

        if mode == DeliveryMode::Keepalive {
            let mut tasks = lock(&self.keepalive_tasks);
            tasks.retain(|task| !task.is_finished());
            tasks.push(task);
        }
    }

    async fn flush(self: &Arc<Self>, mode: DeliveryMode) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Flush already in flight");
            return false;
        }
        let _guard = FlushGuard(&self.flushing);

        let events = lock(&self.queue).drain_all();
        if events.is_empty() {
            return false;
        }

        debug!(events = events.len(), ?mode, "Flushing events");
        let report = {
            let _in_flight = InFlight::new(&self.in_flight, events.len());
            sender.deliver(events, mode).await
        };
        self.apply_report(report)
    }

    fn apply_report(self: &Arc<Self>, report: DeliveryReport) -> bool {
        let success = report.is_success();

        {
            let mut ledger = lock(&self.ledger);
            for event in &report.delivered {
                ledger.resolve(event.event_id());
            }
            for (event, _) in &report.dropped {
                ledger.resolve(event.event_id());
            }
        }
        {
            let mut stats = lock(&self.stats);
            stats.delivered += report.delivered.len() as u64;
            if report.batch_downgraded {
                stats.batch_downgrades += 1;
            }
        }

        for (event, reason) in report.dropped {
            self.record_drop(&event, reason);
        }
        if !report.retry.is_empty() {
            self.schedule_retry(report.retry);
        }
        if success {
            self.reset_backoff();
        }

        success
    }

    fn schedule_retry(self: &Arc<Self>, events: Vec<Event>) {
        let partition = lock(&self.ledger).record_failures(events);

        for (event, attempts) in partition.exhausted {
            self.record_drop(&event, DropReason::RetryExhausted { attempts });
        }
        if partition.retry.is_empty() {
            return;
        }

        let retrying = partition.retry.len();
        let truncated = lock(&self.queue).requeue_front(partition.retry);
        for event in &truncated {
            lock(&self.ledger).resolve(event.event_id());
            self.record_drop(event, DropReason::Evicted);
        }

        debug!(events = retrying, "Events re-queued for retry");
        self.arm_retry_timer();
    }

    fn arm_retry_timer(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::Acquire) {
            debug!("Agent shut down, retry left queued");
            return;
        }
        let mut timer = lock(&self.retry_timer);
        if timer.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            debug!("No async runtime, retry timer not armed");
            return;
        };

        let delay = lock(&self.backoff).next_delay();
        let generation = self.retry_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let weak: Weak<Inner> = Arc::downgrade(self);

        debug!(delay_ms = delay.as_millis() as u64, "Retry scheduled");
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            lock(&inner.backoff).advance();
            {
                let mut timer = lock(&inner.retry_timer);
                if timer.as_ref().is_some_and(|(current, _)| *current == generation) {
                    timer.take();
                }
            }
            inner.request_flush(DeliveryMode::Normal);
        });
        *timer = Some((generation, handle));
    }

    fn reset_backoff(&self) {
        lock(&self.backoff).reset();
        if let Some((_, timer)) = lock(&self.retry_timer).take() {
            timer.abort();
        }
    }

    fn start_flush_timer(self: &Arc<Self>) {
        let Some(interval) = self.config.flush_interval() else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            debug!("No async runtime, periodic flush disabled");
            return;
        };

        let weak = Arc::downgrade(self);
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.request_flush(DeliveryMode::Normal);
            }
        });

        if let Some(previous) = lock(&self.flush_timer).replace(handle) {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemorySessionStore;

    fn quiet_config() -> AgentConfig {
        AgentConfig {
            flush_interval_ms: 0,
            flush_max_events: 1_000,
            ..AgentConfig::default()
        }
    }

    fn active_agent(page: Arc<VirtualPage>, config: AgentConfig) -> Agent {
        AgentBuilder::new(config)
            .page(page)
            .api_key("pk_test")
            .ingest_url("http://127.0.0.1:9/api/ingest")
            .build()
    }

    #[test]
    fn unresolved_credentials_leave_agent_inert() {
        let page = Arc::new(VirtualPage::new("https://shop.example.com/"));
        let agent = AgentBuilder::new(quiet_config()).page(Arc::clone(&page)).build();

        assert!(!agent.is_active());
        assert!(!agent.start());
        assert_eq!(page.listener_count(), 0);
        assert!(!agent.track(EventType::Click, None));
        assert_eq!(agent.queue_len(), 0);
        assert!(!agent.batch_supported());
    }

    #[test]
    fn start_records_initial_page_view_once() {
        let page = Arc::new(
            VirtualPage::new("https://shop.example.com/")
                .with_referrer("https://search.example.org/"),
        );
        let agent = active_agent(Arc::clone(&page), quiet_config());

        assert!(agent.start());
        assert!(agent.start());
        assert_eq!(page.listener_count(), 1);

        let events = agent.queued_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), EventType::PageView);
        assert_eq!(events[0].referrer(), Some("https://search.example.org/"));
    }

    #[test]
    fn stop_detaches_listener() {
        let page = Arc::new(VirtualPage::new("https://shop.example.com/"));
        let agent = active_agent(Arc::clone(&page), quiet_config());
        agent.start();

        agent.stop();
        page.push_state("/elsewhere");

        assert_eq!(page.listener_count(), 0);
        assert_eq!(agent.queue_len(), 1);
    }

    #[test]
    fn headless_track_is_noop() {
        let page = Arc::new(VirtualPage::headless());
        let agent = active_agent(page, quiet_config());

        assert!(agent.is_active());
        assert!(!agent.track(EventType::Click, None));
        assert_eq!(agent.queue_len(), 0);
    }

    #[test]
    fn enqueue_hook_sees_every_event() {
        let page = Arc::new(VirtualPage::new("https://shop.example.com/"));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let agent = AgentBuilder::new(quiet_config())
            .page(page)
            .api_key("pk_test")
            .ingest_url("http://127.0.0.1:9/api/ingest")
            .on_enqueue(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        agent.track(EventType::Click, None);
        agent.track(EventType::Error, None);

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(agent.stats().enqueued, 2);
    }

    #[test]
    fn overflow_is_counted_and_reported() {
        let page = Arc::new(VirtualPage::new("https://shop.example.com/"));
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&dropped);
        let agent = AgentBuilder::new(AgentConfig {
            max_queue_size: 2,
            ..quiet_config()
        })
        .page(page)
        .api_key("pk_test")
        .ingest_url("http://127.0.0.1:9/api/ingest")
        .on_drop(move |event, reason| {
            sink.lock().unwrap().push((event.event_id().to_string(), *reason));
        })
        .build();

        for _ in 0..5 {
            agent.track(EventType::Click, None);
        }

        assert_eq!(agent.queue_len(), 2);
        assert_eq!(agent.stats().evicted, 3);
        let dropped = dropped.lock().unwrap();
        assert_eq!(dropped.len(), 3);
        assert!(dropped.iter().all(|(_, reason)| *reason == DropReason::Evicted));
    }

    #[test]
    fn size_trigger_without_runtime_keeps_events() {
        let page = Arc::new(VirtualPage::new("https://shop.example.com/"));
        let agent = active_agent(
            page,
            AgentConfig {
                flush_max_events: 2,
                ..quiet_config()
            },
        );

        agent.track(EventType::Click, None);
        agent.track(EventType::Click, None);
        agent.track(EventType::Click, None);

        assert_eq!(agent.queue_len(), 3);
    }

    #[test]
    fn agents_sharing_a_store_share_session() {
        let store = MemorySessionStore::new();
        let page = |store: &MemorySessionStore| {
            Arc::new(
                VirtualPage::new("https://shop.example.com/")
                    .with_session_store(Arc::new(store.clone())),
            )
        };
        let first = active_agent(page(&store), quiet_config());
        let second = active_agent(page(&store), quiet_config());

        assert_eq!(first.session_id(), second.session_id());
    }

    #[test]
    fn stack_hints_attach_to_page_views() {
        let page = Arc::new(
            VirtualPage::new("https://shop.example.com/")
                .with_generator("WordPress 6.5")
                .with_global("jQuery", "3.7.1"),
        );
        let agent = active_agent(Arc::clone(&page), quiet_config());
        agent.start();
        agent.track(EventType::Click, None);

        let events = agent.queued_events();
        let hints = events[0].stack_hints().unwrap();
        assert_eq!(hints.generator.as_deref(), Some("WordPress 6.5"));
        assert!(hints.frameworks.contains(&"jquery".to_string()));
        assert!(events[1].stack_hints().is_none());
    }

    #[test]
    fn stack_hints_can_be_disabled() {
        let page =
            Arc::new(VirtualPage::new("https://shop.example.com/").with_generator("Hugo 0.120"));
        let agent = active_agent(
            page,
            AgentConfig {
                include_stack_hints: false,
                ..quiet_config()
            },
        );
        agent.start();

        assert!(agent.queued_events()[0].stack_hints().is_none());
    }

    #[tokio::test]
    async fn flush_on_inert_agent_sends_nothing() {
        let agent = AgentBuilder::new(quiet_config()).build();
        assert!(!agent.flush().await);
        assert_eq!(agent.shutdown(Duration::from_millis(50)).await, 0);
    }
}
