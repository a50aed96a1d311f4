//! Poller workers: one background task per (zone, region) pair.
//!
//! Each worker repeatedly fetches the full instance list, keeps the
//! instances that pass the compiled filters, and pushes one `Fact` per
//! survivor onto its private queue. A provider failure marks the worker
//! down and retries with exponential backoff; it never ends the task.
//!
//! Lifecycle: Created → Running → Canceling → Stopped. Cancellation is
//! observed before each fetch, between instances, during every sleep,
//! and races the in-flight fetch itself.

use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Credentials, PollerSpec};
use crate::filter::FilterSpec;
use crate::provider::{Connector, Instance, InstanceSource, ProviderError};

pub mod health;
pub mod queue;

pub use health::{HealthSnapshot, PollerHealth};
pub use queue::{fact_queue, Fact, FactConsumer, FactProducer, LabelSet};

// ── Settings ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PollerSettings {
    /// Pause between two complete fetch cycles.
    pub poll_interval: Duration,
    /// How long `stop()` waits for the task to finish.
    pub stop_timeout: Duration,
    /// First retry delay after a provider error.
    pub backoff_initial: Duration,
    /// Upper bound for the retry delay.
    pub backoff_max: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(3),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

// ── State ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PollerState {
    Created = 0,
    Running = 1,
    Canceling = 2,
    Stopped = 3,
}

impl PollerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Canceling,
            _ => Self::Stopped,
        }
    }
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: PollerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> PollerState {
        PollerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: PollerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: PollerState, to: PollerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("poller {zone}/{region} cannot start from state {state:?}")]
    AlreadyStarted {
        zone: String,
        region: String,
        state: PollerState,
    },
}

// ── Worker ──────────────────────────────────────────────────────────

pub struct PollerWorker {
    zone: String,
    region: String,
    credentials: Credentials,
    filter: Arc<FilterSpec>,
    connector: Arc<dyn Connector>,
    settings: PollerSettings,
    cancel: CancellationToken,
    state: Arc<StateCell>,
    health: Arc<PollerHealth>,
    /// Moved into the task on `start()`.
    producer: Mutex<Option<FactProducer>>,
    consumer: FactConsumer,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollerWorker {
    pub fn new(spec: PollerSpec, connector: Arc<dyn Connector>, settings: PollerSettings) -> Self {
        let (producer, consumer) = fact_queue();
        Self {
            zone: spec.zone.clone(),
            region: spec.region.clone(),
            credentials: spec.credentials.clone(),
            filter: Arc::clone(&spec.filter),
            connector,
            settings,
            cancel: CancellationToken::new(),
            state: Arc::new(StateCell::new(PollerState::Created)),
            health: Arc::new(PollerHealth::new()),
            producer: Mutex::new(Some(producer)),
            consumer,
            task: Mutex::new(None),
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn state(&self) -> PollerState {
        self.state.load()
    }

    pub fn health(&self) -> &PollerHealth {
        &self.health
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot(&self.zone, &self.region, self.state())
    }

    /// Spawn the background loop. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), PollerError> {
        if !self.state.transition(PollerState::Created, PollerState::Running) {
            return Err(PollerError::AlreadyStarted {
                zone: self.zone.clone(),
                region: self.region.clone(),
                state: self.state(),
            });
        }

        let producer = lock(&self.producer).take();
        let Some(producer) = producer else {
            // Only reachable if the Created transition happened twice.
            self.state.store(PollerState::Stopped);
            return Err(PollerError::AlreadyStarted {
                zone: self.zone.clone(),
                region: self.region.clone(),
                state: PollerState::Stopped,
            });
        };

        let poll_loop = PollLoop {
            zone: self.zone.clone(),
            region: self.region.clone(),
            credentials: self.credentials.clone(),
            filter: Arc::clone(&self.filter),
            connector: Arc::clone(&self.connector),
            settings: self.settings.clone(),
            cancel: self.cancel.clone(),
            health: Arc::clone(&self.health),
            producer,
        };
        let state = Arc::clone(&self.state);

        let handle = tokio::spawn(async move {
            poll_loop.run().await;
            state.store(PollerState::Stopped);
        });
        *lock(&self.task) = Some(handle);
        Ok(())
    }

    /// Signal cancellation without waiting.
    pub fn close(&self) {
        self.cancel.cancel();
        if !self.state.transition(PollerState::Running, PollerState::Canceling) {
            // Never started: nothing will run, so it is stopped right away.
            self.state.transition(PollerState::Created, PollerState::Stopped);
        }
    }

    /// Signal cancellation and wait up to the stop timeout. Returns whether
    /// the worker reached Stopped in time.
    pub async fn stop(&self) -> bool {
        self.close();

        let handle = lock(&self.task).take();
        let Some(handle) = handle else {
            return self.state() == PollerState::Stopped;
        };

        match tokio::time::timeout(self.settings.stop_timeout, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(zone = %self.zone, region = %self.region, "Poller task failed: {}", e);
                self.state.store(PollerState::Stopped);
                true
            }
            Err(_) => {
                warn!(
                    zone = %self.zone,
                    region = %self.region,
                    timeout_ms = self.settings.stop_timeout.as_millis() as u64,
                    "Poller did not stop in time — abandoning it"
                );
                false
            }
        }
    }

    /// Remove and return every queued fact without blocking.
    pub fn drain(&self) -> Vec<Fact> {
        self.consumer.drain_all()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Background Loop ─────────────────────────────────────────────────

struct PollLoop {
    zone: String,
    region: String,
    credentials: Credentials,
    filter: Arc<FilterSpec>,
    connector: Arc<dyn Connector>,
    settings: PollerSettings,
    cancel: CancellationToken,
    health: Arc<PollerHealth>,
    producer: FactProducer,
}

impl PollLoop {
    async fn run(self) {
        info!(
            zone = %self.zone,
            region = %self.region,
            status_filter = ?self.filter.status_patterns(),
            tag_filters = self.filter.tag_filter_count(),
            "📡 Poller starting"
        );

        let mut source: Option<Arc<dyn InstanceSource>> = None;
        let mut backoff = Backoff::new(self.settings.backoff_initial, self.settings.backoff_max);

        while !self.cancel.is_cancelled() {
            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.fetch(&mut source) => result,
            };

            match fetched {
                Ok(instances) => {
                    self.health.record_success();
                    backoff.reset();

                    let Some(emitted) = self.emit_facts(&instances) else {
                        break;
                    };
                    debug!(
                        zone = %self.zone,
                        region = %self.region,
                        instances = instances.len(),
                        matched = emitted,
                        "Poll cycle complete"
                    );

                    if !self.sleep(self.settings.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    // Reconnect on the next attempt.
                    source = None;
                    let failures = self.health.record_failure(&e);
                    let delay = backoff.next_delay();
                    warn!(
                        zone = %self.zone,
                        region = %self.region,
                        consecutive_failures = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Poll failed: {}",
                        e
                    );
                    if !self.sleep(delay).await {
                        break;
                    }
                }
            }
        }

        info!(zone = %self.zone, region = %self.region, "Poller stopped");
    }

    /// Establish or reuse the connection, then fetch the full listing.
    async fn fetch(
        &self,
        source: &mut Option<Arc<dyn InstanceSource>>,
    ) -> Result<Vec<Instance>, ProviderError> {
        let conn = match source {
            Some(conn) => Arc::clone(conn),
            None => {
                let conn = self.connector.connect(&self.region, &self.credentials)?;
                *source = Some(Arc::clone(&conn));
                conn
            }
        };
        conn.describe_instances().await
    }

    /// Filter instances in list order and enqueue one fact per survivor.
    /// Returns `None` when canceled part-way through.
    fn emit_facts(&self, instances: &[Instance]) -> Option<usize> {
        let mut emitted = 0;
        for instance in instances {
            if self.cancel.is_cancelled() {
                return None;
            }
            if !self.filter.status_matches(&instance.state) {
                continue;
            }
            if !self.filter.tags_match(&instance.tags) {
                continue;
            }
            self.producer
                .enqueue(Fact::single(build_labels(&self.zone, &self.region, instance)));
            emitted += 1;
        }
        Some(emitted)
    }

    /// Sleep unless canceled. Returns false if cancellation woke it.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Label set for one instance: zone, region, machine, ami, then every tag
/// with a value. Tags win over the built-in labels on a name clash.
pub fn build_labels(zone: &str, region: &str, instance: &Instance) -> LabelSet {
    let mut labels = LabelSet::new();
    labels.insert("zone".into(), zone.to_string());
    labels.insert("region".into(), region.to_string());
    if let Some(machine) = &instance.instance_type {
        labels.insert("machine".into(), machine.clone());
    }
    if let Some(ami) = &instance.image_id {
        labels.insert("ami".into(), ami.clone());
    }
    for (name, value) in &instance.tags {
        if let Some(value) = value {
            labels.insert(name.clone(), value.clone());
        }
    }
    labels
}

// ── Backoff ─────────────────────────────────────────────────────────

/// Exponential retry delay with up to 25% random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        let jitter_ms = (base.as_millis() / 4) as u64;
        if jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        (base + Duration::from_millis(jitter)).min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
