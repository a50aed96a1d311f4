//! Test doubles for the provider seam, shared by poller and collector tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Credentials, FilterConfig, PollerSpec, ProviderKind};
use crate::filter::FilterSpec;
use crate::poller::{Fact, PollerWorker};
use crate::provider::{Connector, Instance, InstanceSource, ProviderError};

pub fn instance(state: &str, machine: &str, ami: &str, tags: &[(&str, &str)]) -> Instance {
    Instance {
        id: format!("i-{}", machine),
        state: state.to_string(),
        instance_type: Some(machine.to_string()),
        image_id: Some(ami.to_string()),
        tags: tags
            .iter()
            .map(|(k, v)| (k.to_string(), Some(v.to_string())))
            .collect(),
    }
}

pub fn spec_for(zone: &str, region: &str, filter: FilterConfig) -> PollerSpec {
    PollerSpec {
        provider: ProviderKind::Aws,
        zone: zone.to_string(),
        region: region.to_string(),
        credentials: Credentials {
            access_key: "AKIDTEST".into(),
            secret_key: "test-secret".into(),
        },
        filter: Arc::new(FilterSpec::compile(&filter).unwrap()),
    }
}

pub fn spec_with_filter(filter: FilterConfig) -> PollerSpec {
    spec_for("europe", "eu-west-1", filter)
}

/// Drain until at least `min` facts arrived, or panic after 3 seconds.
pub async fn wait_for_facts(worker: &PollerWorker, min: usize) -> Vec<Fact> {
    let mut facts = Vec::new();
    for _ in 0..300 {
        facts.extend(worker.drain());
        if facts.len() >= min {
            return facts;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected at least {} facts, got {}", min, facts.len());
}

// ── Sources ─────────────────────────────────────────────────────────

/// Returns the same listing on every call.
pub struct StaticSource {
    instances: Vec<Instance>,
}

impl StaticSource {
    pub fn new(instances: Vec<Instance>) -> Arc<Self> {
        Arc::new(Self { instances })
    }
}

#[async_trait]
impl InstanceSource for StaticSource {
    async fn describe_instances(&self) -> Result<Vec<Instance>, ProviderError> {
        Ok(self.instances.clone())
    }
}

/// Fails the first `failures` calls, then behaves like `StaticSource`.
pub struct FlakySource {
    failures_left: AtomicUsize,
    instances: Vec<Instance>,
}

impl FlakySource {
    pub fn new(failures: usize, instances: Vec<Instance>) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(failures),
            instances,
        })
    }
}

#[async_trait]
impl InstanceSource for FlakySource {
    async fn describe_instances(&self) -> Result<Vec<Instance>, ProviderError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(ProviderError::Api {
                status: 503,
                code: "Unavailable".into(),
                message: "simulated outage".into(),
            });
        }
        Ok(self.instances.clone())
    }
}

/// Never answers.
pub struct HangingSource;

#[async_trait]
impl InstanceSource for HangingSource {
    async fn describe_instances(&self) -> Result<Vec<Instance>, ProviderError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(vec![])
    }
}

// ── Connector ───────────────────────────────────────────────────────

pub struct FakeConnector {
    source: Option<Arc<dyn InstanceSource>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(source: Arc<dyn InstanceSource>) -> Arc<Self> {
        Arc::new(Self {
            source: Some(source),
            connects: AtomicUsize::new(0),
        })
    }

    /// A connector whose every `connect` fails.
    pub fn refusing() -> Arc<Self> {
        Arc::new(Self {
            source: None,
            connects: AtomicUsize::new(0),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        region: &str,
        _credentials: &Credentials,
    ) -> Result<Arc<dyn InstanceSource>, ProviderError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.source
            .clone()
            .ok_or_else(|| ProviderError::Connect(format!("refused for {}", region)))
    }
}
