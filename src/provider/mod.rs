//! Cloud provider interface: the seam between pollers and the provider API.
//!
//! A `Connector` turns (region, credentials) into a live `InstanceSource`;
//! the source returns the complete instance list on every call. Pollers
//! never see the transport, and the provider never sees filters or queues.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{Credentials, ProviderKind};

pub mod ec2;
pub mod sigv4;

// ── Core Types ──────────────────────────────────────────────────────

/// One compute instance as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    /// Lifecycle state name, e.g. "running" or "stopped".
    pub state: String,
    pub instance_type: Option<String>,
    pub image_id: Option<String>,
    /// Tag name → value. A tag may exist without a value.
    pub tags: BTreeMap<String, Option<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Connection failed: {0}")]
    Connect(String),
}

// ── Provider Traits ─────────────────────────────────────────────────

/// A connected provider endpoint for one region.
#[async_trait]
pub trait InstanceSource: Send + Sync {
    /// Fetch the complete instance list, following pagination.
    async fn describe_instances(&self) -> Result<Vec<Instance>, ProviderError>;
}

/// Opens provider connections. Called again after a connection fails.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        region: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn InstanceSource>, ProviderError>;
}

/// Pick the connector for a configured provider.
pub fn connector_for(kind: ProviderKind) -> Arc<dyn Connector> {
    match kind {
        ProviderKind::Aws => Arc::new(ec2::Ec2Connector::new()),
    }
}
