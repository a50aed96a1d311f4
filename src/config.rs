//! Exporter configuration: YAML model and validation.
//!
//! The file maps a provider name to its access block and optional filters:
//!
//! ```yaml
//! aws:
//!   access:
//!     europe:
//!       key: AKIAXXXX
//!       secret: XXXX
//!       region: [eu-west-1, eu-central-1]
//!   filters:
//!     status: running
//!     tags:
//!       env: [prod, staging]
//! ```
//!
//! Validation expands every (zone, region) pair into a `PollerSpec` and
//! compiles the filters, so any mistake surfaces before a worker starts.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::filter::{FilterError, FilterSpec};

/// Default HTTP port for the scrape endpoint.
pub const DEFAULT_PORT: u16 = 9109;

/// Default config file name, looked up next to the executable.
pub const DEFAULT_CONFIG_FILE: &str = "config.yml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unable to load config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Unknown cloud type '{0}' in config file")]
    UnknownProvider(String),

    #[error("Invalid config for {0} config: no 'access' defined")]
    MissingAccess(String),

    #[error("Invalid config for {provider} zone '{zone}': no region defined")]
    NoRegions { provider: String, zone: String },

    #[error("Invalid filter for {provider}: {source}")]
    Filter {
        provider: String,
        #[source]
        source: FilterError,
    },

    #[error("Config file defines no zone/region to poll")]
    Empty,
}

// ── Raw YAML Types ──────────────────────────────────────────────────

/// A config value given either as one string or as a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// The whole file: provider name → provider block.
pub type ExporterConfig = BTreeMap<String, ProviderConfig>;

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub access: Option<BTreeMap<String, ZoneAccess>>,
    #[serde(default)]
    pub filters: Option<FilterConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default)]
    pub status: Option<OneOrMany>,
    #[serde(default)]
    pub tags: BTreeMap<String, OneOrMany>,
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZoneAccess {
    pub key: String,
    #[serde(alias = "pwd")]
    pub secret: String,
    #[serde(default)]
    pub region: Vec<String>,
}

impl std::fmt::Debug for ZoneAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneAccess")
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

// ── Validated Types ─────────────────────────────────────────────────

/// Supported cloud providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Aws,
}

impl ProviderKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aws" => Some(Self::Aws),
            _ => None,
        }
    }
}

/// Access key pair for one zone. The secret is wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Everything one poller worker needs to run.
#[derive(Debug, Clone)]
pub struct PollerSpec {
    pub provider: ProviderKind,
    pub zone: String,
    pub region: String,
    pub credentials: Credentials,
    pub filter: Arc<FilterSpec>,
}

/// Read and validate a config file.
pub fn load(path: &Path) -> Result<Vec<PollerSpec>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&content)
}

/// Parse and validate config file contents.
pub fn parse(content: &str) -> Result<Vec<PollerSpec>, ConfigError> {
    let config: ExporterConfig = serde_yaml::from_str(content)?;
    validate(&config)
}

/// Expand a parsed config into one `PollerSpec` per (zone, region) pair.
pub fn validate(config: &ExporterConfig) -> Result<Vec<PollerSpec>, ConfigError> {
    let mut specs = Vec::new();

    for (name, provider_config) in config {
        let access = provider_config
            .access
            .as_ref()
            .ok_or_else(|| ConfigError::MissingAccess(name.clone()))?;

        let provider =
            ProviderKind::from_name(name).ok_or_else(|| ConfigError::UnknownProvider(name.clone()))?;

        let filter_config = provider_config.filters.clone().unwrap_or_default();
        let filter = FilterSpec::compile(&filter_config).map_err(|source| ConfigError::Filter {
            provider: name.clone(),
            source,
        })?;
        let filter = Arc::new(filter);

        for (zone, zone_access) in access {
            if zone_access.region.is_empty() {
                return Err(ConfigError::NoRegions {
                    provider: name.clone(),
                    zone: zone.clone(),
                });
            }
            for region in &zone_access.region {
                specs.push(PollerSpec {
                    provider,
                    zone: zone.clone(),
                    region: region.clone(),
                    credentials: Credentials {
                        access_key: zone_access.key.clone(),
                        secret_key: zone_access.secret.clone(),
                    },
                    filter: Arc::clone(&filter),
                });
            }
        }
    }

    if specs.is_empty() {
        return Err(ConfigError::Empty);
    }

    Ok(specs)
}

/// Default config path: `config.yml` next to the executable, else `./config.yml`.
pub fn default_config_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_CONFIG_FILE)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}
