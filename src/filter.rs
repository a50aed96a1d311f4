//! Instance filters: status and tag matchers compiled once from config.
//!
//! Every matcher is fully anchored: a filter value `run` never matches
//! `running`. Tag names are compared case-insensitively.

use regex::Regex;
use std::collections::BTreeMap;

use crate::config::{FilterConfig, OneOrMany};

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("empty list of alternatives for '{0}'")]
    EmptyAlternation(String),
}

/// A compiled, anchored matcher.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// A single pattern, compiled to `^(?:p)$`.
    Exact { pattern: String, regex: Regex },
    /// Several patterns, compiled to `^(?:p1|p2|...)$`.
    Alternation { patterns: Vec<String>, regex: Regex },
}

impl Matcher {
    pub fn exact(pattern: &str) -> Result<Self, FilterError> {
        let regex = anchored(pattern)?;
        Ok(Self::Exact {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn alternation(patterns: &[String]) -> Result<Self, FilterError> {
        let joined = patterns.join("|");
        // Validate each alternative on its own so the error names the culprit.
        for pattern in patterns {
            anchored(pattern)?;
        }
        let regex = anchored(&joined)?;
        Ok(Self::Alternation {
            patterns: patterns.to_vec(),
            regex,
        })
    }

    /// Build a matcher from a config value (one string or a list).
    pub fn from_config(value: &OneOrMany, what: &str) -> Result<Self, FilterError> {
        match value {
            OneOrMany::One(pattern) => Self::exact(pattern),
            OneOrMany::Many(patterns) if patterns.is_empty() => {
                Err(FilterError::EmptyAlternation(what.to_string()))
            }
            OneOrMany::Many(patterns) => Self::alternation(patterns),
        }
    }

    /// The configured patterns, before anchoring.
    pub fn patterns(&self) -> Vec<&str> {
        match self {
            Self::Exact { pattern, .. } => vec![pattern.as_str()],
            Self::Alternation { patterns, .. } => patterns.iter().map(String::as_str).collect(),
        }
    }

    pub fn is_match(&self, value: &str) -> bool {
        match self {
            Self::Exact { regex, .. } | Self::Alternation { regex, .. } => regex.is_match(value),
        }
    }
}

fn anchored(pattern: &str) -> Result<Regex, FilterError> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| FilterError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Compiled status and tag filters for one provider.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    /// `None` accepts any status.
    status: Option<Matcher>,
    /// Keyed by lower-cased tag name.
    tags: BTreeMap<String, Matcher>,
}

impl FilterSpec {
    pub fn compile(config: &FilterConfig) -> Result<Self, FilterError> {
        let status = config
            .status
            .as_ref()
            .map(|value| Matcher::from_config(value, "status"))
            .transpose()?;

        let mut tags = BTreeMap::new();
        for (name, value) in &config.tags {
            let lowered = name.to_lowercase();
            let matcher = Matcher::from_config(value, &lowered)?;
            tags.insert(lowered, matcher);
        }

        Ok(Self { status, tags })
    }

    pub fn status_matches(&self, status: &str) -> bool {
        self.status
            .as_ref()
            .map_or(true, |matcher| matcher.is_match(status))
    }

    /// Every configured tag must be present (case-insensitively), carry a
    /// value, and satisfy its matcher.
    pub fn tags_match(&self, tags: &BTreeMap<String, Option<String>>) -> bool {
        if self.tags.is_empty() {
            return true;
        }

        let lowered: BTreeMap<String, Option<&str>> = tags
            .iter()
            .map(|(name, value)| (name.to_lowercase(), value.as_deref()))
            .collect();

        self.tags.iter().all(|(name, matcher)| match lowered.get(name) {
            Some(Some(value)) => matcher.is_match(value),
            _ => false,
        })
    }

    /// Status patterns in effect; empty when any status is accepted.
    pub fn status_patterns(&self) -> Vec<&str> {
        self.status.as_ref().map(Matcher::patterns).unwrap_or_default()
    }

    pub fn tag_filter_count(&self) -> usize {
        self.tags.len()
    }
}
