//! Per-poller health record: written by the worker task, read at scrape time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::PollerState;

#[derive(Default)]
pub struct PollerHealth {
    up: AtomicBool,
    consecutive_failures: AtomicU64,
    total_failures: AtomicU64,
    polls: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl PollerHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.up.store(true, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.polls.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_success) = Some(Utc::now());
    }

    /// Returns the consecutive failure count including this one.
    pub fn record_failure(&self, error: &dyn std::fmt::Display) -> u64 {
        self.up.store(false, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        *lock(&self.last_error) = Some(error.to_string());
        consecutive
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, zone: &str, region: &str, state: PollerState) -> HealthSnapshot {
        HealthSnapshot {
            zone: zone.to_string(),
            region: region.to_string(),
            state,
            up: self.is_up(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_failures: self.total_failures(),
            polls: self.polls.load(Ordering::Relaxed),
            last_error: lock(&self.last_error).clone(),
            last_success: *lock(&self.last_success),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Point-in-time health of one poller, served by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub zone: String,
    pub region: String,
    pub state: PollerState,
    pub up: bool,
    pub consecutive_failures: u64,
    pub total_failures: u64,
    pub polls: u64,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_down() {
        let health = PollerHealth::new();
        assert!(!health.is_up());
        assert_eq!(health.total_failures(), 0);
    }

    #[test]
    fn test_failure_then_recovery() {
        let health = PollerHealth::new();
        assert_eq!(health.record_failure(&"timeout"), 1);
        assert_eq!(health.record_failure(&"timeout"), 2);
        assert!(!health.is_up());

        health.record_success();
        let snap = health.snapshot("europe", "eu-west-1", PollerState::Running);
        assert!(snap.up);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.total_failures, 2);
        assert_eq!(snap.polls, 1);
        assert_eq!(snap.last_error.as_deref(), Some("timeout"));
        assert!(snap.last_success.is_some());
    }
}
