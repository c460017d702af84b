//! Sliding-window admission control.
//!
//! Every (policy scope, client identifier) pair owns an ordered deque of
//! accepted-request instants. A check purges instants older than the window,
//! then admits the request if fewer than `max_requests` remain. The deque is
//! mutated while its DashMap shard entry is held, so concurrent checks for
//! one identifier never race.
//!
//! State is process-local. Several gateway processes each enforce their own
//! window.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::{RateLimitConfig, WindowPolicy};

/// Scope shared by every endpoint without its own policy.
const DEFAULT_SCOPE: &str = "*";

/// A denied window admits only strictly after `oldest + window`.
const MIN_RESET_AFTER: Duration = Duration::from_nanos(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    scope: String,
    identifier: String,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the oldest recorded request leaves the window. Never zero
    /// on denial.
    pub reset_after: Duration,
    /// Set on denial; always the full window length.
    pub retry_after: Option<Duration>,
}

pub struct AdmissionController {
    enabled: bool,
    default_policy: WindowPolicy,
    overrides: HashMap<String, WindowPolicy>,
    windows: DashMap<WindowKey, VecDeque<Instant>>,
}

impl AdmissionController {
    /// `config.burst` is reserved and deliberately not read here.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            default_policy: config.default_policy(),
            overrides: config
                .endpoints
                .iter()
                .map(|(path, policy)| (path.clone(), *policy))
                .collect(),
            windows: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Policy scope and limits for a request path.
    pub fn policy_for(&self, endpoint: &str) -> (&str, WindowPolicy) {
        match self.overrides.get_key_value(endpoint) {
            Some((path, policy)) => (path.as_str(), *policy),
            None => (DEFAULT_SCOPE, self.default_policy),
        }
    }

    pub fn check(&self, endpoint: &str, identifier: &str) -> AdmissionDecision {
        self.check_at(endpoint, identifier, Instant::now())
    }

    pub fn check_at(&self, endpoint: &str, identifier: &str, now: Instant) -> AdmissionDecision {
        let (scope, policy) = self.policy_for(endpoint);
        let window = policy.window();
        let key = WindowKey {
            scope: scope.to_string(),
            identifier: identifier.to_string(),
        };

        let mut entry = self.windows.entry(key).or_default();
        let timestamps = entry.value_mut();
        purge(timestamps, window, now);

        let used = u32::try_from(timestamps.len()).unwrap_or(u32::MAX);
        let allowed = used < policy.max_requests;
        if allowed {
            timestamps.push_back(now);
        }

        let remaining = policy
            .max_requests
            .saturating_sub(used.saturating_add(u32::from(allowed)));
        let reset_after = timestamps
            .front()
            .and_then(|oldest| oldest.checked_add(window))
            .map(|reset_at| reset_at.saturating_duration_since(now))
            .unwrap_or(window);
        let reset_after = if allowed {
            reset_after
        } else {
            reset_after.max(MIN_RESET_AFTER)
        };

        AdmissionDecision {
            allowed,
            limit: policy.max_requests,
            remaining,
            reset_after,
            retry_after: (!allowed).then_some(window),
        }
    }

    /// Drop identifiers whose windows have emptied. Returns how many were dropped.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|key, timestamps| {
            let window = self
                .overrides
                .get(&key.scope)
                .copied()
                .unwrap_or(self.default_policy)
                .window();
            purge(timestamps, window, now);
            !timestamps.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Number of (scope, identifier) windows currently tracked.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

/// Remove instants strictly older than `now - window`.
fn purge(timestamps: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while let Some(oldest) = timestamps.front() {
        if now.saturating_duration_since(*oldest) > window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}
