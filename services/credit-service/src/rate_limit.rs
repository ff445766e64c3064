//! Fixed-window request limiter keyed by `operation:client`.
//!
//! Single-process and best effort: counters live in memory, are lost on
//! restart and are not shared between instances. Good enough to throttle
//! abuse of purchase / verify / unlock; billing correctness lives in the
//! ledger, not here.

use dashmap::DashMap;
use log::debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Limit for one operation: `limit` calls per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitRule {
    pub const fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: Instant,
}

impl RateLimitDecision {
    /// Time left in the current window.
    pub fn reset_after(&self) -> Duration {
        self.reset_at.saturating_duration_since(Instant::now())
    }

    /// Whole seconds a rejected caller should wait, at least 1.
    pub fn retry_after_secs(&self) -> u64 {
        let wait = self.reset_after();
        let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        secs.max(1)
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

pub struct RateLimiter {
    windows: Arc<DashMap<String, Window>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Limiter without background cleanup.
    pub fn new() -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Limiter whose expired windows are dropped every `sweep_interval`.
    /// Must be called inside a tokio runtime.
    pub fn start(sweep_interval: Duration) -> Self {
        let limiter = Self::new();
        let windows = Arc::clone(&limiter.windows);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = sweep_expired(&windows, Instant::now());
                if removed > 0 {
                    debug!("[rate-limit] dropped {removed} expired windows");
                }
            }
        });
        if let Ok(mut slot) = limiter.sweeper.lock() {
            *slot = Some(handle);
        }
        limiter
    }

    pub fn check(
        &self,
        operation: &str,
        client: &str,
        limit: u32,
        window: Duration,
    ) -> RateLimitDecision {
        let now = Instant::now();
        let key = format!("{operation}:{client}");

        if limit == 0 {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: now + window,
            };
        }

        let mut entry = self.windows.entry(key).or_insert(Window {
            count: 0,
            reset_at: now + window,
        });

        if now > entry.reset_at {
            entry.count = 1;
            entry.reset_at = now + window;
            return RateLimitDecision {
                allowed: true,
                remaining: limit - 1,
                reset_at: entry.reset_at,
            };
        }

        if entry.count >= limit {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: entry.reset_at,
            };
        }

        entry.count += 1;
        RateLimitDecision {
            allowed: true,
            remaining: limit - entry.count,
            reset_at: entry.reset_at,
        }
    }

    pub fn check_rule(&self, operation: &str, client: &str, rule: RateLimitRule) -> RateLimitDecision {
        self.check(operation, client, rule.limit, rule.window)
    }

    /// Forget the window for one `operation:client`.
    pub fn reset(&self, operation: &str, client: &str) {
        self.windows.remove(&format!("{operation}:{client}"));
    }

    pub fn purge_expired(&self) -> usize {
        sweep_expired(&self.windows, Instant::now())
    }

    /// Number of tracked windows.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sweep_expired(windows: &DashMap<String, Window>, now: Instant) -> usize {
    let before = windows.len();
    windows.retain(|_, window| now <= window.reset_at);
    before.saturating_sub(windows.len())
}
