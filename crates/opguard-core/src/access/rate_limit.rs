//! Fixed-window rate limiting.

use dashmap::DashMap;

use crate::clock::SharedClock;
use crate::config::{RateLimitConfig, RateLimitRule};

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: u64,
    count: u32,
}

/// Fixed-window attempt counter keyed by `(subject, kind)`.
///
/// The subject is the actor id, or the network origin for anonymous
/// requests. Each bucket allows `max_attempts` per window; the window
/// restarts on the first attempt after it elapsed.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: SharedClock,
    windows: DashMap<(String, String), Window>,
}

impl RateLimiter {
    /// Create a limiter.
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            windows: DashMap::new(),
        }
    }

    /// Whether limiting is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Rule in effect for a kind.
    pub fn rule_for(&self, kind: &str) -> RateLimitRule {
        self.config.rule_for(kind)
    }

    /// Record an attempt. Returns `false` when the bucket is exhausted.
    pub fn try_acquire(&self, subject: &str, kind: &str) -> bool {
        if !self.config.enabled {
            return true;
        }
        let rule = self.config.rule_for(kind);
        let window_micros = rule.window_ms.saturating_mul(1_000);
        let now = self.clock.now_micros();

        let mut entry = self
            .windows
            .entry((subject.to_string(), kind.to_string()))
            .or_insert(Window {
                started_at: now,
                count: 0,
            });

        if now.saturating_sub(entry.started_at) >= window_micros {
            entry.started_at = now;
            entry.count = 0;
        }
        if entry.count >= rule.max_attempts {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Attempts left in the current window.
    pub fn remaining(&self, subject: &str, kind: &str) -> u32 {
        let rule = self.config.rule_for(kind);
        let now = self.clock.now_micros();
        match self.windows.get(&(subject.to_string(), kind.to_string())) {
            Some(w) if now.saturating_sub(w.started_at) < rule.window_ms.saturating_mul(1_000) => {
                rule.max_attempts.saturating_sub(w.count)
            }
            _ => rule.max_attempts,
        }
    }

    /// Clear every bucket of a subject.
    pub fn reset(&self, subject: &str) {
        self.windows.retain(|(s, _), _| s != subject);
    }

    /// Drop windows that have elapsed. Returns the number removed.
    pub fn prune(&self) -> usize {
        let now = self.clock.now_micros();
        let before = self.windows.len();
        self.windows.retain(|(_, kind), w| {
            let window = self.config.rule_for(kind).window_ms.saturating_mul(1_000);
            now.saturating_sub(w.started_at) < window
        });
        before - self.windows.len()
    }

    /// Number of tracked buckets.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn limiter(max_attempts: u32) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = RateLimitConfig {
            window_ms: 1_000,
            max_attempts,
            ..RateLimitConfig::default()
        };
        (RateLimiter::new(config, clock.clone()), clock)
    }

    #[test]
    fn test_window_exhaustion_and_reset() {
        let (limiter, clock) = limiter(3);
        for _ in 0..3 {
            assert!(limiter.try_acquire("alice", "login"));
        }
        assert!(!limiter.try_acquire("alice", "login"));
        assert_eq!(limiter.remaining("alice", "login"), 0);

        clock.advance(Duration::from_millis(1_000));
        assert!(limiter.try_acquire("alice", "login"));
        assert_eq!(limiter.remaining("alice", "login"), 2);
    }

    #[test]
    fn test_buckets_are_independent() {
        let (limiter, _) = limiter(1);
        assert!(limiter.try_acquire("alice", "login"));
        assert!(limiter.try_acquire("alice", "search"));
        assert!(limiter.try_acquire("bob", "login"));
        assert!(!limiter.try_acquire("alice", "login"));
    }

    #[test]
    fn test_per_kind_override() {
        let clock = Arc::new(ManualClock::new(0));
        let config = RateLimitConfig::default().with_kind("user.login", 60_000, 1);
        let limiter = RateLimiter::new(config, clock);
        assert!(limiter.try_acquire("alice", "user.login"));
        assert!(!limiter.try_acquire("alice", "user.login"));
        assert!(limiter.try_acquire("alice", "content.view"));
    }

    #[test]
    fn test_disabled_never_limits() {
        let clock = Arc::new(ManualClock::new(0));
        let config = RateLimitConfig {
            max_attempts: 1,
            ..RateLimitConfig::disabled()
        };
        let limiter = RateLimiter::new(config, clock);
        for _ in 0..10 {
            assert!(limiter.try_acquire("alice", "login"));
        }
    }

    #[test]
    fn test_prune_and_reset() {
        let (limiter, clock) = limiter(5);
        limiter.try_acquire("alice", "a");
        limiter.try_acquire("bob", "a");
        assert_eq!(limiter.tracked(), 2);

        limiter.reset("alice");
        assert_eq!(limiter.tracked(), 1);

        clock.advance(Duration::from_secs(2));
        assert_eq!(limiter.prune(), 1);
        assert_eq!(limiter.tracked(), 0);
    }
}
