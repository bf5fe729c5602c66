//! Sliding-window request admission per client key.
//!
//! Each key holds the timestamps of its recently admitted requests. On
//! every check the window is pruned lazily, so there is no background
//! timer; memory for keys that go quiet is reclaimed as soon as their
//! window empties.
//!
//! A single mutex over the map is deliberate: admission must be atomic per
//! key (two concurrent checks for the same key must not both observe
//! `count < cap` and double-admit), and the critical section is a vector
//! retain plus a push — far too short for finer-grained locking to pay for
//! itself at this crate's request rates.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Sliding-window rate limiter.
///
/// `admit` returns `false` when the key has exhausted its budget for the
/// trailing window. A `false` is a terminal rejection: the limiter does
/// not queue, and the caller must not retry on the client's behalf.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Vec<Instant>>>,
    cap: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(cap: u32, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            cap,
            window,
        }
    }

    /// Admit or reject a request from `key`, recording it when admitted.
    pub fn admit(&self, key: &str) -> bool {
        self.admit_at(key, Instant::now())
    }

    // Separated so tests can replay arrival patterns deterministically.
    fn admit_at(&self, key: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        // Prune every window, not just this key's: keys that went quiet
        // are reclaimed the next time anyone checks.
        windows.retain(|_, v| {
            v.retain(|t| now.duration_since(*t) < self.window);
            !v.is_empty()
        });

        let entries = windows.entry(key.to_string()).or_default();
        let admitted = (entries.len() as u32) < self.cap;
        if admitted {
            entries.push(now);
        } else {
            warn!(client = key, "rate limit exceeded");
            if entries.is_empty() {
                windows.remove(key);
            }
        }
        admitted
    }

    /// Number of keys currently tracked (drained keys are dropped).
    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.windows.lock().unwrap().len()
    }
}
