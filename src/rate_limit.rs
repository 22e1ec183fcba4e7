use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

// beyond this many tracked clients, finished windows get dropped
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow { remaining: u32 },
    Deny { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

/// Counts requests per client. A single instance can keep this in memory,
/// several instances need a shared counter behind the same trait.
pub trait RateLimiter: Send + Sync {
    fn check(&self, client: &str, now: DateTime<Utc>) -> Decision;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

#[derive(Debug)]
pub struct FixedWindowLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl FixedWindowLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        FixedWindowLimiter {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&self, client: &str, now: DateTime<Utc>) -> Decision {
        let mut windows = match self.windows.lock() {
            Ok(w) => w,
            Err(poisoned) => {
                log::error!("rate limiter lock poisoned, resetting counters");
                let mut w = poisoned.into_inner();
                w.clear();
                w
            }
        };

        if windows.len() > PRUNE_THRESHOLD {
            let window = self.window;
            windows.retain(|_, w| now < w.started_at + window);
        }

        let entry = windows.entry(client.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });
        if now >= entry.started_at + self.window {
            *entry = Window {
                started_at: now,
                count: 0,
            };
        }

        if entry.count >= self.max_requests {
            let retry_after = entry.started_at + self.window - now;
            log::warn!("rate limiting {} for {}s", client, retry_after.num_seconds());
            return Decision::Deny { retry_after };
        }
        entry.count += 1;
        Decision::Allow {
            remaining: self.max_requests - entry.count,
        }
    }
}
