// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Sliding-window rate limiter keyed by an identifier string.
//!
//! Each key holds the timestamps of its recent hits. A decision prunes hits
//! older than the window, then counts, then records, all under the key's
//! shard lock so concurrent callers cannot both take the last slot.

use crate::time_utils::Clock;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Buckets beyond this count trigger a full sweep on the next decision.
const SWEEP_THRESHOLD: usize = 4096;

/// Outcome of a rate-limit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Hits left in the current window after this one
    pub remaining: usize,
}

#[derive(Debug)]
struct Bucket {
    hits: Vec<DateTime<Utc>>,
    window: Duration,
}

impl Bucket {
    fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.hits.retain(|t| now - *t < window);
    }
}

pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
        }
    }

    /// Count a hit against `key` if fewer than `max` hits landed in the last `window`.
    pub fn allow(&self, key: &str, window: Duration, max: usize) -> RateDecision {
        let now = self.clock.now();
        let decision = {
            let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
                hits: Vec::new(),
                window,
            });
            bucket.window = window;
            bucket.prune(now);

            if bucket.hits.len() >= max {
                RateDecision {
                    allowed: false,
                    remaining: 0,
                }
            } else {
                bucket.hits.push(now);
                RateDecision {
                    allowed: true,
                    remaining: max - bucket.hits.len(),
                }
            }
        };

        if self.buckets.len() > SWEEP_THRESHOLD {
            self.sweep();
        }
        decision
    }

    /// Whether a hit would be allowed, without recording one.
    pub fn check(&self, key: &str, window: Duration, max: usize) -> bool {
        let now = self.clock.now();
        self.buckets
            .get(key)
            .map(|b| b.hits.iter().filter(|t| now - **t < window).count() < max)
            .unwrap_or(true)
    }

    /// Drop expired hits everywhere and forget empty buckets. Returns buckets removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.prune(now);
            !bucket.hits.is_empty()
        });
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
