// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-windowed set of recently seen record ids.
//!
//! Sources may hand the same entry over more than once (a fresh subscription
//! replaying its backlog, or retries on the source side). The cache remembers
//! every accepted id for a sliding window: each hit refreshes the entry, and an
//! id left alone for longer than the window is forgotten.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::constants::{DEDUP_SWEEP_INTERVAL, DEFAULT_DEDUP_TTL_SECS};

#[derive(Debug)]
struct Inner {
    seen: HashMap<u64, Instant>,
    last_sweep: Instant,
}

/// Sliding-TTL dedup cache shared by all entries of one listener.
#[derive(Debug)]
pub struct DedupCache {
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl DedupCache {
    /// Negative TTLs fall back to the default window.
    #[must_use]
    pub fn new(ttl_secs: i64) -> Self {
        let ttl_secs = if ttl_secs < 0 {
            DEFAULT_DEDUP_TTL_SECS
        } else {
            ttl_secs
        };
        Self {
            ttl: Duration::from_secs(ttl_secs.unsigned_abs()),
            inner: Mutex::new(Inner {
                seen: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Atomic check-and-insert.
    ///
    /// Returns `true` (and refreshes the window) when `id` is still live,
    /// otherwise records it and returns `false`.
    pub fn seen(&self, id: u64) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();

        if now.duration_since(inner.last_sweep) >= DEDUP_SWEEP_INTERVAL {
            Self::sweep_locked(&mut inner, now, self.ttl);
        }

        if let Some(last) = inner.seen.get_mut(&id) {
            if now.duration_since(*last) < self.ttl {
                *last = now;
                return true;
            }
        }
        inner.seen.insert(id, now);
        false
    }

    /// Number of live ids.
    pub fn count(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        Self::sweep_locked(&mut inner, now, self.ttl);
        inner.seen.len()
    }

    fn sweep_locked(inner: &mut Inner, now: Instant, ttl: Duration) {
        let before = inner.seen.len();
        inner.seen.retain(|_, last| now.duration_since(*last) < ttl);
        inner.last_sweep = now;
        let evicted = before - inner.seen.len();
        if evicted > 0 {
            trace!("Dedup cache evicted {evicted} expired ids");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // The map holds plain data, so a poisoned lock is still consistent.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap as ModelMap;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_first_sighting_is_not_a_duplicate() {
        let cache = DedupCache::new(60);
        assert!(!cache.seen(1));
        assert!(cache.seen(1));
        assert!(!cache.seen(2));
        assert_eq!(cache.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_id_expires_after_ttl_without_refresh() {
        let cache = DedupCache::new(10);
        assert!(!cache.seen(7));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!cache.seen(7));
        assert!(cache.seen(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_slides_the_window() {
        let cache = DedupCache::new(10);
        assert!(!cache.seen(7));
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(cache.seen(7));
        tokio::time::advance(Duration::from_secs(8)).await;
        // 16s after insert, but only 8s after the last refresh
        assert!(cache.seen(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_ids_are_swept_from_count() {
        let cache = DedupCache::new(5);
        for id in 0..10 {
            cache.seen(id);
        }
        assert_eq!(cache.count(), 10);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn test_negative_ttl_uses_default() {
        let cache = DedupCache::new(-1);
        assert_eq!(cache.ttl(), Duration::from_secs(600));
        assert_eq!(DedupCache::default().ttl(), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_concurrent_check_and_insert_admits_once() {
        let cache = Arc::new(DedupCache::new(60));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.seen(99) }));
        }
        let mut fresh = 0;
        for handle in handles {
            if !handle.await.expect("task panicked") {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Seen(u64),
        AdvanceMillis(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u64..4).prop_map(Op::Seen),
            1 => (0u64..15_000).prop_map(Op::AdvanceMillis),
        ]
    }

    /// Expected `seen` answers for a 10 s sliding window.
    fn model(ops: &[Op]) -> Vec<bool> {
        let ttl = 10_000;
        let mut now = 0u64;
        let mut last_touch: ModelMap<u64, u64> = ModelMap::new();
        let mut answers = Vec::new();
        for op in ops {
            match op {
                Op::AdvanceMillis(ms) => now += ms,
                Op::Seen(id) => {
                    let live = last_touch.get(id).is_some_and(|last| now - last < ttl);
                    last_touch.insert(*id, now);
                    answers.push(live);
                }
            }
        }
        answers
    }

    proptest! {
        #[test]
        fn prop_seen_matches_sliding_window_model(
            ops in proptest::collection::vec(op_strategy(), 1..60),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let answers = runtime.block_on(async {
                let cache = DedupCache::new(10);
                let mut answers = Vec::new();
                for op in &ops {
                    match op {
                        Op::AdvanceMillis(ms) => {
                            tokio::time::advance(Duration::from_millis(*ms)).await;
                        }
                        Op::Seen(id) => answers.push(cache.seen(*id)),
                    }
                }
                answers
            });
            prop_assert_eq!(answers, model(&ops));
        }
    }
}
