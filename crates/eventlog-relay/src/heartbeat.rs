// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic watchdog over the listener set.
//!
//! Every tick compares the aggregate counters with the previous tick. When
//! nothing moved for more than `stall_threshold` consecutive ticks every
//! listener is stopped and started again, which is the only way a silently
//! dead subscription recovers. Ticks also reset the counters on a local day
//! rollover and flush bookmarks when any listener keeps them.
//!
//! The schedule has two phases: a short one-shot delay after start
//! ([`Phase::Initial`]), then the fixed interval ([`Phase::Steady`]).

use chrono::{DateTime, Local, NaiveDate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bookmark::BookmarkStore;
use crate::constants::{
    DEFAULT_HEARTBEAT_INTERVAL_SECS, FIRST_HEARTBEAT_MAX, FIRST_HEARTBEAT_MIN,
    INTERACTIVE_FIRST_HEARTBEAT, INTERACTIVE_HEARTBEAT_INTERVAL, MAX_HEARTBEAT_INTERVAL_SECS,
    RESTART_PAUSE,
};
use crate::counters::{CountersSnapshot, ServiceCounters};
use crate::manager::ListenerManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Seconds between ticks; 0 disables the heartbeat.
    pub interval_secs: u64,
    /// Stalled ticks tolerated before a restart; 0 disables restarts.
    pub stall_threshold: u32,
    pub interactive: bool,
    /// Watch every counter for progress instead of processed events only.
    pub count_all_counters: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            stall_threshold: 0,
            interactive: false,
            count_all_counters: true,
        }
    }
}

impl HeartbeatConfig {
    /// Interval between steady ticks, `None` when disabled.
    pub fn steady_interval(&self) -> Option<Duration> {
        if self.interval_secs == 0 {
            return None;
        }
        if self.interactive {
            return Some(INTERACTIVE_HEARTBEAT_INTERVAL);
        }
        if self.interval_secs > MAX_HEARTBEAT_INTERVAL_SECS {
            return Some(Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS));
        }
        Some(Duration::from_secs(self.interval_secs))
    }

    /// Delay before the first tick, randomized so fleets do not tick together.
    pub fn first_delay(&self) -> Duration {
        if self.interactive {
            return INTERACTIVE_FIRST_HEARTBEAT;
        }
        let min = u64::try_from(FIRST_HEARTBEAT_MIN.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(FIRST_HEARTBEAT_MAX.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(fastrand::u64(min..=max))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initial,
    Steady,
}

/// What a single tick observed and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    pub delta: u64,
    pub stall_count: u32,
    pub restarted: bool,
    pub rolled_over: bool,
    pub flushed: bool,
}

pub struct Heartbeat {
    config: HeartbeatConfig,
    manager: Arc<Mutex<ListenerManager>>,
    counters: Arc<ServiceCounters>,
    bookmarks: Arc<BookmarkStore>,
    last: CountersSnapshot,
    stall_count: u32,
    last_date: NaiveDate,
    phase: Phase,
}

impl Heartbeat {
    pub fn new(
        config: HeartbeatConfig,
        manager: Arc<Mutex<ListenerManager>>,
        counters: Arc<ServiceCounters>,
        bookmarks: Arc<BookmarkStore>,
    ) -> Self {
        Self {
            config,
            manager,
            counters,
            bookmarks,
            last: CountersSnapshot::default(),
            stall_count: 0,
            last_date: Local::now().date_naive(),
            phase: Phase::Initial,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stall_count(&self) -> u32 {
        self.stall_count
    }

    /// Ticks until cancelled. Returns at once when the heartbeat is disabled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let Some(steady) = self.config.steady_interval() else {
            info!("Heartbeat disabled");
            return;
        };
        let mut delay = self.config.first_delay();
        debug!("First heartbeat in {delay:?}, then every {steady:?}");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            self.tick(Local::now()).await;
            self.phase = Phase::Steady;
            delay = steady;
        }
        debug!("Heartbeat stopped");
    }

    pub async fn tick(&mut self, now: DateTime<Local>) -> TickOutcome {
        let today = now.date_naive();
        let rolled_over = today != self.last_date;
        if rolled_over {
            self.counters.reset();
            self.last = CountersSnapshot::default();
            self.last_date = today;
            info!("New day {today}, counters reset");
        }

        let current = self.counters.snapshot();
        let delta = if self.config.count_all_counters {
            current.total().saturating_sub(self.last.total())
        } else {
            current
                .events_processed
                .saturating_sub(self.last.events_processed)
        };
        self.last = current;

        if self.config.stall_threshold > 0 && delta == 0 {
            self.stall_count += 1;
        } else {
            self.stall_count = 0;
        }

        let restarted =
            self.config.stall_threshold > 0 && self.stall_count > self.config.stall_threshold;
        if restarted {
            warn!(
                "No events processed for {} heartbeats, restarting all listeners",
                self.stall_count
            );
            self.restart().await;
            self.stall_count = 0;
        }

        let (needs_bookmarks, watches_logons, running, listeners) = {
            let manager = self.manager.lock().await;
            (
                manager.needs_bookmarks(),
                manager.watches_logons(),
                manager.running(),
                manager.len(),
            )
        };
        let flushed = needs_bookmarks && self.flush().await;

        self.summarize(&current, running, listeners, watches_logons);
        TickOutcome {
            delta,
            stall_count: self.stall_count,
            restarted,
            rolled_over,
            flushed,
        }
    }

    async fn restart(&self) {
        let mut manager = self.manager.lock().await;
        manager.stop_all().await;
        tokio::time::sleep(RESTART_PAUSE).await;
        manager.start_all(self.config.interactive).await;
    }

    async fn flush(&self) -> bool {
        let bookmarks = Arc::clone(&self.bookmarks);
        match tokio::task::spawn_blocking(move || bookmarks.flush()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Failed to save bookmarks, will retry on the next heartbeat: {e}");
                false
            }
            Err(e) => {
                error!("Bookmark flush task failed: {e}");
                false
            }
        }
    }

    fn summarize(
        &self,
        current: &CountersSnapshot,
        running: usize,
        listeners: usize,
        watches_logons: bool,
    ) {
        let next = self
            .config
            .steady_interval()
            .map_or_else(|| "never".to_string(), |interval| format!("{interval:?}"));
        let phase = match self.phase {
            Phase::Initial => "first heartbeat",
            Phase::Steady => "heartbeat",
        };
        if watches_logons {
            info!(
                "Service {phase}: {running}/{listeners} listeners running, {} events processed, \
                 {} unhandled, {} old, {} empty, {} logons detected, {} non-interactive logons; \
                 next heartbeat in {next}",
                current.events_processed,
                current.unhandled_events,
                current.old_events,
                current.empty_events,
                current.logons_detected,
                current.non_interactive_logons
            );
        } else {
            info!(
                "Service {phase}: {running}/{listeners} listeners running, {} events processed, \
                 {} unhandled, {} old, {} empty; next heartbeat in {next}",
                current.events_processed,
                current.unhandled_events,
                current.old_events,
                current.empty_events
            );
        }
    }
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("config", &self.config)
            .field("stall_count", &self.stall_count)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}
