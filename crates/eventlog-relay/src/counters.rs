// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide processing counters.
//!
//! Listeners increment them from their consumer tasks while the heartbeat
//! reads and, on a day rollover, resets them. Increments take a shared gate so
//! a reset (exclusive gate) can never interleave with one and lose it.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    EventsProcessed,
    UnhandledEvents,
    OldEvents,
    EmptyEvents,
    LogonsDetected,
    NonInteractiveLogons,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub events_processed: u64,
    pub unhandled_events: u64,
    pub old_events: u64,
    pub empty_events: u64,
    pub logons_detected: u64,
    pub non_interactive_logons: u64,
}

impl CountersSnapshot {
    pub fn total(&self) -> u64 {
        self.events_processed
            + self.unhandled_events
            + self.old_events
            + self.empty_events
            + self.logons_detected
            + self.non_interactive_logons
    }
}

#[derive(Debug, Default)]
struct Cells {
    events_processed: AtomicU64,
    unhandled_events: AtomicU64,
    old_events: AtomicU64,
    empty_events: AtomicU64,
    logons_detected: AtomicU64,
    non_interactive_logons: AtomicU64,
}

impl Cells {
    fn cell(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::EventsProcessed => &self.events_processed,
            Counter::UnhandledEvents => &self.unhandled_events,
            Counter::OldEvents => &self.old_events,
            Counter::EmptyEvents => &self.empty_events,
            Counter::LogonsDetected => &self.logons_detected,
            Counter::NonInteractiveLogons => &self.non_interactive_logons,
        }
    }
}

#[derive(Debug, Default)]
pub struct ServiceCounters {
    gate: RwLock<Cells>,
}

impl ServiceCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, counter: Counter) {
        let cells = self
            .gate
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cells.cell(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        let cells = self
            .gate
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cells.cell(counter).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let cells = self
            .gate
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        CountersSnapshot {
            events_processed: cells.events_processed.load(Ordering::Relaxed),
            unhandled_events: cells.unhandled_events.load(Ordering::Relaxed),
            old_events: cells.old_events.load(Ordering::Relaxed),
            empty_events: cells.empty_events.load(Ordering::Relaxed),
            logons_detected: cells.logons_detected.load(Ordering::Relaxed),
            non_interactive_logons: cells.non_interactive_logons.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter while holding the exclusive gate.
    pub fn reset(&self) {
        let mut cells = self
            .gate
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *cells = Cells::default();
    }
}
