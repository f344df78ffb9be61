// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::entry::{Entry, NativeLevel};

/// Allow-list predicate over level, event id and provider.
///
/// An empty list places no restriction on its dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    levels: Vec<NativeLevel>,
    event_ids: Vec<u32>,
    providers: Vec<String>,
}

impl EventFilter {
    #[must_use]
    pub fn new(levels: Vec<NativeLevel>, event_ids: Vec<u32>, providers: Vec<String>) -> Self {
        Self {
            levels,
            event_ids,
            providers,
        }
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        // An entry without a level cannot be judged on that dimension.
        let level_ok = match entry.level {
            Some(level) => self.levels.is_empty() || self.levels.contains(&level),
            None => true,
        };
        level_ok
            && (self.event_ids.is_empty() || self.event_ids.contains(&entry.event_id))
            && (self.providers.is_empty() || self.providers.contains(&entry.provider))
    }
}
