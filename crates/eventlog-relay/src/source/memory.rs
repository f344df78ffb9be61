// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory event source for dry runs and tests.
//!
//! Positions are absolute indices into everything ever appended, so a
//! truncated source keeps issuing fresh tokens and old bookmarks stop
//! resolving. Subscriptions can be rejected outright or stalled, which leaves
//! them open but silent.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{offset_index, parse_index, Delivery, EventSource, SourceFactory, StartAt};
use crate::config::ListenerConfig;
use crate::entry::{Bookmark, Entry};
use crate::errors::SourceError;

#[derive(Debug, Default)]
struct State {
    slots: Vec<Option<Entry>>,
    base: u64,
    reject: bool,
    subscriptions: u64,
    stalled_below: u64,
}

impl State {
    fn end(&self) -> u64 {
        self.base + self.slots.len() as u64
    }

    fn slot(&self, index: u64) -> Option<&Option<Entry>> {
        let relative = index.checked_sub(self.base)?;
        self.slots.get(usize::try_from(relative).ok()?)
    }
}

#[derive(Debug)]
struct Inner {
    name: String,
    state: Mutex<State>,
    changed: watch::Sender<u64>,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changed.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Everything past `cursor` for subscription `id`, advancing the cursor.
    fn pending(&self, id: u64, cursor: &mut u64) -> Vec<Option<Entry>> {
        let state = self.lock();
        if id < state.stalled_below {
            return Vec::new();
        }
        if *cursor < state.base {
            *cursor = state.base;
        }
        let from = usize::try_from(*cursor - state.base).unwrap_or(usize::MAX);
        let pending = state.slots.get(from..).map(<[_]>::to_vec).unwrap_or_default();
        *cursor = state.end().max(*cursor);
        pending
    }
}

#[derive(Debug, Clone)]
pub struct MemorySource {
    inner: Arc<Inner>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::default()),
                changed,
            }),
        }
    }

    /// Appends an entry, stamping it with its position token.
    pub fn append(&self, mut entry: Entry) -> String {
        let position = {
            let mut state = self.inner.lock();
            let position = state.end().to_string();
            entry.position.clone_from(&position);
            state.slots.push(Some(entry));
            position
        };
        self.inner.notify();
        position
    }

    /// Appends an empty record.
    pub fn push_empty(&self) {
        self.inner.lock().slots.push(None);
        self.inner.notify();
    }

    /// Drops every stored entry, as if the log had been cleared or rotated.
    pub fn truncate(&self) {
        let mut state = self.inner.lock();
        state.base = state.end();
        state.slots.clear();
    }

    pub fn reject_subscriptions(&self, reject: bool) {
        self.inner.lock().reject = reject;
    }

    /// Silences every subscription opened so far without closing it.
    pub fn stall_active_subscriptions(&self) {
        let mut state = self.inner.lock();
        state.stalled_below = state.subscriptions;
    }

    /// Number of subscriptions ever opened.
    pub fn subscription_count(&self) -> u64 {
        self.inner.lock().subscriptions
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSource for MemorySource {
    fn describe(&self) -> String {
        format!("memory:{}", self.inner.name)
    }

    async fn subscribe(
        &self,
        start: StartAt,
        delivery: Delivery,
        cancel: CancellationToken,
    ) -> Result<(), SourceError> {
        let (id, mut cursor) = {
            let mut state = self.inner.lock();
            if state.reject {
                return Err(SourceError::Rejected(format!(
                    "{} refused the subscription",
                    self.inner.name
                )));
            }
            let cursor = match &start {
                StartAt::Now => state.end(),
                StartAt::At(bookmark) => parse_index(bookmark)?,
                StartAt::After(bookmark) => parse_index(bookmark)?.saturating_add(1),
            };
            let id = state.subscriptions;
            state.subscriptions += 1;
            (id, cursor)
        };
        debug!("{}: subscription {id} opened at {cursor}", self.describe());

        let inner = Arc::clone(&self.inner);
        let mut changed = inner.changed.subscribe();
        tokio::spawn(async move {
            loop {
                for entry in inner.pending(id, &mut cursor) {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        sent = delivery.send(entry) => if sent.is_err() { return },
                    }
                }
                tokio::select! {
                    () = cancel.cancelled() => return,
                    result = changed.changed() => if result.is_err() { return },
                }
            }
        });
        Ok(())
    }

    async fn read_first(&self) -> Result<Option<Entry>, SourceError> {
        Ok(self.inner.lock().slots.iter().flatten().next().cloned())
    }

    async fn read_at(
        &self,
        bookmark: &Bookmark,
        offset: i64,
    ) -> Result<Option<Entry>, SourceError> {
        let Some(index) = offset_index(parse_index(bookmark)?, offset) else {
            return Ok(None);
        };
        Ok(self.inner.lock().slot(index).cloned().flatten())
    }
}

/// Serves pre-registered memory sources by listener key.
#[derive(Debug, Default)]
pub struct MemorySourceFactory {
    sources: HashMap<String, MemorySource>,
}

impl MemorySourceFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, source: MemorySource) {
        self.sources.insert(key.into(), source);
    }
}

impl SourceFactory for MemorySourceFactory {
    fn open(&self, config: &ListenerConfig) -> Result<Arc<dyn EventSource>, SourceError> {
        let key = config.key();
        self.sources
            .get(&key)
            .map(|source| Arc::new(source.clone()) as Arc<dyn EventSource>)
            .ok_or(SourceError::Unavailable(key))
    }
}
