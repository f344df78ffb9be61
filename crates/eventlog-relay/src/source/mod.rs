// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event sources a listener can subscribe to.
//!
//! A source pushes every entry it delivers onto the listener's channel
//! (`None` for an empty or unreadable record) from a task of its own, so a
//! slow consumer never blocks the source's reads. The subscription ends when
//! the cancellation token fires or the receiving side goes away.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::config::ListenerConfig;
use crate::entry::{Bookmark, Entry};
use crate::errors::SourceError;

pub mod journal;
pub mod memory;

pub use journal::{JournalSource, JournalSourceFactory};
pub use memory::{MemorySource, MemorySourceFactory};

/// Initial position of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartAt {
    /// Only entries appended after the subscription opens.
    Now,
    /// From the bookmarked entry itself, inclusive.
    At(Bookmark),
    /// Strictly after the bookmarked entry.
    After(Bookmark),
}

/// Channel end a source delivers into.
pub type Delivery = Sender<Option<Entry>>;

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Human-readable identity used in log lines.
    fn describe(&self) -> String;

    /// Opens a subscription and starts delivering in the background.
    async fn subscribe(
        &self,
        start: StartAt,
        delivery: Delivery,
        cancel: CancellationToken,
    ) -> Result<(), SourceError>;

    /// Oldest entry still available, if any.
    async fn read_first(&self) -> Result<Option<Entry>, SourceError>;

    /// Entry `offset` positions away from `bookmark`. `Ok(None)` means the
    /// position no longer resolves (rotated, truncated or past the end).
    async fn read_at(&self, bookmark: &Bookmark, offset: i64)
        -> Result<Option<Entry>, SourceError>;
}

/// Builds the source a listener config points at.
pub trait SourceFactory: Send + Sync {
    fn open(&self, config: &ListenerConfig) -> Result<Arc<dyn EventSource>, SourceError>;
}

/// Parses the bare index tokens issued by [`MemorySource`].
pub(crate) fn parse_index(bookmark: &Bookmark) -> Result<u64, SourceError> {
    bookmark
        .token
        .trim()
        .parse::<u64>()
        .map_err(|_| SourceError::Rejected(format!("unrecognized position '{}'", bookmark.token)))
}

/// Applies a signed offset to an index, `None` when it falls before the start.
pub(crate) fn offset_index(index: u64, offset: i64) -> Option<u64> {
    if offset >= 0 {
        index.checked_add(offset.unsigned_abs())
    } else {
        index.checked_sub(offset.unsigned_abs())
    }
}
