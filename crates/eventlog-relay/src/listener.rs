// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A listener owns one subscription and turns accepted entries into records.
//!
//! ```text
//!   Stopped ──start──► Starting ──subscribed──► Running ──stop──► Stopping ──► Stopped
//!                          │
//!                          └──── source error ────► Stopped
//! ```
//!
//! The source delivers into a bounded channel; a single consumer task per
//! listener drains it, so entries of one listener are processed in delivery
//! order while the source itself never waits on the forwarder. A failed start
//! is not retried here: the heartbeat restarts the whole listener set.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::bookmark::BookmarkStore;
use crate::config::ListenerConfig;
use crate::constants::{DELIVERY_CHANNEL_CAPACITY, EMPTY_GUID, STOP_TIMEOUT};
use crate::counters::{Counter, ServiceCounters};
use crate::dedup::DedupCache;
use crate::entry::{Entry, Level, Record, TagValue};
use crate::errors::{ConfigError, EntryProcessingError, SourceError};
use crate::filter::EventFilter;
use crate::forwarder::Forwarder;
use crate::source::{EventSource, SourceFactory, StartAt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerState::Stopped => write!(f, "stopped"),
            ListenerState::Starting => write!(f, "starting"),
            ListenerState::Running => write!(f, "running"),
            ListenerState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Entries stamped before this instant predate the process and are treated
/// as backlog by listeners that do not track their position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartBoundary {
    at: DateTime<Utc>,
    accept_equal: bool,
}

impl StartBoundary {
    #[must_use]
    pub fn new(at: DateTime<Utc>, accept_equal: bool) -> Self {
        Self { at, accept_equal }
    }

    #[must_use]
    pub fn now(accept_equal: bool) -> Self {
        Self::new(Utc::now(), accept_equal)
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    pub fn is_before(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp < self.at || (!self.accept_equal && timestamp == self.at)
    }
}

/// Collaborators shared by every listener of a process.
#[derive(Clone)]
pub struct ListenerContext {
    pub counters: Arc<ServiceCounters>,
    pub bookmarks: Arc<BookmarkStore>,
    pub forwarder: Arc<dyn Forwarder>,
    pub sources: Arc<dyn SourceFactory>,
    pub boundary: StartBoundary,
    pub dedup_ttl_secs: i64,
    /// Attached to every record unless the listener sets the same key.
    pub default_tags: Arc<BTreeMap<String, TagValue>>,
}

impl fmt::Debug for ListenerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerContext")
            .field("boundary", &self.boundary)
            .field("dedup_ttl_secs", &self.dedup_ttl_secs)
            .finish_non_exhaustive()
    }
}

pub struct Listener {
    config: ListenerConfig,
    context: ListenerContext,
    /// Survives restarts so a resubscription cannot replay what was just sent.
    dedup: Arc<DedupCache>,
    validated: bool,
    state: ListenerState,
    cancel: Option<CancellationToken>,
    consumer: Option<JoinHandle<()>>,
}

impl Listener {
    #[must_use]
    pub fn new(config: ListenerConfig, context: ListenerContext) -> Self {
        let dedup = Arc::new(DedupCache::new(context.dedup_ttl_secs));
        Self {
            config,
            context,
            dedup,
            validated: false,
            state: ListenerState::Stopped,
            cancel: None,
            consumer: None,
        }
    }

    pub fn key(&self) -> String {
        self.config.key()
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Ids currently held by this listener's dedup window.
    pub fn dedup_count(&self) -> usize {
        self.dedup.count()
    }

    pub fn validate(&mut self, default_app_name: &str) -> Result<(), ConfigError> {
        self.config.validate(default_app_name)?;
        self.validated = true;
        Ok(())
    }

    /// Opens the subscription. Failures are logged and leave the listener
    /// stopped.
    pub async fn start(&mut self, interactive: bool) -> Result<(), SourceError> {
        if self.state != ListenerState::Stopped {
            debug!(listener = %self.key(), "Start requested while {}", self.state);
            return Ok(());
        }
        self.state = ListenerState::Starting;

        match self.subscribe(interactive).await {
            Ok((cancel, consumer)) => {
                self.cancel = Some(cancel);
                self.consumer = Some(consumer);
                self.state = ListenerState::Running;
                info!(
                    listener = %self.key(),
                    source = %self.config.source,
                    remote = %self.config.remote_or_local(),
                    "[{}] Started {} listener",
                    self.config.app_name(),
                    self.config.listener_type()
                );
                Ok(())
            }
            Err(e) => {
                self.state = ListenerState::Stopped;
                error!(
                    listener = %self.key(),
                    source = %self.config.source,
                    remote = %self.config.remote_or_local(),
                    "[{}] Failed to start {} listener: {e}",
                    self.config.app_name(),
                    self.config.listener_type()
                );
                Err(e)
            }
        }
    }

    async fn subscribe(
        &self,
        interactive: bool,
    ) -> Result<(CancellationToken, JoinHandle<()>), SourceError> {
        if !self.validated {
            return Err(SourceError::Rejected(format!(
                "listener {} has not been validated",
                self.key()
            )));
        }
        let source = self.context.sources.open(&self.config)?;
        let start = self.resolve_start(source.as_ref(), interactive).await?;

        let (delivery, entries) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        source.subscribe(start, delivery, cancel.child_token()).await?;

        let processor = Processor {
            key: self.key(),
            config: self.config.clone(),
            filter: EventFilter::new(
                self.config.levels.clone(),
                self.config.event_ids.clone(),
                self.config.providers.clone(),
            ),
            dedup: Arc::clone(&self.dedup),
            counters: Arc::clone(&self.context.counters),
            bookmarks: Arc::clone(&self.context.bookmarks),
            forwarder: Arc::clone(&self.context.forwarder),
            boundary: self.context.boundary,
            default_tags: Arc::clone(&self.context.default_tags),
        };
        let consumer = tokio::spawn(consume(processor, entries, cancel.clone()));
        Ok((cancel, consumer))
    }

    /// Bookmark first, then replay from the oldest entry, otherwise now.
    async fn resolve_start(
        &self,
        source: &dyn EventSource,
        interactive: bool,
    ) -> Result<StartAt, SourceError> {
        let key = self.key();
        let describe = source.describe();

        if self.config.tracks_position() {
            if let Some(bookmark) = self.context.bookmarks.load(&key) {
                match source.read_at(&bookmark, 0).await {
                    Ok(Some(_)) => {
                        announce(
                            interactive,
                            &key,
                            &format!("Resuming {describe} after position {}", bookmark.token),
                        );
                        return Ok(StartAt::After(bookmark));
                    }
                    Ok(None) => warn!(
                        listener = %key,
                        remote = %self.config.remote_or_local(),
                        "Bookmark {} no longer resolves in {describe}, processing new events",
                        bookmark.token
                    ),
                    Err(e) => warn!(
                        listener = %key,
                        remote = %self.config.remote_or_local(),
                        "Cannot check bookmark {} in {describe}: {e}, processing new events",
                        bookmark.token
                    ),
                }
                return Ok(StartAt::Now);
            }
        }

        if self.config.replay_from_start {
            if let Some(first) = source.read_first().await? {
                announce(
                    interactive,
                    &key,
                    &format!("Replaying {describe} from position {}", first.position),
                );
                return Ok(StartAt::At(first.bookmark()));
            }
            announce(
                interactive,
                &key,
                &format!("No entries in {describe} yet, processing new events"),
            );
            return Ok(StartAt::Now);
        }

        announce(
            interactive,
            &key,
            &format!("Processing new events from {describe}"),
        );
        Ok(StartAt::Now)
    }

    /// Cancels the subscription and waits, bounded, for in-flight work.
    pub async fn stop(&mut self) {
        if self.state != ListenerState::Running {
            return;
        }
        self.state = ListenerState::Stopping;

        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(mut consumer) = self.consumer.take() {
            match tokio::time::timeout(STOP_TIMEOUT, &mut consumer).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(listener = %self.key(), "Consumer task ended abnormally: {e}"),
                Err(_) => {
                    warn!(
                        listener = %self.key(),
                        "Listener did not stop within {STOP_TIMEOUT:?}, abandoning in-flight entry"
                    );
                    consumer.abort();
                }
            }
        }

        self.state = ListenerState::Stopped;
        debug!(
            listener = %self.key(),
            remote = %self.config.remote_or_local(),
            "[{}] Stopped {} listener",
            self.config.app_name(),
            self.config.listener_type()
        );
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("key", &self.key())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn announce(interactive: bool, key: &str, message: &str) {
    if interactive {
        info!(listener = %key, "{message}");
    } else {
        debug!(listener = %key, "{message}");
    }
}

async fn consume(
    processor: Processor,
    mut entries: Receiver<Option<Entry>>,
    cancel: CancellationToken,
) {
    loop {
        let delivered = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            delivered = entries.recv() => match delivered {
                Some(delivered) => delivered,
                None => break,
            },
        };
        processor.handle(delivered).await;
    }
    trace!(listener = %processor.key, "Consumer finished");
}

/// Per-entry pipeline owned by the consumer task.
struct Processor {
    key: String,
    config: ListenerConfig,
    filter: EventFilter,
    dedup: Arc<DedupCache>,
    counters: Arc<ServiceCounters>,
    bookmarks: Arc<BookmarkStore>,
    forwarder: Arc<dyn Forwarder>,
    boundary: StartBoundary,
    default_tags: Arc<BTreeMap<String, TagValue>>,
}

impl Processor {
    async fn handle(&self, delivered: Option<Entry>) {
        let Some(entry) = delivered else {
            self.counters.increment(Counter::EmptyEvents);
            return;
        };

        if !self.config.tracks_position() && self.boundary.is_before(entry.timestamp) {
            self.counters.increment(Counter::OldEvents);
            return;
        }

        if !self.filter.matches(&entry) {
            self.counters.increment(Counter::UnhandledEvents);
            return;
        }

        if self.dedup.seen(entry.record_id) {
            trace!(listener = %self.key, "Skipping duplicate record {}", entry.record_id);
            return;
        }

        if self.config.tracks_position() {
            if entry.position.is_empty() {
                self.report(&EntryProcessingError::Malformed {
                    record_id: entry.record_id,
                    reason: "entry carries no position".to_string(),
                });
            } else {
                self.bookmarks.save(&self.key, entry.bookmark());
            }
        }

        if self.config.logon_watch {
            if !is_interactive_logon(&entry, self.config.guid_is_empty) {
                self.counters.increment(Counter::NonInteractiveLogons);
                return;
            }
            self.counters.increment(Counter::LogonsDetected);
        }

        let record = self.build_record(&entry);
        match self.forwarder.send(&record).await {
            Ok(()) => self.counters.increment(Counter::EventsProcessed),
            Err(source) => self.report(&EntryProcessingError::Forward {
                record_id: entry.record_id,
                source,
            }),
        }
    }

    fn report(&self, error: &EntryProcessingError) {
        error!(
            listener = %self.key,
            source = %self.config.source,
            remote = %self.config.remote_or_local(),
            "[{}] {error}",
            self.config.app_name()
        );
    }

    fn build_record(&self, entry: &Entry) -> Record {
        let level = Level::map(entry.level, entry.keywords);
        let mut record = Record {
            timestamp: entry.timestamp,
            level,
            summary: entry.summary().to_string(),
            message_template: self.config.message_template().to_string(),
            tags: BTreeMap::new(),
        };

        record.tag_if_absent("LogAppName", self.config.app_name());
        record.tag_if_absent("LogName", self.config.source.as_str());
        if let Some(remote) = self.config.remote() {
            record.tag_if_absent("RemoteServer", remote);
        }
        record.tag_if_absent("ListenerType", self.config.listener_type().to_string());
        record.tag_if_absent("Provider", entry.provider.as_str());
        record.tag_if_absent("EventId", i64::from(entry.event_id));
        record.tag_if_absent(
            "RecordId",
            i64::try_from(entry.record_id)
                .map_or_else(|_| TagValue::from(entry.record_id.to_string()), TagValue::from),
        );
        record.tag_if_absent(
            "EventLevel",
            entry
                .level
                .map_or_else(|| level.to_string(), |native| native.to_string()),
        );
        if let Some(native) = entry.level {
            record.tag_if_absent("EventLevelId", i64::from(native.code()));
        }
        record.tag_if_absent("EventTime", entry.timestamp.to_rfc3339());
        record.tag_if_absent("EventDescription", entry.description.as_str());
        record.tag_if_absent("EventSummary", record.summary.clone());
        if let Some(keywords) = entry.keywords {
            let names = keywords.names();
            if !names.is_empty() {
                record.tag_if_absent("KeywordNames", names.join(", "));
            }
        }

        for (key, value) in self.config.tags.iter().chain(self.default_tags.iter()) {
            record.tag_if_absent(key.as_str(), value.clone());
        }
        for (key, value) in &entry.payload {
            record.tag_if_absent(key.as_str(), value.as_str());
        }
        record
    }
}

/// Interactive or remote-interactive logon with a real source address.
fn is_interactive_logon(entry: &Entry, guid_is_empty: bool) -> bool {
    let logon_type = entry
        .payload
        .get("EventData_LogonType")
        .and_then(|value| value.trim().parse::<u32>().ok());
    let audit_success = entry.keywords.is_some_and(|k| k.audit_success);
    let has_address = entry
        .payload
        .get("EventData_IpAddress")
        .is_some_and(|ip| !ip.trim().is_empty() && ip.trim() != "-");
    let empty_guid = entry
        .payload
        .get("EventData_LogonGuid")
        .is_some_and(|guid| guid.trim() == EMPTY_GUID);

    matches!(logon_type, Some(2 | 10)) && audit_success && has_address && empty_guid == guid_is_empty
}
