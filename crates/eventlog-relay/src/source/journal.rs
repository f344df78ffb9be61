// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append-only JSON-lines journal files.
//!
//! Each complete (newline-terminated) line holds one [`Entry`]. Its position
//! token is `<line>:<record id>`: the zero-based line index plus the id found
//! there, so a bookmark taken before the file was rotated or replaced no
//! longer resolves. Blank or unparsable lines are still delivered, as empty
//! records, so line numbering never drifts. A partially written last line is
//! left alone until its newline arrives.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{offset_index, Delivery, EventSource, SourceFactory, StartAt};
use crate::config::ListenerConfig;
use crate::constants::JOURNAL_POLL_INTERVAL;
use crate::entry::{Bookmark, Entry};
use crate::errors::SourceError;

#[derive(Debug, Clone)]
pub struct JournalSource {
    name: String,
    path: PathBuf,
    poll_interval: Duration,
}

impl JournalSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            poll_interval: JOURNAL_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<u8>, SourceError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SourceError::Unavailable(self.describe()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Line the subscription should start at, after checking the bookmark
    /// still names the same record.
    fn resolve_line(&self, bytes: &[u8], bookmark: &Bookmark) -> Result<u64, SourceError> {
        let position = Position::parse(bookmark)?;
        if !position.holds_in(bytes) {
            return Err(SourceError::Rejected(format!(
                "line {} of {} no longer holds record {}",
                position.line,
                self.describe(),
                position.record_id
            )));
        }
        Ok(position.line)
    }
}

/// Decoded `<line>:<record id>` token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Position {
    line: u64,
    record_id: u64,
}

impl Position {
    fn token(line: u64, record_id: u64) -> String {
        format!("{line}:{record_id}")
    }

    fn parse(bookmark: &Bookmark) -> Result<Self, SourceError> {
        let parsed = bookmark.token.trim().split_once(':').and_then(|(line, id)| {
            Some(Self {
                line: line.parse().ok()?,
                record_id: id.parse().ok()?,
            })
        });
        parsed.ok_or_else(|| {
            SourceError::Rejected(format!("unrecognized journal position '{}'", bookmark.token))
        })
    }

    fn holds_in(&self, bytes: &[u8]) -> bool {
        entry_at(bytes, self.line).is_some_and(|entry| entry.record_id == self.record_id)
    }
}

/// Complete lines of `bytes`, without their terminators.
fn complete_lines(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    let end = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    bytes[..end]
        .split(|b| *b == b'\n')
        .take(bytes[..end].iter().filter(|b| **b == b'\n').count())
}

/// Byte offset where line `index` starts; `index` may equal the line count.
fn line_start(bytes: &[u8], index: u64) -> Option<usize> {
    let mut offset = 0;
    let mut lines = 0u64;
    for line in complete_lines(bytes) {
        if lines == index {
            return Some(offset);
        }
        offset += line.len() + 1;
        lines += 1;
    }
    (lines == index).then_some(offset)
}

fn entry_at(bytes: &[u8], index: u64) -> Option<Entry> {
    let line = complete_lines(bytes).nth(usize::try_from(index).ok()?)?;
    parse_line(line, index)
}

fn parse_line(line: &[u8], index: u64) -> Option<Entry> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<Entry>(text) {
        Ok(mut entry) => {
            entry.position = Position::token(index, entry.record_id);
            Some(entry)
        }
        Err(e) => {
            debug!("Journal line {index} is not an entry: {e}");
            None
        }
    }
}

/// Last line the tail consumed, kept to recognize a replaced file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Anchor {
    start: u64,
    line: Vec<u8>,
}

impl Anchor {
    /// The line just before `line`, if any.
    fn before(bytes: &[u8], line: u64) -> Option<Self> {
        let previous = line.checked_sub(1)?;
        let start = line_start(bytes, previous)?;
        let text = complete_lines(bytes).nth(usize::try_from(previous).ok()?)?;
        Some(Self {
            start: start as u64,
            line: text.to_vec(),
        })
    }

    /// Length of the anchor line plus its newline when `buf`, read from
    /// `start`, still begins with it.
    fn matched_len(&self, buf: &[u8]) -> Option<usize> {
        (buf.starts_with(&self.line) && buf.get(self.line.len()) == Some(&b'\n'))
            .then_some(self.line.len() + 1)
    }
}

struct Tail {
    path: PathBuf,
    poll_interval: Duration,
    line: u64,
    offset: u64,
    /// `None` only while nothing has been consumed (`line == 0`).
    anchor: Option<Anchor>,
    failing: bool,
}

impl Tail {
    fn new(
        path: PathBuf,
        poll_interval: Duration,
        line: u64,
        offset: u64,
        anchor: Option<Anchor>,
    ) -> Self {
        Self {
            path,
            poll_interval,
            line,
            offset,
            anchor,
            failing: false,
        }
    }

    /// Reads whatever complete lines were appended since the last poll,
    /// starting over when the last consumed line is no longer in place.
    async fn poll(&mut self) -> std::io::Result<Vec<Option<Entry>>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let read_from = self.anchor.as_ref().map_or(self.offset, |anchor| anchor.start);
        file.seek(SeekFrom::Start(read_from)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let fresh_from = match self.anchor.as_ref().map(|anchor| anchor.matched_len(&buf)) {
            None => 0,
            Some(Some(len)) => len,
            Some(None) => {
                warn!(
                    "Journal {} was truncated or replaced after line {}, reading from the start",
                    self.path.display(),
                    self.line
                );
                self.line = 0;
                self.offset = 0;
                self.anchor = None;
                file.seek(SeekFrom::Start(0)).await?;
                buf.clear();
                file.read_to_end(&mut buf).await?;
                0
            }
        };

        let mut entries = Vec::new();
        for line in complete_lines(&buf[fresh_from..]) {
            entries.push(parse_line(line, self.line));
            self.anchor = Some(Anchor {
                start: self.offset,
                line: line.to_vec(),
            });
            self.line += 1;
            self.offset += line.len() as u64 + 1;
        }
        Ok(entries)
    }

    async fn run(mut self, delivery: Delivery, cancel: CancellationToken) {
        loop {
            match self.poll().await {
                Ok(entries) => {
                    if self.failing {
                        info!("Journal {} is readable again", self.path.display());
                        self.failing = false;
                    }
                    for entry in entries {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => return,
                            sent = delivery.send(entry) => if sent.is_err() { return },
                        }
                    }
                }
                Err(e) if self.failing => {
                    debug!("Journal {} still unreadable: {e}", self.path.display());
                }
                Err(e) => {
                    warn!("Failed to read journal {}: {e}", self.path.display());
                    self.failing = true;
                }
            }
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[async_trait]
impl EventSource for JournalSource {
    fn describe(&self) -> String {
        format!("journal:{} ({})", self.name, self.path.display())
    }

    async fn subscribe(
        &self,
        start: StartAt,
        delivery: Delivery,
        cancel: CancellationToken,
    ) -> Result<(), SourceError> {
        let bytes = self.read_all().await?;
        let line = match &start {
            StartAt::Now => complete_lines(&bytes).count() as u64,
            StartAt::At(bookmark) => self.resolve_line(&bytes, bookmark)?,
            StartAt::After(bookmark) => self.resolve_line(&bytes, bookmark)?.saturating_add(1),
        };
        let offset = line_start(&bytes, line).ok_or_else(|| {
            SourceError::Rejected(format!("line {line} is past the end of {}", self.describe()))
        })?;
        debug!("{}: subscribed at line {line}", self.describe());

        let tail = Tail::new(
            self.path.clone(),
            self.poll_interval,
            line,
            offset as u64,
            Anchor::before(&bytes, line),
        );
        tokio::spawn(tail.run(delivery, cancel));
        Ok(())
    }

    async fn read_first(&self) -> Result<Option<Entry>, SourceError> {
        let bytes = self.read_all().await?;
        let first = complete_lines(&bytes)
            .zip(0u64..)
            .find_map(|(line, index)| parse_line(line, index));
        Ok(first)
    }

    async fn read_at(
        &self,
        bookmark: &Bookmark,
        offset: i64,
    ) -> Result<Option<Entry>, SourceError> {
        let position = Position::parse(bookmark)?;
        let bytes = self.read_all().await?;
        if !position.holds_in(&bytes) {
            return Ok(None);
        }
        let entry = offset_index(position.line, offset).and_then(|index| entry_at(&bytes, index));
        Ok(entry)
    }
}

/// Maps a listener to `<dir>/[<remote>/]<source>.jsonl`.
#[derive(Debug, Clone)]
pub struct JournalSourceFactory {
    dir: PathBuf,
    poll_interval: Duration,
}

impl JournalSourceFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: JOURNAL_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn path_for(&self, config: &ListenerConfig) -> PathBuf {
        let mut path = self.dir.clone();
        if let Some(remote) = config.remote_host.as_deref().filter(|r| !r.is_empty()) {
            path.push(remote);
        }
        path.push(format!("{}.jsonl", config.source));
        path
    }
}

impl SourceFactory for JournalSourceFactory {
    fn open(&self, config: &ListenerConfig) -> Result<Arc<dyn EventSource>, SourceError> {
        if config.source.trim().is_empty() {
            return Err(SourceError::Unavailable(config.key()));
        }
        let source = JournalSource::new(config.key(), self.path_for(config))
            .with_poll_interval(self.poll_interval);
        Ok(Arc::new(source))
    }
}
