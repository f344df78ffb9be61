// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable per-listener bookmarks.
//!
//! Listeners record the position of every entry they accept into the
//! in-memory map; the heartbeat (and the final shutdown step) writes the full
//! map out through a [`BookmarkPersistence`]. A failed write leaves the map
//! untouched so the next flush retries with the newest positions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

use crate::entry::Bookmark;
use crate::errors::PersistenceError;

/// Storage behind the bookmark set, keyed by listener.
pub trait BookmarkPersistence: Send + Sync {
    fn read(&self) -> Result<BTreeMap<String, Bookmark>, PersistenceError>;
    fn write(&self, bookmarks: &BTreeMap<String, Bookmark>) -> Result<(), PersistenceError>;
}

/// Bookmarks kept as a pretty-printed JSON object on disk.
#[derive(Debug, Clone)]
pub struct JsonFileBookmarks {
    path: PathBuf,
}

impl JsonFileBookmarks {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl BookmarkPersistence for JsonFileBookmarks {
    fn read(&self) -> Result<BTreeMap<String, Bookmark>, PersistenceError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn write(&self, bookmarks: &BTreeMap<String, Bookmark>) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec_pretty(bookmarks)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        // Write beside the target and rename so a crash never leaves half a file.
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }
}

pub struct BookmarkStore {
    bookmarks: Mutex<BTreeMap<String, Bookmark>>,
    persistence: Option<Arc<dyn BookmarkPersistence>>,
}

impl BookmarkStore {
    /// A store that never touches disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            bookmarks: Mutex::new(BTreeMap::new()),
            persistence: None,
        }
    }

    /// Loads previously persisted bookmarks. An unreadable store is logged and
    /// treated as empty; the next flush overwrites it.
    pub fn open(persistence: Arc<dyn BookmarkPersistence>) -> Self {
        let bookmarks = match persistence.read() {
            Ok(bookmarks) => {
                debug!("Loaded {} bookmarks", bookmarks.len());
                bookmarks
            }
            Err(e) => {
                error!("Failed to load bookmarks, starting without them: {e}");
                BTreeMap::new()
            }
        };
        Self {
            bookmarks: Mutex::new(bookmarks),
            persistence: Some(persistence),
        }
    }

    pub fn load(&self, listener: &str) -> Option<Bookmark> {
        self.lock().get(listener).cloned()
    }

    pub fn save(&self, listener: &str, bookmark: Bookmark) {
        self.lock().insert(listener.to_string(), bookmark);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Writes the whole set. Blocks on file I/O; keep it off entry delivery.
    pub fn flush(&self) -> Result<(), PersistenceError> {
        let Some(persistence) = self.persistence.as_ref() else {
            return Ok(());
        };
        let snapshot = self.lock().clone();
        persistence.write(&snapshot)?;
        debug!("Flushed {} bookmarks", snapshot.len());
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Bookmark>> {
        self.bookmarks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for BookmarkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookmarkStore")
            .field("bookmarks", &self.len())
            .field("persistent", &self.persistence.is_some())
            .finish()
    }
}
