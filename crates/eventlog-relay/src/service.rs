// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process control surface: start everything, stop everything.

use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bookmark::{BookmarkStore, JsonFileBookmarks};
use crate::config::{load_listeners, AgentConfig, ListenerConfig};
use crate::counters::{CountersSnapshot, ServiceCounters};
use crate::errors::ServiceError;
use crate::forwarder::{Forwarder, SeqForwarder, SeqForwarderConfig};
use crate::heartbeat::{Heartbeat, HeartbeatConfig};
use crate::listener::{ListenerContext, ListenerState, StartBoundary};
use crate::manager::ListenerManager;
use crate::source::{JournalSourceFactory, SourceFactory};

/// Status of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Listeners are being validated and started.
    Starting,
    /// Listeners and heartbeat are running.
    Running,
    /// Shutting down.
    Stopping,
    /// Everything has stopped and bookmarks were flushed.
    Stopped,
}

struct Components {
    cancel: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    manager: Arc<Mutex<ListenerManager>>,
    counters: Arc<ServiceCounters>,
    bookmarks: Arc<BookmarkStore>,
}

/// Handle to a started relay.
///
/// This handle allows checking the status and stopping the relay.
#[derive(Clone)]
pub struct ServiceHandle {
    status: Arc<RwLock<ServiceStatus>>,
    status_tx: broadcast::Sender<ServiceStatus>,
    components: Arc<Components>,
}

impl ServiceHandle {
    pub async fn status(&self) -> ServiceStatus {
        *self.status.read().await
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.status.read().await, ServiceStatus::Running)
    }

    /// Get a receiver for status updates.
    pub fn status_receiver(&self) -> broadcast::Receiver<ServiceStatus> {
        self.status_tx.subscribe()
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.components.counters.snapshot()
    }

    pub async fn listener_states(&self) -> Vec<(String, ListenerState)> {
        self.components.manager.lock().await.states()
    }

    /// Stops the heartbeat and every listener, then flushes bookmarks.
    /// Calling it again is a no-op.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        let mut status = self.status.write().await;
        if matches!(*status, ServiceStatus::Stopping | ServiceStatus::Stopped) {
            return Ok(());
        }
        *status = ServiceStatus::Stopping;
        drop(status);
        let _ = self.status_tx.send(ServiceStatus::Stopping);
        info!("Stopping event log relay");

        self.components.cancel.cancel();
        if let Some(heartbeat) = self.components.heartbeat.lock().await.take() {
            if let Err(e) = heartbeat.await {
                error!("Heartbeat task ended abnormally: {e}");
            }
        }

        let needs_bookmarks = {
            let mut manager = self.components.manager.lock().await;
            manager.stop_all().await;
            manager.needs_bookmarks()
        };
        if needs_bookmarks {
            let bookmarks = Arc::clone(&self.components.bookmarks);
            match tokio::task::spawn_blocking(move || bookmarks.flush()).await {
                Ok(Ok(())) => debug!("Final bookmark flush complete"),
                Ok(Err(e)) => error!("Failed to save bookmarks on shutdown: {e}"),
                Err(e) => error!("Bookmark flush task failed: {e}"),
            }
        }

        *self.status.write().await = ServiceStatus::Stopped;
        let _ = self.status_tx.send(ServiceStatus::Stopped);
        info!("Event log relay stopped");
        Ok(())
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle").finish_non_exhaustive()
    }
}

/// Wires listeners, sources, forwarder and heartbeat together.
pub struct RelayService {
    config: AgentConfig,
    listeners: Vec<ListenerConfig>,
    sources: Arc<dyn SourceFactory>,
    forwarder: Arc<dyn Forwarder>,
    bookmarks: Arc<BookmarkStore>,
}

impl RelayService {
    pub fn new(
        config: AgentConfig,
        listeners: Vec<ListenerConfig>,
        sources: Arc<dyn SourceFactory>,
        forwarder: Arc<dyn Forwarder>,
        bookmarks: Arc<BookmarkStore>,
    ) -> Self {
        Self {
            config,
            listeners,
            sources,
            forwarder,
            bookmarks,
        }
    }

    /// Journal sources, the raw events forwarder and the bookmark file, all
    /// as configured. Fails when the listener file cannot be read.
    pub fn from_config(config: AgentConfig) -> Result<Self, ServiceError> {
        let listeners = load_listeners(&config.listeners_path)?;
        let sources = Arc::new(JournalSourceFactory::new(&config.journal_dir));
        let forwarder = Arc::new(SeqForwarder::new(&SeqForwarderConfig {
            url: config.seq_url.clone(),
            api_key: config.api_key.clone(),
            timeout: config.forward_timeout,
            https_proxy: config.https_proxy.clone(),
        }));
        let bookmarks = Arc::new(BookmarkStore::open(Arc::new(JsonFileBookmarks::new(
            &config.bookmarks_path,
        ))));
        Ok(Self::new(config, listeners, sources, forwarder, bookmarks))
    }

    /// Validates and starts every listener, then the heartbeat. Only an
    /// invalid listener definition fails the start.
    pub async fn start(self) -> Result<ServiceHandle, ServiceError> {
        let (status_tx, _status_rx) = broadcast::channel(16);
        let status = Arc::new(RwLock::new(ServiceStatus::Starting));
        let _ = status_tx.send(ServiceStatus::Starting);

        let counters = Arc::new(ServiceCounters::new());
        let mut manager = ListenerManager::new(ListenerContext {
            counters: Arc::clone(&counters),
            bookmarks: Arc::clone(&self.bookmarks),
            forwarder: self.forwarder,
            sources: self.sources,
            boundary: StartBoundary::now(self.config.accept_at_start),
            dedup_ttl_secs: self.config.dedup_ttl_secs,
            default_tags: Arc::new(self.config.tags.clone()),
        });
        manager.load_all(self.listeners);
        manager.validate_all(&self.config.app_name)?;
        info!(
            "Starting {} listeners (interactive: {})",
            manager.len(),
            self.config.interactive
        );
        manager.start_all(self.config.interactive).await;
        let manager = Arc::new(Mutex::new(manager));

        let cancel = CancellationToken::new();
        let heartbeat = Heartbeat::new(
            HeartbeatConfig {
                interval_secs: self.config.heartbeat_interval_secs,
                stall_threshold: self.config.heartbeats_before_reset,
                interactive: self.config.interactive,
                count_all_counters: self.config.stall_counts_all,
            },
            Arc::clone(&manager),
            Arc::clone(&counters),
            Arc::clone(&self.bookmarks),
        );
        let heartbeat = tokio::spawn(heartbeat.run(cancel.clone()));

        *status.write().await = ServiceStatus::Running;
        let _ = status_tx.send(ServiceStatus::Running);

        Ok(ServiceHandle {
            status,
            status_tx,
            components: Arc::new(Components {
                cancel,
                heartbeat: Mutex::new(Some(heartbeat)),
                manager,
                counters,
                bookmarks: self.bookmarks,
            }),
        })
    }
}

impl std::fmt::Debug for RelayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayService")
            .field("config", &self.config)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Bookmark;
    use crate::errors::ConfigError;
    use crate::forwarder::MemoryForwarder;
    use crate::source::{MemorySource, MemorySourceFactory};
    use tempfile::tempdir;

    fn listener(source: &str, resume: bool) -> ListenerConfig {
        ListenerConfig {
            source: source.to_string(),
            resume_from_bookmark: resume,
            ..ListenerConfig::default()
        }
    }

    fn service(listeners: Vec<ListenerConfig>, bookmarks: Arc<BookmarkStore>) -> RelayService {
        let mut factory = MemorySourceFactory::new();
        factory.register("System", MemorySource::new("System"));
        RelayService::new(
            AgentConfig {
                heartbeat_interval_secs: 0,
                ..AgentConfig::default()
            },
            listeners,
            Arc::new(factory),
            Arc::new(MemoryForwarder::new()),
            bookmarks,
        )
    }

    #[tokio::test]
    async fn test_invalid_listener_fails_start() {
        let result = service(
            vec![listener("System", false), listener("", false)],
            Arc::new(BookmarkStore::in_memory()),
        )
        .start()
        .await;
        assert!(matches!(
            result,
            Err(ServiceError::Config(ConfigError::MissingSource(_)))
        ));
    }

    #[tokio::test]
    async fn test_start_and_stop_twice() {
        let handle = service(
            vec![listener("System", false)],
            Arc::new(BookmarkStore::in_memory()),
        )
        .start()
        .await
        .unwrap();
        assert!(handle.is_running().await);
        assert_eq!(
            handle.listener_states().await,
            vec![("System".to_string(), ListenerState::Running)]
        );

        let mut updates = handle.status_receiver();
        handle.stop().await.unwrap();
        assert_eq!(updates.recv().await.unwrap(), ServiceStatus::Stopping);
        assert_eq!(updates.recv().await.unwrap(), ServiceStatus::Stopped);
        assert_eq!(handle.status().await, ServiceStatus::Stopped);
        assert_eq!(
            handle.listener_states().await,
            vec![("System".to_string(), ListenerState::Stopped)]
        );

        handle.stop().await.unwrap();
        assert_eq!(handle.status().await, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_missing_source_keeps_service_running() {
        let handle = service(
            vec![listener("System", false), listener("Setup", false)],
            Arc::new(BookmarkStore::in_memory()),
        )
        .start()
        .await
        .unwrap();
        assert!(handle.is_running().await);
        assert_eq!(
            handle.listener_states().await[1],
            ("Setup".to_string(), ListenerState::Stopped)
        );
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_flushes_bookmarks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bookmarks.json");
        let bookmarks = Arc::new(BookmarkStore::open(Arc::new(JsonFileBookmarks::new(&path))));

        let handle = service(vec![listener("System", true)], Arc::clone(&bookmarks))
            .start()
            .await
            .unwrap();
        bookmarks.save("System", Bookmark::new("9"));
        handle.stop().await.unwrap();

        let reloaded = BookmarkStore::open(Arc::new(JsonFileBookmarks::new(&path)));
        assert_eq!(reloaded.load("System").map(|b| b.token), Some("9".to_string()));
    }

    #[test]
    fn test_from_config_requires_listener_file() {
        let config = AgentConfig {
            listeners_path: "/nonexistent/listeners.json".into(),
            ..AgentConfig::default()
        };
        assert!(matches!(
            RelayService::from_config(config),
            Err(ServiceError::Config(ConfigError::Read { .. }))
        ));
    }
}
