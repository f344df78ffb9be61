// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::config::ListenerConfig;
use crate::errors::ConfigError;
use crate::listener::{Listener, ListenerContext, ListenerState};

/// Owns every listener of the process and fans control out to them.
#[derive(Debug)]
pub struct ListenerManager {
    context: ListenerContext,
    listeners: Vec<Listener>,
}

impl ListenerManager {
    #[must_use]
    pub fn new(context: ListenerContext) -> Self {
        Self {
            context,
            listeners: Vec::new(),
        }
    }

    /// Replaces the listener set, in configuration order.
    pub fn load_all(&mut self, configs: impl IntoIterator<Item = ListenerConfig>) {
        self.listeners = configs
            .into_iter()
            .map(|config| Listener::new(config, self.context.clone()))
            .collect();
        debug!("Loaded {} listeners", self.listeners.len());
    }

    /// Validates every listener, stopping at the first bad one.
    pub fn validate_all(&mut self, default_app_name: &str) -> Result<(), ConfigError> {
        let mut keys = HashSet::new();
        for listener in &mut self.listeners {
            listener.validate(default_app_name)?;
            let key = listener.key();
            if !keys.insert(key.clone()) {
                return Err(ConfigError::DuplicateListener(key));
            }
        }
        Ok(())
    }

    /// Starts every listener; returns how many are running afterwards.
    pub async fn start_all(&mut self, interactive: bool) -> usize {
        for listener in &mut self.listeners {
            // Failures are logged by the listener and retried on the next restart.
            let _ = listener.start(interactive).await;
        }
        let running = self.running();
        if running < self.listeners.len() {
            warn!(
                "{running} of {} listeners running, the rest stay stopped until the next restart",
                self.listeners.len()
            );
        } else {
            info!("All {running} listeners running");
        }
        running
    }

    pub async fn stop_all(&mut self) {
        for listener in &mut self.listeners {
            listener.stop().await;
        }
        debug!("All listeners stopped");
    }

    /// Whether any listener keeps a durable position.
    pub fn needs_bookmarks(&self) -> bool {
        self.listeners
            .iter()
            .any(|listener| listener.config().tracks_position())
    }

    pub fn watches_logons(&self) -> bool {
        self.listeners
            .iter()
            .any(|listener| listener.config().logon_watch)
    }

    pub fn running(&self) -> usize {
        self.listeners
            .iter()
            .filter(|listener| listener.state() == ListenerState::Running)
            .count()
    }

    pub fn states(&self) -> Vec<(String, ListenerState)> {
        self.listeners
            .iter()
            .map(|listener| (listener.key(), listener.state()))
            .collect()
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
