// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    DEFAULT_APP_NAME, DEFAULT_DEDUP_TTL_SECS, DEFAULT_FORWARD_TIMEOUT_SECS,
    DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_JOURNAL_DIR, DEFAULT_LISTENERS_FILE,
    DEFAULT_MESSAGE_TEMPLATE, DEFAULT_SEQ_URL, LOGON_EVENT_ID, LOGON_MESSAGE_TEMPLATE,
    LOGON_SOURCE,
};
use crate::entry::{NativeLevel, TagValue};
use crate::errors::ConfigError;

/// Whether a listener reads the local machine or a remote one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerType {
    Local,
    Remote,
}

impl fmt::Display for ListenerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerType::Local => write!(f, "Local"),
            ListenerType::Remote => write!(f, "Remote"),
        }
    }
}

/// One monitored source. Accepts camelCase keys as well as the PascalCase
/// names used by older listener files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenerConfig {
    /// Bookmark key; defaults to `source@remote` or `source`.
    #[serde(alias = "Id")]
    pub id: Option<String>,
    #[serde(alias = "LogName", alias = "logName")]
    pub source: String,
    #[serde(alias = "MachineName", alias = "machineName", alias = "remoteServer")]
    pub remote_host: Option<String>,
    #[serde(alias = "LogAppName", alias = "logAppName")]
    pub app_name: Option<String>,
    #[serde(alias = "MessageTemplate")]
    pub message_template: Option<String>,
    #[serde(alias = "LogLevels", alias = "logLevels")]
    pub levels: Vec<NativeLevel>,
    #[serde(alias = "EventIds")]
    pub event_ids: Vec<u32>,
    #[serde(alias = "Sources", alias = "sources")]
    pub providers: Vec<String>,
    #[serde(alias = "StoreLastEntry", alias = "storeLastEntry")]
    pub resume_from_bookmark: bool,
    #[serde(alias = "ProcessRetroactiveEntries", alias = "processRetroactiveEntries")]
    pub replay_from_start: bool,
    pub tags: BTreeMap<String, TagValue>,
    /// Watch interactive logons on the security log instead of `source`.
    #[serde(alias = "WindowsLogins", alias = "windowsLogins")]
    pub logon_watch: bool,
    #[serde(alias = "GuidIsEmpty")]
    pub guid_is_empty: bool,
}

impl ListenerConfig {
    pub fn key(&self) -> String {
        if let Some(id) = self.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        match self.remote() {
            Some(remote) => format!("{}@{remote}", self.source),
            None => self.source.clone(),
        }
    }

    /// Remote qualifier, if any.
    pub fn remote(&self) -> Option<&str> {
        self.remote_host
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }

    /// Remote qualifier for log lines.
    pub fn remote_or_local(&self) -> &str {
        self.remote().unwrap_or("localhost")
    }

    pub fn listener_type(&self) -> ListenerType {
        if self.remote().is_some() {
            ListenerType::Remote
        } else {
            ListenerType::Local
        }
    }

    /// Whether accepted entries move this listener's bookmark.
    pub fn tracks_position(&self) -> bool {
        self.resume_from_bookmark || self.replay_from_start
    }

    pub fn app_name(&self) -> &str {
        self.app_name.as_deref().unwrap_or(DEFAULT_APP_NAME)
    }

    pub fn message_template(&self) -> &str {
        self.message_template
            .as_deref()
            .unwrap_or(DEFAULT_MESSAGE_TEMPLATE)
    }

    /// Applies logon-watch overrides and defaults, then checks the source.
    pub fn validate(&mut self, default_app_name: &str) -> Result<(), ConfigError> {
        if self.logon_watch {
            self.source = LOGON_SOURCE.to_string();
            self.event_ids = vec![LOGON_EVENT_ID];
            self.levels.clear();
            self.providers.clear();
            if self.message_template.is_none() {
                self.message_template = Some(LOGON_MESSAGE_TEMPLATE.to_string());
            }
        }

        if self.source.trim().is_empty() {
            let name = self
                .id
                .clone()
                .or_else(|| self.app_name.clone())
                .unwrap_or_else(|| "<unnamed>".to_string());
            return Err(ConfigError::MissingSource(name));
        }

        if self.app_name.as_deref().is_none_or(|a| a.trim().is_empty()) {
            self.app_name = Some(default_app_name.to_string());
        }
        if self
            .message_template
            .as_deref()
            .is_none_or(|t| t.trim().is_empty())
        {
            self.message_template = Some(DEFAULT_MESSAGE_TEMPLATE.to_string());
        }
        Ok(())
    }
}

/// Reads the ordered listener list from a JSON array file.
pub fn load_listeners(path: &Path) -> Result<Vec<ListenerConfig>, ConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Default app name for listeners that do not set one
    pub app_name: String,
    /// Ingestion endpoint base URL
    pub seq_url: String,
    pub api_key: Option<String>,
    pub listeners_path: PathBuf,
    pub bookmarks_path: PathBuf,
    /// Directory holding journal sources
    pub journal_dir: PathBuf,
    /// Heartbeat interval in seconds, 0 disables
    pub heartbeat_interval_secs: u64,
    /// Consecutive stalled heartbeats tolerated before a restart, 0 disables
    pub heartbeats_before_reset: u32,
    /// Whether stall detection watches every counter or only processed events
    pub stall_counts_all: bool,
    pub dedup_ttl_secs: i64,
    /// Accept entries stamped exactly at process start
    pub accept_at_start: bool,
    pub forward_timeout: Duration,
    pub https_proxy: Option<String>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    pub interactive: bool,
    /// Default tags attached to every record, e.g. `ProjectKey:OPS,Priority:P2`
    pub tags: BTreeMap<String, TagValue>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let listeners_path = PathBuf::from(DEFAULT_LISTENERS_FILE);
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            seq_url: DEFAULT_SEQ_URL.to_string(),
            api_key: None,
            bookmarks_path: default_bookmarks_path(&listeners_path),
            listeners_path,
            journal_dir: PathBuf::from(DEFAULT_JOURNAL_DIR),
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            heartbeats_before_reset: 0,
            stall_counts_all: true,
            dedup_ttl_secs: DEFAULT_DEDUP_TTL_SECS,
            accept_at_start: true,
            forward_timeout: Duration::from_secs(DEFAULT_FORWARD_TIMEOUT_SECS),
            https_proxy: None,
            log_level: "info".to_string(),
            interactive: false,
            tags: BTreeMap::new(),
        }
    }
}

fn default_bookmarks_path(listeners_path: &Path) -> PathBuf {
    let mut path = listeners_path.as_os_str().to_owned();
    path.push(".bookmarks.json");
    PathBuf::from(path)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|val| match val.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => default,
        })
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|val| val.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Parses `key:value` pairs separated by commas. Pairs without a key are
/// skipped; the value may itself contain colons.
pub fn parse_tags(raw: &str) -> BTreeMap<String, TagValue> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once(':').unwrap_or((pair, ""));
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), TagValue::from(value.trim())))
        })
        .collect()
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let listeners_path = env::var("EVENTLOG_LISTENERS")
            .map(PathBuf::from)
            .unwrap_or(defaults.listeners_path);
        let bookmarks_path = env::var("EVENTLOG_BOOKMARKS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_bookmarks_path(&listeners_path));

        let config = Self {
            app_name: env::var("EVENTLOG_APP_NAME")
                .ok()
                .filter(|val| !val.trim().is_empty())
                .unwrap_or(defaults.app_name),
            seq_url: env::var("EVENTLOG_SEQ_URL").unwrap_or(defaults.seq_url),
            api_key: env::var("EVENTLOG_SEQ_API_KEY")
                .ok()
                .filter(|val| !val.is_empty()),
            listeners_path,
            bookmarks_path,
            journal_dir: env::var("EVENTLOG_JOURNAL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.journal_dir),
            heartbeat_interval_secs: env_parse(
                "EVENTLOG_HEARTBEAT_INTERVAL",
                defaults.heartbeat_interval_secs,
            ),
            heartbeats_before_reset: env_parse(
                "EVENTLOG_HEARTBEATS_BEFORE_RESET",
                defaults.heartbeats_before_reset,
            ),
            stall_counts_all: env_bool("EVENTLOG_STALL_COUNTS_ALL", defaults.stall_counts_all),
            dedup_ttl_secs: env_parse("EVENTLOG_DEDUP_TTL", defaults.dedup_ttl_secs),
            accept_at_start: env_bool("EVENTLOG_ACCEPT_AT_START", defaults.accept_at_start),
            forward_timeout: Duration::from_secs(env_parse(
                "EVENTLOG_FORWARD_TIMEOUT",
                DEFAULT_FORWARD_TIMEOUT_SECS,
            )),
            https_proxy: env::var("EVENTLOG_PROXY_HTTPS")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok(),
            log_level: env::var("EVENTLOG_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
            interactive: env_bool("EVENTLOG_INTERACTIVE", std::io::stdout().is_terminal()),
            tags: env::var("EVENTLOG_TAGS")
                .map(|val| parse_tags(&val))
                .unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.seq_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "EVENTLOG_SEQ_URL cannot be empty".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        if self.forward_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "EVENTLOG_FORWARD_TIMEOUT must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
