// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the relay.
//!
//! Only [`ConfigError`] is ever fatal. Everything else is logged at the point
//! it happens and the affected listener, entry or flush carries on.

use std::path::PathBuf;

/// Invalid listener or agent definition.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("A source identifier must be specified for listener {0}")]
    MissingSource(String),

    #[error("Duplicate listener key '{0}'")]
    DuplicateListener(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read listener configuration {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse listener configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Subscription open or read failure.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Source '{0}' is unavailable")]
    Unavailable(String),

    #[error("Subscription rejected: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single entry could not be turned into a record.
#[derive(Debug, thiserror::Error)]
pub enum EntryProcessingError {
    #[error("Malformed entry {record_id}: {reason}")]
    Malformed { record_id: u64, reason: String },

    #[error("Failed to forward entry {record_id}: {source}")]
    Forward {
        record_id: u64,
        source: TransportError,
    },
}

/// Bookmark flush failure.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Bookmark file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Bookmark serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Delivery to the ingestion endpoint failed.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to build payload: {0}")]
    Payload(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("{status}: ingestion endpoint rejected the record: {body}")]
    Status { status: u16, body: String },
}

/// Errors surfaced by the process-control surface.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}
