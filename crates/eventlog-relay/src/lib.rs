// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event log relay: tails sequential event logs and forwards matching entries
//! to a remote log ingestion endpoint.
//!
//! ```text
//!   EventSource ──► Listener (filter, dedup, bookmark) ──► Forwarder
//!                      ▲                 │
//!                      │                 └──► ServiceCounters
//!               ListenerManager ◄──── Heartbeat (stall restart, bookmark flush)
//! ```
//!
//! Each [`listener::Listener`] owns one subscription and drains it from a
//! single consumer task. The [`heartbeat::Heartbeat`] watches the shared
//! [`counters::ServiceCounters`] and restarts every listener when nothing has
//! moved for too long.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod bookmark;
pub mod config;
pub mod constants;
pub mod counters;
pub mod dedup;
pub mod entry;
pub mod errors;
pub mod filter;
pub mod forwarder;
pub mod heartbeat;
pub mod listener;
pub mod manager;
pub mod service;
pub mod source;
