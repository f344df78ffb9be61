// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Default sliding window for the dedup cache, in seconds.
pub const DEFAULT_DEDUP_TTL_SECS: i64 = 600;

/// How often the dedup cache sweeps expired ids.
pub const DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Default heartbeat interval, also used when the configured one is out of range.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 600;

/// Largest accepted heartbeat interval (one hour).
pub const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 3600;

/// Bounds for the randomized first heartbeat in service mode.
pub const FIRST_HEARTBEAT_MIN: Duration = Duration::from_secs(2);
pub const FIRST_HEARTBEAT_MAX: Duration = Duration::from_secs(10);

/// Interactive sessions tick on a fixed, faster schedule.
pub const INTERACTIVE_FIRST_HEARTBEAT: Duration = Duration::from_secs(10);
pub const INTERACTIVE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Pause between stopping and restarting every listener after a stall.
pub const RESTART_PAUSE: Duration = Duration::from_secs(1);

/// Upper bound on how long a single listener stop may take.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the per-listener delivery channel.
pub const DELIVERY_CHANNEL_CAPACITY: usize = 1000;

/// Poll interval for journal-file sources.
pub const JOURNAL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Timeout for a single forwarded record.
pub const DEFAULT_FORWARD_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_APP_NAME: &str = "eventlog-relay";
pub const DEFAULT_SEQ_URL: &str = "http://localhost:5341";
pub const DEFAULT_LISTENERS_FILE: &str = "EventLogListeners.json";
pub const DEFAULT_JOURNAL_DIR: &str = "journals";

pub const DEFAULT_MESSAGE_TEMPLATE: &str =
    "[{LogAppName}] - ({EventLevel}) - Event Id {EventId} - {EventSummary}";
pub const LOGON_MESSAGE_TEMPLATE: &str = "[{LogAppName}] - New login detected on {RemoteServer} - {EventData_TargetDomainName}\\{EventData_TargetUserName} at {EventTime}";

/// Logon watch mode pins the listener to successful logons on the security log.
pub const LOGON_SOURCE: &str = "Security";
pub const LOGON_EVENT_ID: u32 = 4624;
pub const EMPTY_GUID: &str = "{00000000-0000-0000-0000-000000000000}";
