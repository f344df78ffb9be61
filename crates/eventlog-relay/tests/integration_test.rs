// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{Duration as ChronoDuration, Local, Utc};
use eventlog_relay::bookmark::{BookmarkStore, JsonFileBookmarks};
use eventlog_relay::config::{AgentConfig, ListenerConfig};
use eventlog_relay::counters::ServiceCounters;
use eventlog_relay::entry::{Entry, Level, NativeLevel, TagValue};
use eventlog_relay::forwarder::MemoryForwarder;
use eventlog_relay::heartbeat::{Heartbeat, HeartbeatConfig};
use eventlog_relay::listener::{ListenerContext, ListenerState, StartBoundary};
use eventlog_relay::manager::ListenerManager;
use eventlog_relay::service::{RelayService, ServiceHandle};
use eventlog_relay::source::{JournalSourceFactory, MemorySource, MemorySourceFactory};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

fn entry(record_id: u64, level: NativeLevel) -> Entry {
    Entry {
        timestamp: Utc::now() + ChronoDuration::seconds(1),
        level: Some(level),
        keywords: None,
        provider: "Service Control Manager".to_string(),
        event_id: 7036,
        record_id,
        description: format!("Entry {record_id}"),
        payload: BTreeMap::new(),
        position: String::new(),
    }
}

fn quiet_config() -> AgentConfig {
    AgentConfig {
        heartbeat_interval_secs: 0,
        ..AgentConfig::default()
    }
}

async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn record_ids(forwarder: &MemoryForwarder) -> Vec<TagValue> {
    forwarder
        .records()
        .iter()
        .map(|record| record.tags["RecordId"].clone())
        .collect()
}

async fn start_memory_service(
    source: &MemorySource,
    listener: ListenerConfig,
    forwarder: Arc<MemoryForwarder>,
) -> ServiceHandle {
    let mut factory = MemorySourceFactory::new();
    factory.register(listener.key(), source.clone());
    RelayService::new(
        quiet_config(),
        vec![listener],
        Arc::new(factory),
        forwarder,
        Arc::new(BookmarkStore::in_memory()),
    )
    .start()
    .await
    .expect("service should start")
}

#[tokio::test]
async fn redelivered_entry_is_forwarded_once() {
    let source = MemorySource::new("System");
    let forwarder = Arc::new(MemoryForwarder::new());
    let handle = start_memory_service(
        &source,
        ListenerConfig {
            source: "System".to_string(),
            ..ListenerConfig::default()
        },
        Arc::clone(&forwarder),
    )
    .await;

    for record_id in [1, 2, 2, 3] {
        source.append(entry(record_id, NativeLevel::Information));
    }
    wait_for(|| handle.counters().events_processed == 3).await;

    assert_eq!(
        record_ids(&forwarder),
        vec![
            TagValue::Integer(1),
            TagValue::Integer(2),
            TagValue::Integer(3)
        ]
    );
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn three_stalled_heartbeats_trigger_one_restart() {
    let source = MemorySource::new("System");
    let mut factory = MemorySourceFactory::new();
    factory.register("System", source.clone());
    let counters = Arc::new(ServiceCounters::new());
    let bookmarks = Arc::new(BookmarkStore::in_memory());

    let mut manager = ListenerManager::new(ListenerContext {
        counters: Arc::clone(&counters),
        bookmarks: Arc::clone(&bookmarks),
        forwarder: Arc::new(MemoryForwarder::new()),
        sources: Arc::new(factory),
        boundary: StartBoundary::now(true),
        dedup_ttl_secs: 600,
        default_tags: Arc::default(),
    });
    manager.load_all(vec![ListenerConfig {
        source: "System".to_string(),
        ..ListenerConfig::default()
    }]);
    manager.validate_all("relay").unwrap();
    manager.start_all(false).await;
    let manager = Arc::new(Mutex::new(manager));

    let mut heartbeat = Heartbeat::new(
        HeartbeatConfig {
            interval_secs: 5,
            stall_threshold: 2,
            interactive: false,
            count_all_counters: true,
        },
        Arc::clone(&manager),
        counters,
        bookmarks,
    );

    let mut restarts = 0;
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(5)).await;
        if heartbeat.tick(Local::now()).await.restarted {
            restarts += 1;
        }
    }

    assert_eq!(restarts, 1);
    assert_eq!(heartbeat.stall_count(), 0);
    assert_eq!(source.subscription_count(), 2);
    assert_eq!(
        manager.lock().await.states(),
        vec![("System".to_string(), ListenerState::Running)]
    );
}

#[tokio::test]
async fn level_allow_list_filters_entries() {
    let source = MemorySource::new("Application");
    let forwarder = Arc::new(MemoryForwarder::new());
    let handle = start_memory_service(
        &source,
        ListenerConfig {
            source: "Application".to_string(),
            levels: vec![NativeLevel::Warning, NativeLevel::Error],
            ..ListenerConfig::default()
        },
        Arc::clone(&forwarder),
    )
    .await;

    source.append(entry(1, NativeLevel::Information));
    source.append(entry(2, NativeLevel::Warning));
    wait_for(|| {
        let counters = handle.counters();
        counters.unhandled_events == 1 && counters.events_processed == 1
    })
    .await;

    let records = forwarder.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].level, Level::Warning);
    assert_eq!(records[0].tags["RecordId"], TagValue::Integer(2));
    handle.stop().await.unwrap();
}

fn line_of(token: &str) -> u64 {
    let (line, _record_id) = token.split_once(':').expect("journal position");
    line.parse().expect("line index")
}

fn append_line(path: &Path, record_id: u64) {
    let line = format!(
        r#"{{"timestamp":"{}","level":"Information","provider":"app","event_id":1,"record_id":{record_id},"description":"entry {record_id}"}}"#,
        Utc::now().to_rfc3339()
    );
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open journal");
    writeln!(file, "{line}").expect("append journal line");
}

async fn start_journal_service(
    journals: &Path,
    bookmarks_path: &Path,
    forwarder: Arc<MemoryForwarder>,
) -> ServiceHandle {
    let bookmarks = Arc::new(BookmarkStore::open(Arc::new(JsonFileBookmarks::new(
        bookmarks_path,
    ))));
    RelayService::new(
        quiet_config(),
        vec![ListenerConfig {
            source: "Application".to_string(),
            resume_from_bookmark: true,
            ..ListenerConfig::default()
        }],
        Arc::new(JournalSourceFactory::new(journals).with_poll_interval(Duration::from_millis(10))),
        forwarder,
        bookmarks,
    )
    .start()
    .await
    .expect("service should start")
}

#[tokio::test]
async fn restart_resumes_strictly_after_bookmark() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("Application.jsonl");
    let bookmarks_path = dir.path().join("bookmarks.json");
    std::fs::write(&journal, "").unwrap();

    let first_run = Arc::new(MemoryForwarder::new());
    let handle = start_journal_service(dir.path(), &bookmarks_path, Arc::clone(&first_run)).await;
    append_line(&journal, 100);
    append_line(&journal, 101);
    wait_for(|| handle.counters().events_processed == 2).await;
    handle.stop().await.unwrap();

    let saved = BookmarkStore::open(Arc::new(JsonFileBookmarks::new(&bookmarks_path)))
        .load("Application")
        .expect("bookmark persisted on shutdown");
    assert_eq!(saved.token, "1:101");
    let processed_position = line_of(&saved.token);
    assert!(processed_position >= 1);

    // appended while the relay was down
    append_line(&journal, 102);

    let second_run = Arc::new(MemoryForwarder::new());
    let handle = start_journal_service(dir.path(), &bookmarks_path, Arc::clone(&second_run)).await;
    append_line(&journal, 103);
    wait_for(|| handle.counters().events_processed == 2).await;
    handle.stop().await.unwrap();

    assert_eq!(
        record_ids(&second_run),
        vec![TagValue::Integer(102), TagValue::Integer(103)]
    );
    let resumed = BookmarkStore::open(Arc::new(JsonFileBookmarks::new(&bookmarks_path)))
        .load("Application")
        .unwrap();
    assert!(line_of(&resumed.token) > processed_position);
}

#[tokio::test]
async fn rotated_journal_falls_back_to_new_events() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("Application.jsonl");
    let bookmarks_path = dir.path().join("bookmarks.json");
    std::fs::write(&journal, "").unwrap();

    let first_run = Arc::new(MemoryForwarder::new());
    let handle = start_journal_service(dir.path(), &bookmarks_path, Arc::clone(&first_run)).await;
    for record_id in [1, 2, 3] {
        append_line(&journal, record_id);
    }
    wait_for(|| handle.counters().events_processed == 3).await;
    handle.stop().await.unwrap();

    // rotated while the relay was down: more lines than the bookmark index
    std::fs::write(&journal, "").unwrap();
    for record_id in 500..505 {
        append_line(&journal, record_id);
    }

    let second_run = Arc::new(MemoryForwarder::new());
    let handle = start_journal_service(dir.path(), &bookmarks_path, Arc::clone(&second_run)).await;
    append_line(&journal, 505);
    wait_for(|| handle.counters().events_processed == 1).await;
    handle.stop().await.unwrap();

    assert_eq!(record_ids(&second_run), vec![TagValue::Integer(505)]);
    let saved = BookmarkStore::open(Arc::new(JsonFileBookmarks::new(&bookmarks_path)))
        .load("Application")
        .unwrap();
    assert_eq!(saved.token, "5:505");
}
