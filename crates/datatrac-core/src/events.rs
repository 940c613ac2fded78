//! Multi-subscriber event fan-out.
//!
//! Each subscriber owns a bounded channel. Publishing never blocks: a full
//! sink drops the event for that sink only (subscribers are current-state
//! feeds, not logs), and closed sinks are pruned on the next publish.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use datatrac_db::models::{TaskStatus, UnitStatus};

use crate::logbuf::LogEntry;

/// Per-unit slice of a progress snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitSnapshot {
    pub unit_name: String,
    pub status: UnitStatus,
    pub total_records: i64,
    pub processed_records: i64,
    pub error_message: Option<String>,
}

/// Current per-task progress, re-read from the checkpoint store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub is_running: bool,
    pub total_units: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub paused: i64,
    pub total_records: i64,
    pub processed_records: i64,
    pub units: Vec<UnitSnapshot>,
}

/// A structured error pushed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub unit_name: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Events delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum SyncEvent {
    Progress(ProgressSnapshot),
    Log(Vec<LogEntry>),
    Error(ErrorRecord),
}

impl SyncEvent {
    /// The SSE event name for this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::Log(_) => "log",
            Self::Error(_) => "error",
        }
    }
}

/// Handle returned by [`EventBus::subscribe`]; pass back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

struct Sink {
    id: u64,
    tx: mpsc::Sender<SyncEvent>,
}

/// Default per-subscriber channel capacity.
pub const SINK_CAPACITY: usize = 64;

/// Per-task subscriber registry with non-blocking delivery.
pub struct EventBus {
    capacity: usize,
    next_id: AtomicU64,
    sinks: Mutex<HashMap<Uuid, Vec<Sink>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a subscriber for one task's events.
    pub fn subscribe(&self, task_id: Uuid) -> (SubscriberId, mpsc::Receiver<SyncEvent>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut sinks = self.sinks.lock().expect("event bus lock poisoned");
        sinks.entry(task_id).or_default().push(Sink { id, tx });
        (SubscriberId(id), rx)
    }

    /// Remove a subscriber, closing its channel.
    pub fn unsubscribe(&self, task_id: Uuid, subscriber: SubscriberId) {
        let mut sinks = self.sinks.lock().expect("event bus lock poisoned");
        if let Some(list) = sinks.get_mut(&task_id) {
            list.retain(|s| s.id != subscriber.0);
            if list.is_empty() {
                sinks.remove(&task_id);
            }
        }
    }

    /// Deliver an event to every subscriber of a task, best-effort.
    pub fn publish(&self, task_id: Uuid, event: &SyncEvent) {
        let mut sinks = self.sinks.lock().expect("event bus lock poisoned");
        let Some(list) = sinks.get_mut(&task_id) else {
            return;
        };
        list.retain(|sink| match sink.tx.try_send(event.clone()) {
            Ok(()) => true,
            // Slow subscriber: drop this event for this sink only.
            Err(mpsc::error::TrySendError::Full(_)) => true,
            // Disconnected subscriber: prune.
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if list.is_empty() {
            sinks.remove(&task_id);
        }
    }

    /// Number of live subscribers for a task.
    pub fn subscriber_count(&self, task_id: Uuid) -> usize {
        let sinks = self.sinks.lock().expect("event bus lock poisoned");
        sinks.get(&task_id).map(|l| l.len()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(SINK_CAPACITY)
    }
}
