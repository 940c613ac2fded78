//! Per-task bounded ring buffer of categorized log entries.
//!
//! The buffer is presentation-facing: the canonical record of what happened
//! is the checkpoint store. Appends are lock-guarded with short critical
//! sections; reads return the most recent entries.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
}

/// Presentation-time filter category. The buffer itself does not partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    All,
    Create,
    Sync,
    Complete,
    Verify,
}

/// One log line pushed to subscribers and kept in the ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub category: LogCategory,
}

impl LogEntry {
    pub fn new(level: LogLevel, category: LogCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            category,
        }
    }
}

/// Default per-task ring capacity.
pub const DEFAULT_LOG_CAP: usize = 1_000;

/// Bounded per-task log rings.
pub struct LogHub {
    cap: usize,
    rings: Mutex<HashMap<Uuid, VecDeque<LogEntry>>>,
}

impl LogHub {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            rings: Mutex::new(HashMap::new()),
        }
    }

    /// Append an entry, evicting the oldest when the ring is full.
    pub fn append(&self, task_id: Uuid, entry: LogEntry) {
        let mut rings = self.rings.lock().expect("log hub lock poisoned");
        let ring = rings.entry(task_id).or_default();
        if ring.len() == self.cap {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// The most recent `limit` entries for a task, oldest first.
    pub fn recent(&self, task_id: Uuid, limit: usize) -> Vec<LogEntry> {
        let rings = self.rings.lock().expect("log hub lock poisoned");
        match rings.get(&task_id) {
            Some(ring) => {
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop the ring for a task (e.g. on task delete).
    pub fn remove(&self, task_id: Uuid) {
        let mut rings = self.rings.lock().expect("log hub lock poisoned");
        rings.remove(&task_id);
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_recent() {
        let hub = LogHub::new(10);
        let task = Uuid::new_v4();
        for i in 0..3 {
            hub.append(
                task,
                LogEntry::new(LogLevel::Info, LogCategory::Sync, format!("line {i}")),
            );
        }
        let recent = hub.recent(task, 10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "line 0");
        assert_eq!(recent[2].message, "line 2");
    }

    #[test]
    fn ring_evicts_oldest() {
        let hub = LogHub::new(2);
        let task = Uuid::new_v4();
        for i in 0..5 {
            hub.append(
                task,
                LogEntry::new(LogLevel::Info, LogCategory::Sync, format!("line {i}")),
            );
        }
        let recent = hub.recent(task, 10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "line 3");
        assert_eq!(recent[1].message, "line 4");
    }

    #[test]
    fn recent_respects_limit() {
        let hub = LogHub::new(100);
        let task = Uuid::new_v4();
        for i in 0..10 {
            hub.append(
                task,
                LogEntry::new(LogLevel::Info, LogCategory::Sync, format!("line {i}")),
            );
        }
        let recent = hub.recent(task, 4);
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].message, "line 6");
    }

    #[test]
    fn unknown_task_is_empty() {
        let hub = LogHub::default();
        assert!(hub.recent(Uuid::new_v4(), 5).is_empty());
    }

    #[test]
    fn tasks_are_isolated() {
        let hub = LogHub::new(10);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        hub.append(a, LogEntry::new(LogLevel::Info, LogCategory::All, "for a"));
        assert!(hub.recent(b, 10).is_empty());
        assert_eq!(hub.recent(a, 10).len(), 1);
    }
}
