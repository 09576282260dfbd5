//! Progress event bus (§4.9): a `tokio::sync::broadcast` channel so any
//! number of subscribers (CLI renderer, future webhook sink, tests) can
//! observe pipeline progress without coupling to the orchestrator, plus a
//! `Mutex`-backed snapshot so a caller can read current state without
//! subscribing to the stream at all.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::Stage;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProgressEvent {
    GroupStarted {
        group_key: String,
        at: DateTime<Utc>,
    },
    StageStarted {
        group_key: String,
        stage: Stage,
        at: DateTime<Utc>,
    },
    StageCompleted {
        group_key: String,
        stage: Stage,
        at: DateTime<Utc>,
    },
    StageRetried {
        group_key: String,
        stage: Stage,
        attempt: u32,
        reason: String,
        at: DateTime<Utc>,
    },
    GroupCompleted {
        group_key: String,
        outcome: String,
        at: DateTime<Utc>,
    },
    GroupFailed {
        group_key: String,
        reason: String,
        at: DateTime<Utc>,
    },
    RunCompleted {
        summary: String,
        at: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn group_key(&self) -> Option<&str> {
        match self {
            ProgressEvent::GroupStarted { group_key, .. }
            | ProgressEvent::StageStarted { group_key, .. }
            | ProgressEvent::StageCompleted { group_key, .. }
            | ProgressEvent::StageRetried { group_key, .. }
            | ProgressEvent::GroupCompleted { group_key, .. }
            | ProgressEvent::GroupFailed { group_key, .. } => Some(group_key),
            ProgressEvent::RunCompleted { .. } => None,
        }
    }
}

/// Snapshot of a single group's most recently observed stage, kept in sync
/// with the broadcast stream so readers that don't want to hold a
/// `Receiver` open can still poll current state (e.g. a status subcommand).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub group_key: String,
    pub stage: Option<Stage>,
    pub outcome: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Publishes `ProgressEvent`s to subscribers and maintains a queryable
/// snapshot table. Cheap to clone: the broadcast sender and snapshot map are
/// both reference-counted.
#[derive(Clone)]
pub struct ProgressReporter {
    sender: broadcast::Sender<ProgressEvent>,
    snapshots: Arc<Mutex<HashMap<String, GroupSnapshot>>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            snapshots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Updates the snapshot table and broadcasts the event. Lagging or
    /// receiver-less subscribers never block or error the publisher: a
    /// `send` with zero receivers is a normal no-op in this codebase.
    pub fn publish(&self, event: ProgressEvent) {
        if let Some(key) = event.group_key() {
            let mut snapshots = self.snapshots.lock().expect("progress snapshot lock poisoned");
            let entry = snapshots
                .entry(key.to_string())
                .or_insert_with(|| GroupSnapshot {
                    group_key: key.to_string(),
                    stage: None,
                    outcome: None,
                    updated_at: Utc::now(),
                });
            apply_event(entry, &event);
        }
        let _ = self.sender.send(event);
    }

    pub fn snapshot(&self, group_key: &str) -> Option<GroupSnapshot> {
        self.snapshots
            .lock()
            .expect("progress snapshot lock poisoned")
            .get(group_key)
            .cloned()
    }

    pub fn all_snapshots(&self) -> Vec<GroupSnapshot> {
        let mut out: Vec<GroupSnapshot> = self
            .snapshots
            .lock()
            .expect("progress snapshot lock poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.group_key.cmp(&b.group_key));
        out
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_event(entry: &mut GroupSnapshot, event: &ProgressEvent) {
    match event {
        ProgressEvent::GroupStarted { at, .. } => {
            entry.stage = None;
            entry.outcome = None;
            entry.updated_at = *at;
        }
        ProgressEvent::StageStarted { stage, at, .. } | ProgressEvent::StageCompleted { stage, at, .. } => {
            entry.stage = Some(*stage);
            entry.updated_at = *at;
        }
        ProgressEvent::StageRetried { stage, at, .. } => {
            entry.stage = Some(*stage);
            entry.updated_at = *at;
        }
        ProgressEvent::GroupCompleted { outcome, at, .. } => {
            entry.outcome = Some(outcome.clone());
            entry.updated_at = *at;
        }
        ProgressEvent::GroupFailed { reason, at, .. } => {
            entry.outcome = Some(reason.clone());
            entry.updated_at = *at;
        }
        ProgressEvent::RunCompleted { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(group: &str) -> ProgressEvent {
        ProgressEvent::GroupStarted {
            group_key: group.to_string(),
            at: Utc::now(),
        }
    }

    #[test]
    fn publish_updates_snapshot_for_group() {
        let reporter = ProgressReporter::new();
        reporter.publish(started("g1"));
        reporter.publish(ProgressEvent::StageStarted {
            group_key: "g1".to_string(),
            stage: Stage::Init,
            at: Utc::now(),
        });
        let snap = reporter.snapshot("g1").expect("snapshot present");
        assert_eq!(snap.stage, Some(Stage::Init));
    }

    #[test]
    fn publish_with_no_subscribers_does_not_error() {
        let reporter = ProgressReporter::new();
        reporter.publish(started("g1"));
    }

    #[test]
    fn subscriber_receives_published_events() {
        let reporter = ProgressReporter::new();
        let mut rx = reporter.subscribe();
        reporter.publish(started("g2"));
        let event = rx.try_recv().expect("event available");
        assert_eq!(event.group_key(), Some("g2"));
    }

    #[test]
    fn all_snapshots_are_sorted_by_group_key() {
        let reporter = ProgressReporter::new();
        reporter.publish(started("zeta"));
        reporter.publish(started("alpha"));
        let snapshots = reporter.all_snapshots();
        assert_eq!(snapshots[0].group_key, "alpha");
        assert_eq!(snapshots[1].group_key, "zeta");
    }

    #[test]
    fn group_failed_records_reason_as_outcome() {
        let reporter = ProgressReporter::new();
        reporter.publish(started("g3"));
        reporter.publish(ProgressEvent::GroupFailed {
            group_key: "g3".to_string(),
            reason: "check failed".to_string(),
            at: Utc::now(),
        });
        let snap = reporter.snapshot("g3").unwrap();
        assert_eq!(snap.outcome.as_deref(), Some("check failed"));
    }
}
