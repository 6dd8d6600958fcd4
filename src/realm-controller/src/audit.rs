// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The append-only record of instance lifecycle events.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use realm_types::{InstanceKey, RealmId, SpecHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LifecycleEventKind {
    StartingNewInstance,
    InstanceReady,
    StartingNewInstanceFailed,
    DeletingInstance,
    InstanceDeleted,
    /// A realm declaration was rejected. Not tied to an instance.
    InvalidSpec,
}

impl LifecycleEventKind {
    /// Whether repeated identical messages of this kind are suppressed.
    fn is_deduplicated(&self) -> bool {
        matches!(
            self,
            LifecycleEventKind::StartingNewInstanceFailed | LifecycleEventKind::InvalidSpec
        )
    }
}

impl fmt::Display for LifecycleEventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub kind: LifecycleEventKind,
    pub realm_id: RealmId,
    pub spec_hash: SpecHash,
    /// Absent for events that concern a declaration rather than an instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn instance(kind: LifecycleEventKind, key: &InstanceKey) -> LifecycleEvent {
        LifecycleEvent {
            kind,
            realm_id: key.realm_id.clone(),
            spec_hash: key.spec_hash.clone(),
            revision: Some(key.revision),
            message: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn invalid_spec(realm_id: &RealmId, spec_hash: &SpecHash, message: String) -> LifecycleEvent {
        LifecycleEvent {
            kind: LifecycleEventKind::InvalidSpec,
            realm_id: realm_id.clone(),
            spec_hash: spec_hash.clone(),
            revision: None,
            message: Some(message),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> LifecycleEvent {
        self.message = Some(message.into());
        self
    }

    fn dedup_key(&self) -> (RealmId, SpecHash, Option<u64>, LifecycleEventKind, String) {
        (
            self.realm_id.clone(),
            self.spec_hash.clone(),
            self.revision,
            self.kind,
            self.message.clone().unwrap_or_default(),
        )
    }

    pub fn key(&self) -> Option<InstanceKey> {
        self.revision.map(|revision| {
            InstanceKey::new(self.realm_id.clone(), self.spec_hash.clone(), revision)
        })
    }
}

#[derive(Debug, Default)]
struct AuditState {
    events: Vec<LifecycleEvent>,
    reported: BTreeSet<(RealmId, SpecHash, Option<u64>, LifecycleEventKind, String)>,
}

/// Records lifecycle events in memory and, optionally, as JSON lines in a
/// file.
#[derive(Debug, Default)]
pub struct AuditLog {
    state: Mutex<AuditState>,
    file: Option<Mutex<File>>,
}

impl AuditLog {
    pub fn new() -> AuditLog {
        AuditLog::default()
    }

    /// Creates an audit log that also appends every event to `path`.
    pub fn with_file(path: impl AsRef<Path>) -> Result<AuditLog, io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(AuditLog {
            state: Mutex::default(),
            file: Some(Mutex::new(file)),
        })
    }

    /// Records `event`. Returns false if it was suppressed as a duplicate.
    pub fn record(&self, event: LifecycleEvent) -> bool {
        let mut state = self.state.lock().expect("lock poisoned");
        if event.kind.is_deduplicated() && !state.reported.insert(event.dedup_key()) {
            return false;
        }
        info!(
            kind = %event.kind,
            realm_id = %event.realm_id,
            spec_hash = %event.spec_hash.short(),
            revision = ?event.revision,
            message = event.message.as_deref().unwrap_or(""),
            "lifecycle event"
        );
        if let Some(file) = &self.file {
            let mut file = file.lock().expect("lock poisoned");
            let line = serde_json::to_string(&event).map_err(io::Error::from);
            if let Err(e) = line.and_then(|line| writeln!(file, "{line}")) {
                warn!("failed to append to audit log file: {e}");
            }
        }
        state.events.push(event);
        true
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.state.lock().expect("lock poisoned").events.clone()
    }

    pub fn events_for(&self, key: &InstanceKey) -> Vec<LifecycleEvent> {
        self.state
            .lock()
            .expect("lock poisoned")
            .events
            .iter()
            .filter(|e| e.key().as_ref() == Some(key))
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: LifecycleEventKind, key: &InstanceKey) -> usize {
        self.events_for(key).iter().filter(|e| e.kind == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn key() -> InstanceKey {
        InstanceKey::new("r1".into(), "h1".into(), 0)
    }

    #[test]
    fn identical_failures_are_reported_once() {
        let log = AuditLog::new();
        let failed = || {
            LifecycleEvent::instance(LifecycleEventKind::StartingNewInstanceFailed, &key())
                .with_message("crash loop")
        };
        assert!(log.record(failed()));
        assert!(!log.record(failed()));
        assert!(log.record(failed().with_message("image pull")));
        assert_eq!(
            log.count(LifecycleEventKind::StartingNewInstanceFailed, &key()),
            2
        );
    }

    #[test]
    fn other_events_are_never_suppressed() {
        let log = AuditLog::new();
        log.record(LifecycleEvent::instance(LifecycleEventKind::InstanceReady, &key()));
        log.record(LifecycleEvent::instance(LifecycleEventKind::InstanceReady, &key()));
        assert_eq!(log.count(LifecycleEventKind::InstanceReady, &key()), 2);
    }

    #[test]
    fn events_are_appended_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::with_file(&path).unwrap();
        log.record(LifecycleEvent::instance(
            LifecycleEventKind::StartingNewInstance,
            &key(),
        ));
        log.record(LifecycleEvent::invalid_spec(
            &"r1".into(),
            &"h2".into(),
            "image must not be empty".into(),
        ));

        let mut contents = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        let lines: Vec<LifecycleEvent> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].kind, LifecycleEventKind::StartingNewInstance);
        assert_eq!(lines[1].revision, None);
    }
}
