// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A [`StatusStore`] kept in process memory.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use realm_orchestrator::{StatusStore, StoreError, Versioned};
use realm_types::{RealmId, RealmStatus};

/// Status records held in memory, versioned by a per-record write counter.
///
/// Used by backends whose state does not survive a restart on its own; the
/// persisted recovery record fills that gap.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    records: Mutex<BTreeMap<RealmId, (u64, RealmStatus)>>,
}

impl InMemoryStatusStore {
    pub fn new() -> InMemoryStatusStore {
        InMemoryStatusStore::default()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn read(&self, realm_id: &RealmId) -> Result<Option<Versioned<RealmStatus>>, StoreError> {
        let records = self.records.lock().expect("lock poisoned");
        Ok(records.get(realm_id).map(|(version, status)| Versioned {
            value: status.clone(),
            version: Some(version.to_string()),
        }))
    }

    async fn write(&self, status: &RealmStatus, version: Option<&str>) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("lock poisoned");
        let current = records.get(&status.realm_id).map(|(v, _)| v.to_string());
        if current.as_deref() != version {
            return Err(StoreError::Conflict(status.realm_id.clone()));
        }
        let next = records.get(&status.realm_id).map_or(1, |(v, _)| v + 1);
        records.insert(status.realm_id.clone(), (next, status.clone()));
        Ok(())
    }

    async fn remove(&self, realm_id: &RealmId) -> Result<(), StoreError> {
        self.records.lock().expect("lock poisoned").remove(realm_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RealmStatus>, StoreError> {
        let records = self.records.lock().expect("lock poisoned");
        Ok(records.values().map(|(_, status)| status.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_writes_are_rejected() {
        let store = InMemoryStatusStore::new();
        let status = RealmStatus::new("r1".into(), "default");
        store.write(&status, None).await.unwrap();

        let read = store.read(&"r1".into()).await.unwrap().unwrap();
        let version = read.version.clone();
        store.write(&read.value, version.as_deref()).await.unwrap();

        // The record moved on since `read` was taken.
        let err = store
            .write(&read.value, version.as_deref())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Creating a record that already exists is also a conflict.
        assert!(matches!(
            store.write(&status, None).await,
            Err(StoreError::Conflict(_))
        ));
    }
}
