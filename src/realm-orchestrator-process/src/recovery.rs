// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use realm_orchestrator::{LatestRecord, RecoveryStore};
use realm_types::{InstanceKey, RealmId, SpecHash};
use serde::Deserialize;

use crate::write_atomically;

/// A record as found on disk. Older files hold only the spec hash.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredRecord {
    Instance(LatestRecord),
    SpecHash(SpecHash),
}

impl From<StoredRecord> for LatestRecord {
    fn from(record: StoredRecord) -> LatestRecord {
        match record {
            StoredRecord::Instance(record) => record,
            StoredRecord::SpecHash(spec_hash) => LatestRecord {
                spec_hash,
                revision: None,
            },
        }
    }
}

/// Records the latest instance of each realm in a JSON file.
#[derive(Debug)]
pub struct FileRecoveryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileRecoveryStore {
    pub fn new(path: impl Into<PathBuf>) -> FileRecoveryStore {
        FileRecoveryStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read(&self) -> io::Result<BTreeMap<RealmId, LatestRecord>> {
        match std::fs::read(&self.path) {
            Ok(contents) => {
                let records: BTreeMap<RealmId, StoredRecord> = serde_json::from_slice(&contents)?;
                Ok(records.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<RealmId, LatestRecord>)) -> io::Result<()> {
        let _guard = self.lock.lock().expect("lock poisoned");
        let mut records = self.read()?;
        f(&mut records);
        write_atomically(&self.path, &serde_json::to_vec_pretty(&records)?)
    }
}

#[async_trait]
impl RecoveryStore for FileRecoveryStore {
    async fn load(&self) -> Result<BTreeMap<RealmId, LatestRecord>, anyhow::Error> {
        let _guard = self.lock.lock().expect("lock poisoned");
        Ok(self.read()?)
    }

    async fn record_latest(&self, key: &InstanceKey) -> Result<(), anyhow::Error> {
        self.update(|records| {
            records.insert(key.realm_id.clone(), LatestRecord::from(key));
        })?;
        Ok(())
    }

    async fn forget(&self, realm_id: &RealmId) -> Result<(), anyhow::Error> {
        self.update(|records| {
            records.remove(realm_id);
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(realm_id: &str, hash: &str, revision: u64) -> InstanceKey {
        InstanceKey::new(realm_id.into(), hash.into(), revision)
    }

    #[tokio::test]
    async fn records_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recovery.json");

        let store = FileRecoveryStore::new(&path);
        assert!(store.load().await.unwrap().is_empty());
        store.record_latest(&key("r1", "abc", 0)).await.unwrap();
        store.record_latest(&key("r2", "def", 0)).await.unwrap();
        store.record_latest(&key("r1", "abc", 1)).await.unwrap();
        store.forget(&"r2".into()).await.unwrap();

        let reopened = FileRecoveryStore::new(&path);
        let records = reopened.load().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records.get(&"r1".into()),
            Some(&LatestRecord {
                spec_hash: "abc".into(),
                revision: Some(1),
            })
        );
    }

    #[tokio::test]
    async fn hash_only_records_are_still_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recovery.json");
        std::fs::write(&path, r#"{"r1": "abc"}"#).unwrap();

        let store = FileRecoveryStore::new(&path);
        let records = store.load().await.unwrap();
        assert_eq!(
            records.get(&"r1".into()),
            Some(&LatestRecord {
                spec_hash: "abc".into(),
                revision: None,
            })
        );

        store.record_latest(&key("r2", "def", 3)).await.unwrap();
        let records = store.load().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[&"r2".into()].revision, Some(3));
    }
}
