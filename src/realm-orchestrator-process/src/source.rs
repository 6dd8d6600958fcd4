// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Realm declarations kept as JSON files in a directory.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::warn;

use realm_orchestrator::{Notification, NotificationKind, RealmSource};
use realm_types::{Realm, RealmId, RealmSpec, SpecHash};

/// The contents of `<realm>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealmFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(flatten)]
    pub spec: RealmSpec,
}

/// Reads realm declarations from `<dir>/<realm>.json`, where the file stem
/// is the realm id.
#[derive(Debug, Clone)]
pub struct FileRealmSource {
    dir: PathBuf,
    default_namespace: String,
    poll_interval: Duration,
}

impl FileRealmSource {
    pub fn new(
        dir: impl Into<PathBuf>,
        default_namespace: impl Into<String>,
        poll_interval: Duration,
    ) -> FileRealmSource {
        FileRealmSource {
            dir: dir.into(),
            default_namespace: default_namespace.into(),
            poll_interval,
        }
    }

    fn path(&self, realm_id: &RealmId) -> PathBuf {
        self.dir.join(format!("{realm_id}.json"))
    }

    fn read(
        &self,
        realm_id: &RealmId,
        path: &Path,
    ) -> Result<Option<(Realm, SystemTime)>, anyhow::Error> {
        let contents = match std::fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let modified = std::fs::metadata(path)?.modified()?;
        let file: RealmFile = serde_json::from_slice(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        let namespace = file
            .namespace
            .unwrap_or_else(|| self.default_namespace.clone());
        Ok(Some((Realm::new(realm_id.clone(), namespace, file.spec), modified)))
    }

    /// Lists the ids of all declared realms.
    fn scan(&self) -> Result<Vec<(RealmId, PathBuf)>, anyhow::Error> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(e).with_context(|| format!("listing {}", self.dir.display()))
            }
        };
        let mut realms = vec![];
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                realms.push((RealmId::new(stem), path.clone()));
            }
        }
        realms.sort();
        Ok(realms)
    }

    /// Compares the directory with what was `seen` last time.
    fn poll(&self, seen: &mut BTreeMap<RealmId, (SpecHash, SystemTime)>) -> Vec<Notification> {
        let realms = match self.scan() {
            Ok(realms) => realms,
            Err(e) => {
                warn!("failed to list realm declarations: {e:#}");
                return vec![];
            }
        };
        let mut notifications = vec![];
        let mut present = BTreeMap::new();
        for (realm_id, path) in realms {
            let (realm, modified) = match self.read(&realm_id, &path) {
                Ok(Some(declaration)) => declaration,
                Ok(None) => continue,
                Err(e) => {
                    warn!(realm_id = %realm_id, "ignoring realm declaration: {e:#}");
                    if let Some(previous) = seen.get(&realm_id) {
                        present.insert(realm_id, previous.clone());
                    }
                    continue;
                }
            };
            let kind = match seen.get(&realm_id) {
                None => Some(NotificationKind::Add),
                Some((hash, _)) if *hash != realm.spec_hash => Some(NotificationKind::UpdateSpec),
                Some((_, previous)) if *previous != modified => Some(NotificationKind::UpdateSpec),
                Some(_) => None,
            };
            if let Some(kind) = kind {
                notifications.push(
                    Notification::new(kind, realm_id.clone())
                        .with_spec_hash(realm.spec_hash.clone()),
                );
            }
            present.insert(realm_id, (realm.spec_hash, modified));
        }
        for realm_id in seen.keys() {
            if !present.contains_key(realm_id) {
                notifications.push(Notification::new(NotificationKind::Delete, realm_id.clone()));
            }
        }
        *seen = present;
        notifications
    }
}

#[async_trait]
impl RealmSource for FileRealmSource {
    async fn get(&self, realm_id: &RealmId) -> Result<Option<Realm>, anyhow::Error> {
        let path = self.path(realm_id);
        Ok(self.read(realm_id, &path)?.map(|(realm, _)| realm))
    }

    async fn list(&self) -> Result<Vec<Realm>, anyhow::Error> {
        let mut realms = vec![];
        for (realm_id, path) in self.scan()? {
            match self.read(&realm_id, &path) {
                Ok(Some((realm, _))) => realms.push(realm),
                Ok(None) => {}
                Err(e) => warn!(realm_id = %realm_id, "ignoring realm declaration: {e:#}"),
            }
        }
        Ok(realms)
    }

    fn watch(&self) -> BoxStream<'static, Notification> {
        let source = self.clone();
        let seen = BTreeMap::new();
        stream::unfold((source, seen, true), |(source, mut seen, first)| async move {
            if !first {
                tokio::time::sleep(source.poll_interval).await;
            }
            let batch = source.poll(&mut seen);
            Some((stream::iter(batch), (source, seen, false)))
        })
        .flatten()
        .boxed()
    }
}
