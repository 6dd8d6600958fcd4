// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Rebuilding realm status after a restart.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use tracing::info;

use realm_orchestrator::{LatestRecord, Notification, NotificationKind, ObservedInstance};
use realm_types::{Instance, InstanceKey, InstancePhase, RealmId, RealmStatus, SpecHash};

use crate::controller::Controller;
use crate::error::Error;

impl Controller {
    /// Reconstructs the status of every realm that has running instances but
    /// no stored status, and returns the notifications that bring each known
    /// realm back under control.
    ///
    /// Realms whose declaration disappeared while the controller was down
    /// are scheduled for deletion.
    pub async fn recover(&self) -> Result<Vec<Notification>, Error> {
        let realms = self.source.list().await.map_err(Error::Recovery)?;
        let latest = match &self.recovery {
            Some(recovery) => recovery.load().await.map_err(Error::Recovery)?,
            None => BTreeMap::new(),
        };

        let mut namespaces: BTreeSet<String> =
            realms.iter().map(|r| r.namespace.clone()).collect();
        namespaces.insert(self.config.default_namespace.clone());
        let mut observed: BTreeMap<RealmId, Vec<ObservedInstance>> = BTreeMap::new();
        for namespace in namespaces {
            let instances = self
                .orchestrator
                .namespace(&namespace)
                .list_observed_instances()
                .await
                .map_err(Error::Recovery)?;
            for instance in instances {
                observed
                    .entry(instance.key.realm_id.clone())
                    .or_default()
                    .push(instance);
            }
        }

        let mut notifications = Vec::new();
        for realm in &realms {
            let instances = observed.remove(&realm.realm_id).unwrap_or_default();
            if !instances.is_empty() && self.store.read(&realm.realm_id).await?.is_none() {
                let status = rebuild_status(
                    &realm.realm_id,
                    &realm.namespace,
                    Some(&realm.spec_hash),
                    &instances,
                    latest.get(&realm.realm_id),
                );
                info!(realm_id = %realm.realm_id, instances = status.instances.len(), "recovered realm status");
                self.store.write(&status, None).await?;
            }
            notifications.push(Notification::reconcile(realm.realm_id.clone()));
        }

        for (realm_id, instances) in observed {
            if self.store.read(&realm_id).await?.is_none() {
                let namespace = instances
                    .first()
                    .map_or_else(|| self.config.default_namespace.clone(), |i| i.namespace.clone());
                let status =
                    rebuild_status(&realm_id, &namespace, None, &instances, latest.get(&realm_id));
                self.store.write(&status, None).await?;
            }
            info!(%realm_id, "realm declaration removed while stopped");
            notifications.push(Notification::new(NotificationKind::Delete, realm_id));
        }
        Ok(notifications)
    }
}

/// Derives a realm's status from the instances a backend reports.
///
/// The recorded instance is the latest one. Records without a revision
/// fall back to the highest observed revision of the recorded spec. The
/// newest instance of the desired spec, if it is newer than the latest, is
/// still being provisioned. Everything else is draining.
pub fn rebuild_status(
    realm_id: &RealmId,
    namespace: &str,
    desired: Option<&SpecHash>,
    observed: &[ObservedInstance],
    latest: Option<&LatestRecord>,
) -> RealmStatus {
    let latest_key = latest.and_then(|record| match record.revision {
        Some(revision) => observed
            .iter()
            .map(|o| &o.key)
            .find(|k| k.spec_hash == record.spec_hash && k.revision == revision)
            .cloned(),
        None => newest(observed, &record.spec_hash, None),
    });
    let candidate = desired
        .and_then(|hash| newest(observed, hash, latest_key.as_ref()))
        .filter(|key| match &latest_key {
            Some(l) => l.spec_hash != key.spec_hash || key.revision > l.revision,
            None => true,
        });

    let mut status = RealmStatus::new(realm_id.clone(), namespace);
    status.current_spec_hash = latest.map(|record| record.spec_hash.clone());
    let now = Utc::now();
    for instance in observed {
        let key = &instance.key;
        let mut recovered = Instance::new(key.clone(), now);
        recovered.phase = if Some(key) == latest_key.as_ref() {
            recovered.is_latest = true;
            InstancePhase::Latest
        } else if Some(key) == candidate.as_ref() {
            InstancePhase::Provisioning
        } else {
            InstancePhase::Draining
        };
        status.insert_instance(recovered);
    }
    status
}

fn newest(
    observed: &[ObservedInstance],
    hash: &SpecHash,
    except: Option<&InstanceKey>,
) -> Option<InstanceKey> {
    observed
        .iter()
        .map(|o| &o.key)
        .filter(|k| &k.spec_hash == hash && Some(*k) != except)
        .max_by_key(|k| k.revision)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(hash: &str, revision: u64) -> ObservedInstance {
        ObservedInstance {
            key: InstanceKey::new("r1".into(), hash.into(), revision),
            namespace: "default".into(),
        }
    }

    fn record(hash: &str, revision: Option<u64>) -> LatestRecord {
        LatestRecord {
            spec_hash: hash.into(),
            revision,
        }
    }

    fn phase(status: &RealmStatus, hash: &str, revision: u64) -> InstancePhase {
        status
            .instance(&InstanceKey::new("r1".into(), hash.into(), revision))
            .map(|i| i.phase)
            .unwrap()
    }

    #[test]
    fn mid_rollout() {
        let status = rebuild_status(
            &"r1".into(),
            "default",
            Some(&"h2".into()),
            &[observed("h1", 0), observed("h2", 0)],
            Some(&record("h1", Some(0))),
        );
        assert_eq!(phase(&status, "h1", 0), InstancePhase::Latest);
        assert!(status.latest().is_some_and(|i| i.spec_hash == "h1".into()));
        assert_eq!(phase(&status, "h2", 0), InstancePhase::Provisioning);
        assert_eq!(status.current_spec_hash, Some("h1".into()));
        assert_eq!(status.next_revision(&"h2".into()), 1);
    }

    #[test]
    fn older_revisions_drain() {
        let status = rebuild_status(
            &"r1".into(),
            "default",
            Some(&"h1".into()),
            &[observed("h1", 0), observed("h1", 1), observed("h3", 0)],
            Some(&record("h1", Some(1))),
        );
        assert_eq!(phase(&status, "h1", 1), InstancePhase::Latest);
        assert_eq!(phase(&status, "h1", 0), InstancePhase::Draining);
        assert_eq!(phase(&status, "h3", 0), InstancePhase::Draining);
        assert_eq!(status.latest_count(), 1);
    }

    #[test]
    fn without_a_record_nothing_is_latest() {
        let status = rebuild_status(
            &"r1".into(),
            "default",
            Some(&"h2".into()),
            &[observed("h1", 0), observed("h2", 0), observed("h2", 1)],
            None,
        );
        assert_eq!(status.latest_count(), 0);
        assert_eq!(phase(&status, "h2", 1), InstancePhase::Provisioning);
        assert_eq!(phase(&status, "h2", 0), InstancePhase::Draining);
        assert_eq!(phase(&status, "h1", 0), InstancePhase::Draining);
    }

    #[test]
    fn recorded_revision_stays_latest_during_a_revert() {
        // h1 was reverted to after h2 was declared. The new h1 instance has
        // not become ready, so the route still points at h1 revision 0.
        let status = rebuild_status(
            &"r1".into(),
            "default",
            Some(&"h1".into()),
            &[observed("h1", 0), observed("h1", 1), observed("h2", 0)],
            Some(&record("h1", Some(0))),
        );
        assert_eq!(phase(&status, "h1", 0), InstancePhase::Latest);
        assert_eq!(phase(&status, "h1", 1), InstancePhase::Provisioning);
        assert_eq!(phase(&status, "h2", 0), InstancePhase::Draining);
        assert_eq!(status.latest_count(), 1);
        assert_eq!(status.next_revision(&"h1".into()), 2);
    }

    #[test]
    fn records_without_a_revision_use_the_newest() {
        let status = rebuild_status(
            &"r1".into(),
            "default",
            Some(&"h1".into()),
            &[observed("h1", 0), observed("h1", 1)],
            Some(&record("h1", None)),
        );
        assert_eq!(phase(&status, "h1", 1), InstancePhase::Latest);
        assert_eq!(phase(&status, "h1", 0), InstancePhase::Draining);
    }

    #[test]
    fn a_recorded_instance_that_is_gone_leaves_nothing_latest() {
        let status = rebuild_status(
            &"r1".into(),
            "default",
            Some(&"h1".into()),
            &[observed("h1", 1)],
            Some(&record("h1", Some(0))),
        );
        assert_eq!(status.latest_count(), 0);
        assert_eq!(phase(&status, "h1", 1), InstancePhase::Provisioning);
    }
}
