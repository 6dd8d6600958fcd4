// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{InstanceKey, RealmId, SpecHash};

/// Where an instance is in its lifecycle.
///
/// Deleted instances are removed from [`RealmStatus::instances`] rather than
/// kept with a terminal phase.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum InstancePhase {
    /// No backing resources have been requested yet.
    Pending,
    /// Config and workload resources were requested but are not yet healthy.
    Provisioning,
    /// The workload is healthy but has not been promoted.
    ReadyNotLatest,
    /// The public route points at this instance.
    Latest,
    /// Superseded; waiting until the instance can be recycled.
    Draining,
    /// The workload never became healthy. Terminal.
    Failed,
}

impl InstancePhase {
    pub const ALL: [InstancePhase; 6] = [
        InstancePhase::Pending,
        InstancePhase::Provisioning,
        InstancePhase::ReadyNotLatest,
        InstancePhase::Latest,
        InstancePhase::Draining,
        InstancePhase::Failed,
    ];

    /// Whether an instance in this phase still needs attention from the
    /// reconciliation loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InstancePhase::Pending
                | InstancePhase::Provisioning
                | InstancePhase::ReadyNotLatest
                | InstancePhase::Draining
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstancePhase::Pending => "pending",
            InstancePhase::Provisioning => "provisioning",
            InstancePhase::ReadyNotLatest => "ready_not_latest",
            InstancePhase::Latest => "latest",
            InstancePhase::Draining => "draining",
            InstancePhase::Failed => "failed",
        }
    }
}

impl fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt to run a realm's configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub realm_id: RealmId,
    pub spec_hash: SpecHash,
    pub revision: u64,
    pub is_latest: bool,
    pub phase: InstancePhase,
    /// The last diagnostic of a failed instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(key: InstanceKey, created_at: DateTime<Utc>) -> Instance {
        Instance {
            realm_id: key.realm_id,
            spec_hash: key.spec_hash,
            revision: key.revision,
            is_latest: false,
            phase: InstancePhase::Pending,
            failure: None,
            created_at,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(
            self.realm_id.clone(),
            self.spec_hash.clone(),
            self.revision,
        )
    }

    fn is(&self, key: &InstanceKey) -> bool {
        self.realm_id == key.realm_id
            && self.spec_hash == key.spec_hash
            && self.revision == key.revision
    }
}

/// The observable state of a realm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RealmStatus {
    pub realm_id: RealmId,
    pub namespace: String,
    /// The spec hash the realm was last reconciled towards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_spec_hash: Option<SpecHash>,
    #[serde(default)]
    pub instances: Vec<Instance>,
    /// The highest revision ever allocated for each spec hash.
    #[serde(default)]
    pub revisions: BTreeMap<SpecHash, u64>,
}

impl RealmStatus {
    pub fn new(realm_id: RealmId, namespace: impl Into<String>) -> RealmStatus {
        RealmStatus {
            realm_id,
            namespace: namespace.into(),
            current_spec_hash: None,
            instances: Vec::new(),
            revisions: BTreeMap::new(),
        }
    }

    pub fn instance(&self, key: &InstanceKey) -> Option<&Instance> {
        self.instances.iter().find(|i| i.is(key))
    }

    pub fn instance_mut(&mut self, key: &InstanceKey) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.is(key))
    }

    pub fn latest(&self) -> Option<&Instance> {
        self.instances.iter().find(|i| i.is_latest)
    }

    pub fn instances_for<'a>(&'a self, hash: &'a SpecHash) -> impl Iterator<Item = &'a Instance> {
        self.instances.iter().filter(move |i| &i.spec_hash == hash)
    }

    /// The revision the next instance for `hash` must use.
    pub fn next_revision(&self, hash: &SpecHash) -> u64 {
        self.revisions.get(hash).map_or(0, |r| r + 1)
    }

    /// Adds a new pending instance for `hash` and returns its key.
    pub fn allocate_instance(&mut self, hash: &SpecHash, now: DateTime<Utc>) -> InstanceKey {
        let key = InstanceKey::new(self.realm_id.clone(), hash.clone(), self.next_revision(hash));
        self.insert_instance(Instance::new(key.clone(), now));
        key
    }

    /// Inserts `instance` unless an instance with the same key already
    /// exists, recording its revision as allocated.
    pub fn insert_instance(&mut self, instance: Instance) {
        let key = instance.key();
        let allocated = self.revisions.entry(key.spec_hash.clone()).or_insert(key.revision);
        *allocated = (*allocated).max(key.revision);
        if self.instance(&key).is_none() {
            self.instances.push(instance);
        }
    }

    /// Marks `key` as the only latest instance. Any instance that was latest
    /// before starts draining.
    pub fn promote(&mut self, key: &InstanceKey) {
        for instance in &mut self.instances {
            if instance.is(key) {
                instance.is_latest = true;
                instance.phase = InstancePhase::Latest;
            } else if instance.is_latest || instance.phase == InstancePhase::Latest {
                instance.is_latest = false;
                instance.phase = InstancePhase::Draining;
            }
        }
    }

    pub fn remove_instance(&mut self, key: &InstanceKey) -> Option<Instance> {
        let index = self.instances.iter().position(|i| i.is(key))?;
        Some(self.instances.remove(index))
    }

    /// The number of instances marked latest. At rest this is at most one.
    pub fn latest_count(&self) -> usize {
        self.instances.iter().filter(|i| i.is_latest).count()
    }
}
