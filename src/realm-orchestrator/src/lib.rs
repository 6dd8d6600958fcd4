// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Contracts between the reconciliation loop and the systems around it.
//!
//! The loop is written once against these traits. Concrete implementations
//! live in `realm-orchestrator-kubernetes` (a cluster API) and
//! `realm-orchestrator-process` (processes on a single host).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};

use realm_types::{InstanceKey, Realm, RealmId, RealmStatus, SpecHash};

/// An orchestrator manages the resources backing realm instances.
///
/// All resources live within a namespace. The intent is that you can
/// implement `Orchestrator` with objects in Kubernetes, containers in Docker,
/// or processes on your local machine.
pub trait Orchestrator: fmt::Debug + Send + Sync {
    /// Enter a namespace in the orchestrator.
    fn namespace(&self, namespace: &str) -> Arc<dyn NamespacedOrchestrator>;
}

/// An orchestrator restricted to a single namespace.
///
/// Every method must be safe to retry: creation is a no-op if the resource
/// already exists and deletion is a no-op if it is already absent.
#[async_trait]
pub trait NamespacedOrchestrator: fmt::Debug + Send + Sync {
    /// Ensures that the configuration resource for the instance exists.
    ///
    /// An existing resource is left untouched.
    async fn ensure_config(&self, realm: &Realm, key: &InstanceKey) -> Result<(), anyhow::Error>;

    /// Ensures that the workload resource for the instance exists.
    ///
    /// An existing resource is left untouched.
    async fn ensure_workload(&self, realm: &Realm, key: &InstanceKey)
        -> Result<(), anyhow::Error>;

    /// Reports the state of every replica of the instance's workload.
    async fn is_workload_ready(&self, key: &InstanceKey)
        -> Result<WorkloadReadiness, anyhow::Error>;

    /// Points the realm's public route at the instance.
    ///
    /// This must be a single write: readers of the route observe either the
    /// previous target or the new one.
    async fn set_latest_route(&self, realm: &Realm, key: &InstanceKey)
        -> Result<(), anyhow::Error>;

    /// Drops the resources backing the instance, if they exist.
    async fn delete_instance_resources(&self, key: &InstanceKey) -> Result<(), anyhow::Error>;

    /// Drops every resource belonging to the realm, including its route.
    async fn delete_realm_resources(&self, realm_id: &RealmId) -> Result<(), anyhow::Error>;

    /// Lists the instances whose resources exist in this namespace.
    async fn list_observed_instances(&self) -> Result<Vec<ObservedInstance>, anyhow::Error>;
}

/// The state of one replica of an instance's workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    /// A name unique among the instance's replicas.
    pub name: String,
    /// The `host:port` at which the replica serves, once it is running.
    pub address: Option<String>,
    /// Whether the replica's process is running.
    pub running: bool,
    /// How often the platform has restarted the replica.
    pub restarts: u32,
    /// Set when the platform has given up on the replica, e.g. because it is
    /// crash-looping or its image cannot be pulled.
    pub failure: Option<String>,
    /// The most recent diagnostic output of the replica, if any.
    pub last_message: Option<String>,
}

/// The replicas of an instance's workload, as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadReadiness {
    /// The number of replicas the workload was created with.
    pub desired_replicas: u32,
    pub replicas: Vec<ReplicaState>,
}

impl WorkloadReadiness {
    /// Whether every desired replica exists and is running.
    pub fn all_running(&self) -> bool {
        let running = self.replicas.iter().filter(|r| r.running).count();
        u32::try_from(running).map_or(false, |running| running >= self.desired_replicas)
            && self.desired_replicas > 0
    }
}

/// An instance whose resources were found in the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedInstance {
    pub key: InstanceKey,
    pub namespace: String,
}

/// The kind of change a [`Notification`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// A realm was seen for the first time.
    Add,
    /// A realm's declared configuration changed, or was re-submitted.
    UpdateSpec,
    /// Something about a realm or one of its instances may have changed.
    Reconcile,
    /// A realm's declaration was removed.
    Delete,
}

/// A request to reconcile a realm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub realm_id: RealmId,
    /// The spec hash the change concerns, if the producer knows it.
    pub spec_hash: Option<SpecHash>,
}

impl Notification {
    pub fn new(kind: NotificationKind, realm_id: RealmId) -> Notification {
        Notification {
            kind,
            realm_id,
            spec_hash: None,
        }
    }

    pub fn reconcile(realm_id: RealmId) -> Notification {
        Notification::new(NotificationKind::Reconcile, realm_id)
    }

    pub fn with_spec_hash(mut self, spec_hash: SpecHash) -> Notification {
        self.spec_hash = Some(spec_hash);
        self
    }
}

/// Where desired realm configurations are declared.
#[async_trait]
pub trait RealmSource: fmt::Debug + Send + Sync {
    /// Reads the current declaration of a realm, bypassing any cache.
    async fn get(&self, realm_id: &RealmId) -> Result<Option<Realm>, anyhow::Error>;

    /// Lists every declared realm.
    async fn list(&self) -> Result<Vec<Realm>, anyhow::Error>;

    /// Streams notifications about declaration changes.
    fn watch(&self) -> BoxStream<'static, Notification>;
}

/// A value read from a [`StatusStore`], together with the version it was
/// read at.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct Versioned<T> {
    pub value: T,
    /// Opaque token that a subsequent write must present. `None` if the
    /// store has no record yet.
    #[derivative(Debug = "ignore")]
    pub version: Option<String>,
}

/// An error writing to a [`StatusStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The record changed since it was read.
    #[error("status record for {0} was modified concurrently")]
    Conflict(RealmId),
    /// The realm that owns the record no longer exists.
    #[error("no realm {0}")]
    NotFound(RealmId),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Durable storage for [`RealmStatus`] records, with optimistic concurrency.
#[async_trait]
pub trait StatusStore: fmt::Debug + Send + Sync {
    async fn read(&self, realm_id: &RealmId) -> Result<Option<Versioned<RealmStatus>>, StoreError>;

    /// Writes `status` if the stored record is still at `version`.
    ///
    /// A write either replaces the whole record or fails; readers never see
    /// a partial update.
    async fn write(&self, status: &RealmStatus, version: Option<&str>) -> Result<(), StoreError>;

    async fn remove(&self, realm_id: &RealmId) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<RealmStatus>, StoreError>;
}

/// The instance a realm's route was last switched to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestRecord {
    pub spec_hash: SpecHash,
    /// `None` for records that predate revision tracking; the highest
    /// observed revision of `spec_hash` stands in for it.
    #[serde(default)]
    pub revision: Option<u64>,
}

impl From<&InstanceKey> for LatestRecord {
    fn from(key: &InstanceKey) -> LatestRecord {
        LatestRecord {
            spec_hash: key.spec_hash.clone(),
            revision: Some(key.revision),
        }
    }
}

/// The persisted record of which instance is latest in each realm.
///
/// Only backends without native status storage need one.
#[async_trait]
pub trait RecoveryStore: fmt::Debug + Send + Sync {
    async fn load(&self) -> Result<BTreeMap<RealmId, LatestRecord>, anyhow::Error>;

    /// Records `key` as the latest instance of its realm.
    async fn record_latest(&self, key: &InstanceKey) -> Result<(), anyhow::Error>;

    async fn forget(&self, realm_id: &RealmId) -> Result<(), anyhow::Error>;
}
