// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory stand-ins for the systems the controller drives.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::mpsc;

use realm_controller::audit::{AuditLog, LifecycleEventKind};
use realm_controller::client::ReplicaClient;
use realm_controller::metrics::Metrics;
use realm_controller::readiness::ProbeConfig;
use realm_controller::recycle::RecycleConfig;
use realm_controller::store::InMemoryStatusStore;
use realm_controller::{Collaborators, Controller, ControllerConfig, Outcome};
use realm_orchestrator::{
    LatestRecord, NamespacedOrchestrator, Notification, NotificationKind, ObservedInstance,
    Orchestrator, RealmSource, RecoveryStore, ReplicaState, StatusStore, StoreError, Versioned,
    WorkloadReadiness,
};
use realm_types::{InstanceKey, Realm, RealmId, RealmSpec, RealmStatus, SpecHash};

/// How the replicas of a spec behave once started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    Healthy,
    /// The platform reports the given failure reason.
    Crash(String),
    /// Replicas never start running.
    Stuck,
}

/// A write made against the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    EnsureConfig(InstanceKey),
    EnsureWorkload(InstanceKey),
    SetRoute(InstanceKey),
    DeleteInstance(InstanceKey),
    DeleteRealm(RealmId),
}

#[derive(Debug, Default)]
struct BackendState {
    calls: Vec<Call>,
    workloads: BTreeMap<InstanceKey, (String, u32)>,
    behaviors: BTreeMap<SpecHash, Behavior>,
    routes: BTreeMap<RealmId, InstanceKey>,
    failing: bool,
}

/// A backend that keeps its resources in memory. Every namespace shares the
/// same state.
#[derive(Debug, Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn set_behavior(&self, hash: &SpecHash, behavior: Behavior) {
        let mut state = self.state.lock().unwrap();
        state.behaviors.insert(hash.clone(), behavior);
    }

    /// Makes every backend write fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn route(&self, realm_id: &str) -> Option<InstanceKey> {
        self.state.lock().unwrap().routes.get(&realm_id.into()).cloned()
    }

    pub fn workloads(&self) -> Vec<InstanceKey> {
        self.state.lock().unwrap().workloads.keys().cloned().collect()
    }

    fn write(&self, call: Call) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().unwrap();
        if state.failing {
            return Err(anyhow!("backend unavailable"));
        }
        state.calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl NamespacedOrchestrator for FakeBackend {
    async fn ensure_config(&self, _realm: &Realm, key: &InstanceKey) -> Result<(), anyhow::Error> {
        let exists = self.state.lock().unwrap().workloads.contains_key(key);
        if exists {
            return Ok(());
        }
        self.write(Call::EnsureConfig(key.clone()))
    }

    async fn ensure_workload(&self, realm: &Realm, key: &InstanceKey) -> Result<(), anyhow::Error> {
        let exists = self.state.lock().unwrap().workloads.contains_key(key);
        if exists {
            return Ok(());
        }
        self.write(Call::EnsureWorkload(key.clone()))?;
        self.state
            .lock()
            .unwrap()
            .workloads
            .insert(key.clone(), (realm.namespace.clone(), realm.spec.replicas));
        Ok(())
    }

    async fn is_workload_ready(&self, key: &InstanceKey) -> Result<WorkloadReadiness, anyhow::Error> {
        let state = self.state.lock().unwrap();
        let Some((_, desired)) = state.workloads.get(key) else {
            return Ok(WorkloadReadiness::default());
        };
        let behavior = state
            .behaviors
            .get(&key.spec_hash)
            .cloned()
            .unwrap_or(Behavior::Healthy);
        let replicas = (0..*desired)
            .map(|i| ReplicaState {
                name: format!("{}-{i}", key.resource_name()),
                address: Some(replica_address(key, i)),
                running: behavior == Behavior::Healthy,
                restarts: 0,
                failure: match &behavior {
                    Behavior::Crash(reason) => Some(reason.clone()),
                    _ => None,
                },
                last_message: None,
            })
            .collect();
        Ok(WorkloadReadiness {
            desired_replicas: *desired,
            replicas,
        })
    }

    async fn set_latest_route(&self, realm: &Realm, key: &InstanceKey) -> Result<(), anyhow::Error> {
        self.write(Call::SetRoute(key.clone()))?;
        self.state
            .lock()
            .unwrap()
            .routes
            .insert(realm.realm_id.clone(), key.clone());
        Ok(())
    }

    async fn delete_instance_resources(&self, key: &InstanceKey) -> Result<(), anyhow::Error> {
        self.write(Call::DeleteInstance(key.clone()))?;
        self.state.lock().unwrap().workloads.remove(key);
        Ok(())
    }

    async fn delete_realm_resources(&self, realm_id: &RealmId) -> Result<(), anyhow::Error> {
        self.write(Call::DeleteRealm(realm_id.clone()))?;
        let mut state = self.state.lock().unwrap();
        state.workloads.retain(|key, _| &key.realm_id != realm_id);
        state.routes.remove(realm_id);
        Ok(())
    }

    async fn list_observed_instances(&self) -> Result<Vec<ObservedInstance>, anyhow::Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .workloads
            .iter()
            .map(|(key, (namespace, _))| ObservedInstance {
                key: key.clone(),
                namespace: namespace.clone(),
            })
            .collect())
    }
}

#[derive(Debug)]
pub struct FakeOrchestrator(pub Arc<FakeBackend>);

impl Orchestrator for FakeOrchestrator {
    fn namespace(&self, _namespace: &str) -> Arc<dyn NamespacedOrchestrator> {
        Arc::clone(&self.0) as Arc<dyn NamespacedOrchestrator>
    }
}

pub fn replica_address(key: &InstanceKey, replica: u32) -> String {
    format!("{}-{replica}:8080", key.resource_name())
}

/// Replicas that are always healthy and report configurable session counts.
#[derive(Debug, Default)]
pub struct FakeReplicaClient {
    sessions: Mutex<BTreeMap<String, u64>>,
    unreachable: Mutex<BTreeSet<String>>,
}

impl FakeReplicaClient {
    pub fn set_sessions(&self, key: &InstanceKey, sessions: u64) {
        self.sessions
            .lock()
            .unwrap()
            .insert(replica_address(key, 0), sessions);
    }

    pub fn set_unreachable(&self, key: &InstanceKey, unreachable: bool) {
        let mut set = self.unreachable.lock().unwrap();
        if unreachable {
            set.insert(replica_address(key, 0));
        } else {
            set.remove(&replica_address(key, 0));
        }
    }
}

#[async_trait]
impl ReplicaClient for FakeReplicaClient {
    async fn health(&self, _address: &str) -> Result<bool, anyhow::Error> {
        Ok(true)
    }

    async fn active_sessions(&self, address: &str) -> Result<u64, anyhow::Error> {
        if self.unreachable.lock().unwrap().contains(address) {
            return Err(anyhow!("connection refused"));
        }
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(0))
    }
}

#[derive(Debug, Default)]
pub struct FakeRealmSource {
    realms: Mutex<BTreeMap<RealmId, Realm>>,
}

impl FakeRealmSource {
    pub fn put(&self, realm: Realm) {
        self.realms
            .lock()
            .unwrap()
            .insert(realm.realm_id.clone(), realm);
    }

    pub fn remove(&self, realm_id: &str) {
        self.realms.lock().unwrap().remove(&realm_id.into());
    }
}

#[async_trait]
impl RealmSource for FakeRealmSource {
    async fn get(&self, realm_id: &RealmId) -> Result<Option<Realm>, anyhow::Error> {
        Ok(self.realms.lock().unwrap().get(realm_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Realm>, anyhow::Error> {
        Ok(self.realms.lock().unwrap().values().cloned().collect())
    }

    fn watch(&self) -> BoxStream<'static, Notification> {
        stream::empty().boxed()
    }
}

/// Counts writes and listings, and can be told to reject the next few of them.
#[derive(Debug, Default)]
pub struct TestStore {
    inner: InMemoryStatusStore,
    writes: AtomicUsize,
    lists: AtomicUsize,
    conflicts: AtomicUsize,
}

impl TestStore {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn inject_conflicts(&self, n: usize) {
        self.conflicts.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl StatusStore for TestStore {
    async fn read(&self, realm_id: &RealmId) -> Result<Option<Versioned<RealmStatus>>, StoreError> {
        self.inner.read(realm_id).await
    }

    async fn write(&self, status: &RealmStatus, version: Option<&str>) -> Result<(), StoreError> {
        let injected = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Conflict(status.realm_id.clone()));
        }
        self.inner.write(status, version).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, realm_id: &RealmId) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(realm_id).await
    }

    async fn list(&self) -> Result<Vec<RealmStatus>, StoreError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.inner.list().await
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecoveryStore {
    latest: Mutex<BTreeMap<RealmId, LatestRecord>>,
}

#[async_trait]
impl RecoveryStore for MemoryRecoveryStore {
    async fn load(&self) -> Result<BTreeMap<RealmId, LatestRecord>, anyhow::Error> {
        Ok(self.latest.lock().unwrap().clone())
    }

    async fn record_latest(&self, key: &InstanceKey) -> Result<(), anyhow::Error> {
        self.latest
            .lock()
            .unwrap()
            .insert(key.realm_id.clone(), LatestRecord::from(key));
        Ok(())
    }

    async fn forget(&self, realm_id: &RealmId) -> Result<(), anyhow::Error> {
        self.latest.lock().unwrap().remove(realm_id);
        Ok(())
    }
}

pub fn spec(image: &str) -> RealmSpec {
    RealmSpec {
        image: image.into(),
        ..Default::default()
    }
}

pub fn realm(id: &str, image: &str) -> Realm {
    Realm::new(id.into(), "default", spec(image))
}

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        probe: ProbeConfig {
            attempts: 5,
            interval: Duration::from_secs(1),
        },
        recycle: RecycleConfig {
            attempts: 2,
            timeout: Duration::from_millis(500),
            interval: Duration::from_millis(100),
            force: false,
        },
        ..Default::default()
    }
}

/// A controller wired to fakes.
pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub source: Arc<FakeRealmSource>,
    pub store: Arc<TestStore>,
    pub recovery: Arc<MemoryRecoveryStore>,
    pub client: Arc<FakeReplicaClient>,
    pub controller: Controller,
    pub queue: mpsc::Receiver<Notification>,
}

impl Harness {
    pub fn new() -> Harness {
        Harness::build(
            test_config(),
            Arc::default(),
            Arc::default(),
            Arc::default(),
            Arc::default(),
        )
    }

    pub fn with_config(config: ControllerConfig) -> Harness {
        Harness::build(
            config,
            Arc::default(),
            Arc::default(),
            Arc::default(),
            Arc::default(),
        )
    }

    /// A new controller that lost its status store but shares everything
    /// else with this one.
    pub fn restart(self) -> Harness {
        Harness::build(
            test_config(),
            self.backend,
            self.source,
            self.recovery,
            self.client,
        )
    }

    fn build(
        config: ControllerConfig,
        backend: Arc<FakeBackend>,
        source: Arc<FakeRealmSource>,
        recovery: Arc<MemoryRecoveryStore>,
        client: Arc<FakeReplicaClient>,
    ) -> Harness {
        let store = Arc::new(TestStore::default());
        let (tx, queue) = mpsc::channel(1024);
        let controller = Controller::new(
            config,
            Collaborators {
                orchestrator: Arc::new(FakeOrchestrator(Arc::clone(&backend))),
                source: Arc::clone(&source) as Arc<dyn RealmSource>,
                store: Arc::clone(&store) as Arc<dyn StatusStore>,
                recovery: Some(Arc::clone(&recovery) as Arc<dyn RecoveryStore>),
                replica_client: Arc::clone(&client) as Arc<dyn ReplicaClient>,
            },
            Arc::new(AuditLog::new()),
            Metrics::unregistered(),
            tx,
        );
        Harness {
            backend,
            source,
            store,
            recovery,
            client,
            controller,
            queue,
        }
    }

    pub async fn notify(&self, kind: NotificationKind, realm_id: &str) -> Outcome {
        self.controller
            .handle(&Notification::new(kind, realm_id.into()))
            .await
            .unwrap()
    }

    /// Declares `realm` and delivers the matching notification.
    pub async fn declare(&self, realm: Realm) -> Outcome {
        let id = realm.realm_id.clone();
        let known = self.source.get(&id).await.unwrap().is_some();
        self.source.put(realm);
        let kind = if known {
            NotificationKind::UpdateSpec
        } else {
            NotificationKind::Add
        };
        self.notify(kind, id.as_str()).await
    }

    /// Reconciles `realm_id` until no instance is in a transient phase.
    pub async fn converge(&self, realm_id: &str) {
        for _ in 0..100 {
            let outcome = self.notify(NotificationKind::Reconcile, realm_id).await;
            if outcome.requeue_after.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        panic!("realm {realm_id} did not settle");
    }

    /// Runs `passes` reconciles one simulated second apart.
    pub async fn tick(&self, realm_id: &str, passes: usize) {
        for _ in 0..passes {
            self.notify(NotificationKind::Reconcile, realm_id).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    pub async fn status(&self, realm_id: &str) -> RealmStatus {
        self.controller
            .status(&realm_id.into())
            .await
            .unwrap()
            .expect("realm has a status")
    }

    pub fn events(&self, kind: LifecycleEventKind, key: &InstanceKey) -> usize {
        self.controller.audit().count(kind, key)
    }
}

pub fn key(realm_id: &str, realm: &Realm, revision: u64) -> InstanceKey {
    InstanceKey::new(realm_id.into(), realm.spec_hash.clone(), revision)
}
