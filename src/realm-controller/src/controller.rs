// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The reconciliation loop and the instance lifecycle state machine.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

use realm_orchestrator::{
    NamespacedOrchestrator, Notification, NotificationKind, Orchestrator, RealmSource,
    RecoveryStore, StatusStore, StoreError,
};
use realm_types::{Instance, InstanceKey, InstancePhase, Realm, RealmId, RealmStatus, SpecHash};

use crate::audit::{AuditLog, LifecycleEvent, LifecycleEventKind};
use crate::client::ReplicaClient;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::readiness::{ProbeConfig, ReadinessProber, Readiness};
use crate::recycle::{RecyclabilityChecker, RecycleConfig};

/// Configures a [`Controller`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// The namespace used for realms whose namespace is no longer known.
    pub default_namespace: String,
    /// How often a status write is attempted before giving up.
    pub status_write_attempts: usize,
    /// Delay before a realm with unsettled instances is reconciled again.
    pub requeue_interval: Duration,
    /// Delay before a realm whose pass failed is reconciled again.
    pub error_requeue: Duration,
    pub probe: ProbeConfig,
    pub recycle: RecycleConfig,
    /// How often the realm and instance gauges are refreshed from a full
    /// listing of statuses.
    pub metrics_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            default_namespace: "default".into(),
            status_write_attempts: 5,
            requeue_interval: Duration::from_secs(2),
            error_requeue: Duration::from_secs(5),
            probe: ProbeConfig::default(),
            recycle: RecycleConfig::default(),
            metrics_interval: Duration::from_secs(30),
        }
    }
}

/// The systems a [`Controller`] drives and reads from.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub orchestrator: Arc<dyn Orchestrator>,
    pub source: Arc<dyn RealmSource>,
    pub store: Arc<dyn StatusStore>,
    /// Only needed when `store` does not survive restarts.
    pub recovery: Option<Arc<dyn RecoveryStore>>,
    pub replica_client: Arc<dyn ReplicaClient>,
}

/// What should happen after a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    pub requeue_after: Option<Duration>,
}

/// Drives realms towards their declared configuration.
///
/// Notifications are handled one at a time. Readiness and recyclability
/// checks run in the background and are only ever observed through
/// snapshots, so a pass never blocks on a slow replica.
#[derive(Debug)]
pub struct Controller {
    pub(crate) config: ControllerConfig,
    pub(crate) orchestrator: Arc<dyn Orchestrator>,
    pub(crate) source: Arc<dyn RealmSource>,
    pub(crate) store: Arc<dyn StatusStore>,
    pub(crate) recovery: Option<Arc<dyn RecoveryStore>>,
    prober: ReadinessProber,
    recycler: RecyclabilityChecker,
    audit: Arc<AuditLog>,
    metrics: Metrics,
    queue: mpsc::Sender<Notification>,
    scheduled: Arc<Mutex<BTreeSet<RealmId>>>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        collaborators: Collaborators,
        audit: Arc<AuditLog>,
        metrics: Metrics,
        queue: mpsc::Sender<Notification>,
    ) -> Controller {
        let Collaborators {
            orchestrator,
            source,
            store,
            recovery,
            replica_client,
        } = collaborators;
        let prober = ReadinessProber::new(config.probe.clone(), Arc::clone(&replica_client));
        let recycler = RecyclabilityChecker::new(config.recycle.clone(), replica_client);
        Controller {
            config,
            orchestrator,
            source,
            store,
            recovery,
            prober,
            recycler,
            audit,
            metrics,
            queue,
            scheduled: Arc::default(),
        }
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn prober(&self) -> &ReadinessProber {
        &self.prober
    }

    /// Consumes notifications until the queue closes or a fatal error occurs.
    pub async fn run(&self, mut queue: mpsc::Receiver<Notification>) -> Result<(), Error> {
        info!("reconciliation loop started");
        let mut metrics_refreshed: Option<Instant> = None;
        while let Some(notification) = queue.recv().await {
            let realm_id = notification.realm_id.clone();
            match self.handle(&notification).await {
                Ok(Outcome {
                    requeue_after: Some(after),
                }) => self.requeue(realm_id, after),
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(%realm_id, "fatal reconciliation error: {e}");
                    return Err(e);
                }
                Err(e) => {
                    self.metrics.reconcile_errors.inc();
                    warn!(%realm_id, "reconciliation failed, will retry: {e}");
                    self.requeue(realm_id, self.config.error_requeue);
                }
            }
            let due = metrics_refreshed
                .map_or(true, |at| at.elapsed() >= self.config.metrics_interval);
            if due {
                self.refresh_metrics().await;
                metrics_refreshed = Some(Instant::now());
            }
        }
        info!("notification queue closed");
        Ok(())
    }

    /// Resets the realm and instance gauges from the stored statuses.
    pub async fn refresh_metrics(&self) {
        match self.store.list().await {
            Ok(statuses) => self.metrics.observe(&statuses),
            Err(e) => debug!("failed to list statuses for metrics: {e}"),
        }
    }

    /// Enqueues a reconcile of `realm_id` after `after`, unless one is
    /// already scheduled.
    fn requeue(&self, realm_id: RealmId, after: Duration) {
        if !self
            .scheduled
            .lock()
            .expect("lock poisoned")
            .insert(realm_id.clone())
        {
            return;
        }
        trace!(%realm_id, ?after, "scheduling requeue");
        let queue = self.queue.clone();
        let scheduled = Arc::clone(&self.scheduled);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            scheduled.lock().expect("lock poisoned").remove(&realm_id);
            let _ = queue.send(Notification::reconcile(realm_id)).await;
        });
    }

    /// Runs one reconciliation pass for the realm named by `notification`.
    #[instrument(skip_all, fields(realm_id = %notification.realm_id, kind = ?notification.kind))]
    pub async fn handle(&self, notification: &Notification) -> Result<Outcome, Error> {
        let realm = self
            .source
            .get(&notification.realm_id)
            .await
            .map_err(Error::Backend)?;
        match realm {
            Some(realm) => self.reconcile_realm(&realm, notification).await,
            None => self.delete_realm(&notification.realm_id).await,
        }
    }

    async fn reconcile_realm(
        &self,
        realm: &Realm,
        notification: &Notification,
    ) -> Result<Outcome, Error> {
        if let Err(e) = realm.spec.validate() {
            warn!("rejecting realm declaration: {e}");
            self.audit.record(LifecycleEvent::invalid_spec(
                &realm.realm_id,
                &realm.spec_hash,
                e.to_string(),
            ));
            return Ok(Outcome::default());
        }

        let backend = self.orchestrator.namespace(&realm.namespace);
        let status = match self.store.read(&realm.realm_id).await? {
            Some(stored) => stored.value,
            None => RealmStatus::new(realm.realm_id.clone(), realm.namespace.clone()),
        };
        let mut pass = Pass::new(status);
        let desired = &realm.spec_hash;

        if needs_new_instance(&pass.status, desired, notification) {
            let key = InstanceKey::new(
                realm.realm_id.clone(),
                desired.clone(),
                pass.status.next_revision(desired),
            );
            info!(instance = %key, "starting new instance");
            pass.apply(StatusChange::Create(Instance::new(key.clone(), Utc::now())));
            pass.effects.push(Effect::Created(key));
        }
        if pass.status.current_spec_hash.as_ref() != Some(desired) {
            pass.apply(StatusChange::SetCurrentSpecHash(desired.clone()));
        }

        let keys: Vec<_> = pass.status.instances.iter().map(Instance::key).collect();
        for key in keys {
            let Some(phase) = pass.status.instance(&key).map(|i| i.phase) else {
                continue;
            };
            match phase {
                InstancePhase::Pending | InstancePhase::Provisioning => {
                    self.advance_provisioning(realm, &backend, &mut pass, &key, phase)
                        .await?
                }
                InstancePhase::ReadyNotLatest => {
                    self.advance_ready(realm, &backend, &mut pass, &key).await?
                }
                InstancePhase::Latest | InstancePhase::Draining | InstancePhase::Failed => {}
            }
        }

        self.collect_garbage(realm, &backend, &mut pass).await?;

        let outcome = Outcome {
            requeue_after: pass
                .status
                .instances
                .iter()
                .any(|i| i.phase.is_transient())
                .then_some(self.config.requeue_interval),
        };
        self.commit(pass).await?;
        Ok(outcome)
    }

    async fn advance_provisioning(
        &self,
        realm: &Realm,
        backend: &Arc<dyn NamespacedOrchestrator>,
        pass: &mut Pass,
        key: &InstanceKey,
        phase: InstancePhase,
    ) -> Result<(), Error> {
        let desired = key.spec_hash == realm.spec_hash;
        if !desired && phase == InstancePhase::Pending {
            info!(instance = %key, "abandoning instance superseded before provisioning");
            backend.delete_instance_resources(key).await?;
            self.forget(key);
            pass.apply(StatusChange::Remove(key.clone()));
            pass.effects.push(Effect::Deleted(key.clone()));
            return Ok(());
        }

        // Only the desired spec is known here; a superseded instance that is
        // already provisioning is left to finish on its own.
        if desired {
            backend.ensure_config(realm, key).await?;
            backend.ensure_workload(realm, key).await?;
        }
        if phase == InstancePhase::Pending {
            pass.apply(StatusChange::SetPhase {
                key: key.clone(),
                phase: InstancePhase::Provisioning,
                failure: None,
            });
        }

        match self.prober.probe(key, Arc::clone(backend)) {
            Readiness::Wip => {
                trace!(instance = %key, "instance not ready yet");
                Ok(())
            }
            Readiness::Failed(message) => self.fail_instance(backend, pass, key, message).await,
            Readiness::Ready => {
                pass.apply(StatusChange::SetPhase {
                    key: key.clone(),
                    phase: InstancePhase::ReadyNotLatest,
                    failure: None,
                });
                self.advance_ready(realm, backend, pass, key).await
            }
        }
    }

    async fn advance_ready(
        &self,
        realm: &Realm,
        backend: &Arc<dyn NamespacedOrchestrator>,
        pass: &mut Pass,
        key: &InstanceKey,
    ) -> Result<(), Error> {
        if key.spec_hash == realm.spec_hash {
            return self.promote(realm, backend, pass, key).await;
        }
        // Superseded while starting up. The latest marker stays where it is.
        debug!(instance = %key, "ready instance is no longer desired");
        pass.apply(StatusChange::SetPhase {
            key: key.clone(),
            phase: InstancePhase::Draining,
            failure: None,
        });
        Ok(())
    }

    /// Points the route at `key` and marks it as the only latest instance.
    ///
    /// The route is switched first, so that it only ever names an instance
    /// that was observed ready. The latest marker follows in the same status
    /// write as every other change of this pass.
    async fn promote(
        &self,
        realm: &Realm,
        backend: &Arc<dyn NamespacedOrchestrator>,
        pass: &mut Pass,
        key: &InstanceKey,
    ) -> Result<(), Error> {
        info!(instance = %key, "promoting instance to latest");
        backend.set_latest_route(realm, key).await?;
        if let Some(recovery) = &self.recovery {
            recovery.record_latest(key).await?;
        }
        pass.apply(StatusChange::Promote(key.clone()));
        pass.effects.push(Effect::Promoted(key.clone()));
        Ok(())
    }

    async fn fail_instance(
        &self,
        backend: &Arc<dyn NamespacedOrchestrator>,
        pass: &mut Pass,
        key: &InstanceKey,
        message: String,
    ) -> Result<(), Error> {
        warn!(instance = %key, "instance failed to start: {message}");
        backend.delete_instance_resources(key).await?;
        pass.apply(StatusChange::SetPhase {
            key: key.clone(),
            phase: InstancePhase::Failed,
            failure: Some(message.clone()),
        });
        pass.effects.push(Effect::Failed(key.clone(), message));
        Ok(())
    }

    /// Tears down draining instances that have no active sessions left, and
    /// prunes failure records of specs that are no longer desired.
    async fn collect_garbage(
        &self,
        realm: &Realm,
        backend: &Arc<dyn NamespacedOrchestrator>,
        pass: &mut Pass,
    ) -> Result<(), Error> {
        let instances = pass.status.instances.clone();
        for instance in instances {
            let key = instance.key();
            match instance.phase {
                InstancePhase::Draining if !instance.is_latest => {
                    match self.recycler.check(&key, Arc::clone(backend)) {
                        Some(true) => {
                            backend.delete_instance_resources(&key).await?;
                            self.forget(&key);
                            pass.apply(StatusChange::Remove(key.clone()));
                            pass.effects.push(Effect::Deleted(key));
                        }
                        Some(false) => debug!(instance = %key, "instance is still in use"),
                        None => trace!(instance = %key, "recyclability check in progress"),
                    }
                }
                InstancePhase::Failed if instance.spec_hash != realm.spec_hash => {
                    debug!(instance = %key, "pruning failed instance of a superseded spec");
                    self.forget(&key);
                    pass.apply(StatusChange::Remove(key));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Removes every instance of a realm whose declaration is gone.
    async fn delete_realm(&self, realm_id: &RealmId) -> Result<Outcome, Error> {
        let stored = self.store.read(realm_id).await?.map(|s| s.value);
        let namespace = stored
            .as_ref()
            .map_or_else(|| self.config.default_namespace.clone(), |s| s.namespace.clone());
        let backend = self.orchestrator.namespace(&namespace);

        let mut keys: Vec<InstanceKey> = stored
            .iter()
            .flat_map(|s| s.instances.iter().map(Instance::key))
            .collect();
        for observed in backend.list_observed_instances().await? {
            if &observed.key.realm_id == realm_id && !keys.contains(&observed.key) {
                keys.push(observed.key);
            }
        }
        if stored.is_none() && keys.is_empty() {
            debug!("realm already deleted");
            return Ok(Outcome::default());
        }

        info!(instances = keys.len(), "deleting realm");
        for key in &keys {
            self.forget(key);
            backend.delete_instance_resources(key).await?;
        }
        backend.delete_realm_resources(realm_id).await?;
        for key in &keys {
            self.record_deleted(key);
        }
        match self.store.remove(realm_id).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(recovery) = &self.recovery {
            recovery.forget(realm_id).await?;
        }
        Ok(Outcome::default())
    }

    /// Writes the changes of `pass` with optimistic concurrency.
    ///
    /// On a conflicting write the changes are replayed onto a fresh read of
    /// the record. Effects are only published once the write succeeded.
    async fn commit(&self, pass: Pass) -> Result<(), Error> {
        let Pass {
            status: working,
            changes,
            effects,
        } = pass;
        if changes.is_empty() {
            return Ok(());
        }
        let attempts = self.config.status_write_attempts;
        for attempt in 1..=attempts {
            let (mut status, version) = match self.store.read(&working.realm_id).await? {
                Some(stored) => (stored.value, stored.version),
                None => (
                    RealmStatus::new(working.realm_id.clone(), working.namespace.clone()),
                    None,
                ),
            };
            for change in &changes {
                change.apply(&mut status);
            }
            match self.store.write(&status, version.as_deref()).await {
                Ok(()) => {
                    self.publish(effects);
                    return Ok(());
                }
                Err(StoreError::Conflict(_)) => {
                    self.metrics.status_write_conflicts.inc();
                    debug!(attempt, "status write conflicted, retrying from a fresh read");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::StatusWriteExhausted {
            realm_id: working.realm_id,
            attempts,
        })
    }

    fn publish(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Created(key) => {
                    self.audit.record(LifecycleEvent::instance(
                        LifecycleEventKind::StartingNewInstance,
                        &key,
                    ));
                }
                Effect::Promoted(key) => {
                    self.metrics.promotions.inc();
                    self.audit.record(LifecycleEvent::instance(
                        LifecycleEventKind::InstanceReady,
                        &key,
                    ));
                }
                Effect::Failed(key, message) => {
                    let event = LifecycleEvent::instance(
                        LifecycleEventKind::StartingNewInstanceFailed,
                        &key,
                    )
                    .with_message(message);
                    if self.audit.record(event) {
                        self.metrics.instance_failures.inc();
                    }
                }
                Effect::Deleted(key) => self.record_deleted(&key),
            }
        }
    }

    /// Reports a teardown once its resources are gone.
    fn record_deleted(&self, key: &InstanceKey) {
        self.metrics.instances_deleted.inc();
        self.audit.record(LifecycleEvent::instance(
            LifecycleEventKind::DeletingInstance,
            key,
        ));
        self.audit.record(LifecycleEvent::instance(
            LifecycleEventKind::InstanceDeleted,
            key,
        ));
    }

    fn forget(&self, key: &InstanceKey) {
        self.prober.remove(key);
        self.recycler.remove(key);
    }

    /// The current status of a realm.
    pub async fn status(&self, realm_id: &RealmId) -> Result<Option<RealmStatus>, Error> {
        Ok(self.store.read(realm_id).await?.map(|s| s.value))
    }

    /// The current status of every realm.
    pub async fn statuses(&self) -> Result<Vec<RealmStatus>, Error> {
        Ok(self.store.list().await?)
    }

    /// Lets `key` be torn down on the next pass regardless of its sessions.
    pub async fn recycle_now(&self, key: &InstanceKey) {
        self.recycler.recycle_now(key);
        let _ = self
            .queue
            .send(Notification::reconcile(key.realm_id.clone()))
            .await;
    }
}

/// Decides whether a pass towards `desired` must start a new instance.
fn needs_new_instance(
    status: &RealmStatus,
    desired: &SpecHash,
    notification: &Notification,
) -> bool {
    let (mut in_flight, mut latest, mut failed) = (false, false, false);
    for instance in status.instances_for(desired) {
        match instance.phase {
            InstancePhase::Pending
            | InstancePhase::Provisioning
            | InstancePhase::ReadyNotLatest => in_flight = true,
            InstancePhase::Latest => latest = true,
            InstancePhase::Failed => failed = true,
            InstancePhase::Draining => {}
        }
    }
    if in_flight {
        return false;
    }
    if status.current_spec_hash.as_ref() != Some(desired) {
        return true;
    }
    if latest {
        return false;
    }
    if !failed {
        return true;
    }
    // Only failed attempts exist. Retry on an explicit re-submission.
    notification.kind == NotificationKind::UpdateSpec
        && notification
            .spec_hash
            .as_ref()
            .map_or(true, |hash| hash == desired)
}

/// A change to a realm's status, replayable onto a fresh read.
#[derive(Debug, Clone)]
enum StatusChange {
    Create(Instance),
    SetCurrentSpecHash(SpecHash),
    SetPhase {
        key: InstanceKey,
        phase: InstancePhase,
        failure: Option<String>,
    },
    Promote(InstanceKey),
    Remove(InstanceKey),
}

impl StatusChange {
    fn apply(&self, status: &mut RealmStatus) {
        match self {
            StatusChange::Create(instance) => status.insert_instance(instance.clone()),
            StatusChange::SetCurrentSpecHash(hash) => {
                status.current_spec_hash = Some(hash.clone())
            }
            StatusChange::SetPhase {
                key,
                phase,
                failure,
            } => {
                if let Some(instance) = status.instance_mut(key) {
                    instance.phase = *phase;
                    if failure.is_some() {
                        instance.failure.clone_from(failure);
                    }
                }
            }
            StatusChange::Promote(key) => status.promote(key),
            StatusChange::Remove(key) => {
                status.remove_instance(key);
            }
        }
    }
}

/// Something to report once a pass's changes are durable.
#[derive(Debug)]
enum Effect {
    Created(InstanceKey),
    Promoted(InstanceKey),
    Failed(InstanceKey, String),
    Deleted(InstanceKey),
}

/// The working state of one reconciliation pass.
#[derive(Debug)]
struct Pass {
    status: RealmStatus,
    changes: Vec<StatusChange>,
    effects: Vec<Effect>,
}

impl Pass {
    fn new(status: RealmStatus) -> Pass {
        Pass {
            status,
            changes: Vec::new(),
            effects: Vec::new(),
        }
    }

    fn apply(&mut self, change: StatusChange) {
        change.apply(&mut self.status);
        self.changes.push(change);
    }
}
