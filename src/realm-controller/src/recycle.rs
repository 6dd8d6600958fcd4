// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Deciding whether a superseded instance can be torn down.
//!
//! An instance is recyclable once none of its replicas has an active user
//! session. Replicas that cannot be reached count as busy: an instance is
//! kept around rather than risk cutting off someone's work.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use realm_orchestrator::NamespacedOrchestrator;
use realm_types::InstanceKey;

use crate::client::ReplicaClient;
use crate::task::{self, AbortOnDropHandle};

#[derive(Debug, Clone)]
pub struct RecycleConfig {
    /// Session queries per replica before the replica is considered busy.
    pub attempts: u32,
    /// Timeout of a single session query.
    pub timeout: Duration,
    /// Pause between session queries to the same replica.
    pub interval: Duration,
    /// Treat every instance as recyclable.
    pub force: bool,
}

impl Default for RecycleConfig {
    fn default() -> Self {
        RecycleConfig {
            attempts: 3,
            timeout: Duration::from_secs(2),
            interval: Duration::from_secs(1),
            force: false,
        }
    }
}

#[derive(Debug)]
struct CheckTask {
    state: watch::Receiver<Option<bool>>,
    _handle: AbortOnDropHandle<()>,
}

/// Runs at most one recyclability check per instance.
#[derive(Debug, Clone)]
pub struct RecyclabilityChecker {
    config: RecycleConfig,
    client: Arc<dyn ReplicaClient>,
    tasks: Arc<Mutex<BTreeMap<InstanceKey, CheckTask>>>,
    overrides: Arc<Mutex<BTreeSet<InstanceKey>>>,
}

impl RecyclabilityChecker {
    pub fn new(config: RecycleConfig, client: Arc<dyn ReplicaClient>) -> RecyclabilityChecker {
        RecyclabilityChecker {
            config,
            client,
            tasks: Arc::default(),
            overrides: Arc::default(),
        }
    }

    /// Returns whether `key` may be recycled, or `None` while a check is
    /// in flight.
    ///
    /// A check that found the instance busy is restarted, so that a later
    /// call observes fresh session counts.
    pub fn check(
        &self,
        key: &InstanceKey,
        backend: Arc<dyn NamespacedOrchestrator>,
    ) -> Option<bool> {
        if self.config.force || self.overrides.lock().expect("lock poisoned").contains(key) {
            return Some(true);
        }
        let mut tasks = self.tasks.lock().expect("lock poisoned");
        let previous = tasks.get(key).map(|task| *task.state.borrow());
        match previous {
            Some(None) => return None,
            Some(Some(true)) => return Some(true),
            Some(Some(false)) | None => {}
        }

        let (tx, rx) = watch::channel(None);
        let config = self.config.clone();
        let client = Arc::clone(&self.client);
        let check_key = key.clone();
        let handle = task::spawn(
            || format!("recyclability-check:{key}"),
            async move {
                let recyclable = check_instance(&config, &*client, &*backend, &check_key).await;
                debug!(instance = %check_key, recyclable, "recyclability check finished");
                tx.send_replace(Some(recyclable));
            },
        );
        tasks.insert(
            key.clone(),
            CheckTask {
                state: rx,
                _handle: handle,
            },
        );
        previous.flatten()
    }

    /// Marks `key` recyclable regardless of its sessions.
    pub fn recycle_now(&self, key: &InstanceKey) {
        info!(instance = %key, "recycling instance on request");
        self.overrides
            .lock()
            .expect("lock poisoned")
            .insert(key.clone());
    }

    /// Cancels any outstanding check of `key` and forgets it.
    pub fn remove(&self, key: &InstanceKey) {
        self.tasks.lock().expect("lock poisoned").remove(key);
        self.overrides.lock().expect("lock poisoned").remove(key);
    }
}

async fn check_instance(
    config: &RecycleConfig,
    client: &dyn ReplicaClient,
    backend: &dyn NamespacedOrchestrator,
    key: &InstanceKey,
) -> bool {
    let workload = match backend.is_workload_ready(key).await {
        Ok(workload) => workload,
        Err(e) => {
            warn!(instance = %key, "failed to list replicas: {e:#}");
            return false;
        }
    };
    // Nothing is left running that could hold a session.
    if workload.replicas.is_empty() {
        return true;
    }
    for replica in &workload.replicas {
        let Some(address) = &replica.address else {
            debug!(instance = %key, replica = %replica.name, "replica has no address");
            return false;
        };
        match active_sessions(config, client, address).await {
            Some(0) => {}
            Some(n) => {
                debug!(instance = %key, replica = %replica.name, sessions = n, "replica still has sessions");
                return false;
            }
            None => {
                debug!(instance = %key, replica = %replica.name, "replica unreachable");
                return false;
            }
        }
    }
    true
}

async fn active_sessions(
    config: &RecycleConfig,
    client: &dyn ReplicaClient,
    address: &str,
) -> Option<u64> {
    for attempt in 1..=config.attempts {
        match tokio::time::timeout(config.timeout, client.active_sessions(address)).await {
            Ok(Ok(n)) => return Some(n),
            Ok(Err(e)) => debug!("session query to {address} failed: {e:#}"),
            Err(_) => debug!("session query to {address} timed out"),
        }
        if attempt < config.attempts {
            tokio::time::sleep(config.interval).await;
        }
    }
    None
}
