// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Deduplicated health checks for instances that are starting up.
//!
//! A probe is one background task per instance. It polls the backend for the
//! instance's replicas and, once they are all running, the health endpoint
//! of each replica. The reconciliation loop never waits on a probe: it reads
//! the latest [`Readiness`] snapshot and defers its decision while the probe
//! is still in progress.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use realm_orchestrator::NamespacedOrchestrator;
use realm_types::InstanceKey;

use crate::client::ReplicaClient;
use crate::task::{self, AbortOnDropHandle};

/// The outcome of probing an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Still probing.
    Wip,
    /// Every replica is running and healthy.
    Ready,
    /// The instance will not become healthy. Carries the last diagnostic.
    Failed(String),
}

/// Bounds a readiness probe.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// How many times the replicas are polled before giving up.
    pub attempts: u32,
    /// How long to wait between polls.
    pub interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            attempts: 24,
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct ProbeTask {
    state: watch::Receiver<Readiness>,
    _handle: AbortOnDropHandle<()>,
}

/// Runs at most one readiness probe per instance.
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    config: ProbeConfig,
    client: Arc<dyn ReplicaClient>,
    tasks: Arc<Mutex<BTreeMap<InstanceKey, ProbeTask>>>,
}

impl ReadinessProber {
    pub fn new(config: ProbeConfig, client: Arc<dyn ReplicaClient>) -> ReadinessProber {
        ReadinessProber {
            config,
            client,
            tasks: Arc::default(),
        }
    }

    /// Returns the readiness of `key`, starting a probe if none exists.
    ///
    /// Requests for an instance whose probe is outstanding share that probe.
    pub fn probe(&self, key: &InstanceKey, backend: Arc<dyn NamespacedOrchestrator>) -> Readiness {
        let mut tasks = self.tasks.lock().expect("lock poisoned");
        if let Some(task) = tasks.get(key) {
            return task.state.borrow().clone();
        }
        debug!(instance = %key, "starting readiness probe");
        let (tx, rx) = watch::channel(Readiness::Wip);
        let config = self.config.clone();
        let client = Arc::clone(&self.client);
        let probe_key = key.clone();
        let handle = task::spawn(
            || format!("readiness-probe:{key}"),
            async move {
                let readiness = probe_instance(&config, &*client, &*backend, &probe_key).await;
                debug!(instance = %probe_key, ?readiness, "readiness probe finished");
                tx.send_replace(readiness);
            },
        );
        tasks.insert(
            key.clone(),
            ProbeTask {
                state: rx,
                _handle: handle,
            },
        );
        Readiness::Wip
    }

    /// The current readiness of `key`, if a probe was ever started.
    ///
    /// Never starts a probe.
    pub fn is_ready(&self, key: &InstanceKey) -> Option<Readiness> {
        let tasks = self.tasks.lock().expect("lock poisoned");
        tasks.get(key).map(|task| task.state.borrow().clone())
    }

    /// Cancels any outstanding probe of `key` and forgets its result.
    pub fn remove(&self, key: &InstanceKey) {
        self.tasks.lock().expect("lock poisoned").remove(key);
    }

    /// The number of instances with a probe, finished or not.
    pub fn len(&self) -> usize {
        self.tasks.lock().expect("lock poisoned").len()
    }
}

async fn probe_instance(
    config: &ProbeConfig,
    client: &dyn ReplicaClient,
    backend: &dyn NamespacedOrchestrator,
    key: &InstanceKey,
) -> Readiness {
    // Restart counts seen on first observation of each replica.
    let mut baseline: BTreeMap<String, u32> = BTreeMap::new();
    let mut healthy: BTreeSet<String> = BTreeSet::new();
    let mut diagnostic: Option<String> = None;

    for attempt in 1..=config.attempts {
        match backend.is_workload_ready(key).await {
            Ok(workload) => {
                for replica in &workload.replicas {
                    if replica.last_message.is_some() {
                        diagnostic.clone_from(&replica.last_message);
                    }
                    if let Some(failure) = &replica.failure {
                        return Readiness::Failed(describe(
                            format!("replica {} failed: {failure}", replica.name),
                            &diagnostic,
                        ));
                    }
                    let first = *baseline
                        .entry(replica.name.clone())
                        .or_insert(replica.restarts);
                    if replica.restarts > first {
                        return Readiness::Failed(describe(
                            format!("replica {} restarted while starting up", replica.name),
                            &diagnostic,
                        ));
                    }
                }

                if workload.all_running() {
                    let mut all_healthy = true;
                    for replica in &workload.replicas {
                        if healthy.contains(&replica.name) {
                            continue;
                        }
                        let ok = match &replica.address {
                            Some(address) => match client.health(address).await {
                                Ok(ok) => ok,
                                Err(e) => {
                                    debug!(instance = %key, replica = %replica.name, "health check failed: {e:#}");
                                    false
                                }
                            },
                            None => false,
                        };
                        if ok {
                            healthy.insert(replica.name.clone());
                        } else {
                            all_healthy = false;
                        }
                    }
                    if all_healthy {
                        return Readiness::Ready;
                    }
                }
            }
            Err(e) => warn!(instance = %key, "failed to read workload state: {e:#}"),
        }
        if attempt < config.attempts {
            tokio::time::sleep(config.interval).await;
        }
    }

    Readiness::Failed(describe(
        format!("replicas not healthy after {} attempts", config.attempts),
        &diagnostic,
    ))
}

fn describe(reason: String, diagnostic: &Option<String>) -> String {
    match diagnostic {
        Some(diagnostic) => format!("{reason}: {diagnostic}"),
        None => reason,
    }
}
