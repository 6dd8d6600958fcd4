// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Runs realm instances as local processes.
//!
//! Every instance owns a directory under
//! `<data_dir>/<namespace>/realms/<realm>/<instance>/` holding its
//! `instance.json` and `config/` files. Replicas are supervised child
//! processes that die with the operator; a restarted operator respawns them
//! from `instance.json`. The route of every realm in a namespace lives in
//! `<data_dir>/<namespace>/routes.json`.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tracing::{info, warn};

use realm_orchestrator::{
    NamespacedOrchestrator, ObservedInstance, Orchestrator, WorkloadReadiness,
};
use realm_types::{InstanceKey, Realm, RealmId};

use crate::instance_metadata_file::{InstanceMetadata, InstanceMetadataFile};
use crate::route::{Route, RouteFile};
use crate::supervisor::{ReplicaCommand, Supervisor};

pub mod instance_metadata_file;
pub mod recovery;
pub mod route;
pub mod source;
pub mod supervisor;

const METADATA_FILE: &str = "instance.json";
const CONFIG_DIR: &str = "config";

/// Configures a [`ProcessOrchestrator`].
#[derive(Debug, Clone)]
pub struct ProcessOrchestratorConfig {
    /// The directory under which instance state is kept.
    pub data_dir: PathBuf,
    /// The address replicas bind to.
    pub host: String,
    /// How long to wait before restarting an exited replica.
    pub restart_backoff: Duration,
}

impl ProcessOrchestratorConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> ProcessOrchestratorConfig {
        ProcessOrchestratorConfig {
            data_dir: data_dir.into(),
            host: "127.0.0.1".into(),
            restart_backoff: Duration::from_secs(1),
        }
    }
}

/// An orchestrator backed by processes on the local machine.
#[derive(Debug)]
pub struct ProcessOrchestrator {
    config: ProcessOrchestratorConfig,
    namespaces: Mutex<BTreeMap<String, Arc<dyn NamespacedOrchestrator>>>,
}

impl ProcessOrchestrator {
    pub fn new(config: ProcessOrchestratorConfig) -> Result<ProcessOrchestrator, anyhow::Error> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("creating data directory {}", config.data_dir.display())
        })?;
        Ok(ProcessOrchestrator {
            config,
            namespaces: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }
}

impl Orchestrator for ProcessOrchestrator {
    fn namespace(&self, namespace: &str) -> Arc<dyn NamespacedOrchestrator> {
        let mut namespaces = self.namespaces.lock().expect("lock poisoned");
        Arc::clone(namespaces.entry(namespace.into()).or_insert_with(|| {
            let orchestrator = NamespacedProcessOrchestrator::new(namespace, self.config.clone());
            orchestrator.adopt();
            Arc::new(orchestrator)
        }))
    }
}

#[derive(Debug)]
struct Workload {
    desired_replicas: u32,
    supervisors: Vec<Supervisor>,
}

#[derive(Debug)]
struct NamespacedProcessOrchestrator {
    namespace: String,
    config: ProcessOrchestratorConfig,
    root: PathBuf,
    routes: RouteFile,
    workloads: Mutex<BTreeMap<InstanceKey, Workload>>,
}

impl NamespacedProcessOrchestrator {
    fn new(namespace: &str, config: ProcessOrchestratorConfig) -> NamespacedProcessOrchestrator {
        let root = config.data_dir.join(namespace);
        NamespacedProcessOrchestrator {
            namespace: namespace.into(),
            routes: RouteFile::new(root.join("routes.json")),
            root,
            config,
            workloads: Mutex::new(BTreeMap::new()),
        }
    }

    fn realm_dir(&self, realm_id: &RealmId) -> PathBuf {
        self.root.join("realms").join(realm_id.as_str())
    }

    fn instance_dir(&self, key: &InstanceKey) -> PathBuf {
        self.realm_dir(&key.realm_id).join(key.resource_name())
    }

    /// Respawns the replicas of every instance a previous operator left
    /// behind.
    fn adopt(&self) {
        let instances = match self.read_instances() {
            Ok(instances) => instances,
            Err(e) => {
                warn!(namespace = %self.namespace, "failed to scan for instances: {e:#}");
                return;
            }
        };
        let mut workloads = self.workloads.lock().expect("lock poisoned");
        for metadata in instances {
            if metadata.ports.is_empty() || workloads.contains_key(&metadata.key) {
                continue;
            }
            info!(instance = %metadata.key, "respawning replicas of existing instance");
            let workload = self.spawn_workload(&metadata);
            workloads.insert(metadata.key, workload);
        }
    }

    /// Reads the metadata of every instance directory in the namespace.
    fn read_instances(&self) -> Result<Vec<InstanceMetadata>, anyhow::Error> {
        let mut instances = vec![];
        for realm_dir in read_dir_or_empty(&self.root.join("realms"))? {
            for instance_dir in read_dir_or_empty(&realm_dir)? {
                let path = instance_dir.join(METADATA_FILE);
                match InstanceMetadataFile::read(&path) {
                    Ok(metadata) => instances.push(metadata),
                    Err(instance_metadata_file::Error::Io(e))
                        if e.kind() == io::ErrorKind::NotFound =>
                    {
                        continue
                    }
                    Err(e) => warn!("skipping instance at {}: {e}", instance_dir.display()),
                }
            }
        }
        Ok(instances)
    }

    fn spawn_workload(&self, metadata: &InstanceMetadata) -> Workload {
        let config_dir = self.instance_dir(&metadata.key).join(CONFIG_DIR);
        let supervisors = metadata
            .ports
            .iter()
            .enumerate()
            .map(|(i, port)| {
                let command = ReplicaCommand {
                    name: format!("{}-{i}", metadata.key.resource_name()),
                    program: metadata.spec.image.clone(),
                    args: metadata.spec.args.clone(),
                    env: metadata.spec.env.clone(),
                    host: self.config.host.clone(),
                    port: *port,
                    config_dir: config_dir.clone(),
                };
                Supervisor::spawn(command, self.config.restart_backoff)
            })
            .collect();
        Workload {
            desired_replicas: metadata.spec.replicas,
            supervisors,
        }
    }

    fn allocate_ports(&self, count: u32) -> Result<Vec<u16>, anyhow::Error> {
        // Holding every listener until all are allocated keeps the ports
        // distinct.
        let mut listeners = vec![];
        for _ in 0..count {
            let listener = TcpListener::bind((self.config.host.as_str(), 0))
                .with_context(|| format!("allocating a port on {}", self.config.host))?;
            listeners.push(listener);
        }
        let ports = listeners
            .iter()
            .map(|l| l.local_addr().map(|addr| addr.port()))
            .collect::<Result<_, _>>()?;
        Ok(ports)
    }
}

#[async_trait]
impl NamespacedOrchestrator for NamespacedProcessOrchestrator {
    async fn ensure_config(&self, realm: &Realm, key: &InstanceKey) -> Result<(), anyhow::Error> {
        let dir = self.instance_dir(key);
        let config_dir = dir.join(CONFIG_DIR);
        if config_dir.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&dir)?;
        let staging = tempfile::Builder::new()
            .prefix(".config")
            .tempdir_in(&dir)?;
        for (name, contents) in &realm.spec.config {
            std::fs::write(staging.path().join(name), contents)?;
        }
        std::fs::rename(staging.keep(), &config_dir)?;

        let metadata_path = dir.join(METADATA_FILE);
        if !metadata_path.exists() {
            let metadata = InstanceMetadata {
                key: key.clone(),
                namespace: self.namespace.clone(),
                spec: realm.spec.clone(),
                ports: vec![],
            };
            InstanceMetadataFile::open(&metadata_path, &metadata)?;
        }
        Ok(())
    }

    async fn ensure_workload(
        &self,
        realm: &Realm,
        key: &InstanceKey,
    ) -> Result<(), anyhow::Error> {
        let mut workloads = self.workloads.lock().expect("lock poisoned");
        if workloads.contains_key(key) {
            return Ok(());
        }
        let dir = self.instance_dir(key);
        std::fs::create_dir_all(&dir)?;
        let metadata_path = dir.join(METADATA_FILE);
        let metadata = match InstanceMetadataFile::read(&metadata_path) {
            Ok(metadata) if !metadata.ports.is_empty() => metadata,
            _ => {
                let metadata = InstanceMetadata {
                    key: key.clone(),
                    namespace: self.namespace.clone(),
                    spec: realm.spec.clone(),
                    ports: self.allocate_ports(realm.spec.replicas)?,
                };
                InstanceMetadataFile::open(&metadata_path, &metadata)?;
                metadata
            }
        };
        info!(instance = %key, ports = ?metadata.ports, "starting replicas");
        let workload = self.spawn_workload(&metadata);
        workloads.insert(key.clone(), workload);
        Ok(())
    }

    async fn is_workload_ready(
        &self,
        key: &InstanceKey,
    ) -> Result<WorkloadReadiness, anyhow::Error> {
        let workloads = self.workloads.lock().expect("lock poisoned");
        Ok(match workloads.get(key) {
            Some(workload) => WorkloadReadiness {
                desired_replicas: workload.desired_replicas,
                replicas: workload.supervisors.iter().map(|s| s.state()).collect(),
            },
            None => WorkloadReadiness::default(),
        })
    }

    async fn set_latest_route(
        &self,
        realm: &Realm,
        key: &InstanceKey,
    ) -> Result<(), anyhow::Error> {
        let addresses = {
            let workloads = self.workloads.lock().expect("lock poisoned");
            let workload = workloads
                .get(key)
                .ok_or_else(|| anyhow!("instance {key} has no workload"))?;
            workload
                .supervisors
                .iter()
                .filter_map(|s| s.state().address)
                .collect()
        };
        let route = Route {
            instance: key.clone(),
            addresses,
        };
        self.routes
            .set(&realm.realm_id, route)
            .with_context(|| format!("writing {}", self.routes.path().display()))?;
        Ok(())
    }

    async fn delete_instance_resources(&self, key: &InstanceKey) -> Result<(), anyhow::Error> {
        // Dropping the supervisors kills the replicas.
        self.workloads.lock().expect("lock poisoned").remove(key);
        remove_dir_if_exists(&self.instance_dir(key))?;
        Ok(())
    }

    async fn delete_realm_resources(&self, realm_id: &RealmId) -> Result<(), anyhow::Error> {
        self.workloads
            .lock()
            .expect("lock poisoned")
            .retain(|key, _| &key.realm_id != realm_id);
        remove_dir_if_exists(&self.realm_dir(realm_id))?;
        self.routes.remove(realm_id)?;
        Ok(())
    }

    async fn list_observed_instances(&self) -> Result<Vec<ObservedInstance>, anyhow::Error> {
        Ok(self
            .read_instances()?
            .into_iter()
            .map(|metadata| ObservedInstance {
                key: metadata.key,
                namespace: self.namespace.clone(),
            })
            .collect())
    }
}

/// Replaces the file at `path` with `contents` so that readers see either
/// the old or the new contents.
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn read_dir_or_empty(path: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e),
    };
    let mut paths = vec![];
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}
