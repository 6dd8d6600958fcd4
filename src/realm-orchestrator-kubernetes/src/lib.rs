// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Runs realm instances as Kubernetes workloads.
//!
//! Each instance is a `ConfigMap` holding its configuration files and a
//! `StatefulSet` running its replicas. A realm's public route is a `Service`
//! named after the realm whose selector names exactly one instance, so that
//! switching the latest instance is a single write.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, ContainerStatus, EnvVar, Pod,
    PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::error::Error;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Resource, ResourceExt};
use maplit::btreemap;
use realm_orchestrator::{
    NamespacedOrchestrator, Notification, ObservedInstance, Orchestrator, ReplicaState,
    WorkloadReadiness,
};
use realm_types::{InstanceKey, Realm, RealmId, SpecHash};
use tracing::{debug, warn};

pub mod source;
pub mod status;
pub mod util;

const FIELD_MANAGER: &str = "realmd";
const CONTAINER_NAME: &str = "realm";
const CONFIG_MOUNT_PATH: &str = "/etc/realm";

pub const LABEL_MANAGED_BY: &str = "realmd.io/managed-by";
pub const LABEL_REALM: &str = "realmd.io/realm";
pub const LABEL_SPEC_HASH: &str = "realmd.io/spec-hash";
pub const LABEL_REVISION: &str = "realmd.io/revision";
pub const LABEL_INSTANCE: &str = "realmd.io/instance";
pub const ANNOTATION_SPEC_HASH: &str = "realmd.io/spec-hash-full";

/// Container waiting reasons after which a replica will not start on its own.
const FAILURE_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "InvalidImageName",
];

#[derive(Debug, Clone, Default)]
pub struct KubernetesOrchestratorConfig {
    /// The name of a Kubernetes context to use, if the Kubernetes configuration
    /// is loaded from the local kubeconfig.
    pub context: Option<String>,
    /// The image pull policy of replica containers.
    pub image_pull_policy: Option<String>,
    /// The service account replicas run as, if any.
    pub service_account: Option<String>,
    /// Labels to install on every resource created by the orchestrator.
    pub resource_labels: BTreeMap<String, String>,
}

pub struct KubernetesOrchestrator {
    client: Client,
    kubernetes_namespace: String,
    config: KubernetesOrchestratorConfig,
    namespaces: Mutex<BTreeMap<String, Arc<NamespacedKubernetesOrchestrator>>>,
}

impl fmt::Debug for KubernetesOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KubernetesOrchestrator")
            .field("kubernetes_namespace", &self.kubernetes_namespace)
            .finish()
    }
}

impl KubernetesOrchestrator {
    /// Creates a new Kubernetes orchestrator from the provided configuration.
    pub async fn new(
        config: KubernetesOrchestratorConfig,
    ) -> Result<KubernetesOrchestrator, anyhow::Error> {
        let (client, kubernetes_namespace) = util::create_client(config.context.clone()).await?;
        Ok(KubernetesOrchestrator {
            client,
            kubernetes_namespace,
            config,
            namespaces: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The namespace the client defaults to.
    pub fn default_namespace(&self) -> &str {
        &self.kubernetes_namespace
    }

    fn namespaced(&self, namespace: &str) -> Arc<NamespacedKubernetesOrchestrator> {
        let mut namespaces = self.namespaces.lock().expect("lock poisoned");
        Arc::clone(namespaces.entry(namespace.into()).or_insert_with(|| {
            Arc::new(NamespacedKubernetesOrchestrator {
                config_map_api: Api::namespaced(self.client.clone(), namespace),
                stateful_set_api: Api::namespaced(self.client.clone(), namespace),
                service_api: Api::namespaced(self.client.clone(), namespace),
                pod_api: Api::namespaced(self.client.clone(), namespace),
                namespace: namespace.into(),
                config: self.config.clone(),
            })
        }))
    }

    /// Streams a reconcile notification for the owning realm whenever one of
    /// the replicas managed in `namespace` changes.
    pub fn watch_replicas(&self, namespace: &str) -> BoxStream<'static, Notification> {
        self.namespaced(namespace).watch_replicas()
    }
}

impl Orchestrator for KubernetesOrchestrator {
    fn namespace(&self, namespace: &str) -> Arc<dyn NamespacedOrchestrator> {
        self.namespaced(namespace)
    }
}

struct NamespacedKubernetesOrchestrator {
    config_map_api: Api<ConfigMap>,
    stateful_set_api: Api<StatefulSet>,
    service_api: Api<Service>,
    pod_api: Api<Pod>,
    namespace: String,
    config: KubernetesOrchestratorConfig,
}

impl fmt::Debug for NamespacedKubernetesOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NamespacedKubernetesOrchestrator")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl NamespacedKubernetesOrchestrator {
    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        }
    }

    /// Creates `object` unless an object of that name exists.
    async fn create_if_absent<K>(api: &Api<K>, object: &K) -> Result<(), anyhow::Error>
    where
        K: Resource + Clone + fmt::Debug + serde::de::DeserializeOwned + serde::Serialize,
    {
        let name = object.name_any();
        if api.get_opt(&name).await?.is_some() {
            return Ok(());
        }
        match api.create(&Self::post_params(), object).await {
            Ok(_) => {
                debug!(%name, "created resource");
                Ok(())
            }
            // Someone else created it in the meantime.
            Err(Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn watch_replicas(&self) -> BoxStream<'static, Notification> {
        let params = watcher::Config::default().labels(&format!("{LABEL_MANAGED_BY}={FIELD_MANAGER}"));
        let stream = watcher(self.pod_api.clone(), params)
            .touched_objects()
            .filter_map(|object| async move {
                match object {
                    Ok(pod) => {
                        let realm_id = pod.labels().get(LABEL_REALM)?.clone();
                        Some(Notification::reconcile(RealmId::new(realm_id)))
                    }
                    Err(error) => {
                        // Watch errors are usually transient and the watcher
                        // retries on its own.
                        warn!("replica watch error: {error}");
                        None
                    }
                }
            });
        Box::pin(stream)
    }
}

#[async_trait]
impl NamespacedOrchestrator for NamespacedKubernetesOrchestrator {
    async fn ensure_config(&self, realm: &Realm, key: &InstanceKey) -> Result<(), anyhow::Error> {
        let config_map = config_map(&self.config, realm, key);
        Self::create_if_absent(&self.config_map_api, &config_map).await
    }

    async fn ensure_workload(&self, realm: &Realm, key: &InstanceKey) -> Result<(), anyhow::Error> {
        let stateful_set = stateful_set(&self.config, realm, key);
        Self::create_if_absent(&self.stateful_set_api, &stateful_set).await
    }

    async fn is_workload_ready(&self, key: &InstanceKey) -> Result<WorkloadReadiness, anyhow::Error> {
        let name = key.resource_name();
        let Some(stateful_set) = self.stateful_set_api.get_opt(&name).await? else {
            return Ok(WorkloadReadiness::default());
        };
        let desired_replicas = stateful_set
            .spec
            .and_then(|spec| spec.replicas)
            .and_then(|replicas| u32::try_from(replicas).ok())
            .unwrap_or(0);
        let params = ListParams::default().labels(&format!("{LABEL_INSTANCE}={name}"));
        let pods = self.pod_api.list(&params).await?;
        Ok(WorkloadReadiness {
            desired_replicas,
            replicas: pods.iter().map(replica_state).collect(),
        })
    }

    async fn set_latest_route(&self, realm: &Realm, key: &InstanceKey) -> Result<(), anyhow::Error> {
        let service = route_service(&self.config, realm, key);
        self.service_api
            .patch(
                realm.realm_id.as_str(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(service),
            )
            .await?;
        Ok(())
    }

    async fn delete_instance_resources(&self, key: &InstanceKey) -> Result<(), anyhow::Error> {
        let name = key.resource_name();
        match self
            .stateful_set_api
            .delete(&name, &DeleteParams::default())
            .await
        {
            Ok(_) => (),
            Err(Error::Api(e)) if e.code == 404 => (),
            Err(e) => return Err(e.into()),
        }
        match self
            .config_map_api
            .delete(&name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_realm_resources(&self, realm_id: &RealmId) -> Result<(), anyhow::Error> {
        match self
            .service_api
            .delete(realm_id.as_str(), &DeleteParams::default())
            .await
        {
            Ok(_) => (),
            Err(Error::Api(e)) if e.code == 404 => (),
            Err(e) => return Err(e.into()),
        }
        let params = ListParams::default().labels(&format!(
            "{LABEL_MANAGED_BY}={FIELD_MANAGER},{LABEL_REALM}={realm_id}"
        ));
        self.stateful_set_api
            .delete_collection(&DeleteParams::default(), &params)
            .await?;
        self.config_map_api
            .delete_collection(&DeleteParams::default(), &params)
            .await?;
        Ok(())
    }

    async fn list_observed_instances(&self) -> Result<Vec<ObservedInstance>, anyhow::Error> {
        let params = ListParams::default().labels(&format!("{LABEL_MANAGED_BY}={FIELD_MANAGER}"));
        let stateful_sets = self.stateful_set_api.list(&params).await?;
        let mut observed = Vec::new();
        for stateful_set in stateful_sets {
            match observed_key(&stateful_set.metadata) {
                Ok(key) => observed.push(ObservedInstance {
                    key,
                    namespace: self.namespace.clone(),
                }),
                Err(e) => warn!(
                    name = %stateful_set.name_any(),
                    "ignoring malformed managed stateful set: {e}"
                ),
            }
        }
        Ok(observed)
    }
}

/// The labels that identify an instance's resources.
pub fn instance_labels(key: &InstanceKey) -> BTreeMap<String, String> {
    btreemap! {
        LABEL_MANAGED_BY.into() => FIELD_MANAGER.into(),
        LABEL_REALM.into() => key.realm_id.to_string(),
        LABEL_SPEC_HASH.into() => key.spec_hash.short().into(),
        LABEL_REVISION.into() => key.revision.to_string(),
        LABEL_INSTANCE.into() => key.resource_name(),
    }
}

fn instance_metadata(
    config: &KubernetesOrchestratorConfig,
    realm: &Realm,
    key: &InstanceKey,
) -> ObjectMeta {
    let mut labels = config.resource_labels.clone();
    labels.extend(instance_labels(key));
    ObjectMeta {
        name: Some(key.resource_name()),
        namespace: Some(realm.namespace.clone()),
        labels: Some(labels),
        annotations: Some(btreemap! {
            ANNOTATION_SPEC_HASH.into() => key.spec_hash.to_string(),
        }),
        ..Default::default()
    }
}

fn config_map(config: &KubernetesOrchestratorConfig, realm: &Realm, key: &InstanceKey) -> ConfigMap {
    ConfigMap {
        metadata: instance_metadata(config, realm, key),
        data: Some(realm.spec.config.clone()),
        ..Default::default()
    }
}

fn stateful_set(
    config: &KubernetesOrchestratorConfig,
    realm: &Realm,
    key: &InstanceKey,
) -> StatefulSet {
    let metadata = instance_metadata(config, realm, key);
    let name = key.resource_name();
    let match_labels = btreemap! {
        LABEL_MANAGED_BY.to_string() => FIELD_MANAGER.to_string(),
        LABEL_INSTANCE.to_string() => name.clone(),
    };
    let mut env: Vec<EnvVar> = realm
        .spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();
    env.push(EnvVar {
        name: "REALM_PORT".into(),
        value: Some(realm.spec.port.to_string()),
        ..Default::default()
    });
    env.push(EnvVar {
        name: "REALM_CONFIG_DIR".into(),
        value: Some(CONFIG_MOUNT_PATH.into()),
        ..Default::default()
    });

    let pod_template_spec = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: metadata.labels.clone(),
            annotations: metadata.annotations.clone(),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.into(),
                image: Some(realm.spec.image.clone()),
                args: Some(realm.spec.args.clone()),
                image_pull_policy: config.image_pull_policy.clone(),
                ports: Some(vec![ContainerPort {
                    container_port: realm.spec.port.into(),
                    name: Some("http".into()),
                    ..Default::default()
                }]),
                env: Some(env),
                volume_mounts: Some(vec![VolumeMount {
                    name: "config".into(),
                    mount_path: CONFIG_MOUNT_PATH.into(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "config".into(),
                config_map: Some(ConfigMapVolumeSource {
                    name: name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            service_account_name: config.service_account.clone(),
            ..Default::default()
        }),
    };

    StatefulSet {
        metadata,
        spec: Some(StatefulSetSpec {
            selector: LabelSelector {
                match_labels: Some(match_labels),
                ..Default::default()
            },
            service_name: name,
            replicas: i32::try_from(realm.spec.replicas).ok(),
            template: pod_template_spec,
            pod_management_policy: Some("Parallel".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

/// The service through which a realm is reached, pointed at `key`.
fn route_service(config: &KubernetesOrchestratorConfig, realm: &Realm, key: &InstanceKey) -> Service {
    let mut labels = config.resource_labels.clone();
    labels.insert(LABEL_MANAGED_BY.into(), FIELD_MANAGER.into());
    labels.insert(LABEL_REALM.into(), realm.realm_id.to_string());
    Service {
        metadata: ObjectMeta {
            name: Some(realm.realm_id.to_string()),
            namespace: Some(realm.namespace.clone()),
            labels: Some(labels),
            annotations: Some(btreemap! {
                ANNOTATION_SPEC_HASH.into() => key.spec_hash.to_string(),
            }),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(btreemap! {
                LABEL_INSTANCE.into() => key.resource_name(),
            }),
            ports: Some(vec![ServicePort {
                name: Some("http".into()),
                port: realm.spec.port.into(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Recovers the instance key from the labels of a managed resource.
fn observed_key(metadata: &ObjectMeta) -> Result<InstanceKey, anyhow::Error> {
    let label = |name: &str| {
        metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(name))
            .ok_or_else(|| anyhow!("missing label: {name}"))
    };
    let realm_id = label(LABEL_REALM)?;
    let revision = label(LABEL_REVISION)?.parse()?;
    let spec_hash = metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_SPEC_HASH))
        .ok_or_else(|| anyhow!("missing annotation: {ANNOTATION_SPEC_HASH}"))?;
    Ok(InstanceKey::new(
        RealmId::new(realm_id.as_str()),
        SpecHash::new(spec_hash.as_str()),
        revision,
    ))
}

/// Summarizes what a pod reports about its replica.
fn replica_state(pod: &Pod) -> ReplicaState {
    let status = pod.status.as_ref();
    let container: Option<&ContainerStatus> = status
        .and_then(|status| status.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|c| c.name == CONTAINER_NAME));
    let port = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .and_then(|container| container.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|port| port.container_port);
    let address = status
        .and_then(|status| status.pod_ip.as_ref())
        .zip(port)
        .map(|(ip, port)| format!("{ip}:{port}"));
    let running = status.is_some_and(|status| status.phase.as_deref() == Some("Running"))
        && container
            .and_then(|c| c.state.as_ref())
            .is_some_and(|state| state.running.is_some());
    let restarts = container.map_or(0, |c| u32::try_from(c.restart_count).unwrap_or(0));
    let last_message = container
        .and_then(|c| c.last_state.as_ref())
        .and_then(|state| state.terminated.as_ref())
        .and_then(|terminated| terminated.message.clone().or_else(|| terminated.reason.clone()));
    let failure = container
        .and_then(|c| c.state.as_ref())
        .and_then(|state| state.waiting.as_ref())
        .and_then(|waiting| {
            let reason = waiting.reason.as_deref()?;
            if !FAILURE_REASONS.contains(&reason) {
                return None;
            }
            Some(match &waiting.message {
                Some(message) => format!("{reason}: {message}"),
                None => reason.to_string(),
            })
        });
    ReplicaState {
        name: pod.name_any(),
        address,
        running,
        restarts,
        failure,
        last_message,
    }
}
