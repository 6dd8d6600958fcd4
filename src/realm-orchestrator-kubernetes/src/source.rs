// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Realm declarations read from, and watched on, `Realm` objects.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use realm_cloud_resources::crd::realm::v1alpha1::Realm as RealmResource;
use realm_orchestrator::{Notification, NotificationKind, RealmSource};
use realm_types::{Realm, RealmId, SpecHash};
use tracing::warn;

#[derive(Clone)]
pub struct KubernetesRealmSource {
    api: Api<RealmResource>,
    namespace: String,
}

impl fmt::Debug for KubernetesRealmSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KubernetesRealmSource")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl KubernetesRealmSource {
    pub fn new(client: Client, namespace: &str) -> KubernetesRealmSource {
        KubernetesRealmSource {
            api: Api::namespaced(client, namespace),
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl RealmSource for KubernetesRealmSource {
    async fn get(&self, realm_id: &RealmId) -> Result<Option<Realm>, anyhow::Error> {
        let resource = self.api.get_opt(realm_id.as_str()).await?;
        Ok(resource
            .filter(|resource| resource.metadata.deletion_timestamp.is_none())
            .map(|resource| resource.declaration(&self.namespace)))
    }

    async fn list(&self) -> Result<Vec<Realm>, anyhow::Error> {
        let resources = self.api.list(&ListParams::default()).await?;
        Ok(resources
            .into_iter()
            .filter(|resource| resource.metadata.deletion_timestamp.is_none())
            .map(|resource| resource.declaration(&self.namespace))
            .collect())
    }

    fn watch(&self) -> BoxStream<'static, Notification> {
        let seen = Arc::new(Mutex::new(BTreeMap::new()));
        let stream = watcher(self.api.clone(), watcher::Config::default()).filter_map(move |event| {
            let seen = Arc::clone(&seen);
            async move {
                match event {
                    Ok(event) => translate(event, &mut seen.lock().expect("lock poisoned")),
                    Err(error) => {
                        warn!("realm watch error: {error}");
                        None
                    }
                }
            }
        });
        Box::pin(stream)
    }
}

/// Turns a watch event into a notification, remembering the last spec hash
/// seen for each realm so that spec changes can be told apart from other
/// updates.
fn translate(
    event: Event<RealmResource>,
    seen: &mut BTreeMap<RealmId, SpecHash>,
) -> Option<Notification> {
    match event {
        Event::Apply(resource) | Event::InitApply(resource) => {
            let realm_id = resource.realm_id();
            if resource.metadata.deletion_timestamp.is_some() {
                seen.remove(&realm_id);
                return Some(Notification::new(NotificationKind::Delete, realm_id));
            }
            let hash = resource.spec.template.spec_hash();
            let kind = match seen.insert(realm_id.clone(), hash.clone()) {
                None => NotificationKind::Add,
                Some(previous) if previous != hash => NotificationKind::UpdateSpec,
                Some(_) => NotificationKind::Reconcile,
            };
            Some(Notification::new(kind, realm_id).with_spec_hash(hash))
        }
        Event::Delete(resource) => {
            let realm_id = resource.realm_id();
            seen.remove(&realm_id);
            Some(Notification::new(NotificationKind::Delete, realm_id))
        }
        Event::Init | Event::InitDone => None,
    }
}
