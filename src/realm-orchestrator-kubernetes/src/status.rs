// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Realm status stored in the status subresource of `Realm` objects.

use std::fmt;

use anyhow::anyhow;
use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube::error::Error;
use realm_cloud_resources::crd::realm::v1alpha1::Realm;
use realm_orchestrator::{StatusStore, StoreError, Versioned};
use realm_types::{RealmId, RealmStatus};
use serde_json::json;

/// Stores each realm's status on its own `Realm` object.
///
/// Writes are JSON merge patches that carry the resource version they were
/// read at, so the API server rejects any write that raced another one.
#[derive(Clone)]
pub struct KubernetesStatusStore {
    api: Api<Realm>,
}

impl fmt::Debug for KubernetesStatusStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KubernetesStatusStore").finish()
    }
}

impl KubernetesStatusStore {
    pub fn new(client: Client, namespace: &str) -> KubernetesStatusStore {
        KubernetesStatusStore {
            api: Api::namespaced(client, namespace),
        }
    }

    async fn patch(&self, realm_id: &RealmId, patch: serde_json::Value) -> Result<(), StoreError> {
        match self
            .api
            .patch_status(realm_id.as_str(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Api(e)) if e.code == 409 => Err(StoreError::Conflict(realm_id.clone())),
            Err(Error::Api(e)) if e.code == 404 => Err(StoreError::NotFound(realm_id.clone())),
            Err(e) => Err(StoreError::Other(e.into())),
        }
    }
}

#[async_trait]
impl StatusStore for KubernetesStatusStore {
    async fn read(&self, realm_id: &RealmId) -> Result<Option<Versioned<RealmStatus>>, StoreError> {
        let Some(realm) = self
            .api
            .get_opt(realm_id.as_str())
            .await
            .map_err(anyhow::Error::from)?
        else {
            return Ok(None);
        };
        let version = realm.metadata.resource_version;
        Ok(realm.status.map(|value| Versioned { value, version }))
    }

    async fn write(&self, status: &RealmStatus, version: Option<&str>) -> Result<(), StoreError> {
        let realm_id = &status.realm_id;
        let version = match version {
            Some(version) => version.to_string(),
            None => {
                // A first write only succeeds if no status was written since.
                let realm = self
                    .api
                    .get_opt(realm_id.as_str())
                    .await
                    .map_err(anyhow::Error::from)?
                    .ok_or_else(|| StoreError::NotFound(realm_id.clone()))?;
                if realm.status.is_some() {
                    return Err(StoreError::Conflict(realm_id.clone()));
                }
                realm
                    .metadata
                    .resource_version
                    .ok_or_else(|| anyhow!("realm {realm_id} has no resource version"))?
            }
        };
        self.patch(
            realm_id,
            json!({
                "metadata": {"resourceVersion": version},
                "status": status,
            }),
        )
        .await
    }

    async fn remove(&self, realm_id: &RealmId) -> Result<(), StoreError> {
        match self.patch(realm_id, json!({"status": null})).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> Result<Vec<RealmStatus>, StoreError> {
        let realms = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(anyhow::Error::from)?;
        Ok(realms.into_iter().filter_map(|realm| realm.status).collect())
    }
}
