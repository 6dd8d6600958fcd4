// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The `Realm` custom resource, reconciled into instances by realmd.

use kube::{CustomResource, ResourceExt};
use realm_types::{RealmId, RealmSpec, RealmStatus};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod v1alpha1 {
    use super::*;

    /// Declares the desired configuration of a realm.
    #[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    #[kube(
        namespaced,
        group = "realmd.io",
        version = "v1alpha1",
        kind = "Realm",
        singular = "realm",
        plural = "realms",
        status = "RealmStatus",
        printcolumn = r#"{"name": "Image", "type": "string", "description": "Image run by new instances.", "jsonPath": ".spec.image"}"#,
        printcolumn = r#"{"name": "Replicas", "type": "integer", "description": "Replicas per instance.", "jsonPath": ".spec.replicas"}"#,
        printcolumn = r#"{"name": "SpecHash", "type": "string", "description": "Spec hash the realm was last reconciled towards.", "jsonPath": ".status.currentSpecHash", "priority": 1}"#
    )]
    pub struct RealmResourceSpec {
        #[serde(flatten)]
        pub template: RealmSpec,
    }

    impl Realm {
        pub fn realm_id(&self) -> RealmId {
            RealmId::new(self.name_any())
        }

        /// The declaration this resource stands for. Resources without a
        /// namespace are placed in `default_namespace`.
        pub fn declaration(&self, default_namespace: &str) -> realm_types::Realm {
            let namespace = self
                .namespace()
                .unwrap_or_else(|| default_namespace.to_string());
            realm_types::Realm::new(self.realm_id(), namespace, self.spec.template.clone())
        }
    }
}
