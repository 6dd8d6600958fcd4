// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The data model of the realm deployment operator.
//!
//! A [`Realm`] is a named unit of desired configuration. Every attempt to run
//! a realm's configuration is an [`Instance`], identified by an
//! [`InstanceKey`]. The observable projection of a realm, owned by the
//! reconciliation loop, is its [`RealmStatus`].

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod spec;
mod status;

pub use spec::{RealmSpec, SpecError};
pub use status::{Instance, InstancePhase, RealmStatus};

/// The number of hex characters of a [`SpecHash`] used in resource names.
pub const SHORT_HASH_LEN: usize = 12;

/// The stable identifier of a realm.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct RealmId(String);

impl RealmId {
    pub fn new(id: impl Into<String>) -> RealmId {
        RealmId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RealmId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RealmId {
    fn from(s: &str) -> RealmId {
        RealmId(s.into())
    }
}

/// The content hash of a [`RealmSpec`].
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct SpecHash(String);

impl SpecHash {
    pub fn new(hash: impl Into<String>) -> SpecHash {
        SpecHash(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The prefix of the hash that is embedded in resource names and labels.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(SHORT_HASH_LEN)
            .map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for SpecHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpecHash {
    fn from(s: &str) -> SpecHash {
        SpecHash(s.into())
    }
}

/// Identifies one instance of a realm.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceKey {
    pub realm_id: RealmId,
    pub spec_hash: SpecHash,
    pub revision: u64,
}

impl InstanceKey {
    pub fn new(realm_id: RealmId, spec_hash: SpecHash, revision: u64) -> InstanceKey {
        InstanceKey {
            realm_id,
            spec_hash,
            revision,
        }
    }

    /// The name under which the backing resources of this instance are
    /// created. Distinct revisions of the same hash never share a name.
    pub fn resource_name(&self) -> String {
        format!(
            "{}-{}-{}",
            self.realm_id,
            self.spec_hash.short(),
            self.revision
        )
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.realm_id,
            self.spec_hash.short(),
            self.revision
        )
    }
}

/// An error parsing an [`InstanceKey`] from its `realm/hash/revision` form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid instance key {0:?}: expected <realm>/<spec-hash>/<revision>")]
pub struct InstanceKeyParseError(String);

impl FromStr for InstanceKey {
    type Err = InstanceKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InstanceKeyParseError(s.to_owned());
        let mut parts = s.rsplitn(3, '/');
        let revision = parts.next().ok_or_else(err)?;
        let spec_hash = parts.next().ok_or_else(err)?;
        let realm_id = parts.next().ok_or_else(err)?;
        if realm_id.is_empty() || spec_hash.is_empty() {
            return Err(err());
        }
        Ok(InstanceKey {
            realm_id: realm_id.into(),
            spec_hash: spec_hash.into(),
            revision: revision.parse().map_err(|_| err())?,
        })
    }
}

/// The desired configuration of a realm, as read from its declaration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Realm {
    pub realm_id: RealmId,
    /// The scope in which the realm's resources live.
    pub namespace: String,
    pub spec: RealmSpec,
    /// Always equal to `spec.spec_hash()`; cached because every pass needs it.
    pub spec_hash: SpecHash,
}

impl Realm {
    pub fn new(realm_id: RealmId, namespace: impl Into<String>, spec: RealmSpec) -> Realm {
        let spec_hash = spec.spec_hash();
        Realm {
            realm_id,
            namespace: namespace.into(),
            spec,
            spec_hash,
        }
    }
}
