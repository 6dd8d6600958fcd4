// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::SpecHash;

/// The desired configuration of a realm's workload.
///
/// Every field participates in the [spec hash](RealmSpec::spec_hash), so any
/// change to the declaration produces a new instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RealmSpec {
    /// The container image (or, for the process backend, the executable) to run.
    pub image: String,
    /// The number of replicas to run for each instance.
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Arguments passed to every replica.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables set on every replica.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Configuration files, by file name, made available to every replica.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// The port on which replicas serve traffic, health and session endpoints.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for RealmSpec {
    fn default() -> Self {
        RealmSpec {
            image: String::new(),
            replicas: default_replicas(),
            args: Vec::new(),
            env: BTreeMap::new(),
            config: BTreeMap::new(),
            port: default_port(),
        }
    }
}

fn default_replicas() -> u32 {
    1
}

fn default_port() -> u16 {
    8080
}

/// A malformed realm declaration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("image must not be empty")]
    EmptyImage,
    #[error("replicas must be at least 1")]
    NoReplicas,
    #[error("port must not be 0")]
    InvalidPort,
    #[error("invalid config file name {0:?}")]
    InvalidConfigName(String),
}

impl RealmSpec {
    /// Computes the content hash of this spec.
    ///
    /// The hash is the SHA-256 of the JSON serialization. All maps are
    /// ordered, so equal specs always hash equally.
    pub fn spec_hash(&self) -> SpecHash {
        let json = serde_json::to_vec(self).expect("realm spec serializes to JSON");
        let mut hasher = Sha256::new();
        hasher.update(json);
        SpecHash::new(format!("{:x}", hasher.finalize()))
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.image.trim().is_empty() {
            return Err(SpecError::EmptyImage);
        }
        if self.replicas == 0 {
            return Err(SpecError::NoReplicas);
        }
        if self.port == 0 {
            return Err(SpecError::InvalidPort);
        }
        for name in self.config.keys() {
            if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
                return Err(SpecError::InvalidConfigName(name.clone()));
            }
        }
        Ok(())
    }
}
