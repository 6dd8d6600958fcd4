// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Talking to the replicas of an instance.

use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;

/// Queries the health and session endpoints that every replica serves.
#[async_trait]
pub trait ReplicaClient: fmt::Debug + Send + Sync {
    /// Whether the replica at `address` reports itself healthy.
    async fn health(&self, address: &str) -> Result<bool, anyhow::Error>;

    /// The number of user sessions active on the replica at `address`.
    async fn active_sessions(&self, address: &str) -> Result<u64, anyhow::Error>;
}

/// Configures an [`HttpReplicaClient`].
#[derive(Debug, Clone)]
pub struct HttpReplicaClientConfig {
    pub health_path: String,
    pub sessions_path: String,
    pub request_timeout: Duration,
}

impl Default for HttpReplicaClientConfig {
    fn default() -> Self {
        HttpReplicaClientConfig {
            health_path: "/healthz".into(),
            sessions_path: "/api/sessions".into(),
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// A [`ReplicaClient`] that speaks HTTP.
///
/// The health endpoint is healthy when it answers with a success status. The
/// sessions endpoint answers with `{"activeSessions": <n>}`.
#[derive(Debug, Clone)]
pub struct HttpReplicaClient {
    client: reqwest::Client,
    config: HttpReplicaClientConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionsResponse {
    active_sessions: u64,
}

impl HttpReplicaClient {
    pub fn new(config: HttpReplicaClientConfig) -> Result<HttpReplicaClient, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("building HTTP client")?;
        Ok(HttpReplicaClient { client, config })
    }

    fn url(&self, address: &str, path: &str) -> String {
        format!("http://{address}{path}")
    }
}

#[async_trait]
impl ReplicaClient for HttpReplicaClient {
    async fn health(&self, address: &str) -> Result<bool, anyhow::Error> {
        let response = self
            .client
            .get(self.url(address, &self.config.health_path))
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    async fn active_sessions(&self, address: &str) -> Result<u64, anyhow::Error> {
        let response = self
            .client
            .get(self.url(address, &self.config.sessions_path))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("session endpoint of {address} returned {}", response.status());
        }
        let body: SessionsResponse = response.json().await?;
        Ok(body.active_sessions)
    }
}
