// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use kube::client::Client;
use kube::config::{Config, KubeConfigOptions, Kubeconfig};
use tracing::info;

/// Creates a Kubernetes client, preferring the local kubeconfig and falling
/// back to the in-cluster configuration.
///
/// Returns the client and the namespace it defaults to.
pub async fn create_client(context: Option<String>) -> Result<(Client, String), anyhow::Error> {
    let kubeconfig_options = KubeConfigOptions {
        context,
        ..Default::default()
    };
    let kubeconfig = match Kubeconfig::read() {
        Ok(kubeconfig) => Some(kubeconfig),
        Err(_) => {
            info!("no kubeconfig found; using in-cluster configuration");
            None
        }
    };
    let config = match kubeconfig {
        Some(kubeconfig) => Config::from_custom_kubeconfig(kubeconfig, &kubeconfig_options).await?,
        None => Config::incluster()?,
    };
    let namespace = config.default_namespace.clone();
    let client = Client::try_from(config)?;
    Ok((client, namespace))
}
