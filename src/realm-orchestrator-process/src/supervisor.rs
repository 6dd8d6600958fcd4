// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Keeps a replica's process running.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use realm_orchestrator::ReplicaState;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How to start one replica.
#[derive(Debug, Clone)]
pub struct ReplicaCommand {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub host: String,
    pub port: u16,
    pub config_dir: PathBuf,
}

#[derive(Debug, Default)]
struct Runtime {
    running: bool,
    restarts: u32,
    failure: Option<String>,
    last_message: Option<String>,
}

/// A replica process restarted whenever it exits. Dropping the supervisor
/// kills the process.
#[derive(Debug)]
pub struct Supervisor {
    name: String,
    address: String,
    runtime: Arc<Mutex<Runtime>>,
    handle: JoinHandle<()>,
}

impl Supervisor {
    pub fn spawn(command: ReplicaCommand, restart_backoff: Duration) -> Supervisor {
        let runtime = Arc::new(Mutex::new(Runtime::default()));
        let name = command.name.clone();
        let address = format!("{}:{}", command.host, command.port);
        let handle = tokio::spawn(supervise(command, Arc::clone(&runtime), restart_backoff));
        Supervisor {
            name,
            address,
            runtime,
            handle,
        }
    }

    pub fn state(&self) -> ReplicaState {
        let runtime = self.runtime.lock().expect("lock poisoned");
        ReplicaState {
            name: self.name.clone(),
            address: Some(self.address.clone()),
            running: runtime.running,
            restarts: runtime.restarts,
            failure: runtime.failure.clone(),
            last_message: runtime.last_message.clone(),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn supervise(command: ReplicaCommand, runtime: Arc<Mutex<Runtime>>, restart_backoff: Duration) {
    loop {
        let mut child = match Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .env("REALM_PORT", command.port.to_string())
            .env("REALM_CONFIG_DIR", &command.config_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                // Like an image that cannot be pulled, this does not resolve
                // by retrying.
                warn!(replica = %command.name, "failed to start {}: {e}", command.program);
                runtime.lock().expect("lock poisoned").failure =
                    Some(format!("failed to start {}: {e}", command.program));
                return;
            }
        };
        debug!(replica = %command.name, pid = ?child.id(), "replica started");
        runtime.lock().expect("lock poisoned").running = true;

        let stderr = child.stderr.take();
        let output = Arc::clone(&runtime);
        let collect_output = async move {
            let Some(stderr) = stderr else { return };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                output.lock().expect("lock poisoned").last_message = Some(line);
            }
        };
        let (status, ()) = tokio::join!(child.wait(), collect_output);

        {
            let mut runtime = runtime.lock().expect("lock poisoned");
            runtime.running = false;
            runtime.restarts += 1;
        }
        match status {
            Ok(status) => info!(replica = %command.name, %status, "replica exited; restarting"),
            Err(e) => warn!(replica = %command.name, "failed to wait for replica: {e}"),
        }
        tokio::time::sleep(restart_backoff).await;
    }
}
