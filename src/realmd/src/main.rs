// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The realm deployment operator.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::stream::BoxStream;
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use realm_controller::audit::AuditLog;
use realm_controller::client::{HttpReplicaClient, HttpReplicaClientConfig};
use realm_controller::metrics::Metrics;
use realm_controller::readiness::ProbeConfig;
use realm_controller::recycle::RecycleConfig;
use realm_controller::store::InMemoryStatusStore;
use realm_controller::{producer, task, Collaborators, Controller, ControllerConfig};
use realm_orchestrator::{Notification, RealmSource};
use realm_orchestrator_kubernetes::source::KubernetesRealmSource;
use realm_orchestrator_kubernetes::status::KubernetesStatusStore;
use realm_orchestrator_kubernetes::{KubernetesOrchestrator, KubernetesOrchestratorConfig};
use realm_orchestrator_process::recovery::FileRecoveryStore;
use realm_orchestrator_process::source::FileRealmSource;
use realm_orchestrator_process::{ProcessOrchestrator, ProcessOrchestratorConfig};

mod http;

const DEFAULT_LOG_FILTER: &str = "realmd=info,realm_controller=info,\
    realm_orchestrator_kubernetes=info,realm_orchestrator_process=info";

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    /// Run instances as StatefulSets in a Kubernetes cluster.
    Kubernetes,
    /// Run instances as processes on this machine.
    Process,
}

#[derive(Parser, Debug)]
#[clap(name = "realmd", next_line_help = true)]
struct Args {
    // === Backend options. ===
    /// Where realm instances run.
    #[clap(long, env = "REALMD_BACKEND", value_enum, default_value = "kubernetes")]
    backend: Backend,
    /// The namespace realms are declared in and default to. Defaults to the
    /// namespace of the Kubernetes context, or `default` for the process
    /// backend.
    #[clap(long, env = "REALMD_NAMESPACE")]
    namespace: Option<String>,
    /// The Kubernetes context to use.
    #[clap(long, env = "REALMD_KUBERNETES_CONTEXT")]
    kubernetes_context: Option<String>,
    /// The image pull policy of replica containers.
    #[clap(long, env = "REALMD_IMAGE_PULL_POLICY")]
    image_pull_policy: Option<String>,
    /// Where the process backend keeps instance state.
    #[clap(long, env = "REALMD_DATA_DIR", default_value = "realmd-data")]
    data_dir: PathBuf,
    /// Where the process backend reads `<realm>.json` declarations from.
    #[clap(long, env = "REALMD_REALMS_DIR", default_value = "realms")]
    realms_dir: PathBuf,
    /// How often the process backend rescans the realms directory.
    #[clap(long, env = "REALMD_POLL_INTERVAL", value_parser = humantime::parse_duration, default_value = "1s")]
    poll_interval: Duration,

    // === Controller options. ===
    /// The capacity of the notification queue.
    #[clap(long, env = "REALMD_QUEUE_CAPACITY", default_value = "1024")]
    queue_capacity: usize,
    /// How often replicas are polled before an instance is declared failed.
    #[clap(long, env = "REALMD_PROBE_ATTEMPTS", default_value = "24")]
    probe_attempts: u32,
    /// The pause between readiness polls.
    #[clap(long, env = "REALMD_PROBE_INTERVAL", value_parser = humantime::parse_duration, default_value = "5s")]
    probe_interval: Duration,
    /// How often a replica's sessions are queried before it counts as busy.
    #[clap(long, env = "REALMD_RECYCLE_ATTEMPTS", default_value = "3")]
    recycle_attempts: u32,
    /// The timeout of a single session query.
    #[clap(long, env = "REALMD_RECYCLE_TIMEOUT", value_parser = humantime::parse_duration, default_value = "2s")]
    recycle_timeout: Duration,
    /// Treat every superseded instance as recyclable, ignoring its sessions.
    #[clap(long, env = "REALMD_FORCE_RECYCLE")]
    force_recycle: bool,
    /// How often a conflicting status write is retried before giving up.
    #[clap(long, env = "REALMD_STATUS_WRITE_ATTEMPTS", default_value = "5")]
    status_write_attempts: usize,
    /// How often every realm is reconciled without a triggering event.
    #[clap(long, env = "REALMD_RESYNC_INTERVAL", value_parser = humantime::parse_duration, default_value = "30s")]
    resync_interval: Duration,
    /// The path of the replicas' health endpoint.
    #[clap(long, env = "REALMD_HEALTH_PATH", default_value = "/healthz")]
    health_path: String,
    /// The path of the replicas' active sessions endpoint.
    #[clap(long, env = "REALMD_SESSIONS_PATH", default_value = "/api/sessions")]
    sessions_path: String,

    // === Observability options. ===
    /// The address of the internal HTTP server.
    #[clap(long, env = "REALMD_LISTEN_ADDR", default_value = "127.0.0.1:6880")]
    listen_addr: SocketAddr,
    /// A file lifecycle events are appended to as JSON lines.
    #[clap(long, env = "REALMD_AUDIT_LOG")]
    audit_log: Option<PathBuf>,
    /// Which log messages to emit.
    #[clap(long, env = "REALMD_LOG_FILTER", default_value = DEFAULT_LOG_FILTER)]
    log_filter: String,
}

/// The backend-specific pieces of the operator.
struct Wiring {
    default_namespace: String,
    collaborators: Collaborators,
    producers: Vec<(&'static str, BoxStream<'static, Notification>)>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = match EnvFilter::try_new(&args.log_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("realmd: invalid log filter {:?}: {e}", args.log_filter);
            process::exit(1);
        }
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run(args).await {
        error!("realmd: fatal: {err:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let replica_client = Arc::new(HttpReplicaClient::new(HttpReplicaClientConfig {
        health_path: args.health_path.clone(),
        sessions_path: args.sessions_path.clone(),
        request_timeout: args.recycle_timeout,
    })?);
    let wiring = match args.backend {
        Backend::Kubernetes => kubernetes_wiring(&args, replica_client).await?,
        Backend::Process => process_wiring(&args, replica_client)?,
    };
    info!(backend = ?args.backend, namespace = %wiring.default_namespace, "starting realmd");

    let registry = Registry::new();
    let metrics = Metrics::register_into(&registry).context("registering metrics")?;
    let audit = match &args.audit_log {
        Some(path) => AuditLog::with_file(path)
            .with_context(|| format!("opening audit log {}", path.display()))?,
        None => AuditLog::new(),
    };

    let config = ControllerConfig {
        default_namespace: wiring.default_namespace.clone(),
        status_write_attempts: args.status_write_attempts,
        probe: ProbeConfig {
            attempts: args.probe_attempts,
            interval: args.probe_interval,
        },
        recycle: RecycleConfig {
            attempts: args.recycle_attempts,
            timeout: args.recycle_timeout,
            force: args.force_recycle,
            ..Default::default()
        },
        metrics_interval: args.resync_interval,
        ..Default::default()
    };
    let source = Arc::clone(&wiring.collaborators.source);
    let (queue_tx, queue_rx) = mpsc::channel(args.queue_capacity);
    let controller = Arc::new(Controller::new(
        config,
        wiring.collaborators,
        Arc::new(audit),
        metrics,
        queue_tx.clone(),
    ));

    // A missing realm definition or unreachable store surfaces here.
    let recovered = controller.recover().await?;
    info!("recovered {} realms", recovered.len());

    let mut tasks = vec![];
    let recovered_tx = queue_tx.clone();
    tasks.push(task::spawn(
        || "enqueue-recovered".into(),
        async move {
            for notification in recovered {
                if recovered_tx.send(notification).await.is_err() {
                    return;
                }
            }
        },
    ));
    for (name, stream) in wiring.producers {
        tasks.push(task::spawn(
            || format!("producer:{name}"),
            producer::forward(stream, queue_tx.clone()),
        ));
    }
    tasks.push(task::spawn(
        || "producer:resync".into(),
        producer::resync(source, queue_tx.clone(), args.resync_interval),
    ));
    drop(queue_tx);

    let listener = TcpListener::bind(args.listen_addr)
        .await
        .with_context(|| format!("binding {}", args.listen_addr))?;
    info!("internal HTTP server listening on {}", listener.local_addr()?);
    let router = http::router(Arc::clone(&controller), registry);
    let _server = task::spawn(
        || "internal-http-server".into(),
        axum::serve(listener, router).into_future(),
    );

    tokio::select! {
        result = controller.run(queue_rx) => result?,
        _ = tokio::signal::ctrl_c() => info!("received interrupt, shutting down"),
    }
    Ok(())
}

async fn kubernetes_wiring(
    args: &Args,
    replica_client: Arc<HttpReplicaClient>,
) -> Result<Wiring, anyhow::Error> {
    let orchestrator = KubernetesOrchestrator::new(KubernetesOrchestratorConfig {
        context: args.kubernetes_context.clone(),
        image_pull_policy: args.image_pull_policy.clone(),
        ..Default::default()
    })
    .await
    .context("connecting to Kubernetes")?;
    let namespace = args
        .namespace
        .clone()
        .unwrap_or_else(|| orchestrator.default_namespace().to_string());
    let client = orchestrator.client().clone();
    let source = Arc::new(KubernetesRealmSource::new(client.clone(), &namespace));
    let producers = vec![
        ("realms", source.watch()),
        ("replicas", orchestrator.watch_replicas(&namespace)),
    ];
    // The custom resource's status subresource survives restarts, so no
    // separate recovery record is kept.
    let collaborators = Collaborators {
        orchestrator: Arc::new(orchestrator),
        source,
        store: Arc::new(KubernetesStatusStore::new(client, &namespace)),
        recovery: None,
        replica_client,
    };
    Ok(Wiring {
        default_namespace: namespace,
        collaborators,
        producers,
    })
}

fn process_wiring(
    args: &Args,
    replica_client: Arc<HttpReplicaClient>,
) -> Result<Wiring, anyhow::Error> {
    let namespace = args.namespace.clone().unwrap_or_else(|| "default".into());
    let orchestrator = ProcessOrchestrator::new(ProcessOrchestratorConfig::new(&args.data_dir))?;
    let source = Arc::new(FileRealmSource::new(
        &args.realms_dir,
        &namespace,
        args.poll_interval,
    ));
    let producers = vec![("realms", source.watch())];
    let collaborators = Collaborators {
        orchestrator: Arc::new(orchestrator),
        source,
        store: Arc::new(InMemoryStatusStore::new()),
        recovery: Some(Arc::new(FileRecoveryStore::new(
            args.data_dir.join("recovery.json"),
        ))),
        replica_client,
    };
    Ok(Wiring {
        default_namespace: namespace,
        collaborators,
        producers,
    })
}
