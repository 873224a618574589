//! Block-Storage Manager
//!
//! Per-node manager daemon. Watches the storage custom resources and the
//! platform objects they depend on, and runs the node, engine-image and
//! workload-status controllers against a shared cache.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Watch streams (kube)                          │
//! │  EngineImage StorageNode InstanceManager Volume Engine Replica        │
//! │  Pod Node DaemonSet PersistentVolume PersistentVolumeClaim VA         │
//! └───────────────┬───────────────────────────────────┬──────────────────┘
//!                 │ reflector caches                  │ touched objects
//!        ┌────────┴────────┐                 ┌────────┴────────┐
//!        │    Datastore    │                 │   EventFanout   │
//!        └────────┬────────┘                 └────────┬────────┘
//!                 │                                   │ keys
//!   ┌─────────────┼───────────────────┬───────────────┴─────────┐
//!   │ NodeController │ EngineImageController │ WorkloadStatusController │
//!   └──────────────────────────────────────────────────────────┘
//! ```

use anyhow::Context;
use clap::Parser;
use futures::Stream;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::runtime::watcher;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blockstore_manager::config::parse_label_selector;
use blockstore_manager::controller::{
    drive, ensure_default_engine_image, Controller, ControllerMetrics, EngineImageController,
    EventFanout, KubeEventRecorder, NodeController, WorkloadStatusController,
};
use blockstore_manager::crd::{
    crds_yaml, Engine, EngineImage, InstanceManager, Replica, StorageNode, Volume,
};
use blockstore_manager::datastore::{cluster::reflect, Datastore, KubeRepository, Repo};
use blockstore_manager::domain::ports::{ApiVersionRange, SystemClock};
use blockstore_manager::domain::ApiRangeChecker;
use blockstore_manager::hardware::{HostBinaryInspector, StatvfsProbe};
use blockstore_manager::{Error, ManagerConfig, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Block-Storage Manager - engine images, node disks and workload state
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Print the CRD manifests as YAML and exit
    #[arg(long)]
    print_crds: bool,

    /// Namespace holding the manager's objects
    #[arg(long, env = "POD_NAMESPACE", default_value = "blockstore-system")]
    namespace: String,

    /// Name of the node this instance runs on
    #[arg(long, env = "NODE_NAME", default_value = "")]
    node_name: String,

    /// Engine image that is never expired
    #[arg(long, env = "DEFAULT_ENGINE_IMAGE", default_value = "")]
    default_engine_image: String,

    /// Minutes an unused engine image is kept
    #[arg(long, env = "ENGINE_IMAGE_GRACE_MINUTES", default_value = "60")]
    engine_image_grace_minutes: u64,

    /// Host directory receiving engine binaries
    #[arg(
        long,
        env = "ENGINE_BINARIES_DIR",
        default_value = "/var/lib/blockstore/engine-binaries"
    )]
    engine_binaries_dir: PathBuf,

    /// Lowest engine CLI API version this manager accepts
    #[arg(long, env = "ENGINE_API_MIN_VERSION", default_value = "3")]
    engine_api_min_version: i32,

    /// Engine CLI API version this manager speaks
    #[arg(long, env = "ENGINE_API_VERSION", default_value = "4")]
    engine_api_version: i32,

    /// Percentage of a disk that must stay available for scheduling
    #[arg(long, env = "STORAGE_MINIMAL_AVAILABLE_PERCENTAGE", default_value = "25")]
    storage_minimal_available_percentage: i64,

    /// Percentage of usable disk space that may be scheduled
    #[arg(long, env = "STORAGE_OVER_PROVISIONING_PERCENTAGE", default_value = "200")]
    storage_over_provisioning_percentage: i64,

    /// Label selector of the manager daemon pods
    #[arg(long, env = "MANAGER_POD_SELECTOR", default_value = "app=blockstore-manager")]
    manager_pod_selector: String,

    /// CSI driver name of our persistent volumes
    #[arg(long, env = "CSI_DRIVER_NAME", default_value = "driver.blockstore.io")]
    csi_driver_name: String,

    /// Workers per controller
    #[arg(long, env = "WORKERS", default_value = "2")]
    workers: usize,

    /// Failed reconciles before a key is dropped
    #[arg(long, env = "MAX_RETRIES", default_value = "15")]
    max_retries: u32,

    /// Disk probe and engine binary timeout in seconds
    #[arg(long, env = "PROBE_TIMEOUT", default_value = "10")]
    probe_timeout_secs: u64,

    /// Full resync interval in seconds
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "30")]
    resync_secs: u64,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn manager_config(&self) -> Result<ManagerConfig> {
        let config = ManagerConfig {
            namespace: self.namespace.clone(),
            controller_id: self.node_name.clone(),
            default_engine_image: self.default_engine_image.clone(),
            engine_image_grace: Duration::from_secs(self.engine_image_grace_minutes * 60),
            engine_binaries_dir: self.engine_binaries_dir.clone(),
            api_range: ApiVersionRange {
                min_version: self.engine_api_min_version,
                current_version: self.engine_api_version,
            },
            storage_minimal_available_percentage: self.storage_minimal_available_percentage,
            storage_over_provisioning_percentage: self.storage_over_provisioning_percentage,
            manager_pod_labels: parse_label_selector(&self.manager_pod_selector)?,
            csi_driver_name: self.csi_driver_name.clone(),
            workers: self.workers,
            max_retries: self.max_retries,
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            resync_period: Duration::from_secs(self.resync_secs),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_crds {
        print!("{}", crds_yaml()?);
        return Ok(());
    }

    init_logging(&args);
    let config = args.manager_config().context("invalid configuration")?;

    info!("Starting Block-Storage Manager");
    info!("  Version: {}", blockstore_manager::VERSION);
    info!("  Node: {}", config.controller_id);
    info!("  Namespace: {}", config.namespace);
    info!("  Default engine image: {}", config.default_engine_image);

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let token = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));

    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Caches and their watch streams
    let ns = Some(config.namespace.as_str());
    let (engine_images, engine_image_events) =
        watch_namespaced::<EngineImage>(&client, "EngineImage", ns);
    let (storage_nodes, storage_node_events) =
        watch_namespaced::<StorageNode>(&client, "StorageNode", ns);
    let (instance_managers, instance_manager_events) =
        watch_namespaced::<InstanceManager>(&client, "InstanceManager", ns);
    let (volumes, volume_events) = watch_namespaced::<Volume>(&client, "Volume", ns);
    let (engines, engine_events) = watch_namespaced::<Engine>(&client, "Engine", ns);
    let (replicas, replica_events) = watch_namespaced::<Replica>(&client, "Replica", ns);
    let (pods, pod_events) = watch_namespaced::<Pod>(&client, "Pod", None);
    let (daemon_sets, daemon_set_events) =
        watch_namespaced::<DaemonSet>(&client, "DaemonSet", ns);
    let (persistent_volume_claims, pvc_events) =
        watch_namespaced::<PersistentVolumeClaim>(&client, "PersistentVolumeClaim", None);
    let (kube_nodes, kube_node_events) = watch_cluster::<Node>(&client, "Node");
    let (persistent_volumes, pv_events) =
        watch_cluster::<PersistentVolume>(&client, "PersistentVolume");
    let (volume_attachments, va_events) =
        watch_cluster::<VolumeAttachment>(&client, "VolumeAttachment");

    let ds = Datastore {
        namespace: config.namespace.clone(),
        engine_images,
        storage_nodes,
        instance_managers,
        volumes,
        engines,
        replicas,
        pods,
        kube_nodes,
        daemon_sets,
        persistent_volumes,
        persistent_volume_claims,
        volume_attachments,
    };

    let metrics = ControllerMetrics::register(prometheus::default_registry())?;
    let clock = Arc::new(SystemClock);
    let recorder = Arc::new(KubeEventRecorder::new(
        client.clone(),
        &config.controller_id,
    ));

    let node_controller = Controller::new(
        Arc::new(NodeController::new(
            ds.clone(),
            config.clone(),
            Arc::new(StatvfsProbe::new(config.probe_timeout)),
            clock.clone(),
            recorder.clone(),
        )),
        &config,
        metrics.clone(),
    );
    let image_controller = Controller::new(
        Arc::new(EngineImageController::new(
            ds.clone(),
            config.clone(),
            Arc::new(HostBinaryInspector::new(
                config.engine_binaries_dir.clone(),
                config.probe_timeout,
            )),
            Arc::new(ApiRangeChecker),
            clock.clone(),
            recorder.clone(),
        )),
        &config,
        metrics.clone(),
    );
    let workload_controller = Controller::new(
        Arc::new(WorkloadStatusController::new(
            ds.clone(),
            config.clone(),
            clock,
            recorder,
        )),
        &config,
        metrics,
    );

    let fanout = Arc::new(EventFanout::new(
        ds.clone(),
        config.clone(),
        node_controller.queue(),
        image_controller.queue(),
        workload_controller.queue(),
        workload_controller.reconciler().clone(),
    ));

    let mut tasks = vec![
        tokio::spawn(drive(fanout.clone(), "EngineImage", engine_image_events, token.clone())),
        tokio::spawn(drive(fanout.clone(), "StorageNode", storage_node_events, token.clone())),
        tokio::spawn(drive(
            fanout.clone(),
            "InstanceManager",
            instance_manager_events,
            token.clone(),
        )),
        tokio::spawn(drive(fanout.clone(), "Volume", volume_events, token.clone())),
        tokio::spawn(drive(fanout.clone(), "Engine", engine_events, token.clone())),
        tokio::spawn(drive(fanout.clone(), "Replica", replica_events, token.clone())),
        tokio::spawn(drive(fanout.clone(), "Pod", pod_events, token.clone())),
        tokio::spawn(drive(fanout.clone(), "DaemonSet", daemon_set_events, token.clone())),
        tokio::spawn(drive(fanout.clone(), "PersistentVolumeClaim", pvc_events, token.clone())),
        tokio::spawn(drive(fanout.clone(), "Node", kube_node_events, token.clone())),
        tokio::spawn(drive(fanout.clone(), "PersistentVolume", pv_events, token.clone())),
        tokio::spawn(drive(fanout.clone(), "VolumeAttachment", va_events, token.clone())),
    ];

    // Workers start only once every cache holds a full listing
    tasks.push(tokio::spawn(
        node_controller.run(cache_synced(&ds), token.clone()),
    ));
    tasks.push(tokio::spawn(
        image_controller.run(cache_synced(&ds), token.clone()),
    ));
    tasks.push(tokio::spawn(
        workload_controller.run(cache_synced(&ds), token.clone()),
    ));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Waiting for caches to sync");
    let synced = tokio::select! {
        result = ds.wait_for_cache_sync() => {
            result.context("caches failed to sync")?;
            true
        }
        signal = &mut shutdown => {
            signal.context("failed to listen for shutdown signal")?;
            false
        }
    };

    if synced {
        if let Err(e) = ensure_default_engine_image(&ds, &config).await {
            error!("Failed to create the default engine image: {}", e);
        }
        tasks.push(tokio::spawn(
            fanout.clone().run_resync(config.resync_period, token.clone()),
        ));
        ready.store(true, Ordering::SeqCst);
        info!("Caches synced, controllers started");

        (&mut shutdown)
            .await
            .context("failed to listen for shutdown signal")?;
    }
    info!("Shutdown requested");
    ready.store(false, Ordering::SeqCst);
    token.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!("Task failed during shutdown: {}", e);
        }
    }

    info!("Manager shutdown complete");
    Ok(())
}

// =============================================================================
// Watches
// =============================================================================

fn cache_synced(ds: &Datastore) -> impl Future<Output = Result<()>> {
    let ds = ds.clone();
    async move { ds.wait_for_cache_sync().await }
}

fn watch_namespaced<K>(
    client: &Client,
    kind: &'static str,
    namespace: Option<&str>,
) -> (
    Repo<K>,
    impl Stream<Item = std::result::Result<K, watcher::Error>>,
)
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone + Send + Sync,
{
    let api = match namespace {
        Some(ns) => Api::<K>::namespaced(client.clone(), ns),
        None => Api::<K>::all(client.clone()),
    };
    let (store, stream) = reflect(api, watcher::Config::default());
    let repo: Repo<K> = Arc::new(KubeRepository::namespaced(kind, client.clone(), store));
    (repo, stream)
}

fn watch_cluster<K>(
    client: &Client,
    kind: &'static str,
) -> (
    Repo<K>,
    impl Stream<Item = std::result::Result<K, watcher::Error>>,
)
where
    K: Resource<Scope = ClusterResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone + Send + Sync,
{
    let (store, stream) = reflect(Api::<K>::all(client.clone()), watcher::Config::default());
    let repo: Repo<K> = Arc::new(KubeRepository::cluster(kind, client.clone(), store));
    (repo, stream)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "starting"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = respond(StatusCode::OK, buffer);
                            if let Ok(value) = encoder.format_type().parse() {
                                response
                                    .headers_mut()
                                    .insert(hyper::header::CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    }
                }
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
