// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

use anyhow::{bail, Context as _, Result};
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use clap::Parser;
use futures::StreamExt;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{controller, controller::Action, watcher, Controller},
    Api, Client, ResourceExt,
};
use kube_lease_manager::LeaseManagerBuilder;
use potter_controller::{
    config::{unknown_config_types, Args, ControllerConfig},
    constants::{
        ERROR_POLICY_REQUEUE_SECS, KIND_CLUSTER_BOM, KIND_DEPLOY_ITEM, LEADER_LEASE_DURATION_SECS,
        LEADER_LEASE_GRACE_SECS, LEADER_LEASE_NAME, TOKIO_WORKER_THREADS,
    },
    context::Context,
    crd::{ClusterBom, DeployItem},
    labels::NOT_LANDSCAPER_MANAGED,
    metrics,
    reconcilers::{
        reconcile_clusterbom, reconcile_clusterbom_state, reconcile_deploy_item,
        PeriodicReconciler,
    },
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
struct ReconcileError(#[from] anyhow::Error);

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(TOKIO_WORKER_THREADS)
        .thread_name("potter-controller")
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting potter controller");

    let config = ControllerConfig::from_env().context("invalid controller environment")?;
    let config_types = args.config_types();
    for unknown in unknown_config_types(&config_types) {
        warn!(config_type = %unknown, "No deployer implements this config type, its deploy items are left untouched");
    }
    for flag in args.inert_flags() {
        warn!(flag = flag, "Flag is accepted for compatibility but has no effect");
    }
    let metrics_addr = args.metrics_socket_addr()?;

    debug!("Initializing Kubernetes clients");
    let client = Client::try_default().await?;
    let hub_client = hub_client(&args, &client).await?;
    debug!("Kubernetes clients initialized");

    let ctx = Arc::new(Context::new(client.clone(), hub_client, &args, &config));

    let leadership = if args.enable_leader_election {
        Some(acquire_leadership(client, &ctx.settings.pod_namespace, config.unique_id()).await?)
    } else {
        None
    };

    info!(
        config_types = ?config_types,
        landscaper_enabled = args.landscaper_enabled,
        skip_reconcile = args.skip_reconcile,
        "Starting all controllers"
    );

    // Controllers never exit under normal operation; if one does, the process exits.
    tokio::select! {
        result = run_clusterbom_controller(ctx.clone(), config.threads_clusterbom_controller) => {
            error!("CRITICAL: ClusterBom controller exited unexpectedly: {:?}", result);
            result?;
            bail!("ClusterBom controller exited unexpectedly without error")
        }
        result = run_deployment_controller(ctx.clone(), config.threads_deployment_controller) => {
            error!("CRITICAL: DeployItem controller exited unexpectedly: {:?}", result);
            result?;
            bail!("DeployItem controller exited unexpectedly without error")
        }
        result = run_state_controller(ctx.clone(), config.threads_state_controller) => {
            error!("CRITICAL: ClusterBom state controller exited unexpectedly: {:?}", result);
            result?;
            bail!("ClusterBom state controller exited unexpectedly without error")
        }
        result = run_periodic_reconciler(ctx.clone(), args.skip_reconcile) => {
            error!("CRITICAL: Periodic reconciler exited unexpectedly: {:?}", result);
            result?;
            bail!("Periodic reconciler exited unexpectedly without error")
        }
        result = run_metrics_server(metrics_addr) => {
            error!("CRITICAL: Metrics server exited unexpectedly: {:?}", result);
            result?;
            bail!("Metrics server exited unexpectedly without error")
        }
        result = watch_leadership(leadership) => {
            error!("CRITICAL: Leadership lost: {:?}", result);
            result?;
            bail!("Leadership lost")
        }
        () = shutdown_signal() => {
            info!("Shutdown signal received, stopping controllers");
            Ok(())
        }
    }
}

/// Installs the tracing subscriber.
///
/// `RUST_LOG` wins over `--loglevel`; `RUST_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing(args: &Args) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_filter()));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .init();
        }
    }
}

/// Kubeconfig file for the hub cluster, if one was given.
fn hub_kubeconfig_path(args: &Args) -> Option<&str> {
    Some(args.hubcontroller_kubeconfig.as_str()).filter(|path| args.runs_locally && !path.is_empty())
}

/// Client for the cluster the controller itself runs in.
///
/// Outside the cluster (`--runs-locally`) this is read from
/// `--hubcontroller-kubeconfig`; otherwise it is the default client.
async fn hub_client(args: &Args, client: &Client) -> Result<Client> {
    let Some(path) = hub_kubeconfig_path(args) else {
        return Ok(client.clone());
    };
    debug!(path = path, "Loading hub cluster kubeconfig");
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("failed to read hub kubeconfig {path}"))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("invalid hub kubeconfig {path}"))?;
    Ok(Client::try_from(config)?)
}

/// Blocks until this instance holds the leader lease.
async fn acquire_leadership(
    client: Client,
    namespace: &str,
    identity: String,
) -> Result<(watch::Receiver<bool>, String)> {
    info!(lease = LEADER_LEASE_NAME, namespace = namespace, identity = %identity, "Waiting for leadership");

    let manager = LeaseManagerBuilder::new(client, LEADER_LEASE_NAME)
        .with_namespace(namespace)
        .with_identity(&identity)
        .with_duration(LEADER_LEASE_DURATION_SECS)
        .with_grace(LEADER_LEASE_GRACE_SECS)
        .build()
        .await?;
    let (mut channel, _task) = manager.watch().await;

    while !*channel.borrow_and_update() {
        channel
            .changed()
            .await
            .context("lease manager stopped before leadership was acquired")?;
    }

    info!(identity = %identity, "Leadership acquired");
    metrics::record_leader_elected(&identity);
    Ok((channel, identity))
}

/// Resolves once leadership is lost; never resolves without leader election.
async fn watch_leadership(leadership: Option<(watch::Receiver<bool>, String)>) -> Result<()> {
    let Some((mut channel, identity)) = leadership else {
        return std::future::pending().await;
    };
    loop {
        if channel.changed().await.is_err() {
            bail!("lease manager stopped");
        }
        if *channel.borrow_and_update() {
            metrics::record_leader_renewed();
        } else {
            metrics::record_leader_lost(&identity);
            return Ok(());
        }
    }
}

/// Waits for SIGTERM or Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Serves `/metrics` in the Prometheus text format.
async fn run_metrics_server(addr: SocketAddr) -> Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics endpoint {addr}"))?;
    info!(addr = %addr, "Serving metrics");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Run the periodic reconciler unless disabled.
async fn run_periodic_reconciler(ctx: Arc<Context>, skip: bool) -> Result<()> {
    if skip {
        info!("Periodic reconcile disabled");
        return std::future::pending().await;
    }
    PeriodicReconciler::new(ctx).run().await
}

/// Run the `ClusterBom` projection controller
async fn run_clusterbom_controller(ctx: Arc<Context>, concurrency: u16) -> Result<()> {
    info!(concurrency = concurrency, "Starting ClusterBom controller");

    let api = Api::<ClusterBom>::all(ctx.client.clone());

    Controller::new(api, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .run(reconcile_clusterbom_wrapper, error_policy, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

/// Run the `DeployItem` deployment controller
async fn run_deployment_controller(ctx: Arc<Context>, concurrency: u16) -> Result<()> {
    info!(concurrency = concurrency, "Starting DeployItem controller");

    let api = Api::<DeployItem>::all(ctx.client.clone());

    Controller::new(api, watcher::Config::default().labels(NOT_LANDSCAPER_MANAGED))
        .with_config(controller::Config::default().concurrency(concurrency))
        .run(reconcile_deploy_item_wrapper, error_policy, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

/// Run the `ClusterBom` state aggregation controller
async fn run_state_controller(ctx: Arc<Context>, concurrency: u16) -> Result<()> {
    info!(concurrency = concurrency, "Starting ClusterBom state controller");

    let api = Api::<DeployItem>::all(ctx.client.clone());

    Controller::new(api, watcher::Config::default().labels(NOT_LANDSCAPER_MANAGED))
        .with_config(controller::Config::default().concurrency(concurrency))
        .run(reconcile_state_wrapper, error_policy, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

/// Reconcile wrapper for `ClusterBom`
async fn reconcile_clusterbom_wrapper(
    clusterbom: Arc<ClusterBom>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let start = Instant::now();
    let name = clusterbom.name_any();
    let namespace = clusterbom.namespace().unwrap_or_default();

    match reconcile_clusterbom(ctx, clusterbom).await {
        Ok(action) => {
            debug!("Successfully reconciled ClusterBom: {}/{}", namespace, name);
            metrics::record_reconciliation_success(KIND_CLUSTER_BOM, start.elapsed());
            Ok(action)
        }
        Err(e) => {
            error!("Failed to reconcile ClusterBom {}/{}: {:#}", namespace, name, e);
            metrics::record_reconciliation_error(KIND_CLUSTER_BOM, start.elapsed());
            Err(e.into())
        }
    }
}

/// Reconcile wrapper for `DeployItem` deployments
async fn reconcile_deploy_item_wrapper(
    item: Arc<DeployItem>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let start = Instant::now();
    let name = item.name_any();
    let namespace = item.namespace().unwrap_or_default();

    match reconcile_deploy_item(ctx, item).await {
        Ok(action) => {
            debug!("Successfully reconciled DeployItem: {}/{}", namespace, name);
            metrics::record_reconciliation_success(KIND_DEPLOY_ITEM, start.elapsed());
            Ok(action)
        }
        Err(e) => {
            error!("Failed to reconcile DeployItem {}/{}: {:#}", namespace, name, e);
            metrics::record_reconciliation_error(KIND_DEPLOY_ITEM, start.elapsed());
            Err(e.into())
        }
    }
}

/// Reconcile wrapper for the `ClusterBom` state of a `DeployItem`
async fn reconcile_state_wrapper(
    item: Arc<DeployItem>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let start = Instant::now();
    let name = item.name_any();
    let namespace = item.namespace().unwrap_or_default();

    match reconcile_clusterbom_state(ctx, item).await {
        Ok(action) => {
            debug!("Successfully aggregated state of DeployItem: {}/{}", namespace, name);
            metrics::record_reconciliation_success(KIND_CLUSTER_BOM, start.elapsed());
            Ok(action)
        }
        Err(e) => {
            error!(
                "Failed to aggregate state of DeployItem {}/{}: {:#}",
                namespace, name, e
            );
            metrics::record_reconciliation_error(KIND_CLUSTER_BOM, start.elapsed());
            Err(e.into())
        }
    }
}

/// Error policy shared by all controllers
fn error_policy<K>(_resource: Arc<K>, _err: &ReconcileError, _ctx: Arc<Context>) -> Action {
    Action::requeue(Duration::from_secs(ERROR_POLICY_REQUEUE_SECS))
}
