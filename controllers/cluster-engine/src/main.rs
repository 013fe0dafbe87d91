//! Cluster engine
//!
//! Leader-elected controller that boots and maintains Kubernetes clusters on
//! bare-metal nodes. The cluster is declared in the engine's etcd under
//! `/cluster`; process settings come from flags or `CLUSTEROPS_*` variables.

use anyhow::Context;
use clap::Parser;
use cluster_engine::broker::{BrokerHandle, VaultBroker};
use cluster_engine::{Config, Controller, DefaultConnector, ProbeState, Settings, probes};
use kv_store::{EtcdKv, Storage};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    // kube and reqwest both link rustls; pick the provider explicitly.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Config::parse();
    info!("Starting cluster engine");
    info!("Configuration:");
    info!("  etcd endpoints: {}", config.etcd_endpoints.join(","));
    info!("  Interval: {}s", config.interval);
    info!("  Max concurrent updates: {}", config.max_concurrent_updates);
    info!("  Probe address: {}", config.probe_addr);

    let tls = config.etcd_tls().context("failed to load etcd TLS material")?;
    let kv = EtcdKv::connect(&config.etcd_endpoints, tls)
        .await
        .context("failed to connect to etcd")?;
    let storage = Storage::new(Arc::new(kv));

    let broker = BrokerHandle::new(None);
    match storage.get_vault_config().await {
        Ok(vault) => match VaultBroker::connect(&vault).await {
            Ok(issuer) => broker.replace(Arc::new(issuer)),
            Err(e) => warn!("Failed to connect to credential broker: {}", e),
        },
        Err(e) if e.is_not_found() => warn!("No credential broker configured yet"),
        Err(e) => return Err(e).context("failed to read credential broker configuration"),
    }

    let ctx = CancellationToken::new();
    let probe_state = ProbeState::new();
    let probe_server = tokio::spawn(probes::serve(config.probe_addr, probe_state.clone(), ctx.clone()));

    tokio::spawn({
        let ctx = ctx.clone();
        async move {
            if let Err(e) = shutdown_signal().await {
                error!("Failed to listen for shutdown signals: {}", e);
            }
            info!("Shutdown requested");
            ctx.cancel();
        }
    });

    let connector = DefaultConnector::new(config.ssh_config(), config.ssh_user.clone());
    let controller = Controller::new(
        storage,
        Arc::new(connector),
        broker,
        Settings::from_config(&config),
        probe_state,
    );
    let result = controller.run(ctx.clone()).await;

    ctx.cancel();
    match probe_server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Probe server failed: {}", e),
        Err(e) => warn!("Probe server task failed: {}", e),
    }
    result.context("controller failed")
}

async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}
