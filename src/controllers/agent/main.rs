use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use kube::Client;
use rook_controllers::{
    attachment::{
        coordinator::{AttachmentCoordinator, KubePodLookup, RbdVolumes},
        flex::install_driver,
        rpc::{bind, serve, AgentService},
        store::KubeAttachmentStore,
    },
    client::executor::{CommandExecutor, ProcessExecutor},
    config::{AgentArgs, AgentConfig},
    telemetry::{metrics::Metrics, telemetry},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = AgentArgs::parse();
    telemetry::init(args.common.log_json).await?;
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;
    let config = AgentConfig::from(&args);
    info!("rook agent starting on node {}", config.node_name);

    if let Some(binary) = &args.driver_binary {
        install_driver(binary, &config.driver_dir(), &config.driver).await?;
    }

    let client = Client::try_default().await?;
    let store = KubeAttachmentStore::discover(client.clone(), &config.namespace).await?;
    let executor: Arc<dyn CommandExecutor> = Arc::new(ProcessExecutor);
    let coordinator = AttachmentCoordinator::new(
        config.node_name.clone(),
        Arc::new(store),
        Arc::new(KubePodLookup::new(client.clone())),
        Arc::new(RbdVolumes::new(executor.clone(), config.config_dir.clone())),
        Arc::new(Metrics::default()),
    );

    let listener = bind(&config.socket_path())?;
    let service = AgentService::new(config, client, coordinator, executor);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutting down"),
            Err(e) => warn!("failed to listen for shutdown: {e}"),
        }
        shutdown.cancel();
    });
    serve(listener, Arc::new(service), cancel).await;
    Ok(())
}
