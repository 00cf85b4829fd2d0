mod config;
mod coordination;
mod framework;
mod inspect;
mod logging;
mod plugin;
mod resources;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use clap::Parser;
use gcushare_common::kube_client::init_kube_client;
use gcushare_common::ResourceConfig;
use gcushare_common::SystemClock;
use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::Api;
use kube::Client;
use poem::listener::TcpListener;
use poem::Server;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::SchedulerArgs;
use crate::config::COMPONENT_NAME;
use crate::inspect::Inspector;
use crate::plugin::GcuSharePlugin;
use crate::resources::BaseResource;
use crate::resources::NodeResource;
use crate::resources::PodResource;

#[tokio::main]
async fn main() -> Result<()> {
    let args = SchedulerArgs::parse();
    let _guard = logging::init(&args.log_dir, &format!("{COMPONENT_NAME}.log"));
    info!("starting {COMPONENT_NAME} {}", routes::VERSION);

    if let Err(e) = run(args).await {
        error!("{COMPONENT_NAME} failed: {e:?}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(args: SchedulerArgs) -> Result<()> {
    let resource_config = args.resource_config();
    let client = init_kube_client(args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow!("init kube client: {e:?}"))?;

    wait_device_plugin_running(&client, &resource_config).await;

    let plugin = Arc::new(GcuSharePlugin::new(
        resource_config.clone(),
        client.clone(),
        Arc::new(SystemClock),
    ));
    info!(plugin = plugin.name(), "scheduler plugin ready");

    let base = BaseResource::new(resource_config, client.clone());
    let inspector = Arc::new(Inspector::new(
        client,
        PodResource::new(base.clone()),
        NodeResource::new(base),
    ));

    let app = routes::routes(plugin, inspector);
    let addr = format!("0.0.0.0:{}", args.port);
    info!(addr = %addr, "serving scheduler plugin http endpoints");

    let mut sigterm = signal(SignalKind::terminate())?;
    Server::new(TcpListener::bind(addr))
        .run_with_graceful_shutdown(
            app,
            async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            },
            Some(Duration::from_secs(5)),
        )
        .await?;
    Ok(())
}

/// Blocks until every gcushare-labeled node advertises a positive amount of
/// the shared resource, i.e. the device plugin is up everywhere.
async fn wait_device_plugin_running(client: &Client, config: &ResourceConfig) {
    let api: Api<Node> = Api::all(client.clone());
    let params = ListParams::default().labels(&format!("{}=true", config.gcushare_label()));
    let resource_name = config.shared_resource_name();
    loop {
        match api.list(&params).await {
            Ok(nodes) if nodes.items.is_empty() => {
                error!("no gcushare nodes found; is the gcushare device plugin deployed?");
            }
            Ok(nodes) => {
                let mut all_running = true;
                for node in &nodes.items {
                    let advertised = node
                        .status
                        .as_ref()
                        .and_then(|s| s.allocatable.as_ref())
                        .and_then(|a| a.get(&resource_name))
                        .and_then(|q| q.0.parse::<i64>().ok())
                        .is_some_and(|v| v > 0);
                    if !advertised {
                        warn!(
                            node = node.metadata.name.as_deref().unwrap_or_default(),
                            "gcushare device plugin is not working on this node yet"
                        );
                        all_running = false;
                    }
                }
                if all_running {
                    info!("gcushare device plugin is running on every gcushare node");
                    return;
                }
            }
            Err(e) => error!("list gcushare nodes failed: {e}"),
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
}
