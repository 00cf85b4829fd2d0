mod config;
mod coordination;
mod endpoint;
mod hardware;
mod health;
mod inventory;
mod kubelet;
mod logging;
mod node;
mod pod_cache;

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use device_plugin_pb::DEVICE_PLUGIN_PATH;
use device_plugin_pb::KUBELET_SOCKET;
use gcushare_common::kube_client::init_kube_client;
use kube::Client;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::AgentArgs;
use crate::config::COMPONENT_NAME;
use crate::coordination::CoordinationWatcher;
use crate::endpoint::Lane;
use crate::endpoint::PluginEndpoint;
use crate::hardware::EfsmiCli;
use crate::hardware::HardwareCli;
use crate::hardware::Pci;
use crate::hardware::SysfsPci;
use crate::health::DeviceStates;
use crate::health::HealthWatcher;
use crate::inventory::Inventory;
use crate::kubelet::KubeletClient;
use crate::node::NodeResource;
use crate::pod_cache::PodCache;

#[tokio::main]
async fn main() -> Result<()> {
    let args = AgentArgs::parse();
    let _guard = logging::init(&args.log_dir, &format!("{COMPONENT_NAME}.log"));
    info!("starting {COMPONENT_NAME}");

    if let Err(e) = run(args).await {
        error!("{COMPONENT_NAME} failed, supervisor will restart it: {e:?}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(args: AgentArgs) -> Result<()> {
    let client = init_kube_client(args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow!("init kube client: {e:?}"))?;
    let cli: Arc<dyn HardwareCli> = Arc::new(EfsmiCli);
    let pci: Arc<dyn Pci> = Arc::new(SysfsPci::default());

    // Re-registration trigger: the kubelet recreates its socket on restart.
    let (fs_tx, mut fs_rx) = mpsc::channel::<notify::Result<notify::Event>>(16);
    let mut fs_watcher = notify::recommended_watcher(move |event| {
        let _ = fs_tx.blocking_send(event);
    })
    .context("create fs watcher")?;
    fs_watcher
        .watch(Path::new(DEVICE_PLUGIN_PATH), RecursiveMode::NonRecursive)
        .context("watch device plugin directory")?;

    let mut sighup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    let mut sigquit = signal(SignalKind::quit()).context("install SIGQUIT handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

    loop {
        info!("starting device plugin services");
        let cancellation_token = CancellationToken::new();
        serve(&args, client.clone(), cli.clone(), pci.clone(), &cancellation_token).await?;

        let restart = loop {
            tokio::select! {
                Some(event) = fs_rx.recv() => {
                    let Ok(event) = event else { continue };
                    let created = matches!(event.kind, notify::EventKind::Create(_));
                    let kubelet_socket = event
                        .paths
                        .iter()
                        .any(|path| path == Path::new(KUBELET_SOCKET));
                    if created && kubelet_socket {
                        info!("kubelet socket recreated, restarting plugin");
                        break true;
                    }
                }
                _ = sighup.recv() => {
                    info!("received SIGHUP, restarting plugin");
                    break true;
                }
                _ = sigquit.recv() => {
                    // Parity with the runtime's stack-dump signal; tokio has
                    // no cheap task dump, so record the event and keep going.
                    warn!("received SIGQUIT");
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    break false;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break false;
                }
            }
        };

        cancellation_token.cancel();
        if !restart {
            return Ok(());
        }
    }
}

/// One full setup pass: inventory, accounting, caches, health, endpoints.
async fn serve(
    args: &AgentArgs,
    client: Client,
    cli: Arc<dyn HardwareCli>,
    pci: Arc<dyn Pci>,
    cancellation_token: &CancellationToken,
) -> Result<()> {
    let resource_config = args.resource_config();
    let mut node_resource = NodeResource::new(
        resource_config.clone(),
        args.node_name.clone(),
        client.clone(),
    );
    let resource_isolation = node_resource
        .check_resource_isolation(args.resource_isolation)
        .await
        .map_err(|e| anyhow!("check resource isolation failed: {e:?}"))?;
    if resource_isolation {
        info!("gcushare resource isolation mode is enabled");
    } else {
        warn!("gcushare resource isolation mode is disabled");
    }

    let inventory = Arc::new(
        Inventory::enumerate(
            cli.as_ref(),
            pci.as_ref(),
            &resource_config,
            args.slice_count,
            resource_isolation,
        )
        .await
        .map_err(|e| anyhow!("device enumeration failed: {e:?}"))?,
    );
    if inventory.card_count() == 0 {
        return Err(anyhow!(
            "no {} devices found on this node",
            resource_config.device_type()
        ));
    }
    if args.drs_enabled {
        node_resource
            .bootstrap_drs_profiles(cli.as_ref())
            .await
            .map_err(|e| anyhow!("drs profile bootstrap failed: {e:?}"))?;
    }
    let node_resource = Arc::new(node_resource);
    node_resource
        .patch_card_count(inventory.card_count())
        .await
        .map_err(|e| anyhow!("patch card count failed: {e:?}"))?;

    let full_capacity = inventory
        .cards
        .keys()
        .map(|minor| (minor.clone(), inventory.slice_count))
        .collect();
    node_resource
        .patch_shared_capacity(&full_capacity)
        .await
        .map_err(|e| anyhow!("patch shared capacity failed: {e:?}"))?;
    if args.drs_enabled {
        node_resource
            .patch_drs_capacity(&full_capacity, &inventory)
            .await
            .map_err(|e| anyhow!("patch drs capacity failed: {e:?}"))?;
    }

    let pod_cache = Arc::new(PodCache::new(
        resource_config.clone(),
        args.node_name.clone(),
        client.clone(),
        cli.clone(),
        pci.clone(),
        inventory.clone(),
    ));
    {
        let pod_cache = pod_cache.clone();
        let token = cancellation_token.clone();
        tokio::spawn(async move { pod_cache.run(token).await });
    }

    let kubelet = if args.query_kubelet {
        Some(Arc::new(
            KubeletClient::new(&args.kubelet_address, args.kubelet_port, None)
                .map_err(|e| anyhow!("build kubelet client: {e:?}"))?,
        ))
    } else {
        None
    };

    let mut lanes = vec![Lane::Shared];
    if args.drs_enabled {
        lanes.push(Lane::Drs);
    }
    for lane in lanes {
        start_lane(
            lane,
            args,
            resource_isolation,
            &resource_config,
            inventory.clone(),
            pod_cache.clone(),
            node_resource.clone(),
            pci.clone(),
            client.clone(),
            kubelet.clone(),
            cancellation_token,
        )
        .await?;
    }

    if args.drs_enabled {
        let minor_of_index = inventory
            .cards
            .values()
            .map(|card| (card.index.clone(), card.minor.clone()))
            .collect();
        let watcher = CoordinationWatcher::new(
            args.node_name.clone(),
            args.slice_count,
            client,
            cli,
            minor_of_index,
        );
        let token = cancellation_token.clone();
        tokio::spawn(watcher.run(token));
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn start_lane(
    lane: Lane,
    args: &AgentArgs,
    resource_isolation: bool,
    resource_config: &gcushare_common::ResourceConfig,
    inventory: Arc<Inventory>,
    pod_cache: Arc<PodCache>,
    node_resource: Arc<NodeResource>,
    pci: Arc<dyn Pci>,
    client: Client,
    kubelet: Option<Arc<KubeletClient>>,
    cancellation_token: &CancellationToken,
) -> Result<()> {
    let (_, initial_health) = inventory.fake_devices();
    let states = Arc::new(DeviceStates::new(initial_health));
    let (unhealthy_tx, unhealthy_rx) = mpsc::channel(16);
    let (all_locked_tx, all_locked_rx) = mpsc::channel::<BTreeSet<String>>(1);

    let health_watcher = HealthWatcher::new(
        inventory.clone(),
        pci.clone(),
        states.clone(),
        unhealthy_tx,
        all_locked_rx,
    );
    {
        let token = cancellation_token.clone();
        tokio::spawn(health_watcher.run(token));
    }

    let endpoint = PluginEndpoint::new(
        lane,
        resource_config.clone(),
        resource_isolation,
        inventory,
        states,
        pod_cache.set.clone(),
        node_resource,
        pci,
        client,
        args.node_name.clone(),
        kubelet,
        unhealthy_rx,
        all_locked_tx,
    );

    let socket_name = lane.socket_name(COMPONENT_NAME);
    let socket_path = PathBuf::from(DEVICE_PLUGIN_PATH).join(&socket_name);
    endpoint
        .serve(&socket_path, cancellation_token.clone())
        .await?;
    endpoint.register(&socket_name).await?;
    info!(socket = %socket_name, "device plugin lane registered with kubelet");
    Ok(())
}
