use std::path::PathBuf;

use clap::Parser;
use gcushare_common::ResourceConfig;

/// Component name, also the stem of the plugin socket files.
pub const COMPONENT_NAME: &str = "gcushare-device-plugin";

/// Beyond this many slices per card, scheduling fragments accumulate.
pub const RECOMMENDED_MAX_SLICE_COUNT: i64 = 16;

#[derive(Parser, Clone, Debug)]
#[command(name = COMPONENT_NAME, version)]
pub struct AgentArgs {
    #[arg(
        long,
        env = "GCUSHARE_DOMAIN",
        default_value = "enflame.com",
        help = "Resource domain prefixed to every resource name, label and annotation"
    )]
    pub domain: String,

    #[arg(
        long,
        env = "GCUSHARE_DEVICE_TYPE",
        default_value = "gcu",
        help = "Device type, e.g. 'gcu' for resources like enflame.com/shared-gcu"
    )]
    pub device_type: String,

    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this agent runs on, used to scope pod watches and node patches"
    )]
    pub node_name: String,

    #[arg(
        long,
        default_value_t = 6,
        help = "Number of slices each card is shared into"
    )]
    pub slice_count: i64,

    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Enable resource isolation env injection for containers"
    )]
    pub resource_isolation: bool,

    #[arg(
        long,
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Enable the DRS lane (hardware dynamic resource slicing)"
    )]
    pub drs_enabled: bool,

    #[arg(
        long,
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Query pending pods from the kubelet instead of the API server"
    )]
    pub query_kubelet: bool,

    #[arg(long, default_value = "0.0.0.0", help = "Kubelet address")]
    pub kubelet_address: String,

    #[arg(long, default_value_t = 10250, help = "Kubelet read-only API port")]
    pub kubelet_port: u16,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to in-cluster config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        default_value = "/var/log/enflame/gcushare",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory for the rolling log file"
    )]
    pub log_dir: PathBuf,
}

impl AgentArgs {
    pub fn resource_config(&self) -> ResourceConfig {
        ResourceConfig::new(self.domain.clone(), self.device_type.clone())
    }
}
