use std::path::PathBuf;

use clap::Parser;
use gcushare_common::ResourceConfig;

pub const COMPONENT_NAME: &str = "gcushare-scheduler-plugin";

#[derive(Parser, Clone, Debug)]
#[command(name = COMPONENT_NAME, version)]
pub struct SchedulerArgs {
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

    #[arg(long, env = "PORT", default_value_t = 12345, help = "HTTP listen port")]
    pub port: u16,

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

impl SchedulerArgs {
    pub fn resource_config(&self) -> ResourceConfig {
        ResourceConfig::new(self.domain.clone(), self.device_type.clone())
    }
}
