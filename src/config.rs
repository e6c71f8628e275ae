use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser};

use crate::api::constants::{DEFAULT_CONFIG_DIR, DEFAULT_ROOK_IMAGE};

/// Flags shared by every binary.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Namespace the process runs in
    #[arg(long, env = "POD_NAMESPACE", default_value = "rook-system")]
    pub namespace: String,

    /// Directory for generated backend config and keyrings
    #[arg(long, env = "ROOK_CONFIG_DIR", default_value = DEFAULT_CONFIG_DIR)]
    pub config_dir: PathBuf,

    /// Emit logs as json
    #[arg(long, env = "ROOK_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

#[derive(Parser, Debug)]
#[command(name = "rook-operator")]
#[command(about = "Runs the rook storage cluster controllers")]
pub struct OperatorArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Image used for mon and osd daemons when the cluster does not set one
    #[arg(long, env = "ROOK_IMAGE", default_value = DEFAULT_ROOK_IMAGE)]
    pub image: String,

    /// Seconds between mon health checks
    #[arg(long, default_value_t = 45)]
    pub mon_health_interval: u64,

    /// Seconds a mon may stay out of quorum before it is failed over
    #[arg(long, default_value_t = 300)]
    pub mon_out_timeout: u64,

    /// Seconds a single quorum probe may take
    #[arg(long, default_value_t = 30)]
    pub quorum_probe_timeout: u64,

    /// Minutes a drained failure domain keeps the no-rebalance flag
    #[arg(long, default_value_t = 30)]
    pub maintenance_timeout: u64,

    /// Seconds between disruption budget reconciles
    #[arg(long, default_value_t = 60)]
    pub disruption_interval: u64,

    /// Where to mirror the admin keyring for diagnostic pods
    #[arg(long, default_value = "/etc/ceph/keyring")]
    pub keyring_mirror: Option<PathBuf>,

    /// Address of the health and metrics server
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub bind: String,
}

#[derive(Parser, Debug)]
#[command(name = "rook-agent")]
#[command(about = "Serves volume attach requests for the flex driver on this node")]
pub struct AgentArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Node this agent runs on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Kubelet volume plugin directory
    #[arg(
        long,
        env = "FLEXVOLUME_DIR_PATH",
        default_value = "/usr/libexec/kubernetes/kubelet-plugins/volume/exec"
    )]
    pub plugin_dir: PathBuf,

    #[arg(long, default_value = "rook.io")]
    pub vendor: String,

    #[arg(long, default_value = "rook")]
    pub driver: String,

    /// Kubelet root directory
    #[arg(long, default_value = "/var/lib/kubelet")]
    pub kubelet_root: PathBuf,

    /// Flex driver binary to install into the plugin directory
    #[arg(long)]
    pub driver_binary: Option<PathBuf>,
}

/// Operator settings carried in every reconcile context.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub namespace: String,
    pub config_dir: PathBuf,
    pub image: String,
    pub mon_health_interval: Duration,
    pub mon_out_timeout: Duration,
    pub quorum_probe_timeout: Duration,
    pub maintenance_timeout: Duration,
    pub disruption_interval: Duration,
    pub keyring_mirror: Option<PathBuf>,
}

impl From<&OperatorArgs> for OperatorConfig {
    fn from(args: &OperatorArgs) -> Self {
        OperatorConfig {
            namespace: args.common.namespace.clone(),
            config_dir: args.common.config_dir.clone(),
            image: args.image.clone(),
            mon_health_interval: Duration::from_secs(args.mon_health_interval),
            mon_out_timeout: Duration::from_secs(args.mon_out_timeout),
            quorum_probe_timeout: Duration::from_secs(args.quorum_probe_timeout),
            maintenance_timeout: Duration::from_secs(args.maintenance_timeout * 60),
            disruption_interval: Duration::from_secs(args.disruption_interval),
            keyring_mirror: args.keyring_mirror.clone(),
        }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            namespace: "rook-system".to_string(),
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            image: DEFAULT_ROOK_IMAGE.to_string(),
            mon_health_interval: Duration::from_secs(45),
            mon_out_timeout: Duration::from_secs(300),
            quorum_probe_timeout: Duration::from_secs(30),
            maintenance_timeout: Duration::from_secs(30 * 60),
            disruption_interval: Duration::from_secs(60),
            keyring_mirror: None,
        }
    }
}

/// Agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub namespace: String,
    pub node_name: String,
    pub config_dir: PathBuf,
    pub plugin_dir: PathBuf,
    pub vendor: String,
    pub driver: String,
    pub kubelet_root: PathBuf,
}

impl AgentConfig {
    /// `<pluginDir>/<vendor~driver>`
    pub fn driver_dir(&self) -> PathBuf {
        self.plugin_dir.join(format!("{}~{}", self.vendor, self.driver))
    }

    pub fn socket_path(&self) -> PathBuf {
        self.driver_dir().join(".rook.sock")
    }
}

impl From<&AgentArgs> for AgentConfig {
    fn from(args: &AgentArgs) -> Self {
        AgentConfig {
            namespace: args.common.namespace.clone(),
            node_name: args.node_name.clone(),
            config_dir: args.common.config_dir.clone(),
            plugin_dir: args.plugin_dir.clone(),
            vendor: args.vendor.clone(),
            driver: args.driver.clone(),
            kubelet_root: args.kubelet_root.clone(),
        }
    }
}
