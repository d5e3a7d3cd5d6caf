//! Routing core configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Offset added to an interface index to get its routing table id.
pub const DEFAULT_TABLE_ID_OFFSET: u32 = 1000;

/// Metric of default routes installed by the daemon.
pub const DEFAULT_ROUTE_METRIC: u32 = 65536;

/// Metric the kernel uses for default routes learned from router
/// advertisements.
pub const KERNEL_SLAAC_METRIC: u32 = 1024;

/// How long the start-up rule dump may take.
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Users whose traffic is steered through VPN interfaces.
const DEFAULT_USER_TRAFFIC_USERNAMES: &[&str] = &[
    "chronos",
    "debugd",
    "cups",
    "lpadmin",
    "kerberosd",
    "kerberosd-exec",
    "tlsdate",
    "pluginvm",
    "fuse-smbfs",
];

/// Routing core configuration.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Per-device table id is `interface_index + table_id_offset`.
    pub table_id_offset: u32,
    /// Metric of default routes set through `set_default_route`.
    pub default_route_metric: u32,
    /// Metric of kernel-installed router advertisement default routes.
    pub kernel_slaac_metric: u32,
    /// Usernames resolved for UID-based VPN rules.
    pub user_traffic_usernames: Vec<String>,
    /// Root of the network tunables, normally `/proc/sys/net`.
    pub sysctl_root: PathBuf,
    /// Bound on the synchronous start-up wait.
    pub startup_timeout: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            table_id_offset: DEFAULT_TABLE_ID_OFFSET,
            default_route_metric: DEFAULT_ROUTE_METRIC,
            kernel_slaac_metric: KERNEL_SLAAC_METRIC,
            user_traffic_usernames: DEFAULT_USER_TRAFFIC_USERNAMES
                .iter()
                .map(|name| name.to_string())
                .collect(),
            sysctl_root: PathBuf::from("/proc/sys/net"),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }
}
