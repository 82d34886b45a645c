// ── Daemon configuration ──
//
// Resolved runtime settings handed to `VpnPack::new`. Loading from files
// and the environment lives in `vpnpack-config`.

use std::path::PathBuf;
use std::time::Duration;

/// Filesystem locations the daemon reads and writes.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Root of persistent state (survives firmware updates).
    pub persistent_dir: PathBuf,
    pub manifest: PathBuf,
    pub api_key: PathBuf,
    /// Tunnel store (`tunnels.json`) and per-tunnel key files.
    pub wg_s2s_dir: PathBuf,
    /// Mesh daemon defaults file carrying its `PORT="n"` setting.
    pub tailscaled_defaults: PathBuf,
    pub udapi_socket: PathBuf,
    /// The appliance's network config; writes to it trigger reconciliation.
    pub udapi_net_config: PathBuf,
    pub sys_class_net: PathBuf,
}

impl Paths {
    /// Lay out every path under one persistent root, with system paths at
    /// their appliance defaults.
    pub fn under(persistent_dir: impl Into<PathBuf>) -> Self {
        let persistent_dir = persistent_dir.into();
        let config_dir = persistent_dir.join("config");
        Self {
            manifest: config_dir.join("manifest.json"),
            api_key: config_dir.join("api-key"),
            wg_s2s_dir: config_dir.join("wg-s2s"),
            tailscaled_defaults: persistent_dir.join("tailscaled.defaults"),
            udapi_socket: PathBuf::from(vpnpack_api::udapi::DEFAULT_SOCKET_PATH),
            udapi_net_config: PathBuf::from("/data/udapi-config/udapi-net-cfg.json"),
            sys_class_net: PathBuf::from("/sys/class/net"),
            persistent_dir,
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::under("/persistent/vpn-pack")
    }
}

/// How to reach the Integration API.
#[derive(Debug, Clone)]
pub struct IntegrationSettings {
    pub base_url: String,
    pub timeout: Duration,
    /// Accept the appliance's self-signed certificate.
    pub insecure: bool,
    pub page_limit: u32,
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        Self {
            base_url: vpnpack_api::integration::client::DEFAULT_BASE_URL.into(),
            timeout: Duration::from_secs(10),
            insecure: true,
            page_limit: vpnpack_api::integration::client::DEFAULT_PAGE_LIMIT,
        }
    }
}

/// Reconciliation loop cadence.
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub queue_capacity: usize,
    /// Minimum gap between credential checks on the poll path.
    pub validate_interval: Duration,
    /// Delay before each integration retry attempt; the last entry repeats.
    pub backoff: Vec<Duration>,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            debounce: Duration::from_millis(500),
            queue_capacity: 8,
            validate_interval: Duration::from_secs(300),
            backoff: vec![Duration::ZERO, Duration::from_secs(5), Duration::from_secs(10)],
        }
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub paths: Paths,
    pub integration: IntegrationSettings,
    pub watcher: WatcherSettings,
    /// Port of the Network application's local database.
    pub mongo_port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::with_paths(Paths::default())
    }
}

impl DaemonConfig {
    pub const DEFAULT_MONGO_PORT: u16 = 27117;

    pub fn with_paths(paths: Paths) -> Self {
        Self {
            paths,
            integration: IntegrationSettings::default(),
            watcher: WatcherSettings::default(),
            mongo_port: Self::DEFAULT_MONGO_PORT,
        }
    }
}
