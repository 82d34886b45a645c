//! OS-facing primitives behind traits.
//!
//! The tunnel manager and firewall engine only talk to the kernel and the
//! host through these seams, so tests can substitute in-memory fakes.

mod netlink;
mod probe;
mod wireguard;

use std::net::SocketAddr;
use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Serialize;

use crate::error::CoreError;

pub use netlink::RtNetlink;
pub use probe::CommandProbe;
pub use wireguard::KernelWireGuard;

/// Metric for every tunnel route.
pub const ROUTE_METRIC: u32 = 100;

// ── sysfs ────────────────────────────────────────────────────────────

/// Whether `name` is present under the `/sys/class/net`-style `root`.
pub fn interface_exists(root: &Path, name: &str) -> bool {
    root.join(name).exists()
}

/// Sorted interface names under `root` starting with `prefix`.
pub fn interfaces_with_prefix(root: &Path, prefix: &str) -> Result<Vec<String>, CoreError> {
    let entries = std::fs::read_dir(root).map_err(|e| CoreError::io(root, e))?;
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with(prefix))
        .collect();
    names.sort();
    Ok(names)
}

// ── Netlink ──────────────────────────────────────────────────────────

/// An address assigned to a host interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceSubnet {
    pub interface: String,
    pub cidr: IpNet,
}

/// A main-table route learned from the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteSubnet {
    pub interface: String,
    pub cidr: IpNet,
    pub gateway: Option<String>,
    pub protocol: String,
}

/// Link, address, and route operations. None of them retry.
#[async_trait]
pub trait Netlink: Send + Sync {
    /// Index of the link named `name`, if it exists.
    async fn link_index(&self, name: &str) -> Result<Option<u32>, CoreError>;

    /// Create a WireGuard link and return its index.
    async fn create_wireguard(&self, name: &str) -> Result<u32, CoreError>;

    async fn delete_link(&self, index: u32) -> Result<(), CoreError>;

    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<(), CoreError>;

    async fn set_up(&self, index: u32) -> Result<(), CoreError>;

    async fn add_address(&self, index: u32, addr: IpNet) -> Result<(), CoreError>;

    async fn delete_address(&self, index: u32, addr: IpNet) -> Result<(), CoreError>;

    /// Add a main-table route at [`ROUTE_METRIC`]; an existing route is success.
    async fn add_route(&self, index: u32, dst: IpNet) -> Result<(), CoreError>;

    /// Delete a route; a missing route is success.
    async fn delete_route(&self, index: u32, dst: IpNet) -> Result<(), CoreError>;

    /// Replace the underlying session.
    async fn reconnect(&self) -> Result<(), CoreError>;

    /// Interface addresses (loopback and `exclude` skipped) and main-table
    /// routes (routes out of `exclude` skipped).
    async fn system_subnets(&self, exclude: &[&str]) -> Result<SystemSubnets, CoreError>;
}

/// Subnets already in use on the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SystemSubnets {
    pub interfaces: Vec<InterfaceSubnet>,
    pub routes: Vec<RouteSubnet>,
}

// ── WireGuard ────────────────────────────────────────────────────────

/// The single remote peer of a site-to-site device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    /// Base64 public key.
    pub public_key: String,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    /// Seconds; zero disables keepalive.
    pub keepalive: u16,
}

/// Full device configuration; the peer list is replaced wholesale.
#[derive(Clone)]
pub struct DeviceSpec {
    pub private_key: wireguard_control::Key,
    pub listen_port: u16,
    pub peer: Option<PeerSpec>,
}

impl std::fmt::Debug for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSpec")
            .field("private_key", &"<redacted>")
            .field("listen_port", &self.listen_port)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Live counters for the first peer of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub listen_port: Option<u16>,
    pub last_handshake: Option<SystemTime>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub endpoint: Option<SocketAddr>,
}

#[async_trait]
pub trait WireGuard: Send + Sync {
    async fn configure(&self, iface: &str, device: &DeviceSpec) -> Result<(), CoreError>;

    /// Replace the peer without touching the key or port.
    async fn update_peer(&self, iface: &str, peer: &PeerSpec) -> Result<(), CoreError>;

    async fn stats(&self, iface: &str) -> Result<DeviceStats, CoreError>;
}

// ── Host probes ──────────────────────────────────────────────────────

/// Read-only queries against host tools and the local network stack.
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// `iptables -S <chain>` output, or `None` when the chain is missing.
    async fn chain_rules(&self, chain: &str) -> Option<String>;

    /// `ipset list <set>` output, or `None` when the set is missing.
    async fn ipset_list(&self, set: &str) -> Option<String>;

    /// External IDs of non-default firewall zones in database order.
    async fn custom_zone_ids(&self) -> Result<Vec<String>, CoreError>;

    /// Whether a UDP socket can currently bind `port` on all addresses.
    async fn udp_port_free(&self, port: u16) -> Result<(), std::io::Error>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sysfs_listing() {
        let root = tempfile::tempdir().unwrap();
        for name in ["wg-s2s1", "eth0", "wg-s2s0", "tailscale0"] {
            std::fs::create_dir(root.path().join(name)).unwrap();
        }
        assert!(interface_exists(root.path(), "tailscale0"));
        assert!(!interface_exists(root.path(), "wg-s2s9"));
        assert_eq!(
            interfaces_with_prefix(root.path(), "wg-s2s").unwrap(),
            vec!["wg-s2s0", "wg-s2s1"]
        );
    }
}
