// ── Live tunnel status ──

use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Serialize;

use super::config::TunnelConfig;
use crate::system::DeviceStats;

/// A peer counts as connected while its last handshake is younger than this.
pub const CONNECTED_WINDOW: Duration = Duration::from_secs(3 * 60);

/// Tunnel config joined with kernel device state. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WgS2sStatus {
    pub id: String,
    pub name: String,
    pub interface_name: String,
    pub enabled: bool,
    pub connected: bool,
    pub last_handshake: Option<DateTime<Utc>>,
    pub transfer_rx: u64,
    pub transfer_tx: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    pub listen_port: u16,
    pub local_address: IpNet,
    pub remote_subnets: Vec<IpNet>,
    /// Whether the ingress rule for this interface is live; filled in by
    /// callers that can inspect the firewall.
    #[serde(rename = "forwardINOk", skip_serializing_if = "Option::is_none")]
    pub forward_in_ok: Option<bool>,
}

pub fn is_connected(last_handshake: Option<SystemTime>, now: SystemTime) -> bool {
    last_handshake
        .and_then(|t| now.duration_since(t).ok())
        .is_some_and(|age| age < CONNECTED_WINDOW)
}

impl WgS2sStatus {
    /// Status from config alone, as reported for disabled or unreadable devices.
    pub fn from_config(tunnel: &TunnelConfig) -> Self {
        Self {
            id: tunnel.id.clone(),
            name: tunnel.name.clone(),
            interface_name: tunnel.interface_name.clone(),
            enabled: tunnel.enabled,
            connected: false,
            last_handshake: None,
            transfer_rx: 0,
            transfer_tx: 0,
            endpoint: String::new(),
            listen_port: tunnel.listen_port,
            local_address: tunnel.tunnel_address,
            remote_subnets: tunnel.allowed_ips.clone(),
            forward_in_ok: None,
        }
    }

    pub fn with_stats(mut self, stats: &DeviceStats, now: SystemTime) -> Self {
        if let Some(port) = stats.listen_port {
            self.listen_port = port;
        }
        self.last_handshake = stats.last_handshake.map(DateTime::<Utc>::from);
        self.connected = is_connected(stats.last_handshake, now);
        self.transfer_rx = stats.rx_bytes;
        self.transfer_tx = stats.tx_bytes;
        self.endpoint = stats.endpoint.map(|e| e.to_string()).unwrap_or_default();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_window_is_three_minutes() {
        let now = SystemTime::now();
        assert!(is_connected(Some(now - Duration::from_secs(179)), now));
        assert!(!is_connected(Some(now - Duration::from_secs(180)), now));
        assert!(!is_connected(None, now));
        // A handshake stamped in the future (clock skew) is not trusted.
        assert!(!is_connected(Some(now + Duration::from_secs(5)), now));
    }
}
