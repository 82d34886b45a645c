// ── Appliance network config ──
//
// Read-only view of `udapi-net-cfg.json`: the WAN address advertised to
// tunnel peers and the LAN subnets offered as their allowed IPs.

use std::path::Path;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Default, Deserialize)]
pub struct NetConfig {
    #[serde(default)]
    interfaces: Vec<NetInterface>,
}

#[derive(Debug, Default, Deserialize)]
struct NetInterface {
    #[serde(default)]
    identification: Identification,
    #[serde(default)]
    addresses: Vec<NetAddress>,
    #[serde(default)]
    status: InterfaceStatus,
}

#[derive(Debug, Default, Deserialize)]
struct Identification {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct InterfaceStatus {
    #[serde(default)]
    comment: String,
}

#[derive(Debug, Default, Deserialize)]
struct NetAddress {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    cidr: String,
    #[serde(default)]
    version: String,
}

/// A LAN subnet the gateway routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalSubnet {
    pub cidr: Ipv4Net,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl NetConfig {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read(path).map_err(|e| CoreError::io(path, e))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Load, treating any failure as an empty config.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// First DHCP or static address on a WAN interface.
    pub fn wan_ip(&self) -> Option<&str> {
        self.interfaces
            .iter()
            .filter(|i| i.identification.kind == "wan")
            .flat_map(|i| &i.addresses)
            .find(|a| a.kind == "dhcp" || a.kind == "static")
            .map(|a| a.address.as_str())
            .filter(|a| !a.is_empty())
    }

    /// Static IPv4 networks on bridge and VLAN interfaces.
    pub fn local_subnets(&self) -> Vec<LocalSubnet> {
        let mut out = Vec::new();
        for iface in &self.interfaces {
            let kind = iface.identification.kind.as_str();
            if kind != "bridge" && kind != "vlan" {
                continue;
            }
            for addr in &iface.addresses {
                if addr.version != "v4" || addr.kind != "static" {
                    continue;
                }
                let Ok(net) = addr.cidr.parse::<Ipv4Net>() else {
                    continue;
                };
                let id = &iface.identification.id;
                let label = if iface.status.comment.is_empty() {
                    id
                } else {
                    &iface.status.comment
                };
                out.push(LocalSubnet {
                    cidr: net.trunc(),
                    name: format!("{label} ({id})"),
                    kind: kind.to_owned(),
                });
            }
        }
        out
    }
}
