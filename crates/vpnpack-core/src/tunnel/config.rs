// ── Tunnel records and their store ──

use std::collections::HashSet;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::manifest::write_atomic;

pub const DEFAULT_KEEPALIVE: u16 = 25;
pub const DEFAULT_MTU: u32 = 1420;
pub const INTERFACE_PREFIX: &str = "wg-s2s";
const STORE_FILE: &str = "tunnels.json";
const STORE_VERSION: u32 = 1;

/// One configured site-to-site tunnel. The private key is never stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    pub id: String,
    pub name: String,
    pub interface_name: String,
    pub listen_port: u16,
    pub tunnel_address: IpNet,
    #[serde(default)]
    pub peer_public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_endpoint: Option<String>,
    #[serde(default, rename = "allowedIPs")]
    pub allowed_ips: Vec<IpNet>,
    #[serde(default)]
    pub persistent_keepalive: u16,
    #[serde(default)]
    pub mtu: u32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl TunnelConfig {
    /// Whether moving to `next` requires tearing the interface down.
    pub fn needs_recreate(&self, next: &Self) -> bool {
        self.listen_port != next.listen_port
            || self.tunnel_address != next.tunnel_address
            || self.mtu != next.mtu
            || self.peer_public_key != next.peer_public_key
    }
}

/// Fields for a new tunnel.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTunnel {
    pub name: String,
    pub listen_port: u16,
    pub tunnel_address: Option<IpNet>,
    #[serde(default)]
    pub peer_public_key: String,
    #[serde(default)]
    pub peer_endpoint: Option<String>,
    #[serde(default, rename = "allowedIPs")]
    pub allowed_ips: Vec<IpNet>,
    #[serde(default)]
    pub persistent_keepalive: u16,
    #[serde(default)]
    pub mtu: u32,
}

/// Partial update. Absent, empty, and zero fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelUpdate {
    pub name: Option<String>,
    pub listen_port: Option<u16>,
    pub tunnel_address: Option<IpNet>,
    pub peer_public_key: Option<String>,
    pub peer_endpoint: Option<String>,
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Option<Vec<IpNet>>,
    pub persistent_keepalive: Option<u16>,
    pub mtu: Option<u32>,
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty()).map(|s| s.trim().to_owned())
}

fn non_zero<T: Copy + Default + PartialEq>(value: Option<T>) -> Option<T> {
    value.filter(|v| *v != T::default())
}

impl TunnelUpdate {
    /// Apply onto `current`, returning the merged record.
    pub fn merge_onto(&self, current: &TunnelConfig) -> TunnelConfig {
        let mut merged = current.clone();
        if let Some(name) = non_empty(self.name.as_ref()) {
            merged.name = name;
        }
        if let Some(port) = non_zero(self.listen_port) {
            merged.listen_port = port;
        }
        if let Some(addr) = self.tunnel_address {
            merged.tunnel_address = addr;
        }
        if let Some(key) = non_empty(self.peer_public_key.as_ref()) {
            merged.peer_public_key = key;
        }
        if let Some(endpoint) = non_empty(self.peer_endpoint.as_ref()) {
            merged.peer_endpoint = Some(endpoint);
        }
        if let Some(ips) = &self.allowed_ips {
            merged.allowed_ips.clone_from(ips);
        }
        if let Some(keepalive) = non_zero(self.persistent_keepalive) {
            merged.persistent_keepalive = keepalive;
        }
        if let Some(mtu) = non_zero(self.mtu) {
            merged.mtu = mtu;
        }
        merged
    }
}

/// A WireGuard public key is 32 bytes in standard base64.
pub fn validate_public_key(key: &str) -> Result<(), CoreError> {
    match STANDARD.decode(key.trim()) {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        _ => Err(CoreError::validation(format!(
            "peer public key {key:?} is not a 32-byte base64 key"
        ))),
    }
}

/// Lowest `wg-s2sN` not held by any tunnel.
pub fn next_interface_name<'a>(taken: impl IntoIterator<Item = &'a str>) -> String {
    let used: HashSet<&str> = taken.into_iter().collect();
    (0u32..)
        .map(|i| format!("{INTERFACE_PREFIX}{i}"))
        .find(|name| !used.contains(name.as_str()))
        .unwrap_or_else(|| INTERFACE_PREFIX.to_owned())
}

/// Short random hex ID, distinct from every ID in `taken`.
pub fn generate_id<'a>(taken: impl IntoIterator<Item = &'a str> + Clone) -> String {
    loop {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_owned();
        if !taken.clone().into_iter().any(|t| t == id) {
            return id;
        }
    }
}

// ── Store ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct TunnelsFile {
    #[serde(default)]
    tunnels: Vec<TunnelConfig>,
    #[serde(default)]
    version: u32,
}

/// `tunnels.json` plus the key files beside it, in one 0700 directory.
#[derive(Debug, Clone)]
pub struct TunnelStore {
    dir: PathBuf,
}

impl TunnelStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let dir = dir.into();
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
            .map_err(|e| CoreError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self) -> PathBuf {
        self.dir.join(STORE_FILE)
    }

    pub fn load(&self) -> Result<Vec<TunnelConfig>, CoreError> {
        let path = self.path();
        match std::fs::read(&path) {
            Ok(raw) => Ok(serde_json::from_slice::<TunnelsFile>(&raw)?.tunnels),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(CoreError::io(path, e)),
        }
    }

    pub fn save(&self, tunnels: &[TunnelConfig]) -> Result<(), CoreError> {
        let file = TunnelsFile {
            tunnels: tunnels.to_vec(),
            version: STORE_VERSION,
        };
        write_atomic(&self.path(), &serde_json::to_vec_pretty(&file)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample() -> TunnelConfig {
        TunnelConfig {
            id: "a1b2c3d4".into(),
            name: "office".into(),
            interface_name: "wg-s2s0".into(),
            listen_port: 51820,
            tunnel_address: "10.0.0.1/24".parse().unwrap(),
            peer_public_key: "x".repeat(43) + "=",
            peer_endpoint: Some("203.0.113.9:51820".into()),
            allowed_ips: vec!["10.10.0.0/16".parse().unwrap()],
            persistent_keepalive: 25,
            mtu: 1420,
            enabled: true,
            created_at: "2026-03-01T12:00:00.123456Z".parse().unwrap(),
        }
    }

    #[test]
    fn next_name_fills_gaps() {
        assert_eq!(next_interface_name(std::iter::empty()), "wg-s2s0");
        assert_eq!(next_interface_name(["wg-s2s0", "wg-s2s1"]), "wg-s2s2");
        assert_eq!(next_interface_name(["wg-s2s0", "wg-s2s2"]), "wg-s2s1");
        assert_eq!(next_interface_name(["wg-s2s1", "wg-s2s3"]), "wg-s2s0");
    }

    #[test]
    fn generated_ids_avoid_taken() {
        let id = generate_id(["deadbeef"]);
        assert_eq!(id.len(), 8);
        assert_ne!(id, "deadbeef");
    }

    #[test]
    fn store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TunnelStore::open(dir.path().join("wg-s2s")).unwrap();
        assert!(store.load().unwrap().is_empty());

        let mut second = sample();
        second.id = "ffff0000".into();
        second.interface_name = "wg-s2s1".into();
        second.peer_endpoint = None;
        second.enabled = false;
        store.save(&[sample(), second.clone()]).unwrap();

        assert_eq!(store.load().unwrap(), vec![sample(), second]);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.dir().join("tunnels.json")).unwrap())
                .unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["tunnels"][0]["allowedIPs"][0], "10.10.0.0/16");
        assert_eq!(raw["tunnels"][0]["interfaceName"], "wg-s2s0");
    }

    #[test]
    fn merge_ignores_empty_and_zero() {
        let current = sample();
        let update = TunnelUpdate {
            name: Some(String::new()),
            listen_port: Some(0),
            peer_endpoint: Some("198.51.100.2:51820".into()),
            mtu: Some(0),
            ..TunnelUpdate::default()
        };
        let merged = update.merge_onto(&current);
        assert_eq!(merged.name, "office");
        assert_eq!(merged.listen_port, 51820);
        assert_eq!(merged.peer_endpoint.as_deref(), Some("198.51.100.2:51820"));
        assert!(!current.needs_recreate(&merged));

        let port_change = TunnelUpdate {
            listen_port: Some(51821),
            ..TunnelUpdate::default()
        }
        .merge_onto(&current);
        assert!(current.needs_recreate(&port_change));
    }

    #[test]
    fn public_key_shape() {
        assert!(validate_public_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=").is_ok());
        assert!(validate_public_key("short").is_err());
        assert!(validate_public_key("").is_err());
    }
}
