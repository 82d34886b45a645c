// ── Manifest ──
//
// Durable ledger correlating local tunnels, zones, and WAN ports with
// their Integration API object IDs. Every accessor takes the data lock
// on its own; `save` serializes the whole document and renames it into
// place.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CoreError;
use crate::markers::{ChainPrefix, WanPortMarker};

pub const CURRENT_VERSION: u32 = 2;

// ── Value objects ────────────────────────────────────────────────────

/// One remote zone with its policies and discovered on-box chain prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneManifest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chain_prefix: String,
}

impl ZoneManifest {
    pub fn chain_prefix(&self) -> ChainPrefix {
        ChainPrefix::from(self.chain_prefix.as_str())
    }

    pub fn has_zone(&self) -> bool {
        !self.zone_id.is_empty()
    }

    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WanPortEntry {
    pub policy_id: String,
    pub policy_name: String,
    pub port: u16,
}

/// A tunnel zone with the number of tunnels assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WgS2sZoneInfo {
    pub zone_id: String,
    pub zone_name: String,
    pub tunnel_count: usize,
}

/// On-disk document, version 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestData {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub site_id: String,
    #[serde(default, skip_serializing_if = "ZoneManifest::is_empty")]
    pub tailscale: ZoneManifest,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wg_s2s: BTreeMap<String, ZoneManifest>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wan_ports: BTreeMap<String, WanPortEntry>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub external_zone_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway_zone_id: String,
}

impl ManifestData {
    fn fresh() -> Self {
        let now = Utc::now();
        Self {
            version: CURRENT_VERSION,
            created_at: now,
            updated_at: now,
            site_id: String::new(),
            tailscale: ZoneManifest::default(),
            wg_s2s: BTreeMap::new(),
            wan_ports: BTreeMap::new(),
            external_zone_id: String::new(),
            gateway_zone_id: String::new(),
        }
    }
}

// ── Legacy schema ────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestV1 {
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    mode_b: ModeB,
}

#[derive(Default, Deserialize)]
struct ModeB {
    #[serde(default, rename = "zoneID")]
    zone_id: String,
    #[serde(default, rename = "policyIDs")]
    policy_ids: Vec<String>,
}

fn migrate_v1(raw: serde_json::Value) -> ManifestData {
    let mut data = ManifestData::fresh();
    data.tailscale.chain_prefix = ChainPrefix::DEFAULT.to_owned();
    let Ok(v1) = serde_json::from_value::<ManifestV1>(raw) else {
        return data;
    };
    if let Some(created) = v1.created_at {
        data.created_at = created;
    }
    if let Some(updated) = v1.updated_at {
        data.updated_at = updated;
    }
    if !v1.mode_b.zone_id.is_empty() {
        data.tailscale.zone_id = v1.mode_b.zone_id;
        data.tailscale.policy_ids = v1.mode_b.policy_ids;
    }
    data
}

// ── Manifest ─────────────────────────────────────────────────────────

/// Lock-protected manifest bound to its file path.
#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    data: RwLock<ManifestData>,
    save_lock: Mutex<()>,
}

impl Manifest {
    /// Load from `path`. A missing file yields an empty current-version
    /// manifest; unparsable JSON is an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let path = path.into();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no manifest on disk, starting fresh");
                return Ok(Self::with_data(path, ManifestData::fresh()));
            }
            Err(e) => return Err(CoreError::io(&path, e)),
        };

        let raw: serde_json::Value = serde_json::from_slice(&bytes)?;
        let version = raw
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);

        let data = if version <= 1 {
            info!(path = %path.display(), version, "migrating legacy manifest");
            migrate_v1(raw)
        } else {
            serde_json::from_value(raw)?
        };
        Ok(Self::with_data(path, data))
    }

    pub fn with_data(path: impl Into<PathBuf>, data: ManifestData) -> Self {
        Self {
            path: path.into(),
            data: RwLock::new(data),
            save_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read<R>(&self, f: impl FnOnce(&ManifestData) -> R) -> R {
        f(&self.data.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<R>(&self, f: impl FnOnce(&mut ManifestData) -> R) -> R {
        f(&mut self.data.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Persist atomically: write a 0600 sibling temp file, then rename.
    pub fn save(&self) -> Result<(), CoreError> {
        let _guard = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = self.write(|d| {
            d.updated_at = Utc::now();
            serde_json::to_vec_pretty(d)
        })?;
        write_atomic(&self.path, &bytes)
    }

    pub fn snapshot(&self) -> ManifestData {
        self.read(Clone::clone)
    }

    // ── Site ─────────────────────────────────────────────────────────

    pub fn site_id(&self) -> Option<String> {
        self.read(|d| (!d.site_id.is_empty()).then(|| d.site_id.clone()))
    }

    pub fn has_site_id(&self) -> bool {
        self.read(|d| !d.site_id.is_empty())
    }

    pub fn set_site_id(&self, site_id: impl Into<String>) {
        let site_id = site_id.into();
        self.write(|d| d.site_id = site_id);
    }

    /// Forget every remote object while keeping the site binding.
    pub fn reset_integration(&self) {
        self.write(|d| {
            d.tailscale = ZoneManifest::default();
            d.wg_s2s.clear();
            d.wan_ports.clear();
            d.external_zone_id.clear();
            d.gateway_zone_id.clear();
        });
    }

    // ── Mesh daemon zone ─────────────────────────────────────────────

    pub fn tailscale_zone(&self) -> ZoneManifest {
        self.read(|d| d.tailscale.clone())
    }

    pub fn set_tailscale_zone(&self, zone: ZoneManifest) {
        self.write(|d| d.tailscale = zone);
    }

    pub fn tailscale_chain_prefix(&self) -> ChainPrefix {
        self.read(|d| d.tailscale.chain_prefix())
    }

    // ── Tunnel zones ─────────────────────────────────────────────────

    pub fn wg_s2s_zone(&self, tunnel_id: &str) -> Option<ZoneManifest> {
        self.read(|d| d.wg_s2s.get(tunnel_id).cloned())
    }

    pub fn set_wg_s2s_zone(&self, tunnel_id: impl Into<String>, zone: ZoneManifest) {
        let tunnel_id = tunnel_id.into();
        self.write(|d| d.wg_s2s.insert(tunnel_id, zone));
    }

    pub fn remove_wg_s2s_tunnel(&self, tunnel_id: &str) {
        self.write(|d| d.wg_s2s.remove(tunnel_id));
    }

    pub fn wg_s2s_snapshot(&self) -> BTreeMap<String, ZoneManifest> {
        self.read(|d| d.wg_s2s.clone())
    }

    pub fn wg_s2s_chain_prefix(&self, tunnel_id: &str) -> ChainPrefix {
        self.read(|d| {
            d.wg_s2s
                .get(tunnel_id)
                .map(ZoneManifest::chain_prefix)
                .unwrap_or_default()
        })
    }

    /// Distinct tunnel zones in first-seen order, with usage counts.
    pub fn wg_s2s_zones(&self) -> Vec<WgS2sZoneInfo> {
        self.read(|d| {
            let mut zones: Vec<WgS2sZoneInfo> = Vec::new();
            for zm in d.wg_s2s.values().filter(|z| z.has_zone()) {
                match zones.iter_mut().find(|z| z.zone_id == zm.zone_id) {
                    Some(info) => info.tunnel_count += 1,
                    None => zones.push(WgS2sZoneInfo {
                        zone_id: zm.zone_id.clone(),
                        zone_name: zm.zone_name.clone(),
                        tunnel_count: 1,
                    }),
                }
            }
            zones
        })
    }

    /// Number of tunnels other than `except` assigned to `zone_id`.
    pub fn tunnels_in_zone(&self, zone_id: &str, except: &str) -> usize {
        self.read(|d| {
            d.wg_s2s
                .iter()
                .filter(|(id, z)| id.as_str() != except && z.zone_id == zone_id)
                .count()
        })
    }

    // ── WAN ports ────────────────────────────────────────────────────

    pub fn wan_port(&self, marker: &WanPortMarker) -> Option<WanPortEntry> {
        let key = marker.to_string();
        self.read(|d| d.wan_ports.get(&key).cloned())
    }

    pub fn set_wan_port(&self, marker: &WanPortMarker, entry: WanPortEntry) {
        let key = marker.to_string();
        self.write(|d| d.wan_ports.insert(key, entry));
    }

    pub fn remove_wan_port(&self, marker: &WanPortMarker) {
        let key = marker.to_string();
        self.write(|d| d.wan_ports.remove(&key));
    }

    pub fn wan_ports(&self) -> Vec<(WanPortMarker, WanPortEntry)> {
        self.read(|d| {
            d.wan_ports
                .iter()
                .map(|(k, v)| {
                    let marker: WanPortMarker = k.parse().unwrap_or_else(|e| match e {});
                    (marker, v.clone())
                })
                .collect()
        })
    }

    // ── System zones ─────────────────────────────────────────────────

    /// Cached External/Gateway zone IDs, if both are known.
    pub fn system_zone_ids(&self) -> Option<(String, String)> {
        self.read(|d| {
            (!d.external_zone_id.is_empty() && !d.gateway_zone_id.is_empty())
                .then(|| (d.external_zone_id.clone(), d.gateway_zone_id.clone()))
        })
    }

    pub fn set_system_zone_ids(&self, external: impl Into<String>, gateway: impl Into<String>) {
        let (external, gateway) = (external.into(), gateway.into());
        self.write(|d| {
            d.external_zone_id = external;
            d.gateway_zone_id = gateway;
        });
    }

    // ── Reconciliation helpers ───────────────────────────────────────

    /// Every zone ID the manifest references.
    pub fn referenced_zone_ids(&self) -> HashSet<String> {
        self.read(|d| {
            std::iter::once(&d.tailscale)
                .chain(d.wg_s2s.values())
                .filter(|z| z.has_zone())
                .map(|z| z.zone_id.clone())
                .collect()
        })
    }

    /// Drop policy IDs missing from `live`. Returns whether anything changed.
    pub fn prune_policy_ids(&self, live: &HashSet<String>) -> bool {
        self.write(|d| {
            let mut changed = false;
            for zone in std::iter::once(&mut d.tailscale).chain(d.wg_s2s.values_mut()) {
                let before = zone.policy_ids.len();
                zone.policy_ids.retain(|id| live.contains(id));
                changed |= zone.policy_ids.len() != before;
            }
            changed
        })
    }
}

/// Write `bytes` to `path` through a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
    if let Some(dir) = path.parent() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)
            .map_err(|e| CoreError::io(dir, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)
        .map_err(|e| CoreError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| CoreError::io(&tmp, e))?;
    file.sync_all().map_err(|e| CoreError::io(&tmp, e))?;
    drop(file);

    std::fs::rename(&tmp, path).map_err(|e| CoreError::io(path, e))
}
