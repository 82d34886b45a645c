//! Firewall reconciliation: on-box interface rules and ipset entries via
//! udapi, zone and policy objects via the Integration API.
//!
//! Setup paths no-op when integration is not configured; mutating paths
//! return [`CoreError::IntegrationNotConfigured`]. Every discovered zone,
//! policy, or chain prefix is written through to the [`Manifest`].

pub mod zones;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use ipnet::IpNet;
use serde::Serialize;
use tracing::{debug, info, warn};
use vpnpack_api::{IntegrationClient, UdapiClient};

use crate::error::CoreError;
use crate::manifest::{Manifest, WanPortEntry, ZoneManifest};
use crate::markers::{
    CHAIN_FORWARD_IN_USER, CHAIN_INPUT_USER_HOOK, CHAIN_OUTPUT_USER_HOOK, ChainPrefix, RuleMarker,
    TAILSCALE_CGNAT, TAILSCALE_IFACE, WanPortMarker,
};
use crate::subnets::overlaps;
use crate::system::{HostProbe, Netlink};

/// Integration client slot, empty until an API key is configured.
pub type SharedIntegration = Arc<ArcSwapOption<IntegrationClient>>;

/// Zone name used when a tunnel asks for a new zone without naming it.
pub const DEFAULT_WG_S2S_ZONE: &str = "WireGuard S2S";

const TAILSCALE_ZONE_LABEL: &str = "Tailscale";

/// Which mesh-interface rules the live ruleset currently carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TailscaleRulesPresent {
    pub forward: bool,
    pub input: bool,
    pub output: bool,
    pub ipset: bool,
}

impl TailscaleRulesPresent {
    pub fn all(&self) -> bool {
        self.forward && self.input && self.output && self.ipset
    }
}

pub struct FirewallEngine {
    udapi: UdapiClient,
    integration: SharedIntegration,
    manifest: Arc<Manifest>,
    probe: Arc<dyn HostProbe>,
    netlink: Arc<dyn Netlink>,
}

impl FirewallEngine {
    pub fn new(
        udapi: UdapiClient,
        integration: SharedIntegration,
        manifest: Arc<Manifest>,
        probe: Arc<dyn HostProbe>,
        netlink: Arc<dyn Netlink>,
    ) -> Self {
        Self {
            udapi,
            integration,
            manifest,
            probe,
            netlink,
        }
    }

    pub fn udapi(&self) -> &UdapiClient {
        &self.udapi
    }

    /// Client and site ID, or `IntegrationNotConfigured`.
    pub fn require_integration(&self) -> Result<(Arc<IntegrationClient>, String), CoreError> {
        let client = self
            .integration
            .load_full()
            .ok_or(CoreError::IntegrationNotConfigured)?;
        let site = self
            .manifest
            .site_id()
            .ok_or(CoreError::IntegrationNotConfigured)?;
        Ok((client, site))
    }

    pub fn integration_ready(&self) -> bool {
        self.require_integration().is_ok()
    }

    // ── Mesh interface ───────────────────────────────────────────────

    /// Ensure the mesh daemon's zone and policies, then attach `tailscale0`.
    ///
    /// A zone failure falls back to the legacy prefix so the interface is
    /// still attached to the built-in VPN zone. A rejected key is returned
    /// instead.
    pub async fn setup_tailscale_firewall(&self) -> Result<(), CoreError> {
        let Ok((client, site)) = self.require_integration() else {
            info!("skipping tailscale firewall setup: integration not configured");
            return Ok(());
        };

        let old_prefix = self.manifest.tailscale_chain_prefix();
        let mut prefix = ChainPrefix::default_prefix();

        let display = zones::zone_display_name(TAILSCALE_ZONE_LABEL);
        match zones::ensure_zone(&client, &site, &display).await {
            Err(e) if e.is_unauthorized() => return Err(e),
            Err(e) => warn!(error = %e, "integration zone setup failed, using default chain prefix"),
            Ok(zone) => {
                info!(zone_id = %zone.id, name = %zone.name, "integration zone ready");
                let policy_ids =
                    match zones::ensure_policies(&client, &site, TAILSCALE_ZONE_LABEL, &zone.id)
                        .await
                    {
                        Ok(ids) => {
                            info!(count = ids.len(), "integration policies ready");
                            ids
                        }
                        Err(e) => {
                            warn!(error = %e, "integration policy setup had errors");
                            Vec::new()
                        }
                    };
                if let Some(discovered) = self.discover_chain_prefix(&zone.id).await {
                    prefix = discovered;
                }
                self.manifest.set_tailscale_zone(ZoneManifest {
                    zone_id: zone.id,
                    zone_name: zone.name,
                    policy_ids,
                    chain_prefix: prefix.as_str().to_owned(),
                });
                if let Err(e) = self.manifest.save() {
                    warn!(error = %e, "manifest save failed");
                }
            }
        }

        if prefix != old_prefix {
            debug!(old = %old_prefix, new = %prefix, "chain prefix changed, dropping old rules");
            if let Err(e) = self.udapi.remove_interface_rules(&RuleMarker::Tailscale).await {
                warn!(error = %e, "failed to remove stale tailscale rules");
            }
        }

        self.ensure_tailscale_rules(&prefix).await?;
        info!(chain_prefix = %prefix, "tailscale firewall setup complete");
        Ok(())
    }

    /// Re-apply the mesh interface rules from the manifest's prefix,
    /// rediscovering it first when only the legacy default is known.
    pub async fn restore_tailscale_rules(&self) -> Result<(), CoreError> {
        if !self.integration_ready() {
            return Ok(());
        }

        let zone = self.manifest.tailscale_zone();
        let mut prefix = zone.chain_prefix();
        if prefix.is_default()
            && zone.has_zone()
            && let Some(rediscovered) = self.discover_chain_prefix(&zone.zone_id).await
        {
            if let Err(e) = self.udapi.remove_interface_rules(&RuleMarker::Tailscale).await {
                warn!(error = %e, "failed to remove stale tailscale rules");
            }
            self.manifest.set_tailscale_zone(ZoneManifest {
                chain_prefix: rediscovered.as_str().to_owned(),
                ..zone
            });
            if let Err(e) = self.manifest.save() {
                warn!(error = %e, "manifest save failed");
            }
            info!(prefix = %rediscovered, "tailscale chain prefix re-discovered");
            prefix = rediscovered;
        }

        self.ensure_tailscale_rules(&prefix).await
    }

    async fn ensure_tailscale_rules(&self, prefix: &ChainPrefix) -> Result<(), CoreError> {
        if !prefix.is_default() {
            let forward = self.chain_has(CHAIN_FORWARD_IN_USER, "-i", TAILSCALE_IFACE).await;
            let input = self.chain_has(CHAIN_INPUT_USER_HOOK, "-i", TAILSCALE_IFACE).await;
            let output = self.chain_has(CHAIN_OUTPUT_USER_HOOK, "-o", TAILSCALE_IFACE).await;
            let ipset = self
                .ipset_has(&prefix.kernel_subnet_set(), TAILSCALE_CGNAT)
                .await;
            if forward && input && output && ipset {
                return Ok(());
            }
        }

        self.udapi
            .add_interface_rules_for_zone(TAILSCALE_IFACE, &RuleMarker::Tailscale, prefix.as_str())
            .await?;

        let set = prefix.subnet_set();
        if let Err(e) = self.udapi.ensure_set_entry(&set, TAILSCALE_CGNAT).await {
            warn!(ipset = %set, error = %e, "zone ipset update failed");
        }
        Ok(())
    }

    // ── Site-to-site tunnels ─────────────────────────────────────────

    /// Assign `tunnel_id` to a zone: an existing one by ID (it must already
    /// back another tunnel), or a new or reused one by name.
    pub async fn setup_wg_s2s_zone(
        &self,
        tunnel_id: &str,
        zone_id: Option<&str>,
        zone_name: Option<&str>,
    ) -> Result<(), CoreError> {
        let (client, site) = self.require_integration()?;

        if let Some(zone_id) = zone_id.filter(|z| !z.is_empty() && *z != "new") {
            let existing = self
                .manifest
                .wg_s2s_snapshot()
                .into_values()
                .find(|zm| zm.zone_id == zone_id)
                .ok_or_else(|| CoreError::not_found("zone in manifest", zone_id))?;
            self.manifest.set_wg_s2s_zone(tunnel_id, existing);
            return self.manifest.save();
        }

        let zone_name = zone_name
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_WG_S2S_ZONE);
        let display = zones::zone_display_name(zone_name);
        let zone = zones::ensure_zone(&client, &site, &display).await?;
        info!(zone_id = %zone.id, name = %zone.name, "wg-s2s integration zone ready");

        let policy_ids = match zones::ensure_policies(&client, &site, zone_name, &zone.id).await {
            Ok(ids) => {
                info!(count = ids.len(), "wg-s2s integration policies ready");
                ids
            }
            Err(e) => {
                warn!(error = %e, "wg-s2s integration policy setup had errors");
                Vec::new()
            }
        };

        let prefix = self
            .discover_chain_prefix(&zone.id)
            .await
            .unwrap_or_default();
        self.manifest.set_wg_s2s_zone(
            tunnel_id,
            ZoneManifest {
                zone_id: zone.id,
                zone_name: zone.name,
                policy_ids,
                chain_prefix: prefix.as_str().to_owned(),
            },
        );
        self.manifest.save()
    }

    /// Attach `iface` to its tunnel's zone chains and add the tunnel's
    /// remote subnets to the zone ipset.
    pub async fn setup_wg_s2s_firewall(
        &self,
        tunnel_id: &str,
        iface: &str,
        allowed_ips: &[IpNet],
    ) -> Result<(), CoreError> {
        let mut prefix = self.manifest.wg_s2s_chain_prefix(tunnel_id);
        if prefix.is_default()
            && let Some(zone) = self.manifest.wg_s2s_zone(tunnel_id)
            && zone.has_zone()
            && let Some(rediscovered) = self.discover_chain_prefix(&zone.zone_id).await
        {
            self.manifest.set_wg_s2s_zone(
                tunnel_id,
                ZoneManifest {
                    chain_prefix: rediscovered.as_str().to_owned(),
                    ..zone
                },
            );
            if let Err(e) = self.manifest.save() {
                warn!(error = %e, "manifest save failed");
            }
            prefix = rediscovered;
        }

        self.udapi
            .add_interface_rules_for_zone(iface, &RuleMarker::wg_s2s(iface), prefix.as_str())
            .await?;

        if allowed_ips.is_empty() {
            return Ok(());
        }

        let local = match self.netlink.system_subnets(&[iface]).await {
            Ok(sys) => sys.interfaces,
            Err(e) => {
                debug!(error = %e, "could not collect local subnets, skipping conflict check");
                Vec::new()
            }
        };
        let set = prefix.subnet_set();
        for cidr in allowed_ips {
            if let Some(conflict) = local.iter().find(|s| overlaps(cidr, &s.cidr)) {
                warn!(
                    %cidr,
                    conflicts_with = %conflict.cidr,
                    iface = %conflict.interface,
                    "skipping conflicting ipset entry"
                );
                continue;
            }
            if let Err(e) = self.udapi.ensure_set_entry(&set, &cidr.to_string()).await {
                warn!(ipset = %set, %cidr, error = %e, "wg-s2s zone ipset update failed");
            }
        }
        Ok(())
    }

    /// Detach `iface` and drop its subnets from a discovered zone's ipset.
    /// Failures are logged.
    pub async fn remove_wg_s2s_firewall(&self, tunnel_id: &str, iface: &str, allowed_ips: &[IpNet]) {
        if let Err(e) = self
            .udapi
            .remove_interface_rules(&RuleMarker::wg_s2s(iface))
            .await
        {
            warn!(%iface, error = %e, "wg-s2s firewall rule removal failed");
        }
        self.remove_wg_s2s_ipset_entries(tunnel_id, allowed_ips).await;
    }

    /// The legacy `VPN_subnets` set is shared, so entries are only removed
    /// from discovered zone sets.
    pub async fn remove_wg_s2s_ipset_entries(&self, tunnel_id: &str, cidrs: &[IpNet]) {
        let prefix = self.manifest.wg_s2s_chain_prefix(tunnel_id);
        if prefix.is_default() {
            return;
        }
        let set = prefix.subnet_set();
        for cidr in cidrs {
            if let Err(e) = self.udapi.remove_set_entry(&set, &cidr.to_string()).await {
                warn!(ipset = %set, %cidr, error = %e, "wg-s2s ipset entry removal failed");
            }
        }
    }

    // ── WAN ports ────────────────────────────────────────────────────

    pub async fn open_wan_port(&self, port: u16, marker: &WanPortMarker) -> Result<(), CoreError> {
        let (client, site) = self.require_integration()?;
        if self.manifest.wan_port(marker).is_some() {
            return Ok(());
        }

        let (external, gateway) = self.resolve_system_zones(&client, &site).await?;
        let name = marker.policy_name(port);
        let policy_id =
            zones::ensure_wan_port_policy(&client, &site, port, &name, &external, &gateway).await?;

        self.manifest.set_wan_port(
            marker,
            WanPortEntry {
                policy_id: policy_id.clone(),
                policy_name: name,
                port,
            },
        );
        self.manifest.save()?;
        info!(port, %marker, %policy_id, "WAN port policy created");
        Ok(())
    }

    /// Delete the marker's policy. A policy already gone upstream still
    /// counts as closed.
    pub async fn close_wan_port(&self, port: u16, marker: &WanPortMarker) -> Result<(), CoreError> {
        let (client, site) = self.require_integration()?;
        let Some(entry) = self.manifest.wan_port(marker) else {
            return Ok(());
        };

        match client.delete_firewall_policy(&site, &entry.policy_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                info!(%marker, policy_id = %entry.policy_id, "WAN port policy already gone from API");
            }
            Err(e) => return Err(e.into()),
        }

        self.manifest.remove_wan_port(marker);
        self.manifest.save()?;
        info!(port, %marker, "WAN port policy deleted");
        Ok(())
    }

    /// Recreate WAN-port policies whose recorded ID no longer exists.
    pub async fn reconcile_wan_ports(&self) -> Result<(), CoreError> {
        let (client, site) = self.require_integration()?;
        let entries = self.manifest.wan_ports();
        if entries.is_empty() {
            return Ok(());
        }

        let live: HashSet<String> = client
            .list_firewall_policies(&site)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();

        for (marker, entry) in entries {
            if live.contains(&entry.policy_id) {
                continue;
            }
            warn!(%marker, policy_id = %entry.policy_id, "WAN port policy missing upstream, recreating");
            self.manifest.remove_wan_port(&marker);
            if let Err(e) = self.open_wan_port(entry.port, &marker).await {
                warn!(%marker, port = entry.port, error = %e, "WAN port policy recreation failed");
            }
        }
        Ok(())
    }

    async fn resolve_system_zones(
        &self,
        client: &IntegrationClient,
        site: &str,
    ) -> Result<(String, String), CoreError> {
        if let Some(ids) = self.manifest.system_zone_ids() {
            return Ok(ids);
        }
        let (external, gateway) = zones::find_system_zones(client, site).await?;
        self.manifest.set_system_zone_ids(&external, &gateway);
        self.manifest.save()?;
        Ok((external, gateway))
    }

    // ── Presence checks ──────────────────────────────────────────────

    /// Each direction counts as present through either the user hook
    /// chain or the zone's own chain.
    pub async fn check_tailscale_rules_present(&self) -> TailscaleRulesPresent {
        let prefix = self.manifest.tailscale_chain_prefix();
        let ts = TAILSCALE_IFACE;

        TailscaleRulesPresent {
            forward: self.chain_has(CHAIN_FORWARD_IN_USER, "-i", ts).await
                || self.chain_has(&prefix.zone_in_chain(), "-i", ts).await,
            input: self.chain_has(CHAIN_INPUT_USER_HOOK, "-i", ts).await
                || self.chain_has(&prefix.zone_local_chain(), "-i", ts).await,
            output: self.chain_has(CHAIN_OUTPUT_USER_HOOK, "-o", ts).await
                || self.chain_has(&prefix.zone_out_chain(), "-o", ts).await,
            ipset: self
                .ipset_has(&prefix.kernel_subnet_set(), TAILSCALE_CGNAT)
                .await,
        }
    }

    /// Ingress rule presence per interface.
    pub async fn check_wg_s2s_rules_present(&self, ifaces: &[&str]) -> BTreeMap<String, bool> {
        let mut present = BTreeMap::new();
        for iface in ifaces {
            let found = self.chain_has(CHAIN_FORWARD_IN_USER, "-i", iface).await;
            present.insert((*iface).to_owned(), found);
        }
        present
    }

    // ── Chain-prefix discovery ───────────────────────────────────────

    /// Map `zone_id` to its `CUSTOM<n>` prefix by position in the
    /// controller database, accepted only if the zone's user chain exists.
    pub async fn discover_chain_prefix(&self, zone_id: &str) -> Option<ChainPrefix> {
        if zone_id.is_empty() {
            return None;
        }
        let ids = match self.probe.custom_zone_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                debug!(error = %e, "zone database query failed");
                return None;
            }
        };
        let index = ids.iter().position(|id| id == zone_id)?;
        let prefix = ChainPrefix::custom(index);
        let chain = prefix.user_chain();
        if self.probe.chain_rules(&chain).await.is_some() {
            info!(%zone_id, %prefix, "chain prefix discovered");
            Some(prefix)
        } else {
            warn!(%prefix, %chain, "discovered chain missing in iptables");
            None
        }
    }

    async fn chain_has(&self, chain: &str, flag: &str, iface: &str) -> bool {
        self.probe
            .chain_rules(chain)
            .await
            .is_some_and(|rules| rules_match_interface(&rules, flag, iface))
    }

    async fn ipset_has(&self, set: &str, member: &str) -> bool {
        self.probe
            .ipset_list(set)
            .await
            .is_some_and(|listing| listing_has_member(&listing, member))
    }
}

/// Whether any `iptables -S` line carries `flag iface` as two whole tokens.
fn rules_match_interface(rules: &str, flag: &str, iface: &str) -> bool {
    rules.lines().any(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        tokens.windows(2).any(|pair| pair[0] == flag && pair[1] == iface)
    })
}

/// Members are listed one per line, optionally followed by options such
/// as `timeout 0`.
fn listing_has_member(listing: &str, member: &str) -> bool {
    listing
        .lines()
        .any(|line| line.split_whitespace().next() == Some(member))
}
