// Tunnel operations joined with their firewall, zone, and WAN-port side
// effects. The tunnel manager owns the interface; everything here is
// best-effort around it.

use ipnet::IpNet;
use serde::Serialize;
use tracing::{info, warn};

use super::VpnPack;
use crate::error::CoreError;
use crate::firewall::DEFAULT_WG_S2S_ZONE;
use crate::manifest::WgS2sZoneInfo;
use crate::markers::WanPortMarker;
use crate::netcfg::NetConfig;
use crate::subnets::validate_allowed_ips;
use crate::tunnel::{NewTunnel, TunnelConfig, TunnelUpdate, WgS2sStatus, render_peer_config};

/// Zone assignment for a new tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ZoneChoice {
    /// Create the default zone only if no tunnel zone exists yet.
    #[default]
    Auto,
    /// Find or create a zone with this name (default name when `None`).
    New(Option<String>),
    /// Join a zone already backing another tunnel.
    Existing(String),
}

impl ZoneChoice {
    /// Interpret the `zoneId` / `zoneName` request pair, where `zoneId` may
    /// be the literal `new`.
    pub fn from_request(zone_id: Option<&str>, zone_name: Option<&str>) -> Self {
        let name = zone_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_owned);
        match zone_id.map(str::trim).filter(|z| !z.is_empty()) {
            Some("new") => Self::New(name),
            Some(id) => Self::Existing(id.to_owned()),
            None => Self::Auto,
        }
    }
}

/// A tunnel as presented to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelView {
    #[serde(flatten)]
    pub config: TunnelConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<WgS2sStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_name: Option<String>,
}

fn port_marker(tunnel: &TunnelConfig) -> WanPortMarker {
    WanPortMarker::wg_s2s(&tunnel.interface_name)
}

impl VpnPack {
    pub async fn create_tunnel(
        &self,
        request: NewTunnel,
        private_key: Option<&str>,
        zone: &ZoneChoice,
    ) -> Result<TunnelView, CoreError> {
        self.warn_on_conflicts(&request.allowed_ips, None).await;
        let tunnel = self.inner.tunnels.create(request, private_key).await?;

        self.assign_zone(&tunnel.id, zone).await;
        self.queue_apply(&tunnel);
        self.open_tunnel_port(&tunnel).await;

        Ok(self.view(tunnel, None))
    }

    /// Apply an update, then move firewall state along with it: dropped
    /// subnets leave the zone ipset, a changed port moves the WAN policy.
    /// An update that ends with the tunnel disabled releases both.
    pub async fn update_tunnel(
        &self,
        id: &str,
        update: TunnelUpdate,
    ) -> Result<TunnelView, CoreError> {
        let before = self
            .inner
            .tunnels
            .get(id)
            .await
            .ok_or_else(|| CoreError::not_found("tunnel", id))?;
        if let Some(ips) = &update.allowed_ips {
            self.warn_on_conflicts(ips, Some(&before.interface_name)).await;
        }

        let after = match self.inner.tunnels.update(id, update).await {
            Ok(after) => after,
            Err(e) => {
                self.release_if_disabled(&before).await;
                return Err(e);
            }
        };

        if after.enabled {
            let dropped: Vec<IpNet> = before
                .allowed_ips
                .iter()
                .filter(|c| !after.allowed_ips.contains(c))
                .copied()
                .collect();
            if !dropped.is_empty() {
                self.inner
                    .firewall
                    .remove_wg_s2s_ipset_entries(id, &dropped)
                    .await;
            }
            self.queue_apply(&after);
            if before.listen_port != after.listen_port {
                self.close_tunnel_port(&before).await;
                self.open_tunnel_port(&after).await;
            }
        }

        Ok(self.view(after, None))
    }

    pub async fn enable_tunnel(&self, id: &str) -> Result<TunnelConfig, CoreError> {
        let tunnel = self.inner.tunnels.enable(id).await?;
        self.queue_apply(&tunnel);
        self.open_tunnel_port(&tunnel).await;
        Ok(tunnel)
    }

    pub async fn disable_tunnel(&self, id: &str) -> Result<TunnelConfig, CoreError> {
        let tunnel = self.inner.tunnels.disable(id).await?;
        self.inner
            .firewall
            .remove_wg_s2s_firewall(id, &tunnel.interface_name, &tunnel.allowed_ips)
            .await;
        self.close_tunnel_port(&tunnel).await;
        Ok(tunnel)
    }

    /// Delete locally, then release remote state. Remote failures are
    /// logged; the local deletion stands.
    pub async fn delete_tunnel(&self, id: &str) -> Result<TunnelConfig, CoreError> {
        let tunnel = self.inner.tunnels.delete(id).await?;
        self.inner
            .firewall
            .remove_wg_s2s_firewall(id, &tunnel.interface_name, &tunnel.allowed_ips)
            .await;
        self.close_tunnel_port(&tunnel).await;
        self.release_zone(id).await;

        self.inner.manifest.remove_wg_s2s_tunnel(id);
        if let Err(e) = self.inner.manifest.save() {
            warn!(error = %e, "manifest save failed");
        }
        Ok(tunnel)
    }

    /// Every tunnel with live status, public key, zone, and whether its
    /// ingress rule is in place.
    pub async fn list_tunnels(&self) -> Vec<TunnelView> {
        let tunnels = self.inner.tunnels.tunnels().await;
        let statuses = self.inner.tunnels.statuses().await;

        let enabled: Vec<&str> = tunnels
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.interface_name.as_str())
            .collect();
        let present = self
            .inner
            .firewall
            .check_wg_s2s_rules_present(&enabled)
            .await;

        tunnels
            .into_iter()
            .map(|tunnel| {
                let status = statuses.iter().find(|s| s.id == tunnel.id).cloned().map(|mut s| {
                    if tunnel.enabled {
                        s.forward_in_ok = present.get(&tunnel.interface_name).copied();
                    }
                    s
                });
                self.view(tunnel, status)
            })
            .collect()
    }

    pub fn tunnel_zones(&self) -> Vec<WgS2sZoneInfo> {
        self.inner.manifest.wg_s2s_zones()
    }

    /// Config text for the remote side of tunnel `id`.
    pub async fn peer_config(&self, id: &str) -> Result<String, CoreError> {
        let tunnel = self
            .inner
            .tunnels
            .get(id)
            .await
            .ok_or_else(|| CoreError::not_found("tunnel", id))?;
        let public_key = self.inner.tunnels.public_key(id)?;
        let net = NetConfig::load_or_default(&self.inner.config.paths.udapi_net_config);
        Ok(render_peer_config(
            &tunnel,
            &public_key,
            net.wan_ip(),
            &net.local_subnets(),
        ))
    }

    // ── Internals ────────────────────────────────────────────────────

    fn view(&self, config: TunnelConfig, status: Option<WgS2sStatus>) -> TunnelView {
        let zone = self.inner.manifest.wg_s2s_zone(&config.id);
        TunnelView {
            public_key: self.inner.tunnels.public_key(&config.id).ok(),
            zone_id: zone.as_ref().map(|z| z.zone_id.clone()),
            zone_name: zone.map(|z| z.zone_name),
            status,
            config,
        }
    }

    async fn assign_zone(&self, tunnel_id: &str, choice: &ZoneChoice) {
        let firewall = &self.inner.firewall;
        if !firewall.integration_ready() {
            return;
        }
        let result = match choice {
            ZoneChoice::New(name) => {
                let name = name.as_deref().unwrap_or(DEFAULT_WG_S2S_ZONE);
                firewall.setup_wg_s2s_zone(tunnel_id, None, Some(name)).await
            }
            ZoneChoice::Existing(zone_id) => {
                firewall
                    .setup_wg_s2s_zone(tunnel_id, Some(zone_id.as_str()), None)
                    .await
            }
            ZoneChoice::Auto if self.inner.manifest.wg_s2s_zones().is_empty() => {
                firewall.setup_wg_s2s_zone(tunnel_id, None, None).await
            }
            ZoneChoice::Auto => return,
        };
        if let Err(e) = result
            && !self.handle_rejection(&e)
        {
            warn!(tunnel_id, error = %e, "wg-s2s zone setup failed");
        }
    }

    /// Delete the tunnel's zone policies and zone once no other tunnel
    /// uses them.
    async fn release_zone(&self, tunnel_id: &str) {
        let manifest = &self.inner.manifest;
        let Some(zone) = manifest.wg_s2s_zone(tunnel_id) else {
            return;
        };
        if !zone.has_zone() || manifest.tunnels_in_zone(&zone.zone_id, tunnel_id) > 0 {
            return;
        }
        let Ok((client, site)) = self.inner.firewall.require_integration() else {
            return;
        };

        for policy_id in &zone.policy_ids {
            let result = client.delete_firewall_policy(&site, policy_id).await;
            if self.rejected(&result) {
                return;
            }
            log_removal("wg-s2s policy", policy_id, result);
        }
        let result = client.delete_firewall_zone(&site, &zone.zone_id).await;
        if !self.rejected(&result) {
            log_removal("wg-s2s zone", &zone.zone_id, result);
        }
    }

    /// A failed recreate leaves the tunnel stored disabled; drop its
    /// rules and WAN port the way [`disable_tunnel`](Self::disable_tunnel)
    /// would.
    async fn release_if_disabled(&self, before: &TunnelConfig) {
        let Some(now) = self.inner.tunnels.get(&before.id).await else {
            return;
        };
        if !before.enabled || now.enabled {
            return;
        }
        let cidrs: Vec<IpNet> = before
            .allowed_ips
            .iter()
            .chain(now.allowed_ips.iter().filter(|c| !before.allowed_ips.contains(c)))
            .copied()
            .collect();
        self.inner
            .firewall
            .remove_wg_s2s_firewall(&now.id, &now.interface_name, &cidrs)
            .await;
        self.close_tunnel_port(before).await;
    }

    async fn open_tunnel_port(&self, tunnel: &TunnelConfig) {
        if !self.inner.firewall.integration_ready() {
            return;
        }
        if let Err(e) = self
            .inner
            .firewall
            .open_wan_port(tunnel.listen_port, &port_marker(tunnel))
            .await
            && !self.handle_rejection(&e)
        {
            warn!(port = tunnel.listen_port, error = %e, "wg-s2s WAN port open failed");
        }
    }

    async fn close_tunnel_port(&self, tunnel: &TunnelConfig) {
        if !self.inner.firewall.integration_ready() {
            return;
        }
        if let Err(e) = self
            .inner
            .firewall
            .close_wan_port(tunnel.listen_port, &port_marker(tunnel))
            .await
            && !self.handle_rejection(&e)
        {
            warn!(port = tunnel.listen_port, error = %e, "wg-s2s WAN port close failed");
        }
    }

    fn rejected(&self, result: &Result<(), vpnpack_api::Error>) -> bool {
        if result.as_ref().is_err_and(vpnpack_api::Error::is_unauthorized) {
            warn!("API key rejected during zone release, entering degraded mode");
            self.invalidate_credential();
            return true;
        }
        false
    }

    async fn warn_on_conflicts(&self, cidrs: &[IpNet], own_iface: Option<&str>) {
        if cidrs.is_empty() {
            return;
        }
        let exclude: Vec<&str> = own_iface.into_iter().collect();
        let system = match self.inner.netlink.system_subnets(&exclude).await {
            Ok(system) => system,
            Err(e) => {
                warn!(error = %e, "could not collect system subnets");
                return;
            }
        };
        let result = validate_allowed_ips(cidrs, &system);
        for conflict in result.blocked.iter().chain(&result.warnings) {
            warn!(
                cidr = %conflict.cidr,
                conflicts_with = %conflict.conflicts_with,
                severity = ?conflict.severity,
                "{}",
                conflict.message
            );
        }
    }
}

/// Log the outcome of a best-effort remote delete; not-found counts as done.
pub(crate) fn log_removal(kind: &str, id: &str, result: Result<(), vpnpack_api::Error>) {
    match result {
        Ok(()) => info!(kind, id, "removed"),
        Err(e) if e.is_not_found() => info!(kind, id, "already removed"),
        Err(e) => warn!(kind, id, error = %e, "removal failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_choice_from_request() {
        assert_eq!(ZoneChoice::from_request(None, None), ZoneChoice::Auto);
        assert_eq!(ZoneChoice::from_request(Some(""), Some("x")), ZoneChoice::Auto);
        assert_eq!(
            ZoneChoice::from_request(Some("new"), Some(" Branch ")),
            ZoneChoice::New(Some("Branch".into()))
        );
        assert_eq!(
            ZoneChoice::from_request(Some("new"), None),
            ZoneChoice::New(None)
        );
        assert_eq!(
            ZoneChoice::from_request(Some("z-1"), Some("ignored")),
            ZoneChoice::Existing("z-1".into())
        );
    }
}
