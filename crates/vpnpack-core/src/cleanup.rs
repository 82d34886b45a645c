// ── Uninstall cleanup ──
//
// Remove everything the daemon created on the box and upstream. Every
// step is best-effort; remote deletes treat not-found as done.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::context::{VpnPack, log_removal};
use crate::manifest::ManifestData;
use crate::markers::{ChainPrefix, RuleMarker, TAILSCALE_CGNAT};
use crate::system::interfaces_with_prefix;
use crate::tunnel::INTERFACE_PREFIX;

impl VpnPack {
    /// On-box rules and interfaces first, then policies before the zones
    /// they reference.
    pub async fn cleanup(&self) {
        info!("cleanup: removing firewall rules and tunnel interfaces");
        let udapi = self.firewall().udapi();

        match udapi.remove_interface_rules(&RuleMarker::Tailscale).await {
            Ok(()) => info!("cleanup: tailscale rules removed"),
            Err(e) => warn!(error = %e, "cleanup: tailscale rule removal failed"),
        }

        let ifaces = interfaces_with_prefix(&self.config().paths.sys_class_net, INTERFACE_PREFIX)
            .unwrap_or_else(|e| {
                warn!(error = %e, "cleanup: could not list tunnel interfaces");
                Vec::new()
            });
        for iface in &ifaces {
            match udapi.remove_interface_rules(&RuleMarker::wg_s2s(iface)).await {
                Ok(()) => info!(%iface, "cleanup: wg-s2s rules removed"),
                Err(e) => warn!(%iface, error = %e, "cleanup: wg-s2s rule removal failed"),
            }
        }
        for iface in &ifaces {
            self.delete_interface(iface).await;
        }

        let legacy_set = ChainPrefix::default_prefix().subnet_set();
        match udapi.remove_set_entry(&legacy_set, TAILSCALE_CGNAT).await {
            Ok(()) => info!(set = %legacy_set, cidr = TAILSCALE_CGNAT, "cleanup: ipset entry removed"),
            Err(e) => warn!(set = %legacy_set, error = %e, "cleanup: ipset entry removal failed"),
        }

        self.remove_integration_resources().await;
        info!("cleanup: done");
    }

    async fn delete_interface(&self, iface: &str) {
        let result = match self.netlink().link_index(iface).await {
            Ok(Some(index)) => self.netlink().delete_link(index).await,
            Ok(None) => return,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => info!(%iface, "cleanup: interface removed"),
            Err(e) => warn!(%iface, error = %e, "cleanup: interface removal failed"),
        }
    }

    async fn remove_integration_resources(&self) {
        let Ok((client, site)) = self.firewall().require_integration() else {
            warn!("cleanup: integration not configured, skipping zone/policy cleanup");
            return;
        };
        info!(site_id = %site, "cleanup: removing integration zones and policies");

        let ManifestData {
            tailscale,
            wg_s2s,
            wan_ports,
            ..
        } = self.manifest().snapshot();

        for (marker, entry) in &wan_ports {
            let result = client.delete_firewall_policy(&site, &entry.policy_id).await;
            log_removal("WAN port policy", marker, result);
        }
        for zone in wg_s2s.values() {
            for policy_id in &zone.policy_ids {
                let result = client.delete_firewall_policy(&site, policy_id).await;
                log_removal("wg-s2s policy", policy_id, result);
            }
        }
        for policy_id in &tailscale.policy_ids {
            let result = client.delete_firewall_policy(&site, policy_id).await;
            log_removal("tailscale policy", policy_id, result);
        }

        let mut deleted = HashSet::new();
        for zone in wg_s2s.values().filter(|z| z.has_zone()) {
            if !deleted.insert(zone.zone_id.as_str()) {
                continue;
            }
            let result = client.delete_firewall_zone(&site, &zone.zone_id).await;
            log_removal("wg-s2s zone", &zone.zone_id, result);
        }
        if tailscale.has_zone() {
            let result = client.delete_firewall_zone(&site, &tailscale.zone_id).await;
            log_removal("tailscale zone", &tailscale.zone_id, result);
        }

        info!("cleanup: integration cleanup complete");
    }
}
