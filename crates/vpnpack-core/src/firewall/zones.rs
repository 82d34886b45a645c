// ── Integration API ensure helpers ──
//
// Find-by-name-or-create semantics for the zone and policy objects the
// daemon owns. Names are the identity; IDs are whatever the API returns.

use vpnpack_api::IntegrationClient;
use vpnpack_api::integration::types::{
    FirewallPolicy, FirewallPolicyCreate, FirewallZone, FirewallZoneCreate, IpProtocolScope,
    PolicyAction, PolicyEndpoint, TrafficFilter,
};

use crate::error::CoreError;

/// Display-name prefix on every object the daemon creates.
pub const NAME_PREFIX: &str = "VPN Pack: ";

pub fn zone_display_name(name: &str) -> String {
    format!("{NAME_PREFIX}{name}")
}

pub async fn ensure_zone(
    client: &IntegrationClient,
    site_id: &str,
    name: &str,
) -> Result<FirewallZone, CoreError> {
    let zones = client.list_firewall_zones(site_id).await?;
    if let Some(zone) = zones.into_iter().find(|z| z.name == name) {
        return Ok(zone);
    }
    Ok(client
        .create_firewall_zone(site_id, &FirewallZoneCreate::empty(name))
        .await?)
}

/// `Internal`, else the first `LAN` or `Default` zone.
pub fn pick_internal_zone(zones: &[FirewallZone]) -> Option<&FirewallZone> {
    zones
        .iter()
        .find(|z| z.name == "Internal")
        .or_else(|| zones.iter().find(|z| z.name == "LAN" || z.name == "Default"))
}

/// The `External` and `Gateway` system zone IDs.
pub async fn find_system_zones(
    client: &IntegrationClient,
    site_id: &str,
) -> Result<(String, String), CoreError> {
    let zones = client.list_firewall_zones(site_id).await?;
    let id_of = |name: &str| {
        zones
            .iter()
            .find(|z| z.name == name)
            .map(|z| z.id.clone())
            .ok_or_else(|| CoreError::not_found("firewall zone", name))
    };
    Ok((id_of("External")?, id_of("Gateway")?))
}

fn find_policy<'a>(policies: &'a [FirewallPolicy], name: &str) -> Option<&'a FirewallPolicy> {
    policies.iter().find(|p| p.name == name)
}

fn allow_between(name: String, source: &str, destination: &str) -> FirewallPolicyCreate {
    FirewallPolicyCreate {
        enabled: true,
        name,
        action: PolicyAction::allow(true),
        source: PolicyEndpoint::zone(source),
        destination: PolicyEndpoint::zone(destination),
        ip_protocol_scope: IpProtocolScope::dual_stack(),
        logging_enabled: false,
    }
}

/// Ensure the two allow policies between `zone_id` and the internal zone,
/// returning their IDs. Stops at the first creation failure.
pub async fn ensure_policies(
    client: &IntegrationClient,
    site_id: &str,
    zone_name: &str,
    zone_id: &str,
) -> Result<Vec<String>, CoreError> {
    let zones = client.list_firewall_zones(site_id).await?;
    let internal = pick_internal_zone(&zones)
        .map(|z| z.id.clone())
        .ok_or_else(|| CoreError::not_found("firewall zone", "Internal/LAN/Default"))?;
    let existing = client.list_firewall_policies(site_id).await?;

    let wanted = [
        allow_between(
            format!("{NAME_PREFIX}Allow {zone_name} to Internal"),
            zone_id,
            &internal,
        ),
        allow_between(
            format!("{NAME_PREFIX}Allow Internal to {zone_name}"),
            &internal,
            zone_id,
        ),
    ];

    let mut ids = Vec::with_capacity(wanted.len());
    for policy in &wanted {
        if let Some(found) = find_policy(&existing, &policy.name) {
            ids.push(found.id.clone());
            continue;
        }
        let created = client.create_firewall_policy(site_id, policy).await?;
        ids.push(created.id);
    }
    Ok(ids)
}

/// Ensure a single-port UDP allow policy from External to Gateway.
pub async fn ensure_wan_port_policy(
    client: &IntegrationClient,
    site_id: &str,
    port: u16,
    name: &str,
    external_zone_id: &str,
    gateway_zone_id: &str,
) -> Result<String, CoreError> {
    let existing = client.list_firewall_policies(site_id).await?;
    if let Some(found) = find_policy(&existing, name) {
        return Ok(found.id.clone());
    }
    let policy = FirewallPolicyCreate {
        enabled: true,
        name: name.to_owned(),
        action: PolicyAction::allow(false),
        source: PolicyEndpoint::zone(external_zone_id),
        destination: PolicyEndpoint {
            traffic_filter: Some(TrafficFilter::single_port(port)),
            ..PolicyEndpoint::zone(gateway_zone_id)
        },
        ip_protocol_scope: IpProtocolScope::ipv4_udp(),
        logging_enabled: false,
    };
    Ok(client.create_firewall_policy(site_id, &policy).await?.id)
}

/// First site's ID.
pub async fn discover_site_id(client: &IntegrationClient) -> Result<String, CoreError> {
    client
        .list_sites()
        .await?
        .into_iter()
        .next()
        .map(|s| s.id)
        .ok_or_else(|| CoreError::not_found("site", "any"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn zone(id: &str, name: &str) -> FirewallZone {
        serde_json::from_value(serde_json::json!({ "id": id, "name": name, "networkIds": [] }))
            .unwrap()
    }

    #[test]
    fn internal_zone_prefers_exact_name() {
        let zones = vec![zone("1", "LAN"), zone("2", "Internal"), zone("3", "Default")];
        assert_eq!(pick_internal_zone(&zones).unwrap().id, "2");

        let zones = vec![zone("1", "External"), zone("3", "Default"), zone("4", "LAN")];
        assert_eq!(pick_internal_zone(&zones).unwrap().id, "3");

        assert!(pick_internal_zone(&[zone("1", "External")]).is_none());
    }
}
