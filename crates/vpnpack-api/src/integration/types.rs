//! Request and response types for the Integration API endpoints the daemon uses.
//!
//! Field names use camelCase on the wire. Response types are lenient:
//! anything the daemon does not interpret stays a `serde_json::Value`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Pagination ───────────────────────────────────────────────────────

/// Pagination wrapper returned by list endpoints. Only `data` is guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub limit: i32,
    #[serde(default)]
    pub count: i32,
    #[serde(default)]
    pub total_count: Option<i64>,
    pub data: Vec<T>,
}

// ── Info / Sites ─────────────────────────────────────────────────────

/// From `GET /v1/info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationInfo {
    #[serde(default)]
    pub application_version: String,
}

/// From `GET /v1/sites`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

// ── Firewall Zones ───────────────────────────────────────────────────

/// Firewall zone, from `GET /v1/sites/{siteId}/firewall/zones`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallZone {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub network_ids: Vec<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallZoneCreate {
    pub name: String,
    pub network_ids: Vec<String>,
}

impl FirewallZoneCreate {
    /// A zone with no networks attached; interfaces join it through
    /// on-box rules instead.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            network_ids: Vec::new(),
        }
    }
}

// ── Firewall Policies ────────────────────────────────────────────────

/// Firewall policy as listed. Source and destination stay raw since the
/// daemon only matches policies by name and ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallPolicy {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub action: Value,
    #[serde(default)]
    pub source: Value,
    #[serde(default)]
    pub destination: Value,
    #[serde(default)]
    pub ip_protocol_scope: Option<Value>,
    #[serde(default)]
    pub logging_enabled: bool,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Body for `POST /v1/sites/{siteId}/firewall/policies`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallPolicyCreate {
    pub enabled: bool,
    pub name: String,
    pub action: PolicyAction,
    pub source: PolicyEndpoint,
    pub destination: PolicyEndpoint,
    pub ip_protocol_scope: IpProtocolScope,
    pub logging_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub allow_return_traffic: bool,
}

impl PolicyAction {
    pub fn allow(allow_return_traffic: bool) -> Self {
        Self {
            kind: "ALLOW".into(),
            allow_return_traffic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEndpoint {
    pub zone_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_filter: Option<TrafficFilter>,
}

impl PolicyEndpoint {
    pub fn zone(zone_id: impl Into<String>) -> Self {
        Self {
            zone_id: zone_id.into(),
            traffic_filter: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficFilter {
    #[serde(rename = "type")]
    pub kind: String,
    pub port_filter: PortFilter,
}

impl TrafficFilter {
    /// Match exactly one destination port.
    pub fn single_port(port: u16) -> Self {
        Self {
            kind: "PORT".into(),
            port_filter: PortFilter {
                kind: "PORTS".into(),
                match_opposite: false,
                items: vec![PortFilterItem {
                    kind: "PORT_NUMBER".into(),
                    value: port,
                }],
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortFilter {
    #[serde(rename = "type")]
    pub kind: String,
    pub match_opposite: bool,
    pub items: Vec<PortFilterItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortFilterItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpProtocolScope {
    pub ip_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_filter: Option<ProtocolFilter>,
}

impl IpProtocolScope {
    pub fn dual_stack() -> Self {
        Self {
            ip_version: "IPV4_AND_IPV6".into(),
            protocol_filter: None,
        }
    }

    pub fn ipv4_udp() -> Self {
        Self {
            ip_version: "IPV4".into(),
            protocol_filter: Some(ProtocolFilter {
                kind: "NAMED_PROTOCOL".into(),
                protocol: ProtocolName { name: "UDP".into() },
                match_opposite: false,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolFilter {
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol: ProtocolName,
    pub match_opposite: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolName {
    pub name: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn wan_policy_body_shape() {
        let body = FirewallPolicyCreate {
            enabled: true,
            name: "VPN Pack: UDP 51820".into(),
            action: PolicyAction::allow(false),
            source: PolicyEndpoint::zone("ext"),
            destination: PolicyEndpoint {
                zone_id: "gw".into(),
                traffic_filter: Some(TrafficFilter::single_port(51820)),
            },
            ip_protocol_scope: IpProtocolScope::ipv4_udp(),
            logging_enabled: false,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["action"], json!({ "type": "ALLOW", "allowReturnTraffic": false }));
        assert_eq!(v["source"], json!({ "zoneId": "ext" }));
        assert_eq!(
            v["destination"]["trafficFilter"],
            json!({
                "type": "PORT",
                "portFilter": {
                    "type": "PORTS",
                    "matchOpposite": false,
                    "items": [{ "type": "PORT_NUMBER", "value": 51820 }],
                },
            })
        );
        assert_eq!(
            v["ipProtocolScope"],
            json!({
                "ipVersion": "IPV4",
                "protocolFilter": {
                    "type": "NAMED_PROTOCOL",
                    "protocol": { "name": "UDP" },
                    "matchOpposite": false,
                },
            })
        );
    }

    #[test]
    fn page_tolerates_bare_data() {
        let page: Page<Site> = serde_json::from_value(json!({ "data": [{ "id": "s1" }] })).unwrap();
        assert_eq!(page.data[0].id, "s1");
        assert_eq!(page.total_count, None);
    }
}
