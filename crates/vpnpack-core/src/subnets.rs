// ── Allowed-IP conflict detection ──
//
// A tunnel's allowed IPs overlapping a locally attached subnet would steal
// LAN traffic: that is a block. Overlap with an existing route is only a
// warning, since the tunnel route may legitimately be more specific.

use ipnet::IpNet;
use serde::Serialize;

use crate::system::SystemSubnets;

/// Whether either network contains the other's base address.
pub fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Block,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetConflict {
    pub cidr: IpNet,
    pub conflicts_with: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub interface: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocked: Vec<SubnetConflict>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<SubnetConflict>,
}

impl ValidationResult {
    pub fn has_blocks(&self) -> bool {
        !self.blocked.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.blocked.is_empty() && self.warnings.is_empty()
    }
}

/// Check each candidate against interface subnets, then routes. One
/// conflict is reported per candidate.
pub fn validate_allowed_ips(cidrs: &[IpNet], system: &SystemSubnets) -> ValidationResult {
    let mut result = ValidationResult::default();

    for cidr in cidrs {
        if let Some(iface) = system
            .interfaces
            .iter()
            .find(|s| overlaps(cidr, &s.cidr))
        {
            result.blocked.push(SubnetConflict {
                cidr: *cidr,
                conflicts_with: iface.cidr.to_string(),
                interface: iface.interface.clone(),
                severity: Severity::Block,
                message: format!("{cidr} overlaps with {} ({})", iface.cidr, iface.interface),
            });
            continue;
        }

        if let Some(route) = system.routes.iter().find(|r| overlaps(cidr, &r.cidr)) {
            let via = route.gateway.as_deref().unwrap_or(&route.interface);
            result.warnings.push(SubnetConflict {
                cidr: *cidr,
                conflicts_with: format!("{} ({} route via {via})", route.cidr, route.protocol),
                interface: route.interface.clone(),
                severity: Severity::Warn,
                message: format!(
                    "Overlaps with existing route {}. Traffic may not be routed through tunnel.",
                    route.cidr
                ),
            });
        }
    }

    result
}
