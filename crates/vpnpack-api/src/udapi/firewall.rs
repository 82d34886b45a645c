// Firewall filter rules under `/firewall/filter/<chain>`.
//
// Rules are identified by a marker embedded in their description; the
// typed `RuleMarker` only becomes a string at this boundary.

use std::fmt;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::client::{Method, UdapiClient};
use crate::Error;

const FILTER_BASE: &str = "/firewall/filter/";

/// Built-in chains the daemon hooks interfaces into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterChain {
    ForwardIn,
    Input,
    Output,
}

impl FilterChain {
    pub const ALL: [Self; 3] = [Self::ForwardIn, Self::Input, Self::Output];

    fn path(self) -> String {
        format!("{FILTER_BASE}{self}")
    }

    fn rule_path(self) -> String {
        format!("{FILTER_BASE}{self}/rule")
    }
}

/// Which side of the packet the interface match applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDirection {
    In,
    Out,
}

impl RuleDirection {
    fn field(self) -> &'static str {
        match self {
            Self::In => "inInterface",
            Self::Out => "outInterface",
        }
    }
}

/// Owner tag for a set of interface rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleMarker {
    /// Rules for the mesh daemon's `tailscale0` interface.
    Tailscale,
    /// Rules for one site-to-site tunnel interface.
    WgS2s { iface: String },
}

impl RuleMarker {
    pub fn wg_s2s(iface: impl Into<String>) -> Self {
        Self::WgS2s {
            iface: iface.into(),
        }
    }

    /// Whether a rule description carries exactly this marker. The tag is
    /// matched with its parentheses so `wg-s2s1` never claims `wg-s2s10`.
    pub fn tags(&self, description: &str) -> bool {
        description.contains(&format!("({self})"))
    }
}

impl fmt::Display for RuleMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tailscale => f.write_str("vpn-pack-manager"),
            Self::WgS2s { iface } => write!(f, "wg-s2s-manager:{iface}"),
        }
    }
}

/// One interface jump rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub chain: FilterChain,
    pub target: String,
    pub interface: String,
    pub direction: RuleDirection,
    pub marker: RuleMarker,
}

impl FirewallRule {
    pub fn description(&self) -> String {
        format!("{} {} ({})", self.interface, self.target, self.marker)
    }

    fn body(&self) -> serde_json::Value {
        let mut body = json!({
            "target": self.target,
            "description": self.description(),
            "ipVersion": "both",
            "protocol": "all",
            "connectionState": [],
        });
        body[self.direction.field()] = json!({ "id": self.interface });
        body
    }
}

/// The three rules that attach `iface` to the zone chains named by `prefix`.
pub fn zone_rules(iface: &str, marker: &RuleMarker, prefix: &str) -> Vec<FirewallRule> {
    let rule = |chain, target: String, direction| FirewallRule {
        chain,
        target,
        interface: iface.to_owned(),
        direction,
        marker: marker.clone(),
    };
    vec![
        rule(FilterChain::ForwardIn, format!("{prefix}_IN"), RuleDirection::In),
        rule(FilterChain::Input, format!("{prefix}_LOCAL"), RuleDirection::In),
        rule(FilterChain::Output, format!("LOCAL_{prefix}"), RuleDirection::Out),
    ]
}

#[derive(Debug, Deserialize)]
pub struct ListedRule {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize)]
struct ChainListing {
    #[serde(default)]
    rules: Vec<ListedRule>,
}

impl UdapiClient {
    pub async fn list_rules(&self, chain: FilterChain) -> Result<Vec<ListedRule>, Error> {
        let resp = self.get(&chain.path()).await?;
        let listing: ChainListing = resp.decode()?;
        Ok(listing.rules)
    }

    pub async fn has_marker_rule(
        &self,
        chain: FilterChain,
        marker: &RuleMarker,
    ) -> Result<bool, Error> {
        Ok(self
            .list_rules(chain)
            .await?
            .iter()
            .any(|r| marker.tags(&r.description)))
    }

    /// Add `rule` unless its chain already carries a rule with the same marker.
    pub async fn add_rule(&self, rule: &FirewallRule) -> Result<(), Error> {
        if self.has_marker_rule(rule.chain, &rule.marker).await? {
            debug!(chain = %rule.chain, marker = %rule.marker, "rule already present");
            return Ok(());
        }
        self.request(Method::Post, &rule.chain.rule_path(), Some(&rule.body()))
            .await?;
        debug!(chain = %rule.chain, target = %rule.target, iface = %rule.interface, "rule added");
        Ok(())
    }

    /// Attach `iface` to the `prefix` zone chains. Every rule is attempted;
    /// the first failure is returned.
    pub async fn add_interface_rules_for_zone(
        &self,
        iface: &str,
        marker: &RuleMarker,
        prefix: &str,
    ) -> Result<(), Error> {
        let mut first_err = None;
        for rule in zone_rules(iface, marker, prefix) {
            if let Err(e) = self.add_rule(&rule).await {
                warn!(chain = %rule.chain, error = %e, "failed to add rule");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Delete every rule carrying `marker` from all three chains.
    pub async fn remove_interface_rules(&self, marker: &RuleMarker) -> Result<(), Error> {
        let mut first_err = None;
        for chain in FilterChain::ALL {
            if let Err(e) = self.remove_marker_rules(chain, marker).await {
                warn!(%chain, error = %e, "failed to remove rules");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn remove_marker_rules(
        &self,
        chain: FilterChain,
        marker: &RuleMarker,
    ) -> Result<(), Error> {
        for rule in self.list_rules(chain).await? {
            if marker.tags(&rule.description) {
                self.request(Method::Delete, &chain.rule_path(), Some(&json!({ "id": rule.id })))
                    .await?;
                debug!(%chain, id = rule.id, "rule removed");
            }
        }
        Ok(())
    }
}
