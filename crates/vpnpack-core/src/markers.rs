// ── Typed identifiers that become strings only on the wire ──

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

pub use vpnpack_api::udapi::RuleMarker;

/// The mesh daemon's interface.
pub const TAILSCALE_IFACE: &str = "tailscale0";
/// Address range the mesh daemon hands out.
pub const TAILSCALE_CGNAT: &str = "100.64.0.0/10";
pub const TAILSCALE_DEFAULT_PORT: u16 = 41641;

pub const CHAIN_FORWARD_IN_USER: &str = "UBIOS_FORWARD_IN_USER";
pub const CHAIN_INPUT_USER_HOOK: &str = "UBIOS_INPUT_USER_HOOK";
pub const CHAIN_OUTPUT_USER_HOOK: &str = "UBIOS_OUTPUT_USER_HOOK";

// ── ChainPrefix ──────────────────────────────────────────────────────

/// Naming stem of the on-box chains and ipsets backing a zone.
///
/// `VPN` is the built-in legacy zone; discovered custom zones are
/// `CUSTOM<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainPrefix(String);

impl ChainPrefix {
    pub const DEFAULT: &'static str = "VPN";

    pub fn default_prefix() -> Self {
        Self(Self::DEFAULT.to_owned())
    }

    /// Prefix for the zone at `index` in the sorted list of custom zones.
    pub fn custom(index: usize) -> Self {
        Self(format!("CUSTOM{}", index + 1))
    }

    pub fn is_default(&self) -> bool {
        self.0 == Self::DEFAULT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Writable ipset managed through udapi.
    pub fn subnet_set(&self) -> String {
        format!("{}_subnets", self.0)
    }

    /// The kernel-side ipset the firewall compiles `subnet_set` into.
    pub fn kernel_subnet_set(&self) -> String {
        format!("UBIOS4{}_subnets", self.0)
    }

    /// User chain that only exists once the zone has been compiled.
    pub fn user_chain(&self) -> String {
        format!("UBIOS_{}_IN_USER", self.0)
    }

    pub fn zone_in_chain(&self) -> String {
        format!("UBIOS_{}_IN", self.0)
    }

    pub fn zone_local_chain(&self) -> String {
        format!("UBIOS_{}_LOCAL", self.0)
    }

    pub fn zone_out_chain(&self) -> String {
        format!("UBIOS_LOCAL_{}", self.0)
    }
}

impl Default for ChainPrefix {
    fn default() -> Self {
        Self::default_prefix()
    }
}

impl From<&str> for ChainPrefix {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            Self::default_prefix()
        } else {
            Self(s.to_owned())
        }
    }
}

impl fmt::Display for ChainPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── WanPortMarker ────────────────────────────────────────────────────

/// Owner of a WAN-port allow policy; keys the manifest's `wanPorts` map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WanPortMarker {
    TailscaleWg,
    RelayServer,
    WgS2s { iface: String },
    Other(String),
}

impl WanPortMarker {
    pub fn wg_s2s(iface: impl Into<String>) -> Self {
        Self::WgS2s {
            iface: iface.into(),
        }
    }

    /// Deterministic policy name for this marker and port.
    pub fn policy_name(&self, port: u16) -> String {
        match self {
            Self::WgS2s { iface } => format!("VPN Pack: WG S2S UDP {port} ({iface})"),
            Self::RelayServer => format!("VPN Pack: Relay Server UDP {port}"),
            Self::TailscaleWg => format!("VPN Pack: Tailscale WireGuard UDP {port}"),
            Self::Other(tag) => format!("VPN Pack: UDP {port} ({tag})"),
        }
    }
}

impl fmt::Display for WanPortMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TailscaleWg => f.write_str("tailscale-wg"),
            Self::RelayServer => f.write_str("relay-server"),
            Self::WgS2s { iface } => write!(f, "wg-s2s:{iface}"),
            Self::Other(tag) => f.write_str(tag),
        }
    }
}

impl FromStr for WanPortMarker {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "tailscale-wg" => Self::TailscaleWg,
            "relay-server" => Self::RelayServer,
            _ => match s.strip_prefix("wg-s2s:") {
                Some(iface) => Self::wg_s2s(iface),
                None => Self::Other(s.to_owned()),
            },
        })
    }
}
