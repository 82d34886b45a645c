// ── Remote peer config ──

use std::fmt::Write as _;
use std::net::IpAddr;

use super::config::TunnelConfig;
use crate::netcfg::LocalSubnet;

/// Render the `[Interface]`/`[Peer]` block the remote side should use to
/// reach this tunnel. The remote private key and address stay placeholders.
pub fn render_peer_config(
    tunnel: &TunnelConfig,
    public_key: &str,
    wan_ip: Option<&str>,
    local_subnets: &[LocalSubnet],
) -> String {
    let mut allowed: Vec<String> = local_subnets.iter().map(|s| s.cidr.to_string()).collect();
    allowed.push(match tunnel.tunnel_address.addr() {
        IpAddr::V4(ip) => format!("{ip}/32"),
        IpAddr::V6(ip) => format!("{ip}/128"),
    });

    let mut out = String::new();
    out.push_str("[Interface]\n");
    out.push_str("PrivateKey = <PRIVATE_KEY>\n");
    out.push_str("Address = <TUNNEL_ADDRESS>\n");
    let _ = writeln!(out, "ListenPort = {}", tunnel.listen_port);
    out.push_str("\n[Peer]\n");
    let _ = writeln!(out, "PublicKey = {public_key}");
    if let Some(ip) = wan_ip.filter(|ip| !ip.is_empty()) {
        let _ = writeln!(out, "Endpoint = {ip}:{}", tunnel.listen_port);
    }
    let _ = writeln!(out, "AllowedIPs = {}", allowed.join(", "));
    if tunnel.persistent_keepalive > 0 {
        let _ = writeln!(out, "PersistentKeepalive = {}", tunnel.persistent_keepalive);
    }
    out
}
