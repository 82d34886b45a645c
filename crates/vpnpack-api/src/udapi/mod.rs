// Client for the gateway's udapi configuration server.
//
// Wire format is `"{len}\n{json}"` in both directions over a Unix socket.
// `firewall` and `ipset` wrap the two entity trees the daemon manages.

pub mod client;
pub mod firewall;
pub mod ipset;

pub use client::{DEFAULT_SOCKET_PATH, Method, Response, UdapiClient};
pub use firewall::{FilterChain, FirewallRule, ListedRule, RuleDirection, RuleMarker, zone_rules};
pub use ipset::{FirewallSet, SetIdentification};
