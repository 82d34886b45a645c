//! Tunnel lifecycle, firewall reconciliation, and persistent state for the
//! vpnpack gateway daemon.
//!
//! - **[`VpnPack`]**: the daemon context. [`start()`](VpnPack::start)
//!   validates the stored credential, applies the mesh firewall, restores
//!   tunnels, opens WAN ports, and spawns the reconciliation [`watcher`].
//!   [`shutdown()`](VpnPack::shutdown) stops background work without
//!   touching interfaces.
//!
//! - **[`TunnelManager`]**: WireGuard site-to-site tunnels driven through the
//!   [`system::Netlink`] and [`system::WireGuard`] seams. Bring-up failures
//!   roll back through a [`saga::Saga`].
//!
//! - **[`FirewallEngine`]**: on-box rules over the udapi socket plus zones
//!   and policies through the Integration API, tracked in the versioned
//!   [`Manifest`].

pub mod cleanup;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod firewall;
pub mod manifest;
pub mod markers;
pub mod netcfg;
pub mod retry;
pub mod saga;
pub mod subnets;
pub mod system;
pub mod tunnel;
pub mod watcher;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{DaemonConfig, IntegrationSettings, Paths, WatcherSettings};
pub use context::{Backends, IntegrationStatus, TunnelView, VpnPack, ZoneChoice};
pub use credentials::ApiKeyFile;
pub use error::CoreError;
pub use firewall::FirewallEngine;
pub use manifest::{Manifest, ManifestData, WgS2sZoneInfo, ZoneManifest};
pub use retry::{RetryMachine, RetryState};
pub use subnets::{Severity, SubnetConflict, ValidationResult, validate_allowed_ips};
pub use tunnel::{NewTunnel, TunnelConfig, TunnelManager, TunnelUpdate, WgS2sStatus};
pub use watcher::FirewallRequest;
