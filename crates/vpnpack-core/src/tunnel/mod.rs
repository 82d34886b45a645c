//! WireGuard site-to-site tunnel lifecycle.
//!
//! [`TunnelManager`] owns the configured tunnels and drives the netlink and
//! WireGuard primitives through each tunnel's transitions:
//! Absent → Enabled ⇄ Disabled → Absent. All mutations are serialized by
//! one async lock; reads take it briefly and hand back copies.

mod config;
mod keys;
mod status;
mod template;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::Utc;
use ipnet::IpNet;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use wireguard_control::Key;

pub use config::{
    DEFAULT_KEEPALIVE, DEFAULT_MTU, INTERFACE_PREFIX, NewTunnel, TunnelConfig, TunnelStore,
    TunnelUpdate, next_interface_name, validate_public_key,
};
pub use keys::{KeyStore, Keypair, generate_keypair};
pub use status::{CONNECTED_WINDOW, WgS2sStatus, is_connected};
pub use template::render_peer_config;

use crate::error::CoreError;
use crate::saga::Saga;
use crate::system::{DeviceSpec, HostProbe, Netlink, PeerSpec, WireGuard};

pub struct TunnelManager {
    tunnels: Mutex<Vec<TunnelConfig>>,
    store: TunnelStore,
    keys: KeyStore,
    netlink: Arc<dyn Netlink>,
    wireguard: Arc<dyn WireGuard>,
    probe: Arc<dyn HostProbe>,
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("dir", &self.store.dir())
            .finish_non_exhaustive()
    }
}

fn not_found(id: &str) -> CoreError {
    CoreError::not_found("tunnel", id)
}

async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr, CoreError> {
    tokio::net::lookup_host(endpoint)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| CoreError::validation(format!("cannot resolve peer endpoint {endpoint}")))
}

impl TunnelManager {
    /// Open the tunnel store under `dir` (created 0700) and load it.
    pub fn new(
        dir: impl Into<std::path::PathBuf>,
        netlink: Arc<dyn Netlink>,
        wireguard: Arc<dyn WireGuard>,
        probe: Arc<dyn HostProbe>,
    ) -> Result<Self, CoreError> {
        let store = TunnelStore::open(dir)?;
        let tunnels = store.load()?;
        Ok(Self {
            keys: KeyStore::new(store.dir()),
            tunnels: Mutex::new(tunnels),
            store,
            netlink,
            wireguard,
            probe,
        })
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub async fn tunnels(&self) -> Vec<TunnelConfig> {
        self.tunnels.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<TunnelConfig> {
        self.tunnels.lock().await.iter().find(|t| t.id == id).cloned()
    }

    pub fn public_key(&self, id: &str) -> Result<String, CoreError> {
        self.keys.public_key(id)
    }

    /// Config joined with live device counters.
    pub async fn statuses(&self) -> Vec<WgS2sStatus> {
        let tunnels = self.tunnels().await;
        let now = SystemTime::now();
        let mut out = Vec::with_capacity(tunnels.len());
        for tunnel in &tunnels {
            let status = WgS2sStatus::from_config(tunnel);
            if !tunnel.enabled {
                out.push(status);
                continue;
            }
            match self.wireguard.stats(&tunnel.interface_name).await {
                Ok(stats) => out.push(status.with_stats(&stats, now)),
                Err(e) => {
                    debug!(iface = %tunnel.interface_name, error = %e, "device query failed");
                    out.push(status);
                }
            }
        }
        out
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Validate, allocate, key, bring up, and only then persist a new tunnel.
    pub async fn create(
        &self,
        request: NewTunnel,
        private_key: Option<&str>,
    ) -> Result<TunnelConfig, CoreError> {
        let mut tunnels = self.tunnels.lock().await;

        let name = request.name.trim();
        if name.is_empty() {
            return Err(CoreError::validation("tunnel name is required"));
        }
        if request.listen_port == 0 {
            return Err(CoreError::validation("listen port is required"));
        }
        let Some(tunnel_address) = request.tunnel_address else {
            return Err(CoreError::validation("tunnel address is required"));
        };
        let peer_public_key = request.peer_public_key.trim().to_owned();
        if peer_public_key.is_empty() {
            return Err(CoreError::validation("peer public key is required"));
        }
        validate_public_key(&peer_public_key)?;
        self.check_port(request.listen_port, &tunnels, None).await?;

        let config = TunnelConfig {
            id: config::generate_id(tunnels.iter().map(|t| t.id.as_str())),
            name: name.to_owned(),
            interface_name: next_interface_name(tunnels.iter().map(|t| t.interface_name.as_str())),
            listen_port: request.listen_port,
            tunnel_address,
            peer_public_key,
            peer_endpoint: request
                .peer_endpoint
                .map(|e| e.trim().to_owned())
                .filter(|e| !e.is_empty()),
            allowed_ips: request.allowed_ips,
            persistent_keepalive: if request.persistent_keepalive == 0 {
                DEFAULT_KEEPALIVE
            } else {
                request.persistent_keepalive
            },
            mtu: if request.mtu == 0 { DEFAULT_MTU } else { request.mtu },
            enabled: true,
            created_at: Utc::now(),
        };

        let mut saga = Saga::new(format!("create tunnel {}", config.name));
        let key = match private_key.map(str::trim).filter(|k| !k.is_empty()) {
            Some(raw) => self.keys.import(&config.id, raw)?,
            None => self.keys.generate(&config.id)?,
        };
        let keys = self.keys.clone();
        let id = config.id.clone();
        saga.compensate("delete key files", move || {
            Box::pin(async move { keys.delete(&id) })
        });

        saga.step(self.bring_up(&config, key)).await?;

        tunnels.push(config.clone());
        if let Err(e) = self.store.save(&tunnels) {
            tunnels.pop();
            self.tear_down(&config).await;
            saga.unwind().await;
            return Err(e);
        }
        saga.commit();

        info!(id = %config.id, name = %config.name, iface = %config.interface_name, "tunnel created");
        Ok(config)
    }

    /// Merge non-empty fields and apply them, hot when possible.
    pub async fn update(&self, id: &str, update: TunnelUpdate) -> Result<TunnelConfig, CoreError> {
        let mut tunnels = self.tunnels.lock().await;
        let idx = tunnels
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| not_found(id))?;
        let current = tunnels[idx].clone();
        let mut merged = update.merge_onto(&current);

        if merged.peer_public_key != current.peer_public_key {
            validate_public_key(&merged.peer_public_key)?;
        }

        if current.enabled {
            if let Some(endpoint) = &merged.peer_endpoint
                && merged.peer_endpoint != current.peer_endpoint
            {
                resolve_endpoint(endpoint).await?;
            }
            if merged.listen_port != current.listen_port {
                self.check_port(merged.listen_port, &tunnels, Some(id)).await?;
            }
        }

        if current.enabled {
            if current.needs_recreate(&merged) {
                // Confirm the key is readable before tearing anything down.
                self.keys.private_key(id)?;
                self.tear_down(&current).await;
                if let Err(e) = self.recreate(&merged).await {
                    return Err(self.persist_disabled(&mut tunnels, idx, merged, e));
                }
            } else if let Err(e) = self.hot_update(&merged, &current.allowed_ips).await {
                warn!(id, error = %e, "hot update failed, falling back to recreate");
                let mut stale = merged.clone();
                stale.allowed_ips = union(&current.allowed_ips, &merged.allowed_ips);
                self.tear_down(&stale).await;
                if let Err(e) = self.recreate(&merged).await {
                    return Err(self.persist_disabled(&mut tunnels, idx, merged, e));
                }
            }
        }

        merged.enabled = current.enabled;
        tunnels[idx] = merged.clone();
        self.store.save(&tunnels)?;
        info!(id, name = %merged.name, "tunnel updated");
        Ok(merged)
    }

    /// Bring up a disabled tunnel from its stored key. No-op when enabled.
    pub async fn enable(&self, id: &str) -> Result<TunnelConfig, CoreError> {
        let mut tunnels = self.tunnels.lock().await;
        let idx = tunnels
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| not_found(id))?;
        if tunnels[idx].enabled {
            return Ok(tunnels[idx].clone());
        }
        let config = tunnels[idx].clone();
        self.check_port(config.listen_port, &tunnels, Some(id)).await?;
        let key = self.keys.private_key(id)?;
        self.bring_up(&config, key).await?;

        tunnels[idx].enabled = true;
        self.store.save(&tunnels)?;
        info!(id, iface = %config.interface_name, "tunnel enabled");
        Ok(tunnels[idx].clone())
    }

    /// Tear down and mark disabled. Config and keys are retained.
    pub async fn disable(&self, id: &str) -> Result<TunnelConfig, CoreError> {
        let mut tunnels = self.tunnels.lock().await;
        let idx = tunnels
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| not_found(id))?;
        if !tunnels[idx].enabled {
            return Ok(tunnels[idx].clone());
        }
        self.tear_down(&tunnels[idx]).await;
        tunnels[idx].enabled = false;
        self.store.save(&tunnels)?;
        info!(id, iface = %tunnels[idx].interface_name, "tunnel disabled");
        Ok(tunnels[idx].clone())
    }

    /// Tear down if enabled, erase keys, and drop the record.
    pub async fn delete(&self, id: &str) -> Result<TunnelConfig, CoreError> {
        let mut tunnels = self.tunnels.lock().await;
        let idx = tunnels
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| not_found(id))?;
        let removed = tunnels[idx].clone();
        if removed.enabled {
            self.tear_down(&removed).await;
        }
        if let Err(e) = self.keys.delete(id) {
            warn!(id, error = %e, "key file removal failed");
        }
        tunnels.remove(idx);
        self.store.save(&tunnels)?;
        info!(id, name = %removed.name, "tunnel deleted");
        Ok(removed)
    }

    /// Bring up every enabled tunnel. Keeps going past failures and
    /// returns the last one.
    pub async fn restore_all(&self) -> Result<(), CoreError> {
        let tunnels = self.tunnels.lock().await;
        let mut last_err = None;
        for tunnel in tunnels.iter().filter(|t| t.enabled) {
            let result = match self.keys.private_key(&tunnel.id) {
                Ok(key) => self.bring_up(tunnel, key).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => info!(id = %tunnel.id, iface = %tunnel.interface_name, "tunnel restored"),
                Err(e) => {
                    warn!(id = %tunnel.id, error = %e, "failed to restore tunnel");
                    last_err = Some(e);
                }
            }
        }
        last_err.map_or(Ok(()), Err)
    }

    // ── Internals ────────────────────────────────────────────────────

    async fn check_port(
        &self,
        port: u16,
        tunnels: &[TunnelConfig],
        except: Option<&str>,
    ) -> Result<(), CoreError> {
        if let Some(other) = tunnels
            .iter()
            .find(|t| t.listen_port == port && Some(t.id.as_str()) != except)
        {
            return Err(CoreError::PortUnavailable {
                port,
                reason: format!("already used by tunnel {}", other.name),
            });
        }
        self.probe
            .udp_port_free(port)
            .await
            .map_err(|e| CoreError::PortUnavailable {
                port,
                reason: e.to_string(),
            })
    }

    async fn peer_spec(&self, tunnel: &TunnelConfig) -> Result<Option<PeerSpec>, CoreError> {
        if tunnel.peer_public_key.is_empty() {
            return Ok(None);
        }
        let endpoint = match &tunnel.peer_endpoint {
            Some(e) => Some(resolve_endpoint(e).await?),
            None => None,
        };
        Ok(Some(PeerSpec {
            public_key: tunnel.peer_public_key.clone(),
            endpoint,
            allowed_ips: tunnel.allowed_ips.clone(),
            keepalive: tunnel.persistent_keepalive,
        }))
    }

    /// Create and fully configure the interface. Anything created is undone
    /// if a later step fails.
    async fn bring_up(&self, tunnel: &TunnelConfig, key: Key) -> Result<(), CoreError> {
        self.remove_leftover(tunnel).await?;
        let peer = self.peer_spec(tunnel).await?;
        let name = tunnel.interface_name.as_str();

        let mut saga = Saga::new(format!("bring up {name}"));
        let index = self.netlink.create_wireguard(name).await?;
        let netlink = Arc::clone(&self.netlink);
        saga.compensate("delete interface", move || {
            Box::pin(async move { netlink.delete_link(index).await })
        });

        if tunnel.mtu != 0 {
            saga.step(self.netlink.set_mtu(index, tunnel.mtu)).await?;
        }
        let device = DeviceSpec {
            private_key: key,
            listen_port: tunnel.listen_port,
            peer,
        };
        saga.step(self.wireguard.configure(name, &device)).await?;

        let address = tunnel.tunnel_address;
        saga.step(self.netlink.add_address(index, address)).await?;
        let netlink = Arc::clone(&self.netlink);
        saga.compensate("delete address", move || {
            Box::pin(async move { netlink.delete_address(index, address).await })
        });

        saga.step(self.netlink.set_up(index)).await?;

        for dst in &tunnel.allowed_ips {
            let dst = *dst;
            saga.step(self.netlink.add_route(index, dst)).await?;
            let netlink = Arc::clone(&self.netlink);
            saga.compensate("delete route", move || {
                Box::pin(async move { netlink.delete_route(index, dst).await })
            });
        }

        saga.commit();
        debug!(iface = name, index, "interface up");
        Ok(())
    }

    async fn recreate(&self, tunnel: &TunnelConfig) -> Result<(), CoreError> {
        let key = self.keys.private_key(&tunnel.id)?;
        self.bring_up(tunnel, key).await
    }

    /// Reconfigure the live peer and reconcile only the routes that changed.
    async fn hot_update(&self, tunnel: &TunnelConfig, old_ips: &[IpNet]) -> Result<(), CoreError> {
        let name = tunnel.interface_name.as_str();
        if let Some(peer) = self.peer_spec(tunnel).await? {
            self.wireguard.update_peer(name, &peer).await?;
        }
        let index = self
            .netlink
            .link_index(name)
            .await?
            .ok_or_else(|| CoreError::network("hot update", format!("interface {name} not found")))?;

        let old: HashSet<&IpNet> = old_ips.iter().collect();
        let new: HashSet<&IpNet> = tunnel.allowed_ips.iter().collect();
        for dst in old.difference(&new) {
            if let Err(e) = self.netlink.delete_route(index, **dst).await {
                warn!(iface = name, cidr = %dst, error = %e, "hot update: route removal failed");
            }
        }
        for dst in tunnel.allowed_ips.iter().filter(|d| !old.contains(d)) {
            self.netlink.add_route(index, *dst).await?;
        }
        info!(id = %tunnel.id, iface = name, "tunnel hot-updated");
        Ok(())
    }

    /// Delete a stale interface of the same name, reconnecting the netlink
    /// session once if the first delete fails.
    async fn remove_leftover(&self, tunnel: &TunnelConfig) -> Result<(), CoreError> {
        let name = tunnel.interface_name.as_str();
        let Some(index) = self.netlink.link_index(name).await? else {
            return Ok(());
        };
        self.delete_routes(index, tunnel).await;
        if let Err(e) = self.netlink.delete_link(index).await {
            warn!(iface = name, error = %e, "deleting leftover interface failed, reconnecting netlink");
            self.netlink.reconnect().await?;
            if let Some(index) = self.netlink.link_index(name).await? {
                self.netlink.delete_link(index).await?;
            }
        }
        Ok(())
    }

    async fn delete_routes(&self, index: u32, tunnel: &TunnelConfig) {
        for dst in &tunnel.allowed_ips {
            if let Err(e) = self.netlink.delete_route(index, *dst).await {
                warn!(iface = %tunnel.interface_name, cidr = %dst, error = %e, "route removal failed");
            }
        }
    }

    /// Best-effort removal of routes and the interface.
    async fn tear_down(&self, tunnel: &TunnelConfig) {
        let name = tunnel.interface_name.as_str();
        let index = match self.netlink.link_index(name).await {
            Ok(Some(index)) => index,
            Ok(None) => return,
            Err(e) => {
                warn!(iface = name, error = %e, "tear down: interface lookup failed");
                return;
            }
        };
        self.delete_routes(index, tunnel).await;
        if let Err(e) = self.netlink.delete_link(index).await {
            warn!(iface = name, error = %e, "tear down: interface removal failed");
        }
    }

    fn persist_disabled(
        &self,
        tunnels: &mut [TunnelConfig],
        idx: usize,
        mut merged: TunnelConfig,
        cause: CoreError,
    ) -> CoreError {
        merged.enabled = false;
        tunnels[idx] = merged;
        if let Err(e) = self.store.save(tunnels) {
            warn!(id = %tunnels[idx].id, error = %e, "failed to persist disabled tunnel");
        }
        warn!(id = %tunnels[idx].id, error = %cause, "bring-up after update failed, tunnel disabled");
        cause
    }
}

fn union(a: &[IpNet], b: &[IpNet]) -> Vec<IpNet> {
    let mut out = a.to_vec();
    out.extend(b.iter().filter(|n| !a.contains(n)));
    out
}
