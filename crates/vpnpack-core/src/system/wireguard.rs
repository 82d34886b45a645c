// ── Kernel WireGuard devices ──
//
// wireguard-control talks to the kernel synchronously, so every call runs
// on the blocking pool.

use async_trait::async_trait;
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

use super::{DeviceSpec, DeviceStats, PeerSpec, WireGuard};
use crate::error::CoreError;

#[derive(Debug, Default, Clone, Copy)]
pub struct KernelWireGuard;

fn iface_name(iface: &str) -> Result<InterfaceName, CoreError> {
    iface
        .parse()
        .map_err(|e| CoreError::validation(format!("invalid interface name {iface}: {e}")))
}

fn peer_builder(peer: &PeerSpec) -> Result<PeerConfigBuilder, CoreError> {
    let key = Key::from_base64(&peer.public_key)
        .map_err(|_| CoreError::validation("peer public key is not a valid WireGuard key"))?;
    let mut builder = PeerConfigBuilder::new(&key).replace_allowed_ips();
    if let Some(endpoint) = peer.endpoint {
        builder = builder.set_endpoint(endpoint);
    }
    for net in &peer.allowed_ips {
        builder = builder.add_allowed_ip(net.network(), net.prefix_len());
    }
    if peer.keepalive > 0 {
        builder = builder.set_persistent_keepalive_interval(peer.keepalive);
    }
    Ok(builder)
}

async fn blocking<T, F>(op: &'static str, f: F) -> Result<T, CoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CoreError::Internal(format!("{op} task failed: {e}")))?
}

#[async_trait]
impl WireGuard for KernelWireGuard {
    async fn configure(&self, iface: &str, device: &DeviceSpec) -> Result<(), CoreError> {
        let name = iface_name(iface)?;
        let mut update = DeviceUpdate::new()
            .set_private_key(device.private_key.clone())
            .set_listen_port(device.listen_port)
            .replace_peers();
        if let Some(peer) = &device.peer {
            update = update.add_peer(peer_builder(peer)?);
        }
        let label = iface.to_owned();
        blocking("configure device", move || {
            update
                .apply(&name, Backend::Kernel)
                .map_err(|e| CoreError::network(format!("configure device {label}"), e))
        })
        .await
    }

    async fn update_peer(&self, iface: &str, peer: &PeerSpec) -> Result<(), CoreError> {
        let name = iface_name(iface)?;
        let update = DeviceUpdate::new()
            .replace_peers()
            .add_peer(peer_builder(peer)?);
        let label = iface.to_owned();
        blocking("update peer", move || {
            update
                .apply(&name, Backend::Kernel)
                .map_err(|e| CoreError::network(format!("update peer on {label}"), e))
        })
        .await
    }

    async fn stats(&self, iface: &str) -> Result<DeviceStats, CoreError> {
        let name = iface_name(iface)?;
        let label = iface.to_owned();
        blocking("query device", move || {
            let device = Device::get(&name, Backend::Kernel)
                .map_err(|e| CoreError::network(format!("query device {label}"), e))?;
            let mut stats = DeviceStats {
                listen_port: device.listen_port,
                ..DeviceStats::default()
            };
            if let Some(peer) = device.peers.first() {
                stats.last_handshake = peer.stats.last_handshake_time;
                stats.rx_bytes = peer.stats.rx_bytes;
                stats.tx_bytes = peer.stats.tx_bytes;
                stats.endpoint = peer.config.endpoint;
            }
            Ok(stats)
        })
        .await
    }
}
