#![allow(clippy::unwrap_used)]
// Tunnel lifecycle against in-memory netlink and WireGuard backends.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::{Fakes, net};
use vpnpack_core::tunnel::generate_keypair;
use vpnpack_core::{CoreError, NewTunnel, TunnelManager, TunnelUpdate};

fn manager(dir: &std::path::Path, fakes: &Fakes) -> TunnelManager {
    TunnelManager::new(
        dir,
        fakes.netlink.clone(),
        fakes.wireguard.clone(),
        fakes.probe.clone(),
    )
    .unwrap()
}

fn request(name: &str, port: u16, allowed: &[&str]) -> NewTunnel {
    NewTunnel {
        name: name.into(),
        listen_port: port,
        tunnel_address: Some(net("10.255.0.1/30")),
        peer_public_key: generate_keypair().public_key,
        peer_endpoint: Some("127.0.0.1:51820".into()),
        allowed_ips: allowed.iter().map(|c| net(c)).collect(),
        ..NewTunnel::default()
    }
}

fn key_files(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|x| x == "key"))
        .count()
}

#[tokio::test]
async fn create_brings_up_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let tunnels = manager(dir.path(), &fakes);

    let first = tunnels
        .create(request("branch", 51820, &["10.1.0.0/24"]), None)
        .await
        .unwrap();
    let second = tunnels
        .create(request("lab", 51821, &["10.2.0.0/24"]), None)
        .await
        .unwrap();

    assert_eq!(first.interface_name, "wg-s2s0");
    assert_eq!(second.interface_name, "wg-s2s1");
    assert!(first.enabled);
    assert_eq!(first.persistent_keepalive, 25);
    assert_eq!(first.mtu, 1420);
    assert_eq!(fakes.netlink.routes("wg-s2s0"), vec![net("10.1.0.0/24")]);

    let device = fakes.wireguard.device("wg-s2s0").unwrap();
    assert_eq!(device.listen_port, 51820);
    assert_eq!(
        device.private_key.get_public().to_base64(),
        tunnels.public_key(&first.id).unwrap()
    );

    let reloaded = manager(dir.path(), &Fakes::new());
    let ids: Vec<_> = reloaded.tunnels().await.into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
}

#[tokio::test]
async fn create_imports_supplied_private_key() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let tunnels = manager(dir.path(), &fakes);
    let keypair = generate_keypair();

    let tunnel = tunnels
        .create(
            request("branch", 51820, &[]),
            Some(secrecy::ExposeSecret::expose_secret(&keypair.private_key)),
        )
        .await
        .unwrap();

    assert_eq!(tunnels.public_key(&tunnel.id).unwrap(), keypair.public_key);
}

#[tokio::test]
async fn create_validates_before_touching_the_kernel() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let tunnels = manager(dir.path(), &fakes);

    let mut missing_address = request("branch", 51820, &[]);
    missing_address.tunnel_address = None;
    let err = tunnels.create(missing_address, None).await.unwrap_err();
    assert!(matches!(err, CoreError::ValidationFailed { .. }));

    let mut bad_key = request("branch", 51820, &[]);
    bad_key.peer_public_key = "not-a-key".into();
    let err = tunnels.create(bad_key, None).await.unwrap_err();
    assert!(matches!(err, CoreError::ValidationFailed { .. }));

    let mut no_key = request("branch", 51820, &[]);
    no_key.peer_public_key = "   ".into();
    let err = tunnels.create(no_key, None).await.unwrap_err();
    assert!(matches!(err, CoreError::ValidationFailed { .. }));

    let err = tunnels
        .create(request("  ", 51820, &[]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ValidationFailed { .. }));

    assert_eq!(fakes.netlink.created(), 0);
    assert_eq!(key_files(dir.path()), 0);
}

#[tokio::test]
async fn port_conflicts_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let tunnels = manager(dir.path(), &fakes);

    tunnels
        .create(request("branch", 51820, &[]), None)
        .await
        .unwrap();
    let err = tunnels
        .create(request("lab", 51820, &[]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::PortUnavailable { port: 51820, .. }));

    fakes.probe.occupy(51830);
    let err = tunnels
        .create(request("lab", 51830, &[]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::PortUnavailable { port: 51830, .. }));

    assert_eq!(fakes.netlink.created(), 1);
    assert_eq!(tunnels.tunnels().await.len(), 1);
}

#[tokio::test]
async fn failed_bring_up_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let tunnels = manager(dir.path(), &fakes);
    fakes.netlink.fail_route(net("10.9.0.0/24"));

    let err = tunnels
        .create(request("branch", 51820, &["10.1.0.0/24", "10.9.0.0/24"]), None)
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Network { .. }));
    assert!(!fakes.netlink.has_link("wg-s2s0"));
    assert!(tunnels.tunnels().await.is_empty());
    assert_eq!(key_files(dir.path()), 0);
}

#[tokio::test]
async fn allowed_ip_change_is_applied_hot() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let tunnels = manager(dir.path(), &fakes);
    let tunnel = tunnels
        .create(request("branch", 51820, &["10.1.0.0/24", "10.2.0.0/24"]), None)
        .await
        .unwrap();

    let updated = tunnels
        .update(
            &tunnel.id,
            TunnelUpdate {
                allowed_ips: Some(vec![net("10.2.0.0/24"), net("10.3.0.0/24")]),
                ..TunnelUpdate::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(fakes.netlink.created(), 1);
    assert_eq!(fakes.wireguard.peer_updates(), 1);
    assert_eq!(
        fakes.netlink.routes("wg-s2s0"),
        vec![net("10.2.0.0/24"), net("10.3.0.0/24")]
    );
    assert_eq!(updated.allowed_ips, vec![net("10.2.0.0/24"), net("10.3.0.0/24")]);
}

#[tokio::test]
async fn endpoint_change_is_applied_hot() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let tunnels = manager(dir.path(), &fakes);
    let tunnel = tunnels
        .create(request("branch", 51820, &["10.1.0.0/24"]), None)
        .await
        .unwrap();
    let updates_before = fakes.wireguard.peer_updates();

    let updated = tunnels
        .update(
            &tunnel.id,
            TunnelUpdate {
                peer_endpoint: Some("203.0.113.5:51820".into()),
                ..TunnelUpdate::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(fakes.netlink.created(), 1);
    assert!(fakes.netlink.has_link("wg-s2s0"));
    assert_eq!(fakes.netlink.routes("wg-s2s0"), vec![net("10.1.0.0/24")]);
    assert_eq!(fakes.wireguard.peer_updates(), updates_before + 1);
    let (iface, peer) = fakes.wireguard.peer_updates.lock().unwrap().last().cloned().unwrap();
    assert_eq!(iface, "wg-s2s0");
    assert_eq!(peer.endpoint, Some("203.0.113.5:51820".parse().unwrap()));
    assert_eq!(updated.peer_endpoint.as_deref(), Some("203.0.113.5:51820"));
    assert!(updated.enabled);
}

#[tokio::test]
async fn port_change_recreates_the_interface() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let tunnels = manager(dir.path(), &fakes);
    let tunnel = tunnels
        .create(request("branch", 51820, &["10.1.0.0/24"]), None)
        .await
        .unwrap();

    tunnels
        .update(
            &tunnel.id,
            TunnelUpdate {
                listen_port: Some(51999),
                name: Some("  ".into()),
                ..TunnelUpdate::default()
            },
        )
        .await
        .unwrap();

    let stored = tunnels.get(&tunnel.id).await.unwrap();
    assert_eq!(fakes.netlink.created(), 2);
    assert_eq!(stored.listen_port, 51999);
    assert_eq!(stored.name, "branch");
    assert_eq!(fakes.wireguard.device("wg-s2s0").unwrap().listen_port, 51999);
}

#[tokio::test]
async fn failed_recreate_persists_the_tunnel_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let tunnels = manager(dir.path(), &fakes);
    let tunnel = tunnels
        .create(request("branch", 51820, &["10.1.0.0/24"]), None)
        .await
        .unwrap();

    fakes.wireguard.fail_configure(true);
    let result = tunnels
        .update(
            &tunnel.id,
            TunnelUpdate {
                mtu: Some(1380),
                ..TunnelUpdate::default()
            },
        )
        .await;

    assert!(result.is_err());
    assert!(!fakes.netlink.has_link("wg-s2s0"));
    let stored = tunnels.get(&tunnel.id).await.unwrap();
    assert!(!stored.enabled);
    assert_eq!(stored.mtu, 1380);

    let reloaded = manager(dir.path(), &Fakes::new());
    assert!(!reloaded.get(&tunnel.id).await.unwrap().enabled);
}

#[tokio::test]
async fn disable_enable_delete() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let tunnels = manager(dir.path(), &fakes);
    let tunnel = tunnels
        .create(request("branch", 51820, &["10.1.0.0/24"]), None)
        .await
        .unwrap();

    let disabled = tunnels.disable(&tunnel.id).await.unwrap();
    assert!(!disabled.enabled);
    assert!(!fakes.netlink.has_link("wg-s2s0"));
    assert!(tunnels.public_key(&tunnel.id).is_ok());

    // Disabled tunnels still hold their port.
    let err = tunnels
        .create(request("lab", 51820, &[]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::PortUnavailable { .. }));

    let enabled = tunnels.enable(&tunnel.id).await.unwrap();
    assert!(enabled.enabled);
    assert_eq!(fakes.netlink.routes("wg-s2s0"), vec![net("10.1.0.0/24")]);

    tunnels.delete(&tunnel.id).await.unwrap();
    assert!(!fakes.netlink.has_link("wg-s2s0"));
    assert!(tunnels.public_key(&tunnel.id).is_err());
    assert!(tunnels.tunnels().await.is_empty());

    let err = tunnels.delete(&tunnel.id).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn restore_brings_up_enabled_tunnels_only() {
    let dir = tempfile::tempdir().unwrap();
    {
        let fakes = Fakes::new();
        let tunnels = manager(dir.path(), &fakes);
        tunnels
            .create(request("branch", 51820, &["10.1.0.0/24"]), None)
            .await
            .unwrap();
        let lab = tunnels
            .create(request("lab", 51821, &["10.2.0.0/24"]), None)
            .await
            .unwrap();
        tunnels.disable(&lab.id).await.unwrap();
    }

    let fakes = Fakes::new();
    let tunnels = manager(dir.path(), &fakes);
    tunnels.restore_all().await.unwrap();

    assert!(fakes.netlink.has_link("wg-s2s0"));
    assert!(!fakes.netlink.has_link("wg-s2s1"));
    assert_eq!(fakes.netlink.routes("wg-s2s0"), vec![net("10.1.0.0/24")]);
}

#[tokio::test]
async fn concurrent_creates_get_distinct_interfaces() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let tunnels = Arc::new(manager(dir.path(), &fakes));

    let handles: Vec<_> = (0..4u16)
        .map(|i| {
            let tunnels = Arc::clone(&tunnels);
            tokio::spawn(async move {
                tunnels
                    .create(request(&format!("t{i}"), 52000 + i, &[]), None)
                    .await
                    .unwrap()
            })
        })
        .collect();
    let mut names = Vec::new();
    for handle in handles {
        names.push(handle.await.unwrap().interface_name);
    }
    names.sort();

    assert_eq!(names, vec!["wg-s2s0", "wg-s2s1", "wg-s2s2", "wg-s2s3"]);
}
