// ── Reconciliation watcher ──
//
// One loop per process. Triggers: debounced writes to the appliance's
// network config, a fixed poll, SIGHUP, and queued point events. Each
// pass revalidates the credential when due, retries integration setup,
// then restores mesh and tunnel rules.

use std::path::Path;
use std::time::Instant;

use ipnet::IpNet;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::VpnPack;
use crate::error::CoreError;
use crate::markers::TAILSCALE_IFACE;
use crate::retry::RetryMachine;
use crate::system::interface_exists;

/// Point event handled by the watcher outside the poll cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallRequest {
    /// Attach a tunnel interface and its subnets to its zone.
    ApplyWgS2s {
        tunnel_id: String,
        iface: String,
        allowed_ips: Vec<IpNet>,
    },
}

/// Run until `cancel` fires.
pub async fn run(
    pack: VpnPack,
    mut requests: mpsc::Receiver<FirewallRequest>,
    cancel: CancellationToken,
) {
    let settings = pack.config().watcher.clone();
    let net_config = pack.config().paths.udapi_net_config.clone();

    let (fs_tx, mut fs_rx) = mpsc::channel::<()>(1);
    let _fs_watcher = match watch_file(&net_config, fs_tx) {
        Ok(w) => {
            info!(path = %net_config.display(), "watching network config");
            Some(w)
        }
        Err(e) => {
            warn!(error = %e, "filesystem watch unavailable, polling only");
            None
        }
    };

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "SIGHUP handler unavailable");
            None
        }
    };

    let mut ticker = tokio::time::interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let debounce = tokio::time::sleep(settings.debounce);
    tokio::pin!(debounce);
    let mut debounce_armed = false;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,

            Some(()) = fs_rx.recv() => {
                debounce
                    .as_mut()
                    .reset(tokio::time::Instant::now() + settings.debounce);
                debounce_armed = true;
            }

            () = &mut debounce, if debounce_armed => {
                debounce_armed = false;
                debug!("network config changed");
                check_and_restore(&pack).await;
            }

            Some(()) = next_hangup(&mut sighup) => {
                info!("SIGHUP received, forcing reapply");
                if let Err(e) = pack.firewall().setup_tailscale_firewall().await
                    && !pack.handle_rejection(&e)
                {
                    warn!(error = %e, "SIGHUP reapply failed");
                }
            }

            Some(request) = requests.recv() => handle_request(&pack, request).await,

            _ = ticker.tick() => check_and_restore(&pack).await,
        }
    }
    debug!("watcher stopped");
}

async fn next_hangup(sighup: &mut Option<Signal>) -> Option<()> {
    match sighup {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

fn watch_file(path: &Path, tx: mpsc::Sender<()>) -> Result<RecommendedWatcher, CoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| CoreError::validation(format!("{} has no parent", path.display())))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| CoreError::validation(format!("{} has no file name", path.display())))?
        .to_owned();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) if is_relevant(&event, &file_name) => {
                // Full means a pass is already pending.
                let _ = tx.try_send(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "filesystem watch error"),
        }
    })
    .map_err(|e| CoreError::Internal(format!("create watcher: {e}")))?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| CoreError::Internal(format!("watch {}: {e}", dir.display())))?;
    Ok(watcher)
}

fn is_relevant(event: &notify::Event, file_name: &std::ffi::OsStr) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name))
}

async fn handle_request(pack: &VpnPack, request: FirewallRequest) {
    match request {
        FirewallRequest::ApplyWgS2s {
            tunnel_id,
            iface,
            allowed_ips,
        } => {
            if let Err(e) = pack
                .firewall()
                .setup_wg_s2s_firewall(&tunnel_id, &iface, &allowed_ips)
                .await
            {
                warn!(%iface, error = %e, "wg-s2s firewall rules failed");
            }
        }
    }
}

// ── Reconciliation pass ──────────────────────────────────────────────

/// One full pass. Suppressed entirely in degraded mode.
pub async fn check_and_restore(pack: &VpnPack) {
    pack.revalidate_if_due(pack.config().watcher.validate_interval).await;
    retry_integration_setup(pack).await;
    restore_tailscale_rules(pack).await;
    restore_wg_s2s_rules(pack).await;
}

async fn retry_integration_setup(pack: &VpnPack) {
    let firewall = pack.firewall();
    if !firewall.integration_ready() || pack.is_degraded() {
        return;
    }
    if pack.manifest().tailscale_zone().has_zone() {
        pack.with_retry(RetryMachine::succeed);
        return;
    }
    let Some(attempt) = pack.with_retry(|r| r.begin_attempt(Instant::now())) else {
        return;
    };
    info!(attempt, "retrying integration zone/policy setup");

    // A rejected key surfaces here and flips the daemon into degraded mode.
    pack.validate_integration().await;
    if pack.is_degraded() || !firewall.integration_ready() {
        return;
    }

    if let Err(e) = firewall.setup_tailscale_firewall().await {
        if !pack.handle_rejection(&e) {
            warn!(attempt, error = %e, "integration setup retry failed");
        }
        return;
    }
    let zone = pack.manifest().tailscale_zone();
    if !zone.has_zone() {
        return;
    }

    info!(zone_id = %zone.zone_id, attempt, "integration setup succeeded");
    pack.with_retry(RetryMachine::succeed);
    pack.open_tailscale_port().await;
}

async fn restore_tailscale_rules(pack: &VpnPack) {
    let firewall = pack.firewall();
    if !firewall.integration_ready() || pack.is_degraded() {
        return;
    }
    if !interface_exists(&pack.config().paths.sys_class_net, TAILSCALE_IFACE) {
        return;
    }

    let mut present = firewall.check_tailscale_rules_present().await;
    // Without a zone the legacy set is shared and not ours to police.
    if !pack.manifest().tailscale_zone().has_zone() {
        present.ipset = true;
    }
    if present.all() {
        return;
    }

    let missing: Vec<&str> = [
        (present.forward, "FORWARD_IN"),
        (present.input, "INPUT"),
        (present.output, "OUTPUT"),
        (present.ipset, "zone ipset"),
    ]
    .into_iter()
    .filter(|(ok, _)| !ok)
    .map(|(_, name)| name)
    .collect();
    info!(?missing, "firewall rules missing, restoring");

    match firewall.restore_tailscale_rules().await {
        Ok(()) => info!("firewall rules restored"),
        Err(e) if pack.handle_rejection(&e) => {}
        Err(e) => warn!(error = %e, "firewall restore failed"),
    }
}

async fn restore_wg_s2s_rules(pack: &VpnPack) {
    if pack.is_degraded() {
        return;
    }
    let enabled: Vec<_> = pack
        .tunnels()
        .tunnels()
        .await
        .into_iter()
        .filter(|t| t.enabled)
        .collect();
    if enabled.is_empty() {
        return;
    }

    let ifaces: Vec<&str> = enabled.iter().map(|t| t.interface_name.as_str()).collect();
    let present = pack.firewall().check_wg_s2s_rules_present(&ifaces).await;

    for tunnel in &enabled {
        if present.get(&tunnel.interface_name).copied().unwrap_or(false) {
            continue;
        }
        info!(iface = %tunnel.interface_name, "wg-s2s firewall rules missing, restoring");
        if let Err(e) = pack
            .firewall()
            .setup_wg_s2s_firewall(&tunnel.id, &tunnel.interface_name, &tunnel.allowed_ips)
            .await
        {
            warn!(iface = %tunnel.interface_name, error = %e, "wg-s2s firewall restore failed");
        }
    }
}
