// ── Daemon context ──
//
// One explicitly constructed object owns the manifest, the credential,
// the firewall engine, and the tunnel manager. Background tasks get a
// clone; nothing lives in process-wide statics.

mod integration;
mod tunnels;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vpnpack_api::{IntegrationClient, TransportConfig, UdapiClient};

pub use integration::{IntegrationStatus, read_tailscaled_port};
pub use tunnels::{TunnelView, ZoneChoice};
pub(crate) use tunnels::log_removal;

use crate::config::{DaemonConfig, IntegrationSettings};
use crate::credentials::ApiKeyFile;
use crate::error::CoreError;
use crate::firewall::{FirewallEngine, SharedIntegration};
use crate::manifest::Manifest;
use crate::retry::RetryMachine;
use crate::system::{CommandProbe, HostProbe, KernelWireGuard, Netlink, RtNetlink, WireGuard};
use crate::tunnel::{TunnelConfig, TunnelManager};
use crate::watcher::{self, FirewallRequest};

/// The OS-facing implementations the daemon drives.
#[derive(Clone)]
pub struct Backends {
    pub netlink: Arc<dyn Netlink>,
    pub wireguard: Arc<dyn WireGuard>,
    pub probe: Arc<dyn HostProbe>,
}

impl Backends {
    /// Kernel netlink, kernel WireGuard, and host command probes.
    pub fn system(config: &DaemonConfig) -> Result<Self, CoreError> {
        Ok(Self {
            netlink: Arc::new(RtNetlink::new()?),
            wireguard: Arc::new(KernelWireGuard),
            probe: Arc::new(CommandProbe::new(config.mongo_port)),
        })
    }
}

/// Cheaply cloneable handle to the daemon's state.
#[derive(Clone)]
pub struct VpnPack {
    inner: Arc<VpnPackInner>,
}

struct VpnPackInner {
    config: DaemonConfig,
    manifest: Arc<Manifest>,
    api_key: ApiKeyFile,
    integration: SharedIntegration,
    retry: Mutex<RetryMachine>,
    last_validated: Mutex<Option<Instant>>,
    firewall: FirewallEngine,
    tunnels: TunnelManager,
    netlink: Arc<dyn Netlink>,
    request_tx: mpsc::Sender<FirewallRequest>,
    request_rx: Mutex<Option<mpsc::Receiver<FirewallRequest>>>,
    cancel: CancellationToken,
    task_handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl VpnPack {
    /// Load the manifest and tunnel store. Does not touch the network;
    /// call [`start()`](Self::start) for that.
    pub fn new(config: DaemonConfig, backends: Backends) -> Result<Self, CoreError> {
        let manifest = Arc::new(Manifest::load(&config.paths.manifest)?);
        let integration: SharedIntegration = Arc::new(ArcSwapOption::empty());
        let udapi = UdapiClient::new(&config.paths.udapi_socket);

        let firewall = FirewallEngine::new(
            udapi,
            Arc::clone(&integration),
            Arc::clone(&manifest),
            Arc::clone(&backends.probe),
            Arc::clone(&backends.netlink),
        );
        let tunnels = TunnelManager::new(
            &config.paths.wg_s2s_dir,
            Arc::clone(&backends.netlink),
            backends.wireguard,
            backends.probe,
        )?;

        let (request_tx, request_rx) = mpsc::channel(config.watcher.queue_capacity.max(1));
        let retry = RetryMachine::new(config.watcher.backoff.clone());

        Ok(Self {
            inner: Arc::new(VpnPackInner {
                api_key: ApiKeyFile::new(&config.paths.api_key),
                manifest,
                integration,
                retry: Mutex::new(retry),
                last_validated: Mutex::new(None),
                firewall,
                tunnels,
                netlink: backends.netlink,
                request_tx,
                request_rx: Mutex::new(Some(request_rx)),
                cancel: CancellationToken::new(),
                task_handles: tokio::sync::Mutex::new(Vec::new()),
                config,
            }),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.inner.config
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.inner.manifest
    }

    pub fn firewall(&self) -> &FirewallEngine {
        &self.inner.firewall
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.inner.tunnels
    }

    pub fn netlink(&self) -> &Arc<dyn Netlink> {
        &self.inner.netlink
    }

    pub fn api_key_file(&self) -> &ApiKeyFile {
        &self.inner.api_key
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.with_retry(|r| r.is_degraded())
    }

    pub(crate) fn with_retry<R>(&self, f: impl FnOnce(&mut RetryMachine) -> R) -> R {
        f(&mut self
            .inner
            .retry
            .lock()
            .unwrap_or_else(PoisonError::into_inner))
    }

    /// Install a credential without validating it, e.g. one read from the
    /// key file at startup. `None` leaves integration unconfigured.
    pub fn install_api_key(&self, key: Option<&SecretString>) -> Result<(), CoreError> {
        let client = key
            .map(|k| build_integration_client(&self.inner.config.integration, k))
            .transpose()?;
        self.inner.integration.store(client.map(Arc::new));
        Ok(())
    }

    /// Queue a point event for the watcher. A full queue drops the request;
    /// the periodic poll converges on the same result.
    pub fn send_firewall_request(&self, request: FirewallRequest) {
        if let Err(e) = self.inner.request_tx.try_send(request) {
            debug!(error = %e, "firewall request dropped");
        }
    }

    pub(crate) fn queue_apply(&self, tunnel: &TunnelConfig) {
        self.send_firewall_request(FirewallRequest::ApplyWgS2s {
            tunnel_id: tunnel.id.clone(),
            iface: tunnel.interface_name.clone(),
            allowed_ips: tunnel.allowed_ips.clone(),
        });
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Startup sequence: validate the credential, apply the mesh firewall,
    /// restore tunnels and their rules, open WAN ports, then spawn the
    /// watcher.
    pub async fn start(&self) -> Result<(), CoreError> {
        self.validate_integration().await;

        let socket_present = self.inner.firewall.udapi().socket_exists();
        if socket_present {
            if let Err(e) = self.inner.firewall.setup_tailscale_firewall().await
                && !self.handle_rejection(&e)
            {
                warn!(error = %e, "initial firewall apply failed");
            }
        } else {
            warn!(
                socket = %self.inner.firewall.udapi().socket_path().display(),
                "udapi socket missing, firewall management disabled"
            );
        }

        if let Err(e) = self.inner.tunnels.restore_all().await {
            warn!(error = %e, "tunnel restore incomplete");
        }
        for tunnel in self.inner.tunnels.tunnels().await {
            if tunnel.enabled {
                self.queue_apply(&tunnel);
            }
        }

        if self.inner.firewall.integration_ready() && !self.is_degraded() {
            self.open_tailscale_port().await;
            if let Err(e) = self.inner.firewall.reconcile_wan_ports().await
                && !self.handle_rejection(&e)
            {
                warn!(error = %e, "WAN port reconciliation failed");
            }
        }

        if socket_present {
            let rx = self
                .inner
                .request_rx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .ok_or_else(|| CoreError::Internal("daemon already started".into()))?;
            let handle = tokio::spawn(watcher::run(self.clone(), rx, self.inner.cancel.child_token()));
            self.inner.task_handles.lock().await.push(handle);
        }

        info!("vpnpack started");
        Ok(())
    }

    /// Stop background tasks. Interfaces and routes stay in place.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handles: Vec<_> = self.inner.task_handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("vpnpack stopped");
    }
}

pub(crate) fn build_integration_client(
    settings: &IntegrationSettings,
    key: &SecretString,
) -> Result<IntegrationClient, CoreError> {
    let transport = TransportConfig {
        accept_invalid_certs: settings.insecure,
        timeout: settings.timeout,
    };
    Ok(IntegrationClient::from_api_key(&settings.base_url, key, &transport)?
        .with_page_limit(settings.page_limit))
}
