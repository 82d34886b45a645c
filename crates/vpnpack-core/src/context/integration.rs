// Credential lifecycle and integration-state validation.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, info, warn};
use vpnpack_api::IntegrationClient;

use super::{VpnPack, build_integration_client};
use crate::error::CoreError;
use crate::firewall::zones;
use crate::markers::{TAILSCALE_DEFAULT_PORT, WanPortMarker};

/// Snapshot of the credential and its binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationStatus {
    pub configured: bool,
    pub valid: bool,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The mesh daemon's `PORT="n"` setting, or its default port when the
/// file or the setting is missing or out of range.
pub fn read_tailscaled_port(path: &Path) -> u16 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|contents| {
            contents.lines().find_map(|line| {
                line.strip_prefix("PORT=\"")
                    .and_then(|rest| rest.split_once('"'))
                    .and_then(|(digits, _)| digits.parse::<u16>().ok())
            })
        })
        .filter(|port| *port != 0)
        .unwrap_or(TAILSCALE_DEFAULT_PORT)
}

impl VpnPack {
    /// Validate and persist a new API key, bind the site, leave degraded
    /// mode, and apply the mesh firewall. An invalid key changes nothing.
    pub async fn set_api_key(&self, key: &SecretString) -> Result<IntegrationStatus, CoreError> {
        let trimmed = key.expose_secret().trim();
        if trimmed.is_empty() {
            return Err(CoreError::validation("API key is required"));
        }
        let key = SecretString::from(trimmed.to_owned());

        let client = Arc::new(build_integration_client(&self.inner.config.integration, &key)?);
        let info = client.get_info().await?;

        self.inner.api_key.save(&key)?;
        self.inner.integration.store(Some(Arc::clone(&client)));

        let site_id = match zones::discover_site_id(&client).await {
            Ok(site) => {
                self.bind_site(&site);
                Some(site)
            }
            Err(e) => {
                warn!(error = %e, "site discovery failed");
                None
            }
        };
        self.with_retry(crate::retry::RetryMachine::reset);
        info!(
            app_version = %info.application_version,
            site_id = site_id.as_deref().unwrap_or_default(),
            "integration API key configured"
        );

        if site_id.is_some() {
            if let Err(e) = self.inner.firewall.setup_tailscale_firewall().await
                && !self.handle_rejection(&e)
            {
                warn!(error = %e, "firewall setup after key save failed");
            }
            self.open_tailscale_port().await;
        }

        Ok(IntegrationStatus {
            configured: true,
            valid: true,
            degraded: false,
            site_id,
            app_version: Some(info.application_version),
            error: None,
        })
    }

    /// Forget the credential. Remote objects and manifest entries stay.
    pub fn clear_api_key(&self) -> Result<(), CoreError> {
        self.inner.api_key.delete()?;
        self.inner.integration.store(None);
        info!("integration API key removed");
        Ok(())
    }

    pub async fn integration_status(&self) -> IntegrationStatus {
        let degraded = self.is_degraded();
        let Some(client) = self.inner.integration.load_full() else {
            return IntegrationStatus {
                degraded,
                ..IntegrationStatus::default()
            };
        };

        let site_id = self.inner.manifest.site_id();
        match client.get_info().await {
            Ok(info) => IntegrationStatus {
                configured: true,
                valid: true,
                degraded,
                site_id,
                app_version: Some(info.application_version),
                error: None,
            },
            Err(e) => IntegrationStatus {
                configured: true,
                valid: false,
                degraded,
                site_id,
                app_version: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Check the credential and the manifest against the live API.
    ///
    /// A rejected key is cleared and the daemon enters degraded mode. A
    /// changed site or a vanished mesh zone resets the manifest's
    /// integration state; policy IDs no longer present are pruned.
    pub async fn validate_integration(&self) {
        let Some(client) = self.inner.integration.load_full() else {
            return;
        };
        *self
            .inner
            .last_validated
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        if let Err(e) = client.get_info().await {
            if e.is_unauthorized() {
                warn!("API key rejected, clearing credential and entering degraded mode");
                self.invalidate_credential();
            } else {
                warn!(error = %e, "integration validation failed");
            }
            return;
        }

        let site_id = match zones::discover_site_id(&client).await {
            Ok(site) => site,
            Err(e) => {
                warn!(error = %e, "site discovery failed");
                return;
            }
        };
        self.bind_site(&site_id);
        self.validate_manifest_zones(&client, &site_id).await;
    }

    /// Run [`validate_integration`](Self::validate_integration) when
    /// `interval` has passed since the last run. Catches a key revoked
    /// while nothing else is calling the API.
    pub async fn revalidate_if_due(&self, interval: Duration) {
        if self.inner.integration.load().is_none() || self.is_degraded() {
            return;
        }
        let due = self
            .inner
            .last_validated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none_or(|at| at.elapsed() >= interval);
        if due {
            debug!("periodic integration validation");
            self.validate_integration().await;
        }
    }

    /// Clear the credential when `err` is the API refusing it. Returns
    /// whether it was.
    pub(crate) fn handle_rejection(&self, err: &CoreError) -> bool {
        if !err.is_unauthorized() {
            return false;
        }
        warn!(error = %err, "API key rejected, clearing credential and entering degraded mode");
        self.invalidate_credential();
        true
    }

    pub(crate) fn invalidate_credential(&self) {
        self.inner.integration.store(None);
        if let Err(e) = self.inner.api_key.delete() {
            warn!(error = %e, "failed to delete API key file");
        }
        self.inner.manifest.reset_integration();
        if let Err(e) = self.inner.manifest.save() {
            warn!(error = %e, "manifest save failed");
        }
        self.with_retry(crate::retry::RetryMachine::degrade);
    }

    fn bind_site(&self, site_id: &str) {
        let manifest = &self.inner.manifest;
        match manifest.site_id() {
            Some(current) if current == site_id => return,
            Some(current) => {
                warn!(old = %current, new = %site_id, "site ID changed, resetting manifest");
                manifest.reset_integration();
            }
            None => info!(%site_id, "discovered site ID"),
        }
        manifest.set_site_id(site_id);
        if let Err(e) = manifest.save() {
            warn!(error = %e, "manifest save failed");
        }
    }

    async fn validate_manifest_zones(&self, client: &IntegrationClient, site_id: &str) {
        let manifest = &self.inner.manifest;
        let tailscale = manifest.tailscale_zone();
        if !tailscale.has_zone() {
            return;
        }

        let live_zones: HashSet<String> = match client.list_firewall_zones(site_id).await {
            Ok(zones) => zones.into_iter().map(|z| z.id).collect(),
            Err(e) => {
                warn!(error = %e, "zone validation failed");
                return;
            }
        };
        if !live_zones.contains(&tailscale.zone_id) {
            warn!(stale_zone_id = %tailscale.zone_id, "manifest zone not found in API, resetting");
            manifest.reset_integration();
            if let Err(e) = manifest.save() {
                warn!(error = %e, "manifest save failed");
            }
            return;
        }

        let live_policies: HashSet<String> = match client.list_firewall_policies(site_id).await {
            Ok(policies) => policies.into_iter().map(|p| p.id).collect(),
            Err(e) => {
                warn!(error = %e, "policy validation failed");
                return;
            }
        };
        if manifest.prune_policy_ids(&live_policies) {
            warn!("stale policy IDs in manifest, cleared");
            if let Err(e) = manifest.save() {
                warn!(error = %e, "manifest save failed");
            }
        }
    }

    pub(crate) async fn open_tailscale_port(&self) {
        let port = read_tailscaled_port(&self.inner.config.paths.tailscaled_defaults);
        if let Err(e) = self
            .inner
            .firewall
            .open_wan_port(port, &WanPortMarker::TailscaleWg)
            .await
            && !self.handle_rejection(&e)
        {
            warn!(port, error = %e, "tailscale WAN port open failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn tailscaled_port_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tailscaled.defaults");

        assert_eq!(read_tailscaled_port(&path), TAILSCALE_DEFAULT_PORT);

        std::fs::write(&path, "FLAGS=\"\"\nPORT=\"51000\"\n").unwrap();
        assert_eq!(read_tailscaled_port(&path), 51000);

        std::fs::write(&path, "PORT=\"70000\"\n").unwrap();
        assert_eq!(read_tailscaled_port(&path), TAILSCALE_DEFAULT_PORT);

        std::fs::write(&path, "PORT=\"0\"\n").unwrap();
        assert_eq!(read_tailscaled_port(&path), TAILSCALE_DEFAULT_PORT);
    }
}
