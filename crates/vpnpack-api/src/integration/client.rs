// Async HTTP client for the Network Integration API.
//
// Base path: /proxy/network/integration/
// Auth: X-API-Key header

use std::future::Future;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::types;
use crate::Error;

pub const DEFAULT_BASE_URL: &str = "https://127.0.0.1/proxy/network/integration";
pub const DEFAULT_PAGE_LIMIT: u32 = 200;

// ── Error response shape from the Integration API ────────────────────

#[derive(serde::Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    code: Option<String>,
}

// ── Client ───────────────────────────────────────────────────────────

/// Async client for the Integration API.
pub struct IntegrationClient {
    http: reqwest::Client,
    base_url: Url,
    page_limit: u32,
}

impl IntegrationClient {
    // ── Constructors ─────────────────────────────────────────────────

    /// Client authenticating with `api_key`.
    pub fn from_api_key(
        base_url: &str,
        api_key: &secrecy::SecretString,
        transport: &crate::TransportConfig,
    ) -> Result<Self, Error> {
        Self::from_reqwest(base_url, transport.api_key_client(api_key)?)
    }

    /// Wrap an existing `reqwest::Client` (caller manages auth headers).
    pub fn from_reqwest(base_url: &str, http: reqwest::Client) -> Result<Self, Error> {
        Ok(Self {
            http,
            base_url: Self::normalize_base_url(base_url)?,
            page_limit: DEFAULT_PAGE_LIMIT,
        })
    }

    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit.max(1);
        self
    }

    fn normalize_base_url(raw: &str) -> Result<Url, Error> {
        let mut url = Url::parse(raw)?;
        let path = url.path().trim_end_matches('/').to_owned();
        url.set_path(&format!("{path}/"));
        Ok(url)
    }

    // ── URL builder ──────────────────────────────────────────────────

    /// Join a relative path (e.g. `"v1/sites"`) onto the base URL.
    fn url(&self, path: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(path)?)
    }

    // ── HTTP verbs ───────────────────────────────────────────────────

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let url = self.url(path)?;
        debug!("GET {url}");

        let resp = self.http.get(url).send().await?;
        self.handle_response(resp).await
    }

    async fn get_with_params<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, Error> {
        let url = self.url(path)?;
        debug!("GET {url} params={params:?}");

        let resp = self.http.get(url).query(params).send().await?;
        self.handle_response(resp).await
    }

    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        let url = self.url(path)?;
        debug!("POST {url}");

        let resp = self.http.post(url).json(body).send().await?;
        self.handle_response(resp).await
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        let url = self.url(path)?;
        debug!("DELETE {url}");

        let resp = self.http.delete(url).send().await?;
        self.handle_empty(resp).await
    }

    // ── Response handling ────────────────────────────────────────────

    async fn handle_response<T: DeserializeOwned>(
        &self,
        resp: reqwest::Response,
    ) -> Result<T, Error> {
        let status = resp.status();
        if status.is_success() {
            let body = resp.text().await?;
            serde_json::from_str(&body).map_err(|e| {
                let preview: String = body.chars().take(200).collect();
                Error::Deserialization {
                    message: format!("{e} (body preview: {preview:?})"),
                    body,
                }
            })
        } else {
            Err(self.parse_error(status, resp).await)
        }
    }

    async fn handle_empty(&self, resp: reqwest::Response) -> Result<(), Error> {
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(self.parse_error(status, resp).await)
        }
    }

    /// 401/403 mean the key is bad; everything else keeps the raw body.
    async fn parse_error(&self, status: reqwest::StatusCode, resp: reqwest::Response) -> Error {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Error::InvalidApiKey;
        }

        let raw = resp.text().await.unwrap_or_default();
        let code = serde_json::from_str::<ErrorResponse>(&raw)
            .ok()
            .and_then(|e| e.code);

        Error::Integration {
            status: status.as_u16(),
            message: if raw.is_empty() {
                status.to_string()
            } else {
                raw
            },
            code,
        }
    }

    // ── Pagination helper ────────────────────────────────────────────

    /// Collect all pages into a single `Vec<T>`.
    pub async fn paginate_all<T, F, Fut>(&self, fetch: F) -> Result<Vec<T>, Error>
    where
        F: Fn(u64, u32) -> Fut,
        Fut: Future<Output = Result<types::Page<T>, Error>>,
    {
        let limit = self.page_limit;
        let mut all = Vec::new();
        let mut offset: u64 = 0;

        loop {
            let page = fetch(offset, limit).await?;
            let received = page.data.len();
            all.extend(page.data);

            let limit_usize = usize::try_from(limit).unwrap_or(usize::MAX);
            let reached_total = page
                .total_count
                .is_none_or(|total| i64::try_from(all.len()).unwrap_or(i64::MAX) >= total);
            if received == 0 || received < limit_usize || reached_total {
                break;
            }

            offset += u64::try_from(received).unwrap_or(u64::MAX);
        }

        Ok(all)
    }

    async fn list_page<T: DeserializeOwned>(
        &self,
        path: &str,
        offset: u64,
        limit: u32,
    ) -> Result<types::Page<T>, Error> {
        self.get_with_params(
            path,
            &[("offset", offset.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    // ━━ Public API ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    // ── System Info ──────────────────────────────────────────────────

    /// Cheapest authenticated call; used to validate a key.
    pub async fn get_info(&self) -> Result<types::ApplicationInfo, Error> {
        self.get("v1/info").await
    }

    // ── Sites ────────────────────────────────────────────────────────

    pub async fn list_sites(&self) -> Result<Vec<types::Site>, Error> {
        self.paginate_all(|offset, limit| self.list_page("v1/sites", offset, limit))
            .await
    }

    // ── Firewall Zones ───────────────────────────────────────────────

    pub async fn list_firewall_zones(
        &self,
        site_id: &str,
    ) -> Result<Vec<types::FirewallZone>, Error> {
        let path = format!("v1/sites/{site_id}/firewall/zones");
        self.paginate_all(|offset, limit| self.list_page(&path, offset, limit))
            .await
    }

    pub async fn create_firewall_zone(
        &self,
        site_id: &str,
        body: &types::FirewallZoneCreate,
    ) -> Result<types::FirewallZone, Error> {
        self.post(&format!("v1/sites/{site_id}/firewall/zones"), body)
            .await
    }

    pub async fn delete_firewall_zone(&self, site_id: &str, zone_id: &str) -> Result<(), Error> {
        self.delete(&format!("v1/sites/{site_id}/firewall/zones/{zone_id}"))
            .await
    }

    // ── Firewall Policies ────────────────────────────────────────────

    pub async fn list_firewall_policies(
        &self,
        site_id: &str,
    ) -> Result<Vec<types::FirewallPolicy>, Error> {
        let path = format!("v1/sites/{site_id}/firewall/policies");
        self.paginate_all(|offset, limit| self.list_page(&path, offset, limit))
            .await
    }

    pub async fn create_firewall_policy(
        &self,
        site_id: &str,
        body: &types::FirewallPolicyCreate,
    ) -> Result<types::FirewallPolicy, Error> {
        self.post(&format!("v1/sites/{site_id}/firewall/policies"), body)
            .await
    }

    pub async fn delete_firewall_policy(
        &self,
        site_id: &str,
        policy_id: &str,
    ) -> Result<(), Error> {
        self.delete(&format!("v1/sites/{site_id}/firewall/policies/{policy_id}"))
            .await
    }
}
