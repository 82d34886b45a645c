// HTTP client construction for the Integration API.
//
// The API is served by the gateway itself behind a self-signed
// certificate, so verification is off unless configured otherwise.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};

use crate::error::Error;

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Skip certificate verification.
    pub accept_invalid_certs: bool,
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            accept_invalid_certs: true,
            timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// A client that sends `api_key` on every request as a sensitive
    /// header. Blank keys are rejected before any request is made.
    pub(crate) fn api_key_client(&self, api_key: &SecretString) -> Result<reqwest::Client, Error> {
        let key = api_key.expose_secret().trim();
        if key.is_empty() {
            return Err(Error::InvalidApiKey);
        }
        let mut value = HeaderValue::from_str(key).map_err(|_| Error::InvalidApiKey)?;
        value.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, value);

        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("vpnpack/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }
}
