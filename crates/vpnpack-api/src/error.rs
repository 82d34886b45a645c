use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for the `vpnpack-api` crate.
///
/// Covers both wire surfaces: the framed udapi Unix socket and the
/// HTTPS Integration API. `vpnpack-core` maps these into its own taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// API key rejected by the Integration API (401 or 403), or no key set.
    #[error("Invalid API key")]
    InvalidApiKey,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Integration API ─────────────────────────────────────────────
    /// Non-2xx response from the Integration API. `message` carries the raw body.
    #[error("Integration API error (HTTP {status}): {message}")]
    Integration {
        message: String,
        code: Option<String>,
        status: u16,
    },

    // ── udapi socket ────────────────────────────────────────────────
    /// The socket is missing or could not be dialed.
    #[error("udapi socket {path} unreachable: {source}")]
    SocketUnreachable {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The server actively refused the connection.
    #[error("udapi socket {path} refused the connection")]
    SocketRefused { path: PathBuf },

    /// Malformed frame, bad size header, or unparsable envelope.
    #[error("udapi bad response: {message}")]
    BadResponse { message: String },

    /// I/O failure on an established socket.
    #[error("udapi I/O error: {0}")]
    SocketIo(#[from] std::io::Error),

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::SocketUnreachable { .. } | Self::SocketRefused { .. } => {
                true
            }
            _ => false,
        }
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Transport(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            Self::Integration { status: 404, .. } => true,
            _ => false,
        }
    }

    /// Returns `true` if the remote side rejected our credential.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::InvalidApiKey)
    }

    /// Extract the API error code, if available.
    pub fn api_error_code(&self) -> Option<&str> {
        match self {
            Self::Integration { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}
