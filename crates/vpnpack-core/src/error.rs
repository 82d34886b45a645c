// ── Core error types ──
//
// Errors surfaced by tunnel, firewall, and manifest operations. The
// `From<vpnpack_api::Error>` impl folds wire-level failures into the
// daemon's taxonomy: unreachable, validation, unauthorized, not-found,
// resource lifecycle, and generic upstream.

use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Transport ────────────────────────────────────────────────────
    #[error("{target} unreachable: {reason}")]
    Unreachable { target: String, reason: String },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Caller errors ────────────────────────────────────────────────
    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Port {port} unavailable: {reason}")]
    PortUnavailable { port: u16, reason: String },

    // ── Remote API ───────────────────────────────────────────────────
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Entity not found: {entity_type} {identifier}")]
    NotFound {
        entity_type: String,
        identifier: String,
    },

    #[error("Integration API not configured (API key and site required)")]
    IntegrationNotConfigured,

    #[error("API error: {message}")]
    Api {
        message: String,
        code: Option<String>,
        status: Option<u16>,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // ── Local resources ──────────────────────────────────────────────
    #[error("{operation} failed: {message}")]
    Network { operation: String, message: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ── Configuration / internal ─────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }

    pub fn network(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Network {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn not_found(entity_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            identifier: identifier.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Transport-class failures the watcher will retry on its own cadence.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<vpnpack_api::Error> for CoreError {
    fn from(err: vpnpack_api::Error) -> Self {
        use vpnpack_api::Error as E;

        match err {
            E::InvalidApiKey => CoreError::Unauthorized {
                message: "API key rejected by the Network application".into(),
            },
            E::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_secs: 0 }
                } else if e.is_connect() {
                    CoreError::Unreachable {
                        target: e
                            .url()
                            .map_or_else(|| "integration API".into(), ToString::to_string),
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                        code: None,
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            E::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            E::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            E::Tls(reason) => CoreError::Unreachable {
                target: "integration API".into(),
                reason: format!("TLS error: {reason}"),
            },
            E::Integration {
                message,
                status: 404,
                ..
            } => CoreError::NotFound {
                entity_type: "resource".into(),
                identifier: message,
            },
            E::Integration {
                message,
                code,
                status,
            } => CoreError::Api {
                message,
                code,
                status: Some(status),
            },
            E::SocketUnreachable { path, source } => CoreError::Unreachable {
                target: path.display().to_string(),
                reason: source.to_string(),
            },
            E::SocketRefused { path } => CoreError::Unreachable {
                target: path.display().to_string(),
                reason: "connection refused".into(),
            },
            E::SocketIo(e) => CoreError::Unreachable {
                target: "udapi socket".into(),
                reason: e.to_string(),
            },
            E::BadResponse { message } | E::Deserialization { message, .. } => {
                CoreError::Protocol { message }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_map_into_taxonomy() {
        let e: CoreError = vpnpack_api::Error::InvalidApiKey.into();
        assert!(e.is_unauthorized());

        let e: CoreError = vpnpack_api::Error::Integration {
            message: "missing".into(),
            code: None,
            status: 404,
        }
        .into();
        assert!(e.is_not_found());

        let e: CoreError = vpnpack_api::Error::Integration {
            message: "boom".into(),
            code: None,
            status: 502,
        }
        .into();
        assert!(matches!(e, CoreError::Api { status: Some(502), .. }));

        let e: CoreError = vpnpack_api::Error::SocketRefused {
            path: "/run/x.sock".into(),
        }
        .into();
        assert!(e.is_transient());
    }
}
