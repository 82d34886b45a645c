//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

use vpnpack_config::ConfigError;
use vpnpack_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("{target} unreachable")]
    #[diagnostic(
        code(vpnpack::connection_failed),
        help(
            "{reason}\n\
             Check that the Network application is running and that the\n\
             udapi socket path and integration.base_url are correct."
        )
    )]
    ConnectionFailed { target: String, reason: String },

    #[error("Request timed out after {seconds}s")]
    #[diagnostic(
        code(vpnpack::timeout),
        help("Raise integration.timeout_secs or check the appliance's load.")
    )]
    Timeout { seconds: u64 },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Integration API key rejected")]
    #[diagnostic(
        code(vpnpack::auth_failed),
        help(
            "Create a new key under Settings > Control Plane > Integrations and\n\
             store it in the key file or VPNPACK_API_KEY."
        )
    )]
    AuthFailed { message: String },

    #[error("Integration API not configured")]
    #[diagnostic(
        code(vpnpack::no_credentials),
        help("Store an API key in the key file or set VPNPACK_API_KEY.")
    )]
    NoCredentials,

    // ── Resources ────────────────────────────────────────────────────
    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(
        code(vpnpack::not_found),
        help("Run: vpnpack status to see configured tunnels")
    )]
    NotFound {
        resource_type: String,
        identifier: String,
    },

    #[error("Port {port} unavailable: {reason}")]
    #[diagnostic(code(vpnpack::conflict))]
    PortUnavailable { port: u16, reason: String },

    // ── Operations ───────────────────────────────────────────────────
    #[error("{message}")]
    #[diagnostic(code(vpnpack::operation_failed))]
    OperationFailed { message: String },

    #[error("Destructive operation '{action}' requires confirmation")]
    #[diagnostic(
        code(vpnpack::confirmation_required),
        help("Use --yes (-y) to skip confirmation in non-interactive contexts.")
    )]
    NonInteractiveRequiresYes { action: String },

    // ── Validation / configuration ───────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(vpnpack::validation))]
    Validation { field: String, reason: String },

    #[error(transparent)]
    #[diagnostic(
        code(vpnpack::config),
        help("Run: vpnpack config show to see the effective configuration")
    )]
    Config(ConfigError),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Output serialization failed: {0}")]
    #[diagnostic(code(vpnpack::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::AuthFailed { .. } | Self::NoCredentials => exit_code::AUTH,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::PortUnavailable { .. } => exit_code::CONFLICT,
            Self::Validation { .. } | Self::NonInteractiveRequiresYes { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── ConfigError → CliError ───────────────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config(other),
        }
    }
}

// ── CoreError → CliError ─────────────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Unreachable { target, reason } => Self::ConnectionFailed { target, reason },

            CoreError::Timeout { timeout_secs } => Self::Timeout {
                seconds: timeout_secs,
            },

            CoreError::Unauthorized { message } => Self::AuthFailed { message },

            CoreError::IntegrationNotConfigured => Self::NoCredentials,

            CoreError::NotFound {
                entity_type,
                identifier,
            } => Self::NotFound {
                resource_type: entity_type,
                identifier,
            },

            CoreError::PortUnavailable { port, reason } => Self::PortUnavailable { port, reason },

            CoreError::ValidationFailed { message } => Self::Validation {
                field: "input".into(),
                reason: message,
            },

            CoreError::Config { message } => Self::Validation {
                field: "config".into(),
                reason: message,
            },

            other => Self::OperationFailed {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_class() {
        let cases = [
            (
                CoreError::Unauthorized {
                    message: "401".into(),
                },
                exit_code::AUTH,
            ),
            (CoreError::not_found("tunnel", "ab12"), exit_code::NOT_FOUND),
            (
                CoreError::Unreachable {
                    target: "udapi".into(),
                    reason: "refused".into(),
                },
                exit_code::CONNECTION,
            ),
            (CoreError::Timeout { timeout_secs: 10 }, exit_code::TIMEOUT),
            (CoreError::Internal("boom".into()), exit_code::GENERAL),
        ];
        for (core, expected) in cases {
            assert_eq!(CliError::from(core).exit_code(), expected);
        }
    }
}
