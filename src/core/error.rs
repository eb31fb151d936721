use crate::core::state::BackendType;
use thiserror::Error;

/// Core error types for appwall
///
/// Availability failures (`PermissionDenied`, `Unavailable`,
/// `CompetingResourceHeld`, `VersionUnsupported`) are expected outcomes during
/// backend selection. `ApplyFailed` and `Timeout` come from a backend that was
/// already chosen and are surfaced to the caller as-is.
#[derive(Debug, Error)]
pub enum Error {
    /// Privileged operation refused (root denied, broker grant missing, consent denied)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Enforcement mechanism not present on this device
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// The single VPN slot is held by another application
    #[error("VPN slot already in use: {0}")]
    CompetingResourceHeld(String),

    /// OS below (or above) the range a backend supports
    #[error("Unsupported OS version: requires SDK {required}, found {found}")]
    VersionUnsupported { required: u32, found: u32 },

    /// Backend-specific rule application error
    #[error("{backend} failed to apply rules: {message}")]
    ApplyFailed {
        backend: BackendType,
        message: String,
    },

    /// Privileged command did not return in time
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    /// Operation not valid in the current firewall state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Rule violates a store invariant
    #[error("Invalid rule {key}: {message}")]
    InvalidRule { key: String, message: String },

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error only rules a candidate out during AUTO selection.
    pub fn is_availability(&self) -> bool {
        matches!(
            self,
            Error::PermissionDenied(_)
                | Error::Unavailable(_)
                | Error::CompetingResourceHeld(_)
                | Error::VersionUnsupported { .. }
                | Error::Timeout { .. }
        )
    }

    /// Translates the error into a message with corrective suggestions.
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            Error::PermissionDenied(msg) => {
                ErrorTranslation::new(format!("Permission denied: {msg}"))
                    .with_suggestion("Grant root access to appwall in your root manager")
                    .with_suggestion("Or authorize appwall in the broker app")
            }
            Error::Unavailable(msg) => ErrorTranslation::new(format!("Not available: {msg}"))
                .with_suggestion("Install a root solution or the broker app to unlock more backends")
                .with_suggestion("The VPN backend works without any privileges"),
            Error::CompetingResourceHeld(_) => {
                ErrorTranslation::new("Another VPN app is currently active")
                    .with_suggestion("Disconnect the other VPN, then start the firewall again")
                    .with_suggestion("Or grant root / broker access so no VPN slot is needed")
            }
            Error::VersionUnsupported { required, found } => ErrorTranslation::new(format!(
                "This backend needs Android SDK {required} (device has {found})"
            ))
            .with_suggestion("Use AUTO mode to pick a compatible backend"),
            Error::ApplyFailed { message, .. } => ShellErrorPattern::match_error(message),
            Error::Timeout { operation, .. } => {
                ErrorTranslation::new(format!("{operation} did not respond in time"))
                    .with_suggestion("Check that the root manager prompt was not left pending")
                    .with_suggestion("Try again when the device is less busy")
            }
            other => ErrorTranslation::new(other.to_string()),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Known stderr patterns from iptables, su and the broker shell
pub struct ShellErrorPattern;

impl ShellErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Re-grant root access to appwall")
                .with_suggestion("Check that the broker service still holds its permission");
        }

        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process is holding the iptables lock")
                .with_suggestion("Another firewall app may be modifying rules")
                .with_suggestion("Wait a moment and try again");
        }

        if lower.contains("no chain/target/match") || lower.contains("doesn't exist") {
            return ErrorTranslation::new("Firewall chain not found")
                .with_suggestion("Stop and start the firewall to rebuild its chains");
        }

        if lower.contains("couldn't load match") || lower.contains("owner") {
            return ErrorTranslation::new("Kernel lacks the owner match module")
                .with_suggestion("Use the broker or VPN backend on this device");
        }

        if lower.contains("not found") || lower.contains("no such file") {
            return ErrorTranslation::new("Required system binary is missing")
                .with_suggestion("Install iptables / a root solution, or use another backend");
        }

        if lower.contains("server is not running") || lower.contains("binder") {
            return ErrorTranslation::new("The broker service is not running")
                .with_suggestion("Open the broker app and start its service");
        }

        if lower.contains("timeout") || lower.contains("timed out") {
            return ErrorTranslation::new("Operation timed out")
                .with_suggestion("Try again when the system is less busy");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
