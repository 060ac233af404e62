use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Invalid configuration: {field} {reason}")]
    Configuration { field: &'static str, reason: String },

    #[error("Automation resource unavailable")]
    ResourceUnavailable,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Task execution failed: {0}")]
    TaskExecution(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProbeError {
    pub fn configuration(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field,
            reason: reason.into(),
        }
    }

    /// Stable category reported to callers for this error.
    pub fn category(&self) -> DiagnosticCategory {
        match self {
            Self::Configuration { .. } => DiagnosticCategory::ConfigurationError,
            Self::ResourceUnavailable => DiagnosticCategory::ResourceUnavailable,
            Self::Transport(err) => err.category(),
            Self::Cancelled => DiagnosticCategory::CancelledInFlight,
            Self::TaskExecution(_) | Self::Protocol(_) | Self::Serialization(_) => {
                DiagnosticCategory::TaskExecutionFailure
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ProbeError>;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic".to_string()
    }
}

/// Failure raised by an automation backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("automation resource disconnected")]
    Disconnected,

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn category(&self) -> DiagnosticCategory {
        match self {
            Self::Timeout => DiagnosticCategory::NavigationTimeout,
            Self::Disconnected => DiagnosticCategory::ResourceUnavailable,
            Self::Navigation(text) | Self::Other(text) => DiagnosticCategory::from_transport_text(text),
            Self::Unsupported(_) => DiagnosticCategory::NavigationFailure,
        }
    }
}

/// Short, stable error categories attached to outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticCategory {
    NavigationTimeout,
    NameResolutionFailure,
    ConnectionRefused,
    CertificateError,
    RequestAborted,
    NavigationFailure,
    InteractionTimeout,
    ResourceUnavailable,
    ConfigurationError,
    CancelledBeforeStart,
    CancelledInFlight,
    TaskExecutionFailure,
}

// Matched case-insensitively, first hit wins. Covers Chromium net error codes
// and the hyper/rustls wording surfaced through reqwest.
const TRANSPORT_PATTERNS: &[(&str, DiagnosticCategory)] = &[
    ("err_name_not_resolved", DiagnosticCategory::NameResolutionFailure),
    ("dns error", DiagnosticCategory::NameResolutionFailure),
    ("failed to lookup address", DiagnosticCategory::NameResolutionFailure),
    ("name or service not known", DiagnosticCategory::NameResolutionFailure),
    ("err_connection_refused", DiagnosticCategory::ConnectionRefused),
    ("connection refused", DiagnosticCategory::ConnectionRefused),
    ("err_cert_", DiagnosticCategory::CertificateError),
    ("err_ssl_", DiagnosticCategory::CertificateError),
    ("certificate", DiagnosticCategory::CertificateError),
    ("invalid peer", DiagnosticCategory::CertificateError),
    ("err_aborted", DiagnosticCategory::RequestAborted),
    ("aborted", DiagnosticCategory::RequestAborted),
    ("connection reset", DiagnosticCategory::RequestAborted),
    ("err_timed_out", DiagnosticCategory::NavigationTimeout),
    ("timed out", DiagnosticCategory::NavigationTimeout),
];

impl DiagnosticCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NavigationTimeout => "NavigationTimeout",
            Self::NameResolutionFailure => "NameResolutionFailure",
            Self::ConnectionRefused => "ConnectionRefused",
            Self::CertificateError => "CertificateError",
            Self::RequestAborted => "RequestAborted",
            Self::NavigationFailure => "NavigationFailure",
            Self::InteractionTimeout => "InteractionTimeout",
            Self::ResourceUnavailable => "ResourceUnavailable",
            Self::ConfigurationError => "ConfigurationError",
            Self::CancelledBeforeStart => "CancelledBeforeStart",
            Self::CancelledInFlight => "CancelledInFlight",
            Self::TaskExecutionFailure => "TaskExecutionFailure",
        }
    }

    /// Maps raw transport error text onto a fixed category.
    pub fn from_transport_text(text: &str) -> Self {
        let lowered = text.to_ascii_lowercase();
        TRANSPORT_PATTERNS
            .iter()
            .find(|(needle, _)| lowered.contains(needle))
            .map(|(_, category)| *category)
            .unwrap_or(Self::NavigationFailure)
    }
}

impl fmt::Display for DiagnosticCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
