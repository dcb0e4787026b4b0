//! Error taxonomy for the reconciliation engine.
//!
//! Every fallible subsystem entry point returns a [`CoreError`], which
//! wraps a lower-level [`CommandError`] (the message a subprocess,
//! registry, or cluster call produced) and classifies it into the three
//! kinds the reconciler and the project's `Conditions` distinguish:
//! [`ErrorKind::Transient`], [`ErrorKind::Permanent`] and
//! [`ErrorKind::Partial`].

use derivative::Derivative;
use std::fmt::{Display, Formatter};

/// Verbosity used when rendering an error for a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMessageVerbosity {
    SafeOnly,
    FullDetails,
}

/// A command/registry/transport error, split into a safe message (never
/// contains secrets) and an optional full-detail message (may contain
/// subprocess stdout/stderr, which can echo tokens or passwords back).
#[derive(Derivative, Clone, thiserror::Error)]
#[derivative(Debug)]
pub struct CommandError {
    message_safe: String,
    #[derivative(Debug = "ignore")]
    full_details: Option<String>,
}

impl CommandError {
    pub fn new_from_safe_message(message: String) -> Self {
        CommandError {
            message_safe: message,
            full_details: None,
        }
    }

    pub fn new(message_safe: String, full_details: Option<String>) -> Self {
        CommandError { message_safe, full_details }
    }

    pub fn message_safe(&self) -> &str {
        &self.message_safe
    }

    pub fn message(&self, verbosity: ErrorMessageVerbosity) -> String {
        match (verbosity, &self.full_details) {
            (ErrorMessageVerbosity::SafeOnly, _) | (_, None) => self.message_safe.clone(),
            (ErrorMessageVerbosity::FullDetails, Some(details)) => {
                format!("{} / details: {}", self.message_safe, details)
            }
        }
    }
}

impl Display for CommandError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message(ErrorMessageVerbosity::SafeOnly))
    }
}

impl From<std::io::Error> for CommandError {
    fn from(err: std::io::Error) -> Self {
        CommandError::new("I/O error".to_string(), Some(err.to_string()))
    }
}

impl From<git2::Error> for CommandError {
    fn from(err: git2::Error) -> Self {
        CommandError::new("git operation failed".to_string(), Some(err.to_string()))
    }
}

impl From<kube::Error> for CommandError {
    fn from(err: kube::Error) -> Self {
        CommandError::new("Kubernetes API call failed".to_string(), Some(err.to_string()))
    }
}

impl From<reqwest::Error> for CommandError {
    fn from(err: reqwest::Error) -> Self {
        CommandError::new("HTTP request failed".to_string(), Some(err.to_string()))
    }
}

/// Error taxonomy from spec §7.
///
/// `Transient` errors are worth requeuing as-is (the next pass may
/// succeed without operator intervention). `Permanent` errors need a
/// change to the Git source or cluster permissions. `Partial` means some
/// components applied before the pass aborted; the inventory for the
/// completed components is retained, not rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Partial,
}

/// The error type threaded through the reconciliation engine.
#[derive(Derivative, Clone, thiserror::Error)]
#[derivative(Debug)]
pub struct CoreError {
    pub kind: ErrorKind,
    /// machine readable reason surfaced on `Conditions[].reason`
    pub reason: &'static str,
    #[derivative(Debug = "ignore")]
    pub source: CommandError,
}

impl CoreError {
    pub fn new(kind: ErrorKind, reason: &'static str, source: CommandError) -> Self {
        CoreError { kind, reason, source }
    }

    pub fn transient(reason: &'static str, source: impl Into<CommandError>) -> Self {
        CoreError::new(ErrorKind::Transient, reason, source.into())
    }

    pub fn permanent(reason: &'static str, source: impl Into<CommandError>) -> Self {
        CoreError::new(ErrorKind::Permanent, reason, source.into())
    }

    pub fn partial(reason: &'static str, source: impl Into<CommandError>) -> Self {
        CoreError::new(ErrorKind::Partial, reason, source.into())
    }

    /// Message suitable for a `Conditions[].message` field: never leaks
    /// secrets, matching the error-handling design's user-visible rule.
    pub fn message(&self) -> String {
        self.source.message(ErrorMessageVerbosity::SafeOnly)
    }
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.reason, self.source)
    }
}

impl From<git2::Error> for CoreError {
    fn from(err: git2::Error) -> Self {
        let transient = matches!(err.code(), git2::ErrorCode::Locked | git2::ErrorCode::Auth);
        let source = CommandError::from(err);
        if transient {
            CoreError::transient("GitTransport", source)
        } else {
            CoreError::permanent("GitTransport", source)
        }
    }
}

impl From<kube::Error> for CoreError {
    fn from(err: kube::Error) -> Self {
        let kind = match &err {
            kube::Error::Api(resp) if resp.code == 403 => ErrorKind::Permanent,
            kube::Error::Api(resp) if resp.code >= 500 => ErrorKind::Transient,
            _ => ErrorKind::Transient,
        };
        CoreError::new(kind, "KubernetesApi", CommandError::from(err))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::transient("Io", CommandError::from(err))
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        let server_error = matches!(err.status(), Some(status) if status.is_server_error());
        let kind = if err.is_timeout() || err.is_connect() || server_error {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        };
        CoreError::new(kind, "HttpRequest", CommandError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_message_never_includes_full_details() {
        let source = CommandError::new("upgrade failed".to_string(), Some("token=supersecret".to_string()));
        let err = CoreError::permanent("ChartNotFound", source);
        assert_eq!(err.message(), "upgrade failed");
        assert!(!err.message().contains("supersecret"));
    }

    #[test]
    fn transient_vs_permanent_classification() {
        let err = CoreError::transient("Network", CommandError::new_from_safe_message("timeout".into()));
        assert_eq!(err.kind, ErrorKind::Transient);
    }
}
