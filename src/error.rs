// ABOUTME: Error taxonomy shared by every failover component
// ABOUTME: Classifies failures so the orchestrator can pick retry, rollback, or manual remediation

use thiserror::Error;

/// Failures surfaced by the admin adapters and the failover components.
///
/// The variant decides the policy applied by the orchestrator:
/// connectivity errors are retried on reversible steps, precondition errors
/// abort without mutation, state conflicts are re-queried and converged, and
/// irreversible-step errors stop the run with manual remediation.
#[derive(Debug, Clone, Error)]
pub enum FailoverError {
    #[error("cannot reach {target}: {message}")]
    Connectivity { target: String, message: String },

    #[error("precondition failed: {message} ({remediation})")]
    Precondition { message: String, remediation: String },

    #[error("state conflict: {message}")]
    StateConflict { message: String },

    #[error("irreversible step failed: {message}")]
    IrreversibleStep {
        message: String,
        remediation: Vec<String>,
    },

    #[error("{target} rejected command: {message}")]
    Command { target: String, message: String },

    #[error("a failover for {pair} is already in progress")]
    AlreadyRunning { pair: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Coarse classification of a [`FailoverError`], recorded in the run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connectivity,
    Precondition,
    StateConflict,
    IrreversibleStep,
    Command,
    AlreadyRunning,
    Config,
}

impl FailoverError {
    pub fn connectivity(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connectivity {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn precondition(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
            remediation: remediation.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::StateConflict {
            message: message.into(),
        }
    }

    pub fn irreversible(message: impl Into<String>, remediation: Vec<String>) -> Self {
        Self::IrreversibleStep {
            message: message.into(),
            remediation,
        }
    }

    pub fn command(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connectivity { .. } => ErrorKind::Connectivity,
            Self::Precondition { .. } => ErrorKind::Precondition,
            Self::StateConflict { .. } => ErrorKind::StateConflict,
            Self::IrreversibleStep { .. } => ErrorKind::IrreversibleStep,
            Self::Command { .. } => ErrorKind::Command,
            Self::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Only connectivity failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }
}

/// Classify a tokio-postgres error raised while talking to `target`.
///
/// SQLSTATE classes 08 (connection exception), 28 (invalid authorization) and
/// 57P0x (operator intervention / shutdown) count as connectivity failures, as
/// do a closed connection and socket or TLS errors. Everything else, including
/// client-side row and type conversion errors, is a rejected command.
pub fn classify_pg_error(target: &str, err: &tokio_postgres::Error) -> FailoverError {
    match err.as_db_error() {
        Some(db) => {
            let code = db.code().code();
            if code.starts_with("08") || code.starts_with("28") || code.starts_with("57P0") {
                FailoverError::connectivity(target, db.message())
            } else {
                FailoverError::command(target, format!("{} (SQLSTATE {})", db.message(), code))
            }
        }
        None if err.is_closed() || is_transport_error(err) => {
            FailoverError::connectivity(target, err.to_string())
        }
        None => FailoverError::command(target, err.to_string()),
    }
}

/// True when `err` or anything in its source chain is a socket or TLS error.
fn is_transport_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<std::io::Error>() || e.is::<native_tls::Error>() {
            return true;
        }
        current = e.source();
    }
    false
}

pub type Result<T, E = FailoverError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connectivity_is_retryable() {
        assert!(FailoverError::connectivity("primary", "refused").is_retryable());
        assert!(!FailoverError::precondition("lag", "use --force").is_retryable());
        assert!(!FailoverError::conflict("already dropped").is_retryable());
        assert!(!FailoverError::irreversible("drop", vec![]).is_retryable());
    }

    #[derive(Debug)]
    struct Wrapped(std::io::Error);

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "error connecting to server")
        }
    }

    impl std::error::Error for Wrapped {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_transport_errors_are_found_in_the_source_chain() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(is_transport_error(&reset));

        let wrapped = Wrapped(std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"));
        assert!(is_transport_error(&wrapped));

        let conversion = "x".parse::<i64>().unwrap_err();
        assert!(!is_transport_error(&conversion));
    }

    #[test]
    fn test_precondition_message_carries_remediation() {
        let err = FailoverError::precondition(
            "lag 20 bytes exceeds threshold 10 bytes",
            "re-run with --force to proceed despite lag",
        );
        let text = err.to_string();
        assert!(text.contains("exceeds threshold"));
        assert!(text.contains("--force"));
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }
}
