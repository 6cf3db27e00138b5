//! Gateway error types and transport-loss classification.
//!
//! Errors fall into a small set of kinds with different handling policies:
//!
//! - **Config** - fatal at startup (unusable key directory, bad mode).
//! - **Auth** - surfaced to the tool caller; the connection is not recorded.
//!   Never retried, to avoid account lockouts.
//! - **AliasInUse** / **NoSuchAlias** / **NoActiveConnection** /
//!   **Validation** - rejected synchronously, no state mutated.
//! - **Transport** - may indicate a lost channel; [`is_transport_loss`]
//!   decides whether the manager performs its single transparent
//!   reconnect-and-retry.
//! - **Cancelled** - the command deadline expired; the remote process was
//!   signalled and partial output discarded.
//!
//! A remote command exiting non-zero is *not* an error: the exit code rides
//! alongside the output in [`super::connection::RunOutput`].

use thiserror::Error;

/// Error type shared by the key store, connections, managers and the pool.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("alias '{0}' already exists for a different user@host")]
    AliasInUse(String),

    #[error("no connection with alias '{0}'")]
    NoSuchAlias(String),

    #[error("no active connection")]
    NoActiveConnection,

    #[error("{0}")]
    Transport(String),

    #[error("SFTP error: {0}")]
    Sftp(String),

    #[error("command timed out after {0} seconds")]
    Cancelled(u64),

    #[error("{0}")]
    Validation(String),

    #[error("key error: {0}")]
    Key(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Whether this error looks like a lost transport, i.e. the one case the
    /// manager recovers from by reconnecting and retrying once.
    pub(crate) fn is_transport_loss(&self) -> bool {
        match self {
            GatewayError::Transport(msg) => is_transport_loss(msg),
            GatewayError::Io(err) => is_transport_loss(&err.to_string()),
            _ => false,
        }
    }
}

impl From<russh::Error> for GatewayError {
    fn from(err: russh::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

impl From<russh::keys::Error> for GatewayError {
    fn from(err: russh::keys::Error) -> Self {
        GatewayError::Key(err.to_string())
    }
}

/// Signatures of a lost SSH channel.
///
/// Authentication failures, command failures and protocol violations are
/// deliberately absent: reconnecting cannot fix those.
const TRANSPORT_LOSS_SIGNATURES: &[&str] = &[
    "connection reset",
    "broken pipe",
    "eof",
    "connection refused",
    "channel closed",
    "disconnected",
];

/// Classify an error message as a lost transport.
///
/// Matching is a case-insensitive substring check over the rendered error,
/// since the interesting failures originate in the remote sshd or the OS
/// socket layer and reach us as text.
pub(crate) fn is_transport_loss(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSPORT_LOSS_SIGNATURES
        .iter()
        .any(|sig| lower.contains(sig))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod transport_loss_signatures {
        use super::*;

        #[test]
        fn test_connection_reset_is_loss() {
            assert!(is_transport_loss("connection reset by peer"));
            assert!(is_transport_loss("Connection Reset"));
        }

        #[test]
        fn test_broken_pipe_is_loss() {
            assert!(is_transport_loss("write failed: Broken pipe"));
        }

        #[test]
        fn test_eof_is_loss() {
            assert!(is_transport_loss("EOF"));
            assert!(is_transport_loss("unexpected eof while reading"));
        }

        #[test]
        fn test_connection_refused_is_loss() {
            assert!(is_transport_loss("connect: connection refused"));
        }

        #[test]
        fn test_channel_closed_is_loss() {
            assert!(is_transport_loss("Channel closed"));
        }

        #[test]
        fn test_auth_failure_is_not_loss() {
            assert!(!is_transport_loss("permission denied"));
            assert!(!is_transport_loss("Authentication failed: bad password"));
        }

        #[test]
        fn test_ordinary_errors_are_not_loss() {
            assert!(!is_transport_loss("file not found"));
            assert!(!is_transport_loss(""));
        }
    }

    mod error_classification {
        use super::*;

        #[test]
        fn test_transport_variant_uses_classifier() {
            assert!(GatewayError::Transport("broken pipe".into()).is_transport_loss());
            assert!(!GatewayError::Transport("exec format error".into()).is_transport_loss());
        }

        #[test]
        fn test_auth_is_never_transport_loss() {
            // Even when the message carries a loss-looking substring.
            let err = GatewayError::Auth("server dropped us: connection reset".into());
            assert!(!err.is_transport_loss());
        }

        #[test]
        fn test_cancellation_is_never_transport_loss() {
            assert!(!GatewayError::Cancelled(30).is_transport_loss());
        }

        #[test]
        fn test_validation_is_never_transport_loss() {
            assert!(!GatewayError::Validation("missing argument".into()).is_transport_loss());
        }

        #[test]
        fn test_io_reset_is_transport_loss() {
            let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset");
            assert!(GatewayError::from(io).is_transport_loss());
        }
    }

    mod display {
        use super::*;

        #[test]
        fn test_no_such_alias_names_the_alias() {
            let err = GatewayError::NoSuchAlias("web-1".into());
            assert_eq!(err.to_string(), "no connection with alias 'web-1'");
        }

        #[test]
        fn test_cancelled_names_the_deadline() {
            let err = GatewayError::Cancelled(30);
            assert_eq!(err.to_string(), "command timed out after 30 seconds");
        }

        #[test]
        fn test_no_active_connection_message() {
            assert_eq!(
                GatewayError::NoActiveConnection.to_string(),
                "no active connection"
            );
        }
    }
}
