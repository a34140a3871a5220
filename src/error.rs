/// Unified error handling for the cluster hub
///
/// Every failure the hub can surface to a caller is a `HubError`. Variants
/// follow the failure classes the workflows care about: connectivity,
/// validation, remote agent failures, per-host aggregation and local
/// command/catalog failures.

use std::io;
use thiserror::Error;

/// Main error type for hub operations
#[derive(Debug, Error)]
pub enum HubError {
    /// Dialing an agent failed or timed out
    #[error("could not connect to agent on host {host}: {message}")]
    Connection { host: String, message: String },

    /// Cached channels that are no longer in a ready state
    #[error("could not ensure connections were ready: unready hosts: {}", .hosts.join(","))]
    Unready { hosts: Vec<String> },

    /// The agent channel broke while a call was in flight
    #[error("agent on host {host} is unavailable: {message}")]
    Unavailable { host: String, message: String },

    /// Request or environment validation failures
    #[error("{message}")]
    Validation { message: String },

    /// Error message returned by an agent, unwrapped from the reply envelope
    #[error("{message}")]
    Rpc { message: String },

    /// Agent error attributed to the host it came from
    #[error("host: {host}, {message}")]
    Remote { host: String, message: String },

    /// Several failures from the sub-tasks of one host
    #[error("{}", join_messages(.0))]
    Joined(Vec<HubError>),

    /// Catalog access errors
    #[error("catalog error: {message}")]
    Catalog { message: String },

    /// Local utility execution errors
    #[error("{message}")]
    Command { message: String },

    /// Terminal error reported by the hub over a reply stream
    #[error("{message}")]
    Stream { message: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// TLS setup or handshake errors
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// Malformed frames on the wire
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Added context around an underlying error
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<HubError>,
    },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for hub operations
pub type HubResult<T> = Result<T, HubError>;

fn join_messages(errors: &[HubError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Convenience methods for creating specific error types
impl HubError {
    pub fn connection<H: Into<String>, S: Into<String>>(host: H, message: S) -> Self {
        HubError::Connection {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn unavailable<H: Into<String>, S: Into<String>>(host: H, message: S) -> Self {
        HubError::Unavailable {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        HubError::Validation {
            message: message.into(),
        }
    }

    pub fn rpc<S: Into<String>>(message: S) -> Self {
        HubError::Rpc {
            message: message.into(),
        }
    }

    pub fn remote<H: Into<String>, S: Into<String>>(host: H, message: S) -> Self {
        HubError::Remote {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn catalog<S: Into<String>>(message: S) -> Self {
        HubError::Catalog {
            message: message.into(),
        }
    }

    pub fn command<S: Into<String>>(message: S) -> Self {
        HubError::Command {
            message: message.into(),
        }
    }

    pub fn tls<S: Into<String>>(message: S) -> Self {
        HubError::Tls {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        HubError::Protocol(message.into())
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        HubError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        HubError::Internal {
            message: message.into(),
        }
    }

    /// Wrap this error with a leading context message
    pub fn context<S: Into<String>>(self, context: S) -> Self {
        HubError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Attribute an unwrapped agent error to the host it was returned by.
    /// Errors that already carry a host are left alone.
    pub fn on_host(self, host: &str) -> Self {
        match self {
            HubError::Rpc { message } => HubError::Remote {
                host: host.to_string(),
                message,
            },
            HubError::Joined(errors) => {
                HubError::Joined(errors.into_iter().map(|e| e.on_host(host)).collect())
            }
            other => other,
        }
    }

    /// Combine the errors of several sub-tasks. Returns `None` when there is
    /// nothing to report and the error itself when there is only one.
    pub fn join(mut errors: Vec<HubError>) -> Option<HubError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(HubError::Joined(errors)),
        }
    }

    /// Check if the agent channel was lost during the call
    pub fn is_unavailable(&self) -> bool {
        matches!(self, HubError::Unavailable { .. })
    }
}

impl From<openssl::error::ErrorStack> for HubError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        HubError::tls(err.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::protocol(err.to_string())
    }
}
