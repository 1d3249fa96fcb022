use std::fmt;
use std::time::Duration;

use crate::config::ConfigError;
use crate::engine::ConnectionError;
use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Top-level error for callers that drive a whole session.
#[derive(Debug)]
pub enum GearmanError {
    Config(ConfigError),
    Transport(TransportError),
    Protocol(ProtocolError),
    Connection(ConnectionError),
    /// Per-task deadline exceeded. No timer raises this yet; task timeouts
    /// are recorded but not enforced.
    Timeout { timeout: Duration },
}

impl fmt::Display for GearmanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(source) => write!(f, "configuration error: {source}"),
            Self::Transport(source) => write!(f, "{source}"),
            Self::Protocol(source) => write!(f, "{source}"),
            Self::Connection(source) => write!(f, "{source}"),
            Self::Timeout { timeout } => {
                write!(f, "task timed out after {} ms", timeout.as_millis())
            }
        }
    }
}

impl std::error::Error for GearmanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(source) => Some(source),
            Self::Transport(source) => Some(source),
            Self::Protocol(source) => Some(source),
            Self::Connection(source) => Some(source),
            Self::Timeout { .. } => None,
        }
    }
}

impl From<ConfigError> for GearmanError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TransportError> for GearmanError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

impl From<ProtocolError> for GearmanError {
    fn from(value: ProtocolError) -> Self {
        Self::Protocol(value)
    }
}

// Flattens the connection wrapper so callers match on one level.
impl From<ConnectionError> for GearmanError {
    fn from(value: ConnectionError) -> Self {
        match value {
            ConnectionError::Protocol(source) => Self::Protocol(source),
            ConnectionError::Transport(source) => Self::Transport(source),
            other => Self::Connection(other),
        }
    }
}
