use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-device failure classification carried in outcomes and events.
///
/// These never abort a batch; they are recorded against the device that
/// produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AddressInvalid,
    ProbeUnavailable,
    ConnectionFailed,
    AuthFailed,
    PortNotFound,
    AmbiguousPort,
    /// The switch refused a configuration step (commit error, locked database).
    CommandRejected,
    Timeout,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AddressInvalid => "address_invalid",
            ErrorKind::ProbeUnavailable => "probe_unavailable",
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::PortNotFound => "port_not_found",
            ErrorKind::AmbiguousPort => "ambiguous_port",
            ErrorKind::CommandRejected => "command_rejected",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Whether the orchestrator may re-attempt the connection for this failure.
    pub fn is_retryable_connect(self) -> bool {
        matches!(self, ErrorKind::ConnectionFailed | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDir(std::io::Error),

    #[error("SSH credentials not configured. Set SSH_USERNAME and SSH_PASSWORD")]
    MissingCredentials,

    #[error("Invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Device directory errors
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Location not found: {0}")]
    NotFound(String),

    #[error("Failed to read device directory '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse device directory: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Duplicate location in device directory: {0}")]
    DuplicateLocation(String),

    #[error("Invalid IP address '{value}' for location {location}")]
    InvalidAddress { location: String, value: String },

    #[error("Invalid port '{value}' for location {location}")]
    InvalidPort { location: String, value: String },
}

/// SSH-related errors
#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed to {host}:{port}: {reason}")]
    ConnectionFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Command '{command}' rejected: {output}")]
    CommandRejected { command: String, output: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Host key verification failed: {0}")]
    HostKeyVerification(String),

    #[error("russh error: {0}")]
    Russh(String),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Russh(err.to_string())
    }
}

impl SshError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SshError::AuthenticationFailed(_) => ErrorKind::AuthFailed,
            SshError::CommandRejected { .. } => ErrorKind::CommandRejected,
            SshError::Timeout(_) => ErrorKind::Timeout,
            SshError::ConnectionFailed { .. }
            | SshError::Channel(_)
            | SshError::HostKeyVerification(_)
            | SshError::Russh(_) => ErrorKind::ConnectionFailed,
        }
    }
}

/// Reachability probe errors. Both are reported, never folded into "unreachable".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Cannot resolve address: {0}")]
    AddressInvalid(String),

    #[error("Probe mechanism unavailable: {0}")]
    Unavailable(String),

    #[error("Probe I/O error: {0}")]
    Io(String),
}

impl ProbeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::AddressInvalid(_) => ErrorKind::AddressInvalid,
            ProbeError::Unavailable(_) | ProbeError::Io(_) => ErrorKind::ProbeUnavailable,
        }
    }
}

/// Port locate/toggle errors
#[derive(Error, Debug)]
pub enum PortError {
    #[error("No port found for location {0}")]
    NotFound(String),

    #[error("Multiple ports match location {location}: {}", candidates.join(", "))]
    Ambiguous {
        location: String,
        candidates: Vec<String>,
    },

    #[error("Cancelled before the port was touched")]
    Cancelled,

    #[error(transparent)]
    Session(#[from] SshError),
}

impl PortError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PortError::NotFound(_) => ErrorKind::PortNotFound,
            PortError::Ambiguous { .. } => ErrorKind::AmbiguousPort,
            PortError::Cancelled => ErrorKind::Cancelled,
            PortError::Session(e) => e.kind(),
        }
    }
}
