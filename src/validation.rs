//! Input validation for values arriving from callers and the device directory.
//!
//! Everything the service facade accepts from outside passes through here
//! before it reaches the engine.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;

/// Validation error with field context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

static USERNAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_.-]{0,31}$").expect("username regex"));

/// Reset timeout bounds, in seconds.
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Upper bound on probes for a single live ping stream.
pub const MAX_PROBE_COUNT: u32 = 100;

/// Validate a location name.
///
/// Location names come from operators and spreadsheets, so any printable text
/// is accepted; only empty names and control characters are rejected.
pub fn validate_location(location: &str) -> Result<String, ValidationError> {
    let location = location.trim();

    if location.is_empty() {
        return Err(ValidationError {
            field: "location".to_string(),
            message: "Location name is required".to_string(),
        });
    }

    if location.len() > 128 {
        return Err(ValidationError {
            field: "location".to_string(),
            message: "Location name exceeds maximum length of 128 characters".to_string(),
        });
    }

    if location.chars().any(char::is_control) {
        return Err(ValidationError {
            field: "location".to_string(),
            message: "Location name contains control characters".to_string(),
        });
    }

    Ok(location.to_string())
}

/// Validate and parse an IPv4 or IPv6 address.
pub fn validate_ip(ip: &str) -> Result<IpAddr, ValidationError> {
    let ip = ip.trim();

    if ip.is_empty() {
        return Err(ValidationError {
            field: "ip".to_string(),
            message: "IP address is required".to_string(),
        });
    }

    ip.parse::<IpAddr>().map_err(|_| ValidationError {
        field: "ip".to_string(),
        message: format!("Invalid IP address: '{}'", ip),
    })
}

/// Validate a reset timeout in seconds. `None` yields the default.
pub fn validate_timeout_secs(timeout: Option<u64>) -> Result<u64, ValidationError> {
    match timeout {
        None => Ok(DEFAULT_TIMEOUT_SECS),
        Some(secs) if (MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&secs) => Ok(secs),
        Some(secs) => Err(ValidationError {
            field: "timeout".to_string(),
            message: format!(
                "Timeout must be between {} and {} seconds, got {}",
                MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS, secs
            ),
        }),
    }
}

/// Validate the number of probes requested for a ping.
pub fn validate_probe_count(count: u32) -> Result<u32, ValidationError> {
    if count == 0 || count > MAX_PROBE_COUNT {
        return Err(ValidationError {
            field: "count".to_string(),
            message: format!("Probe count must be between 1 and {}", MAX_PROBE_COUNT),
        });
    }
    Ok(count)
}

/// Validate an SSH username.
///
/// Switch accounts follow POSIX-like conventions:
/// - Start with a letter or underscore
/// - Contain only alphanumeric, underscore, dot, or hyphen
/// - Maximum 32 characters
pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    let username = username.trim();

    if username.is_empty() {
        return Err(ValidationError {
            field: "username".to_string(),
            message: "Username is required".to_string(),
        });
    }

    if username.len() > 32 {
        return Err(ValidationError {
            field: "username".to_string(),
            message: "Username exceeds maximum length of 32 characters".to_string(),
        });
    }

    if !USERNAME_REGEX.is_match(username) {
        return Err(ValidationError {
            field: "username".to_string(),
            message: "Username must start with letter or underscore, and contain only alphanumeric, underscore, dot, or hyphen".to_string(),
        });
    }

    Ok(())
}
