//! Security and change-audit logging.
//!
//! Authentication attempts and every live change to switch state are logged
//! with `target: "security"` so they can be filtered into their own stream:
//!
//! ```bash
//! RUST_LOG=security=info poe-reset reset-all
//! ```
//!
//! Port toggles are the only irreversible action the tool performs, so each
//! one is recorded with the device identity, the port and both timestamps
//! whether or not the toggle completed.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

/// Log an SSH authentication attempt.
pub fn log_auth_attempt(host: &str, port: u16, username: &str) {
    info!(
        target: "security",
        event = "auth_attempt",
        host = %host,
        port = port,
        username = %username,
        method = "password",
        "SSH authentication attempt"
    );
}

/// Log a successful SSH authentication.
pub fn log_auth_success(host: &str, port: u16, username: &str) {
    info!(
        target: "security",
        event = "auth_success",
        host = %host,
        port = port,
        username = %username,
        "SSH authentication succeeded"
    );
}

/// Log a failed SSH authentication attempt.
pub fn log_auth_failure(host: &str, port: u16, username: &str, reason: &str) {
    warn!(
        target: "security",
        event = "auth_failure",
        host = %host,
        port = port,
        username = %username,
        reason = %reason,
        "SSH authentication failed"
    );
}

/// Log the host key presented by a switch. Keys are accepted on first use.
pub fn log_host_key_seen(host: &str, port: u16, fingerprint: &str, key_type: &str) {
    info!(
        target: "security",
        event = "host_key_seen",
        host = %host,
        port = port,
        fingerprint = %fingerprint,
        key_type = %key_type,
        "Accepted switch host key"
    );
}

/// Log an acknowledged PoE disable.
pub fn log_port_disabled(location: &str, switch: &str, port: &str, disabled_at: DateTime<Utc>) {
    warn!(
        target: "security",
        event = "port_disabled",
        location = %location,
        switch = %switch,
        port = %port,
        disabled_at = %disabled_at.to_rfc3339(),
        "PoE disabled on switch port"
    );
}

/// Log an acknowledged PoE re-enable.
pub fn log_port_enabled(
    location: &str,
    switch: &str,
    port: &str,
    disabled_at: Option<DateTime<Utc>>,
    enabled_at: DateTime<Utc>,
) {
    info!(
        target: "security",
        event = "port_enabled",
        location = %location,
        switch = %switch,
        port = %port,
        disabled_at = ?disabled_at.map(|t| t.to_rfc3339()),
        enabled_at = %enabled_at.to_rfc3339(),
        "PoE re-enabled on switch port"
    );
}

/// Log a toggle that may have left PoE disabled on a port.
pub fn log_port_toggle_incomplete(
    location: &str,
    switch: &str,
    port: &str,
    disabled_at: Option<DateTime<Utc>>,
    reason: &str,
) {
    error!(
        target: "security",
        event = "port_toggle_incomplete",
        location = %location,
        switch = %switch,
        port = %port,
        disabled_at = ?disabled_at.map(|t| t.to_rfc3339()),
        reason = %reason,
        "Port may be left with PoE disabled - manual check required"
    );
}
