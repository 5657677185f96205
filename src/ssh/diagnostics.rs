//! Connection diagnostics for failed single-device resets.

use std::time::Duration;

use serde::Serialize;
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;

/// TCP reachability check budget.
const PORT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    DnsResolutionFailed,
    SshPortClosed,
    /// The port answers, so the failure happened after TCP connect.
    SshAuthenticationFailed,
    SshConnectionTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
}

#[derive(Debug, Clone, Serialize)]
pub struct SshDiagnostics {
    pub host: String,
    pub port: u16,
    pub hostname_resolution: bool,
    pub resolved_addresses: Vec<String>,
    pub ssh_port: Option<PortState>,
    pub error_type: DiagnosticKind,
    pub recommendations: Vec<String>,
}

/// Resolve `host` and test the SSH port, then classify the likely failure.
pub async fn analyze_ssh_error(host: &str, port: u16) -> SshDiagnostics {
    let mut recommendations = Vec::new();

    let resolved: Vec<String> = match lookup_host((host, port)).await {
        Ok(addrs) => addrs.map(|a| a.ip().to_string()).collect(),
        Err(e) => {
            tracing::debug!(host, "Resolution failed: {}", e);
            Vec::new()
        }
    };

    if resolved.is_empty() {
        recommendations.push("Check if the IP address or hostname is correct".to_string());
        return SshDiagnostics {
            host: host.to_string(),
            port,
            hostname_resolution: false,
            resolved_addresses: resolved,
            ssh_port: None,
            error_type: DiagnosticKind::DnsResolutionFailed,
            recommendations,
        };
    }

    let state = match timeout(PORT_CHECK_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => PortState::Open,
        Ok(Err(e)) => {
            tracing::debug!(host, port, "SSH port check failed: {}", e);
            PortState::Closed
        }
        Err(_) => PortState::Filtered,
    };

    let error_type = classify(state);
    match error_type {
        DiagnosticKind::SshPortClosed => {
            recommendations.push(format!("SSH port {} appears to be closed", port));
            recommendations.push("Check that SSH is enabled on the switch".to_string());
        }
        DiagnosticKind::SshConnectionTimeout => {
            recommendations.push(format!("SSH port {} appears to be filtered", port));
            recommendations.push("Check network path and firewall rules to the switch".to_string());
        }
        DiagnosticKind::SshAuthenticationFailed => {
            recommendations.push("Check SSH_USERNAME and SSH_PASSWORD".to_string());
        }
        DiagnosticKind::DnsResolutionFailed => {}
    }

    SshDiagnostics {
        host: host.to_string(),
        port,
        hostname_resolution: true,
        resolved_addresses: resolved,
        ssh_port: Some(state),
        error_type,
        recommendations,
    }
}

fn classify(state: PortState) -> DiagnosticKind {
    match state {
        PortState::Open => DiagnosticKind::SshAuthenticationFailed,
        PortState::Closed => DiagnosticKind::SshPortClosed,
        PortState::Filtered => DiagnosticKind::SshConnectionTimeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_port_state() {
        assert_eq!(classify(PortState::Open), DiagnosticKind::SshAuthenticationFailed);
        assert_eq!(classify(PortState::Closed), DiagnosticKind::SshPortClosed);
        assert_eq!(classify(PortState::Filtered), DiagnosticKind::SshConnectionTimeout);
    }

    #[tokio::test]
    async fn open_local_port_points_at_authentication() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let diag = analyze_ssh_error("127.0.0.1", port).await;
        assert!(diag.hostname_resolution);
        assert_eq!(diag.ssh_port, Some(PortState::Open));
        assert_eq!(diag.error_type, DiagnosticKind::SshAuthenticationFailed);
    }

    #[tokio::test]
    async fn closed_local_port_is_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let diag = analyze_ssh_error("127.0.0.1", port).await;
        assert_eq!(diag.error_type, DiagnosticKind::SshPortClosed);
        assert!(!diag.recommendations.is_empty());
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&DiagnosticKind::DnsResolutionFailed).unwrap();
        assert_eq!(json, "\"dns_resolution_failed\"");
    }
}
