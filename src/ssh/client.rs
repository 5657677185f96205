use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Config, Handle};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::{Credentials, SshSettings};
use crate::device::Device;
use crate::error::SshError;
use crate::security_log;

use super::SessionConnector;
use super::handler::{ClientHandler, HostKeyCache};
use super::session::SshSession;

/// SSH client for switch sessions. One instance is shared by every worker;
/// each call to `connect` produces an independent connection.
pub struct SshClient {
    config: Arc<Config>,
    credentials: Credentials,
    ssh_port: u16,
    connect_timeout: Duration,
    command_timeout: Duration,
    host_keys: HostKeyCache,
}

/// TCP + SSH handshake done, not yet authenticated.
pub struct PendingSession {
    handle: Handle<ClientHandler>,
    host: String,
    port: u16,
}

impl std::fmt::Debug for PendingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSession")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl SshClient {
    pub fn new(settings: &SshSettings, credentials: Credentials) -> Self {
        // Treat 0 as "no keepalive" to avoid immediate timeout
        let keepalive = if settings.keepalive_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(settings.keepalive_interval_secs))
        };

        let config = Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            keepalive_interval: keepalive,
            keepalive_max: 3,
            ..Default::default()
        };

        Self {
            config: Arc::new(config),
            credentials,
            ssh_port: settings.port,
            connect_timeout: settings.connect_timeout(),
            command_timeout: settings.command_timeout(),
            host_keys: HostKeyCache::new(),
        }
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn connection_failed(host: &str, port: u16, reason: impl Into<String>) -> SshError {
        SshError::ConnectionFailed {
            host: host.to_string(),
            port,
            reason: reason.into(),
        }
    }
}

impl SessionConnector for SshClient {
    type Transport = PendingSession;
    type Session = SshSession;

    async fn connect(&self, device: &Device) -> Result<PendingSession, SshError> {
        let target = device.ssh_target();
        let host = target.to_string();
        let port = self.ssh_port;
        let addr = SocketAddr::new(target, port);

        tracing::debug!(location = %device.location, %addr, "Connecting");

        // A connect timeout is a connection failure; only the per-device
        // deadline is reported as a timeout
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Self::connection_failed(
                    &host,
                    port,
                    format!("timed out after {}s", self.connect_timeout.as_secs()),
                )
            })?
            .map_err(|e| Self::connection_failed(&host, port, e.to_string()))?;

        let handler = ClientHandler::new(host.clone(), port, self.host_keys.clone());

        let handle = match timeout(
            self.connect_timeout,
            client::connect_stream(self.config.clone(), stream, handler),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e @ SshError::HostKeyVerification(_))) => return Err(e),
            Ok(Err(e)) => return Err(Self::connection_failed(&host, port, e.to_string())),
            Err(_) => {
                return Err(Self::connection_failed(
                    &host,
                    port,
                    "SSH handshake timed out",
                ));
            }
        };

        Ok(PendingSession { handle, host, port })
    }

    async fn authenticate(&self, pending: PendingSession) -> Result<SshSession, SshError> {
        let PendingSession {
            mut handle,
            host,
            port,
        } = pending;
        let username = self.credentials.username.as_str();

        security_log::log_auth_attempt(&host, port, username);

        // Use expose_secret() only at the point of authentication
        let auth_result = timeout(
            self.connect_timeout,
            handle.authenticate_password(username, self.credentials.password.expose_secret()),
        )
        .await;

        match auth_result {
            Ok(Ok(result)) if result.success() => {
                security_log::log_auth_success(&host, port, username);
            }
            Ok(Ok(_)) => {
                let reason = "Authentication rejected by server";
                security_log::log_auth_failure(&host, port, username, reason);
                return Err(SshError::AuthenticationFailed(reason.to_string()));
            }
            Ok(Err(e)) => {
                let reason = e.to_string();
                security_log::log_auth_failure(&host, port, username, &reason);
                return Err(SshError::AuthenticationFailed(reason));
            }
            Err(_) => {
                security_log::log_auth_failure(&host, port, username, "timed out");
                return Err(Self::connection_failed(
                    &host,
                    port,
                    "authentication timed out",
                ));
            }
        }

        SshSession::open(handle, host, self.command_timeout).await
    }
}
