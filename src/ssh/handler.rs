use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use russh::ChannelId;
use russh::client::{Handler, Session};
use russh::keys::{HashAlg, PublicKey};

use crate::error::SshError;
use crate::security_log;

/// Outcome of recording a presented host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// First key seen for this switch in this process.
    New,
    Known,
    Changed { previous: String },
}

/// Host keys seen during this process, keyed by `host:port`.
///
/// Switches are accepted on first use; a switch presenting a different key
/// later in the same process is refused.
#[derive(Debug, Clone, Default)]
pub struct HostKeyCache {
    seen: Arc<Mutex<HashMap<String, String>>>,
}

impl HostKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, host: &str, port: u16, fingerprint: &str) -> HostKeyStatus {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let key = format!("{}:{}", host, port);
        match seen.get(&key) {
            None => {
                seen.insert(key, fingerprint.to_string());
                HostKeyStatus::New
            }
            Some(known) if known == fingerprint => HostKeyStatus::Known,
            Some(known) => HostKeyStatus::Changed {
                previous: known.clone(),
            },
        }
    }
}

/// SSH client handler for switch sessions
pub struct ClientHandler {
    host: String,
    port: u16,
    host_keys: HostKeyCache,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, host_keys: HostKeyCache) -> Self {
        Self {
            host,
            port,
            host_keys,
        }
    }
}

impl Handler for ClientHandler {
    type Error = SshError;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        let key_type = server_public_key.algorithm().as_str().to_string();
        let status = self.host_keys.record(&self.host, self.port, &fingerprint);
        let host = self.host.clone();
        let port = self.port;

        async move {
            match status {
                HostKeyStatus::New => {
                    security_log::log_host_key_seen(&host, port, &fingerprint, &key_type);
                    Ok(true)
                }
                HostKeyStatus::Known => {
                    tracing::debug!("Host key unchanged for {}:{}", host, port);
                    Ok(true)
                }
                HostKeyStatus::Changed { previous } => {
                    tracing::warn!(
                        target: "security",
                        event = "host_key_changed",
                        host = %host,
                        port = port,
                        old_fingerprint = %previous,
                        new_fingerprint = %fingerprint,
                        "HOST KEY CHANGED during this run - refusing connection"
                    );
                    Err(SshError::HostKeyVerification(format!(
                        "host key for {}:{} changed from {} to {}",
                        host, port, previous, fingerprint
                    )))
                }
            }
        }
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_key_is_new_then_known() {
        let cache = HostKeyCache::new();
        assert_eq!(cache.record("10.0.0.1", 22, "SHA256:abc"), HostKeyStatus::New);
        assert_eq!(cache.record("10.0.0.1", 22, "SHA256:abc"), HostKeyStatus::Known);
    }

    #[test]
    fn different_key_for_same_switch_is_changed() {
        let cache = HostKeyCache::new();
        cache.record("10.0.0.1", 22, "SHA256:abc");
        assert_eq!(
            cache.record("10.0.0.1", 22, "SHA256:def"),
            HostKeyStatus::Changed {
                previous: "SHA256:abc".to_string()
            }
        );
    }

    #[test]
    fn port_is_part_of_identity() {
        let cache = HostKeyCache::new();
        cache.record("10.0.0.1", 22, "SHA256:abc");
        assert_eq!(cache.record("10.0.0.1", 2222, "SHA256:def"), HostKeyStatus::New);
    }

    #[test]
    fn clones_share_state() {
        let cache = HostKeyCache::new();
        let clone = cache.clone();
        cache.record("10.0.0.1", 22, "SHA256:abc");
        assert_eq!(clone.record("10.0.0.1", 22, "SHA256:abc"), HostKeyStatus::Known);
    }

    #[test]
    fn handler_keeps_target() {
        let handler = ClientHandler::new("10.0.0.1".to_string(), 2222, HostKeyCache::new());
        assert_eq!(handler.host, "10.0.0.1");
        assert_eq!(handler.port, 2222);
    }
}
