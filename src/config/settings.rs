use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use crate::batch::ScreeningPolicy;
use crate::error::ConfigError;
use crate::validation::{MAX_PROBE_COUNT, MAX_TIMEOUT_SECS};

/// Process-wide settings, loaded once at startup and never mutated afterwards.
///
/// Precedence: defaults, then `config.toml`, then environment variables.
#[derive(Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub reset: ResetSettings,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub directory: DirectorySettings,
}

/// Username/password pair used for every switch session.
#[derive(Debug)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl AppConfig {
    /// Load from an explicit file, or the default config file when present,
    /// then overlay the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match super::paths::config_file() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Overlay recognized environment variables. Empty values count as absent.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(username) = get("SSH_USERNAME") {
            self.ssh.username = Some(username.trim().to_string());
        }
        if let Some(password) = get("SSH_PASSWORD") {
            self.ssh.password = Some(SecretString::from(password));
        }
        if let Some(port) = get("SSH_PORT") {
            self.ssh.port = parse_env("SSH_PORT", &port)?;
        }
        if let Some(delay) = get("BATCH_VERIFICATION_DELAY_SECONDS") {
            self.batch.verification_delay_secs =
                parse_env("BATCH_VERIFICATION_DELAY_SECONDS", &delay)?;
        }
        if let Some(sleep) = get("SLEEP_DURATION_BEFORE_ENABLE_IN_SECOND") {
            self.reset.sleep_before_enable_secs =
                parse_env("SLEEP_DURATION_BEFORE_ENABLE_IN_SECOND", &sleep)?;
        }
        if let Some(limit) = get("BATCH_PARALLELISM") {
            self.batch.parallelism_limit = parse_env("BATCH_PARALLELISM", &limit)?;
        }
        if let Some(timeout) = get("PER_DEVICE_TIMEOUT_SECONDS") {
            self.batch.per_device_timeout_secs = parse_env("PER_DEVICE_TIMEOUT_SECONDS", &timeout)?;
        }
        if let Some(path) = get("DEVICE_DIRECTORY") {
            self.directory.path = Some(path.trim().to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("batch.parallelism_limit", self.batch.parallelism_limit as u64),
            ("reset.step_attempts", u64::from(self.reset.step_attempts)),
            ("reset.connect_attempts", u64::from(self.reset.connect_attempts)),
            ("probe.screening_count", u64::from(self.probe.screening_count)),
            ("probe.live_count", u64::from(self.probe.live_count)),
            ("ssh.port", u64::from(self.ssh.port)),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        // Durations feed Instant arithmetic in workers and must stay bounded
        let bounded = [
            ("batch.per_device_timeout_secs", self.batch.per_device_timeout_secs, 1),
            ("batch.verification_delay_secs", self.batch.verification_delay_secs, 0),
            ("probe.per_probe_timeout_secs", self.probe.per_probe_timeout_secs, 1),
            ("ssh.connect_timeout_secs", self.ssh.connect_timeout_secs, 1),
            ("ssh.command_timeout_secs", self.ssh.command_timeout_secs, 1),
            ("reset.sleep_before_enable_secs", self.reset.sleep_before_enable_secs, 0),
        ];
        for (key, value, min) in bounded {
            if !(min..=MAX_TIMEOUT_SECS).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: format!("must be between {} and {} seconds", min, MAX_TIMEOUT_SECS),
                });
            }
        }

        let counts = [
            ("probe.screening_count", self.probe.screening_count),
            ("probe.live_count", self.probe.live_count),
        ];
        for (key, value) in counts {
            if value > MAX_PROBE_COUNT {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: format!("must be at most {}", MAX_PROBE_COUNT),
                });
            }
        }
        Ok(())
    }

    /// Credentials for switch sessions. Fatal for reset operations when absent.
    pub fn require_credentials(&self) -> Result<Credentials, ConfigError> {
        match (&self.ssh.username, &self.ssh.password) {
            (Some(username), Some(password))
                if !username.is_empty() && !password.expose_secret().is_empty() =>
            {
                crate::validation::validate_username(username).map_err(|e| {
                    ConfigError::InvalidValue {
                        key: "ssh.username".to_string(),
                        value: username.clone(),
                        reason: e.message,
                    }
                })?;
                Ok(Credentials {
                    username: username.clone(),
                    password: SecretString::from(password.expose_secret().to_owned()),
                })
            }
            _ => Err(ConfigError::MissingCredentials),
        }
    }

    /// Device directory file: configured path, else the default location.
    pub fn directory_path(&self) -> Option<PathBuf> {
        match &self.directory.path {
            Some(path) => Some(super::paths::expand_tilde(path)),
            None => super::paths::devices_file(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "not a valid number".to_string(),
        })
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    20
}

fn default_keepalive() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct SshSettings {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            port: default_ssh_port(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            keepalive_interval_secs: default_keepalive(),
        }
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn default_sleep_before_enable() -> u64 {
    2
}

fn default_step_attempts() -> u32 {
    2
}

fn default_connect_attempts() -> u32 {
    1
}

fn default_retry_base_delay() -> u64 {
    500
}

fn default_retry_max_delay() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResetSettings {
    #[serde(default = "default_sleep_before_enable")]
    pub sleep_before_enable_secs: u64,
    /// Attempts per disable/enable step.
    #[serde(default = "default_step_attempts")]
    pub step_attempts: u32,
    /// Connection attempts per device, made by the orchestrator.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
}

impl Default for ResetSettings {
    fn default() -> Self {
        Self {
            sleep_before_enable_secs: default_sleep_before_enable(),
            step_attempts: default_step_attempts(),
            connect_attempts: default_connect_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
        }
    }
}

fn default_parallelism() -> usize {
    8
}

fn default_verification_delay() -> u64 {
    30
}

fn default_per_device_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchSettings {
    #[serde(default = "default_parallelism")]
    pub parallelism_limit: usize,
    #[serde(default = "default_verification_delay")]
    pub verification_delay_secs: u64,
    #[serde(default = "default_per_device_timeout")]
    pub per_device_timeout_secs: u64,
    #[serde(default)]
    pub immediate_verification: bool,
    #[serde(default)]
    pub screening_policy: ScreeningPolicy,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            parallelism_limit: default_parallelism(),
            verification_delay_secs: default_verification_delay(),
            per_device_timeout_secs: default_per_device_timeout(),
            immediate_verification: false,
            screening_policy: ScreeningPolicy::default(),
        }
    }
}

fn default_screening_count() -> u32 {
    4
}

fn default_live_count() -> u32 {
    10
}

fn default_per_probe_timeout() -> u64 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSettings {
    /// Probes sent when screening and verifying.
    #[serde(default = "default_screening_count")]
    pub screening_count: u32,
    /// Probes sent for a live ping display.
    #[serde(default = "default_live_count")]
    pub live_count: u32,
    #[serde(default = "default_per_probe_timeout")]
    pub per_probe_timeout_secs: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            screening_count: default_screening_count(),
            live_count: default_live_count(),
            per_probe_timeout_secs: default_per_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DirectorySettings {
    #[serde(default)]
    pub path: Option<String>,
}
