//! Port locating and the PoE disable → settle → enable toggle.
//!
//! Toggling is the only action that changes live switch state. Once a
//! disable may have reached the switch, an enable is always attempted,
//! whatever the deadline or cancellation state.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, timeout_at};

use crate::config::ResetSettings;
use crate::device::{Device, PortId};
use crate::error::{PortError, SshError};
use crate::security_log;
use crate::ssh::{RetryPolicy, SwitchSession};

/// Acknowledgment the switch prints after a successful commit.
const COMMIT_ACK: &str = "commit complete";

pub fn descriptions_query() -> &'static str {
    "show interfaces descriptions"
}

pub fn poe_query(port: &PortId) -> String {
    format!("show poe interface {}", port)
}

pub fn disable_commands(port: &PortId) -> Vec<String> {
    vec![
        "configure".to_string(),
        format!("set poe interface {} disable", port),
        "commit and-quit".to_string(),
    ]
}

pub fn enable_commands(port: &PortId) -> Vec<String> {
    vec![
        "configure".to_string(),
        format!("delete poe interface {} disable", port),
        "commit and-quit".to_string(),
    ]
}

/// A configuration step counts only once the switch confirms the commit.
/// `output` is the reply to the `commit and-quit` line alone.
pub fn check_commit(output: &str) -> Result<(), SshError> {
    if output.to_lowercase().contains(COMMIT_ACK) {
        Ok(())
    } else {
        Err(SshError::CommandRejected {
            command: "commit and-quit".to_string(),
            output: output.trim().to_string(),
        })
    }
}

fn is_token_char(c: char) -> bool {
    c.is_alphanumeric()
}

/// Whether `needle` occurs in `haystack` with no alphanumeric neighbours.
fn contains_whole(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let begin = start + pos;
        let end = begin + needle.len();
        let before_ok = haystack[..begin].chars().next_back().is_none_or(|c| !is_token_char(c));
        let after_ok = haystack[end..].chars().next().is_none_or(|c| !is_token_char(c));
        if before_ok && after_ok {
            return true;
        }
        start = begin + needle.chars().next().map_or(1, char::len_utf8);
    }
    false
}

/// Find the physical port whose description names `location`.
///
/// Expects `show interfaces descriptions` output
/// (`Interface Admin Link Description`). Logical units collapse onto their
/// physical port; non-physical interfaces are ignored.
pub fn find_port_in_descriptions(output: &str, location: &str) -> Result<PortId, PortError> {
    let wanted = location.trim().to_lowercase();
    let mut matches = BTreeSet::new();

    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        let Some(name) = tokens.next() else {
            continue;
        };
        let Ok(port) = name.parse::<PortId>() else {
            continue;
        };
        // Skip the Admin and Link columns
        let description = tokens.skip(2).collect::<Vec<_>>().join(" ").to_lowercase();
        if contains_whole(&description, &wanted) {
            matches.insert(port);
        }
    }

    let mut iter = matches.into_iter();
    match (iter.next(), iter.next()) {
        (None, _) => Err(PortError::NotFound(location.to_string())),
        (Some(port), None) => Ok(port),
        (Some(first), Some(second)) => {
            let mut candidates = vec![first.to_string(), second.to_string()];
            candidates.extend(iter.map(|p| p.to_string()));
            Err(PortError::Ambiguous {
                location: location.to_string(),
                candidates,
            })
        }
    }
}

/// Progress reported to the caller between toggle steps.
#[derive(Debug, Clone, PartialEq)]
pub enum ToggleProgress {
    Located(PortId),
    Disabled { port: PortId, at: DateTime<Utc> },
    Enabled { port: PortId, at: DateTime<Utc> },
}

/// Caller's answer to a progress report. `Abort` is honored only before the
/// port has been touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepControl {
    Continue,
    Abort,
}

/// Step a toggle stopped in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleStage {
    Locating,
    Disabling,
    Waiting,
    Enabling,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToggleReport {
    pub port: PortId,
    pub disabled_at: DateTime<Utc>,
    pub re_enabled_at: DateTime<Utc>,
    /// The deadline passed while the toggle was completing.
    pub overran: bool,
}

#[derive(Debug)]
pub struct ToggleFailure {
    pub port: Option<PortId>,
    pub disabled_at: Option<DateTime<Utc>>,
    pub re_enabled_at: Option<DateTime<Utc>>,
    pub stage: ToggleStage,
    pub error: PortError,
}

impl ToggleFailure {
    fn before_disable(port: Option<PortId>, error: PortError) -> Self {
        Self {
            port,
            disabled_at: None,
            re_enabled_at: None,
            stage: ToggleStage::Locating,
            error,
        }
    }
}

fn deadline_error(stage: &str) -> PortError {
    PortError::Session(SshError::Timeout(format!(
        "per-device deadline reached while {}",
        stage
    )))
}

#[derive(Debug, Clone)]
pub struct PortToggler {
    settle: Duration,
    step_retry: RetryPolicy,
}

impl PortToggler {
    pub fn new(settle: Duration, step_retry: RetryPolicy) -> Self {
        Self { settle, step_retry }
    }

    pub fn from_settings(settings: &ResetSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.sleep_before_enable_secs),
            RetryPolicy::for_steps(settings),
        )
    }

    pub fn settle(&self) -> Duration {
        self.settle
    }

    /// Determine the port serving `device`. Read-only.
    pub async fn locate<S: SwitchSession>(
        &self,
        session: &mut S,
        device: &Device,
    ) -> Result<PortId, PortError> {
        if let Some(hint) = &device.port_hint {
            let output = session.query(&poe_query(hint)).await?;
            let lower = output.to_lowercase();
            if lower.contains("error") || !lower.contains(&hint.to_string()) {
                tracing::warn!(
                    location = %device.location,
                    port = %hint,
                    "Recorded port not present on switch"
                );
                return Err(PortError::NotFound(device.location.clone()));
            }
            return Ok(hint.clone());
        }

        let output = session.query(descriptions_query()).await?;
        find_port_in_descriptions(&output, &device.location)
    }

    /// Run one configuration step with retries.
    ///
    /// Returns the last error and whether any attempt may have reached the
    /// switch (anything other than an explicit rejection).
    async fn run_step<S: SwitchSession>(
        &self,
        session: &mut S,
        commands: &[String],
    ) -> Result<(), (SshError, bool)> {
        let mut uncertain = false;
        let mut attempt = 0;
        loop {
            let result = match session.configure(commands).await {
                Ok(output) => check_commit(&output),
                Err(e) => Err(e),
            };
            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if !matches!(err, SshError::CommandRejected { .. }) {
                uncertain = true;
            }
            if !self.step_retry.allows_retry_after(attempt) {
                return Err((err, uncertain));
            }
            let delay = self.step_retry.delay_with_jitter(attempt);
            tracing::debug!(attempt, ?delay, "Retrying configuration step: {}", err);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn enable<S: SwitchSession>(
        &self,
        session: &mut S,
        port: &PortId,
    ) -> Result<DateTime<Utc>, SshError> {
        self.run_step(session, &enable_commands(port))
            .await
            .map(|()| Utc::now())
            .map_err(|(e, _)| e)
    }

    /// Locate the port, disable it, wait the settle delay, re-enable it.
    ///
    /// `deadline` bounds locate and disable. The settle delay and enable run
    /// to completion even past the deadline; the report then has `overran`
    /// set.
    pub async fn locate_and_toggle<S, F>(
        &self,
        session: &mut S,
        device: &Device,
        deadline: Instant,
        mut observer: F,
    ) -> Result<ToggleReport, ToggleFailure>
    where
        S: SwitchSession,
        F: FnMut(ToggleProgress) -> StepControl + Send,
    {
        let switch = device.ssh_target().to_string();

        let port = match timeout_at(deadline, self.locate(session, device)).await {
            Ok(Ok(port)) => port,
            Ok(Err(e)) => return Err(ToggleFailure::before_disable(None, e)),
            Err(_) => {
                return Err(ToggleFailure::before_disable(
                    None,
                    deadline_error("locating port"),
                ));
            }
        };

        if observer(ToggleProgress::Located(port.clone())) == StepControl::Abort {
            return Err(ToggleFailure::before_disable(Some(port), PortError::Cancelled));
        }

        let disable = timeout_at(deadline, self.run_step(session, &disable_commands(&port))).await;
        let disable_error = match disable {
            Ok(Ok(())) => None,
            Ok(Err((e, uncertain))) => Some((PortError::Session(e), uncertain)),
            Err(_) => Some((deadline_error("disabling"), true)),
        };

        if let Some((error, uncertain)) = disable_error {
            // A disable that may have been applied is undone before reporting
            let re_enabled_at = if uncertain {
                match self.enable(session, &port).await {
                    Ok(at) => {
                        security_log::log_port_enabled(
                            &device.location,
                            &switch,
                            &port.to_string(),
                            None,
                            at,
                        );
                        Some(at)
                    }
                    Err(e) => {
                        security_log::log_port_toggle_incomplete(
                            &device.location,
                            &switch,
                            &port.to_string(),
                            None,
                            &format!("disable failed ({}), recovery enable failed ({})", error, e),
                        );
                        None
                    }
                }
            } else {
                None
            };
            return Err(ToggleFailure {
                port: Some(port),
                disabled_at: None,
                re_enabled_at,
                stage: ToggleStage::Disabling,
                error,
            });
        }

        let disabled_at = Utc::now();
        security_log::log_port_disabled(&device.location, &switch, &port.to_string(), disabled_at);
        // Abort is not honored once the port is down
        let _ = observer(ToggleProgress::Disabled {
            port: port.clone(),
            at: disabled_at,
        });

        tokio::time::sleep(self.settle).await;

        match self.enable(session, &port).await {
            Ok(re_enabled_at) => {
                security_log::log_port_enabled(
                    &device.location,
                    &switch,
                    &port.to_string(),
                    Some(disabled_at),
                    re_enabled_at,
                );
                let _ = observer(ToggleProgress::Enabled {
                    port: port.clone(),
                    at: re_enabled_at,
                });
                Ok(ToggleReport {
                    port,
                    disabled_at,
                    re_enabled_at,
                    overran: Instant::now() > deadline,
                })
            }
            Err(e) => {
                security_log::log_port_toggle_incomplete(
                    &device.location,
                    &switch,
                    &port.to_string(),
                    Some(disabled_at),
                    &e.to_string(),
                );
                Err(ToggleFailure {
                    port: Some(port),
                    disabled_at: Some(disabled_at),
                    re_enabled_at: None,
                    stage: ToggleStage::Enabling,
                    error: PortError::Session(e),
                })
            }
        }
    }
}
