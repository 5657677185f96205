//! Single-device reset state machine.
//!
//! `Connecting → Authenticating → Locating → Disabling → Waiting → Enabling
//! → Verifying (optional) → Succeeded | Failed`. Every invocation yields
//! exactly one [`PortResetOutcome`], and the session is closed on every path
//! that opened one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::batch::events::{EventKind, EventSink};
use crate::device::{Device, PortId};
use crate::error::{ErrorKind, SshError};
use crate::port::{PortToggler, StepControl, ToggleFailure, ToggleProgress, ToggleStage};
use crate::probe::Prober;
use crate::ssh::{SessionConnector, SwitchSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Connecting,
    Authenticating,
    Locating,
    Disabling,
    Waiting,
    Enabling,
    Verifying,
    Succeeded,
    Failed,
}

impl WorkflowState {
    /// States after which the port may have been touched.
    pub fn touches_port(self) -> bool {
        matches!(
            self,
            WorkflowState::Disabling | WorkflowState::Waiting | WorkflowState::Enabling
        )
    }
}

impl From<ToggleStage> for WorkflowState {
    fn from(stage: ToggleStage) -> Self {
        match stage {
            ToggleStage::Locating => WorkflowState::Locating,
            ToggleStage::Disabling => WorkflowState::Disabling,
            ToggleStage::Waiting => WorkflowState::Waiting,
            ToggleStage::Enabling => WorkflowState::Enabling,
        }
    }
}

/// Terminal result of one device's reset. Never partially constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortResetOutcome {
    pub device: Device,
    pub port_id: Option<PortId>,
    pub disabled_at: Option<DateTime<Utc>>,
    pub re_enabled_at: Option<DateTime<Utc>>,
    /// `None` until a verification probe has run for this device.
    pub verified: Option<bool>,
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// `Succeeded` or `Failed`.
    pub state: WorkflowState,
    /// State the workflow was in when it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_in: Option<WorkflowState>,
    pub attempts: u32,
}

impl PortResetOutcome {
    pub fn failed(
        device: Device,
        failed_in: WorkflowState,
        error: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device,
            port_id: None,
            disabled_at: None,
            re_enabled_at: None,
            verified: None,
            error: Some(error),
            message: Some(message.into()),
            state: WorkflowState::Failed,
            failed_in: Some(failed_in),
            attempts: 1,
        }
    }

    /// Outcome for a device that was never dispatched.
    pub fn cancelled(device: Device) -> Self {
        let mut outcome = Self::failed(
            device,
            WorkflowState::Connecting,
            ErrorKind::Cancelled,
            "cancelled before dispatch",
        );
        outcome.attempts = 0;
        outcome
    }

    pub fn location(&self) -> &str {
        &self.device.location
    }

    pub fn succeeded(&self) -> bool {
        self.state == WorkflowState::Succeeded
    }

    pub fn is_cancelled(&self) -> bool {
        self.error == Some(ErrorKind::Cancelled)
    }

    /// Failed before any session-level work touched the switch port.
    pub fn failed_before_port(&self) -> bool {
        matches!(
            self.failed_in,
            Some(WorkflowState::Connecting) | Some(WorkflowState::Authenticating)
        )
    }

    fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempts = attempt;
        self
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    /// Bounds connect + locate + disable + wait + enable.
    pub per_device_timeout: Duration,
    /// Probe the device right after its own reset.
    pub immediate_verification: bool,
    pub verification_count: u32,
}

enum Guarded<T> {
    Done(Result<T, SshError>),
    Deadline,
    Cancelled,
}

async fn guarded<T>(
    deadline: Instant,
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, SshError>>,
) -> Guarded<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Guarded::Cancelled,
        result = timeout_at(deadline, fut) => match result {
            Ok(result) => Guarded::Done(result),
            Err(_) => Guarded::Deadline,
        },
    }
}

pub struct ResetWorkflow<C, P> {
    connector: Arc<C>,
    prober: Arc<P>,
    toggler: Arc<PortToggler>,
    options: WorkflowOptions,
}

impl<C, P> Clone for ResetWorkflow<C, P> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            prober: self.prober.clone(),
            toggler: self.toggler.clone(),
            options: self.options.clone(),
        }
    }
}

impl<C: SessionConnector, P: Prober> ResetWorkflow<C, P> {
    pub fn new(
        connector: Arc<C>,
        prober: Arc<P>,
        toggler: Arc<PortToggler>,
        options: WorkflowOptions,
    ) -> Self {
        Self {
            connector,
            prober,
            toggler,
            options,
        }
    }

    pub fn options(&self) -> &WorkflowOptions {
        &self.options
    }

    /// Run the reset for one device. `attempt` is 1-based and only recorded.
    pub async fn run(
        &self,
        device: Device,
        attempt: u32,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> PortResetOutcome {
        let deadline = Instant::now() + self.options.per_device_timeout;
        let location = device.location.clone();
        let timeout_msg = || {
            format!(
                "per-device timeout of {}s exceeded",
                self.options.per_device_timeout.as_secs()
            )
        };

        sink.emit(EventKind::Connecting {
            location: location.clone(),
            ip: device.ssh_target(),
            attempt,
        });

        let transport = match guarded(deadline, cancel, self.connector.connect(&device)).await {
            Guarded::Done(Ok(transport)) => transport,
            Guarded::Done(Err(e)) => {
                return PortResetOutcome::failed(
                    device,
                    WorkflowState::Connecting,
                    e.kind(),
                    e.to_string(),
                )
                .with_attempt(attempt);
            }
            Guarded::Deadline => {
                return PortResetOutcome::failed(
                    device,
                    WorkflowState::Connecting,
                    ErrorKind::Timeout,
                    timeout_msg(),
                )
                .with_attempt(attempt);
            }
            Guarded::Cancelled => {
                return PortResetOutcome::failed(
                    device,
                    WorkflowState::Connecting,
                    ErrorKind::Cancelled,
                    "cancelled while connecting",
                )
                .with_attempt(attempt);
            }
        };

        let mut session =
            match guarded(deadline, cancel, self.connector.authenticate(transport)).await {
                Guarded::Done(Ok(session)) => session,
                Guarded::Done(Err(e)) => {
                    return PortResetOutcome::failed(
                        device,
                        WorkflowState::Authenticating,
                        e.kind(),
                        e.to_string(),
                    )
                    .with_attempt(attempt);
                }
                Guarded::Deadline => {
                    return PortResetOutcome::failed(
                        device,
                        WorkflowState::Authenticating,
                        ErrorKind::Timeout,
                        timeout_msg(),
                    )
                    .with_attempt(attempt);
                }
                Guarded::Cancelled => {
                    return PortResetOutcome::failed(
                        device,
                        WorkflowState::Authenticating,
                        ErrorKind::Cancelled,
                        "cancelled while authenticating",
                    )
                    .with_attempt(attempt);
                }
            };

        sink.emit(EventKind::Authenticated {
            location: location.clone(),
        });

        let toggled = self
            .toggler
            .locate_and_toggle(&mut session, &device, deadline, |progress| {
                sink.emit(progress_event(&location, &progress));
                if cancel.is_cancelled() {
                    StepControl::Abort
                } else {
                    StepControl::Continue
                }
            })
            .await;

        session.close().await;

        let mut outcome = match toggled {
            Ok(report) => {
                let mut outcome = PortResetOutcome {
                    device,
                    port_id: Some(report.port),
                    disabled_at: Some(report.disabled_at),
                    re_enabled_at: Some(report.re_enabled_at),
                    verified: None,
                    error: None,
                    message: None,
                    state: WorkflowState::Succeeded,
                    failed_in: None,
                    attempts: attempt,
                };
                if report.overran {
                    // The port is back up, but the device blew its time budget
                    outcome.state = WorkflowState::Failed;
                    outcome.failed_in = Some(WorkflowState::Enabling);
                    outcome.error = Some(ErrorKind::Timeout);
                    outcome.message = Some(timeout_msg());
                }
                outcome
            }
            Err(failure) => failure_outcome(device, failure, attempt),
        };

        if outcome.succeeded() && self.options.immediate_verification && !cancel.is_cancelled() {
            self.verify(&mut outcome, sink).await;
        }

        outcome
    }

    async fn verify(&self, outcome: &mut PortResetOutcome, sink: &EventSink) {
        let location = outcome.device.location.clone();
        match self
            .prober
            .probe(outcome.device.address, self.options.verification_count)
            .await
        {
            Ok(result) => {
                outcome.verified = Some(result.reachable);
                sink.emit(EventKind::Verified {
                    location,
                    reachable: result.reachable,
                });
            }
            Err(e) => {
                tracing::warn!(location = %location, "Immediate verification failed: {}", e);
                sink.emit(EventKind::VerificationError {
                    location,
                    error: e.kind(),
                    message: e.to_string(),
                });
            }
        }
    }
}

fn progress_event(location: &str, progress: &ToggleProgress) -> EventKind {
    match progress {
        ToggleProgress::Located(port) => EventKind::PortLocated {
            location: location.to_string(),
            port: port.clone(),
        },
        ToggleProgress::Disabled { port, at } => EventKind::PortDisabled {
            location: location.to_string(),
            port: port.clone(),
            at: *at,
        },
        ToggleProgress::Enabled { port, at } => EventKind::PortEnabled {
            location: location.to_string(),
            port: port.clone(),
            at: *at,
        },
    }
}

fn failure_outcome(device: Device, failure: ToggleFailure, attempt: u32) -> PortResetOutcome {
    PortResetOutcome {
        device,
        port_id: failure.port,
        disabled_at: failure.disabled_at,
        re_enabled_at: failure.re_enabled_at,
        verified: None,
        error: Some(failure.error.kind()),
        message: Some(failure.error.to_string()),
        state: WorkflowState::Failed,
        failed_in: Some(failure.stage.into()),
        attempts: attempt,
    }
}
