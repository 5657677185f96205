//! Bounded-parallel batch reset with a deferred verification pass.

use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::down_only::ScreeningPolicy;
use super::events::{EventKind, EventSink, EventStream};
use super::run::{BatchMode, BatchPhase, BatchRun};
use crate::config::AppConfig;
use crate::device::Device;
use crate::error::ErrorKind;
use crate::port::PortToggler;
use crate::probe::{ProbeEvent, Prober};
use crate::ssh::{RetryPolicy, SessionConnector};
use crate::workflow::{PortResetOutcome, ResetWorkflow, WorkflowOptions};

/// Immutable batch parameters, fixed when the orchestrator is built.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub parallelism_limit: usize,
    pub verification_delay: Duration,
    pub per_device_timeout: Duration,
    pub immediate_verification: bool,
    /// Probes per device in the verification pass.
    pub verification_count: u32,
    /// Reconnect policy for failures before the port was touched.
    pub connect_retry: RetryPolicy,
    pub screening_count: u32,
    pub screening_policy: ScreeningPolicy,
}

impl BatchConfig {
    pub fn from_settings(config: &AppConfig) -> Self {
        Self {
            parallelism_limit: config.batch.parallelism_limit.max(1),
            verification_delay: Duration::from_secs(config.batch.verification_delay_secs),
            per_device_timeout: Duration::from_secs(config.batch.per_device_timeout_secs),
            immediate_verification: config.batch.immediate_verification,
            verification_count: config.probe.screening_count,
            connect_retry: RetryPolicy::for_connects(&config.reset),
            screening_count: config.probe.screening_count,
            screening_policy: config.batch.screening_policy,
        }
    }

    pub fn with_per_device_timeout(mut self, timeout: Duration) -> Self {
        self.per_device_timeout = timeout;
        self
    }

    pub(crate) fn workflow_options(&self) -> WorkflowOptions {
        WorkflowOptions {
            per_device_timeout: self.per_device_timeout,
            immediate_verification: self.immediate_verification,
            verification_count: self.verification_count,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from_settings(&AppConfig::default())
    }
}

pub struct BatchOrchestrator<C, P> {
    connector: Arc<C>,
    prober: Arc<P>,
    toggler: Arc<PortToggler>,
    config: BatchConfig,
}

impl<C, P> Clone for BatchOrchestrator<C, P> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            prober: self.prober.clone(),
            toggler: self.toggler.clone(),
            config: self.config.clone(),
        }
    }
}

impl<C: SessionConnector, P: Prober> BatchOrchestrator<C, P> {
    pub fn new(
        connector: Arc<C>,
        prober: Arc<P>,
        toggler: Arc<PortToggler>,
        config: BatchConfig,
    ) -> Self {
        Self {
            connector,
            prober,
            toggler,
            config,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Copy of this orchestrator with a different per-device timeout.
    pub fn with_per_device_timeout(&self, timeout: Duration) -> Self {
        let mut this = self.clone();
        this.config.per_device_timeout = timeout;
        this
    }

    pub(super) fn prober(&self) -> &Arc<P> {
        &self.prober
    }

    /// Reset every device and stream progress.
    ///
    /// The run executes on its own task; the returned stream ends after the
    /// summary event. Dropping the stream cancels the run.
    pub fn run_batch(&self, devices: Vec<Device>) -> EventStream {
        let (sink, stream, cancel) = open_stream();
        let this = self.clone();
        tokio::spawn(async move {
            let mut run = BatchRun::new(sink.run_id(), BatchMode::All, devices);
            this.start(&run, &sink);
            this.reset_and_verify(&mut run, &sink, &cancel).await;
            this.finish(&mut run, &sink);
        });
        stream
    }

    pub(super) fn start(&self, run: &BatchRun, sink: &EventSink) {
        tracing::info!(
            run_id = %run.run_id(),
            mode = ?run.mode(),
            devices = run.devices().len(),
            parallelism = self.config.parallelism_limit,
            "Batch started"
        );
        sink.emit(EventKind::Start {
            mode: run.mode(),
            devices: run.devices().iter().map(|d| d.location.clone()).collect(),
        });
    }

    pub(super) fn enter_phase(&self, run: &mut BatchRun, sink: &EventSink, phase: BatchPhase) {
        if run.set_phase(phase) {
            tracing::debug!(run_id = %run.run_id(), ?phase, "Batch phase");
            sink.emit(EventKind::Phase { phase });
        }
    }

    pub(super) async fn reset_and_verify(
        &self,
        run: &mut BatchRun,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) {
        self.enter_phase(run, sink, BatchPhase::Resetting);
        self.reset_phase(run, sink, cancel).await;
        self.verification_phase(run, sink, cancel).await;
    }

    pub(super) fn finish(&self, run: &mut BatchRun, sink: &EventSink) {
        self.enter_phase(run, sink, BatchPhase::Done);
        let summary = run.summary();
        tracing::info!(
            run_id = %run.run_id(),
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Batch finished"
        );
        sink.emit(EventKind::Summary(summary));
    }

    async fn reset_phase(&self, run: &mut BatchRun, sink: &EventSink, cancel: &CancellationToken) {
        let gate = Arc::new(Semaphore::new(self.config.parallelism_limit.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel::<PortResetOutcome>();
        let workflow = ResetWorkflow::new(
            self.connector.clone(),
            self.prober.clone(),
            self.toggler.clone(),
            self.config.workflow_options(),
        );

        // Admission is sequential, so queued devices start in submission order
        for device in run.devices().to_vec() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(run_id = %run.run_id(), "Cancelled; no further devices dispatched");
                    break;
                }
                permit = gate.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let workflow = workflow.clone();
            let retry = self.config.connect_retry;
            let sink = sink.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = reset_device(&workflow, retry, device, &sink, &cancel).await;
                drop(permit);
                let _ = tx.send(outcome);
            });
        }
        drop(tx);

        while let Some(outcome) = rx.recv().await {
            run.record(outcome);
        }

        for outcome in run.fill_missing() {
            emit_terminal(sink, &outcome);
        }
    }

    async fn verification_phase(
        &self,
        run: &mut BatchRun,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) {
        if cancel.is_cancelled() {
            tracing::info!(run_id = %run.run_id(), "Cancelled; verification skipped");
            return;
        }
        let targets = run.verification_targets();
        if targets.is_empty() {
            return;
        }

        self.enter_phase(run, sink, BatchPhase::AwaitingVerificationDelay);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(run_id = %run.run_id(), "Cancelled during verification delay");
                return;
            }
            _ = sleep(self.config.verification_delay) => {}
        }

        self.enter_phase(run, sink, BatchPhase::Verifying);
        let count = self.config.verification_count;
        let results: Vec<(String, Option<bool>)> = stream::iter(targets)
            .map(|device| {
                let prober = self.prober.clone();
                let sink = sink.clone();
                async move {
                    let reachable = verify_device(prober.as_ref(), &device, count, &sink).await;
                    (device.location, reachable)
                }
            })
            .buffer_unordered(self.config.parallelism_limit.max(1))
            .take_until(cancel.cancelled())
            .collect()
            .await;

        for (location, reachable) in results {
            if let Some(reachable) = reachable {
                run.set_verified(&location, reachable);
            }
        }
    }
}

/// Fresh run id, channel and cancellation token for one batch.
pub(super) fn open_stream() -> (EventSink, EventStream, CancellationToken) {
    let run_id = Uuid::new_v4();
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let stream = EventStream::new(run_id, rx, cancel.clone());
    (EventSink::new(run_id, tx), stream, cancel)
}

/// One device's workflow plus reconnects for failures before the port was touched.
async fn reset_device<C: SessionConnector, P: Prober>(
    workflow: &ResetWorkflow<C, P>,
    retry: RetryPolicy,
    device: Device,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> PortResetOutcome {
    let mut attempt = 0u32;
    let outcome = loop {
        let outcome = workflow.run(device.clone(), attempt + 1, sink, cancel).await;
        let retryable = outcome.failed_before_port()
            && outcome.error.is_some_and(ErrorKind::is_retryable_connect)
            && retry.allows_retry_after(attempt)
            && !cancel.is_cancelled();
        if !retryable {
            break outcome;
        }

        let delay = retry.delay_with_jitter(attempt);
        tracing::info!(
            location = %device.location,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Retrying connection: {}",
            outcome.message.as_deref().unwrap_or("failed")
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break outcome,
            _ = sleep(delay) => {}
        }
        attempt += 1;
    };

    emit_terminal(sink, &outcome);
    outcome
}

fn emit_terminal(sink: &EventSink, outcome: &PortResetOutcome) {
    let location = outcome.location().to_string();
    match (&outcome.port_id, outcome.succeeded()) {
        (Some(port), true) => {
            tracing::info!(location = %location, port = %port, "Device reset");
            sink.emit(EventKind::DeviceReset {
                location,
                port: port.clone(),
            });
        }
        _ => {
            let error = outcome.error.unwrap_or(ErrorKind::Cancelled);
            let message = outcome
                .message
                .clone()
                .unwrap_or_else(|| error.to_string());
            tracing::warn!(location = %location, error = %error, "Device failed: {}", message);
            sink.emit(EventKind::DeviceFailed {
                location,
                error,
                message,
            });
        }
    }
}

/// Probe one device, streaming its lines. `None` when the probe itself failed.
async fn verify_device<P: Prober>(
    prober: &P,
    device: &Device,
    count: u32,
    sink: &EventSink,
) -> Option<bool> {
    let location = device.location.clone();
    let mut probe = prober.probe_stream(device.address, count);

    while let Some(event) = probe.next().await {
        match event {
            Ok(ProbeEvent::Line(line)) => sink.emit(EventKind::ProbeLine {
                location: location.clone(),
                line,
            }),
            Ok(ProbeEvent::Finished(result)) => {
                tracing::info!(location = %location, reachable = result.reachable, "Verified");
                sink.emit(EventKind::Verified {
                    location,
                    reachable: result.reachable,
                });
                return Some(result.reachable);
            }
            Err(e) => {
                tracing::warn!(location = %location, "Verification probe failed: {}", e);
                sink.emit(EventKind::VerificationError {
                    location,
                    error: e.kind(),
                    message: e.to_string(),
                });
                return None;
            }
        }
    }

    sink.emit(EventKind::VerificationError {
        location,
        error: ErrorKind::ProbeUnavailable,
        message: "probe ended without a result".to_string(),
    });
    None
}
