//! Down-only batches: screen every device, reset only the unreachable ones.

use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::events::{EventKind, EventSink, EventStream};
use super::orchestrator::{BatchOrchestrator, open_stream};
use super::run::{BatchMode, BatchPhase, BatchRun, ScreeningRecord};
use crate::device::Device;
use crate::error::ProbeError;
use crate::probe::{ProbeResult, Prober};
use crate::ssh::SessionConnector;

/// What a screening probe failure means for candidacy.
///
/// Applies to `ProbeUnavailable` and `AddressInvalid`. Under `AssumeDown` a
/// broken probe never exempts a device from remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreeningPolicy {
    #[default]
    AssumeDown,
    AssumeUp,
}

impl ScreeningPolicy {
    pub fn classify(self, device: &Device, result: Result<ProbeResult, ProbeError>) -> ScreeningRecord {
        match result {
            Ok(result) => ScreeningRecord {
                location: device.location.clone(),
                ip: device.address,
                reachable: Some(result.reachable),
                error: None,
                message: None,
                candidate: !result.reachable,
                assumed: false,
            },
            Err(e) => ScreeningRecord {
                location: device.location.clone(),
                ip: device.address,
                reachable: None,
                error: Some(e.kind()),
                message: Some(e.to_string()),
                candidate: self == ScreeningPolicy::AssumeDown,
                assumed: true,
            },
        }
    }
}

impl<C: SessionConnector, P: Prober> BatchOrchestrator<C, P> {
    /// Screen `devices`, then reset and verify only those found down.
    ///
    /// An empty candidate set ends the run with a successful summary and no
    /// resets.
    pub fn run_down_only(&self, devices: Vec<Device>) -> EventStream {
        let (sink, stream, cancel) = open_stream();
        let this = self.clone();
        tokio::spawn(async move {
            let mut run = BatchRun::new(sink.run_id(), BatchMode::DownOnly, devices);
            this.start(&run, &sink);
            this.enter_phase(&mut run, &sink, BatchPhase::Screening);

            let records = this.screen(run.devices().to_vec(), &sink, &cancel).await;
            run.narrow_to_candidates(records);

            if run.devices().is_empty() {
                tracing::info!(run_id = %run.run_id(), "No devices need a reset");
            } else {
                tracing::info!(
                    run_id = %run.run_id(),
                    candidates = run.devices().len(),
                    "Screening selected devices for reset"
                );
                this.reset_and_verify(&mut run, &sink, &cancel).await;
            }
            this.finish(&mut run, &sink);
        });
        stream
    }

    async fn screen(
        &self,
        devices: Vec<Device>,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Vec<ScreeningRecord> {
        let count = self.config().screening_count;
        let policy = self.config().screening_policy;

        stream::iter(devices)
            .map(|device| {
                let prober = self.prober().clone();
                let sink = sink.clone();
                async move {
                    let result = prober.probe(device.address, count).await;
                    if let Err(e) = &result {
                        tracing::warn!(
                            location = %device.location,
                            ?policy,
                            "Screening probe failed: {}",
                            e
                        );
                    }
                    let record = policy.classify(&device, result);
                    sink.emit(EventKind::Screened(record.clone()));
                    record
                }
            })
            .buffered(self.config().parallelism_limit.max(1))
            .take_until(cancel.cancelled())
            .collect()
            .await
    }
}
