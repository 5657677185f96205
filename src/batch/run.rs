//! Per-invocation batch state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::BatchSummary;
use crate::device::Device;
use crate::error::ErrorKind;
use crate::workflow::PortResetOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    All,
    DownOnly,
}

/// Batch lifecycle. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    Screening,
    Resetting,
    AwaitingVerificationDelay,
    Verifying,
    Done,
}

/// One device's down-only screening result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningRecord {
    pub location: String,
    pub ip: IpAddr,
    /// `None` when the probe itself failed.
    pub reachable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Forwarded to the reset phase.
    pub candidate: bool,
    /// Candidacy came from the screening policy rather than a probe answer.
    #[serde(default)]
    pub assumed: bool,
}

impl ScreeningRecord {
    /// Record for a device the run was cancelled before probing.
    pub fn unscreened(device: &Device) -> Self {
        Self {
            location: device.location.clone(),
            ip: device.address,
            reachable: None,
            error: Some(ErrorKind::Cancelled),
            message: Some("cancelled before screening".to_string()),
            candidate: false,
            assumed: false,
        }
    }
}

/// Drop repeated locations, keeping the first occurrence.
pub fn dedupe_devices(devices: Vec<Device>) -> Vec<Device> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|device| {
            let fresh = seen.insert(device.location.clone());
            if !fresh {
                tracing::warn!(location = %device.location, "Duplicate device dropped from batch");
            }
            fresh
        })
        .collect()
}

#[derive(Debug)]
pub struct BatchRun {
    run_id: Uuid,
    mode: BatchMode,
    started_at: DateTime<Utc>,
    phase: BatchPhase,
    devices: Vec<Device>,
    outcomes: BTreeMap<String, PortResetOutcome>,
    screening: Vec<ScreeningRecord>,
}

impl BatchRun {
    pub fn new(run_id: Uuid, mode: BatchMode, devices: Vec<Device>) -> Self {
        let phase = match mode {
            BatchMode::All => BatchPhase::Resetting,
            BatchMode::DownOnly => BatchPhase::Screening,
        };
        Self {
            run_id,
            mode,
            started_at: Utc::now(),
            phase,
            devices: dedupe_devices(devices),
            outcomes: BTreeMap::new(),
            screening: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn mode(&self) -> BatchMode {
        self.mode
    }

    pub fn phase(&self) -> BatchPhase {
        self.phase
    }

    /// Devices in the reset set, in submission order.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn outcomes(&self) -> &BTreeMap<String, PortResetOutcome> {
        &self.outcomes
    }

    pub fn screening(&self) -> &[ScreeningRecord] {
        &self.screening
    }

    /// Advance to `phase`. Returns false if that would move backwards.
    pub fn set_phase(&mut self, phase: BatchPhase) -> bool {
        if phase < self.phase {
            tracing::warn!(run_id = %self.run_id, from = ?self.phase, to = ?phase, "Ignoring backwards phase change");
            return false;
        }
        self.phase = phase;
        true
    }

    /// Keep only screened candidates in the reset set.
    ///
    /// Every device keeps a screening record in submission order; devices
    /// with no record were never probed and are recorded as cancelled.
    pub fn narrow_to_candidates(&mut self, records: Vec<ScreeningRecord>) {
        let mut by_location: HashMap<String, ScreeningRecord> = records
            .into_iter()
            .map(|r| (r.location.clone(), r))
            .collect();
        let screening: Vec<ScreeningRecord> = self
            .devices
            .iter()
            .map(|device| {
                by_location
                    .remove(&device.location)
                    .unwrap_or_else(|| ScreeningRecord::unscreened(device))
            })
            .collect();

        let unscreened = screening
            .iter()
            .filter(|r| r.error == Some(ErrorKind::Cancelled))
            .count();
        if unscreened > 0 {
            tracing::info!(run_id = %self.run_id, unscreened, "Screening cut short by cancellation");
        }

        self.devices.retain(|device| {
            screening
                .iter()
                .any(|r| r.candidate && r.location == device.location)
        });
        self.screening = screening;
    }

    /// Store a terminal outcome. The first outcome for a device wins.
    pub fn record(&mut self, outcome: PortResetOutcome) -> bool {
        let location = outcome.location().to_string();
        if !self.devices.iter().any(|d| d.location == location) {
            tracing::warn!(location = %location, "Outcome for a device outside the batch");
            return false;
        }
        if self.outcomes.contains_key(&location) {
            tracing::warn!(location = %location, "Duplicate outcome ignored");
            return false;
        }
        self.outcomes.insert(location, outcome);
        true
    }

    pub fn set_verified(&mut self, location: &str, reachable: bool) {
        if let Some(outcome) = self.outcomes.get_mut(location) {
            outcome.verified = Some(reachable);
        }
    }

    /// Give every device without an outcome a cancelled one.
    pub fn fill_missing(&mut self) -> Vec<PortResetOutcome> {
        let missing: Vec<PortResetOutcome> = self
            .devices
            .iter()
            .filter(|d| !self.outcomes.contains_key(&d.location))
            .map(|d| PortResetOutcome::cancelled(d.clone()))
            .collect();
        for outcome in &missing {
            self.outcomes
                .insert(outcome.location().to_string(), outcome.clone());
        }
        missing
    }

    /// Successfully reset devices still awaiting a verification probe.
    pub fn verification_targets(&self) -> Vec<Device> {
        self.devices
            .iter()
            .filter(|d| {
                self.outcomes
                    .get(&d.location)
                    .is_some_and(|o| o.succeeded() && o.verified.is_none())
            })
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> BatchSummary {
        let outcomes = self.outcomes.clone();
        let succeeded = outcomes.values().filter(|o| o.succeeded()).count();
        let cancelled = outcomes.values().filter(|o| o.is_cancelled()).count();
        let failed = outcomes.len() - succeeded - cancelled;
        let verified_reachable = outcomes
            .values()
            .filter(|o| o.verified == Some(true))
            .count();
        let verified_unreachable = outcomes
            .values()
            .filter(|o| o.verified == Some(false))
            .count();
        let total = outcomes.len();

        BatchSummary {
            mode: self.mode,
            started_at: self.started_at,
            finished_at: Utc::now(),
            reset_locations: self.devices.iter().map(|d| d.location.clone()).collect(),
            outcomes,
            screening: self.screening.clone(),
            total,
            succeeded,
            failed,
            cancelled,
            verified_reachable,
            verified_unreachable,
            success: total == 0 || succeeded > 0,
        }
    }
}
