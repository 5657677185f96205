//! Common test utilities: an in-memory switch fleet and a scripted prober.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::{self, Stream};

use poe_reset::batch::{BatchConfig, BatchEvent, BatchOrchestrator, EventKind, ScreeningPolicy};
use poe_reset::device::Device;
use poe_reset::error::{ProbeError, SshError};
use poe_reset::port::PortToggler;
use poe_reset::probe::{ProbeEvent, ProbeResult, ProbeStream, Prober};
use poe_reset::ssh::{RetryPolicy, SessionConnector, SwitchSession};

/// How a scripted connect attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    Refused,
    HostKeyChanged,
}

/// Behaviour of one switch, keyed by device location.
#[derive(Debug, Clone, Default)]
pub struct SwitchScript {
    /// Fail this many connects before succeeding.
    pub connect_failures: u32,
    pub connect_failure: Option<ConnectFailure>,
    /// Delay before a connect resolves.
    pub connect_delay: Duration,
    pub auth_fails: bool,
    /// `show interfaces descriptions` output. Defaults to a single port
    /// `ge-0/0/7` described with the location name.
    pub descriptions: Option<String>,
    pub disable_rejected: bool,
    pub enable_rejected: bool,
    /// Delay applied to every command, to keep sessions open for a while.
    pub command_delay: Duration,
}

impl SwitchScript {
    pub fn refusing() -> Self {
        Self {
            connect_failures: u32::MAX,
            connect_failure: Some(ConnectFailure::Refused),
            ..Self::default()
        }
    }

    pub fn flaky(failures: u32) -> Self {
        Self {
            connect_failures: failures,
            connect_failure: Some(ConnectFailure::Refused),
            ..Self::default()
        }
    }
}

pub fn descriptions_for(location: &str, port: u16) -> String {
    format!(
        "Interface       Admin Link Description\n\
         ge-0/0/{port}        up    up   PoE {location}\n\
         ge-0/0/47       up    up   uplink core\n"
    )
}

/// Session counters shared by every fake session of one connector.
#[derive(Debug, Default)]
pub struct SessionStats {
    open: AtomicUsize,
    peak: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    commands: Mutex<Vec<(String, String)>>,
}

impl SessionStats {
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Commands sent to `location`, in order.
    pub fn commands_for(&self, location: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(loc, _)| loc == location)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    fn record(&self, location: &str, command: &str) {
        self.commands
            .lock()
            .unwrap()
            .push((location.to_string(), command.to_string()));
    }

    fn session_opened(&self) {
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn session_closed(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct FakeConnector {
    scripts: HashMap<String, SwitchScript>,
    default_script: SwitchScript,
    connects: Mutex<HashMap<String, u32>>,
    pub stats: Arc<SessionStats>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, script: SwitchScript) -> Self {
        self.default_script = script;
        self
    }

    pub fn script(mut self, location: &str, script: SwitchScript) -> Self {
        self.scripts.insert(location.to_string(), script);
        self
    }

    pub fn connect_attempts(&self, location: &str) -> u32 {
        self.connects
            .lock()
            .unwrap()
            .get(location)
            .copied()
            .unwrap_or(0)
    }

    fn script_for(&self, location: &str) -> SwitchScript {
        self.scripts
            .get(location)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }
}

pub struct PendingFake {
    location: String,
    script: SwitchScript,
}

impl SessionConnector for FakeConnector {
    type Transport = PendingFake;
    type Session = FakeSession;

    async fn connect(&self, device: &Device) -> Result<PendingFake, SshError> {
        let script = self.script_for(&device.location);
        let attempt = {
            let mut connects = self.connects.lock().unwrap();
            let count = connects.entry(device.location.clone()).or_insert(0);
            *count += 1;
            *count
        };

        tokio::time::sleep(script.connect_delay).await;

        if attempt <= script.connect_failures {
            return Err(match script.connect_failure {
                Some(ConnectFailure::HostKeyChanged) => {
                    SshError::HostKeyVerification("key changed".to_string())
                }
                _ => SshError::ConnectionFailed {
                    host: device.ssh_target().to_string(),
                    port: 22,
                    reason: "connection refused".to_string(),
                },
            });
        }

        Ok(PendingFake {
            location: device.location.clone(),
            script,
        })
    }

    async fn authenticate(&self, transport: PendingFake) -> Result<FakeSession, SshError> {
        if transport.script.auth_fails {
            return Err(SshError::AuthenticationFailed(
                "permission denied".to_string(),
            ));
        }
        self.stats.session_opened();
        Ok(FakeSession {
            location: transport.location,
            script: transport.script,
            stats: self.stats.clone(),
        })
    }
}

pub struct FakeSession {
    location: String,
    script: SwitchScript,
    stats: Arc<SessionStats>,
}

impl SwitchSession for FakeSession {
    async fn query(&mut self, command: &str) -> Result<String, SshError> {
        self.stats.record(&self.location, command);
        tokio::time::sleep(self.script.command_delay).await;
        if command == "show interfaces descriptions" {
            Ok(self
                .script
                .descriptions
                .clone()
                .unwrap_or_else(|| descriptions_for(&self.location, 7)))
        } else {
            Ok(format!("{}\n", command))
        }
    }

    async fn configure(&mut self, commands: &[String]) -> Result<String, SshError> {
        for command in commands {
            self.stats.record(&self.location, command);
        }
        tokio::time::sleep(self.script.command_delay).await;

        let is_disable = commands.iter().any(|c| c.starts_with("set poe interface"));
        let is_enable = commands.iter().any(|c| c.starts_with("delete poe interface"));
        if (is_disable && self.script.disable_rejected) || (is_enable && self.script.enable_rejected)
        {
            return Err(SshError::CommandRejected {
                command: commands.last().cloned().unwrap_or_default(),
                output: "error: configuration database locked".to_string(),
            });
        }
        Ok("[edit]\ncommit complete\nExiting configuration mode\n".to_string())
    }

    async fn close(self) {
        self.stats.session_closed();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeBehavior {
    Reachable,
    Unreachable,
    Unavailable,
    Unresolvable,
}

/// Prober answering from a fixed table. Unlisted addresses are reachable.
#[derive(Debug, Default)]
pub struct FakeProber {
    behavior: HashMap<IpAddr, ProbeBehavior>,
    /// Delay before any output, for every address.
    delay: Duration,
    calls: Mutex<HashMap<IpAddr, u32>>,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, address: IpAddr, behavior: ProbeBehavior) -> Self {
        self.behavior.insert(address, behavior);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self, address: IpAddr) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

impl Prober for FakeProber {
    fn probe_stream(&self, address: IpAddr, count: u32) -> ProbeStream {
        *self.calls.lock().unwrap().entry(address).or_insert(0) += 1;
        let behavior = self
            .behavior
            .get(&address)
            .copied()
            .unwrap_or(ProbeBehavior::Reachable);

        let events: Vec<Result<ProbeEvent, ProbeError>> = match behavior {
            ProbeBehavior::Unavailable => {
                vec![Err(ProbeError::Unavailable("ping not installed".to_string()))]
            }
            ProbeBehavior::Unresolvable => {
                vec![Err(ProbeError::AddressInvalid(address.to_string()))]
            }
            ProbeBehavior::Reachable | ProbeBehavior::Unreachable => {
                let reachable = behavior == ProbeBehavior::Reachable;
                let lines: Vec<String> = (1..=count)
                    .map(|seq| {
                        if reachable {
                            format!("64 bytes from {address}: icmp_seq={seq} ttl=64 time=0.4 ms")
                        } else {
                            format!("Request timeout for icmp_seq {seq}")
                        }
                    })
                    .collect();
                let result = ProbeResult {
                    address,
                    reachable,
                    raw_lines: lines.clone(),
                    latency_samples: if reachable {
                        vec![Duration::from_micros(400); count as usize]
                    } else {
                        Vec::new()
                    },
                };
                lines
                    .into_iter()
                    .map(|line| Ok(ProbeEvent::Line(line)))
                    .chain(std::iter::once(Ok(ProbeEvent::Finished(result))))
                    .collect()
            }
        };

        stream::once(tokio::time::sleep(self.delay))
            .flat_map(move |_| stream::iter(events.clone()))
            .boxed()
    }
}

pub fn device(location: &str, last_octet: u8) -> Device {
    Device::new(location, IpAddr::from([10, 0, 0, last_octet]))
}

pub fn devices(count: u8) -> Vec<Device> {
    (1..=count)
        .map(|i| device(&format!("Room-{i}"), i))
        .collect()
}

/// Batch settings with no waiting anywhere.
pub fn fast_config() -> BatchConfig {
    BatchConfig {
        parallelism_limit: 8,
        verification_delay: Duration::ZERO,
        per_device_timeout: Duration::from_secs(5),
        immediate_verification: false,
        verification_count: 4,
        connect_retry: RetryPolicy::once(),
        screening_count: 4,
        screening_policy: ScreeningPolicy::AssumeDown,
    }
}

pub fn toggler(settle: Duration) -> Arc<PortToggler> {
    Arc::new(PortToggler::new(settle, RetryPolicy::once()))
}

pub fn orchestrator(
    connector: Arc<FakeConnector>,
    prober: Arc<FakeProber>,
    config: BatchConfig,
) -> BatchOrchestrator<FakeConnector, FakeProber> {
    BatchOrchestrator::new(connector, prober, toggler(Duration::ZERO), config)
}

pub async fn collect(stream: impl Stream<Item = BatchEvent>) -> Vec<BatchEvent> {
    tokio::time::timeout(Duration::from_secs(30), stream.collect::<Vec<_>>())
        .await
        .expect("batch did not finish")
}

pub fn summary_of(events: &[BatchEvent]) -> &poe_reset::batch::BatchSummary {
    match &events.last().expect("no events").kind {
        EventKind::Summary(summary) => summary,
        other => panic!("last event is not a summary: {:?}", other),
    }
}

/// Position of the first event matching `pred`.
pub fn position(events: &[BatchEvent], pred: impl Fn(&EventKind) -> bool) -> Option<usize> {
    events.iter().position(|e| pred(&e.kind))
}
