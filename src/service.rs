//! Operations exposed to a routing layer or the CLI.
//!
//! Every operation distinguishes a failure to start (`success: false` with no
//! per-device payload) from a device that was attempted and failed, whose
//! details travel in `data`.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::batch::events::sse_frame;
use crate::batch::{BatchConfig, BatchOrchestrator, EventSink, EventStream};
use crate::config::{AppConfig, DeviceDirectory};
use crate::device::Device;
use crate::error::{DirectoryError, ErrorKind};
use crate::port::PortToggler;
use crate::probe::{ProbeEvent, Prober};
use crate::ssh::{SessionConnector, analyze_ssh_error};
use crate::validation::{
    validate_ip, validate_location, validate_probe_count, validate_timeout_secs,
};
use crate::workflow::{ResetWorkflow, WorkflowOptions};

const SERVICE_NAME: &str = "PoE Reset Service";

/// Coarse status hint for a transport layer. Not part of the JSON body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStatus {
    Ok,
    BadRequest,
    NotFound,
    /// The operation started and the device failed.
    DeviceFailed,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip, default = "default_status")]
    pub status: ApiStatus,
}

fn default_status() -> ApiStatus {
    ApiStatus::Ok
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            status: ApiStatus::Ok,
        }
    }

    pub fn failure(status: ApiStatus, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            status,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    fn from_directory_error(err: DirectoryError) -> Self {
        match err {
            DirectoryError::NotFound(location) => {
                Self::failure(ApiStatus::NotFound, format!("Location \"{}\" not found", location))
            }
            other => Self::failure(ApiStatus::Internal, other.to_string()),
        }
    }
}

/// Live ping output for one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PingEvent {
    Start {
        message: String,
        location: String,
        target_ip: IpAddr,
        timestamp: DateTime<Utc>,
    },
    PingLine {
        data: String,
        location: String,
        target_ip: IpAddr,
        timestamp: DateTime<Utc>,
    },
    Complete {
        message: String,
        location: String,
        target_ip: IpAddr,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_ip: Option<IpAddr>,
        timestamp: DateTime<Utc>,
    },
}

impl PingEvent {
    pub fn to_sse_frame(&self) -> String {
        sse_frame(self)
    }

    /// Terminal events are `complete` and `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PingEvent::Complete { .. } | PingEvent::Error { .. })
    }
}

/// Index-aligned directory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpAndLocation {
    #[serde(rename = "Location")]
    pub locations: Vec<String>,
    #[serde(rename = "IP")]
    pub ips: Vec<IpAddr>,
}

pub struct ResetService<C, P, D> {
    config: Arc<AppConfig>,
    directory: Arc<D>,
    prober: Arc<P>,
    /// Absent when no switch credentials are configured.
    connector: Option<Arc<C>>,
    toggler: Arc<PortToggler>,
    started_at: DateTime<Utc>,
}

impl<C, P, D> ResetService<C, P, D>
where
    C: SessionConnector,
    P: Prober,
    D: DeviceDirectory,
{
    pub fn new(config: Arc<AppConfig>, directory: Arc<D>, prober: Arc<P>) -> Self {
        let toggler = Arc::new(PortToggler::from_settings(&config.reset));
        Self {
            config,
            directory,
            prober,
            connector: None,
            toggler,
            started_at: Utc::now(),
        }
    }

    pub fn with_connector(mut self, connector: Arc<C>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn health(&self) -> ApiResponse {
        ApiResponse::ok(
            "API is healthy and running",
            json!({"status": "ok", "service": SERVICE_NAME}),
        )
    }

    /// System identity, build version and uptime of this service instance.
    pub fn status(&self) -> ApiResponse {
        let uptime_secs = (Utc::now() - self.started_at).num_seconds().max(0);
        ApiResponse::ok(
            "Service status",
            json!({
                "system": SERVICE_NAME,
                "version": env!("CARGO_PKG_VERSION"),
                "started_at": self.started_at.to_rfc3339(),
                "uptime_secs": uptime_secs,
                "devices": self.directory.list_all().len(),
                "credentials_configured": self.connector.is_some(),
            }),
        )
    }

    fn connector(&self) -> Result<Arc<C>, ApiResponse> {
        self.connector.clone().ok_or_else(|| {
            ApiResponse::failure(
                ApiStatus::Internal,
                "SSH credentials not configured. Please set SSH_USERNAME and SSH_PASSWORD",
            )
        })
    }

    fn orchestrator(&self) -> Result<BatchOrchestrator<C, P>, ApiResponse> {
        Ok(BatchOrchestrator::new(
            self.connector()?,
            self.prober.clone(),
            self.toggler.clone(),
            BatchConfig::from_settings(&self.config),
        ))
    }

    /// Budget for a single interactive reset.
    ///
    /// `timeout` covers session setup; each configuration commit and the
    /// settle delay get their own allowance on top.
    fn single_reset_budget(&self, timeout_secs: u64) -> Duration {
        Duration::from_secs(timeout_secs)
            + self.toggler.settle()
            + self.config.ssh.command_timeout() * 2
    }

    /// Reset the PoE port serving one location.
    pub async fn reset_port(&self, location: &str, timeout: Option<u64>) -> ApiResponse {
        let location = match validate_location(location) {
            Ok(location) => location,
            Err(e) => return ApiResponse::failure(ApiStatus::BadRequest, e.message),
        };
        let timeout_secs = match validate_timeout_secs(timeout) {
            Ok(secs) => secs,
            Err(_) => {
                return ApiResponse::failure(
                    ApiStatus::BadRequest,
                    "Invalid timeout value. Must be an integer between 1 and 300 seconds",
                );
            }
        };
        let device = match self.directory.resolve(&location) {
            Ok(device) => device,
            Err(e) => return ApiResponse::from_directory_error(e),
        };
        let connector = match self.connector() {
            Ok(connector) => connector,
            Err(response) => return response,
        };

        let workflow = ResetWorkflow::new(
            connector,
            self.prober.clone(),
            self.toggler.clone(),
            WorkflowOptions {
                per_device_timeout: self.single_reset_budget(timeout_secs),
                immediate_verification: false,
                verification_count: self.config.probe.screening_count,
            },
        );
        let outcome = workflow
            .run(
                device.clone(),
                1,
                &EventSink::detached(),
                &CancellationToken::new(),
            )
            .await;

        if let (true, Some(port)) = (outcome.succeeded(), &outcome.port_id) {
            tracing::info!(location = %location, port = %port, "Single port reset completed");
            return ApiResponse::ok(
                format!("Port {} reset successfully for {}", port, location),
                json!({
                    "locName": location,
                    "port": port.port_number(),
                    "status": "reset",
                }),
            );
        }

        let error = outcome.error.unwrap_or(ErrorKind::Timeout);
        let message = outcome
            .message
            .clone()
            .unwrap_or_else(|| error.to_string());
        tracing::warn!(location = %location, error = %error, "Single port reset failed: {}", message);

        let mut data = json!({
            "locName": location,
            "port": outcome.port_id.as_ref().map(|p| p.port_number()),
            "status": "reset_failed",
            "error_type": error,
            "failed_in": outcome.failed_in,
            "timeout": timeout_secs,
            "outcome": outcome,
        });
        if connection_class(error) && outcome.failed_before_port() {
            let diagnostics =
                analyze_ssh_error(&device.ssh_target().to_string(), self.config.ssh.port).await;
            data["diagnostics"] = json!(diagnostics);
        }

        ApiResponse::failure(
            ApiStatus::DeviceFailed,
            format!("Port reset failed for {}: {}", location, message),
        )
        .with_data(data)
    }

    fn batch_timeout(&self, timeout: Option<u64>) -> Result<Option<Duration>, ApiResponse> {
        match timeout {
            None => Ok(None),
            Some(_) => validate_timeout_secs(timeout)
                .map(|secs| Some(Duration::from_secs(secs)))
                .map_err(|e| ApiResponse::failure(ApiStatus::BadRequest, e.message)),
        }
    }

    /// Reset every directory device. `timeout` overrides the per-device budget.
    pub fn reset_all_locations_sse(&self, timeout: Option<u64>) -> Result<EventStream, ApiResponse> {
        let override_timeout = self.batch_timeout(timeout)?;
        let mut orchestrator = self.orchestrator()?;
        if let Some(timeout) = override_timeout {
            orchestrator = orchestrator.with_per_device_timeout(timeout);
        }
        Ok(orchestrator.run_batch(self.directory.list_all()))
    }

    /// Screen every directory device and reset only the unreachable ones.
    pub fn reset_down_port_only_sse(
        &self,
        timeout: Option<u64>,
    ) -> Result<EventStream, ApiResponse> {
        let override_timeout = self.batch_timeout(timeout)?;
        let mut orchestrator = self.orchestrator()?;
        if let Some(timeout) = override_timeout {
            orchestrator = orchestrator.with_per_device_timeout(timeout);
        }
        Ok(orchestrator.run_down_only(self.directory.list_all()))
    }

    /// Live ping of one location. Always ends with `complete` or `error`.
    pub fn ping_sse_location(
        &self,
        location: &str,
        count: Option<u32>,
    ) -> BoxStream<'static, PingEvent> {
        let resolved = validate_location(location)
            .map_err(|e| e.message)
            .and_then(|location| {
                self.directory
                    .resolve(&location)
                    .map_err(|e| match e {
                        DirectoryError::NotFound(name) => {
                            format!("Location \"{}\" not found", name)
                        }
                        other => other.to_string(),
                    })
            })
            .and_then(|device| {
                validate_probe_count(count.unwrap_or(self.config.probe.live_count))
                    .map(|count| (device, count))
                    .map_err(|e| e.message)
            });

        let (device, count) = match resolved {
            Ok(resolved) => resolved,
            Err(message) => {
                let event = PingEvent::Error {
                    message,
                    location: None,
                    target_ip: None,
                    timestamp: Utc::now(),
                };
                return futures::stream::once(async move { event }).boxed();
            }
        };

        ping_events(self.prober.clone(), device, count)
    }

    /// Aggregate reachability of a single address.
    pub async fn ping_single_status(&self, ip: &str, location: &str) -> ApiResponse {
        let address = match validate_ip(ip) {
            Ok(address) => address,
            Err(e) => {
                return ApiResponse::failure(ApiStatus::BadRequest, e.message)
                    .with_data(json!({"error_type": ErrorKind::AddressInvalid}));
            }
        };

        match self
            .prober
            .probe(address, self.config.probe.screening_count)
            .await
        {
            Ok(result) => {
                tracing::debug!(location, %address, reachable = result.reachable, "Status probe");
                ApiResponse::ok(
                    format!("Status retrieved for {}", location),
                    json!({"status": result.reachable}),
                )
            }
            Err(e) => ApiResponse::failure(ApiStatus::Internal, e.to_string())
                .with_data(json!({"error_type": e.kind()})),
        }
    }

    pub fn get_ip_and_location(&self) -> IpAndLocation {
        let (locations, ips) = self
            .directory
            .list_all()
            .into_iter()
            .map(|d| (d.location, d.address))
            .unzip();
        IpAndLocation { locations, ips }
    }
}

fn connection_class(error: ErrorKind) -> bool {
    matches!(
        error,
        ErrorKind::ConnectionFailed | ErrorKind::AuthFailed | ErrorKind::Timeout
    )
}

fn ping_events<P: Prober>(
    prober: Arc<P>,
    device: Device,
    count: u32,
) -> BoxStream<'static, PingEvent> {
    async_stream::stream! {
        let location = device.location.clone();
        let target_ip = device.address;

        yield PingEvent::Start {
            message: format!("Starting ping to {} ({})", location, target_ip),
            location: location.clone(),
            target_ip,
            timestamp: Utc::now(),
        };

        let mut probe = prober.probe_stream(target_ip, count);
        let mut finished = false;
        while let Some(event) = probe.next().await {
            match event {
                Ok(ProbeEvent::Line(line)) => {
                    yield PingEvent::PingLine {
                        data: line,
                        location: location.clone(),
                        target_ip,
                        timestamp: Utc::now(),
                    };
                }
                Ok(ProbeEvent::Finished(result)) => {
                    finished = true;
                    if result.reachable {
                        yield PingEvent::Complete {
                            message: format!("Ping to {} completed successfully", location),
                            location: location.clone(),
                            target_ip,
                            timestamp: Utc::now(),
                        };
                    } else {
                        yield PingEvent::Error {
                            message: format!("Ping to {} failed", location),
                            location: Some(location.clone()),
                            target_ip: Some(target_ip),
                            timestamp: Utc::now(),
                        };
                    }
                    break;
                }
                Err(e) => {
                    finished = true;
                    yield PingEvent::Error {
                        message: format!("Error during ping: {}", e),
                        location: Some(location.clone()),
                        target_ip: Some(target_ip),
                        timestamp: Utc::now(),
                    };
                    break;
                }
            }
        }

        if !finished {
            yield PingEvent::Error {
                message: format!("Ping to {} ended without a result", location),
                location: Some(location.clone()),
                target_ip: Some(target_ip),
                timestamp: Utc::now(),
            };
        }
    }
    .boxed()
}
