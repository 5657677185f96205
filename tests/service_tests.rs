//! Integration tests for the service operations and their envelopes.

mod common;

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;

use common::{FakeConnector, FakeProber, ProbeBehavior, SwitchScript, collect, device, summary_of};
use poe_reset::config::{AppConfig, InMemoryDirectory};
use poe_reset::service::{ApiStatus, PingEvent, ResetService};

type Service = ResetService<FakeConnector, FakeProber, InMemoryDirectory>;

fn config() -> Arc<AppConfig> {
    let mut config = AppConfig::default();
    config.reset.sleep_before_enable_secs = 0;
    config.batch.verification_delay_secs = 0;
    Arc::new(config)
}

fn directory() -> Arc<InMemoryDirectory> {
    Arc::new(
        InMemoryDirectory::from_devices(vec![
            device("Lobby-3", 5),
            device("Gym", 6),
            device("Library", 7),
        ])
        .unwrap(),
    )
}

fn service_with(connector: FakeConnector, prober: FakeProber) -> Service {
    ResetService::new(config(), directory(), Arc::new(prober)).with_connector(Arc::new(connector))
}

fn service() -> Service {
    service_with(FakeConnector::new(), FakeProber::new())
}

#[tokio::test]
async fn reset_port_reports_port_number() {
    let response = service().reset_port("Lobby-3", None).await;

    assert!(response.success, "{}", response.message);
    assert_eq!(response.status, ApiStatus::Ok);
    assert_eq!(response.message, "Port ge-0/0/7 reset successfully for Lobby-3");
    assert_eq!(
        response.data,
        Some(json!({"locName": "Lobby-3", "port": 7, "status": "reset"}))
    );
}

#[tokio::test]
async fn reset_port_trims_location() {
    let response = service().reset_port("  Lobby-3 ", Some(30)).await;
    assert!(response.success);
}

#[tokio::test]
async fn reset_port_rejects_bad_input() {
    let service = service();

    let response = service.reset_port("", None).await;
    assert_eq!(response.status, ApiStatus::BadRequest);
    assert!(response.data.is_none());

    for timeout in [0, 301] {
        let response = service.reset_port("Lobby-3", Some(timeout)).await;
        assert!(!response.success);
        assert_eq!(response.status, ApiStatus::BadRequest);
        assert!(response.message.contains("between 1 and 300"));
    }
}

#[tokio::test]
async fn reset_port_unknown_location_is_not_found() {
    let response = service().reset_port("Attic", None).await;
    assert!(!response.success);
    assert_eq!(response.status, ApiStatus::NotFound);
    assert!(response.message.contains("Attic"));
}

#[tokio::test]
async fn reset_port_device_failure_carries_details() {
    let connector = FakeConnector::new().script(
        "Lobby-3",
        SwitchScript {
            descriptions: Some("ge-0/0/1  up  up  uplink\n".to_string()),
            ..SwitchScript::default()
        },
    );
    let response = service_with(connector, FakeProber::new())
        .reset_port("Lobby-3", None)
        .await;

    assert!(!response.success);
    assert_eq!(response.status, ApiStatus::DeviceFailed);
    let data = response.data.expect("failure data");
    assert_eq!(data["locName"], "Lobby-3");
    assert_eq!(data["status"], "reset_failed");
    assert_eq!(data["error_type"], "port_not_found");
    assert_eq!(data["timeout"], 10);
    assert!(data.get("diagnostics").is_none());
}

#[tokio::test]
async fn missing_credentials_is_internal_error() {
    let service: Service = ResetService::new(config(), directory(), Arc::new(FakeProber::new()));

    let response = service.reset_port("Lobby-3", None).await;
    assert_eq!(response.status, ApiStatus::Internal);
    assert!(response.message.contains("credentials"));

    let response = service.reset_all_locations_sse(None).unwrap_err();
    assert_eq!(response.status, ApiStatus::Internal);
}

#[tokio::test]
async fn reset_all_covers_directory() {
    let stream = service().reset_all_locations_sse(Some(30)).unwrap();
    let events = collect(stream).await;
    let summary = summary_of(&events);

    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.reset_locations, vec!["Lobby-3", "Gym", "Library"]);
}

#[tokio::test]
async fn batch_timeout_is_validated() {
    let response = service().reset_down_port_only_sse(Some(0)).unwrap_err();
    assert_eq!(response.status, ApiStatus::BadRequest);
}

#[tokio::test]
async fn reset_down_resets_only_unreachable() {
    let prober = FakeProber::new().with(device("Gym", 6).address, ProbeBehavior::Unreachable);
    let stream = service_with(FakeConnector::new(), prober)
        .reset_down_port_only_sse(None)
        .unwrap();
    let events = collect(stream).await;
    let summary = summary_of(&events);

    assert_eq!(summary.reset_locations, vec!["Gym"]);
    assert_eq!(summary.screening.len(), 3);
}

#[tokio::test]
async fn listing_is_index_aligned() {
    let listing = service().get_ip_and_location();
    assert_eq!(listing.locations, vec!["Lobby-3", "Gym", "Library"]);
    assert_eq!(listing.ips.len(), 3);
    assert_eq!(listing.ips[0], device("Lobby-3", 5).address);
    assert_eq!(listing.ips[2], device("Library", 7).address);
}

#[tokio::test]
async fn ping_stream_starts_and_completes() {
    let events: Vec<PingEvent> = service().ping_sse_location("Gym", Some(3)).collect().await;

    assert_eq!(events.len(), 5);
    assert!(matches!(events[0], PingEvent::Start { .. }));
    assert!(
        events[1..4]
            .iter()
            .all(|e| matches!(e, PingEvent::PingLine { .. }))
    );
    assert!(matches!(events[4], PingEvent::Complete { .. }));
    assert!(events[4].is_terminal());
}

#[tokio::test]
async fn ping_unreachable_ends_with_error() {
    let prober = FakeProber::new().with(device("Gym", 6).address, ProbeBehavior::Unreachable);
    let events: Vec<PingEvent> = service_with(FakeConnector::new(), prober)
        .ping_sse_location("Gym", Some(2))
        .collect()
        .await;

    assert!(matches!(events.first(), Some(PingEvent::Start { .. })));
    match events.last() {
        Some(PingEvent::Error { location, .. }) => assert_eq!(location.as_deref(), Some("Gym")),
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn ping_unknown_location_is_single_error() {
    let events: Vec<PingEvent> = service().ping_sse_location("Attic", None).collect().await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        PingEvent::Error { message, .. } => assert!(message.contains("Attic")),
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn status_probe_is_stable() {
    let service = service();
    for _ in 0..3 {
        let response = service.ping_single_status("10.0.0.5", "Lobby-3").await;
        assert!(response.success);
        assert_eq!(response.data, Some(json!({"status": true})));
    }
}

#[tokio::test]
async fn status_rejects_invalid_address() {
    let response = service().ping_single_status("10.0.0.300", "Lobby-3").await;
    assert_eq!(response.status, ApiStatus::BadRequest);
    assert_eq!(response.data, Some(json!({"error_type": "address_invalid"})));
}

#[tokio::test]
async fn health_reports_service_name() {
    let response = service().health();
    assert!(response.success);
    assert_eq!(response.data.unwrap()["service"], "PoE Reset Service");
}

#[tokio::test]
async fn status_reports_version_and_uptime() {
    let response = service().status();
    assert!(response.success);
    assert_eq!(response.status, ApiStatus::Ok);

    let data = response.data.expect("status data");
    assert_eq!(data["system"], "PoE Reset Service");
    assert_eq!(data["version"], env!("CARGO_PKG_VERSION"));
    assert!(data["uptime_secs"].as_i64().unwrap() >= 0);
    assert_eq!(data["devices"], 3);
    assert_eq!(data["credentials_configured"], true);
}
