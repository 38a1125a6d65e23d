//! Delivery of device state to the remote API.
//!
//! The pipeline produces one `SyncRecord` per poll cycle. The worker pushes
//! them one at a time; a record that cannot be delivered is logged and
//! dropped, and the next cycle sends fresh state anyway.

pub mod client;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::device::DeviceConfig;
use crate::domain::scoring::RiskLevel;
use crate::domain::types::{AlertEvent, DeviceType, Metrics, PollResult, Status};
use crate::error::{ProbeError, SyncError};

pub use client::ApiClient;

/// Everything the API needs to know about one poll cycle.
#[derive(Debug, Clone)]
pub struct SyncRecord {
    pub device: Arc<DeviceConfig>,
    pub result: PollResult,
    pub status: Status,
    pub score: u8,
    pub risk: RiskLevel,
    pub last_seen: Option<DateTime<Utc>>,
    pub alerts: Vec<AlertEvent>,
}

/// Body for both `POST /devices` and `PUT /devices/{id}`. The server picks
/// the fields it understands; identity fields let a PUT that hit a missing
/// device be replayed as a create.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePayload<'a> {
    pub id: &'a str,
    pub name: &'a str,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub location: &'a str,
    pub ip_address: &'a str,
    pub status: Status,
    pub metrics: &'a Metrics,
    pub predictive_score: u8,
    pub risk_level: RiskLevel,
    pub recommended_action: &'static str,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
    pub last_seen: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    pub probe_errors: &'a [ProbeError],
    pub alerts: &'a [AlertEvent],
    pub agent: &'a str,
}

impl<'a> DevicePayload<'a> {
    pub fn new(record: &'a SyncRecord, agent: &'a str) -> Self {
        let device = &record.device;
        Self {
            id: &device.id,
            name: &device.name,
            device_type: device.device_type,
            location: &device.location,
            ip_address: &device.address,
            status: record.status,
            metrics: &record.result.metrics,
            predictive_score: record.score,
            risk_level: record.risk,
            recommended_action: record.risk.recommended_action(),
            reachable: record.result.reachable,
            latency_ms: record.result.latency_ms,
            last_seen: record.last_seen,
            timestamp: record.result.timestamp,
            probe_errors: &record.result.probe_errors,
            alerts: &record.alerts,
            agent,
        }
    }
}

pub struct SyncWorker {
    client: ApiClient,
    agent: String,
    /// Device ids already checked against the remote inventory.
    registered: HashSet<String>,
}

impl SyncWorker {
    pub fn new(client: ApiClient, agent: impl Into<String>) -> Self {
        Self {
            client,
            agent: agent.into(),
            registered: HashSet::new(),
        }
    }

    /// Push one record, registering the device first if this process has
    /// not seen it yet.
    pub async fn deliver(&mut self, record: &SyncRecord) -> Result<(), SyncError> {
        let payload = DevicePayload::new(record, &self.agent);
        let device_id = payload.id;

        if !self.registered.contains(device_id) {
            let known = self.client.list_devices().await?;
            if !known.iter().any(|d| d.id == device_id) {
                self.client.create_device(&payload).await?;
                info!(device_id, "registered device with API");
            }
            self.registered.insert(device_id.to_string());
        }

        self.client.upsert_device(device_id, &payload).await
    }

    /// Drain `records` until every sender is gone.
    pub async fn run(mut self, mut records: mpsc::Receiver<SyncRecord>) {
        info!(agent = %self.agent, "sync worker started");
        while let Some(record) = records.recv().await {
            match self.deliver(&record).await {
                Ok(()) => debug!(
                    device_id = %record.device.id,
                    status = %record.status,
                    alerts = record.alerts.len(),
                    "device update delivered"
                ),
                Err(e) => warn!(
                    device_id = %record.device.id,
                    status = %record.status,
                    alerts = record.alerts.len(),
                    error = %e,
                    "dropping device update"
                ),
            }
        }
        info!("sync worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;
    use crate::domain::device::fixtures;
    use crate::domain::types::{AlertKind, Method, Severity};
    use secrecy::SecretString;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(status: Status, alerts: Vec<AlertEvent>) -> SyncRecord {
        let device = fixtures::device("device_router_01", DeviceType::Router, "192.168.1.1", &[Method::Ping]);
        let timestamp = Utc::now();
        SyncRecord {
            device: Arc::new(device),
            result: PollResult {
                device_id: "device_router_01".into(),
                timestamp,
                reachable: status != Status::Offline,
                latency_ms: Some(4.2),
                metrics: [("latency_ms".to_string(), 4.2)].into_iter().collect(),
                probe_errors: vec![],
            },
            status,
            score: 85,
            risk: RiskLevel::Low,
            last_seen: Some(timestamp),
            alerts,
        }
    }

    fn worker(server: &MockServer) -> SyncWorker {
        let client = ApiClient::new(ApiConfig {
            base_url: format!("{}/api", server.uri()),
            username: "Admin".into(),
            password: SecretString::from("Admin123".to_string()),
            timeout: Duration::from_secs(5),
            retry_attempts: 2,
            retry_delay: Duration::from_millis(10),
        })
        .unwrap();
        SyncWorker::new(client, "edge-01")
    }

    async fn mount_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "t" })))
            .mount(server)
            .await;
    }

    #[test]
    fn payload_uses_api_field_names() {
        let alert = AlertEvent {
            device_id: "device_router_01".into(),
            kind: AlertKind::Recovery,
            severity: Severity::Info,
            message: "recovered".into(),
            timestamp: Utc::now(),
        };
        let rec = record(Status::Online, vec![alert]);
        let value = serde_json::to_value(DevicePayload::new(&rec, "edge-01")).unwrap();

        assert_eq!(value["type"], "router");
        assert_eq!(value["ipAddress"], "192.168.1.1");
        assert_eq!(value["status"], "online");
        assert_eq!(value["predictiveScore"], 85);
        assert_eq!(value["riskLevel"], "low");
        assert_eq!(value["recommendedAction"], "Continue monitoring");
        assert_eq!(value["latencyMs"], 4.2);
        assert_eq!(value["agent"], "edge-01");
        assert_eq!(value["alerts"][0]["kind"], "recovery");
        assert_eq!(value["alerts"][0]["deviceId"], "device_router_01");
        assert!(value["probeErrors"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_delivery_registers_missing_device() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/devices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "device_switch_01" }])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/devices"))
            .and(body_partial_json(json!({ "id": "device_router_01", "type": "router" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "device_router_01" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/devices/device_router_01"))
            .and(body_partial_json(json!({ "status": "online", "agent": "edge-01" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let mut worker = worker(&server);
        worker.deliver(&record(Status::Online, vec![])).await.unwrap();
        // Inventory is not checked again for the same device.
        worker.deliver(&record(Status::Online, vec![])).await.unwrap();
    }

    #[tokio::test]
    async fn known_device_is_only_updated() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/devices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "device_router_01" }])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/devices"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        worker(&server)
            .deliver(&record(Status::Warning, vec![]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn worker_keeps_going_after_a_failed_delivery() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/devices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "device_router_01" }])))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "error": "bad" })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(body_partial_json(json!({ "status": "critical" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (tx, rx) = mpsc::channel(4);
        tx.send(record(Status::Online, vec![])).await.unwrap();
        tx.send(record(Status::Critical, vec![])).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), worker(&server).run(rx))
            .await
            .unwrap();
    }
}
