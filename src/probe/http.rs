//! JSON status endpoint probe.

use std::time::{Duration, Instant};

use secrecy::ExposeSecret;
use serde_json::Value;

use super::Fragment;
use crate::domain::device::{DeviceConfig, HttpAuth, HttpMethod};
use crate::domain::types::{DeviceType, Method, Metrics};
use crate::domain::vocabulary::{CPU_LOAD, CPU_USAGE, MEMORY_USAGE, RESPONSE_TIME, TEMPERATURE, UPTIME};
use crate::error::{ProbeError, ProbeFailure};

/// Built-in `json path → metric` mapping. The first path present wins for
/// a given metric.
const COMMON_FIELDS: &[(&str, &str)] = &[
    ("cpu", CPU_USAGE),
    ("cpu_usage", CPU_USAGE),
    ("cpu_percent", CPU_USAGE),
    ("memory", MEMORY_USAGE),
    ("memory_usage", MEMORY_USAGE),
    ("memory_percent", MEMORY_USAGE),
    ("uptime", UPTIME),
    ("temperature", TEMPERATURE),
    ("temp", TEMPERATURE),
    ("load", CPU_LOAD),
    ("load_avg", CPU_LOAD),
];

fn type_fields(device_type: DeviceType) -> &'static [(&'static str, &'static str)] {
    match device_type {
        DeviceType::Router => &[
            ("interfaces.utilization", "interface_bandwidth"),
            ("routing.changes", "routing_table_changes"),
        ],
        DeviceType::Firewall => &[
            ("sessions", "active_sessions"),
            ("blocked", "blocked_traffic"),
            ("vpn", "vpn_tunnels"),
        ],
        _ => &[],
    }
}

pub async fn probe(client: &reqwest::Client, device: &DeviceConfig, timeout: Duration) -> Fragment {
    let http = &device.http;
    let mut request = match http.method {
        HttpMethod::Get => client.get(&http.endpoint),
        HttpMethod::Post => client.post(&http.endpoint),
    }
    .timeout(timeout)
    .header(reqwest::header::ACCEPT, "application/json");

    request = match &http.auth {
        Some(HttpAuth::Basic { username, password }) => {
            request.basic_auth(username, password.as_ref().map(|p| p.expose_secret().to_string()))
        }
        Some(HttpAuth::Bearer(token)) => request.bearer_auth(token.expose_secret()),
        None => request,
    };

    let started = Instant::now();
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            let reason = if e.is_timeout() {
                ProbeFailure::Timeout
            } else {
                ProbeFailure::Unreachable
            };
            return Fragment::failed(Method::Http, ProbeError::new(Method::Http, reason, e.to_string()));
        }
    };
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    // An unusable answer counts as a failed poll for this method; the
    // response time is kept as partial data.
    let mut metrics = Metrics::new();
    metrics.insert(RESPONSE_TIME.into(), elapsed_ms);
    let answered = |metrics: Metrics, reason: ProbeFailure, detail: String| Fragment {
        method: Method::Http,
        reachable: false,
        latency_ms: Some(elapsed_ms),
        metrics,
        error: Some(ProbeError::new(Method::Http, reason, detail)),
    };

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return answered(metrics, ProbeFailure::Auth, format!("endpoint returned {status}"));
    }
    if !status.is_success() {
        return answered(metrics, ProbeFailure::BadResponse, format!("endpoint returned {status}"));
    }

    let body: Value = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            return answered(metrics, ProbeFailure::BadResponse, format!("malformed JSON body: {e}"))
        }
    };
    if !body.is_object() {
        return answered(metrics, ProbeFailure::BadResponse, "JSON body is not an object".into());
    }

    metrics.extend(extract_metrics(&body, device.device_type, &http.fields));
    Fragment {
        method: Method::Http,
        reachable: true,
        latency_ms: Some(elapsed_ms),
        metrics,
        error: None,
    }
}

/// Apply the built-in mapping, then the type extras, then per-device
/// fields, which override earlier matches.
pub fn extract_metrics(body: &Value, device_type: DeviceType, extra: &[(String, String)]) -> Metrics {
    let mut metrics = Metrics::new();
    for (path, key) in COMMON_FIELDS.iter().chain(type_fields(device_type)) {
        if metrics.contains_key(*key) {
            continue;
        }
        if let Some(v) = lookup(body, path) {
            metrics.insert((*key).to_string(), v);
        }
    }
    for (path, key) in extra {
        if let Some(v) = lookup(body, path) {
            metrics.insert(key.clone(), v);
        }
    }
    metrics
}

/// Follow a dotted path and read a finite number or numeric string.
fn lookup(body: &Value, path: &str) -> Option<f64> {
    let node = path.split('.').try_fold(body, |node, segment| node.get(segment))?;
    let value = match node {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device::fixtures;
    use crate::domain::status_engine::{StatusEngine, DEBOUNCE_FAILURES};
    use crate::domain::types::Status;
    use crate::probe::merge_fragments;
    use secrecy::SecretString;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn firewall_for(server: &MockServer) -> DeviceConfig {
        let mut device = fixtures::device("FW1", DeviceType::Firewall, "127.0.0.1", &[Method::Http]);
        device.http.endpoint = format!("{}/api/status", server.uri());
        device
    }

    #[tokio::test]
    async fn maps_json_fields_to_metrics() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "cpu_percent": 41.5,
                "memory": "63",
                "temp": 48,
                "sessions": 1200,
                "vpn": 3,
                "firmware": "1.2.3"
            })))
            .mount(&server)
            .await;

        let fragment = probe(&reqwest::Client::new(), &firewall_for(&server), Duration::from_secs(2)).await;

        assert!(fragment.reachable);
        assert!(fragment.error.is_none());
        let m = &fragment.metrics;
        assert_eq!(m.get(CPU_USAGE), Some(&41.5));
        assert_eq!(m.get(MEMORY_USAGE), Some(&63.0));
        assert_eq!(m.get(TEMPERATURE), Some(&48.0));
        assert_eq!(m.get("active_sessions"), Some(&1200.0));
        assert_eq!(m.get("vpn_tunnels"), Some(&3.0));
        assert!(m.contains_key(RESPONSE_TIME));
        assert!(!m.contains_key("firmware"));
    }

    #[tokio::test]
    async fn non_2xx_is_a_failed_poll_with_response_time() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let fragment = probe(&reqwest::Client::new(), &firewall_for(&server), Duration::from_secs(2)).await;

        assert!(!fragment.reachable);
        assert!(fragment.metrics.contains_key(RESPONSE_TIME));
        assert_eq!(fragment.error.unwrap().reason, ProbeFailure::BadResponse);
    }

    #[tokio::test]
    async fn http_only_device_answering_503_goes_offline() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let device = firewall_for(&server);
        let client = reqwest::Client::new();
        let mut engine = StatusEngine::new();

        let mut statuses = Vec::new();
        for _ in 0..DEBOUNCE_FAILURES {
            let fragment = probe(&client, &device, Duration::from_secs(2)).await;
            let result = merge_fragments(&device.id, vec![fragment]);
            assert!(!result.reachable);
            let observation = engine.observe(&result, &device.thresholds, chrono::Utc::now());
            statuses.push(observation.current);
        }

        assert_eq!(statuses.last(), Some(&Status::Offline));
        let state = engine.state(&device.id).unwrap();
        assert_eq!(state.consecutive_failures, DEBOUNCE_FAILURES);
        assert_eq!(state.pending_alerts.len(), 1);
    }

    #[tokio::test]
    async fn malformed_json_is_bad_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        let fragment = probe(&reqwest::Client::new(), &firewall_for(&server), Duration::from_secs(2)).await;

        assert_eq!(fragment.error.unwrap().reason, ProbeFailure::BadResponse);
        assert_eq!(fragment.metrics.len(), 1, "only response_time survives");
    }

    #[tokio::test]
    async fn unauthorized_is_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let fragment = probe(&reqwest::Client::new(), &firewall_for(&server), Duration::from_secs(2)).await;

        assert_eq!(fragment.error.unwrap().reason, ProbeFailure::Auth);
    }

    #[tokio::test]
    async fn sends_bearer_token_and_posts_when_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "cpu": 12 })))
            .expect(1)
            .mount(&server)
            .await;

        let mut device = firewall_for(&server);
        device.http.method = HttpMethod::Post;
        device.http.auth = Some(HttpAuth::Bearer(SecretString::from("s3cret".to_string())));

        let fragment = probe(&reqwest::Client::new(), &device, Duration::from_secs(2)).await;
        assert_eq!(fragment.metrics.get(CPU_USAGE), Some(&12.0));
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let fragment = probe(&reqwest::Client::new(), &firewall_for(&server), Duration::from_millis(200)).await;

        assert!(!fragment.reachable);
        assert_eq!(fragment.error.unwrap().reason, ProbeFailure::Timeout);
    }

    #[test]
    fn device_fields_override_builtin_mapping() {
        let body = json!({ "cpu": 10, "stats": { "cpu": { "busy": "88%" } } });
        let extra = vec![("stats.cpu.busy".to_string(), CPU_USAGE.to_string())];
        let m = extract_metrics(&body, DeviceType::Switch, &extra);
        assert_eq!(m.get(CPU_USAGE), Some(&88.0));
    }

    #[test]
    fn router_paths_are_nested() {
        let body = json!({ "interfaces": { "utilization": 71.2 }, "routing": { "changes": 4 } });
        let m = extract_metrics(&body, DeviceType::Router, &[]);
        assert_eq!(m.get("interface_bandwidth"), Some(&71.2));
        assert_eq!(m.get("routing_table_changes"), Some(&4.0));
    }
}
