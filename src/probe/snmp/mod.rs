//! SNMP v1/v2c GET probe over UDP.
//!
//! Every OID of the battery is requested at once, each in its own GET with a
//! distinct request id, so one missing object never hides the others.
//! Responses are collected until every id is answered or the deadline hits.

pub mod codec;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::debug;

use self::codec::{Message, ERR_AUTHORIZATION, ERR_NO_ACCESS, PDU_RESPONSE};
use super::Fragment;
use crate::domain::device::DeviceConfig;
use crate::domain::types::{DeviceType, Method, Metrics};
use crate::domain::vocabulary::{
    CPU_USAGE, INTERFACE_COUNT, INTERFACE_ERRORS, INTERFACE_IN_OCTETS, INTERFACE_OUT_OCTETS,
    MEMORY_USAGE, STORAGE_USAGE, UPTIME,
};
use crate::error::{ProbeError, ProbeFailure};

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Reading {
    SysUpTime,
    IfNumber,
    CiscoCpu5Min,
    HostCpuLoad,
    CiscoMemUsed,
    CiscoMemFree,
    IfInOctets,
    IfOutOctets,
    IfInErrors,
    IfOutErrors,
    StorageUsed,
    StorageSize,
}

impl Reading {
    fn oid(&self) -> &'static str {
        match self {
            Reading::SysUpTime => "1.3.6.1.2.1.1.3.0",
            Reading::IfNumber => "1.3.6.1.2.1.2.1.0",
            Reading::CiscoCpu5Min => "1.3.6.1.4.1.9.9.109.1.1.1.1.7.1",
            Reading::HostCpuLoad => "1.3.6.1.2.1.25.3.3.1.2.1",
            Reading::CiscoMemUsed => "1.3.6.1.4.1.9.9.48.1.1.1.5.1",
            Reading::CiscoMemFree => "1.3.6.1.4.1.9.9.48.1.1.1.6.1",
            Reading::IfInOctets => "1.3.6.1.2.1.2.2.1.10.1",
            Reading::IfOutOctets => "1.3.6.1.2.1.2.2.1.16.1",
            Reading::IfInErrors => "1.3.6.1.2.1.2.2.1.14.1",
            Reading::IfOutErrors => "1.3.6.1.2.1.2.2.1.20.1",
            Reading::StorageUsed => "1.3.6.1.2.1.25.2.3.1.6.1",
            Reading::StorageSize => "1.3.6.1.2.1.25.2.3.1.5.1",
        }
    }
}

fn has_interfaces(device_type: DeviceType) -> bool {
    matches!(
        device_type,
        DeviceType::Router
            | DeviceType::Switch
            | DeviceType::Firewall
            | DeviceType::Gateway
            | DeviceType::LoadBalancer
            | DeviceType::Bridge
            | DeviceType::VpnConcentrator
            | DeviceType::IdsIps
    )
}

fn battery(device_type: DeviceType) -> Vec<Reading> {
    let mut readings = vec![
        Reading::SysUpTime,
        Reading::IfNumber,
        Reading::CiscoCpu5Min,
        Reading::HostCpuLoad,
        Reading::CiscoMemUsed,
        Reading::CiscoMemFree,
    ];
    if has_interfaces(device_type) {
        readings.extend([
            Reading::IfInOctets,
            Reading::IfOutOctets,
            Reading::IfInErrors,
            Reading::IfOutErrors,
        ]);
    }
    if device_type == DeviceType::Nas {
        readings.extend([Reading::StorageUsed, Reading::StorageSize]);
    }
    readings
}

fn percent(part: f64, total: f64) -> Option<f64> {
    (total > 0.0).then(|| part / total * 100.0)
}

fn derive_metrics(values: &HashMap<Reading, f64>) -> Metrics {
    let get = |r: Reading| values.get(&r).copied();
    let mut metrics = Metrics::new();

    if let Some(ticks) = get(Reading::SysUpTime) {
        metrics.insert(UPTIME.into(), ticks / 100.0);
    }
    if let Some(count) = get(Reading::IfNumber) {
        metrics.insert(INTERFACE_COUNT.into(), count);
    }
    if let Some(cpu) = get(Reading::CiscoCpu5Min).or_else(|| get(Reading::HostCpuLoad)) {
        metrics.insert(CPU_USAGE.into(), cpu);
    }
    if let (Some(used), Some(free)) = (get(Reading::CiscoMemUsed), get(Reading::CiscoMemFree)) {
        if let Some(pct) = percent(used, used + free) {
            metrics.insert(MEMORY_USAGE.into(), pct);
        }
    }
    if let Some(v) = get(Reading::IfInOctets) {
        metrics.insert(INTERFACE_IN_OCTETS.into(), v);
    }
    if let Some(v) = get(Reading::IfOutOctets) {
        metrics.insert(INTERFACE_OUT_OCTETS.into(), v);
    }
    let errors: Vec<f64> = [Reading::IfInErrors, Reading::IfOutErrors]
        .into_iter()
        .filter_map(get)
        .collect();
    if !errors.is_empty() {
        metrics.insert(INTERFACE_ERRORS.into(), errors.iter().sum());
    }
    if let (Some(used), Some(size)) = (get(Reading::StorageUsed), get(Reading::StorageSize)) {
        if let Some(pct) = percent(used, size) {
            metrics.insert(STORAGE_USAGE.into(), pct);
        }
    }
    metrics
}

#[derive(Debug, Default)]
struct Collected {
    values: HashMap<Reading, f64>,
    responses: usize,
    first_reply: Option<Duration>,
    auth_failure: Option<String>,
    socket_error: Option<String>,
}

pub async fn probe(device: &DeviceConfig, timeout: Duration) -> Fragment {
    // Finish collecting before the caller's hard timeout so partial
    // results are still returned.
    let budget = timeout.mul_f64(0.9);
    match query(device, Instant::now() + budget).await {
        Ok(collected) => into_fragment(collected, budget),
        Err(error) => Fragment::failed(Method::Snmp, error),
    }
}

fn unreachable(detail: String) -> ProbeError {
    ProbeError::new(Method::Snmp, ProbeFailure::Unreachable, detail)
}

async fn query(device: &DeviceConfig, deadline: Instant) -> Result<Collected, ProbeError> {
    let target = format!("{}:{}", device.address, device.snmp.port);
    let addr = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| unreachable(format!("resolving {target}: {e}")))?
        .next()
        .ok_or_else(|| unreachable(format!("{target} did not resolve")))?;

    let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| unreachable(format!("binding UDP socket: {e}")))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| unreachable(format!("connecting to {addr}: {e}")))?;

    let readings = battery(device.device_type);
    let base = NEXT_REQUEST_ID.fetch_add(readings.len() as i32, Ordering::Relaxed) & 0x3fff_ffff;
    let mut pending: HashMap<i32, Reading> = HashMap::new();
    for (offset, reading) in readings.iter().enumerate() {
        let request_id = base + offset as i32;
        let oid = codec::parse_oid(reading.oid())
            .map_err(|e| ProbeError::new(Method::Snmp, ProbeFailure::BadResponse, e.to_string()))?;
        let request = Message::get_request(
            device.snmp.version.wire_value(),
            &device.snmp.community,
            request_id,
            &[oid],
        );
        socket
            .send(&request.encode())
            .await
            .map_err(|e| unreachable(format!("sending to {addr}: {e}")))?;
        pending.insert(request_id, *reading);
    }

    let started = Instant::now();
    let mut collected = Collected::default();
    let mut buf = vec![0u8; 65_535];
    while !pending.is_empty() {
        let len = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(len)) => len,
            Ok(Err(e)) => {
                collected.socket_error = Some(e.to_string());
                break;
            }
        };
        let message = match Message::decode(&buf[..len]) {
            Ok(m) if m.pdu.tag == PDU_RESPONSE => m,
            Ok(_) => continue,
            Err(e) => {
                debug!(device_id = %device.id, error = %e, "ignoring undecodable SNMP datagram");
                continue;
            }
        };
        let Some(reading) = pending.remove(&message.pdu.request_id) else {
            continue;
        };
        collected.responses += 1;
        collected.first_reply.get_or_insert_with(|| started.elapsed());

        if message.community != device.snmp.community.as_bytes() {
            collected.auth_failure = Some("response community does not match".into());
            continue;
        }
        match message.pdu.error_status {
            0 => {}
            ERR_AUTHORIZATION | ERR_NO_ACCESS => {
                collected.auth_failure = Some(format!(
                    "agent refused community (error-status {})",
                    message.pdu.error_status
                ));
                continue;
            }
            // noSuchName and friends: this object is simply absent.
            _ => continue,
        }
        if let Some(value) = message.pdu.varbinds.first().and_then(|vb| vb.value.as_f64()) {
            if value.is_finite() {
                collected.values.insert(reading, value);
            }
        }
    }

    Ok(collected)
}

fn into_fragment(collected: Collected, budget: Duration) -> Fragment {
    if collected.responses == 0 {
        let error = match collected.socket_error {
            Some(detail) => unreachable(detail),
            None => ProbeError::timeout(Method::Snmp, budget),
        };
        return Fragment::failed(Method::Snmp, error);
    }

    let latency_ms = collected.first_reply.map(|d| d.as_secs_f64() * 1000.0);
    if collected.values.is_empty() {
        if let Some(detail) = collected.auth_failure {
            // The agent answered, so the device itself is up.
            return Fragment {
                method: Method::Snmp,
                reachable: true,
                latency_ms,
                metrics: Metrics::new(),
                error: Some(ProbeError::new(Method::Snmp, ProbeFailure::Auth, detail)),
            };
        }
    }

    Fragment {
        method: Method::Snmp,
        reachable: true,
        latency_ms,
        metrics: derive_metrics(&collected.values),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::codec::{Pdu, Value, VarBind};
    use super::*;
    use crate::domain::device::fixtures;
    use std::net::SocketAddr;

    /// Answers every GET from `answers`, `noSuchObject` otherwise. Requests
    /// with another community get an authorizationError.
    async fn fake_agent(community: &'static str, answers: Vec<(Reading, Value)>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let answers: HashMap<Vec<u32>, Value> = answers
            .into_iter()
            .map(|(r, v)| (codec::parse_oid(r.oid()).unwrap(), v))
            .collect();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let request = Message::decode(&buf[..len]).unwrap();
                let oid = request.pdu.varbinds[0].oid.clone();
                let (error_status, value) = if request.community != community.as_bytes() {
                    (ERR_AUTHORIZATION, Value::Null)
                } else {
                    (0, answers.get(&oid).cloned().unwrap_or(Value::NoSuchObject))
                };
                let response = Message {
                    version: request.version,
                    community: request.community.clone(),
                    pdu: Pdu {
                        tag: PDU_RESPONSE,
                        request_id: request.pdu.request_id,
                        error_status,
                        error_index: 0,
                        varbinds: vec![VarBind { oid, value }],
                    },
                };
                let _ = socket.send_to(&response.encode(), peer).await;
            }
        });
        addr
    }

    fn router_at(addr: SocketAddr) -> DeviceConfig {
        let mut device = fixtures::device("R1", DeviceType::Router, "127.0.0.1", &[Method::Snmp]);
        device.snmp.port = addr.port();
        device
    }

    #[tokio::test]
    async fn collects_partial_battery() {
        let addr = fake_agent(
            "public",
            vec![
                (Reading::SysUpTime, Value::TimeTicks(123_456)),
                (Reading::IfNumber, Value::Integer(4)),
                (Reading::CiscoCpu5Min, Value::Gauge32(95)),
                (Reading::CiscoMemUsed, Value::Gauge32(50)),
                (Reading::CiscoMemFree, Value::Gauge32(50)),
                (Reading::IfInOctets, Value::Counter32(1_000)),
            ],
        )
        .await;

        let fragment = probe(&router_at(addr), Duration::from_secs(2)).await;

        assert!(fragment.reachable);
        assert!(fragment.error.is_none());
        assert!(fragment.latency_ms.is_some());
        let m = &fragment.metrics;
        assert_eq!(m.get(UPTIME), Some(&1234.56));
        assert_eq!(m.get(CPU_USAGE), Some(&95.0));
        assert_eq!(m.get(MEMORY_USAGE), Some(&50.0));
        assert_eq!(m.get(INTERFACE_COUNT), Some(&4.0));
        assert_eq!(m.get(INTERFACE_IN_OCTETS), Some(&1_000.0));
        assert!(!m.contains_key(INTERFACE_ERRORS));
        assert!(!m.contains_key(STORAGE_USAGE));
    }

    #[tokio::test]
    async fn falls_back_to_host_resources_cpu() {
        let addr = fake_agent("public", vec![(Reading::HostCpuLoad, Value::Integer(37))]).await;
        let fragment = probe(&router_at(addr), Duration::from_secs(2)).await;
        assert_eq!(fragment.metrics.get(CPU_USAGE), Some(&37.0));
    }

    #[tokio::test]
    async fn refused_community_is_auth_failure() {
        let addr = fake_agent("public", vec![(Reading::SysUpTime, Value::TimeTicks(1))]).await;
        let mut device = router_at(addr);
        device.snmp.community = "wrong".into();

        let fragment = probe(&device, Duration::from_secs(2)).await;

        let error = fragment.error.unwrap();
        assert_eq!(error.reason, ProbeFailure::Auth);
        assert_eq!(error.method, Method::Snmp);
        assert!(fragment.metrics.is_empty());
    }

    #[tokio::test]
    async fn silent_agent_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device = router_at(silent.local_addr().unwrap());

        let fragment = probe(&device, Duration::from_millis(300)).await;

        assert!(!fragment.reachable);
        assert_eq!(fragment.error.unwrap().reason, ProbeFailure::Timeout);
    }

    #[test]
    fn nas_battery_includes_storage() {
        assert!(battery(DeviceType::Nas).contains(&Reading::StorageSize));
        assert!(!battery(DeviceType::Nas).contains(&Reading::IfInOctets));
        assert!(battery(DeviceType::Switch).contains(&Reading::IfOutErrors));
    }

    #[test]
    fn storage_and_error_counters_are_derived() {
        let values = HashMap::from([
            (Reading::StorageUsed, 75.0),
            (Reading::StorageSize, 300.0),
            (Reading::IfInErrors, 3.0),
            (Reading::IfOutErrors, 4.0),
        ]);
        let m = derive_metrics(&values);
        assert_eq!(m.get(STORAGE_USAGE), Some(&25.0));
        assert_eq!(m.get(INTERFACE_ERRORS), Some(&7.0));
    }
}
