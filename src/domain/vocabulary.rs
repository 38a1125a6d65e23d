//! Metric key vocabulary per device type.
//!
//! Probes emit keys from this vocabulary. Configuration that names a metric
//! (threshold overrides, HTTP field mappings) is validated against the
//! declared device type at load time.

use super::types::DeviceType;

/// Bump when keys are renamed or removed.
pub const VOCABULARY_VERSION: u32 = 1;

pub const LATENCY_MS: &str = "latency_ms";
pub const PACKET_LOSS: &str = "packet_loss";
pub const RESPONSE_TIME: &str = "response_time";
pub const UPTIME: &str = "uptime";
pub const CPU_USAGE: &str = "cpu_usage";
pub const MEMORY_USAGE: &str = "memory_usage";
pub const CPU_LOAD: &str = "cpu_load";
pub const TEMPERATURE: &str = "temperature";
pub const INTERFACE_COUNT: &str = "interface_count";
pub const INTERFACE_IN_OCTETS: &str = "interface_in_octets";
pub const INTERFACE_OUT_OCTETS: &str = "interface_out_octets";
pub const INTERFACE_ERRORS: &str = "interface_errors";
pub const STORAGE_USAGE: &str = "storage_usage";

const COMMON: &[&str] = &[
    LATENCY_MS,
    PACKET_LOSS,
    RESPONSE_TIME,
    UPTIME,
    CPU_USAGE,
    MEMORY_USAGE,
    CPU_LOAD,
    TEMPERATURE,
    INTERFACE_COUNT,
    INTERFACE_IN_OCTETS,
    INTERFACE_OUT_OCTETS,
    INTERFACE_ERRORS,
];

/// Keys reported on a 0-100 scale. Only these are comparable with each
/// other, so only these feed the predictive score's average.
const PERCENTAGES: &[&str] = &[
    CPU_USAGE,
    MEMORY_USAGE,
    STORAGE_USAGE,
    PACKET_LOSS,
    "interface_bandwidth",
    "channel_utilization",
];

/// Keys only meaningful for a given type, on top of the common set.
pub fn type_specific(device_type: DeviceType) -> &'static [&'static str] {
    match device_type {
        DeviceType::Router => &["interface_bandwidth", "routing_table_changes"],
        DeviceType::Switch => &[
            "port_status",
            "traffic_per_port",
            "broadcast_storms",
            "mac_table_size",
            "error_packets",
        ],
        DeviceType::Firewall => &[
            "active_sessions",
            "blocked_traffic",
            "vpn_tunnels",
            "threat_detection",
        ],
        DeviceType::LoadBalancer => &["active_sessions", "backend_health"],
        DeviceType::WirelessAp => &["client_count", "channel_utilization"],
        DeviceType::Nas => &[STORAGE_USAGE],
        DeviceType::VpnConcentrator => &["vpn_tunnels", "active_sessions"],
        DeviceType::IdsIps => &["threat_detection", "blocked_traffic"],
        DeviceType::ProxyServer => &["active_sessions"],
        DeviceType::VoipGateway => &["active_calls"],
        DeviceType::Gateway | DeviceType::Modem | DeviceType::Repeater | DeviceType::Bridge => {
            &[]
        }
    }
}

pub fn is_known(device_type: DeviceType, key: &str) -> bool {
    COMMON.contains(&key) || type_specific(device_type).contains(&key)
}

/// Every key valid for `device_type`.
pub fn keys(device_type: DeviceType) -> impl Iterator<Item = &'static str> {
    COMMON
        .iter()
        .chain(type_specific(device_type).iter())
        .copied()
}

/// Whether `key` (optionally `<method>.`-namespaced) is percentage-scaled.
pub fn is_percentage(key: &str) -> bool {
    let base = key.rsplit_once('.').map_or(key, |(_, k)| k);
    PERCENTAGES.contains(&base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_keys_apply_to_every_type() {
        for t in DeviceType::ALL {
            assert!(is_known(t, CPU_USAGE), "{t} should know cpu_usage");
            assert!(is_known(t, LATENCY_MS));
        }
    }

    #[test]
    fn type_specific_keys_do_not_leak() {
        assert!(is_known(DeviceType::Switch, "broadcast_storms"));
        assert!(!is_known(DeviceType::Router, "broadcast_storms"));
        assert!(is_known(DeviceType::Nas, STORAGE_USAGE));
        assert!(!is_known(DeviceType::Modem, STORAGE_USAGE));
    }

    #[test]
    fn keys_lists_common_and_specific() {
        let firewall: Vec<_> = keys(DeviceType::Firewall).collect();
        assert!(firewall.contains(&"vpn_tunnels"));
        assert!(firewall.contains(&UPTIME));
        assert_eq!(firewall.len(), COMMON.len() + 4);
    }

    #[test]
    fn percentage_keys_ignore_method_namespace() {
        assert!(is_percentage(CPU_USAGE));
        assert!(is_percentage("http.cpu_usage"));
        assert!(!is_percentage(UPTIME));
        assert!(!is_percentage(INTERFACE_IN_OCTETS));
        assert!(!is_percentage("snmp.interface_count"));
    }
}
