//! Predictive health score used to prioritise maintenance.
//!
//! The score is a pure function of the latest status and metrics. It never
//! drives alerting.

use serde::{Deserialize, Serialize};

use super::types::{Metrics, Status};
use super::vocabulary;

const OVERLOAD_AVG: f64 = 90.0;
const IDLE_AVG: f64 = 10.0;
const OVERLOAD_PENALTY: i32 = 20;
const IDLE_PENALTY: i32 = 15;

/// Offline sits between warning and critical: an unreachable device is
/// ambiguous, a reachable critical one is known to be degraded.
pub fn base_score(status: Status) -> i32 {
    match status {
        Status::Online => 85,
        Status::Warning => 45,
        Status::Critical => 15,
        Status::Offline => 25,
    }
}

/// Score in `[0, 100]`. The average covers percentage-scaled metrics only;
/// a map without any (or with only non-finite ones) skips the adjustment.
pub fn score(status: Status, metrics: &Metrics) -> u8 {
    let base = base_score(status);

    let adjustment = match mean(metrics) {
        Some(avg) if avg > OVERLOAD_AVG => -OVERLOAD_PENALTY,
        Some(avg) if avg < IDLE_AVG => -IDLE_PENALTY,
        _ => 0,
    };

    (base + adjustment).clamp(0, 100) as u8
}

fn mean(metrics: &Metrics) -> Option<f64> {
    let (sum, count) = metrics
        .iter()
        .filter(|(key, v)| v.is_finite() && vocabulary::is_percentage(key))
        .map(|(_, v)| v)
        .fold((0.0_f64, 0_u32), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / f64::from(count))
}

/// Maintenance risk bucket derived from a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    High,
    Medium,
    Low,
}

impl RiskLevel {
    pub fn from_score(score: u8) -> Self {
        if score < 30 {
            RiskLevel::High
        } else if score < 60 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn recommended_action(&self) -> &'static str {
        match self {
            RiskLevel::High => "Immediate maintenance required",
            RiskLevel::Medium => "Schedule maintenance soon",
            RiskLevel::Low => "Continue monitoring",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(pairs: &[(&str, f64)]) -> Metrics {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn empty_metrics_return_base() {
        let empty = Metrics::new();
        assert_eq!(score(Status::Online, &empty), 85);
        assert_eq!(score(Status::Warning, &empty), 45);
        assert_eq!(score(Status::Critical, &empty), 15);
        assert_eq!(score(Status::Offline, &empty), 25);
    }

    #[test]
    fn critical_overload_clamps_to_zero() {
        // cpu=95, memory=90 would be avg 92.5; cpu=95, memory=50 is 72.5.
        assert_eq!(score(Status::Critical, &metrics(&[("cpu_usage", 95.0), ("memory_usage", 90.0)])), 0);
        assert_eq!(score(Status::Critical, &metrics(&[("cpu_usage", 95.0), ("memory_usage", 50.0)])), 15);
    }

    #[test]
    fn idle_average_is_penalised() {
        assert_eq!(score(Status::Online, &metrics(&[("packet_loss", 0.0), ("latency_ms", 3.0)])), 70);
    }

    #[test]
    fn average_boundaries_are_exclusive() {
        assert_eq!(score(Status::Online, &metrics(&[("cpu_usage", 90.0)])), 85);
        assert_eq!(score(Status::Online, &metrics(&[("cpu_usage", 10.0)])), 85);
    }

    #[test]
    fn non_increasing_above_overload() {
        for status in [Status::Online, Status::Warning, Status::Critical, Status::Offline] {
            let mut previous = u8::MAX;
            for avg in [90.5, 91.0, 95.0, 120.0, 1e6] {
                let s = score(status, &metrics(&[("cpu_usage", avg)]));
                assert!(s <= previous, "{status}: score rose at avg {avg}");
                previous = s;
            }
        }
    }

    #[test]
    fn counters_do_not_skew_a_healthy_router() {
        let m = metrics(&[
            ("cpu_usage", 20.0),
            ("memory_usage", 30.0),
            ("uptime", 86_400.0),
            ("interface_count", 4.0),
            ("interface_in_octets", 1e9),
            ("interface_out_octets", 4e8),
        ]);
        assert_eq!(score(Status::Online, &m), 85);
    }

    #[test]
    fn only_counters_skip_the_adjustment() {
        let m = metrics(&[("uptime", 3.0), ("interface_count", 2.0)]);
        assert_eq!(score(Status::Warning, &m), 45);
    }

    #[test]
    fn non_finite_values_are_skipped() {
        let m = metrics(&[("cpu_usage", f64::NAN), ("memory_usage", 50.0)]);
        assert_eq!(score(Status::Online, &m), 85);
    }

    #[test]
    fn risk_buckets() {
        assert_eq!(RiskLevel::from_score(0), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(29), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(30), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(85), RiskLevel::Low);
        assert_eq!(RiskLevel::High.recommended_action(), "Immediate maintenance required");
    }
}
