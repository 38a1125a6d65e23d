//! ICMP echo via the system `ping` binary.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::Fragment;
use crate::domain::device::DeviceConfig;
use crate::domain::types::{Method, Metrics};
use crate::domain::vocabulary::{LATENCY_MS, PACKET_LOSS};
use crate::error::{ProbeError, ProbeFailure};

#[derive(Debug, Clone, PartialEq)]
pub struct PingSummary {
    pub transmitted: u32,
    pub received: u32,
    pub round_trips_ms: Vec<f64>,
}

impl PingSummary {
    pub fn loss_percent(&self) -> f64 {
        if self.transmitted == 0 {
            return 100.0;
        }
        let lost = self.transmitted.saturating_sub(self.received);
        f64::from(lost) / f64::from(self.transmitted) * 100.0
    }

    pub fn average_ms(&self) -> Option<f64> {
        if self.round_trips_ms.is_empty() {
            return None;
        }
        Some(self.round_trips_ms.iter().sum::<f64>() / self.round_trips_ms.len() as f64)
    }
}

/// Share of the probe timeout ping may use, so it exits and prints its
/// summary before the outer timeout fires.
fn ping_budget(timeout: Duration) -> Duration {
    (timeout * 4 / 5).max(Duration::from_millis(100))
}

/// Timing flags for `count` echoes within `timeout`. BSD/macOS takes the
/// per-reply wait in milliseconds; iputils takes fractional seconds and an
/// integer-second deadline, which is only passed when a whole second fits.
fn timing_args(count: u32, timeout: Duration, bsd: bool) -> Vec<String> {
    let budget_ms = u64::try_from(ping_budget(timeout).as_millis()).unwrap_or(u64::MAX);
    let count = u64::from(count.max(1));
    let per_reply_ms = (budget_ms / count).max(50);
    let deadline_secs = budget_ms / 1000;

    let mut args = Vec::new();
    if bsd {
        args.extend(["-W".to_string(), per_reply_ms.to_string()]);
        if deadline_secs >= 1 {
            args.extend(["-t".to_string(), deadline_secs.to_string()]);
        }
    } else {
        if count > 1 {
            args.extend(["-i".to_string(), "0.2".to_string()]);
        }
        args.extend(["-W".to_string(), format!("{:.3}", per_reply_ms as f64 / 1000.0)]);
        if deadline_secs >= 1 {
            args.extend(["-w".to_string(), deadline_secs.to_string()]);
        }
    }
    args
}

fn command(address: &str, count: u32, timeout: Duration) -> Command {
    let mut cmd = Command::new("ping");
    cmd.arg("-c")
        .arg(count.to_string())
        .args(timing_args(count, timeout, cfg!(target_os = "macos")))
        .arg(address)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

pub async fn probe(device: &DeviceConfig, timeout: Duration) -> Fragment {
    let output = match command(&device.address, device.ping_count, timeout).output().await {
        Ok(output) => output,
        Err(e) => {
            return Fragment::failed(
                Method::Ping,
                ProbeError::new(
                    Method::Ping,
                    ProbeFailure::Unreachable,
                    format!("could not run ping: {e}"),
                ),
            )
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let Some(summary) = parse_output(&stdout) else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Fragment::failed(
            Method::Ping,
            ProbeError::new(
                Method::Ping,
                ProbeFailure::Unreachable,
                format!("no ping summary: {}", stderr.trim()),
            ),
        );
    };

    let mut metrics = Metrics::new();
    metrics.insert(PACKET_LOSS.into(), summary.loss_percent());
    let latency_ms = summary.average_ms();
    if let Some(avg) = latency_ms {
        metrics.insert(LATENCY_MS.into(), avg);
    }

    let reachable = summary.received > 0;
    let error = (!reachable).then(|| {
        ProbeError::new(
            Method::Ping,
            ProbeFailure::Unreachable,
            format!("100% packet loss ({} sent)", summary.transmitted),
        )
    });

    Fragment {
        method: Method::Ping,
        reachable,
        latency_ms,
        metrics,
        error,
    }
}

/// Parse Linux or BSD/macOS `ping` output. `None` when there is no
/// transmit/receive summary line.
pub fn parse_output(stdout: &str) -> Option<PingSummary> {
    let round_trips_ms = stdout.lines().filter_map(reply_time).collect();

    let summary = stdout.lines().find(|l| l.contains("packets transmitted"))?;
    let mut parts = summary.split(',');
    let transmitted = leading_number(parts.next()?)?;
    let received = leading_number(parts.next()?)?;

    Some(PingSummary {
        transmitted,
        received,
        round_trips_ms,
    })
}

fn leading_number(part: &str) -> Option<u32> {
    part.split_whitespace().next()?.parse().ok()
}

fn reply_time(line: &str) -> Option<f64> {
    let rest = &line[line.find("time=")? + "time=".len()..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINUX_OK: &str = "\
PING 192.168.1.1 (192.168.1.1) 56(84) bytes of data.
64 bytes from 192.168.1.1: icmp_seq=1 ttl=64 time=1.20 ms
64 bytes from 192.168.1.1: icmp_seq=2 ttl=64 time=2.40 ms

--- 192.168.1.1 ping statistics ---
3 packets transmitted, 2 received, 33.3333% packet loss, time 2003ms
rtt min/avg/max/mdev = 1.200/1.800/2.400/0.600 ms
";

    const MACOS_OK: &str = "\
PING 10.0.0.1 (10.0.0.1): 56 data bytes
64 bytes from 10.0.0.1: icmp_seq=0 ttl=64 time=3.000 ms

--- 10.0.0.1 ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
";

    const LINUX_DOWN: &str = "\
PING 10.9.9.9 (10.9.9.9) 56(84) bytes of data.

--- 10.9.9.9 ping statistics ---
3 packets transmitted, 0 received, 100% packet loss, time 2050ms
";

    #[test]
    fn parses_linux_partial_loss() {
        let s = parse_output(LINUX_OK).unwrap();
        assert_eq!(s.transmitted, 3);
        assert_eq!(s.received, 2);
        assert_eq!(s.round_trips_ms, vec![1.2, 2.4]);
        assert!((s.average_ms().unwrap() - 1.8).abs() < 1e-9);
        assert!((s.loss_percent() - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn parses_macos_summary() {
        let s = parse_output(MACOS_OK).unwrap();
        assert_eq!((s.transmitted, s.received), (1, 1));
        assert_eq!(s.average_ms(), Some(3.0));
        assert_eq!(s.loss_percent(), 0.0);
    }

    #[test]
    fn total_loss_has_no_latency() {
        let s = parse_output(LINUX_DOWN).unwrap();
        assert_eq!(s.received, 0);
        assert_eq!(s.average_ms(), None);
        assert_eq!(s.loss_percent(), 100.0);
    }

    fn flag(args: &[String], name: &str) -> Option<String> {
        let pos = args.iter().position(|a| a == name)?;
        args.get(pos + 1).cloned()
    }

    #[test]
    fn one_second_timeout_leaves_room_for_the_summary() {
        let linux = timing_args(1, Duration::from_secs(1), false);
        assert_eq!(flag(&linux, "-W").as_deref(), Some("0.800"));
        assert_eq!(flag(&linux, "-w"), None);

        let macos = timing_args(1, Duration::from_secs(1), true);
        assert_eq!(flag(&macos, "-W").as_deref(), Some("800"));
        assert_eq!(flag(&macos, "-t"), None);
    }

    #[test]
    fn deadline_stays_inside_the_timeout() {
        for ms in [1_500u64, 2_000, 10_000] {
            let timeout = Duration::from_millis(ms);
            let args = timing_args(3, timeout, false);
            let deadline: u64 = flag(&args, "-w").unwrap().parse().unwrap();
            assert!(deadline * 1000 < ms, "deadline {deadline}s for {ms}ms");
            assert_eq!(flag(&args, "-i").as_deref(), Some("0.2"));
        }
    }

    #[test]
    fn garbage_has_no_summary() {
        assert_eq!(parse_output("ping: unknown host nowhere"), None);
    }
}
