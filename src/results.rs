//! Result data model and the aggregators that reduce a batch of
//! intermediate results into one published result.
//!
//! Workers push small per-sample bodies (bytes moved, connections made, raw
//! round trips). Once per publish interval the owning test hands the batch
//! to its [`Aggregator`] together with the elapsed whole seconds (never
//! less than 1).

use crate::config::TestType;
use crate::latency::LatencyStats;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Reduces `(elapsed_seconds, batch)` into one result.
pub type Aggregator = fn(u64, &[TestResult]) -> TestResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BandwidthPayload {
    pub bytes: u64,
    pub bits_per_second: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpsPayload {
    pub connections: u64,
    pub connections_per_second: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PpsPayload {
    pub packets: u64,
    pub bytes: u64,
    pub packets_per_second: u64,
    pub bits_per_second: u64,
}

/// Ping counters. Workers report one attempt at a time with its round trip
/// in `rtts`; the aggregated form carries reduced `latency` instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    pub sent: u64,
    pub received: u64,
    pub lost: u64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub rtts: Vec<Duration>,
    pub latency: Option<LatencyStats>,
}

/// Server-side totals for connectionless traffic from one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerAggregate {
    pub bytes: u64,
    pub packets: u64,
    pub bits_per_second: u64,
    pub packets_per_second: u64,
}

/// Rolling statistics for one traceroute hop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkHop {
    pub addr: Option<IpAddr>,
    pub sent: u32,
    pub received: u32,
    pub lost: u32,
    pub last: Duration,
    pub best: Duration,
    pub worst: Duration,
    pub total: Duration,
    pub average: Duration,
    /// First label of the reverse-DNS name
    pub name: String,
    pub full_name: String,
}

impl NetworkHop {
    pub fn new(addr: Option<IpAddr>) -> Self {
        Self {
            addr,
            ..Default::default()
        }
    }

    /// Folds in one answered probe.
    pub fn record_reply(&mut self, rtt: Duration) {
        self.sent += 1;
        self.received += 1;
        self.last = rtt;
        if self.received == 1 || rtt < self.best {
            self.best = rtt;
        }
        if rtt > self.worst {
            self.worst = rtt;
        }
        self.total += rtt;
        self.average = self.total / self.received;
    }

    /// Folds in one unanswered (or mismatched) probe.
    pub fn record_loss(&mut self) {
        self.sent += 1;
        self.lost += 1;
    }

    pub fn set_names(&mut self, full_name: &str) {
        self.full_name = full_name.to_string();
        self.name = full_name
            .split('.')
            .next()
            .unwrap_or(full_name)
            .to_string();
    }

    /// Loss as a percentage of probes sent.
    pub fn loss_percent(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        self.lost as f64 * 100.0 / self.sent as f64
    }
}

/// Protocol-specific result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultBody {
    Bandwidth(BandwidthPayload),
    Cps(CpsPayload),
    Pps(PpsPayload),
    /// Unreduced round trips from one latency round
    LatencyRaw(Vec<Duration>),
    Latency(LatencyStats),
    Ping(PingPayload),
    TraceRoute(Vec<NetworkHop>),
    ServerAggregate(ServerAggregate),
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub body: ResultBody,
}

impl TestResult {
    pub fn ok(body: ResultBody) -> Self {
        Self {
            success: true,
            error: None,
            body,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            body: ResultBody::None,
        }
    }

    pub fn bandwidth(bytes: u64) -> Self {
        Self::ok(ResultBody::Bandwidth(BandwidthPayload {
            bytes,
            bits_per_second: 0,
        }))
    }

    pub fn connections(connections: u64) -> Self {
        Self::ok(ResultBody::Cps(CpsPayload {
            connections,
            connections_per_second: 0,
        }))
    }

    pub fn packets(packets: u64, bytes: u64) -> Self {
        Self::ok(ResultBody::Pps(PpsPayload {
            packets,
            bytes,
            ..Default::default()
        }))
    }

    /// One ping attempt; `None` for a lost probe.
    pub fn ping_attempt(rtt: Option<Duration>) -> Self {
        let payload = match rtt {
            Some(rtt) => PingPayload {
                sent: 1,
                received: 1,
                rtts: vec![rtt],
                ..Default::default()
            },
            None => PingPayload {
                sent: 1,
                lost: 1,
                ..Default::default()
            },
        };
        Self::ok(ResultBody::Ping(payload))
    }
}

/// Aggregator a test of `test_type` publishes with; `None` for tests that
/// publish snapshots directly.
pub fn aggregator_for(test_type: TestType) -> Option<Aggregator> {
    match test_type {
        TestType::Server => Some(aggregate_server),
        TestType::Bandwidth => Some(aggregate_bandwidth),
        TestType::ConnectionsPerSecond => Some(aggregate_cps),
        TestType::PacketsPerSecond => Some(aggregate_pps),
        TestType::Latency => Some(aggregate_latency),
        TestType::Ping => Some(aggregate_ping),
        TestType::TraceRoute | TestType::MyTraceRoute => None,
    }
}

/// If the batch held only failures, the first of them.
fn first_failure(results: &[TestResult]) -> Option<TestResult> {
    if results.iter().any(|r| r.success) {
        return None;
    }
    results.first().cloned()
}

fn per_second(total: u64, seconds: u64) -> u64 {
    total / seconds.max(1)
}

/// Sums transferred bytes into bits per second.
pub fn aggregate_bandwidth(seconds: u64, results: &[TestResult]) -> TestResult {
    if let Some(failure) = first_failure(results) {
        return failure;
    }
    let bytes: u64 = results
        .iter()
        .filter_map(|r| match &r.body {
            ResultBody::Bandwidth(b) => Some(b.bytes),
            _ => None,
        })
        .sum();
    TestResult::ok(ResultBody::Bandwidth(BandwidthPayload {
        bytes,
        bits_per_second: per_second(bytes.saturating_mul(8), seconds),
    }))
}

pub fn aggregate_cps(seconds: u64, results: &[TestResult]) -> TestResult {
    if let Some(failure) = first_failure(results) {
        return failure;
    }
    let connections: u64 = results
        .iter()
        .filter_map(|r| match &r.body {
            ResultBody::Cps(c) => Some(c.connections),
            _ => None,
        })
        .sum();
    TestResult::ok(ResultBody::Cps(CpsPayload {
        connections,
        connections_per_second: per_second(connections, seconds),
    }))
}

fn sum_packets(results: &[TestResult]) -> (u64, u64) {
    results
        .iter()
        .filter_map(|r| match &r.body {
            ResultBody::Pps(p) => Some((p.packets, p.bytes)),
            _ => None,
        })
        .fold((0, 0), |(pk, by), (p, b)| (pk + p, by + b))
}

pub fn aggregate_pps(seconds: u64, results: &[TestResult]) -> TestResult {
    if let Some(failure) = first_failure(results) {
        return failure;
    }
    let (packets, bytes) = sum_packets(results);
    TestResult::ok(ResultBody::Pps(PpsPayload {
        packets,
        bytes,
        packets_per_second: per_second(packets, seconds),
        bits_per_second: per_second(bytes.saturating_mul(8), seconds),
    }))
}

/// Concatenates raw round trips and reduces them.
pub fn aggregate_latency(_seconds: u64, results: &[TestResult]) -> TestResult {
    if let Some(failure) = first_failure(results) {
        return failure;
    }
    let samples: Vec<Duration> = results
        .iter()
        .filter_map(|r| match &r.body {
            ResultBody::LatencyRaw(s) => Some(s.as_slice()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect();
    match LatencyStats::calculate(&samples) {
        Some(stats) => TestResult::ok(ResultBody::Latency(stats)),
        None => TestResult::ok(ResultBody::None),
    }
}

pub fn aggregate_ping(_seconds: u64, results: &[TestResult]) -> TestResult {
    if let Some(failure) = first_failure(results) {
        return failure;
    }
    let mut total = PingPayload::default();
    let mut rtts = Vec::new();
    for result in results {
        if let ResultBody::Ping(p) = &result.body {
            total.sent += p.sent;
            total.received += p.received;
            total.lost += p.lost;
            rtts.extend_from_slice(&p.rtts);
        }
    }
    total.latency = LatencyStats::calculate(&rtts);
    TestResult::ok(ResultBody::Ping(total))
}

/// Server view of datagram traffic: bandwidth plus packet rate.
pub fn aggregate_server(seconds: u64, results: &[TestResult]) -> TestResult {
    if let Some(failure) = first_failure(results) {
        return failure;
    }
    let (packets, bytes) = sum_packets(results);
    TestResult::ok(ResultBody::ServerAggregate(ServerAggregate {
        bytes,
        packets,
        bits_per_second: per_second(bytes.saturating_mul(8), seconds),
        packets_per_second: per_second(packets, seconds),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_aggregate_bandwidth() {
        let batch = vec![TestResult::bandwidth(1_000), TestResult::bandwidth(3_000)];
        let result = aggregate_bandwidth(2, &batch);

        assert!(result.success);
        assert_eq!(
            result.body,
            ResultBody::Bandwidth(BandwidthPayload {
                bytes: 4_000,
                bits_per_second: 16_000,
            })
        );
    }

    #[test]
    fn test_aggregate_cps_per_second() {
        let batch: Vec<_> = (0..10).map(|_| TestResult::connections(1)).collect();
        match aggregate_cps(1, &batch).body {
            ResultBody::Cps(c) => {
                assert_eq!(c.connections, 10);
                assert_eq!(c.connections_per_second, 10);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_aggregate_pps_and_server() {
        let batch = vec![TestResult::packets(100, 100), TestResult::packets(50, 50)];

        match aggregate_pps(1, &batch).body {
            ResultBody::Pps(p) => {
                assert_eq!(p.packets_per_second, 150);
                assert_eq!(p.bits_per_second, 1200);
            }
            other => panic!("unexpected body {:?}", other),
        }
        match aggregate_server(3, &batch).body {
            ResultBody::ServerAggregate(s) => {
                assert_eq!(s.packets, 150);
                assert_eq!(s.packets_per_second, 50);
                assert_eq!(s.bits_per_second, 400);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_aggregate_latency_concatenates_rounds() {
        let batch = vec![
            TestResult::ok(ResultBody::LatencyRaw(vec![ms(10), ms(20)])),
            TestResult::ok(ResultBody::LatencyRaw(vec![ms(30)])),
        ];
        match aggregate_latency(1, &batch).body {
            ResultBody::Latency(stats) => {
                assert_eq!(stats.count, 3);
                assert_eq!(stats.avg, ms(20));
                assert_eq!(stats.max, ms(30));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_aggregate_ping_counts_losses() {
        let batch = vec![
            TestResult::ping_attempt(Some(ms(5))),
            TestResult::ping_attempt(None),
            TestResult::ping_attempt(Some(ms(7))),
        ];
        match aggregate_ping(1, &batch).body {
            ResultBody::Ping(p) => {
                assert_eq!(p.sent, 3);
                assert_eq!(p.received, 2);
                assert_eq!(p.lost, 1);
                assert!(p.rtts.is_empty());
                assert_eq!(p.latency.unwrap().avg, ms(6));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_all_failures_propagate() {
        let batch = vec![TestResult::failed("connection reset")];
        let result = aggregate_bandwidth(1, &batch);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("connection reset"));

        // One success is enough to report numbers.
        let batch = vec![TestResult::failed("reset"), TestResult::bandwidth(10)];
        assert!(aggregate_bandwidth(1, &batch).success);
    }

    #[test]
    fn test_zero_seconds_clamped() {
        let result = aggregate_bandwidth(0, &[TestResult::bandwidth(1)]);
        match result.body {
            ResultBody::Bandwidth(b) => assert_eq!(b.bits_per_second, 8),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_traceroute_publishes_directly() {
        assert!(aggregator_for(TestType::TraceRoute).is_none());
        assert!(aggregator_for(TestType::MyTraceRoute).is_none());
        assert!(aggregator_for(TestType::Bandwidth).is_some());
    }

    #[test]
    fn test_network_hop_statistics() {
        let mut hop = NetworkHop::new(Some("10.0.0.1".parse().unwrap()));
        hop.record_reply(ms(20));
        hop.record_reply(ms(10));
        hop.record_loss();
        hop.record_reply(ms(30));

        assert_eq!(hop.sent, 4);
        assert_eq!(hop.received, 3);
        assert_eq!(hop.lost, 1);
        assert_eq!(hop.last, ms(30));
        assert_eq!(hop.best, ms(10));
        assert_eq!(hop.worst, ms(30));
        assert_eq!(hop.total, ms(60));
        assert_eq!(hop.average, ms(20));
        assert_eq!(hop.loss_percent(), 25.0);
    }

    #[test]
    fn test_network_hop_names() {
        let mut hop = NetworkHop::new(None);
        hop.set_names("gw1.example.net");
        assert_eq!(hop.name, "gw1");
        assert_eq!(hop.full_name, "gw1.example.net");
    }

    #[test]
    fn test_result_json_shape() {
        let json = serde_json::to_value(TestResult::bandwidth(42)).unwrap();
        assert_eq!(json["success"], true);
        assert!(json.get("error").is_none());
        assert_eq!(json["body"]["Bandwidth"]["bytes"], 42);
    }
}
