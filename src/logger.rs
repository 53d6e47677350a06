//! Result and message sink used by client and server.
//!
//! [`ConsoleLogger`] forwards plain messages to the `log` facade and
//! prints test results to stdout, either as aligned text or as one JSON
//! object per line.

use crate::config::{Protocol, TestType};
use crate::latency::LatencyStats;
use crate::results::{NetworkHop, ResultBody};
use chrono::Utc;
use log::{debug, error, info};
use serde_json::json;
use std::net::IpAddr;
use std::time::Duration;

pub trait Logger: Send + Sync {
    fn error(&self, msg: &str);
    fn info(&self, msg: &str);
    fn debug(&self, msg: &str);

    /// Reports one published result.
    fn test_result(
        &self,
        test_type: TestType,
        success: bool,
        protocol: Protocol,
        remote_ip: IpAddr,
        remote_port: u16,
        body: &ResultBody,
    );
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleLogger {
    pub json: bool,
}

impl ConsoleLogger {
    pub fn new(json: bool) -> Self {
        Self { json }
    }
}

impl Logger for ConsoleLogger {
    fn error(&self, msg: &str) {
        error!("{}", msg);
    }

    fn info(&self, msg: &str) {
        info!("{}", msg);
    }

    fn debug(&self, msg: &str) {
        debug!("{}", msg);
    }

    fn test_result(
        &self,
        test_type: TestType,
        success: bool,
        protocol: Protocol,
        remote_ip: IpAddr,
        remote_port: u16,
        body: &ResultBody,
    ) {
        if self.json {
            let line = json!({
                "time": Utc::now().to_rfc3339(),
                "type": test_type.to_string(),
                "success": success,
                "protocol": protocol.to_string(),
                "remote_ip": remote_ip.to_string(),
                "remote_port": remote_port,
                "result": body,
            });
            println!("{}", line);
            return;
        }

        let peer = format!("{}:{}", remote_ip, remote_port);
        if !success {
            println!("[{:>21}] {} {} failed", peer, protocol, test_type);
            return;
        }
        for line in format_body(body) {
            println!("[{:>21}] {:<4} {}", peer, protocol.to_string(), line);
        }
    }
}

/// Bits per second with a decimal unit.
pub fn format_bits_per_second(bits: u64) -> String {
    let bits = bits as f64;
    if bits >= 1_000_000_000.0 {
        format!("{:6.2} Gbits/sec", bits / 1_000_000_000.0)
    } else if bits >= 1_000_000.0 {
        format!("{:6.2} Mbits/sec", bits / 1_000_000.0)
    } else if bits >= 1_000.0 {
        format!("{:6.2} Kbits/sec", bits / 1_000.0)
    } else {
        format!("{:6.0} bits/sec", bits)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    let value = bytes as f64;
    if bytes >= 1_000_000_000 {
        format!("{:6.2} GBytes", value / 1_000_000_000.0)
    } else if bytes >= 1_000_000 {
        format!("{:6.2} MBytes", value / 1_000_000.0)
    } else {
        format!("{:6.2} KBytes", value / 1_000.0)
    }
}

pub fn format_duration(d: Duration) -> String {
    let micros = d.as_micros();
    if micros >= 1_000_000 {
        format!("{:.2}s", d.as_secs_f64())
    } else if micros >= 1_000 {
        format!("{:.2}ms", micros as f64 / 1_000.0)
    } else {
        format!("{}us", micros)
    }
}

fn format_latency(stats: &LatencyStats) -> String {
    format!(
        "avg {} min {} p50 {} p90 {} p95 {} p99 {} p99.9 {} p99.99 {} max {} jitter {}",
        format_duration(stats.avg),
        format_duration(stats.min),
        format_duration(stats.p50),
        format_duration(stats.p90),
        format_duration(stats.p95),
        format_duration(stats.p99),
        format_duration(stats.p999),
        format_duration(stats.p9999),
        format_duration(stats.max),
        format_duration(stats.jitter),
    )
}

fn format_hop(index: usize, hop: &NetworkHop) -> String {
    let Some(addr) = hop.addr else {
        return format!("{:2}. ???", index + 1);
    };
    let name = if hop.full_name.is_empty() {
        addr.to_string()
    } else {
        format!("{} ({})", hop.full_name, addr)
    };
    format!(
        "{:2}. {:<40} sent {:4} lost {:5.1}% last {:>9} avg {:>9} best {:>9} worst {:>9}",
        index + 1,
        name,
        hop.sent,
        hop.loss_percent(),
        format_duration(hop.last),
        format_duration(hop.average),
        format_duration(hop.best),
        format_duration(hop.worst),
    )
}

/// Human-readable lines for a result body.
pub fn format_body(body: &ResultBody) -> Vec<String> {
    match body {
        ResultBody::Bandwidth(b) => vec![format!(
            "{}  {}",
            format_bytes(b.bytes),
            format_bits_per_second(b.bits_per_second)
        )],
        ResultBody::Cps(c) => vec![format!("{:8} connections/sec", c.connections_per_second)],
        ResultBody::Pps(p) => vec![format!(
            "{:8} packets/sec  {}",
            p.packets_per_second,
            format_bits_per_second(p.bits_per_second)
        )],
        ResultBody::LatencyRaw(samples) => vec![format!("{} raw samples", samples.len())],
        ResultBody::Latency(stats) => vec![format_latency(stats)],
        ResultBody::Ping(p) => {
            let mut line = format!("sent {} received {} lost {}", p.sent, p.received, p.lost);
            if let Some(stats) = &p.latency {
                line.push_str("  ");
                line.push_str(&format_latency(stats));
            }
            vec![line]
        }
        ResultBody::TraceRoute(hops) => hops
            .iter()
            .enumerate()
            .map(|(i, hop)| format_hop(i, hop))
            .collect(),
        ResultBody::ServerAggregate(s) => vec![format!(
            "{}  {:8} packets/sec",
            format_bits_per_second(s.bits_per_second),
            s.packets_per_second
        )],
        ResultBody::None => Vec::new(),
    }
}
