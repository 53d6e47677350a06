//! Host network counters for the server summary line.
//!
//! Only Linux exposes these through `/proc`; elsewhere the source reports
//! nothing.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub interface: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpStats {
    pub retransmits: u64,
}

pub trait NetStatsSource: Send + Sync {
    fn dev_stats(&self) -> Vec<DeviceStats>;
    fn tcp_stats(&self) -> TcpStats;
}

/// Reads `/proc/net/dev` and `/proc/net/snmp`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcNetStats;

impl NetStatsSource for ProcNetStats {
    fn dev_stats(&self) -> Vec<DeviceStats> {
        match fs::read_to_string("/proc/net/dev") {
            Ok(text) => parse_net_dev(&text),
            Err(e) => {
                debug!("Cannot read /proc/net/dev: {}", e);
                Vec::new()
            }
        }
    }

    fn tcp_stats(&self) -> TcpStats {
        match fs::read_to_string("/proc/net/snmp") {
            Ok(text) => parse_snmp_tcp(&text),
            Err(e) => {
                debug!("Cannot read /proc/net/snmp: {}", e);
                TcpStats::default()
            }
        }
    }
}

/// Parses `/proc/net/dev`, skipping the loopback device.
pub fn parse_net_dev(text: &str) -> Vec<DeviceStats> {
    text.lines()
        .skip(2)
        .filter_map(|line| {
            let (name, counters) = line.split_once(':')?;
            let name = name.trim();
            if name == "lo" {
                return None;
            }
            let fields: Vec<u64> = counters
                .split_whitespace()
                .map(|f| f.parse().unwrap_or(0))
                .collect();
            if fields.len() < 10 {
                return None;
            }
            Some(DeviceStats {
                interface: name.to_string(),
                rx_bytes: fields[0],
                rx_packets: fields[1],
                tx_bytes: fields[8],
                tx_packets: fields[9],
            })
        })
        .collect()
}

/// Pulls `RetransSegs` out of the `Tcp:` header/value line pair.
pub fn parse_snmp_tcp(text: &str) -> TcpStats {
    let mut tcp_lines = text.lines().filter(|l| l.starts_with("Tcp:"));
    let (Some(header), Some(values)) = (tcp_lines.next(), tcp_lines.next()) else {
        return TcpStats::default();
    };
    let retransmits = header
        .split_whitespace()
        .zip(values.split_whitespace())
        .find(|(name, _)| *name == "RetransSegs")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0);
    TcpStats { retransmits }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 1000      10    0    0    0     0          0         0     1000      10    0    0    0     0       0          0
  eth0: 123456    789    0    0    0     0          0         0    654321     987    0    0    0     0       0          0
";

    const SNMP: &str = "\
Ip: Forwarding DefaultTTL
Ip: 1 64
Tcp: RtoAlgorithm RtoMin RtoMax MaxConn ActiveOpens PassiveOpens AttemptFails EstabResets CurrEstab InSegs OutSegs RetransSegs InErrs OutRsts InCsumErrors
Tcp: 1 200 120000 -1 100 50 2 3 4 1000 2000 42 0 5 0
";

    #[test]
    fn test_parse_net_dev() {
        let stats = parse_net_dev(NET_DEV);
        assert_eq!(stats.len(), 1);
        assert_eq!(
            stats[0],
            DeviceStats {
                interface: "eth0".to_string(),
                rx_bytes: 123456,
                rx_packets: 789,
                tx_bytes: 654321,
                tx_packets: 987,
            }
        );
    }

    #[test]
    fn test_parse_snmp_retransmits() {
        assert_eq!(parse_snmp_tcp(SNMP).retransmits, 42);
        assert_eq!(parse_snmp_tcp("Ip: 1\n").retransmits, 0);
    }
}
