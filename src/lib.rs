//! ethrs - network performance measurement
//!
//! A client drives one test against a cooperating server (or, for ICMP,
//! any reachable host) and reports periodic results:
//!
//! - TCP bandwidth, optionally reversed and rate limited
//! - TCP connections per second
//! - UDP bandwidth and packets per second
//! - TCP round-trip latency with percentiles and jitter
//! - TCP and ICMP ping
//! - ICMP traceroute and continuous per-hop probing (mtr)
//!
//! The server answers the SYN/ACK handshake, runs the server side of each
//! test and keeps one session per peer IP holding that peer's tests.

pub mod client;
pub mod config;
pub mod error;
pub mod icmp;
pub mod latency;
pub mod logger;
pub mod netstats;
pub mod protocol;
pub mod results;
pub mod server;
pub mod session;
pub mod throttle;
pub mod traceroute;
pub mod transfer;

pub use client::{Client, ProgressCallback, ProgressEvent, TestSummary};
pub use config::{Config, Mode, Protocol, TestId, TestType, DEFAULT_PORT};
pub use error::{Error, Result};
pub use latency::LatencyStats;
pub use logger::{ConsoleLogger, Logger};
pub use results::{NetworkHop, ResultBody, TestResult};
pub use server::Server;
pub use session::SessionRegistry;
pub use test::Test;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
