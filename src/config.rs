use crate::protocol::ClientParam;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Default control/data port used by client and server.
pub const DEFAULT_PORT: u16 = 8888;

/// Transport protocol a test runs over.
///
/// # Examples
///
/// ```
/// use ethrs::{Config, Protocol, TestType};
///
/// let config = Config::client("127.0.0.1".to_string(), 8888)
///     .with_protocol(Protocol::Udp)
///     .with_test_type(TestType::PacketsPerSecond);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Transmission Control Protocol
    Tcp,
    /// User Datagram Protocol
    Udp,
    /// Internet Control Message Protocol (ping and traceroute only)
    Icmp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
        };
        f.write_str(name)
    }
}

/// The kind of measurement a test performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestType {
    /// Server-side placeholder used for aggregate views.
    Server,
    Bandwidth,
    ConnectionsPerSecond,
    PacketsPerSecond,
    Latency,
    Ping,
    TraceRoute,
    MyTraceRoute,
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestType::Server => "Server",
            TestType::Bandwidth => "Bandwidth",
            TestType::ConnectionsPerSecond => "Connections/s",
            TestType::PacketsPerSecond => "Packets/s",
            TestType::Latency => "Latency",
            TestType::Ping => "Ping",
            TestType::TraceRoute => "TraceRoute",
            TestType::MyTraceRoute => "MyTraceRoute",
        };
        f.write_str(name)
    }
}

/// Identity of a measurement against one peer: (protocol, test type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestId {
    pub protocol: Protocol,
    pub test_type: TestType,
}

impl TestId {
    pub fn new(protocol: Protocol, test_type: TestType) -> Self {
        Self {
            protocol,
            test_type,
        }
    }

    /// Whether this test is usable with the given protocol at all.
    pub fn is_supported(&self) -> bool {
        use Protocol::*;
        use TestType::*;
        matches!(
            (self.test_type, self.protocol),
            (Bandwidth, Tcp)
                | (Bandwidth, Udp)
                | (ConnectionsPerSecond, Tcp)
                | (PacketsPerSecond, Udp)
                | (Latency, Tcp)
                | (Ping, Tcp)
                | (Ping, Icmp)
                | (TraceRoute, Icmp)
                | (MyTraceRoute, Icmp)
        )
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.test_type)
    }
}

/// Test mode: client or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Server mode - listens for incoming connections and datagrams
    Server,
    /// Client mode - drives a test against a server or a remote endpoint
    Client,
}

/// Configuration for client and server.
///
/// Use the builder methods to customize. Parameters left unset fall back to
/// per-test defaults when [`Config::client_param`] resolves them.
///
/// # Examples
///
/// ## Bandwidth test with four connections
///
/// ```
/// use ethrs::{Config, TestType};
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100".to_string(), 8888)
///     .with_test_type(TestType::Bandwidth)
///     .with_threads(4)
///     .with_duration(Duration::from_secs(10));
///
/// let param = config.client_param();
/// assert_eq!(param.num_threads, 4);
/// assert_eq!(param.buffer_size, 16 * 1024);
/// ```
///
/// ## Server
///
/// ```
/// use ethrs::Config;
///
/// let config = Config::server(8888);
/// assert_eq!(config.port, 8888);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server mode or client mode
    pub mode: Mode,

    /// Protocol to use
    pub protocol: Protocol,

    /// Measurement to run (client mode)
    pub test_type: TestType,

    /// Port number to use
    pub port: u16,

    /// Remote address (client mode)
    pub server_addr: Option<String>,

    /// Bind address (server mode)
    pub bind_addr: Option<IpAddr>,

    /// Test duration
    pub duration: Duration,

    /// Number of parallel connections / sending tasks
    pub num_threads: u32,

    /// Buffer size in bytes, `None` for the per-test default
    pub buffer_size: Option<u32>,

    /// Round trips measured per latency round
    pub rtt_count: u32,

    /// Reverse mode (server sends, client receives)
    pub reverse: bool,

    /// Target bandwidth in bits per second, `None` for unlimited
    pub bandwidth: Option<u64>,

    /// Latency round trips discarded before sampling
    pub warmup_count: u32,

    /// Gap between samples, `None` for the per-test default
    pub gap: Option<Duration>,

    /// IP type-of-service byte applied to data sockets
    pub tos: u8,

    /// Output in JSON format
    pub json: bool,

    /// Interval at which aggregated results are published
    pub interval: Duration,

    /// Maximum TTL probed by traceroute
    pub max_hops: u8,

    /// Per-probe timeout for ICMP and TCP connect probes
    pub probe_timeout: Duration,

    /// Skip reverse DNS lookups of traceroute hops
    pub no_dns: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            protocol: Protocol::Tcp,
            test_type: TestType::Bandwidth,
            port: DEFAULT_PORT,
            server_addr: None,
            bind_addr: None,
            duration: Duration::from_secs(10),
            num_threads: 1,
            buffer_size: None,
            rtt_count: 1000,
            reverse: false,
            bandwidth: None,
            warmup_count: 1,
            gap: None,
            tos: 0,
            json: false,
            interval: Duration::from_secs(1),
            max_hops: 30,
            probe_timeout: Duration::from_secs(1),
            no_dns: false,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new server configuration listening on `port`.
    pub fn server(port: u16) -> Self {
        Self {
            mode: Mode::Server,
            port,
            ..Default::default()
        }
    }

    /// Creates a new client configuration targeting `server_addr:port`.
    pub fn client(server_addr: String, port: u16) -> Self {
        Self {
            mode: Mode::Client,
            server_addr: Some(server_addr),
            port,
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_test_type(mut self, test_type: TestType) -> Self {
        self.test_type = test_type;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Sets the number of parallel connections (or sending tasks for UDP).
    pub fn with_threads(mut self, num_threads: u32) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_buffer_size(mut self, size: u32) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn with_rtt_count(mut self, rtt_count: u32) -> Self {
        self.rtt_count = rtt_count;
        self
    }

    /// Restricts the server to one local address.
    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    /// Sets the target send rate in bits per second.
    ///
    /// ```
    /// use ethrs::Config;
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 8888)
    ///     .with_bandwidth(100_000_000); // 100 Mbps
    /// assert_eq!(config.client_param().bw_rate, 100_000_000);
    /// ```
    pub fn with_bandwidth(mut self, bandwidth: u64) -> Self {
        self.bandwidth = Some(bandwidth);
        self
    }

    pub fn with_warmup_count(mut self, warmup_count: u32) -> Self {
        self.warmup_count = warmup_count;
        self
    }

    pub fn with_gap(mut self, gap: Duration) -> Self {
        self.gap = Some(gap);
        self
    }

    pub fn with_tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_hops(mut self, max_hops: u8) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_no_dns(mut self, no_dns: bool) -> Self {
        self.no_dns = no_dns;
        self
    }

    pub fn test_id(&self) -> TestId {
        TestId::new(self.protocol, self.test_type)
    }

    /// Buffer size used when none is configured explicitly.
    pub fn default_buffer_size(test_id: TestId) -> u32 {
        match (test_id.test_type, test_id.protocol) {
            (TestType::Bandwidth, Protocol::Tcp) => 16 * 1024,
            (TestType::Bandwidth, _) => 1024,
            (TestType::PacketsPerSecond, _) | (TestType::Latency, _) => 1,
            _ => 0,
        }
    }

    /// Gap between samples used when none is configured explicitly.
    pub fn default_gap(test_type: TestType) -> Duration {
        match test_type {
            TestType::Ping | TestType::TraceRoute | TestType::MyTraceRoute => {
                Duration::from_secs(1)
            }
            _ => Duration::ZERO,
        }
    }

    /// Resolves the parameters sent to the server in the handshake.
    pub fn client_param(&self) -> ClientParam {
        let test_id = self.test_id();
        ClientParam {
            num_threads: self.num_threads.max(1),
            buffer_size: self
                .buffer_size
                .unwrap_or_else(|| Self::default_buffer_size(test_id)),
            rtt_count: self.rtt_count.max(1),
            reverse: self.reverse,
            duration: self.duration,
            gap: self.gap.unwrap_or_else(|| Self::default_gap(self.test_type)),
            warmup_count: self.warmup_count,
            bw_rate: self.bandwidth.unwrap_or(0),
            tos: self.tos,
        }
    }

    /// Checks that the configured test can run.
    pub fn validate(&self) -> Result<()> {
        if self.mode == Mode::Server {
            return Ok(());
        }
        if self.server_addr.is_none() {
            return Err(Error::Config(
                "Server address is required for client mode".to_string(),
            ));
        }
        let test_id = self.test_id();
        if !test_id.is_supported() {
            return Err(Error::Config(format!(
                "{} test is not supported over {}",
                self.test_type, self.protocol
            )));
        }
        if self.num_threads == 0 {
            return Err(Error::Config("Thread count must be at least 1".to_string()));
        }
        if self.interval.is_zero() {
            return Err(Error::Config(
                "Publish interval must be non-zero".to_string(),
            ));
        }
        if self.max_hops == 0 {
            return Err(Error::Config("Max hops must be at least 1".to_string()));
        }
        if self.buffer_size == Some(0) {
            return Err(Error::Config("Buffer size must be non-zero".to_string()));
        }
        if self.reverse && test_id != TestId::new(Protocol::Tcp, TestType::Bandwidth) {
            return Err(Error::Config(format!(
                "Reverse mode is only available for TCP bandwidth, not {}",
                test_id
            )));
        }
        Ok(())
    }
}
