use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use ethrs::{Client, Config, Protocol, Server, TestType, DEFAULT_PORT};
use log::info;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ethrs")]
#[command(about = "Network performance measurement: bandwidth, connections, packets, latency, ping and traceroute", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProtocolArg {
    Tcp,
    Udp,
    Icmp,
}

impl From<ProtocolArg> for Protocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Tcp => Protocol::Tcp,
            ProtocolArg::Udp => Protocol::Udp,
            ProtocolArg::Icmp => Protocol::Icmp,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TestArg {
    /// Bandwidth
    #[value(name = "b")]
    Bandwidth,
    /// Connections per second
    #[value(name = "c")]
    Connections,
    /// Packets per second
    #[value(name = "p")]
    Packets,
    /// Round-trip latency
    #[value(name = "l")]
    Latency,
    /// Ping
    #[value(name = "pi")]
    Ping,
    /// Traceroute
    #[value(name = "tr")]
    TraceRoute,
    /// Continuous per-hop traceroute
    #[value(name = "mtr")]
    MyTraceRoute,
}

impl From<TestArg> for TestType {
    fn from(arg: TestArg) -> Self {
        match arg {
            TestArg::Bandwidth => TestType::Bandwidth,
            TestArg::Connections => TestType::ConnectionsPerSecond,
            TestArg::Packets => TestType::PacketsPerSecond,
            TestArg::Latency => TestType::Latency,
            TestArg::Ping => TestType::Ping,
            TestArg::TraceRoute => TestType::TraceRoute,
            TestArg::MyTraceRoute => TestType::MyTraceRoute,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run in server mode
    Server {
        /// Port to listen on (TCP and UDP)
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Bind to specific address
        #[arg(long)]
        bind: Option<IpAddr>,

        /// Print results as JSON lines
        #[arg(short = 'j', long)]
        json: bool,
    },

    /// Run in client mode
    Client {
        /// Server or destination host
        server: String,

        /// Port to connect to
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Protocol
        #[arg(short = 'p', long, value_enum, default_value = "tcp")]
        protocol: ProtocolArg,

        /// Test to run
        #[arg(short = 't', long = "test", value_enum, default_value = "b")]
        test: TestArg,

        /// Test duration in seconds
        #[arg(short = 'd', long, default_value_t = 10)]
        duration: u64,

        /// Number of parallel connections or senders
        #[arg(short = 'n', long, default_value_t = 1)]
        threads: u32,

        /// Buffer size in bytes (default depends on the test)
        #[arg(short = 'l', long)]
        length: Option<u32>,

        /// Target rate in bits/s, with optional K, M or G suffix
        #[arg(short = 'b', long, value_parser = parse_rate)]
        bandwidth: Option<u64>,

        /// Server sends, client receives (TCP bandwidth)
        #[arg(short = 'r', long)]
        reverse: bool,

        /// Round trips per latency measurement
        #[arg(short = 'i', long, default_value_t = 1000)]
        iterations: u32,

        /// Unmeasured round trips before latency measurement
        #[arg(short = 'w', long, default_value_t = 1)]
        warmup: u32,

        /// Gap between measurements in milliseconds
        #[arg(short = 'g', long)]
        gap: Option<u64>,

        /// IP type-of-service byte
        #[arg(long, default_value_t = 0)]
        tos: u8,

        /// Report interval in seconds
        #[arg(long, default_value_t = 1)]
        interval: u64,

        /// Maximum hops for traceroute
        #[arg(long, default_value_t = 30)]
        max_hops: u8,

        /// Per-probe timeout in milliseconds
        #[arg(long, default_value_t = 1000)]
        timeout: u64,

        /// Skip reverse DNS for traceroute hops
        #[arg(long)]
        no_dns: bool,

        /// Print results as JSON lines
        #[arg(short = 'j', long)]
        json: bool,
    },
}

/// Parses `100`, `10K`, `1.5M` or `2G` as bits per second.
fn parse_rate(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let (number, scale) = match value.chars().last() {
        Some('k') | Some('K') => (&value[..value.len() - 1], 1e3),
        Some('m') | Some('M') => (&value[..value.len() - 1], 1e6),
        Some('g') | Some('G') => (&value[..value.len() - 1], 1e9),
        _ => (value, 1.0),
    };
    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid rate '{}'", value))?;
    if !number.is_finite() || number < 0.0 {
        return Err(format!("invalid rate '{}'", value));
    }
    Ok((number * scale) as u64)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { port, bind, json } => {
            let mut config = Config::server(port).with_json(json);
            if let Some(bind) = bind {
                config = config.with_bind_addr(bind);
            }

            let server = Server::new(config);
            let shutdown = server.shutdown_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutting down");
                    shutdown.cancel();
                }
            });
            server.run().await.context("server failed")?;
        }

        Commands::Client {
            server,
            port,
            protocol,
            test,
            duration,
            threads,
            length,
            bandwidth,
            reverse,
            iterations,
            warmup,
            gap,
            tos,
            interval,
            max_hops,
            timeout,
            no_dns,
            json,
        } => {
            let mut config = Config::client(server, port)
                .with_protocol(protocol.into())
                .with_test_type(test.into())
                .with_duration(Duration::from_secs(duration))
                .with_threads(threads)
                .with_reverse(reverse)
                .with_rtt_count(iterations)
                .with_warmup_count(warmup)
                .with_tos(tos)
                .with_interval(Duration::from_secs(interval))
                .with_max_hops(max_hops)
                .with_probe_timeout(Duration::from_millis(timeout))
                .with_no_dns(no_dns)
                .with_json(json);
            if let Some(length) = length {
                config = config.with_buffer_size(length);
            }
            if let Some(bandwidth) = bandwidth {
                config = config.with_bandwidth(bandwidth);
            }
            if let Some(gap) = gap {
                config = config.with_gap(Duration::from_millis(gap));
            }

            let client = Client::new(config)?;
            let cancel = client.cancellation_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });
            client.run().await.context("test failed")?;
        }
    }

    Ok(())
}
