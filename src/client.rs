use crate::config::{Config, Protocol, TestId, TestType};
use crate::icmp::{IcmpProber, ProbeOutcome, Prober};
use crate::logger::{ConsoleLogger, Logger};
use crate::protocol::handshake_client;
use crate::results::{aggregator_for, ResultBody, TestResult};
use crate::session::SessionRegistry;
use crate::test::Test;
use crate::throttle::Throttle;
use crate::traceroute::{probe_once, DnsLookup, TraceRouteEngine};
use crate::transfer::{receive_bytes, send_bytes, Tally};
use crate::{Error, Result};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use socket2::SockRef;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Hop index used for ping probes, i.e. the largest TTL.
const PING_HOP: u8 = u8::MAX - 1;

/// Progress event types reported during test execution.
///
/// # Examples
///
/// ```no_run
/// use ethrs::{Client, Config, ProgressEvent};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("127.0.0.1".to_string(), 8888)
///     .with_duration(Duration::from_secs(10));
///
/// let client = Client::new(config)?.with_callback(|event: ProgressEvent| match event {
///     ProgressEvent::TestStarted { test_id, remote } => println!("{} to {}", test_id, remote),
///     ProgressEvent::Result(result) => println!("{:?}", result.body),
///     ProgressEvent::TestCompleted { summary, .. } => println!("{}", summary),
///     ProgressEvent::Error(msg) => eprintln!("Error: {}", msg),
/// });
///
/// client.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Test is starting.
    TestStarted { test_id: TestId, remote: SocketAddr },
    /// A result was published.
    ///
    /// Aggregated tests emit one per publish interval; traceroute tests emit
    /// a snapshot of all hops.
    Result(TestResult),
    /// Test is over, with totals over the whole run.
    TestCompleted { test_id: TestId, summary: TestSummary },
    /// The test failed. Emitted before `run` returns the error.
    Error(String),
}

/// End-of-test totals, summed over every published interval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestSummary {
    /// Wall time from the first worker starting to the last one exiting.
    pub duration: Duration,
    /// Workers that ran to completion (or failed) before the run returned.
    pub workers: usize,
    pub total_bytes: u64,
    pub total_packets: u64,
    pub total_connections: u64,
    /// `total_bytes` over `duration`.
    pub bits_per_second: u64,
}

impl TestSummary {
    pub fn from_results(results: &[TestResult], duration: Duration, workers: usize) -> Self {
        let mut summary = Self {
            duration,
            workers,
            ..Default::default()
        };
        for result in results {
            match &result.body {
                ResultBody::Bandwidth(b) => summary.total_bytes += b.bytes,
                ResultBody::Pps(p) => {
                    summary.total_bytes += p.bytes;
                    summary.total_packets += p.packets;
                }
                ResultBody::Cps(c) => summary.total_connections += c.connections,
                _ => {}
            }
        }
        let secs = duration.as_secs_f64();
        if secs > 0.0 {
            summary.bits_per_second = (summary.total_bytes as f64 * 8.0 / secs) as u64;
        }
        summary
    }
}

impl fmt::Display for TestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}s, {} workers: {} bytes ({} bits/s)",
            self.duration.as_secs_f64(),
            self.workers,
            self.total_bytes,
            self.bits_per_second
        )?;
        if self.total_packets > 0 {
            write!(f, ", {} packets", self.total_packets)?;
        }
        if self.total_connections > 0 {
            write!(f, ", {} connections", self.total_connections)?;
        }
        Ok(())
    }
}

/// Callback trait for receiving progress updates during test execution.
///
/// The trait is implemented for any closure with the right signature.
///
/// ```
/// use ethrs::{ProgressCallback, ProgressEvent};
///
/// struct MyCallback;
///
/// impl ProgressCallback for MyCallback {
///     fn on_progress(&self, event: ProgressEvent) {
///         println!("{:?}", event);
///     }
/// }
/// ```
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

type CallbackRef = Arc<dyn ProgressCallback>;

/// Network performance test client.
///
/// Runs one test against a server (or, for ICMP, any host): bandwidth,
/// connections/s, packets/s, latency, ping, traceroute or mtr. Workers push
/// raw counters into a [`Test`]; its publisher reduces them once per
/// interval and the client reports every published result through the
/// [`Logger`] and the progress callback.
///
/// # Examples
///
/// ## TCP bandwidth with four connections
///
/// ```no_run
/// use ethrs::{Client, Config, Protocol, TestType};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("192.168.1.100".to_string(), 8888)
///     .with_protocol(Protocol::Tcp)
///     .with_test_type(TestType::Bandwidth)
///     .with_threads(4)
///     .with_duration(Duration::from_secs(10));
///
/// let client = Client::new(config)?;
/// let last = client.run().await?;
/// println!("last interval: {:?}", last);
/// # Ok(())
/// # }
/// ```
///
/// ## ICMP traceroute
///
/// ```no_run
/// use ethrs::{Client, Config, Protocol, TestType};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("example.com".to_string(), 0)
///     .with_protocol(Protocol::Icmp)
///     .with_test_type(TestType::TraceRoute)
///     .with_max_hops(20);
///
/// Client::new(config)?.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: Config,
    callback: Option<CallbackRef>,
    logger: Arc<dyn Logger>,
    prober: Option<Arc<dyn Prober>>,
    registry: Arc<SessionRegistry>,
    history: Arc<Mutex<Vec<TestResult>>>,
    last_test: Mutex<Option<Arc<Test>>>,
    summary: Mutex<Option<TestSummary>>,
    cancellation_token: CancellationToken,
}

impl Client {
    /// Creates a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration cannot run, e.g. no
    /// server address or an unsupported protocol/test pair.
    ///
    /// ```
    /// use ethrs::{Client, Config};
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 8888);
    /// let client = Client::new(config).expect("Failed to create client");
    /// ```
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let logger = Arc::new(ConsoleLogger::new(config.json));

        Ok(Self {
            config,
            callback: None,
            logger,
            prober: None,
            registry: Arc::new(SessionRegistry::new()),
            history: Arc::new(Mutex::new(Vec::new())),
            last_test: Mutex::new(None),
            summary: Mutex::new(None),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Attaches a progress callback.
    pub fn with_callback<C: ProgressCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Replaces the console logger.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Replaces the raw-socket ICMP prober used by ping and traceroute.
    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    fn notify(&self, event: ProgressEvent) {
        if let Some(callback) = &self.callback {
            callback.on_progress(event);
        }
    }

    /// Returns a reference to the cancellation token.
    ///
    /// Cancelling it ends the running test early; results gathered so far
    /// are still published.
    ///
    /// ```no_run
    /// use ethrs::{Client, Config};
    /// use std::time::Duration;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = Config::client("127.0.0.1".to_string(), 8888)
    ///     .with_duration(Duration::from_secs(60));
    /// let client = Client::new(config)?;
    ///
    /// let cancel_token = client.cancellation_token().clone();
    /// tokio::spawn(async move {
    ///     tokio::time::sleep(Duration::from_secs(5)).await;
    ///     cancel_token.cancel();
    /// });
    ///
    /// client.run().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Every result published by the last run, in order.
    pub fn results(&self) -> Vec<TestResult> {
        self.history.lock().clone()
    }

    /// Totals of the last completed run.
    pub fn summary(&self) -> Option<TestSummary> {
        self.summary.lock().clone()
    }

    /// The test driven by the last run. It is finished once `run` returns.
    pub fn last_test(&self) -> Option<Arc<Test>> {
        self.last_test.lock().clone()
    }

    /// Runs the configured test to completion.
    ///
    /// Returns the last published result, if any.
    ///
    /// # Errors
    ///
    /// Fails when the server cannot be resolved, when a fatal error such as
    /// [`Error::PermissionDenied`] or [`Error::DestinationNotResponding`]
    /// aborts the test, or when the final result is a failure.
    pub async fn run(&self) -> Result<Option<TestResult>> {
        self.history.lock().clear();
        *self.summary.lock() = None;
        let remote = self.resolve_server().await?;
        let test_id = self.config.test_id();
        let params = self.config.client_param();
        let test = self.registry.create_test(
            remote,
            test_id,
            params,
            aggregator_for(test_id.test_type),
            self.config.interval,
        )?;
        *self.last_test.lock() = Some(test.clone());

        info!("Running {} test against {}", test_id, test.dial_addr());
        self.notify(ProgressEvent::TestStarted { test_id, remote });
        let started = Instant::now();

        // The reporter outlives the workers, whose last results may follow
        // the publisher's final flush.
        let workers_done = CancellationToken::new();
        let publisher = test.start_publishing();
        let reporter = self.spawn_reporter(&test, publisher, workers_done.clone());

        let stop = test.cancellation_token().child_token();
        let fatal = Arc::new(Mutex::new(None));
        let mut workers = JoinSet::new();
        self.spawn_workers(&test, remote, &stop, &fatal, &mut workers);
        let mut exited = 0;

        let one_shot = test_id.test_type == TestType::TraceRoute;
        tokio::select! {
            _ = time::sleep(params.duration), if !one_shot => debug!("Test duration elapsed"),
            _ = self.cancellation_token.cancelled() => info!("Test cancelled"),
            _ = test.cancelled() => {}
            _ = wait_all(&mut workers, &mut exited) => debug!("All workers exited"),
        }

        // Workers flush their counters before the final publish.
        stop.cancel();
        if !test.has_aggregator() {
            test.finish();
        }
        wait_all(&mut workers, &mut exited).await;
        let duration = started.elapsed();
        test.finish();
        workers_done.cancel();
        if let Some(reporter) = reporter {
            if let Err(e) = reporter.await {
                warn!("Result reporter failed: {}", e);
            }
        }
        self.registry.delete_test(test.remote_ip(), test_id);

        let summary = TestSummary::from_results(&self.history.lock(), duration, exited);
        info!("{} test to {} complete: {}", test_id, test.dial_addr(), summary);
        *self.summary.lock() = Some(summary.clone());
        self.notify(ProgressEvent::TestCompleted { test_id, summary });

        let fatal = fatal.lock().take();
        if let Some(e) = fatal {
            self.notify(ProgressEvent::Error(e.to_string()));
            return Err(e);
        }
        let latest = test.latest_result();
        if let Some(TestResult {
            success: false,
            error,
            ..
        }) = &latest
        {
            let msg = error.clone().unwrap_or_else(|| "test failed".to_string());
            self.notify(ProgressEvent::Error(msg.clone()));
            return Err(Error::Test(msg));
        }
        Ok(latest)
    }

    async fn resolve_server(&self) -> Result<SocketAddr> {
        let host = self
            .config
            .server_addr
            .as_deref()
            .ok_or_else(|| Error::Config("Server address is required".to_string()))?;
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.config.port));
        }

        let mut addrs = tokio::net::lookup_host((bare, self.config.port))
            .await
            .map_err(|e| Error::Connection(format!("Failed to resolve {}: {}", host, e)))?;
        addrs
            .next()
            .ok_or_else(|| Error::Connection(format!("No address found for {}", host)))
    }

    fn spawn_reporter(
        &self,
        test: &Arc<Test>,
        publisher: JoinHandle<()>,
        workers_done: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let logger = self.logger.clone();
        let callback = self.callback.clone();
        let history = self.history.clone();
        let done = async move {
            if let Err(e) = publisher.await {
                warn!("Publisher failed: {}", e);
            }
            workers_done.cancelled().await;
        };

        test.spawn_reporter(done, move |test, result| {
            let id = test.id();
            logger.test_result(
                id.test_type,
                result.success,
                id.protocol,
                test.remote_ip(),
                test.remote_port(),
                &result.body,
            );
            if let Some(callback) = &callback {
                callback.on_progress(ProgressEvent::Result(result.clone()));
            }
            history.lock().push(result);
        })
    }

    fn prober(&self) -> Arc<dyn Prober> {
        match &self.prober {
            Some(prober) => prober.clone(),
            None => Arc::new(IcmpProber::new().with_tos(self.config.tos)),
        }
    }

    fn trace_engine(&self) -> TraceRouteEngine {
        let engine = TraceRouteEngine::new(
            self.prober(),
            self.config.max_hops,
            self.config.probe_timeout,
        );
        if self.config.no_dns {
            engine
        } else {
            engine.with_dns(Arc::new(DnsLookup::new()))
        }
    }

    fn spawn_workers(
        &self,
        test: &Arc<Test>,
        remote: SocketAddr,
        stop: &CancellationToken,
        fatal: &Arc<Mutex<Option<Error>>>,
        workers: &mut JoinSet<()>,
    ) {
        let threads = test.params().num_threads.max(1);
        let timeout = self.config.probe_timeout;
        let id = test.id();

        match (id.protocol, id.test_type) {
            (Protocol::Tcp, TestType::Bandwidth) => {
                for _ in 0..threads {
                    let worker = tcp_bandwidth(test.clone(), remote, stop.clone());
                    spawn_worker(workers, test, fatal, worker);
                }
            }
            (Protocol::Tcp, TestType::ConnectionsPerSecond) => {
                for _ in 0..threads {
                    let worker = tcp_connections(test.clone(), remote, stop.clone());
                    spawn_worker(workers, test, fatal, worker);
                }
            }
            (Protocol::Tcp, TestType::Latency) => {
                let worker = tcp_latency(test.clone(), remote, stop.clone());
                spawn_worker(workers, test, fatal, worker);
            }
            (Protocol::Tcp, TestType::Ping) => {
                let worker = tcp_ping(test.clone(), remote, timeout, stop.clone());
                spawn_worker(workers, test, fatal, worker);
            }
            (Protocol::Udp, TestType::Bandwidth) | (Protocol::Udp, TestType::PacketsPerSecond) => {
                for _ in 0..threads {
                    let worker = udp_send(test.clone(), remote, stop.clone());
                    spawn_worker(workers, test, fatal, worker);
                }
            }
            (Protocol::Icmp, TestType::Ping) => {
                let worker = icmp_ping(test.clone(), self.prober(), timeout, stop.clone());
                spawn_worker(workers, test, fatal, worker);
            }
            (Protocol::Icmp, TestType::TraceRoute) => {
                let engine = self.trace_engine();
                let target = test.clone();
                spawn_worker(workers, test, fatal, async move {
                    engine.run_trace(&target).await.map(|_| ())
                });
            }
            (Protocol::Icmp, TestType::MyTraceRoute) => {
                let engine = self.trace_engine();
                let target = test.clone();
                spawn_worker(workers, test, fatal, async move { engine.run_mtr(&target).await });
            }
            _ => error!("No workers for {} test", id),
        }
    }
}

/// Joins every worker, counting each one in `exited`.
async fn wait_all(workers: &mut JoinSet<()>, exited: &mut usize) {
    while let Some(joined) = workers.join_next().await {
        *exited += 1;
        if let Err(e) = joined {
            warn!("Worker task failed: {}", e);
        }
    }
}

/// Runs `worker` and routes its error: fatal errors abort the test, others
/// become a failed intermediate result.
fn spawn_worker<F>(
    workers: &mut JoinSet<()>,
    test: &Arc<Test>,
    fatal: &Arc<Mutex<Option<Error>>>,
    worker: F,
) where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let test = test.clone();
    let fatal = fatal.clone();
    workers.spawn(async move {
        let Err(e) = worker.await else {
            return;
        };
        if e.is_fatal() {
            error!("{} test to {} aborted: {}", test.id(), test.dial_addr(), e);
            test.add_direct_result(TestResult::failed(&e));
            let mut slot = fatal.lock();
            if slot.is_none() {
                *slot = Some(e);
            }
            drop(slot);
            test.finish();
        } else if test.is_done() {
            debug!("{} worker error after finish: {}", test.id(), e);
        } else {
            warn!("{} worker to {} stopped: {}", test.id(), test.dial_addr(), e);
            test.add_intermediate_result(TestResult::failed(&e));
        }
    });
}

fn set_tos(socket: SockRef<'_>, tos: u8) {
    if tos == 0 {
        return;
    }
    if let Err(e) = socket.set_tos(u32::from(tos)) {
        debug!("Failed to set TOS {:#04x}: {}", tos, e);
    }
}

async fn connect(remote: SocketAddr, tos: u8) -> Result<TcpStream> {
    let stream = TcpStream::connect(remote)
        .await
        .map_err(|e| Error::Connection(format!("Failed to connect to {}: {}", remote, e)))?;
    stream.set_nodelay(true)?;
    set_tos(SockRef::from(&stream), tos);
    Ok(stream)
}

/// Closes with a reset so thousands of short connections do not pile up in
/// TIME_WAIT.
fn close_with_reset(stream: TcpStream) {
    if let Err(e) = SockRef::from(&stream).set_linger(Some(Duration::ZERO)) {
        debug!("Failed to set linger: {}", e);
    }
    drop(stream);
}

async fn tcp_bandwidth(test: Arc<Test>, remote: SocketAddr, stop: CancellationToken) -> Result<()> {
    let params = *test.params();
    let mut stream = connect(remote, params.tos).await?;
    handshake_client(&mut stream, test.id(), params).await?;
    debug!("Bandwidth connection {} -> {} established", stream.local_addr()?, remote);

    let mut buffer = vec![0u8; params.buffer_size.max(1) as usize];
    let bytes = if params.reverse {
        receive_bytes(&test, &mut stream, &mut buffer, &stop).await?
    } else {
        send_bytes(&test, &mut stream, &buffer, &stop).await?
    };
    debug!("Bandwidth connection to {} moved {} bytes", remote, bytes);
    Ok(())
}

async fn tcp_connections(
    test: Arc<Test>,
    remote: SocketAddr,
    stop: CancellationToken,
) -> Result<()> {
    let mut tally = Tally::new(|connections, _| TestResult::connections(connections));

    let outcome = loop {
        let connected = tokio::select! {
            _ = stop.cancelled() => break Ok(()),
            connected = TcpStream::connect(remote) => connected,
        };
        match connected {
            Ok(stream) => {
                close_with_reset(stream);
                tally.add(&test, 1, 0);
            }
            Err(e) => {
                break Err(Error::Connection(format!(
                    "Failed to connect to {}: {}",
                    remote, e
                )))
            }
        }
    };

    tally.flush(&test);
    outcome
}

async fn round_trip(stream: &mut TcpStream, buffer: &mut [u8]) -> Result<Duration> {
    let start = Instant::now();
    stream.write_all(buffer).await?;
    stream.read_exact(buffer).await?;
    Ok(start.elapsed())
}

/// Sends `warmup_count` unmeasured round trips, then reports every
/// `rtt_count` measured ones as a raw batch.
async fn tcp_latency(test: Arc<Test>, remote: SocketAddr, stop: CancellationToken) -> Result<()> {
    let params = *test.params();
    let mut stream = connect(remote, params.tos).await?;
    handshake_client(&mut stream, test.id(), params).await?;

    let mut buffer = vec![0u8; params.buffer_size.max(1) as usize];
    for _ in 0..params.warmup_count {
        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            rtt = round_trip(&mut stream, &mut buffer) => { rtt?; }
        }
    }

    let rtt_count = params.rtt_count.max(1) as usize;
    let mut samples = Vec::with_capacity(rtt_count);
    loop {
        let rtt = tokio::select! {
            _ = stop.cancelled() => break,
            rtt = round_trip(&mut stream, &mut buffer) => rtt?,
        };
        samples.push(rtt);
        if samples.len() == rtt_count {
            let batch = std::mem::replace(&mut samples, Vec::with_capacity(rtt_count));
            test.add_intermediate_result(TestResult::ok(ResultBody::LatencyRaw(batch)));
        }

        if !params.gap.is_zero() {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = time::sleep(params.gap) => {}
            }
        }
    }

    if !samples.is_empty() {
        test.add_intermediate_result(TestResult::ok(ResultBody::LatencyRaw(samples)));
    }
    Ok(())
}

/// Times TCP connection setup; a refused or timed out connect counts as a
/// lost ping.
async fn tcp_ping(
    test: Arc<Test>,
    remote: SocketAddr,
    timeout: Duration,
    stop: CancellationToken,
) -> Result<()> {
    let gap = test.params().gap;
    loop {
        let start = Instant::now();
        let attempt = tokio::select! {
            _ = stop.cancelled() => break,
            attempt = time::timeout(timeout, TcpStream::connect(remote)) => attempt,
        };
        let rtt = match attempt {
            Ok(Ok(stream)) => {
                let rtt = start.elapsed();
                close_with_reset(stream);
                Some(rtt)
            }
            Ok(Err(e)) => {
                debug!("Ping connection to {} failed: {}", remote, e);
                None
            }
            Err(_) => {
                debug!("Ping connection to {} timed out", remote);
                None
            }
        };
        test.add_intermediate_result(TestResult::ping_attempt(rtt));

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = time::sleep(gap) => {}
        }
    }
    Ok(())
}

async fn udp_send(test: Arc<Test>, remote: SocketAddr, stop: CancellationToken) -> Result<()> {
    let params = *test.params();
    let local = match remote {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(remote).await?;
    set_tos(SockRef::from(&socket), params.tos);

    let buffer = vec![0u8; params.buffer_size.max(1) as usize];
    let mut throttle = Throttle::begin(test.clock().clone(), params.bw_rate, buffer.len());
    let mut tally = match test.id().test_type {
        TestType::Bandwidth => Tally::bytes(),
        _ => Tally::packets(),
    };

    let outcome = loop {
        let chunk = throttle.bytes_to_send().clamp(1, buffer.len());
        let sent = tokio::select! {
            _ = stop.cancelled() => break Ok(()),
            sent = socket.send(&buffer[..chunk]) => sent,
        };
        let n = match sent {
            Ok(n) => n,
            Err(e) => break Err(Error::from(e)),
        };
        tally.add(&test, 1, n as u64);

        tokio::select! {
            _ = stop.cancelled() => break Ok(()),
            _ = throttle.record_sent(n) => {}
        }
    };

    tally.flush(&test);
    outcome
}

async fn icmp_ping(
    test: Arc<Test>,
    prober: Arc<dyn Prober>,
    timeout: Duration,
    stop: CancellationToken,
) -> Result<()> {
    let dest = test.remote_ip();
    let gap = test.params().gap;
    let mut seq: u8 = 0;

    loop {
        let outcome = tokio::select! {
            _ = stop.cancelled() => break,
            outcome = probe_once(prober.clone(), dest, timeout, PING_HOP, seq) => outcome?,
        };
        let rtt = match outcome {
            ProbeOutcome::Reply { rtt, peer } if peer == dest => Some(rtt),
            other => {
                debug!("Ping {} to {} unanswered: {:?}", seq, dest, other);
                None
            }
        };
        test.add_intermediate_result(TestResult::ping_attempt(rtt));
        seq = seq.wrapping_add(1);

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = time::sleep(gap) => {}
        }
    }
    Ok(())
}
