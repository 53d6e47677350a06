use crate::config::{Config, Protocol, TestId, TestType};
use crate::logger::{format_bits_per_second, ConsoleLogger, Logger};
use crate::netstats::{NetStatsSource, ProcNetStats};
use crate::protocol::{handshake_server, ClientParam};
use crate::results::{aggregator_for, ResultBody, TestResult};
use crate::session::{run_idle_sweep, SessionRegistry, SessionSnapshot};
use crate::test::{Test, FLUSH_PERIOD};
use crate::transfer::{echo, receive_bytes, send_bytes, Tally};
use crate::{Error, Result};
use log::{debug, error, info};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// How long a connections/s or ping test outlives its last connection.
pub const CONNECTION_TEST_LINGER: Duration = Duration::from_secs(2);

/// Largest per-connection buffer a client may ask for.
pub const MAX_BUFFER_SIZE: u32 = 4 * 1024 * 1024;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const SUMMARY_PERIOD: Duration = Duration::from_secs(1);
const UDP_RECV_BUFFER: usize = 64 * 1024;

/// Test id every UDP peer is accounted under.
const UDP_TEST: TestId = TestId {
    protocol: Protocol::Udp,
    test_type: TestType::Server,
};

const CPS_TEST: TestId = TestId {
    protocol: Protocol::Tcp,
    test_type: TestType::ConnectionsPerSecond,
};

/// State shared by every connection handler.
#[derive(Clone)]
struct ServerContext {
    registry: Arc<SessionRegistry>,
    logger: Arc<dyn Logger>,
    interval: Duration,
}

impl ServerContext {
    /// Looks up or registers the test for `peer`. A new test gets its
    /// publisher and a reporter feeding the logger. Every call holds one
    /// reference, released through `safe_delete_test`.
    fn open_test(&self, peer: SocketAddr, test_id: TestId, params: ClientParam) -> Arc<Test> {
        let (test, is_new) = self.registry.create_or_get_test(
            peer,
            test_id,
            params,
            aggregator_for(test_id.test_type),
            self.interval,
        );
        if is_new {
            info!("New {} test from {}", test_id, peer.ip());
            let publisher = test.start_publishing();
            let logger = self.logger.clone();
            test.spawn_reporter(publisher, move |test, result| {
                let id = test.id();
                logger.test_result(
                    id.test_type,
                    result.success,
                    id.protocol,
                    test.remote_ip(),
                    test.remote_port(),
                    &result.body,
                );
            });
        }
        test
    }

    /// Counts one connection that carried no handshake, as made by the
    /// connections/s and TCP ping clients.
    fn count_connection(&self, peer: SocketAddr) {
        let test = self.open_test(peer, CPS_TEST, ClientParam::default());
        test.add_intermediate_result(TestResult::connections(1));

        let registry = self.registry.clone();
        tokio::spawn(async move {
            time::sleep(CONNECTION_TEST_LINGER).await;
            registry.safe_delete_test(&test);
        });
    }
}

/// Network performance test server.
///
/// Listens on one port for both TCP and UDP. TCP connections start with
/// the SYN/ACK handshake and then run the requested bandwidth or latency
/// test; connections that close without a handshake are counted as
/// connections/s (or TCP ping) traffic. Every UDP datagram is accounted to
/// its source address. Tests from the same peer IP share one session.
///
/// # Examples
///
/// ```no_run
/// use ethrs::{Config, Server};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::new(Config::server(8888));
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: Config,
    ctx: ServerContext,
    netstats: Arc<dyn NetStatsSource>,
    shutdown: CancellationToken,
}

impl Server {
    /// Creates a new server with the given configuration.
    ///
    /// ```
    /// use ethrs::{Config, Server};
    ///
    /// let server = Server::new(Config::server(8888));
    /// assert!(server.registry().is_empty());
    /// ```
    pub fn new(config: Config) -> Self {
        let ctx = ServerContext {
            registry: Arc::new(SessionRegistry::new()),
            logger: Arc::new(ConsoleLogger::new(config.json)),
            interval: config.interval,
        };
        Self {
            config,
            ctx,
            netstats: Arc::new(ProcNetStats),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replaces the console logger.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.ctx.logger = logger;
        self
    }

    pub fn with_netstats(mut self, netstats: Arc<dyn NetStatsSource>) -> Self {
        self.netstats = netstats;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.ctx.registry
    }

    /// Cancelling this token stops every serving loop.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Binds TCP and UDP on the configured address and serves until
    /// shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if either socket cannot be bound.
    pub async fn run(&self) -> Result<()> {
        let ip = self
            .config
            .bind_addr
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let addr = SocketAddr::new(ip, self.config.port);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Connection(format!("Failed to bind TCP {}: {}", addr, e)))?;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| Error::Connection(format!("Failed to bind UDP {}: {}", addr, e)))?;

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        info!("Starting ethrs server on {} (host {})", addr, host);

        self.serve(listener, socket).await
    }

    /// Serves already bound sockets, together with the UDP idle sweep and
    /// the periodic summary.
    pub async fn serve(&self, listener: TcpListener, socket: UdpSocket) -> Result<()> {
        let sweep = tokio::spawn(run_idle_sweep(
            self.ctx.registry.clone(),
            self.shutdown.clone(),
        ));
        let summary = tokio::spawn(run_summary(
            self.ctx.clone(),
            self.netstats.clone(),
            self.shutdown.clone(),
        ));

        let served = tokio::try_join!(self.serve_tcp(listener), self.serve_udp(socket));
        self.shutdown.cancel();
        for task in [sweep, summary] {
            if let Err(e) = task.await {
                error!("Server task failed: {}", e);
            }
        }
        served.map(|_| ())
    }

    /// Accept loop; one task per connection.
    pub async fn serve_tcp(&self, listener: TcpListener) -> Result<()> {
        info!("TCP server listening on {}", listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!("New connection from {}", peer);
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_tcp_conn(ctx, stream, peer).await {
                            error!("Error handling client {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => error!("Error accepting connection: {}", e),
            }
        }
    }

    /// Receive loop accounting every datagram to the test of its source.
    pub async fn serve_udp(&self, socket: UdpSocket) -> Result<()> {
        info!("UDP server listening on {}", socket.local_addr()?);

        let mut buffer = vec![0u8; UDP_RECV_BUFFER];
        let mut tallies: HashMap<IpAddr, (Arc<Test>, Tally)> = HashMap::new();
        let mut flush = time::interval(FLUSH_PERIOD);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = flush.tick() => {
                    tallies.retain(|_, (test, tally)| {
                        tally.flush(test);
                        !test.is_done()
                    });
                }
                received = socket.recv_from(&mut buffer) => match received {
                    Ok((n, from)) => self.account_datagram(&mut tallies, from, n),
                    Err(e) => error!("Error receiving UDP packet: {}", e),
                },
            }
        }

        for (test, tally) in tallies.values_mut() {
            tally.flush(test);
        }
        Ok(())
    }

    fn account_datagram(
        &self,
        tallies: &mut HashMap<IpAddr, (Arc<Test>, Tally)>,
        from: SocketAddr,
        len: usize,
    ) {
        let test = match self.ctx.registry.get_test(from.ip(), UDP_TEST) {
            Some(test) => test,
            None => self.ctx.open_test(from, UDP_TEST, ClientParam::default()),
        };
        test.touch();

        let entry = tallies
            .entry(from.ip())
            .or_insert_with(|| (test.clone(), Tally::packets()));
        if !Arc::ptr_eq(&entry.0, &test) {
            // The old test was swept; its counters go with it.
            entry.1.flush(&entry.0);
            *entry = (test, Tally::packets());
        }
        let (test, tally) = entry;
        tally.add(test, 1, len as u64);
    }
}

async fn handle_tcp_conn(ctx: ServerContext, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let handshake = time::timeout(HANDSHAKE_TIMEOUT, handshake_server(&mut stream)).await;
    let (test_id, params) = match handshake {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            debug!("No handshake from {} ({}), counting a connection", peer, e);
            ctx.count_connection(peer);
            return Ok(());
        }
        Err(_) => {
            debug!("Handshake from {} timed out", peer);
            return Ok(());
        }
    };

    if test_id.protocol != Protocol::Tcp
        || !matches!(test_id.test_type, TestType::Bandwidth | TestType::Latency)
    {
        return Err(Error::Protocol(format!("{} is not served over TCP", test_id)));
    }
    if params.buffer_size > MAX_BUFFER_SIZE {
        return Err(Error::Protocol(format!(
            "Buffer size {} exceeds {}",
            params.buffer_size, MAX_BUFFER_SIZE
        )));
    }
    stream.set_nodelay(true)?;

    let test = ctx.open_test(peer, test_id, params);
    let stop = test.cancellation_token();
    let mut buffer = vec![0u8; params.buffer_size.max(1) as usize];

    let outcome = match test_id.test_type {
        TestType::Latency => echo(&mut stream, &mut buffer, &stop).await,
        _ if params.reverse => send_bytes(&test, &mut stream, &buffer, &stop).await,
        _ => receive_bytes(&test, &mut stream, &mut buffer, &stop).await,
    };
    ctx.registry.safe_delete_test(&test);

    match outcome {
        Ok(n) => debug!("{} connection from {} done ({})", test_id, peer, n),
        // Reverse senders usually end this way when the client hangs up.
        Err(e) => debug!("{} connection from {} ended: {}", test_id, peer, e),
    }
    Ok(())
}

/// Point-in-time view of all sessions, for the summary line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerSummary {
    pub sessions: usize,
    pub tests: usize,
    pub dormant: usize,
    pub bits_per_second: u64,
    pub connections_per_second: u64,
    pub packets_per_second: u64,
}

/// Sums the latest published rates of every non-dormant test.
pub fn summarize(sessions: &[SessionSnapshot]) -> ServerSummary {
    let mut summary = ServerSummary {
        sessions: sessions.len(),
        ..Default::default()
    };

    for test in sessions.iter().flat_map(|s| s.tests.iter()) {
        summary.tests += 1;
        if test.is_dormant() {
            summary.dormant += 1;
            continue;
        }
        let Some(result) = test.latest_result() else {
            continue;
        };
        match result.body {
            ResultBody::Bandwidth(b) => summary.bits_per_second += b.bits_per_second,
            ResultBody::Cps(c) => summary.connections_per_second += c.connections_per_second,
            ResultBody::Pps(p) => {
                summary.bits_per_second += p.bits_per_second;
                summary.packets_per_second += p.packets_per_second;
            }
            ResultBody::ServerAggregate(s) => {
                summary.bits_per_second += s.bits_per_second;
                summary.packets_per_second += s.packets_per_second;
            }
            _ => {}
        }
    }
    summary
}

fn interface_bytes(netstats: &dyn NetStatsSource) -> (u64, u64) {
    netstats
        .dev_stats()
        .iter()
        .fold((0, 0), |(rx, tx), d| (rx + d.rx_bytes, tx + d.tx_bytes))
}

async fn run_summary(
    ctx: ServerContext,
    netstats: Arc<dyn NetStatsSource>,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(time::Instant::now() + SUMMARY_PERIOD, SUMMARY_PERIOD);
    let (mut last_rx, mut last_tx) = interface_bytes(netstats.as_ref());
    let mut last_retransmits = netstats.tcp_stats().retransmits;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (rx, tx) = interface_bytes(netstats.as_ref());
        let retransmits = netstats.tcp_stats().retransmits;
        let rx_bits = rx.saturating_sub(last_rx) * 8;
        let tx_bits = tx.saturating_sub(last_tx) * 8;
        let new_retransmits = retransmits.saturating_sub(last_retransmits);
        (last_rx, last_tx, last_retransmits) = (rx, tx, retransmits);

        let sessions = ctx.registry.list_sessions();
        if sessions.is_empty() {
            continue;
        }
        let summary = summarize(&sessions);
        ctx.logger.info(&format!(
            "{} session(s), {} test(s) ({} dormant): {} {} conn/s {} pkt/s | if rx {} tx {} | retransmits {}",
            summary.sessions,
            summary.tests,
            summary.dormant,
            format_bits_per_second(summary.bits_per_second).trim(),
            summary.connections_per_second,
            summary.packets_per_second,
            format_bits_per_second(rx_bits).trim(),
            format_bits_per_second(tx_bits).trim(),
            new_retransmits,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::handshake_client;
    use parking_lot::Mutex;
    use tokio::io::AsyncWriteExt;

    #[derive(Default)]
    struct RecordingLogger {
        bodies: Mutex<Vec<ResultBody>>,
    }

    impl Logger for RecordingLogger {
        fn error(&self, _: &str) {}
        fn info(&self, _: &str) {}
        fn debug(&self, _: &str) {}

        fn test_result(
            &self,
            _: TestType,
            _: bool,
            _: Protocol,
            _: IpAddr,
            _: u16,
            body: &ResultBody,
        ) {
            self.bodies.lock().push(body.clone());
        }
    }

    async fn start_server() -> (Arc<Server>, SocketAddr, Arc<RecordingLogger>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = UdpSocket::bind(addr).await.unwrap();

        let logger = Arc::new(RecordingLogger::default());
        let server = Arc::new(
            Server::new(Config::server(addr.port()).with_interval(Duration::from_millis(100)))
                .with_logger(logger.clone()),
        );
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener, socket).await });
        (server, addr, logger)
    }

    #[tokio::test]
    async fn test_bare_connections_are_counted() {
        let (server, addr, logger) = start_server().await;

        for _ in 0..3 {
            let stream = TcpStream::connect(addr).await.unwrap();
            drop(stream);
        }
        time::sleep(Duration::from_millis(400)).await;

        assert!(server.registry().get_test(addr.ip(), CPS_TEST).is_some());
        let connections: u64 = logger
            .bodies
            .lock()
            .iter()
            .map(|body| match body {
                ResultBody::Cps(c) => c.connections,
                other => panic!("unexpected body {:?}", other),
            })
            .sum();
        assert_eq!(connections, 3);
        server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_connection_test_lingers_then_goes() {
        let (server, addr, _) = start_server().await;

        drop(TcpStream::connect(addr).await.unwrap());
        time::sleep(Duration::from_millis(200)).await;
        assert!(server.registry().get_test(addr.ip(), CPS_TEST).is_some());

        time::sleep(CONNECTION_TEST_LINGER + Duration::from_millis(500)).await;
        assert!(server.registry().get_test(addr.ip(), CPS_TEST).is_none());
        server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_bandwidth_connection_registers_and_releases() {
        let (server, addr, _) = start_server().await;
        let id = TestId::new(Protocol::Tcp, TestType::Bandwidth);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        handshake_client(&mut stream, id, ClientParam::default())
            .await
            .unwrap();
        stream.write_all(&[0u8; 32 * 1024]).await.unwrap();
        time::sleep(Duration::from_millis(100)).await;
        assert!(server.registry().get_test(addr.ip(), id).is_some());

        drop(stream);
        time::sleep(Duration::from_millis(300)).await;
        assert!(server.registry().get_test(addr.ip(), id).is_none());
        server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_oversized_buffer_is_refused() {
        let (server, addr, _) = start_server().await;
        let id = TestId::new(Protocol::Tcp, TestType::Bandwidth);
        let params = ClientParam {
            buffer_size: MAX_BUFFER_SIZE + 1,
            ..ClientParam::default()
        };

        let mut stream = TcpStream::connect(addr).await.unwrap();
        handshake_client(&mut stream, id, params).await.unwrap();
        time::sleep(Duration::from_millis(100)).await;

        assert!(server.registry().get_test(addr.ip(), id).is_none());
        server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_udp_datagrams_are_accounted() {
        let (server, addr, logger) = start_server().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        for _ in 0..10 {
            sender.send_to(&[0u8; 100], addr).await.unwrap();
        }
        time::sleep(Duration::from_millis(400)).await;

        let test = server
            .registry()
            .get_test(addr.ip(), UDP_TEST)
            .expect("udp test registered");
        assert!(!test.is_dormant());

        let (packets, bytes) = logger
            .bodies
            .lock()
            .iter()
            .fold((0, 0), |(packets, bytes), body| match body {
                ResultBody::ServerAggregate(s) => (packets + s.packets, bytes + s.bytes),
                other => panic!("unexpected body {:?}", other),
            });
        assert_eq!(packets, 10);
        assert_eq!(bytes, 1000);
        server.shutdown_token().cancel();
    }

    #[test]
    fn test_summarize_skips_dormant() {
        let registry = SessionRegistry::new();
        let active = registry
            .create_test(
                "10.0.0.1:1000".parse().unwrap(),
                TestId::new(Protocol::Tcp, TestType::Bandwidth),
                ClientParam::default(),
                aggregator_for(TestType::Bandwidth),
                Duration::from_secs(1),
            )
            .unwrap();
        active.add_intermediate_result(TestResult::bandwidth(1000));
        active.publish();

        let dormant = registry
            .create_test(
                "10.0.0.2:1000".parse().unwrap(),
                UDP_TEST,
                ClientParam::default(),
                aggregator_for(TestType::Server),
                Duration::from_secs(1),
            )
            .unwrap();
        dormant.add_intermediate_result(TestResult::packets(5, 500));
        dormant.publish();
        dormant.set_dormant();

        let summary = summarize(&registry.list_sessions());
        assert_eq!(summary.sessions, 2);
        assert_eq!(summary.tests, 2);
        assert_eq!(summary.dormant, 1);
        assert_eq!(summary.bits_per_second, 8000);
        assert_eq!(summary.packets_per_second, 0);
    }
}
