//! Hop discovery and continuous per-hop probing (mtr).
//!
//! Discovery sends one probe per TTL, starting at the first router, and
//! stops at the hop where the destination itself answers. mtr mode then
//! keeps one task per discovered hop re-probing at that TTL while a ticker
//! publishes a snapshot of all hops once per second.

use crate::icmp::{ProbeOutcome, Prober};
use crate::results::{NetworkHop, ResultBody, TestResult};
use crate::test::Test;
use crate::{Error, Result};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time;

const SNAPSHOT_PERIOD: Duration = Duration::from_secs(1);
const DEFAULT_MTR_GAP: Duration = Duration::from_secs(1);

/// Cached reverse DNS.
pub struct DnsLookup {
    resolver: TokioAsyncResolver,
    cache: RwLock<HashMap<IpAddr, Option<String>>>,
}

impl DnsLookup {
    pub fn new() -> Self {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self {
            resolver,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        if let Some(cached) = self.cache.read().get(&ip) {
            return cached.clone();
        }

        let hostname = match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string()),
            Err(e) => {
                debug!("Reverse lookup of {} failed: {}", ip, e);
                None
            }
        };

        self.cache.write().insert(ip, hostname.clone());
        hostname
    }
}

impl Default for DnsLookup {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs one blocking probe off the async workers.
pub(crate) async fn probe_once(
    prober: Arc<dyn Prober>,
    dest: IpAddr,
    timeout: Duration,
    hop: u8,
    seq: u8,
) -> Result<ProbeOutcome> {
    tokio::task::spawn_blocking(move || prober.probe(dest, timeout, hop, seq))
        .await
        .map_err(|e| Error::Test(format!("Probe task failed: {}", e)))?
}

/// Only fatal errors end a trace; anything else costs the hop one probe.
fn outcome_or_loss(outcome: Result<ProbeOutcome>, hop: u8) -> Result<ProbeOutcome> {
    match outcome {
        Err(e) if !e.is_fatal() => {
            debug!("Probe at hop {} failed, counting as lost: {}", hop + 1, e);
            Ok(ProbeOutcome::Lost)
        }
        other => other,
    }
}

async fn resolve_names(dns: Option<&DnsLookup>, hop: &mut NetworkHop) {
    if let (Some(dns), Some(addr)) = (dns, hop.addr) {
        if let Some(name) = dns.reverse_lookup(addr).await {
            hop.set_names(&name);
        }
    }
}

#[derive(Clone)]
pub struct TraceRouteEngine {
    prober: Arc<dyn Prober>,
    dns: Option<Arc<DnsLookup>>,
    max_hops: u8,
    timeout: Duration,
}

impl TraceRouteEngine {
    pub fn new(prober: Arc<dyn Prober>, max_hops: u8, timeout: Duration) -> Self {
        Self {
            prober,
            dns: None,
            max_hops,
            timeout,
        }
    }

    /// Enables reverse DNS for discovered hops.
    pub fn with_dns(mut self, dns: Arc<DnsLookup>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Walks the path to `dest`, one probe per hop.
    ///
    /// Silent hops are recorded as lost and skipped. Returns the hops up to
    /// and including the one where `dest` replied.
    ///
    /// # Errors
    ///
    /// [`Error::DestinationNotResponding`] if `dest` never answered within
    /// `max_hops`, or [`Error::PermissionDenied`] from the prober. Other
    /// probe errors count as a lost probe.
    pub async fn discover(&self, dest: IpAddr) -> Result<Vec<NetworkHop>> {
        let mut hops = Vec::new();

        for hop in 0..self.max_hops {
            let outcome =
                outcome_or_loss(probe_once(self.prober.clone(), dest, self.timeout, hop, 0).await, hop)?;
            let mut entry = NetworkHop::new(outcome.peer());
            match outcome {
                ProbeOutcome::Lost => entry.record_loss(),
                ProbeOutcome::Reply { rtt, .. }
                | ProbeOutcome::TtlExceeded { rtt, .. }
                | ProbeOutcome::Unreachable { rtt, .. } => entry.record_reply(rtt),
            }
            resolve_names(self.dns.as_deref(), &mut entry).await;
            debug!("Hop {} of {}: {:?}", hop + 1, dest, entry.addr);
            hops.push(entry);

            if matches!(outcome, ProbeOutcome::Reply { peer, .. } if peer == dest) {
                return Ok(hops);
            }
        }

        Err(Error::DestinationNotResponding(dest))
    }

    /// One-shot traceroute: discovery followed by a single snapshot.
    pub async fn run_trace(&self, test: &Arc<Test>) -> Result<Vec<NetworkHop>> {
        let hops = self.discover(test.remote_ip()).await?;
        test.add_direct_result(TestResult::ok(ResultBody::TraceRoute(hops.clone())));
        info!(
            "Traceroute to {} complete: {} hops",
            test.remote_ip(),
            hops.len()
        );
        Ok(hops)
    }

    /// Continuous probing of every discovered hop until `test` finishes.
    pub async fn run_mtr(&self, test: &Arc<Test>) -> Result<()> {
        let dest = test.remote_ip();
        let hops = Arc::new(Mutex::new(self.discover(dest).await?));
        publish_snapshot(test, &hops);

        let gap = match test.params().gap {
            gap if gap.is_zero() => DEFAULT_MTR_GAP,
            gap => gap,
        };

        let mut tasks = JoinSet::new();
        let hop_count = hops.lock().len();
        for index in 0..hop_count {
            let worker = HopWorker {
                prober: self.prober.clone(),
                dns: self.dns.clone(),
                hops: hops.clone(),
                index,
                dest,
                timeout: self.timeout,
                gap,
            };
            let test = test.clone();
            tasks.spawn(async move { worker.run(&test).await });
        }

        let mut ticker = time::interval_at(time::Instant::now() + SNAPSHOT_PERIOD, SNAPSHOT_PERIOD);
        let mut failure = None;
        loop {
            tokio::select! {
                _ = test.cancelled() => break,
                _ = ticker.tick() => publish_snapshot(test, &hops),
                Some(joined) = tasks.join_next() => {
                    if let Ok(Err(e)) = joined {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }
        tasks.shutdown().await;
        publish_snapshot(test, &hops);

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn publish_snapshot(test: &Test, hops: &Mutex<Vec<NetworkHop>>) {
    let snapshot = hops.lock().clone();
    test.add_direct_result(TestResult::ok(ResultBody::TraceRoute(snapshot)));
}

struct HopWorker {
    prober: Arc<dyn Prober>,
    dns: Option<Arc<DnsLookup>>,
    hops: Arc<Mutex<Vec<NetworkHop>>>,
    index: usize,
    dest: IpAddr,
    timeout: Duration,
    gap: Duration,
}

impl HopWorker {
    async fn run(self, test: &Test) -> Result<()> {
        let hop = self.index as u8;
        // Discovery used sequence 0 for every hop.
        let mut seq: u8 = 1;

        loop {
            let outcome = tokio::select! {
                _ = test.cancelled() => return Ok(()),
                outcome = probe_once(self.prober.clone(), self.dest, self.timeout, hop, seq) => {
                    outcome_or_loss(outcome, hop)?
                }
            };
            seq = seq.wrapping_add(1);

            let adopted = self.record(outcome);
            if let (Some(addr), Some(dns)) = (adopted, self.dns.as_deref()) {
                if let Some(name) = dns.reverse_lookup(addr).await {
                    if let Some(entry) = self.hops.lock().get_mut(self.index) {
                        entry.set_names(&name);
                    }
                }
            }

            tokio::select! {
                _ = test.cancelled() => return Ok(()),
                _ = time::sleep(self.gap) => {}
            }
        }
    }

    /// Folds one outcome into this hop. Returns the responder if it was
    /// adopted as the hop's address.
    fn record(&self, outcome: ProbeOutcome) -> Option<IpAddr> {
        let mut hops = self.hops.lock();
        let entry = hops.get_mut(self.index)?;

        match (outcome.peer(), outcome.rtt()) {
            (Some(peer), Some(rtt)) => match entry.addr {
                None => {
                    entry.addr = Some(peer);
                    entry.record_reply(rtt);
                    Some(peer)
                }
                Some(addr) if addr == peer => {
                    entry.record_reply(rtt);
                    None
                }
                Some(addr) => {
                    debug!(
                        "Hop {} answered by {} instead of {}, counting as lost",
                        self.index + 1,
                        peer,
                        addr
                    );
                    entry.record_loss();
                    None
                }
            },
            _ => {
                entry.record_loss();
                None
            }
        }
    }
}
