//! Registry of in-flight tests, grouped into per-peer sessions.
//!
//! Locking is two-level: the registry `RwLock` guards which sessions and
//! tests exist, each [`Test`] guards its own buffers. Whenever both are
//! needed the registry lock is taken first.

use crate::config::{Protocol, TestId};
use crate::protocol::ClientParam;
use crate::results::Aggregator;
use crate::test::Test;
use crate::throttle::StatsClock;
use crate::{Error, Result};
use log::{debug, info};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// UDP tests idle this long stop appearing in output.
pub const UDP_DORMANT_AFTER: Duration = Duration::from_secs(1);

/// UDP tests idle this long are removed.
pub const UDP_DELETE_AFTER: Duration = Duration::from_secs(2);

/// How often the idle sweep runs.
pub const SWEEP_PERIOD: Duration = Duration::from_millis(100);

/// All tests running against one remote address.
#[derive(Debug)]
pub struct Session {
    remote_ip: IpAddr,
    tests: HashMap<TestId, Arc<Test>>,
    test_count: usize,
}

impl Session {
    fn new(remote_ip: IpAddr) -> Self {
        Self {
            remote_ip,
            tests: HashMap::new(),
            test_count: 0,
        }
    }

    fn remove(&mut self, test_id: &TestId) -> Option<Arc<Test>> {
        let test = self.tests.remove(test_id)?;
        self.test_count -= 1;
        Some(test)
    }
}

/// Point-in-time copy of one session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub remote_ip: IpAddr,
    pub tests: Vec<Arc<Test>>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<IpAddr, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the test for `(peer, test_id)`, creating it (and its session)
    /// when absent. The flag is `true` only when the test is new.
    ///
    /// Every call takes a reference released by
    /// [`safe_delete_test`](Self::safe_delete_test).
    pub fn create_or_get_test(
        &self,
        peer: SocketAddr,
        test_id: TestId,
        params: ClientParam,
        aggregator: Option<Aggregator>,
        publish_interval: Duration,
    ) -> (Arc<Test>, bool) {
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(peer.ip())
            .or_insert_with(|| Session::new(peer.ip()));

        if let Some(test) = session.tests.get(&test_id) {
            test.acquire();
            return (Arc::clone(test), false);
        }

        let test = Arc::new(Test::new(
            peer,
            test_id,
            params,
            aggregator,
            publish_interval,
            // Each test's throttle windows follow its own publisher.
            StatsClock::new(),
        ));
        test.acquire();
        session.tests.insert(test_id, Arc::clone(&test));
        session.test_count += 1;
        debug!("Created test {} for {}", test_id, test.dial_addr());
        (test, true)
    }

    /// Like [`create_or_get_test`](Self::create_or_get_test) but refuses to
    /// return an existing test.
    pub fn create_test(
        &self,
        peer: SocketAddr,
        test_id: TestId,
        params: ClientParam,
        aggregator: Option<Aggregator>,
        publish_interval: Duration,
    ) -> Result<Arc<Test>> {
        {
            let sessions = self.sessions.read();
            if let Some(session) = sessions.get(&peer.ip()) {
                if session.tests.contains_key(&test_id) {
                    return Err(Error::DuplicateTest(format!("{} for {}", test_id, peer.ip())));
                }
            }
        }
        let (test, is_new) =
            self.create_or_get_test(peer, test_id, params, aggregator, publish_interval);
        if !is_new {
            // Lost a race with another creator.
            test.release();
            return Err(Error::DuplicateTest(format!("{} for {}", test_id, peer.ip())));
        }
        Ok(test)
    }

    pub fn get_test(&self, ip: IpAddr, test_id: TestId) -> Option<Arc<Test>> {
        let sessions = self.sessions.read();
        sessions.get(&ip)?.tests.get(&test_id).cloned()
    }

    /// Removes the test regardless of outstanding references, dropping the
    /// session with it when it was the last one. The removed test is
    /// finished; holders of an `Arc` can still read it.
    pub fn delete_test(&self, ip: IpAddr, test_id: TestId) -> bool {
        let mut sessions = self.sessions.write();
        match Self::remove_locked(&mut sessions, ip, &test_id) {
            Some(test) => {
                test.finish();
                true
            }
            None => false,
        }
    }

    /// Releases one reference to `test` and deletes it once none remain.
    ///
    /// Does nothing if the registered test for that key is a different
    /// object (already replaced).
    pub fn safe_delete_test(&self, test: &Arc<Test>) -> bool {
        let mut sessions = self.sessions.write();
        if test.release() > 0 {
            return false;
        }
        let registered = sessions
            .get(&test.remote_ip())
            .and_then(|s| s.tests.get(&test.id()));
        if !matches!(registered, Some(current) if Arc::ptr_eq(current, test)) {
            return false;
        }
        if let Some(removed) = Self::remove_locked(&mut sessions, test.remote_ip(), &test.id()) {
            removed.finish();
        }
        true
    }

    fn remove_locked(
        sessions: &mut HashMap<IpAddr, Session>,
        ip: IpAddr,
        test_id: &TestId,
    ) -> Option<Arc<Test>> {
        let session = sessions.get_mut(&ip)?;
        let test = session.remove(test_id)?;
        if session.test_count == 0 {
            sessions.remove(&ip);
            debug!("Session for {} closed", ip);
        }
        Some(test)
    }

    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read();
        sessions
            .values()
            .map(|s| SessionSnapshot {
                remote_ip: s.remote_ip,
                tests: s.tests.values().cloned().collect(),
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Ages out connectionless tests: dormant once idle for `dormant_after`,
    /// deleted once idle for `delete_after`. Returns how many were deleted.
    pub fn sweep_idle(&self, dormant_after: Duration, delete_after: Duration) -> usize {
        let mut sessions = self.sessions.write();
        let mut expired = Vec::new();

        for session in sessions.values() {
            for test in session.tests.values() {
                if test.id().protocol != Protocol::Udp {
                    continue;
                }
                let idle = test.idle_for();
                if idle >= delete_after {
                    expired.push((session.remote_ip, test.id()));
                } else if idle >= dormant_after {
                    test.set_dormant();
                }
            }
        }

        let mut deleted = 0;
        for (ip, test_id) in expired {
            if let Some(test) = Self::remove_locked(&mut sessions, ip, &test_id) {
                test.finish();
                info!("Test {} from {} timed out", test_id, ip);
                deleted += 1;
            }
        }
        deleted
    }
}

/// Runs [`SessionRegistry::sweep_idle`] every [`SWEEP_PERIOD`] until
/// `cancel` fires.
pub async fn run_idle_sweep(registry: Arc<SessionRegistry>, cancel: CancellationToken) {
    let mut ticker = time::interval(SWEEP_PERIOD);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                registry.sweep_idle(UDP_DORMANT_AFTER, UDP_DELETE_AFTER);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestType;
    use crate::results::aggregate_bandwidth;

    fn tcp_bw() -> TestId {
        TestId::new(Protocol::Tcp, TestType::Bandwidth)
    }

    fn udp_pps() -> TestId {
        TestId::new(Protocol::Udp, TestType::PacketsPerSecond)
    }

    fn peer(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::from([10, 0, 0, last]), port)
    }

    fn create(registry: &SessionRegistry, peer: SocketAddr, id: TestId) -> (Arc<Test>, bool) {
        registry.create_or_get_test(
            peer,
            id,
            ClientParam::default(),
            Some(aggregate_bandwidth),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_tests_tick_independent_clocks() {
        let registry = SessionRegistry::new();
        let (first, _) = create(&registry, peer(1, 5000), tcp_bw());
        let (second, _) = create(&registry, peer(2, 5000), tcp_bw());
        let before = second.clock().last_tick();

        std::thread::sleep(Duration::from_millis(5));
        first.clock().tick();

        assert!(first.clock().last_tick() > before);
        assert_eq!(second.clock().last_tick(), before);
    }

    #[test]
    fn test_create_or_get_is_idempotent() {
        let registry = SessionRegistry::new();
        let (first, is_new) = create(&registry, peer(1, 5000), tcp_bw());
        assert!(is_new);

        // Different source port, same peer IP: same test.
        let (second, is_new) = create(&registry, peer(1, 5001), tcp_bw());
        assert!(!is_new);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn test_create_test_rejects_duplicates() {
        let registry = SessionRegistry::new();
        let params = ClientParam::default();
        let first = registry
            .create_test(peer(1, 5000), tcp_bw(), params, None, Duration::from_secs(1))
            .unwrap();
        let second =
            registry.create_test(peer(1, 5000), tcp_bw(), params, None, Duration::from_secs(1));

        assert!(matches!(second, Err(Error::DuplicateTest(_))));
        let current = registry.get_test(first.remote_ip(), tcp_bw()).unwrap();
        assert!(Arc::ptr_eq(&first, &current));
    }

    #[test]
    fn test_delete_last_test_removes_session() {
        let registry = SessionRegistry::new();
        let (test, _) = create(&registry, peer(1, 5000), tcp_bw());
        create(&registry, peer(1, 5000), udp_pps());

        assert!(registry.delete_test(test.remote_ip(), tcp_bw()));
        assert_eq!(registry.session_count(), 1);
        assert!(test.is_done());

        assert!(registry.delete_test(test.remote_ip(), udp_pps()));
        assert!(registry.is_empty());
        assert!(!registry.delete_test(test.remote_ip(), udp_pps()));
    }

    #[test]
    fn test_detached_test_stays_readable() {
        let registry = SessionRegistry::new();
        let (test, _) = create(&registry, peer(2, 5000), tcp_bw());
        test.add_direct_result(crate::results::TestResult::bandwidth(7));

        registry.delete_test(test.remote_ip(), tcp_bw());
        assert!(registry.get_test(test.remote_ip(), tcp_bw()).is_none());
        assert!(test.latest_result().is_some());
    }

    #[test]
    fn test_safe_delete_waits_for_last_reference() {
        let registry = SessionRegistry::new();
        let (test, _) = create(&registry, peer(3, 5000), tcp_bw());
        let (again, _) = create(&registry, peer(3, 5001), tcp_bw());

        assert!(!registry.safe_delete_test(&test));
        assert!(registry.get_test(test.remote_ip(), tcp_bw()).is_some());

        assert!(registry.safe_delete_test(&again));
        assert!(registry.get_test(test.remote_ip(), tcp_bw()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_safe_delete_ignores_replaced_test() {
        let registry = SessionRegistry::new();
        let (old, _) = create(&registry, peer(4, 5000), tcp_bw());
        registry.delete_test(old.remote_ip(), tcp_bw());
        let (new, is_new) = create(&registry, peer(4, 5000), tcp_bw());
        assert!(is_new);

        assert!(!registry.safe_delete_test(&old));
        assert!(Arc::ptr_eq(
            &registry.get_test(new.remote_ip(), tcp_bw()).unwrap(),
            &new
        ));
    }

    #[test]
    fn test_list_sessions_snapshot() {
        let registry = SessionRegistry::new();
        create(&registry, peer(1, 5000), tcp_bw());
        create(&registry, peer(1, 5000), udp_pps());
        create(&registry, peer(2, 5000), tcp_bw());

        let snapshot = registry.list_sessions();
        assert_eq!(snapshot.len(), 2);
        let total: usize = snapshot.iter().map(|s| s.tests.len()).sum();
        assert_eq!(total, 3);

        // Later mutation does not affect the snapshot.
        registry.delete_test(IpAddr::from([10, 0, 0, 2]), tcp_bw());
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_sweep_only_touches_udp() {
        let registry = SessionRegistry::new();
        let (tcp, _) = create(&registry, peer(1, 5000), tcp_bw());
        let (udp, _) = create(&registry, peer(1, 5000), udp_pps());

        let deleted = registry.sweep_idle(Duration::ZERO, Duration::ZERO);
        assert_eq!(deleted, 1);
        assert!(udp.is_done());
        assert!(!tcp.is_done());
        assert!(registry.get_test(tcp.remote_ip(), tcp_bw()).is_some());
    }

    #[test]
    fn test_sweep_marks_dormant_before_delete() {
        let registry = SessionRegistry::new();
        let (udp, _) = create(&registry, peer(5, 5000), udp_pps());

        let deleted = registry.sweep_idle(Duration::ZERO, Duration::from_secs(3600));
        assert_eq!(deleted, 0);
        assert!(udp.is_dormant());

        udp.touch();
        assert!(!udp.is_dormant());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: repeated creation for one key yields one object
            #[test]
            fn prop_single_test_per_key(ports in prop::collection::vec(1u16..65535, 1..50)) {
                let registry = SessionRegistry::new();
                let (first, is_new) = create(&registry, peer(9, ports[0]), tcp_bw());
                prop_assert!(is_new);

                for port in &ports[1..] {
                    let (test, is_new) = create(&registry, peer(9, *port), tcp_bw());
                    prop_assert!(!is_new);
                    prop_assert!(Arc::ptr_eq(&first, &test));
                }
                prop_assert_eq!(registry.session_count(), 1);
            }

            /// Property: deleting removes the session iff it held one test
            #[test]
            fn prop_session_removed_with_last_test(extra in 0usize..4) {
                let registry = SessionRegistry::new();
                let ids = [
                    udp_pps(),
                    TestId::new(Protocol::Tcp, TestType::Latency),
                    TestId::new(Protocol::Tcp, TestType::Ping),
                    TestId::new(Protocol::Icmp, TestType::Ping),
                ];
                create(&registry, peer(1, 1), tcp_bw());
                for id in &ids[..extra] {
                    create(&registry, peer(1, 1), *id);
                }

                registry.delete_test(IpAddr::from([10, 0, 0, 1]), tcp_bw());
                prop_assert_eq!(registry.is_empty(), extra == 0);
            }
        }
    }
}
