//! Public endpoint discovery and verification.
//!
//! Peers report what they observe as our source endpoint. Reports accumulate
//! into a bounded table keyed by endpoint, each entry remembering which
//! reporter networks (/16 for IPv4, /48 for IPv6) confirmed it. Before an
//! endpoint counts as publicly ours it must pass two independent checks:
//!
//! - **data verification**: a random nonce sent to the claimed address over
//!   a throwaway UDP socket must come back on that address,
//! - **hop verification**: a TTL-bounded ping must reach it within the
//!   allowed hop count (0 with a locally bound public address, else 2).
//!
//! Both probes touch OS sockets and are therefore abstracted behind
//! [`EndpointVerifier`]; a worker task drains the verification queue.

use aegis_transport::Endpoint;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{RwLock, mpsc, watch};

/// Most endpoints tracked at once
pub const MAX_ENDPOINTS: usize = 32;

/// Most distinct reporter networks remembered per endpoint
pub const MAX_REPORTING_NETWORKS: usize = 32;

/// Distinct reporter networks required before an endpoint counts as verified
pub const MIN_CONFIRMING_NETWORKS: usize = 3;

/// Attempts per verification kind before giving up on an endpoint
pub const MAX_VERIFICATION_TRIES: u32 = 3;

/// Allowed hops to a claimed address when a public IP is bound locally
const MAX_HOPS_LOCAL_PUBLIC: u8 = 0;
/// Allowed hops otherwise (typically one NAT away)
const MAX_HOPS_NATTED: u8 = 2;

/// Reporter granularity: /16 for IPv4, /48 for IPv6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReporterNetwork {
    /// First two octets
    V4(u16),
    /// First 48 bits
    V6(u64),
}

impl ReporterNetwork {
    /// The network a reporter address belongs to
    #[must_use]
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(ip) => {
                let octets = ip.octets();
                Self::V4(u16::from_be_bytes([octets[0], octets[1]]))
            }
            IpAddr::V6(ip) => {
                let octets = ip.octets();
                let mut bytes = [0u8; 8];
                bytes[2..].copy_from_slice(&octets[..6]);
                Self::V6(u64::from_be_bytes(bytes))
            }
        }
    }
}

/// Runs the actual probes; OS-socket backends live outside this crate
#[async_trait]
pub trait EndpointVerifier: Send + Sync {
    /// Send `nonce` to `addr` over a fresh UDP socket on a random high port
    /// and report whether that nonce came back on that address
    async fn verify_data(&self, addr: IpAddr, nonce: u64) -> bool;

    /// Ping `addr` with TTL `max_hops` and report whether it answered from
    /// within that distance
    async fn verify_hops(&self, addr: IpAddr, max_hops: u8) -> bool;
}

/// A verifier that fails every probe; used when no backend is wired up
pub struct RejectingVerifier;

#[async_trait]
impl EndpointVerifier for RejectingVerifier {
    async fn verify_data(&self, _addr: IpAddr, _nonce: u64) -> bool {
        false
    }

    async fn verify_hops(&self, _addr: IpAddr, _max_hops: u8) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
struct EndpointDetails {
    reporting_networks: HashSet<ReporterNetwork>,
    trusted: bool,
    data_verified: bool,
    hop_verified: bool,
    verification_tries: u32,
    verification_pending: bool,
    last_reported: Instant,
}

impl EndpointDetails {
    fn new(trusted: bool) -> Self {
        Self {
            reporting_networks: HashSet::new(),
            trusted,
            data_verified: false,
            hop_verified: false,
            verification_tries: 0,
            verification_pending: false,
            last_reported: Instant::now(),
        }
    }

    fn is_verified(&self) -> bool {
        self.data_verified
            && self.hop_verified
            && self.reporting_networks.len() >= MIN_CONFIRMING_NETWORKS
    }

    /// Lower sorts out first when the table is full
    fn relevance(&self) -> (bool, bool, std::cmp::Reverse<Instant>) {
        (
            self.trusted,
            self.is_verified(),
            std::cmp::Reverse(self.last_reported),
        )
    }
}

/// The table of reported public endpoints
pub struct PublicEndpoints {
    verifier: Arc<dyn EndpointVerifier>,
    entries: RwLock<HashMap<Endpoint, EndpointDetails>>,
    verify_tx: mpsc::Sender<Endpoint>,
    verify_rx: tokio::sync::Mutex<mpsc::Receiver<Endpoint>>,
    has_locally_bound_public_ip: bool,
}

impl PublicEndpoints {
    /// Create an empty table backed by `verifier`
    #[must_use]
    pub fn new(verifier: Arc<dyn EndpointVerifier>, has_locally_bound_public_ip: bool) -> Self {
        let (verify_tx, verify_rx) = mpsc::channel(MAX_ENDPOINTS * 2);
        Self {
            verifier,
            entries: RwLock::new(HashMap::new()),
            verify_tx,
            verify_rx: tokio::sync::Mutex::new(verify_rx),
            has_locally_bound_public_ip,
        }
    }

    /// Record that `reporter` observed us as `endpoint`.
    ///
    /// `trusted` marks reports from authenticated peers. Returns whether the
    /// report was accepted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a non-IP endpoint.
    pub async fn report(
        &self,
        endpoint: Endpoint,
        reporter: IpAddr,
        trusted: bool,
    ) -> Result<bool> {
        let Endpoint::Ip { .. } = endpoint else {
            return Err(Error::invalid_argument(
                "only IP endpoints have public mappings",
            ));
        };

        let network = ReporterNetwork::of(reporter);
        let mut entries = self.entries.write().await;

        if !entries.contains_key(&endpoint) && entries.len() >= MAX_ENDPOINTS {
            // Evict the least relevant entry: untrusted before trusted,
            // unverified before verified, oldest report first
            let victim = entries
                .iter()
                .min_by_key(|(_, d)| d.relevance())
                .map(|(ep, _)| *ep);
            match victim {
                Some(victim) if entries[&victim].relevance() < EndpointDetails::new(trusted).relevance() => {
                    entries.remove(&victim);
                }
                _ => return Ok(false),
            }
        }

        let details = entries
            .entry(endpoint)
            .or_insert_with(|| EndpointDetails::new(trusted));
        details.trusted |= trusted;
        details.last_reported = Instant::now();
        if details.reporting_networks.len() < MAX_REPORTING_NETWORKS {
            details.reporting_networks.insert(network);
        }

        let needs_verification = !details.verification_pending
            && !(details.data_verified && details.hop_verified)
            && details.verification_tries < MAX_VERIFICATION_TRIES;
        // try_send: waiting here would hold the table lock the worker needs
        if needs_verification && self.verify_tx.try_send(endpoint).is_ok() {
            details.verification_pending = true;
            details.verification_tries += 1;
        }
        Ok(true)
    }

    /// Run queued verifications until `shutdown` fires.
    ///
    /// Spawn this once per instance; it drains the queue the report path
    /// fills.
    pub async fn run_verifier(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let endpoint = {
                let mut rx = self.verify_rx.lock().await;
                tokio::select! {
                    _ = shutdown.changed() => return,
                    endpoint = rx.recv() => match endpoint {
                        Some(endpoint) => endpoint,
                        None => return,
                    },
                }
            };

            let Endpoint::Ip { addr, .. } = endpoint else {
                continue;
            };
            let ip = addr.ip();

            let nonce = aegis_crypto::random::u64();
            let data_ok = self.verifier.verify_data(ip, nonce).await;

            let max_hops = if self.has_locally_bound_public_ip {
                MAX_HOPS_LOCAL_PUBLIC
            } else {
                MAX_HOPS_NATTED
            };
            let hops_ok = self.verifier.verify_hops(ip, max_hops).await;

            let mut entries = self.entries.write().await;
            if let Some(details) = entries.get_mut(&endpoint) {
                details.data_verified |= data_ok;
                details.hop_verified |= hops_ok;
                details.verification_pending = false;
                tracing::debug!(
                    %endpoint,
                    data_ok,
                    hops_ok,
                    tries = details.verification_tries,
                    "endpoint verification attempt finished"
                );
            }
        }
    }

    /// Whether `endpoint` passed both checks and enough reporter networks
    pub async fn is_verified(&self, endpoint: &Endpoint) -> bool {
        self.entries
            .read()
            .await
            .get(endpoint)
            .is_some_and(EndpointDetails::is_verified)
    }

    /// All endpoints currently considered publicly ours
    pub async fn verified_endpoints(&self) -> Vec<Endpoint> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, d)| d.is_verified())
            .map(|(ep, _)| *ep)
            .collect()
    }

    /// Distinct reporter networks seen for `endpoint`
    pub async fn reporting_network_count(&self, endpoint: &Endpoint) -> usize {
        self.entries
            .read()
            .await
            .get(endpoint)
            .map_or(0, |d| d.reporting_networks.len())
    }

    /// Number of tracked endpoints
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when nothing was reported yet
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockVerifier {
        data_ok: AtomicBool,
        hops_ok: AtomicBool,
        probes: AtomicUsize,
    }

    impl MockVerifier {
        fn new(data_ok: bool, hops_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                data_ok: AtomicBool::new(data_ok),
                hops_ok: AtomicBool::new(hops_ok),
                probes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EndpointVerifier for MockVerifier {
        async fn verify_data(&self, _addr: IpAddr, _nonce: u64) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.data_ok.load(Ordering::SeqCst)
        }

        async fn verify_hops(&self, _addr: IpAddr, _max_hops: u8) -> bool {
            self.hops_ok.load(Ordering::SeqCst)
        }
    }

    fn ep(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    fn reporter(n: u8) -> IpAddr {
        format!("{n}.{n}.1.1").parse().unwrap()
    }

    async fn with_verifier(
        verifier: Arc<MockVerifier>,
    ) -> (Arc<PublicEndpoints>, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let endpoints = Arc::new(PublicEndpoints::new(verifier, false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = {
            let endpoints = Arc::clone(&endpoints);
            tokio::spawn(async move { endpoints.run_verifier(shutdown_rx).await })
        };
        (endpoints, shutdown_tx, worker)
    }

    #[tokio::test]
    async fn test_requires_three_networks_and_both_checks() {
        let verifier = MockVerifier::new(true, true);
        let (endpoints, shutdown, worker) = with_verifier(verifier).await;
        let endpoint = ep("udp://203.0.113.7:999");

        endpoints.report(endpoint, reporter(1), true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Both checks pass but only one reporter network
        assert!(!endpoints.is_verified(&endpoint).await);

        endpoints.report(endpoint, reporter(2), true).await.unwrap();
        endpoints.report(endpoint, reporter(3), true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(endpoints.is_verified(&endpoint).await);
        assert_eq!(endpoints.verified_endpoints().await, vec![endpoint]);

        let _ = shutdown.send(true);
        let _ = worker.await;
    }

    #[tokio::test]
    async fn test_failed_data_check_blocks_verification() {
        let verifier = MockVerifier::new(false, true);
        let (endpoints, shutdown, worker) = with_verifier(verifier).await;
        let endpoint = ep("udp://203.0.113.7:999");

        for n in 1..=3 {
            endpoints.report(endpoint, reporter(n), true).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!endpoints.is_verified(&endpoint).await);
        assert_eq!(endpoints.reporting_network_count(&endpoint).await, 3);

        let _ = shutdown.send(true);
        let _ = worker.await;
    }

    #[tokio::test]
    async fn test_same_network_not_counted_twice() {
        let verifier = MockVerifier::new(true, true);
        let (endpoints, shutdown, worker) = with_verifier(verifier).await;
        let endpoint = ep("udp://203.0.113.7:999");

        // Three reporters inside one /16
        for host in 1..=3 {
            let reporter: IpAddr = format!("9.9.0.{host}").parse().unwrap();
            endpoints.report(endpoint, reporter, true).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(endpoints.reporting_network_count(&endpoint).await, 1);
        assert!(!endpoints.is_verified(&endpoint).await);

        let _ = shutdown.send(true);
        let _ = worker.await;
    }

    #[tokio::test]
    async fn test_verification_tries_bounded() {
        let verifier = MockVerifier::new(false, false);
        let (endpoints, shutdown, worker) = with_verifier(Arc::clone(&verifier)).await;
        let endpoint = ep("udp://203.0.113.7:999");

        for n in 1..=10 {
            endpoints.report(endpoint, reporter(n), true).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(verifier.probes.load(Ordering::SeqCst) <= MAX_VERIFICATION_TRIES as usize);

        let _ = shutdown.send(true);
        let _ = worker.await;
    }

    #[tokio::test]
    async fn test_eviction_prefers_least_relevant() {
        let verifier = MockVerifier::new(false, false);
        let endpoints = PublicEndpoints::new(verifier, false);

        // Fill the table with untrusted entries
        for i in 0..MAX_ENDPOINTS {
            let endpoint = ep(&format!("udp://203.0.113.7:{}", 1000 + i));
            endpoints.report(endpoint, reporter(1), false).await.unwrap();
        }
        assert_eq!(endpoints.len().await, MAX_ENDPOINTS);

        // A trusted report evicts an untrusted entry
        let trusted = ep("udp://198.51.100.1:999");
        assert!(endpoints.report(trusted, reporter(2), true).await.unwrap());
        assert_eq!(endpoints.len().await, MAX_ENDPOINTS);
        assert_eq!(endpoints.reporting_network_count(&trusted).await, 1);
    }

    #[tokio::test]
    async fn test_non_ip_endpoint_rejected() {
        let endpoints = PublicEndpoints::new(MockVerifier::new(true, true), false);
        let bth = ep("bth://AA:BB:CC:DD:EE:FF/1");
        assert!(endpoints.report(bth, reporter(1), true).await.is_err());
    }
}
