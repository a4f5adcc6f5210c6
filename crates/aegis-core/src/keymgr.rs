//! Pregenerated asymmetric key pools.
//!
//! Generating KEM keypairs is expensive, so a pool per enabled algorithm is
//! kept filled by background workers: a monitor task watches pool depth and
//! schedules generation tasks, worker tasks drain the queue and generate one
//! keypair each. [`KeyManager::get_keys`] pops a ready pair or generates
//! synchronously when the pool is dry. Algorithms whose generation keeps
//! failing are marked inactive and skipped on refill.

use aegis_crypto::algorithms::{KemAlgorithm, KeyExchangeAlgorithm};
use aegis_crypto::exchange::KeyPair;
use aegis_crypto::CryptoError;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Consecutive generation failures before an algorithm is marked inactive
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// How often the monitor checks pool depths
const MONITOR_INTERVAL: Duration = Duration::from_millis(250);

/// Algorithms the pools pregenerate keys for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsymmetricAlgorithm {
    /// X25519 exchange keypairs
    X25519,
    /// Kyber768 KEM keypairs
    Kyber768,
    /// NTRU Prime sntrup857 KEM keypairs
    Ntrup857,
}

impl From<KeyExchangeAlgorithm> for AsymmetricAlgorithm {
    fn from(alg: KeyExchangeAlgorithm) -> Self {
        match alg {
            KeyExchangeAlgorithm::EcdhX25519 => Self::X25519,
        }
    }
}

impl AsymmetricAlgorithm {
    /// The pool algorithm for a KEM slot; `None` needs no key material
    #[must_use]
    pub fn from_kem(alg: KemAlgorithm) -> Option<Self> {
        match alg {
            KemAlgorithm::None => None,
            KemAlgorithm::Kyber768 => Some(Self::Kyber768),
            KemAlgorithm::Ntrup857 => Some(Self::Ntrup857),
        }
    }

    fn generate(self) -> std::result::Result<KeyPair, CryptoError> {
        match self {
            Self::X25519 => Ok(KeyPair::generate_exchange()),
            Self::Kyber768 => KeyPair::generate_kem(KemAlgorithm::Kyber768),
            Self::Ntrup857 => KeyPair::generate_kem(KemAlgorithm::Ntrup857),
        }
    }
}

struct KeyPool {
    algorithm: AsymmetricAlgorithm,
    keys: Mutex<VecDeque<KeyPair>>,
    scheduled: AtomicUsize,
    consecutive_failures: AtomicU32,
    inactive: AtomicBool,
}

impl KeyPool {
    fn new(algorithm: AsymmetricAlgorithm) -> Self {
        Self {
            algorithm,
            keys: Mutex::new(VecDeque::new()),
            scheduled: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            inactive: AtomicBool::new(false),
        }
    }

    fn len(&self) -> usize {
        self.keys.lock().expect("key pool lock poisoned").len()
    }

    fn pop(&self) -> Option<KeyPair> {
        self.keys
            .lock()
            .expect("key pool lock poisoned")
            .pop_front()
    }

    fn push(&self, pair: KeyPair) {
        self.keys
            .lock()
            .expect("key pool lock poisoned")
            .push_back(pair);
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= MAX_CONSECUTIVE_FAILURES && !self.inactive.swap(true, Ordering::Relaxed) {
            tracing::error!(
                algorithm = ?self.algorithm,
                failures,
                "key generation keeps failing, marking algorithm inactive"
            );
        }
    }
}

/// Manager for the pregenerated key pools
pub struct KeyManager {
    pools: HashMap<AsymmetricAlgorithm, Arc<KeyPool>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KeyManager {
    /// Start pools for `algorithms`, refilled to `depth` by `num_workers`
    /// generation workers.
    #[must_use]
    pub fn new(algorithms: &[AsymmetricAlgorithm], depth: usize, num_workers: usize) -> Self {
        let pools: HashMap<_, _> = algorithms
            .iter()
            .map(|alg| (*alg, Arc::new(KeyPool::new(*alg))))
            .collect();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (task_tx, task_rx) = mpsc::channel::<Arc<KeyPool>>(depth.max(1) * pools.len().max(1));
        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));

        let mut tasks = Vec::new();

        // Generation workers drain the task queue
        for _ in 0..num_workers.max(1) {
            let task_rx = Arc::clone(&task_rx);
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let pool = {
                        let mut rx = task_rx.lock().await;
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            pool = rx.recv() => match pool {
                                Some(pool) => pool,
                                None => return,
                            },
                        }
                    };

                    let alg = pool.algorithm;
                    let result = tokio::task::spawn_blocking(move || alg.generate()).await;
                    pool.scheduled.fetch_sub(1, Ordering::Relaxed);
                    match result {
                        Ok(Ok(pair)) => {
                            pool.push(pair);
                            pool.record_success();
                        }
                        Ok(Err(err)) => {
                            tracing::warn!(algorithm = ?alg, %err, "key generation failed");
                            pool.record_failure();
                        }
                        Err(err) => {
                            tracing::warn!(algorithm = ?alg, %err, "key generation task panicked");
                            pool.record_failure();
                        }
                    }
                }
            }));
        }

        // Monitor schedules refill tasks
        {
            let pools: Vec<Arc<KeyPool>> = pools.values().cloned().collect();
            let mut shutdown = shutdown_rx;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        () = tokio::time::sleep(MONITOR_INTERVAL) => {}
                    }
                    for pool in &pools {
                        if pool.inactive.load(Ordering::Relaxed) {
                            continue;
                        }
                        let ready = pool.len();
                        let scheduled = pool.scheduled.load(Ordering::Relaxed);
                        let missing = depth.saturating_sub(ready + scheduled);
                        for _ in 0..missing {
                            pool.scheduled.fetch_add(1, Ordering::Relaxed);
                            if task_tx.send(Arc::clone(pool)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }));
        }

        Self {
            pools,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }
    }

    /// Take a pregenerated keypair, generating synchronously when the pool is
    /// dry or the algorithm has no pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failed`] if generation fails.
    pub async fn get_keys(&self, algorithm: AsymmetricAlgorithm) -> Result<KeyPair> {
        if let Some(pool) = self.pools.get(&algorithm) {
            if let Some(pair) = pool.pop() {
                return Ok(pair);
            }
        }
        tracing::debug!(?algorithm, "key pool empty, generating synchronously");
        tokio::task::spawn_blocking(move || algorithm.generate())
            .await
            .map_err(|_| Error::failed("key generation task panicked"))?
            .map_err(Error::from)
    }

    /// Ready keypairs currently pooled for an algorithm
    #[must_use]
    pub fn pool_size(&self, algorithm: AsymmetricAlgorithm) -> usize {
        self.pools.get(&algorithm).map_or(0, |p| p.len())
    }

    /// Whether the algorithm is still being refilled
    #[must_use]
    pub fn is_active(&self, algorithm: AsymmetricAlgorithm) -> bool {
        self.pools
            .get(&algorithm)
            .is_some_and(|p| !p.inactive.load(Ordering::Relaxed))
    }

    /// Stop the monitor and workers
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = {
            let mut guard = self.tasks.lock().expect("task list lock poisoned");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for_depth(mgr: &KeyManager, alg: AsymmetricAlgorithm, depth: usize) {
        for _ in 0..100 {
            if mgr.pool_size(alg) >= depth {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("pool never reached depth {depth}");
    }

    #[tokio::test]
    async fn test_pool_refills_to_depth() {
        let mgr = KeyManager::new(&[AsymmetricAlgorithm::X25519], 4, 2);
        wait_for_depth(&mgr, AsymmetricAlgorithm::X25519, 4).await;
        assert!(mgr.is_active(AsymmetricAlgorithm::X25519));
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_keys_drains_and_refills() {
        let mgr = KeyManager::new(&[AsymmetricAlgorithm::X25519], 2, 1);
        wait_for_depth(&mgr, AsymmetricAlgorithm::X25519, 2).await;

        let a = mgr.get_keys(AsymmetricAlgorithm::X25519).await.unwrap();
        let b = mgr.get_keys(AsymmetricAlgorithm::X25519).await.unwrap();
        assert_ne!(a.public, b.public);

        // Pool refills in the background
        wait_for_depth(&mgr, AsymmetricAlgorithm::X25519, 1).await;
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_keys_generates_when_pool_missing() {
        // No pool configured for X25519 at all
        let mgr = KeyManager::new(&[], 0, 1);
        let pair = mgr.get_keys(AsymmetricAlgorithm::X25519).await.unwrap();
        assert_eq!(pair.public.len(), aegis_crypto::X25519_KEY_SIZE);
        assert!(!mgr.is_active(AsymmetricAlgorithm::X25519));
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_refill() {
        let mgr = KeyManager::new(&[AsymmetricAlgorithm::X25519], 2, 1);
        wait_for_depth(&mgr, AsymmetricAlgorithm::X25519, 2).await;
        mgr.shutdown().await;

        while mgr.get_keys(AsymmetricAlgorithm::X25519).await.is_ok()
            && mgr.pool_size(AsymmetricAlgorithm::X25519) > 0
        {}
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(mgr.pool_size(AsymmetricAlgorithm::X25519), 0);
    }
}
