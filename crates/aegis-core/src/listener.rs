//! Inbound listener management.
//!
//! One accept task per registered listener. Every accepted transport passes
//! the access manager's admission gates before it is handed to the node for
//! the handshake; refused transports are closed on the spot. UDP-style
//! listeners additionally track the inbound connect rate against the cookie
//! threshold.

use aegis_transport::{Transport, TransportListener};
use crate::access::{AccessManager, AttemptKind};
use crate::rate_limit::RateLimit;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Queue depth between accept tasks and the handshake dispatcher
const ACCEPT_QUEUE_DEPTH: usize = 64;

/// An accepted transport plus whether its listener demands authentication
pub struct AcceptedTransport {
    /// The connected transport
    pub transport: Box<dyn Transport>,
    /// The listener's `require_authentication` flag
    pub require_authentication: bool,
}

/// Spawns and tracks accept loops
pub struct ListenerManager {
    access: Arc<AccessManager>,
    accepted_tx: mpsc::Sender<AcceptedTransport>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ListenerManager {
    /// Create the manager and the queue of admitted transports
    #[must_use]
    pub fn new(
        access: Arc<AccessManager>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (Self, mpsc::Receiver<AcceptedTransport>) {
        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        (
            Self {
                access,
                accepted_tx,
                shutdown_rx,
                tasks: StdMutex::new(Vec::new()),
            },
            accepted_rx,
        )
    }

    /// Start an accept loop for `listener`.
    ///
    /// `cookie_threshold`/`cookie_interval` bound the inbound connect rate
    /// before cookies are demanded of suspendable (UDP) transports.
    pub fn add_listener(
        &self,
        listener: Box<dyn TransportListener>,
        require_authentication: bool,
        cookie_threshold: usize,
        cookie_interval: Duration,
    ) {
        let access = Arc::clone(&self.access);
        let accepted_tx = self.accepted_tx.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let endpoint = listener.local_endpoint();

        let task = tokio::spawn(async move {
            let mut cookie_budget = RateLimit::new(cookie_threshold as u64);
            let mut window_start = Instant::now();
            tracing::info!(%endpoint, "listener started");

            loop {
                let transport = tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(transport) => transport,
                        Err(_) => break,
                    },
                };

                let addr = transport.peer_endpoint().address();
                if let Err(err) = access.admit(&addr, AttemptKind::Connection).await {
                    tracing::debug!(address = %addr, %err, "inbound connection refused");
                    transport.close().await;
                    continue;
                }

                if window_start.elapsed() >= cookie_interval {
                    cookie_budget.reset();
                    window_start = Instant::now();
                }
                if !cookie_budget.add(1) && transport.is_suspendable() {
                    tracing::debug!(
                        address = %addr,
                        "connect rate above cookie threshold, requiring cookie"
                    );
                }

                if accepted_tx
                    .send(AcceptedTransport {
                        transport,
                        require_authentication,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }

            listener.close().await;
            tracing::info!(%endpoint, "listener stopped");
        });

        self.tasks.lock().expect("task list lock poisoned").push(task);
    }

    /// Wait for all accept loops to finish (after the shutdown signal fired)
    pub async fn join(&self) {
        let tasks = {
            let mut guard = self.tasks.lock().expect("task list lock poisoned");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}
