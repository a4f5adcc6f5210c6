//! In-memory duplex transport.
//!
//! Backs the unit and integration test suites: two [`MemoryTransport`] halves
//! move byte buffers over bounded channels with the same contract a socket
//! backend provides, including half-close and backpressure.

use crate::endpoint::Endpoint;
use crate::transport::{Transport, TransportError, TransportListener, TransportResult};
use async_trait::async_trait;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};

/// Buffered messages per direction before senders wait
const CHANNEL_CAPACITY: usize = 64;

struct RecvState {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

/// One half of an in-memory duplex connection
pub struct MemoryTransport {
    local: Endpoint,
    peer: Endpoint,
    tx: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: Mutex<RecvState>,
    closed: AtomicBool,
    suspendable: bool,
}

impl MemoryTransport {
    /// Create a connected pair of transports
    #[must_use]
    pub fn pair(a: Endpoint, b: Endpoint) -> (Self, Self) {
        Self::pair_with(a, b, false)
    }

    /// Create a connected pair, optionally reporting as suspendable (UDP-like)
    #[must_use]
    pub fn pair_with(a: Endpoint, b: Endpoint, suspendable: bool) -> (Self, Self) {
        let (tx_ab, rx_ab) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_ba, rx_ba) = mpsc::channel(CHANNEL_CAPACITY);

        let side_a = Self {
            local: a,
            peer: b,
            tx: StdMutex::new(Some(tx_ab)),
            rx: Mutex::new(RecvState {
                rx: rx_ba,
                pending: Vec::new(),
            }),
            closed: AtomicBool::new(false),
            suspendable,
        };
        let side_b = Self {
            local: b,
            peer: a,
            tx: StdMutex::new(Some(tx_ba)),
            rx: Mutex::new(RecvState {
                rx: rx_ab,
                pending: Vec::new(),
            }),
            closed: AtomicBool::new(false),
            suspendable,
        };
        (side_a, side_b)
    }

    fn sender(&self) -> TransportResult<mpsc::Sender<Vec<u8>>> {
        self.tx
            .lock()
            .expect("sender lock poisoned")
            .clone()
            .ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, buf: &[u8]) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let tx = self.sender()?;
        tx.send(buf.to_vec())
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self, buf: &mut [u8]) -> TransportResult<usize> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut state = self.rx.lock().await;

        if state.pending.is_empty() {
            match state.rx.recv().await {
                Some(msg) => state.pending = msg,
                // Peer dropped its sender: half-closed
                None => return Ok(0),
            }
        }

        let n = buf.len().min(state.pending.len());
        buf[..n].copy_from_slice(&state.pending[..n]);
        state.pending.drain(..n);
        Ok(n)
    }

    fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    fn peer_endpoint(&self) -> Endpoint {
        self.peer
    }

    fn is_suspendable(&self) -> bool {
        self.suspendable
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the sender lets the peer observe EOF
        self.tx.lock().expect("sender lock poisoned").take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Accept side of an in-memory listener
pub struct MemoryListener {
    endpoint: Endpoint,
    rx: Mutex<mpsc::Receiver<MemoryTransport>>,
    closed: AtomicBool,
}

/// Connect side of an in-memory listener
#[derive(Clone)]
pub struct MemoryConnector {
    endpoint: Endpoint,
    tx: mpsc::Sender<MemoryTransport>,
}

impl MemoryListener {
    /// Create a listener bound to `endpoint` plus the connector that reaches it
    #[must_use]
    pub fn new(endpoint: Endpoint) -> (Self, MemoryConnector) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                endpoint,
                rx: Mutex::new(rx),
                closed: AtomicBool::new(false),
            },
            MemoryConnector { endpoint, tx },
        )
    }
}

#[async_trait]
impl TransportListener for MemoryListener {
    async fn accept(&self) -> TransportResult<Box<dyn Transport>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(TransportError::Closed),
        }
    }

    fn local_endpoint(&self) -> Endpoint {
        self.endpoint
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.rx.lock().await.close();
    }
}

impl MemoryConnector {
    /// The endpoint the listener is bound to
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Open a connection from `local`, returning the client transport.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the listener is gone.
    pub async fn connect(&self, local: Endpoint) -> TransportResult<MemoryTransport> {
        let (client, server) = MemoryTransport::pair(local, self.endpoint);
        self.tx
            .send(server)
            .await
            .map_err(|_| TransportError::ConnectionFailed("listener closed".to_string()))?;
        Ok(client)
    }
}

/// A process-local fabric of memory listeners, addressable by endpoint.
///
/// Lets several in-process nodes listen and dial each other the way they
/// would over a real network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: std::sync::Arc<StdMutex<std::collections::HashMap<Endpoint, MemoryConnector>>>,
}

impl MemoryNetwork {
    /// Create an empty fabric
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a listener on `endpoint`
    #[must_use]
    pub fn listen(&self, endpoint: Endpoint) -> MemoryListener {
        let (listener, connector) = MemoryListener::new(endpoint);
        self.listeners
            .lock()
            .expect("listener map lock poisoned")
            .insert(endpoint, connector);
        listener
    }

    /// A dialer whose connections report `source` as their local endpoint
    #[must_use]
    pub fn dialer(&self, source: Endpoint) -> MemoryDialer {
        MemoryDialer {
            network: self.clone(),
            source,
        }
    }
}

/// Dials endpoints registered on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryDialer {
    network: MemoryNetwork,
    source: Endpoint,
}

#[async_trait]
impl crate::transport::Connector for MemoryDialer {
    async fn connect(&self, endpoint: Endpoint) -> TransportResult<Box<dyn Transport>> {
        let connector = self
            .network
            .listeners
            .lock()
            .expect("listener map lock poisoned")
            .get(&endpoint)
            .cloned()
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("no listener at {endpoint}"))
            })?;
        let transport = connector.connect(self.source).await?;
        Ok(Box::new(transport))
    }
}
