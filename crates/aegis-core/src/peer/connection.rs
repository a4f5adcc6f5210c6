//! Buffered record I/O over a transport.

use aegis_transport::Transport;
use crate::error::{DisconnectReason, Error, Result};
use crate::frame::{RecordBuffer, WireRecord};

use std::sync::Arc;

const RECV_CHUNK_SIZE: usize = 4096;

/// A transport plus the receive-side record reassembly buffer.
///
/// The transport itself is shared: [`Connection::sender`] hands out a cheap
/// handle for the send side so receive polling and sending never contend for
/// one borrow.
pub struct Connection {
    transport: Arc<dyn Transport>,
    buffer: RecordBuffer,
}

impl Connection {
    /// Wrap a connected transport
    #[must_use]
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Arc::from(transport),
            buffer: RecordBuffer::new(),
        }
    }

    /// The underlying transport
    #[must_use]
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// A shared handle to the transport's send side
    #[must_use]
    pub fn sender(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Send raw bytes
    ///
    /// # Errors
    ///
    /// Propagates transport failures as [`Error::Disconnected`].
    pub async fn send_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.transport.send(bytes).await.map_err(Error::from)
    }

    async fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; RECV_CHUNK_SIZE];
        let n = self.transport.recv(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Disconnected(DisconnectReason::TransportError));
        }
        self.buffer.extend(&chunk[..n]);
        Ok(())
    }

    /// Receive the next plain (handshake) record
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] when the peer goes away.
    pub async fn recv_plain_record(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(body) = self.buffer.next_plain_record() {
                return Ok(body);
            }
            self.fill().await?;
        }
    }

    /// Receive the next sealed wire record
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] when the peer goes away.
    pub async fn recv_wire_record(&mut self) -> Result<WireRecord> {
        loop {
            if let Some(record) = self.buffer.next_record()? {
                return Ok(record);
            }
            self.fill().await?;
        }
    }

    /// Close the transport
    pub async fn close(&self) {
        self.transport.close().await;
    }
}
