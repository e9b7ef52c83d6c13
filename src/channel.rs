//! The byte-stream transport boundary.
//!
//! The frame recognizer never consumes bytes it is not certain about, so the
//! transport must expose peek/consume semantics over an internal fill
//! buffer: [`ByteChannel::fill`] pulls whatever the transport has ready
//! without blocking, [`ByteChannel::fill_until`] waits (bounded) for a byte
//! matching a predicate — in practice a frame terminator — and
//! [`ByteChannel::peek`]/[`ByteChannel::consume`] operate on the buffer.
//!
//! Two implementations ship with the driver: [`TcpChannel`] for
//! TCP-tunneled serial bridges, and [`MemoryChannel`], a scripted in-memory
//! channel used by the tests to play the role of the PCI.

use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::warn;
use tokio::{io::AsyncWriteExt, net::TcpStream, sync::Notify, time::Instant};

/// Predicate deciding when [`ByteChannel::fill_until`] may stop waiting.
pub type StopByte<'a> = &'a (dyn Fn(u8) -> bool + Send + Sync);

/// A duplex byte channel with a peekable receive buffer.
#[async_trait]
pub trait ByteChannel: Send {
    /// Write bytes to the underlying transport.
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Pull whatever bytes the transport has ready into the receive buffer
    /// without waiting. Returns the number of bytes added.
    async fn fill(&mut self) -> io::Result<usize>;

    /// Fill until a newly arrived byte satisfies `stop` or `timeout`
    /// elapses. Returns true if such a byte arrived.
    async fn fill_until(&mut self, stop: StopByte<'_>, timeout: Duration) -> io::Result<bool>;

    /// Number of buffered bytes available to peek.
    fn available(&self) -> usize;

    /// Look at up to `n` buffered bytes without consuming them.
    fn peek(&self, n: usize) -> &[u8];

    /// Consume exactly `n` buffered bytes (clamped to the buffer length).
    fn consume(&mut self, n: usize) -> Bytes;
}

#[async_trait]
impl<T: ByteChannel + ?Sized> ByteChannel for Box<T> {
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()> { (**self).send(bytes).await }

    async fn fill(&mut self) -> io::Result<usize> { (**self).fill().await }

    async fn fill_until(&mut self, stop: StopByte<'_>, timeout: Duration) -> io::Result<bool> {
        (**self).fill_until(stop, timeout).await
    }

    fn available(&self) -> usize { (**self).available() }

    fn peek(&self, n: usize) -> &[u8] { (**self).peek(n) }

    fn consume(&mut self, n: usize) -> Bytes { (**self).consume(n) }
}

/// TCP transport for serial-over-TCP bridges.
pub struct TcpChannel {
    stream: TcpStream,
    buffer: BytesMut,
}

impl TcpChannel {
    /// Connect to a TCP-tunneled PCI.
    ///
    /// # Errors
    ///
    /// Returns the connection error from the socket layer.
    pub async fn connect(addr: &str) -> io::Result<TcpChannel> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(TcpChannel {
            stream,
            buffer: BytesMut::with_capacity(4096),
        })
    }

    /// Wrap an already connected stream.
    #[must_use]
    pub fn from_stream(stream: TcpStream) -> TcpChannel {
        TcpChannel {
            stream,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    fn drain_ready(&mut self) -> io::Result<usize> {
        let mut added = 0;
        loop {
            match self.stream.try_read_buf(&mut self.buffer) {
                // EOF; already-read bytes still count, the next fill reports it.
                Ok(0) => return Ok(added),
                Ok(n) => added += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(added),
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl ByteChannel for TcpChannel {
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    async fn fill(&mut self) -> io::Result<usize> {
        match self.stream.try_read_buf(&mut self.buffer) {
            Ok(0) => {
                warn!("transport closed by peer");
                Err(io::ErrorKind::UnexpectedEof.into())
            }
            Ok(first) => Ok(first + self.drain_ready()?),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }

    async fn fill_until(&mut self, stop: StopByte<'_>, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut scanned = 0;
        loop {
            if self.buffer[scanned..].iter().any(|&b| stop(b)) {
                return Ok(true);
            }
            scanned = self.buffer.len();
            let wait = deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                return Ok(false);
            }
            match tokio::time::timeout(wait, self.stream.readable()).await {
                Ok(ready) => {
                    ready?;
                    self.fill().await?;
                }
                Err(_) => return Ok(false),
            }
        }
    }

    fn available(&self) -> usize { self.buffer.len() }

    fn peek(&self, n: usize) -> &[u8] { &self.buffer[..n.min(self.buffer.len())] }

    fn consume(&mut self, n: usize) -> Bytes {
        self.buffer.split_to(n.min(self.buffer.len())).freeze()
    }
}

#[derive(Default)]
struct MemoryShared {
    inbound: std::sync::Mutex<BytesMut>,
    written: std::sync::Mutex<Vec<u8>>,
    inbound_notify: Notify,
    written_notify: Notify,
}

/// In-memory channel; the paired [`MemoryHandle`] plays the device side.
pub struct MemoryChannel {
    shared: Arc<MemoryShared>,
    buffer: BytesMut,
}

/// Device-side handle of a [`MemoryChannel`].
#[derive(Clone)]
pub struct MemoryHandle {
    shared: Arc<MemoryShared>,
}

impl MemoryChannel {
    /// Create a channel plus the handle that feeds and observes it.
    #[must_use]
    pub fn new() -> (MemoryChannel, MemoryHandle) {
        let shared = Arc::new(MemoryShared::default());
        (
            MemoryChannel {
                shared: Arc::clone(&shared),
                buffer: BytesMut::new(),
            },
            MemoryHandle { shared },
        )
    }
}

impl MemoryHandle {
    /// Queue bytes for the driver to receive.
    pub fn feed(&self, bytes: &[u8]) {
        self.shared
            .inbound
            .lock()
            .expect("memory channel lock poisoned")
            .extend_from_slice(bytes);
        self.shared.inbound_notify.notify_waiters();
    }

    /// Take everything the driver has written so far.
    #[must_use]
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(
            &mut *self
                .shared
                .written
                .lock()
                .expect("memory channel lock poisoned"),
        )
    }

    /// Wait until the driver writes something, then take it.
    pub async fn next_written(&self) -> Vec<u8> {
        loop {
            let notified = self.shared.written_notify.notified();
            let written = self.take_written();
            if !written.is_empty() {
                return written;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ByteChannel for MemoryChannel {
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.shared
            .written
            .lock()
            .expect("memory channel lock poisoned")
            .extend_from_slice(bytes);
        self.shared.written_notify.notify_waiters();
        Ok(())
    }

    async fn fill(&mut self) -> io::Result<usize> {
        let mut inbound = self
            .shared
            .inbound
            .lock()
            .expect("memory channel lock poisoned");
        let added = inbound.len();
        self.buffer.extend_from_slice(&inbound.split());
        Ok(added)
    }

    async fn fill_until(&mut self, stop: StopByte<'_>, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut scanned = 0;
        loop {
            self.fill().await?;
            if self.buffer[scanned..].iter().any(|&b| stop(b)) {
                return Ok(true);
            }
            scanned = self.buffer.len();
            let wait = deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                return Ok(false);
            }
            let notified = self.shared.inbound_notify.notified();
            let inbound_empty = self
                .shared
                .inbound
                .lock()
                .expect("memory channel lock poisoned")
                .is_empty();
            if inbound_empty && tokio::time::timeout(wait, notified).await.is_err() {
                // Drain anything that raced in between the check and the
                // timeout before giving up.
                self.fill().await?;
                return Ok(self.buffer[scanned..].iter().any(|&b| stop(b)));
            }
        }
    }

    fn available(&self) -> usize { self.buffer.len() }

    fn peek(&self, n: usize) -> &[u8] { &self.buffer[..n.min(self.buffer.len())] }

    fn consume(&mut self, n: usize) -> Bytes {
        self.buffer.split_to(n.min(self.buffer.len())).freeze()
    }
}
