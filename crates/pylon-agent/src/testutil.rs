//! In-memory [`Transport`] for exercising agents without sockets.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::transport::Transport;

/// Records every write and close. Writes can be made to fail or to hang.
#[derive(Debug)]
pub struct RecordingTransport {
    remote_addr: SocketAddr,
    writes: Mutex<Vec<Bytes>>,
    closes: AtomicUsize,
    fail_writes: AtomicBool,
    stall_writes: AtomicBool,
    written: Notify,
}

impl RecordingTransport {
    /// Transport reporting `127.0.0.1:3250` as the peer.
    pub fn new() -> Self {
        Self::with_addr(SocketAddr::from(([127, 0, 0, 1], 3250)))
    }

    /// Transport reporting `remote_addr` as the peer.
    pub fn with_addr(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            writes: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            stall_writes: AtomicBool::new(false),
            written: Notify::new(),
        }
    }

    /// Make subsequent writes fail with `BrokenPipe`.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Make subsequent writes never complete.
    pub fn stall_writes(&self) {
        self.stall_writes.store(true, Ordering::SeqCst);
    }

    /// Everything written so far, one entry per write call.
    pub fn writes(&self) -> Vec<Bytes> {
        self.writes.lock().clone()
    }

    /// Number of `close` calls.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` writes have been recorded.
    pub async fn wait_for_writes(&self, n: usize) -> Vec<Bytes> {
        loop {
            let written = self.written.notified();
            {
                let writes = self.writes.lock();
                if writes.len() >= n {
                    return writes.clone();
                }
            }
            written.await;
        }
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.stall_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
        }
        self.writes.lock().push(Bytes::copy_from_slice(data));
        self.written.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        let _ = self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}
