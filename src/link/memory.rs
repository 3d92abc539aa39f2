//! In-memory link
//!
//! [`MemoryLink::pair`] returns the stack-facing link plus a [`MemoryPeer`]
//! that plays the role of the operating system: frames injected through the
//! peer are read by the stack, frames the stack sends come out of the peer.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use super::{closed_error, Link};

/// Stack side of an in-memory link
#[derive(Debug)]
pub struct MemoryLink {
    name: String,
    mtu: usize,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    close_tx: watch::Sender<bool>,
}

/// Host side of an in-memory link
#[derive(Debug)]
pub struct MemoryPeer {
    to_link: mpsc::UnboundedSender<Vec<u8>>,
    from_link: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryLink {
    /// Create a connected link/peer pair
    #[must_use]
    pub fn pair(name: &str, mtu: usize) -> (Arc<Self>, MemoryPeer) {
        let (to_link, inbound) = mpsc::unbounded_channel();
        let (outbound, from_link) = mpsc::unbounded_channel();
        let (close_tx, _) = watch::channel(false);

        let link = Arc::new(Self {
            name: name.to_string(),
            mtu,
            inbound: Mutex::new(inbound),
            outbound,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            close_tx,
        });

        (link, MemoryPeer { to_link, from_link })
    }

    /// How many times `close` was invoked
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.close_tx.subscribe();
        if *closed.borrow() {
            return Err(closed_error());
        }

        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            frame = inbound.recv() => {
                let frame = frame.ok_or_else(closed_error)?;
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(len)
            }
            _ = closed.wait_for(|closed| *closed) => Err(closed_error()),
        }
    }

    async fn send(&self, frame: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.outbound
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped"))
    }

    fn close(&self) -> io::Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        self.close_tx.send_replace(true);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl MemoryPeer {
    /// Hand a frame to the stack as if it arrived on the interface
    ///
    /// Returns `false` if the link side is gone.
    pub fn inject(&self, frame: Vec<u8>) -> bool {
        self.to_link.send(frame).is_ok()
    }

    /// Wait for the next frame written by the stack
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.from_link.recv().await
    }

    /// Take a frame written by the stack if one is ready
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.from_link.try_recv().ok()
    }
}
