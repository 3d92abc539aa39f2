//! Queue-backed smoltcp device
//!
//! The engine never touches the link directly. The driver pushes frames read
//! from the link into the receive queue, polls the engine, then drains the
//! transmit queue back to the link.
//!
//! ```text
//! link.recv ──► FrameQueue.rx ──► StackDevice::receive ──► smoltcp Interface
//! link.send ◄── FrameQueue.tx ◄── StackDevice::transmit ◄──┘
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smoltcp::phy::{
    Checksum, ChecksumCapabilities, Device, DeviceCapabilities, Medium, RxToken, TxToken,
};
use smoltcp::time::Instant as SmoltcpInstant;
use tracing::trace;

/// Maximum frames buffered in either direction
///
/// A single engine poll can emit a full receive window of segments for many
/// sockets, so this is sized well above one window's worth.
pub const MAX_QUEUE_DEPTH: usize = 1024;

/// Receive and transmit frame queues shared between the driver and the device
#[derive(Debug, Default)]
pub struct FrameQueue {
    rx: Mutex<VecDeque<Vec<u8>>>,
    tx: Mutex<VecDeque<Vec<u8>>>,
    dropped: AtomicU64,
}

impl FrameQueue {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a frame for the engine; returns `false` when the queue is full
    pub fn push_rx(&self, frame: Vec<u8>) -> bool {
        Self::push(&self.rx, frame, &self.dropped)
    }

    pub fn pop_rx(&self) -> Option<Vec<u8>> {
        self.rx.lock().pop_front()
    }

    /// Queue a frame for the link; returns `false` when the queue is full
    pub fn push_tx(&self, frame: Vec<u8>) -> bool {
        Self::push(&self.tx, frame, &self.dropped)
    }

    pub fn pop_tx(&self) -> Option<Vec<u8>> {
        self.tx.lock().pop_front()
    }

    /// Take every pending outbound frame at once
    pub fn drain_tx(&self) -> Vec<Vec<u8>> {
        self.tx.lock().drain(..).collect()
    }

    #[must_use]
    pub fn rx_len(&self) -> usize {
        self.rx.lock().len()
    }

    #[must_use]
    pub fn tx_len(&self) -> usize {
        self.tx.lock().len()
    }

    /// Frames refused because a queue was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.rx.lock().clear();
        self.tx.lock().clear();
    }

    fn push(queue: &Mutex<VecDeque<Vec<u8>>>, frame: Vec<u8>, dropped: &AtomicU64) -> bool {
        let mut queue = queue.lock();
        if queue.len() >= MAX_QUEUE_DEPTH {
            trace!("Frame queue full, dropping {} bytes", frame.len());
            dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        queue.push_back(frame);
        true
    }
}

/// smoltcp [`Device`] over a [`FrameQueue`]
///
/// Uses `Medium::Ip`: TUN frames carry no link-layer header. Checksums are
/// computed on transmit only; validating inbound checksums is left to the
/// hosts at either end.
pub struct StackDevice {
    queue: Arc<FrameQueue>,
    mtu: usize,
}

impl StackDevice {
    #[must_use]
    pub fn new(queue: Arc<FrameQueue>, mtu: usize) -> Self {
        Self { queue, mtu }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }
}

impl Device for StackDevice {
    type RxToken<'a> = StackRxToken where Self: 'a;
    type TxToken<'a> = StackTxToken<'a> where Self: 'a;

    fn receive(
        &mut self,
        _timestamp: SmoltcpInstant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.queue.pop_rx()?;
        Some((StackRxToken { frame }, StackTxToken { queue: &self.queue }))
    }

    fn transmit(&mut self, _timestamp: SmoltcpInstant) -> Option<Self::TxToken<'_>> {
        Some(StackTxToken { queue: &self.queue })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps.checksum = ChecksumCapabilities::default();
        caps.checksum.ipv4 = Checksum::Tx;
        caps.checksum.tcp = Checksum::Tx;
        caps.checksum.udp = Checksum::Tx;
        caps.checksum.icmpv4 = Checksum::Tx;
        caps.checksum.icmpv6 = Checksum::Tx;
        caps
    }
}

pub struct StackRxToken {
    frame: Vec<u8>,
}

impl RxToken for StackRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = self.frame;
        f(&mut frame)
    }
}

pub struct StackTxToken<'a> {
    queue: &'a Arc<FrameQueue>,
}

impl TxToken for StackTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        self.queue.push_tx(buffer);
        result
    }
}
