//! TCP and UDP forwarders
//!
//! The driver calls a forwarder for the first packet of every flow it does
//! not know yet. The forwarder builds a [`ConnectionRequest`] and submits it
//! to the active pool through the [`PoolSlot`].
//!
//! # Dropping policy
//!
//! A flow arriving while no pool is set, or while the active pool is closed
//! or full, is dropped without any reply to the sender. The network never
//! learns that a relay sits behind the interface.
//!
//! # Inflight cap
//!
//! At most `max_inflight` TCP requests exist between SYN arrival and
//! accept/terminate. Beyond that, SYNs are dropped; the sender's own
//! retransmission brings them back once a slot frees up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::stats::StackStats;
use crate::error::{AddError, StackError};
use crate::pool::ConnectionPool;
use crate::request::{ConnectionRequest, DriverHandle, FlowKey, Protocol, TcpRequest, UdpRequest};

/// The active pool reference, guarded by the stack lock
///
/// `submit` holds the lock across `ConnectionPool::add`, so a request is
/// never added to a pool that `replace` has already swapped out.
#[derive(Debug, Default)]
pub(crate) struct PoolSlot {
    current: Mutex<Option<ConnectionPool>>,
}

impl PoolSlot {
    pub fn new(pool: Option<ConnectionPool>) -> Self {
        Self {
            current: Mutex::new(pool),
        }
    }

    /// Swap the active pool, returning the previous one
    pub fn replace(&self, pool: Option<ConnectionPool>) -> Option<ConnectionPool> {
        std::mem::replace(&mut *self.current.lock(), pool)
    }

    pub fn current(&self) -> Option<ConnectionPool> {
        self.current.lock().clone()
    }

    /// Add `request` to the active pool, returning that pool's id
    pub fn submit(&self, request: ConnectionRequest) -> Result<u64, AddError> {
        let current = self.current.lock();
        let Some(pool) = current.as_ref() else {
            return Err(AddError {
                reason: StackError::PoolUnset,
                request,
            });
        };
        pool.add(request)?;
        Ok(pool.id())
    }
}

/// Log and count a refused submission; the request is dropped by the caller
fn record_rejection(stats: &StackStats, protocol: Protocol, flow: FlowKey, reason: &StackError) {
    match reason {
        StackError::PoolUnset => {
            stats.record_dropped_no_pool();
            trace!(%protocol, %flow, "No pool set, dropping new flow");
        }
        StackError::PoolClosed => {
            stats.record_dropped_pool_closed();
            debug!(%protocol, %flow, "Pool closed, dropping new flow");
        }
        StackError::PoolFull { capacity } => {
            stats.record_dropped_pool_full();
            warn!(%protocol, %flow, capacity, "Pool full, dropping new flow");
        }
        other => {
            warn!(%protocol, %flow, error = %other, "Failed to queue connection request");
        }
    }
}

// =============================================================================
// TCP
// =============================================================================

pub(crate) struct TcpForwarder {
    slot: Arc<PoolSlot>,
    inflight: Arc<Semaphore>,
    max_inflight: usize,
    /// Flows with a request that is neither accepted nor terminated
    pending: HashMap<FlowKey, u64>,
    driver: DriverHandle,
    stats: Arc<StackStats>,
}

impl TcpForwarder {
    pub fn new(
        slot: Arc<PoolSlot>,
        max_inflight: usize,
        driver: DriverHandle,
        stats: Arc<StackStats>,
    ) -> Self {
        Self {
            slot,
            inflight: Arc::new(Semaphore::new(max_inflight)),
            max_inflight,
            pending: HashMap::new(),
            driver,
            stats,
        }
    }

    pub fn is_pending(&self, flow: &FlowKey) -> bool {
        self.pending.contains_key(flow)
    }

    /// Requests currently holding an inflight slot
    pub fn inflight(&self) -> usize {
        self.max_inflight - self.inflight.available_permits()
    }

    /// Handle the SYN opening `flow`
    pub fn on_syn(&mut self, flow: FlowKey, frame: &[u8]) {
        if self.pending.contains_key(&flow) {
            trace!(%flow, "Retransmitted SYN for pending flow");
            return;
        }

        let Ok(permit) = Arc::clone(&self.inflight).try_acquire_owned() else {
            self.stats.record_dropped_inflight();
            debug!(
                %flow,
                max_inflight = self.max_inflight,
                "Inflight limit reached, dropping SYN"
            );
            return;
        };

        let request = TcpRequest::new(
            flow,
            Bytes::copy_from_slice(frame),
            Some(permit),
            self.driver.clone(),
        );
        let id = request.id();

        match self.slot.submit(request.into()) {
            Ok(pool) => {
                self.pending.insert(flow, id);
                self.stats.record_tcp_request();
                debug!(id, pool, %flow, "TCP request queued");
            }
            Err(err) => {
                let (reason, request) = err.into_parts();
                record_rejection(&self.stats, Protocol::Tcp, flow, &reason);
                // Silent: no RST for flows nobody can service.
                request.terminate(false);
            }
        }
    }

    /// Forget `flow` if request `id` still owns it
    pub fn complete(&mut self, flow: &FlowKey, id: u64) -> bool {
        if self.pending.get(flow) == Some(&id) {
            self.pending.remove(flow);
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

// =============================================================================
// UDP
// =============================================================================

struct UdpBinding {
    id: u64,
    to_consumer: mpsc::Sender<Bytes>,
    last_seen: Instant,
}

pub(crate) struct UdpForwarder {
    slot: Arc<PoolSlot>,
    pending: HashMap<FlowKey, u64>,
    active: HashMap<FlowKey, UdpBinding>,
    idle_timeout: Duration,
    driver: DriverHandle,
    stats: Arc<StackStats>,
}

impl UdpForwarder {
    pub fn new(
        slot: Arc<PoolSlot>,
        idle_timeout: Duration,
        driver: DriverHandle,
        stats: Arc<StackStats>,
    ) -> Self {
        Self {
            slot,
            pending: HashMap::new(),
            active: HashMap::new(),
            idle_timeout,
            driver,
            stats,
        }
    }

    /// Handle an inbound datagram
    pub fn on_datagram(&mut self, flow: FlowKey, payload: &[u8]) {
        if let Some(binding) = self.active.get_mut(&flow) {
            binding.last_seen = Instant::now();
            match binding.to_consumer.try_send(Bytes::copy_from_slice(payload)) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    self.stats.record_dropped_datagram();
                    trace!(%flow, "UDP consumer behind, dropping datagram");
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    // Consumer dropped the flow; treat this datagram as a new one.
                    debug!(%flow, "UDP flow closed by consumer");
                    self.active.remove(&flow);
                }
            }
        }

        if self.pending.contains_key(&flow) {
            self.stats.record_dropped_datagram();
            trace!(%flow, "Datagram for pending UDP flow dropped");
            return;
        }

        let request = UdpRequest::new(flow, Bytes::copy_from_slice(payload), self.driver.clone());
        let id = request.id();

        match self.slot.submit(request.into()) {
            Ok(pool) => {
                self.pending.insert(flow, id);
                self.stats.record_udp_request();
                debug!(id, pool, %flow, "UDP request queued");
            }
            Err(err) => {
                let (reason, request) = err.into_parts();
                record_rejection(&self.stats, Protocol::Udp, flow, &reason);
                request.terminate(false);
            }
        }
    }

    /// Start delivering the flow's datagrams to its consumer
    pub fn accept(&mut self, id: u64, flow: FlowKey, to_consumer: mpsc::Sender<Bytes>) {
        if self.pending.get(&flow) == Some(&id) {
            self.pending.remove(&flow);
        }
        self.active.insert(
            flow,
            UdpBinding {
                id,
                to_consumer,
                last_seen: Instant::now(),
            },
        );
    }

    /// Forget a pending flow whose request was dropped
    pub fn release(&mut self, id: u64, flow: &FlowKey) {
        if self.pending.get(flow) == Some(&id) {
            self.pending.remove(flow);
        }
    }

    /// Note outbound traffic on an accepted flow
    pub fn touch(&mut self, flow: &FlowKey) {
        if let Some(binding) = self.active.get_mut(flow) {
            binding.last_seen = Instant::now();
        }
    }

    /// Drop accepted flows idle for longer than the timeout
    pub fn reap_idle(&mut self, now: Instant) -> usize {
        let before = self.active.len();
        let timeout = self.idle_timeout;
        self.active.retain(|flow, binding| {
            let keep = now.saturating_duration_since(binding.last_seen) < timeout;
            if !keep {
                debug!(id = binding.id, %flow, "UDP flow idle, forgetting");
            }
            keep
        });
        before - self.active.len()
    }

    #[cfg(test)]
    pub fn is_active(&self, flow: &FlowKey) -> bool {
        self.active.contains_key(flow)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.active.clear();
    }
}
