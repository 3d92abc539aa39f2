//! Connection pool
//!
//! A closable FIFO of pending [`ConnectionRequest`]s shared between the
//! stack's forwarders (producers) and whatever component currently services
//! flows (consumers). Cloning a pool clones the handle, not the queue.
//!
//! # Lifecycle
//!
//! ```text
//! open ──add/next──► open ──close()──► closed
//!                                      add → PoolClosed
//!                                      next → None
//! ```
//!
//! Closing hands the unclaimed requests back to the caller. The pool never
//! terminates requests itself.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{AddError, StackError};
use crate::request::ConnectionRequest;

/// Global counter for pool IDs
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A closable queue of pending connection requests
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    id: u64,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Notify,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<ConnectionRequest>,
    closed: bool,
}

impl ConnectionPool {
    /// Default number of requests a pool holds before refusing more
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Create an open pool holding at most `capacity` requests
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                capacity: capacity.max(1),
                state: Mutex::new(PoolState::default()),
                available: Notify::new(),
            }),
        }
    }

    /// Unique identifier of this pool
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Queue a request for consumers
    ///
    /// # Errors
    ///
    /// Fails with `PoolClosed` once the pool is closed and `PoolFull` at
    /// capacity. The request is returned inside the error.
    pub fn add(&self, request: ConnectionRequest) -> Result<(), AddError> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(AddError {
                    reason: StackError::PoolClosed,
                    request,
                });
            }
            if state.queue.len() >= self.inner.capacity {
                return Err(AddError {
                    reason: StackError::PoolFull {
                        capacity: self.inner.capacity,
                    },
                    request,
                });
            }
            state.queue.push_back(request);
        }
        self.inner.available.notify_one();
        Ok(())
    }

    /// Whether the pool has been closed
    #[must_use]
    pub fn closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Close the pool and return the requests no consumer claimed
    ///
    /// Blocked consumers wake up and observe `None`. Closing twice returns
    /// an empty list the second time.
    pub fn close(&self) -> Vec<ConnectionRequest> {
        let remaining: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.queue.drain(..).collect()
        };
        self.inner.available.notify_waiters();
        debug!(
            pool = self.inner.id,
            unclaimed = remaining.len(),
            "Connection pool closed"
        );
        remaining
    }

    /// Wait for the next request
    ///
    /// Returns `None` once the pool is closed, even if requests were queued
    /// when it happened (those went back to whoever closed it).
    pub async fn next(&self) -> Option<ConnectionRequest> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(next) = self.poll_state() {
                return next;
            }

            notified.await;
        }
    }

    /// Take the next request if one is queued
    #[must_use]
    pub fn try_next(&self) -> Option<ConnectionRequest> {
        self.poll_state().flatten()
    }

    /// Number of queued requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether both handles refer to the same pool
    #[must_use]
    pub fn same_pool(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// `Some(None)` when closed, `Some(Some(r))` when a request is ready,
    /// `None` when the caller has to wait
    fn poll_state(&self) -> Option<Option<ConnectionRequest>> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Some(None);
        }
        let request = state.queue.pop_front()?;
        let more = !state.queue.is_empty();
        drop(state);
        if more {
            // Pass the wakeup on to another consumer.
            self.inner.available.notify_one();
        }
        Some(Some(request))
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionPool")
            .field("id", &self.inner.id)
            .field("len", &state.queue.len())
            .field("capacity", &self.inner.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::testing::{driver, flow};
    use crate::request::{Control, UdpRequest};
    use bytes::Bytes;
    use std::time::Duration;

    fn udp_request(port: u16) -> ConnectionRequest {
        let (handle, _control, _datagrams) = driver();
        UdpRequest::new(
            flow(&format!("10.0.0.2:{port}"), "10.0.0.1:53"),
            Bytes::new(),
            handle,
        )
        .into()
    }

    #[test]
    fn test_fifo_order() {
        let pool = ConnectionPool::new(8);
        for port in 1000..1003 {
            pool.add(udp_request(port)).unwrap();
        }
        assert_eq!(pool.len(), 3);

        let ports: Vec<u16> = std::iter::from_fn(|| pool.try_next())
            .map(|r| r.flow().source.port())
            .collect();
        assert_eq!(ports, vec![1000, 1001, 1002]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_add_after_close_fails() {
        let pool = ConnectionPool::new(8);
        pool.close();
        assert!(pool.closed());

        let err = pool.add(udp_request(1000)).unwrap_err();
        assert!(matches!(err.reason, StackError::PoolClosed));
        assert!(err.request.is_udp());
        assert!(pool.try_next().is_none());
    }

    #[test]
    fn test_close_returns_unclaimed() {
        let pool = ConnectionPool::new(8);
        pool.add(udp_request(1000)).unwrap();
        pool.add(udp_request(1001)).unwrap();

        let unclaimed = pool.close();
        assert_eq!(unclaimed.len(), 2);
        assert!(pool.close().is_empty());
        assert!(pool.try_next().is_none());
    }

    #[test]
    fn test_capacity_enforced() {
        let pool = ConnectionPool::new(1);
        pool.add(udp_request(1000)).unwrap();
        let err = pool.add(udp_request(1001)).unwrap_err();
        assert!(matches!(err.reason, StackError::PoolFull { capacity: 1 }));
    }

    #[test]
    fn test_rejected_request_is_released_when_dropped() {
        let (handle, mut control, _) = driver();
        let pool = ConnectionPool::new(1);
        pool.close();

        let request = UdpRequest::new(flow("10.0.0.2:1", "10.0.0.1:2"), Bytes::new(), handle);
        let (_, request) = pool.add(request.into()).unwrap_err().into_parts();
        drop(request);

        assert!(matches!(control.try_recv(), Ok(Control::UdpRelease { .. })));
    }

    #[tokio::test]
    async fn test_next_waits_for_add() {
        let pool = ConnectionPool::new(8);
        let consumer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.next().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.add(udp_request(4242)).unwrap();

        let request = consumer.await.unwrap().unwrap();
        assert_eq!(request.flow().source.port(), 4242);
    }

    #[tokio::test]
    async fn test_close_unblocks_consumers() {
        let pool = ConnectionPool::new(8);
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.next().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.close();

        for consumer in consumers {
            let result = tokio::time::timeout(Duration::from_secs(1), consumer)
                .await
                .unwrap()
                .unwrap();
            assert!(result.is_none());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_lose_nothing() {
        let pool = ConnectionPool::new(10_000);
        let producers: Vec<_> = (0..8u16)
            .map(|worker| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    for i in 0..100u16 {
                        pool.add(udp_request(worker * 1000 + i)).unwrap();
                    }
                })
            })
            .collect();

        let mut received = 0;
        while received < 800 {
            let next = tokio::time::timeout(Duration::from_secs(5), pool.next())
                .await
                .unwrap();
            assert!(next.is_some());
            received += 1;
        }
        for producer in producers {
            producer.await.unwrap();
        }
        assert!(pool.is_empty());
    }
}
