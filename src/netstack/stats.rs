//! Network stack statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic counters updated by the driver and the echo responder
#[derive(Debug, Default)]
pub struct StackStats {
    /// Frames read from the link
    frames_in: AtomicU64,
    /// Frames written to the link
    frames_out: AtomicU64,
    /// TCP requests handed to a pool
    tcp_requests: AtomicU64,
    /// UDP requests handed to a pool
    udp_requests: AtomicU64,
    /// New flows dropped because no pool was set
    dropped_no_pool: AtomicU64,
    /// New flows dropped because the pool was closed
    dropped_pool_closed: AtomicU64,
    /// New flows dropped because the pool was full
    dropped_pool_full: AtomicU64,
    /// SYNs dropped because the inflight cap was reached
    dropped_inflight: AtomicU64,
    /// Datagrams dropped because a flow's consumer fell behind
    dropped_datagrams: AtomicU64,
    /// RSTs sent for terminated requests
    resets_sent: AtomicU64,
    /// TCP flows bound to engine sockets
    tcp_accepted: AtomicU64,
    /// ICMP echo replies sent
    echo_replies: AtomicU64,
    /// ICMP echo requests ignored by the rate limiter
    echo_rate_limited: AtomicU64,
}

/// Point-in-time copy of [`StackStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub tcp_requests: u64,
    pub udp_requests: u64,
    pub dropped_no_pool: u64,
    pub dropped_pool_closed: u64,
    pub dropped_pool_full: u64,
    pub dropped_inflight: u64,
    pub dropped_datagrams: u64,
    pub resets_sent: u64,
    pub tcp_accepted: u64,
    pub echo_replies: u64,
    pub echo_rate_limited: u64,
}

impl StackStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame_in(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_out(&self) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_request(&self) {
        self.tcp_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_request(&self) {
        self.udp_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_no_pool(&self) {
        self.dropped_no_pool.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_pool_closed(&self) {
        self.dropped_pool_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_pool_full(&self) {
        self.dropped_pool_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_inflight(&self) {
        self.dropped_inflight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_datagram(&self) {
        self.dropped_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_accepted(&self) {
        self.tcp_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_echo_reply(&self) {
        self.echo_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_echo_rate_limited(&self) {
        self.echo_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            tcp_requests: self.tcp_requests.load(Ordering::Relaxed),
            udp_requests: self.udp_requests.load(Ordering::Relaxed),
            dropped_no_pool: self.dropped_no_pool.load(Ordering::Relaxed),
            dropped_pool_closed: self.dropped_pool_closed.load(Ordering::Relaxed),
            dropped_pool_full: self.dropped_pool_full.load(Ordering::Relaxed),
            dropped_inflight: self.dropped_inflight.load(Ordering::Relaxed),
            dropped_datagrams: self.dropped_datagrams.load(Ordering::Relaxed),
            resets_sent: self.resets_sent.load(Ordering::Relaxed),
            tcp_accepted: self.tcp_accepted.load(Ordering::Relaxed),
            echo_replies: self.echo_replies.load(Ordering::Relaxed),
            echo_rate_limited: self.echo_rate_limited.load(Ordering::Relaxed),
        }
    }
}
