//! Integration tests for pivot-netstack
//!
//! Every test drives a real [`NetworkStack`] through an in-memory link: the
//! test plays the host on the far side of the interface, injecting raw IP
//! frames and reading what the stack writes back.
//!
//! # Test Organization
//!
//! - `forwarding`: flow classification, inflight cap, accept and terminate
//! - `pool`: pool replacement and closed pools
//! - `lifecycle`: construction failures and teardown
//!
//! # Test Requirements
//!
//! - Most tests need no privileges
//! - Tests marked with `#[ignore]` open a real TUN device (CAP_NET_ADMIN)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pivot_netstack::config::StackSettings;
use pivot_netstack::link::{MemoryLink, MemoryPeer};
use pivot_netstack::netstack::NetworkStack;
use pivot_netstack::packet::{build_tcp, build_udp, TcpFlags};
use pivot_netstack::pool::ConnectionPool;

pub mod forwarding;
pub mod lifecycle;
pub mod pool;

/// How long a test waits for the stack to react
pub const STEP: Duration = Duration::from_secs(2);

/// A running stack on a memory link
pub struct Harness {
    pub stack: NetworkStack,
    pub link: Arc<MemoryLink>,
    pub peer: MemoryPeer,
}

impl Harness {
    pub fn start(max_inflight: usize, pool: Option<ConnectionPool>) -> Self {
        let (link, peer) = MemoryLink::pair("pivot-test", 1500);
        let settings = StackSettings::new("pivot-test", max_inflight);
        let stack = NetworkStack::with_link(&settings, link.clone(), pool).unwrap();
        Self { stack, link, peer }
    }

    pub fn inject(&self, frame: Vec<u8>) {
        assert!(self.peer.inject(frame));
    }

    /// Next frame written by the stack
    pub async fn recv(&mut self) -> Vec<u8> {
        tokio::time::timeout(STEP, self.peer.recv())
            .await
            .expect("stack wrote nothing")
            .expect("link gone")
    }

    /// Assert the stack stays silent for a while
    pub async fn assert_silent(&mut self) {
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(self.peer.try_recv().is_none(), "unexpected frame from stack");
    }
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub fn syn(from: &str, to: &str, seq: u32) -> Vec<u8> {
    build_tcp(addr(from), addr(to), seq, 0, TcpFlags::SYN, 65_535, &[]).unwrap()
}

pub fn udp(from: &str, to: &str, payload: &[u8]) -> Vec<u8> {
    build_udp(addr(from), addr(to), payload).unwrap()
}

/// Poll `condition` until it holds or the step timeout passes
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + STEP;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
