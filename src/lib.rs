//! pivot-netstack: userspace network stack for traffic pivoting
//!
//! Terminates every TCP, UDP and ICMP echo flow routed into a virtual
//! interface, whatever its destination, and hands new flows to whichever
//! consumer currently services them.
//!
//! # Architecture
//!
//! ```text
//! TUN ─► NetworkStack ─► Forwarders ─► ConnectionPool ─► consumer (agent / DirectRelay)
//!             │
//!             └─► EchoResponder (ICMP echo, answered locally)
//! ```
//!
//! The first packet of an unknown flow becomes a [`ConnectionRequest`]. The
//! consumer claims it from the pool and accepts it (getting a byte stream or
//! datagram flow) or terminates it (optionally with a reset). Until then the
//! handshake stays unanswered, so the network sees a host that simply has
//! not replied yet.
//!
//! # Quick Start
//!
//! ```no_run
//! use pivot_netstack::config::StackSettings;
//! use pivot_netstack::netstack::NetworkStack;
//! use pivot_netstack::pool::ConnectionPool;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = ConnectionPool::new(1024);
//! let stack = NetworkStack::new(&StackSettings::new("pivot0", 64), Some(pool.clone()))?;
//!
//! while let Some(request) = pool.next().await {
//!     match request.into_tcp() {
//!         Ok(tcp) => tcp.terminate(true),
//!         Err(other) => drop(other),
//!     }
//! }
//!
//! stack.destroy().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`link`]: Virtual interface (TUN and in-memory)
//! - [`netstack`]: The stack, its engine and forwarders
//! - [`packet`]: Raw IP frame parsing and construction
//! - [`pool`]: Connection request queue
//! - [`relay`]: Local pool consumer
//! - [`request`]: Connection requests and accepted flows
//! - [`trust`]: Certificate revocation records

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod link;
pub mod netstack;
pub mod packet;
pub mod pool;
pub mod relay;
pub mod request;
pub mod trust;

// Re-export commonly used types at the crate root
pub use config::{Config, StackSettings};
pub use error::{AddError, ConfigError, StackError};
pub use link::{open_interface, Link, MemoryLink, MemoryPeer};
pub use netstack::{EngineHandle, NetworkStack, StatsSnapshot};
pub use pool::ConnectionPool;
pub use relay::DirectRelay;
pub use request::{
    ConnectionRequest, FlowKey, IcmpRequest, Protocol, TcpConnection, TcpRequest, UdpFlow,
    UdpRequest,
};
pub use trust::{Fingerprint, RevocationList, RevokedCertificate};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
