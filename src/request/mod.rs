//! Connection requests
//!
//! A [`ConnectionRequest`] is created by a forwarder on the first packet of a
//! flow the stack has not seen before. It sits in a
//! [`ConnectionPool`](crate::pool::ConnectionPool) until a consumer claims it
//! and decides to accept or reject the flow.
//!
//! Every variant owns its transport state: dropping a request that was never
//! completed releases that state in the driver, so nothing is leaked when a
//! request is discarded or a pool is closed.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};

mod icmp;
mod tcp;
mod udp;

pub use icmp::IcmpRequest;
pub use tcp::{TcpConnection, TcpRequest};
pub use udp::{UdpFlow, UdpRequest};

/// Global counter for request IDs
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Icmp => write!(f, "icmp"),
        }
    }
}

/// Endpoint pair identifying a flow
///
/// `source` is the host that sent the first packet into the interface,
/// `destination` is where it was trying to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

impl FlowKey {
    #[must_use]
    pub const fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Flow key for ICMP, which has no ports
    #[must_use]
    pub const fn icmp(source: IpAddr, destination: IpAddr) -> Self {
        Self::new(
            SocketAddr::new(source, 0),
            SocketAddr::new(destination, 0),
        )
    }

    /// The same flow seen from the other end
    #[must_use]
    pub const fn reversed(&self) -> Self {
        Self::new(self.destination, self.source)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

/// A pending flow awaiting a decision from a consumer
#[derive(Debug)]
pub enum ConnectionRequest {
    Tcp(TcpRequest),
    Udp(UdpRequest),
    Icmp(IcmpRequest),
}

impl ConnectionRequest {
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Tcp(_) => Protocol::Tcp,
            Self::Udp(_) => Protocol::Udp,
            Self::Icmp(_) => Protocol::Icmp,
        }
    }

    #[must_use]
    pub fn flow(&self) -> FlowKey {
        match self {
            Self::Tcp(r) => r.flow(),
            Self::Udp(r) => r.flow(),
            Self::Icmp(r) => r.flow(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        match self {
            Self::Tcp(r) => r.id(),
            Self::Udp(r) => r.id(),
            Self::Icmp(r) => r.id(),
        }
    }

    #[must_use]
    pub const fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp(_))
    }

    #[must_use]
    pub const fn is_udp(&self) -> bool {
        matches!(self, Self::Udp(_))
    }

    #[must_use]
    pub const fn is_icmp(&self) -> bool {
        matches!(self, Self::Icmp(_))
    }

    #[must_use]
    pub const fn as_tcp(&self) -> Option<&TcpRequest> {
        match self {
            Self::Tcp(r) => Some(r),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_udp(&self) -> Option<&UdpRequest> {
        match self {
            Self::Udp(r) => Some(r),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_icmp(&self) -> Option<&IcmpRequest> {
        match self {
            Self::Icmp(r) => Some(r),
            _ => None,
        }
    }

    /// Take the TCP request, or get `self` back for any other protocol
    pub fn into_tcp(self) -> Result<TcpRequest, Self> {
        match self {
            Self::Tcp(r) => Ok(r),
            other => Err(other),
        }
    }

    /// Take the UDP request, or get `self` back for any other protocol
    pub fn into_udp(self) -> Result<UdpRequest, Self> {
        match self {
            Self::Udp(r) => Ok(r),
            other => Err(other),
        }
    }

    /// Take the ICMP request, or get `self` back for any other protocol
    pub fn into_icmp(self) -> Result<IcmpRequest, Self> {
        match self {
            Self::Icmp(r) => Ok(r),
            other => Err(other),
        }
    }

    /// Complete the request without accepting it
    ///
    /// For TCP, `reset` sends a RST to the originating peer. UDP requests are
    /// released. ICMP requests need no termination. Idempotent.
    pub fn terminate(&self, reset: bool) {
        match self {
            Self::Tcp(r) => r.terminate(reset),
            Self::Udp(r) => r.release(),
            Self::Icmp(_) => {}
        }
    }
}

impl From<TcpRequest> for ConnectionRequest {
    fn from(request: TcpRequest) -> Self {
        Self::Tcp(request)
    }
}

impl From<UdpRequest> for ConnectionRequest {
    fn from(request: UdpRequest) -> Self {
        Self::Udp(request)
    }
}

impl From<IcmpRequest> for ConnectionRequest {
    fn from(request: IcmpRequest) -> Self {
        Self::Icmp(request)
    }
}

// =============================================================================
// Driver plumbing
// =============================================================================

/// Messages from requests and flows to the stack driver
pub(crate) enum Control {
    /// Bind an engine socket to the flow and replay its SYN
    TcpAccept {
        id: u64,
        flow: FlowKey,
        syn: Bytes,
        to_consumer: mpsc::Sender<Bytes>,
        from_consumer: mpsc::Receiver<Bytes>,
    },
    /// Forget a pending TCP flow, optionally refusing it with this SYN's RST
    TcpFinish {
        id: u64,
        flow: FlowKey,
        reset: Option<Bytes>,
    },
    /// Start delivering datagrams of the flow to the consumer
    UdpAccept {
        id: u64,
        flow: FlowKey,
        to_consumer: mpsc::Sender<Bytes>,
    },
    /// Forget a pending UDP flow
    UdpRelease { id: u64, flow: FlowKey },
}

/// A datagram a consumer sends back to the flow's source
pub(crate) struct Datagram {
    pub flow: FlowKey,
    pub payload: Bytes,
}

/// Channels requests use to reach the driver
#[derive(Clone)]
pub(crate) struct DriverHandle {
    pub control: mpsc::UnboundedSender<Control>,
    pub datagrams: mpsc::Sender<Datagram>,
    pub wake: Arc<Notify>,
    pub stream_depth: usize,
    pub datagram_depth: usize,
}

impl DriverHandle {
    /// Returns `false` once the driver is gone
    pub fn send(&self, control: Control) -> bool {
        self.control.send(control).is_ok()
    }
}
