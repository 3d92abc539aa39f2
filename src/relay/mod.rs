//! Direct relay
//!
//! Services connection requests from the local host: each TCP request is
//! dialed directly and, on success, accepted and spliced to the outbound
//! socket; each UDP request gets a connected socket. This is the consumer
//! used when operator and stack run on the same machine, and in tests.
//!
//! A destination that cannot be reached is refused with a reset, which is
//! what the original sender would have seen from the real host.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::RelayConfig;
use crate::pool::ConnectionPool;
use crate::request::{ConnectionRequest, TcpRequest, UdpRequest};

/// Largest datagram read from an outbound UDP socket
const MAX_DATAGRAM: usize = 65_535;

/// Relay counters
#[derive(Debug, Default)]
pub struct RelayStats {
    tcp_relayed: AtomicU64,
    udp_relayed: AtomicU64,
    dial_failures: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatsSnapshot {
    pub tcp_relayed: u64,
    pub udp_relayed: u64,
    pub dial_failures: u64,
    /// Bytes sent towards destinations
    pub bytes_up: u64,
    /// Bytes returned to flow sources
    pub bytes_down: u64,
}

impl RelayStats {
    #[must_use]
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            tcp_relayed: self.tcp_relayed.load(Ordering::Relaxed),
            udp_relayed: self.udp_relayed.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }
}

/// Pool consumer that performs socket I/O from the local host
#[derive(Debug, Clone)]
pub struct DirectRelay {
    config: RelayConfig,
    stats: Arc<RelayStats>,
}

impl DirectRelay {
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            stats: Arc::new(RelayStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Drain `pool` until it is closed, one task per request
    pub async fn run(&self, pool: ConnectionPool) {
        info!(pool = pool.id(), "Direct relay started");
        while let Some(request) = pool.next().await {
            let relay = self.clone();
            tokio::spawn(async move { relay.handle(request).await });
        }
        info!(pool = pool.id(), "Pool closed, direct relay stopped");
    }

    /// Service a single request to completion
    pub async fn handle(&self, request: ConnectionRequest) {
        match request {
            ConnectionRequest::Tcp(request) => self.relay_tcp(request).await,
            ConnectionRequest::Udp(request) => self.relay_udp(request).await,
            // Echo is answered by the stack itself.
            ConnectionRequest::Icmp(request) => request.discard(),
        }
    }

    async fn relay_tcp(&self, request: TcpRequest) {
        let flow = request.flow();
        let connect_timeout = self.config.connect_timeout();

        let upstream = match timeout(connect_timeout, TcpStream::connect(flow.destination)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                debug!(%flow, error = %e, "Dial failed, refusing flow");
                request.terminate(true);
                return;
            }
            Err(_) => {
                self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                debug!(%flow, timeout_secs = connect_timeout.as_secs(), "Dial timed out, refusing flow");
                request.terminate(true);
                return;
            }
        };
        if let Err(e) = upstream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let mut conn = match request.accept() {
            Ok(conn) => conn,
            Err(e) => {
                debug!(%flow, error = %e, "Accept failed");
                return;
            }
        };
        self.stats.tcp_relayed.fetch_add(1, Ordering::Relaxed);

        let mut upstream = upstream;
        match tokio::io::copy_bidirectional(&mut conn, &mut upstream).await {
            Ok((up, down)) => {
                self.stats.bytes_up.fetch_add(up, Ordering::Relaxed);
                self.stats.bytes_down.fetch_add(down, Ordering::Relaxed);
                debug!(%flow, up, down, "TCP relay finished");
            }
            Err(e) => debug!(%flow, error = %e, "TCP relay ended with error"),
        }
    }

    async fn relay_udp(&self, request: UdpRequest) {
        let flow = request.flow();
        let socket = match connect_udp(flow.destination).await {
            Ok(socket) => socket,
            Err(e) => {
                self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                debug!(%flow, error = %e, "UDP socket setup failed");
                return;
            }
        };

        let mut udp = match request.accept() {
            Ok(udp) => udp,
            Err(e) => {
                debug!(%flow, error = %e, "Accept failed");
                return;
            }
        };
        self.stats.udp_relayed.fetch_add(1, Ordering::Relaxed);

        let idle = self.config.udp_idle_timeout();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                datagram = udp.recv() => {
                    let Some(datagram) = datagram else {
                        trace!(%flow, "Stack forgot UDP flow");
                        break;
                    };
                    if let Err(e) = socket.send(&datagram).await {
                        debug!(%flow, error = %e, "UDP send failed");
                        break;
                    }
                    self.stats.bytes_up.fetch_add(datagram.len() as u64, Ordering::Relaxed);
                }
                received = socket.recv(&mut buf) => {
                    let n = match received {
                        Ok(n) => n,
                        Err(e) => {
                            debug!(%flow, error = %e, "UDP receive failed");
                            break;
                        }
                    };
                    if udp.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                    self.stats.bytes_down.fetch_add(n as u64, Ordering::Relaxed);
                }
                () = tokio::time::sleep(idle) => {
                    trace!(%flow, "UDP relay idle");
                    break;
                }
            }
        }
        debug!(%flow, "UDP relay finished");
    }
}

async fn connect_udp(destination: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = match destination {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(destination).await?;
    Ok(socket)
}

impl Default for DirectRelay {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}
