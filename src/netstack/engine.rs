//! Packet engine wrapper
//!
//! Bundles the smoltcp interface, its socket set and the queue-backed device.
//! The driver holds the engine lock only for the duration of a poll or a
//! socket operation; nothing awaits while holding it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{HardwareAddress, IpListenEndpoint};
use tracing::{debug, warn};

use super::device::{FrameQueue, StackDevice};
use super::policy::STARTUP_POLICY;
use crate::error::StackError;
use crate::packet::wire_ip;

/// Maximum number of engine sockets (one per accepted TCP flow)
pub const MAX_SOCKETS: usize = 16 * 1024;

/// Idle time after which an unacknowledged TCP socket gives up
const TCP_TIMEOUT_SECS: u64 = 120;

/// Shared handle to the engine, as returned by
/// [`NetworkStack::current_stack`](super::NetworkStack::current_stack)
pub type EngineHandle = Arc<Mutex<Engine>>;

/// The smoltcp packet engine
pub struct Engine {
    iface: Interface,
    sockets: SocketSet<'static>,
    device: StackDevice,
    epoch: Instant,
}

impl Engine {
    /// Create the interface, apply the startup policy
    ///
    /// # Errors
    ///
    /// Returns `StackError::NicCreationFailed` if the policy cannot be applied.
    pub(crate) fn new(queue: Arc<FrameQueue>, mtu: usize) -> Result<Self, StackError> {
        let mut device = StackDevice::new(queue, mtu);
        let epoch = Instant::now();

        let config = Config::new(HardwareAddress::Ip);
        let mut iface = Interface::new(config, &mut device, SmoltcpInstant::from_millis(0));
        STARTUP_POLICY.apply(&mut iface)?;

        Ok(Self {
            iface,
            sockets: SocketSet::new(Vec::new()),
            device,
            epoch,
        })
    }

    /// Engine clock: monotonic, starting at zero when the engine was built
    #[must_use]
    pub fn now(&self) -> SmoltcpInstant {
        let micros = self.epoch.elapsed().as_micros();
        SmoltcpInstant::from_micros(i64::try_from(micros).unwrap_or(i64::MAX))
    }

    pub(crate) fn queue(&self) -> Arc<FrameQueue> {
        Arc::clone(self.device.queue())
    }

    #[must_use]
    pub fn interface(&self) -> &Interface {
        &self.iface
    }

    pub fn interface_mut(&mut self) -> &mut Interface {
        &mut self.iface
    }

    #[must_use]
    pub fn sockets(&self) -> &SocketSet<'static> {
        &self.sockets
    }

    pub fn sockets_mut(&mut self) -> &mut SocketSet<'static> {
        &mut self.sockets
    }

    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.sockets.iter().count()
    }

    /// Process queued frames and socket timers
    ///
    /// Returns `true` if any socket state changed.
    pub fn poll(&mut self) -> bool {
        let now = self.now();
        self.iface.poll(now, &mut self.device, &mut self.sockets)
    }

    /// How long the engine can wait before its next timer fires
    pub fn poll_delay(&mut self) -> Option<Duration> {
        let now = self.now();
        self.iface
            .poll_delay(now, &self.sockets)
            .map(|d| Duration::from_micros(d.total_micros()))
    }

    /// Create a TCP socket listening on `local`
    ///
    /// The socket answers exactly one SYN for `local`, which the caller
    /// replays right after.
    ///
    /// # Errors
    ///
    /// Fails when the socket set is full or the endpoint is unusable.
    pub(crate) fn listen_tcp(
        &mut self,
        local: SocketAddr,
        buffer_size: usize,
    ) -> Result<SocketHandle, StackError> {
        if self.socket_count() >= MAX_SOCKETS {
            warn!("Socket set full, cannot create new TCP socket");
            return Err(StackError::nic_creation("socket set full"));
        }

        let rx_buffer = SocketBuffer::new(vec![0u8; buffer_size]);
        let tx_buffer = SocketBuffer::new(vec![0u8; buffer_size]);
        let mut socket = TcpSocket::new(rx_buffer, tx_buffer);
        socket.set_nagle_enabled(false);
        socket.set_timeout(Some(smoltcp::time::Duration::from_secs(TCP_TIMEOUT_SECS)));
        socket
            .listen(IpListenEndpoint {
                addr: Some(wire_ip(local.ip())),
                port: local.port(),
            })
            .map_err(|e| StackError::nic_creation(format!("listen on {local}: {e:?}")))?;

        let handle = self.sockets.add(socket);
        debug!(%local, ?handle, "Created listening TCP socket");
        Ok(handle)
    }

    pub(crate) fn tcp_socket(&mut self, handle: SocketHandle) -> &mut TcpSocket<'static> {
        self.sockets.get_mut::<TcpSocket>(handle)
    }

    pub(crate) fn remove_socket(&mut self, handle: SocketHandle) {
        self.sockets.remove(handle);
    }

    /// Remove every socket and forget queued frames
    ///
    /// Returns how many sockets were released.
    pub(crate) fn release(&mut self) -> usize {
        let handles: Vec<SocketHandle> = self.sockets.iter().map(|(h, _)| h).collect();
        for handle in &handles {
            self.sockets.remove(*handle);
        }
        self.device.queue().clear();
        handles.len()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("sockets", &self.socket_count())
            .field("any_ip", &self.iface.any_ip())
            .finish_non_exhaustive()
    }
}
