//! Userspace network stack
//!
//! A [`NetworkStack`] sits behind a virtual interface and terminates every
//! flow arriving on it, whatever the destination address. The first packet of
//! each new TCP or UDP flow becomes a
//! [`ConnectionRequest`](crate::request::ConnectionRequest) in the active
//! [`ConnectionPool`]; ICMP echo is answered locally.
//!
//! # Architecture
//!
//! ```text
//! Link ──► Driver ──► classify ──┬─► TcpForwarder ──► PoolSlot ──► ConnectionPool
//!   ▲        │                   ├─► UdpForwarder ──┘
//!   │        │                   ├─► EchoResponder ──► Link
//!   │        ▼                   └─► Engine (smoltcp, accepted flows)
//!   └──── Engine tx queue
//! ```
//!
//! # Lifecycle
//!
//! Construction either returns a fully running stack or an error; any
//! descriptor acquired along the way is released first. [`NetworkStack::destroy`]
//! stops the tasks, closes the link once and releases every engine socket.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

pub mod device;
mod driver;
mod echo;
pub mod engine;
mod forwarder;
mod nat;
pub mod policy;
pub mod stats;

pub use device::{FrameQueue, StackDevice};
pub use echo::ECHO_QUEUE_DEPTH;
pub use engine::{Engine, EngineHandle, MAX_SOCKETS};
pub use policy::{StartupPolicy, STARTUP_POLICY};
pub use stats::{StackStats, StatsSnapshot};

use crate::config::StackSettings;
use crate::error::StackError;
use crate::link::{open_interface, Link};
use crate::pool::ConnectionPool;
use crate::request::DriverHandle;
use driver::{Driver, DriverChannels, DriverTask};
use echo::EchoResponder;
use forwarder::{PoolSlot, TcpForwarder, UdpForwarder};

/// Chunks buffered in each direction of an accepted TCP flow
const STREAM_DEPTH: usize = 64;

/// Tasks and descriptor owned by a running stack
struct Running {
    link: Arc<dyn Link>,
    echo: EchoResponder,
    driver: DriverTask,
}

/// A running userspace network stack bound to one virtual interface
pub struct NetworkStack {
    name: String,
    engine: EngineHandle,
    slot: Arc<PoolSlot>,
    stats: Arc<StackStats>,
    running: Mutex<Option<Running>>,
}

impl NetworkStack {
    /// Open the interface named in `settings` and start the stack on it
    ///
    /// `pool` is the initial destination for connection requests; with
    /// `None`, new flows are dropped until [`replace_pool`](Self::replace_pool)
    /// installs one. Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - `StackError::Config` if `settings` are invalid
    /// - `StackError::InterfaceOpenFailed` if the interface cannot be opened
    /// - `StackError::NicCreationFailed` if the engine cannot be set up; the
    ///   interface is closed again before returning
    pub fn new(settings: &StackSettings, pool: Option<ConnectionPool>) -> Result<Self, StackError> {
        settings.validate()?;
        let link = open_interface(&settings.interface_name, settings.mtu)?;
        Self::with_link(settings, link, pool)
    }

    /// Start the stack on an already opened link
    ///
    /// On failure the link is closed before the error is returned.
    ///
    /// # Errors
    ///
    /// Same as [`NetworkStack::new`], minus the interface open.
    pub fn with_link(
        settings: &StackSettings,
        link: Arc<dyn Link>,
        pool: Option<ConnectionPool>,
    ) -> Result<Self, StackError> {
        let engine = match settings
            .validate()
            .map_err(StackError::from)
            .and_then(|()| Engine::new(FrameQueue::new(), settings.mtu))
        {
            Ok(engine) => Arc::new(Mutex::new(engine)),
            Err(e) => {
                if let Err(close_err) = link.close() {
                    warn!(interface = link.name(), error = %close_err, "Failed to close link after construction error");
                }
                return Err(e);
            }
        };

        let stats = Arc::new(StackStats::new());
        let slot = Arc::new(PoolSlot::new(pool));

        let (control, control_rx) = mpsc::unbounded_channel();
        let (datagrams, datagram_rx) = mpsc::channel(settings.udp_queue_depth);
        let wake = Arc::new(Notify::new());
        let handle = DriverHandle {
            control,
            datagrams,
            wake: Arc::clone(&wake),
            stream_depth: STREAM_DEPTH,
            datagram_depth: settings.udp_queue_depth,
        };

        let tcp = TcpForwarder::new(
            Arc::clone(&slot),
            settings.max_inflight,
            handle.clone(),
            Arc::clone(&stats),
        );
        let udp = UdpForwarder::new(
            Arc::clone(&slot),
            settings.udp_idle_timeout(),
            handle,
            Arc::clone(&stats),
        );

        let (echo_tx, echo_rx) = mpsc::channel(ECHO_QUEUE_DEPTH);
        let echo = EchoResponder::spawn(
            Arc::clone(&link),
            echo_rx,
            settings.echo_rate_limit,
            Arc::clone(&stats),
        );

        let driver = Driver::new(
            Arc::clone(&link),
            Arc::clone(&engine),
            tcp,
            udp,
            DriverChannels {
                control_rx,
                datagram_rx,
                wake,
                echo_tx,
            },
            Arc::clone(&stats),
            settings.tcp_buffer_size,
        )
        .spawn();

        let name = link.name().to_string();
        info!(
            interface = %name,
            max_inflight = settings.max_inflight,
            mtu = settings.mtu,
            "Network stack started"
        );

        Ok(Self {
            name,
            engine,
            slot,
            stats,
            running: Mutex::new(Some(Running { link, echo, driver })),
        })
    }

    /// Interface name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The packet engine, for advanced configuration
    ///
    /// Hold the lock briefly: the driver needs it for every packet.
    #[must_use]
    pub fn current_stack(&self) -> EngineHandle {
        Arc::clone(&self.engine)
    }

    /// Make `pool` the destination for new connection requests
    ///
    /// Returns the previous pool. Requests already queued there stay there;
    /// every request added after this call goes to `pool`.
    pub fn replace_pool(&self, pool: ConnectionPool) -> Option<ConnectionPool> {
        let previous = self.slot.replace(Some(pool));
        debug!(interface = %self.name, "Connection pool replaced");
        previous
    }

    /// Stop queuing new flows; they are dropped until a pool is set again
    pub fn clear_pool(&self) -> Option<ConnectionPool> {
        self.slot.replace(None)
    }

    /// The pool new requests currently go to
    #[must_use]
    pub fn current_pool(&self) -> Option<ConnectionPool> {
        self.slot.current()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether [`destroy`](Self::destroy) has run
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.running.lock().is_none()
    }

    /// Stop the stack and release the interface
    ///
    /// Tasks are stopped before the descriptor is closed, so nothing touches
    /// the link afterwards. Only the first call acts; later calls return
    /// `Ok(())`. The stack is unusable after the first call whatever its
    /// result.
    ///
    /// # Errors
    ///
    /// Returns `StackError::DestroyFailure` if closing the descriptor fails.
    pub async fn destroy(&self) -> Result<(), StackError> {
        let Some(running) = self.running.lock().take() else {
            debug!(interface = %self.name, "Stack already destroyed");
            return Ok(());
        };

        running.echo.stop().await;
        running.driver.stop().await;

        let closed = running.link.close();
        let released = self.engine.lock().release();
        info!(interface = %self.name, released, "Network stack destroyed");

        closed.map_err(|e| {
            warn!(interface = %self.name, error = %e, "Failed to close interface");
            StackError::DestroyFailure(e)
        })
    }
}

impl Drop for NetworkStack {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            // No runtime to await on here: abort the tasks and close the link.
            running.echo.abort();
            running.driver.abort();
            if let Err(e) = running.link.close() {
                debug!(interface = %self.name, error = %e, "Failed to close interface on drop");
            }
            self.engine.lock().release();
        }
    }
}

impl fmt::Debug for NetworkStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkStack")
            .field("name", &self.name)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryLink;

    fn settings() -> StackSettings {
        StackSettings::new("mem0", 8)
    }

    #[tokio::test]
    async fn test_invalid_settings_close_link() {
        let (link, _peer) = MemoryLink::pair("mem0", 1500);
        let mut bad = settings();
        bad.mtu = 100;

        let err = NetworkStack::with_link(&bad, link.clone(), None).unwrap_err();
        assert!(matches!(err, StackError::Config(_)));
        assert_eq!(link.close_calls(), 1);
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (link, _peer) = MemoryLink::pair("mem0", 1500);
        let stack = NetworkStack::with_link(&settings(), link.clone(), None).unwrap();

        stack.destroy().await.unwrap();
        stack.destroy().await.unwrap();
        assert!(stack.is_destroyed());
        assert_eq!(link.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_replace_pool_returns_previous() {
        let (link, _peer) = MemoryLink::pair("mem0", 1500);
        let first = ConnectionPool::new(4);
        let stack = NetworkStack::with_link(&settings(), link, Some(first.clone())).unwrap();

        let second = ConnectionPool::new(4);
        let previous = stack.replace_pool(second.clone()).unwrap();
        assert!(previous.same_pool(&first));
        assert!(stack.current_pool().unwrap().same_pool(&second));

        assert!(stack.clear_pool().is_some());
        assert!(stack.current_pool().is_none());
        stack.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_current_stack_exposes_engine() {
        let (link, _peer) = MemoryLink::pair("mem0", 1500);
        let stack = NetworkStack::with_link(&settings(), link, None).unwrap();

        let engine = stack.current_stack();
        assert!(engine.lock().interface().any_ip());
        stack.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_closes_link() {
        let (link, _peer) = MemoryLink::pair("mem0", 1500);
        let stack = NetworkStack::with_link(&settings(), link.clone(), None).unwrap();
        drop(stack);
        assert_eq!(link.close_calls(), 1);
    }
}
