//! Virtual interface abstraction
//!
//! A [`Link`] moves raw IP frames (no link-layer header) between the stack and
//! the operating system. Production uses a Linux TUN device; tests use the
//! in-memory [`MemoryLink`].
//!
//! # Link Provider Trait
//!
//! The stack only talks to `dyn Link`, so the driver, echo responder and
//! teardown logic are exercised identically against both implementations.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

mod memory;
#[cfg(target_os = "linux")]
mod tun;

pub use memory::{MemoryLink, MemoryPeer};
#[cfg(target_os = "linux")]
pub use tun::TunLink;

use crate::error::StackError;

/// A bidirectional raw IP frame channel
#[async_trait]
pub trait Link: Send + Sync {
    /// Interface name
    fn name(&self) -> &str;

    /// Maximum frame size the link accepts
    fn mtu(&self) -> usize;

    /// Receive one frame into `buf`, returning its length
    ///
    /// # Errors
    ///
    /// Fails once the link is closed or on an OS read error.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send one frame
    ///
    /// # Errors
    ///
    /// Fails once the link is closed or on an OS write error.
    async fn send(&self, frame: &[u8]) -> io::Result<()>;

    /// Release the underlying descriptor
    ///
    /// Only the first call does any work. Later calls return an error
    /// without touching the OS.
    ///
    /// # Errors
    ///
    /// Returns the OS error reported while releasing the descriptor, or an
    /// error when a pending read or write still holds it and the release
    /// happens only once that operation ends.
    fn close(&self) -> io::Result<()>;

    /// Whether [`Link::close`] has been called
    fn is_closed(&self) -> bool;
}

/// Open the OS virtual interface `name`
///
/// # Errors
///
/// Returns `StackError::InterfaceOpenFailed` if the device cannot be opened
/// or configured.
#[cfg(target_os = "linux")]
pub fn open_interface(name: &str, mtu: usize) -> Result<Arc<dyn Link>, StackError> {
    let link = TunLink::open(name, mtu).map_err(|e| StackError::interface_open(name, e))?;
    Ok(Arc::new(link))
}

/// Open the OS virtual interface `name`
///
/// # Errors
///
/// Always fails: TUN support is only implemented for Linux.
#[cfg(not(target_os = "linux"))]
pub fn open_interface(name: &str, _mtu: usize) -> Result<Arc<dyn Link>, StackError> {
    Err(StackError::interface_open(
        name,
        io::Error::new(
            io::ErrorKind::Unsupported,
            "TUN interfaces are only supported on Linux",
        ),
    ))
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "link is closed")
}
