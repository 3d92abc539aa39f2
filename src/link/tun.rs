//! Linux TUN device
//!
//! Opens `/dev/net/tun` in `IFF_TUN | IFF_NO_PI` mode so every read and write
//! is exactly one IP packet, and registers the non-blocking descriptor with
//! the tokio reactor.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, warn};

use super::{closed_error, Link};
use crate::config::MAX_INTERFACE_NAME_LEN;

/// Path of the TUN clone device
const TUN_CLONE_DEVICE: &str = "/dev/net/tun";

/// `_IOW('T', 202, int)`
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

/// Layout of `struct ifreq` as used by `TUNSETIFF`
#[repr(C)]
struct TunIfReq {
    name: [u8; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// A TUN interface registered with the tokio reactor
pub struct TunLink {
    name: String,
    mtu: usize,
    fd: RwLock<Option<Arc<AsyncFd<File>>>>,
}

impl TunLink {
    /// Open (or attach to) the TUN interface `name`
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the clone device cannot be opened, the name is
    /// invalid, or the `TUNSETIFF` ioctl fails (usually missing `CAP_NET_ADMIN`).
    pub fn open(name: &str, mtu: usize) -> io::Result<Self> {
        if name.is_empty() || name.len() > MAX_INTERFACE_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid interface name: {name:?}"),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(TUN_CLONE_DEVICE)?;

        let mut req = TunIfReq {
            name: [0; libc::IFNAMSIZ],
            flags: (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short,
            _pad: [0; 22],
        };
        req.name[..name.len()].copy_from_slice(name.as_bytes());

        // SAFETY: `req` is a properly sized ifreq and outlives the call.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &raw mut req) };
        if ret < 0 {
            // `file` is dropped here, so nothing stays open on failure.
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `file` owns an open descriptor and the `AsyncFd` owns `file`
        // until `close` takes it back out with `into_inner`.
        let fd = unsafe { AsyncFd::register(file) }.map_err(io::Error::from)?;
        info!(interface = name, mtu, "TUN interface opened");

        Ok(Self {
            name: name.to_string(),
            mtu,
            fd: RwLock::new(Some(Arc::new(fd))),
        })
    }

    fn handle(&self) -> io::Result<Arc<AsyncFd<File>>> {
        self.fd.read().clone().ok_or_else(closed_error)
    }
}

impl std::fmt::Debug for TunLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunLink")
            .field("name", &self.name)
            .field("mtu", &self.mtu)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Link for TunLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.handle()?;
        loop {
            let mut guard = fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&self, frame: &[u8]) -> io::Result<()> {
        let fd = self.handle()?;
        loop {
            let mut guard = fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write(frame)) {
                Ok(result) => {
                    let written = result?;
                    if written != frame.len() {
                        debug!(written, len = frame.len(), "Short TUN write");
                    }
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        let Some(fd) = self.fd.write().take() else {
            return Err(closed_error());
        };
        release_descriptor(&self.name, fd)
    }

    fn is_closed(&self) -> bool {
        self.fd.read().is_none()
    }
}

/// Close a registered descriptor if this is its last reference
///
/// When another task still holds the descriptor it is closed once that
/// reference is dropped, and the deferred close is reported as an error so
/// the caller does not assume the interface name is free again.
fn release_descriptor<T: AsRawFd + IntoRawFd>(name: &str, fd: Arc<AsyncFd<T>>) -> io::Result<()> {
    match Arc::try_unwrap(fd) {
        Ok(fd) => {
            let raw = fd.into_inner().into_raw_fd();
            // SAFETY: `raw` was just released from its owner.
            let ret = unsafe { libc::close(raw) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            info!(interface = name, "TUN interface closed");
            Ok(())
        }
        Err(shared) => {
            let holders = Arc::strong_count(&shared) - 1;
            warn!(interface = name, holders, "TUN descriptor still in use, close deferred");
            drop(shared);
            Err(io::Error::other(format!(
                "{name}: descriptor still in use by {holders} holder(s), close deferred"
            )))
        }
    }
}
