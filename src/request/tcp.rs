//! TCP connection requests
//!
//! A [`TcpRequest`] holds the SYN that opened the flow plus a slot of the
//! stack's inflight cap. The handshake is not answered until a consumer
//! decides: [`TcpRequest::accept`] lets the engine complete it and yields a
//! [`TcpConnection`] byte stream, [`TcpRequest::terminate`] gives up on it.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit};
use tokio_util::sync::PollSender;
use tracing::{debug, trace};

use super::{next_request_id, Control, DriverHandle, FlowKey};
use crate::error::StackError;

/// Largest chunk a single write hands to the driver
const MAX_WRITE_CHUNK: usize = 16 * 1024;

/// A TCP flow waiting for accept or termination
pub struct TcpRequest {
    id: u64,
    flow: FlowKey,
    syn: Bytes,
    completed: AtomicBool,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    driver: DriverHandle,
}

impl TcpRequest {
    pub(crate) fn new(
        flow: FlowKey,
        syn: Bytes,
        permit: Option<OwnedSemaphorePermit>,
        driver: DriverHandle,
    ) -> Self {
        Self {
            id: next_request_id(),
            flow,
            syn,
            completed: AtomicBool::new(false),
            permit: Mutex::new(permit),
            driver,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn flow(&self) -> FlowKey {
        self.flow
    }

    /// The SYN frame that opened the flow
    #[must_use]
    pub fn syn(&self) -> &[u8] {
        &self.syn
    }

    /// Whether accept or terminate already ran
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Complete the handshake and return the connection's byte stream
    ///
    /// The engine answers the stored SYN once the driver processes the
    /// accept; the inflight slot is released immediately.
    ///
    /// # Errors
    ///
    /// Returns `StackError::RequestCompleted` if the request was already
    /// terminated and `StackError::StackStopped` if the stack is gone.
    pub fn accept(self) -> Result<TcpConnection, StackError> {
        if self.completed.swap(true, Ordering::AcqRel) {
            return Err(StackError::RequestCompleted);
        }
        self.release_permit();

        let depth = self.driver.stream_depth;
        let (to_consumer, inbound) = mpsc::channel(depth);
        let (outbound, from_consumer) = mpsc::channel(depth);

        let sent = self.driver.send(Control::TcpAccept {
            id: self.id,
            flow: self.flow,
            syn: self.syn.clone(),
            to_consumer,
            from_consumer,
        });
        if !sent {
            return Err(StackError::StackStopped);
        }

        debug!(id = self.id, flow = %self.flow, "TCP request accepted");
        Ok(TcpConnection::new(
            self.flow,
            inbound,
            outbound,
            Arc::clone(&self.driver.wake),
        ))
    }

    /// Complete the request without accepting it
    ///
    /// `reset = true` answers the SYN with a single RST; `reset = false`
    /// releases the flow without sending anything. Only the first call has
    /// any effect.
    pub fn terminate(&self, reset: bool) {
        if self.completed.swap(true, Ordering::AcqRel) {
            trace!(id = self.id, "TCP request already completed");
            return;
        }
        self.release_permit();

        let reset = reset.then(|| self.syn.clone());
        if !self.driver.send(Control::TcpFinish {
            id: self.id,
            flow: self.flow,
            reset,
        }) {
            trace!(id = self.id, "Driver gone, nothing to terminate");
        }
    }

    fn release_permit(&self) {
        self.permit.lock().take();
    }
}

impl Drop for TcpRequest {
    fn drop(&mut self) {
        if !self.is_completed() {
            self.terminate(false);
        }
    }
}

impl fmt::Debug for TcpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpRequest")
            .field("id", &self.id)
            .field("flow", &self.flow)
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}

/// Byte stream of an accepted TCP flow
///
/// Reads return data the peer sent into the interface; writes are queued for
/// the engine, which segments and retransmits them. EOF on read means the
/// peer closed its sending half. `shutdown` closes ours.
pub struct TcpConnection {
    flow: FlowKey,
    inbound: mpsc::Receiver<Bytes>,
    read_buf: Bytes,
    outbound: PollSender<Bytes>,
    wake: Arc<Notify>,
}

impl TcpConnection {
    fn new(
        flow: FlowKey,
        inbound: mpsc::Receiver<Bytes>,
        outbound: mpsc::Sender<Bytes>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            flow,
            inbound,
            read_buf: Bytes::new(),
            outbound: PollSender::new(outbound),
            wake,
        }
    }

    #[must_use]
    pub fn flow(&self) -> FlowKey {
        self.flow
    }

    /// Address of the host that opened the connection
    #[must_use]
    pub fn peer_addr(&self) -> std::net::SocketAddr {
        self.flow.source
    }

    /// Address the peer was connecting to
    #[must_use]
    pub fn original_destination(&self) -> std::net::SocketAddr {
        self.flow.destination
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("flow", &self.flow)
            .finish_non_exhaustive()
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed by stack")
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.read_buf.is_empty() {
            match this.inbound.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.read_buf = chunk;
                    // Room freed in the channel; let the driver drain the socket.
                    this.wake.notify_one();
                }
                // Peer finished sending
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = this.read_buf.len().min(buf.remaining());
        buf.put_slice(&this.read_buf[..n]);
        this.read_buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        match this.outbound.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len().min(MAX_WRITE_CHUNK);
                this.outbound
                    .send_item(Bytes::copy_from_slice(&buf[..n]))
                    .map_err(|_| closed())?;
                this.wake.notify_one();
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(closed())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Data is handed to the driver on write.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.outbound.close();
        self.wake.notify_one();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::testing::{driver, flow};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Semaphore;

    fn request(handle: DriverHandle, permit: Option<OwnedSemaphorePermit>) -> TcpRequest {
        TcpRequest::new(
            flow("10.0.0.2:40000", "10.1.1.1:443"),
            Bytes::from_static(b"syn"),
            permit,
            handle,
        )
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let (handle, mut control, _) = driver();
        let request = request(handle, None);

        request.terminate(true);
        request.terminate(true);
        request.terminate(false);
        drop(request);

        match control.try_recv() {
            Ok(Control::TcpFinish { reset, .. }) => assert!(reset.is_some()),
            _ => panic!("expected a single finish"),
        }
        assert!(control.try_recv().is_err());
    }

    #[test]
    fn test_drop_releases_silently() {
        let (handle, mut control, _) = driver();
        drop(request(handle, None));

        match control.try_recv() {
            Ok(Control::TcpFinish { reset, .. }) => assert!(reset.is_none()),
            _ => panic!("expected finish on drop"),
        }
    }

    #[test]
    fn test_terminate_returns_inflight_slot() {
        let (handle, _control, _) = driver();
        let slots = Arc::new(Semaphore::new(1));
        let permit = Arc::clone(&slots).try_acquire_owned().unwrap();
        let request = request(handle, Some(permit));

        assert_eq!(slots.available_permits(), 0);
        request.terminate(false);
        assert_eq!(slots.available_permits(), 1);
    }

    #[test]
    fn test_accept_after_terminate_fails() {
        let (handle, _control, _) = driver();
        let request = request(handle, None);
        request.terminate(false);
        assert!(matches!(request.accept(), Err(StackError::RequestCompleted)));
    }

    #[test]
    fn test_accept_without_driver() {
        let (handle, control, _) = driver();
        drop(control);
        let request = request(handle, None);
        assert!(matches!(request.accept(), Err(StackError::StackStopped)));
    }

    #[tokio::test]
    async fn test_connection_streams_through_driver_channels() {
        let (handle, mut control, _) = driver();
        let mut conn = request(handle, None).accept().unwrap();

        let Ok(Control::TcpAccept {
            to_consumer,
            mut from_consumer,
            ..
        }) = control.try_recv()
        else {
            panic!("expected accept");
        };

        to_consumer
            .send(Bytes::from_static(b"hello world"))
            .await
            .unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        conn.write_all(b"pong").await.unwrap();
        assert_eq!(from_consumer.recv().await.unwrap(), Bytes::from_static(b"pong"));

        conn.shutdown().await.unwrap();
        assert!(from_consumer.recv().await.is_none());

        drop(to_consumer);
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b" world");
    }
}
