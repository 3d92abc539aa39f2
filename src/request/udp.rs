//! UDP connection requests

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use super::{next_request_id, Control, Datagram, DriverHandle, FlowKey};
use crate::error::StackError;

/// A UDP flow waiting for a consumer
///
/// Carries the datagram that opened the flow. Datagrams arriving for the
/// same flow before it is accepted are dropped.
pub struct UdpRequest {
    id: u64,
    flow: FlowKey,
    first: Bytes,
    completed: AtomicBool,
    driver: DriverHandle,
}

impl UdpRequest {
    pub(crate) fn new(flow: FlowKey, first: Bytes, driver: DriverHandle) -> Self {
        Self {
            id: next_request_id(),
            flow,
            first,
            completed: AtomicBool::new(false),
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

    /// Payload of the datagram that opened the flow
    #[must_use]
    pub fn first_datagram(&self) -> &[u8] {
        &self.first
    }

    /// Start receiving the flow's datagrams
    ///
    /// The opening datagram is the first one returned by [`UdpFlow::recv`].
    ///
    /// # Errors
    ///
    /// Returns `StackError::RequestCompleted` if the request was released and
    /// `StackError::StackStopped` if the stack is gone.
    pub fn accept(self) -> Result<UdpFlow, StackError> {
        if self.completed.swap(true, Ordering::AcqRel) {
            return Err(StackError::RequestCompleted);
        }

        let (to_consumer, inbound) = mpsc::channel(self.driver.datagram_depth.max(1));
        // Fresh channel with room for at least one item.
        let _ = to_consumer.try_send(self.first.clone());

        if !self.driver.send(Control::UdpAccept {
            id: self.id,
            flow: self.flow,
            to_consumer,
        }) {
            return Err(StackError::StackStopped);
        }

        debug!(id = self.id, flow = %self.flow, "UDP request accepted");
        Ok(UdpFlow {
            flow: self.flow,
            inbound,
            outbound: self.driver.datagrams.clone(),
        })
    }

    /// Drop the flow; a later datagram opens a new request
    pub fn release(&self) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.driver.send(Control::UdpRelease {
            id: self.id,
            flow: self.flow,
        });
    }
}

impl Drop for UdpRequest {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for UdpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpRequest")
            .field("id", &self.id)
            .field("flow", &self.flow)
            .field("first_len", &self.first.len())
            .finish_non_exhaustive()
    }
}

/// Datagram interface of an accepted UDP flow
pub struct UdpFlow {
    flow: FlowKey,
    inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<Datagram>,
}

impl UdpFlow {
    #[must_use]
    pub fn flow(&self) -> FlowKey {
        self.flow
    }

    /// Next datagram sent by the flow's source
    ///
    /// Returns `None` once the stack forgets the flow (idle timeout or
    /// teardown).
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Send a datagram back to the flow's source, appearing to come from the
    /// original destination
    ///
    /// # Errors
    ///
    /// Returns `StackError::StackStopped` if the stack is gone.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), StackError> {
        self.outbound
            .send(Datagram {
                flow: self.flow,
                payload: payload.into(),
            })
            .await
            .map_err(|_| StackError::StackStopped)
    }
}

impl fmt::Debug for UdpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpFlow")
            .field("flow", &self.flow)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::testing::{driver, flow};

    #[tokio::test]
    async fn test_accept_delivers_first_datagram() {
        let (handle, mut control, mut datagrams) = driver();
        let request = UdpRequest::new(
            flow("10.0.0.2:5353", "10.0.0.1:53"),
            Bytes::from_static(b"query"),
            handle,
        );

        let mut udp = request.accept().unwrap();
        assert_eq!(udp.recv().await.unwrap(), Bytes::from_static(b"query"));

        let Ok(Control::UdpAccept { to_consumer, .. }) = control.try_recv() else {
            panic!("expected accept");
        };
        to_consumer.send(Bytes::from_static(b"again")).await.unwrap();
        assert_eq!(udp.recv().await.unwrap(), Bytes::from_static(b"again"));

        udp.send(&b"answer"[..]).await.unwrap();
        let datagram = datagrams.recv().await.unwrap();
        assert_eq!(datagram.payload, Bytes::from_static(b"answer"));
        assert_eq!(datagram.flow, udp.flow());

        drop(to_consumer);
        assert!(udp.recv().await.is_none());
        assert!(control.try_recv().is_err(), "accepted request sends no release");
    }

    #[test]
    fn test_release_once() {
        let (handle, mut control, _) = driver();
        let request = UdpRequest::new(
            flow("10.0.0.2:1000", "10.0.0.1:2000"),
            Bytes::new(),
            handle,
        );
        request.release();
        request.release();
        drop(request);

        assert!(matches!(control.try_recv(), Ok(Control::UdpRelease { .. })));
        assert!(control.try_recv().is_err());
    }
}
