//! ICMP echo requests
//!
//! Echo traffic never crosses the tunnel: the echo responder wraps each
//! request in an [`IcmpRequest`] and answers it on the local link.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;

use super::{next_request_id, FlowKey};
use crate::link::Link;
use crate::packet::build_echo_reply;

/// An ICMP echo request frame plus the link to answer it on
pub struct IcmpRequest {
    id: u64,
    flow: FlowKey,
    frame: Bytes,
    link: Arc<dyn Link>,
}

impl IcmpRequest {
    pub(crate) fn new(flow: FlowKey, frame: Bytes, link: Arc<dyn Link>) -> Self {
        Self {
            id: next_request_id(),
            flow,
            frame,
            link,
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

    /// The raw echo request
    #[must_use]
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    /// Synthesize the echo reply and write it to the link
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if the frame is not an echo request, or the
    /// link's write error.
    pub async fn reply(self) -> io::Result<()> {
        let reply = build_echo_reply(&self.frame).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "not an ICMP echo request")
        })?;
        self.link.send(&reply).await
    }

    /// Drop the request without answering
    pub fn discard(self) {}
}

impl fmt::Debug for IcmpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IcmpRequest")
            .field("id", &self.id)
            .field("flow", &self.flow)
            .field("len", &self.frame.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryLink;
    use crate::packet::{build_echo_request, classify, Segment};

    #[tokio::test]
    async fn test_reply_written_to_link() {
        let (link, mut peer) = MemoryLink::pair("mem0", 1500);
        let src = "10.0.0.2".parse().unwrap();
        let dst = "10.200.0.1".parse().unwrap();
        let frame = build_echo_request(src, dst, 42, 1, b"data").unwrap();

        let request = IcmpRequest::new(FlowKey::icmp(src, dst), frame.into(), link);
        request.reply().await.unwrap();

        let reply = peer.recv().await.unwrap();
        assert!(matches!(classify(&reply), Segment::EchoReply { .. }));
    }

    #[tokio::test]
    async fn test_reply_rejects_non_echo() {
        let (link, _peer) = MemoryLink::pair("mem0", 1500);
        let src = "10.0.0.2".parse().unwrap();
        let dst = "10.200.0.1".parse().unwrap();
        let request = IcmpRequest::new(FlowKey::icmp(src, dst), Bytes::from_static(b"x"), link);

        let err = request.reply().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
