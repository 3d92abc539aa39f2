//! ICMP echo responder
//!
//! Answers every echo request that reaches the interface, locally and without
//! creating a connection request. The driver forwards echo frames here over a
//! bounded channel; when the channel is full the request is ignored, which
//! the sender sees as ordinary packet loss.

use std::num::NonZeroU32;
use std::sync::Arc;

use bytes::Bytes;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::stats::StackStats;
use crate::link::Link;
use crate::request::{FlowKey, IcmpRequest};

/// Echo requests buffered between the driver and the responder
pub const ECHO_QUEUE_DEPTH: usize = 128;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// An echo request handed over by the driver
pub(crate) struct EchoFrame {
    pub flow: FlowKey,
    pub frame: Bytes,
}

/// Running responder task
pub(crate) struct EchoResponder {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl EchoResponder {
    /// Start the responder
    ///
    /// `rate_limit` caps replies per second; `None` answers everything.
    pub fn spawn(
        link: Arc<dyn Link>,
        requests: mpsc::Receiver<EchoFrame>,
        rate_limit: Option<u32>,
        stats: Arc<StackStats>,
    ) -> Self {
        let limiter = rate_limit
            .and_then(NonZeroU32::new)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate)));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(link, requests, limiter, stats, shutdown_rx));
        Self { shutdown, task }
    }

    /// Signal the task and wait until it has exited
    ///
    /// After this returns the responder no longer writes to the link.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            debug!(error = %e, "Echo responder task ended abnormally");
        }
    }

    /// Stop without waiting, for contexts that cannot await
    pub fn abort(self) {
        self.task.abort();
    }
}

async fn run(
    link: Arc<dyn Link>,
    mut requests: mpsc::Receiver<EchoFrame>,
    limiter: Option<DirectLimiter>,
    stats: Arc<StackStats>,
    mut shutdown: oneshot::Receiver<()>,
) {
    debug!(interface = link.name(), "Echo responder started");

    loop {
        let request = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        if let Some(limiter) = &limiter {
            if limiter.check().is_err() {
                stats.record_echo_rate_limited();
                trace!(flow = %request.flow, "Echo request rate limited");
                continue;
            }
        }

        let flow = request.flow;
        match IcmpRequest::new(flow, request.frame, Arc::clone(&link))
            .reply()
            .await
        {
            Ok(()) => {
                stats.record_echo_reply();
                trace!(%flow, "Echo reply sent");
            }
            Err(e) => debug!(%flow, error = %e, "Failed to send echo reply"),
        }
    }

    debug!(interface = link.name(), "Echo responder stopped");
}
