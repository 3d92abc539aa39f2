//! Stack driver
//!
//! One task owns the link's read side and every piece of mutable flow state.
//! Each turn waits for one event (an inbound frame, a message from a request
//! or flow, a consumer wake-up or an engine timer), handles it, then polls
//! the engine, moves bytes between accepted sockets and their consumers, and
//! flushes the engine's outbound frames to the link.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp::State as TcpState;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::device::FrameQueue;
use super::echo::EchoFrame;
use super::engine::{Engine, EngineHandle};
use super::forwarder::{TcpForwarder, UdpForwarder};
use super::nat::Ipv6PortMap;
use super::policy::STARTUP_POLICY;
use super::stats::StackStats;
use crate::link::Link;
use crate::packet::{build_reset, build_udp, classify, Segment};
use crate::request::{Control, Datagram, FlowKey};

/// Largest frame read from the link in one call
const MAX_FRAME_LEN: usize = 65_535;

/// Upper bound on how long the driver sleeps without an event
const IDLE_TICK: Duration = Duration::from_millis(100);

/// How often idle UDP flows are reaped
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Poll/service rounds per turn before yielding back to the event loop
const MAX_PUMP_ROUNDS: usize = 8;

/// Channels the driver receives on
pub(crate) struct DriverChannels {
    pub control_rx: mpsc::UnboundedReceiver<Control>,
    pub datagram_rx: mpsc::Receiver<Datagram>,
    pub wake: Arc<Notify>,
    pub echo_tx: mpsc::Sender<EchoFrame>,
}

/// An accepted TCP flow bound to an engine socket
struct TcpBinding {
    id: u64,
    handle: SocketHandle,
    /// `None` once EOF was signalled or the consumer went away
    to_consumer: Option<mpsc::Sender<Bytes>>,
    from_consumer: mpsc::Receiver<Bytes>,
    /// Consumer data the socket had no room for yet
    pending_out: Option<Bytes>,
    established: bool,
    outbound_closed: bool,
}

enum Event {
    Shutdown,
    Control(Control),
    Datagram(Datagram),
    Frame(usize),
    LinkError(io::Error),
    Tick,
}

pub(crate) struct Driver {
    link: Arc<dyn Link>,
    engine: EngineHandle,
    queue: Arc<FrameQueue>,
    tcp: TcpForwarder,
    udp: UdpForwarder,
    bindings: HashMap<FlowKey, TcpBinding>,
    v6_ports: Ipv6PortMap,
    /// IPv6 flows whose socket is gone; unmapped once their last frames are out
    retired_v6: Vec<FlowKey>,
    channels: DriverChannels,
    stats: Arc<StackStats>,
    tcp_buffer_size: usize,
    link_down: bool,
}

/// Running driver task
pub(crate) struct DriverTask {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl DriverTask {
    /// Signal the driver and wait until it has exited
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "Stack driver task ended abnormally");
        }
    }

    /// Stop without waiting, for contexts that cannot await
    pub fn abort(self) {
        self.task.abort();
    }
}

impl Driver {
    pub fn new(
        link: Arc<dyn Link>,
        engine: EngineHandle,
        tcp: TcpForwarder,
        udp: UdpForwarder,
        channels: DriverChannels,
        stats: Arc<StackStats>,
        tcp_buffer_size: usize,
    ) -> Self {
        let queue = engine.lock().queue();
        Self {
            link,
            engine,
            queue,
            tcp,
            udp,
            bindings: HashMap::new(),
            v6_ports: Ipv6PortMap::new(STARTUP_POLICY.gateway_v6),
            retired_v6: Vec::new(),
            channels,
            stats,
            tcp_buffer_size,
            link_down: false,
        }
    }

    pub fn spawn(self) -> DriverTask {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        DriverTask { shutdown, task }
    }

    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        info!(interface = self.link.name(), "Stack driver started");

        let link = Arc::clone(&self.link);
        let wake = Arc::clone(&self.channels.wake);
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        let mut last_reap = Instant::now();

        loop {
            let delay = self
                .engine
                .lock()
                .poll_delay()
                .map_or(IDLE_TICK, |d| d.min(IDLE_TICK));

            let event = tokio::select! {
                biased;
                _ = &mut shutdown => Event::Shutdown,
                Some(control) = self.channels.control_rx.recv() => Event::Control(control),
                Some(datagram) = self.channels.datagram_rx.recv() => Event::Datagram(datagram),
                result = link.recv(&mut buf), if !self.link_down => match result {
                    Ok(n) => Event::Frame(n),
                    Err(e) => Event::LinkError(e),
                },
                () = wake.notified() => Event::Tick,
                () = tokio::time::sleep(delay) => Event::Tick,
            };

            match event {
                Event::Shutdown => break,
                Event::Control(control) => self.on_control(control).await,
                Event::Datagram(datagram) => self.on_datagram(datagram).await,
                Event::Frame(0) => {}
                Event::Frame(n) => self.on_frame(&buf[..n]),
                Event::LinkError(e) => {
                    warn!(interface = link.name(), error = %e, "Link read failed, ingress stopped");
                    self.link_down = true;
                }
                Event::Tick => {}
            }

            self.pump();
            self.flush().await;

            if last_reap.elapsed() >= REAP_INTERVAL {
                last_reap = Instant::now();
                let reaped = self.udp.reap_idle(last_reap);
                if reaped > 0 {
                    debug!(reaped, "Reaped idle UDP flows");
                }
            }
        }

        // Refusals queued before shutdown still go out.
        while let Ok(control) = self.channels.control_rx.try_recv() {
            if let Control::TcpFinish {
                flow,
                reset: Some(syn),
                ..
            } = control
            {
                self.send_reset(flow, &syn).await;
            }
        }

        let inflight = self.tcp.inflight();
        self.tcp.clear();
        self.udp.clear();
        let bound = self.bindings.len();
        self.bindings.clear();
        self.v6_ports.clear();
        info!(interface = link.name(), bound, inflight, "Stack driver stopped");
    }

    // =========================================================================
    // Ingress
    // =========================================================================

    fn on_frame(&mut self, frame: &[u8]) {
        self.stats.record_frame_in();

        match classify(frame) {
            Segment::Tcp(meta) => {
                if self.bindings.contains_key(&meta.flow) {
                    self.bound_to_engine(&meta.flow, frame);
                } else if self.tcp.is_pending(&meta.flow) {
                    trace!(flow = %meta.flow, "Segment for pending TCP flow dropped");
                } else if meta.is_initial_syn() {
                    self.tcp.on_syn(meta.flow, frame);
                } else {
                    self.to_engine(frame);
                }
            }
            Segment::Udp { flow, payload } => self.udp.on_datagram(flow, payload),
            Segment::EchoRequest { flow } => {
                let echo = EchoFrame {
                    flow,
                    frame: Bytes::copy_from_slice(frame),
                };
                match self.channels.echo_tx.try_send(echo) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => trace!(%flow, "Echo queue full, request dropped"),
                    Err(TrySendError::Closed(_)) => trace!(%flow, "Echo responder gone"),
                }
            }
            Segment::EchoReply { .. } | Segment::Other => self.to_engine(frame),
        }
    }

    fn to_engine(&self, frame: &[u8]) {
        self.push_to_engine(frame.to_vec());
    }

    /// Hand a segment of a bound flow to the engine, translating IPv6 flows
    /// to their local endpoint
    fn bound_to_engine(&self, flow: &FlowKey, frame: &[u8]) {
        let mut frame = frame.to_vec();
        if flow.destination.is_ipv6() && !self.v6_ports.translate_inbound(flow, &mut frame) {
            trace!(%flow, "IPv6 segment could not be translated, dropped");
            return;
        }
        self.push_to_engine(frame);
    }

    fn push_to_engine(&self, frame: Vec<u8>) {
        if !self.queue.push_rx(frame) {
            trace!("Engine receive queue full, frame dropped");
        }
    }

    async fn on_control(&mut self, control: Control) {
        match control {
            Control::TcpAccept {
                id,
                flow,
                syn,
                to_consumer,
                from_consumer,
            } => {
                if !self.bind_tcp(id, flow, &syn, to_consumer, from_consumer) {
                    self.send_reset(flow, &syn).await;
                }
            }
            Control::TcpFinish { id, flow, reset } => {
                self.tcp.complete(&flow, id);
                if let Some(syn) = reset {
                    self.send_reset(flow, &syn).await;
                }
                trace!(id, %flow, "TCP request finished");
            }
            Control::UdpAccept {
                id,
                flow,
                to_consumer,
            } => self.udp.accept(id, flow, to_consumer),
            Control::UdpRelease { id, flow } => self.udp.release(id, &flow),
        }
    }

    /// Bind an engine socket to an accepted flow and replay its SYN
    ///
    /// Returns `false` if the flow could not be bound; the caller refuses it.
    fn bind_tcp(
        &mut self,
        id: u64,
        flow: FlowKey,
        syn: &[u8],
        to_consumer: mpsc::Sender<Bytes>,
        from_consumer: mpsc::Receiver<Bytes>,
    ) -> bool {
        self.tcp.complete(&flow, id);
        if self.bindings.contains_key(&flow) {
            warn!(id, %flow, "Flow already bound, refusing duplicate accept");
            return false;
        }

        // smoltcp only accepts IPv6 segments addressed to the interface itself.
        let mut syn = syn.to_vec();
        let local = if flow.destination.is_ipv6() {
            let Some(local) = self.v6_ports.map(flow) else {
                return false;
            };
            if !self.v6_ports.translate_inbound(&flow, &mut syn) {
                warn!(id, %flow, "Stored SYN could not be translated");
                self.v6_ports.unmap(&flow);
                return false;
            }
            SocketAddr::V6(local)
        } else {
            flow.destination
        };

        let engine = Arc::clone(&self.engine);
        let mut engine = engine.lock();
        // Settle existing sockets before the new listener joins the set.
        engine.poll();

        let handle = match engine.listen_tcp(local, self.tcp_buffer_size) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(id, %flow, error = %e, "Failed to bind accepted flow");
                self.v6_ports.unmap(&flow);
                return false;
            }
        };

        self.queue.push_rx(syn);
        engine.poll();

        if engine.tcp_socket(handle).state() == TcpState::Listen {
            warn!(id, %flow, "Engine did not take the replayed SYN");
            engine.remove_socket(handle);
            self.v6_ports.unmap(&flow);
            return false;
        }

        self.bindings.insert(
            flow,
            TcpBinding {
                id,
                handle,
                to_consumer: Some(to_consumer),
                from_consumer,
                pending_out: None,
                established: false,
                outbound_closed: false,
            },
        );
        self.stats.record_tcp_accepted();
        debug!(id, %flow, ?handle, "TCP flow bound");
        true
    }

    async fn on_datagram(&mut self, datagram: Datagram) {
        let flow = datagram.flow;
        let Some(frame) = build_udp(flow.destination, flow.source, &datagram.payload) else {
            debug!(%flow, len = datagram.payload.len(), "Cannot encode UDP reply");
            return;
        };
        self.udp.touch(&flow);
        self.write(&frame).await;
    }

    async fn send_reset(&mut self, flow: FlowKey, syn: &[u8]) {
        let Some(frame) = build_reset(syn) else {
            debug!(%flow, "Stored SYN is not a TCP segment, no reset sent");
            return;
        };
        self.write(&frame).await;
        self.stats.record_reset();
        debug!(%flow, "Reset sent");
    }

    // =========================================================================
    // Engine
    // =========================================================================

    /// Poll the engine and service bound sockets until nothing moves
    fn pump(&mut self) {
        let engine = Arc::clone(&self.engine);
        let mut engine = engine.lock();
        for _ in 0..MAX_PUMP_ROUNDS {
            let changed = engine.poll();
            let moved = self.service_streams(&mut engine);
            if !changed && !moved {
                break;
            }
        }
    }

    /// Move bytes between sockets and consumers; drop finished bindings
    ///
    /// Returns `true` if any data or state was handed over.
    fn service_streams(&mut self, engine: &mut Engine) -> bool {
        let mut moved = false;
        let mut finished = Vec::new();

        for (flow, binding) in &mut self.bindings {
            let socket = engine.tcp_socket(binding.handle);
            let state = socket.state();
            if !matches!(state, TcpState::Listen | TcpState::SynReceived) {
                binding.established = true;
            }

            // Socket -> consumer
            while socket.can_recv() {
                match &binding.to_consumer {
                    None => {
                        // Nobody reads any more; discard so the window stays open.
                        let _ = socket.recv(|data| (data.len(), ()));
                        moved = true;
                        continue;
                    }
                    Some(tx) => match tx.try_reserve() {
                        Ok(permit) => {
                            if let Ok(chunk) =
                                socket.recv(|data| (data.len(), Bytes::copy_from_slice(data)))
                            {
                                permit.send(chunk);
                                moved = true;
                            }
                            continue;
                        }
                        Err(TrySendError::Full(())) => break,
                        Err(TrySendError::Closed(())) => {}
                    },
                }

                debug!(id = binding.id, %flow, "Consumer dropped connection");
                binding.to_consumer = None;
                if !binding.outbound_closed {
                    socket.close();
                    binding.outbound_closed = true;
                }
                moved = true;
            }
            if binding.established
                && binding.to_consumer.is_some()
                && !socket.may_recv()
                && !socket.can_recv()
            {
                trace!(id = binding.id, %flow, "Peer finished sending");
                binding.to_consumer = None;
                moved = true;
            }

            // Consumer -> socket
            while socket.can_send() && !binding.outbound_closed {
                let chunk = match binding.pending_out.take() {
                    Some(chunk) => chunk,
                    None => match binding.from_consumer.try_recv() {
                        Ok(chunk) => chunk,
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            trace!(id = binding.id, %flow, "Consumer finished sending");
                            socket.close();
                            binding.outbound_closed = true;
                            moved = true;
                            break;
                        }
                    },
                };
                match socket.send_slice(&chunk) {
                    Ok(n) if n < chunk.len() => {
                        binding.pending_out = Some(chunk.slice(n..));
                        moved |= n > 0;
                        break;
                    }
                    Ok(_) => moved = true,
                    Err(e) => {
                        debug!(id = binding.id, %flow, error = ?e, "Socket refused data");
                        binding.outbound_closed = true;
                        break;
                    }
                }
            }

            // A bound socket back in Listen was reset during the handshake.
            let done = match socket.state() {
                TcpState::Closed | TcpState::TimeWait => {
                    binding.to_consumer.is_none() || !socket.can_recv()
                }
                TcpState::Listen => true,
                _ => false,
            };
            if done {
                finished.push(*flow);
            }
        }

        for flow in finished {
            if let Some(binding) = self.bindings.remove(&flow) {
                engine.remove_socket(binding.handle);
                if flow.destination.is_ipv6() {
                    self.retired_v6.push(flow);
                }
                debug!(id = binding.id, %flow, "TCP flow closed");
                moved = true;
            }
        }

        moved
    }

    /// Write the engine's queued frames to the link
    async fn flush(&mut self) {
        for mut frame in self.queue.drain_tx() {
            if !self.v6_ports.is_empty() {
                self.v6_ports.translate_outbound(&mut frame);
            }
            self.write(&frame).await;
        }
        for flow in self.retired_v6.drain(..) {
            self.v6_ports.unmap(&flow);
        }
    }

    async fn write(&self, frame: &[u8]) {
        match self.link.send(frame).await {
            Ok(()) => self.stats.record_frame_out(),
            Err(e) => debug!(interface = self.link.name(), error = %e, "Link write failed"),
        }
    }
}
