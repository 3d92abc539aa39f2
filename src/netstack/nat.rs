//! Port mapping for accepted IPv6 TCP flows
//!
//! smoltcp honours `any_ip` for IPv4 only: an IPv6 segment is dropped unless
//! its destination is one of the interface's own addresses. Each accepted
//! IPv6 flow is therefore given a port on the interface's own IPv6 address.
//! Inbound segments are rewritten to that local endpoint before the engine
//! sees them, and outbound segments get the original destination back as
//! their source.
//!
//! The driver is the only owner, so the tables are plain maps.

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::ops::RangeInclusive;

use tracing::{trace, warn};

use crate::packet::{classify, retarget_tcp_v6, Segment};
use crate::request::FlowKey;

/// Local ports handed out to mapped flows (IANA ephemeral range)
pub(crate) const LOCAL_PORTS: RangeInclusive<u16> = 49152..=65535;

/// Local endpoint assignments for accepted IPv6 TCP flows
pub(crate) struct Ipv6PortMap {
    local: Ipv6Addr,
    by_flow: HashMap<FlowKey, u16>,
    by_port: HashMap<u16, FlowKey>,
    /// Next candidate port, wraps around the range
    next_port: u16,
}

impl Ipv6PortMap {
    pub fn new(local: Ipv6Addr) -> Self {
        Self {
            local,
            by_flow: HashMap::new(),
            by_port: HashMap::new(),
            next_port: *LOCAL_PORTS.start(),
        }
    }

    /// Assign a local endpoint to `flow`
    ///
    /// A flow that is already mapped keeps its endpoint. Returns `None` when
    /// every port is taken.
    pub fn map(&mut self, flow: FlowKey) -> Option<SocketAddrV6> {
        if let Some(port) = self.by_flow.get(&flow) {
            return Some(self.endpoint(*port));
        }

        let (start, end) = (*LOCAL_PORTS.start(), *LOCAL_PORTS.end());
        let candidates = (self.next_port..=end).chain(start..self.next_port);
        for port in candidates {
            if self.by_port.contains_key(&port) {
                continue;
            }
            self.next_port = if port == end { start } else { port + 1 };
            self.by_port.insert(port, flow);
            self.by_flow.insert(flow, port);
            trace!(%flow, port, "Mapped IPv6 flow");
            return Some(self.endpoint(port));
        }

        warn!(%flow, mapped = self.by_flow.len(), "IPv6 port range exhausted");
        None
    }

    /// Forget the mapping of `flow`, freeing its port
    pub fn unmap(&mut self, flow: &FlowKey) {
        if let Some(port) = self.by_flow.remove(flow) {
            self.by_port.remove(&port);
            trace!(%flow, port, "Unmapped IPv6 flow");
        }
    }

    pub fn local_endpoint(&self, flow: &FlowKey) -> Option<SocketAddrV6> {
        self.by_flow.get(flow).map(|port| self.endpoint(*port))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.by_flow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_flow.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_flow.clear();
        self.by_port.clear();
    }

    /// Point an inbound segment of `flow` at its local endpoint
    ///
    /// Returns `false` if the flow is not mapped or `frame` is not an IPv6
    /// TCP segment.
    pub fn translate_inbound(&self, flow: &FlowKey, frame: &mut [u8]) -> bool {
        let (Some(local), SocketAddr::V6(peer)) = (self.local_endpoint(flow), flow.source) else {
            return false;
        };
        retarget_tcp_v6(frame, peer, local)
    }

    /// Give an outbound engine segment its original source back
    ///
    /// Frames that do not come from a mapped local endpoint are left alone.
    pub fn translate_outbound(&self, frame: &mut [u8]) -> bool {
        let Segment::Tcp(meta) = classify(frame) else {
            return false;
        };
        let SocketAddr::V6(from) = meta.flow.source else {
            return false;
        };
        if *from.ip() != self.local {
            return false;
        }
        let Some(flow) = self.by_port.get(&from.port()) else {
            return false;
        };
        let (SocketAddr::V6(original), SocketAddr::V6(peer)) = (flow.destination, flow.source)
        else {
            return false;
        };
        retarget_tcp_v6(frame, original, peer)
    }

    fn endpoint(&self, port: u16) -> SocketAddrV6 {
        SocketAddrV6::new(self.local, port, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{build_tcp, TcpFlags};

    const LOCAL: Ipv6Addr = Ipv6Addr::new(0xfd70, 0x6976, 0x6f74, 0, 0, 0, 0, 1);

    fn flow(src: &str, dst: &str) -> FlowKey {
        FlowKey::new(src.parse().unwrap(), dst.parse().unwrap())
    }

    #[test]
    fn test_map_is_stable_and_unique() {
        let mut map = Ipv6PortMap::new(LOCAL);
        let a = flow("[fd00::2]:40000", "[2001:db8::10]:80");
        let b = flow("[fd00::2]:40000", "[2001:db8::11]:80");

        let first = map.map(a).unwrap();
        assert_eq!(*first.ip(), LOCAL);
        assert_eq!(map.map(a), Some(first));

        let second = map.map(b).unwrap();
        assert_ne!(first.port(), second.port());
        assert_eq!(map.len(), 2);

        map.unmap(&a);
        assert!(map.local_endpoint(&a).is_none());
        assert_eq!(map.local_endpoint(&b), Some(second));
        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn test_port_range_exhaustion() {
        let mut map = Ipv6PortMap::new(LOCAL);
        let ports = usize::from(LOCAL_PORTS.end() - LOCAL_PORTS.start()) + 1;

        for i in 0..ports {
            let src = format!("[fd00::{:x}]:{}", i / 60_000 + 1, 1 + i % 60_000);
            assert!(map.map(flow(&src, "[2001:db8::1]:443")).is_some());
        }
        let extra = flow("[fd00::ffff]:1", "[2001:db8::1]:443");
        assert!(map.map(extra).is_none());

        // A released port is handed out again.
        let released = flow("[fd00::1]:1", "[2001:db8::1]:443");
        let port = map.local_endpoint(&released).unwrap().port();
        map.unmap(&released);
        assert_eq!(map.map(extra).unwrap().port(), port);
    }

    #[test]
    fn test_translation_round_trip() {
        let mut map = Ipv6PortMap::new(LOCAL);
        let key = flow("[fd00::2]:40000", "[2001:db8::10]:80");
        let local = map.map(key).unwrap();

        let mut inbound = build_tcp(key.source, key.destination, 1, 0, TcpFlags::SYN, 1024, &[])
            .unwrap();
        assert!(map.translate_inbound(&key, &mut inbound));
        let Segment::Tcp(meta) = classify(&inbound) else {
            panic!("expected TCP");
        };
        assert_eq!(meta.flow.destination, SocketAddr::V6(local));
        assert_eq!(meta.flow.source, key.source);

        let mut outbound = build_tcp(
            SocketAddr::V6(local),
            key.source,
            9,
            2,
            TcpFlags::ACK,
            1024,
            b"hi",
        )
        .unwrap();
        assert!(map.translate_outbound(&mut outbound));
        let Segment::Tcp(meta) = classify(&outbound) else {
            panic!("expected TCP");
        };
        assert_eq!(meta.flow.source, key.destination);
        assert_eq!(meta.flow.destination, key.source);
    }

    #[test]
    fn test_unmapped_frames_untouched() {
        let map = Ipv6PortMap::new(LOCAL);
        let key = flow("[fd00::2]:40000", "[2001:db8::10]:80");
        let mut frame = build_tcp(key.source, key.destination, 1, 0, TcpFlags::SYN, 1024, &[])
            .unwrap();
        let before = frame.clone();

        assert!(!map.translate_inbound(&key, &mut frame));
        assert!(!map.translate_outbound(&mut frame));
        assert_eq!(frame, before);
    }
}
