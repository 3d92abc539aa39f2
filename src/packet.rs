//! Raw IP frame parsing and construction
//!
//! The driver classifies every inbound frame before the engine sees it, and
//! the stack synthesizes a handful of frames itself (TCP resets, UDP replies,
//! ICMP echo replies). Both directions use `smoltcp::wire`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    Icmpv4Message, Icmpv4Packet, Icmpv6Message, Icmpv6Packet, IpAddress, IpProtocol,
    Ipv4Address, Ipv4Packet, Ipv4Repr, Ipv6Address, Ipv6Packet, Ipv6Repr, TcpPacket,
    TcpSeqNumber, UdpPacket,
};

use crate::request::FlowKey;

/// Hop limit used for every synthesized frame
pub const DEFAULT_HOP_LIMIT: u8 = 64;

const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const ICMP_ECHO_HEADER_LEN: usize = 8;

/// What the driver needs to know about an inbound frame
#[derive(Debug, PartialEq, Eq)]
pub enum Segment<'a> {
    /// A TCP segment
    Tcp(TcpMeta),
    /// A UDP datagram
    Udp { flow: FlowKey, payload: &'a [u8] },
    /// An ICMP or ICMPv6 echo request
    EchoRequest { flow: FlowKey },
    /// An ICMP or ICMPv6 echo reply
    EchoReply { flow: FlowKey },
    /// Anything else (fragments, other protocols, malformed frames)
    Other,
}

/// Header fields of a TCP segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpMeta {
    pub flow: FlowKey,
    pub seq: u32,
    pub ack_number: u32,
    pub flags: TcpFlags,
    /// Sequence space consumed: payload plus SYN and FIN
    pub segment_len: usize,
}

impl TcpMeta {
    /// A connection-opening SYN (no ACK, no RST)
    #[must_use]
    pub const fn is_initial_syn(&self) -> bool {
        self.flags.syn && !self.flags.ack && !self.flags.rst
    }
}

/// TCP control bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub rst: bool,
    pub fin: bool,
    pub psh: bool,
}

impl TcpFlags {
    pub const SYN: Self = Self {
        syn: true,
        ack: false,
        rst: false,
        fin: false,
        psh: false,
    };
    pub const ACK: Self = Self {
        syn: false,
        ack: true,
        rst: false,
        fin: false,
        psh: false,
    };
    pub const RST_ACK: Self = Self {
        syn: false,
        ack: true,
        rst: true,
        fin: false,
        psh: false,
    };
}

/// Classify an inbound frame
#[must_use]
pub fn classify(frame: &[u8]) -> Segment<'_> {
    let Some((source, destination, protocol, payload)) = split_ip(frame) else {
        return Segment::Other;
    };

    match protocol {
        IpProtocol::Tcp => {
            let Ok(tcp) = TcpPacket::new_checked(payload) else {
                return Segment::Other;
            };
            let flags = TcpFlags {
                syn: tcp.syn(),
                ack: tcp.ack(),
                rst: tcp.rst(),
                fin: tcp.fin(),
                psh: tcp.psh(),
            };
            let segment_len =
                tcp.payload().len() + usize::from(flags.syn) + usize::from(flags.fin);
            Segment::Tcp(TcpMeta {
                flow: FlowKey::new(
                    SocketAddr::new(source, tcp.src_port()),
                    SocketAddr::new(destination, tcp.dst_port()),
                ),
                seq: tcp.seq_number().0 as u32,
                ack_number: tcp.ack_number().0 as u32,
                flags,
                segment_len,
            })
        }
        IpProtocol::Udp => {
            let Ok(udp) = UdpPacket::new_checked(payload) else {
                return Segment::Other;
            };
            Segment::Udp {
                flow: FlowKey::new(
                    SocketAddr::new(source, udp.src_port()),
                    SocketAddr::new(destination, udp.dst_port()),
                ),
                payload: udp.payload(),
            }
        }
        IpProtocol::Icmp => {
            let Ok(icmp) = Icmpv4Packet::new_checked(payload) else {
                return Segment::Other;
            };
            let flow = FlowKey::icmp(source, destination);
            match icmp.msg_type() {
                Icmpv4Message::EchoRequest => Segment::EchoRequest { flow },
                Icmpv4Message::EchoReply => Segment::EchoReply { flow },
                _ => Segment::Other,
            }
        }
        IpProtocol::Icmpv6 => {
            let Ok(icmp) = Icmpv6Packet::new_checked(payload) else {
                return Segment::Other;
            };
            let flow = FlowKey::icmp(source, destination);
            match icmp.msg_type() {
                Icmpv6Message::EchoRequest => Segment::EchoRequest { flow },
                Icmpv6Message::EchoReply => Segment::EchoReply { flow },
                _ => Segment::Other,
            }
        }
        _ => Segment::Other,
    }
}

/// Payload of a TCP segment, `None` if `frame` is not one
#[must_use]
pub fn tcp_payload(frame: &[u8]) -> Option<&[u8]> {
    let (_, _, protocol, payload) = split_ip(frame)?;
    if protocol != IpProtocol::Tcp {
        return None;
    }
    let tcp = TcpPacket::new_checked(payload).ok()?;
    Some(tcp.payload())
}

/// Rewrite both endpoints of an IPv6 TCP segment in place
///
/// The TCP checksum is recomputed for the new pseudo-header. Returns `false`
/// and leaves `frame` untouched unless it is an IPv6 frame carrying TCP
/// directly.
pub(crate) fn retarget_tcp_v6(
    frame: &mut [u8],
    source: SocketAddrV6,
    destination: SocketAddrV6,
) -> bool {
    if frame.first().map(|b| b >> 4) != Some(6) {
        return false;
    }
    let Ok(mut ip) = Ipv6Packet::new_checked(frame) else {
        return false;
    };
    if ip.next_header() != IpProtocol::Tcp || TcpPacket::new_checked(&*ip.payload_mut()).is_err() {
        return false;
    }

    let src = wire_v6(*source.ip());
    let dst = wire_v6(*destination.ip());
    ip.set_src_addr(src);
    ip.set_dst_addr(dst);

    let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
    tcp.set_src_port(source.port());
    tcp.set_dst_port(destination.port());
    tcp.fill_checksum(&IpAddress::Ipv6(src), &IpAddress::Ipv6(dst));
    true
}

/// Build a TCP segment with a 20-byte header
#[must_use]
pub fn build_tcp(
    from: SocketAddr,
    to: SocketAddr,
    seq: u32,
    ack_number: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let tcp_len = TCP_HEADER_LEN + payload.len();
    emit_ip(from.ip(), to.ip(), IpProtocol::Tcp, tcp_len, |buf, src, dst| {
        let mut tcp = TcpPacket::new_unchecked(buf);
        tcp.set_src_port(from.port());
        tcp.set_dst_port(to.port());
        tcp.set_seq_number(TcpSeqNumber(seq as i32));
        tcp.set_ack_number(TcpSeqNumber(ack_number as i32));
        tcp.set_header_len(TCP_HEADER_LEN as u8);
        tcp.clear_flags();
        tcp.set_syn(flags.syn);
        tcp.set_ack(flags.ack);
        tcp.set_rst(flags.rst);
        tcp.set_fin(flags.fin);
        tcp.set_psh(flags.psh);
        tcp.set_window_len(window);
        tcp.set_urgent_at(0);
        tcp.payload_mut().copy_from_slice(payload);
        tcp.fill_checksum(src, dst);
    })
}

/// Build the RST|ACK that refuses the connection opened by `syn`
///
/// Returns `None` if `syn` is not a TCP segment.
#[must_use]
pub fn build_reset(syn: &[u8]) -> Option<Vec<u8>> {
    let Segment::Tcp(meta) = classify(syn) else {
        return None;
    };
    build_tcp(
        meta.flow.destination,
        meta.flow.source,
        0,
        meta.seq.wrapping_add(meta.segment_len as u32),
        TcpFlags::RST_ACK,
        0,
        &[],
    )
}

/// Build a UDP datagram from `from` to `to`
///
/// Returns `None` for mixed address families or oversized payloads.
#[must_use]
pub fn build_udp(from: SocketAddr, to: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let wire_len = u16::try_from(udp_len).ok()?;
    emit_ip(from.ip(), to.ip(), IpProtocol::Udp, udp_len, |buf, src, dst| {
        let mut udp = UdpPacket::new_unchecked(buf);
        udp.set_src_port(from.port());
        udp.set_dst_port(to.port());
        udp.set_len(wire_len);
        udp.payload_mut().copy_from_slice(payload);
        udp.fill_checksum(src, dst);
    })
}

/// Build an ICMP (v4) or ICMPv6 echo request
#[must_use]
pub fn build_echo_request(
    from: IpAddr,
    to: IpAddr,
    ident: u16,
    seq_no: u16,
    data: &[u8],
) -> Option<Vec<u8>> {
    let icmp_len = ICMP_ECHO_HEADER_LEN + data.len();
    let protocol = match from {
        IpAddr::V4(_) => IpProtocol::Icmp,
        IpAddr::V6(_) => IpProtocol::Icmpv6,
    };
    emit_ip(from, to, protocol, icmp_len, |buf, src, dst| {
        buf[ICMP_ECHO_HEADER_LEN..].copy_from_slice(data);
        if protocol == IpProtocol::Icmp {
            let mut icmp = Icmpv4Packet::new_unchecked(buf);
            icmp.set_msg_type(Icmpv4Message::EchoRequest);
            icmp.set_msg_code(0);
            icmp.set_echo_ident(ident);
            icmp.set_echo_seq_no(seq_no);
            icmp.fill_checksum();
        } else {
            let mut icmp = Icmpv6Packet::new_unchecked(buf);
            icmp.set_msg_type(Icmpv6Message::EchoRequest);
            icmp.set_msg_code(0);
            icmp.set_echo_ident(ident);
            icmp.set_echo_seq_no(seq_no);
            icmp.fill_checksum(src, dst);
        }
    })
}

/// Turn an echo request into the matching echo reply
///
/// Identifier, sequence number and data are echoed back unchanged. Returns
/// `None` if `request` is not an echo request.
#[must_use]
pub fn build_echo_reply(request: &[u8]) -> Option<Vec<u8>> {
    let (source, destination, protocol, payload) = split_ip(request)?;
    match protocol {
        IpProtocol::Icmp => {
            let icmp = Icmpv4Packet::new_checked(payload).ok()?;
            if icmp.msg_type() != Icmpv4Message::EchoRequest {
                return None;
            }
            emit_ip(destination, source, protocol, payload.len(), |buf, _, _| {
                buf.copy_from_slice(payload);
                let mut reply = Icmpv4Packet::new_unchecked(buf);
                reply.set_msg_type(Icmpv4Message::EchoReply);
                reply.set_msg_code(0);
                reply.fill_checksum();
            })
        }
        IpProtocol::Icmpv6 => {
            let icmp = Icmpv6Packet::new_checked(payload).ok()?;
            if icmp.msg_type() != Icmpv6Message::EchoRequest {
                return None;
            }
            emit_ip(destination, source, protocol, payload.len(), |buf, src, dst| {
                buf.copy_from_slice(payload);
                let mut reply = Icmpv6Packet::new_unchecked(buf);
                reply.set_msg_type(Icmpv6Message::EchoReply);
                reply.set_msg_code(0);
                reply.fill_checksum(src, dst);
            })
        }
        _ => None,
    }
}

/// Source, destination, protocol and transport payload of an unfragmented
/// IP frame
fn split_ip(frame: &[u8]) -> Option<(IpAddr, IpAddr, IpProtocol, &[u8])> {
    match frame.first()? >> 4 {
        4 => {
            let ip = Ipv4Packet::new_checked(frame).ok()?;
            if ip.more_frags() || ip.frag_offset() != 0 {
                return None;
            }
            Some((
                IpAddr::V4(std_v4(ip.src_addr())),
                IpAddr::V4(std_v4(ip.dst_addr())),
                ip.next_header(),
                ip.payload(),
            ))
        }
        6 => {
            let ip = Ipv6Packet::new_checked(frame).ok()?;
            Some((
                IpAddr::V6(std_v6(ip.src_addr())),
                IpAddr::V6(std_v6(ip.dst_addr())),
                ip.next_header(),
                ip.payload(),
            ))
        }
        _ => None,
    }
}

/// Emit an IP header for `payload_len` bytes and let `fill` write the
/// transport part. `fill` receives the engine's view of both addresses for
/// pseudo-header checksums.
fn emit_ip<F>(
    source: IpAddr,
    destination: IpAddr,
    protocol: IpProtocol,
    payload_len: usize,
    fill: F,
) -> Option<Vec<u8>>
where
    F: FnOnce(&mut [u8], &IpAddress, &IpAddress),
{
    match (source, destination) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let repr = Ipv4Repr {
                src_addr: wire_v4(src),
                dst_addr: wire_v4(dst),
                next_header: protocol,
                payload_len,
                hop_limit: DEFAULT_HOP_LIMIT,
            };
            if repr.buffer_len() + payload_len > usize::from(u16::MAX) {
                return None;
            }
            let mut buf = vec![0u8; repr.buffer_len() + payload_len];
            let mut packet = Ipv4Packet::new_unchecked(&mut buf[..]);
            repr.emit(&mut packet, &ChecksumCapabilities::default());
            fill(
                packet.payload_mut(),
                &IpAddress::Ipv4(repr.src_addr),
                &IpAddress::Ipv4(repr.dst_addr),
            );
            Some(buf)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            if payload_len > usize::from(u16::MAX) {
                return None;
            }
            let repr = Ipv6Repr {
                src_addr: wire_v6(src),
                dst_addr: wire_v6(dst),
                next_header: protocol,
                payload_len,
                hop_limit: DEFAULT_HOP_LIMIT,
            };
            let mut buf = vec![0u8; repr.buffer_len() + payload_len];
            let mut packet = Ipv6Packet::new_unchecked(&mut buf[..]);
            repr.emit(&mut packet);
            fill(
                packet.payload_mut(),
                &IpAddress::Ipv6(repr.src_addr),
                &IpAddress::Ipv6(repr.dst_addr),
            );
            Some(buf)
        }
        _ => None,
    }
}

pub(crate) fn wire_v4(addr: Ipv4Addr) -> Ipv4Address {
    Ipv4Address::from_bytes(&addr.octets())
}

pub(crate) fn wire_v6(addr: Ipv6Addr) -> Ipv6Address {
    Ipv6Address::from_bytes(&addr.octets())
}

pub(crate) fn wire_ip(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(wire_v4(v4)),
        IpAddr::V6(v6) => IpAddress::Ipv6(wire_v6(v6)),
    }
}

fn std_v4(addr: Ipv4Address) -> Ipv4Addr {
    Ipv4Addr::from(addr.0)
}

fn std_v6(addr: Ipv6Address) -> Ipv6Addr {
    Ipv6Addr::from(addr.0)
}
