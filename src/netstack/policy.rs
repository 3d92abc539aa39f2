//! Fixed startup policy of the packet engine
//!
//! Redirected traffic can be addressed to any host, so the engine must accept
//! every destination as local. smoltcp does that through `any_ip`, which only
//! takes effect for destinations routed via one of the interface's own
//! addresses: the policy gives the interface a gateway address per family and
//! installs default routes through them. smoltcp applies `any_ip` to IPv4
//! only, so accepted IPv6 flows are mapped onto the IPv6 gateway address by
//! the driver.
//!
//! The remaining knobs describe behavior smoltcp already has and are recorded
//! so the policy can be inspected and checked.

use std::net::{Ipv4Addr, Ipv6Addr};

use smoltcp::iface::Interface;
use smoltcp::wire::{IpAddress, IpCidr};
use tracing::debug;

use crate::error::StackError;
use crate::packet::{wire_v4, wire_v6};

/// Engine configuration applied once at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupPolicy {
    /// Interface address the IPv4 default route points at (RFC 7600 dummy address)
    pub gateway_v4: Ipv4Addr,
    /// Interface address the IPv6 default route points at
    pub gateway_v6: Ipv6Addr,
    /// Accept packets for any destination (promiscuous + spoofing)
    pub any_ip: bool,
    /// Route packets between interfaces; smoltcp never forwards
    pub forwarding: bool,
    /// TCP selective acknowledgment; smoltcp never advertises SACK
    pub tcp_sack: bool,
    /// SYN cookies; smoltcp keeps per-socket handshake state instead
    pub syn_cookies: bool,
    /// Engine-level ICMP rate limiting; echo is answered by the responder
    pub engine_icmp_limit: bool,
}

/// The only policy the stack runs with
pub const STARTUP_POLICY: StartupPolicy = StartupPolicy {
    gateway_v4: Ipv4Addr::new(192, 0, 0, 8),
    gateway_v6: Ipv6Addr::new(0xfd70, 0x6976, 0x6f74, 0, 0, 0, 0, 1),
    any_ip: true,
    forwarding: false,
    tcp_sack: false,
    syn_cookies: false,
    engine_icmp_limit: false,
};

impl StartupPolicy {
    /// Configure addresses, routes and `any_ip` on `iface`
    ///
    /// # Errors
    ///
    /// Returns `StackError::NicCreationFailed` if the address or route table
    /// has no room.
    pub(crate) fn apply(&self, iface: &mut Interface) -> Result<(), StackError> {
        let v4 = IpCidr::new(IpAddress::Ipv4(wire_v4(self.gateway_v4)), 32);
        let v6 = IpCidr::new(IpAddress::Ipv6(wire_v6(self.gateway_v6)), 128);

        let mut result = Ok(());
        iface.update_ip_addrs(|addrs| {
            for cidr in [v4, v6] {
                if addrs.push(cidr).is_err() {
                    result = Err(StackError::nic_creation("interface address table full"));
                }
            }
        });
        result?;

        iface
            .routes_mut()
            .add_default_ipv4_route(wire_v4(self.gateway_v4))
            .map_err(|_| StackError::nic_creation("route table full (IPv4 default)"))?;
        iface
            .routes_mut()
            .add_default_ipv6_route(wire_v6(self.gateway_v6))
            .map_err(|_| StackError::nic_creation("route table full (IPv6 default)"))?;

        iface.set_any_ip(self.any_ip);

        debug!(
            gateway_v4 = %self.gateway_v4,
            gateway_v6 = %self.gateway_v6,
            any_ip = self.any_ip,
            "Startup policy applied"
        );
        Ok(())
    }
}
