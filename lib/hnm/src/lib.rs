//! Idempotent installation/removal of host interface state: link up/down,
//! addresses, default routes per family, and the two static tunnel routes.
//! Built directly on `netlink`'s link/address/route/nexthop wrappers; this
//! crate owns no raw `libnl` pointers itself; everything here is sequencing
//! and reconciliation logic atop that crate's preallocated objects.

mod error;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use netlink::{
    AddressFilter, CachedAddress, Family, NlRoutingSocket, RtnlAddr, RtnlAddrCache,
    RtnlCachedLinkTrait, RtnlLinkCache, RtnlLinkCommon, RtnlNextHop, RtnlRoute,
};
use slog::{debug, info, Logger};

pub use error::{Error, Result};

/// Enumeration buffer capacity for `EnsureV4ConfigurationIsApplied`'s
/// address reconciliation pass (spec §4.4: "capacity 126").
const ADDRESS_ENUMERATION_CAPACITY: usize = 126;

/// Tunnel addressing, fixed per spec §6. Not configuration: these are the
/// single carrier profile's static contract, same footing as the profile
/// id and device path in `supervisor::config`.
pub const TUNNEL_GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 10, 1, 1);
pub const TUNNEL_SELF: Ipv4Addr = Ipv4Addr::new(10, 10, 1, 2);
pub const TUNNEL_SERVICE_TARGET: (Ipv4Addr, u8) = (Ipv4Addr::new(10, 10, 2, 2), 32);
pub const TUNNEL_OPS_NETWORK: (Ipv4Addr, u8) = (Ipv4Addr::new(10, 10, 3, 0), 24);

/// The two interfaces this daemon ever touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Wwan,
    Tunnel,
}

impl Link {
    fn label(self) -> &'static str {
        match self {
            Link::Wwan => "wwan",
            Link::Tunnel => "tunnel",
        }
    }
}

/// Owns every netlink object HNM needs, in reverse-acquisition field order
/// so `Drop`'s declaration-order walk tears them down in the order
/// `Shutdown` (spec §4.4) requires without any manual unwind bookkeeping:
/// Rust drops struct fields top-to-bottom, so the field declared first here
/// is the one acquired *last* in `initialize`, and is freed first.
pub struct HostNetworkState {
    log: Logger,
    wwan_name: String,
    tunnel_name: String,
    wwan_ifindex: i32,
    tunnel_ifindex: i32,

    tunnel_route_ops: RtnlRoute,
    tunnel_route_service: RtnlRoute,
    tunnel_next_hop: RtnlNextHop,
    addr_v6: RtnlAddr,
    addr_v4: RtnlAddr,
    route_v6_default: RtnlRoute,
    route_v4_default: RtnlRoute,
    wwan_next_hop: RtnlNextHop,
    addr_filter: AddressFilter,
    addr_cache: RtnlAddrCache,
    link_cache_v6: RtnlLinkCache<'static>,
    link_cache_v4: RtnlLinkCache<'static>,
    sock: NlRoutingSocket,
}

impl HostNetworkState {
    /// Opens a route socket, materializes link caches for both families,
    /// resolves both links by name, and allocates every preallocated
    /// object HNM reuses across the process lifetime. Each step uses `?`:
    /// on any failure, the locals already constructed drop in reverse
    /// order automatically, the scoped-acquisition replacement for the
    /// source's manual `if/else` unwind chain (spec §9 Design Note).
    pub fn initialize(log: Logger, wwan_name: &str, tunnel_name: &str) -> Result<Self> {
        let sock = NlRoutingSocket::new()?;

        // Two link caches "per family" per the data model (§3); the
        // underlying `rtnl_link` cache is not itself family-scoped (link
        // objects carry no address family), so both caches enumerate the
        // same link set. Keeping two lets the divergence check below be
        // literal rather than vacuous-by-construction.
        let link_cache_v4 = RtnlLinkCache::new(&sock)?;
        let link_cache_v6 = RtnlLinkCache::new(&sock)?;

        let wwan_ifindex_v4 = link_cache_v4
            .find_by_name(wwan_name)
            .ok_or(Error::LinkNotFound("wwan"))?
            .index();
        let wwan_ifindex_v6 = link_cache_v6
            .find_by_name(wwan_name)
            .ok_or(Error::LinkNotFound("wwan"))?
            .index();
        if wwan_ifindex_v4 != wwan_ifindex_v6 {
            return Err(Error::IfindexDivergence {
                v4: wwan_ifindex_v4,
                v6: wwan_ifindex_v6,
            });
        }
        let wwan_ifindex = wwan_ifindex_v4;
        let tunnel_ifindex = link_cache_v4
            .find_by_name(tunnel_name)
            .ok_or(Error::LinkNotFound("tunnel"))?
            .index();

        let addr_cache = RtnlAddrCache::new(&sock)?;
        let addr_filter = AddressFilter::new(wwan_ifindex);

        let wwan_next_hop = RtnlNextHop::new(wwan_ifindex)?;
        let route_v4_default = RtnlRoute::new_default(Family::V4)?;
        let route_v6_default = RtnlRoute::new_default(Family::V6)?;
        let addr_v4 = RtnlAddr::new()?;
        let addr_v6 = RtnlAddr::new()?;

        let mut tunnel_next_hop = RtnlNextHop::new(tunnel_ifindex)?;
        tunnel_next_hop.set_gateway(IpAddr::V4(TUNNEL_GATEWAY))?;

        let mut tunnel_route_service =
            RtnlRoute::new_to(IpAddr::V4(TUNNEL_SERVICE_TARGET.0), TUNNEL_SERVICE_TARGET.1)?;
        tunnel_route_service.set_pref_src(IpAddr::V4(TUNNEL_SELF))?;
        let mut tunnel_route_ops =
            RtnlRoute::new_to(IpAddr::V4(TUNNEL_OPS_NETWORK.0), TUNNEL_OPS_NETWORK.1)?;
        tunnel_route_ops.set_pref_src(IpAddr::V4(TUNNEL_SELF))?;

        info!(log, "HNM initialized"; "wwan_ifindex" => wwan_ifindex, "tunnel_ifindex" => tunnel_ifindex);

        Ok(Self {
            log,
            wwan_name: wwan_name.to_string(),
            tunnel_name: tunnel_name.to_string(),
            wwan_ifindex,
            tunnel_ifindex,
            tunnel_route_ops,
            tunnel_route_service,
            tunnel_next_hop,
            addr_v6,
            addr_v4,
            route_v6_default,
            route_v4_default,
            wwan_next_hop,
            addr_filter,
            addr_cache,
            link_cache_v6,
            link_cache_v4,
            sock,
        })
    }

    /// Refreshes both link caches, re-resolves both links by name, and
    /// re-pins the filter and wwan next-hop to the (possibly new) ifindex.
    /// Fails if either interface disappeared or the families' ifindices
    /// diverge.
    pub fn reload_link_cache(&mut self) -> Result<()> {
        self.link_cache_v4 = RtnlLinkCache::new(&self.sock)?;
        self.link_cache_v6 = RtnlLinkCache::new(&self.sock)?;

        let wwan_v4 = self
            .link_cache_v4
            .find_by_name(&self.wwan_name)
            .ok_or(Error::LinkNotFound("wwan"))?
            .index();
        let wwan_v6 = self
            .link_cache_v6
            .find_by_name(&self.wwan_name)
            .ok_or(Error::LinkNotFound("wwan"))?
            .index();
        if wwan_v4 != wwan_v6 {
            return Err(Error::IfindexDivergence { v4: wwan_v4, v6: wwan_v6 });
        }
        self.tunnel_ifindex = self
            .link_cache_v4
            .find_by_name(&self.tunnel_name)
            .ok_or(Error::LinkNotFound("tunnel"))?
            .index();

        if wwan_v4 != self.wwan_ifindex {
            debug!(self.log, "wwan ifindex changed, re-pinning filter and next-hop";
                "old" => self.wwan_ifindex, "new" => wwan_v4);
            self.wwan_ifindex = wwan_v4;
            self.addr_filter.rebind(self.wwan_ifindex);
            self.wwan_next_hop.rebind_ifindex(self.wwan_ifindex);
        }
        self.tunnel_next_hop.rebind_ifindex(self.tunnel_ifindex);
        Ok(())
    }

    pub fn reload_address_cache(&mut self) -> Result<()> {
        self.addr_cache.reload(&self.sock)?;
        Ok(())
    }

    /// Read-modify-write: a no-op if the link's current up-bit already
    /// matches `up` (Testable Property 6).
    pub fn ensure_interface_state(&self, link: Link, up: bool) -> Result<()> {
        let name = match link {
            Link::Wwan => &self.wwan_name,
            Link::Tunnel => &self.tunnel_name,
        };
        let cached = self
            .link_cache_v4
            .find_by_name(name)
            .ok_or(Error::LinkNotFound(link.label()))?;
        if cached.is_up() == up {
            return Ok(());
        }
        if up {
            cached.set_up(&self.sock)?;
        } else {
            cached.set_down(&self.sock)?;
        }
        Ok(())
    }

    pub fn add_v4_address(&mut self, addr: Ipv4Addr, prefix: u8) -> Result<()> {
        self.addr_v4.set(self.wwan_ifindex, IpAddr::V4(addr), prefix)?;
        self.addr_v4.add(&self.sock)?;
        Ok(())
    }

    pub fn add_v6_address(&mut self, addr: Ipv6Addr, prefix: u8) -> Result<()> {
        self.addr_v6.set(self.wwan_ifindex, IpAddr::V6(addr), prefix)?;
        self.addr_v6.add(&self.sock)?;
        Ok(())
    }

    /// Attaches the shared wwan next-hop (bearing `gateway`) to the
    /// preallocated v4 default route, submits a create-or-replace, then
    /// detaches it — `submit_with_nexthop` handles the transient
    /// attach/detach so the next-hop's reference count is zero at rest.
    pub fn change_v4_default_gateway(&mut self, gateway: Ipv4Addr) -> Result<()> {
        self.wwan_next_hop.set_gateway(IpAddr::V4(gateway))?;
        self.route_v4_default
            .submit_with_nexthop(&self.sock, &self.wwan_next_hop)?;
        Ok(())
    }

    /// `prefix` is the gateway's own prefix length as reported by WDS
    /// runtime settings; the default route's destination is always `::/0`
    /// regardless, so `prefix` here is accepted for parity with callers
    /// that pass the same `RuntimeSettings` fields through uniformly, and
    /// logged for diagnostics rather than applied to the route itself.
    pub fn change_v6_default_gateway(&mut self, gateway: Ipv6Addr, prefix: u8) -> Result<()> {
        debug!(self.log, "v6 default gateway change"; "gateway" => %gateway, "gateway_prefix" => prefix);
        self.wwan_next_hop.set_gateway(IpAddr::V6(gateway))?;
        self.route_v6_default
            .submit_with_nexthop(&self.sock, &self.wwan_next_hop)?;
        Ok(())
    }

    /// Reload address cache, enumerate non-link-scope v4 addresses on the
    /// wwan interface, delete every one not equal to `(addr, prefix)`, add
    /// the target if it was absent, then install the default route.
    /// Enumeration-buffer overflow (capacity 126) propagates as a fatal
    /// `Error::Netlink` for this iteration rather than silently truncating.
    pub fn ensure_v4_configuration_is_applied(
        &mut self,
        addr: Ipv4Addr,
        prefix: u8,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        self.reload_address_cache()?;

        let mut buf: [Option<CachedAddress>; ADDRESS_ENUMERATION_CAPACITY] =
            [None; ADDRESS_ENUMERATION_CAPACITY];
        let n = self.addr_cache.addresses_on(self.wwan_ifindex, None, &mut buf)?;

        let target = IpAddr::V4(addr);
        let mut found = false;
        for entry in buf.iter().take(n).flatten() {
            if !self.addr_filter.matches(entry) || entry.addr.is_ipv6() {
                continue;
            }
            if entry.addr == target && entry.prefix_len == prefix {
                found = true;
                continue;
            }
            debug!(self.log, "deleting stale v4 address"; "addr" => %entry.addr, "prefix" => entry.prefix_len);
            netlink::delete_address(&self.sock, self.wwan_ifindex, entry.addr, entry.prefix_len)?;
        }

        if !found {
            self.add_v4_address(addr, prefix)?;
        }
        self.change_v4_default_gateway(gateway)?;
        Ok(())
    }

    /// Reload address cache, collect non-link-scope addresses for both
    /// families on the wwan interface, delete all.
    pub fn flush_addresses(&mut self) -> Result<()> {
        self.reload_address_cache()?;
        let mut buf: [Option<CachedAddress>; ADDRESS_ENUMERATION_CAPACITY] =
            [None; ADDRESS_ENUMERATION_CAPACITY];
        let n = self.addr_cache.addresses_on(self.wwan_ifindex, None, &mut buf)?;
        for entry in buf.iter().take(n).flatten() {
            if !self.addr_filter.matches(entry) {
                continue;
            }
            netlink::delete_address(&self.sock, self.wwan_ifindex, entry.addr, entry.prefix_len)?;
        }
        Ok(())
    }

    /// Installs the two static tunnel routes via gateway `10.10.1.1` out of
    /// the tunnel link with preferred source `10.10.1.2`. Both use
    /// create-or-replace against preallocated route objects whose
    /// destination and preferred source were fixed once at `initialize`.
    pub fn ensure_tunnel_routes(&mut self) -> Result<()> {
        self.tunnel_route_service
            .submit_with_nexthop(&self.sock, &self.tunnel_next_hop)?;
        self.tunnel_route_ops
            .submit_with_nexthop(&self.sock, &self.tunnel_next_hop)?;
        info!(self.log, "tunnel routes installed");
        Ok(())
    }

    /// Idempotent: dropping `self` releases every netlink object in
    /// reverse-acquisition order via field declaration order (see struct
    /// doc comment); this method exists so callers have an explicit,
    /// named point in the Supervisor's teardown sequence to call rather
    /// than relying on scope exit, matching spec's named `Shutdown` op.
    pub fn shutdown(self) {
        info!(self.log, "HNM shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_labels_are_stable() {
        assert_eq!(Link::Wwan.label(), "wwan");
        assert_eq!(Link::Tunnel.label(), "tunnel");
    }

    #[test]
    fn test_tunnel_addressing_matches_spec_constants() {
        assert_eq!(TUNNEL_GATEWAY, Ipv4Addr::new(10, 10, 1, 1));
        assert_eq!(TUNNEL_SELF, Ipv4Addr::new(10, 10, 1, 2));
        assert_eq!(TUNNEL_SERVICE_TARGET, (Ipv4Addr::new(10, 10, 2, 2), 32));
        assert_eq!(TUNNEL_OPS_NETWORK, (Ipv4Addr::new(10, 10, 3, 0), 24));
    }
}
