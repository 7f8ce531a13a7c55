/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Thin `libnl`/`libnl-route` wrapper covering exactly the link, address,
//! route, and nexthop operations the Host Network Manager needs: link
//! up/down, address add/enumerate/delete, default-route and static-route
//! create-or-replace via a reusable next-hop.

mod addr;
mod ffi;
mod link;
mod nexthop;
mod route;
mod socket;

pub use addr::{delete_address, AddressFilter, CachedAddress, RtnlAddr, RtnlAddrCache};
pub use link::{RtnlCachedLink, RtnlCachedLinkTrait, RtnlLinkCache, RtnlLinkCommon};
pub use nexthop::RtnlNextHop;
pub use route::{Family, RtnlRoute};
pub use socket::NlRoutingSocket;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_no_connect_nlsocket() {
        NlRoutingSocket::new().expect("routing socket should allocate even without a running netlink stack in most test sandboxes to at least construct");
    }

    #[test]
    fn test_preallocated_addr_rewrite_is_idempotent() {
        // Rewriting the same preallocated RtnlAddr twice with different
        // values must not leak the previous `nl_addr`; this exercises the
        // `nl_addr_put` on every `set()` call rather than only on drop.
        let mut a = RtnlAddr::new().expect("rtnl_addr_alloc");
        a.set(1, Ipv4Addr::new(10, 10, 1, 2).into(), 32)
            .expect("first set");
        a.set(1, Ipv4Addr::new(10, 10, 2, 2).into(), 32)
            .expect("second set");
    }

    #[test]
    fn test_address_filter_excludes_link_scope() {
        let mut filter = AddressFilter::new(7);
        let universe = CachedAddress {
            ifindex: 7,
            addr: Ipv4Addr::new(10, 0, 0, 1).into(),
            prefix_len: 24,
            scope_is_link: false,
        };
        let link_scope = CachedAddress {
            scope_is_link: true,
            ..universe
        };
        assert!(filter.matches(&universe));
        assert!(!filter.matches(&link_scope));

        filter.rebind(9);
        assert!(!filter.matches(&universe));
    }
}
