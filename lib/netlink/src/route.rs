/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::net::IpAddr;

use anyhow::{Error, Result};

use crate::addr::build_nl_addr;
use crate::ffi::{
    nl_addr_put, rtnl_route, rtnl_route_add, rtnl_route_add_nexthop, rtnl_route_alloc,
    rtnl_route_put, rtnl_route_remove_nexthop, rtnl_route_set_dst, rtnl_route_set_family,
    rtnl_route_set_pref_src, AF_INET, AF_INET6, NLM_F_CREATE, NLM_F_REPLACE,
};
use crate::nexthop::RtnlNextHop;
use crate::socket::{nlerrmsg, NlRoutingSocket};

/// A preallocated route object. HNM keeps one of these per family for the
/// default route, plus the tunnel route pair, and rewrites destination /
/// preferred-source in place before each `create_or_replace` submit, same
/// preallocation discipline as `RtnlAddr`.
pub struct RtnlRoute {
    ptr: *mut rtnl_route,
    family: i32,
}

impl RtnlRoute {
    /// A default route (destination `0.0.0.0/0` or `::/0`) for the given
    /// family.
    pub fn new_default(family: Family) -> Result<Self> {
        let mut route = Self::alloc(family)?;
        let (bytes, prefix): (&[u8], u8) = match family {
            Family::V4 => (&[0, 0, 0, 0], 0),
            Family::V6 => (&[0u8; 16], 0),
        };
        route.set_dst(bytes, prefix)?;
        Ok(route)
    }

    /// A specific-destination route, used for the two tunnel routes
    /// (`10.10.2.2/32`, `10.10.3.0/24`).
    pub fn new_to(dest: IpAddr, prefix_len: u8) -> Result<Self> {
        let family = match dest {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        };
        let mut route = Self::alloc(family)?;
        let bytes = match dest {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        route.set_dst(&bytes, prefix_len)?;
        Ok(route)
    }

    fn alloc(family: Family) -> Result<Self> {
        let ptr = unsafe { rtnl_route_alloc() };
        if ptr.is_null() {
            anyhow::bail!("rtnl_route_alloc() failed");
        }
        let raw_family = match family {
            Family::V4 => AF_INET,
            Family::V6 => AF_INET6,
        };
        unsafe { rtnl_route_set_family(ptr, raw_family) };
        Ok(Self { ptr, family: raw_family })
    }

    fn set_dst(&mut self, bytes: &[u8], prefix_len: u8) -> Result<()> {
        let nl_addr = build_nl_addr(self.family, bytes)?;
        let rc = unsafe { rtnl_route_set_dst(self.ptr, nl_addr) };
        unsafe { nl_addr_put(nl_addr) };
        if rc != 0 {
            anyhow::bail!("rtnl_route_set_dst() failed: {}", rc);
        }
        Ok(())
    }

    /// Set the route's preferred source address (used for the tunnel
    /// routes' `10.10.1.2` preferred source).
    pub fn set_pref_src(&mut self, src: IpAddr) -> Result<()> {
        let bytes = match src {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        let nl_addr = build_nl_addr(self.family, &bytes)?;
        let rc = unsafe { rtnl_route_set_pref_src(self.ptr, nl_addr) };
        unsafe { nl_addr_put(nl_addr) };
        if rc != 0 {
            anyhow::bail!("rtnl_route_set_pref_src() failed: {}", rc);
        }
        Ok(())
    }

    /// Attach `nh` for the duration of the closure, submit a
    /// create-or-replace, then detach `nh` regardless of outcome — this is
    /// the "transient attach" HNM's `ChangeV4DefaultGateway`/
    /// `ChangeV6DefaultGateway` rely on to keep the shared next-hop's
    /// reference count at zero at rest.
    pub fn submit_with_nexthop(&mut self, sock: &NlRoutingSocket, nh: &RtnlNextHop) -> Result<()> {
        unsafe { rtnl_route_add_nexthop(self.ptr, nh.as_ptr()) };
        let result = {
            let nlerr = unsafe {
                rtnl_route_add(*sock.nl_sock(), self.ptr, NLM_F_CREATE | NLM_F_REPLACE)
            };
            if nlerr != 0 {
                Err(Error::msg(nlerrmsg(nlerr, "rtnl_route_add() failed")))
            } else {
                Ok(())
            }
        };
        unsafe { rtnl_route_remove_nexthop(self.ptr, nh.as_ptr()) };
        result
    }
}

impl Drop for RtnlRoute {
    fn drop(&mut self) {
        unsafe { rtnl_route_put(self.ptr) };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}
