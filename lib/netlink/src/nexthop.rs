/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::net::IpAddr;

use anyhow::Result;

use crate::addr::build_nl_addr;
use crate::ffi::{
    rtnl_nexthop, rtnl_route_nh_alloc, rtnl_route_nh_free, rtnl_route_nh_set_gateway,
    rtnl_route_nh_set_ifindex, AF_INET, AF_INET6,
};

/// A single reusable `rtnl_nexthop` object, pinned once to the wwan
/// interface index, whose gateway is rewritten and attached to a route for
/// the duration of exactly one submit, then detached. This avoids the
/// reference-count bookkeeping of allocating a fresh next-hop per gateway
/// change while keeping the object itself dangling-attachment-free at
/// rest.
pub struct RtnlNextHop(*mut rtnl_nexthop);

impl RtnlNextHop {
    pub fn new(ifindex: i32) -> Result<Self> {
        let ptr = unsafe { rtnl_route_nh_alloc() };
        if ptr.is_null() {
            anyhow::bail!("rtnl_route_nh_alloc() failed");
        }
        unsafe { rtnl_route_nh_set_ifindex(ptr, ifindex) };
        Ok(Self(ptr))
    }

    /// Re-pin this next-hop to a (possibly new) wwan ifindex, e.g. after
    /// `HNM::ReloadLinkCache` observes the interface was recreated.
    pub fn rebind_ifindex(&mut self, ifindex: i32) {
        unsafe { rtnl_route_nh_set_ifindex(self.0, ifindex) };
    }

    /// Rewrite the gateway this next-hop points at.
    pub fn set_gateway(&mut self, gateway: IpAddr) -> Result<()> {
        let family = match gateway {
            IpAddr::V4(_) => AF_INET,
            IpAddr::V6(_) => AF_INET6,
        };
        let bytes = match gateway {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        let nl_addr = build_nl_addr(family, &bytes)?;
        unsafe {
            rtnl_route_nh_set_gateway(self.0, nl_addr);
            crate::ffi::nl_addr_put(nl_addr);
        }
        Ok(())
    }

    pub(crate) fn as_ptr(&self) -> *mut rtnl_nexthop {
        self.0
    }
}

impl Drop for RtnlNextHop {
    fn drop(&mut self) {
        unsafe { rtnl_route_nh_free(self.0) };
    }
}
