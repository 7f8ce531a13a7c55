//! Raw `libnl` / `libnl-route` bindings.
//!
//! There is no published `netlink-sys`-equivalent crate for `libnl` itself
//! (unlike the in-tree crate `metalos/lib/netlink` links against), so the
//! handful of entry points this crate actually calls are declared here by
//! hand, the same way `metalos/lib/netlink` names them. Every type below is
//! an opaque pointer; all field access goes through the getter/setter
//! functions libnl exports, never direct struct layout.

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_void};

pub const AF_UNSPEC: c_int = 0;
pub const AF_INET: c_int = 2;
pub const AF_INET6: c_int = 10;

pub const IFF_UP: u32 = 0x1;

pub const NETLINK_ROUTE: c_int = 0;
pub const NETLINK_XFRM: c_int = 6;

pub const NLM_F_CREATE: c_int = 0x400;
pub const NLM_F_REPLACE: c_int = 0x100;
pub const NLM_F_EXCL: c_int = 0x200;

#[repr(C)]
pub struct nl_sock {
    _private: [u8; 0],
}
#[repr(C)]
pub struct nl_cache {
    _private: [u8; 0],
}
#[repr(C)]
pub struct nl_addr {
    _private: [u8; 0],
}
#[repr(C)]
pub struct rtnl_link {
    _private: [u8; 0],
}
#[repr(C)]
pub struct rtnl_addr {
    _private: [u8; 0],
}
#[repr(C)]
pub struct rtnl_route {
    _private: [u8; 0],
}
#[repr(C)]
pub struct rtnl_nexthop {
    _private: [u8; 0],
}

#[link(name = "nl-3")]
extern "C" {
    pub fn nl_socket_alloc() -> *mut nl_sock;
    pub fn nl_socket_free(sock: *mut nl_sock);
    pub fn nl_connect(sock: *mut nl_sock, protocol: c_int) -> c_int;
    pub fn nl_close(sock: *mut nl_sock);
    pub fn nl_geterror(err: c_int) -> *const c_char;

    pub fn nl_cache_get_first(cache: *mut nl_cache) -> *mut c_void;
    pub fn nl_cache_get_next(obj: *mut c_void) -> *mut c_void;
    pub fn nl_cache_put(cache: *mut nl_cache);
    pub fn nl_cache_refill(sock: *mut nl_sock, cache: *mut nl_cache) -> c_int;

    pub fn nl_addr_build(family: c_int, buf: *const c_void, size: usize) -> *mut nl_addr;
    pub fn nl_addr_put(addr: *mut nl_addr);
    pub fn nl_addr2str(addr: *const nl_addr, buf: *mut c_char, len: usize) -> *const c_char;
}

#[link(name = "nl-route-3")]
extern "C" {
    // Links
    pub fn rtnl_link_alloc() -> *mut rtnl_link;
    pub fn rtnl_link_put(link: *mut rtnl_link);
    pub fn rtnl_link_alloc_cache(
        sock: *mut nl_sock,
        family: c_int,
        result: *mut *mut nl_cache,
    ) -> c_int;
    pub fn rtnl_link_get_ifindex(link: *mut rtnl_link) -> c_int;
    pub fn rtnl_link_get_name(link: *mut rtnl_link) -> *const c_char;
    pub fn rtnl_link_get_addr(link: *mut rtnl_link) -> *mut nl_addr;
    pub fn rtnl_link_get_flags(link: *mut rtnl_link) -> u32;
    pub fn rtnl_link_set_flags(link: *mut rtnl_link, flags: u32);
    pub fn rtnl_link_unset_flags(link: *mut rtnl_link, flags: u32);
    pub fn rtnl_link_set_name(link: *mut rtnl_link, name: *const c_char);
    pub fn rtnl_link_change(
        sock: *mut nl_sock,
        orig: *mut rtnl_link,
        change: *mut rtnl_link,
        flags: c_int,
    ) -> c_int;

    // Addresses
    pub fn rtnl_addr_alloc() -> *mut rtnl_addr;
    pub fn rtnl_addr_put(addr: *mut rtnl_addr);
    pub fn rtnl_addr_alloc_cache(sock: *mut nl_sock, result: *mut *mut nl_cache) -> c_int;
    pub fn rtnl_addr_set_ifindex(addr: *mut rtnl_addr, ifindex: c_int);
    pub fn rtnl_addr_get_ifindex(addr: *mut rtnl_addr) -> c_int;
    pub fn rtnl_addr_set_family(addr: *mut rtnl_addr, family: c_int);
    pub fn rtnl_addr_set_local(addr: *mut rtnl_addr, local: *mut nl_addr) -> c_int;
    pub fn rtnl_addr_get_local(addr: *mut rtnl_addr) -> *mut nl_addr;
    pub fn rtnl_addr_set_prefixlen(addr: *mut rtnl_addr, prefixlen: c_int);
    pub fn rtnl_addr_get_prefixlen(addr: *mut rtnl_addr) -> c_int;
    pub fn rtnl_addr_get_scope(addr: *mut rtnl_addr) -> c_int;
    pub fn rtnl_addr_add(sock: *mut nl_sock, addr: *mut rtnl_addr, flags: c_int) -> c_int;
    pub fn rtnl_addr_delete(sock: *mut nl_sock, addr: *mut rtnl_addr, flags: c_int) -> c_int;

    // Routes
    pub fn rtnl_route_alloc() -> *mut rtnl_route;
    pub fn rtnl_route_put(route: *mut rtnl_route);
    pub fn rtnl_route_set_family(route: *mut rtnl_route, family: c_int);
    pub fn rtnl_route_set_dst(route: *mut rtnl_route, dst: *mut nl_addr) -> c_int;
    pub fn rtnl_route_set_pref_src(route: *mut rtnl_route, src: *mut nl_addr) -> c_int;
    pub fn rtnl_route_add_nexthop(route: *mut rtnl_route, nh: *mut rtnl_nexthop);
    pub fn rtnl_route_remove_nexthop(route: *mut rtnl_route, nh: *mut rtnl_nexthop);
    pub fn rtnl_route_add(sock: *mut nl_sock, route: *mut rtnl_route, flags: c_int) -> c_int;
    pub fn rtnl_route_delete(sock: *mut nl_sock, route: *mut rtnl_route, flags: c_int) -> c_int;

    // Nexthops
    pub fn rtnl_route_nh_alloc() -> *mut rtnl_nexthop;
    pub fn rtnl_route_nh_free(nh: *mut rtnl_nexthop);
    pub fn rtnl_route_nh_set_ifindex(nh: *mut rtnl_nexthop, ifindex: c_int);
    pub fn rtnl_route_nh_set_gateway(nh: *mut rtnl_nexthop, gw: *mut nl_addr);
}
