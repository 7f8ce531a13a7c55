/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::ffi::{CStr, CString};
use std::fmt;
use std::marker::PhantomData;

use anyhow::{Error, Result};
use bitflags::bitflags;

use crate::ffi::{
    nl_addr2str, nl_cache, nl_cache_get_first, nl_cache_get_next, nl_cache_put, rtnl_link,
    rtnl_link_alloc, rtnl_link_alloc_cache, rtnl_link_change, rtnl_link_get_addr,
    rtnl_link_get_flags, rtnl_link_get_ifindex, rtnl_link_get_name, rtnl_link_put,
    rtnl_link_set_flags, rtnl_link_set_name, rtnl_link_unset_flags, AF_UNSPEC, IFF_UP,
};
use crate::socket::{nlerrmsg, NlRoutingSocket};

bitflags! {
    /// State flags associated with an `rtnl_link`.
    pub struct RtnlLinkFlags: u32 {
        const UP = IFF_UP;
    }
}

mod private {
    pub trait Sealed {}
    impl Sealed for super::RtnlLink {}
    impl<'cache> Sealed for super::RtnlCachedLink<'cache> {}
}

/// Sealed trait for accessing `rtnl_link` pointers. Kept sealed so callers
/// can't fabricate a link handle that doesn't own (or borrow from a cache
/// that owns) a real `rtnl_link`.
pub trait RtnlLinkPrivate: private::Sealed {
    #[doc(hidden)]
    fn rl_link(&self) -> &*mut rtnl_link;

    #[doc(hidden)]
    fn get_flags(&self) -> RtnlLinkFlags {
        RtnlLinkFlags::from_bits_truncate(unsafe { rtnl_link_get_flags(*self.rl_link()) })
    }
}

/// Public accessors common to both a freshly allocated link and one
/// borrowed from a cache.
pub trait RtnlLinkCommon {
    fn index(&self) -> i32;
    fn name(&self) -> Option<String>;
    fn mac_addr(&self) -> Option<String>;
    fn is_up(&self) -> bool;
    fn is_down(&self) -> bool {
        !self.is_up()
    }

    fn display(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link_name = self.name().unwrap_or_else(|| "<unknown>".to_string());
        let link_addr = self.mac_addr().unwrap_or_else(|| "<unknown>".to_string());
        write!(
            f,
            "{} (index: {}, addr: {})",
            link_name,
            self.index(),
            link_addr
        )
    }
}

impl<T: RtnlLinkPrivate> RtnlLinkCommon for T {
    fn index(&self) -> i32 {
        unsafe { rtnl_link_get_ifindex(*self.rl_link()) }
    }

    fn name(&self) -> Option<String> {
        let c_name = unsafe { rtnl_link_get_name(*self.rl_link()) };
        match c_name.is_null() {
            true => None,
            false => Some(unsafe { CStr::from_ptr(c_name).to_string_lossy().into_owned() }),
        }
    }

    fn mac_addr(&self) -> Option<String> {
        let c_addr = unsafe { rtnl_link_get_addr(*self.rl_link()) };
        let mut c_buf = [0i8; 32];
        let addr_cstr = unsafe {
            let c_buf_ptr = c_buf.as_mut_ptr();
            CStr::from_ptr(nl_addr2str(c_addr, c_buf_ptr, 24))
        };
        let addr_str = addr_cstr.to_str().ok()?.to_string();
        match addr_str.chars().count() == 17 {
            true => Some(addr_str),
            false => None,
        }
    }

    fn is_up(&self) -> bool {
        self.get_flags().contains(RtnlLinkFlags::UP)
    }
}

/// A dynamically allocated, not-yet-committed link, used only as the
/// "change" argument of an `rtnl_link_change` request.
struct RtnlLink(*mut rtnl_link);

impl RtnlLink {
    fn new() -> Result<Self> {
        let rl_link = unsafe { rtnl_link_alloc() };
        match rl_link.is_null() {
            true => anyhow::bail!("rtnl_link_alloc() failed"),
            false => Ok(Self(rl_link)),
        }
    }
}

impl Drop for RtnlLink {
    fn drop(&mut self) {
        unsafe { rtnl_link_put(self.0) };
    }
}

impl RtnlLinkPrivate for RtnlLink {
    fn rl_link(&self) -> &*mut rtnl_link {
        &self.0
    }
}

/// A link borrowed from an `RtnlLinkCache`; lifetime-bound to that cache.
pub struct RtnlCachedLink<'cache>(*mut rtnl_link, PhantomData<&'cache ()>);

impl<'cache> RtnlCachedLink<'cache> {
    fn update_flags(&self, sock: &NlRoutingSocket, flags: RtnlLinkFlags, set: bool) -> Result<()> {
        let op = if set { "set" } else { "clear" };
        let cmsg = format!(
            "Failed to {} link state flags {:#x} for link {}",
            op,
            flags.bits(),
            self
        );
        let change = RtnlLink::new().map_err(|e| e.context(cmsg.clone()))?;
        unsafe {
            if set {
                rtnl_link_set_flags(change.0, flags.bits());
            } else {
                rtnl_link_unset_flags(change.0, flags.bits());
            }
        }
        let nlerr = unsafe { rtnl_link_change(*sock.nl_sock(), self.0, change.0, 0) };
        if nlerr != 0 {
            return Err(Error::msg(nlerrmsg(nlerr, "rtnl_link_change() failed")).context(cmsg));
        }
        Ok(())
    }

    fn update_name(&self, sock: &NlRoutingSocket, name: &str) -> Result<()> {
        let cmsg = format!("Failed to change link name for {}", self);
        let change = RtnlLink::new().map_err(|e| e.context(cmsg.clone()))?;
        let c_name =
            CString::new(name.as_bytes()).expect("interface name must not contain NUL bytes");
        unsafe { rtnl_link_set_name(change.0, c_name.as_ptr()) };
        let nlerr = unsafe { rtnl_link_change(*sock.nl_sock(), self.0, change.0, 0) };
        if nlerr != 0 {
            return Err(Error::msg(nlerrmsg(nlerr, "rtnl_link_change() failed")).context(cmsg));
        }
        Ok(())
    }
}

impl<'cache> RtnlLinkPrivate for RtnlCachedLink<'cache> {
    fn rl_link(&self) -> &*mut rtnl_link {
        &self.0
    }
}

impl<'cache> fmt::Display for RtnlCachedLink<'cache> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.display(f)
    }
}

/// Read-modify-write interface state toggling, for `HNM::EnsureInterfaceState`.
/// `set_up`/`set_down` are idempotent at the call site (the caller checks
/// `is_up`/`is_down` first); this trait only issues the write.
pub trait RtnlCachedLinkTrait: RtnlLinkCommon {
    fn set_up(&self, sock: &NlRoutingSocket) -> Result<()>;
    fn set_down(&self, sock: &NlRoutingSocket) -> Result<()>;
    fn set_name(&self, sock: &NlRoutingSocket, name: &str) -> Result<()>;
}

impl<'cache> RtnlCachedLinkTrait for RtnlCachedLink<'cache> {
    fn set_up(&self, sock: &NlRoutingSocket) -> Result<()> {
        self.update_flags(sock, RtnlLinkFlags::UP, true)
    }

    fn set_down(&self, sock: &NlRoutingSocket) -> Result<()> {
        self.update_flags(sock, RtnlLinkFlags::UP, false)
    }

    fn set_name(&self, sock: &NlRoutingSocket, name: &str) -> Result<()> {
        self.update_name(sock, name)
    }
}

/// A netlink routing link cache for querying link information. Reloading
/// (`RtnlLinkCache::new` again) invalidates every `RtnlCachedLink` borrowed
/// from the old cache, matching `HNM::ReloadLinkCache`'s "re-resolve by
/// name" contract.
pub struct RtnlLinkCache<'a> {
    rlc_cache: *mut nl_cache,
    rlc_links: Vec<RtnlCachedLink<'a>>,
}

impl<'a> RtnlLinkCache<'a> {
    pub fn new(sock: &NlRoutingSocket) -> Result<Self> {
        let mut rlc_cache = std::ptr::null_mut();
        let family = AF_UNSPEC;
        let nlerr = unsafe { rtnl_link_alloc_cache(*sock.nl_sock(), family, &mut rlc_cache) };
        if nlerr != 0 {
            let msg = format!("rtnl_link_alloc_cache() failed for family: {}", family);
            return Err(Error::msg(nlerrmsg(nlerr, &msg)))
                .map_err(|e: Error| e.context("Failed to create netlink link cache"));
        }
        Ok(Self {
            rlc_cache,
            rlc_links: Self::get_links(rlc_cache),
        })
    }

    fn get_links(rlc_cache: *mut nl_cache) -> Vec<RtnlCachedLink<'a>> {
        let mut rlc_links = vec![];
        let mut i = unsafe { nl_cache_get_first(rlc_cache) };
        while !i.is_null() {
            rlc_links.push(RtnlCachedLink(i as *mut rtnl_link, PhantomData));
            i = unsafe { nl_cache_get_next(i) };
        }
        rlc_links
    }

    pub fn links(&self) -> &Vec<RtnlCachedLink<'a>> {
        &self.rlc_links
    }

    /// Find a link by name, the primary lookup `HNM::Initialize` performs
    /// for both the wwan and tunnel links.
    pub fn find_by_name(&self, name: &str) -> Option<&RtnlCachedLink<'a>> {
        self.rlc_links.iter().find(|l| l.name().as_deref() == Some(name))
    }
}

impl<'a> Drop for RtnlLinkCache<'a> {
    fn drop(&mut self) {
        unsafe { nl_cache_put(self.rlc_cache) };
    }
}
