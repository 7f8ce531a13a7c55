/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::ffi::CStr;

use anyhow::{bail, Context, Result};
use derive_more::Display;
use num_derive::{FromPrimitive, ToPrimitive};

use crate::ffi::{
    nl_close, nl_connect, nl_geterror, nl_sock, nl_socket_alloc, nl_socket_free, NETLINK_ROUTE,
    NETLINK_XFRM,
};

/// Format an error message from a failed `libnl` call.
pub(crate) fn nlerrmsg(err: i32, msg: &str) -> String {
    format!("{}: {}", msg, unsafe {
        CStr::from_ptr(nl_geterror(err)).to_string_lossy()
    })
}

/// Management protocols supported by this wrapper.
#[derive(Clone, Copy, FromPrimitive, ToPrimitive, Display)]
#[repr(i32)]
pub(crate) enum NlProtocols {
    Route = NETLINK_ROUTE,
    IPsec = NETLINK_XFRM,
    Invalid = -1,
}

// Underlying socket structure used for all netlink(3) operations.
pub(crate) struct NlSocket(
    // WARNING: do not add Clone/Copy support, this references a dynamically
    // allocated C structure.
    *mut nl_sock,
);

impl NlSocket {
    /// Allocate a new (unconnected) netlink socket. Must be `connect()`ed
    /// before use.
    pub(crate) fn new() -> Result<Self> {
        let ns_socket = unsafe { nl_socket_alloc() };
        match ns_socket.is_null() {
            true => bail!("nl_socket_alloc() failed"),
            false => Ok(Self(ns_socket)),
        }
    }

    /// Connect to a specific netlink management protocol. A connection is
    /// required for all netlink(3) operations.
    pub(crate) fn connect(self, protocol: NlProtocols) -> Result<NlConnectedSocket> {
        let nlerr = unsafe { nl_connect(self.0, protocol as i32) };
        if nlerr != 0 {
            let msg = format!("nl_connect() failed for protocol: {}", protocol);
            bail!(nlerrmsg(nlerr, &msg));
        }
        Ok(NlConnectedSocket(self))
    }

    pub(crate) fn nl_sock(&self) -> &*mut nl_sock {
        &self.0
    }
}

impl Drop for NlSocket {
    fn drop(&mut self) {
        unsafe { nl_socket_free(self.0) };
    }
}

pub(crate) struct NlConnectedSocket(NlSocket);

impl NlConnectedSocket {
    pub(crate) fn nl_sock(&self) -> &*mut nl_sock {
        self.0.nl_sock()
    }
}

impl Drop for NlConnectedSocket {
    fn drop(&mut self) {
        unsafe { nl_close(*self.nl_sock()) };
    }
}

/// Netlink routing query and management socket. Mirrors the one-socket
/// handle the supervisor's `HostNetworkState` holds: every link/address/
/// route/nexthop operation in this crate takes a `&NlRoutingSocket`.
pub struct NlRoutingSocket(pub(crate) NlConnectedSocket);

impl NlRoutingSocket {
    pub fn new() -> Result<Self> {
        let sock = NlSocket::new().context("Failed to create netlink routing socket.")?;
        let connected_sock = sock
            .connect(NlProtocols::Route)
            .context("Failed to create netlink routing socket.")?;
        Ok(Self(connected_sock))
    }

    pub(crate) fn nl_sock(&self) -> &*mut nl_sock {
        self.0.nl_sock()
    }
}
