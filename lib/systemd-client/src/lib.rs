/*
 * Copyright (c) Meta Platforms, Inc. and its affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A deliberately narrow client for `org.freedesktop.systemd1.Manager`:
//! just `StartUnit`/`StopUnit` with `replace` conflict resolution, the only
//! two calls this daemon ever needs. `metalos/lib/systemd` wraps the whole
//! `Manager` interface (enable/disable, transient units, job tracking,
//! `SystemState` polling) behind an async `zbus::dbus_proxy`-generated
//! trait; this crate keeps that file's `DbusService<T>`-style
//! connect-with-retry wrapper but drops everything this daemon never calls,
//! and talks to the bus synchronously (`zbus::blocking`) since the
//! supervisor has no async runtime of its own — one main thread plus raw
//! OS threads, no executor.

use std::time::Duration;

use slog::{debug, Logger};
use thiserror::Error;
use zbus::blocking::Connection;
use zvariant::OwnedObjectPath;

const DESTINATION: &str = "org.freedesktop.systemd1";
const OBJECT_PATH: &str = "/org/freedesktop/systemd1";
const INTERFACE: &str = "org.freedesktop.systemd1.Manager";

/// `StartUnit`/`StopUnit`'s `mode` argument. Only `replace` is used by this
/// daemon, but the type carries the other values systemd accepts so a
/// future caller can't silently pass an invalid string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    Replace,
    Fail,
    Isolate,
    IgnoreDependencies,
    IgnoreRequirements,
}

impl JobMode {
    fn as_str(self) -> &'static str {
        match self {
            JobMode::Replace => "replace",
            JobMode::Fail => "fail",
            JobMode::Isolate => "isolate",
            JobMode::IgnoreDependencies => "ignore-dependencies",
            JobMode::IgnoreRequirements => "ignore-requirements",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to connect to the system bus")]
    Connect(#[source] zbus::Error),
    #[error("StartUnit/StopUnit call failed for unit {unit}")]
    Call {
        unit: String,
        #[source]
        source: zbus::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Connection options, mirroring `metalos/lib/systemd::ConnectOpts` (a
/// bounded connect retry loop, since `dbus-daemon` may not be listening yet
/// this early in boot).
#[derive(Debug, Clone)]
pub struct ConnectOpts {
    pub connection_timeout: Duration,
    pub retry_interval: Duration,
}

impl Default for ConnectOpts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            retry_interval: Duration::from_millis(50),
        }
    }
}

/// A connected handle to the systemd manager bus.
pub struct SystemdManager {
    log: Logger,
    connection: Connection,
}

impl SystemdManager {
    pub fn connect(log: Logger) -> Result<Self> {
        Self::connect_with_opts(log, ConnectOpts::default())
    }

    pub fn connect_with_opts(log: Logger, opts: ConnectOpts) -> Result<Self> {
        let deadline = std::time::Instant::now() + opts.connection_timeout;
        let mut last_err = None;
        loop {
            match Connection::system() {
                Ok(connection) => return Ok(Self { log, connection }),
                Err(e) => {
                    last_err = Some(e);
                    if std::time::Instant::now() >= deadline {
                        return Err(Error::Connect(last_err.unwrap()));
                    }
                    std::thread::sleep(opts.retry_interval);
                }
            }
        }
    }

    /// `StartUnit(name, mode)`. Returns the job object path systemd
    /// enqueued; the supervisor does not track job completion, so the path
    /// is discarded by every caller but kept in the return type for parity
    /// with the real method signature.
    pub fn start_unit(&self, unit: &str, mode: JobMode) -> Result<OwnedObjectPath> {
        self.call("StartUnit", unit, mode)
    }

    pub fn stop_unit(&self, unit: &str, mode: JobMode) -> Result<OwnedObjectPath> {
        self.call("StopUnit", unit, mode)
    }

    fn call(&self, method: &str, unit: &str, mode: JobMode) -> Result<OwnedObjectPath> {
        debug!(self.log, "systemd1 call"; "method" => method, "unit" => unit, "mode" => mode.as_str());
        let reply = self
            .connection
            .call_method(
                Some(DESTINATION),
                OBJECT_PATH,
                Some(INTERFACE),
                method,
                &(unit, mode.as_str()),
            )
            .map_err(|source| Error::Call {
                unit: unit.to_string(),
                source,
            })?;
        reply.body::<OwnedObjectPath>().map_err(|source| Error::Call {
            unit: unit.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_mode_wire_strings() {
        assert_eq!(JobMode::Replace.as_str(), "replace");
        assert_eq!(JobMode::Fail.as_str(), "fail");
    }
}
