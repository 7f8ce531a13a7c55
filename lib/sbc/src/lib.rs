//! Two host-side collaborators that have nothing in common except being
//! small enough not to deserve their own crate: a thin wrapper over
//! `systemd-client`'s `StartUnit`/`StopUnit` with the `replace` conflict
//! mode this daemon always uses, and a subprocess runner for the WireGuard
//! configuration binary.

mod error;

use std::path::Path;
use std::process::Command;

use slog::{debug, warn, Logger};
use systemd_client::{JobMode, SystemdManager};

pub use error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Start,
    Stop,
}

/// Connected handle to the system service-manager bus. One instance lives
/// for the life of the process; `ManageService` is the only operation
/// the Supervisor calls against it.
pub struct ServiceBusClient {
    log: Logger,
    manager: SystemdManager,
}

impl ServiceBusClient {
    pub fn connect(log: Logger) -> Result<Self> {
        let manager = SystemdManager::connect(log.clone())?;
        Ok(Self { log, manager })
    }

    /// Issues `StartUnit`/`StopUnit` against `unit` with `replace` conflict
    /// resolution (spec §6). The supervisor does not track the returned
    /// job path; a `HostFailure` on this call always forces
    /// `exit_requested` per spec's fault classification.
    pub fn manage_service(&self, verb: Verb, unit: &str) -> Result<()> {
        debug!(self.log, "managing service"; "verb" => ?verb, "unit" => unit);
        match verb {
            Verb::Start => {
                self.manager.start_unit(unit, JobMode::Replace)?;
            }
            Verb::Stop => {
                self.manager.stop_unit(unit, JobMode::Replace)?;
            }
        }
        Ok(())
    }
}

/// Invokes the WireGuard userspace configuration tool as a child process
/// and waits for it to exit.
pub struct TunnelConfigRunner {
    log: Logger,
    binary: String,
}

impl TunnelConfigRunner {
    pub fn new(log: Logger, binary: impl Into<String>) -> Self {
        Self { log, binary: binary.into() }
    }

    /// Runs `<binary> setconf <interface> <config_path>`, waits for exit,
    /// and treats abnormal termination (signal, no exit code) as failure
    /// alongside a nonzero exit code.
    pub fn run_tunnel_config(&self, interface: &str, config_path: &Path) -> Result<()> {
        debug!(self.log, "running tunnel config"; "binary" => &self.binary, "interface" => interface);
        let status = Command::new(&self.binary)
            .arg("setconf")
            .arg(interface)
            .arg(config_path)
            .status()
            .map_err(|source| Error::Spawn { binary: self.binary.clone(), source })?;

        if !status.success() {
            warn!(self.log, "tunnel config binary exited non-zero"; "status" => %status);
            return Err(Error::AbnormalExit { binary: self.binary.clone(), status });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_run_tunnel_config_reports_abnormal_exit() {
        let log = Logger::root(slog::Discard, slog::o!());
        let runner = TunnelConfigRunner::new(log, "/bin/false");
        let err = runner
            .run_tunnel_config("wg0", &PathBuf::from("/etc/wireguard/wireguard.conf"))
            .expect_err("/bin/false always exits nonzero");
        assert!(matches!(err, Error::AbnormalExit { .. }));
    }

    #[test]
    fn test_run_tunnel_config_spawn_failure_for_missing_binary() {
        let log = Logger::root(slog::Discard, slog::o!());
        let runner = TunnelConfigRunner::new(log, "/nonexistent/binary-sbc-test");
        let err = runner
            .run_tunnel_config("wg0", &PathBuf::from("/etc/wireguard/wireguard.conf"))
            .expect_err("binary does not exist");
        assert!(matches!(err, Error::Spawn { .. }));
    }
}
