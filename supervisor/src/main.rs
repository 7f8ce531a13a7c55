//! Entry point: builds the logger, registers the shutdown signal, wires up
//! `RealCollaborators`, and runs the Phase A–D state machine to
//! completion. Mirrors `metalinit`'s `main` (logger construction, a single
//! `AtomicBool` flipped by `signal_hook::flag::register`, one call into
//! the real work) rather than `metald`'s tokio/thrift server shell, since
//! this daemon has no async runtime or RPC surface of its own.

use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use slog::{error, o, Drain, Logger};
use supervisor::{phases, RealCollaborators};

fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("daemon" => "cellular-tunnel-supervisor"))
}

fn register_shutdown_signals(exit_requested: &Arc<AtomicBool>) -> anyhow::Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(exit_requested))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(exit_requested))?;
    Ok(())
}

fn main() -> ExitCode {
    let log = build_logger();
    let exit_requested = Arc::new(AtomicBool::new(false));

    if let Err(e) = register_shutdown_signals(&exit_requested) {
        error!(log, "failed to register shutdown signal handlers"; "error" => %e);
        return ExitCode::FAILURE;
    }

    let mut collaborators = match RealCollaborators::new(log.clone(), Arc::clone(&exit_requested)) {
        Ok(c) => c,
        Err(e) => {
            error!(log, "failed to initialize collaborators"; "error" => %e);
            return ExitCode::FAILURE;
        }
    };

    match phases::run(&mut collaborators, &log) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(log, "supervisor exited with an unrecoverable fault"; "error" => %e);
            ExitCode::FAILURE
        }
    }
}
