//! The Phase A/B/C/D state machine (spec §4.6), written entirely against
//! `Collaborators` so it runs identically over `RealCollaborators` and the
//! fakes in `tests/scenarios.rs`. Naming follows the source's own renaming
//! note: what the source calls `initialize` is really the outer loop body,
//! so it's named `run_iteration` here instead.

use dms::OperatingMode;
use hnm::Link;
use sbc::Verb;
use slog::{error, info, warn, Logger};
use wds::Family;

use crate::collaborators::Collaborators;
use crate::config;
use crate::error::{Result, SupervisorError};

/// Phase A (one-shot) followed by Phase B until `exit_requested`.
pub fn run<C: Collaborators>(c: &mut C, log: &Logger) -> Result<()> {
    prelude(c, log)?;

    while !c.exit_requested() {
        if let Err(e) = run_iteration(c, log) {
            warn!(log, "phase B iteration ended with a session-layer fault, will retry"; "error" => %e);
        }
        if c.exit_requested() {
            break;
        }
        info!(log, "backing off before next outer-loop iteration");
        c.sleep_backoff();
    }

    info!(log, "supervisor exiting");
    Ok(())
}

/// Phase A: tunnel link down, autoconnect disabled on both families. A
/// failure here is unrecoverable — the daemon never got far enough to
/// enter the outer loop at all.
fn prelude<C: Collaborators>(c: &mut C, log: &Logger) -> Result<()> {
    info!(log, "phase A: prelude");
    c.ensure_interface_state(Link::Tunnel, false)?;
    for family in [Family::V6, Family::V4] {
        c.wds_attach(family)?;
        let result = c.wds_configure_autoconnect(family);
        let detach_result = c.wds_detach(family);
        result?;
        detach_result?;
    }
    Ok(())
}

/// One complete Phase B iteration. Returns `Err` for a session-layer fault
/// that Phase B should simply retry after backing off; host-layer faults
/// are promoted to `exit_requested` via `host_op` as they're hit, so the
/// outer loop in `run` will not sleep-and-retry after this returns.
fn run_iteration<C: Collaborators>(c: &mut C, log: &Logger) -> Result<()> {
    info!(log, "phase B: iteration start");

    host_op(c, log, "reload link cache", |c| c.reload_link_cache())?;
    host_op(c, log, "stop chrony", |c| c.manage_service(Verb::Stop, config::CHRONY_UNIT))?;
    host_op(c, log, "stop unbound", |c| c.manage_service(Verb::Stop, config::UNBOUND_UNIT))?;
    host_op(c, log, "bring wwan up", |c| c.ensure_interface_state(Link::Wwan, true))?;
    host_op(c, log, "flush wwan addresses", |c| c.flush_wwan_addresses())?;

    let bring_up_result = bring_up_and_monitor(c, log);
    if let Err(ref e) = bring_up_result {
        warn!(log, "bring-up/monitor ended"; "error" => %e);
    }

    let deallocate_cache = c.exit_requested();
    if let Err(e) = c.dms_detach(deallocate_cache) {
        warn!(log, "DMS detach failed, continuing teardown"; "error" => %e);
    }

    teardown_host_state(c, log);

    if let Err(e) = c.manage_service(Verb::Stop, config::CHRONY_UNIT) {
        error!(log, "failed to stop chrony during teardown, forcing exit"; "error" => %e);
        c.request_exit();
    }
    if let Err(e) = c.manage_service(Verb::Stop, config::UNBOUND_UNIT) {
        error!(log, "failed to stop unbound during teardown, forcing exit"; "error" => %e);
        c.request_exit();
    }

    bring_up_result
}

/// DMS attach/online, then Phase C. The hardware-locked / mode-mismatch
/// case is a local decision to abort this iteration (spec S4): it is
/// **not** promoted to `exit_requested` even though DMS sits alongside the
/// other "local/infrastructural" failures in spec's fault classification —
/// `dms::DmsState::set_power` itself never errors on a hardware lock, it
/// just returns the current mode, so there is nothing to promote.
fn bring_up_and_monitor<C: Collaborators>(c: &mut C, log: &Logger) -> Result<()> {
    c.dms_attach()?;
    let mode = c.dms_set_power(OperatingMode::Online)?;
    if mode != OperatingMode::Online {
        warn!(log, "modem did not reach online mode, aborting this iteration";
            "observed" => ?mode);
        return Err(SupervisorError::ModeRefused {
            requested: OperatingMode::Online,
            observed: mode,
        });
    }
    info!(log, "DMS online");
    phase_c_v6(c, log)
}

/// Phase C outer half: v6 session. Symmetric stop-then-detach runs
/// regardless of how bring-up below it went, satisfying the "stop before
/// detach whenever a session may have started" invariant without this
/// function needing to track whether `start_data_session` actually
/// succeeded (`wds::WdsSession::stop_data_session` is already a no-op when
/// no session is outstanding). `apply_v6_settings` failing is a netlink
/// fault, not a radio/session one, so it forces `exit_requested` the same
/// way `host_op` does for Phase B's own steps.
fn phase_c_v6<C: Collaborators>(c: &mut C, log: &Logger) -> Result<()> {
    info!(log, "phase C: v6 session bring-up");
    c.wds_attach(Family::V6)?;

    let result = (|| -> Result<()> {
        c.wds_set_ip_family_preference(Family::V6)?;
        let outcome = c.wds_start(Family::V6)?;
        log_start_diagnostics(log, Family::V6, &outcome);
        let settings = c.wds_runtime_settings(Family::V6)?;
        if let Err(e) = c.apply_v6_settings(settings) {
            error!(log, "failed to apply v6 address/route configuration, forcing exit"; "error" => %e);
            c.request_exit();
            return Err(e);
        }
        phase_c_v4(c, log)
    })();

    let stop_result = c.wds_stop(Family::V6);
    let detach_result = c.wds_detach(Family::V6);
    result.and(stop_result).and(detach_result)
}

/// Phase C inner half: v4 session, recursed into only after v6 succeeded.
/// On success, continues into the tunnel bring-up and Phase D monitor.
fn phase_c_v4<C: Collaborators>(c: &mut C, log: &Logger) -> Result<()> {
    info!(log, "phase C: v4 session bring-up");
    c.wds_attach(Family::V4)?;

    let result = (|| -> Result<()> {
        c.wds_set_ip_family_preference(Family::V4)?;
        let outcome = c.wds_start(Family::V4)?;
        log_start_diagnostics(log, Family::V4, &outcome);
        let settings = c.wds_runtime_settings(Family::V4)?;
        if let Err(e) = c.apply_v4_settings(settings) {
            error!(log, "failed to apply v4 address/route configuration, forcing exit"; "error" => %e);
            c.request_exit();
            return Err(e);
        }
        bring_up_tunnel_and_monitor(c, log)
    })();

    let stop_result = c.wds_stop(Family::V4);
    let detach_result = c.wds_detach(Family::V4);
    result.and(stop_result).and(detach_result)
}

/// `start(unbound) → wg setconf → tunnel up → tunnel routes → start(chrony)
/// → monitor`. The tunnel path (setconf, tunnel up, routes) is allowed to
/// fail without forcing `exit_requested` — Phase B's retry may simply find
/// a healthier link; `unbound`/`chrony` failures here are service-bus
/// failures and do force it, per spec's fault classification.
fn bring_up_tunnel_and_monitor<C: Collaborators>(c: &mut C, log: &Logger) -> Result<()> {
    if let Err(e) = c.manage_service(Verb::Start, config::UNBOUND_UNIT) {
        error!(log, "failed to start unbound, forcing exit"; "error" => %e);
        c.request_exit();
        return Err(e);
    }

    if let Err(e) = c.run_tunnel_config() {
        warn!(log, "tunnel configuration subprocess failed, will retry"; "error" => %e);
        return Err(e);
    }
    if let Err(e) = c.ensure_interface_state(Link::Tunnel, true) {
        warn!(log, "failed to bring tunnel link up, will retry"; "error" => %e);
        return Err(e);
    }
    if let Err(e) = c.ensure_tunnel_routes() {
        warn!(log, "failed to install tunnel routes, will retry"; "error" => %e);
        return Err(e);
    }

    if let Err(e) = c.manage_service(Verb::Start, config::CHRONY_UNIT) {
        error!(log, "failed to start chrony, forcing exit"; "error" => %e);
        c.request_exit();
        return Err(e);
    }

    monitor(c, log);
    Ok(())
}

/// Phase D: sleep in one-second quanta until exit is requested or either
/// session's indication callback has flagged teardown.
fn monitor<C: Collaborators>(c: &mut C, log: &Logger) {
    info!(log, "phase D: monitoring");
    while !c.exit_requested() && !c.wds_teardown_requested(Family::V4) && !c.wds_teardown_requested(Family::V6) {
        c.sleep_monitor_tick();
    }
    info!(log, "phase D: teardown triggered, unwinding");
}

fn log_start_diagnostics(log: &Logger, family: Family, outcome: &wds::StartDataSessionOutcome) {
    if outcome.call_end_reason.is_some() || outcome.verbose_call_end_reason.is_some() {
        info!(log, "start-session succeeded with diagnostic fields present";
            "family" => ?family,
            "session_id" => outcome.session_id,
            "call_end_reason" => ?outcome.call_end_reason,
            "verbose_call_end_reason" => ?outcome.verbose_call_end_reason);
    }
}

/// Runs a host-layer operation that, on failure, both forces
/// `exit_requested` and aborts the rest of the current sequence (used only
/// where nothing has been acquired yet that would need unwinding).
fn host_op<C: Collaborators>(
    c: &mut C,
    log: &Logger,
    what: &'static str,
    op: impl FnOnce(&mut C) -> Result<()>,
) -> Result<()> {
    if let Err(e) = op(c) {
        error!(log, "host-layer operation failed, forcing exit"; "operation" => what, "error" => %e);
        c.request_exit();
        return Err(e);
    }
    Ok(())
}

/// Step 7 of Phase B: reload the link cache, bring both links down. Every
/// step is attempted regardless of an earlier one failing — this is
/// best-effort teardown, not a sequence that should stop partway through.
fn teardown_host_state<C: Collaborators>(c: &mut C, log: &Logger) {
    if let Err(e) = c.reload_link_cache() {
        error!(log, "link cache reload failed during teardown, forcing exit"; "error" => %e);
        c.request_exit();
    }
    if let Err(e) = c.ensure_interface_state(Link::Wwan, false) {
        error!(log, "failed to bring wwan down during teardown, forcing exit"; "error" => %e);
        c.request_exit();
    }
    if let Err(e) = c.ensure_interface_state(Link::Tunnel, false) {
        error!(log, "failed to bring tunnel down during teardown, forcing exit"; "error" => %e);
        c.request_exit();
    }
}
