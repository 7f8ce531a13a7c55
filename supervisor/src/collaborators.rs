//! The seam the outer state machine is tested through, following the same
//! idiom `metalinit`'s `Bootloader` uses for mounting (`trait Mounter` +
//! `RealMounter`): one trait naming every side-effecting operation Phase
//! A–D issues, a `RealCollaborators` adapter composing the actual
//! `qmi`/`dms`/`wds`/`hnm`/`sbc` crates for production, and hand-written
//! fakes in `tests/scenarios.rs` that record call order and simulate
//! indications for the S1–S6 scenarios without touching a real modem,
//! kernel routing table, or system bus.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use dms::OperatingMode;
use hnm::{HostNetworkState, Link};
use qmi::Transport;
use sbc::{ServiceBusClient, TunnelConfigRunner, Verb};
use slog::Logger;
use wds::{AutoconnectSetting, Family, RoamSetting, RuntimeSettings, WdsSession};

use crate::config;
use crate::error::{Result, SupervisorError};

/// Every side-effecting operation the Supervisor's phases issue against the
/// outside world. Phase A–D (`crate::phases`) are written entirely in
/// terms of this trait so they can run against `RealCollaborators` in
/// production and a fake in tests.
pub trait Collaborators {
    fn reload_link_cache(&mut self) -> Result<()>;
    fn ensure_interface_state(&mut self, link: Link, up: bool) -> Result<()>;
    fn flush_wwan_addresses(&mut self) -> Result<()>;

    fn manage_service(&mut self, verb: Verb, unit: &'static str) -> Result<()>;
    fn run_tunnel_config(&mut self) -> Result<()>;
    fn ensure_tunnel_routes(&mut self) -> Result<()>;

    fn dms_attach(&mut self) -> Result<()>;
    fn dms_set_power(&mut self, requested: OperatingMode) -> Result<OperatingMode>;
    fn dms_detach(&mut self, deallocate_cache: bool) -> Result<()>;

    fn wds_attach(&mut self, family: Family) -> Result<()>;
    fn wds_configure_autoconnect(&mut self, family: Family) -> Result<()>;
    fn wds_set_ip_family_preference(&mut self, family: Family) -> Result<()>;
    fn wds_start(&mut self, family: Family) -> Result<wds::StartDataSessionOutcome>;
    fn wds_runtime_settings(&mut self, family: Family) -> Result<RuntimeSettings>;
    fn wds_stop(&mut self, family: Family) -> Result<()>;
    fn wds_detach(&mut self, family: Family) -> Result<()>;
    fn wds_teardown_requested(&self, family: Family) -> bool;

    fn apply_v4_settings(&mut self, settings: RuntimeSettings) -> Result<()>;
    fn apply_v6_settings(&mut self, settings: RuntimeSettings) -> Result<()>;

    fn sleep_monitor_tick(&mut self);
    fn sleep_backoff(&mut self);
    fn exit_requested(&self) -> bool;
    /// Promotes a local/infrastructural fault to the process-wide exit
    /// flag (spec §4.6 fault classification 1). The same flag an external
    /// shutdown signal sets; once true, `exit_requested` never clears.
    fn request_exit(&mut self);
}

/// Composes the real `qmi`/`dms`/`wds`/`hnm`/`sbc` crates. One instance
/// lives for the whole process; the per-family `WdsSession`s are created
/// and destroyed across the `Option` fields each outer-loop iteration,
/// matching the spec's "created per family per outer iteration; destroyed
/// before the iteration ends".
pub struct RealCollaborators {
    log: Logger,
    transport: Transport,
    dms: Option<dms::DmsState>,
    /// The static identity cache (spec §3: "retained across iterations
    /// unless the supervisor is exiting"), held here rather than on
    /// `dms::DmsState` itself because that type is dropped and recreated
    /// every Phase B iteration (`dms_attach`/`dms_detach`) while this field
    /// outlives all of them.
    model_id_cache: Option<String>,
    wds_v4: Option<WdsSession>,
    wds_v6: Option<WdsSession>,
    hnm: HostNetworkState,
    sbc: ServiceBusClient,
    tunnel_runner: TunnelConfigRunner,
    exit_requested: Arc<AtomicBool>,
}

impl RealCollaborators {
    pub fn new(log: Logger, exit_requested: Arc<AtomicBool>) -> anyhow::Result<Self> {
        let transport = Transport::open(config::MODEM_DEVICE_NODE, log.new(slog::o!("component" => "qmi")))?;
        let hnm = HostNetworkState::initialize(
            log.new(slog::o!("component" => "hnm")),
            config::WWAN_LINK_NAME,
            config::TUNNEL_LINK_NAME,
        )?;
        let sbc = ServiceBusClient::connect(log.new(slog::o!("component" => "sbc")))?;
        let tunnel_runner =
            TunnelConfigRunner::new(log.new(slog::o!("component" => "wg")), config::WIREGUARD_BINARY);
        Ok(Self {
            log,
            transport,
            dms: None,
            model_id_cache: None,
            wds_v4: None,
            wds_v6: None,
            hnm,
            sbc,
            tunnel_runner,
            exit_requested,
        })
    }

    fn wds_mut(&mut self, family: Family) -> Option<&mut WdsSession> {
        match family {
            Family::V4 => self.wds_v4.as_mut(),
            Family::V6 => self.wds_v6.as_mut(),
        }
    }

    fn wds_slot_mut(&mut self, family: Family) -> &mut Option<WdsSession> {
        match family {
            Family::V4 => &mut self.wds_v4,
            Family::V6 => &mut self.wds_v6,
        }
    }
}

impl Collaborators for RealCollaborators {
    fn reload_link_cache(&mut self) -> Result<()> {
        self.hnm.reload_link_cache()?;
        Ok(())
    }

    fn ensure_interface_state(&mut self, link: Link, up: bool) -> Result<()> {
        self.hnm.ensure_interface_state(link, up)?;
        Ok(())
    }

    fn flush_wwan_addresses(&mut self) -> Result<()> {
        self.hnm.flush_addresses()?;
        Ok(())
    }

    fn manage_service(&mut self, verb: Verb, unit: &'static str) -> Result<()> {
        self.sbc.manage_service(verb, unit)?;
        Ok(())
    }

    fn run_tunnel_config(&mut self) -> Result<()> {
        self.tunnel_runner
            .run_tunnel_config(config::TUNNEL_LINK_NAME, Path::new(config::WIREGUARD_CONFIG_PATH))?;
        Ok(())
    }

    fn ensure_tunnel_routes(&mut self) -> Result<()> {
        self.hnm.ensure_tunnel_routes()?;
        Ok(())
    }

    fn dms_attach(&mut self) -> Result<()> {
        let state = dms::DmsState::attach(
            &self.transport,
            self.log.new(slog::o!("component" => "dms")),
            self.model_id_cache.clone(),
        )?;
        self.dms = Some(state);
        Ok(())
    }

    fn dms_set_power(&mut self, requested: OperatingMode) -> Result<OperatingMode> {
        let dms = self.dms.as_ref().expect("dms_set_power called without a prior dms_attach");
        Ok(dms.set_power(&self.transport, requested)?)
    }

    fn dms_detach(&mut self, deallocate_cache: bool) -> Result<()> {
        if let Some(dms) = self.dms.take() {
            self.model_id_cache = dms.detach(&self.transport, deallocate_cache)?;
        }
        Ok(())
    }

    fn wds_attach(&mut self, family: Family) -> Result<()> {
        let session = WdsSession::attach(
            &self.transport,
            family,
            config::CARRIER_PROFILE_ID,
            self.log.new(slog::o!("component" => "wds", "family" => format!("{family:?}"))),
        )?;
        *self.wds_slot_mut(family) = Some(session);
        Ok(())
    }

    fn wds_configure_autoconnect(&mut self, family: Family) -> Result<()> {
        let session = self.wds_mut(family).expect("wds session not attached");
        session.set_autoconnect_settings(&self.transport, AutoconnectSetting::Disabled, RoamSetting::HomeOnly)?;
        Ok(())
    }

    fn wds_set_ip_family_preference(&mut self, family: Family) -> Result<()> {
        let session = self.wds_mut(family).expect("wds session not attached");
        session.set_ip_family_preference(&self.transport)?;
        Ok(())
    }

    fn wds_start(&mut self, family: Family) -> Result<wds::StartDataSessionOutcome> {
        let session = self.wds_mut(family).expect("wds session not attached");
        Ok(session.start_data_session(&self.transport)?)
    }

    fn wds_runtime_settings(&mut self, family: Family) -> Result<RuntimeSettings> {
        let session = self.wds_mut(family).expect("wds session not attached");
        Ok(session.get_runtime_settings(&self.transport)?)
    }

    fn wds_stop(&mut self, family: Family) -> Result<()> {
        if let Some(session) = self.wds_mut(family) {
            session.stop_data_session(&self.transport)?;
        }
        Ok(())
    }

    fn wds_detach(&mut self, family: Family) -> Result<()> {
        if let Some(session) = self.wds_slot_mut(family).take() {
            session.detach(&self.transport)?;
        }
        Ok(())
    }

    fn wds_teardown_requested(&self, family: Family) -> bool {
        match family {
            Family::V4 => self.wds_v4.as_ref().map(|s| s.teardown_flag().is_set()).unwrap_or(false),
            Family::V6 => self.wds_v6.as_ref().map(|s| s.teardown_flag().is_set()).unwrap_or(false),
        }
    }

    fn apply_v4_settings(&mut self, settings: RuntimeSettings) -> Result<()> {
        let (addr, gateway) = match (settings.address, settings.gateway) {
            (std::net::IpAddr::V4(a), std::net::IpAddr::V4(g)) => (a, g),
            _ => return Err(SupervisorError::ProtocolViolation("v4 runtime settings carried non-v4 addresses".into())),
        };
        self.hnm.ensure_v4_configuration_is_applied(addr, settings.prefix_length, gateway)?;
        Ok(())
    }

    fn apply_v6_settings(&mut self, settings: RuntimeSettings) -> Result<()> {
        let (addr, gateway) = match (settings.address, settings.gateway) {
            (std::net::IpAddr::V6(a), std::net::IpAddr::V6(g)) => (a, g),
            _ => return Err(SupervisorError::ProtocolViolation("v6 runtime settings carried non-v6 addresses".into())),
        };
        self.hnm.add_v6_address(addr, settings.prefix_length)?;
        self.hnm.change_v6_default_gateway(gateway, settings.prefix_length)?;
        Ok(())
    }

    fn sleep_monitor_tick(&mut self) {
        thread::sleep(config::MONITOR_TICK);
    }

    fn sleep_backoff(&mut self) {
        thread::sleep(config::OUTER_LOOP_BACKOFF);
    }

    fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    fn request_exit(&mut self) {
        self.exit_requested.store(true, Ordering::Release);
    }
}
