//! Per-family packet session control, attached over a single service handle
//! on a shared `qmi::Transport`. A `WdsSession` owns exactly one handle for
//! exactly one address family (v4 or v6); the supervisor creates a fresh
//! one per family per outer-loop iteration and destroys it before the
//! iteration ends.

mod error;
pub mod indication;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use qmi::{Handle, Service, Transport};
use slog::{debug, trace, warn, Logger};

pub use error::{Error, Result};
pub use indication::PacketServiceStatus;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const MSG_GET_AUTOCONNECT: u16 = 0x0037;
const MSG_SET_AUTOCONNECT: u16 = 0x0038;
const MSG_SET_IP_FAMILY: u16 = 0x004D;
const MSG_START_NETWORK_INTERFACE: u16 = 0x0020;
const MSG_STOP_NETWORK_INTERFACE: u16 = 0x0021;
const MSG_GET_RUNTIME_SETTINGS: u16 = 0x002D;

const TLV_AUTOCONNECT_SETTING: u8 = 0x01;
const TLV_AUTOCONNECT_ROAM: u8 = 0x10;
const TLV_IP_FAMILY: u8 = 0x01;
const TLV_PROFILE_3GPP: u8 = 0x31;
const TLV_SESSION_ID: u8 = 0x10;
const TLV_CALL_END_REASON: u8 = 0x11;
const TLV_VERBOSE_CALL_END_REASON: u8 = 0x12;
const TLV_RUNTIME_SETTINGS_MASK: u8 = 0x10;
const TLV_IPV4_ADDR: u8 = 0x14;
const TLV_IPV4_GATEWAY: u8 = 0x15;
const TLV_IPV4_SUBNET_MASK: u8 = 0x21;
const TLV_IPV6_ADDR: u8 = 0x25;
const TLV_IPV6_GATEWAY: u8 = 0x26;

/// `RuntimeSettingsRequested` bitmask TLV value requesting only address and
/// gateway fields (spec: "requests the address + gateway fields only").
const RUNTIME_SETTINGS_MASK_ADDR_GATEWAY: u32 = 0x0000_0010 | 0x0000_0020;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum AutoconnectSetting {
    Disabled = 0x00,
    Enabled = 0x01,
    Paused = 0x02,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum RoamSetting {
    Always = 0x01,
    HomeOnly = 0x02,
}

/// Family-tagged runtime settings of an active packet session. v4's prefix
/// length is derived from the subnet mask; v6's is read directly off the
/// wire and cross-checked against the gateway's own prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub address: IpAddr,
    pub gateway: IpAddr,
    pub prefix_length: u8,
}

/// Outcome of `StartDataSession`: the modem's assigned session id plus
/// whatever diagnostic failure-reason fields rode along even on an overall
/// success status (spec §4.3: "surfaced to the caller even on overall
/// success status so that diagnostic context can be logged").
#[derive(Debug, Clone, Copy, Default)]
pub struct StartDataSessionOutcome {
    pub session_id: u16,
    pub call_end_reason: Option<u16>,
    pub verbose_call_end_reason: Option<(u16, u16)>,
}

/// The single datum crossing the indication-thread/main-thread boundary.
/// Owned by the session, written by the indication callback running on the
/// transport's internal thread, read by the main thread at each Phase D
/// monitoring tick. Monotonic within one session's lifetime: only ever set,
/// never cleared.
#[derive(Clone, Default)]
pub struct TeardownFlag(Arc<AtomicBool>);

impl TeardownFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A WDS session bound to a single address family. `session_id == 0` means
/// "no session"; the invariant that a stop is attempted whenever
/// `session_id != 0` before the handle is detached is enforced by `stop`
/// being infallible-on-no-effect and always called from `Drop`'s caller
/// path in the supervisor, not by this type itself (this type only tracks
/// the id, it doesn't own the decision to tear down).
pub struct WdsSession {
    log: Logger,
    handle: Handle,
    family: Family,
    profile_id: u8,
    session_id: u16,
    last_runtime_settings: Option<RuntimeSettings>,
    teardown_requested: TeardownFlag,
}

impl WdsSession {
    /// Attach a WDS handle for `family`, registering the packet-service-
    /// status indication callback. The returned `TeardownFlag` is the same
    /// one the callback writes to; the caller polls it independently of
    /// holding a `&WdsSession` (the session itself is main-thread-only).
    pub fn attach(
        transport: &Transport,
        family: Family,
        profile_id: u8,
        log: Logger,
    ) -> Result<Self> {
        let teardown_requested = TeardownFlag::new();
        let callback_flag = teardown_requested.clone();
        let callback_log = log.clone();
        let handle = transport.attach(
            Service::Wds,
            Some(Box::new(move |tlvs: &[u8]| {
                handle_indication(&callback_log, &callback_flag, tlvs);
            })),
        )?;
        debug!(log, "WDS attached"; "family" => ?family);
        Ok(Self {
            log,
            handle,
            family,
            profile_id,
            session_id: 0,
            last_runtime_settings: None,
            teardown_requested,
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    pub fn teardown_flag(&self) -> TeardownFlag {
        self.teardown_requested.clone()
    }

    pub fn last_runtime_settings(&self) -> Option<RuntimeSettings> {
        self.last_runtime_settings
    }

    pub fn get_autoconnect_settings(
        &self,
        transport: &Transport,
    ) -> Result<(AutoconnectSetting, RoamSetting)> {
        let frame = transport.request(self.handle, MSG_GET_AUTOCONNECT, &[], REQUEST_TIMEOUT)?;
        let setting_byte = *qmi::find_tlv(&frame.tlvs, TLV_AUTOCONNECT_SETTING)
            .and_then(|v| v.first())
            .ok_or(Error::ProtocolViolation("autoconnect setting TLV missing"))?;
        let setting = AutoconnectSetting::from_u8(setting_byte)
            .ok_or(Error::ProtocolViolation("unrecognized autoconnect setting byte"))?;
        let roam_byte = qmi::find_tlv(&frame.tlvs, TLV_AUTOCONNECT_ROAM)
            .and_then(|v| v.first())
            .copied()
            .unwrap_or(RoamSetting::Always.to_u8().unwrap());
        let roam = RoamSetting::from_u8(roam_byte)
            .ok_or(Error::ProtocolViolation("unrecognized roam setting byte"))?;
        Ok((setting, roam))
    }

    /// Reads current settings first; if both already match, issues no
    /// write (Testable Property 3).
    pub fn set_autoconnect_settings(
        &self,
        transport: &Transport,
        setting: AutoconnectSetting,
        roam: RoamSetting,
    ) -> Result<()> {
        let (current_setting, current_roam) = self.get_autoconnect_settings(transport)?;
        if current_setting == setting && current_roam == roam {
            trace!(self.log, "autoconnect settings already match, no write issued");
            return Ok(());
        }
        let mut tlvs = Vec::new();
        qmi::push_tlv(&mut tlvs, TLV_AUTOCONNECT_SETTING, &[setting.to_u8().unwrap()]);
        qmi::push_tlv(&mut tlvs, TLV_AUTOCONNECT_ROAM, &[roam.to_u8().unwrap()]);
        transport.request(self.handle, MSG_SET_AUTOCONNECT, &tlvs, REQUEST_TIMEOUT)?;
        Ok(())
    }

    pub fn set_ip_family_preference(&self, transport: &Transport) -> Result<()> {
        let byte: u8 = match self.family {
            Family::V4 => 0x04,
            Family::V6 => 0x06,
        };
        let mut tlvs = Vec::new();
        qmi::push_tlv(&mut tlvs, TLV_IP_FAMILY, &[byte]);
        transport.request(self.handle, MSG_SET_IP_FAMILY, &tlvs, REQUEST_TIMEOUT)?;
        Ok(())
    }

    /// Records `profile_id` on the session and zeroes `session_id` before
    /// issuing the call, so a failed start never leaves a stale id for a
    /// later stop to act on. On success, the session id is required; its
    /// absence is a protocol error, not something this call tolerates.
    pub fn start_data_session(&mut self, transport: &Transport) -> Result<StartDataSessionOutcome> {
        self.session_id = 0;
        let mut tlvs = Vec::new();
        qmi::push_tlv(&mut tlvs, TLV_PROFILE_3GPP, &[self.profile_id]);
        let frame = transport.request(
            self.handle,
            MSG_START_NETWORK_INTERFACE,
            &tlvs,
            REQUEST_TIMEOUT,
        )?;

        match qmi::parse_result_code(&frame.tlvs)? {
            Ok(()) => {}
            Err((result, error)) => {
                let reason = qmi::find_tlv(&frame.tlvs, TLV_CALL_END_REASON)
                    .and_then(|v| (v.len() >= 2).then(|| u16::from_le_bytes([v[0], v[1]])));
                let verbose = qmi::find_tlv(&frame.tlvs, TLV_VERBOSE_CALL_END_REASON).and_then(|v| {
                    (v.len() >= 4).then(|| {
                        (u16::from_le_bytes([v[0], v[1]]), u16::from_le_bytes([v[2], v[3]]))
                    })
                });
                warn!(self.log, "start-session refused by modem";
                    "family" => ?self.family, "result" => result, "error" => error,
                    "reason" => ?reason, "verbose" => ?verbose);
                return Err(Error::SessionRefused { reason, verbose });
            }
        }

        let session_id_bytes = qmi::find_tlv(&frame.tlvs, TLV_SESSION_ID)
            .ok_or(Error::ProtocolViolation("session id TLV missing from start-session response"))?;
        if session_id_bytes.len() < 4 {
            return Err(Error::ProtocolViolation("session id TLV too short"));
        }
        self.session_id = u32::from_le_bytes([
            session_id_bytes[0],
            session_id_bytes[1],
            session_id_bytes[2],
            session_id_bytes[3],
        ]) as u16;

        let call_end_reason = qmi::find_tlv(&frame.tlvs, TLV_CALL_END_REASON)
            .and_then(|v| (v.len() >= 2).then(|| u16::from_le_bytes([v[0], v[1]])));
        let verbose_call_end_reason = qmi::find_tlv(&frame.tlvs, TLV_VERBOSE_CALL_END_REASON).and_then(|v| {
            (v.len() >= 4).then(|| (u16::from_le_bytes([v[0], v[1]]), u16::from_le_bytes([v[2], v[3]])))
        });
        if call_end_reason.is_some() || verbose_call_end_reason.is_some() {
            debug!(self.log, "start-session succeeded with diagnostic fields present";
                "family" => ?self.family, "reason" => ?call_end_reason, "verbose" => ?verbose_call_end_reason);
        }

        debug!(self.log, "data session started"; "family" => ?self.family, "session_id" => self.session_id);
        Ok(StartDataSessionOutcome {
            session_id: self.session_id,
            call_end_reason,
            verbose_call_end_reason,
        })
    }

    /// Uses the stored `session_id`. A `NoEffect` response (the session was
    /// already gone, e.g. torn down by the peer before this call landed)
    /// is treated as success.
    pub fn stop_data_session(&mut self, transport: &Transport) -> Result<()> {
        if self.session_id == 0 {
            return Ok(());
        }
        let mut tlvs = Vec::new();
        qmi::push_tlv(&mut tlvs, TLV_SESSION_ID, &(self.session_id as u32).to_le_bytes());
        let frame = transport.request(
            self.handle,
            MSG_STOP_NETWORK_INTERFACE,
            &tlvs,
            REQUEST_TIMEOUT,
        )?;
        match qmi::parse_result_code(&frame.tlvs)? {
            Ok(()) => {}
            Err((_, error)) if error == NO_EFFECT_ERROR_CODE => {
                debug!(self.log, "stop-session was a no-effect, session already gone";
                    "family" => ?self.family, "session_id" => self.session_id);
            }
            Err((result, error)) => {
                return Err(Error::Transport(anyhow::anyhow!(
                    "stop-session failed: result={result} error={error}"
                )));
            }
        }
        self.session_id = 0;
        Ok(())
    }

    /// Requests address + gateway fields only. Populates this session's
    /// family out of whatever fields the response carries for that
    /// family; fields present for the other family are ignored.
    pub fn get_runtime_settings(&mut self, transport: &Transport) -> Result<RuntimeSettings> {
        let mut tlvs = Vec::new();
        qmi::push_tlv(
            &mut tlvs,
            TLV_RUNTIME_SETTINGS_MASK,
            &RUNTIME_SETTINGS_MASK_ADDR_GATEWAY.to_le_bytes(),
        );
        let frame = transport.request(self.handle, MSG_GET_RUNTIME_SETTINGS, &tlvs, REQUEST_TIMEOUT)?;

        let settings = match self.family {
            Family::V4 => parse_v4_runtime_settings(&frame.tlvs)?,
            Family::V6 => parse_v6_runtime_settings(&self.log, &frame.tlvs)?,
        };
        self.last_runtime_settings = Some(settings);
        Ok(settings)
    }

    pub fn detach(self, transport: &Transport) -> Result<()> {
        transport.detach(self.handle)?;
        debug!(self.log, "WDS detached"; "family" => ?self.family);
        Ok(())
    }
}

/// Error code carried in the result-code TLV's `error` field when a
/// stop-session request found nothing to stop.
const NO_EFFECT_ERROR_CODE: u16 = 0x002A;

fn parse_v4_runtime_settings(tlvs: &[u8]) -> Result<RuntimeSettings> {
    let addr = read_ipv4(tlvs, TLV_IPV4_ADDR).ok_or(Error::ProtocolViolation("v4 address missing"))?;
    let gateway =
        read_ipv4(tlvs, TLV_IPV4_GATEWAY).ok_or(Error::ProtocolViolation("v4 gateway missing"))?;
    let mask = read_ipv4(tlvs, TLV_IPV4_SUBNET_MASK)
        .ok_or(Error::ProtocolViolation("v4 subnet mask missing"))?;
    let prefix_length = prefix_length_from_mask(u32::from(mask));
    Ok(RuntimeSettings {
        address: IpAddr::V4(addr),
        gateway: IpAddr::V4(gateway),
        prefix_length,
    })
}

fn parse_v6_runtime_settings(log: &Logger, tlvs: &[u8]) -> Result<RuntimeSettings> {
    let (addr, addr_prefix) =
        read_ipv6_with_prefix(tlvs, TLV_IPV6_ADDR).ok_or(Error::ProtocolViolation("v6 address missing"))?;
    let (gateway, gateway_prefix) = read_ipv6_with_prefix(tlvs, TLV_IPV6_GATEWAY)
        .ok_or(Error::ProtocolViolation("v6 gateway missing"))?;
    if addr_prefix != gateway_prefix {
        warn!(log, "v6 address/gateway prefix length disagreement, address wins";
            "address_prefix" => addr_prefix, "gateway_prefix" => gateway_prefix);
    }
    Ok(RuntimeSettings {
        address: IpAddr::V6(addr),
        gateway: IpAddr::V6(gateway),
        prefix_length: addr_prefix,
    })
}

fn read_ipv4(tlvs: &[u8], tlv_type: u8) -> Option<Ipv4Addr> {
    let v = qmi::find_tlv(tlvs, tlv_type)?;
    if v.len() < 4 {
        return None;
    }
    Some(Ipv4Addr::new(v[0], v[1], v[2], v[3]))
}

fn read_ipv6_with_prefix(tlvs: &[u8], tlv_type: u8) -> Option<(Ipv6Addr, u8)> {
    let v = qmi::find_tlv(tlvs, tlv_type)?;
    if v.len() < 17 {
        return None;
    }
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&v[..16]);
    Some((Ipv6Addr::from(octets), v[16]))
}

/// `32 − trailing_zero_bits(mask)`, per spec §4.3/§8 Testable Property 4.
/// Assumes a contiguous subnet mask (high bits set, low bits clear) and does
/// not validate that assumption; a non-contiguous mask from the modem is
/// trusted never to occur rather than rejected (SPEC_FULL.md Open Question 1;
/// see DESIGN.md).
fn prefix_length_from_mask(mask: u32) -> u8 {
    (32 - mask.trailing_zeros()) as u8
}

fn handle_indication(log: &Logger, flag: &TeardownFlag, tlvs: &[u8]) {
    let Some(status) = indication::parse(tlvs) else {
        warn!(log, "malformed packet-service-status indication, ignored");
        return;
    };
    if indication::requests_teardown(&status) {
        debug!(log, "indication requests teardown";
            "connection_status" => status.connection_status,
            "session_end_reason" => ?status.session_end_reason,
            "verbose_session_end_reason" => ?status.verbose_session_end_reason);
        flag.set();
    } else {
        trace!(log, "indication observed, no teardown requested";
            "connection_status" => status.connection_status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_length_from_contiguous_masks() {
        for prefix in 0u8..=32 {
            let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            assert_eq!(prefix_length_from_mask(mask), prefix, "mask {mask:#010x}");
        }
    }

    #[test]
    fn test_prefix_length_24_and_31() {
        assert_eq!(prefix_length_from_mask(0xFFFFFF00), 24);
        assert_eq!(prefix_length_from_mask(0xFFFFFFFE), 31);
    }

    #[test]
    fn test_teardown_flag_monotonic() {
        let flag = TeardownFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
        flag.set();
        assert!(flag.is_set());
    }
}
