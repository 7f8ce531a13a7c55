//! The fixed, single-profile contract this daemon runs against (spec §6).
//! There is deliberately no config file, environment variable, or CLI flag
//! read anywhere in this crate — every value a prior iteration of this
//! daemon might have made configurable is a named constant here instead,
//! the same way `metalos/lib/systemd`'s `PROVIDER_ROOT` and
//! `ConnectOpts::default()` keep fixed values in a commented, named home
//! rather than threading a config struct through the whole call graph.

use std::time::Duration;

/// QMI character device, opened in direct-interface mode.
pub const MODEM_DEVICE_NODE: &str = "/dev/wwan0qmi0";

/// Host interface names. Both must exist at startup.
pub const WWAN_LINK_NAME: &str = "mhi_hwip0";
pub const TUNNEL_LINK_NAME: &str = "wg0";

/// Fixed 3GPP profile id (Verizon internet).
pub const CARRIER_PROFILE_ID: u8 = 3;

/// Tunnel configuration subprocess.
pub const WIREGUARD_BINARY: &str = "/usr/bin/wg";
pub const WIREGUARD_CONFIG_PATH: &str = "/etc/wireguard/wireguard.conf";

/// Managed systemd units.
pub const CHRONY_UNIT: &str = "chrony.service";
pub const UNBOUND_UNIT: &str = "unbound.service";

/// Phase B's retry backoff: rate-limits futile modem operations against an
/// angry network (spec §4.6 step 9).
pub const OUTER_LOOP_BACKOFF: Duration = Duration::from_secs(10);

/// Phase D's monitoring tick granularity.
pub const MONITOR_TICK: Duration = Duration::from_secs(1);
