//! Parsing and teardown-filter logic for the packet-service-status
//! indication, kept separate from the session type so the filter rule can
//! be exercised directly against raw field values.

const TLV_CONNECTION_STATUS: u8 = 0x01;
const TLV_SESSION_END_REASON: u8 = 0x10;
const TLV_VERBOSE_SESSION_END_REASON: u8 = 0x11;

const CONNECTION_STATUS_DISCONNECTED: u8 = 1;
const HOST_ENDED_REASON: u16 = 2;
const HOST_ENDED_VERBOSE_TYPE: u16 = 3;
const HOST_ENDED_VERBOSE_REASON: u16 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketServiceStatus {
    pub connection_status: u8,
    pub session_end_reason: Option<u16>,
    pub verbose_session_end_reason: Option<(u16, u16)>,
}

pub fn parse(tlvs: &[u8]) -> Option<PacketServiceStatus> {
    let connection_status = *qmi::find_tlv(tlvs, TLV_CONNECTION_STATUS)?.first()?;
    let session_end_reason = qmi::find_tlv(tlvs, TLV_SESSION_END_REASON).and_then(|v| {
        (v.len() >= 2).then(|| u16::from_le_bytes([v[0], v[1]]))
    });
    let verbose_session_end_reason = qmi::find_tlv(tlvs, TLV_VERBOSE_SESSION_END_REASON).and_then(|v| {
        (v.len() >= 4).then(|| {
            (
                u16::from_le_bytes([v[0], v[1]]),
                u16::from_le_bytes([v[2], v[3]]),
            )
        })
    });
    Some(PacketServiceStatus {
        connection_status,
        session_end_reason,
        verbose_session_end_reason,
    })
}

/// True iff this status should request teardown of the owning session:
/// disconnected, and not attributable to a disconnect this host itself
/// requested.
pub fn requests_teardown(status: &PacketServiceStatus) -> bool {
    if status.connection_status != CONNECTION_STATUS_DISCONNECTED {
        return false;
    }
    let host_ended_by_reason = status.session_end_reason == Some(HOST_ENDED_REASON);
    let host_ended_by_verbose = status.verbose_session_end_reason
        == Some((HOST_ENDED_VERBOSE_TYPE, HOST_ENDED_VERBOSE_REASON));
    !(host_ended_by_reason || host_ended_by_verbose)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(connection_status: u8, reason: Option<u16>, verbose: Option<(u16, u16)>) -> PacketServiceStatus {
        PacketServiceStatus {
            connection_status,
            session_end_reason: reason,
            verbose_session_end_reason: verbose,
        }
    }

    #[test]
    fn test_peer_initiated_disconnect_requests_teardown() {
        assert!(requests_teardown(&status(1, Some(7), None)));
    }

    #[test]
    fn test_host_initiated_disconnect_by_reason_is_suppressed() {
        assert!(!requests_teardown(&status(1, Some(2), None)));
    }

    #[test]
    fn test_host_initiated_disconnect_by_verbose_reason_is_suppressed() {
        assert!(!requests_teardown(&status(1, None, Some((3, 2000)))));
    }

    #[test]
    fn test_non_disconnected_status_never_requests_teardown() {
        assert!(!requests_teardown(&status(2, None, None)));
        assert!(!requests_teardown(&status(3, None, None)));
        assert!(!requests_teardown(&status(4, None, None)));
    }

    #[test]
    fn test_near_miss_verbose_reason_does_not_suppress() {
        assert!(requests_teardown(&status(1, None, Some((3, 1999)))));
        assert!(requests_teardown(&status(1, None, Some((1, 2000)))));
    }
}
