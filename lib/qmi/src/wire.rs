//! Minimal QMUX framing. The TLV encoding carried inside each frame is left
//! opaque here; this module does only the outer envelope (service/client
//! addressing, transaction id, message id) needed to route a frame to the
//! right pending request or indication callback. Everything past the
//! envelope is an opaque `Vec<u8>` of TLVs that `dms`/`wds` encode and
//! decode themselves for the handful of fields each of them actually reads.

use anyhow::{bail, Result};

/// QMUX service type byte. Only the services this daemon talks to are
/// represented; any other service id observed on the wire is routed as
/// `Service::Other` and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Ctl,
    Wds,
    Dms,
    Other(u8),
}

impl Service {
    fn from_byte(b: u8) -> Self {
        match b {
            0x00 => Service::Ctl,
            0x01 => Service::Wds,
            0x02 => Service::Dms,
            other => Service::Other(other),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Service::Ctl => 0x00,
            Service::Wds => 0x01,
            Service::Dms => 0x02,
            Service::Other(b) => b,
        }
    }
}

/// SDU flags byte: which direction a frame travelled and whether it's a
/// solicited response or an unsolicited indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Request,
    Response,
    Indication,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub service: Service,
    pub client_id: u8,
    pub flavor: Flavor,
    pub transaction_id: u16,
    pub message_id: u16,
    pub tlvs: Vec<u8>,
}

/// Encode a request frame. `transaction_id` must be unique among this
/// transport's currently in-flight requests (the caller, `Transport`, owns
/// a monotonic counter for this).
pub fn encode_request(
    service: Service,
    client_id: u8,
    transaction_id: u16,
    message_id: u16,
    tlvs: &[u8],
) -> Vec<u8> {
    let sdu_len = 2 + 2 + 2 + tlvs.len(); // flags+txn is folded into header below
    let mut qmi_sdu = Vec::with_capacity(5 + tlvs.len());
    qmi_sdu.push(0x00); // request, from client
    qmi_sdu.extend_from_slice(&transaction_id.to_le_bytes());
    qmi_sdu.extend_from_slice(&message_id.to_le_bytes());
    qmi_sdu.extend_from_slice(&(tlvs.len() as u16).to_le_bytes());
    qmi_sdu.extend_from_slice(tlvs);

    let total_len = 1 + 1 + 1 + qmi_sdu.len(); // flags + service + client_id + sdu, excluding the length field itself
    let _ = sdu_len; // documents the SDU layout above; total_len is what's framed
    let mut out = Vec::with_capacity(4 + total_len);
    out.push(0x01); // QMUX IF type
    out.extend_from_slice(&(total_len as u16).to_le_bytes());
    out.push(0x00); // control flags: always 0 from a client
    out.push(service.to_byte());
    out.push(client_id);
    out.extend_from_slice(&qmi_sdu);
    out
}

/// Parse one QMUX frame read off the character device. Returns `None` on a
/// short read (the reader thread keeps buffering until a full frame is
/// available); `Err` on a malformed header.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    if buf[0] != 0x01 {
        bail!("unexpected QMUX IF type byte {:#x}", buf[0]);
    }
    let total_len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
    let frame_len = 3 + total_len; // IF type + length field themselves are outside total_len
    if buf.len() < frame_len {
        return Ok(None);
    }
    let service = Service::from_byte(buf[4]);
    let client_id = buf[5];
    let sdu = &buf[6..frame_len];
    if sdu.len() < 7 {
        bail!("truncated QMI SDU");
    }
    let flavor = match sdu[0] {
        0x00 => Flavor::Request,
        0x01 => Flavor::Response,
        0x02 => Flavor::Indication,
        other => bail!("unexpected QMI SDU flags byte {:#x}", other),
    };
    let transaction_id = u16::from_le_bytes([sdu[1], sdu[2]]);
    let message_id = u16::from_le_bytes([sdu[3], sdu[4]]);
    let tlv_len = u16::from_le_bytes([sdu[5], sdu[6]]) as usize;
    let tlvs = sdu.get(7..7 + tlv_len).ok_or_else(|| anyhow::anyhow!("truncated TLV section"))?;
    Ok(Some((
        Frame {
            service,
            client_id,
            flavor,
            transaction_id,
            message_id,
            tlvs: tlvs.to_vec(),
        },
        frame_len,
    )))
}

/// Find a TLV by type within a decoded frame's opaque TLV bytes. Returns
/// the TLV's value slice. This is the only "parsing" this crate does of
/// TLV contents; `dms`/`wds` interpret the bytes themselves.
pub fn find_tlv(tlvs: &[u8], tlv_type: u8) -> Option<&[u8]> {
    let mut i = 0;
    while i + 3 <= tlvs.len() {
        let t = tlvs[i];
        let len = u16::from_le_bytes([tlvs[i + 1], tlvs[i + 2]]) as usize;
        let start = i + 3;
        let end = start + len;
        if end > tlvs.len() {
            return None;
        }
        if t == tlv_type {
            return Some(&tlvs[start..end]);
        }
        i = end;
    }
    None
}

/// Append a TLV to a buffer being built for a request.
pub fn push_tlv(buf: &mut Vec<u8>, tlv_type: u8, value: &[u8]) {
    buf.push(tlv_type);
    buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
    buf.extend_from_slice(value);
}

/// Every QMI response carries a mandatory result-code TLV: `{ result: u16
/// (0 success, 1 failure), error: u16 }`. `Ok(())` on success, `Err((result,
/// error))` on failure; callers interpret the error code against whatever
/// table their service defines (`NoEffect`, `SessionRefused`, ...).
pub const TLV_RESULT_CODE: u8 = 0x02;

pub fn parse_result_code(tlvs: &[u8]) -> Result<std::result::Result<(), (u16, u16)>> {
    let raw = find_tlv(tlvs, TLV_RESULT_CODE).ok_or_else(|| {
        anyhow::anyhow!("response missing mandatory result-code TLV {:#04x}", TLV_RESULT_CODE)
    })?;
    if raw.len() < 4 {
        bail!("result-code TLV too short");
    }
    let result = u16::from_le_bytes([raw[0], raw[1]]);
    let error = u16::from_le_bytes([raw[2], raw[3]]);
    if result == 0 {
        Ok(Ok(()))
    } else {
        Ok(Err((result, error)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_request_frame() {
        let mut tlvs = Vec::new();
        push_tlv(&mut tlvs, 0x01, &[0xAA, 0xBB]);
        let encoded = encode_request(Service::Dms, 3, 42, 0x002D, &tlvs);
        let (frame, consumed) = decode_frame(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(frame.service, Service::Dms);
        assert_eq!(frame.client_id, 3);
        assert_eq!(frame.transaction_id, 42);
        assert_eq!(frame.message_id, 0x002D);
        assert_eq!(find_tlv(&frame.tlvs, 0x01), Some(&[0xAA, 0xBB][..]));
    }

    #[test]
    fn test_decode_needs_more_data() {
        let mut tlvs = Vec::new();
        push_tlv(&mut tlvs, 0x01, &[0xAA]);
        let encoded = encode_request(Service::Wds, 1, 1, 1, &tlvs);
        assert!(decode_frame(&encoded[..encoded.len() - 1]).unwrap().is_none());
    }
}
