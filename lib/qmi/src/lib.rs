//! Request/response and indication plumbing over a single QMI character
//! device. Higher-level service crates (`dms`, `wds`) each attach their own
//! handle and interpret the TLVs themselves; this crate only understands
//! the QMUX envelope and the mechanics of getting a byte stream demuxed
//! into responses and indications.

mod transport;
mod wire;

pub use transport::{Handle, IndicationCallback, Transport};
pub use wire::{
    decode_frame, encode_request, find_tlv, parse_result_code, push_tlv, Flavor, Frame, Service,
    TLV_RESULT_CODE,
};
