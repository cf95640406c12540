//! SCCP connectionless message codec (Q.713)
//!
//! UDT/XUDT/LUDT and their service counterparts. Pointers are one octet
//! (two for LUDT) measured from the pointer's own position; the optional
//! part is code/length/value pairs terminated by zero.

use super::address::{SccpAddress, SccpDialect};
use crate::errors::SccpError;
use bytes::{BufMut, Bytes, BytesMut};

/// Message type octets
pub mod msg_type {
    pub const UDT: u8 = 0x09;
    pub const UDTS: u8 = 0x0A;
    pub const XUDT: u8 = 0x11;
    pub const XUDTS: u8 = 0x12;
    pub const LUDT: u8 = 0x13;
    pub const LUDTS: u8 = 0x14;
}

/// Optional parameter codes
mod opt {
    pub const END: u8 = 0x00;
    pub const SEGMENTATION: u8 = 0x10;
    pub const IMPORTANCE: u8 = 0x12;
}

/// Protocol class with the return-on-error bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolClass {
    pub class: u8,
    pub return_on_error: bool,
}

impl ProtocolClass {
    pub const CLASS_0: Self = Self { class: 0, return_on_error: false };
    pub const CLASS_1: Self = Self { class: 1, return_on_error: false };

    pub fn with_return(mut self) -> Self {
        self.return_on_error = true;
        self
    }

    pub fn encode(&self) -> u8 {
        (self.class & 0x0F) | if self.return_on_error { 0x80 } else { 0 }
    }

    pub fn decode(v: u8) -> Self {
        Self { class: v & 0x0F, return_on_error: v & 0x80 != 0 }
    }
}

/// Return causes carried by the service messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCause {
    NoTranslationForNature = 0x00,
    NoTranslationForThisAddress = 0x01,
    SubsystemCongestion = 0x02,
    SubsystemFailure = 0x03,
    UnequippedUser = 0x04,
    MtpFailure = 0x05,
    NetworkCongestion = 0x06,
    Unqualified = 0x07,
    ErrorInTransport = 0x08,
    ErrorInLocalProcessing = 0x09,
    NoReassembly = 0x0A,
    SccpFailure = 0x0B,
    HopCounterViolation = 0x0C,
    SegmentationNotSupported = 0x0D,
    SegmentationFailure = 0x0E,
}

impl ReturnCause {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x00 => Self::NoTranslationForNature,
            0x01 => Self::NoTranslationForThisAddress,
            0x02 => Self::SubsystemCongestion,
            0x03 => Self::SubsystemFailure,
            0x04 => Self::UnequippedUser,
            0x05 => Self::MtpFailure,
            0x06 => Self::NetworkCongestion,
            0x08 => Self::ErrorInTransport,
            0x09 => Self::ErrorInLocalProcessing,
            0x0A => Self::NoReassembly,
            0x0B => Self::SccpFailure,
            0x0C => Self::HopCounterViolation,
            0x0D => Self::SegmentationNotSupported,
            0x0E => Self::SegmentationFailure,
            _ => Self::Unqualified,
        }
    }
}

/// XUDT/LUDT segmentation parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segmentation {
    pub first: bool,
    /// Class 1 requested for all segments
    pub class1: bool,
    /// Segments still to come after this one
    pub remaining: u8,
    /// Local reference shared by the whole batch
    pub reference: u32,
}

impl Segmentation {
    fn encode(&self) -> [u8; 4] {
        [
            (if self.first { 0x80 } else { 0 })
                | (if self.class1 { 0x40 } else { 0 })
                | (self.remaining & 0x0F),
            (self.reference & 0xFF) as u8,
            ((self.reference >> 8) & 0xFF) as u8,
            ((self.reference >> 16) & 0xFF) as u8,
        ]
    }

    fn decode(v: &[u8]) -> Option<Self> {
        if v.len() < 4 {
            return None;
        }
        Some(Self {
            first: v[0] & 0x80 != 0,
            class1: v[0] & 0x40 != 0,
            remaining: v[0] & 0x0F,
            reference: v[1] as u32 | ((v[2] as u32) << 8) | ((v[3] as u32) << 16),
        })
    }
}

/// Variable-length header shared by data and service messages
#[derive(Debug, Clone)]
pub struct SccpMessage {
    pub mtype: u8,
    /// Class for data messages, meaningless on service messages
    pub class: ProtocolClass,
    /// Return cause on service messages
    pub return_cause: Option<ReturnCause>,
    /// Hop counter on XUDT/LUDT families
    pub hop_counter: Option<u8>,
    pub called: SccpAddress,
    pub calling: SccpAddress,
    pub data: Bytes,
    pub segmentation: Option<Segmentation>,
    pub importance: Option<u8>,
}

impl SccpMessage {
    pub fn udt(class: ProtocolClass, called: SccpAddress, calling: SccpAddress, data: Bytes) -> Self {
        Self {
            mtype: msg_type::UDT,
            class,
            return_cause: None,
            hop_counter: None,
            called,
            calling,
            data,
            segmentation: None,
            importance: None,
        }
    }

    pub fn xudt(
        class: ProtocolClass,
        hop_counter: u8,
        called: SccpAddress,
        calling: SccpAddress,
        data: Bytes,
        segmentation: Option<Segmentation>,
    ) -> Self {
        Self {
            mtype: msg_type::XUDT,
            class,
            return_cause: None,
            hop_counter: Some(hop_counter),
            called,
            calling,
            data,
            segmentation,
            importance: None,
        }
    }

    pub fn ludt(
        class: ProtocolClass,
        hop_counter: u8,
        called: SccpAddress,
        calling: SccpAddress,
        data: Bytes,
        segmentation: Option<Segmentation>,
    ) -> Self {
        Self { mtype: msg_type::LUDT, hop_counter: Some(hop_counter), ..Self::udt(class, called, calling, data) }
            .with_segmentation(segmentation)
    }

    fn with_segmentation(mut self, segmentation: Option<Segmentation>) -> Self {
        self.segmentation = segmentation;
        self
    }

    /// Service message answering `self` with a return cause.
    /// Addresses swap; the data travels back for the originator.
    pub fn service_reply(&self, cause: ReturnCause) -> Self {
        let mtype = match self.mtype {
            msg_type::XUDT => msg_type::XUDTS,
            msg_type::LUDT => msg_type::LUDTS,
            _ => msg_type::UDTS,
        };
        Self {
            mtype,
            class: self.class,
            return_cause: Some(cause),
            hop_counter: self.hop_counter,
            called: self.calling.clone(),
            calling: self.called.clone(),
            data: self.data.clone(),
            segmentation: None,
            importance: self.importance,
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self.mtype, msg_type::UDTS | msg_type::XUDTS | msg_type::LUDTS)
    }

    fn second_octet(&self) -> u8 {
        match self.return_cause {
            Some(cause) => cause as u8,
            None => self.class.encode(),
        }
    }

    fn optional_area(&self) -> Option<BytesMut> {
        if self.segmentation.is_none() && self.importance.is_none() {
            return None;
        }
        let mut buf = BytesMut::with_capacity(10);
        if let Some(seg) = &self.segmentation {
            buf.put_u8(opt::SEGMENTATION);
            buf.put_u8(4);
            buf.put_slice(&seg.encode());
        }
        if let Some(importance) = self.importance {
            buf.put_u8(opt::IMPORTANCE);
            buf.put_u8(1);
            buf.put_u8(importance & 0x07);
        }
        buf.put_u8(opt::END);
        Some(buf)
    }

    pub fn encode(&self, dialect: SccpDialect) -> Result<Bytes, SccpError> {
        let called = self.called.encode(dialect);
        let calling = self.calling.encode(dialect);
        if called.len() > 255 || calling.len() > 255 {
            return Err(SccpError::InvalidAddress("address too long".to_string()));
        }
        let mut buf = BytesMut::with_capacity(16 + called.len() + calling.len() + self.data.len());
        buf.put_u8(self.mtype);
        buf.put_u8(self.second_octet());
        match self.mtype {
            msg_type::UDT | msg_type::UDTS => {
                if self.data.len() > 255 {
                    return Err(SccpError::Oversize(self.data.len()));
                }
                // Three one-octet pointers
                let p1 = 3u8;
                let p2 = p1 + called.len() as u8;
                let p3 = p2 + calling.len() as u8;
                buf.put_u8(p1);
                buf.put_u8(p2);
                buf.put_u8(p3);
                buf.put_u8(called.len() as u8);
                buf.put_slice(&called);
                buf.put_u8(calling.len() as u8);
                buf.put_slice(&calling);
                buf.put_u8(self.data.len() as u8);
                buf.put_slice(&self.data);
            }
            msg_type::XUDT | msg_type::XUDTS => {
                if self.data.len() > 255 {
                    return Err(SccpError::Oversize(self.data.len()));
                }
                buf.put_u8(self.hop_counter.unwrap_or(15));
                let optional = self.optional_area();
                let p1 = 4u8;
                let p2 = p1 + called.len() as u8;
                let p3 = p2 + calling.len() as u8;
                let p4 = match &optional {
                    Some(_) => p3 + self.data.len() as u8,
                    None => 0,
                };
                buf.put_u8(p1);
                buf.put_u8(p2);
                buf.put_u8(p3);
                buf.put_u8(p4);
                buf.put_u8(called.len() as u8);
                buf.put_slice(&called);
                buf.put_u8(calling.len() as u8);
                buf.put_slice(&calling);
                buf.put_u8(self.data.len() as u8);
                buf.put_slice(&self.data);
                if let Some(optional) = optional {
                    buf.put_slice(&optional);
                }
            }
            msg_type::LUDT | msg_type::LUDTS => {
                if self.data.len() > 3952 {
                    return Err(SccpError::Oversize(self.data.len()));
                }
                buf.put_u8(self.hop_counter.unwrap_or(15));
                let optional = self.optional_area();
                // Two-octet pointers, data length is two octets too
                let p1 = 8u16;
                let p2 = p1 + 1 + called.len() as u16 - 2;
                let p3 = p2 + 1 + calling.len() as u16 - 2;
                let p4 = match &optional {
                    Some(_) => p3 + 2 + self.data.len() as u16 - 2,
                    None => 0,
                };
                buf.put_u16_le(p1);
                buf.put_u16_le(p2);
                buf.put_u16_le(p3);
                buf.put_u16_le(p4);
                buf.put_u8(called.len() as u8);
                buf.put_slice(&called);
                buf.put_u8(calling.len() as u8);
                buf.put_slice(&calling);
                buf.put_u16_le(self.data.len() as u16);
                buf.put_slice(&self.data);
                if let Some(optional) = optional {
                    buf.put_slice(&optional);
                }
            }
            other => return Err(SccpError::InvalidMessage(format!("type {other:#04x}"))),
        }
        Ok(buf.freeze())
    }

    pub fn decode(dialect: SccpDialect, data: &Bytes) -> Result<Self, SccpError> {
        if data.len() < 2 {
            return Err(SccpError::InvalidMessage("short message".to_string()));
        }
        let mtype = data[0];
        match mtype {
            msg_type::UDT | msg_type::UDTS => {
                Self::decode_short(dialect, data, mtype, false)
            }
            msg_type::XUDT | msg_type::XUDTS => {
                Self::decode_short(dialect, data, mtype, true)
            }
            msg_type::LUDT | msg_type::LUDTS => Self::decode_long(dialect, data, mtype),
            other => Err(SccpError::InvalidMessage(format!("unknown type {other:#04x}"))),
        }
    }

    fn decode_short(
        dialect: SccpDialect,
        data: &Bytes,
        mtype: u8,
        extended: bool,
    ) -> Result<Self, SccpError> {
        let service = mtype == msg_type::UDTS || mtype == msg_type::XUDTS;
        let mut pos = 1;
        let second = *data.get(pos).ok_or_else(|| short())?;
        pos += 1;
        let hop_counter = if extended {
            let hc = *data.get(pos).ok_or_else(|| short())?;
            pos += 1;
            Some(hc)
        } else {
            None
        };
        let pointer_count = if extended { 4 } else { 3 };
        if data.len() < pos + pointer_count {
            return Err(short());
        }
        let read_var = |ptr_pos: usize| -> Result<Bytes, SccpError> {
            let ptr = data[ptr_pos] as usize;
            let at = ptr_pos + ptr;
            let len = *data.get(at).ok_or_else(short)? as usize;
            if at + 1 + len > data.len() {
                return Err(short());
            }
            Ok(data.slice(at + 1..at + 1 + len))
        };
        let called_raw = read_var(pos)?;
        let calling_raw = read_var(pos + 1)?;
        let payload = read_var(pos + 2)?;
        let mut segmentation = None;
        let mut importance = None;
        if extended {
            let opt_ptr = data[pos + 3] as usize;
            if opt_ptr > 0 {
                let mut at = pos + 3 + opt_ptr;
                while at < data.len() {
                    let code = data[at];
                    if code == opt::END {
                        break;
                    }
                    let len = *data.get(at + 1).ok_or_else(short)? as usize;
                    if at + 2 + len > data.len() {
                        return Err(short());
                    }
                    match code {
                        opt::SEGMENTATION => {
                            segmentation = Segmentation::decode(&data[at + 2..at + 2 + len]);
                        }
                        opt::IMPORTANCE => importance = data.get(at + 2).map(|b| b & 0x07),
                        _ => {}
                    }
                    at += 2 + len;
                }
            }
        }
        let called = SccpAddress::decode(dialect, called_raw)
            .ok_or_else(|| SccpError::InvalidAddress("called party".to_string()))?;
        let calling = SccpAddress::decode(dialect, calling_raw)
            .ok_or_else(|| SccpError::InvalidAddress("calling party".to_string()))?;
        Ok(Self {
            mtype,
            class: if service { ProtocolClass::CLASS_0 } else { ProtocolClass::decode(second) },
            return_cause: service.then(|| ReturnCause::from_u8(second)),
            hop_counter,
            called,
            calling,
            data: payload,
            segmentation,
            importance,
        })
    }

    fn decode_long(dialect: SccpDialect, data: &Bytes, mtype: u8) -> Result<Self, SccpError> {
        let service = mtype == msg_type::LUDTS;
        if data.len() < 11 {
            return Err(short());
        }
        let second = data[1];
        let hop_counter = data[2];
        let ptr_base = 3;
        let ptr = |i: usize| -> usize {
            data[ptr_base + 2 * i] as usize | ((data[ptr_base + 2 * i + 1] as usize) << 8)
        };
        let read_addr = |i: usize| -> Result<Bytes, SccpError> {
            let at = ptr_base + 2 * i + ptr(i);
            let len = *data.get(at).ok_or_else(short)? as usize;
            if at + 1 + len > data.len() {
                return Err(short());
            }
            Ok(data.slice(at + 1..at + 1 + len))
        };
        let called_raw = read_addr(0)?;
        let calling_raw = read_addr(1)?;
        let data_at = ptr_base + 4 + ptr(2);
        if data_at + 2 > data.len() {
            return Err(short());
        }
        let dlen = data[data_at] as usize | ((data[data_at + 1] as usize) << 8);
        if data_at + 2 + dlen > data.len() {
            return Err(short());
        }
        let payload = data.slice(data_at + 2..data_at + 2 + dlen);
        let mut segmentation = None;
        let mut importance = None;
        let opt_off = ptr(3);
        if opt_off > 0 {
            let mut at = ptr_base + 6 + opt_off;
            while at < data.len() {
                let code = data[at];
                if code == opt::END {
                    break;
                }
                let len = *data.get(at + 1).ok_or_else(short)? as usize;
                if at + 2 + len > data.len() {
                    return Err(short());
                }
                match code {
                    opt::SEGMENTATION => {
                        segmentation = Segmentation::decode(&data[at + 2..at + 2 + len]);
                    }
                    opt::IMPORTANCE => importance = data.get(at + 2).map(|b| b & 0x07),
                    _ => {}
                }
                at += 2 + len;
            }
        }
        let called = SccpAddress::decode(dialect, called_raw)
            .ok_or_else(|| SccpError::InvalidAddress("called party".to_string()))?;
        let calling = SccpAddress::decode(dialect, calling_raw)
            .ok_or_else(|| SccpError::InvalidAddress("calling party".to_string()))?;
        Ok(Self {
            mtype,
            class: if service { ProtocolClass::CLASS_0 } else { ProtocolClass::decode(second) },
            return_cause: service.then(|| ReturnCause::from_u8(second)),
            hop_counter: Some(hop_counter),
            called,
            calling,
            data: payload,
            segmentation,
            importance,
        })
    }
}

fn short() -> SccpError {
    SccpError::InvalidMessage("truncated message".to_string())
}

/// Payload capacity of a UDT given the encoded address lengths and the
/// MTP payload bound
pub fn max_udt_data(called_len: usize, calling_len: usize, mtp_max: usize) -> usize {
    // type + class + 3 pointers + 3 length octets
    mtp_max.saturating_sub(8 + called_len + calling_len).min(255)
}

/// Payload capacity of one XUDT carrying a segmentation parameter
pub fn max_xudt_data(called_len: usize, calling_len: usize, mtp_max: usize) -> usize {
    // type + class + hop + 4 pointers + 3 lengths + seg(2+4) + end
    mtp_max.saturating_sub(17 + called_len + calling_len).min(255)
}

/// Payload capacity of one LUDT segment
pub fn max_ludt_data(called_len: usize, calling_len: usize, mtp_max: usize) -> usize {
    // type + class + hop + 4 wide pointers + 2 lengths + wide length + options
    mtp_max.saturating_sub(23 + called_len + calling_len).min(3952)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sccp::address::GlobalTitle;
    use crate::types::PointCode;

    fn addr(ssn: u8) -> SccpAddress {
        SccpAddress::from_ssn_pc(ssn, PointCode::new(1, 2, 3))
    }

    #[test]
    fn udt_roundtrip() {
        let msg = SccpMessage::udt(
            ProtocolClass::CLASS_0.with_return(),
            addr(8),
            addr(6),
            Bytes::from_static(b"hello sccp"),
        );
        let wire = msg.encode(SccpDialect::Itu).unwrap();
        assert_eq!(wire[0], msg_type::UDT);
        let dec = SccpMessage::decode(SccpDialect::Itu, &wire).unwrap();
        assert_eq!(dec.data.as_ref(), b"hello sccp");
        assert_eq!(dec.called, msg.called);
        assert!(dec.class.return_on_error);
    }

    #[test]
    fn xudt_roundtrip_with_segmentation() {
        let seg = Segmentation { first: true, class1: false, remaining: 2, reference: 0x01_02_03 };
        let msg = SccpMessage::xudt(
            ProtocolClass::CLASS_1,
            12,
            SccpAddress::from_gt(GlobalTitle::e164("15551234"), Some(8)),
            addr(6),
            Bytes::from_static(&[0xAA; 40]),
            Some(seg),
        );
        let wire = msg.encode(SccpDialect::Itu).unwrap();
        let dec = SccpMessage::decode(SccpDialect::Itu, &wire).unwrap();
        assert_eq!(dec.hop_counter, Some(12));
        assert_eq!(dec.segmentation, Some(seg));
        assert_eq!(dec.data.len(), 40);
    }

    #[test]
    fn ludt_roundtrip_long_payload() {
        let payload = Bytes::from(vec![0x5Au8; 600]);
        let msg = SccpMessage::ludt(
            ProtocolClass::CLASS_1,
            10,
            addr(8),
            addr(6),
            payload.clone(),
            Some(Segmentation { first: true, class1: true, remaining: 0, reference: 7 }),
        );
        let wire = msg.encode(SccpDialect::Itu).unwrap();
        let dec = SccpMessage::decode(SccpDialect::Itu, &wire).unwrap();
        assert_eq!(dec.mtype, msg_type::LUDT);
        assert_eq!(dec.data, payload);
        assert_eq!(dec.segmentation.unwrap().reference, 7);
    }

    #[test]
    fn udts_carries_return_cause() {
        let msg = SccpMessage::udt(ProtocolClass::CLASS_0, addr(8), addr(6), Bytes::new());
        let reply = msg.service_reply(ReturnCause::NoTranslationForThisAddress);
        let wire = reply.encode(SccpDialect::Itu).unwrap();
        assert_eq!(wire[0], msg_type::UDTS);
        let dec = SccpMessage::decode(SccpDialect::Itu, &wire).unwrap();
        assert_eq!(dec.return_cause, Some(ReturnCause::NoTranslationForThisAddress));
        // Addresses swapped back toward the originator
        assert_eq!(dec.called, msg.calling);
    }

    #[test]
    fn oversize_udt_rejected() {
        let msg =
            SccpMessage::udt(ProtocolClass::CLASS_0, addr(8), addr(6), Bytes::from(vec![0; 300]));
        assert!(matches!(msg.encode(SccpDialect::Itu), Err(SccpError::Oversize(_))));
    }

    #[test]
    fn size_bounds_order() {
        let udt = max_udt_data(4, 4, 272);
        let xudt = max_xudt_data(4, 4, 272);
        let ludt = max_ludt_data(4, 4, 4000);
        assert!(udt > xudt);
        assert!(ludt > udt);
    }
}
