//! ISUP message codec (Q.763)
//!
//! Wire layout: CIC, one type octet, fixed mandatory parameters, pointers
//! to each variable mandatory parameter, a pointer to the optional part,
//! then optional parameters as code/length/value triplets terminated by
//! the end-of-parameters octet.

use crate::errors::IsupError;
use crate::types::{decode_digits, encode_digits};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Codec dialect; BICC reuses the ISUP grammar with a 4-octet CIC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsupDialect {
    Itu,
    Ansi,
    Bicc,
}

impl IsupDialect {
    pub fn cic_octets(&self) -> usize {
        match self {
            Self::Itu | Self::Ansi => 2,
            Self::Bicc => 4,
        }
    }

    pub fn cic_mask(&self) -> u32 {
        match self {
            Self::Itu => 0x0FFF,
            Self::Ansi => 0x3FFF,
            Self::Bicc => 0xFFFF_FFFF,
        }
    }
}

/// ISUP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Iam = 0x01,
    Sam = 0x02,
    Inr = 0x03,
    Inf = 0x04,
    Cot = 0x05,
    Acm = 0x06,
    Con = 0x07,
    Fot = 0x08,
    Anm = 0x09,
    Rel = 0x0C,
    Sus = 0x0D,
    Res = 0x0E,
    Rlc = 0x10,
    Ccr = 0x11,
    Rsc = 0x12,
    Blk = 0x13,
    Ubl = 0x14,
    Bla = 0x15,
    Uba = 0x16,
    Grs = 0x17,
    Cgb = 0x18,
    Cgu = 0x19,
    Cgba = 0x1A,
    Cgua = 0x1B,
    Gra = 0x29,
    Cpg = 0x2C,
    Usr = 0x2D,
    Ucic = 0x2E,
    Cnf = 0x2F,
    Sgm = 0x38,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => Self::Iam,
            0x02 => Self::Sam,
            0x03 => Self::Inr,
            0x04 => Self::Inf,
            0x05 => Self::Cot,
            0x06 => Self::Acm,
            0x07 => Self::Con,
            0x08 => Self::Fot,
            0x09 => Self::Anm,
            0x0C => Self::Rel,
            0x0D => Self::Sus,
            0x0E => Self::Res,
            0x10 => Self::Rlc,
            0x11 => Self::Ccr,
            0x12 => Self::Rsc,
            0x13 => Self::Blk,
            0x14 => Self::Ubl,
            0x15 => Self::Bla,
            0x16 => Self::Uba,
            0x17 => Self::Grs,
            0x18 => Self::Cgb,
            0x19 => Self::Cgu,
            0x1A => Self::Cgba,
            0x1B => Self::Cgua,
            0x29 => Self::Gra,
            0x2C => Self::Cpg,
            0x2D => Self::Usr,
            0x2E => Self::Ucic,
            0x2F => Self::Cnf,
            0x38 => Self::Sgm,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Iam => "IAM",
            Self::Sam => "SAM",
            Self::Inr => "INR",
            Self::Inf => "INF",
            Self::Cot => "COT",
            Self::Acm => "ACM",
            Self::Con => "CON",
            Self::Fot => "FOT",
            Self::Anm => "ANM",
            Self::Rel => "REL",
            Self::Sus => "SUS",
            Self::Res => "RES",
            Self::Rlc => "RLC",
            Self::Ccr => "CCR",
            Self::Rsc => "RSC",
            Self::Blk => "BLK",
            Self::Ubl => "UBL",
            Self::Bla => "BLA",
            Self::Uba => "UBA",
            Self::Grs => "GRS",
            Self::Cgb => "CGB",
            Self::Cgu => "CGU",
            Self::Cgba => "CGBA",
            Self::Cgua => "CGUA",
            Self::Gra => "GRA",
            Self::Cpg => "CPG",
            Self::Usr => "USR",
            Self::Ucic => "UCIC",
            Self::Cnf => "CNF",
            Self::Sgm => "SGM",
        }
    }
}

/// Parameter code. Known codes get constants; unknown codes survive the
/// codec untouched so compatibility information can be honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Param(pub u8);

impl Param {
    pub const END_OF_PARAMETERS: Param = Param(0x00);
    pub const CALL_REFERENCE: Param = Param(0x01);
    pub const TRANSMISSION_MEDIUM_REQUIREMENT: Param = Param(0x02);
    pub const ACCESS_TRANSPORT: Param = Param(0x03);
    pub const CALLED_PARTY_NUMBER: Param = Param(0x04);
    pub const SUBSEQUENT_NUMBER: Param = Param(0x05);
    pub const NATURE_OF_CONNECTION_INDICATORS: Param = Param(0x06);
    pub const FORWARD_CALL_INDICATORS: Param = Param(0x07);
    pub const OPTIONAL_FORWARD_CALL_INDICATORS: Param = Param(0x08);
    pub const CALLING_PARTY_CATEGORY: Param = Param(0x09);
    pub const CALLING_PARTY_NUMBER: Param = Param(0x0A);
    pub const REDIRECTING_NUMBER: Param = Param(0x0B);
    pub const REDIRECTION_NUMBER: Param = Param(0x0C);
    pub const CONNECTION_REQUEST: Param = Param(0x0D);
    pub const INFORMATION_REQUEST_INDICATORS: Param = Param(0x0E);
    pub const INFORMATION_INDICATORS: Param = Param(0x0F);
    pub const CONTINUITY_INDICATORS: Param = Param(0x10);
    pub const BACKWARD_CALL_INDICATORS: Param = Param(0x11);
    pub const CAUSE_INDICATORS: Param = Param(0x12);
    pub const REDIRECTION_INFORMATION: Param = Param(0x13);
    pub const GROUP_SUPERVISION_TYPE_INDICATOR: Param = Param(0x15);
    pub const RANGE_AND_STATUS: Param = Param(0x16);
    pub const USER_SERVICE_INFORMATION: Param = Param(0x1D);
    pub const SIGNALLING_POINT_CODE: Param = Param(0x1E);
    pub const USER_TO_USER_INFORMATION: Param = Param(0x20);
    pub const CONNECTED_NUMBER: Param = Param(0x21);
    pub const SUSPEND_RESUME_INDICATORS: Param = Param(0x22);
    pub const TRANSIT_NETWORK_SELECTION: Param = Param(0x23);
    pub const EVENT_INFORMATION: Param = Param(0x24);
    pub const CIRCUIT_STATE_INDICATOR: Param = Param(0x26);
    pub const ORIGINAL_CALLED_NUMBER: Param = Param(0x28);
    pub const OPTIONAL_BACKWARD_CALL_INDICATORS: Param = Param(0x29);
    pub const MESSAGE_COMPATIBILITY_INFORMATION: Param = Param(0x38);
    pub const PARAMETER_COMPATIBILITY_INFORMATION: Param = Param(0x39);
    pub const HOP_COUNTER: Param = Param(0x3D);
    pub const LOCATION_NUMBER: Param = Param(0x3F);
    pub const GENERIC_NUMBER: Param = Param(0xC0);
    pub const GENERIC_DIGITS: Param = Param(0xC1);
}

/// Fixed mandatory part: parameter and its octet count
type Fixed = (Param, usize);

/// Per-message parameter layout
fn layout(mtype: MsgType) -> (&'static [Fixed], &'static [Param]) {
    match mtype {
        MsgType::Iam => (
            &[
                (Param::NATURE_OF_CONNECTION_INDICATORS, 1),
                (Param::FORWARD_CALL_INDICATORS, 2),
                (Param::CALLING_PARTY_CATEGORY, 1),
                (Param::TRANSMISSION_MEDIUM_REQUIREMENT, 1),
            ],
            &[Param::CALLED_PARTY_NUMBER],
        ),
        MsgType::Sam => (&[], &[Param::SUBSEQUENT_NUMBER]),
        MsgType::Inr => (&[(Param::INFORMATION_REQUEST_INDICATORS, 2)], &[]),
        MsgType::Inf => (&[(Param::INFORMATION_INDICATORS, 2)], &[]),
        MsgType::Cot => (&[(Param::CONTINUITY_INDICATORS, 1)], &[]),
        MsgType::Acm | MsgType::Con => (&[(Param::BACKWARD_CALL_INDICATORS, 2)], &[]),
        MsgType::Rel | MsgType::Cnf => (&[], &[Param::CAUSE_INDICATORS]),
        MsgType::Sus | MsgType::Res => (&[(Param::SUSPEND_RESUME_INDICATORS, 1)], &[]),
        MsgType::Grs | MsgType::Gra => (&[], &[Param::RANGE_AND_STATUS]),
        MsgType::Cgb | MsgType::Cgu | MsgType::Cgba | MsgType::Cgua => (
            &[(Param::GROUP_SUPERVISION_TYPE_INDICATOR, 1)],
            &[Param::RANGE_AND_STATUS],
        ),
        MsgType::Cpg => (&[(Param::EVENT_INFORMATION, 1)], &[]),
        MsgType::Usr => (&[], &[Param::USER_TO_USER_INFORMATION]),
        _ => (&[], &[]),
    }
}

/// Call progress event codes carried in EventInformation
pub mod event {
    pub const ALERTING: u8 = 0x01;
    pub const PROGRESS: u8 = 0x02;
    pub const IN_BAND_INFO: u8 = 0x03;
    pub const FORWARD_ON_BUSY: u8 = 0x04;
    pub const FORWARD_ON_NO_REPLY: u8 = 0x05;
    pub const FORWARD_UNCONDITIONAL: u8 = 0x06;
}

/// Segmentation-follows bit in the optional forward/backward indicators
pub const SEGMENTATION_FOLLOWS: u8 = 0x80;

/// Decoded ISUP message: type, CIC and parameters in wire order
#[derive(Debug, Clone)]
pub struct IsupMessage {
    pub mtype: MsgType,
    pub cic: u32,
    params: Vec<(Param, Bytes)>,
}

impl IsupMessage {
    pub fn new(mtype: MsgType, cic: u32) -> Self {
        Self { mtype, cic, params: Vec::new() }
    }

    pub fn set_param(&mut self, param: Param, value: impl Into<Bytes>) -> &mut Self {
        let value = value.into();
        if let Some(slot) = self.params.iter_mut().find(|(p, _)| *p == param) {
            slot.1 = value;
        } else {
            self.params.push((param, value));
        }
        self
    }

    pub fn param(&self, param: Param) -> Option<&Bytes> {
        self.params.iter().find(|(p, _)| *p == param).map(|(_, v)| v)
    }

    pub fn has_param(&self, param: Param) -> bool {
        self.param(param).is_some()
    }

    pub fn params(&self) -> &[(Param, Bytes)] {
        &self.params
    }

    /// Merge parameters from a follow-up segment, never overwriting
    pub fn merge(&mut self, other: &IsupMessage) {
        for (param, value) in &other.params {
            if !self.has_param(*param) {
                self.params.push((*param, value.clone()));
            }
        }
    }

    /// The message announces a follow-up SGM
    pub fn segmentation_follows(&self) -> bool {
        [Param::OPTIONAL_FORWARD_CALL_INDICATORS, Param::OPTIONAL_BACKWARD_CALL_INDICATORS]
            .iter()
            .filter_map(|p| self.param(*p))
            .any(|v| v.first().map(|b| b & SEGMENTATION_FOLLOWS != 0).unwrap_or(false))
    }

    // Typed accessors for the parameters the call engine reads

    pub fn set_called_number(&mut self, digits: &str, nai: u8, plan: u8, inn: bool) -> &mut Self {
        self.set_param(
            Param::CALLED_PARTY_NUMBER,
            encode_number(digits, nai, (plan << 4) | if inn { 0x80 } else { 0 }),
        )
    }

    pub fn called_number(&self) -> Option<String> {
        self.param(Param::CALLED_PARTY_NUMBER).map(|v| decode_number(v))
    }

    pub fn set_subsequent_number(&mut self, digits: &str) -> &mut Self {
        self.set_param(Param::SUBSEQUENT_NUMBER, encode_number(digits, 0, 0))
    }

    pub fn subsequent_number(&self) -> Option<String> {
        self.param(Param::SUBSEQUENT_NUMBER).map(|v| decode_number(v))
    }

    pub fn set_calling_number(
        &mut self,
        digits: &str,
        nai: u8,
        plan: u8,
        presentation: u8,
        screening: u8,
    ) -> &mut Self {
        self.set_param(
            Param::CALLING_PARTY_NUMBER,
            encode_number(
                digits,
                nai,
                (plan << 4) | ((presentation & 0x03) << 2) | (screening & 0x03),
            ),
        )
    }

    pub fn calling_number(&self) -> Option<String> {
        self.param(Param::CALLING_PARTY_NUMBER).map(|v| decode_number(v))
    }

    pub fn set_cause(&mut self, cause: u8) -> &mut Self {
        // Coding standard ITU, location "user"; no diagnostics
        self.set_param(Param::CAUSE_INDICATORS, vec![0x80, 0x80 | (cause & 0x7F)])
    }

    pub fn cause(&self) -> Option<u8> {
        self.param(Param::CAUSE_INDICATORS).and_then(|v| v.get(1)).map(|b| b & 0x7F)
    }

    pub fn set_event(&mut self, event: u8) -> &mut Self {
        self.set_param(Param::EVENT_INFORMATION, vec![event])
    }

    pub fn event_info(&self) -> Option<u8> {
        self.param(Param::EVENT_INFORMATION).and_then(|v| v.first()).copied()
    }

    pub fn set_range_and_status(&mut self, range: u8, status: &[u8]) -> &mut Self {
        let mut v = Vec::with_capacity(1 + status.len());
        v.push(range);
        v.extend_from_slice(status);
        self.set_param(Param::RANGE_AND_STATUS, v)
    }

    pub fn range(&self) -> Option<u8> {
        self.param(Param::RANGE_AND_STATUS).and_then(|v| v.first()).copied()
    }

    /// Continuity check result from a COT
    pub fn continuity_ok(&self) -> bool {
        self.param(Param::CONTINUITY_INDICATORS)
            .and_then(|v| v.first())
            .map(|b| b & 0x01 != 0)
            .unwrap_or(false)
    }

    /// Name-value view handed to the host with call events
    pub fn to_params(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("message".to_string(), self.mtype.name().to_string());
        map.insert("cic".to_string(), self.cic.to_string());
        if let Some(called) = self.called_number() {
            map.insert("called".to_string(), called);
        }
        if let Some(calling) = self.calling_number() {
            map.insert("caller".to_string(), calling);
        }
        if let Some(cause) = self.cause() {
            map.insert("cause".to_string(), cause.to_string());
        }
        if let Some(event) = self.event_info() {
            map.insert("event".to_string(), event.to_string());
        }
        map
    }

    pub fn encode(&self, dialect: IsupDialect) -> Result<Bytes, IsupError> {
        let (fixed, variable) = layout(self.mtype);
        let mut buf = BytesMut::with_capacity(64);

        let cic = self.cic & dialect.cic_mask();
        for i in 0..dialect.cic_octets() {
            buf.put_u8(((cic >> (8 * i)) & 0xFF) as u8);
        }
        buf.put_u8(self.mtype as u8);

        for (param, size) in fixed {
            let value = self.param(*param).ok_or(IsupError::MissingMandatory(param.0))?;
            if value.len() != *size {
                return Err(IsupError::BadParameterLength(param.0));
            }
            buf.put_slice(value);
        }

        // Variable mandatory pointers then the optional pointer
        let mandatory: Vec<&Bytes> = variable
            .iter()
            .map(|p| self.param(*p).ok_or(IsupError::MissingMandatory(p.0)))
            .collect::<Result<_, _>>()?;
        for value in &mandatory {
            if value.is_empty() {
                return Err(IsupError::MissingMandatory(0));
            }
        }
        let optional: Vec<&(Param, Bytes)> = self
            .params
            .iter()
            .filter(|(p, _)| {
                !fixed.iter().any(|(f, _)| f == p) && !variable.contains(p)
            })
            .collect();

        let pointer_count = variable.len() + 1;
        // Offset of each variable parameter from its own pointer octet
        let mut offset = pointer_count;
        for (i, value) in mandatory.iter().enumerate() {
            buf.put_u8((offset - i) as u8);
            offset += 1 + value.len();
        }
        if optional.is_empty() {
            buf.put_u8(0);
        } else {
            buf.put_u8((offset - variable.len()) as u8);
        }
        for value in &mandatory {
            buf.put_u8(value.len() as u8);
            buf.put_slice(value);
        }
        if !optional.is_empty() {
            for (param, value) in &optional {
                buf.put_u8(param.0);
                buf.put_u8(value.len() as u8);
                buf.put_slice(value);
            }
            buf.put_u8(Param::END_OF_PARAMETERS.0);
        }
        Ok(buf.freeze())
    }

    pub fn decode(dialect: IsupDialect, data: &Bytes) -> Result<Self, IsupError> {
        let cic_octets = dialect.cic_octets();
        if data.len() < cic_octets + 1 {
            return Err(IsupError::Underflow);
        }
        let mut cic: u32 = 0;
        for i in 0..cic_octets {
            cic |= (data[i] as u32) << (8 * i);
        }
        cic &= dialect.cic_mask();
        let type_byte = data[cic_octets];
        let mtype = MsgType::from_u8(type_byte).ok_or(IsupError::UnknownMessage(type_byte))?;
        let (fixed, variable) = layout(mtype);

        let mut msg = IsupMessage::new(mtype, cic);
        let mut pos = cic_octets + 1;
        for (param, size) in fixed {
            if pos + size > data.len() {
                return Err(IsupError::MissingMandatory(param.0));
            }
            msg.set_param(*param, data.slice(pos..pos + size));
            pos += size;
        }

        // Pointer area
        let pointer_count = variable.len() + 1;
        if pos + pointer_count > data.len() {
            return Err(IsupError::Underflow);
        }
        for (i, param) in variable.iter().enumerate() {
            let ptr = data[pos + i] as usize;
            if ptr == 0 {
                return Err(IsupError::MissingMandatory(param.0));
            }
            let at = pos + i + ptr;
            if at >= data.len() {
                return Err(IsupError::MissingMandatory(param.0));
            }
            let len = data[at] as usize;
            if len == 0 {
                return Err(IsupError::MissingMandatory(param.0));
            }
            if at + 1 + len > data.len() {
                return Err(IsupError::BadParameterLength(param.0));
            }
            msg.set_param(*param, data.slice(at + 1..at + 1 + len));
        }
        let opt_ptr = data[pos + variable.len()] as usize;
        if opt_ptr > 0 {
            let mut at = pos + variable.len() + opt_ptr;
            loop {
                if at >= data.len() {
                    break;
                }
                let code = data[at];
                if code == Param::END_OF_PARAMETERS.0 {
                    break;
                }
                if at + 1 >= data.len() {
                    return Err(IsupError::BadParameterLength(code));
                }
                let len = data[at + 1] as usize;
                if at + 2 + len > data.len() {
                    return Err(IsupError::BadParameterLength(code));
                }
                msg.set_param(Param(code), data.slice(at + 2..at + 2 + len));
                at += 2 + len;
            }
        }
        Ok(msg)
    }
}

/// Two header octets then BCD digits; the odd-count flag rides the NAI octet
fn encode_number(digits: &str, nai: u8, octet2: u8) -> Vec<u8> {
    let packed = encode_digits(digits);
    let digit_count = digits.chars().filter(|c| c.is_ascii_alphanumeric() || "*#".contains(*c)).count();
    let odd = digit_count % 2 == 1;
    let mut out = Vec::with_capacity(2 + packed.len());
    out.push((nai & 0x7F) | if odd { 0x80 } else { 0 });
    out.push(octet2);
    out.extend_from_slice(&packed);
    out
}

fn decode_number(value: &Bytes) -> String {
    if value.len() < 2 {
        return String::new();
    }
    let odd = value[0] & 0x80 != 0;
    decode_digits(&value[2..], odd)
}

/// Nature of address values for number parameters
pub mod nai {
    pub const SUBSCRIBER: u8 = 1;
    pub const UNKNOWN: u8 = 2;
    pub const NATIONAL: u8 = 3;
    pub const INTERNATIONAL: u8 = 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iam(cic: u32) -> IsupMessage {
        let mut msg = IsupMessage::new(MsgType::Iam, cic);
        msg.set_param(Param::NATURE_OF_CONNECTION_INDICATORS, vec![0x00])
            .set_param(Param::FORWARD_CALL_INDICATORS, vec![0x60, 0x01])
            .set_param(Param::CALLING_PARTY_CATEGORY, vec![0x0A])
            .set_param(Param::TRANSMISSION_MEDIUM_REQUIREMENT, vec![0x00])
            .set_called_number("15551234", nai::NATIONAL, 1, false)
            .set_calling_number("15550000", nai::NATIONAL, 1, 0, 3);
        msg
    }

    #[test]
    fn iam_roundtrip() {
        let msg = iam(42);
        let wire = msg.encode(IsupDialect::Itu).unwrap();
        // CIC is little-endian in the first two octets
        assert_eq!(wire[0], 42);
        assert_eq!(wire[1], 0);
        assert_eq!(wire[2], MsgType::Iam as u8);
        let decoded = IsupMessage::decode(IsupDialect::Itu, &wire).unwrap();
        assert_eq!(decoded.mtype, MsgType::Iam);
        assert_eq!(decoded.cic, 42);
        assert_eq!(decoded.called_number().as_deref(), Some("15551234"));
        assert_eq!(decoded.calling_number().as_deref(), Some("15550000"));
    }

    #[test]
    fn bicc_uses_wide_cic() {
        let msg = iam(0x0001_0042);
        let wire = msg.encode(IsupDialect::Bicc).unwrap();
        assert_eq!(&wire[0..4], &[0x42, 0x00, 0x01, 0x00]);
        let decoded = IsupMessage::decode(IsupDialect::Bicc, &wire).unwrap();
        assert_eq!(decoded.cic, 0x0001_0042);
    }

    #[test]
    fn rel_carries_cause() {
        let mut msg = IsupMessage::new(MsgType::Rel, 7);
        msg.set_cause(16);
        let wire = msg.encode(IsupDialect::Itu).unwrap();
        let decoded = IsupMessage::decode(IsupDialect::Itu, &wire).unwrap();
        assert_eq!(decoded.mtype, MsgType::Rel);
        assert_eq!(decoded.cause(), Some(16));
    }

    #[test]
    fn missing_mandatory_rejected() {
        let msg = IsupMessage::new(MsgType::Rel, 7);
        assert!(matches!(
            msg.encode(IsupDialect::Itu),
            Err(IsupError::MissingMandatory(_))
        ));
        // Decode side: REL whose cause pointer is zero
        let wire = Bytes::from_static(&[7, 0, 0x0C, 0x00, 0x00]);
        assert!(matches!(
            IsupMessage::decode(IsupDialect::Itu, &wire),
            Err(IsupError::MissingMandatory(_))
        ));
    }

    #[test]
    fn zero_length_mandatory_is_missing() {
        // REL with pointer to a zero-length cause parameter
        let wire = Bytes::from_static(&[7, 0, 0x0C, 0x02, 0x00, 0x00]);
        assert!(matches!(
            IsupMessage::decode(IsupDialect::Itu, &wire),
            Err(IsupError::MissingMandatory(_))
        ));
    }

    #[test]
    fn unknown_optional_parameters_survive() {
        let mut msg = IsupMessage::new(MsgType::Anm, 9);
        msg.set_param(Param(0x7E), vec![1, 2, 3]);
        let wire = msg.encode(IsupDialect::Itu).unwrap();
        let decoded = IsupMessage::decode(IsupDialect::Itu, &wire).unwrap();
        assert_eq!(decoded.param(Param(0x7E)).unwrap().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn unknown_message_type_rejected() {
        let wire = Bytes::from_static(&[1, 0, 0xEE, 0x00]);
        assert!(matches!(
            IsupMessage::decode(IsupDialect::Itu, &wire),
            Err(IsupError::UnknownMessage(0xEE))
        ));
    }

    #[test]
    fn segmentation_flag_detected() {
        let mut msg = IsupMessage::new(MsgType::Anm, 3);
        assert!(!msg.segmentation_follows());
        msg.set_param(Param::OPTIONAL_BACKWARD_CALL_INDICATORS, vec![SEGMENTATION_FOLLOWS]);
        assert!(msg.segmentation_follows());
    }

    #[test]
    fn merge_keeps_head_values() {
        let mut head = IsupMessage::new(MsgType::Iam, 1);
        head.set_cause(16);
        let mut sgm = IsupMessage::new(MsgType::Sgm, 1);
        sgm.set_cause(31);
        sgm.set_param(Param::USER_TO_USER_INFORMATION, vec![9]);
        head.merge(&sgm);
        assert_eq!(head.cause(), Some(16));
        assert!(head.has_param(Param::USER_TO_USER_INFORMATION));
    }

    #[test]
    fn cpg_event_roundtrip() {
        let mut msg = IsupMessage::new(MsgType::Cpg, 5);
        msg.set_event(event::ALERTING);
        let wire = msg.encode(IsupDialect::Itu).unwrap();
        let decoded = IsupMessage::decode(IsupDialect::Itu, &wire).unwrap();
        assert_eq!(decoded.event_info(), Some(event::ALERTING));
    }
}
