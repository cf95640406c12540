//! TCAP component codec
//!
//! Invoke, result, error and reject components under the ITU (context
//! class) and ANSI (private class) tag sets.

use super::asn1;
use super::TcapDialect;
use crate::errors::TcapError;
use bytes::{BufMut, BytesMut};

/// Component primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentType {
    Invoke,
    /// ANSI InvokeNotLast
    InvokeNotLast,
    ResultLast,
    ResultNotLast,
    ReturnError,
    Reject,
}

impl ComponentType {
    fn tag(&self, dialect: TcapDialect) -> u8 {
        match dialect {
            TcapDialect::Itu => match self {
                Self::Invoke | Self::InvokeNotLast => 0xA1,
                Self::ResultLast => 0xA2,
                Self::ReturnError => 0xA3,
                Self::Reject => 0xA4,
                Self::ResultNotLast => 0xA7,
            },
            TcapDialect::Ansi => match self {
                Self::Invoke => 0xE9,
                Self::ResultLast => 0xEA,
                Self::ReturnError => 0xEB,
                Self::Reject => 0xEC,
                Self::InvokeNotLast => 0xED,
                Self::ResultNotLast => 0xEE,
            },
        }
    }

    fn from_tag(dialect: TcapDialect, tag: u8) -> Option<Self> {
        match dialect {
            TcapDialect::Itu => match tag {
                0xA1 => Some(Self::Invoke),
                0xA2 => Some(Self::ResultLast),
                0xA3 => Some(Self::ReturnError),
                0xA4 => Some(Self::Reject),
                0xA7 => Some(Self::ResultNotLast),
                _ => None,
            },
            TcapDialect::Ansi => match tag {
                0xE9 => Some(Self::Invoke),
                0xEA => Some(Self::ResultLast),
                0xEB => Some(Self::ReturnError),
                0xEC => Some(Self::Reject),
                0xED => Some(Self::InvokeNotLast),
                0xEE => Some(Self::ResultNotLast),
                _ => None,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Invoke => "Invoke",
            Self::InvokeNotLast => "InvokeNotLast",
            Self::ResultLast => "ResultLast",
            Self::ResultNotLast => "ResultNotLast",
            Self::ReturnError => "ReturnError",
            Self::Reject => "Reject",
        }
    }
}

/// Operation classes: who must answer and how
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// Class 1: both success and failure are reported
    SuccessOrFailureReport,
    /// Class 2: only failure is reported
    FailureOnly,
    /// Class 3: only success is reported
    SuccessOnly,
    /// Class 4: no reply expected
    NoReport,
}

impl OpClass {
    pub fn expects_result(&self) -> bool {
        matches!(self, Self::SuccessOrFailureReport | Self::SuccessOnly)
    }

    pub fn expects_error(&self) -> bool {
        matches!(self, Self::SuccessOrFailureReport | Self::FailureOnly)
    }
}

/// Reject problems across the Q.773 categories. The wire form is a
/// context tag selecting the category plus the code value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Problem {
    General(u8),
    Invoke(u8),
    ReturnResult(u8),
    ReturnError(u8),
}

/// Invoke problem codes
pub mod invoke_problem {
    pub const DUPLICATE_INVOKE_ID: u8 = 0;
    pub const UNRECOGNIZED_OPERATION: u8 = 1;
    pub const MISTYPED_PARAMETER: u8 = 2;
    pub const RESOURCE_LIMITATION: u8 = 3;
    pub const UNRECOGNIZED_LINKED_ID: u8 = 5;
}

/// General problem codes
pub mod general_problem {
    pub const UNRECOGNIZED_COMPONENT: u8 = 0;
    pub const MISTYPED_COMPONENT: u8 = 1;
    pub const BADLY_STRUCTURED: u8 = 2;
}

impl Problem {
    fn category_tag(&self) -> u8 {
        match self {
            Self::General(_) => 0x80,
            Self::Invoke(_) => 0x81,
            Self::ReturnResult(_) => 0x82,
            Self::ReturnError(_) => 0x83,
        }
    }

    fn code(&self) -> u8 {
        match self {
            Self::General(c) | Self::Invoke(c) | Self::ReturnResult(c) | Self::ReturnError(c) => {
                *c
            }
        }
    }

    fn from_wire(tag: u8, code: u8) -> Option<Self> {
        match tag {
            0x80 => Some(Self::General(code)),
            0x81 => Some(Self::Invoke(code)),
            0x82 => Some(Self::ReturnResult(code)),
            0x83 => Some(Self::ReturnError(code)),
            _ => None,
        }
    }
}

/// One component of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcapComponent {
    pub ctype: ComponentType,
    /// Invoke ID, or the rejected/answered ID
    pub invoke_id: Option<i32>,
    /// Linked (ITU) or correlation (ANSI) ID
    pub linked_id: Option<i32>,
    pub op_code: Option<i32>,
    pub error_code: Option<i32>,
    pub problem: Option<Problem>,
    pub parameter: Option<Vec<u8>>,
}

impl TcapComponent {
    pub fn invoke(invoke_id: i32, op_code: i32, parameter: Option<Vec<u8>>) -> Self {
        Self {
            ctype: ComponentType::Invoke,
            invoke_id: Some(invoke_id),
            linked_id: None,
            op_code: Some(op_code),
            error_code: None,
            problem: None,
            parameter,
        }
    }

    pub fn result_last(invoke_id: i32, op_code: Option<i32>, parameter: Option<Vec<u8>>) -> Self {
        Self {
            ctype: ComponentType::ResultLast,
            invoke_id: Some(invoke_id),
            linked_id: None,
            op_code,
            error_code: None,
            problem: None,
            parameter,
        }
    }

    pub fn return_error(invoke_id: i32, error_code: i32, parameter: Option<Vec<u8>>) -> Self {
        Self {
            ctype: ComponentType::ReturnError,
            invoke_id: Some(invoke_id),
            linked_id: None,
            op_code: None,
            error_code: Some(error_code),
            problem: None,
            parameter,
        }
    }

    pub fn reject(invoke_id: Option<i32>, problem: Problem) -> Self {
        Self {
            ctype: ComponentType::Reject,
            invoke_id,
            linked_id: None,
            op_code: None,
            error_code: None,
            problem: Some(problem),
            parameter: None,
        }
    }

    pub fn encode(&self, dialect: TcapDialect, buf: &mut BytesMut) -> Result<(), TcapError> {
        let mut content = BytesMut::with_capacity(32);
        match dialect {
            TcapDialect::Itu => {
                match self.invoke_id {
                    Some(id) => asn1::encode_integer(&mut content, 0x02, id as i64),
                    None => asn1::encode_tagged(&mut content, 0x05, &[]),
                }
                if let Some(linked) = self.linked_id {
                    asn1::encode_integer(&mut content, 0x80, linked as i64);
                }
                match self.ctype {
                    ComponentType::Invoke | ComponentType::InvokeNotLast => {
                        let op = self.op_code.ok_or(TcapError::UnrecognizedOperation)?;
                        asn1::encode_integer(&mut content, 0x02, op as i64);
                        if let Some(parameter) = &self.parameter {
                            content.extend_from_slice(parameter);
                        }
                    }
                    ComponentType::ResultLast | ComponentType::ResultNotLast => {
                        if self.op_code.is_some() || self.parameter.is_some() {
                            let mut seq = BytesMut::new();
                            if let Some(op) = self.op_code {
                                asn1::encode_integer(&mut seq, 0x02, op as i64);
                            }
                            if let Some(parameter) = &self.parameter {
                                seq.extend_from_slice(parameter);
                            }
                            asn1::encode_tagged(&mut content, 0x30, &seq);
                        }
                    }
                    ComponentType::ReturnError => {
                        let code = self.error_code.ok_or(TcapError::UnrecognizedOperation)?;
                        asn1::encode_integer(&mut content, 0x02, code as i64);
                        if let Some(parameter) = &self.parameter {
                            content.extend_from_slice(parameter);
                        }
                    }
                    ComponentType::Reject => {
                        let problem = self
                            .problem
                            .ok_or_else(|| TcapError::Ber("reject without problem".to_string()))?;
                        asn1::encode_integer(
                            &mut content,
                            problem.category_tag(),
                            problem.code() as i64,
                        );
                    }
                }
            }
            TcapDialect::Ansi => {
                // Component IDs: correlation id then invoke id, both
                // optional, under one 0xCF wrapper
                let mut ids = BytesMut::new();
                if let Some(id) = self.invoke_id {
                    ids.put_u8(id as u8);
                }
                if let Some(linked) = self.linked_id {
                    ids.put_u8(linked as u8);
                }
                asn1::encode_tagged(&mut content, 0xCF, &ids);
                match self.ctype {
                    ComponentType::Invoke | ComponentType::InvokeNotLast => {
                        let op = self.op_code.ok_or(TcapError::UnrecognizedOperation)?;
                        asn1::encode_integer(&mut content, 0xD1, op as i64);
                    }
                    ComponentType::ReturnError => {
                        let code = self.error_code.ok_or(TcapError::UnrecognizedOperation)?;
                        asn1::encode_integer(&mut content, 0xD4, code as i64);
                    }
                    ComponentType::Reject => {
                        let problem = self
                            .problem
                            .ok_or_else(|| TcapError::Ber("reject without problem".to_string()))?;
                        asn1::encode_integer(
                            &mut content,
                            0xD5,
                            ((problem.category_tag() as i64) << 8) | problem.code() as i64,
                        );
                    }
                    _ => {}
                }
                if let Some(parameter) = &self.parameter {
                    asn1::encode_tagged(&mut content, 0xF2, parameter);
                }
            }
        }
        asn1::encode_tagged(buf, self.ctype.tag(dialect), &content);
        Ok(())
    }

    fn decode(dialect: TcapDialect, ctype: ComponentType, data: &[u8]) -> Option<Self> {
        let mut component = Self {
            ctype,
            invoke_id: None,
            linked_id: None,
            op_code: None,
            error_code: None,
            problem: None,
            parameter: None,
        };
        match dialect {
            TcapDialect::Itu => {
                let mut rest = data;
                // Invoke ID or NULL for unidentified rejects
                if let Some((tag, value, total)) = asn1::decode_tagged(rest) {
                    match tag {
                        0x02 => {
                            component.invoke_id = asn1::parse_integer(value).map(|v| v as i32);
                            rest = &rest[total..];
                        }
                        0x05 => {
                            rest = &rest[total..];
                        }
                        _ => {}
                    }
                }
                if let Some((0x80, value, total)) = asn1::decode_tagged(rest) {
                    component.linked_id = asn1::parse_integer(value).map(|v| v as i32);
                    rest = &rest[total..];
                }
                match ctype {
                    ComponentType::Invoke | ComponentType::InvokeNotLast => {
                        let (tag, value, total) = asn1::decode_tagged(rest)?;
                        if tag != 0x02 {
                            return None;
                        }
                        component.op_code = asn1::parse_integer(value).map(|v| v as i32);
                        rest = &rest[total..];
                        if !rest.is_empty() {
                            component.parameter = Some(rest.to_vec());
                        }
                    }
                    ComponentType::ResultLast | ComponentType::ResultNotLast => {
                        if let Some((0x30, seq, _)) = asn1::decode_tagged(rest) {
                            let mut inner = seq;
                            if let Some((0x02, value, total)) = asn1::decode_tagged(inner) {
                                component.op_code =
                                    asn1::parse_integer(value).map(|v| v as i32);
                                inner = &inner[total..];
                            }
                            if !inner.is_empty() {
                                component.parameter = Some(inner.to_vec());
                            }
                        }
                    }
                    ComponentType::ReturnError => {
                        let (tag, value, total) = asn1::decode_tagged(rest)?;
                        if tag != 0x02 {
                            return None;
                        }
                        component.error_code = asn1::parse_integer(value).map(|v| v as i32);
                        rest = &rest[total..];
                        if !rest.is_empty() {
                            component.parameter = Some(rest.to_vec());
                        }
                    }
                    ComponentType::Reject => {
                        let (tag, value, _) = asn1::decode_tagged(rest)?;
                        let code = asn1::parse_integer(value)? as u8;
                        component.problem = Problem::from_wire(tag, code);
                    }
                }
            }
            TcapDialect::Ansi => {
                for (tag, value) in asn1::TlvIter::new(data) {
                    match tag {
                        0xCF => {
                            if let Some(&id) = value.first() {
                                component.invoke_id = Some(id as i32);
                            }
                            if let Some(&linked) = value.get(1) {
                                component.linked_id = Some(linked as i32);
                            }
                        }
                        0xD1 => component.op_code = asn1::parse_integer(value).map(|v| v as i32),
                        0xD4 => {
                            component.error_code = asn1::parse_integer(value).map(|v| v as i32)
                        }
                        0xD5 => {
                            let raw = asn1::parse_integer(value)?;
                            component.problem =
                                Problem::from_wire((raw >> 8) as u8, (raw & 0xFF) as u8);
                        }
                        0xF2 => component.parameter = Some(value.to_vec()),
                        _ => {}
                    }
                }
            }
        }
        Some(component)
    }
}

/// Decode a component portion's contents
pub(crate) fn decode_portion(
    dialect: TcapDialect,
    data: &[u8],
) -> Result<Vec<TcapComponent>, TcapError> {
    let mut components = Vec::new();
    for (tag, value) in asn1::TlvIter::new(data) {
        let Some(ctype) = ComponentType::from_tag(dialect, tag) else {
            return Err(TcapError::Ber(format!("unknown component tag {tag:#04x}")));
        };
        let component = TcapComponent::decode(dialect, ctype, value)
            .ok_or_else(|| TcapError::Ber("malformed component".to_string()))?;
        components.push(component);
    }
    Ok(components)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(dialect: TcapDialect, component: TcapComponent) -> TcapComponent {
        let mut buf = BytesMut::new();
        component.encode(dialect, &mut buf).unwrap();
        let mut out = decode_portion(dialect, &buf).unwrap();
        assert_eq!(out.len(), 1);
        out.pop().unwrap()
    }

    #[test]
    fn invoke_roundtrip_itu() {
        let c = TcapComponent::invoke(5, 1, Some(vec![0x04, 0x01, 0xAA]));
        let out = roundtrip(TcapDialect::Itu, c.clone());
        assert_eq!(out.invoke_id, Some(5));
        assert_eq!(out.op_code, Some(1));
        assert_eq!(out.parameter, c.parameter);
    }

    #[test]
    fn invoke_roundtrip_ansi() {
        let c = TcapComponent::invoke(5, 45, Some(vec![1, 2]));
        let out = roundtrip(TcapDialect::Ansi, c);
        assert_eq!(out.invoke_id, Some(5));
        assert_eq!(out.op_code, Some(45));
        assert_eq!(out.parameter, Some(vec![1, 2]));
    }

    #[test]
    fn result_last_roundtrip() {
        let c = TcapComponent::result_last(5, Some(1), None);
        let out = roundtrip(TcapDialect::Itu, c);
        assert_eq!(out.ctype, ComponentType::ResultLast);
        assert_eq!(out.invoke_id, Some(5));
        assert_eq!(out.op_code, Some(1));
    }

    #[test]
    fn reject_roundtrip_both_dialects() {
        let problem = Problem::Invoke(invoke_problem::DUPLICATE_INVOKE_ID);
        for dialect in [TcapDialect::Itu, TcapDialect::Ansi] {
            let c = TcapComponent::reject(Some(3), problem);
            let out = roundtrip(dialect, c);
            assert_eq!(out.problem, Some(problem), "{dialect:?}");
        }
    }

    #[test]
    fn return_error_roundtrip() {
        let c = TcapComponent::return_error(7, 34, None);
        let out = roundtrip(TcapDialect::Itu, c);
        assert_eq!(out.error_code, Some(34));
    }

    #[test]
    fn unknown_component_tag_fails() {
        assert!(decode_portion(TcapDialect::Itu, &[0x99, 0x00]).is_err());
    }
}
