//! TCAP transaction capabilities (Q.771-Q.775 / T1.114)
//!
//! The ITU and ANSI dialects share one message model; dialect tables pick
//! the package-type tags, transaction-id layout and component tags. The
//! transaction engine itself lives in [`transaction`].

mod asn1;
mod components;
mod transaction;

pub use components::{ComponentType, OpClass, Problem, TcapComponent};
pub use transaction::{TcapEngine, TcapTransaction, TcapUser, TransmitState, TxState};

use crate::errors::TcapError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Wire dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TcapDialect {
    Itu,
    Ansi,
}

impl TcapDialect {
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("ansi") {
            Self::Ansi
        } else {
            Self::Itu
        }
    }
}

/// Transaction primitives across both dialects.
///
/// ITU names first; the ANSI equivalents are Query/Conversation/Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Unidirectional,
    /// Begin / QueryWithPerm
    Begin,
    /// ANSI QueryWithoutPerm
    QueryWithoutPerm,
    /// Continue / ConversationWithPerm
    Continue,
    /// ANSI ConversationWithoutPerm
    ConversationWithoutPerm,
    /// End / Response
    End,
    Abort,
    /// Local notice, never on the wire
    Notice,
}

impl TransactionType {
    pub fn tag(&self, dialect: TcapDialect) -> u8 {
        match dialect {
            TcapDialect::Itu => match self {
                Self::Unidirectional => 0x61,
                Self::Begin | Self::QueryWithoutPerm => 0x62,
                Self::End => 0x64,
                Self::Continue | Self::ConversationWithoutPerm => 0x65,
                Self::Abort => 0x67,
                Self::Notice => 0x00,
            },
            TcapDialect::Ansi => match self {
                Self::Unidirectional => 0xE1,
                Self::Begin => 0xE2,
                Self::QueryWithoutPerm => 0xE3,
                Self::End => 0xE4,
                Self::Continue => 0xE5,
                Self::ConversationWithoutPerm => 0xE6,
                Self::Abort => 0xF6,
                Self::Notice => 0x00,
            },
        }
    }

    pub fn from_tag(dialect: TcapDialect, tag: u8) -> Option<Self> {
        match dialect {
            TcapDialect::Itu => match tag {
                0x61 => Some(Self::Unidirectional),
                0x62 => Some(Self::Begin),
                0x64 => Some(Self::End),
                0x65 => Some(Self::Continue),
                0x67 => Some(Self::Abort),
                _ => None,
            },
            TcapDialect::Ansi => match tag {
                0xE1 => Some(Self::Unidirectional),
                0xE2 => Some(Self::Begin),
                0xE3 => Some(Self::QueryWithoutPerm),
                0xE4 => Some(Self::End),
                0xE5 => Some(Self::Continue),
                0xE6 => Some(Self::ConversationWithoutPerm),
                0xF6 => Some(Self::Abort),
                _ => None,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Unidirectional => "Unidirectional",
            Self::Begin => "Begin",
            Self::QueryWithoutPerm => "QueryWithoutPerm",
            Self::Continue => "Continue",
            Self::ConversationWithoutPerm => "ConversationWithoutPerm",
            Self::End => "End",
            Self::Abort => "Abort",
            Self::Notice => "Notice",
        }
    }
}

/// Transaction-portion problems, carried in P-Abort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionProblem {
    UnrecognizedPackageType = 0,
    UnrecognizedTxId = 1,
    BadlyStructured = 2,
    IncorrectPortion = 3,
    ResourceUnavailable = 4,
}

impl TransactionProblem {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::UnrecognizedPackageType,
            1 => Self::UnrecognizedTxId,
            2 => Self::BadlyStructured,
            3 => Self::IncorrectPortion,
            _ => Self::ResourceUnavailable,
        }
    }
}

/// Dialogue portion. The ITU form wraps a structured dialogue PDU; ANSI
/// carries version, context and user information under private tags.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DialogPortion {
    /// Application context as an OID (ITU) or integer (ANSI, single entry)
    pub application_context: Vec<u32>,
    pub user_information: Option<Vec<u8>>,
    /// Association result: 0 accepted, 1 rejected (ITU AARE)
    pub result: Option<u8>,
    pub diagnostic: Option<u8>,
}

const ITU_DIALOG_TAG: u8 = 0x6B;
const ANSI_DIALOG_TAG: u8 = 0xF9;
/// dialogue-as-id OID under which ITU dialogue PDUs travel
const DIALOGUE_AS: [u32; 7] = [0, 0, 17, 773, 1, 1, 1];

impl DialogPortion {
    pub fn with_context(context: &[u32]) -> Self {
        Self { application_context: context.to_vec(), ..Default::default() }
    }

    fn encode(&self, dialect: TcapDialect, buf: &mut BytesMut) {
        match dialect {
            TcapDialect::Itu => {
                // AARQ when requesting, AARE when answering
                let mut pdu = BytesMut::new();
                let mut acn = BytesMut::new();
                asn1::encode_tagged(&mut acn, 0x06, &asn1::encode_oid(&self.application_context));
                asn1::encode_tagged(&mut pdu, 0xA1, &acn);
                if let Some(result) = self.result {
                    let mut res = BytesMut::new();
                    asn1::encode_integer(&mut res, 0x02, result as i64);
                    asn1::encode_tagged(&mut pdu, 0xA2, &res);
                }
                if let Some(diag) = self.diagnostic {
                    let mut d = BytesMut::new();
                    asn1::encode_integer(&mut d, 0x02, diag as i64);
                    asn1::encode_tagged(&mut pdu, 0xA3, &d);
                }
                if let Some(info) = &self.user_information {
                    asn1::encode_tagged(&mut pdu, 0xBE, info);
                }
                let pdu_tag = if self.result.is_some() { 0x61 } else { 0x60 };
                let mut wrapped = BytesMut::new();
                asn1::encode_tagged(&mut wrapped, pdu_tag, &pdu);
                let mut external = BytesMut::new();
                asn1::encode_tagged(&mut external, 0x06, &asn1::encode_oid(&DIALOGUE_AS));
                asn1::encode_tagged(&mut external, 0xA0, &wrapped);
                let mut outer = BytesMut::new();
                asn1::encode_tagged(&mut outer, 0x28, &external);
                asn1::encode_tagged(buf, ITU_DIALOG_TAG, &outer);
            }
            TcapDialect::Ansi => {
                let mut inner = BytesMut::new();
                asn1::encode_tagged(&mut inner, 0xDA, &[0x03]);
                if let Some(first) = self.application_context.first() {
                    asn1::encode_integer(&mut inner, 0xDB, *first as i64);
                }
                if let Some(info) = &self.user_information {
                    asn1::encode_tagged(&mut inner, 0xFD, info);
                }
                asn1::encode_tagged(buf, ANSI_DIALOG_TAG, &inner);
            }
        }
    }

    fn decode(dialect: TcapDialect, data: &[u8]) -> Option<Self> {
        let mut portion = Self::default();
        match dialect {
            TcapDialect::Itu => {
                let (tag, external, _) = asn1::decode_tagged(data)?;
                if tag != 0x28 {
                    return None;
                }
                let mut wrapped = None;
                for (tag, value) in asn1::TlvIter::new(external) {
                    if tag == 0xA0 {
                        wrapped = Some(value);
                    }
                }
                let (pdu_tag, pdu, _) = asn1::decode_tagged(wrapped?)?;
                if pdu_tag != 0x60 && pdu_tag != 0x61 {
                    return None;
                }
                for (tag, value) in asn1::TlvIter::new(pdu) {
                    match tag {
                        0xA1 => {
                            if let Some((0x06, oid, _)) = asn1::decode_tagged(value) {
                                portion.application_context = asn1::decode_oid(oid)?;
                            }
                        }
                        0xA2 => {
                            if let Some((_, v, _)) = asn1::decode_tagged(value) {
                                portion.result = asn1::parse_integer(v).map(|i| i as u8);
                            }
                        }
                        0xA3 => {
                            if let Some((_, v, _)) = asn1::decode_tagged(value) {
                                portion.diagnostic = asn1::parse_integer(v).map(|i| i as u8);
                            }
                        }
                        0xBE => portion.user_information = Some(value.to_vec()),
                        _ => {}
                    }
                }
                Some(portion)
            }
            TcapDialect::Ansi => {
                for (tag, value) in asn1::TlvIter::new(data) {
                    match tag {
                        0xDB => {
                            portion.application_context =
                                vec![asn1::parse_integer(value)? as u32];
                        }
                        0xDC => portion.application_context = asn1::decode_oid(value)?,
                        0xFD => portion.user_information = Some(value.to_vec()),
                        _ => {}
                    }
                }
                Some(portion)
            }
        }
    }
}

/// One TCAP message: transaction portion, dialogue, components
#[derive(Debug, Clone)]
pub struct TcapMessage {
    pub ttype: TransactionType,
    pub otid: Option<u32>,
    pub dtid: Option<u32>,
    /// Protocol abort cause, Abort only
    pub p_abort: Option<TransactionProblem>,
    /// User abort information, Abort only
    pub u_abort: Option<Vec<u8>>,
    pub dialog: Option<DialogPortion>,
    pub components: Vec<TcapComponent>,
}

impl TcapMessage {
    pub fn new(ttype: TransactionType) -> Self {
        Self {
            ttype,
            otid: None,
            dtid: None,
            p_abort: None,
            u_abort: None,
            dialog: None,
            components: Vec::new(),
        }
    }

    pub fn encode(&self, dialect: TcapDialect) -> Result<Bytes, TcapError> {
        let mut content = BytesMut::with_capacity(64);
        match dialect {
            TcapDialect::Itu => {
                if let Some(otid) = self.otid {
                    asn1::encode_tagged(&mut content, 0x48, &otid.to_be_bytes());
                }
                if let Some(dtid) = self.dtid {
                    asn1::encode_tagged(&mut content, 0x49, &dtid.to_be_bytes());
                }
                if let Some(cause) = self.p_abort {
                    asn1::encode_integer(&mut content, 0x4A, cause as i64);
                }
                if let Some(info) = &self.u_abort {
                    asn1::encode_tagged(&mut content, 0x4B, info);
                }
                if let Some(dialog) = &self.dialog {
                    dialog.encode(dialect, &mut content);
                }
                if !self.components.is_empty() {
                    let mut comps = BytesMut::new();
                    for component in &self.components {
                        component.encode(dialect, &mut comps)?;
                    }
                    asn1::encode_tagged(&mut content, 0x6C, &comps);
                }
            }
            TcapDialect::Ansi => {
                // Single transaction-id field; width depends on the type
                let mut ids = BytesMut::new();
                if let Some(otid) = self.otid {
                    ids.put_u32(otid);
                }
                if let Some(dtid) = self.dtid {
                    ids.put_u32(dtid);
                }
                asn1::encode_tagged(&mut content, 0xC7, &ids);
                if let Some(cause) = self.p_abort {
                    asn1::encode_integer(&mut content, 0xD7, cause as i64);
                }
                if let Some(info) = &self.u_abort {
                    asn1::encode_tagged(&mut content, 0xD8, info);
                }
                if let Some(dialog) = &self.dialog {
                    dialog.encode(dialect, &mut content);
                }
                if !self.components.is_empty() {
                    let mut comps = BytesMut::new();
                    for component in &self.components {
                        component.encode(dialect, &mut comps)?;
                    }
                    asn1::encode_tagged(&mut content, 0xE8, &comps);
                }
            }
        }
        let mut buf = BytesMut::with_capacity(content.len() + 4);
        asn1::encode_tagged(&mut buf, self.ttype.tag(dialect), &content);
        Ok(buf.freeze())
    }

    pub fn decode(dialect: TcapDialect, data: &[u8]) -> Result<Self, TcapError> {
        let (tag, content, _) = asn1::decode_tagged(data)
            .ok_or_else(|| TcapError::Ber("truncated message".to_string()))?;
        let ttype = TransactionType::from_tag(dialect, tag)
            .ok_or_else(|| TcapError::Ber(format!("unknown package tag {tag:#04x}")))?;
        let mut msg = Self::new(ttype);
        match dialect {
            TcapDialect::Itu => {
                for (tag, value) in asn1::TlvIter::new(content) {
                    match tag {
                        0x48 => msg.otid = be_id(value),
                        0x49 => msg.dtid = be_id(value),
                        0x4A => {
                            msg.p_abort = asn1::parse_integer(value)
                                .map(|v| TransactionProblem::from_u8(v as u8));
                        }
                        0x4B => msg.u_abort = Some(value.to_vec()),
                        ITU_DIALOG_TAG => msg.dialog = DialogPortion::decode(dialect, value),
                        0x6C => msg.components = components::decode_portion(dialect, value)?,
                        _ => {}
                    }
                }
            }
            TcapDialect::Ansi => {
                for (tag, value) in asn1::TlvIter::new(content) {
                    match tag {
                        0xC7 => match value.len() {
                            0 => {}
                            4 => {
                                // Direction depends on the package type
                                if ttype == TransactionType::End || ttype == TransactionType::Abort
                                {
                                    msg.dtid = be_id(value);
                                } else {
                                    msg.otid = be_id(value);
                                }
                            }
                            8 => {
                                msg.otid = be_id(&value[0..4]);
                                msg.dtid = be_id(&value[4..8]);
                            }
                            _ => {
                                return Err(TcapError::Ber(
                                    "bad transaction id length".to_string(),
                                ))
                            }
                        },
                        0xD7 => {
                            msg.p_abort = asn1::parse_integer(value)
                                .map(|v| TransactionProblem::from_u8(v as u8));
                        }
                        0xD8 => msg.u_abort = Some(value.to_vec()),
                        ANSI_DIALOG_TAG => msg.dialog = DialogPortion::decode(dialect, value),
                        0xE8 => msg.components = components::decode_portion(dialect, value)?,
                        _ => {}
                    }
                }
            }
        }
        Ok(msg)
    }
}

fn be_id(value: &[u8]) -> Option<u32> {
    if value.is_empty() || value.len() > 4 {
        return None;
    }
    let mut id = 0u32;
    for &b in value {
        id = (id << 8) | b as u32;
    }
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn itu_begin_roundtrip() {
        let mut msg = TcapMessage::new(TransactionType::Begin);
        msg.otid = Some(0xDEAD_BEEF);
        msg.dialog = Some(DialogPortion::with_context(&[0, 4, 0, 0, 1, 0, 20, 3]));
        msg.components.push(TcapComponent::invoke(5, 1, None));
        let wire = msg.encode(TcapDialect::Itu).unwrap();
        assert_eq!(wire[0], 0x62);
        let dec = TcapMessage::decode(TcapDialect::Itu, &wire).unwrap();
        assert_eq!(dec.ttype, TransactionType::Begin);
        assert_eq!(dec.otid, Some(0xDEAD_BEEF));
        assert_eq!(
            dec.dialog.unwrap().application_context,
            vec![0, 4, 0, 0, 1, 0, 20, 3]
        );
        assert_eq!(dec.components.len(), 1);
    }

    #[test]
    fn ansi_conversation_carries_both_ids() {
        let mut msg = TcapMessage::new(TransactionType::Continue);
        msg.otid = Some(0x11);
        msg.dtid = Some(0x22);
        let wire = msg.encode(TcapDialect::Ansi).unwrap();
        assert_eq!(wire[0], 0xE5);
        let dec = TcapMessage::decode(TcapDialect::Ansi, &wire).unwrap();
        assert_eq!(dec.otid, Some(0x11));
        assert_eq!(dec.dtid, Some(0x22));
    }

    #[test]
    fn ansi_response_id_is_destination() {
        let mut msg = TcapMessage::new(TransactionType::End);
        msg.dtid = Some(0x33);
        let wire = msg.encode(TcapDialect::Ansi).unwrap();
        let dec = TcapMessage::decode(TcapDialect::Ansi, &wire).unwrap();
        assert_eq!(dec.dtid, Some(0x33));
        assert_eq!(dec.otid, None);
    }

    #[test]
    fn abort_with_p_cause() {
        let mut msg = TcapMessage::new(TransactionType::Abort);
        msg.dtid = Some(9);
        msg.p_abort = Some(TransactionProblem::UnrecognizedTxId);
        let wire = msg.encode(TcapDialect::Itu).unwrap();
        let dec = TcapMessage::decode(TcapDialect::Itu, &wire).unwrap();
        assert_eq!(dec.p_abort, Some(TransactionProblem::UnrecognizedTxId));
    }

    #[test]
    fn unknown_package_tag_rejected() {
        assert!(TcapMessage::decode(TcapDialect::Itu, &[0x7F, 0x00]).is_err());
    }
}
