//! SCCP addressing (Q.713 3.4)
//!
//! An address carries any subset of point code, subsystem number and
//! global title behind one address indicator octet. The ANSI dialect
//! swaps the SSN/PC order and widens the point code.

use crate::types::{decode_digits, encode_digits, PcType, PointCode};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Wire dialect for addresses and management messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SccpDialect {
    Itu,
    Ansi,
}

impl SccpDialect {
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("ansi") {
            Self::Ansi
        } else {
            Self::Itu
        }
    }

    fn pc_type(&self) -> PcType {
        match self {
            Self::Itu => PcType::Itu,
            Self::Ansi => PcType::Ansi,
        }
    }
}

/// Address indicator octet fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddressIndicator {
    /// Route on SSN when set, on global title otherwise
    pub route_on_ssn: bool,
    /// Global title indicator, 0-4
    pub gti: u8,
    pub ssn_present: bool,
    pub pc_present: bool,
}

impl AddressIndicator {
    pub fn encode(&self) -> u8 {
        let mut ai = 0u8;
        if self.route_on_ssn {
            ai |= 0x40;
        }
        ai |= (self.gti & 0x0F) << 2;
        if self.ssn_present {
            ai |= 0x02;
        }
        if self.pc_present {
            ai |= 0x01;
        }
        ai
    }

    pub fn decode(v: u8) -> Self {
        Self {
            route_on_ssn: v & 0x40 != 0,
            gti: (v >> 2) & 0x0F,
            ssn_present: v & 0x02 != 0,
            pc_present: v & 0x01 != 0,
        }
    }
}

/// Global title forms by GTI value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalTitle {
    /// GTI 0001: nature of address only
    NatureOnly { nature: u8, digits: String },
    /// GTI 0010: translation type only
    TranslationOnly { translation_type: u8, digits: String },
    /// GTI 0011: translation type, numbering plan, encoding
    PlanAndType { translation_type: u8, plan: u8, digits: String },
    /// GTI 0100: the full ITU form
    Full { translation_type: u8, plan: u8, nature: u8, digits: String },
}

impl GlobalTitle {
    /// E.164 international number under the full GT form
    pub fn e164(digits: &str) -> Self {
        Self::Full { translation_type: 0, plan: 1, nature: 4, digits: digits.to_string() }
    }

    pub fn gti(&self) -> u8 {
        match self {
            Self::NatureOnly { .. } => 1,
            Self::TranslationOnly { .. } => 2,
            Self::PlanAndType { .. } => 3,
            Self::Full { .. } => 4,
        }
    }

    pub fn digits(&self) -> &str {
        match self {
            Self::NatureOnly { digits, .. }
            | Self::TranslationOnly { digits, .. }
            | Self::PlanAndType { digits, .. }
            | Self::Full { digits, .. } => digits,
        }
    }

    fn odd(&self) -> bool {
        self.digits().len() % 2 == 1
    }

    /// Encoding scheme nibble: BCD odd or even
    fn scheme(&self) -> u8 {
        if self.odd() {
            1
        } else {
            2
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::NatureOnly { nature, digits } => {
                buf.put_u8((nature & 0x7F) | if self.odd() { 0x80 } else { 0 });
                buf.put_slice(&encode_digits(digits));
            }
            Self::TranslationOnly { translation_type, digits } => {
                buf.put_u8(*translation_type);
                buf.put_slice(&encode_digits(digits));
            }
            Self::PlanAndType { translation_type, plan, digits } => {
                buf.put_u8(*translation_type);
                buf.put_u8(((plan & 0x0F) << 4) | self.scheme());
                buf.put_slice(&encode_digits(digits));
            }
            Self::Full { translation_type, plan, nature, digits } => {
                buf.put_u8(*translation_type);
                buf.put_u8(((plan & 0x0F) << 4) | self.scheme());
                buf.put_u8(nature & 0x7F);
                buf.put_slice(&encode_digits(digits));
            }
        }
    }

    pub fn decode(gti: u8, mut data: Bytes) -> Option<Self> {
        match gti {
            1 => {
                if data.remaining() < 1 {
                    return None;
                }
                let b = data.get_u8();
                let digits = decode_digits(&data, b & 0x80 != 0);
                Some(Self::NatureOnly { nature: b & 0x7F, digits })
            }
            2 => {
                if data.remaining() < 1 {
                    return None;
                }
                let tt = data.get_u8();
                Some(Self::TranslationOnly {
                    translation_type: tt,
                    digits: decode_digits(&data, false),
                })
            }
            3 => {
                if data.remaining() < 2 {
                    return None;
                }
                let tt = data.get_u8();
                let ps = data.get_u8();
                let odd = ps & 0x0F == 1;
                Some(Self::PlanAndType {
                    translation_type: tt,
                    plan: ps >> 4,
                    digits: decode_digits(&data, odd),
                })
            }
            4 => {
                if data.remaining() < 3 {
                    return None;
                }
                let tt = data.get_u8();
                let ps = data.get_u8();
                let nature = data.get_u8() & 0x7F;
                let odd = ps & 0x0F == 1;
                Some(Self::Full {
                    translation_type: tt,
                    plan: ps >> 4,
                    nature,
                    digits: decode_digits(&data, odd),
                })
            }
            _ => None,
        }
    }
}

/// One SCCP party address
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SccpAddress {
    pub indicator: AddressIndicator,
    pub point_code: Option<PointCode>,
    pub ssn: Option<u8>,
    pub global_title: Option<GlobalTitle>,
}

impl SccpAddress {
    /// Route-on-SSN address from subsystem and point code
    pub fn from_ssn_pc(ssn: u8, pc: PointCode) -> Self {
        Self {
            indicator: AddressIndicator {
                route_on_ssn: true,
                gti: 0,
                ssn_present: true,
                pc_present: true,
            },
            point_code: Some(pc),
            ssn: Some(ssn),
            global_title: None,
        }
    }

    /// Route-on-GT address, optionally naming the target subsystem
    pub fn from_gt(gt: GlobalTitle, ssn: Option<u8>) -> Self {
        Self {
            indicator: AddressIndicator {
                route_on_ssn: false,
                gti: gt.gti(),
                ssn_present: ssn.is_some(),
                pc_present: false,
            },
            point_code: None,
            ssn,
            global_title: Some(gt),
        }
    }

    /// GTT is required before this address can reach the MTP
    pub fn needs_translation(&self) -> bool {
        !self.indicator.route_on_ssn && self.point_code.is_none()
    }

    pub fn encode(&self, dialect: SccpDialect) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u8(self.indicator.encode());
        match dialect {
            SccpDialect::Itu => {
                if self.indicator.pc_present {
                    let packed =
                        self.point_code.map(|pc| pc.pack(PcType::Itu)).unwrap_or_default();
                    buf.put_u16_le(packed as u16);
                }
                if self.indicator.ssn_present {
                    buf.put_u8(self.ssn.unwrap_or(0));
                }
            }
            SccpDialect::Ansi => {
                // ANSI places the SSN ahead of the 24-bit point code
                if self.indicator.ssn_present {
                    buf.put_u8(self.ssn.unwrap_or(0));
                }
                if self.indicator.pc_present {
                    let packed =
                        self.point_code.map(|pc| pc.pack(PcType::Ansi)).unwrap_or_default();
                    buf.put_u8((packed & 0xFF) as u8);
                    buf.put_u8(((packed >> 8) & 0xFF) as u8);
                    buf.put_u8(((packed >> 16) & 0xFF) as u8);
                }
            }
        }
        if let Some(gt) = &self.global_title {
            gt.encode(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode(dialect: SccpDialect, mut data: Bytes) -> Option<Self> {
        if data.remaining() < 1 {
            return None;
        }
        let indicator = AddressIndicator::decode(data.get_u8());
        let mut point_code = None;
        let mut ssn = None;
        match dialect {
            SccpDialect::Itu => {
                if indicator.pc_present {
                    if data.remaining() < 2 {
                        return None;
                    }
                    point_code =
                        Some(PointCode::unpack(PcType::Itu, data.get_u16_le() as u32));
                }
                if indicator.ssn_present {
                    if data.remaining() < 1 {
                        return None;
                    }
                    ssn = Some(data.get_u8());
                }
            }
            SccpDialect::Ansi => {
                if indicator.ssn_present {
                    if data.remaining() < 1 {
                        return None;
                    }
                    ssn = Some(data.get_u8());
                }
                if indicator.pc_present {
                    if data.remaining() < 3 {
                        return None;
                    }
                    let packed = data.get_u8() as u32
                        | ((data.get_u8() as u32) << 8)
                        | ((data.get_u8() as u32) << 16);
                    point_code = Some(PointCode::unpack(PcType::Ansi, packed));
                }
            }
        }
        let global_title = if indicator.gti > 0 {
            Some(GlobalTitle::decode(indicator.gti, data)?)
        } else {
            None
        };
        Some(Self { indicator, point_code, ssn, global_title })
    }

    /// Stable digest for reassembly keys
    pub fn digest(&self, dialect: SccpDialect) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.encode(dialect).hash(&mut hasher);
        hasher.finish()
    }

    pub fn pc_type(&self, dialect: SccpDialect) -> PcType {
        dialect.pc_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssn_pc_roundtrip_itu() {
        let addr = SccpAddress::from_ssn_pc(8, PointCode::new(2, 140, 1));
        let enc = addr.encode(SccpDialect::Itu);
        assert_eq!(enc.len(), 4);
        let dec = SccpAddress::decode(SccpDialect::Itu, enc).unwrap();
        assert_eq!(dec, addr);
    }

    #[test]
    fn ssn_pc_roundtrip_ansi_order() {
        let addr = SccpAddress::from_ssn_pc(6, PointCode::new(200, 50, 1));
        let enc = addr.encode(SccpDialect::Ansi);
        // SSN leads in ANSI
        assert_eq!(enc[1], 6);
        assert_eq!(enc.len(), 5);
        let dec = SccpAddress::decode(SccpDialect::Ansi, enc).unwrap();
        assert_eq!(dec, addr);
    }

    #[test]
    fn gt_roundtrip_full_form() {
        let addr = SccpAddress::from_gt(GlobalTitle::e164("15551234567"), Some(6));
        let enc = addr.encode(SccpDialect::Itu);
        let dec = SccpAddress::decode(SccpDialect::Itu, enc).unwrap();
        assert_eq!(dec.global_title.as_ref().unwrap().digits(), "15551234567");
        assert_eq!(dec.ssn, Some(6));
        assert!(dec.needs_translation());
    }

    #[test]
    fn odd_digit_counts_survive() {
        for digits in ["123", "1234"] {
            let addr = SccpAddress::from_gt(GlobalTitle::e164(digits), None);
            let dec = SccpAddress::decode(SccpDialect::Itu, addr.encode(SccpDialect::Itu)).unwrap();
            assert_eq!(dec.global_title.unwrap().digits(), digits);
        }
    }

    #[test]
    fn truncated_address_rejected() {
        let addr = SccpAddress::from_ssn_pc(8, PointCode::new(2, 140, 1));
        let enc = addr.encode(SccpDialect::Itu);
        assert!(SccpAddress::decode(SccpDialect::Itu, enc.slice(0..2)).is_none());
    }
}
