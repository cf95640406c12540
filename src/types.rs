//! Common types used across the signalling stack

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Point code dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PcType {
    /// ITU-T 14-bit (3-8-3)
    Itu,
    /// ANSI 24-bit (8-8-8), 5-bit SLS
    Ansi,
    /// ANSI 24-bit with 8-bit SLS
    Ansi8,
    /// Chinese 24-bit national variant
    China,
    /// Japanese 16-bit (7-4-5)
    Japan,
    /// Japanese 16-bit with 5-bit SLS
    Japan5,
}

impl PcType {
    /// Packed point code width in bits
    pub fn bits(&self) -> u32 {
        match self {
            Self::Itu => 14,
            Self::Ansi | Self::Ansi8 | Self::China => 24,
            Self::Japan | Self::Japan5 => 16,
        }
    }

    /// Point code length in octets inside a routing label
    pub fn octets(&self) -> usize {
        match self {
            Self::Itu => 2,
            Self::Ansi | Self::Ansi8 | Self::China => 3,
            Self::Japan | Self::Japan5 => 2,
        }
    }

    /// SLS mask for this dialect
    pub fn sls_mask(&self) -> u8 {
        match self {
            Self::Itu | Self::China | Self::Japan => 0x0F,
            Self::Ansi | Self::Japan5 => 0x1F,
            Self::Ansi8 => 0xFF,
        }
    }

    /// Routing label length in octets (DPC + OPC + SLS)
    pub fn label_octets(&self) -> usize {
        match self {
            Self::Itu => 4,
            Self::Ansi | Self::Ansi8 | Self::China => 7,
            Self::Japan | Self::Japan5 => 5,
        }
    }

    /// Parse a dialect name as used in configuration
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "itu" | "itu-t" => Some(Self::Itu),
            "ansi" => Some(Self::Ansi),
            "ansi8" => Some(Self::Ansi8),
            "china" => Some(Self::China),
            "japan" => Some(Self::Japan),
            "japan5" => Some(Self::Japan5),
            _ => None,
        }
    }
}

/// SS7 point code as a (network, cluster, member) tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointCode {
    pub network: u8,
    pub cluster: u8,
    pub member: u8,
}

impl PointCode {
    pub fn new(network: u8, cluster: u8, member: u8) -> Self {
        Self { network, cluster, member }
    }

    /// Pack into the dialect's bit layout
    pub fn pack(&self, pc_type: PcType) -> u32 {
        match pc_type {
            PcType::Itu => {
                ((self.network as u32 & 0x07) << 11)
                    | ((self.cluster as u32) << 3)
                    | (self.member as u32 & 0x07)
            }
            PcType::Ansi | PcType::Ansi8 | PcType::China => {
                ((self.network as u32) << 16) | ((self.cluster as u32) << 8) | self.member as u32
            }
            PcType::Japan | PcType::Japan5 => {
                ((self.network as u32 & 0x7F) << 9)
                    | ((self.cluster as u32 & 0x0F) << 5)
                    | (self.member as u32 & 0x1F)
            }
        }
    }

    /// Unpack from the dialect's bit layout
    pub fn unpack(pc_type: PcType, packed: u32) -> Self {
        match pc_type {
            PcType::Itu => Self {
                network: ((packed >> 11) & 0x07) as u8,
                cluster: ((packed >> 3) & 0xFF) as u8,
                member: (packed & 0x07) as u8,
            },
            PcType::Ansi | PcType::Ansi8 | PcType::China => Self {
                network: ((packed >> 16) & 0xFF) as u8,
                cluster: ((packed >> 8) & 0xFF) as u8,
                member: (packed & 0xFF) as u8,
            },
            PcType::Japan | PcType::Japan5 => Self {
                network: ((packed >> 9) & 0x7F) as u8,
                cluster: ((packed >> 5) & 0x0F) as u8,
                member: (packed & 0x1F) as u8,
            },
        }
    }

    /// Parse "network-cluster-member" as used in configuration
    pub fn from_name(name: &str) -> Option<Self> {
        let mut parts = name.split('-').map(|p| p.trim().parse::<u8>().ok());
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(Some(n)), Some(Some(c)), Some(Some(m)), None) => Some(Self::new(n, c, m)),
            _ => None,
        }
    }
}

impl fmt::Display for PointCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.network, self.cluster, self.member)
    }
}

/// Network Indicator (subservice field bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NetworkIndicator {
    International = 0,
    InternationalSpare = 1,
    National = 2,
    NationalSpare = 3,
}

impl From<u8> for NetworkIndicator {
    fn from(v: u8) -> Self {
        match v & 0x03 {
            0 => Self::International,
            1 => Self::InternationalSpare,
            2 => Self::National,
            _ => Self::NationalSpare,
        }
    }
}

impl NetworkIndicator {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "international" => Some(Self::International),
            "spareinternational" | "international-spare" => Some(Self::InternationalSpare),
            "national" => Some(Self::National),
            "sparenational" | "national-spare" => Some(Self::NationalSpare),
            _ => None,
        }
    }
}

/// Service Information Octet: service indicator plus subservice field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sio(pub u8);

impl Sio {
    pub fn new(service: u8, priority: u8, ni: NetworkIndicator) -> Self {
        Self((service & 0x0F) | ((priority & 0x03) << 4) | ((ni as u8) << 6))
    }

    /// Service indicator, 0-15
    pub fn service(&self) -> u8 {
        self.0 & 0x0F
    }

    /// Message priority from the subservice field
    pub fn priority(&self) -> u8 {
        (self.0 >> 4) & 0x03
    }

    pub fn network_indicator(&self) -> NetworkIndicator {
        NetworkIndicator::from(self.0 >> 6)
    }
}

/// Message Signal Unit: SIO followed by routing label and service payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msu(pub Bytes);

impl Msu {
    pub fn new(sio: Sio, label: &crate::mtp3::Label, payload: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(1 + label.pc_type.label_octets() + payload.len());
        buf.put_u8(sio.0);
        label.encode(&mut buf);
        buf.put_slice(payload);
        Self(buf.freeze())
    }

    pub fn sio(&self) -> Option<Sio> {
        self.0.first().map(|b| Sio(*b))
    }

    /// Routing label and payload for the given dialect
    pub fn split(&self, pc_type: PcType) -> Option<(Sio, crate::mtp3::Label, Bytes)> {
        let sio = self.sio()?;
        let mut buf = self.0.slice(1..);
        let label = crate::mtp3::Label::decode(pc_type, &mut buf)?;
        Some((sio, label, buf))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Msu {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Q.850 cause values used by ISUP and Q.931
pub mod cause {
    pub const UNALLOCATED_NUMBER: u8 = 1;
    pub const NO_ROUTE: u8 = 3;
    pub const NORMAL_CLEARING: u8 = 16;
    pub const USER_BUSY: u8 = 17;
    pub const NO_USER_RESPONSE: u8 = 18;
    pub const NO_ANSWER: u8 = 19;
    pub const CALL_REJECTED: u8 = 21;
    pub const DESTINATION_OUT_OF_ORDER: u8 = 27;
    pub const INVALID_NUMBER_FORMAT: u8 = 28;
    pub const NORMAL_UNSPECIFIED: u8 = 31;
    pub const NO_CIRCUIT_AVAILABLE: u8 = 34;
    pub const TEMPORARY_FAILURE: u8 = 41;
    pub const SWITCH_CONGESTION: u8 = 42;
    pub const REQUESTED_CIRCUIT_UNAVAILABLE: u8 = 44;
    pub const RECOVERY_ON_TIMER_EXPIRY: u8 = 102;
    pub const MANDATORY_IE_MISSING: u8 = 96;
    pub const MESSAGE_TYPE_NONEXISTENT: u8 = 97;
    pub const WRONG_MESSAGE: u8 = 98;
    pub const IE_NONEXISTENT: u8 = 99;
    pub const PROTOCOL_ERROR: u8 = 111;
}

/// Q.704 15.17.5 User Part Unavailable cause bytes
pub mod upu_cause {
    pub const UNKNOWN: u8 = 0;
    pub const UNEQUIPPED: u8 = 1;
    pub const INACCESSIBLE: u8 = 2;
}

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// BCD digit helpers shared by ISUP and SCCP address codecs.
///
/// Digits pack low nibble first; a trailing odd digit is filled with 0.
/// Hex digits B (code 11) and C (code 12) carry `*` and `#`.
pub fn encode_digits(digits: &str) -> Vec<u8> {
    let vals: Vec<u8> = digits.chars().filter_map(digit_value).collect();
    let mut out = Vec::with_capacity((vals.len() + 1) / 2);
    for pair in vals.chunks(2) {
        let byte = if pair.len() == 2 { pair[0] | (pair[1] << 4) } else { pair[0] };
        out.push(byte);
    }
    out
}

/// Unpack BCD digits; `odd` drops the final filler nibble
pub fn decode_digits(data: &[u8], odd: bool) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for (i, byte) in data.iter().enumerate() {
        out.push(digit_char(byte & 0x0F));
        let last = i + 1 == data.len();
        if !(last && odd) {
            out.push(digit_char((byte >> 4) & 0x0F));
        }
    }
    out
}

fn digit_value(c: char) -> Option<u8> {
    match c {
        '0'..='9' => Some(c as u8 - b'0'),
        '*' => Some(0x0B),
        '#' => Some(0x0C),
        'a'..='f' => Some(c as u8 - b'a' + 10),
        'A'..='F' => Some(c as u8 - b'A' + 10),
        _ => None,
    }
}

fn digit_char(v: u8) -> char {
    match v {
        0..=9 => (b'0' + v) as char,
        0x0B => '*',
        0x0C => '#',
        _ => (b'a' + v - 10) as char,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointcode_roundtrip_all_dialects() {
        let pc = PointCode::new(5, 200, 3);
        for t in [PcType::Itu, PcType::Ansi, PcType::Ansi8, PcType::China] {
            let masked = PointCode::unpack(t, pc.pack(t));
            assert_eq!(PointCode::unpack(t, masked.pack(t)), masked, "{t:?}");
        }
        // Full-width roundtrip where fields fit the dialect
        let itu = PointCode::new(3, 200, 7);
        assert_eq!(PointCode::unpack(PcType::Itu, itu.pack(PcType::Itu)), itu);
        let ansi = PointCode::new(250, 200, 33);
        assert_eq!(PointCode::unpack(PcType::Ansi, ansi.pack(PcType::Ansi)), ansi);
        let jp = PointCode::new(100, 12, 30);
        assert_eq!(PointCode::unpack(PcType::Japan, jp.pack(PcType::Japan)), jp);
    }

    #[test]
    fn sio_fields() {
        let sio = Sio::new(5, 1, NetworkIndicator::National);
        assert_eq!(sio.service(), 5);
        assert_eq!(sio.priority(), 1);
        assert_eq!(sio.network_indicator(), NetworkIndicator::National);
        assert_eq!(sio.0, 0x95);
    }

    #[test]
    fn digit_packing() {
        assert_eq!(encode_digits("15551234"), vec![0x51, 0x55, 0x21, 0x43]);
        assert_eq!(decode_digits(&[0x51, 0x55, 0x21, 0x43], false), "15551234");
        assert_eq!(encode_digits("123"), vec![0x21, 0x03]);
        assert_eq!(decode_digits(&[0x21, 0x03], true), "123");
        assert_eq!(decode_digits(&encode_digits("*70#"), false), "*70#");
    }

    #[test]
    fn pointcode_name_parse() {
        assert_eq!(PointCode::from_name("2-140-1"), Some(PointCode::new(2, 140, 1)));
        assert_eq!(PointCode::from_name("bogus"), None);
    }
}
