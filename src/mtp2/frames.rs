//! Q.703 signal unit framing
//!
//! Frames arrive from the interface already stripped of flags and checksum;
//! the first three octets carry BSN/BIB, FSN/FIB and the length indicator.

use crate::errors::LinkError;
use bytes::{BufMut, Bytes, BytesMut};

/// Link status carried in an LSSU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkStatus {
    OutOfAlignment = 0,
    NormalAlignment = 1,
    EmergencyAlignment = 2,
    OutOfService = 3,
    ProcessorOutage = 4,
    Busy = 5,
}

impl LinkStatus {
    pub fn from_byte(v: u8) -> Option<Self> {
        match v & 0x07 {
            0 => Some(Self::OutOfAlignment),
            1 => Some(Self::NormalAlignment),
            2 => Some(Self::EmergencyAlignment),
            3 => Some(Self::OutOfService),
            4 => Some(Self::ProcessorOutage),
            5 => Some(Self::Busy),
            _ => None,
        }
    }

    /// An alignment indication (O, N or E)
    pub fn aligning(&self) -> bool {
        matches!(self, Self::OutOfAlignment | Self::NormalAlignment | Self::EmergencyAlignment)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OutOfAlignment => "O",
            Self::NormalAlignment => "N",
            Self::EmergencyAlignment => "E",
            Self::OutOfService => "OS",
            Self::ProcessorOutage => "PO",
            Self::Busy => "B",
        }
    }
}

/// Sequence header common to every signal unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqHeader {
    pub bsn: u8,
    pub bib: bool,
    pub fsn: u8,
    pub fib: bool,
}

impl SeqHeader {
    fn encode(&self) -> [u8; 2] {
        [
            (self.bsn & 0x7F) | if self.bib { 0x80 } else { 0 },
            (self.fsn & 0x7F) | if self.fib { 0x80 } else { 0 },
        ]
    }

    fn decode(b0: u8, b1: u8) -> Self {
        Self { bsn: b0 & 0x7F, bib: b0 & 0x80 != 0, fsn: b1 & 0x7F, fib: b1 & 0x80 != 0 }
    }
}

/// One signal unit on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Fill-in signal unit
    Fisu(SeqHeader),
    /// Link status signal unit
    Lssu(SeqHeader, LinkStatus),
    /// Message signal unit carrying SIO + SIF
    Msu(SeqHeader, Bytes),
}

impl Frame {
    pub fn header(&self) -> &SeqHeader {
        match self {
            Self::Fisu(h) | Self::Lssu(h, _) => h,
            Self::Msu(h, _) => h,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Self::Fisu(h) => {
                let mut buf = BytesMut::with_capacity(3);
                buf.put_slice(&h.encode());
                buf.put_u8(0);
                buf.freeze()
            }
            Self::Lssu(h, status) => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_slice(&h.encode());
                buf.put_u8(1);
                buf.put_u8(*status as u8);
                buf.freeze()
            }
            Self::Msu(h, data) => {
                let mut buf = BytesMut::with_capacity(3 + data.len());
                buf.put_slice(&h.encode());
                buf.put_u8(data.len().min(63) as u8);
                buf.put_slice(data);
                buf.freeze()
            }
        }
    }

    pub fn decode(packet: &[u8]) -> Result<Self, LinkError> {
        if packet.len() < 3 {
            return Err(LinkError::BadFrame(format!("short frame: {} octets", packet.len())));
        }
        let header = SeqHeader::decode(packet[0], packet[1]);
        let li = packet[2] & 0x3F;
        let payload = &packet[3..];
        match li {
            0 => Ok(Self::Fisu(header)),
            1 | 2 => {
                let status = payload
                    .first()
                    .and_then(|b| LinkStatus::from_byte(*b))
                    .ok_or_else(|| LinkError::BadFrame("LSSU without status".to_string()))?;
                Ok(Self::Lssu(header, status))
            }
            _ => {
                if payload.len() < 3 {
                    return Err(LinkError::BadFrame("MSU shorter than a label".to_string()));
                }
                // LI saturates at 63; trust the actual payload length
                Ok(Self::Msu(header, Bytes::copy_from_slice(payload)))
            }
        }
    }
}

/// Increment a 7-bit sequence number
pub fn next_seq(fsn: u8) -> u8 {
    (fsn + 1) & 0x7F
}

/// True when `fsn` lies in the window (`from`, `to`] modulo 128
pub fn in_window(fsn: u8, from: u8, to: u8) -> bool {
    if from == to {
        return false;
    }
    let span = to.wrapping_sub(from) & 0x7F;
    let off = fsn.wrapping_sub(from) & 0x7F;
    off != 0 && off <= span
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr() -> SeqHeader {
        SeqHeader { bsn: 0x15, bib: true, fsn: 0x7F, fib: false }
    }

    #[test]
    fn fisu_roundtrip() {
        let f = Frame::Fisu(hdr());
        let enc = f.encode();
        assert_eq!(enc.as_ref(), &[0x95, 0x7F, 0x00]);
        assert_eq!(Frame::decode(&enc).unwrap(), f);
    }

    #[test]
    fn lssu_roundtrip() {
        let f = Frame::Lssu(hdr(), LinkStatus::EmergencyAlignment);
        let enc = f.encode();
        assert_eq!(enc[2], 1);
        assert_eq!(enc[3], 2);
        assert_eq!(Frame::decode(&enc).unwrap(), f);
    }

    #[test]
    fn msu_roundtrip_with_long_payload() {
        let payload = Bytes::from(vec![0u8; 100]);
        let f = Frame::Msu(hdr(), payload.clone());
        let enc = f.encode();
        // LI saturates at 63 but the payload stays intact
        assert_eq!(enc[2], 63);
        match Frame::decode(&enc).unwrap() {
            Frame::Msu(_, data) => assert_eq!(data, payload),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn short_frames_rejected() {
        assert!(Frame::decode(&[0x00, 0x00]).is_err());
        assert!(Frame::decode(&[0, 0, 1]).is_err());
    }

    #[test]
    fn sequence_window_wraps() {
        assert!(in_window(0, 127, 5));
        assert!(in_window(2, 127, 5));
        assert!(!in_window(127, 127, 5));
        assert!(!in_window(6, 127, 5));
        assert!(next_seq(127) == 0);
    }
}
