//! SIGTRAN adaptation layers
//!
//! M2PA, M2UA, M3UA, IUA and SUA substitute for hardware interfaces while
//! preserving the same upward contracts. All share the RFC common header
//! (version, reserved, class, type, length) and 16-bit-tag TLV parameters
//! padded to 4-octet boundaries.

mod backhaul;
mod m2pa;
mod m3ua;
mod sctp;
mod sua;

pub use backhaul::{BackhaulAdaptation, BackhaulLink};
pub use m2pa::{M2paLink, M2paStatus};
pub use m3ua::{AspState, M3uaLink, M3uaMsg};
pub use sctp::SctpAssociation;
pub use sua::{SuaEndpoint, SuaMsg};

use crate::errors::SigtranError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Protocol version shared by every adaptation
pub const SIGTRAN_VERSION: u8 = 1;

/// Message classes
pub mod class {
    pub const MGMT: u8 = 0;
    pub const TRANSFER: u8 = 1;
    pub const SSNM: u8 = 2;
    pub const ASPSM: u8 = 3;
    pub const ASPTM: u8 = 4;
    /// IUA Q.921/Q.931 boundary primitives
    pub const QPTM: u8 = 5;
    /// M2UA MTP2 user adaptation
    pub const MAUP: u8 = 6;
    /// SUA connectionless messages
    pub const SUA_CL: u8 = 7;
    pub const RKM: u8 = 9;
    /// M2PA user data and link status
    pub const M2PA: u8 = 11;
}

/// Common TLV parameter tags
pub mod param {
    pub const INTERFACE_ID_INT: u16 = 0x0001;
    pub const INTERFACE_ID_TEXT: u16 = 0x0003;
    pub const INFO_STRING: u16 = 0x0004;
    pub const ROUTING_CONTEXT: u16 = 0x0006;
    pub const DIAGNOSTIC_INFO: u16 = 0x0007;
    pub const HEARTBEAT_DATA: u16 = 0x0009;
    pub const TRAFFIC_MODE_TYPE: u16 = 0x000B;
    pub const ERROR_CODE: u16 = 0x000C;
    pub const STATUS: u16 = 0x000D;
    pub const ASP_IDENTIFIER: u16 = 0x0011;
    pub const AFFECTED_PC: u16 = 0x0012;
    pub const CORRELATION_ID: u16 = 0x0013;
    pub const NETWORK_APPEARANCE: u16 = 0x0200;
    pub const PROTOCOL_DATA: u16 = 0x0210;
    /// SUA addressing
    pub const SOURCE_ADDRESS: u16 = 0x0102;
    pub const DESTINATION_ADDRESS: u16 = 0x0103;
    pub const SEQUENCE_CONTROL: u16 = 0x0116;
    pub const SUA_PROTOCOL_CLASS: u16 = 0x0115;
    pub const SUA_DATA: u16 = 0x010B;
}

/// Encode one message: common header plus TLV parameters
pub fn encode_message(class: u8, mtype: u8, params: &[(u16, &[u8])]) -> Bytes {
    let mut body = BytesMut::new();
    for (tag, value) in params {
        encode_parameter(&mut body, *tag, value);
    }
    let mut buf = BytesMut::with_capacity(8 + body.len());
    buf.put_u8(SIGTRAN_VERSION);
    buf.put_u8(0);
    buf.put_u8(class);
    buf.put_u8(mtype);
    buf.put_u32(8 + body.len() as u32);
    buf.put_slice(&body);
    buf.freeze()
}

/// One TLV with zero padding to the 4-octet boundary
pub fn encode_parameter(buf: &mut BytesMut, tag: u16, value: &[u8]) {
    buf.put_u16(tag);
    buf.put_u16(4 + value.len() as u16);
    buf.put_slice(value);
    let padding = (4 - value.len() % 4) % 4;
    for _ in 0..padding {
        buf.put_u8(0);
    }
}

/// Decoded parameter set
#[derive(Debug, Default)]
pub struct Tlvs(HashMap<u16, Vec<u8>>);

impl Tlvs {
    pub fn get(&self, tag: u16) -> Option<&[u8]> {
        self.0.get(&tag).map(|v| v.as_slice())
    }

    pub fn get_u32(&self, tag: u16) -> Option<u32> {
        self.get(tag).filter(|v| v.len() >= 4).map(|v| u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
    }

    pub fn get_string(&self, tag: u16) -> Option<String> {
        self.get(tag).and_then(|v| String::from_utf8(v.to_vec()).ok())
    }

    pub fn contains(&self, tag: u16) -> bool {
        self.0.contains_key(&tag)
    }
}

/// Split a message into (class, type, parameters)
pub fn decode_message(data: &[u8]) -> Result<(u8, u8, Tlvs), SigtranError> {
    if data.len() < 8 {
        return Err(SigtranError::InvalidMessage("message shorter than header".to_string()));
    }
    let mut buf = Bytes::copy_from_slice(data);
    let version = buf.get_u8();
    if version != SIGTRAN_VERSION {
        return Err(SigtranError::BadVersion(version));
    }
    let _spare = buf.get_u8();
    let class = buf.get_u8();
    let mtype = buf.get_u8();
    let length = buf.get_u32() as usize;
    if length < 8 || data.len() < length {
        return Err(SigtranError::InvalidMessage("bad message length".to_string()));
    }
    let mut params = HashMap::new();
    while buf.remaining() >= 4 {
        let tag = buf.get_u16();
        let plen = buf.get_u16() as usize;
        if plen < 4 || buf.remaining() < plen - 4 {
            return Err(SigtranError::InvalidMessage(format!("bad TLV {tag:#06x}")));
        }
        let value = buf.copy_to_bytes(plen - 4).to_vec();
        let padding = (4 - value.len() % 4) % 4;
        if buf.remaining() >= padding {
            buf.advance(padding);
        }
        params.insert(tag, value);
    }
    Ok((class, mtype, Tlvs(params)))
}

/// Downward transport contract for adaptation layers. Real transports
/// queue to their writer task; delivery comes back on the receiver.
pub trait SigtranTransport: Send + Sync {
    fn send_message(&self, data: Bytes) -> Result<(), SigtranError>;

    fn set_receiver(&self, receiver: Weak<dyn SigtranReceiver>);

    fn transport_up(&self) -> bool;
}

/// Upward half of a transport pairing
pub trait SigtranReceiver: Send + Sync {
    fn receive_message(&self, data: Bytes);

    fn transport_status(&self, up: bool);
}

/// In-process transport pair for tests and back-to-back stacks,
/// mirroring the interface loop pair one layer down.
pub struct LoopTransport {
    peer: std::sync::Mutex<Weak<LoopTransport>>,
    receiver: std::sync::RwLock<Weak<dyn SigtranReceiver>>,
    inbox: std::sync::Mutex<std::collections::VecDeque<Bytes>>,
}

impl LoopTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::new());
        let b = Arc::new(Self::new());
        *a.peer.lock().unwrap() = Arc::downgrade(&b);
        *b.peer.lock().unwrap() = Arc::downgrade(&a);
        (a, b)
    }

    fn new() -> Self {
        Self {
            peer: std::sync::Mutex::new(Weak::new()),
            receiver: std::sync::RwLock::new(
                Weak::<NullReceiver>::new() as Weak<dyn SigtranReceiver>
            ),
            inbox: std::sync::Mutex::new(std::collections::VecDeque::new()),
        }
    }

    /// Deliver queued messages; returns the count
    pub fn pump(&self) -> usize {
        let receiver = self.receiver.read().unwrap().upgrade();
        let Some(receiver) = receiver else {
            return 0;
        };
        let mut count = 0;
        loop {
            let next = self.inbox.lock().unwrap().pop_front();
            match next {
                Some(message) => {
                    receiver.receive_message(message);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }
}

struct NullReceiver;

impl SigtranReceiver for NullReceiver {
    fn receive_message(&self, _data: Bytes) {}

    fn transport_status(&self, _up: bool) {}
}

impl SigtranTransport for LoopTransport {
    fn send_message(&self, data: Bytes) -> Result<(), SigtranError> {
        let peer = self.peer.lock().unwrap().upgrade();
        match peer {
            Some(peer) => {
                peer.inbox.lock().unwrap().push_back(data);
                Ok(())
            }
            None => Err(SigtranError::SendFailed("peer gone".to_string())),
        }
    }

    fn set_receiver(&self, receiver: Weak<dyn SigtranReceiver>) {
        *self.receiver.write().unwrap() = receiver;
    }

    fn transport_up(&self) -> bool {
        self.peer.lock().unwrap().upgrade().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_tlv_roundtrip() {
        let msg = encode_message(
            class::ASPSM,
            1,
            &[(param::INFO_STRING, b"telsig"), (param::ASP_IDENTIFIER, &[0, 0, 0, 9])],
        );
        // Length counts header plus padded parameters
        assert_eq!(msg[0], SIGTRAN_VERSION);
        assert_eq!(msg[2], class::ASPSM);
        let (class, mtype, params) = decode_message(&msg).unwrap();
        assert_eq!((class, mtype), (super::class::ASPSM, 1));
        assert_eq!(params.get_string(param::INFO_STRING).as_deref(), Some("telsig"));
        assert_eq!(params.get_u32(param::ASP_IDENTIFIER), Some(9));
    }

    #[test]
    fn padding_lands_on_four_octets() {
        let mut buf = BytesMut::new();
        encode_parameter(&mut buf, 0x0004, b"abc");
        assert_eq!(buf.len(), 8);
        assert_eq!(buf[7], 0);
    }

    #[test]
    fn bad_version_rejected() {
        let mut msg = encode_message(class::ASPSM, 1, &[]).to_vec();
        msg[0] = 2;
        assert!(matches!(decode_message(&msg), Err(SigtranError::BadVersion(2))));
    }

    #[test]
    fn loop_transport_delivers_on_pump() {
        struct Sink(std::sync::Mutex<Vec<Bytes>>);
        impl SigtranReceiver for Sink {
            fn receive_message(&self, data: Bytes) {
                self.0.lock().unwrap().push(data);
            }
            fn transport_status(&self, _up: bool) {}
        }
        let (a, b) = LoopTransport::pair();
        let sink = Arc::new(Sink(std::sync::Mutex::new(Vec::new())));
        b.set_receiver(Arc::downgrade(&sink) as Weak<dyn SigtranReceiver>);
        a.send_message(Bytes::from_static(&[1, 2, 3])).unwrap();
        assert_eq!(b.pump(), 1);
        assert_eq!(sink.0.lock().unwrap()[0].as_ref(), &[1, 2, 3]);
    }
}
