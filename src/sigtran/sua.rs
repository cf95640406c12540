//! SUA connectionless transport (RFC 3868)
//!
//! Carries SCCP-equivalent traffic natively: CLDT moves user data, CLDR
//! returns it with a cause. Addresses travel as nested TLVs inside the
//! source/destination address parameters.

use super::{class, decode_message, encode_message, param, SigtranReceiver, SigtranTransport, Tlvs};
use crate::engine::{SigComponent, TICK_IDLE};
use crate::errors::SigtranError;
use crate::sccp::ReturnCause;
use crate::types::{PcType, PointCode};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// CL class message types
const TYPE_CLDT: u8 = 1;
const TYPE_CLDR: u8 = 2;

/// Nested address parameter tags
mod addr_tag {
    pub const GLOBAL_TITLE: u16 = 0x8001;
    pub const POINT_CODE: u16 = 0x8002;
    pub const SSN: u16 = 0x8003;
}

/// SUA party address: any subset of PC, SSN and GT digits
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SuaAddress {
    pub pc: Option<PointCode>,
    pub ssn: Option<u8>,
    pub gt_digits: Option<String>,
}

impl SuaAddress {
    pub fn from_ssn_pc(ssn: u8, pc: PointCode) -> Self {
        Self { pc: Some(pc), ssn: Some(ssn), gt_digits: None }
    }

    fn encode(&self, pc_type: PcType) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        // Routing indicator: route on SSN+PC when present, else on GT
        let ri: u16 = if self.pc.is_some() { 2 } else { 1 };
        buf.put_u16(ri);
        buf.put_u16(7); // address indicator: include all present parts
        if let Some(pc) = self.pc {
            super::encode_parameter(&mut buf, addr_tag::POINT_CODE, &pc.pack(pc_type).to_be_bytes());
        }
        if let Some(ssn) = self.ssn {
            super::encode_parameter(&mut buf, addr_tag::SSN, &[0, 0, 0, ssn]);
        }
        if let Some(digits) = &self.gt_digits {
            super::encode_parameter(&mut buf, addr_tag::GLOBAL_TITLE, digits.as_bytes());
        }
        buf.freeze()
    }

    fn decode(pc_type: PcType, data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        let mut addr = Self::default();
        let mut at = 4;
        while at + 4 <= data.len() {
            let tag = u16::from_be_bytes([data[at], data[at + 1]]);
            let len = u16::from_be_bytes([data[at + 2], data[at + 3]]) as usize;
            if len < 4 || at + len > data.len() {
                return None;
            }
            let value = &data[at + 4..at + len];
            match tag {
                addr_tag::POINT_CODE if value.len() >= 4 => {
                    let packed =
                        u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                    addr.pc = Some(PointCode::unpack(pc_type, packed));
                }
                addr_tag::SSN if value.len() >= 4 => addr.ssn = Some(value[3]),
                addr_tag::GLOBAL_TITLE => {
                    addr.gt_digits = String::from_utf8(value.to_vec()).ok();
                }
                _ => {}
            }
            at += len + (4 - len % 4) % 4;
        }
        Some(addr)
    }
}

/// One decoded connectionless message
#[derive(Debug, Clone)]
pub enum SuaMsg {
    Cldt {
        routing_context: Option<u32>,
        protocol_class: u8,
        source: SuaAddress,
        destination: SuaAddress,
        sequence_control: u32,
        data: Bytes,
    },
    Cldr {
        routing_context: Option<u32>,
        cause: ReturnCause,
        source: SuaAddress,
        destination: SuaAddress,
        data: Bytes,
    },
}

/// Upward consumer of SUA traffic
pub trait SuaUser: Send + Sync {
    fn receive_cldt(&self, source: &SuaAddress, destination: &SuaAddress, data: Bytes);

    fn receive_cldr(&self, cause: ReturnCause, data: Bytes) {
        let _ = (cause, data);
    }
}

/// Connectionless SUA endpoint
pub struct SuaEndpoint {
    name: String,
    pc_type: PcType,
    routing_context: Option<u32>,
    transport: RwLock<Option<Arc<dyn SigtranTransport>>>,
    user: RwLock<Weak<dyn SuaUser>>,
}

impl SuaEndpoint {
    pub fn new(name: &str, pc_type: PcType, routing_context: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            pc_type,
            routing_context,
            transport: RwLock::new(None),
            user: RwLock::new(Weak::<NullUser>::new() as Weak<dyn SuaUser>),
        })
    }

    pub fn attach_transport(self: &Arc<Self>, transport: Arc<dyn SigtranTransport>) {
        transport.set_receiver(Arc::downgrade(self) as Weak<dyn SigtranReceiver>);
        *self.transport.write().unwrap() = Some(transport);
    }

    pub fn set_user(&self, user: Weak<dyn SuaUser>) {
        *self.user.write().unwrap() = user;
    }

    /// Send connectionless user data
    pub fn send_cldt(
        &self,
        source: &SuaAddress,
        destination: &SuaAddress,
        protocol_class: u8,
        data: &[u8],
    ) -> Result<(), SigtranError> {
        let src = source.encode(self.pc_type);
        let dst = destination.encode(self.pc_type);
        let pclass = [0u8, 0, 0, protocol_class & 0x03];
        let seq = [0u8; 4];
        let mut params: Vec<(u16, &[u8])> = Vec::with_capacity(6);
        let rc_bytes;
        if let Some(rc) = self.routing_context {
            rc_bytes = rc.to_be_bytes();
            params.push((param::ROUTING_CONTEXT, &rc_bytes));
        }
        params.push((param::SUA_PROTOCOL_CLASS, &pclass));
        params.push((param::SOURCE_ADDRESS, &src));
        params.push((param::DESTINATION_ADDRESS, &dst));
        params.push((param::SEQUENCE_CONTROL, &seq));
        params.push((param::SUA_DATA, data));
        let wire = encode_message(class::SUA_CL, TYPE_CLDT, &params);
        self.transport
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| SigtranError::SendFailed("no transport".to_string()))?
            .send_message(wire)
    }

    /// Return a received message with a cause
    pub fn send_cldr(
        &self,
        source: &SuaAddress,
        destination: &SuaAddress,
        cause: ReturnCause,
        data: &[u8],
    ) -> Result<(), SigtranError> {
        let src = source.encode(self.pc_type);
        let dst = destination.encode(self.pc_type);
        let cause_bytes = [0u8, 0, 0, cause as u8];
        let mut params: Vec<(u16, &[u8])> = Vec::with_capacity(5);
        let rc_bytes;
        if let Some(rc) = self.routing_context {
            rc_bytes = rc.to_be_bytes();
            params.push((param::ROUTING_CONTEXT, &rc_bytes));
        }
        // SCCP cause rides the status parameter in this profile
        params.push((param::STATUS, &cause_bytes));
        params.push((param::SOURCE_ADDRESS, &src));
        params.push((param::DESTINATION_ADDRESS, &dst));
        params.push((param::SUA_DATA, data));
        let wire = encode_message(class::SUA_CL, TYPE_CLDR, &params);
        self.transport
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| SigtranError::SendFailed("no transport".to_string()))?
            .send_message(wire)
    }

    pub fn decode(&self, mclass: u8, mtype: u8, params: &Tlvs) -> Option<SuaMsg> {
        if mclass != class::SUA_CL {
            return None;
        }
        let source =
            SuaAddress::decode(self.pc_type, params.get(param::SOURCE_ADDRESS)?)?;
        let destination =
            SuaAddress::decode(self.pc_type, params.get(param::DESTINATION_ADDRESS)?)?;
        let data = Bytes::copy_from_slice(params.get(param::SUA_DATA).unwrap_or(&[]));
        match mtype {
            TYPE_CLDT => Some(SuaMsg::Cldt {
                routing_context: params.get_u32(param::ROUTING_CONTEXT),
                protocol_class: params
                    .get_u32(param::SUA_PROTOCOL_CLASS)
                    .map(|v| (v & 0x03) as u8)
                    .unwrap_or(0),
                source,
                destination,
                sequence_control: params.get_u32(param::SEQUENCE_CONTROL).unwrap_or(0),
                data,
            }),
            TYPE_CLDR => Some(SuaMsg::Cldr {
                routing_context: params.get_u32(param::ROUTING_CONTEXT),
                cause: ReturnCause::from_u8(
                    params.get_u32(param::STATUS).map(|v| v as u8).unwrap_or(7),
                ),
                source,
                destination,
                data,
            }),
            _ => None,
        }
    }
}

struct NullUser;

impl SuaUser for NullUser {
    fn receive_cldt(&self, _source: &SuaAddress, _destination: &SuaAddress, _data: Bytes) {}
}

impl SigtranReceiver for SuaEndpoint {
    fn receive_message(&self, data: Bytes) {
        let (mclass, mtype, params) = match decode_message(&data) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(endpoint = %self.name, %err, "undecodable message");
                return;
            }
        };
        let Some(msg) = self.decode(mclass, mtype, &params) else {
            debug!(endpoint = %self.name, mclass, mtype, "ignoring message");
            return;
        };
        let user = self.user.read().unwrap().upgrade();
        let Some(user) = user else {
            return;
        };
        match msg {
            SuaMsg::Cldt { source, destination, data, .. } => {
                user.receive_cldt(&source, &destination, data);
            }
            SuaMsg::Cldr { cause, data, .. } => {
                user.receive_cldr(cause, data);
            }
        }
    }

    fn transport_status(&self, up: bool) {
        debug!(endpoint = %self.name, up, "transport status");
    }
}

#[async_trait]
impl SigComponent for SuaEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn component_type(&self) -> &'static str {
        "sua"
    }

    async fn tick(&self, _now: Instant) -> Duration {
        TICK_IDLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sigtran::LoopTransport;
    use std::sync::Mutex as StdMutex;

    struct Collect {
        data: StdMutex<Vec<(SuaAddress, Bytes)>>,
        returns: StdMutex<Vec<ReturnCause>>,
    }

    impl Collect {
        fn new() -> Arc<Self> {
            Arc::new(Self { data: StdMutex::new(Vec::new()), returns: StdMutex::new(Vec::new()) })
        }
    }

    impl SuaUser for Collect {
        fn receive_cldt(&self, source: &SuaAddress, _destination: &SuaAddress, data: Bytes) {
            self.data.lock().unwrap().push((source.clone(), data));
        }

        fn receive_cldr(&self, cause: ReturnCause, _data: Bytes) {
            self.returns.lock().unwrap().push(cause);
        }
    }

    fn pair() -> (Arc<SuaEndpoint>, Arc<SuaEndpoint>, Arc<LoopTransport>, Arc<LoopTransport>) {
        let (ta, tb) = LoopTransport::pair();
        let a = SuaEndpoint::new("suaA", PcType::Itu, Some(5));
        let b = SuaEndpoint::new("suaB", PcType::Itu, Some(5));
        a.attach_transport(ta.clone() as Arc<dyn SigtranTransport>);
        b.attach_transport(tb.clone() as Arc<dyn SigtranTransport>);
        (a, b, ta, tb)
    }

    #[test]
    fn address_roundtrip() {
        let addr = SuaAddress {
            pc: Some(PointCode::new(2, 140, 1)),
            ssn: Some(8),
            gt_digits: Some("15551234".to_string()),
        };
        let enc = addr.encode(PcType::Itu);
        let dec = SuaAddress::decode(PcType::Itu, &enc).unwrap();
        assert_eq!(dec, addr);
    }

    #[test]
    fn cldt_crosses_the_pair() {
        let (a, b, ta, tb) = pair();
        let sink = Collect::new();
        b.set_user(Arc::downgrade(&sink) as Weak<dyn SuaUser>);
        let src = SuaAddress::from_ssn_pc(8, PointCode::new(1, 1, 1));
        let dst = SuaAddress::from_ssn_pc(6, PointCode::new(2, 2, 2));
        a.send_cldt(&src, &dst, 0, b"tcap goes here").unwrap();
        ta.pump();
        tb.pump();
        let got = sink.data.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, src);
        assert_eq!(got[0].1.as_ref(), b"tcap goes here");
    }

    #[test]
    fn cldr_reports_cause() {
        let (a, b, ta, tb) = pair();
        let sink = Collect::new();
        a.set_user(Arc::downgrade(&sink) as Weak<dyn SuaUser>);
        let src = SuaAddress::from_ssn_pc(8, PointCode::new(1, 1, 1));
        let dst = SuaAddress::from_ssn_pc(6, PointCode::new(2, 2, 2));
        b.send_cldr(&dst, &src, ReturnCause::NoTranslationForThisAddress, b"")
            .unwrap();
        tb.pump();
        ta.pump();
        assert_eq!(
            sink.returns.lock().unwrap().as_slice(),
            &[ReturnCause::NoTranslationForThisAddress]
        );
    }
}
