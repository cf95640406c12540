//! M3UA (RFC 4666)
//!
//! MTP3 user adaptation over an association. The link presents the layer 2
//! contract upward: protocol data reconstructs a routing label on receive
//! and splits one on transmit, so MTP3 sees ordinary MSUs. ASP state rides
//! the ASPSM/ASPTM handshakes; SSNM keeps a destination availability view.

use super::{class, decode_message, encode_message, param, SigtranReceiver, SigtranTransport, Tlvs};
use crate::engine::{SigComponent, TICK_IDLE};
use crate::errors::{LinkError, SigtranError};
use crate::mtp2::{L2Link, L2Op, Mtp2User};
use crate::mtp3::Label;
use crate::types::{Msu, NetworkIndicator, PcType, PointCode, Sio};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// ASP state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspState {
    Down,
    Inactive,
    Active,
}

/// Message types used by the endpoint, (class, type) pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum M3uaMsg {
    AspUp,
    AspUpAck,
    AspDown,
    AspDownAck,
    Heartbeat,
    HeartbeatAck,
    AspActive,
    AspActiveAck,
    AspInactive,
    AspInactiveAck,
    Data,
    Duna,
    Dava,
    Daud,
    Scon,
    Dupu,
    Error,
    Notify,
}

impl M3uaMsg {
    pub fn wire(&self) -> (u8, u8) {
        match self {
            Self::Error => (class::MGMT, 0),
            Self::Notify => (class::MGMT, 1),
            Self::Data => (class::TRANSFER, 1),
            Self::Duna => (class::SSNM, 1),
            Self::Dava => (class::SSNM, 2),
            Self::Daud => (class::SSNM, 3),
            Self::Scon => (class::SSNM, 4),
            Self::Dupu => (class::SSNM, 5),
            Self::AspUp => (class::ASPSM, 1),
            Self::AspDown => (class::ASPSM, 2),
            Self::Heartbeat => (class::ASPSM, 3),
            Self::AspUpAck => (class::ASPSM, 4),
            Self::AspDownAck => (class::ASPSM, 5),
            Self::HeartbeatAck => (class::ASPSM, 6),
            Self::AspActive => (class::ASPTM, 1),
            Self::AspInactive => (class::ASPTM, 2),
            Self::AspActiveAck => (class::ASPTM, 3),
            Self::AspInactiveAck => (class::ASPTM, 4),
        }
    }

    pub fn from_wire(mclass: u8, mtype: u8) -> Option<Self> {
        Some(match (mclass, mtype) {
            (class::MGMT, 0) => Self::Error,
            (class::MGMT, 1) => Self::Notify,
            (class::TRANSFER, 1) => Self::Data,
            (class::SSNM, 1) => Self::Duna,
            (class::SSNM, 2) => Self::Dava,
            (class::SSNM, 3) => Self::Daud,
            (class::SSNM, 4) => Self::Scon,
            (class::SSNM, 5) => Self::Dupu,
            (class::ASPSM, 1) => Self::AspUp,
            (class::ASPSM, 2) => Self::AspDown,
            (class::ASPSM, 3) => Self::Heartbeat,
            (class::ASPSM, 4) => Self::AspUpAck,
            (class::ASPSM, 5) => Self::AspDownAck,
            (class::ASPSM, 6) => Self::HeartbeatAck,
            (class::ASPTM, 1) => Self::AspActive,
            (class::ASPTM, 2) => Self::AspInactive,
            (class::ASPTM, 3) => Self::AspActiveAck,
            (class::ASPTM, 4) => Self::AspInactiveAck,
            _ => return None,
        })
    }
}

/// MTP3 protocol data carried by DATA messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolData {
    pub opc: u32,
    pub dpc: u32,
    pub si: u8,
    pub ni: u8,
    pub mp: u8,
    pub sls: u8,
    pub data: Bytes,
}

impl ProtocolData {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + self.data.len());
        buf.put_u32(self.opc);
        buf.put_u32(self.dpc);
        buf.put_u8(self.si);
        buf.put_u8(self.ni);
        buf.put_u8(self.mp);
        buf.put_u8(self.sls);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Option<Self> {
        if data.remaining() < 12 {
            return None;
        }
        Some(Self {
            opc: data.get_u32(),
            dpc: data.get_u32(),
            si: data.get_u8(),
            ni: data.get_u8(),
            mp: data.get_u8(),
            sls: data.get_u8(),
            data,
        })
    }
}

/// One M3UA link in ASP or SG role
pub struct M3uaLink {
    name: String,
    pc_type: PcType,
    /// Answer peer handshakes like a signalling gateway
    sg_role: bool,
    routing_context: Option<u32>,
    transport: RwLock<Option<Arc<dyn SigtranTransport>>>,
    user: RwLock<Weak<dyn Mtp2User>>,
    state: Mutex<AspState>,
    /// Destination availability learned from SSNM traffic
    destinations: DashMap<u32, bool>,
}

impl M3uaLink {
    pub fn new(
        name: &str,
        pc_type: PcType,
        sg_role: bool,
        routing_context: Option<u32>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            pc_type,
            sg_role,
            routing_context,
            transport: RwLock::new(None),
            user: RwLock::new(Weak::<NullUser>::new() as Weak<dyn Mtp2User>),
            state: Mutex::new(AspState::Down),
            destinations: DashMap::new(),
        })
    }

    pub fn attach_transport(self: &Arc<Self>, transport: Arc<dyn SigtranTransport>) {
        transport.set_receiver(Arc::downgrade(self) as Weak<dyn SigtranReceiver>);
        *self.transport.write().unwrap() = Some(transport);
    }

    pub fn asp_state(&self) -> AspState {
        *self.state.lock().unwrap()
    }

    /// Availability of a destination per the SSNM view; unknown counts
    /// as available
    pub fn destination_available(&self, pc: PointCode) -> bool {
        self.destinations.get(&pc.pack(self.pc_type)).map(|e| *e.value()).unwrap_or(true)
    }

    fn send(&self, msg: M3uaMsg, params: &[(u16, &[u8])]) -> Result<(), SigtranError> {
        let (mclass, mtype) = msg.wire();
        let wire = encode_message(mclass, mtype, params);
        let transport = self.transport.read().unwrap().clone();
        transport
            .ok_or_else(|| SigtranError::SendFailed("no transport".to_string()))?
            .send_message(wire)
    }

    /// Start the ASP handshake toward the gateway
    pub fn asp_up(&self) -> Result<(), SigtranError> {
        {
            let state = self.state.lock().unwrap();
            if *state != AspState::Down {
                return Err(SigtranError::AspState(format!("ASP UP in {state:?}")));
            }
        }
        info!(link = %self.name, "sending ASP UP");
        self.send(M3uaMsg::AspUp, &[(param::INFO_STRING, b"telsig")])
    }

    fn set_state(&self, next: AspState) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            if *state == next {
                false
            } else {
                debug!(link = %self.name, ?next, "ASP state");
                *state = next;
                true
            }
        };
        if changed {
            let user = self.user.read().unwrap().upgrade();
            if let Some(user) = user {
                user.link_status(next == AspState::Active);
            }
        }
    }

    fn handle(&self, msg: M3uaMsg, params: Tlvs) {
        match msg {
            M3uaMsg::AspUp => {
                if self.sg_role {
                    let _ = self.send(M3uaMsg::AspUpAck, &[]);
                }
            }
            M3uaMsg::AspUpAck => {
                self.set_state(AspState::Inactive);
                // Proceed straight to traffic
                let _ = self.send(M3uaMsg::AspActive, &[]);
            }
            M3uaMsg::AspActive => {
                if self.sg_role {
                    let _ = self.send(M3uaMsg::AspActiveAck, &[]);
                    self.set_state(AspState::Active);
                }
            }
            M3uaMsg::AspActiveAck => self.set_state(AspState::Active),
            M3uaMsg::AspDown => {
                if self.sg_role {
                    let _ = self.send(M3uaMsg::AspDownAck, &[]);
                }
                self.set_state(AspState::Down);
            }
            M3uaMsg::AspDownAck => self.set_state(AspState::Down),
            M3uaMsg::AspInactive => {
                if self.sg_role {
                    let _ = self.send(M3uaMsg::AspInactiveAck, &[]);
                }
                self.set_state(AspState::Inactive);
            }
            M3uaMsg::AspInactiveAck => self.set_state(AspState::Inactive),
            M3uaMsg::Heartbeat => {
                let data = params.get(param::HEARTBEAT_DATA).unwrap_or(&[]).to_vec();
                let _ = self.send(M3uaMsg::HeartbeatAck, &[(param::HEARTBEAT_DATA, &data)]);
            }
            M3uaMsg::HeartbeatAck => {}
            M3uaMsg::Data => {
                let Some(raw) = params.get(param::PROTOCOL_DATA) else {
                    warn!(link = %self.name, "DATA without protocol data");
                    return;
                };
                let Some(pd) = ProtocolData::decode(Bytes::copy_from_slice(raw)) else {
                    warn!(link = %self.name, "bad protocol data");
                    return;
                };
                let label = Label::new(
                    self.pc_type,
                    PointCode::unpack(self.pc_type, pd.dpc),
                    PointCode::unpack(self.pc_type, pd.opc),
                    pd.sls,
                );
                let sio = Sio::new(pd.si, pd.mp, NetworkIndicator::from(pd.ni));
                let msu = Msu::new(sio, &label, &pd.data);
                let user = self.user.read().unwrap().upgrade();
                if let Some(user) = user {
                    user.receive_msu(msu);
                }
            }
            M3uaMsg::Duna | M3uaMsg::Dava => {
                let available = msg == M3uaMsg::Dava;
                if let Some(apc) = params.get(param::AFFECTED_PC) {
                    for chunk in apc.chunks_exact(4) {
                        let pc = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
                            & 0x00FF_FFFF;
                        self.destinations.insert(pc, available);
                        debug!(link = %self.name, pc, available, "destination state");
                    }
                }
            }
            M3uaMsg::Daud => {
                // Audit request: answer from the availability view
                if let Some(apc) = params.get(param::AFFECTED_PC) {
                    let apc = apc.to_vec();
                    for chunk in apc.chunks_exact(4) {
                        let pc = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
                            & 0x00FF_FFFF;
                        let available =
                            self.destinations.get(&pc).map(|e| *e.value()).unwrap_or(true);
                        let answer = if available { M3uaMsg::Dava } else { M3uaMsg::Duna };
                        let _ = self.send(answer, &[(param::AFFECTED_PC, chunk)]);
                    }
                }
            }
            M3uaMsg::Scon => {
                debug!(link = %self.name, "signalling congestion reported");
            }
            M3uaMsg::Dupu => {
                warn!(link = %self.name, "destination user part unavailable");
            }
            M3uaMsg::Error => {
                let code = params.get_u32(param::ERROR_CODE).unwrap_or(0);
                warn!(link = %self.name, code, "peer reported error");
            }
            M3uaMsg::Notify => {
                debug!(link = %self.name, "notify received");
            }
        }
    }
}

struct NullUser;

impl Mtp2User for NullUser {
    fn receive_msu(&self, _msu: Msu) {}

    fn link_status(&self, _operational: bool) {}
}

impl SigtranReceiver for M3uaLink {
    fn receive_message(&self, data: Bytes) {
        match decode_message(&data) {
            Ok((mclass, mtype, params)) => match M3uaMsg::from_wire(mclass, mtype) {
                Some(msg) => self.handle(msg, params),
                None => {
                    warn!(link = %self.name, mclass, mtype, "unknown message");
                    let code = 0x04u32.to_be_bytes(); // unsupported message type
                    let _ = self.send(M3uaMsg::Error, &[(param::ERROR_CODE, &code)]);
                }
            },
            Err(err) => warn!(link = %self.name, %err, "undecodable message"),
        }
    }

    fn transport_status(&self, up: bool) {
        if !up {
            self.set_state(AspState::Down);
        }
    }
}

impl L2Link for M3uaLink {
    fn transmit_msu(&self, msu: &Msu) -> Result<(), LinkError> {
        if self.asp_state() != AspState::Active {
            return Err(LinkError::NotAligned);
        }
        let Some((sio, label, payload)) = msu.split(self.pc_type) else {
            return Err(LinkError::BadFrame("bad routing label".to_string()));
        };
        if !self.destination_available(label.dpc) {
            return Err(LinkError::LinkDown);
        }
        let pd = ProtocolData {
            opc: label.opc.pack(self.pc_type),
            dpc: label.dpc.pack(self.pc_type),
            si: sio.service(),
            ni: sio.network_indicator() as u8,
            mp: sio.priority(),
            sls: label.sls,
            data: payload,
        };
        let encoded = pd.encode();
        let mut params: Vec<(u16, &[u8])> = Vec::with_capacity(2);
        let rc_bytes;
        if let Some(rc) = self.routing_context {
            rc_bytes = rc.to_be_bytes();
            params.push((param::ROUTING_CONTEXT, &rc_bytes));
        }
        params.push((param::PROTOCOL_DATA, &encoded));
        self.send(M3uaMsg::Data, &params)
            .map_err(|e| LinkError::TransmitFailed(e.to_string()))
    }

    fn operational(&self) -> bool {
        self.asp_state() == AspState::Active
    }

    fn set_user(&self, user: Weak<dyn Mtp2User>) {
        *self.user.write().unwrap() = user;
    }

    fn link_control(&self, op: L2Op) -> bool {
        match op {
            L2Op::Resume | L2Op::Align { .. } => self.asp_up().is_ok(),
            L2Op::Pause => {
                let _ = self.send(M3uaMsg::AspDown, &[]);
                self.set_state(AspState::Down);
                true
            }
            L2Op::Status => {
                info!(link = %self.name, state = ?self.asp_state(), "m3ua status");
                true
            }
        }
    }

    fn congestion_level(&self) -> u8 {
        0
    }
}

#[async_trait]
impl SigComponent for M3uaLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn component_type(&self) -> &'static str {
        "m3ua"
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
        msus: StdMutex<Vec<Msu>>,
    }

    impl Mtp2User for Collect {
        fn receive_msu(&self, msu: Msu) {
            self.msus.lock().unwrap().push(msu);
        }

        fn link_status(&self, _operational: bool) {}
    }

    fn pair() -> (Arc<M3uaLink>, Arc<M3uaLink>, Arc<LoopTransport>, Arc<LoopTransport>) {
        let (ta, tb) = LoopTransport::pair();
        let asp = M3uaLink::new("aspA", PcType::Itu, false, Some(100));
        let sg = M3uaLink::new("sgB", PcType::Itu, true, Some(100));
        asp.attach_transport(ta.clone() as Arc<dyn SigtranTransport>);
        sg.attach_transport(tb.clone() as Arc<dyn SigtranTransport>);
        (asp, sg, ta, tb)
    }

    fn pump(a: &LoopTransport, b: &LoopTransport) {
        for _ in 0..16 {
            if a.pump() + b.pump() == 0 {
                break;
            }
        }
    }

    #[test]
    fn protocol_data_roundtrip() {
        let pd = ProtocolData {
            opc: 0x1234,
            dpc: 0x4321,
            si: 3,
            ni: 2,
            mp: 0,
            sls: 5,
            data: Bytes::from_static(b"sccp"),
        };
        let enc = pd.encode();
        assert_eq!(ProtocolData::decode(enc).unwrap(), pd);
    }

    #[test]
    fn handshake_reaches_active() {
        let (asp, sg, ta, tb) = pair();
        asp.asp_up().unwrap();
        pump(&ta, &tb);
        assert_eq!(asp.asp_state(), AspState::Active);
        assert_eq!(sg.asp_state(), AspState::Active);
    }

    #[test]
    fn data_rebuilds_the_label() {
        let (asp, sg, ta, tb) = pair();
        let sink = Arc::new(Collect { msus: StdMutex::new(Vec::new()) });
        sg.set_user(Arc::downgrade(&sink) as Weak<dyn Mtp2User>);
        asp.asp_up().unwrap();
        pump(&ta, &tb);

        let label = Label::new(
            PcType::Itu,
            PointCode::new(2, 2, 2),
            PointCode::new(1, 1, 1),
            7,
        );
        let msu = Msu::new(Sio::new(3, 0, NetworkIndicator::National), &label, &[0xAB]);
        asp.transmit_msu(&msu).unwrap();
        pump(&ta, &tb);
        let got = sink.msus.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], msu);
    }

    #[test]
    fn duna_marks_destination_down() {
        let (asp, _sg, ta, tb) = pair();
        asp.asp_up().unwrap();
        pump(&ta, &tb);
        let pc = PointCode::new(2, 2, 2).pack(PcType::Itu);
        let duna = encode_message(
            class::SSNM,
            1,
            &[(param::AFFECTED_PC, &pc.to_be_bytes())],
        );
        asp.receive_message(duna);
        assert!(!asp.destination_available(PointCode::new(2, 2, 2)));
        let label = Label::new(
            PcType::Itu,
            PointCode::new(2, 2, 2),
            PointCode::new(1, 1, 1),
            0,
        );
        let msu = Msu::new(Sio::new(3, 0, NetworkIndicator::National), &label, &[]);
        assert!(asp.transmit_msu(&msu).is_err());
    }
}
