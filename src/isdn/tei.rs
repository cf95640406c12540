//! TEI management (Q.921 appendix)
//!
//! Rides UI frames on SAPI 63, TEI 127. The NET side assigns identifiers
//! out of the dynamic range and audits them with T201 check rounds; the
//! CPE side requests one under T202.

use super::q921::{Q921Frame, Q921Link, UType};
use crate::engine::{SigComponent, SigTimer, TICK_IDLE};
use crate::errors::IsdnError;
use crate::iface::{PacketReceiver, SigInterface};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Management entity identifier carried first in every TEI message
const MEI: u8 = 0x0F;
/// Broadcast TEI
const TEI_BROADCAST: u8 = 127;
/// Management SAPI
const SAPI_MGMT: u8 = 63;
/// First dynamically assigned TEI
const TEI_DYN_FIRST: u8 = 64;
const TEI_DYN_LAST: u8 = 126;

/// TEI management message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TeiMsg {
    Request = 1,
    Assigned = 2,
    Denied = 3,
    CheckRequest = 4,
    CheckResponse = 5,
    Remove = 6,
    Verify = 7,
}

impl TeiMsg {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Request,
            2 => Self::Assigned,
            3 => Self::Denied,
            4 => Self::CheckRequest,
            5 => Self::CheckResponse,
            6 => Self::Remove,
            7 => Self::Verify,
            _ => return None,
        })
    }
}

/// Encode one management PDU: MEI, reference, type, action indicator
fn encode_tei_pdu(mtype: TeiMsg, ri: u16, ai: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(MEI);
    buf.put_u16(ri);
    buf.put_u8(mtype as u8);
    buf.put_u8((ai << 1) | 0x01);
    buf.freeze()
}

fn decode_tei_pdu(payload: &[u8]) -> Option<(TeiMsg, u16, u8)> {
    if payload.len() < 5 || payload[0] != MEI {
        return None;
    }
    let ri = ((payload[1] as u16) << 8) | payload[2] as u16;
    let mtype = TeiMsg::from_u8(payload[3])?;
    let ai = payload[4] >> 1;
    Some((mtype, ri, ai))
}

struct TeiSlot {
    link: Option<Arc<Q921Link>>,
    /// Reference number that obtained this TEI
    ri: u16,
    /// Outstanding check round answered
    checked: bool,
}

struct ManagerState {
    /// NET side: assignment per dynamic TEI
    slots: HashMap<u8, TeiSlot>,
    /// CPE side: request in flight
    pending_ri: Option<u16>,
    assigned_tei: Option<u8>,
    t201_check: SigTimer,
    t202_request: SigTimer,
    /// Check round in progress
    auditing: bool,
}

/// TEI manager for one interface, NET or CPE role
pub struct TeiManager {
    name: String,
    network: bool,
    iface: RwLock<Option<Arc<dyn SigInterface>>>,
    /// Child links keyed by TEI get packets forwarded after filtering
    children: RwLock<HashMap<u8, Arc<Q921Link>>>,
    state: Mutex<ManagerState>,
    ri_seed: AtomicU16,
}

impl TeiManager {
    pub fn new(name: &str, network: bool, t201_ms: u64, t202_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            network,
            iface: RwLock::new(None),
            children: RwLock::new(HashMap::new()),
            state: Mutex::new(ManagerState {
                slots: HashMap::new(),
                pending_ri: None,
                assigned_tei: None,
                t201_check: SigTimer::new(t201_ms),
                t202_request: SigTimer::new(t202_ms),
                auditing: false,
            }),
            ri_seed: AtomicU16::new(0x1234),
        })
    }

    pub fn attach_interface(self: &Arc<Self>, iface: Arc<dyn SigInterface>) {
        iface.set_receiver(Arc::downgrade(self) as Weak<dyn PacketReceiver>);
        *self.iface.write().unwrap() = Some(iface);
    }

    /// Add a child data link to be bound to an assigned TEI
    pub fn add_child(&self, tei: u8, link: Arc<Q921Link>) -> bool {
        let mut children = self.children.write().unwrap();
        if children.len() >= 128 || children.contains_key(&tei) {
            return false;
        }
        link.set_tei(tei);
        children.insert(tei, link);
        true
    }

    pub fn child(&self, tei: u8) -> Option<Arc<Q921Link>> {
        self.children.read().unwrap().get(&tei).cloned()
    }

    pub fn assigned_tei(&self) -> Option<u8> {
        self.state.lock().unwrap().assigned_tei
    }

    /// CPE: ask the network for a TEI
    pub fn request_tei(&self) -> Result<u16, IsdnError> {
        if self.network {
            return Err(IsdnError::NoTei);
        }
        let ri = self.ri_seed.fetch_add(0x3D09, Ordering::Relaxed);
        {
            let mut state = self.state.lock().unwrap();
            state.pending_ri = Some(ri);
            state.t202_request.start(Instant::now());
        }
        self.send_pdu(TeiMsg::Request, ri, TEI_BROADCAST)?;
        Ok(ri)
    }

    fn send_pdu(&self, mtype: TeiMsg, ri: u16, ai: u8) -> Result<(), IsdnError> {
        let frame = Q921Frame::U {
            sapi: SAPI_MGMT,
            tei: TEI_BROADCAST,
            command: true,
            utype: UType::Ui,
            pf: false,
            payload: encode_tei_pdu(mtype, ri, ai),
        };
        let iface = self.iface.read().unwrap().clone();
        let Some(iface) = iface else {
            return Err(IsdnError::NotEstablished);
        };
        iface
            .transmit_packet(&frame.encode(), false)
            .map_err(|e| IsdnError::BadFrame(e.to_string()))
    }

    fn pick_free_tei(&self, state: &ManagerState) -> Option<u8> {
        (TEI_DYN_FIRST..=TEI_DYN_LAST).find(|tei| !state.slots.contains_key(tei))
    }

    fn handle_pdu(&self, mtype: TeiMsg, ri: u16, ai: u8) {
        if self.network {
            self.handle_net(mtype, ri, ai);
        } else {
            self.handle_cpe(mtype, ri, ai);
        }
    }

    fn handle_net(&self, mtype: TeiMsg, ri: u16, ai: u8) {
        match mtype {
            TeiMsg::Request => {
                let assigned = {
                    let mut state = self.state.lock().unwrap();
                    // A repeated request with a known reference gets the
                    // same identifier back
                    let existing = state
                        .slots
                        .iter()
                        .find(|(_, slot)| slot.ri == ri)
                        .map(|(tei, _)| *tei);
                    match existing.or_else(|| self.pick_free_tei(&state)) {
                        Some(tei) => {
                            state
                                .slots
                                .entry(tei)
                                .or_insert(TeiSlot { link: None, ri, checked: true });
                            Some(tei)
                        }
                        None => None,
                    }
                };
                match assigned {
                    Some(tei) => {
                        info!(mgr = %self.name, ri, tei, "TEI assigned");
                        let _ = self.send_pdu(TeiMsg::Assigned, ri, tei);
                        // Bind a waiting child link if one exists
                        if let Some(link) = self.child(tei) {
                            let mut state = self.state.lock().unwrap();
                            if let Some(slot) = state.slots.get_mut(&tei) {
                                slot.link = Some(link);
                            }
                        }
                    }
                    None => {
                        warn!(mgr = %self.name, ri, "TEI pool exhausted, denying");
                        let _ = self.send_pdu(TeiMsg::Denied, ri, ai);
                    }
                }
            }
            TeiMsg::CheckResponse => {
                let mut state = self.state.lock().unwrap();
                if let Some(slot) = state.slots.get_mut(&ai) {
                    slot.checked = true;
                }
            }
            TeiMsg::Verify => {
                // The endpoint asks whether its TEI is still assigned
                let known = self.state.lock().unwrap().slots.contains_key(&ai);
                if known {
                    let _ = self.send_pdu(TeiMsg::CheckRequest, 0, ai);
                } else {
                    let _ = self.send_pdu(TeiMsg::Remove, 0, ai);
                }
            }
            _ => {}
        }
    }

    fn handle_cpe(&self, mtype: TeiMsg, ri: u16, ai: u8) {
        match mtype {
            TeiMsg::Assigned => {
                let matched = {
                    let mut state = self.state.lock().unwrap();
                    if state.pending_ri == Some(ri) {
                        state.pending_ri = None;
                        state.t202_request.stop();
                        state.assigned_tei = Some(ai);
                        true
                    } else {
                        false
                    }
                };
                if matched {
                    info!(mgr = %self.name, tei = ai, "TEI obtained");
                    if let Some(link) = self.child(0).or_else(|| self.child(ai)) {
                        // Rebind the child under its new identifier
                        let mut children = self.children.write().unwrap();
                        let link = children
                            .remove(&0)
                            .or_else(|| children.remove(&ai))
                            .unwrap_or(link);
                        link.set_tei(ai);
                        children.insert(ai, link);
                    }
                }
            }
            TeiMsg::Denied => {
                let mut state = self.state.lock().unwrap();
                if state.pending_ri == Some(ri) {
                    state.pending_ri = None;
                    state.t202_request.stop();
                    warn!(mgr = %self.name, "TEI request denied");
                }
            }
            TeiMsg::CheckRequest => {
                let tei = self.assigned_tei();
                if let Some(tei) = tei {
                    if ai == tei || ai == TEI_BROADCAST {
                        let _ = self.send_pdu(TeiMsg::CheckResponse, ri, tei);
                    }
                }
            }
            TeiMsg::Remove => {
                let removed = {
                    let mut state = self.state.lock().unwrap();
                    if state.assigned_tei == Some(ai) || ai == TEI_BROADCAST {
                        state.assigned_tei.take()
                    } else {
                        None
                    }
                };
                if let Some(tei) = removed {
                    warn!(mgr = %self.name, tei, "TEI removed by network");
                    if let Some(link) = self.child(tei) {
                        link.release();
                    }
                }
            }
            _ => {}
        }
    }
}

impl PacketReceiver for TeiManager {
    fn receive_packet(&self, packet: Bytes) {
        let Ok(frame) = Q921Frame::decode(&packet) else {
            return;
        };
        if frame.sapi() == SAPI_MGMT && frame.tei() == TEI_BROADCAST {
            if let Q921Frame::U { utype: UType::Ui, payload, .. } = &frame {
                if let Some((mtype, ri, ai)) = decode_tei_pdu(payload) {
                    debug!(mgr = %self.name, ?mtype, ri, ai, "TEI management");
                    self.handle_pdu(mtype, ri, ai);
                }
            }
            return;
        }
        // Everything else forwards to the child with that TEI
        if let Some(link) = self.child(frame.tei()) {
            link.receive_packet(packet);
        }
    }

    fn link_event(&self, event: crate::engine::LinkEvent) {
        let children: Vec<Arc<Q921Link>> =
            self.children.read().unwrap().values().cloned().collect();
        for link in children {
            link.link_event(event);
        }
    }
}

#[async_trait]
impl SigComponent for TeiManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn component_type(&self) -> &'static str {
        "tei-manager"
    }

    async fn tick(&self, now: Instant) -> Duration {
        let mut resend_request: Option<u16> = None;
        let mut check_round = false;
        let mut removals: Vec<u8> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.t202_request.fired(now) {
                state.t202_request.stop();
                if let Some(ri) = state.pending_ri {
                    resend_request = Some(ri);
                    state.t202_request.start(now);
                }
            }
            if self.network {
                if !state.t201_check.running() {
                    state.t201_check.start(now);
                }
                if state.t201_check.fired(now) {
                    state.t201_check.start(now);
                    if state.auditing {
                        // Close the audit: unanswered TEIs are removed
                        removals =
                            state
                                .slots
                                .iter()
                                .filter(|(_, slot)| !slot.checked)
                                .map(|(tei, _)| *tei)
                                .collect();
                        for tei in &removals {
                            state.slots.remove(tei);
                        }
                        state.auditing = false;
                    } else if !state.slots.is_empty() {
                        for slot in state.slots.values_mut() {
                            slot.checked = false;
                        }
                        state.auditing = true;
                        check_round = true;
                    }
                }
            }
        }
        if let Some(ri) = resend_request {
            debug!(mgr = %self.name, ri, "repeating TEI request");
            let _ = self.send_pdu(TeiMsg::Request, ri, TEI_BROADCAST);
        }
        if check_round {
            let _ = self.send_pdu(TeiMsg::CheckRequest, 0, TEI_BROADCAST);
        }
        for tei in removals {
            warn!(mgr = %self.name, tei, "TEI audit failed, removing");
            let _ = self.send_pdu(TeiMsg::Remove, 0, tei);
        }
        TICK_IDLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Q921Config;
    use crate::iface::LoopInterface;

    fn managers() -> (Arc<TeiManager>, Arc<TeiManager>, Arc<LoopInterface>, Arc<LoopInterface>) {
        let (inet, icpe) = LoopInterface::pair("net", "cpe");
        let net = TeiManager::new("teiN", true, 10_000, 2_000);
        let cpe = TeiManager::new("teiC", false, 10_000, 2_000);
        net.attach_interface(inet.clone() as Arc<dyn SigInterface>);
        cpe.attach_interface(icpe.clone() as Arc<dyn SigInterface>);
        (net, cpe, inet, icpe)
    }

    fn pump(a: &LoopInterface, b: &LoopInterface) {
        for _ in 0..16 {
            if a.pump() + b.pump() == 0 {
                break;
            }
        }
    }

    #[test]
    fn tei_pdu_roundtrip() {
        let pdu = encode_tei_pdu(TeiMsg::Request, 1234, 127);
        assert_eq!(pdu.len(), 5);
        assert_eq!(decode_tei_pdu(&pdu), Some((TeiMsg::Request, 1234, 127)));
    }

    #[test]
    fn assignment_handshake() {
        let (net, cpe, inet, icpe) = managers();
        let ri = cpe.request_tei().unwrap();
        pump(&inet, &icpe);
        let tei = cpe.assigned_tei().expect("TEI assigned");
        assert!((TEI_DYN_FIRST..=TEI_DYN_LAST).contains(&tei));
        // The network keeps the booking under the same reference
        let state = net.state.lock().unwrap();
        assert_eq!(state.slots.get(&tei).map(|s| s.ri), Some(ri));
    }

    #[test]
    fn established_after_assignment() {
        let (net, cpe, inet, icpe) = managers();
        // Child links on both sides; CPE child starts without a TEI
        let mut cfg = Q921Config::default();
        cfg.auto_restart = false;
        let cpe_link = Q921Link::new("cpeL", cfg.clone());
        cfg.network = true;
        cpe.add_child(0, cpe_link.clone());
        cpe_link.attach_interface(icpe.clone() as Arc<dyn SigInterface>);
        // The manager owns the receiver slot; restore it after the child
        // grabbed it for transmission
        cpe.clone().attach_interface(icpe.clone() as Arc<dyn SigInterface>);

        cpe.request_tei().unwrap();
        pump(&inet, &icpe);
        let tei = cpe.assigned_tei().unwrap();

        let net_link = Q921Link::new("netL", cfg);
        net_link.attach_interface(inet.clone() as Arc<dyn SigInterface>);
        net.add_child(tei, net_link.clone());
        net.clone().attach_interface(inet.clone() as Arc<dyn SigInterface>);

        cpe_link.establish();
        pump(&inet, &icpe);
        assert!(cpe_link.established());
        assert!(net_link.established());
    }

    #[test]
    fn verify_of_unknown_tei_is_removed() {
        let (net, cpe, inet, icpe) = managers();
        // CPE believes it owns TEI 70; the network does not know it
        cpe.state.lock().unwrap().assigned_tei = Some(70);
        cpe.send_pdu(TeiMsg::Verify, 0, 70).unwrap();
        pump(&inet, &icpe);
        assert_eq!(cpe.assigned_tei(), None);
        drop(net);
    }
}
