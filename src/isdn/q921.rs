//! Q.921 LAPD data link
//!
//! Frame codec plus the active multi-frame state machine and a passive
//! monitoring variant. Sequence numbers are modulo 128; retransmission is
//! bounded by N200 under T200 with T203 as the idle supervision timer.

use crate::config::Q921Config;
use crate::engine::{LinkEvent, SigComponent, SigCounter, SigTimer, TICK_IDLE};
use crate::errors::IsdnError;
use crate::iface::{PacketReceiver, SigInterface};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Supervisory frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SType {
    Rr,
    Rnr,
    Rej,
}

/// Unnumbered frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UType {
    Sabme,
    Disc,
    Ua,
    Dm,
    Frmr,
    Ui,
    Xid,
}

/// One LAPD frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Q921Frame {
    I { sapi: u8, tei: u8, command: bool, ns: u8, nr: u8, poll: bool, payload: Bytes },
    S { sapi: u8, tei: u8, command: bool, stype: SType, nr: u8, pf: bool },
    U { sapi: u8, tei: u8, command: bool, utype: UType, pf: bool, payload: Bytes },
}

impl Q921Frame {
    pub fn sapi(&self) -> u8 {
        match self {
            Self::I { sapi, .. } | Self::S { sapi, .. } | Self::U { sapi, .. } => *sapi,
        }
    }

    pub fn tei(&self) -> u8 {
        match self {
            Self::I { tei, .. } | Self::S { tei, .. } | Self::U { tei, .. } => *tei,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        let (sapi, tei, command) = match self {
            Self::I { sapi, tei, command, .. }
            | Self::S { sapi, tei, command, .. }
            | Self::U { sapi, tei, command, .. } => (*sapi, *tei, *command),
        };
        buf.put_u8((sapi << 2) | if command { 0x02 } else { 0x00 });
        buf.put_u8((tei << 1) | 0x01);
        match self {
            Self::I { ns, nr, poll, payload, .. } => {
                buf.put_u8(ns << 1);
                buf.put_u8((nr << 1) | if *poll { 1 } else { 0 });
                buf.put_slice(payload);
            }
            Self::S { stype, nr, pf, .. } => {
                buf.put_u8(match stype {
                    SType::Rr => 0x01,
                    SType::Rnr => 0x05,
                    SType::Rej => 0x09,
                });
                buf.put_u8((nr << 1) | if *pf { 1 } else { 0 });
            }
            Self::U { utype, pf, payload, .. } => {
                let pf_bit = if *pf { 0x10 } else { 0x00 };
                buf.put_u8(match utype {
                    UType::Sabme => 0x6F | pf_bit,
                    UType::Disc => 0x43 | pf_bit,
                    UType::Ua => 0x63 | pf_bit,
                    UType::Dm => 0x0F | pf_bit,
                    UType::Frmr => 0x87 | pf_bit,
                    UType::Ui => 0x03 | pf_bit,
                    UType::Xid => 0xAF | pf_bit,
                });
                buf.put_slice(payload);
            }
        }
        buf.freeze()
    }

    pub fn decode(packet: &[u8]) -> Result<Self, IsdnError> {
        if packet.len() < 3 {
            return Err(IsdnError::BadFrame(format!("short frame: {} octets", packet.len())));
        }
        let sapi = packet[0] >> 2;
        let command = packet[0] & 0x02 != 0;
        if packet[1] & 0x01 == 0 {
            return Err(IsdnError::BadFrame("extension bit missing on TEI".to_string()));
        }
        let tei = packet[1] >> 1;
        let control = packet[2];
        if control & 0x01 == 0 {
            // Information frame, two-octet control field
            if packet.len() < 4 {
                return Err(IsdnError::BadFrame("I frame without N(R)".to_string()));
            }
            return Ok(Self::I {
                sapi,
                tei,
                command,
                ns: control >> 1,
                nr: packet[3] >> 1,
                poll: packet[3] & 0x01 != 0,
                payload: Bytes::copy_from_slice(&packet[4..]),
            });
        }
        if control & 0x03 == 0x01 {
            if packet.len() < 4 {
                return Err(IsdnError::BadFrame("S frame without N(R)".to_string()));
            }
            let stype = match control {
                0x01 => SType::Rr,
                0x05 => SType::Rnr,
                0x09 => SType::Rej,
                other => {
                    return Err(IsdnError::BadFrame(format!("S control {other:#04x}")))
                }
            };
            return Ok(Self::S {
                sapi,
                tei,
                command,
                stype,
                nr: packet[3] >> 1,
                pf: packet[3] & 0x01 != 0,
            });
        }
        let pf = control & 0x10 != 0;
        let utype = match control & !0x10 {
            0x6F => UType::Sabme,
            0x43 => UType::Disc,
            0x63 => UType::Ua,
            0x0F => UType::Dm,
            0x87 => UType::Frmr,
            0x03 => UType::Ui,
            0xAF => UType::Xid,
            other => return Err(IsdnError::BadFrame(format!("U control {other:#04x}"))),
        };
        Ok(Self::U {
            sapi,
            tei,
            command,
            utype,
            pf,
            payload: Bytes::copy_from_slice(&packet[3..]),
        })
    }
}

/// Data link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Released,
    WaitEstablish,
    Established,
    WaitRelease,
}

/// Upward user of a Q.921 data link
pub trait Q921User: Send + Sync {
    /// Acknowledged multi-frame data
    fn receive_data(&self, payload: Bytes);

    /// Unacknowledged UI data
    fn receive_ui(&self, payload: Bytes) {
        let _ = payload;
    }

    /// Multi-frame operation established or released
    fn data_link_status(&self, established: bool);
}

struct Q921State {
    state: LinkState,
    vs: u8,
    va: u8,
    vr: u8,
    peer_busy: bool,
    /// Unacknowledged I frames
    queue: VecDeque<(u8, Bytes)>,
    /// Awaiting transmission while not established
    backlog: VecDeque<Bytes>,
    t200: SigTimer,
    t203: SigTimer,
    retries: SigCounter,
}

#[derive(Default)]
struct Q921Actions {
    send: Vec<Q921Frame>,
    deliver: Vec<Bytes>,
    deliver_ui: Vec<Bytes>,
    status: Option<bool>,
}

/// Active LAPD endpoint for one SAPI/TEI pair
pub struct Q921Link {
    name: String,
    cfg: RwLock<Q921Config>,
    sapi: u8,
    tei: RwLock<u8>,
    iface: RwLock<Option<Arc<dyn SigInterface>>>,
    user: RwLock<Weak<dyn Q921User>>,
    state: Mutex<Q921State>,
}

impl Q921Link {
    pub fn new(name: &str, cfg: Q921Config) -> Arc<Self> {
        let state = Q921State {
            state: LinkState::Released,
            vs: 0,
            va: 0,
            vr: 0,
            peer_busy: false,
            queue: VecDeque::new(),
            backlog: VecDeque::new(),
            t200: SigTimer::new(cfg.t200_ms),
            t203: SigTimer::new(cfg.t203_ms),
            retries: SigCounter::new(cfg.n200),
        };
        Arc::new(Self {
            name: name.to_string(),
            sapi: cfg.sapi,
            tei: RwLock::new(cfg.tei),
            iface: RwLock::new(None),
            user: RwLock::new(Weak::<NullUser>::new() as Weak<dyn Q921User>),
            state: Mutex::new(state),
            cfg: RwLock::new(cfg),
        })
    }

    pub fn attach_interface(self: &Arc<Self>, iface: Arc<dyn SigInterface>) {
        iface.set_receiver(Arc::downgrade(self) as Weak<dyn PacketReceiver>);
        *self.iface.write().unwrap() = Some(iface);
    }

    pub fn set_user(&self, user: Weak<dyn Q921User>) {
        *self.user.write().unwrap() = user;
    }

    pub fn sapi(&self) -> u8 {
        self.sapi
    }

    pub fn tei(&self) -> u8 {
        *self.tei.read().unwrap()
    }

    /// TEI management assigns or removes the endpoint identifier
    pub fn set_tei(&self, tei: u8) {
        *self.tei.write().unwrap() = tei;
    }

    pub fn state(&self) -> LinkState {
        self.state.lock().unwrap().state
    }

    pub fn established(&self) -> bool {
        self.state() == LinkState::Established
    }

    fn network_side(&self) -> bool {
        self.cfg.read().unwrap().network
    }

    fn frame_u(&self, utype: UType, pf: bool) -> Q921Frame {
        Q921Frame::U {
            sapi: self.sapi,
            tei: self.tei(),
            command: matches!(utype, UType::Sabme | UType::Disc | UType::Ui),
            utype,
            pf,
            payload: Bytes::new(),
        }
    }

    /// Start multi-frame establishment (SABME)
    pub fn establish(&self) {
        let mut actions = Q921Actions::default();
        {
            let mut state = self.state.lock().unwrap();
            if state.state == LinkState::Established {
                return;
            }
            state.state = LinkState::WaitEstablish;
            state.retries.reset();
            state.t200.start(Instant::now());
            actions.send.push(self.frame_u(UType::Sabme, true));
        }
        self.run_actions(actions);
    }

    /// Release the data link (DISC)
    pub fn release(&self) {
        let mut actions = Q921Actions::default();
        {
            let mut state = self.state.lock().unwrap();
            if matches!(state.state, LinkState::Released | LinkState::WaitRelease) {
                return;
            }
            state.state = LinkState::WaitRelease;
            state.retries.reset();
            state.t200.start(Instant::now());
            actions.send.push(self.frame_u(UType::Disc, true));
        }
        self.run_actions(actions);
    }

    /// Send acknowledged user data; queues while establishment completes
    pub fn send_data(&self, payload: Bytes) -> Result<(), IsdnError> {
        let max = self.cfg.read().unwrap().max_user_data;
        if payload.len() > max {
            return Err(IsdnError::BadFrame(format!("payload over N201 ({max})")));
        }
        let mut actions = Q921Actions::default();
        {
            let mut state = self.state.lock().unwrap();
            match state.state {
                LinkState::Established => {
                    if state.peer_busy {
                        state.backlog.push_back(payload);
                    } else {
                        let frame = self.build_i(&mut state, payload);
                        actions.send.push(frame);
                    }
                }
                LinkState::WaitEstablish => state.backlog.push_back(payload),
                _ => return Err(IsdnError::NotEstablished),
            }
        }
        self.run_actions(actions);
        Ok(())
    }

    /// Send unacknowledged UI data
    pub fn send_ui(&self, payload: Bytes) -> Result<(), IsdnError> {
        let frame = Q921Frame::U {
            sapi: self.sapi,
            tei: self.tei(),
            command: true,
            utype: UType::Ui,
            pf: false,
            payload,
        };
        self.transmit(&frame)
    }

    fn build_i(&self, state: &mut Q921State, payload: Bytes) -> Q921Frame {
        let ns = state.vs;
        state.vs = (state.vs + 1) & 0x7F;
        state.queue.push_back((ns, payload.clone()));
        if !state.t200.running() {
            state.t200.start(Instant::now());
        }
        Q921Frame::I {
            sapi: self.sapi,
            tei: self.tei(),
            command: true,
            ns,
            nr: state.vr,
            poll: false,
            payload,
        }
    }

    fn rr(&self, state: &Q921State, pf: bool, command: bool) -> Q921Frame {
        Q921Frame::S {
            sapi: self.sapi,
            tei: self.tei(),
            command,
            stype: SType::Rr,
            nr: state.vr,
            pf,
        }
    }

    fn enter_established(&self, state: &mut Q921State, actions: &mut Q921Actions) {
        state.state = LinkState::Established;
        state.vs = 0;
        state.va = 0;
        state.vr = 0;
        state.peer_busy = false;
        state.queue.clear();
        state.retries.reset();
        state.t200.stop();
        state.t203.start(Instant::now());
        actions.status = Some(true);
        info!(link = %self.name, tei = self.tei(), "multi-frame established");
        // Flush traffic queued during establishment
        while let Some(payload) = state.backlog.pop_front() {
            let frame = self.build_i(state, payload);
            actions.send.push(frame);
        }
    }

    fn enter_released(&self, state: &mut Q921State, actions: &mut Q921Actions) {
        let was = state.state;
        state.state = LinkState::Released;
        state.queue.clear();
        state.t200.stop();
        state.t203.stop();
        if was == LinkState::Established || was == LinkState::WaitRelease {
            actions.status = Some(false);
        }
    }

    /// Acknowledge queued frames up to N(R)
    fn ack_to(state: &mut Q921State, nr: u8) {
        while let Some((ns, _)) = state.queue.front() {
            let acked = (nr.wrapping_sub(*ns).wrapping_sub(1)) & 0x7F;
            if acked < 64 {
                state.queue.pop_front();
            } else {
                break;
            }
        }
        state.va = nr;
        if state.queue.is_empty() {
            state.t200.stop();
        } else {
            state.t200.start(Instant::now());
        }
    }

    fn handle_frame(&self, frame: Q921Frame) {
        let mut actions = Q921Actions::default();
        {
            let mut state = self.state.lock().unwrap();
            match frame {
                Q921Frame::U { utype: UType::Sabme, .. } => {
                    // Peer initiates multi-frame operation
                    actions.send.push(self.frame_u(UType::Ua, true));
                    self.enter_established(&mut state, &mut actions);
                }
                Q921Frame::U { utype: UType::Disc, .. } => {
                    actions.send.push(self.frame_u(UType::Ua, true));
                    self.enter_released(&mut state, &mut actions);
                }
                Q921Frame::U { utype: UType::Ua, .. } => match state.state {
                    LinkState::WaitEstablish => self.enter_established(&mut state, &mut actions),
                    LinkState::WaitRelease => self.enter_released(&mut state, &mut actions),
                    _ => debug!(link = %self.name, "unsolicited UA"),
                },
                Q921Frame::U { utype: UType::Dm, .. } => match state.state {
                    LinkState::WaitEstablish | LinkState::WaitRelease => {
                        self.enter_released(&mut state, &mut actions);
                    }
                    _ => {}
                },
                Q921Frame::U { utype: UType::Frmr, .. } => {
                    warn!(link = %self.name, "frame reject, re-establishing");
                    state.state = LinkState::WaitEstablish;
                    state.retries.reset();
                    state.t200.start(Instant::now());
                    actions.send.push(self.frame_u(UType::Sabme, true));
                }
                Q921Frame::U { utype: UType::Ui, payload, .. } => {
                    actions.deliver_ui.push(payload);
                }
                Q921Frame::U { utype: UType::Xid, .. } => {
                    debug!(link = %self.name, "XID ignored");
                }
                Q921Frame::I { ns, nr, poll, payload, .. } => {
                    if state.state != LinkState::Established {
                        actions.send.push(self.frame_u(UType::Dm, poll));
                    } else {
                        Self::ack_to(&mut state, nr);
                        if ns == state.vr {
                            state.vr = (state.vr + 1) & 0x7F;
                            actions.deliver.push(payload);
                            actions.send.push(self.rr(&state, poll, false));
                        } else {
                            // Out of sequence: reject and keep V(R)
                            actions.send.push(Q921Frame::S {
                                sapi: self.sapi,
                                tei: self.tei(),
                                command: false,
                                stype: SType::Rej,
                                nr: state.vr,
                                pf: poll,
                            });
                        }
                        state.t203.start(Instant::now());
                    }
                }
                Q921Frame::S { stype, nr, pf, command, .. } => {
                    if state.state != LinkState::Established {
                        actions.send.push(self.frame_u(UType::Dm, pf));
                    } else {
                        Self::ack_to(&mut state, nr);
                        match stype {
                            SType::Rr => {
                                state.peer_busy = false;
                                if command && pf {
                                    actions.send.push(self.rr(&state, true, false));
                                }
                                while let Some(payload) = state.backlog.pop_front() {
                                    let frame = self.build_i(&mut state, payload);
                                    actions.send.push(frame);
                                }
                            }
                            SType::Rnr => {
                                state.peer_busy = true;
                            }
                            SType::Rej => {
                                // Retransmit everything from N(R)
                                let queued: Vec<(u8, Bytes)> =
                                    state.queue.iter().cloned().collect();
                                for (ns, payload) in queued {
                                    actions.send.push(Q921Frame::I {
                                        sapi: self.sapi,
                                        tei: self.tei(),
                                        command: true,
                                        ns,
                                        nr: state.vr,
                                        poll: false,
                                        payload,
                                    });
                                }
                            }
                        }
                        state.t203.start(Instant::now());
                    }
                }
            }
        }
        self.run_actions(actions);
    }

    fn transmit(&self, frame: &Q921Frame) -> Result<(), IsdnError> {
        let iface = self.iface.read().unwrap().clone();
        let Some(iface) = iface else {
            return Err(IsdnError::NotEstablished);
        };
        iface
            .transmit_packet(&frame.encode(), false)
            .map_err(|e| IsdnError::BadFrame(e.to_string()))
    }

    fn run_actions(&self, actions: Q921Actions) {
        for frame in &actions.send {
            if let Err(err) = self.transmit(frame) {
                debug!(link = %self.name, %err, "transmit failed");
                break;
            }
        }
        if actions.deliver.is_empty()
            && actions.deliver_ui.is_empty()
            && actions.status.is_none()
        {
            return;
        }
        let user = self.user.read().unwrap().upgrade();
        if let Some(user) = user {
            for payload in actions.deliver {
                user.receive_data(payload);
            }
            for payload in actions.deliver_ui {
                user.receive_ui(payload);
            }
            if let Some(established) = actions.status {
                user.data_link_status(established);
            }
        }
    }
}

struct NullUser;

impl Q921User for NullUser {
    fn receive_data(&self, _payload: Bytes) {}

    fn data_link_status(&self, _established: bool) {}
}

impl PacketReceiver for Q921Link {
    fn receive_packet(&self, packet: Bytes) {
        match Q921Frame::decode(&packet) {
            Ok(frame) => {
                // Only our SAPI/TEI pairing; broadcast TEI 127 passes too
                if frame.sapi() == self.sapi && (frame.tei() == self.tei() || frame.tei() == 127)
                {
                    self.handle_frame(frame);
                }
            }
            Err(err) => debug!(link = %self.name, %err, "dropping malformed frame"),
        }
    }

    fn link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::LinkUp => {
                let auto = {
                    let cfg = self.cfg.read().unwrap();
                    cfg.auto_restart && !cfg.network
                };
                if auto {
                    self.establish();
                }
            }
            LinkEvent::LinkDown => {
                let mut actions = Q921Actions::default();
                {
                    let mut state = self.state.lock().unwrap();
                    self.enter_released(&mut state, &mut actions);
                }
                self.run_actions(actions);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl SigComponent for Q921Link {
    fn name(&self) -> &str {
        &self.name
    }

    fn component_type(&self) -> &'static str {
        "q921"
    }

    async fn initialize(&self, config: &serde_json::Value) -> bool {
        match serde_json::from_value::<Q921Config>(config.clone()) {
            Ok(cfg) => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.t200.set_interval(cfg.t200_ms);
                    state.t203.set_interval(cfg.t203_ms);
                    state.retries.set_max(cfg.n200);
                }
                *self.tei.write().unwrap() = cfg.tei;
                *self.cfg.write().unwrap() = cfg;
                true
            }
            Err(err) => {
                warn!(link = %self.name, %err, "bad Q.921 configuration");
                false
            }
        }
    }

    async fn tick(&self, now: Instant) -> Duration {
        let mut actions = Q921Actions::default();
        {
            let mut state = self.state.lock().unwrap();
            if state.t200.fired(now) {
                state.t200.stop();
                match state.state {
                    LinkState::WaitEstablish => {
                        if state.retries.inc() {
                            state.t200.start(now);
                            actions.send.push(self.frame_u(UType::Sabme, true));
                        } else {
                            warn!(link = %self.name, "establishment failed after N200 tries");
                            self.enter_released(&mut state, &mut actions);
                        }
                    }
                    LinkState::WaitRelease => {
                        if state.retries.inc() {
                            state.t200.start(now);
                            actions.send.push(self.frame_u(UType::Disc, true));
                        } else {
                            self.enter_released(&mut state, &mut actions);
                        }
                    }
                    LinkState::Established => {
                        if state.retries.inc() {
                            state.t200.start(now);
                            // Retransmit the oldest unacknowledged frame
                            if let Some((ns, payload)) = state.queue.front().cloned() {
                                actions.send.push(Q921Frame::I {
                                    sapi: self.sapi,
                                    tei: self.tei(),
                                    command: true,
                                    ns,
                                    nr: state.vr,
                                    poll: true,
                                    payload,
                                });
                            }
                        } else {
                            // N200 exceeded: re-establish the link
                            warn!(link = %self.name, "T200 recovery failed, re-establishing");
                            state.state = LinkState::WaitEstablish;
                            state.retries.reset();
                            state.t200.start(now);
                            actions.status = Some(false);
                            actions.send.push(self.frame_u(UType::Sabme, true));
                        }
                    }
                    LinkState::Released => {}
                }
            }
            if state.t203.fired(now) {
                state.t203.start(now);
                if state.state == LinkState::Established {
                    // Idle supervision: poll the peer
                    actions.send.push(self.rr(&state, true, true));
                }
            }
        }
        self.run_actions(actions);
        let state = self.state.lock().unwrap();
        [&state.t200, &state.t203]
            .iter()
            .filter_map(|t| t.remaining(now))
            .min()
            .unwrap_or(TICK_IDLE)
            .max(Duration::from_millis(1))
    }

    async fn control(&self, params: &crate::engine::ControlMap) -> bool {
        match params.operation.as_str() {
            "establish" => {
                self.establish();
                true
            }
            "release" => {
                self.release();
                true
            }
            "status" => {
                info!(link = %self.name, state = ?self.state(), tei = self.tei(), "q921 status");
                true
            }
            _ => false,
        }
    }
}

/// Passive monitor: surfaces I/UI payloads and the establishment
/// handshake without running V(S)/V(R)
pub struct Q921Passive {
    name: String,
    sapi: u8,
    user: RwLock<Weak<dyn Q921User>>,
}

impl Q921Passive {
    pub fn new(name: &str, sapi: u8) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            sapi,
            user: RwLock::new(Weak::<NullUser>::new() as Weak<dyn Q921User>),
        })
    }

    pub fn set_user(&self, user: Weak<dyn Q921User>) {
        *self.user.write().unwrap() = user;
    }
}

impl PacketReceiver for Q921Passive {
    fn receive_packet(&self, packet: Bytes) {
        let Ok(frame) = Q921Frame::decode(&packet) else {
            return;
        };
        if frame.sapi() != self.sapi {
            return;
        }
        let user = self.user.read().unwrap().upgrade();
        let Some(user) = user else {
            return;
        };
        match frame {
            Q921Frame::I { payload, .. } => user.receive_data(payload),
            Q921Frame::U { utype: UType::Ui, payload, .. } => user.receive_ui(payload),
            Q921Frame::U { utype: UType::Sabme, .. } => user.data_link_status(true),
            Q921Frame::U { utype: UType::Disc, .. } | Q921Frame::U { utype: UType::Dm, .. } => {
                user.data_link_status(false)
            }
            _ => {}
        }
    }

    fn link_event(&self, _event: LinkEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::LoopInterface;
    use std::sync::Mutex as StdMutex;

    struct Collect {
        data: StdMutex<Vec<Bytes>>,
        status: StdMutex<Vec<bool>>,
    }

    impl Collect {
        fn new() -> Arc<Self> {
            Arc::new(Self { data: StdMutex::new(Vec::new()), status: StdMutex::new(Vec::new()) })
        }
    }

    impl Q921User for Collect {
        fn receive_data(&self, payload: Bytes) {
            self.data.lock().unwrap().push(payload);
        }

        fn data_link_status(&self, established: bool) {
            self.status.lock().unwrap().push(established);
        }
    }

    fn pair() -> (Arc<Q921Link>, Arc<Q921Link>, Arc<LoopInterface>, Arc<LoopInterface>) {
        let (ia, ib) = LoopInterface::pair("dA", "dB");
        let mut cfg = Q921Config::default();
        cfg.tei = 0;
        cfg.auto_restart = false;
        let a = Q921Link::new("q921A", cfg.clone());
        cfg.network = true;
        let b = Q921Link::new("q921B", cfg);
        a.attach_interface(ia.clone() as Arc<dyn SigInterface>);
        b.attach_interface(ib.clone() as Arc<dyn SigInterface>);
        (a, b, ia, ib)
    }

    fn pump(ia: &LoopInterface, ib: &LoopInterface) {
        for _ in 0..16 {
            if ia.pump() + ib.pump() == 0 {
                break;
            }
        }
    }

    #[test]
    fn frame_roundtrip() {
        let frames = [
            Q921Frame::I {
                sapi: 0,
                tei: 64,
                command: true,
                ns: 5,
                nr: 3,
                poll: false,
                payload: Bytes::from_static(b"\x08\x02\x00\x01\x05"),
            },
            Q921Frame::S { sapi: 0, tei: 64, command: false, stype: SType::Rnr, nr: 9, pf: true },
            Q921Frame::U {
                sapi: 63,
                tei: 127,
                command: true,
                utype: UType::Ui,
                pf: false,
                payload: Bytes::from_static(&[0x0F, 0x04, 0xD2, 0x01, 0xFF]),
            },
        ];
        for frame in frames {
            let enc = frame.encode();
            assert_eq!(Q921Frame::decode(&enc).unwrap(), frame);
        }
    }

    #[test]
    fn sabme_ua_establishes_both_sides() {
        let (a, b, ia, ib) = pair();
        let ua = Collect::new();
        let ub = Collect::new();
        a.set_user(Arc::downgrade(&ua) as Weak<dyn Q921User>);
        b.set_user(Arc::downgrade(&ub) as Weak<dyn Q921User>);
        a.establish();
        pump(&ia, &ib);
        assert!(a.established());
        assert!(b.established());
        assert_eq!(ua.status.lock().unwrap().as_slice(), &[true]);
        assert_eq!(ub.status.lock().unwrap().as_slice(), &[true]);
    }

    #[test]
    fn i_frames_flow_and_ack() {
        let (a, b, ia, ib) = pair();
        let ub = Collect::new();
        b.set_user(Arc::downgrade(&ub) as Weak<dyn Q921User>);
        a.establish();
        pump(&ia, &ib);
        a.send_data(Bytes::from_static(b"one")).unwrap();
        a.send_data(Bytes::from_static(b"two")).unwrap();
        pump(&ia, &ib);
        let got = ub.data.lock().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].as_ref(), b"one");
        // RR acknowledgements drained the retransmission queue
        assert!(a.state.lock().unwrap().queue.is_empty());
    }

    #[test]
    fn send_requires_establishment() {
        let (a, _b, _ia, _ib) = pair();
        assert!(matches!(
            a.send_data(Bytes::from_static(b"x")),
            Err(IsdnError::NotEstablished)
        ));
    }

    #[test]
    fn disc_releases_peer() {
        let (a, b, ia, ib) = pair();
        a.establish();
        pump(&ia, &ib);
        a.release();
        pump(&ia, &ib);
        assert_eq!(a.state(), LinkState::Released);
        assert_eq!(b.state(), LinkState::Released);
    }
}
