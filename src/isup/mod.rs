//! ISUP call control (Q.761-Q.764)
//!
//! The controller owns a circuit group, creates calls for outgoing requests
//! and inbound IAMs, runs circuit group supervision and resolves glare.
//! BICC rides the same controller with the wide-CIC codec dialect.

mod call;
mod messages;

pub use call::{CallState, IsupCall};
pub use messages::{event, nai, IsupDialect, IsupMessage, MsgType, Param};

use crate::circuit::{CircuitGroup, CircuitStatus, LockFlags};
use crate::config::IsupConfig;
use crate::engine::{CallEvent, ControlMap, Engine, Notification, SigComponent};
use crate::errors::{IsupError, Mtp3Error};
use crate::mtp3::{Label, Mtp3User, RouteState, Router};
use crate::types::{cause, CallDirection, NetworkIndicator, PcType, PointCode, Sio};
use crate::si;
use async_trait::async_trait;
use bytes::Bytes;
use call::CallAction;
use dashmap::DashMap;
use metrics::counter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// ISUP call controller bound to one circuit group and one adjacent
/// exchange
pub struct IsupController {
    name: String,
    this: Weak<IsupController>,
    cfg: RwLock<IsupConfig>,
    dialect: IsupDialect,
    pc_type: PcType,
    local: PointCode,
    remote: PointCode,
    ni: NetworkIndicator,
    group: Arc<CircuitGroup>,
    calls: DashMap<u32, Arc<IsupCall>>,
    router: RwLock<Weak<Router>>,
    engine: RwLock<Weak<Engine>>,
    sls_counter: AtomicU8,
}

impl IsupController {
    pub fn new(
        name: &str,
        cfg: IsupConfig,
        pc_type: PcType,
        group: Arc<CircuitGroup>,
    ) -> Result<Arc<Self>, IsupError> {
        Self::with_dialect(name, cfg, pc_type, group, IsupDialect::Itu)
    }

    /// BICC controller: identical behaviour over the wide-CIC codec
    pub fn bicc(
        name: &str,
        cfg: IsupConfig,
        pc_type: PcType,
        group: Arc<CircuitGroup>,
    ) -> Result<Arc<Self>, IsupError> {
        Self::with_dialect(name, cfg, pc_type, group, IsupDialect::Bicc)
    }

    fn with_dialect(
        name: &str,
        cfg: IsupConfig,
        pc_type: PcType,
        group: Arc<CircuitGroup>,
        dialect: IsupDialect,
    ) -> Result<Arc<Self>, IsupError> {
        let local = PointCode::from_name(&cfg.pointcode)
            .ok_or_else(|| IsupError::Config(format!("bad pointcode {}", cfg.pointcode)))?;
        let remote = PointCode::from_name(&cfg.remote_pointcode).ok_or_else(|| {
            IsupError::Config(format!("bad remote_pointcode {}", cfg.remote_pointcode))
        })?;
        Ok(Arc::new_cyclic(|this| Self {
            name: name.to_string(),
            this: this.clone(),
            dialect,
            pc_type,
            local,
            remote,
            ni: NetworkIndicator::National,
            group,
            calls: DashMap::new(),
            router: RwLock::new(Weak::new()),
            engine: RwLock::new(Weak::new()),
            sls_counter: AtomicU8::new(0),
            cfg: RwLock::new(cfg),
        }))
    }

    /// Attach below a router as the ISUP (or BICC) user part
    pub fn attach_router(self: &Arc<Self>, router: &Arc<Router>) {
        *self.router.write().unwrap() = Arc::downgrade(router);
        let service = if self.dialect == IsupDialect::Bicc { si::BICC } else { si::ISUP };
        let user: Arc<dyn Mtp3User> = self.clone();
        router.attach_user(service, &user);
    }

    pub fn set_engine(&self, engine: &Arc<Engine>) {
        *self.engine.write().unwrap() = Arc::downgrade(engine);
    }

    pub fn local_pc(&self) -> PointCode {
        self.local
    }

    pub fn group(&self) -> &Arc<CircuitGroup> {
        &self.group
    }

    pub fn find_call(&self, cic: u32) -> Option<Arc<IsupCall>> {
        self.calls.get(&cic).map(|e| e.value().clone())
    }

    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    fn next_sls(&self, cic: u32) -> u8 {
        let cfg = self.cfg.read().unwrap();
        match cfg.default_sls.as_str() {
            "auto" => (cic & self.pc_type.sls_mask() as u32) as u8,
            "last" => self.sls_counter.fetch_add(1, Ordering::Relaxed) & self.pc_type.sls_mask(),
            fixed => fixed.parse::<u8>().unwrap_or(0) & self.pc_type.sls_mask(),
        }
    }

    fn transmit(&self, msg: &IsupMessage, sls: u8) -> Result<(), IsupError> {
        let payload = msg.encode(self.dialect)?;
        let label = Label::new(self.pc_type, self.remote, self.local, sls);
        let service = if self.dialect == IsupDialect::Bicc { si::BICC } else { si::ISUP };
        let sio = Sio::new(service, 0, self.ni);
        let router = self.router.read().unwrap().upgrade();
        match router {
            Some(router) => {
                debug!(ctrl = %self.name, msg = msg.mtype.name(), cic = msg.cic, "tx");
                counter!("telsig_isup_tx", "controller" => self.name.clone()).increment(1);
                router.transmit_msu(sio, &label, &payload).map_err(IsupError::from)
            }
            None => Err(IsupError::Mtp3(Mtp3Error::NoLink)),
        }
    }

    fn notify_event(&self, event: CallEvent, params: HashMap<String, String>) {
        if let Some(engine) = self.engine.read().unwrap().upgrade() {
            engine.notify(&self.name, Notification::Call { event, params });
        }
    }

    fn build_iam(&self, call: &IsupCall, called: &str, calling: &str) -> IsupMessage {
        let cfg = self.cfg.read().unwrap();
        let mut iam = IsupMessage::new(MsgType::Iam, call.cic());
        let nature = if cfg.continuity { 0x01 } else { 0x00 };
        iam.set_param(Param::NATURE_OF_CONNECTION_INDICATORS, vec![nature])
            .set_param(Param::FORWARD_CALL_INDICATORS, vec![0x60, 0x01])
            .set_param(Param::CALLING_PARTY_CATEGORY, vec![0x0A])
            .set_param(Param::TRANSMISSION_MEDIUM_REQUIREMENT, vec![0x00])
            .set_called_number(called, cfg.number_type, cfg.number_plan, cfg.inn)
            .set_calling_number(
                calling,
                cfg.number_type,
                cfg.number_plan,
                cfg.presentation,
                cfg.screening,
            );
        iam
    }

    /// Place an outgoing call: reserve a circuit, send the IAM
    pub fn call(self: &Arc<Self>, called: &str, calling: &str) -> Result<Arc<IsupCall>, IsupError> {
        let circuit = self.group.reserve(None, LockFlags::LOCKED).ok_or(IsupError::NoCircuit)?;
        let cic = circuit.code();
        let sls = self.next_sls(cic);
        let label = Label::new(self.pc_type, self.remote, self.local, sls);
        let cfg = self.cfg.read().unwrap().clone();
        let call = IsupCall::new(CallDirection::Outgoing, circuit, label, called, calling, &cfg);
        let iam = self.build_iam(&call, called, calling);
        if let Err(err) = self.transmit(&iam, sls) {
            call.circuit().release();
            return Err(err);
        }
        call.setup_sent(Instant::now());
        self.calls.insert(cic, call.clone());
        info!(ctrl = %self.name, cic, called, "outgoing call started");
        Ok(call)
    }

    /// Execute the actions a call produced once its lock is released
    fn run_actions(&self, call: &Arc<IsupCall>, actions: Vec<CallAction>) {
        for action in actions {
            match action {
                CallAction::Send(msg) => {
                    let sls = call.label().sls;
                    if let Err(err) = self.transmit(&msg, sls) {
                        warn!(ctrl = %self.name, %err, "failed to send call message");
                    }
                }
                CallAction::Event(event, params) => self.notify_event(event, params),
                CallAction::ConnectCircuit => {
                    let format = self.cfg.read().unwrap().format.clone();
                    call.circuit().connect(Some(&format));
                }
                CallAction::DisconnectCircuit => {
                    call.circuit().disconnect();
                }
                CallAction::ReleaseCircuit => {
                    call.circuit().release();
                }
                CallAction::Finished => {
                    self.calls.remove(&call.cic());
                }
            }
        }
    }

    /// Release a call on behalf of the user
    pub fn hangup_call(&self, call: &Arc<IsupCall>, reason: u8) {
        let actions = call.hangup(reason);
        self.run_actions(call, actions);
    }

    /// Originate circuit group blocking toward the peer. The circuits
    /// carry the local lock and the locking-in-progress mark until the
    /// CGBA arrives.
    pub fn block_circuits(&self, first: u32, count: u32, hardware: bool) -> Result<(), IsupError> {
        let flags = if hardware {
            LockFlags::LOCAL_HW_FAIL.with(LockFlags::LOCKING_HW)
        } else {
            LockFlags::LOCAL_MAINTENANCE.with(LockFlags::LOCKING_MAINTENANCE)
        };
        self.group.lock_range(first, count, flags);
        let mut cgb = IsupMessage::new(MsgType::Cgb, first);
        cgb.set_param(
            Param::GROUP_SUPERVISION_TYPE_INDICATOR,
            vec![if hardware { 0x01 } else { 0x00 }],
        );
        cgb.set_range_and_status((count.saturating_sub(1)) as u8, &range_status(count));
        self.transmit(&cgb, self.next_sls(first))
    }

    /// Originate circuit group unblocking. The local lock stays in place
    /// until the peer acknowledges with a CGUA; only the in-progress mark
    /// is added here.
    pub fn unblock_circuits(
        &self,
        first: u32,
        count: u32,
        hardware: bool,
    ) -> Result<(), IsupError> {
        let locking =
            if hardware { LockFlags::LOCKING_HW } else { LockFlags::LOCKING_MAINTENANCE };
        self.group.lock_range(first, count, locking);
        let mut cgu = IsupMessage::new(MsgType::Cgu, first);
        cgu.set_param(
            Param::GROUP_SUPERVISION_TYPE_INDICATOR,
            vec![if hardware { 0x01 } else { 0x00 }],
        );
        cgu.set_range_and_status((count.saturating_sub(1)) as u8, &range_status(count));
        self.transmit(&cgu, self.next_sls(first))
    }

    /// Send messages produced by the user-facing call API
    pub fn send_for(&self, call: &Arc<IsupCall>, msgs: Vec<IsupMessage>) {
        let sls = call.label().sls;
        for msg in msgs {
            if let Err(err) = self.transmit(&msg, sls) {
                warn!(ctrl = %self.name, %err, "failed to send call message");
            }
        }
    }

    /// Glare: an IAM arrived for a CIC we already sent an IAM on.
    fn resolve_glare(self: &Arc<Self>, existing: Arc<IsupCall>, iam: IsupMessage) {
        let we_win = self.local.pack(self.pc_type) < self.remote.pack(self.pc_type);
        let old_cic = existing.cic();
        info!(ctrl = %self.name, cic = old_cic, we_win, "glare detected");
        if we_win {
            // Clear the peer's reservation of the contested circuit
            let mut rel = IsupMessage::new(MsgType::Rel, old_cic);
            rel.set_cause(cause::REQUESTED_CIRCUIT_UNAVAILABLE);
            let _ = self.transmit(&rel, existing.label().sls);
        }
        // Both sides move their outgoing call to a fresh circuit. The
        // replacement is reserved before the contested code is released
        // so the allocator cannot hand the same circuit back.
        self.calls.remove(&old_cic);
        let replacement = if existing.can_replace() {
            self.group.reserve(None, LockFlags::LOCKED)
        } else {
            None
        };
        existing.circuit().release();
        match replacement {
            Some(circuit) => {
                let new_cic = circuit.code();
                existing.swap_circuit(circuit);
                let called = existing.called();
                let calling = existing.calling();
                let iam_out = self.build_iam(&existing, &called, &calling);
                let sls = self.next_sls(new_cic);
                if self.transmit(&iam_out, sls).is_ok() {
                    existing.setup_sent(Instant::now());
                    self.calls.insert(new_cic, existing);
                } else {
                    existing.circuit().release();
                }
            }
            None => {
                self.notify_event(CallEvent::Release, {
                    let mut p = HashMap::new();
                    p.insert("cause".to_string(), cause::NO_CIRCUIT_AVAILABLE.to_string());
                    p
                });
            }
        }
        // The loser yields the contested circuit to the peer's IAM;
        // the winner's REL will clear the peer side instead.
        if !we_win {
            self.incoming_call(iam);
        }
    }

    fn incoming_call(self: &Arc<Self>, iam: IsupMessage) {
        let cic = iam.cic;
        let Some(circuit) = self.group.find(cic) else {
            self.unknown_circuit(cic);
            return;
        };
        if !circuit.reserve(LockFlags::LOCKED) {
            // Circuit unusable: reject the setup outright
            let mut rel = IsupMessage::new(MsgType::Rel, cic);
            rel.set_cause(cause::REQUESTED_CIRCUIT_UNAVAILABLE);
            let _ = self.transmit(&rel, self.next_sls(cic));
            return;
        }
        let sls = self.next_sls(cic);
        let label = Label::new(self.pc_type, self.remote, self.local, sls);
        let cfg = self.cfg.read().unwrap().clone();
        let call = IsupCall::new(CallDirection::Incoming, circuit, label, "", "", &cfg);
        let actions = call.setup_received(&iam);
        self.calls.insert(cic, call.clone());
        counter!("telsig_isup_incoming_calls", "controller" => self.name.clone()).increment(1);
        self.run_actions(&call, actions);
        let cfg = self.cfg.read().unwrap();
        if cfg.early_acm {
            drop(cfg);
            let msgs = call.accept();
            self.send_for(&call, msgs);
            self.notify_event(CallEvent::Accept, iam.to_params());
        }
    }

    fn unknown_circuit(&self, cic: u32) {
        let drop_unknown = self.cfg.read().unwrap().drop_on_unknown;
        warn!(ctrl = %self.name, cic, "message for unknown circuit");
        if !drop_unknown {
            let ucic = IsupMessage::new(MsgType::Ucic, cic);
            let _ = self.transmit(&ucic, self.next_sls(cic));
        }
    }

    /// Circuit group supervision: BLK/UBL, group variants, resets
    fn handle_supervision(self: &Arc<Self>, msg: IsupMessage) {
        let cic = msg.cic;
        match msg.mtype {
            MsgType::Blk => {
                if let Some(circuit) = self.group.find(cic) {
                    circuit.set_lock(LockFlags::REMOTE_MAINTENANCE);
                    let _ = self.transmit(&IsupMessage::new(MsgType::Bla, cic), self.next_sls(cic));
                    self.notify_event(CallEvent::Disable, msg.to_params());
                } else {
                    self.unknown_circuit(cic);
                }
            }
            MsgType::Ubl => {
                if let Some(circuit) = self.group.find(cic) {
                    circuit.clear_lock(LockFlags::REMOTE_MAINTENANCE);
                    let _ = self.transmit(&IsupMessage::new(MsgType::Uba, cic), self.next_sls(cic));
                    self.notify_event(CallEvent::Enable, msg.to_params());
                } else {
                    self.unknown_circuit(cic);
                }
            }
            MsgType::Rsc => {
                if let Some((_, call)) = self.calls.remove(&cic) {
                    call.circuit().release();
                }
                if let Some(circuit) = self.group.find(cic) {
                    circuit.release();
                    let _ = self.transmit(&IsupMessage::new(MsgType::Rlc, cic), self.next_sls(cic));
                    self.notify_event(CallEvent::Reset, msg.to_params());
                } else {
                    self.unknown_circuit(cic);
                }
            }
            MsgType::Grs => {
                let range = msg.range().unwrap_or(0) as u32;
                for code in cic..=cic + range {
                    if let Some((_, call)) = self.calls.remove(&code) {
                        call.circuit().release();
                    }
                    if let Some(circuit) = self.group.find(code) {
                        circuit.release();
                    }
                }
                let mut gra = IsupMessage::new(MsgType::Gra, cic);
                let status_len = (range as usize + 8) / 8;
                gra.set_range_and_status(range as u8, &vec![0u8; status_len]);
                let _ = self.transmit(&gra, self.next_sls(cic));
                self.notify_event(CallEvent::Reset, msg.to_params());
            }
            MsgType::Cgb | MsgType::Cgu => {
                let range = msg.range().unwrap_or(0) as u32;
                let hardware = msg
                    .param(Param::GROUP_SUPERVISION_TYPE_INDICATOR)
                    .and_then(|v| v.first())
                    .map(|b| b & 0x01 != 0)
                    .unwrap_or(false);
                let flags = if hardware {
                    LockFlags::REMOTE_HW_FAIL
                } else {
                    LockFlags::REMOTE_MAINTENANCE
                };
                if msg.mtype == MsgType::Cgb {
                    self.group.lock_range(cic, range + 1, flags);
                } else {
                    self.group.unlock_range(cic, range + 1, flags);
                }
                let ack_type =
                    if msg.mtype == MsgType::Cgb { MsgType::Cgba } else { MsgType::Cgua };
                let mut ack = IsupMessage::new(ack_type, cic);
                if let Some(sup) = msg.param(Param::GROUP_SUPERVISION_TYPE_INDICATOR) {
                    ack.set_param(Param::GROUP_SUPERVISION_TYPE_INDICATOR, sup.clone());
                }
                if let Some(rs) = msg.param(Param::RANGE_AND_STATUS) {
                    ack.set_param(Param::RANGE_AND_STATUS, rs.clone());
                }
                let _ = self.transmit(&ack, self.next_sls(cic));
                let event =
                    if msg.mtype == MsgType::Cgb { CallEvent::Disable } else { CallEvent::Enable };
                self.notify_event(event, msg.to_params());
            }
            MsgType::Bla | MsgType::Uba | MsgType::Cgba | MsgType::Cgua | MsgType::Gra => {
                // Acknowledgement of our own supervision request: the
                // locking-in-progress exchange is over; a confirmed
                // unblocking also drops the local lock itself
                let count = msg.range().unwrap_or(0) as u32 + 1;
                let locking = LockFlags::LOCKING_HW.with(LockFlags::LOCKING_MAINTENANCE);
                match msg.mtype {
                    MsgType::Cgua | MsgType::Uba => {
                        self.group.unlock_range(cic, count, LockFlags::LOCAL.with(locking));
                    }
                    _ => self.group.unlock_range(cic, count, locking),
                }
                self.group.ack_lock_changes(cic, msg.range().unwrap_or(0) as u32);
            }
            MsgType::Ccr => {
                // Continuity check request: hold the circuit in the
                // special state until the loop test concludes
                if let Some(circuit) = self.group.find(cic) {
                    if circuit.reserve(LockFlags::LOCKED) {
                        circuit.set_special();
                    }
                    self.notify_event(CallEvent::Verify, msg.to_params());
                } else {
                    self.unknown_circuit(cic);
                }
            }
            other => {
                debug!(ctrl = %self.name, msg = other.name(), cic, "unhandled supervision message");
            }
        }
    }
}

impl Mtp3User for IsupController {
    fn receive_msu(&self, sio: Sio, label: &Label, payload: Bytes) -> bool {
        let service = if self.dialect == IsupDialect::Bicc { si::BICC } else { si::ISUP };
        if sio.service() != service {
            return false;
        }
        let msg = match IsupMessage::decode(self.dialect, &payload) {
            Ok(msg) => msg,
            Err(IsupError::MissingMandatory(_)) => {
                // Reject the faulty setup with the protocol cause
                if let Some(cic) = decode_cic(self.dialect, &payload) {
                    let mut rel = IsupMessage::new(MsgType::Rel, cic);
                    rel.set_cause(cause::MANDATORY_IE_MISSING);
                    let _ = self.transmit(&rel, label.sls);
                    if let Some((_, call)) = self.calls.remove(&cic) {
                        call.circuit().release();
                    }
                }
                return true;
            }
            Err(err) => {
                warn!(ctrl = %self.name, %err, "undecodable ISUP message");
                return true;
            }
        };
        counter!("telsig_isup_rx", "controller" => self.name.clone()).increment(1);
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        match self.find_call(msg.cic) {
            Some(call) => {
                if msg.mtype == MsgType::Iam {
                    if call.direction() == CallDirection::Outgoing
                        && call.state() == CallState::Setup
                    {
                        this.resolve_glare(call, msg);
                    } else {
                        // Duplicate IAM on a busy circuit
                        let mut cnf = IsupMessage::new(MsgType::Cnf, msg.cic);
                        cnf.set_cause(cause::WRONG_MESSAGE);
                        let _ = self.transmit(&cnf, label.sls);
                    }
                } else {
                    let actions = call.handle_message(msg);
                    self.run_actions(&call, actions);
                }
            }
            None => match msg.mtype {
                MsgType::Iam => this.incoming_call(msg),
                MsgType::Blk | MsgType::Ubl | MsgType::Rsc | MsgType::Grs | MsgType::Cgb
                | MsgType::Cgu | MsgType::Bla | MsgType::Uba | MsgType::Cgba | MsgType::Cgua
                | MsgType::Gra | MsgType::Ccr => this.handle_supervision(msg),
                MsgType::Rlc | MsgType::Ucic => {
                    // Stray acknowledgement, nothing to do
                }
                MsgType::Rel => {
                    // Peer clears a circuit we have no call on
                    let _ = self.transmit(&IsupMessage::new(MsgType::Rlc, msg.cic), label.sls);
                    if let Some(circuit) = self.group.find(msg.cic) {
                        circuit.release();
                    }
                }
                _ => {
                    if self.group.find(msg.cic).is_none() {
                        self.unknown_circuit(msg.cic);
                    } else {
                        let mut cnf = IsupMessage::new(MsgType::Cnf, msg.cic);
                        cnf.set_cause(cause::WRONG_MESSAGE);
                        let _ = self.transmit(&cnf, label.sls);
                    }
                }
            },
        }
        true
    }

    fn route_status(&self, pc_type: PcType, destination: PointCode, state: RouteState) {
        if pc_type != self.pc_type || destination != self.remote {
            return;
        }
        if state == RouteState::Prohibited {
            warn!(ctrl = %self.name, "route to remote exchange lost, releasing calls");
            let cics: Vec<u32> = self.calls.iter().map(|e| *e.key()).collect();
            for cic in cics {
                if let Some(call) = self.find_call(cic) {
                    let actions = call.hangup(cause::DESTINATION_OUT_OF_ORDER);
                    self.run_actions(&call, actions);
                }
            }
        }
    }
}

fn decode_cic(dialect: IsupDialect, payload: &Bytes) -> Option<u32> {
    let octets = dialect.cic_octets();
    if payload.len() < octets {
        return None;
    }
    let mut cic = 0u32;
    for i in 0..octets {
        cic |= (payload[i] as u32) << (8 * i);
    }
    Some(cic & dialect.cic_mask())
}

/// Range-and-status bitmap marking every circuit in the range affected
fn range_status(count: u32) -> Vec<u8> {
    let mut status = vec![0u8; (count as usize + 7) / 8];
    for i in 0..count as usize {
        status[i / 8] |= 1 << (i % 8);
    }
    status
}

#[async_trait]
impl SigComponent for IsupController {
    fn name(&self) -> &str {
        &self.name
    }

    fn component_type(&self) -> &'static str {
        if self.dialect == IsupDialect::Bicc {
            "bicc"
        } else {
            "isup"
        }
    }

    async fn initialize(&self, config: &serde_json::Value) -> bool {
        match serde_json::from_value::<IsupConfig>(config.clone()) {
            Ok(cfg) => {
                *self.cfg.write().unwrap() = cfg;
                true
            }
            Err(err) => {
                warn!(ctrl = %self.name, %err, "bad ISUP configuration");
                false
            }
        }
    }

    async fn tick(&self, now: Instant) -> Duration {
        let mut nearest: Option<Duration> = None;
        let calls: Vec<Arc<IsupCall>> = self.calls.iter().map(|e| e.value().clone()).collect();
        for call in calls {
            let (actions, deadline) = call.tick(now);
            if !actions.is_empty() {
                self.run_actions(&call, actions);
            }
            nearest = match (nearest, deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        // Surface queued circuit events to the host
        for (code, status, _) in self.group.statuses() {
            if status == CircuitStatus::Missing {
                continue;
            }
            if let Some(circuit) = self.group.find(code) {
                for event in circuit.take_events() {
                    let mut params = HashMap::new();
                    params.insert("circuit".to_string(), code.to_string());
                    params.insert("event".to_string(), format!("{event:?}"));
                    self.notify_event(CallEvent::Circuit, params);
                }
            }
        }
        nearest.unwrap_or(Duration::from_millis(50)).max(Duration::from_millis(1))
    }

    async fn control(&self, params: &ControlMap) -> bool {
        match params.operation.as_str() {
            "save" => {
                // CtrlSave: hand the circuit states to the host. The probe
                // respects the engine's lock-wait budget rather than block.
                let max_wait = self
                    .engine
                    .read()
                    .unwrap()
                    .upgrade()
                    .map(|e| Duration::from_micros(e.settings().max_lock_wait))
                    .unwrap_or(Duration::ZERO);
                let Some(statuses) = self.group.try_statuses(max_wait) else {
                    return false;
                };
                let mut out = HashMap::new();
                for (code, status, locks) in statuses {
                    out.insert(code.to_string(), format!("{},{}", status.name(), locks.0));
                }
                self.notify_event(CallEvent::Circuit, out);
                true
            }
            "cicevent" => {
                // CtrlCicEvent: inject a circuit event, used by tests
                let Some(code) = params.get("circuit").and_then(|c| c.parse::<u32>().ok()) else {
                    return false;
                };
                let Some(circuit) = self.group.find(code) else {
                    return false;
                };
                if let Some(digits) = params.get("dtmf") {
                    circuit.add_event(crate::circuit::CircuitEvent::Dtmf(digits.to_string()));
                }
                true
            }
            _ => false,
        }
    }

    async fn destroyed(&self) {
        let cics: Vec<u32> = self.calls.iter().map(|e| *e.key()).collect();
        for cic in cics {
            if let Some((_, call)) = self.calls.remove(&cic) {
                call.circuit().release();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitRange, CircuitType, Strategy};

    fn controller() -> Arc<IsupController> {
        let group = CircuitGroup::new("grp", 1);
        group.create_span("span1", CircuitType::Tdm, 1, 8);
        group.add_range(CircuitRange::new("all", 1, 8, Strategy::Lowest));
        let mut cfg = IsupConfig::default();
        cfg.pointcode = "1-1-1".to_string();
        cfg.remote_pointcode = "2-2-2".to_string();
        IsupController::new("isup1", cfg, PcType::Itu, group).unwrap()
    }

    #[test]
    fn outgoing_call_without_router_fails() {
        let ctrl = controller();
        // The circuit must not leak when the IAM cannot be sent
        assert!(ctrl.call("15551234", "15550000").is_err());
        assert_eq!(ctrl.call_count(), 0);
    }

    #[test]
    fn incoming_iam_creates_call() {
        let ctrl = controller();
        let mut iam = IsupMessage::new(MsgType::Iam, 3);
        iam.set_param(Param::NATURE_OF_CONNECTION_INDICATORS, vec![0])
            .set_param(Param::FORWARD_CALL_INDICATORS, vec![0x60, 0x01])
            .set_param(Param::CALLING_PARTY_CATEGORY, vec![0x0A])
            .set_param(Param::TRANSMISSION_MEDIUM_REQUIREMENT, vec![0])
            .set_called_number("15551234", nai::NATIONAL, 1, false);
        let payload = iam.encode(IsupDialect::Itu).unwrap();
        let label = Label::new(
            PcType::Itu,
            PointCode::new(1, 1, 1),
            PointCode::new(2, 2, 2),
            3,
        );
        let sio = Sio::new(si::ISUP, 0, NetworkIndicator::National);
        assert!(Mtp3User::receive_msu(&*ctrl, sio, &label, payload));
        assert_eq!(ctrl.call_count(), 1);
        let call = ctrl.find_call(3).unwrap();
        assert_eq!(call.direction(), CallDirection::Incoming);
        assert_eq!(call.circuit().status(), CircuitStatus::Reserved);
    }

    #[test]
    fn group_blocking_tracks_locking_in_progress() {
        let ctrl = controller();
        let sio = Sio::new(si::ISUP, 0, NetworkIndicator::National);
        let label = Label::new(
            PcType::Itu,
            PointCode::new(1, 1, 1),
            PointCode::new(2, 2, 2),
            0,
        );

        // No router: the CGB cannot be sent but the exchange is marked
        assert!(ctrl.block_circuits(1, 4, false).is_err());
        let locks = ctrl.group().find(2).unwrap().locks();
        assert!(locks.intersects(LockFlags::LOCAL_MAINTENANCE));
        assert!(locks.intersects(LockFlags::LOCKING_MAINTENANCE));
        // Blocked circuits are skipped by reservation
        assert!(!ctrl.group().find(2).unwrap().reserve(LockFlags::LOCKED));

        // CGBA ends the in-progress exchange but keeps the block itself
        let mut cgba = IsupMessage::new(MsgType::Cgba, 1);
        cgba.set_param(Param::GROUP_SUPERVISION_TYPE_INDICATOR, vec![0]);
        cgba.set_range_and_status(3, &[0x0F]);
        let wire = cgba.encode(IsupDialect::Itu).unwrap();
        Mtp3User::receive_msu(&*ctrl, sio, &label, wire);
        let locks = ctrl.group().find(2).unwrap().locks();
        assert!(locks.intersects(LockFlags::LOCAL_MAINTENANCE));
        assert!(!locks.intersects(LockFlags::LOCKING_MAINTENANCE));
        assert!(!locks.intersects(LockFlags::CHANGED));

        // Unblocking stays in progress until the CGUA clears everything
        assert!(ctrl.unblock_circuits(1, 4, false).is_err());
        assert!(ctrl
            .group()
            .find(2)
            .unwrap()
            .locks()
            .intersects(LockFlags::LOCKING_MAINTENANCE));
        let mut cgua = IsupMessage::new(MsgType::Cgua, 1);
        cgua.set_param(Param::GROUP_SUPERVISION_TYPE_INDICATOR, vec![0]);
        cgua.set_range_and_status(3, &[0x0F]);
        let wire = cgua.encode(IsupDialect::Itu).unwrap();
        Mtp3User::receive_msu(&*ctrl, sio, &label, wire);
        let circuit = ctrl.group().find(2).unwrap();
        assert_eq!(circuit.locks(), LockFlags::none());
        assert!(circuit.reserve(LockFlags::LOCKED));
    }

    #[test]
    fn supervision_blocks_and_unblocks() {
        let ctrl = controller();
        let sio = Sio::new(si::ISUP, 0, NetworkIndicator::National);
        let label = Label::new(
            PcType::Itu,
            PointCode::new(1, 1, 1),
            PointCode::new(2, 2, 2),
            0,
        );
        let blk = IsupMessage::new(MsgType::Blk, 5).encode(IsupDialect::Itu).unwrap();
        Mtp3User::receive_msu(&*ctrl, sio, &label, blk);
        let circuit = ctrl.group().find(5).unwrap();
        assert!(circuit.locks().intersects(LockFlags::REMOTE_MAINTENANCE));
        let ubl = IsupMessage::new(MsgType::Ubl, 5).encode(IsupDialect::Itu).unwrap();
        Mtp3User::receive_msu(&*ctrl, sio, &label, ubl);
        assert!(!ctrl.group().find(5).unwrap().locks().intersects(LockFlags::REMOTE_MAINTENANCE));
    }
}
