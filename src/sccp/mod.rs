//! SCCP connectionless routing engine (Q.711-Q.714)
//!
//! Sits on a router as the SI 3 user part. Outgoing user data picks the
//! smallest message form that fits, segmenting into XUDT or LUDT batches
//! when it must. Incoming traffic is translated, relayed or delivered;
//! management keeps subsystem availability current.

mod address;
mod gtt;
mod management;
mod messages;
mod reassembly;

pub use address::{AddressIndicator, GlobalTitle, SccpAddress, SccpDialect};
pub use gtt::{GlobalTitleTranslator, GttRule};
pub use management::{SccpBroadcast, SccpManagement, ScmgMsg, ScmgType, SubsystemState};
pub use messages::{
    max_ludt_data, max_udt_data, max_xudt_data, msg_type, ProtocolClass, ReturnCause,
    SccpMessage, Segmentation,
};
pub use reassembly::{Reassembler, ReassemblyKey, SegmentOutcome};

use crate::config::SccpConfig;
use crate::engine::{ControlMap, Engine, SigComponent};
use crate::errors::SccpError;
use crate::mtp3::{Label, Mtp3User, RouteState, Router};
use crate::types::{PcType, PointCode, Sio};
use crate::{si, ssn};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper layer attached to the SCCP by subsystem number
pub trait SccpUser: Send + Sync {
    fn ssn(&self) -> u8;

    /// Deliver reassembled user data; false when not consumed
    fn receive_data(&self, data: Bytes, called: &SccpAddress, calling: &SccpAddress) -> bool;

    /// A service message returned one of our own messages
    fn receive_notice(
        &self,
        _cause: ReturnCause,
        _data: Bytes,
        _called: &SccpAddress,
        _calling: &SccpAddress,
    ) {
    }

    /// Management broadcast channel
    fn management_status(&self, _status: SccpBroadcast) {}
}

/// Maximum segments one batch may carry (4-bit remaining count)
const MAX_SEGMENTS: usize = 16;

/// Connectionless SCCP engine
pub struct SccpEngine {
    name: String,
    cfg: RwLock<SccpConfig>,
    dialect: SccpDialect,
    pc_type: PcType,
    local_pc: PointCode,
    users: RwLock<Vec<Weak<dyn SccpUser>>>,
    gtt: GlobalTitleTranslator,
    mgmt: SccpManagement,
    reassembler: Reassembler,
    router: RwLock<Weak<Router>>,
    engine: RwLock<Weak<Engine>>,
    seg_reference: AtomicU32,
    sls_counter: AtomicU8,
    /// Payload bound the attached MTP route imposes on one message
    mtp_max: usize,
}

impl SccpEngine {
    pub fn new(name: &str, cfg: SccpConfig, local_pc: PointCode) -> Arc<Self> {
        let dialect = SccpDialect::from_name(&cfg.dialect);
        let pc_type = match dialect {
            SccpDialect::Itu => PcType::Itu,
            SccpDialect::Ansi => PcType::Ansi,
        };
        Arc::new(Self {
            name: name.to_string(),
            dialect,
            pc_type,
            local_pc,
            users: RwLock::new(Vec::new()),
            gtt: GlobalTitleTranslator::new(),
            mgmt: SccpManagement::new(pc_type, 30_000),
            reassembler: Reassembler::new(cfg.segmentation_timeout_ms),
            router: RwLock::new(Weak::new()),
            engine: RwLock::new(Weak::new()),
            seg_reference: AtomicU32::new(1),
            sls_counter: AtomicU8::new(0),
            mtp_max: 272 - 1 - pc_type.label_octets(),
            cfg: RwLock::new(cfg),
        })
    }

    pub fn attach_router(self: &Arc<Self>, router: &Arc<Router>) {
        *self.router.write().unwrap() = Arc::downgrade(router);
        let user: Arc<dyn Mtp3User> = self.clone();
        router.attach_user(si::SCCP, &user);
    }

    pub fn set_engine(&self, engine: &Arc<Engine>) {
        *self.engine.write().unwrap() = Arc::downgrade(engine);
    }

    pub fn translator(&self) -> &GlobalTitleTranslator {
        &self.gtt
    }

    pub fn management(&self) -> &SccpManagement {
        &self.mgmt
    }

    pub fn local_pc(&self) -> PointCode {
        self.local_pc
    }

    pub fn local_address(&self, ssn: u8) -> SccpAddress {
        SccpAddress::from_ssn_pc(ssn, self.local_pc)
    }

    /// Attach an SCCP user and advertise its subsystem in service
    pub fn attach_user(&self, user: &Arc<dyn SccpUser>) {
        let ssn = user.ssn();
        self.users.write().unwrap().push(Arc::downgrade(user));
        if let Some(request) = self.mgmt.set_local(ssn, true) {
            self.broadcast_scmg(request.msg);
        }
    }

    /// Report a user's subsystem leaving or re-entering service
    pub fn set_user_status(&self, ssn: u8, in_service: bool) {
        if let Some(request) = self.mgmt.set_local(ssn, in_service) {
            self.broadcast_scmg(request.msg);
        }
    }

    fn user_for(&self, ssn: u8) -> Option<Arc<dyn SccpUser>> {
        self.users.read().unwrap().iter().filter_map(Weak::upgrade).find(|u| u.ssn() == ssn)
    }

    fn next_sls(&self) -> u8 {
        self.sls_counter.fetch_add(1, Ordering::Relaxed) & self.pc_type.sls_mask()
    }

    fn transmit(&self, msg: &SccpMessage, dest: PointCode, sls: u8) -> Result<(), SccpError> {
        let payload = msg.encode(self.dialect)?;
        let label = Label::new(self.pc_type, dest, self.local_pc, sls);
        let router = self.router.read().unwrap().upgrade();
        let router = router.ok_or(SccpError::MtpFailure)?;
        let network = crate::types::NetworkIndicator::National;
        let sio = Sio::new(si::SCCP, 1, network);
        router.transmit_msu(sio, &label, &payload).map_err(SccpError::from)
    }

    /// Send user data, choosing UDT, XUDT or a segmented batch
    pub fn send_unitdata(
        &self,
        called: &SccpAddress,
        calling: &SccpAddress,
        class: ProtocolClass,
        data: &[u8],
    ) -> Result<(), SccpError> {
        let resolved =
            if called.needs_translation() { self.gtt.translate(called)? } else { called.clone() };
        let dest = resolved.point_code.ok_or(SccpError::NoTranslation)?;
        let hop = self.cfg.read().unwrap().hop_counter;

        let called_len = resolved.encode(self.dialect).len();
        let calling_len = calling.encode(self.dialect).len();
        let udt_max = max_udt_data(called_len, calling_len, self.mtp_max);
        let xudt_max = max_xudt_data(called_len, calling_len, self.mtp_max);

        if data.len() <= udt_max {
            let msg = SccpMessage::udt(
                class,
                resolved,
                calling.clone(),
                Bytes::copy_from_slice(data),
            );
            return self.transmit(&msg, dest, self.next_sls());
        }
        if data.len() <= xudt_max {
            let msg = SccpMessage::xudt(
                class,
                hop,
                resolved,
                calling.clone(),
                Bytes::copy_from_slice(data),
                None,
            );
            return self.transmit(&msg, dest, self.next_sls());
        }

        // Segment into an XUDT batch; class 1 keeps the segments in order
        let chunk = xudt_max.max(1);
        let count = data.len().div_ceil(chunk);
        if count > MAX_SEGMENTS {
            let ludt_max = max_ludt_data(called_len, calling_len, 3952);
            if data.len() <= ludt_max {
                let msg = SccpMessage::ludt(
                    class,
                    hop,
                    resolved,
                    calling.clone(),
                    Bytes::copy_from_slice(data),
                    None,
                );
                return self.transmit(&msg, dest, self.next_sls());
            }
            return Err(SccpError::Oversize(data.len()));
        }
        let reference = self.seg_reference.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;
        let sls = self.next_sls();
        for (index, part) in data.chunks(chunk).enumerate() {
            let segmentation = Segmentation {
                first: index == 0,
                class1: class.class == 1,
                remaining: (count - 1 - index) as u8,
                reference,
            };
            let msg = SccpMessage::xudt(
                class,
                hop,
                resolved.clone(),
                calling.clone(),
                Bytes::copy_from_slice(part),
                Some(segmentation),
            );
            self.transmit(&msg, dest, sls)?;
        }
        Ok(())
    }

    fn return_message(&self, msg: &SccpMessage, label: &Label, cause: ReturnCause) {
        if !msg.class.return_on_error || msg.is_service() {
            return;
        }
        debug!(engine = %self.name, ?cause, "returning message to origin");
        let reply = msg.service_reply(cause);
        let dest = match reply.called.point_code.or(Some(label.opc)) {
            Some(pc) => pc,
            None => return,
        };
        let _ = self.transmit(&reply, dest, label.sls);
    }

    fn deliver_local(&self, msg: SccpMessage, label: &Label) {
        // Reassemble segmented batches before delivery
        let data = match &msg.segmentation {
            Some(segmentation) => {
                let key =
                    ReassemblyKey::new(self.dialect, &msg.calling, segmentation, label);
                match self.reassembler.add_segment(key, segmentation, &msg.data, Instant::now()) {
                    SegmentOutcome::Complete(data) => data,
                    SegmentOutcome::Pending => return,
                    SegmentOutcome::Rejected => {
                        self.return_message(&msg, label, ReturnCause::SegmentationFailure);
                        return;
                    }
                }
            }
            None => msg.data.clone(),
        };
        let target_ssn = msg.called.ssn.unwrap_or(0);
        if target_ssn == ssn::MANAGEMENT {
            self.handle_scmg(&data, label);
            return;
        }
        if msg.is_service() {
            if let Some(user) = self.user_for(target_ssn) {
                user.receive_notice(
                    msg.return_cause.unwrap_or(ReturnCause::Unqualified),
                    data,
                    &msg.called,
                    &msg.calling,
                );
            }
            return;
        }
        match self.user_for(target_ssn) {
            Some(user) => {
                if !user.receive_data(data, &msg.called, &msg.calling) {
                    self.return_message(&msg, label, ReturnCause::ErrorInLocalProcessing);
                }
            }
            None => {
                warn!(engine = %self.name, ssn = target_ssn, "no user for subsystem");
                self.return_message(&msg, label, ReturnCause::UnequippedUser);
            }
        }
    }

    fn relay(&self, mut msg: SccpMessage, label: &Label) {
        if self.cfg.read().unwrap().endpoint {
            self.return_message(&msg, label, ReturnCause::NoTranslationForThisAddress);
            return;
        }
        // Hop counting guards relay loops
        if let Some(hop) = msg.hop_counter {
            if hop <= 1 {
                warn!(engine = %self.name, "hop counter exhausted");
                self.return_message(&msg, label, ReturnCause::HopCounterViolation);
                return;
            }
            msg.hop_counter = Some(hop - 1);
        }
        match self.gtt.translate(&msg.called) {
            Ok(translated) => {
                let dest = match translated.point_code {
                    Some(pc) => pc,
                    None => {
                        self.return_message(&msg, label, ReturnCause::NoTranslationForThisAddress);
                        return;
                    }
                };
                msg.called = translated;
                if dest == self.local_pc {
                    self.deliver_local(msg, label);
                    return;
                }
                if let Err(err) = self.transmit(&msg, dest, label.sls) {
                    debug!(engine = %self.name, %err, "relay transmit failed");
                    self.return_message(&msg, label, ReturnCause::MtpFailure);
                }
            }
            Err(_) => {
                self.return_message(&msg, label, ReturnCause::NoTranslationForThisAddress);
            }
        }
    }

    fn handle_scmg(&self, data: &Bytes, label: &Label) {
        let Some(msg) = ScmgMsg::decode(self.pc_type, data.clone()) else {
            warn!(engine = %self.name, "undecodable SCMG message");
            return;
        };
        let output = self.mgmt.handle(msg);
        for reply in output.replies {
            self.send_scmg(reply, label.opc);
        }
        self.fan_out(output.broadcasts);
    }

    fn fan_out(&self, broadcasts: Vec<SccpBroadcast>) {
        if broadcasts.is_empty() {
            return;
        }
        let users: Vec<Arc<dyn SccpUser>> =
            self.users.read().unwrap().iter().filter_map(Weak::upgrade).collect();
        for broadcast in broadcasts {
            for user in &users {
                user.management_status(broadcast);
            }
        }
    }

    fn send_scmg(&self, msg: ScmgMsg, dest: PointCode) {
        let called = SccpAddress::from_ssn_pc(ssn::MANAGEMENT, dest);
        let calling = SccpAddress::from_ssn_pc(ssn::MANAGEMENT, self.local_pc);
        let udt = SccpMessage::udt(
            ProtocolClass::CLASS_0,
            called,
            calling,
            msg.encode(self.pc_type),
        );
        if let Err(err) = self.transmit(&udt, dest, 0) {
            debug!(engine = %self.name, %err, "failed to send SCMG message");
        }
    }

    /// Advertise a local subsystem state change to every watched remote
    fn broadcast_scmg(&self, template: ScmgMsg) {
        let mut msg = template;
        msg.pc = self.local_pc;
        let remotes = self.known_remote_pcs();
        for pc in remotes {
            self.send_scmg(msg, pc);
        }
    }

    fn known_remote_pcs(&self) -> Vec<PointCode> {
        // The concerned-point list is whatever management is watching
        self.mgmt.watched_pcs()
    }
}

impl Mtp3User for SccpEngine {
    fn receive_msu(&self, sio: Sio, label: &Label, payload: Bytes) -> bool {
        if sio.service() != si::SCCP {
            return false;
        }
        let msg = match SccpMessage::decode(self.dialect, &payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(engine = %self.name, %err, "undecodable SCCP message");
                return true;
            }
        };
        if msg.called.needs_translation() {
            self.relay(msg, label);
        } else if msg.called.point_code.map(|pc| pc == self.local_pc).unwrap_or(true) {
            self.deliver_local(msg, label);
        } else {
            // Addressed elsewhere on SSN routing: forward as-is
            let Some(dest) = msg.called.point_code else {
                return true;
            };
            if self.cfg.read().unwrap().endpoint {
                self.return_message(&msg, label, ReturnCause::NoTranslationForThisAddress);
            } else if let Err(err) = self.transmit(&msg, dest, label.sls) {
                debug!(engine = %self.name, %err, "forward failed");
                self.return_message(&msg, label, ReturnCause::MtpFailure);
            }
        }
        true
    }

    fn route_status(&self, pc_type: PcType, destination: PointCode, state: RouteState) {
        if pc_type != self.pc_type {
            return;
        }
        let accessible = state.usable();
        let output = self.mgmt.point_code_status(destination, accessible);
        self.fan_out(output.broadcasts);
    }
}

#[async_trait]
impl SigComponent for SccpEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn component_type(&self) -> &'static str {
        "sccp"
    }

    async fn initialize(&self, config: &serde_json::Value) -> bool {
        match serde_json::from_value::<SccpConfig>(config.clone()) {
            Ok(cfg) => {
                *self.cfg.write().unwrap() = cfg;
                true
            }
            Err(err) => {
                warn!(engine = %self.name, %err, "bad SCCP configuration");
                false
            }
        }
    }

    async fn tick(&self, now: Instant) -> Duration {
        for test in self.mgmt.tick(now) {
            let dest = test.pc;
            self.send_scmg(test, dest);
        }
        let purged = self.reassembler.purge(now);
        if purged > 0 {
            debug!(engine = %self.name, purged, "abandoned stale reassemblies");
        }
        Duration::from_millis(100)
    }

    async fn control(&self, params: &ControlMap) -> bool {
        match params.operation.as_str() {
            "status" => {
                debug!(
                    engine = %self.name,
                    pending = self.reassembler.pending_count(),
                    "sccp status"
                );
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SccpConfig;

    #[test]
    fn local_address_routes_on_ssn() {
        let engine = SccpEngine::new("sccp1", SccpConfig::default(), PointCode::new(1, 1, 1));
        let addr = engine.local_address(8);
        assert!(addr.indicator.route_on_ssn);
        assert_eq!(addr.ssn, Some(8));
        assert!(!addr.needs_translation());
    }

    #[test]
    fn send_without_router_reports_mtp_failure() {
        let engine = SccpEngine::new("sccp1", SccpConfig::default(), PointCode::new(1, 1, 1));
        let called = engine.local_address(8);
        let calling = engine.local_address(6);
        let result =
            engine.send_unitdata(&called, &calling, ProtocolClass::CLASS_0, b"data");
        assert!(matches!(result, Err(SccpError::MtpFailure)));
    }

    #[test]
    fn unresolvable_gt_is_a_translation_error() {
        let engine = SccpEngine::new("sccp1", SccpConfig::default(), PointCode::new(1, 1, 1));
        let called = SccpAddress::from_gt(GlobalTitle::e164("49123456"), Some(8));
        let calling = engine.local_address(6);
        let result =
            engine.send_unitdata(&called, &calling, ProtocolClass::CLASS_0, b"data");
        assert!(matches!(result, Err(SccpError::NoTranslation)));
    }
}
