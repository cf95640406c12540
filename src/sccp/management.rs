//! SCCP management (Q.714)
//!
//! Tracks per-remote subsystem availability, answers subsystem tests and
//! broadcasts status changes to attached SCCP users. SCMG messages travel
//! as user data between SSN 1 endpoints.

use crate::engine::SigTimer;
use crate::types::{PcType, PointCode};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use std::time::Instant;
use tracing::{debug, warn};

/// SCMG message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScmgType {
    /// Subsystem allowed
    Ssa = 0x01,
    /// Subsystem prohibited
    Ssp = 0x02,
    /// Subsystem status test
    Sst = 0x03,
    /// Subsystem out-of-service request
    Sor = 0x04,
    /// Subsystem out-of-service grant
    Sog = 0x05,
    /// Subsystem congested (ANSI adds the congestion level octet)
    Ssc = 0x06,
}

impl ScmgType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => Self::Ssa,
            0x02 => Self::Ssp,
            0x03 => Self::Sst,
            0x04 => Self::Sor,
            0x05 => Self::Sog,
            0x06 => Self::Ssc,
            _ => return None,
        })
    }
}

/// One SCMG message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScmgMsg {
    pub mtype: ScmgType,
    pub ssn: u8,
    pub pc: PointCode,
    pub smi: u8,
    /// Congestion level on SSC
    pub level: u8,
}

impl ScmgMsg {
    pub fn new(mtype: ScmgType, ssn: u8, pc: PointCode) -> Self {
        Self { mtype, ssn, pc, smi: 0, level: 0 }
    }

    pub fn encode(&self, pc_type: PcType) -> Bytes {
        let mut buf = BytesMut::with_capacity(6);
        buf.put_u8(self.mtype as u8);
        buf.put_u8(self.ssn);
        let packed = self.pc.pack(pc_type);
        for i in 0..pc_type.octets() {
            buf.put_u8(((packed >> (8 * i)) & 0xFF) as u8);
        }
        buf.put_u8(self.smi & 0x03);
        if self.mtype == ScmgType::Ssc {
            buf.put_u8(self.level & 0x0F);
        }
        buf.freeze()
    }

    pub fn decode(pc_type: PcType, mut data: Bytes) -> Option<Self> {
        if data.remaining() < 3 + pc_type.octets() {
            return None;
        }
        let mtype = ScmgType::from_u8(data.get_u8())?;
        let ssn = data.get_u8();
        let mut packed = 0u32;
        for i in 0..pc_type.octets() {
            packed |= (data.get_u8() as u32) << (8 * i);
        }
        let smi = data.get_u8() & 0x03;
        let level = if mtype == ScmgType::Ssc && data.has_remaining() {
            data.get_u8() & 0x0F
        } else {
            0
        };
        Some(Self { mtype, ssn, pc: PointCode::unpack(pc_type, packed), smi, level })
    }
}

/// Per-subsystem availability as seen from here
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsystemState {
    Allowed,
    Prohibited,
    Unknown,
    /// SOR sent, awaiting SOG
    WaitForGrant,
    /// Locally forced: answer no tests for it
    IgnoreTests,
}

/// Broadcast to attached SCCP users when availability changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SccpBroadcast {
    UserOutOfService { pc: PointCode, ssn: u8 },
    UserInService { pc: PointCode, ssn: u8 },
    PcInaccessible { pc: PointCode },
    PcAccessible { pc: PointCode },
    SccpRemoteInaccessible { pc: PointCode },
    SccpRemoteAccessible { pc: PointCode },
    PcCongested { pc: PointCode, level: u8 },
    SubsystemStatus { pc: PointCode, ssn: u8, allowed: bool },
}

struct RemoteSubsystem {
    state: SubsystemState,
    congestion: u8,
    sst: SigTimer,
}

/// Management state machine; the engine wires its inputs and outputs
pub struct SccpManagement {
    pc_type: PcType,
    remotes: DashMap<(u32, u8), RemoteSubsystem>,
    /// Local subsystems currently in service
    local: DashMap<u8, bool>,
    sst_interval_ms: u64,
}

/// Messages and broadcasts produced by one management step
#[derive(Default)]
pub struct ScmgOutput {
    /// Replies toward the message origin
    pub replies: Vec<ScmgMsg>,
    pub broadcasts: Vec<SccpBroadcast>,
}

impl SccpManagement {
    pub fn new(pc_type: PcType, sst_interval_ms: u64) -> Self {
        Self { pc_type, remotes: DashMap::new(), local: DashMap::new(), sst_interval_ms }
    }

    pub fn pc_type(&self) -> PcType {
        self.pc_type
    }

    /// Register a local subsystem's availability
    pub fn set_local(&self, ssn: u8, in_service: bool) -> Option<ScmgBroadcastRequest> {
        let before = self.local.insert(ssn, in_service);
        if before == Some(in_service) {
            return None;
        }
        Some(ScmgBroadcastRequest {
            msg: ScmgMsg::new(
                if in_service { ScmgType::Ssa } else { ScmgType::Ssp },
                ssn,
                PointCode::new(0, 0, 0),
            ),
        })
    }

    pub fn local_in_service(&self, ssn: u8) -> bool {
        self.local.get(&ssn).map(|e| *e.value()).unwrap_or(false)
    }

    pub fn subsystem_state(&self, pc: PointCode, ssn: u8) -> SubsystemState {
        self.remotes
            .get(&(pc.pack(self.pc_type), ssn))
            .map(|e| e.state)
            .unwrap_or(SubsystemState::Unknown)
    }

    /// Distinct point codes management currently tracks; doubles as the
    /// concerned-point list for local broadcasts
    pub fn watched_pcs(&self) -> Vec<PointCode> {
        let mut packed: Vec<u32> = self.remotes.iter().map(|e| e.key().0).collect();
        packed.sort_unstable();
        packed.dedup();
        packed.into_iter().map(|p| PointCode::unpack(self.pc_type, p)).collect()
    }

    /// A remote subsystem we depend on; prohibited until tested
    pub fn watch_remote(&self, pc: PointCode, ssn: u8) {
        let mut sst = SigTimer::new(self.sst_interval_ms);
        sst.start(Instant::now());
        self.remotes.insert(
            (pc.pack(self.pc_type), ssn),
            RemoteSubsystem { state: SubsystemState::Unknown, congestion: 0, sst },
        );
    }

    fn set_state(
        &self,
        pc: PointCode,
        ssn: u8,
        state: SubsystemState,
        out: &mut ScmgOutput,
    ) {
        let key = (pc.pack(self.pc_type), ssn);
        let mut entry = self.remotes.entry(key).or_insert_with(|| RemoteSubsystem {
            state: SubsystemState::Unknown,
            congestion: 0,
            sst: SigTimer::new(self.sst_interval_ms),
        });
        if entry.state == state {
            return;
        }
        debug!(pc = %pc, ssn, ?state, "subsystem state changed");
        entry.state = state;
        match state {
            SubsystemState::Allowed => {
                entry.sst.stop();
                out.broadcasts.push(SccpBroadcast::UserInService { pc, ssn });
                out.broadcasts.push(SccpBroadcast::SubsystemStatus { pc, ssn, allowed: true });
            }
            SubsystemState::Prohibited | SubsystemState::WaitForGrant => {
                entry.sst.start(Instant::now());
                out.broadcasts.push(SccpBroadcast::UserOutOfService { pc, ssn });
                out.broadcasts.push(SccpBroadcast::SubsystemStatus { pc, ssn, allowed: false });
            }
            _ => {}
        }
    }

    /// Process one received SCMG message
    pub fn handle(&self, msg: ScmgMsg) -> ScmgOutput {
        let mut out = ScmgOutput::default();
        match msg.mtype {
            ScmgType::Ssa => self.set_state(msg.pc, msg.ssn, SubsystemState::Allowed, &mut out),
            ScmgType::Ssp => {
                self.set_state(msg.pc, msg.ssn, SubsystemState::Prohibited, &mut out)
            }
            ScmgType::Sst => {
                // Answer for local subsystems that are in service
                if self.local_in_service(msg.ssn) {
                    out.replies.push(ScmgMsg::new(ScmgType::Ssa, msg.ssn, msg.pc));
                } else {
                    debug!(ssn = msg.ssn, "subsystem test for out-of-service subsystem");
                }
            }
            ScmgType::Sor => {
                // Orderly shutdown handshake: grant when we can take over
                out.replies.push(ScmgMsg::new(ScmgType::Sog, msg.ssn, msg.pc));
                self.set_state(msg.pc, msg.ssn, SubsystemState::Prohibited, &mut out);
            }
            ScmgType::Sog => {
                let key = (msg.pc.pack(self.pc_type), msg.ssn);
                if let Some(mut entry) = self.remotes.get_mut(&key) {
                    if entry.state == SubsystemState::WaitForGrant {
                        entry.state = SubsystemState::Prohibited;
                        out.broadcasts
                            .push(SccpBroadcast::UserOutOfService { pc: msg.pc, ssn: msg.ssn });
                    }
                } else {
                    warn!(pc = %msg.pc, ssn = msg.ssn, "unsolicited SOG");
                }
            }
            ScmgType::Ssc => {
                let key = (msg.pc.pack(self.pc_type), msg.ssn);
                if let Some(mut entry) = self.remotes.get_mut(&key) {
                    entry.congestion = msg.level;
                }
                out.broadcasts.push(SccpBroadcast::PcCongested { pc: msg.pc, level: msg.level });
            }
        }
        out
    }

    /// Point code reachability learned from MTP route state
    pub fn point_code_status(&self, pc: PointCode, accessible: bool) -> ScmgOutput {
        let mut out = ScmgOutput::default();
        if accessible {
            out.broadcasts.push(SccpBroadcast::PcAccessible { pc });
            out.broadcasts.push(SccpBroadcast::SccpRemoteAccessible { pc });
            // Every known subsystem there must be retested
            let packed = pc.pack(self.pc_type);
            for mut entry in self.remotes.iter_mut() {
                if entry.key().0 == packed && entry.state == SubsystemState::Allowed {
                    entry.state = SubsystemState::Unknown;
                    entry.sst.start(Instant::now());
                }
            }
        } else {
            out.broadcasts.push(SccpBroadcast::PcInaccessible { pc });
            out.broadcasts.push(SccpBroadcast::SccpRemoteInaccessible { pc });
            let packed = pc.pack(self.pc_type);
            for mut entry in self.remotes.iter_mut() {
                if entry.key().0 == packed {
                    let ssn = entry.key().1;
                    if entry.state != SubsystemState::Prohibited {
                        entry.state = SubsystemState::Prohibited;
                        entry.sst.start(Instant::now());
                        out.broadcasts.push(SccpBroadcast::UserOutOfService { pc, ssn });
                    }
                }
            }
        }
        out
    }

    /// Fire due subsystem tests; returns SSTs to send per destination
    pub fn tick(&self, now: Instant) -> Vec<ScmgMsg> {
        let mut tests = Vec::new();
        for mut entry in self.remotes.iter_mut() {
            let due = entry.sst.fired(now);
            if due
                && matches!(
                    entry.state,
                    SubsystemState::Prohibited
                        | SubsystemState::Unknown
                        | SubsystemState::WaitForGrant
                )
            {
                entry.sst.start(now);
                let (packed, ssn) = *entry.key();
                tests.push(ScmgMsg::new(
                    ScmgType::Sst,
                    ssn,
                    PointCode::unpack(self.pc_type, packed),
                ));
            }
        }
        tests
    }
}

/// A local status change that must be advertised to known concerned points
pub struct ScmgBroadcastRequest {
    pub msg: ScmgMsg,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mgmt() -> SccpManagement {
        SccpManagement::new(PcType::Itu, 30_000)
    }

    #[test]
    fn scmg_roundtrip() {
        let msg = ScmgMsg::new(ScmgType::Ssp, 8, PointCode::new(2, 140, 1));
        let enc = msg.encode(PcType::Itu);
        assert_eq!(enc.len(), 5);
        assert_eq!(ScmgMsg::decode(PcType::Itu, enc).unwrap(), msg);
    }

    #[test]
    fn ssc_carries_congestion_level() {
        let mut msg = ScmgMsg::new(ScmgType::Ssc, 8, PointCode::new(1, 1, 1));
        msg.level = 3;
        let enc = msg.encode(PcType::Itu);
        assert_eq!(enc.len(), 6);
        assert_eq!(ScmgMsg::decode(PcType::Itu, enc).unwrap().level, 3);
    }

    #[test]
    fn ssp_then_ssa_broadcasts_status() {
        let m = mgmt();
        let pc = PointCode::new(2, 2, 2);
        let out = m.handle(ScmgMsg::new(ScmgType::Ssp, 8, pc));
        assert!(out
            .broadcasts
            .contains(&SccpBroadcast::UserOutOfService { pc, ssn: 8 }));
        assert_eq!(m.subsystem_state(pc, 8), SubsystemState::Prohibited);

        let out = m.handle(ScmgMsg::new(ScmgType::Ssa, 8, pc));
        assert!(out.broadcasts.contains(&SccpBroadcast::UserInService { pc, ssn: 8 }));
        assert_eq!(m.subsystem_state(pc, 8), SubsystemState::Allowed);
    }

    #[test]
    fn sst_answered_only_in_service() {
        let m = mgmt();
        let pc = PointCode::new(2, 2, 2);
        let out = m.handle(ScmgMsg::new(ScmgType::Sst, 8, pc));
        assert!(out.replies.is_empty());
        m.set_local(8, true);
        let out = m.handle(ScmgMsg::new(ScmgType::Sst, 8, pc));
        assert_eq!(out.replies.len(), 1);
        assert_eq!(out.replies[0].mtype, ScmgType::Ssa);
    }

    #[test]
    fn prohibited_subsystems_get_tested() {
        let m = mgmt();
        let pc = PointCode::new(2, 2, 2);
        m.handle(ScmgMsg::new(ScmgType::Ssp, 8, pc));
        let tests = m.tick(Instant::now() + std::time::Duration::from_secs(60));
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].mtype, ScmgType::Sst);
        assert_eq!(tests[0].pc, pc);
    }

    #[test]
    fn inaccessible_pc_prohibits_all_subsystems() {
        let m = mgmt();
        let pc = PointCode::new(2, 2, 2);
        m.handle(ScmgMsg::new(ScmgType::Ssa, 8, pc));
        m.watch_remote(pc, 6);
        let out = m.point_code_status(pc, false);
        assert!(out.broadcasts.contains(&SccpBroadcast::PcInaccessible { pc }));
        assert_eq!(m.subsystem_state(pc, 8), SubsystemState::Prohibited);
        assert_eq!(m.subsystem_state(pc, 6), SubsystemState::Prohibited);
    }

    #[test]
    fn sor_grants_and_prohibits() {
        let m = mgmt();
        let pc = PointCode::new(4, 4, 4);
        let out = m.handle(ScmgMsg::new(ScmgType::Sor, 8, pc));
        assert_eq!(out.replies[0].mtype, ScmgType::Sog);
        assert_eq!(m.subsystem_state(pc, 8), SubsystemState::Prohibited);
    }
}
