//! M2PA (RFC 4165)
//!
//! MTP2 peer-to-peer adaptation: presents the layer 2 link contract to
//! MTP3 while running over an association. Sequence numbers are 24-bit;
//! alignment mirrors the Q.703 procedure through link status messages.

use super::{class, SigtranReceiver, SigtranTransport, SIGTRAN_VERSION};
use crate::engine::{SigComponent, SigTimer, TICK_IDLE};
use crate::errors::{LinkError, SigtranError};
use crate::mtp2::{L2Link, L2Op, Mtp2User};
use crate::types::Msu;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Message types within the M2PA class
const TYPE_USER_DATA: u8 = 1;
const TYPE_LINK_STATUS: u8 = 2;

/// Link status values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum M2paStatus {
    Alignment = 1,
    ProvingNormal = 2,
    ProvingEmergency = 3,
    Ready = 4,
    ProcessorOutage = 5,
    ProcessorRecovered = 6,
    Busy = 7,
    BusyEnded = 8,
    OutOfService = 9,
}

impl M2paStatus {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::Alignment,
            2 => Self::ProvingNormal,
            3 => Self::ProvingEmergency,
            4 => Self::Ready,
            5 => Self::ProcessorOutage,
            6 => Self::ProcessorRecovered,
            7 => Self::Busy,
            8 => Self::BusyEnded,
            9 => Self::OutOfService,
            _ => return None,
        })
    }
}

const SEQ_MASK: u32 = 0x00FF_FFFF;
const SEQ_INIT: u32 = 0x00FF_FFFF;

fn next_seq(v: u32) -> u32 {
    (v + 1) & SEQ_MASK
}

/// Build one M2PA message: common header, sequence header, payload
fn encode_m2pa(mtype: u8, bsn: u32, fsn: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + payload.len());
    buf.put_u8(SIGTRAN_VERSION);
    buf.put_u8(0);
    buf.put_u8(class::M2PA);
    buf.put_u8(mtype);
    buf.put_u32(16 + payload.len() as u32);
    buf.put_u32(bsn & SEQ_MASK);
    buf.put_u32(fsn & SEQ_MASK);
    buf.put_slice(payload);
    buf.freeze()
}

struct M2paDecoded {
    mtype: u8,
    bsn: u32,
    fsn: u32,
    payload: Bytes,
}

fn decode_m2pa(data: &Bytes) -> Result<M2paDecoded, SigtranError> {
    if data.len() < 16 {
        return Err(SigtranError::InvalidMessage("short M2PA message".to_string()));
    }
    let mut buf = data.clone();
    let version = buf.get_u8();
    if version != SIGTRAN_VERSION {
        return Err(SigtranError::BadVersion(version));
    }
    let _spare = buf.get_u8();
    let mclass = buf.get_u8();
    if mclass != class::M2PA {
        return Err(SigtranError::InvalidMessage(format!("class {mclass}")));
    }
    let mtype = buf.get_u8();
    let length = buf.get_u32() as usize;
    if data.len() < length {
        return Err(SigtranError::InvalidMessage("truncated M2PA message".to_string()));
    }
    let bsn = buf.get_u32() & SEQ_MASK;
    let fsn = buf.get_u32() & SEQ_MASK;
    Ok(M2paDecoded { mtype, bsn, fsn, payload: buf })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    OutOfService,
    Aligning,
    Proving,
    Ready,
    Operational,
}

struct M2paState {
    phase: Phase,
    emergency: bool,
    fsn_out: u32,
    bsn_in: u32,
    queue: VecDeque<(u32, Bytes)>,
    remote_busy: bool,
    t_proving: SigTimer,
    t_ack: SigTimer,
    tx_msus: u64,
    rx_msus: u64,
}

#[derive(Default)]
struct Actions {
    send: Vec<Bytes>,
    deliver: Vec<Msu>,
    status: Option<bool>,
}

/// One M2PA link over an association
pub struct M2paLink {
    name: String,
    transport: RwLock<Option<Arc<dyn SigtranTransport>>>,
    user: RwLock<Weak<dyn Mtp2User>>,
    state: Mutex<M2paState>,
}

impl M2paLink {
    pub fn new(name: &str, proving_ms: u64, ack_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            transport: RwLock::new(None),
            user: RwLock::new(Weak::<NullUser>::new() as Weak<dyn Mtp2User>),
            state: Mutex::new(M2paState {
                phase: Phase::OutOfService,
                emergency: false,
                fsn_out: SEQ_INIT,
                bsn_in: SEQ_INIT,
                queue: VecDeque::new(),
                remote_busy: false,
                t_proving: SigTimer::new(proving_ms),
                t_ack: SigTimer::new(ack_ms),
                tx_msus: 0,
                rx_msus: 0,
            }),
        })
    }

    pub fn attach_transport(self: &Arc<Self>, transport: Arc<dyn SigtranTransport>) {
        transport.set_receiver(Arc::downgrade(self) as Weak<dyn SigtranReceiver>);
        *self.transport.write().unwrap() = Some(transport);
    }

    pub fn stats(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        (state.tx_msus, state.rx_msus)
    }

    fn status_payload(status: M2paStatus) -> [u8; 4] {
        (status as u32).to_be_bytes()
    }

    fn push_status(state: &M2paState, actions: &mut Actions, status: M2paStatus) {
        actions.send.push(encode_m2pa(
            TYPE_LINK_STATUS,
            state.bsn_in,
            state.fsn_out,
            &Self::status_payload(status),
        ));
    }

    fn start_alignment(&self, state: &mut M2paState, actions: &mut Actions, emergency: bool) {
        state.phase = Phase::Aligning;
        state.emergency = emergency;
        state.fsn_out = SEQ_INIT;
        state.bsn_in = SEQ_INIT;
        state.queue.clear();
        state.remote_busy = false;
        debug!(link = %self.name, emergency, "starting alignment");
        Self::push_status(state, actions, M2paStatus::Alignment);
    }

    fn go_operational(&self, state: &mut M2paState, actions: &mut Actions) {
        if state.phase == Phase::Operational {
            return;
        }
        state.phase = Phase::Operational;
        state.t_proving.stop();
        info!(link = %self.name, "link in service");
        actions.status = Some(true);
    }

    fn fail(&self, state: &mut M2paState, actions: &mut Actions) {
        let was = state.phase == Phase::Operational;
        state.phase = Phase::OutOfService;
        state.t_proving.stop();
        state.t_ack.stop();
        Self::push_status(state, actions, M2paStatus::OutOfService);
        if was {
            warn!(link = %self.name, "link out of service");
            actions.status = Some(false);
        }
    }

    fn handle_status(&self, state: &mut M2paState, actions: &mut Actions, status: M2paStatus) {
        match status {
            M2paStatus::Alignment => match state.phase {
                Phase::OutOfService => {
                    self.start_alignment(state, actions, false);
                    let proving = if state.emergency {
                        M2paStatus::ProvingEmergency
                    } else {
                        M2paStatus::ProvingNormal
                    };
                    Self::push_status(state, actions, proving);
                }
                Phase::Aligning => {
                    let proving = if state.emergency {
                        M2paStatus::ProvingEmergency
                    } else {
                        M2paStatus::ProvingNormal
                    };
                    Self::push_status(state, actions, proving);
                }
                Phase::Operational => self.fail(state, actions),
                _ => {}
            },
            M2paStatus::ProvingNormal | M2paStatus::ProvingEmergency => {
                if matches!(state.phase, Phase::Aligning | Phase::OutOfService) {
                    state.phase = Phase::Proving;
                    let emergency =
                        state.emergency || status == M2paStatus::ProvingEmergency;
                    let base = state.t_proving.interval().as_millis() as u64;
                    let proving = if emergency { (base / 8).max(1) } else { base.max(1) };
                    state.t_proving.set_interval(proving);
                    state.t_proving.start(Instant::now());
                }
            }
            M2paStatus::Ready => match state.phase {
                Phase::Proving | Phase::Ready => {
                    Self::push_status(state, actions, M2paStatus::Ready);
                    self.go_operational(state, actions);
                }
                Phase::Operational => {}
                _ => {}
            },
            M2paStatus::ProcessorOutage | M2paStatus::Busy => {
                state.remote_busy = true;
            }
            M2paStatus::ProcessorRecovered | M2paStatus::BusyEnded => {
                state.remote_busy = false;
            }
            M2paStatus::OutOfService => {
                if state.phase == Phase::Operational {
                    self.fail(state, actions);
                }
            }
        }
    }

    fn run_actions(&self, actions: Actions) {
        if !actions.send.is_empty() {
            let transport = self.transport.read().unwrap().clone();
            if let Some(transport) = transport {
                for message in &actions.send {
                    if let Err(err) = transport.send_message(message.clone()) {
                        debug!(link = %self.name, %err, "transport send failed");
                        break;
                    }
                }
            }
        }
        if actions.deliver.is_empty() && actions.status.is_none() {
            return;
        }
        let user = self.user.read().unwrap().upgrade();
        if let Some(user) = user {
            for msu in actions.deliver {
                user.receive_msu(msu);
            }
            if let Some(up) = actions.status {
                user.link_status(up);
            }
        }
    }
}

struct NullUser;

impl Mtp2User for NullUser {
    fn receive_msu(&self, _msu: Msu) {}

    fn link_status(&self, _operational: bool) {}
}

impl SigtranReceiver for M2paLink {
    fn receive_message(&self, data: Bytes) {
        let decoded = match decode_m2pa(&data) {
            Ok(d) => d,
            Err(err) => {
                warn!(link = %self.name, %err, "dropping bad M2PA message");
                return;
            }
        };
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock().unwrap();
            // Acknowledge our queue up to the peer's BSN
            while let Some((fsn, _)) = state.queue.front() {
                if decoded.bsn.wrapping_sub(*fsn) & SEQ_MASK < 0x0080_0000 {
                    state.queue.pop_front();
                } else {
                    break;
                }
            }
            if state.queue.is_empty() {
                state.t_ack.stop();
            }
            match decoded.mtype {
                TYPE_LINK_STATUS => {
                    if decoded.payload.len() >= 4 {
                        let value = u32::from_be_bytes([
                            decoded.payload[0],
                            decoded.payload[1],
                            decoded.payload[2],
                            decoded.payload[3],
                        ]);
                        if let Some(status) = M2paStatus::from_u32(value) {
                            self.handle_status(&mut state, &mut actions, status);
                        }
                    }
                }
                TYPE_USER_DATA => {
                    if state.phase != Phase::Operational {
                        return;
                    }
                    if decoded.payload.is_empty() {
                        // Plain acknowledgement
                    } else if decoded.fsn == next_seq(state.bsn_in) {
                        state.bsn_in = decoded.fsn;
                        state.rx_msus += 1;
                        actions.deliver.push(Msu(decoded.payload));
                        // Empty user data carries the acknowledgement back
                        actions.send.push(encode_m2pa(
                            TYPE_USER_DATA,
                            state.bsn_in,
                            state.fsn_out,
                            &[],
                        ));
                    } else if decoded.fsn != state.bsn_in {
                        warn!(link = %self.name, "sequence error, failing link");
                        self.fail(&mut state, &mut actions);
                    }
                }
                other => {
                    debug!(link = %self.name, mtype = other, "unknown M2PA type");
                }
            }
        }
        self.run_actions(actions);
    }

    fn transport_status(&self, up: bool) {
        if !up {
            let mut actions = Actions::default();
            {
                let mut state = self.state.lock().unwrap();
                self.fail(&mut state, &mut actions);
            }
            // The transport is gone; only the upward half matters
            actions.send.clear();
            self.run_actions(actions);
        }
    }
}

impl L2Link for M2paLink {
    fn transmit_msu(&self, msu: &Msu) -> Result<(), LinkError> {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Operational {
                return Err(LinkError::NotAligned);
            }
            if state.remote_busy {
                return Err(LinkError::RemoteBusy);
            }
            state.fsn_out = next_seq(state.fsn_out);
            let fsn_out = state.fsn_out;
            state.queue.push_back((fsn_out, msu.0.clone()));
            state.tx_msus += 1;
            if !state.t_ack.running() {
                state.t_ack.start(Instant::now());
            }
            actions.send.push(encode_m2pa(
                TYPE_USER_DATA,
                state.bsn_in,
                state.fsn_out,
                &msu.0,
            ));
        }
        self.run_actions(actions);
        Ok(())
    }

    fn operational(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Operational
    }

    fn set_user(&self, user: Weak<dyn Mtp2User>) {
        *self.user.write().unwrap() = user;
    }

    fn link_control(&self, op: L2Op) -> bool {
        let mut actions = Actions::default();
        let handled = {
            let mut state = self.state.lock().unwrap();
            match op {
                L2Op::Pause => {
                    self.fail(&mut state, &mut actions);
                    true
                }
                L2Op::Resume => {
                    if state.phase == Phase::OutOfService {
                        self.start_alignment(&mut state, &mut actions, false);
                    }
                    true
                }
                L2Op::Align { emergency } => {
                    self.start_alignment(&mut state, &mut actions, emergency);
                    true
                }
                L2Op::Status => {
                    info!(link = %self.name, phase = ?state.phase, queued = state.queue.len(), "status");
                    true
                }
            }
        };
        self.run_actions(actions);
        handled
    }

    fn congestion_level(&self) -> u8 {
        match self.state.lock().unwrap().queue.len() {
            0..=31 => 0,
            32..=63 => 1,
            64..=127 => 2,
            _ => 3,
        }
    }
}

#[async_trait]
impl SigComponent for M2paLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn component_type(&self) -> &'static str {
        "m2pa"
    }

    async fn tick(&self, now: Instant) -> Duration {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock().unwrap();
            if state.t_proving.fired(now) {
                state.t_proving.stop();
                if state.phase == Phase::Proving {
                    state.phase = Phase::Ready;
                    Self::push_status(&state, &mut actions, M2paStatus::Ready);
                }
            }
            if state.t_ack.fired(now) {
                state.t_ack.stop();
                warn!(link = %self.name, "acknowledgement timeout");
                self.fail(&mut state, &mut actions);
            }
        }
        self.run_actions(actions);
        TICK_IDLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sigtran::LoopTransport;
    use crate::mtp3::Label;
    use crate::types::{NetworkIndicator, PcType, PointCode, Sio};
    use std::sync::Mutex as StdMutex;

    struct Collect {
        msus: StdMutex<Vec<Msu>>,
        status: StdMutex<Vec<bool>>,
    }

    impl Collect {
        fn new() -> Arc<Self> {
            Arc::new(Self { msus: StdMutex::new(Vec::new()), status: StdMutex::new(Vec::new()) })
        }
    }

    impl Mtp2User for Collect {
        fn receive_msu(&self, msu: Msu) {
            self.msus.lock().unwrap().push(msu);
        }

        fn link_status(&self, operational: bool) {
            self.status.lock().unwrap().push(operational);
        }
    }

    fn pair() -> (Arc<M2paLink>, Arc<M2paLink>, Arc<LoopTransport>, Arc<LoopTransport>) {
        let (ta, tb) = LoopTransport::pair();
        let a = M2paLink::new("m2paA", 10, 2_000);
        let b = M2paLink::new("m2paB", 10, 2_000);
        a.attach_transport(ta.clone() as Arc<dyn SigtranTransport>);
        b.attach_transport(tb.clone() as Arc<dyn SigtranTransport>);
        (a, b, ta, tb)
    }

    fn pump(a: &LoopTransport, b: &LoopTransport) {
        for _ in 0..16 {
            if a.pump() + b.pump() == 0 {
                break;
            }
        }
    }

    async fn align(a: &Arc<M2paLink>, b: &Arc<M2paLink>, ta: &LoopTransport, tb: &LoopTransport) {
        a.link_control(L2Op::Align { emergency: false });
        b.link_control(L2Op::Align { emergency: false });
        pump(ta, tb);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let now = Instant::now();
        a.tick(now).await;
        b.tick(now).await;
        pump(ta, tb);
    }

    #[test]
    fn codec_roundtrip() {
        let msg = encode_m2pa(TYPE_USER_DATA, 0x123456, 0x654321, b"payload");
        let dec = decode_m2pa(&msg).unwrap();
        assert_eq!(dec.mtype, TYPE_USER_DATA);
        assert_eq!(dec.bsn, 0x123456);
        assert_eq!(dec.fsn, 0x654321);
        assert_eq!(dec.payload.as_ref(), b"payload");
    }

    #[test]
    fn sequence_wraps_at_24_bits() {
        assert_eq!(next_seq(SEQ_MASK), 0);
        assert_eq!(next_seq(5), 6);
    }

    #[tokio::test]
    async fn alignment_reaches_operational() {
        let (a, b, ta, tb) = pair();
        let ua = Collect::new();
        a.set_user(Arc::downgrade(&ua) as Weak<dyn Mtp2User>);
        align(&a, &b, &ta, &tb).await;
        assert!(a.operational());
        assert!(b.operational());
        assert_eq!(ua.status.lock().unwrap().as_slice(), &[true]);
    }

    #[tokio::test]
    async fn data_flows_and_acks() {
        let (a, b, ta, tb) = pair();
        let ub = Collect::new();
        b.set_user(Arc::downgrade(&ub) as Weak<dyn Mtp2User>);
        align(&a, &b, &ta, &tb).await;

        let label =
            Label::new(PcType::Itu, PointCode::new(2, 2, 2), PointCode::new(1, 1, 1), 0);
        let msu = Msu::new(Sio::new(3, 0, NetworkIndicator::National), &label, &[9, 9]);
        a.transmit_msu(&msu).unwrap();
        pump(&ta, &tb);
        assert_eq!(ub.msus.lock().unwrap().len(), 1);
        assert_eq!(ub.msus.lock().unwrap()[0], msu);
        // Ack drained the queue
        assert_eq!(a.state.lock().unwrap().queue.len(), 0);
    }

    #[tokio::test]
    async fn transmit_requires_service() {
        let (a, _b, _ta, _tb) = pair();
        let label =
            Label::new(PcType::Itu, PointCode::new(2, 2, 2), PointCode::new(1, 1, 1), 0);
        let msu = Msu::new(Sio::new(3, 0, NetworkIndicator::National), &label, &[]);
        assert!(matches!(a.transmit_msu(&msu), Err(LinkError::NotAligned)));
    }
}
