//! ISUP call state machine (Q.764)
//!
//! A call owns its circuit reservation, timers and segmentation buffer.
//! Message handling produces a list of actions the controller executes
//! after the call lock is released: messages to send, circuit operations
//! and events for the host.

use super::messages::{event, IsupMessage, MsgType, Param};
use crate::circuit::Circuit;
use crate::config::IsupConfig;
use crate::engine::{CallEvent, SigCounter, SigTimer};
use crate::mtp3::Label;
use crate::types::{cause, CallDirection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Call life-cycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Null,
    Testing,
    Setup,
    Accepted,
    Ringing,
    Answered,
    Releasing,
    Released,
}

impl CallState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::Testing => "Testing",
            Self::Setup => "Setup",
            Self::Accepted => "Accepted",
            Self::Ringing => "Ringing",
            Self::Answered => "Answered",
            Self::Releasing => "Releasing",
            Self::Released => "Released",
        }
    }

    pub fn live(&self) -> bool {
        !matches!(self, Self::Null | Self::Released)
    }
}

/// Work the controller performs on behalf of the call
#[derive(Debug)]
pub(crate) enum CallAction {
    Send(IsupMessage),
    Event(CallEvent, HashMap<String, String>),
    ConnectCircuit,
    DisconnectCircuit,
    ReleaseCircuit,
    /// Remove the call from the controller's list
    Finished,
}

struct CallData {
    state: CallState,
    reason: Option<u8>,
    called: String,
    calling: String,
    /// More digits may still arrive or be sent
    overlap: bool,
    sgm_pending: Option<IsupMessage>,
    /// Awaiting continuity check completion before proceeding
    continuity: bool,
    t1_rel: SigTimer,
    t5_release_guard: SigTimer,
    t7_setup: SigTimer,
    t9_answer: SigTimer,
    t34_segment: SigTimer,
    replaces: SigCounter,
}

/// One ISUP call bound to a circuit
pub struct IsupCall {
    direction: CallDirection,
    circuit: RwLock<Arc<Circuit>>,
    label: Mutex<Label>,
    max_called_digits: usize,
    data: Mutex<CallData>,
}

impl IsupCall {
    pub(crate) fn new(
        direction: CallDirection,
        circuit: Arc<Circuit>,
        label: Label,
        called: &str,
        calling: &str,
        cfg: &IsupConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            direction,
            circuit: RwLock::new(circuit),
            label: Mutex::new(label),
            max_called_digits: cfg.max_called_digits,
            data: Mutex::new(CallData {
                state: CallState::Null,
                reason: None,
                called: called.to_string(),
                calling: calling.to_string(),
                overlap: false,
                sgm_pending: None,
                continuity: cfg.continuity,
                t1_rel: SigTimer::new(cfg.t1_ms),
                t5_release_guard: SigTimer::new(cfg.t5_ms),
                t7_setup: SigTimer::new(cfg.t7_ms),
                t9_answer: SigTimer::new(cfg.t9_ms),
                t34_segment: SigTimer::new(cfg.t34_ms),
                replaces: SigCounter::new(cfg.max_replaces),
            }),
        })
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn cic(&self) -> u32 {
        self.circuit.read().unwrap().code()
    }

    pub fn circuit(&self) -> Arc<Circuit> {
        self.circuit.read().unwrap().clone()
    }

    pub(crate) fn swap_circuit(&self, circuit: Arc<Circuit>) {
        *self.circuit.write().unwrap() = circuit;
    }

    pub fn label(&self) -> Label {
        *self.label.lock().unwrap()
    }

    pub fn state(&self) -> CallState {
        self.data.lock().unwrap().state
    }

    pub fn reason(&self) -> Option<u8> {
        self.data.lock().unwrap().reason
    }

    pub fn called(&self) -> String {
        self.data.lock().unwrap().called.clone()
    }

    pub fn calling(&self) -> String {
        self.data.lock().unwrap().calling.clone()
    }

    /// The winner of a glare still has a replacement attempt left
    pub(crate) fn can_replace(&self) -> bool {
        let mut data = self.data.lock().unwrap();
        data.replaces.inc()
    }

    fn msg(&self, mtype: MsgType) -> IsupMessage {
        IsupMessage::new(mtype, self.cic())
    }

    /// Outgoing side: the controller sent the IAM, arm T7
    pub(crate) fn setup_sent(&self, now: Instant) {
        let mut data = self.data.lock().unwrap();
        data.state = CallState::Setup;
        data.t7_setup.start(now);
        if data.continuity {
            data.state = CallState::Testing;
        }
    }

    /// Incoming side: an IAM arrived and the circuit is reserved
    pub(crate) fn setup_received(&self, iam: &IsupMessage) -> Vec<CallAction> {
        let mut data = self.data.lock().unwrap();
        data.state = CallState::Setup;
        data.called = iam.called_number().unwrap_or_default();
        data.calling = iam.calling_number().unwrap_or_default();
        data.overlap = data.called.len() < self.max_called_digits;
        vec![CallAction::Event(CallEvent::NewCall, iam.to_params())]
    }

    /// Accept an incoming call: ACM toward the caller
    pub fn accept(&self) -> Vec<IsupMessage> {
        let mut data = self.data.lock().unwrap();
        if data.state != CallState::Setup {
            return Vec::new();
        }
        data.state = CallState::Accepted;
        let mut acm = self.msg(MsgType::Acm);
        acm.set_param(Param::BACKWARD_CALL_INDICATORS, vec![0x12, 0x14]);
        vec![acm]
    }

    /// Report ringing on an accepted incoming call
    pub fn ringing(&self) -> Vec<IsupMessage> {
        let mut data = self.data.lock().unwrap();
        if !matches!(data.state, CallState::Accepted) {
            return Vec::new();
        }
        data.state = CallState::Ringing;
        let mut cpg = self.msg(MsgType::Cpg);
        cpg.set_event(event::ALERTING);
        vec![cpg]
    }

    /// Answer an incoming call
    pub fn answer(&self) -> Vec<IsupMessage> {
        let mut data = self.data.lock().unwrap();
        if !matches!(data.state, CallState::Accepted | CallState::Ringing) {
            return Vec::new();
        }
        data.state = CallState::Answered;
        data.t9_answer.start(Instant::now());
        vec![self.msg(MsgType::Anm)]
    }

    /// Emit further called digits while in overlap sending
    pub fn send_digits(&self, digits: &str) -> Vec<IsupMessage> {
        let mut data = self.data.lock().unwrap();
        if !matches!(data.state, CallState::Setup | CallState::Testing) || digits.is_empty() {
            return Vec::new();
        }
        let room = self.max_called_digits.saturating_sub(data.called.len());
        if room == 0 {
            return Vec::new();
        }
        let take: String = digits.chars().take(room).collect();
        data.called.push_str(&take);
        if data.called.len() >= self.max_called_digits {
            data.overlap = false;
        }
        let mut sam = self.msg(MsgType::Sam);
        sam.set_subsequent_number(&take);
        vec![sam]
    }

    /// User-initiated release; the controller executes the actions
    pub(crate) fn hangup(&self, reason: u8) -> Vec<CallAction> {
        let mut data = self.data.lock().unwrap();
        self.start_release(&mut data, reason)
    }

    fn start_release(&self, data: &mut CallData, reason: u8) -> Vec<CallAction> {
        if matches!(data.state, CallState::Releasing | CallState::Released) {
            return Vec::new();
        }
        let was_answered = data.state == CallState::Answered;
        data.state = CallState::Releasing;
        data.reason = Some(reason);
        let now = Instant::now();
        data.t1_rel.start(now);
        data.t5_release_guard.start(now);
        data.t7_setup.stop();
        data.t9_answer.stop();
        let mut rel = self.msg(MsgType::Rel);
        rel.set_cause(reason);
        let mut actions = vec![CallAction::Send(rel)];
        if was_answered {
            actions.push(CallAction::DisconnectCircuit);
        }
        actions
    }

    fn finish(&self, data: &mut CallData, emit_release: bool) -> Vec<CallAction> {
        data.state = CallState::Released;
        data.t1_rel.stop();
        data.t5_release_guard.stop();
        data.t7_setup.stop();
        data.t9_answer.stop();
        data.t34_segment.stop();
        let mut actions = vec![CallAction::ReleaseCircuit, CallAction::Finished];
        if emit_release {
            let mut params = HashMap::new();
            if let Some(reason) = data.reason {
                params.insert("cause".to_string(), reason.to_string());
            }
            actions.insert(0, CallAction::Event(CallEvent::Release, params));
        }
        actions
    }

    /// Process one incoming message for this call
    pub(crate) fn handle_message(&self, msg: IsupMessage) -> Vec<CallAction> {
        let mut data = self.data.lock().unwrap();

        // Segment reassembly comes before everything else
        if let Some(mut head) = data.sgm_pending.take() {
            if msg.mtype == MsgType::Sgm {
                data.t34_segment.stop();
                head.merge(&msg);
                return self.dispatch(&mut data, head);
            }
            // Head is processed with whatever arrived
            data.t34_segment.stop();
            let mut actions = self.dispatch(&mut data, head);
            actions.extend(self.dispatch(&mut data, msg));
            return actions;
        }
        if msg.segmentation_follows() {
            data.t34_segment.start(Instant::now());
            data.sgm_pending = Some(msg);
            return Vec::new();
        }
        self.dispatch(&mut data, msg)
    }

    fn dispatch(&self, data: &mut CallData, msg: IsupMessage) -> Vec<CallAction> {
        use CallState::*;
        debug!(cic = self.cic(), msg = msg.mtype.name(), state = data.state.name(), "call message");
        match msg.mtype {
            MsgType::Acm => match data.state {
                Setup => {
                    data.state = Accepted;
                    data.t7_setup.stop();
                    vec![CallAction::Event(CallEvent::Accept, msg.to_params())]
                }
                _ => self.confusion(data, &msg),
            },
            MsgType::Cpg => match data.state {
                Accepted | Ringing => {
                    if msg.event_info() == Some(event::ALERTING) {
                        data.state = Ringing;
                        vec![CallAction::Event(CallEvent::Ringing, msg.to_params())]
                    } else {
                        vec![CallAction::Event(CallEvent::Progress, msg.to_params())]
                    }
                }
                _ => self.confusion(data, &msg),
            },
            MsgType::Anm => match data.state {
                Accepted | Ringing => {
                    data.state = Answered;
                    data.t9_answer.start(Instant::now());
                    vec![
                        CallAction::ConnectCircuit,
                        CallAction::Event(CallEvent::Answer, msg.to_params()),
                    ]
                }
                _ => self.confusion(data, &msg),
            },
            MsgType::Con => match data.state {
                Setup | Accepted => {
                    data.state = Answered;
                    data.t7_setup.stop();
                    data.t9_answer.start(Instant::now());
                    vec![
                        CallAction::ConnectCircuit,
                        CallAction::Event(CallEvent::Answer, msg.to_params()),
                    ]
                }
                _ => self.confusion(data, &msg),
            },
            MsgType::Sam => match data.state {
                Setup if data.overlap => {
                    let more = msg.subsequent_number().unwrap_or_default();
                    let room = self.max_called_digits.saturating_sub(data.called.len());
                    let take: String = more.chars().take(room).collect();
                    data.called.push_str(&take);
                    if data.called.len() >= self.max_called_digits {
                        data.overlap = false;
                    }
                    let mut params = msg.to_params();
                    params.insert("called".to_string(), data.called.clone());
                    vec![CallAction::Event(CallEvent::Info, params)]
                }
                _ => self.confusion(data, &msg),
            },
            MsgType::Cot => match data.state {
                Testing => {
                    if msg.continuity_ok() {
                        data.state = Setup;
                        Vec::new()
                    } else {
                        warn!(cic = self.cic(), "continuity check failed");
                        self.start_release(data, cause::TEMPORARY_FAILURE)
                    }
                }
                _ => self.confusion(data, &msg),
            },
            MsgType::Rel => {
                data.reason = msg.cause();
                let was_live = data.state.live();
                let rlc = self.msg(MsgType::Rlc);
                let mut actions = vec![CallAction::Send(rlc)];
                if data.state == Answered {
                    actions.push(CallAction::DisconnectCircuit);
                }
                actions.extend(self.finish(data, was_live));
                actions
            }
            MsgType::Rlc => match data.state {
                Releasing => self.finish(data, false),
                Released => Vec::new(),
                _ => {
                    // RLC without REL: peer cleared the circuit underneath us
                    self.finish(data, true)
                }
            },
            MsgType::Sus => match data.state {
                Answered => vec![CallAction::Event(CallEvent::Suspend, msg.to_params())],
                _ => self.confusion(data, &msg),
            },
            MsgType::Res => match data.state {
                Answered => vec![CallAction::Event(CallEvent::Resume, msg.to_params())],
                _ => self.confusion(data, &msg),
            },
            MsgType::Ucic => {
                warn!(cic = self.cic(), "peer reports unequipped circuit");
                data.reason = Some(cause::REQUESTED_CIRCUIT_UNAVAILABLE);
                self.finish(data, true)
            }
            MsgType::Cnf => {
                data.reason = msg.cause();
                vec![CallAction::Event(CallEvent::Message, msg.to_params())]
            }
            MsgType::Usr => vec![CallAction::Event(CallEvent::Message, msg.to_params())],
            other => {
                debug!(cic = self.cic(), msg = other.name(), "unhandled message for call");
                self.confusion(data, &msg)
            }
        }
    }

    fn confusion(&self, data: &mut CallData, msg: &IsupMessage) -> Vec<CallAction> {
        // A confusion during release would only prolong the dialog
        if matches!(data.state, CallState::Releasing | CallState::Released) {
            return Vec::new();
        }
        warn!(
            cic = self.cic(),
            msg = msg.mtype.name(),
            state = data.state.name(),
            "unexpected message"
        );
        let mut cnf = self.msg(MsgType::Cnf);
        cnf.set_cause(cause::WRONG_MESSAGE);
        vec![CallAction::Send(cnf)]
    }

    /// Drive the per-call timers; returns actions and the nearest deadline
    pub(crate) fn tick(&self, now: Instant) -> (Vec<CallAction>, Option<Duration>) {
        let mut data = self.data.lock().unwrap();
        let mut actions = Vec::new();
        if data.t7_setup.fired(now) {
            data.t7_setup.stop();
            warn!(cic = self.cic(), "setup timed out");
            actions.extend(self.start_release(&mut data, cause::RECOVERY_ON_TIMER_EXPIRY));
        }
        if data.t9_answer.fired(now) {
            data.t9_answer.stop();
            actions.extend(self.start_release(&mut data, cause::NORMAL_CLEARING));
        }
        if data.t34_segment.fired(now) {
            data.t34_segment.stop();
            if let Some(head) = data.sgm_pending.take() {
                debug!(cic = self.cic(), "segment wait expired, processing head message");
                actions.extend(self.dispatch(&mut data, head));
            }
        }
        if data.t1_rel.fired(now) {
            data.t1_rel.start(now);
            if data.state == CallState::Releasing {
                let mut rel = self.msg(MsgType::Rel);
                rel.set_cause(data.reason.unwrap_or(cause::NORMAL_CLEARING));
                actions.push(CallAction::Send(rel));
            }
        }
        if data.t5_release_guard.fired(now) {
            data.t5_release_guard.stop();
            if data.state == CallState::Releasing {
                warn!(cic = self.cic(), "release unacknowledged, forcing");
                actions.extend(self.finish(&mut data, true));
            }
        }
        let deadline = [
            &data.t1_rel,
            &data.t5_release_guard,
            &data.t7_setup,
            &data.t9_answer,
            &data.t34_segment,
        ]
        .iter()
        .filter_map(|t| t.remaining(now))
        .min();
        (actions, deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitType;
    use crate::types::{PcType, PointCode};

    fn call(direction: CallDirection) -> Arc<IsupCall> {
        let circuit = Circuit::new(42, CircuitType::Tdm, "span1");
        assert!(circuit.reserve(crate::circuit::LockFlags::LOCKED));
        let label = Label::new(
            PcType::Itu,
            PointCode::new(2, 2, 2),
            PointCode::new(1, 1, 1),
            42,
        );
        IsupCall::new(direction, circuit, label, "15551234", "15550000", &IsupConfig::default())
    }

    fn acm() -> IsupMessage {
        let mut m = IsupMessage::new(MsgType::Acm, 42);
        m.set_param(Param::BACKWARD_CALL_INDICATORS, vec![0x12, 0x14]);
        m
    }

    #[test]
    fn outgoing_happy_path() {
        let c = call(CallDirection::Outgoing);
        c.setup_sent(Instant::now());
        assert_eq!(c.state(), CallState::Setup);

        let actions = c.handle_message(acm());
        assert_eq!(c.state(), CallState::Accepted);
        assert!(matches!(actions[0], CallAction::Event(CallEvent::Accept, _)));

        let mut cpg = IsupMessage::new(MsgType::Cpg, 42);
        cpg.set_event(event::ALERTING);
        let actions = c.handle_message(cpg);
        assert_eq!(c.state(), CallState::Ringing);
        assert!(matches!(actions[0], CallAction::Event(CallEvent::Ringing, _)));

        let actions = c.handle_message(IsupMessage::new(MsgType::Anm, 42));
        assert_eq!(c.state(), CallState::Answered);
        assert!(matches!(actions[0], CallAction::ConnectCircuit));

        // User hangs up: REL with the requested cause
        let actions = c.hangup(cause::NORMAL_CLEARING);
        assert_eq!(c.state(), CallState::Releasing);
        match &actions[0] {
            CallAction::Send(rel) => {
                assert_eq!(rel.mtype, MsgType::Rel);
                assert_eq!(rel.cause(), Some(16));
            }
            other => panic!("unexpected {other:?}"),
        }

        let actions = c.handle_message(IsupMessage::new(MsgType::Rlc, 42));
        assert_eq!(c.state(), CallState::Released);
        assert!(actions.iter().any(|a| matches!(a, CallAction::Finished)));
    }

    #[test]
    fn unexpected_message_answers_confusion() {
        let c = call(CallDirection::Outgoing);
        c.setup_sent(Instant::now());
        let actions = c.handle_message(IsupMessage::new(MsgType::Anm, 42));
        match &actions[0] {
            CallAction::Send(cnf) => {
                assert_eq!(cnf.mtype, MsgType::Cnf);
                assert_eq!(cnf.cause(), Some(cause::WRONG_MESSAGE));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rel_in_any_state_releases_and_acks() {
        let c = call(CallDirection::Outgoing);
        c.setup_sent(Instant::now());
        let mut rel = IsupMessage::new(MsgType::Rel, 42);
        rel.set_cause(17);
        let actions = c.handle_message(rel);
        assert!(matches!(&actions[0], CallAction::Send(m) if m.mtype == MsgType::Rlc));
        assert_eq!(c.state(), CallState::Released);
        assert_eq!(c.reason(), Some(17));
    }

    #[test]
    fn overlap_digit_bound() {
        let c = call(CallDirection::Incoming);
        let mut iam = IsupMessage::new(MsgType::Iam, 42);
        iam.set_called_number("1555", 3, 1, false);
        c.setup_received(&iam);
        // Default bound is 24 digits; sending 30 more keeps exactly 24
        let mut sam = IsupMessage::new(MsgType::Sam, 42);
        sam.set_subsequent_number("123456789012345678901234567890");
        c.handle_message(sam);
        assert_eq!(c.called().len(), 24);
    }

    #[test]
    fn segmented_message_merges() {
        let c = call(CallDirection::Outgoing);
        c.setup_sent(Instant::now());
        let mut acm = acm();
        acm.set_param(
            Param::OPTIONAL_BACKWARD_CALL_INDICATORS,
            vec![super::super::messages::SEGMENTATION_FOLLOWS],
        );
        assert!(c.handle_message(acm).is_empty());
        assert_eq!(c.state(), CallState::Setup);

        let mut sgm = IsupMessage::new(MsgType::Sgm, 42);
        sgm.set_param(Param::USER_TO_USER_INFORMATION, vec![1]);
        let actions = c.handle_message(sgm);
        assert_eq!(c.state(), CallState::Accepted);
        assert!(matches!(actions[0], CallAction::Event(CallEvent::Accept, _)));
    }

    #[test]
    fn release_guard_forces_cleanup() {
        let c = call(CallDirection::Outgoing);
        c.setup_sent(Instant::now());
        c.hangup(16);
        // Far in the future both T1 and T5 fire; T5 wins
        let later = Instant::now() + Duration::from_secs(400);
        let (actions, _) = c.tick(later);
        assert_eq!(c.state(), CallState::Released);
        assert!(actions.iter().any(|a| matches!(a, CallAction::Finished)));
    }
}
