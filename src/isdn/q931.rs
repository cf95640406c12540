//! Q.931 call control
//!
//! Message and information-element codec plus the per-call state machine
//! with its timers, the switch-type behaviour flags and the restart
//! procedure. Calls ride a Q.921 data link.

use super::q921::{Q921Link, Q921User};
use crate::config::Q931Config;
use crate::engine::{CallEvent, ControlMap, Engine, Notification, SigComponent, SigCounter, SigTimer};
use crate::errors::IsdnError;
use crate::types::cause;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Protocol discriminator for Q.931 user-network call control
const PROTO_Q931: u8 = 0x08;

/// Message types
pub mod mt {
    pub const ALERTING: u8 = 0x01;
    pub const PROCEEDING: u8 = 0x02;
    pub const PROGRESS: u8 = 0x03;
    pub const SETUP: u8 = 0x05;
    pub const CONNECT: u8 = 0x07;
    pub const SETUP_ACK: u8 = 0x0D;
    pub const CONNECT_ACK: u8 = 0x0F;
    pub const USER_INFO: u8 = 0x20;
    pub const SUSPEND_REJECT: u8 = 0x21;
    pub const RESUME_REJECT: u8 = 0x22;
    pub const SUSPEND: u8 = 0x25;
    pub const RESUME: u8 = 0x26;
    pub const SUSPEND_ACK: u8 = 0x2D;
    pub const RESUME_ACK: u8 = 0x2E;
    pub const DISCONNECT: u8 = 0x45;
    pub const RESTART: u8 = 0x46;
    pub const RELEASE: u8 = 0x4D;
    pub const RESTART_ACK: u8 = 0x4E;
    pub const RELEASE_COMPLETE: u8 = 0x5A;
    pub const SEGMENT: u8 = 0x60;
    pub const NOTIFY: u8 = 0x6E;
    pub const STATUS_ENQUIRY: u8 = 0x75;
    pub const INFO: u8 = 0x7B;
    pub const STATUS: u8 = 0x7D;
}

/// Information element identifiers
pub mod ie {
    pub const SEGMENTED: u8 = 0x00;
    pub const BEARER_CAPS: u8 = 0x04;
    pub const CAUSE: u8 = 0x08;
    pub const CALL_IDENTITY: u8 = 0x10;
    pub const CALL_STATE: u8 = 0x14;
    pub const CHANNEL_ID: u8 = 0x18;
    pub const PROGRESS: u8 = 0x1E;
    pub const NET_FACILITY: u8 = 0x20;
    pub const NOTIFICATION: u8 = 0x27;
    pub const DISPLAY: u8 = 0x28;
    pub const KEYPAD: u8 = 0x2C;
    pub const SIGNAL: u8 = 0x34;
    pub const CALLING_NO: u8 = 0x6C;
    pub const CALLING_SUBADDR: u8 = 0x6D;
    pub const CALLED_NO: u8 = 0x70;
    pub const CALLED_SUBADDR: u8 = 0x71;
    pub const RESTART: u8 = 0x79;
    pub const LOW_LAYER_COMPAT: u8 = 0x7C;
    pub const HIGH_LAYER_COMPAT: u8 = 0x7D;
    pub const USER_USER: u8 = 0x7E;
    /// Single-octet: no further address digits follow
    pub const SENDING_COMPLETE: u8 = 0xA1;
}

/// Switch-type behaviour flags; every flag acts independently
pub mod switch_flags {
    /// Append the Sending Complete IE to SETUP
    pub const SEND_SENDING_COMPLETE: u32 = 0x0001;
    /// Display IE text is prefixed with a charset octet
    pub const DISPLAY_CHARSET: u32 = 0x0002;
    /// Dial with the Keypad IE instead of Called Party Number
    pub const KEYPAD_DIAL: u32 = 0x0004;
    /// Bearer capability limited to the short two-octet form
    pub const SIMPLE_BEARER_CAPS: u32 = 0x0008;
    /// Include the layer-1 capability octet in bearer capability
    pub const SEND_LAYER1_CAPS: u32 = 0x0010;
    /// Ignore progress indicator "source not ISDN"
    pub const IGNORE_NONISDN_SOURCE: u32 = 0x0020;
    /// Ignore progress indicator "destination not ISDN"
    pub const IGNORE_NONISDN_DEST: u32 = 0x0040;
    /// CPE side goes Active on CONNECT without awaiting CONNECT ACK
    pub const CPE_CONNECT_ACTIVE: u32 = 0x0080;
}

/// Bearer capability for a speech call under the behaviour flags.
/// Switches that reject extended forms get exactly the two-octet IE;
/// otherwise the layer-1 capability octet is appended on request.
fn bearer_caps(flags: u32) -> Vec<u8> {
    if flags & switch_flags::SIMPLE_BEARER_CAPS != 0 {
        return vec![0x80, 0x90];
    }
    if flags & switch_flags::SEND_LAYER1_CAPS != 0 {
        vec![0x80, 0x90, 0xA3]
    } else {
        vec![0x80, 0x90]
    }
}

/// Behaviour preset per switch type name
pub fn switch_type_flags(name: &str) -> u32 {
    use switch_flags::*;
    match name.to_ascii_lowercase().as_str() {
        "euro-isdn-e1" | "euro-isdn-t1" | "etsi" => SEND_SENDING_COMPLETE | SEND_LAYER1_CAPS,
        "national-isdn-t1" | "ni1" | "ni2" => {
            KEYPAD_DIAL | DISPLAY_CHARSET | CPE_CONNECT_ACTIVE
        }
        "dms100" => DISPLAY_CHARSET | IGNORE_NONISDN_DEST,
        "4ess" => SIMPLE_BEARER_CAPS | IGNORE_NONISDN_SOURCE,
        "5ess" => KEYPAD_DIAL | SIMPLE_BEARER_CAPS,
        "qsig" => 0,
        _ => SEND_SENDING_COMPLETE,
    }
}

/// One Q.931 message with its ordered information elements
#[derive(Debug, Clone)]
pub struct Q931Message {
    pub mtype: u8,
    pub call_ref: u16,
    /// Sent by the side that allocated the call reference
    pub from_originator: bool,
    ies: Vec<(u8, Bytes)>,
}

impl Q931Message {
    pub fn new(mtype: u8, call_ref: u16, from_originator: bool) -> Self {
        Self { mtype, call_ref, from_originator, ies: Vec::new() }
    }

    pub fn add_ie(&mut self, id: u8, data: impl Into<Bytes>) -> &mut Self {
        self.ies.push((id, data.into()));
        self
    }

    pub fn ie(&self, id: u8) -> Option<&Bytes> {
        self.ies.iter().find(|(i, _)| *i == id).map(|(_, v)| v)
    }

    pub fn has_ie(&self, id: u8) -> bool {
        self.ie(id).is_some()
    }

    pub fn ies(&self) -> &[(u8, Bytes)] {
        &self.ies
    }

    pub fn set_cause(&mut self, value: u8) -> &mut Self {
        // Location "user", ITU coding
        self.add_ie(ie::CAUSE, vec![0x80, 0x80 | (value & 0x7F)])
    }

    pub fn cause(&self) -> Option<u8> {
        self.ie(ie::CAUSE).and_then(|v| v.get(1)).map(|b| b & 0x7F)
    }

    pub fn set_called(&mut self, digits: &str, plan: u8) -> &mut Self {
        let mut data = Vec::with_capacity(1 + digits.len());
        data.push(0x80 | (plan & 0x0F));
        data.extend_from_slice(digits.as_bytes());
        self.add_ie(ie::CALLED_NO, data)
    }

    pub fn called(&self) -> Option<String> {
        self.ie(ie::CALLED_NO)
            .filter(|v| v.len() > 1)
            .map(|v| String::from_utf8_lossy(&v[1..]).into_owned())
    }

    pub fn set_calling(&mut self, digits: &str, plan: u8, presentation: u8) -> &mut Self {
        let mut data = Vec::with_capacity(2 + digits.len());
        data.push(plan & 0x7F);
        data.push(0x80 | (presentation & 0x7F));
        data.extend_from_slice(digits.as_bytes());
        self.add_ie(ie::CALLING_NO, data)
    }

    pub fn calling(&self) -> Option<String> {
        self.ie(ie::CALLING_NO)
            .filter(|v| v.len() > 2)
            .map(|v| String::from_utf8_lossy(&v[2..]).into_owned())
    }

    pub fn set_channel(&mut self, channel: u8) -> &mut Self {
        // PRI exclusive B-channel, slot map absent
        self.add_ie(ie::CHANNEL_ID, vec![0xA9, 0x83, 0x80 | channel])
    }

    pub fn channel(&self) -> Option<u8> {
        self.ie(ie::CHANNEL_ID).and_then(|v| v.get(2)).map(|b| b & 0x7F)
    }

    pub fn set_call_state(&mut self, state: u8) -> &mut Self {
        self.add_ie(ie::CALL_STATE, vec![state & 0x3F])
    }

    pub fn set_restart_class(&mut self, class: u8) -> &mut Self {
        self.add_ie(ie::RESTART, vec![0x80 | (class & 0x07)])
    }

    pub fn to_params(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("callref".to_string(), self.call_ref.to_string());
        if let Some(called) = self.called() {
            map.insert("called".to_string(), called);
        }
        if let Some(calling) = self.calling() {
            map.insert("caller".to_string(), calling);
        }
        if let Some(cause) = self.cause() {
            map.insert("cause".to_string(), cause.to_string());
        }
        if let Some(channel) = self.channel() {
            map.insert("channel".to_string(), channel.to_string());
        }
        map
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(PROTO_Q931);
        buf.put_u8(2);
        let flag = if self.from_originator { 0 } else { 0x80 };
        buf.put_u8(((self.call_ref >> 8) as u8 & 0x7F) | flag);
        buf.put_u8(self.call_ref as u8);
        buf.put_u8(self.mtype & 0x7F);
        for (id, data) in &self.ies {
            if *id & 0x80 != 0 {
                // Single-octet IE
                buf.put_u8(*id);
            } else {
                buf.put_u8(*id);
                buf.put_u8(data.len() as u8);
                buf.put_slice(data);
            }
        }
        buf.freeze()
    }

    pub fn decode(packet: &[u8]) -> Result<Self, IsdnError> {
        if packet.len() < 4 {
            return Err(IsdnError::BadFrame("short message".to_string()));
        }
        if packet[0] != PROTO_Q931 {
            return Err(IsdnError::BadFrame(format!(
                "protocol discriminator {:#04x}",
                packet[0]
            )));
        }
        let cr_len = (packet[1] & 0x0F) as usize;
        if cr_len > 2 || packet.len() < 3 + cr_len {
            return Err(IsdnError::BadFrame("bad call reference".to_string()));
        }
        let (call_ref, from_originator) = match cr_len {
            0 => (0, true),
            1 => ((packet[2] & 0x7F) as u16, packet[2] & 0x80 == 0),
            _ => (
                (((packet[2] & 0x7F) as u16) << 8) | packet[3] as u16,
                packet[2] & 0x80 == 0,
            ),
        };
        let mtype = packet[2 + cr_len] & 0x7F;
        let mut msg = Self::new(mtype, call_ref, from_originator);
        let mut at = 3 + cr_len;
        while at < packet.len() {
            let id = packet[at];
            if id & 0x80 != 0 {
                msg.ies.push((id, Bytes::new()));
                at += 1;
                continue;
            }
            if at + 1 >= packet.len() {
                return Err(IsdnError::BadIe(id));
            }
            let len = packet[at + 1] as usize;
            if at + 2 + len > packet.len() {
                return Err(IsdnError::BadIe(id));
            }
            msg.ies.push((id, Bytes::copy_from_slice(&packet[at + 2..at + 2 + len])));
            at += 2 + len;
        }
        Ok(msg)
    }
}

/// Q.931 call states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Q931State {
    Null,
    CallInitiated,
    OverlapSend,
    OutgoingProceeding,
    CallDelivered,
    CallPresent,
    CallReceived,
    ConnectReq,
    IncomingProceeding,
    Active,
    DisconnectReq,
    DisconnectIndication,
    SuspendReq,
    ResumeReq,
    ReleaseReq,
    CallAbort,
    OverlapRecv,
}

impl Q931State {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::CallInitiated => "CallInitiated",
            Self::OverlapSend => "OverlapSend",
            Self::OutgoingProceeding => "OutgoingProceeding",
            Self::CallDelivered => "CallDelivered",
            Self::CallPresent => "CallPresent",
            Self::CallReceived => "CallReceived",
            Self::ConnectReq => "ConnectReq",
            Self::IncomingProceeding => "IncomingProceeding",
            Self::Active => "Active",
            Self::DisconnectReq => "DisconnectReq",
            Self::DisconnectIndication => "DisconnectIndication",
            Self::SuspendReq => "SuspendReq",
            Self::ResumeReq => "ResumeReq",
            Self::ReleaseReq => "ReleaseReq",
            Self::CallAbort => "CallAbort",
            Self::OverlapRecv => "OverlapRecv",
        }
    }

    /// Numeric value for the Call State IE
    pub fn value(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::CallInitiated => 1,
            Self::OverlapSend => 2,
            Self::OutgoingProceeding => 3,
            Self::CallDelivered => 4,
            Self::CallPresent => 6,
            Self::CallReceived => 7,
            Self::ConnectReq => 8,
            Self::IncomingProceeding => 9,
            Self::Active => 10,
            Self::DisconnectReq => 11,
            Self::DisconnectIndication => 12,
            Self::SuspendReq => 15,
            Self::ResumeReq => 17,
            Self::ReleaseReq => 19,
            Self::CallAbort => 22,
            Self::OverlapRecv => 25,
        }
    }
}

#[derive(Debug)]
enum Q931Action {
    Send(Q931Message),
    Event(CallEvent, HashMap<String, String>),
    Finished,
}

struct Q931CallData {
    state: Q931State,
    cause: Option<u8>,
    called: String,
    t302_overlap: SigTimer,
    t303_setup: SigTimer,
    t305_disconnect: SigTimer,
    t308_release: SigTimer,
    t313_connect: SigTimer,
    setup_retries: SigCounter,
}

/// One Q.931 call
pub struct Q931Call {
    call_ref: u16,
    originator: bool,
    channel: u8,
    data: Mutex<Q931CallData>,
}

impl Q931Call {
    fn new(call_ref: u16, originator: bool, channel: u8, cfg: &Q931Config) -> Arc<Self> {
        Arc::new(Self {
            call_ref,
            originator,
            channel,
            data: Mutex::new(Q931CallData {
                state: Q931State::Null,
                cause: None,
                called: String::new(),
                t302_overlap: SigTimer::new(cfg.t302_ms),
                t303_setup: SigTimer::new(cfg.t303_ms),
                t305_disconnect: SigTimer::new(cfg.t305_ms),
                t308_release: SigTimer::new(cfg.t308_ms),
                t313_connect: SigTimer::new(cfg.t313_ms),
                setup_retries: SigCounter::new(1),
            }),
        })
    }

    pub fn call_ref(&self) -> u16 {
        self.call_ref
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn state(&self) -> Q931State {
        self.data.lock().unwrap().state
    }

    pub fn cause(&self) -> Option<u8> {
        self.data.lock().unwrap().cause
    }

    fn msg(&self, mtype: u8) -> Q931Message {
        Q931Message::new(mtype, self.call_ref, self.originator)
    }

    fn release_complete(&self, data: &mut Q931CallData, value: u8) -> Vec<Q931Action> {
        data.state = Q931State::Null;
        data.cause = Some(value);
        let mut rc = self.msg(mt::RELEASE_COMPLETE);
        rc.set_cause(value);
        let mut params = HashMap::new();
        params.insert("cause".to_string(), value.to_string());
        vec![
            Q931Action::Send(rc),
            Q931Action::Event(CallEvent::Release, params),
            Q931Action::Finished,
        ]
    }

    fn status(&self, data: &Q931CallData, value: u8) -> Q931Action {
        let mut status = self.msg(mt::STATUS);
        status.set_cause(value);
        status.set_call_state(data.state.value());
        Q931Action::Send(status)
    }

    fn handle_message(&self, msg: &Q931Message) -> Vec<Q931Action> {
        use Q931State::*;
        let mut data = self.data.lock().unwrap();
        debug!(
            callref = self.call_ref,
            mtype = msg.mtype,
            state = data.state.name(),
            "call message"
        );
        match msg.mtype {
            mt::SETUP_ACK => match data.state {
                CallInitiated => {
                    data.state = OverlapSend;
                    data.t303_setup.stop();
                    data.t302_overlap.start(Instant::now());
                    vec![Q931Action::Event(CallEvent::Accept, msg.to_params())]
                }
                _ => vec![self.status(&data, cause::WRONG_MESSAGE)],
            },
            mt::PROCEEDING => match data.state {
                CallInitiated | OverlapSend => {
                    data.state = OutgoingProceeding;
                    data.t303_setup.stop();
                    data.t302_overlap.stop();
                    vec![Q931Action::Event(CallEvent::Accept, msg.to_params())]
                }
                _ => vec![self.status(&data, cause::WRONG_MESSAGE)],
            },
            mt::ALERTING => match data.state {
                CallInitiated | OverlapSend | OutgoingProceeding => {
                    data.state = CallDelivered;
                    data.t303_setup.stop();
                    vec![Q931Action::Event(CallEvent::Ringing, msg.to_params())]
                }
                _ => vec![self.status(&data, cause::WRONG_MESSAGE)],
            },
            mt::PROGRESS => {
                vec![Q931Action::Event(CallEvent::Progress, msg.to_params())]
            }
            mt::SETUP => vec![self.status(&data, cause::WRONG_MESSAGE)],
            mt::CONNECT => match data.state {
                CallInitiated | OverlapSend | OutgoingProceeding | CallDelivered => {
                    data.state = Active;
                    data.t303_setup.stop();
                    vec![
                        Q931Action::Send(self.msg(mt::CONNECT_ACK)),
                        Q931Action::Event(CallEvent::Answer, msg.to_params()),
                    ]
                }
                _ => vec![self.status(&data, cause::WRONG_MESSAGE)],
            },
            mt::CONNECT_ACK => match data.state {
                ConnectReq => {
                    data.state = Active;
                    data.t313_connect.stop();
                    vec![Q931Action::Event(CallEvent::Answer, msg.to_params())]
                }
                Active => Vec::new(),
                _ => vec![self.status(&data, cause::WRONG_MESSAGE)],
            },
            mt::INFO => match data.state {
                OverlapRecv | OverlapSend => {
                    if let Some(called) = msg.called() {
                        data.called.push_str(&called);
                    }
                    data.t302_overlap.start(Instant::now());
                    let mut params = msg.to_params();
                    params.insert("called".to_string(), data.called.clone());
                    vec![Q931Action::Event(CallEvent::Info, params)]
                }
                _ => vec![Q931Action::Event(CallEvent::Info, msg.to_params())],
            },
            mt::DISCONNECT => {
                data.state = DisconnectIndication;
                data.cause = msg.cause();
                data.t305_disconnect.stop();
                // Answer with RELEASE and wait for the completion
                data.state = ReleaseReq;
                data.t308_release.start(Instant::now());
                vec![
                    Q931Action::Send(self.msg(mt::RELEASE)),
                    Q931Action::Event(CallEvent::Release, msg.to_params()),
                ]
            }
            mt::RELEASE => {
                data.cause = data.cause.or_else(|| msg.cause());
                let value = data.cause.unwrap_or(cause::NORMAL_CLEARING);
                data.state = Q931State::Null;
                let mut params = msg.to_params();
                params.entry("cause".to_string()).or_insert_with(|| value.to_string());
                vec![
                    Q931Action::Send(self.msg(mt::RELEASE_COMPLETE)),
                    Q931Action::Event(CallEvent::Release, params),
                    Q931Action::Finished,
                ]
            }
            mt::RELEASE_COMPLETE => {
                data.state = Q931State::Null;
                data.cause = data.cause.or_else(|| msg.cause());
                vec![Q931Action::Event(CallEvent::Release, msg.to_params()), Q931Action::Finished]
            }
            mt::SUSPEND => match data.state {
                Active => {
                    vec![
                        Q931Action::Send(self.msg(mt::SUSPEND_ACK)),
                        Q931Action::Event(CallEvent::Suspend, msg.to_params()),
                    ]
                }
                _ => {
                    let mut reject = self.msg(mt::SUSPEND_REJECT);
                    reject.set_cause(cause::WRONG_MESSAGE);
                    vec![Q931Action::Send(reject)]
                }
            },
            mt::RESUME => match data.state {
                Active => vec![
                    Q931Action::Send(self.msg(mt::RESUME_ACK)),
                    Q931Action::Event(CallEvent::Resume, msg.to_params()),
                ],
                _ => {
                    let mut reject = self.msg(mt::RESUME_REJECT);
                    reject.set_cause(cause::WRONG_MESSAGE);
                    vec![Q931Action::Send(reject)]
                }
            },
            mt::STATUS_ENQUIRY => {
                vec![self.status(&data, cause::NORMAL_UNSPECIFIED)]
            }
            mt::STATUS => {
                debug!(callref = self.call_ref, "status received");
                Vec::new()
            }
            mt::NOTIFY | mt::USER_INFO => {
                vec![Q931Action::Event(CallEvent::Message, msg.to_params())]
            }
            _ => vec![self.status(&data, cause::MESSAGE_TYPE_NONEXISTENT)],
        }
    }

    fn tick(&self, now: Instant) -> Vec<Q931Action> {
        let mut data = self.data.lock().unwrap();
        let mut actions = Vec::new();
        if data.t303_setup.fired(now) {
            data.t303_setup.stop();
            if data.state == Q931State::CallInitiated {
                if data.setup_retries.inc() {
                    // One SETUP retransmission before giving up
                    data.t303_setup.start(now);
                    let mut setup = self.msg(mt::SETUP);
                    setup.set_called(&data.called, 1);
                    setup.set_channel(self.channel);
                    actions.push(Q931Action::Send(setup));
                } else {
                    actions.extend(self.release_complete(&mut data, cause::NO_USER_RESPONSE));
                }
            }
        }
        if data.t302_overlap.fired(now) {
            data.t302_overlap.stop();
            if matches!(data.state, Q931State::OverlapSend | Q931State::OverlapRecv) {
                // Overlap window closed; the number is complete
                actions.push(Q931Action::Event(CallEvent::Complete, HashMap::new()));
            }
        }
        if data.t305_disconnect.fired(now) {
            data.t305_disconnect.stop();
            if data.state == Q931State::DisconnectReq {
                data.state = Q931State::ReleaseReq;
                data.t308_release.start(now);
                let mut release = self.msg(mt::RELEASE);
                release.set_cause(data.cause.unwrap_or(cause::NORMAL_CLEARING));
                actions.push(Q931Action::Send(release));
            }
        }
        if data.t308_release.fired(now) {
            data.t308_release.stop();
            if data.state == Q931State::ReleaseReq {
                warn!(callref = self.call_ref, "release unacknowledged, aborting");
                data.state = Q931State::Null;
                let mut params = HashMap::new();
                params.insert(
                    "cause".to_string(),
                    cause::RECOVERY_ON_TIMER_EXPIRY.to_string(),
                );
                actions.push(Q931Action::Event(CallEvent::Release, params));
                actions.push(Q931Action::Finished);
            }
        }
        if data.t313_connect.fired(now) {
            data.t313_connect.stop();
            if data.state == Q931State::ConnectReq {
                actions.extend(self.release_complete(&mut data, cause::RECOVERY_ON_TIMER_EXPIRY));
            }
        }
        actions
    }
}

struct RestartState {
    t316: SigTimer,
    retries: SigCounter,
    pending_class: Option<u8>,
}

/// Q.931 call controller over one Q.921 data link
pub struct Q931CallController {
    name: String,
    cfg: RwLock<Q931Config>,
    flags: RwLock<u32>,
    link: RwLock<Option<Arc<Q921Link>>>,
    calls: DashMap<u16, Arc<Q931Call>>,
    next_call_ref: AtomicU16,
    restart: Mutex<RestartState>,
    engine: RwLock<Weak<Engine>>,
    /// Segment buffer per call reference with its T314 deadline
    segments: Mutex<HashMap<u16, (Q931Message, u8, Instant)>>,
}

impl Q931CallController {
    pub fn new(name: &str, cfg: Q931Config) -> Arc<Self> {
        let flags = switch_type_flags(&cfg.switchtype);
        Arc::new(Self {
            name: name.to_string(),
            flags: RwLock::new(flags),
            link: RwLock::new(None),
            calls: DashMap::new(),
            next_call_ref: AtomicU16::new(1),
            restart: Mutex::new(RestartState {
                t316: SigTimer::new(cfg.t316_ms),
                retries: SigCounter::new(cfg.n316),
                pending_class: None,
            }),
            engine: RwLock::new(Weak::new()),
            segments: Mutex::new(HashMap::new()),
            cfg: RwLock::new(cfg),
        })
    }

    pub fn attach_link(self: &Arc<Self>, link: Arc<Q921Link>) {
        link.set_user(Arc::downgrade(self) as Weak<dyn Q921User>);
        *self.link.write().unwrap() = Some(link);
    }

    pub fn set_engine(&self, engine: &Arc<Engine>) {
        *self.engine.write().unwrap() = Arc::downgrade(engine);
    }

    pub fn behaviour_flags(&self) -> u32 {
        *self.flags.read().unwrap()
    }

    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    pub fn find_call(&self, call_ref: u16) -> Option<Arc<Q931Call>> {
        self.calls.get(&call_ref).map(|e| e.value().clone())
    }

    fn transmit(&self, msg: &Q931Message) -> Result<(), IsdnError> {
        let link = self.link.read().unwrap().clone();
        let Some(link) = link else {
            return Err(IsdnError::NotEstablished);
        };
        link.send_data(msg.encode())
    }

    fn notify_event(&self, event: CallEvent, params: HashMap<String, String>) {
        if let Some(engine) = self.engine.read().unwrap().upgrade() {
            engine.notify(&self.name, Notification::Call { event, params });
        }
    }

    fn run_actions(&self, call_ref: u16, actions: Vec<Q931Action>) {
        for action in actions {
            match action {
                Q931Action::Send(msg) => {
                    if let Err(err) = self.transmit(&msg) {
                        debug!(ctrl = %self.name, %err, "transmit failed");
                    }
                }
                Q931Action::Event(event, params) => self.notify_event(event, params),
                Q931Action::Finished => {
                    self.calls.remove(&call_ref);
                }
            }
        }
    }

    fn next_ref(&self) -> u16 {
        loop {
            let r = self.next_call_ref.fetch_add(1, Ordering::Relaxed) & 0x7FFF;
            if r != 0 && !self.calls.contains_key(&r) {
                return r;
            }
        }
    }

    /// Place an outgoing call
    pub fn call(&self, called: &str, calling: &str, channel: u8) -> Result<Arc<Q931Call>, IsdnError> {
        let cfg = self.cfg.read().unwrap().clone();
        let flags = self.behaviour_flags();
        let call_ref = self.next_ref();
        let call = Q931Call::new(call_ref, true, channel, &cfg);
        let mut setup = Q931Message::new(mt::SETUP, call_ref, true);
        setup.add_ie(ie::BEARER_CAPS, bearer_caps(flags));
        setup.set_channel(channel);
        if flags & switch_flags::KEYPAD_DIAL != 0 {
            setup.add_ie(ie::KEYPAD, called.as_bytes().to_vec());
        } else {
            setup.set_called(called, 1);
        }
        if !calling.is_empty() {
            setup.set_calling(calling, 1, 0);
        }
        if flags & switch_flags::SEND_SENDING_COMPLETE != 0 {
            setup.add_ie(ie::SENDING_COMPLETE, Bytes::new());
        }
        self.transmit(&setup)?;
        {
            let mut data = call.data.lock().unwrap();
            data.state = Q931State::CallInitiated;
            data.called = called.to_string();
            data.t303_setup.start(Instant::now());
        }
        self.calls.insert(call_ref, call.clone());
        info!(ctrl = %self.name, call_ref, called, "outgoing call started");
        Ok(call)
    }

    /// Accept an incoming call with ALERTING
    pub fn ringing(&self, call: &Arc<Q931Call>) -> Result<(), IsdnError> {
        let mut data = call.data.lock().unwrap();
        if !matches!(data.state, Q931State::CallPresent | Q931State::IncomingProceeding) {
            return Err(IsdnError::UnexpectedMessage(mt::ALERTING, data.state.name()));
        }
        data.state = Q931State::CallReceived;
        drop(data);
        let mut alerting = Q931Message::new(mt::ALERTING, call.call_ref, call.originator);
        alerting.set_channel(call.channel);
        self.transmit(&alerting)
    }

    /// Answer an incoming call
    pub fn answer(&self, call: &Arc<Q931Call>) -> Result<(), IsdnError> {
        let flags = self.behaviour_flags();
        let mut data = call.data.lock().unwrap();
        if !matches!(
            data.state,
            Q931State::CallPresent | Q931State::CallReceived | Q931State::IncomingProceeding
        ) {
            return Err(IsdnError::UnexpectedMessage(mt::CONNECT, data.state.name()));
        }
        if flags & switch_flags::CPE_CONNECT_ACTIVE != 0 {
            data.state = Q931State::Active;
        } else {
            data.state = Q931State::ConnectReq;
            data.t313_connect.start(Instant::now());
        }
        drop(data);
        let connect = Q931Message::new(mt::CONNECT, call.call_ref, call.originator);
        self.transmit(&connect)
    }

    /// Clear a call
    pub fn hangup(&self, call: &Arc<Q931Call>, value: u8) -> Result<(), IsdnError> {
        let mut data = call.data.lock().unwrap();
        if data.state == Q931State::Null {
            return Ok(());
        }
        data.state = Q931State::DisconnectReq;
        data.cause = Some(value);
        data.t305_disconnect.start(Instant::now());
        drop(data);
        let mut disconnect = Q931Message::new(mt::DISCONNECT, call.call_ref, call.originator);
        disconnect.set_cause(value);
        self.transmit(&disconnect)
    }

    /// Send display text on a live call; the charset octet depends on
    /// the switch behaviour flags
    pub fn send_display(&self, call: &Arc<Q931Call>, text: &str) -> Result<(), IsdnError> {
        let mut info = Q931Message::new(mt::INFO, call.call_ref, call.originator);
        let mut data = Vec::with_capacity(text.len() + 1);
        if self.behaviour_flags() & switch_flags::DISPLAY_CHARSET != 0 {
            data.push(0xB1);
        }
        data.extend_from_slice(text.as_bytes());
        info.add_ie(ie::DISPLAY, data);
        self.transmit(&info)
    }

    /// Restart one channel class, guarded by T316 and its counter
    pub fn restart(&self, class: u8) -> Result<(), IsdnError> {
        {
            let mut restart = self.restart.lock().unwrap();
            restart.pending_class = Some(class);
            restart.retries.reset();
            restart.t316.start(Instant::now());
        }
        let mut msg = Q931Message::new(mt::RESTART, 0, true);
        msg.set_restart_class(class);
        self.transmit(&msg)
    }

    fn handle_global(&self, msg: &Q931Message) {
        match msg.mtype {
            mt::RESTART => {
                // Clear every call, acknowledge the restart
                let refs: Vec<u16> = self.calls.iter().map(|e| *e.key()).collect();
                for call_ref in refs {
                    self.calls.remove(&call_ref);
                }
                let mut ack = Q931Message::new(mt::RESTART_ACK, 0, msg.from_originator);
                if let Some(restart_ie) = msg.ie(ie::RESTART) {
                    ack.add_ie(ie::RESTART, restart_ie.clone());
                }
                let _ = self.transmit(&ack);
                self.notify_event(CallEvent::Reset, msg.to_params());
            }
            mt::RESTART_ACK => {
                let mut restart = self.restart.lock().unwrap();
                restart.pending_class = None;
                restart.t316.stop();
                drop(restart);
                self.notify_event(CallEvent::Reset, msg.to_params());
            }
            other => {
                debug!(ctrl = %self.name, mtype = other, "global call reference message");
            }
        }
    }

    fn incoming_setup(&self, msg: Q931Message) {
        if !msg.has_ie(ie::BEARER_CAPS) {
            // Mandatory IE missing: refuse the call outright
            let mut rc = Q931Message::new(mt::RELEASE_COMPLETE, msg.call_ref, msg.from_originator);
            rc.set_cause(cause::MANDATORY_IE_MISSING);
            let _ = self.transmit(&rc);
            return;
        }
        let cfg = self.cfg.read().unwrap().clone();
        let channel = msg.channel().unwrap_or(0);
        let call = Q931Call::new(msg.call_ref, false, channel, &cfg);
        {
            let mut data = call.data.lock().unwrap();
            data.called = msg.called().unwrap_or_default();
            data.state = if msg.has_ie(ie::SENDING_COMPLETE) || !data.called.is_empty() {
                Q931State::CallPresent
            } else {
                data.t302_overlap.start(Instant::now());
                Q931State::OverlapRecv
            };
        }
        self.calls.insert(msg.call_ref, call);
        self.notify_event(CallEvent::NewCall, msg.to_params());
    }

    fn dispatch(&self, msg: Q931Message) {
        if msg.call_ref == 0 {
            self.handle_global(&msg);
            return;
        }
        // Segmented messages accumulate until the final piece
        if msg.mtype == mt::SEGMENT {
            let allow = self.cfg.read().unwrap().allow_segmentation;
            if !allow {
                return;
            }
            self.collect_segment(msg);
            return;
        }
        match self.find_call(msg.call_ref) {
            Some(call) => {
                if msg.mtype == mt::PROGRESS {
                    // Progress description: 2 = destination not ISDN,
                    // 3 = origination not ISDN
                    let flags = self.behaviour_flags();
                    let desc = msg.ie(ie::PROGRESS).and_then(|v| v.last()).map(|b| b & 0x7F);
                    let skip = match desc {
                        Some(3) => flags & switch_flags::IGNORE_NONISDN_SOURCE != 0,
                        Some(2) => flags & switch_flags::IGNORE_NONISDN_DEST != 0,
                        _ => false,
                    };
                    if skip {
                        debug!(ctrl = %self.name, "suppressing non-ISDN progress indicator");
                        return;
                    }
                }
                let actions = call.handle_message(&msg);
                self.run_actions(msg.call_ref, actions);
            }
            None => match msg.mtype {
                mt::SETUP => self.incoming_setup(msg),
                mt::RELEASE | mt::RELEASE_COMPLETE => {
                    // Nothing to clear
                }
                other => {
                    warn!(ctrl = %self.name, call_ref = msg.call_ref, mtype = other, "message for unknown call");
                    let mut rc =
                        Q931Message::new(mt::RELEASE_COMPLETE, msg.call_ref, msg.from_originator);
                    rc.set_cause(cause::INVALID_NUMBER_FORMAT);
                    let _ = self.transmit(&rc);
                }
            },
        }
    }

    fn collect_segment(&self, msg: Q931Message) {
        let Some(seg) = msg.ie(ie::SEGMENTED).cloned() else {
            return;
        };
        let Some(&first_octet) = seg.first() else {
            return;
        };
        let first = first_octet & 0x80 != 0;
        let remaining = first_octet & 0x7F;
        let cfg = self.cfg.read().unwrap();
        let max = cfg.max_segments;
        let deadline = Instant::now() + Duration::from_millis(cfg.t314_ms);
        drop(cfg);
        let mut segments = self.segments.lock().unwrap();
        if first {
            if remaining >= max {
                return;
            }
            segments.insert(msg.call_ref, (msg, remaining, deadline));
            return;
        }
        let Some((mut head, expect, _)) = segments.remove(&msg.call_ref) else {
            return;
        };
        if remaining + 1 != expect {
            return;
        }
        for (id, data) in msg.ies() {
            if *id != ie::SEGMENTED {
                head.ies.push((*id, data.clone()));
            }
        }
        if remaining == 0 {
            // Reconstructed: the segmented type hides in the head IE
            if let Some(inner) = head.ie(ie::SEGMENTED).and_then(|v| v.get(1)).copied() {
                head.mtype = inner & 0x7F;
            }
            head.ies.retain(|(id, _)| *id != ie::SEGMENTED);
            drop(segments);
            self.dispatch(head);
        } else {
            segments.insert(msg.call_ref, (head, remaining, deadline));
        }
    }
}

impl Q921User for Q931CallController {
    fn receive_data(&self, payload: Bytes) {
        match Q931Message::decode(&payload) {
            Ok(mut msg) => {
                // The far side's originator flag is mirrored locally
                msg.from_originator = !msg.from_originator;
                self.dispatch(msg);
            }
            Err(err) => warn!(ctrl = %self.name, %err, "undecodable message"),
        }
    }

    fn data_link_status(&self, established: bool) {
        info!(ctrl = %self.name, established, "data link status");
        if !established {
            // T309 semantics collapse here: calls do not survive without
            // a data link in this profile
            let refs: Vec<u16> = self.calls.iter().map(|e| *e.key()).collect();
            for call_ref in refs {
                if let Some((_, call)) = self.calls.remove(&call_ref) {
                    let mut params = HashMap::new();
                    params.insert("cause".to_string(), cause::DESTINATION_OUT_OF_ORDER.to_string());
                    params.insert("callref".to_string(), call.call_ref().to_string());
                    self.notify_event(CallEvent::Release, params);
                }
            }
        }
    }
}

#[async_trait]
impl SigComponent for Q931CallController {
    fn name(&self) -> &str {
        &self.name
    }

    fn component_type(&self) -> &'static str {
        "q931"
    }

    async fn initialize(&self, config: &serde_json::Value) -> bool {
        match serde_json::from_value::<Q931Config>(config.clone()) {
            Ok(cfg) => {
                *self.flags.write().unwrap() = switch_type_flags(&cfg.switchtype);
                {
                    let mut restart = self.restart.lock().unwrap();
                    restart.t316.set_interval(cfg.t316_ms);
                    restart.retries.set_max(cfg.n316);
                }
                *self.cfg.write().unwrap() = cfg;
                true
            }
            Err(err) => {
                warn!(ctrl = %self.name, %err, "bad Q.931 configuration");
                false
            }
        }
    }

    async fn tick(&self, now: Instant) -> Duration {
        let calls: Vec<(u16, Arc<Q931Call>)> =
            self.calls.iter().map(|e| (*e.key(), e.value().clone())).collect();
        for (call_ref, call) in calls {
            let actions = call.tick(now);
            if !actions.is_empty() {
                self.run_actions(call_ref, actions);
            }
        }
        // Restart retransmission under T316
        let resend = {
            let mut restart = self.restart.lock().unwrap();
            if restart.t316.fired(now) {
                restart.t316.stop();
                let pending_class = restart.pending_class;
                match pending_class {
                    Some(class) if restart.retries.inc() => {
                        restart.t316.start(now);
                        Some(class)
                    }
                    Some(_) => {
                        warn!(ctrl = %self.name, "restart unacknowledged, giving up");
                        restart.pending_class = None;
                        None
                    }
                    None => None,
                }
            } else {
                None
            }
        };
        if let Some(class) = resend {
            let mut msg = Q931Message::new(mt::RESTART, 0, true);
            msg.set_restart_class(class);
            let _ = self.transmit(&msg);
        }
        // Abandon segment reassemblies past their T314 window
        self.segments.lock().unwrap().retain(|_, (_, _, deadline)| *deadline > now);
        Duration::from_millis(50)
    }

    async fn control(&self, params: &ControlMap) -> bool {
        match params.operation.as_str() {
            "restart" => {
                let class = params.get_u64("class", 7) as u8;
                self.restart(class).is_ok()
            }
            "status" => {
                info!(ctrl = %self.name, calls = self.call_count(), "q931 status");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrip() {
        let mut msg = Q931Message::new(mt::SETUP, 0x1234, true);
        msg.add_ie(ie::BEARER_CAPS, vec![0x80, 0x90, 0xA3]);
        msg.set_channel(17);
        msg.set_called("15551234", 1);
        msg.set_calling("15550000", 1, 0);
        msg.add_ie(ie::SENDING_COMPLETE, Bytes::new());
        let wire = msg.encode();
        assert_eq!(wire[0], PROTO_Q931);
        let dec = Q931Message::decode(&wire).unwrap();
        assert_eq!(dec.mtype, mt::SETUP);
        assert_eq!(dec.call_ref, 0x1234);
        assert!(dec.from_originator);
        assert_eq!(dec.called().as_deref(), Some("15551234"));
        assert_eq!(dec.calling().as_deref(), Some("15550000"));
        assert_eq!(dec.channel(), Some(17));
        assert!(dec.has_ie(ie::SENDING_COMPLETE));
    }

    #[test]
    fn call_ref_flag_marks_direction() {
        let msg = Q931Message::new(mt::CONNECT, 9, false);
        let wire = msg.encode();
        assert_eq!(wire[2] & 0x80, 0x80);
        let dec = Q931Message::decode(&wire).unwrap();
        assert!(!dec.from_originator);
    }

    #[test]
    fn cause_roundtrip() {
        let mut msg = Q931Message::new(mt::DISCONNECT, 1, true);
        msg.set_cause(16);
        let dec = Q931Message::decode(&msg.encode()).unwrap();
        assert_eq!(dec.cause(), Some(16));
    }

    #[test]
    fn bad_protocol_discriminator_rejected() {
        assert!(Q931Message::decode(&[0x09, 2, 0, 1, 0x05]).is_err());
    }

    #[test]
    fn switch_flags_differ_by_type() {
        assert!(switch_type_flags("euro-isdn-e1") & switch_flags::SEND_SENDING_COMPLETE != 0);
        assert!(switch_type_flags("ni1") & switch_flags::KEYPAD_DIAL != 0);
        assert_eq!(switch_type_flags("qsig"), 0);
    }

    #[test]
    fn bearer_caps_honour_flags_independently() {
        use switch_flags::{SEND_LAYER1_CAPS, SIMPLE_BEARER_CAPS};
        assert_eq!(bearer_caps(0), vec![0x80, 0x90]);
        assert_eq!(bearer_caps(SEND_LAYER1_CAPS), vec![0x80, 0x90, 0xA3]);
        // The short form wins even when layer-1 inclusion is requested
        assert_eq!(bearer_caps(SEND_LAYER1_CAPS | SIMPLE_BEARER_CAPS), vec![0x80, 0x90]);
        // The 4ESS/5ESS presets stay on the two-octet form
        assert_eq!(bearer_caps(switch_type_flags("4ess")), vec![0x80, 0x90]);
    }

    #[test]
    fn outgoing_call_state_path() {
        let ctrl = Q931CallController::new("q931A", Q931Config::default());
        // No link attached: transmit fails but state machinery is testable
        assert!(ctrl.call("15551234", "15550000", 1).is_err());

        // Drive the call object directly
        let call = Q931Call::new(7, true, 1, &Q931Config::default());
        call.data.lock().unwrap().state = Q931State::CallInitiated;

        let mut proceeding = Q931Message::new(mt::PROCEEDING, 7, false);
        proceeding.set_channel(1);
        call.handle_message(&proceeding);
        assert_eq!(call.state(), Q931State::OutgoingProceeding);

        let alerting = Q931Message::new(mt::ALERTING, 7, false);
        call.handle_message(&alerting);
        assert_eq!(call.state(), Q931State::CallDelivered);

        let connect = Q931Message::new(mt::CONNECT, 7, false);
        let actions = call.handle_message(&connect);
        assert_eq!(call.state(), Q931State::Active);
        assert!(matches!(&actions[0], Q931Action::Send(m) if m.mtype == mt::CONNECT_ACK));
    }

    #[test]
    fn unexpected_message_answers_status() {
        let call = Q931Call::new(7, true, 1, &Q931Config::default());
        call.data.lock().unwrap().state = Q931State::CallInitiated;
        let ack = Q931Message::new(mt::CONNECT_ACK, 7, false);
        let actions = call.handle_message(&ack);
        match &actions[0] {
            Q931Action::Send(m) => {
                assert_eq!(m.mtype, mt::STATUS);
                assert!(m.has_ie(ie::CALL_STATE));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn release_clears_call() {
        let call = Q931Call::new(7, true, 1, &Q931Config::default());
        call.data.lock().unwrap().state = Q931State::Active;
        let mut release = Q931Message::new(mt::RELEASE, 7, false);
        release.set_cause(16);
        let actions = call.handle_message(&release);
        assert!(matches!(&actions[0], Q931Action::Send(m) if m.mtype == mt::RELEASE_COMPLETE));
        assert!(actions.iter().any(|a| matches!(a, Q931Action::Finished)));
        assert_eq!(call.cause(), Some(16));
    }
}
