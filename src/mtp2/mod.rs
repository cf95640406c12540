//! MTP2 data link (Q.703)
//!
//! A link pairs with a [`SigInterface`], runs the alignment procedure and
//! delivers ordered, acknowledged MSUs to its layer 2 user. State lives
//! behind one mutex; upward calls are made only after the lock is released,
//! on a strong snapshot of the user reference.

mod frames;

pub use frames::{Frame, LinkStatus, SeqHeader};

use crate::config::Mtp2Config;
use crate::engine::{DumpSink, Dumpable, Engine, LinkEvent, Notification, SigComponent, TICK_IDLE};
use crate::errors::LinkError;
use crate::iface::{PacketReceiver, SigInterface};
use crate::engine::SigTimer;
use crate::types::Msu;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use metrics::counter;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Upward user of a layer 2 link
pub trait Mtp2User: Send + Sync {
    /// Ordered MSU delivery
    fn receive_msu(&self, msu: Msu);

    /// Link entered or left the operational state
    fn link_status(&self, operational: bool);
}

/// Control operations an upper layer may issue on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2Op {
    Pause,
    Resume,
    Align { emergency: bool },
    Status,
}

/// Contract every layer 2 (hardware MTP2 or SIGTRAN equivalent) satisfies
pub trait L2Link: Send + Sync {
    fn transmit_msu(&self, msu: &Msu) -> Result<(), LinkError>;

    fn operational(&self) -> bool;

    fn set_user(&self, user: Weak<dyn Mtp2User>);

    fn link_control(&self, op: L2Op) -> bool;

    /// Congestion level 0-3
    fn congestion_level(&self) -> u8;
}

/// Error correction mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCorrection {
    /// Retransmit on explicit NACK (BIB flip)
    Basic,
    /// Cyclically retransmit unacknowledged units between new data
    Preventive,
    /// Pick basic or preventive from the observed acknowledgement delay
    Adaptive,
}

impl ErrorCorrection {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "preventive" | "pcr" => Self::Preventive,
            "adaptive" => Self::Adaptive,
            _ => Self::Basic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    OutOfService,
    Aligning,
    Proving,
    Operational,
}

struct LinkState {
    phase: Phase,
    local_status: LinkStatus,
    remote_status: LinkStatus,
    emergency: bool,
    had_failure: bool,
    /// Last assigned forward sequence number
    fsn_out: u8,
    fib: bool,
    /// Last accepted peer FSN, sent back as our BSN
    bsn_in: u8,
    bib: bool,
    /// Retransmission request outstanding toward the peer
    nack_sent: bool,
    remote_bsn: u8,
    remote_busy: bool,
    processor_outage: bool,
    queue: VecDeque<(u8, Bytes)>,
    mode: ErrorCorrection,
    /// Effective mode while Adaptive
    adaptive_preventive: bool,
    t_align: SigTimer,
    t_prove: SigTimer,
    t_ack: SigTimer,
    t_resend: SigTimer,
    t_fill: SigTimer,
    t_busy: SigTimer,
    oldest_sent_at: Option<Instant>,
    up_since: Option<DateTime<Utc>>,
    tx_msus: u64,
    rx_msus: u64,
    retransmits: u64,
    align_failures: u64,
}

/// What a locked state pass decided to do once the lock is gone
#[derive(Default)]
struct Actions {
    send: Vec<Frame>,
    deliver: Vec<Msu>,
    status: Option<bool>,
    events: Vec<LinkEvent>,
}

/// One Q.703 signalling link
pub struct Mtp2Link {
    name: String,
    cfg: RwLock<Mtp2Config>,
    iface: RwLock<Option<Arc<dyn SigInterface>>>,
    user: RwLock<Weak<dyn Mtp2User>>,
    engine: RwLock<Weak<Engine>>,
    dump: RwLock<Option<(Arc<dyn DumpSink>, String)>>,
    state: Mutex<LinkState>,
}

impl Mtp2Link {
    pub fn new(name: &str, cfg: Mtp2Config) -> Arc<Self> {
        let mode = ErrorCorrection::from_name(&cfg.error_correction);
        let state = LinkState {
            phase: Phase::OutOfService,
            local_status: LinkStatus::OutOfService,
            remote_status: LinkStatus::OutOfService,
            emergency: false,
            had_failure: false,
            fsn_out: 0x7F,
            fib: true,
            bsn_in: 0x7F,
            bib: true,
            nack_sent: false,
            remote_bsn: 0x7F,
            remote_busy: false,
            processor_outage: false,
            queue: VecDeque::new(),
            mode,
            adaptive_preventive: false,
            t_align: SigTimer::new(cfg.abort_ms),
            t_prove: SigTimer::new(cfg.proving_ms),
            t_ack: SigTimer::new(cfg.abort_ms),
            t_resend: SigTimer::new(cfg.resend_ms),
            t_fill: SigTimer::new(cfg.fill_interval_ms),
            t_busy: SigTimer::new(cfg.abort_ms),
            oldest_sent_at: None,
            up_since: None,
            tx_msus: 0,
            rx_msus: 0,
            retransmits: 0,
            align_failures: 0,
        };
        Arc::new(Self {
            name: name.to_string(),
            cfg: RwLock::new(cfg),
            iface: RwLock::new(None),
            user: RwLock::new(Weak::<NullUser>::new() as Weak<dyn Mtp2User>),
            engine: RwLock::new(Weak::new()),
            dump: RwLock::new(None),
            state: Mutex::new(state),
        })
    }

    /// Pair with the interface below and start receiving its packets
    pub fn attach_interface(self: &Arc<Self>, iface: Arc<dyn SigInterface>) {
        iface.set_receiver(Arc::downgrade(self) as Weak<dyn PacketReceiver>);
        *self.iface.write().unwrap() = Some(iface);
    }

    pub fn set_engine(&self, engine: &Arc<Engine>) {
        *self.engine.write().unwrap() = Arc::downgrade(engine);
    }

    /// When the link entered the operational state
    pub fn up_since(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().up_since
    }

    /// (tx MSUs, rx MSUs, retransmits, alignment failures)
    pub fn stats(&self) -> (u64, u64, u64, u64) {
        let s = self.state.lock().unwrap();
        (s.tx_msus, s.rx_msus, s.retransmits, s.align_failures)
    }

    fn header(state: &LinkState) -> SeqHeader {
        SeqHeader { bsn: state.bsn_in, bib: state.bib, fsn: state.fsn_out, fib: state.fib }
    }

    fn send_status(state: &LinkState, actions: &mut Actions, status: LinkStatus) {
        actions.send.push(Frame::Lssu(Self::header(state), status));
    }

    fn start_alignment(&self, state: &mut LinkState, actions: &mut Actions, emergency: bool) {
        let cfg = self.cfg.read().unwrap();
        state.phase = Phase::Aligning;
        state.emergency = emergency;
        state.local_status = LinkStatus::OutOfAlignment;
        state.remote_status = LinkStatus::OutOfService;
        state.fsn_out = 0x7F;
        state.fib = true;
        state.bsn_in = 0x7F;
        state.bib = true;
        state.nack_sent = false;
        state.remote_bsn = 0x7F;
        state.remote_busy = false;
        state.processor_outage = false;
        state.t_busy.stop();
        state.t_ack.stop();
        state.t_resend.stop();
        state.t_fill.stop();
        state.t_prove.stop();
        if cfg.flush_on_align {
            state.queue.clear();
            state.oldest_sent_at = None;
        }
        let now = Instant::now();
        state.t_align.set_interval(cfg.abort_ms);
        state.t_align.start(now);
        debug!(link = %self.name, emergency, "starting alignment");
        Self::send_status(state, actions, LinkStatus::OutOfAlignment);
    }

    /// Advance from O to the N/E indication and arm proving when the peer
    /// has shown an alignment status too.
    fn progress_alignment(&self, state: &mut LinkState, actions: &mut Actions) {
        let cfg = self.cfg.read().unwrap();
        if state.local_status == LinkStatus::OutOfAlignment
            && state.remote_status.aligning()
        {
            state.local_status = if state.emergency {
                LinkStatus::EmergencyAlignment
            } else {
                LinkStatus::NormalAlignment
            };
            Self::send_status(state, actions, state.local_status);
        }
        let local_ready = matches!(
            state.local_status,
            LinkStatus::NormalAlignment | LinkStatus::EmergencyAlignment
        );
        let remote_ready = matches!(
            state.remote_status,
            LinkStatus::NormalAlignment | LinkStatus::EmergencyAlignment
        );
        if local_ready && remote_ready && state.phase == Phase::Aligning {
            state.phase = Phase::Proving;
            let emergency = state.emergency
                || state.remote_status == LinkStatus::EmergencyAlignment;
            let proving = if emergency { cfg.proving_ms / 8 } else { cfg.proving_ms };
            state.t_prove.set_interval(proving.max(1));
            state.t_prove.start(Instant::now());
            debug!(link = %self.name, emergency, "proving started");
        }
    }

    fn complete_alignment(&self, state: &mut LinkState, actions: &mut Actions) {
        let cfg = self.cfg.read().unwrap();
        state.phase = Phase::Operational;
        state.t_align.stop();
        state.t_prove.stop();
        state.up_since = Some(Utc::now());
        if cfg.fill_link {
            state.t_fill.set_interval(cfg.fill_interval_ms);
            state.t_fill.start(Instant::now());
        }
        info!(link = %self.name, "link aligned and in service");
        counter!("telsig_mtp2_alignments", "link" => self.name.clone()).increment(1);
        actions.status = Some(true);
        actions.events.push(LinkEvent::LinkUp);
        // Ack the peer's view right away
        actions.send.push(Frame::Fisu(Self::header(state)));
        // Anything queued before the outage goes out again
        if !state.queue.is_empty() {
            Self::retransmit_queue(state, actions);
        }
    }

    fn fail_link(&self, state: &mut LinkState, actions: &mut Actions, event: LinkEvent) {
        let was_operational = state.phase == Phase::Operational;
        state.phase = Phase::OutOfService;
        state.local_status = LinkStatus::OutOfService;
        state.had_failure = true;
        state.up_since = None;
        state.t_align.stop();
        state.t_prove.stop();
        state.t_ack.stop();
        state.t_resend.stop();
        state.t_fill.stop();
        state.t_busy.stop();
        if event == LinkEvent::AlignError {
            state.align_failures += 1;
        }
        Self::send_status(state, actions, LinkStatus::OutOfService);
        actions.events.push(event);
        if was_operational {
            warn!(link = %self.name, event = event.name(), "link failed");
            actions.status = Some(false);
            actions.events.push(LinkEvent::LinkDown);
        }
        let auto = {
            let cfg = self.cfg.read().unwrap();
            cfg.auto_start
        };
        if auto {
            let emergency = {
                let cfg = self.cfg.read().unwrap();
                cfg.auto_emergency && state.had_failure
            };
            self.start_alignment(state, actions, emergency);
        }
    }

    fn retransmit_queue(state: &mut LinkState, actions: &mut Actions) {
        let header = Self::header(state);
        for (fsn, data) in state.queue.iter() {
            let mut h = header;
            h.fsn = *fsn;
            actions.send.push(Frame::Msu(h, data.clone()));
        }
        state.retransmits += state.queue.len() as u64;
    }

    /// Acknowledgement and retransmission-request bookkeeping shared by
    /// every received frame
    fn process_header(&self, state: &mut LinkState, actions: &mut Actions, h: &SeqHeader) {
        // Sweep the queue up to the acknowledged sequence number
        let mut progressed = false;
        while let Some((fsn, _)) = state.queue.front() {
            if (h.bsn.wrapping_sub(*fsn) & 0x7F) < 64 {
                state.queue.pop_front();
                progressed = true;
            } else {
                break;
            }
        }
        state.remote_bsn = h.bsn;
        if state.queue.is_empty() {
            state.t_ack.stop();
            state.t_resend.stop();
            if let Some(sent) = state.oldest_sent_at.take() {
                if state.mode == ErrorCorrection::Adaptive {
                    let cfg = self.cfg.read().unwrap();
                    let rtt = sent.elapsed();
                    state.adaptive_preventive = rtt > Duration::from_millis(cfg.resend_ms);
                }
            }
        } else if progressed {
            state.t_ack.start(Instant::now());
        }
        // BIB flip is an explicit retransmission request
        if h.bib != state.fib {
            state.fib = h.bib;
            if !state.queue.is_empty() {
                debug!(link = %self.name, queued = state.queue.len(), "negative ack, retransmitting");
                Self::retransmit_queue(state, actions);
            }
        }
    }

    fn receive_frame(&self, frame: Frame) {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock().unwrap();
            match frame {
                Frame::Lssu(_, status) => {
                    state.remote_status = status;
                    match status {
                        LinkStatus::OutOfService => {
                            if state.phase == Phase::Operational {
                                self.fail_link(&mut state, &mut actions, LinkEvent::LinkDown);
                            }
                        }
                        LinkStatus::ProcessorOutage => {
                            state.processor_outage = true;
                        }
                        LinkStatus::Busy => {
                            state.remote_busy = true;
                            if !state.t_busy.running() {
                                state.t_busy.start(Instant::now());
                            }
                        }
                        s if s.aligning() => match state.phase {
                            Phase::Operational => {
                                // Peer restarted; realign with it
                                self.fail_link(&mut state, &mut actions, LinkEvent::AlignError);
                            }
                            Phase::OutOfService => {
                                let cfg = self.cfg.read().unwrap();
                                let auto = cfg.auto_start;
                                let emergency = cfg.auto_emergency && state.had_failure;
                                drop(cfg);
                                if auto {
                                    self.start_alignment(&mut state, &mut actions, emergency);
                                    self.progress_alignment(&mut state, &mut actions);
                                }
                            }
                            _ => self.progress_alignment(&mut state, &mut actions),
                        },
                        _ => {}
                    }
                }
                Frame::Fisu(h) => {
                    state.remote_busy = false;
                    state.processor_outage = false;
                    state.t_busy.stop();
                    match state.phase {
                        Phase::Proving => {
                            // Peer already completed proving
                            self.complete_alignment(&mut state, &mut actions);
                            self.process_header(&mut state, &mut actions, &h);
                        }
                        Phase::Operational => {
                            self.process_header(&mut state, &mut actions, &h)
                        }
                        _ => {}
                    }
                }
                Frame::Msu(h, data) => {
                    state.remote_busy = false;
                    state.t_busy.stop();
                    if state.phase == Phase::Proving {
                        self.complete_alignment(&mut state, &mut actions);
                    }
                    if state.phase != Phase::Operational {
                        return;
                    }
                    self.process_header(&mut state, &mut actions, &h);
                    let expected = frames::next_seq(state.bsn_in);
                    if h.fsn == expected {
                        state.bsn_in = h.fsn;
                        state.nack_sent = false;
                        state.rx_msus += 1;
                        counter!("telsig_mtp2_rx_msus", "link" => self.name.clone())
                            .increment(1);
                        actions.deliver.push(Msu(data));
                        // Ack promptly so the peer's queue drains
                        actions.send.push(Frame::Fisu(Self::header(&state)));
                    } else if h.fsn == state.bsn_in {
                        // Duplicate of the last accepted unit
                        actions.send.push(Frame::Fisu(Self::header(&state)));
                    } else if !state.nack_sent {
                        // Out of sequence: request retransmission once
                        state.bib = !state.bib;
                        state.nack_sent = true;
                        actions.send.push(Frame::Fisu(Self::header(&state)));
                    }
                }
            }
        }
        self.run_actions(actions);
    }

    fn run_actions(&self, actions: Actions) {
        if !actions.send.is_empty() {
            let iface = self.iface.read().unwrap().clone();
            if let Some(iface) = iface {
                for frame in &actions.send {
                    let packet = frame.encode();
                    self.dump_packet(true, &packet);
                    if let Err(err) = iface.transmit_packet(&packet, false) {
                        debug!(link = %self.name, %err, "transmit failed");
                        break;
                    }
                }
            }
        }
        if actions.deliver.is_empty() && actions.status.is_none() && actions.events.is_empty() {
            return;
        }
        // Snapshot the user before calling out of the layer
        let user = self.user.read().unwrap().upgrade();
        if let Some(user) = &user {
            for msu in actions.deliver {
                user.receive_msu(msu);
            }
            if let Some(operational) = actions.status {
                user.link_status(operational);
            }
        }
        if let Some(engine) = self.engine.read().unwrap().upgrade() {
            for event in actions.events {
                engine.notify(&self.name, Notification::Link { event });
            }
        }
    }

    fn dump_packet(&self, sent: bool, packet: &[u8]) {
        if let Some((sink, tag)) = self.dump.read().unwrap().as_ref() {
            sink.dump(tag, sent, packet);
        }
    }
}

struct NullUser;

impl Mtp2User for NullUser {
    fn receive_msu(&self, _msu: Msu) {}

    fn link_status(&self, _operational: bool) {}
}

impl PacketReceiver for Mtp2Link {
    fn receive_packet(&self, packet: Bytes) {
        self.dump_packet(false, &packet);
        match Frame::decode(&packet) {
            Ok(frame) => self.receive_frame(frame),
            Err(err) => {
                debug!(link = %self.name, %err, "dropping malformed frame");
                let mut actions = Actions::default();
                actions.events.push(LinkEvent::CksumError);
                self.run_actions(actions);
            }
        }
    }

    fn link_event(&self, event: LinkEvent) {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock().unwrap();
            match event {
                LinkEvent::LinkUp => {
                    let (auto, emergency) = {
                        let cfg = self.cfg.read().unwrap();
                        (cfg.auto_start, cfg.auto_emergency && state.had_failure)
                    };
                    if auto && state.phase == Phase::OutOfService {
                        self.start_alignment(&mut state, &mut actions, emergency);
                    }
                }
                LinkEvent::LinkDown | LinkEvent::HwError => {
                    if state.phase != Phase::OutOfService {
                        self.fail_link(&mut state, &mut actions, event);
                    }
                }
                other => actions.events.push(other),
            }
        }
        self.run_actions(actions);
    }
}

impl L2Link for Mtp2Link {
    fn transmit_msu(&self, msu: &Msu) -> Result<(), LinkError> {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Operational {
                return Err(LinkError::NotAligned);
            }
            if state.processor_outage {
                return Err(LinkError::ProcessorOutage);
            }
            if state.remote_busy {
                return Err(LinkError::RemoteBusy);
            }
            let level = congestion_from_queue(state.queue.len());
            if level >= 3 {
                return Err(LinkError::Congestion(level));
            }
            state.fsn_out = frames::next_seq(state.fsn_out);
            let fsn_out = state.fsn_out;
            state.queue.push_back((fsn_out, msu.0.clone()));
            state.tx_msus += 1;
            counter!("telsig_mtp2_tx_msus", "link" => self.name.clone()).increment(1);
            let now = Instant::now();
            if !state.t_ack.running() {
                state.t_ack.start(now);
            }
            if state.oldest_sent_at.is_none() {
                state.oldest_sent_at = Some(now);
            }
            let preventive = state.mode == ErrorCorrection::Preventive
                || (state.mode == ErrorCorrection::Adaptive && state.adaptive_preventive);
            if preventive && !state.t_resend.running() {
                state.t_resend.start(now);
            }
            actions.send.push(Frame::Msu(Self::header(&state), msu.0.clone()));
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
                    if state.phase != Phase::OutOfService {
                        state.phase = Phase::OutOfService;
                        state.local_status = LinkStatus::OutOfService;
                        state.up_since = None;
                        state.t_align.stop();
                        state.t_prove.stop();
                        state.t_fill.stop();
                        Self::send_status(&state, &mut actions, LinkStatus::OutOfService);
                        actions.status = Some(false);
                        actions.events.push(LinkEvent::LinkDown);
                    }
                    true
                }
                L2Op::Resume => {
                    if state.phase == Phase::OutOfService {
                        let emergency = {
                            let cfg = self.cfg.read().unwrap();
                            cfg.auto_emergency && state.had_failure
                        };
                        self.start_alignment(&mut state, &mut actions, emergency);
                    }
                    true
                }
                L2Op::Align { emergency } => {
                    // Forced realignment tears down an operational link
                    if state.phase == Phase::Operational {
                        actions.status = Some(false);
                        actions.events.push(LinkEvent::LinkDown);
                    }
                    self.start_alignment(&mut state, &mut actions, emergency);
                    true
                }
                L2Op::Status => {
                    info!(
                        link = %self.name,
                        phase = ?state.phase,
                        local = state.local_status.name(),
                        remote = state.remote_status.name(),
                        queued = state.queue.len(),
                        "link status"
                    );
                    true
                }
            }
        };
        self.run_actions(actions);
        handled
    }

    fn congestion_level(&self) -> u8 {
        congestion_from_queue(self.state.lock().unwrap().queue.len())
    }
}

fn congestion_from_queue(len: usize) -> u8 {
    match len {
        0..=7 => 0,
        8..=15 => 1,
        16..=23 => 2,
        _ => 3,
    }
}

impl Dumpable for Mtp2Link {
    fn set_dump(&self, sink: Option<Arc<dyn DumpSink>>, tag: &str) {
        *self.dump.write().unwrap() = sink.map(|s| (s, tag.to_string()));
    }
}

#[async_trait]
impl SigComponent for Mtp2Link {
    fn name(&self) -> &str {
        &self.name
    }

    fn component_type(&self) -> &'static str {
        "mtp2"
    }

    async fn initialize(&self, config: &serde_json::Value) -> bool {
        match serde_json::from_value::<Mtp2Config>(config.clone()) {
            Ok(cfg) => {
                let mode = ErrorCorrection::from_name(&cfg.error_correction);
                self.state.lock().unwrap().mode = mode;
                *self.cfg.write().unwrap() = cfg;
                true
            }
            Err(err) => {
                warn!(link = %self.name, %err, "bad MTP2 configuration");
                false
            }
        }
    }

    async fn tick(&self, now: Instant) -> Duration {
        let mut actions = Actions::default();
        let sleep = {
            let mut state = self.state.lock().unwrap();
            if state.t_align.fired(now) {
                state.t_align.stop();
                self.fail_link(&mut state, &mut actions, LinkEvent::AlignError);
            }
            if state.t_prove.fired(now) {
                state.t_prove.stop();
                self.complete_alignment(&mut state, &mut actions);
            }
            if state.t_busy.fired(now) {
                // Remote stayed busy past the long-term congestion guard
                state.t_busy.stop();
                self.fail_link(&mut state, &mut actions, LinkEvent::LinkDown);
            }
            if state.t_ack.fired(now) {
                // Excessive delay of acknowledgement
                state.t_ack.stop();
                self.fail_link(&mut state, &mut actions, LinkEvent::LinkDown);
            }
            if state.t_resend.fired(now) {
                state.t_resend.start(now);
                if !state.queue.is_empty() {
                    Self::retransmit_queue(&mut state, &mut actions);
                }
            }
            if state.t_fill.fired(now) {
                state.t_fill.start(now);
                if state.phase == Phase::Operational && actions.send.is_empty() {
                    actions.send.push(Frame::Fisu(Self::header(&state)));
                }
            }
            [
                &state.t_align,
                &state.t_prove,
                &state.t_busy,
                &state.t_ack,
                &state.t_resend,
                &state.t_fill,
            ]
            .iter()
            .filter_map(|t| t.remaining(now))
            .min()
            .unwrap_or(TICK_IDLE)
        };
        self.run_actions(actions);
        sleep.max(Duration::from_millis(1))
    }

    async fn control(&self, params: &crate::engine::ControlMap) -> bool {
        match params.operation.as_str() {
            "pause" => self.link_control(L2Op::Pause),
            "resume" => self.link_control(L2Op::Resume),
            "align" => self.link_control(L2Op::Align {
                emergency: params.get_bool("emergency", false),
            }),
            "status" => self.link_control(L2Op::Status),
            _ => false,
        }
    }

    async fn destroyed(&self) {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::OutOfService {
                state.phase = Phase::OutOfService;
                Self::send_status(&state, &mut actions, LinkStatus::OutOfService);
            }
        }
        self.run_actions(actions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::LoopInterface;
    use crate::mtp3::Label;
    use crate::types::{NetworkIndicator, PcType, PointCode, Sio};
    use std::sync::Mutex as StdMutex;

    struct Collector {
        msus: StdMutex<Vec<Msu>>,
        status: StdMutex<Vec<bool>>,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self { msus: StdMutex::new(Vec::new()), status: StdMutex::new(Vec::new()) })
        }
    }

    impl Mtp2User for Collector {
        fn receive_msu(&self, msu: Msu) {
            self.msus.lock().unwrap().push(msu);
        }

        fn link_status(&self, operational: bool) {
            self.status.lock().unwrap().push(operational);
        }
    }

    fn linked_pair() -> (Arc<Mtp2Link>, Arc<Mtp2Link>, Arc<LoopInterface>, Arc<LoopInterface>) {
        let (ia, ib) = LoopInterface::pair("ifA", "ifB");
        let mut cfg = Mtp2Config::default();
        cfg.proving_ms = 10;
        cfg.auto_start = false;
        let a = Mtp2Link::new("l2A", cfg.clone());
        let b = Mtp2Link::new("l2B", cfg);
        a.attach_interface(ia.clone() as Arc<dyn SigInterface>);
        b.attach_interface(ib.clone() as Arc<dyn SigInterface>);
        (a, b, ia, ib)
    }

    fn pump_both(ia: &LoopInterface, ib: &LoopInterface) {
        for _ in 0..16 {
            let n = ia.pump() + ib.pump();
            if n == 0 {
                break;
            }
        }
    }

    async fn align_pair(
        a: &Arc<Mtp2Link>,
        b: &Arc<Mtp2Link>,
        ia: &LoopInterface,
        ib: &LoopInterface,
    ) {
        a.link_control(L2Op::Align { emergency: false });
        b.link_control(L2Op::Align { emergency: false });
        pump_both(ia, ib);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let now = Instant::now();
        a.tick(now).await;
        b.tick(now).await;
        pump_both(ia, ib);
    }

    #[tokio::test]
    async fn alignment_brings_both_sides_up() {
        let (a, b, ia, ib) = linked_pair();
        let ua = Collector::new();
        let ub = Collector::new();
        a.set_user(Arc::downgrade(&ua) as Weak<dyn Mtp2User>);
        b.set_user(Arc::downgrade(&ub) as Weak<dyn Mtp2User>);

        align_pair(&a, &b, &ia, &ib).await;
        assert!(a.operational());
        assert!(b.operational());
        // Exactly one link-up on each side
        assert_eq!(ua.status.lock().unwrap().as_slice(), &[true]);
        assert_eq!(ub.status.lock().unwrap().as_slice(), &[true]);
        assert!(a.up_since().is_some());
    }

    #[tokio::test]
    async fn emergency_indication_propagates() {
        let (a, b, ia, ib) = linked_pair();
        a.link_control(L2Op::Align { emergency: true });
        b.link_control(L2Op::Align { emergency: false });
        pump_both(&ia, &ib);
        // Emergency on either side shortens proving on both
        tokio::time::sleep(Duration::from_millis(5)).await;
        let now = Instant::now();
        a.tick(now).await;
        b.tick(now).await;
        pump_both(&ia, &ib);
        assert!(a.operational());
        assert!(b.operational());
    }

    #[tokio::test]
    async fn msu_transfer_and_ack() {
        let (a, b, ia, ib) = linked_pair();
        let ub = Collector::new();
        b.set_user(Arc::downgrade(&ub) as Weak<dyn Mtp2User>);
        align_pair(&a, &b, &ia, &ib).await;

        let label = Label::new(
            PcType::Itu,
            PointCode::new(1, 1, 1),
            PointCode::new(2, 2, 2),
            0,
        );
        let msu = Msu::new(Sio::new(5, 0, NetworkIndicator::National), &label, &[1, 2, 3]);
        a.transmit_msu(&msu).unwrap();
        pump_both(&ia, &ib);
        assert_eq!(ub.msus.lock().unwrap().len(), 1);
        assert_eq!(ub.msus.lock().unwrap()[0], msu);
        // FISU ack swept the retransmission queue
        assert_eq!(a.state.lock().unwrap().queue.len(), 0);
        let (tx, _, _, _) = a.stats();
        assert_eq!(tx, 1);
    }

    #[tokio::test]
    async fn transmit_requires_alignment() {
        let (a, _b, _ia, _ib) = linked_pair();
        let label = Label::new(
            PcType::Itu,
            PointCode::new(1, 1, 1),
            PointCode::new(2, 2, 2),
            0,
        );
        let msu = Msu::new(Sio::new(5, 0, NetworkIndicator::National), &label, &[]);
        assert!(matches!(a.transmit_msu(&msu), Err(LinkError::NotAligned)));
    }
}
