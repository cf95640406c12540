//! MTP3 network layer (Q.704)
//!
//! A network multiplexes layer 2 links into a linkset, selects one link per
//! outgoing MSU from the SLS and delivers incoming MSUs upward. The
//! [`Router`](router::Router) composes networks, keeps route state and acts
//! as a transfer point when so configured.

mod router;
mod snm;

pub use router::{Route, Router};
pub use snm::{Snm, SnmMsg};

use crate::config::Mtp3Config;
use crate::engine::{Engine, SigComponent, SigTimer, TICK_IDLE};
use crate::errors::Mtp3Error;
use crate::mtp2::{L2Link, L2Op, Mtp2User};
use crate::types::{Msu, NetworkIndicator, PcType, PointCode, Sio};
use crate::si;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Routing label: destination, origination and signalling link selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label {
    pub pc_type: PcType,
    pub dpc: PointCode,
    pub opc: PointCode,
    pub sls: u8,
}

impl Label {
    pub fn new(pc_type: PcType, dpc: PointCode, opc: PointCode, sls: u8) -> Self {
        Self { pc_type, dpc, opc, sls: sls & pc_type.sls_mask() }
    }

    /// Swap direction, keeping the SLS
    pub fn inverted(&self) -> Self {
        Self { pc_type: self.pc_type, dpc: self.opc, opc: self.dpc, sls: self.sls }
    }

    /// Append the packed label, least significant octet first
    pub fn encode(&self, buf: &mut BytesMut) {
        let bits = self.pc_type.bits();
        let value: u64 = self.dpc.pack(self.pc_type) as u64
            | ((self.opc.pack(self.pc_type) as u64) << bits)
            | (((self.sls & self.pc_type.sls_mask()) as u64) << (2 * bits));
        for i in 0..self.pc_type.label_octets() {
            buf.put_u8(((value >> (8 * i)) & 0xFF) as u8);
        }
    }

    pub fn decode(pc_type: PcType, buf: &mut Bytes) -> Option<Self> {
        let octets = pc_type.label_octets();
        if buf.remaining() < octets {
            return None;
        }
        let mut value: u64 = 0;
        for i in 0..octets {
            value |= (buf.get_u8() as u64) << (8 * i);
        }
        let bits = pc_type.bits();
        let mask = (1u64 << bits) - 1;
        Some(Self {
            pc_type,
            dpc: PointCode::unpack(pc_type, (value & mask) as u32),
            opc: PointCode::unpack(pc_type, ((value >> bits) & mask) as u32),
            sls: ((value >> (2 * bits)) as u8) & pc_type.sls_mask(),
        })
    }
}

/// Route availability as tracked by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteState {
    Unknown,
    Prohibited,
    Restricted,
    Congestion,
    Allowed,
}

impl RouteState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Prohibited => "prohibited",
            Self::Restricted => "restricted",
            Self::Congestion => "congestion",
            Self::Allowed => "allowed",
        }
    }

    /// Ordering used for the worst-case cross-network view
    fn severity(&self) -> u8 {
        match self {
            Self::Allowed => 0,
            Self::Congestion => 1,
            Self::Restricted => 2,
            Self::Unknown => 3,
            Self::Prohibited => 4,
        }
    }

    pub fn worst(a: RouteState, b: RouteState) -> RouteState {
        if a.severity() >= b.severity() {
            a
        } else {
            b
        }
    }

    pub fn usable(&self) -> bool {
        !matches!(self, Self::Prohibited | Self::Unknown)
    }
}

/// Upward user of a layer 3: a router over its networks, or a layer 4
/// protocol over the router.
pub trait Mtp3User: Send + Sync {
    /// Deliver one MSU. Return false when the message was not consumed.
    fn receive_msu(&self, sio: Sio, label: &Label, payload: Bytes) -> bool;

    /// A route changed state
    fn route_status(&self, pc_type: PcType, destination: PointCode, state: RouteState);

    /// The layer below gained or lost the ability to carry traffic
    fn attachment_status(&self, _available: bool) {}
}

/// Transmit-side contract of a layer 3 network
pub trait L3Network: Send + Sync {
    fn transmit_msu(&self, sio: Sio, label: &Label, payload: &[u8]) -> Result<(), Mtp3Error>;

    fn operational(&self) -> bool;

    fn pc_type(&self) -> PcType;

    fn local_pc(&self) -> PointCode;

    fn adjacent_pc(&self) -> PointCode;

    fn network_name(&self) -> &str;
}

/// Per-link inhibit bits; a link is selectable only when the bits masked
/// against the caller's ignore mask are zero
pub mod inhibit {
    /// Not yet validated by a signalling link test
    pub const UNCHECKED: u32 = 0x01;
    /// Management-inactivated
    pub const INACTIVE: u32 = 0x02;
    pub const LOCAL: u32 = 0x04;
    pub const REMOTE: u32 = 0x08;
}

struct LinkEntry {
    slc: u8,
    link: Arc<dyn L2Link>,
    /// Keeps the receive handle alive; the link only holds a weak reference
    _handle: Arc<LinkHandle>,
    inhibit: AtomicU32,
    test: Mutex<LinkTest>,
}

struct LinkTest {
    pattern: Vec<u8>,
    t_send: SigTimer,
    t_answer: SigTimer,
}

/// Receives from one layer 2 link on behalf of the network
struct LinkHandle {
    network: Weak<Mtp3Network>,
    slc: u8,
}

impl Mtp2User for LinkHandle {
    fn receive_msu(&self, msu: Msu) {
        if let Some(network) = self.network.upgrade() {
            network.receive_from_link(self.slc, msu);
        }
    }

    fn link_status(&self, operational: bool) {
        if let Some(network) = self.network.upgrade() {
            network.link_state_changed(self.slc, operational);
        }
    }
}

/// One linkset toward an adjacent signalling point
pub struct Mtp3Network {
    name: String,
    pc_type: PcType,
    local: PointCode,
    adjacent: PointCode,
    ni: NetworkIndicator,
    slc_shift: bool,
    check_links: bool,
    force_align: bool,
    check_t1_ms: u64,
    check_t2_ms: u64,
    links: RwLock<Vec<Arc<LinkEntry>>>,
    user: RwLock<Weak<dyn Mtp3User>>,
    engine: RwLock<Weak<Engine>>,
    /// Count of links currently able to carry traffic
    available: AtomicU8,
    test_seq: AtomicU32,
}

impl Mtp3Network {
    pub fn new(name: &str, cfg: &Mtp3Config) -> Result<Arc<Self>, Mtp3Error> {
        let pc_type = PcType::from_name(&cfg.pointcodetype)
            .ok_or_else(|| Mtp3Error::BadLabel(format!("bad pointcodetype {}", cfg.pointcodetype)))?;
        let local = PointCode::from_name(&cfg.local)
            .ok_or_else(|| Mtp3Error::BadLabel(format!("bad local pointcode {}", cfg.local)))?;
        let adjacent = PointCode::from_name(&cfg.adjacent)
            .ok_or_else(|| Mtp3Error::BadLabel(format!("bad adjacent pointcode {}", cfg.adjacent)))?;
        let ni = NetworkIndicator::from_name(&cfg.netindicator)
            .unwrap_or(NetworkIndicator::National);
        Ok(Arc::new(Self {
            name: name.to_string(),
            pc_type,
            local,
            adjacent,
            ni,
            slc_shift: cfg.slc_shift,
            check_links: cfg.check_links,
            force_align: cfg.force_align,
            check_t1_ms: cfg.check_t1_ms,
            check_t2_ms: cfg.check_t2_ms,
            links: RwLock::new(Vec::new()),
            user: RwLock::new(Weak::<router::Router>::new() as Weak<dyn Mtp3User>),
            engine: RwLock::new(Weak::new()),
            available: AtomicU8::new(0),
            test_seq: AtomicU32::new(0x5000),
        }))
    }

    pub fn network_indicator(&self) -> NetworkIndicator {
        self.ni
    }

    pub fn set_user(&self, user: Weak<dyn Mtp3User>) {
        *self.user.write().unwrap() = user;
    }

    pub fn set_engine(&self, engine: &Arc<Engine>) {
        *self.engine.write().unwrap() = Arc::downgrade(engine);
    }

    /// Attach a layer 2 link under a signalling link code
    pub fn attach_link(self: &Arc<Self>, link: Arc<dyn L2Link>, slc: u8) {
        let handle = Arc::new(LinkHandle { network: Arc::downgrade(self), slc });
        link.set_user(Arc::downgrade(&handle) as Weak<dyn Mtp2User>);
        let inhibit = if self.check_links { inhibit::UNCHECKED } else { 0 };
        let entry = Arc::new(LinkEntry {
            slc,
            link,
            _handle: handle,
            inhibit: AtomicU32::new(inhibit),
            test: Mutex::new(LinkTest {
                pattern: Vec::new(),
                t_send: SigTimer::new(self.check_t1_ms),
                t_answer: SigTimer::new(self.check_t2_ms),
            }),
        });
        self.links.write().unwrap().push(entry);
    }

    /// Set or clear management inhibit bits on one link
    pub fn inhibit_link(&self, slc: u8, set: u32, clear: u32) -> bool {
        let links = self.links.read().unwrap();
        let Some(entry) = links.iter().find(|e| e.slc == slc) else {
            return false;
        };
        let mut cur = entry.inhibit.load(Ordering::Acquire);
        loop {
            let next = (cur | set) & !clear;
            match entry.inhibit.compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(v) => cur = v,
            }
        }
        self.recount_available();
        true
    }

    pub fn link_inhibit(&self, slc: u8) -> Option<u32> {
        self.links
            .read()
            .unwrap()
            .iter()
            .find(|e| e.slc == slc)
            .map(|e| e.inhibit.load(Ordering::Acquire))
    }

    fn selectable(entry: &LinkEntry, ignore: u32) -> bool {
        entry.link.operational() && entry.inhibit.load(Ordering::Acquire) & !ignore == 0
    }

    fn recount_available(&self) {
        let links = self.links.read().unwrap();
        let count = links.iter().filter(|e| Self::selectable(e, 0)).count() as u8;
        let before = self.available.swap(count, Ordering::AcqRel);
        drop(links);
        if (before == 0) != (count == 0) {
            let user = self.user.read().unwrap().upgrade();
            if let Some(user) = user {
                user.attachment_status(count > 0);
            }
        }
    }

    fn link_state_changed(self: &Arc<Self>, slc: u8, operational: bool) {
        debug!(network = %self.name, slc, operational, "link state changed");
        if operational && self.check_links {
            self.start_link_test(slc);
        } else if operational {
            self.inhibit_link(slc, 0, inhibit::UNCHECKED);
        }
        if !operational && self.check_links {
            // Next resume revalidates the link
            self.inhibit_link(slc, inhibit::UNCHECKED, 0);
        }
        self.recount_available();
    }

    fn start_link_test(&self, slc: u8) {
        let links = self.links.read().unwrap();
        let Some(entry) = links.iter().find(|e| e.slc == slc) else {
            return;
        };
        let seq = self.test_seq.fetch_add(1, Ordering::Relaxed);
        let pattern = vec![
            (seq >> 8) as u8,
            seq as u8,
            slc,
            0x5A,
        ];
        {
            let mut test = entry.test.lock().unwrap();
            test.pattern = pattern.clone();
            let now = Instant::now();
            test.t_send.start(now);
            test.t_answer.start(now);
        }
        let label = Label::new(self.pc_type, self.adjacent, self.local, slc);
        let mut payload = BytesMut::with_capacity(2 + pattern.len());
        payload.put_u8(0x11); // SLTM
        payload.put_u8((pattern.len() as u8) << 4);
        payload.put_slice(&pattern);
        let sio = Sio::new(si::MTN, 0, self.ni);
        let _ = self.transmit_on(entry, sio, &label, &payload);
    }

    fn transmit_on(&self, entry: &LinkEntry, sio: Sio, label: &Label, payload: &[u8]) -> Result<(), Mtp3Error> {
        let mut buf = BytesMut::with_capacity(1 + label.pc_type.label_octets() + payload.len());
        buf.put_u8(sio.0);
        label.encode(&mut buf);
        buf.put_slice(payload);
        entry.link.transmit_msu(&Msu(buf.freeze())).map_err(Mtp3Error::from)
    }

    fn receive_from_link(self: &Arc<Self>, slc: u8, msu: Msu) {
        let Some((sio, label, payload)) = msu.split(self.pc_type) else {
            warn!(network = %self.name, slc, "dropping MSU with bad label");
            return;
        };
        match sio.service() {
            si::MTN | si::MTNS => self.handle_maintenance(slc, sio, &label, payload),
            _ => {
                let user = self.user.read().unwrap().upgrade();
                match user {
                    Some(user) => {
                        if !user.receive_msu(sio, &label, payload) {
                            debug!(
                                network = %self.name,
                                service = sio.service(),
                                "MSU not consumed by user"
                            );
                        }
                    }
                    None => debug!(network = %self.name, "MSU received with no user attached"),
                }
            }
        }
    }

    fn handle_maintenance(&self, slc: u8, sio: Sio, label: &Label, mut payload: Bytes) {
        if payload.remaining() < 2 {
            return;
        }
        let heading = payload.get_u8();
        let len = (payload.get_u8() >> 4) as usize;
        if payload.remaining() < len {
            return;
        }
        let pattern = payload.copy_to_bytes(len);
        let links = self.links.read().unwrap();
        let Some(entry) = links.iter().find(|e| e.slc == slc) else {
            return;
        };
        match heading {
            0x11 => {
                // SLTM: answer with the same pattern
                let mut reply = BytesMut::with_capacity(2 + pattern.len());
                reply.put_u8(0x21); // SLTA
                reply.put_u8((pattern.len() as u8) << 4);
                reply.put_slice(&pattern);
                let _ = self.transmit_on(entry, sio, &label.inverted(), &reply);
            }
            0x21 => {
                // SLTA: pattern must match the outstanding test
                let ok = {
                    let mut test = entry.test.lock().unwrap();
                    let ok = test.pattern.as_slice() == pattern.as_ref();
                    if ok {
                        test.t_answer.stop();
                    }
                    ok
                };
                drop(links);
                if ok {
                    debug!(network = %self.name, slc, "link test passed");
                    self.inhibit_link(slc, 0, inhibit::UNCHECKED);
                } else {
                    warn!(network = %self.name, slc, "link test answer mismatch");
                }
            }
            _ => {}
        }
    }

    /// Pick the link for an SLS among selectable ones
    fn select_link(&self, sls: u8, ignore: u32) -> Option<Arc<LinkEntry>> {
        let links = self.links.read().unwrap();
        let selectable: Vec<&Arc<LinkEntry>> =
            links.iter().filter(|e| Self::selectable(e, ignore)).collect();
        if selectable.is_empty() {
            return None;
        }
        let sls = if self.slc_shift { sls >> 1 } else { sls };
        Some(selectable[sls as usize % selectable.len()].clone())
    }
}

impl L3Network for Mtp3Network {
    fn transmit_msu(&self, sio: Sio, label: &Label, payload: &[u8]) -> Result<(), Mtp3Error> {
        let entry = self.select_link(label.sls, 0).ok_or(Mtp3Error::NoLink)?;
        self.transmit_on(&entry, sio, label, payload)
    }

    fn operational(&self) -> bool {
        self.available.load(Ordering::Acquire) > 0
    }

    fn pc_type(&self) -> PcType {
        self.pc_type
    }

    fn local_pc(&self) -> PointCode {
        self.local
    }

    fn adjacent_pc(&self) -> PointCode {
        self.adjacent
    }

    fn network_name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl SigComponent for Mtp3Network {
    fn name(&self) -> &str {
        &self.name
    }

    fn component_type(&self) -> &'static str {
        "mtp3"
    }

    async fn tick(&self, now: Instant) -> Duration {
        // Collect due work without holding the list lock across transmits
        let mut resend: Vec<u8> = Vec::new();
        let mut expired: Vec<u8> = Vec::new();
        {
            let links = self.links.read().unwrap();
            for entry in links.iter() {
                let mut test = entry.test.lock().unwrap();
                if test.t_answer.fired(now) {
                    test.t_answer.stop();
                    expired.push(entry.slc);
                }
                if test.t_send.fired(now) && entry.link.operational() {
                    test.t_send.start(now);
                    resend.push(entry.slc);
                }
            }
        }
        for slc in expired {
            warn!(network = %self.name, slc, "link test unanswered");
            self.inhibit_link(slc, inhibit::UNCHECKED, 0);
            if self.force_align {
                let links = self.links.read().unwrap();
                if let Some(entry) = links.iter().find(|e| e.slc == slc) {
                    entry.link.link_control(L2Op::Align { emergency: false });
                }
            }
        }
        if self.check_links {
            for slc in resend {
                self.start_link_test(slc);
            }
        }
        self.recount_available();
        TICK_IDLE
    }

    async fn control(&self, params: &crate::engine::ControlMap) -> bool {
        match params.operation.as_str() {
            "pause" => {
                let links = self.links.read().unwrap();
                for entry in links.iter() {
                    entry.link.link_control(L2Op::Pause);
                }
                true
            }
            "resume" => {
                let links = self.links.read().unwrap();
                for entry in links.iter() {
                    entry.link.link_control(L2Op::Resume);
                }
                true
            }
            "restart" => {
                let links = self.links.read().unwrap();
                for entry in links.iter() {
                    entry.link.link_control(L2Op::Align { emergency: false });
                }
                true
            }
            "status" => {
                info!(
                    network = %self.name,
                    links = self.links.read().unwrap().len(),
                    available = self.available.load(Ordering::Acquire),
                    "linkset status"
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

    #[test]
    fn label_roundtrip_itu() {
        let label = Label::new(PcType::Itu, PointCode::new(2, 140, 1), PointCode::new(1, 30, 4), 9);
        let mut buf = BytesMut::new();
        label.encode(&mut buf);
        assert_eq!(buf.len(), 4);
        let mut bytes = buf.freeze();
        let decoded = Label::decode(PcType::Itu, &mut bytes).unwrap();
        assert_eq!(decoded, label);
        assert!(bytes.is_empty());
    }

    #[test]
    fn label_roundtrip_ansi_and_japan() {
        let label =
            Label::new(PcType::Ansi, PointCode::new(240, 10, 17), PointCode::new(1, 2, 3), 21);
        let mut buf = BytesMut::new();
        label.encode(&mut buf);
        assert_eq!(buf.len(), 7);
        let decoded = Label::decode(PcType::Ansi, &mut buf.freeze()).unwrap();
        assert_eq!(decoded, label);

        let label = Label::new(PcType::Japan, PointCode::new(90, 9, 20), PointCode::new(1, 0, 1), 3);
        let mut buf = BytesMut::new();
        label.encode(&mut buf);
        assert_eq!(buf.len(), 5);
        let decoded = Label::decode(PcType::Japan, &mut buf.freeze()).unwrap();
        assert_eq!(decoded, label);
    }

    #[test]
    fn label_invert_swaps_direction() {
        let label = Label::new(PcType::Itu, PointCode::new(1, 1, 1), PointCode::new(2, 2, 2), 5);
        let inv = label.inverted();
        assert_eq!(inv.dpc, label.opc);
        assert_eq!(inv.opc, label.dpc);
        assert_eq!(inv.sls, label.sls);
    }

    #[test]
    fn route_state_worst_case() {
        use RouteState::*;
        assert_eq!(RouteState::worst(Allowed, Restricted), Restricted);
        assert_eq!(RouteState::worst(Prohibited, Congestion), Prohibited);
        assert_eq!(RouteState::worst(Allowed, Allowed), Allowed);
        assert!(Restricted.usable());
        assert!(!Prohibited.usable());
    }

    #[test]
    fn short_label_rejected() {
        let mut buf = Bytes::from_static(&[1, 2, 3]);
        assert!(Label::decode(PcType::Itu, &mut buf).is_none());
    }
}
