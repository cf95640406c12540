//! Message router and signalling transfer point
//!
//! The router composes one or more MTP3 networks, keeps an outgoing route
//! table per point code dialect and dispatches incoming MSUs to layer 4
//! users by service indicator. With transfer enabled it forwards between
//! networks and advertises route state changes to its neighbours.

use super::snm::{upu_for, Snm, SnmMsg};
use super::{L3Network, Label, Mtp3Network, Mtp3User, RouteState};
use crate::config::RouterConfig;
use crate::engine::{ControlMap, Engine, Notification, SigComponent, SigTimer, TICK_IDLE};
use crate::errors::Mtp3Error;
use crate::types::{PcType, PointCode, Sio};
use crate::si;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One destination in the outgoing route table
pub struct Route {
    pub dest: PointCode,
    pub pc_type: PcType,
    pub priority: u32,
    /// Right-shift applied to the SLS before link selection
    pub shift: u8,
    /// Largest payload this route carries
    pub max_data: usize,
    pub state: RouteState,
    /// Candidate networks able to reach the destination, best first
    networks: Vec<Weak<Mtp3Network>>,
    /// Messages held while controlled rerouting is in progress
    buffered: VecDeque<(Sio, Label, Bytes)>,
    /// Congestion events seen in the current sample window
    congestion_events: u32,
}

impl Route {
    fn new(pc_type: PcType, dest: PointCode, priority: u32, shift: u8, max_data: usize) -> Self {
        Self {
            dest,
            pc_type,
            priority,
            shift,
            max_data,
            state: RouteState::Unknown,
            networks: Vec::new(),
            buffered: VecDeque::new(),
            congestion_events: 0,
        }
    }

    fn first_operational(&self) -> Option<Arc<Mtp3Network>> {
        self.networks.iter().filter_map(Weak::upgrade).find(|n| n.operational())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestartPhase {
    Idle,
    Restarting,
    Started,
}

struct RouterTimers {
    /// T20 restart completion guard
    t_restart: SigTimer,
    /// T1 isolation guard
    t_isolate: SigTimer,
    t_route_test: SigTimer,
    t_traffic: SigTimer,
    phase: RestartPhase,
}

struct UserEntry {
    service: u8,
    user: Weak<dyn Mtp3User>,
}

/// Layer 3 message router, optionally a transfer point
pub struct Router {
    name: String,
    cfg: RwLock<RouterConfig>,
    networks: RwLock<Vec<Arc<Mtp3Network>>>,
    users: RwLock<Vec<UserEntry>>,
    routes: Mutex<HashMap<(PcType, u32), Route>>,
    timers: Mutex<RouterTimers>,
    snm: RwLock<Option<Arc<Snm>>>,
    engine: RwLock<Weak<Engine>>,
}

impl Router {
    pub fn new(name: &str, cfg: RouterConfig) -> Arc<Self> {
        let router = Arc::new(Self {
            name: name.to_string(),
            timers: Mutex::new(RouterTimers {
                t_restart: SigTimer::new(cfg.restart_ms),
                t_isolate: SigTimer::new(cfg.isolate_ms),
                t_route_test: SigTimer::new(cfg.route_test_ms),
                t_traffic: SigTimer::new(cfg.traffic_ok_ms),
                phase: RestartPhase::Idle,
            }),
            cfg: RwLock::new(cfg),
            networks: RwLock::new(Vec::new()),
            users: RwLock::new(Vec::new()),
            routes: Mutex::new(HashMap::new()),
            snm: RwLock::new(None),
            engine: RwLock::new(Weak::new()),
        });
        let snm = Arc::new(Snm::new(Arc::downgrade(&router)));
        *router.snm.write().unwrap() = Some(snm);
        router
    }

    pub fn set_engine(&self, engine: &Arc<Engine>) {
        *self.engine.write().unwrap() = Arc::downgrade(engine);
    }

    /// Attach a network below this router and route to its adjacent point
    pub fn attach_network(self: &Arc<Self>, network: Arc<Mtp3Network>) {
        network.set_user(Arc::downgrade(self) as Weak<dyn Mtp3User>);
        let pc_type = network.pc_type();
        let adjacent = network.adjacent_pc();
        self.add_route(pc_type, adjacent, 0, 0, 272, &network);
        self.networks.write().unwrap().push(network);
    }

    /// Attach a layer 4 user for one service indicator
    pub fn attach_user(&self, service: u8, user: &Arc<dyn Mtp3User>) {
        let mut users = self.users.write().unwrap();
        users.retain(|e| e.service != service);
        users.push(UserEntry { service, user: Arc::downgrade(user) });
    }

    /// Create or extend a route toward `dest` through `network`
    pub fn add_route(
        &self,
        pc_type: PcType,
        dest: PointCode,
        priority: u32,
        shift: u8,
        max_data: usize,
        network: &Arc<Mtp3Network>,
    ) {
        let mut routes = self.routes.lock().unwrap();
        let route = routes
            .entry((pc_type, dest.pack(pc_type)))
            .or_insert_with(|| Route::new(pc_type, dest, priority, shift, max_data));
        if !route.networks.iter().any(|w| w.as_ptr() == Arc::as_ptr(network)) {
            route.networks.push(Arc::downgrade(network));
        }
    }

    pub fn route_state(&self, pc_type: PcType, dest: PointCode) -> Option<RouteState> {
        self.routes.lock().unwrap().get(&(pc_type, dest.pack(pc_type))).map(|r| r.state)
    }

    fn network_for(&self, pc_type: PcType) -> Option<Arc<Mtp3Network>> {
        self.networks
            .read()
            .unwrap()
            .iter()
            .find(|n| n.pc_type() == pc_type && n.operational())
            .cloned()
    }

    fn local_pc(&self, pc_type: PcType) -> Option<PointCode> {
        self.networks
            .read()
            .unwrap()
            .iter()
            .find(|n| n.pc_type() == pc_type)
            .map(|n| n.local_pc())
    }

    /// Transmit one MSU on behalf of a layer 4 user
    pub fn transmit_msu(&self, sio: Sio, label: &Label, payload: &[u8]) -> Result<(), Mtp3Error> {
        let packed = label.dpc.pack(label.pc_type);
        let mut routes = self.routes.lock().unwrap();
        if let Some(route) = routes.get_mut(&(label.pc_type, packed)) {
            if payload.len() + 1 + label.pc_type.label_octets() > route.max_data {
                return Err(Mtp3Error::Oversize(payload.len()));
            }
            match route.state {
                RouteState::Prohibited => return Err(Mtp3Error::RouteProhibited(packed)),
                RouteState::Congestion if route.buffered.len() < 64 => {
                    // Hold while controlled rerouting settles
                    route.buffered.push_back((
                        sio,
                        *label,
                        Bytes::copy_from_slice(payload),
                    ));
                    route.congestion_events += 1;
                    return Ok(());
                }
                _ => {}
            }
            let network = route.first_operational().ok_or(Mtp3Error::NoRoute(packed))?;
            let mut out = *label;
            out.sls >>= route.shift;
            drop(routes);
            return network.transmit_msu(sio, &out, payload);
        }
        drop(routes);
        // Default route: any operational network of the dialect
        let network = self.network_for(label.pc_type).ok_or(Mtp3Error::NoRoute(packed))?;
        network.transmit_msu(sio, label, payload)
    }

    /// Send a management message toward the label's destination
    pub(crate) fn send_snm(&self, msg: SnmMsg, label: &Label) {
        let payload = msg.encode(label.pc_type);
        let network = match self.network_for(label.pc_type) {
            Some(n) => n,
            None => return,
        };
        let sio = Sio::new(si::SNM, 3, network.network_indicator());
        if let Err(err) = network.transmit_msu(sio, label, &payload) {
            debug!(router = %self.name, %err, "failed to send SNM message");
        }
    }

    /// Apply a route state learned from management traffic or local events
    pub fn apply_route_state(
        &self,
        pc_type: PcType,
        dest: PointCode,
        state: RouteState,
        origin: Option<PointCode>,
    ) {
        let flush = {
            let mut routes = self.routes.lock().unwrap();
            let route = routes
                .entry((pc_type, dest.pack(pc_type)))
                .or_insert_with(|| Route::new(pc_type, dest, 0, 0, 272));
            if route.state == state {
                return;
            }
            info!(router = %self.name, dest = %dest, state = state.name(), "route state changed");
            route.state = state;
            if state == RouteState::Allowed {
                std::mem::take(&mut route.buffered)
            } else {
                VecDeque::new()
            }
        };
        for (sio, label, payload) in flush {
            let _ = self.transmit_msu(sio, &label, &payload);
        }
        // Notify layer 4 users and the host
        let users = self.users.read().unwrap();
        let snapshot: Vec<Arc<dyn Mtp3User>> =
            users.iter().filter_map(|e| e.user.upgrade()).collect();
        drop(users);
        for user in snapshot {
            user.route_status(pc_type, dest, state);
        }
        if let Some(engine) = self.engine.read().unwrap().upgrade() {
            engine.notify(
                &self.name,
                Notification::RouteStateChanged { pc_type, destination: dest, state },
            );
        }
        // A transfer point advertises the change to its other neighbours
        let cfg = self.cfg.read().unwrap();
        if cfg.transfer && !cfg.transfer_silent {
            if state == RouteState::Prohibited && !cfg.send_prohibited {
                return;
            }
            drop(cfg);
            let msg = match state {
                RouteState::Prohibited => SnmMsg::Tfp { dest },
                RouteState::Restricted => SnmMsg::Tfr { dest },
                RouteState::Allowed => SnmMsg::Tfa { dest },
                RouteState::Congestion => SnmMsg::Tfc { dest, status: 1 },
                RouteState::Unknown => return,
            };
            let networks = self.networks.read().unwrap().clone();
            for network in networks {
                if network.pc_type() != pc_type {
                    continue;
                }
                let neighbour = network.adjacent_pc();
                if Some(neighbour) == origin || neighbour == dest {
                    continue;
                }
                let label = Label::new(pc_type, neighbour, network.local_pc(), 0);
                self.send_snm(msg, &label);
            }
        }
    }

    /// Answer an RST/RSR with the current state of the tested route
    pub(crate) fn answer_route_test(&self, dest: PointCode, from: &Label) {
        let state = self
            .route_state(from.pc_type, dest)
            .unwrap_or(RouteState::Prohibited);
        let reply = match state {
            RouteState::Allowed | RouteState::Congestion => SnmMsg::Tfa { dest },
            RouteState::Restricted => SnmMsg::Tfr { dest },
            _ => SnmMsg::Tfp { dest },
        };
        self.send_snm(reply, &from.inverted());
    }

    /// TRA from an adjacent point: its routes are usable again
    pub(crate) fn adjacent_restarted(&self, pc_type: PcType, adjacent: PointCode) {
        debug!(router = %self.name, adjacent = %adjacent, "traffic restart allowed");
        self.apply_route_state(pc_type, adjacent, RouteState::Allowed, Some(adjacent));
    }

    /// Peer reports one of our user parts unavailable
    pub(crate) fn user_part_unavailable(
        &self,
        pc_type: PcType,
        dest: PointCode,
        part: u8,
        cause: u8,
    ) {
        warn!(router = %self.name, dest = %dest, part, cause, "user part unavailable");
        let users = self.users.read().unwrap();
        let snapshot: Vec<Arc<dyn Mtp3User>> = users
            .iter()
            .filter(|e| e.service == part)
            .filter_map(|e| e.user.upgrade())
            .collect();
        drop(users);
        for user in snapshot {
            user.route_status(pc_type, dest, RouteState::Prohibited);
        }
    }

    /// Inhibit bits addressed by the SLC carried in a management label
    pub(crate) fn inhibit_by_slc(&self, label: &Label, set: u32, clear: u32) {
        let networks = self.networks.read().unwrap();
        for network in networks.iter() {
            if network.pc_type() == label.pc_type && network.adjacent_pc() == label.opc {
                network.inhibit_link(label.sls, set, clear);
                return;
            }
        }
    }

    pub(crate) fn slc_inhibited(&self, label: &Label, mask: u32) -> bool {
        let networks = self.networks.read().unwrap();
        networks
            .iter()
            .filter(|n| n.pc_type() == label.pc_type && n.adjacent_pc() == label.opc)
            .filter_map(|n| n.link_inhibit(label.sls))
            .any(|bits| bits & mask != 0)
    }

    fn complete_restart(&self) {
        let networks = self.networks.read().unwrap().clone();
        info!(router = %self.name, "restart complete, sending TRA");
        for network in networks {
            let label = Label::new(
                network.pc_type(),
                network.adjacent_pc(),
                network.local_pc(),
                0,
            );
            self.send_snm(SnmMsg::Tra, &label);
            self.apply_route_state(
                network.pc_type(),
                network.adjacent_pc(),
                RouteState::Allowed,
                None,
            );
        }
    }

    fn isolated(&self) {
        warn!(router = %self.name, "signalling point isolated");
        let entries: Vec<(PcType, PointCode)> = {
            let routes = self.routes.lock().unwrap();
            routes.values().map(|r| (r.pc_type, r.dest)).collect()
        };
        for (pc_type, dest) in entries {
            self.apply_route_state(pc_type, dest, RouteState::Prohibited, None);
        }
    }
}

impl Mtp3User for Router {
    fn receive_msu(&self, sio: Sio, label: &Label, payload: Bytes) -> bool {
        // Management traffic is consumed by the router's own handler
        if sio.service() == si::SNM {
            let snm = self.snm.read().unwrap().clone();
            if let Some(snm) = snm {
                return snm.receive_msu(sio, label, payload);
            }
            return false;
        }
        let local = self.local_pc(label.pc_type);
        if local == Some(label.dpc) {
            let users = self.users.read().unwrap();
            let target: Option<Arc<dyn Mtp3User>> = users
                .iter()
                .find(|e| e.service == sio.service())
                .and_then(|e| e.user.upgrade());
            drop(users);
            if let Some(user) = target {
                if user.receive_msu(sio, label, payload) {
                    return true;
                }
            }
            // No user part for this service indicator
            let cfg = self.cfg.read().unwrap();
            if cfg.send_unavailable {
                drop(cfg);
                debug!(router = %self.name, service = sio.service(), "user part unavailable");
                self.send_snm(upu_for(label.dpc, sio.service()), &label.inverted());
            }
            return false;
        }
        // Not addressed to us: forward when acting as a transfer point
        let cfg = self.cfg.read().unwrap();
        let transfer = cfg.transfer;
        let send_prohibited = cfg.send_prohibited;
        drop(cfg);
        if transfer {
            match self.transmit_msu(sio, label, &payload) {
                Ok(()) => return true,
                Err(err) => {
                    debug!(router = %self.name, %err, dest = %label.dpc, "transfer failed");
                    if send_prohibited {
                        self.send_snm(SnmMsg::Tfp { dest: label.dpc }, &label.inverted());
                    }
                    return false;
                }
            }
        }
        false
    }

    fn route_status(&self, pc_type: PcType, destination: PointCode, state: RouteState) {
        self.apply_route_state(pc_type, destination, state, None);
    }

    fn attachment_status(&self, available: bool) {
        let mut timers = self.timers.lock().unwrap();
        let now = Instant::now();
        if available {
            timers.t_isolate.stop();
            if timers.phase == RestartPhase::Idle {
                timers.phase = RestartPhase::Restarting;
                timers.t_restart.start(now);
                debug!(router = %self.name, "restart procedure started");
            }
        } else {
            let any_up = self.networks.read().unwrap().iter().any(|n| n.operational());
            if !any_up && !timers.t_isolate.running() {
                timers.t_isolate.start(now);
            }
        }
    }
}

#[async_trait]
impl SigComponent for Router {
    fn name(&self) -> &str {
        &self.name
    }

    fn component_type(&self) -> &'static str {
        "ss7-router"
    }

    async fn initialize(&self, config: &serde_json::Value) -> bool {
        match serde_json::from_value::<RouterConfig>(config.clone()) {
            Ok(cfg) => {
                let mut timers = self.timers.lock().unwrap();
                timers.t_restart.set_interval(cfg.restart_ms);
                timers.t_isolate.set_interval(cfg.isolate_ms);
                timers.t_route_test.set_interval(cfg.route_test_ms);
                timers.t_traffic.set_interval(cfg.traffic_ok_ms);
                drop(timers);
                *self.cfg.write().unwrap() = cfg;
                true
            }
            Err(err) => {
                warn!(router = %self.name, %err, "bad router configuration");
                false
            }
        }
    }

    async fn tick(&self, now: Instant) -> Duration {
        let mut finish_restart = false;
        let mut gone_isolated = false;
        let mut run_route_test = false;
        {
            let mut timers = self.timers.lock().unwrap();
            if timers.t_restart.fired(now) {
                timers.t_restart.stop();
                if timers.phase == RestartPhase::Restarting {
                    timers.phase = RestartPhase::Started;
                    finish_restart = true;
                    timers.t_route_test.start(now);
                }
            }
            if timers.t_isolate.fired(now) {
                timers.t_isolate.stop();
                gone_isolated = true;
            }
            if timers.t_route_test.fired(now) {
                timers.t_route_test.start(now);
                run_route_test = true;
            }
        }
        if finish_restart {
            self.complete_restart();
        }
        if gone_isolated {
            self.isolated();
        }
        if run_route_test {
            let test_restricted = self.cfg.read().unwrap().test_restricted;
            let targets: Vec<(PcType, PointCode)> = {
                let routes = self.routes.lock().unwrap();
                routes
                    .values()
                    .filter(|r| {
                        r.state == RouteState::Prohibited
                            || (test_restricted && r.state == RouteState::Restricted)
                    })
                    .map(|r| (r.pc_type, r.dest))
                    .collect()
            };
            for (pc_type, dest) in targets {
                if let Some(network) = self.network_for(pc_type) {
                    let label = Label::new(pc_type, network.adjacent_pc(), network.local_pc(), 0);
                    self.send_snm(SnmMsg::Rst { dest }, &label);
                }
            }
        }
        TICK_IDLE
    }

    async fn control(&self, params: &ControlMap) -> bool {
        match params.operation.as_str() {
            "pause" | "resume" | "restart" => {
                let networks = self.networks.read().unwrap().clone();
                let mut handled = false;
                for network in networks {
                    handled |= network.control(params).await;
                }
                handled
            }
            "status" => {
                let routes = self.routes.lock().unwrap();
                for route in routes.values() {
                    info!(
                        router = %self.name,
                        dest = %route.dest,
                        state = route.state.name(),
                        congested = route.congestion_events,
                        buffered = route.buffered.len(),
                        "route"
                    );
                }
                true
            }
            "traffic" => {
                // Advertise availability to every neighbour
                self.complete_restart();
                true
            }
            "advertise" => {
                let entries: Vec<(PcType, PointCode, RouteState)> = {
                    let routes = self.routes.lock().unwrap();
                    routes.values().map(|r| (r.pc_type, r.dest, r.state)).collect()
                };
                let networks = self.networks.read().unwrap().clone();
                for (pc_type, dest, state) in entries {
                    let msg = match state {
                        RouteState::Allowed => SnmMsg::Tfa { dest },
                        RouteState::Restricted => SnmMsg::Tfr { dest },
                        RouteState::Prohibited => SnmMsg::Tfp { dest },
                        _ => continue,
                    };
                    for network in networks.iter().filter(|n| n.pc_type() == pc_type) {
                        if network.adjacent_pc() == dest {
                            continue;
                        }
                        let label =
                            Label::new(pc_type, network.adjacent_pc(), network.local_pc(), 0);
                        self.send_snm(msg, &label);
                    }
                }
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
    fn route_state_updates_and_lookup() {
        let router = Router::new("router1", RouterConfig::default());
        let dest = PointCode::new(2, 2, 2);
        assert_eq!(router.route_state(PcType::Itu, dest), None);
        router.apply_route_state(PcType::Itu, dest, RouteState::Prohibited, None);
        assert_eq!(router.route_state(PcType::Itu, dest), Some(RouteState::Prohibited));
        router.apply_route_state(PcType::Itu, dest, RouteState::Allowed, None);
        assert_eq!(router.route_state(PcType::Itu, dest), Some(RouteState::Allowed));
    }

    #[test]
    fn transmit_fails_without_network() {
        let router = Router::new("router1", RouterConfig::default());
        let label =
            Label::new(PcType::Itu, PointCode::new(1, 1, 1), PointCode::new(2, 2, 2), 0);
        let sio = Sio::new(si::ISUP, 0, crate::types::NetworkIndicator::National);
        assert!(matches!(
            router.transmit_msu(sio, &label, &[0u8; 4]),
            Err(Mtp3Error::NoRoute(_))
        ));
    }

    #[test]
    fn prohibited_route_rejects_traffic() {
        let router = Router::new("router1", RouterConfig::default());
        let dest = PointCode::new(3, 3, 3);
        router.apply_route_state(PcType::Itu, dest, RouteState::Prohibited, None);
        let label = Label::new(PcType::Itu, dest, PointCode::new(1, 1, 1), 0);
        let sio = Sio::new(si::ISUP, 0, crate::types::NetworkIndicator::National);
        assert!(matches!(
            router.transmit_msu(sio, &label, &[0u8; 4]),
            Err(Mtp3Error::RouteProhibited(_))
        ));
    }
}
