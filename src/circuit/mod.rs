//! Bearer circuits and circuit groups
//!
//! Circuits model the voice channels the signalling controls. A group owns
//! circuits with unique codes, carves them into named ranges and hands them
//! out under an allocation strategy. Reservation is atomic under the
//! circuit's own lock; allocation scans run under the group lock.

use crate::engine::{SigComponent, TICK_IDLE};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// Circuit media type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitType {
    Local,
    Tdm,
    Rtp,
    Iax,
}

/// Circuit life-cycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitStatus {
    Missing,
    Disabled,
    Idle,
    Reserved,
    Starting,
    Stopping,
    Special,
    Connected,
}

impl CircuitStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Missing => "Missing",
            Self::Disabled => "Disabled",
            Self::Idle => "Idle",
            Self::Reserved => "Reserved",
            Self::Starting => "Starting",
            Self::Stopping => "Stopping",
            Self::Special => "Special",
            Self::Connected => "Connected",
        }
    }
}

/// Maintenance and hardware lock bits.
///
/// Local/remote pairs mirror the blocking state each side advertised;
/// the locking bits mark an exchange still in progress and the changed
/// bit marks state the management protocol has yet to advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LockFlags(pub u32);

impl LockFlags {
    pub const LOCAL_HW_FAIL: LockFlags = LockFlags(0x0001);
    pub const LOCAL_MAINTENANCE: LockFlags = LockFlags(0x0002);
    pub const REMOTE_HW_FAIL: LockFlags = LockFlags(0x0004);
    pub const REMOTE_MAINTENANCE: LockFlags = LockFlags(0x0008);
    pub const LOCKING_HW: LockFlags = LockFlags(0x0010);
    pub const LOCKING_MAINTENANCE: LockFlags = LockFlags(0x0020);
    pub const CHANGED: LockFlags = LockFlags(0x0040);

    /// Every bit that blocks circuit usage
    pub const LOCKED: LockFlags = LockFlags(0x000F);
    /// Bits describing state advertised by this side
    pub const LOCAL: LockFlags = LockFlags(0x0003);
    /// Bits describing state advertised by the peer
    pub const REMOTE: LockFlags = LockFlags(0x000C);

    pub fn none() -> Self {
        Self(0)
    }

    pub fn intersects(&self, other: LockFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn with(self, other: LockFlags) -> Self {
        Self(self.0 | other.0)
    }

    pub fn without(self, other: LockFlags) -> Self {
        Self(self.0 & !other.0)
    }
}

/// Event produced by a circuit, queued until the controller drains it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitEvent {
    Dtmf(String),
    Tone(String),
    OnHook,
    OffHook,
    Wink,
    Flash,
    RingStart,
    RingStop,
    Alarm(String),
    AlarmCleared,
}

struct CircuitState {
    status: CircuitStatus,
    locks: LockFlags,
    format: Option<String>,
}

/// A bearer channel identified by an unsigned code within its group
pub struct Circuit {
    code: u32,
    ctype: CircuitType,
    span: String,
    state: Mutex<CircuitState>,
    events: Mutex<VecDeque<CircuitEvent>>,
}

impl Circuit {
    pub fn new(code: u32, ctype: CircuitType, span: &str) -> Arc<Self> {
        Arc::new(Self {
            code,
            ctype,
            span: span.to_string(),
            state: Mutex::new(CircuitState {
                status: CircuitStatus::Idle,
                locks: LockFlags::none(),
                format: None,
            }),
            events: Mutex::new(VecDeque::new()),
        })
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn circuit_type(&self) -> CircuitType {
        self.ctype
    }

    pub fn span(&self) -> &str {
        &self.span
    }

    pub fn status(&self) -> CircuitStatus {
        self.state.lock().unwrap().status
    }

    pub fn locks(&self) -> LockFlags {
        self.state.lock().unwrap().locks
    }

    pub fn format(&self) -> Option<String> {
        self.state.lock().unwrap().format.clone()
    }

    /// Idle -> Reserved. Fails when not idle or when any flag in
    /// `check_lock` is set. Idempotent reservation returns false.
    pub fn reserve(&self, check_lock: LockFlags) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status != CircuitStatus::Idle || state.locks.intersects(check_lock) {
            return false;
        }
        state.status = CircuitStatus::Reserved;
        true
    }

    /// Reserved -> Connected, optionally updating the negotiated format
    pub fn connect(&self, format: Option<&str>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status != CircuitStatus::Reserved {
            return false;
        }
        if let Some(format) = format {
            state.format = Some(format.to_string());
        }
        state.status = CircuitStatus::Connected;
        true
    }

    /// Connected -> Reserved
    pub fn disconnect(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status != CircuitStatus::Connected {
            return false;
        }
        state.status = CircuitStatus::Reserved;
        true
    }

    /// Reserved/Connected/Special -> Idle
    pub fn release(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.status {
            CircuitStatus::Reserved | CircuitStatus::Connected | CircuitStatus::Special => {
                state.status = CircuitStatus::Idle;
                state.format = None;
                true
            }
            _ => false,
        }
    }

    /// Any -> Disabled
    pub fn disable(&self) {
        let mut state = self.state.lock().unwrap();
        state.status = CircuitStatus::Disabled;
        state.format = None;
    }

    /// Disabled -> Reserved; re-enabled circuits come back owned
    pub fn enable(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status != CircuitStatus::Disabled {
            return false;
        }
        state.status = CircuitStatus::Reserved;
        true
    }

    /// Reserved -> Special (continuity testing and the like)
    pub fn set_special(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status != CircuitStatus::Reserved {
            return false;
        }
        state.status = CircuitStatus::Special;
        true
    }

    pub fn set_lock(&self, flags: LockFlags) {
        let mut state = self.state.lock().unwrap();
        state.locks = state.locks.with(flags).with(LockFlags::CHANGED);
    }

    pub fn clear_lock(&self, flags: LockFlags) {
        let mut state = self.state.lock().unwrap();
        state.locks = state.locks.without(flags).with(LockFlags::CHANGED);
    }

    /// Clear the changed marker once management has advertised the state
    pub fn ack_lock_change(&self) {
        let mut state = self.state.lock().unwrap();
        state.locks = state.locks.without(LockFlags::CHANGED);
    }

    pub fn add_event(&self, event: CircuitEvent) {
        self.events.lock().unwrap().push_back(event);
    }

    /// Drain queued events in arrival order
    pub fn take_events(&self) -> Vec<CircuitEvent> {
        self.events.lock().unwrap().drain(..).collect()
    }
}

/// Allocation strategy for a range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    Increment,
    Decrement,
    Lowest,
    Highest,
    Random,
}

/// Code parity restriction applied before strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    Any,
    Even,
    Odd,
}

impl Parity {
    fn admits(&self, code: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Even => code % 2 == 0,
            Self::Odd => code % 2 == 1,
        }
    }

    fn opposite(&self) -> Self {
        match self {
            Self::Any => Self::Any,
            Self::Even => Self::Odd,
            Self::Odd => Self::Even,
        }
    }
}

/// Named slice of a group's code space with its own allocation policy
#[derive(Debug, Clone)]
pub struct CircuitRange {
    pub name: String,
    pub base: u32,
    pub count: u32,
    pub strategy: Strategy,
    pub parity: Parity,
    /// Try the opposite parity when the restricted pool is empty
    pub fallback: bool,
    last_used: u32,
}

impl CircuitRange {
    pub fn new(name: &str, base: u32, count: u32, strategy: Strategy) -> Self {
        Self {
            name: name.to_string(),
            base,
            count,
            strategy,
            parity: Parity::Any,
            fallback: false,
            last_used: 0,
        }
    }

    pub fn with_parity(mut self, parity: Parity, fallback: bool) -> Self {
        self.parity = parity;
        self.fallback = fallback;
        self
    }

    fn contains(&self, code: u32) -> bool {
        code >= self.base && code < self.base + self.count
    }
}

/// Owns a contiguous set of circuits and allocates them through ranges
pub struct CircuitGroup {
    name: String,
    base: u32,
    circuits: RwLock<BTreeMap<u32, Arc<Circuit>>>,
    ranges: Mutex<Vec<CircuitRange>>,
    rand_state: AtomicU64,
}

impl CircuitGroup {
    pub fn new(name: &str, base: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            base,
            circuits: RwLock::new(BTreeMap::new()),
            ranges: Mutex::new(Vec::new()),
            // Seed varies per group; only spread matters, not quality
            rand_state: AtomicU64::new(0x9E3779B97F4A7C15 ^ base as u64),
        })
    }

    pub fn group_name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Insert a circuit; codes are unique within the group
    pub fn insert(&self, circuit: Arc<Circuit>) -> bool {
        let mut map = self.circuits.write().unwrap();
        if map.contains_key(&circuit.code()) {
            return false;
        }
        map.insert(circuit.code(), circuit);
        true
    }

    /// Create `count` circuits with consecutive codes starting at `first`
    pub fn create_span(&self, span: &str, ctype: CircuitType, first: u32, count: u32) {
        for code in first..first + count {
            self.insert(Circuit::new(code, ctype, span));
        }
    }

    pub fn find(&self, code: u32) -> Option<Arc<Circuit>> {
        self.circuits.read().unwrap().get(&code).cloned()
    }

    pub fn circuit_count(&self) -> usize {
        self.circuits.read().unwrap().len()
    }

    pub fn add_range(&self, range: CircuitRange) {
        self.ranges.lock().unwrap().push(range);
    }

    /// Reserve the next circuit from `range_name` (or the whole group) that
    /// is idle and has no lock in `check_lock` set.
    pub fn reserve(&self, range_name: Option<&str>, check_lock: LockFlags) -> Option<Arc<Circuit>> {
        let mut ranges = self.ranges.lock().unwrap();
        let range = match range_name {
            Some(name) => ranges.iter_mut().find(|r| r.name == name)?,
            None => ranges.first_mut()?,
        };

        let map = self.circuits.read().unwrap();
        let candidates: Vec<Arc<Circuit>> =
            map.values().filter(|c| range.contains(c.code())).cloned().collect();
        drop(map);

        if let Some(circuit) = self.pick(range, &candidates, range.parity, check_lock) {
            return Some(circuit);
        }
        if range.fallback && range.parity != Parity::Any {
            let parity = range.parity.opposite();
            return self.pick(range, &candidates, parity, check_lock);
        }
        None
    }

    fn pick(
        &self,
        range: &mut CircuitRange,
        candidates: &[Arc<Circuit>],
        parity: Parity,
        check_lock: LockFlags,
    ) -> Option<Arc<Circuit>> {
        let available: Vec<&Arc<Circuit>> = candidates
            .iter()
            .filter(|c| {
                parity.admits(c.code())
                    && c.status() == CircuitStatus::Idle
                    && !c.locks().intersects(check_lock)
            })
            .collect();
        if available.is_empty() {
            return None;
        }

        let chosen = match range.strategy {
            Strategy::Lowest => available.iter().min_by_key(|c| c.code()).copied(),
            Strategy::Highest => available.iter().max_by_key(|c| c.code()).copied(),
            Strategy::Increment => available
                .iter()
                .filter(|c| c.code() > range.last_used)
                .min_by_key(|c| c.code())
                .or_else(|| available.iter().min_by_key(|c| c.code()))
                .copied(),
            Strategy::Decrement => available
                .iter()
                .filter(|c| range.last_used == 0 || c.code() < range.last_used)
                .max_by_key(|c| c.code())
                .or_else(|| available.iter().max_by_key(|c| c.code()))
                .copied(),
            Strategy::Random => {
                let n = self.next_rand() as usize % available.len();
                Some(available[n])
            }
        }?;

        // Another task may have grabbed it between the scan and here
        if chosen.reserve(check_lock) {
            range.last_used = chosen.code();
            debug!(group = %self.name, code = chosen.code(), "circuit reserved");
            Some(chosen.clone())
        } else {
            None
        }
    }

    fn next_rand(&self) -> u64 {
        // xorshift64*, good enough for circuit spread
        let mut x = self.rand_state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rand_state.store(x, Ordering::Relaxed);
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Apply a lock to every circuit in a code range, as group supervision
    /// messages do
    pub fn lock_range(&self, first: u32, count: u32, flags: LockFlags) {
        let map = self.circuits.read().unwrap();
        for (_, circuit) in map.range(first..first + count) {
            circuit.set_lock(flags);
        }
    }

    pub fn unlock_range(&self, first: u32, count: u32, flags: LockFlags) {
        let map = self.circuits.read().unwrap();
        for (_, circuit) in map.range(first..first + count) {
            circuit.clear_lock(flags);
        }
    }

    /// Clear the changed marker over an acknowledged code range
    pub fn ack_lock_changes(&self, first: u32, count: u32) {
        let map = self.circuits.read().unwrap();
        for (_, circuit) in map.range(first..=first + count) {
            circuit.ack_lock_change();
        }
    }

    /// Snapshot of every circuit's status keyed by code, for persistence
    pub fn statuses(&self) -> Vec<(u32, CircuitStatus, LockFlags)> {
        self.circuits
            .read()
            .unwrap()
            .values()
            .map(|c| (c.code(), c.status(), c.locks()))
            .collect()
    }

    /// Diagnostic snapshot bounded by a lock-wait budget. Returns `None`
    /// instead of blocking past the deadline; a zero budget waits forever.
    pub fn try_statuses(&self, max_wait: Duration) -> Option<Vec<(u32, CircuitStatus, LockFlags)>> {
        if max_wait.is_zero() {
            return Some(self.statuses());
        }
        let deadline = Instant::now() + max_wait;
        loop {
            if let Ok(map) = self.circuits.try_read() {
                return Some(
                    map.values().map(|c| (c.code(), c.status(), c.locks())).collect(),
                );
            }
            if Instant::now() >= deadline {
                debug!(group = %self.name, "status probe gave up waiting for the lock");
                return None;
            }
            std::thread::yield_now();
        }
    }
}

#[async_trait]
impl SigComponent for CircuitGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn component_type(&self) -> &'static str {
        "circuit-group"
    }

    async fn tick(&self, _now: Instant) -> Duration {
        TICK_IDLE
    }

    async fn control(&self, params: &crate::engine::ControlMap) -> bool {
        let code = params.get("circuit").and_then(|c| c.parse::<u32>().ok());
        match params.operation.as_str() {
            "reserve" => match code {
                Some(code) => {
                    self.find(code).map(|c| c.reserve(LockFlags::LOCKED)).unwrap_or(false)
                }
                None => self.reserve(params.get("range"), LockFlags::LOCKED).is_some(),
            },
            "release" => code
                .and_then(|code| self.find(code))
                .map(|c| c.release())
                .unwrap_or(false),
            "connect" => code
                .and_then(|code| self.find(code))
                .map(|c| c.connect(params.get("format")))
                .unwrap_or(false),
            "disconnect" => code
                .and_then(|code| self.find(code))
                .map(|c| c.disconnect())
                .unwrap_or(false),
            "disable" => match code.and_then(|code| self.find(code)) {
                Some(circuit) => {
                    circuit.disable();
                    true
                }
                None => false,
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_with(count: u32, strategy: Strategy) -> Arc<CircuitGroup> {
        let group = CircuitGroup::new("grp", 1);
        group.create_span("span1", CircuitType::Tdm, 1, count);
        group.add_range(CircuitRange::new("all", 1, count, strategy));
        group
    }

    #[test]
    fn status_transitions() {
        let c = Circuit::new(7, CircuitType::Tdm, "span1");
        assert!(c.reserve(LockFlags::LOCKED));
        // Reserving a reserved circuit fails
        assert!(!c.reserve(LockFlags::LOCKED));
        assert!(c.connect(Some("alaw")));
        assert_eq!(c.status(), CircuitStatus::Connected);
        assert_eq!(c.format().as_deref(), Some("alaw"));
        assert!(c.disconnect());
        assert_eq!(c.status(), CircuitStatus::Reserved);
        assert!(c.release());
        assert_eq!(c.status(), CircuitStatus::Idle);
        c.disable();
        assert!(!c.reserve(LockFlags::none()));
        assert!(c.enable());
        assert_eq!(c.status(), CircuitStatus::Reserved);
    }

    #[test]
    fn locks_block_reservation() {
        let c = Circuit::new(3, CircuitType::Tdm, "span1");
        c.set_lock(LockFlags::REMOTE_MAINTENANCE);
        assert!(!c.reserve(LockFlags::LOCKED));
        // A caller that ignores remote maintenance still gets through
        assert!(c.reserve(LockFlags::LOCAL_HW_FAIL));
    }

    #[test]
    fn increment_cycles_through_range() {
        let group = group_with(4, Strategy::Increment);
        let codes: Vec<u32> = (0..4).map(|_| {
            let c = group.reserve(None, LockFlags::LOCKED).unwrap();
            let code = c.code();
            c.release();
            code
        }).collect();
        assert_eq!(codes, vec![1, 2, 3, 4]);
        // Wraps back to the lowest
        let c = group.reserve(None, LockFlags::LOCKED).unwrap();
        assert_eq!(c.code(), 1);
    }

    #[test]
    fn parity_restriction_and_fallback() {
        let group = CircuitGroup::new("grp", 1);
        group.create_span("span1", CircuitType::Tdm, 1, 4);
        group.add_range(
            CircuitRange::new("even", 1, 4, Strategy::Lowest).with_parity(Parity::Even, true),
        );
        let a = group.reserve(Some("even"), LockFlags::LOCKED).unwrap();
        assert_eq!(a.code(), 2);
        let b = group.reserve(Some("even"), LockFlags::LOCKED).unwrap();
        assert_eq!(b.code(), 4);
        // Even pool exhausted; fallback hands out odd codes
        let c = group.reserve(Some("even"), LockFlags::LOCKED).unwrap();
        assert_eq!(c.code(), 1);
    }

    #[test]
    fn range_locking() {
        let group = group_with(8, Strategy::Lowest);
        group.lock_range(1, 4, LockFlags::REMOTE_MAINTENANCE);
        let c = group.reserve(None, LockFlags::LOCKED).unwrap();
        assert_eq!(c.code(), 5);
        group.unlock_range(1, 4, LockFlags::REMOTE_MAINTENANCE);
        let c2 = group.reserve(None, LockFlags::LOCKED).unwrap();
        assert_eq!(c2.code(), 1);
    }

    #[test]
    fn event_queue_drains_in_order() {
        let c = Circuit::new(1, CircuitType::Rtp, "span1");
        c.add_event(CircuitEvent::OffHook);
        c.add_event(CircuitEvent::Dtmf("12".into()));
        assert_eq!(
            c.take_events(),
            vec![CircuitEvent::OffHook, CircuitEvent::Dtmf("12".into())]
        );
        assert!(c.take_events().is_empty());
    }
}
