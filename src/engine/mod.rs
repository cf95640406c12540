//! Component engine
//!
//! Every protocol layer is a [`SigComponent`] attached to one [`Engine`].
//! The engine drives a single worker task that calls `tick(now)` on each
//! component in attach order; each component returns a desired sleep and the
//! engine sleeps the minimum. Out-of-band status travels through the
//! engine's [`Notifier`].

mod timer;

pub use timer::{SigCounter, SigTimer};

use crate::config::EngineConfig;
use crate::types::{PcType, PointCode};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Engine-wide settings
pub type EngineSettings = EngineConfig;

/// Sleep a component returns when it has nothing pending
pub const TICK_IDLE: Duration = Duration::from_millis(100);

/// Control mapping broadcast on the generic control channel
#[derive(Debug, Clone, Default)]
pub struct ControlMap {
    pub operation: String,
    pub target: Option<String>,
    pub params: HashMap<String, String>,
}

impl ControlMap {
    pub fn new(operation: &str) -> Self {
        Self { operation: operation.to_string(), target: None, params: HashMap::new() }
    }

    pub fn target(mut self, name: &str) -> Self {
        self.target = Some(name.to_string());
        self
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    pub fn get_bool(&self, key: &str, defval: bool) -> bool {
        self.get(key).map(|v| v == "true" || v == "yes" || v == "1").unwrap_or(defval)
    }

    pub fn get_u64(&self, key: &str, defval: u64) -> u64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(defval)
    }
}

/// Build a typed control mapping for one operation
pub fn control_create(operation: &str) -> ControlMap {
    ControlMap::new(operation)
}

/// Interface-level events surfaced to the notifier.
///
/// `name()` yields the stable upward message names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    LinkUp,
    LinkDown,
    HwError,
    TxClockError,
    RxClockError,
    AlignError,
    CksumError,
    TxOversize,
    RxOversize,
    TxOverflow,
    RxOverflow,
    TxUnderrun,
    RxUnderrun,
}

impl LinkEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LinkUp => "link-up",
            Self::LinkDown => "link-down",
            Self::HwError => "hw-error",
            Self::TxClockError => "tx-clock-error",
            Self::RxClockError => "rx-clock-error",
            Self::AlignError => "align-error",
            Self::CksumError => "cksum-error",
            Self::TxOversize => "tx-oversize",
            Self::RxOversize => "rx-oversize",
            Self::TxOverflow => "tx-overflow",
            Self::RxOverflow => "rx-overflow",
            Self::TxUnderrun => "tx-underrun",
            Self::RxUnderrun => "rx-underrun",
        }
    }
}

/// Call events of interest to the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    NewCall,
    Accept,
    Connect,
    Complete,
    Progress,
    Ringing,
    Answer,
    Transfer,
    Suspend,
    Resume,
    Release,
    Info,
    Charge,
    Message,
    Facility,
    Circuit,
    Enable,
    Disable,
    Reset,
    Verify,
}

impl CallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewCall => "NewCall",
            Self::Accept => "Accept",
            Self::Connect => "Connect",
            Self::Complete => "Complete",
            Self::Progress => "Progress",
            Self::Ringing => "Ringing",
            Self::Answer => "Answer",
            Self::Transfer => "Transfer",
            Self::Suspend => "Suspend",
            Self::Resume => "Resume",
            Self::Release => "Release",
            Self::Info => "Info",
            Self::Charge => "Charge",
            Self::Message => "Message",
            Self::Facility => "Facility",
            Self::Circuit => "Circuit",
            Self::Enable => "Enable",
            Self::Disable => "Disable",
            Self::Reset => "Reset",
            Self::Verify => "Verify",
        }
    }
}

/// Out-of-band status delivered through the engine's notifier
#[derive(Debug, Clone)]
pub enum Notification {
    /// Link-level event from an interface or data link
    Link { event: LinkEvent },
    /// A route changed state inside a router
    RouteStateChanged { pc_type: PcType, destination: PointCode, state: crate::mtp3::RouteState },
    /// Call event with a name-value view of the triggering message
    Call { event: CallEvent, params: HashMap<String, String> },
    /// Terminal notification: the engine worker exited
    Stopped { reason: String },
}

/// Engine-wide notification sink supplied by the host
pub trait Notifier: Send + Sync {
    fn notify(&self, component: &str, notification: Notification);
}

/// A named, engine-managed protocol component.
///
/// `tick` runs on the engine worker only and must not block on I/O; methods
/// callable from other tasks synchronize internally.
#[async_trait]
pub trait SigComponent: Send + Sync {
    fn name(&self) -> &str;

    fn component_type(&self) -> &'static str;

    /// Apply a configuration mapping. Returns false on failure; the engine
    /// keeps the component attached so a later initialize can succeed.
    async fn initialize(&self, _config: &serde_json::Value) -> bool {
        true
    }

    /// Periodic processing; returns the desired sleep before the next tick.
    async fn tick(&self, now: Instant) -> Duration;

    /// Handle a control mapping; true when the operation was consumed.
    async fn control(&self, _params: &ControlMap) -> bool {
        false
    }

    /// Teardown hook invoked while the engine stops.
    async fn destroyed(&self) {}
}

/// Packet dump sink contract for dump-capable components.
///
/// The record format behind the sink is not part of the core.
pub trait DumpSink: Send + Sync {
    fn dump(&self, tag: &str, sent: bool, packet: &[u8]);
}

/// Implemented by components able to mirror their wire traffic
pub trait Dumpable {
    fn set_dump(&self, sink: Option<Arc<dyn DumpSink>>, tag: &str);
}

/// Builds components by type name
pub trait ComponentFactory: Send + Sync {
    /// Return a component when this factory recognizes `ctype`.
    fn build(
        &self,
        ctype: &str,
        params: &ControlMap,
        engine: &Arc<Engine>,
    ) -> Option<Arc<dyn SigComponent>>;
}

static PRIMARY: OnceLock<Arc<Engine>> = OnceLock::new();

/// Process-wide component coordinator
pub struct Engine {
    settings: EngineSettings,
    components: RwLock<Vec<Arc<dyn SigComponent>>>,
    factories: Vec<Arc<dyn ComponentFactory>>,
    notifier: std::sync::RwLock<Option<Arc<dyn Notifier>>>,
    stop_tx: watch::Sender<bool>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Extra sleep shrink requested during the current tick pass, in usec
    tick_shrink: AtomicU64,
}

impl Engine {
    pub fn new(settings: EngineSettings, factories: Vec<Arc<dyn ComponentFactory>>) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            components: RwLock::new(Vec::new()),
            factories,
            notifier: std::sync::RwLock::new(None),
            stop_tx,
            worker: Mutex::new(None),
            tick_shrink: AtomicU64::new(u64::MAX),
        })
    }

    /// Install this engine as the process-wide primary. First call wins.
    pub fn set_primary(engine: &Arc<Engine>) -> bool {
        PRIMARY.set(engine.clone()).is_ok()
    }

    /// The designated primary engine, if one was installed
    pub fn primary() -> Option<Arc<Engine>> {
        PRIMARY.get().cloned()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
        *self.notifier.write().unwrap() = Some(notifier);
    }

    /// Deliver a notification through the installed sink, if any.
    /// Callable from any context; the sink must not block.
    pub fn notify(&self, component: &str, notification: Notification) {
        let sink = self.notifier.read().unwrap().clone();
        if let Some(sink) = sink {
            sink.notify(component, notification);
        }
    }

    /// Attach a component; names are unique within the engine
    pub async fn attach(&self, component: Arc<dyn SigComponent>) -> bool {
        let mut list = self.components.write().await;
        if list.iter().any(|c| c.name() == component.name()) {
            warn!(name = component.name(), "duplicate component name, not attached");
            return false;
        }
        debug!(name = component.name(), ctype = component.component_type(), "component attached");
        list.push(component);
        true
    }

    pub async fn detach(&self, name: &str) -> Option<Arc<dyn SigComponent>> {
        let mut list = self.components.write().await;
        let pos = list.iter().position(|c| c.name() == name)?;
        Some(list.remove(pos))
    }

    pub async fn find(&self, name: &str) -> Option<Arc<dyn SigComponent>> {
        self.components.read().await.iter().find(|c| c.name() == name).cloned()
    }

    pub async fn component_count(&self) -> usize {
        self.components.read().await.len()
    }

    /// Return an existing component named in `params`, or walk the factory
    /// registry and attach the first build that recognizes `ctype`.
    pub async fn build(
        self: &Arc<Self>,
        ctype: &str,
        params: &ControlMap,
        init: bool,
    ) -> Option<Arc<dyn SigComponent>> {
        if let Some(name) = params.get("name") {
            if let Some(existing) = self.find(name).await {
                return Some(existing);
            }
        }
        for factory in &self.factories {
            if let Some(component) = factory.build(ctype, params, self) {
                if init {
                    let config = serde_json::Map::from_iter(
                        params
                            .params
                            .iter()
                            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone()))),
                    );
                    if !component.initialize(&serde_json::Value::Object(config)).await {
                        warn!(ctype, "component initialize failed");
                    }
                }
                self.attach(component.clone()).await;
                return Some(component);
            }
        }
        None
    }

    /// Broadcast a control mapping; true when any component handled it
    pub async fn control(&self, params: &ControlMap) -> bool {
        let list = self.components.read().await.clone();
        let mut handled = false;
        for component in list {
            if let Some(target) = &params.target {
                if component.name() != target {
                    continue;
                }
            }
            handled |= component.control(params).await;
        }
        handled
    }

    /// Shrink the sleep after the current tick pass. Callable only from
    /// within `tick`.
    pub fn tick_sleep(&self, usec: u64) {
        self.tick_shrink.fetch_min(usec, Ordering::AcqRel);
    }

    /// Spawn the worker loop. The loop exits on `stop()` and invokes every
    /// component's `destroyed()` hook before returning.
    pub fn run(self: &Arc<Self>) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            engine.worker().await;
        });
        if let Ok(mut slot) = self.worker.try_lock() {
            *slot = Some(handle);
        }
    }

    async fn worker(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        info!("engine worker started");
        loop {
            if *stop_rx.borrow() {
                break;
            }
            let now = Instant::now();
            self.tick_shrink.store(u64::MAX, Ordering::Release);
            let components = self.components.read().await.clone();
            let mut sleep = Duration::from_micros(self.settings.tick_default_us);
            for component in components {
                let wanted = component.tick(now).await;
                if wanted < sleep {
                    sleep = wanted;
                }
            }
            let shrink = self.tick_shrink.load(Ordering::Acquire);
            if shrink != u64::MAX {
                sleep = sleep.min(Duration::from_micros(shrink));
            }
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        let components = self.components.read().await.clone();
        for component in components.iter().rev() {
            component.destroyed().await;
        }
        self.notify("engine", Notification::Stopped { reason: "stopped".to_string() });
        info!("engine worker exited");
    }

    /// Signal the worker to stop and wait for it to finish
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct TickCounter {
        name: String,
        ticks: AtomicU32,
        destroyed: AtomicU32,
    }

    #[async_trait]
    impl SigComponent for TickCounter {
        fn name(&self) -> &str {
            &self.name
        }

        fn component_type(&self) -> &'static str {
            "test"
        }

        async fn tick(&self, _now: Instant) -> Duration {
            self.ticks.fetch_add(1, Ordering::Relaxed);
            Duration::from_millis(1)
        }

        async fn control(&self, params: &ControlMap) -> bool {
            params.operation == "ping"
        }

        async fn destroyed(&self) {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn comp(name: &str) -> Arc<TickCounter> {
        Arc::new(TickCounter {
            name: name.to_string(),
            ticks: AtomicU32::new(0),
            destroyed: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn worker_ticks_and_stops() {
        let engine = Engine::new(EngineSettings::default(), vec![]);
        let c = comp("a");
        assert!(engine.attach(c.clone()).await);
        engine.run();
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.stop().await;
        assert!(c.ticks.load(Ordering::Relaxed) > 1);
        assert_eq!(c.destroyed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn duplicate_names_rejected() {
        let engine = Engine::new(EngineSettings::default(), vec![]);
        assert!(engine.attach(comp("x")).await);
        assert!(!engine.attach(comp("x")).await);
        assert_eq!(engine.component_count().await, 1);
    }

    #[tokio::test]
    async fn control_broadcast_reports_handled() {
        let engine = Engine::new(EngineSettings::default(), vec![]);
        engine.attach(comp("x")).await;
        assert!(engine.control(&control_create("ping")).await);
        assert!(!engine.control(&control_create("nope")).await);
        // Targeted control skips other components
        assert!(!engine.control(&control_create("ping").target("other")).await);
    }
}
