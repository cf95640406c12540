//! MTP2 alignment driven by the engine worker.
//!
//! Two links over a crossed interface pair align with an emergency
//! indication on one side; each side reports link-up exactly once.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use telsig::config::Mtp2Config;
use telsig::engine::{LinkEvent, Notification, Notifier, SigComponent};
use telsig::iface::{LoopInterface, SigInterface};
use telsig::mtp2::{L2Link, L2Op, Mtp2Link};
use telsig::{Engine, EngineSettings};

/// Honour RUST_LOG when a test needs wire-level tracing
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

struct EventLog {
    events: Mutex<Vec<(String, LinkEvent)>>,
}

impl Notifier for EventLog {
    fn notify(&self, component: &str, notification: Notification) {
        if let Notification::Link { event } = notification {
            self.events.lock().unwrap().push((component.to_string(), event));
        }
    }
}

#[tokio::test]
async fn emergency_alignment_brings_both_sides_up_once() {
    init_tracing();
    let engine = Engine::new(EngineSettings::default(), vec![]);
    let log = Arc::new(EventLog { events: Mutex::new(Vec::new()) });
    engine.set_notifier(log.clone());

    let (if_a, if_b) = LoopInterface::pair("ifA", "ifB");
    let mut cfg = Mtp2Config::default();
    cfg.proving_ms = 10;
    cfg.auto_start = false;
    let link_a = Mtp2Link::new("linkA", cfg.clone());
    let link_b = Mtp2Link::new("linkB", cfg);
    link_a.attach_interface(if_a.clone() as Arc<dyn SigInterface>);
    link_b.attach_interface(if_b.clone() as Arc<dyn SigInterface>);
    link_a.set_engine(&engine);
    link_b.set_engine(&engine);

    engine.attach(if_a.clone() as Arc<dyn SigComponent>).await;
    engine.attach(if_b.clone() as Arc<dyn SigComponent>).await;
    engine.attach(link_a.clone() as Arc<dyn SigComponent>).await;
    engine.attach(link_b.clone() as Arc<dyn SigComponent>).await;
    engine.run();

    // Side A asks for emergency alignment, side B for normal
    link_a.link_control(L2Op::Align { emergency: true });
    link_b.link_control(L2Op::Align { emergency: false });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(link_a.operational(), "side A should be in service");
    assert!(link_b.operational(), "side B should be in service");
    assert!(link_a.up_since().is_some());

    // Exactly one link-up per side
    let events = log.events.lock().unwrap();
    let ups_a = events.iter().filter(|(n, e)| n == "linkA" && *e == LinkEvent::LinkUp).count();
    let ups_b = events.iter().filter(|(n, e)| n == "linkB" && *e == LinkEvent::LinkUp).count();
    assert_eq!(ups_a, 1);
    assert_eq!(ups_b, 1);
    drop(events);

    engine.stop().await;
}

#[tokio::test]
async fn pause_reports_link_down() {
    let engine = Engine::new(EngineSettings::default(), vec![]);
    let log = Arc::new(EventLog { events: Mutex::new(Vec::new()) });
    engine.set_notifier(log.clone());

    let (if_a, if_b) = LoopInterface::pair("ifA", "ifB");
    let mut cfg = Mtp2Config::default();
    cfg.proving_ms = 10;
    cfg.auto_start = false;
    let link_a = Mtp2Link::new("pauseA", cfg.clone());
    let link_b = Mtp2Link::new("pauseB", cfg);
    link_a.attach_interface(if_a.clone() as Arc<dyn SigInterface>);
    link_b.attach_interface(if_b.clone() as Arc<dyn SigInterface>);
    link_a.set_engine(&engine);
    link_b.set_engine(&engine);
    for component in [
        if_a.clone() as Arc<dyn SigComponent>,
        if_b.clone() as Arc<dyn SigComponent>,
        link_a.clone() as Arc<dyn SigComponent>,
        link_b.clone() as Arc<dyn SigComponent>,
    ] {
        engine.attach(component).await;
    }
    engine.run();

    link_a.link_control(L2Op::Align { emergency: false });
    link_b.link_control(L2Op::Align { emergency: false });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(link_a.operational());

    link_a.link_control(L2Op::Pause);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!link_a.operational());
    let events = log.events.lock().unwrap();
    assert!(events.iter().any(|(n, e)| n == "pauseA" && *e == LinkEvent::LinkDown));
    drop(events);

    engine.stop().await;
}
