//! ISDN stack end-to-end: Q.921 establishment, a Q.931 call between a
//! CPE and a NET side, and TEI assignment under the engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use telsig::config::{Q921Config, Q931Config};
use telsig::engine::{CallEvent, Notification, Notifier, SigComponent};
use telsig::iface::{LoopInterface, SigInterface};
use telsig::isdn::{Q921Link, Q931CallController, Q931State, TeiManager};
use telsig::{Engine, EngineSettings};

struct CallLog {
    events: Mutex<Vec<(String, CallEvent, HashMap<String, String>)>>,
}

impl CallLog {
    fn new() -> Arc<Self> {
        Arc::new(Self { events: Mutex::new(Vec::new()) })
    }

    fn find(&self, component: &str, event: CallEvent) -> Option<HashMap<String, String>> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|(n, e, _)| n == component && *e == event)
            .map(|(_, _, p)| p.clone())
    }
}

impl Notifier for CallLog {
    fn notify(&self, component: &str, notification: Notification) {
        if let Notification::Call { event, params } = notification {
            self.events.lock().unwrap().push((component.to_string(), event, params));
        }
    }
}

#[tokio::test]
async fn q931_call_between_cpe_and_net() {
    let engine = Engine::new(EngineSettings::default(), vec![]);
    let log = CallLog::new();
    engine.set_notifier(log.clone());

    let (if_cpe, if_net) = LoopInterface::pair("briU", "briN");
    let mut q921_cfg = Q921Config::default();
    q921_cfg.auto_restart = false;
    q921_cfg.tei = 0;
    let link_cpe = Q921Link::new("dlCpe", q921_cfg.clone());
    q921_cfg.network = true;
    let link_net = Q921Link::new("dlNet", q921_cfg);
    link_cpe.attach_interface(if_cpe.clone() as Arc<dyn SigInterface>);
    link_net.attach_interface(if_net.clone() as Arc<dyn SigInterface>);

    let ctrl_cpe = Q931CallController::new("q931Cpe", Q931Config::default());
    let ctrl_net = Q931CallController::new("q931Net", Q931Config::default());
    ctrl_cpe.attach_link(link_cpe.clone());
    ctrl_net.attach_link(link_net.clone());
    ctrl_cpe.set_engine(&engine);
    ctrl_net.set_engine(&engine);

    for component in [
        if_cpe.clone() as Arc<dyn SigComponent>,
        if_net.clone() as Arc<dyn SigComponent>,
        link_cpe.clone() as Arc<dyn SigComponent>,
        link_net.clone() as Arc<dyn SigComponent>,
        ctrl_cpe.clone() as Arc<dyn SigComponent>,
        ctrl_net.clone() as Arc<dyn SigComponent>,
    ] {
        engine.attach(component).await;
    }
    engine.run();

    link_cpe.establish();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(link_cpe.established());
    assert!(link_net.established());

    // SETUP toward the network on channel 1
    let call = ctrl_cpe.call("15551234", "15550000", 1).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let new_call = log.find("q931Net", CallEvent::NewCall).expect("NewCall on NET side");
    assert_eq!(new_call.get("called").map(String::as_str), Some("15551234"));
    let call_ref: u16 = new_call.get("callref").unwrap().parse().unwrap();
    let net_call = ctrl_net.find_call(call_ref).expect("call present on NET side");
    assert_eq!(net_call.state(), Q931State::CallPresent);

    // Alerting then connect
    ctrl_net.ringing(&net_call).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(call.state(), Q931State::CallDelivered);
    assert!(log.find("q931Cpe", CallEvent::Ringing).is_some());

    ctrl_net.answer(&net_call).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(call.state(), Q931State::Active);
    assert_eq!(net_call.state(), Q931State::Active);

    // Clear from the CPE side
    ctrl_cpe.hangup(&call, 16).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(ctrl_cpe.call_count(), 0);
    assert_eq!(ctrl_net.call_count(), 0);

    engine.stop().await;
}

#[tokio::test]
async fn tei_assignment_then_establishment() {
    let engine = Engine::new(EngineSettings::default(), vec![]);
    let (if_net, if_cpe) = LoopInterface::pair("priN", "priU");

    let mgr_net = TeiManager::new("teiNet", true, 10_000, 500);
    let mgr_cpe = TeiManager::new("teiCpe", false, 10_000, 500);
    mgr_net.attach_interface(if_net.clone() as Arc<dyn SigInterface>);
    mgr_cpe.attach_interface(if_cpe.clone() as Arc<dyn SigInterface>);

    let mut cfg = Q921Config::default();
    cfg.auto_restart = false;
    let link_cpe = Q921Link::new("dlCpe", cfg.clone());
    link_cpe.attach_interface(if_cpe.clone() as Arc<dyn SigInterface>);
    mgr_cpe.add_child(0, link_cpe.clone());
    // The manager stays the interface receiver and demultiplexes
    mgr_cpe.clone().attach_interface(if_cpe.clone() as Arc<dyn SigInterface>);

    for component in [
        if_net.clone() as Arc<dyn SigComponent>,
        if_cpe.clone() as Arc<dyn SigComponent>,
        mgr_net.clone() as Arc<dyn SigComponent>,
        mgr_cpe.clone() as Arc<dyn SigComponent>,
        link_cpe.clone() as Arc<dyn SigComponent>,
    ] {
        engine.attach(component).await;
    }
    engine.run();

    mgr_cpe.request_tei().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let tei = mgr_cpe.assigned_tei().expect("TEI assigned by the network");
    assert!((64..=126).contains(&tei));

    // The network binds its own child under the assigned TEI and the
    // data link establishes on it
    cfg.network = true;
    let link_net = Q921Link::new("dlNet", cfg);
    link_net.attach_interface(if_net.clone() as Arc<dyn SigInterface>);
    mgr_net.add_child(tei, link_net.clone());
    mgr_net.clone().attach_interface(if_net.clone() as Arc<dyn SigInterface>);
    engine.attach(link_net.clone() as Arc<dyn SigComponent>).await;

    link_cpe.establish();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(link_cpe.established());
    assert!(link_net.established());
    assert_eq!(link_net.tei(), tei);

    engine.stop().await;
}
