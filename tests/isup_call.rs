//! ISUP call flows over a full back-to-back stack: interfaces, MTP2,
//! MTP3 linksets, routers and ISUP controllers on both sides.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use telsig::circuit::{CircuitGroup, CircuitRange, CircuitStatus, CircuitType, Strategy};
use telsig::config::{IsupConfig, Mtp2Config, Mtp3Config, RouterConfig};
use telsig::engine::{CallEvent, Notification, Notifier, SigComponent};
use telsig::iface::{LoopInterface, SigInterface};
use telsig::isup::{CallState, IsupController};
use telsig::mtp2::{L2Link, L2Op, Mtp2Link};
use telsig::mtp3::{Mtp3Network, Router};
use telsig::types::{PcType, PointCode};
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

struct Side {
    link: Arc<Mtp2Link>,
    isup: Arc<IsupController>,
}

async fn build_stack(engine: &Arc<Engine>) -> (Side, Side) {
    let (if_a, if_b) = LoopInterface::pair("spanA", "spanB");

    let mut l2_cfg = Mtp2Config::default();
    l2_cfg.proving_ms = 10;
    l2_cfg.auto_start = false;
    let link_a = Mtp2Link::new("l2A", l2_cfg.clone());
    let link_b = Mtp2Link::new("l2B", l2_cfg);
    link_a.attach_interface(if_a.clone() as Arc<dyn SigInterface>);
    link_b.attach_interface(if_b.clone() as Arc<dyn SigInterface>);

    let mut net_cfg = Mtp3Config::default();
    net_cfg.local = "1-1-1".to_string();
    net_cfg.adjacent = "2-2-2".to_string();
    net_cfg.check_links = false;
    let net_a = Mtp3Network::new("mtp3A", &net_cfg).unwrap();
    net_cfg.local = "2-2-2".to_string();
    net_cfg.adjacent = "1-1-1".to_string();
    let net_b = Mtp3Network::new("mtp3B", &net_cfg).unwrap();
    net_a.attach_link(link_a.clone() as Arc<dyn L2Link>, 0);
    net_b.attach_link(link_b.clone() as Arc<dyn L2Link>, 0);

    let router_a = Router::new("routerA", RouterConfig::default());
    let router_b = Router::new("routerB", RouterConfig::default());
    router_a.attach_network(net_a.clone());
    router_b.attach_network(net_b.clone());

    let group_a = CircuitGroup::new("grpA", 42);
    group_a.create_span("spanA", CircuitType::Tdm, 42, 8);
    group_a.add_range(CircuitRange::new("all", 42, 8, Strategy::Lowest));
    let group_b = CircuitGroup::new("grpB", 42);
    group_b.create_span("spanB", CircuitType::Tdm, 42, 8);
    group_b.add_range(CircuitRange::new("all", 42, 8, Strategy::Lowest));

    let mut isup_cfg = IsupConfig::default();
    isup_cfg.pointcode = "1-1-1".to_string();
    isup_cfg.remote_pointcode = "2-2-2".to_string();
    let isup_a = IsupController::new("isupA", isup_cfg.clone(), PcType::Itu, group_a).unwrap();
    isup_cfg.pointcode = "2-2-2".to_string();
    isup_cfg.remote_pointcode = "1-1-1".to_string();
    let isup_b = IsupController::new("isupB", isup_cfg, PcType::Itu, group_b).unwrap();
    isup_a.attach_router(&router_a);
    isup_b.attach_router(&router_b);
    isup_a.set_engine(engine);
    isup_b.set_engine(engine);

    for component in [
        if_a.clone() as Arc<dyn SigComponent>,
        if_b.clone() as Arc<dyn SigComponent>,
        link_a.clone() as Arc<dyn SigComponent>,
        link_b.clone() as Arc<dyn SigComponent>,
        net_a.clone() as Arc<dyn SigComponent>,
        net_b.clone() as Arc<dyn SigComponent>,
        router_a.clone() as Arc<dyn SigComponent>,
        router_b.clone() as Arc<dyn SigComponent>,
        isup_a.clone() as Arc<dyn SigComponent>,
        isup_b.clone() as Arc<dyn SigComponent>,
    ] {
        engine.attach(component).await;
    }

    (Side { link: link_a, isup: isup_a }, Side { link: link_b, isup: isup_b })
}

async fn align(a: &Side, b: &Side) {
    a.link.link_control(L2Op::Align { emergency: false });
    b.link.link_control(L2Op::Align { emergency: false });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a.link.operational());
    assert!(b.link.operational());
}

#[tokio::test]
async fn outgoing_call_happy_path() {
    let engine = Engine::new(EngineSettings::default(), vec![]);
    let log = CallLog::new();
    engine.set_notifier(log.clone());
    let (a, b) = build_stack(&engine).await;
    engine.run();
    align(&a, &b).await;

    // IAM carries the called digits and reserves CIC 42
    let call = a.isup.call("15551234", "15550000").unwrap();
    assert_eq!(call.cic(), 42);
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Far end saw the setup and answered early with ACM
    let new_call = log.find("isupB", CallEvent::NewCall).expect("NewCall event");
    assert_eq!(new_call.get("called").map(String::as_str), Some("15551234"));
    assert_eq!(new_call.get("caller").map(String::as_str), Some("15550000"));
    assert_eq!(call.state(), CallState::Accepted);

    // Ringing, then answer
    let b_call = b.isup.find_call(42).expect("incoming call");
    let msgs = b_call.ringing();
    b.isup.send_for(&b_call, msgs);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(call.state(), CallState::Ringing);

    let msgs = b_call.answer();
    b.isup.send_for(&b_call, msgs);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(call.state(), CallState::Answered);
    assert_eq!(call.circuit().status(), CircuitStatus::Connected);

    // Clear forward with cause 16; RLC releases the circuit
    a.isup.hangup_call(&call, 16);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(call.state(), CallState::Released);
    assert_eq!(a.isup.group().find(42).unwrap().status(), CircuitStatus::Idle);
    assert_eq!(a.isup.call_count(), 0);
    assert_eq!(b.isup.call_count(), 0);

    engine.stop().await;
}

fn glare_iam(cic: u32) -> telsig::isup::IsupMessage {
    use telsig::isup::{nai, IsupMessage, MsgType, Param};
    let mut iam = IsupMessage::new(MsgType::Iam, cic);
    iam.set_param(Param::NATURE_OF_CONNECTION_INDICATORS, vec![0])
        .set_param(Param::FORWARD_CALL_INDICATORS, vec![0x60, 0x01])
        .set_param(Param::CALLING_PARTY_CATEGORY, vec![0x0A])
        .set_param(Param::TRANSMISSION_MEDIUM_REQUIREMENT, vec![0])
        .set_called_number("15552222", nai::NATIONAL, 1, false);
    iam
}

#[tokio::test]
async fn glare_winner_relocates_and_sends_rel() {
    use telsig::isup::IsupDialect;
    use telsig::mtp3::{Label, Mtp3User};
    use telsig::types::{NetworkIndicator, Sio};

    let engine = Engine::new(EngineSettings::default(), vec![]);
    let log = CallLog::new();
    engine.set_notifier(log.clone());
    let (a, b) = build_stack(&engine).await;
    engine.run();
    align(&a, &b).await;

    // A sent an IAM for CIC 42; the peer's IAM for the same circuit
    // arrives while the call sits in Setup
    let call_a = a.isup.call("15551111", "15550001").unwrap();
    assert_eq!(call_a.cic(), 42);
    let wire = glare_iam(42).encode(IsupDialect::Itu).unwrap();
    let label = Label::new(PcType::Itu, PointCode::new(1, 1, 1), PointCode::new(2, 2, 2), 10);
    let sio = Sio::new(telsig::si::ISUP, 0, NetworkIndicator::National);
    Mtp3User::receive_msu(&*a.isup, sio, &label, wire);

    // A's point code is lower: it wins, clears the peer's reservation
    // with a REL and retransmits its IAM on a fresh circuit
    assert!(call_a.state().live());
    assert_eq!(call_a.cic(), 43, "winner re-selected via the replace counter");
    assert_eq!(a.isup.call_count(), 1, "winner does not serve the peer's IAM");
    assert_eq!(a.isup.group().find(42).unwrap().status(), CircuitStatus::Idle);

    drop(b);
    engine.stop().await;
}

#[tokio::test]
async fn glare_loser_surrenders_the_circuit() {
    use telsig::isup::IsupDialect;
    use telsig::mtp3::{Label, Mtp3User};
    use telsig::types::{CallDirection, NetworkIndicator, Sio};

    let engine = Engine::new(EngineSettings::default(), vec![]);
    let log = CallLog::new();
    engine.set_notifier(log.clone());
    let (a, b) = build_stack(&engine).await;
    engine.run();
    align(&a, &b).await;

    // B (higher point code) sent an IAM for CIC 42; A's IAM arrives
    let call_b = b.isup.call("15552222", "15550002").unwrap();
    assert_eq!(call_b.cic(), 42);
    let sio = Sio::new(telsig::si::ISUP, 0, NetworkIndicator::National);
    let label = Label::new(PcType::Itu, PointCode::new(2, 2, 2), PointCode::new(1, 1, 1), 10);
    let wire = glare_iam(42).encode(IsupDialect::Itu).unwrap();
    Mtp3User::receive_msu(&*b.isup, sio, &label, wire);

    // The loser keeps its call on a new circuit and serves the peer's
    // IAM on the contested one
    assert!(call_b.state().live());
    assert_eq!(call_b.cic(), 43, "loser re-selected a new circuit");
    let incoming = b.isup.find_call(42).expect("incoming call on the contested circuit");
    assert_eq!(incoming.direction(), CallDirection::Incoming);

    drop(a);
    engine.stop().await;
}

#[tokio::test]
async fn route_loss_releases_calls() {
    let engine = Engine::new(EngineSettings::default(), vec![]);
    let log = CallLog::new();
    engine.set_notifier(log.clone());
    let (a, b) = build_stack(&engine).await;
    engine.run();
    align(&a, &b).await;

    let call = a.isup.call("15551234", "").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(call.state().live());

    // The route toward the adjacent exchange collapses
    use telsig::mtp3::{Mtp3User, RouteState};
    Mtp3User::route_status(
        &*a.isup,
        PcType::Itu,
        PointCode::new(2, 2, 2),
        RouteState::Prohibited,
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        matches!(call.state(), CallState::Releasing | CallState::Released),
        "call clearing after route loss: {:?}",
        call.state()
    );

    drop(b);
    engine.stop().await;
}
