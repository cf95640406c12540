//! SCCP segmentation with global title translation, and a TCAP dialog,
//! both over a complete back-to-back SS7 stack.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use telsig::config::{Mtp2Config, Mtp3Config, RouterConfig, SccpConfig, TcapConfig};
use telsig::engine::SigComponent;
use telsig::iface::{LoopInterface, SigInterface};
use telsig::mtp2::{L2Link, L2Op, Mtp2Link};
use telsig::mtp3::{Mtp3Network, Router};
use telsig::sccp::{
    GlobalTitle, GttRule, ProtocolClass, ReturnCause, SccpAddress, SccpBroadcast, SccpEngine,
    SccpUser,
};
use telsig::tcap::{TcapComponent, TcapEngine, TcapUser, TransactionType};
use telsig::types::PointCode;
use telsig::{Engine, EngineSettings};

struct DataSink {
    ssn: u8,
    received: Mutex<Vec<(Bytes, SccpAddress)>>,
    notices: Mutex<Vec<ReturnCause>>,
}

impl DataSink {
    fn new(ssn: u8) -> Arc<Self> {
        Arc::new(Self { ssn, received: Mutex::new(Vec::new()), notices: Mutex::new(Vec::new()) })
    }
}

impl SccpUser for DataSink {
    fn ssn(&self) -> u8 {
        self.ssn
    }

    fn receive_data(&self, data: Bytes, called: &SccpAddress, _calling: &SccpAddress) -> bool {
        self.received.lock().unwrap().push((data, called.clone()));
        true
    }

    fn receive_notice(
        &self,
        cause: ReturnCause,
        _data: Bytes,
        _called: &SccpAddress,
        _calling: &SccpAddress,
    ) {
        self.notices.lock().unwrap().push(cause);
    }

    fn management_status(&self, _status: SccpBroadcast) {}
}

struct Stack {
    sccp_a: Arc<SccpEngine>,
    sccp_b: Arc<SccpEngine>,
    link_a: Arc<Mtp2Link>,
    link_b: Arc<Mtp2Link>,
}

async fn build_stack(engine: &Arc<Engine>) -> Stack {
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

    let sccp_a = SccpEngine::new("sccpA", SccpConfig::default(), PointCode::new(1, 1, 1));
    let sccp_b = SccpEngine::new("sccpB", SccpConfig::default(), PointCode::new(2, 2, 2));
    sccp_a.attach_router(&router_a);
    sccp_b.attach_router(&router_b);

    for component in [
        if_a.clone() as Arc<dyn SigComponent>,
        if_b.clone() as Arc<dyn SigComponent>,
        link_a.clone() as Arc<dyn SigComponent>,
        link_b.clone() as Arc<dyn SigComponent>,
        net_a.clone() as Arc<dyn SigComponent>,
        net_b.clone() as Arc<dyn SigComponent>,
        router_a.clone() as Arc<dyn SigComponent>,
        router_b.clone() as Arc<dyn SigComponent>,
        sccp_a.clone() as Arc<dyn SigComponent>,
        sccp_b.clone() as Arc<dyn SigComponent>,
    ] {
        engine.attach(component).await;
    }

    Stack { sccp_a, sccp_b, link_a, link_b }
}

async fn align(stack: &Stack) {
    stack.link_a.link_control(L2Op::Align { emergency: false });
    stack.link_b.link_control(L2Op::Align { emergency: false });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(stack.link_a.operational());
    assert!(stack.link_b.operational());
}

#[tokio::test]
async fn segmented_xudt_with_gtt_reassembles_intact() {
    let engine = Engine::new(EngineSettings::default(), vec![]);
    let stack = build_stack(&engine).await;
    engine.run();
    align(&stack).await;

    // Translation turns the called GT into the far point code
    stack.sccp_a.translator().add_rule(GttRule {
        prefix: "1555".to_string(),
        translation_type: None,
        point_code: PointCode::new(2, 2, 2),
        ssn: Some(8),
        rewrite: None,
    });
    let sink = DataSink::new(8);
    let user: Arc<dyn SccpUser> = sink.clone();
    stack.sccp_b.attach_user(&user);

    // 600 octets exceed a single XUDT: three segments go out
    let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
    let called = SccpAddress::from_gt(GlobalTitle::e164("15551234"), Some(8));
    let calling = stack.sccp_a.local_address(6);
    stack
        .sccp_a
        .send_unitdata(&called, &calling, ProtocolClass::CLASS_1, &payload)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let received = sink.received.lock().unwrap();
    assert_eq!(received.len(), 1, "exactly one reassembled delivery");
    assert_eq!(received[0].0.as_ref(), payload.as_slice(), "payload byte-identical");
    drop(received);

    engine.stop().await;
}

#[tokio::test]
async fn unitdata_without_translation_fails_locally() -> anyhow::Result<()> {
    let engine = Engine::new(EngineSettings::default(), vec![]);
    let stack = build_stack(&engine).await;
    engine.run();
    align(&stack).await;

    let called = SccpAddress::from_gt(GlobalTitle::e164("4912345"), Some(8));
    let calling = stack.sccp_a.local_address(6);
    let result =
        stack.sccp_a.send_unitdata(&called, &calling, ProtocolClass::CLASS_0, b"data");
    assert!(result.is_err());

    // A routable address still goes through
    let routable = SccpAddress::from_ssn_pc(8, PointCode::new(2, 2, 2));
    stack.sccp_a.send_unitdata(&routable, &calling, ProtocolClass::CLASS_0, b"data")?;

    engine.stop().await;
    Ok(())
}

struct TcapSink {
    seen: Mutex<Vec<(u32, TransactionType, usize)>>,
}

impl TcapSink {
    fn new() -> Arc<Self> {
        Arc::new(Self { seen: Mutex::new(Vec::new()) })
    }
}

impl TcapUser for TcapSink {
    fn user_name(&self) -> &str {
        "test-user"
    }

    fn handle_indication(
        &self,
        local_id: u32,
        primitive: TransactionType,
        components: &[TcapComponent],
    ) -> bool {
        self.seen.lock().unwrap().push((local_id, primitive, components.len()));
        true
    }
}

#[tokio::test]
async fn tcap_invoke_result_dialog() {
    let engine = Engine::new(EngineSettings::default(), vec![]);
    let stack = build_stack(&engine).await;
    engine.run();
    align(&stack).await;

    let tcap_a = TcapEngine::new("tcapA", TcapConfig::default(), 8);
    let tcap_b = TcapEngine::new("tcapB", TcapConfig::default(), 8);
    tcap_a.attach_sccp(&stack.sccp_a);
    tcap_b.attach_sccp(&stack.sccp_b);
    let sink_a = TcapSink::new();
    let sink_b = TcapSink::new();
    let user_a: Arc<dyn TcapUser> = sink_a.clone();
    let user_b: Arc<dyn TcapUser> = sink_b.clone();
    tcap_a.set_user(&user_a);
    tcap_b.set_user(&user_b);
    engine.attach(tcap_a.clone() as Arc<dyn SigComponent>).await;
    engine.attach(tcap_b.clone() as Arc<dyn SigComponent>).await;

    // Begin with one class-1 invoke, operation code 1, invoke ID 5
    let remote = SccpAddress::from_ssn_pc(8, PointCode::new(2, 2, 2));
    let local_id = tcap_a
        .begin(remote, &[0, 4, 0, 0, 1, 0, 20, 3], vec![TcapComponent::invoke(5, 1, None)])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Far end saw the Begin with one component
    let b_id = {
        let seen = sink_b.seen.lock().unwrap();
        let (id, primitive, count) = seen.first().expect("begin delivered");
        assert_eq!(*primitive, TransactionType::Begin);
        assert_eq!(*count, 1);
        *id
    };
    assert_eq!(tcap_b.transaction_count(), 1);

    // Continue back with the matching ResultLast
    tcap_b
        .continue_transaction(b_id, vec![TcapComponent::result_last(5, Some(1), None)])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    {
        let seen = sink_a.seen.lock().unwrap();
        assert!(seen
            .iter()
            .any(|(id, primitive, _)| *id == local_id && *primitive == TransactionType::Continue));
    }

    // Basic end closes the dialog on both sides
    tcap_a.end(local_id, vec![], true).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(tcap_a.transaction_count(), 0);
    assert_eq!(tcap_b.transaction_count(), 0);

    // Counter law: two sent, one received, three normal, none abnormal
    let (incoming, outgoing, discarded, normal, abnormal) = tcap_a.counters();
    assert_eq!(incoming, 1);
    assert_eq!(outgoing, 2);
    assert_eq!(discarded, 0);
    assert_eq!(normal, 3);
    assert_eq!(abnormal, 0);

    engine.stop().await;
}
