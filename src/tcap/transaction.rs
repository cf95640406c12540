//! TCAP transaction engine
//!
//! Transactions are keyed by a 4-byte local ID drawn from an atomic pool.
//! Incoming SCCP data queues on the engine's in-queue and is drained by
//! the component tick; invocation timers cancel overdue operations.

use super::components::{general_problem, OpClass, Problem, TcapComponent};
use super::{ComponentType, TcapDialect, TcapMessage, TransactionProblem, TransactionType};
use crate::config::TcapConfig;
use crate::engine::{ControlMap, SigComponent, SigTimer};
use crate::errors::TcapError;
use crate::sccp::{ProtocolClass, ReturnCause, SccpAddress, SccpBroadcast, SccpEngine, SccpUser};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    PackageSent,
    PackageReceived,
    Active,
}

/// Transmission state of the pending component batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitState {
    NoTransmit,
    PendingTransmit,
    Transmitted,
}

/// Invocation state of one local operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvokeState {
    OperationPending,
    OperationSent,
    WaitForReject,
}

struct InvokeRecord {
    id: i32,
    class: OpClass,
    state: InvokeState,
    timer: SigTimer,
}

/// One open transaction
pub struct TcapTransaction {
    pub local_id: u32,
    pub remote_id: Option<u32>,
    /// Owning user name, informational
    pub user: String,
    pub ttype: TransactionType,
    pub state: TxState,
    pub transmit: TransmitState,
    /// Basic end sends an End package; prearranged ends silently
    pub basic_end: bool,
    remote: SccpAddress,
    timeout: SigTimer,
    invokes: Vec<InvokeRecord>,
}

/// Indication delivered to the TCAP user
pub trait TcapUser: Send + Sync {
    fn user_name(&self) -> &str;

    /// A transaction primitive arrived with these components. Return
    /// false to refuse the dialog.
    fn handle_indication(
        &self,
        local_id: u32,
        primitive: TransactionType,
        components: &[TcapComponent],
    ) -> bool;
}

/// Per-engine message counters
#[derive(Default)]
struct Counters {
    incoming: AtomicU64,
    outgoing: AtomicU64,
    discarded: AtomicU64,
    normal: AtomicU64,
    abnormal: AtomicU64,
}

/// TCAP engine for one dialect over one SCCP subsystem
pub struct TcapEngine {
    name: String,
    cfg: RwLock<TcapConfig>,
    dialect: TcapDialect,
    local_ssn: u8,
    sccp: RwLock<Weak<SccpEngine>>,
    transactions: DashMap<u32, TcapTransaction>,
    next_tid: AtomicU32,
    in_queue: Mutex<VecDeque<(Bytes, SccpAddress, SccpAddress)>>,
    user: RwLock<Weak<dyn TcapUser>>,
    counters: Counters,
}

impl TcapEngine {
    pub fn new(name: &str, cfg: TcapConfig, local_ssn: u8) -> Arc<Self> {
        let dialect = TcapDialect::from_name(&cfg.dialect);
        Arc::new(Self {
            name: name.to_string(),
            dialect,
            local_ssn,
            sccp: RwLock::new(Weak::new()),
            transactions: DashMap::new(),
            next_tid: AtomicU32::new(1),
            in_queue: Mutex::new(VecDeque::new()),
            user: RwLock::new(Weak::<NullUser>::new() as Weak<dyn TcapUser>),
            counters: Counters::default(),
            cfg: RwLock::new(cfg),
        })
    }

    pub fn dialect(&self) -> TcapDialect {
        self.dialect
    }

    pub fn attach_sccp(self: &Arc<Self>, sccp: &Arc<SccpEngine>) {
        *self.sccp.write().unwrap() = Arc::downgrade(sccp);
        let user: Arc<dyn SccpUser> = self.clone();
        sccp.attach_user(&user);
    }

    pub fn set_user(&self, user: &Arc<dyn TcapUser>) {
        *self.user.write().unwrap() = Arc::downgrade(user);
        // The user's subsystem is in service once it attaches
        if let Some(sccp) = self.sccp.read().unwrap().upgrade() {
            sccp.set_user_status(self.local_ssn, true);
        }
    }

    /// Broadcast the user's subsystem leaving or re-entering service
    pub fn set_user_in_service(&self, in_service: bool) {
        if let Some(sccp) = self.sccp.read().unwrap().upgrade() {
            sccp.set_user_status(self.local_ssn, in_service);
        }
    }

    /// (incoming, outgoing, discarded, normal, abnormal)
    pub fn counters(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.counters.incoming.load(Ordering::Relaxed),
            self.counters.outgoing.load(Ordering::Relaxed),
            self.counters.discarded.load(Ordering::Relaxed),
            self.counters.normal.load(Ordering::Relaxed),
            self.counters.abnormal.load(Ordering::Relaxed),
        )
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn transaction_state(&self, local_id: u32) -> Option<TxState> {
        self.transactions.get(&local_id).map(|t| t.state)
    }

    fn allocate_tid(&self) -> Result<u32, TcapError> {
        for _ in 0..u16::MAX as usize {
            let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
            if tid != 0 && !self.transactions.contains_key(&tid) {
                return Ok(tid);
            }
        }
        Err(TcapError::NoTransactionId)
    }

    fn send(&self, msg: &TcapMessage, remote: &SccpAddress) -> Result<(), TcapError> {
        let wire = msg.encode(self.dialect)?;
        let sccp = self.sccp.read().unwrap().upgrade().ok_or(TcapError::InvalidState(
            "no SCCP attached",
        ))?;
        let calling = sccp.local_address(self.local_ssn);
        sccp.send_unitdata(remote, &calling, ProtocolClass::CLASS_0.with_return(), &wire)?;
        self.counters.outgoing.fetch_add(1, Ordering::Relaxed);
        self.counters.normal.fetch_add(1, Ordering::Relaxed);
        counter!("telsig_tcap_tx", "engine" => self.name.clone()).increment(1);
        Ok(())
    }

    fn invoke_records(&self, components: &[TcapComponent], timeout_ms: u64) -> Vec<InvokeRecord> {
        components
            .iter()
            .filter(|c| matches!(c.ctype, ComponentType::Invoke | ComponentType::InvokeNotLast))
            .filter_map(|c| c.invoke_id)
            .map(|id| {
                let mut timer = SigTimer::new(timeout_ms);
                timer.start(Instant::now());
                InvokeRecord {
                    id,
                    class: OpClass::SuccessOrFailureReport,
                    state: InvokeState::OperationPending,
                    timer,
                }
            })
            .collect()
    }

    /// Open a dialog: Begin (ITU) / QueryWithPermission (ANSI)
    pub fn begin(
        &self,
        remote: SccpAddress,
        app_context: &[u32],
        components: Vec<TcapComponent>,
    ) -> Result<u32, TcapError> {
        let local_id = self.allocate_tid()?;
        let mut msg = TcapMessage::new(TransactionType::Begin);
        msg.otid = Some(local_id);
        if !app_context.is_empty() {
            msg.dialog = Some(super::DialogPortion::with_context(app_context));
        }
        msg.components = components;
        self.send(&msg, &remote)?;
        let cfg = self.cfg.read().unwrap();
        let mut timeout = SigTimer::new(cfg.transaction_timeout_ms);
        timeout.start(Instant::now());
        let mut invokes = self.invoke_records(&msg.components, cfg.transaction_timeout_ms);
        drop(cfg);
        for record in &mut invokes {
            record.state = InvokeState::OperationSent;
        }
        info!(engine = %self.name, tid = local_id, "transaction started");
        self.transactions.insert(
            local_id,
            TcapTransaction {
                local_id,
                remote_id: None,
                user: String::new(),
                ttype: TransactionType::Begin,
                state: TxState::PackageSent,
                transmit: TransmitState::Transmitted,
                basic_end: true,
                remote,
                timeout,
                invokes,
            },
        );
        Ok(local_id)
    }

    /// Continue an established dialog
    pub fn continue_transaction(
        &self,
        local_id: u32,
        components: Vec<TcapComponent>,
    ) -> Result<(), TcapError> {
        let (remote, remote_id, invokes) = {
            let mut tx = self
                .transactions
                .get_mut(&local_id)
                .ok_or(TcapError::TransactionNotFound(local_id))?;
            let remote_id = tx.remote_id.ok_or(TcapError::InvalidState("no remote id yet"))?;
            tx.state = TxState::Active;
            tx.timeout.start(Instant::now());
            let timeout_ms = self.cfg.read().unwrap().transaction_timeout_ms;
            let records = self.invoke_records(&components, timeout_ms);
            (tx.remote.clone(), remote_id, records)
        };
        let mut msg = TcapMessage::new(TransactionType::Continue);
        msg.otid = Some(local_id);
        msg.dtid = Some(remote_id);
        msg.components = components;
        self.send(&msg, &remote)?;
        if let Some(mut tx) = self.transactions.get_mut(&local_id) {
            tx.invokes.extend(invokes.into_iter().map(|mut record| {
                record.state = InvokeState::OperationSent;
                record
            }));
        }
        Ok(())
    }

    /// Close a dialog. Basic end sends the End package; a prearranged end
    /// removes local state only.
    pub fn end(
        &self,
        local_id: u32,
        components: Vec<TcapComponent>,
        basic: bool,
    ) -> Result<(), TcapError> {
        let (_, tx) = self
            .transactions
            .remove(&local_id)
            .ok_or(TcapError::TransactionNotFound(local_id))?;
        if basic {
            let mut msg = TcapMessage::new(TransactionType::End);
            msg.dtid = tx.remote_id;
            msg.components = components;
            self.send(&msg, &tx.remote)?;
        }
        info!(engine = %self.name, tid = local_id, basic, "transaction ended");
        Ok(())
    }

    /// Abort a dialog with user information
    pub fn u_abort(&self, local_id: u32, info: Vec<u8>) -> Result<(), TcapError> {
        let (_, tx) = self
            .transactions
            .remove(&local_id)
            .ok_or(TcapError::TransactionNotFound(local_id))?;
        let mut msg = TcapMessage::new(TransactionType::Abort);
        msg.dtid = tx.remote_id;
        msg.u_abort = Some(info);
        self.counters.abnormal.fetch_add(1, Ordering::Relaxed);
        self.send(&msg, &tx.remote)
    }

    fn p_abort(&self, remote_id: u32, remote: &SccpAddress, cause: TransactionProblem) {
        let mut msg = TcapMessage::new(TransactionType::Abort);
        msg.dtid = Some(remote_id);
        msg.p_abort = Some(cause);
        self.counters.abnormal.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.send(&msg, remote) {
            debug!(engine = %self.name, %err, "failed to send abort");
        }
    }

    fn deliver(&self, local_id: u32, primitive: TransactionType, components: &[TcapComponent]) {
        let user = self.user.read().unwrap().upgrade();
        if let Some(user) = user {
            user.handle_indication(local_id, primitive, components);
        }
    }

    /// Match answers against outstanding invokes, producing rejects for
    /// stray answers
    fn reconcile_components(&self, local_id: u32, components: &[TcapComponent]) {
        let Some(mut tx) = self.transactions.get_mut(&local_id) else {
            return;
        };
        for component in components {
            match component.ctype {
                ComponentType::ResultLast | ComponentType::ReturnError => {
                    let Some(id) = component.invoke_id else { continue };
                    let found = tx.invokes.iter().position(|r| r.id == id);
                    match found {
                        Some(at) => {
                            let record = &tx.invokes[at];
                            let expected = match component.ctype {
                                ComponentType::ResultLast => record.class.expects_result(),
                                _ => record.class.expects_error(),
                            };
                            if expected {
                                tx.invokes.remove(at);
                            } else {
                                tx.invokes[at].state = InvokeState::WaitForReject;
                            }
                        }
                        None => {
                            debug!(engine = %self.name, id, "answer for unknown invoke");
                        }
                    }
                }
                ComponentType::ResultNotLast => {}
                ComponentType::Reject => {
                    self.counters.abnormal.fetch_add(1, Ordering::Relaxed);
                    if let Some(id) = component.invoke_id {
                        tx.invokes.retain(|r| r.id != id);
                    }
                }
                _ => {}
            }
        }
    }

    fn process_message(&self, data: &Bytes, calling: &SccpAddress) {
        self.counters.incoming.fetch_add(1, Ordering::Relaxed);
        counter!("telsig_tcap_rx", "engine" => self.name.clone()).increment(1);
        let msg = match TcapMessage::decode(self.dialect, data) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(engine = %self.name, %err, "undecodable TCAP message");
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        match msg.ttype {
            TransactionType::Unidirectional => {
                self.counters.normal.fetch_add(1, Ordering::Relaxed);
                self.deliver(0, TransactionType::Unidirectional, &msg.components);
            }
            TransactionType::Begin | TransactionType::QueryWithoutPerm => {
                let Some(remote_id) = msg.otid else {
                    self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                let Ok(local_id) = self.allocate_tid() else {
                    self.p_abort(remote_id, calling, TransactionProblem::ResourceUnavailable);
                    return;
                };
                let cfg = self.cfg.read().unwrap();
                let mut timeout = SigTimer::new(cfg.transaction_timeout_ms);
                drop(cfg);
                timeout.start(Instant::now());
                self.transactions.insert(
                    local_id,
                    TcapTransaction {
                        local_id,
                        remote_id: Some(remote_id),
                        user: String::new(),
                        ttype: msg.ttype,
                        state: TxState::PackageReceived,
                        transmit: TransmitState::NoTransmit,
                        basic_end: true,
                        remote: calling.clone(),
                        timeout,
                        invokes: Vec::new(),
                    },
                );
                self.counters.normal.fetch_add(1, Ordering::Relaxed);
                self.deliver(local_id, msg.ttype, &msg.components);
            }
            TransactionType::Continue | TransactionType::ConversationWithoutPerm => {
                let Some(local_id) = msg.dtid else {
                    self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                if !self.transactions.contains_key(&local_id) {
                    if let Some(remote_id) = msg.otid {
                        self.p_abort(remote_id, calling, TransactionProblem::UnrecognizedTxId);
                    }
                    self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                if let Some(mut tx) = self.transactions.get_mut(&local_id) {
                    if tx.remote_id.is_none() {
                        tx.remote_id = msg.otid;
                    }
                    tx.state = TxState::Active;
                    tx.timeout.start(Instant::now());
                }
                self.counters.normal.fetch_add(1, Ordering::Relaxed);
                self.reconcile_components(local_id, &msg.components);
                self.deliver(local_id, msg.ttype, &msg.components);
            }
            TransactionType::End => {
                let Some(local_id) = msg.dtid else {
                    self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                if self.transactions.remove(&local_id).is_none() {
                    self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                self.counters.normal.fetch_add(1, Ordering::Relaxed);
                self.deliver(local_id, TransactionType::End, &msg.components);
            }
            TransactionType::Abort => {
                let Some(local_id) = msg.dtid else {
                    self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                if self.transactions.remove(&local_id).is_some() {
                    self.counters.abnormal.fetch_add(1, Ordering::Relaxed);
                    self.deliver(local_id, TransactionType::Abort, &msg.components);
                } else {
                    self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                }
            }
            TransactionType::Notice => {}
        }
    }
}

struct NullUser;

impl TcapUser for NullUser {
    fn user_name(&self) -> &str {
        "null"
    }

    fn handle_indication(&self, _: u32, _: TransactionType, _: &[TcapComponent]) -> bool {
        false
    }
}

impl SccpUser for TcapEngine {
    fn ssn(&self) -> u8 {
        self.local_ssn
    }

    fn receive_data(&self, data: Bytes, _called: &SccpAddress, calling: &SccpAddress) -> bool {
        // Queue for the tick; SCCP's thread returns immediately
        self.in_queue.lock().unwrap().push_back((
            data,
            _called.clone(),
            calling.clone(),
        ));
        true
    }

    fn receive_notice(
        &self,
        cause: ReturnCause,
        _data: Bytes,
        _called: &SccpAddress,
        _calling: &SccpAddress,
    ) {
        warn!(engine = %self.name, ?cause, "message returned by the network");
        self.counters.abnormal.fetch_add(1, Ordering::Relaxed);
    }

    fn management_status(&self, status: SccpBroadcast) {
        debug!(engine = %self.name, ?status, "management broadcast");
    }
}

#[async_trait]
impl SigComponent for TcapEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn component_type(&self) -> &'static str {
        "tcap"
    }

    async fn initialize(&self, config: &serde_json::Value) -> bool {
        match serde_json::from_value::<TcapConfig>(config.clone()) {
            Ok(cfg) => {
                *self.cfg.write().unwrap() = cfg;
                true
            }
            Err(err) => {
                warn!(engine = %self.name, %err, "bad TCAP configuration");
                false
            }
        }
    }

    async fn tick(&self, now: Instant) -> Duration {
        // Drain the in-queue
        loop {
            let next = self.in_queue.lock().unwrap().pop_front();
            match next {
                Some((data, _called, calling)) => self.process_message(&data, &calling),
                None => break,
            }
        }
        // Inactivity timeouts and invocation timers
        let mut expired: Vec<u32> = Vec::new();
        let mut cancelled: Vec<(u32, i32)> = Vec::new();
        for mut entry in self.transactions.iter_mut() {
            if entry.timeout.fired(now) {
                expired.push(entry.local_id);
                continue;
            }
            let tid = entry.local_id;
            entry.invokes.retain_mut(|record| {
                if record.timer.fired(now) {
                    cancelled.push((tid, record.id));
                    false
                } else {
                    true
                }
            });
        }
        for (tid, invoke_id) in cancelled {
            // Local cancel: the operation never completed
            debug!(engine = %self.name, tid, invoke_id, "invocation timed out");
            self.deliver(
                tid,
                TransactionType::Notice,
                &[TcapComponent::reject(
                    Some(invoke_id),
                    Problem::General(general_problem::UNRECOGNIZED_COMPONENT),
                )],
            );
        }
        for tid in expired {
            if let Some((_, tx)) = self.transactions.remove(&tid) {
                warn!(engine = %self.name, tid, "transaction inactivity timeout");
                self.counters.abnormal.fetch_add(1, Ordering::Relaxed);
                if tx.basic_end && tx.remote_id.is_some() {
                    let mut msg = TcapMessage::new(TransactionType::Abort);
                    msg.dtid = tx.remote_id;
                    msg.p_abort = Some(TransactionProblem::ResourceUnavailable);
                    let _ = self.send(&msg, &tx.remote);
                }
                self.deliver(tid, TransactionType::Abort, &[]);
            }
        }
        Duration::from_millis(20)
    }

    async fn control(&self, params: &ControlMap) -> bool {
        if params.operation == "status" {
            let (incoming, outgoing, discarded, normal, abnormal) = self.counters();
            info!(
                engine = %self.name,
                transactions = self.transaction_count(),
                incoming, outgoing, discarded, normal, abnormal,
                "tcap status"
            );
            return true;
        }
        false
    }

    async fn destroyed(&self) {
        self.transactions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PointCode;

    fn engine() -> Arc<TcapEngine> {
        TcapEngine::new("tcap1", TcapConfig::default(), 8)
    }

    fn remote() -> SccpAddress {
        SccpAddress::from_ssn_pc(8, PointCode::new(2, 2, 2))
    }

    #[tokio::test]
    async fn begin_without_sccp_fails_cleanly() {
        let e = engine();
        let result = e.begin(remote(), &[], vec![TcapComponent::invoke(5, 1, None)]);
        assert!(result.is_err());
        assert_eq!(e.transaction_count(), 0);
    }

    #[test]
    fn incoming_begin_creates_transaction() {
        tokio_test::block_on(async {
            let e = engine();
            let mut msg = TcapMessage::new(TransactionType::Begin);
            msg.otid = Some(0x1000);
            msg.components.push(TcapComponent::invoke(5, 1, None));
            let wire = msg.encode(TcapDialect::Itu).unwrap();
            e.receive_data(wire, &remote(), &remote());
            e.tick(Instant::now()).await;
            assert_eq!(e.transaction_count(), 1);
            let (incoming, _, _, normal, _) = e.counters();
            assert_eq!(incoming, 1);
            assert_eq!(normal, 1);
        });
    }

    #[tokio::test]
    async fn end_removes_transaction() {
        let e = engine();
        let mut msg = TcapMessage::new(TransactionType::Begin);
        msg.otid = Some(0x2000);
        let wire = msg.encode(TcapDialect::Itu).unwrap();
        e.receive_data(wire, &remote(), &remote());
        e.tick(Instant::now()).await;
        let local_id = *e.transactions.iter().next().unwrap().key();

        let mut end = TcapMessage::new(TransactionType::End);
        end.dtid = Some(local_id);
        let wire = end.encode(TcapDialect::Itu).unwrap();
        e.receive_data(wire, &remote(), &remote());
        e.tick(Instant::now()).await;
        assert_eq!(e.transaction_count(), 0);
    }

    #[tokio::test]
    async fn unknown_continue_is_discarded() {
        let e = engine();
        let mut msg = TcapMessage::new(TransactionType::Continue);
        msg.otid = Some(7);
        msg.dtid = Some(0x5555);
        let wire = msg.encode(TcapDialect::Itu).unwrap();
        e.receive_data(wire, &remote(), &remote());
        e.tick(Instant::now()).await;
        let (_, _, discarded, _, _) = e.counters();
        assert_eq!(discarded, 1);
    }

    #[tokio::test]
    async fn inactivity_timeout_removes_transaction() {
        let e = engine();
        let mut msg = TcapMessage::new(TransactionType::Begin);
        msg.otid = Some(0x3000);
        let wire = msg.encode(TcapDialect::Itu).unwrap();
        e.receive_data(wire, &remote(), &remote());
        e.tick(Instant::now()).await;
        assert_eq!(e.transaction_count(), 1);
        e.tick(Instant::now() + Duration::from_secs(60)).await;
        assert_eq!(e.transaction_count(), 0);
    }
}
