//! M2UA and IUA backhaul (RFC 3331 / RFC 4233)
//!
//! Both adaptations share one boundary-primitive grammar: establish and
//! release the far-side data link, then exchange data indications, all
//! scoped by an interface identifier. They differ in message class and in
//! what the payload is (MTP2 MSUs for M2UA, Q.921 user data for IUA).

use super::{class, decode_message, encode_message, param, SigtranReceiver, SigtranTransport, Tlvs};
use crate::engine::{SigComponent, TICK_IDLE};
use crate::errors::{LinkError, SigtranError};
use crate::mtp2::{L2Link, L2Op, Mtp2User};
use crate::types::Msu;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Which adaptation a backhaul link speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackhaulAdaptation {
    M2ua,
    Iua,
}

impl BackhaulAdaptation {
    fn class(&self) -> u8 {
        match self {
            Self::M2ua => class::MAUP,
            Self::Iua => class::QPTM,
        }
    }
}

/// Boundary primitive types within the adaptation's class
mod mtype {
    pub const DATA: u8 = 1;
    pub const ESTABLISH_REQ: u8 = 2;
    pub const ESTABLISH_CONFIRM: u8 = 3;
    pub const RELEASE_REQ: u8 = 4;
    pub const RELEASE_CONFIRM: u8 = 5;
    pub const RELEASE_IND: u8 = 6;
    pub const STATE_REQ: u8 = 7;
    pub const STATE_CONFIRM: u8 = 8;
    pub const STATE_IND: u8 = 9;
}

/// One backhauled signalling link identified by an interface identifier.
///
/// Presents the layer 2 contract upward; an IUA link delivers Q.921 user
/// data through the same surface.
pub struct BackhaulLink {
    name: String,
    adaptation: BackhaulAdaptation,
    interface_id: u32,
    /// Server side confirms establish requests
    server: bool,
    transport: RwLock<Option<Arc<dyn SigtranTransport>>>,
    user: RwLock<Weak<dyn Mtp2User>>,
    established: AtomicBool,
}

impl BackhaulLink {
    pub fn new(
        name: &str,
        adaptation: BackhaulAdaptation,
        interface_id: u32,
        server: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            adaptation,
            interface_id,
            server,
            transport: RwLock::new(None),
            user: RwLock::new(Weak::<NullUser>::new() as Weak<dyn Mtp2User>),
            established: AtomicBool::new(false),
        })
    }

    pub fn attach_transport(self: &Arc<Self>, transport: Arc<dyn SigtranTransport>) {
        transport.set_receiver(Arc::downgrade(self) as Weak<dyn SigtranReceiver>);
        *self.transport.write().unwrap() = Some(transport);
    }

    pub fn interface_id(&self) -> u32 {
        self.interface_id
    }

    pub fn adaptation(&self) -> BackhaulAdaptation {
        self.adaptation
    }

    fn send(&self, mtype: u8, payload: Option<&[u8]>) -> Result<(), SigtranError> {
        let iid = self.interface_id.to_be_bytes();
        let mut params: Vec<(u16, &[u8])> = vec![(param::INTERFACE_ID_INT, &iid)];
        if let Some(payload) = payload {
            params.push((param::PROTOCOL_DATA, payload));
        }
        let wire = encode_message(self.adaptation.class(), mtype, &params);
        let transport = self.transport.read().unwrap().clone();
        transport
            .ok_or_else(|| SigtranError::SendFailed("no transport".to_string()))?
            .send_message(wire)
    }

    /// Ask the far side to bring the physical link into service
    pub fn establish(&self) -> Result<(), SigtranError> {
        info!(link = %self.name, iid = self.interface_id, "establish request");
        self.send(mtype::ESTABLISH_REQ, None)
    }

    pub fn release_link(&self) -> Result<(), SigtranError> {
        self.send(mtype::RELEASE_REQ, None)
    }

    fn set_established(&self, up: bool) {
        if self.established.swap(up, Ordering::AcqRel) != up {
            let user = self.user.read().unwrap().upgrade();
            if let Some(user) = user {
                user.link_status(up);
            }
        }
    }

    fn handle(&self, mtype: u8, params: Tlvs) {
        match mtype {
            mtype::ESTABLISH_REQ => {
                if self.server {
                    let _ = self.send(mtype::ESTABLISH_CONFIRM, None);
                    self.set_established(true);
                }
            }
            mtype::ESTABLISH_CONFIRM => self.set_established(true),
            mtype::RELEASE_REQ => {
                let _ = self.send(mtype::RELEASE_CONFIRM, None);
                self.set_established(false);
            }
            mtype::RELEASE_CONFIRM | mtype::RELEASE_IND => self.set_established(false),
            mtype::DATA => {
                if !self.established.load(Ordering::Acquire) {
                    debug!(link = %self.name, "data while released");
                    return;
                }
                let Some(payload) = params.get(param::PROTOCOL_DATA) else {
                    warn!(link = %self.name, "data without payload");
                    return;
                };
                let user = self.user.read().unwrap().upgrade();
                if let Some(user) = user {
                    user.receive_msu(Msu(Bytes::copy_from_slice(payload)));
                }
            }
            mtype::STATE_REQ => {
                let _ = self.send(mtype::STATE_CONFIRM, None);
            }
            mtype::STATE_CONFIRM | mtype::STATE_IND => {}
            other => debug!(link = %self.name, mtype = other, "unhandled primitive"),
        }
    }
}

struct NullUser;

impl Mtp2User for NullUser {
    fn receive_msu(&self, _msu: Msu) {}

    fn link_status(&self, _operational: bool) {}
}

impl SigtranReceiver for BackhaulLink {
    fn receive_message(&self, data: Bytes) {
        match decode_message(&data) {
            Ok((mclass, mtype, params)) => {
                if mclass != self.adaptation.class() {
                    debug!(link = %self.name, mclass, "class for another adaptation");
                    return;
                }
                // The interface identifier scopes every primitive
                if let Some(iid) = params.get_u32(param::INTERFACE_ID_INT) {
                    if iid != self.interface_id {
                        return;
                    }
                }
                self.handle(mtype, params);
            }
            Err(err) => warn!(link = %self.name, %err, "undecodable message"),
        }
    }

    fn transport_status(&self, up: bool) {
        if !up {
            self.set_established(false);
        }
    }
}

impl L2Link for BackhaulLink {
    fn transmit_msu(&self, msu: &Msu) -> Result<(), LinkError> {
        if !self.established.load(Ordering::Acquire) {
            return Err(LinkError::NotAligned);
        }
        self.send(mtype::DATA, Some(&msu.0))
            .map_err(|e| LinkError::TransmitFailed(e.to_string()))
    }

    fn operational(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    fn set_user(&self, user: Weak<dyn Mtp2User>) {
        *self.user.write().unwrap() = user;
    }

    fn link_control(&self, op: L2Op) -> bool {
        match op {
            L2Op::Resume | L2Op::Align { .. } => self.establish().is_ok(),
            L2Op::Pause => self.release_link().is_ok(),
            L2Op::Status => {
                info!(link = %self.name, up = self.operational(), "backhaul status");
                true
            }
        }
    }

    fn congestion_level(&self) -> u8 {
        0
    }
}

#[async_trait]
impl SigComponent for BackhaulLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn component_type(&self) -> &'static str {
        match self.adaptation {
            BackhaulAdaptation::M2ua => "m2ua",
            BackhaulAdaptation::Iua => "iua",
        }
    }

    async fn tick(&self, _now: Instant) -> Duration {
        TICK_IDLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sigtran::LoopTransport;
    use std::sync::Mutex as StdMutex;

    struct Collect {
        msus: StdMutex<Vec<Msu>>,
        status: StdMutex<Vec<bool>>,
    }

    impl Collect {
        fn new() -> Arc<Self> {
            Arc::new(Self { msus: StdMutex::new(Vec::new()), status: StdMutex::new(Vec::new()) })
        }
    }

    impl Mtp2User for Collect {
        fn receive_msu(&self, msu: Msu) {
            self.msus.lock().unwrap().push(msu);
        }

        fn link_status(&self, operational: bool) {
            self.status.lock().unwrap().push(operational);
        }
    }

    fn pair(
        adaptation: BackhaulAdaptation,
    ) -> (Arc<BackhaulLink>, Arc<BackhaulLink>, Arc<LoopTransport>, Arc<LoopTransport>) {
        let (ta, tb) = LoopTransport::pair();
        let client = BackhaulLink::new("bhA", adaptation, 42, false);
        let server = BackhaulLink::new("bhB", adaptation, 42, true);
        client.attach_transport(ta.clone() as Arc<dyn SigtranTransport>);
        server.attach_transport(tb.clone() as Arc<dyn SigtranTransport>);
        (client, server, ta, tb)
    }

    fn pump(a: &LoopTransport, b: &LoopTransport) {
        for _ in 0..8 {
            if a.pump() + b.pump() == 0 {
                break;
            }
        }
    }

    #[test]
    fn establish_and_transfer() {
        let (client, server, ta, tb) = pair(BackhaulAdaptation::M2ua);
        let sink = Collect::new();
        server.set_user(Arc::downgrade(&sink) as Weak<dyn Mtp2User>);
        client.establish().unwrap();
        pump(&ta, &tb);
        assert!(client.operational());
        assert!(server.operational());
        assert_eq!(sink.status.lock().unwrap().as_slice(), &[true]);

        client.transmit_msu(&Msu(Bytes::from_static(&[0x85, 1, 2, 3, 4, 5]))).unwrap();
        pump(&ta, &tb);
        assert_eq!(sink.msus.lock().unwrap().len(), 1);
    }

    #[test]
    fn interface_id_scopes_traffic() {
        let (client, server, ta, tb) = pair(BackhaulAdaptation::Iua);
        // A primitive for another interface identifier is ignored
        let foreign = encode_message(
            class::QPTM,
            mtype::ESTABLISH_REQ,
            &[(param::INTERFACE_ID_INT, &7u32.to_be_bytes())],
        );
        server.receive_message(foreign);
        assert!(!server.operational());
        client.establish().unwrap();
        pump(&ta, &tb);
        assert!(server.operational());
    }

    #[test]
    fn release_tears_down_both_sides() {
        let (client, server, ta, tb) = pair(BackhaulAdaptation::M2ua);
        client.establish().unwrap();
        pump(&ta, &tb);
        client.release_link().unwrap();
        pump(&ta, &tb);
        assert!(!client.operational());
        assert!(!server.operational());
    }
}
