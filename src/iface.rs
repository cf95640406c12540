//! Signalling interface abstraction
//!
//! An interface sends and receives raw packets for one signalling channel
//! and surfaces link-level events. Data links attach as the interface's
//! receiver; real transports queue I/O on their own tasks so that packet
//! delivery never blocks the engine tick.

use crate::engine::{LinkEvent, SigComponent};
use crate::errors::LinkError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// Upward half of an interface pairing: accepts packets and events
pub trait PacketReceiver: Send + Sync {
    fn receive_packet(&self, packet: Bytes);

    fn link_event(&self, event: LinkEvent);
}

/// Interface control operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceOp {
    Enable,
    Disable,
    Query,
}

/// Hardware/transport abstraction under a layer 2
pub trait SigInterface: Send + Sync {
    /// Queue one packet for transmission. `repeated` marks a fill unit the
    /// hardware may retransmit on its own until new data arrives.
    fn transmit_packet(&self, packet: &[u8], repeated: bool) -> Result<(), LinkError>;

    fn set_receiver(&self, receiver: Weak<dyn PacketReceiver>);

    fn up(&self) -> bool;

    fn interface_control(&self, op: InterfaceOp) -> bool;
}

/// In-process interface pair delivering each side's transmissions to the
/// other side's receiver on the engine tick.
///
/// Stands in for a hardware span in tests and back-to-back setups.
pub struct LoopInterface {
    name: String,
    peer: Mutex<Weak<LoopInterface>>,
    receiver: RwLock<Weak<dyn PacketReceiver>>,
    inbox: Mutex<VecDeque<Bytes>>,
    enabled: AtomicBool,
}

impl LoopInterface {
    /// Build a crossed pair; packets sent on one side arrive on the other.
    pub fn pair(name_a: &str, name_b: &str) -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::new(name_a));
        let b = Arc::new(Self::new(name_b));
        *a.peer.lock().unwrap() = Arc::downgrade(&b);
        *b.peer.lock().unwrap() = Arc::downgrade(&a);
        (a, b)
    }

    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            peer: Mutex::new(Weak::new()),
            receiver: RwLock::new(Weak::<NullReceiver>::new() as Weak<dyn PacketReceiver>),
            inbox: Mutex::new(VecDeque::new()),
            enabled: AtomicBool::new(true),
        }
    }

    fn push(&self, packet: Bytes) {
        self.inbox.lock().unwrap().push_back(packet);
    }

    /// Deliver every queued packet to the receiver. Returns the count.
    pub fn pump(&self) -> usize {
        let receiver = self.receiver.read().unwrap().upgrade();
        let Some(receiver) = receiver else {
            return 0;
        };
        let mut count = 0;
        loop {
            let packet = self.inbox.lock().unwrap().pop_front();
            match packet {
                Some(packet) => {
                    receiver.receive_packet(packet);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }
}

struct NullReceiver;

impl PacketReceiver for NullReceiver {
    fn receive_packet(&self, _packet: Bytes) {}

    fn link_event(&self, _event: LinkEvent) {}
}

impl SigInterface for LoopInterface {
    fn transmit_packet(&self, packet: &[u8], _repeated: bool) -> Result<(), LinkError> {
        if !self.enabled.load(Ordering::Acquire) {
            return Err(LinkError::LinkDown);
        }
        let peer = self.peer.lock().unwrap().upgrade();
        match peer {
            Some(peer) if peer.enabled.load(Ordering::Acquire) => {
                peer.push(Bytes::copy_from_slice(packet));
                Ok(())
            }
            _ => Err(LinkError::LinkDown),
        }
    }

    fn set_receiver(&self, receiver: Weak<dyn PacketReceiver>) {
        *self.receiver.write().unwrap() = receiver;
    }

    fn up(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn interface_control(&self, op: InterfaceOp) -> bool {
        match op {
            InterfaceOp::Enable => {
                if !self.enabled.swap(true, Ordering::AcqRel) {
                    debug!(name = %self.name, "interface enabled");
                    if let Some(receiver) = self.receiver.read().unwrap().upgrade() {
                        receiver.link_event(LinkEvent::LinkUp);
                    }
                }
                true
            }
            InterfaceOp::Disable => {
                if self.enabled.swap(false, Ordering::AcqRel) {
                    debug!(name = %self.name, "interface disabled");
                    self.inbox.lock().unwrap().clear();
                    if let Some(receiver) = self.receiver.read().unwrap().upgrade() {
                        receiver.link_event(LinkEvent::LinkDown);
                    }
                }
                true
            }
            InterfaceOp::Query => self.enabled.load(Ordering::Acquire),
        }
    }
}

#[async_trait]
impl SigComponent for LoopInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn component_type(&self) -> &'static str {
        "loop-interface"
    }

    async fn tick(&self, _now: Instant) -> Duration {
        let delivered = self.pump();
        if delivered > 0 {
            // More traffic may already be queued on the far side
            Duration::from_micros(500)
        } else {
            Duration::from_millis(5)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Sink {
        packets: StdMutex<Vec<Bytes>>,
        events: StdMutex<Vec<LinkEvent>>,
    }

    impl Sink {
        fn new() -> Arc<Self> {
            Arc::new(Self { packets: StdMutex::new(Vec::new()), events: StdMutex::new(Vec::new()) })
        }
    }

    impl PacketReceiver for Sink {
        fn receive_packet(&self, packet: Bytes) {
            self.packets.lock().unwrap().push(packet);
        }

        fn link_event(&self, event: LinkEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn crossed_delivery() {
        let (a, b) = LoopInterface::pair("ifA", "ifB");
        let sink = Sink::new();
        b.set_receiver(Arc::downgrade(&sink) as Weak<dyn PacketReceiver>);

        a.transmit_packet(&[1, 2, 3], false).unwrap();
        assert!(sink.packets.lock().unwrap().is_empty());
        assert_eq!(b.pump(), 1);
        assert_eq!(sink.packets.lock().unwrap()[0].as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn disable_blocks_and_notifies() {
        let (a, b) = LoopInterface::pair("ifA", "ifB");
        let sink = Sink::new();
        a.set_receiver(Arc::downgrade(&sink) as Weak<dyn PacketReceiver>);

        a.interface_control(InterfaceOp::Disable);
        assert!(matches!(a.transmit_packet(&[0], false), Err(LinkError::LinkDown)));
        assert!(matches!(b.transmit_packet(&[0], false), Err(LinkError::LinkDown)));
        a.interface_control(InterfaceOp::Enable);
        assert_eq!(
            sink.events.lock().unwrap().as_slice(),
            &[LinkEvent::LinkDown, LinkEvent::LinkUp]
        );
        assert!(b.transmit_packet(&[0], false).is_ok());
    }
}
