//! XUDT/LUDT reassembly
//!
//! Segment batches are keyed by the calling party, the segmentation local
//! reference and the MTP origin. Reassembly completes when the remaining
//! count reaches zero; stale batches are purged on tick.

use super::address::{SccpAddress, SccpDialect};
use super::messages::Segmentation;
use crate::mtp3::Label;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Identity of one in-progress reassembly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReassemblyKey {
    calling: u64,
    reference: u32,
    origin: u32,
}

impl ReassemblyKey {
    pub fn new(
        dialect: SccpDialect,
        calling: &SccpAddress,
        segmentation: &Segmentation,
        label: &Label,
    ) -> Self {
        Self {
            calling: calling.digest(dialect),
            reference: segmentation.reference,
            origin: label.opc.pack(label.pc_type),
        }
    }
}

struct Pending {
    data: BytesMut,
    /// Segments the sender still owes us
    remaining: u8,
    deadline: Instant,
}

/// Per-engine reassembler with a bounded lifetime per batch
pub struct Reassembler {
    pending: DashMap<ReassemblyKey, Pending>,
    timeout: Duration,
}

/// Outcome of adding one segment
#[derive(Debug, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Batch complete; the payload is byte-identical to the source
    Complete(Bytes),
    /// More segments expected
    Pending,
    /// Segment did not fit any batch
    Rejected,
}

impl Reassembler {
    pub fn new(timeout_ms: u64) -> Self {
        Self { pending: DashMap::new(), timeout: Duration::from_millis(timeout_ms) }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn add_segment(
        &self,
        key: ReassemblyKey,
        segmentation: &Segmentation,
        payload: &Bytes,
        now: Instant,
    ) -> SegmentOutcome {
        if segmentation.first {
            if segmentation.remaining == 0 {
                // A single-segment batch is already whole
                return SegmentOutcome::Complete(payload.clone());
            }
            let mut data = BytesMut::with_capacity(payload.len() * (segmentation.remaining as usize + 1));
            data.extend_from_slice(payload);
            self.pending.insert(
                key,
                Pending { data, remaining: segmentation.remaining, deadline: now + self.timeout },
            );
            return SegmentOutcome::Pending;
        }
        let Some(mut entry) = self.pending.get_mut(&key) else {
            warn!("segment without a first segment, dropping");
            return SegmentOutcome::Rejected;
        };
        if segmentation.remaining + 1 != entry.remaining {
            // Out-of-order or duplicated segment ends the batch
            drop(entry);
            self.pending.remove(&key);
            return SegmentOutcome::Rejected;
        }
        entry.data.extend_from_slice(payload);
        entry.remaining = segmentation.remaining;
        if entry.remaining == 0 {
            drop(entry);
            if let Some((_, done)) = self.pending.remove(&key) {
                debug!(len = done.data.len(), "reassembly complete");
                return SegmentOutcome::Complete(done.data.freeze());
            }
            return SegmentOutcome::Rejected;
        }
        SegmentOutcome::Pending
    }

    /// Drop batches whose reassembly timer expired; returns how many
    pub fn purge(&self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.deadline > now);
        before - self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PcType, PointCode};

    fn key() -> ReassemblyKey {
        let calling = SccpAddress::from_ssn_pc(6, PointCode::new(1, 1, 1));
        let label =
            Label::new(PcType::Itu, PointCode::new(2, 2, 2), PointCode::new(3, 3, 3), 0);
        let seg = Segmentation { first: true, class1: false, remaining: 2, reference: 99 };
        ReassemblyKey::new(SccpDialect::Itu, &calling, &seg, &label)
    }

    fn seg(first: bool, remaining: u8) -> Segmentation {
        Segmentation { first, class1: false, remaining, reference: 99 }
    }

    #[test]
    fn three_segments_reassemble_in_order() {
        let r = Reassembler::new(10_000);
        let now = Instant::now();
        let k = key();
        assert_eq!(
            r.add_segment(k, &seg(true, 2), &Bytes::from_static(b"aaa"), now),
            SegmentOutcome::Pending
        );
        assert_eq!(
            r.add_segment(k, &seg(false, 1), &Bytes::from_static(b"bbb"), now),
            SegmentOutcome::Pending
        );
        match r.add_segment(k, &seg(false, 0), &Bytes::from_static(b"ccc"), now) {
            SegmentOutcome::Complete(data) => assert_eq!(data.as_ref(), b"aaabbbccc"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn out_of_order_segment_aborts() {
        let r = Reassembler::new(10_000);
        let now = Instant::now();
        let k = key();
        r.add_segment(k, &seg(true, 2), &Bytes::from_static(b"aaa"), now);
        assert_eq!(
            r.add_segment(k, &seg(false, 0), &Bytes::from_static(b"ccc"), now),
            SegmentOutcome::Rejected
        );
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn orphan_segment_rejected() {
        let r = Reassembler::new(10_000);
        assert_eq!(
            r.add_segment(key(), &seg(false, 1), &Bytes::from_static(b"x"), Instant::now()),
            SegmentOutcome::Rejected
        );
    }

    #[test]
    fn purge_expires_stale_batches() {
        let r = Reassembler::new(10);
        let now = Instant::now();
        r.add_segment(key(), &seg(true, 2), &Bytes::from_static(b"aaa"), now);
        assert_eq!(r.purge(now), 0);
        assert_eq!(r.purge(now + Duration::from_millis(20)), 1);
        assert_eq!(r.pending_count(), 0);
    }
}
