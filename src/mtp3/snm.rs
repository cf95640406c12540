//! Signalling network management (Q.704 chapter 15)
//!
//! SNM messages ride service indicator 0. The codec is a heading octet
//! (H0 low nibble, H1 high nibble) followed by the group's payload; point
//! codes travel packed, least significant octet first.

use super::{Label, Mtp3User, RouteState};
use crate::types::{PcType, PointCode, Sio};
use crate::{si, upu_cause};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Weak;
use tracing::{debug, warn};

/// One management message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnmMsg {
    /// Changeover order, FSN of last accepted unit
    Coo { fsn: u8 },
    Coa { fsn: u8 },
    /// Changeback declaration/acknowledgement
    Cbd { code: u8 },
    Cba { code: u8 },
    /// Emergency changeover
    Eco,
    Eca,
    /// Transfer controlled (congestion)
    Tfc { dest: PointCode, status: u8 },
    Tfp { dest: PointCode },
    Tfr { dest: PointCode },
    Tfa { dest: PointCode },
    /// Route set test for prohibited/restricted destination
    Rst { dest: PointCode },
    Rsr { dest: PointCode },
    /// Inhibit dialog; the SLC rides in the label
    Lin,
    Lun,
    Lia,
    Lua,
    Lid,
    Lfu,
    Llt,
    Lrt,
    /// Traffic restart allowed
    Tra,
    /// User part unavailable
    Upu { dest: PointCode, part: u8, cause: u8 },
}

impl SnmMsg {
    fn heading(&self) -> u8 {
        // H0 in the low nibble, H1 in the high nibble
        match self {
            Self::Coo { .. } => 0x11,
            Self::Coa { .. } => 0x21,
            Self::Cbd { .. } => 0x51,
            Self::Cba { .. } => 0x61,
            Self::Eco => 0x12,
            Self::Eca => 0x22,
            Self::Tfc { .. } => 0x23,
            Self::Tfp { .. } => 0x14,
            Self::Tfr { .. } => 0x34,
            Self::Tfa { .. } => 0x54,
            Self::Rst { .. } => 0x15,
            Self::Rsr { .. } => 0x25,
            Self::Lin => 0x16,
            Self::Lun => 0x26,
            Self::Lia => 0x36,
            Self::Lua => 0x46,
            Self::Lid => 0x56,
            Self::Lfu => 0x66,
            Self::Llt => 0x76,
            Self::Lrt => 0x86,
            Self::Tra => 0x17,
            Self::Upu { .. } => 0x1A,
        }
    }

    pub fn encode(&self, pc_type: PcType) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + pc_type.octets() + 1);
        buf.put_u8(self.heading());
        match self {
            Self::Coo { fsn } | Self::Coa { fsn } => buf.put_u8(*fsn & 0x7F),
            Self::Cbd { code } | Self::Cba { code } => buf.put_u8(*code),
            Self::Tfc { dest, status } => {
                put_pc(&mut buf, pc_type, *dest);
                buf.put_u8(*status & 0x03);
            }
            Self::Tfp { dest } | Self::Tfr { dest } | Self::Tfa { dest } | Self::Rst { dest }
            | Self::Rsr { dest } => {
                put_pc(&mut buf, pc_type, *dest);
            }
            Self::Upu { dest, part, cause } => {
                put_pc(&mut buf, pc_type, *dest);
                buf.put_u8((part & 0x0F) | (cause << 4));
            }
            _ => {}
        }
        buf.freeze()
    }

    pub fn decode(pc_type: PcType, mut data: Bytes) -> Option<Self> {
        if data.is_empty() {
            return None;
        }
        let heading = data.get_u8();
        let msg = match heading {
            0x11 => Self::Coo { fsn: byte(&mut data)? & 0x7F },
            0x21 => Self::Coa { fsn: byte(&mut data)? & 0x7F },
            0x51 => Self::Cbd { code: byte(&mut data)? },
            0x61 => Self::Cba { code: byte(&mut data)? },
            0x12 => Self::Eco,
            0x22 => Self::Eca,
            0x23 => Self::Tfc { dest: get_pc(&mut data, pc_type)?, status: byte(&mut data)? & 0x03 },
            0x14 => Self::Tfp { dest: get_pc(&mut data, pc_type)? },
            0x34 => Self::Tfr { dest: get_pc(&mut data, pc_type)? },
            0x54 => Self::Tfa { dest: get_pc(&mut data, pc_type)? },
            0x15 => Self::Rst { dest: get_pc(&mut data, pc_type)? },
            0x25 => Self::Rsr { dest: get_pc(&mut data, pc_type)? },
            0x16 => Self::Lin,
            0x26 => Self::Lun,
            0x36 => Self::Lia,
            0x46 => Self::Lua,
            0x56 => Self::Lid,
            0x66 => Self::Lfu,
            0x76 => Self::Llt,
            0x86 => Self::Lrt,
            0x17 => Self::Tra,
            0x1A => {
                let dest = get_pc(&mut data, pc_type)?;
                let b = byte(&mut data)?;
                Self::Upu { dest, part: b & 0x0F, cause: b >> 4 }
            }
            _ => return None,
        };
        Some(msg)
    }
}

fn put_pc(buf: &mut BytesMut, pc_type: PcType, pc: PointCode) {
    let packed = pc.pack(pc_type);
    for i in 0..pc_type.octets() {
        buf.put_u8(((packed >> (8 * i)) & 0xFF) as u8);
    }
}

fn get_pc(data: &mut Bytes, pc_type: PcType) -> Option<PointCode> {
    if data.remaining() < pc_type.octets() {
        return None;
    }
    let mut packed: u32 = 0;
    for i in 0..pc_type.octets() {
        packed |= (data.get_u8() as u32) << (8 * i);
    }
    Some(PointCode::unpack(pc_type, packed))
}

fn byte(data: &mut Bytes) -> Option<u8> {
    if data.has_remaining() {
        Some(data.get_u8())
    } else {
        None
    }
}

/// SNM handler attached to a router as the service indicator 0 user
pub struct Snm {
    router: Weak<super::Router>,
}

impl Snm {
    pub(crate) fn new(router: Weak<super::Router>) -> Self {
        Self { router }
    }
}

impl Mtp3User for Snm {
    fn receive_msu(&self, sio: Sio, label: &Label, payload: Bytes) -> bool {
        if sio.service() != si::SNM {
            return false;
        }
        let Some(router) = self.router.upgrade() else {
            return false;
        };
        let Some(msg) = SnmMsg::decode(label.pc_type, payload) else {
            warn!("undecodable SNM message");
            return false;
        };
        debug!(?msg, from = %label.opc, "SNM received");
        match msg {
            SnmMsg::Tfp { dest } => {
                router.apply_route_state(label.pc_type, dest, RouteState::Prohibited, Some(label.opc));
            }
            SnmMsg::Tfr { dest } => {
                router.apply_route_state(label.pc_type, dest, RouteState::Restricted, Some(label.opc));
            }
            SnmMsg::Tfa { dest } => {
                router.apply_route_state(label.pc_type, dest, RouteState::Allowed, Some(label.opc));
            }
            SnmMsg::Tfc { dest, .. } => {
                router.apply_route_state(label.pc_type, dest, RouteState::Congestion, Some(label.opc));
            }
            SnmMsg::Rst { dest } | SnmMsg::Rsr { dest } => {
                router.answer_route_test(dest, label);
            }
            SnmMsg::Tra => {
                router.adjacent_restarted(label.pc_type, label.opc);
            }
            SnmMsg::Upu { dest, part, cause } => {
                router.user_part_unavailable(label.pc_type, dest, part, cause);
            }
            SnmMsg::Coo { fsn } => {
                // Changeover order: take the link out of selection, confirm
                router.inhibit_by_slc(label, super::inhibit::INACTIVE, 0);
                router.send_snm(SnmMsg::Coa { fsn }, &label.inverted());
            }
            SnmMsg::Coa { .. } => {
                debug!("changeover acknowledged by peer");
            }
            SnmMsg::Eco => {
                router.inhibit_by_slc(label, super::inhibit::INACTIVE, 0);
                router.send_snm(SnmMsg::Eca, &label.inverted());
            }
            SnmMsg::Eca => {}
            SnmMsg::Cbd { code } => {
                // Changeback: the link is usable again
                router.inhibit_by_slc(label, 0, super::inhibit::INACTIVE);
                router.send_snm(SnmMsg::Cba { code }, &label.inverted());
            }
            SnmMsg::Cba { .. } => {
                router.inhibit_by_slc(label, 0, super::inhibit::INACTIVE);
            }
            SnmMsg::Lin => {
                router.inhibit_by_slc(label, super::inhibit::REMOTE, 0);
                router.send_snm(SnmMsg::Lia, &label.inverted());
            }
            SnmMsg::Lun => {
                router.inhibit_by_slc(label, 0, super::inhibit::REMOTE);
                router.send_snm(SnmMsg::Lua, &label.inverted());
            }
            SnmMsg::Lia => {
                router.inhibit_by_slc(label, super::inhibit::LOCAL, 0);
            }
            SnmMsg::Lua => {
                router.inhibit_by_slc(label, 0, super::inhibit::LOCAL);
            }
            SnmMsg::Lid => {
                debug!("link inhibit denied by peer");
            }
            SnmMsg::Lfu => {
                // Peer asks us to uninhibit our end
                router.inhibit_by_slc(label, 0, super::inhibit::LOCAL);
                router.send_snm(SnmMsg::Lun, &label.inverted());
            }
            SnmMsg::Llt => {
                // Local inhibit test: deny if we do not see the inhibit
                if !router.slc_inhibited(label, super::inhibit::REMOTE) {
                    router.send_snm(SnmMsg::Lfu, &label.inverted());
                }
            }
            SnmMsg::Lrt => {
                if !router.slc_inhibited(label, super::inhibit::LOCAL) {
                    router.send_snm(SnmMsg::Lun, &label.inverted());
                }
            }
        }
        true
    }

    fn route_status(&self, _pc_type: PcType, _destination: PointCode, _state: RouteState) {}
}

/// Build the UPU message a router emits for an unserved service indicator
pub fn upu_for(dest: PointCode, part: u8) -> SnmMsg {
    SnmMsg::Upu { dest, part, cause: upu_cause::UNEQUIPPED }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tfp_roundtrip() {
        let msg = SnmMsg::Tfp { dest: PointCode::new(2, 140, 1) };
        let enc = msg.encode(PcType::Itu);
        assert_eq!(enc.len(), 3);
        assert_eq!(enc[0], 0x14);
        assert_eq!(SnmMsg::decode(PcType::Itu, enc).unwrap(), msg);
    }

    #[test]
    fn upu_roundtrip_carries_part_and_cause() {
        let msg = SnmMsg::Upu { dest: PointCode::new(1, 2, 3), part: si::SCCP, cause: 1 };
        let enc = msg.encode(PcType::Ansi);
        assert_eq!(enc.len(), 1 + 3 + 1);
        assert_eq!(SnmMsg::decode(PcType::Ansi, enc).unwrap(), msg);
    }

    #[test]
    fn changeover_carries_fsn() {
        let msg = SnmMsg::Coo { fsn: 0x55 };
        let enc = msg.encode(PcType::Itu);
        assert_eq!(SnmMsg::decode(PcType::Itu, enc).unwrap(), msg);
    }

    #[test]
    fn truncated_messages_rejected() {
        assert!(SnmMsg::decode(PcType::Itu, Bytes::from_static(&[0x14, 0x01])).is_none());
        assert!(SnmMsg::decode(PcType::Itu, Bytes::new()).is_none());
    }

    #[test]
    fn inhibit_dialog_headings() {
        for (msg, heading) in [
            (SnmMsg::Lin, 0x16u8),
            (SnmMsg::Lun, 0x26),
            (SnmMsg::Lia, 0x36),
            (SnmMsg::Lua, 0x46),
            (SnmMsg::Tra, 0x17),
        ] {
            let enc = msg.encode(PcType::Itu);
            assert_eq!(enc[0], heading);
            assert_eq!(SnmMsg::decode(PcType::Itu, enc).unwrap(), msg);
        }
    }
}
