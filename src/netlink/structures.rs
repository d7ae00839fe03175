//! Binary structures for Netlink conntrack messages
//!
//! Netlink headers follow host byte order. The nfnetlink `res_id` field and
//! every conntrack attribute value (addresses, ports, status, timeout)
//! follow network byte order (big-endian).
//!
//! Headers are read and written field by field through [`ByteCursor`] and
//! `to_ne_bytes()` instead of pointer casts, so receive buffers never need
//! to be 4-byte aligned in memory.

use crate::netlink::attr::ByteCursor;
use serde::Serialize;

// NETLINK MESSAGE HEADER

/// Netlink message header (16 bytes)
///
/// `nlmsg_len` covers the whole message: this header, the family header
/// and every attribute including their alignment padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NlMsgHdr {
    pub nlmsg_len: u32,
    pub nlmsg_type: u16,
    pub nlmsg_flags: u16,
    pub nlmsg_seq: u32,
    pub nlmsg_pid: u32,
}

impl NlMsgHdr {
    /// Wire size of the header
    pub const SIZE: usize = 16;

    /// Read a header from the cursor, or `None` if fewer than 16 bytes remain
    ///
    /// The cursor is left untouched on failure.
    pub fn parse(cursor: &mut ByteCursor<'_>) -> Option<Self> {
        let raw = cursor.take(Self::SIZE)?;
        Some(Self {
            nlmsg_len: u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]),
            nlmsg_type: u16::from_ne_bytes([raw[4], raw[5]]),
            nlmsg_flags: u16::from_ne_bytes([raw[6], raw[7]]),
            nlmsg_seq: u32::from_ne_bytes([raw[8], raw[9], raw[10], raw[11]]),
            nlmsg_pid: u32::from_ne_bytes([raw[12], raw[13], raw[14], raw[15]]),
        })
    }

    /// Append the header to `buffer` in host byte order
    pub fn pack(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.nlmsg_len.to_ne_bytes());
        buffer.extend_from_slice(&self.nlmsg_type.to_ne_bytes());
        buffer.extend_from_slice(&self.nlmsg_flags.to_ne_bytes());
        buffer.extend_from_slice(&self.nlmsg_seq.to_ne_bytes());
        buffer.extend_from_slice(&self.nlmsg_pid.to_ne_bytes());
    }

    /// nfnetlink subsystem id (high byte of `nlmsg_type`)
    #[must_use]
    pub const fn subsystem(&self) -> u8 {
        (self.nlmsg_type >> 8) as u8
    }

    /// nfnetlink message opcode (low byte of `nlmsg_type`)
    #[must_use]
    pub const fn opcode(&self) -> u8 {
        (self.nlmsg_type & 0x00ff) as u8
    }
}

// NFNETLINK FAMILY HEADER

/// nfnetlink generic message header (4 bytes), `struct nfgenmsg`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NfGenMsg {
    /// Address family (AF_INET for everything this crate builds)
    pub nfgen_family: u8,
    /// Always NFNETLINK_V0
    pub version: u8,
    /// Resource id, big-endian on the wire (0 for conntrack)
    pub res_id: u16,
}

impl NfGenMsg {
    /// Wire size of the header
    pub const SIZE: usize = 4;

    #[must_use]
    pub const fn new(family: u8) -> Self {
        Self {
            nfgen_family: family,
            version: NFNETLINK_V0,
            res_id: 0,
        }
    }

    /// Read a family header, or `None` if fewer than 4 bytes remain
    pub fn parse(cursor: &mut ByteCursor<'_>) -> Option<Self> {
        let raw = cursor.take(Self::SIZE)?;
        Some(Self {
            nfgen_family: raw[0],
            version: raw[1],
            res_id: u16::from_be_bytes([raw[2], raw[3]]),
        })
    }

    pub fn pack(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.nfgen_family);
        buffer.push(self.version);
        buffer.extend_from_slice(&self.res_id.to_be_bytes());
    }
}

// CONSTANTS

// Netlink message types
pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;

// Netlink flags
pub const NLM_F_REQUEST: u16 = 1;
pub const NLM_F_MULTI: u16 = 2;
pub const NLM_F_ACK: u16 = 4;
pub const NLM_F_ECHO: u16 = 8;

// Modifiers to NEW requests
pub const NLM_F_REPLACE: u16 = 0x100;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;
pub const NLM_F_APPEND: u16 = 0x800;

// nfnetlink
pub const NFNETLINK_V0: u8 = 0;
pub const NFNL_SUBSYS_CTNETLINK: u8 = 1;

// ctnetlink message opcodes (low byte of nlmsg_type)
pub const IPCTNL_MSG_CT_NEW: u8 = 0;
pub const IPCTNL_MSG_CT_GET: u8 = 1;
pub const IPCTNL_MSG_CT_DELETE: u8 = 2;

// nfnetlink multicast groups
pub const NFNLGRP_CONNTRACK_NEW: u32 = 1;
pub const NFNLGRP_CONNTRACK_UPDATE: u32 = 2;
pub const NFNLGRP_CONNTRACK_DESTROY: u32 = 3;

// Address families
pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 10;

// Protocol numbers
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

// Conntrack status bits (enum ip_conntrack_status)
pub const IPS_EXPECTED: u32 = 1 << 0;
pub const IPS_SEEN_REPLY: u32 = 1 << 1;
pub const IPS_ASSURED: u32 = 1 << 2;
pub const IPS_CONFIRMED: u32 = 1 << 3;
pub const IPS_SRC_NAT: u32 = 1 << 4;
pub const IPS_DST_NAT: u32 = 1 << 5;
pub const IPS_SEQ_ADJUST: u32 = 1 << 6;
pub const IPS_SRC_NAT_DONE: u32 = 1 << 7;
pub const IPS_DST_NAT_DONE: u32 = 1 << 8;
pub const IPS_DYING: u32 = 1 << 9;
pub const IPS_FIXED_TIMEOUT: u32 = 1 << 10;
pub const IPS_TEMPLATE: u32 = 1 << 11;
pub const IPS_UNTRACKED: u32 = 1 << 12;
pub const IPS_HELPER: u32 = 1 << 13;
pub const IPS_OFFLOAD: u32 = 1 << 14;

// HELPER FUNCTIONS

/// Align length to 4-byte boundary
#[must_use]
pub const fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Build a ctnetlink `nlmsg_type` from a message opcode
#[must_use]
pub const fn ctnetlink_msg_type(opcode: u8) -> u16 {
    ((NFNL_SUBSYS_CTNETLINK as u16) << 8) | opcode as u16
}

/// Multicast group bitmask for `sockaddr_nl.nl_groups`
///
/// Groups outside 1-32 do not fit the legacy bind mask and yield 0.
#[must_use]
pub const fn nfnl_group_mask(group: u32) -> u32 {
    match group {
        1..=32 => 1 << (group - 1),
        _ => 0,
    }
}

// TESTS

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(std::mem::size_of::<NlMsgHdr>(), NlMsgHdr::SIZE);
        assert_eq!(std::mem::size_of::<NfGenMsg>(), NfGenMsg::SIZE);
    }

    #[test]
    fn test_alignment() {
        assert_eq!(nlmsg_align(0), 0);
        assert_eq!(nlmsg_align(1), 4);
        assert_eq!(nlmsg_align(3), 4);
        assert_eq!(nlmsg_align(4), 4);
        assert_eq!(nlmsg_align(5), 8);
        assert_eq!(nlmsg_align(73), 76);
    }

    #[test]
    fn test_header_pack_parse() {
        let nlh = NlMsgHdr {
            nlmsg_len: 80,
            nlmsg_type: ctnetlink_msg_type(IPCTNL_MSG_CT_NEW),
            nlmsg_flags: NLM_F_REQUEST | NLM_F_ACK | NLM_F_REPLACE,
            nlmsg_seq: 1,
            nlmsg_pid: 0,
        };

        let mut buffer = Vec::new();
        nlh.pack(&mut buffer);
        assert_eq!(buffer.len(), NlMsgHdr::SIZE);

        let mut cursor = ByteCursor::new(&buffer);
        assert_eq!(NlMsgHdr::parse(&mut cursor), Some(nlh));
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_header_too_short() {
        let buffer = [0u8; NlMsgHdr::SIZE - 1];
        let mut cursor = ByteCursor::new(&buffer);
        assert_eq!(NlMsgHdr::parse(&mut cursor), None);
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn test_nfgenmsg_res_id_is_big_endian() {
        let mut buffer = Vec::new();
        NfGenMsg {
            nfgen_family: AF_INET,
            version: NFNETLINK_V0,
            res_id: 0x0102,
        }
        .pack(&mut buffer);
        assert_eq!(buffer, vec![AF_INET, 0, 0x01, 0x02]);

        let mut cursor = ByteCursor::new(&buffer);
        let parsed = NfGenMsg::parse(&mut cursor).expect("4 bytes available");
        assert_eq!(parsed.res_id, 0x0102);
    }

    #[test]
    fn test_msg_type_split() {
        let nlh = NlMsgHdr {
            nlmsg_type: ctnetlink_msg_type(IPCTNL_MSG_CT_DELETE),
            ..NlMsgHdr::default()
        };
        assert_eq!(nlh.nlmsg_type, 0x0102);
        assert_eq!(nlh.subsystem(), NFNL_SUBSYS_CTNETLINK);
        assert_eq!(nlh.opcode(), IPCTNL_MSG_CT_DELETE);
    }

    #[test]
    fn test_group_mask() {
        assert_eq!(nfnl_group_mask(NFNLGRP_CONNTRACK_NEW), 0b001);
        assert_eq!(nfnl_group_mask(NFNLGRP_CONNTRACK_DESTROY), 0b100);
        assert_eq!(nfnl_group_mask(32), 1 << 31);
        assert_eq!(nfnl_group_mask(0), 0);
        assert_eq!(nfnl_group_mask(33), 0);
    }
}
