//! ctnetlink message construction and parsing
//!
//! This module builds conntrack timeout update requests and decodes
//! conntrack messages (kernel events or replies) into [`ConntrackRecord`].
//!
//! # Message Layout
//!
//! ```text
//! ┌─────────────────────────────┐
//! │ NlMsgHdr (16 bytes)         │  ← host byte order
//! ├─────────────────────────────┤
//! │ NfGenMsg (4 bytes)          │  ← family, version, res_id
//! ├─────────────────────────────┤
//! │ CTA_* attributes            │  ← 4-byte aligned TLVs, values big-endian
//! └─────────────────────────────┘
//! ```
//!
//! The tuple attributes nest two levels deep:
//!
//! ```text
//! CTA_TUPLE_ORIG / CTA_TUPLE_REPLY   (nested)
//! ├── CTA_TUPLE_IP                   (nested)
//! │   ├── CTA_IP_V4_SRC              4 bytes
//! │   └── CTA_IP_V4_DST              4 bytes
//! └── CTA_TUPLE_PROTO                (nested)
//!     ├── CTA_PROTO_NUM              1 byte
//!     ├── CTA_PROTO_SRC_PORT         2 bytes, big-endian
//!     └── CTA_PROTO_DST_PORT         2 bytes, big-endian
//! ```
//!
//! ## Decoding Policy
//!
//! Only structural truncation fails a decode: a family header that does not
//! fit, or a buffer shorter than the length the message header declares.
//! Every optional attribute is looked up independently, and a missing or
//! malformed one only resets its own field to the default.

use std::net::Ipv4Addr;

use serde::Serialize;
use tracing::{debug, trace};

use crate::netlink::attr::{
    ByteCursor, NlAttr, NlAttrBuilder, find_next_attr_of_type, make_nested_type,
};
use crate::netlink::structures::*;

// ============================================================================
// ATTRIBUTE TYPES
// ============================================================================
//
// Type codes are only unique within one nesting scope (CTA_TUPLE_IP and
// CTA_IP_V4_SRC are both 1), so every scope gets its own enum.

/// An attribute type code within one nesting scope
pub trait AttrKind: Copy {
    /// Code without flag bits
    fn code(self) -> u16;

    /// Whether the attribute carries child attributes
    fn is_nested(self) -> bool;

    /// Type field as it appears on the wire
    fn nla_type(self) -> u16 {
        if self.is_nested() {
            make_nested_type(self.code())
        } else {
            self.code()
        }
    }
}

/// Top-level conntrack attributes (`enum ctattr_type`)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtAttr {
    TupleOrig = 1,
    TupleReply = 2,
    Status = 3,
    Timeout = 7,
}

impl AttrKind for CtAttr {
    fn code(self) -> u16 {
        self as u16
    }

    fn is_nested(self) -> bool {
        matches!(self, Self::TupleOrig | Self::TupleReply)
    }
}

/// Attributes inside a tuple (`enum ctattr_tuple`)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtTupleAttr {
    Ip = 1,
    Proto = 2,
}

impl AttrKind for CtTupleAttr {
    fn code(self) -> u16 {
        self as u16
    }

    fn is_nested(self) -> bool {
        true
    }
}

/// Attributes inside `CTA_TUPLE_IP` (`enum ctattr_ip`)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtIpAttr {
    V4Src = 1,
    V4Dst = 2,
}

impl AttrKind for CtIpAttr {
    fn code(self) -> u16 {
        self as u16
    }

    fn is_nested(self) -> bool {
        false
    }
}

/// Attributes inside `CTA_TUPLE_PROTO` (`enum ctattr_l4proto`)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtProtoAttr {
    Num = 1,
    SrcPort = 2,
    DstPort = 3,
}

impl AttrKind for CtProtoAttr {
    fn code(self) -> u16 {
        self as u16
    }

    fn is_nested(self) -> bool {
        false
    }
}

/// Fixed prefix of every conntrack message: netlink header + nfgenmsg
pub const CONNTRACK_HDRLEN: usize = NlMsgHdr::SIZE + NfGenMsg::SIZE;

// ============================================================================
// DATA STRUCTURES
// ============================================================================

/// Address pair from `CTA_TUPLE_IP`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleIpv4 {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

/// One direction of a tracked flow
///
/// The L4 part of the tuple (`CTA_TUPLE_PROTO`) is on the wire but not decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tuple {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
}

impl From<TupleIpv4> for Tuple {
    fn from(ip: TupleIpv4) -> Self {
        Self {
            src_ip: ip.src,
            dst_ip: ip.dst,
        }
    }
}

/// A decoded conntrack message
///
/// `status` and `timeout_secs` are 0 both when the attribute is absent and
/// when the kernel sent 0. Messages originated in user space may carry no
/// status, and delete events carry no timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConntrackRecord {
    pub header: NlMsgHdr,
    pub family_header: NfGenMsg,
    /// Original direction tuple, `None` if absent or malformed
    pub tuple_orig: Option<Tuple>,
    /// Reply direction tuple, `None` if absent or malformed
    pub tuple_reply: Option<Tuple>,
    /// Bitmask of `IPS_*` flags
    pub status: u32,
    pub timeout_secs: u32,
}

impl ConntrackRecord {
    /// Whether every bit of `flags` is set in `status`
    #[must_use]
    pub const fn has_status(&self, flags: u32) -> bool {
        self.status & flags == flags
    }

    #[must_use]
    pub const fn is_assured(&self) -> bool {
        self.has_status(IPS_ASSURED)
    }

    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        self.has_status(IPS_CONFIRMED)
    }

    #[must_use]
    pub const fn is_dying(&self) -> bool {
        self.has_status(IPS_DYING)
    }
}

// ============================================================================
// MESSAGE CONSTRUCTION
// ============================================================================

/// Build an `IPCTNL_MSG_CT_NEW` request that replaces the timeout of an
/// existing IPv4 conntrack entry
///
/// # Message Structure
///
/// ```text
/// NlMsgHdr        type = CTNETLINK << 8 | CT_NEW
///                 flags = REQUEST | ACK | REPLACE, seq = 1
/// NfGenMsg        family = AF_INET
/// CTA_TUPLE_ORIG  { CTA_TUPLE_IP { src, dst }, CTA_TUPLE_PROTO { proto, sport, dport } }
/// CTA_TIMEOUT     timeout_secs, big-endian
/// ```
///
/// Inputs are written as given; no range checks are made.
///
/// # Example
///
/// ```
/// # use ctnetlink::netlink::conntrack::new_ipv4_timeout_update_request;
/// # use std::net::Ipv4Addr;
/// let request = new_ipv4_timeout_update_request(
///     6,
///     Ipv4Addr::new(192, 168, 80, 12),
///     62449,
///     Ipv4Addr::new(140, 112, 8, 116),
///     433,
///     120,
/// );
/// assert_eq!(request.len(), 80);
/// ```
#[must_use]
pub fn new_ipv4_timeout_update_request(
    proto: u8,
    src: Ipv4Addr,
    sport: u16,
    dst: Ipv4Addr,
    dport: u16,
    timeout_secs: u32,
) -> Vec<u8> {
    // === STEP 1: Build the attribute trees bottom-up ===
    let tuple_orig = NlAttrBuilder::nested(
        CtAttr::TupleOrig.code(),
        vec![
            NlAttrBuilder::nested(
                CtTupleAttr::Ip.code(),
                vec![
                    NlAttrBuilder::ipv4(CtIpAttr::V4Src.code(), src),
                    NlAttrBuilder::ipv4(CtIpAttr::V4Dst.code(), dst),
                ],
            ),
            NlAttrBuilder::nested(
                CtTupleAttr::Proto.code(),
                vec![
                    NlAttrBuilder::u8(CtProtoAttr::Num.code(), proto),
                    NlAttrBuilder::be16(CtProtoAttr::SrcPort.code(), sport),
                    NlAttrBuilder::be16(CtProtoAttr::DstPort.code(), dport),
                ],
            ),
        ],
    );
    let timeout = NlAttrBuilder::be32(CtAttr::Timeout.code(), timeout_secs);

    // === STEP 2: Size the message before writing the header ===
    let payload_len = tuple_orig.aligned_len() + timeout.aligned_len();
    let total_len = CONNTRACK_HDRLEN + payload_len;

    let nlh = NlMsgHdr {
        nlmsg_len: total_len as u32,
        nlmsg_type: ctnetlink_msg_type(IPCTNL_MSG_CT_NEW),
        nlmsg_flags: NLM_F_REQUEST | NLM_F_ACK | NLM_F_REPLACE,
        nlmsg_seq: 1,
        nlmsg_pid: 0,
    };

    // === STEP 3: Pack everything in wire order ===
    let mut buffer = Vec::with_capacity(total_len);
    nlh.pack(&mut buffer);
    NfGenMsg::new(AF_INET).pack(&mut buffer);
    tuple_orig.pack(&mut buffer);
    timeout.pack(&mut buffer);

    debug_assert_eq!(buffer.len(), total_len);
    buffer
}

// ============================================================================
// MESSAGE PARSING
// ============================================================================

/// Scan a copy of `base` for one attribute, leaving `base` untouched
fn find_from<'a>(base: ByteCursor<'a>, kind: impl AttrKind) -> Option<NlAttr<'a>> {
    let mut cursor = base;
    find_next_attr_of_type(kind.nla_type(), &mut cursor)
}

/// Parse a conntrack message whose netlink header has already been read
///
/// `cursor` must sit at the start of the `NfGenMsg`. It may hold more data
/// than this message (e.g. the next message of a datagram); attribute
/// lookups stay inside the length declared by `header`.
///
/// # Returns
///
/// * `Some(record)` - with absent or malformed optional fields defaulted
/// * `None` - the family header does not fit, or the buffer is shorter than
///   `header.nlmsg_len` declares
///
/// On success the cursor is left at the (aligned) end of this message.
pub fn parse_conntrack_message(
    header: &NlMsgHdr,
    cursor: &mut ByteCursor<'_>,
) -> Option<ConntrackRecord> {
    let Some(family_header) = NfGenMsg::parse(cursor) else {
        debug!(remaining = cursor.remaining(), "conntrack message too short for nfgenmsg");
        return None;
    };
    let base_offset = cursor.position();

    // === Truncation guard ===
    //
    // The declared body must be fully present before any attribute is
    // trusted. A declared length below the fixed headers means an empty body.
    let body_len = (header.nlmsg_len as usize).saturating_sub(CONNTRACK_HDRLEN);
    let additional_space = nlmsg_align(body_len);
    if cursor.remaining() < additional_space {
        debug!(
            need = additional_space,
            have = cursor.remaining(),
            "conntrack message truncated"
        );
        return None;
    }

    // Every lookup restarts from the beginning of the body
    let body = cursor.window(body_len);

    let status = find_from(body, CtAttr::Status)
        .and_then(|attr| attr.value_as_be32())
        .unwrap_or_else(|| {
            trace!("CTA_STATUS absent or malformed, using 0");
            0
        });

    let timeout_secs = find_from(body, CtAttr::Timeout)
        .and_then(|attr| attr.value_as_be32())
        .unwrap_or_else(|| {
            trace!("CTA_TIMEOUT absent or malformed, using 0");
            0
        });

    let tuple_orig =
        find_from(body, CtAttr::TupleOrig).and_then(|attr| parse_tuple(attr.nested()));
    let tuple_reply =
        find_from(body, CtAttr::TupleReply).and_then(|attr| parse_tuple(attr.nested()));

    cursor.set_position(base_offset + additional_space);

    Some(ConntrackRecord {
        header: *header,
        family_header,
        tuple_orig,
        tuple_reply,
        status,
        timeout_secs,
    })
}

/// Parse the value of `CTA_TUPLE_ORIG` / `CTA_TUPLE_REPLY`
///
/// Needs a well-formed `CTA_TUPLE_IP`; `CTA_TUPLE_PROTO` is skipped.
#[must_use]
pub fn parse_tuple(base: ByteCursor<'_>) -> Option<Tuple> {
    let ip = find_from(base, CtTupleAttr::Ip)?;
    parse_tuple_ipv4(ip.nested()).map(Tuple::from)
}

/// Parse the value of `CTA_TUPLE_IP`; both addresses must be present
#[must_use]
pub fn parse_tuple_ipv4(base: ByteCursor<'_>) -> Option<TupleIpv4> {
    let src = find_from(base, CtIpAttr::V4Src)?.value_as_ipv4()?;
    let dst = find_from(base, CtIpAttr::V4Dst)?.value_as_ipv4()?;
    Some(TupleIpv4 { src, dst })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(nla_type: u16, value: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        NlAttrBuilder::bytes(nla_type, value.to_vec()).pack(&mut data);
        data
    }

    fn message(attrs: &[Vec<u8>]) -> Vec<u8> {
        let payload: Vec<u8> = attrs.concat();
        let nlh = NlMsgHdr {
            nlmsg_len: (CONNTRACK_HDRLEN + payload.len()) as u32,
            nlmsg_type: ctnetlink_msg_type(IPCTNL_MSG_CT_NEW),
            nlmsg_flags: 0,
            nlmsg_seq: 0,
            nlmsg_pid: 0,
        };
        let mut data = Vec::new();
        nlh.pack(&mut data);
        NfGenMsg::new(AF_INET).pack(&mut data);
        data.extend(payload);
        data
    }

    fn decode(data: &[u8]) -> Option<ConntrackRecord> {
        let mut cursor = ByteCursor::new(data);
        let header = NlMsgHdr::parse(&mut cursor)?;
        parse_conntrack_message(&header, &mut cursor)
    }

    fn tuple_ip(src: Option<[u8; 4]>, dst: Option<[u8; 4]>) -> Vec<u8> {
        let mut children = Vec::new();
        if let Some(src) = src {
            children.extend(attr(CtIpAttr::V4Src.nla_type(), &src));
        }
        if let Some(dst) = dst {
            children.extend(attr(CtIpAttr::V4Dst.nla_type(), &dst));
        }
        attr(CtTupleAttr::Ip.nla_type(), &children)
    }

    #[test]
    fn test_attr_type_codes() {
        assert_eq!(CtAttr::TupleOrig.nla_type(), 0x8001);
        assert_eq!(CtAttr::TupleReply.nla_type(), 0x8002);
        assert_eq!(CtAttr::Status.nla_type(), 3);
        assert_eq!(CtAttr::Timeout.nla_type(), 7);
        assert_eq!(CtTupleAttr::Ip.nla_type(), 0x8001);
        assert_eq!(CtTupleAttr::Proto.nla_type(), 0x8002);
        assert_eq!(CtIpAttr::V4Src.nla_type(), 1);
        assert_eq!(CtIpAttr::V4Dst.nla_type(), 2);
        assert_eq!(CtProtoAttr::Num.nla_type(), 1);
        assert_eq!(CtProtoAttr::SrcPort.nla_type(), 2);
        assert_eq!(CtProtoAttr::DstPort.nla_type(), 3);
    }

    #[test]
    fn test_build_request_header() {
        let request = new_ipv4_timeout_update_request(
            IPPROTO_UDP,
            Ipv4Addr::new(10, 0, 0, 1),
            5353,
            Ipv4Addr::new(10, 0, 0, 2),
            53,
            30,
        );
        assert_eq!(request.len() % 4, 0);

        let mut cursor = ByteCursor::new(&request);
        let nlh = NlMsgHdr::parse(&mut cursor).expect("header");
        assert_eq!(nlh.nlmsg_len as usize, request.len());
        assert_eq!(nlh.nlmsg_type, 0x0100);
        assert_eq!(nlh.nlmsg_flags, NLM_F_REQUEST | NLM_F_ACK | NLM_F_REPLACE);
        assert_eq!(nlh.nlmsg_seq, 1);

        let nfgen = NfGenMsg::parse(&mut cursor).expect("family header");
        assert_eq!(nfgen, NfGenMsg::new(AF_INET));
    }

    #[test]
    fn test_decode_full_message() {
        let orig = attr(
            CtAttr::TupleOrig.nla_type(),
            &tuple_ip(Some([192, 168, 1, 2]), Some([8, 8, 8, 8])),
        );
        let reply = attr(
            CtAttr::TupleReply.nla_type(),
            &tuple_ip(Some([8, 8, 8, 8]), Some([100, 64, 0, 1])),
        );
        let data = message(&[
            orig,
            reply,
            attr(CtAttr::Status.nla_type(), &(IPS_ASSURED | IPS_CONFIRMED).to_be_bytes()),
            attr(CtAttr::Timeout.nla_type(), &432_000u32.to_be_bytes()),
        ]);

        let record = decode(&data).expect("well-formed message");
        assert_eq!(
            record.tuple_orig,
            Some(Tuple {
                src_ip: Ipv4Addr::new(192, 168, 1, 2),
                dst_ip: Ipv4Addr::new(8, 8, 8, 8),
            })
        );
        assert_eq!(
            record.tuple_reply,
            Some(Tuple {
                src_ip: Ipv4Addr::new(8, 8, 8, 8),
                dst_ip: Ipv4Addr::new(100, 64, 0, 1),
            })
        );
        assert!(record.is_assured());
        assert!(record.is_confirmed());
        assert!(!record.is_dying());
        assert_eq!(record.timeout_secs, 432_000);
        assert_eq!(record.family_header.nfgen_family, AF_INET);
    }

    #[test]
    fn test_decode_attribute_order_does_not_matter() {
        let data = message(&[
            attr(CtAttr::Timeout.nla_type(), &60u32.to_be_bytes()),
            attr(CtAttr::Status.nla_type(), &IPS_SEEN_REPLY.to_be_bytes()),
        ]);
        let record = decode(&data).expect("well-formed message");
        assert_eq!(record.status, IPS_SEEN_REPLY);
        assert_eq!(record.timeout_secs, 60);
    }

    #[test]
    fn test_decode_no_attributes() {
        let data = message(&[]);
        let record = decode(&data).expect("headers only is valid");
        assert_eq!(record.status, 0);
        assert_eq!(record.timeout_secs, 0);
        assert_eq!(record.tuple_orig, None);
        assert_eq!(record.tuple_reply, None);
    }

    #[test]
    fn test_decode_wrong_width_defaults_field() {
        let data = message(&[
            attr(CtAttr::Status.nla_type(), &[0, 1]),
            attr(CtAttr::Timeout.nla_type(), &90u32.to_be_bytes()),
        ]);
        let record = decode(&data).expect("well-formed message");
        assert_eq!(record.status, 0);
        assert_eq!(record.timeout_secs, 90);
    }

    #[test]
    fn test_decode_tuple_without_nested_flag_is_ignored() {
        let data = message(&[attr(
            CtAttr::TupleOrig.code(),
            &tuple_ip(Some([1, 1, 1, 1]), Some([2, 2, 2, 2])),
        )]);
        let record = decode(&data).expect("well-formed message");
        assert_eq!(record.tuple_orig, None);
    }

    #[test]
    fn test_tuple_missing_destination() {
        let data = message(&[attr(
            CtAttr::TupleOrig.nla_type(),
            &tuple_ip(Some([192, 168, 1, 2]), None),
        )]);
        let record = decode(&data).expect("tuple problems never fail the message");
        assert_eq!(record.tuple_orig, None);
    }

    #[test]
    fn test_tuple_missing_source() {
        let ip = tuple_ip(None, Some([192, 168, 1, 2]));
        assert_eq!(parse_tuple(ByteCursor::new(&ip)), None);
    }

    #[test]
    fn test_tuple_bad_address_length() {
        let mut children = attr(CtIpAttr::V4Src.nla_type(), &[10, 0, 0, 1]);
        children.extend(attr(CtIpAttr::V4Dst.nla_type(), &[0u8; 16]));
        let ip = attr(CtTupleAttr::Ip.nla_type(), &children);
        assert_eq!(parse_tuple(ByteCursor::new(&ip)), None);
    }

    #[test]
    fn test_tuple_destination_before_source() {
        let mut children = attr(CtIpAttr::V4Dst.nla_type(), &[10, 0, 0, 2]);
        children.extend(attr(CtIpAttr::V4Src.nla_type(), &[10, 0, 0, 1]));
        let tuple = parse_tuple_ipv4(ByteCursor::new(&children)).expect("both present");
        assert_eq!(tuple.src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(tuple.dst, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_decode_family_header_missing() {
        let mut data = Vec::new();
        NlMsgHdr {
            nlmsg_len: CONNTRACK_HDRLEN as u32,
            ..NlMsgHdr::default()
        }
        .pack(&mut data);
        data.extend_from_slice(&[AF_INET, 0]);
        assert_eq!(decode(&data), None);
    }

    #[test]
    fn test_decode_declared_length_below_headers() {
        let mut data = message(&[attr(CtAttr::Timeout.nla_type(), &60u32.to_be_bytes())]);
        data[..4].copy_from_slice(&(NlMsgHdr::SIZE as u32).to_ne_bytes());

        let mut cursor = ByteCursor::new(&data);
        let header = NlMsgHdr::parse(&mut cursor).expect("header");
        let record = parse_conntrack_message(&header, &mut cursor).expect("empty body is valid");
        assert_eq!(record.timeout_secs, 0, "attributes past the declared length are ignored");
        assert_eq!(record.status, 0);
        assert_eq!(record.tuple_orig, None);
        assert_eq!(record.tuple_reply, None);
        assert_eq!(cursor.position(), CONNTRACK_HDRLEN);
    }

    #[test]
    fn test_decode_truncated_body() {
        let data = message(&[attr(CtAttr::Timeout.nla_type(), &60u32.to_be_bytes())]);
        assert_eq!(decode(&data[..data.len() - 1]), None);
    }

    #[test]
    fn test_decode_ignores_following_message() {
        let first = message(&[]);
        let second = message(&[attr(CtAttr::Timeout.nla_type(), &60u32.to_be_bytes())]);
        let mut data = first.clone();
        data.extend(&second);

        let mut cursor = ByteCursor::new(&data);
        let header = NlMsgHdr::parse(&mut cursor).expect("header");
        let record = parse_conntrack_message(&header, &mut cursor).expect("first message");
        assert_eq!(record.timeout_secs, 0);
        assert_eq!(cursor.position(), first.len());
    }
}
