//! Netlink datagram parsing
//!
//! One `recv()` on a netlink socket can return several messages back to
//! back. This module walks them, decodes the conntrack ones and reports
//! kernel errors/ACKs and end-of-dump markers.
//!
//! ```text
//! [ Message 1 ] [ Message 2 ] ... [ NLMSG_DONE ]
//!  ↑ each message padded to a 4-byte boundary
//! ```

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::netlink::attr::ByteCursor;
use crate::netlink::conntrack::{ConntrackRecord, parse_conntrack_message};
use crate::netlink::structures::*;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that make a whole datagram unusable
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Invalid message length: {len} (minimum is {min})")]
    InvalidLength { len: usize, min: usize },

    #[error("Message length {len} exceeds buffer size (offset={offset}, buffer={buffer})")]
    ExceedsBuffer {
        len: usize,
        offset: usize,
        buffer: usize,
    },

    #[error("Error message too small: {len} bytes")]
    ErrorTooSmall { len: usize },
}

// ============================================================================
// MESSAGE TYPES
// ============================================================================

/// What a ctnetlink message announces, from the opcode in `nlmsg_type`
///
/// For multicast events the kernel reports both creation and updates as
/// `New`; `NLM_F_CREATE` in the flags tells them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConntrackEvent {
    New,
    Get,
    Delete,
    Other(u8),
}

impl ConntrackEvent {
    #[must_use]
    pub const fn from_opcode(opcode: u8) -> Self {
        match opcode {
            IPCTNL_MSG_CT_NEW => Self::New,
            IPCTNL_MSG_CT_GET => Self::Get,
            IPCTNL_MSG_CT_DELETE => Self::Delete,
            other => Self::Other(other),
        }
    }
}

/// One message out of a datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedMessage {
    /// Decoded ctnetlink message
    Conntrack {
        event: ConntrackEvent,
        record: ConntrackRecord,
    },

    /// End of multi-part message
    Done,

    /// `NLMSG_ERROR` payload as a positive errno; 0 is an ACK
    Error(i32),
}

// ============================================================================
// MESSAGE PARSING
// ============================================================================

/// Parse every message in a datagram
///
/// Stops after `NLMSG_DONE` or a non-zero errno. Messages of other
/// subsystems are skipped, and conntrack messages whose body cannot be
/// decoded are dropped.
///
/// # Errors
///
/// Returns `MessageError` when a header declares a length below 16 bytes
/// or past the end of `data`, or when an `NLMSG_ERROR` payload is cut short.
pub fn parse_netlink_messages(data: &[u8]) -> Result<Vec<ParsedMessage>, MessageError> {
    let mut messages = Vec::new();
    let mut cursor = ByteCursor::new(data);

    while let Some(nlh) = NlMsgHdr::parse(&mut cursor) {
        let offset = cursor.position() - NlMsgHdr::SIZE;
        let msg_len = nlh.nlmsg_len as usize;

        // Zero-length messages would loop forever; oversized ones read past the buffer
        if msg_len < NlMsgHdr::SIZE {
            return Err(MessageError::InvalidLength {
                len: msg_len,
                min: NlMsgHdr::SIZE,
            });
        }
        if offset + msg_len > data.len() {
            return Err(MessageError::ExceedsBuffer {
                len: msg_len,
                offset,
                buffer: data.len(),
            });
        }

        match nlh.nlmsg_type {
            NLMSG_DONE => {
                messages.push(ParsedMessage::Done);
                break;
            }

            NLMSG_ERROR => {
                let errno = parse_error_message(&data[offset..offset + msg_len])?;
                messages.push(ParsedMessage::Error(errno));
                if errno != 0 {
                    break;
                }
            }

            NLMSG_NOOP => {}

            NLMSG_OVERRUN => warn!("netlink reported a dropped message (NLMSG_OVERRUN)"),

            _ if nlh.subsystem() == NFNL_SUBSYS_CTNETLINK => {
                let mut body = cursor;
                match parse_conntrack_message(&nlh, &mut body) {
                    Some(record) => messages.push(ParsedMessage::Conntrack {
                        event: ConntrackEvent::from_opcode(nlh.opcode()),
                        record,
                    }),
                    None => debug!(
                        nlmsg_type = nlh.nlmsg_type,
                        nlmsg_len = nlh.nlmsg_len,
                        "dropping undecodable conntrack message"
                    ),
                }
            }

            other => warn!(nlmsg_type = other, "Unknown Netlink message type"),
        }

        cursor.set_position(offset + nlmsg_align(msg_len));
    }

    Ok(messages)
}

/// Parse an `NLMSG_ERROR` message (header included) into a positive errno
///
/// The kernel sends `-errno`; 0 means ACK.
///
/// # Errors
///
/// Returns `MessageError::ErrorTooSmall` if the 4-byte error code is missing.
pub fn parse_error_message(data: &[u8]) -> Result<i32, MessageError> {
    let raw = data
        .get(NlMsgHdr::SIZE..NlMsgHdr::SIZE + 4)
        .ok_or(MessageError::ErrorTooSmall { len: data.len() })?;
    let errno = i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]);
    Ok(errno.wrapping_neg())
}

// ============================================================================
// TESTS
// ============================================================================
